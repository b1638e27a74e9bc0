//! Per-message capture decision.
//!
//! Everything in here runs inside the low-level hook callback, so it must stay
//! allocation free and never block. The OS-facing parts (foreground lookup,
//! coordinate conversion) sit behind [`ForegroundProbe`] so the decision logic
//! is the same on every platform and can be driven from tests.

use crate::event::{InputEvent, MouseButton, WheelAxis};
use chrono::{DateTime, Utc};

pub const WM_KEYDOWN: u32 = 0x0100;
pub const WM_KEYUP: u32 = 0x0101;
pub const WM_SYSKEYDOWN: u32 = 0x0104;
pub const WM_SYSKEYUP: u32 = 0x0105;
pub const WM_MOUSEMOVE: u32 = 0x0200;
pub const WM_LBUTTONDOWN: u32 = 0x0201;
pub const WM_LBUTTONUP: u32 = 0x0202;
pub const WM_RBUTTONDOWN: u32 = 0x0204;
pub const WM_RBUTTONUP: u32 = 0x0205;
pub const WM_MBUTTONDOWN: u32 = 0x0207;
pub const WM_MBUTTONUP: u32 = 0x0208;
pub const WM_MOUSEWHEEL: u32 = 0x020A;
pub const WM_MOUSEHWHEEL: u32 = 0x020E;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Raw payload of a keyboard or mouse hook message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawInput {
    Keyboard { message: u32, vk_code: u32 },
    Mouse { message: u32, point: Point, mouse_data: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForegroundContext<W> {
    pub window: W,
    pub pid: u32,
}

pub trait ForegroundProbe {
    type Window: Copy;

    fn foreground(&self) -> Option<ForegroundContext<Self::Window>>;

    /// `None` when the conversion fails.
    fn screen_to_client(&self, window: Self::Window, point: Point) -> Option<Point>;
}

/// Signed wheel delta from the high word of `mouseData`.
pub fn wheel_delta(mouse_data: u32) -> i32 {
    ((mouse_data >> 16) & 0xffff) as u16 as i16 as i32
}

enum MouseAction {
    Button(MouseButton),
    Wheel(WheelAxis),
}

fn mouse_action(message: u32) -> Option<MouseAction> {
    match message {
        WM_LBUTTONDOWN => Some(MouseAction::Button(MouseButton::Left)),
        WM_RBUTTONDOWN => Some(MouseAction::Button(MouseButton::Right)),
        WM_MBUTTONDOWN => Some(MouseAction::Button(MouseButton::Middle)),
        WM_MOUSEWHEEL => Some(MouseAction::Wheel(WheelAxis::Vertical)),
        WM_MOUSEHWHEEL => Some(MouseAction::Wheel(WheelAxis::Horizontal)),
        _ => None,
    }
}

/// Held virtual keys. Low-level keyboard hooks report auto-repeat as another
/// key-down, so a down for a key that is already held is a repeat.
#[derive(Clone, Debug, Default)]
pub struct HeldKeys {
    bits: [u64; 4],
}

impl HeldKeys {
    fn slot(vk: u32) -> Option<(usize, u64)> {
        let vk = vk as usize;
        if vk >= 256 {
            return None;
        }
        Some((vk / 64, 1u64 << (vk % 64)))
    }

    /// Marks `vk` held and reports whether this is a fresh press.
    pub fn press(&mut self, vk: u32) -> bool {
        match Self::slot(vk) {
            Some((word, mask)) => {
                let fresh = self.bits[word] & mask == 0;
                self.bits[word] |= mask;
                fresh
            }
            None => true,
        }
    }

    pub fn release(&mut self, vk: u32) {
        if let Some((word, mask)) = Self::slot(vk) {
            self.bits[word] &= !mask;
        }
    }

    pub fn is_held(&self, vk: u32) -> bool {
        Self::slot(vk).map(|(word, mask)| self.bits[word] & mask != 0).unwrap_or(false)
    }
}

/// Target/self pid pair plus the key-repeat state. Owned by the thread that
/// runs the hook callbacks.
#[derive(Debug)]
pub struct CaptureFilter {
    target_pid: u32,
    self_pid: u32,
    held: HeldKeys,
}

impl CaptureFilter {
    pub fn new(target_pid: u32) -> Self {
        Self::with_self_pid(target_pid, std::process::id())
    }

    pub fn with_self_pid(target_pid: u32, self_pid: u32) -> Self {
        Self {
            target_pid,
            self_pid,
            held: HeldKeys::default(),
        }
    }

    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }

    /// Marks keys that were already down before capture began, so their
    /// auto-repeat is not mistaken for a fresh press.
    pub fn seed_held_keys(&mut self, keys: impl IntoIterator<Item = u32>) {
        for vk in keys {
            self.held.press(vk);
        }
    }

    pub fn capture<P: ForegroundProbe>(&mut self, probe: &P, raw: RawInput, now: DateTime<Utc>) -> Option<InputEvent> {
        match raw {
            RawInput::Keyboard { message, vk_code } => {
                match message {
                    WM_KEYDOWN | WM_SYSKEYDOWN => {
                        if !self.held.press(vk_code) {
                            return None;
                        }
                    }
                    WM_KEYUP | WM_SYSKEYUP => {
                        self.held.release(vk_code);
                        return None;
                    }
                    _ => return None,
                }
                let ctx = self.target_foreground(probe)?;
                Some(InputEvent::keyboard(now, ctx.pid, vk_code))
            }
            RawInput::Mouse {
                message,
                point,
                mouse_data,
            } => {
                let action = mouse_action(message)?;
                let ctx = self.target_foreground(probe)?;
                let client = probe.screen_to_client(ctx.window, point).unwrap_or(point);
                Some(match action {
                    MouseAction::Button(button) => InputEvent::button(now, ctx.pid, button, client.x, client.y),
                    MouseAction::Wheel(axis) => {
                        InputEvent::wheel(now, ctx.pid, axis, client.x, client.y, wheel_delta(mouse_data))
                    }
                })
            }
        }
    }

    fn target_foreground<P: ForegroundProbe>(&self, probe: &P) -> Option<ForegroundContext<P::Window>> {
        let ctx = probe.foreground()?;
        if ctx.pid == self.self_pid || ctx.pid != self.target_pid {
            return None;
        }
        Some(ctx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::Operation;
    use std::cell::Cell;

    /// Foreground that can be switched between calls; conversion subtracts a fixed origin.
    pub(crate) struct FakeForeground {
        pub current: Cell<Option<ForegroundContext<u32>>>,
        pub origin: Option<Point>,
        pub probes: Cell<usize>,
    }

    impl FakeForeground {
        pub(crate) fn owned_by(pid: u32) -> Self {
            Self {
                current: Cell::new(Some(ForegroundContext { window: 1, pid })),
                origin: Some(Point::new(380, 260)),
                probes: Cell::new(0),
            }
        }
    }

    impl ForegroundProbe for FakeForeground {
        type Window = u32;

        fn foreground(&self) -> Option<ForegroundContext<u32>> {
            self.probes.set(self.probes.get() + 1);
            self.current.get()
        }

        fn screen_to_client(&self, _window: u32, point: Point) -> Option<Point> {
            self.origin.map(|origin| Point::new(point.x - origin.x, point.y - origin.y))
        }
    }

    const TARGET: u32 = 4242;
    const SELF: u32 = 1000;

    fn filter() -> CaptureFilter {
        CaptureFilter::with_self_pid(TARGET, SELF)
    }

    fn key(message: u32, vk_code: u32) -> RawInput {
        RawInput::Keyboard { message, vk_code }
    }

    fn mouse(message: u32, x: i32, y: i32, mouse_data: u32) -> RawInput {
        RawInput::Mouse {
            message,
            point: Point::new(x, y),
            mouse_data,
        }
    }

    #[test]
    fn key_down_for_target_is_captured() {
        let probe = FakeForeground::owned_by(TARGET);
        let event = filter().capture(&probe, key(WM_KEYDOWN, 65), Utc::now()).unwrap();
        assert_eq!(event.operation(), Operation::Keyboard);
        assert_eq!(event.virtual_key(), Some(65));
        assert_eq!(event.target_pid, TARGET);
    }

    #[test]
    fn sys_key_down_is_captured() {
        let probe = FakeForeground::owned_by(TARGET);
        assert!(filter().capture(&probe, key(WM_SYSKEYDOWN, 0x12), Utc::now()).is_some());
    }

    #[test]
    fn non_down_messages_are_rejected_before_probing() {
        let probe = FakeForeground::owned_by(TARGET);
        let mut filter = filter();
        for raw in [
            key(WM_KEYUP, 65),
            key(WM_SYSKEYUP, 65),
            mouse(WM_MOUSEMOVE, 1, 1, 0),
            mouse(WM_LBUTTONUP, 1, 1, 0),
            mouse(WM_RBUTTONUP, 1, 1, 0),
            mouse(WM_MBUTTONUP, 1, 1, 0),
        ] {
            assert!(filter.capture(&probe, raw, Utc::now()).is_none(), "{raw:?}");
        }
        assert_eq!(probe.probes.get(), 0);
    }

    #[test]
    fn key_repeat_is_rejected_until_release() {
        let probe = FakeForeground::owned_by(TARGET);
        let mut filter = filter();
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 65), Utc::now()).is_some());
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 65), Utc::now()).is_none());
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 66), Utc::now()).is_some());
        filter.capture(&probe, key(WM_KEYUP, 65), Utc::now());
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 65), Utc::now()).is_some());
    }

    #[test]
    fn keys_held_before_capture_began_are_not_fresh_presses() {
        let probe = FakeForeground::owned_by(TARGET);
        let mut filter = filter();
        filter.seed_held_keys([0x10]);
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 0x10), Utc::now()).is_none());
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 0x10), Utc::now()).is_none());
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 0x11), Utc::now()).is_some());
        filter.capture(&probe, key(WM_KEYUP, 0x10), Utc::now());
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 0x10), Utc::now()).is_some());
    }

    #[test]
    fn release_in_another_window_still_clears_held_key() {
        let probe = FakeForeground::owned_by(TARGET);
        let mut filter = filter();
        filter.capture(&probe, key(WM_KEYDOWN, 65), Utc::now());
        probe.current.set(Some(ForegroundContext { window: 2, pid: 77 }));
        filter.capture(&probe, key(WM_KEYUP, 65), Utc::now());
        probe.current.set(Some(ForegroundContext { window: 1, pid: TARGET }));
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 65), Utc::now()).is_some());
    }

    #[test]
    fn other_process_and_missing_foreground_are_rejected() {
        let probe = FakeForeground::owned_by(77);
        assert!(filter().capture(&probe, key(WM_KEYDOWN, 65), Utc::now()).is_none());
        probe.current.set(None);
        assert!(filter().capture(&probe, mouse(WM_LBUTTONDOWN, 1, 1, 0), Utc::now()).is_none());
    }

    #[test]
    fn own_process_is_excluded_even_when_targeted() {
        let probe = FakeForeground::owned_by(SELF);
        let mut filter = CaptureFilter::with_self_pid(SELF, SELF);
        assert!(filter.capture(&probe, key(WM_KEYDOWN, 65), Utc::now()).is_none());
        assert!(filter.capture(&probe, mouse(WM_LBUTTONDOWN, 1, 1, 0), Utc::now()).is_none());
    }

    #[test]
    fn left_click_converts_to_client_coordinates() {
        let probe = FakeForeground::owned_by(TARGET);
        let event = filter().capture(&probe, mouse(WM_LBUTTONDOWN, 500, 300, 0), Utc::now()).unwrap();
        assert_eq!(event.operation(), Operation::MouseLeft);
        assert_eq!(event.position(), Some((120, 40)));
        assert_eq!(event.delta(), None);
    }

    #[test]
    fn failed_conversion_falls_back_to_screen_coordinates() {
        let mut probe = FakeForeground::owned_by(TARGET);
        probe.origin = None;
        let event = filter().capture(&probe, mouse(WM_RBUTTONDOWN, 500, 300, 0), Utc::now()).unwrap();
        assert_eq!(event.operation(), Operation::MouseRight);
        assert_eq!(event.position(), Some((500, 300)));
    }

    #[test]
    fn wheel_delta_comes_from_high_word() {
        let probe = FakeForeground::owned_by(TARGET);
        let up = filter().capture(&probe, mouse(WM_MOUSEWHEEL, 400, 300, 0x0078_0000), Utc::now()).unwrap();
        assert_eq!(up.operation(), Operation::WheelVertical);
        assert_eq!(up.delta(), Some(120));

        let left = filter().capture(&probe, mouse(WM_MOUSEHWHEEL, 400, 300, 0xFF88_0000), Utc::now()).unwrap();
        assert_eq!(left.operation(), Operation::WheelHorizontal);
        assert_eq!(left.delta(), Some(-120));
    }

    #[test]
    fn middle_button_maps_to_mouse_m() {
        let probe = FakeForeground::owned_by(TARGET);
        let event = filter().capture(&probe, mouse(WM_MBUTTONDOWN, 0, 0, 0), Utc::now()).unwrap();
        assert_eq!(event.operation(), Operation::MouseMiddle);
    }

    #[test]
    fn held_keys_ignore_out_of_range_codes() {
        let mut held = HeldKeys::default();
        assert!(held.press(300));
        assert!(held.press(300));
        assert!(!held.is_held(300));
        assert!(held.press(255));
        assert!(held.is_held(255));
        held.release(255);
        assert!(!held.is_held(255));
    }
}
