use super::{join_signalled, EventSink, HookBackend};
use crate::capture::{CaptureFilter, ForegroundContext, ForegroundProbe, Point, RawInput};
use crate::error::{HookInstallError, HookKind};
use chrono::Utc;
use crossbeam_channel::{bounded, Sender};
use std::cell::RefCell;
use std::thread;
use tracing::{debug, info, warn};
use windows::Win32::Foundation::{HMODULE, HWND, LPARAM, LRESULT, POINT, WPARAM};
use windows::Win32::Graphics::Gdi::ScreenToClient;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::Input::KeyboardAndMouse::GetAsyncKeyState;
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, DispatchMessageW, GetForegroundWindow, GetMessageW, GetWindowThreadProcessId, PeekMessageW,
    PostThreadMessageW, SetWindowsHookExW, TranslateMessage, UnhookWindowsHookEx, HHOOK, HOOKPROC, KBDLLHOOKSTRUCT,
    MSG, MSLLHOOKSTRUCT, PM_NOREMOVE, WH_KEYBOARD_LL, WH_MOUSE_LL, WINDOWS_HOOK_ID, WM_QUIT,
};

struct HookContext {
    filter: CaptureFilter,
    sink: EventSink,
}

// Low-level hook procedures run on the thread that installed them, so the
// capture state lives in that thread's storage for the life of the registration.
thread_local! {
    static HOOK_CONTEXT: RefCell<Option<HookContext>> = RefCell::new(None);
}

pub struct Win32Foreground;

impl ForegroundProbe for Win32Foreground {
    type Window = HWND;

    fn foreground(&self) -> Option<ForegroundContext<HWND>> {
        unsafe {
            let hwnd = GetForegroundWindow();
            if hwnd.0 == 0 {
                return None;
            }
            let mut pid: u32 = 0;
            GetWindowThreadProcessId(hwnd, Some(&mut pid));
            if pid == 0 {
                return None;
            }
            Some(ForegroundContext { window: hwnd, pid })
        }
    }

    fn screen_to_client(&self, window: HWND, point: Point) -> Option<Point> {
        let mut pt = POINT { x: point.x, y: point.y };
        let ok = unsafe { ScreenToClient(window, &mut pt) }.as_bool();
        ok.then(|| Point::new(pt.x, pt.y))
    }
}

fn capture(raw: RawInput) {
    HOOK_CONTEXT.with(|cell| {
        let Ok(mut slot) = cell.try_borrow_mut() else {
            return;
        };
        if let Some(ctx) = slot.as_mut() {
            if let Some(event) = ctx.filter.capture(&Win32Foreground, raw, Utc::now()) {
                ctx.sink.push(event);
            }
        }
    });
}

unsafe extern "system" fn keyboard_hook_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code >= 0 {
        let data = &*(lparam.0 as *const KBDLLHOOKSTRUCT);
        capture(RawInput::Keyboard {
            message: wparam.0 as u32,
            vk_code: data.vkCode,
        });
    }
    CallNextHookEx(HHOOK(0), code, wparam, lparam)
}

unsafe extern "system" fn mouse_hook_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code >= 0 {
        let data = &*(lparam.0 as *const MSLLHOOKSTRUCT);
        capture(RawInput::Mouse {
            message: wparam.0 as u32,
            point: Point::new(data.pt.x, data.pt.y),
            mouse_data: data.mouseData,
        });
    }
    CallNextHookEx(HHOOK(0), code, wparam, lparam)
}

fn os_error_code(err: &windows::core::Error) -> u32 {
    let hr = err.code().0 as u32;
    // HRESULT_FROM_WIN32 wraps the Win32 code in the low word.
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        hr & 0xFFFF
    } else {
        hr
    }
}

/// One registered hook; unregistered on drop.
struct HookHandle {
    hook: HHOOK,
    kind: HookKind,
}

impl HookHandle {
    fn install(kind: HookKind, id: WINDOWS_HOOK_ID, proc: HOOKPROC) -> Result<Self, HookInstallError> {
        unsafe {
            let module = GetModuleHandleW(None).unwrap_or(HMODULE::default());
            let hook = SetWindowsHookExW(id, proc, module, 0)
                .map_err(|err| HookInstallError::new(kind, os_error_code(&err)))?;
            if hook.0 == 0 {
                return Err(HookInstallError::new(kind, 0));
            }
            Ok(Self { hook, kind })
        }
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        if let Err(err) = unsafe { UnhookWindowsHookEx(self.hook) } {
            warn!(hook = %self.kind, "failed to remove hook: {err}");
        }
    }
}

struct InstalledHooks {
    _keyboard: HookHandle,
    _mouse: HookHandle,
}

fn install_hooks() -> Result<InstalledHooks, HookInstallError> {
    let keyboard = HookHandle::install(HookKind::Keyboard, WH_KEYBOARD_LL, Some(keyboard_hook_proc))?;
    // A mouse failure drops `keyboard`, which unregisters it.
    let mouse = HookHandle::install(HookKind::Mouse, WH_MOUSE_LL, Some(mouse_hook_proc))?;
    Ok(InstalledHooks {
        _keyboard: keyboard,
        _mouse: mouse,
    })
}

/// Virtual keys that are down right now.
fn keys_down() -> Vec<u32> {
    (1..256u32)
        .filter(|&vk| unsafe { GetAsyncKeyState(vk as i32) } as u16 & 0x8000 != 0)
        .collect()
}

fn run_hook_thread(mut filter: CaptureFilter, sink: EventSink, ready: Sender<Result<u32, HookInstallError>>) {
    let target_pid = filter.target_pid();
    filter.seed_held_keys(keys_down());
    let thread_id = unsafe { GetCurrentThreadId() };
    let mut msg = MSG::default();
    // Make sure this thread owns a message queue before anyone posts WM_QUIT to it.
    unsafe {
        let _ = PeekMessageW(&mut msg, HWND(0), 0, 0, PM_NOREMOVE);
    }

    HOOK_CONTEXT.with(|cell| *cell.borrow_mut() = Some(HookContext { filter, sink }));
    let hooks = match install_hooks() {
        Ok(hooks) => hooks,
        Err(err) => {
            HOOK_CONTEXT.with(|cell| cell.borrow_mut().take());
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(thread_id));
    info!(target_pid, thread_id, "low-level input hooks installed");

    unsafe {
        while GetMessageW(&mut msg, HWND(0), 0, 0).0 > 0 {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    drop(hooks);
    HOOK_CONTEXT.with(|cell| cell.borrow_mut().take());
    debug!(target_pid, "low-level input hooks removed");
}

/// The dedicated hook thread. Dropping it posts `WM_QUIT`, which ends the message
/// loop; the thread then unregisters both hooks and exits.
pub struct HookThread {
    thread_id: u32,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for HookThread {
    fn drop(&mut self) {
        let signalled = unsafe { PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0)) };
        if let Some(handle) = self.handle.take() {
            join_signalled(handle, signalled);
        }
    }
}

/// Hooks registered with `SetWindowsHookExW` on their own message-loop thread.
#[derive(Debug, Default)]
pub struct Win32Hooks;

impl HookBackend for Win32Hooks {
    type Registration = HookThread;

    fn install(&mut self, filter: CaptureFilter, sink: EventSink) -> Result<HookThread, HookInstallError> {
        let (ready_tx, ready_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("input-hooks".to_string())
            .spawn(move || run_hook_thread(filter, sink, ready_tx))
            .map_err(|err| HookInstallError::new(HookKind::Keyboard, err.raw_os_error().unwrap_or(0) as u32))?;

        match ready_rx.recv() {
            Ok(Ok(thread_id)) => Ok(HookThread {
                thread_id,
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(HookInstallError::new(HookKind::Keyboard, 0))
            }
        }
    }
}
