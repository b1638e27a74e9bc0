use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WheelAxis {
    Vertical,
    Horizontal,
}

/// What was pressed. Each variant only carries the fields that make sense for it,
/// so a keyboard event can never hold coordinates and a mouse event never a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputKind {
    Keyboard { virtual_key: u32 },
    Button { button: MouseButton, x: i32, y: i32 },
    Wheel { axis: WheelAxis, x: i32, y: i32, delta: i32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Keyboard,
    MouseLeft,
    MouseRight,
    MouseMiddle,
    WheelVertical,
    WheelHorizontal,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Keyboard => "keyboard",
            Operation::MouseLeft => "mouse_l",
            Operation::MouseRight => "mouse_r",
            Operation::MouseMiddle => "mouse_m",
            Operation::WheelVertical => "wheel_v",
            Operation::WheelHorizontal => "wheel_h",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured down transition for the target process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct InputEvent {
    pub timestamp: DateTime<Utc>,
    pub target_pid: u32,
    #[serde(flatten)]
    pub kind: InputKind,
}

impl InputEvent {
    pub fn keyboard(timestamp: DateTime<Utc>, target_pid: u32, virtual_key: u32) -> Self {
        Self {
            timestamp,
            target_pid,
            kind: InputKind::Keyboard { virtual_key },
        }
    }

    pub fn button(timestamp: DateTime<Utc>, target_pid: u32, button: MouseButton, x: i32, y: i32) -> Self {
        Self {
            timestamp,
            target_pid,
            kind: InputKind::Button { button, x, y },
        }
    }

    pub fn wheel(timestamp: DateTime<Utc>, target_pid: u32, axis: WheelAxis, x: i32, y: i32, delta: i32) -> Self {
        Self {
            timestamp,
            target_pid,
            kind: InputKind::Wheel { axis, x, y, delta },
        }
    }

    pub fn operation(&self) -> Operation {
        match self.kind {
            InputKind::Keyboard { .. } => Operation::Keyboard,
            InputKind::Button { button: MouseButton::Left, .. } => Operation::MouseLeft,
            InputKind::Button { button: MouseButton::Right, .. } => Operation::MouseRight,
            InputKind::Button { button: MouseButton::Middle, .. } => Operation::MouseMiddle,
            InputKind::Wheel { axis: WheelAxis::Vertical, .. } => Operation::WheelVertical,
            InputKind::Wheel { axis: WheelAxis::Horizontal, .. } => Operation::WheelHorizontal,
        }
    }

    pub fn position(&self) -> Option<(i32, i32)> {
        match self.kind {
            InputKind::Keyboard { .. } => None,
            InputKind::Button { x, y, .. } | InputKind::Wheel { x, y, .. } => Some((x, y)),
        }
    }

    pub fn delta(&self) -> Option<i32> {
        match self.kind {
            InputKind::Wheel { delta, .. } => Some(delta),
            _ => None,
        }
    }

    pub fn virtual_key(&self) -> Option<u32> {
        match self.kind {
            InputKind::Keyboard { virtual_key } => Some(virtual_key),
            _ => None,
        }
    }
}
