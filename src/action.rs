use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    MouseMove,
    LeftClick,
    RightClick,
    DoubleClick,
    Scroll,
    Type,
    Key,
    Hotkey,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::MouseMove,
        ActionKind::LeftClick,
        ActionKind::RightClick,
        ActionKind::DoubleClick,
        ActionKind::Scroll,
        ActionKind::Type,
        ActionKind::Key,
        ActionKind::Hotkey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::MouseMove => "mouse_move",
            ActionKind::LeftClick => "left_click",
            ActionKind::RightClick => "right_click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::Scroll => "scroll",
            ActionKind::Type => "type",
            ActionKind::Key => "key",
            ActionKind::Hotkey => "hotkey",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceAction {
    MouseMove { to: Point },
    LeftClick { at: Option<Point> },
    RightClick { at: Option<Point> },
    DoubleClick { at: Option<Point> },
    // positive scrolls up
    Scroll { amount: i64 },
    Type { text: String },
    Key { key: String },
    Hotkey { keys: Vec<String> },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionParseError {
    #[error("unknown operation: {0}")]
    Unknown(String),
    #[error("error: {action} is missing `{arg}`")]
    Missing { action: ActionKind, arg: &'static str },
}

impl DeviceAction {
    pub fn from_call(name: &str, args: &Map<String, Value>) -> Result<Self, ActionParseError> {
        let kind = ActionKind::from_name(name).ok_or_else(|| ActionParseError::Unknown(name.to_string()))?;
        let missing = |arg| ActionParseError::Missing { action: kind, arg };
        let action = match kind {
            ActionKind::MouseMove => DeviceAction::MouseMove {
                to: point(args).ok_or_else(|| missing("x/y"))?,
            },
            ActionKind::LeftClick => DeviceAction::LeftClick { at: point(args) },
            ActionKind::RightClick => DeviceAction::RightClick { at: point(args) },
            ActionKind::DoubleClick => DeviceAction::DoubleClick { at: point(args) },
            ActionKind::Scroll => DeviceAction::Scroll {
                amount: integer(args, "amount").unwrap_or(0),
            },
            ActionKind::Type => {
                let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                if text.is_empty() {
                    return Err(missing("text"));
                }
                DeviceAction::Type { text: text.to_string() }
            }
            ActionKind::Key => {
                let key = args.get("key_name").and_then(|v| v.as_str()).unwrap_or_default();
                if key.trim().is_empty() {
                    return Err(missing("key_name"));
                }
                DeviceAction::Key { key: normalize_key(key) }
            }
            ActionKind::Hotkey => {
                let keys: Vec<String> = match args.get("keys") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(|k| k.as_str())
                        .filter(|k| !k.trim().is_empty())
                        .map(normalize_key)
                        .collect(),
                    // "ctrl+c" style strings show up from some models
                    Some(Value::String(combo)) => combo
                        .split('+')
                        .filter(|k| !k.trim().is_empty())
                        .map(normalize_key)
                        .collect(),
                    _ => Vec::new(),
                };
                if keys.is_empty() {
                    return Err(missing("keys"));
                }
                DeviceAction::Hotkey { keys }
            }
        };
        Ok(action)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            DeviceAction::MouseMove { .. } => ActionKind::MouseMove,
            DeviceAction::LeftClick { .. } => ActionKind::LeftClick,
            DeviceAction::RightClick { .. } => ActionKind::RightClick,
            DeviceAction::DoubleClick { .. } => ActionKind::DoubleClick,
            DeviceAction::Scroll { .. } => ActionKind::Scroll,
            DeviceAction::Type { .. } => ActionKind::Type,
            DeviceAction::Key { .. } => ActionKind::Key,
            DeviceAction::Hotkey { .. } => ActionKind::Hotkey,
        }
    }

    pub fn target(&self) -> Option<Point> {
        match self {
            DeviceAction::MouseMove { to } => Some(*to),
            DeviceAction::LeftClick { at }
            | DeviceAction::RightClick { at }
            | DeviceAction::DoubleClick { at } => *at,
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        fn click(label: &str, at: &Option<Point>) -> String {
            match at {
                Some(p) => format!("{label} at {p}"),
                None => format!("{label} at the current pointer position"),
            }
        }
        match self {
            DeviceAction::MouseMove { to } => format!("moved pointer to {to}"),
            DeviceAction::LeftClick { at } => click("left-clicked", at),
            DeviceAction::RightClick { at } => click("right-clicked", at),
            DeviceAction::DoubleClick { at } => click("double-clicked", at),
            DeviceAction::Scroll { amount } => {
                let direction = if *amount > 0 { "up" } else { "down" };
                format!("scrolled {direction} {} units", amount.abs())
            }
            DeviceAction::Type { text } => format!("typed: {}", preview(text, 20)),
            DeviceAction::Key { key } => format!("pressed {key}"),
            DeviceAction::Hotkey { keys } => format!("pressed {}", keys.join("+")),
        }
    }
}

fn integer(args: &Map<String, Value>, key: &str) -> Option<i64> {
    let v = args.get(key)?;
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f.round() as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn point(args: &Map<String, Value>) -> Option<Point> {
    Some(Point { x: integer(args, "x")?, y: integer(args, "y")? })
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

pub fn normalize_key(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let canonical = match lower.as_str() {
        "return" => "enter",
        "esc" => "escape",
        "del" => "delete",
        "control" => "ctrl",
        "option" => "alt",
        "cmd" | "meta" | "super" => "command",
        "windows" => "win",
        "spacebar" => "space",
        "pgup" | "page_up" => "pageup",
        "pgdn" | "page_down" => "pagedown",
        "arrowup" => "up",
        "arrowdown" => "down",
        "arrowleft" => "left",
        "arrowright" => "right",
        other => other,
    };
    canonical.to_string()
}
