use crate::action::{DeviceAction, Point};
use crate::agent::{ActionError, ActionExecutor};
use crate::screen::{downscale, CaptureFrame, PixelSource};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SCROLL_STEP: f64 = 100.0;

const MOD_ALT: i64 = 1;
const MOD_CTRL: i64 = 2;
const MOD_META: i64 = 4;
const MOD_SHIFT: i64 = 8;

#[derive(Clone, Debug)]
pub struct BrowserDesktopConfig {
    pub headless: bool,
    pub width: u32,
    pub height: u32,
    // pixels from the top-left corner that abort an action
    pub fail_safe_margin: i64,
    pub start_url: String,
}

impl Default for BrowserDesktopConfig {
    fn default() -> Self {
        Self {
            headless: true,
            width: 1280,
            height: 800,
            fail_safe_margin: 2,
            start_url: "about:blank".to_string(),
        }
    }
}

/// A Chromium page standing in for the desktop: its viewport is the screen,
/// CDP input events are the mouse and keyboard.
pub struct BrowserDesktop {
    page: Page,
    _browser: OxideBrowser,
    handler: JoinHandle<()>,
    cfg: BrowserDesktopConfig,
    pointer: Mutex<Point>,
}

impl Drop for BrowserDesktop {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl BrowserDesktop {
    pub async fn launch(cfg: BrowserDesktopConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // fresh profile per launch, chromium locks profiles it has open
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("deskpilot-profile-{}-{}", std::process::id(), stamp));
        std::fs::create_dir_all(&profile_dir)
            .with_context(|| format!("creating profile dir {}", profile_dir.display()))?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.width, cfg.height)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await.context("launching chromium")?;
        let handler = tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        info!(headless = cfg.headless, width = cfg.width, height = cfg.height, "browser desktop launched");
        Self::open(browser, handler, cfg).await
    }

    pub async fn connect(ws_url: &str, cfg: BrowserDesktopConfig) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url)
            .await
            .with_context(|| format!("connecting to {ws_url}"))?;
        let handler = tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        info!(ws_url, "browser desktop attached");
        Self::open(browser, handler, cfg).await
    }

    async fn open(browser: OxideBrowser, handler: JoinHandle<()>, cfg: BrowserDesktopConfig) -> Result<Self> {
        let page = browser.new_page(cfg.start_url.as_str()).await.context("opening page")?;
        // screenshots fail on a zero-sized viewport
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(cfg.width as i64)
            .height(cfg.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        page.execute(metrics).await.context("setting viewport")?;
        let center = Point { x: cfg.width as i64 / 2, y: cfg.height as i64 / 2 };
        Ok(Self { page, _browser: browser, handler, cfg, pointer: Mutex::new(center) })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    fn pointer(&self) -> Point {
        *self.pointer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_fail_safe_corner(&self, p: Point) -> bool {
        p.x <= self.cfg.fail_safe_margin && p.y <= self.cfg.fail_safe_margin
    }

    async fn move_to(&self, p: Point) -> Result<()> {
        self.page.move_mouse(CdpPoint { x: p.x as f64, y: p.y as f64 }).await?;
        *self.pointer.lock().unwrap_or_else(PoisonError::into_inner) = p;
        Ok(())
    }

    async fn click(&self, at: Option<Point>, button: MouseButton, count: i64) -> Result<()> {
        let p = match at {
            Some(p) => {
                self.move_to(p).await?;
                p
            }
            None => self.pointer(),
        };
        let cmd = DispatchMouseEventParams::builder()
            .x(p.x as f64)
            .y(p.y as f64)
            .button(button)
            .click_count(count);
        let pressed = cmd.clone().r#type(DispatchMouseEventType::MousePressed).build().map_err(|e| anyhow!(e))?;
        let released = cmd.r#type(DispatchMouseEventType::MouseReleased).build().map_err(|e| anyhow!(e))?;
        self.page.execute(pressed).await?;
        self.page.execute(released).await?;
        Ok(())
    }

    async fn scroll(&self, amount: i64) -> Result<()> {
        let p = self.pointer();
        // positive amounts scroll up, CDP wheel deltas grow downwards
        let wheel = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(p.x as f64)
            .y(p.y as f64)
            .delta_x(0.0)
            .delta_y(-(amount as f64) * SCROLL_STEP)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(wheel).await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams { text: text.to_string() }).await?;
        Ok(())
    }

    async fn press(&self, keys: &[String]) -> Result<()> {
        let mut modifiers = 0;
        let mut plain = Vec::new();
        for key in keys {
            match modifier_bit(key) {
                Some(bit) => modifiers |= bit,
                None => plain.push(key.as_str()),
            }
        }
        // a lone modifier is pressed as a key of its own
        if plain.is_empty() {
            plain.extend(keys.iter().map(String::as_str));
            modifiers = 0;
        }
        for key in plain {
            let dom = dom_key(key).ok_or_else(|| anyhow!("unsupported key `{key}`"))?;
            self.dispatch_key(&dom, modifiers).await?;
        }
        Ok(())
    }

    async fn dispatch_key(&self, dom: &DomKey, modifiers: i64) -> Result<()> {
        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(dom.key.clone())
            .code(dom.code.clone())
            .windows_virtual_key_code(dom.key_code)
            .modifiers(modifiers);
        if let Some(text) = dom.text.as_ref().filter(|_| modifiers & !MOD_SHIFT == 0) {
            down = down.text(text.clone());
        }
        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(dom.key.clone())
            .code(dom.code.clone())
            .windows_virtual_key_code(dom.key_code)
            .modifiers(modifiers);
        self.page.execute(down.build().map_err(|e| anyhow!(e))?).await?;
        self.page.execute(up.build().map_err(|e| anyhow!(e))?).await?;
        Ok(())
    }

    async fn apply(&self, action: &DeviceAction) -> Result<()> {
        match action {
            DeviceAction::MouseMove { to } => self.move_to(*to).await,
            DeviceAction::LeftClick { at } => self.click(*at, MouseButton::Left, 1).await,
            DeviceAction::RightClick { at } => self.click(*at, MouseButton::Right, 1).await,
            DeviceAction::DoubleClick { at } => self.click(*at, MouseButton::Left, 2).await,
            DeviceAction::Scroll { amount } => self.scroll(*amount).await,
            DeviceAction::Type { text } => self.type_text(text).await,
            DeviceAction::Key { key } => self.press(std::slice::from_ref(key)).await,
            DeviceAction::Hotkey { keys } => self.press(keys).await,
        }
    }

    async fn screenshot(&self) -> Result<image::RgbImage> {
        let png = self
            .page
            .screenshot(ScreenshotParamsBuilder::default().build())
            .await
            .context("capturing screenshot")?;
        Ok(image::load_from_memory(&png).context("decoding screenshot")?.to_rgb8())
    }
}

#[async_trait]
impl PixelSource for BrowserDesktop {
    async fn capture(&self, monitor: usize, max_width: u32, max_height: u32) -> Option<CaptureFrame> {
        match self.screenshot().await {
            Ok(img) => Some(CaptureFrame::new(downscale(img, max_width, max_height))),
            Err(e) => {
                warn!(monitor, "screenshot failed: {:#}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for BrowserDesktop {
    async fn perform(&self, name: &str, args: &Map<String, Value>) -> Result<String, ActionError> {
        let action = match DeviceAction::from_call(name, args) {
            Ok(action) => action,
            Err(e) => return Ok(e.to_string()),
        };
        if let Some(target) = action.target().filter(|p| self.in_fail_safe_corner(*p)) {
            warn!(action = name, %target, "fail-safe corner hit, action aborted");
            return Ok(format!(
                "Fail-safe triggered: {name} targeted {target} in the top-left corner. Action aborted."
            ));
        }
        debug!(action = ?action, "performing");
        self.apply(&action)
            .await
            .map_err(|e| ActionError::new(name, format!("{e:#}")))?;
        Ok(action.describe())
    }
}

// ========================= Key Mapping =========================

struct DomKey {
    key: String,
    code: String,
    key_code: i64,
    text: Option<String>,
}

fn modifier_bit(key: &str) -> Option<i64> {
    match key {
        "ctrl" => Some(MOD_CTRL),
        "shift" => Some(MOD_SHIFT),
        "alt" => Some(MOD_ALT),
        "command" | "win" => Some(MOD_META),
        _ => None,
    }
}

fn dom_key(name: &str) -> Option<DomKey> {
    let named = |key: &str, code: &str, key_code: i64, text: Option<&str>| DomKey {
        key: key.to_string(),
        code: code.to_string(),
        key_code,
        text: text.map(str::to_string),
    };
    let dom = match name {
        "enter" => named("Enter", "Enter", 13, Some("\r")),
        "tab" => named("Tab", "Tab", 9, None),
        "escape" => named("Escape", "Escape", 27, None),
        "backspace" => named("Backspace", "Backspace", 8, None),
        "delete" => named("Delete", "Delete", 46, None),
        "space" => named(" ", "Space", 32, Some(" ")),
        "up" => named("ArrowUp", "ArrowUp", 38, None),
        "down" => named("ArrowDown", "ArrowDown", 40, None),
        "left" => named("ArrowLeft", "ArrowLeft", 37, None),
        "right" => named("ArrowRight", "ArrowRight", 39, None),
        "home" => named("Home", "Home", 36, None),
        "end" => named("End", "End", 35, None),
        "pageup" => named("PageUp", "PageUp", 33, None),
        "pagedown" => named("PageDown", "PageDown", 34, None),
        "ctrl" => named("Control", "ControlLeft", 17, None),
        "shift" => named("Shift", "ShiftLeft", 16, None),
        "alt" => named("Alt", "AltLeft", 18, None),
        "command" | "win" => named("Meta", "MetaLeft", 91, None),
        _ => {
            if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<i64>().ok()) {
                if (1..=12).contains(&n) {
                    return Some(named(&format!("F{n}"), &format!("F{n}"), 111 + n, None));
                }
            }
            let mut chars = name.chars();
            let (Some(c), None) = (chars.next(), chars.next()) else {
                return None;
            };
            let upper = c.to_ascii_uppercase();
            let code = if c.is_ascii_alphabetic() {
                format!("Key{upper}")
            } else if c.is_ascii_digit() {
                format!("Digit{c}")
            } else {
                String::new()
            };
            let key_code = if c.is_ascii_alphanumeric() { upper as i64 } else { 0 };
            named(&c.to_string(), &code, key_code, Some(&c.to_string()))
        }
    };
    Some(dom)
}
