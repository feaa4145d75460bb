use anyhow::{anyhow, bail, Context, Result};
use arboard::Clipboard;
use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use image::RgbaImage;
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use xcap::{Monitor, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.w)
    }

    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.h)
    }

    /// Edges are inclusive on all four sides.
    pub fn contains(&self, p: Point) -> bool {
        let (px, py) = (i64::from(p.x), i64::from(p.y));
        i64::from(self.x) <= px && px <= self.right() && i64::from(self.y) <= py && py <= self.bottom()
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = i64::from(self.x).max(i64::from(other.x));
        let y0 = i64::from(self.y).max(i64::from(other.y));
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect {
            x: x0 as i32,
            y: y0 as i32,
            w: (x1 - x0) as u32,
            h: (y1 - y0) as u32,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
    pub title: String,
    pub app_name: String,
    pub bounds: Rect,
    pub z: i32,
}

/// Keys that can drive paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageKey {
    Left,
    Right,
    Up,
    Down,
    PageUp,
    PageDown,
    Space,
}

impl PageKey {
    pub fn label(self) -> &'static str {
        match self {
            PageKey::Left => "left arrow",
            PageKey::Right => "right arrow",
            PageKey::Up => "up arrow",
            PageKey::Down => "down arrow",
            PageKey::PageUp => "page up",
            PageKey::PageDown => "page down",
            PageKey::Space => "space",
        }
    }

    fn enigo_key(self) -> Key {
        match self {
            PageKey::Left => Key::LeftArrow,
            PageKey::Right => Key::RightArrow,
            PageKey::Up => Key::UpArrow,
            PageKey::Down => Key::DownArrow,
            PageKey::PageUp => Key::PageUp,
            PageKey::PageDown => Key::PageDown,
            PageKey::Space => Key::Space,
        }
    }
}

/// Everything the capture loop needs from the desktop session.
///
/// `windows` must list windows topmost first; click-target resolution
/// relies on that order.
pub trait Desktop {
    fn press_key(&mut self, key: PageKey) -> Result<()>;
    fn click(&mut self, at: Point) -> Result<()>;
    fn focused_window(&mut self) -> Result<Option<WindowInfo>>;
    fn windows(&mut self) -> Result<Vec<WindowInfo>>;
    /// Capture via the OS "active window to clipboard" hotkey. `Ok(None)`
    /// when no image showed up before `timeout`.
    fn clipboard_capture(
        &mut self,
        window: &WindowInfo,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<RgbaImage>>;
    fn grab_region(&mut self, region: Rect) -> Result<RgbaImage>;
}

/// First titled window containing `at`, in the given (topmost-first) order.
pub fn window_at_point(windows: &[WindowInfo], at: Point) -> Option<&WindowInfo> {
    windows
        .iter()
        .find(|w| !w.title.trim().is_empty() && w.bounds.contains(at))
}

pub struct SystemDesktop {
    enigo: Enigo,
    clipboard: Option<Clipboard>,
}

impl SystemDesktop {
    pub fn new() -> Result<Self> {
        let enigo = Enigo::new(&Settings::default())
            .map_err(|err| anyhow!("failed to open input connection: {err}"))?;
        let clipboard = match Clipboard::new() {
            Ok(clipboard) => Some(clipboard),
            Err(err) => {
                warn!("clipboard unavailable, region grabs only: {err}");
                None
            }
        };
        Ok(Self { enigo, clipboard })
    }

    fn send_capture_hotkey(&mut self) -> Result<()> {
        let print = capture_hotkey_key()?;
        self.enigo
            .key(Key::Alt, Direction::Press)
            .map_err(|err| anyhow!("alt press failed: {err}"))?;
        let result = self.enigo.key(print, Direction::Click);
        self.enigo
            .key(Key::Alt, Direction::Release)
            .map_err(|err| anyhow!("alt release failed: {err}"))?;
        result.map_err(|err| anyhow!("print-screen press failed: {err}"))
    }
}

#[cfg(target_os = "windows")]
fn capture_hotkey_key() -> Result<Key> {
    // VK_SNAPSHOT
    Ok(Key::Other(0x2C))
}

#[cfg(all(unix, not(target_os = "macos")))]
fn capture_hotkey_key() -> Result<Key> {
    // XK_Print
    Ok(Key::Other(0xff61))
}

#[cfg(target_os = "macos")]
fn capture_hotkey_key() -> Result<Key> {
    bail!("active-window clipboard capture is not available on macOS")
}

impl Desktop for SystemDesktop {
    fn press_key(&mut self, key: PageKey) -> Result<()> {
        self.enigo
            .key(key.enigo_key(), Direction::Click)
            .map_err(|err| anyhow!("key press {} failed: {err}", key.label()))
    }

    fn click(&mut self, at: Point) -> Result<()> {
        self.enigo
            .move_mouse(at.x, at.y, Coordinate::Abs)
            .map_err(|err| anyhow!("mouse move to {at} failed: {err}"))?;
        self.enigo
            .button(Button::Left, Direction::Click)
            .map_err(|err| anyhow!("click at {at} failed: {err}"))
    }

    fn focused_window(&mut self) -> Result<Option<WindowInfo>> {
        let windows = Window::all().context("failed to enumerate windows")?;
        for window in windows {
            if window.is_focused().unwrap_or(false) {
                return Ok(describe_window(&window));
            }
        }
        Ok(None)
    }

    fn windows(&mut self) -> Result<Vec<WindowInfo>> {
        let mut out: Vec<WindowInfo> = Window::all()
            .context("failed to enumerate windows")?
            .iter()
            .filter(|w| !w.is_minimized().unwrap_or(false))
            .filter_map(describe_window)
            .collect();
        out.sort_by(|a, b| b.z.cmp(&a.z));
        Ok(out)
    }

    fn clipboard_capture(
        &mut self,
        window: &WindowInfo,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<RgbaImage>> {
        if self.clipboard.is_none() {
            return Ok(None);
        }
        if let Some(clipboard) = self.clipboard.as_mut() {
            // Stale images from an earlier page must not be mistaken for this one.
            if let Err(err) = clipboard.clear() {
                debug!("clipboard clear failed: {err}");
            }
        }
        self.send_capture_hotkey()?;

        let started = Instant::now();
        while started.elapsed() < timeout {
            if let Some(clipboard) = self.clipboard.as_mut() {
                if let Ok(data) = clipboard.get_image() {
                    if data.width > 0 && data.height > 0 {
                        let (w, h) = (data.width as u32, data.height as u32);
                        if !clipboard_fits_window(w, h, window) {
                            // Hotkey captured some other focused window.
                            debug!(
                                "clipboard image {w}x{h} differs from window {}x{}; grabbing region",
                                window.bounds.w, window.bounds.h
                            );
                            return Ok(None);
                        }
                        let image = RgbaImage::from_raw(w, h, data.bytes.into_owned())
                            .context("clipboard image buffer has unexpected length")?;
                        return Ok(Some(image));
                    }
                }
            }
            thread::sleep(poll);
        }
        Ok(None)
    }

    fn grab_region(&mut self, region: Rect) -> Result<RgbaImage> {
        let cx = region.x.saturating_add((region.w / 2) as i32);
        let cy = region.y.saturating_add((region.h / 2) as i32);
        let monitor = Monitor::from_point(cx, cy)
            .with_context(|| format!("no monitor at ({cx}, {cy})"))?;
        let screen = Rect {
            x: monitor.x().context("monitor x")?,
            y: monitor.y().context("monitor y")?,
            w: monitor.width().context("monitor width")?,
            h: monitor.height().context("monitor height")?,
        };
        let Some(visible) = region.intersect(&screen) else {
            bail!("window region {region:?} is off-screen");
        };
        let rel_x = (visible.x - screen.x) as u32;
        let rel_y = (visible.y - screen.y) as u32;
        monitor
            .capture_region(rel_x, rel_y, visible.w, visible.h)
            .with_context(|| format!("region capture failed for {visible:?}"))
    }
}

/// The active-window hotkey only counts when it captured the window we resolved.
fn clipboard_fits_window(width: u32, height: u32, window: &WindowInfo) -> bool {
    (width, height) == (window.bounds.w, window.bounds.h)
}

fn describe_window(window: &Window) -> Option<WindowInfo> {
    let bounds = Rect {
        x: window.x().ok()?,
        y: window.y().ok()?,
        w: window.width().ok()?,
        h: window.height().ok()?,
    };
    if bounds.w == 0 || bounds.h == 0 {
        return None;
    }
    Some(WindowInfo {
        title: window.title().unwrap_or_default(),
        app_name: window.app_name().unwrap_or_default(),
        bounds,
        z: window.z().unwrap_or(0),
    })
}
