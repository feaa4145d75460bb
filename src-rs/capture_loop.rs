use crate::desktop::{window_at_point, Desktop, PageKey, Point, WindowInfo};
use crate::similarity::{images_are_same, DEFAULT_SAME_THRESHOLD};
use anyhow::{Context, Result};
use image::RgbaImage;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How each iteration after the first advances the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PagingAction {
    Key { key: PageKey },
    Click { at: Point },
}

impl std::fmt::Display for PagingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PagingAction::Key { key } => write!(f, "key {}", key.label()),
            PagingAction::Click { at } => write!(f, "click at {at}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClipboardSettings {
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for ClipboardSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            poll: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub action: PagingAction,
    pub output_dir: PathBuf,
    pub max_iterations: u32,
    pub threshold: f64,
    /// `None` disables the clipboard path; only region grabs are used.
    pub clipboard: Option<ClipboardSettings>,
    pub settle_delay: Duration,
    pub same_cooldown: Duration,
    pub step_delay: Duration,
}

impl CaptureConfig {
    pub fn new(action: PagingAction, output_dir: PathBuf) -> Self {
        Self {
            action,
            output_dir,
            max_iterations: 10_000,
            threshold: DEFAULT_SAME_THRESHOLD,
            clipboard: Some(ClipboardSettings::default()),
            settle_delay: Duration::from_millis(100),
            same_cooldown: Duration::from_secs(5),
            step_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    New,
    Same,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DuplicateFrame,
    MaxIterations,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub saved: u32,
    pub last_iteration: u32,
    pub stop_reason: StopReason,
    pub output_dir: PathBuf,
    pub files: Vec<PathBuf>,
}

pub fn screenshot_file_name(iteration: u32) -> String {
    format!("screenshot_{iteration:04}.png")
}

/// Holds the one previous capture and performs single capture steps.
pub struct CaptureSession<'a, D: Desktop> {
    desktop: &'a mut D,
    config: &'a CaptureConfig,
    previous: Option<RgbaImage>,
    files: Vec<PathBuf>,
}

impl<'a, D: Desktop> CaptureSession<'a, D> {
    pub fn new(desktop: &'a mut D, config: &'a CaptureConfig) -> Self {
        Self {
            desktop,
            config,
            previous: None,
            files: Vec::new(),
        }
    }

    /// One iteration: page, locate, capture, compare, maybe save.
    ///
    /// Failures are logged and reported as `Error`; the previous capture is
    /// left untouched in that case.
    pub fn step(&mut self, iteration: u32) -> StepOutcome {
        println!("--- iteration {iteration} ---");
        match self.try_step(iteration) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("iteration {iteration} failed: {err:#}");
                StepOutcome::Error
            }
        }
    }

    fn try_step(&mut self, iteration: u32) -> Result<StepOutcome> {
        let window = self.advance_and_locate(iteration)?;
        debug!(
            "iteration {iteration}: window {:?} at {:?}",
            window.title, window.bounds
        );
        let image = self.capture(&window)?;

        if let Some(prev) = &self.previous {
            if images_are_same(&image, prev, self.config.threshold) {
                self.previous = Some(image);
                return Ok(StepOutcome::Same);
            }
        }

        let path = self.persist(iteration, &image)?;
        println!("saved {}", path.display());
        self.files.push(path);
        self.previous = Some(image);
        Ok(StepOutcome::New)
    }

    fn advance_and_locate(&mut self, iteration: u32) -> Result<WindowInfo> {
        if iteration == 1 {
            debug!("first iteration: capturing the active window without paging");
            return self
                .desktop
                .focused_window()?
                .context("no focused window");
        }

        match self.config.action {
            PagingAction::Key { key } => {
                self.desktop.press_key(key)?;
                thread::sleep(self.config.settle_delay);
                self.desktop
                    .focused_window()?
                    .context("no focused window after key press")
            }
            PagingAction::Click { at } => {
                self.desktop.click(at)?;
                thread::sleep(self.config.settle_delay);
                let windows = self.desktop.windows()?;
                window_at_point(&windows, at)
                    .cloned()
                    .with_context(|| format!("no titled window at {at}"))
            }
        }
    }

    fn capture(&mut self, window: &WindowInfo) -> Result<RgbaImage> {
        if let Some(clip) = self.config.clipboard {
            match self
                .desktop
                .clipboard_capture(window, clip.timeout, clip.poll)
            {
                Ok(Some(image)) => return Ok(image),
                Ok(None) => debug!("no clipboard image within {:?}", clip.timeout),
                Err(err) => debug!("clipboard capture failed: {err:#}"),
            }
        }
        self.desktop.grab_region(window.bounds)
    }

    fn persist(&self, iteration: u32, image: &RgbaImage) -> Result<PathBuf> {
        let dir = &self.config.output_dir;
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output dir: {}", dir.display()))?;
        let path = dir.join(screenshot_file_name(iteration));
        image
            .save(&path)
            .with_context(|| format!("failed to save capture: {}", path.display()))?;
        Ok(path)
    }
}

/// Drive iterations until the frame stops changing or `max_iterations` runs out.
pub fn run_capture<D: Desktop>(desktop: &mut D, config: &CaptureConfig) -> RunSummary {
    let mut session = CaptureSession::new(desktop, config);
    let mut saved = 0u32;
    let mut last_iteration = 0u32;
    let mut stop_reason = StopReason::MaxIterations;

    for iteration in 1..=config.max_iterations {
        last_iteration = iteration;
        match session.step(iteration) {
            StepOutcome::New => saved += 1,
            StepOutcome::Error => {}
            StepOutcome::Same => {
                println!(
                    "same frame detected; retrying in {}s",
                    config.same_cooldown.as_secs_f32()
                );
                thread::sleep(config.same_cooldown);
                match session.step(iteration) {
                    StepOutcome::Same => {
                        println!("frame unchanged after retry; stopping");
                        stop_reason = StopReason::DuplicateFrame;
                        break;
                    }
                    StepOutcome::New => saved += 1,
                    StepOutcome::Error => {}
                }
            }
        }
        thread::sleep(config.step_delay);
    }

    info!("capture finished: {saved} saved, stopped by {stop_reason:?}");
    RunSummary {
        saved,
        last_iteration,
        stop_reason,
        output_dir: config.output_dir.clone(),
        files: session.files,
    }
}

/// `base/name`, or the first free `base/name_<n>` when that directory
/// already holds files, so earlier runs are never overwritten.
pub fn fresh_output_dir(base: &Path, name: &str) -> PathBuf {
    let candidate = base.join(name);
    if !dir_has_entries(&candidate) {
        return candidate;
    }
    let mut counter = 1u32;
    loop {
        let next = base.join(format!("{name}_{counter}"));
        if !next.exists() {
            return next;
        }
        counter += 1;
    }
}

fn dir_has_entries(path: &Path) -> bool {
    if path.is_file() {
        return true;
    }
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desktop::Rect;
    use anyhow::bail;
    use image::Rgba;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    enum Frame {
        Image(RgbaImage),
        Fail,
    }

    #[derive(Default)]
    struct ScriptedDesktop {
        frames: VecDeque<Frame>,
        windows: Vec<WindowInfo>,
        keys: Vec<PageKey>,
        clicks: Vec<Point>,
        captures: usize,
        clipboard_hits: bool,
    }

    fn reader_window() -> WindowInfo {
        WindowInfo {
            title: "Reader".to_string(),
            app_name: "reader".to_string(),
            bounds: Rect {
                x: 0,
                y: 0,
                w: 8,
                h: 8,
            },
            z: 1,
        }
    }

    impl ScriptedDesktop {
        fn with_frames(frames: Vec<Frame>) -> Self {
            Self {
                frames: frames.into(),
                windows: vec![reader_window()],
                ..Default::default()
            }
        }

        fn next_frame(&mut self) -> Result<RgbaImage> {
            self.captures += 1;
            match self.frames.pop_front() {
                Some(Frame::Image(img)) => Ok(img),
                Some(Frame::Fail) => bail!("scripted capture failure"),
                None => bail!("script exhausted"),
            }
        }
    }

    impl Desktop for ScriptedDesktop {
        fn press_key(&mut self, key: PageKey) -> Result<()> {
            self.keys.push(key);
            Ok(())
        }

        fn click(&mut self, at: Point) -> Result<()> {
            self.clicks.push(at);
            Ok(())
        }

        fn focused_window(&mut self) -> Result<Option<WindowInfo>> {
            Ok(self.windows.first().cloned())
        }

        fn windows(&mut self) -> Result<Vec<WindowInfo>> {
            Ok(self.windows.clone())
        }

        fn clipboard_capture(
            &mut self,
            _window: &WindowInfo,
            _timeout: Duration,
            _poll: Duration,
        ) -> Result<Option<RgbaImage>> {
            if self.clipboard_hits {
                self.next_frame().map(Some)
            } else {
                Ok(None)
            }
        }

        fn grab_region(&mut self, _region: Rect) -> Result<RgbaImage> {
            self.next_frame()
        }
    }

    fn page(v: u8) -> Frame {
        Frame::Image(RgbaImage::from_pixel(8, 8, Rgba([v, v, v, 255])))
    }

    fn fast_config(action: PagingAction, dir: &Path, max: u32) -> CaptureConfig {
        CaptureConfig {
            max_iterations: max,
            settle_delay: Duration::ZERO,
            same_cooldown: Duration::ZERO,
            step_delay: Duration::ZERO,
            ..CaptureConfig::new(action, dir.to_path_buf())
        }
    }

    fn right_key() -> PagingAction {
        PagingAction::Key {
            key: PageKey::Right,
        }
    }

    #[test]
    fn stops_after_confirmed_duplicate() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("book");
        let mut desktop = ScriptedDesktop::with_frames(vec![
            page(1),
            page(2),
            page(3),
            page(3),
            page(3),
            page(4),
        ]);
        let config = fast_config(right_key(), &out, 100);

        let summary = run_capture(&mut desktop, &config);

        assert_eq!(summary.saved, 3);
        assert_eq!(summary.last_iteration, 4);
        assert_eq!(summary.stop_reason, StopReason::DuplicateFrame);
        assert_eq!(desktop.captures, 5);

        let mut names: Vec<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "screenshot_0001.png",
                "screenshot_0002.png",
                "screenshot_0003.png"
            ]
        );
    }

    #[test]
    fn first_iteration_does_not_page() {
        let dir = tempdir().unwrap();
        let mut desktop = ScriptedDesktop::with_frames(vec![page(1), page(2), page(3)]);
        let config = fast_config(right_key(), dir.path(), 3);

        let summary = run_capture(&mut desktop, &config);

        assert_eq!(summary.saved, 3);
        assert_eq!(summary.stop_reason, StopReason::MaxIterations);
        assert_eq!(desktop.keys, vec![PageKey::Right, PageKey::Right]);
    }

    #[test]
    fn retry_that_changes_continues_the_run() {
        let dir = tempdir().unwrap();
        let mut desktop =
            ScriptedDesktop::with_frames(vec![page(1), page(1), page(2), page(3)]);
        let config = fast_config(right_key(), dir.path(), 3);

        let summary = run_capture(&mut desktop, &config);

        assert_eq!(summary.saved, 3);
        assert_eq!(summary.stop_reason, StopReason::MaxIterations);
        // The retried iteration saves under its own index.
        assert!(dir.path().join("screenshot_0002.png").exists());
        assert!(dir.path().join("screenshot_0003.png").exists());
        // Iteration 2 paged twice: once originally, once on retry.
        assert_eq!(desktop.keys.len(), 3);
    }

    #[test]
    fn failed_retry_after_same_frame_keeps_going() {
        let dir = tempdir().unwrap();
        let mut desktop =
            ScriptedDesktop::with_frames(vec![page(1), page(1), Frame::Fail, page(2)]);
        let config = fast_config(right_key(), dir.path(), 3);

        let summary = run_capture(&mut desktop, &config);

        assert_eq!(summary.saved, 2);
        assert_eq!(summary.last_iteration, 3);
        assert_eq!(summary.stop_reason, StopReason::MaxIterations);
        assert_eq!(desktop.captures, 4);
        assert!(!dir.path().join("screenshot_0002.png").exists());
        assert!(dir.path().join("screenshot_0003.png").exists());
    }

    #[test]
    fn all_errors_run_to_max_without_saving() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("never");
        let frames = (0..5).map(|_| Frame::Fail).collect();
        let mut desktop = ScriptedDesktop::with_frames(frames);
        let config = fast_config(right_key(), &out, 5);

        let summary = run_capture(&mut desktop, &config);

        assert_eq!(summary.saved, 0);
        assert_eq!(summary.last_iteration, 5);
        assert_eq!(summary.stop_reason, StopReason::MaxIterations);
        assert!(!out.exists());
    }

    #[test]
    fn error_keeps_previous_frame() {
        let dir = tempdir().unwrap();
        let mut desktop = ScriptedDesktop::with_frames(vec![
            page(1),
            Frame::Fail,
            page(1),
            page(1),
        ]);
        let config = fast_config(right_key(), dir.path(), 10);

        let summary = run_capture(&mut desktop, &config);

        assert_eq!(summary.saved, 1);
        assert_eq!(summary.stop_reason, StopReason::DuplicateFrame);
        assert_eq!(summary.last_iteration, 3);
    }

    #[test]
    fn click_paging_targets_window_under_point() {
        let dir = tempdir().unwrap();
        let mut desktop = ScriptedDesktop::with_frames(vec![page(1), page(2)]);
        desktop.windows = vec![WindowInfo {
            title: "Reader".to_string(),
            app_name: "reader".to_string(),
            bounds: Rect {
                x: 100,
                y: 100,
                w: 200,
                h: 200,
            },
            z: 3,
        }];
        let at = Point { x: 150, y: 150 };
        let config = fast_config(PagingAction::Click { at }, dir.path(), 2);

        let summary = run_capture(&mut desktop, &config);

        assert_eq!(summary.saved, 2);
        assert_eq!(desktop.clicks, vec![at]);
    }

    #[test]
    fn click_outside_any_window_is_an_error_step() {
        let dir = tempdir().unwrap();
        let mut desktop = ScriptedDesktop::with_frames(vec![page(1), page(2)]);
        let at = Point { x: 5000, y: 5000 };
        let config = fast_config(PagingAction::Click { at }, dir.path(), 3);

        let summary = run_capture(&mut desktop, &config);

        // Only iteration 1 (focused window) captures anything.
        assert_eq!(summary.saved, 1);
        assert_eq!(desktop.captures, 1);
        assert_eq!(summary.stop_reason, StopReason::MaxIterations);
    }

    #[test]
    fn clipboard_image_is_preferred_when_present() {
        let dir = tempdir().unwrap();
        let mut desktop = ScriptedDesktop::with_frames(vec![page(1)]);
        desktop.clipboard_hits = true;
        let config = fast_config(right_key(), dir.path(), 1);

        let summary = run_capture(&mut desktop, &config);
        assert_eq!(summary.saved, 1);
        assert_eq!(summary.files, vec![dir.path().join("screenshot_0001.png")]);
    }

    #[test]
    fn fresh_output_dir_avoids_non_empty_folder() {
        let dir = tempdir().unwrap();
        assert_eq!(fresh_output_dir(dir.path(), "book"), dir.path().join("book"));

        fs::create_dir_all(dir.path().join("book")).unwrap();
        assert_eq!(fresh_output_dir(dir.path(), "book"), dir.path().join("book"));

        fs::write(dir.path().join("book").join("screenshot_0001.png"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("book_1")).unwrap();
        assert_eq!(
            fresh_output_dir(dir.path(), "book"),
            dir.path().join("book_2")
        );
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(screenshot_file_name(7), "screenshot_0007.png");
        assert_eq!(screenshot_file_name(12345), "screenshot_12345.png");
    }
}
