//! Live pointer readout for picking `--click` coordinates.
//!
//! A background thread turns global key presses into [`TrackerEvent`]s on a
//! channel; the foreground loop polls the pointer and consumes them.

use crate::desktop::Point;
use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use enigo::{Enigo, Mouse, Settings};
use rdev::{EventType, Key};
use std::io::{self, Write};
use std::ops::ControlFlow;
use std::thread;
use std::time::Duration;
use tracing::warn;

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Record,
    Quit,
}

#[derive(Debug, Default)]
pub struct Tracker {
    positions: Vec<Point>,
}

impl Tracker {
    pub fn handle(&mut self, event: TrackerEvent, at: Point) -> ControlFlow<()> {
        match event {
            TrackerEvent::Record => {
                self.positions.push(at);
                println!(
                    "\nrecorded #{:2}: X: {:4}, Y: {:4}",
                    self.positions.len(),
                    at.x,
                    at.y
                );
                ControlFlow::Continue(())
            }
            TrackerEvent::Quit => ControlFlow::Break(()),
        }
    }

    #[cfg(test)]
    pub fn positions(&self) -> &[Point] {
        &self.positions
    }

    pub fn into_positions(self) -> Vec<Point> {
        self.positions
    }
}

fn map_key(event_type: &EventType) -> Option<TrackerEvent> {
    match event_type {
        EventType::KeyPress(Key::Return) | EventType::KeyPress(Key::KpReturn) => {
            Some(TrackerEvent::Record)
        }
        EventType::KeyPress(Key::Escape) => Some(TrackerEvent::Quit),
        _ => None,
    }
}

/// Enter records, Esc quits. The listener thread lives until the process exits.
pub fn spawn_key_listener() -> Receiver<TrackerEvent> {
    let (tx, rx): (Sender<TrackerEvent>, Receiver<TrackerEvent>) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        let result = rdev::listen(move |event| {
            if let Some(mapped) = map_key(&event.event_type) {
                let _ = tx.send(mapped);
            }
        });
        if let Err(err) = result {
            warn!("global key listener stopped: {err:?}");
        }
    });
    rx
}

/// Poll `pointer` every `poll` until a quit event arrives.
pub fn track_until_quit<P>(
    events: &Receiver<TrackerEvent>,
    mut pointer: P,
    poll: Duration,
) -> Result<Vec<Point>>
where
    P: FnMut() -> Result<Point>,
{
    let mut tracker = Tracker::default();
    loop {
        let at = pointer()?;
        print!("\rlive -> X: {:4}, Y: {:4}  ", at.x, at.y);
        let _ = io::stdout().flush();

        match events.recv_timeout(poll) {
            Ok(event) => {
                if tracker.handle(event, at).is_break() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                bail!("key listener is gone; check input-monitoring permissions")
            }
        }
    }
    println!();
    Ok(tracker.into_positions())
}

pub fn render_positions(positions: &[Point]) -> String {
    let rule = "=".repeat(40);
    let mut lines = vec![rule.clone(), "recorded positions:".to_string(), rule.clone()];
    for (i, p) in positions.iter().enumerate() {
        lines.push(format!("  #{:2}: X: {:4}, Y: {:4}  (--click {},{})", i + 1, p.x, p.y, p.x, p.y));
    }
    lines.push(rule);
    lines.join("\n")
}

pub fn run_tracker() -> Result<Vec<Point>> {
    let enigo = Enigo::new(&Settings::default())
        .map_err(|err| anyhow!("failed to open input connection: {err}"))?;
    println!("mouse position tracker");
    println!("Enter: record position | Esc: quit");
    println!("{}", "-".repeat(40));

    let events = spawn_key_listener();
    track_until_quit(
        &events,
        || {
            let (x, y) = enigo
                .location()
                .map_err(|err| anyhow!("pointer query failed: {err}"))?;
            Ok(Point { x, y })
        },
        POLL_INTERVAL,
    )
}
