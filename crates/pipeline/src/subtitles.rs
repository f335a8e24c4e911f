//! Karaoke-style subtitles
//!
//! Publishes the segment whose start offset has most recently passed. The
//! empty string means no subtitle is shown.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use avatar_core::Segment;

pub struct SubtitleDriver {
    tick: Duration,
    line: watch::Sender<String>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubtitleDriver {
    pub fn new(tick: Duration) -> Self {
        let (line, _) = watch::channel(String::new());
        Self {
            tick: tick.max(Duration::from_millis(1)),
            line,
            task: Mutex::new(None),
        }
    }

    /// Follow `segments` from now
    pub fn start(&self, segments: Vec<Segment>) {
        self.cancel_task();
        let Some(first) = segments.first() else {
            self.line.send_replace(String::new());
            return;
        };
        self.line.send_replace(first.text.clone());
        if segments.len() == 1 {
            return;
        }

        let tick = self.tick;
        let line = self.line.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut shown = 0usize;

            loop {
                ticker.tick().await;
                let elapsed = started.elapsed().as_millis() as u64;
                let current = active_segment(&segments, elapsed).unwrap_or(0);
                if current != shown {
                    shown = current;
                    line.send_replace(segments[current].text.clone());
                }
                if shown + 1 == segments.len() {
                    return;
                }
            }
        });
        *self.task.lock() = Some(task);
    }

    /// Show a fixed line until the next `start` or `stop`
    pub fn show_static(&self, text: impl Into<String>) {
        self.cancel_task();
        self.line.send_replace(text.into());
    }

    pub fn stop(&self) {
        self.cancel_task();
        self.line.send_replace(String::new());
    }

    pub fn current(&self) -> String {
        self.line.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.line.subscribe()
    }

    fn cancel_task(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SubtitleDriver {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Index of the last segment whose start is at or before `elapsed_ms`
pub fn active_segment(segments: &[Segment], elapsed_ms: u64) -> Option<usize> {
    segments
        .iter()
        .rposition(|s| s.start_offset_ms <= elapsed_ms)
}
