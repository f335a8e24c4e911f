//! Procedural lip-sync
//!
//! While speech is audible the driver publishes a mouth shape every tick on
//! a `watch` channel. Shape `0` is the closed mouth; speaking shapes are
//! `1..=shape_count` and never repeat back to back. For
//! `pause_duration` after each pause offset the mouth stays closed.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use avatar_config::LipSyncConfig;

pub const CLOSED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LipSyncSettings {
    pub tick: Duration,
    pub pause_duration: Duration,
    pub shape_count: u8,
}

impl Default for LipSyncSettings {
    fn default() -> Self {
        Self::from(&LipSyncConfig::default())
    }
}

impl From<&LipSyncConfig> for LipSyncSettings {
    fn from(config: &LipSyncConfig) -> Self {
        Self {
            tick: Duration::from_millis(config.tick_ms.max(1)),
            pause_duration: Duration::from_millis(config.pause_duration_ms),
            shape_count: config.shape_count.max(2),
        }
    }
}

pub struct LipSyncDriver {
    settings: LipSyncSettings,
    shape: watch::Sender<u8>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LipSyncDriver {
    pub fn new(settings: LipSyncSettings) -> Self {
        let (shape, _) = watch::channel(CLOSED);
        Self {
            settings,
            shape,
            task: Mutex::new(None),
        }
    }

    /// Start animating from now; replaces any running animation
    pub fn start(&self, pauses: &[u64]) {
        let pauses = pauses.to_vec();
        let settings = self.settings;
        let shape = self.shape.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(settings.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut rng = StdRng::from_entropy();
            let mut previous = CLOSED;

            loop {
                ticker.tick().await;
                let elapsed = started.elapsed().as_millis() as u64;
                let next = if in_pause(elapsed, &pauses, settings.pause_duration) {
                    CLOSED
                } else {
                    next_shape(previous, settings.shape_count, &mut rng)
                };
                previous = next;
                shape.send_replace(next);
            }
        });

        if let Some(old) = self.task.lock().replace(task) {
            old.abort();
        }
    }

    /// Stop animating and close the mouth
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.shape.send_replace(CLOSED);
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn current(&self) -> u8 {
        *self.shape.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.shape.subscribe()
    }
}

impl Drop for LipSyncDriver {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// True when `elapsed_ms` falls inside `[p, p + duration)` for some pause `p`
pub fn in_pause(elapsed_ms: u64, pauses: &[u64], duration: Duration) -> bool {
    let duration = duration.as_millis() as u64;
    pauses
        .iter()
        .any(|&p| elapsed_ms >= p && elapsed_ms < p.saturating_add(duration))
}

/// Uniform pick from `1..=shape_count`, excluding `previous`
pub fn next_shape<R: Rng + ?Sized>(previous: u8, shape_count: u8, rng: &mut R) -> u8 {
    if shape_count < 2 {
        return 1;
    }
    if previous == CLOSED || previous > shape_count {
        return rng.gen_range(1..=shape_count);
    }
    let pick = rng.gen_range(1..shape_count);
    if pick >= previous {
        pick + 1
    } else {
        pick
    }
}
