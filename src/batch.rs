//! Size/time batch windows for outgoing gossip.
//!
//! Collects updates bound for one destination and releases them together
//! once the window is full or its first update has waited long enough.
//!
//! # Design
//!
//! ```text
//! updates ──▶ BatchWindow ──┬──▶ len >= max_batch_size   ──▶ take()
//!              (Vec<T>)     │
//!                           └──▶ now >= first + max_delay ──▶ take()
//! ```
//!
//! Unlike a latest-wins buffer, every update is kept: gossiped values are
//! merged by union on the receiving side, so nothing may be coalesced away.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Configuration for a batch window.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum updates before forcing a flush.
    pub max_batch_size: usize,
    /// Maximum time the oldest update waits before flushing.
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 2,
            max_batch_delay: Duration::from_millis(250),
        }
    }
}

impl BatchConfig {
    /// A window that flushes on every update.
    pub fn immediate() -> Self {
        Self {
            max_batch_size: 1,
            max_batch_delay: Duration::ZERO,
        }
    }
}

/// Accumulates updates until a size or time threshold is reached.
#[derive(Debug)]
pub struct BatchWindow<T> {
    pending: Vec<T>,
    /// When the current window started accumulating.
    batch_start: Option<Instant>,
    config: BatchConfig,
}

impl<T> BatchWindow<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending: Vec::new(),
            batch_start: None,
            config,
        }
    }

    /// Add an update to the window.
    pub fn add(&mut self, item: T) {
        if self.batch_start.is_none() {
            self.batch_start = Some(Instant::now());
        }
        self.pending.push(item);
    }

    /// Check if the window should be flushed.
    pub fn should_flush(&self) -> bool {
        if self.pending.len() >= self.config.max_batch_size {
            return true;
        }

        match self.batch_start {
            Some(start) => start.elapsed() >= self.config.max_batch_delay,
            None => false,
        }
    }

    /// Instant at which the time threshold fires, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.batch_start.map(|start| start + self.config.max_batch_delay)
    }

    /// Drain the window, resetting its timer.
    pub fn take(&mut self) -> Vec<T> {
        self.batch_start = None;
        std::mem::take(&mut self.pending)
    }

    /// Number of pending updates.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if window is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

/// Thread-safe wrapper around [`BatchWindow`].
pub struct SharedBatchWindow<T> {
    inner: Mutex<BatchWindow<T>>,
}

impl<T> SharedBatchWindow<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            inner: Mutex::new(BatchWindow::new(config)),
        }
    }

    /// Add an update; returns the whole window when the size threshold trips.
    pub async fn add(&self, item: T) -> Option<Vec<T>> {
        let mut window = self.inner.lock().await;
        window.add(item);
        if window.len() >= window.config().max_batch_size {
            Some(window.take())
        } else {
            None
        }
    }

    /// Drain the window if its time threshold has passed.
    pub async fn take_if_due(&self) -> Option<Vec<T>> {
        let mut window = self.inner.lock().await;
        if !window.is_empty() && window.should_flush() {
            Some(window.take())
        } else {
            None
        }
    }

    /// Force a flush regardless of thresholds.
    pub async fn take(&self) -> Vec<T> {
        self.inner.lock().await.take()
    }
}
