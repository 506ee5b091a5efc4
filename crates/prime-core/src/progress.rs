//! Progress reporting for update runs.
//!
//! The orchestrator is the only producer; the frontend consumes a bounded
//! channel. Intermediate ticks are allowed to drop when the consumer lags,
//! the milestone ticks are always delivered.

use std::io::{self, Read};

use crossbeam_channel::Sender;

/// One progress event.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub text: String,
    /// Overall completion in `[0, 1]`; meaningless when `indeterminate`.
    pub percentage: f64,
    pub indeterminate: bool,
    pub cancellable: bool,
}

impl Progress {
    /// Busy tick without a meaningful percentage.
    pub fn busy(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            percentage: 0.0,
            indeterminate: true,
            cancellable: false,
        }
    }

    /// Determinate tick.
    pub fn at(text: impl Into<String>, percentage: f64) -> Self {
        Self {
            text: text.into(),
            percentage,
            indeterminate: false,
            cancellable: false,
        }
    }
}

/// Producer side of the progress pipeline.
pub struct ProgressSink {
    tx: Sender<Progress>,
}

impl ProgressSink {
    pub fn new(tx: Sender<Progress>) -> Self {
        Self { tx }
    }

    /// Best-effort tick; dropped when the consumer is behind.
    pub fn tick(&self, progress: Progress) {
        let _ = self.tx.try_send(progress);
    }

    /// Milestone tick, delivered even if the consumer is slow.
    pub fn push(&self, progress: Progress) {
        let _ = self.tx.send(progress);
    }
}

/// Read interposer reporting the size of every successful read.
///
/// The wrapped reader is treated as forward-only; a seeking reader would
/// make the reported counts under-estimate the true position.
pub struct CountingReader<R, F> {
    inner: R,
    observer: F,
}

impl<R: Read, F: FnMut(u64)> CountingReader<R, F> {
    pub fn new(inner: R, observer: F) -> Self {
        Self { inner, observer }
    }
}

impl<R: Read, F: FnMut(u64)> Read for CountingReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            (self.observer)(n as u64);
        }
        Ok(n)
    }
}

/// Binary-prefixed byte count for progress texts.
pub(crate) fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
