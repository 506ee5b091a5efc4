//! Cancellation contexts for USB operations.
//!
//! Every blocking operation in the transport and fastboot layers takes a
//! [`CancelToken`]. Cancelling the root token unblocks pending I/O and
//! surfaces as the dedicated `Cancelled` error kind, never as a device
//! error. Tokens can also carry a deadline for per-operation timeouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Why a token stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// Still live.
    Active,
    /// Explicitly cancelled (user abort, signal, session teardown).
    Cancelled,
    /// A deadline somewhere in the chain expired.
    TimedOut,
}

/// Cloneable cancellation handle with optional deadline and parent chaining.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// New root token without deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Child token. Cancelling the parent cancels the child; cancelling the
    /// child leaves the parent live.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: Some(self.clone()),
            }),
        }
    }

    /// Child token that additionally times out after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this token and everything derived from it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Current state, considering the whole parent chain. Explicit
    /// cancellation wins over deadline expiry.
    pub fn state(&self) -> CancelState {
        let mut timed_out = false;
        let mut current = Some(self);
        while let Some(token) = current {
            if token.inner.cancelled.load(Ordering::SeqCst) {
                return CancelState::Cancelled;
            }
            if let Some(deadline) = token.inner.deadline {
                if Instant::now() >= deadline {
                    timed_out = true;
                }
            }
            current = token.inner.parent.as_ref();
        }
        if timed_out {
            CancelState::TimedOut
        } else {
            CancelState::Active
        }
    }

    /// True once the token is cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.state() != CancelState::Active
    }

    /// Earliest deadline in the chain, if any.
    pub fn deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut current = Some(self);
        while let Some(token) = current {
            if let Some(deadline) = token.inner.deadline {
                earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
            }
            current = token.inner.parent.as_ref();
        }
        earliest
    }

    /// Interruptible sleep. Returns `false` if the token became done before
    /// the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now() + duration;
        loop {
            if self.is_done() {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(end - now));
        }
    }
}
