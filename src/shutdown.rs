//! # Shutdown Signalling
//!
//! One [`ShutdownSignal`] is created per process and every background loop
//! holds a [`ShutdownListener`] cloned from it.
//!
//! ```text
//!     ShutdownSignal ── trigger() ──► drops the only Sender
//!                                          │
//!            ┌─────────────────────────────┼────────────────────────┐
//!            ▼                             ▼                        ▼
//!     log writer select!            scanner select!         processor select!
//!     recv(shutdown) fires          recv(shutdown) fires    recv(shutdown) fires
//! ```
//!
//! The channel never carries a message. Triggering drops its sender, which
//! disconnects every receiver at once, so a loop blocked in `select!` wakes
//! immediately no matter how many listeners exist.
//!
//! [`BackgroundThread`] wraps a named OS thread together with a completion
//! channel so a caller can wait for it with a deadline instead of an
//! unbounded `join`.

use crate::error::SpawnError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Process-wide cancellation signal.
///
/// Cheap to clone; all clones share the same state.
///
/// ```rust
/// use tasker::ShutdownSignal;
/// use std::time::Duration;
///
/// let signal = ShutdownSignal::new();
/// let listener = signal.listener();
///
/// assert!(!listener.wait_timeout(Duration::from_millis(5)));
/// signal.trigger();
/// assert!(listener.wait_timeout(Duration::from_secs(60)));
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(1);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fires the signal. Later calls are no-ops.
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.lock().take();
        debug!("shutdown signal triggered");
    }

    /// Returns `true` once [`trigger`](Self::trigger) has been called.
    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Returns a listener for a background loop.
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.receiver.clone(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    receiver: Receiver<()>,
}

impl ShutdownListener {
    /// Receiver to place in a `select!`; it becomes ready when the signal fires.
    #[inline]
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }

    /// Returns `true` if the signal has fired.
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self.receiver.try_recv(),
            Err(channel::TryRecvError::Disconnected)
        )
    }

    /// Blocks for up to `timeout`; returns `true` if the signal fired meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

/// A named background thread that can be joined with a deadline.
#[derive(Debug)]
pub struct BackgroundThread {
    name: String,
    handle: thread::JoinHandle<()>,
    done: Receiver<()>,
}

/// Dropped when the thread body returns or unwinds.
struct DoneGuard(#[allow(dead_code)] Sender<()>);

impl BackgroundThread {
    /// Spawns `body` on a new thread called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the OS refuses to create the thread.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = channel::bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done = DoneGuard(done_tx);
                body();
            })
            .map_err(|source| SpawnError {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            handle,
            done,
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once the thread body has returned.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.done.try_recv(),
            Err(channel::TryRecvError::Disconnected)
        )
    }

    /// Waits for the thread to finish.
    ///
    /// Returns `false` if it panicked.
    pub fn join(self) -> bool {
        match self.handle.join() {
            Ok(()) => true,
            Err(_) => {
                error!(thread = %self.name, "background thread panicked");
                false
            }
        }
    }

    /// Waits up to `grace` for the thread to finish.
    ///
    /// Returns `true` if it finished cleanly in time. On timeout the thread is
    /// left detached and `false` is returned.
    pub fn join_within(self, grace: Duration) -> bool {
        match self.done.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(thread = %self.name, ?grace, "background thread did not stop within grace period");
                false
            }
            _ => self.join(),
        }
    }
}
