//! Cooperative cancellation shared by every pipeline stage.
//!
//! The token pairs an atomic flag with a channel that is closed on trigger,
//! so blocking selects wake immediately while hot loops can poll the flag
//! without touching the channel.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
    triggered: AtomicBool,
    done: Receiver<()>,
    // Held until trigger; dropping it disconnects `done` for all clones.
    guard: Mutex<Option<Sender<()>>>,
}

/// Cloneable cancellation handle.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        let (tx, rx) = bounded::<()>(0);
        ShutdownToken {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                done: rx,
                guard: Mutex::new(Some(tx)),
            }),
        }
    }

    /// Request shutdown. Idempotent; wakes every select blocked on
    /// [`ShutdownToken::channel`].
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Release);
        self.inner.guard.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Channel that becomes permanently ready once the token fires.
    /// Register it in a `Select` alongside the data channels.
    pub fn channel(&self) -> &Receiver<()> {
        &self.inner.done
    }

    /// Block the calling thread until the token fires.
    pub fn wait(&self) {
        let _ = self.inner.done.recv();
    }

    /// Trigger this token on SIGINT/SIGTERM.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            tracing::info!("interrupt received, shutting down");
            token.trigger();
        })
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
