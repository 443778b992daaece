// ── Generation tokens for background loops ──
//
// Each `start` stamps a fresh generation and cancels the previous one.
// Loops hold a `LifecycleToken` and check `is_current()` between units of
// work; `cancelled()` lets them break out of an await promptly. Nothing
// is ever aborted mid-request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

const STOPPED: u64 = 0;

/// Generation holder for one background loop.
#[derive(Debug)]
pub struct Lifecycle {
    current: Arc<AtomicU64>,
    counter: AtomicU64,
    cancel: Mutex<CancellationToken>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self {
            current: Arc::new(AtomicU64::new(STOPPED)),
            counter: AtomicU64::new(STOPPED),
            cancel: Mutex::new(cancel),
        }
    }

    /// Begin a new generation, invalidating every earlier token.
    pub fn start(&self) -> LifecycleToken {
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        cancel.cancel();

        let generation = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        *cancel = CancellationToken::new();
        self.current.store(generation, Ordering::SeqCst);

        LifecycleToken {
            generation,
            current: Arc::clone(&self.current),
            cancel: cancel.clone(),
        }
    }

    /// Invalidate the current generation. Idempotent.
    pub fn stop(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        self.current.store(STOPPED, Ordering::SeqCst);
        cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.current.load(Ordering::SeqCst) != STOPPED
    }

    pub fn generation(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// A loop's claim on one generation.
#[derive(Debug, Clone)]
pub struct LifecycleToken {
    generation: u64,
    current: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl LifecycleToken {
    /// `true` until the owning lifecycle is stopped or restarted.
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolves once this generation is no longer current.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// The cancellation token for this generation, for handing to api-level loops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
