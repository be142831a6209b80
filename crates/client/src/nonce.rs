//! Anti-replay nonce pool
//!
//! Nonces are a scarce, server-issued resource: every response that
//! carries a Replay-Nonce header refills the pool, including error
//! responses. The pool is the only state shared across concurrent
//! per-domain workers.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::trace;

/// FIFO pool of unused anti-replay nonces
#[derive(Debug, Default)]
pub struct NoncePool {
    nonces: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the oldest pooled nonce
    ///
    /// A taken nonce is gone from the pool; it must never be offered to
    /// a second request.
    pub fn take(&self) -> Option<String> {
        let nonce = self.nonces.lock().pop_front();
        if let Some(ref n) = nonce {
            trace!(nonce = %n, "Nonce taken from pool");
        }
        nonce
    }

    /// Return a fresh server-issued nonce to the pool
    pub fn put(&self, nonce: String) {
        if nonce.is_empty() {
            return;
        }
        trace!(nonce = %nonce, "Nonce added to pool");
        self.nonces.lock().push_back(nonce);
    }

    /// Number of pooled nonces
    pub fn len(&self) -> usize {
        self.nonces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.lock().is_empty()
    }
}
