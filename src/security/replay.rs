//! Replay protection for encrypted uplinks
//!
//! Current firmware sends one fixed nonce with every encrypted uplink, so the
//! canonical guard accepts exactly that value. Earlier firmware sent a
//! monotonically increasing counter; [`CounterNonceGuard`] keeps that policy
//! available on top of any [`NonceStore`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::nonce_store::NonceStore;
use crate::Result;
use crate::protocol::FIXED_NONCE;

/// Outcome of a nonce check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum ReplayVerdict {
    Accepted,
    Rejected { reason: String },
}

impl ReplayVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReplayVerdict::Accepted)
    }
}

/// Nonce policy consulted around MAC verification.
///
/// [`peek`](ReplayGuard::peek) runs before the MAC and must not change any
/// state; [`check`](ReplayGuard::check) runs only once the MAC verified and
/// consumes the nonce. An unauthenticated request therefore never moves a
/// stateful policy forward.
#[async_trait]
pub trait ReplayGuard: Send + Sync + std::fmt::Debug {
    /// Whether `nonce` would be accepted, without consuming it.
    async fn peek(&self, nonce: u64) -> Result<ReplayVerdict>;

    /// Check and, for stateful policies, consume `nonce`.
    async fn check(&self, nonce: u64) -> Result<ReplayVerdict>;

    /// Short policy name for logs.
    fn policy(&self) -> &'static str;
}

/// Accepts exactly one nonce value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedNonceGuard {
    expected: u64,
}

impl FixedNonceGuard {
    pub fn new(expected: u64) -> Self {
        Self { expected }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }
}

impl Default for FixedNonceGuard {
    fn default() -> Self {
        Self::new(FIXED_NONCE)
    }
}

#[async_trait]
impl ReplayGuard for FixedNonceGuard {
    async fn peek(&self, nonce: u64) -> Result<ReplayVerdict> {
        self.check(nonce).await
    }

    async fn check(&self, nonce: u64) -> Result<ReplayVerdict> {
        if nonce == self.expected {
            debug!("Fixed nonce verified: {}", nonce);
            return Ok(ReplayVerdict::Accepted);
        }
        warn!("Fixed nonce mismatch: expected {}, received {}", self.expected, nonce);
        Ok(ReplayVerdict::Rejected { reason: "nonce mismatch, possible replay".to_string() })
    }

    fn policy(&self) -> &'static str {
        "fixed"
    }
}

/// Accepts nonces strictly greater than the last accepted one.
#[derive(Debug, Clone)]
pub struct CounterNonceGuard {
    store: Arc<dyn NonceStore>,
}

impl CounterNonceGuard {
    pub fn new(store: Arc<dyn NonceStore>) -> Self {
        Self { store }
    }

    /// Last accepted nonce.
    pub async fn current(&self) -> Result<u64> {
        self.store.read().await
    }

    /// Overwrite the stored counter, e.g. after a device reflash.
    pub async fn reset(&self, nonce: u64) -> Result<()> {
        self.store.write(nonce).await?;
        info!("Replay counter reset to {}", nonce);
        Ok(())
    }
}

fn stale(nonce: u64, last: u64) -> ReplayVerdict {
    warn!("Replayed nonce {} (last accepted {})", nonce, last);
    ReplayVerdict::Rejected { reason: format!("nonce {} not greater than {}", nonce, last) }
}

#[async_trait]
impl ReplayGuard for CounterNonceGuard {
    async fn peek(&self, nonce: u64) -> Result<ReplayVerdict> {
        let last = self.store.read().await?;
        if nonce <= last {
            return Ok(stale(nonce, last));
        }
        Ok(ReplayVerdict::Accepted)
    }

    async fn check(&self, nonce: u64) -> Result<ReplayVerdict> {
        loop {
            let last = self.store.read().await?;
            if nonce <= last {
                return Ok(stale(nonce, last));
            }
            if self.store.compare_and_swap(last, nonce).await? {
                debug!("Nonce advanced {} -> {}", last, nonce);
                return Ok(ReplayVerdict::Accepted);
            }
            debug!("Nonce store changed under us, retrying");
        }
    }

    fn policy(&self) -> &'static str {
        "counter"
    }
}
