//! Replay protection for transaction signatures

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::PaymentResult;
use crate::store::SignatureRegistry;

/// Ensures a transaction signature backs at most one activation
#[derive(Clone)]
pub struct ReplayGuard {
    registry: Arc<dyn SignatureRegistry>,
}

impl ReplayGuard {
    pub fn new(registry: Arc<dyn SignatureRegistry>) -> Self {
        Self { registry }
    }

    /// Atomically consume `reference`. Returns `false` if it was already used.
    ///
    /// `context` records which flow consumed it, e.g. `intent:<id>`.
    pub async fn claim(&self, reference: &str, context: &str) -> PaymentResult<bool> {
        let claimed = self
            .registry
            .claim_signature(reference, context, Utc::now())
            .await?;

        if claimed {
            debug!("Claimed {} for {}", reference, context);
        } else {
            warn!("Replay rejected: {} already used (attempted by {})", reference, context);
        }

        Ok(claimed)
    }

    pub async fn is_used(&self, reference: &str) -> PaymentResult<bool> {
        self.registry.is_claimed(reference).await
    }

    /// Give back a claim whose work failed. Only for references that have
    /// not granted anything.
    pub async fn release(&self, reference: &str) -> PaymentResult<()> {
        self.registry.release_signature(reference).await?;
        debug!("Released {}", reference);
        Ok(())
    }
}
