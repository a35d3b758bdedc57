//! Identity rotation.
//!
//! - `acquire`: start circuit, settle, open session; a session that fails to
//!   open takes its circuit down with it
//! - `rotate`: teardown (never fails), settle, acquire
//! - `release`: teardown only

use super::IdentityProvider;
use crate::models::Result;
use tracing::{debug, info, warn};

/// A live (circuit, session) pair.
pub struct Identity<C, S> {
    pub circuit: C,
    pub session: S,
    /// Increases by one on every acquisition
    pub generation: u64,
}

/// Owns the identity lifecycle for one job.
pub struct RotationManager<P: IdentityProvider> {
    provider: P,
    generation: u64,
    rotations: u64,
}

impl<P: IdentityProvider> RotationManager<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            generation: 0,
            rotations: 0,
        }
    }

    /// Completed rotations so far.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Build a fresh identity.
    pub async fn acquire(&mut self) -> Result<Identity<P::Circuit, P::Session>> {
        let circuit = self.provider.start_circuit().await?;

        let settle = self.provider.settle_after_start();
        if !settle.is_zero() {
            debug!(settle_secs = settle.as_secs(), "Waiting for circuit");
            tokio::time::sleep(settle).await;
        }

        let session = match self.provider.open_session(&circuit).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Session failed to open, stopping circuit");
                if let Err(stop_err) = self.provider.stop_circuit(circuit).await {
                    warn!(error = %stop_err, "Failed to stop circuit");
                }
                return Err(e);
            }
        };

        self.generation += 1;
        info!(generation = self.generation, "Identity acquired");
        Ok(Identity {
            circuit,
            session,
            generation: self.generation,
        })
    }

    /// Replace the current identity with a new one.
    pub async fn rotate(
        &mut self,
        old: Option<Identity<P::Circuit, P::Session>>,
    ) -> Result<Identity<P::Circuit, P::Session>> {
        if let Some(old) = old {
            info!(generation = old.generation, "Rotating identity");
            self.release(old).await;

            let settle = self.provider.settle_after_stop();
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
        }

        let fresh = self.acquire().await?;
        self.rotations += 1;
        Ok(fresh)
    }

    /// Tear an identity down. Failures are logged, never raised.
    pub async fn release(&self, identity: Identity<P::Circuit, P::Session>) {
        let Identity {
            circuit,
            session,
            generation,
        } = identity;

        if let Err(e) = self.provider.close_session(session).await {
            warn!(generation, error = %e, "Failed to close session");
        }
        if let Err(e) = self.provider.stop_circuit(circuit).await {
            warn!(generation, error = %e, "Failed to stop circuit");
        }
        debug!(generation, "Identity released");
    }
}
