//! Identity sessions: an anonymizing circuit paired with an HTTP session.
//!
//! The two halves are always created and destroyed together. Providers say
//! how to build each half; `RotationManager` owns the lifecycle.

mod provider;
pub(crate) mod rotation;

pub use provider::{CircuitProcess, CircuitProvider, DirectProvider};
pub use rotation::{Identity, RotationManager};

use crate::models::Result;
use std::future::Future;
use std::time::Duration;

/// Builds and tears down the two halves of an identity.
pub trait IdentityProvider: Send + Sync {
    /// Network egress handle (e.g. a proxy process)
    type Circuit: Send + Sync;
    /// Session bound to a circuit, handed to lookups
    type Session: Send + Sync;

    fn start_circuit(&self) -> impl Future<Output = Result<Self::Circuit>> + Send;

    /// Kill the circuit, including anything it spawned.
    fn stop_circuit(&self, circuit: Self::Circuit) -> impl Future<Output = Result<()>> + Send;

    fn open_session(
        &self,
        circuit: &Self::Circuit,
    ) -> impl Future<Output = Result<Self::Session>> + Send;

    fn close_session(&self, session: Self::Session) -> impl Future<Output = Result<()>> + Send;

    /// Wait for a fresh circuit to become usable.
    fn settle_after_start(&self) -> Duration {
        Duration::ZERO
    }

    /// Wait after tearing an old circuit down.
    fn settle_after_stop(&self) -> Duration {
        Duration::ZERO
    }
}
