//! Process-scoped state container.
//!
//! Assembled once at startup and passed explicitly into routers and
//! services; there are no ambient singletons. Barrier-derived members exist
//! from creation but only serve once unsealed.

use std::sync::Arc;

use sqlx::AnyPool;
use tokio::sync::mpsc;

use crate::barrier::Barrier;
use crate::config::Settings;
use crate::http::middleware::RateLimiters;
use crate::security::revocation::RevocationChecker;
use crate::services::keystore::SigningKeystore;
use crate::telemetry::TelemetrySink;

/// Why the process is exiting; decides the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Operator-requested shutdown (exit 0).
    Clean,
    /// Fatal integrity error (exit 3).
    Integrity,
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pool: AnyPool,
    pub barrier: Arc<Barrier>,
    pub keystore: Arc<SigningKeystore>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub revocation: Arc<RevocationChecker>,
    pub limiters: Arc<RateLimiters>,
    shutdown_tx: mpsc::Sender<ShutdownReason>,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        pool: AnyPool,
        barrier: Arc<Barrier>,
        keystore: Arc<SigningKeystore>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> (Self, mpsc::Receiver<ShutdownReason>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);
        let limiters = Arc::new(RateLimiters::new(&settings.limits));
        (
            Self {
                settings,
                pool,
                barrier,
                keystore,
                telemetry,
                revocation: Arc::new(RevocationChecker::new()),
                limiters,
                shutdown_tx,
            },
            shutdown_rx,
        )
    }

    /// Ask the process to exit. Never blocks; duplicate requests are
    /// dropped once the channel is full.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        let _ = self.shutdown_tx.try_send(reason);
    }
}
