//! Reconnection policy
//!
//! - Exponential backoff `min(base * 2^k, cap)` plus uniform jitter in `[0, ratio * delay]`
//! - Bounded attempt count; exceeding it closes the connection
//! - Post-reconnect recovery: re-authenticate, then re-subscribe, each bounded by a timeout

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{RecoveryError, RecoveryStep};
use crate::transport::FrameWriter;

// =============================================================================
// BACKOFF
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Upper bound of the jitter as a share of the nominal delay
    pub jitter_ratio: f64,
    pub max_attempts: u32,
    /// When false, any disconnect is terminal
    pub enabled: bool,
    /// Fixed jitter seed; random when absent
    pub seed: Option<u64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_ratio: 0.2,
            max_attempts: 10,
            enabled: true,
            seed: None,
        }
    }
}

/// Jitter source and last scheduled delay; carried across successor connections
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub current_delay: Duration,
    pub jitter_seed: u64,
    rng: StdRng,
}

impl BackoffState {
    pub fn new(seed: Option<u64>) -> Self {
        let jitter_seed = seed.unwrap_or_else(|| StdRng::from_entropy().gen());
        Self {
            current_delay: Duration::ZERO,
            jitter_seed,
            rng: StdRng::seed_from_u64(jitter_seed),
        }
    }

    /// Back to the initial delay; the jitter stream continues
    pub fn reset(&mut self) {
        self.current_delay = Duration::ZERO;
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    config: BackoffConfig,
}

impl ReconnectionPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether attempt `n` (1-based) is still allowed
    pub fn allows(&self, attempt: u32) -> bool {
        self.config.enabled && attempt <= self.config.max_attempts
    }

    /// `min(base * 2^k, cap)` without jitter
    pub fn nominal_delay(&self, k: u32) -> Duration {
        let factor = 1u32.checked_shl(k).unwrap_or(u32::MAX);
        self.config
            .base
            .checked_mul(factor)
            .unwrap_or(self.config.cap)
            .min(self.config.cap)
    }

    /// Delay for backoff index `k` with jitter drawn from `state`
    pub fn next_delay(&self, k: u32, state: &mut BackoffState) -> Duration {
        let nominal = self.nominal_delay(k);
        let ratio = self.config.jitter_ratio.max(0.0);
        let jitter = if ratio > 0.0 {
            nominal.mul_f64(state.rng.gen_range(0.0..=ratio))
        } else {
            Duration::ZERO
        };
        let delay = nominal + jitter;
        state.current_delay = delay;
        delay
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

// =============================================================================
// RECOVERY
// =============================================================================

/// Exchange-specific steps replayed after a reconnect
#[async_trait]
pub trait RecoveryHooks: Send + Sync {
    async fn reauthenticate(&self, writer: &dyn FrameWriter) -> Result<(), RecoveryError>;

    async fn resubscribe(&self, writer: &dyn FrameWriter) -> Result<(), RecoveryError>;
}

/// Public streams that need no recovery
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecovery;

#[async_trait]
impl RecoveryHooks for NoRecovery {
    async fn reauthenticate(&self, _writer: &dyn FrameWriter) -> Result<(), RecoveryError> {
        Ok(())
    }

    async fn resubscribe(&self, _writer: &dyn FrameWriter) -> Result<(), RecoveryError> {
        Ok(())
    }
}

/// Run re-authentication then re-subscription. The first failing or
/// timed-out step aborts the sequence.
pub async fn run_recovery(
    hooks: Arc<dyn RecoveryHooks>,
    writer: Arc<dyn FrameWriter>,
    step_timeout: Duration,
) -> Result<(), RecoveryError> {
    for step in [RecoveryStep::Reauthenticate, RecoveryStep::Resubscribe] {
        debug!(step = %step, "recovery_step_started");
        let result = match step {
            RecoveryStep::Reauthenticate => timeout(step_timeout, hooks.reauthenticate(writer.as_ref())).await,
            RecoveryStep::Resubscribe => timeout(step_timeout, hooks.resubscribe(writer.as_ref())).await,
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(RecoveryError::new(
                    step,
                    format!("timed out after {}ms", step_timeout.as_millis()),
                ))
            }
        }
    }
    info!("recovery_complete");
    Ok(())
}
