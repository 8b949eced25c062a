//! Entry point: assemble collaborators and start a link

use std::sync::Arc;

use tracing::info;

use crate::config::LinkConfig;
use crate::error::LinkResult;
use crate::heartbeat::HeartbeatProfile;
use crate::reconnect::{NoRecovery, ReconnectionPolicy, RecoveryHooks};
use crate::session::{ConnectionStateMachine, LinkCore, LinkDriver, SpawnedLink};
use crate::telemetry::{default_sink, TelemetrySink};
use crate::transport::{TransportChannel, TungsteniteChannel};

pub struct Link;

impl Link {
    pub fn builder(config: LinkConfig) -> LinkBuilder {
        LinkBuilder {
            config,
            transport: None,
            profile: None,
            recovery: None,
            telemetry: None,
        }
    }
}

/// Collaborators default to the tungstenite transport, the configured
/// heartbeat profile, no recovery hooks and tracing telemetry.
pub struct LinkBuilder {
    config: LinkConfig,
    transport: Option<Arc<dyn TransportChannel>>,
    profile: Option<Arc<dyn HeartbeatProfile>>,
    recovery: Option<Arc<dyn RecoveryHooks>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl LinkBuilder {
    pub fn transport(mut self, transport: Arc<dyn TransportChannel>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides `heartbeat.profile` from the config
    pub fn profile(mut self, profile: Arc<dyn HeartbeatProfile>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn recovery(mut self, hooks: Arc<dyn RecoveryHooks>) -> Self {
        self.recovery = Some(hooks);
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Validate the config and start the coordinating task on the current
    /// runtime. The link stays Idle until `open` is called on the handle.
    pub fn spawn(self) -> LinkResult<SpawnedLink> {
        self.config.validate()?;

        let profile = self
            .profile
            .unwrap_or_else(|| self.config.heartbeat.profile.build());
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteChannel::new()));
        let profile_name = profile.name().to_string();
        let hooks = self.recovery.unwrap_or_else(|| Arc::new(NoRecovery));
        let telemetry = self.telemetry.unwrap_or_else(default_sink);

        let machine = ConnectionStateMachine::new(
            self.config.heartbeat_config(profile),
            ReconnectionPolicy::new(self.config.backoff_config()),
            self.config.recover_on_open,
            telemetry,
        );
        let core = LinkCore::new(machine, self.config.driver_settings(), transport, hooks);

        let spawned = LinkDriver::spawn(core);
        info!(
            connection = %spawned.handle.id(),
            endpoint = %self.config.endpoint,
            profile = %profile_name,
            "link_spawned"
        );
        Ok(spawned)
    }
}
