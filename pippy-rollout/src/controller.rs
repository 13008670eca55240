//! Controller hooks
//!
//! External systems participate in a rollout through two capability sets:
//! target controllers gate selection/approval/removal and per-target
//! monitoring, monitoring controllers check the system as a whole. The
//! defaults approve everything and never fail.

use async_trait::async_trait;

use crate::target::ClientState;
use crate::Result;

#[async_trait]
pub trait TargetController: Send + Sync {
    /// Pick which of `targets` enter the next batch, up to `count`. May
    /// return targets the engine has not seen yet (blue/green style).
    async fn target_selection(
        &self,
        targets: Vec<ClientState>,
        count: usize,
    ) -> Result<Vec<ClientState>>;

    /// Last chance to reject targets just before the version is assigned.
    async fn target_approval(&self, targets: Vec<ClientState>) -> Result<Vec<ClientState>>;

    /// Choose which old-version targets to retire, up to `count`.
    async fn target_removal(
        &self,
        targets: Vec<ClientState>,
        count: usize,
    ) -> Result<Vec<ClientState>>;

    /// Additional per-target health check; an error fails the target.
    async fn target_monitoring(&self, target: &ClientState) -> Result<()>;
}

#[async_trait]
pub trait MonitoringController: Send + Sync {
    /// Check external monitoring for the whole in-rollout set; an error
    /// aborts the tick.
    async fn external_monitoring(&self, targets: &[ClientState]) -> Result<()>;
}

pub struct NoOpTargetController;

#[async_trait]
impl TargetController for NoOpTargetController {
    async fn target_selection(
        &self,
        targets: Vec<ClientState>,
        _count: usize,
    ) -> Result<Vec<ClientState>> {
        Ok(targets)
    }

    async fn target_approval(&self, targets: Vec<ClientState>) -> Result<Vec<ClientState>> {
        Ok(targets)
    }

    async fn target_removal(
        &self,
        _targets: Vec<ClientState>,
        _count: usize,
    ) -> Result<Vec<ClientState>> {
        Ok(Vec::new())
    }

    async fn target_monitoring(&self, _target: &ClientState) -> Result<()> {
        Ok(())
    }
}

pub struct NoOpMonitoringController;

#[async_trait]
impl MonitoringController for NoOpMonitoringController {
    async fn external_monitoring(&self, _targets: &[ClientState]) -> Result<()> {
        Ok(())
    }
}
