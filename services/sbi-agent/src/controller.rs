//! Node controller contract.
//!
//! The agent does not know what a node controller does. It hands a
//! [`ControllerSpec`] to the configured [`ControllerFactory`], publishes the
//! controller's stats accessor, and runs it until it returns.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{NodeConfig, ServiceConfig};
use crate::driver::{EnactmentDriver, TelemetryDriver};
use crate::error::ControllerError;
use crate::metrics::StatsAccessor;

/// Everything a factory needs to build the controller for one node.
#[derive(Clone)]
pub struct ControllerSpec {
    /// Node identity.
    pub node_id: String,

    /// Node priority.
    pub priority: u32,

    /// The agent's clock.
    pub clock: Arc<dyn Clock>,

    /// Enactment backend, if enabled.
    pub enactment: Option<ServiceConfig<dyn EnactmentDriver>>,

    /// Telemetry backend, if enabled.
    pub telemetry: Option<ServiceConfig<dyn TelemetryDriver>>,
}

impl ControllerSpec {
    pub(crate) fn for_node(node: &NodeConfig, clock: &Arc<dyn Clock>) -> Self {
        Self {
            node_id: node.id.clone(),
            priority: node.priority,
            clock: Arc::clone(clock),
            enactment: node.enactment.clone(),
            telemetry: node.telemetry.clone(),
        }
    }
}

impl fmt::Debug for ControllerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerSpec")
            .field("node_id", &self.node_id)
            .field("priority", &self.priority)
            .field("enactment", &self.enactment)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

/// A built controller for one node.
#[async_trait]
pub trait NodeController: Send + 'static {
    /// Accessor for the controller's live statistics.
    ///
    /// Called once, before [`NodeController::run`]; the accessor must stay
    /// valid while the controller runs.
    fn stats(&self) -> StatsAccessor;

    /// Run until `token` is cancelled or the controller fails.
    async fn run(self: Box<Self>, token: CancellationToken) -> Result<(), ControllerError>;
}

/// Builds node controllers.
#[async_trait]
pub trait ControllerFactory: Send + Sync + 'static {
    /// Build the controller for the node described by `spec`.
    async fn build(&self, spec: ControllerSpec)
        -> Result<Box<dyn NodeController>, ControllerError>;
}
