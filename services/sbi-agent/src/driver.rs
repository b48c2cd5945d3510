//! Backend driver capabilities.
//!
//! A node can enable two backend services, each handled by a driver: the
//! enactment backend applies change requests to the node, the telemetry
//! backend reports its state. The agent only hands drivers to the
//! controller factory; what a driver does is up to the controller.

use std::fmt::Debug;

/// Driver for a node's enactment backend.
pub trait EnactmentDriver: Send + Sync + Debug + 'static {
    /// Driver name for logging.
    fn name(&self) -> &str;

    /// Driver-level statistics, merged into the node's stats by controllers
    /// that choose to expose them.
    fn stats(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Driver for a node's telemetry backend.
pub trait TelemetryDriver: Send + Sync + Debug + 'static {
    /// Driver name for logging.
    fn name(&self) -> &str;

    /// Driver-level statistics.
    fn stats(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}
