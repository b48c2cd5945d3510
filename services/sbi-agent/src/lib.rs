//! SBI Agent Core
//!
//! The agent supervises one controller per managed network node. Each node
//! talks to an enactment backend (pushes configuration) and/or a telemetry
//! backend (collects observations); what a controller does with them is up to
//! the embedder's [`ControllerFactory`].
//!
//! ## Architecture
//!
//! ```text
//! Agent (validated config)
//! └── run(token)
//!     ├── InstanceStats "agent-<n>"   (live stats, registered for the run)
//!     ├── node controller "alpha"     (child token, own span and logs)
//!     ├── node controller "beta"
//!     └── ...
//! ```
//!
//! A node failing does not stop its siblings. The run returns once every
//! node has terminated, with every failure attached.
//!
//! ## Modules
//!
//! - `config`: option-driven agent and node configuration
//! - `agent`: the supervisor
//! - `task`: instrumented task wrapper (lifecycle logs, fields, spans)
//! - `metrics`: process-wide registry of live stats
//! - `controller`: the node controller contract
//! - `logging`: subscriber setup for binaries

pub mod agent;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dial;
pub mod driver;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod task;

pub use agent::Agent;
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{AgentBuilder, AgentOption, NodeConfig, NodeOption, ServiceConfig};
pub use controller::{ControllerFactory, ControllerSpec, NodeController};
pub use dial::{DialError, DialOption};
pub use driver::{EnactmentDriver, TelemetryDriver};
pub use error::{
    ConfigError, ConfigErrors, ControllerError, NodeFailure, NodeFailures, RunError,
};
pub use metrics::{InstanceStats, StatsAccessor, StatsRegistration, StatsRegistry};
pub use task::{LogFields, SpanAttribute, Task, TaskFuture};

pub use tokio_util::sync::CancellationToken;
