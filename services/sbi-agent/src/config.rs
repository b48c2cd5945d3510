//! Agent configuration.
//!
//! An [`Agent`] is described by an ordered list of [`AgentOption`]s, each node
//! by an ordered list of [`NodeOption`]s. Options are applied in order to a
//! draft, so a later option overrides an earlier one touching the same field.
//! The draft is then validated; every violated invariant is reported in a
//! single [`ConfigErrors`].
//!
//! ```ignore
//! let agent = Agent::new([
//!     AgentOption::real_clock(),
//!     AgentOption::controller_factory(factory),
//!     AgentOption::node("alpha", [
//!         NodeOption::priority(1),
//!         NodeOption::enactment_service("10.0.0.1:50051", driver, []),
//!     ]),
//! ])?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tonic::transport::Endpoint;

use crate::agent::Agent;
use crate::clock::{Clock, SystemClock};
use crate::controller::ControllerFactory;
use crate::dial::{self, DialError, DialOption};
use crate::driver::{EnactmentDriver, TelemetryDriver};
use crate::error::{ConfigError, ConfigErrors};
use crate::metrics::StatsRegistry;

// =============================================================================
// Node configuration
// =============================================================================

/// An enabled backend service: driver, endpoint and dial options.
#[derive(Debug)]
pub struct ServiceConfig<D: ?Sized> {
    /// Backend endpoint, `host:port` or a full URI.
    pub endpoint: String,

    /// Driver handling the backend.
    pub driver: Arc<D>,

    /// Connection options, applied in order.
    pub dial_options: Vec<DialOption>,
}

impl<D: ?Sized> ServiceConfig<D> {
    /// Create a service configuration.
    pub fn new(
        endpoint: impl Into<String>,
        driver: Arc<D>,
        dial_options: impl IntoIterator<Item = DialOption>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            driver,
            dial_options: dial_options.into_iter().collect(),
        }
    }

    /// Transport endpoint for this service with its dial options applied.
    pub fn transport_endpoint(&self) -> Result<Endpoint, DialError> {
        dial::endpoint(&self.endpoint, &self.dial_options)
    }
}

impl<D: ?Sized> Clone for ServiceConfig<D> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            driver: Arc::clone(&self.driver),
            dial_options: self.dial_options.clone(),
        }
    }
}

/// Description of one managed node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node identity, unique within an agent.
    pub id: String,

    /// Node priority.
    pub priority: u32,

    /// Enactment backend, if enabled.
    pub enactment: Option<ServiceConfig<dyn EnactmentDriver>>,

    /// Telemetry backend, if enabled.
    pub telemetry: Option<ServiceConfig<dyn TelemetryDriver>>,
}

impl NodeConfig {
    fn new(id: String) -> Self {
        Self {
            id,
            priority: 0,
            enactment: None,
            telemetry: None,
        }
    }

    /// Returns true if the enactment backend is enabled.
    pub fn enactment_enabled(&self) -> bool {
        self.enactment.is_some()
    }

    /// Returns true if the telemetry backend is enabled.
    pub fn telemetry_enabled(&self) -> bool {
        self.telemetry.is_some()
    }

    /// Returns true if at least one backend service is enabled.
    pub fn has_services(&self) -> bool {
        self.enactment_enabled() || self.telemetry_enabled()
    }
}

/// A single step of node configuration.
#[derive(Debug, Clone)]
pub enum NodeOption {
    /// Set the node priority.
    Priority(u32),

    /// Enable and configure the enactment backend.
    Enactment(ServiceConfig<dyn EnactmentDriver>),

    /// Enable and configure the telemetry backend.
    Telemetry(ServiceConfig<dyn TelemetryDriver>),
}

impl NodeOption {
    /// Set the node priority.
    pub fn priority(priority: u32) -> Self {
        NodeOption::Priority(priority)
    }

    /// Enable the enactment backend at `endpoint`, handled by `driver`.
    pub fn enactment_service<D: EnactmentDriver>(
        endpoint: impl Into<String>,
        driver: Arc<D>,
        dial_options: impl IntoIterator<Item = DialOption>,
    ) -> Self {
        let driver: Arc<dyn EnactmentDriver> = driver;
        NodeOption::Enactment(ServiceConfig::new(endpoint, driver, dial_options))
    }

    /// Enable the telemetry backend at `endpoint`, handled by `driver`.
    pub fn telemetry_service<D: TelemetryDriver>(
        endpoint: impl Into<String>,
        driver: Arc<D>,
        dial_options: impl IntoIterator<Item = DialOption>,
    ) -> Self {
        let driver: Arc<dyn TelemetryDriver> = driver;
        NodeOption::Telemetry(ServiceConfig::new(endpoint, driver, dial_options))
    }

    fn apply(self, node: &mut NodeConfig) {
        match self {
            NodeOption::Priority(p) => node.priority = p,
            NodeOption::Enactment(svc) => node.enactment = Some(svc),
            NodeOption::Telemetry(svc) => node.telemetry = Some(svc),
        }
    }
}

// =============================================================================
// Agent options
// =============================================================================

/// A single step of agent configuration.
pub enum AgentOption {
    /// Use the given clock.
    Clock(Arc<dyn Clock>),

    /// Use the wall clock.
    RealClock,

    /// Manage a node. A later node with the same id replaces this one.
    Node {
        id: String,
        options: Vec<NodeOption>,
    },

    /// Report live stats into this registry instead of the global one.
    StatsRegistry(Arc<StatsRegistry>),

    /// Build node controllers with this factory.
    ControllerFactory(Arc<dyn ControllerFactory>),
}

impl AgentOption {
    /// Use the given clock.
    pub fn clock<C: Clock>(clock: Arc<C>) -> Self {
        AgentOption::Clock(clock)
    }

    /// Use the wall clock.
    pub fn real_clock() -> Self {
        AgentOption::RealClock
    }

    /// Manage the node `id`, configured by `options`.
    pub fn node(id: impl Into<String>, options: impl IntoIterator<Item = NodeOption>) -> Self {
        AgentOption::Node {
            id: id.into(),
            options: options.into_iter().collect(),
        }
    }

    /// Report live stats into `registry`.
    pub fn stats_registry(registry: Arc<StatsRegistry>) -> Self {
        AgentOption::StatsRegistry(registry)
    }

    /// Build node controllers with `factory`.
    pub fn controller_factory<F: ControllerFactory>(factory: Arc<F>) -> Self {
        AgentOption::ControllerFactory(factory)
    }

    fn apply(self, draft: &mut AgentDraft) {
        match self {
            AgentOption::Clock(clock) => draft.clock = Some(clock),
            AgentOption::RealClock => draft.clock = Some(Arc::new(SystemClock)),
            AgentOption::Node { id, options } => {
                let mut node = NodeConfig::new(id.clone());
                for opt in options {
                    opt.apply(&mut node);
                }
                draft.nodes.insert(id, node);
            }
            AgentOption::StatsRegistry(registry) => draft.registry = Some(registry),
            AgentOption::ControllerFactory(factory) => draft.factory = Some(factory),
        }
    }
}

impl fmt::Debug for AgentOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentOption::Clock(clock) => f.debug_tuple("Clock").field(clock).finish(),
            AgentOption::RealClock => f.write_str("RealClock"),
            AgentOption::Node { id, options } => f
                .debug_struct("Node")
                .field("id", id)
                .field("options", options)
                .finish(),
            AgentOption::StatsRegistry(_) => f.write_str("StatsRegistry(..)"),
            AgentOption::ControllerFactory(_) => f.write_str("ControllerFactory(..)"),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Mutable agent description that options are applied to.
#[derive(Default)]
struct AgentDraft {
    clock: Option<Arc<dyn Clock>>,
    nodes: BTreeMap<String, NodeConfig>,
    registry: Option<Arc<StatsRegistry>>,
    factory: Option<Arc<dyn ControllerFactory>>,
}

impl AgentDraft {
    /// Validate the draft and freeze it into an agent.
    fn finish(self) -> Result<Agent, ConfigErrors> {
        let mut errors = Vec::new();

        if self.clock.is_none() {
            errors.push(ConfigError::NoClock);
        }
        if self.nodes.is_empty() {
            errors.push(ConfigError::NoNodes);
        }
        for node in self.nodes.values() {
            if !node.has_services() {
                errors.push(ConfigError::NoActiveServices {
                    node_id: node.id.clone(),
                });
            }
        }
        if self.factory.is_none() {
            errors.push(ConfigError::NoControllerFactory);
        }

        match (self.clock, self.factory) {
            (Some(clock), Some(factory)) if errors.is_empty() => Ok(Agent::from_parts(
                clock,
                self.nodes,
                self.registry.unwrap_or_else(StatsRegistry::global),
                factory,
            )),
            _ => Err(ConfigErrors::new(errors)),
        }
    }
}

/// Applies options in order and validates the result.
#[derive(Debug, Default)]
pub struct AgentBuilder {
    options: Vec<AgentOption>,
}

impl AgentBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one option.
    pub fn option(mut self, option: AgentOption) -> Self {
        self.options.push(option);
        self
    }

    /// Append several options.
    pub fn options(mut self, options: impl IntoIterator<Item = AgentOption>) -> Self {
        self.options.extend(options);
        self
    }

    /// Apply every option and validate the resulting description.
    pub fn build(self) -> Result<Agent, ConfigErrors> {
        let mut draft = AgentDraft::default();
        for opt in self.options {
            opt.apply(&mut draft);
        }
        draft.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::controller::{ControllerSpec, NodeController};
    use crate::error::ControllerError;

    #[derive(Debug)]
    struct Driver;

    impl EnactmentDriver for Driver {
        fn name(&self) -> &str {
            "test-enactment"
        }
    }

    impl TelemetryDriver for Driver {
        fn name(&self) -> &str {
            "test-telemetry"
        }
    }

    struct NeverBuilds;

    #[async_trait::async_trait]
    impl ControllerFactory for NeverBuilds {
        async fn build(
            &self,
            _spec: ControllerSpec,
        ) -> Result<Box<dyn NodeController>, ControllerError> {
            Err(ControllerError::failed("not used"))
        }
    }

    fn base() -> Vec<AgentOption> {
        vec![
            AgentOption::clock(Arc::new(FakeClock::default())),
            AgentOption::controller_factory(Arc::new(NeverBuilds)),
            AgentOption::stats_registry(Arc::new(StatsRegistry::new())),
        ]
    }

    fn enactment(endpoint: &str) -> NodeOption {
        NodeOption::enactment_service(endpoint, Arc::new(Driver), [])
    }

    fn telemetry(endpoint: &str) -> NodeOption {
        NodeOption::telemetry_service(endpoint, Arc::new(Driver), [])
    }

    #[test]
    fn test_valid_agent() {
        let agent = AgentBuilder::new()
            .options(base())
            .option(AgentOption::node("alpha", [enactment("10.0.0.1:1")]))
            .option(AgentOption::node("beta", [telemetry("10.0.0.2:2")]))
            .build()
            .unwrap();

        assert_eq!(agent.node_ids(), ["alpha", "beta"]);
        let alpha = agent.node("alpha").unwrap();
        assert!(alpha.enactment_enabled());
        assert!(!alpha.telemetry_enabled());
    }

    #[test]
    fn test_missing_clock() {
        let err = AgentBuilder::new()
            .option(AgentOption::controller_factory(Arc::new(NeverBuilds)))
            .option(AgentOption::node("alpha", [enactment("a:1")]))
            .build()
            .unwrap_err();

        assert_eq!(err.errors(), [ConfigError::NoClock]);
    }

    #[test]
    fn test_no_nodes() {
        let err = AgentBuilder::new().options(base()).build().unwrap_err();
        assert_eq!(err.errors(), [ConfigError::NoNodes]);
    }

    #[test]
    fn test_all_violations_reported_together() {
        let err = AgentBuilder::new()
            .option(AgentOption::node("c", []))
            .option(AgentOption::node("a", [NodeOption::priority(4)]))
            .option(AgentOption::node("b", []))
            .build()
            .unwrap_err();

        assert_eq!(
            err.errors(),
            [
                ConfigError::NoClock,
                ConfigError::NoActiveServices {
                    node_id: "a".to_string()
                },
                ConfigError::NoActiveServices {
                    node_id: "b".to_string()
                },
                ConfigError::NoActiveServices {
                    node_id: "c".to_string()
                },
                ConfigError::NoControllerFactory,
            ]
        );
    }

    #[test]
    fn test_later_options_override_earlier() {
        let agent = AgentBuilder::new()
            .options(base())
            .option(AgentOption::real_clock())
            .option(AgentOption::node(
                "alpha",
                [
                    NodeOption::priority(1),
                    enactment("old:1"),
                    enactment("new:2"),
                    NodeOption::priority(7),
                ],
            ))
            .build()
            .unwrap();

        let alpha = agent.node("alpha").unwrap();
        assert_eq!(alpha.priority, 7);
        assert_eq!(alpha.enactment.as_ref().unwrap().endpoint, "new:2");
    }

    #[test]
    fn test_same_node_id_replaces_node() {
        let err = AgentBuilder::new()
            .options(base())
            .option(AgentOption::node("alpha", [enactment("a:1")]))
            .option(AgentOption::node("alpha", []))
            .build()
            .unwrap_err();

        assert_eq!(err.nodes_without_services().collect::<Vec<_>>(), ["alpha"]);
    }

    #[test]
    fn test_dial_options_are_kept_in_order() {
        let opt = NodeOption::telemetry_service(
            "t:1",
            Arc::new(Driver),
            [
                DialOption::ConcurrencyLimit(1),
                DialOption::ConcurrencyLimit(2),
            ],
        );
        let NodeOption::Telemetry(svc) = opt else {
            panic!("expected telemetry option");
        };
        assert_eq!(
            svc.dial_options,
            [
                DialOption::ConcurrencyLimit(1),
                DialOption::ConcurrencyLimit(2)
            ]
        );
        assert!(svc.transport_endpoint().is_ok());
    }
}
