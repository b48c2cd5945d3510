//! Agent supervisor.
//!
//! [`Agent::run`] drives one controller task per configured node:
//!
//! ```text
//! Agent::run(token)
//!   ├─► register InstanceStats under "agent-<n>"   (removed on every exit path)
//!   ├─► for each node:
//!   │     ├─ child = token.child_token()
//!   │     ├─ factory.build(spec)       ── Err ──► RunError::Construction, nothing started
//!   │     ├─ stats.publish(node_id, controller.stats())
//!   │     └─ Task::new(controller.run) + logs, fields, span
//!   ├─► spawn every task on a JoinSet
//!   └─► wait for exactly N terminal results
//!         ├─ all Ok  ──► Ok(())
//!         └─ else    ──► RunError::Nodes(failures)
//! ```
//!
//! Every node gets to finish: one node failing neither cancels its siblings
//! nor cuts the wait short. Only the caller's token stops the cohort.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, warn, Level, Span};

use crate::clock::Clock;
use crate::config::{AgentBuilder, AgentOption, NodeConfig};
use crate::controller::{ControllerFactory, ControllerSpec};
use crate::error::{ConfigErrors, ControllerError, NodeFailure, NodeFailures, RunError};
use crate::metrics::{InstanceStats, StatsRegistry};
use crate::task::{SpanAttribute, Task};

/// Task name used for node controller lifecycle records.
pub const NODE_CONTROLLER_TASK: &str = "node controller";

/// Span name for node controller tasks.
pub const NODE_CONTROLLER_SPAN: &str = "node_controller";

/// Span attribute carrying the node id.
pub const NODE_ID_ATTRIBUTE: &str = "sbi.node_id";

/// A validated, immutable description of the nodes to supervise.
pub struct Agent {
    clock: Arc<dyn Clock>,
    nodes: BTreeMap<String, NodeConfig>,
    registry: Arc<StatsRegistry>,
    factory: Arc<dyn ControllerFactory>,
}

/// A node controller ready to be spawned.
struct PreparedNode {
    node_id: String,
    token: CancellationToken,
    task: Task,
}

impl Agent {
    /// Build an agent from `options`, applied in order.
    pub fn new(options: impl IntoIterator<Item = AgentOption>) -> Result<Self, ConfigErrors> {
        AgentBuilder::new().options(options).build()
    }

    /// Start an empty builder.
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub(crate) fn from_parts(
        clock: Arc<dyn Clock>,
        nodes: BTreeMap<String, NodeConfig>,
        registry: Arc<StatsRegistry>,
        factory: Arc<dyn ControllerFactory>,
    ) -> Self {
        Self {
            clock,
            nodes,
            registry,
            factory,
        }
    }

    /// The agent's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Configured node ids, sorted.
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    /// Configuration of one node.
    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.get(id)
    }

    /// Every configured node, in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.values()
    }

    /// Registry this agent reports live stats into.
    pub fn stats_registry(&self) -> &Arc<StatsRegistry> {
        &self.registry
    }

    /// Run every node controller until all of them have terminated.
    ///
    /// Cancelling `token` cancels every node; there is no other way to stop
    /// a node early and no timeout. Returns `Ok(())` only if every
    /// controller stopped cleanly.
    pub async fn run(&self, token: CancellationToken) -> Result<(), RunError> {
        let stats = Arc::new(InstanceStats::new());
        let registration = self
            .registry
            .register_scoped(next_instance_key(), Arc::clone(&stats));
        let instance = registration.key();

        info!(instance, nodes = self.nodes.len(), "Starting agent");

        let prepared = self.prepare(&token, &stats).await?;
        let cohort = prepared.len();

        let mut set = JoinSet::new();
        let mut names = HashMap::with_capacity(cohort);
        for node in prepared {
            let node_id = node.node_id.clone();
            let handle = set.spawn(run_node(node));
            names.insert(handle.id(), node_id);
        }

        let failures = wait_for_cohort(&mut set, names).await;

        info!(
            instance,
            nodes = cohort,
            failed = failures.len(),
            "Agent stopped"
        );

        match NodeFailures::join(failures) {
            None => Ok(()),
            Some(failures) => Err(RunError::Nodes(failures)),
        }
    }

    /// Build and instrument every node controller.
    ///
    /// Runs to completion before any task is spawned, so a construction
    /// failure leaves no node running.
    async fn prepare(
        &self,
        token: &CancellationToken,
        stats: &InstanceStats,
    ) -> Result<Vec<PreparedNode>, RunError> {
        let mut prepared = Vec::with_capacity(self.nodes.len());

        for node in self.nodes.values() {
            let child = token.child_token();

            let spec = ControllerSpec::for_node(node, &self.clock);
            let controller = self.factory.build(spec).await.map_err(|source| {
                error!(node_id = %node.id, error = %source, "Failed to build node controller");
                RunError::Construction {
                    node_id: node.id.clone(),
                    source,
                }
            })?;

            stats.publish(&node.id, controller.stats());

            let task = Task::new(move |token| controller.run(token))
                .with_starting_stopping_logs(NODE_CONTROLLER_TASK, Level::DEBUG)
                .with_log_field("node_id", &node.id)
                .with_span_attributes([SpanAttribute::new(NODE_ID_ATTRIBUTE, &node.id)])
                .with_span(node_controller_span());

            debug!(
                node_id = %node.id,
                priority = node.priority,
                enactment = node.enactment_enabled(),
                telemetry = node.telemetry_enabled(),
                "Node controller built"
            );

            prepared.push(PreparedNode {
                node_id: node.id.clone(),
                token: child,
                task,
            });
        }

        Ok(prepared)
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("clock", &self.clock)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

/// Span for a node controller task, with the node id as its own field.
fn node_controller_span() -> Span {
    tracing::info_span!(
        "task",
        otel.name = NODE_CONTROLLER_SPAN,
        node_id = field::Empty,
        sbi.node_id = field::Empty,
        attributes = field::Empty,
    )
}

/// Run one node task, turning a panic into its terminal error.
async fn run_node(node: PreparedNode) -> Result<(), ControllerError> {
    let PreparedNode { token, task, .. } = node;

    AssertUnwindSafe(task.run(token))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ControllerError::Panicked(panic_message(&*panic))))
}

/// Collect one terminal result per spawned task.
///
/// `names` maps each task id to its node id and holds exactly the tasks
/// still pending.
async fn wait_for_cohort(
    set: &mut JoinSet<Result<(), ControllerError>>,
    mut names: HashMap<tokio::task::Id, String>,
) -> Vec<NodeFailure> {
    let mut failures = Vec::new();

    while !names.is_empty() {
        let Some(joined) = set.join_next_with_id().await else {
            break;
        };

        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => {
                // Panics are caught in run_node, so only an abort or a
                // runtime shutdown gets here.
                let error = if e.is_panic() {
                    ControllerError::Panicked(e.to_string())
                } else {
                    ControllerError::Aborted(e.to_string())
                };
                (e.id(), Err(error))
            }
        };

        let node_id = names
            .remove(&id)
            .unwrap_or_else(|| format!("task-{id}"));
        let pending = names.len();

        match result {
            Ok(()) => {
                debug!(node_id = %node_id, pending, "Node controller terminated");
            }
            Err(error) => {
                warn!(node_id = %node_id, error = %error, pending, "Node controller failed");
                failures.push(NodeFailure { node_id, error });
            }
        }
    }

    failures
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique key for a running agent instance.
fn next_instance_key() -> String {
    format!("agent-{}", INSTANCE_COUNTER.fetch_add(1, Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::clock::FakeClock;
    use crate::config::NodeOption;
    use crate::controller::NodeController;
    use crate::driver::EnactmentDriver;
    use crate::metrics::StatsAccessor;

    #[derive(Debug)]
    struct Driver;

    impl EnactmentDriver for Driver {
        fn name(&self) -> &str {
            "test"
        }
    }

    /// Controller that waits for cancellation, then returns its scripted result.
    struct WaitController {
        fail: bool,
    }

    #[async_trait]
    impl NodeController for WaitController {
        fn stats(&self) -> StatsAccessor {
            Arc::new(|| json!({ "state": "running" }))
        }

        async fn run(self: Box<Self>, token: CancellationToken) -> Result<(), ControllerError> {
            token.cancelled().await;
            if self.fail {
                Err(ControllerError::failed("stopped badly"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct Factory {
        built: Mutex<Vec<ControllerSpec>>,
    }

    #[async_trait]
    impl ControllerFactory for Factory {
        async fn build(
            &self,
            spec: ControllerSpec,
        ) -> Result<Box<dyn NodeController>, ControllerError> {
            let fail = spec.node_id.starts_with("bad");
            self.built.lock().unwrap().push(spec);
            Ok(Box::new(WaitController { fail }))
        }
    }

    fn agent(factory: Arc<Factory>, registry: Arc<StatsRegistry>, ids: &[&str]) -> Agent {
        let mut options = vec![
            AgentOption::clock(Arc::new(FakeClock::default())),
            AgentOption::controller_factory(factory),
            AgentOption::stats_registry(registry),
        ];
        for id in ids {
            options.push(AgentOption::node(
                *id,
                [NodeOption::enactment_service("127.0.0.1:1", Arc::new(Driver), [])],
            ));
        }
        Agent::new(options).unwrap()
    }

    #[test]
    fn test_instance_keys_are_unique() {
        assert_ne!(next_instance_key(), next_instance_key());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_aborted_task_keeps_node_id() {
        let mut set = JoinSet::new();
        let mut names = HashMap::new();

        let alpha = set.spawn(std::future::pending::<Result<(), ControllerError>>());
        names.insert(alpha.id(), "alpha".to_string());
        let beta = set.spawn(async { Ok::<(), ControllerError>(()) });
        names.insert(beta.id(), "beta".to_string());

        alpha.abort();
        let failures = wait_for_cohort(&mut set, names).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].node_id, "alpha");
        assert!(matches!(failures[0].error, ControllerError::Aborted(_)));
    }

    #[tokio::test]
    async fn test_stats_published_while_running() {
        let factory = Arc::new(Factory::default());
        let registry = Arc::new(StatsRegistry::new());
        let agent = Arc::new(agent(Arc::clone(&factory), Arc::clone(&registry), &["a", "b"]));
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let agent = Arc::clone(&agent);
            let token = token.clone();
            async move { agent.run(token).await }
        });

        // Wait for the run to register its stats.
        while registry.is_empty() {
            tokio::task::yield_now().await;
        }
        let key = registry.keys().remove(0);
        let stats = registry.get(&key).unwrap();
        while stats.node_ids().len() < 2 {
            tokio::task::yield_now().await;
        }
        let mut expected = serde_json::Map::new();
        expected.insert(
            key.clone(),
            json!({ "a": { "state": "running" }, "b": { "state": "running" } }),
        );
        assert_eq!(registry.snapshot(), serde_json::Value::Object(expected));

        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(!registry.contains(&key));
    }

    #[tokio::test]
    async fn test_failing_node_reported_after_cancel() {
        let factory = Arc::new(Factory::default());
        let registry = Arc::new(StatsRegistry::new());
        let agent = agent(Arc::clone(&factory), Arc::clone(&registry), &["bad-1", "ok"]);

        let token = CancellationToken::new();
        token.cancel();

        let err = agent.run(token).await.unwrap_err();
        let failures = err.node_failures().unwrap();
        assert_eq!(failures.node_ids(), ["bad-1"]);
        assert!(registry.is_empty());

        let built = factory.built.lock().unwrap();
        assert_eq!(built.len(), 2);
        assert!(built.iter().all(|spec| spec.enactment.is_some()));
        assert!(built.iter().all(|spec| spec.telemetry.is_none()));
    }
}
