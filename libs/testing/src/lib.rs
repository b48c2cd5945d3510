//! Test kit for sbi-agent.
//!
//! - [`ScriptedFactory`]: a controller factory whose controllers follow a
//!   per-node [`Behavior`] and record what happened to them.
//! - [`NoopEnactmentDriver`] / [`NoopTelemetryDriver`]: drivers that do nothing.
//! - [`CapturedLogs`]: a JSON log sink for asserting on emitted records.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sbi_agent::{
    metrics, ControllerError, ControllerFactory, ControllerSpec, EnactmentDriver, NodeController,
    StatsAccessor, TelemetryDriver,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

// =============================================================================
// Drivers
// =============================================================================

/// Enactment driver that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEnactmentDriver;

impl EnactmentDriver for NoopEnactmentDriver {
    fn name(&self) -> &str {
        "noop-enactment"
    }
}

/// Telemetry driver that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetryDriver;

impl TelemetryDriver for NoopTelemetryDriver {
    fn name(&self) -> &str {
        "noop-telemetry"
    }
}

// =============================================================================
// Scripted controllers
// =============================================================================

/// What a scripted node controller does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Return `Ok(())` immediately.
    Succeed,

    /// Return an error immediately.
    Fail(String),

    /// Fail to be constructed.
    FailConstruction(String),

    /// Wait for cancellation, then return `Ok(())`.
    WaitForCancel,

    /// Wait for cancellation, then return an error.
    WaitForCancelThenFail(String),

    /// Panic as soon as it runs.
    Panic(String),
}

impl Behavior {
    fn label(&self) -> &'static str {
        match self {
            Behavior::Succeed => "succeed",
            Behavior::Fail(_) => "fail",
            Behavior::FailConstruction(_) => "fail_construction",
            Behavior::WaitForCancel => "wait_for_cancel",
            Behavior::WaitForCancelThenFail(_) => "wait_for_cancel_then_fail",
            Behavior::Panic(_) => "panic",
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    specs: Vec<ControllerSpec>,
    started: Vec<String>,
    cancelled: Vec<String>,
    finished: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    journal: Mutex<Journal>,
    changed: Notify,
}

impl Shared {
    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut Journal)) {
        f(&mut self.journal());
        self.changed.notify_waiters();
    }
}

/// Controller factory driven by a per-node script.
///
/// Nodes without an explicit behavior use the default, which is
/// [`Behavior::WaitForCancel`] unless changed.
#[derive(Debug)]
pub struct ScriptedFactory {
    default: Behavior,
    behaviors: HashMap<String, Behavior>,
    shared: Arc<Shared>,
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self {
            default: Behavior::WaitForCancel,
            behaviors: HashMap::new(),
            shared: Arc::default(),
        }
    }
}

impl ScriptedFactory {
    /// Every node waits for cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for nodes without an explicit one.
    pub fn with_default(mut self, behavior: Behavior) -> Self {
        self.default = behavior;
        self
    }

    /// Behavior for one node.
    pub fn with_node(mut self, node_id: impl Into<String>, behavior: Behavior) -> Self {
        self.behaviors.insert(node_id.into(), behavior);
        self
    }

    /// Behavior scripted for `node_id`.
    pub fn behavior(&self, node_id: &str) -> &Behavior {
        self.behaviors.get(node_id).unwrap_or(&self.default)
    }

    /// Specs the factory was asked to build, in request order.
    pub fn specs(&self) -> Vec<ControllerSpec> {
        self.shared.journal().specs.clone()
    }

    /// Node ids the factory was asked to build, in request order.
    pub fn built(&self) -> Vec<String> {
        self.shared
            .journal()
            .specs
            .iter()
            .map(|s| s.node_id.clone())
            .collect()
    }

    /// Node ids whose controller started running, sorted.
    pub fn started(&self) -> Vec<String> {
        sorted(&self.shared.journal().started)
    }

    /// Node ids whose controller observed cancellation, sorted.
    pub fn cancelled(&self) -> Vec<String> {
        sorted(&self.shared.journal().cancelled)
    }

    /// Node ids whose controller returned, sorted.
    pub fn finished(&self) -> Vec<String> {
        sorted(&self.shared.journal().finished)
    }

    /// Wait until at least `n` controllers are running.
    pub async fn wait_started(&self, n: usize) {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.shared.journal().started.len() >= n {
                return;
            }
            changed.await;
        }
    }
}

fn sorted(ids: &[String]) -> Vec<String> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids
}

#[async_trait]
impl ControllerFactory for ScriptedFactory {
    async fn build(
        &self,
        spec: ControllerSpec,
    ) -> Result<Box<dyn NodeController>, ControllerError> {
        let behavior = self.behavior(&spec.node_id).clone();
        let node_id = spec.node_id.clone();
        self.shared.update(|j| j.specs.push(spec));

        if let Behavior::FailConstruction(msg) = behavior {
            return Err(ControllerError::failed(msg));
        }

        Ok(Box::new(ScriptedController {
            node_id,
            behavior,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct ScriptedController {
    node_id: String,
    behavior: Behavior,
    shared: Arc<Shared>,
}

impl ScriptedController {
    async fn wait_for_cancel(&self, token: &CancellationToken) {
        token.cancelled().await;
        let node_id = self.node_id.clone();
        self.shared.update(|j| j.cancelled.push(node_id));
    }
}

#[async_trait]
impl NodeController for ScriptedController {
    fn stats(&self) -> StatsAccessor {
        let node_id = self.node_id.clone();
        let behavior = self.behavior.label();
        metrics::accessor(move || json!({ "node_id": node_id, "behavior": behavior }))
    }

    async fn run(self: Box<Self>, token: CancellationToken) -> Result<(), ControllerError> {
        let node_id = self.node_id.clone();
        self.shared.update(|j| j.started.push(node_id.clone()));

        let result = match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(msg) => Err(ControllerError::failed(msg.clone())),
            Behavior::WaitForCancel => {
                self.wait_for_cancel(&token).await;
                Ok(())
            }
            Behavior::WaitForCancelThenFail(msg) => {
                self.wait_for_cancel(&token).await;
                Err(ControllerError::failed(msg.clone()))
            }
            Behavior::Panic(msg) => panic!("{msg}"),
            Behavior::FailConstruction(msg) => {
                Err(ControllerError::failed(format!("unexpected run: {msg}")))
            }
        };

        self.shared.update(|j| j.finished.push(node_id));
        result
    }
}

// =============================================================================
// Log capture
// =============================================================================

/// In-memory JSON log sink.
///
/// ```ignore
/// let (logs, _guard) = CapturedLogs::install();
/// agent.run(token).await?;
/// assert!(!logs.with_message("starting node controller").is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Capture every record emitted on this thread until the guard drops.
    ///
    /// Use with a current-thread runtime so spawned tasks log on this thread.
    pub fn install() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::TRACE)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(logs.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    /// Every captured record, parsed.
    pub fn records(&self) -> Vec<serde_json::Value> {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Records whose message equals `message`.
    pub fn with_message(&self, message: &str) -> Vec<serde_json::Value> {
        self.records()
            .into_iter()
            .filter(|r| r["fields"]["message"] == message)
            .collect()
    }
}

/// Writer handed out by [`CapturedLogs`].
#[derive(Debug)]
pub struct CapturedWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CapturedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedWriter {
            buf: Arc::clone(&self.buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_lookup_falls_back_to_default() {
        let factory = ScriptedFactory::new()
            .with_default(Behavior::Succeed)
            .with_node("beta", Behavior::Fail("boom".into()));

        assert_eq!(factory.behavior("alpha"), &Behavior::Succeed);
        assert_eq!(factory.behavior("beta"), &Behavior::Fail("boom".into()));
    }

    #[tokio::test]
    async fn test_wait_for_cancel_records_cancellation() {
        let factory = ScriptedFactory::new();
        let controller = factory
            .build(ControllerSpec {
                node_id: "alpha".to_string(),
                priority: 0,
                clock: Arc::new(sbi_agent::FakeClock::default()),
                enactment: None,
                telemetry: None,
            })
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        controller.run(token).await.unwrap();

        assert_eq!(factory.started(), ["alpha"]);
        assert_eq!(factory.cancelled(), ["alpha"]);
        assert_eq!(factory.finished(), ["alpha"]);
    }

    #[test]
    fn test_captured_logs_parse_json_lines() {
        let (logs, _guard) = CapturedLogs::install();
        tracing::info!(node_id = "alpha", "hello");

        let records = logs.with_message("hello");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["fields"]["node_id"], "alpha");
    }
}
