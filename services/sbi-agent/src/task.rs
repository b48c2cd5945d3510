//! Instrumented task wrapper.
//!
//! A [`Task`] wraps a "run until cancelled" function and lets observability
//! concerns be layered around it without touching its result:
//!
//! ```text
//! Task::new(controller.run)
//!     .with_starting_stopping_logs("node controller", Level::DEBUG)  // innermost
//!     .with_log_field("node_id", "alpha")
//!     .with_span_attributes([SpanAttribute::new("sbi.node_id", "alpha")])
//!     .with_new_span("node_controller")                               // outermost
//! ```
//!
//! Each decorator wraps everything added before it. Outer decorators hand
//! context down to inner ones through [`TaskContext`]: log fields added by
//! `with_log_field` appear on the lifecycle records of an inner
//! `with_starting_stopping_logs`, and attributes from `with_span_attributes`
//! land on the span opened by an outer `with_new_span`.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;

use futures_util::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::{field, Instrument, Level, Span};

use crate::error::ControllerError;

/// Future returned by a running task.
pub type TaskFuture = BoxFuture<'static, Result<(), ControllerError>>;

type TaskFn = Box<dyn FnOnce(TaskContext) -> TaskFuture + Send + 'static>;

/// Emit an event at a level chosen at runtime.
macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {{
        let level: Level = $level;
        if level == Level::ERROR {
            tracing::error!($($arg)+)
        } else if level == Level::WARN {
            tracing::warn!($($arg)+)
        } else if level == Level::INFO {
            tracing::info!($($arg)+)
        } else if level == Level::DEBUG {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    }};
}

// =============================================================================
// Context
// =============================================================================

/// Static key/value fields attached to lifecycle records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFields(Vec<(&'static str, String)>);

impl LogFields {
    /// Set a field, replacing an earlier value for the same key.
    pub fn insert(&mut self, key: &'static str, value: impl fmt::Display) {
        let value = value.to_string();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Value of a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LogFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// A key/value attribute recorded on a task's span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanAttribute {
    pub key: Cow<'static, str>,
    pub value: String,
}

impl SpanAttribute {
    /// Create an attribute.
    pub fn new(key: impl Into<Cow<'static, str>>, value: impl fmt::Display) -> Self {
        Self {
            key: key.into(),
            value: value.to_string(),
        }
    }
}

struct SpanAttributes<'a>(&'a [SpanAttribute]);

impl fmt::Display for SpanAttributes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, attr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", attr.key, attr.value)?;
        }
        Ok(())
    }
}

/// Context handed from outer decorators to inner ones.
pub(crate) struct TaskContext {
    /// Cancellation scope of this task.
    pub token: CancellationToken,

    /// Fields for lifecycle records.
    pub fields: LogFields,

    /// Span opened by the nearest outer `with_new_span`, if any.
    pub span: Span,

    attributes: Vec<SpanAttribute>,
}

impl TaskContext {
    /// Fresh context for a task bound to `token`.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            fields: LogFields::default(),
            span: Span::none(),
            attributes: Vec::new(),
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// A runnable unit of work taking a cancellation scope and returning its
/// terminal result exactly once.
pub struct Task {
    f: TaskFn,
}

impl Task {
    /// Wrap a raw `(token) -> result` function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ControllerError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx: TaskContext| f(ctx.token).boxed()),
        }
    }

    /// Run the task bound to `token`.
    pub fn run(self, token: CancellationToken) -> TaskFuture {
        (self.f)(TaskContext::new(token))
    }

    fn wrap<G>(self, g: G) -> Self
    where
        G: FnOnce(TaskContext, TaskFn) -> TaskFuture + Send + 'static,
    {
        let inner = self.f;
        Self {
            f: Box::new(move |ctx| g(ctx, inner)),
        }
    }

    /// Log a "starting" record before the task runs and a "stopped" record,
    /// with the error if any, after it returns.
    ///
    /// Log fields not carried by the enclosing span are rendered together
    /// under `fields`.
    pub fn with_starting_stopping_logs(
        self,
        name: impl Into<Cow<'static, str>>,
        level: Level,
    ) -> Self {
        let name = name.into();
        self.wrap(move |ctx, inner| {
            async move {
                let fields = ctx.fields.clone();
                let extra = (!fields.is_empty()).then(|| field::display(&fields));
                event_at!(level, fields = extra, "starting {}", name);

                let result = inner(ctx).await;

                match &result {
                    Ok(()) => event_at!(level, fields = extra, "stopped {}", name),
                    Err(e) => event_at!(level, fields = extra, error = %e, "stopped {}", name),
                }
                result
            }
            .boxed()
        })
    }

    /// Attach a static field to the lifecycle records of inner decorators.
    ///
    /// If the span opened by an outer `with_span` declares `key`, the value
    /// is recorded there as its own field.
    pub fn with_log_field(self, key: &'static str, value: impl fmt::Display) -> Self {
        let value = value.to_string();
        self.wrap(move |mut ctx, inner| {
            if ctx.span.has_field(key) {
                ctx.span.record(key, value.as_str());
            } else {
                ctx.fields.insert(key, value);
            }
            inner(ctx)
        })
    }

    /// Record attributes on the span opened by an outer `with_span` or
    /// `with_new_span`.
    ///
    /// Attributes the span declares are recorded as their own fields; the
    /// rest are rendered together under `attributes`.
    pub fn with_span_attributes(self, attrs: impl IntoIterator<Item = SpanAttribute>) -> Self {
        let attrs: Vec<SpanAttribute> = attrs.into_iter().collect();
        self.wrap(move |mut ctx, inner| {
            for attr in attrs {
                if ctx.span.has_field(&*attr.key) {
                    ctx.span.record(&*attr.key, attr.value.as_str());
                } else {
                    ctx.attributes.push(attr);
                }
            }
            if !ctx.attributes.is_empty() {
                ctx.span
                    .record("attributes", field::display(SpanAttributes(&ctx.attributes)));
            }
            inner(ctx)
        })
    }

    /// Run the task inside a new span.
    ///
    /// Span names must be static, so `name` is carried as the span's
    /// `otel.name`, which OpenTelemetry layers use as the exported name.
    pub fn with_new_span(self, name: impl Into<Cow<'static, str>>) -> Self {
        let name = name.into();
        self.wrap(move |ctx, inner| {
            let span = tracing::info_span!(
                "task",
                otel.name = %name,
                attributes = field::Empty,
            );
            enter_span(ctx, inner, span)
        })
    }

    /// Run the task inside `span`.
    ///
    /// Declare fields as `field::Empty` to have inner `with_log_field` and
    /// `with_span_attributes` fill them in as separate keys.
    pub fn with_span(self, span: Span) -> Self {
        self.wrap(move |ctx, inner| enter_span(ctx, inner, span))
    }
}

fn enter_span(mut ctx: TaskContext, inner: TaskFn, span: Span) -> TaskFuture {
    ctx.span = span.clone();
    ctx.attributes.clear();
    inner(ctx).instrument(span).boxed()
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}
