//! `tracing` layer that writes every event to the peer's JSONL file.

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::LogLine;
use super::writer::PeerLogWriter;

/// Filter used when neither the builder nor `RUST_LOG` sets one
pub const DEFAULT_FILTER: &str = "info,cardsync_core=debug";

/// Writes events as JSON lines, one file per peer instance
pub struct JsonlLayer {
    writer: Arc<PeerLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, peer: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(PeerLogWriter::new(logs_dir, peer)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn peer(&self) -> &str {
        self.writer.peer()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut line = LogLine::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.peer(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            line = line.with_fields(Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                line = line.with_span(spans.join(" > "));
            }
        }

        // Logging must never take the process down
        let _ = self.writer.write(&line);
    }
}

/// Collects an event's message and fields into JSON
#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// Installs the global subscriber: JSONL file plus optional console output
pub struct LoggingBuilder {
    logs_dir: PathBuf,
    peer: String,
    console_output: bool,
    env_filter: Option<String>,
}

impl LoggingBuilder {
    pub fn new(logs_dir: impl Into<PathBuf>, peer: impl Into<String>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            peer: peer.into(),
            console_output: true,
            env_filter: None,
        }
    }

    /// Only write the JSONL file
    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Filter directives, e.g. "cardsync_core=trace". Overrides `RUST_LOG`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Build just the file layer, for manual composition
    pub fn build_layer(&self) -> std::io::Result<JsonlLayer> {
        JsonlLayer::new(&self.logs_dir, &self.peer)
    }

    /// Install as the global default subscriber and return the log file path.
    ///
    /// Console output goes to stderr so it never interleaves with a REPL on
    /// stdout.
    pub fn init(self) -> std::io::Result<PathBuf> {
        let layer = self.build_layer()?;
        let path = layer.log_path().to_path_buf();

        let filter = match &self.env_filter {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        };
        let console = self.console_output.then(|| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .with(console)
            .try_init()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(path)
    }
}
