//! Structured log file via a tracing [`Layer`].
//!
//! [`JsonFileLayer`] captures each tracing event, formats it as a single
//! JSON line with a numeric severity (`10` trace … `50` error), and
//! appends it to the log file. The MainAgent error scanner tails this
//! file and picks up events with `level >= 50`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

/// Numeric severity assigned to error-level events. The scanner's
/// threshold lives in `supervisor`; both sides use this constant.
pub const ERROR_LEVEL: i64 = 50;

// ---------------------------------------------------------------------------
// Tracing layer
// ---------------------------------------------------------------------------

/// A [`tracing_subscriber::Layer`] that serialises events as JSON lines
/// and appends them to a file.
pub struct JsonFileLayer {
    file: Mutex<File>,
}

impl JsonFileLayer {
    /// Open (append) the log file at `path`, creating parent
    /// directories as needed.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl<S: Subscriber> Layer<S> for JsonFileLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut json = serde_json::json!({
            "time": chrono::Utc::now().timestamp_millis(),
            "level": level_num(meta.level()),
            "target": meta.target(),
            "msg": visitor.message.unwrap_or_default(),
        });
        if let Some(obj) = json.as_object_mut() {
            for (k, v) in visitor.fields {
                obj.insert(k, v);
            }
        }

        if let Ok(line) = serde_json::to_string(&json) {
            // Best-effort; a full disk must not take the process down.
            if let Ok(mut file) = self.file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

fn level_num(level: &Level) -> i64 {
    match *level {
        Level::ERROR => ERROR_LEVEL,
        Level::WARN => 40,
        Level::INFO => 30,
        Level::DEBUG => 20,
        Level::TRACE => 10,
    }
}

/// Install the global subscriber: env-filtered stderr output plus the
/// JSON file layer feeding the error scanner.
pub fn init_tracing(log_path: &Path, filter: &str) -> anyhow::Result<()> {
    let file_layer = JsonFileLayer::open(log_path)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

// ---------------------------------------------------------------------------
// Field visitor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let val = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(val);
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(val));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}
