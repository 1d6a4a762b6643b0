//! Log sinks.
//!
//! All instrumentation goes through `tracing`. Two sinks are configurable at
//! runtime with independent minimum levels: a formatted stderr writer and an
//! optional user callback receiving `(level, message)` pairs.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Minimum severity accepted by a sink. `Disable` suppresses everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum LogLevel {
    Disable = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn from_repr(value: u32) -> Self {
        match value {
            0 => Self::Disable,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Debug,
            _ => Self::Trace,
        }
    }

    fn of_event(meta: &Metadata<'_>) -> Self {
        match *meta.level() {
            tracing::Level::ERROR => Self::Error,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::INFO => Self::Info,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::TRACE => Self::Trace,
        }
    }
}

static STDERR_LEVEL: AtomicU32 = AtomicU32::new(LogLevel::Info as u32);
static CALLBACK_LEVEL: AtomicU32 = AtomicU32::new(LogLevel::Disable as u32);

type Callback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

static CALLBACK: Lazy<RwLock<Option<Callback>>> = Lazy::new(|| RwLock::new(None));

/// Set the minimum level for the stderr sink.
pub fn set_stderr_level(level: LogLevel) {
    STDERR_LEVEL.store(level as u32, Ordering::Relaxed);
}

pub fn stderr_level() -> LogLevel {
    LogLevel::from_repr(STDERR_LEVEL.load(Ordering::Relaxed))
}

/// Install (or remove) the callback sink and set its minimum level.
pub fn set_callback(level: LogLevel, callback: Option<Callback>) {
    CALLBACK_LEVEL.store(level as u32, Ordering::Relaxed);
    *CALLBACK.write() = callback;
}

pub fn callback_level() -> LogLevel {
    LogLevel::from_repr(CALLBACK_LEVEL.load(Ordering::Relaxed))
}

/// Install the subscriber stack. Idempotent; later calls are no-ops so tests
/// and repeated `init()` calls stay quiet.
pub fn install() {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
            LogLevel::of_event(meta) <= stderr_level()
        }));

    let callback = CallbackLayer.with_filter(tracing_subscriber::filter::filter_fn(|meta| {
        LogLevel::of_event(meta) <= callback_level()
    }));

    let _ = tracing_subscriber::registry().with(stderr).with(callback).try_init();
}

/// Forwards formatted event messages to the registered callback.
struct CallbackLayer;

impl<S: Subscriber> Layer<S> for CallbackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let guard = CALLBACK.read();
        let Some(callback) = guard.as_ref() else {
            return;
        };
        let mut message = MessageVisitor::default();
        event.record(&mut message);
        callback(LogLevel::of_event(event.metadata()), &message.text);
    }
}

#[derive(Default)]
struct MessageVisitor {
    text: String,
}

impl MessageVisitor {
    /// The message leads; other fields append as `key=value` pairs.
    fn push(&mut self, field: &Field, rendered: String) {
        if field.name() == "message" {
            if self.text.is_empty() {
                self.text = rendered;
            } else {
                self.text = format!("{rendered} {}", self.text);
            }
        } else {
            if !self.text.is_empty() {
                self.text.push(' ');
            }
            let _ = write!(self.text, "{}={rendered}", field.name());
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }
}
