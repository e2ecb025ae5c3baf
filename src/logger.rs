use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Installs (or clears, with `None`) the process-wide log sink. `level`
/// defaults to `info` when absent or unrecognised.
pub fn install_sink(sink: Option<Arc<dyn LogSink>>, level: Option<&str>) {
    LOGGER.install_sink(sink, level)
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

/// Receives formatted log lines. Called on whichever thread produced the
/// line, possibly while the stack lock is held, so implementations must not
/// call back into the bridge.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, breadcrumbs: BreadcrumbFlags);

    fn enabled_breadcrumbs(&self) -> BreadcrumbFlags {
        BreadcrumbFlags::ALL
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const CONN     = 0b0000_0001;
        const ENGINE   = 0b0000_0010;
        const WRITE    = 0b0000_0100;
        const REGISTRY = 0b0000_1000;
        const DRIVER   = 0b0001_0000;
        const PACKET   = 0b0010_0000;
        const ALL      = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone)]
struct LogSinkInner {
    sink: Arc<dyn LogSink>,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[fb-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<Arc<dyn LogSink>>, level: Option<&str>) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| {
            let breadcrumbs = sink.enabled_breadcrumbs();
            LogSinkInner {
                sink,
                breadcrumbs,
                min_level: level.map(LogLevel::from_str).unwrap_or(LogLevel::Info),
            }
        });
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let sink = self.sink.lock().clone();
        let Some(inner) = sink else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if !breadcrumbs.is_empty() {
            let label = label_for(breadcrumbs);
            format!("{} [{}] {}", self.prefix, label, message)
        } else {
            format!("{} {}", self.prefix, message)
        };
        inner.sink.log(level, &formatted, breadcrumbs);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::CONN) {
        "CONN"
    } else if flags.contains(BreadcrumbFlags::ENGINE) {
        "ENGINE"
    } else if flags.contains(BreadcrumbFlags::WRITE) {
        "WRITE"
    } else if flags.contains(BreadcrumbFlags::REGISTRY) {
        "REGISTRY"
    } else if flags.contains(BreadcrumbFlags::DRIVER) {
        "DRIVER"
    } else if flags.contains(BreadcrumbFlags::PACKET) {
        "PACKET"
    } else {
        "LOG"
    }
}

// ============================================================================
// Rate-Limited Error Logging
// ============================================================================
// Callback failures repeat per segment once a flow goes bad. Each category
// gets its own limiter so a noisy flow cannot hide unrelated failures.

/// Minimum interval between logs of the same error category (in milliseconds).
const RATE_LIMIT_INTERVAL_MS: u64 = 1000;

const CATEGORY_COUNT: usize = 6;

/// Error categories for rate-limited logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Native engine call returned an error code.
    EngineError,
    /// Handler refused a connection or failed to forward data.
    HandlerError,
    /// Data or a write arrived for a connection that is closing.
    StateConflict,
    /// No free socket or no handler for a new flow.
    Admission,
    /// Inbound packet failed validation.
    InvalidPacket,
    /// Event referenced a handle whose connection is gone.
    Dispatch,
}

impl ErrorCategory {
    fn index(self) -> usize {
        match self {
            Self::EngineError => 0,
            Self::HandlerError => 1,
            Self::StateConflict => 2,
            Self::Admission => 3,
            Self::InvalidPacket => 4,
            Self::Dispatch => 5,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::EngineError => "ENGINE_ERROR",
            Self::HandlerError => "HANDLER_ERROR",
            Self::StateConflict => "STATE_CONFLICT",
            Self::Admission => "ADMISSION",
            Self::InvalidPacket => "INVALID_PACKET",
            Self::Dispatch => "DISPATCH",
        }
    }
}

/// Uses atomic timestamps for lock-free rate limiting.
struct RateLimitedLogger {
    /// Last log time (unix millis) for each error category.
    last_log_times: [AtomicU64; CATEGORY_COUNT],
}

impl RateLimitedLogger {
    const fn new() -> Self {
        Self {
            last_log_times: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    /// Returns true if the log was emitted, false if rate-limited.
    fn try_log(&self, category: ErrorCategory, message: &str) -> bool {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let idx = category.index();
        let last = self.last_log_times[idx].load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < RATE_LIMIT_INTERVAL_MS {
            return false;
        }

        // Losing the exchange means another thread already logged this window.
        if self.last_log_times[idx]
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            warn(format!("[{}] {}", category.label(), message));
            true
        } else {
            false
        }
    }
}

static RATE_LIMITER: RateLimitedLogger = RateLimitedLogger::new();

/// Log an error with rate limiting to prevent log flooding.
/// Only one log per category per second will be emitted.
/// Returns true if the log was emitted, false if suppressed.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    RATE_LIMITER.try_log(category, &message.into())
}
