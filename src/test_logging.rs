//! Leveled logging support for the test suites.
//!
//! Unit and integration tests call [`init_test_logging`] once, bracket their
//! bodies with [`test_phase!`](crate::test_phase) and
//! [`test_complete!`](crate::test_complete), and assert through
//! [`assert_with_log!`](crate::assert_with_log) so a failing run prints the
//! expected/actual pair alongside the phase markers. Verbosity is controlled
//! with the `TEST_LOG_LEVEL` environment variable (`error`, `warn`, `info`,
//! `debug`, `trace`); the default is `info`.

use std::fmt;
use std::sync::OnceLock;

/// Logging verbosity level for tests.
///
/// Levels are ordered from least to most verbose:
/// `Error < Warn < Info < Debug < Trace`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only errors and failures.
    Error,
    /// Warnings and above.
    Warn,
    /// General test progress.
    #[default]
    Info,
    /// Detailed per-assertion output.
    Debug,
    /// Everything.
    Trace,
}

impl TestLogLevel {
    /// Returns a human-readable name for the level.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Returns the level from the `TEST_LOG_LEVEL` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("TEST_LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for TestLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TestLogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

static LEVEL: OnceLock<TestLogLevel> = OnceLock::new();

/// Installs the test log level from the environment. Idempotent.
pub fn init_test_logging() {
    let _ = LEVEL.get_or_init(TestLogLevel::from_env);
}

/// Returns whether messages at `level` should be emitted.
#[must_use]
pub fn enabled(level: TestLogLevel) -> bool {
    level <= LEVEL.get().copied().unwrap_or_default()
}

/// Emits one formatted line at `level` if enabled. Prefer the macros.
pub fn emit(level: TestLogLevel, args: fmt::Arguments<'_>) {
    if enabled(level) {
        eprintln!("[{:>5}] {args}", level.name());
    }
}

/// Marks the start of a test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::test_logging::emit(
            $crate::test_logging::TestLogLevel::Info,
            format_args!("=== {} ===", $name),
        );
    };
}

/// Marks a test as complete.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::test_logging::emit(
            $crate::test_logging::TestLogLevel::Info,
            format_args!("--- {} ok ---", $name),
        );
    };
}

/// Asserts a condition, logging the expected/actual pair either way.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $what:expr, $expected:expr, $actual:expr) => {
        if $cond {
            $crate::test_logging::emit(
                $crate::test_logging::TestLogLevel::Debug,
                format_args!("ok: {} (value {:?})", $what, $actual),
            );
        } else {
            $crate::test_logging::emit(
                $crate::test_logging::TestLogLevel::Error,
                format_args!(
                    "FAILED: {}: expected {:?}, got {:?}",
                    $what, $expected, $actual
                ),
            );
            panic!(
                "{}: expected {:?}, got {:?}",
                $what, $expected, $actual
            );
        }
    };
}
