//! Per-module loggers for the engine and its collaborators.
//!
//! `RACETRAP_DEBUG` picks the loggers: `*` (or `1`, `true`) for all of them,
//! or a comma-separated list of names such as `session,ptrace,sync`.
//! `RACETRAP_DEBUG_VERBOSITY` (0-3, default 1) picks how much they say: 0
//! silences them, 2 adds per-trap detail, level 3 adds register dumps.
//!
//! Output goes to stderr of the controlling process. Loggers are never used
//! from inside the traced child.

use std::collections::HashSet;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// How verbose a message is. A message is printed when the configured
/// verbosity is at least its level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info = 1,
    Detail = 2,
    Dump = 3,
}

#[derive(Debug, PartialEq)]
enum Selection {
    Everything,
    Nothing,
    Named(HashSet<String>),
}

impl Selection {
    fn parse(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Selection::Nothing;
        };
        if matches!(value, "*" | "1" | "true") {
            return Selection::Everything;
        }
        let names: HashSet<String> =
            value.split(',').map(str::trim).filter(|n| !n.is_empty()).map(str::to_string).collect();
        if names.is_empty() {
            Selection::Nothing
        } else {
            Selection::Named(names)
        }
    }

    fn includes(&self, name: &str) -> bool {
        match self {
            Selection::Everything => true,
            Selection::Nothing => false,
            Selection::Named(names) => names.contains(name),
        }
    }
}

fn parse_verbosity(value: Option<&str>) -> u8 {
    value.and_then(|v| v.trim().parse::<u8>().ok()).map_or(1, |v| v.min(3))
}

struct Settings {
    selection: Selection,
    verbosity: u8,
}

fn settings() -> &'static Settings {
    static SETTINGS: OnceLock<Settings> = OnceLock::new();
    SETTINGS.get_or_init(|| Settings {
        selection: Selection::parse(env::var("RACETRAP_DEBUG").ok().as_deref()),
        verbosity: parse_verbosity(env::var("RACETRAP_DEBUG_VERBOSITY").ok().as_deref()),
    })
}

pub struct Logger {
    name: &'static str,
    enabled: bool,
    depth: AtomicUsize,
}

impl Logger {
    fn new(name: &'static str, enabled: bool) -> Self {
        Self { name, enabled, depth: AtomicUsize::new(0) }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Print `msg` if this logger is on and verbose enough for `level`.
    /// Multi-line messages get the prefix on every line.
    pub fn write(&self, level: Level, tag: &str, msg: &str) {
        if !self.enabled || settings().verbosity < level as u8 {
            return;
        }
        let indent = "  ".repeat(self.depth.load(Ordering::Relaxed));
        for line in msg.lines() {
            eprintln!("{}[{}] {}{}", indent, self.name, tag, line);
        }
    }

    /// Indent what follows, for output produced on behalf of an outer step.
    pub fn push_indent(&self) {
        if self.enabled {
            self.depth.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop_indent(&self) {
        if self.enabled {
            let _ = self.depth.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
        }
    }
}

/// Create a logger. It is on when `RACETRAP_DEBUG` selects `name`.
pub fn create_logger(name: &'static str) -> Logger {
    Logger::new(name, settings().selection.includes(name))
}

// The macros skip formatting entirely when the logger is off.

#[macro_export]
macro_rules! log {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.write($crate::debug::Level::Info, "", &format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_detail {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.write($crate::debug::Level::Detail, "", &format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_dump {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.write($crate::debug::Level::Dump, "  ", &format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_success {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.write($crate::debug::Level::Info, "OK: ", &format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_fail {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.write($crate::debug::Level::Info, "FAIL: ", &format!($($arg)*));
        }
    };
}
