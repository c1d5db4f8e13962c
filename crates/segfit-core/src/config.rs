//! Heap configuration.
//!
//! Defaults reproduce the reference heap: an 18-page limit on a 2 KiB page.
//! Every knob can be overridden from the environment:
//! - `SEGFIT_MAX_PAGES`: maximum number of pages the arena may commit
//!   (`1..=MAX_HEAP_PAGES`).
//! - `SEGFIT_LOG_CAPACITY`: lifecycle records retained before the oldest is dropped.
//! - `SEGFIT_LOG_LEVEL`: minimum level recorded (`trace|debug|info|warn|error`).
//!
//! Unparseable values fall back to the default for that knob.

use serde::{Deserialize, Serialize};

use crate::malloc::{AllocatorLogLevel, MAX_HEAP_PAGES};

/// Default number of pages the heap may grow to.
pub const DEFAULT_MAX_PAGES: usize = 18;

/// Default number of lifecycle records kept in memory.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Allocator tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapConfig {
    /// Upper bound on pages the heap provider will hand out.
    pub max_pages: usize,
    /// Lifecycle records retained; 0 disables recording.
    pub log_capacity: usize,
    /// Records below this level are discarded.
    pub log_level: AllocatorLogLevel,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            log_capacity: DEFAULT_LOG_CAPACITY,
            log_level: AllocatorLogLevel::Trace,
        }
    }
}

impl HeapConfig {
    /// Reads overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup (the environment in production).
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let max_pages = lookup("SEGFIT_MAX_PAGES")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|pages| (1..=MAX_HEAP_PAGES).contains(pages))
            .unwrap_or(defaults.max_pages);
        let log_capacity = lookup("SEGFIT_LOG_CAPACITY")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(defaults.log_capacity);
        let log_level = lookup("SEGFIT_LOG_LEVEL")
            .and_then(|v| AllocatorLogLevel::from_str_loose(&v))
            .unwrap_or(defaults.log_level);
        Self {
            max_pages,
            log_capacity,
            log_level,
        }
    }

    /// Same config with a different page limit.
    #[must_use]
    pub const fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }
}
