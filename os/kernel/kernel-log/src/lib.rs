//! # Kernel Message Ring
//!
//! A [`log::Log`] sink that keeps the most recent records in memory, the way a
//! kernel message buffer does. Nothing is written anywhere; records are held
//! until someone reads them with [`RingLogger::records`] or takes them with
//! [`RingLogger::drain`].
//!
//! ## Overview
//!
//! ```text
//! log::warn!(target: "vmalloc", ...)
//!     ↓
//! RingLogger::log (level filter)
//!     ↓
//! SpinLock<VecDeque<LogLine>>   (oldest record dropped when full)
//!     ↓
//! records() / drain()
//! ```
//!
//! The ring is bounded. When it is full the oldest line is discarded and
//! [`RingLogger::dropped`] is incremented.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_log::RingLogger;
//! use log::LevelFilter;
//!
//! static KMSG: RingLogger = RingLogger::new(64, LevelFilter::Debug);
//!
//! KMSG.install().expect("logger already set");
//! log::warn!(target: "vmalloc", "out of vmalloc space");
//! assert!(KMSG.contains("vmalloc", "out of vmalloc space"));
//! ```
//!
//! ## Feature Flags
//!
//! * `enabled` (default): records are captured. Without it the sink accepts
//!   and discards everything, so callers can keep the logger wired in.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::SpinLock;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

/// One captured log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl core::fmt::Display for LogLine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Format: "[LEVEL] target: message"
        write!(f, "[{}] {}: {}", self.level, self.target, self.message)
    }
}

/// Bounded in-memory log sink.
pub struct RingLogger {
    max_level: LevelFilter,
    capacity: usize,
    lines: SpinLock<VecDeque<LogLine>>,
    dropped: AtomicUsize,
}

impl RingLogger {
    /// Create a ring keeping at most `capacity` records at or above `max_level`.
    #[must_use]
    pub const fn new(capacity: usize, max_level: LevelFilter) -> Self {
        Self {
            max_level,
            capacity,
            lines: SpinLock::new(VecDeque::new()),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Install this ring as the global logger. Call this once during early init.
    ///
    /// # Errors
    /// Fails if a global logger has already been set.
    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }

    /// Copy of every record currently held, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<LogLine> {
        self.lines.with_lock(|lines| lines.iter().cloned().collect())
    }

    /// Take every record currently held, oldest first.
    pub fn drain(&self) -> Vec<LogLine> {
        self.lines.with_lock(|lines| lines.drain(..).collect())
    }

    /// Whether a held record has this exact `target` and contains `needle`.
    #[must_use]
    pub fn contains(&self, target: &str, needle: &str) -> bool {
        self.lines.with_lock(|lines| {
            lines
                .iter()
                .any(|l| l.target == target && l.message.contains(needle))
        })
    }

    /// Number of records discarded because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, line: LogLine) {
        if self.capacity == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.lines.with_lock(|lines| {
            if lines.len() == self.capacity {
                lines.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            lines.push_back(line);
        });
    }
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !cfg!(feature = "enabled") || !self.enabled(record.metadata()) {
            return;
        }

        self.push(LogLine {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {
        // records are held in memory; nothing to flush
    }
}
