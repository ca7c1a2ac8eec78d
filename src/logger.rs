//! The crate's `log::Log` backend. Everything logs through the `log` facade
//! with a subsystem target (`server`, `forwarder`, `axfr`, ...); this backend
//! adds per-target level overrides and the switch for the periodic metrics
//! report.

use std::io::Write;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct Logger {
    /// Level applied to targets without an override.
    level: LevelFilter,

    /// Per-target overrides, longest prefix first so the most specific one
    /// wins.
    overrides: Vec<(String, LevelFilter)>,

    /// Whether the `metrics` target is let through at all.
    metrics: bool,

    /// Process start, for the uptime stamp on every line.
    start: Instant,
}

impl Logger {
    pub fn new() -> Logger {
        Logger {
            level: LevelFilter::Info,
            overrides: Vec::new(),
            metrics: true,
            start: Instant::now(),
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Logger {
        self.level = level;
        self
    }

    pub fn with_metrics(mut self, metrics: bool) -> Logger {
        self.metrics = metrics;
        self
    }

    /// Overrides the level for one target prefix, e.g. to trace only the
    /// forwarder.
    pub fn with_target(mut self, target: &str, level: LevelFilter) -> Logger {
        self.overrides.push((target.to_string(), level));
        self.overrides.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    fn target_level(&self, target: &str) -> LevelFilter {
        self.overrides
            .iter()
            .find(|(prefix, _)| target.starts_with(prefix.as_str()))
            .map(|(_, level)| *level)
            .unwrap_or(self.level)
    }

    /// Installs the logger. MUST be called once at startup for any output to
    /// appear.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max = self
            .overrides
            .iter()
            .map(|(_, level)| *level)
            .max()
            .map_or(self.level, |level| level.max(self.level));
        log::set_max_level(max);
        log::set_boxed_logger(Box::new(self))
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new()
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if !self.metrics && metadata.target() == "metrics" {
            return false;
        }
        metadata.level() <= self.target_level(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let target = if record.target().is_empty() {
            record.module_path().unwrap_or("?")
        } else {
            record.target()
        };
        let uptime = self.start.elapsed();

        let mut out = std::io::stdout().lock();
        let _ = writeln!(
            out,
            "[{:>6}.{:03}] {:<5} {}: {}",
            uptime.as_secs(),
            uptime.subsec_millis(),
            record.level(),
            target,
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stdout().lock().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn metadata(target: &str, level: Level) -> Metadata<'_> {
        Metadata::builder().target(target).level(level).build()
    }

    #[test]
    fn default_level_gates_all_targets() {
        let logger = Logger::new().with_level(LevelFilter::Warn);
        assert!(logger.enabled(&metadata("server", Level::Warn)));
        assert!(!logger.enabled(&metadata("server", Level::Info)));
    }

    #[test]
    fn longest_target_prefix_wins() {
        let logger = Logger::new()
            .with_level(LevelFilter::Warn)
            .with_target("forwarder", LevelFilter::Info)
            .with_target("forwarder::resolve", LevelFilter::Trace);
        assert!(logger.enabled(&metadata("forwarder", Level::Info)));
        assert!(!logger.enabled(&metadata("forwarder", Level::Trace)));
        assert!(logger.enabled(&metadata("forwarder::resolve", Level::Trace)));
        assert!(!logger.enabled(&metadata("server", Level::Info)));
    }

    #[test]
    fn metrics_switch_silences_the_metrics_target_only() {
        let logger = Logger::new().with_metrics(false);
        assert!(!logger.enabled(&metadata("metrics", Level::Info)));
        assert!(logger.enabled(&metadata("server", Level::Info)));
    }
}
