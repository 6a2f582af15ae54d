// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::Write;
use std::sync::Arc;

use arc_swap::ArcSwap;
use slog::{o, Drain, Level, Logger};

/// Creates a logger which prints output as human readable text to the
/// terminal. Used by the daemon in foreground mode and by tests.
pub fn create_term_logger(level: Level) -> (Logger, slog_async::AsyncGuard) {
    let term_drain = slog_term::CompactFormat::new(slog_term::TermDecorator::new().build())
        .build()
        .fuse();

    let filter_drain = RuntimeLevelFilter::new(term_drain, level).fuse();

    // Ensure the logger is thread-safe
    let (async_drain, guard) = slog_async::Async::new(filter_drain)
        .thread_name("slog-async-logger".into())
        .build_with_guard();

    let logger = Logger::root(async_drain.fuse(), o!());

    (logger, guard)
}

/// Creates a JSON logger writing to the supplied destination, tagged with the
/// daemon name and source. This is the variant used when running under a
/// service manager.
pub fn create_logger<W>(
    name: &str,
    source: &str,
    level: Level,
    writer: W,
) -> (Logger, slog_async::AsyncGuard)
where
    W: Write + Send + Sync + 'static,
{
    let json_drain = slog_json::Json::new(writer)
        .add_default_keys()
        .build()
        .fuse();

    let filter_drain = RuntimeLevelFilter::new(json_drain, level).fuse();

    let (async_drain, guard) = slog_async::Async::new(filter_drain)
        .thread_name("slog-async-logger".into())
        .build_with_guard();

    let logger = Logger::root(
        async_drain.fuse(),
        o!("name" => name.to_string(), "source" => source.to_string(), "pid" => std::process::id().to_string()),
    );

    (logger, guard)
}

/// Map a verbosity name from the configuration file onto a slog level.
pub fn level_from_string(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::Trace),
        "debug" => Some(Level::Debug),
        "info" => Some(Level::Info),
        "warn" | "warning" => Some(Level::Warning),
        "error" => Some(Level::Error),
        "critical" => Some(Level::Critical),
        _ => None,
    }
}

/// Custom drain which allows changing the log level at runtime.
pub struct RuntimeLevelFilter<D> {
    drain: D,
    level: ArcSwap<Level>,
}

impl<D> RuntimeLevelFilter<D> {
    pub fn new(drain: D, level: Level) -> Self {
        RuntimeLevelFilter {
            drain,
            level: ArcSwap::from(Arc::new(level)),
        }
    }

    pub fn set_level(&self, level: Level) {
        self.level.store(Arc::new(level));
    }
}

impl<D> Drain for RuntimeLevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        let level = self.level.load();

        if record.level().is_at_least(**level) {
            self.drain.log(record, values).map(Some).map_err(Some)?;
        }

        Ok(None)
    }
}

/// Declare a `$name!()` macro returning the scope logger tagged with a
/// `subsystem` key, so every crate logs under its own subsystem:
///
/// ```ignore
/// logging::logger_with_subsystem!(sl, "monitor");
///
/// info!(sl!(), "channel open"; "path" => path);
/// ```
#[macro_export]
macro_rules! logger_with_subsystem {
    ($name: ident, $subsystem: expr) => {
        macro_rules! $name {
            () => {
                slog_scope::logger().new(slog::o!("subsystem" => $subsystem))
            };
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{info, warn};

    #[test]
    fn test_level_from_string() {
        assert_eq!(level_from_string("debug"), Some(Level::Debug));
        assert_eq!(level_from_string("WARN"), Some(Level::Warning));
        assert_eq!(level_from_string("bogus"), None);
    }

    #[test]
    fn test_runtime_level_filter() {
        let buffer = std::io::Cursor::new(Vec::new());
        let (logger, guard) = create_logger("vmmd", "test", Level::Info, buffer);

        info!(logger, "visible");
        warn!(logger, "also visible");

        drop(guard);
    }
}
