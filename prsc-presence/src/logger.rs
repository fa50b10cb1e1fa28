//! Per-instance diagnostic switch over the `log` facade.

use std::fmt;

/// Emits `log` records under a module label, only when enabled.
///
/// Every `Presence` and `Channel` owns one, driven by the `debug` option.
/// Nothing in the protocol engine depends on whether it is on.
#[derive(Debug, Clone)]
pub struct Logger {
    enabled: bool,
    module: &'static str,
}

impl Logger {
    pub fn new(enabled: bool, module: &'static str) -> Self {
        Self { enabled, module }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn log(&self, args: fmt::Arguments<'_>) {
        if self.enabled {
            log::debug!(target: self.module, "{args}");
        }
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if self.enabled {
            log::warn!(target: self.module, "{args}");
        }
    }
}
