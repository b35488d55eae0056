//! Session-scoped logging context.
//!
//! Components receive a [`LogContext`] at construction instead of reaching
//! for global state; every record is tagged with the session label.

use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct LogContext {
    session: Arc<str>,
}

impl LogContext {
    pub fn new(session: impl Into<Arc<str>>) -> Self {
        Self {
            session: session.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Emits a record under `target` prefixed with the session label.
    pub fn emit(&self, level: log::Level, target: &str, args: fmt::Arguments<'_>) {
        log::log!(target: target, level, "[{}] {}", self.session, args);
    }

    pub fn debug(&self, target: &str, args: fmt::Arguments<'_>) {
        self.emit(log::Level::Debug, target, args);
    }

    pub fn info(&self, target: &str, args: fmt::Arguments<'_>) {
        self.emit(log::Level::Info, target, args);
    }

    pub fn warn(&self, target: &str, args: fmt::Arguments<'_>) {
        self.emit(log::Level::Warn, target, args);
    }

    pub fn error(&self, target: &str, args: fmt::Arguments<'_>) {
        self.emit(log::Level::Error, target, args);
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new("voxel_gi")
    }
}
