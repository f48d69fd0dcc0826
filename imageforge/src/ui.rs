//! User-facing progress sink.

use parking_lot::RwLock;
use tracing::{error, info};

/// Sink for progress and error messages shown to the person running a build.
///
/// Implementations must not fail: a message that cannot be delivered is
/// dropped.
pub trait Ui: Send + Sync {
    /// Reports progress.
    fn say(&self, message: &str);

    /// Reports an error.
    fn error(&self, message: &str);
}

/// A UI that writes messages through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingUi;

impl Ui for LoggingUi {
    fn say(&self, message: &str) {
        info!(target: "imageforge::ui", "==> {}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "imageforge::ui", "==> {}", message);
    }
}

/// The kind of message recorded by [`CollectingUi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLevel {
    /// Progress message.
    Say,
    /// Error message.
    Error,
}

/// A UI that records every message, for tests and embedding.
#[derive(Debug, Default)]
pub struct CollectingUi {
    messages: RwLock<Vec<(UiLevel, String)>>,
}

impl CollectingUi {
    /// Creates an empty collecting UI.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded messages.
    #[must_use]
    pub fn messages(&self) -> Vec<(UiLevel, String)> {
        self.messages.read().clone()
    }

    /// Returns recorded error messages.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.of_level(UiLevel::Error)
    }

    /// Returns recorded progress messages.
    #[must_use]
    pub fn said(&self) -> Vec<String> {
        self.of_level(UiLevel::Say)
    }

    fn of_level(&self, level: UiLevel) -> Vec<String> {
        self.messages
            .read()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Ui for CollectingUi {
    fn say(&self, message: &str) {
        self.messages.write().push((UiLevel::Say, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.messages.write().push((UiLevel::Error, message.to_string()));
    }
}
