//! Host-scoped notifications.
//!
//! The engine reports progress to people through a [`Notifier`]. The
//! default [`TracingNotifier`] turns every notification into a tracing event
//! carrying the host as a field; a console front end can supply its own
//! implementation.

use std::fmt;

use tracing::{error, info, warn};

use super::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
            NotificationLevel::Success => "success",
        };
        write!(f, "{}", s)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, host: &Host, level: NotificationLevel, message: &str);

    fn info(&self, host: &Host, message: &str) {
        self.notify(host, NotificationLevel::Info, message);
    }

    fn warning(&self, host: &Host, message: &str) {
        self.notify(host, NotificationLevel::Warning, message);
    }

    fn error(&self, host: &Host, message: &str) {
        self.notify(host, NotificationLevel::Error, message);
    }

    fn success(&self, host: &Host, message: &str) {
        self.notify(host, NotificationLevel::Success, message);
    }
}

/// Notifier that emits tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, host: &Host, level: NotificationLevel, message: &str) {
        let host = host.to_fixed_string();
        match level {
            NotificationLevel::Info => info!(host = %host, "{}", message),
            NotificationLevel::Success => info!(host = %host, outcome = "success", "{}", message),
            NotificationLevel::Warning => warn!(host = %host, "{}", message),
            NotificationLevel::Error => error!(host = %host, "{}", message),
        }
    }
}

/// Builder for the summary sent after stopping components.
///
/// # Example
///
/// ```ignore
/// let message = StoppedComponentsMessage::new()
///     .with_component("svcA")
///     .with_component("svcC")
///     .build();
/// assert_eq!(message.as_deref(), Some("Components 'svcA' and 'svcC' have been stopped"));
/// ```
#[derive(Debug, Default)]
pub struct StoppedComponentsMessage {
    names: Vec<String>,
}

impl StoppedComponentsMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn with_components<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    /// The message text, or `None` when nothing was stopped.
    pub fn build(&self) -> Option<String> {
        match self.names.as_slice() {
            [] => None,
            [single] => Some(format!("Component '{}' has been stopped", single)),
            [init @ .., last] => Some(format!(
                "Components '{}' and '{}' have been stopped",
                init.join("', '"),
                last
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod stopped_message {
        use super::*;

        #[test]
        fn test_nothing_stopped_has_no_message() {
            assert_eq!(StoppedComponentsMessage::new().build(), None);
        }

        #[test]
        fn test_single_component() {
            let message = StoppedComponentsMessage::new().with_component("a").build();
            assert_eq!(message.as_deref(), Some("Component 'a' has been stopped"));
        }

        #[test]
        fn test_two_components() {
            let message = StoppedComponentsMessage::new()
                .with_components(["a", "b"])
                .build();
            assert_eq!(
                message.as_deref(),
                Some("Components 'a' and 'b' have been stopped")
            );
        }

        #[test]
        fn test_three_components() {
            let message = StoppedComponentsMessage::new()
                .with_components(["a", "b", "c"])
                .build();
            assert_eq!(
                message.as_deref(),
                Some("Components 'a', 'b' and 'c' have been stopped")
            );
        }
    }

    mod levels {
        use super::*;
        use crate::engine::testing::RecordingNotifier;

        #[test]
        fn test_helpers_forward_level() {
            let notifier = RecordingNotifier::default();
            let host = Host::new("web-1", "deploy");

            notifier.info(&host, "i");
            notifier.warning(&host, "w");
            notifier.error(&host, "e");
            notifier.success(&host, "s");

            let levels: Vec<_> = notifier.records().into_iter().map(|r| r.level).collect();
            assert_eq!(
                levels,
                vec![
                    NotificationLevel::Info,
                    NotificationLevel::Warning,
                    NotificationLevel::Error,
                    NotificationLevel::Success,
                ]
            );
        }

        #[test]
        fn test_tracing_notifier_accepts_every_level() {
            let host = Host::new("web-1", "deploy");
            let notifier = TracingNotifier;
            notifier.notify(&host, NotificationLevel::Error, "boom");
            notifier.success(&host, "done");
        }
    }
}
