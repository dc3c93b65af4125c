//! Install-state events.
//!
//! The reconciler reports install attempts through [`EventSink`]. Events are
//! fire-and-forget operational signals; a lost event never affects
//! correctness, so `emit` is infallible by contract. Events carry version
//! and tenant identifiers only, never credentials.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Outcome classification of an install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventReason {
    InstallAgentVersion,
    FailedInstallAgentVersion,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::InstallAgentVersion => "InstallAgentVersion",
            EventReason::FailedInstallAgentVersion => "FailedInstallAgentVersion",
        }
    }
}

/// One install-state event, bound to the AgentCluster it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallEvent {
    pub reason: EventReason,
    pub message: String,
    pub namespace: String,
    pub name: String,
}

impl InstallEvent {
    /// Successful install of `version` for `tenant`.
    pub fn installed(namespace: &str, name: &str, version: &str, tenant: &str) -> Self {
        InstallEvent {
            reason: EventReason::InstallAgentVersion,
            message: format!("Installed agent version: {version} to tenant: {tenant}"),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Failed install attempt of `version` for `tenant`.
    pub fn failed(namespace: &str, name: &str, version: &str, tenant: &str) -> Self {
        InstallEvent {
            reason: EventReason::FailedInstallAgentVersion,
            message: format!("Failed to install agent version: {version} to tenant: {tenant}"),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Destination for install-state events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: InstallEvent);
}

/// Sink that writes events to the structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: InstallEvent) {
        match event.reason {
            EventReason::InstallAgentVersion => tracing::info!(
                reason = event.reason.as_str(),
                object = %format!("{}/{}", event.namespace, event.name),
                message = %event.message,
                "install event"
            ),
            EventReason::FailedInstallAgentVersion => tracing::warn!(
                reason = event.reason.as_str(),
                object = %format!("{}/{}", event.namespace, event.name),
                message = %event.message,
                "install event"
            ),
        }
    }
}

/// Sink that captures events for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<InstallEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InstallEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: InstallEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installed_event_message_shape() {
        let event = InstallEvent::installed("skald", "demo", "1.2.3.4-5", "abc12345");
        assert_eq!(event.reason, EventReason::InstallAgentVersion);
        assert_eq!(
            event.message,
            "Installed agent version: 1.2.3.4-5 to tenant: abc12345"
        );
    }

    #[test]
    fn test_failed_event_message_shape() {
        let event = InstallEvent::failed("skald", "demo", "latest", "abc12345");
        assert_eq!(event.reason, EventReason::FailedInstallAgentVersion);
        assert_eq!(
            event.message,
            "Failed to install agent version: latest to tenant: abc12345"
        );
    }

    #[test]
    fn test_recording_sink_captures_in_order() {
        let sink = RecordingSink::new();
        sink.emit(InstallEvent::installed("skald", "demo", "1", "t"));
        sink.emit(InstallEvent::failed("skald", "demo", "2", "t"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, EventReason::InstallAgentVersion);
        assert_eq!(events[1].reason, EventReason::FailedInstallAgentVersion);
    }
}
