//! Types shared between the worker side and the page side

use serde::{Deserialize, Serialize};

/// Synthetic header added to data responses answered from the cache.
pub const CACHE_MARKER_HEADER: &str = "x-from-cache";

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Full document load.
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// Relationship between the controlling worker and a newer installed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VersionState {
    #[default]
    NoWorker,
    ActiveOnly,
    WaitingForActivation,
    Activating,
}

impl VersionState {
    /// Whether a newer version is installed and not yet in control.
    pub fn has_pending_update(&self) -> bool {
        matches!(self, Self::WaitingForActivation | Self::Activating)
    }
}

/// Messages the page may post to a worker.
///
/// Wire form is `{"type": "SKIP_WAITING"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl WorkerMessage {
    /// Decode a posted message. Unknown shapes yield `None`.
    pub fn decode(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }

    /// Encode for posting.
    pub fn encode(&self) -> String {
        match self {
            Self::SkipWaiting => r#"{"type":"SKIP_WAITING"}"#.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_waiting_wire_format() {
        let msg = WorkerMessage::decode(r#"{"type":"SKIP_WAITING"}"#);
        assert_eq!(msg, Some(WorkerMessage::SkipWaiting));
        assert_eq!(
            WorkerMessage::decode(&WorkerMessage::SkipWaiting.encode()),
            Some(WorkerMessage::SkipWaiting)
        );
    }

    #[test]
    fn test_unknown_messages_ignored() {
        assert_eq!(WorkerMessage::decode(r#"{"type":"CLAIM"}"#), None);
        assert_eq!(WorkerMessage::decode("SKIP_WAITING"), None);
        assert_eq!(WorkerMessage::decode("{}"), None);
    }

    #[test]
    fn test_request_mode_serde() {
        let mode: RequestMode = serde_json::from_str("\"navigate\"").unwrap();
        assert_eq!(mode, RequestMode::Navigate);
        let mode: RequestMode = serde_json::from_str("\"no-cors\"").unwrap();
        assert_eq!(mode, RequestMode::NoCors);
    }

    #[test]
    fn test_pending_update() {
        assert!(!VersionState::ActiveOnly.has_pending_update());
        assert!(VersionState::WaitingForActivation.has_pending_update());
    }
}
