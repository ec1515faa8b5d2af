//! Telemetry events and their text-frame encoding.
//!
//! A log event travels as the raw line. A progress event travels as a JSON
//! object tagged `"type": "progress"`. Subscribers forward frames verbatim,
//! so clients see exactly these two shapes.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::progress::Progress;
use crate::types::Timestamp;

/// One entry of the ephemeral log buffer, and of a job's durable `logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub line: String,
}

impl LogEntry {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            line: line.into(),
        }
    }
}

/// A single event observed on a job's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Log(String),
    Progress(Progress),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Progress(Progress),
}

impl TelemetryEvent {
    /// Encode as the text frame published on the channel.
    pub fn to_frame(&self) -> String {
        match self {
            Self::Log(line) => line.clone(),
            Self::Progress(progress) => encode_progress(progress),
        }
    }

    /// Decode a text frame. Anything that is not a progress object is a
    /// log line, including lines that happen to be JSON.
    pub fn from_frame(frame: &str) -> Self {
        if frame.starts_with('{') {
            if let Ok(Frame::Progress(progress)) = serde_json::from_str::<Frame>(frame) {
                return Self::Progress(progress);
            }
        }
        Self::Log(frame.to_string())
    }
}

/// Encode a progress snapshot as a tagged JSON frame.
pub fn encode_progress(progress: &Progress) -> String {
    // Serializing a plain struct of numbers and a unit enum cannot fail.
    serde_json::to_string(&Frame::Progress(progress.clone())).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Phase;
    use assert_matches::assert_matches;

    #[test]
    fn progress_frame_is_tagged() {
        let frame = encode_progress(&Progress::phase_only(Phase::Preparing));
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["phase"], "preparing");
        assert_eq!(value["eta_seconds"], 0.0);
    }

    #[test]
    fn frames_decode_back_to_events() {
        let progress = Progress {
            epoch: 2,
            total_epochs: 3,
            percent: 66.7,
            phase: Phase::Training,
            ..Progress::default()
        };
        let frame = TelemetryEvent::Progress(progress.clone()).to_frame();
        assert_eq!(TelemetryEvent::from_frame(&frame), TelemetryEvent::Progress(progress));

        let line = TelemetryEvent::Log("Epoch 1/3".into()).to_frame();
        assert_eq!(line, "Epoch 1/3");
        assert_matches!(TelemetryEvent::from_frame(&line), TelemetryEvent::Log(l) if l == "Epoch 1/3");
    }

    #[test]
    fn json_log_lines_stay_log_lines() {
        let frame = r#"{"type":"note","text":"hi"}"#;
        assert_matches!(TelemetryEvent::from_frame(frame), TelemetryEvent::Log(_));
    }

    #[test]
    fn log_entry_serializes_timestamp_and_line() {
        let entry = LogEntry::now("hello");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["line"], "hello");
        assert!(value["timestamp"].is_string());
    }
}
