//! Event model: a tagged payload behind a shared envelope.
//!
//! Every observation inside a run is one `Event`. The envelope carries
//! identity and timing; the payload variant carries the type-specific data.
//! Events serialize to canonical JSON: compact, UTF-8, stable key order
//! (serde_json's map is ordered, struct fields are emitted in declaration
//! order), so the same event always produces the same bytes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tags for every event kind in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStart,
    RunEnd,
    LlmCall,
    ToolCall,
    MemoryRead,
    MemoryWrite,
    Error,
    FinalAnswer,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::RunStart,
        EventType::RunEnd,
        EventType::LlmCall,
        EventType::ToolCall,
        EventType::MemoryRead,
        EventType::MemoryWrite,
        EventType::Error,
        EventType::FinalAnswer,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStart => "run_start",
            EventType::RunEnd => "run_end",
            EventType::LlmCall => "llm_call",
            EventType::ToolCall => "tool_call",
            EventType::MemoryRead => "memory_read",
            EventType::MemoryWrite => "memory_write",
            EventType::Error => "error",
            EventType::FinalAnswer => "final_answer",
            EventType::Custom => "custom",
        }
    }

    /// Stable slot used by per-type counters.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|t| t == self).expect("in ALL")
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope-level status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Error,
    Info,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Ok => "ok",
            EventStatus::Error => "error",
            EventStatus::Info => "info",
        }
    }
}

/// Terminal status a run can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Failed => "failed",
        }
    }
}

/// Type-specific payload, tagged with `type` in the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RunStart {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<String>,
    },
    RunEnd {
        final_status: RunOutcome,
    },
    LlmCall {
        model: String,
        /// A prompt string or an array of chat messages.
        prompt: Value,
        response: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
    },
    ToolCall {
        tool_name: String,
        tool_args: Value,
        tool_result: Value,
    },
    MemoryRead {
        memory_key: String,
        memory_value: Value,
        memory_type: String,
    },
    MemoryWrite {
        memory_key: String,
        memory_value: Value,
        memory_type: String,
        overwrite: bool,
    },
    Error {
        error_type: String,
        error_message: String,
        critical: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    FinalAnswer {
        answer: String,
    },
    Custom {
        name: String,
        payload: Value,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::RunStart { .. } => EventType::RunStart,
            EventPayload::RunEnd { .. } => EventType::RunEnd,
            EventPayload::LlmCall { .. } => EventType::LlmCall,
            EventPayload::ToolCall { .. } => EventType::ToolCall,
            EventPayload::MemoryRead { .. } => EventType::MemoryRead,
            EventPayload::MemoryWrite { .. } => EventType::MemoryWrite,
            EventPayload::Error { .. } => EventType::Error,
            EventPayload::FinalAnswer { .. } => EventType::FinalAnswer,
            EventPayload::Custom { .. } => EventType::Custom,
        }
    }

    /// Short label shown on the UI timeline without decoding the blob.
    pub fn display_name(&self) -> String {
        match self {
            EventPayload::RunStart { name, .. } => name.clone(),
            EventPayload::RunEnd { .. } => "Run End".to_string(),
            EventPayload::LlmCall { model, .. } => model.clone(),
            EventPayload::ToolCall { tool_name, .. } => tool_name.clone(),
            EventPayload::MemoryRead { memory_key, .. } => format!("Read: {memory_key}"),
            EventPayload::MemoryWrite { memory_key, .. } => format!("Write: {memory_key}"),
            EventPayload::Error { error_type, .. } => error_type.clone(),
            EventPayload::FinalAnswer { .. } => "Final Answer".to_string(),
            EventPayload::Custom { name, .. } => name.clone(),
        }
    }
}

/// One observation within a run. The envelope fields are shared by every
/// variant; `payload` is flattened next to them in the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic per run, stamped by the run context.
    pub event_id: u64,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<u64>,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Envelope keys, exempt from payload redaction.
pub const ENVELOPE_KEYS: [&str; 8] = [
    "event_id",
    "run_id",
    "parent_event_id",
    "timestamp_ms",
    "duration_ms",
    "status",
    "metadata",
    "type",
];

impl Event {
    pub fn new(run_id: impl Into<String>, event_id: u64, payload: EventPayload) -> Self {
        let status = match &payload {
            EventPayload::Error { .. } => EventStatus::Error,
            EventPayload::RunEnd {
                final_status: RunOutcome::Failed,
            } => EventStatus::Error,
            _ => EventStatus::Ok,
        };
        Self {
            event_id,
            run_id: run_id.into(),
            parent_event_id: None,
            timestamp_ms: now_ms(),
            duration_ms: None,
            status,
            metadata: Map::new(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Canonical compact JSON bytes.
    pub fn to_canonical_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Render a value that has no JSON form as a self-describing object instead
/// of failing serialization.
pub fn opaque_value(type_name: &str, repr: impl std::fmt::Display) -> Value {
    serde_json::json!({ "__type__": type_name, "__repr__": repr.to_string() })
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tool_event() -> Event {
        let mut ev = Event::new(
            "run-1",
            3,
            EventPayload::ToolCall {
                tool_name: "search".into(),
                tool_args: json!({"q": "x", "n": 5}),
                tool_result: json!({"hits": 1}),
            },
        );
        ev.parent_event_id = Some(1);
        ev.timestamp_ms = 1_700_000_000_000;
        ev
    }

    #[test]
    fn serializes_with_type_tag() {
        let ev = sample_tool_event();
        let v: Value = serde_json::from_slice(&ev.to_canonical_json().unwrap()).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["run_id"], "run-1");
        assert_eq!(v["event_id"], 3);
        assert_eq!(v["tool_name"], "search");
        assert_eq!(v["status"], "ok");
    }

    #[test]
    fn canonical_json_is_stable() {
        let ev = sample_tool_event();
        let a = ev.to_canonical_json().unwrap();
        let b = ev.to_canonical_json().unwrap();
        assert_eq!(a, b);
        assert!(!a.contains(&b' '), "canonical form has no whitespace");
    }

    #[test]
    fn round_trips_every_variant() {
        let payloads = vec![
            EventPayload::RunStart {
                name: "demo".into(),
                user_id: Some("u1".into()),
                session_id: None,
                parent_run_id: None,
            },
            EventPayload::RunEnd {
                final_status: RunOutcome::Completed,
            },
            EventPayload::LlmCall {
                model: "m".into(),
                prompt: json!([{"role": "user", "content": "hi"}]),
                response: json!("hello"),
                total_tokens: Some(12),
                latency_ms: None,
            },
            EventPayload::ToolCall {
                tool_name: "calc".into(),
                tool_args: json!({"a": 1}),
                tool_result: json!(2),
            },
            EventPayload::MemoryRead {
                memory_key: "k".into(),
                memory_value: json!({"v": true}),
                memory_type: "key_value".into(),
            },
            EventPayload::MemoryWrite {
                memory_key: "k".into(),
                memory_value: json!(null),
                memory_type: "vector".into(),
                overwrite: true,
            },
            EventPayload::Error {
                error_type: "Timeout".into(),
                error_message: "deadline exceeded".into(),
                critical: true,
                stack: Some("frame0\nframe1".into()),
            },
            EventPayload::FinalAnswer {
                answer: "42".into(),
            },
            EventPayload::Custom {
                name: "plan_step".into(),
                payload: json!({"step": 1}),
            },
        ];
        for (i, payload) in payloads.into_iter().enumerate() {
            let ev = Event::new("run-rt", i as u64, payload);
            let bytes = ev.to_canonical_json().unwrap();
            let back = Event::from_json_slice(&bytes).unwrap();
            assert_eq!(ev, back);
        }
    }

    #[test]
    fn error_payload_gets_error_status() {
        let ev = Event::new(
            "r",
            0,
            EventPayload::Error {
                error_type: "ValueError".into(),
                error_message: "bad".into(),
                critical: false,
                stack: None,
            },
        );
        assert_eq!(ev.status, EventStatus::Error);
        assert_eq!(ev.event_type(), EventType::Error);
    }

    #[test]
    fn display_names() {
        assert_eq!(
            EventPayload::MemoryRead {
                memory_key: "profile".into(),
                memory_value: json!(1),
                memory_type: "cache".into(),
            }
            .display_name(),
            "Read: profile"
        );
        assert_eq!(
            EventPayload::RunEnd {
                final_status: RunOutcome::Failed
            }
            .display_name(),
            "Run End"
        );
    }

    #[test]
    fn type_index_is_stable() {
        for (i, t) in EventType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
            assert_eq!(EventType::parse(t.as_str()), Some(*t));
        }
        assert_eq!(EventType::parse("bogus"), None);
    }

    #[test]
    fn opaque_value_shape() {
        let v = opaque_value("Instant", "Instant { .. }");
        assert_eq!(v["__type__"], "Instant");
        assert_eq!(v["__repr__"], "Instant { .. }");
    }
}
