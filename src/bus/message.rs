//! 总线消息与线上格式
//!
//! 线上格式为扁平 JSON：`{message_id, type, channel, payload, priority(1..4), timestamp, source?, target?, correlation_id?, metadata?}`。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// 常用频道名
pub mod channels {
    pub const AGENT_REQUESTS: &str = "agent.requests";
    pub const AGENT_RESPONSES: &str = "agent.responses";
    pub const SYSTEM_EVENTS: &str = "system.events";
    pub const SYSTEM_HEALTH: &str = "system.health";
    pub const PERFORMANCE: &str = "system.performance";
    pub const ERRORS: &str = "system.errors";
    pub const PLANNING: &str = "planning.updates";
    pub const ITERATION_PROGRESS: &str = "iteration.progress";
}

/// 四级优先级，数值越大越先出队
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Priority::Low),
            2 => Some(Priority::Normal),
            3 => Some(Priority::High),
            4 => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let level = u8::deserialize(deserializer)?;
        Priority::from_level(level)
            .ok_or_else(|| serde::de::Error::custom(format!("priority out of range: {}", level)))
    }
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    AgentRequest,
    AgentResponse,
    SystemEvent,
    PerformanceMetric,
    ErrorReport,
    PlanningUpdate,
    IterationProgress,
}

/// 发布后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub channel: String,
    pub payload: Value,
    pub priority: Priority,
    /// Unix 毫秒
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl BusMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// publish 的可选参数
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub metadata: Map<String, Value>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = BusMessage {
            message_id: "m1".into(),
            kind: MessageKind::AgentRequest,
            channel: channels::AGENT_REQUESTS.into(),
            payload: json!({"query": "weather"}),
            priority: Priority::Critical,
            timestamp: 1_700_000_000_000,
            source: Some("controller".into()),
            target: None,
            correlation_id: Some("c1".into()),
            metadata: Map::new(),
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], json!("agent_request"));
        assert_eq!(value["priority"], json!(4));
        assert!(value.get("target").is_none());
        assert!(value.get("metadata").is_none());
        assert_eq!(BusMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_priority_range_is_checked() {
        assert!(serde_json::from_str::<Priority>("0").is_err());
        assert!(serde_json::from_str::<Priority>("5").is_err());
        assert_eq!(serde_json::from_str::<Priority>("3").unwrap(), Priority::High);
        assert!(Priority::Critical > Priority::Low);
    }
}
