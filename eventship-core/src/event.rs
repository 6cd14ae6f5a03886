//! Event model
//!
//! Events are serialized once, when they enter the queue. From then on the
//! queue, storage and uploader only see the JSON text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Kind of analytics call that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Track,
    Screen,
    Identify,
    Group,
    Alias,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Track => "track",
            EventType::Screen => "screen",
            EventType::Identify => "identify",
            EventType::Group => "group",
            EventType::Alias => "alias",
        }
    }
}

/// A single analytics event as sent to the data plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,

    pub message_id: String,

    /// Filled from the client's persisted id when left empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Event name for track calls, screen name for screen calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,

    #[serde(default)]
    pub context: Map<String, Value>,

    pub original_timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event of the given type stamped with the current time
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            message_id: uuid::Uuid::new_v4().to_string(),
            anonymous_id: None,
            user_id: None,
            event: None,
            properties: Map::new(),
            context: Map::new(),
            original_timestamp: Utc::now(),
        }
    }

    /// Create a track event with the given name
    pub fn track(name: impl Into<String>) -> Self {
        Self {
            event: Some(name.into()),
            ..Self::new(EventType::Track)
        }
    }

    /// Create a screen event with the given screen name
    pub fn screen(name: impl Into<String>) -> Self {
        Self {
            event: Some(name.into()),
            ..Self::new(EventType::Screen)
        }
    }

    /// Create an identify event for a user
    pub fn identify(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::new(EventType::Identify)
        }
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_anonymous_id(mut self, anonymous_id: impl Into<String>) -> Self {
        self.anonymous_id = Some(anonymous_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Serialize to the compact JSON text stored in a batch
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_event_serialization() {
        let mut props = Map::new();
        props.insert("plan".to_string(), Value::from("pro"));
        let event = Event::track("Signed Up")
            .with_anonymous_id("anon-1")
            .with_properties(props);

        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "track");
        assert_eq!(json["event"], "Signed Up");
        assert_eq!(json["anonymousId"], "anon-1");
        assert_eq!(json["properties"]["plan"], "pro");
        assert!(json["messageId"].as_str().is_some());
        assert!(json["originalTimestamp"].as_str().is_some());
        assert!(json.get("userId").is_none());
    }

    #[test]
    fn test_identify_event() {
        let event = Event::identify("user-42");
        assert_eq!(event.event_type, EventType::Identify);
        assert_eq!(event.user_id.as_deref(), Some("user-42"));
        assert!(event.event.is_none());
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Event::track("a");
        let b = Event::track("a");
        assert_ne!(a.message_id, b.message_id);
    }
}
