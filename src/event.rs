use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Tag of a one-shot broadcast event.
///
/// A closed but extensible set: the overlay ignores tags it does not
/// recognize, so decoding an unknown tag yields [`EventTag::Unknown`]
/// instead of failing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventTag {
    /// A new flower was planted on the collaborative canvas.
    Bloom,
    /// A wishlist item was claimed or added.
    Wish,
    /// A guestbook message was submitted.
    Message,
    /// Any tag this build does not know about. Ignore, never reject.
    Unknown,
}

impl EventTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bloom => "bloom",
            Self::Wish => "wish",
            Self::Message => "message",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "bloom" => Self::Bloom,
            "wish" => Self::Wish,
            "message" => Self::Message,
            _ => Self::Unknown,
        }
    }
}

impl From<String> for EventTag {
    fn from(s: String) -> Self {
        Self::from_str(&s)
    }
}

impl From<EventTag> for String {
    fn from(tag: EventTag) -> Self {
        tag.as_str().to_string()
    }
}

/// A one-shot event fanned out to the current subscribers of a channel.
///
/// Transient: it exists only during fan-out and is never stored or
/// replayed. On the wire the tag and payload flatten into one object,
/// e.g. `{"type":"bloom","username":"Ann","imageUrl":"..."}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub tag: EventTag,
    /// Tag-specific display payload. Expected to be a JSON object.
    #[serde(flatten)]
    pub payload: Value,
    /// Unix timestamp of creation. Local to this process, not part of
    /// the wire shape.
    #[serde(skip_serializing, default = "now_secs")]
    pub created_at: f64,
}

impl BroadcastEvent {
    pub fn new(tag: EventTag, payload: Value) -> Self {
        Self {
            tag,
            payload,
            created_at: now_secs(),
        }
    }

    /// A `bloom` event: `username` planted a flower, optionally with an
    /// image attached.
    pub fn bloom(username: &str, image_url: Option<&str>) -> Self {
        let mut payload = json!({ "username": username });
        if let Some(url) = image_url {
            payload["imageUrl"] = json!(url);
        }
        Self::new(EventTag::Bloom, payload)
    }

    /// A `wish` event from the wishlist workflow.
    pub fn wish(username: &str) -> Self {
        Self::new(EventTag::Wish, json!({ "username": username }))
    }

    /// A `message` event from the guestbook workflow.
    pub fn message(username: &str, text: &str) -> Self {
        Self::new(
            EventTag::Message,
            json!({ "username": username, "text": text }),
        )
    }

    /// The `username` field of the payload, if present.
    pub fn username(&self) -> Option<&str> {
        self.payload.get("username").and_then(Value::as_str)
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_flat() {
        let event = BroadcastEvent::bloom("Ann", Some("https://img/1.webp"));
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "bloom");
        assert_eq!(wire["username"], "Ann");
        assert_eq!(wire["imageUrl"], "https://img/1.webp");
        assert!(wire.get("created_at").is_none());
    }

    #[test]
    fn decodes_known_tags() {
        let event: BroadcastEvent =
            serde_json::from_str(r#"{"type":"wish","username":"Guest"}"#).unwrap();
        assert_eq!(event.tag, EventTag::Wish);
        assert_eq!(event.username(), Some("Guest"));
    }

    #[test]
    fn unknown_tag_is_tolerated() {
        let event: BroadcastEvent =
            serde_json::from_str(r#"{"type":"confetti","username":"Ann"}"#).unwrap();
        assert_eq!(event.tag, EventTag::Unknown);
        assert_eq!(event.username(), Some("Ann"));
    }

    #[test]
    fn created_at_is_stamped() {
        let event = BroadcastEvent::wish("Ann");
        assert!(event.created_at > 0.0);
    }
}
