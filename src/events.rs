//! Domain events exchanged between services.
//!
//! The wire body is the JSON envelope below. `payload` holds the
//! event-specific fields, e.g. for `post.deleted`:
//!
//! ```json
//! {
//!   "routingKey": "post.deleted",
//!   "entityId": "p1",
//!   "payload": { "postId": "p1", "userId": "u1", "mediaIds": ["m1", "m2"] },
//!   "emittedAt": "2024-05-01T10:00:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GateError, Result};

pub const POST_CREATED: &str = "post.created";
pub const POST_DELETED: &str = "post.deleted";

/// Typed body of a domain event
pub trait EventPayload: Serialize + DeserializeOwned {
    const ROUTING_KEY: &'static str;

    fn entity_id(&self) -> &str;
}

/// Immutable event envelope, serialized as the wire payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    routing_key: String,
    entity_id: String,
    payload: Map<String, Value>,
    emitted_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Wrap a typed payload, stamping it with the current time
    pub fn new<P: EventPayload>(payload: &P) -> Result<Self> {
        let entity_id = payload.entity_id().to_string();
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            other => {
                return Err(GateError::Decode(format!(
                    "Event payload must be a JSON object, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            routing_key: P::ROUTING_KEY.to_string(),
            entity_id,
            payload,
            emitted_at: Utc::now(),
        })
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| GateError::Decode(e.to_string()))
    }

    /// Deserialize the payload into its typed form
    pub fn payload_as<P: EventPayload>(&self) -> Result<P> {
        if self.routing_key != P::ROUTING_KEY {
            return Err(GateError::Decode(format!(
                "Expected a {} event, got {}",
                P::ROUTING_KEY,
                self.routing_key
            )));
        }
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| GateError::Decode(format!("Invalid {} payload: {}", P::ROUTING_KEY, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCreated {
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl EventPayload for PostCreated {
    const ROUTING_KEY: &'static str = POST_CREATED;

    fn entity_id(&self) -> &str {
        &self.post_id
    }
}

/// Carries every dependent id so consumers never call back to the producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDeleted {
    pub post_id: String,
    pub user_id: String,
    #[serde(default)]
    pub media_ids: Vec<String>,
}

impl EventPayload for PostDeleted {
    const ROUTING_KEY: &'static str = POST_DELETED;

    fn entity_id(&self) -> &str {
        &self.post_id
    }
}

/// Post lifecycle events, decoded by routing key
#[derive(Debug, Clone, PartialEq)]
pub enum PostEvent {
    Created(PostCreated),
    Deleted(PostDeleted),
}

impl PostEvent {
    pub fn from_event(event: &DomainEvent) -> Result<Self> {
        match event.routing_key() {
            POST_CREATED => event.payload_as().map(PostEvent::Created),
            POST_DELETED => event.payload_as().map(PostEvent::Deleted),
            other => Err(GateError::Decode(format!("Unknown routing key: {}", other))),
        }
    }
}
