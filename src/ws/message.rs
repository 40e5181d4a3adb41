//! The wire envelope and the typed events carried through the hub.
//!
//! Every frame on the wire has the shape `{type, content, user_id?, time}`.
//! Inside the crate that shape is only used at the edges; the hub and the
//! publisher deal in [`Message`]s whose payload is a typed [`Event`].

use crate::ws::types::UserId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The raw JSON envelope exchanged with clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub time: i64,
}

/// Content of an `order` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: u64,
    pub status: String,
    pub message: String,
}

/// Content of a `promotion` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub title: String,
    pub content: String,
}

/// Content of a `stock_alert` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAlert {
    pub product_id: u64,
    pub product_name: String,
    pub stock: i64,
    pub message: String,
}

/// A typed event, one variant per message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    System(String),
    Order(OrderStatusChanged),
    Promotion(Promotion),
    StockAlert(StockAlert),
    Echo(Value),
    Pong(String),
    /// Any kind this crate does not know about. Kept as-is for forward compatibility.
    Custom { kind: String, content: Value },
}

impl Event {
    /// The `type` tag used on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Event::System(_) => "system",
            Event::Order(_) => "order",
            Event::Promotion(_) => "promotion",
            Event::StockAlert(_) => "stock_alert",
            Event::Echo(_) => "echo",
            Event::Pong(_) => "pong",
            Event::Custom { kind, .. } => kind,
        }
    }

    fn content(&self) -> serde_json::Result<Value> {
        match self {
            Event::System(text) | Event::Pong(text) => Ok(Value::String(text.clone())),
            Event::Order(order) => serde_json::to_value(order),
            Event::Promotion(promo) => serde_json::to_value(promo),
            Event::StockAlert(alert) => serde_json::to_value(alert),
            Event::Echo(value) => Ok(value.clone()),
            Event::Custom { content, .. } => Ok(content.clone()),
        }
    }

    /// Rebuilds a typed event from a wire `type` tag and its content.
    pub fn from_parts(kind: String, content: Value) -> serde_json::Result<Self> {
        Ok(match kind.as_str() {
            "system" => Event::System(serde_json::from_value(content)?),
            "order" => Event::Order(serde_json::from_value(content)?),
            "promotion" => Event::Promotion(serde_json::from_value(content)?),
            "stock_alert" => Event::StockAlert(serde_json::from_value(content)?),
            "echo" => Event::Echo(content),
            "pong" => Event::Pong(serde_json::from_value(content)?),
            _ => Event::Custom { kind, content },
        })
    }
}

/// Where a message should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    User(UserId),
    Broadcast,
}

/// An immutable, timestamped event ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub event: Event,
    pub user_id: Option<UserId>,
    /// Emission time in unix seconds.
    pub time: i64,
}

impl Message {
    /// A message stamped with the current time and no target user.
    pub fn new(event: Event) -> Self {
        Self {
            event,
            user_id: None,
            time: now_unix(),
        }
    }

    /// A message addressed to a single user.
    pub fn to_user(user_id: UserId, event: Event) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::new(event)
        }
    }

    pub fn target(&self) -> Target {
        match self.user_id {
            Some(user_id) => Target::User(user_id),
            None => Target::Broadcast,
        }
    }

    pub fn to_envelope(&self) -> serde_json::Result<Envelope> {
        Ok(Envelope {
            kind: self.event.kind().to_owned(),
            content: self.event.content()?,
            user_id: self.user_id,
            time: self.time,
        })
    }

    pub fn from_envelope(envelope: Envelope) -> serde_json::Result<Self> {
        Ok(Self {
            event: Event::from_parts(envelope.kind, envelope.content)?,
            user_id: envelope.user_id,
            time: envelope.time,
        })
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_envelope()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let envelope = Envelope::deserialize(deserializer)?;
        Message::from_envelope(envelope).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
