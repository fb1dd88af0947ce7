use crate::models::Cart;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reasons a cart can change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CartEventType {
    Load,
    ReLoad,
    AddArticle,
    RemoveArticle,
    ChangeQteArticle,
    ChangeDeliveryDate,
}

impl CartEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CartEventType::Load => "load",
            CartEventType::ReLoad => "reLoad",
            CartEventType::AddArticle => "addArticle",
            CartEventType::RemoveArticle => "removeArticle",
            CartEventType::ChangeQteArticle => "changeQteArticle",
            CartEventType::ChangeDeliveryDate => "changeDeliveryDate",
        }
    }
}

impl std::fmt::Display for CartEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cart changed: the event name plus an optional message and payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeCause {
    pub name: CartEventType,
    #[serde(rename = "msg", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ChangeCause {
    pub fn new(name: CartEventType) -> Self {
        Self {
            name,
            message: None,
            data: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach a serializable payload, e.g. the line item that was touched
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self, serde_json::Error> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }
}

/// Snapshot of one cart transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartChangeEvent {
    /// The cart before the change; `None` for the very first publish
    pub previous: Option<Cart>,
    pub current: Cart,
    pub cause: ChangeCause,
    pub timestamp: DateTime<Utc>,
}

impl CartChangeEvent {
    pub fn new(previous: Option<Cart>, current: Cart, cause: ChangeCause) -> Self {
        Self {
            previous,
            current,
            cause,
            timestamp: Utc::now(),
        }
    }

    pub fn event_type(&self) -> CartEventType {
        self.cause.name
    }
}
