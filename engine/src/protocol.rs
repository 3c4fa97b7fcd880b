//! Wire protocol messages.
//!
//! All messages are JSON objects with a `type` field and camelCase field names.
//! Messages whose type is not part of the protocol are kept as raw JSON so they
//! can be routed to application handlers.

use crate::{
    change::{CreateChange, DeleteChange, UpdateChange},
    error::Result,
    Change, Error, Key, StoreName, Timestamp, Version,
};
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Request for all changes of a store after a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChanges {
    pub store_name: StoreName,
    /// Last timestamp already applied by the requester; `None` asks for everything
    #[serde(default)]
    pub since: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Header announcing how many changes follow for a `get-changes` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendingChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_name: Option<StoreName>,
    pub nr_of_records_to_sync: usize,
}

/// Positive acknowledgment of a change sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub store_name: StoreName,
    /// Key the change was sent under
    pub key: Key,
    /// Canonical key assigned by the server, when it differs from `key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_key: Option<Key>,
    pub new_version: Version,
    pub timestamp: Timestamp,
}

/// Negative acknowledgment of a change sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_name: Option<StoreName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    pub description: String,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `create`, `update` or `delete`
    Change(Change),
    GetChanges(GetChanges),
    SendingChanges(SendingChanges),
    Ok(Ack),
    Reject(Reject),
    /// Clears the server change log
    Reset,
    /// Delivered to server handlers when a connection opens
    Connect,
    /// Any message with a type outside the protocol
    Custom(Value),
}

impl Message {
    /// Parse a message from a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = match value.get("type") {
            Some(Value::String(s)) => s.clone(),
            _ => {
                return Err(Error::InvalidMessage(
                    "message has no string 'type' field".into(),
                ))
            }
        };
        let invalid = |e: serde_json::Error| Error::InvalidMessage(format!("{}: {}", kind, e));
        Ok(match kind.as_str() {
            "create" | "update" | "delete" => {
                Message::Change(serde_json::from_value(value).map_err(invalid)?)
            }
            "get-changes" => Message::GetChanges(serde_json::from_value(value).map_err(invalid)?),
            "sending-changes" => {
                Message::SendingChanges(serde_json::from_value(value).map_err(invalid)?)
            }
            "ok" => Message::Ok(serde_json::from_value(value).map_err(invalid)?),
            "reject" => Message::Reject(serde_json::from_value(value).map_err(invalid)?),
            "reset" => Message::Reset,
            "connect" => Message::Connect,
            _ => Message::Custom(value),
        })
    }

    /// Convert the message to its JSON value.
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Message::Change(change) => return Ok(serde_json::to_value(change)?),
            Message::GetChanges(m) => tagged("get-changes", m)?,
            Message::SendingChanges(m) => tagged("sending-changes", m)?,
            Message::Ok(m) => tagged("ok", m)?,
            Message::Reject(m) => tagged("reject", m)?,
            Message::Reset => serde_json::json!({"type": "reset"}),
            Message::Connect => serde_json::json!({"type": "connect"}),
            Message::Custom(value) => value.clone(),
        };
        Ok(value)
    }

    /// Parse a message from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| Error::InvalidMessage(e.to_string()))?;
        Self::from_value(value)
    }

    /// Serialize the message to JSON text.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    /// The message type as it appears on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Message::Change(change) => change.kind(),
            Message::GetChanges(_) => "get-changes",
            Message::SendingChanges(_) => "sending-changes",
            Message::Ok(_) => "ok",
            Message::Reject(_) => "reject",
            Message::Reset => "reset",
            Message::Connect => "connect",
            Message::Custom(value) => value.get("type").and_then(Value::as_str).unwrap_or(""),
        }
    }

    /// The store the message concerns, if any.
    pub fn store_name(&self) -> Option<&str> {
        match self {
            Message::Change(change) => Some(change.store_name().as_str()),
            Message::GetChanges(m) => Some(m.store_name.as_str()),
            Message::SendingChanges(m) => m.store_name.as_deref(),
            Message::Ok(m) => Some(m.store_name.as_str()),
            Message::Reject(m) => m.store_name.as_deref(),
            Message::Reset | Message::Connect => None,
            Message::Custom(value) => value.get("storeName").and_then(Value::as_str),
        }
    }

    pub fn create(change: CreateChange) -> Self {
        Message::Change(Change::Create(change))
    }

    pub fn update(change: UpdateChange) -> Self {
        Message::Change(Change::Update(change))
    }

    pub fn delete(change: DeleteChange) -> Self {
        Message::Change(Change::Delete(change))
    }

    /// Create a reject message.
    pub fn reject(
        store_name: Option<StoreName>,
        key: Option<Key>,
        description: impl Into<String>,
    ) -> Self {
        Message::Reject(Reject {
            store_name,
            key,
            description: description.into(),
        })
    }
}

impl From<Change> for Message {
    fn from(change: Change) -> Self {
        Message::Change(change)
    }
}

fn tagged<T: Serialize>(kind: &str, payload: &T) -> Result<Value> {
    let mut value = serde_json::to_value(payload)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("type".into(), Value::from(kind));
            Ok(value)
        }
        None => Err(Error::InvalidMessage(format!(
            "{} payload is not an object",
            kind
        ))),
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let value = self
            .to_value()
            .map_err(<S::Error as ser::Error>::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(<D::Error as de::Error>::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_protocol_messages() {
        let msg = Message::from_json(
            r#"{"type": "get-changes", "storeName": "roads", "since": null, "clientId": "c1"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::GetChanges(GetChanges {
                store_name: "roads".into(),
                since: None,
                client_id: Some("c1".into()),
            })
        );

        let msg = Message::from_json(r#"{"type": "sending-changes", "nrOfRecordsToSync": 3}"#)
            .unwrap();
        assert!(matches!(
            msg,
            Message::SendingChanges(SendingChanges { nr_of_records_to_sync: 3, store_name: None })
        ));

        let msg = Message::from_json(
            r#"{"type": "ok", "storeName": "roads", "key": "tmp", "newKey": 0, "newVersion": 0, "timestamp": 0}"#,
        )
        .unwrap();
        match msg {
            Message::Ok(ack) => {
                assert_eq!(ack.key, Key::from("tmp"));
                assert_eq!(ack.new_key, Some(Key::Int(0)));
            }
            other => panic!("expected ok, got {:?}", other),
        }

        assert_eq!(Message::from_json(r#"{"type": "reset"}"#).unwrap(), Message::Reset);
    }

    #[test]
    fn changes_parse_by_type() {
        let msg = Message::from_value(json!({
            "type": "delete",
            "storeName": "roads",
            "key": 3,
            "version": 2
        }))
        .unwrap();
        assert_eq!(msg.kind(), "delete");
        assert_eq!(msg.store_name(), Some("roads"));
    }

    #[test]
    fn unknown_types_are_custom() {
        let value = json!({"type": "auth", "storeName": "roads", "token": "abc"});
        let msg = Message::from_value(value.clone()).unwrap();
        assert_eq!(msg.kind(), "auth");
        assert_eq!(msg.store_name(), Some("roads"));
        assert_eq!(msg.to_value().unwrap(), value);
    }

    #[test]
    fn missing_type_is_invalid() {
        assert!(matches!(
            Message::from_value(json!({"storeName": "roads"})),
            Err(Error::InvalidMessage(_))
        ));
        assert!(matches!(
            Message::from_value(json!({"type": "ok", "key": 1})),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn serialize_tags_messages() {
        let msg = Message::SendingChanges(SendingChanges {
            store_name: Some("roads".into()),
            nr_of_records_to_sync: 2,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "sending-changes", "storeName": "roads", "nrOfRecordsToSync": 2})
        );

        let msg = Message::reject(Some("roads".into()), Some(Key::Int(1)), "version conflict");
        let parsed: Message = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);

        assert_eq!(Message::Connect.to_json().unwrap(), r#"{"type":"connect"}"#);
    }
}
