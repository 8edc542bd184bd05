//! Names and payloads that cross the shared store and the client sockets.

use {
    serde::{Deserialize, Serialize},
    thiserror::Error,
    uuid::Uuid,
};

/// Key holding the global connection count.
pub const CONNECTION_COUNT_KEY: &str = "chat:connection-count";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ConnectionCountUpdated,
    NewMessage,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::ConnectionCountUpdated, Channel::NewMessage];

    pub const fn name(self) -> &'static str {
        match self {
            Channel::ConnectionCountUpdated => "chat:connection-count-updated",
            Channel::NewMessage => "chat:new-message",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.name() == name)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message on unknown channel {0}")]
    UnknownChannel(String),
    #[error("count payload {0:?} is not an integer")]
    BadCount(String),
}

/// A message received from the bus, already decoded from its raw
/// channel/payload pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    CountUpdated(i64),
    NewMessage(String),
}

impl BusEvent {
    pub fn decode(channel: &str, payload: &str) -> Result<Self, DecodeError> {
        match Channel::from_name(channel) {
            Some(Channel::ConnectionCountUpdated) => payload
                .trim()
                .parse()
                .map(BusEvent::CountUpdated)
                .map_err(|_| DecodeError::BadCount(payload.to_owned())),
            Some(Channel::NewMessage) => Ok(BusEvent::NewMessage(payload.to_owned())),
            None => Err(DecodeError::UnknownChannel(channel.to_owned())),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            BusEvent::CountUpdated(_) => Channel::ConnectionCountUpdated,
            BusEvent::NewMessage(_) => Channel::NewMessage,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            BusEvent::CountUpdated(count) => count.to_string(),
            BusEvent::NewMessage(text) => text.clone(),
        }
    }
}

/// Frames pushed to every local session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chat:connection-count-updated")]
    CountUpdate { count: i64 },
    #[serde(rename = "chat:new-message")]
    NewMessage {
        id: Uuid,
        message: String,
        #[serde(rename = "createdAt")]
        created_at: String,
        port: u16,
    },
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "chat:new-message")]
    NewMessage {
        #[serde(default)]
        message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_count_updates() {
        assert_eq!(
            BusEvent::decode("chat:connection-count-updated", "12"),
            Ok(BusEvent::CountUpdated(12))
        );
        assert_eq!(
            BusEvent::decode("chat:connection-count-updated", "twelve"),
            Err(DecodeError::BadCount("twelve".into()))
        );
    }

    #[test]
    fn decodes_messages_verbatim() {
        assert_eq!(
            BusEvent::decode("chat:new-message", " hi "),
            Ok(BusEvent::NewMessage(" hi ".into()))
        );
    }

    #[test]
    fn rejects_unknown_channels() {
        assert!(matches!(
            BusEvent::decode("chat:other", "1"),
            Err(DecodeError::UnknownChannel(_))
        ));
    }

    #[test]
    fn server_event_wire_shape() {
        let frame = serde_json::to_value(ServerEvent::CountUpdate { count: 3 }).unwrap();
        assert_eq!(
            frame,
            serde_json::json!({"event": "chat:connection-count-updated", "data": {"count": 3}})
        );

        let id = Uuid::nil();
        let frame = serde_json::to_value(ServerEvent::NewMessage {
            id,
            message: "hi".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            port: 5555,
        })
        .unwrap();
        assert_eq!(frame["event"], "chat:new-message");
        assert_eq!(frame["data"]["createdAt"], "2026-01-01T00:00:00Z");
        assert_eq!(frame["data"]["port"], 5555);
        assert_eq!(frame["data"]["id"], id.to_string());
    }

    #[test]
    fn client_event_tolerates_missing_message() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"chat:new-message","data":{}}"#).unwrap();
        assert_eq!(event, ClientEvent::NewMessage { message: None });
    }
}
