use {
    crate::{
        channel::{BusEvent, ClientEvent},
        metrics::{MESSAGES_DROPPED, MESSAGES_RELAYED},
        store::PubSubBus,
    },
    log::{debug, error},
    std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relayed {
    Published,
    Empty,
    Malformed,
    Failed,
}

/// Forwards client messages to the bus.
///
/// Nothing is emitted locally: the sender's own instance delivers the
/// message when it comes back from the bus, like every other instance.
#[derive(Clone)]
pub struct MessageRelay {
    bus: Arc<dyn PubSubBus>,
}

impl MessageRelay {
    pub fn new(bus: Arc<dyn PubSubBus>) -> Self {
        Self { bus }
    }

    /// Handles one raw text frame from a client.
    pub async fn handle_frame(&self, raw: &str) -> Relayed {
        match serde_json::from_str::<ClientEvent>(raw) {
            Ok(ClientEvent::NewMessage { message }) => self.relay(message).await,
            Err(error) => {
                MESSAGES_DROPPED.with_label_values(&["malformed"]).inc();
                debug!("Ignoring client frame: {error}");
                Relayed::Malformed
            }
        }
    }

    /// Publishes `message` unless it is empty or absent. Drops are silent
    /// to the client.
    pub async fn relay(&self, message: Option<String>) -> Relayed {
        let Some(text) = message.filter(|text| !text.is_empty()) else {
            MESSAGES_DROPPED.with_label_values(&["empty"]).inc();
            return Relayed::Empty;
        };

        match self.bus.publish(&BusEvent::NewMessage(text)).await {
            Ok(()) => {
                MESSAGES_RELAYED.inc();
                Relayed::Published
            }
            Err(error) => {
                MESSAGES_DROPPED.with_label_values(&["store"]).inc();
                error!("Failed to publish message: {error}");
                Relayed::Failed
            }
        }
    }
}
