use {
    crate::{
        channel::{BusEvent, Channel},
        store::{decode_or_log, BusStream, PubSubBus, SharedCounter, StoreError},
    },
    async_trait::async_trait,
    dashmap::DashMap,
    futures::{future, StreamExt},
    log::warn,
    std::sync::atomic::{AtomicBool, Ordering},
    tokio::sync::broadcast,
    tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
};

const BUS_CAPACITY: usize = 1024;

/// In-process stand-in for the shared store.
///
/// Several instances holding the same `Arc<MemoryStore>` behave like
/// instances sharing one broker: they see the same counters and every
/// published message, including their own.
#[derive(Debug)]
pub struct MemoryStore {
    values: DashMap<String, i64>,
    bus: broadcast::Sender<(Channel, String)>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            values: DashMap::new(),
            bus,
            available: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the connection to the broker.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.check()?;
        let mut value = self.values.entry(key.to_owned()).or_insert(0);
        *value += delta;
        Ok(*value)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCounter for MemoryStore {
    async fn ensure_initialized(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut created = false;
        self.values.entry(key.to_owned()).or_insert_with(|| {
            created = true;
            0
        });
        Ok(created)
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, 1)
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, -1)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check()?;
        Ok(self.values.get(key).map(|value| *value))
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.check()?;
        self.values.insert(key.to_owned(), value);
        Ok(())
    }
}

#[async_trait]
impl PubSubBus for MemoryStore {
    async fn publish(&self, event: &BusEvent) -> Result<(), StoreError> {
        self.check()?;
        // No subscribers is not an error: the message is simply lost.
        let _ = self.bus.send((event.channel(), event.encode()));
        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<BusStream, StoreError> {
        self.check()?;
        let wanted = channels.to_vec();
        let stream = BroadcastStream::new(self.bus.subscribe()).filter_map(move |item| {
            let event = match item {
                Ok((channel, payload)) if wanted.contains(&channel) => {
                    decode_or_log(channel.name(), &payload)
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Bus subscriber lagged, {skipped} messages lost");
                    None
                }
            };
            future::ready(event)
        });
        Ok(stream.boxed())
    }
}
