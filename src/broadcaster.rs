//! Turns bus traffic into frames for every session this instance owns.

use {
    crate::{
        channel::{BusEvent, Channel, ServerEvent},
        metrics::{BUS_MESSAGES_RECEIVED, BUS_SUBSCRIBED, EMIT_FAILURES, STORE_ERRORS},
        session::{ConnectionRegistry, Frame},
        shutdown::{wait_until_stopped, InstanceState},
        store::{BusStream, PubSubBus, RetryPolicy},
    },
    futures::StreamExt,
    log::{debug, error, info, warn},
    std::{sync::Arc, time::Duration},
    time::{format_description::well_known::Rfc3339, OffsetDateTime},
    tokio::{
        sync::{mpsc::error::TrySendError, watch},
        time::sleep,
    },
    uuid::Uuid,
};

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(50);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    port: u16,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, port: u16) -> Self {
        Self { registry, port }
    }

    /// Builds the frame for a bus event. Message ids and timestamps are
    /// stamped here, by each receiving instance.
    pub fn render(&self, event: BusEvent) -> ServerEvent {
        match event {
            BusEvent::CountUpdated(count) => ServerEvent::CountUpdate { count },
            BusEvent::NewMessage(message) => ServerEvent::NewMessage {
                id: Uuid::new_v4(),
                message,
                created_at: now_rfc3339(),
                port: self.port,
            },
        }
    }

    /// Queues the event to every local session and returns how many accepted
    /// it. A session whose queue is gone or full is dropped from the
    /// registry; its socket task closes once the queue drains.
    pub fn dispatch(&self, event: BusEvent) -> usize {
        let channel = event.channel();
        BUS_MESSAGES_RECEIVED
            .with_label_values(&[channel.name()])
            .inc();

        let frame: Frame = match serde_json::to_string(&self.render(event)) {
            Ok(json) => json.into(),
            Err(error) => {
                warn!("Failed to serialize {channel} event: {error}");
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, sender) in self.registry.senders() {
            match sender.try_send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    EMIT_FAILURES.inc();
                    warn!("{id} is not keeping up, treating it as disconnected");
                    self.registry.evict(id);
                }
                Err(TrySendError::Closed(_)) => {
                    EMIT_FAILURES.inc();
                    warn!("Emit to {id} failed, treating it as disconnected");
                    self.registry.evict(id);
                }
            }
        }
        debug!("{channel} delivered to {delivered} sessions");
        delivered
    }

    /// Handles bus events until the instance stops. A subscription that ends
    /// is replaced with a fresh one; messages published in between are lost.
    pub async fn run(
        self,
        bus: Arc<dyn PubSubBus>,
        mut events: BusStream,
        retry: RetryPolicy,
        mut state: watch::Receiver<InstanceState>,
    ) {
        BUS_SUBSCRIBED.set(1);
        loop {
            tokio::select! {
                _ = wait_until_stopped(&mut state) => break,
                event = events.next() => match event {
                    Some(event) => {
                        self.dispatch(event);
                    }
                    None => {
                        BUS_SUBSCRIBED.set(0);
                        error!("Bus subscription closed, cross-instance updates are paused");
                        match resubscribe(bus.as_ref(), retry, &mut state).await {
                            Some(stream) => {
                                events = stream;
                                BUS_SUBSCRIBED.set(1);
                                info!("Resubscribed to {} channels", Channel::ALL.len());
                            }
                            None => break,
                        }
                    }
                },
            }
        }
        info!("Broadcaster stopping");
    }
}

/// Subscribes again with capped exponential backoff. Returns `None` if the
/// instance stops first.
async fn resubscribe(
    bus: &dyn PubSubBus,
    retry: RetryPolicy,
    state: &mut watch::Receiver<InstanceState>,
) -> Option<BusStream> {
    let mut attempt = 0;
    loop {
        let delay = retry
            .delay(attempt)
            .clamp(RESUBSCRIBE_MIN_DELAY, RESUBSCRIBE_MAX_DELAY);
        tokio::select! {
            _ = wait_until_stopped(state) => return None,
            _ = sleep(delay) => {}
        }
        match bus.subscribe(&Channel::ALL).await {
            Ok(events) => return Some(events),
            Err(error) => {
                STORE_ERRORS.with_label_values(&["subscribe"]).inc();
                warn!("Resubscribe attempt {} failed: {error}", attempt + 1);
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            session::SESSION_QUEUE_CAPACITY,
            store::{MemoryStore, StoreError},
        },
        async_trait::async_trait,
        futures::stream,
        std::sync::atomic::{AtomicU32, Ordering},
        tokio::{sync::mpsc, time::timeout},
    };

    /// Hands out a subscription that ends immediately, then real ones.
    struct DroppingBus {
        store: MemoryStore,
        subscriptions: AtomicU32,
    }

    impl DroppingBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                store: MemoryStore::new(),
                subscriptions: AtomicU32::new(0),
            })
        }

        fn subscriptions(&self) -> u32 {
            self.subscriptions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PubSubBus for DroppingBus {
        async fn publish(&self, event: &BusEvent) -> Result<(), StoreError> {
            self.store.publish(event).await
        }

        async fn subscribe(&self, channels: &[Channel]) -> Result<BusStream, StoreError> {
            let result = if self.subscriptions() == 0 {
                Ok(stream::empty().boxed())
            } else {
                self.store.subscribe(channels).await
            };
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            result
        }
    }

    fn parse(frame: &Frame) -> ServerEvent {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn count_updates_reach_every_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_a, mut rx_a) = registry.add().unwrap();
        let (_b, mut rx_b) = registry.add().unwrap();
        let broadcaster = Broadcaster::new(Arc::clone(&registry), 5555);

        assert_eq!(broadcaster.dispatch(BusEvent::CountUpdated(2)), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(
                parse(&rx.try_recv().unwrap()),
                ServerEvent::CountUpdate { count: 2 }
            );
        }
    }

    #[test]
    fn messages_are_stamped_locally() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_a, mut rx) = registry.add().unwrap();
        let broadcaster = Broadcaster::new(Arc::clone(&registry), 6001);

        broadcaster.dispatch(BusEvent::NewMessage("hi".into()));

        match parse(&rx.try_recv().unwrap()) {
            ServerEvent::NewMessage {
                message,
                port,
                created_at,
                ..
            } => {
                assert_eq!(message, "hi");
                assert_eq!(port, 6001);
                assert!(OffsetDateTime::parse(&created_at, &Rfc3339).is_ok());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn failed_emit_unregisters_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_alive, _rx_alive) = registry.add().unwrap();
        let (_gone, rx_gone) = registry.add().unwrap();
        drop(rx_gone);
        let broadcaster = Broadcaster::new(Arc::clone(&registry), 5555);

        assert_eq!(broadcaster.dispatch(BusEvent::CountUpdated(1)), 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn lagging_session_is_unregistered() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_token, mut rx) = registry.add().unwrap();
        let broadcaster = Broadcaster::new(Arc::clone(&registry), 5555);

        for count in 0..SESSION_QUEUE_CAPACITY as i64 {
            assert_eq!(broadcaster.dispatch(BusEvent::CountUpdated(count)), 1);
        }
        assert_eq!(broadcaster.dispatch(BusEvent::CountUpdated(-1)), 0);
        assert_eq!(registry.count(), 0);

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, SESSION_QUEUE_CAPACITY);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn own_publish_is_delivered_once() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let (_token, mut rx) = registry.add().unwrap();
        let (state_tx, state_rx) = watch::channel(InstanceState::Running);

        let events = store.subscribe(&Channel::ALL).await.unwrap();
        let task = tokio::spawn(Broadcaster::new(Arc::clone(&registry), 5555).run(
            store.clone(),
            events,
            RetryPolicy::NONE,
            state_rx,
        ));

        store
            .publish(&BusEvent::NewMessage("hi".into()))
            .await
            .unwrap();
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(parse(&frame), ServerEvent::NewMessage { message, .. } if message == "hi"));

        state_tx.send_replace(InstanceState::Stopped);
        task.await.unwrap();
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn resubscribes_after_stream_ends() {
        let bus = DroppingBus::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (_token, mut rx) = registry.add().unwrap();
        let (state_tx, state_rx) = watch::channel(InstanceState::Running);

        let events = bus.subscribe(&Channel::ALL).await.unwrap();
        let task = tokio::spawn(Broadcaster::new(Arc::clone(&registry), 5555).run(
            bus.clone(),
            events,
            RetryPolicy::new(0, Duration::from_millis(10)),
            state_rx,
        ));

        timeout(Duration::from_secs(1), async {
            while bus.subscriptions() < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        bus.publish(&BusEvent::CountUpdated(3)).await.unwrap();
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse(&frame), ServerEvent::CountUpdate { count: 3 });

        state_tx.send_replace(InstanceState::Stopped);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stops_while_resubscribing() {
        let bus = DroppingBus::new();
        bus.store.set_available(false);
        let registry = Arc::new(ConnectionRegistry::new());
        let (state_tx, state_rx) = watch::channel(InstanceState::Running);

        let events = bus.subscribe(&Channel::ALL).await.unwrap();
        let task = tokio::spawn(Broadcaster::new(registry, 5555).run(
            bus.clone(),
            events,
            RetryPolicy::new(0, Duration::from_millis(10)),
            state_rx,
        ));

        timeout(Duration::from_secs(1), async {
            while bus.subscriptions() < 3 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        state_tx.send_replace(InstanceState::Stopped);
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
