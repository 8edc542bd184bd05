use {
    crate::{
        channel::{BusEvent, CONNECTION_COUNT_KEY},
        config::Config,
        metrics::SESSIONS_TOTAL,
        session::{ConnectionRegistry, Departure, Frame, SessionToken},
        shutdown::InstanceState,
        store::{MemoryStore, PubSubBus, RedisStore, SharedCounter},
    },
    log::{error, info},
    std::sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    tokio::sync::{mpsc, watch},
};

/// Everything one instance owns, built once at startup and shared by
/// reference with every component.
pub struct InstanceContext {
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub counter: Arc<dyn SharedCounter>,
    pub bus: Arc<dyn PubSubBus>,
    port: AtomicU16,
    state: watch::Sender<InstanceState>,
}

impl InstanceContext {
    pub fn new(
        config: Config,
        counter: Arc<dyn SharedCounter>,
        bus: Arc<dyn PubSubBus>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(InstanceState::Running);
        Arc::new(Self {
            port: AtomicU16::new(config.port),
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            counter,
            bus,
            state,
        })
    }

    /// Uses one store for both the counter and the bus.
    pub fn with_store<S>(config: Config, store: Arc<S>) -> Arc<Self>
    where
        S: SharedCounter + PubSubBus + 'static,
    {
        let counter: Arc<dyn SharedCounter> = store.clone();
        let bus: Arc<dyn PubSubBus> = store;
        Self::new(config, counter, bus)
    }

    /// Builds the store client named by the configured endpoint.
    pub fn connect(config: Config) -> anyhow::Result<Arc<Self>> {
        let endpoint = config.endpoint()?.to_owned();
        if config.uses_memory_store() {
            info!("Using in-process store; instances will not share state");
            return Ok(Self::with_store(config, Arc::new(MemoryStore::new())));
        }
        let store = RedisStore::new(&endpoint, config.retry_policy())?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// The port this instance reports: the bound port once listening.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub(crate) fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: InstanceState) {
        self.state.send_replace(state);
    }

    /// Admits a session: registers it locally, bumps the shared counter and
    /// announces the new count. Store failures leave the session usable.
    pub async fn open_session(&self) -> Option<(SessionToken, mpsc::Receiver<Frame>)> {
        let (token, frames) = self.registry.add()?;
        SESSIONS_TOTAL.inc();
        info!("Client connected ({})", token.id());

        match self.counter.increment(CONNECTION_COUNT_KEY).await {
            Ok(count) => self.publish_count(count).await,
            Err(error) => error!("Failed to increment connection count: {error}"),
        }
        Some((token, frames))
    }

    pub async fn close_session(&self, token: SessionToken) {
        let id = token.id();
        match token.release() {
            Departure::Reconciled => info!("Client {id} closed by shutdown"),
            Departure::Counted => {
                info!("Client disconnected ({id})");
                match self.counter.decrement(CONNECTION_COUNT_KEY).await {
                    Ok(count) => self.publish_count(count).await,
                    Err(error) => error!("Failed to decrement connection count: {error}"),
                }
            }
        }
    }

    async fn publish_count(&self, count: i64) {
        if let Err(error) = self.bus.publish(&BusEvent::CountUpdated(count)).await {
            error!("Failed to publish connection count {count}: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::channel::Channel,
        futures::StreamExt,
    };

    fn config() -> Config {
        Config {
            redis_endpoint: Some("memory://".into()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn connect_and_disconnect_track_net_count() {
        let store = Arc::new(MemoryStore::new());
        let a = InstanceContext::with_store(config(), Arc::clone(&store));
        let b = InstanceContext::with_store(config(), Arc::clone(&store));
        let mut updates = store.subscribe(&[Channel::ConnectionCountUpdated]).await.unwrap();

        let (first, _rx1) = a.open_session().await.unwrap();
        let (second, _rx2) = b.open_session().await.unwrap();
        let (third, _rx3) = b.open_session().await.unwrap();
        b.close_session(second).await;
        a.close_session(first).await;

        assert_eq!(store.get(CONNECTION_COUNT_KEY).await.unwrap(), Some(1));
        let seen: Vec<_> = updates.by_ref().take(5).collect().await;
        assert_eq!(
            seen,
            [1, 2, 3, 2, 1].map(BusEvent::CountUpdated).to_vec()
        );
        drop(third);
    }

    #[tokio::test]
    async fn store_outage_keeps_session_usable() {
        let store = Arc::new(MemoryStore::new());
        let ctx = InstanceContext::with_store(config(), Arc::clone(&store));
        store.set_available(false);

        let (token, _rx) = ctx.open_session().await.unwrap();
        assert_eq!(ctx.registry.count(), 1);
        ctx.close_session(token).await;
        assert_eq!(ctx.registry.count(), 0);
    }

    #[test]
    fn memory_endpoint_builds_context() {
        let ctx = InstanceContext::connect(config()).unwrap();
        assert_eq!(ctx.port(), 5555);
        assert_eq!(ctx.state(), InstanceState::Running);
    }

    #[test]
    fn missing_endpoint_fails_to_connect() {
        assert!(InstanceContext::connect(Config::default()).is_err());
    }
}
