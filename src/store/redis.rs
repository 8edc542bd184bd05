use {
    crate::{
        channel::{BusEvent, Channel},
        metrics::STORE_ERRORS,
        store::{decode_or_log, BusStream, PubSubBus, RetryPolicy, SharedCounter, StoreError},
    },
    anyhow::Result,
    async_trait::async_trait,
    deadpool_redis::{
        redis::{self, AsyncCommands},
        Config, Connection, Pool, Runtime,
    },
    futures::StreamExt,
    log::{debug, info, warn},
};

fn unavailable(error: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

fn failed(op: &'static str, error: redis::RedisError) -> StoreError {
    STORE_ERRORS.with_label_values(&[op]).inc();
    unavailable(error)
}

/// Redis-backed counter and bus.
///
/// Commands go through a pooled connection; each subscription opens its own
/// dedicated pub/sub connection since a subscribed connection cannot issue
/// regular commands.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    retry: RetryPolicy,
}

impl RedisStore {
    pub fn new(redis_url: &str, retry: RetryPolicy) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;

        Ok(Self {
            pool,
            client,
            retry,
        })
    }

    async fn checkout(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(unavailable)
    }

    /// Checkout is retried; the command issued on the connection is not.
    async fn connection(&self) -> Result<Connection, StoreError> {
        self.retry
            .run("checkout", move || async move { self.checkout().await })
            .await
    }
}

fn parse_count(key: &str, raw: Option<String>) -> Result<Option<i64>, StoreError> {
    raw.map(|value| {
        value.trim().parse().map_err(|_| StoreError::Malformed {
            key: key.to_owned(),
            value,
        })
    })
    .transpose()
}

#[async_trait]
impl SharedCounter for RedisStore {
    async fn ensure_initialized(&self, key: &str) -> Result<bool, StoreError> {
        // SET NX: only the first of any number of racing instances writes.
        self.retry
            .run("ensure_initialized", move || async move {
                let mut conn = self.checkout().await?;
                conn.set_nx::<_, _, bool>(key, 0).await.map_err(unavailable)
            })
            .await
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        conn.incr(key, 1)
            .await
            .map_err(|error| failed("increment", error))
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        conn.decr(key, 1)
            .await
            .map_err(|error| failed("decrement", error))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let raw = self
            .retry
            .run("get", move || async move {
                let mut conn = self.checkout().await?;
                conn.get::<_, Option<String>>(key).await.map_err(unavailable)
            })
            .await?;
        parse_count(key, raw)
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.retry
            .run("set", move || async move {
                let mut conn = self.checkout().await?;
                conn.set::<_, _, ()>(key, value).await.map_err(unavailable)
            })
            .await
    }
}

#[async_trait]
impl PubSubBus for RedisStore {
    async fn publish(&self, event: &BusEvent) -> Result<(), StoreError> {
        let channel = event.channel().name();
        let mut conn = self.connection().await?;
        let receivers: i64 = conn
            .publish(channel, event.encode())
            .await
            .map_err(|error| failed("publish", error))?;
        debug!("Published to {channel}, {receivers} receivers");
        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<BusStream, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|error| failed("subscribe", error))?;
        for channel in channels {
            pubsub
                .subscribe(channel.name())
                .await
                .map_err(|error| failed("subscribe", error))?;
        }
        info!("{} channels subscribed", channels.len());

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_owned();
            match msg.get_payload::<String>() {
                Ok(payload) => decode_or_log(&channel, &payload),
                Err(error) => {
                    warn!("Unreadable payload on {channel}: {error}");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stored_counts() {
        assert_eq!(parse_count("k", None).unwrap(), None);
        assert_eq!(parse_count("k", Some("42".into())).unwrap(), Some(42));
        assert_eq!(parse_count("k", Some("-1".into())).unwrap(), Some(-1));
        assert!(matches!(
            parse_count("k", Some("abc".into())),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(RedisStore::new("not a url", RetryPolicy::NONE).is_err());
    }
}
