use {
    crate::{
        broadcaster::Broadcaster,
        channel::{Channel, CONNECTION_COUNT_KEY},
        context::InstanceContext,
        metrics::{self, BUS_SUBSCRIBED},
        relay::MessageRelay,
        shutdown::{self, wait_until_stopped},
    },
    anyhow::Context,
    axum::{
        extract::{
            ws::{Message, WebSocket, WebSocketUpgrade},
            State,
        },
        http::Method,
        response::IntoResponse,
        routing::get,
        Json, Router,
    },
    futures::{SinkExt, StreamExt},
    log::{debug, error, info, warn},
    serde::Serialize,
    std::sync::Arc,
    tokio::{net::TcpListener, task::JoinHandle},
    tower_http::cors::CorsLayer,
};

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    port: u16,
}

pub fn build_router(ctx: Arc<InstanceContext>) -> anyhow::Result<Router> {
    let cors = CorsLayer::new()
        .allow_origin(ctx.config.cors_header()?)
        .allow_methods([Method::GET]);

    Ok(Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthcheck", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(ctx)
        .layer(cors))
}

/// A listening instance. Dropping the handle does not stop it; call
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    ctx: Arc<InstanceContext>,
    server: JoinHandle<std::io::Result<()>>,
    broadcaster: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.ctx.port()
    }

    pub fn context(&self) -> &Arc<InstanceContext> {
        &self.ctx
    }

    /// Drains, reconciles the shared counter and releases the listener.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        shutdown::drain_and_stop(&self.ctx).await;
        if let Some(broadcaster) = self.broadcaster {
            broadcaster.await.context("broadcaster task failed")?;
        }
        self.server
            .await
            .context("server task failed")?
            .context("server error")?;
        info!("Listener released");
        Ok(())
    }
}

/// Initializes the shared counter, binds the listener and subscribes to the
/// bus. Only a bind failure is an error; store problems degrade the
/// instance instead.
pub async fn start(ctx: Arc<InstanceContext>) -> anyhow::Result<ServerHandle> {
    metrics::register_metrics();

    match ctx.counter.ensure_initialized(CONNECTION_COUNT_KEY).await {
        Ok(true) => info!("Initialized {CONNECTION_COUNT_KEY} to 0"),
        Ok(false) => debug!("{CONNECTION_COUNT_KEY} already initialized"),
        Err(error) => error!("Failed to initialize {CONNECTION_COUNT_KEY}: {error}"),
    }

    let addr = ctx.config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let port = listener.local_addr()?.port();
    ctx.set_port(port);

    let broadcaster = match ctx.bus.subscribe(&Channel::ALL).await {
        Ok(events) => {
            info!("Subscribed to {} channels", Channel::ALL.len());
            let broadcaster = Broadcaster::new(Arc::clone(&ctx.registry), port);
            Some(tokio::spawn(broadcaster.run(
                Arc::clone(&ctx.bus),
                events,
                ctx.config.retry_policy(),
                ctx.watch_state(),
            )))
        }
        Err(error) => {
            BUS_SUBSCRIBED.set(0);
            error!(
                "Error subscribing to {:?}: {error}; running without cross-instance updates",
                Channel::ALL.map(Channel::name)
            );
            None
        }
    };

    let router = build_router(Arc::clone(&ctx))?;
    let mut state = ctx.watch_state();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { wait_until_stopped(&mut state).await })
            .await
    });
    info!("Server started at http://{}:{port}", ctx.config.host);

    Ok(ServerHandle {
        ctx,
        server,
        broadcaster,
    })
}

/// Serves until a termination signal, then shuts down gracefully.
pub async fn run(ctx: Arc<InstanceContext>) -> anyhow::Result<()> {
    let handle = start(ctx).await?;
    shutdown::termination_signal().await;
    handle.shutdown().await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<InstanceContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<InstanceContext>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some((token, mut frames)) = ctx.open_session().await else {
        debug!("Refusing session, instance is shutting down");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    };
    let id = token.id();
    let relay = MessageRelay::new(Arc::clone(&ctx.bus));
    let mut state = ctx.watch_state();

    loop {
        tokio::select! {
            _ = wait_until_stopped(&mut state) => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(error) = ws_tx.send(Message::Text(frame.to_string().into())).await {
                        debug!("Write to {id} failed: {error}");
                        break;
                    }
                }
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    relay.handle_frame(text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!("Read from {id} failed: {error}");
                    break;
                }
            },
        }
    }

    ctx.close_session(token).await;
}

async fn health_handler(State(ctx): State<Arc<InstanceContext>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        port: ctx.port(),
    })
}

async fn metrics_handler() -> String {
    metrics::gather_text()
}
