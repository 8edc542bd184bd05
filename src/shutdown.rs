//! Instance lifecycle and shutdown-time correction of the shared counter.
//!
//! On a termination signal the instance moves `Running -> Draining`, waits
//! the configured grace period, seals its registry, subtracts the sessions
//! it still owns from the shared counter and moves to `Stopped`. Sessions
//! observe `Stopped` and close; the listener is released once they do.
//!
//! The correction is a plain read-then-write (`GET`, then `SET`), not an
//! atomic decrement. Another instance mutating the counter between the two
//! round-trips can make the result drift; the grace period bounds that
//! window but does not close it.

use {
    crate::{
        channel::{BusEvent, CONNECTION_COUNT_KEY},
        context::InstanceContext,
        metrics::RECONCILED_SESSIONS,
        store::{SharedCounter, StoreError},
    },
    log::{error, info, warn},
    tokio::{sync::watch, time::sleep},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Draining,
    Stopped,
}

/// Counter value left after removing `local` sessions, never below zero.
pub fn reconciled_count(current: i64, local: usize) -> i64 {
    let local = i64::try_from(local).unwrap_or(i64::MAX);
    current.saturating_sub(local).max(0)
}

/// Subtracts `local` sessions from the shared counter and returns the value
/// written.
pub async fn reconcile_counter(
    counter: &dyn SharedCounter,
    local: usize,
) -> Result<i64, StoreError> {
    let current = counter.get(CONNECTION_COUNT_KEY).await?.unwrap_or(0);
    let value = reconciled_count(current, local);
    counter.set(CONNECTION_COUNT_KEY, value).await?;
    Ok(value)
}

/// Runs the drain sequence. Store failures are logged and the instance
/// stops regardless.
pub async fn drain_and_stop(ctx: &InstanceContext) {
    if ctx.state() != InstanceState::Running {
        warn!("Shutdown requested while {:?}, ignoring", ctx.state());
        return;
    }
    ctx.set_state(InstanceState::Draining);
    let grace = ctx.config.shutdown_grace();
    info!("Draining for {grace:?} before reconciling connection count");
    sleep(grace).await;

    let local = ctx.registry.seal();
    if local > 0 {
        match reconcile_counter(ctx.counter.as_ref(), local).await {
            Ok(value) => {
                RECONCILED_SESSIONS.inc_by(local as u64);
                info!("Reconciled {local} local sessions, connection count is now {value}");
                // Let the remaining instances show the corrected count.
                if let Err(error) = ctx.bus.publish(&BusEvent::CountUpdated(value)).await {
                    warn!("Failed to publish reconciled count: {error}");
                }
            }
            Err(error) => {
                error!("Failed to reconcile {local} sessions, shared count will drift: {error}");
            }
        }
    }

    ctx.set_state(InstanceState::Stopped);
    info!("Instance stopped accepting sessions");
}

/// Resolves once `state` reaches `Stopped`, or when its sender is gone.
pub async fn wait_until_stopped(state: &mut watch::Receiver<InstanceState>) {
    let _ = state
        .wait_for(|state| *state == InstanceState::Stopped)
        .await;
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                error!("Failed to listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
