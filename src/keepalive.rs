// Copyright 2020 Joyent, Inc.

//! Periodic Ping frames that keep idle connections from being reaped by
//! socket timeouts or middleboxes.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use slog::{debug, trace, warn};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::engine::EngineInner;
use crate::protocol::FastFrame;

pub(crate) async fn run(inner: Arc<EngineInner>, mut stop: watch::Receiver<bool>) {
    let period = inner.config.ping_interval().max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(inner.log, "keepalive started"; "interval_secs" => period.as_secs());

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let sent = ping_all(&inner).await;
                trace!(inner.log, "keepalive round"; "pinged" => sent);
            }
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(inner.log, "keepalive stopped");
}

/// Sends one Ping to every registered connection. Returns how many were
/// written successfully.
pub(crate) async fn ping_all(inner: &EngineInner) -> usize {
    let keys = inner.connections.get_keys();
    let pings = keys.iter().map(|key| async move {
        let conn = match inner.connections.open_element(key) {
            Some(conn) if !conn.is_terminated() => conn,
            _ => return false,
        };
        match conn.send(FastFrame::Ping).await {
            Ok(()) => {
                trace!(conn.log(), "sent keepalive ping");
                true
            }
            Err(e) => {
                warn!(conn.log(), "keepalive ping failed"; "err" => %e);
                false
            }
        }
    });

    join_all(pings).await.into_iter().filter(|sent| *sent).count()
}
