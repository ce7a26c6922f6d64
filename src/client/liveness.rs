//! Per-connection heartbeat sender and liveness checker.
//!
//! Both loops are bound to one connection epoch and exit on their own once
//! that epoch is no longer live.

use futures::SinkExt;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use super::{ClientSession, ConnectionState};
use crate::error::RelayError;
use crate::message::Message;

impl ClientSession {
    pub(super) async fn heartbeat_loop(self, epoch: u64) {
        let period = self.inner.config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.is_current(epoch) {
                return;
            }
            let client_id = self.client_id();
            if !self.send(Message::client_heartbeat(client_id.as_deref())).await {
                debug!(epoch, "client: heartbeat not sent");
            }
        }
    }

    /// Declares the connection lost when nothing has arrived within
    /// `connection_timeout` or a ping goes unanswered, and restarts a
    /// stalled heartbeat sender.
    pub(super) async fn liveness_loop(self, epoch: u64) {
        let config = &self.inner.config;
        let connection_timeout = config.connection_timeout;
        let stall_limit = config.heartbeat_interval * 2;
        let ping_interval = config.ping_interval;
        let check = config.liveness_check_interval;

        let mut ticker = interval_at(Instant::now() + check, check);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next_ping = Instant::now() + ping_interval;

        loop {
            ticker.tick().await;
            let Some((last_received, last_heartbeat_sent)) = self.liveness_marks(epoch) else {
                return;
            };
            let now = Instant::now();

            let silent = now.saturating_duration_since(last_received);
            if silent > connection_timeout {
                warn!(
                    epoch,
                    silent_ms = u64::try_from(silent.as_millis()).unwrap_or(u64::MAX),
                    "client: nothing received within connection timeout"
                );
                self.connection_lost(epoch, &RelayError::LivenessTimeout(connection_timeout));
                return;
            }

            if now.saturating_duration_since(last_heartbeat_sent) > stall_limit {
                warn!(epoch, "client: heartbeat sender stalled, restarting");
                self.restart_heartbeat(epoch);
            }

            if now >= next_ping {
                next_ping = now + ping_interval;
                if let Err(err) = self.ping(epoch).await {
                    self.connection_lost(epoch, &err);
                    return;
                }
            }
        }
    }

    /// `(last_received, last_heartbeat_sent)` while `epoch` is live.
    fn liveness_marks(&self, epoch: u64) -> Option<(Instant, Instant)> {
        let state = self.lock_state();
        (state.epoch == epoch && state.state == ConnectionState::Connected)
            .then_some((state.last_received, state.last_heartbeat_sent))
    }

    fn restart_heartbeat(&self, epoch: u64) {
        self.lock_state().last_heartbeat_sent = Instant::now();
        let handle = tokio::spawn(self.clone().heartbeat_loop(epoch));
        let stale = self.lock_tasks().heartbeat.replace(handle);
        if let Some(stale) = stale {
            stale.abort();
        }
    }

    /// Send a transport-level ping and wait for the pong.
    async fn ping(&self, epoch: u64) -> Result<(), RelayError> {
        let config = &self.inner.config;
        let (tx, rx) = oneshot::channel();
        *self.lock_pending_pong() = Some(tx);

        let sent = {
            let mut slot = self.inner.sink.lock().await;
            match slot.as_mut() {
                Some((current, sink)) if *current == epoch => {
                    Some(tokio::time::timeout(config.send_timeout, sink.send(WsMessage::Ping(Vec::new().into()))).await)
                }
                _ => None,
            }
        };
        match sent {
            // Connection already replaced; the new one has its own checker.
            None => return Ok(()),
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => return Err(RelayError::Transport(format!("ping failed: {e}"))),
            Some(Err(_)) => return Err(RelayError::Transport(format!("ping send timed out after {:?}", config.send_timeout))),
        }

        match tokio::time::timeout(config.ping_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            // Sender cleared by a concurrent teardown.
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                self.lock_pending_pong().take();
                Err(RelayError::LivenessTimeout(config.ping_timeout))
            }
        }
    }
}
