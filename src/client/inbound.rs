//! Inbound half of a connection: frame listener and message routing.

use std::panic::AssertUnwindSafe;
use std::sync::PoisonError;

use futures::{FutureExt, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{ClientSession, RawHandler, WsSource};
use crate::error::RelayError;
use crate::message::{FIELD_CODE, Message};

impl ClientSession {
    /// Read frames until the transport fails or the epoch is replaced.
    pub(super) async fn listen(self, epoch: u64, mut source: WsSource) {
        loop {
            let frame = source.next().await;
            if !self.is_current(epoch) {
                return;
            }
            let reason = match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    self.handle_frame(text.as_str().as_bytes()).await;
                    continue;
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    self.handle_frame(&bytes).await;
                    continue;
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    self.touch();
                    let waiter = self.lock_pending_pong().take();
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(());
                    }
                    continue;
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Frame(_))) => {
                    self.touch();
                    continue;
                }
                Some(Ok(WsMessage::Close(frame))) => match frame {
                    Some(frame) => format!("closed by server: {} ({})", frame.reason.as_str(), u16::from(frame.code)),
                    None => "closed by server".to_owned(),
                },
                Some(Err(e)) => format!("receive failed: {e}"),
                None => "connection closed".to_owned(),
            };
            self.connection_lost(epoch, &RelayError::Transport(reason));
            return;
        }
    }

    fn touch(&self) {
        self.lock_state().last_received = Instant::now();
    }

    fn set_client_id(&self, client_id: Option<&String>) {
        if let Some(id) = client_id {
            self.lock_state().client_id = Some(id.clone());
        }
    }

    /// Route one text or binary frame. Frames that are not a UTF-8 JSON
    /// object go to the raw handlers untouched.
    async fn handle_frame(&self, raw: &[u8]) {
        self.touch();
        self.lock_stats().messages_received += 1;

        let max = self.inner.config.max_message_size;
        if raw.len() > max {
            let err = RelayError::Framing(format!("inbound message of {} bytes exceeds max {max}", raw.len()));
            warn!(error = %err, "client: oversized message dropped");
            self.lock_stats().record_error(&err);
            return;
        }

        let msg = match Message::parse(raw) {
            Ok(msg) => msg,
            Err(err) => {
                self.dispatch_raw(raw, &err).await;
                return;
            }
        };

        match &msg {
            Message::Heartbeat { .. } => debug!("client: heartbeat received"),
            Message::ConnectionEstablished { client_id, .. } => {
                self.set_client_id(client_id.as_ref());
                info!(client_id = client_id.as_deref().unwrap_or("-"), "client: connection established");
                self.spawn_flush();
                self.dispatch(&msg, false).await;
            }
            Message::Welcome { client_id, .. } => {
                self.set_client_id(client_id.as_ref());
                self.dispatch(&msg, false).await;
            }
            Message::Error { error, .. } => {
                warn!(error = %error, code = ?msg.get(FIELD_CODE), "client: server reported error");
                {
                    let mut stats = self.lock_stats();
                    stats.server_errors += 1;
                    stats.last_error = Some(error.clone());
                }
                self.dispatch(&msg, false).await;
            }
            Message::Handshake { .. } | Message::Custom { .. } | Message::Untyped { .. } => {
                self.dispatch(&msg, true).await;
            }
        }
    }

    async fn dispatch(&self, msg: &Message, warn_unhandled: bool) {
        let Some(kind) = msg.kind() else {
            warn!("client: message without type ignored");
            return;
        };
        let handlers = self.inner.handlers.read().unwrap_or_else(PoisonError::into_inner).snapshot(kind);
        if handlers.is_empty() {
            if warn_unhandled {
                warn!(kind, "client: no handler registered");
            }
            return;
        }

        let report = handlers.dispatch(kind, self.clone(), msg).await;
        if !report.is_clean() {
            let mut stats = self.lock_stats();
            stats.handler_errors += u64::try_from(report.failures.len()).unwrap_or(u64::MAX);
            stats.last_error = report.failures.last().cloned();
        }
    }

    /// Hand an unparseable frame to the raw handlers, or drop it.
    async fn dispatch_raw(&self, raw: &[u8], err: &RelayError) {
        let handlers: Vec<RawHandler> = self.inner.raw_handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        if handlers.is_empty() {
            warn!(error = %err, len = raw.len(), "client: unparseable message dropped");
            self.lock_stats().record_error(err);
            return;
        }
        for handler in handlers {
            let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler(raw.to_vec())));
            let outcome = match started {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "raw handler panicked".to_owned(),
            };
            error!(error = %failure, "client: raw handler failed");
            let mut stats = self.lock_stats();
            stats.handler_errors += 1;
            stats.last_error = Some(failure);
        }
    }
}
