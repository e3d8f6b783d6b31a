//! Per-call state machine binding one emitted request to its response.
//!
//! ```text
//!            response
//! Pending ─────────────▶ Resolved
//!    │
//!    │ timer
//!    ▼
//! TimedOut   (one-shot listener removed before the error is returned)
//! ```
//!
//! Dropping a call that is still `Pending` (e.g. a losing RACE broadcast
//! branch) also removes its listener.

use crate::channel::Channel;
use crate::packet::{CorrelationId, ResponsePacket};
use crate::{Result, RpcError};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Pending,
    Resolved,
    TimedOut,
}

pub(crate) struct PendingCall {
    channel: Arc<dyn Channel>,
    id: CorrelationId,
    state: CallState,
    receiver: oneshot::Receiver<Value>,
}

impl PendingCall {
    /// Register the one-shot response listener for `id` on `channel`.
    pub(crate) fn arm(channel: Arc<dyn Channel>, id: CorrelationId) -> Self {
        let (sender, receiver) = oneshot::channel();
        let slot = Mutex::new(Some(sender));
        channel.once(
            id.as_str(),
            Arc::new(move |payload| {
                let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(sender) = sender {
                    let _ = sender.send(payload);
                }
            }),
        );
        Self {
            channel,
            id,
            state: CallState::Pending,
            receiver,
        }
    }

    /// Wait for the response or the timer, whichever comes first.
    pub(crate) async fn settle(
        mut self,
        fail_timeout: Duration,
        event_name: &str,
    ) -> Result<ResponsePacket> {
        match tokio::time::timeout(fail_timeout, &mut self.receiver).await {
            Ok(Ok(payload)) => {
                self.state = CallState::Resolved;
                ResponsePacket::from_payload(payload)
            }
            Ok(Err(_)) => {
                // Listener dropped without firing: the channel closed.
                self.state = CallState::Resolved;
                Err(RpcError::ChannelClosed)
            }
            Err(_) => {
                self.expire();
                Err(RpcError::Timeout {
                    event_name: event_name.to_string(),
                    after: fail_timeout,
                })
            }
        }
    }

    fn expire(&mut self) {
        self.state = CallState::TimedOut;
        self.channel.off(self.id.as_str());
        debug!(id = %self.id, "Pending call timed out, listener removed");
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.state == CallState::Pending {
            self.channel.off(self.id.as_str());
        }
    }
}
