//! Fan-out of state snapshots between windows of the same process.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Snapshots buffered per channel before slow receivers start lagging.
const CHANNEL_CAPACITY: usize = 64;

const ORIGIN_ID_BYTES: usize = 12;

/// One full-state broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    /// Id of the container that produced the snapshot.
    pub origin: String,
    pub state: Value,
}

pub trait SyncTransport: Send + Sync {
    fn publish(&self, channel: &str, envelope: SyncEnvelope);

    /// Envelopes published on `channel` from now on, including our own.
    fn subscribe(&self, channel: &str) -> BoxStream<'static, SyncEnvelope>;
}

/// In-process transport with one broadcast channel per name.
#[derive(Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<SyncEnvelope>>>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<SyncEnvelope> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl SyncTransport for BroadcastHub {
    fn publish(&self, channel: &str, envelope: SyncEnvelope) {
        // No receivers is not an error: a single window has nobody to tell.
        if self.sender(channel).send(envelope).is_err() {
            debug!(channel, "No sync subscribers");
        }
    }

    fn subscribe(&self, channel: &str) -> BoxStream<'static, SyncEnvelope> {
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();
        stream::unfold((receiver, channel), |(mut receiver, channel)| async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => return Some((envelope, (receiver, channel))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "Sync receiver lagged; older snapshots dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Transport for a lone window.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

impl SyncTransport for NoopTransport {
    fn publish(&self, _channel: &str, _envelope: SyncEnvelope) {}

    fn subscribe(&self, _channel: &str) -> BoxStream<'static, SyncEnvelope> {
        stream::empty().boxed()
    }
}

/// Random id that tags every snapshot a container publishes.
pub fn origin_id() -> String {
    let mut bytes = [0u8; ORIGIN_ID_BYTES];
    match getrandom::fill(&mut bytes) {
        Ok(()) => base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
        Err(err) => {
            warn!(error = %err, "OS randomness unavailable; using uuid origin id");
            uuid::Uuid::new_v4().simple().to_string()
        }
    }
}
