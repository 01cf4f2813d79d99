//! "Data ready" notifications between pipeline stages
//!
//! A stage that finished writing an artifact publishes its key on a named
//! channel; downstream stages subscribe to the channel and wake up on each
//! message instead of polling the store. Receiving blocks until a message
//! arrives or the caller's cancellation token fires.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 256;

/// Named broadcast channels
#[derive(Clone, Default)]
pub struct ReadyBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

/// Sends messages on one channel
#[derive(Clone)]
pub struct Publisher {
    channel: String,
    sender: broadcast::Sender<String>,
}

/// Receives messages published after it subscribed
pub struct Subscriber {
    channel: String,
    receiver: broadcast::Receiver<String>,
}

impl ReadyBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn publisher(&self, channel: &str) -> Publisher {
        Publisher {
            channel: channel.to_string(),
            sender: self.sender(channel),
        }
    }

    pub fn subscribe(&self, channel: &str) -> Subscriber {
        Subscriber {
            channel: channel.to_string(),
            receiver: self.sender(channel).subscribe(),
        }
    }

    /// Names of channels that have been used
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Publisher {
    /// Publish a message. Returns the number of subscribers it reached;
    /// a message with no subscribers is dropped.
    pub fn publish(&self, message: impl Into<String>) -> usize {
        match self.sender.send(message.into()) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::debug!(channel = %self.channel, "Ready message had no subscribers");
                0
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Subscriber {
    /// Wait for the next message; `None` once `cancel` fires
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Option<String> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                received = self.receiver.recv() => match received {
                    Ok(message) => return Some(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %self.channel, skipped, "Subscriber lagged, messages dropped");
                    }
                    // The bus owns a sender for every channel it hands out
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Run `callback` for every message on its own task until `cancel` fires
    pub fn spawn_listener<F, Fut>(mut self, cancel: CancellationToken, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(message) = self.recv(&cancel).await {
                callback(message).await;
            }
            tracing::debug!(channel = %self.channel, "Ready listener stopped");
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}
