//! Outbound messages to the clients.
//!
//! The coordinator only ever broadcasts: every message goes to all the clients. A
//! [`BroadcastChannel`] keeps the broadcasts in a sequenced log which clients poll over the REST
//! API, and forwards them to in-process subscribers.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::utils::lock;

/// Errors of a [`MessageChannel`].
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to encode the broadcast payload: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("the channel is unavailable: {0}")]
    Unavailable(String),
}

/// A message sent to all the clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    /// The position of the broadcast in the log. Sequence numbers start at 1.
    pub seq: u64,
    /// The topic, such as `init` or `init/stats`.
    pub topic: String,
    /// Context forwarded with every broadcast.
    pub context: HashMap<String, String>,
    /// The bincode encoded body of the broadcast, if any.
    pub payload: Option<Vec<u8>>,
}

/// The outbound side of the communication with the clients.
#[async_trait]
pub trait MessageChannel
where
    Self: Send + Sync + 'static,
{
    /// Sends a message on `topic` to all the clients.
    async fn broadcast(
        &self,
        topic: &str,
        context: &HashMap<String, String>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), ChannelError>;
}

#[derive(Debug, Default)]
struct Log {
    next_seq: u64,
    entries: Vec<Broadcast>,
}

/// A [`MessageChannel`] keeping every broadcast in memory.
#[derive(Debug)]
pub struct BroadcastChannel {
    log: Mutex<Log>,
    tx: broadcast::Sender<Broadcast>,
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            log: Mutex::new(Log {
                next_seq: 1,
                entries: Vec::new(),
            }),
            tx,
        }
    }

    /// Returns the broadcasts with a sequence number greater than `seq`.
    pub fn since(&self, seq: u64) -> Vec<Broadcast> {
        lock(&self.log)
            .entries
            .iter()
            .filter(|broadcast| broadcast.seq > seq)
            .cloned()
            .collect()
    }

    /// Returns the broadcasts sent on `topic`.
    pub fn on_topic(&self, topic: &str) -> Vec<Broadcast> {
        lock(&self.log)
            .entries
            .iter()
            .filter(|broadcast| broadcast.topic == topic)
            .cloned()
            .collect()
    }

    /// Subscribes to the broadcasts sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl MessageChannel for BroadcastChannel {
    async fn broadcast(
        &self,
        topic: &str,
        context: &HashMap<String, String>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), ChannelError> {
        let broadcast = {
            let mut log = lock(&self.log);
            let broadcast = Broadcast {
                seq: log.next_seq,
                topic: topic.to_string(),
                context: context.clone(),
                payload,
            };
            log.next_seq += 1;
            log.entries.push(broadcast.clone());
            broadcast
        };
        debug!("broadcast #{} on topic {}", broadcast.seq, topic);
        // nobody listening is fine, the log keeps the broadcast
        let _ = self.tx.send(broadcast);
        Ok(())
    }
}
