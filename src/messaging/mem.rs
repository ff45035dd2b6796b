//! In-memory broker over tokio channels.

use super::{Error, MessageEmitter, MessageSource, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const CHANNEL_CAPACITY: usize = 1024;

/// A single-process broker: one main channel, one dead-letter channel.
/// The emitter feeds the main channel, so messages the engine produces are
/// consumed again by the same process.
#[derive(Debug)]
pub struct InMemoryBroker {
    main_tx: mpsc::Sender<String>,
    main_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    dead_tx: mpsc::Sender<String>,
    dead_rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (main_tx, main_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (dead_tx, dead_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            main_tx,
            main_rx: Arc::new(Mutex::new(main_rx)),
            dead_tx,
            dead_rx: Arc::new(Mutex::new(dead_rx)),
        }
    }

    /// Sink feeding the main channel (the "outbound" side).
    #[must_use]
    pub fn emitter(&self) -> Arc<dyn MessageEmitter> {
        Arc::new(ChannelEmitter {
            label: "main",
            tx: self.main_tx.clone(),
        })
    }

    /// Sink feeding the dead-letter channel.
    #[must_use]
    pub fn dead_letter_sink(&self) -> Arc<dyn MessageEmitter> {
        Arc::new(ChannelEmitter {
            label: "dead-letter",
            tx: self.dead_tx.clone(),
        })
    }

    /// Shared inbound stream; cooperative workers take turns on the lock.
    #[must_use]
    pub fn source(&self) -> Arc<dyn MessageSource> {
        Arc::new(ChannelSource {
            rx: Arc::clone(&self.main_rx),
        })
    }

    /// Publish directly onto the inbound channel (used to kick off fresh
    /// instances and by tests).
    pub async fn publish(&self, message: &str) -> Result<()> {
        self.main_tx
            .send(message.to_string())
            .await
            .map_err(|e| Error::Publish {
                message: e.to_string(),
            })
    }

    /// Drain one message from the main channel without blocking, if any is
    /// waiting (used by tests and drain-on-shutdown).
    pub async fn try_recv(&self) -> Option<String> {
        self.main_rx.lock().await.try_recv().ok()
    }

    /// Drain one message from the dead-letter channel, if any is waiting.
    pub async fn try_recv_dead_letter(&self) -> Option<String> {
        self.dead_rx.lock().await.try_recv().ok()
    }
}

#[derive(Debug)]
struct ChannelEmitter {
    label: &'static str,
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl MessageEmitter for ChannelEmitter {
    async fn emit(&self, message: &str) -> Result<()> {
        self.tx
            .send(message.to_string())
            .await
            .map_err(|e| Error::Publish {
                message: format!("{} channel closed: {e}", self.label),
            })
    }
}

#[derive(Debug)]
struct ChannelSource {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

/// An emitter that always fails; used by tests exercising outbox backoff.
#[derive(Debug, Default)]
pub struct FailingEmitter;

#[async_trait]
impl MessageEmitter for FailingEmitter {
    async fn emit(&self, _message: &str) -> Result<()> {
        Err(Error::Publish {
            message: "emitter is wired to fail".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emitter_feeds_source() {
        let broker = InMemoryBroker::new();
        let emitter = broker.emitter();
        let source = broker.source();

        emitter.emit("one").await.unwrap();
        emitter.emit("two").await.unwrap();

        assert_eq!(source.recv().await.as_deref(), Some("one"));
        assert_eq!(source.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_dead_letter_channel_is_separate() {
        let broker = InMemoryBroker::new();
        broker.dead_letter_sink().emit("poison").await.unwrap();
        assert_eq!(broker.try_recv_dead_letter().await.as_deref(), Some("poison"));
        assert_eq!(broker.try_recv_dead_letter().await, None);
    }

    #[tokio::test]
    async fn test_workers_share_the_source() {
        let broker = InMemoryBroker::new();
        for i in 0..10 {
            broker.publish(&format!("m{i}")).await.unwrap();
        }
        let source = broker.source();
        let a = {
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                let mut seen = 0;
                while source.recv().await.is_some() {
                    seen += 1;
                }
                seen
            })
        };
        let b = tokio::spawn(async move {
            let mut seen = 0;
            while source.recv().await.is_some() {
                seen += 1;
            }
            seen
        });
        drop(broker);
        assert_eq!(a.await.unwrap() + b.await.unwrap(), 10);
    }
}
