// In-process publish/subscribe middleware
//
// Each topic owns a fixed pool of message slots. A publisher allocates a slot,
// fills it and publishes it; every queued subscriber then shares the slot until
// it releases its sample. The slot goes back to the pool once the last holder
// lets go. Latest-value subscribers receive a copy and never hold a slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tracing::{debug, trace};

use crate::messages::Message;

/// Error types for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Topic '{topic}' has no publisher for this handle")]
    UnknownHandle { topic: String },

    #[error("Publisher on '{topic}' is disabled")]
    Disabled { topic: String },

    #[error("Slot for '{topic}' was published without a message")]
    EmptySlot { topic: String },

    #[error("Slot allocated for '{slot}' published on '{topic}'")]
    WrongTopic { topic: String, slot: String },

    #[error("Subscriber queue depth must be at least 1")]
    ZeroDepth,
}

/// Where a published message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by a node in this process
    Local,
    /// Relayed in from the transport bridge
    Remote,
}

/// How a subscription receives samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Bounded FIFO; a full queue rejects new samples
    Queued,
    /// Single slot, overwritten by every delivery
    Latest,
}

/// Publisher registration returned by [`Middleware::advertise`]
#[derive(Debug)]
pub struct TopicHandle {
    topic: Arc<str>,
    index: usize,
}

impl TopicHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// A pool slot owned by a publisher between `alloc` and `publish`
#[derive(Debug)]
pub struct MessageSlot {
    topic: Arc<str>,
    message: Option<Message>,
    origin: Origin,
    permit: OwnedSemaphorePermit,
}

impl MessageSlot {
    pub fn set(&mut self, message: Message) {
        self.message = Some(message);
    }

    /// Flag the content as relayed from outside this process
    pub fn mark_remote(&mut self) {
        self.origin = Origin::Remote;
    }
}

#[derive(Debug)]
struct Delivered {
    message: Message,
    origin: Origin,
    // Held until every subscriber has released the sample
    _permit: Option<OwnedSemaphorePermit>,
}

/// A delivered message. Dropping or releasing it returns its slot to the pool.
#[derive(Debug, Clone)]
pub struct Sample {
    topic: Arc<str>,
    inner: Arc<Delivered>,
}

impl Sample {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    pub fn origin(&self) -> Origin {
        self.inner.origin
    }

    /// Hand the sample back to the pool
    pub fn release(self) {
        trace!("Releasing sample on {}", self.topic);
    }
}

enum Queue {
    Queued(mpsc::Receiver<Sample>),
    Latest(watch::Receiver<Option<Sample>>),
}

/// Receiving side of a subscription
pub struct Subscription {
    topic: Arc<str>,
    queue: Queue,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn mode(&self) -> SubscriptionMode {
        match self.queue {
            Queue::Queued(_) => SubscriptionMode::Queued,
            Queue::Latest(_) => SubscriptionMode::Latest,
        }
    }

    /// Wait up to `timeout` for the next sample
    ///
    /// Returns `None` on timeout, and immediately once the bus is gone.
    pub async fn poll(&mut self, timeout: Duration) -> Option<Sample> {
        match &mut self.queue {
            Queue::Queued(rx) => tokio::time::timeout(timeout, rx.recv()).await.ok().flatten(),
            Queue::Latest(rx) => match tokio::time::timeout(timeout, rx.changed()).await {
                Ok(Ok(())) => rx.borrow_and_update().clone(),
                _ => None,
            },
        }
    }

    /// Take a pending sample without waiting
    pub fn try_fetch(&mut self) -> Option<Sample> {
        match &mut self.queue {
            Queue::Queued(rx) => rx.try_recv().ok(),
            Queue::Latest(rx) => {
                if rx.has_changed().unwrap_or(false) {
                    rx.borrow_and_update().clone()
                } else {
                    None
                }
            }
        }
    }
}

enum SubscriberTx {
    Queued(mpsc::Sender<Sample>),
    Latest(watch::Sender<Option<Sample>>),
}

struct TopicRecord {
    pool: Arc<Semaphore>,
    capacity: usize,
    // Enabled flag per advertised publisher, indexed by TopicHandle::index
    publishers: Vec<bool>,
    advertisements: usize,
    subscribers: Vec<SubscriberTx>,
    published: u64,
    overruns: u64,
}

impl TopicRecord {
    fn new(capacity: usize) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(capacity)),
            capacity,
            publishers: Vec::new(),
            advertisements: 0,
            subscribers: Vec::new(),
            published: 0,
            overruns: 0,
        }
    }
}

/// Snapshot of one topic, used by the `mem` command
#[derive(Debug, Clone, PartialEq)]
pub struct TopicStatus {
    pub name: String,
    pub free: usize,
    pub capacity: usize,
    pub live: bool,
    pub publishers: usize,
    pub subscribers: usize,
    pub published: u64,
    pub overruns: u64,
}

struct Inner {
    name: String,
    pool_size: usize,
    topics: Mutex<HashMap<String, TopicRecord>>,
}

/// Shared bus handle. Clones are cheap and refer to the same topics.
#[derive(Clone)]
pub struct Middleware {
    inner: Arc<Inner>,
}

impl Middleware {
    /// Create a bus whose topics each get `pool_size` message slots
    pub fn new(name: impl Into<String>, pool_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                pool_size,
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicRecord>> {
        // A panicking holder cannot leave a record half-written, so keep going
        self.inner.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new publisher on `topic`; it starts disabled
    pub fn advertise(&self, topic: &str) -> TopicHandle {
        let pool_size = self.inner.pool_size;
        let mut topics = self.topics();
        let record = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicRecord::new(pool_size));

        record.publishers.push(false);
        record.advertisements += 1;
        debug!("Advertised {} (publisher #{})", topic, record.publishers.len());

        TopicHandle {
            topic: Arc::from(topic),
            index: record.publishers.len() - 1,
        }
    }

    pub fn set_enabled(&self, handle: &TopicHandle, enabled: bool) {
        if let Some(flag) = self
            .topics()
            .get_mut(handle.topic())
            .and_then(|record| record.publishers.get_mut(handle.index))
        {
            *flag = enabled;
        }
    }

    /// Take a slot from the topic's pool; `None` when the pool is exhausted
    pub fn alloc(&self, handle: &TopicHandle) -> Option<MessageSlot> {
        let pool = self.topics().get(handle.topic())?.pool.clone();
        let permit = pool.try_acquire_owned().ok()?;

        Some(MessageSlot {
            topic: handle.topic.clone(),
            message: None,
            origin: Origin::Local,
            permit,
        })
    }

    /// Deliver a filled slot to every subscriber of the handle's topic
    ///
    /// Returns the number of subscribers that accepted the sample. The slot
    /// returns to the pool if nobody kept it.
    pub fn publish(&self, handle: &TopicHandle, slot: MessageSlot) -> Result<usize, BusError> {
        if slot.topic != handle.topic {
            return Err(BusError::WrongTopic {
                topic: handle.topic().to_string(),
                slot: slot.topic.to_string(),
            });
        }

        let mut topics = self.topics();
        let record = topics
            .get_mut(handle.topic())
            .filter(|record| handle.index < record.publishers.len())
            .ok_or_else(|| BusError::UnknownHandle {
                topic: handle.topic().to_string(),
            })?;

        if !record.publishers[handle.index] {
            return Err(BusError::Disabled {
                topic: handle.topic().to_string(),
            });
        }

        let MessageSlot {
            message,
            origin,
            permit,
            ..
        } = slot;
        let message = message.ok_or_else(|| BusError::EmptySlot {
            topic: handle.topic().to_string(),
        })?;

        let shared = Arc::new(Delivered {
            message,
            origin,
            _permit: Some(permit),
        });

        let mut delivered = 0;
        let mut overruns = 0;
        record.subscribers.retain(|sub| match sub {
            SubscriberTx::Queued(tx) => {
                let sample = Sample {
                    topic: handle.topic.clone(),
                    inner: shared.clone(),
                };
                match tx.try_send(sample) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        overruns += 1;
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            }
            SubscriberTx::Latest(tx) => {
                let copy = Sample {
                    topic: handle.topic.clone(),
                    inner: Arc::new(Delivered {
                        message: shared.message.clone(),
                        origin,
                        _permit: None,
                    }),
                };
                if tx.send(Some(copy)).is_ok() {
                    delivered += 1;
                    true
                } else {
                    false
                }
            }
        });

        record.published += 1;
        record.overruns += overruns;
        if overruns > 0 {
            debug!("{}: {} subscriber queue(s) full, sample rejected", handle.topic(), overruns);
        }

        Ok(delivered)
    }

    /// Subscribe to `topic`; `depth` bounds the queue in [`SubscriptionMode::Queued`]
    pub fn subscribe(
        &self,
        topic: &str,
        depth: usize,
        mode: SubscriptionMode,
    ) -> Result<Subscription, BusError> {
        if depth == 0 {
            return Err(BusError::ZeroDepth);
        }

        let (tx, queue) = match mode {
            SubscriptionMode::Queued => {
                let (tx, rx) = mpsc::channel(depth);
                (SubscriberTx::Queued(tx), Queue::Queued(rx))
            }
            SubscriptionMode::Latest => {
                let (tx, rx) = watch::channel(None);
                (SubscriberTx::Latest(tx), Queue::Latest(rx))
            }
        };

        let pool_size = self.inner.pool_size;
        self.topics()
            .entry(topic.to_string())
            .or_insert_with(|| TopicRecord::new(pool_size))
            .subscribers
            .push(tx);
        debug!("Subscribed to {} ({:?}, depth {})", topic, mode, depth);

        Ok(Subscription {
            topic: Arc::from(topic),
            queue,
        })
    }

    /// How many times `topic` has been advertised
    pub fn advertisements(&self, topic: &str) -> usize {
        self.topics().get(topic).map_or(0, |record| record.advertisements)
    }

    pub fn free_slots(&self, topic: &str) -> Option<usize> {
        self.topics().get(topic).map(|record| record.pool.available_permits())
    }

    /// True while any publisher of `topic` is enabled
    pub fn is_live(&self, topic: &str) -> bool {
        self.topics()
            .get(topic)
            .is_some_and(|record| record.publishers.iter().any(|&enabled| enabled))
    }

    /// Status of every known topic, sorted by name
    pub fn status(&self) -> Vec<TopicStatus> {
        let mut status: Vec<TopicStatus> = self
            .topics()
            .iter()
            .map(|(name, record)| TopicStatus {
                name: name.clone(),
                free: record.pool.available_permits(),
                capacity: record.capacity,
                live: record.publishers.iter().any(|&enabled| enabled),
                publishers: record.publishers.len(),
                subscribers: record.subscribers.len(),
                published: record.published,
                overruns: record.overruns,
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }
}
