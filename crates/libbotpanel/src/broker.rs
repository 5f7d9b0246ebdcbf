use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use botpanel_protocol::BotId;

use crate::output::{DEFAULT_LOG_CAPACITY, LineSource, LogLine, LogRingBuffer};

pub type SubscriberId = Uuid;

/// Room a viewer's queue has beyond one full replay.
pub const SUBSCRIBER_QUEUE_MARGIN: usize = 256;

/// A line routed to one subscriber, tagged with the group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub bot_id: BotId,
    pub line: LogLine,
}

/// Groups a subscriber was dropped from because its queue was full.
#[derive(Debug, Clone, Default)]
pub struct LagMarks(Arc<DashSet<BotId>>);

impl LagMarks {
    /// Drain the marked groups, sorted.
    pub fn take(&self) -> Vec<BotId> {
        let mut bots: Vec<BotId> = self.0.iter().map(|b| b.key().clone()).collect();
        for bot_id in &bots {
            self.0.remove(bot_id);
        }
        bots.sort();
        bots
    }

    fn mark(&self, bot_id: &BotId) {
        self.0.insert(bot_id.clone());
    }
}

/// Sending half of a viewer connection. Cloning keeps the same identity.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Delivery>,
    lagged: LagMarks,
}

impl Subscriber {
    /// A subscriber whose queue holds at most `queue` undelivered lines.
    pub fn channel(queue: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx,
                lagged: LagMarks::default(),
            },
            rx,
        )
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Handle for reading lag marks without holding the sender alive.
    pub fn lag_marks(&self) -> LagMarks {
        self.lagged.clone()
    }

    /// Queue one delivery during fan-out. Returns false if the subscriber
    /// must leave the group; a full queue also marks the group lagged.
    fn offer(&self, delivery: Delivery) -> bool {
        let bot_id = delivery.bot_id.clone();
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(bot_id = %bot_id, subscriber = %self.id, "subscriber queue full, dropping from group");
                self.lagged.mark(&bot_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(bot_id = %bot_id, subscriber = %self.id, "pruned closed subscriber");
                false
            }
        }
    }
}

/// History and live viewers of one bot. Everything that touches either
/// goes through the channel's mutex, so append-then-fanout is atomic with
/// respect to join's snapshot-then-register.
struct BotChannel {
    buffer: LogRingBuffer,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

/// Per-bot fan-out of console output with replay-on-join.
///
/// Each viewer has a bounded queue. A viewer that falls a full queue
/// behind is removed from the group and has it recorded in its
/// [`LagMarks`]; joining again replays the history.
pub struct BroadcastHub {
    channels: DashMap<BotId, Arc<Mutex<BotChannel>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// A subscriber sized to take one full replay plus a live margin.
    pub fn subscriber(&self) -> (Subscriber, mpsc::Receiver<Delivery>) {
        Subscriber::channel(self.capacity.max(1) + SUBSCRIBER_QUEUE_MARGIN)
    }

    fn channel(&self, bot_id: &BotId) -> Arc<Mutex<BotChannel>> {
        self.channels
            .entry(bot_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(BotChannel {
                    buffer: LogRingBuffer::new(self.capacity),
                    subscribers: HashMap::new(),
                }))
            })
            .clone()
    }

    /// Register `subscriber` for `bot_id` and replay the current history to it
    /// alone. Returns the number of replayed lines, or `None` if the
    /// subscriber could not take the replay and was not registered.
    pub async fn join(&self, bot_id: &BotId, subscriber: &Subscriber) -> Option<usize> {
        let channel = self.channel(bot_id);
        let mut channel = channel.lock().await;

        let replay = channel.buffer.snapshot();
        let count = replay.len();
        for line in replay {
            let delivery = Delivery {
                bot_id: bot_id.clone(),
                line,
            };
            // The caller reports a refused join itself, so no lag mark.
            if let Err(e) = subscriber.tx.try_send(delivery) {
                debug!(bot_id = %bot_id, subscriber = %subscriber.id, error = %e, "join refused");
                channel.subscribers.remove(&subscriber.id);
                return None;
            }
        }

        channel
            .subscribers
            .insert(subscriber.id, subscriber.clone());
        debug!(bot_id = %bot_id, subscriber = %subscriber.id, replayed = count, "joined");
        Some(count)
    }

    /// Append to the bot's history, then deliver to every current subscriber.
    /// Subscribers that are closed or full are dropped from the group.
    pub async fn publish(
        &self,
        bot_id: &BotId,
        source: LineSource,
        text: impl Into<String>,
    ) -> LogLine {
        let channel = self.channel(bot_id);
        let mut channel = channel.lock().await;

        let line = channel.buffer.append(source, text.into());
        channel.subscribers.retain(|_, subscriber| {
            subscriber.offer(Delivery {
                bot_id: bot_id.clone(),
                line: line.clone(),
            })
        });
        line
    }

    /// Remove `subscriber_id` from one bot's group. Idempotent.
    pub async fn leave_bot(&self, bot_id: &BotId, subscriber_id: SubscriberId) {
        let Some(channel) = self.channels.get(bot_id).map(|c| c.clone()) else {
            return;
        };
        channel.lock().await.subscribers.remove(&subscriber_id);
    }

    /// Remove `subscriber_id` from every group. Idempotent.
    pub async fn leave(&self, subscriber_id: SubscriberId) {
        let channels: Vec<Arc<Mutex<BotChannel>>> =
            self.channels.iter().map(|c| c.value().clone()).collect();
        for channel in channels {
            channel.lock().await.subscribers.remove(&subscriber_id);
        }
    }

    /// Current history of `bot_id`; empty for a bot never seen before.
    pub async fn snapshot(&self, bot_id: &BotId) -> Vec<LogLine> {
        match self.channels.get(bot_id).map(|c| c.clone()) {
            Some(channel) => channel.lock().await.buffer.snapshot(),
            None => Vec::new(),
        }
    }

    pub async fn subscriber_count(&self, bot_id: &BotId) -> usize {
        match self.channels.get(bot_id).map(|c| c.clone()) {
            Some(channel) => channel.lock().await.subscribers.len(),
            None => 0,
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
