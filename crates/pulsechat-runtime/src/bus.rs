//! Event Bus
//!
//! Process-local topic registry. A single broker task owns every membership
//! table, so subscribe, unsubscribe and broadcast requests are applied in the
//! order they reach the broker. Membership is tied to the [`Subscriber`]
//! value: dropping it removes it from every topic, and broadcasts prune any
//! member whose inbox has gone away.
//!
//! Delivery is best effort and unbounded. A slow consumer accumulates a
//! backlog; the broker only logs when it crosses the configured threshold.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use pulsechat_core::{Topic, TopicError};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

pub type SubscriberId = u64;

/// Addressed message delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: Value,
}

// ----------------------------------------------------------------------------
// Broker
// ----------------------------------------------------------------------------

enum BrokerCommand {
    Register {
        id: SubscriberId,
        inbox: Inbox,
    },
    Subscribe {
        id: SubscriberId,
        topic: Topic,
    },
    Unsubscribe {
        id: SubscriberId,
        topic: Topic,
    },
    Remove {
        id: SubscriberId,
    },
    Broadcast {
        message: BusMessage,
    },
    MemberCount {
        topic: Topic,
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
struct Inbox {
    sender: mpsc::UnboundedSender<BusMessage>,
    backlog: Arc<AtomicUsize>,
}

struct Broker {
    inboxes: HashMap<SubscriberId, Inbox>,
    topics: HashMap<Topic, HashSet<SubscriberId>>,
    warn_threshold: usize,
}

impl Broker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BrokerCommand>) {
        debug!("Event bus broker started");
        while let Some(command) = commands.recv().await {
            match command {
                BrokerCommand::Register { id, inbox } => {
                    self.inboxes.insert(id, inbox);
                }
                BrokerCommand::Subscribe { id, topic } => {
                    if self.inboxes.contains_key(&id) {
                        trace!(subscriber = id, topic = %topic, "subscribe");
                        self.topics.entry(topic).or_default().insert(id);
                    }
                }
                BrokerCommand::Unsubscribe { id, topic } => {
                    self.remove_membership(id, &topic);
                }
                BrokerCommand::Remove { id } => self.remove_subscriber(id),
                BrokerCommand::Broadcast { message } => self.broadcast(message),
                BrokerCommand::MemberCount { topic, reply } => {
                    let count = self.topics.get(&topic).map_or(0, HashSet::len);
                    let _ = reply.send(count);
                }
            }
        }
        debug!("Event bus broker stopped");
    }

    fn broadcast(&mut self, message: BusMessage) {
        let Some(members) = self.topics.get(&message.topic) else {
            trace!(topic = %message.topic, "broadcast with no members");
            return;
        };

        let mut closed = Vec::new();
        for id in members {
            let Some(inbox) = self.inboxes.get(id) else {
                closed.push(*id);
                continue;
            };
            if inbox.sender.send(message.clone()).is_err() {
                closed.push(*id);
                continue;
            }
            let backlog = inbox.backlog.fetch_add(1, Ordering::Relaxed) + 1;
            if backlog == self.warn_threshold {
                warn!(
                    subscriber = id,
                    backlog,
                    topic = %message.topic,
                    "Subscriber inbox backlog reached warning threshold"
                );
            }
        }

        for id in closed {
            debug!(subscriber = id, "Pruning closed subscriber");
            self.remove_subscriber(id);
        }
    }

    fn remove_membership(&mut self, id: SubscriberId, topic: &Topic) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    fn remove_subscriber(&mut self, id: SubscriberId) {
        self.inboxes.remove(&id);
        self.topics.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }
}

// ----------------------------------------------------------------------------
// Event Bus Handle
// ----------------------------------------------------------------------------

/// Cloneable handle to the broker
#[derive(Clone)]
pub struct EventBus {
    commands: mpsc::UnboundedSender<BrokerCommand>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Default backlog above which a subscriber is reported
    pub const DEFAULT_WARN_THRESHOLD: usize = 1_024;

    /// Spawn a broker on the current tokio runtime
    pub fn new() -> Self {
        Self::with_warn_threshold(Self::DEFAULT_WARN_THRESHOLD)
    }

    pub fn with_warn_threshold(warn_threshold: usize) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let broker = Broker {
            inboxes: HashMap::new(),
            topics: HashMap::new(),
            warn_threshold: warn_threshold.max(1),
        };
        tokio::spawn(broker.run(receiver));
        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a new member with its own inbox and no subscriptions
    pub fn subscriber(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let _ = self.commands.send(BrokerCommand::Register {
            id,
            inbox: Inbox {
                sender,
                backlog: backlog.clone(),
            },
        });
        Subscriber {
            id,
            commands: self.commands.clone(),
            inbox: receiver,
            backlog,
            topics: HashSet::new(),
        }
    }

    /// Deliver `payload` to every current member of `topic`
    pub fn broadcast(&self, topic: Topic, payload: Value) {
        trace!(topic = %topic, "broadcast");
        let _ = self.commands.send(BrokerCommand::Broadcast {
            message: BusMessage { topic, payload },
        });
    }

    /// Parse `topic` and broadcast; unknown topics are rejected before delivery
    pub fn broadcast_str(&self, topic: &str, payload: Value) -> Result<(), TopicError> {
        let topic = Topic::parse(topic)?;
        self.broadcast(topic, payload);
        Ok(())
    }

    /// Number of current members of `topic`
    pub async fn member_count(&self, topic: &Topic) -> usize {
        let (reply, rx) = oneshot::channel();
        let sent = self.commands.send(BrokerCommand::MemberCount {
            topic: topic.clone(),
            reply,
        });
        if sent.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// The broker task is still running
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Subscriber
// ----------------------------------------------------------------------------

/// A bus member; membership ends when this value is dropped
pub struct Subscriber {
    id: SubscriberId,
    commands: mpsc::UnboundedSender<BrokerCommand>,
    inbox: mpsc::UnboundedReceiver<BusMessage>,
    backlog: Arc<AtomicUsize>,
    topics: HashSet<Topic>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn subscribe(&mut self, topic: Topic) {
        if self.topics.insert(topic.clone()) {
            let _ = self.commands.send(BrokerCommand::Subscribe { id: self.id, topic });
        }
    }

    pub fn subscribe_all<I: IntoIterator<Item = Topic>>(&mut self, topics: I) {
        for topic in topics {
            self.subscribe(topic);
        }
    }

    pub fn unsubscribe(&mut self, topic: &Topic) {
        if self.topics.remove(topic) {
            let _ = self.commands.send(BrokerCommand::Unsubscribe {
                id: self.id,
                topic: topic.clone(),
            });
        }
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    /// Next message; `None` once the broker has stopped
    pub async fn recv(&mut self) -> Option<BusMessage> {
        let message = self.inbox.recv().await?;
        self.mark_taken(1);
        Some(message)
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        let message = self.inbox.try_recv().ok()?;
        self.mark_taken(1);
        Some(message)
    }

    /// Empty every message already queued
    pub fn drain(&mut self) -> Vec<BusMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.inbox.try_recv() {
            out.push(message);
        }
        self.mark_taken(out.len());
        out
    }

    fn mark_taken(&self, n: usize) {
        if n > 0 {
            let _ = self
                .backlog
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(n))
                });
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.commands.send(BrokerCommand::Remove { id: self.id });
    }
}
