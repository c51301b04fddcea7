//! Label-matched fan-out with bounded per-subscriber buffers.
//!
//! Both the event backend and the entity cache publish through a
//! [`Publisher`]: the backend fans out raw [`Event`](crate::Event)s, the
//! cache fans out entity [`Notification`](crate::cache::Notification)s.
//! Each subscriber owns a bounded buffer; when it overflows, messages are
//! dropped for that subscriber only and the drop is surfaced in-stream as
//! [`Delivery::Lagged`] so the subscriber can resynchronize with a read.
//! A slow subscriber never stalls the publisher or its peers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// One requirement on a label set. Requirements in a [`Selector`] are
/// conjunctive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// The label `key` must be present with exactly `value`.
    Equals {
        /// Label key.
        key: String,
        /// Required value.
        value: String,
    },
    /// The label `key` must be present with one of `values`.
    In {
        /// Label key.
        key: String,
        /// Accepted values.
        values: Vec<String>,
    },
    /// The label `key` must be present with any value.
    Exists {
        /// Label key.
        key: String,
    },
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key) == Some(value),
            Requirement::In { key, values } => {
                labels.get(key).is_some_and(|v| values.contains(v))
            }
            Requirement::Exists { key } => labels.contains_key(key),
        }
    }
}

/// A label matcher for subscriptions.
///
/// An empty selector matches every message. Labels are those produced by
/// [`Event::labels`](crate::Event::labels).
///
/// # Example
///
/// ```
/// use weft::pubsub::Selector;
///
/// let invocations = Selector::any().with_equals("aggregate.kind", "invocation");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// A selector that matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    /// A selector matching all events of one aggregate kind.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::any().with_equals("aggregate.kind", kind)
    }

    /// A selector matching all events of one aggregate.
    pub fn aggregate(aggregate: &crate::Aggregate) -> Self {
        Self::any()
            .with_equals("aggregate.kind", aggregate.kind.clone())
            .with_equals("aggregate.id", aggregate.id.clone())
    }

    /// Require `key == value`.
    pub fn with_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Equals {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Require `key` to hold one of `values`.
    pub fn with_in(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.requirements.push(Requirement::In {
            key: key.into(),
            values,
        });
        self
    }

    /// Require `key` to be present.
    pub fn with_exists(mut self, key: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Exists { key: key.into() });
        self
    }

    /// Returns `true` if every requirement holds for `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

/// One item delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum Delivery<T> {
    /// A published message that matched the subscriber's selector.
    Message(T),
    /// `n` matching messages were dropped because the subscriber's buffer
    /// was full. The subscriber should resynchronize by re-reading state.
    Lagged(u64),
}

/// Receiving half of a subscription.
pub struct Subscription<T> {
    receiver: mpsc::Receiver<Delivery<T>>,
}

impl<T> Subscription<T> {
    /// Receive the next delivery; `None` when the publisher is dropped.
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Delivery<T>> {
        self.receiver.try_recv().ok()
    }
}

struct Subscriber<T> {
    selector: Selector,
    sender: mpsc::Sender<Delivery<T>>,
    /// Matching messages dropped since the last successful delivery.
    lagged: u64,
}

/// Selector-matched fan-out to bounded subscribers.
pub struct Publisher<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Publisher<T> {
    /// Create a publisher with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a selector and buffer capacity.
    pub fn subscribe(&self, selector: Selector, buffer: usize) -> Subscription<T> {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let mut subscribers = self.subscribers.lock().expect("publisher lock poisoned");
        subscribers.push(Subscriber {
            selector,
            sender,
            lagged: 0,
        });
        Subscription { receiver }
    }

    /// Publish one message to every subscriber whose selector matches
    /// `labels`.
    ///
    /// Never blocks: a full subscriber buffer counts the message as dropped
    /// and the drop is surfaced as [`Delivery::Lagged`] ahead of the next
    /// message that fits. Closed subscribers are pruned.
    pub fn publish(&self, labels: &BTreeMap<String, String>, message: &T) {
        let mut subscribers = self.subscribers.lock().expect("publisher lock poisoned");
        subscribers.retain_mut(|sub| {
            if !sub.selector.matches(labels) {
                return !sub.sender.is_closed();
            }
            if sub.lagged > 0 {
                match sub.sender.try_send(Delivery::Lagged(sub.lagged)) {
                    Ok(()) => sub.lagged = 0,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        sub.lagged += 1;
                        return true;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            match sub.sender.try_send(Delivery::Message(message.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.lagged += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("publisher lock poisoned")
            .len()
    }
}
