// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Synchronous event notification.
//!
//! Background components (the session event loop, forwarded ports,
//! subsystems) report what happens to them through an [`Observers`]
//! list instead of returning errors across tasks. Callbacks run on the
//! task that detected the condition, so they must not block.
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Identifies a subscription, for [`Observers::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum Subscriber<T> {
    Callback(Callback<T>),
    Stream(UnboundedSender<T>),
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        match self {
            Subscriber::Callback(f) => Subscriber::Callback(f.clone()),
            Subscriber::Stream(s) => Subscriber::Stream(s.clone()),
        }
    }
}

struct Slots<T> {
    next: u64,
    subscribers: Vec<(SubscriptionId, Subscriber<T>)>,
}

/// A list of subscribers to events of type `T`. Clones share the list.
pub struct Observers<T> {
    inner: Arc<Mutex<Slots<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Observers {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Observers {
            inner: Arc::new(Mutex::new(Slots {
                next: 0,
                subscribers: Vec::new(),
            })),
        }
    }
}

impl<T> Debug for Observers<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, subscriber: Subscriber<T>) -> SubscriptionId {
        let Ok(mut slots) = self.inner.lock() else {
            return SubscriptionId(u64::MAX);
        };
        let id = SubscriptionId(slots.next);
        slots.next += 1;
        slots.subscribers.push((id, subscriber));
        id
    }

    /// Call `f` with every future event.
    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add(Subscriber::Callback(Arc::new(f)))
    }

    /// Receive future events as a stream. The subscription ends when the
    /// stream is dropped.
    pub fn stream(&self) -> UnboundedReceiverStream<T> {
        let (sender, receiver) = unbounded_channel();
        self.add(Subscriber::Stream(sender));
        UnboundedReceiverStream::new(receiver)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut slots) = self.inner.lock() else {
            return false;
        };
        let before = slots.subscribers.len();
        slots.subscribers.retain(|(i, _)| *i != id);
        slots.subscribers.len() != before
    }

    /// Deliver `event` to every subscriber. The list is not locked while
    /// callbacks run, so a callback may subscribe or unsubscribe.
    pub fn notify(&self, event: &T) {
        let subscribers: Vec<Subscriber<T>> = match self.inner.lock() {
            Ok(mut slots) => {
                slots.subscribers.retain(|(_, s)| match s {
                    Subscriber::Stream(s) => !s.is_closed(),
                    Subscriber::Callback(_) => true,
                });
                slots.subscribers.iter().map(|(_, s)| s.clone()).collect()
            }
            Err(_) => return,
        };
        for s in subscribers {
            match s {
                Subscriber::Callback(f) => f(event),
                Subscriber::Stream(s) => {
                    let _ = s.send(event.clone());
                }
            }
        }
    }
}

impl<T> Observers<T> {
    pub fn len(&self) -> usize {
        self.inner.lock().map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_stream::StreamExt;

    use super::*;

    #[test]
    fn callbacks_until_unsubscribed() {
        let observers = Observers::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let id = observers.subscribe(move |n| {
            s.fetch_add(*n as usize, Ordering::SeqCst);
        });
        observers.notify(&2);
        observers.notify(&3);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.notify(&100);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn streams_are_pruned_once_dropped() {
        let observers = Observers::<&'static str>::new();
        let mut events = observers.stream();
        observers.notify(&"closing");
        assert_eq!(events.next().await, Some("closing"));
        drop(events);
        observers.notify(&"ignored");
        assert!(observers.is_empty());
    }
}
