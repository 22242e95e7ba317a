use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Broadcasts "there is new data" signals from one writer to any number of
/// readers tailing the same body store.
///
/// Every subscriber channel has capacity 1, so a burst of writer
/// notifications collapses into a single pending signal; a woken reader
/// drains the underlying store to its current end before waiting again.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    empty_tx: mpsc::Sender<()>,
    empty_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

struct State {
    closed: bool,
    next_id: u64,
    // A closed subscription keeps its keys (with the sender dropped) so
    // wait_all still sees readers that have not unsubscribed yet.
    subscribers: HashMap<u64, Option<mpsc::Sender<()>>>,
}

/// One reader's end of a [`Subscription`]. Unsubscribes on drop.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<()>,
    owner: Arc<Inner>,
}

impl Subscription {
    pub fn new() -> Self {
        let (empty_tx, empty_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    closed: false,
                    next_id: 0,
                    subscribers: HashMap::new(),
                }),
                empty_tx,
                empty_rx: tokio::sync::Mutex::new(empty_rx),
            }),
        }
    }

    /// Registers a new subscriber. If the subscription is already closed the
    /// returned subscriber observes an immediately-closed channel.
    pub fn subscribe(&self) -> Subscriber {
        let mut state = self.inner.state.lock().expect("subscription state");
        let (tx, rx) = mpsc::channel(1);
        let id = state.next_id;
        state.next_id += 1;
        if state.closed {
            drop(tx);
        } else {
            state.subscribers.insert(id, Some(tx));
        }
        Subscriber {
            id,
            rx,
            owner: Arc::clone(&self.inner),
        }
    }

    /// Non-blocking notification of every subscriber. A subscriber that
    /// already has a pending signal is skipped.
    pub fn notify_all(&self) {
        let state = self.inner.state.lock().expect("subscription state");
        for tx in state.subscribers.values().flatten() {
            let _ = tx.try_send(());
        }
    }

    /// Closes every subscriber channel. Idempotent. Subscribers created
    /// afterwards observe a closed channel right away.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("subscription state");
        if state.closed {
            return;
        }
        state.closed = true;
        for tx in state.subscribers.values_mut() {
            tx.take();
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self
            .inner
            .state
            .lock()
            .expect("subscription state")
            .subscribers
            .is_empty()
    }

    /// Blocks until the subscriber set is empty.
    pub async fn wait_all(&self) {
        if !self.has_subscribers() {
            return;
        }
        let mut empty_rx = self.inner.empty_rx.lock().await;
        loop {
            if !self.has_subscribers() {
                return;
            }
            if empty_rx.recv().await.is_none() {
                return;
            }
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn remove(&self, id: u64) {
        let mut state = self.state.lock().expect("subscription state");
        state.subscribers.remove(&id);
        if state.subscribers.is_empty() {
            let _ = self.empty_tx.try_send(());
        }
    }
}

impl Subscriber {
    /// Waits for the next writer notification. Returns false once the
    /// subscription is closed and no notification is pending.
    pub async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.owner.remove(self.id);
    }
}
