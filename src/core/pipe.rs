//! The back-pressured, terminable transport that connects one producer to
//! one or more consumers.
//!
//! A [`Pipe<T>`] is "one object, subscribe for a fresh receiver", split into
//! a producer half ([`PipeProducer<T>`]) and the subscribable half
//! (`Pipe<T>` itself) so that "exactly one producer" is an ownership
//! invariant rather than a runtime check.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{ConduitError, ConduitResult};

/// How a pipe behaves when a consumer's buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Producer suspends until space is available. Default.
    Wait,
    /// The newest item is dropped; the buffer keeps its oldest contents.
    DropNewest,
    /// The oldest buffered item is evicted to make room for the newest.
    DropOldest,
    /// `publish` fails immediately with [`ConduitError::DataflowFault`].
    RejectWithError,
}

/// How a pipe with more than one subscriber fans out items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanoutMode {
    /// Every subscriber gets its own cursor and buffer; no item is ever
    /// dropped for a subscriber that isn't itself configured to drop.
    /// Default — see spec's resolution of the fan-out backpressure open
    /// question: a slow consumer backpressures the producer, it does not
    /// cause drops for other consumers.
    #[default]
    Reliable,
    /// Backed by a single `tokio::sync::broadcast` channel: a subscriber
    /// that falls too far behind silently loses the messages it missed.
    /// Opt-in only.
    BestEffort,
}

/// Configuration for a single pipe instance.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub fanout_mode: FanoutMode,
    /// `Some(1)` enforces point-to-point (a second `subscribe` is an
    /// error); `None` allows unbounded fan-out.
    pub max_consumers: Option<usize>,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            backpressure: BackpressurePolicy::Wait,
            fanout_mode: FanoutMode::Reliable,
            max_consumers: Some(1),
        }
    }
}

impl PipeConfig {
    pub fn point_to_point(capacity: usize) -> Self {
        Self {
            capacity,
            max_consumers: Some(1),
            ..Default::default()
        }
    }

    pub fn fan_out(capacity: usize, mode: FanoutMode) -> Self {
        Self {
            capacity,
            fanout_mode: mode,
            max_consumers: None,
            ..Default::default()
        }
    }
}

/// The single terminal state a pipe reaches exactly once, via `Complete`,
/// `Fail`, or cancellation.
#[derive(Debug, Clone)]
pub enum Terminal {
    Completed,
    Faulted(ConduitError),
    Cancelled,
}

/// What a consumer's `next` call observes: an item, end of stream (carrying
/// the terminal reason), or an explicit cancellation — mirroring the
/// `next() -> Item | EndOfStream | Fault` contract called out in the
/// engine's design notes.
#[derive(Debug)]
pub enum PipeSignal<T> {
    Item(T),
    End(Terminal),
}

/// A single subscriber's buffer under [`FanoutMode::Reliable`]. Backed by a
/// plain `VecDeque` rather than `tokio::sync::mpsc` so that
/// [`BackpressurePolicy::DropOldest`] can actually evict the front of the
/// queue — `mpsc::Sender` exposes no such operation.
struct RingSlot<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    notify_item: Notify,
    notify_space: Notify,
    closed: AtomicBool,
}

impl<T> RingSlot<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            notify_item: Notify::new(),
            notify_space: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Called when the owning [`PipeConsumer`] is dropped, so a producer
    /// blocked in `push_wait` doesn't suspend forever against a buffer
    /// nobody will ever drain again.
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify_space.notify_waiters();
    }

    fn pop_ready(&self) -> Option<T> {
        let mut items = self.items.lock().expect("ring slot lock poisoned");
        let item = items.pop_front();
        drop(items);
        if item.is_some() {
            self.notify_space.notify_one();
        }
        item
    }

    /// Waits until the queue has an item or `terminal_is_set` reports the
    /// producer has reached a terminal state with nothing left buffered.
    async fn pop(&self, terminal_is_set: impl Fn() -> bool) -> Option<T> {
        loop {
            let notified = self.notify_item.notified();
            if let Some(item) = self.pop_ready() {
                return Some(item);
            }
            if terminal_is_set() {
                // The producer may have pushed a final item and set the
                // terminal in the window between our first check and now.
                return self.pop_ready().or(None);
            }
            notified.await;
        }
    }

    /// `Wait` policy: suspends until there is room, or the consumer has
    /// been dropped (in which case the item is handed back so the caller
    /// can treat it the way a closed `mpsc::Sender` would).
    async fn push_wait(&self, item: T) -> Result<(), T> {
        loop {
            if self.is_closed() {
                return Err(item);
            }
            let notified = self.notify_space.notified();
            {
                let mut items = self.items.lock().expect("ring slot lock poisoned");
                if items.len() < self.capacity {
                    items.push_back(item);
                    drop(items);
                    self.notify_item.notify_one();
                    return Ok(());
                }
            }
            if self.is_closed() {
                return Err(item);
            }
            notified.await;
        }
    }

    /// `DropNewest` policy: returns `true` if `item` was discarded because
    /// the buffer was already full.
    fn try_push_drop_newest(&self, item: T) -> bool {
        let mut items = self.items.lock().expect("ring slot lock poisoned");
        if items.len() >= self.capacity {
            true
        } else {
            items.push_back(item);
            drop(items);
            self.notify_item.notify_one();
            false
        }
    }

    /// `DropOldest` policy: evicts the front of the queue to make room when
    /// full, then always pushes `item`. Returns `true` if an eviction
    /// happened.
    fn push_drop_oldest(&self, item: T) -> bool {
        let mut items = self.items.lock().expect("ring slot lock poisoned");
        let evicted = if items.len() >= self.capacity {
            items.pop_front();
            true
        } else {
            false
        };
        items.push_back(item);
        drop(items);
        self.notify_item.notify_one();
        evicted
    }

    /// `RejectWithError` policy: hands `item` back on a full buffer instead
    /// of pushing it.
    fn try_push_reject(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock().expect("ring slot lock poisoned");
        if items.len() >= self.capacity {
            Err(item)
        } else {
            items.push_back(item);
            drop(items);
            self.notify_item.notify_one();
            Ok(())
        }
    }
}

enum Subscriptions<T> {
    Reliable(Vec<Arc<RingSlot<T>>>),
    BestEffort(broadcast::Sender<T>),
}

struct PipeShared<T> {
    config: PipeConfig,
    subs: Mutex<Subscriptions<T>>,
    subscriber_count: AtomicU64,
    terminal: OnceLock<Terminal>,
    drops: AtomicU64,
}

impl<T> PipeShared<T> {
    fn terminal(&self) -> Option<&Terminal> {
        self.terminal.get()
    }
}

/// The subscribable half of a pipe. Cloning shares the same underlying
/// channel set; every clone calling `subscribe` competes for the same
/// `max_consumers` budget.
pub struct Pipe<T> {
    inner: Arc<PipeShared<T>>,
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The producer half of a pipe, returned alongside [`Pipe<T>`] from
/// [`channel`]. Not `Clone` — the single-producer invariant is ownership,
/// not a runtime check.
pub struct PipeProducer<T> {
    inner: Arc<PipeShared<T>>,
}

/// Creates a connected producer/subscribable pair per `config`.
pub fn channel<T: Clone + Send + 'static>(config: PipeConfig) -> (PipeProducer<T>, Pipe<T>) {
    let subs = match config.fanout_mode {
        FanoutMode::Reliable => Subscriptions::Reliable(Vec::new()),
        FanoutMode::BestEffort => {
            let (tx, _rx) = broadcast::channel(config.capacity.max(1));
            Subscriptions::BestEffort(tx)
        }
    };

    let shared = Arc::new(PipeShared {
        config,
        subs: Mutex::new(subs),
        subscriber_count: AtomicU64::new(0),
        terminal: OnceLock::new(),
        drops: AtomicU64::new(0),
    });

    (
        PipeProducer {
            inner: Arc::clone(&shared),
        },
        Pipe { inner: shared },
    )
}

impl<T: Clone + Send + 'static> Pipe<T> {
    /// Registers a new consumer, returning an independent cursor. Errors if
    /// the pipe's `max_consumers` budget is already spent.
    pub fn subscribe(&self) -> ConduitResult<PipeConsumer<T>> {
        let already = self.inner.subscriber_count.load(Ordering::SeqCst);
        if let Some(max) = self.inner.config.max_consumers {
            if already >= max as u64 {
                return Err(ConduitError::DataflowFault(format!(
                    "pipe allows at most {max} consumer(s); a further subscribe was attempted"
                )));
            }
        }

        let mut subs = self.inner.subs.lock().expect("pipe subscriber lock poisoned");
        let receiver = match &mut *subs {
            Subscriptions::Reliable(slots) => {
                let slot = Arc::new(RingSlot::new(self.inner.config.capacity));
                slots.push(Arc::clone(&slot));
                ConsumerChannel::Reliable(slot)
            }
            Subscriptions::BestEffort(tx) => ConsumerChannel::BestEffort(tx.subscribe()),
        };
        drop(subs);

        self.inner.subscriber_count.fetch_add(1, Ordering::SeqCst);
        Ok(PipeConsumer {
            shared: Arc::clone(&self.inner),
            channel: receiver,
        })
    }

    /// Number of items dropped so far under a non-wait backpressure policy.
    pub fn drop_count(&self) -> u64 {
        self.inner.drops.load(Ordering::Relaxed)
    }
}

enum ConsumerChannel<T> {
    Reliable(Arc<RingSlot<T>>),
    BestEffort(broadcast::Receiver<T>),
}

/// An independent cursor into a pipe's item sequence.
pub struct PipeConsumer<T> {
    shared: Arc<PipeShared<T>>,
    channel: ConsumerChannel<T>,
}

impl<T: Clone + Send + 'static> PipeConsumer<T> {
    /// Pulls the next item, observing `cancel` at the suspension point. On
    /// end of stream the terminal carried is whatever the producer set via
    /// `complete`/`fail`, or `Terminal::Cancelled` if the run was cancelled
    /// before the producer signalled.
    pub async fn next(&mut self, cancel: &CancellationToken) -> PipeSignal<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => PipeSignal::End(Terminal::Cancelled),
            item = self.recv_one() => match item {
                Some(value) => PipeSignal::Item(value),
                None => PipeSignal::End(self.resolved_terminal()),
            }
        }
    }

    async fn recv_one(&mut self) -> Option<T> {
        match &mut self.channel {
            ConsumerChannel::Reliable(slot) => {
                let shared = &self.shared;
                slot.pop(|| shared.terminal().is_some()).await
            }
            ConsumerChannel::BestEffort(rx) => loop {
                match rx.recv().await {
                    Ok(value) => return Some(value),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    fn resolved_terminal(&self) -> Terminal {
        match self.shared.terminal() {
            Some(Terminal::Completed) => Terminal::Completed,
            Some(Terminal::Faulted(e)) => Terminal::Faulted(e.clone()),
            Some(Terminal::Cancelled) => Terminal::Cancelled,
            None => Terminal::Cancelled,
        }
    }
}

impl<T> Drop for PipeConsumer<T> {
    fn drop(&mut self) {
        if let ConsumerChannel::Reliable(slot) = &self.channel {
            slot.mark_closed();
        }
    }
}

impl<T: Clone + Send + 'static> PipeProducer<T> {
    /// Publishes an item per the pipe's backpressure policy. Errors with
    /// [`ConduitError::DataflowFault`] if the pipe has already reached a
    /// terminal state (publishing after `complete`/`fail` is a contract
    /// violation).
    pub async fn publish(&self, item: T) -> ConduitResult<()> {
        if self.shared().terminal().is_some() {
            return Err(ConduitError::DataflowFault(
                "publish called after the pipe reached a terminal state".into(),
            ));
        }

        let policy = self.shared().config.backpressure;
        let slots: Vec<Arc<RingSlot<T>>> = {
            let subs = self.shared().subs.lock().expect("pipe subscriber lock poisoned");
            match &*subs {
                Subscriptions::Reliable(slots) => slots.clone(),
                Subscriptions::BestEffort(tx) => {
                    // Broadcast has no notion of backpressure; send is
                    // synchronous and only "fails" when there are no
                    // receivers, which is not an error for a pipe that may
                    // not yet have any subscribers.
                    let _ = tx.send(item);
                    return Ok(());
                }
            }
        };

        match policy {
            BackpressurePolicy::Wait => {
                let sends = slots.iter().map(|slot| {
                    let item = item.clone();
                    async move { slot.push_wait(item).await }
                });
                for result in futures::future::join_all(sends).await {
                    // Err means that consumer was dropped: that consumer
                    // is gone, not a pipe-level fault. Other consumers
                    // still matter.
                    let _ = result;
                }
            }
            BackpressurePolicy::DropNewest => {
                for slot in &slots {
                    if slot.try_push_drop_newest(item.clone()) {
                        self.shared().drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            BackpressurePolicy::DropOldest => {
                for slot in &slots {
                    if slot.push_drop_oldest(item.clone()) {
                        self.shared().drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            BackpressurePolicy::RejectWithError => {
                for slot in &slots {
                    if slot.try_push_reject(item.clone()).is_err() {
                        return Err(ConduitError::DataflowFault(
                            "publish rejected: consumer buffer is full".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Signals normal end of stream. Idempotent: the first terminal wins.
    pub fn complete(&self) {
        let _ = self.shared().terminal.set(Terminal::Completed);
    }

    /// Signals a fault. Idempotent: the first terminal wins.
    pub fn fail(&self, error: ConduitError) {
        let _ = self.shared().terminal.set(Terminal::Faulted(error));
    }

    /// Signals cancellation. Idempotent: the first terminal wins.
    pub fn cancel(&self) {
        let _ = self.shared().terminal.set(Terminal::Cancelled);
    }

    fn shared(&self) -> &PipeShared<T> {
        &self.inner
    }
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Completed => write!(f, "Completed"),
            Terminal::Faulted(e) => write!(f, "Faulted({e})"),
            Terminal::Cancelled => write!(f, "Cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn point_to_point_delivers_in_order() {
        let (producer, pipe) = channel::<i32>(PipeConfig::point_to_point(4));
        let mut consumer = pipe.subscribe().unwrap();
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            for i in 0..5 {
                producer.publish(i).await.unwrap();
            }
            producer.complete();
        });

        let mut seen = Vec::new();
        loop {
            match consumer.next(&cancel).await {
                PipeSignal::Item(i) => seen.push(i),
                PipeSignal::End(Terminal::Completed) => break,
                PipeSignal::End(other) => panic!("unexpected terminal: {other:?}"),
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn second_subscribe_on_point_to_point_is_an_error() {
        let (_producer, pipe) = channel::<i32>(PipeConfig::point_to_point(4));
        let _first = pipe.subscribe().unwrap();
        assert!(pipe.subscribe().is_err());
    }

    #[tokio::test]
    async fn fan_out_delivers_full_sequence_to_every_consumer() {
        let (producer, pipe) = channel::<&'static str>(PipeConfig::fan_out(8, FanoutMode::Reliable));
        let a = pipe.subscribe().unwrap();
        let b = pipe.subscribe().unwrap();
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            for item in ["a", "b", "c"] {
                producer.publish(item).await.unwrap();
            }
            producer.complete();
        });

        async fn drain(mut c: PipeConsumer<&'static str>, cancel: CancellationToken) -> Vec<&'static str> {
            let mut out = Vec::new();
            loop {
                match c.next(&cancel).await {
                    PipeSignal::Item(i) => out.push(i),
                    PipeSignal::End(_) => break,
                }
            }
            out
        }

        let (out_a, out_b) = tokio::join!(drain(a, cancel.clone()), drain(b, cancel.clone()));
        assert_eq!(out_a, vec!["a", "b", "c"]);
        assert_eq!(out_b, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn drop_newest_counts_drops_instead_of_blocking() {
        let mut config = PipeConfig::point_to_point(1);
        config.backpressure = BackpressurePolicy::DropNewest;
        let (producer, pipe) = channel::<i32>(config);
        let mut consumer = pipe.subscribe().unwrap();

        producer.publish(1).await.unwrap();
        producer.publish(2).await.unwrap(); // buffer full, dropped
        producer.complete();

        let cancel = CancellationToken::new();
        assert!(matches!(consumer.next(&cancel).await, PipeSignal::Item(1)));
        assert!(matches!(consumer.next(&cancel).await, PipeSignal::End(Terminal::Completed)));
        assert_eq!(pipe.drop_count(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_the_oldest_buffered_item_instead_of_the_newest() {
        let mut config = PipeConfig::point_to_point(2);
        config.backpressure = BackpressurePolicy::DropOldest;
        let (producer, pipe) = channel::<i32>(config);
        let mut consumer = pipe.subscribe().unwrap();

        producer.publish(1).await.unwrap();
        producer.publish(2).await.unwrap();
        producer.publish(3).await.unwrap(); // buffer full at [1, 2]; evicts 1, keeps [2, 3]
        producer.complete();

        let cancel = CancellationToken::new();
        assert!(matches!(consumer.next(&cancel).await, PipeSignal::Item(2)));
        assert!(matches!(consumer.next(&cancel).await, PipeSignal::Item(3)));
        assert!(matches!(consumer.next(&cancel).await, PipeSignal::End(Terminal::Completed)));
        assert_eq!(pipe.drop_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_next() {
        let (_producer, pipe) = channel::<i32>(PipeConfig::point_to_point(4));
        let mut consumer = pipe.subscribe().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            consumer.next(&cancel).await,
            PipeSignal::End(Terminal::Cancelled)
        ));
    }
}
