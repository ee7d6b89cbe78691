use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tether_core::config::DispatchConfig;
use tether_core::types::ConversationKey;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Events carry the conversation they belong to. Same key means same queue.
pub(crate) trait Keyed {
    fn key(&self) -> ConversationKey;
}

/// Facts about a coalesced batch, handed to the handler with its latest event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchMeta {
    /// Events folded into this batch, including the delivered one.
    pub merge_count: usize,
    /// Time from the first event's enqueue to handler invocation.
    pub queue_wait: Duration,
    /// Wall-clock enqueue time of the first event.
    pub enqueued_at: DateTime<Utc>,
}

pub(crate) type BatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type BatchHandler<E> = Arc<dyn Fn(E, BatchMeta) -> BatchFuture + Send + Sync>;

struct Queued<E> {
    event: E,
    enqueued: Instant,
    enqueued_at: DateTime<Utc>,
}

/// Bounded per-key queue. Items leave it the moment a worker drains them,
/// so an overflow only ever evicts events nobody has picked up yet.
struct KeyQueue<E> {
    items: Mutex<VecDeque<Queued<E>>>,
    notify: Notify,
}

impl<E> KeyQueue<E> {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Queued<E>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item`, evicting the oldest queued item if full. Returns
    /// whether something was dropped.
    fn push(&self, item: Queued<E>, depth: usize) -> bool {
        let dropped = {
            let mut items = self.lock();
            let dropped = items.len() >= depth && items.pop_front().is_some();
            items.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<Queued<E>> {
        self.lock().pop_front()
    }
}

/// Keyed burst dispatcher: one worker per conversation key, each coalescing
/// events that arrive within the window into a single handler call.
pub(crate) struct Dispatcher<E> {
    queues: Mutex<HashMap<ConversationKey, Arc<KeyQueue<E>>>>,
    handler: BatchHandler<E>,
    window: Duration,
    depth: usize,
    cancel: CancellationToken,
    draining: CancellationToken,
    tracker: TaskTracker,
}

impl<E: Keyed + Send + 'static> Dispatcher<E> {
    pub(crate) fn new(config: &DispatchConfig, handler: BatchHandler<E>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            handler,
            window: config.coalesce_window(),
            depth: config.queue_depth.max(1),
            cancel: CancellationToken::new(),
            draining: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Queues `event` on its key's worker, starting the worker on first use.
    /// Never blocks. Returns `true` if an event was dropped to make room, or
    /// if the dispatcher is closed and `event` itself was dropped.
    pub(crate) fn enqueue(&self, event: E) -> bool {
        if self.cancel.is_cancelled() || self.draining.is_cancelled() {
            tracing::warn!("dispatcher is shut down; dropping event");
            return true;
        }

        let key = event.key();
        let queue = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = queues.get(&key) {
                Arc::clone(queue)
            } else {
                let queue = Arc::new(KeyQueue::new());
                self.spawn_worker(key.clone(), Arc::clone(&queue));
                queues.insert(key.clone(), Arc::clone(&queue));
                queue
            }
        };

        let item = Queued {
            event,
            enqueued: Instant::now(),
            enqueued_at: Utc::now(),
        };
        let dropped = queue.push(item, self.depth);
        if dropped {
            tracing::warn!(%key, depth = self.depth, "queue full; dropped oldest pending event");
        }
        dropped
    }

    /// Stops every worker and waits for them to exit. Batches still being
    /// collected are dropped without being handled.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Stops accepting events, lets every worker finish the batches already
    /// queued, then waits for them to exit.
    pub(crate) async fn drain(&self) {
        self.draining.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_worker(&self, key: ConversationKey, queue: Arc<KeyQueue<E>>) {
        let handler = Arc::clone(&self.handler);
        let cancel = self.cancel.clone();
        let draining = self.draining.clone();
        let window = self.window;
        self.tracker.spawn(async move {
            tracing::debug!(%key, "queue worker started");
            run_worker(&key, &queue, &handler, window, &cancel, &draining).await;
            tracing::debug!(%key, "queue worker stopped");
        });
    }
}

async fn run_worker<E>(
    key: &ConversationKey,
    queue: &KeyQueue<E>,
    handler: &BatchHandler<E>,
    window: Duration,
    cancel: &CancellationToken,
    draining: &CancellationToken,
) {
    loop {
        let first = loop {
            if let Some(item) = queue.pop() {
                break item;
            }
            if draining.is_cancelled() {
                return;
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = draining.cancelled() => {}
                () = queue.notify.notified() => {}
            }
        };

        let Queued {
            event: mut latest,
            enqueued: first_enqueued,
            enqueued_at,
        } = first;
        let mut merge_count = 1;
        let timer = tokio::time::sleep(window);
        tokio::pin!(timer);

        loop {
            while let Some(item) = queue.pop() {
                latest = item.event;
                merge_count += 1;
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(%key, merge_count, "dropping batch on shutdown");
                    return;
                }
                () = &mut timer => break,
                () = queue.notify.notified() => {}
            }
        }

        let meta = BatchMeta {
            merge_count,
            queue_wait: first_enqueued.elapsed(),
            enqueued_at,
        };
        tracing::debug!(
            %key,
            merge_count,
            queue_wait_ms = meta.queue_wait.as_millis(),
            "dispatching batch"
        );
        tokio::select! {
            () = cancel.cancelled() => return,
            () = handler(latest, meta) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::sync::Semaphore;

    use super::*;

    #[derive(Debug, Clone)]
    struct Event {
        scope: &'static str,
        channel: &'static str,
        text: &'static str,
    }

    impl Keyed for Event {
        fn key(&self) -> ConversationKey {
            ConversationKey::new(self.scope, self.channel)
        }
    }

    fn event(channel: &'static str, text: &'static str) -> Event {
        Event {
            scope: "g1",
            channel,
            text,
        }
    }

    type Calls = Arc<StdMutex<Vec<(String, String, BatchMeta)>>>;

    fn recording_handler(calls: &Calls, gate: Option<Arc<Semaphore>>) -> BatchHandler<Event> {
        let calls = Arc::clone(calls);
        Arc::new(move |event: Event, meta: BatchMeta| -> BatchFuture {
            let calls = Arc::clone(&calls);
            let gate = gate.clone();
            Box::pin(async move {
                calls.lock().unwrap().push((
                    event.channel.to_string(),
                    event.text.to_string(),
                    meta,
                ));
                if let Some(gate) = gate {
                    let _permit = gate.acquire().await;
                }
            })
        })
    }

    fn config(window_ms: u64, depth: usize) -> DispatchConfig {
        DispatchConfig {
            coalesce_window_ms: window_ms,
            queue_depth: depth,
        }
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_is_one_batch() {
        let calls = Calls::default();
        let dispatcher = Dispatcher::new(&config(1200, 128), recording_handler(&calls, None));

        assert!(!dispatcher.enqueue(event("c1", "m1")));
        settle(30).await;
        assert!(!dispatcher.enqueue(event("c1", "m2")));
        settle(30).await;
        assert!(!dispatcher.enqueue(event("c1", "m3")));
        settle(2000).await;

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "m3");
        assert_eq!(calls[0].2.merge_count, 3);
        assert!(calls[0].2.queue_wait >= Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_never_merge() {
        let calls = Calls::default();
        let dispatcher = Dispatcher::new(&config(1200, 128), recording_handler(&calls, None));

        dispatcher.enqueue(event("c1", "a"));
        dispatcher.enqueue(event("c2", "b"));
        settle(2000).await;

        let mut calls = calls.lock().unwrap().clone();
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].0.as_str(), calls[0].1.as_str()), ("c1", "a"));
        assert_eq!((calls[1].0.as_str(), calls[1].1.as_str()), ("c2", "b"));
        assert!(calls.iter().all(|call| call.2.merge_count == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn events_after_the_window_form_a_new_batch() {
        let calls = Calls::default();
        let dispatcher = Dispatcher::new(&config(100, 128), recording_handler(&calls, None));

        dispatcher.enqueue(event("c1", "first"));
        settle(500).await;
        dispatcher.enqueue(event("c1", "second"));
        settle(500).await;

        let calls = calls.lock().unwrap().clone();
        let texts: Vec<&str> = calls.iter().map(|call| call.1.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert!(calls.iter().all(|call| call.2.merge_count == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_evicts_oldest_pending_event() {
        let calls = Calls::default();
        let gate = Arc::new(Semaphore::new(0));
        let dispatcher = Dispatcher::new(
            &config(100, 2),
            recording_handler(&calls, Some(Arc::clone(&gate))),
        );

        dispatcher.enqueue(event("c1", "in-flight"));
        settle(200).await;
        // worker is now blocked inside the handler
        assert!(!dispatcher.enqueue(event("c1", "e2")));
        assert!(!dispatcher.enqueue(event("c1", "e3")));
        assert!(dispatcher.enqueue(event("c1", "e4")));

        gate.add_permits(2);
        settle(500).await;

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "in-flight");
        assert_eq!(calls[1].1, "e4");
        assert_eq!(calls[1].2.merge_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_batch_being_collected() {
        let calls = Calls::default();
        let dispatcher = Dispatcher::new(&config(1200, 128), recording_handler(&calls, None));

        dispatcher.enqueue(event("c1", "pending"));
        settle(100).await;
        dispatcher.shutdown().await;
        settle(2000).await;

        assert!(calls.lock().unwrap().is_empty());
        assert!(dispatcher.enqueue(event("c1", "late")));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_flushes_queued_batches() {
        let calls = Calls::default();
        let dispatcher = Dispatcher::new(&config(1200, 128), recording_handler(&calls, None));

        dispatcher.enqueue(event("c1", "a1"));
        dispatcher.enqueue(event("c1", "a2"));
        dispatcher.enqueue(event("c2", "b1"));
        dispatcher.drain().await;

        let mut calls = calls.lock().unwrap().clone();
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "a2");
        assert_eq!(calls[0].2.merge_count, 2);
        assert_eq!(calls[1].1, "b1");
        assert!(dispatcher.enqueue(event("c1", "late")));
    }
}
