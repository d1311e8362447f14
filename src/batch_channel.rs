use std::cmp::min;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::batch::BatchBuilder;
use crate::channel::{ChannelObserver, Direction, LetterChannel};
use crate::config::{BatchConfig, SocketConfig};
use crate::letter::Letter;
use crate::node_id::NodeId;

/// Micro-batching decorator around a channel. Letters enqueued here are collected and folded
///  into Batch letters before they hit the underlying channel; received Batch letters are
///  already unpacked below, so the receiving direction just passes through.
///
/// Flush policy: a letter waits at most `extend` after the latest enqueue (sliding) and at most
///  `max_extend` after the first enqueue (hard bound); hitting `max_letters` flushes
///  immediately. At most one batch is in flight at a time, so letters keep accumulating while
///  the wire is busy.
///
/// Wiring: the batch channel is the observer of the underlying channel, and the socket is the
///  observer of the batch channel.
pub struct BatchChannel {
    me: Weak<BatchChannel>,
    inner: Arc<dyn LetterChannel>,
    config: BatchConfig,
    self_id: NodeId,
    observer: OnceLock<Arc<dyn ChannelObserver>>,
    state: Mutex<BatchState>,
}

struct BatchState {
    queue: VecDeque<Letter>,
    /// the letters folded into the batch currently in flight, kept for sent / failed reporting
    in_flight: Vec<Letter>,
    sent_batch: bool,
    /// enqueue time of the oldest letter in `queue`, bounding the flush via `max_extend`
    first_enqueue: Option<Instant>,
    flush_timer: Option<JoinHandle<()>>,
}

impl BatchChannel {
    pub fn new(inner: Arc<dyn LetterChannel>, config: &SocketConfig) -> Arc<BatchChannel> {
        Arc::new_cyclic(|me| BatchChannel {
            me: me.clone(),
            inner,
            config: config.batch.clone(),
            self_id: config.node_id,
            observer: OnceLock::new(),
            state: Mutex::new(BatchState {
                queue: VecDeque::new(),
                in_flight: Vec::new(),
                sent_batch: false,
                first_enqueue: None,
                flush_timer: None,
            }),
        })
    }

    pub fn set_observer(&self, observer: Arc<dyn ChannelObserver>) {
        if self.observer.set(observer).is_err() {
            warn!("observer for batch channel {:?} was set twice - ignoring the second", self.inner.remote_addr());
        }
    }

    fn as_dyn(&self) -> Option<Arc<dyn LetterChannel>> {
        self.me.upgrade()
            .map(|me| me as Arc<dyn LetterChannel>)
    }

    /// Sends the next batch down the channel, if there is anything to send and no batch is in
    ///  flight yet. Returns the letters of a batch the underlying channel rejected, for
    ///  failure reporting outside the lock.
    #[must_use]
    fn flush_locked(&self, state: &mut BatchState) -> Vec<Letter> {
        if state.sent_batch || state.queue.is_empty() {
            return Vec::new();
        }
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }

        let count = min(state.queue.len(), self.config.max_letters);
        let letters: Vec<Letter> = state.queue.drain(..count).collect();
        trace!("flushing a batch of {} letters to {:?}", letters.len(), self.inner.remote_addr());

        // a batch of one is pure overhead - send the letter as it is
        let outgoing = if letters.len() == 1 {
            letters[0].clone()
        }
        else {
            let mut builder = BatchBuilder::new(self.self_id, self.config.max_letters);
            for letter in &letters {
                builder.add(letter.clone());
            }
            builder.build()
        };

        state.first_enqueue = if state.queue.is_empty() { None } else { Some(Instant::now()) };

        match self.inner.enqueue(outgoing) {
            Ok(()) => {
                state.in_flight = letters;
                state.sent_batch = true;
                Vec::new()
            }
            Err(_) => letters,
        }
    }

    fn arm_timer_locked(&self, state: &mut BatchState, now: Instant) {
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }

        let hard_deadline = state.first_enqueue.unwrap_or(now) + self.config.max_extend;
        let deadline = min(now + self.config.extend, hard_deadline);

        let me = self.me.clone();
        state.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(channel) = me.upgrade() {
                let failed = {
                    let mut state = channel.state.lock().unwrap();
                    channel.flush_locked(&mut state)
                };
                channel.notify_failed(failed).await;
            }
        }));
    }

    async fn notify_failed(&self, letters: Vec<Letter>) {
        if letters.is_empty() {
            return;
        }
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_failed_to_send(me, letters).await;
        }
    }
}

impl LetterChannel for BatchChannel {
    fn enqueue(&self, letter: Letter) -> Result<(), Letter> {
        if !self.inner.is_connected() {
            return Err(letter);
        }

        let failed = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();

            state.queue.push_back(letter);
            if state.first_enqueue.is_none() {
                state.first_enqueue = Some(now);
            }

            if state.queue.len() >= self.config.max_letters {
                self.flush_locked(&mut state)
            }
            else {
                self.arm_timer_locked(&mut state, now);
                Vec::new()
            }
        };

        // the batch layer absorbs letters without occupying the channel's send slot, so it is
        //  immediately ready for more
        if let Some(me) = self.me.upgrade() {
            tokio::spawn(async move {
                me.notify_failed(failed).await;
                if let (Some(observer), Some(me_dyn)) = (me.observer.get(), me.as_dyn()) {
                    observer.on_queue_empty(me_dyn).await;
                }
            });
        }

        Ok(())
    }

    fn direction(&self) -> Direction {
        self.inner.direction()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr()
    }

    fn remote_node_id(&self) -> Option<NodeId> {
        self.inner.remote_node_id()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn shut_down(&self) {
        self.inner.shut_down();
    }
}

/// Events coming up from the underlying channel.
#[async_trait]
impl ChannelObserver for BatchChannel {
    async fn on_connected(&self, _channel: Arc<dyn LetterChannel>) {
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_connected(me).await;
        }
    }

    async fn on_initialized(&self, _channel: Arc<dyn LetterChannel>, remote: NodeId) {
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_initialized(me, remote).await;
        }
    }

    async fn on_disconnected(&self, _channel: Arc<dyn LetterChannel>) {
        let failed = {
            let mut state = self.state.lock().unwrap();
            if let Some(timer) = state.flush_timer.take() {
                timer.abort();
            }
            state.first_enqueue = None;
            state.queue.drain(..).collect::<Vec<_>>()
        };
        self.notify_failed(failed).await;

        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_disconnected(me).await;
        }
    }

    async fn on_queue_empty(&self, _channel: Arc<dyn LetterChannel>) {
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_queue_empty(me).await;
        }
    }

    async fn on_received(&self, _channel: Arc<dyn LetterChannel>, letter: Letter) {
        // batches are already unpacked below this layer
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_received(me, letter).await;
        }
    }

    async fn on_sent(&self, _channel: Arc<dyn LetterChannel>, _letter: Letter) {
        // this layer is the only feeder of the underlying channel, so whatever was sent is the
        //  current flush - batched or unwrapped single letter
        let sent = {
            let mut state = self.state.lock().unwrap();
            state.sent_batch = false;
            std::mem::take(&mut state.in_flight)
        };

        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            for letter in sent {
                observer.on_sent(me.clone(), letter).await;
            }
        }

        let failed = {
            let mut state = self.state.lock().unwrap();
            if state.queue.len() >= self.config.max_letters {
                self.flush_locked(&mut state)
            }
            else {
                if !state.queue.is_empty() {
                    self.arm_timer_locked(&mut state, Instant::now());
                }
                Vec::new()
            }
        };
        self.notify_failed(failed).await;
    }

    async fn on_failed_to_send(&self, _channel: Arc<dyn LetterChannel>, _letters: Vec<Letter>) {
        // what the underlying channel failed is the current flush - report the originals
        let failed = {
            let mut state = self.state.lock().unwrap();
            state.sent_batch = false;
            std::mem::take(&mut state.in_flight)
        };
        self.notify_failed(failed).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use crate::channel::test_support::{ChannelEvent, RecordingObserver};
    use crate::config::SocketConfig;
    use crate::letter::{LetterOptions, LetterType};

    use super::*;

    /// stand-in for the underlying channel, recording every letter it is handed
    struct FakeInner {
        enqueued: Mutex<Vec<Letter>>,
        connected: std::sync::atomic::AtomicBool,
        reject: std::sync::atomic::AtomicBool,
    }

    impl FakeInner {
        fn new() -> Arc<FakeInner> {
            Arc::new(FakeInner {
                enqueued: Mutex::new(Vec::new()),
                connected: std::sync::atomic::AtomicBool::new(true),
                reject: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn enqueued(&self) -> Vec<Letter> {
            self.enqueued.lock().unwrap().clone()
        }
    }

    impl LetterChannel for FakeInner {
        fn enqueue(&self, letter: Letter) -> Result<(), Letter> {
            if self.reject.load(std::sync::atomic::Ordering::Acquire) {
                return Err(letter);
            }
            self.enqueued.lock().unwrap().push(letter);
            Ok(())
        }
        fn direction(&self) -> Direction {
            Direction::Outbound
        }
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:1".parse().unwrap()
        }
        fn remote_node_id(&self) -> Option<NodeId> {
            None
        }
        fn is_connected(&self) -> bool {
            self.connected.load(std::sync::atomic::Ordering::Acquire)
        }
        fn shut_down(&self) {
            self.connected.store(false, std::sync::atomic::Ordering::Release);
        }
    }

    struct Fixture {
        inner: Arc<FakeInner>,
        batch_channel: Arc<BatchChannel>,
        observer: Arc<RecordingObserver>,
    }

    fn fixture(max_letters: usize) -> Fixture {
        let mut config = SocketConfig::new();
        config.batch.extend = Duration::from_millis(100);
        config.batch.max_extend = Duration::from_secs(1);
        config.batch.max_letters = max_letters;

        let inner = FakeInner::new();
        let batch_channel = BatchChannel::new(inner.clone(), &config);
        let observer = Arc::new(RecordingObserver::default());
        batch_channel.set_observer(observer.clone());

        Fixture { inner, batch_channel, observer }
    }

    fn letter(payload: &'static [u8]) -> Letter {
        Letter::user(LetterOptions::empty(), vec![Bytes::from_static(payload)])
    }

    fn payloads_of_batch(batch: &Letter) -> Vec<Bytes> {
        assert_eq!(batch.letter_type, LetterType::Batch);
        crate::batch::try_unpack_batch(batch).unwrap()
            .into_iter()
            .map(|l| l.parts[0].clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_extend() {
        let f = fixture(100);

        f.batch_channel.enqueue(letter(b"a")).unwrap();
        f.batch_channel.enqueue(letter(b"b")).unwrap();

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(f.inner.enqueued().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let batches = f.inner.enqueued();
        assert_eq!(batches.len(), 1);
        assert_eq!(payloads_of_batch(&batches[0]), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_enqueue_extends_the_flush() {
        let f = fixture(100);

        f.batch_channel.enqueue(letter(b"a")).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        f.batch_channel.enqueue(letter(b"b")).unwrap();

        // 100ms after the first enqueue, but only 20ms after the second - no flush yet
        tokio::time::sleep(Duration::from_millis(21)).await;
        assert!(f.inner.enqueued().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(f.inner.enqueued().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_extend_bounds_continuous_traffic() {
        let f = fixture(1_000);

        // a letter every 50ms keeps sliding the extend window forever...
        for _ in 0..19 {
            f.batch_channel.enqueue(letter(b"x")).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(f.inner.enqueued().is_empty());

        // ...but max_extend (1s after the first enqueue) flushes regardless
        tokio::time::sleep(Duration::from_millis(100)).await;
        let batches = f.inner.enqueued();
        assert_eq!(batches.len(), 1);
        assert_eq!(payloads_of_batch(&batches[0]).len(), 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_letter_is_sent_unwrapped() {
        let f = fixture(100);

        let a = letter(b"only");
        f.batch_channel.enqueue(a.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(101)).await;

        assert_eq!(f.inner.enqueued(), vec![a.clone()]);

        // the guard still applies: the next flush waits for the sent report
        f.batch_channel.enqueue(letter(b"next")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.inner.enqueued().len(), 1);

        f.batch_channel.on_sent(f.inner.clone(), a.clone()).await;
        f.observer.wait_for(ChannelEvent::Sent(a)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.inner.enqueued().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_letters_flushes_immediately() {
        let f = fixture(3);

        f.batch_channel.enqueue(letter(b"a")).unwrap();
        f.batch_channel.enqueue(letter(b"b")).unwrap();
        assert!(f.inner.enqueued().is_empty());

        f.batch_channel.enqueue(letter(b"c")).unwrap();
        let batches = f.inner.enqueued();
        assert_eq!(batches.len(), 1);
        assert_eq!(payloads_of_batch(&batches[0]).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_batch_in_flight_at_a_time() {
        let f = fixture(2);

        f.batch_channel.enqueue(letter(b"a")).unwrap();
        f.batch_channel.enqueue(letter(b"b")).unwrap();
        assert_eq!(f.inner.enqueued().len(), 1);

        // the first batch was not reported as sent yet, so the second full batch must wait
        f.batch_channel.enqueue(letter(b"c")).unwrap();
        f.batch_channel.enqueue(letter(b"d")).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.inner.enqueued().len(), 1);

        let first_batch = f.inner.enqueued()[0].clone();
        f.batch_channel.on_sent(f.inner.clone(), first_batch).await;
        assert_eq!(f.inner.enqueued().len(), 2);
        assert_eq!(payloads_of_batch(&f.inner.enqueued()[1]), vec![Bytes::from_static(b"c"), Bytes::from_static(b"d")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sent_batch_reports_folded_letters_in_order() {
        let f = fixture(2);

        let a = letter(b"a");
        let b = letter(b"b");
        f.batch_channel.enqueue(a.clone()).unwrap();
        f.batch_channel.enqueue(b.clone()).unwrap();

        let batch = f.inner.enqueued()[0].clone();
        f.batch_channel.on_sent(f.inner.clone(), batch).await;

        let sent = f.observer.snapshot().into_iter()
            .filter_map(|e| match e {
                ChannelEvent::Sent(l) => Some(l),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(sent, vec![a, b]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_fails_all_folded_letters() {
        let f = fixture(2);

        let a = letter(b"a");
        let b = letter(b"b");
        f.batch_channel.enqueue(a.clone()).unwrap();
        f.batch_channel.enqueue(b.clone()).unwrap();

        let batch = f.inner.enqueued()[0].clone();
        f.batch_channel.on_failed_to_send(f.inner.clone(), vec![batch]).await;

        assert!(f.observer.snapshot().contains(&ChannelEvent::FailedToSend(vec![a, b])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_queued_letters() {
        let f = fixture(100);

        let a = letter(b"a");
        f.batch_channel.enqueue(a.clone()).unwrap();
        f.batch_channel.on_disconnected(f.inner.clone()).await;

        let events = f.observer.snapshot();
        assert!(events.contains(&ChannelEvent::FailedToSend(vec![a])));
        assert_eq!(events.last(), Some(&ChannelEvent::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_signals_readiness() {
        let f = fixture(100);

        f.batch_channel.enqueue(letter(b"a")).unwrap();
        f.observer.wait_for(ChannelEvent::QueueEmpty).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_on_disconnected_channel_is_rejected() {
        let f = fixture(100);
        f.inner.shut_down();

        let a = letter(b"a");
        assert_eq!(f.batch_channel.enqueue(a.clone()), Err(a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_flush_fails_letters() {
        let f = fixture(2);
        f.inner.reject.store(true, std::sync::atomic::Ordering::Release);

        let a = letter(b"a");
        let b = letter(b"b");
        f.batch_channel.enqueue(a.clone()).unwrap();
        f.batch_channel.enqueue(b.clone()).unwrap();

        f.observer.wait_for(ChannelEvent::FailedToSend(vec![a, b])).await;
    }
}
