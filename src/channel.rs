use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::batch::try_unpack_batch;
use crate::config::SocketConfig;
use crate::letter::{Letter, LetterOptions, LetterType};
use crate::node_id::NodeId;
use crate::wire;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// this side dialed the connection and is responsible for re-dialing when it breaks
    Outbound,
    /// the connection was accepted by the listener and is gone for good once it breaks
    Inbound,
}

/// Callbacks for everything that happens on a channel. The socket (or a decorating layer like
///  batching) registers exactly one observer per channel before starting it.
///
/// All callbacks are invoked from the channel's session task, so implementations must not
///  block; anything expensive belongs in a spawned task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelObserver: Send + Sync + 'static {
    async fn on_connected(&self, channel: Arc<dyn LetterChannel>);
    async fn on_initialized(&self, channel: Arc<dyn LetterChannel>, remote: NodeId);
    async fn on_disconnected(&self, channel: Arc<dyn LetterChannel>);
    /// the channel's outgoing queue ran dry - it is ready for more letters
    async fn on_queue_empty(&self, channel: Arc<dyn LetterChannel>);
    async fn on_received(&self, channel: Arc<dyn LetterChannel>, letter: Letter);
    async fn on_sent(&self, channel: Arc<dyn LetterChannel>, letter: Letter);
    /// the given letters were queued or in flight when the channel died
    async fn on_failed_to_send(&self, channel: Arc<dyn LetterChannel>, letters: Vec<Letter>);
}

/// The sending-side surface of a channel, as seen by the dispatcher and the answer path.
#[cfg_attr(test, automock)]
pub trait LetterChannel: Send + Sync + 'static {
    /// Hands a letter to the channel for transmission. Non-blocking: if the channel's queue is
    ///  full or the channel is no longer connected, the letter is handed back unchanged.
    fn enqueue(&self, letter: Letter) -> Result<(), Letter>;

    fn direction(&self) -> Direction;
    fn remote_addr(&self) -> SocketAddr;

    /// the peer's identity, known once the Initialize handshake completed
    fn remote_node_id(&self) -> Option<NodeId>;

    fn is_connected(&self) -> bool;

    /// Initiates teardown. Queued and in-flight letters are reported via
    ///  [ChannelObserver::on_failed_to_send].
    fn shut_down(&self);
}

/// A single point-to-point connection, alive for the lifetime of one TCP connection. All I/O
///  and protocol handling (handshake, heartbeats, acks, liveness) happens in one session task
///  spawned by [Channel::start]; the rest of the socket talks to it through the queue.
///
/// Channels are one-shot: when the connection breaks, the channel is done, and reconnecting
///  means creating a fresh one.
pub struct Channel {
    me: Weak<Channel>,
    config: Arc<SocketConfig>,
    direction: Direction,
    remote_addr: SocketAddr,
    remote_node_id: OnceLock<NodeId>,
    observer: OnceLock<Arc<dyn ChannelObserver>>,
    send_tx: mpsc::Sender<Letter>,
    send_rx: Mutex<Option<mpsc::Receiver<Letter>>>,
    inbound_stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    shutdown: Notify,
}

impl Channel {
    pub fn new_outbound(config: Arc<SocketConfig>, remote_addr: SocketAddr) -> Arc<Channel> {
        Self::new(config, Direction::Outbound, remote_addr, None)
    }

    pub fn new_inbound(config: Arc<SocketConfig>, stream: TcpStream, remote_addr: SocketAddr) -> Arc<Channel> {
        Self::new(config, Direction::Inbound, remote_addr, Some(stream))
    }

    fn new(
        config: Arc<SocketConfig>,
        direction: Direction,
        remote_addr: SocketAddr,
        inbound_stream: Option<TcpStream>,
    ) -> Arc<Channel> {
        let (send_tx, send_rx) = mpsc::channel(config.channel_queue_size);

        Arc::new_cyclic(|me| Channel {
            me: me.clone(),
            config,
            direction,
            remote_addr,
            remote_node_id: OnceLock::new(),
            observer: OnceLock::new(),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            inbound_stream: Mutex::new(inbound_stream),
            connected: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Must be called exactly once, before [Channel::start].
    pub fn set_observer(&self, observer: Arc<dyn ChannelObserver>) {
        if self.observer.set(observer).is_err() {
            warn!("observer for channel {:?} was set twice - ignoring the second", self.remote_addr);
        }
    }

    /// Spawns the channel's session task.
    pub fn start(&self) {
        let Some(channel) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            channel.run().await;
        });
    }

    async fn run(self: Arc<Channel>) {
        let mut send_rx = match self.send_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("channel {:?} was started twice - ignoring", self.remote_addr);
                return;
            }
        };

        let stream = match self.acquire_stream().await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                // shut down before the connection was established
                self.teardown(&mut send_rx, None).await;
                return;
            }
            Err(e) => {
                debug!("channel {:?} failed to connect: {}", self.remote_addr, e);
                self.teardown(&mut send_rx, None).await;
                return;
            }
        };

        self.connected.store(true, Ordering::Release);
        self.notify_connected().await;

        let mut in_flight = None;
        match self.session(stream, &mut send_rx, &mut in_flight).await {
            Ok(()) => debug!("channel {:?} closed", self.remote_addr),
            Err(e) => debug!("channel {:?} broke: {}", self.remote_addr, e),
        }

        self.teardown(&mut send_rx, in_flight).await;
    }

    async fn acquire_stream(&self) -> anyhow::Result<Option<TcpStream>> {
        match self.direction {
            Direction::Outbound => {
                trace!("dialing {:?}", self.remote_addr);
                tokio::select! {
                    r = TcpStream::connect(self.remote_addr) => Ok(Some(r?)),
                    _ = self.shutdown.notified() => Ok(None),
                }
            }
            Direction::Inbound => {
                match self.inbound_stream.lock().unwrap().take() {
                    Some(stream) => Ok(Some(stream)),
                    None => bail!("inbound channel without a stream"),
                }
            }
        }
    }

    async fn session(
        &self,
        stream: TcpStream,
        send_rx: &mut mpsc::Receiver<Letter>,
        in_flight: &mut Option<Letter>,
    ) -> anyhow::Result<()> {
        let _ = stream.set_nodelay(true);
        let (mut read, mut write) = stream.into_split();

        self.write_letter(&Letter::initialize(self.config.node_id), &mut write).await?;

        let mut read_buf = BytesMut::with_capacity(16*1024);
        let mut last_received = Instant::now();
        let mut last_sent = Instant::now();

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                r = read.read_buf(&mut read_buf) => {
                    match r {
                        Ok(0) => {
                            debug!("peer {:?} closed the connection", self.remote_addr);
                            return Ok(());
                        }
                        Ok(_) => {
                            last_received = Instant::now();
                            while let Some(letter) = wire::try_decode_frame(&mut read_buf, self.config.max_letter_size)? {
                                self.handle_received(letter, &mut write, in_flight).await?;
                            }
                        }
                        Err(e) => bail!("read error: {}", e),
                    }
                }
                letter = send_rx.recv(), if in_flight.is_none() => {
                    // the sender half lives in self, so the queue cannot be closed here
                    if let Some(letter) = letter {
                        if let Err(e) = self.write_letter(&letter, &mut write).await {
                            // park it so teardown reports it as failed
                            *in_flight = Some(letter);
                            return Err(e);
                        }
                        last_sent = Instant::now();
                        if letter.options.contains(LetterOptions::ACK) {
                            // the send slot stays occupied until the peer acks
                            *in_flight = Some(letter);
                        }
                        else {
                            self.notify_sent(letter).await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if last_received.elapsed() >= self.config.liveness_timeout {
                        bail!("nothing received for {:?} - peer considered dead", self.config.liveness_timeout);
                    }
                    if last_sent.elapsed() >= self.config.heartbeat_interval {
                        self.write_letter(&Letter::heartbeat(), &mut write).await?;
                        last_sent = Instant::now();
                    }
                }
                _ = self.shutdown.notified() => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_received(
        &self,
        letter: Letter,
        write: &mut OwnedWriteHalf,
        in_flight: &mut Option<Letter>,
    ) -> anyhow::Result<()> {
        trace!("received {:?} letter from {:?}", letter.letter_type, self.remote_addr);

        match letter.letter_type {
            LetterType::Initialize => {
                let Some(part) = letter.parts.first() else {
                    bail!("Initialize letter without a node id");
                };
                let remote = NodeId::try_deser(&mut &part[..])?;

                if self.remote_node_id.set(remote).is_err() {
                    warn!("peer {:?} sent a second Initialize - ignoring", self.remote_addr);
                    return Ok(());
                }
                debug!("channel {:?} initialized, peer is {:?}", self.remote_addr, remote);
                self.notify_initialized(remote).await;
            }
            LetterType::Heartbeat => {
                // receipt alone refreshed the liveness deadline
            }
            LetterType::Ack => {
                match in_flight.take() {
                    Some(confirmed) if confirmed.id == letter.id => {
                        self.notify_sent(confirmed).await;
                    }
                    Some(confirmed) => {
                        warn!("peer {:?} acked {:?} but {:?} is in flight - dropping the channel",
                            self.remote_addr, letter.id, confirmed.id);
                        // park it so teardown reports it as failed
                        *in_flight = Some(confirmed);
                        bail!("ack for a letter that is not in flight");
                    }
                    None => {
                        warn!("peer {:?} sent a spurious ack - ignoring", self.remote_addr);
                    }
                }
            }
            LetterType::Batch => {
                for folded in try_unpack_batch(&letter)? {
                    if folded.letter_type == LetterType::User {
                        self.deliver(folded, write).await?;
                    }
                    else {
                        warn!("peer {:?} folded a {:?} letter into a batch - ignoring it",
                            self.remote_addr, folded.letter_type);
                    }
                }
            }
            LetterType::User => {
                self.deliver(letter, write).await?;
            }
        }
        Ok(())
    }

    async fn deliver(&self, letter: Letter, write: &mut OwnedWriteHalf) -> anyhow::Result<()> {
        if letter.options.contains(LetterOptions::ACK) {
            self.write_letter(&Letter::ack(letter.id), write).await?;
        }
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_received(me, letter).await;
        }
        Ok(())
    }

    async fn write_letter(&self, letter: &Letter, write: &mut OwnedWriteHalf) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        wire::encode_frame(letter, self.config.node_id, &mut buf);
        write.write_all(&buf).await?;
        Ok(())
    }

    async fn teardown(&self, send_rx: &mut mpsc::Receiver<Letter>, in_flight: Option<Letter>) {
        self.connected.store(false, Ordering::Release);

        send_rx.close();
        let mut failed = Vec::new();
        if let Some(letter) = in_flight {
            failed.push(letter);
        }
        while let Ok(letter) = send_rx.try_recv() {
            failed.push(letter);
        }

        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            if !failed.is_empty() {
                observer.on_failed_to_send(me.clone(), failed).await;
            }
            observer.on_disconnected(me).await;
        }
    }

    fn as_dyn(&self) -> Option<Arc<dyn LetterChannel>> {
        self.me.upgrade()
            .map(|me| me as Arc<dyn LetterChannel>)
    }

    async fn notify_connected(&self) {
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_connected(me).await;
        }
    }

    async fn notify_initialized(&self, remote: NodeId) {
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_initialized(me, remote).await;
        }
    }

    async fn notify_sent(&self, letter: Letter) {
        if let (Some(observer), Some(me)) = (self.observer.get(), self.as_dyn()) {
            observer.on_sent(me.clone(), letter).await;

            // the queue-empty check races with concurrent enqueues, but a missed signal here is
            //  always followed by another send (and another check) for the letter that won the race
            if self.send_tx.capacity() == self.send_tx.max_capacity() {
                observer.on_queue_empty(me).await;
            }
        }
    }
}

impl LetterChannel for Channel {
    fn enqueue(&self, letter: Letter) -> Result<(), Letter> {
        if !self.is_connected() {
            return Err(letter);
        }
        self.send_tx.try_send(letter)
            .map_err(|e| e.into_inner())
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn remote_node_id(&self) -> Option<NodeId> {
        self.remote_node_id.get().copied()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn shut_down(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
pub mod test_support {
    use std::time::Duration;

    use super::*;

    /// an observer recording everything that happens, for assertions in channel-level tests
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<ChannelEvent>>,
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum ChannelEvent {
        Connected,
        Initialized(NodeId),
        Disconnected,
        QueueEmpty,
        Received(Letter),
        Sent(Letter),
        FailedToSend(Vec<Letter>),
    }

    impl RecordingObserver {
        pub fn snapshot(&self) -> Vec<ChannelEvent> {
            self.events.lock().unwrap().clone()
        }

        pub async fn wait_until(&self, predicate: impl Fn(&[ChannelEvent]) -> bool) {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if predicate(&self.events.lock().unwrap()) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("timeout waiting for channel event");
        }

        pub async fn wait_for(&self, event: ChannelEvent) {
            self.wait_until(|events| events.contains(&event)).await;
        }

        fn record(&self, event: ChannelEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl ChannelObserver for RecordingObserver {
        async fn on_connected(&self, _channel: Arc<dyn LetterChannel>) {
            self.record(ChannelEvent::Connected);
        }
        async fn on_initialized(&self, _channel: Arc<dyn LetterChannel>, remote: NodeId) {
            self.record(ChannelEvent::Initialized(remote));
        }
        async fn on_disconnected(&self, _channel: Arc<dyn LetterChannel>) {
            self.record(ChannelEvent::Disconnected);
        }
        async fn on_queue_empty(&self, _channel: Arc<dyn LetterChannel>) {
            self.record(ChannelEvent::QueueEmpty);
        }
        async fn on_received(&self, _channel: Arc<dyn LetterChannel>, letter: Letter) {
            self.record(ChannelEvent::Received(letter));
        }
        async fn on_sent(&self, _channel: Arc<dyn LetterChannel>, letter: Letter) {
            self.record(ChannelEvent::Sent(letter));
        }
        async fn on_failed_to_send(&self, _channel: Arc<dyn LetterChannel>, letters: Vec<Letter>) {
            self.record(ChannelEvent::FailedToSend(letters));
        }
    }
}
