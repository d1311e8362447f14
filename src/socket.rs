use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::atomic_map::AtomicMap;
use crate::backoff::ReconnectBackoff;
use crate::batch_channel::BatchChannel;
use crate::channel::{Channel, ChannelObserver, Direction, LetterChannel};
use crate::config::SocketConfig;
use crate::dispatcher::LetterDispatcher;
use crate::letter::{Letter, LetterOptions};
use crate::listener::Listener;
use crate::node_id::NodeId;

/// Application-facing callbacks of a socket. All methods default to doing nothing, so an
///  implementation only spells out what it cares about.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SocketObserver: Send + Sync + 'static {
    async fn on_received(&self, _letter: Letter) {}
    async fn on_sent(&self, _letter: Letter) {}
    /// the letter could not be delivered and was dropped
    async fn on_discarded(&self, _letter: Letter) {}
    /// the letter could not be delivered and went back into the send queue with priority
    async fn on_requeued(&self, _letter: Letter) {}
    async fn on_connected(&self, _remote: NodeId, _remote_addr: SocketAddr, _direction: Direction) {}
    async fn on_disconnected(&self, _remote: NodeId, _remote_addr: SocketAddr, _direction: Direction) {}
}

/// The aggregate tying everything together: listeners inject inbound connections, `connect`
///  creates outbound ones (re-dialed with capped exponential backoff when they break), the
///  dispatcher spreads outgoing letters over whatever channel is ready, and a route table keyed
///  by the peers' node ids routes answers back to where the original letter came from.
pub struct LetterSocket {
    me: Weak<LetterSocket>,
    config: Arc<SocketConfig>,
    dispatcher: LetterDispatcher,
    routes: AtomicMap<NodeId, Arc<dyn LetterChannel>>,
    channels: Mutex<Vec<Weak<Channel>>>,
    listeners: Mutex<Vec<Listener>>,
    outbound_backoffs: Mutex<FxHashMap<SocketAddr, ReconnectBackoff>>,
    observer: OnceLock<Arc<dyn SocketObserver>>,
    shutting_down: AtomicBool,
}

impl LetterSocket {
    pub fn new(config: SocketConfig) -> anyhow::Result<Arc<LetterSocket>> {
        config.validate()?;

        Ok(Arc::new_cyclic(|me| LetterSocket {
            me: me.clone(),
            config: Arc::new(config),
            dispatcher: LetterDispatcher::new(),
            routes: AtomicMap::new(),
            channels: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            outbound_backoffs: Mutex::new(FxHashMap::default()),
            observer: OnceLock::new(),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// the node ids of all peers with a fully initialized channel
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.routes.snapshot()
            .keys()
            .copied()
            .collect()
    }

    /// Must be called before any connection is made.
    pub fn set_observer(&self, observer: Arc<dyn SocketObserver>) {
        if self.observer.set(observer).is_err() {
            warn!("socket observer was set twice - ignoring the second");
        }
    }

    /// Starts listening for inbound connections. Returns the actual local address, which
    ///  matters when binding to port 0.
    pub async fn bind(&self, bind_addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let Some(me) = self.me.upgrade() else {
            bail!("socket is shutting down");
        };
        let listener = Listener::bind(me, bind_addr).await?;
        let local_addr = listener.local_addr();
        self.listeners.lock().unwrap().push(listener);
        Ok(local_addr)
    }

    /// Hooks up an inbound connection, wherever it was accepted.
    pub fn accept_incoming(&self, stream: TcpStream, remote_addr: SocketAddr) {
        if self.shutting_down.load(Ordering::Acquire) {
            debug!("shutting down - dropping inbound connection from {:?}", remote_addr);
            return;
        }
        let channel = Channel::new_inbound(self.config.clone(), stream, remote_addr);
        self.hook_up(channel);
    }

    /// Establishes (and keeps re-establishing) an outbound connection to the given address.
    pub fn connect(&self, remote_addr: SocketAddr) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        {
            let mut backoffs = self.outbound_backoffs.lock().unwrap();
            if backoffs.contains_key(&remote_addr) {
                debug!("already connecting to {:?} - ignoring", remote_addr);
                return;
            }
            backoffs.insert(remote_addr, ReconnectBackoff::new(&self.config.reconnect));
        }

        info!("connecting to {:?}", remote_addr);
        let channel = Channel::new_outbound(self.config.clone(), remote_addr);
        self.hook_up(channel);
    }

    /// Queues a letter for delivery over whichever channel becomes available first. Returns the
    ///  letter's correlation id, freshly assigned if the `UNIQUE_ID` option asked for one.
    pub fn send(&self, mut letter: Letter) -> Option<Uuid> {
        if letter.options.contains(LetterOptions::UNIQUE_ID) && letter.id.is_none() {
            letter.id = Some(Uuid::new_v4());
        }
        let id = letter.id;

        trace!("queueing {:?} letter {:?}", letter.letter_type, id);
        self.dispatcher.send(letter);
        id
    }

    /// Sends a reply over the channel connected to the node the original letter came from,
    ///  bypassing the dispatcher.
    pub async fn answer(&self, answering_to: &Letter, mut reply: Letter) -> anyhow::Result<()> {
        let Some(target) = answering_to.origin() else {
            bail!("cannot answer a letter without an address");
        };

        reply.options |= LetterOptions::ANSWER;
        if reply.options.contains(LetterOptions::UNIQUE_ID) && reply.id.is_none() {
            reply.id = Some(Uuid::new_v4());
        }

        let Some(channel) = self.routes.get(&target) else {
            bail!("no route to {:?}", target);
        };

        if let Err(reply) = channel.enqueue(reply) {
            self.handle_failed(reply).await;
        }
        Ok(())
    }

    /// Stops all listeners, discards queued letters, and tears down every channel. Letters
    ///  queued on the channels themselves go through the usual failure routing.
    pub async fn shut_down(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down socket {:?}", self.config.node_id);

        self.listeners.lock().unwrap().clear();
        self.outbound_backoffs.lock().unwrap().clear();

        for letter in self.dispatcher.drain() {
            self.discard(letter).await;
        }

        let channels = self.channels.lock().unwrap().clone();
        for channel in channels {
            if let Some(channel) = channel.upgrade() {
                channel.shut_down();
            }
        }
    }

    fn hook_up(&self, channel: Arc<Channel>) {
        let Some(me) = self.me.upgrade() else { return };
        {
            let mut channels = self.channels.lock().unwrap();
            channels.retain(|c| c.strong_count() > 0);
            channels.push(Arc::downgrade(&channel));
        }

        let me = me as Arc<dyn ChannelObserver>;
        if self.config.batch.enabled {
            let batch_channel = BatchChannel::new(channel.clone(), &self.config);
            channel.set_observer(batch_channel.clone());
            batch_channel.set_observer(me);
        }
        else {
            channel.set_observer(me);
        }
        channel.start();
    }

    fn schedule_reconnect(&self, remote_addr: SocketAddr) {
        let delay = {
            let mut backoffs = self.outbound_backoffs.lock().unwrap();
            match backoffs.get_mut(&remote_addr) {
                Some(backoff) => backoff.next_delay(),
                None => return, // not an address we keep connected
            }
        };

        debug!("reconnecting to {:?} in {:?}", remote_addr, delay);
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(socket) = me.upgrade() else { return };
            if socket.shutting_down.load(Ordering::Acquire) {
                return;
            }
            if !socket.outbound_backoffs.lock().unwrap().contains_key(&remote_addr) {
                return;
            }
            let channel = Channel::new_outbound(socket.config.clone(), remote_addr);
            socket.hook_up(channel);
        });
    }

    async fn handle_failed(&self, letter: Letter) {
        if letter.options.contains(LetterOptions::MULTICAST) {
            // a fanned-out letter may have made it elsewhere - resending would duplicate it
            self.discard(letter).await;
        }
        else if letter.options.contains(LetterOptions::REQUEUE) {
            debug!("requeueing letter {:?}", letter.id);
            if let Some(observer) = self.observer.get() {
                observer.on_requeued(letter.clone()).await;
            }
            self.dispatcher.send_priority(letter);
        }
        else {
            self.discard(letter).await;
        }
    }

    async fn discard(&self, letter: Letter) {
        if letter.options.contains(LetterOptions::SILENT_DISCARD) {
            trace!("silently discarding letter {:?}", letter.id);
            return;
        }
        debug!("discarding letter {:?}", letter.id);
        if let Some(observer) = self.observer.get() {
            observer.on_discarded(letter).await;
        }
    }
}

/// Events coming up from the channels (through the batching layer when enabled).
#[async_trait]
impl ChannelObserver for LetterSocket {
    async fn on_connected(&self, channel: Arc<dyn LetterChannel>) {
        debug!("channel {:?} connected, awaiting handshake", channel.remote_addr());
    }

    async fn on_initialized(&self, channel: Arc<dyn LetterChannel>, remote: NodeId) {
        info!("channel {:?} ({:?}) initialized - peer is {:?}", channel.remote_addr(), channel.direction(), remote);

        self.routes.update(|routes| {
            routes.insert(remote, channel.clone());
        });

        if channel.direction() == Direction::Outbound {
            if let Some(backoff) = self.outbound_backoffs.lock().unwrap().get_mut(&channel.remote_addr()) {
                backoff.reset();
            }
        }

        self.dispatcher.channel_ready(channel.clone());

        if let Some(observer) = self.observer.get() {
            observer.on_connected(remote, channel.remote_addr(), channel.direction()).await;
        }
    }

    async fn on_disconnected(&self, channel: Arc<dyn LetterChannel>) {
        debug!("channel {:?} disconnected", channel.remote_addr());

        if let Some(remote) = channel.remote_node_id() {
            self.routes.update(|routes| {
                // a replacement channel may have registered already - leave it alone then
                if routes.get(&remote).map(|r| Arc::ptr_eq(r, &channel)) == Some(true) {
                    routes.remove(&remote);
                }
            });

            if let Some(observer) = self.observer.get() {
                observer.on_disconnected(remote, channel.remote_addr(), channel.direction()).await;
            }
        }

        if channel.direction() == Direction::Outbound && !self.shutting_down.load(Ordering::Acquire) {
            self.schedule_reconnect(channel.remote_addr());
        }
    }

    async fn on_queue_empty(&self, channel: Arc<dyn LetterChannel>) {
        self.dispatcher.channel_ready(channel);
    }

    async fn on_received(&self, _channel: Arc<dyn LetterChannel>, letter: Letter) {
        if let Some(observer) = self.observer.get() {
            observer.on_received(letter).await;
        }
    }

    async fn on_sent(&self, _channel: Arc<dyn LetterChannel>, letter: Letter) {
        if let Some(observer) = self.observer.get() {
            observer.on_sent(letter).await;
        }
    }

    async fn on_failed_to_send(&self, _channel: Arc<dyn LetterChannel>, letters: Vec<Letter>) {
        for letter in letters {
            self.handle_failed(letter).await;
        }
    }
}
