use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::letter::{Letter, LetterOptions, LetterType};
use crate::socket::{LetterSocket, SocketObserver};

use super::answerable::Answerable;
use super::message::{MessageTypeId, TypedMessage};

/// A handler for one message type, constructed freshly per received message through a
///  [HandlerFactory].
#[async_trait]
pub trait TypedHandler<M: TypedMessage>: Send + Sync {
    async fn handle(&self, message: Answerable<M>);
}

/// Produces handler instances. A factory is the seam for handlers that need constructor
///  arguments (a database pool, say); handlers without any use [DefaultHandlerFactory].
pub trait HandlerFactory<H>: Send + Sync + 'static {
    fn create(&self) -> H;
}

pub struct DefaultHandlerFactory;

impl<H: Default> HandlerFactory<H> for DefaultHandlerFactory {
    fn create(&self) -> H {
        H::default()
    }
}

type Registration = Arc<
    dyn Fn(Arc<TypedSocket>, Letter) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

enum Outstanding {
    /// a [TypedSocket::request] caller suspended on the reply
    Awaiting(oneshot::Sender<Letter>),
    /// a [TypedSocket::send_with_callback] continuation
    Callback(Box<dyn FnOnce(Arc<TypedSocket>, anyhow::Result<Letter>) + Send>),
}

/// Typed façade over a [LetterSocket]: messages instead of letters, request/reply correlation,
///  and per-message-type handler dispatch. Creating it registers the typed receive path as the
///  socket's observer, so there is one typed socket per letter socket.
pub struct TypedSocket {
    me: Weak<TypedSocket>,
    socket: Arc<LetterSocket>,
    outstandings: Mutex<FxHashMap<Uuid, Outstanding>>,
    registrations: Mutex<FxHashMap<MessageTypeId, Vec<Registration>>>,
    reply_timeout: Option<Duration>,
}

impl TypedSocket {
    pub fn new(socket: Arc<LetterSocket>) -> Arc<TypedSocket> {
        let reply_timeout = socket.config().reply_timeout;

        let typed = Arc::new_cyclic(|me| TypedSocket {
            me: me.clone(),
            socket: socket.clone(),
            outstandings: Mutex::new(FxHashMap::default()),
            registrations: Mutex::new(FxHashMap::default()),
            reply_timeout,
        });

        socket.set_observer(Arc::new(TypedReceiver {
            typed: typed.me.clone(),
        }));
        typed
    }

    pub fn socket(&self) -> &Arc<LetterSocket> {
        &self.socket
    }

    /// Fire-and-forget send to whichever peer's channel is available first.
    pub fn send<M: TypedMessage>(&self, message: &M) {
        self.socket.send(Self::to_letter(message, None));
    }

    /// Sends a message and suspends the calling task until the matching reply arrives, the
    ///  reply timeout expires, or the socket goes away.
    pub async fn request<Q: TypedMessage, R: TypedMessage>(&self, message: &Q) -> anyhow::Result<Answerable<R>> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.outstandings.lock().unwrap().insert(id, Outstanding::Awaiting(tx));

        self.socket.send(Self::to_letter(message, Some(id)));

        let reply = match self.reply_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.outstandings.lock().unwrap().remove(&id);
                    bail!("no reply to {:?} within {:?}", Q::TYPE_ID, timeout);
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(letter) => self.decode_answerable(letter),
            Err(_) => {
                self.outstandings.lock().unwrap().remove(&id);
                bail!("socket went away before a reply to {:?} arrived", Q::TYPE_ID);
            }
        }
    }

    /// Sends a message and invokes the callback with the reply (or the timeout error) instead
    ///  of suspending anybody. The callback runs on the receiving channel's task.
    pub fn send_with_callback<Q, R, F>(&self, message: &Q, callback: F)
    where
        Q: TypedMessage,
        R: TypedMessage,
        F: FnOnce(anyhow::Result<Answerable<R>>) + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.outstandings.lock().unwrap().insert(
            id,
            Outstanding::Callback(Box::new(move |typed, reply| {
                callback(reply.and_then(|letter| typed.decode_answerable(letter)));
            })),
        );

        self.socket.send(Self::to_letter(message, Some(id)));

        if let Some(timeout) = self.reply_timeout {
            let me = self.me.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(typed) = me.upgrade() else { return };
                let expired = typed.outstandings.lock().unwrap().remove(&id);
                if let Some(Outstanding::Callback(callback)) = expired {
                    debug!("request {:?} expired without a reply", id);
                    callback(typed.clone(), Err(anyhow!("no reply within {:?}", timeout)));
                }
            });
        }
    }

    /// Replies to a received letter: the reply carries the request's correlation id and is
    ///  routed over the channel the request came in on.
    pub async fn answer<M: TypedMessage>(&self, answering_to: &Letter, message: &M) -> anyhow::Result<()> {
        let reply = Self::to_letter(message, answering_to.id);
        self.socket.answer(answering_to, reply).await
    }

    /// Registers a closure for all received messages of type `M`. Several registrations for the
    ///  same type id are all invoked, in registration order.
    pub fn register<M, F, Fut>(&self, handler: F)
    where
        M: TypedMessage,
        F: Fn(Answerable<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let registration: Registration = Arc::new(move |typed, letter| {
            let handler = handler.clone();
            Box::pin(async move {
                match typed.decode_answerable::<M>(letter) {
                    Ok(answerable) => handler(answerable).await,
                    Err(e) => trace!("dropping undecodable {:?} message: {}", M::TYPE_ID, e),
                }
            })
        });

        self.registrations.lock().unwrap()
            .entry(M::TYPE_ID)
            .or_default()
            .push(registration);
    }

    /// Registers a handler type constructed via `Default`, one fresh instance per message.
    pub fn register_handler<M, H>(&self)
    where
        M: TypedMessage,
        H: TypedHandler<M> + Default + 'static,
    {
        self.register_handler_with_factory::<M, H, _>(DefaultHandlerFactory);
    }

    pub fn register_handler_with_factory<M, H, F>(&self, factory: F)
    where
        M: TypedMessage,
        H: TypedHandler<M> + 'static,
        F: HandlerFactory<H>,
    {
        let factory = Arc::new(factory);
        self.register(move |answerable: Answerable<M>| {
            let factory = factory.clone();
            async move {
                factory.create().handle(answerable).await;
            }
        });
    }

    async fn on_received(&self, letter: Letter) {
        if letter.parts.len() != 2 {
            trace!("dropping a letter with {} parts instead of 2", letter.parts.len());
            return;
        }
        let Some(me) = self.me.upgrade() else { return };

        // outstanding resolution and registration dispatch are independent - a letter can
        //  settle a request and still be handled like any other received message
        let outstanding = match letter.id {
            Some(id) => self.outstandings.lock().unwrap().remove(&id),
            None => None,
        };
        match outstanding {
            Some(Outstanding::Awaiting(tx)) => {
                // the requester may have timed out concurrently - nothing to do then
                let _ = tx.send(letter.clone());
            }
            Some(Outstanding::Callback(callback)) => {
                callback(me.clone(), Ok(letter.clone()));
            }
            None => {}
        }

        let Ok(type_id) = MessageTypeId::try_deser(&mut &letter.parts[0][..]) else {
            trace!("dropping a letter with an unparseable type id");
            return;
        };

        let registrations = self.registrations.lock().unwrap().get(&type_id).cloned();
        match registrations {
            Some(registrations) => {
                for registration in &registrations {
                    registration(me.clone(), letter.clone()).await;
                }
            }
            None => {
                trace!("no handler registered for {:?} - dropping", type_id);
            }
        }
    }

    fn decode_answerable<M: TypedMessage>(&self, letter: Letter) -> anyhow::Result<Answerable<M>> {
        if letter.parts.len() != 2 {
            bail!("expected a two-part letter, got {} parts", letter.parts.len());
        }

        let type_id = MessageTypeId::try_deser(&mut &letter.parts[0][..])?;
        if type_id != M::TYPE_ID {
            bail!("expected a {:?} message, got {:?}", M::TYPE_ID, type_id);
        }

        let message = M::try_deser(&mut &letter.parts[1][..])?;
        let Some(me) = self.me.upgrade() else {
            bail!("socket is shutting down");
        };
        Ok(Answerable::new(me, letter, message))
    }

    fn to_letter<M: TypedMessage>(message: &M, id: Option<Uuid>) -> Letter {
        let mut type_id = BytesMut::with_capacity(MessageTypeId::SERIALIZED_LEN);
        M::TYPE_ID.ser(&mut type_id);

        let mut payload = BytesMut::new();
        message.ser(&mut payload);

        Letter {
            id,
            letter_type: LetterType::User,
            options: LetterOptions::UNIQUE_ID | LetterOptions::ACK,
            address: Vec::new(),
            parts: vec![type_id.freeze(), payload.freeze()],
        }
    }
}

/// Adapter feeding the socket's receive events into the typed layer without creating an Arc
///  cycle between the two sockets.
struct TypedReceiver {
    typed: Weak<TypedSocket>,
}

#[async_trait]
impl SocketObserver for TypedReceiver {
    async fn on_received(&self, letter: Letter) {
        if let Some(typed) = self.typed.upgrade() {
            typed.on_received(letter).await;
        }
    }
}
