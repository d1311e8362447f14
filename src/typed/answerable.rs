use std::sync::Arc;

use crate::letter::Letter;
use crate::node_id::NodeId;

use super::message::TypedMessage;
use super::typed_socket::TypedSocket;

/// A received message together with everything needed to answer it: the sender's identity
///  travels in the underlying letter's address chain, and the letter's id correlates the reply
///  with the sender's outstanding request.
pub struct Answerable<M: TypedMessage> {
    socket: Arc<TypedSocket>,
    letter: Letter,
    message: M,
}

impl<M: TypedMessage> Answerable<M> {
    pub(super) fn new(socket: Arc<TypedSocket>, letter: Letter, message: M) -> Answerable<M> {
        Answerable {
            socket,
            letter,
            message,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    pub fn sender(&self) -> Option<NodeId> {
        self.letter.origin()
    }

    /// Sends a reply back to the node this message came from.
    pub async fn answer<R: TypedMessage>(&self, reply: &R) -> anyhow::Result<()> {
        self.socket.answer(&self.letter, reply).await
    }
}
