use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};
use uuid::Uuid;

/// A node's identity, independent of its network address. It is generated freshly for every
///  socket instance, exchanged in the Initialize handshake, and recorded in letters' address
///  chains so an answer can be routed back to the channel connected to the originating node.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn random() -> NodeId {
        NodeId(Uuid::new_v4())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeId> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated node id: {} bytes remaining", buf.remaining());
        }
        let mut bytes = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut bytes);
        Ok(NodeId(Uuid::from_bytes(bytes)))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let full = self.0.simple().to_string();
        write!(f, "[{}]", &full[..8])
    }
}
