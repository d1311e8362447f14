use bitflags::bitflags;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::node_id::NodeId;

/// The one-byte type discriminator at the start of every letter on the wire. Everything except
///  `User` is internal protocol traffic; only `User` (and unpacked `Batch` contents) ever reach
///  the application.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LetterType {
    Ack = 0x01,
    Initialize = 0x02,
    Heartbeat = 0x03,
    Batch = 0x04,
    User = 0x64,
}

bitflags! {
    /// Independent per-letter flags. They travel with the letter and steer delivery policy on
    ///  both the sending side (failure routing, ack handling) and the receiving side.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct LetterOptions: u8 {
        /// on send failure, resubmit with priority instead of discarding
        const REQUEUE = 0x01;
        /// suppress the `on_discarded` notification (the letter is still discarded)
        const SILENT_DISCARD = 0x02;
        /// the letter was fanned out to multiple channels - never requeued on partial failure
        const MULTICAST = 0x04;
        /// the letter is a reply, routed by the original sender's address
        const ANSWER = 0x08;
        /// the letter carries a freshly generated correlation id
        const UNIQUE_ID = 0x10;
        /// hold the send slot until the peer acknowledges receipt
        const ACK = 0x20;
    }
}

/// The unit of message exchange: a small header plus an ordered sequence of opaque binary parts.
///  A letter is immutable once handed to a socket; layers below clone it as needed for
///  in-flight tracking.
///
/// `id` is the correlation identifier. `None` means "no correlation" - the nil UUID sentinel
///  exists only on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Letter {
    pub id: Option<Uuid>,
    pub letter_type: LetterType,
    pub options: LetterOptions,
    /// hop chain of node ids, `address[0]` being the originating node. Left empty by senders
    ///  and stamped with the socket's own id at encode time.
    pub address: Vec<NodeId>,
    pub parts: Vec<Bytes>,
}

impl Letter {
    pub fn user(options: LetterOptions, parts: Vec<Bytes>) -> Letter {
        Letter {
            id: None,
            letter_type: LetterType::User,
            options,
            address: Vec::new(),
            parts,
        }
    }

    /// handshake letter, sent first on every new connection in both directions independently
    pub fn initialize(node_id: NodeId) -> Letter {
        Letter {
            id: None,
            letter_type: LetterType::Initialize,
            options: LetterOptions::empty(),
            address: Vec::new(),
            parts: vec![Bytes::copy_from_slice(node_id.0.as_bytes())],
        }
    }

    pub fn heartbeat() -> Letter {
        Letter {
            id: None,
            letter_type: LetterType::Heartbeat,
            options: LetterOptions::empty(),
            address: Vec::new(),
            parts: Vec::new(),
        }
    }

    /// confirmation for a previously received letter that had the `ACK` option set. Carries the
    ///  confirmed letter's correlation id so the sender can match it.
    pub fn ack(id: Option<Uuid>) -> Letter {
        Letter {
            id,
            letter_type: LetterType::Ack,
            options: LetterOptions::empty(),
            address: Vec::new(),
            parts: Vec::new(),
        }
    }

    /// a letter folding several fully-encoded letters into one frame, one per part
    pub fn batch(parts: Vec<Bytes>) -> Letter {
        Letter {
            id: None,
            letter_type: LetterType::Batch,
            options: LetterOptions::empty(),
            address: Vec::new(),
            parts,
        }
    }

    /// the node that originally sent this letter, if the address chain is populated
    pub fn origin(&self) -> Option<NodeId> {
        self.address.first().copied()
    }
}
