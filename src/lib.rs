//! Point-to-point reliable messaging over TCP, exchanging discrete *letters* instead of byte
//!  streams.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *letters*: a small header plus an ordered sequence
//!   of opaque binary parts, never a stream of bytes
//! * Peers are symmetric - both sides can listen and connect, and the protocol after the
//!   handshake is identical in both directions
//!   * nodes are identified by a generated id exchanged in the handshake, not by their network
//!     address, so answers find their way back regardless of who dialed whom
//! * Delivery is reliable per channel: at most one letter is in flight at a time, and a letter
//!   asking for an ack occupies the slot until the peer confirms it
//!   * exactly one of 'sent' / 'failed to send' is reported per accepted letter
//! * Failed letters are routed by policy, not exceptions: requeue with priority, discard with
//!   notification, or discard silently - chosen per letter via its option flags
//! * Letters sent in quick succession are folded into batches to cut per-frame overhead,
//!   bounded by a sliding timer, a hard timer and a count limit
//! * Broken outbound connections are re-dialed transparently with capped exponential backoff;
//!   heartbeats detect dead peers that do not close their socket
//! * A typed layer on top maps letters to self-serializing message types, correlates requests
//!   with replies, and dispatches received messages to registered handlers
//!
//! ## Wire format
//!
//! Each frame on the wire is a length-prefixed letter - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  letter length (u32), not counting this prefix
//! 4:  letter type (u8): 0x01 Ack, 0x02 Initialize, 0x03 Heartbeat, 0x04 Batch, 0x64 User
//! 5:  options (u8 bit flags)
//! 6:  correlation id (16 bytes, all zero = no correlation)
//! 22: address count (varint), then 16 bytes per node id - the hop chain, `address[0]` being
//!      the originating node
//! *:  part count (varint), then per part: length (varint) + payload bytes
//! ```
//!
//! The first letter on every connection, in both directions independently, is Initialize
//!  carrying the sender's node id as its sole part. A Batch letter's parts are themselves
//!  fully-encoded letters (without the length prefix).

mod atomic_map;
mod backoff;
pub mod batch;
pub mod batch_channel;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod letter;
pub mod listener;
pub mod node_id;
pub mod socket;
pub mod typed;
pub mod wire;
