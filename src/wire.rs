//! Wire codec for letters.
//!
//! Each transmitted frame is a `u32` (BE) letter length followed by the letter itself:
//!
//! ```ascii
//! 0:  letter type (u8)
//! 1:  options (u8 bit flags)
//! 2:  correlation id (16 bytes, all-zero = no correlation)
//! 18: address count (varint), then 16 bytes per node id
//! *:  part count (varint), then per part: length (varint) + bytes
//! ```
//!
//! A Batch letter's parts are themselves fully-encoded letters (without the frame length
//!  prefix). A letter with an empty address is stamped with the sending socket's own node id
//!  at encode time, making `address[0]` the origin on the receiving side.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use uuid::Uuid;

use crate::letter::{Letter, LetterOptions, LetterType};
use crate::node_id::NodeId;

pub const FRAME_HEADER_LEN: usize = size_of::<u32>();

/// upper bound on the address chain - single-hop routing never produces long chains, so
///  anything bigger points to a corrupted or hostile frame
const MAX_ADDRESS_LEN: usize = 64;

pub fn encode_frame(letter: &Letter, self_id: NodeId, buf: &mut BytesMut) {
    let frame_start = buf.len();
    buf.put_u32(0); // length, patched below
    encode_letter(letter, self_id, buf);

    let letter_len = (buf.len() - frame_start - FRAME_HEADER_LEN) as u32;
    buf[frame_start..frame_start + FRAME_HEADER_LEN].copy_from_slice(&letter_len.to_be_bytes());
}

pub fn encode_letter(letter: &Letter, self_id: NodeId, buf: &mut BytesMut) {
    buf.put_u8(u8::from(letter.letter_type));
    buf.put_u8(letter.options.bits());

    match letter.id {
        Some(id) => buf.put_slice(id.as_bytes()),
        None => buf.put_slice(Uuid::nil().as_bytes()),
    }

    if letter.address.is_empty() {
        buf.put_usize_varint(1);
        self_id.ser(buf);
    }
    else {
        buf.put_usize_varint(letter.address.len());
        for node_id in &letter.address {
            node_id.ser(buf);
        }
    }

    buf.put_usize_varint(letter.parts.len());
    for part in &letter.parts {
        buf.put_usize_varint(part.len());
        buf.put_slice(part);
    }
}

pub fn try_decode_letter(buf: &mut impl Buf) -> anyhow::Result<Letter> {
    let letter_type = LetterType::try_from(buf.try_get_u8()?)
        .map_err(|e| anyhow!("unknown letter type {}", e.number))?;
    let options = LetterOptions::from_bits_truncate(buf.try_get_u8()?);

    if buf.remaining() < NodeId::SERIALIZED_LEN {
        bail!("truncated correlation id");
    }
    let mut id_bytes = [0u8; 16];
    buf.copy_to_slice(&mut id_bytes);
    let id = Uuid::from_bytes(id_bytes);
    let id = if id.is_nil() { None } else { Some(id) };

    let num_addresses = buf.try_get_usize_varint()?;
    if num_addresses > MAX_ADDRESS_LEN {
        bail!("implausible address chain length {}", num_addresses);
    }
    let mut address = Vec::with_capacity(num_addresses);
    for _ in 0..num_addresses {
        address.push(NodeId::try_deser(buf)?);
    }

    let num_parts = buf.try_get_usize_varint()?;
    let mut parts = Vec::new();
    for _ in 0..num_parts {
        let part_len = buf.try_get_usize_varint()?;
        if part_len > buf.remaining() {
            bail!("truncated letter part: {} bytes declared, {} remaining", part_len, buf.remaining());
        }
        parts.push(buf.copy_to_bytes(part_len));
    }

    Ok(Letter {
        id,
        letter_type,
        options,
        address,
        parts,
    })
}

/// Attempts to decode one frame from the front of `buf`, consuming it on success. Returns
///  `Ok(None)` if the buffer does not hold a complete frame yet. Decode errors are protocol
///  errors - the caller is expected to tear down the connection.
pub fn try_decode_frame(buf: &mut BytesMut, max_letter_size: usize) -> anyhow::Result<Option<Letter>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let mut header: &[u8] = &buf[..FRAME_HEADER_LEN];
    let letter_len = header.get_u32() as usize;
    if letter_len > max_letter_size {
        bail!("letter of {} bytes exceeds the configured maximum of {}", letter_len, max_letter_size);
    }
    if buf.len() < FRAME_HEADER_LEN + letter_len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    let frame = buf.split_to(letter_len).freeze();
    let mut b: &[u8] = &frame;
    let letter = try_decode_letter(&mut b)?;
    if !b.is_empty() {
        bail!("{} bytes of trailing garbage after letter", b.len());
    }
    Ok(Some(letter))
}
