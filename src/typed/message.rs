use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, BytesMut};

/// Eight ASCII characters identifying a message type on the wire, stored as a `u64` for cheap
///  comparison and map lookup.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MessageTypeId(pub u64);

impl MessageTypeId {
    pub const SERIALIZED_LEN: usize = 8;

    /// Builds an id from up to eight ASCII characters, NUL-padded at the end.
    pub const fn new(id: &str) -> MessageTypeId {
        let bytes = id.as_bytes();
        assert!(bytes.len() <= 8, "a message type id has at most eight characters");

        let mut raw = [0u8; 8];
        let mut i = 0;
        while i < bytes.len() {
            raw[i] = bytes[i];
            i += 1;
        }
        MessageTypeId(u64::from_be_bytes(raw))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageTypeId> {
        Ok(MessageTypeId(buf.try_get_u64()?))
    }
}

impl Debug for MessageTypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"")?;
        for &b in self.0.to_be_bytes().iter().take_while(|&&b| b != 0) {
            write!(f, "{}", b as char)?;
        }
        write!(f, "\"")
    }
}

/// A message that knows how to put itself on the wire. The payload encoding is entirely up to
///  the message type; the transport only cares about the type id.
pub trait TypedMessage: Sized + Send + 'static {
    const TYPE_ID: MessageTypeId;

    fn ser(&self, buf: &mut BytesMut);
    fn try_deser(buf: &mut &[u8]) -> anyhow::Result<Self>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::short("ab", 0x6162_0000_0000_0000)]
    #[case::full_width("abcdefgh", 0x6162_6364_6566_6768)]
    #[case::empty("", 0)]
    fn test_new(#[case] id: &str, #[case] expected: u64) {
        assert_eq!(MessageTypeId::new(id).0, expected);
    }

    #[test]
    fn test_ser_deser() {
        let id = MessageTypeId::new("ping");

        let mut buf = BytesMut::new();
        id.ser(&mut buf);
        assert_eq!(buf.len(), MessageTypeId::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(MessageTypeId::try_deser(&mut b).unwrap(), id);
        assert!(b.is_empty());

        let mut truncated: &[u8] = &[1, 2, 3];
        assert!(MessageTypeId::try_deser(&mut truncated).is_err());
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", MessageTypeId::new("ping")), "\"ping\"");
    }
}
