use anyhow::bail;
use bytes::BytesMut;

use crate::letter::{Letter, LetterType};
use crate::node_id::NodeId;
use crate::wire;

/// Accumulates letters and packs them into a single Batch-typed letter whose parts are the
///  fully-encoded originals, one part per folded letter.
pub struct BatchBuilder {
    self_id: NodeId,
    max_letters: usize,
    letters: Vec<Letter>,
}

impl BatchBuilder {
    pub fn new(self_id: NodeId, max_letters: usize) -> BatchBuilder {
        BatchBuilder {
            self_id,
            max_letters,
            letters: Vec::new(),
        }
    }

    pub fn add(&mut self, letter: Letter) {
        self.letters.push(letter);
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.letters.len() >= self.max_letters
    }

    /// Packs all accumulated letters into one Batch letter and resets the builder.
    pub fn build(&mut self) -> Letter {
        let parts = self.letters
            .drain(..)
            .map(|letter| {
                let mut buf = BytesMut::new();
                wire::encode_letter(&letter, self.self_id, &mut buf);
                buf.freeze()
            })
            .collect();

        Letter::batch(parts)
    }

    pub fn clear(&mut self) {
        self.letters.clear();
    }
}

/// Reconstructs the folded letters of a Batch letter, in original order.
pub fn try_unpack_batch(letter: &Letter) -> anyhow::Result<Vec<Letter>> {
    if letter.letter_type != LetterType::Batch {
        bail!("cannot unpack a {:?} letter as a batch", letter.letter_type);
    }

    letter.parts
        .iter()
        .map(|part| wire::try_decode_letter(&mut &part[..]))
        .collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::letter::LetterOptions;

    use super::*;

    fn user_letter(payload: &'static [u8]) -> Letter {
        Letter::user(LetterOptions::empty(), vec![Bytes::from_static(payload)])
    }

    #[test]
    fn test_pack_and_unpack() {
        let self_id = NodeId::random();
        let mut builder = BatchBuilder::new(self_id, 10);

        builder.add(user_letter(b"first"));
        builder.add(user_letter(b"second"));
        builder.add(user_letter(b"third"));
        assert_eq!(builder.len(), 3);

        let batch = builder.build();
        assert!(builder.is_empty());
        assert_eq!(batch.letter_type, LetterType::Batch);
        assert_eq!(batch.parts.len(), 3);

        let unpacked = try_unpack_batch(&batch).unwrap();
        assert_eq!(unpacked.len(), 3);
        assert_eq!(unpacked[0].parts[0], Bytes::from_static(b"first"));
        assert_eq!(unpacked[1].parts[0], Bytes::from_static(b"second"));
        assert_eq!(unpacked[2].parts[0], Bytes::from_static(b"third"));

        // folded letters are stamped with the sender's id like any other encoded letter
        assert_eq!(unpacked[0].origin(), Some(self_id));
    }

    #[test]
    fn test_is_full() {
        let mut builder = BatchBuilder::new(NodeId::random(), 2);
        assert!(!builder.is_full());
        builder.add(user_letter(b"a"));
        assert!(!builder.is_full());
        builder.add(user_letter(b"b"));
        assert!(builder.is_full());
    }

    #[test]
    fn test_clear() {
        let mut builder = BatchBuilder::new(NodeId::random(), 10);
        builder.add(user_letter(b"a"));
        builder.clear();
        assert!(builder.is_empty());
    }

    #[test]
    fn test_unpack_rejects_non_batch() {
        assert!(try_unpack_batch(&user_letter(b"a")).is_err());
    }

    #[test]
    fn test_unpack_rejects_garbage_part() {
        let batch = Letter::batch(vec![Bytes::from_static(b"\x07garbage")]);
        assert!(try_unpack_batch(&batch).is_err());
    }
}
