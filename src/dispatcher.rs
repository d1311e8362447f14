use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::channel::LetterChannel;
use crate::letter::Letter;

/// Matches outgoing letters with channels that are ready to take one. Letters are distributed
///  over whatever channel becomes available first, so a socket with several connections spreads
///  its traffic across them.
///
/// A channel is handed one letter per readiness signal and is expected to announce itself again
///  via [LetterDispatcher::channel_ready] once its queue ran dry. Requeued letters (failed
///  sends with the REQUEUE option) go to a priority queue that is drained first.
pub struct LetterDispatcher {
    state: Mutex<DispatcherState>,
}

struct DispatcherState {
    priority: VecDeque<Letter>,
    normal: VecDeque<Letter>,
    ready: VecDeque<Arc<dyn LetterChannel>>,
}

impl LetterDispatcher {
    pub fn new() -> LetterDispatcher {
        LetterDispatcher {
            state: Mutex::new(DispatcherState {
                priority: VecDeque::new(),
                normal: VecDeque::new(),
                ready: VecDeque::new(),
            }),
        }
    }

    pub fn send(&self, letter: Letter) {
        let mut state = self.state.lock().unwrap();
        state.normal.push_back(letter);
        Self::match_up(&mut state);
    }

    pub fn send_priority(&self, letter: Letter) {
        let mut state = self.state.lock().unwrap();
        state.priority.push_back(letter);
        Self::match_up(&mut state);
    }

    pub fn channel_ready(&self, channel: Arc<dyn LetterChannel>) {
        let mut state = self.state.lock().unwrap();
        state.ready.push_back(channel);
        Self::match_up(&mut state);
    }

    pub fn num_queued(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.priority.len() + state.normal.len()
    }

    /// Drains all queued letters, for failure reporting when the socket shuts down.
    pub fn drain(&self) -> Vec<Letter> {
        let mut state = self.state.lock().unwrap();
        state.ready.clear();
        let mut letters: Vec<Letter> = state.priority.drain(..).collect();
        letters.extend(state.normal.drain(..));
        letters
    }

    fn match_up(state: &mut DispatcherState) {
        loop {
            // stale entries accumulate when channels disconnect while queued - skip them
            let channel = loop {
                match state.ready.pop_front() {
                    Some(channel) if channel.is_connected() => break channel,
                    Some(channel) => {
                        trace!("skipping disconnected channel {:?}", channel.remote_addr());
                    }
                    None => return,
                }
            };

            let letter = match state.priority.pop_front().or_else(|| state.normal.pop_front()) {
                Some(letter) => letter,
                None => {
                    state.ready.push_front(channel);
                    return;
                }
            };

            match channel.enqueue(letter) {
                Ok(()) => {
                    // the channel re-announces itself once its queue is empty again
                }
                Err(letter) => {
                    debug!("channel {:?} rejected a letter - requeueing with priority", channel.remote_addr());
                    state.priority.push_front(letter);
                }
            }
        }
    }
}

impl Default for LetterDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use mockall::Sequence;

    use crate::channel::{Direction, MockLetterChannel};
    use crate::letter::LetterOptions;

    use super::*;

    fn letter(payload: &'static [u8]) -> Letter {
        Letter::user(LetterOptions::empty(), vec![Bytes::from_static(payload)])
    }

    fn has_payload(letter: &Letter, payload: &'static [u8]) -> bool {
        letter.parts.first().map(|p| &p[..]) == Some(payload)
    }

    fn connected_channel() -> MockLetterChannel {
        let mut channel = MockLetterChannel::new();
        channel.expect_is_connected().return_const(true);
        channel.expect_remote_addr().return_const("127.0.0.1:1".parse::<std::net::SocketAddr>().unwrap());
        channel.expect_direction().return_const(Direction::Outbound);
        channel
    }

    #[test]
    fn test_letter_waits_for_a_ready_channel() {
        let dispatcher = LetterDispatcher::new();
        dispatcher.send(letter(b"a"));
        assert_eq!(dispatcher.num_queued(), 1);

        let mut channel = connected_channel();
        channel.expect_enqueue()
            .withf(|l| has_payload(l, b"a"))
            .times(1)
            .returning(|_| Ok(()));

        dispatcher.channel_ready(Arc::new(channel));
        assert_eq!(dispatcher.num_queued(), 0);
    }

    #[test]
    fn test_ready_channel_waits_for_a_letter() {
        let dispatcher = LetterDispatcher::new();

        let mut channel = connected_channel();
        channel.expect_enqueue()
            .withf(|l| has_payload(l, b"a"))
            .times(1)
            .returning(|_| Ok(()));
        dispatcher.channel_ready(Arc::new(channel));

        dispatcher.send(letter(b"a"));
        assert_eq!(dispatcher.num_queued(), 0);
    }

    #[test]
    fn test_priority_letters_are_drained_first() {
        let dispatcher = LetterDispatcher::new();
        dispatcher.send(letter(b"normal"));
        dispatcher.send_priority(letter(b"priority"));

        let mut seq = Sequence::new();
        let mut channel = connected_channel();
        channel.expect_enqueue()
            .withf(|l| has_payload(l, b"priority"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel.expect_enqueue()
            .withf(|l| has_payload(l, b"normal"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let channel = Arc::new(channel);
        dispatcher.channel_ready(channel.clone());
        dispatcher.channel_ready(channel);
        assert_eq!(dispatcher.num_queued(), 0);
    }

    #[test]
    fn test_rejected_letter_is_requeued_with_priority() {
        let dispatcher = LetterDispatcher::new();
        dispatcher.send(letter(b"a"));

        let mut rejecting = connected_channel();
        rejecting.expect_enqueue()
            .times(1)
            .returning(Err);
        dispatcher.channel_ready(Arc::new(rejecting));
        assert_eq!(dispatcher.num_queued(), 1);

        let mut accepting = connected_channel();
        accepting.expect_enqueue()
            .withf(|l| has_payload(l, b"a"))
            .times(1)
            .returning(|_| Ok(()));
        dispatcher.channel_ready(Arc::new(accepting));
        assert_eq!(dispatcher.num_queued(), 0);
    }

    #[test]
    fn test_disconnected_channel_is_skipped() {
        let dispatcher = LetterDispatcher::new();

        let mut stale = MockLetterChannel::new();
        stale.expect_is_connected().return_const(false);
        stale.expect_remote_addr().return_const("127.0.0.1:1".parse::<std::net::SocketAddr>().unwrap());
        stale.expect_enqueue().never();
        dispatcher.channel_ready(Arc::new(stale));

        dispatcher.send(letter(b"a"));
        assert_eq!(dispatcher.num_queued(), 1);

        let mut channel = connected_channel();
        channel.expect_enqueue()
            .times(1)
            .returning(|_| Ok(()));
        dispatcher.channel_ready(Arc::new(channel));
        assert_eq!(dispatcher.num_queued(), 0);
    }

    #[test]
    fn test_drain() {
        let dispatcher = LetterDispatcher::new();
        dispatcher.send(letter(b"a"));
        dispatcher.send_priority(letter(b"b"));

        let drained = dispatcher.drain();
        assert!(has_payload(&drained[0], b"b"));
        assert!(has_payload(&drained[1], b"a"));
        assert_eq!(dispatcher.num_queued(), 0);
    }
}
