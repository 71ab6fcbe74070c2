//! Input sequencing.
//!
//! Every steering intent that goes on the wire gets a strictly increasing
//! sequence number and stays pending until a snapshot's tick reaches it.

use std::collections::VecDeque;

use serpent_shared::{
    math::Direction,
    net::{ClientMessage, PlayerId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingInput {
    pub sequence: u64,
    pub direction: Direction,
    /// Wall clock at issue, ms since the Unix epoch.
    pub issued_at: i64,
}

impl PendingInput {
    pub fn to_message(self, player_id: PlayerId) -> ClientMessage {
        ClientMessage::PlayerInput {
            player_id,
            direction: self.direction,
            sequence: self.sequence,
            timestamp: self.issued_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct InputLog {
    next_sequence: u64,
    pending: VecDeque<PendingInput>,
}

impl InputLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new input with the next sequence number.
    pub fn record(&mut self, direction: Direction, issued_at: i64) -> PendingInput {
        self.next_sequence += 1;
        let input = PendingInput {
            sequence: self.next_sequence,
            direction,
            issued_at,
        };
        self.pending.push_back(input);
        input
    }

    /// Drops inputs the server has processed by `tick`. Returns how many.
    pub fn acknowledge(&mut self, tick: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|i| i.sequence > tick);
        before - self.pending.len()
    }

    pub fn pending(&self) -> impl ExactSizeIterator<Item = &PendingInput> {
        self.pending.iter()
    }

    pub fn last_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn reset(&mut self) {
        self.next_sequence = 0;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_increase_and_prune_by_tick() {
        let mut log = InputLog::new();
        for d in [Direction::Up, Direction::Left, Direction::Down] {
            log.record(d, 0);
        }
        assert_eq!(log.last_sequence(), 3);

        assert_eq!(log.acknowledge(2), 2);
        let left: Vec<u64> = log.pending().map(|i| i.sequence).collect();
        assert_eq!(left, vec![3]);

        assert_eq!(log.record(Direction::Right, 0).sequence, 4);
        assert_eq!(log.acknowledge(10), 2);
        assert_eq!(log.pending().len(), 0);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut log = InputLog::new();
        log.record(Direction::Up, 1);
        log.reset();
        assert_eq!(log.pending().len(), 0);
        assert_eq!(log.record(Direction::Up, 2).sequence, 1);
    }
}
