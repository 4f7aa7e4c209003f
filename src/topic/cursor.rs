//! Subscription read cursor
//!
//! Everything at or before `mark_delete` is acknowledged. Acknowledgments
//! above it are kept individually until the gap below them closes.

use parking_lot::RwLock;
use std::collections::BTreeSet;

use crate::storage::Position;

#[derive(Debug)]
struct CursorState {
    mark_delete: Position,
    individually_acked: BTreeSet<Position>,
}

/// Acknowledgment state of one subscription
#[derive(Debug)]
pub struct SubscriptionCursor {
    state: RwLock<CursorState>,
}

impl Default for SubscriptionCursor {
    fn default() -> Self {
        Self::new(Position::EARLIEST)
    }
}

impl SubscriptionCursor {
    pub fn new(mark_delete: Position) -> Self {
        Self {
            state: RwLock::new(CursorState {
                mark_delete,
                individually_acked: BTreeSet::new(),
            }),
        }
    }

    pub fn mark_delete_position(&self) -> Position {
        self.state.read().mark_delete
    }

    pub fn is_acknowledged(&self, position: Position) -> bool {
        let state = self.state.read();
        position <= state.mark_delete || state.individually_acked.contains(&position)
    }

    /// Positions acknowledged above the mark-delete position
    pub fn individually_acked(&self) -> Vec<Position> {
        self.state.read().individually_acked.iter().copied().collect()
    }

    pub fn acknowledge_individual(&self, positions: &[Position]) {
        let mut state = self.state.write();
        for position in positions {
            if *position > state.mark_delete {
                state.individually_acked.insert(*position);
            }
        }
        // Close gaps inside the current ledger
        loop {
            let next = state.mark_delete.next();
            if !state.individually_acked.remove(&next) {
                break;
            }
            state.mark_delete = next;
        }
    }

    /// Move the mark-delete position forward; never moves it back
    pub fn acknowledge_cumulative(&self, position: Position) {
        let mut state = self.state.write();
        if position <= state.mark_delete {
            return;
        }
        state.mark_delete = position;
        state.individually_acked = state.individually_acked.split_off(&position.next());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_individual_acks_collapse_into_mark_delete() {
        let cursor = SubscriptionCursor::new(Position::new(0, -1));
        cursor.acknowledge_individual(&[Position::new(0, 1), Position::new(0, 2)]);
        assert_eq!(cursor.mark_delete_position(), Position::new(0, -1));
        assert!(cursor.is_acknowledged(Position::new(0, 2)));
        assert!(!cursor.is_acknowledged(Position::new(0, 0)));

        cursor.acknowledge_individual(&[Position::new(0, 0)]);
        assert_eq!(cursor.mark_delete_position(), Position::new(0, 2));
        assert!(cursor.individually_acked().is_empty());
    }

    #[test]
    fn test_cumulative_never_moves_back() {
        let cursor = SubscriptionCursor::default();
        cursor.acknowledge_individual(&[Position::new(1, 9)]);
        cursor.acknowledge_cumulative(Position::new(1, 5));
        assert_eq!(cursor.individually_acked(), vec![Position::new(1, 9)]);

        cursor.acknowledge_cumulative(Position::new(0, 3));
        assert_eq!(cursor.mark_delete_position(), Position::new(1, 5));
        cursor.acknowledge_cumulative(Position::new(1, 9));
        assert!(cursor.individually_acked().is_empty());
    }
}
