//! Interpolation.
//!
//! The server sends discrete snapshots at tick boundaries.
//! The client renders at its own rate and blends remote bodies between the
//! two most recent snapshots.

use std::{borrow::Cow, collections::VecDeque};

use serpent_shared::net::{ConsumableState, EntityState, GameState, PlayerId};

/// One received tick, stamped with the local receipt time.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSnapshot {
    pub tick: u64,
    pub entities: Vec<EntityState>,
    pub consumables: Vec<ConsumableState>,
    /// Server wall clock; informational only.
    pub server_timestamp: i64,
    /// Session clock, milliseconds.
    pub received_at: f64,
}

impl TickSnapshot {
    pub fn from_state(state: GameState, received_at: f64) -> Self {
        Self {
            tick: state.tick,
            entities: state.snakes,
            consumables: state.foods,
            server_timestamp: state.timestamp,
            received_at,
        }
    }

    pub fn entity(&self, id: &PlayerId) -> Option<&EntityState> {
        self.entities.iter().find(|e| &e.player_id == id)
    }
}

/// Bounded snapshot history for interpolation.
#[derive(Debug, Default)]
pub struct SnapshotBuffer {
    history: VecDeque<TickSnapshot>,
    max: usize,
}

impl SnapshotBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max),
            max: max.max(2),
        }
    }

    pub fn push(&mut self, snap: TickSnapshot) {
        self.history.push_back(snap);
        while self.history.len() > self.max {
            self.history.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn last_snapshot(&self) -> Option<&TickSnapshot> {
        self.history.back()
    }

    /// The two most recent snapshots, oldest first.
    pub fn latest_pair(&self) -> Option<(&TickSnapshot, &TickSnapshot)> {
        let n = self.history.len();
        if n < 2 {
            return None;
        }
        Some((&self.history[n - 2], &self.history[n - 1]))
    }

    /// Blended view at `render_time` (same clock as `received_at`).
    ///
    /// `local` is never blended. With fewer than two snapshots the latest is
    /// returned as is.
    pub fn interpolate(
        &self,
        render_time: f64,
        local: Option<&PlayerId>,
    ) -> Option<Cow<'_, TickSnapshot>> {
        let Some((older, newer)) = self.latest_pair() else {
            return self.last_snapshot().map(Cow::Borrowed);
        };
        let dt = newer.received_at - older.received_at;
        if dt <= 0.0 {
            return Some(Cow::Borrowed(newer));
        }
        let t = ((render_time - older.received_at) / dt).clamp(0.0, 1.0) as f32;

        let mut blended = newer.clone();
        for entity in &mut blended.entities {
            if Some(&entity.player_id) == local {
                continue;
            }
            let Some(prev) = older.entity(&entity.player_id) else {
                continue;
            };
            for (seg, from) in entity.body.iter_mut().zip(&prev.body) {
                *seg = from.lerp(*seg, t);
            }
        }
        Some(Cow::Owned(blended))
    }
}
