//! State synchronizer.
//!
//! Ingests authoritative ticks, numbers outbound inputs and prunes them once
//! acknowledged, and produces the interpolated view used for remote rendering.

use std::borrow::Cow;

use serpent_shared::{
    event::{Dispatcher, Event, HandlerId},
    math::Direction,
    net::{now_millis, ClientMessage, ConsumableId, PlayerId, ServerMessage},
};
use tracing::{debug, trace};

use crate::{
    input::{InputLog, PendingInput},
    interp::{SnapshotBuffer, TickSnapshot},
    transport::TransportSender,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A new canonical snapshot was stored.
    Snapshot { tick: u64 },
    PlayerDied {
        player_id: PlayerId,
        reason: Option<String>,
    },
    GameOver,
}

impl Event for SyncEvent {
    fn kind(&self) -> &str {
        match self {
            SyncEvent::Snapshot { .. } => "snapshot",
            SyncEvent::PlayerDied { .. } => "player_died",
            SyncEvent::GameOver => "game_over",
        }
    }
}

pub struct StateSynchronizer {
    sender: TransportSender,
    player_id: Option<PlayerId>,
    inputs: InputLog,
    canonical: Option<TickSnapshot>,
    ring: SnapshotBuffer,
    events: Dispatcher<SyncEvent>,
}

impl StateSynchronizer {
    pub fn new(sender: TransportSender, ring_size: usize) -> Self {
        Self {
            sender,
            player_id: None,
            inputs: InputLog::new(),
            canonical: None,
            ring: SnapshotBuffer::new(ring_size),
            events: Dispatcher::new(),
        }
    }

    pub fn set_player_id(&mut self, id: Option<PlayerId>) {
        self.player_id = id;
    }

    pub fn player_id(&self) -> Option<&PlayerId> {
        self.player_id.as_ref()
    }

    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnMut(&SyncEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, kind: &str, id: HandlerId) -> bool {
        self.events.off(kind, id)
    }

    /// Numbers and sends a steering input. `None` if no local player is known yet.
    pub fn send_input(&mut self, direction: Direction) -> Option<PendingInput> {
        let Some(player_id) = self.player_id.clone() else {
            debug!(?direction, "Input before a player id was assigned");
            return None;
        };
        let input = self.inputs.record(direction, now_millis());
        trace!(sequence = input.sequence, ?direction, "Input sent");
        self.sender.send(&input.to_message(player_id));
        Some(input)
    }

    /// Reports a locally predicted pickup.
    pub fn send_consumable_taken(&self, food_id: &ConsumableId) {
        let Some(player_id) = self.player_id.clone() else {
            return;
        };
        self.sender.send(&ClientMessage::EatFood {
            player_id,
            food_id: food_id.clone(),
        });
    }

    /// Applies a gameplay message received at `now_ms` on the session clock.
    pub fn handle(&mut self, msg: &ServerMessage, now_ms: f64) -> Option<SyncEvent> {
        let event = match msg {
            ServerMessage::GameState(state) => {
                let snap = TickSnapshot::from_state(state.clone(), now_ms);
                let tick = snap.tick;
                let acked = self.inputs.acknowledge(tick);
                trace!(tick, acked, pending = self.inputs.pending().len(), "Snapshot");
                self.ring.push(snap.clone());
                self.canonical = Some(snap);
                SyncEvent::Snapshot { tick }
            }
            ServerMessage::PlayerDied { player_id, reason } => SyncEvent::PlayerDied {
                player_id: player_id.clone(),
                reason: reason.clone(),
            },
            ServerMessage::GameOver {} => SyncEvent::GameOver,
            _ => return None,
        };
        self.events.dispatch(&event);
        Some(event)
    }

    /// Latest authoritative snapshot.
    pub fn current(&self) -> Option<&TickSnapshot> {
        self.canonical.as_ref()
    }

    /// View for rendering remotes at `render_time` (session clock, ms).
    pub fn interpolated_state(&self, render_time: f64) -> Option<Cow<'_, TickSnapshot>> {
        if self.ring.len() < 2 {
            return self.canonical.as_ref().map(Cow::Borrowed);
        }
        self.ring.interpolate(render_time, self.player_id.as_ref())
    }

    pub fn pending_inputs(&self) -> impl ExactSizeIterator<Item = &PendingInput> {
        self.inputs.pending()
    }

    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Forgets all match state. The next input is sequence 1 again.
    pub fn reset(&mut self) {
        self.inputs.reset();
        self.canonical = None;
        self.ring.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serpent_shared::{
        math::Vec2,
        net::{EntityState, GameState},
    };

    use crate::transport::tests::{transport, PipeConnector};

    fn state(tick: u64, head: (i32, i32)) -> ServerMessage {
        ServerMessage::GameState(GameState {
            tick,
            snakes: vec![EntityState {
                player_id: "p2".into(),
                body: vec![Vec2::cell(head.0, head.1)],
                direction: Direction::Right,
                alive: true,
                score: 0,
                skin_id: "default".into(),
            }],
            foods: Vec::new(),
            timestamp: 0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn inputs_are_numbered_sent_and_pruned() -> anyhow::Result<()> {
        let connector = PipeConnector::default();
        let mut server = connector.pipe();
        let mut client = transport(&connector);
        client.connect().await?;

        let mut sync = StateSynchronizer::new(client.sender(), 3);
        assert!(sync.send_input(Direction::Up).is_none());
        sync.set_player_id(Some("me".into()));

        sync.send_input(Direction::Up);
        sync.send_input(Direction::Left);
        sync.send_input(Direction::Down);
        for expected in 1..=3u64 {
            let env = server.recv().await?.expect("player_input");
            let ClientMessage::PlayerInput { sequence, player_id, .. } =
                ClientMessage::from_envelope(&env)?
            else {
                panic!("expected player_input, got {}", env.kind);
            };
            assert_eq!(sequence, expected);
            assert_eq!(player_id.as_str(), "me");
        }

        sync.handle(&state(2, (0, 0)), 0.0);
        let left: Vec<u64> = sync.pending_inputs().map(|i| i.sequence).collect();
        assert_eq!(left, vec![3]);
        Ok(())
    }

    #[test]
    fn interpolated_state_uses_canonical_until_two_snapshots() {
        let mut sync = StateSynchronizer::new(transport(&PipeConnector::default()).sender(), 3);
        assert!(sync.interpolated_state(0.0).is_none());

        assert_eq!(
            sync.handle(&state(1, (0, 0)), 100.0),
            Some(SyncEvent::Snapshot { tick: 1 })
        );
        assert_eq!(sync.interpolated_state(1000.0).unwrap().tick, 1);

        sync.handle(&state(2, (2, 0)), 200.0);
        let view = sync.interpolated_state(150.0).unwrap();
        assert_eq!(view.entities[0].body[0], Vec2::cell(1, 0));
        assert_eq!(sync.current().unwrap().tick, 2);
    }

    #[test]
    fn lifecycle_events_do_not_touch_state() {
        let mut sync = StateSynchronizer::new(transport(&PipeConnector::default()).sender(), 3);
        let died = sync.handle(
            &ServerMessage::PlayerDied {
                player_id: "p2".into(),
                reason: Some("wall".into()),
            },
            0.0,
        );
        assert_eq!(died.as_ref().map(|e| e.kind()), Some("player_died"));
        assert_eq!(sync.handle(&ServerMessage::GameOver {}, 0.0), Some(SyncEvent::GameOver));
        assert!(sync.current().is_none());
        assert!(sync
            .handle(&ServerMessage::PlayerLeft { player_id: "p2".into() }, 0.0)
            .is_none());
    }

    #[test]
    fn reset_clears_everything() {
        let mut sync = StateSynchronizer::new(transport(&PipeConnector::default()).sender(), 3);
        sync.set_player_id(Some("me".into()));
        sync.send_input(Direction::Up);
        sync.handle(&state(0, (0, 0)), 0.0);
        sync.reset();
        assert!(sync.current().is_none());
        assert_eq!(sync.buffered(), 0);
        assert_eq!(sync.pending_inputs().len(), 0);
        assert_eq!(sync.send_input(Direction::Up).map(|i| i.sequence), Some(1));
    }
}
