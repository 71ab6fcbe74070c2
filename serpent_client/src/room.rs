//! Room coordinator.
//!
//! Lobby state machine on top of the transport. Commands are fire-and-forget;
//! the room snapshot only ever changes in response to server messages (plus
//! local teardown on leave).

use serpent_shared::{
    event::{Dispatcher, Event, HandlerId},
    net::{ClientMessage, PlayerId, PlayerInfo, RoomInfo, RoomStatus, ServerMessage},
};
use tracing::{debug, info, warn};

use crate::transport::TransportSender;

/// Capacity used when a room is created without one.
pub const DEFAULT_MAX_PLAYERS: u32 = 4;

/// Lobby notifications for consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    RoomCreated(RoomInfo),
    RoomJoined(RoomInfo),
    MatchFound(RoomInfo),
    PlayerJoined(PlayerInfo),
    PlayerLeft(PlayerId),
    PlayerReady(PlayerId),
    /// Carries the room as it stands when the countdown starts.
    GameStarting(Option<RoomInfo>),
    Error(String),
}

impl Event for RoomEvent {
    fn kind(&self) -> &str {
        match self {
            RoomEvent::RoomCreated(_) => "room_created",
            RoomEvent::RoomJoined(_) => "room_joined",
            RoomEvent::MatchFound(_) => "match_found",
            RoomEvent::PlayerJoined(_) => "player_joined",
            RoomEvent::PlayerLeft(_) => "player_left",
            RoomEvent::PlayerReady(_) => "player_ready",
            RoomEvent::GameStarting(_) => "game_starting",
            RoomEvent::Error(_) => "error",
        }
    }
}

pub struct RoomCoordinator {
    sender: TransportSender,
    room: Option<RoomInfo>,
    player_id: Option<PlayerId>,
    events: Dispatcher<RoomEvent>,
}

impl RoomCoordinator {
    pub fn new(sender: TransportSender) -> Self {
        Self {
            sender,
            room: None,
            player_id: None,
            events: Dispatcher::new(),
        }
    }

    pub fn room(&self) -> Option<&RoomInfo> {
        self.room.as_ref()
    }

    pub fn player_id(&self) -> Option<&PlayerId> {
        self.player_id.as_ref()
    }

    pub fn is_host(&self) -> bool {
        match (&self.room, &self.player_id) {
            (Some(room), Some(me)) => &room.host_id == me,
            _ => false,
        }
    }

    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnMut(&RoomEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, kind: &str, id: HandlerId) -> bool {
        self.events.off(kind, id)
    }

    // ─── Commands ───

    pub fn create_room(&self, player_name: &str, max_players: u32) {
        info!(player_name, max_players, "Creating room");
        self.sender.send(&ClientMessage::CreateRoom {
            player_name: player_name.to_string(),
            max_players,
        });
    }

    pub fn join_room(&self, room_id: &str, player_name: &str) {
        info!(room = room_id, player_name, "Joining room");
        self.sender.send(&ClientMessage::JoinRoom {
            room_id: room_id.into(),
            player_name: player_name.to_string(),
        });
    }

    pub fn matchmaking(&self, player_name: &str) {
        info!(player_name, "Entering matchmaking");
        self.sender.send(&ClientMessage::Matchmaking {
            player_name: player_name.to_string(),
        });
    }

    pub fn cancel_matchmaking(&self) {
        self.sender.send(&ClientMessage::CancelMatchmaking {});
    }

    /// Marks the local player ready. Requires a room.
    pub fn set_ready(&self) {
        let Some(room) = &self.room else {
            debug!("set_ready without a room");
            return;
        };
        self.sender.send(&ClientMessage::PlayerReady {
            room_id: room.room_id.clone(),
        });
    }

    /// Leaves the current room and forgets it.
    pub fn leave_room(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        info!(room = %room.room_id, "Leaving room");
        self.sender.send(&ClientMessage::LeaveRoom {
            room_id: room.room_id,
        });
    }

    // ─── Inbound ───

    /// Applies a server message. Returns the event emitted, if any.
    pub fn handle(&mut self, msg: &ServerMessage) -> Option<RoomEvent> {
        let event = match msg {
            ServerMessage::RoomCreated { room, player_id } => {
                self.adopt(room, player_id);
                RoomEvent::RoomCreated(room.clone())
            }
            ServerMessage::RoomJoined { room, player_id } => {
                self.adopt(room, player_id);
                RoomEvent::RoomJoined(room.clone())
            }
            ServerMessage::MatchFound { room, player_id } => {
                self.adopt(room, player_id);
                RoomEvent::MatchFound(room.clone())
            }
            ServerMessage::PlayerJoined { player } => {
                if let Some(room) = &mut self.room {
                    match room.players.iter_mut().find(|p| p.id == player.id) {
                        Some(existing) => *existing = player.clone(),
                        None => room.players.push(player.clone()),
                    }
                }
                RoomEvent::PlayerJoined(player.clone())
            }
            ServerMessage::PlayerLeft { player_id } => {
                if let Some(room) = &mut self.room {
                    room.players.retain(|p| &p.id != player_id);
                }
                RoomEvent::PlayerLeft(player_id.clone())
            }
            ServerMessage::PlayerReady { player_id } => {
                if let Some(p) = self
                    .room
                    .as_mut()
                    .and_then(|r| r.players.iter_mut().find(|p| &p.id == player_id))
                {
                    p.ready = true;
                }
                RoomEvent::PlayerReady(player_id.clone())
            }
            ServerMessage::GameStarting { countdown } => {
                if let Some(room) = &mut self.room {
                    room.status = RoomStatus::Starting;
                }
                info!(?countdown, "Game starting");
                RoomEvent::GameStarting(self.room.clone())
            }
            ServerMessage::RoomError { message } => {
                warn!(%message, "Room error");
                RoomEvent::Error(message.clone())
            }
            ServerMessage::GameOver {} => {
                if let Some(room) = &mut self.room {
                    room.status = RoomStatus::Finished;
                }
                return None;
            }
            _ => return None,
        };
        self.events.dispatch(&event);
        Some(event)
    }

    fn adopt(&mut self, room: &RoomInfo, player_id: &PlayerId) {
        info!(room = %room.room_id, player = %player_id, players = room.players.len(), "Entered room");
        self.room = Some(room.clone());
        self.player_id = Some(player_id.clone());
    }
}
