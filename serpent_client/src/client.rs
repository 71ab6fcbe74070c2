//! Match orchestrator.
//!
//! The session maintains:
//! - The transport, room coordinator and state synchronizer
//! - The locally predicted entity and its reconciliation against server ticks
//! - Remote entities materialized from snapshots
//! - A fixed-timestep frame loop while a match is running
//! - Console commands

use std::future;

use serpent_shared::{
    config::ClientConfig,
    event::{Dispatcher, Event, HandlerId},
    math::{Direction, Vec2},
    net::{ConsumableId, ConsumableKind, Envelope, PlayerId, RoomInfo, ServerMessage},
    render::{Banner, Color, RenderSurface, ScoreLine, LOCAL_COLOR, PLAYER_PALETTE},
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    console::{ConsoleCommand, HELP},
    entity::{LocalEntity, StepOutcome},
    frame::FrameLoop,
    interp::TickSnapshot,
    room::{RoomCoordinator, RoomEvent},
    sync::{StateSynchronizer, SyncEvent},
    transport::{ConnectionState, TransportClient},
};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Disconnected,
    Lobby,
    Playing,
    /// Local entity is dead; the match continues without it.
    Spectating,
    GameOver,
}

/// What reconciling one snapshot did to the local entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Prediction within tolerance; kept.
    Agreed,
    /// Prediction replaced by the server body.
    Corrected,
    /// No local entity in this snapshot.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickupOutcome {
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingPickup {
    food_id: ConsumableId,
    kind: ConsumableKind,
    /// Server score when the pickup was predicted.
    score_at: u32,
    tick_at: u64,
}

/// A remote player as last seen in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntity {
    pub player_id: PlayerId,
    pub name: String,
    pub body: Vec<Vec2>,
    pub score: u32,
    pub alive: bool,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: MatchState, to: MatchState },
    LocalDied,
    Corrected { tick: u64 },
    Pickup {
        food_id: ConsumableId,
        outcome: PickupOutcome,
    },
    MatchOver { ranking: Vec<ScoreLine> },
    ConnectionLost,
}

impl Event for SessionEvent {
    fn kind(&self) -> &str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::LocalDied => "local_died",
            SessionEvent::Corrected { .. } => "corrected",
            SessionEvent::Pickup {
                outcome: PickupOutcome::Confirmed,
                ..
            } => "pickup_confirmed",
            SessionEvent::Pickup {
                outcome: PickupOutcome::Rejected,
                ..
            } => "pickup_rejected",
            SessionEvent::MatchOver { .. } => "match_over",
            SessionEvent::ConnectionLost => "connection_lost",
        }
    }
}

/// High-level multiplayer session.
pub struct MatchSession {
    cfg: ClientConfig,
    transport: TransportClient,
    room: RoomCoordinator,
    sync: StateSynchronizer,
    state: MatchState,

    local: Option<LocalEntity>,
    local_score: u32,
    local_alive: bool,
    remotes: Vec<RemoteEntity>,
    /// Remotes seen this match; picks palette colors.
    joined: usize,
    pickups: Vec<PendingPickup>,
    last_tick: u64,

    frame: Option<FrameLoop>,
    redraw: bool,
    epoch: Instant,
    events: Dispatcher<SessionEvent>,
}

impl MatchSession {
    pub fn new(cfg: ClientConfig, transport: TransportClient) -> Self {
        let room = RoomCoordinator::new(transport.sender());
        let sync = StateSynchronizer::new(transport.sender(), cfg.interp_buffer);
        Self {
            cfg,
            transport,
            room,
            sync,
            state: MatchState::Disconnected,
            local: None,
            local_score: 0,
            local_alive: false,
            remotes: Vec::new(),
            joined: 0,
            pickups: Vec::new(),
            last_tick: 0,
            frame: None,
            redraw: false,
            epoch: Instant::now(),
            events: Dispatcher::new(),
        }
    }

    /// Session over TCP to `cfg.server_addr`.
    pub fn from_config(cfg: ClientConfig) -> Self {
        let transport = TransportClient::from_config(&cfg);
        Self::new(cfg, transport)
    }

    // ─── Queries ───

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    pub fn room(&self) -> Option<&RoomInfo> {
        self.room.room()
    }

    pub fn coordinator(&self) -> &RoomCoordinator {
        &self.room
    }

    pub fn synchronizer(&self) -> &StateSynchronizer {
        &self.sync
    }

    pub fn transport_mut(&mut self) -> &mut TransportClient {
        &mut self.transport
    }

    pub fn local(&self) -> Option<&LocalEntity> {
        self.local.as_ref()
    }

    pub fn local_score(&self) -> u32 {
        self.local_score
    }

    pub fn local_alive(&self) -> bool {
        self.local_alive
    }

    /// Remote entities in the order they were first seen.
    pub fn remotes(&self) -> &[RemoteEntity] {
        &self.remotes
    }

    pub fn frame_loop_running(&self) -> bool {
        self.frame.is_some()
    }

    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, kind: &str, id: HandlerId) -> bool {
        self.events.off(kind, id)
    }

    /// Session clock in milliseconds.
    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    fn set_state(&mut self, to: MatchState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!(?from, ?to, "Match state");
        self.state = to;
        self.events.dispatch(&SessionEvent::StateChanged { from, to });
    }

    // ─── Lifecycle ───

    pub async fn connect(&mut self) -> anyhow::Result<()> {
        self.transport.connect().await?;
        if self.state == MatchState::Disconnected {
            self.set_state(MatchState::Lobby);
        }
        Ok(())
    }

    pub fn create_room(&self, max_players: u32) {
        self.room.create_room(&self.cfg.player_name, max_players);
    }

    pub fn join_room(&self, room_id: &str) {
        self.room.join_room(room_id, &self.cfg.player_name);
    }

    pub fn matchmaking(&self) {
        self.room.matchmaking(&self.cfg.player_name);
    }

    pub fn cancel_matchmaking(&self) {
        self.room.cancel_matchmaking();
    }

    pub fn set_ready(&self) {
        self.room.set_ready();
    }

    /// Leaves the room; an ongoing match is abandoned.
    pub fn leave_room(&mut self) {
        self.room.leave_room();
        self.end_match();
        if self.state != MatchState::Disconnected {
            self.set_state(MatchState::Lobby);
        }
    }

    /// Tears the session down. A new `connect` is needed afterwards.
    pub fn disconnect(&mut self) {
        self.room.leave_room();
        self.transport.disconnect();
        self.end_match();
        self.set_state(MatchState::Disconnected);
    }

    fn end_match(&mut self) {
        self.stop_loop();
        self.remotes.clear();
        self.pickups.clear();
        self.local = None;
        self.local_alive = false;
        self.sync.reset();
    }

    fn start_match(&mut self) {
        if matches!(self.state, MatchState::Playing | MatchState::Spectating) {
            return;
        }
        info!(player = ?self.sync.player_id(), "Match started");
        self.local = Some(LocalEntity::spawn(&self.cfg));
        self.local_score = 0;
        self.local_alive = true;
        self.remotes.clear();
        self.joined = 0;
        self.pickups.clear();
        self.frame = Some(FrameLoop::start(self.cfg.tick(), self.cfg.frame_interval()));
        self.set_state(MatchState::Playing);
    }

    fn stop_loop(&mut self) {
        if self.frame.take().is_some() {
            debug!("Frame loop stopped");
        }
    }

    // ─── Input ───

    /// Steers the local entity and reports it. Returns false if refused.
    pub fn steer(&mut self, direction: Direction) -> bool {
        if self.state != MatchState::Playing || !self.local_alive {
            return false;
        }
        let Some(local) = &mut self.local else {
            return false;
        };
        if !local.set_direction(direction) {
            return false;
        }
        self.sync.send_input(direction);
        true
    }

    // ─── Inbound ───

    /// Routes one inbound envelope.
    pub fn handle_envelope(&mut self, env: &Envelope) {
        if env.kind == ServerMessage::CONNECTION_FAILED {
            self.connection_lost();
            return;
        }
        match ServerMessage::from_envelope(env) {
            Ok(msg) => self.handle_message(&msg),
            Err(e) => warn!(kind = %env.kind, error = %format!("{e:#}"), "Dropping undecodable message"),
        }
    }

    pub fn handle_message(&mut self, msg: &ServerMessage) {
        match msg {
            ServerMessage::GameState(_)
            | ServerMessage::PlayerDied { .. }
            | ServerMessage::GameOver {} => {
                if matches!(msg, ServerMessage::GameOver {}) {
                    self.room.handle(msg);
                }
                let now = self.now_ms();
                match self.sync.handle(msg, now) {
                    Some(SyncEvent::Snapshot { .. }) => self.on_snapshot(),
                    Some(SyncEvent::PlayerDied { player_id, reason }) => {
                        self.on_player_died(&player_id, reason.as_deref())
                    }
                    Some(SyncEvent::GameOver) => self.on_game_over(),
                    None => {}
                }
            }
            ServerMessage::ConnectionFailed {} => self.connection_lost(),
            _ => {
                if let Some(event) = self.room.handle(msg) {
                    self.on_room_event(event);
                }
            }
        }
    }

    fn on_room_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::RoomCreated(_) | RoomEvent::RoomJoined(_) | RoomEvent::MatchFound(_) => {
                self.sync.set_player_id(self.room.player_id().cloned());
                if self.state != MatchState::Lobby {
                    self.end_match();
                    self.set_state(MatchState::Lobby);
                }
            }
            RoomEvent::GameStarting(_) => self.start_match(),
            _ => {}
        }
    }

    fn connection_lost(&mut self) {
        warn!("Connection to server lost for good");
        self.stop_loop();
        self.set_state(MatchState::Disconnected);
        self.events.dispatch(&SessionEvent::ConnectionLost);
    }

    fn on_player_died(&mut self, player_id: &PlayerId, reason: Option<&str>) {
        info!(player = %player_id, reason, "Player died");
        if self.sync.player_id() == Some(player_id) {
            self.local_died();
        } else if let Some(remote) = self.remotes.iter_mut().find(|r| &r.player_id == player_id) {
            remote.alive = false;
        }
    }

    fn local_died(&mut self) {
        if !self.local_alive {
            return;
        }
        self.local_alive = false;
        if self.state == MatchState::Playing {
            self.set_state(MatchState::Spectating);
        }
        self.events.dispatch(&SessionEvent::LocalDied);
    }

    /// The server still has the local entity alive after a local death.
    fn local_revived(&mut self) {
        info!("Server reports local entity alive, resuming play");
        self.local_alive = true;
        if self.state == MatchState::Spectating {
            self.set_state(MatchState::Playing);
        }
    }

    fn on_game_over(&mut self) {
        if self.state == MatchState::Disconnected {
            return;
        }
        self.stop_loop();
        self.set_state(MatchState::GameOver);
        let ranking = self.ranking();
        info!(winner = ?ranking.first().map(|l| &l.name), "Match over");
        self.events.dispatch(&SessionEvent::MatchOver { ranking });
        self.redraw = true;
    }

    fn on_snapshot(&mut self) {
        let Some(snap) = self.sync.current().cloned() else {
            return;
        };
        if self.state == MatchState::Lobby {
            // game_starting was missed.
            self.start_match();
        }
        self.last_tick = snap.tick;
        self.reconcile(&snap);
        self.materialize_remotes(&snap);
        self.resolve_pickups(&snap);
    }

    /// Adopts the server's score and liveness and corrects the prediction
    /// when it drifted beyond tolerance.
    fn reconcile(&mut self, snap: &TickSnapshot) -> Reconciliation {
        let Some(me) = self.sync.player_id().cloned() else {
            return Reconciliation::Absent;
        };
        let Some(auth) = snap.entity(&me) else {
            return Reconciliation::Absent;
        };
        self.local_score = auth.score;
        let revived = auth.alive && !self.local_alive;
        if revived {
            self.local_revived();
        } else if !auth.alive {
            self.local_died();
        }
        let (Some(local), Some(server_head)) = (&mut self.local, auth.head()) else {
            return Reconciliation::Absent;
        };

        let tolerance = self.cfg.reconcile_tolerance;
        let (dx, dy) = local.head().abs_diff(server_head);
        if !revived && dx <= tolerance && dy <= tolerance {
            return Reconciliation::Agreed;
        }
        debug!(tick = snap.tick, dx, dy, revived, "Hard correction");
        local.correct(&auth.body, auth.direction);
        self.events
            .dispatch(&SessionEvent::Corrected { tick: snap.tick });
        Reconciliation::Corrected
    }

    fn materialize_remotes(&mut self, snap: &TickSnapshot) {
        let me = self.sync.player_id().cloned();
        for entity in &snap.entities {
            if Some(&entity.player_id) == me.as_ref() {
                continue;
            }
            match self
                .remotes
                .iter_mut()
                .find(|r| r.player_id == entity.player_id)
            {
                Some(remote) => {
                    remote.body.clone_from(&entity.body);
                    remote.score = entity.score;
                    remote.alive = entity.alive;
                }
                None => {
                    let color = PLAYER_PALETTE[self.joined % PLAYER_PALETTE.len()];
                    self.joined += 1;
                    let name = self
                        .room
                        .room()
                        .and_then(|r| r.player(&entity.player_id))
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| entity.player_id.to_string());
                    debug!(player = %entity.player_id, %name, "Remote entity appeared");
                    self.remotes.push(RemoteEntity {
                        player_id: entity.player_id.clone(),
                        name,
                        body: entity.body.clone(),
                        score: entity.score,
                        alive: entity.alive,
                        color,
                    });
                }
            }
        }
        self.remotes
            .retain(|r| snap.entity(&r.player_id).is_some());
    }

    /// Confirms or rolls back optimistic pickups.
    fn resolve_pickups(&mut self, snap: &TickSnapshot) {
        let score = self.local_score;
        let grace = self.cfg.pickup_grace_ticks;
        let mut resolved = Vec::new();
        self.pickups.retain(|p| {
            let listed = snap.consumables.iter().any(|c| c.id == p.food_id);
            let outcome = match (listed, score > p.score_at) {
                (false, true) => PickupOutcome::Confirmed,
                (false, false) => PickupOutcome::Rejected,
                (true, _) if snap.tick >= p.tick_at + grace => PickupOutcome::Rejected,
                (true, _) => return true,
            };
            resolved.push((p.clone(), outcome));
            false
        });

        for (pickup, outcome) in resolved {
            if outcome == PickupOutcome::Rejected {
                warn!(food = %pickup.food_id, tick = snap.tick, "Predicted pickup rejected");
                if let Some(local) = &mut self.local {
                    local.retract_growth(pickup.kind.growth());
                }
            }
            self.events.dispatch(&SessionEvent::Pickup {
                food_id: pickup.food_id,
                outcome,
            });
        }
    }

    // ─── Simulation ───

    /// One fixed simulation step of the local entity.
    pub fn step(&mut self) {
        if self.state != MatchState::Playing || !self.local_alive {
            return;
        }
        let Some(local) = &mut self.local else {
            return;
        };
        if local.advance(&self.cfg) == StepOutcome::HitWall {
            info!(head = ?local.head(), "Local entity hit a wall");
            self.local_died();
            return;
        }

        let head = local.head();
        let Some(food) = self.sync.current().and_then(|s| {
            s.consumables.iter().find(|c| {
                c.position.same_cell(head) && !self.pickups.iter().any(|p| p.food_id == c.id)
            })
        }) else {
            return;
        };
        let food = food.clone();
        local.grow(food.kind.growth());
        debug!(food = %food.id, kind = ?food.kind, "Predicted pickup");
        self.pickups.push(PendingPickup {
            food_id: food.id.clone(),
            kind: food.kind,
            score_at: self.local_score,
            tick_at: self.last_tick,
        });
        self.sync.send_consumable_taken(&food.id);
    }

    /// Runs `steps` simulation steps, then draws one frame.
    pub fn frame(&mut self, steps: u32, surface: &mut dyn RenderSurface) {
        for _ in 0..steps {
            self.step();
        }
        self.render(surface);
    }

    // ─── Rendering ───

    pub fn render(&self, surface: &mut dyn RenderSurface) {
        surface.begin_frame(self.cfg.grid_width, self.cfg.grid_height);
        surface.draw_grid();

        // Remotes run one server tick behind, between the two newest snapshots.
        let view = self
            .sync
            .interpolated_state(self.now_ms() - self.cfg.tick_ms as f64);
        if let Some(view) = &view {
            for c in &view.consumables {
                if !self.pickups.iter().any(|p| p.food_id == c.id) {
                    surface.draw_consumable(c);
                }
            }
        }

        for remote in self.remotes.iter().filter(|r| r.alive) {
            let body = view
                .as_ref()
                .and_then(|v| v.entity(&remote.player_id))
                .map_or(remote.body.as_slice(), |e| e.body.as_slice());
            surface.draw_entity(body, remote.color, false);
        }

        if let (true, Some(local)) = (self.local_alive, &self.local) {
            surface.draw_entity(local.body(), LOCAL_COLOR, true);
        }

        surface.draw_scoreboard(&self.scoreboard());
        if self.transport.state() != ConnectionState::Connected {
            surface.draw_banner(Banner::Reconnecting);
        }
        if self.state == MatchState::Spectating {
            surface.draw_banner(Banner::Spectating);
        }
        if self.state == MatchState::GameOver {
            surface.draw_final_ranking(&self.ranking());
        }
        surface.end_frame();
    }

    /// Local line first, then remotes in join order.
    pub fn scoreboard(&self) -> Vec<ScoreLine> {
        let mut lines = Vec::with_capacity(self.remotes.len() + 1);
        lines.push(ScoreLine {
            name: self.cfg.player_name.clone(),
            score: self.local_score,
            alive: self.local_alive,
            color: LOCAL_COLOR,
            local: true,
        });
        lines.extend(self.remotes.iter().map(|r| ScoreLine {
            name: r.name.clone(),
            score: r.score,
            alive: r.alive,
            color: r.color,
            local: false,
        }));
        lines
    }

    /// Scoreboard sorted by score, highest first. Ties keep scoreboard order.
    pub fn ranking(&self) -> Vec<ScoreLine> {
        let mut lines = self.scoreboard();
        lines.sort_by(|a, b| b.score.cmp(&a.score));
        lines
    }

    // ─── Console ───

    /// Executes a console command and returns lines to show.
    pub async fn exec_console(&mut self, cmd: ConsoleCommand) -> Vec<String> {
        match cmd {
            ConsoleCommand::Connect => match self.connect().await {
                Ok(()) => vec![format!("Connected to {}", self.cfg.server_addr)],
                Err(e) => vec![format!("Connect failed: {e:#}")],
            },
            ConsoleCommand::Create { name, max_players } => {
                self.rename(name);
                self.create_room(max_players);
                Vec::new()
            }
            ConsoleCommand::Join { room_id, name } => {
                self.rename(name);
                self.join_room(&room_id);
                Vec::new()
            }
            ConsoleCommand::Match { name } => {
                self.rename(name);
                self.matchmaking();
                vec!["Searching for a match...".to_string()]
            }
            ConsoleCommand::Cancel => {
                self.cancel_matchmaking();
                Vec::new()
            }
            ConsoleCommand::Ready => {
                if self.room().is_none() {
                    return vec!["Not in a room".to_string()];
                }
                self.set_ready();
                Vec::new()
            }
            ConsoleCommand::Leave => {
                self.leave_room();
                vec!["Left room".to_string()]
            }
            ConsoleCommand::Steer(direction) => {
                self.steer(direction);
                Vec::new()
            }
            ConsoleCommand::Status => self.status_lines(),
            ConsoleCommand::Disconnect => {
                self.disconnect();
                vec!["Disconnected".to_string()]
            }
            ConsoleCommand::Help => HELP.iter().map(|s| s.to_string()).collect(),
            ConsoleCommand::Quit => Vec::new(),
        }
    }

    fn rename(&mut self, name: Option<String>) {
        if let Some(name) = name {
            self.cfg.player_name = name;
        }
    }

    pub fn status_lines(&self) -> Vec<String> {
        let mut out = vec![
            format!("State: {:?}", self.state),
            format!("Connection: {:?}", self.transport.state()),
        ];
        if let Some(room) = self.room() {
            out.push(format!(
                "Room: {} ({}/{} players, {:?}{})",
                room.room_id,
                room.players.len(),
                room.max_players,
                room.status,
                if self.room.is_host() { ", host" } else { "" }
            ));
        }
        out.push(format!("Tick: {}", self.last_tick));
        out.push(format!("Snapshots buffered: {}", self.sync.buffered()));
        out.push(format!("Pending inputs: {}", self.sync.pending_inputs().len()));
        out.push(format!("Score: {}", self.local_score));
        out
    }

    // ─── Driver ───

    /// Drives the session until `quit` or until the command channel closes.
    ///
    /// Inbound messages, steering intents, console commands and frames are
    /// handled one at a time, each to completion.
    pub async fn run(
        &mut self,
        mut intents: mpsc::Receiver<Direction>,
        mut commands: mpsc::Receiver<ConsoleCommand>,
        surface: &mut dyn RenderSurface,
        mut output: impl FnMut(&str),
    ) {
        loop {
            tokio::select! {
                env = self.transport.next_message() => {
                    let Some(env) = env else { break };
                    self.handle_envelope(&env);
                }
                Some(direction) = intents.recv() => {
                    self.steer(direction);
                }
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    if cmd == ConsoleCommand::Quit {
                        break;
                    }
                    for line in self.exec_console(cmd).await {
                        output(&line);
                    }
                }
                steps = next_frame(&mut self.frame) => {
                    self.frame(steps, surface);
                }
            }
            if self.redraw {
                self.redraw = false;
                self.render(surface);
            }
        }
        if self.state != MatchState::Disconnected {
            self.disconnect();
        }
    }
}

async fn next_frame(frame: &mut Option<FrameLoop>) -> u32 {
    match frame {
        Some(frame) => frame.next_frame().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serpent_shared::{
        net::{ConsumableState, EntityState, GameState, PlayerInfo, RoomStatus},
        render::NullSurface,
    };

    use crate::{
        ascii::AsciiSurface,
        transport::tests::{transport, PipeConnector},
    };

    fn cfg() -> ClientConfig {
        ClientConfig {
            player_name: "me".into(),
            grid_width: 20,
            grid_height: 20,
            ..ClientConfig::default()
        }
    }

    fn session() -> MatchSession {
        MatchSession::new(cfg(), transport(&PipeConnector::default()))
    }

    fn room_info() -> RoomInfo {
        let p = |id: &str| PlayerInfo {
            id: id.into(),
            name: format!("name-{id}"),
            skin_id: "default".into(),
            ready: true,
        };
        RoomInfo {
            room_id: "r1".into(),
            host_id: "me".into(),
            players: vec![p("me"), p("p2"), p("p3")],
            max_players: 4,
            status: RoomStatus::Waiting,
        }
    }

    fn snake(id: &str, body: &[(i32, i32)], score: u32, alive: bool) -> EntityState {
        EntityState {
            player_id: id.into(),
            body: body.iter().map(|&(x, y)| Vec2::cell(x, y)).collect(),
            direction: Direction::Right,
            alive,
            score,
            skin_id: "default".into(),
        }
    }

    fn food(id: &str, at: (i32, i32), kind: ConsumableKind) -> ConsumableState {
        ConsumableState {
            id: id.into(),
            position: Vec2::cell(at.0, at.1),
            kind,
        }
    }

    fn tick(tick: u64, snakes: Vec<EntityState>, foods: Vec<ConsumableState>) -> ServerMessage {
        ServerMessage::GameState(GameState {
            tick,
            snakes,
            foods,
            timestamp: 0,
        })
    }

    /// A session that has joined a room and started a match.
    fn playing() -> MatchSession {
        let mut s = session();
        s.handle_message(&ServerMessage::RoomCreated {
            room: room_info(),
            player_id: "me".into(),
        });
        s.handle_message(&ServerMessage::GameStarting { countdown: None });
        s
    }

    fn recorder(s: &mut MatchSession, kind: &str) -> Arc<Mutex<Vec<SessionEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        s.on(kind, move |e: &SessionEvent| {
            l.lock().unwrap().push(e.clone());
            Ok(())
        });
        log
    }

    #[tokio::test]
    async fn game_starting_spawns_and_arms_loop() {
        let s = playing();
        assert_eq!(s.state(), MatchState::Playing);
        assert!(s.frame_loop_running());
        assert_eq!(s.local().unwrap().head(), Vec2::cell(10, 10));
        assert!(s.local_alive());
    }

    #[tokio::test]
    async fn reconcile_keeps_within_tolerance_and_replaces_beyond() {
        let mut s = playing();
        let corrections = recorder(&mut s, "corrected");

        // Local head (10,10); server head two cells off on both axes.
        let near = snake("me", &[(12, 12), (11, 12)], 10, true);
        let snap = TickSnapshot::from_state(
            GameState {
                tick: 1,
                snakes: vec![near],
                foods: vec![],
                timestamp: 0,
            },
            0.0,
        );
        assert_eq!(s.reconcile(&snap), Reconciliation::Agreed);
        assert_eq!(s.local().unwrap().head(), Vec2::cell(10, 10));
        assert_eq!(s.local_score(), 10);

        let far = snake("me", &[(13, 10), (12, 10), (11, 10)], 10, true);
        let snap = TickSnapshot::from_state(
            GameState {
                tick: 2,
                snakes: vec![far.clone()],
                foods: vec![],
                timestamp: 0,
            },
            0.0,
        );
        assert_eq!(s.reconcile(&snap), Reconciliation::Corrected);
        assert_eq!(s.local().unwrap().body(), far.body.as_slice());
        assert_eq!(*corrections.lock().unwrap(), vec![SessionEvent::Corrected { tick: 2 }]);

        let empty = TickSnapshot::from_state(
            GameState {
                tick: 3,
                snakes: vec![],
                foods: vec![],
                timestamp: 0,
            },
            0.0,
        );
        assert_eq!(s.reconcile(&empty), Reconciliation::Absent);
    }

    #[tokio::test]
    async fn remotes_materialize_in_join_order_and_vanish() {
        let mut s = playing();
        s.handle_message(&tick(
            1,
            vec![
                snake("me", &[(10, 10)], 0, true),
                snake("p3", &[(1, 1)], 30, true),
                snake("p2", &[(2, 2)], 20, true),
            ],
            vec![],
        ));
        let ids: Vec<&str> = s.remotes().iter().map(|r| r.player_id.as_str()).collect();
        assert_eq!(ids, vec!["p3", "p2"]);
        assert_eq!(s.remotes()[0].color, PLAYER_PALETTE[0]);
        assert_eq!(s.remotes()[1].color, PLAYER_PALETTE[1]);
        assert_eq!(s.remotes()[0].name, "name-p3");

        s.handle_message(&tick(
            2,
            vec![
                snake("me", &[(11, 10)], 0, true),
                snake("p2", &[(3, 2)], 25, false),
            ],
            vec![],
        ));
        assert_eq!(s.remotes().len(), 1);
        assert_eq!(s.remotes()[0].score, 25);
        assert!(!s.remotes()[0].alive);
    }

    #[tokio::test]
    async fn local_death_moves_to_spectating() {
        let mut s = playing();
        let died = recorder(&mut s, "local_died");
        s.handle_message(&ServerMessage::PlayerDied {
            player_id: "me".into(),
            reason: Some("collision".into()),
        });
        assert_eq!(s.state(), MatchState::Spectating);
        assert!(!s.steer(Direction::Up));
        // A dead flag in a later snapshot does not report twice.
        s.handle_message(&tick(1, vec![snake("me", &[(10, 10)], 0, false)], vec![]));
        assert_eq!(died.lock().unwrap().len(), 1);
        assert!(s.frame_loop_running());
    }

    #[tokio::test]
    async fn wall_hit_kills_locally() {
        let mut s = playing();
        for _ in 0..10 {
            s.step();
        }
        assert_eq!(s.state(), MatchState::Spectating);
        assert_eq!(s.local().unwrap().head(), Vec2::cell(19, 10));
    }

    #[tokio::test]
    async fn server_alive_flag_overrides_local_wall_death() {
        let mut s = playing();
        let changes = recorder(&mut s, "state_changed");
        for _ in 0..10 {
            s.step();
        }
        assert_eq!(s.state(), MatchState::Spectating);
        assert!(!s.local_alive());

        s.handle_message(&tick(1, vec![snake("me", &[(18, 10), (17, 10)], 0, true)], vec![]));
        assert!(s.local_alive());
        assert_eq!(s.state(), MatchState::Playing);
        assert_eq!(s.local().unwrap().head(), Vec2::cell(18, 10));
        assert!(s.steer(Direction::Up));
        assert_eq!(
            changes.lock().unwrap().last(),
            Some(&SessionEvent::StateChanged {
                from: MatchState::Spectating,
                to: MatchState::Playing
            })
        );
    }

    /// Keeps the remote bodies drawn in the last frame.
    #[derive(Default)]
    struct RemoteBodies(Vec<Vec<Vec2>>);

    impl RenderSurface for RemoteBodies {
        fn begin_frame(&mut self, _grid_width: i32, _grid_height: i32) {
            self.0.clear();
        }
        fn draw_grid(&mut self) {}
        fn draw_consumable(&mut self, _consumable: &ConsumableState) {}
        fn draw_entity(&mut self, body: &[Vec2], _color: Color, local: bool) {
            if !local {
                self.0.push(body.to_vec());
            }
        }
        fn draw_scoreboard(&mut self, _lines: &[ScoreLine]) {}
        fn draw_banner(&mut self, _banner: Banner) {}
        fn draw_final_ranking(&mut self, _ranking: &[ScoreLine]) {}
        fn end_frame(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn remotes_render_between_snapshots() {
        let mut s = playing();
        let tick_ms = Duration::from_millis(s.config().tick_ms);
        let mut surface = RemoteBodies::default();

        s.handle_message(&tick(
            1,
            vec![snake("me", &[(10, 10)], 0, true), snake("p2", &[(0, 5)], 0, true)],
            vec![],
        ));
        tokio::time::advance(tick_ms).await;
        s.handle_message(&tick(
            2,
            vec![snake("me", &[(11, 10)], 0, true), snake("p2", &[(4, 5)], 0, true)],
            vec![],
        ));

        tokio::time::advance(tick_ms / 2).await;
        s.render(&mut surface);
        assert_eq!(surface.0.len(), 1);
        let head = surface.0[0][0];
        assert!((head.x - 2.0).abs() < 0.01, "head drawn at {head:?}");
        assert_eq!(head.y, 5.0);

        tokio::time::advance(tick_ms).await;
        s.render(&mut surface);
        assert_eq!(surface.0[0][0], Vec2::cell(4, 5));
    }

    #[tokio::test]
    async fn steering_rejects_reversal() {
        let mut s = playing();
        assert!(!s.steer(Direction::Left));
        assert!(s.steer(Direction::Up));
        assert_eq!(s.synchronizer().pending_inputs().len(), 1);
    }

    #[tokio::test]
    async fn confirmed_pickup_keeps_growth() {
        let mut s = playing();
        let pickups = recorder(&mut s, "*");
        s.handle_message(&tick(
            1,
            vec![snake("me", &[(10, 10), (9, 10), (8, 10)], 0, true)],
            vec![food("f1", (11, 10), ConsumableKind::Golden)],
        ));
        s.step();
        assert_eq!(s.local().unwrap().queued_growth(), 3);

        s.handle_message(&tick(
            2,
            vec![snake("me", &[(11, 10), (10, 10), (9, 10), (8, 10)], 50, true)],
            vec![],
        ));
        assert_eq!(s.local_score(), 50);
        assert_eq!(s.local().unwrap().queued_growth(), 3);
        assert!(pickups.lock().unwrap().contains(&SessionEvent::Pickup {
            food_id: "f1".into(),
            outcome: PickupOutcome::Confirmed
        }));
    }

    #[tokio::test]
    async fn contradicted_pickup_cancels_queued_growth() {
        let mut s = playing();
        let rejected = recorder(&mut s, "pickup_rejected");
        s.handle_message(&tick(
            1,
            vec![snake("me", &[(10, 10)], 0, true)],
            vec![food("f1", (11, 10), ConsumableKind::Golden)],
        ));
        s.step();
        s.step();
        assert_eq!(s.local().unwrap().queued_growth(), 2);

        // Still listed but within grace.
        s.handle_message(&tick(
            2,
            vec![snake("me", &[(11, 10)], 0, true)],
            vec![food("f1", (11, 10), ConsumableKind::Golden)],
        ));
        assert!(rejected.lock().unwrap().is_empty());

        s.handle_message(&tick(
            4,
            vec![snake("me", &[(12, 10)], 0, true)],
            vec![food("f1", (11, 10), ConsumableKind::Golden)],
        ));
        assert_eq!(rejected.lock().unwrap().len(), 1);
        assert_eq!(s.local().unwrap().queued_growth(), 0);
        assert_eq!(s.local_score(), 0);
    }

    #[tokio::test]
    async fn vanished_without_score_is_rejected() {
        let mut s = playing();
        let rejected = recorder(&mut s, "pickup_rejected");
        s.handle_message(&tick(
            1,
            vec![snake("me", &[(10, 10)], 0, true)],
            vec![food("f1", (11, 10), ConsumableKind::Normal)],
        ));
        s.step();
        s.handle_message(&tick(2, vec![snake("me", &[(11, 10)], 0, true)], vec![]));
        assert_eq!(rejected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn game_over_ranks_and_stops_loop() {
        let mut s = playing();
        let over = recorder(&mut s, "match_over");
        s.handle_message(&tick(
            1,
            vec![
                snake("me", &[(10, 10)], 20, true),
                snake("p2", &[(1, 1)], 40, true),
                snake("p3", &[(2, 2)], 20, true),
            ],
            vec![],
        ));
        s.handle_message(&ServerMessage::GameOver {});
        assert_eq!(s.state(), MatchState::GameOver);
        assert!(!s.frame_loop_running());
        assert_eq!(s.room().unwrap().status, RoomStatus::Finished);

        let events = over.lock().unwrap();
        let SessionEvent::MatchOver { ranking } = &events[0] else {
            panic!("expected match_over");
        };
        let order: Vec<(&str, u32)> = ranking.iter().map(|l| (l.name.as_str(), l.score)).collect();
        assert_eq!(order, vec![("name-p2", 40), ("me", 20), ("name-p3", 20)]);
    }

    #[tokio::test]
    async fn render_draws_banners_and_overlay() {
        let mut s = playing();
        s.handle_message(&tick(
            1,
            vec![snake("me", &[(10, 10)], 0, true), snake("p2", &[(0, 0)], 0, true)],
            vec![food("f1", (5, 5), ConsumableKind::Speed)],
        ));
        let mut surface = AsciiSurface::new();
        s.render(&mut surface);
        let frame = surface.frame();
        assert!(frame.contains('@'));
        assert!(frame.contains('X'));
        assert!(frame.contains('>'));
        // The test transport never connected.
        assert!(frame.contains("reconnecting"));

        s.handle_message(&ServerMessage::GameOver {});
        s.render(&mut surface);
        assert!(surface.frame().contains("match over"));
        s.frame(3, &mut NullSurface);
    }

    #[tokio::test]
    async fn connection_failed_stops_and_reports() {
        let mut s = playing();
        let lost = recorder(&mut s, "connection_lost");
        s.handle_envelope(&Envelope::new(ServerMessage::CONNECTION_FAILED));
        assert_eq!(s.state(), MatchState::Disconnected);
        assert!(!s.frame_loop_running());
        assert_eq!(lost.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_tears_down() {
        let mut s = playing();
        s.handle_message(&tick(1, vec![snake("p2", &[(0, 0)], 0, true)], vec![]));
        s.disconnect();
        assert_eq!(s.state(), MatchState::Disconnected);
        assert!(s.remotes().is_empty());
        assert!(s.room().is_none());
        assert!(s.synchronizer().current().is_none());
        assert!(!s.frame_loop_running());
    }

    #[tokio::test]
    async fn console_status_and_ready_without_room() {
        let mut s = session();
        assert_eq!(
            s.exec_console(ConsoleCommand::Ready).await,
            vec!["Not in a room".to_string()]
        );
        let status = s.exec_console(ConsoleCommand::Status).await;
        assert_eq!(status[0], "State: Disconnected");
    }
}
