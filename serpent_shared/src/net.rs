//! Networking primitives.
//!
//! - Wire envelope: `{"type": <discriminator>, "payload": {...}}`, used in both
//!   directions.
//! - Typed client/server messages mapped onto the envelope.
//! - Length-prefixed framing (u32 big-endian) over any async byte stream.

use std::fmt;

use anyhow::{bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{
    event::Event,
    math::{Direction, Vec2},
};

/// Upper bound for a single frame unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Server-assigned player identifier.
    PlayerId
);
string_id!(
    /// Server-assigned room identifier.
    RoomId
);
string_id!(
    /// Identifies a consumable on the board.
    ConsumableId
);

// ─── Room model ───

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Waiting,
    Starting,
    Playing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub name: String,
    #[serde(default = "default_skin")]
    pub skin_id: String,
    #[serde(default)]
    pub ready: bool,
}

fn default_skin() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub host_id: PlayerId,
    #[serde(default)]
    pub players: Vec<PlayerInfo>,
    pub max_players: u32,
    #[serde(default)]
    pub status: RoomStatus,
}

impl RoomInfo {
    pub fn player(&self, id: &PlayerId) -> Option<&PlayerInfo> {
        self.players.iter().find(|p| &p.id == id)
    }
}

// ─── Gameplay model ───

/// Consumable kind tag. Unknown tags are read as `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsumableKind {
    Speed,
    Golden,
    Shrink,
    #[default]
    #[serde(other)]
    Normal,
}

impl ConsumableKind {
    /// Segments gained (negative: lost) when eaten.
    pub fn growth(self) -> i32 {
        match self {
            ConsumableKind::Normal => 1,
            ConsumableKind::Speed => 0,
            ConsumableKind::Golden => 3,
            ConsumableKind::Shrink => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumableState {
    pub id: ConsumableId,
    pub position: Vec2,
    #[serde(rename = "type", default)]
    pub kind: ConsumableKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub player_id: PlayerId,
    /// Head first.
    pub body: Vec<Vec2>,
    #[serde(default)]
    pub direction: Direction,
    pub alive: bool,
    #[serde(default)]
    pub score: u32,
    #[serde(default = "default_skin")]
    pub skin_id: String,
}

impl EntityState {
    pub fn head(&self) -> Option<Vec2> {
        self.body.first().copied()
    }
}

/// Authoritative world state for one server tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub tick: u64,
    #[serde(default)]
    pub snakes: Vec<EntityState>,
    #[serde(default)]
    pub foods: Vec<ConsumableState>,
    /// Server wall clock, milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

// ─── Messages ───

/// Generic wire record. Dispatch happens on `kind` before any typed decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("deserialize envelope")
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize envelope")
    }
}

impl Event for Envelope {
    fn kind(&self) -> &str {
        &self.kind
    }
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    CreateRoom {
        player_name: String,
        max_players: u32,
    },
    JoinRoom {
        room_id: RoomId,
        player_name: String,
    },
    Matchmaking {
        player_name: String,
    },
    CancelMatchmaking {},
    PlayerReady {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    PlayerInput {
        player_id: PlayerId,
        direction: Direction,
        sequence: u64,
        timestamp: i64,
    },
    EatFood {
        player_id: PlayerId,
        food_id: ConsumableId,
    },
    Ping {
        timestamp: i64,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom { .. } => "create_room",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::Matchmaking { .. } => "matchmaking",
            ClientMessage::CancelMatchmaking {} => "cancel_matchmaking",
            ClientMessage::PlayerReady { .. } => "player_ready",
            ClientMessage::LeaveRoom { .. } => "leave_room",
            ClientMessage::PlayerInput { .. } => "player_input",
            ClientMessage::EatFood { .. } => "eat_food",
            ClientMessage::Ping { .. } => "ping",
        }
    }

    pub fn to_envelope(&self) -> anyhow::Result<Envelope> {
        to_envelope(self)
    }

    pub fn from_envelope(env: &Envelope) -> anyhow::Result<Self> {
        from_envelope(env)
    }
}

/// Server → client. `ConnectionFailed` is never sent by a server; the
/// transport injects it locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    RoomCreated {
        room: RoomInfo,
        player_id: PlayerId,
    },
    RoomJoined {
        room: RoomInfo,
        player_id: PlayerId,
    },
    MatchFound {
        room: RoomInfo,
        player_id: PlayerId,
    },
    PlayerJoined {
        player: PlayerInfo,
    },
    PlayerLeft {
        player_id: PlayerId,
    },
    PlayerReady {
        player_id: PlayerId,
    },
    GameStarting {
        #[serde(default)]
        countdown: Option<u32>,
    },
    RoomError {
        message: String,
    },
    GameState(GameState),
    PlayerDied {
        player_id: PlayerId,
        #[serde(default)]
        reason: Option<String>,
    },
    GameOver {},
    ConnectionFailed {},
}

impl ServerMessage {
    pub const CONNECTION_FAILED: &'static str = "connection_failed";

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::RoomCreated { .. } => "room_created",
            ServerMessage::RoomJoined { .. } => "room_joined",
            ServerMessage::MatchFound { .. } => "match_found",
            ServerMessage::PlayerJoined { .. } => "player_joined",
            ServerMessage::PlayerLeft { .. } => "player_left",
            ServerMessage::PlayerReady { .. } => "player_ready",
            ServerMessage::GameStarting { .. } => "game_starting",
            ServerMessage::RoomError { .. } => "room_error",
            ServerMessage::GameState(_) => "game_state",
            ServerMessage::PlayerDied { .. } => "player_died",
            ServerMessage::GameOver {} => "game_over",
            ServerMessage::ConnectionFailed {} => Self::CONNECTION_FAILED,
        }
    }

    pub fn to_envelope(&self) -> anyhow::Result<Envelope> {
        to_envelope(self)
    }

    pub fn from_envelope(env: &Envelope) -> anyhow::Result<Self> {
        from_envelope(env)
    }
}

fn to_envelope<M: Serialize>(msg: &M) -> anyhow::Result<Envelope> {
    let value = serde_json::to_value(msg).context("serialize message")?;
    serde_json::from_value(value).context("message is not an envelope")
}

fn from_envelope<M: for<'de> Deserialize<'de>>(env: &Envelope) -> anyhow::Result<M> {
    let value = serde_json::to_value(env).context("serialize envelope")?;
    serde_json::from_value(value).with_context(|| format!("decode `{}` payload", env.kind))
}

// ─── Framing ───

/// Any duplex byte stream a link can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Reads length-prefixed frames.
///
/// `read_frame` is cancel safe: partial frames stay buffered across calls, so
/// it can be used as a `tokio::select!` branch.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            max_frame,
        }
    }

    /// Returns `Ok(None)` on a clean end of stream.
    pub async fn read_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }
            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .context("read frame")?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("stream closed mid-frame ({} bytes buffered)", self.buf.len());
            }
        }
    }

    fn parse_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame {
            bail!("frame of {len} bytes exceeds limit of {}", self.max_frame);
        }
        if self.buf.len() < 4 + len {
            self.buf.reserve(4 + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Writes length-prefixed frames.
pub struct FrameWriter<W> {
    inner: W,
    max_frame: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_frame: usize) -> Self {
        Self { inner, max_frame }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > self.max_frame {
            bail!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                self.max_frame
            );
        }
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        self.inner.write_all(&buf).await.context("write frame")?;
        self.inner.flush().await.context("flush frame")?;
        Ok(())
    }

    /// Serializes any envelope-shaped message and writes it as one frame.
    pub async fn send<M: Serialize>(&mut self, msg: &M) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize msg")?;
        self.write_frame(&payload).await
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.inner.shutdown().await.context("shutdown writer")
    }
}

/// Both halves of a framed stream.
pub struct FramedConn<S> {
    pub reader: FrameReader<ReadHalf<S>>,
    pub writer: FrameWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> FramedConn<S> {
    pub fn new(stream: S, max_frame: usize) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(r, max_frame),
            writer: FrameWriter::new(w, max_frame),
        }
    }

    pub async fn send<M: Serialize>(&mut self, msg: &M) -> anyhow::Result<()> {
        self.writer.send(msg).await
    }

    /// Next envelope, or `None` when the peer closed the stream.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Envelope>> {
        match self.reader.read_frame().await? {
            Some(frame) => Envelope::decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}
