//! Transport client.
//!
//! Owns the single connection to the server. The caller-facing half
//! ([`TransportClient`]) does the initial handshake and dispatches inbound
//! envelopes; a background link task owns the socket once connected, sends
//! keepalive pings and runs the reconnect backoff loop.
//!
//! State machine:
//! `Disconnected → Connecting → Connected → {Disconnected | Reconnecting} → Connecting → …`

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use serpent_shared::{
    config::ClientConfig,
    event::{Dispatcher, HandlerId},
    net::{
        now_millis, BoxedStream, ClientMessage, Envelope, FrameReader, FrameWriter, ServerMessage,
    },
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

/// Exponential backoff: the delay before attempt `n` is `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// Opens the underlying byte stream. Returning `Ok` is a completed handshake.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> anyhow::Result<BoxedStream>;

    /// Human-readable peer for logs.
    fn peer(&self) -> String;
}

/// Plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> anyhow::Result<BoxedStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("tcp connect {}", self.addr))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        Ok(Box::new(stream))
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

struct LinkStatus {
    /// Bumped by every `connect`/`disconnect`; stale link tasks stop mutating state.
    generation: u64,
    attempts: u32,
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    status: Mutex<LinkStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Applies `f` only if `generation` is still current.
    fn if_current(&self, generation: u64, f: impl FnOnce(&mut LinkStatus, &Self)) -> bool {
        let mut status = self.lock();
        if status.generation != generation {
            return false;
        }
        f(&mut status, self);
        true
    }
}

/// Cheap, cloneable send half. Components that only emit commands hold one.
#[derive(Clone)]
pub struct TransportSender {
    shared: Arc<Shared>,
}

impl TransportSender {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Fire-and-forget. Dropped unless connected; never fails.
    pub fn send(&self, msg: &ClientMessage) {
        if !self.is_connected() {
            debug!(kind = msg.kind(), state = ?self.state(), "Dropping message while not connected");
            return;
        }
        let env = match msg.to_envelope() {
            Ok(env) => env,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "Failed to encode message");
                return;
            }
        };
        if let Some(tx) = self.shared.lock().outbound.as_ref() {
            let _ = tx.send(env);
        }
    }
}

/// The transport client.
pub struct TransportClient {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    ping_interval: Duration,
    max_frame: usize,
    shared: Arc<Shared>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: mpsc::UnboundedReceiver<Envelope>,
    handlers: Dispatcher<Envelope>,
    link: Option<JoinHandle<()>>,
}

impl TransportClient {
    pub fn new(
        connector: impl Connector,
        policy: ReconnectPolicy,
        ping_interval: Duration,
        max_frame: usize,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(connector),
            policy,
            ping_interval,
            max_frame,
            shared: Arc::new(Shared {
                state,
                status: Mutex::new(LinkStatus {
                    generation: 0,
                    attempts: 0,
                    outbound: None,
                }),
            }),
            inbound_tx,
            inbound_rx,
            handlers: Dispatcher::new(),
            link: None,
        }
    }

    /// TCP transport configured from `cfg`.
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self::new(
            TcpConnector::new(cfg.server_addr.clone()),
            ReconnectPolicy {
                max_attempts: cfg.reconnect_attempts,
                base_delay: cfg.reconnect_base_delay(),
            },
            cfg.ping_interval(),
            cfg.max_frame_bytes,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch channel following every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().attempts
    }

    pub fn sender(&self) -> TransportSender {
        TransportSender {
            shared: self.shared.clone(),
        }
    }

    pub fn send(&self, msg: &ClientMessage) {
        self.sender().send(msg);
    }

    /// Subscribes to inbound envelopes of `kind` (`"*"` for all).
    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnMut(&Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers.on(kind, handler)
    }

    pub fn off(&mut self, kind: &str, id: HandlerId) -> bool {
        self.handlers.off(kind, id)
    }

    /// Opens the connection. Returns immediately if already connected.
    ///
    /// Only this caller-initiated handshake can fail; later drops are handled
    /// by the background reconnect loop.
    pub async fn connect(&mut self) -> anyhow::Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.stop_link();
        let generation = {
            let mut status = self.shared.lock();
            status.generation += 1;
            status.attempts = 0;
            status.outbound = None;
            self.shared.set_state(ConnectionState::Connecting);
            status.generation
        };

        let peer = self.connector.peer();
        info!(%peer, "Connecting");
        let stream = match self.connector.open().await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.if_current(generation, |_, shared| {
                    shared.set_state(ConnectionState::Disconnected)
                });
                return Err(e.context(format!("handshake with {peer} failed")));
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let installed = self.shared.if_current(generation, |status, shared| {
            status.outbound = Some(out_tx);
            shared.set_state(ConnectionState::Connected);
        });
        if !installed {
            anyhow::bail!("connection to {peer} superseded");
        }
        info!(%peer, "Connected");

        let task = LinkTask {
            connector: self.connector.clone(),
            policy: self.policy,
            ping_interval: self.ping_interval,
            max_frame: self.max_frame,
            shared: self.shared.clone(),
            inbound: self.inbound_tx.clone(),
            generation,
        };
        self.link = Some(tokio::spawn(task.run(stream, out_rx)));
        Ok(())
    }

    /// Closes the connection and suppresses any further automatic reconnection.
    pub fn disconnect(&mut self) {
        {
            let mut status = self.shared.lock();
            status.generation += 1;
            status.attempts = self.policy.max_attempts;
            status.outbound = None;
            self.shared.set_state(ConnectionState::Disconnected);
        }
        self.stop_link();
        info!("Disconnected");
    }

    fn stop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.abort();
        }
    }

    /// Waits for the next inbound envelope and runs its subscribers.
    ///
    /// Cancel safe.
    pub async fn next_message(&mut self) -> Option<Envelope> {
        let env = self.inbound_rx.recv().await?;
        self.handlers.dispatch(&env);
        Some(env)
    }

    /// Non-blocking variant of [`Self::next_message`].
    pub fn try_next_message(&mut self) -> Option<Envelope> {
        let env = self.inbound_rx.try_recv().ok()?;
        self.handlers.dispatch(&env);
        Some(env)
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.stop_link();
    }
}

enum LinkEnd {
    /// Peer closed or the stream failed; reconnect.
    Lost(String),
    /// The client side is gone; stop quietly.
    Abandoned,
}

struct LinkTask {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    ping_interval: Duration,
    max_frame: usize,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Envelope>,
    generation: u64,
}

impl LinkTask {
    async fn run(self, mut stream: BoxedStream, mut outbound: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            match self.serve(stream, &mut outbound).await {
                LinkEnd::Abandoned => return,
                LinkEnd::Lost(reason) => {
                    warn!(%reason, "Connection lost");
                    if !self.shared.if_current(self.generation, |_, shared| {
                        shared.set_state(ConnectionState::Disconnected)
                    }) {
                        return;
                    }
                }
            }

            stream = match self.reconnect().await {
                Some(stream) => stream,
                None => return,
            };

            // Anything queued against the dead connection is stale.
            while outbound.try_recv().is_ok() {}
            let resumed = self.shared.if_current(self.generation, |status, shared| {
                status.attempts = 0;
                shared.set_state(ConnectionState::Connected);
            });
            if !resumed {
                return;
            }
            info!(peer = %self.connector.peer(), "Reconnected");
        }
    }

    /// Backoff loop. `None` when attempts are exhausted or the link was superseded.
    async fn reconnect(&self) -> Option<BoxedStream> {
        loop {
            let mut next = None;
            let current = self.shared.if_current(self.generation, |status, shared| {
                if status.attempts >= self.policy.max_attempts {
                    return;
                }
                status.attempts += 1;
                next = Some(status.attempts);
                shared.set_state(ConnectionState::Reconnecting);
            });
            if !current {
                return None;
            }
            let Some(attempt) = next else {
                self.give_up();
                return None;
            };

            let delay = self.policy.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            time::sleep(delay).await;

            if !self.shared.if_current(self.generation, |_, shared| {
                shared.set_state(ConnectionState::Connecting)
            }) {
                return None;
            }
            match self.connector.open().await {
                Ok(stream) => return Some(stream),
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    fn give_up(&self) {
        self.shared.if_current(self.generation, |status, shared| {
            status.outbound = None;
            shared.set_state(ConnectionState::Disconnected);
            warn!(attempts = status.attempts, "Reconnect attempts exhausted");
            let failed = ServerMessage::ConnectionFailed {};
            match failed.to_envelope() {
                Ok(env) => {
                    let _ = self.inbound.send(env);
                }
                Err(e) => warn!(error = %e, "Failed to build connection_failed"),
            }
        });
    }

    async fn serve(
        &self,
        stream: BoxedStream,
        outbound: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> LinkEnd {
        let (r, w) = tokio::io::split(stream);
        let mut reader = FrameReader::new(r, self.max_frame);
        let mut writer = FrameWriter::new(w, self.max_frame);
        let mut ping = time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = reader.read_frame() => match frame {
                    Ok(Some(bytes)) => match Envelope::decode(&bytes) {
                        Ok(env) => {
                            trace!(kind = %env.kind, "Inbound");
                            if self.inbound.send(env).is_err() {
                                return LinkEnd::Abandoned;
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed frame"),
                    },
                    Ok(None) => return LinkEnd::Lost("closed by peer".to_string()),
                    Err(e) => return LinkEnd::Lost(format!("{e:#}")),
                },
                msg = outbound.recv() => match msg {
                    Some(env) => {
                        if let Err(e) = writer.send(&env).await {
                            return LinkEnd::Lost(format!("{e:#}"));
                        }
                    }
                    None => return LinkEnd::Abandoned,
                },
                _ = ping.tick() => {
                    let keepalive = ClientMessage::Ping { timestamp: now_millis() };
                    if let Err(e) = writer.send(&keepalive).await {
                        return LinkEnd::Lost(format!("{e:#}"));
                    }
                    trace!("Keepalive ping sent");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    use serpent_shared::net::{FramedConn, DEFAULT_MAX_FRAME_BYTES};
    use tokio::io::DuplexStream;

    /// Hands out in-memory pipes queued by the test; fails when none are queued.
    #[derive(Clone, Default)]
    pub(crate) struct PipeConnector {
        streams: Arc<Mutex<VecDeque<DuplexStream>>>,
        opens: Arc<Mutex<Vec<Instant>>>,
    }

    impl PipeConnector {
        /// Queues a pipe and returns the server end.
        pub(crate) fn pipe(&self) -> FramedConn<DuplexStream> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.streams.lock().unwrap().push_back(client);
            FramedConn::new(server, DEFAULT_MAX_FRAME_BYTES)
        }

        pub(crate) fn opens(&self) -> Vec<Instant> {
            self.opens.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn open(&self) -> anyhow::Result<BoxedStream> {
            self.opens.lock().unwrap().push(Instant::now());
            match self.streams.lock().unwrap().pop_front() {
                Some(stream) => Ok(Box::new(stream)),
                None => anyhow::bail!("connection refused"),
            }
        }

        fn peer(&self) -> String {
            "pipe".to_string()
        }
    }

    pub(crate) fn transport(connector: &PipeConnector) -> TransportClient {
        TransportClient::new(
            connector.clone(),
            ReconnectPolicy::default(),
            Duration::from_secs(30),
            DEFAULT_MAX_FRAME_BYTES,
        )
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (1..=5).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_send_and_receive() -> anyhow::Result<()> {
        let connector = PipeConnector::default();
        let mut server = connector.pipe();
        let mut client = transport(&connector);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        client.on("*", move |env: &Envelope| {
            s.lock().unwrap().push(env.kind.clone());
            Ok(())
        });

        client.connect().await?;
        assert_eq!(client.state(), ConnectionState::Connected);
        // Idempotent.
        client.connect().await?;
        assert_eq!(connector.opens().len(), 1);

        client.send(&ClientMessage::Matchmaking {
            player_name: "ana".into(),
        });
        let got = server.recv().await?.expect("frame");
        assert_eq!(
            ClientMessage::from_envelope(&got)?,
            ClientMessage::Matchmaking {
                player_name: "ana".into()
            }
        );

        server
            .send(&ServerMessage::RoomError {
                message: "full".into(),
            })
            .await?;
        let env = client.next_message().await.expect("inbound");
        assert_eq!(env.kind, "room_error");
        assert_eq!(*seen.lock().unwrap(), vec!["room_error"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sends_while_disconnected_are_dropped() -> anyhow::Result<()> {
        let connector = PipeConnector::default();
        let mut server = connector.pipe();
        let mut client = transport(&connector);

        client.send(&ClientMessage::CancelMatchmaking {});
        client.connect().await?;
        client.send(&ClientMessage::Ping { timestamp: 1 });

        let first = server.recv().await?.expect("frame");
        assert_eq!(ClientMessage::from_envelope(&first)?, ClientMessage::Ping { timestamp: 1 });
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_ping_every_interval() -> anyhow::Result<()> {
        let connector = PipeConnector::default();
        let mut server = connector.pipe();
        let mut client = transport(&connector);
        let started = Instant::now();
        client.connect().await?;

        let ping = server.recv().await?.expect("ping");
        assert_eq!(ping.kind, "ping");
        assert!(Instant::now() - started >= Duration::from_secs(30));
        let ping = server.recv().await?.expect("ping");
        assert_eq!(ping.kind, "ping");
        assert!(Instant::now() - started >= Duration::from_secs(60));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped_without_closing() -> anyhow::Result<()> {
        let connector = PipeConnector::default();
        let mut server = connector.pipe();
        let mut client = transport(&connector);
        client.connect().await?;

        server.writer.write_frame(b"{not an envelope").await?;
        server.send(&ServerMessage::GameOver {}).await?;

        let env = client.next_message().await.expect("inbound");
        assert_eq!(env.kind, "game_over");
        assert_eq!(client.state(), ConnectionState::Connected);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn initial_handshake_failure_is_reported_and_not_retried() {
        let connector = PipeConnector::default();
        let mut client = transport(&connector);

        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.opens().len(), 1);
        assert!(client.try_next_message().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_then_connection_failed_once() -> anyhow::Result<()> {
        let connector = PipeConnector::default();
        let server = connector.pipe();
        let mut client = transport(&connector);
        let mut states = client.watch_state();
        client.connect().await?;

        drop(server);
        states
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await?;

        let env = client.next_message().await.expect("connection_failed");
        assert_eq!(env.kind, ServerMessage::CONNECTION_FAILED);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let opens = connector.opens();
        assert_eq!(opens.len(), 6, "initial connect plus five attempts");
        let gaps: Vec<u128> = opens.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        for (gap, expected) in gaps.iter().zip([1000u128, 2000, 4000, 8000, 16000]) {
            assert!(gap.abs_diff(expected) <= 1, "gap {gap} != {expected}");
        }

        time::sleep(Duration::from_secs(300)).await;
        assert_eq!(connector.opens().len(), 6);
        assert!(client.try_next_message().is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_succeeds_and_resets_attempts() -> anyhow::Result<()> {
        let connector = PipeConnector::default();
        let first = connector.pipe();
        let mut client = transport(&connector);
        let mut states = client.watch_state();
        client.connect().await?;

        let mut second = connector.pipe();
        drop(first);
        states
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await?;
        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await?;
        assert_eq!(client.reconnect_attempts(), 0);

        client.send(&ClientMessage::CancelMatchmaking {});
        let got = second.recv().await?.expect("frame");
        assert_eq!(got.kind, "cancel_matchmaking");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_suppresses_reconnection() -> anyhow::Result<()> {
        let connector = PipeConnector::default();
        let _server = connector.pipe();
        let mut client = transport(&connector);
        client.connect().await?;

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.reconnect_attempts(), 5);

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.opens().len(), 1);
        assert!(client.try_next_message().is_none());
        Ok(())
    }
}
