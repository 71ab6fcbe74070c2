//! Test support: a scripted loopback server.
//!
//! The real game server lives elsewhere. Tests drive this one by hand,
//! reading what the client sends and replying with canned server messages.

use std::time::Duration;

use anyhow::{bail, Context};
use serpent_client::MatchSession;
use serpent_shared::{
    config::ClientConfig,
    net::{ClientMessage, Envelope, FramedConn, ServerMessage, DEFAULT_MAX_FRAME_BYTES},
};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// How long any single expectation may take.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

pub struct ScriptedServer {
    listener: TcpListener,
}

/// Binds on an ephemeral port and returns a client config pointing at it.
pub async fn bind_ephemeral() -> anyhow::Result<(ScriptedServer, ClientConfig)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind scripted server")?;
    let addr = listener.local_addr().context("local_addr")?;
    let cfg = ClientConfig {
        server_addr: addr.to_string(),
        player_name: "tester".to_string(),
        ..ClientConfig::default()
    };
    Ok((ScriptedServer { listener }, cfg))
}

impl ScriptedServer {
    pub async fn accept_one(&self) -> anyhow::Result<ServerConn> {
        let (stream, peer) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .context("timed out waiting for a client")?
            .context("accept")?;
        debug!(%peer, "Scripted server accepted client");
        Ok(ServerConn {
            conn: FramedConn::new(stream, DEFAULT_MAX_FRAME_BYTES),
        })
    }
}

/// Server side of one client connection.
pub struct ServerConn {
    conn: FramedConn<TcpStream>,
}

impl ServerConn {
    pub async fn send(&mut self, msg: &ServerMessage) -> anyhow::Result<()> {
        self.conn.send(msg).await
    }

    /// Next client message, skipping keepalive pings.
    pub async fn recv(&mut self) -> anyhow::Result<ClientMessage> {
        loop {
            let env = tokio::time::timeout(STEP_TIMEOUT, self.conn.recv())
                .await
                .context("timed out waiting for a client message")??;
            let Some(env) = env else {
                bail!("client closed the connection");
            };
            let msg = ClientMessage::from_envelope(&env)?;
            if !matches!(msg, ClientMessage::Ping { .. }) {
                return Ok(msg);
            }
        }
    }
}

/// Waits for one inbound envelope and lets the session handle it.
pub async fn pump(session: &mut MatchSession) -> anyhow::Result<Envelope> {
    let env = tokio::time::timeout(STEP_TIMEOUT, session.transport_mut().next_message())
        .await
        .context("timed out waiting for a server message")?
        .context("inbound channel closed")?;
    session.handle_envelope(&env);
    Ok(env)
}
