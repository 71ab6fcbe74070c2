//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p serpent_client -- [--addr 127.0.0.1:40000] [--name ana] [--config client.json] [--wrap]
//!
//! Connects to the server, then reads console commands from stdin and draws
//! the board as text whenever it changes. Type `help` for commands.

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use serpent_client::{ascii::AsciiSurface, console::ConsoleCommand, MatchSession};
use serpent_shared::{
    config::{Boundary, ClientConfig},
    math::{Direction, Vec2},
    net::ConsumableState,
    render::{Banner, Color, RenderSurface, ScoreLine},
};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ClientConfig> {
    let args: Vec<String> = env::args().collect();

    // The config file is the base; flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text =
                std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
            ClientConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?
        }
        _ => ClientConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--config" => i += 2,
            "--wrap" => {
                cfg.boundary = Boundary::Wrap;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

/// Prints the text frame when it differs from the previous one.
struct TerminalSurface {
    inner: AsciiSurface,
    shown: String,
}

impl RenderSurface for TerminalSurface {
    fn begin_frame(&mut self, grid_width: i32, grid_height: i32) {
        self.inner.begin_frame(grid_width, grid_height);
    }

    fn draw_grid(&mut self) {
        self.inner.draw_grid();
    }

    fn draw_consumable(&mut self, consumable: &ConsumableState) {
        self.inner.draw_consumable(consumable);
    }

    fn draw_entity(&mut self, body: &[Vec2], color: Color, local: bool) {
        self.inner.draw_entity(body, color, local);
    }

    fn draw_scoreboard(&mut self, lines: &[ScoreLine]) {
        self.inner.draw_scoreboard(lines);
    }

    fn draw_banner(&mut self, banner: Banner) {
        self.inner.draw_banner(banner);
    }

    fn draw_final_ranking(&mut self, ranking: &[ScoreLine]) {
        self.inner.draw_final_ranking(ranking);
    }

    fn end_frame(&mut self) {
        self.inner.end_frame();
        if self.inner.frame() != self.shown {
            self.shown = self.inner.frame().to_string();
            println!("\n{}", self.shown);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, boundary = ?cfg.boundary, "Starting client");

    let mut session = MatchSession::from_config(cfg);
    session.connect().await.context("connect")?;

    let (intent_tx, intent_rx) = mpsc::channel::<Direction>(32);
    let (console_tx, console_rx) = mpsc::channel::<ConsoleCommand>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let sent = match ConsoleCommand::parse(line) {
                Ok(ConsoleCommand::Steer(direction)) => intent_tx.blocking_send(direction).is_ok(),
                Ok(cmd) => console_tx.blocking_send(cmd).is_ok(),
                Err(e) => {
                    println!("{e}");
                    true
                }
            };
            if !sent {
                break;
            }
        }
    });

    println!("Client connected. Type 'help' for commands, 'quit' to exit.");
    println!();

    let mut surface = TerminalSurface {
        inner: AsciiSurface::new(),
        shown: String::new(),
    };
    session
        .run(intent_rx, console_rx, &mut surface, |line| println!("{line}"))
        .await;

    info!("Client stopped");
    Ok(())
}
