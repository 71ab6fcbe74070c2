//! Console command parsing.
//!
//! Commands:
//!   connect                 - Connect to the configured server
//!   create [name] [max]     - Create a room
//!   join <room> [name]      - Join a room by id
//!   match [name]            - Enter matchmaking
//!   cancel                  - Leave matchmaking
//!   ready                   - Mark yourself ready
//!   leave                   - Leave the room
//!   up|down|left|right, w|a|s|d
//!   status                  - Show session status
//!   disconnect              - Disconnect from the server
//!   quit                    - Exit

use anyhow::bail;
use serpent_shared::math::Direction;

use crate::room::DEFAULT_MAX_PLAYERS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Create {
        name: Option<String>,
        max_players: u32,
    },
    Join {
        room_id: String,
        name: Option<String>,
    },
    Match {
        name: Option<String>,
    },
    Cancel,
    Ready,
    Leave,
    Steer(Direction),
    Status,
    Disconnect,
    Quit,
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&head, args)) = tokens.split_first() else {
            bail!("empty command");
        };
        let arg = |i: usize| args.get(i).map(|s| s.to_string());

        let cmd = match head.to_ascii_lowercase().as_str() {
            "connect" => ConsoleCommand::Connect,
            "create" => {
                // A lone numeric argument is the capacity.
                let (name, max) = match args {
                    [n] if n.parse::<u32>().is_ok() => (None, Some(*n)),
                    _ => (arg(0), args.get(1).copied()),
                };
                let max_players = match max {
                    Some(m) => m
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Usage: create [name] [max_players]"))?,
                    None => DEFAULT_MAX_PLAYERS,
                };
                ConsoleCommand::Create { name, max_players }
            }
            "join" => match arg(0) {
                Some(room_id) => ConsoleCommand::Join {
                    room_id,
                    name: arg(1),
                },
                None => bail!("Usage: join <room_id> [name]"),
            },
            "match" => ConsoleCommand::Match { name: arg(0) },
            "cancel" => ConsoleCommand::Cancel,
            "ready" => ConsoleCommand::Ready,
            "leave" => ConsoleCommand::Leave,
            "up" | "w" => ConsoleCommand::Steer(Direction::Up),
            "down" | "s" => ConsoleCommand::Steer(Direction::Down),
            "left" | "a" => ConsoleCommand::Steer(Direction::Left),
            "right" | "d" => ConsoleCommand::Steer(Direction::Right),
            "status" => ConsoleCommand::Status,
            "disconnect" => ConsoleCommand::Disconnect,
            "quit" | "exit" => ConsoleCommand::Quit,
            "help" | "?" => ConsoleCommand::Help,
            other => bail!("Unknown command: {other}"),
        };
        Ok(cmd)
    }
}

pub const HELP: &[&str] = &[
    "connect | create [name] [max] | join <room> [name] | match [name]",
    "cancel | ready | leave | status | disconnect | quit",
    "steer with up/down/left/right or w/a/s/d",
];
