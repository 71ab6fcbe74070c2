//! `serpent_client`
//!
//! Client-side systems:
//! - Transport with keepalive and exponential-backoff reconnection
//! - Room/matchmaking state machine
//! - Tick ingestion, input sequencing and interpolation
//! - Local prediction, reconciliation and the fixed-timestep match loop
//! - Console commands and a text render surface

pub mod ascii;
pub mod client;
pub mod console;
pub mod entity;
pub mod frame;
pub mod input;
pub mod interp;
pub mod room;
pub mod sync;
pub mod transport;

pub use client::{MatchSession, MatchState};
pub use transport::{ConnectionState, TransportClient};
