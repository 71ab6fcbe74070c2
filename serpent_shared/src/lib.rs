//! `serpent_shared`
//!
//! Pieces shared by the client and by anything speaking its protocol.
//!
//! Design goals:
//! - One envelope shape on the wire, typed messages on top of it.
//! - Explicit, versionable serialization (JSON in length-prefixed frames).
//! - No `unsafe`.

pub mod config;
pub mod event;
pub mod math;
pub mod net;
pub mod render;
