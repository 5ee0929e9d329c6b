//! Core building blocks for the causeway tunnel.
//!
//! This crate provides everything shared between the tunnel client and
//! server: the byte pipe, the stream multiplexer session, the client side
//! of the HTTP upgrade handshake, and bearer token acquisition.

pub mod error;
pub mod mux;
pub mod pipe;
pub mod token;
pub mod upgrade;

pub use error::{Error, Result};
pub use mux::{MuxSession, MuxStream};
pub use pipe::pipe;
pub use token::TokenSource;
pub use upgrade::TunnelStream;
