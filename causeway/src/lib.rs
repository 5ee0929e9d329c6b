//! Causeway: a multiplexed TCP tunnel over a single HTTP upgrade connection.
//!
//! The client opens one authenticated upgrade connection to the server and
//! fans local TCP connections out over it as mux streams; the server
//! terminates those streams either as an HTTP CONNECT proxy or as a raw
//! relay to a fixed upstream.

pub mod client;
pub mod connect;
pub mod server;
pub mod shutdown;

pub use client::{ClientConfig, TunnelClient};
pub use server::{Server, ServerConfig, ServerMode};
