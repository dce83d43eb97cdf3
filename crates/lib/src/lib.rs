//! Caduceus core library: message bus, identity store, channels, the filesystem order bridge
//! and the gateway that wires them together. Used by the `caduceus` CLI.

pub mod bus;
pub mod channels;
pub mod config;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod identity;
pub mod init;
pub mod session;
