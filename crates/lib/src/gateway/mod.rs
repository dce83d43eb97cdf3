//! Gateway: wires channels, the bus and the executor, and owns their lifecycle.
//!
//! Two loops run while the gateway is up. The executor loop takes inbound messages one at a
//! time and runs them through the executor. The dispatcher takes outbound messages and hands
//! each to the channel named in it. The gateway never looks at message content.

mod server;

pub use server::{shutdown_signal, Gateway};
