//! Client and server connection orchestration.
//!
//! Bootstraps compose the pieces below them (socket connect/listen,
//! channel construction on a group loop, socket handler, optional TLS
//! handler) into a ready pipeline, reporting progress exclusively
//! through callbacks on the channel's loop thread.

mod client;
mod server;

pub use self::client::{ClientBootstrap, ClientConnectionOptions, ClientSetup};
pub use self::server::{Listener, ServerBootstrap, ServerListenerOptions};
