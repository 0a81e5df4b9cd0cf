//! WebSocket broadcast relay.
//!
//! Every message a peer sends on `/ws` is forwarded, unchanged, to every
//! other connected peer. A static asset directory is served alongside the
//! relay endpoint.
//!
//! - [`relay`] owns the connection registry and does the fan-out.
//! - [`server`] is the axum front end that maps socket events onto the relay.
//! - [`cli`] parses the command line for `serve` and `client` modes.
//! - [`client`] is a small terminal client for poking at a running relay.

pub mod cli;
pub mod client;
pub mod relay;
pub mod server;
