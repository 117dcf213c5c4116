//! Meshvault storage node library.
//!
//! The binary in `main.rs` is a thin CLI over these modules; integration
//! tests drive the same [`server::FileServer`] API the CLI uses.

pub mod config;
pub mod constants;
pub mod db;
pub mod helpers;
pub(crate) mod peer_exchange;
pub mod server;
pub mod store;
pub mod transport;
