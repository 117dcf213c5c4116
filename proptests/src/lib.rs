//! Property-based tests for the Meshvault core algorithms.
//!
//! Organized by subject:
//! - [`crypto`]: round-trip and length invariants of the streaming cipher
//! - [`framing`]: frame codec round trips and rejection behavior
//! - [`paths`]: CAS path derivation shape and determinism

pub mod strategies;

mod crypto;
mod framing;
mod paths;

/// Drives an async test body to completion on a throwaway current-thread
/// runtime. The cipher and codec APIs are async but purely in-memory here,
/// so no I/O driver is ever awaited on.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building test runtime")
        .block_on(future)
}
