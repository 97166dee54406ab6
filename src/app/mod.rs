//! Binary-local application wiring.
//!
//! `main.rs` only parses arguments; this module loads config, opens the
//! state store, builds the relay and dispatches subcommands.

pub(crate) mod approval;
pub(crate) mod commands;
pub(crate) mod entry;
pub(crate) mod observer;
pub(crate) mod render;
pub(crate) mod run_mode;
