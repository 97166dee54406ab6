//! agentrelay: drive a coding-agent CLI on local or remote machines.
//!
//! The relay starts the agent backend as a child process (directly or over
//! ssh), normalizes its event stream, applies an approval policy to the
//! commands it wants to run, and keeps one conversation's thread, machine
//! and pending approvals in a small state store.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use agentrelay::config::load_config;
//! use agentrelay::ids::ConversationId;
//! use agentrelay::orchestrator::{Orchestrator, TurnObserver};
//! use agentrelay::store::MemoryStore;
//!
//! # async fn example(observer: Arc<dyn TurnObserver>) {
//! let config = load_config(None).unwrap();
//! let relay = Orchestrator::from_config(config, Arc::new(MemoryStore::new()));
//! let outcome = relay
//!     .start_turn(&ConversationId::new("demo"), "Run the tests", observer)
//!     .await
//!     .unwrap();
//! println!("{outcome:?}");
//! # }
//! ```

pub mod approval;
pub mod build_info;
pub mod command_tokens;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod ids;
pub mod logging;
pub mod machine;
pub mod orchestrator;
pub mod rpc;
pub mod session;
pub mod store;
#[cfg(test)]
pub mod testsupport;
pub mod textutil;
