#![allow(unused_doc_comments)]
/**
 * Block comments are used as file banners; this keeps the compiler
 * quiet about the ones that do not document an item.
 */

/**
 * lib.rs
 */

pub mod alloc;
pub mod backends;
pub mod config;
pub mod friends;
pub mod message;
pub mod orchestrator;
pub mod state;

pub use config::Config;
pub use friends::{Friend, FriendDirectory};
pub use message::{Message, MessageKind};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use state::{PeerState, Phase};
