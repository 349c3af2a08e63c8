//! OpenClaw relay: bridges Feishu events to agent clients over a pair of
//! WebSocket pools, with store-and-forward for either side being offline.

pub mod api;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod signer;
pub mod store;
pub mod token_cache;
pub mod webhook;
pub mod ws_agent;
pub mod ws_platform;

pub use api::FeishuApi;
pub use engine::{AuthOutcome, RelayEngine};
pub use error::{RelayError, Result};
pub use signer::CredentialSigner;
pub use store::{MemoryStore, RelayStore};
pub use token_cache::TokenCache;
