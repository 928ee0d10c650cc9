//! OAuth credential lifecycle for the marketplace

pub mod credential;
pub mod manager;
pub mod monitor;
pub mod store;

pub use credential::{mask_token, Credential, CredentialState, OpClass};
pub use manager::{CredentialManager, RefreshCheck, TokenStatus};
pub use monitor::TokenMonitor;
pub use store::CredentialStore;
