//! Credential persistence and OAuth lifecycle management.
//!
//! [`CredentialStore`] owns the on-disk layout: one JSON file per OAuth
//! provider plus a table of API keys entered interactively. [`OAuthManager`]
//! sits on top of it and hands out valid access tokens, refreshing them
//! when they are about to expire.

#[macro_use]
extern crate tracing;

mod credential;
mod error;
mod exchange;
mod oauth;
mod store;

pub use credential::Credential;
pub use error::AuthError;
pub use exchange::{
    DeviceAuthorization, HttpTokenExchange, OAuthClientConfig, TokenExchange,
    TokenPoll, TokenResponse,
};
pub use oauth::{AuthState, OAuthManager, OAuthManagerBuilder};
pub use store::CredentialStore;
