//! Azure AD bearer authorization for `reqwest` clients.
//!
//! [`new_azuread_client`] turns an [`AzureAdConfig`] into a client whose
//! requests carry `Authorization: Bearer <token>`. Tokens come from a
//! [`TokenProvider`](azure::auth::token_provider::TokenProvider) that caches
//! them and refreshes them before they expire.

pub mod azure;
pub mod config;
pub mod transport;

pub use config::AzureAdConfig;
pub use transport::{new_azuread_client, AuthorizingMiddleware};
