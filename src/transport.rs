//! Adds Azure AD bearer authorization to outgoing requests.

use std::sync::Arc;

use http::{header::AUTHORIZATION, Extensions, HeaderValue};
use reqwest::{Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    azure::auth::{
        self,
        token_provider::{self, TokenProvider},
    },
    config::{self, AzureAdConfig},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("access token: {0}")]
    Token(#[from] token_provider::Error),
    #[error("access token is not a valid header value")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
}

/// Middleware setting `Authorization: Bearer <token>` on every request it
/// passes on. A request for which no token can be had is never sent.
///
/// A [`CancellationToken`] in the request extensions stops the wait for a
/// token when it fires.
#[derive(Debug, Clone)]
pub struct AuthorizingMiddleware {
    provider: Arc<TokenProvider>,
}

impl AuthorizingMiddleware {
    pub fn new(provider: Arc<TokenProvider>) -> Self {
        Self { provider }
    }

    /// `client` is used for the token exchanges only.
    pub fn from_config(
        config: &AzureAdConfig,
        client: reqwest::Client,
    ) -> Result<Self, config::Error> {
        let credential = auth::new_token_credential(config, client)?;
        let provider =
            TokenProvider::with_options(credential, config.scope(), config.refresh_options());
        Ok(Self::new(Arc::new(provider)))
    }

    pub fn provider(&self) -> &Arc<TokenProvider> {
        &self.provider
    }

    async fn authorization(&self, cancel: Option<CancellationToken>) -> Result<HeaderValue, Error> {
        let record = match cancel {
            Some(cancel) => self.provider.get_token_with_cancellation(&cancel).await?,
            None => self.provider.get_token().await?,
        };
        let mut value = HeaderValue::from_str(&format!("Bearer {}", record.access_token))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[async_trait::async_trait]
impl Middleware for AuthorizingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let cancel = extensions.get::<CancellationToken>().cloned();
        let authorization = self.authorization(cancel).await.map_err(|err| {
            warn!(
                message = "Not sending request without authorization",
                url = %req.url(),
                error = %err,
            );
            reqwest_middleware::Error::middleware(err)
        })?;

        req.headers_mut().insert(AUTHORIZATION, authorization);
        next.run(req, extensions).await
    }
}

/// Client whose requests carry Azure AD authorization for `config`.
///
/// `next` sends the authorized requests and also carries the token
/// exchanges; a plain `reqwest::Client` is used when it is `None`. Nothing is
/// returned if the configuration is invalid or the credential cannot be set
/// up.
pub fn new_azuread_client(
    config: &AzureAdConfig,
    next: Option<reqwest::Client>,
) -> Result<ClientWithMiddleware, config::Error> {
    let next = next.unwrap_or_default();
    let middleware = AuthorizingMiddleware::from_config(config, next.clone())?;
    Ok(ClientBuilder::new(next).with(middleware).build())
}
