//! Authorization logic.

use std::{path::PathBuf, sync::Arc};

use secrecy::ExposeSecret;
use tokio::time::Instant;

use crate::config::{self, AzureAdConfig};

use super::ServerError;

pub mod certificate;
pub mod chain;
pub mod client_credentials;
pub mod managed_identity;
pub mod token_provider;

/// Something that can trade itself for an access token valid for `scope`.
#[async_trait::async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_auth_token(&self, scope: &str) -> Result<AccessToken, Error>;
}

pub trait Token: Send {
    fn access_token(&self) -> &str;
}

pub trait ExpiringToken: Token {
    fn expires_at(&self) -> Instant;
}

/// A token as handed out by the identity endpoint.
#[derive(Clone)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: Instant,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Token for AccessToken {
    fn access_token(&self) -> &str {
        self.access_token.as_str()
    }
}

impl ExpiringToken for AccessToken {
    fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("server: {0}")]
    Server(#[from] ServerError),
    #[error("form encoding: {0}")]
    Encode(#[from] serde_urlencoded::ser::Error),
    #[error("client assertion: {0}")]
    Assertion(#[from] jsonwebtoken::errors::Error),
    #[error("federated token file {}: {source}", path.display())]
    FederatedToken {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
    #[error("no credential in the chain produced a token: {}", chain_summary(.0))]
    Chain(Vec<(String, Error)>),
}

fn chain_summary(failures: &[(String, Error)]) -> String {
    if failures.is_empty() {
        return "no credential sources configured".to_owned();
    }
    failures
        .iter()
        .map(|(source, err)| format!("{source}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Build the one credential `config` describes.
///
/// `client` carries the token requests themselves, so it must not be a client
/// that authorizes its own requests through the resulting credential.
pub fn new_token_credential(
    config: &AzureAdConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn TokenCredential>, config::Error> {
    config.validate()?;

    let authority_host = config.authority_host();

    if let Some(managed_identity) = &config.managed_identity {
        let credential = match &managed_identity.client_id {
            Some(client_id) => managed_identity::ManagedIdentity::user_assigned(client, client_id),
            None => managed_identity::ManagedIdentity::system_assigned(client),
        };
        return Ok(Arc::new(credential));
    }

    if let Some(oauth) = &config.oauth {
        let credential = client_credentials::ClientCredentials {
            client,
            authority_host,
            tenant_id: oauth.tenant_id.clone(),
            client_id: oauth.client_id.clone(),
            auth: client_credentials::ClientAuth::Secret(oauth.client_secret.clone()),
        };
        return Ok(Arc::new(credential));
    }

    if let Some(certificate_config) = &config.certificate {
        let certificate = match (
            &certificate_config.certificate_path,
            &certificate_config.certificate_pem,
        ) {
            (Some(path), _) => certificate::ClientCertificate::from_file(path)?,
            (None, Some(pem)) => certificate::ClientCertificate::from_pem(pem.expose_secret())?,
            (None, None) => return Err(config::Error::CertificateSource),
        };
        let credential = client_credentials::ClientCredentials {
            client,
            authority_host,
            tenant_id: certificate_config.tenant_id.clone(),
            client_id: certificate_config.client_id.clone(),
            auth: client_credentials::ClientAuth::Certificate(certificate),
        };
        return Ok(Arc::new(credential));
    }

    if let Some(sdk) = &config.sdk {
        let credential = chain::ChainedCredential::from_env(
            client,
            authority_host,
            sdk.tenant_id.as_deref(),
            |key| std::env::var(key).ok(),
        );
        return Ok(Arc::new(credential));
    }

    Err(config::Error::NoAuthMethod)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_debug_is_redacted() {
        let token = AccessToken {
            access_token: "very-secret".into(),
            expires_at: Instant::now(),
        };
        let printed = format!("{token:?}");
        assert!(!printed.contains("very-secret"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn chain_error_lists_every_source() {
        let err = Error::Chain(vec![
            ("environment".into(), Error::InvalidResponse("empty".into())),
            (
                "managed identity".into(),
                Error::Server(ServerError {
                    status_code: 400,
                    body: "no identity".into(),
                }),
            ),
        ]);
        let message = err.to_string();
        assert!(message.contains("environment: invalid token response: empty"));
        assert!(message.contains("managed identity: 400 status code: no identity"));
    }

    #[test]
    fn oauth_config_builds_a_credential() {
        let config: AzureAdConfig = serde_json::from_value(serde_json::json!({
            "oauth": {
                "client_id": "00000000-0000-0000-0000-000000000001",
                "client_secret": "secret",
                "tenant_id": "contoso.onmicrosoft.com"
            }
        }))
        .unwrap();
        assert!(new_token_credential(&config, reqwest::Client::new()).is_ok());
    }

    #[test]
    fn invalid_config_builds_nothing() {
        let config: AzureAdConfig = serde_json::from_value(serde_json::json!({
            "oauth": {
                "client_id": "not-a-uuid",
                "client_secret": "secret",
                "tenant_id": "contoso"
            }
        }))
        .unwrap();
        let err = new_token_credential(&config, reqwest::Client::new()).err();
        assert!(matches!(err, Some(config::Error::InvalidClientId { .. })));
    }
}
