//! Authorize using the client credentials flow.

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::azure::utils::check_status;

use super::{certificate::ClientCertificate, AccessToken, Error};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// How the application proves who it is to the token endpoint.
pub enum ClientAuth {
    Secret(SecretString),
    Certificate(ClientCertificate),
    /// Workload identity: a federated token projected into a file that is
    /// rotated underneath us, so it is read again for every exchange.
    FederatedTokenFile(PathBuf),
}

impl ClientAuth {
    fn kind(&self) -> &'static str {
        match self {
            ClientAuth::Secret(_) => "client_secret",
            ClientAuth::Certificate(_) => "client_certificate",
            ClientAuth::FederatedTokenFile(_) => "workload_identity",
        }
    }
}

pub struct ClientCredentials {
    pub client: reqwest::Client,
    pub authority_host: String,
    pub tenant_id: String,
    pub client_id: String,
    pub auth: ClientAuth,
}

impl ClientCredentials {
    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    async fn federated_token(path: &Path) -> Result<String, Error> {
        let token = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Error::FederatedToken {
                path: path.to_owned(),
                source,
            })?;
        Ok(token.trim().to_owned())
    }

    /// Perform the client credentials flow.
    pub async fn perform(&self, scope: &str) -> Result<AuthResponse, Error> {
        let url = self.token_url();

        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("scope", scope),
        ];
        let assertion;
        match &self.auth {
            ClientAuth::Secret(secret) => {
                params.push(("client_secret", secret.expose_secret()));
            }
            ClientAuth::Certificate(certificate) => {
                assertion = certificate.assertion(&self.client_id, &url)?;
                params.push(("client_assertion_type", CLIENT_ASSERTION_TYPE));
                params.push(("client_assertion", assertion.as_str()));
            }
            ClientAuth::FederatedTokenFile(path) => {
                assertion = Self::federated_token(path).await?;
                params.push(("client_assertion_type", CLIENT_ASSERTION_TYPE));
                params.push(("client_assertion", assertion.as_str()));
            }
        }
        let params = serde_urlencoded::to_string(&params)?;

        debug!(
            message = "Requesting token",
            token_url = %url,
            client_auth = self.auth.kind(),
        );

        let req = self
            .client
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(params)
            .build()?;

        let res = self.client.execute(req).await?;
        let res = check_status(res).await?;
        let login_response = res.json().await?;
        Ok(login_response)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    /// The requested access token.
    /// The app can use this token to authenticate to the secured resource, such as to a web API.
    access_token: String,
    /// The amount of time that an access token is valid (in seconds).
    expires_in: u64,
}

impl From<AuthResponse> for AccessToken {
    fn from(auth: AuthResponse) -> Self {
        let AuthResponse {
            access_token,
            expires_in,
        } = auth;
        let expires_in = Duration::from_secs(expires_in);
        let expires_at = Instant::now() + expires_in;
        Self {
            access_token,
            expires_at,
        }
    }
}

#[async_trait::async_trait]
impl super::TokenCredential for ClientCredentials {
    async fn get_auth_token(&self, scope: &str) -> Result<AccessToken, Error> {
        let auth_response = self.perform(scope).await?;
        let token = auth_response.into();
        Ok(token)
    }
}
