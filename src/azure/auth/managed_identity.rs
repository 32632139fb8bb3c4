//! Authorize as the Azure resource the process runs on, through the instance
//! metadata service.

use serde::Deserialize;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::azure::utils::{check_status, scope_to_resource};

use super::{AccessToken, Error};

pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";

pub struct ManagedIdentity {
    pub client: reqwest::Client,
    pub endpoint: String,
    /// Set for a user-assigned identity, `None` for the system-assigned one.
    pub client_id: Option<String>,
}

impl ManagedIdentity {
    pub fn system_assigned(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: IMDS_ENDPOINT.to_owned(),
            client_id: None,
        }
    }

    pub fn user_assigned(client: reqwest::Client, client_id: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: IMDS_ENDPOINT.to_owned(),
            client_id: Some(client_id.into()),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub async fn perform(&self, scope: &str) -> Result<ImdsResponse, Error> {
        let mut query = vec![
            ("api-version", IMDS_API_VERSION),
            ("resource", scope_to_resource(scope)),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        debug!(
            message = "Requesting managed identity token",
            user_assigned = self.client_id.is_some(),
        );

        let req = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .header("Metadata", "true")
            .build()?;

        let res = self.client.execute(req).await?;
        let res = check_status(res).await?;
        let imds_response = res.json().await?;
        Ok(imds_response)
    }
}

#[derive(Debug, Deserialize)]
pub struct ImdsResponse {
    access_token: String,
    expires_in: ExpiresIn,
}

/// IMDS reports numbers as strings, some endpoints speaking its protocol do not.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> Result<u64, Error> {
        match self {
            ExpiresIn::Seconds(seconds) => Ok(*seconds),
            ExpiresIn::Text(text) => text.trim().parse().map_err(|_| {
                Error::InvalidResponse(format!("expires_in is not a number: {text:?}"))
            }),
        }
    }
}

impl TryFrom<ImdsResponse> for AccessToken {
    type Error = Error;

    fn try_from(response: ImdsResponse) -> Result<Self, Self::Error> {
        let ImdsResponse {
            access_token,
            expires_in,
        } = response;
        Ok(Self {
            access_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in.seconds()?),
        })
    }
}

#[async_trait::async_trait]
impl super::TokenCredential for ManagedIdentity {
    async fn get_auth_token(&self, scope: &str) -> Result<AccessToken, Error> {
        let response = self.perform(scope).await?;
        response.try_into()
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{header, method, query_param, query_param_is_missing},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::azure::auth::TokenCredential;

    #[tokio::test]
    async fn system_assigned_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("api-version", "2018-02-01"))
            .and(query_param("resource", "https://monitor.azure.com/"))
            .and(query_param_is_missing("client_id"))
            .and(header("Metadata", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "imds-token",
                "expires_in": "86399",
                "expires_on": "1506484173",
                "resource": "https://monitor.azure.com/",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let credential =
            ManagedIdentity::system_assigned(reqwest::Client::new()).with_endpoint(server.uri());
        let token = credential
            .get_auth_token("https://monitor.azure.com//.default")
            .await
            .unwrap();

        assert_eq!(token.access_token, "imds-token");
        assert!(token.expires_at > Instant::now() + Duration::from_secs(86000));
    }

    #[tokio::test]
    async fn user_assigned_identity_sends_client_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("client_id", "00000000-0000-0000-0000-000000000002"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "user-assigned-token",
                "expires_in": "3600"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let credential = ManagedIdentity::user_assigned(
            reqwest::Client::new(),
            "00000000-0000-0000-0000-000000000002",
        )
        .with_endpoint(server.uri());
        let token = credential.get_auth_token("api://x/.default").await.unwrap();
        assert_eq!(token.access_token, "user-assigned-token");
    }

    #[tokio::test]
    async fn numeric_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "numeric-expiry-token",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let credential =
            ManagedIdentity::system_assigned(reqwest::Client::new()).with_endpoint(server.uri());
        let token = credential.get_auth_token("api://x/.default").await.unwrap();
        assert_eq!(token.access_token, "numeric-expiry-token");
        assert!(token.expires_at > Instant::now() + Duration::from_secs(3500));
    }

    #[tokio::test]
    async fn malformed_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "t",
                "expires_in": "soon"
            })))
            .mount(&server)
            .await;

        let credential =
            ManagedIdentity::system_assigned(reqwest::Client::new()).with_endpoint(server.uri());
        let err = credential.get_auth_token("api://x/.default").await;
        assert!(matches!(err, Err(Error::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn identity_not_assigned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":"invalid_request","error_description":"Identity not found"}"#,
            ))
            .mount(&server)
            .await;

        let credential =
            ManagedIdentity::system_assigned(reqwest::Client::new()).with_endpoint(server.uri());
        let err = credential.get_auth_token("api://x/.default").await;
        assert!(matches!(err, Err(Error::Server(ref e)) if e.status_code == 400));
    }
}
