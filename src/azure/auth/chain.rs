//! Try a list of credentials in order, the way the Azure SDKs' default
//! credential discovers what the environment offers.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tracing::{debug, warn};

use super::{
    client_credentials::{ClientAuth, ClientCredentials},
    managed_identity::ManagedIdentity,
    AccessToken, Error, TokenCredential,
};

pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const AZURE_FEDERATED_TOKEN_FILE: &str = "AZURE_FEDERATED_TOKEN_FILE";

pub struct ChainedCredential {
    sources: Vec<(String, Arc<dyn TokenCredential>)>,
    /// Index of the source that last produced a token; later calls start there.
    selected: AtomicUsize,
}

impl ChainedCredential {
    pub fn new(sources: Vec<(String, Arc<dyn TokenCredential>)>) -> Self {
        Self {
            sources,
            selected: AtomicUsize::new(0),
        }
    }

    /// Environment secret, then workload identity, then managed identity.
    ///
    /// `tenant_id` wins over `AZURE_TENANT_ID`. Sources whose variables are
    /// missing are left out; managed identity is always tried last.
    pub fn from_env(
        client: reqwest::Client,
        authority_host: String,
        tenant_id: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let client_id = lookup(AZURE_CLIENT_ID);
        let tenant_id = tenant_id.map(str::to_owned).or_else(|| lookup(AZURE_TENANT_ID));

        let mut sources: Vec<(String, Arc<dyn TokenCredential>)> = Vec::new();

        if let (Some(client_id), Some(tenant_id), Some(secret)) =
            (&client_id, &tenant_id, lookup(AZURE_CLIENT_SECRET))
        {
            let credential = ClientCredentials {
                client: client.clone(),
                authority_host: authority_host.clone(),
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                auth: ClientAuth::Secret(secret.into()),
            };
            sources.push(("environment".to_owned(), Arc::new(credential)));
        }

        if let (Some(client_id), Some(tenant_id), Some(token_file)) =
            (&client_id, &tenant_id, lookup(AZURE_FEDERATED_TOKEN_FILE))
        {
            let credential = ClientCredentials {
                client: client.clone(),
                authority_host,
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                auth: ClientAuth::FederatedTokenFile(PathBuf::from(token_file)),
            };
            sources.push(("workload identity".to_owned(), Arc::new(credential)));
        }

        let managed_identity = match client_id {
            Some(client_id) => ManagedIdentity::user_assigned(client, client_id),
            None => ManagedIdentity::system_assigned(client),
        };
        sources.push(("managed identity".to_owned(), Arc::new(managed_identity)));

        debug!(
            message = "Built credential chain",
            sources = ?sources.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
        );

        Self::new(sources)
    }

    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|(name, _)| name.as_str())
    }
}

#[async_trait::async_trait]
impl TokenCredential for ChainedCredential {
    async fn get_auth_token(&self, scope: &str) -> Result<AccessToken, Error> {
        let start = self.selected.load(Ordering::Relaxed);
        let order = (start..self.sources.len()).chain(0..start.min(self.sources.len()));

        let mut failures = Vec::new();
        for index in order {
            let (name, credential) = &self.sources[index];
            match credential.get_auth_token(scope).await {
                Ok(token) => {
                    if index != start {
                        debug!(message = "Credential chain switched source", source = %name);
                    }
                    self.selected.store(index, Ordering::Relaxed);
                    return Ok(token);
                }
                Err(err) => {
                    warn!(message = "Credential source failed", source = %name, error = %err);
                    failures.push((name.clone(), err));
                }
            }
        }

        Err(Error::Chain(failures))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::time::{Duration, Instant};

    use super::*;
    use crate::azure::ServerError;

    struct Fixed {
        token: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn ok(token: &'static str) -> Arc<Self> {
            Arc::new(Self {
                token: Some(token),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                token: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl TokenCredential for Fixed {
        async fn get_auth_token(&self, _scope: &str) -> Result<AccessToken, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.token {
                Some(token) => Ok(AccessToken {
                    access_token: token.to_owned(),
                    expires_at: Instant::now() + Duration::from_secs(3600),
                }),
                None => Err(Error::Server(ServerError {
                    status_code: 401,
                    body: "unauthorized".into(),
                })),
            }
        }
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn names(chain: &ChainedCredential) -> Vec<&str> {
        chain.source_names().collect()
    }

    #[tokio::test]
    async fn first_working_source_wins_and_sticks() {
        let broken = Fixed::failing();
        let working = Fixed::ok("second");
        let chain = ChainedCredential::new(vec![
            ("broken".into(), broken.clone() as Arc<dyn TokenCredential>),
            ("working".into(), working.clone() as Arc<dyn TokenCredential>),
        ]);

        let token = chain.get_auth_token("scope").await.unwrap();
        assert_eq!(token.access_token, "second");

        let token = chain.get_auth_token("scope").await.unwrap();
        assert_eq!(token.access_token, "second");

        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(working.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_failure() {
        let chain = ChainedCredential::new(vec![
            ("a".into(), Fixed::failing() as Arc<dyn TokenCredential>),
            ("b".into(), Fixed::failing() as Arc<dyn TokenCredential>),
        ]);

        match chain.get_auth_token("scope").await {
            Err(Error::Chain(failures)) => {
                let sources: Vec<_> = failures.iter().map(|(name, _)| name.as_str()).collect();
                assert_eq!(sources, ["a", "b"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_chain_fails() {
        let chain = ChainedCredential::new(Vec::new());
        assert!(matches!(
            chain.get_auth_token("scope").await,
            Err(Error::Chain(failures)) if failures.is_empty()
        ));
    }

    #[test]
    fn environment_with_secret_and_token_file() {
        let chain = ChainedCredential::from_env(
            reqwest::Client::new(),
            "https://login.microsoftonline.com".into(),
            None,
            env(&[
                (AZURE_CLIENT_ID, "id"),
                (AZURE_TENANT_ID, "tenant"),
                (AZURE_CLIENT_SECRET, "secret"),
                (AZURE_FEDERATED_TOKEN_FILE, "/var/run/secrets/azure/tokens/azure-identity-token"),
            ]),
        );
        assert_eq!(
            names(&chain),
            ["environment", "workload identity", "managed identity"]
        );
    }

    #[test]
    fn bare_environment_falls_back_to_managed_identity() {
        let chain = ChainedCredential::from_env(
            reqwest::Client::new(),
            "https://login.microsoftonline.com".into(),
            None,
            env(&[(AZURE_CLIENT_SECRET, "secret")]),
        );
        assert_eq!(names(&chain), ["managed identity"]);
    }

    #[test]
    fn configured_tenant_completes_the_environment() {
        let chain = ChainedCredential::from_env(
            reqwest::Client::new(),
            "https://login.microsoftonline.com".into(),
            Some("tenant-from-config"),
            env(&[(AZURE_CLIENT_ID, "id"), (AZURE_CLIENT_SECRET, "secret")]),
        );
        assert_eq!(names(&chain), ["environment", "managed identity"]);
    }
}
