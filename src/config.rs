//! Azure AD authorization settings.

use std::{path::PathBuf, sync::LazyLock, time::Duration};

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::azure::{
    auth::{certificate::CertificateError, token_provider::RefreshOptions},
    Cloud,
};

static TENANT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-zA-Z\-.]+$").expect("tenant id pattern"));
static SCOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\s:/.\\\-]+$").expect("scope pattern"));

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("must provide an Azure Managed Identity, Azure OAuth, Azure client certificate or Azure SDK in the Azure AD config")]
    NoAuthMethod,
    #[error("only one of Azure Managed Identity, Azure OAuth, Azure client certificate or Azure SDK may be provided, got {0}")]
    MultipleAuthMethods(String),
    #[error("the provided {which} client_id {value:?} is not a valid UUID")]
    InvalidClientId { which: &'static str, value: String },
    #[error("the provided {which} tenant_id {value:?} is invalid")]
    InvalidTenantId { which: &'static str, value: String },
    #[error("the provided Azure OAuth client_secret is empty")]
    EmptyClientSecret,
    #[error("exactly one of certificate_path or certificate_pem must be provided")]
    CertificateSource,
    #[error("certificate: {0}")]
    Certificate(#[from] CertificateError),
    #[error("the provided scope {0:?} contains invalid characters")]
    InvalidScope(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagedIdentityConfig {
    /// Client id of a user-assigned identity; the system-assigned identity
    /// is used when absent.
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfig {
    pub client_id: String,
    pub tenant_id: String,
    /// PEM file holding the private key and the certificate.
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub certificate_pem: Option<SecretString>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SdkConfig {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureAdConfig {
    #[serde(default)]
    pub cloud: Cloud,
    #[serde(default)]
    pub managed_identity: Option<ManagedIdentityConfig>,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
    #[serde(default)]
    pub certificate: Option<CertificateConfig>,
    #[serde(default)]
    pub sdk: Option<SdkConfig>,
    /// Overrides the cloud's default audience.
    #[serde(default)]
    pub scope: Option<String>,
    /// Overrides the cloud's login host, e.g. for a private token endpoint.
    #[serde(default)]
    pub authority_host: Option<Url>,
    #[serde(default)]
    pub refresh_margin_secs: Option<u64>,
    #[serde(default)]
    pub exchange_timeout_secs: Option<u64>,
}

fn validate_client_id(which: &'static str, value: &str) -> Result<(), Error> {
    uuid::Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| Error::InvalidClientId {
            which,
            value: value.to_owned(),
        })
}

fn validate_tenant_id(which: &'static str, value: &str) -> Result<(), Error> {
    if TENANT_ID.is_match(value) {
        return Ok(());
    }
    Err(Error::InvalidTenantId {
        which,
        value: value.to_owned(),
    })
}

impl AzureAdConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let configured: Vec<&str> = [
            self.managed_identity.is_some().then_some("managed_identity"),
            self.oauth.is_some().then_some("oauth"),
            self.certificate.is_some().then_some("certificate"),
            self.sdk.is_some().then_some("sdk"),
        ]
        .into_iter()
        .flatten()
        .collect();

        match configured.len() {
            0 => return Err(Error::NoAuthMethod),
            1 => {}
            _ => return Err(Error::MultipleAuthMethods(configured.join(", "))),
        }

        if let Some(managed_identity) = &self.managed_identity {
            if let Some(client_id) = &managed_identity.client_id {
                validate_client_id("Azure Managed Identity", client_id)?;
            }
        }

        if let Some(oauth) = &self.oauth {
            validate_client_id("Azure OAuth", &oauth.client_id)?;
            if oauth.client_secret.expose_secret().is_empty() {
                return Err(Error::EmptyClientSecret);
            }
            validate_tenant_id("Azure OAuth", &oauth.tenant_id)?;
        }

        if let Some(certificate) = &self.certificate {
            validate_client_id("Azure client certificate", &certificate.client_id)?;
            validate_tenant_id("Azure client certificate", &certificate.tenant_id)?;
            if certificate.certificate_path.is_some() == certificate.certificate_pem.is_some() {
                return Err(Error::CertificateSource);
            }
        }

        if let Some(SdkConfig {
            tenant_id: Some(tenant_id),
        }) = &self.sdk
        {
            validate_tenant_id("Azure SDK", tenant_id)?;
        }

        if let Some(scope) = &self.scope {
            if !SCOPE.is_match(scope) {
                return Err(Error::InvalidScope(scope.clone()));
            }
        }

        if self.refresh_margin_secs == Some(0) {
            return Err(Error::ZeroDuration("refresh_margin_secs"));
        }
        if self.exchange_timeout_secs == Some(0) {
            return Err(Error::ZeroDuration("exchange_timeout_secs"));
        }

        Ok(())
    }

    pub fn scope(&self) -> &str {
        self.scope
            .as_deref()
            .unwrap_or_else(|| self.cloud.default_scope())
    }

    pub fn authority_host(&self) -> String {
        match &self.authority_host {
            Some(url) => url.as_str().trim_end_matches('/').to_owned(),
            None => self.cloud.authority_host().to_owned(),
        }
    }

    pub fn refresh_options(&self) -> RefreshOptions {
        let defaults = RefreshOptions::default();
        RefreshOptions {
            refresh_margin: self
                .refresh_margin_secs
                .map_or(defaults.refresh_margin, Duration::from_secs),
            exchange_timeout: self
                .exchange_timeout_secs
                .map_or(defaults.exchange_timeout, Duration::from_secs),
        }
    }
}
