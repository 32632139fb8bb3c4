//! Azure AD clouds and credentials.

use serde::Deserialize;

pub mod auth;
mod utils;

pub use self::utils::ServerError;

/// Azure cloud the identity lives in.
///
/// Picks the login authority and the default audience of the ingestion
/// endpoint tokens are requested for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Cloud {
    #[default]
    AzurePublic,
    AzureChina,
    AzureGovernment,
}

impl Cloud {
    pub fn authority_host(self) -> &'static str {
        match self {
            Cloud::AzurePublic => "https://login.microsoftonline.com",
            Cloud::AzureChina => "https://login.chinacloudapi.cn",
            Cloud::AzureGovernment => "https://login.microsoftonline.us",
        }
    }

    pub fn default_scope(self) -> &'static str {
        match self {
            Cloud::AzurePublic => "https://monitor.azure.com//.default",
            Cloud::AzureChina => "https://monitor.azure.cn//.default",
            Cloud::AzureGovernment => "https://monitor.azure.us//.default",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_from_config_name() {
        let cloud: Cloud = serde_json::from_str("\"AzureGovernment\"").unwrap();
        assert_eq!(cloud, Cloud::AzureGovernment);
        assert_eq!(cloud.authority_host(), "https://login.microsoftonline.us");
        assert_eq!(Cloud::default(), Cloud::AzurePublic);
    }

    #[test]
    fn unknown_cloud_is_rejected() {
        assert!(serde_json::from_str::<Cloud>("\"AzureMars\"").is_err());
    }
}
