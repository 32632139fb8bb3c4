//! Client certificate material and the signed assertion it produces.

use std::path::{Path, PathBuf};

use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// How long a client assertion is accepted by the token endpoint.
const ASSERTION_LIFETIME_SECS: i64 = 10 * 60;

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pem: {0}")]
    Pem(#[from] pem::PemError),
    #[error("no CERTIFICATE block in pem")]
    MissingCertificate,
    #[error("no private key block in pem")]
    MissingPrivateKey,
    #[error("private key: {0}")]
    Key(#[from] jsonwebtoken::errors::Error),
}

/// A parsed certificate: the key that signs assertions and the thumbprint
/// Azure AD uses to find the matching uploaded certificate.
pub struct ClientCertificate {
    key: EncodingKey,
    thumbprint: String,
}

impl std::fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    nbf: i64,
    iat: i64,
    exp: i64,
}

impl ClientCertificate {
    pub fn from_file(path: &Path) -> Result<Self, CertificateError> {
        let pem = std::fs::read_to_string(path).map_err(|source| CertificateError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_pem(&pem)
    }

    /// Parse a PEM bundle holding both the private key and the certificate.
    pub fn from_pem(pem_bundle: &str) -> Result<Self, CertificateError> {
        let blocks = pem::parse_many(pem_bundle)?;

        let certificate = blocks
            .iter()
            .find(|block| block.tag() == "CERTIFICATE")
            .ok_or(CertificateError::MissingCertificate)?;
        let private_key = blocks
            .iter()
            .find(|block| matches!(block.tag(), "PRIVATE KEY" | "RSA PRIVATE KEY"))
            .ok_or(CertificateError::MissingPrivateKey)?;

        let key = EncodingKey::from_rsa_pem(pem::encode(private_key).as_bytes())?;

        let digest = Sha256::digest(certificate.contents());
        let thumbprint = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);

        Ok(Self { key, thumbprint })
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Sign a short-lived assertion for `client_id` addressed to `token_url`.
    pub fn assertion(
        &self,
        client_id: &str,
        token_url: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let mut header = Header::new(Algorithm::RS256);
        header.x5t_s256 = Some(self.thumbprint.clone());

        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            aud: token_url,
            iss: client_id,
            sub: client_id,
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: now,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&header, &claims, &self.key)
    }
}
