//! Token cache with single-flight refresh.
//!
//! A [`TokenProvider`] hands out the cached token until its refresh point,
//! then starts exactly one exchange with the credential no matter how many
//! callers are asking. The exchange runs in its own task: a caller that gives
//! up waiting does not stop it, and whatever it returns still lands in the
//! cache for everybody else.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ExpiringToken, TokenCredential};

/// Refresh this long before the token expires.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
/// Upper bound on a single exchange with the identity endpoint.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOptions {
    /// How long before expiry a token stops being handed out without a
    /// refresh. Tokens living shorter than twice the margin are refreshed
    /// once half their lifetime has passed instead.
    pub refresh_margin: Duration,
    pub exchange_timeout: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("credential: {0}")]
    Credential(#[source] Arc<super::Error>),
    #[error("token exchange timed out after {0:?}")]
    Timeout(Duration),
    #[error("token request cancelled")]
    Cancelled,
    #[error("credential returned a token that has already expired")]
    Expired,
    #[error("token refresh aborted: {0}")]
    RefreshAborted(String),
}

#[derive(Clone)]
pub struct Record {
    pub access_token: String,
    pub expires_at: Instant,
    pub refresh_at: Instant,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("access_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("refresh_at", &self.refresh_at)
            .finish()
    }
}

impl Record {
    pub fn from_expiring_token<T: ExpiringToken>(
        token: T,
        refresh_margin: Duration,
        now: Instant,
    ) -> Self {
        let expires_at = token.expires_at();
        let lifetime = expires_at.saturating_duration_since(now);
        let refresh_at = match refresh_margin.checked_mul(2) {
            Some(double_margin) if lifetime > double_margin => expires_at - refresh_margin,
            _ => now + lifetime / 2,
        };
        Self {
            access_token: token.access_token().to_owned(),
            expires_at,
            refresh_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    pub fn needs_refresh(&self, now: Instant) -> bool {
        self.refresh_at <= now
    }
}

impl super::Token for Record {
    fn access_token(&self) -> &str {
        &self.access_token
    }
}

type Refresh = Shared<BoxFuture<'static, Result<Record, Error>>>;

#[derive(Default)]
struct State {
    cached: Option<Record>,
    refresh: Option<Refresh>,
}

pub struct TokenProvider {
    credential: Arc<dyn TokenCredential>,
    scope: Arc<str>,
    options: RefreshOptions,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("scope", &self.scope)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TokenProvider {
    pub fn new(credential: Arc<dyn TokenCredential>, scope: impl Into<String>) -> Self {
        Self::with_options(credential, scope, RefreshOptions::default())
    }

    pub fn with_options(
        credential: Arc<dyn TokenCredential>,
        scope: impl Into<String>,
        options: RefreshOptions,
    ) -> Self {
        let scope: String = scope.into();
        Self {
            credential,
            scope: scope.into(),
            options,
            state: Arc::default(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn options(&self) -> RefreshOptions {
        self.options
    }

    /// A token that has not expired, refreshed through the credential when
    /// the cached one is missing or past its refresh point.
    pub async fn get_token(&self) -> Result<Record, Error> {
        let (refresh, fallback) = {
            let mut state = lock(&self.state);
            let now = Instant::now();

            if let Some(cached) = &state.cached {
                if !cached.needs_refresh(now) {
                    debug!(message = "Using preexisting token", token_expires_at = ?cached.expires_at);
                    return Ok(cached.clone());
                }
                debug!(message = "Existing token due for refresh", token_expires_at = ?cached.expires_at);
            }

            let fallback = state.cached.clone().filter(|cached| !cached.is_expired(now));
            (self.start_or_join_refresh(&mut state), fallback)
        };

        match refresh.await {
            Ok(record) => Ok(record),
            Err(err) => match fallback {
                Some(record) if !record.is_expired(Instant::now()) => {
                    warn!(
                        message = "Token refresh failed, using token that has not expired yet",
                        error = %err,
                        token_expires_at = ?record.expires_at,
                    );
                    Ok(record)
                }
                _ => Err(err),
            },
        }
    }

    /// Like [`TokenProvider::get_token`], giving up with [`Error::Cancelled`]
    /// once `cancel` fires. An exchange already under way keeps going.
    pub async fn get_token_with_cancellation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Record, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.get_token() => result,
        }
    }

    pub async fn get_access_token(&self) -> Result<String, Error> {
        let record = self.get_token().await?;
        Ok(record.access_token)
    }

    fn start_or_join_refresh(&self, state: &mut State) -> Refresh {
        if let Some(refresh) = &state.refresh {
            debug!(message = "Joining token refresh already in flight");
            return refresh.clone();
        }

        info!(
            message = "No active token found, about to get a new one",
            token_is_stale = state.cached.is_some(),
        );

        let credential = Arc::clone(&self.credential);
        let scope = Arc::clone(&self.scope);
        let options = self.options;
        let shared_state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            let result = fetch_new_token(credential.as_ref(), &scope, options).await;

            let mut state = lock(&shared_state);
            state.refresh = None;
            match &result {
                Ok(record) => {
                    debug!(message = "Got new token", token_expires_at = ?record.expires_at);
                    state.cached.replace(record.clone());
                }
                Err(err) => warn!(message = "Token refresh failed", error = %err),
            }
            result
        });

        let shared_state = Arc::clone(&self.state);
        let refresh = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    lock(&shared_state).refresh = None;
                    Err(Error::RefreshAborted(join_error.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        state.refresh = Some(refresh.clone());
        refresh
    }
}

async fn fetch_new_token(
    credential: &dyn TokenCredential,
    scope: &str,
    options: RefreshOptions,
) -> Result<Record, Error> {
    let token = tokio::time::timeout(options.exchange_timeout, credential.get_auth_token(scope))
        .await
        .map_err(|_| Error::Timeout(options.exchange_timeout))?
        .map_err(|err| Error::Credential(Arc::new(err)))?;

    let now = Instant::now();
    if token.expires_at() <= now {
        return Err(Error::Expired);
    }
    Ok(Record::from_expiring_token(token, options.refresh_margin, now))
}
