use tracing::debug;

#[derive(Debug, thiserror::Error)]
#[error("{status_code} status code: {body}")]
pub struct ServerError {
    pub status_code: u16,
    pub body: String,
}

/// Pass successful responses through, turn the rest into a [`ServerError`]
/// carrying whatever error description the identity endpoint sent back.
pub async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, ServerError> {
    let status = res.status();
    if !status.is_success() {
        let body = match res.text().await {
            Ok(body) => body,
            Err(err) => {
                debug!(message = "Failed to read error response body", error = %err);
                format!("<unreadable response body: {err}>")
            }
        };
        return Err(ServerError {
            status_code: status.as_u16(),
            body,
        });
    }
    Ok(res)
}

/// IMDS and the v1 endpoints take a resource, the v2 endpoint takes a scope.
pub fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}
