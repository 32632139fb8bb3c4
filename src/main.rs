use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use azuread_auth::{new_azuread_client, AzureAdConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = getenv("AZUREAD_CONFIG")?;
    let url = getenv("AZUREAD_URL")?;

    let config = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading {config_path}"))?;
    let config: AzureAdConfig =
        serde_json::from_str(&config).with_context(|| format!("parsing {config_path}"))?;

    let reqwest_client = reqwest::Client::builder()
        .connection_verbose(true)
        .build()?;

    let client = new_azuread_client(&config, Some(reqwest_client))?;

    let response = client.get(&url).send().await?;
    info!(message = "Request finished", url = %url, status = %response.status());

    let body = response.text().await?;
    println!("{body}");

    Ok(())
}

fn getenv(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("env var {key} is not set"))
}
