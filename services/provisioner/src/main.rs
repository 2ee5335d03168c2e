//! Provisioner CPI binary.
//!
//! Reads one JSON request from stdin, runs it against the cloud and writes
//! one JSON response to stdout. Logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stratus_provisioner::config::Config;
use stratus_provisioner::cpi;
use stratus_provisioner::provider::MockProvider;
use stratus_provisioner::registry::{InMemoryRegistry, RegistryClient, SettingsRegistry};
use stratus_provisioner::Cloud;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    info!(
        region = ?config.region,
        registry_endpoint = ?config.registry_endpoint,
        fast_path_delete = config.fast_path_delete,
        "Configuration loaded"
    );

    // Create the settings registry
    let registry: Arc<dyn SettingsRegistry> = match &config.registry_endpoint {
        Some(endpoint) => Arc::new(RegistryClient::new(
            endpoint,
            &config.registry_user,
            &config.registry_password,
        )?),
        None => Arc::new(InMemoryRegistry::default()),
    };

    // Mock provider until a real cloud backend is wired in.
    let provider = Arc::new(MockProvider::new());
    let cloud = Cloud::new(provider, registry, config.cloud_options());

    // Read the request
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("failed to read request from stdin")?;

    // Run it and write the response
    let response = cpi::handle_raw(&cloud, &raw).await;
    let mut body = serde_json::to_vec(&response).context("failed to encode response")?;
    body.push(b'\n');

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&body).await?;
    stdout.flush().await?;

    Ok(())
}
