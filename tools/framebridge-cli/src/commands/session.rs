//! Run a session from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use framebridge_common::config::AppConfig;
use framebridge_device_model::{DeviceCatalog, OutputConfiguration, StaticCatalog};
use framebridge_orchestrator::{SendLayerPayload, SessionContext, SessionOptions};

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {what} {}: {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {what} {}: {e}", path.display()))
}

pub async fn run(
    config: AppConfig,
    outputs: Option<PathBuf>,
    catalog: Option<PathBuf>,
    layers: Vec<PathBuf>,
    restore: bool,
) -> anyhow::Result<()> {
    let catalog: Arc<dyn DeviceCatalog> = match catalog {
        Some(path) => Arc::new(StaticCatalog::load(&path)?),
        None => Arc::new(StaticCatalog::default()),
    };
    let outputs: Option<OutputConfiguration> = outputs
        .as_deref()
        .map(|path| read_json(path, "output configuration"))
        .transpose()?;
    let layers: Vec<SendLayerPayload> = layers
        .iter()
        .map(|path| read_json(path, "layer"))
        .collect::<anyhow::Result<_>>()?;

    let mut options = SessionOptions::new(config, catalog);
    options.restore_outputs = restore;
    let session = SessionContext::start(options).await?;

    println!("Session {} started", session.id());
    println!("  Frame Bus base: {}", session.framebus_name());

    if let Some(outputs) = outputs {
        let key = outputs.key;
        let result = session.configure_outputs(outputs).await;
        match result.reason {
            None => println!("[OK] Output {key} configured"),
            Some(reason) => println!("[FAIL] Output {key}: {reason}"),
        }
    }

    if layers.is_empty() {
        let result = session.send_test_pattern().await;
        match result.reason {
            None => println!("[OK] Test pattern on"),
            Some(reason) => println!("[FAIL] Test pattern: {reason}"),
        }
    }

    for payload in layers {
        let layer_id = payload.layer.layer_id.clone();
        let result = session.send_layer(payload).await;
        match result.reason {
            None => println!("[OK] Layer {layer_id} sent"),
            Some(reason) => println!("[FAIL] Layer {layer_id}: {reason}"),
        }
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&session.get_status().await)?);
    println!();
    println!("Press Ctrl+C to stop...");

    tokio::signal::ctrl_c().await?;

    println!();
    session.close().await?;
    println!("Session closed");
    Ok(())
}
