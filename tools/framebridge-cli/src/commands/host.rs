//! Run a standalone compositing host.

use framebridge_common::config::AppConfig;
use framebridge_compositor::{spawn_host, SoftwareEngine};

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let host = spawn_host(Box::new(SoftwareEngine::new()), &config.control).await?;

    // Machine-readable first line for whoever spawned us.
    println!(
        "{}",
        serde_json::json!({"port": host.addr().port(), "token": host.token()})
    );
    eprintln!("Compositing host listening on {}; press Ctrl+C to stop", host.addr());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        _ = host.wait() => {
            eprintln!("Host exited");
            return Ok(());
        }
    }

    let status = host.status().await;
    eprintln!(
        "Frames written: {} ({} layers live)",
        status.frames_written,
        status.layer_ids.len()
    );
    host.shutdown().await;
    Ok(())
}
