//! Adapter lifecycle against scripted helpers.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use framebridge_common::config::HelperConfig;
use framebridge_common::error::BridgeError;
use framebridge_device_model::{
    Colorspace, Connector, DeviceDescriptor, FrameFormat, OutputConfiguration, OutputKey,
    OutputTargets, PortDescriptor, PortDirection, PortRole, SignalRange, StaticCatalog,
};
use framebridge_output::legacy::{LegacyHeader, LegacyMessageType, LEGACY_HEADER_SIZE};
use framebridge_output::{
    AdapterContext, AdapterFactory, AdapterState, HelperAdapter, HelperAdapterFactory,
    OutputAdapter, VideoFrame,
};

struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("framebridge-adapter-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn port(id: &str, role: PortRole) -> PortDescriptor {
    PortDescriptor {
        id: id.to_string(),
        device_id: "dl0".to_string(),
        display_name: id.to_string(),
        direction: PortDirection::Output,
        role,
        connector: Connector::Sdi,
        formats: vec![],
        modes: vec![],
        available: true,
    }
}

fn context(helper: &Path, use_frame_bus: bool) -> AdapterContext {
    let device = DeviceDescriptor {
        id: "dl0".to_string(),
        display_name: "DeckLink Duo".to_string(),
        vendor: "Blackmagic".to_string(),
        model: "Duo 2".to_string(),
        available: true,
        busy: false,
        supports_external_keying: true,
        ports: vec![
            port("dl0-sdi-a", PortRole::Video),
            port("dl0-sdi-b", PortRole::Key),
        ],
    };
    AdapterContext {
        helpers: HelperConfig {
            decklink: helper.to_path_buf(),
            display: helper.to_path_buf(),
            stream: helper.to_path_buf(),
            ready_timeout_ms: 3_000,
            graceful_timeout_ms: 300,
            terminate_timeout_ms: 300,
        },
        use_frame_bus,
        framebus_name: "fb-adapter-test".to_string(),
        catalog: Arc::new(StaticCatalog::new(vec![device])),
    }
}

fn key_fill(fill: &str, key: &str) -> OutputConfiguration {
    OutputConfiguration {
        key: OutputKey::KeyFill,
        targets: OutputTargets {
            fill_port: Some(fill.to_string()),
            key_port: Some(key.to_string()),
            ..Default::default()
        },
        pixel_format: None,
        range: SignalRange::Legal,
        colorspace: Colorspace::Rec709,
        format: FrameFormat {
            width: 2,
            height: 2,
            fps: 50.0,
        },
    }
}

fn display() -> OutputConfiguration {
    OutputConfiguration {
        key: OutputKey::Display,
        targets: OutputTargets::default(),
        pixel_format: None,
        range: SignalRange::Legal,
        colorspace: Colorspace::Auto,
        format: FrameFormat::default(),
    }
}

const READY: &str = r#"echo '{"type":"ready"}'"#;

#[tokio::test]
async fn key_fill_configures_and_stops_twice() {
    let scratch = Scratch::new();
    let args = scratch.path("args.txt");
    let helper = scratch.script(
        "helper.sh",
        &format!("echo \"$@\" > \"{}\"\n{READY}\ncat > /dev/null", args.display()),
    );
    let adapter = HelperAdapter::for_key(OutputKey::KeyFill, context(&helper, true));

    adapter.configure(&key_fill("dl0-sdi-a", "dl0-sdi-b")).await.unwrap();
    assert_eq!(adapter.state(), AdapterState::Running);
    let recorded = std::fs::read_to_string(&args).unwrap();
    assert!(recorded.contains("--fill-port dl0-sdi-a --key-port dl0-sdi-b"));
    assert!(recorded.contains("--framebus-name fb-adapter-test-2x2-50"));

    adapter.stop().await.unwrap();
    adapter.stop().await.unwrap();
    assert_eq!(adapter.state(), AdapterState::NotConfigured);
}

#[tokio::test]
async fn swapped_roles_fail_without_spawning() {
    let scratch = Scratch::new();
    let marker = scratch.path("spawned");
    let helper = scratch.script(
        "helper.sh",
        &format!("touch \"{}\"\n{READY}\ncat > /dev/null", marker.display()),
    );
    let adapter = HelperAdapter::for_key(OutputKey::KeyFill, context(&helper, true));

    let err = adapter
        .configure(&key_fill("dl0-sdi-b", "dl0-sdi-a"))
        .await
        .unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("not a valid fill/key pair"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists());
    assert_eq!(adapter.state(), AdapterState::NotConfigured);
}

#[tokio::test]
async fn exit_before_ready_returns_to_not_configured() {
    let scratch = Scratch::new();
    let helper = scratch.script("helper.sh", "echo 'no device' >&2\nexit 1");
    let adapter = HelperAdapter::for_key(OutputKey::Display, context(&helper, true));

    let err = adapter.configure(&display()).await.unwrap_err();
    assert_eq!(err.process_exit().and_then(|e| e.code), Some(1));
    assert_eq!(adapter.state(), AdapterState::NotConfigured);
}

#[tokio::test]
async fn stop_during_configure_wins() {
    let scratch = Scratch::new();
    let helper = scratch.script("helper.sh", "exec sleep 30");
    let adapter = Arc::new(HelperAdapter::for_key(OutputKey::Display, context(&helper, true)));

    let configuring = {
        let adapter = adapter.clone();
        tokio::spawn(async move { adapter.configure(&display()).await })
    };
    let mut states = adapter.watch_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == AdapterState::Configuring),
    )
    .await
    .unwrap()
    .unwrap();

    adapter.stop().await.unwrap();
    let result = configuring.await.unwrap();
    assert!(result.is_err());
    assert_eq!(adapter.state(), AdapterState::NotConfigured);
}

#[tokio::test]
async fn reconfigure_replaces_the_helper() {
    let scratch = Scratch::new();
    let count = scratch.path("starts");
    let helper = scratch.script(
        "helper.sh",
        &format!("echo start >> \"{}\"\n{READY}\ncat > /dev/null", count.display()),
    );
    let adapter = HelperAdapter::for_key(OutputKey::Display, context(&helper, true));

    adapter.configure(&display()).await.unwrap();
    adapter.configure(&display()).await.unwrap();
    assert_eq!(adapter.state(), AdapterState::Running);
    let starts = std::fs::read_to_string(&count).unwrap();
    assert_eq!(starts.lines().count(), 2);
    adapter.stop().await.unwrap();
}

#[tokio::test]
async fn crash_after_ready_marks_failed() {
    let scratch = Scratch::new();
    let helper = scratch.script("helper.sh", &format!("{READY}\nsleep 0.2\nexit 3"));
    let adapter = HelperAdapter::for_key(OutputKey::Display, context(&helper, true));

    adapter.configure(&display()).await.unwrap();
    let mut states = adapter.watch_state();
    tokio::time::timeout(
        Duration::from_secs(3),
        states.wait_for(|s| *s == AdapterState::Failed),
    )
    .await
    .unwrap()
    .unwrap();

    adapter.stop().await.unwrap();
    assert_eq!(adapter.state(), AdapterState::NotConfigured);
}

#[tokio::test]
async fn legacy_push_delivers_latest_frame() {
    let scratch = Scratch::new();
    let dump = scratch.path("frames.bin");
    let helper = scratch.script(
        "helper.sh",
        &format!("{READY}\nexec cat > \"{}\"", dump.display()),
    );
    let factory = HelperAdapterFactory::new(context(&helper, false));
    let adapter = factory.create(OutputKey::KeyFill);
    let config = key_fill("dl0-sdi-a", "dl0-sdi-b");

    adapter.configure(&config).await.unwrap();
    for ts in 1..=5u64 {
        let frame = VideoFrame {
            width: 2,
            height: 2,
            timestamp_ns: ts,
            rgba: vec![ts as u8; 16],
        };
        adapter.send_frame(&frame, &config).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    adapter.stop().await.unwrap();

    let bytes = std::fs::read(&dump).unwrap();
    let mut offset = 0;
    let mut frames = Vec::new();
    let mut kinds = Vec::new();
    while offset < bytes.len() {
        let header = LegacyHeader::decode(&bytes[offset..]).unwrap();
        offset += LEGACY_HEADER_SIZE;
        kinds.push(header.kind);
        let end = offset + header.payload_len as usize;
        if header.kind == LegacyMessageType::Frame {
            frames.push((header.timestamp, bytes[offset..end].to_vec()));
        }
        offset = end;
    }
    assert_eq!(kinds.last(), Some(&LegacyMessageType::Shutdown));
    assert_eq!(frames.last(), Some(&(5, vec![5u8; 16])));
    assert!(frames.len() <= 5);
}

#[tokio::test]
async fn display_requires_the_frame_bus() {
    let scratch = Scratch::new();
    let helper = scratch.script("helper.sh", READY);
    let adapter = HelperAdapter::for_key(OutputKey::Display, context(&helper, false));
    let err = adapter.configure(&display()).await.unwrap_err();
    assert!(matches!(err, BridgeError::Config { .. }));
}
