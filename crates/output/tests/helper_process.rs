//! Helper process supervision against real `/bin/sh` children.

#![cfg(unix)]

use std::time::Duration;

use framebridge_common::error::BridgeError;
use framebridge_output::legacy::{LegacyHeader, LegacyMessageType, LEGACY_HEADER_SIZE};
use framebridge_output::{HelperCommand, HelperProcess, HelperTimeouts, VideoFrame};

fn sh(script: &str) -> HelperCommand {
    HelperCommand::new("test-helper", "/bin/sh").arg("-c").arg(script)
}

fn fast() -> HelperTimeouts {
    HelperTimeouts {
        ready: Duration::from_secs(5),
        graceful: Duration::from_millis(300),
        terminate: Duration::from_millis(300),
    }
}

#[tokio::test]
async fn ready_line_resolves_and_shutdown_is_graceful() {
    let mut process =
        HelperProcess::spawn(&sh(r#"echo '{"type":"log","level":"info","message":"hi"}'; echo '{"type":"ready"}'; cat > /dev/null"#))
            .unwrap();
    process.take_ready().unwrap().wait(Duration::from_secs(5)).await.unwrap();
    assert!(process.take_ready().is_none());

    let exit = process.shutdown(&fast()).await;
    assert_eq!(exit.code, Some(0));
    assert_eq!(exit.signal, None);
}

#[tokio::test]
async fn exit_before_ready_carries_the_code() {
    let mut process = HelperProcess::spawn(&sh("echo failing >&2; exit 1")).unwrap();
    let err = process
        .take_ready()
        .unwrap()
        .wait(Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        BridgeError::HelperExited { exit, .. } => assert_eq!(exit.code, Some(1)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(process.exit_status().and_then(|e| e.code), Some(1));
}

#[tokio::test]
async fn ready_times_out() {
    let mut process = HelperProcess::spawn(&sh("exec sleep 30")).unwrap();
    let err = process
        .take_ready()
        .unwrap()
        .wait(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }));
    process.shutdown(&fast()).await;
}

#[tokio::test]
async fn missing_binary_is_a_process_error() {
    let err = HelperProcess::spawn(&HelperCommand::new("ghost", "/nonexistent/framebridge-helper"))
        .unwrap_err();
    assert!(matches!(err, BridgeError::Process { .. }));
}

#[tokio::test]
async fn sigterm_follows_ignored_shutdown() {
    let process = HelperProcess::spawn(&sh("exec sleep 30")).unwrap();
    let exit = process.shutdown(&fast()).await;
    assert_eq!(exit.signal, Some(libc::SIGTERM));
}

#[tokio::test]
async fn kill_follows_ignored_sigterm() {
    let mut process = HelperProcess::spawn(&sh(
        r#"trap '' TERM; echo '{"type":"ready"}'; while :; do sleep 0.05; done"#,
    ))
    .unwrap();
    process.take_ready().unwrap().wait(Duration::from_secs(5)).await.unwrap();

    let started = std::time::Instant::now();
    let exit = process.shutdown(&fast()).await;
    assert_eq!(exit.signal, Some(libc::SIGKILL));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn frame_pump_writes_legacy_messages() {
    let dir = std::env::temp_dir().join(format!("framebridge-pump-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let dump = dir.join("stdin.bin");

    let script = format!(r#"echo '{{"type":"ready"}}'; exec cat > "{}""#, dump.display());
    let mut process = HelperProcess::spawn(&sh(&script)).unwrap();
    let frames = process.start_frame_pump().unwrap();
    process.take_ready().unwrap().wait(Duration::from_secs(5)).await.unwrap();

    for ts in 1..=3u64 {
        frames
            .offer(VideoFrame {
                width: 2,
                height: 1,
                timestamp_ns: ts,
                rgba: vec![ts as u8; 8],
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let exit = process.shutdown(&fast()).await;
    assert_eq!(exit.code, Some(0));

    let bytes = std::fs::read(&dump).unwrap();
    let mut offset = 0;
    let mut last_frame = None;
    let mut saw_shutdown = false;
    while offset < bytes.len() {
        let header = LegacyHeader::decode(&bytes[offset..]).unwrap();
        offset += LEGACY_HEADER_SIZE;
        match header.kind {
            LegacyMessageType::Frame => {
                let end = offset + header.payload_len as usize;
                last_frame = Some((header.timestamp, bytes[offset..end].to_vec()));
                offset = end;
            }
            LegacyMessageType::Shutdown => {
                saw_shutdown = true;
                assert_eq!(offset, bytes.len());
            }
        }
    }
    assert!(saw_shutdown);
    assert_eq!(last_frame, Some((3, vec![3u8; 8])));

    let _ = std::fs::remove_dir_all(&dir);
}
