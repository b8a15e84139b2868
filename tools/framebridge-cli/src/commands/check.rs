//! Check helper binaries and shared memory.

use std::path::{Path, PathBuf};

use framebridge_common::config::{config_file_path, AppConfig};
use framebridge_frame_bus::default_shm_dir;

/// Resolve a helper path the way the process spawner would.
fn locate(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

pub fn run(config: &AppConfig, write_config: bool) -> anyhow::Result<()> {
    println!("FrameBridge System Check");
    println!("{}", "=".repeat(50));

    let config_path = config_file_path();
    if config_path.exists() {
        println!("[OK] Config: {}", config_path.display());
    } else if write_config {
        config.save()?;
        println!("[OK] Config: wrote defaults to {}", config_path.display());
    } else {
        println!("[OK] Config: defaults ({} not found)", config_path.display());
    }

    let mut missing = 0;
    for (label, program) in [
        ("DeckLink helper", &config.helpers.decklink),
        ("Display helper", &config.helpers.display),
        ("Stream helper", &config.helpers.stream),
    ] {
        match locate(program) {
            Some(found) => println!("[OK] {label}: {}", found.display()),
            None => {
                missing += 1;
                println!("[WARN] {label}: {} not found", program.display());
            }
        }
    }

    let shm_dir = config.frame_bus.shm_dir.clone().unwrap_or_else(default_shm_dir);
    let probe = shm_dir.join(format!(".framebridge-check-{}", std::process::id()));
    let shm_ok = match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            println!("[OK] Shared memory: {} writable", shm_dir.display());
            true
        }
        Err(e) => {
            println!("[FAIL] Shared memory: {} ({e})", shm_dir.display());
            false
        }
    };

    println!(
        "[OK] Output transport: {}",
        if config.output.use_frame_bus {
            "Frame Bus"
        } else {
            "legacy stdin push"
        }
    );

    println!();
    if !shm_ok {
        println!("The Frame Bus directory is not writable. Set frame_bus.shm_dir.");
    } else if missing > 0 {
        println!("{missing} helper(s) missing; outputs using them will fail to configure.");
    } else {
        println!("All checks passed. FrameBridge is ready.");
    }
    Ok(())
}
