//! Show a Frame Bus header.

use std::path::PathBuf;

use framebridge_frame_bus::inspect;

pub fn run(name: &str, shm_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let header = inspect(name, shm_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to open Frame Bus '{name}': {e}"))?;

    let format = header
        .pixel_format()
        .map(|f| format!("{f:?}"))
        .unwrap_or_else(|| format!("unknown ({})", header.pixel_format));

    println!("Frame Bus: {name}");
    println!("  Version: {}", header.version);
    println!(
        "  Geometry: {}x{} @ {}fps, {format}",
        header.width, header.height, header.fps
    );
    println!(
        "  Slots: {} x {} bytes (stride {})",
        header.slot_count, header.frame_size, header.slot_stride
    );
    println!("  Sequence: {}", header.seq);
    if header.last_write_ns > 0 {
        println!("  Last write: {} ns", header.last_write_ns);
    } else {
        println!("  Last write: never");
    }
    Ok(())
}
