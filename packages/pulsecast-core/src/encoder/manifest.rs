//! Concat manifest builder.
//!
//! The encoder's concat demuxer consumes a text file with one `file '...'`
//! line per asset in playback order. The builder never reorders: random-mode
//! shuffling happens in the session manager before the paths get here.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::encoder::EncoderError;

/// Writes the manifest for a session and returns its path.
///
/// Paths are converted to absolute form and single quotes are escaped the
/// way the concat demuxer expects (`'` → `'\''`). Fails with
/// [`EncoderError::EmptyPlan`] when no paths are given; the file is
/// guaranteed to exist on return.
pub fn write_manifest(
    dir: &Path,
    session_id: i64,
    paths: &[PathBuf],
) -> Result<PathBuf, EncoderError> {
    if paths.is_empty() {
        return Err(EncoderError::EmptyPlan);
    }

    std::fs::create_dir_all(dir).map_err(EncoderError::ManifestIo)?;
    let manifest_path = dir.join(format!(
        "concat_session_{}_{}.txt",
        session_id,
        uuid::Uuid::new_v4().simple()
    ));

    let mut file = std::fs::File::create(&manifest_path).map_err(EncoderError::ManifestIo)?;
    for path in paths {
        let absolute = if path.is_absolute() {
            path.clone()
        } else {
            std::env::current_dir()
                .map_err(EncoderError::ManifestIo)?
                .join(path)
        };
        let escaped = absolute.to_string_lossy().replace('\'', "'\\''");
        writeln!(file, "file '{}'", escaped).map_err(EncoderError::ManifestIo)?;
    }
    file.flush().map_err(EncoderError::ManifestIo)?;

    log::info!(
        "[Manifest] Created {} ({} entries)",
        manifest_path.display(),
        paths.len()
    );
    Ok(manifest_path)
}

/// Removes a manifest, ignoring a file that is already gone.
pub fn remove_manifest(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("[Manifest] Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[Manifest] Failed to remove {}: {}", path.display(), e),
    }
}
