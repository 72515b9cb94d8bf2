//! Startup checks module for Loopcast
//!
//! Preflight checks run before the supervisor starts:
//! - Rotation capacity must be strictly below the catalog size, so content
//!   selection is guaranteed to terminate
//! - Stream key and URL must be present
//! - The library directory must exist
//! - ffmpeg must be available

use crate::config::Config;
use loopcast_config::{LibraryConfig, StreamConfig};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Library directory not found: {0}")]
    LibraryDirMissing(String),

    #[error("Catalog is empty; library.catalog_size must be positive")]
    EmptyCatalog,

    #[error("Rotation capacity {capacity} must be smaller than catalog size {catalog_size}")]
    RotationCapacityTooLarge { capacity: u32, catalog_size: u32 },

    #[error("Stream configuration incomplete: {0}")]
    StreamIncomplete(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Assert the selector's termination invariant at configuration time:
/// the catalog is non-empty and the rotation window is strictly smaller
/// than the catalog.
pub fn check_rotation_capacity(library: &LibraryConfig) -> Result<(), StartupError> {
    if library.catalog_size == 0 {
        return Err(StartupError::EmptyCatalog);
    }
    if library.rotation_capacity >= library.catalog_size {
        return Err(StartupError::RotationCapacityTooLarge {
            capacity: library.rotation_capacity,
            catalog_size: library.catalog_size,
        });
    }
    Ok(())
}

/// Require both halves of the publish destination
pub fn check_stream_destination(stream: &StreamConfig) -> Result<(), StartupError> {
    if stream.url.is_empty() {
        return Err(StartupError::StreamIncomplete("stream.url is empty"));
    }
    if stream.key.is_empty() {
        return Err(StartupError::StreamIncomplete("stream.key is empty"));
    }
    Ok(())
}

/// The library directory must exist before content can be selected from it
pub fn check_library_dir(library: &LibraryConfig) -> Result<(), StartupError> {
    if !library.dir.is_dir() {
        return Err(StartupError::LibraryDirMissing(
            library.dir.display().to_string(),
        ));
    }
    Ok(())
}

/// Check that ffmpeg is available by running `ffmpeg -version`
pub fn check_ffmpeg_available() -> Result<(), StartupError> {
    let output = Command::new("ffmpeg").arg("-version").output().map_err(|e| {
        StartupError::FfmpegUnavailable(format!(
            "ffmpeg -version failed; is ffmpeg in PATH? Error: {}",
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(
            "ffmpeg -version failed; is ffmpeg in PATH?".to_string(),
        ));
    }

    Ok(())
}

/// Run all startup checks in order: configuration invariants first, then
/// the environment (library directory, ffmpeg binary).
pub fn run_startup_checks(config: &Config) -> Result<(), StartupError> {
    check_rotation_capacity(&config.library)?;
    check_stream_destination(&config.stream)?;
    check_library_dir(&config.library)?;
    check_ffmpeg_available()?;
    Ok(())
}
