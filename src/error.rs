//! Component-local error taxonomies (see spec §7 of the design docs).
//!
//! Each boundary gets its own small enum so callers can match on the kind
//! that matters to them; `anyhow::Error` is used above these boundaries
//! (orchestrator, main) where a caller only needs to log and move on.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("payload too short for RTP header: {0} bytes")]
    ShortHeader(usize),
    #[error("payload length {0} is not a multiple of 8 bytes (complex<f32>)")]
    MisalignedPayload(usize),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("disk queue full, write dropped")]
    QueueFull,
    #[error("io error writing archive: {0}")]
    Io(#[from] io::Error),
    #[error("metadata serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DiscriminationError {
    #[error("template generation failed for method M4: {0}")]
    TemplateGenError(String),
    #[error("tick window contaminated, using incoherent fallback")]
    TickContaminated,
}

#[derive(Debug, Error)]
pub enum CalibratorError {
    #[error("io error reading/writing calibration state: {0}")]
    Io(#[from] io::Error),
    #[error("json error in calibration state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to acquire advisory lock on calibration state")]
    LockFailed,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("sample integrity lost: {0}")]
    SampleIntegrityLost(String),
    #[error("projection error {error_ms:.2}ms exceeds reanchor threshold")]
    ProjectionError { error_ms: f64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config value out of range: {0}")]
    OutOfRange(String),
    #[error("io error loading config: {0}")]
    Io(#[from] io::Error),
    #[error("json error loading config: {0}")]
    Json(#[from] serde_json::Error),
}
