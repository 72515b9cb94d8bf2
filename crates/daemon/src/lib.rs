//! Loopcast
//!
//! Supervised media-streaming daemon: selects content from a local library,
//! publishes it through an ffmpeg encode-and-push subprocess, and keeps the
//! broadcast alive with health monitoring and backoff-delayed restarts.

pub mod encode;
pub mod health;
pub mod policy;
pub mod selector;
pub mod startup;
pub mod supervisor;

pub use loopcast_config as config;
pub use loopcast_config::Config;

pub use encode::{
    build_ffmpeg_command, EncodeError, Encoder, EncoderSession, FailureClass, FailureInfo,
    FfmpegEncoder, SessionEvent,
};
pub use health::{should_restart, HealthMonitor, HealthState, RestartRequest, SharedHealth};
pub use policy::{RestartDecision, RestartPolicy};
pub use selector::{ContentId, IndexSource, PickedContent, RandomSource, SelectError, Selector};
pub use startup::{
    check_ffmpeg_available, check_library_dir, check_rotation_capacity, check_stream_destination,
    run_startup_checks, StartupError,
};
pub use supervisor::{Supervisor, SupervisorError, SupervisorState};
