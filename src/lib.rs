// src/lib.rs
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod types;

pub use drivers::error::{AnalysisError, ConfigError, OpenError, ReadError, RunError};
pub use config::{AdcSetup, BenchConfig, DeviceRequest, DeviceSettings};
pub use engine::{ControlHandle, FrameConsumer, RunController, Step};
pub use recorder::{FrameRecorder, RecordingSource};
pub use types::*;
