// src/drivers/mod.rs
// Submodules of the drivers directory
pub mod analyzer;
pub mod buffer;
pub mod device;
pub mod error;
pub mod feed;
pub mod fft;
pub mod pileup;
pub mod replay;
pub mod selector;
pub mod source;
pub mod transfer;
// Re-export the public types for callers
pub use analyzer::Analyzer;
pub use buffer::RunningWindow;
pub use device::{AdcDriver, DeviceSource, DriverFactory, SimulatedAdc, SimulatedDriverFactory};
pub use error::{AnalysisError, ConfigError, OpenError, ReadError, RunError};
pub use feed::{feed_channel, FeedHandle, FeedPublisher, FeedSource};
pub use fft::SpectrumBuilder;
pub use pileup::{AmplitudeBandDetector, PileupDetector, PretriggerDetector};
pub use replay::{ReplayRecord, ReplaySource};
pub use selector::{select_channels, SelectedFrame, Selection};
pub use source::{ManualSource, SourceAdapter};
