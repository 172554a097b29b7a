use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::drivers::error::{OpenError, ReadError};
use crate::drivers::source::SourceAdapter;
use crate::types::{ChannelId, Frame, UnitConversion};

/// One persisted event, one JSON object per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayRecord {
    #[serde(default)]
    pub event_number: Option<u64>,
    pub sample_rate_hz: f64,
    pub channels: Vec<ChannelId>,
    pub samples: Vec<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversions: Option<Vec<UnitConversion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Frame> for ReplayRecord {
    fn from(frame: &Frame) -> Self {
        let conversions = if frame.conversions.iter().all(|c| *c == UnitConversion::IDENTITY) {
            None
        } else {
            Some(frame.conversions.clone())
        };
        Self {
            event_number: frame.sequence,
            sample_rate_hz: frame.sample_rate_hz,
            channels: frame.channels.clone(),
            samples: frame.samples.clone(),
            conversions,
            error: frame.error.clone(),
        }
    }
}

impl ReplayRecord {
    pub fn into_frame(self) -> Frame {
        let channels = self.channels;
        let conversions = self
            .conversions
            .unwrap_or_else(|| vec![UnitConversion::IDENTITY; channels.len()]);
        Frame {
            sample_rate_hz: self.sample_rate_hz,
            channels,
            samples: self.samples,
            conversions,
            sequence: self.event_number,
            error: self.error,
        }
    }
}

struct OpenFile {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

/// Replays persisted events in file order.
pub struct ReplaySource {
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<OpenFile>,
    looping: bool,
    frames_read: u64,
}

impl ReplaySource {
    pub fn open(files: Vec<PathBuf>, looping: bool) -> Result<Self, OpenError> {
        if let Some(missing) = files.iter().find(|p| !p.is_file()) {
            return Err(OpenError::MissingFile(missing.clone()));
        }
        info!("replaying {} file(s){}", files.len(), if looping { ", looping" } else { "" });
        Ok(Self {
            files,
            next_file: 0,
            current: None,
            looping,
            frames_read: 0,
        })
    }

    /// File the last frame came from.
    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path.as_path())
    }

    fn open_next(&mut self) -> Result<bool, ReadError> {
        if self.next_file >= self.files.len() {
            if self.looping && self.frames_read > 0 {
                self.next_file = 0;
            } else {
                return Ok(false);
            }
        }
        let path = self.files[self.next_file].clone();
        self.next_file += 1;
        let file = File::open(&path).map_err(|source| ReadError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("replay: opened {}", path.display());
        self.current = Some(OpenFile {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
        });
        Ok(true)
    }
}

impl SourceAdapter for ReplaySource {
    fn read_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        loop {
            let Some(current) = self.current.as_mut() else {
                if !self.open_next()? {
                    return Ok(None);
                }
                continue;
            };
            let Some(line) = current.lines.next() else {
                self.current = None;
                continue;
            };
            current.line_no += 1;
            let line = line.map_err(|source| ReadError::Io {
                path: current.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ReplayRecord =
                serde_json::from_str(&line).map_err(|e| ReadError::Malformed {
                    path: current.path.clone(),
                    line: current.line_no,
                    reason: e.to_string(),
                })?;
            let frame = record.into_frame();
            if !frame.is_consistent() {
                return Err(ReadError::Malformed {
                    path: current.path.clone(),
                    line: current.line_no,
                    reason: "channel count or trace length mismatch".to_owned(),
                });
            }
            self.frames_read += 1;
            return Ok(Some(frame));
        }
    }

    fn close(&mut self) {
        self.current = None;
        self.next_file = self.files.len();
        self.looping = false;
    }

    fn describe(&self) -> String {
        match self.current_file() {
            Some(path) => format!("replay {}", path.display()),
            None => format!("replay ({} files)", self.files.len()),
        }
    }
}
