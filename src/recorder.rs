use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::drivers::error::ReadError;
use crate::drivers::replay::ReplayRecord;
use crate::drivers::source::SourceAdapter;
use crate::types::Frame;

/// Writes raw frames as JSON Lines, the format `ReplaySource` reads back.
pub struct FrameRecorder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames: u64,
}

impl FrameRecorder {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        info!("recording to {}", path.display());
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let Some(w) = self.writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "recorder already finished"));
        };
        serde_json::to_writer(&mut *w, &ReplayRecord::from(frame))?;
        writeln!(w)?;
        self.frames += 1;
        Ok(())
    }

    /// Flushes and closes the file. Further writes fail.
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
            info!("recording saved: {} frames in {}", self.frames, self.path.display());
        }
        Ok(())
    }
}

impl Drop for FrameRecorder {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!("failed to flush {}: {err}", self.path.display());
        }
    }
}

/// Source wrapper that records every frame it hands out.
pub struct RecordingSource {
    inner: Box<dyn SourceAdapter>,
    recorder: FrameRecorder,
}

impl RecordingSource {
    pub fn new(inner: Box<dyn SourceAdapter>, recorder: FrameRecorder) -> Self {
        Self { inner, recorder }
    }
}

impl SourceAdapter for RecordingSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        let frame = self.inner.read_frame()?;
        if let Some(frame) = &frame {
            self.recorder
                .write_frame(frame)
                .map_err(|source| ReadError::Io {
                    path: self.recorder.path().to_path_buf(),
                    source,
                })?;
        }
        Ok(frame)
    }

    fn close(&mut self) {
        self.inner.close();
        if let Err(err) = self.recorder.finish() {
            warn!("failed to flush {}: {err}", self.recorder.path().display());
        }
    }

    fn describe(&self) -> String {
        format!("{} (recording to {})", self.inner.describe(), self.recorder.path().display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::replay::ReplaySource;
    use crate::drivers::source::ManualSource;
    use crate::types::UnitConversion;

    #[test]
    fn recorded_frames_replay_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        let frames = vec![
            Frame::new(1e6, vec![2, 5], vec![vec![1.0, -3.0], vec![0.5, 8.0]])
                .with_sequence(0)
                .with_conversions(vec![UnitConversion::for_adc_range(-2.0, 2.0); 2]),
            Frame::new(1e6, vec![2, 5], vec![vec![4.0, 4.0], vec![-1.0, 0.0]]).with_sequence(1),
        ];

        let mut source = RecordingSource::new(
            Box::new(ManualSource::new(frames.clone())),
            FrameRecorder::create(&path).unwrap(),
        );
        while source.read_frame().unwrap().is_some() {}
        source.close();

        let mut replay = ReplaySource::open(vec![path], false).unwrap();
        let mut replayed = Vec::new();
        while let Some(frame) = replay.read_frame().unwrap() {
            replayed.push(frame);
        }
        assert_eq!(replayed, frames);
    }

    #[test]
    fn writes_after_finish_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = FrameRecorder::create(dir.path().join("x.jsonl")).unwrap();
        rec.write_frame(&Frame::new(10.0, vec![0], vec![vec![1.0]])).unwrap();
        rec.finish().unwrap();
        assert!(!rec.is_recording());
        assert_eq!(rec.frames_written(), 1);
        assert!(rec.write_frame(&Frame::new(10.0, vec![0], vec![vec![1.0]])).is_err());
    }
}
