use crate::common::{Result, RidgelineError};
use crate::sensor::script::FrameScript;
use crate::sensor::{Frame, FrameSource, FRAME_HEIGHT, FRAME_WIDTH};
use image::imageops::FilterType;
use std::path::Path;
use std::time::Duration;

/// Replays a directory of grayscale images as sensor touches, in filename
/// order, with clear polls interleaved so the scan-loop debounce sees a
/// finger lift between touches. This is the no-hardware driver path for the
/// CLI tooling.
pub struct ImageDirSource {
    script: FrameScript,
}

impl ImageDirSource {
    pub fn open(dir: &Path, clear_polls: u32) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("png") | Some("pgm") | Some("jpg") | Some("jpeg")
                )
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(RidgelineError::Sensor(format!(
                "no image files in {}",
                dir.display()
            )));
        }

        let mut frames = Vec::with_capacity(paths.len());
        for path in &paths {
            frames.push(load_frame(path)?);
        }
        tracing::debug!("loaded {} frames from {}", frames.len(), dir.display());

        Ok(Self {
            script: FrameScript::touches(frames, clear_polls),
        })
    }

    /// A source over pre-built frames, same interleaving.
    pub fn from_frames(frames: Vec<Frame>, clear_polls: u32) -> Self {
        Self {
            script: FrameScript::touches(frames, clear_polls),
        }
    }
}

fn load_frame(path: &Path) -> Result<Frame> {
    let gray = image::open(path)?.to_luma8();
    let gray = if gray.dimensions() == (FRAME_WIDTH, FRAME_HEIGHT) {
        gray
    } else {
        image::imageops::resize(&gray, FRAME_WIDTH, FRAME_HEIGHT, FilterType::Triangle)
    };
    Frame::new(gray.into_raw())
}

impl FrameSource for ImageDirSource {
    fn capture_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.script.capture_frame(timeout)
    }

    fn is_clear(&self) -> Result<bool> {
        self.script.is_clear()
    }
}
