pub mod image_dir;
pub mod script;

pub use image_dir::ImageDirSource;
pub use script::FrameScript;

use crate::common::{Result, RidgelineError};
use std::time::Duration;

/// Native frame size of the supported swipe sensor.
pub const FRAME_WIDTH: u32 = 103;
pub const FRAME_HEIGHT: u32 = 50;

/// One grayscale capture. `contrast` is the pixel standard deviation the
/// sensor reports as its presence score.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub contrast: f32,
}

impl Frame {
    pub fn new(pixels: Vec<u8>) -> Result<Self> {
        let expected = (FRAME_WIDTH * FRAME_HEIGHT) as usize;
        if pixels.len() != expected {
            return Err(RidgelineError::Sensor(format!(
                "frame buffer is {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }
        let contrast = pixel_std_dev(&pixels);
        Ok(Self {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            pixels,
            contrast,
        })
    }
}

pub(crate) fn pixel_std_dev(pixels: &[u8]) -> f32 {
    if pixels.is_empty() {
        return 0.0;
    }
    let n = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / n;
    let var = pixels
        .iter()
        .map(|&p| {
            let d = p as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    var.sqrt() as f32
}

/// The sensor capability the engine consumes. The wire protocol behind it
/// (command sequences, frame timing) lives with the driver, not here.
pub trait FrameSource: Send + Sync {
    /// Capture one frame, or `None` when nothing was captured within the
    /// timeout.
    fn capture_frame(&self, timeout: Duration) -> Result<Option<Frame>>;

    /// True when no finger is on the sensor.
    fn is_clear(&self) -> Result<bool>;
}
