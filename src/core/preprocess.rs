use crate::common::{Result, RidgelineError};
use crate::sensor::Frame;
use image::GrayImage;
use imageproc::contrast::equalize_histogram;
use imageproc::filter::gaussian_blur_f32;

/// Blur radius tuned for ridge-scale detail at the sensor's resolution.
const BLUR_SIGMA: f32 = 0.8;

/// Canonicalize a raw capture for feature extraction: stretch contrast to
/// the full range, equalize the histogram, then soften sensor noise with a
/// mild blur. Deterministic; the only failure is a wrong-size buffer.
pub fn preprocess(frame: &Frame) -> Result<GrayImage> {
    let expected = (frame.width * frame.height) as usize;
    if frame.pixels.len() != expected {
        return Err(RidgelineError::Sensor(format!(
            "frame buffer is {} bytes, expected {}",
            frame.pixels.len(),
            expected
        )));
    }

    let stretched = stretch_contrast(&frame.pixels);
    let img = GrayImage::from_raw(frame.width, frame.height, stretched)
        .ok_or_else(|| RidgelineError::Sensor("frame buffer rejected".into()))?;

    let equalized = equalize_histogram(&img);
    Ok(gaussian_blur_f32(&equalized, BLUR_SIGMA))
}

fn stretch_contrast(pixels: &[u8]) -> Vec<u8> {
    let min = pixels.iter().copied().min().unwrap_or(0);
    let max = pixels.iter().copied().max().unwrap_or(0);
    if max == min {
        return pixels.to_vec();
    }
    let range = (max - min) as f32;
    pixels
        .iter()
        .map(|&p| (((p - min) as f32 / range) * 255.0).round() as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{FRAME_HEIGHT, FRAME_WIDTH};

    fn gradient_frame() -> Frame {
        let pixels: Vec<u8> = (0..FRAME_WIDTH * FRAME_HEIGHT)
            .map(|i| ((i % FRAME_WIDTH) * 2 + 40) as u8)
            .collect();
        Frame::new(pixels).unwrap()
    }

    #[test]
    fn output_keeps_dimensions() {
        let out = preprocess(&gradient_frame()).unwrap();
        assert_eq!(out.dimensions(), (FRAME_WIDTH, FRAME_HEIGHT));
    }

    #[test]
    fn deterministic() {
        let frame = gradient_frame();
        let a = preprocess(&frame).unwrap();
        let b = preprocess(&frame).unwrap();
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn rejects_wrong_size() {
        let frame = Frame {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            pixels: vec![0; 17],
            contrast: 0.0,
        };
        assert!(preprocess(&frame).is_err());
    }

    #[test]
    fn flat_frame_survives() {
        let frame = Frame::new(vec![128; (FRAME_WIDTH * FRAME_HEIGHT) as usize]).unwrap();
        let out = preprocess(&frame).unwrap();
        assert_eq!(out.dimensions(), (FRAME_WIDTH, FRAME_HEIGHT));
    }
}
