use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Fixed descriptor length: 4x4 spatial cells, 4 gradient sums per cell.
pub const DESCRIPTOR_LEN: usize = 64;

/// L2-comparable local feature vector.
pub type Descriptor = Vec<f32>;

/// Local feature location and shape, persisted alongside its descriptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub angle: f32,
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

/// Bresenham circle of radius 3, clockwise from 12 o'clock.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Consecutive circle pixels required for a corner.
const FAST_ARC: usize = 9;
/// Intensity delta for the corner test.
const FAST_THRESHOLD: i16 = 10;
/// Patch radius used for orientation and the descriptor grid.
const PATCH_RADIUS: i32 = 8;
/// Cap on keypoints kept per frame, strongest first.
const MAX_KEYPOINTS: usize = 256;

/// FAST-9 corner detector with non-max suppression, intensity-centroid
/// orientation, and a rotated gradient-sum descriptor. Rotation and
/// translation tolerant; no scale pyramid, the sensor images are too small
/// for one to pay off.
#[derive(Debug, Default, Clone)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Detect keypoints and compute their descriptors. May be empty;
    /// callers apply their own quality gates on the count.
    pub fn extract(&self, img: &GrayImage) -> Vec<(Keypoint, Descriptor)> {
        let (w, h) = img.dimensions();
        let margin = PATCH_RADIUS + 1;
        if w as i32 <= 2 * margin || h as i32 <= 2 * margin {
            return Vec::new();
        }

        let mut scored = Vec::new();
        for y in margin..(h as i32 - margin) {
            for x in margin..(w as i32 - margin) {
                if let Some(response) = corner_response(img, x, y) {
                    scored.push((x, y, response));
                }
            }
        }

        let suppressed = non_max_suppress(&scored);
        let mut features: Vec<(Keypoint, Descriptor)> = suppressed
            .into_iter()
            .map(|(x, y, response)| {
                let angle = orientation(img, x, y);
                let kp = Keypoint {
                    x: x as f32,
                    y: y as f32,
                    size: (2 * PATCH_RADIUS) as f32,
                    angle,
                    response,
                    octave: 0,
                    class_id: -1,
                };
                let desc = describe(img, &kp);
                (kp, desc)
            })
            .collect();

        features.sort_by(|a, b| {
            b.0.response
                .partial_cmp(&a.0.response)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        features.truncate(MAX_KEYPOINTS);
        features
    }
}

fn px(img: &GrayImage, x: i32, y: i32) -> i16 {
    img.get_pixel(x as u32, y as u32)[0] as i16
}

/// FAST-9 segment test. Returns the corner response (sum of absolute
/// differences over the qualifying arc) or None.
fn corner_response(img: &GrayImage, x: i32, y: i32) -> Option<f32> {
    let center = px(img, x, y);
    let ring: Vec<i16> = CIRCLE
        .iter()
        .map(|&(dx, dy)| px(img, x + dx, y + dy))
        .collect();

    // Quick reject on the four compass points.
    let brighter = |v: i16| v >= center + FAST_THRESHOLD;
    let darker = |v: i16| v <= center - FAST_THRESHOLD;
    let compass = [ring[0], ring[4], ring[8], ring[12]];
    let bright_compass = compass.iter().filter(|&&v| brighter(v)).count();
    let dark_compass = compass.iter().filter(|&&v| darker(v)).count();
    if bright_compass < 3 && dark_compass < 3 {
        return None;
    }

    for test in [&brighter as &dyn Fn(i16) -> bool, &darker] {
        let mut run = 0usize;
        // Doubled ring handles wraparound arcs.
        for i in 0..(CIRCLE.len() * 2) {
            if test(ring[i % CIRCLE.len()]) {
                run += 1;
                if run >= FAST_ARC {
                    let response: i32 = ring
                        .iter()
                        .filter(|&&v| test(v))
                        .map(|&v| (v - center).unsigned_abs() as i32)
                        .sum();
                    return Some(response as f32);
                }
            } else {
                run = 0;
            }
        }
    }
    None
}

/// 3x3 non-max suppression on the corner response.
fn non_max_suppress(scored: &[(i32, i32, f32)]) -> Vec<(i32, i32, f32)> {
    use std::collections::HashMap;
    let by_pos: HashMap<(i32, i32), f32> =
        scored.iter().map(|&(x, y, r)| ((x, y), r)).collect();
    scored
        .iter()
        .filter(|&&(x, y, r)| {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    if let Some(&other) = by_pos.get(&(x + dx, y + dy)) {
                        if other > r || (other == r && (dy < 0 || (dy == 0 && dx < 0))) {
                            return false;
                        }
                    }
                }
            }
            true
        })
        .copied()
        .collect()
}

/// Intensity-centroid orientation over the patch, in radians.
fn orientation(img: &GrayImage, x: i32, y: i32) -> f32 {
    let mut m10 = 0f32;
    let mut m01 = 0f32;
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > PATCH_RADIUS * PATCH_RADIUS {
                continue;
            }
            let v = sample(img, (x + dx) as f32, (y + dy) as f32);
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

/// Bilinear sample with clamped coordinates.
fn sample(img: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = img.dimensions();
    let xc = x.clamp(0.0, (w - 1) as f32);
    let yc = y.clamp(0.0, (h - 1) as f32);
    let x0 = xc.floor() as u32;
    let y0 = yc.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = xc - x0 as f32;
    let fy = yc - y0 as f32;

    let p00 = img.get_pixel(x0, y0)[0] as f32;
    let p10 = img.get_pixel(x1, y0)[0] as f32;
    let p01 = img.get_pixel(x0, y1)[0] as f32;
    let p11 = img.get_pixel(x1, y1)[0] as f32;

    p00 * (1.0 - fx) * (1.0 - fy) + p10 * fx * (1.0 - fy) + p01 * (1.0 - fx) * fy + p11 * fx * fy
}

/// Gradient-sum descriptor over a 4x4 cell grid, sampled in the keypoint's
/// rotated frame so the vector is orientation-normalized. Each cell
/// contributes (sum dx, sum |dx|, sum dy, sum |dy|), L2-normalized overall.
fn describe(img: &GrayImage, kp: &Keypoint) -> Descriptor {
    let cos = kp.angle.cos();
    let sin = kp.angle.sin();
    let mut desc = vec![0f32; DESCRIPTOR_LEN];

    let span = PATCH_RADIUS as f32;
    let cell_size = (2.0 * span) / 4.0;

    for gy in 0..(2 * PATCH_RADIUS) {
        for gx in 0..(2 * PATCH_RADIUS) {
            // Patch coordinates centered on the keypoint.
            let ux = gx as f32 - span + 0.5;
            let uy = gy as f32 - span + 0.5;

            // Rotate the sample position into image space.
            let ix = kp.x + ux * cos - uy * sin;
            let iy = kp.y + ux * sin + uy * cos;

            let dx_img = sample(img, ix + 1.0, iy) - sample(img, ix - 1.0, iy);
            let dy_img = sample(img, ix, iy + 1.0) - sample(img, ix, iy - 1.0);

            // Rotate the gradient back into the patch frame.
            let dx = dx_img * cos + dy_img * sin;
            let dy = -dx_img * sin + dy_img * cos;

            let cx = (((ux + span) / cell_size) as usize).min(3);
            let cy = (((uy + span) / cell_size) as usize).min(3);
            let base = (cy * 4 + cx) * 4;
            desc[base] += dx;
            desc[base + 1] += dx.abs();
            desc[base + 2] += dy;
            desc[base + 3] += dy.abs();
        }
    }

    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut desc {
            *v /= norm;
        }
    }
    desc
}

/// Squared Euclidean distance between two descriptors.
pub fn distance_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot_image(dots: &[(u32, u32)]) -> GrayImage {
        let mut img = GrayImage::from_pixel(103, 50, image::Luma([20]));
        for &(cx, cy) in dots {
            for dy in 0..2 {
                for dx in 0..2 {
                    if cx + dx < 103 && cy + dy < 50 {
                        img.put_pixel(cx + dx, cy + dy, image::Luma([240]));
                    }
                }
            }
        }
        img
    }

    #[test]
    fn detects_corners_on_dots() {
        let img = dot_image(&[(20, 20), (40, 25), (60, 15), (80, 30)]);
        let features = FeatureExtractor::new().extract(&img);
        assert!(features.len() >= 4, "found {} features", features.len());
    }

    #[test]
    fn flat_image_yields_nothing() {
        let img = GrayImage::from_pixel(103, 50, image::Luma([128]));
        assert!(FeatureExtractor::new().extract(&img).is_empty());
    }

    #[test]
    fn extraction_is_deterministic() {
        let img = dot_image(&[(15, 12), (30, 35), (55, 20), (90, 40)]);
        let extractor = FeatureExtractor::new();
        let a = extractor.extract(&img);
        let b = extractor.extract(&img);
        assert_eq!(a.len(), b.len());
        for ((ka, da), (kb, db)) in a.iter().zip(b.iter()) {
            assert_eq!((ka.x, ka.y), (kb.x, kb.y));
            assert_eq!(da, db);
        }
    }

    #[test]
    fn descriptors_are_unit_length() {
        let img = dot_image(&[(25, 25), (70, 18)]);
        for (_, desc) in FeatureExtractor::new().extract(&img) {
            assert_eq!(desc.len(), DESCRIPTOR_LEN);
            let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "norm was {}", norm);
        }
    }

    #[test]
    fn translated_dot_keeps_descriptor() {
        let a = dot_image(&[(30, 20)]);
        let b = dot_image(&[(50, 28)]);
        let extractor = FeatureExtractor::new();
        let fa = extractor.extract(&a);
        let fb = extractor.extract(&b);
        assert!(!fa.is_empty() && !fb.is_empty());
        // Best cross-distance should be tiny: same local structure.
        let best = fa
            .iter()
            .flat_map(|(_, da)| fb.iter().map(move |(_, db)| distance_sq(da, db)))
            .fold(f32::MAX, f32::min);
        assert!(best < 0.1, "best distance {}", best);
    }
}
