use rand::Rng;

/// Rotation + uniform scale + translation:
/// x' = a*x - b*y + tx, y' = b*x + a*y + ty.
///
/// A contact sensor cannot produce perspective warp, so the 4-DOF model is
/// the right fit class and needs only a 2-point minimal sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn apply(&self, p: (f32, f32)) -> (f32, f32) {
        (
            self.a * p.0 - self.b * p.1 + self.tx,
            self.b * p.0 + self.a * p.1 + self.ty,
        )
    }

    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    pub fn rotation(&self) -> f32 {
        self.b.atan2(self.a)
    }

    /// Exact fit from two correspondences. None when the source pair is
    /// (near-)coincident.
    fn from_two(src: [(f32, f32); 2], dst: [(f32, f32); 2]) -> Option<Self> {
        let dp = (src[1].0 - src[0].0, src[1].1 - src[0].1);
        let dq = (dst[1].0 - dst[0].0, dst[1].1 - dst[0].1);
        let norm = dp.0 * dp.0 + dp.1 * dp.1;
        if norm < 1e-6 {
            return None;
        }
        let a = (dq.0 * dp.0 + dq.1 * dp.1) / norm;
        let b = (dq.1 * dp.0 - dq.0 * dp.1) / norm;
        let tx = dst[0].0 - (a * src[0].0 - b * src[0].1);
        let ty = dst[0].1 - (b * src[0].0 + a * src[0].1);
        Some(Self { a, b, tx, ty })
    }

    /// Least-squares fit over all given correspondences.
    fn fit(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len();
        if n < 2 {
            return None;
        }
        let nf = n as f32;
        let mp = src.iter().fold((0.0, 0.0), |m, p| (m.0 + p.0, m.1 + p.1));
        let mq = dst.iter().fold((0.0, 0.0), |m, p| (m.0 + p.0, m.1 + p.1));
        let mp = (mp.0 / nf, mp.1 / nf);
        let mq = (mq.0 / nf, mq.1 / nf);

        let mut sxx = 0.0f32;
        let mut num_a = 0.0f32;
        let mut num_b = 0.0f32;
        for (p, q) in src.iter().zip(dst.iter()) {
            let px = p.0 - mp.0;
            let py = p.1 - mp.1;
            let qx = q.0 - mq.0;
            let qy = q.1 - mq.1;
            sxx += px * px + py * py;
            num_a += qx * px + qy * py;
            num_b += qy * px - qx * py;
        }
        if sxx < 1e-6 {
            return None;
        }
        let a = num_a / sxx;
        let b = num_b / sxx;
        Some(Self {
            a,
            b,
            tx: mq.0 - (a * mp.0 - b * mp.1),
            ty: mq.1 - (b * mp.0 + a * mp.1),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RansacFit {
    pub transform: SimilarityTransform,
    pub inlier_mask: Vec<bool>,
    pub inliers: usize,
}

/// Robust similarity estimation between correspondence point sets. Samples
/// 2-point models, scores by reprojection distance, refits on the winning
/// inlier set. Returns None when no model reaches 2 inliers or the input is
/// too small to constrain one.
pub fn ransac_similarity<R: Rng>(
    src: &[(f32, f32)],
    dst: &[(f32, f32)],
    iterations: usize,
    threshold: f32,
    rng: &mut R,
) -> Option<RansacFit> {
    assert_eq!(src.len(), dst.len());
    let n = src.len();
    if n < 2 {
        return None;
    }

    let threshold_sq = threshold * threshold;
    let mut best: Option<RansacFit> = None;

    for _ in 0..iterations {
        let i = rng.gen_range(0..n);
        let mut j = rng.gen_range(0..n);
        if j == i {
            j = (j + 1) % n;
        }
        let model = match SimilarityTransform::from_two([src[i], src[j]], [dst[i], dst[j]]) {
            Some(m) => m,
            None => continue,
        };

        let mask: Vec<bool> = src
            .iter()
            .zip(dst.iter())
            .map(|(&p, &q)| {
                let (px, py) = model.apply(p);
                let dx = px - q.0;
                let dy = py - q.1;
                dx * dx + dy * dy <= threshold_sq
            })
            .collect();
        let inliers = mask.iter().filter(|&&m| m).count();

        if inliers >= 2 && best.as_ref().map_or(true, |b| inliers > b.inliers) {
            best = Some(RansacFit {
                transform: model,
                inlier_mask: mask,
                inliers,
            });
        }
    }

    // Refit on the consensus set for a tighter final transform.
    if let Some(fit) = best.as_mut() {
        let (in_src, in_dst): (Vec<_>, Vec<_>) = src
            .iter()
            .zip(dst.iter())
            .zip(fit.inlier_mask.iter())
            .filter(|(_, &m)| m)
            .map(|((p, q), _)| (*p, *q))
            .unzip();
        if let Some(refined) = SimilarityTransform::fit(&in_src, &in_dst) {
            let mask: Vec<bool> = src
                .iter()
                .zip(dst.iter())
                .map(|(&p, &q)| {
                    let (px, py) = refined.apply(p);
                    let dx = px - q.0;
                    let dy = py - q.1;
                    dx * dx + dy * dy <= threshold_sq
                })
                .collect();
            let inliers = mask.iter().filter(|&&m| m).count();
            if inliers >= fit.inliers {
                fit.transform = refined;
                fit.inlier_mask = mask;
                fit.inliers = inliers;
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn apply_all(t: &SimilarityTransform, pts: &[(f32, f32)]) -> Vec<(f32, f32)> {
        pts.iter().map(|&p| t.apply(p)).collect()
    }

    fn cloud(n: usize) -> Vec<(f32, f32)> {
        // Deterministic scatter without pulling in a distribution.
        (0..n)
            .map(|i| {
                let x = ((i * 37 + 11) % 97) as f32;
                let y = ((i * 53 + 29) % 43) as f32;
                (x, y)
            })
            .collect()
    }

    #[test]
    fn recovers_rotation_translation() {
        let src = cloud(40);
        let truth = SimilarityTransform {
            a: 0.25f32.cos(),
            b: 0.25f32.sin(),
            tx: 7.5,
            ty: -3.0,
        };
        let dst = apply_all(&truth, &src);

        let mut rng = StdRng::seed_from_u64(7);
        let fit = ransac_similarity(&src, &dst, 100, 2.0, &mut rng).unwrap();
        assert_eq!(fit.inliers, 40);
        assert!((fit.transform.rotation() - 0.25).abs() < 1e-3);
        assert!((fit.transform.scale() - 1.0).abs() < 1e-3);
        assert!((fit.transform.tx - 7.5).abs() < 0.1);
    }

    #[test]
    fn discards_outliers() {
        let src = cloud(30);
        let truth = SimilarityTransform {
            a: 1.0,
            b: 0.0,
            tx: 5.0,
            ty: 2.0,
        };
        let mut dst = apply_all(&truth, &src);
        // Corrupt a third of the correspondences.
        for (i, q) in dst.iter_mut().enumerate() {
            if i % 3 == 0 {
                q.0 += 40.0;
                q.1 -= 25.0;
            }
        }

        let mut rng = StdRng::seed_from_u64(11);
        let fit = ransac_similarity(&src, &dst, 200, 2.0, &mut rng).unwrap();
        assert_eq!(fit.inliers, 20);
        for (i, &inlier) in fit.inlier_mask.iter().enumerate() {
            assert_eq!(inlier, i % 3 != 0);
        }
    }

    #[test]
    fn too_few_points_is_none() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(ransac_similarity(&[(1.0, 1.0)], &[(2.0, 2.0)], 50, 2.0, &mut rng).is_none());
    }

    #[test]
    fn coincident_points_do_not_panic() {
        let src = vec![(5.0, 5.0); 6];
        let dst = vec![(9.0, 1.0); 6];
        let mut rng = StdRng::seed_from_u64(5);
        // Every minimal sample is degenerate; no model should come out.
        assert!(ransac_similarity(&src, &dst, 50, 2.0, &mut rng).is_none());
    }
}
