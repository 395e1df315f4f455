use crate::common::config::{Config, MatchStrategy};
use crate::common::Result;
use crate::core::features::{distance_sq, Descriptor, FeatureExtractor, Keypoint};
use crate::core::index::MatchIndex;
use crate::core::preprocess::preprocess;
use crate::core::ransac::ransac_similarity;
use crate::sensor::Frame;
use crate::storage::{SubjectRecord, Template, TemplateStore};
use std::sync::{Arc, Mutex, RwLock};

/// A geometric fit needs at least this many correspondences.
const MIN_FIT_POINTS: usize = 4;

/// True when `subject_id` belongs to `user`'s namespace.
pub fn subject_in_namespace(subject_id: &str, user: &str) -> bool {
    subject_id
        .strip_prefix(user)
        .map_or(false, |rest| rest.starts_with('_'))
}

/// The matching core: owns the template store, the feature extractor, and
/// the global index. Verification reads an index snapshot; mutations
/// rebuild a complete replacement off to the side and swap it in, so an
/// in-flight query never sees a partial index.
pub struct MatchEngine {
    store: TemplateStore,
    extractor: FeatureExtractor,
    config: Config,
    index: RwLock<Arc<MatchIndex>>,
    rebuild_lock: Mutex<()>,
}

impl MatchEngine {
    pub fn new(store: TemplateStore, config: Config) -> Result<Self> {
        let engine = Self {
            store,
            extractor: FeatureExtractor::new(),
            config,
            index: RwLock::new(Arc::new(MatchIndex::empty())),
            rebuild_lock: Mutex::new(()),
        };
        engine.rebuild_index()?;
        Ok(engine)
    }

    /// Current index snapshot. Queries run against whatever snapshot they
    /// started with, even while a rebuild swaps in a newer one.
    fn index_snapshot(&self) -> Arc<MatchIndex> {
        self.index.read().expect("index lock poisoned").clone()
    }

    /// Rebuild the index from the store. Concurrent rebuild requests
    /// serialize on the rebuild lock; the swap itself is atomic.
    pub fn rebuild_index(&self) -> Result<()> {
        let _guard = self.rebuild_lock.lock().expect("rebuild lock poisoned");
        let records = self.store.load_all()?;
        let fresh = MatchIndex::build(&records, self.config.matcher.index_checks);
        *self.index.write().expect("index lock poisoned") = Arc::new(fresh);
        Ok(())
    }

    /// Extract features from every frame, keep the ones that clear the
    /// quality gate, and append them as templates. False (and no change at
    /// all) when nothing survives the gate.
    pub fn enroll(&self, subject_id: &str, frames: &[Frame]) -> Result<bool> {
        let min_keypoints = self.config.enroll.min_keypoints;
        let mut templates = Vec::new();

        for (i, frame) in frames.iter().enumerate() {
            let img = preprocess(frame)?;
            let features = self.extractor.extract(&img);
            tracing::debug!("enroll frame {}: {} keypoints", i + 1, features.len());
            if features.len() <= min_keypoints {
                continue;
            }
            let (keypoints, descriptors): (Vec<Keypoint>, Vec<Descriptor>) =
                features.into_iter().unzip();
            templates.push(Template {
                keypoints,
                descriptors,
            });
        }

        if templates.is_empty() {
            tracing::info!("enrollment for {} produced no usable frames", subject_id);
            return Ok(false);
        }

        tracing::info!(
            "enrolling {} with {} template(s)",
            subject_id,
            templates.len()
        );
        self.store.append_templates(subject_id, templates)?;
        self.rebuild_index()?;
        Ok(true)
    }

    /// Match a live frame against the whole database.
    /// Returns `(subject id or none, inlier confidence)`.
    pub fn verify(&self, frame: &Frame) -> Result<(Option<String>, u32)> {
        let img = preprocess(frame)?;
        let features = self.extractor.extract(&img);
        self.verify_features(&features)
    }

    /// Match pre-extracted live features. Split out so callers that already
    /// ran extraction (or built features another way) can reuse the
    /// decision path.
    pub fn verify_features(
        &self,
        features: &[(Keypoint, Descriptor)],
    ) -> Result<(Option<String>, u32)> {
        if features.len() < MIN_FIT_POINTS {
            return Ok((None, 0));
        }
        match self.config.matcher.strategy {
            MatchStrategy::Indexed => self.verify_indexed(features),
            MatchStrategy::LinearScan => self.verify_linear(features),
        }
    }

    /// Stage one: global vote through the index. Stage two: geometric check
    /// on the top candidate only.
    fn verify_indexed(&self, features: &[(Keypoint, Descriptor)]) -> Result<(Option<String>, u32)> {
        let index = self.index_snapshot();
        if index.is_empty() {
            return Ok((None, 0));
        }

        let descriptors: Vec<Descriptor> = features.iter().map(|(_, d)| d.clone()).collect();
        let ranked = index.query_candidates(&descriptors, self.config.matcher.ratio_test);
        let Some(top) = ranked.first() else {
            return Ok((None, 0));
        };
        if top.votes < self.config.matcher.min_votes {
            return Ok((None, 0));
        }

        let src: Vec<(f32, f32)> = top
            .pairs
            .iter()
            .map(|&(live_idx, _)| {
                let kp = &features[live_idx].0;
                (kp.x, kp.y)
            })
            .collect();
        let dst: Vec<(f32, f32)> = top
            .pairs
            .iter()
            .map(|&(_, stored_idx)| {
                let kp = index.keypoint(stored_idx);
                (kp.x, kp.y)
            })
            .collect();

        let score = self.fit_score(&src, &dst);
        if score > self.config.matcher.min_inliers {
            tracing::debug!(
                subject = %top.subject_id,
                votes = top.votes,
                inliers = score,
                "verify accepted"
            );
            Ok((Some(top.subject_id.clone()), score as u32))
        } else {
            tracing::debug!(
                subject = %top.subject_id,
                votes = top.votes,
                inliers = score,
                "verify rejected by geometric check"
            );
            Ok((None, 0))
        }
    }

    /// Reference strategy: fit every template of every subject and keep the
    /// best score. O(subjects x templates), equivalent in outcome.
    fn verify_linear(&self, features: &[(Keypoint, Descriptor)]) -> Result<(Option<String>, u32)> {
        let records = self.store.load_all()?;
        let ratio_sq = self.config.matcher.ratio_test * self.config.matcher.ratio_test;

        let mut best_score = 0usize;
        let mut best_subject: Option<String> = None;

        for record in &records {
            for template in &record.templates {
                if template.descriptors.len() < 2 {
                    continue;
                }
                let mut src = Vec::new();
                let mut dst = Vec::new();
                for (kp, descriptor) in features {
                    if let Some((nearest, d1, d2)) = two_nearest_in(template, descriptor) {
                        if d1 < ratio_sq * d2 {
                            src.push((kp.x, kp.y));
                            let stored = &template.keypoints[nearest];
                            dst.push((stored.x, stored.y));
                        }
                    }
                }
                if src.len() < MIN_FIT_POINTS {
                    continue;
                }
                let score = self.fit_score(&src, &dst);
                if score > best_score {
                    best_score = score;
                    best_subject = Some(record.subject_id.clone());
                }
            }
        }

        if best_score > self.config.matcher.min_inliers {
            Ok((best_subject, best_score as u32))
        } else {
            Ok((None, 0))
        }
    }

    fn fit_score(&self, src: &[(f32, f32)], dst: &[(f32, f32)]) -> usize {
        let mut rng = rand::thread_rng();
        ransac_similarity(
            src,
            dst,
            self.config.matcher.ransac_iterations,
            self.config.matcher.ransac_threshold,
            &mut rng,
        )
        .map_or(0, |fit| fit.inliers)
    }

    pub fn delete_subject(&self, subject_id: &str) -> Result<bool> {
        let removed = self.store.delete_subject(subject_id)?;
        if removed {
            self.rebuild_index()?;
        }
        Ok(removed)
    }

    pub fn delete_user(&self, user: &str) -> Result<usize> {
        let removed = self.store.delete_user(user)?;
        if removed > 0 {
            self.rebuild_index()?;
        }
        Ok(removed)
    }

    pub fn list_fingers(&self, user: &str) -> Result<Vec<String>> {
        self.store.list_fingers(user)
    }

    /// Subjects currently on disk; corrupt units already filtered.
    pub fn subjects(&self) -> Result<Vec<SubjectRecord>> {
        self.store.load_all()
    }
}

/// Nearest and second-nearest stored descriptor within one template, as
/// (index, d1, d2) squared distances.
fn two_nearest_in(template: &Template, query: &Descriptor) -> Option<(usize, f32, f32)> {
    let mut best = (usize::MAX, f32::MAX);
    let mut second = f32::MAX;
    for (i, stored) in template.descriptors.iter().enumerate() {
        let d = distance_sq(query, stored);
        if d < best.1 {
            second = best.1;
            best = (i, d);
        } else if d < second {
            second = d;
        }
    }
    if best.0 == usize::MAX || second == f32::MAX {
        None
    } else {
        Some((best.0, best.1, second))
    }
}
