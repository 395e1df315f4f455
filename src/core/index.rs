use crate::core::features::{distance_sq, Descriptor, Keypoint};
use crate::storage::SubjectRecord;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

const LEAF_SIZE: usize = 8;

/// Maps a contiguous span of the backing array back to its owning template.
#[derive(Debug, Clone)]
pub struct IndexRange {
    pub subject_id: String,
    pub template_index: usize,
    pub start: usize,
    pub end: usize,
}

/// One ranked candidate from the voting stage, with the matched pairs kept
/// for geometric verification.
#[derive(Debug, Clone)]
pub struct CandidateVotes {
    pub subject_id: String,
    pub template_index: usize,
    pub votes: usize,
    /// (live feature index, backing-array index) per good match.
    pub pairs: Vec<(usize, usize)>,
}

/// Rebuildable search structure over every enrolled descriptor. Built
/// wholesale from the template store, never edited in place; readers hold a
/// snapshot and a rebuild swaps in a complete replacement.
pub struct MatchIndex {
    descriptors: Vec<Descriptor>,
    keypoints: Vec<Keypoint>,
    ranges: Vec<IndexRange>,
    tree: Option<KdNode>,
    checks: usize,
}

impl MatchIndex {
    pub fn empty() -> Self {
        Self {
            descriptors: Vec::new(),
            keypoints: Vec::new(),
            ranges: Vec::new(),
            tree: None,
            checks: 0,
        }
    }

    /// Walk every subject, template, and descriptor into one contiguous
    /// backing array and build the search tree over it.
    pub fn build(records: &[SubjectRecord], checks: usize) -> Self {
        let mut descriptors = Vec::new();
        let mut keypoints = Vec::new();
        let mut ranges = Vec::new();

        for record in records {
            for (template_index, template) in record.templates.iter().enumerate() {
                let start = descriptors.len();
                descriptors.extend(template.descriptors.iter().cloned());
                keypoints.extend(template.keypoints.iter().copied());
                ranges.push(IndexRange {
                    subject_id: record.subject_id.clone(),
                    template_index,
                    start,
                    end: descriptors.len(),
                });
            }
        }

        let tree = if descriptors.is_empty() {
            None
        } else {
            let mut indices: Vec<usize> = (0..descriptors.len()).collect();
            Some(KdNode::build(&descriptors, &mut indices))
        };

        tracing::debug!(
            descriptors = descriptors.len(),
            templates = ranges.len(),
            "match index rebuilt"
        );

        Self {
            descriptors,
            keypoints,
            ranges,
            tree,
            checks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn keypoint(&self, index: usize) -> &Keypoint {
        &self.keypoints[index]
    }

    fn owner_of(&self, index: usize) -> &IndexRange {
        let pos = self
            .ranges
            .partition_point(|r| r.end <= index)
            .min(self.ranges.len() - 1);
        &self.ranges[pos]
    }

    /// Two nearest neighbors of `query` as (index, squared distance),
    /// nearest first. None unless the array holds at least two entries.
    pub fn two_nearest(&self, query: &[f32]) -> Option<((usize, f32), (usize, f32))> {
        if self.descriptors.len() < 2 {
            return None;
        }
        let tree = self.tree.as_ref()?;

        let mut best = (usize::MAX, f32::MAX);
        let mut second = (usize::MAX, f32::MAX);
        let mut visited = 0usize;

        // Best-first traversal; the budget bounds exactness.
        let mut queue = BinaryHeap::new();
        queue.push(QueueEntry {
            bound: 0.0,
            node: tree,
        });

        while let Some(QueueEntry { bound, node }) = queue.pop() {
            if bound > second.1 || visited >= self.checks.max(2 * LEAF_SIZE) {
                break;
            }
            match node {
                KdNode::Leaf { indices } => {
                    for &idx in indices {
                        let d = distance_sq(query, &self.descriptors[idx]);
                        visited += 1;
                        if d < best.1 {
                            second = best;
                            best = (idx, d);
                        } else if d < second.1 {
                            second = (idx, d);
                        }
                    }
                }
                KdNode::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    let delta = query[*dim] - value;
                    let (near, far) = if delta <= 0.0 {
                        (left, right)
                    } else {
                        (right, left)
                    };
                    queue.push(QueueEntry { bound, node: near });
                    queue.push(QueueEntry {
                        bound: bound + delta * delta,
                        node: far,
                    });
                }
            }
        }

        if second.0 == usize::MAX {
            None
        } else {
            Some((best, second))
        }
    }

    /// Vote for owning templates via the ratio test and rank candidates by
    /// vote count, first-seen order breaking ties.
    pub fn query_candidates(&self, live: &[Descriptor], ratio: f32) -> Vec<CandidateVotes> {
        if self.is_empty() {
            return Vec::new();
        }
        let ratio_sq = ratio * ratio;

        let mut order: Vec<(String, usize)> = Vec::new();
        let mut tally: std::collections::HashMap<(String, usize), CandidateVotes> =
            std::collections::HashMap::new();

        for (live_idx, descriptor) in live.iter().enumerate() {
            let Some(((best_idx, d1), (_, d2))) = self.two_nearest(descriptor) else {
                continue;
            };
            if d1 >= ratio_sq * d2 {
                continue;
            }
            let owner = self.owner_of(best_idx);
            let key = (owner.subject_id.clone(), owner.template_index);
            let entry = tally.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                CandidateVotes {
                    subject_id: owner.subject_id.clone(),
                    template_index: owner.template_index,
                    votes: 0,
                    pairs: Vec::new(),
                }
            });
            entry.votes += 1;
            entry.pairs.push((live_idx, best_idx));
        }

        let mut ranked: Vec<CandidateVotes> = order
            .into_iter()
            .filter_map(|key| tally.remove(&key))
            .collect();
        ranked.sort_by(|a, b| b.votes.cmp(&a.votes));
        ranked
    }
}

enum KdNode {
    Split {
        dim: usize,
        value: f32,
        left: Box<KdNode>,
        right: Box<KdNode>,
    },
    Leaf {
        indices: Vec<usize>,
    },
}

impl KdNode {
    fn build(descriptors: &[Descriptor], indices: &mut [usize]) -> Self {
        if indices.len() <= LEAF_SIZE {
            return KdNode::Leaf {
                indices: indices.to_vec(),
            };
        }

        let dim = max_variance_dim(descriptors, indices);
        // Median split, ties broken by index so rebuilds are identical.
        indices.sort_unstable_by(|&a, &b| {
            descriptors[a][dim]
                .partial_cmp(&descriptors[b][dim])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        let mid = indices.len() / 2;
        let value = descriptors[indices[mid]][dim];
        let (left, right) = indices.split_at_mut(mid);
        if left.is_empty() || right.is_empty() {
            return KdNode::Leaf {
                indices: indices.to_vec(),
            };
        }
        KdNode::Split {
            dim,
            value,
            left: Box::new(KdNode::build(descriptors, left)),
            right: Box::new(KdNode::build(descriptors, right)),
        }
    }
}

fn max_variance_dim(descriptors: &[Descriptor], indices: &[usize]) -> usize {
    let dims = descriptors[indices[0]].len();
    let n = indices.len() as f32;
    let mut best_dim = 0;
    let mut best_var = -1.0f32;
    for d in 0..dims {
        let mean = indices.iter().map(|&i| descriptors[i][d]).sum::<f32>() / n;
        let var = indices
            .iter()
            .map(|&i| {
                let v = descriptors[i][d] - mean;
                v * v
            })
            .sum::<f32>()
            / n;
        if var > best_var {
            best_var = var;
            best_dim = d;
        }
    }
    best_dim
}

struct QueueEntry<'a> {
    bound: f32,
    node: &'a KdNode,
}

impl PartialEq for QueueEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.bound == other.bound
    }
}
impl Eq for QueueEntry<'_> {}
impl PartialOrd for QueueEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on the bound.
        other
            .bound
            .partial_cmp(&self.bound)
            .unwrap_or(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Template;

    fn basis_descriptor(hot: usize, value: f32) -> Descriptor {
        let mut d = vec![0.0f32; crate::core::features::DESCRIPTOR_LEN];
        let idx = hot % d.len();
        d[idx] = value;
        d
    }

    fn keypoint_at(x: f32, y: f32) -> Keypoint {
        Keypoint {
            x,
            y,
            size: 16.0,
            angle: 0.0,
            response: 1.0,
            octave: 0,
            class_id: -1,
        }
    }

    fn record(subject_id: &str, templates: Vec<Template>) -> SubjectRecord {
        SubjectRecord {
            version: 1,
            subject_id: subject_id.to_string(),
            templates,
        }
    }

    fn template(seed: usize, count: usize) -> Template {
        let keypoints = (0..count)
            .map(|i| keypoint_at((seed * 10 + i) as f32, i as f32))
            .collect();
        let descriptors = (0..count)
            .map(|i| basis_descriptor(seed * 17 + i, 1.0))
            .collect();
        Template {
            keypoints,
            descriptors,
        }
    }

    #[test]
    fn empty_index_short_circuits() {
        let index = MatchIndex::empty();
        assert!(index.is_empty());
        assert!(index
            .query_candidates(&[basis_descriptor(0, 1.0)], 0.75)
            .is_empty());
    }

    #[test]
    fn votes_go_to_owning_subject() {
        let records = vec![
            record("alice_right-index", vec![template(0, 8)]),
            record("bob_left-thumb", vec![template(3, 8)]),
        ];
        let index = MatchIndex::build(&records, 256);

        // Query with alice's exact descriptors: each has a zero-distance
        // nearest neighbor, so every vote lands on her template.
        let live: Vec<Descriptor> = (0..8).map(|i| basis_descriptor(i, 1.0)).collect();
        let ranked = index.query_candidates(&live, 0.75);
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].subject_id, "alice_right-index");
        assert_eq!(ranked[0].votes, 8);
        assert_eq!(ranked[0].pairs.len(), 8);
    }

    #[test]
    fn range_map_recovers_template_index() {
        let records = vec![record("carol_right-thumb", vec![template(0, 4), template(5, 4)])];
        let index = MatchIndex::build(&records, 256);
        let live = vec![basis_descriptor(5 * 17, 1.0)];
        let ranked = index.query_candidates(&live, 0.75);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].template_index, 1);
    }

    #[test]
    fn ambiguous_matches_are_rejected() {
        // Two identical descriptors in the store: d1 == d2, ratio test
        // must reject the query as ambiguous.
        let t = Template {
            keypoints: vec![keypoint_at(1.0, 1.0), keypoint_at(2.0, 2.0)],
            descriptors: vec![basis_descriptor(0, 1.0), basis_descriptor(0, 1.0)],
        };
        let index = MatchIndex::build(&[record("dave_left-index", vec![t])], 256);
        let ranked = index.query_candidates(&[basis_descriptor(0, 1.0)], 0.75);
        assert!(ranked.is_empty());
    }

    #[test]
    fn rebuild_is_idempotent() {
        let records = vec![
            record("alice_right-index", vec![template(0, 8)]),
            record("bob_left-thumb", vec![template(3, 8)]),
        ];
        let a = MatchIndex::build(&records, 256);
        let b = MatchIndex::build(&records, 256);
        let live: Vec<Descriptor> = (0..12).map(|i| basis_descriptor(i, 0.9)).collect();
        let ra = a.query_candidates(&live, 0.8);
        let rb = b.query_candidates(&live, 0.8);
        assert_eq!(ra.len(), rb.len());
        for (ca, cb) in ra.iter().zip(rb.iter()) {
            assert_eq!(ca.subject_id, cb.subject_id);
            assert_eq!(ca.votes, cb.votes);
            assert_eq!(ca.pairs, cb.pairs);
        }
    }

    #[test]
    fn single_descriptor_store_gives_no_pairs() {
        let t = Template {
            keypoints: vec![keypoint_at(1.0, 1.0)],
            descriptors: vec![basis_descriptor(0, 1.0)],
        };
        let index = MatchIndex::build(&[record("erin_right-little", vec![t])], 256);
        assert!(index
            .query_candidates(&[basis_descriptor(0, 1.0)], 0.75)
            .is_empty());
    }
}
