//! End-to-end behavior of the matching engine and the device session layer.

use ridgeline::core::features::{Descriptor, Keypoint, DESCRIPTOR_LEN};
use ridgeline::core::SimilarityTransform;
use ridgeline::sensor::FrameScript;
use ridgeline::{
    Config, ConnId, Device, MatchEngine, RidgelineError, StaticAuthority, Template, TemplateStore,
};
use std::sync::Arc;

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

fn descriptor(tag: usize) -> Descriptor {
    let mut d = vec![0.0f32; DESCRIPTOR_LEN];
    d[tag % DESCRIPTOR_LEN] = 1.0;
    d[(tag / DESCRIPTOR_LEN + 1) % DESCRIPTOR_LEN] += 0.5;
    let norm = d.iter().map(|v| v * v).sum::<f32>().sqrt();
    d.iter_mut().for_each(|v| *v /= norm);
    d
}

/// `n` scattered keypoints with distinct descriptors, tags offset by `base`.
fn synthetic_template(n: usize, base: usize) -> Template {
    let keypoints = (0..n)
        .map(|i| {
            let x = ((i * 29 + 13) % 90 + 5) as f32;
            let y = ((i * 17 + 7) % 40 + 5) as f32;
            keypoint_at(x, y)
        })
        .collect();
    let descriptors = (0..n).map(|i| descriptor(base + i)).collect();
    Template {
        keypoints,
        descriptors,
    }
}

fn live_features(
    template: &Template,
    transform: &SimilarityTransform,
) -> Vec<(Keypoint, Descriptor)> {
    template
        .keypoints
        .iter()
        .zip(template.descriptors.iter())
        .map(|(kp, d)| {
            let (x, y) = transform.apply((kp.x, kp.y));
            (keypoint_at(x, y), d.clone())
        })
        .collect()
}

fn engine_at(dir: &std::path::Path) -> MatchEngine {
    let store = TemplateStore::new(dir.to_path_buf()).unwrap();
    MatchEngine::new(store, Config::default()).unwrap()
}

#[test]
fn enroll_then_verify_under_rigid_transform() {
    let dir = tempfile::tempdir().unwrap();
    let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
    let template = synthetic_template(32, 0);
    store
        .append_templates("alice_right-index", vec![template.clone()])
        .unwrap();
    let engine = MatchEngine::new(store, Config::default()).unwrap();

    let rigid = SimilarityTransform {
        a: 0.2f32.cos(),
        b: 0.2f32.sin(),
        tx: 8.0,
        ty: -4.0,
    };
    let (subject, score) = engine.verify_features(&live_features(&template, &rigid)).unwrap();
    assert_eq!(subject.as_deref(), Some("alice_right-index"));
    assert!(score > 15, "score was {}", score);
}

#[test]
fn under_four_features_never_matches() {
    let dir = tempfile::tempdir().unwrap();
    let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
    store
        .append_templates("alice_right-index", vec![synthetic_template(32, 0)])
        .unwrap();
    let engine = MatchEngine::new(store, Config::default()).unwrap();

    let tiny = synthetic_template(3, 0);
    let live = live_features(&tiny, &SimilarityTransform::IDENTITY);
    assert_eq!(engine.verify_features(&live).unwrap(), (None, 0));
}

#[test]
fn appending_templates_keeps_old_ones_matchable() {
    let dir = tempfile::tempdir().unwrap();
    let first = synthetic_template(24, 0);
    {
        let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
        store
            .append_templates("alice_right-index", vec![first.clone()])
            .unwrap();
    }

    // Second enrollment batch appends; the subject's template count grows.
    let engine = engine_at(dir.path());
    let second = synthetic_template(24, 300);
    {
        let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
        store
            .append_templates("alice_right-index", vec![second.clone()])
            .unwrap();
    }
    engine.rebuild_index().unwrap();

    let record = engine
        .subjects()
        .unwrap()
        .into_iter()
        .find(|r| r.subject_id == "alice_right-index")
        .unwrap();
    assert_eq!(record.templates.len(), 2);

    for template in [&first, &second] {
        let live = live_features(template, &SimilarityTransform::IDENTITY);
        let (subject, _) = engine.verify_features(&live).unwrap();
        assert_eq!(subject.as_deref(), Some("alice_right-index"));
    }
}

#[test]
fn deleted_subject_stops_matching_and_listing() {
    let dir = tempfile::tempdir().unwrap();
    let template = synthetic_template(24, 0);
    let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
    store
        .append_templates("alice_right-index", vec![template.clone()])
        .unwrap();
    let engine = MatchEngine::new(store, Config::default()).unwrap();

    let live = live_features(&template, &SimilarityTransform::IDENTITY);
    assert!(engine.verify_features(&live).unwrap().0.is_some());

    assert!(engine.delete_subject("alice_right-index").unwrap());
    assert_eq!(engine.verify_features(&live).unwrap(), (None, 0));
    assert!(engine.list_fingers("alice").unwrap().is_empty());

    // Deleting again is a no-op, not an error.
    assert!(!engine.delete_subject("alice_right-index").unwrap());
}

#[test]
fn corrupt_unit_does_not_block_other_subjects() {
    let dir = tempfile::tempdir().unwrap();
    let template = synthetic_template(24, 0);
    let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
    store
        .append_templates("alice_right-index", vec![template.clone()])
        .unwrap();
    std::fs::write(dir.path().join("bob_left-thumb.bincode"), b"not bincode").unwrap();

    let engine = engine_at(dir.path());
    let live = live_features(&template, &SimilarityTransform::IDENTITY);
    let (subject, _) = engine.verify_features(&live).unwrap();
    assert_eq!(subject.as_deref(), Some("alice_right-index"));
}

#[test]
fn rebuilding_twice_answers_identically() {
    let dir = tempfile::tempdir().unwrap();
    let template = synthetic_template(24, 0);
    let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
    store
        .append_templates("alice_right-index", vec![template.clone()])
        .unwrap();
    let engine = MatchEngine::new(store, Config::default()).unwrap();

    let live = live_features(
        &template,
        &SimilarityTransform {
            a: 1.0,
            b: 0.0,
            tx: 3.0,
            ty: 1.0,
        },
    );
    let first = engine.verify_features(&live).unwrap();
    engine.rebuild_index().unwrap();
    engine.rebuild_index().unwrap();
    let second = engine.verify_features(&live).unwrap();
    assert_eq!(first.0, second.0);
}

#[test]
fn claims_are_exclusive_across_the_device_api() {
    let dir = tempfile::tempdir().unwrap();
    let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
    let config = Config::default();
    let engine = Arc::new(MatchEngine::new(store, config.clone()).unwrap());
    let device = Device::spawn(
        engine,
        Arc::new(FrameScript::new([])),
        Arc::new(StaticAuthority::allow_all()),
        config,
    );
    let handle = device.handle();

    handle.claim("alice", ConnId(1)).unwrap();
    assert!(matches!(
        handle.claim("bob", ConnId(2)),
        Err(RidgelineError::AlreadyInUse)
    ));

    // Ungraceful exit of the owner frees the device for the next claim.
    handle.connection_closed(ConnId(1));
    handle.claim("bob", ConnId(2)).unwrap();
    handle.release(ConnId(2)).unwrap();
}
