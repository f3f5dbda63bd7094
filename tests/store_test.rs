// tests/store_test.rs — Integration test: lineage store invariants (SQLite)

mod common;

use chrono::Utc;
use pretty_assertions::assert_eq;

use imgrefine::core::orchestrator::register_scene;
use imgrefine::core::types::*;
use imgrefine::infra::config::GenerationConfig;
use imgrefine::infra::errors::PipelineError;
use imgrefine::learner::types::{FailurePatterns, Learning, LearningStatus, ScoreDistribution};
use imgrefine::memory::store::{ts, ApiCallRow, IterationCommit, Store};
use imgrefine::memory::{LineageDb, SharedStore};

fn shared() -> SharedStore {
    LineageDb::in_memory().unwrap().shared()
}

fn imported(store: &SharedStore, label: &str) -> PromptVersion {
    register_scene(
        store,
        &common::scene_input(label, &format!("{label} on a hill")),
        PromptStatus::Imported,
    )
    .unwrap()
    .unwrap()
}

fn variant(version: &PromptVersion, index: u32) -> Variant {
    Variant {
        id: uuid::Uuid::new_v4().to_string(),
        prompt_version_id: version.id.clone(),
        variant_index: index,
        storage_locator: format!("/images/{}_v{index}.png", version.id),
        params: GenerationParams::new(&GenerationConfig::default(), None, "p".into()),
        width: 1024,
        height: 768,
        content_type: "image/png".into(),
        created_at: Utc::now(),
    }
}

fn evaluation(variant: &Variant, adherence: f64, description: &str) -> Evaluation {
    Evaluation {
        id: uuid::Uuid::new_v4().to_string(),
        variant_id: variant.id.clone(),
        description: description.into(),
        dimensions: DimensionScores::neutral(),
        missing_elements: vec!["moon".into()],
        unwanted_elements: Vec::new(),
        style_issues: Vec::new(),
        adherence,
        passed: adherence >= 0.7,
        incomplete: false,
        failed: false,
        extra: Default::default(),
        evaluator: "test".into(),
        created_at: Utc::now(),
    }
}

fn learning(version: &PromptVersion, parent: Option<&Learning>, status: LearningStatus) -> Learning {
    Learning {
        id: uuid::Uuid::new_v4().to_string(),
        scene_id: version.scene_id.clone(),
        prompt_version_id: version.id.clone(),
        parent_learning_id: parent.map(|p| p.id.clone()),
        patterns: FailurePatterns {
            failed_terms: Vec::new(),
            common_artifacts: Vec::new(),
            style_violations: Vec::new(),
            score_distribution: ScoreDistribution::from_scores(&[0.2, 0.4]),
        },
        status,
        extra: Default::default(),
        created_at: Utc::now(),
    }
}

/// Claim and move to `evaluating` with one evaluated variant.
fn evaluating(s: &Store, version: &PromptVersion, worker: &str, score: f64) -> BestCandidate {
    s.claim(&version.id, worker).unwrap().unwrap();
    let v = variant(version, 0);
    s.insert_variant(&v).unwrap();
    let e = evaluation(&v, score, "x");
    s.insert_evaluation(&e).unwrap();
    s.transition(
        &version.id,
        worker,
        PromptStatus::Generating,
        PromptStatus::Evaluating,
        None,
    )
    .unwrap();
    BestCandidate {
        version_id: version.id.clone(),
        variant_id: v.id,
        evaluation_id: e.id,
        iteration: version.iteration,
        score,
    }
}

// ─── Scenes ─────────────────────────────────────────────────────────────────

#[test]
fn test_scene_identity_is_deduplicated() {
    let store = shared();
    let first = imported(&store, "mill");
    let again = register_scene(
        &store,
        &common::scene_input("other-label", "mill on a hill"),
        PromptStatus::Imported,
    )
    .unwrap();
    assert!(again.is_none());

    let s = store.lock().unwrap();
    assert_eq!(s.list_scenes().unwrap().len(), 1);
    assert_eq!(first.iteration, 0);
    let by_prefix = s.find_scene(&first.scene_id[..10]).unwrap().unwrap();
    assert_eq!(by_prefix.label, "mill");
}

#[test]
fn test_empty_description_rejected() {
    let store = shared();
    let err = register_scene(
        &store,
        &common::scene_input("blank", "   "),
        PromptStatus::Draft,
    )
    .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}

// ─── Claims and transitions ─────────────────────────────────────────────────

#[test]
fn test_claim_is_compare_and_set() {
    let store = shared();
    let v = imported(&store, "bridge");
    let s = store.lock().unwrap();

    let won = s.claim(&v.id, "w1").unwrap().unwrap();
    assert_eq!(won.status, PromptStatus::Generating);
    assert_eq!(won.claimed_by.as_deref(), Some("w1"));
    assert_eq!(won.claimed_from, Some(PromptStatus::Imported));
    assert!(s.claim(&v.id, "w2").unwrap().is_none());
    assert!(s.eligible_versions(10).unwrap().is_empty());
}

#[test]
fn test_transition_requires_holder_and_legal_edge() {
    let store = shared();
    let v = imported(&store, "castle");
    let s = store.lock().unwrap();
    s.claim(&v.id, "w1").unwrap().unwrap();

    let lost = s
        .transition(&v.id, "w2", PromptStatus::Generating, PromptStatus::Evaluating, None)
        .unwrap_err();
    assert!(matches!(lost, PipelineError::ClaimLost { .. }));

    let illegal = s
        .transition(&v.id, "w1", PromptStatus::Generating, PromptStatus::NeedsRefinement, None)
        .unwrap_err();
    assert!(matches!(illegal, PipelineError::InvalidTransition { .. }));

    s.transition(&v.id, "w1", PromptStatus::Generating, PromptStatus::Error, Some("boom"))
        .unwrap();
    let stored = s.get_version(&v.id).unwrap().unwrap();
    assert_eq!(stored.status, PromptStatus::Error);
    assert_eq!(stored.failure_cause.as_deref(), Some("boom"));
    assert!(stored.claimed_by.is_none());
}

#[test]
fn test_sweep_reverts_only_stale_claims() {
    let store = shared();
    let stale = imported(&store, "stale");
    let fresh = imported(&store, "fresh");
    let s = store.lock().unwrap();
    s.claim(&stale.id, "dead").unwrap().unwrap();
    s.claim(&fresh.id, "alive").unwrap().unwrap();
    s.conn()
        .execute(
            "UPDATE prompt_versions SET claimed_at = ?1 WHERE id = ?2",
            rusqlite::params![ts(Utc::now() - chrono::Duration::hours(2)), stale.id],
        )
        .unwrap();

    let reverted = s
        .sweep_stale_claims(Utc::now() - chrono::Duration::minutes(15))
        .unwrap();
    assert_eq!(reverted, vec![stale.id.clone()]);

    let back = s.get_version(&stale.id).unwrap().unwrap();
    assert_eq!(back.status, PromptStatus::Imported);
    assert!(back.claimed_by.is_none());
    let still = s.get_version(&fresh.id).unwrap().unwrap();
    assert_eq!(still.status, PromptStatus::Generating);
}

#[test]
fn test_release_claim_restores_claimed_from() {
    let store = shared();
    let v = imported(&store, "quarry");
    let s = store.lock().unwrap();
    s.claim(&v.id, "w1").unwrap().unwrap();

    assert!(!s.release_claim(&v.id, "w2").unwrap());
    assert_eq!(
        s.get_version(&v.id).unwrap().unwrap().status,
        PromptStatus::Generating
    );

    assert!(s.release_claim(&v.id, "w1").unwrap());
    let back = s.get_version(&v.id).unwrap().unwrap();
    assert_eq!(back.status, PromptStatus::Imported);
    assert!(back.claimed_by.is_none());
    assert!(back.claimed_from.is_none());
    assert_eq!(s.eligible_versions(10).unwrap().len(), 1);
}

#[test]
fn test_status_counts() {
    let store = shared();
    let a = imported(&store, "a");
    imported(&store, "b");
    let s = store.lock().unwrap();
    s.claim(&a.id, "w").unwrap().unwrap();
    let counts = s.status_counts().unwrap();
    assert!(counts.contains(&(PromptStatus::Generating, 1)));
    assert!(counts.contains(&(PromptStatus::Imported, 1)));
}

// ─── Variants and evaluations ───────────────────────────────────────────────

#[test]
fn test_variant_index_unique_per_version() {
    let store = shared();
    let v = imported(&store, "lake");
    let s = store.lock().unwrap();
    s.insert_variant(&variant(&v, 0)).unwrap();
    let err = s.insert_variant(&variant(&v, 0)).unwrap_err();
    assert!(matches!(err, PipelineError::Integrity(_)));
    s.insert_variant(&variant(&v, 1)).unwrap();
    assert_eq!(s.variants_for_version(&v.id).unwrap().len(), 2);
}

#[test]
fn test_storage_locator_is_immutable() {
    let store = shared();
    let v = imported(&store, "dock");
    let s = store.lock().unwrap();
    let var = variant(&v, 0);
    s.insert_variant(&var).unwrap();
    let result = s.conn().execute(
        "UPDATE variants SET storage_locator = '/elsewhere.png' WHERE id = ?1",
        [&var.id],
    );
    assert!(result.is_err());
    let stored = s.variants_for_version(&v.id).unwrap();
    assert_eq!(stored[0].storage_locator, var.storage_locator);
}

#[test]
fn test_latest_evaluation_wins() {
    let store = shared();
    let v = imported(&store, "field");
    let s = store.lock().unwrap();
    let var = variant(&v, 0);
    s.insert_variant(&var).unwrap();
    s.insert_evaluation(&evaluation(&var, 0.3, "first look")).unwrap();
    s.insert_evaluation(&evaluation(&var, 0.8, "second look")).unwrap();

    let latest = s.latest_evaluation(&var.id).unwrap().unwrap();
    assert_eq!(latest.description, "second look");
    assert_eq!(latest.missing_elements, vec!["moon".to_string()]);
    assert_eq!(s.evaluations_for_variant(&var.id).unwrap().len(), 2);
    assert_eq!(s.count_evaluations_for_version(&v.id).unwrap(), 2);
}

#[test]
fn test_evaluation_requires_existing_variant() {
    let store = shared();
    let v = imported(&store, "ghost");
    let s = store.lock().unwrap();
    let orphan = variant(&v, 0);
    let err = s
        .insert_evaluation(&evaluation(&orphan, 0.5, "nothing"))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Integrity(_)));
}

// ─── Iteration commit ───────────────────────────────────────────────────────

#[test]
fn test_best_pointer_only_moves_up() {
    let store = shared();
    let v0 = imported(&store, "peak");
    let s = store.lock().unwrap();

    let best0 = evaluating(&s, &v0, "w", 0.6);
    let l0 = learning(&v0, None, LearningStatus::Active);
    let moved = s
        .commit_iteration(&IterationCommit {
            version_id: v0.id.clone(),
            worker: "w".into(),
            to: PromptStatus::NeedsRefinement,
            best: best0.clone(),
            passed: false,
            learning: Some(l0.clone()),
        })
        .unwrap();
    assert!(moved);

    // Next iteration scores lower: pointer stays
    s.claim(&v0.id, "w").unwrap().unwrap();
    let v1 = s.create_refined_version(&v0.id, "w", "peak, sharper").unwrap();
    assert_eq!(v1.iteration, 1);
    assert_eq!(v1.status, PromptStatus::Generating);
    assert_eq!(
        s.get_version(&v0.id).unwrap().unwrap().status,
        PromptStatus::Archived
    );

    let v = variant(&v1, 0);
    s.insert_variant(&v).unwrap();
    let e = evaluation(&v, 0.6, "tie");
    s.insert_evaluation(&e).unwrap();
    s.transition(&v1.id, "w", PromptStatus::Generating, PromptStatus::Evaluating, None)
        .unwrap();
    let tie = BestCandidate {
        version_id: v1.id.clone(),
        variant_id: v.id.clone(),
        evaluation_id: e.id.clone(),
        iteration: 1,
        score: 0.6,
    };
    let moved = s
        .commit_iteration(&IterationCommit {
            version_id: v1.id.clone(),
            worker: "w".into(),
            to: PromptStatus::Archived,
            best: tie,
            passed: false,
            learning: Some(learning(&v1, Some(&l0), LearningStatus::Archived)),
        })
        .unwrap();
    assert!(!moved);

    let scene = s.get_scene(&v0.scene_id).unwrap().unwrap();
    assert_eq!(scene.best, Some(best0));

    let learnings = s.learnings_for_scene(&v0.scene_id).unwrap();
    assert_eq!(learnings.len(), 2);
    assert_eq!(learnings[0].status, LearningStatus::Superseded);
    assert!(s.active_learning(&v0.scene_id).unwrap().is_none());
}

#[test]
fn test_commit_requires_evaluating_holder() {
    let store = shared();
    let v = imported(&store, "reef");
    let s = store.lock().unwrap();
    let best = evaluating(&s, &v, "w1", 0.9);
    let err = s
        .commit_iteration(&IterationCommit {
            version_id: v.id.clone(),
            worker: "w2".into(),
            to: PromptStatus::Archived,
            best,
            passed: true,
            learning: None,
        })
        .unwrap_err();
    assert!(matches!(err, PipelineError::ClaimLost { .. }));
    assert!(s.get_scene(&v.scene_id).unwrap().unwrap().best.is_none());
}

#[test]
fn test_refined_version_needs_held_claim() {
    let store = shared();
    let v = imported(&store, "canyon");
    let s = store.lock().unwrap();
    let err = s.create_refined_version(&v.id, "w", "new text").unwrap_err();
    assert!(matches!(err, PipelineError::ClaimLost { .. }));
    assert_eq!(s.versions_for_scene(&v.scene_id).unwrap().len(), 1);
}

#[test]
fn test_scene_history_collects_lineage() {
    let store = shared();
    let v = imported(&store, "glacier");
    let s = store.lock().unwrap();
    let var = variant(&v, 0);
    s.insert_variant(&var).unwrap();
    s.insert_evaluation(&evaluation(&var, 0.4, "blue ice")).unwrap();

    let history = s.scene_history(&v.scene_id).unwrap().unwrap();
    assert_eq!(history.versions.len(), 1);
    assert_eq!(history.versions[0].variants.len(), 1);
    assert_eq!(history.versions[0].variants[0].1[0].description, "blue ice");
    let json = serde_json::to_value(&history).unwrap();
    assert_eq!(json["scene"]["label"], "glacier");
}

// ─── Multiple connections ───────────────────────────────────────────────────

#[test]
fn test_refinement_survives_concurrent_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lineage.db");

    let refiner = LineageDb::open(&path).unwrap().shared();
    let v = imported(&refiner, "estuary");
    let writer = LineageDb::open(&path).unwrap().shared();

    let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop = done.clone();
    let audit = std::thread::spawn(move || {
        let mut writes = 0u32;
        while !stop.load(std::sync::atomic::Ordering::Relaxed) {
            writer
                .lock()
                .unwrap()
                .insert_api_call(&ApiCallRow {
                    service: "fake-image".into(),
                    operation: "generate".into(),
                    attempt: 1,
                    status: "ok".into(),
                    error_kind: None,
                    error: None,
                    duration_ms: 1,
                })
                .unwrap();
            writes += 1;
        }
        writes
    });

    let s = refiner.lock().unwrap();
    let mut current = s.claim(&v.id, "w1").unwrap().unwrap();
    for i in 0..300 {
        current = s
            .create_refined_version(&current.id, "w1", &format!("refined {i}"))
            .unwrap();
    }
    done.store(true, std::sync::atomic::Ordering::Relaxed);
    let writes = audit.join().unwrap();

    assert_eq!(current.iteration, 300);
    let versions = s.versions_for_scene(&v.scene_id).unwrap();
    assert_eq!(versions.len(), 301);
    assert_eq!(
        s.versions_with_status(PromptStatus::Generating).unwrap().len(),
        1
    );
    assert_eq!(s.api_calls(None).unwrap().len(), writes as usize);
}
