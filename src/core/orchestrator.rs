// src/core/orchestrator.rs — Iteration controller
//
// The orchestrator is the only writer of prompt-version status. It claims
// eligible versions with a compare-and-set in the lineage store, runs one
// generate -> evaluate -> select iteration at a time per scene, and either
// closes the scene or refines the prompt and goes again.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::batch::BatchGenerator;
use super::refiner::PromptRefiner;
use super::selector::{self, Selection};
use super::types::*;
use crate::evaluator::scoring::ScoringPolicy;
use crate::evaluator::EvaluationCollector;
use crate::infra::config::Config;
use crate::infra::errors::{PipelineError, PipelineResult};
use crate::learner::extractor::LearningExtractor;
use crate::learner::types::{LearningChain, LearningStatus};
use crate::memory::artifacts::ArtifactStore;
use crate::memory::store::IterationCommit;
use crate::memory::{self, SharedStore, StoreAudit};
use crate::provider::retry::{CallAudit, RetryPolicy};
use crate::provider::{FailureContext, ImageService, RefineService, VisionService};

/// The three external services one orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub image: Arc<dyn ImageService>,
    pub vision: Arc<dyn VisionService>,
    pub refine: Arc<dyn RefineService>,
}

/// How a single iteration ended.
enum IterationEnd {
    /// The version left the in-flight states for good.
    Closed(VersionOutcome),
    /// Committed as `needs_refinement`; the scene has iterations left.
    Refine,
}

pub struct Orchestrator {
    store: SharedStore,
    worker_id: String,
    settings: PipelineSettings,
    policy: ScoringPolicy,
    batch: BatchGenerator,
    collector: EvaluationCollector,
    refiner: PromptRefiner,
    artifacts: Arc<ArtifactStore>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        store: SharedStore,
        artifacts: ArtifactStore,
        services: Collaborators,
        worker_id: impl Into<String>,
    ) -> Self {
        let settings = PipelineSettings::from(config);
        let policy = ScoringPolicy::from_config(config);
        let retry = RetryPolicy::from_config(&config.retry, &config.timeouts);
        let audit: Arc<dyn CallAudit> = Arc::new(StoreAudit::new(store.clone()));
        let artifacts = Arc::new(artifacts);
        // Fan-out within one batch is capped by the batch size
        let fan_out = settings.batch_size as usize;

        let batch = BatchGenerator::new(
            services.image,
            artifacts.clone(),
            store.clone(),
            settings.generation.clone(),
            retry.clone(),
            audit.clone(),
            fan_out,
        );
        let collector = EvaluationCollector::new(
            services.vision,
            policy.clone(),
            retry.clone(),
            audit.clone(),
            fan_out,
        );
        let refiner = PromptRefiner::new(services.refine, retry, audit, settings.max_prompt_chars);

        // Nobody holds the sender: the flag stays false unless `with_shutdown` is used
        let (_tx, shutdown) = watch::channel(false);

        Self {
            store,
            worker_id: worker_id.into(),
            settings,
            policy,
            batch,
            collector,
            refiner,
            artifacts,
            shutdown,
        }
    }

    /// Stop claiming new work once the flag turns true. In-flight iterations
    /// run to completion (each call is bounded by its timeout).
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ─── Intake ─────────────────────────────────────────────────

    /// Register a prompt programmatically. The first version starts as `draft`.
    /// Returns `None` when the scene already exists.
    pub fn submit(&self, input: &SceneInput) -> PipelineResult<Option<PromptVersion>> {
        register_scene(&self.store, input, PromptStatus::Draft)
    }

    /// Register a prompt from an import file. The first version starts as `imported`.
    pub fn import(&self, input: &SceneInput) -> PipelineResult<Option<PromptVersion>> {
        register_scene(&self.store, input, PromptStatus::Imported)
    }

    /// Move `draft`/`imported` versions to `completed`, or to `incomplete` with
    /// the reason when the prompt text is unusable. Returns how many moved.
    pub fn validate_pending(&self) -> PipelineResult<u32> {
        let store = memory::lock(&self.store)?;
        let mut moved = 0;
        for from in [PromptStatus::Draft, PromptStatus::Imported] {
            for version in store.versions_with_status(from)? {
                match validate_prompt_text(&version.prompt_text, self.settings.max_prompt_chars) {
                    Ok(()) => {
                        if store.set_status_if(&version.id, from, PromptStatus::Completed, None)? {
                            moved += 1;
                        }
                    }
                    Err(reason) => {
                        if store.set_status_if(
                            &version.id,
                            from,
                            PromptStatus::Incomplete,
                            Some(&reason),
                        )? {
                            warn!(version = %version.id, "Prompt rejected: {reason}");
                            moved += 1;
                        }
                    }
                }
            }
        }
        Ok(moved)
    }

    // ─── Recovery ───────────────────────────────────────────────

    /// Revert claims older than the staleness window to the state they were
    /// claimed from. Returns the reverted version ids.
    pub fn sweep_stale(&self) -> PipelineResult<Vec<String>> {
        sweep_stale_claims(&self.store, self.settings.stale_after)
    }

    /// Operator action: send a scene's `incomplete` versions back to `imported`.
    pub fn requeue(&self, scene_key: &str) -> PipelineResult<u32> {
        requeue_scene(&self.store, scene_key)
    }

    // ─── Work loop ──────────────────────────────────────────────

    /// One pass: validate intake, claim up to `concurrency` eligible versions
    /// and drive each of them as far as it goes.
    pub async fn run_once(&self) -> PipelineResult<RunSummary> {
        let mut summary = RunSummary {
            validated: self.validate_pending()?,
            ..RunSummary::default()
        };

        let limit = self.settings.concurrency.max(1);
        let mut claimed = Vec::new();
        {
            let store = memory::lock(&self.store)?;
            for candidate in store.eligible_versions((limit * 2) as u32)? {
                if self.is_shutting_down() || claimed.len() >= limit {
                    break;
                }
                match store.claim(&candidate.id, &self.worker_id) {
                    Ok(Some(version)) => {
                        debug!(version = %version.id, worker = %self.worker_id, "Claimed");
                        claimed.push(version);
                    }
                    Ok(None) => debug!(version = %candidate.id, "Already claimed elsewhere"),
                    Err(e) if e.is_busy() => {
                        debug!(version = %candidate.id, "Store busy, claim skipped: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        summary.claimed = claimed.len() as u32;

        let outcomes: Vec<VersionOutcome> = stream::iter(claimed)
            .map(|version| self.process_claimed(version))
            .buffer_unordered(limit)
            .collect()
            .await;
        for outcome in outcomes {
            summary.record(outcome);
        }
        Ok(summary)
    }

    /// Sweep stale claims, then run passes until nothing is left to do or
    /// shutdown is requested.
    pub async fn run_until_idle(&self) -> PipelineResult<RunSummary> {
        self.sweep_stale()?;
        let mut total = RunSummary::default();
        while !self.is_shutting_down() {
            let pass = self.run_once().await?;
            total.absorb(&pass);
            if pass.is_idle() {
                break;
            }
        }
        info!(
            accepted = total.accepted,
            exhausted = total.exhausted,
            incomplete = total.incomplete,
            errored = total.errored,
            "Run finished"
        );
        Ok(total)
    }

    /// Drive one claimed version (and the versions refined from it) until it
    /// closes, fails or shutdown interrupts between iterations.
    async fn process_claimed(&self, claimed: PromptVersion) -> VersionOutcome {
        let mut current = claimed;
        loop {
            if current.claimed_from == Some(PromptStatus::NeedsRefinement) {
                match self.refine_into_next(&current).await {
                    Ok(next) => current = next,
                    Err(e) => return self.handle_failure(&current, e),
                }
            }

            match self.run_iteration(&current).await {
                Ok(IterationEnd::Closed(outcome)) => return outcome,
                Ok(IterationEnd::Refine) => {
                    if self.is_shutting_down() {
                        info!(version = %current.id, "Shutdown requested, leaving version for refinement");
                        return VersionOutcome::Refined;
                    }
                    // Iteration k is committed; take the claim again for k+1
                    match memory::lock(&self.store)
                        .and_then(|s| s.claim(&current.id, &self.worker_id))
                    {
                        Ok(Some(version)) => current = version,
                        Ok(None) => return VersionOutcome::Refined,
                        Err(e) => return self.handle_failure(&current, e),
                    }
                }
                Err(e) => return self.handle_failure(&current, e),
            }
        }
    }

    /// One generate -> evaluate -> select iteration on a held `generating` version.
    /// Resumable: existing variants are not regenerated and evaluated
    /// variants are not evaluated again.
    async fn run_iteration(&self, version: &PromptVersion) -> PipelineResult<IterationEnd> {
        let scene = self.scene_of(version)?;
        let iteration = version.iteration;
        info!(scene = %scene.label, iteration, worker = %self.worker_id, "Iteration started");

        if matches!(
            version.claimed_from,
            Some(PromptStatus::Draft | PromptStatus::Imported)
        ) {
            let checked = validate_prompt_text(&version.prompt_text, self.settings.max_prompt_chars);
            if let Err(reason) = checked {
                memory::lock(&self.store)?.transition(
                    &version.id,
                    &self.worker_id,
                    PromptStatus::Generating,
                    PromptStatus::Incomplete,
                    Some(&reason),
                )?;
                warn!(scene = %scene.label, "Prompt rejected: {reason}");
                return Ok(IterationEnd::Closed(VersionOutcome::Incomplete));
            }
        }

        // ── Generate the missing part of the batch
        let existing = memory::lock(&self.store)?.variants_for_version(&version.id)?;
        let have: HashSet<u32> = existing.iter().map(|v| v.variant_index).collect();
        let missing: Vec<u32> = (0..self.settings.batch_size)
            .filter(|i| !have.contains(i))
            .collect();
        if missing.is_empty() {
            debug!(scene = %scene.label, iteration, "Batch already complete");
        } else {
            match self.batch.generate_indices(&scene, version, &missing).await {
                Ok(_) => {}
                Err(PipelineError::GenerationExhausted { .. }) if !existing.is_empty() => {
                    warn!(
                        scene = %scene.label,
                        iteration,
                        kept = existing.len(),
                        "No new variants, continuing with the stored ones"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        memory::lock(&self.store)?.transition(
            &version.id,
            &self.worker_id,
            PromptStatus::Generating,
            PromptStatus::Evaluating,
            None,
        )?;

        // ── Evaluate what has no evaluation yet
        let variants = memory::lock(&self.store)?.variants_for_version(&version.id)?;
        let mut pending = Vec::new();
        {
            let store = memory::lock(&self.store)?;
            for v in &variants {
                if store.latest_evaluation(&v.id)?.is_none() {
                    pending.push(v.clone());
                }
            }
        }
        let mut items = Vec::with_capacity(pending.len());
        for v in pending {
            let image = self.artifacts.load(&v)?;
            items.push((v, image));
        }

        let results = self.collector.evaluate_all(&items).await;
        let mut first_error = None;
        {
            let store = memory::lock(&self.store)?;
            for result in results {
                match result {
                    Ok(eval) => store.insert_evaluation(&eval)?,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // ── Select and commit
        let scored = self.scored_batch(&variants)?;
        let selection = selector::select(&scored)?;
        let last = iteration + 1 >= self.settings.max_iterations;
        let to = if selection.accepted || last {
            PromptStatus::Archived
        } else {
            PromptStatus::NeedsRefinement
        };

        let learning = if selection.accepted {
            None
        } else {
            let parent = memory::lock(&self.store)?.active_learning(&scene.scene_id)?;
            let status = if last {
                LearningStatus::Archived
            } else {
                LearningStatus::Active
            };
            Some(LearningExtractor::extract(version, &scored, parent.as_ref(), status))
        };

        let commit = IterationCommit {
            version_id: version.id.clone(),
            worker: self.worker_id.clone(),
            to,
            best: best_candidate(version, &selection),
            passed: selection.accepted,
            learning,
        };
        let moved = memory::lock(&self.store)?.commit_iteration(&commit)?;
        info!(
            scene = %scene.label,
            iteration,
            best_variant = selection.variant_index,
            score = selection.score,
            accepted = selection.accepted,
            best_pointer_moved = moved,
            status = %to,
            "Iteration committed"
        );

        Ok(match (selection.accepted, to) {
            (true, _) => IterationEnd::Closed(VersionOutcome::Accepted),
            (false, PromptStatus::Archived) => IterationEnd::Closed(VersionOutcome::Exhausted),
            _ => IterationEnd::Refine,
        })
    }

    /// Latest evaluation of every variant, classified. Every variant must have one.
    fn scored_batch(&self, variants: &[Variant]) -> PipelineResult<Vec<ScoredVariant>> {
        let store = memory::lock(&self.store)?;
        let mut scored = Vec::with_capacity(variants.len());
        for variant in variants {
            let evaluation = store.latest_evaluation(&variant.id)?.ok_or_else(|| {
                let msg = format!(
                    "variant {} (index {}) has no evaluation at selection time",
                    variant.id, variant.variant_index
                );
                error!("{msg}");
                PipelineError::Integrity(msg)
            })?;
            let classification = self.policy.classify(&evaluation);
            scored.push(ScoredVariant {
                variant: variant.clone(),
                evaluation,
                classification,
            });
        }
        Ok(scored)
    }

    /// Refine a held version that was claimed from `needs_refinement` and open
    /// the next iteration, already claimed by this worker.
    async fn refine_into_next(&self, version: &PromptVersion) -> PipelineResult<PromptVersion> {
        let scene = self.scene_of(version)?;
        let chain = LearningChain::from_learnings(
            memory::lock(&self.store)?.learnings_for_scene(&scene.scene_id)?,
        )?;
        let head = chain.head().ok_or_else(|| {
            let msg = format!(
                "version {} needs refinement but scene {} has no learning",
                version.id, scene.scene_id
            );
            error!("{msg}");
            PipelineError::Integrity(msg)
        })?;

        let context = FailureContext {
            title: scene.title.clone(),
            scene_description: scene.description.clone(),
            mood: scene.mood.clone(),
            iteration: version.iteration,
            patterns: head.patterns.clone(),
            chain_depth: chain.walk().len() as u32,
            best_description: head
                .extra
                .get("best_description")
                .and_then(|v| v.as_str())
                .map(String::from),
            best_score: head.extra.get("best_score").and_then(|v| v.as_f64()),
        };

        let text = self.refiner.refine(version, &context).await?;
        let next = memory::lock(&self.store)?.create_refined_version(
            &version.id,
            &self.worker_id,
            &text,
        )?;
        info!(
            scene = %scene.label,
            iteration = next.iteration,
            "Refined prompt version created"
        );
        Ok(next)
    }

    fn scene_of(&self, version: &PromptVersion) -> PipelineResult<Scene> {
        memory::lock(&self.store)?
            .get_scene(&version.scene_id)?
            .ok_or_else(|| {
                let msg = format!(
                    "version {} references missing scene {}",
                    version.id, version.scene_id
                );
                error!("{msg}");
                PipelineError::Integrity(msg)
            })
    }

    /// Turn a failure into a persisted state. Only versions this worker still
    /// holds are touched.
    fn handle_failure(&self, version: &PromptVersion, err: PipelineError) -> VersionOutcome {
        let store = match memory::lock(&self.store) {
            Ok(s) => s,
            Err(e) => {
                error!(version = %version.id, "Cannot record failure '{err}': {e}");
                return VersionOutcome::Errored;
            }
        };
        let current = match store.get_version(&version.id) {
            Ok(Some(v)) => v,
            Ok(None) => {
                error!(version = %version.id, "Version vanished while failing with '{err}'");
                return VersionOutcome::Errored;
            }
            Err(e) => {
                error!(version = %version.id, "Cannot reload version after '{err}': {e}");
                return VersionOutcome::Errored;
            }
        };

        let held = current.status.is_in_flight()
            && current.claimed_by.as_deref() == Some(self.worker_id.as_str());
        if !held || matches!(err, PipelineError::ClaimLost { .. }) {
            warn!(version = %version.id, status = %current.status, "Claim lost: {err}");
            return VersionOutcome::ClaimLost;
        }

        if err.is_busy() {
            warn!(version = %version.id, "Lineage store busy, releasing claim: {err}");
            return match store.release_claim(&current.id, &self.worker_id) {
                Ok(true) => VersionOutcome::Released,
                Ok(false) => VersionOutcome::ClaimLost,
                Err(e) => {
                    // Left in flight; the stale sweep reverts it later
                    warn!(version = %version.id, "Cannot release claim: {e}");
                    VersionOutcome::Released
                }
            };
        }

        let (to, outcome) = match &err {
            PipelineError::GenerationExhausted { .. }
                if current.status == PromptStatus::Generating =>
            {
                warn!(version = %version.id, "{err}");
                (PromptStatus::Incomplete, VersionOutcome::Incomplete)
            }
            PipelineError::Integrity(_) => {
                error!(version = %version.id, iteration = current.iteration, "{err}");
                (PromptStatus::Error, VersionOutcome::Errored)
            }
            _ => {
                warn!(version = %version.id, iteration = current.iteration, "Failed: {err}");
                (PromptStatus::Error, VersionOutcome::Errored)
            }
        };

        let cause = err.to_string();
        match store.transition(&current.id, &self.worker_id, current.status, to, Some(&cause)) {
            Ok(()) => outcome,
            Err(PipelineError::ClaimLost { .. }) => VersionOutcome::ClaimLost,
            Err(e) => {
                error!(version = %version.id, "Cannot persist failure '{cause}': {e}");
                VersionOutcome::Errored
            }
        }
    }
}

/// Create a scene and its iteration-0 version in `status`. Returns `None`
/// when a scene with the same normalized description already exists.
pub fn register_scene(
    store: &SharedStore,
    input: &SceneInput,
    status: PromptStatus,
) -> PipelineResult<Option<PromptVersion>> {
    if input.description.trim().is_empty() {
        return Err(PipelineError::Validation(
            "scene description must not be empty".into(),
        ));
    }
    let scene_id = scene_id_for(&input.description);
    let label = match input.label.trim() {
        "" => scene_id[..12].to_string(),
        l => l.to_string(),
    };
    let scene = Scene {
        scene_id: scene_id.clone(),
        label,
        title: input.title.trim().to_string(),
        description: input.description.trim().to_string(),
        mood: input.mood.trim().to_string(),
        model: input.model.clone(),
        best: None,
        active_learning_id: None,
        created_at: Utc::now(),
    };

    let created = memory::lock(store)?.create_scene(&scene, &input.prompt, status)?;
    match &created {
        Some(v) => info!(scene = %scene.label, version = %v.id, %status, "Scene registered"),
        None => debug!(scene = %scene.label, "Scene already known, skipped"),
    }
    Ok(created)
}

/// Revert claims older than `stale_after` to the state they were claimed
/// from. Returns the reverted version ids.
pub fn sweep_stale_claims(
    store: &SharedStore,
    stale_after: std::time::Duration,
) -> PipelineResult<Vec<String>> {
    let window = chrono::Duration::from_std(stale_after)
        .map_err(|e| PipelineError::Config(format!("stale_after_secs: {e}")))?;
    let reverted = memory::lock(store)?.sweep_stale_claims(Utc::now() - window)?;
    for id in &reverted {
        warn!(version = %id, "Reverted stale claim");
    }
    Ok(reverted)
}

/// Operator action: send a scene's `incomplete` versions back to `imported`.
pub fn requeue_scene(store: &SharedStore, scene_key: &str) -> PipelineResult<u32> {
    let store = memory::lock(store)?;
    let scene = store
        .find_scene(scene_key)?
        .ok_or_else(|| PipelineError::Validation(format!("no scene matches '{scene_key}'")))?;
    let mut count = 0;
    for version in store.versions_for_scene(&scene.scene_id)? {
        if version.status == PromptStatus::Incomplete
            && store.set_status_if(
                &version.id,
                PromptStatus::Incomplete,
                PromptStatus::Imported,
                None,
            )?
        {
            info!(scene = %scene.label, iteration = version.iteration, "Requeued");
            count += 1;
        }
    }
    Ok(count)
}

fn best_candidate(version: &PromptVersion, selection: &Selection) -> BestCandidate {
    BestCandidate {
        version_id: version.id.clone(),
        variant_id: selection.variant_id.clone(),
        evaluation_id: selection.evaluation_id.clone(),
        iteration: version.iteration,
        score: selection.score,
    }
}
