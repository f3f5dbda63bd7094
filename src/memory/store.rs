// src/memory/store.rs — SQLite operations for the lineage

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::error;

use crate::core::types::{
    BestCandidate, Evaluation, GenerationParams, PromptStatus, PromptVersion, Scene, Variant,
};
use crate::infra::errors::{PipelineError, PipelineResult};
use crate::learner::types::{FailurePatterns, Learning, LearningStatus, ScoreDistribution};

const SCENE_COLUMNS: &str = "scene_id, label, title, description, mood, model, best_version_id,
     best_variant_id, best_evaluation_id, best_iteration, best_score, active_learning_id, created_at";

const VERSION_COLUMNS: &str = "id, scene_id, iteration, prompt_text, status, best_variant_id,
     best_score, passed, failure_cause, claimed_by, claimed_at, claimed_from, created_at, updated_at";

const VARIANT_COLUMNS: &str = "id, prompt_version_id, variant_index, storage_locator, params_json,
     width, height, content_type, created_at";

const EVALUATION_COLUMNS: &str = "id, variant_id, description, object_match, color_match,
     spatial_match, style_deviation, confidence, missing_elements, unwanted_elements, style_issues,
     adherence, passed, incomplete, failed, extra_json, evaluator, created_at";

const LEARNING_COLUMNS: &str = "id, scene_id, prompt_version_id, parent_learning_id, failed_terms,
     common_artifacts, style_violations, score_min, score_max, score_mean, score_count,
     extra_json, status, created_at";

/// Fixed-width UTC timestamps so that string comparison orders them.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn get_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<PromptStatus> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn eligible_list() -> String {
    PromptStatus::ELIGIBLE
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Constraint failures are invariant breaks, not ordinary database errors.
fn constraint_or_db(err: rusqlite::Error, context: impl FnOnce() -> String) -> PipelineError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            let context = context();
            error!(error = %err, "{context}");
            PipelineError::Integrity(format!("{context}: {err}"))
        }
        _ => PipelineError::Database(err),
    }
}

fn scene_from_row(row: &Row<'_>) -> rusqlite::Result<Scene> {
    let best_version_id: Option<String> = row.get(6)?;
    let best = match best_version_id {
        Some(version_id) => Some(BestCandidate {
            version_id,
            variant_id: row.get(7)?,
            evaluation_id: row.get(8)?,
            iteration: row.get(9)?,
            score: row.get(10)?,
        }),
        None => None,
    };
    Ok(Scene {
        scene_id: row.get(0)?,
        label: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        mood: row.get(4)?,
        model: row.get(5)?,
        best,
        active_learning_id: row.get(11)?,
        created_at: get_ts(row, 12)?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<PromptVersion> {
    let claimed_from: Option<String> = row.get(11)?;
    Ok(PromptVersion {
        id: row.get(0)?,
        scene_id: row.get(1)?,
        iteration: row.get(2)?,
        prompt_text: row.get(3)?,
        status: get_status(row, 4)?,
        best_variant_id: row.get(5)?,
        best_score: row.get(6)?,
        passed: row.get(7)?,
        failure_cause: row.get(8)?,
        claimed_by: row.get(9)?,
        claimed_at: get_opt_ts(row, 10)?,
        claimed_from: claimed_from
            .map(|s| s.parse::<PromptStatus>().map_err(|e| conversion_err(11, e)))
            .transpose()?,
        created_at: get_ts(row, 12)?,
        updated_at: get_ts(row, 13)?,
    })
}

fn variant_from_row(row: &Row<'_>) -> rusqlite::Result<Variant> {
    let params: GenerationParams = get_json(row, 4)?;
    Ok(Variant {
        id: row.get(0)?,
        prompt_version_id: row.get(1)?,
        variant_index: row.get(2)?,
        storage_locator: row.get(3)?,
        params,
        width: row.get(5)?,
        height: row.get(6)?,
        content_type: row.get(7)?,
        created_at: get_ts(row, 8)?,
    })
}

fn evaluation_from_row(row: &Row<'_>) -> rusqlite::Result<Evaluation> {
    use crate::core::types::DimensionScores;
    Ok(Evaluation {
        id: row.get(0)?,
        variant_id: row.get(1)?,
        description: row.get(2)?,
        dimensions: DimensionScores {
            object_match: row.get(3)?,
            color_match: row.get(4)?,
            spatial_match: row.get(5)?,
            style_deviation: row.get(6)?,
            confidence: row.get(7)?,
        },
        missing_elements: get_json(row, 8)?,
        unwanted_elements: get_json(row, 9)?,
        style_issues: get_json(row, 10)?,
        adherence: row.get(11)?,
        passed: row.get(12)?,
        incomplete: row.get(13)?,
        failed: row.get(14)?,
        extra: get_json(row, 15)?,
        evaluator: row.get(16)?,
        created_at: get_ts(row, 17)?,
    })
}

fn learning_from_row(row: &Row<'_>) -> rusqlite::Result<Learning> {
    let status: String = row.get(12)?;
    Ok(Learning {
        id: row.get(0)?,
        scene_id: row.get(1)?,
        prompt_version_id: row.get(2)?,
        parent_learning_id: row.get(3)?,
        patterns: FailurePatterns {
            failed_terms: get_json(row, 4)?,
            common_artifacts: get_json(row, 5)?,
            style_violations: get_json(row, 6)?,
            score_distribution: ScoreDistribution {
                min: row.get(7)?,
                max: row.get(8)?,
                mean: row.get(9)?,
                count: row.get(10)?,
            },
        },
        extra: get_json::<BTreeMap<String, serde_json::Value>>(row, 11)?,
        status: status
            .parse::<LearningStatus>()
            .map_err(|e| conversion_err(12, e))?,
        created_at: get_ts(row, 13)?,
    })
}

/// Everything decided when an iteration's evaluations close.
#[derive(Debug, Clone)]
pub struct IterationCommit {
    pub version_id: String,
    pub worker: String,
    /// `Archived` or `NeedsRefinement`.
    pub to: PromptStatus,
    pub best: BestCandidate,
    pub passed: bool,
    pub learning: Option<Learning>,
}

/// Full record of one scene, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SceneHistory {
    pub scene: Scene,
    pub versions: Vec<VersionHistory>,
    pub learnings: Vec<Learning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionHistory {
    pub version: PromptVersion,
    pub variants: Vec<(Variant, Vec<Evaluation>)>,
}

/// One row of the collaborator call audit.
#[derive(Debug, Clone)]
pub struct ApiCallRow {
    pub service: String,
    pub operation: String,
    pub attempt: u32,
    pub status: String,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Low-level SQLite operations for the lineage tables.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Take the write lock up front. A deferred transaction that reads first
    /// cannot wait for a competing writer in WAL mode and fails with
    /// `SQLITE_BUSY` instead of honouring the busy timeout.
    fn immediate(&self) -> rusqlite::Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
    }

    // -- Scenes --

    /// Create a scene with its iteration-0 version. Returns `None` when the scene
    /// already exists.
    pub fn create_scene(
        &self,
        scene: &Scene,
        prompt_text: &str,
        status: PromptStatus,
    ) -> PipelineResult<Option<PromptVersion>> {
        let tx = self.immediate()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO scenes (scene_id, label, title, description, mood, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                scene.scene_id,
                scene.label,
                scene.title,
                scene.description,
                scene.mood,
                scene.model,
                ts(scene.created_at)
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let version = insert_version_tx(&tx, &scene.scene_id, 0, prompt_text, status, None)?;
        tx.commit()?;
        Ok(Some(version))
    }

    pub fn get_scene(&self, scene_id: &str) -> PipelineResult<Option<Scene>> {
        let sql = format!("SELECT {SCENE_COLUMNS} FROM scenes WHERE scene_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [scene_id], scene_from_row)
            .optional()?)
    }

    /// Look a scene up by full id, id prefix or label.
    pub fn find_scene(&self, key: &str) -> PipelineResult<Option<Scene>> {
        let sql = format!(
            "SELECT {SCENE_COLUMNS} FROM scenes
             WHERE scene_id = ?1 OR label = ?1 OR scene_id LIKE ?1 || '%'
             ORDER BY created_at LIMIT 1"
        );
        Ok(self.conn.query_row(&sql, [key], scene_from_row).optional()?)
    }

    pub fn list_scenes(&self) -> PipelineResult<Vec<Scene>> {
        let sql = format!("SELECT {SCENE_COLUMNS} FROM scenes ORDER BY created_at");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], scene_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -- Prompt versions --

    pub fn get_version(&self, id: &str) -> PipelineResult<Option<PromptVersion>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM prompt_versions WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id], version_from_row)
            .optional()?)
    }

    pub fn versions_for_scene(&self, scene_id: &str) -> PipelineResult<Vec<PromptVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions WHERE scene_id = ?1 ORDER BY iteration"
        );
        self.query_versions(&sql, params![scene_id])
    }

    pub fn versions_with_status(&self, status: PromptStatus) -> PipelineResult<Vec<PromptVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions WHERE status = ?1
             ORDER BY iteration, created_at"
        );
        self.query_versions(&sql, params![status.as_str()])
    }

    /// Unclaimed versions eligible for work, lowest iteration first.
    pub fn eligible_versions(&self, limit: u32) -> PipelineResult<Vec<PromptVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions
             WHERE status IN ({}) ORDER BY iteration, created_at LIMIT ?1",
            eligible_list()
        );
        self.query_versions(&sql, params![limit])
    }

    fn query_versions(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> PipelineResult<Vec<PromptVersion>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, version_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn status_counts(&self) -> PipelineResult<Vec<(PromptStatus, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM prompt_versions GROUP BY status ORDER BY status",
        )?;
        let rows = stmt.query_map([], |row| Ok((get_status(row, 0)?, row.get(1)?)))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Atomically take an eligible version: `status -> generating`, remembering
    /// where it came from. `None` when another worker got there first.
    pub fn claim(&self, id: &str, worker: &str) -> PipelineResult<Option<PromptVersion>> {
        let now = ts(Utc::now());
        let sql = format!(
            "UPDATE prompt_versions
             SET status = 'generating', claimed_by = ?1, claimed_at = ?2,
                 claimed_from = status, updated_at = ?2
             WHERE id = ?3 AND status IN ({})",
            eligible_list()
        );
        let changed = self.conn.execute(&sql, params![worker, now, id])?;
        if changed == 1 {
            self.get_version(id)
        } else {
            Ok(None)
        }
    }

    /// Move a version this worker holds. Leaving the in-flight states releases the claim.
    pub fn transition(
        &self,
        id: &str,
        worker: &str,
        from: PromptStatus,
        to: PromptStatus,
        cause: Option<&str>,
    ) -> PipelineResult<()> {
        if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let now = ts(Utc::now());
        let sql = if to.is_in_flight() {
            "UPDATE prompt_versions
             SET status = ?1, claimed_at = ?2, updated_at = ?2,
                 failure_cause = COALESCE(?3, failure_cause)
             WHERE id = ?4 AND status = ?5 AND claimed_by = ?6"
        } else {
            "UPDATE prompt_versions
             SET status = ?1, claimed_by = NULL, claimed_at = NULL, claimed_from = NULL,
                 updated_at = ?2, failure_cause = COALESCE(?3, failure_cause)
             WHERE id = ?4 AND status = ?5 AND claimed_by = ?6"
        };
        let changed = self.conn.execute(
            sql,
            params![to.as_str(), now, cause, id, from.as_str(), worker],
        )?;
        if changed == 0 {
            return Err(PipelineError::ClaimLost {
                version_id: id.to_string(),
                worker: worker.to_string(),
            });
        }
        Ok(())
    }

    /// Compare-and-set on an unclaimed version (validation, operator requeue).
    pub fn set_status_if(
        &self,
        id: &str,
        from: PromptStatus,
        to: PromptStatus,
        cause: Option<&str>,
    ) -> PipelineResult<bool> {
        if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let changed = self.conn.execute(
            "UPDATE prompt_versions SET status = ?1, failure_cause = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5 AND claimed_by IS NULL",
            params![to.as_str(), cause, ts(Utc::now()), id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Revert in-flight versions whose claim is older than `cutoff` to the state
    /// they were claimed from. Returns the ids reverted.
    pub fn sweep_stale_claims(&self, cutoff: DateTime<Utc>) -> PipelineResult<Vec<String>> {
        let tx = self.immediate()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM prompt_versions
                 WHERE status IN ('generating', 'evaluating') AND claimed_at < ?1",
            )?;
            let rows = stmt.query_map([ts(cutoff)], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        tx.execute(
            "UPDATE prompt_versions
             SET status = COALESCE(claimed_from, 'completed'),
                 claimed_by = NULL, claimed_at = NULL, claimed_from = NULL, updated_at = ?2
             WHERE status IN ('generating', 'evaluating') AND claimed_at < ?1",
            params![ts(cutoff), ts(Utc::now())],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    /// Hand a held claim back after a transient failure: the version returns to
    /// the state it was claimed from. Returns whether this worker still held it.
    pub fn release_claim(&self, id: &str, worker: &str) -> PipelineResult<bool> {
        let tx = self.immediate()?;
        let held: Option<(PromptStatus, Option<String>)> = tx
            .query_row(
                "SELECT status, claimed_from FROM prompt_versions WHERE id = ?1 AND claimed_by = ?2",
                params![id, worker],
                |r| Ok((get_status(r, 0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((status, claimed_from)) = held else {
            return Ok(false);
        };
        let back = match claimed_from {
            Some(raw) => raw.parse::<PromptStatus>()?,
            None => PromptStatus::Completed,
        };
        if !status.can_revert_to(back) {
            return Err(PipelineError::InvalidTransition {
                from: status.to_string(),
                to: back.to_string(),
            });
        }
        tx.execute(
            "UPDATE prompt_versions
             SET status = ?1, claimed_by = NULL, claimed_at = NULL, claimed_from = NULL,
                 updated_at = ?2
             WHERE id = ?3 AND claimed_by = ?4",
            params![back.as_str(), ts(Utc::now()), id, worker],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Close an iteration in one transaction: version best + status, scene best
    /// pointer (only if not lower), and the learning chain.
    /// Returns whether the scene pointer moved.
    pub fn commit_iteration(&self, commit: &IterationCommit) -> PipelineResult<bool> {
        let from = PromptStatus::Evaluating;
        if !matches!(commit.to, PromptStatus::Archived | PromptStatus::NeedsRefinement) {
            return Err(PipelineError::InvalidTransition {
                from: from.to_string(),
                to: commit.to.to_string(),
            });
        }
        let now = ts(Utc::now());
        let tx = self.immediate()?;

        let changed = tx.execute(
            "UPDATE prompt_versions
             SET status = ?1, best_variant_id = ?2, best_score = ?3, passed = ?4,
                 claimed_by = NULL, claimed_at = NULL, claimed_from = NULL, updated_at = ?5
             WHERE id = ?6 AND status = 'evaluating' AND claimed_by = ?7",
            params![
                commit.to.as_str(),
                commit.best.variant_id,
                commit.best.score,
                commit.passed,
                now,
                commit.version_id,
                commit.worker
            ],
        )?;
        if changed == 0 {
            return Err(PipelineError::ClaimLost {
                version_id: commit.version_id.clone(),
                worker: commit.worker.clone(),
            });
        }

        let scene_id: String = tx.query_row(
            "SELECT scene_id FROM prompt_versions WHERE id = ?1",
            [&commit.version_id],
            |r| r.get(0),
        )?;

        let moved = tx.execute(
            "UPDATE scenes
             SET best_version_id = ?1, best_variant_id = ?2, best_evaluation_id = ?3,
                 best_iteration = ?4, best_score = ?5
             WHERE scene_id = ?6 AND (best_score IS NULL OR best_score < ?5)",
            params![
                commit.best.version_id,
                commit.best.variant_id,
                commit.best.evaluation_id,
                commit.best.iteration,
                commit.best.score,
                scene_id
            ],
        )? == 1;

        if let Some(learning) = &commit.learning {
            insert_learning_tx(&tx, learning)?;
        } else if commit.to == PromptStatus::Archived {
            tx.execute(
                "UPDATE learnings SET status = 'archived' WHERE scene_id = ?1 AND status = 'active'",
                [&scene_id],
            )?;
        }

        tx.commit()?;
        Ok(moved)
    }

    /// Retire the held version and open the next iteration, already claimed by
    /// the same worker.
    pub fn create_refined_version(
        &self,
        current_id: &str,
        worker: &str,
        prompt_text: &str,
    ) -> PipelineResult<PromptVersion> {
        let tx = self.immediate()?;
        let (scene_id, iteration): (String, u32) = tx
            .query_row(
                "SELECT scene_id, iteration FROM prompt_versions
                 WHERE id = ?1 AND status = 'generating' AND claimed_by = ?2",
                params![current_id, worker],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| PipelineError::ClaimLost {
                version_id: current_id.to_string(),
                worker: worker.to_string(),
            })?;

        let next = insert_version_tx(
            &tx,
            &scene_id,
            iteration + 1,
            prompt_text,
            PromptStatus::Generating,
            Some(worker),
        )?;
        tx.execute(
            "UPDATE prompt_versions
             SET status = 'archived', claimed_by = NULL, claimed_at = NULL, claimed_from = NULL,
                 updated_at = ?1
             WHERE id = ?2",
            params![ts(Utc::now()), current_id],
        )?;
        tx.commit()?;
        Ok(next)
    }

    // -- Variants --

    pub fn insert_variant(&self, variant: &Variant) -> PipelineResult<()> {
        let params_json = serde_json::to_string(&variant.params)?;
        self.conn
            .execute(
                "INSERT INTO variants (id, prompt_version_id, variant_index, storage_locator,
                 params_json, width, height, content_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    variant.id,
                    variant.prompt_version_id,
                    variant.variant_index,
                    variant.storage_locator,
                    params_json,
                    variant.width,
                    variant.height,
                    variant.content_type,
                    ts(variant.created_at)
                ],
            )
            .map_err(|e| {
                constraint_or_db(e, || {
                    format!(
                        "variant {} of version {} rejected",
                        variant.variant_index, variant.prompt_version_id
                    )
                })
            })?;
        Ok(())
    }

    pub fn variants_for_version(&self, version_id: &str) -> PipelineResult<Vec<Variant>> {
        let sql = format!(
            "SELECT {VARIANT_COLUMNS} FROM variants WHERE prompt_version_id = ?1
             ORDER BY variant_index"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([version_id], variant_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -- Evaluations --

    /// Append an evaluation; earlier ones for the variant stay as history.
    pub fn insert_evaluation(&self, eval: &Evaluation) -> PipelineResult<()> {
        let d = &eval.dimensions;
        self.conn
            .execute(
                "INSERT INTO evaluations (id, variant_id, description, object_match, color_match,
                 spatial_match, style_deviation, confidence, missing_elements, unwanted_elements,
                 style_issues, adherence, passed, incomplete, failed, extra_json, evaluator,
                 seq, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, (SELECT COALESCE(MAX(seq), 0) + 1 FROM evaluations WHERE variant_id = ?2),
                 ?18)",
                params![
                    eval.id,
                    eval.variant_id,
                    eval.description,
                    d.object_match,
                    d.color_match,
                    d.spatial_match,
                    d.style_deviation,
                    d.confidence,
                    serde_json::to_string(&eval.missing_elements)?,
                    serde_json::to_string(&eval.unwanted_elements)?,
                    serde_json::to_string(&eval.style_issues)?,
                    eval.adherence,
                    eval.passed,
                    eval.incomplete,
                    eval.failed,
                    serde_json::to_string(&eval.extra)?,
                    eval.evaluator,
                    ts(eval.created_at)
                ],
            )
            .map_err(|e| {
                constraint_or_db(e, || format!("evaluation of variant {} rejected", eval.variant_id))
            })?;
        Ok(())
    }

    /// The evaluation that counts for selection: newest by creation.
    pub fn latest_evaluation(&self, variant_id: &str) -> PipelineResult<Option<Evaluation>> {
        let sql = format!(
            "SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE variant_id = ?1
             ORDER BY seq DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, [variant_id], evaluation_from_row)
            .optional()?)
    }

    pub fn evaluations_for_variant(&self, variant_id: &str) -> PipelineResult<Vec<Evaluation>> {
        let sql = format!(
            "SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE variant_id = ?1 ORDER BY seq"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([variant_id], evaluation_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_evaluations_for_version(&self, version_id: &str) -> PipelineResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM evaluations e JOIN variants v ON v.id = e.variant_id
             WHERE v.prompt_version_id = ?1",
            [version_id],
            |r| r.get(0),
        )?)
    }

    // -- Learnings --

    pub fn get_learning(&self, id: &str) -> PipelineResult<Option<Learning>> {
        let sql = format!("SELECT {LEARNING_COLUMNS} FROM learnings WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id], learning_from_row)
            .optional()?)
    }

    /// Head of the scene's chain, if it is still active.
    pub fn active_learning(&self, scene_id: &str) -> PipelineResult<Option<Learning>> {
        let sql = format!(
            "SELECT {LEARNING_COLUMNS} FROM learnings WHERE scene_id = ?1 AND status = 'active'
             ORDER BY created_at DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, [scene_id], learning_from_row)
            .optional()?)
    }

    pub fn learnings_for_scene(&self, scene_id: &str) -> PipelineResult<Vec<Learning>> {
        let sql = format!(
            "SELECT {LEARNING_COLUMNS} FROM learnings WHERE scene_id = ?1 ORDER BY created_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([scene_id], learning_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -- API call audit --

    pub fn insert_api_call(&self, call: &ApiCallRow) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO api_calls (service, operation, attempt, status, error_kind, error,
             duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                call.service,
                call.operation,
                call.attempt,
                call.status,
                call.error_kind,
                call.error,
                call.duration_ms as i64,
                ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn api_calls(&self, service: Option<&str>) -> PipelineResult<Vec<ApiCallRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT service, operation, attempt, status, error_kind, error, duration_ms
             FROM api_calls WHERE ?1 IS NULL OR service = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([service], |row| {
            Ok(ApiCallRow {
                service: row.get(0)?,
                operation: row.get(1)?,
                attempt: row.get(2)?,
                status: row.get(3)?,
                error_kind: row.get(4)?,
                error: row.get(5)?,
                duration_ms: row.get::<_, i64>(6)?.max(0) as u64,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -- History --

    pub fn scene_history(&self, scene_id: &str) -> PipelineResult<Option<SceneHistory>> {
        let Some(scene) = self.get_scene(scene_id)? else {
            return Ok(None);
        };
        let mut versions = Vec::new();
        for version in self.versions_for_scene(scene_id)? {
            let mut variants = Vec::new();
            for variant in self.variants_for_version(&version.id)? {
                let evals = self.evaluations_for_variant(&variant.id)?;
                variants.push((variant, evals));
            }
            versions.push(VersionHistory { version, variants });
        }
        let learnings = self.learnings_for_scene(scene_id)?;
        Ok(Some(SceneHistory {
            scene,
            versions,
            learnings,
        }))
    }

    /// Access the underlying connection (for tests and advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Insert a version after checking the scene's iterations stay contiguous from 0.
fn insert_version_tx(
    conn: &Connection,
    scene_id: &str,
    iteration: u32,
    prompt_text: &str,
    status: PromptStatus,
    claimed_by: Option<&str>,
) -> PipelineResult<PromptVersion> {
    let next: u32 = conn.query_row(
        "SELECT COALESCE(MAX(iteration) + 1, 0) FROM prompt_versions WHERE scene_id = ?1",
        [scene_id],
        |r| r.get(0),
    )?;
    if next != iteration {
        let msg = format!("scene {scene_id}: iteration {iteration} requested, next is {next}");
        error!("{msg}");
        return Err(PipelineError::Integrity(msg));
    }

    let now = Utc::now();
    let (claimed_at, claimed_from) = match claimed_by {
        Some(_) => (Some(now), Some(PromptStatus::Completed)),
        None => (None, None),
    };
    let version = PromptVersion {
        id: uuid::Uuid::new_v4().to_string(),
        scene_id: scene_id.to_string(),
        iteration,
        prompt_text: prompt_text.to_string(),
        status,
        best_variant_id: None,
        best_score: None,
        passed: None,
        failure_cause: None,
        claimed_by: claimed_by.map(String::from),
        claimed_at,
        claimed_from,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO prompt_versions (id, scene_id, iteration, prompt_text, status, claimed_by,
         claimed_at, claimed_from, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            version.id,
            version.scene_id,
            version.iteration,
            version.prompt_text,
            version.status.as_str(),
            version.claimed_by,
            version.claimed_at.map(ts),
            version.claimed_from.map(|s| s.as_str()),
            ts(now)
        ],
    )
    .map_err(|e| {
        constraint_or_db(e, || {
            format!("version {iteration} of scene {scene_id} rejected")
        })
    })?;
    Ok(version)
}

/// Supersede the scene's active learning, append the new node and move the head.
fn insert_learning_tx(conn: &Connection, learning: &Learning) -> PipelineResult<()> {
    let p = &learning.patterns;
    conn.execute(
        "UPDATE learnings SET status = 'superseded' WHERE scene_id = ?1 AND status = 'active'",
        [&learning.scene_id],
    )?;
    conn.execute(
        "INSERT INTO learnings (id, scene_id, prompt_version_id, parent_learning_id, failed_terms,
         common_artifacts, style_violations, score_min, score_max, score_mean, score_count,
         extra_json, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            learning.id,
            learning.scene_id,
            learning.prompt_version_id,
            learning.parent_learning_id,
            serde_json::to_string(&p.failed_terms)?,
            serde_json::to_string(&p.common_artifacts)?,
            serde_json::to_string(&p.style_violations)?,
            p.score_distribution.min,
            p.score_distribution.max,
            p.score_distribution.mean,
            p.score_distribution.count,
            serde_json::to_string(&learning.extra)?,
            learning.status.as_str(),
            ts(learning.created_at)
        ],
    )
    .map_err(|e| {
        constraint_or_db(e, || {
            format!("learning for version {} rejected", learning.prompt_version_id)
        })
    })?;
    conn.execute(
        "UPDATE scenes SET active_learning_id = ?1 WHERE scene_id = ?2",
        params![learning.id, learning.scene_id],
    )?;
    Ok(())
}
