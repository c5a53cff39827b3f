use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditRecorder};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{
    Category, EnergyIntensity, Task, MAX_TASK_DURATION_MINUTES, MIN_TASK_DURATION_MINUTES,
};

/// One attribute proposal with its confidence score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal<T> {
    pub value: T,
    pub confidence: f64,
}

impl<T> Proposal<T> {
    pub fn new(value: T, confidence: f64) -> Self {
        Self { value, confidence }
    }
}

/// Structured per-attribute proposals returned by the adapter. The adapter
/// never sets tiers, never overrides hard constraints, and never produces
/// user-facing prose.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceProposals {
    pub title: Option<Proposal<String>>,
    pub category: Option<Proposal<Category>>,
    pub estimated_duration: Option<Proposal<i64>>,
    pub energy_intensity: Option<Proposal<EnergyIntensity>>,
    pub risk_score: Option<Proposal<f64>>,
    pub impact_score: Option<Proposal<f64>>,
    pub dependencies: Option<Proposal<Vec<Uuid>>>,
}

/// What the adapter is allowed to see: the task subset with
/// `ai_excluded=false`, identity plus text plus current attributes.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub task_id: Uuid,
    pub title: String,
    pub notes: Option<String>,
    pub category: Category,
    pub estimated_duration: i64,
}

/// Boundary 3. Implementations must be side-effect-free.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn propose(&self, request: &InferenceRequest) -> Result<InferenceProposals, EngineError>;
}

/// Deterministic in-memory adapter for tests and replay.
#[derive(Debug, Default)]
pub struct FixedInferenceProvider {
    proposals: HashMap<Uuid, InferenceProposals>,
}

impl FixedInferenceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proposal(mut self, task_id: Uuid, proposals: InferenceProposals) -> Self {
        self.proposals.insert(task_id, proposals);
        self
    }
}

#[async_trait]
impl InferenceProvider for FixedInferenceProvider {
    async fn propose(&self, request: &InferenceRequest) -> Result<InferenceProposals, EngineError> {
        Ok(self
            .proposals
            .get(&request.task_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Record of what inference did to one task, consumed by the tier assigner
/// to decide whether a tier change may auto-apply.
#[derive(Debug, Clone, Default)]
pub struct AppliedInference {
    /// Attribute names that were accepted, with their confidences.
    pub applied: Vec<(&'static str, f64)>,
    /// Lowest confidence among applied attributes that can move a tier
    /// (category, risk, impact, dependencies).
    pub min_tier_relevant_confidence: Option<f64>,
}

impl AppliedInference {
    fn accept(&mut self, attribute: &'static str, confidence: f64, tier_relevant: bool) {
        self.applied.push((attribute, confidence));
        if tier_relevant {
            self.min_tier_relevant_confidence = Some(
                self.min_tier_relevant_confidence
                    .map_or(confidence, |c| c.min(confidence)),
            );
        }
    }
}

/// Whether a task still misses inferable attributes. The closed record uses
/// sentinels: `unknown` category and zero duration confidence mean the
/// attribute was never established.
pub fn needs_inference(task: &Task) -> bool {
    task.category == Category::Unknown || task.duration_confidence == 0.0
}

/// Run the adapter over the eligible tasks and apply the acceptance policy:
/// only proposals at or above `confidence_threshold` land; durations round
/// to the nearest quarter hour and clamp to the legal range. Failure is
/// non-fatal; the task proceeds on defaults with an audited fallback.
pub async fn enrich_tasks(
    provider: &dyn InferenceProvider,
    config: &EngineConfig,
    tasks: &mut [Task],
    audit: &mut AuditRecorder,
    cancel: &CancellationToken,
) -> Result<HashMap<Uuid, AppliedInference>, EngineError> {
    let mut outcomes = HashMap::new();

    let known_ids: std::collections::HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
    let mut dependency_edges: HashMap<Uuid, Vec<Uuid>> = tasks
        .iter()
        .map(|t| (t.id, t.dependencies.clone()))
        .collect();

    for task in tasks.iter_mut() {
        if !needs_inference(task) {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let request = InferenceRequest {
            task_id: task.id,
            title: task.title.clone(),
            notes: task.notes.clone(),
            category: task.category,
            estimated_duration: task.estimated_duration,
        };

        let proposals =
            match tokio::time::timeout(config.inference_timeout(), provider.propose(&request)).await
            {
                Ok(Ok(proposals)) => proposals,
                Ok(Err(e)) => {
                    warn!(task_id = %task.id, error = %e, "inference call failed, using defaults");
                    audit.record(
                        AuditEventType::AttributeInferred,
                        Some(task.id),
                        json!({ "fallback": "adapter_error", "error": e.to_string() }),
                    );
                    outcomes.insert(task.id, AppliedInference::default());
                    continue;
                }
                Err(_) => {
                    warn!(task_id = %task.id, "inference call timed out, using defaults");
                    audit.record(
                        AuditEventType::AttributeInferred,
                        Some(task.id),
                        json!({ "fallback": "timeout" }),
                    );
                    outcomes.insert(task.id, AppliedInference::default());
                    continue;
                }
            };

        let mut outcome = AppliedInference::default();
        let threshold = config.confidence_threshold;
        let mut applied_details = serde_json::Map::new();

        if let Some(p) = &proposals.title {
            if p.confidence >= threshold && task.title_autogenerated {
                task.title = p.value.clone();
                outcome.accept("title", p.confidence, false);
                applied_details.insert("title".into(), json!(p.confidence));
            }
        }
        if let Some(p) = &proposals.category {
            if p.confidence >= threshold && task.category == Category::Unknown {
                task.category = p.value;
                outcome.accept("category", p.confidence, true);
                applied_details.insert("category".into(), json!(p.confidence));
            }
        }
        if let Some(p) = &proposals.estimated_duration {
            if p.confidence >= threshold && task.duration_confidence == 0.0 {
                let rounded = round_to_quarter_hour(p.value);
                task.estimated_duration =
                    rounded.clamp(MIN_TASK_DURATION_MINUTES, MAX_TASK_DURATION_MINUTES);
                task.duration_confidence = p.confidence;
                outcome.accept("estimated_duration", p.confidence, false);
                applied_details.insert("estimated_duration".into(), json!(p.confidence));
            }
        }
        if let Some(p) = &proposals.energy_intensity {
            if p.confidence >= threshold {
                task.energy_intensity = p.value;
                outcome.accept("energy_intensity", p.confidence, false);
                applied_details.insert("energy_intensity".into(), json!(p.confidence));
            }
        }
        if let Some(p) = &proposals.risk_score {
            if p.confidence >= threshold {
                task.risk_score = p.value.clamp(0.0, 1.0);
                outcome.accept("risk_score", p.confidence, true);
                applied_details.insert("risk_score".into(), json!(p.confidence));
            }
        }
        if let Some(p) = &proposals.impact_score {
            if p.confidence >= threshold {
                task.impact_score = p.value.clamp(0.0, 1.0);
                outcome.accept("impact_score", p.confidence, true);
                applied_details.insert("impact_score".into(), json!(p.confidence));
            }
        }
        if let Some(p) = &proposals.dependencies {
            if p.confidence >= threshold {
                let safe: Vec<Uuid> = p
                    .value
                    .iter()
                    .copied()
                    .filter(|dep| {
                        *dep != task.id
                            && known_ids.contains(dep)
                            && !reaches(&dependency_edges, *dep, task.id)
                    })
                    .collect();
                if !safe.is_empty() {
                    for dep in &safe {
                        if !task.dependencies.contains(dep) {
                            task.dependencies.push(*dep);
                        }
                    }
                    dependency_edges.insert(task.id, task.dependencies.clone());
                    outcome.accept("dependencies", p.confidence, true);
                    applied_details.insert("dependencies".into(), json!(p.confidence));
                }
            }
        }

        if applied_details.is_empty() {
            debug!(task_id = %task.id, "no proposal met the confidence threshold");
            audit.record(
                AuditEventType::AttributeInferred,
                Some(task.id),
                json!({ "fallback": "below_threshold" }),
            );
        } else {
            audit.record(
                AuditEventType::AttributeInferred,
                Some(task.id),
                json!({ "applied": applied_details, "proposals": proposals }),
            );
        }

        outcomes.insert(task.id, outcome);
    }

    Ok(outcomes)
}

fn round_to_quarter_hour(minutes: i64) -> i64 {
    ((minutes as f64 / 15.0).round() as i64) * 15
}

/// DFS reachability over the in-memory edge map; guards proposed
/// dependencies against cycles.
fn reaches(edges: &HashMap<Uuid, Vec<Uuid>>, from: Uuid, to: Uuid) -> bool {
    let mut stack = vec![from];
    let mut seen = std::collections::HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = edges.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
