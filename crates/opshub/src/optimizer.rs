// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Prompt templates, optimization, and A/B selection
//!
//! The classifier's instructions live in a versioned [`PromptTemplate`]:
//! a system prompt plus a bounded list of few-shot examples with
//! per-example effectiveness stats. The optimizer derives candidate
//! templates from feedback (teaching the oracle the cases it finds
//! hard, dropping the examples that mislead it), and the
//! [`AbSelector`] runs the candidate against the incumbent on split
//! traffic, activating the winner and rolling back when the winner
//! degrades in production.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::classification::Classification;
use crate::constants::{
    DEFAULT_AB_DEGRADATION_ROLLBACK, DEFAULT_AB_EVALUATIONS, DEFAULT_PROMPT_MAX_EXAMPLES,
};
use crate::error::{Error, Result};
use crate::feedback::{FeedbackOutcome, FeedbackRecord};
use crate::oracle::OracleMessage;

/// Minimum evaluations on a freshly-activated template before the
/// degradation check may fire.
const ROLLBACK_MIN_EVALUATIONS: u64 = 10;

/// Confidence below which a successful record is worth teaching.
const LOW_CONFIDENCE: f64 = 0.6;

/// Confidence above which a failed record marks misleading examples.
const HIGH_CONFIDENCE: f64 = 0.8;

/// One few-shot example on a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptExample {
    /// Unique example id
    pub id: String,
    /// The signal text shown to the oracle
    pub input: String,
    /// The classification the oracle should produce
    pub expected: Classification,
    /// Template version that introduced the example
    pub added_in_version: u32,
    /// Times the example was present on an evaluated template
    pub uses: u64,
    /// Of those, how many evaluations succeeded
    pub successes: u64,
}

impl PromptExample {
    /// Build an example from a signal digest and its verdict.
    pub fn new(input: impl Into<String>, expected: Classification, version: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            input: input.into(),
            expected,
            added_in_version: version,
            uses: 0,
            successes: 0,
        }
    }

    /// Success fraction while this example was on the template.
    #[must_use]
    pub fn effectiveness(&self) -> f64 {
        if self.uses == 0 {
            // Unproven examples rank above known-bad ones.
            return 0.5;
        }
        self.successes as f64 / self.uses as f64
    }
}

/// Aggregate metrics for one template version
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetrics {
    /// Classifications evaluated with this version
    pub evaluations: u64,
    /// Of those, terminal successes
    pub successes: u64,
    /// Sum of reported confidences
    pub total_confidence: f64,
    /// Sum of processing times
    pub total_processing_ms: u64,
}

impl TemplateMetrics {
    /// Success fraction.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.evaluations == 0 {
            return 0.0;
        }
        self.successes as f64 / self.evaluations as f64
    }

    /// Mean confidence.
    #[must_use]
    pub fn avg_confidence(&self) -> f64 {
        if self.evaluations == 0 {
            return 0.0;
        }
        self.total_confidence / self.evaluations as f64
    }

    /// Mean processing time in milliseconds.
    #[must_use]
    pub fn avg_processing_ms(&self) -> f64 {
        if self.evaluations == 0 {
            return 0.0;
        }
        self.total_processing_ms as f64 / self.evaluations as f64
    }

    fn record(&mut self, success: bool, confidence: f64, processing_ms: u64) {
        self.evaluations += 1;
        if success {
            self.successes += 1;
        }
        self.total_confidence += confidence;
        self.total_processing_ms += processing_ms;
    }
}

/// A versioned classifier prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Stable template family id
    pub id: String,
    /// Monotonic version within the family
    pub version: u32,
    /// System prompt text
    pub system_prompt: String,
    /// Bounded few-shot examples
    pub examples: Vec<PromptExample>,
    /// Example cap
    pub max_examples: usize,
    /// Aggregate metrics
    pub metrics: TemplateMetrics,
    /// When this version was created
    pub created_at: DateTime<Utc>,
}

impl PromptTemplate {
    /// Create version 1 of a template family.
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            system_prompt: system_prompt.into(),
            examples: Vec::new(),
            max_examples: DEFAULT_PROMPT_MAX_EXAMPLES,
            metrics: TemplateMetrics::default(),
            created_at: Utc::now(),
        }
    }

    /// The built-in classification template.
    #[must_use]
    pub fn classification_default() -> Self {
        Self::new(
            "signal-classification",
            "You are the triage engine of an operations automation system. \
             Classify the inbound signal and respond with a single JSON object \
             with exactly these fields: \
             \"urgency\" (one of critical, high, medium, low), \
             \"importance\" (one of high, medium, low), \
             \"category\" (one of incident, request, issue, question, information, discussion, spam), \
             \"confidence\" (number between 0 and 1), \
             \"reasoning\" (short string), \
             \"suggested_actions\" (array of strings), \
             \"requires_immediate\" (boolean). \
             Respond with JSON only, no prose.",
        )
    }

    /// Cap override.
    #[must_use]
    pub fn with_max_examples(mut self, max_examples: usize) -> Self {
        self.max_examples = max_examples.max(1);
        self
    }

    /// Render the oracle conversation for one signal block: system
    /// prompt, example pairs, then the signal.
    #[must_use]
    pub fn to_messages(&self, signal_block: &str) -> Vec<OracleMessage> {
        let mut messages = Vec::with_capacity(2 + self.examples.len() * 2);
        messages.push(OracleMessage::system(&self.system_prompt));
        for example in &self.examples {
            messages.push(OracleMessage::user(&example.input));
            match serde_json::to_string(&example.expected) {
                Ok(expected) => messages.push(OracleMessage::assistant(expected)),
                Err(error) => {
                    // A malformed example degrades to no example.
                    tracing::warn!(example_id = %example.id, error = %error, "Skipping unserializable example");
                    messages.pop();
                }
            }
        }
        messages.push(OracleMessage::user(signal_block));
        messages
    }
}

/// Every version of one template family, with one active at a time
pub struct TemplateRegistry {
    inner: RwLock<RegistryInner>,
}

struct RegistryInner {
    versions: BTreeMap<u32, PromptTemplate>,
    active: u32,
    archived: BTreeSet<u32>,
}

impl TemplateRegistry {
    /// Create a registry seeded with an initial template (version 1,
    /// active).
    #[must_use]
    pub fn new(mut initial: PromptTemplate) -> Self {
        initial.version = 1;
        let mut versions = BTreeMap::new();
        versions.insert(1, initial);
        Self {
            inner: RwLock::new(RegistryInner {
                versions,
                active: 1,
                archived: BTreeSet::new(),
            }),
        }
    }

    /// The active template, cloned for the caller.
    #[must_use]
    pub fn active(&self) -> PromptTemplate {
        let inner = self.inner.read();
        inner.versions[&inner.active].clone()
    }

    /// The active version number.
    #[must_use]
    pub fn active_version(&self) -> u32 {
        self.inner.read().active
    }

    /// A specific version, if registered.
    #[must_use]
    pub fn get(&self, version: u32) -> Option<PromptTemplate> {
        self.inner.read().versions.get(&version).cloned()
    }

    /// All version numbers, ascending, with archived flags.
    #[must_use]
    pub fn versions(&self) -> Vec<(u32, bool)> {
        let inner = self.inner.read();
        inner
            .versions
            .keys()
            .map(|&v| (v, inner.archived.contains(&v)))
            .collect()
    }

    /// Register a new version; its number is assigned monotonically.
    pub fn register(&self, mut template: PromptTemplate) -> u32 {
        let mut inner = self.inner.write();
        let version = inner.versions.keys().next_back().copied().unwrap_or(0) + 1;
        template.version = version;
        inner.versions.insert(version, template);
        version
    }

    /// Make a registered version active.
    pub fn activate(&self, version: u32) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.versions.contains_key(&version) {
            return Err(Error::NotFound(format!("template version {version}")));
        }
        inner.archived.remove(&version);
        inner.active = version;
        Ok(())
    }

    /// Mark a version archived (kept for history, never auto-selected).
    pub fn archive(&self, version: u32) {
        let mut inner = self.inner.write();
        if version != inner.active {
            inner.archived.insert(version);
        }
    }

    /// Record a terminal outcome against the version that classified
    /// the signal; per-example stats move with it.
    pub fn record_outcome(&self, version: u32, success: bool, confidence: f64, processing_ms: u64) {
        let mut inner = self.inner.write();
        if let Some(template) = inner.versions.get_mut(&version) {
            template.metrics.record(success, confidence, processing_ms);
            for example in &mut template.examples {
                example.uses += 1;
                if success {
                    example.successes += 1;
                }
            }
        }
    }

    /// Persist every version as one JSON record per line.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let templates: Vec<PromptTemplate> = {
            let inner = self.inner.read();
            inner.versions.values().cloned().collect()
        };
        let mut out = String::new();
        for template in &templates {
            out.push_str(&serde_json::to_string(template)?);
            out.push('\n');
        }
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, out).await?;
        Ok(())
    }

    /// Load a registry from a save file; the highest version becomes
    /// active.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let mut versions = BTreeMap::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let template: PromptTemplate = serde_json::from_str(line)?;
            versions.insert(template.version, template);
        }
        let active = *versions
            .keys()
            .next_back()
            .ok_or_else(|| Error::NotFound("no template versions in save file".to_string()))?;
        Ok(Self {
            inner: RwLock::new(RegistryInner {
                versions,
                active,
                archived: BTreeSet::new(),
            }),
        })
    }
}

/// Derives candidate templates from the feedback corpus
pub struct PromptOptimizer {
    /// Examples added per optimization round
    pub examples_per_round: usize,
}

impl Default for PromptOptimizer {
    fn default() -> Self {
        Self {
            examples_per_round: 3,
        }
    }
}

impl PromptOptimizer {
    /// Create an optimizer with the default round size.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a candidate from the active template and the corpus.
    ///
    /// Adds examples drawn from successful low-confidence records (the
    /// cases the oracle finds hard), removes examples whose expected
    /// category is contradicted by failed high-confidence records (the
    /// cases the examples mislead), and caps the total. Returns `None`
    /// when nothing would change.
    #[must_use]
    pub fn derive_candidate(
        &self,
        active: &PromptTemplate,
        records: &[FeedbackRecord],
    ) -> Option<PromptTemplate> {
        let mut candidate = active.clone();
        let next_version = active.version + 1;
        let mut changed = false;

        // Drop misleading examples first: their expected category shows
        // up in confidently-wrong outcomes.
        let misleading: BTreeSet<String> = records
            .iter()
            .filter(|r| {
                r.outcome == FeedbackOutcome::Failure && r.confidence_score > HIGH_CONFIDENCE
            })
            .map(|r| r.classification.category.to_string())
            .collect();
        let before = candidate.examples.len();
        candidate
            .examples
            .retain(|example| !misleading.contains(&example.expected.category.to_string()));
        if candidate.examples.len() != before {
            changed = true;
        }

        // Teach the hard cases: successful but low-confidence records.
        let existing: BTreeSet<&str> =
            candidate.examples.iter().map(|e| e.input.as_str()).collect();
        let mut added = 0usize;
        let mut new_examples = Vec::new();
        for record in records {
            if added >= self.examples_per_round {
                break;
            }
            if record.outcome != FeedbackOutcome::Success
                || record.confidence_score >= LOW_CONFIDENCE
            {
                continue;
            }
            let input = format!("Subject: {}\nFrom: {}", record.subject, record.sender);
            if existing.contains(input.as_str())
                || new_examples
                    .iter()
                    .any(|e: &PromptExample| e.input == input)
            {
                continue;
            }
            new_examples.push(PromptExample::new(
                input,
                record.classification.clone(),
                next_version,
            ));
            added += 1;
        }
        if !new_examples.is_empty() {
            changed = true;
            candidate.examples.extend(new_examples);
        }

        if !changed {
            return None;
        }

        // Cap: keep the most effective examples.
        if candidate.examples.len() > candidate.max_examples {
            candidate.examples.sort_by(|a, b| {
                b.effectiveness()
                    .partial_cmp(&a.effectiveness())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            });
            candidate.examples.truncate(candidate.max_examples);
        }

        candidate.version = next_version;
        candidate.metrics = TemplateMetrics::default();
        candidate.created_at = Utc::now();
        Some(candidate)
    }
}

struct Experiment {
    control: u32,
    candidate: u32,
    control_start: TemplateMetrics,
    candidate_start: TemplateMetrics,
}

struct RollbackWatch {
    activated: u32,
    prior: u32,
    baseline: f64,
    start: TemplateMetrics,
}

/// Splits traffic between the incumbent and a candidate, activates the
/// winner, and rolls back a degrading activation
pub struct AbSelector {
    registry: Arc<TemplateRegistry>,
    evaluations_per_variant: usize,
    degradation_threshold: f64,
    state: Mutex<AbState>,
}

#[derive(Default)]
struct AbState {
    experiment: Option<Experiment>,
    watch: Option<RollbackWatch>,
}

impl AbSelector {
    /// Create a selector over a registry with default tunables.
    pub fn new(registry: Arc<TemplateRegistry>) -> Self {
        Self::with_tunables(
            registry,
            DEFAULT_AB_EVALUATIONS,
            DEFAULT_AB_DEGRADATION_ROLLBACK,
        )
    }

    /// Create a selector with explicit tunables.
    pub fn with_tunables(
        registry: Arc<TemplateRegistry>,
        evaluations_per_variant: usize,
        degradation_threshold: f64,
    ) -> Self {
        Self {
            registry,
            evaluations_per_variant: evaluations_per_variant.max(1),
            degradation_threshold,
            state: Mutex::new(AbState::default()),
        }
    }

    /// Begin an experiment pitting a candidate against the incumbent.
    pub fn start_experiment(&self, candidate: PromptTemplate) -> u32 {
        let control = self.registry.active_version();
        let candidate_version = self.registry.register(candidate);
        let control_start = self
            .registry
            .get(control)
            .map(|t| t.metrics)
            .unwrap_or_default();
        let mut state = self.state.lock();
        state.experiment = Some(Experiment {
            control,
            candidate: candidate_version,
            control_start,
            candidate_start: TemplateMetrics::default(),
        });
        tracing::info!(control, candidate = candidate_version, "A/B experiment started");
        candidate_version
    }

    /// True while an experiment is collecting evaluations.
    #[must_use]
    pub fn experiment_running(&self) -> bool {
        self.state.lock().experiment.is_some()
    }

    /// Pick the template for the next classification: a fair coin
    /// between control and candidate during an experiment, the active
    /// template otherwise.
    #[must_use]
    pub fn select(&self) -> PromptTemplate {
        let state = self.state.lock();
        if let Some(experiment) = &state.experiment {
            let version = if rand::random::<bool>() {
                experiment.candidate
            } else {
                experiment.control
            };
            if let Some(template) = self.registry.get(version) {
                return template;
            }
        }
        drop(state);
        self.registry.active()
    }

    /// Record a terminal outcome for the version that classified the
    /// signal, concluding the experiment or rolling back as warranted.
    pub fn record_outcome(&self, version: u32, success: bool, confidence: f64, processing_ms: u64) {
        self.registry
            .record_outcome(version, success, confidence, processing_ms);

        let mut state = self.state.lock();
        if state.experiment.is_some() {
            self.maybe_conclude(&mut state);
        } else if state.watch.is_some() {
            self.maybe_rollback(&mut state);
        }
    }

    fn rate_since(now: TemplateMetrics, start: TemplateMetrics) -> (u64, f64) {
        let evaluations = now.evaluations.saturating_sub(start.evaluations);
        if evaluations == 0 {
            return (0, 0.0);
        }
        let successes = now.successes.saturating_sub(start.successes);
        (evaluations, successes as f64 / evaluations as f64)
    }

    fn maybe_conclude(&self, state: &mut AbState) {
        let Some(experiment) = &state.experiment else {
            return;
        };
        let (Some(control), Some(candidate)) = (
            self.registry.get(experiment.control),
            self.registry.get(experiment.candidate),
        ) else {
            state.experiment = None;
            return;
        };

        let (control_evals, control_rate) =
            Self::rate_since(control.metrics, experiment.control_start);
        let (candidate_evals, candidate_rate) =
            Self::rate_since(candidate.metrics, experiment.candidate_start);
        let needed = self.evaluations_per_variant as u64;
        if control_evals < needed || candidate_evals < needed {
            return;
        }

        if candidate_rate > control_rate {
            // Rollback compares against the prior template's running
            // baseline, not just its experiment-window rate.
            let baseline = control.metrics.success_rate();
            if let Err(error) = self.registry.activate(experiment.candidate) {
                tracing::warn!(error = %error, "Failed to activate experiment winner");
                state.experiment = None;
                return;
            }
            tracing::info!(
                winner = experiment.candidate,
                control_rate,
                candidate_rate,
                "A/B experiment concluded; candidate activated"
            );
            state.watch = Some(RollbackWatch {
                activated: experiment.candidate,
                prior: experiment.control,
                baseline,
                start: candidate.metrics,
            });
        } else {
            self.registry.archive(experiment.candidate);
            tracing::info!(
                winner = experiment.control,
                control_rate,
                candidate_rate,
                "A/B experiment concluded; control retained"
            );
        }
        state.experiment = None;
    }

    fn maybe_rollback(&self, state: &mut AbState) {
        let Some(watch) = &state.watch else {
            return;
        };
        if self.registry.active_version() != watch.activated {
            state.watch = None;
            return;
        }
        let Some(active) = self.registry.get(watch.activated) else {
            state.watch = None;
            return;
        };

        let (evaluations, rate) = Self::rate_since(active.metrics, watch.start);
        if evaluations < ROLLBACK_MIN_EVALUATIONS {
            return;
        }
        if rate < watch.baseline - self.degradation_threshold {
            tracing::warn!(
                degraded = watch.activated,
                reactivated = watch.prior,
                baseline = watch.baseline,
                observed = rate,
                "Template degradation detected; rolling back"
            );
            if let Err(error) = self.registry.activate(watch.prior) {
                tracing::warn!(error = %error, "Rollback activation failed");
            } else {
                self.registry.archive(watch.activated);
            }
            state.watch = None;
        } else if rate >= watch.baseline {
            // Holding at or above baseline: the activation stands.
            state.watch = None;
        }
    }
}
