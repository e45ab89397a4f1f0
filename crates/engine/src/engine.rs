//! The experiment engine: definitions, eligibility, sticky assignment,
//! event tracking and results, over injected store, directory and context.

use dashmap::DashMap;
use experiment_core::config::EngineConfig;
use experiment_core::types::{
    Experiment, ExperimentResults, ExperimentStatus, ExperimentUpdate, NewExperiment, Participant,
    ParticipantEvent, UserProfile, Variant, Winner,
};
use experiment_core::{validate_experiment, ExperimentError, ExperimentResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::assignment::compute_variant;
use crate::audience::is_eligible;
use crate::clock::{Clock, SystemClock};
use crate::fence::CommitFence;
use crate::flags::{matching_rule, variant_value, FlagEvaluation, FlagReason};
use crate::hashing::{Sha256Hash, StableHash};
use crate::insights::{experiment_insights, TypeInsight};
use crate::lifecycle::{next_status, StatusChange};
use crate::results::{compute_results, derive_metrics, ExperimentReport, ReportSettings};
use crate::stats::{SignificanceTest, TwoProportionZTest};
use crate::store::{ExperimentStore, UserDirectory};

/// Hash function, clock, significance method and tuning passed explicitly
/// into the engine.
#[derive(Clone)]
pub struct EngineContext {
    pub hasher: Arc<dyn StableHash>,
    pub clock: Arc<dyn Clock>,
    pub significance: Arc<dyn SignificanceTest>,
    pub settings: EngineConfig,
}

impl EngineContext {
    pub fn from_config(settings: &EngineConfig) -> Self {
        Self {
            hasher: Arc::new(Sha256Hash),
            clock: Arc::new(SystemClock),
            significance: Arc::new(TwoProportionZTest),
            settings: settings.clone(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn report_settings(&self) -> ReportSettings {
        ReportSettings {
            alpha: self.settings.alpha,
            min_sample_size: self.settings.min_sample_size,
        }
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Clone)]
pub struct ExperimentEngine {
    store: Arc<dyn ExperimentStore>,
    users: Arc<dyn UserDirectory>,
    ctx: EngineContext,
    /// Serializes definition writes per experiment.
    write_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    /// Set on per-call handles from [`ExperimentEngine::with_fence`].
    fence: Option<Arc<CommitFence>>,
}

impl ExperimentEngine {
    pub fn new(store: Arc<dyn ExperimentStore>, users: Arc<dyn UserDirectory>, ctx: EngineContext) -> Self {
        info!(
            method = ctx.significance.name(),
            alpha = ctx.settings.alpha,
            min_sample_size = ctx.settings.min_sample_size,
            "Experiment engine initialized"
        );
        Self {
            store,
            users,
            ctx,
            write_locks: Arc::new(DashMap::new()),
            fence: None,
        }
    }

    /// Handle sharing this engine's state whose writes are gated by `fence`.
    pub fn with_fence(&self, fence: Arc<CommitFence>) -> Self {
        Self {
            fence: Some(fence),
            ..self.clone()
        }
    }

    // ─── Definitions ────────────────────────────────────────────────────

    pub fn create_experiment(&self, req: NewExperiment) -> ExperimentResult<Experiment> {
        let now = self.ctx.clock.now();
        let experiment = Experiment {
            id: Uuid::new_v4(),
            name: req.name,
            description: req.description,
            experiment_type: req.experiment_type,
            status: ExperimentStatus::Draft,
            audience: req.audience,
            variants: req.variants,
            goals: req.goals,
            schedule: req.schedule,
            results: ExperimentResults::default(),
            feature_flag: req.feature_flag,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        validate_experiment(&experiment)?;
        self.begin_commit()?;
        self.store.insert_experiment(experiment.clone())?;

        info!(
            experiment = %experiment.name,
            id = %experiment.id,
            variants = experiment.variants.len(),
            "Experiment created"
        );
        metrics::counter!("experiments.created").increment(1);
        Ok(experiment)
    }

    /// Apply a partial definition update. Recorded participants keep their
    /// variants even when weights change.
    pub fn update_experiment(&self, id: Uuid, update: ExperimentUpdate) -> ExperimentResult<Experiment> {
        let lock = self.write_lock(id);
        let _guard = lock.lock();

        let mut experiment = self.load(id)?;
        if experiment.status == ExperimentStatus::Archived {
            return Err(ExperimentError::Config(format!(
                "experiment '{}' is archived and read-only",
                experiment.name
            )));
        }
        if let Some(description) = update.description {
            experiment.description = description;
        }
        if let Some(audience) = update.audience {
            experiment.audience = audience;
        }
        if let Some(variants) = update.variants {
            self.check_variant_removal(&experiment, &variants)?;
            experiment.variants = variants;
        }
        if let Some(goals) = update.goals {
            experiment.goals = goals;
        }
        if let Some(schedule) = update.schedule {
            experiment.schedule = schedule;
        }
        if let Some(flag) = update.feature_flag {
            experiment.feature_flag = flag;
        }
        if let Some(metadata) = update.metadata {
            experiment.metadata = metadata;
        }
        experiment.updated_at = self.ctx.clock.now();

        validate_experiment(&experiment)?;
        self.begin_commit()?;
        self.store.save_experiment(&experiment)?;
        info!(experiment = %experiment.name, "Experiment updated");
        Ok(experiment)
    }

    /// Explicit status write, checked against the transition table.
    pub fn set_status(&self, id: Uuid, status: ExperimentStatus) -> ExperimentResult<Experiment> {
        let lock = self.write_lock(id);
        let _guard = lock.lock();

        let mut experiment = self.load(id)?;
        if experiment.status == status {
            return Ok(experiment);
        }
        if !experiment.status.can_transition_to(status) {
            return Err(ExperimentError::InvalidTransition {
                from: experiment.status.to_string(),
                to: status.to_string(),
            });
        }
        let from = experiment.status;
        experiment.status = status;
        experiment.updated_at = self.ctx.clock.now();
        self.begin_commit()?;
        self.store.save_experiment(&experiment)?;
        info!(experiment = %experiment.name, %from, to = %status, "Experiment status changed");
        Ok(experiment)
    }

    pub fn get_experiment(&self, id: Uuid) -> ExperimentResult<Experiment> {
        self.load(id)
    }

    pub fn get_experiment_by_name(&self, name: &str) -> ExperimentResult<Experiment> {
        self.store
            .get_experiment_by_name(name)?
            .ok_or_else(|| ExperimentError::not_found("experiment", name))
    }

    pub fn list_experiments(&self) -> ExperimentResult<Vec<Experiment>> {
        self.store.list_experiments()
    }

    // ─── Targeting & assignment ─────────────────────────────────────────

    pub fn is_user_in_experiment(&self, id: Uuid, user_id: &str) -> ExperimentResult<bool> {
        let experiment = self.load(id)?;
        let user = self.load_user(user_id)?;
        Ok(is_eligible(
            &experiment,
            &user,
            self.ctx.clock.now(),
            self.ctx.hasher.as_ref(),
        ))
    }

    /// Sticky variant for `user_id`. A recorded assignment is returned as
    /// is; otherwise a variant is computed and recorded while the experiment
    /// is active. `None` means the experiment is not accepting new users.
    pub fn assign_variant(&self, id: Uuid, user_id: &str) -> ExperimentResult<Option<String>> {
        let experiment = self.load(id)?;
        self.assign_loaded(&experiment, user_id)
    }

    /// Eligibility check followed by assignment. Already-enrolled users keep
    /// their variant even if they no longer match the audience.
    pub fn enroll(&self, id: Uuid, user_id: &str) -> ExperimentResult<Option<String>> {
        let experiment = self.load(id)?;
        if let Some(existing) = self.store.get_participant(experiment.id, user_id)? {
            return Ok(Some(existing.assigned_variant));
        }
        let user = self.load_user(user_id)?;
        if !is_eligible(&experiment, &user, self.ctx.clock.now(), self.ctx.hasher.as_ref()) {
            debug!(experiment = %experiment.name, user = user_id, "User not eligible");
            return Ok(None);
        }
        self.assign_loaded(&experiment, user_id)
    }

    fn assign_loaded(&self, experiment: &Experiment, user_id: &str) -> ExperimentResult<Option<String>> {
        if let Some(existing) = self.store.get_participant(experiment.id, user_id)? {
            return Ok(Some(existing.assigned_variant));
        }

        let now = self.ctx.clock.now();
        if !experiment.is_active_at(now) {
            debug!(experiment = %experiment.name, status = %experiment.status, "Experiment not accepting new participants");
            return Ok(None);
        }

        let variant = compute_variant(experiment, user_id, self.ctx.hasher.as_ref())
            .ok_or_else(|| ExperimentError::Config(format!("experiment '{}' has no variants", experiment.name)))?
            .name
            .clone();

        self.begin_commit()?;
        let stored = self
            .store
            .insert_participant_if_absent(experiment.id, Participant::new(user_id, variant.as_str(), now))?;
        if stored.assigned_variant != variant {
            debug!(
                experiment = %experiment.name,
                user = user_id,
                "Concurrent first assignment resolved to existing record"
            );
        }
        metrics::counter!("experiments.assignments").increment(1);
        Ok(Some(stored.assigned_variant))
    }

    // ─── Events ─────────────────────────────────────────────────────────

    /// Record an event for an enrolled participant. Returns `false` (and
    /// records nothing) when the user was never assigned.
    pub fn track_event(
        &self,
        id: Uuid,
        user_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> ExperimentResult<bool> {
        if event_type.trim().is_empty() {
            return Err(ExperimentError::Config("event type must not be empty".to_string()));
        }
        let experiment = self.load(id)?;
        let event = ParticipantEvent {
            event_type: event_type.to_string(),
            timestamp: self.ctx.clock.now(),
            data,
        };
        self.begin_commit()?;
        let recorded = self.store.append_event(experiment.id, user_id, event)?;
        if recorded {
            metrics::counter!("experiments.events_tracked").increment(1);
        } else {
            debug!(experiment = %experiment.name, user = user_id, event_type, "Event for non-participant ignored");
        }
        Ok(recorded)
    }

    // ─── Results ────────────────────────────────────────────────────────

    /// Recompute metrics from tracked events, persist them and build the report.
    pub fn get_results(&self, id: Uuid) -> ExperimentResult<ExperimentReport> {
        let lock = self.write_lock(id);
        let _guard = lock.lock();

        let mut experiment = self.load(id)?;
        let participants = self.store.participants(experiment.id)?;
        let metrics = derive_metrics(&experiment, &participants);
        if metrics != experiment.results.metrics {
            experiment.results.metrics = metrics.clone();
            self.begin_commit()?;
            self.store.save_experiment(&experiment)?;
        }
        Ok(compute_results(
            &experiment,
            &participants,
            &metrics,
            self.ctx.significance.as_ref(),
            self.ctx.report_settings(),
            self.ctx.clock.now(),
        ))
    }

    /// Record `variant` as the winner with the current report's improvement
    /// and confidence (either may be absent).
    pub fn declare_winner(&self, id: Uuid, variant: &str) -> ExperimentResult<Winner> {
        let lock = self.write_lock(id);
        let _guard = lock.lock();

        let mut experiment = self.load(id)?;
        if experiment.variant(variant).is_none() {
            return Err(ExperimentError::not_found("variant", variant));
        }
        let participants = self.store.participants(experiment.id)?;
        let metrics = derive_metrics(&experiment, &participants);
        let now = self.ctx.clock.now();
        let report = compute_results(
            &experiment,
            &participants,
            &metrics,
            self.ctx.significance.as_ref(),
            self.ctx.report_settings(),
            now,
        );
        let performance = report.variant_performance.get(variant);
        let winner = Winner {
            variant: variant.to_string(),
            confidence: performance.and_then(|p| p.significance.map(|s| s.confidence)),
            improvement: performance.and_then(|p| p.improvement),
            declared_at: now,
        };

        experiment.results.metrics = metrics;
        experiment.results.winner = Some(winner.clone());
        experiment.updated_at = now;
        self.begin_commit()?;
        self.store.save_experiment(&experiment)?;
        info!(
            experiment = %experiment.name,
            variant,
            improvement = ?winner.improvement,
            confidence = ?winner.confidence,
            "Winner declared"
        );
        Ok(winner)
    }

    // ─── Cross-experiment queries ───────────────────────────────────────

    /// Running experiments inside their schedule that `user_id` is eligible for.
    pub fn active_experiments_for_user(&self, user_id: &str) -> ExperimentResult<Vec<Experiment>> {
        let user = self.load_user(user_id)?;
        let now = self.ctx.clock.now();
        let running = self
            .store
            .find_by_status(&[ExperimentStatus::Running], Some(now))?;
        Ok(running
            .into_iter()
            .filter(|exp| is_eligible(exp, &user, now, self.ctx.hasher.as_ref()))
            .collect())
    }

    pub fn insights(&self, timeframe_days: Option<i64>) -> ExperimentResult<Vec<TypeInsight>> {
        let experiments = self.store.list_experiments()?;
        Ok(experiment_insights(
            &experiments,
            self.ctx.clock.now(),
            timeframe_days.unwrap_or(self.ctx.settings.insights_timeframe_days),
        ))
    }

    pub fn evaluate_flag(&self, key: &str, user_id: &str) -> ExperimentResult<FlagEvaluation> {
        let experiment = self
            .store
            .get_experiment_by_flag_key(key)?
            .ok_or_else(|| ExperimentError::not_found("feature flag", key))?;
        let default = experiment
            .feature_flag
            .as_ref()
            .map(|f| f.default_value.clone())
            .unwrap_or_default();
        let fallback = |reason| FlagEvaluation {
            key: key.to_string(),
            value: default.clone(),
            variant: None,
            reason,
        };

        let now = self.ctx.clock.now();
        if !experiment.is_active_at(now) {
            return Ok(fallback(FlagReason::Inactive));
        }

        let user = self.load_user(user_id)?;
        if let Some(rule) = matching_rule(&experiment, &user) {
            return Ok(FlagEvaluation {
                key: key.to_string(),
                value: rule.value.clone(),
                variant: None,
                reason: FlagReason::Rule,
            });
        }

        let enrolled = self.store.get_participant(experiment.id, user_id)?.is_some();
        if !enrolled && !is_eligible(&experiment, &user, now, self.ctx.hasher.as_ref()) {
            return Ok(fallback(FlagReason::NotTargeted));
        }

        match self.assign_loaded(&experiment, user_id)? {
            Some(variant) => Ok(FlagEvaluation {
                key: key.to_string(),
                value: variant_value(&experiment, &variant),
                variant: Some(variant),
                reason: FlagReason::Variant,
            }),
            None => Ok(fallback(FlagReason::Inactive)),
        }
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    /// Apply [`next_status`] to every draft and running experiment.
    pub fn run_status_transitions(&self) -> ExperimentResult<Vec<StatusChange>> {
        let now = self.ctx.clock.now();
        let candidates = self
            .store
            .find_by_status(&[ExperimentStatus::Draft, ExperimentStatus::Running], Some(now))?;

        let mut changes = Vec::new();
        for candidate in candidates {
            if next_status(&candidate, now).is_none() {
                continue;
            }
            let lock = self.write_lock(candidate.id);
            let _guard = lock.lock();

            // Re-read under the lock; an explicit write may have raced us.
            let mut experiment = self.load(candidate.id)?;
            let Some(to) = next_status(&experiment, now) else {
                continue;
            };
            let from = experiment.status;
            experiment.status = to;
            experiment.updated_at = now;
            self.begin_commit()?;
            self.store.save_experiment(&experiment)?;
            info!(experiment = %experiment.name, %from, %to, "Scheduled status transition");
            changes.push(StatusChange {
                experiment_id: experiment.id,
                experiment_name: experiment.name.clone(),
                from,
                to,
            });
        }
        Ok(changes)
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    /// Variants with recorded participants must stay declared.
    fn check_variant_removal(&self, experiment: &Experiment, variants: &[Variant]) -> ExperimentResult<()> {
        let removed: Vec<&str> = experiment
            .variants
            .iter()
            .map(|v| v.name.as_str())
            .filter(|name| !variants.iter().any(|v| v.name == *name))
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        let participants = self.store.participants(experiment.id)?;
        if let Some(name) = removed
            .into_iter()
            .find(|name| participants.iter().any(|p| p.assigned_variant == *name))
        {
            return Err(ExperimentError::Conflict(format!(
                "variant '{name}' of experiment '{}' has recorded participants",
                experiment.name
            )));
        }
        Ok(())
    }

    fn load(&self, id: Uuid) -> ExperimentResult<Experiment> {
        self.store
            .get_experiment(id)?
            .ok_or_else(|| ExperimentError::not_found("experiment", id))
    }

    fn load_user(&self, user_id: &str) -> ExperimentResult<UserProfile> {
        self.users
            .get_user(user_id)?
            .ok_or_else(|| ExperimentError::not_found("user", user_id))
    }

    fn begin_commit(&self) -> ExperimentResult<()> {
        match &self.fence {
            Some(fence) => fence.begin_commit(),
            None => Ok(()),
        }
    }

    fn write_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.write_locks.entry(id).or_default().value().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::results::RecommendationAction;
    use crate::store::{InMemoryExperimentStore, InMemoryUserDirectory};
    use crate::test_support::{new_experiment, user, variant};
    use chrono::{Duration, Utc};
    use experiment_core::types::{FeatureFlag, FlagRule, Segment, SegmentOperator, SegmentType};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        engine: ExperimentEngine,
        store: Arc<InMemoryExperimentStore>,
        users: Arc<InMemoryUserDirectory>,
        clock: Arc<FixedClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryExperimentStore::new());
        let users = Arc::new(InMemoryUserDirectory::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let ctx = EngineContext::default().with_clock(clock.clone());
        let engine = ExperimentEngine::new(store.clone(), users.clone(), ctx);
        Harness {
            engine,
            store,
            users,
            clock,
        }
    }

    fn running(h: &Harness, name: &str) -> Experiment {
        let exp = h
            .engine
            .create_experiment(new_experiment(name, h.clock.now() - Duration::days(1)))
            .unwrap();
        h.engine.set_status(exp.id, ExperimentStatus::Running).unwrap()
    }

    #[test]
    fn test_created_in_draft_and_validated() {
        let h = harness();
        let exp = h
            .engine
            .create_experiment(new_experiment("drafted", h.clock.now()))
            .unwrap();
        assert_eq!(exp.status, ExperimentStatus::Draft);

        let mut bad = new_experiment("no-variants", h.clock.now());
        bad.variants.clear();
        assert!(matches!(h.engine.create_experiment(bad), Err(ExperimentError::Config(_))));
        assert!(h.engine.get_experiment_by_name("no-variants").is_err());
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let h = harness();
        h.engine.create_experiment(new_experiment("dup", h.clock.now())).unwrap();
        let err = h.engine.create_experiment(new_experiment("dup", h.clock.now())).unwrap_err();
        assert!(matches!(err, ExperimentError::Conflict(_)));
    }

    #[test]
    fn test_assignment_is_deterministic_and_recorded() {
        let h = harness();
        let exp = running(&h, "deterministic");
        let first = h.engine.assign_variant(exp.id, "u1").unwrap().unwrap();
        for _ in 0..20 {
            assert_eq!(h.engine.assign_variant(exp.id, "u1").unwrap().unwrap(), first);
        }
        assert_eq!(h.store.participant_count(exp.id).unwrap(), 1);
    }

    #[test]
    fn test_assignment_sticky_across_weight_changes() {
        let h = harness();
        let exp = running(&h, "sticky");
        let original = h.engine.assign_variant(exp.id, "u1").unwrap().unwrap();

        // Route all new traffic to whichever variant u1 did not get.
        let variants = exp
            .variants
            .iter()
            .map(|v| {
                let weight = if v.name == original { 0.0 } else { 100.0 };
                variant(&v.name, weight, v.is_control)
            })
            .collect();
        h.engine
            .update_experiment(
                exp.id,
                ExperimentUpdate {
                    variants: Some(variants),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(h.engine.assign_variant(exp.id, "u1").unwrap().unwrap(), original);
        let newcomer = h.engine.assign_variant(exp.id, "u2").unwrap().unwrap();
        assert_ne!(newcomer, original);
    }

    #[test]
    fn test_no_new_assignments_when_inactive() {
        let h = harness();
        let exp = h
            .engine
            .create_experiment(new_experiment("draft-only", h.clock.now()))
            .unwrap();
        assert_eq!(h.engine.assign_variant(exp.id, "u1").unwrap(), None);
        assert_eq!(h.store.participant_count(exp.id).unwrap(), 0);
    }

    #[test]
    fn test_recorded_assignment_survives_pause() {
        let h = harness();
        let exp = running(&h, "paused");
        let v = h.engine.assign_variant(exp.id, "u1").unwrap().unwrap();
        h.engine.set_status(exp.id, ExperimentStatus::Paused).unwrap();
        assert_eq!(h.engine.assign_variant(exp.id, "u1").unwrap(), Some(v));
        assert_eq!(h.engine.assign_variant(exp.id, "u2").unwrap(), None);
    }

    #[test]
    fn test_enroll_applies_audience() {
        let h = harness();
        let mut req = new_experiment("pro-only", h.clock.now() - Duration::days(1));
        req.audience.segments.push(Segment {
            segment_type: SegmentType::Subscription,
            field: None,
            value: json!("pro"),
            operator: SegmentOperator::Equals,
        });
        let exp = h.engine.create_experiment(req).unwrap();
        h.engine.set_status(exp.id, ExperimentStatus::Running).unwrap();

        h.users.upsert(user("free-user"));
        let mut pro = user("pro-user");
        pro.subscription.plan = "pro".into();
        h.users.upsert(pro);

        assert!(!h.engine.is_user_in_experiment(exp.id, "free-user").unwrap());
        assert_eq!(h.engine.enroll(exp.id, "free-user").unwrap(), None);
        assert!(h.engine.is_user_in_experiment(exp.id, "pro-user").unwrap());
        assert!(h.engine.enroll(exp.id, "pro-user").unwrap().is_some());
        assert_eq!(h.store.participant_count(exp.id).unwrap(), 1);
    }

    #[test]
    fn test_unknown_user_and_experiment_are_not_found() {
        let h = harness();
        let exp = running(&h, "lookup");
        assert!(matches!(
            h.engine.is_user_in_experiment(exp.id, "nobody"),
            Err(ExperimentError::NotFound { kind: "user", .. })
        ));
        assert!(matches!(
            h.engine.assign_variant(Uuid::new_v4(), "u1"),
            Err(ExperimentError::NotFound { kind: "experiment", .. })
        ));
    }

    #[test]
    fn test_track_event_for_unassigned_user_is_noop() {
        let h = harness();
        let exp = running(&h, "tracking");
        assert!(!h.engine.track_event(exp.id, "ghost", "purchase", json!({})).unwrap());
        assert_eq!(h.store.participant_count(exp.id).unwrap(), 0);
    }

    #[test]
    fn test_track_event_appends_and_updates_last_seen() {
        let h = harness();
        let exp = running(&h, "tracking");
        h.engine.assign_variant(exp.id, "u1").unwrap();
        h.clock.advance(Duration::minutes(10));
        assert!(h.engine.track_event(exp.id, "u1", "view", json!(null)).unwrap());
        assert!(h.engine.track_event(exp.id, "u1", "purchase", json!({"value": 20})).unwrap());

        let p = h.store.get_participant(exp.id, "u1").unwrap().unwrap();
        let types: Vec<&str> = p.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["view", "purchase"]);
        assert_eq!(p.last_seen, h.clock.now());
        assert!(p.first_seen < p.last_seen);
    }

    #[test]
    fn test_results_persist_metrics() {
        let h = harness();
        let exp = running(&h, "results");
        for i in 0..40 {
            let uid = format!("u{i}");
            h.engine.assign_variant(exp.id, &uid).unwrap();
            if i % 4 == 0 {
                h.engine.track_event(exp.id, &uid, "purchase", json!(null)).unwrap();
            }
        }
        let report = h.engine.get_results(exp.id).unwrap();
        assert_eq!(report.summary.total_participants, 40);
        let distributed: u64 = report.summary.variant_distribution.values().sum();
        assert_eq!(distributed, 40);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.action == RecommendationAction::CollectMoreData));

        let stored = h.engine.get_experiment(exp.id).unwrap();
        assert_eq!(stored.results.metrics.len(), 2);
        assert!(stored.results.winner.is_none());
    }

    #[test]
    fn test_declare_winner() {
        let h = harness();
        let exp = running(&h, "winner");
        assert!(matches!(
            h.engine.declare_winner(exp.id, "purple"),
            Err(ExperimentError::NotFound { kind: "variant", .. })
        ));
        let winner = h.engine.declare_winner(exp.id, "treatment").unwrap();
        assert_eq!(winner.variant, "treatment");
        // No data yet: nothing to measure against.
        assert_eq!(winner.confidence, None);
        let stored = h.engine.get_experiment(exp.id).unwrap();
        assert_eq!(stored.results.winner, Some(winner));
    }

    #[test]
    fn test_status_transitions_enforced() {
        let h = harness();
        let exp = h.engine.create_experiment(new_experiment("flow", h.clock.now())).unwrap();
        assert!(matches!(
            h.engine.set_status(exp.id, ExperimentStatus::Paused),
            Err(ExperimentError::InvalidTransition { .. })
        ));
        h.engine.set_status(exp.id, ExperimentStatus::Running).unwrap();
        h.engine.set_status(exp.id, ExperimentStatus::Completed).unwrap();
        h.engine.set_status(exp.id, ExperimentStatus::Archived).unwrap();
        let err = h
            .engine
            .update_experiment(exp.id, ExperimentUpdate::default())
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Config(_)));
    }

    #[test]
    fn test_scheduler_starts_and_completes() {
        let h = harness();
        let mut req = new_experiment("scheduled", h.clock.now() + Duration::hours(1));
        req.schedule.end_date = Some(h.clock.now() + Duration::days(2));
        let exp = h.engine.create_experiment(req).unwrap();

        assert!(h.engine.run_status_transitions().unwrap().is_empty());

        h.clock.advance(Duration::hours(2));
        let changes = h.engine.run_status_transitions().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, ExperimentStatus::Running);

        h.clock.advance(Duration::days(3));
        let changes = h.engine.run_status_transitions().unwrap();
        assert_eq!(changes[0].from, ExperimentStatus::Running);
        assert_eq!(changes[0].to, ExperimentStatus::Completed);
        assert_eq!(h.engine.get_experiment(exp.id).unwrap().status, ExperimentStatus::Completed);
    }

    #[test]
    fn test_active_experiments_for_user() {
        let h = harness();
        let a = running(&h, "active-a");
        running(&h, "active-b");
        h.engine.create_experiment(new_experiment("still-draft", h.clock.now())).unwrap();
        let mut gated = new_experiment("gated", h.clock.now() - Duration::days(1));
        gated.audience.percentage = 0.0;
        let gated = h.engine.create_experiment(gated).unwrap();
        h.engine.set_status(gated.id, ExperimentStatus::Running).unwrap();
        h.users.upsert(user("u1"));

        let active = h.engine.active_experiments_for_user("u1").unwrap();
        let names: Vec<&str> = active.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(active.len(), 2);
        assert!(names.contains(&a.name.as_str()));
        assert!(!names.contains(&"gated"));
    }

    #[test]
    fn test_feature_flag_evaluation() {
        let h = harness();
        let mut req = new_experiment("bulk-editor", h.clock.now() - Duration::days(1));
        req.experiment_type = experiment_core::types::ExperimentType::FeatureFlag;
        req.variants[1].config = json!(true);
        req.feature_flag = Some(FeatureFlag {
            key: "bulk-editor".into(),
            default_value: json!(false),
            rules: vec![FlagRule {
                condition: vec![Segment {
                    segment_type: SegmentType::UserType,
                    field: None,
                    value: json!("admin"),
                    operator: SegmentOperator::Equals,
                }],
                value: json!(true),
                priority: 1,
            }],
        });
        let exp = h.engine.create_experiment(req).unwrap();
        let mut admin = user("admin-1");
        admin.role = "admin".into();
        h.users.upsert(admin);
        h.users.upsert(user("u1"));

        let eval = h.engine.evaluate_flag("bulk-editor", "u1").unwrap();
        assert_eq!(eval.reason, FlagReason::Inactive);
        assert_eq!(eval.value, json!(false));

        h.engine.set_status(exp.id, ExperimentStatus::Running).unwrap();
        let eval = h.engine.evaluate_flag("bulk-editor", "admin-1").unwrap();
        assert_eq!(eval.reason, FlagReason::Rule);
        assert_eq!(eval.value, json!(true));

        let eval = h.engine.evaluate_flag("bulk-editor", "u1").unwrap();
        assert_eq!(eval.reason, FlagReason::Variant);
        let assigned = eval.variant.clone().unwrap();
        assert_eq!(eval.value, json!(assigned == "treatment"));

        assert!(matches!(
            h.engine.evaluate_flag("missing", "u1"),
            Err(ExperimentError::NotFound { kind: "feature flag", .. })
        ));
    }

    #[test]
    fn test_insights_use_declared_winners() {
        let h = harness();
        let exp = running(&h, "insight");
        h.engine.declare_winner(exp.id, "treatment").unwrap();
        let insights = h.engine.insights(None).unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].count, 1);
        // Winner without measurable improvement does not count as success.
        assert_eq!(insights[0].success_rate, 0.0);
    }

    /// Store that can be switched into an outage.
    struct FlakyStore {
        inner: InMemoryExperimentStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> ExperimentResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(ExperimentError::StorageUnavailable("store offline".into()))
            } else {
                Ok(())
            }
        }
    }

    impl ExperimentStore for FlakyStore {
        fn insert_experiment(&self, experiment: Experiment) -> ExperimentResult<()> {
            self.check()?;
            self.inner.insert_experiment(experiment)
        }
        fn save_experiment(&self, experiment: &Experiment) -> ExperimentResult<()> {
            self.check()?;
            self.inner.save_experiment(experiment)
        }
        fn get_experiment(&self, id: Uuid) -> ExperimentResult<Option<Experiment>> {
            self.inner.get_experiment(id)
        }
        fn get_experiment_by_name(&self, name: &str) -> ExperimentResult<Option<Experiment>> {
            self.inner.get_experiment_by_name(name)
        }
        fn get_experiment_by_flag_key(&self, key: &str) -> ExperimentResult<Option<Experiment>> {
            self.inner.get_experiment_by_flag_key(key)
        }
        fn list_experiments(&self) -> ExperimentResult<Vec<Experiment>> {
            self.inner.list_experiments()
        }
        fn find_by_status(
            &self,
            statuses: &[ExperimentStatus],
            started_by: Option<chrono::DateTime<Utc>>,
        ) -> ExperimentResult<Vec<Experiment>> {
            self.inner.find_by_status(statuses, started_by)
        }
        fn get_participant(&self, experiment_id: Uuid, user_id: &str) -> ExperimentResult<Option<Participant>> {
            self.inner.get_participant(experiment_id, user_id)
        }
        fn insert_participant_if_absent(
            &self,
            experiment_id: Uuid,
            participant: Participant,
        ) -> ExperimentResult<Participant> {
            self.check()?;
            self.inner.insert_participant_if_absent(experiment_id, participant)
        }
        fn append_event(&self, experiment_id: Uuid, user_id: &str, event: ParticipantEvent) -> ExperimentResult<bool> {
            self.check()?;
            self.inner.append_event(experiment_id, user_id, event)
        }
        fn participants(&self, experiment_id: Uuid) -> ExperimentResult<Vec<Participant>> {
            self.inner.participants(experiment_id)
        }
        fn participant_count(&self, experiment_id: Uuid) -> ExperimentResult<usize> {
            self.inner.participant_count(experiment_id)
        }
    }

    #[test]
    fn test_storage_outage_is_retryable_and_records_nothing() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryExperimentStore::new(),
            down: AtomicBool::new(false),
        });
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let engine = ExperimentEngine::new(
            store.clone(),
            Arc::new(InMemoryUserDirectory::new()),
            EngineContext::default().with_clock(clock.clone()),
        );
        let exp = engine
            .create_experiment(new_experiment("outage", clock.now() - Duration::days(1)))
            .unwrap();
        engine.set_status(exp.id, ExperimentStatus::Running).unwrap();

        store.down.store(true, Ordering::SeqCst);
        let err = engine.assign_variant(exp.id, "u1").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.participant_count(exp.id).unwrap(), 0);

        store.down.store(false, Ordering::SeqCst);
        assert!(engine.assign_variant(exp.id, "u1").unwrap().is_some());
    }

    #[test]
    fn test_concurrent_first_assignment_converges() {
        let h = harness();
        let exp = running(&h, "race");
        let engine = Arc::new(h.engine);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || engine.assign_variant(exp.id, "u1").unwrap().unwrap())
            })
            .collect();
        let variants: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(variants.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.store.participant_count(exp.id).unwrap(), 1);
    }

    #[test]
    fn test_variant_with_participants_cannot_be_removed() {
        let h = harness();
        let exp = running(&h, "shrinking");
        let assigned = h.engine.assign_variant(exp.id, "u1").unwrap().unwrap();
        let remaining: Vec<_> = exp
            .variants
            .iter()
            .filter(|v| v.name != assigned)
            .map(|v| variant(&v.name, 100.0, v.is_control))
            .collect();

        let err = h
            .engine
            .update_experiment(
                exp.id,
                ExperimentUpdate {
                    variants: Some(remaining),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Conflict(_)));
        assert_eq!(h.engine.get_experiment(exp.id).unwrap().variants.len(), 2);

        // Unassigned variants may still go.
        let mut extra = exp.variants.clone();
        extra.push(variant("blue", 0.0, false));
        h.engine
            .update_experiment(
                exp.id,
                ExperimentUpdate {
                    variants: Some(extra),
                    ..Default::default()
                },
            )
            .unwrap();
        h.engine
            .update_experiment(
                exp.id,
                ExperimentUpdate {
                    variants: Some(exp.variants.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn test_feature_flag_can_be_cleared() {
        let h = harness();
        let mut req = new_experiment("flagged-ab", h.clock.now());
        req.feature_flag = Some(FeatureFlag {
            key: "new-checkout".into(),
            default_value: json!(false),
            rules: Vec::new(),
        });
        let exp = h.engine.create_experiment(req).unwrap();
        assert!(h.engine.evaluate_flag("new-checkout", "u1").is_ok());

        let updated = h
            .engine
            .update_experiment(
                exp.id,
                ExperimentUpdate {
                    feature_flag: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.feature_flag.is_none());
        assert!(matches!(
            h.engine.evaluate_flag("new-checkout", "u1"),
            Err(ExperimentError::NotFound { .. })
        ));
    }

    #[test]
    fn test_abandoned_fence_blocks_writes() {
        let h = harness();
        let exp = running(&h, "fenced");
        h.engine.assign_variant(exp.id, "u1").unwrap();

        let fence = Arc::new(CommitFence::new());
        assert!(fence.abandon());
        let bounded = h.engine.with_fence(fence);
        assert!(matches!(
            bounded.track_event(exp.id, "u1", "purchase", json!(null)),
            Err(ExperimentError::Timeout(_))
        ));
        assert!(matches!(
            bounded.assign_variant(exp.id, "u2"),
            Err(ExperimentError::Timeout(_))
        ));
        assert!(h.store.get_participant(exp.id, "u1").unwrap().unwrap().events.is_empty());
        assert_eq!(h.store.participant_count(exp.id).unwrap(), 1);

        // Reads of recorded state never need the fence.
        assert!(bounded.assign_variant(exp.id, "u1").unwrap().is_some());
    }
}
