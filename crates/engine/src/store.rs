//! Persistence seams and the in-memory development implementations.
//!
//! Production: back `ExperimentStore` with a database that offers a
//! conditional insert for participants. The in-memory store provides the
//! same API surface for development and testing.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use experiment_core::types::{Experiment, ExperimentStatus, Participant, ParticipantEvent, UserProfile};
use experiment_core::{ExperimentError, ExperimentResult};
use tracing::info;
use uuid::Uuid;

/// Experiment definitions plus the keyed participant store they own.
pub trait ExperimentStore: Send + Sync {
    /// Insert a new experiment. Names and feature flag keys are unique.
    fn insert_experiment(&self, experiment: Experiment) -> ExperimentResult<()>;

    /// Replace an existing experiment definition.
    fn save_experiment(&self, experiment: &Experiment) -> ExperimentResult<()>;

    fn get_experiment(&self, id: Uuid) -> ExperimentResult<Option<Experiment>>;

    fn get_experiment_by_name(&self, name: &str) -> ExperimentResult<Option<Experiment>>;

    fn get_experiment_by_flag_key(&self, key: &str) -> ExperimentResult<Option<Experiment>>;

    fn list_experiments(&self) -> ExperimentResult<Vec<Experiment>>;

    /// Experiments in any of `statuses`, optionally only those whose start
    /// date is at or before `started_by`.
    fn find_by_status(
        &self,
        statuses: &[ExperimentStatus],
        started_by: Option<DateTime<Utc>>,
    ) -> ExperimentResult<Vec<Experiment>>;

    fn get_participant(&self, experiment_id: Uuid, user_id: &str) -> ExperimentResult<Option<Participant>>;

    /// Record `participant` unless the user already has a record; returns
    /// whichever record is stored afterwards. Must be atomic per key.
    fn insert_participant_if_absent(
        &self,
        experiment_id: Uuid,
        participant: Participant,
    ) -> ExperimentResult<Participant>;

    /// Append to an existing participant's event list and bump `last_seen`.
    /// Returns `false` when the user has no participant record.
    fn append_event(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        event: ParticipantEvent,
    ) -> ExperimentResult<bool>;

    fn participants(&self, experiment_id: Uuid) -> ExperimentResult<Vec<Participant>>;

    fn participant_count(&self, experiment_id: Uuid) -> ExperimentResult<usize>;
}

/// Read-only lookup of user attributes for audience evaluation.
pub trait UserDirectory: Send + Sync {
    fn get_user(&self, user_id: &str) -> ExperimentResult<Option<UserProfile>>;
}

// ─── In-memory store ────────────────────────────────────────────────────

/// Thread-safe in-memory experiment store backed by DashMap.
pub struct InMemoryExperimentStore {
    experiments: DashMap<Uuid, Experiment>,
    names: DashMap<String, Uuid>,
    flag_keys: DashMap<String, Uuid>,
    participants: DashMap<(Uuid, String), Participant>,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        info!("Experiment store initialized (in-memory, development mode)");
        Self {
            experiments: DashMap::new(),
            names: DashMap::new(),
            flag_keys: DashMap::new(),
            participants: DashMap::new(),
        }
    }

    fn flag_key(experiment: &Experiment) -> Option<&str> {
        experiment.feature_flag.as_ref().map(|f| f.key.as_str())
    }
}

impl Default for InMemoryExperimentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentStore for InMemoryExperimentStore {
    fn insert_experiment(&self, experiment: Experiment) -> ExperimentResult<()> {
        let id = experiment.id;
        let name_slot = match self.names.entry(experiment.name.clone()) {
            Entry::Occupied(_) => {
                return Err(ExperimentError::Conflict(format!(
                    "experiment '{}' already exists",
                    experiment.name
                )))
            }
            Entry::Vacant(slot) => slot,
        };
        if let Some(key) = Self::flag_key(&experiment) {
            match self.flag_keys.entry(key.to_string()) {
                Entry::Occupied(_) => {
                    return Err(ExperimentError::Conflict(format!(
                        "feature flag '{key}' already exists"
                    )))
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }
        name_slot.insert(id);
        self.experiments.insert(id, experiment);
        Ok(())
    }

    fn save_experiment(&self, experiment: &Experiment) -> ExperimentResult<()> {
        let id = experiment.id;
        let previous_key = self
            .experiments
            .get(&id)
            .ok_or_else(|| ExperimentError::not_found("experiment", id))?
            .feature_flag
            .as_ref()
            .map(|f| f.key.clone());

        let new_key = Self::flag_key(experiment);
        if new_key != previous_key.as_deref() {
            if let Some(key) = new_key {
                match self.flag_keys.entry(key.to_string()) {
                    Entry::Occupied(owner) if *owner.get() != id => {
                        return Err(ExperimentError::Conflict(format!(
                            "feature flag '{key}' already exists"
                        )))
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(slot) => {
                        slot.insert(id);
                    }
                }
            }
            if let Some(old) = previous_key {
                self.flag_keys.remove_if(&old, |_, owner| *owner == id);
            }
        }

        self.experiments.insert(id, experiment.clone());
        Ok(())
    }

    fn get_experiment(&self, id: Uuid) -> ExperimentResult<Option<Experiment>> {
        Ok(self.experiments.get(&id).map(|r| r.value().clone()))
    }

    fn get_experiment_by_name(&self, name: &str) -> ExperimentResult<Option<Experiment>> {
        let Some(id) = self.names.get(name).map(|r| *r.value()) else {
            return Ok(None);
        };
        self.get_experiment(id)
    }

    fn get_experiment_by_flag_key(&self, key: &str) -> ExperimentResult<Option<Experiment>> {
        let Some(id) = self.flag_keys.get(key).map(|r| *r.value()) else {
            return Ok(None);
        };
        self.get_experiment(id)
    }

    fn list_experiments(&self) -> ExperimentResult<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> =
            self.experiments.iter().map(|r| r.value().clone()).collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments)
    }

    fn find_by_status(
        &self,
        statuses: &[ExperimentStatus],
        started_by: Option<DateTime<Utc>>,
    ) -> ExperimentResult<Vec<Experiment>> {
        Ok(self
            .experiments
            .iter()
            .filter(|r| statuses.contains(&r.value().status))
            .filter(|r| started_by.map_or(true, |t| r.value().schedule.start_date <= t))
            .map(|r| r.value().clone())
            .collect())
    }

    fn get_participant(&self, experiment_id: Uuid, user_id: &str) -> ExperimentResult<Option<Participant>> {
        Ok(self
            .participants
            .get(&(experiment_id, user_id.to_string()))
            .map(|r| r.value().clone()))
    }

    fn insert_participant_if_absent(
        &self,
        experiment_id: Uuid,
        participant: Participant,
    ) -> ExperimentResult<Participant> {
        // The entry guard holds the shard lock, so concurrent first
        // assignments for the same key serialize here.
        let key = (experiment_id, participant.user_id.clone());
        let stored = self
            .participants
            .entry(key)
            .or_insert(participant)
            .value()
            .clone();
        Ok(stored)
    }

    fn append_event(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        event: ParticipantEvent,
    ) -> ExperimentResult<bool> {
        match self.participants.get_mut(&(experiment_id, user_id.to_string())) {
            Some(mut entry) => {
                let participant = entry.value_mut();
                participant.last_seen = event.timestamp;
                participant.events.push(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn participants(&self, experiment_id: Uuid) -> ExperimentResult<Vec<Participant>> {
        let mut participants: Vec<Participant> = self
            .participants
            .iter()
            .filter(|r| r.key().0 == experiment_id)
            .map(|r| r.value().clone())
            .collect();
        participants.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(participants)
    }

    fn participant_count(&self, experiment_id: Uuid) -> ExperimentResult<usize> {
        Ok(self
            .participants
            .iter()
            .filter(|r| r.key().0 == experiment_id)
            .count())
    }
}

// ─── In-memory user directory ───────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<String, UserProfile>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, user: UserProfile) {
        self.users.insert(user.id.clone(), user);
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn get_user(&self, user_id: &str) -> ExperimentResult<Option<UserProfile>> {
        Ok(self.users.get(user_id).map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::experiment;
    use experiment_core::types::FeatureFlag;
    use std::sync::Arc;

    #[test]
    fn test_names_are_unique() {
        let store = InMemoryExperimentStore::new();
        let now = Utc::now();
        store.insert_experiment(experiment("dup", now)).unwrap();
        let err = store.insert_experiment(experiment("dup", now)).unwrap_err();
        assert!(matches!(err, ExperimentError::Conflict(_)));
        assert_eq!(store.list_experiments().unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_by_name_and_flag_key() {
        let store = InMemoryExperimentStore::new();
        let mut exp = experiment("flagged", Utc::now());
        exp.feature_flag = Some(FeatureFlag {
            key: "bulk-editor".into(),
            default_value: serde_json::json!(false),
            rules: vec![],
        });
        let id = exp.id;
        store.insert_experiment(exp).unwrap();

        assert_eq!(store.get_experiment_by_name("flagged").unwrap().unwrap().id, id);
        assert_eq!(store.get_experiment_by_flag_key("bulk-editor").unwrap().unwrap().id, id);
        assert!(store.get_experiment_by_flag_key("other").unwrap().is_none());
    }

    #[test]
    fn test_flag_key_rename_on_save() {
        let store = InMemoryExperimentStore::new();
        let mut exp = experiment("flagged", Utc::now());
        exp.feature_flag = Some(FeatureFlag {
            key: "old-key".into(),
            default_value: serde_json::Value::Null,
            rules: vec![],
        });
        store.insert_experiment(exp.clone()).unwrap();

        exp.feature_flag.as_mut().unwrap().key = "new-key".into();
        store.save_experiment(&exp).unwrap();
        assert!(store.get_experiment_by_flag_key("old-key").unwrap().is_none());
        assert!(store.get_experiment_by_flag_key("new-key").unwrap().is_some());
    }

    #[test]
    fn test_save_unknown_experiment_is_not_found() {
        let store = InMemoryExperimentStore::new();
        let err = store.save_experiment(&experiment("ghost", Utc::now())).unwrap_err();
        assert!(matches!(err, ExperimentError::NotFound { .. }));
    }

    #[test]
    fn test_insert_participant_if_absent_keeps_first() {
        let store = InMemoryExperimentStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let first = store
            .insert_participant_if_absent(id, Participant::new("u1", "control", now))
            .unwrap();
        let second = store
            .insert_participant_if_absent(id, Participant::new("u1", "red", now))
            .unwrap();
        assert_eq!(first.assigned_variant, "control");
        assert_eq!(second.assigned_variant, "control");
        assert_eq!(store.participant_count(id).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_first_insert_converges() {
        let store = Arc::new(InMemoryExperimentStore::new());
        let id = Uuid::new_v4();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let variant = if i % 2 == 0 { "control" } else { "red" };
                    store
                        .insert_participant_if_absent(id, Participant::new("u1", variant, Utc::now()))
                        .unwrap()
                        .assigned_variant
                })
            })
            .collect();
        let results: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.participant_count(id).unwrap(), 1);
    }

    #[test]
    fn test_append_event_requires_participant() {
        let store = InMemoryExperimentStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let event = ParticipantEvent {
            event_type: "purchase".into(),
            timestamp: now,
            data: serde_json::json!({"value": 12.5}),
        };
        assert!(!store.append_event(id, "u1", event.clone()).unwrap());
        assert_eq!(store.participant_count(id).unwrap(), 0);

        store
            .insert_participant_if_absent(id, Participant::new("u1", "control", now - chrono::Duration::minutes(5)))
            .unwrap();
        assert!(store.append_event(id, "u1", event).unwrap());
        let p = store.get_participant(id, "u1").unwrap().unwrap();
        assert_eq!(p.events.len(), 1);
        assert_eq!(p.last_seen, now);
    }

    #[test]
    fn test_participants_scoped_to_experiment() {
        let store = InMemoryExperimentStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        store.insert_participant_if_absent(a, Participant::new("u1", "x", now)).unwrap();
        store.insert_participant_if_absent(a, Participant::new("u2", "x", now)).unwrap();
        store.insert_participant_if_absent(b, Participant::new("u1", "y", now)).unwrap();
        assert_eq!(store.participants(a).unwrap().len(), 2);
        assert_eq!(store.participants(b).unwrap().len(), 1);
    }

    #[test]
    fn test_user_directory() {
        let users = InMemoryUserDirectory::new();
        assert!(users.get_user("u1").unwrap().is_none());
        users.upsert(UserProfile::new("u1"));
        assert_eq!(users.get_user("u1").unwrap().unwrap().role, "user");
        let mut admin = UserProfile::new("u1");
        admin.role = "admin".into();
        users.upsert(admin);
        assert_eq!(users.get_user("u1").unwrap().unwrap().role, "admin");
    }
}
