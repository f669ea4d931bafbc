use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};

use crate::assignment::{Assignment, Confirmation, NewAssignment, NewConfirmation};
use crate::experiment_definitions::{
    validate_variants, Experiment, ExperimentVariant, NewExperiment,
};
use crate::flow_definitions::{Flow, NewFlow};
use crate::storage::{Storage, StorageError};
use crate::v0_request::{Principal, TargetingAttributes};
use crate::winner_definitions::{NewWinner, Winner};

pub const PREFIX: &str = "remote_config:counter:";

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

pub fn flow(flow_type: &str, name: &str, is_default: bool) -> NewFlow {
    NewFlow {
        flow_type: flow_type.to_string(),
        name: name.to_string(),
        content: json!({"name": name}),
        is_default,
        is_active: true,
    }
}

/// An active experiment with explicit targeting sets and no variants.
pub fn experiment(
    id: i32,
    experiment_type: &str,
    platforms: &[&str],
    countries: &[&str],
    languages: &[&str],
) -> Experiment {
    Experiment {
        id,
        name: format!("experiment-{}", id),
        experiment_type: experiment_type.to_string(),
        platforms: platforms.iter().map(|s| s.to_string()).collect(),
        countries: countries.iter().map(|s| s.to_string()).collect(),
        languages: languages.iter().map(|s| s.to_string()).collect(),
        user_created_after: None,
        is_active: true,
        created_at: fixed_timestamp(),
        variants: vec![],
    }
}

/// An experiment targeting ios/US/en with the given (flow_id, ratio)
/// variants attached.
pub fn experiment_with_variants(
    id: i32,
    experiment_type: &str,
    variants: &[(i32, i32)],
) -> Experiment {
    let mut exp = experiment(id, experiment_type, &["ios"], &["US"], &["en"]);
    exp.variants = variants
        .iter()
        .map(|&(flow_id, ratio)| ExperimentVariant { flow_id, ratio })
        .collect();
    exp
}

pub fn principal(id: &str) -> Principal {
    Principal {
        principal_id: id.to_string(),
        principal_type: "user".to_string(),
        created_at: Some(
            DateTime::parse_from_rfc3339("2024-03-15T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ),
    }
}

pub fn targeting(platform: &str, country: &str, language: &str) -> TargetingAttributes {
    TargetingAttributes {
        platform: Some(platform.to_string()),
        country: Some(country.to_string()),
        language: Some(language.to_string()),
    }
}

pub fn winner_for(
    winner_type: &str,
    platform: &str,
    country: &str,
    language: &str,
    content: Value,
) -> Winner {
    Winner {
        id: 1,
        winner_type: winner_type.to_string(),
        platform: platform.to_string(),
        country_code: country.to_string(),
        language: language.to_string(),
        content,
        is_active: true,
    }
}

fn fixed_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

#[derive(Default)]
struct MemoryState {
    flows: Vec<Flow>,
    experiments: Vec<Experiment>,
    winners: Vec<Winner>,
    assignments: Vec<Assignment>,
    confirmations: Vec<Confirmation>,
    next_flow_id: i32,
    next_experiment_id: i32,
    next_winner_id: i32,
    next_assignment_id: i32,
    next_confirmation_id: i32,
    suppress_active_lookup_once: bool,
    fail_next_insert_with_conflict: bool,
}

/// In-memory `Storage` with the same constraint behavior as the Postgres
/// schema: one default flow per type, one winner per targeting tuple, one
/// assignment per (principal, experiment). Extra hooks let tests stage
/// races and retire experiments mid-run.
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts a pre-built experiment, keeping its id as given.
    pub async fn push_experiment(&self, experiment: Experiment) {
        let mut state = self.locked();
        state.next_experiment_id = state.next_experiment_id.max(experiment.id);
        state.experiments.push(experiment);
    }

    /// Inserts a non-default flow under a caller-chosen id, so tests can
    /// line flow ids up with experiment variants.
    pub async fn push_flow_with_id(&self, id: i32, flow_type: &str, name: &str, content: Value) {
        let mut state = self.locked();
        state.next_flow_id = state.next_flow_id.max(id);
        state.flows.push(Flow {
            id,
            flow_type: flow_type.to_string(),
            name: name.to_string(),
            content,
            is_default: false,
            is_active: true,
        });
    }

    pub async fn push_winner(&self, winner: Winner) {
        let mut state = self.locked();
        state.next_winner_id = state.next_winner_id.max(winner.id);
        state.winners.push(winner);
    }

    pub async fn clear_flows(&self) {
        self.locked().flows.clear();
    }

    pub async fn deactivate_experiment(&self, id: i32) {
        let mut state = self.locked();
        if let Some(exp) = state.experiments.iter_mut().find(|e| e.id == id) {
            exp.is_active = false;
        }
    }

    /// Makes the next `find_active_assignment` miss, as if a concurrent
    /// caller had not committed yet.
    pub async fn suppress_active_lookup_once(&self) {
        self.locked().suppress_active_lookup_once = true;
    }

    /// Makes the next `insert_assignment` fail with `UniqueViolation`
    /// without writing, as if a concurrent insert won the race.
    pub async fn fail_next_insert_with_conflict(&self) {
        self.locked().fail_next_insert_with_conflict = true;
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn default_flow(&self, flow_type: &str) -> Result<Option<Flow>, StorageError> {
        let state = self.locked();
        Ok(state
            .flows
            .iter()
            .find(|f| f.flow_type == flow_type && f.is_default && f.is_active)
            .cloned())
    }

    async fn flow(&self, id: i32) -> Result<Option<Flow>, StorageError> {
        let state = self.locked();
        Ok(state
            .flows
            .iter()
            .find(|f| f.id == id && f.is_active)
            .cloned())
    }

    async fn insert_flow(&self, flow: NewFlow) -> Result<Flow, StorageError> {
        let mut state = self.locked();
        if state
            .flows
            .iter()
            .any(|f| f.flow_type == flow.flow_type && f.name == flow.name)
        {
            return Err(StorageError::UniqueViolation);
        }
        if flow.is_default
            && state
                .flows
                .iter()
                .any(|f| f.flow_type == flow.flow_type && f.is_default)
        {
            return Err(StorageError::UniqueViolation);
        }
        state.next_flow_id += 1;
        let row = Flow {
            id: state.next_flow_id,
            flow_type: flow.flow_type,
            name: flow.name,
            content: flow.content,
            is_default: flow.is_default,
            is_active: flow.is_active,
        };
        state.flows.push(row.clone());
        Ok(row)
    }

    async fn active_experiments(
        &self,
        experiment_type: &str,
    ) -> Result<Vec<Experiment>, StorageError> {
        let state = self.locked();
        let mut experiments: Vec<Experiment> = state
            .experiments
            .iter()
            .filter(|e| e.experiment_type == experiment_type && e.is_active)
            .cloned()
            .collect();
        experiments.sort_by_key(|e| (e.created_at, e.id));
        Ok(experiments)
    }

    async fn experiment(&self, id: i32) -> Result<Option<Experiment>, StorageError> {
        let state = self.locked();
        Ok(state.experiments.iter().find(|e| e.id == id).cloned())
    }

    async fn insert_experiment(
        &self,
        experiment: NewExperiment,
    ) -> Result<Experiment, StorageError> {
        validate_variants(&experiment.variants)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let mut state = self.locked();
        state.next_experiment_id += 1;
        let row = Experiment {
            id: state.next_experiment_id,
            name: experiment.name,
            experiment_type: experiment.experiment_type,
            platforms: experiment.platforms,
            countries: experiment.countries,
            languages: experiment.languages,
            user_created_after: experiment.user_created_after,
            is_active: experiment.is_active,
            created_at: Utc::now(),
            variants: experiment.variants,
        };
        state.experiments.push(row.clone());
        Ok(row)
    }

    async fn winner(
        &self,
        winner_type: &str,
        platform: &str,
        country: &str,
        language: &str,
    ) -> Result<Option<Winner>, StorageError> {
        let state = self.locked();
        Ok(state
            .winners
            .iter()
            .find(|w| {
                w.is_active
                    && w.winner_type == winner_type
                    && w.platform == platform
                    && w.country_code == country
                    && w.language == language
            })
            .cloned())
    }

    async fn insert_winner(&self, winner: NewWinner) -> Result<Winner, StorageError> {
        let mut state = self.locked();
        if state.winners.iter().any(|w| {
            w.winner_type == winner.winner_type
                && w.platform == winner.platform
                && w.country_code == winner.country_code
                && w.language == winner.language
        }) {
            return Err(StorageError::UniqueViolation);
        }
        state.next_winner_id += 1;
        let row = Winner {
            id: state.next_winner_id,
            winner_type: winner.winner_type,
            platform: winner.platform,
            country_code: winner.country_code,
            language: winner.language,
            content: winner.content,
            is_active: winner.is_active,
        };
        state.winners.push(row.clone());
        Ok(row)
    }

    async fn find_active_assignment(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_type: &str,
    ) -> Result<Option<Assignment>, StorageError> {
        let mut state = self.locked();
        if state.suppress_active_lookup_once {
            state.suppress_active_lookup_once = false;
            return Ok(None);
        }
        let active_ids: Vec<i32> = state
            .experiments
            .iter()
            .filter(|e| e.experiment_type == experiment_type && e.is_active)
            .map(|e| e.id)
            .collect();
        Ok(state
            .assignments
            .iter()
            .find(|a| {
                a.principal_type == principal_type
                    && a.principal_id == principal_id
                    && active_ids.contains(&a.experiment_id)
            })
            .cloned())
    }

    async fn find_assignment(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_id: i32,
    ) -> Result<Option<Assignment>, StorageError> {
        let state = self.locked();
        Ok(state
            .assignments
            .iter()
            .find(|a| {
                a.principal_type == principal_type
                    && a.principal_id == principal_id
                    && a.experiment_id == experiment_id
            })
            .cloned())
    }

    async fn insert_assignment(
        &self,
        assignment: NewAssignment,
    ) -> Result<Assignment, StorageError> {
        let mut state = self.locked();
        if state.fail_next_insert_with_conflict {
            state.fail_next_insert_with_conflict = false;
            return Err(StorageError::UniqueViolation);
        }
        if state.assignments.iter().any(|a| {
            a.principal_type == assignment.principal_type
                && a.principal_id == assignment.principal_id
                && a.experiment_id == assignment.experiment_id
        }) {
            return Err(StorageError::UniqueViolation);
        }
        state.next_assignment_id += 1;
        let row = Assignment {
            id: state.next_assignment_id,
            principal_type: assignment.principal_type,
            principal_id: assignment.principal_id,
            experiment_id: assignment.experiment_id,
            flow_id: assignment.flow_id,
            created_at: Utc::now(),
        };
        state.assignments.push(row.clone());
        Ok(row)
    }

    async fn assignment_counts(
        &self,
        experiment_id: i32,
    ) -> Result<Vec<(i32, i64)>, StorageError> {
        let state = self.locked();
        let mut counts: HashMap<i32, i64> = HashMap::new();
        for a in state
            .assignments
            .iter()
            .filter(|a| a.experiment_id == experiment_id)
        {
            *counts.entry(a.flow_id).or_insert(0) += 1;
        }
        let mut counts: Vec<(i32, i64)> = counts.into_iter().collect();
        counts.sort_by_key(|&(flow_id, _)| flow_id);
        Ok(counts)
    }

    async fn find_confirmation(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_id: i32,
    ) -> Result<Option<Confirmation>, StorageError> {
        let state = self.locked();
        Ok(state
            .confirmations
            .iter()
            .find(|c| {
                c.principal_type == principal_type
                    && c.principal_id == principal_id
                    && c.experiment_id == experiment_id
            })
            .cloned())
    }

    async fn insert_confirmation(
        &self,
        confirmation: NewConfirmation,
    ) -> Result<Confirmation, StorageError> {
        let mut state = self.locked();
        if state.confirmations.iter().any(|c| {
            c.principal_type == confirmation.principal_type
                && c.principal_id == confirmation.principal_id
                && c.experiment_id == confirmation.experiment_id
        }) {
            return Err(StorageError::UniqueViolation);
        }
        state.next_confirmation_id += 1;
        let row = Confirmation {
            id: state.next_confirmation_id,
            principal_type: confirmation.principal_type,
            principal_id: confirmation.principal_id,
            experiment_id: confirmation.experiment_id,
            flow_id: confirmation.flow_id,
            status: "confirmed".to_string(),
            metadata: confirmation.metadata,
            created_at: Utc::now(),
        };
        state.confirmations.push(row.clone());
        Ok(row)
    }
}
