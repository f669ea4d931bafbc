use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::api::ConfigError;
use crate::config::Config;
use crate::counters;
use crate::experiment_matching::find_matching_experiment;
use crate::redis::Client as RedisClient;
use crate::storage::{Storage, StorageError};
use crate::v0_request::{Principal, TargetingAttributes};
use crate::variant_selection::select_flow;

/// The immutable record of which flow a principal received for an
/// experiment. At most one row ever exists per (principal_type,
/// principal_id, experiment_id), enforced by a storage-level unique
/// constraint rather than an application lock.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, sqlx::FromRow)]
pub struct Assignment {
    pub id: i32,
    pub principal_type: String,
    pub principal_id: String,
    pub experiment_id: i32,
    pub flow_id: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewAssignment {
    pub principal_type: String,
    pub principal_id: String,
    pub experiment_id: i32,
    pub flow_id: i32,
}

#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct Confirmation {
    pub id: i32,
    pub principal_type: String,
    pub principal_id: String,
    pub experiment_id: i32,
    pub flow_id: i32,
    pub status: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewConfirmation {
    pub principal_type: String,
    pub principal_id: String,
    pub experiment_id: i32,
    pub flow_id: i32,
    pub metadata: Value,
}

/// Get-or-create bucketing over the assignment rows plus the matcher and
/// selector underneath.
pub struct AssignmentService {
    storage: Arc<dyn Storage + Send + Sync>,
    redis_client: Arc<dyn RedisClient + Send + Sync>,
    config: Config,
}

impl AssignmentService {
    pub fn new(
        storage: Arc<dyn Storage + Send + Sync>,
        redis_client: Arc<dyn RedisClient + Send + Sync>,
        config: Config,
    ) -> Self {
        Self {
            storage,
            redis_client,
            config,
        }
    }

    /// Returns the principal's assignment for the given configuration
    /// type, creating one on first encounter.
    ///
    /// Soft ineligibility is `None`, never an error: a principal missing
    /// any targeting attribute, or created before the eligibility floor,
    /// simply falls through to the base configuration. An existing
    /// assignment is returned as-is regardless of attributes, so a
    /// principal is never re-bucketed; the lookup joins on currently
    /// active experiments, so retiring an experiment hides its old
    /// assignments without deleting the rows.
    #[instrument(skip_all, fields(principal_id = %principal.principal_id, config_type))]
    pub async fn get_or_create(
        &self,
        principal: &Principal,
        config_type: &str,
        attributes: &TargetingAttributes,
    ) -> Result<Option<Assignment>, ConfigError> {
        if let Some(existing) = self
            .storage
            .find_active_assignment(&principal.principal_type, &principal.principal_id, config_type)
            .await?
        {
            return Ok(Some(existing));
        }

        let (Some(platform), Some(country), Some(language)) = (
            attributes.platform.as_deref(),
            attributes.country.as_deref(),
            attributes.language.as_deref(),
        ) else {
            return Ok(None);
        };

        // the floor only blocks principals known to predate it; an
        // unknown creation date is admitted
        if let Some(floor) = self.config.user_created_after_date() {
            if let Some(created_at) = principal.created_at {
                if created_at.date_naive() < floor {
                    return Ok(None);
                }
            }
        }

        let experiments = self.storage.active_experiments(config_type).await?;
        let Some(experiment) = find_matching_experiment(
            &experiments,
            config_type,
            Some(platform),
            Some(country),
            Some(language),
        ) else {
            return Ok(None);
        };

        if let Some(experiment_floor) = experiment.user_created_after {
            if let Some(created_at) = principal.created_at {
                if created_at.date_naive() < experiment_floor {
                    return Ok(None);
                }
            }
        }

        let Some(flow_id) = select_flow(
            self.redis_client.clone(),
            &self.config.counter_key_prefix,
            experiment,
        )
        .await?
        else {
            return Ok(None);
        };

        let assignment = match self
            .storage
            .insert_assignment(NewAssignment {
                principal_type: principal.principal_type.clone(),
                principal_id: principal.principal_id.clone(),
                experiment_id: experiment.id,
                flow_id,
            })
            .await
        {
            Ok(assignment) => assignment,
            // someone else assigned concurrently: the constraint won,
            // re-read and return their row
            Err(StorageError::UniqueViolation) => {
                return Ok(self
                    .storage
                    .find_assignment(
                        &principal.principal_type,
                        &principal.principal_id,
                        experiment.id,
                    )
                    .await?);
            }
            Err(e) => return Err(e.into()),
        };

        // counter bump comes after the row is durable; a failure here is
        // transient ratio skew, not a lost assignment
        if let Err(e) = counters::increment_selection_count(
            self.redis_client.clone(),
            &self.config.counter_key_prefix,
            experiment.id,
            assignment.flow_id,
        )
        .await
        {
            tracing::error!(
                experiment_id = experiment.id,
                flow_id = assignment.flow_id,
                "failed to increment selection counter: {}",
                e
            );
        }

        Ok(Some(assignment))
    }

    /// Records that a principal actually saw the assigned flow. Succeeds
    /// only when an assignment row matches (principal, experiment, flow)
    /// exactly; idempotent when already confirmed.
    pub async fn confirm(
        &self,
        principal: &Principal,
        experiment_id: i32,
        flow_id: i32,
        metadata: Value,
    ) -> Result<Confirmation, ConfigError> {
        let assignment = self
            .storage
            .find_assignment(
                &principal.principal_type,
                &principal.principal_id,
                experiment_id,
            )
            .await?;

        match assignment {
            Some(a) if a.flow_id == flow_id => {}
            _ => return Err(ConfigError::ConfirmationMismatch),
        }

        if let Some(existing) = self
            .storage
            .find_confirmation(
                &principal.principal_type,
                &principal.principal_id,
                experiment_id,
            )
            .await?
        {
            return Ok(existing);
        }

        let confirmation = self
            .storage
            .insert_confirmation(NewConfirmation {
                principal_type: principal.principal_type.clone(),
                principal_id: principal.principal_id.clone(),
                experiment_id,
                flow_id,
                metadata,
            })
            .await?;

        Ok(confirmation)
    }
}
