use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::assignment::{Assignment, Confirmation, NewAssignment, NewConfirmation};
use crate::database::Client as DatabaseClient;
use crate::experiment_definitions::{
    validate_variants, Experiment, ExperimentVariant, NewExperiment,
};
use crate::flow_definitions::{Flow, NewFlow};
use crate::winner_definitions::{NewWinner, Winner};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("row not found")]
    NotFound,

    /// A storage-level uniqueness constraint fired. For assignment
    /// inserts this means a concurrent caller won the race; callers
    /// recover by re-reading, never by failing the request.
    #[error("unique constraint violation")]
    UniqueViolation,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("pg error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The persisted state the core depends on: flow rows, experiment rows
/// with their variant/ratio pairs, winner rows keyed by targeting tuple,
/// assignment rows under a (principal_type, principal_id, experiment_id)
/// unique constraint, and confirmation rows. `PgStorage` is the real
/// implementation; tests run against the in-memory one in `test_utils`.
#[async_trait]
pub trait Storage {
    async fn default_flow(&self, flow_type: &str) -> Result<Option<Flow>, StorageError>;
    async fn flow(&self, id: i32) -> Result<Option<Flow>, StorageError>;
    /// Rejects a second default flow for a type with `UniqueViolation`.
    async fn insert_flow(&self, flow: NewFlow) -> Result<Flow, StorageError>;

    /// Active experiments of a type, variants attached, in creation order.
    async fn active_experiments(&self, experiment_type: &str)
        -> Result<Vec<Experiment>, StorageError>;
    async fn experiment(&self, id: i32) -> Result<Option<Experiment>, StorageError>;
    /// Validates the variant set (>=2 variants, ratios 1-100 summing to
    /// 100) before writing.
    async fn insert_experiment(&self, experiment: NewExperiment)
        -> Result<Experiment, StorageError>;

    async fn winner(
        &self,
        winner_type: &str,
        platform: &str,
        country: &str,
        language: &str,
    ) -> Result<Option<Winner>, StorageError>;
    /// Rejects a second winner for a targeting tuple with `UniqueViolation`.
    async fn insert_winner(&self, winner: NewWinner) -> Result<Winner, StorageError>;

    /// The principal's assignment for any currently-active experiment of
    /// the type. Assignments of deactivated experiments are invisible
    /// here, though their rows remain.
    async fn find_active_assignment(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_type: &str,
    ) -> Result<Option<Assignment>, StorageError>;
    async fn find_assignment(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_id: i32,
    ) -> Result<Option<Assignment>, StorageError>;
    async fn insert_assignment(
        &self,
        assignment: NewAssignment,
    ) -> Result<Assignment, StorageError>;
    /// Observed distribution: assignment rows grouped by flow, sorted by
    /// flow id.
    async fn assignment_counts(&self, experiment_id: i32)
        -> Result<Vec<(i32, i64)>, StorageError>;

    async fn find_confirmation(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_id: i32,
    ) -> Result<Option<Confirmation>, StorageError>;
    async fn insert_confirmation(
        &self,
        confirmation: NewConfirmation,
    ) -> Result<Confirmation, StorageError>;
}

fn map_insert_error(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            return StorageError::UniqueViolation;
        }
    }
    StorageError::Database(e)
}

pub struct PgStorage {
    reader: Arc<dyn DatabaseClient + Send + Sync>,
    writer: Arc<dyn DatabaseClient + Send + Sync>,
}

impl PgStorage {
    pub fn new(
        reader: Arc<dyn DatabaseClient + Send + Sync>,
        writer: Arc<dyn DatabaseClient + Send + Sync>,
    ) -> Self {
        Self { reader, writer }
    }

    async fn attach_variants(&self, experiment: &mut Experiment) -> Result<(), StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT flow_id, ratio FROM experiment_flows
             WHERE experiment_id = $1 ORDER BY id";
        experiment.variants = sqlx::query_as::<_, ExperimentVariant>(query)
            .bind(experiment.id)
            .fetch_all(&mut *conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn default_flow(&self, flow_type: &str) -> Result<Option<Flow>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT id, type, name, content, is_default, is_active
             FROM flows WHERE type = $1 AND is_default = true AND is_active = true";
        let row = sqlx::query_as::<_, Flow>(query)
            .bind(flow_type)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    async fn flow(&self, id: i32) -> Result<Option<Flow>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT id, type, name, content, is_default, is_active
             FROM flows WHERE id = $1 AND is_active = true";
        let row = sqlx::query_as::<_, Flow>(query)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    async fn insert_flow(&self, flow: NewFlow) -> Result<Flow, StorageError> {
        let mut conn = self
            .writer
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        // a unique index on (type, name) plus a partial unique index
        // on (type) WHERE is_default back this up
        let query = "INSERT INTO flows (type, name, content, is_default, is_active)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, type, name, content, is_default, is_active";
        let row = sqlx::query_as::<_, Flow>(query)
            .bind(&flow.flow_type)
            .bind(&flow.name)
            .bind(&flow.content)
            .bind(flow.is_default)
            .bind(flow.is_active)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_insert_error)?;

        Ok(row)
    }

    async fn active_experiments(
        &self,
        experiment_type: &str,
    ) -> Result<Vec<Experiment>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT id, name, type, platforms, countries, languages,
                    user_created_after, is_active, created_at
             FROM experiments
             WHERE type = $1 AND is_active = true
             ORDER BY created_at, id";
        let mut experiments = sqlx::query_as::<_, Experiment>(query)
            .bind(experiment_type)
            .fetch_all(&mut *conn)
            .await?;
        drop(conn);

        for experiment in &mut experiments {
            self.attach_variants(experiment).await?;
        }

        Ok(experiments)
    }

    async fn experiment(&self, id: i32) -> Result<Option<Experiment>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT id, name, type, platforms, countries, languages,
                    user_created_after, is_active, created_at
             FROM experiments WHERE id = $1";
        let row = sqlx::query_as::<_, Experiment>(query)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        drop(conn);

        match row {
            Some(mut experiment) => {
                self.attach_variants(&mut experiment).await?;
                Ok(Some(experiment))
            }
            None => Ok(None),
        }
    }

    async fn insert_experiment(
        &self,
        experiment: NewExperiment,
    ) -> Result<Experiment, StorageError> {
        validate_variants(&experiment.variants)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        let mut conn = self
            .writer
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "INSERT INTO experiments
                 (name, type, platforms, countries, languages, user_created_after, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id, name, type, platforms, countries, languages,
                       user_created_after, is_active, created_at";
        let mut row = sqlx::query_as::<_, Experiment>(query)
            .bind(&experiment.name)
            .bind(&experiment.experiment_type)
            .bind(&experiment.platforms)
            .bind(&experiment.countries)
            .bind(&experiment.languages)
            .bind(experiment.user_created_after)
            .bind(experiment.is_active)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_insert_error)?;

        for variant in &experiment.variants {
            sqlx::query(
                "INSERT INTO experiment_flows (experiment_id, flow_id, ratio)
                 VALUES ($1, $2, $3)",
            )
            .bind(row.id)
            .bind(variant.flow_id)
            .bind(variant.ratio)
            .execute(&mut *conn)
            .await
            .map_err(map_insert_error)?;
        }
        row.variants = experiment.variants;

        Ok(row)
    }

    async fn winner(
        &self,
        winner_type: &str,
        platform: &str,
        country: &str,
        language: &str,
    ) -> Result<Option<Winner>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT id, type, platform, country_code, language, content, is_active
             FROM winners
             WHERE type = $1 AND platform = $2 AND country_code = $3 AND language = $4
               AND is_active = true";
        let row = sqlx::query_as::<_, Winner>(query)
            .bind(winner_type)
            .bind(platform)
            .bind(country)
            .bind(language)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    async fn insert_winner(&self, winner: NewWinner) -> Result<Winner, StorageError> {
        let mut conn = self
            .writer
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "INSERT INTO winners (type, platform, country_code, language, content, is_active)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, type, platform, country_code, language, content, is_active";
        let row = sqlx::query_as::<_, Winner>(query)
            .bind(&winner.winner_type)
            .bind(&winner.platform)
            .bind(&winner.country_code)
            .bind(&winner.language)
            .bind(&winner.content)
            .bind(winner.is_active)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_insert_error)?;

        Ok(row)
    }

    async fn find_active_assignment(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_type: &str,
    ) -> Result<Option<Assignment>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        // the join always filters on current activity: assignments of
        // retired experiments stay in the table but resolve to nothing
        let query = "SELECT a.id, a.principal_type, a.principal_id, a.experiment_id,
                    a.flow_id, a.created_at
             FROM assignments a
             JOIN experiments e ON e.id = a.experiment_id
             WHERE a.principal_type = $1 AND a.principal_id = $2
               AND e.type = $3 AND e.is_active = true";
        let row = sqlx::query_as::<_, Assignment>(query)
            .bind(principal_type)
            .bind(principal_id)
            .bind(experiment_type)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    async fn find_assignment(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_id: i32,
    ) -> Result<Option<Assignment>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT id, principal_type, principal_id, experiment_id, flow_id, created_at
             FROM assignments
             WHERE principal_type = $1 AND principal_id = $2 AND experiment_id = $3";
        let row = sqlx::query_as::<_, Assignment>(query)
            .bind(principal_type)
            .bind(principal_id)
            .bind(experiment_id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    async fn insert_assignment(
        &self,
        assignment: NewAssignment,
    ) -> Result<Assignment, StorageError> {
        let mut conn = self
            .writer
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        // unique index on (principal_type, principal_id, experiment_id)
        // is the at-most-one-assignment invariant; a violation here means
        // a concurrent caller won
        let query = "INSERT INTO assignments (principal_type, principal_id, experiment_id, flow_id)
             VALUES ($1, $2, $3, $4)
             RETURNING id, principal_type, principal_id, experiment_id, flow_id, created_at";
        let row = sqlx::query_as::<_, Assignment>(query)
            .bind(&assignment.principal_type)
            .bind(&assignment.principal_id)
            .bind(assignment.experiment_id)
            .bind(assignment.flow_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_insert_error)?;

        Ok(row)
    }

    async fn assignment_counts(
        &self,
        experiment_id: i32,
    ) -> Result<Vec<(i32, i64)>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT flow_id, COUNT(*) as count FROM assignments
             WHERE experiment_id = $1 GROUP BY flow_id ORDER BY flow_id";
        let rows = sqlx::query_as::<_, (i32, i64)>(query)
            .bind(experiment_id)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows)
    }

    async fn find_confirmation(
        &self,
        principal_type: &str,
        principal_id: &str,
        experiment_id: i32,
    ) -> Result<Option<Confirmation>, StorageError> {
        let mut conn = self
            .reader
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "SELECT id, principal_type, principal_id, experiment_id, flow_id,
                    status, metadata, created_at
             FROM confirmations
             WHERE principal_type = $1 AND principal_id = $2 AND experiment_id = $3";
        let row = sqlx::query_as::<_, Confirmation>(query)
            .bind(principal_type)
            .bind(principal_id)
            .bind(experiment_id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    async fn insert_confirmation(
        &self,
        confirmation: NewConfirmation,
    ) -> Result<Confirmation, StorageError> {
        let mut conn = self
            .writer
            .get_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let query = "INSERT INTO confirmations
                 (principal_type, principal_id, experiment_id, flow_id, status, metadata)
             VALUES ($1, $2, $3, $4, 'confirmed', $5)
             RETURNING id, principal_type, principal_id, experiment_id, flow_id,
                       status, metadata, created_at";
        let row = sqlx::query_as::<_, Confirmation>(query)
            .bind(&confirmation.principal_type)
            .bind(&confirmation.principal_id)
            .bind(confirmation.experiment_id)
            .bind(confirmation.flow_id)
            .bind(&confirmation.metadata)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_insert_error)?;

        Ok(row)
    }
}
