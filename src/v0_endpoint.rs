use axum::extract::{MatchedPath, Path, Query, State};
use axum::http::{HeaderMap, Method};
use axum::{debug_handler, Json};
use axum_client_ip::InsecureClientIp;
use bytes::Bytes;
use serde_json::json;
use tracing::instrument;

use crate::api::{
    ConfigError, ConfigResponse, ConfigResponseMeta, ConfirmResponse, ExperimentStatsResponse,
    FlowStats,
};
use crate::counters;
use crate::experiment_definitions::{
    validate_no_overlap, validate_variants, Experiment, NewExperiment,
};
use crate::flow_definitions::{Flow, NewFlow};
use crate::router;
use crate::storage::StorageError;
use crate::test_overrides::TestOverride;
use crate::winner_definitions::{NewWinner, Winner};
use crate::v0_request::{ClearOverridesParams, ConfigQueryParams, ConfigRequest, ConfirmRequest};

/// Configuration resolution endpoint.
/// Only supports a specific shape of data, and rejects any malformed data.

#[instrument(
    skip_all,
    fields(
        path,
        principal_id,
        config_type,
        user_agent,
        content_type,
        version
    )
)]
#[debug_handler]
pub async fn config(
    state: State<router::State>,
    InsecureClientIp(ip): InsecureClientIp,
    meta: Query<ConfigQueryParams>,
    headers: HeaderMap,
    method: Method,
    path: MatchedPath,
    body: Bytes,
) -> Result<Json<ConfigResponse>, ConfigError> {
    let user_agent = headers
        .get("user-agent")
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));

    tracing::Span::current().record("user_agent", user_agent);
    tracing::Span::current().record("version", meta.version.clone());
    tracing::Span::current().record("method", method.as_str());
    tracing::Span::current().record("path", path.as_str().trim_end_matches('/'));

    let request = match headers
        .get("content-type")
        .map_or("", |v| v.to_str().unwrap_or(""))
    {
        "application/json" => {
            tracing::Span::current().record("content_type", "application/json");
            ConfigRequest::from_bytes(body)
        }
        ct => {
            return Err(ConfigError::RequestDecodingError(format!(
                "unsupported content type: {}",
                ct
            )));
        }
    }?;

    let config_type = request.extract_config_type()?;
    let principal = request.extract_principal()?;
    let attributes = request.extract_targeting_attributes();

    tracing::Span::current().record("principal_id", &principal.principal_id);
    tracing::Span::current().record("config_type", &config_type);

    let resolved = state
        .resolver
        .resolve(&principal, &config_type, &attributes, Some(&ip.to_string()))
        .await?;

    Ok(Json(ConfigResponse {
        success: true,
        data: resolved.config,
        meta: ConfigResponseMeta {
            config_type,
            has_experiment: resolved.experiment_id.is_some(),
            experiment_id: resolved.experiment_id,
            flow_id: resolved.flow_id,
        },
    }))
}

/// Records that a principal reached the end of its assigned flow. The
/// claimed (experiment, flow) pair must match the stored assignment.
#[instrument(skip_all, fields(principal_id, experiment_id, flow_id))]
#[debug_handler]
pub async fn confirm(
    state: State<router::State>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ConfirmResponse>, ConfigError> {
    match headers
        .get("content-type")
        .map_or("", |v| v.to_str().unwrap_or(""))
    {
        "application/json" => {}
        ct => {
            return Err(ConfigError::RequestDecodingError(format!(
                "unsupported content type: {}",
                ct
            )));
        }
    }

    let request = ConfirmRequest::from_bytes(body)?;
    let principal = request.extract_principal()?;
    let experiment_id = request.experiment_id.ok_or_else(|| {
        ConfigError::RequestDecodingError(String::from("missing experiment_id"))
    })?;
    let flow_id = request
        .flow_id
        .ok_or_else(|| ConfigError::RequestDecodingError(String::from("missing flow_id")))?;

    tracing::Span::current().record("principal_id", &principal.principal_id);
    tracing::Span::current().record("experiment_id", experiment_id);
    tracing::Span::current().record("flow_id", flow_id);

    let confirmation = state
        .resolver
        .assignment_service()
        .confirm(
            &principal,
            experiment_id,
            flow_id,
            request.metadata.unwrap_or_else(|| json!({})),
        )
        .await?;

    Ok(Json(ConfirmResponse {
        success: true,
        confirmation_id: confirmation.id,
        status: confirmation.status,
    }))
}

/// Observed vs configured distribution for one experiment. Admin-only.
#[instrument(skip_all, fields(experiment_id = id))]
#[debug_handler]
pub async fn experiment_stats(
    state: State<router::State>,
    Path(id): Path<i32>,
) -> Result<Json<ExperimentStatsResponse>, ConfigError> {
    let experiment = state
        .storage
        .experiment(id)
        .await?
        .ok_or(ConfigError::ExperimentNotFound)?;

    let assigned = state.storage.assignment_counts(id).await?;
    let selections = counters::get_experiment_counters(
        state.redis_client.clone(),
        &state.config.counter_key_prefix,
        id,
    )
    .await?;

    let total: i64 = assigned.iter().map(|&(_, count)| count).sum();

    let flows = experiment
        .variants
        .iter()
        .map(|variant| {
            let assigned_count = assigned
                .iter()
                .find(|&&(flow_id, _)| flow_id == variant.flow_id)
                .map_or(0, |&(_, count)| count);
            let selection_count = selections
                .iter()
                .find(|&&(flow_id, _)| flow_id == variant.flow_id)
                .map_or(0, |&(_, count)| count);
            FlowStats {
                flow_id: variant.flow_id,
                ratio: Some(variant.ratio),
                assigned_count,
                selection_count,
                percentage: if total > 0 {
                    assigned_count as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
            }
        })
        .collect();

    Ok(Json(ExperimentStatsResponse {
        experiment_id: id,
        total_assignments: total,
        flows,
    }))
}

/// Zeroes the selection counters of one experiment. Admin-only; stored
/// assignment rows are untouched.
#[instrument(skip_all, fields(experiment_id = id))]
#[debug_handler]
pub async fn reset_counters(
    state: State<router::State>,
    Path(id): Path<i32>,
) -> Result<Json<serde_json::Value>, ConfigError> {
    if state.storage.experiment(id).await?.is_none() {
        return Err(ConfigError::ExperimentNotFound);
    }

    counters::reset_experiment_counters(
        state.redis_client.clone(),
        &state.config.counter_key_prefix,
        id,
    )
    .await?;

    Ok(Json(json!({"success": true})))
}

/// Creates a flow. Admin-only; a second default for a type is refused.
#[instrument(skip_all, fields(flow_type = %flow.flow_type, name = %flow.name))]
#[debug_handler]
pub async fn create_flow(
    state: State<router::State>,
    Json(flow): Json<NewFlow>,
) -> Result<Json<Flow>, ConfigError> {
    let row = match state.storage.insert_flow(flow).await {
        Ok(row) => row,
        Err(StorageError::UniqueViolation) => return Err(ConfigError::DuplicateEntity),
        Err(e) => return Err(e.into()),
    };

    // the base a resolution starts from may just have changed
    state.resolver.default_flow_cache().invalidate().await;

    Ok(Json(row))
}

/// Creates an experiment. Admin-only. The variant set is validated here,
/// and when the overlap guard is on the targeting must not intersect any
/// active experiment of the same type.
#[instrument(skip_all, fields(experiment_type = %experiment.experiment_type, name = %experiment.name))]
#[debug_handler]
pub async fn create_experiment(
    state: State<router::State>,
    Json(experiment): Json<NewExperiment>,
) -> Result<Json<Experiment>, ConfigError> {
    validate_variants(&experiment.variants)
        .map_err(|e| ConfigError::InvalidDefinition(e.to_string()))?;

    if *state.config.prevent_overlapping_experiments {
        let active = state
            .storage
            .active_experiments(&experiment.experiment_type)
            .await?;
        validate_no_overlap(&experiment, &active)
            .map_err(|e| ConfigError::InvalidDefinition(e.to_string()))?;
    }

    let row = state.storage.insert_experiment(experiment).await?;
    Ok(Json(row))
}

/// Locks a winner for an exact targeting tuple. Admin-only; one winner
/// per tuple.
#[instrument(skip_all, fields(winner_type = %winner.winner_type))]
#[debug_handler]
pub async fn create_winner(
    state: State<router::State>,
    Json(winner): Json<NewWinner>,
) -> Result<Json<Winner>, ConfigError> {
    match state.storage.insert_winner(winner).await {
        Ok(row) => Ok(Json(row)),
        Err(StorageError::UniqueViolation) => Err(ConfigError::DuplicateEntity),
        Err(e) => Err(e.into()),
    }
}

/// Pins a (ip, type) pair to a flow for QA preview. Admin-only.
#[instrument(skip_all, fields(ip = %override_.ip, config_type = %override_.config_type))]
#[debug_handler]
pub async fn set_test_override(
    state: State<router::State>,
    Json(override_): Json<TestOverride>,
) -> Result<Json<serde_json::Value>, ConfigError> {
    if state.storage.flow(override_.flow_id).await?.is_none() {
        return Err(ConfigError::RequestDecodingError(String::from(
            "unknown flow_id",
        )));
    }

    state.resolver.test_override_store().set(override_).await?;
    Ok(Json(json!({"success": true})))
}

/// Removes test overrides, all of them or only those for one config
/// type when `?type=` is given. Admin-only.
#[debug_handler]
pub async fn clear_test_overrides(
    state: State<router::State>,
    Query(params): Query<ClearOverridesParams>,
) -> Result<Json<serde_json::Value>, ConfigError> {
    let store = state.resolver.test_override_store();
    match params.config_type {
        Some(config_type) => store.clear_type(&config_type).await?,
        None => store.clear().await?,
    }
    Ok(Json(json!({"success": true})))
}
