use std::sync::Arc;

use crate::counters;
use crate::experiment_definitions::Experiment;
use crate::redis::{Client as RedisClient, CustomRedisError};

/// Ratio-convergent variant selection.
///
/// Plain weighted-random selection only honors ratios in expectation; for
/// small N the observed split can be far off. This scheme instead compares
/// each variant's observed share against its target share and hands the
/// next assignment to the first variant that is running behind, so exact
/// splits like 50/50 or 33/33/34 hold from the first handful of
/// assignments and transient skew self-heals as counts accumulate.
///
/// Selection order over the variants in configured order:
/// - no assignments yet: the first variant (a deterministic seed point)
/// - otherwise the first variant with observed share < target share
/// - if integer rounding leaves every variant at/over target, the variant
///   with the largest deficit (target - observed), earliest wins ties
pub fn pick_variant(variants: &[(i32, i32)], counts: &[i64]) -> Option<i32> {
    debug_assert_eq!(variants.len(), counts.len());
    if variants.is_empty() {
        return None;
    }

    let total: i64 = counts.iter().sum();
    if total == 0 {
        return Some(variants[0].0);
    }

    let shares: Vec<(f64, f64)> = variants
        .iter()
        .zip(counts)
        .map(|(&(_, ratio), &count)| (count as f64 / total as f64, ratio as f64 / 100.0))
        .collect();

    for (i, &(current, target)) in shares.iter().enumerate() {
        if current < target {
            return Some(variants[i].0);
        }
    }

    let mut best = 0;
    let mut best_deficit = shares[0].1 - shares[0].0;
    for (i, &(current, target)) in shares.iter().enumerate().skip(1) {
        let deficit = target - current;
        if deficit > best_deficit {
            best = i;
            best_deficit = deficit;
        }
    }

    Some(variants[best].0)
}

/// Reads the current counters for every variant of the experiment and
/// picks the flow the next assignment should land on.
///
/// Does NOT increment: the counter is bumped only after the assignment
/// row is durably created, so a failed write can't skew convergence. A
/// counter-store failure propagates; the assignment store decides the
/// fallback.
pub async fn select_flow(
    redis_client: Arc<dyn RedisClient + Send + Sync>,
    counter_prefix: &str,
    experiment: &Experiment,
) -> Result<Option<i32>, CustomRedisError> {
    let variants: Vec<(i32, i32)> = experiment
        .variants
        .iter()
        .map(|v| (v.flow_id, v.ratio))
        .collect();

    let mut counts = Vec::with_capacity(variants.len());
    for &(flow_id, _) in &variants {
        let count = counters::get_selection_count(
            redis_client.clone(),
            counter_prefix,
            experiment.id,
            flow_id,
        )
        .await?;
        counts.push(count);
    }

    Ok(pick_variant(&variants, &counts))
}
