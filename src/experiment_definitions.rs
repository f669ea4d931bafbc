use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One variant attached to an experiment: a flow plus the target share of
/// new assignments that should land on it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, sqlx::FromRow)]
pub struct ExperimentVariant {
    pub flow_id: i32,
    pub ratio: i32,
}

/// A targeting rule bundling flow variants with ratios. Targeting sets are
/// "any of N values": a principal matches when each provided attribute is
/// a member of the corresponding set.
#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct Experiment {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub experiment_type: String,
    pub platforms: Vec<String>,
    pub countries: Vec<String>,
    pub languages: Vec<String>,
    pub user_created_after: Option<NaiveDate>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub variants: Vec<ExperimentVariant>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewExperiment {
    pub name: String,
    #[serde(rename = "type")]
    pub experiment_type: String,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub user_created_after: Option<NaiveDate>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub variants: Vec<ExperimentVariant>,
}

fn default_active() -> bool {
    true
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExperimentValidationError {
    #[error("experiment needs at least 2 variants, got {0}")]
    TooFewVariants(usize),
    #[error("variant ratio {0} out of range 1-100")]
    RatioOutOfRange(i32),
    #[error("variant ratios sum to {0}, expected 100")]
    RatiosDontSumTo100(i32),
    #[error("targeting overlaps active experiment {0}")]
    OverlappingTargeting(i32),
}

/// Write-time invariant on the variant set: at least two variants, each
/// ratio in 1..=100, ratios summing to exactly 100.
pub fn validate_variants(variants: &[ExperimentVariant]) -> Result<(), ExperimentValidationError> {
    if variants.len() < 2 {
        return Err(ExperimentValidationError::TooFewVariants(variants.len()));
    }

    for variant in variants {
        if variant.ratio < 1 || variant.ratio > 100 {
            return Err(ExperimentValidationError::RatioOutOfRange(variant.ratio));
        }
    }

    let sum: i32 = variants.iter().map(|v| v.ratio).sum();
    if sum != 100 {
        return Err(ExperimentValidationError::RatiosDontSumTo100(sum));
    }

    Ok(())
}

impl Experiment {
    /// Set-membership test against this experiment's targeting. A provided
    /// attribute must be a member of the corresponding set; an absent
    /// attribute does not constrain the match.
    pub fn targets(
        &self,
        platform: Option<&str>,
        country: Option<&str>,
        language: Option<&str>,
    ) -> bool {
        let contains = |set: &[String], value: Option<&str>| match value {
            Some(v) => set.iter().any(|s| s == v),
            None => true,
        };

        contains(&self.platforms, platform)
            && contains(&self.countries, country)
            && contains(&self.languages, language)
    }

    /// Total number of targeted values across all dimensions. Lower means
    /// the experiment targets fewer values, i.e. is more specific.
    pub fn specificity(&self) -> usize {
        self.platforms.len() + self.countries.len() + self.languages.len()
    }
}

impl NewExperiment {
    /// Whether this experiment's targeting shares any value with another
    /// experiment's on every dimension, i.e. some principal could match
    /// both. Used by the optional write-time overlap guard.
    pub fn overlaps_with(&self, other: &Experiment) -> bool {
        if self.experiment_type != other.experiment_type {
            return false;
        }

        let intersects =
            |a: &[String], b: &[String]| a.iter().any(|v| b.iter().any(|w| w == v));

        intersects(&self.platforms, &other.platforms)
            && intersects(&self.countries, &other.countries)
            && intersects(&self.languages, &other.languages)
    }
}

/// Write-time overlap guard, configurable on/off. Orthogonal to the
/// runtime specificity tie-break, which handles overlap either way.
pub fn validate_no_overlap(
    candidate: &NewExperiment,
    active_experiments: &[Experiment],
) -> Result<(), ExperimentValidationError> {
    if !candidate.is_active {
        return Ok(());
    }

    for existing in active_experiments {
        if existing.is_active && candidate.overlaps_with(existing) {
            return Err(ExperimentValidationError::OverlappingTargeting(existing.id));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::experiment;

    fn variants(ratios: &[i32]) -> Vec<ExperimentVariant> {
        ratios
            .iter()
            .enumerate()
            .map(|(i, r)| ExperimentVariant {
                flow_id: i as i32 + 1,
                ratio: *r,
            })
            .collect()
    }

    #[test]
    fn variant_sets_must_sum_to_100() {
        assert_eq!(validate_variants(&variants(&[50, 50])), Ok(()));
        assert_eq!(validate_variants(&variants(&[33, 33, 34])), Ok(()));
        assert_eq!(
            validate_variants(&variants(&[60, 50])),
            Err(ExperimentValidationError::RatiosDontSumTo100(110))
        );
        assert_eq!(
            validate_variants(&variants(&[100])),
            Err(ExperimentValidationError::TooFewVariants(1))
        );
        assert_eq!(
            validate_variants(&variants(&[0, 100])),
            Err(ExperimentValidationError::RatioOutOfRange(0))
        );
    }

    #[test]
    fn targeting_is_set_membership() {
        let exp = experiment(1, "onboarding", &["ios", "android"], &["US"], &["en"]);

        assert!(exp.targets(Some("ios"), Some("US"), Some("en")));
        assert!(exp.targets(Some("android"), Some("US"), Some("en")));
        assert!(!exp.targets(Some("web"), Some("US"), Some("en")));
        assert!(!exp.targets(Some("ios"), Some("FR"), Some("en")));
        // absent attributes don't constrain the match here; the
        // assignment store refuses under-specified principals upstream
        assert!(exp.targets(None, None, None));
    }

    #[test]
    fn overlap_requires_intersection_on_every_dimension() {
        let existing = experiment(7, "onboarding", &["ios"], &["US"], &["en"]);

        let mut candidate = NewExperiment {
            name: "v2".to_string(),
            experiment_type: "onboarding".to_string(),
            platforms: vec!["ios".to_string(), "android".to_string()],
            countries: vec!["US".to_string()],
            languages: vec!["en".to_string()],
            user_created_after: None,
            is_active: true,
            variants: variants(&[50, 50]),
        };
        assert_eq!(
            validate_no_overlap(&candidate, std::slice::from_ref(&existing)),
            Err(ExperimentValidationError::OverlappingTargeting(7))
        );

        // disjoint on one dimension is enough to coexist
        candidate.countries = vec!["FR".to_string()];
        assert_eq!(
            validate_no_overlap(&candidate, std::slice::from_ref(&existing)),
            Ok(())
        );

        // different type never conflicts
        candidate.countries = vec!["US".to_string()];
        candidate.experiment_type = "paywall".to_string();
        assert_eq!(
            validate_no_overlap(&candidate, std::slice::from_ref(&existing)),
            Ok(())
        );
    }
}
