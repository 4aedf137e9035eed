//! Tag matching.
//!
//! A runner may take a job only if every tag on the job is also on the
//! runner. Untagged jobs match every runner unless the runner refuses
//! untagged work.

use buildq_core::TagId;
use std::collections::BTreeSet;

use crate::QueueCandidate;

/// Whether `job_tags` is a subset of `runner_tags`.
pub fn tags_match(job_tags: &BTreeSet<TagId>, runner_tags: &BTreeSet<TagId>) -> bool {
    job_tags.is_subset(runner_tags)
}

/// Drop candidates carrying any tag the runner lacks.
pub fn matching_tag_ids<C: QueueCandidate>(
    candidates: Vec<C>,
    runner_tags: &BTreeSet<TagId>,
) -> Vec<C> {
    candidates
        .into_iter()
        .filter(|c| tags_match(c.tag_ids(), runner_tags))
        .collect()
}

/// Keep only candidates with at least one tag.
pub fn with_any_tags<C: QueueCandidate>(candidates: Vec<C>) -> Vec<C> {
    candidates
        .into_iter()
        .filter(|c| !c.tag_ids().is_empty())
        .collect()
}
