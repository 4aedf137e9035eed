//! Protected-ref filtering. Runners limited to protected refs only see
//! protected jobs; every other runner sees everything.

use crate::QueueCandidate;

pub fn protected_only<C: QueueCandidate>(candidates: Vec<C>) -> Vec<C> {
    candidates.into_iter().filter(|c| c.is_protected()).collect()
}
