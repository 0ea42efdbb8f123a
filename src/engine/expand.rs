use crate::catalog::Catalog;
use crate::config::limits::MAX_CANDIDATES;
use crate::model::{Candidate, ReservationRequest};

/// Fan one request out into ranked fallback candidates.
///
/// Two start times (the requested one, then one slot later) by two courts
/// (the requested one, then its same-class alternate). Time varies slower
/// than court, so the order is:
///
/// `(t, R)`, `(t, Alt)`, `(t + slot, R)`, `(t + slot, Alt)`
///
/// A court with no same-class sibling yields only `(t, R)`, `(t + slot, R)`.
/// Deterministic, never empty, rank 0 is always the unmodified request.
pub fn expand(request: &ReservationRequest, catalog: &Catalog, slot: chrono::Duration) -> Vec<Candidate> {
    let mut courts = vec![request.resource];
    if let Some(alt) = catalog.alternate_for(request.resource) {
        courts.push(alt.id);
    }
    let starts = [request.target, request.target + slot];

    let mut candidates = Vec::with_capacity(starts.len() * courts.len());
    for start in starts {
        for &resource in &courts {
            candidates.push(Candidate {
                rank: candidates.len(),
                start,
                end: start + slot,
                resource,
            });
        }
    }
    candidates.truncate(MAX_CANDIDATES);
    candidates
}
