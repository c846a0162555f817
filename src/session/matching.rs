//! Reappearance matching: pairs unmatched observations with sessions that
//! recently went idle or were closed.

use std::time::Duration;

use nalgebra::Point2;
use ndarray::Array2;

use crate::clock::Timestamp;
use crate::session::lifecycle::SessionId;
use crate::session::observation::{StreamId, TrackKey, TrackedObservation};
use crate::session::rect::distance_batch;

/// Cost assigned to pairs that may not merge.
const INELIGIBLE: f64 = 1e6;
/// Weight of the normalised distance term; only breaks exact recency ties.
const DISTANCE_WEIGHT: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateOrigin {
    /// Open session whose track has gone quiet.
    Idle { key: TrackKey },
    /// Session already closed by the reaper.
    Retired,
}

#[derive(Debug, Clone)]
pub(crate) struct MergeCandidate {
    pub origin: CandidateOrigin,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub last_seen_at: Timestamp,
    pub position: Point2<f32>,
}

/// Build the merge cost matrix (observations x candidates).
///
/// Eligible pairs share a stream, lie within `radius` and were last seen
/// between `min_idle` and `window` before `now`. Their cost is dominated by
/// time since last activity, so the most recently seen candidate wins.
pub(crate) fn merge_costs(
    observations: &[&TrackedObservation],
    candidates: &[MergeCandidate],
    now: Timestamp,
    radius: f32,
    min_idle: Duration,
    window: Duration,
) -> Array2<f64> {
    let obs_points: Vec<Point2<f32>> = observations.iter().map(|o| o.centroid).collect();
    let cand_points: Vec<Point2<f32>> = candidates.iter().map(|c| c.position).collect();
    let dists = distance_batch(&obs_points, &cand_points);

    let window_secs = window.as_secs_f64().max(f64::EPSILON);
    let radius = radius.max(f32::EPSILON);

    let mut costs = Array2::from_elem(dists.dim(), INELIGIBLE);
    for (i, obs) in observations.iter().enumerate() {
        for (j, cand) in candidates.iter().enumerate() {
            if cand.stream_id != obs.key.stream_id || cand.last_seen_at >= now {
                continue;
            }
            let gap = now.saturating_since(cand.last_seen_at);
            let dist = dists[[i, j]];
            if gap < min_idle || gap > window || dist > radius {
                continue;
            }
            costs[[i, j]] =
                gap.as_secs_f64() / window_secs + DISTANCE_WEIGHT * (dist / radius) as f64;
        }
    }
    costs
}

/// Solve the assignment; returns, for each observation row, its candidate column.
pub(crate) fn assign(costs: &Array2<f64>) -> Vec<Option<usize>> {
    let (num_rows, num_cols) = costs.dim();
    let mut assignment = vec![None; num_rows];
    if num_rows == 0 || num_cols == 0 {
        return assignment;
    }

    let size = num_rows.max(num_cols);
    let mut padded = Array2::<f64>::from_elem((size, size), INELIGIBLE);
    padded
        .slice_mut(ndarray::s![..num_rows, ..num_cols])
        .assign(costs);

    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => {
            for (row, &col) in row_to_col.iter().enumerate().take(num_rows) {
                if col < num_cols && costs[[row, col]] < INELIGIBLE {
                    assignment[row] = Some(col);
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = ?e, "merge assignment failed, treating all as new sessions");
        }
    }
    assignment
}
