//! Pure time-interval helpers shared by the lifecycle engine.
//!
//! Nothing here touches storage; everything is deterministic given its
//! arguments, which keeps the tests below exhaustive without a store.

use chrono::{DateTime, Utc};

use crate::error::{Result, WorkplannerError};

/// Lazy finite sequence of instants `start, start+step, …` while `<= end`.
///
/// Empty if `start > end`. Fails with `InvalidArgument` if `step` is not
/// strictly positive.
pub fn iter_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: chrono::Duration,
) -> Result<impl Iterator<Item = DateTime<Utc>>> {
    if step <= chrono::Duration::zero() {
        return Err(WorkplannerError::invalid("step must be strictly positive"));
    }

    Ok(std::iter::successors(Some(start), move |t| Some(*t + step)).take_while(move |t| *t <= end))
}

/// The greatest instant `b <= now` such that `b = t + k*step` for some
/// non-negative integer `k`. Used to compute the next expected worktime
/// from an anchor.
pub fn snap_to_last_boundary(
    t: DateTime<Utc>,
    step: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    if step <= chrono::Duration::zero() {
        return Err(WorkplannerError::invalid("step must be strictly positive"));
    }

    if now < t {
        return Ok(t);
    }

    let elapsed = now - t;
    let step_ms = step.num_milliseconds().max(1);
    let k = elapsed.num_milliseconds() / step_ms;
    Ok(t + step * (k as i32))
}

/// Given an unsorted set of instants, yields maximal contiguous runs
/// `[first, last]` where each successive element differs by exactly
/// `step`. Deduplicates and sorts first.
pub fn group_contiguous(
    times: &[DateTime<Utc>],
    step: chrono::Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut sorted: Vec<DateTime<Utc>> = times.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut runs = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut run_start) = iter.next() else {
        return runs;
    };
    let mut run_end = run_start;

    for t in iter {
        if t - run_end == step {
            run_end = t;
        } else {
            runs.push((run_start, run_end));
            run_start = t;
            run_end = t;
        }
    }
    runs.push((run_start, run_end));
    runs
}
