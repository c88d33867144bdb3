//! Parallel candidate sampling.
//!
//! Wraps one decision point in N concurrently generated, concurrently
//! verified candidates and selects the best by verification progress. This
//! is the engine's test-time-compute lever: the correctness bar for a
//! single decision rises with N at the cost of N× inference and sandbox
//! load, so N is itself a tunable parameter.

use std::thread;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::verify::Verdict;

/// Sampling parameters for one candidate: its rung on the temperature
/// ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleParams {
    pub index: usize,
    pub temperature: f64,
}

/// Distinct sampling parameters for each of `width` candidates.
pub fn temperature_ladder(width: u32, base: f64, step: f64) -> Vec<SampleParams> {
    (0..width.max(1) as usize)
        .map(|index| SampleParams {
            index,
            temperature: base + step * index as f64,
        })
        .collect()
}

/// A candidate that survived generation and verification.
#[derive(Debug)]
pub struct Scored<C> {
    pub candidate: C,
    pub verdict: Verdict,
    pub resource_units: u64,
    pub index: usize,
}

/// Result of one sampling round.
#[derive(Debug)]
pub enum RoundOutcome<C> {
    /// A winner was selected; the losers are returned for cleanup only and
    /// must leave no trace in the authoritative workspace.
    Winner {
        winner: Scored<C>,
        discarded: Vec<C>,
    },
    /// Every candidate failed to generate or verify. A failed step, not a
    /// crash.
    AllFailed { attempted: usize },
    /// The round was cancelled; nothing may be merged.
    Cancelled { discarded: Vec<C> },
}

/// Generate and verify `params.len()` candidates concurrently, then select
/// the winner.
///
/// `generate` produces a candidate (plus its resource units) for one rung
/// of the temperature ladder, against its own isolated workspace copy;
/// `verify` scores it. Partial failures shrink the surviving set.
#[instrument(skip_all, fields(width = params.len()))]
pub fn run_round<C, G, V>(
    params: &[SampleParams],
    generate: G,
    verify: V,
    cancel: &CancelToken,
) -> RoundOutcome<C>
where
    C: Send,
    G: Fn(&SampleParams) -> Result<(C, u64)> + Sync,
    V: Fn(&C) -> Result<Verdict> + Sync,
{
    let attempted = params.len();
    let results: Vec<Option<Scored<C>>> = thread::scope(|scope| {
        let handles: Vec<_> = params
            .iter()
            .map(|param| {
                let generate = &generate;
                let verify = &verify;
                scope.spawn(move || -> Option<Scored<C>> {
                    let (candidate, resource_units) = match generate(param) {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(index = param.index, err = %err, "candidate generation failed");
                            return None;
                        }
                    };
                    match verify(&candidate) {
                        Ok(verdict) => Some(Scored {
                            candidate,
                            verdict,
                            resource_units,
                            index: param.index,
                        }),
                        Err(err) => {
                            warn!(index = param.index, err = %err, "candidate verification failed");
                            None
                        }
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(None))
            .collect()
    });

    let survivors: Vec<Scored<C>> = results.into_iter().flatten().collect();
    if cancel.is_cancelled() {
        return RoundOutcome::Cancelled {
            discarded: survivors.into_iter().map(|s| s.candidate).collect(),
        };
    }
    if survivors.is_empty() {
        return RoundOutcome::AllFailed { attempted };
    }
    let (winner, discarded) = select_winner(survivors);
    debug!(
        index = winner.index,
        progress = winner.verdict.progress(),
        "selected round winner"
    );
    RoundOutcome::Winner { winner, discarded }
}

/// Pick the candidate with the highest verification progress. Ties break
/// by lowest resource usage, then lowest ladder index for determinism.
pub fn select_winner<C>(mut survivors: Vec<Scored<C>>) -> (Scored<C>, Vec<C>) {
    let mut best = 0usize;
    for i in 1..survivors.len() {
        if better(&survivors[i], &survivors[best]) {
            best = i;
        }
    }
    let winner = survivors.swap_remove(best);
    let discarded = survivors.into_iter().map(|s| s.candidate).collect();
    (winner, discarded)
}

fn better<C>(a: &Scored<C>, b: &Scored<C>) -> bool {
    let (pa, pb) = (a.verdict.progress(), b.verdict.progress());
    if (pa - pb).abs() > 1e-9 {
        return pa > pb;
    }
    if a.resource_units != b.resource_units {
        return a.resource_units < b.resource_units;
    }
    a.index < b.index
}
