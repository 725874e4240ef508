//! Stochastic solver.
//!
//! Each trajectory is an event chain: the sequence of (state, dwell) pairs
//! visited by one channel. Dwell times are exponential with the current
//! epoch's exit rate; a dwell that crosses an epoch boundary is cut there and
//! continued with a fresh draw from the next epoch's distribution.
//!
//! Chain times are measured from the condition's first sample, so a chain's
//! durations sum to `end_time - time[0]`.

use crate::epoch::{Epoch, UniqueEpoch};
use crate::spectral::equilibrium_probability;
use clamp_core::{AbortFlag, PassOutcome, Result, Time, SNAP_EPSILON};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::Distribution;

/// Events are reserved in batches of this size
const CHAIN_BATCH: usize = 1000;

/// One dwell of a trajectory
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub state: usize,
    pub duration: Time,
}

pub type EventChain = Vec<Event>;

/// Index of the first state whose cumulative probability exceeds `u`
fn pick_starting_state(probability: &Array1<f64>, u: f64) -> usize {
    let mut total = 0.0;
    for (i, &p) in probability.iter().enumerate() {
        total += p;
        if total > u {
            return i;
        }
    }
    probability.len().saturating_sub(1)
}

/// Next state after leaving `state`, chosen by relative exit rates
fn pick_next_state(epoch: &UniqueEpoch, state: usize, kout: f64, u: f64) -> usize {
    let n = epoch.num_states();
    let mut total = 0.0;
    let mut last_reachable = state;
    for j in (0..n).filter(|&j| j != state) {
        let rate = epoch.rates[[state, j]];
        if rate <= 0.0 {
            continue;
        }
        last_reachable = j;
        total += rate / kout;
        if total >= u {
            return j;
        }
    }
    last_reachable
}

fn draw_dwell(epoch: &UniqueEpoch, state: usize, span: Time, rng: &mut StdRng) -> Time {
    if epoch.exit_rate(state) < SNAP_EPSILON {
        return span;
    }
    match epoch.lifetimes.get(state).copied().flatten() {
        Some(lifetime) => lifetime.sample(rng),
        None => span,
    }
}

/// Append `runs` simulated trajectories of one condition to `chains`.
pub fn simulate_chains(
    time: &Array1<Time>,
    end_time: Time,
    epochs: &[Epoch],
    unique: &[UniqueEpoch],
    start_equilibrated: bool,
    runs: usize,
    rng: &mut StdRng,
    abort: &AbortFlag,
    chains: &mut Vec<EventChain>,
) -> Result<PassOutcome> {
    let (first, t0) = match (epochs.first(), time.iter().next()) {
        (Some(epoch), Some(&t0)) => (&unique[epoch.unique], t0),
        _ => return Ok(PassOutcome::Completed),
    };
    let span = end_time - t0;
    let starting = if start_equilibrated {
        equilibrium_probability(&first.rates)?
    } else {
        first.starting_probability.clone()
    };
    // Epoch ends relative to the first sample
    let boundaries: Vec<Time> = epochs.iter().map(|e| e.end() - t0).collect();

    chains.reserve(runs);
    for _ in 0..runs {
        if abort.is_aborted() {
            return Ok(PassOutcome::Aborted);
        }

        let mut chain = EventChain::with_capacity(CHAIN_BATCH);
        let mut state = pick_starting_state(&starting, rng.gen::<f64>());
        let mut elapsed = 0.0;
        let mut current = 0usize;

        while elapsed < span {
            if abort.is_aborted() {
                return Ok(PassOutcome::Aborted);
            }
            let mut dwell = draw_dwell(&unique[epochs[current].unique], state, span, rng);

            let mut exhausted = false;
            while elapsed + dwell > boundaries[current] {
                dwell = boundaries[current] - elapsed;
                current += 1;
                if current == epochs.len() {
                    exhausted = true;
                    break;
                }
                dwell += draw_dwell(&unique[epochs[current].unique], state, span, rng);
            }
            if exhausted {
                chain.push(Event {
                    state,
                    duration: span - elapsed,
                });
                break;
            }

            if chain.len() == chain.capacity() {
                chain.reserve(CHAIN_BATCH);
            }
            chain.push(Event {
                state,
                duration: dwell,
            });
            elapsed += dwell;

            if elapsed < span {
                let epoch = &unique[epochs[current].unique];
                let kout = epoch.exit_rate(state);
                state = pick_next_state(epoch, state, kout, rng.gen::<f64>());
            }
        }
        chains.push(chain);
    }
    Ok(PassOutcome::Completed)
}

/// Ensemble occupancy on the sample grid from event chains.
///
/// Each bin `[t_k, t_k+1)` (the last one ends at `end_time`) collects the
/// fraction of it covered by each event. A zero-width last bin takes the
/// state occupied at that instant.
pub fn probability_from_chains(
    time: &Array1<Time>,
    end_time: Time,
    num_states: usize,
    chains: &[EventChain],
    abort: &AbortFlag,
) -> Option<Array2<f64>> {
    let num_pts = time.len();
    let mut p = Array2::<f64>::zeros((num_pts, num_states));
    if num_pts == 0 || chains.is_empty() {
        return Some(p);
    }
    let bin_end = |t: usize| if t + 1 < num_pts { time[t + 1] } else { end_time };

    for chain in chains {
        if abort.is_aborted() {
            return None;
        }
        let mut events = chain.iter().peekable();
        let mut event = match events.next() {
            Some(e) => *e,
            None => continue,
        };
        let mut t = 0usize;
        let mut sample_start = time[0];
        let mut sample_end = bin_end(0);
        let mut event_start = time[0];
        let mut event_end = event_start + event.duration;

        while t < num_pts {
            let width = sample_end - sample_start;
            if width <= SNAP_EPSILON {
                // Instantaneous bin
                if event_end >= sample_start - SNAP_EPSILON || events.peek().is_none() {
                    p[[t, event.state]] += 1.0;
                    t += 1;
                    sample_start = sample_end;
                    sample_end = bin_end(t);
                    continue;
                }
            } else if event_start <= sample_start && event_end >= sample_end {
                // Event covers the whole bin
                p[[t, event.state]] += 1.0;
                t += 1;
                sample_start = sample_end;
                sample_end = bin_end(t);
                continue;
            } else if event_start <= sample_start {
                // Event ends inside the bin
                p[[t, event.state]] += (event_end - sample_start) / width;
            } else if event_end >= sample_end {
                // Event starts inside the bin
                p[[t, event.state]] += (sample_end - event_start) / width;
                t += 1;
                sample_start = sample_end;
                sample_end = bin_end(t);
                continue;
            } else {
                // Event starts and ends inside the bin
                p[[t, event.state]] += event.duration / width;
            }

            match events.next() {
                Some(e) => {
                    event = *e;
                    event_start = event_end;
                    event_end = event_start + event.duration;
                }
                None => break,
            }
        }
    }
    p /= chains.len() as f64;
    Some(p)
}
