//! Activation search strategies over the verification cost arena.
//!
//! All strategies operate on single-candidate flips evaluated incrementally
//! through `CostArena::delta_toggle`, track the best activation seen, and
//! stop at the iteration cap, returning the best found so far rather than
//! failing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cost::CostArena;
use super::VerifierConfig;

/// Which optimizer explores the activation space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchStrategy {
    /// Always-descending single flips; terminates at the first local
    /// minimum. Fast, prone to local optima.
    LocalSearch,
    /// Local search with a tabu tenure on recently flipped candidates,
    /// escaping shallow minima.
    TabuSearch,
    /// Tabu search plus compound "replace" moves that swap an active
    /// candidate for one it conflicts with in a single step.
    TabuSearchWithReplace,
    /// Metropolis acceptance with a geometric cooling schedule. The default.
    SimulatedAnnealing,
}

impl Default for SearchStrategy {
    fn default() -> Self {
        SearchStrategy::SimulatedAnnealing
    }
}

const IMPROVEMENT_EPS: f64 = 1e-12;

/// Run the configured strategy and leave the arena at the best activation
/// found.
pub fn optimize(arena: &mut CostArena<'_>, config: &VerifierConfig) {
    match config.strategy {
        SearchStrategy::LocalSearch => local_search(arena, config.max_iterations),
        SearchStrategy::TabuSearch => tabu_search(arena, config, false),
        SearchStrategy::TabuSearchWithReplace => tabu_search(arena, config, true),
        SearchStrategy::SimulatedAnnealing => simulated_annealing(arena, config),
    }
}

/// Greedy descent: apply the best improving flip until none exists.
/// Never increases the cost.
fn local_search(arena: &mut CostArena<'_>, max_iterations: usize) {
    for iteration in 0..max_iterations {
        let mut best: Option<(usize, f64)> = None;
        for h in 0..arena.len() {
            let delta = arena.delta_toggle(h);
            if delta < -IMPROVEMENT_EPS && best.map_or(true, |(_, d)| delta < d) {
                best = Some((h, delta));
            }
        }
        match best {
            Some((h, _)) => {
                arena.toggle(h);
            }
            None => {
                debug!(iteration, cost = arena.cost(), "local minimum reached");
                return;
            }
        }
    }
}

/// Tabu search: take the best non-tabu flip even if it worsens the cost,
/// with aspiration overriding the tabu status when a move beats the best
/// cost seen. With `replace` enabled, compound deactivate-then-activate
/// moves across conflict edges are evaluated too.
fn tabu_search(arena: &mut CostArena<'_>, config: &VerifierConfig, replace: bool) {
    let n = arena.len();
    let mut tabu_until = vec![0usize; n];
    let mut best_cost = arena.cost();
    let mut best_activation = arena.activation();
    let mut stale = 0usize;

    for iteration in 1..=config.max_iterations {
        // Single flips.
        let mut chosen: Option<(Vec<usize>, f64)> = None;
        for h in 0..n {
            let delta = arena.delta_toggle(h);
            let tabu = tabu_until[h] > iteration;
            let aspiration = arena.cost() + delta < best_cost - IMPROVEMENT_EPS;
            if tabu && !aspiration {
                continue;
            }
            if chosen.as_ref().map_or(true, |(_, d)| delta < *d) {
                chosen = Some((vec![h], delta));
            }
        }

        // Replace moves: swap an active candidate for a conflicting
        // inactive one in one step.
        if replace {
            for h in 0..n {
                if !arena.is_active(h) {
                    continue;
                }
                let d1 = arena.toggle(h);
                for g in 0..n {
                    if g == h || arena.is_active(g) {
                        continue;
                    }
                    let d2 = arena.delta_toggle(g);
                    let delta = d1 + d2;
                    let tabu = tabu_until[h] > iteration || tabu_until[g] > iteration;
                    let aspiration = arena.cost() - d1 + delta < best_cost - IMPROVEMENT_EPS;
                    if (tabu && !aspiration) || delta >= -IMPROVEMENT_EPS {
                        continue;
                    }
                    if chosen.as_ref().map_or(true, |(_, d)| delta < *d) {
                        chosen = Some((vec![h, g], delta));
                    }
                }
                arena.toggle(h); // revert the probe
            }
        }

        let Some((moves, _)) = chosen else { break };
        for &h in &moves {
            arena.toggle(h);
            tabu_until[h] = iteration + config.tabu_tenure;
        }

        if arena.cost() < best_cost - IMPROVEMENT_EPS {
            best_cost = arena.cost();
            best_activation = arena.activation();
            stale = 0;
        } else {
            stale += 1;
            // No improvement within a couple of tenure windows: give up.
            if stale > 3 * config.tabu_tenure {
                break;
            }
        }
    }

    arena.set_activation(&best_activation);
}

/// Metropolis acceptance over random flips with geometric cooling.
fn simulated_annealing(arena: &mut CostArena<'_>, config: &VerifierConfig) {
    let n = arena.len();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut temperature = config.initial_temperature;
    let mut best_cost = arena.cost();
    let mut best_activation = arena.activation();

    for _ in 0..config.max_iterations {
        let h = rng.gen_range(0..n);
        let delta = arena.delta_toggle(h);
        let accept = delta < 0.0
            || (temperature > f64::EPSILON && rng.gen::<f64>() < (-delta / temperature).exp());
        if accept {
            arena.toggle(h);
            if arena.cost() < best_cost - IMPROVEMENT_EPS {
                best_cost = arena.cost();
                best_activation = arena.activation();
            }
        }
        temperature *= config.cooling_rate;
    }

    arena.set_activation(&best_activation);
    debug!(cost = best_cost, "annealing finished");
}
