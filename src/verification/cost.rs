//! Activation cost function over candidate subsets.
//!
//! The cost of an activation vector balances the explained-scene reward
//! against model-outlier, clutter and pairwise-conflict penalties:
//!
//! ```text
//! cost = - Σ_s min(Σ_active w_h(s), 1)                 (explained reward, saturating)
//!        + regularizer * Σ_active outliers(h)          (model outliers)
//!        + clutter_regularizer * Σ_s unexplained(s) * active_clutter_refs(s)
//!        + Σ_{h,g active, conflicting} penalty(h, g)
//! ```
//!
//! State is an index-addressed arena over scene points (explanation count,
//! accumulated weight, active clutter references), so toggling one
//! candidate costs only a walk over that candidate's sparse lists instead
//! of a global re-evaluation.

use super::model::CandidateModel;
use super::VerifierConfig;

pub struct CostArena<'a> {
    candidates: &'a [CandidateModel],
    /// Per-candidate `(other, penalty)` conflict edges.
    conflicts: &'a [Vec<(usize, f64)>],
    regularizer: f64,
    clutter_regularizer: f64,

    active: Vec<bool>,
    /// Number of active candidates explaining each scene point.
    explain_count: Vec<u32>,
    /// Sum of active explanation weights per scene point.
    explain_weight: Vec<f64>,
    /// Number of active candidates listing each scene point as a clutter
    /// neighbor.
    clutter_refs: Vec<u32>,
    cost: f64,
}

impl<'a> CostArena<'a> {
    pub fn new(
        candidates: &'a [CandidateModel],
        conflicts: &'a [Vec<(usize, f64)>],
        config: &VerifierConfig,
        scene_len: usize,
        initial_active: bool,
    ) -> Self {
        let mut arena = Self {
            candidates,
            conflicts,
            regularizer: config.regularizer,
            clutter_regularizer: config.clutter_regularizer,
            active: vec![false; candidates.len()],
            explain_count: vec![0; scene_len],
            explain_weight: vec![0.0; scene_len],
            clutter_refs: vec![0; scene_len],
            cost: 0.0,
        };
        if initial_active {
            for h in 0..candidates.len() {
                arena.toggle(h);
            }
        }
        arena
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_active(&self, h: usize) -> bool {
        self.active[h]
    }

    pub fn activation(&self) -> Vec<bool> {
        self.active.clone()
    }

    /// Cost change of flipping candidate `h`, without modifying state.
    pub fn delta_toggle(&self, h: usize) -> f64 {
        let cm = &self.candidates[h];
        let mut delta = 0.0;

        if !self.active[h] {
            delta += self.regularizer * cm.outlier_count as f64;
            for &(s, w) in &cm.explained {
                let ew = self.explain_weight[s];
                delta -= (ew + w).min(1.0) - ew.min(1.0);
                if self.explain_count[s] == 0 {
                    // Newly explained: it stops being clutter for whichever
                    // active candidates reference it.
                    delta -= self.clutter_regularizer * self.clutter_refs[s] as f64;
                }
            }
            for &s in &cm.clutter_neighbors {
                if self.explain_count[s] == 0 {
                    delta += self.clutter_regularizer;
                }
            }
            for &(g, penalty) in &self.conflicts[h] {
                if self.active[g] {
                    delta += penalty;
                }
            }
        } else {
            delta -= self.regularizer * cm.outlier_count as f64;
            for &(s, w) in &cm.explained {
                let ew = self.explain_weight[s];
                delta += ew.min(1.0) - (ew - w).max(0.0).min(1.0);
                if self.explain_count[s] == 1 {
                    // Loses its only explainer and becomes clutter again.
                    delta += self.clutter_regularizer * self.clutter_refs[s] as f64;
                }
            }
            for &s in &cm.clutter_neighbors {
                if self.explain_count[s] == 0 {
                    delta -= self.clutter_regularizer;
                }
            }
            for &(g, penalty) in &self.conflicts[h] {
                if self.active[g] {
                    delta -= penalty;
                }
            }
        }

        delta
    }

    /// Flip candidate `h` and return the applied cost change.
    pub fn toggle(&mut self, h: usize) -> f64 {
        let delta = self.delta_toggle(h);
        let activating = !self.active[h];
        self.active[h] = activating;

        let cm = &self.candidates[h];
        if activating {
            for &(s, w) in &cm.explained {
                self.explain_count[s] += 1;
                self.explain_weight[s] += w;
            }
            for &s in &cm.clutter_neighbors {
                self.clutter_refs[s] += 1;
            }
        } else {
            for &(s, w) in &cm.explained {
                self.explain_count[s] -= 1;
                self.explain_weight[s] = (self.explain_weight[s] - w).max(0.0);
            }
            for &s in &cm.clutter_neighbors {
                self.clutter_refs[s] -= 1;
            }
        }

        self.cost += delta;
        delta
    }

    /// Force the arena into a given activation vector.
    pub fn set_activation(&mut self, target: &[bool]) {
        for h in 0..self.active.len() {
            if self.active[h] != target[h] {
                self.toggle(h);
            }
        }
    }
}
