// ADHOCD — ROUTING: RL AGENT
// Action selection and value estimation over a route entry's contents.
// Both are pure functions of the candidate list so the policy and the
// learning rule stay independently swappable.

use rand::Rng;

use crate::config::Config;
use crate::engine::codec::Mac;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMethod {
    Greedy,
    EpsilonGreedy,
    SoftMax,
}

impl SelectionMethod {
    pub fn from_config(name: &str) -> SelectionMethod {
        match name {
            "greedy" => SelectionMethod::Greedy,
            "e-greedy" => SelectionMethod::EpsilonGreedy,
            _ => SelectionMethod::SoftMax,
        }
    }
}

/// Samples a next-hop MAC from `(mac, value)` candidates.
#[derive(Debug, Clone)]
pub struct ActionSelector {
    pub method: SelectionMethod,
    tau: f64,
    epsilon: f64,
}

impl ActionSelector {
    pub fn new(cfg: &Config) -> Self {
        ActionSelector {
            method: SelectionMethod::from_config(&cfg.selection_method),
            tau: cfg.tau,
            epsilon: cfg.epsilon,
        }
    }

    pub fn select(&self, candidates: &[(Mac, f64)]) -> Option<Mac> {
        if candidates.is_empty() {
            return None;
        }
        match self.method {
            SelectionMethod::Greedy => Some(greedy(candidates)),
            SelectionMethod::EpsilonGreedy => {
                let mut rng = rand::thread_rng();
                if rng.gen::<f64>() < self.epsilon {
                    Some(candidates[rng.gen_range(0..candidates.len())].0)
                } else {
                    Some(greedy(candidates))
                }
            }
            SelectionMethod::SoftMax => Some(self.softmax_draw(candidates)),
        }
    }

    /// Gibbs/Boltzmann distribution over the values, then a categorical draw.
    fn softmax_draw(&self, candidates: &[(Mac, f64)]) -> Mac {
        let weights = softmax_weights(candidates, self.tau);
        let mut n: f64 = rand::thread_rng().gen::<f64>();
        for (i, w) in weights.iter().enumerate() {
            if n < *w {
                return candidates[i].0;
            }
            n -= w;
        }
        // Floating-point residue lands on the last candidate.
        candidates[candidates.len() - 1].0
    }

    /// The softmax probability assigned to `mac`, for inspection and tests.
    pub fn probability_of(&self, candidates: &[(Mac, f64)], mac: &Mac) -> f64 {
        let weights = softmax_weights(candidates, self.tau);
        candidates
            .iter()
            .zip(weights)
            .filter(|((m, _), _)| m == mac)
            .map(|(_, w)| w)
            .sum()
    }
}

fn greedy(candidates: &[(Mac, f64)]) -> Mac {
    let mut best = &candidates[0];
    for c in &candidates[1..] {
        if c.1 > best.1 {
            best = c;
        }
    }
    best.0
}

/// Normalized `exp(v/tau)` weights. The max value is subtracted first so
/// large estimates cannot overflow the exponential.
fn softmax_weights(candidates: &[(Mac, f64)], tau: f64) -> Vec<f64> {
    let max = candidates
        .iter()
        .map(|(_, v)| *v)
        .fold(f64::NEG_INFINITY, f64::max);
    let raw: Vec<f64> = candidates
        .iter()
        .map(|(_, v)| ((v - max) / tau).exp())
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// Incremental value update `v ← v + α(reward − v)`. Absent pairs start at
/// `V_INIT` before the first update is applied.
#[derive(Debug, Clone, Copy)]
pub struct ValueEstimator {
    alpha: f64,
    pub v_init: f64,
}

impl ValueEstimator {
    pub fn new(cfg: &Config) -> Self {
        ValueEstimator {
            alpha: cfg.alpha,
            v_init: cfg.v_init,
        }
    }

    pub fn estimate(&self, current: f64, reward: f64) -> f64 {
        current + self.alpha * (reward - current)
    }
}
