// Copyright 2021 Karl Sundequist Blomdahl <karl.sundequist.blomdahl@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use rand::Rng;

use pz_tensor::Tensor;

pub const INVALID_ACTION: i64 = -1;

/// Sample an index in `0..n_elements` proportionally to `get_value`, by
/// rejection sampling against `max_value` with a cumulative fallback.
///
/// # Arguments
///
/// * `n_elements` -
/// * `max_value` - an upper bound on `get_value`
/// * `get_value` -
/// * `rng` -
///
pub fn sample_discrete_probability<F, R>(n_elements: usize, max_value: f32, get_value: F, rng: &mut R) -> usize
    where F: Fn(usize) -> f32,
          R: Rng
{
    assert!(n_elements > 0, "sample_discrete_probability was passed 0 elements");

    for _ in 0..4 {
        let index = rng.gen_range(0..n_elements);

        if rng.gen::<f32>() <= get_value(index) / max_value {
            return index;
        }
    }

    let probs = (0..n_elements).map(&get_value).collect::<Vec<_>>();
    let sum: f32 = probs.iter().sum();
    let mut v = rng.gen_range(0.0..sum.max(1e-9));

    for (i, p) in probs.iter().enumerate() {
        v -= p;

        if v <= 0.0 {
            return i;
        }
    }

    n_elements - 1
}

/// The outcome of one tree search: the visit-count policy, the chosen
/// action, and the root value.
#[derive(Clone, Debug, Default)]
pub struct MctsResult {
    pub max_visits: f32,
    pub sum_visits: f32,
    pub best_action: i64,
    pub mcts_policy: Vec<f32>,
    pub root_value: f32,
    pub rollouts: usize,
    pub rnn_state: Option<Tensor>
}

impl MctsResult {
    pub fn new() -> Self {
        Self {
            max_visits: -1000.0,
            sum_visits: 0.0,
            best_action: INVALID_ACTION,
            mcts_policy: Vec::new(),
            root_value: 0.0,
            rollouts: 0,
            rnn_state: None
        }
    }

    /// Record the visit count of one action. The best action tracks the
    /// argmax.
    ///
    /// # Arguments
    ///
    /// * `action` - index in the legal-actions list
    /// * `visits` -
    ///
    pub fn add(&mut self, action: i64, visits: f32) {
        let at = action as usize;

        if self.mcts_policy.len() <= at {
            self.mcts_policy.resize(at + 1, 0.0);
        }

        self.mcts_policy[at] = visits;
        self.sum_visits += visits;

        if visits > self.max_visits {
            self.max_visits = visits;
            self.best_action = action;
        }
    }

    /// Turn the visit counts into a distribution.
    pub fn normalize(&mut self) {
        if self.sum_visits > 0.0 {
            for value in &mut self.mcts_policy {
                *value /= self.sum_visits;
            }
        }
    }

    /// Replace the argmax action with one sampled from the normalized
    /// policy, re-weighted by `exp(2 pi^2)` so near-argmax actions keep
    /// most of the mass.
    ///
    /// # Arguments
    ///
    /// * `rng` -
    ///
    pub fn sample<R: Rng>(&mut self, rng: &mut R) {
        let n = self.mcts_policy.len();
        if n == 0 {
            return;
        }

        let floor = 1.0 - 0.5 / n as f32;
        let weight = move |pi_val: f32| (pi_val * pi_val * 2.0).exp() - floor;

        let max_pi = self.mcts_policy.iter().cloned().fold(0.0f32, f32::max);
        let max_weight = weight(max_pi);
        let policy = self.mcts_policy.clone();

        self.best_action = sample_discrete_probability(
            n,
            max_weight,
            |i| weight(policy[i]).max(0.0),
            rng
        ) as i64;
    }

    /// Replace the argmax action with one sampled proportionally to the
    /// visit counts themselves.
    ///
    /// # Arguments
    ///
    /// * `rng` -
    ///
    pub fn sample_by_visits<R: Rng>(&mut self, rng: &mut R) {
        let n = self.mcts_policy.len();
        if n == 0 || self.sum_visits <= 0.0 {
            return;
        }

        let policy = self.mcts_policy.clone();
        let max_pi = policy.iter().cloned().fold(0.0f32, f32::max);

        self.best_action = sample_discrete_probability(n, max_pi.max(1e-9), |i| policy[i], rng) as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_utils::rng::Xoshiro256;

    #[test]
    fn add_tracks_argmax() {
        let mut result = MctsResult::new();
        result.add(0, 10.0);
        result.add(1, 30.0);
        result.add(2, 5.0);

        assert_eq!(result.best_action, 1);
        assert_eq!(result.sum_visits, 45.0);

        result.normalize();
        assert!((result.mcts_policy.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn sample_prefers_heavy_actions() {
        let mut rng = Xoshiro256::new(1);
        let mut chosen = [0usize; 3];

        for _ in 0..1000 {
            let mut result = MctsResult::new();
            result.add(0, 1.0);
            result.add(1, 97.0);
            result.add(2, 2.0);
            result.normalize();
            result.sample(&mut rng);

            chosen[result.best_action as usize] += 1;
        }

        assert!(chosen[1] > 600, "sampled best action only {} times", chosen[1]);
    }

    #[test]
    fn sample_by_visits_matches_distribution() {
        let mut rng = Xoshiro256::new(7);
        let mut chosen = [0usize; 2];

        for _ in 0..2000 {
            let mut result = MctsResult::new();
            result.add(0, 3.0);
            result.add(1, 1.0);
            result.normalize();
            result.sample_by_visits(&mut rng);

            chosen[result.best_action as usize] += 1;
        }

        // roughly 3:1
        assert!(chosen[0] > 1300 && chosen[0] < 1700, "{:?}", chosen);
    }
}
