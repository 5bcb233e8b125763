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

use pz_utils::config;

/// Parameters of a tree search.
#[derive(Clone, Debug)]
pub struct MctsOption {
    /// Wall-clock budget for the whole game, in seconds. Zero disables
    /// time-based budgeting in favour of a fixed rollout count.
    pub total_time: f32,

    /// The fraction of the remaining time budget spent on each move.
    pub time_ratio: f32,

    /// Coefficient of the prior score in the selection formula.
    pub puct: f32,

    /// First `k` plies of the game where the move is sampled from the
    /// visit distribution instead of picked greedily.
    pub sample_before_step_idx: usize,

    /// Number of rollouts per move when no time budget is set.
    pub num_rollout_per_thread: usize,

    pub seed: u64,

    /// Transient penalty added to a node while a rollout through it is in
    /// flight, so concurrent selections diverge.
    pub virtual_loss: f32,

    /// Initialize unvisited children with the average value of their
    /// explored siblings instead of zero.
    pub use_value_prior: bool,

    /// Store the game state in the node only at tree depths that are
    /// multiples of this; other nodes recompute it by replaying from the
    /// nearest stored ancestor.
    pub store_state_interval: usize,

    /// Randomize the rollout budget of each search around the mean.
    pub randomized_rollouts: bool,

    /// Pick the move with the stochastic visit-weighted rule on every
    /// step.
    pub sampling_mcts: bool,

    /// Minimum-visit multiplier for actions with a small prior.
    pub forced_rollouts_multiplier: f32
}

impl Default for MctsOption {
    fn default() -> Self {
        Self {
            total_time: 0.0,
            time_ratio: 0.035,
            puct: 0.0,
            sample_before_step_idx: 0,
            num_rollout_per_thread: 400,
            seed: 123,
            virtual_loss: 0.0,
            use_value_prior: true,
            store_state_interval: 1,
            randomized_rollouts: false,
            sampling_mcts: false,
            forced_rollouts_multiplier: 2.0
        }
    }
}

impl MctsOption {
    /// An option set populated from the process configuration.
    pub fn from_config() -> Self {
        Self {
            total_time: *config::TOTAL_TIME,
            time_ratio: *config::TIME_RATIO,
            puct: *config::PUCT,
            sample_before_step_idx: *config::SAMPLE_BEFORE_STEP_IDX,
            num_rollout_per_thread: *config::NUM_ROLLOUT,
            seed: *config::SEED,
            virtual_loss: *config::VIRTUAL_LOSS,
            use_value_prior: true,
            store_state_interval: *config::STORE_STATE_INTERVAL,
            randomized_rollouts: *config::RANDOMIZED_ROLLOUTS,
            sampling_mcts: *config::SAMPLING_MCTS,
            forced_rollouts_multiplier: *config::FORCED_ROLLOUTS_MULTIPLIER
        }
    }
}
