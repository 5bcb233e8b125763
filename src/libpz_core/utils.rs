// Copyright 2020 Karl Sundequist Blomdahl <karl.sundequist.blomdahl@gmail.com>
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

use pz_games::GameState;
use pz_tensor::{Dtype, Tensor};

/// The input planes of `state` as a `[C, H, W]` tensor.
pub fn feature_tensor(state: &dyn GameState) -> Tensor {
    Tensor::from_f32(&state.get_feature_size(), state.get_features())
}

/// The compact board encoding of `state` as a tensor.
pub fn raw_feature_tensor(state: &dyn GameState) -> Tensor {
    Tensor::from_f32(&state.get_raw_feature_size(), state.get_raw_features())
}

/// A `[P, H, W]` mask with a one at the cell of every legal action.
pub fn policy_mask_tensor(state: &dyn GameState) -> Tensor {
    let shape = state.get_action_size();
    let mut mask = Tensor::zeros(&shape, Dtype::F32);
    let (h, w) = (shape[1], shape[2]);

    {
        let values = mask.as_f32_mut();

        for action in state.legal_actions() {
            values[((action.x * h + action.y) * w + action.z) as usize] = 1.0;
        }
    }

    mask
}

/// Spread a per-action policy over the `[P, H, W]` policy planes, summing
/// where several actions share a cell, together with the legal mask.
///
/// # Arguments
///
/// * `state` -
/// * `pi` - one value per legal action, in legal-action order
///
pub fn policy_in_tensor(state: &dyn GameState, pi: &[f32]) -> (Tensor, Tensor) {
    let shape = state.get_action_size();
    let mut dest = Tensor::zeros(&shape, Dtype::F32);
    let mut mask = Tensor::zeros(&shape, Dtype::F32);
    let (h, w) = (shape[1], shape[2]);
    let legal_actions = state.legal_actions();

    assert!(
        pi.len() <= legal_actions.len(),
        "policy has {} entries but only {} legal actions", pi.len(), legal_actions.len()
    );

    {
        let dest = dest.as_f32_mut();
        let mask = mask.as_f32_mut();

        for (action_idx, &pi_val) in pi.iter().enumerate() {
            let action = &legal_actions[action_idx];
            let at = ((action.x * h + action.y) * w + action.z) as usize;

            dest[at] += pi_val;
            mask[at] = 1.0;
        }
    }

    (dest, mask)
}

/// A one-hot `[P, H, W]` tensor marking the cell of the chosen action.
///
/// # Arguments
///
/// * `state` -
/// * `action_idx` -
///
pub fn action_one_hot(state: &dyn GameState, action_idx: usize) -> Tensor {
    let shape = state.get_action_size();
    let mut out = Tensor::zeros(&shape, Dtype::F32);
    let (h, w) = (shape[1], shape[2]);
    let action = &state.legal_actions()[action_idx];

    out.as_f32_mut()[((action.x * h + action.y) * w + action.z) as usize] = 1.0;
    out
}

/// Generalized advantage estimation over one player's steps of a finished
/// game, with `gamma = 0.997` and `lambda = 0.95`. Returns the per-step
/// value targets `gae + pred_v`.
///
/// # Arguments
///
/// * `rewards` - per-step environment rewards of this player
/// * `pred_v` - per-step predicted values
/// * `final_result` - the game outcome used to bootstrap the last step
/// * `slot_result` - the outcome attributed to this seat, seeding the
///   running reward
///
pub fn gae_rewards(rewards: &[f32], pred_v: &[f32], final_result: f32, slot_result: f32) -> Vec<f32> {
    const GAMMA: f32 = 0.997;
    const GAE_LAMBDA: f32 = 0.95;

    assert_eq!(rewards.len(), pred_v.len());

    let mut out = vec! [0.0; rewards.len()];
    let mut gae = 0.0;
    let mut reward = slot_result;

    for n in (0..rewards.len()).rev() {
        let predv = pred_v[n];
        let npredv = if n == rewards.len() - 1 { final_result } else { pred_v[n + 1] };
        let delta = reward + GAMMA * npredv - predv;

        gae = delta + GAMMA * GAE_LAMBDA * gae;
        out[n] = gae + predv;
        reward = rewards[n];
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_games::MnkState;

    #[test]
    fn mask_matches_legal_actions() {
        let mut state = MnkState::tictactoe();
        state.initialize();
        state.forward(4);

        let mask = policy_mask_tensor(&state);

        assert_eq!(mask.as_f32().iter().sum::<f32>(), 8.0);
        assert_eq!(mask.as_f32()[4], 0.0);
    }

    #[test]
    fn policy_lands_on_cells() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        let pi = vec! [0.5, 0.5];
        let (policy, mask) = policy_in_tensor(&state, &pi);

        assert_eq!(policy.as_f32()[0], 0.5);
        assert_eq!(policy.as_f32()[1], 0.5);
        assert_eq!(policy.as_f32().iter().sum::<f32>(), 1.0);
        assert_eq!(mask.as_f32().iter().sum::<f32>(), 2.0);
    }

    #[test]
    fn one_hot_is_single() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        let one_hot = action_one_hot(&state, 3);

        assert_eq!(one_hot.as_f32().iter().sum::<f32>(), 1.0);
        assert_eq!(one_hot.as_f32()[3], 1.0);
    }

    #[test]
    fn gae_terminal_only() {
        // a two-step game whose only reward is the final result; with a
        // perfect value function the targets equal the bootstrap
        let targets = gae_rewards(&[0.0, 0.0], &[1.0, 1.0], 1.0, 0.0);

        for t in &targets {
            assert!((t - 1.0).abs() < 0.05, "target {}", t);
        }
    }

    #[test]
    fn gae_matches_hand_computation() {
        let rewards = [0.0, 1.0];
        let pred_v = [0.5, 0.25];
        let targets = gae_rewards(&rewards, &pred_v, -1.0, 0.0);

        // last step first
        let delta_1 = 1.0 + 0.997 * -1.0 - 0.25;
        let gae_1: f32 = delta_1;
        let delta_0 = 0.0 + 0.997 * 0.25 - 0.5;
        let gae_0 = delta_0 + 0.997 * 0.95 * gae_1;

        assert!((targets[1] - (gae_1 + 0.25)).abs() < 1e-5);
        assert!((targets[0] - (gae_0 + 0.5)).abs() < 1e-5);
    }
}
