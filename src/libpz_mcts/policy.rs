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

use pz_games::GameState;
use pz_tensor::Tensor;

/// Extract the policy logit of every legal action from the `[P, H, W]`
/// policy tensor, in legal-action order. Each consumed cell is exchanged
/// with `-400` (whose exp rounds to zero), so when several actions map to
/// the same cell the first takes the whole mass and the rest read zero.
/// This keeps the probabilities summing to one; the search compensates by
/// force-visiting the zero-prior siblings.
///
/// # Arguments
///
/// * `state` -
/// * `logits` - the policy tensor, consumed in place
///
pub fn legal_pi(state: &dyn GameState, logits: &mut Tensor) -> Vec<f32> {
    let shape = logits.shape().to_vec();
    assert_eq!(shape.len(), 3, "policy tensor must be [planes, h, w]");

    let (h, w) = (shape[1], shape[2]);
    let values = logits.as_f32_mut();
    let legal_actions = state.legal_actions();
    let mut out = Vec::with_capacity(legal_actions.len());

    for action in legal_actions {
        let at = ((action.x * h + action.y) * w + action.z) as usize;

        out.push(std::mem::replace(&mut values[at], -400.0));
    }

    out
}

/// Softmax in place.
///
/// # Arguments
///
/// * `values` -
///
pub fn softmax_(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }

    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;

    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    for v in values.iter_mut() {
        *v /= sum;
    }
}

/// Softmax in place with a temperature.
///
/// # Arguments
///
/// * `values` -
/// * `temperature` -
///
pub fn softmax_with_temperature_(values: &mut [f32], temperature: f32) {
    let itemp = 1.0 / temperature;

    for v in values.iter_mut() {
        *v *= itemp;
    }

    softmax_(values);
}

/// Normalize a non-negative policy so it sums to one. Panics if the sum
/// exceeds one by more than the tolerated rounding error, since that
/// indicates the mass was double-counted upstream.
///
/// # Arguments
///
/// * `values` -
///
pub fn normalize(values: &mut [f32]) {
    let sum: f32 = values.iter().sum();

    assert!(sum <= 1.0 + 1e-3, "policy sums to {}", sum);

    if sum != 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_games::{GameState as _, MnkState};
    use pz_tensor::Dtype;

    #[test]
    fn softmax_sums_to_one() {
        let mut values = vec! [0.0, 1.0, 2.0, -1.0];
        softmax_(&mut values);

        let sum: f32 = values.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(values[2] > values[1] && values[1] > values[0]);
    }

    #[test]
    fn legal_pi_reads_cells_once() {
        let mut state = MnkState::tictactoe();
        state.initialize();
        state.forward(0);

        let mut logits = Tensor::zeros(&[1, 3, 3], Dtype::F32);
        logits.as_f32_mut().iter_mut().enumerate().for_each(|(i, v)| *v = i as f32);

        let pi = legal_pi(&state, &mut logits);

        assert_eq!(pi.len(), 8);
        assert_eq!(pi, vec! [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        // the consumed cells read -400 now
        assert_eq!(logits.as_f32()[1], -400.0);
        // the occupied cell was never consumed
        assert_eq!(logits.as_f32()[0], 0.0);
    }

    #[test]
    fn legal_pi_softmax_is_a_distribution() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        let mut logits = Tensor::zeros(&[1, 3, 3], Dtype::F32);
        let mut pi = legal_pi(&state, &mut logits);
        softmax_(&mut pi);

        let sum: f32 = pi.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3);
    }
}
