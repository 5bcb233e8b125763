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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;

use pz_games::GameState;
use pz_nn::ModelManager;
use pz_tensor::{push_left, DataBlock, Dtype, Tensor};
use pz_tube::{DataChannel, Dispatcher};

use crate::policy::softmax_;

/// The evaluation of one state: whose turn it was, the predicted value,
/// the raw policy logits, and the next recurrent state for recurrent
/// models.
#[derive(Clone, Debug)]
pub struct PiVal {
    pub player: usize,
    pub value: f32,
    pub logit_policy: Tensor,
    pub rnn_state: Option<Tensor>
}

struct BatchBuffers {
    capacity: usize,
    feat: Tensor,
    pi: Tensor,
    value: Tensor,
    rnn_stack: Vec<Option<Tensor>>,
    rnn_out: Option<Tensor>
}

/// Evaluates states for a search, either one at a time through a
/// `DataChannel` dispatch or in batches straight through the
/// `ModelManager`. Degrades to a random-rollout value and a uniform policy
/// when the channel is gone or the model is disabled, so self-play keeps
/// running.
pub struct Actor {
    dispatcher: Option<Mutex<Dispatcher>>,
    feat: Option<Arc<DataBlock>>,
    pi: Option<Arc<DataBlock>>,
    value: Option<Arc<DataBlock>>,
    rnn_state: Option<Arc<DataBlock>>,
    rnn_state_out: Option<Arc<DataBlock>>,

    use_value: bool,
    use_policy: bool,
    feat_size: Vec<i64>,
    policy_size: Vec<i64>,
    uniform_policy: f32,
    rnn_state_size: Vec<i64>,
    rnn_seqlen: usize,
    logit_value: bool,
    model_manager: Option<Arc<ModelManager>>,

    batch: Mutex<BatchBuffers>,
    batch_timing: Mutex<f32>,
    model_trackers: Mutex<HashMap<u64, HashMap<String, f32>>>
}

impl Actor {
    /// Create an actor.
    ///
    /// # Arguments
    ///
    /// * `dc` - the act channel used for single-state dispatches, if any
    /// * `feat_size` - `[C, H, W]`
    /// * `action_size` - `[P, H, W]`
    /// * `rnn_state_size` - empty for feed-forward models
    /// * `rnn_seqlen` -
    /// * `logit_value` - true for a 3-logit win/lose/draw value head
    /// * `use_value` / `use_policy` - disabling either substitutes the
    ///   degraded fallback for that head
    /// * `model_manager` - enables the batched evaluation path
    ///
    pub fn new(
        dc: Option<Arc<DataChannel>>,
        feat_size: &[i64],
        action_size: &[i64],
        rnn_state_size: &[i64],
        rnn_seqlen: usize,
        logit_value: bool,
        use_value: bool,
        use_policy: bool,
        model_manager: Option<Arc<ModelManager>>
    ) -> Self {
        let uniform_policy = 1.0 / action_size.iter().product::<i64>() as f32;
        let mut out = Self {
            dispatcher: None,
            feat: None,
            pi: None,
            value: None,
            rnn_state: None,
            rnn_state_out: None,
            use_value,
            use_policy,
            feat_size: feat_size.to_vec(),
            policy_size: action_size.to_vec(),
            uniform_policy,
            rnn_state_size: rnn_state_size.to_vec(),
            rnn_seqlen,
            logit_value,
            model_manager,
            batch: Mutex::new(BatchBuffers {
                capacity: 0,
                feat: Tensor::zeros(&[0], Dtype::F32),
                pi: Tensor::zeros(&[0], Dtype::F32),
                value: Tensor::zeros(&[0], Dtype::F32),
                rnn_stack: Vec::new(),
                rnn_out: None
            }),
            batch_timing: Mutex::new(0.0),
            model_trackers: Mutex::new(HashMap::new())
        };

        if (!use_value && !use_policy) || dc.is_none() {
            return out;
        }

        let feat = Arc::new(DataBlock::new("s", feat_size, Dtype::F32));
        let pi = Arc::new(DataBlock::new("pi_logit", action_size, Dtype::F32));
        let value = Arc::new(DataBlock::new("v", &[if logit_value { 3 } else { 1 }], Dtype::F32));

        let mut dispatcher = Dispatcher::new(dc.expect("no data channel"));

        if rnn_state_size.is_empty() {
            dispatcher.add_data_blocks(
                vec! [feat.clone()],
                vec! [pi.clone(), value.clone()]
            );
        } else {
            let rnn_state = Arc::new(DataBlock::new("rnn_state", rnn_state_size, Dtype::F32));
            let rnn_state_out = Arc::new(DataBlock::new("rnn_state_out", rnn_state_size, Dtype::F32));

            dispatcher.add_data_blocks(
                vec! [feat.clone(), rnn_state.clone()],
                vec! [pi.clone(), value.clone(), rnn_state_out.clone()]
            );

            out.rnn_state = Some(rnn_state);
            out.rnn_state_out = Some(rnn_state_out);
        }

        out.dispatcher = Some(Mutex::new(dispatcher));
        out.feat = Some(feat);
        out.pi = Some(pi);
        out.value = Some(value);
        out
    }

    fn read_value(&self, values: &[f32]) -> f32 {
        if self.logit_value {
            let mut v = values[..3].to_vec();
            softmax_(&mut v);

            v[0] - v[1]
        } else {
            values[0]
        }
    }

    /// Evaluate a single state through the data channel. Termination or a
    /// missing slot degrades to the random-rollout value and a uniform
    /// policy.
    ///
    /// # Arguments
    ///
    /// * `state` -
    ///
    pub fn evaluate(&self, state: &dyn GameState) -> PiVal {
        // terminal states are scored by the search without a model call
        assert!(!state.terminated());

        let mut results_are_valid = false;

        if (self.use_value || self.use_policy) && self.dispatcher.is_some() {
            self.feat.as_ref().expect("no feature block")
                .set(&Tensor::from_f32(&self.feat_size, state.get_features()));

            let dispatcher = self.dispatcher.as_ref().expect("no dispatcher")
                .lock().expect("could not acquire dispatcher");

            match dispatcher.dispatch() {
                Ok(()) => results_are_valid = true,
                Err(reason) => debug!("dispatch failed: {}", reason)
            }
        }

        let value = if self.use_value && results_are_valid {
            self.read_value(self.value.as_ref().expect("no value block").snapshot().as_f32())
        } else {
            state.get_random_rollout_reward(state.current_player())
        };

        let logit_policy = if self.use_policy && results_are_valid {
            self.pi.as_ref().expect("no policy block").snapshot()
        } else {
            let mut uniform = Tensor::zeros(&self.policy_size, Dtype::F32);
            uniform.fill_f32(self.uniform_policy);
            uniform
        };

        PiVal {
            player: state.current_player(),
            value,
            logit_policy,
            rnn_state: self.rnn_state_out.as_ref().map(|block| block.snapshot())
        }
    }

    /// Batched evaluation of whole state vectors in one call. This entry
    /// point is dead; batching goes through
    /// `batch_resize`/`batch_prepare`/`batch_evaluate`/`batch_result`.
    pub fn evaluate_states(&self, _states: &[&dyn GameState]) -> Vec<PiVal> {
        unreachable!();
    }

    /// Ensure the batch buffers hold at least `n` rows.
    ///
    /// # Arguments
    ///
    /// * `n` -
    ///
    pub fn batch_resize(&self, n: usize) {
        let mut batch = self.batch.lock().expect("could not acquire batch");

        if batch.capacity < n {
            batch.feat = Tensor::zeros(&push_left(n as i64, &self.feat_size), Dtype::F32);
            batch.pi = Tensor::zeros(&push_left(n as i64, &self.policy_size), Dtype::F32);
            batch.value = Tensor::zeros(&[n as i64, if self.logit_value { 3 } else { 1 }], Dtype::F32);
            batch.capacity = n;
        }

        if !self.rnn_state_size.is_empty() {
            batch.rnn_stack.resize(n, None);
        }
    }

    /// Fill row `index` of the batch from `state`.
    ///
    /// # Arguments
    ///
    /// * `index` -
    /// * `state` -
    /// * `rnn_state` -
    ///
    pub fn batch_prepare(&self, index: usize, state: &dyn GameState, rnn_state: Option<&Tensor>) {
        if self.model_manager.is_none() {
            return;
        }

        let mut batch = self.batch.lock().expect("could not acquire batch");

        batch.feat.copy_row_from(index, &Tensor::from_f32(&self.feat_size, state.get_features()));

        if !self.use_value {
            let outputs = if self.logit_value { 3 } else { 1 };
            let mut row = Tensor::zeros(&[outputs], Dtype::F32);
            row.as_f32_mut()[0] = state.get_random_rollout_reward(state.current_player());
            batch.value.copy_row_from(index, &row);
        }

        if let Some(rnn_state) = rnn_state {
            batch.rnn_stack[index] = Some(rnn_state.clone());
        }
    }

    /// Run the model over the first `n` prepared rows, recording an
    /// exponentially smoothed batch timing.
    ///
    /// # Arguments
    ///
    /// * `n` -
    ///
    pub fn batch_evaluate(&self, n: usize) {
        let manager = match &self.model_manager {
            Some(manager) => manager,
            None => return
        };
        if !self.use_value && !self.use_policy {
            return;
        }

        let started_at = Instant::now();
        let mut batch = self.batch.lock().expect("could not acquire batch");
        let rows = (0..n).collect::<Vec<_>>();

        let feat = batch.feat.select_rows(&rows);
        let mut value = Tensor::zeros(&[n as i64, if self.logit_value { 3 } else { 1 }], Dtype::F32);
        let mut pi = Tensor::zeros(&push_left(n as i64, &self.policy_size), Dtype::F32);

        let rnn_in = if self.rnn_state_size.is_empty() {
            None
        } else {
            let stacked = (0..n)
                .map(|i| {
                    batch.rnn_stack[i].clone()
                        .unwrap_or_else(|| Tensor::zeros(&self.rnn_state_size, Dtype::F32))
                })
                .collect::<Vec<_>>();

            Some(Tensor::stack(&stacked))
        };
        let mut rnn_out = rnn_in.as_ref()
            .map(|t| Tensor::zeros(t.shape(), Dtype::F32));

        manager.batch_act(&feat, &mut value, &mut pi, rnn_in.as_ref(), rnn_out.as_mut());

        if !self.use_policy {
            pi.fill_f32(self.uniform_policy);
        }

        if self.use_value {
            batch.value.index_copy_rows(&rows, &value);
        }
        batch.pi.index_copy_rows(&rows, &pi);
        batch.rnn_out = rnn_out;

        let elapsed = started_at.elapsed().as_secs_f32();
        let mut timing = self.batch_timing.lock().expect("could not acquire timing");
        *timing = if *timing == 0.0 { elapsed } else { 0.9 * *timing + 0.1 * elapsed };
    }

    /// Read row `index` of the last evaluated batch.
    ///
    /// # Arguments
    ///
    /// * `index` -
    /// * `state` -
    ///
    pub fn batch_result(&self, index: usize, state: &dyn GameState) -> PiVal {
        if self.model_manager.is_none() {
            return self.evaluate(state);
        }

        let batch = self.batch.lock().expect("could not acquire batch");
        let value = self.read_value(&batch.value.select_row(index).as_f32());

        PiVal {
            player: state.current_player(),
            value,
            logit_policy: batch.pi.select_row(index),
            rnn_state: batch.rnn_out.as_ref().map(|t| t.select_row(index))
        }
    }

    /// The smoothed duration of a `batch_evaluate` call, in seconds.
    pub fn batch_timing(&self) -> f32 {
        *self.batch_timing.lock().expect("could not acquire timing")
    }

    /// Record that the current tournament model produced a move in the
    /// given game.
    ///
    /// # Arguments
    ///
    /// * `game_id` -
    ///
    pub fn record_move(&self, game_id: u64) {
        if let Some(manager) = &self.model_manager {
            let id = manager.tournament_model_id();
            let mut trackers = self.model_trackers.lock().expect("could not acquire trackers");

            *trackers.entry(game_id).or_default().entry(id).or_insert(0.0) += 1.0;
        }
    }

    /// Publish the outcome of a finished game, weighted by how many moves
    /// each model contributed.
    ///
    /// # Arguments
    ///
    /// * `game_id` -
    /// * `reward` -
    ///
    pub fn result(&self, game_id: u64, reward: f32) {
        if let Some(manager) = &self.model_manager {
            let tracked = self.model_trackers.lock().expect("could not acquire trackers").remove(&game_id);

            if let Some(tracked) = tracked {
                let sum: f32 = tracked.values().sum();
                let models = tracked.into_iter()
                    .map(|(id, count)| (id, count / sum.max(1.0)))
                    .collect();

                manager.result(reward, models);
            }
        }
    }

    /// Drop the move tracking of an abandoned game.
    ///
    /// # Arguments
    ///
    /// * `game_id` -
    ///
    pub fn forget(&self, game_id: u64) {
        self.model_trackers.lock().expect("could not acquire trackers").remove(&game_id);
    }

    pub fn model_id(&self) -> String {
        match &self.model_manager {
            Some(manager) => manager.tournament_model_id(),
            None => "dev".to_string()
        }
    }

    pub fn is_tournament_opponent(&self) -> bool {
        self.model_manager.as_ref().map(|m| m.is_tournament_opponent()).unwrap_or(false)
    }

    pub fn wants_tournament_result(&self) -> bool {
        self.model_manager.as_ref().map(|m| m.wants_tournament_result()).unwrap_or(false)
    }

    pub fn rnn_state_size(&self) -> &[i64] {
        &self.rnn_state_size
    }

    pub fn rnn_seqlen(&self) -> usize {
        self.rnn_seqlen
    }

    pub fn v_outputs(&self) -> usize {
        if self.logit_value { 3 } else { 1 }
    }

    /// Suggested number of concurrent games for this actor, `0` when there
    /// is no model to bound.
    ///
    /// # Arguments
    ///
    /// * `state` -
    ///
    pub fn find_batch_size(&self, state: &dyn GameState) -> usize {
        match &self.model_manager {
            Some(manager) => manager.find_batch_size(&state.get_feature_size()),
            None => 0
        }
    }

    pub fn terminate(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.lock().expect("could not acquire dispatcher").terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_games::MnkState;

    fn random_actor() -> Actor {
        Actor::new(None, &[2, 3, 3], &[1, 3, 3], &[], 0, false, false, false, None)
    }

    #[test]
    fn degraded_evaluate_is_uniform() {
        let actor = random_actor();
        let mut state = MnkState::tictactoe();
        state.initialize();

        let pival = actor.evaluate(&state);

        assert_eq!(pival.player, 0);
        assert!(pival.value >= -1.0 && pival.value <= 1.0);
        assert!(pival.logit_policy.as_f32().iter().all(|&v| v == 1.0 / 9.0));
        assert!(pival.rnn_state.is_none());
    }

    #[test]
    fn batch_result_without_manager_falls_back() {
        let actor = random_actor();
        let mut state = MnkState::tictactoe();
        state.initialize();

        actor.batch_resize(4);
        actor.batch_prepare(0, &state, None);
        actor.batch_evaluate(1);
        let pival = actor.batch_result(0, &state);

        assert_eq!(pival.logit_policy.shape(), &[1, 3, 3]);
    }

    #[test]
    #[should_panic]
    fn terminal_states_are_rejected() {
        let actor = random_actor();
        let mut state = MnkState::tictactoe();
        state.initialize();

        while !state.terminated() {
            state.forward(0);
        }

        actor.evaluate(&state);
    }
}
