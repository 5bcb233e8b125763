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

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info};

use pz_games::GameState;
use pz_mcts::policy::{legal_pi, softmax_};
use pz_tensor::{DataBlock, Dtype, EpisodicTrajectory, Tensor};
use pz_tube::{DataChannel, Dispatcher, EnvThread, StatsHandle, Terminate};
use pz_utils::Stats;

use crate::executor;
use crate::players::Player;

/// One self-play (or eval) environment thread: owns the authoritative game
/// prototype, the seats, and the per-seat training trajectories with their
/// train-channel dispatchers.
pub struct GameRunner {
    pub num_episode: i64,
    pub eval_mode: bool,
    pub per_thread_batch_size: isize,
    pub max_rewinds: usize,
    pub predict_end_state: bool,
    pub predict_n_states: usize,
    pub seed: u64,

    pub(crate) state: Option<Box<dyn GameState>>,
    pub(crate) players: Vec<Arc<Player>>,
    pub(crate) player_names: Vec<String>,
    pub(crate) player_shadows: Vec<Option<Box<dyn GameState>>>,

    pub(crate) feature: Vec<EpisodicTrajectory>,
    pub(crate) rnn_initial_state: Vec<EpisodicTrajectory>,
    pub(crate) rnn_state_mask: Vec<EpisodicTrajectory>,
    pub(crate) pi: Vec<EpisodicTrajectory>,
    pub(crate) pi_mask: Vec<EpisodicTrajectory>,
    pub(crate) action_pi: Vec<EpisodicTrajectory>,
    pub(crate) v: Vec<EpisodicTrajectory>,
    pub(crate) pred_v: Vec<EpisodicTrajectory>,
    pub(crate) predict_pi: Vec<EpisodicTrajectory>,
    pub(crate) predict_pi_mask: Vec<EpisodicTrajectory>,
    pub(crate) dispatchers: Vec<Option<Dispatcher>>,

    channels: Vec<Arc<DataChannel>>,
    terminate: Terminate,
    stats: StatsHandle,
    result: Mutex<Vec<f32>>
}

impl GameRunner {
    /// Create a runner for the named game.
    ///
    /// # Arguments
    ///
    /// * `game_name` -
    /// * `num_episode` - `-1` for unlimited
    /// * `eval_mode` -
    /// * `per_thread_batch_size` - concurrent games; negative asks the
    ///   actors for a suggestion
    /// * `max_rewinds` -
    /// * `predict_end_state` / `predict_n_states` -
    /// * `seed` -
    ///
    pub fn new(
        game_name: &str,
        num_episode: i64,
        eval_mode: bool,
        per_thread_batch_size: isize,
        max_rewinds: usize,
        predict_end_state: bool,
        predict_n_states: usize,
        seed: u64
    ) -> Self {
        let state = pz_games::new_state(game_name, seed)
            .unwrap_or_else(|| panic!("unknown game '{}'", game_name));

        Self {
            num_episode,
            eval_mode,
            per_thread_batch_size,
            max_rewinds,
            predict_end_state,
            predict_n_states,
            seed,
            state: Some(state),
            players: Vec::new(),
            player_names: Vec::new(),
            player_shadows: Vec::new(),
            feature: Vec::new(),
            rnn_initial_state: Vec::new(),
            rnn_state_mask: Vec::new(),
            pi: Vec::new(),
            pi_mask: Vec::new(),
            action_pi: Vec::new(),
            v: Vec::new(),
            pred_v: Vec::new(),
            predict_pi: Vec::new(),
            predict_pi_mask: Vec::new(),
            dispatchers: Vec::new(),
            channels: Vec::new(),
            terminate: Terminate::new(),
            stats: Arc::new(Mutex::new(Stats::new())),
            result: Mutex::new(Vec::new())
        }
    }

    /// Seat a player. Trajectories follow the shapes of the game and the
    /// player's model; `dc` is the train channel the finished trajectories
    /// are shipped through (None in eval mode), and `shadow` an alternative
    /// game implementation this seat plays in.
    ///
    /// # Arguments
    ///
    /// * `name` - `dev` marks the training player
    /// * `player` -
    /// * `dc` -
    /// * `shadow` -
    ///
    pub fn add_player(
        &mut self,
        name: &str,
        player: Arc<Player>,
        dc: Option<Arc<DataChannel>>,
        shadow: Option<Box<dyn GameState>>
    ) {
        let state = self.state.as_ref().expect("the game state was already taken");
        let seqlen = player.rnn_seqlen();
        let add_seq = |shape: &[i64]| {
            if seqlen > 0 {
                let mut out = Vec::with_capacity(shape.len() + 1);
                out.push(seqlen as i64);
                out.extend_from_slice(shape);
                out
            } else {
                shape.to_vec()
            }
        };

        let v_outputs = player.v_outputs() as i64;
        let feature_size = state.get_feature_size();
        let action_size = state.get_action_size();

        let feat = EpisodicTrajectory::new("s", &add_seq(&feature_size), Dtype::F32);
        let rnn_initial_state = EpisodicTrajectory::new("rnn_initial_state", &player.rnn_state_size(), Dtype::F32);
        let rnn_state_mask = EpisodicTrajectory::new("rnn_state_mask", &add_seq(&[1]), Dtype::F32);
        let pi = EpisodicTrajectory::new("pi", &add_seq(&action_size), Dtype::F32);
        let pi_mask = EpisodicTrajectory::new("pi_mask", &add_seq(&action_size), Dtype::F32);
        let action_pi = EpisodicTrajectory::new("action_pi", &add_seq(&action_size), Dtype::F32);
        let v = EpisodicTrajectory::new("v", &add_seq(&[v_outputs]), Dtype::F32);
        let pred_v = EpisodicTrajectory::new("pred_v", &add_seq(&[v_outputs]), Dtype::F32);

        let predicts = (if self.predict_end_state { 2 } else { 0 }) + self.predict_n_states;
        let mut predict_size = state.get_raw_feature_size();
        predict_size[0] *= predicts as i64;
        let predict_pi = EpisodicTrajectory::new("predict_pi", &add_seq(&predict_size), Dtype::F32);
        let predict_pi_mask = EpisodicTrajectory::new("predict_pi_mask", &add_seq(&predict_size), Dtype::F32);

        let dispatcher = dc.map(|dc| {
            let mut dispatcher = Dispatcher::new(dc.clone());
            let mut send: Vec<Arc<DataBlock>> = vec! [
                feat.buffer.clone(),
                pi.buffer.clone(),
                pi_mask.buffer.clone(),
                v.buffer.clone(),
                pred_v.buffer.clone()
            ];

            if predicts > 0 {
                send.push(predict_pi.buffer.clone());
                send.push(predict_pi_mask.buffer.clone());
            }
            if seqlen > 0 {
                send.push(rnn_initial_state.buffer.clone());
                send.push(rnn_state_mask.buffer.clone());
            }
            if player.as_forward().is_some() {
                send.push(action_pi.buffer.clone());
            }

            dispatcher.add_data_blocks(send, vec! []);
            self.channels.push(dc);
            dispatcher
        });

        self.players.push(player);
        self.player_names.push(name.to_string());
        self.player_shadows.push(shadow);
        self.feature.push(feat);
        self.rnn_initial_state.push(rnn_initial_state);
        self.rnn_state_mask.push(rnn_state_mask);
        self.pi.push(pi);
        self.pi_mask.push(pi_mask);
        self.action_pi.push(action_pi);
        self.v.push(v);
        self.pred_v.push(pred_v);
        self.predict_pi.push(predict_pi);
        self.predict_pi_mask.push(predict_pi_mask);
        self.dispatchers.push(dispatcher);
        self.result.lock().expect("could not acquire result").push(0.0);
    }

    pub fn results(&self) -> Vec<f32> {
        self.result.lock().expect("could not acquire result").clone()
    }

    pub(crate) fn record_stat(&self, name: &str, value: f64) {
        self.stats.lock().expect("could not acquire stats").record(name, value);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminate.is_set()
    }

    /// Move the next buffered step of every trajectory of `player_id` into
    /// the send buffers. Returns false once the trajectories are drained;
    /// panics if they disagree about their length.
    ///
    /// # Arguments
    ///
    /// * `player_id` -
    ///
    pub(crate) fn prepare_for_send(&mut self, player_id: usize) -> bool {
        let predicts = (if self.predict_end_state { 2 } else { 0 }) + self.predict_n_states;
        let has_rnn = self.players[player_id].rnn_seqlen() > 0;
        let is_forward = self.players[player_id].as_forward().is_some();

        if self.feature[player_id].prepare_for_send() {
            let mut ok = self.pi[player_id].prepare_for_send();
            ok &= self.pi_mask[player_id].prepare_for_send();
            if is_forward {
                ok &= self.action_pi[player_id].prepare_for_send();
            }
            ok &= self.v[player_id].prepare_for_send();
            ok &= self.pred_v[player_id].prepare_for_send();
            if predicts > 0 {
                ok &= self.predict_pi[player_id].prepare_for_send();
                ok &= self.predict_pi_mask[player_id].prepare_for_send();
            }
            if has_rnn {
                ok &= self.rnn_initial_state[player_id].prepare_for_send();
                ok &= self.rnn_state_mask[player_id].prepare_for_send();
            }

            assert!(ok, "trajectory length mismatch for player {}", player_id);
            return true;
        }

        let mut any = self.pi[player_id].prepare_for_send();
        any |= self.pi_mask[player_id].prepare_for_send();
        any |= self.v[player_id].prepare_for_send();
        any |= self.pred_v[player_id].prepare_for_send();
        if is_forward {
            any |= self.action_pi[player_id].prepare_for_send();
        }
        if predicts > 0 {
            any |= self.predict_pi[player_id].prepare_for_send();
            any |= self.predict_pi_mask[player_id].prepare_for_send();
        }
        if has_rnn {
            any |= self.rnn_initial_state[player_id].prepare_for_send();
            any |= self.rnn_state_mask[player_id].prepare_for_send();
        }

        assert!(!any, "trajectory length mismatch for player {}", player_id);
        false
    }

    /// Ship every fully buffered trajectory step to the train channel,
    /// without waiting for replies. Channel errors drop the data and keep
    /// the games running.
    pub(crate) fn send_trajectory(&mut self) {
        for player_id in 0..self.players.len() {
            if self.dispatchers[player_id].is_none() {
                continue;
            }

            while self.prepare_for_send(player_id) {
                let dispatcher = self.dispatchers[player_id].as_ref().expect("no dispatcher");

                if let Err(reason) = dispatcher.dispatch_no_reply() {
                    debug!("could not ship trajectory for player {}: {}", player_id, reason);
                }
            }
        }
    }

    /// Replay the game back by `plies` moves, restoring the per-move RNG
    /// snapshots.
    ///
    /// # Arguments
    ///
    /// * `state` -
    /// * `plies` -
    ///
    fn undo_moves(state: &mut Box<dyn GameState>, plies: usize) {
        let moves = state.get_moves();
        let rngs = state.base().move_rngs.clone();
        let keep = moves.len().saturating_sub(plies);

        state.base_mut().moves.clear();
        state.base_mut().move_rngs.clear();
        state.reset();

        for i in 0..keep {
            let (rng, forced_dice) = rngs[i].clone();
            state.base_mut().rng = rng;
            state.base_mut().forced_dice = forced_dice;
            state.forward(moves[i]);
        }
    }

    fn human_step(&self, state: &mut Box<dyn GameState>, last_action: &mut String) {
        println!("\n{}", state.description());
        if !last_action.is_empty() {
            println!("Last action: {}", last_action);
        }
        println!("History: {}", state.history());

        let stdin = io::stdin();
        loop {
            print!("Enter a move ('u' undoes your previous move): ");
            io::stdout().flush().ok();

            let mut line = String::new();
            if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
                // stdin is closed; concede by random move so the game ends
                state.do_random_action();
                return;
            }
            let text = line.trim();

            if text == "u" || text == "undo" {
                Self::undo_moves(state, 2);
                println!("\n{}", state.description());
                continue;
            }

            match state.parse_action(text) {
                Some(index) => {
                    let action = state.legal_actions()[index];
                    *last_action = state.action_description(&action);
                    state.forward(index);
                    return;
                },
                None => println!("invalid move '{}'", text)
            }
        }
    }

    /// Play one move of the eval game.
    fn eval_step(
        &self,
        state: &mut Box<dyn GameState>,
        last_action: &mut String,
        rnn_states: &mut [Option<Tensor>]
    ) {
        let player_idx = state.current_player();
        let player = self.players[player_idx].clone();
        let any_human = self.players.iter().any(|p| p.is_human());
        let started_at = Instant::now();

        match &*player {
            Player::Human(_) => {
                self.human_step(state, last_action);
            },
            Player::Mcts(mcts) => {
                let rnn_shape = mcts.actor().rnn_state_size().to_vec();
                let rnn_in = if rnn_shape.is_empty() {
                    None
                } else {
                    Some(rnn_states[player_idx].clone().unwrap_or_else(|| Tensor::zeros(&rnn_shape, Dtype::F32)))
                };

                let result = mcts
                    .act_mcts(&[state.as_ref()], &[rnn_in], &mut [])
                    .pop()
                    .expect("no search result");
                rnn_states[player_idx] = result.rnn_state.clone();

                let action = state.legal_actions()[result.best_action as usize];
                *last_action = state.action_description(&action);
                if any_human {
                    println!("Performing action {} (value {:.3})", last_action, result.root_value);
                }

                state.forward(result.best_action as usize);
            },
            Player::Forward(forward) => {
                forward.batch_resize(1);
                forward.batch_prepare(0, state.as_ref(), rnn_states[player_idx].as_ref());
                forward.batch_evaluate(1);
                let pival = forward.batch_result(0, state.as_ref());
                rnn_states[player_idx] = pival.rnn_state.clone();

                let mut logits = pival.logit_policy.clone();
                let mut pi = legal_pi(state.as_ref(), &mut logits);
                softmax_(&mut pi);

                let best = pi.iter().enumerate()
                    .max_by(|a, b| a.1.partial_cmp(b.1).expect("policy is NaN"))
                    .map(|(i, _)| i)
                    .expect("no legal actions");
                let best = state.override_action().unwrap_or(best);

                let action = state.legal_actions()[best];
                *last_action = state.action_description(&action);
                state.forward(best);
            }
        }

        self.record_stat("Move Duration (seconds)", started_at.elapsed().as_secs_f64());
    }

    /// Eval mode: a single game, with the models warmed up before the
    /// clock starts.
    fn eval_loop(&mut self) {
        let mut state = self.state.take().expect("the game state was already taken");
        state.new_game(self.seed);

        for player in &self.players {
            if let Player::Mcts(mcts) = &**player {
                if !state.terminated() {
                    let actor = mcts.actor();

                    actor.batch_resize(1);
                    actor.batch_prepare(0, state.as_ref(), None);
                    actor.batch_evaluate(1);
                    let _ = actor.batch_result(0, state.as_ref());
                }
            }
        }

        let mut last_action = String::new();
        let mut rnn_states = vec! [None; self.players.len()];
        let started_at = Instant::now();

        while !state.terminated() && !self.terminate.is_set() {
            self.eval_step(&mut state, &mut last_action, &mut rnn_states);
        }

        {
            let mut result = self.result.lock().expect("could not acquire result");

            for player_idx in 0..self.players.len() {
                result[player_idx] = state.get_reward(player_idx);
            }
        }

        self.record_stat("Game Duration (steps)", state.get_step_idx() as f64);
        self.record_stat("Game Duration (seconds)", started_at.elapsed().as_secs_f64());
        info!("eval game over: {}", state.history());
    }
}

impl EnvThread for GameRunner {
    fn main_loop(&mut self) {
        if self.eval_mode {
            self.eval_loop();
        } else {
            executor::run(self);
        }
    }

    fn terminate(&self) -> Terminate {
        self.terminate.clone()
    }

    fn terminator(&self) -> Box<dyn Fn() + Send + Sync> {
        let channels = self.channels.clone();
        let players = self.players.clone();

        Box::new(move || {
            for channel in &channels {
                channel.terminate();
            }
            for player in &players {
                player.terminate();
            }
        })
    }

    fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_mcts::{Actor, MctsOption, MctsPlayer};

    fn random_mcts_player(rollouts: usize) -> Arc<Player> {
        let actor = Arc::new(Actor::new(None, &[2, 3, 3], &[1, 3, 3], &[], 0, false, false, false, None));
        let option = MctsOption {
            puct: 1.5,
            num_rollout_per_thread: rollouts,
            ..MctsOption::default()
        };

        Arc::new(Player::Mcts(MctsPlayer::new(option, actor)))
    }

    #[test]
    fn eval_game_runs_to_completion() {
        let mut runner = GameRunner::new("TicTacToe", 1, true, 1, 0, false, 0, 1);
        runner.add_player("dev", random_mcts_player(20), None, None);
        runner.add_player("opponent", random_mcts_player(20), None, None);

        runner.main_loop();

        let results = runner.results();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| *r >= -1.0 && *r <= 1.0));
        // zero-sum
        assert_eq!(results[0] + results[1], 0.0);
    }

    #[test]
    fn undo_restores_position() {
        let mut state = pz_games::new_state("TicTacToe", 1).unwrap();
        state.forward(0);
        state.forward(0);
        state.forward(0);

        GameRunner::undo_moves(&mut state, 2);
        assert_eq!(state.get_step_idx(), 1);
        assert_eq!(state.legal_actions().len(), 8);
    }
}
