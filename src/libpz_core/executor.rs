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

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use rand::{Rng, RngCore};

use pz_games::GameState;
use pz_mcts::policy::{legal_pi, softmax_};
use pz_mcts::PiVal;
use pz_tensor::{Dtype, EpisodicTrajectory, Tensor};
use pz_utils::rng::Xoshiro256;
use pz_utils::threads::parallel_for;

use crate::runner::GameRunner;
use crate::utils::{
    action_one_hot, feature_tensor, gae_rewards, policy_in_tensor, policy_mask_tensor,
    raw_feature_tensor
};

const RESIGN_THRESHOLD: f32 = 0.95;
const RESIGN_MOVES: i32 = 7;

struct MoveHistory {
    turn: usize,
    action: i64,
    value: f32,
    featurized: bool,
    short_feat: Tensor
}

#[derive(Default)]
struct Sequence {
    feat: Vec<Tensor>,
    v: Vec<Tensor>,
    pi: Vec<Tensor>,
    pi_mask: Vec<Tensor>,
    action_pi: Vec<Tensor>,
    pred_v: Vec<Tensor>,
    rnn_state_mask: Vec<Tensor>,
    predict_pi: Vec<Tensor>,
    predict_pi_mask: Vec<Tensor>
}

/// One in-flight game: the authoritative state, per-seat shadow states,
/// the seat permutation, and the per-seat training accumulators.
struct GameInstance {
    id: u64,
    seed: u64,
    state: Box<dyn GameState>,
    player_state: Vec<Option<Box<dyn GameState>>>,
    players: Vec<usize>,
    players_reverse_map: Vec<usize>,

    feat: Vec<Vec<Tensor>>,
    pi: Vec<Vec<Tensor>>,
    pi_mask: Vec<Vec<Tensor>>,
    rnn_states: Vec<Vec<Tensor>>,
    action_pi: Vec<Vec<Tensor>>,
    pred_v: Vec<Vec<Tensor>>,
    reward: Vec<Vec<f32>>,

    stepindex: usize,
    started_at: Instant,
    prev_move_time: Instant,
    resign_counter: Vec<i32>,
    draw_counter: i32,
    can_resign: bool,
    resigned: i32,
    drawn: bool,
    history: Vec<MoveHistory>,
    just_rewound: bool,
    just_rewound_to_negative: bool,
    rewind_count: usize,
    rnn_state: Vec<Option<Tensor>>,
    rnn_state2: Vec<Option<Tensor>>,
    allow_random_moves: Vec<bool>,
    valid_tournament_game: bool,
    start_moves: Vec<usize>
}

struct Decision {
    best_action: i64,
    value: f32,
    rnn_state: Option<Tensor>,
    pival: Option<PiVal>,
    mcts_policy: Option<Vec<f32>>,
    save_for_training: bool
}

pub(crate) struct BatchExecutor<'a> {
    runner: &'a mut GameRunner,
    basestate: Box<dyn GameState>,
    rng: Xoshiro256,
    seqs: Vec<Sequence>,
    games: Vec<GameInstance>,
    started_game_count: i64,
    completed_game_count: i64,
    running_average_game_steps: f32,
    dev_player: usize,
    result: Vec<f32>,
    remap_player_idx: Vec<usize>,
    next_game_id: u64
}

/// Run the self-play loop of the given runner until its episodes are
/// played out or it is terminated.
pub(crate) fn run(runner: &mut GameRunner) {
    BatchExecutor::new(runner).main();
}

impl<'a> BatchExecutor<'a> {
    fn new(runner: &'a mut GameRunner) -> Self {
        let basestate = runner.state.take().expect("the game state was already taken");
        let num_players = runner.players.len();
        assert!(num_players == 1 || num_players == 2, "wrong number of players: {}", num_players);

        let dev_player = runner.player_names.iter()
            .position(|name| name == "dev")
            .expect("dev player not found");

        // players behind the same seat object act together
        let mut remap_player_idx = (0..num_players).collect::<Vec<_>>();
        for i in 0..num_players {
            for i2 in 0..i {
                if Arc::ptr_eq(&runner.players[i], &runner.players[i2]) {
                    remap_player_idx[i] = i2;
                }
            }
        }

        let rng = Xoshiro256::new(runner.seed);
        let seqs = (0..num_players).map(|_| Sequence::default()).collect();
        let result = vec! [0.0; num_players];

        Self {
            runner,
            basestate,
            rng,
            seqs,
            games: Vec::new(),
            started_game_count: 0,
            completed_game_count: 0,
            running_average_game_steps: 0.0,
            dev_player,
            result,
            remap_player_idx,
            next_game_id: 1
        }
    }

    fn randint(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n.max(1))
    }

    fn episodes_remaining(&self) -> bool {
        self.runner.num_episode < 0 || self.started_game_count < self.runner.num_episode
    }

    /// Play a random opening prefix of up to `n` moves, rolling back if it
    /// reached a terminal position.
    fn do_random_moves(&mut self, game: &mut GameInstance, n: usize) {
        let original = game.state.clone_dyn();
        let mut moves = Vec::new();

        for _ in 0..n {
            if game.state.terminated() {
                break;
            }

            let choice = self.randint(game.state.legal_actions().len());
            moves.push(choice);
            game.state.forward(choice);
        }

        if game.state.terminated() {
            game.state = original;
            moves.clear();
        } else {
            for &m in &moves {
                for shadow in game.player_state.iter_mut().flatten() {
                    shadow.forward(m);
                }
            }
        }

        game.start_moves = moves;
    }

    fn new_game(&mut self) -> GameInstance {
        self.started_game_count += 1;

        let num_players = self.runner.players.len();
        let mut players = (0..num_players).collect::<Vec<_>>();
        // shuffle the seat assignment
        for i in (1..players.len()).rev() {
            players.swap(i, self.randint(i + 1));
        }

        let mut players_reverse_map = vec! [0; num_players];
        for (slot, &player_idx) in players.iter().enumerate() {
            players_reverse_map[player_idx] = slot;
        }

        let seed = self.rng.next_u64();
        let mut state = self.basestate.clone_dyn();
        state.new_game(seed);

        let player_state = (0..num_players)
            .map(|slot| {
                self.runner.player_shadows[players[slot]].as_ref().map(|proto| {
                    let mut shadow = proto.clone_dyn();
                    shadow.new_game(seed);
                    shadow
                })
            })
            .collect::<Vec<_>>();

        let can_resign = !self.runner.eval_mode && num_players == 2 && self.randint(3) != 0;
        let allow_random_moves = (0..num_players).map(|_| self.randint(4) == 0).collect();

        let id = self.next_game_id;
        self.next_game_id += 1;

        let mut game = GameInstance {
            id,
            seed,
            state,
            player_state,
            players,
            players_reverse_map,
            feat: vec! [Vec::new(); num_players],
            pi: vec! [Vec::new(); num_players],
            pi_mask: vec! [Vec::new(); num_players],
            rnn_states: vec! [Vec::new(); num_players],
            action_pi: vec! [Vec::new(); num_players],
            pred_v: vec! [Vec::new(); num_players],
            reward: vec! [Vec::new(); num_players],
            stepindex: 0,
            started_at: Instant::now(),
            prev_move_time: Instant::now(),
            resign_counter: vec! [0; num_players],
            draw_counter: 0,
            can_resign,
            resigned: -1,
            drawn: false,
            history: Vec::new(),
            just_rewound: false,
            just_rewound_to_negative: false,
            rewind_count: 0,
            rnn_state: vec! [None; num_players],
            rnn_state2: vec! [None; num_players],
            allow_random_moves,
            valid_tournament_game: true,
            start_moves: Vec::new()
        };

        // occasionally start from a random prefix to diversify the data
        if self.randint(250) == 0 {
            let average = (self.running_average_game_steps as usize).max(1);
            let length = match self.randint(3) {
                0 => self.randint(average),
                1 => self.randint((average / 10).max(1)),
                _ => self.randint((average / 5).max(1))
            };

            self.do_random_moves(&mut game, length);
            game.valid_tournament_game = false;
        }

        game
    }

    /// Seek back to the latest move of `player_slot` where its signed value
    /// still pointed the other way, discard the accumulated data, and
    /// replay the prefix. Returns false when there is nothing to rewind to.
    fn rewind(&mut self, game_idx: usize, player_slot: usize, to_negative: bool) -> bool {
        let any_rnn = self.runner.players.iter().any(|p| p.rnn_seqlen() > 0);
        let game = &mut self.games[game_idx];

        if game.history.len() <= 2 {
            return false;
        }

        let flip = if to_negative { -1.0 } else { 1.0 };
        let mut index = game.history.len();
        while index > 0 {
            index -= 1;
            let h = &game.history[index];

            if h.turn == player_slot && h.value * flip > 0.0 {
                break;
            }
        }

        if index <= 2 {
            return false;
        }
        if any_rnn {
            debug!("cannot rewind with rnn states");
            return false;
        }

        info!("rewinding from {} to index {}", game.history.len(), index);
        game.just_rewound = true;
        game.just_rewound_to_negative = to_negative;

        game.state = self.basestate.clone_dyn();
        game.state.new_game(game.seed);

        for slot in 0..game.player_state.len() {
            if game.player_state[slot].is_some() {
                let player_idx = game.players[slot];
                let proto = self.runner.player_shadows[player_idx].as_ref().expect("no shadow prototype");
                let mut shadow = proto.clone_dyn();
                shadow.new_game(game.seed);
                game.player_state[slot] = Some(shadow);
            }
        }

        for &m in &game.start_moves {
            game.state.forward(m);
            for shadow in game.player_state.iter_mut().flatten() {
                shadow.forward(m);
            }
        }

        for slot in 0..game.players.len() {
            game.feat[slot].clear();
            game.pi[slot].clear();
            game.pi_mask[slot].clear();
            game.reward[slot].clear();
            game.action_pi[slot].clear();
            game.pred_v[slot].clear();
            game.rnn_states[slot].clear();
            game.resign_counter[slot] = 0;
        }
        game.draw_counter = 0;
        game.resigned = -1;
        game.drawn = false;

        game.history.truncate(index);
        for h in game.history.iter_mut() {
            h.featurized = false;
            game.state.forward(h.action as usize);
            for shadow in game.player_state.iter_mut().flatten() {
                shadow.forward(h.action as usize);
            }
        }

        true
    }

    fn main(&mut self) {
        let mut ngames = self.runner.per_thread_batch_size.max(1) as usize;

        if self.runner.per_thread_batch_size < 1 {
            let mut suggestion = usize::MAX;
            let mut found = 0;

            for player in self.runner.players.iter() {
                let batch_size = player.find_batch_size(self.basestate.as_ref());

                if batch_size > 0 {
                    suggestion = suggestion.min(batch_size);
                    found += 1;
                }
            }

            if found > 0 {
                info!("using batch size of {}", suggestion);
                ngames = suggestion;
            }
        }

        while self.games.len() < ngames && self.episodes_remaining() {
            let game = self.new_game();
            self.games.push(game);
        }

        while !self.games.is_empty() && !self.runner.is_terminated() {
            self.step_games();
        }
    }

    fn step_games(&mut self) {
        let num_players = self.runner.players.len();
        let dev = &self.runner.players[self.dev_player];
        let is_forward = dev.as_forward().is_some();
        let seqlen = dev.rnn_seqlen();

        // settle finished games (and mid-game emission for recurrent
        // forward players), then replenish their slots
        let mut idx = 0;
        while idx < self.games.len() {
            let completed = {
                let game = &self.games[idx];

                game.state.terminated() || game.resigned != -1 || game.drawn
            };

            if completed || (is_forward && seqlen > 0) {
                let keep_playing = self.handle_game_end(idx, completed);

                if completed && !keep_playing {
                    if self.episodes_remaining() {
                        let game = self.new_game();
                        self.games[idx] = game;
                        idx += 1;
                    } else {
                        self.games.swap_remove(idx);
                    }

                    continue;
                }
            }

            idx += 1;
        }

        if self.games.is_empty() {
            return;
        }

        // group live games by the seat to move
        let mut act = vec! [Vec::new(); num_players];

        for (i, game) in self.games.iter_mut().enumerate() {
            if game.state.terminated() || game.resigned != -1 || game.drawn {
                continue;
            }

            game.stepindex += 1;
            let slot = game.state.current_player();
            act[game.players[slot]].push(i);
        }

        // act for the seat with the largest backlog so batches stay full
        let best_player_idx = (0..num_players)
            .map(|player_idx| {
                let merged = (0..num_players)
                    .filter(|&i| self.remap_player_idx[i] == self.remap_player_idx[player_idx])
                    .map(|i| act[i].len())
                    .sum::<usize>();

                (merged, self.remap_player_idx[player_idx])
            })
            .max_by_key(|&(size, _)| size)
            .map(|(_, player_idx)| player_idx)
            .expect("no players");

        self.act_for_player(best_player_idx, &mut act);
    }

    fn act_for_player(&mut self, player_idx: usize, act: &mut Vec<Vec<usize>>) {
        let num_players = self.runner.players.len();

        // merge all identical seats so they batch together
        let mut entries = act[player_idx].drain(..)
            .map(|game_idx| (game_idx, player_idx))
            .collect::<Vec<_>>();

        for other in 0..num_players {
            if other != player_idx && self.remap_player_idx[other] == player_idx {
                entries.extend(act[other].drain(..).map(|game_idx| (game_idx, other)));
            }
        }

        if entries.is_empty() {
            return;
        }

        let n = entries.len();
        let player = self.runner.players[player_idx].clone();
        let seqlen = player.rnn_seqlen();

        // pull the recurrent state of every acting seat, recording it for
        // training when this seat plays the authoritative game
        let mut act_rnn: Vec<Option<Tensor>> = vec! [None; n];

        if seqlen > 0 {
            let shape = player.rnn_state_size();

            for (i, &(game_idx, entry_player)) in entries.iter().enumerate() {
                let game = &mut self.games[game_idx];
                let slot = game.players_reverse_map[entry_player];
                let rnn = game.rnn_state[slot].take()
                    .unwrap_or_else(|| Tensor::zeros(&shape, Dtype::F32));

                if self.runner.player_shadows[entry_player].is_none() {
                    game.rnn_states[slot].push(rnn.clone());
                }
                act_rnn[i] = Some(rnn);
            }
        }

        // evaluate: either one forward pass per state or a full search
        let mut decisions: Vec<Decision> = Vec::with_capacity(n);

        if let Some(forward) = player.as_forward() {
            forward.batch_resize(n);

            {
                let mut items = entries.iter().enumerate()
                    .map(|(i, &(game_idx, entry_player))| {
                        let game = &self.games[game_idx];
                        let slot = game.players_reverse_map[entry_player];
                        let state: &dyn GameState = match &game.player_state[slot] {
                            Some(shadow) => shadow.as_ref(),
                            None => game.state.as_ref()
                        };

                        (i, state, act_rnn[i].clone())
                    })
                    .collect::<Vec<_>>();

                parallel_for(&mut items, |_, item| {
                    let (i, state, rnn) = &*item;

                    forward.batch_prepare(*i, *state, rnn.as_ref());
                });
            }

            forward.batch_evaluate(n);

            for (i, &(game_idx, entry_player)) in entries.iter().enumerate() {
                let game = &self.games[game_idx];
                let slot = game.players_reverse_map[entry_player];
                let state: &dyn GameState = match &game.player_state[slot] {
                    Some(shadow) => shadow.as_ref(),
                    None => game.state.as_ref()
                };

                let pival = forward.batch_result(i, state);
                let mut logits = pival.logit_policy.clone();
                let mut pi = legal_pi(state, &mut logits);
                softmax_(&mut pi);

                let mut best = sample_index(&pi, &mut self.rng);
                if let Some(forced) = state.override_action() {
                    best = forced;
                }

                decisions.push(Decision {
                    best_action: best as i64,
                    value: pival.value,
                    rnn_state: pival.rnn_state.clone(),
                    pival: Some(pival),
                    mcts_policy: None,
                    save_for_training: true
                });
            }
        } else if let Some(mcts) = player.as_mcts() {
            let states = entries.iter()
                .map(|&(game_idx, entry_player)| {
                    let game = &self.games[game_idx];
                    let slot = game.players_reverse_map[entry_player];

                    match &game.player_state[slot] {
                        Some(shadow) => shadow.as_ref(),
                        None => game.state.as_ref()
                    }
                })
                .collect::<Vec<&dyn GameState>>();

            let results = mcts.act_mcts(&states, &act_rnn, &mut []);
            let option = mcts.option();

            for result in results {
                let save_for_training = !option.randomized_rollouts
                    || result.rollouts as f32 >= option.num_rollout_per_thread as f32 * 1.5;

                decisions.push(Decision {
                    best_action: result.best_action,
                    value: result.root_value,
                    rnn_state: result.rnn_state.clone(),
                    pival: None,
                    mcts_policy: Some(result.mcts_policy),
                    save_for_training
                });
            }

            // random-exploration support; random moves spoil the game for
            // tournament bookkeeping
            for (i, &(game_idx, entry_player)) in entries.iter().enumerate() {
                let game = &mut self.games[game_idx];
                let slot = game.players_reverse_map[entry_player];

                if game.allow_random_moves[slot] {
                    let step = game.state.get_step_idx() as f32;
                    let x = 4.0 / (step + 10.0).powi(2);

                    if self.rng.gen::<f32>() < x {
                        decisions[i].best_action = self.rng.gen_range(0..game.state.legal_actions().len()) as i64;
                        game.valid_tournament_game = false;
                    }
                }
            }

            let rps = mcts.rollouts_per_second();
            self.runner.record_stat("Rollouts per second", rps);
        } else {
            panic!("unknown player kind at seat {}", player_idx);
        }

        // keep a recurrent dev model in lockstep when this seat plays in a
        // different game implementation
        if self.runner.player_shadows[player_idx].is_some() {
            let dev = self.runner.players[self.dev_player].clone();

            if dev.rnn_seqlen() > 0 {
                if let Some(dev_forward) = dev.as_forward() {
                    let shape = dev.rnn_state_size();
                    let rnn_in = entries.iter()
                        .map(|&(game_idx, entry_player)| {
                            let game = &mut self.games[game_idx];
                            let slot = game.players_reverse_map[entry_player];
                            let rnn = game.rnn_state2[slot].take()
                                .unwrap_or_else(|| Tensor::zeros(&shape, Dtype::F32));

                            game.rnn_states[slot].push(rnn.clone());
                            rnn
                        })
                        .collect::<Vec<_>>();

                    let states = entries.iter()
                        .map(|&(game_idx, _)| self.games[game_idx].state.as_ref())
                        .collect::<Vec<&dyn GameState>>();
                    let next = dev_forward.next_rnn_state(&states, &rnn_in);

                    for (i, &(game_idx, entry_player)) in entries.iter().enumerate() {
                        let game = &mut self.games[game_idx];
                        let slot = game.players_reverse_map[entry_player];

                        game.rnn_state2[slot] = Some(next[i].clone());
                    }
                }
            }
        }

        // apply each decision to its game
        for (i, &(game_idx, entry_player)) in entries.iter().enumerate() {
            let decision = &decisions[i];
            self.act_result(game_idx, entry_player, decision);
        }
    }

    fn act_result(&mut self, game_idx: usize, entry_player: usize, decision: &Decision) {
        let game = &mut self.games[game_idx];
        let slot = game.players_reverse_map[entry_player];
        let best_action = decision.best_action;
        let value = decision.value;

        assert!(game.rnn_state[slot].is_none(), "the rnn state was not consumed");
        game.rnn_state[slot] = decision.rnn_state.clone();

        if game.can_resign {
            if value < -RESIGN_THRESHOLD {
                game.resign_counter[slot] += 1;

                if game.resign_counter[slot] >= RESIGN_MOVES {
                    game.resigned = slot as i32;
                }
            } else {
                game.resign_counter[slot] = 0;
            }

            let opponent = (slot + 1) % 2;
            if value > RESIGN_THRESHOLD {
                game.resign_counter[opponent] += 1;
            } else {
                game.resign_counter[opponent] = 0;
            }
        }

        if decision.save_for_training {
            game.feat[slot].push(feature_tensor(game.state.as_ref()));

            match (&decision.pival, &decision.mcts_policy) {
                (Some(pival), _) => {
                    game.action_pi[slot].push(action_one_hot(game.state.as_ref(), best_action as usize));
                    game.pi[slot].push(pival.logit_policy.clone());
                    game.pi_mask[slot].push(policy_mask_tensor(game.state.as_ref()));
                },
                (None, Some(mcts_policy)) => {
                    let (policy, policy_mask) = policy_in_tensor(game.state.as_ref(), mcts_policy);

                    game.pi[slot].push(policy);
                    game.pi_mask[slot].push(policy_mask);
                },
                (None, None) => unreachable!()
            }

            let v_outputs = self.runner.players[entry_player].v_outputs();
            let mut pred_v = Tensor::zeros(&[v_outputs as i64], Dtype::F32);
            pred_v.as_f32_mut()[0] = value;
            game.pred_v[slot].push(pred_v);

            game.reward[slot].push(game.state.get_reward(slot));
        }

        game.history.push(MoveHistory {
            turn: slot,
            action: best_action,
            value,
            featurized: decision.save_for_training,
            short_feat: raw_feature_tensor(game.state.as_ref())
        });

        if game.rewind_count == 0 {
            self.runner.players[entry_player].record_move(game.id);
        }

        game.state.forward(best_action as usize);
        for shadow in game.player_state.iter_mut().flatten() {
            shadow.forward(best_action as usize);
        }

        let now = Instant::now();
        let elapsed = now.duration_since(game.prev_move_time).as_secs_f64();
        game.prev_move_time = now;
        self.runner.record_stat("Move Duration (seconds)", elapsed);

        if self.games[game_idx].just_rewound {
            let game = &self.games[game_idx];
            let flip = if game.just_rewound_to_negative { -1.0 } else { 1.0 };

            if value * flip < 0.0 {
                // the rewound line turned sour as well, rewind further
                let to_negative = game.just_rewound_to_negative;
                self.rewind(game_idx, slot, to_negative);
            } else {
                self.games[game_idx].just_rewound = false;
            }
        }
    }

    /// Emit trajectories for a finished game (or the buffered chunk of a
    /// recurrent forward game), and decide whether the game rewinds and
    /// keeps playing. Returns true when the game continues.
    fn handle_game_end(&mut self, game_idx: usize, completed: bool) -> bool {
        let num_players = self.runner.players.len();
        let dev = self.runner.players[self.dev_player].clone();
        let is_forward = dev.as_forward().is_some();
        let seqlen = dev.rnn_seqlen();
        let dev_v_outputs = dev.v_outputs();

        if completed {
            let game = &self.games[game_idx];

            if game.rewind_count == 0 {
                self.runner.record_stat("Game Duration (steps)", game.stepindex as f64);
                self.runner.record_stat(
                    "Game Duration (seconds)",
                    game.started_at.elapsed().as_secs_f64()
                );
            }

            if game.drawn {
                for slot in 0..num_players {
                    self.result[game.players[slot]] = 0.0;
                }
            } else if game.resigned != -1 {
                for slot in 0..num_players {
                    self.result[game.players[slot]] = if slot as i32 == game.resigned { -1.0 } else { 1.0 };
                }
            } else {
                for slot in 0..num_players {
                    self.result[game.players[slot]] = game.state.get_reward(slot);
                }

                if self.rng.gen_range(0..256) == 0 {
                    info!("game ended normally: {}", game.state.history());
                }
            }

            self.running_average_game_steps =
                self.running_average_game_steps * 0.99 + game.state.get_step_idx() as f32 * 0.01;
        }

        let mut do_rewind = false;
        let mut rewind_player = 0;
        let mut rewind_to_negative = false;

        if (is_forward && seqlen > 0) || completed {
            for slot in 0..num_players {
                let dstp = self.games[game_idx].players[slot];

                if !completed {
                    let game = &mut self.games[game_idx];
                    let enough = game.pi[slot].len() >= seqlen * 16 + 1;
                    let last_is_ours = game.history.last().map(|h| h.turn == slot).unwrap_or(false);

                    if !enough || !last_is_ours {
                        continue;
                    }

                    self.result[dstp] = game.history.last().expect("no history").value;

                    game.pi[slot].pop();
                    game.pi_mask[slot].pop();
                    game.action_pi[slot].pop();
                    game.pred_v[slot].pop();
                    game.feat[slot].pop();
                    game.rnn_states[slot].pop();
                    game.reward[slot].pop();
                }

                self.emit_slot(game_idx, slot, dstp, is_forward, seqlen, dev_v_outputs);

                {
                    let game = &mut self.games[game_idx];

                    game.pi[slot].clear();
                    game.pi_mask[slot].clear();
                    game.action_pi[slot].clear();
                    game.pred_v[slot].clear();
                    game.feat[slot].clear();
                    game.rnn_states[slot].clear();
                    game.reward[slot].clear();
                    for h in game.history.iter_mut() {
                        if h.turn == slot {
                            h.featurized = false;
                        }
                    }
                }

                if completed {
                    let player = self.runner.players[dstp].clone();
                    let game = &self.games[game_idx];

                    if player.model_id() == "dev" && self.result[dstp] != 0.0 {
                        do_rewind = true;
                        rewind_player = slot;
                        rewind_to_negative = self.result[dstp] > 0.0;
                    }

                    if game.rewind_count == 0 && game.valid_tournament_game {
                        player.result(game.id, self.result[dstp]);
                    } else {
                        player.forget(game.id);
                    }
                }
            }

            self.runner.send_trajectory();

            if do_rewind {
                for slot in 0..num_players {
                    let dstp = self.games[game_idx].players[slot];

                    if self.runner.players[dstp].wants_tournament_result() {
                        do_rewind = false;
                        break;
                    }
                }
            }
        }

        if completed {
            self.completed_game_count += 1;

            let rewind_count = self.games[game_idx].rewind_count;
            if do_rewind
                && rewind_count < self.runner.max_rewinds
                && self.rewind(game_idx, rewind_player, rewind_to_negative)
            {
                self.games[game_idx].rewind_count += 1;
                return true;
            }

            return false;
        }

        true
    }

    /// Push one seat's accumulated steps into the dev trajectories,
    /// chunking into fixed-length sequences for recurrent models.
    fn emit_slot(
        &mut self,
        game_idx: usize,
        slot: usize,
        dstp: usize,
        is_forward: bool,
        seqlen: usize,
        dev_v_outputs: usize
    ) {
        let final_result = self.result[dstp];
        let slot_result = self.result[slot.min(self.result.len() - 1)];
        let game = &mut self.games[game_idx];

        let d_reward = if is_forward {
            let pred_v = game.pred_v[slot].iter()
                .map(|t| t.as_f32()[0])
                .collect::<Vec<_>>();

            gae_rewards(&game.reward[slot], &pred_v, final_result, slot_result)
        } else {
            vec! [final_result; game.feat[slot].len()]
        };

        let rewards = (0..game.feat[slot].len())
            .map(|j| {
                if dev_v_outputs == 3 {
                    Tensor::from_f32(&[3], vec! [
                        (final_result > 0.0) as i32 as f32,
                        (final_result < 0.0) as i32 as f32,
                        (final_result == 0.0) as i32 as f32
                    ])
                } else {
                    Tensor::from_f32(&[1], vec! [d_reward[j]])
                }
            })
            .collect::<Vec<_>>();

        let emits = self.runner.players[dstp].model_id() == "dev" && !game.feat[slot].is_empty();

        if emits {
            let runner = &mut *self.runner;
            let seq = &mut self.seqs[dstp];

            if seqlen > 0 {
                for n in 0..game.feat[slot].len() {
                    if (seq.feat.len() + n) % seqlen == seqlen - 1 {
                        runner.rnn_initial_state[dstp].push_back(game.rnn_states[slot][n].clone());
                    }
                }

                add_seq(game.feat[slot].drain(..).collect(), &mut seq.feat, &mut runner.feature[dstp], seqlen);
                add_seq(game.pi[slot].drain(..).collect(), &mut seq.pi, &mut runner.pi[dstp], seqlen);
                add_seq(game.pi_mask[slot].drain(..).collect(), &mut seq.pi_mask, &mut runner.pi_mask[dstp], seqlen);
                if is_forward {
                    add_seq(game.action_pi[slot].drain(..).collect(), &mut seq.action_pi, &mut runner.action_pi[dstp], seqlen);
                }
                add_seq(game.pred_v[slot].drain(..).collect(), &mut seq.pred_v, &mut runner.pred_v[dstp], seqlen);

                let mut rnn_state_mask = (0..rewards.len())
                    .map(|_| Tensor::from_f32(&[1], vec! [1.0]))
                    .collect::<Vec<_>>();
                if let Some(first) = rnn_state_mask.first_mut() {
                    first.zero_();
                }
                add_seq(rnn_state_mask, &mut seq.rnn_state_mask, &mut runner.rnn_state_mask[dstp], seqlen);
            } else {
                for v in game.feat[slot].drain(..) {
                    runner.feature[dstp].push_back(v);
                }
                for v in game.pi[slot].drain(..) {
                    runner.pi[dstp].push_back(v);
                }
                for v in game.pi_mask[slot].drain(..) {
                    runner.pi_mask[dstp].push_back(v);
                }
                if is_forward {
                    for v in game.action_pi[slot].drain(..) {
                        runner.action_pi[dstp].push_back(v);
                    }
                }
                for v in game.pred_v[slot].drain(..) {
                    runner.pred_v[dstp].push_back(v);
                }
            }

            // end-state and future-state prediction targets
            let predicts = (if runner.predict_end_state { 2 } else { 0 }) + runner.predict_n_states;
            if predicts > 0 {
                let raw_size = game.state.get_raw_feature_size();
                let mut size = Vec::with_capacity(raw_size.len() + 1);
                size.push(predicts as i64);
                size.extend_from_slice(&raw_size);

                let mut final_size = raw_size.clone();
                final_size[0] *= predicts as i64;

                let plane = raw_size.iter().product::<i64>() as usize;

                for m in 0..game.history.len() {
                    if !game.history[m].featurized || game.history[m].turn != slot {
                        continue;
                    }

                    let mut tensor = Tensor::zeros(&size, Dtype::F32);
                    let mut mask = Tensor::zeros(&size, Dtype::F32);
                    let mut offset = 0;

                    if runner.predict_end_state {
                        let last = game.history.last().expect("no history");
                        let at = if game.state.terminated() { 0 } else { 1 };

                        tensor.copy_row_from(at, &last.short_feat);
                        mask.as_f32_mut()[at*plane..(at+1)*plane].iter_mut().for_each(|v| *v = 1.0);
                        offset += 2;
                    }

                    for j in 0..runner.predict_n_states {
                        let index = m + 1 + j;

                        if index < game.history.len() {
                            tensor.copy_row_from(offset + j, &game.history[m].short_feat);
                            let at = offset + j;
                            mask.as_f32_mut()[at*plane..(at+1)*plane].iter_mut().for_each(|v| *v = 1.0);
                        }
                    }

                    let tensor = tensor.view(&final_size);
                    let mask = mask.view(&final_size);

                    if seqlen > 0 {
                        add_seq(vec! [tensor], &mut seq.predict_pi, &mut runner.predict_pi[dstp], seqlen);
                        add_seq(vec! [mask], &mut seq.predict_pi_mask, &mut runner.predict_pi_mask[dstp], seqlen);
                    } else {
                        runner.predict_pi[dstp].push_back(tensor);
                        runner.predict_pi_mask[dstp].push_back(mask);
                    }
                }
            }

            if seqlen > 0 {
                add_seq(rewards, &mut seq.v, &mut runner.v[dstp], seqlen);
            } else {
                for reward in rewards {
                    runner.v[dstp].push_back(reward);
                }
            }
        }
    }
}

/// Sample an index proportionally to the given distribution.
fn sample_index(pi: &[f32], rng: &mut Xoshiro256) -> usize {
    let sum: f32 = pi.iter().sum();
    let mut v = rng.gen_range(0.0..sum.max(1e-9));

    for (i, p) in pi.iter().enumerate() {
        v -= p;

        if v <= 0.0 {
            return i;
        }
    }

    pi.len() - 1
}

/// Append each step to the per-player chunk accumulator, flushing a full
/// stack of `seqlen` steps into the trajectory.
fn add_seq(src: Vec<Tensor>, dst: &mut Vec<Tensor>, trajectory: &mut EpisodicTrajectory, seqlen: usize) {
    for x in src {
        dst.push(x);
        assert!(dst.len() <= seqlen, "sequence accumulator overflow");

        if dst.len() == seqlen {
            trajectory.push_back(Tensor::stack(dst));
            dst.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::players::Player;
    use pz_mcts::{Actor, MctsOption, MctsPlayer};
    use pz_tube::{DataChannel, EnvThread};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn selfplay_emits_trajectories() {
        let train = Arc::new(DataChannel::new("train", 64, 100));
        let rows_seen = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let train = train.clone();
            let rows_seen = rows_seen.clone();

            thread::spawn(move || {
                while let Some(batch) = train.get_input() {
                    rows_seen.fetch_add(batch["s"].shape()[0] as usize, Ordering::AcqRel);
                    train.set_reply(&HashMap::new());
                }
            })
        };

        let actor = Arc::new(Actor::new(None, &[2, 3, 3], &[1, 3, 3], &[], 0, false, false, false, None));
        let option = MctsOption {
            puct: 1.5,
            num_rollout_per_thread: 12,
            virtual_loss: 1.0,
            ..MctsOption::default()
        };
        let player = Arc::new(Player::Mcts(MctsPlayer::new(option, actor)));

        let mut runner = crate::runner::GameRunner::new("TicTacToe", 4, false, 2, 0, false, 0, 1);
        runner.add_player("dev", player.clone(), Some(train.clone()), None);
        runner.add_player("dev", player, Some(train.clone()), None);

        runner.main_loop();

        // the games are over, so every buffered step must have shipped
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while rows_seen.load(Ordering::Acquire) < 4 {
            assert!(std::time::Instant::now() < deadline, "no trajectories arrived");
            thread::yield_now();
        }

        train.terminate();
        consumer.join().unwrap();
    }

    #[test]
    fn rewound_game_restarts_from_prefix() {
        let actor = Arc::new(Actor::new(None, &[2, 3, 3], &[1, 3, 3], &[], 0, false, false, false, None));
        let option = MctsOption {
            puct: 1.5,
            num_rollout_per_thread: 8,
            ..MctsOption::default()
        };
        let player = Arc::new(Player::Mcts(MctsPlayer::new(option, actor)));

        let mut runner = crate::runner::GameRunner::new("TicTacToe", 2, false, 1, 2, false, 0, 7);
        runner.add_player("dev", player.clone(), None, None);
        runner.add_player("dev", player, None, None);

        // max_rewinds = 2: decisive games seek back to their turning point
        // at most twice each, and the loop still drains all episodes
        runner.main_loop();
    }
}
