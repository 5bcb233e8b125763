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

use rand::{thread_rng, Rng};

use pz_utils::rng::Xoshiro256;

/// One legal move. `x` is the policy plane, `y` and `z` the cell; several
/// actions may map to the same `(x, y, z)` location. `index` is the
/// position of the action in the legal-actions list of the state it
/// belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub index: i64,
    pub hash: u64
}

impl Action {
    pub fn new(index: i64, x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z, index, hash: 0 }
    }

    pub fn with_hash(mut self, hash: u64) -> Self {
        self.hash = hash;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameStatus {
    Player0Turn,
    Player1Turn,
    Tie,
    Player0Win,
    Player1Win
}

/// The bookkeeping every game carries: the per-state RNG, the move history,
/// and the RNG snapshot taken before each move so that stochastic games
/// replay identically.
#[derive(Clone)]
pub struct BaseState {
    pub rng: Xoshiro256,
    pub forced_dice: i64,
    pub moves: Vec<usize>,
    pub move_rngs: Vec<(Xoshiro256, i64)>
}

impl BaseState {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Xoshiro256::new(seed),
            forced_dice: -1,
            moves: Vec::new(),
            move_rngs: Vec::new()
        }
    }
}

/// The capability set the self-play core consumes. Concrete games implement
/// the required methods and inherit the history/replay machinery from the
/// provided ones.
pub trait GameState: Send + Sync {
    fn base(&self) -> &BaseState;
    fn base_mut(&mut self) -> &mut BaseState;

    /// One-time setup after construction.
    fn initialize(&mut self);

    /// Reset the board to the starting position, keeping the RNG.
    fn reset(&mut self);

    fn clone_dyn(&self) -> Box<dyn GameState>;

    fn status(&self) -> GameStatus;

    /// The legal actions of the current position; empty iff terminal.
    fn legal_actions(&self) -> &[Action];

    /// Apply a legal action to the board. Used by `forward`, which also
    /// maintains the move history.
    fn apply_action(&mut self, action: &Action);

    /// The input planes of the neural network, `C * H * W` values.
    fn get_features(&self) -> Vec<f32>;

    fn get_feature_size(&self) -> Vec<i64>;

    /// A compact board encoding used for end-state prediction targets.
    /// Defaults to the full features.
    fn get_raw_features(&self) -> Vec<f32> {
        self.get_features()
    }

    fn get_raw_feature_size(&self) -> Vec<i64> {
        self.get_feature_size()
    }

    /// The shape of the policy output, `[planes, H, W]`.
    fn get_action_size(&self) -> Vec<i64>;

    fn get_reward(&self, player: usize) -> f32 {
        assert!(player < 2);

        match self.status() {
            GameStatus::Player0Win => if player == 0 { 1.0 } else { -1.0 },
            GameStatus::Player1Win => if player == 1 { 1.0 } else { -1.0 },
            _ => 0.0
        }
    }

    fn action_description(&self, action: &Action) -> String {
        format!("{}", action.index)
    }

    fn parse_action(&self, text: &str) -> Option<usize> {
        self.legal_actions().iter()
            .position(|action| self.action_description(action) == text)
    }

    /// A printable rendering of the position.
    fn description(&self) -> String {
        let sizes = self.get_feature_size();
        let feats = self.get_features();
        let mut out = String::new();

        if sizes[0] == 2 && feats.iter().all(|&v| v == 0.0 || v == 1.0) {
            let offset = (sizes[1] * sizes[2]) as usize;
            let mut index = 0;

            for _ in 0..sizes[1] {
                for z in 0..sizes[2] {
                    if z != 0 {
                        out.push('|');
                    }
                    out.push(match (feats[index] != 0.0, feats[offset + index] != 0.0) {
                        (true, true) => '!',
                        (true, false) => 'x',
                        (false, true) => 'o',
                        (false, false) => ' '
                    });
                    index += 1;
                }
                out.push('\n');
            }

            return out;
        }

        let mut index = 0;
        for c in 0..sizes[0] {
            out.push_str(&format!("Channel {}:\n", c));
            for _ in 0..sizes[1] {
                for z in 0..sizes[2] {
                    if z != 0 {
                        out.push(' ');
                    }
                    out.push_str(&format!("{}", feats[index]));
                    index += 1;
                }
                out.push('\n');
            }
        }

        out
    }

    fn is_stochastic(&self) -> bool {
        false
    }

    /// Re-draw any hidden chance outcome. Only meaningful for stochastic
    /// games.
    fn stochastic_reset(&mut self) { }

    /// A game-forced action (e.g. a singular legal reply), if any.
    fn override_action(&self) -> Option<usize> {
        None
    }

    // ----- provided methods -----

    fn set_seed(&mut self, seed: u64) {
        self.base_mut().rng = Xoshiro256::new(seed);
    }

    fn new_game(&mut self, seed: u64) {
        self.set_seed(seed);
        let base = self.base_mut();
        base.moves.clear();
        base.move_rngs.clear();
        base.forced_dice = -1;
        self.reset();
    }

    fn current_player(&self) -> usize {
        match self.status() {
            GameStatus::Player0Turn | GameStatus::Player0Win => 0,
            GameStatus::Player1Turn | GameStatus::Player1Win => 1,
            GameStatus::Tie => 0
        }
    }

    fn terminated(&self) -> bool {
        matches!(self.status(), GameStatus::Tie | GameStatus::Player0Win | GameStatus::Player1Win)
    }

    fn get_step_idx(&self) -> usize {
        self.base().moves.len()
    }

    fn get_moves(&self) -> Vec<usize> {
        self.base().moves.clone()
    }

    /// Play the action at the given index of the legal-actions list,
    /// recording the move and the RNG snapshot needed to replay it.
    ///
    /// # Arguments
    ///
    /// * `action_index` -
    ///
    fn forward(&mut self, action_index: usize) -> bool {
        let action = match self.legal_actions().get(action_index) {
            Some(action) => *action,
            None => panic!(
                "action {} out of range ({} legal actions)",
                action_index, self.legal_actions().len()
            )
        };

        let snapshot = (self.base().rng.clone(), self.base().forced_dice);
        self.apply_action(&action);

        let base = self.base_mut();
        base.moves.push(action_index);
        base.move_rngs.push(snapshot);

        true
    }

    /// The move history rendered as action descriptions, by replaying from
    /// the starting position with the recorded RNG snapshots.
    fn history(&self) -> String {
        let mut replay = self.clone_dyn();
        let moves = self.base().moves.clone();
        let rngs = self.base().move_rngs.clone();
        let mut out = String::new();

        replay.base_mut().moves.clear();
        replay.base_mut().move_rngs.clear();
        replay.reset();

        for (i, &action_index) in moves.iter().enumerate() {
            if !out.is_empty() {
                out.push(' ');
            }
            let action = replay.legal_actions()[action_index];
            out.push_str(&replay.action_description(&action));

            let (rng, forced_dice) = rngs[i].clone();
            replay.base_mut().rng = rng;
            replay.base_mut().forced_dice = forced_dice;
            replay.forward(action_index);
        }

        out
    }

    fn do_random_action(&mut self) {
        let n = self.legal_actions().len();
        assert!(n > 0, "no legal actions in a non-terminal state");

        let choice = thread_rng().gen_range(0..n);
        self.forward(choice);
    }

    /// The reward of the given player averaged over ten uniformly random
    /// playouts from this position.
    ///
    /// # Arguments
    ///
    /// * `player` -
    ///
    fn get_random_rollout_reward(&self, player: usize) -> f32 {
        const NUM_SIMULATION: usize = 10;

        let mut sum_reward = 0.0;
        for _ in 0..NUM_SIMULATION {
            let mut cloned = self.clone_dyn();

            while !cloned.terminated() {
                cloned.do_random_action();
            }

            sum_reward += cloned.get_reward(player);
        }

        sum_reward / NUM_SIMULATION as f32
    }
}

impl Clone for Box<dyn GameState> {
    fn clone(&self) -> Self {
        self.clone_dyn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_accessors() {
        let action = Action::new(3, 0, 1, 2).with_hash(42);

        assert_eq!(action.index, 3);
        assert_eq!((action.x, action.y, action.z), (0, 1, 2));
        assert_eq!(action.hash, 42);
    }
}
