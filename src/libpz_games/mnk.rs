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

use rand::RngCore;

use pz_utils::rng::Xoshiro256;

use crate::state::{Action, BaseState, GameState, GameStatus};

const MAX_BOARD: usize = 19;

lazy_static! {
    /// Zobrist keys for every `(cell, player)` pair of the largest
    /// supported board.
    static ref ZOBRIST: [[u64; 2]; MAX_BOARD * MAX_BOARD] = {
        let mut rng = Xoshiro256::new(0x6d6e6b);
        let mut out = [[0; 2]; MAX_BOARD * MAX_BOARD];

        for cell in out.iter_mut() {
            cell[0] = rng.next_u64();
            cell[1] = rng.next_u64();
        }

        out
    };
}

/// An m,n,k-game: two players alternate placing stones on a `w` by `h`
/// board, and the first to get `k` in a row (in any direction) wins.
/// Covers tic-tac-toe (3,3,3) and free-style gomoku (15,15,5).
#[derive(Clone)]
pub struct MnkState {
    base: BaseState,
    w: usize,
    h: usize,
    k: usize,
    board: Vec<i8>,
    status: GameStatus,
    legal: Vec<Action>,
    hash: u64
}

impl MnkState {
    pub fn new(w: usize, h: usize, k: usize) -> Self {
        assert!(w <= MAX_BOARD && h <= MAX_BOARD);
        assert!(k <= w.max(h));

        Self {
            base: BaseState::new(0),
            w,
            h,
            k,
            board: vec! [-1; w * h],
            status: GameStatus::Player0Turn,
            legal: Vec::new(),
            hash: 0
        }
    }

    pub fn tictactoe() -> Self {
        Self::new(3, 3, 3)
    }

    pub fn freestyle_gomoku() -> Self {
        Self::new(15, 15, 5)
    }

    fn rebuild_legal_actions(&mut self) {
        self.legal.clear();

        if matches!(self.status, GameStatus::Player0Turn | GameStatus::Player1Turn) {
            let player = if self.status == GameStatus::Player0Turn { 0 } else { 1 };

            for cell in 0..self.board.len() {
                if self.board[cell] == -1 {
                    let y = (cell / self.w) as i64;
                    let z = (cell % self.w) as i64;

                    self.legal.push(
                        Action::new(self.legal.len() as i64, 0, y, z)
                            .with_hash(ZOBRIST[cell][player])
                    );
                }
            }
        }
    }

    /// Returns true if the stone just placed at `(y, z)` completes a row of
    /// `k`.
    fn wins_at(&self, y: usize, z: usize) -> bool {
        let player = self.board[y * self.w + z];
        assert!(player >= 0);

        for &(dy, dz) in &[(0i64, 1i64), (1, 0), (1, 1), (1, -1)] {
            let mut count = 1;

            for dir in &[1i64, -1] {
                let mut yy = y as i64 + dy * dir;
                let mut zz = z as i64 + dz * dir;

                while yy >= 0 && yy < self.h as i64 && zz >= 0 && zz < self.w as i64
                    && self.board[yy as usize * self.w + zz as usize] == player
                {
                    count += 1;
                    yy += dy * dir;
                    zz += dz * dir;
                }
            }

            if count >= self.k {
                return true;
            }
        }

        false
    }
}

impl GameState for MnkState {
    fn base(&self) -> &BaseState {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseState {
        &mut self.base
    }

    fn initialize(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.board.iter_mut().for_each(|cell| *cell = -1);
        self.status = GameStatus::Player0Turn;
        self.hash = 0;
        self.rebuild_legal_actions();
    }

    fn clone_dyn(&self) -> Box<dyn GameState> {
        Box::new(self.clone())
    }

    fn status(&self) -> GameStatus {
        self.status
    }

    fn legal_actions(&self) -> &[Action] {
        &self.legal
    }

    fn apply_action(&mut self, action: &Action) {
        let player = self.current_player();
        let cell = action.y as usize * self.w + action.z as usize;
        assert_eq!(self.board[cell], -1, "cell ({}, {}) is occupied", action.y, action.z);

        self.board[cell] = player as i8;
        self.hash ^= ZOBRIST[cell][player];

        self.status = if self.wins_at(action.y as usize, action.z as usize) {
            if player == 0 { GameStatus::Player0Win } else { GameStatus::Player1Win }
        } else if self.board.iter().all(|&c| c != -1) {
            GameStatus::Tie
        } else if player == 0 {
            GameStatus::Player1Turn
        } else {
            GameStatus::Player0Turn
        };

        self.rebuild_legal_actions();
    }

    fn get_features(&self) -> Vec<f32> {
        let cells = self.w * self.h;
        let mut out = vec! [0.0; 2 * cells];

        for (cell, &stone) in self.board.iter().enumerate() {
            if stone == 0 {
                out[cell] = 1.0;
            } else if stone == 1 {
                out[cells + cell] = 1.0;
            }
        }

        out
    }

    fn get_feature_size(&self) -> Vec<i64> {
        vec! [2, self.h as i64, self.w as i64]
    }

    fn get_action_size(&self) -> Vec<i64> {
        vec! [1, self.h as i64, self.w as i64]
    }

    fn action_description(&self, action: &Action) -> String {
        // columns as letters, rows as one-based numbers
        let col = (b'a' + action.z as u8) as char;

        format!("{}{}", col, action.y + 1)
    }

    fn parse_action(&self, text: &str) -> Option<usize> {
        self.legal.iter()
            .position(|action| self.action_description(action).eq_ignore_ascii_case(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(state: &mut MnkState, y: i64, z: i64) {
        let index = state.legal_actions().iter()
            .position(|a| a.y == y && a.z == z)
            .expect("not a legal action");

        state.forward(index);
    }

    #[test]
    fn row_win() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        play(&mut state, 0, 0);  // x
        play(&mut state, 1, 0);  // o
        play(&mut state, 0, 1);  // x
        play(&mut state, 1, 1);  // o
        play(&mut state, 0, 2);  // x

        assert_eq!(state.status(), GameStatus::Player0Win);
        assert!(state.terminated());
        assert_eq!(state.get_reward(0), 1.0);
        assert_eq!(state.get_reward(1), -1.0);
        assert!(state.legal_actions().is_empty());
    }

    #[test]
    fn diagonal_win_for_second_player() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        play(&mut state, 0, 1);  // x
        play(&mut state, 0, 0);  // o
        play(&mut state, 0, 2);  // x
        play(&mut state, 1, 1);  // o
        play(&mut state, 2, 1);  // x
        play(&mut state, 2, 2);  // o

        assert_eq!(state.status(), GameStatus::Player1Win);
        assert_eq!(state.get_reward(1), 1.0);
    }

    #[test]
    fn tie_fills_board() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        for (y, z) in [(1, 1), (0, 0), (2, 2), (0, 2), (0, 1), (2, 1), (1, 0), (1, 2), (2, 0)] {
            play(&mut state, y, z);
        }

        assert_eq!(state.status(), GameStatus::Tie);
        assert_eq!(state.get_reward(0), 0.0);
        assert_eq!(state.get_reward(1), 0.0);
    }

    #[test]
    fn action_indices_match_positions() {
        let mut state = MnkState::tictactoe();
        state.initialize();
        state.forward(4);

        for (i, action) in state.legal_actions().iter().enumerate() {
            assert_eq!(action.index as usize, i);
        }
        assert_eq!(state.legal_actions().len(), 8);
        assert_eq!(state.current_player(), 1);
    }

    #[test]
    fn history_replays_descriptions() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        play(&mut state, 0, 0);
        play(&mut state, 1, 1);

        assert_eq!(state.history(), "a1 b2");
        assert_eq!(state.get_step_idx(), 2);
    }

    #[test]
    fn features_mark_stones() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        play(&mut state, 0, 0);
        play(&mut state, 2, 2);

        let feats = state.get_features();
        assert_eq!(feats[0], 1.0);       // x at a1, channel 0
        assert_eq!(feats[9 + 8], 1.0);   // o at c3, channel 1
        assert_eq!(feats.iter().sum::<f32>(), 2.0);
    }

    #[test]
    fn random_rollout_reward_is_bounded() {
        let mut state = MnkState::tictactoe();
        state.initialize();

        let reward = state.get_random_rollout_reward(0);
        assert!(reward >= -1.0 && reward <= 1.0);
    }
}
