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

use crate::state::{Action, BaseState, GameState, GameStatus};

const WIDTH: usize = 7;
const HEIGHT: usize = 6;

/// Connect four on the standard 7 by 6 board. An action is a column; the
/// stone falls to the lowest free cell of that column.
#[derive(Clone)]
pub struct Connect4State {
    base: BaseState,
    board: Vec<i8>,
    heights: [usize; WIDTH],
    status: GameStatus,
    legal: Vec<Action>
}

impl Connect4State {
    pub fn new() -> Self {
        Self {
            base: BaseState::new(0),
            board: vec! [-1; WIDTH * HEIGHT],
            heights: [0; WIDTH],
            status: GameStatus::Player0Turn,
            legal: Vec::new()
        }
    }

    fn rebuild_legal_actions(&mut self) {
        self.legal.clear();

        if matches!(self.status, GameStatus::Player0Turn | GameStatus::Player1Turn) {
            for col in 0..WIDTH {
                if self.heights[col] < HEIGHT {
                    self.legal.push(Action::new(self.legal.len() as i64, 0, 0, col as i64));
                }
            }
        }
    }

    /// Returns true if the stone just dropped at `(row, col)` completes
    /// four in a row.
    fn wins_at(&self, row: usize, col: usize) -> bool {
        let player = self.board[row * WIDTH + col];

        for &(dy, dz) in &[(0i64, 1i64), (1, 0), (1, 1), (1, -1)] {
            let mut count = 1;

            for dir in &[1i64, -1] {
                let mut y = row as i64 + dy * dir;
                let mut z = col as i64 + dz * dir;

                while y >= 0 && y < HEIGHT as i64 && z >= 0 && z < WIDTH as i64
                    && self.board[y as usize * WIDTH + z as usize] == player
                {
                    count += 1;
                    y += dy * dir;
                    z += dz * dir;
                }
            }

            if count >= 4 {
                return true;
            }
        }

        false
    }
}

impl GameState for Connect4State {
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
        self.heights = [0; WIDTH];
        self.status = GameStatus::Player0Turn;
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
        let col = action.z as usize;
        let row = self.heights[col];
        assert!(row < HEIGHT, "column {} is full", col);

        self.board[row * WIDTH + col] = player as i8;
        self.heights[col] += 1;

        self.status = if self.wins_at(row, col) {
            if player == 0 { GameStatus::Player0Win } else { GameStatus::Player1Win }
        } else if self.heights.iter().all(|&h| h == HEIGHT) {
            GameStatus::Tie
        } else if player == 0 {
            GameStatus::Player1Turn
        } else {
            GameStatus::Player0Turn
        };

        self.rebuild_legal_actions();
    }

    fn get_features(&self) -> Vec<f32> {
        let cells = WIDTH * HEIGHT;
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
        vec! [2, HEIGHT as i64, WIDTH as i64]
    }

    fn get_action_size(&self) -> Vec<i64> {
        vec! [1, 1, WIDTH as i64]
    }

    fn action_description(&self, action: &Action) -> String {
        format!("{}", (b'a' + action.z as u8) as char)
    }

    fn parse_action(&self, text: &str) -> Option<usize> {
        self.legal.iter()
            .position(|action| self.action_description(action).eq_ignore_ascii_case(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drop(state: &mut Connect4State, col: i64) {
        let index = state.legal_actions().iter()
            .position(|a| a.z == col)
            .expect("column is full");

        state.forward(index);
    }

    #[test]
    fn vertical_win() {
        let mut state = Connect4State::new();
        state.initialize();

        for _ in 0..3 {
            drop(&mut state, 0);  // x
            drop(&mut state, 1);  // o
        }
        drop(&mut state, 0);  // x completes the column

        assert_eq!(state.status(), GameStatus::Player0Win);
        assert_eq!(state.get_reward(0), 1.0);
    }

    #[test]
    fn stones_stack_up() {
        let mut state = Connect4State::new();
        state.initialize();

        drop(&mut state, 3);
        drop(&mut state, 3);

        let feats = state.get_features();
        let cells = WIDTH * HEIGHT;

        assert_eq!(feats[3], 1.0);                  // x at the bottom
        assert_eq!(feats[cells + WIDTH + 3], 1.0);  // o on top of it
    }

    #[test]
    fn full_column_is_illegal() {
        let mut state = Connect4State::new();
        state.initialize();

        for _ in 0..HEIGHT {
            drop(&mut state, 6);
        }

        assert_eq!(state.legal_actions().len(), WIDTH - 1);
        assert!(state.legal_actions().iter().all(|a| a.z != 6));
    }

    #[test]
    fn diagonal_win() {
        let mut state = Connect4State::new();
        state.initialize();

        // build a staircase for x: (0,0) (1,1) (2,2) (3,3)
        for (i, col) in [0, 1, 1, 2, 3, 2, 2, 3, 3, 6, 3].iter().enumerate() {
            assert!(!state.terminated(), "game over after {} moves", i);
            drop(&mut state, *col);
        }

        assert_eq!(state.status(), GameStatus::Player0Win);
    }
}
