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

use rand::Rng;

use crate::state::{Action, BaseState, GameState, GameStatus};

/// A one-player minesweeper. The mines are drawn from the per-state RNG on
/// every new game; revealing a mine loses, revealing every safe cell wins.
/// Losing is reported as the opponent's win so the usual reward accessors
/// apply.
#[derive(Clone)]
pub struct MinesweeperState {
    base: BaseState,
    w: usize,
    h: usize,
    num_mines: usize,
    mines: Vec<bool>,
    revealed: Vec<bool>,
    status: GameStatus,
    legal: Vec<Action>
}

impl MinesweeperState {
    pub fn new(w: usize, h: usize, num_mines: usize) -> Self {
        assert!(num_mines < w * h);

        Self {
            base: BaseState::new(0),
            w,
            h,
            num_mines,
            mines: vec! [false; w * h],
            revealed: vec! [false; w * h],
            status: GameStatus::Player0Turn,
            legal: Vec::new()
        }
    }

    fn place_mines(&mut self) {
        self.mines.iter_mut().for_each(|m| *m = false);

        let mut placed = 0;
        while placed < self.num_mines {
            let cell = self.base.rng.gen_range(0..self.mines.len());

            if !self.mines[cell] {
                self.mines[cell] = true;
                placed += 1;
            }
        }
    }

    fn rebuild_legal_actions(&mut self) {
        self.legal.clear();

        if self.status == GameStatus::Player0Turn {
            for cell in 0..self.revealed.len() {
                if !self.revealed[cell] {
                    let y = (cell / self.w) as i64;
                    let z = (cell % self.w) as i64;

                    self.legal.push(Action::new(self.legal.len() as i64, 0, y, z));
                }
            }
        }
    }

    fn neighbour_mines(&self, cell: usize) -> usize {
        let (y, z) = ((cell / self.w) as i64, (cell % self.w) as i64);
        let mut count = 0;

        for dy in -1i64..=1 {
            for dz in -1i64..=1 {
                if dy == 0 && dz == 0 {
                    continue;
                }

                let (yy, zz) = (y + dy, z + dz);
                if yy >= 0 && yy < self.h as i64 && zz >= 0 && zz < self.w as i64
                    && self.mines[yy as usize * self.w + zz as usize]
                {
                    count += 1;
                }
            }
        }

        count
    }
}

impl GameState for MinesweeperState {
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
        self.revealed.iter_mut().for_each(|r| *r = false);
        self.status = GameStatus::Player0Turn;
        self.place_mines();
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
        let cell = action.y as usize * self.w + action.z as usize;
        assert!(!self.revealed[cell], "cell ({}, {}) is already revealed", action.y, action.z);

        self.revealed[cell] = true;

        self.status = if self.mines[cell] {
            GameStatus::Player1Win
        } else if self.mines.iter().zip(self.revealed.iter()).all(|(&m, &r)| m || r) {
            GameStatus::Player0Win
        } else {
            GameStatus::Player0Turn
        };

        self.rebuild_legal_actions();
    }

    fn get_features(&self) -> Vec<f32> {
        let cells = self.w * self.h;
        let mut out = vec! [0.0; 2 * cells];

        for cell in 0..cells {
            if self.revealed[cell] {
                out[cell] = 1.0;
                out[cells + cell] = self.neighbour_mines(cell) as f32 / 8.0;
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

    fn is_stochastic(&self) -> bool {
        true
    }

    fn stochastic_reset(&mut self) {
        // re-draw the hidden mines while keeping the revealed safe cells
        let revealed = self.revealed.clone();

        loop {
            self.place_mines();

            if revealed.iter().zip(self.mines.iter()).all(|(&r, &m)| !(r && m)) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revealing_a_mine_loses() {
        let mut state = MinesweeperState::new(3, 1, 1);
        state.new_game(1);

        let mine = state.mines.iter().position(|&m| m).unwrap();
        let index = state.legal_actions().iter()
            .position(|a| a.y as usize * 3 + a.z as usize == mine)
            .unwrap();

        state.forward(index);

        assert_eq!(state.status(), GameStatus::Player1Win);
        assert_eq!(state.get_reward(0), -1.0);
    }

    #[test]
    fn revealing_every_safe_cell_wins() {
        let mut state = MinesweeperState::new(3, 1, 1);
        state.new_game(1);

        while !state.terminated() {
            let safe = state.legal_actions().iter()
                .position(|a| !state.mines[a.y as usize * 3 + a.z as usize])
                .unwrap();

            state.forward(safe);
        }

        assert_eq!(state.status(), GameStatus::Player0Win);
        assert_eq!(state.get_reward(0), 1.0);
    }

    #[test]
    fn mines_are_reproducible_by_seed() {
        let mut a = MinesweeperState::new(5, 5, 3);
        a.new_game(42);
        let mut b = MinesweeperState::new(5, 5, 3);
        b.new_game(42);

        assert_eq!(a.mines, b.mines);
        assert_eq!(a.mines.iter().filter(|&&m| m).count(), 3);
    }

    #[test]
    fn stochastic_reset_respects_revealed_cells() {
        let mut state = MinesweeperState::new(5, 5, 3);
        state.new_game(7);

        let safe = state.legal_actions().iter()
            .position(|a| !state.mines[a.y as usize * 5 + a.z as usize])
            .unwrap();
        state.forward(safe);

        for _ in 0..10 {
            state.stochastic_reset();

            for cell in 0..25 {
                assert!(!(state.revealed[cell] && state.mines[cell]));
            }
        }
    }

    #[test]
    fn features_mark_counts() {
        let mut state = MinesweeperState::new(3, 1, 1);
        state.new_game(3);

        let safe = state.legal_actions().iter()
            .position(|a| !state.mines[a.y as usize * 3 + a.z as usize])
            .unwrap();
        state.forward(safe);

        let feats = state.get_features();
        assert_eq!(feats.iter().filter(|&&v| v > 0.0).count() >= 1, true);
    }
}
