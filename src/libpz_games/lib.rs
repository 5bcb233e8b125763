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

#[macro_use] extern crate lazy_static;

mod connect4;
mod minesweeper;
mod mnk;
mod state;

pub use self::connect4::Connect4State;
pub use self::minesweeper::MinesweeperState;
pub use self::mnk::MnkState;
pub use self::state::{Action, BaseState, GameState, GameStatus};

/// Create a game state from a case-insensitive game name, e.g. `TicTacToe`
/// or `FreeStyleGomoku`. Generic m,n,k-games are accepted as
/// `MNKGame_<w>_<h>_<k>`.
///
/// # Arguments
///
/// * `name` -
/// * `seed` -
///
pub fn new_state(name: &str, seed: u64) -> Option<Box<dyn GameState>> {
    let lower = name.to_lowercase();

    let mut state: Box<dyn GameState> = match lower.as_str() {
        "tictactoe" | "noughtsandcrosses" | "xsandos" | "mnkgame_3_3_3" => {
            Box::new(MnkState::tictactoe())
        },
        "freestylegomoku" | "gomokufreestyle" | "mnkgame_15_15_5" => {
            Box::new(MnkState::freestyle_gomoku())
        },
        "connect4" | "connectfour" => {
            Box::new(Connect4State::new())
        },
        "minesweeper" => {
            Box::new(MinesweeperState::new(5, 5, 3))
        },
        _ if lower.starts_with("mnkgame_") => {
            let mut parts = lower["mnkgame_".len()..].split('_');
            let w = parts.next()?.parse().ok()?;
            let h = parts.next()?.parse().ok()?;
            let k = parts.next()?.parse().ok()?;

            Box::new(MnkState::new(w, h, k))
        },
        _ if lower.starts_with("minesweeper_") => {
            let mut parts = lower["minesweeper_".len()..].split('_');
            let w = parts.next()?.parse().ok()?;
            let h = parts.next()?.parse().ok()?;
            let mines = parts.next()?.parse().ok()?;

            Box::new(MinesweeperState::new(w, h, mines))
        },
        _ => return None
    };

    state.initialize();
    state.new_game(seed);
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names() {
        assert!(new_state("TicTacToe", 1).is_some());
        assert!(new_state("noughtsANDcrosses", 1).is_some());
        assert!(new_state("FreeStyleGomoku", 1).is_some());
        assert!(new_state("MNKGame_5_5_4", 1).is_some());
        assert!(new_state("Connect4", 1).is_some());
        assert!(new_state("Minesweeper_4_4_4", 1).is_some());
        assert!(new_state("Chess", 1).is_none());
    }

    #[test]
    fn fresh_state_is_playable() {
        let state = new_state("TicTacToe", 1).unwrap();

        assert!(!state.terminated());
        assert_eq!(state.legal_actions().len(), 9);
        assert_eq!(state.current_player(), 0);
    }
}
