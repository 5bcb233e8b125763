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

use pz_games::GameState;
use pz_mcts::{Actor, MctsPlayer, PiVal};
use pz_tensor::Tensor;

/// A player that plays the raw policy of the model: one forward pass per
/// move, the action sampled from the legal-policy distribution.
pub struct ForwardPlayer {
    actor: Arc<Actor>
}

impl ForwardPlayer {
    pub fn new(actor: Arc<Actor>) -> Self {
        Self { actor }
    }

    pub fn actor(&self) -> &Arc<Actor> {
        &self.actor
    }

    pub fn batch_resize(&self, n: usize) {
        self.actor.batch_resize(n);
    }

    pub fn batch_prepare(&self, index: usize, state: &dyn GameState, rnn_state: Option<&Tensor>) {
        self.actor.batch_prepare(index, state, rnn_state);
    }

    pub fn batch_evaluate(&self, n: usize) {
        self.actor.batch_evaluate(n);
    }

    pub fn batch_result(&self, index: usize, state: &dyn GameState) -> PiVal {
        self.actor.batch_result(index, state)
    }

    /// Advance the recurrent state of every given position without playing
    /// a move, used to keep a shadow model in lockstep.
    ///
    /// # Arguments
    ///
    /// * `states` -
    /// * `rnn_states` -
    ///
    pub fn next_rnn_state(&self, states: &[&dyn GameState], rnn_states: &[Tensor]) -> Vec<Tensor> {
        assert_eq!(states.len(), rnn_states.len());

        self.actor.batch_resize(states.len());
        for (i, state) in states.iter().enumerate() {
            self.actor.batch_prepare(i, *state, Some(&rnn_states[i]));
        }
        self.actor.batch_evaluate(states.len());

        states.iter().enumerate()
            .map(|(i, state)| {
                self.actor.batch_result(i, *state).rnn_state
                    .expect("model is not recurrent")
            })
            .collect()
    }
}

/// A human entering moves as text on stdin.
pub struct HumanPlayer;

/// A seat at the table: either a search player, a raw-policy player, or a
/// human. Seats may be shared between games (and between both sides of a
/// game) so their evaluations batch together.
pub enum Player {
    Mcts(MctsPlayer),
    Forward(ForwardPlayer),
    Human(HumanPlayer)
}

impl Player {
    pub fn is_human(&self) -> bool {
        matches!(self, Player::Human(_))
    }

    pub fn as_mcts(&self) -> Option<&MctsPlayer> {
        match self {
            Player::Mcts(player) => Some(player),
            _ => None
        }
    }

    pub fn as_forward(&self) -> Option<&ForwardPlayer> {
        match self {
            Player::Forward(player) => Some(player),
            _ => None
        }
    }

    pub fn actor(&self) -> Option<&Arc<Actor>> {
        match self {
            Player::Mcts(player) => Some(player.actor()),
            Player::Forward(player) => Some(player.actor()),
            Player::Human(_) => None
        }
    }

    pub fn rnn_seqlen(&self) -> usize {
        self.actor().map(|actor| actor.rnn_seqlen()).unwrap_or(0)
    }

    pub fn rnn_state_size(&self) -> Vec<i64> {
        self.actor().map(|actor| actor.rnn_state_size().to_vec()).unwrap_or_default()
    }

    pub fn v_outputs(&self) -> usize {
        self.actor().map(|actor| actor.v_outputs()).unwrap_or(1)
    }

    pub fn model_id(&self) -> String {
        self.actor().map(|actor| actor.model_id()).unwrap_or_else(|| "dev".to_string())
    }

    pub fn record_move(&self, game_id: u64) {
        if let Some(actor) = self.actor() {
            actor.record_move(game_id);
        }
    }

    pub fn result(&self, game_id: u64, reward: f32) {
        if let Some(actor) = self.actor() {
            actor.result(game_id, reward);
        }
    }

    pub fn forget(&self, game_id: u64) {
        if let Some(actor) = self.actor() {
            actor.forget(game_id);
        }
    }

    pub fn wants_tournament_result(&self) -> bool {
        self.actor().map(|actor| actor.wants_tournament_result()).unwrap_or(false)
    }

    pub fn find_batch_size(&self, state: &dyn GameState) -> usize {
        self.actor().map(|actor| actor.find_batch_size(state)).unwrap_or(0)
    }

    pub fn terminate(&self) {
        if let Some(actor) = self.actor() {
            actor.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_mcts::MctsOption;

    fn random_actor() -> Arc<Actor> {
        Arc::new(Actor::new(None, &[2, 3, 3], &[1, 3, 3], &[], 0, false, false, false, None))
    }

    #[test]
    fn kinds() {
        let mcts = Player::Mcts(MctsPlayer::new(MctsOption::default(), random_actor()));
        let forward = Player::Forward(ForwardPlayer::new(random_actor()));
        let human = Player::Human(HumanPlayer);

        assert!(mcts.as_mcts().is_some());
        assert!(forward.as_forward().is_some());
        assert!(human.is_human());
        assert!(human.actor().is_none());
        assert_eq!(forward.model_id(), "dev");
        assert_eq!(human.v_outputs(), 1);
    }
}
