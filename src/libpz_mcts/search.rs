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

use std::sync::{Arc, Mutex};
use std::time::Instant;

use ordered_float::OrderedFloat;
use rand::RngCore;
use rand_distr::{Distribution, Normal};

use pz_games::GameState;
use pz_tensor::Tensor;
use pz_utils::rng::Xoshiro256;
use pz_utils::threads::parallel_for;

use crate::actor::{Actor, PiVal};
use crate::options::MctsOption;
use crate::policy::{legal_pi, softmax_};
use crate::results::MctsResult;
use crate::tree::{Node, NodeId, PersistentTree, Storage};

/// Leaf selections per tree between two batched evaluations. Virtual loss
/// makes the selections within one wave diverge.
const SELECT_BATCH: usize = 4;

struct WaveItem {
    leaf: NodeId,
    state: Box<dyn GameState>,
    rnn_in: Option<Tensor>,
    pival: Option<PiVal>
}

struct GameSearch<'a> {
    state: &'a dyn GameState,
    rnn_state: Option<Tensor>,
    tree: &'a mut PersistentTree,
    budget: usize,
    rollouts: usize,
    rng: Xoshiro256,
    wave: Vec<WaveItem>
}

/// The perspective a node's statistics are kept in: the player who chose
/// the node (the root keeps its own player's perspective).
fn perspective(storage: &Storage, id: NodeId) -> usize {
    let node = storage.node(id);

    match node.parent {
        Some(parent) => storage.node(parent).player,
        None => node.player
    }
}

/// Add the rollout outcome to every node from `id` up to the root,
/// flipping the sign to each node's perspective and taking back the
/// virtual loss added during selection.
fn backup(storage: &Storage, id: NodeId, value: f32, value_player: usize, virtual_loss: f32) {
    let mut cursor = Some(id);

    while let Some(at) = cursor {
        let node = storage.node(at);
        let persp = perspective(storage, at);
        let signed = if persp == value_player { value } else { -value };

        node.stats.atomic_update(signed, virtual_loss);
        cursor = node.parent;
    }
}

/// Take back the virtual loss of an abandoned selection path.
fn rollback(storage: &Storage, id: NodeId, virtual_loss: f32) {
    let mut cursor = Some(id);

    while let Some(at) = cursor {
        let node = storage.node(at);

        node.stats.add_virtual_loss(-virtual_loss);
        cursor = node.parent;
    }
}

/// Recompute the game state at `id` by replaying from the nearest stored
/// ancestor.
fn compute_state(storage: &Storage, id: NodeId) -> Box<dyn GameState> {
    let mut actions = Vec::new();
    let mut cursor = id;

    loop {
        let node = storage.node(cursor);

        if let Some(state) = &node.state {
            let mut out = state.clone_dyn();

            for &action in actions.iter().rev() {
                out.forward(action as usize);
            }

            return out;
        }

        actions.push(node.action);
        cursor = node.parent.expect("no stored state on the path to the root");
    }
}

/// Pick the child of `parent_id` to descend into: the argmax of
/// `Q + puct * prior * sqrt(N) / (1 + n)` with ties broken by ascending
/// child index, after honouring forced rollouts at the root.
fn select_child(storage: &Storage, parent_id: NodeId, option: &MctsOption, is_root: bool) -> NodeId {
    let parent = storage.node(parent_id);
    let parent_visits = parent.stats.num_visit();
    let sqrt_n = (parent_visits.max(1) as f32).sqrt();
    let value_prior = if option.use_value_prior { parent.stats.avg_child_v() } else { 0.0 };

    // actions whose prior was starved (possibly because another action
    // absorbed their shared policy cell) still get a minimum visit count
    if is_root && option.forced_rollouts_multiplier > 0.0 && parent_visits > 0 {
        for &child_id in &parent.children {
            let child = storage.node(child_id);
            let visits = child.stats.num_visit() as f32 + child.stats.virtual_loss();
            let forced = if child.prior > 0.0 {
                (option.forced_rollouts_multiplier * child.prior * parent_visits as f32).sqrt()
            } else {
                option.forced_rollouts_multiplier
            };

            if visits < forced {
                return child_id;
            }
        }
    }

    let mut best = parent.children[0];
    let mut best_score = OrderedFloat(f32::NEG_INFINITY);

    for &child_id in &parent.children {
        let child = storage.node(child_id);
        let visits = child.stats.num_visit();
        let q = if visits == 0 {
            value_prior - child.stats.virtual_loss()
        } else {
            (child.stats.value() - child.stats.virtual_loss()) / (visits as f32 + 1e-8)
        };
        let score = OrderedFloat(q + option.puct * child.prior * sqrt_n / (1.0 + visits as f32));

        if score > best_score {
            best_score = score;
            best = child_id;
        }
    }

    best
}

/// Descend from the root to a leaf, adding virtual loss along the way.
/// Terminal leaves are backed up immediately; an unexpanded leaf is queued
/// for evaluation. Returns false when this tree cannot make progress until
/// the pending wave is evaluated.
fn select_one(search: &mut GameSearch, option: &MctsOption) -> bool {
    let root = search.tree.root.expect("no root");
    let storage = &mut search.tree.storage;
    let mut id = root;

    storage.node(id).stats.add_virtual_loss(option.virtual_loss);

    loop {
        let node = storage.node(id);

        if node.terminal {
            let chooser = perspective(storage, id);
            let value = storage.node(id).terminal_value;

            backup(storage, id, value, chooser, option.virtual_loss);
            search.rollouts += 1;
            return true;
        }
        if !node.expanded {
            if node.pending {
                rollback(storage, id, option.virtual_loss);
                return false;
            }

            break;
        }

        let next = select_child(storage, id, option, id == root);
        storage.node(next).stats.add_virtual_loss(option.virtual_loss);
        id = next;
    }

    let state = compute_state(storage, id);

    if state.terminated() {
        let chooser = perspective(storage, id);
        let value = state.get_reward(chooser);
        let node = storage.node_mut(id);

        node.terminal = true;
        node.terminal_value = value;
        node.player = state.current_player();

        backup(storage, id, value, chooser, option.virtual_loss);
        search.rollouts += 1;
        return true;
    }

    let rnn_in = match storage.node(id).parent {
        Some(parent) => storage.node(parent).rnn_state.clone(),
        None => search.rnn_state.clone()
    };

    storage.node_mut(id).pending = true;
    search.wave.push(WaveItem { leaf: id, state, rnn_in, pival: None });
    true
}

/// Publish the evaluated leaf: set its player, create child placeholders
/// with the legal-policy priors, refine the sibling value prior on the
/// parent, and back the value up.
fn expand(search: &mut GameSearch, item: WaveItem, option: &MctsOption) {
    let WaveItem { leaf, state, pival, .. } = item;
    let pival = pival.expect("leaf was never evaluated");
    let storage = &mut search.tree.storage;

    if !storage.node(leaf).expanded {
        let mut logits = pival.logit_policy.clone();
        let mut priors = legal_pi(state.as_ref(), &mut logits);
        softmax_(&mut priors);

        let depth = storage.node(leaf).depth + 1;
        let children = priors.iter().enumerate()
            .map(|(i, &prior)| storage.alloc(Node::new(Some(leaf), i as i64, depth, prior)))
            .collect::<Vec<_>>();

        let store_state = (storage.node(leaf).depth as usize) % option.store_state_interval.max(1) == 0;
        let node = storage.node_mut(leaf);
        node.player = state.current_player();
        node.children = children;
        node.rnn_state = pival.rnn_state.clone();
        if store_state {
            node.state = Some(state);
        }
        node.expanded = true;
        node.pending = false;

        if let Some(parent) = storage.node(leaf).parent {
            let parent_player = storage.node(parent).player;
            let signed = if parent_player == pival.player { pival.value } else { -pival.value };

            storage.node(parent).stats.atomic_update_child_v(signed);
        }
    } else {
        storage.node_mut(leaf).pending = false;
    }

    backup(storage, leaf, pival.value, pival.player, option.virtual_loss);
    search.rollouts += 1;
}

/// A player that picks its moves with a neural-network-guided tree search.
/// One player drives the searches of many concurrent games at once so
/// their leaf evaluations share model batches.
pub struct MctsPlayer {
    option: MctsOption,
    actor: Arc<Actor>,
    rng: Mutex<Xoshiro256>,
    remaining_time: Mutex<f32>,
    rollouts_per_second: Mutex<f64>
}

impl MctsPlayer {
    pub fn new(option: MctsOption, actor: Arc<Actor>) -> Self {
        let remaining_time = option.total_time;
        let rng = Xoshiro256::new(option.seed);

        Self {
            option,
            actor,
            rng: Mutex::new(rng),
            remaining_time: Mutex::new(remaining_time),
            rollouts_per_second: Mutex::new(0.0)
        }
    }

    pub fn option(&self) -> &MctsOption {
        &self.option
    }

    pub fn actor(&self) -> &Arc<Actor> {
        &self.actor
    }

    pub fn rollouts_per_second(&self) -> f64 {
        *self.rollouts_per_second.lock().expect("could not acquire rollout stats")
    }

    /// Search every given state and return one result per state. Searches
    /// advance in lock-step waves so that their leaf evaluations batch
    /// together, and each tree is only ever touched by one worker per
    /// phase.
    ///
    /// # Arguments
    ///
    /// * `states` - the positions to search, one per live game
    /// * `rnn_states` - recurrent state per game (empty for none)
    /// * `persistent_trees` - optional reusable tree per game; taken for
    ///   the duration of the call
    ///
    pub fn act_mcts(
        &self,
        states: &[&dyn GameState],
        rnn_states: &[Option<Tensor>],
        persistent_trees: &mut [Option<&mut PersistentTree>]
    ) -> Vec<MctsResult> {
        let n = states.len();
        if n == 0 {
            return Vec::new();
        }

        let option = &self.option;
        let this_move_time = if option.total_time > 0.0 {
            *self.remaining_time.lock().expect("could not acquire time budget") * option.time_ratio
        } else {
            0.0
        };
        let started_at = Instant::now();

        // build one search context per game; games without a caller-owned
        // tree get a scratch tree that dies with the call
        let mut scratch = (0..n).map(|_| PersistentTree::new()).collect::<Vec<_>>();
        let mut searches = {
            let mut master_rng = self.rng.lock().expect("could not acquire rng");
            let mut out = Vec::with_capacity(n);

            for (i, tree) in scratch.iter_mut().enumerate() {
                let tree = match persistent_trees.get_mut(i).and_then(|slot| slot.take()) {
                    Some(persistent) => persistent,
                    None => tree
                };

                let budget = if this_move_time > 0.0 {
                    usize::MAX
                } else if option.randomized_rollouts {
                    let spread = Normal::new(1.0f32, 0.5).expect("invalid rollout spread");
                    let factor = spread.sample(&mut *master_rng).max(0.25).min(2.0);

                    ((option.num_rollout_per_thread as f32 * factor) as usize).max(1)
                } else {
                    option.num_rollout_per_thread.max(1)
                };

                out.push(GameSearch {
                    state: states[i],
                    rnn_state: rnn_states.get(i).cloned().flatten(),
                    tree,
                    budget,
                    rollouts: 0,
                    rng: Xoshiro256::new(master_rng.next_u64()),
                    wave: Vec::new()
                });
            }

            out
        };

        // fresh or refreshed roots
        for search in searches.iter_mut() {
            let player = search.state.current_player();

            if let Some(root) = search.tree.root {
                if search.tree.storage.node(root).expanded
                    && search.tree.storage.node(root).player != player
                {
                    search.tree.clear();
                }
            }

            match search.tree.root {
                Some(root) => {
                    search.tree.storage.node_mut(root).state = Some(search.state.clone_dyn());
                },
                None => {
                    let mut node = Node::new(None, -1, 0, 1.0);
                    node.player = player;
                    node.state = Some(search.state.clone_dyn());

                    search.tree.root = Some(search.tree.storage.alloc(node));
                }
            }
        }

        loop {
            let rollouts_before = searches.iter().map(|s| s.rollouts).sum::<usize>();

            // selection
            parallel_for(&mut searches, |_, search| {
                let remaining = search.budget.saturating_sub(search.rollouts);

                for _ in 0..SELECT_BATCH.min(remaining) {
                    if !select_one(search, option) {
                        break;
                    }
                }
            });

            // batched evaluation of every pending leaf across all games
            let total = searches.iter().map(|s| s.wave.len()).sum::<usize>();

            if total > 0 {
                self.actor.batch_resize(total);

                let mut offset = 0;
                for search in &searches {
                    for item in &search.wave {
                        self.actor.batch_prepare(offset, item.state.as_ref(), item.rnn_in.as_ref());
                        offset += 1;
                    }
                }

                self.actor.batch_evaluate(total);

                let mut offset = 0;
                for search in searches.iter_mut() {
                    for item in search.wave.iter_mut() {
                        item.pival = Some(self.actor.batch_result(offset, item.state.as_ref()));
                        offset += 1;
                    }
                }

                // expansion and backup
                parallel_for(&mut searches, |_, search| {
                    let wave = std::mem::replace(&mut search.wave, Vec::new());

                    for item in wave {
                        expand(search, item, option);
                    }
                });
            }

            let rollouts_after = searches.iter().map(|s| s.rollouts).sum::<usize>();
            let exhausted = searches.iter().all(|s| s.rollouts >= s.budget);
            let expired = this_move_time > 0.0 && started_at.elapsed().as_secs_f32() >= this_move_time;

            if exhausted || expired || rollouts_after == rollouts_before {
                break;
            }
        }

        let elapsed = started_at.elapsed().as_secs_f32();
        if option.total_time > 0.0 {
            *self.remaining_time.lock().expect("could not acquire time budget") -= elapsed;
        }

        let total_rollouts = searches.iter().map(|s| s.rollouts).sum::<usize>() as f64;
        *self.rollouts_per_second.lock().expect("could not acquire rollout stats") =
            total_rollouts / elapsed.max(1e-6) as f64;

        // results
        let mut rng = self.rng.lock().expect("could not acquire rng");

        searches.iter().map(|search| {
            let storage = &search.tree.storage;
            let root = search.tree.root.expect("no root");
            let mut result = MctsResult::new();

            for &child_id in &storage.node(root).children {
                let child = storage.node(child_id);

                result.add(child.action, child.stats.num_visit() as f32);
            }

            result.normalize();
            result.root_value = storage.node(root).stats.avg_value();
            result.rollouts = search.rollouts;
            result.rnn_state = storage.node(root).rnn_state.clone();

            if option.sampling_mcts {
                result.sample(&mut *rng);
            } else if search.state.get_step_idx() < option.sample_before_step_idx {
                result.sample_by_visits(&mut *rng);
            }

            result
        }).collect()
    }

    /// Search a single state.
    ///
    /// # Arguments
    ///
    /// * `state` -
    ///
    pub fn act_mcts_single(&self, state: &dyn GameState) -> MctsResult {
        self.act_mcts(&[state], &[], &mut [])
            .pop()
            .expect("no search result")
    }

    /// Search a single state while reusing (and refreshing) the given
    /// tree.
    ///
    /// # Arguments
    ///
    /// * `state` -
    /// * `tree` -
    ///
    pub fn act_mcts_with_tree(&self, state: &dyn GameState, tree: &mut PersistentTree) -> MctsResult {
        self.act_mcts(&[state], &[], &mut [Some(tree)])
            .pop()
            .expect("no search result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_games::{Action, BaseState, GameStatus, MnkState};

    /// A one-player, one-step decision problem with three arms paying
    /// [0, 0, 1].
    #[derive(Clone)]
    struct BanditGame {
        base: BaseState,
        taken: Option<usize>,
        legal: Vec<Action>
    }

    impl BanditGame {
        fn new() -> Self {
            Self {
                base: BaseState::new(0),
                taken: None,
                legal: (0..3).map(|i| Action::new(i, 0, 0, i)).collect()
            }
        }
    }

    impl GameState for BanditGame {
        fn base(&self) -> &BaseState { &self.base }
        fn base_mut(&mut self) -> &mut BaseState { &mut self.base }

        fn initialize(&mut self) { }

        fn reset(&mut self) {
            self.taken = None;
            self.legal = (0..3).map(|i| Action::new(i, 0, 0, i)).collect();
        }

        fn clone_dyn(&self) -> Box<dyn GameState> {
            Box::new(self.clone())
        }

        fn status(&self) -> GameStatus {
            match self.taken {
                None => GameStatus::Player0Turn,
                Some(2) => GameStatus::Player0Win,
                Some(_) => GameStatus::Tie
            }
        }

        fn legal_actions(&self) -> &[Action] {
            &self.legal
        }

        fn apply_action(&mut self, action: &Action) {
            self.taken = Some(action.index as usize);
            self.legal.clear();
        }

        fn get_features(&self) -> Vec<f32> {
            vec! [0.0; 3]
        }

        fn get_feature_size(&self) -> Vec<i64> {
            vec! [1, 1, 3]
        }

        fn get_action_size(&self) -> Vec<i64> {
            vec! [1, 1, 3]
        }
    }

    fn random_actor(feat: &[i64], actions: &[i64]) -> Arc<Actor> {
        Arc::new(Actor::new(None, feat, actions, &[], 0, false, false, false, None))
    }

    #[test]
    fn bandit_finds_the_paying_arm() {
        let option = MctsOption {
            puct: 1.0,
            num_rollout_per_thread: 200,
            virtual_loss: 0.0,
            forced_rollouts_multiplier: 0.0,
            ..MctsOption::default()
        };
        let player = MctsPlayer::new(option, random_actor(&[1, 1, 3], &[1, 1, 3]));
        let game = BanditGame::new();

        let result = player.act_mcts_single(&game);

        assert_eq!(result.best_action, 2);
        assert!(result.root_value > 0.9, "root value {}", result.root_value);
        assert!(result.rollouts >= 200);
        assert!((result.mcts_policy.iter().sum::<f32>() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn virtual_loss_is_conserved() {
        let option = MctsOption {
            puct: 1.5,
            num_rollout_per_thread: 100,
            virtual_loss: 1.0,
            ..MctsOption::default()
        };
        let player = MctsPlayer::new(option, random_actor(&[2, 3, 3], &[1, 3, 3]));
        let mut game = MnkState::tictactoe();
        game.initialize();

        let mut tree = PersistentTree::new();
        player.act_mcts_with_tree(&game, &mut tree);

        for id in 0..tree.storage.len() {
            let node = tree.storage.node(id as u32);

            assert_eq!(node.stats.virtual_loss(), 0.0, "node {} has dangling virtual loss", id);
        }
    }

    #[test]
    fn persistent_tree_is_reused() {
        let option = MctsOption {
            puct: 1.5,
            num_rollout_per_thread: 100,
            ..MctsOption::default()
        };
        let player = MctsPlayer::new(option, random_actor(&[2, 3, 3], &[1, 3, 3]));
        let mut game = MnkState::tictactoe();
        game.initialize();

        let mut tree = PersistentTree::new();
        let result = player.act_mcts_with_tree(&game, &mut tree);

        tree.descend(result.best_action);
        let carried = tree.root
            .map(|root| tree.storage.node(root).stats.num_visit())
            .unwrap_or(0);
        assert!(carried > 0);

        game.forward(result.best_action as usize);
        player.act_mcts_with_tree(&game, &mut tree);

        let root = tree.root.expect("tree was cleared");
        assert!(tree.storage.node(root).stats.num_visit() >= carried);
    }

    #[test]
    fn sampled_openings_vary() {
        let option = MctsOption {
            puct: 1.5,
            num_rollout_per_thread: 50,
            sample_before_step_idx: 4,
            ..MctsOption::default()
        };
        let player = MctsPlayer::new(option, random_actor(&[2, 3, 3], &[1, 3, 3]));
        let mut game = MnkState::tictactoe();
        game.initialize();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let result = player.act_mcts_single(&game);
            seen.insert(result.best_action);
        }

        assert!(seen.len() > 1, "opening sampling always picked {:?}", seen);
    }

    #[test]
    fn two_games_search_together() {
        let option = MctsOption {
            puct: 1.5,
            num_rollout_per_thread: 60,
            virtual_loss: 1.0,
            ..MctsOption::default()
        };
        let player = MctsPlayer::new(option, random_actor(&[2, 3, 3], &[1, 3, 3]));

        let mut a = MnkState::tictactoe();
        a.initialize();
        let mut b = MnkState::tictactoe();
        b.initialize();
        b.forward(4);

        let results = player.act_mcts(&[&a as &dyn GameState, &b], &[], &mut []);

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.best_action >= 0);
            assert!(result.rollouts >= 60);
        }
    }
}
