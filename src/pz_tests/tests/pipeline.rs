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

use std::sync::Arc;

use pz_core::{GameRunner, Player};
use pz_mcts::{Actor, MctsOption, MctsPlayer};
use pz_nn::{Device, ModelManager, ScriptModule};
use pz_tests::{toy_graph_config, wait_until};
use pz_tube::Context;

fn toy_manager() -> Arc<ModelManager> {
    ModelManager::new(
        ScriptModule::new(toy_graph_config()),
        4,
        1,
        &[Device::Cpu],
        64,
        1,
        128,
        100
    )
}

fn mcts_seat(manager: &Arc<ModelManager>, rollouts: usize) -> Arc<Player> {
    let actor = Arc::new(Actor::new(
        manager.act_channels().get(0).cloned(),
        &[2, 3, 3],
        &[1, 3, 3],
        &manager.rnn_state_size(),
        manager.rnn_seqlen(),
        manager.value_outputs() == 3,
        true,
        true,
        Some(manager.clone())
    ));
    let option = MctsOption {
        puct: 1.5,
        num_rollout_per_thread: rollouts,
        virtual_loss: 1.0,
        ..MctsOption::default()
    };

    Arc::new(Player::Mcts(MctsPlayer::new(option, actor)))
}

#[test]
fn selfplay_fills_the_replay_buffer() {
    let manager = toy_manager();
    manager.start();

    let seat = mcts_seat(&manager, 8);
    let mut runner = GameRunner::new("TicTacToe", 3, false, 2, 0, false, 0, 1);
    runner.add_player("dev", seat.clone(), Some(manager.train_channel()), None);
    runner.add_player("dev", seat, Some(manager.train_channel()), None);

    let mut context = Context::new();
    context.push_env_thread(Box::new(runner));
    context.start();

    wait_until("the games to finish", 300, || context.terminated());
    wait_until("trajectories in the replay buffer", 60, || manager.buffer_num_add() >= 5);

    let samples = manager.sample(4);
    for key in &["s", "pi", "pi_mask", "v", "pred_v"] {
        assert!(samples.contains_key(*key), "sample is missing key '{}'", key);
    }
    assert_eq!(samples["s"].shape(), &[4, 2, 3, 3]);
    assert_eq!(samples["pi"].shape(), &[4, 1, 3, 3]);
    assert_eq!(samples["v"].shape(), &[4, 1]);
    assert!(manager.buffer_num_sample() >= 4);

    context.terminate();
    manager.shutdown();
}

#[test]
fn selfplay_with_prediction_targets() {
    let manager = toy_manager();
    manager.start();

    let seat = mcts_seat(&manager, 6);
    let mut runner = GameRunner::new("TicTacToe", 2, false, 1, 0, true, 1, 3);
    runner.add_player("dev", seat.clone(), Some(manager.train_channel()), None);
    runner.add_player("dev", seat, Some(manager.train_channel()), None);

    let mut context = Context::new();
    context.push_env_thread(Box::new(runner));
    context.start();

    wait_until("the games to finish", 300, || context.terminated());
    wait_until("trajectories in the replay buffer", 60, || manager.buffer_num_add() >= 2);

    let samples = manager.sample(2);
    assert!(samples.contains_key("predict_pi"));
    assert!(samples.contains_key("predict_pi_mask"));
    // two end-state planes plus one future state, on the raw features
    assert_eq!(samples["predict_pi"].shape(), &[2, 6, 3, 3]);

    context.terminate();
    manager.shutdown();
}

#[test]
fn one_player_selfplay_emits_trajectories() {
    use pz_nn::GraphConfig;

    // minesweeper is a one-player game on a 5x5 board
    let config = GraphConfig {
        model_id: "dev".to_string(),
        feature_size: vec! [2, 5, 5],
        action_size: vec! [1, 5, 5],
        num_blocks: 1,
        num_channels: 8,
        value_outputs: 1,
        rnn_channels: 0,
        rnn_seqlen: 0
    };
    let manager = ModelManager::new(ScriptModule::new(config), 4, 1, &[Device::Cpu], 64, 1, 128, 100);
    manager.start();

    let actor = Arc::new(Actor::new(
        manager.act_channels().get(0).cloned(),
        &[2, 5, 5],
        &[1, 5, 5],
        &[],
        0,
        false,
        true,
        true,
        Some(manager.clone())
    ));
    let option = MctsOption {
        puct: 1.5,
        num_rollout_per_thread: 8,
        virtual_loss: 1.0,
        ..MctsOption::default()
    };
    let seat = Arc::new(Player::Mcts(MctsPlayer::new(option, actor)));

    let mut runner = GameRunner::new("Minesweeper_5_5_3", 2, false, 2, 0, false, 0, 11);
    runner.add_player("dev", seat, Some(manager.train_channel()), None);

    let mut context = Context::new();
    context.push_env_thread(Box::new(runner));
    context.start();

    wait_until("the games to finish", 300, || context.terminated());
    wait_until("trajectories in the replay buffer", 60, || manager.buffer_num_add() >= 2);

    let samples = manager.sample(2);
    assert_eq!(samples["s"].shape(), &[2, 2, 5, 5]);

    context.terminate();
    manager.shutdown();
}

#[test]
fn eval_game_results_are_zero_sum() {
    use pz_tube::EnvThread;

    let manager = toy_manager();
    manager.start();

    let seat = mcts_seat(&manager, 8);
    let mut runner = GameRunner::new("TicTacToe", 1, true, 1, 0, false, 0, 5);
    runner.add_player("dev", seat.clone(), None, None);
    runner.add_player("candidate", seat, None, None);

    runner.main_loop();

    let results = runner.results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0] + results[1], 0.0);

    manager.shutdown();
}
