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

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use pz_core::{GameRunner, HumanPlayer, Player};
use pz_mcts::{Actor, MctsOption, MctsPlayer};
use pz_nn::{Device, GraphConfig, ModelManager, ScriptModule};
use pz_tube::{Context, DataChannel};
use pz_utils::config;

/// Build the scripted model: the artifact on disk when it exists, a
/// freshly initialized model matching the game otherwise.
fn load_module() -> ScriptModule {
    match pz_nn::load(&*config::MODEL) {
        Ok(module) => {
            info!("loaded model '{}' from {}", module.model_id(), *config::MODEL);
            module
        },
        Err(reason) => {
            warn!("could not load {} ({}), starting from a fresh model", *config::MODEL, reason);
            fresh_module()
        }
    }
}

fn fresh_module() -> ScriptModule {
    let state = pz_games::new_state(&config::GAME, *config::SEED)
        .unwrap_or_else(|| panic!("unknown game '{}'", *config::GAME));

    ScriptModule::new(GraphConfig {
        model_id: "dev".to_string(),
        feature_size: state.get_feature_size(),
        action_size: state.get_action_size(),
        num_blocks: *config::NUM_BLOCKS,
        num_channels: *config::NUM_CHANNELS,
        value_outputs: *config::VALUE_OUTPUTS,
        rnn_channels: *config::RNN_CHANNELS,
        rnn_seqlen: *config::RNN_SEQLEN
    })
}

fn devices() -> Vec<Device> {
    config::DEVICES.split(',')
        .map(|text| Device::parse(text.trim()).unwrap_or_else(|| panic!("unknown device '{}'", text)))
        .collect()
}

fn new_manager(module: ScriptModule, num_act_channels: usize) -> Arc<ModelManager> {
    ModelManager::new(
        module,
        *config::ACT_BATCH_SIZE,
        num_act_channels,
        &devices(),
        *config::REPLAY_CAPACITY,
        *config::SEED,
        *config::TRAIN_CHANNEL_SLOTS,
        *config::TRAIN_CHANNEL_TIMEOUT_MS
    )
}

fn new_actor(manager: &Arc<ModelManager>, dc: Option<Arc<DataChannel>>) -> Arc<Actor> {
    let state = pz_games::new_state(&config::GAME, *config::SEED)
        .unwrap_or_else(|| panic!("unknown game '{}'", *config::GAME));

    Arc::new(Actor::new(
        dc,
        &state.get_feature_size(),
        &state.get_action_size(),
        &manager.rnn_state_size(),
        manager.rnn_seqlen(),
        manager.value_outputs() == 3,
        true,
        true,
        Some(manager.clone())
    ))
}

/// Drive self-play: one model manager, one game thread per `--num-games`,
/// trajectories into the local replay buffer or up to the learner.
fn selfplay() {
    let devices = devices();
    let manager = new_manager(load_module(), devices.len());
    manager.start();

    if !config::SERVER_CONNECT.is_empty() {
        manager.set_is_tournament_opponent(*config::TOURNAMENT_OPPONENT);
        manager.start_client(&config::SERVER_CONNECT);
    }

    let act_channels = manager.act_channels();
    let option = MctsOption::from_config();
    let mut context = Context::new();

    for i in 0..*config::NUM_GAMES {
        let dc = act_channels.get(i % act_channels.len().max(1)).cloned();
        let actor = new_actor(&manager, dc);
        let player = Arc::new(Player::Mcts(MctsPlayer::new(option.clone(), actor)));

        let mut runner = GameRunner::new(
            &config::GAME,
            *config::NUM_EPISODE,
            false,
            *config::PER_THREAD_BATCH_SIZE,
            *config::MAX_REWINDS,
            *config::PREDICT_END_STATE,
            *config::PREDICT_N_STATES,
            *config::SEED + i as u64
        );
        runner.add_player("dev", player.clone(), Some(manager.train_channel()), None);
        runner.add_player("dev", player, Some(manager.train_channel()), None);

        context.push_env_thread(Box::new(runner));
    }

    context.start();

    while !context.terminated() {
        thread::sleep(Duration::from_secs(10));

        println!("{}", context.stats_string());
        println!(
            "replay buffer: size={}, num_add={}, num_sample={}",
            manager.buffer_size(),
            manager.buffer_num_add(),
            manager.buffer_num_sample()
        );
    }

    context.terminate();
    manager.shutdown();
}

/// Run the learner side: bind the endpoint and collect trajectories into
/// the replay buffer.
fn server() {
    let manager = new_manager(load_module(), 0);
    manager.start();

    let listen: &str = if config::SERVER_LISTEN.is_empty() {
        "0.0.0.0:5611"
    } else {
        &config::SERVER_LISTEN
    };
    let addr = manager.start_server(listen).expect("could not bind learner endpoint");
    info!("learner listening on {}", addr);

    // publish the starting model so clients have something to act with
    {
        let module = load_module();
        manager.add_tournament_model("dev", module.state_dict());
    }

    loop {
        thread::sleep(Duration::from_secs(10));

        println!(
            "replay buffer: size={}, num_add={}, num_sample={}",
            manager.buffer_size(),
            manager.buffer_num_add(),
            manager.buffer_num_sample()
        );
    }
}

/// A single interactive (or model-vs-model) game.
fn eval() {
    let manager = new_manager(load_module(), 1);
    manager.start();

    let act_channels = manager.act_channels();
    let option = MctsOption::from_config();

    let mut runner = GameRunner::new(&config::GAME, 1, true, 1, 0, false, 0, *config::SEED);

    if *config::HUMAN {
        runner.add_player("human", Arc::new(Player::Human(HumanPlayer)), None, None);
    } else {
        let actor = new_actor(&manager, act_channels.get(0).cloned());
        let player = Arc::new(Player::Mcts(MctsPlayer::new(option.clone(), actor)));
        runner.add_player("candidate", player, None, None);
    }

    let actor = new_actor(&manager, act_channels.get(0).cloned());
    let player = Arc::new(Player::Mcts(MctsPlayer::new(option, actor)));
    runner.add_player("dev", player, None, None);

    let mut context = Context::new();
    context.push_env_thread(Box::new(runner));
    context.start();

    while !context.terminated() {
        thread::sleep(Duration::from_millis(100));
    }

    println!("{}", context.stats_string());
    context.terminate();
    manager.shutdown();
}

/// Write a freshly initialized model artifact for the configured game.
fn init_model() {
    let module = fresh_module();

    pz_nn::save(&*config::MODEL, &module).expect("could not write the model artifact");
    println!("wrote {}", *config::MODEL);
}

fn main() {
    env_logger::init();

    let mode = env::args().nth(1).unwrap_or_default();

    match mode.as_str() {
        "server" => server(),
        "eval" => eval(),
        "init-model" => init_model(),
        "selfplay" | "" => selfplay(),
        other if other.starts_with("--") => selfplay(),
        other => {
            eprintln!("unknown mode '{}'; expected selfplay, server, eval, or init-model", other);
            std::process::exit(1);
        }
    }
}
