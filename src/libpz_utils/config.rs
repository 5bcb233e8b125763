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
use std::str::FromStr;

/// Returns the value of the command-line argument `--name <value>` (or
/// `--name=<value>`), if present.
///
/// # Arguments
///
/// * `name` - the name of the argument, without the leading dashes
///
fn get_arg<T: FromStr>(name: &str) -> Option<T> {
    let mut args = env::args();
    let flag = format!("--{}", name);
    let prefix = format!("--{}=", name);

    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next().and_then(|value| value.parse::<T>().ok());
        } else if arg.starts_with(&prefix) {
            return arg[prefix.len()..].parse::<T>().ok();
        }
    }

    None
}

/// Returns the value of the environment variable `PZ_<name>`, if present.
///
/// # Arguments
///
/// * `name` - the name of the environment variable, without the prefix
///
fn get_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(format!("PZ_{}", name)).ok().and_then(|value| value.parse::<T>().ok())
}

/// Returns true if the command-line contains the flag `--name` (without a
/// value), or the environment variable `PZ_<name>` is set to `1` or `true`.
///
/// # Arguments
///
/// * `name` -
/// * `env_name` -
///
fn get_flag(name: &str, env_name: &str) -> bool {
    let flag = format!("--{}", name);

    env::args().any(|arg| arg == flag)
        || get_env::<String>(env_name).map(|s| s == "1" || s == "true").unwrap_or(false)
}

lazy_static! {
    /// The name of the game to play.
    pub static ref GAME: String = get_arg("game")
        .or_else(|| get_env("GAME"))
        .unwrap_or_else(|| "TicTacToe".into());

    /// Path to the scripted model artifact.
    pub static ref MODEL: String = get_arg("model")
        .or_else(|| get_env("MODEL"))
        .unwrap_or_else(|| "model.json".into());

    /// Comma-separated list of devices to place model replicas on.
    pub static ref DEVICES: String = get_arg("devices")
        .or_else(|| get_env("DEVICES"))
        .unwrap_or_else(|| "cpu".into());

    /// The number of worker threads in the shared task pool.
    pub static ref NUM_THREADS: usize = get_arg("num-threads")
        .or_else(|| get_env("NUM_THREADS"))
        .unwrap_or_else(num_cpus::get);

    /// The number of game threads to run.
    pub static ref NUM_GAMES: usize = get_arg("num-games")
        .or_else(|| get_env("NUM_GAMES"))
        .unwrap_or(1);

    /// The number of concurrent games inside each game thread. Negative
    /// values ask the actors for a suggested batch size.
    pub static ref PER_THREAD_BATCH_SIZE: isize = get_arg("per-thread-batch-size")
        .or_else(|| get_env("PER_THREAD_BATCH_SIZE"))
        .unwrap_or(32);

    /// The number of episodes to play before exiting, `-1` for unlimited.
    pub static ref NUM_EPISODE: i64 = get_arg("num-episode")
        .or_else(|| get_env("NUM_EPISODE"))
        .unwrap_or(-1);

    /// The maximum number of times a finished game may be rewound and
    /// replayed from its turning point.
    pub static ref MAX_REWINDS: usize = get_arg("max-rewinds")
        .or_else(|| get_env("MAX_REWINDS"))
        .unwrap_or(0);

    /// Whether to emit end-state prediction targets.
    pub static ref PREDICT_END_STATE: bool = get_flag("predict-end-state", "PREDICT_END_STATE");

    /// The number of future states to emit prediction targets for.
    pub static ref PREDICT_N_STATES: usize = get_arg("predict-n-states")
        .or_else(|| get_env("PREDICT_N_STATES"))
        .unwrap_or(0);

    /// The capacity of the replay buffer.
    pub static ref REPLAY_CAPACITY: usize = get_arg("replay-capacity")
        .or_else(|| get_env("REPLAY_CAPACITY"))
        .unwrap_or(100_000);

    /// The batch size of each act channel.
    pub static ref ACT_BATCH_SIZE: usize = get_arg("act-batch-size")
        .or_else(|| get_env("ACT_BATCH_SIZE"))
        .unwrap_or(64);

    /// The number of slots in the train channel.
    pub static ref TRAIN_CHANNEL_SLOTS: usize = get_arg("train-channel-slots")
        .or_else(|| get_env("TRAIN_CHANNEL_SLOTS"))
        .unwrap_or(1024);

    /// Timeout of the train channel consumer, in milliseconds.
    pub static ref TRAIN_CHANNEL_TIMEOUT_MS: i64 = get_arg("train-channel-timeout-ms")
        .or_else(|| get_env("TRAIN_CHANNEL_TIMEOUT_MS"))
        .unwrap_or(250);

    /// The random seed for game generation and the replay buffer.
    pub static ref SEED: u64 = get_arg("seed")
        .or_else(|| get_env("SEED"))
        .unwrap_or(123);

    /// Total wall-clock time budget per game (seconds), `0` to use a fixed
    /// rollout count instead.
    pub static ref TOTAL_TIME: f32 = get_arg("total-time")
        .or_else(|| get_env("TOTAL_TIME"))
        .unwrap_or(0.0);

    /// The fraction of the remaining time budget spent on each move.
    pub static ref TIME_RATIO: f32 = get_arg("time-ratio")
        .or_else(|| get_env("TIME_RATIO"))
        .unwrap_or(0.035);

    /// The number of rollouts per move when no time budget is set.
    pub static ref NUM_ROLLOUT: usize = get_arg("num-rollout")
        .or_else(|| get_env("NUM_ROLLOUT"))
        .unwrap_or(400);

    /// The exploration constant of the PUCT formula.
    pub static ref PUCT: f32 = get_arg("puct")
        .or_else(|| get_env("PUCT"))
        .unwrap_or(1.5);

    /// The virtual loss added to each node during selection.
    pub static ref VIRTUAL_LOSS: f32 = get_arg("virtual-loss")
        .or_else(|| get_env("VIRTUAL_LOSS"))
        .unwrap_or(1.0);

    /// Sample (instead of argmax) the move for this many opening plies.
    pub static ref SAMPLE_BEFORE_STEP_IDX: usize = get_arg("sample-before-step-idx")
        .or_else(|| get_env("SAMPLE_BEFORE_STEP_IDX"))
        .unwrap_or(0);

    /// Keep explicit game states only at tree depths that are multiples of
    /// this interval.
    pub static ref STORE_STATE_INTERVAL: usize = get_arg("store-state-interval")
        .or_else(|| get_env("STORE_STATE_INTERVAL"))
        .unwrap_or(1);

    /// Randomize the rollout budget of each search around the mean.
    pub static ref RANDOMIZED_ROLLOUTS: bool = get_flag("randomized-rollouts", "RANDOMIZED_ROLLOUTS");

    /// Pick the move with the stochastic visit-weighted rule.
    pub static ref SAMPLING_MCTS: bool = get_flag("sampling-mcts", "SAMPLING_MCTS");

    /// Minimum-visit multiplier for low-prior actions.
    pub static ref FORCED_ROLLOUTS_MULTIPLIER: f32 = get_arg("forced-rollouts-multiplier")
        .or_else(|| get_env("FORCED_ROLLOUTS_MULTIPLIER"))
        .unwrap_or(2.0);

    /// The learner endpoint to bind in the server role, e.g.
    /// `0.0.0.0:5611`.
    pub static ref SERVER_LISTEN: String = get_arg("server-listen")
        .or_else(|| get_env("SERVER_LISTEN"))
        .unwrap_or_default();

    /// The learner endpoint to connect to in the client role.
    pub static ref SERVER_CONNECT: String = get_arg("server-connect")
        .or_else(|| get_env("SERVER_CONNECT"))
        .unwrap_or_default();

    /// This process evaluates rather than trains; it may refuse model
    /// updates and publishes game results for rating bookkeeping.
    pub static ref TOURNAMENT_OPPONENT: bool = get_flag("tournament-opponent", "TOURNAMENT_OPPONENT");

    /// Seat the first player to a human in eval mode.
    pub static ref HUMAN: bool = get_flag("human", "HUMAN");

    /// Residual blocks of a freshly initialized model.
    pub static ref NUM_BLOCKS: usize = get_arg("num-blocks")
        .or_else(|| get_env("NUM_BLOCKS"))
        .unwrap_or(6);

    /// Channels of a freshly initialized model.
    pub static ref NUM_CHANNELS: usize = get_arg("num-channels")
        .or_else(|| get_env("NUM_CHANNELS"))
        .unwrap_or(64);

    /// `1` for a scalar value head, `3` for win/lose/draw logits.
    pub static ref VALUE_OUTPUTS: usize = get_arg("value-outputs")
        .or_else(|| get_env("VALUE_OUTPUTS"))
        .unwrap_or(1);

    /// Recurrent state channels of a freshly initialized model, `0` for a
    /// feed-forward model.
    pub static ref RNN_CHANNELS: usize = get_arg("rnn-channels")
        .or_else(|| get_env("RNN_CHANNELS"))
        .unwrap_or(0);

    /// Steps per training sequence for recurrent models.
    pub static ref RNN_SEQLEN: usize = get_arg("rnn-seqlen")
        .or_else(|| get_env("RNN_SEQLEN"))
        .unwrap_or(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert!(*NUM_THREADS >= 1);
        assert_eq!(*STORE_STATE_INTERVAL, 1);
        assert_eq!(*NUM_EPISODE, -1);
    }

    #[test]
    fn parse_missing_arg() {
        assert_eq!(get_arg::<usize>("no-such-argument"), None);
    }
}
