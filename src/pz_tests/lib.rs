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

use std::time::{Duration, Instant};

use pz_nn::GraphConfig;

/// A small tic-tac-toe-sized model used by the end-to-end tests.
pub fn toy_graph_config() -> GraphConfig {
    GraphConfig {
        model_id: "dev".to_string(),
        feature_size: vec! [2, 3, 3],
        action_size: vec! [1, 3, 3],
        num_blocks: 1,
        num_channels: 8,
        value_outputs: 1,
        rnn_channels: 0,
        rnn_seqlen: 0
    }
}

/// Spin until `predicate` holds, panicking after `seconds`.
///
/// # Arguments
///
/// * `what` -
/// * `seconds` -
/// * `predicate` -
///
pub fn wait_until<F: Fn() -> bool>(what: &str, seconds: u64, predicate: F) {
    let deadline = Instant::now() + Duration::from_secs(seconds);

    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}
