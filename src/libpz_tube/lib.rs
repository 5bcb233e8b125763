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

mod context;
mod data_channel;
mod dispatcher;
mod env_thread;
mod replay_buffer;
pub mod client;
pub mod server;
pub mod wire;

pub use self::context::Context;
pub use self::data_channel::DataChannel;
pub use self::dispatcher::{DispatchError, Dispatcher};
pub use self::env_thread::{EnvThread, StatsHandle, Terminate};
pub use self::replay_buffer::ReplayBuffer;
