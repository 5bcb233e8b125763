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

#[macro_use] extern crate lazy_static;

pub mod b85;
pub mod config;
pub mod priority_mutex;
pub mod rng;
pub mod stats;
pub mod thread_id;
pub mod threads;

pub use self::priority_mutex::{set_thread_priority, thread_priority, PriorityMutex};
pub use self::stats::Stats;
pub use self::thread_id::thread_id;
