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

pub mod actor;
pub mod options;
pub mod policy;
pub mod results;
pub mod search;
pub mod tree;

pub use self::actor::{Actor, PiVal};
pub use self::options::MctsOption;
pub use self::results::MctsResult;
pub use self::search::MctsPlayer;
pub use self::tree::PersistentTree;
