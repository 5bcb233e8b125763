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

mod data_block;
mod tensor;
mod trajectory;

pub use self::data_block::DataBlock;
pub use self::tensor::{push_left, Dtype, Tensor};
pub use self::trajectory::{EpisodicTrajectory, FixedLengthTrajectory, IndefiniteTrajectory};
