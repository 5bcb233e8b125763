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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pz_utils::Stats;

/// Shared running statistics of an environment thread.
pub type StatsHandle = Arc<Mutex<Stats>>;

/// A shared termination flag. Cloning shares the flag.
#[derive(Clone, Default)]
pub struct Terminate {
    flag: Arc<AtomicBool>
}

impl Terminate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A long-running environment loop owned by a `Context`. The value is
/// moved into its thread on start, so termination and statistics go
/// through shared handles obtained up front.
pub trait EnvThread: Send {
    /// Run until finished or terminated.
    fn main_loop(&mut self);

    /// The flag checked by `main_loop`; setting it must cause the loop to
    /// exit at the next opportunity.
    fn terminate(&self) -> Terminate;

    /// Extra teardown performed when the context terminates (e.g. waking
    /// any data channel the loop might be blocked on).
    fn terminator(&self) -> Box<dyn Fn() + Send + Sync> {
        Box::new(|| { })
    }

    /// The statistics collected by this thread.
    fn stats(&self) -> StatsHandle;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_is_shared() {
        let a = Terminate::new();
        let b = a.clone();

        assert!(!b.is_set());
        a.set();
        assert!(b.is_set());
    }
}
