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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use pz_utils::Stats;

use crate::env_thread::{EnvThread, StatsHandle, Terminate};

/// Owns a set of environment threads and their lifecycle. Threads are
/// registered before `start`, run until they finish or the context is
/// terminated, and are joined on drop.
pub struct Context {
    envs: Vec<Box<dyn EnvThread>>,
    terminates: Vec<Terminate>,
    terminators: Vec<Box<dyn Fn() + Send + Sync>>,
    stats: Vec<StatsHandle>,
    threads: Vec<JoinHandle<()>>,
    num_terminated: Arc<AtomicUsize>,
    num_envs: usize,
    started: bool
}

impl Context {
    pub fn new() -> Self {
        Self {
            envs: Vec::new(),
            terminates: Vec::new(),
            terminators: Vec::new(),
            stats: Vec::new(),
            threads: Vec::new(),
            num_terminated: Arc::new(AtomicUsize::new(0)),
            num_envs: 0,
            started: false
        }
    }

    /// Register an environment thread. Returns the number of registered
    /// threads. Panics if the context has already been started.
    ///
    /// # Arguments
    ///
    /// * `env` -
    ///
    pub fn push_env_thread(&mut self, env: Box<dyn EnvThread>) -> usize {
        assert!(!self.started, "cannot add threads to a started context");

        self.terminates.push(env.terminate());
        self.terminators.push(env.terminator());
        self.stats.push(env.stats());
        self.envs.push(env);
        self.num_envs = self.envs.len();
        self.num_envs
    }

    /// Start every registered environment thread.
    pub fn start(&mut self) {
        assert!(!self.started);
        self.started = true;

        for (i, mut env) in self.envs.drain(..).enumerate() {
            let num_terminated = self.num_terminated.clone();

            self.threads.push(
                thread::Builder::new()
                    .name(format!("game thread {}", i))
                    .spawn(move || {
                        env.main_loop();
                        num_terminated.fetch_add(1, Ordering::AcqRel);
                    })
                    .expect("could not spawn game thread")
            );
        }
    }

    /// Returns true once every environment thread has exited its loop.
    pub fn terminated(&self) -> bool {
        self.num_terminated.load(Ordering::Acquire) == self.num_envs
    }

    /// Request termination of every environment thread and join them.
    pub fn terminate(&mut self) {
        for terminate in &self.terminates {
            terminate.set();
        }
        for terminator in &self.terminators {
            terminator();
        }
        for thread in self.threads.drain(..) {
            thread.join().expect("could not join game thread");
        }
    }

    /// Aggregate the statistics of every environment thread.
    pub fn stats(&self) -> Stats {
        let mut out = Stats::new();

        for handle in &self.stats {
            out.merge(&handle.lock().expect("could not acquire stats"));
        }

        out
    }

    pub fn stats_string(&self) -> String {
        self.stats().to_string()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct CountingEnv {
        terminate: Terminate,
        stats: StatsHandle,
        limit: usize
    }

    impl CountingEnv {
        fn new(limit: usize) -> Self {
            Self {
                terminate: Terminate::new(),
                stats: Arc::new(Mutex::new(Stats::new())),
                limit
            }
        }
    }

    impl EnvThread for CountingEnv {
        fn main_loop(&mut self) {
            for i in 0..self.limit {
                if self.terminate.is_set() {
                    break;
                }

                self.stats.lock().unwrap().record("iterations", i as f64);
                thread::sleep(Duration::from_millis(1));
            }
        }

        fn terminate(&self) -> Terminate {
            self.terminate.clone()
        }

        fn stats(&self) -> StatsHandle {
            self.stats.clone()
        }
    }

    #[test]
    fn run_to_completion() {
        let mut context = Context::new();
        context.push_env_thread(Box::new(CountingEnv::new(3)));
        context.push_env_thread(Box::new(CountingEnv::new(3)));
        context.start();

        while !context.terminated() {
            thread::sleep(Duration::from_millis(1));
        }

        let stats = context.stats();
        assert_eq!(stats.get("iterations").unwrap().0, 6.0);
    }

    #[test]
    fn terminate_stops_loops() {
        let mut context = Context::new();
        context.push_env_thread(Box::new(CountingEnv::new(1_000_000)));
        context.start();
        context.terminate();

        assert!(context.terminated());
    }
}
