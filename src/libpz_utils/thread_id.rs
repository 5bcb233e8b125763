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

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

static THREAD_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: Cell<usize> = Cell::new(0);
}

/// Returns a small process-unique identifier for the calling thread,
/// assigned on first use starting from `1`.
pub fn thread_id() -> usize {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(THREAD_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1);
        }

        id.get()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn stable_within_thread() {
        assert_eq!(thread_id(), thread_id());
    }

    #[test]
    fn distinct_across_threads() {
        let here = thread_id();
        let there = thread::spawn(thread_id).join().unwrap();

        assert_ne!(here, there);
    }
}
