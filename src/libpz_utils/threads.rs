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

use std::cmp::min;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config;

/// Run `f` once for every element of `items`, spreading the work over the
/// configured number of worker threads. Items are claimed by an atomic
/// cursor so uneven workloads balance out. Returns once every element has
/// been processed.
///
/// # Arguments
///
/// * `items` - the elements to process
/// * `f` - the callback, called with the element index and the element
///
pub fn parallel_for<T, F>(items: &mut [T], f: F)
    where T: Send,
          F: Fn(usize, &mut T) + Sync
{
    let num_workers = min(*config::NUM_THREADS, items.len());

    if num_workers <= 1 {
        for (i, item) in items.iter_mut().enumerate() {
            f(i, item);
        }

        return;
    }

    let len = items.len();
    let base = items.as_mut_ptr() as usize;
    let next = AtomicUsize::new(0);
    let f = &f;

    crossbeam_utils::thread::scope(|s| {
        for _ in 0..num_workers {
            let next = &next;

            s.spawn(move |_| {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= len {
                        break;
                    }

                    // each index is claimed by exactly one worker, so the
                    // references handed out are disjoint
                    let item = unsafe { &mut *(base as *mut T).add(i) };
                    f(i, item);
                }
            });
        }
    }).expect("could not run worker pool");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_items_processed_once() {
        let mut items = vec! [0usize; 1000];
        parallel_for(&mut items, |i, item| *item = i + 1);

        for (i, item) in items.iter().enumerate() {
            assert_eq!(*item, i + 1);
        }
    }

    #[test]
    fn empty() {
        let mut items: Vec<usize> = vec! [];
        parallel_for(&mut items, |_, _| panic!("should not be called"));
    }

    #[test]
    fn single_item() {
        let mut items = vec! [41usize];
        parallel_for(&mut items, |_, item| *item += 1);

        assert_eq!(items, vec! [42]);
    }
}
