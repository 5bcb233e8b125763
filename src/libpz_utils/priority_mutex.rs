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

use std::cell::{Cell, UnsafeCell};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

thread_local! {
    static PRIORITY: Cell<i32> = Cell::new(0);
}

/// Set the priority used by the calling thread for all subsequent
/// `PriorityMutex::lock` calls. Lower values acquire the mutex first.
///
/// # Arguments
///
/// * `priority` -
///
pub fn set_thread_priority(priority: i32) {
    PRIORITY.with(|p| p.set(priority));
}

/// Returns the priority of the calling thread.
pub fn thread_priority() -> i32 {
    PRIORITY.with(|p| p.get())
}

struct Waiter {
    granted: Mutex<bool>,
    cond: Condvar,
    priority: i32,
    seq: u64
}

struct Inner {
    locked: bool,
    next_seq: u64,
    queue: Vec<Arc<Waiter>>
}

/// A mutex where threads are strictly ordered by their priority when
/// waiting to acquire the lock. Waiters with a lower priority value are
/// served first; equal priorities are FIFO. Threads set their priority with
/// `set_thread_priority` before locking.
pub struct PriorityMutex<T> {
    inner: Mutex<Inner>,
    data: UnsafeCell<T>
}

unsafe impl<T: Send> Send for PriorityMutex<T> { }
unsafe impl<T: Send> Sync for PriorityMutex<T> { }

pub struct PriorityMutexGuard<'a, T> {
    mutex: &'a PriorityMutex<T>
}

impl<T> PriorityMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                locked: false,
                next_seq: 0,
                queue: Vec::new()
            }),
            data: UnsafeCell::new(data)
        }
    }

    /// Acquire the mutex, waiting in priority order if it is currently
    /// held. Ownership of the lock is handed directly to the woken waiter
    /// on unlock, so a late arrival can never barge past a queued thread of
    /// lower (or equal) priority.
    pub fn lock(&self) -> PriorityMutexGuard<T> {
        let waiter = {
            let mut inner = self.inner.lock().expect("could not acquire lock state");

            if !inner.locked {
                inner.locked = true;
                return PriorityMutexGuard { mutex: self };
            }

            let waiter = Arc::new(Waiter {
                granted: Mutex::new(false),
                cond: Condvar::new(),
                priority: thread_priority(),
                seq: inner.next_seq
            });
            inner.next_seq += 1;

            let at = inner.queue.iter()
                .position(|other| {
                    (other.priority, other.seq) > (waiter.priority, waiter.seq)
                })
                .unwrap_or(inner.queue.len());
            inner.queue.insert(at, waiter.clone());
            waiter
        };

        let mut granted = waiter.granted.lock().expect("could not acquire waiter state");

        while !*granted {
            granted = waiter.cond.wait(granted).expect("could not wait for grant");
        }

        PriorityMutexGuard { mutex: self }
    }

    fn unlock(&self) {
        let next = {
            let mut inner = self.inner.lock().expect("could not acquire lock state");

            if inner.queue.is_empty() {
                inner.locked = false;
                None
            } else {
                Some(inner.queue.remove(0))
            }
        };

        if let Some(waiter) = next {
            *waiter.granted.lock().expect("could not acquire waiter state") = true;
            waiter.cond.notify_one();
        }
    }

    /// Returns a mutable reference to the protected value without locking.
    /// Safe because `&mut self` guarantees exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T> Deref for PriorityMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for PriorityMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for PriorityMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn exclusive() {
        let mutex = Arc::new(PriorityMutex::new(0usize));
        let handles = (0..8).map(|_| {
            let mutex = mutex.clone();

            thread::spawn(move || {
                for _ in 0..100 {
                    *mutex.lock() += 1;
                }
            })
        }).collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*mutex.lock(), 800);
    }

    #[test]
    fn strict_priority_order() {
        let mutex = Arc::new(PriorityMutex::new(Vec::new()));
        let guard = mutex.lock();

        let handles = [5, 1, 3].iter().map(|&priority| {
            let mutex = mutex.clone();
            let handle = thread::spawn(move || {
                set_thread_priority(priority);
                mutex.lock().push(priority);
            });

            // stagger the arrivals so that every waiter is queued before the
            // main thread releases the lock
            thread::sleep(Duration::from_millis(10));
            handle
        }).collect::<Vec<_>>();

        thread::sleep(Duration::from_millis(10));
        drop(guard);

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*mutex.lock(), vec! [1, 3, 5]);
    }

    #[test]
    fn same_priority_is_fifo() {
        let mutex = Arc::new(PriorityMutex::new(Vec::new()));
        let guard = mutex.lock();

        let handles = (0..4).map(|i| {
            let mutex = mutex.clone();
            let handle = thread::spawn(move || {
                mutex.lock().push(i);
            });

            thread::sleep(Duration::from_millis(10));
            handle
        }).collect::<Vec<_>>();

        drop(guard);

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*mutex.lock(), vec! [0, 1, 2, 3]);
    }
}
