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

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use pz_tensor::{push_left, DataBlock, Tensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotStatus {
    Avail,
    Filled,
    FilledAutoRelease,
    Replied
}

struct State {
    terminated: bool,
    status: Vec<SlotStatus>,
    avail_slots: Vec<usize>,
    num_filled: usize,

    // slots returned by a partial `get_input`, remembered for `set_reply`
    sent_slots: Vec<usize>,

    // while true a partial batch is being serviced and no new slot may be
    // marked filled
    consumer_hold: bool,

    send_buffers: HashMap<String, Tensor>,
    reply_buffers: HashMap<String, Tensor>
}

/// A batch rendezvous between many producers and a single consumer. Each of
/// the `batchsize` slots cycles through
/// `Avail -> Filled | FilledAutoRelease -> Replied -> Avail`; the consumer
/// sees the input buffer once every slot is filled (or, with a timeout, a
/// slice of the filled rows).
pub struct DataChannel {
    pub name: String,
    pub batchsize: usize,
    pub timeout_ms: i64,

    state: Mutex<State>,
    cv_filled: Condvar,
    cv_replied: Condvar,
    cv_avail: Condvar
}

impl DataChannel {
    /// Create a new channel.
    ///
    /// # Arguments
    ///
    /// * `name` -
    /// * `batchsize` - the number of slots
    /// * `timeout_ms` - consumer timeout; negative waits for a full batch,
    ///   zero returns as soon as any slot is filled, positive waits at most
    ///   that long for a full batch before returning a slice
    ///
    pub fn new(name: &str, batchsize: usize, timeout_ms: i64) -> Self {
        assert!(batchsize > 0, "data channel {} requires at least one slot", name);

        Self {
            name: name.into(),
            batchsize,
            timeout_ms,
            state: Mutex::new(State {
                terminated: false,
                status: vec! [SlotStatus::Avail; batchsize],
                avail_slots: (0..batchsize).collect(),
                num_filled: 0,
                sent_slots: Vec::new(),
                consumer_hold: false,
                send_buffers: HashMap::new(),
                reply_buffers: HashMap::new()
            }),
            cv_filled: Condvar::new(),
            cv_replied: Condvar::new(),
            cv_avail: Condvar::new()
        }
    }

    fn lock(&self) -> MutexGuard<State> {
        self.state.lock().expect("could not acquire channel state")
    }

    /// On the first call, allocate per-key input and reply buffers with an
    /// outer dimension of `batchsize`. On later calls, assert that the
    /// blocks match the existing buffers.
    ///
    /// # Arguments
    ///
    /// * `send` -
    /// * `reply` -
    ///
    pub fn create_or_check_buffers(&self, send: &[Arc<DataBlock>], reply: &[Arc<DataBlock>]) {
        assert!(!send.is_empty() || !reply.is_empty());

        let mut state = self.lock();

        if state.send_buffers.is_empty() && state.reply_buffers.is_empty() {
            for block in send {
                let shape = push_left(self.batchsize as i64, block.sizes());
                let prev = state.send_buffers.insert(block.name.clone(), Tensor::zeros(&shape, block.dtype()));
                assert!(prev.is_none(), "duplicate send key {}", block.name);
            }
            for block in reply {
                let shape = push_left(self.batchsize as i64, block.sizes());
                let prev = state.reply_buffers.insert(block.name.clone(), Tensor::zeros(&shape, block.dtype()));
                assert!(prev.is_none(), "duplicate reply key {}", block.name);
            }
        } else {
            check_buffers(self.batchsize, send, &state.send_buffers);
            check_buffers(self.batchsize, reply, &state.reply_buffers);
        }
    }

    /// Wake every waiter; all subsequent blocking operations return
    /// immediately.
    pub fn terminate(&self) {
        let mut state = self.lock();
        state.terminated = true;

        self.cv_filled.notify_all();
        self.cv_replied.notify_all();
        self.cv_avail.notify_all();
    }

    pub fn terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Block until a free slot exists and claim it. Returns `None` once the
    /// channel is terminated.
    pub fn get_slot(&self) -> Option<usize> {
        let mut state = self.lock();

        while state.avail_slots.is_empty() && !state.terminated {
            state = self.cv_avail.wait(state).expect("could not wait for slot");
        }

        if state.terminated {
            return None;
        }

        let slot = state.avail_slots.pop().expect("no available slot");
        assert_eq!(state.status[slot], SlotStatus::Avail);

        Some(slot)
    }

    /// Copy each block into its row of the input buffer for the given slot.
    /// The slot must be owned by the caller (claimed and not yet filled).
    ///
    /// # Arguments
    ///
    /// * `slot` -
    /// * `blocks` -
    ///
    pub fn fill_slot(&self, slot: usize, blocks: &[Arc<DataBlock>]) {
        let mut state = self.lock();
        assert_eq!(state.status[slot], SlotStatus::Avail);

        for block in blocks {
            let src = block.snapshot();
            let buffer = state.send_buffers.get_mut(&block.name)
                .unwrap_or_else(|| panic!("unknown send key {}", block.name));

            buffer.copy_row_from(slot, &src);
        }
    }

    fn mark_filled(&self, slot: usize, status: SlotStatus) {
        let mut state = self.lock();

        while state.consumer_hold && !state.terminated {
            state = self.cv_filled.wait(state).expect("could not wait for consumer");
        }
        if state.terminated {
            return;
        }

        assert_eq!(state.status[slot], SlotStatus::Avail);
        state.status[slot] = status;
        state.num_filled += 1;
        assert!(state.num_filled <= self.batchsize);

        if state.num_filled == self.batchsize {
            drop(state);
            self.cv_filled.notify_all();
        }
    }

    pub fn mark_slot_filled(&self, slot: usize) {
        self.mark_filled(slot, SlotStatus::Filled);
    }

    pub fn mark_slot_filled_auto_release(&self, slot: usize) {
        self.mark_filled(slot, SlotStatus::FilledAutoRelease);
    }

    /// Consumer side. Block according to `timeout_ms` and return the input
    /// buffer (or a slice of the filled rows), keyed by block name. Returns
    /// `None` once the channel is terminated.
    pub fn get_input(&self) -> Option<HashMap<String, Tensor>> {
        let mut state = self.lock();

        if self.timeout_ms < 0 {
            while !state.terminated && state.num_filled != self.batchsize {
                state = self.cv_filled.wait(state).expect("could not wait for batch");
            }
            if state.terminated {
                return None;
            }

            return Some(state.send_buffers.clone());
        }

        if self.timeout_ms == 0 {
            while !state.terminated && state.num_filled == 0 {
                state = self.cv_filled.wait(state).expect("could not wait for batch");
            }
        } else {
            let timeout = Duration::from_millis(self.timeout_ms as u64);

            loop {
                let (guard, result) = self.cv_filled.wait_timeout_while(state, timeout, |s| {
                    !s.terminated && s.num_filled != s.status.len()
                }).expect("could not wait for batch");
                state = guard;

                if !result.timed_out() || state.num_filled != 0 || state.terminated {
                    break;
                }
            }
        }

        if state.terminated {
            return None;
        }
        if state.num_filled == self.batchsize {
            return Some(state.send_buffers.clone());
        }

        // a partial batch; remember the slice and block new fills until the
        // reply has been written
        assert!(state.sent_slots.is_empty());
        let sent_slots = (0..self.batchsize)
            .filter(|&i| {
                state.status[i] == SlotStatus::Filled || state.status[i] == SlotStatus::FilledAutoRelease
            })
            .collect::<Vec<_>>();
        assert!(sent_slots.len() < self.batchsize);

        let sliced = state.send_buffers.iter()
            .map(|(name, tensor)| (name.clone(), tensor.select_rows(&sent_slots)))
            .collect();

        state.sent_slots = sent_slots;
        state.consumer_hold = true;

        Some(sliced)
    }

    /// Consumer side. Write the reply for the batch returned by the last
    /// `get_input` and hand every filled slot back to its producer.
    ///
    /// # Arguments
    ///
    /// * `reply` - reply tensors, either full batches or slices matching
    ///   the last partial `get_input`
    ///
    pub fn set_reply(&self, reply: &HashMap<String, Tensor>) {
        let mut state = self.lock();

        assert_eq!(reply.len(), state.reply_buffers.len(), "{}: reply key count mismatch", self.name);

        if state.sent_slots.is_empty() {
            assert_eq!(
                state.num_filled, self.batchsize,
                "{}: set_reply with {} of {} slots filled", self.name, state.num_filled, self.batchsize
            );

            for (name, src) in reply {
                let dst = state.reply_buffers.get_mut(name)
                    .unwrap_or_else(|| panic!("unknown reply key {}", name));
                dst.copy_from(src);
            }
        } else {
            assert!(state.num_filled < self.batchsize);

            let sent_slots = state.sent_slots.clone();
            for (name, src) in reply {
                let dst = state.reply_buffers.get_mut(name)
                    .unwrap_or_else(|| panic!("unknown reply key {}", name));
                dst.index_copy_rows(&sent_slots, src);
            }
        }

        state.num_filled = 0;

        let mut released = false;
        for i in 0..self.batchsize {
            match state.status[i] {
                SlotStatus::Filled => {
                    state.status[i] = SlotStatus::Replied;
                },
                SlotStatus::FilledAutoRelease => {
                    state.status[i] = SlotStatus::Avail;
                    state.avail_slots.push(i);
                    released = true;
                },
                _ => { }
            }
        }

        state.sent_slots.clear();
        state.consumer_hold = false;
        drop(state);

        self.cv_replied.notify_all();
        self.cv_filled.notify_all();
        if released {
            self.cv_avail.notify_all();
        }
    }

    /// Producer side. Wait until the given slot has been replied to, then
    /// copy the reply row into each block. Returns false if the channel
    /// terminated before a reply arrived.
    ///
    /// # Arguments
    ///
    /// * `slot` -
    /// * `blocks` -
    ///
    pub fn get_reply(&self, slot: usize, blocks: &[Arc<DataBlock>]) -> bool {
        let mut state = self.lock();

        while state.status[slot] != SlotStatus::Replied && !state.terminated {
            state = self.cv_replied.wait(state).expect("could not wait for reply");
        }

        if state.status[slot] != SlotStatus::Replied {
            return false;
        }

        for block in blocks {
            let buffer = state.reply_buffers.get(&block.name)
                .unwrap_or_else(|| panic!("unknown reply key {}", block.name));

            block.set(&buffer.select_row(slot));
        }

        true
    }

    /// Producer side. Return the slot to the free list.
    ///
    /// # Arguments
    ///
    /// * `slot` -
    ///
    pub fn release_slot(&self, slot: usize) {
        let mut state = self.lock();

        state.status[slot] = SlotStatus::Avail;
        state.avail_slots.push(slot);
        drop(state);

        self.cv_avail.notify_one();
    }

    /// Returns `(avail, filled, replied)` slot counts.
    pub fn slot_counts(&self) -> (usize, usize, usize) {
        let state = self.lock();
        let mut counts = (0, 0, 0);

        for status in &state.status {
            match status {
                SlotStatus::Avail => counts.0 += 1,
                SlotStatus::Filled | SlotStatus::FilledAutoRelease => counts.1 += 1,
                SlotStatus::Replied => counts.2 += 1
            }
        }

        counts
    }
}

fn check_buffers(batchsize: usize, blocks: &[Arc<DataBlock>], buffers: &HashMap<String, Tensor>) {
    let mut num_buffers = 0;

    for block in blocks {
        let buffer = buffers.get(&block.name)
            .unwrap_or_else(|| panic!("unknown key {}", block.name));
        let expected = push_left(batchsize as i64, block.sizes());

        assert_eq!(buffer.shape(), &expected[..], "buffer {} shape mismatch", block.name);
        assert_eq!(buffer.dtype(), block.dtype(), "buffer {} dtype mismatch", block.name);
        num_buffers += 1;
    }

    assert_eq!(num_buffers, buffers.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_tensor::Dtype;
    use std::thread;

    fn spawn_producer(dc: Arc<DataChannel>, value: f32) -> thread::JoinHandle<f32> {
        thread::spawn(move || {
            let s = Arc::new(DataBlock::new("s", &[1], Dtype::F32));
            let a = Arc::new(DataBlock::new("a", &[1], Dtype::F32));
            dc.create_or_check_buffers(&[s.clone()], &[a.clone()]);

            s.set(&Tensor::scalar(value));

            let slot = dc.get_slot().expect("channel terminated");
            dc.fill_slot(slot, &[s.clone()]);
            dc.mark_slot_filled(slot);
            assert!(dc.get_reply(slot, &[a.clone()]));
            dc.release_slot(slot);

            a.snapshot().as_f32()[0]
        })
    }

    #[test]
    fn full_batch() {
        let dc = Arc::new(DataChannel::new("test", 4, -1));
        let producers = (0..4)
            .map(|i| spawn_producer(dc.clone(), i as f32))
            .collect::<Vec<_>>();

        let consumer = {
            let dc = dc.clone();

            thread::spawn(move || {
                let input = dc.get_input().expect("terminated");
                let s = &input["s"];
                assert_eq!(s.shape(), &[4, 1]);

                let mut reply = HashMap::new();
                let a = Tensor::from_f32(&[4, 1], s.as_f32().iter().map(|x| x + 1.0).collect());
                reply.insert("a".to_string(), a);
                dc.set_reply(&reply);
            })
        };

        for (i, producer) in producers.into_iter().enumerate() {
            assert_eq!(producer.join().unwrap(), i as f32 + 1.0);
        }

        consumer.join().unwrap();
    }

    #[test]
    fn timeout_slice() {
        let dc = Arc::new(DataChannel::new("test", 4, 10));
        let producers = (0..2)
            .map(|i| spawn_producer(dc.clone(), i as f32))
            .collect::<Vec<_>>();

        let consumer = {
            let dc = dc.clone();

            thread::spawn(move || {
                let input = dc.get_input().expect("terminated");
                let s = &input["s"];
                assert_eq!(s.shape(), &[2, 1]);

                let mut reply = HashMap::new();
                let a = Tensor::from_f32(&[2, 1], s.as_f32().iter().map(|x| 2.0 * x).collect());
                reply.insert("a".to_string(), a);
                dc.set_reply(&reply);
            })
        };

        for (i, producer) in producers.into_iter().enumerate() {
            assert_eq!(producer.join().unwrap(), 2.0 * i as f32);
        }

        consumer.join().unwrap();
    }

    #[test]
    fn slot_conservation() {
        let dc = Arc::new(DataChannel::new("test", 4, -1));
        let s = Arc::new(DataBlock::new("s", &[1], Dtype::F32));
        let a = Arc::new(DataBlock::new("a", &[1], Dtype::F32));
        dc.create_or_check_buffers(&[s.clone()], &[a.clone()]);

        let (avail, filled, replied) = dc.slot_counts();
        assert_eq!(avail + filled + replied, 4);

        let slot = dc.get_slot().unwrap();
        dc.fill_slot(slot, &[s.clone()]);
        dc.mark_slot_filled(slot);

        let (avail, filled, replied) = dc.slot_counts();
        assert_eq!((avail, filled, replied), (3, 1, 0));

        dc.terminate();
        assert!(dc.get_slot().is_none());
    }

    #[test]
    fn terminate_wakes_consumer() {
        let dc = Arc::new(DataChannel::new("test", 2, -1));
        let consumer = {
            let dc = dc.clone();
            thread::spawn(move || dc.get_input())
        };

        dc.terminate();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn auto_release_returns_slot() {
        let dc = Arc::new(DataChannel::new("test", 1, -1));
        let s = Arc::new(DataBlock::new("s", &[1], Dtype::F32));
        dc.create_or_check_buffers(&[s.clone()], &[]);

        for i in 0..3 {
            let slot = dc.get_slot().unwrap();
            s.set(&Tensor::scalar(i as f32));
            dc.fill_slot(slot, &[s.clone()]);
            dc.mark_slot_filled_auto_release(slot);

            let input = dc.get_input().unwrap();
            assert_eq!(input["s"].as_f32(), &[i as f32]);
            dc.set_reply(&HashMap::new());
        }

        let (avail, filled, replied) = dc.slot_counts();
        assert_eq!((avail, filled, replied), (1, 0, 0));
    }
}
