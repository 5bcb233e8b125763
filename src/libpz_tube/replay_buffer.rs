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

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor, Read};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use rand::seq::SliceRandom;

use pz_tensor::{push_left, Dtype, Tensor};
use pz_utils::rng::Xoshiro256;

const NUM_PREFETCH_THREADS: usize = 8;
const MAX_PREFETCHED_BATCHES: usize = 8;

thread_local! {
    static COMPRESSOR: RefCell<zstd::bulk::Compressor<'static>> =
        RefCell::new(zstd::bulk::Compressor::new(0).expect("could not allocate zstd context"));
    static DECOMPRESSOR: RefCell<zstd::bulk::Decompressor<'static>> =
        RefCell::new(zstd::bulk::Decompressor::new().expect("could not allocate zstd context"));
}

fn compress(data: &[u8]) -> Vec<u8> {
    COMPRESSOR.with(|c| c.borrow_mut().compress(data)).expect("replay buffer compress failed")
}

fn decompress(data: &[u8], capacity: usize) -> Vec<u8> {
    DECOMPRESSOR.with(|c| c.borrow_mut().decompress(data, capacity)).expect("replay buffer decompress failed")
}

struct BufferEntry {
    datasize: usize,
    data: Vec<u8>
}

type Sample = Vec<BufferEntry>;

#[derive(Clone)]
struct Key {
    name: String,
    shape: Vec<i64>,
    dtype: Dtype
}

struct SampleOrder {
    order: Vec<usize>,
    index: usize,
    rng: Xoshiro256
}

struct Prefetch {
    results: VecDeque<HashMap<String, Tensor>>,
    request_size: usize,
    die: bool,
    threads: Vec<JoinHandle<()>>
}

/// A fixed-capacity circular store of compressed training samples. Slots
/// are atomic pointers so that writers and readers never block each other:
/// `add` publishes a fresh sample with an atomic exchange, `sample` borrows
/// a slot by exchanging it to null for the duration of the decompression
/// and tries to put it back afterwards.
pub struct ReplayBuffer {
    pub capacity: usize,

    weak: Weak<ReplayBuffer>,
    slots: Vec<AtomicPtr<Sample>>,
    keys: Mutex<Vec<Key>>,
    has_keys: AtomicBool,
    num_add: AtomicI64,
    num_sample: AtomicI64,
    sample_state: Mutex<SampleOrder>,
    prefetch: Mutex<Prefetch>,
    cv_work: Condvar,
    cv_result: Condvar
}

fn copy_bytes_into_row(dst: &mut Tensor, row: usize, bytes: &[u8]) {
    let n = dst.row_numel();
    assert_eq!(bytes.len(), n * dst.dtype().size_of(), "decompressed size mismatch");

    match dst.dtype() {
        Dtype::F32 => {
            let values = &mut dst.as_f32_mut()[row*n..(row+1)*n];

            for (v, chunk) in values.iter_mut().zip(bytes.chunks_exact(4)) {
                *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        },
        Dtype::I64 => {
            let values = &mut dst.as_i64_mut()[row*n..(row+1)*n];

            for (v, chunk) in values.iter_mut().zip(bytes.chunks_exact(8)) {
                let mut buf = [0; 8];
                buf.copy_from_slice(chunk);
                *v = i64::from_le_bytes(buf);
            }
        }
    }
}

impl ReplayBuffer {
    /// Create a new buffer.
    ///
    /// # Arguments
    ///
    /// * `capacity` - the number of slots
    /// * `seed` - seed of the shared sampling RNG
    ///
    pub fn new(capacity: usize, seed: u64) -> Arc<Self> {
        assert!(capacity > 0);

        Arc::new_cyclic(|weak| Self {
            capacity,
            weak: weak.clone(),
            slots: (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            keys: Mutex::new(Vec::new()),
            has_keys: AtomicBool::new(false),
            num_add: AtomicI64::new(0),
            num_sample: AtomicI64::new(0),
            sample_state: Mutex::new(SampleOrder {
                order: Vec::new(),
                index: 0,
                rng: Xoshiro256::new(seed)
            }),
            prefetch: Mutex::new(Prefetch {
                results: VecDeque::new(),
                request_size: 0,
                die: false,
                threads: Vec::new()
            }),
            cv_work: Condvar::new(),
            cv_result: Condvar::new()
        })
    }

    pub fn size(&self) -> usize {
        (self.num_add.load(Ordering::Acquire)).min(self.capacity as i64) as usize
    }

    pub fn full(&self) -> bool {
        self.size() == self.capacity
    }

    pub fn num_add(&self) -> i64 {
        self.num_add.load(Ordering::Acquire)
    }

    pub fn num_sample(&self) -> i64 {
        self.num_sample.load(Ordering::Acquire)
    }

    fn keys(&self) -> Vec<Key> {
        self.keys.lock().expect("could not acquire keys").clone()
    }

    /// Add every row of the given batch to the buffer, each compressed as
    /// its own sample. The first call fixes the key schema; later calls
    /// panic on any mismatch.
    ///
    /// # Arguments
    ///
    /// * `input` - per-key tensors whose outer dimension is the batch
    ///
    pub fn add(&self, input: &HashMap<String, Tensor>) {
        if input.is_empty() {
            return;
        }

        if !self.has_keys.load(Ordering::Acquire) {
            let mut keys = self.keys.lock().expect("could not acquire keys");

            if keys.is_empty() {
                let mut names = input.keys().cloned().collect::<Vec<_>>();
                names.sort();

                for name in names {
                    let tensor = &input[&name];

                    info!("replay buffer key '{}' shape {:?}", name, tensor.shape());
                    keys.push(Key {
                        name,
                        shape: tensor.shape()[1..].to_vec(),
                        dtype: tensor.dtype()
                    });
                }

                self.has_keys.store(true, Ordering::Release);
            }
        }

        let keys = self.keys();
        assert_eq!(input.len(), keys.len(), "replay buffer keys mismatch");

        let n = input.values().next().map(|t| t.shape()[0]).unwrap_or(0);

        for key in &keys {
            let tensor = input.get(&key.name)
                .unwrap_or_else(|| panic!("replay buffer missing key '{}'", key.name));

            assert_eq!(tensor.shape()[0], n, "replay buffer batch size mismatch for '{}'", key.name);
            assert_eq!(&tensor.shape()[1..], &key.shape[..], "replay buffer shape mismatch for '{}'", key.name);
            assert_eq!(tensor.dtype(), key.dtype, "replay buffer dtype mismatch for '{}'", key.name);
        }

        for i in 0..n as usize {
            let sample = keys.iter()
                .map(|key| {
                    let raw = input[&key.name].select_row(i).data_bytes();

                    BufferEntry {
                        datasize: raw.len(),
                        data: compress(&raw)
                    }
                })
                .collect::<Sample>();

            let slot = (self.num_add.fetch_add(1, Ordering::AcqRel) % self.capacity as i64) as usize;
            let prev = self.slots[slot].swap(Box::into_raw(Box::new(sample)), Ordering::AcqRel);

            if !prev.is_null() {
                unsafe { drop(Box::from_raw(prev)); }
            }
        }
    }

    /// Borrow the given slot, decompress it into row `row` of each output
    /// tensor, and try to return it. Returns the number of rows copied
    /// (zero if another reader or writer took the slot).
    fn copy_slot(&self, slot: usize, row: usize, keys: &[Key], out: &mut HashMap<String, Tensor>) -> usize {
        let src = self.slots[slot].swap(ptr::null_mut(), Ordering::AcqRel);

        if src.is_null() {
            return 0;
        }

        {
            let sample = unsafe { &*src };

            for (key, entry) in keys.iter().zip(sample.iter()) {
                let raw = decompress(&entry.data, entry.datasize);
                let dst = out.get_mut(&key.name).expect("missing output tensor");

                copy_bytes_into_row(dst, row, &raw);
            }
        }

        // put the sample back unless someone has replaced the slot in the
        // meantime, in which case our borrowed copy is stale
        if self.slots[slot].compare_exchange(ptr::null_mut(), src, Ordering::AcqRel, Ordering::Acquire).is_err() {
            unsafe { drop(Box::from_raw(src)); }
        }

        1
    }

    fn sample_impl(&self, sample_size: usize) -> HashMap<String, Tensor> {
        let keys = self.keys();

        if keys.is_empty() {
            return HashMap::new();
        }

        let size = self.size();
        let mut out = keys.iter()
            .map(|key| {
                (key.name.clone(), Tensor::zeros(&push_left(sample_size as i64, &key.shape), key.dtype))
            })
            .collect::<HashMap<_, _>>();

        let mut copied = 0;
        let mut indices = Vec::new();

        while copied != sample_size {
            indices.clear();

            {
                let mut state = self.sample_state.lock().expect("could not acquire sample order");
                let SampleOrder { order, index, rng } = &mut *state;

                for _ in copied..sample_size {
                    if *index >= order.len() {
                        if order.len() != size {
                            *order = (0..size).collect();
                        }

                        order.shuffle(rng);
                        *index = 0;
                    }

                    indices.push(order[*index]);
                    *index += 1;
                }
            }

            for &slot in &indices {
                copied += self.copy_slot(slot, copied, &keys, &mut out);

                if copied == sample_size {
                    break;
                }
            }
        }

        self.num_sample.fetch_add(sample_size as i64, Ordering::AcqRel);
        out
    }

    fn prefetch_loop(&self) {
        let mut prefetch = self.prefetch.lock().expect("could not acquire prefetch state");

        loop {
            while prefetch.results.len() >= MAX_PREFETCHED_BATCHES || prefetch.request_size == 0 {
                prefetch = self.cv_work.wait(prefetch).expect("could not wait for work");

                if prefetch.die {
                    return;
                }
            }

            let sample_size = prefetch.request_size;
            drop(prefetch);

            let batch = self.sample_impl(sample_size);

            prefetch = self.prefetch.lock().expect("could not acquire prefetch state");
            if prefetch.die {
                return;
            }

            prefetch.results.push_back(batch);
            self.cv_result.notify_all();
        }
    }

    /// Draw `sample_size` samples without replacement (until the shuffled
    /// order is exhausted and re-shuffled). Batches are eagerly pre-computed
    /// by a small worker pool; this call pops the next ready batch.
    ///
    /// # Arguments
    ///
    /// * `sample_size` -
    ///
    pub fn sample(&self, sample_size: usize) -> HashMap<String, Tensor> {
        assert!(
            sample_size <= self.size(),
            "cannot sample {} from a buffer holding {}", sample_size, self.size()
        );

        let mut prefetch = self.prefetch.lock().expect("could not acquire prefetch state");

        if prefetch.threads.is_empty() {
            let me = self.weak.upgrade().expect("replay buffer is gone");

            for _ in 0..NUM_PREFETCH_THREADS {
                let me = me.clone();

                prefetch.threads.push(thread::spawn(move || me.prefetch_loop()));
            }
        }

        prefetch.request_size = sample_size;

        while prefetch.results.is_empty() {
            self.cv_work.notify_all();
            prefetch = self.cv_result.wait(prefetch).expect("could not wait for batch");
        }

        let batch = prefetch.results.pop_front().expect("no batch");
        drop(prefetch);

        self.cv_work.notify_all();
        batch
    }

    /// Stop the prefetch pool and join its threads. Must be called before
    /// dropping the last user reference if `sample` was ever used.
    pub fn shutdown(&self) {
        let threads = {
            let mut prefetch = self.prefetch.lock().expect("could not acquire prefetch state");
            prefetch.die = true;
            self.cv_work.notify_all();

            std::mem::replace(&mut prefetch.threads, Vec::new())
        };

        for thread in threads {
            thread.join().ok();
        }
    }

    /// Serialize the entire buffer (schema, contents, and sampling RNG) to
    /// bytes.
    pub fn to_state(&self) -> Vec<u8> {
        let keys = self.keys();
        let size = self.size();
        let next_idx = (self.num_add.load(Ordering::Acquire) % self.capacity as i64) as i32;
        let rng_state = self.sample_state.lock().expect("could not acquire sample order").rng.state();

        let mut stacked = keys.iter()
            .map(|key| Tensor::zeros(&push_left(size as i64, &key.shape), key.dtype))
            .collect::<Vec<_>>();

        for row in 0..size {
            loop {
                let src = self.slots[row].swap(ptr::null_mut(), Ordering::AcqRel);

                if src.is_null() {
                    thread::yield_now();
                    continue;
                }

                {
                    let sample = unsafe { &*src };

                    for (k, entry) in sample.iter().enumerate() {
                        let raw = decompress(&entry.data, entry.datasize);
                        copy_bytes_into_row(&mut stacked[k], row, &raw);
                    }
                }

                if self.slots[row].compare_exchange(ptr::null_mut(), src, Ordering::AcqRel, Ordering::Acquire).is_err() {
                    unsafe { drop(Box::from_raw(src)); }
                }

                break;
            }
        }

        let mut out = Vec::new();
        out.write_i32::<LittleEndian>(self.capacity as i32).unwrap();
        out.write_i32::<LittleEndian>(size as i32).unwrap();
        out.write_i32::<LittleEndian>(next_idx).unwrap();
        out.write_u32::<LittleEndian>(rng_state.len() as u32).unwrap();
        out.extend_from_slice(&rng_state);
        out.write_u32::<LittleEndian>(keys.len() as u32).unwrap();

        for (key, tensor) in keys.iter().zip(stacked.iter()) {
            out.write_u32::<LittleEndian>(key.name.len() as u32).unwrap();
            out.extend_from_slice(key.name.as_bytes());
            tensor.write_to(&mut out).unwrap();
        }

        out
    }

    /// Restore the buffer from a state produced by `to_state`. The
    /// capacity must match.
    ///
    /// # Arguments
    ///
    /// * `state` -
    ///
    pub fn init_from_state(&self, state: &[u8]) -> io::Result<()> {
        let mut reader = Cursor::new(state);

        let capacity = reader.read_i32::<LittleEndian>()?;
        if capacity as usize != self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("attempt to initialize a buffer of capacity {} from state of capacity {}", self.capacity, capacity)
            ));
        }

        let size = reader.read_i32::<LittleEndian>()? as usize;
        let next_idx = reader.read_i32::<LittleEndian>()? as i64;
        let rng_state_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut rng_state = vec! [0; rng_state_len];
        reader.read_exact(&mut rng_state)?;

        let n_keys = reader.read_u32::<LittleEndian>()? as usize;
        let mut keys = Vec::with_capacity(n_keys);
        let mut stacked = Vec::with_capacity(n_keys);

        for _ in 0..n_keys {
            let name_len = reader.read_u32::<LittleEndian>()? as usize;
            let mut name = vec! [0; name_len];
            reader.read_exact(&mut name)?;
            let name = String::from_utf8(name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let tensor = Tensor::read_from(&mut reader)?;
            keys.push(Key {
                name,
                shape: tensor.shape()[1..].to_vec(),
                dtype: tensor.dtype()
            });
            stacked.push(tensor);
        }

        {
            let mut current = self.keys.lock().expect("could not acquire keys");
            *current = keys.clone();
            self.has_keys.store(!current.is_empty(), Ordering::Release);
        }

        for slot in &self.slots {
            let prev = slot.swap(ptr::null_mut(), Ordering::AcqRel);

            if !prev.is_null() {
                unsafe { drop(Box::from_raw(prev)); }
            }
        }

        for row in 0..size {
            let sample = stacked.iter()
                .map(|tensor| {
                    let raw = tensor.select_row(row).data_bytes();

                    BufferEntry {
                        datasize: raw.len(),
                        data: compress(&raw)
                    }
                })
                .collect::<Sample>();

            self.slots[row].store(Box::into_raw(Box::new(sample)), Ordering::Release);
        }

        self.num_add.store(
            if size == self.capacity { self.capacity as i64 + next_idx } else { size as i64 },
            Ordering::Release
        );
        self.num_sample.store(0, Ordering::Release);

        let mut sample_state = self.sample_state.lock().expect("could not acquire sample order");
        sample_state.rng.set_state(&rng_state);
        sample_state.order.clear();
        sample_state.index = 0;

        Ok(())
    }
}

impl Drop for ReplayBuffer {
    fn drop(&mut self) {
        for slot in &self.slots {
            let prev = slot.swap(ptr::null_mut(), Ordering::AcqRel);

            if !prev.is_null() {
                unsafe { drop(Box::from_raw(prev)); }
            }
        }
    }
}

unsafe impl Send for ReplayBuffer { }
unsafe impl Sync for ReplayBuffer { }

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(values: &[f32]) -> HashMap<String, Tensor> {
        let mut batch = HashMap::new();
        batch.insert(
            "x".to_string(),
            Tensor::from_f32(&[values.len() as i64, 1], values.to_vec())
        );
        batch
    }

    #[test]
    fn overwrites_oldest() {
        let buffer = ReplayBuffer::new(8, 1);
        buffer.add(&batch_of(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]));

        assert_eq!(buffer.size(), 8);
        assert!(buffer.full());
        assert_eq!(buffer.num_add(), 10);

        let samples = buffer.sample(4);
        let values = samples["x"].as_f32();

        assert_eq!(values.len(), 4);
        for &v in values {
            assert!(v >= 2.0 && v <= 9.0, "sampled overwritten value {}", v);
        }

        let mut distinct = values.to_vec();
        distinct.sort_by(|a, b| a.partial_cmp(b).unwrap());
        distinct.dedup();
        assert_eq!(distinct.len(), 4);

        assert_eq!(buffer.num_sample(), 4);
        buffer.shutdown();
    }

    #[test]
    fn state_roundtrip_same_samples() {
        let buffer = ReplayBuffer::new(8, 1);
        buffer.add(&batch_of(&[0.0, 1.0, 2.0, 3.0, 4.0]));

        let state = buffer.to_state();

        let a = ReplayBuffer::new(8, 999);
        a.init_from_state(&state).unwrap();
        let b = ReplayBuffer::new(8, 777);
        b.init_from_state(&state).unwrap();

        assert_eq!(a.size(), 5);
        assert_eq!(a.num_add(), 5);

        for _ in 0..4 {
            assert_eq!(a.sample_impl(3), b.sample_impl(3));
        }
    }

    #[test]
    fn capacity_mismatch_is_rejected() {
        let buffer = ReplayBuffer::new(8, 1);
        buffer.add(&batch_of(&[1.0]));

        let other = ReplayBuffer::new(16, 1);
        assert!(other.init_from_state(&buffer.to_state()).is_err());
    }

    #[test]
    #[should_panic]
    fn schema_mismatch_panics() {
        let buffer = ReplayBuffer::new(8, 1);
        buffer.add(&batch_of(&[1.0]));

        let mut other = HashMap::new();
        other.insert("y".to_string(), Tensor::from_f32(&[1, 1], vec! [1.0]));
        buffer.add(&other);
    }

    #[test]
    #[should_panic]
    fn sample_more_than_size_panics() {
        let buffer = ReplayBuffer::new(8, 1);
        buffer.add(&batch_of(&[1.0]));
        buffer.sample(2);
    }

    #[test]
    fn concurrent_add_and_sample() {
        let buffer = ReplayBuffer::new(32, 1);
        buffer.add(&batch_of(&(0..32).map(|i| i as f32).collect::<Vec<_>>()));

        let writer = {
            let buffer = buffer.clone();

            thread::spawn(move || {
                for i in 0..100 {
                    buffer.add(&batch_of(&[i as f32]));
                }
            })
        };

        for _ in 0..20 {
            let samples = buffer.sample_impl(8);
            assert_eq!(samples["x"].shape(), &[8, 1]);
        }

        writer.join().unwrap();
        assert_eq!(buffer.num_add(), 132);
        buffer.shutdown();
    }
}
