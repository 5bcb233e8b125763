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

use std::collections::VecDeque;
use std::sync::Arc;

use crate::data_block::DataBlock;
use crate::tensor::{push_left, Dtype, Tensor};

/// An append-only sequence of same-shaped tensors, drained one element at a
/// time into its shared send buffer, most recent first.
pub struct EpisodicTrajectory {
    pub name: String,
    pub dtype: Dtype,
    pub sizes: Vec<i64>,
    pub buffer: Arc<DataBlock>,
    trajectory: Vec<Tensor>
}

impl EpisodicTrajectory {
    pub fn new(name: &str, sizes: &[i64], dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            dtype,
            sizes: sizes.to_vec(),
            buffer: Arc::new(DataBlock::new(name, sizes, dtype)),
            trajectory: Vec::new()
        }
    }

    /// Append a step to the trajectory. Returns the new length.
    ///
    /// # Arguments
    ///
    /// * `t` -
    ///
    pub fn push_back(&mut self, t: Tensor) -> usize {
        assert_eq!(t.dtype(), self.dtype, "trajectory {} dtype mismatch", self.name);
        assert_eq!(t.shape(), &self.sizes[..], "trajectory {} shape mismatch", self.name);

        self.trajectory.push(t);
        self.trajectory.len()
    }

    /// Pop the most recent step into the send buffer. Returns false if the
    /// trajectory is empty.
    pub fn prepare_for_send(&mut self) -> bool {
        match self.trajectory.pop() {
            None => false,
            Some(t) => {
                self.buffer.set(&t);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.trajectory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectory.is_empty()
    }

    pub fn clear(&mut self) {
        self.trajectory.clear();
    }
}

/// A circular buffer of `len` slots. The staging buffer is copied into the
/// next slot by `push_buffer_to_trajectory`, and the whole trajectory is
/// one tensor of shape `[len, ..]`.
pub struct FixedLengthTrajectory {
    pub name: String,
    pub len: usize,
    pub sizes: Vec<i64>,
    pub dtype: Dtype,
    pub buffer: Arc<DataBlock>,
    pub trajectory: Arc<DataBlock>,
    next_slot: usize
}

impl FixedLengthTrajectory {
    pub fn new(name: &str, len: usize, sizes: &[i64], dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            len,
            sizes: sizes.to_vec(),
            dtype,
            buffer: Arc::new(DataBlock::new(name, sizes, dtype)),
            trajectory: Arc::new(DataBlock::new(name, &push_left(len as i64, sizes), dtype)),
            next_slot: 0
        }
    }

    /// Copy the staging buffer into the next slot. Returns the slot index
    /// that was written.
    pub fn push_buffer_to_trajectory(&mut self) -> usize {
        let pushed_slot = self.next_slot;
        let src = self.buffer.snapshot();

        assert_eq!(src.dtype(), self.dtype);
        assert_eq!(src.shape(), &self.sizes[..]);

        self.trajectory.data().copy_row_from(pushed_slot, &src);
        self.next_slot = (self.next_slot + 1) % self.len;
        pushed_slot
    }
}

/// An unbounded queue of steps; `prepare_for_send` fails until at least
/// `block_len` are queued, then moves the oldest `block_len` of them into
/// the send trajectory tensor.
pub struct IndefiniteTrajectory {
    pub name: String,
    pub block_len: usize,
    pub dtype: Dtype,
    pub sizes: Vec<i64>,
    pub buffer: Arc<DataBlock>,
    pub trajectory: Arc<DataBlock>,
    trajectory_: VecDeque<Tensor>
}

impl IndefiniteTrajectory {
    pub fn new(name: &str, block_len: usize, sizes: &[i64], dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            block_len,
            dtype,
            sizes: sizes.to_vec(),
            buffer: Arc::new(DataBlock::new(name, sizes, dtype)),
            trajectory: Arc::new(DataBlock::new(name, &push_left(block_len as i64, sizes), dtype)),
            trajectory_: VecDeque::new()
        }
    }

    /// Append a copy of the staging buffer to the queue. Returns the new
    /// queue length.
    pub fn push_buffer_to_trajectory(&mut self) -> usize {
        let src = self.buffer.snapshot();

        assert_eq!(src.dtype(), self.dtype);
        assert_eq!(src.shape(), &self.sizes[..]);

        self.trajectory_.push_back(src);
        self.len()
    }

    /// If at least `block_len` steps are queued, move the first `block_len`
    /// into the send trajectory and return true.
    pub fn prepare_for_send(&mut self) -> bool {
        if self.trajectory_.len() < self.block_len {
            return false;
        }

        let mut dst = self.trajectory.data();

        for i in 0..self.block_len {
            let front = self.trajectory_.pop_front().expect("queue underflow");
            dst.copy_row_from(i, &front);
        }

        true
    }

    pub fn len(&self) -> usize {
        self.trajectory_.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episodic_pops_back() {
        let mut traj = EpisodicTrajectory::new("v", &[1], Dtype::F32);

        assert!(!traj.prepare_for_send());

        traj.push_back(Tensor::scalar(1.0));
        traj.push_back(Tensor::scalar(2.0));

        assert!(traj.prepare_for_send());
        assert_eq!(traj.buffer.snapshot().as_f32(), &[2.0]);
        assert!(traj.prepare_for_send());
        assert_eq!(traj.buffer.snapshot().as_f32(), &[1.0]);
        assert!(!traj.prepare_for_send());
    }

    #[test]
    fn fixed_length_wraps_around() {
        let mut traj = FixedLengthTrajectory::new("x", 2, &[1], Dtype::F32);

        traj.buffer.set(&Tensor::scalar(1.0));
        assert_eq!(traj.push_buffer_to_trajectory(), 0);
        traj.buffer.set(&Tensor::scalar(2.0));
        assert_eq!(traj.push_buffer_to_trajectory(), 1);
        traj.buffer.set(&Tensor::scalar(3.0));
        assert_eq!(traj.push_buffer_to_trajectory(), 0);

        assert_eq!(traj.trajectory.snapshot().as_f32(), &[3.0, 2.0]);
    }

    #[test]
    fn indefinite_requires_full_block() {
        let mut traj = IndefiniteTrajectory::new("x", 2, &[1], Dtype::F32);

        traj.buffer.set(&Tensor::scalar(1.0));
        traj.push_buffer_to_trajectory();

        assert!(!traj.prepare_for_send());

        traj.buffer.set(&Tensor::scalar(2.0));
        traj.push_buffer_to_trajectory();
        traj.buffer.set(&Tensor::scalar(3.0));
        traj.push_buffer_to_trajectory();

        assert!(traj.prepare_for_send());
        assert_eq!(traj.trajectory.snapshot().as_f32(), &[1.0, 2.0]);
        assert_eq!(traj.len(), 1);
    }
}
