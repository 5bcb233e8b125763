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

use std::sync::{Mutex, MutexGuard};

use crate::tensor::{Dtype, Tensor};

/// A named tensor shared between one producer and one dispatcher. The
/// shape and element type are fixed at construction; only the contents
/// change.
pub struct DataBlock {
    pub name: String,
    shape: Vec<i64>,
    dtype: Dtype,
    data: Mutex<Tensor>
}

impl DataBlock {
    /// Create a new zero-filled block.
    ///
    /// # Arguments
    ///
    /// * `name` -
    /// * `shape` -
    /// * `dtype` -
    ///
    pub fn new(name: &str, shape: &[i64], dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
            data: Mutex::new(Tensor::zeros(shape, dtype))
        }
    }

    pub fn sizes(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Lock and return the tensor contents.
    pub fn data(&self) -> MutexGuard<Tensor> {
        self.data.lock().expect("could not acquire data block")
    }

    /// Overwrite the contents with `src`, which must match the block shape.
    ///
    /// # Arguments
    ///
    /// * `src` -
    ///
    pub fn set(&self, src: &Tensor) {
        self.data().copy_from(src);
    }

    /// Returns a copy of the current contents.
    pub fn snapshot(&self) -> Tensor {
        self.data().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_snapshot() {
        let block = DataBlock::new("s", &[2], Dtype::F32);
        block.set(&Tensor::from_f32(&[2], vec! [1.0, 2.0]));

        assert_eq!(block.snapshot().as_f32(), &[1.0, 2.0]);
        assert_eq!(block.name, "s");
        assert_eq!(block.sizes(), &[2]);
    }
}
