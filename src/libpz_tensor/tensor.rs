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

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// The element type of a `Tensor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dtype {
    F32,
    I64
}

impl Dtype {
    pub fn size_of(self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::I64 => 8
        }
    }

    fn tag(self) -> u8 {
        match self {
            Dtype::F32 => 0,
            Dtype::I64 => 1
        }
    }

    fn from_tag(tag: u8) -> io::Result<Self> {
        match tag {
            0 => Ok(Dtype::F32),
            1 => Ok(Dtype::I64),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown dtype tag {}", tag)))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Storage {
    F32(Vec<f32>),
    I64(Vec<i64>)
}

/// Returns `sizes` with `left` prepended, i.e. the shape of a batch of
/// `left` tensors of shape `sizes`.
///
/// # Arguments
///
/// * `left` -
/// * `sizes` -
///
pub fn push_left(left: i64, sizes: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(sizes.len() + 1);
    out.push(left);
    out.extend_from_slice(sizes);
    out
}

/// An owned n-dimensional array with a fixed shape and element type. This
/// is the only tensor type in the workspace; batches, rows, and trajectory
/// buffers are all plain tensors whose outer dimension carries the meaning.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<i64>,
    data: Storage
}

impl Tensor {
    /// Create a zero-filled tensor of the given shape and element type.
    ///
    /// # Arguments
    ///
    /// * `shape` -
    /// * `dtype` -
    ///
    pub fn zeros(shape: &[i64], dtype: Dtype) -> Self {
        let numel = shape.iter().product::<i64>().max(0) as usize;

        Self {
            shape: shape.to_vec(),
            data: match dtype {
                Dtype::F32 => Storage::F32(vec! [0.0; numel]),
                Dtype::I64 => Storage::I64(vec! [0; numel])
            }
        }
    }

    /// Create a tensor of the given shape from existing values. Panics if
    /// the number of values does not match the shape.
    ///
    /// # Arguments
    ///
    /// * `shape` -
    /// * `values` -
    ///
    pub fn from_f32(shape: &[i64], values: Vec<f32>) -> Self {
        let numel = shape.iter().product::<i64>().max(0) as usize;
        assert_eq!(numel, values.len(), "shape {:?} does not hold {} values", shape, values.len());

        Self { shape: shape.to_vec(), data: Storage::F32(values) }
    }

    pub fn from_i64(shape: &[i64], values: Vec<i64>) -> Self {
        let numel = shape.iter().product::<i64>().max(0) as usize;
        assert_eq!(numel, values.len(), "shape {:?} does not hold {} values", shape, values.len());

        Self { shape: shape.to_vec(), data: Storage::I64(values) }
    }

    /// Create a scalar (shape `[1]`) tensor holding `value`.
    pub fn scalar(value: f32) -> Self {
        Self::from_f32(&[1], vec! [value])
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        match self.data {
            Storage::F32(_) => Dtype::F32,
            Storage::I64(_) => Dtype::I64
        }
    }

    pub fn numel(&self) -> usize {
        match &self.data {
            Storage::F32(v) => v.len(),
            Storage::I64(v) => v.len()
        }
    }

    /// The number of elements of a single row, i.e. everything but the
    /// outer dimension.
    pub fn row_numel(&self) -> usize {
        if self.shape.is_empty() || self.shape[0] == 0 {
            0
        } else {
            self.numel() / self.shape[0] as usize
        }
    }

    pub fn as_f32(&self) -> &[f32] {
        match &self.data {
            Storage::F32(v) => v,
            _ => panic!("tensor is not f32")
        }
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        match &mut self.data {
            Storage::F32(v) => v,
            _ => panic!("tensor is not f32")
        }
    }

    pub fn as_i64(&self) -> &[i64] {
        match &self.data {
            Storage::I64(v) => v,
            _ => panic!("tensor is not i64")
        }
    }

    pub fn as_i64_mut(&mut self) -> &mut [i64] {
        match &mut self.data {
            Storage::I64(v) => v,
            _ => panic!("tensor is not i64")
        }
    }

    pub fn fill_f32(&mut self, value: f32) {
        for x in self.as_f32_mut() {
            *x = value;
        }
    }

    pub fn zero_(&mut self) {
        match &mut self.data {
            Storage::F32(v) => v.iter_mut().for_each(|x| *x = 0.0),
            Storage::I64(v) => v.iter_mut().for_each(|x| *x = 0)
        }
    }

    /// Copy the contents of `src` into this tensor. Panics on any shape or
    /// element type mismatch.
    ///
    /// # Arguments
    ///
    /// * `src` -
    ///
    pub fn copy_from(&mut self, src: &Tensor) {
        assert_eq!(self.shape, src.shape, "copy_from shape mismatch");
        assert_eq!(self.dtype(), src.dtype(), "copy_from dtype mismatch");

        match (&mut self.data, &src.data) {
            (Storage::F32(dst), Storage::F32(src)) => dst.copy_from_slice(src),
            (Storage::I64(dst), Storage::I64(src)) => dst.copy_from_slice(src),
            _ => unreachable!()
        }
    }

    /// Copy `src` (whose shape must equal this tensor's row shape) into the
    /// given row of the outer dimension.
    ///
    /// # Arguments
    ///
    /// * `row` -
    /// * `src` -
    ///
    pub fn copy_row_from(&mut self, row: usize, src: &Tensor) {
        assert_eq!(&self.shape[1..], src.shape(), "copy_row_from shape mismatch");
        assert_eq!(self.dtype(), src.dtype(), "copy_row_from dtype mismatch");

        let n = self.row_numel();
        let at = row * n;

        match (&mut self.data, &src.data) {
            (Storage::F32(dst), Storage::F32(src)) => dst[at..at+n].copy_from_slice(src),
            (Storage::I64(dst), Storage::I64(src)) => dst[at..at+n].copy_from_slice(src),
            _ => unreachable!()
        }
    }

    /// Returns the given row of the outer dimension as a new tensor of the
    /// row shape.
    ///
    /// # Arguments
    ///
    /// * `row` -
    ///
    pub fn select_row(&self, row: usize) -> Tensor {
        let n = self.row_numel();
        let at = row * n;
        let shape = self.shape[1..].to_vec();

        match &self.data {
            Storage::F32(src) => Tensor { shape, data: Storage::F32(src[at..at+n].to_vec()) },
            Storage::I64(src) => Tensor { shape, data: Storage::I64(src[at..at+n].to_vec()) }
        }
    }

    /// Returns a new tensor whose rows are the given rows of this tensor,
    /// in order.
    ///
    /// # Arguments
    ///
    /// * `rows` -
    ///
    pub fn select_rows(&self, rows: &[usize]) -> Tensor {
        let n = self.row_numel();
        let mut out = Tensor::zeros(&push_left(rows.len() as i64, &self.shape[1..]), self.dtype());

        for (i, &row) in rows.iter().enumerate() {
            let at = row * n;

            match (&mut out.data, &self.data) {
                (Storage::F32(dst), Storage::F32(src)) => dst[i*n..(i+1)*n].copy_from_slice(&src[at..at+n]),
                (Storage::I64(dst), Storage::I64(src)) => dst[i*n..(i+1)*n].copy_from_slice(&src[at..at+n]),
                _ => unreachable!()
            }
        }

        out
    }

    /// Copy row `i` of `src` into row `rows[i]` of this tensor, for every
    /// `i`.
    ///
    /// # Arguments
    ///
    /// * `rows` -
    /// * `src` -
    ///
    pub fn index_copy_rows(&mut self, rows: &[usize], src: &Tensor) {
        assert_eq!(rows.len() as i64, src.shape()[0], "index_copy_rows row count mismatch");
        assert_eq!(&self.shape[1..], &src.shape()[1..], "index_copy_rows shape mismatch");

        let n = self.row_numel();

        for (i, &row) in rows.iter().enumerate() {
            let at = row * n;

            match (&mut self.data, &src.data) {
                (Storage::F32(dst), Storage::F32(src)) => dst[at..at+n].copy_from_slice(&src[i*n..(i+1)*n]),
                (Storage::I64(dst), Storage::I64(src)) => dst[at..at+n].copy_from_slice(&src[i*n..(i+1)*n]),
                _ => unreachable!()
            }
        }
    }

    /// Stack the given same-shaped tensors into one tensor with a new outer
    /// dimension.
    ///
    /// # Arguments
    ///
    /// * `tensors` -
    ///
    pub fn stack(tensors: &[Tensor]) -> Tensor {
        assert!(!tensors.is_empty(), "cannot stack zero tensors");

        let shape = push_left(tensors.len() as i64, tensors[0].shape());
        let mut out = Tensor::zeros(&shape, tensors[0].dtype());

        for (i, t) in tensors.iter().enumerate() {
            out.copy_row_from(i, t);
        }

        out
    }

    /// Returns a copy of this tensor with a different shape holding the
    /// same number of elements.
    ///
    /// # Arguments
    ///
    /// * `shape` -
    ///
    pub fn view(&self, shape: &[i64]) -> Tensor {
        let numel = shape.iter().product::<i64>().max(0) as usize;
        assert_eq!(numel, self.numel(), "view shape {:?} does not hold {} elements", shape, self.numel());

        Tensor { shape: shape.to_vec(), data: self.data.clone() }
    }

    /// Serialize this tensor to `writer` in the little-endian wire format
    /// (dtype tag, rank, dimensions, raw elements).
    ///
    /// # Arguments
    ///
    /// * `writer` -
    ///
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(self.dtype().tag())?;
        writer.write_u32::<LittleEndian>(self.shape.len() as u32)?;

        for &dim in &self.shape {
            writer.write_i64::<LittleEndian>(dim)?;
        }

        match &self.data {
            Storage::F32(values) => {
                for &v in values {
                    writer.write_f32::<LittleEndian>(v)?;
                }
            },
            Storage::I64(values) => {
                for &v in values {
                    writer.write_i64::<LittleEndian>(v)?;
                }
            }
        }

        Ok(())
    }

    /// Deserialize a tensor previously written with `write_to`.
    ///
    /// # Arguments
    ///
    /// * `reader` -
    ///
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Tensor> {
        let dtype = Dtype::from_tag(reader.read_u8()?)?;
        let rank = reader.read_u32::<LittleEndian>()? as usize;
        let mut shape = Vec::with_capacity(rank);

        for _ in 0..rank {
            shape.push(reader.read_i64::<LittleEndian>()?);
        }

        let numel = shape.iter().product::<i64>().max(0) as usize;
        let data = match dtype {
            Dtype::F32 => {
                let mut values = vec! [0.0; numel];
                reader.read_f32_into::<LittleEndian>(&mut values)?;
                Storage::F32(values)
            },
            Dtype::I64 => {
                let mut values = vec! [0; numel];
                reader.read_i64_into::<LittleEndian>(&mut values)?;
                Storage::I64(values)
            }
        };

        Ok(Tensor { shape, data })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.numel() * self.dtype().size_of());
        self.write_to(&mut out).expect("could not serialize tensor");
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Tensor> {
        let mut cursor = io::Cursor::new(bytes);
        Tensor::read_from(&mut cursor)
    }

    /// Returns the raw element bytes in little-endian order, without the
    /// shape header.
    pub fn data_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.numel() * self.dtype().size_of());

        match &self.data {
            Storage::F32(values) => {
                for &v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            },
            Storage::I64(values) => {
                for &v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }

        out
    }

    /// Overwrite the elements of this tensor from raw little-endian bytes,
    /// as produced by `data_bytes`. Panics if the byte count does not match.
    ///
    /// # Arguments
    ///
    /// * `bytes` -
    ///
    pub fn set_data_bytes(&mut self, bytes: &[u8]) {
        assert_eq!(bytes.len(), self.numel() * self.dtype().size_of(), "raw byte length mismatch");

        match &mut self.data {
            Storage::F32(values) => {
                for (v, chunk) in values.iter_mut().zip(bytes.chunks_exact(4)) {
                    *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            },
            Storage::I64(values) => {
                for (v, chunk) in values.iter_mut().zip(bytes.chunks_exact(8)) {
                    let mut buf = [0; 8];
                    buf.copy_from_slice(chunk);
                    *v = i64::from_le_bytes(buf);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_shape() {
        let t = Tensor::zeros(&[2, 3, 4], Dtype::F32);

        assert_eq!(t.shape(), &[2, 3, 4]);
        assert_eq!(t.numel(), 24);
        assert_eq!(t.row_numel(), 12);
    }

    #[test]
    fn row_copies() {
        let mut batch = Tensor::zeros(&[3, 2], Dtype::F32);
        let row = Tensor::from_f32(&[2], vec! [1.0, 2.0]);

        batch.copy_row_from(1, &row);

        assert_eq!(batch.as_f32(), &[0.0, 0.0, 1.0, 2.0, 0.0, 0.0]);
        assert_eq!(batch.select_row(1), row);
    }

    #[test]
    fn select_and_index_copy() {
        let batch = Tensor::from_f32(&[4, 1], vec! [0.0, 1.0, 2.0, 3.0]);
        let picked = batch.select_rows(&[3, 1]);

        assert_eq!(picked.as_f32(), &[3.0, 1.0]);

        let mut dst = Tensor::zeros(&[4, 1], Dtype::F32);
        dst.index_copy_rows(&[3, 1], &picked);

        assert_eq!(dst.as_f32(), &[0.0, 1.0, 0.0, 3.0]);
    }

    #[test]
    fn stack_rows() {
        let a = Tensor::from_f32(&[2], vec! [1.0, 2.0]);
        let b = Tensor::from_f32(&[2], vec! [3.0, 4.0]);
        let stacked = Tensor::stack(&[a, b]);

        assert_eq!(stacked.shape(), &[2, 2]);
        assert_eq!(stacked.as_f32(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn serialization_roundtrip() {
        let t = Tensor::from_f32(&[2, 2], vec! [1.0, -2.0, 3.5, 0.0]);
        let restored = Tensor::from_bytes(&t.to_bytes()).unwrap();

        assert_eq!(t, restored);

        let i = Tensor::from_i64(&[3], vec! [-1, 0, i64::MAX]);
        let restored = Tensor::from_bytes(&i.to_bytes()).unwrap();

        assert_eq!(i, restored);
    }

    #[test]
    fn raw_bytes_roundtrip() {
        let t = Tensor::from_f32(&[2], vec! [1.5, -0.25]);
        let mut u = Tensor::zeros(&[2], Dtype::F32);
        u.set_data_bytes(&t.data_bytes());

        assert_eq!(t, u);
    }

    #[test]
    #[should_panic]
    fn copy_shape_mismatch() {
        let mut a = Tensor::zeros(&[2], Dtype::F32);
        let b = Tensor::zeros(&[3], Dtype::F32);

        a.copy_from(&b);
    }
}
