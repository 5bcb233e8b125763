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

use rand::{Error, RngCore, SeedableRng};

/// A xoshiro256** generator whose full state can be exported and restored,
/// so that a stream of random numbers survives a serialization round-trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Xoshiro256 {
    s: [u64; 4]
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

impl Xoshiro256 {
    /// Create a new generator from the given seed, expanded with
    /// splitmix64 so that small seeds still produce well-mixed state.
    ///
    /// # Arguments
    ///
    /// * `seed` -
    ///
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        let mut s = [0; 4];

        for word in s.iter_mut() {
            *word = splitmix64(&mut sm);
        }

        Self { s }
    }

    /// Returns the raw generator state as 32 little-endian bytes.
    pub fn state(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);

        for word in &self.s {
            out.extend_from_slice(&word.to_le_bytes());
        }

        out
    }

    /// Restore the generator from a state previously returned by `state`.
    ///
    /// # Arguments
    ///
    /// * `bytes` - exactly 32 bytes
    ///
    pub fn set_state(&mut self, bytes: &[u8]) {
        assert_eq!(bytes.len(), 32, "invalid rng state length {}", bytes.len());

        for (word, chunk) in self.s.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
    }
}

impl RngCore for Xoshiro256 {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let result = self.s[1]
            .wrapping_mul(5)
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for Xoshiro256 {
    type Seed = [u8; 32];

    fn from_seed(seed: Self::Seed) -> Self {
        let mut out = Self { s: [0; 4] };
        out.set_state(&seed);

        // an all-zero state is a fixed point of the generator
        if out.s.iter().all(|&w| w == 0) {
            out = Self::new(0);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn state_roundtrip() {
        let mut a = Xoshiro256::new(12345);

        for _ in 0..100 {
            a.next_u64();
        }

        let mut b = Xoshiro256::new(0);
        b.set_state(&a.state());

        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn deterministic() {
        let mut a = Xoshiro256::new(1);
        let mut b = Xoshiro256::new(1);

        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn usable_with_rand() {
        let mut rng = Xoshiro256::new(7);
        let x: f64 = rng.gen_range(0.0..1.0);

        assert!(x >= 0.0 && x < 1.0);
    }
}
