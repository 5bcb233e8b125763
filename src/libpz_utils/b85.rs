// Copyright 2019 Karl Sundequist Blomdahl <karl.sundequist.blomdahl@gmail.com>
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

const BASE_85: [char; 85] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J',
    'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T',
    'U', 'V', 'W', 'X', 'Y', 'Z',
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j',
    'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't',
    'u', 'v', 'w', 'x', 'y', 'z',
    '!', '#', '$', '%', '&', '(', ')', '*', '+', '-',
    ';', '<', '=', '>', '?', '@', '^', '_', '`', '{',
    '|', '}', '~'
];

lazy_static! {
    /// Lookup table from alphabet characters to its bit value
    static ref DECODE_85: [i8; 256] = {
        let mut out = [-1; 256];

        for (i, b) in BASE_85.iter().enumerate() {
            out[*b as usize] = i as i8;
        }

        out
    };
}

/// Decode a RFC 1924 (Ascii85) encoded string of FP32 values and returns
/// an array of the numbers it represents.
///
/// # Arguments
///
/// * `input` - the encoded string
///
pub fn decode(input: &str) -> Option<Vec<f32>> {
    let mut bytes = Vec::with_capacity(4 * (input.len() / 5));
    let mut iter = input.chars();

    'outer: loop {
        // decode the alphabet into raw bits
        let mut acc: u32 = 0;

        for i in 0..5 {
            if let Some(ch) = iter.next() {
                let de = unsafe { *DECODE_85.get_unchecked(ch as usize) };
                if de < 0 {
                    return None;  // invalid character
                }

                acc = 85 * acc + de as u32;
            } else if i == 0 {
                break 'outer;
            } else {
                return None;  // truncated group
            }
        }

        bytes.extend_from_slice(&acc.to_be_bytes());
    }

    if bytes.len() % 4 != 0 {
        return None;
    }

    Some(
        bytes.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    )
}

/// Encode an array of FP32 values as a RFC 1924 (Ascii85) string. The
/// inverse of `decode`.
///
/// # Arguments
///
/// * `input` - the values to encode
///
pub fn encode(input: &[f32]) -> String {
    let mut out = String::with_capacity(5 * input.len());
    let mut bytes = Vec::with_capacity(4 * input.len());

    for value in input {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    for group in bytes.chunks(4) {
        let mut acc: u32 = 0;

        for i in 0..4 {
            acc = (acc << 8) | group.get(i).cloned().unwrap_or(0) as u32;
        }

        let mut chars = ['0'; 5];

        for i in (0..5).rev() {
            chars[i] = BASE_85[(acc % 85) as usize];
            acc /= 85;
        }

        out.extend(&chars);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let values = vec! [0.0, 1.0, -1.0, 0.5, 3.14159, -127.25, 1e-6];
        let encoded = encode(&values);

        assert_eq!(decode(&encoded), Some(values));
    }

    #[test]
    fn empty() {
        assert_eq!(decode(""), Some(vec! []));
        assert_eq!(encode(&[]), "");
    }

    #[test]
    fn invalid_character() {
        assert_eq!(decode("\"\"\"\"\""), None);
    }

    #[test]
    fn truncated() {
        assert_eq!(decode("012"), None);
    }
}
