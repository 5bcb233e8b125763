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

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use pz_tensor::Tensor;

/// A message of the actor/learner protocol. Every message is framed as a
/// one-byte type tag followed by a little-endian u64 payload length.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A batch of named training tensors; zstd-compressed on the wire.
    Trajectory(Vec<(String, Tensor)>),

    /// A model state dict published under the given id.
    ModelUpdate {
        model_id: String,
        state_dict: Vec<(String, Tensor)>
    },

    /// Ask the learner for the current model.
    ModelRequest {
        is_tournament_opponent: bool
    },

    /// The outcome of a finished game, weighted per participating model.
    Result {
        reward: f32,
        models: Vec<(String, f32)>
    }
}

const TAG_TRAJECTORY: u8 = 1;
const TAG_MODEL_UPDATE: u8 = 2;
const TAG_MODEL_REQUEST: u8 = 3;
const TAG_RESULT: u8 = 4;

fn write_string<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(s.len() as u64)?;
    writer.write_all(s.as_bytes())
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u64::<LittleEndian>()? as usize;
    let mut bytes = vec! [0; len];
    reader.read_exact(&mut bytes)?;

    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Serialize key/tensor pairs as a stream of `(key_len, key, value_len,
/// value)` entries terminated by a zero key length.
fn write_pairs<W: Write>(writer: &mut W, pairs: &[(String, Tensor)]) -> io::Result<()> {
    for (name, tensor) in pairs {
        assert!(!name.is_empty(), "empty tensor keys cannot be framed");
        write_string(writer, name)?;

        let bytes = tensor.to_bytes();
        writer.write_u64::<LittleEndian>(bytes.len() as u64)?;
        writer.write_all(&bytes)?;
    }

    writer.write_u64::<LittleEndian>(0)
}

fn read_pairs<R: Read>(reader: &mut R) -> io::Result<Vec<(String, Tensor)>> {
    let mut out = Vec::new();

    loop {
        let key_len = reader.read_u64::<LittleEndian>()? as usize;
        if key_len == 0 {
            break;
        }

        let mut key = vec! [0; key_len];
        reader.read_exact(&mut key)?;
        let key = String::from_utf8(key).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let value_len = reader.read_u64::<LittleEndian>()? as usize;
        let mut value = vec! [0; value_len];
        reader.read_exact(&mut value)?;

        out.push((key, Tensor::from_bytes(&value)?));
    }

    Ok(out)
}

impl Message {
    /// Write this message, framed, to `writer`.
    ///
    /// # Arguments
    ///
    /// * `writer` -
    ///
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let (tag, payload) = match self {
            Message::Trajectory(pairs) => {
                let mut raw = Vec::new();
                write_pairs(&mut raw, pairs)?;

                (TAG_TRAJECTORY, zstd::bulk::compress(&raw, 0)?)
            },
            Message::ModelUpdate { model_id, state_dict } => {
                let mut payload = Vec::new();
                write_string(&mut payload, model_id)?;
                write_pairs(&mut payload, state_dict)?;

                (TAG_MODEL_UPDATE, payload)
            },
            Message::ModelRequest { is_tournament_opponent } => {
                (TAG_MODEL_REQUEST, vec! [*is_tournament_opponent as u8])
            },
            Message::Result { reward, models } => {
                let mut payload = Vec::new();
                payload.write_f32::<LittleEndian>(*reward)?;
                payload.write_u32::<LittleEndian>(models.len() as u32)?;

                for (model_id, weight) in models {
                    write_string(&mut payload, model_id)?;
                    payload.write_f32::<LittleEndian>(*weight)?;
                }

                (TAG_RESULT, payload)
            }
        };

        writer.write_u8(tag)?;
        writer.write_u64::<LittleEndian>(payload.len() as u64)?;
        writer.write_all(&payload)?;
        writer.flush()
    }

    /// Read the next framed message from `reader`.
    ///
    /// # Arguments
    ///
    /// * `reader` -
    ///
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Message> {
        let tag = reader.read_u8()?;
        let len = reader.read_u64::<LittleEndian>()? as usize;
        let mut payload = vec! [0; len];
        reader.read_exact(&mut payload)?;

        match tag {
            TAG_TRAJECTORY => {
                let raw = zstd::stream::decode_all(Cursor::new(&payload))?;

                Ok(Message::Trajectory(read_pairs(&mut Cursor::new(&raw))?))
            },
            TAG_MODEL_UPDATE => {
                let mut cursor = Cursor::new(&payload);
                let model_id = read_string(&mut cursor)?;
                let state_dict = read_pairs(&mut cursor)?;

                Ok(Message::ModelUpdate { model_id, state_dict })
            },
            TAG_MODEL_REQUEST => {
                let is_tournament_opponent = payload.get(0).cloned().unwrap_or(0) != 0;

                Ok(Message::ModelRequest { is_tournament_opponent })
            },
            TAG_RESULT => {
                let mut cursor = Cursor::new(&payload);
                let reward = cursor.read_f32::<LittleEndian>()?;
                let n = cursor.read_u32::<LittleEndian>()? as usize;
                let mut models = Vec::with_capacity(n);

                for _ in 0..n {
                    let model_id = read_string(&mut cursor)?;
                    let weight = cursor.read_f32::<LittleEndian>()?;
                    models.push((model_id, weight));
                }

                Ok(Message::Result { reward, models })
            },
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown message tag {}", tag)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let mut bytes = Vec::new();
        message.write_to(&mut bytes).unwrap();

        let restored = Message::read_from(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(message, restored);
    }

    #[test]
    fn trajectory() {
        roundtrip(Message::Trajectory(vec! [
            ("s".to_string(), Tensor::from_f32(&[2, 2], vec! [1.0, 2.0, 3.0, 4.0])),
            ("v".to_string(), Tensor::scalar(-0.5))
        ]));
    }

    #[test]
    fn model_update() {
        roundtrip(Message::ModelUpdate {
            model_id: "dev".to_string(),
            state_dict: vec! [("trunk.weight".to_string(), Tensor::scalar(1.0))]
        });
    }

    #[test]
    fn model_request() {
        roundtrip(Message::ModelRequest { is_tournament_opponent: true });
        roundtrip(Message::ModelRequest { is_tournament_opponent: false });
    }

    #[test]
    fn result() {
        roundtrip(Message::Result {
            reward: 1.0,
            models: vec! [("dev".to_string(), 0.75), ("old".to_string(), 0.25)]
        });
    }

    #[test]
    fn unknown_tag() {
        let mut bytes = vec! [99u8];
        bytes.extend_from_slice(&0u64.to_le_bytes());

        assert!(Message::read_from(&mut Cursor::new(&bytes)).is_err());
    }
}
