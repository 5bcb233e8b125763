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

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use pz_tensor::DataBlock;

use crate::data_channel::DataChannel;

/// Why a dispatch did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// The data channel has been terminated.
    Terminated,

    /// No slot could be secured.
    NoSlot
}

impl fmt::Display for DispatchError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::Terminated => write!(fmt, "data channel terminated"),
            DispatchError::NoSlot => write!(fmt, "no slot available")
        }
    }
}

impl Error for DispatchError { }

/// Per-producer client of a `DataChannel`. Owns the producer-side data
/// blocks and copies them in and out of the channel buffers on each
/// dispatch.
pub struct Dispatcher {
    dc: Arc<DataChannel>,
    send_blocks: Vec<Arc<DataBlock>>,
    reply_blocks: Vec<Arc<DataBlock>>
}

impl Dispatcher {
    pub fn new(dc: Arc<DataChannel>) -> Self {
        Self {
            dc,
            send_blocks: Vec::new(),
            reply_blocks: Vec::new()
        }
    }

    /// Register the blocks this dispatcher sends and receives. Panics on a
    /// duplicate key, or if the channel buffers do not match.
    ///
    /// # Arguments
    ///
    /// * `send` -
    /// * `reply` -
    ///
    pub fn add_data_blocks(&mut self, send: Vec<Arc<DataBlock>>, reply: Vec<Arc<DataBlock>>) {
        for block in &send {
            assert!(
                !self.send_blocks.iter().any(|b| b.name == block.name),
                "duplicate send key {} for data channel {}", block.name, self.dc.name
            );
            self.send_blocks.push(block.clone());
        }
        for block in &reply {
            assert!(
                !self.reply_blocks.iter().any(|b| b.name == block.name),
                "duplicate reply key {} for data channel {}", block.name, self.dc.name
            );
            self.reply_blocks.push(block.clone());
        }

        self.dc.create_or_check_buffers(&self.send_blocks, &self.reply_blocks);
    }

    /// Send the current contents of the send blocks and wait for the reply
    /// to be written into the reply blocks.
    pub fn dispatch(&self) -> Result<(), DispatchError> {
        if self.dc.terminated() {
            return Err(DispatchError::Terminated);
        }

        let slot = match self.dc.get_slot() {
            Some(slot) => slot,
            None => return Err(DispatchError::NoSlot)
        };

        self.dc.fill_slot(slot, &self.send_blocks);
        self.dc.mark_slot_filled(slot);

        if !self.dc.get_reply(slot, &self.reply_blocks) {
            return Err(DispatchError::Terminated);
        }

        self.dc.release_slot(slot);
        Ok(())
    }

    /// Send the current contents of the send blocks and discard the reply
    /// without waiting for it.
    pub fn dispatch_no_reply(&self) -> Result<(), DispatchError> {
        if self.dc.terminated() {
            return Err(DispatchError::Terminated);
        }

        let slot = match self.dc.get_slot() {
            Some(slot) => slot,
            None => return Err(DispatchError::NoSlot)
        };

        self.dc.fill_slot(slot, &self.send_blocks);
        self.dc.mark_slot_filled_auto_release(slot);
        Ok(())
    }

    pub fn terminate(&self) {
        self.dc.terminate();
    }

    pub fn terminated(&self) -> bool {
        self.dc.terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_tensor::{Dtype, Tensor};
    use std::collections::HashMap;
    use std::thread;

    #[test]
    fn dispatch_roundtrip() {
        let dc = Arc::new(DataChannel::new("test", 1, -1));
        let s = Arc::new(DataBlock::new("s", &[1], Dtype::F32));
        let a = Arc::new(DataBlock::new("a", &[1], Dtype::F32));

        let mut dispatcher = Dispatcher::new(dc.clone());
        dispatcher.add_data_blocks(vec! [s.clone()], vec! [a.clone()]);

        let consumer = thread::spawn(move || {
            let input = dc.get_input().unwrap();
            let mut reply = HashMap::new();
            reply.insert(
                "a".to_string(),
                Tensor::from_f32(&[1, 1], vec! [input["s"].as_f32()[0] + 41.0])
            );
            dc.set_reply(&reply);
        });

        s.set(&Tensor::scalar(1.0));
        assert_eq!(dispatcher.dispatch(), Ok(()));
        assert_eq!(a.snapshot().as_f32(), &[42.0]);

        consumer.join().unwrap();
    }

    #[test]
    fn dispatch_after_terminate() {
        let dc = Arc::new(DataChannel::new("test", 1, -1));
        let s = Arc::new(DataBlock::new("s", &[1], Dtype::F32));

        let mut dispatcher = Dispatcher::new(dc.clone());
        dispatcher.add_data_blocks(vec! [s], vec! []);

        dc.terminate();
        assert_eq!(dispatcher.dispatch_no_reply(), Err(DispatchError::Terminated));
    }
}
