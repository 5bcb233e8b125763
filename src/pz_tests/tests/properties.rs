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
use std::sync::Arc;
use std::thread;

use pz_tensor::{DataBlock, Dtype, Tensor};
use pz_tube::{DataChannel, Dispatcher, ReplayBuffer};

/// Every reply must reach the producer that filled the slot, across many
/// producers and many batches, with and without a consumer timeout.
#[test]
fn replies_reach_their_senders() {
    for &timeout_ms in &[-1i64, 10] {
        let batchsize = if timeout_ms < 0 { 4 } else { 8 };
        let dc = Arc::new(DataChannel::new("echo", batchsize, timeout_ms));

        let consumer = {
            let dc = dc.clone();

            thread::spawn(move || {
                while let Some(input) = dc.get_input() {
                    let s = &input["s"];
                    let reply = Tensor::from_f32(
                        s.shape(),
                        s.as_f32().iter().map(|x| 3.0 * x + 1.0).collect()
                    );

                    let mut replies = HashMap::new();
                    replies.insert("a".to_string(), reply);
                    dc.set_reply(&replies);
                }
            })
        };

        let producers = (0..4).map(|p| {
            let dc = dc.clone();

            thread::spawn(move || {
                let s = Arc::new(DataBlock::new("s", &[1], Dtype::F32));
                let a = Arc::new(DataBlock::new("a", &[1], Dtype::F32));
                let mut dispatcher = Dispatcher::new(dc);
                dispatcher.add_data_blocks(vec! [s.clone()], vec! [a.clone()]);

                for round in 0..25 {
                    let sent = (p * 100 + round) as f32;

                    s.set(&Tensor::scalar(sent));
                    dispatcher.dispatch().expect("dispatch failed");
                    assert_eq!(a.snapshot().as_f32()[0], 3.0 * sent + 1.0);
                }
            })
        }).collect::<Vec<_>>();

        for producer in producers {
            producer.join().unwrap();
        }

        dc.terminate();
        consumer.join().unwrap();

        // all slots are back on the free list
        let (avail, filled, replied) = dc.slot_counts();
        assert_eq!(avail, batchsize);
        assert_eq!((filled, replied), (0, 0));
    }
}

/// The slot counts always sum to the batch size, whatever the in-flight
/// state of the producers is.
#[test]
fn slot_conservation_under_load() {
    let dc = Arc::new(DataChannel::new("load", 8, 10));

    let consumer = {
        let dc = dc.clone();

        thread::spawn(move || {
            while let Some(input) = dc.get_input() {
                let mut replies = HashMap::new();
                replies.insert("a".to_string(), input["s"].clone());
                dc.set_reply(&replies);
            }
        })
    };

    let producers = (0..6).map(|_| {
        let dc = dc.clone();

        thread::spawn(move || {
            let s = Arc::new(DataBlock::new("s", &[1], Dtype::F32));
            let a = Arc::new(DataBlock::new("a", &[1], Dtype::F32));
            let mut dispatcher = Dispatcher::new(dc);
            dispatcher.add_data_blocks(vec! [s.clone()], vec! [a.clone()]);

            for _ in 0..50 {
                dispatcher.dispatch().expect("dispatch failed");
            }
        })
    }).collect::<Vec<_>>();

    for _ in 0..200 {
        let (avail, filled, replied) = dc.slot_counts();
        assert_eq!(avail + filled + replied, 8);
        thread::yield_now();
    }

    for producer in producers {
        producer.join().unwrap();
    }

    dc.terminate();
    consumer.join().unwrap();
}

/// `num_add` and `num_sample` never decrease and `size` never exceeds the
/// capacity, even while writers and readers race.
#[test]
fn replay_counters_are_monotone()  {
    let buffer = ReplayBuffer::new(16, 3);
    buffer.add(&{
        let mut batch = HashMap::new();
        batch.insert("x".to_string(), Tensor::from_f32(&[16, 1], (0..16).map(|i| i as f32).collect()));
        batch
    });

    let writer = {
        let buffer = buffer.clone();

        thread::spawn(move || {
            for i in 0..200 {
                let mut batch = HashMap::new();
                batch.insert("x".to_string(), Tensor::from_f32(&[1, 1], vec! [i as f32]));
                buffer.add(&batch);
            }
        })
    };

    let reader = {
        let buffer = buffer.clone();

        thread::spawn(move || {
            for _ in 0..50 {
                buffer.sample(4);
            }
        })
    };

    let mut last_add = 0;
    let mut last_sample = 0;

    for _ in 0..500 {
        let num_add = buffer.num_add();
        let num_sample = buffer.num_sample();

        assert!(num_add >= last_add, "num_add went backwards");
        assert!(num_sample >= last_sample, "num_sample went backwards");
        assert!(buffer.size() <= buffer.capacity);

        last_add = num_add;
        last_sample = num_sample;
        thread::yield_now();
    }

    writer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(buffer.num_add(), 216);
    // the prefetch pool may have pre-computed batches beyond the 200
    // consumed rows
    assert!(buffer.num_sample() >= 200);
    buffer.shutdown();
}
