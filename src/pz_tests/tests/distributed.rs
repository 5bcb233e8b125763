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

use std::sync::Arc;

use pz_nn::{Device, ModelManager, ScriptModule};
use pz_tensor::{DataBlock, Dtype, Tensor};
use pz_tests::{toy_graph_config, wait_until};
use pz_tube::Dispatcher;

fn manager(num_act_channels: usize) -> Arc<ModelManager> {
    ModelManager::new(
        ScriptModule::new(toy_graph_config()),
        2,
        num_act_channels,
        &[Device::Cpu],
        32,
        1,
        16,
        100
    )
}

#[test]
fn actor_and_learner_exchange_models_and_trajectories() {
    // learner side: no actors, just the endpoint and the replay buffer
    let learner = manager(0);
    learner.start();
    let addr = learner.start_server("127.0.0.1:0").unwrap();

    // publish a model whose outputs are recognisably different from the
    // fresh initialization
    let mut published = ScriptModule::new(toy_graph_config());
    published.set_param("value_head.linear.bias", &Tensor::scalar(3.0));
    learner.update_model(&published.state_dict());

    // actor side
    let actor = manager(0);
    actor.start();
    actor.start_client(&addr.to_string());

    // the model-update loop requests immediately on connect; once it lands
    // the local replicas produce the published value head
    let feat = Tensor::zeros(&[1, 2, 3, 3], Dtype::F32);
    let expected = published.forward(&feat, None).v;

    wait_until("the model update to arrive", 60, || {
        let mut v = Tensor::zeros(&[1, 1], Dtype::F32);
        let mut pi = Tensor::zeros(&[1, 1, 3, 3], Dtype::F32);

        actor.batch_act(&feat, &mut v, &mut pi, None, None);
        (v.as_f32()[0] - expected.as_f32()[0]).abs() < 1e-6
    });

    // trajectories pushed into the actor's train channel end up in the
    // learner's replay buffer
    let block = Arc::new(DataBlock::new("v", &[1], Dtype::F32));
    let mut dispatcher = Dispatcher::new(actor.train_channel());
    dispatcher.add_data_blocks(vec! [block.clone()], vec! []);

    for i in 0..3 {
        block.set(&Tensor::scalar(i as f32));
        dispatcher.dispatch_no_reply().unwrap();
    }

    wait_until("trajectories at the learner", 60, || learner.buffer_num_add() >= 3);
    assert_eq!(actor.buffer_num_add(), 0, "client added to its local buffer");

    actor.shutdown();
    learner.shutdown();
}
