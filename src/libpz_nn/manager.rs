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
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use pz_tensor::Tensor;
use pz_tube::client::DistributedClient;
use pz_tube::server::DistributedServer;
use pz_tube::{DataChannel, ReplayBuffer};
use pz_utils::{set_thread_priority, thread_id, PriorityMutex};

use crate::graph::ScriptModule;

/// Where a model replica lives. Without a CUDA build every replica
/// executes on the host; the device is a placement tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(usize)
}

impl Device {
    /// Parse a device string such as `cpu` or `cuda:1`.
    ///
    /// # Arguments
    ///
    /// * `text` -
    ///
    pub fn parse(text: &str) -> Option<Device> {
        if text == "cpu" {
            Some(Device::Cpu)
        } else if let Some(ordinal) = text.strip_prefix("cuda:") {
            ordinal.parse().ok().map(Device::Cuda)
        } else if text == "cuda" {
            Some(Device::Cuda(0))
        } else {
            None
        }
    }

    pub fn is_cuda(self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Device::Cpu => write!(fmt, "cpu"),
            Device::Cuda(ordinal) => write!(fmt, "cuda:{}", ordinal)
        }
    }
}

/// Owns the model replicas, their act/train data channels, and the replay
/// buffer. Every forward pass goes through a per-replica priority mutex so
/// that a model update can pre-empt the act hot path without starving it.
pub struct ModelManager {
    models: Vec<PriorityMutex<ScriptModule>>,
    devices: Vec<Device>,
    act_channels: Vec<Arc<DataChannel>>,
    train_channel: Arc<DataChannel>,
    replay_buffer: Arc<ReplayBuffer>,
    next_act_index: AtomicUsize,
    server: Mutex<Option<Arc<DistributedServer>>>,
    client: Mutex<Option<Arc<DistributedClient>>>,
    is_tournament_opponent: AtomicBool,
    dont_request_model_updates: AtomicBool,
    terminate: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<ModelManager>
}

impl ModelManager {
    /// Create a manager holding one replica of `module` per device.
    ///
    /// # Arguments
    ///
    /// * `module` -
    /// * `act_batchsize` - slots per act channel
    /// * `num_act_channels` - number of act channels (and act threads)
    /// * `devices` -
    /// * `replay_capacity` -
    /// * `seed` -
    /// * `train_slots` / `train_timeout_ms` - train channel geometry
    ///
    pub fn new(
        module: ScriptModule,
        act_batchsize: usize,
        num_act_channels: usize,
        devices: &[Device],
        replay_capacity: usize,
        seed: u64,
        train_slots: usize,
        train_timeout_ms: i64
    ) -> Arc<Self> {
        assert!(!devices.is_empty(), "at least one device is required");

        let state_dict = module.state_dict();
        let models = devices.iter()
            .map(|_| {
                let mut replica = ScriptModule::new(module.config().clone());
                replica.load_state_dict(&state_dict);

                PriorityMutex::new(replica)
            })
            .collect::<Vec<_>>();

        let act_channels = (0..num_act_channels)
            .map(|i| Arc::new(DataChannel::new(&format!("act{}", i), act_batchsize, -1)))
            .collect();

        Arc::new_cyclic(|weak| Self {
            models,
            devices: devices.to_vec(),
            act_channels,
            train_channel: Arc::new(DataChannel::new("train", train_slots, train_timeout_ms)),
            replay_buffer: ReplayBuffer::new(replay_capacity, seed),
            next_act_index: AtomicUsize::new(0),
            server: Mutex::new(None),
            client: Mutex::new(None),
            is_tournament_opponent: AtomicBool::new(false),
            dont_request_model_updates: AtomicBool::new(false),
            terminate: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            weak: weak.clone()
        })
    }

    pub fn train_channel(&self) -> Arc<DataChannel> {
        self.train_channel.clone()
    }

    pub fn act_channels(&self) -> Vec<Arc<DataChannel>> {
        self.act_channels.clone()
    }

    pub fn replay_buffer(&self) -> Arc<ReplayBuffer> {
        self.replay_buffer.clone()
    }

    pub fn device(&self) -> Device {
        self.devices[0]
    }

    pub fn is_cuda(&self) -> bool {
        self.devices.iter().any(|d| d.is_cuda())
    }

    pub fn value_outputs(&self) -> usize {
        self.models[0].lock().config().value_outputs
    }

    pub fn rnn_seqlen(&self) -> usize {
        self.models[0].lock().config().rnn_seqlen
    }

    pub fn rnn_state_size(&self) -> Vec<i64> {
        let channels = self.models[0].lock().config().rnn_channels;

        if channels == 0 {
            vec! []
        } else {
            vec! [channels as i64]
        }
    }

    pub fn set_is_tournament_opponent(&self, mode: bool) {
        self.is_tournament_opponent.store(mode, Ordering::Release);
    }

    pub fn is_tournament_opponent(&self) -> bool {
        self.is_tournament_opponent.load(Ordering::Acquire)
    }

    pub fn set_dont_request_model_updates(&self, mode: bool) {
        self.dont_request_model_updates.store(mode, Ordering::Release);
    }

    /// Whether this manager publishes game outcomes for rating bookkeeping.
    pub fn wants_tournament_result(&self) -> bool {
        self.is_tournament_opponent() && !self.dont_request_model_updates.load(Ordering::Acquire)
    }

    /// The id under which forward passes currently act: the last model id
    /// received from the learner, or `dev` when running standalone.
    pub fn tournament_model_id(&self) -> String {
        match self.client.lock().expect("could not acquire client").as_ref() {
            Some(client) => client.model_id(),
            None => "dev".to_string()
        }
    }

    /// Copy the given state dict into every replica, pre-empting ongoing
    /// forward passes. Server-role managers also republish the dict to
    /// their clients as `dev`.
    ///
    /// # Arguments
    ///
    /// * `state_dict` -
    ///
    pub fn update_model(&self, state_dict: &[(String, Tensor)]) {
        info!("-- update model --");

        if let Some(server) = self.server.lock().expect("could not acquire server").as_ref() {
            server.update_model("dev", state_dict.to_vec());
        }

        for model in &self.models {
            set_thread_priority(-9);
            model.lock().load_state_dict(state_dict);
        }
        set_thread_priority(0);
    }

    /// Publish a model under an explicit id so that tournament opponents
    /// can request it. Only meaningful in the server role.
    ///
    /// # Arguments
    ///
    /// * `id` -
    /// * `state_dict` -
    ///
    pub fn add_tournament_model(&self, id: &str, state_dict: Vec<(String, Tensor)>) {
        if let Some(server) = self.server.lock().expect("could not acquire server").as_ref() {
            info!("-- add model {} --", id);
            server.update_model(id, state_dict);
        }
    }

    /// Run a forward pass on a round-robin replica, at the calling
    /// thread's priority. Returns the id of the model that acted.
    ///
    /// # Arguments
    ///
    /// * `feat` - `[N, C, H, W]`
    /// * `v` - output, `[N, value_outputs]`
    /// * `pi` - output, `[N, P, H, W]`
    /// * `rnn_state` / `rnn_state_out` - recurrent state, `[N, channels]`
    ///
    pub fn batch_act(
        &self,
        feat: &Tensor,
        v: &mut Tensor,
        pi: &mut Tensor,
        rnn_state: Option<&Tensor>,
        rnn_state_out: Option<&mut Tensor>
    ) -> String {
        let n = self.next_act_index.fetch_add(1, Ordering::AcqRel) % self.models.len();

        set_thread_priority(thread_id() as i32);
        let model = self.models[n].lock();
        let id = self.tournament_model_id();
        let output = model.forward(feat, rnn_state);
        drop(model);

        v.copy_from(&output.v);
        pi.copy_from(&output.pi);

        if let Some(out) = rnn_state_out {
            out.copy_from(&output.rnn_state_out.expect("model is not recurrent"));
        }

        id
    }

    /// Suggest how many concurrent games a thread should run for features
    /// of the given shape, bounding the feature working set.
    ///
    /// # Arguments
    ///
    /// * `feat_size` -
    ///
    pub fn find_batch_size(&self, feat_size: &[i64]) -> usize {
        const BUDGET_BYTES: usize = 64 << 20;

        let row_bytes = feat_size.iter().product::<i64>() as usize * 4;
        (BUDGET_BYTES / row_bytes.max(1)).max(1).min(512)
    }

    /// Start the act and train forwarding threads.
    pub fn start(&self) {
        let me = self.weak.upgrade().expect("model manager is gone");
        let mut threads = self.threads.lock().expect("could not acquire threads");

        {
            let me = me.clone();
            threads.push(
                thread::Builder::new()
                    .name("train thread".into())
                    .spawn(move || me.train_thread())
                    .expect("could not spawn train thread")
            );
        }

        for i in 0..self.act_channels.len() {
            let me = me.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("act thread {}", i))
                    .spawn(move || me.act_thread(i))
                    .expect("could not spawn act thread")
            );
        }
    }

    fn act_thread(&self, index: usize) {
        loop {
            let batch = match self.act_channels[index].get_input() {
                Some(batch) => batch,
                None => break
            };
            if self.terminate.load(Ordering::Acquire) {
                break;
            }

            let feat = &batch["s"];
            let rnn_state = batch.get("rnn_state");

            set_thread_priority(-1);
            let replica = index % self.models.len();
            let model = self.models[replica].lock();
            let output = model.forward(feat, rnn_state);
            drop(model);

            let mut reply = HashMap::new();
            reply.insert("pi_logit".to_string(), output.pi);
            reply.insert("v".to_string(), output.v);
            if rnn_state.is_some() {
                reply.insert(
                    "rnn_state_out".to_string(),
                    output.rnn_state_out.expect("model is not recurrent")
                );
            }

            self.act_channels[index].set_reply(&reply);
        }
    }

    fn train_thread(&self) {
        loop {
            let batch = match self.train_channel.get_input() {
                Some(batch) => batch,
                None => break
            };
            if self.terminate.load(Ordering::Acquire) {
                break;
            }

            let is_client = {
                let client = self.client.lock().expect("could not acquire client");

                match client.as_ref() {
                    Some(client) => {
                        let mut pairs = batch.iter()
                            .map(|(name, tensor)| (name.clone(), tensor.clone()))
                            .collect::<Vec<_>>();
                        pairs.sort_by(|a, b| a.0.cmp(&b.0));

                        if let Err(reason) = client.send_train_data(pairs) {
                            warn!("could not send trajectory: {}", reason);
                        }

                        true
                    },
                    None => false
                }
            };

            if !is_client {
                self.replay_buffer.add(&batch);
            }

            self.train_channel.set_reply(&HashMap::new());
        }
    }

    /// Bind the learner endpoint: inbound trajectories feed the local
    /// replay buffer and models published here are served to clients.
    ///
    /// # Arguments
    ///
    /// * `endpoint` -
    ///
    pub fn start_server(&self, endpoint: &str) -> io::Result<SocketAddr> {
        if !self.act_channels.is_empty() {
            warn!("server role with {} act channels; expected a pure learner", self.act_channels.len());
        }

        let server = DistributedServer::new();
        let weak = self.weak.clone();

        server.set_train_data_handler(Box::new(move |pairs| {
            if let Some(me) = weak.upgrade() {
                let batch = pairs.into_iter().collect::<HashMap<_, _>>();
                me.replay_buffer.add(&batch);
            }
        }));

        let addr = server.start(endpoint)?;
        *self.server.lock().expect("could not acquire server") = Some(server);
        Ok(addr)
    }

    /// Connect to a learner: inbound model blobs update the replicas, and a
    /// background loop requests a fresh model roughly every 40 seconds.
    ///
    /// # Arguments
    ///
    /// * `hostname` -
    ///
    pub fn start_client(&self, hostname: &str) {
        let client = DistributedClient::new();
        let weak = self.weak.clone();

        client.set_model_update_handler(Box::new(move |id, state_dict| {
            if let Some(me) = weak.upgrade() {
                if !me.dont_request_model_updates.load(Ordering::Acquire) {
                    info!("on update model '{}'", id);
                    me.update_model(state_dict);
                }
            }
        }));
        client.connect(hostname);

        {
            let me = self.weak.upgrade().expect("model manager is gone");
            let client = client.clone();

            self.threads.lock().expect("could not acquire threads").push(
                thread::Builder::new()
                    .name("model update thread".into())
                    .spawn(move || {
                        while !me.terminate.load(Ordering::Acquire) && !me.train_channel.terminated() {
                            let mut steps = 1;

                            if !me.dont_request_model_updates.load(Ordering::Acquire) {
                                // retry quickly until the connection is up,
                                // then settle into the 40 second cadence
                                if client.request_model(me.is_tournament_opponent()).is_ok() {
                                    steps = 20;
                                }
                            }

                            for _ in 0..steps {
                                if me.terminate.load(Ordering::Acquire) || me.train_channel.terminated() {
                                    break;
                                }
                                thread::sleep(Duration::from_secs(2));
                            }
                        }
                    })
                    .expect("could not spawn model update thread")
            );
        }

        *self.client.lock().expect("could not acquire client") = Some(client);
    }

    /// Report a finished game, weighted per model id, to the learner.
    /// Only tournament opponents that accept model updates publish results.
    ///
    /// # Arguments
    ///
    /// * `reward` -
    /// * `models` -
    ///
    pub fn result(&self, reward: f32, models: Vec<(String, f32)>) {
        if !self.wants_tournament_result() {
            return;
        }

        if let Some(client) = self.client.lock().expect("could not acquire client").as_ref() {
            if let Err(reason) = client.send_result(reward, models) {
                warn!("could not send result: {}", reason);
            }
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.replay_buffer.size()
    }

    pub fn buffer_full(&self) -> bool {
        self.replay_buffer.full()
    }

    pub fn buffer_num_add(&self) -> i64 {
        self.replay_buffer.num_add()
    }

    pub fn buffer_num_sample(&self) -> i64 {
        self.replay_buffer.num_sample()
    }

    pub fn sample(&self, sample_size: usize) -> HashMap<String, Tensor> {
        self.replay_buffer.sample(sample_size)
    }

    pub fn buffer_state(&self) -> Vec<u8> {
        self.replay_buffer.to_state()
    }

    pub fn set_buffer_state(&self, state: &[u8]) -> io::Result<()> {
        self.replay_buffer.init_from_state(state)
    }

    /// Terminate the channels, stop the network endpoints, and join every
    /// background thread.
    pub fn shutdown(&self) {
        self.terminate.store(true, Ordering::Release);

        for channel in &self.act_channels {
            channel.terminate();
        }
        self.train_channel.terminate();

        if let Some(client) = self.client.lock().expect("could not acquire client").take() {
            client.stop();
        }
        if let Some(server) = self.server.lock().expect("could not acquire server").take() {
            server.stop();
        }

        let threads = std::mem::replace(
            &mut *self.threads.lock().expect("could not acquire threads"),
            Vec::new()
        );
        for thread in threads {
            thread.join().ok();
        }

        self.replay_buffer.shutdown();
    }
}

impl Drop for ModelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphConfig;
    use pz_tensor::Dtype;

    fn toy_manager() -> Arc<ModelManager> {
        let config = GraphConfig {
            model_id: "dev".to_string(),
            feature_size: vec! [2, 3, 3],
            action_size: vec! [1, 3, 3],
            num_blocks: 1,
            num_channels: 4,
            value_outputs: 1,
            rnn_channels: 0,
            rnn_seqlen: 0
        };

        ModelManager::new(ScriptModule::new(config), 2, 0, &[Device::Cpu], 16, 1, 8, 250)
    }

    #[test]
    fn parse_devices() {
        assert_eq!(Device::parse("cpu"), Some(Device::Cpu));
        assert_eq!(Device::parse("cuda:1"), Some(Device::Cuda(1)));
        assert_eq!(Device::parse("cuda"), Some(Device::Cuda(0)));
        assert_eq!(Device::parse("tpu"), None);
    }

    #[test]
    fn batch_act_fills_outputs() {
        let manager = toy_manager();
        let feat = Tensor::zeros(&[2, 2, 3, 3], Dtype::F32);
        let mut v = Tensor::zeros(&[2, 1], Dtype::F32);
        let mut pi = Tensor::zeros(&[2, 1, 3, 3], Dtype::F32);

        let id = manager.batch_act(&feat, &mut v, &mut pi, None, None);
        assert_eq!(id, "dev");
        manager.shutdown();
    }

    #[test]
    fn train_thread_feeds_replay_buffer() {
        use pz_tensor::DataBlock;
        use pz_tube::Dispatcher;

        let manager = toy_manager();
        manager.start();

        let block = Arc::new(DataBlock::new("v", &[1], Dtype::F32));
        let mut dispatcher = Dispatcher::new(manager.train_channel());
        dispatcher.add_data_blocks(vec! [block.clone()], vec! []);

        for i in 0..4 {
            block.set(&Tensor::scalar(i as f32));
            dispatcher.dispatch_no_reply().unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while manager.buffer_num_add() < 4 {
            assert!(std::time::Instant::now() < deadline, "trajectories never arrived");
            thread::sleep(Duration::from_millis(10));
        }

        manager.shutdown();
    }

    #[test]
    fn update_model_changes_outputs() {
        let manager = toy_manager();
        let feat = Tensor::from_f32(&[1, 2, 3, 3], (0..18).map(|i| i as f32 / 18.0).collect());
        let mut v = Tensor::zeros(&[1, 1], Dtype::F32);
        let mut pi = Tensor::zeros(&[1, 1, 3, 3], Dtype::F32);

        manager.batch_act(&feat, &mut v, &mut pi, None, None);
        let before = v.clone();

        let mut donor = ScriptModule::new(GraphConfig {
            model_id: "dev".to_string(),
            feature_size: vec! [2, 3, 3],
            action_size: vec! [1, 3, 3],
            num_blocks: 1,
            num_channels: 4,
            value_outputs: 1,
            rnn_channels: 0,
            rnn_seqlen: 0
        });
        donor.set_param("value_head.linear.bias", &Tensor::scalar(0.9));
        manager.update_model(&donor.state_dict());

        manager.batch_act(&feat, &mut v, &mut pi, None, None);
        assert_ne!(before, v);
        manager.shutdown();
    }
}
