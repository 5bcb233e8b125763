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

use std::io::{self, BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};

use pz_tensor::Tensor;

use crate::wire::Message;

pub type TrajectoryHandler = Box<dyn Fn(Vec<(String, Tensor)>) + Send + Sync>;

/// The learner-side endpoint. Accepts actor connections, feeds incoming
/// trajectories to the registered handler, serves model state dicts, and
/// aggregates per-model results for Elo-style bookkeeping.
pub struct DistributedServer {
    weak: Weak<DistributedServer>,
    on_train_data: Mutex<Option<TrajectoryHandler>>,
    models: DashMap<String, Arc<Vec<(String, Tensor)>>>,
    results: DashMap<String, (f64, f64)>,
    latest_id: Mutex<String>,
    terminate: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>
}

impl DistributedServer {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            on_train_data: Mutex::new(None),
            models: DashMap::new(),
            results: DashMap::new(),
            latest_id: Mutex::new(String::new()),
            terminate: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new())
        })
    }

    /// Register the callback invoked for every inbound trajectory.
    ///
    /// # Arguments
    ///
    /// * `handler` -
    ///
    pub fn set_train_data_handler(&self, handler: TrajectoryHandler) {
        *self.on_train_data.lock().expect("could not acquire handler") = Some(handler);
    }

    /// Publish (or replace) the model stored under `id`, and make it the
    /// model served to clients.
    ///
    /// # Arguments
    ///
    /// * `id` -
    /// * `state_dict` -
    ///
    pub fn update_model(&self, id: &str, state_dict: Vec<(String, Tensor)>) {
        self.models.insert(id.to_string(), Arc::new(state_dict));
        *self.latest_id.lock().expect("could not acquire model id") = id.to_string();
    }

    /// Record a weighted game result for each participating model.
    ///
    /// # Arguments
    ///
    /// * `reward` -
    /// * `models` -
    ///
    pub fn add_result(&self, reward: f32, models: &[(String, f32)]) {
        for (id, weight) in models {
            let mut entry = self.results.entry(id.clone()).or_insert((0.0, 0.0));

            entry.0 += reward as f64 * *weight as f64;
            entry.1 += *weight as f64;
        }
    }

    /// Returns the average weighted reward recorded for the given model.
    ///
    /// # Arguments
    ///
    /// * `id` -
    ///
    pub fn result_for(&self, id: &str) -> Option<f64> {
        self.results.get(id).map(|entry| {
            if entry.1 > 0.0 { entry.0 / entry.1 } else { 0.0 }
        })
    }

    fn latest_model(&self) -> Option<(String, Arc<Vec<(String, Tensor)>>)> {
        let id = self.latest_id.lock().expect("could not acquire model id").clone();

        if id.is_empty() {
            None
        } else {
            self.models.get(&id).map(|dict| (id, dict.clone()))
        }
    }

    fn serve_connection(&self, stream: TcpStream) {
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into());
        let mut reader = BufReader::new(stream.try_clone().expect("could not clone stream"));
        let mut writer = BufWriter::new(stream);

        info!("accepted connection from {}", peer);

        while !self.terminate.load(Ordering::Acquire) {
            let message = match Message::read_from(&mut reader) {
                Ok(message) => message,
                Err(reason) => {
                    info!("connection {} closed: {}", peer, reason);
                    break;
                }
            };

            match message {
                Message::Trajectory(pairs) => {
                    if let Some(handler) = self.on_train_data.lock().expect("could not acquire handler").as_ref() {
                        handler(pairs);
                    }
                },
                Message::ModelRequest { is_tournament_opponent: _ } => {
                    if let Some((model_id, state_dict)) = self.latest_model() {
                        let reply = Message::ModelUpdate {
                            model_id,
                            state_dict: state_dict.as_ref().clone()
                        };

                        if let Err(reason) = reply.write_to(&mut writer) {
                            warn!("could not send model to {}: {}", peer, reason);
                            break;
                        }
                    }
                },
                Message::Result { reward, models } => {
                    self.add_result(reward, &models);
                },
                Message::ModelUpdate { model_id, state_dict } => {
                    // a trainer pushing a new model revision
                    self.update_model(&model_id, state_dict);
                }
            }
        }
    }

    /// Bind to `endpoint` and start accepting connections in the
    /// background.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - e.g. `127.0.0.1:5611`
    ///
    pub fn start(&self, endpoint: &str) -> io::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(endpoint)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        info!("listening on {}", addr);

        let me = self.weak.upgrade().expect("the server is gone");
        let acceptor = thread::Builder::new()
            .name("server acceptor".into())
            .spawn(move || {
                while !me.terminate.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            stream.set_nonblocking(false).ok();

                            let me2 = me.clone();
                            let handle = thread::Builder::new()
                                .name("server connection".into())
                                .spawn(move || me2.serve_connection(stream))
                                .expect("could not spawn connection thread");

                            me.threads.lock().expect("could not acquire threads").push(handle);
                        },
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(50));
                        },
                        Err(reason) => {
                            warn!("accept failed: {}", reason);
                            thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
            })
            .expect("could not spawn acceptor thread");

        self.threads.lock().expect("could not acquire threads").push(acceptor);
        Ok(addr)
    }

    /// Stop accepting connections and join the background threads.
    /// Connections blocked on a read are abandoned to finish on their own.
    pub fn stop(&self) {
        self.terminate.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_are_weighted() {
        let server = DistributedServer::new();

        server.add_result(1.0, &[("dev".to_string(), 0.5), ("old".to_string(), 0.5)]);
        server.add_result(-1.0, &[("dev".to_string(), 1.0)]);

        assert_eq!(server.result_for("old"), Some(1.0));
        assert_eq!(server.result_for("dev"), Some((0.5 - 1.0) / 1.5));
        assert_eq!(server.result_for("unknown"), None);
    }

    #[test]
    fn latest_model_follows_updates() {
        let server = DistributedServer::new();
        assert!(server.latest_model().is_none());

        server.update_model("dev", vec! [("w".to_string(), Tensor::scalar(1.0))]);
        server.update_model("candidate", vec! [("w".to_string(), Tensor::scalar(2.0))]);

        let (id, dict) = server.latest_model().unwrap();
        assert_eq!(id, "candidate");
        assert_eq!(dict[0].1.as_f32(), &[2.0]);
    }
}
