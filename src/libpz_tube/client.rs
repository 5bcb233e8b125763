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

use std::io::{self, BufReader};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use pz_tensor::Tensor;

use crate::wire::Message;

pub type ModelUpdateHandler = Box<dyn Fn(&str, &[(String, Tensor)]) + Send + Sync>;

/// The actor-side endpoint. Maintains a connection to the learner with
/// automatic reconnect, pushes trajectories and results, and hands inbound
/// model updates to the registered handler.
pub struct DistributedClient {
    weak: Weak<DistributedClient>,
    on_update_model: Mutex<Option<ModelUpdateHandler>>,
    stream: Mutex<Option<TcpStream>>,
    model_id: Mutex<String>,
    terminate: Arc<AtomicBool>,
    reader_thread: Mutex<Option<JoinHandle<()>>>
}

impl DistributedClient {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            on_update_model: Mutex::new(None),
            stream: Mutex::new(None),
            model_id: Mutex::new("dev".to_string()),
            terminate: Arc::new(AtomicBool::new(false)),
            reader_thread: Mutex::new(None)
        })
    }

    /// Register the callback invoked for every inbound model update.
    ///
    /// # Arguments
    ///
    /// * `handler` -
    ///
    pub fn set_model_update_handler(&self, handler: ModelUpdateHandler) {
        *self.on_update_model.lock().expect("could not acquire handler") = Some(handler);
    }

    /// Connect to the learner at `hostname` and keep reading messages in
    /// the background, reconnecting with backoff on any network error.
    ///
    /// # Arguments
    ///
    /// * `hostname` - e.g. `127.0.0.1:5611`
    ///
    pub fn connect(&self, hostname: &str) {
        let me = self.weak.upgrade().expect("the client is gone");
        let hostname = hostname.to_string();

        let handle = thread::Builder::new()
            .name("client reader".into())
            .spawn(move || me.reader_loop(&hostname))
            .expect("could not spawn client reader");

        *self.reader_thread.lock().expect("could not acquire reader thread") = Some(handle);
    }

    fn reader_loop(&self, hostname: &str) {
        let mut backoff = Duration::from_secs(1);

        while !self.terminate.load(Ordering::Acquire) {
            let stream = match TcpStream::connect(hostname) {
                Ok(stream) => {
                    info!("connected to {}", hostname);
                    backoff = Duration::from_secs(1);
                    stream
                },
                Err(reason) => {
                    warn!("could not connect to {}: {}", hostname, reason);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                    continue;
                }
            };

            *self.stream.lock().expect("could not acquire stream") =
                Some(stream.try_clone().expect("could not clone stream"));

            let mut reader = BufReader::new(stream);

            loop {
                if self.terminate.load(Ordering::Acquire) {
                    return;
                }

                match Message::read_from(&mut reader) {
                    Ok(Message::ModelUpdate { model_id, state_dict }) => {
                        info!("received model '{}'", model_id);
                        *self.model_id.lock().expect("could not acquire model id") = model_id.clone();

                        if let Some(handler) = self.on_update_model.lock().expect("could not acquire handler").as_ref() {
                            handler(&model_id, &state_dict);
                        }
                    },
                    Ok(_) => { },
                    Err(reason) => {
                        warn!("connection to {} lost: {}", hostname, reason);
                        break;
                    }
                }
            }

            *self.stream.lock().expect("could not acquire stream") = None;
            thread::sleep(backoff);
        }
    }

    fn send(&self, message: &Message) -> io::Result<()> {
        let mut stream = self.stream.lock().expect("could not acquire stream");

        match stream.as_mut() {
            Some(s) => message.write_to(s),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not connected to learner"))
        }
    }

    /// Push a trajectory to the learner. Network failures are non-fatal;
    /// the caller drops the data and continues.
    ///
    /// # Arguments
    ///
    /// * `pairs` -
    ///
    pub fn send_train_data(&self, pairs: Vec<(String, Tensor)>) -> io::Result<()> {
        self.send(&Message::Trajectory(pairs))
    }

    /// Ask the learner for the current model.
    ///
    /// # Arguments
    ///
    /// * `is_tournament_opponent` -
    ///
    pub fn request_model(&self, is_tournament_opponent: bool) -> io::Result<()> {
        self.send(&Message::ModelRequest { is_tournament_opponent })
    }

    /// Report a finished game, weighted per participating model.
    ///
    /// # Arguments
    ///
    /// * `reward` -
    /// * `models` -
    ///
    pub fn send_result(&self, reward: f32, models: Vec<(String, f32)>) -> io::Result<()> {
        self.send(&Message::Result { reward, models })
    }

    /// The id of the most recently received model.
    pub fn model_id(&self) -> String {
        self.model_id.lock().expect("could not acquire model id").clone()
    }

    pub fn connected(&self) -> bool {
        self.stream.lock().expect("could not acquire stream").is_some()
    }

    /// Stop the background reader. A reader blocked on a live connection is
    /// abandoned to exit on the next message or disconnect.
    pub fn stop(&self) {
        self.terminate.store(true, Ordering::Release);

        if let Some(stream) = self.stream.lock().expect("could not acquire stream").take() {
            stream.shutdown(std::net::Shutdown::Both).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::DistributedServer;
    use std::time::Instant;

    fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(10);

        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn model_roundtrip_and_results() {
        let server = DistributedServer::new();
        let addr = server.start("127.0.0.1:0").unwrap();

        server.update_model("dev", vec! [("w".to_string(), Tensor::scalar(42.0))]);

        let received = Arc::new(Mutex::new(Vec::new()));
        let client = DistributedClient::new();
        {
            let received = received.clone();

            client.set_model_update_handler(Box::new(move |id, dict| {
                received.lock().unwrap().push((id.to_string(), dict.to_vec()));
            }));
        }
        client.connect(&addr.to_string());

        wait_until("connection", || client.connected());

        client.request_model(false).unwrap();
        wait_until("model update", || !received.lock().unwrap().is_empty());

        {
            let received = received.lock().unwrap();
            assert_eq!(received[0].0, "dev");
            assert_eq!(received[0].1[0].1.as_f32(), &[42.0]);
        }
        assert_eq!(client.model_id(), "dev");

        client.send_result(1.0, vec! [("dev".to_string(), 1.0)]).unwrap();
        wait_until("result", || server.result_for("dev").is_some());

        client.stop();
        server.stop();
    }

    #[test]
    fn trajectory_reaches_handler() {
        let server = DistributedServer::new();
        let addr = server.start("127.0.0.1:0").unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();

            server.set_train_data_handler(Box::new(move |pairs| {
                received.lock().unwrap().push(pairs);
            }));
        }

        let client = DistributedClient::new();
        client.connect(&addr.to_string());
        wait_until("connection", || client.connected());

        client.send_train_data(vec! [("s".to_string(), Tensor::scalar(7.0))]).unwrap();
        wait_until("trajectory", || !received.lock().unwrap().is_empty());

        assert_eq!(received.lock().unwrap()[0][0].1.as_f32(), &[7.0]);

        client.stop();
        server.stop();
    }
}
