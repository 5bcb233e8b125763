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

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use pz_tensor::{Dtype, Tensor};
use pz_utils::rng::Xoshiro256;

/// The architecture of a scripted model. Together with the named weights
/// this fully determines the forward pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphConfig {
    pub model_id: String,

    /// Input planes, `[C, H, W]`.
    pub feature_size: Vec<i64>,

    /// Policy output planes, `[P, H, W]`.
    pub action_size: Vec<i64>,

    pub num_blocks: usize,
    pub num_channels: usize,

    /// `1` for a scalar value in `[-1, 1]`, `3` for win/lose/draw logits.
    pub value_outputs: usize,

    /// Size of the recurrent state vector, `0` for a feed-forward model.
    #[serde(default)]
    pub rnn_channels: usize,

    /// Number of steps per training sequence for recurrent models.
    #[serde(default)]
    pub rnn_seqlen: usize
}

/// The result of a forward pass over a batch.
pub struct ForwardOutput {
    /// Policy logits, `[N, P, H, W]`.
    pub pi: Tensor,

    /// Value output, `[N, value_outputs]`.
    pub v: Tensor,

    /// Next recurrent state, `[N, rnn_channels]`, for recurrent models.
    pub rnn_state_out: Option<Tensor>
}

/// A residual conv tower with policy and value heads (and an optional GRU
/// cell feeding the value head), executed on the CPU. Parameters and
/// buffers are addressed by fully-qualified name, so a state dict from the
/// trainer maps directly onto them.
pub struct ScriptModule {
    config: GraphConfig,
    params: BTreeMap<String, Tensor>
}

fn conv2d(
    input: &[f32], n: usize, c_in: usize, h: usize, w: usize,
    weight: &Tensor, bias: &Tensor, output: &mut [f32]
) {
    let shape = weight.shape();
    let (c_out, k) = (shape[0] as usize, shape[2] as usize);
    assert_eq!(shape[1] as usize, c_in);
    let pad = (k / 2) as i64;

    let weight = weight.as_f32();
    let bias = bias.as_f32();
    let plane = h * w;

    for b in 0..n {
        for o in 0..c_out {
            for y in 0..h {
                for x in 0..w {
                    let mut acc = bias[o];

                    for i in 0..c_in {
                        for ky in 0..k {
                            let yy = y as i64 + ky as i64 - pad;
                            if yy < 0 || yy >= h as i64 {
                                continue;
                            }

                            for kx in 0..k {
                                let xx = x as i64 + kx as i64 - pad;
                                if xx < 0 || xx >= w as i64 {
                                    continue;
                                }

                                acc += weight[((o * c_in + i) * k + ky) * k + kx]
                                    * input[(b * c_in + i) * plane + yy as usize * w + xx as usize];
                            }
                        }
                    }

                    output[(b * c_out + o) * plane + y * w + x] = acc;
                }
            }
        }
    }
}

fn relu_(values: &mut [f32]) {
    for v in values {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

fn linear(input: &[f32], n: usize, in_features: usize, weight: &Tensor, bias: &Tensor, output: &mut [f32]) {
    let out_features = weight.shape()[0] as usize;
    assert_eq!(weight.shape()[1] as usize, in_features);

    let weight = weight.as_f32();
    let bias = bias.as_f32();

    for b in 0..n {
        for o in 0..out_features {
            let mut acc = bias[o];

            for i in 0..in_features {
                acc += weight[o * in_features + i] * input[b * in_features + i];
            }

            output[b * out_features + o] = acc;
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl ScriptModule {
    /// Create a module with freshly initialized weights.
    ///
    /// # Arguments
    ///
    /// * `config` -
    ///
    pub fn new(config: GraphConfig) -> Self {
        assert_eq!(config.feature_size.len(), 3);
        assert_eq!(config.action_size.len(), 3);
        assert!(config.value_outputs == 1 || config.value_outputs == 3);

        let mut out = Self { config, params: BTreeMap::new() };
        let c_in = out.config.feature_size[0] as usize;
        let channels = out.config.num_channels;
        let planes = out.config.action_size[0] as usize;
        let (h, w) = (out.config.feature_size[1] as usize, out.config.feature_size[2] as usize);
        let rnn = out.config.rnn_channels;
        let value_outputs = out.config.value_outputs;

        out.add_conv("trunk.conv_up", channels, c_in, 3);
        for i in 0..out.config.num_blocks {
            out.add_conv(&format!("trunk.block_{}.conv_1", i), channels, channels, 3);
            out.add_conv(&format!("trunk.block_{}.conv_2", i), channels, channels, 3);
        }
        out.add_conv("policy_head.conv", planes, channels, 1);
        out.add_conv("value_head.conv", 1, channels, 1);
        out.add_param("value_head.linear.weight", &[value_outputs as i64, (h * w + rnn) as i64]);
        out.add_param("value_head.linear.bias", &[value_outputs as i64]);

        if rnn > 0 {
            out.add_param("rnn.weight_ih", &[3 * rnn as i64, channels as i64]);
            out.add_param("rnn.weight_hh", &[3 * rnn as i64, rnn as i64]);
            out.add_param("rnn.bias_ih", &[3 * rnn as i64]);
            out.add_param("rnn.bias_hh", &[3 * rnn as i64]);
        }

        out
    }

    fn add_conv(&mut self, name: &str, c_out: usize, c_in: usize, k: usize) {
        self.add_param(&format!("{}.weight", name), &[c_out as i64, c_in as i64, k as i64, k as i64]);
        self.add_param(&format!("{}.bias", name), &[c_out as i64]);
    }

    fn add_param(&mut self, name: &str, shape: &[i64]) {
        // deterministic per-name initialization so that two fresh replicas
        // agree without a state dict exchange
        let seed = name.bytes().fold(0xcbf29ce484222325u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x100000001b3)
        });
        let mut rng = Xoshiro256::new(seed);
        let numel = shape.iter().product::<i64>() as usize;
        let scale = 1.0 / (numel as f32).sqrt().max(1.0);
        let values = (0..numel).map(|_| rng.gen_range(-scale..scale)).collect();

        self.params.insert(name.to_string(), Tensor::from_f32(shape, values));
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    /// Clone of every named parameter and buffer.
    pub fn state_dict(&self) -> Vec<(String, Tensor)> {
        self.params.iter()
            .map(|(name, tensor)| (name.clone(), tensor.clone()))
            .collect()
    }

    /// Copy the given tensors into the matching parameters and buffers by
    /// fully-qualified name. An unknown name or mismatched shape is a
    /// configuration error and aborts the process.
    ///
    /// # Arguments
    ///
    /// * `state_dict` -
    ///
    pub fn load_state_dict(&mut self, state_dict: &[(String, Tensor)]) {
        for (name, tensor) in state_dict {
            let param = self.params.get_mut(name)
                .unwrap_or_else(|| panic!("unknown state dict entry '{}'", name));

            param.copy_from(tensor);
        }
    }

    /// Overwrite a single named parameter.
    ///
    /// # Arguments
    ///
    /// * `name` -
    /// * `tensor` -
    ///
    pub fn set_param(&mut self, name: &str, tensor: &Tensor) {
        let param = self.params.get_mut(name)
            .unwrap_or_else(|| panic!("unknown state dict entry '{}'", name));

        param.copy_from(tensor);
    }

    /// Run the model over a batch of features.
    ///
    /// # Arguments
    ///
    /// * `feat` - `[N, C, H, W]`
    /// * `rnn_state` - `[N, rnn_channels]` for recurrent models
    ///
    pub fn forward(&self, feat: &Tensor, rnn_state: Option<&Tensor>) -> ForwardOutput {
        let n = feat.shape()[0] as usize;
        let c_in = self.config.feature_size[0] as usize;
        let (h, w) = (self.config.feature_size[1] as usize, self.config.feature_size[2] as usize);
        let channels = self.config.num_channels;
        let planes = self.config.action_size[0] as usize;
        let plane = h * w;

        assert_eq!(&feat.shape()[1..], &self.config.feature_size[..], "feature shape mismatch");

        // trunk
        let mut trunk = vec! [0.0; n * channels * plane];
        conv2d(
            feat.as_f32(), n, c_in, h, w,
            &self.params["trunk.conv_up.weight"], &self.params["trunk.conv_up.bias"],
            &mut trunk
        );
        relu_(&mut trunk);

        let mut scratch = vec! [0.0; n * channels * plane];
        let mut scratch2 = vec! [0.0; n * channels * plane];

        for i in 0..self.config.num_blocks {
            conv2d(
                &trunk, n, channels, h, w,
                &self.params[&format!("trunk.block_{}.conv_1.weight", i)],
                &self.params[&format!("trunk.block_{}.conv_1.bias", i)],
                &mut scratch
            );
            relu_(&mut scratch);
            conv2d(
                &scratch, n, channels, h, w,
                &self.params[&format!("trunk.block_{}.conv_2.weight", i)],
                &self.params[&format!("trunk.block_{}.conv_2.bias", i)],
                &mut scratch2
            );

            for (t, s) in trunk.iter_mut().zip(scratch2.iter()) {
                *t += s;
            }
            relu_(&mut trunk);
        }

        // policy head
        let mut pi = Tensor::zeros(
            &[n as i64, planes as i64, h as i64, w as i64],
            Dtype::F32
        );
        conv2d(
            &trunk, n, channels, h, w,
            &self.params["policy_head.conv.weight"], &self.params["policy_head.conv.bias"],
            pi.as_f32_mut()
        );

        // optional recurrent state update from the pooled trunk
        let rnn = self.config.rnn_channels;
        let rnn_state_out = if rnn > 0 {
            let mut pooled = vec! [0.0; n * channels];
            for b in 0..n {
                for c in 0..channels {
                    let at = (b * channels + c) * plane;
                    pooled[b * channels + c] = trunk[at..at + plane].iter().sum::<f32>() / plane as f32;
                }
            }

            let zeros = Tensor::zeros(&[n as i64, rnn as i64], Dtype::F32);
            let state = rnn_state.unwrap_or(&zeros);
            assert_eq!(state.shape(), &[n as i64, rnn as i64], "rnn state shape mismatch");

            Some(self.gru_cell(&pooled, n, channels, state))
        } else {
            None
        };

        // value head
        let mut value_plane = vec! [0.0; n * plane];
        conv2d(
            &trunk, n, channels, h, w,
            &self.params["value_head.conv.weight"], &self.params["value_head.conv.bias"],
            &mut value_plane
        );
        relu_(&mut value_plane);

        let in_features = plane + rnn;
        let mut value_in = vec! [0.0; n * in_features];
        for b in 0..n {
            value_in[b*in_features..b*in_features+plane].copy_from_slice(&value_plane[b*plane..(b+1)*plane]);

            if let Some(state) = &rnn_state_out {
                value_in[b*in_features+plane..(b+1)*in_features]
                    .copy_from_slice(&state.as_f32()[b*rnn..(b+1)*rnn]);
            }
        }

        let mut v = Tensor::zeros(&[n as i64, self.config.value_outputs as i64], Dtype::F32);
        linear(
            &value_in, n, in_features,
            &self.params["value_head.linear.weight"], &self.params["value_head.linear.bias"],
            v.as_f32_mut()
        );

        if self.config.value_outputs == 1 {
            for x in v.as_f32_mut() {
                *x = x.tanh();
            }
        }

        ForwardOutput { pi, v, rnn_state_out }
    }

    fn gru_cell(&self, input: &[f32], n: usize, in_features: usize, state: &Tensor) -> Tensor {
        let rnn = self.config.rnn_channels;
        let w_ih = self.params["rnn.weight_ih"].as_f32();
        let w_hh = self.params["rnn.weight_hh"].as_f32();
        let b_ih = self.params["rnn.bias_ih"].as_f32();
        let b_hh = self.params["rnn.bias_hh"].as_f32();
        let h_in = state.as_f32();

        let mut out = Tensor::zeros(&[n as i64, rnn as i64], Dtype::F32);
        let h_out = out.as_f32_mut();

        let gate = |row: usize, b: usize| -> (f32, f32) {
            let mut gi = b_ih[row];
            for i in 0..in_features {
                gi += w_ih[row * in_features + i] * input[b * in_features + i];
            }

            let mut gh = b_hh[row];
            for i in 0..rnn {
                gh += w_hh[row * rnn + i] * h_in[b * rnn + i];
            }

            (gi, gh)
        };

        for b in 0..n {
            for j in 0..rnn {
                let (ri, rh) = gate(j, b);
                let (zi, zh) = gate(rnn + j, b);
                let (ni, nh) = gate(2 * rnn + j, b);

                let r = sigmoid(ri + rh);
                let z = sigmoid(zi + zh);
                let candidate = (ni + r * nh).tanh();

                h_out[b * rnn + j] = (1.0 - z) * candidate + z * h_in[b * rnn + j];
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_config() -> GraphConfig {
        GraphConfig {
            model_id: "dev".to_string(),
            feature_size: vec! [2, 3, 3],
            action_size: vec! [1, 3, 3],
            num_blocks: 1,
            num_channels: 8,
            value_outputs: 1,
            rnn_channels: 0,
            rnn_seqlen: 0
        }
    }

    #[test]
    fn forward_shapes() {
        let module = ScriptModule::new(toy_config());
        let feat = Tensor::zeros(&[4, 2, 3, 3], Dtype::F32);
        let out = module.forward(&feat, None);

        assert_eq!(out.pi.shape(), &[4, 1, 3, 3]);
        assert_eq!(out.v.shape(), &[4, 1]);
        assert!(out.rnn_state_out.is_none());
        assert!(out.v.as_f32().iter().all(|v| *v >= -1.0 && *v <= 1.0));
    }

    #[test]
    fn update_is_idempotent() {
        let mut module = ScriptModule::new(toy_config());
        let mut donor = ScriptModule::new(toy_config());
        donor.set_param("value_head.linear.bias", &Tensor::scalar(0.25));
        let state_dict = donor.state_dict();

        let feat = Tensor::from_f32(&[1, 2, 3, 3], (0..18).map(|i| i as f32 / 18.0).collect());

        module.load_state_dict(&state_dict);
        let once = module.forward(&feat, None);

        module.load_state_dict(&state_dict);
        let twice = module.forward(&feat, None);

        assert_eq!(once.pi, twice.pi);
        assert_eq!(once.v, twice.v);
    }

    #[test]
    #[should_panic]
    fn unknown_state_dict_entry() {
        let mut module = ScriptModule::new(toy_config());
        module.load_state_dict(&[("no.such.param".to_string(), Tensor::scalar(0.0))]);
    }

    #[test]
    fn fresh_replicas_agree() {
        let a = ScriptModule::new(toy_config());
        let b = ScriptModule::new(toy_config());
        let feat = Tensor::from_f32(&[1, 2, 3, 3], (0..18).map(|i| (i % 2) as f32).collect());

        assert_eq!(a.forward(&feat, None).pi, b.forward(&feat, None).pi);
    }

    #[test]
    fn recurrent_state_advances() {
        let mut config = toy_config();
        config.rnn_channels = 4;
        config.rnn_seqlen = 2;

        let module = ScriptModule::new(config);
        let feat = Tensor::from_f32(&[1, 2, 3, 3], (0..18).map(|i| i as f32 / 18.0).collect());

        let first = module.forward(&feat, None);
        let state = first.rnn_state_out.unwrap();
        assert_eq!(state.shape(), &[1, 4]);

        let second = module.forward(&feat, Some(&state));
        assert_ne!(second.rnn_state_out.unwrap(), state);
    }
}
