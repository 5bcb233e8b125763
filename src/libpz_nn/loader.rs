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
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use pz_tensor::Tensor;
use pz_utils::b85;

use crate::graph::{GraphConfig, ScriptModule};

#[derive(Serialize, Deserialize)]
struct WeightEntry {
    shape: Vec<i64>,
    data: String
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    #[serde(flatten)]
    config: GraphConfig,

    #[serde(default)]
    weights: BTreeMap<String, WeightEntry>
}

/// Load a scripted model artifact. The file is a JSON document holding the
/// architecture plus a name to base-85 weight map; names not present keep
/// their deterministic initialization.
///
/// # Arguments
///
/// * `path` -
///
pub fn load<P: AsRef<Path>>(path: P) -> io::Result<ScriptModule> {
    let reader = BufReader::new(File::open(path)?);
    let file: ModelFile = serde_json::from_reader(reader)?;

    let mut module = ScriptModule::new(file.config);
    for (name, entry) in &file.weights {
        let values = b85::decode(&entry.data)
            .unwrap_or_else(|| panic!("could not decode weight '{}'", name));

        module.set_param(name, &Tensor::from_f32(&entry.shape, values));
    }

    Ok(module)
}

/// Save a scripted model artifact, the inverse of `load`.
///
/// # Arguments
///
/// * `path` -
/// * `module` -
///
pub fn save<P: AsRef<Path>>(path: P, module: &ScriptModule) -> io::Result<()> {
    let weights = module.state_dict().into_iter()
        .map(|(name, tensor)| {
            let entry = WeightEntry {
                shape: tensor.shape().to_vec(),
                data: b85::encode(tensor.as_f32())
            };

            (name, entry)
        })
        .collect();

    let file = ModelFile {
        config: module.config().clone(),
        weights
    };

    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, &file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pz_tensor::Dtype;
    use std::env;

    #[test]
    fn save_and_load() {
        let mut path = env::temp_dir();
        path.push(format!("pz_model_{}.json", std::process::id()));

        let config = GraphConfig {
            model_id: "dev".to_string(),
            feature_size: vec! [2, 3, 3],
            action_size: vec! [1, 3, 3],
            num_blocks: 1,
            num_channels: 4,
            value_outputs: 3,
            rnn_channels: 0,
            rnn_seqlen: 0
        };
        let mut module = ScriptModule::new(config);
        module.set_param("value_head.linear.bias", &Tensor::from_f32(&[3], vec! [0.1, 0.2, 0.3]));

        save(&path, &module).unwrap();
        let restored = load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(restored.model_id(), "dev");
        assert_eq!(module.state_dict(), restored.state_dict());

        let feat = Tensor::zeros(&[1, 2, 3, 3], Dtype::F32);
        assert_eq!(module.forward(&feat, None).v, restored.forward(&feat, None).v);
    }
}
