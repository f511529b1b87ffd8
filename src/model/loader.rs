// Location: src/model/loader.rs

use std::path::{Path, PathBuf};

use candle_core::Device;
use tracing::{debug, info, warn};

use super::StateDict;
use crate::config::{GenerationConfig, ModelConfig};
use crate::error::{EngineError, Result};
use crate::tokenizer::HfCodec;

const CONFIG_FILE: &str = "config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Reads a model directory: `config.json`, `tokenizer.json` and one or more
/// `*.safetensors` shards. A path to a single `.safetensors` file loads only
/// that shard, with the other files taken from its directory.
pub struct ModelLoader {
    model_dir: PathBuf,
    weight_file: Option<PathBuf>,
}

impl ModelLoader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Ok(Self {
                model_dir: path.to_path_buf(),
                weight_file: None,
            });
        }
        if path.is_file() && path.extension().is_some_and(|ext| ext == "safetensors") {
            let model_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Ok(Self {
                model_dir,
                weight_file: Some(path.to_path_buf()),
            });
        }
        Err(EngineError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "expected a model directory or a .safetensors file",
            ),
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Reads `config.json`, replacing `max_length` when an override is given.
    pub fn load_config(&self, max_length: Option<usize>) -> Result<ModelConfig> {
        let mut config = ModelConfig::from_file(self.model_dir.join(CONFIG_FILE))?;
        if let Some(max_length) = max_length {
            debug!(from = config.max_length, to = max_length, "Overriding max length");
            config.max_length = max_length;
            config.validate()?;
        }
        info!(
            model_type = %config.model_type,
            layers = config.num_hidden_layers,
            max_length = config.max_length,
            "Loaded model config"
        );
        Ok(config)
    }

    /// Default generation settings shipped with the model, if any.
    pub fn load_generation_config(&self) -> Result<Option<GenerationConfig>> {
        let path = self.model_dir.join(GENERATION_CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|source| EngineError::Io {
            path: path.clone(),
            source,
        })?;
        let config: GenerationConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn load_codec(&self) -> Result<HfCodec> {
        HfCodec::from_file(self.model_dir.join(TOKENIZER_FILE))
    }

    /// Weight shards in load order.
    pub fn weight_files(&self) -> Result<Vec<PathBuf>> {
        if let Some(file) = &self.weight_file {
            return Ok(vec![file.clone()]);
        }
        let entries = std::fs::read_dir(&self.model_dir).map_err(|source| EngineError::Io {
            path: self.model_dir.clone(),
            source,
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| EngineError::Io {
                path: self.model_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "safetensors") {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(EngineError::WeightLoad {
                name: self.model_dir.display().to_string(),
                message: "no .safetensors files found".to_string(),
            });
        }
        files.sort();
        Ok(files)
    }

    /// Reads every shard into one state dict. Later shards win on duplicate
    /// names.
    pub fn load_state_dict(&self, device: &Device) -> Result<StateDict> {
        let mut state_dict = StateDict::new();
        for file in self.weight_files()? {
            let tensors = candle_core::safetensors::load(&file, device).map_err(|e| {
                EngineError::WeightLoad {
                    name: file.display().to_string(),
                    message: e.to_string(),
                }
            })?;
            debug!(shard = ?file, tensors = tensors.len(), "Loaded weight shard");
            for (name, tensor) in tensors {
                if state_dict.insert(name.clone(), tensor).is_some() {
                    warn!(name, "Duplicate tensor across shards");
                }
            }
        }
        info!(tensors = state_dict.len(), "Loaded weights");
        Ok(state_dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelType;
    use crate::model::{create_model, expected_weights};
    use crate::test_utils::{random_state_dict, tiny_config};

    fn write_model_dir(dir: &Path, model_type: ModelType) -> ModelConfig {
        let config = tiny_config(model_type);
        std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string(&config).unwrap()).unwrap();

        // split the weights over two shards
        let mut state_dict = random_state_dict(&config, 1);
        let names: Vec<String> = expected_weights(&config).into_iter().map(|(n, _)| n).collect();
        let second: StateDict = names[names.len() / 2..]
            .iter()
            .map(|name| (name.clone(), state_dict.remove(name).unwrap()))
            .collect();
        candle_core::safetensors::save(&state_dict, dir.join("model-00001-of-00002.safetensors")).unwrap();
        candle_core::safetensors::save(&second, dir.join("model-00002-of-00002.safetensors")).unwrap();
        config
    }

    #[test]
    fn test_load_sharded_model() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = write_model_dir(dir.path(), ModelType::ChatGlm3);
        let loader = ModelLoader::new(dir.path())?;

        assert_eq!(loader.weight_files()?.len(), 2);
        assert_eq!(loader.load_config(None)?, config);
        assert_eq!(loader.load_config(Some(64))?.max_length, 64);
        assert!(loader.load_generation_config()?.is_none());

        let state_dict = loader.load_state_dict(&Device::Cpu)?;
        assert_eq!(state_dict.len(), expected_weights(&config).len());
        let mut model = create_model(config, &Device::Cpu)?;
        model.load_state_dict(state_dict)?;
        Ok(())
    }

    #[test]
    fn test_generation_config_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_model_dir(dir.path(), ModelType::ChatGlm2);
        std::fs::write(
            dir.path().join(GENERATION_CONFIG_FILE),
            r#"{"do_sample": true, "top_p": 0.8, "temperature": 0.8, "eos_token_id": [2]}"#,
        )?;
        let loader = ModelLoader::new(dir.path())?;
        let config = loader.load_generation_config()?.unwrap();
        assert_eq!(config.top_p, 0.8);
        assert_eq!(config.max_context_length, 512);
        Ok(())
    }

    #[test]
    fn test_missing_paths() -> anyhow::Result<()> {
        assert!(ModelLoader::new("/nonexistent/model").is_err());

        let dir = tempfile::tempdir()?;
        let loader = ModelLoader::new(dir.path())?;
        assert!(matches!(loader.load_config(None), Err(EngineError::Io { .. })));
        assert!(matches!(loader.weight_files(), Err(EngineError::WeightLoad { .. })));
        assert!(loader.load_codec().is_err());
        Ok(())
    }
}
