//! The inference session core: option handling, the backend capability
//! surface, and the token generation loop.

mod backend;
mod builtin;
mod session;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use backend::{Backend, Token};
pub use builtin::BuiltinBackend;
pub use session::{PredictRequest, PredictResult, Session};

use crate::error::{Error, Result};
use crate::sample;

/// Model and prediction options, merged from three layers: built-in
/// defaults, the model's params layer, and the per-request override map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    // Load-time options; changing any of these replaces the session.
    pub num_ctx: usize,
    pub num_batch: usize,
    pub num_gpu: i32,
    pub main_gpu: i32,
    pub tensor_split: Vec<f32>,
    pub f16_memory: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub embedding_only: bool,
    pub numa: bool,

    // Prediction options.
    pub seed: i64,
    pub num_keep: i32,
    pub num_predict: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f32,
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_newline: bool,
    pub stop: Vec<String>,
    pub ignore_eos: bool,
    pub logit_bias: HashMap<i32, f32>,

    /// Optional session file for prompt-cache reuse across process restarts.
    pub prompt_cache: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            num_ctx: 2048,
            num_batch: 512,
            num_gpu: 1,
            main_gpu: 0,
            tensor_split: Vec::new(),
            f16_memory: true,
            use_mmap: true,
            use_mlock: false,
            embedding_only: false,
            numa: false,

            seed: -1,
            num_keep: -1,
            num_predict: 128,
            top_k: 40,
            top_p: 0.95,
            tfs_z: 1.0,
            typical_p: 1.0,
            repeat_last_n: 64,
            repeat_penalty: 1.1,
            temperature: 0.8,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: true,
            stop: Vec::new(),
            ignore_eos: false,
            logit_bias: HashMap::new(),

            prompt_cache: None,
        }
    }
}

impl Options {
    /// Merge defaults <- model params layer <- request overrides.
    pub fn merged(
        params_layer: Option<&str>,
        overrides: Option<&HashMap<String, Value>>,
    ) -> Result<Options> {
        let mut value = serde_json::to_value(Options::default())?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::Internal("options did not serialise to an object".into()))?;

        if let Some(text) = params_layer {
            let layer: Value = serde_json::from_str(text)
                .map_err(|e| Error::Internal(format!("invalid params layer: {e}")))?;
            if let Some(map) = layer.as_object() {
                for (k, v) in map {
                    object.insert(k.clone(), v.clone());
                }
            }
        }

        if let Some(map) = overrides {
            for (k, v) in map {
                object.insert(k.clone(), v.clone());
            }
        }

        serde_json::from_value(value).map_err(|e| Error::BadRequest(format!("invalid option: {e}")))
    }

    /// True when `other` cannot be served by a session loaded with `self`.
    pub fn load_differs(&self, other: &Options) -> bool {
        self.num_ctx != other.num_ctx
            || self.num_gpu != other.num_gpu
            || self.main_gpu != other.main_gpu
            || self.tensor_split != other.tensor_split
            || self.f16_memory != other.f16_memory
            || self.use_mmap != other.use_mmap
            || self.use_mlock != other.use_mlock
            || self.embedding_only != other.embedding_only
            || self.numa != other.numa
    }

    /// Sampling parameters for one predict call. `eos` is the backend's
    /// end-of-sequence id, pinned to `-inf` under `ignore_eos`.
    pub fn sampling_params(&self, eos: Token) -> sample::Params {
        let mut logit_bias = self.logit_bias.clone();
        if self.ignore_eos {
            logit_bias.insert(eos, f32::NEG_INFINITY);
        }
        sample::Params {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            tfs_z: self.tfs_z,
            typical_p: self.typical_p,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            mirostat: self.mirostat,
            mirostat_tau: self.mirostat_tau,
            mirostat_eta: self.mirostat_eta,
            penalize_newline: self.penalize_newline,
            logit_bias,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_layers_in_order() {
        let params = r#"{"temperature": 0.2, "num_ctx": 4096}"#;
        let mut overrides = HashMap::new();
        overrides.insert("temperature".to_string(), json!(0.0));

        let opts = Options::merged(Some(params), Some(&overrides)).unwrap();
        assert_eq!(opts.temperature, 0.0);
        assert_eq!(opts.num_ctx, 4096);
        assert_eq!(opts.top_k, 40);
    }

    #[test]
    fn bad_override_is_a_bad_request() {
        let mut overrides = HashMap::new();
        overrides.insert("num_ctx".to_string(), json!("not a number"));
        assert!(matches!(
            Options::merged(None, Some(&overrides)),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn load_differences_force_reload() {
        let a = Options::default();
        let mut b = a.clone();
        b.temperature = 0.0;
        assert!(!a.load_differs(&b));
        b.num_ctx = 4096;
        assert!(a.load_differs(&b));
    }
}
