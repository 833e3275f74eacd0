use crate::error::{Error, Result};
use crate::profile::{ModelVariant, Platform};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PLATFORM: &str = "PHOTO_CLASSIFIER_PLATFORM";
const ENV_MODELS_DIR: &str = "PHOTO_CLASSIFIER_MODELS_DIR";
const ENV_CACHE_DIR: &str = "PHOTO_CLASSIFIER_CACHE_DIR";
const ENV_CONTENT_ROOT: &str = "PHOTO_CLASSIFIER_CONTENT_ROOT";

/// Value range the model expects its input pixels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputScaling {
    /// 0..=255, passed through untouched.
    Raw,
    /// 0..=1
    Unit,
    /// -1..=1
    #[default]
    Tf,
    /// ImageNet mean/std normalized.
    Imagenet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    #[default]
    Nhwc,
    Nchw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub models_dir: PathBuf,
    pub light_model_path: PathBuf,
    pub standard_model_path: PathBuf,
    pub labels_path: PathBuf,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub input_scaling: InputScaling,
    #[serde(default)]
    pub input_layout: InputLayout,
    /// Convert raw logits to probabilities. Models whose output is already a
    /// distribution are passed through untouched either way.
    #[serde(default = "default_apply_softmax")]
    pub apply_softmax: bool,
    #[serde(default)]
    pub ort_dylib_path: Option<PathBuf>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            light_model_path: PathBuf::from("mobilenet_v1_025.onnx"),
            standard_model_path: PathBuf::from("mobilenet_v1_100.onnx"),
            labels_path: PathBuf::from("imagenet.labels.txt"),
            top_k: default_top_k(),
            input_scaling: InputScaling::default(),
            input_layout: InputLayout::default(),
            apply_softmax: default_apply_softmax(),
            ort_dylib_path: None,
        }
    }
}

fn default_top_k() -> usize {
    3
}

fn default_apply_softmax() -> bool {
    true
}

impl ClassifierConfig {
    pub fn model_path(&self, variant: ModelVariant) -> PathBuf {
        match variant {
            ModelVariant::Light => self.resolve_model(&self.light_model_path),
            ModelVariant::Standard => self.resolve_model(&self.standard_model_path),
        }
    }

    pub fn resolve_model(&self, name: &Path) -> PathBuf {
        if name.is_absolute() {
            name.to_path_buf()
        } else {
            self.models_dir.join(name)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePaths {
    /// Scratch space for staged content-provider copies. The platform may evict it.
    pub cache_dir: PathBuf,
    /// Directory that stands in for the platform content provider.
    pub content_root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        let root = std::env::temp_dir().join("photo-classifier");
        Self {
            cache_dir: root.join("cache"),
            content_root: root.join("content"),
        }
    }
}

impl StoragePaths {
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub paths: StoragePaths,
}

impl Settings {
    /// Reads the optional JSON settings file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {e}", path.display()))
                })?;
                serde_json::from_str(&data)?
            }
            None => Settings::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(platform) = lookup(ENV_PLATFORM).filter(|v| !v.trim().is_empty()) {
            self.platform = Some(platform.parse()?);
        }
        if let Some(dir) = lookup(ENV_MODELS_DIR) {
            self.classifier.models_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.paths.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_CONTENT_ROOT) {
            self.paths.content_root = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn platform(&self) -> Platform {
        self.platform.unwrap_or_else(Platform::detect)
    }
}
