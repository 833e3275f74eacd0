use crate::classifier::{load_labels, rank_predictions, Classifier, ModelLoader};
use crate::config::{ClassifierConfig, InputLayout, InputScaling};
use crate::error::{Error, Result};
use crate::models::Prediction;
use crate::profile::{Backend, CapabilityProfile};
use crate::tensor::{ImageTensor, CHANNELS};
use ndarray::{Array4, Axis};
use std::path::Path;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

#[cfg(target_vendor = "apple")]
use ort::execution_providers::CoreMLExecutionProvider;
#[cfg(target_os = "windows")]
use ort::execution_providers::DirectMLExecutionProvider;
#[cfg(any(target_vendor = "apple", target_os = "windows"))]
use ort::execution_providers::ExecutionProvider;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Execution provider the session actually runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceProvider {
    Cpu,
    CoreMl,
    DirectMl { device_id: u32 },
}

impl InferenceProvider {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::CoreMl => "GPU (CoreML)",
            Self::DirectMl { .. } => "GPU (DirectML)",
        }
    }
}

pub struct OnnxModelLoader {
    config: ClassifierConfig,
}

impl OnnxModelLoader {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, profile: &CapabilityProfile) -> Result<Box<dyn Classifier>> {
        let model_path = self.config.model_path(profile.model_variant);
        if let Some(dylib) = &self.config.ort_dylib_path {
            if !dylib.exists() {
                return Err(Error::Init(format!(
                    "ONNX Runtime library not found: {}",
                    dylib.display()
                )));
            }
            std::env::set_var("ORT_DYLIB_PATH", dylib);
        }
        let (session, provider) = build_session(&model_path, profile.backend)?;
        log::info!(
            "Loaded {:?} model (alpha {}) {} on {} (ONNX Runtime {})",
            profile.model_variant,
            profile.model_variant.alpha(),
            model_path.display(),
            provider.label(),
            ort_runtime_version().unwrap_or_else(|| "unknown".into())
        );
        let labels = load_labels(&model_path, &self.config.labels_path);
        Ok(Box::new(OnnxClassifier {
            session,
            provider,
            labels,
            edge: profile.target_edge as usize,
            top_k: self.config.top_k,
            scaling: self.config.input_scaling,
            layout: self.config.input_layout,
            apply_softmax: self.config.apply_softmax,
        }))
    }
}

pub struct OnnxClassifier {
    session: Session,
    provider: InferenceProvider,
    labels: Vec<String>,
    edge: usize,
    top_k: usize,
    scaling: InputScaling,
    layout: InputLayout,
    apply_softmax: bool,
}

impl Classifier for OnnxClassifier {
    fn classify(&mut self, tensor: ImageTensor) -> Result<Vec<Prediction>> {
        let expected = [1, self.edge, self.edge, CHANNELS];
        if tensor.shape() != expected || tensor.dtype() != "float32" {
            return Err(Error::Inference(format!(
                "Expected float32 {expected:?} input, got {} {:?}",
                tensor.dtype(),
                tensor.shape()
            )));
        }
        log::debug!("Running classifier on {}", self.provider.label());
        let input = prepare_input(tensor.into_array(), self.scaling, self.layout);
        let input_name = self
            .session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "input".to_string());
        let value = Tensor::from_array(input)
            .map_err(|e| Error::Inference(format!("Invalid input tensor: {e}")))?;
        let outputs = self
            .session
            .run(ort::inputs![input_name => value])
            .map_err(|e| Error::Inference(format!("Failed to run classifier: {e}")))?;
        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::Inference("Classifier returned no outputs".into()))?;
        let (_, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(format!("Unexpected classifier output: {e}")))?;
        let scores = data.to_vec();
        drop(outputs);
        Ok(rank_predictions(
            &scores,
            &self.labels,
            self.top_k,
            self.apply_softmax,
        ))
    }
}

/// Rescales raw 0..=255 samples into the model's range and lays them out as it expects.
fn prepare_input(mut input: Array4<f32>, scaling: InputScaling, layout: InputLayout) -> Array4<f32> {
    match scaling {
        InputScaling::Raw => {}
        InputScaling::Unit => input.mapv_inplace(|v| v / 255.0),
        InputScaling::Tf => input.mapv_inplace(|v| v / 127.5 - 1.0),
        InputScaling::Imagenet => {
            for mut pixel in input.lanes_mut(Axis(3)) {
                for c in 0..CHANNELS {
                    pixel[c] = (pixel[c] / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
                }
            }
        }
    }
    match layout {
        InputLayout::Nhwc => input,
        InputLayout::Nchw => input
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned(),
    }
}

fn ensure_environment() -> Result<()> {
    let committed = ort::init()
        .with_name("photo-classifier")
        .commit()
        .map_err(|e| Error::Init(format!("Failed to init ORT environment: {e}")))?;
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
    }
    Ok(())
}

pub fn build_session(model_path: &Path, backend: Backend) -> Result<(Session, InferenceProvider)> {
    if !model_path.exists() {
        return Err(Error::Init(format!(
            "Model not found: {}",
            model_path.display()
        )));
    }
    ensure_environment()?;

    let try_build = |provider: InferenceProvider| -> Result<Session> {
        let build = || -> Result<Session> {
            #[allow(unused_mut)]
            let mut builder = Session::builder()
                .map_err(|e| Error::Init(format!("{e}")))?
                .with_optimization_level(GraphOptimizationLevel::Level1)
                .map_err(|e| Error::Init(format!("{e}")))?
                .with_parallel_execution(false)
                .map_err(|e| Error::Init(format!("{e}")))?;
            match provider {
                InferenceProvider::Cpu => {}
                #[cfg(target_vendor = "apple")]
                InferenceProvider::CoreMl => {
                    builder = builder
                        .with_execution_providers([CoreMLExecutionProvider::default().build()])
                        .map_err(|e| Error::Init(format!("{e}")))?;
                }
                #[cfg(target_os = "windows")]
                InferenceProvider::DirectMl { device_id } => {
                    builder = builder
                        .with_memory_pattern(false)
                        .map_err(|e| Error::Init(format!("{e}")))?;
                    let ep = DirectMLExecutionProvider::default()
                        .with_device_id(device_id as i32)
                        .build();
                    builder = builder
                        .with_execution_providers([ep])
                        .map_err(|e| Error::Init(format!("{e}")))?;
                }
                #[allow(unreachable_patterns)]
                _ => {
                    return Err(Error::Init(format!(
                        "{} is not supported on this host",
                        provider.label()
                    )))
                }
            }
            builder
                .commit_from_file(model_path)
                .map_err(|e| Error::Init(format!("{e}")))
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(build)) {
            Ok(res) => res,
            Err(_) => Err(Error::Init(
                "ONNX Runtime panicked while building session".into(),
            )),
        }
    };

    if let Some(accelerated) = accelerated_provider(backend) {
        match try_build(accelerated) {
            Ok(session) => return Ok((session, accelerated)),
            Err(err) => log::warn!(
                "{} unavailable for {} ({err}); using CPU",
                accelerated.label(),
                model_path.display()
            ),
        }
    } else if backend != Backend::Cpu {
        log::warn!(
            "No {} execution provider on this host; using CPU for {}",
            backend.label(),
            model_path.display()
        );
    }

    let session = try_build(InferenceProvider::Cpu)?;
    Ok((session, InferenceProvider::Cpu))
}

/// Accelerated execution provider for a backend, when the host offers one.
fn accelerated_provider(backend: Backend) -> Option<InferenceProvider> {
    match backend {
        Backend::Cpu => None,
        #[cfg(target_vendor = "apple")]
        Backend::GpuNative => CoreMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
            .then_some(InferenceProvider::CoreMl),
        #[cfg(target_os = "windows")]
        Backend::GpuWeb => DirectMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
            .then_some(InferenceProvider::DirectMl { device_id: 0 }),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

pub fn ort_runtime_version() -> Option<String> {
    let info = ort::info();
    if let Some(start) = info.find("git-branch=rel-") {
        let tail = &info[start + "git-branch=rel-".len()..];
        if let Some(end) = tail.find(',') {
            return Some(tail[..end].to_string());
        }
        return Some(tail.to_string());
    }
    Some(format!("1.{}.x", ort::MINOR_VERSION))
}
