use crate::error::Result;
use crate::models::Prediction;
use crate::profile::CapabilityProfile;
use crate::tensor::ImageTensor;
use std::path::{Path, PathBuf};

/// A loaded image classification model.
///
/// The tensor is taken by value so its buffer is released as soon as the
/// call returns, successfully or not. Implementations are never called
/// concurrently by the session.
pub trait Classifier: Send {
    fn classify(&mut self, tensor: ImageTensor) -> Result<Vec<Prediction>>;
}

/// Brings up the numeric backend and loads the model variant named by the profile.
pub trait ModelLoader: Send + Sync {
    fn load(&self, profile: &CapabilityProfile) -> Result<Box<dyn Classifier>>;
}

/// True when `scores` already came out of a softmax layer.
fn is_distribution(scores: &[f32]) -> bool {
    !scores.is_empty()
        && scores.iter().all(|s| (0.0..=1.0).contains(s))
        && (scores.iter().sum::<f32>() - 1.0).abs() < 1e-3
}

/// Exponentiates logits relative to their peak and rescales them to sum to 1.
fn logits_to_probabilities(scores: &mut [f32]) {
    let peak = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !peak.is_finite() {
        return;
    }
    scores.iter_mut().for_each(|s| *s = (*s - peak).exp());
    let total: f32 = scores.iter().sum();
    if total > 0.0 {
        scores.iter_mut().for_each(|s| *s /= total);
    }
}

/// Pairs scores with labels and keeps the `top_k` best, highest first.
///
/// With `apply_softmax`, raw logits are converted to probabilities; output
/// that is already a distribution is left as is. A model that emits exactly
/// one more score than there are labels has a leading background class,
/// which is skipped.
pub fn rank_predictions(
    scores: &[f32],
    labels: &[String],
    top_k: usize,
    apply_softmax: bool,
) -> Vec<Prediction> {
    let normalize = apply_softmax && !is_distribution(scores);
    let scores = if !labels.is_empty() && scores.len() == labels.len() + 1 {
        &scores[1..]
    } else {
        scores
    };
    let usable = if labels.is_empty() {
        scores.len()
    } else {
        scores.len().min(labels.len())
    };
    let mut probs = scores[..usable].to_vec();
    if normalize {
        logits_to_probabilities(&mut probs);
    }
    let mut ranked: Vec<(usize, f32)> = probs
        .into_iter()
        .enumerate()
        .filter(|(_, p)| p.is_finite())
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(top_k);
    ranked
        .into_iter()
        .map(|(idx, probability)| Prediction {
            label: labels
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("class {idx}")),
            probability: probability.clamp(0.0, 1.0),
        })
        .collect()
}

pub fn resolve_labels_path(model_path: &Path, configured: &Path) -> Option<PathBuf> {
    let sidecar = model_path.with_extension("labels.txt");
    if sidecar.exists() {
        return Some(sidecar);
    }
    if configured.exists() {
        return Some(configured.to_path_buf());
    }
    None
}

/// Class names for `model_path`, one per line. A missing or unreadable file
/// yields no labels, and predictions fall back to class indices.
pub fn load_labels(model_path: &Path, configured: &Path) -> Vec<String> {
    let Some(path) = resolve_labels_path(model_path, configured) else {
        log::warn!("{} has no labels file", model_path.display());
        return Vec::new();
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let labels: Vec<String> = text.lines().filter_map(normalize_label).collect();
            log::info!("{} labels from {}", labels.len(), path.display());
            labels
        }
        Err(err) => {
            log::warn!("Ignoring labels in {}: {err}", path.display());
            Vec::new()
        }
    }
}

/// Strips `12:` / `12 ` index prefixes and surrounding quotes from a label line.
fn normalize_label(line: &str) -> Option<String> {
    let mut label = line.trim();
    if label.is_empty() || label.starts_with('#') {
        return None;
    }
    if let Some((prefix, rest)) = label.split_once(':') {
        if !prefix.is_empty() && prefix.trim().chars().all(|c| c.is_ascii_digit()) {
            label = rest.trim();
        }
    } else {
        let mut parts = label.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
            label = rest.trim();
        }
    }
    label = label.trim_end_matches(',').trim_matches('"').trim_matches('\'');
    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}
