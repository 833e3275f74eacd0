mod classifier;
mod config;
mod error;
mod loader;
mod models;
mod onnx;
mod profile;
mod resolver;
mod session;
mod tensor;

use crate::config::Settings;
use crate::error::Result;
use crate::loader::HttpImageLoader;
use crate::models::ImageHandle;
use crate::onnx::OnnxModelLoader;
use crate::profile::Platform;
use crate::resolver::{FileAccess, LocalFileAccess, Resolver};
use crate::session::{ImagePicker, Session, ViewState};
use crate::tensor::TensorBuilder;
use async_trait::async_trait;
use clap::Parser;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

const REMOTE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "photo-classifier", version, about = "Classify photos with a platform-tuned MobileNet")]
struct Cli {
    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Platform profile to run with (android, ios or web)
    #[arg(long)]
    platform: Option<Platform>,

    /// Directory holding the ONNX models
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Print view states as JSON
    #[arg(long)]
    json: bool,

    /// Image paths, content:// handles or http(s) URLs; read from stdin when empty.
    /// A blank stdin line counts as a cancelled pick.
    images: Vec<String>,
}

/// Hands out queued selections in order.
struct ScriptedPicker {
    queue: Mutex<VecDeque<Option<String>>>,
}

impl ScriptedPicker {
    fn new(entries: impl IntoIterator<Item = String>) -> Self {
        let queue = entries
            .into_iter()
            .map(|entry| {
                let entry = entry.trim().to_string();
                (!entry.is_empty()).then_some(entry)
            })
            .collect();
        Self {
            queue: Mutex::new(queue),
        }
    }

    fn remaining(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[async_trait]
impl ImagePicker for ScriptedPicker {
    async fn pick_image(&self) -> Result<Option<ImageHandle>> {
        let next = self.queue.lock().unwrap().pop_front().flatten();
        Ok(next.map(ImageHandle::parse))
    }
}

async fn read_stdin_lines() -> Result<Vec<String>> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut entries = Vec::new();
    while let Some(line) = lines.next_line().await? {
        entries.push(line);
    }
    Ok(entries)
}

fn render(view: &ViewState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(view)?);
        return Ok(());
    }
    match view {
        ViewState::Predictions(report) => {
            println!("{}", report.source);
            for prediction in &report.predictions {
                println!("  {prediction}");
            }
        }
        ViewState::NoImageSelected => println!("No image selected"),
        ViewState::Failed { kind, message } => println!("Classification failed ({kind:?}): {message}"),
        ViewState::ModelUnavailable { message } => println!("Model unavailable: {message}"),
        ViewState::Initializing | ViewState::Idle | ViewState::Classifying { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(platform) = cli.platform {
        settings.platform = Some(platform);
    }
    if let Some(dir) = cli.models_dir {
        settings.classifier.models_dir = dir;
    }
    settings.paths.ensure_dirs()?;

    let files: Arc<dyn FileAccess> = Arc::new(LocalFileAccess::new(&settings.paths.content_root));
    let resolver = Resolver::new(&settings.paths.cache_dir, Arc::clone(&files));
    log::info!("Staging content handles in {}", resolver.cache_dir().display());
    let builder = TensorBuilder::new(files, Arc::new(HttpImageLoader::new(REMOTE_LOAD_TIMEOUT)?));
    let session = Session::new(
        settings.platform(),
        Arc::new(OnnxModelLoader::new(settings.classifier.clone())),
        resolver,
        builder,
    );

    let started = session.start().await;
    let status = session.status();
    println!(
        "Backend ready? {}  Model ready? {}",
        if status.backend_ready { "yes" } else { "no" },
        if status.model_ready { "yes" } else { "no" }
    );
    if let Err(err) = started {
        render(&session.view(), cli.json)?;
        return Err(err);
    }

    let entries = if cli.images.is_empty() {
        read_stdin_lines().await?
    } else {
        cli.images
    };
    let picker = ScriptedPicker::new(entries);
    let mut failures = 0usize;
    while picker.remaining() > 0 {
        match session.pick_and_classify(&picker).await {
            Ok(_) => {}
            Err(err) if err.is_recoverable() => failures += 1,
            Err(err) => return Err(err),
        }
        render(&session.view(), cli.json)?;
    }
    if failures > 0 {
        log::warn!("{failures} image(s) could not be classified");
    }
    Ok(())
}
