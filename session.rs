use crate::classifier::{Classifier, ModelLoader};
use crate::error::{Error, FailureKind, Result};
use crate::models::{ClassificationReport, ImageHandle};
use crate::profile::{resolve_profile, CapabilityProfile, Platform};
use crate::resolver::Resolver;
use crate::tensor::TensorBuilder;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;
use uuid::Uuid;

type SharedClassifier = Arc<Mutex<Box<dyn Classifier>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
    /// Terminal; classification stays unavailable until the process restarts.
    InitFailed,
}

/// What the presentation layer should show.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ViewState {
    Initializing,
    Idle,
    NoImageSelected,
    Classifying { source: String },
    Predictions(ClassificationReport),
    Failed { kind: FailureKind, message: String },
    ModelUnavailable { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub backend_ready: bool,
    pub model_ready: bool,
    pub profile: Option<CapabilityProfile>,
}

/// Source of user image selections. `None` means the user cancelled.
#[async_trait]
pub trait ImagePicker: Send + Sync {
    async fn pick_image(&self) -> Result<Option<ImageHandle>>;
}

/// One classification session: a single profile, a single model, and at
/// most one request in flight.
pub struct Session {
    platform: Platform,
    loader: Arc<dyn ModelLoader>,
    resolver: Resolver,
    builder: TensorBuilder,
    state: Arc<Mutex<SessionState>>,
    profile: OnceLock<CapabilityProfile>,
    model: OnceLock<SharedClassifier>,
    init_error: OnceLock<String>,
    view: Arc<Mutex<ViewState>>,
}

impl Session {
    pub fn new(
        platform: Platform,
        loader: Arc<dyn ModelLoader>,
        resolver: Resolver,
        builder: TensorBuilder,
    ) -> Self {
        Self {
            platform,
            loader,
            resolver,
            builder,
            state: Arc::new(Mutex::new(SessionState::Uninitialized)),
            profile: OnceLock::new(),
            model: OnceLock::new(),
            init_error: OnceLock::new(),
            view: Arc::new(Mutex::new(ViewState::Idle)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn profile(&self) -> Option<&CapabilityProfile> {
        self.profile.get()
    }

    pub fn view(&self) -> ViewState {
        self.view.lock().unwrap().clone()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        SessionStatus {
            state,
            backend_ready: matches!(state, SessionState::Ready | SessionState::Busy),
            model_ready: self.model.get().is_some(),
            profile: self.profile.get().copied(),
        }
    }

    /// Resolves the capability profile and loads the model. Runs once; later
    /// calls report the outcome of the first.
    pub async fn start(&self) -> Result<CapabilityProfile> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                SessionState::Uninitialized => *state = SessionState::Initializing,
                SessionState::Initializing => {
                    return Err(Error::Init("Initialization already in progress".into()))
                }
                SessionState::InitFailed => return Err(Error::Init(self.init_message())),
                SessionState::Ready | SessionState::Busy => {
                    return self
                        .profile
                        .get()
                        .copied()
                        .ok_or_else(|| Error::Init("Profile missing after start".into()));
                }
            }
        }
        self.set_view(ViewState::Initializing);

        let profile = *self.profile.get_or_init(|| resolve_profile(self.platform));
        log::info!(
            "Platform {}: {} backend, {:?} model, {}px input",
            self.platform,
            profile.backend.label(),
            profile.model_variant,
            profile.target_edge
        );

        let loader = Arc::clone(&self.loader);
        let loaded = tokio::task::spawn_blocking(move || loader.load(&profile))
            .await
            .map_err(|e| Error::Init(format!("Task join error: {e}")))
            .and_then(|res| res);

        match loaded {
            Ok(classifier) => {
                let _ = self.model.set(Arc::new(Mutex::new(classifier)));
                *self.state.lock().unwrap() = SessionState::Ready;
                self.set_view(ViewState::Idle);
                log::info!("Classifier ready");
                Ok(profile)
            }
            Err(err) => {
                let message = match err {
                    Error::Init(message) => message,
                    other => other.to_string(),
                };
                log::error!("Classifier initialization failed: {message}");
                let _ = self.init_error.set(message.clone());
                *self.state.lock().unwrap() = SessionState::InitFailed;
                self.set_view(ViewState::ModelUnavailable {
                    message: message.clone(),
                });
                Err(Error::Init(message))
            }
        }
    }

    /// Asks the picker for an image and classifies it. Returns `Ok(None)`
    /// when the user cancelled the pick.
    pub async fn pick_and_classify(
        &self,
        picker: &dyn ImagePicker,
    ) -> Result<Option<ClassificationReport>> {
        self.ensure_ready()?;
        match picker.pick_image().await? {
            Some(handle) => self.select_and_classify(handle).await.map(Some),
            None => {
                log::info!("No image selected");
                self.set_view(ViewState::NoImageSelected);
                Ok(None)
            }
        }
    }

    /// Runs resolve, decode and classify for one image. Rejected with
    /// `Error::Busy` while another request is in flight.
    pub async fn select_and_classify(&self, handle: ImageHandle) -> Result<ClassificationReport> {
        let mut busy = Some(self.begin_request()?);
        let (profile, model) = match (self.profile.get(), self.model.get()) {
            (Some(profile), Some(model)) => (*profile, Arc::clone(model)),
            _ => return Err(Error::Unavailable("Classifier is not loaded".into())),
        };
        let request_id = Uuid::new_v4();
        self.set_view(ViewState::Classifying {
            source: handle.raw.clone(),
        });

        let outcome = self
            .run_pipeline(request_id, &handle, profile, model, &mut busy)
            .await;
        match outcome {
            Ok(report) => {
                log::info!(
                    "Request {request_id}: {} predictions in {}ms",
                    report.predictions.len(),
                    report.elapsed_ms
                );
                self.set_view(ViewState::Predictions(report.clone()));
                Ok(report)
            }
            Err(err) => {
                log::warn!("Request {request_id} for {} failed: {err}", handle.raw);
                self.set_view(ViewState::Failed {
                    kind: err.category(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// `busy` travels into the inference task and comes back when it
    /// finishes, so a request dropped mid-inference keeps the session busy
    /// until the model is free again.
    async fn run_pipeline(
        &self,
        request_id: Uuid,
        handle: &ImageHandle,
        profile: CapabilityProfile,
        model: SharedClassifier,
        busy: &mut Option<BusyGuard>,
    ) -> Result<ClassificationReport> {
        let started = Instant::now();
        let resolved = self.resolver.resolve(handle).await?;
        log::debug!("Request {request_id}: resolved to {}", resolved.describe());

        let tensor = self.builder.build_tensor(&resolved, &profile).await?;
        log::debug!(
            "Request {request_id}: tensor {:?} ({} values)",
            tensor.shape(),
            tensor.data().len()
        );

        let guard = busy.take();
        let (predictions, guard) = tokio::task::spawn_blocking(move || {
            let predictions = match model.lock() {
                Ok(mut classifier) => classifier.classify(tensor),
                Err(_) => Err(Error::Inference("Classifier state poisoned".into())),
            };
            (predictions, guard)
        })
        .await
        .map_err(|e| Error::Inference(format!("Task join error: {e}")))?;
        *busy = guard;
        let mut predictions = predictions?;
        predictions.sort_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(ClassificationReport {
            request_id,
            source: handle.raw.clone(),
            profile,
            predictions,
            completed_at: chrono::Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Busy => Err(Error::Busy),
            SessionState::InitFailed => Err(Error::Unavailable(self.init_message())),
            SessionState::Uninitialized | SessionState::Initializing => {
                Err(Error::Unavailable("Classifier is not loaded yet".into()))
            }
        }
    }

    fn begin_request(&self) -> Result<BusyGuard> {
        let mut state = self.state.lock().unwrap();
        match *state {
            SessionState::Ready => {
                *state = SessionState::Busy;
                Ok(BusyGuard {
                    state: Arc::clone(&self.state),
                    view: Arc::clone(&self.view),
                })
            }
            SessionState::Busy => Err(Error::Busy),
            SessionState::InitFailed => Err(Error::Unavailable(self.init_message())),
            SessionState::Uninitialized | SessionState::Initializing => {
                Err(Error::Unavailable("Classifier is not loaded yet".into()))
            }
        }
    }

    fn init_message(&self) -> String {
        self.init_error
            .get()
            .cloned()
            .unwrap_or_else(|| "Initialization failed".into())
    }

    fn set_view(&self, view: ViewState) {
        *self.view.lock().unwrap() = view;
    }
}

/// Keeps the session `Busy` for one request and returns it to `Ready` on
/// drop, including when the request future is dropped before completion.
struct BusyGuard {
    state: Arc<Mutex<SessionState>>,
    view: Arc<Mutex<ViewState>>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*view, ViewState::Classifying { .. }) {
            *view = ViewState::Idle;
        }
        drop(view);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ImageLoader;
    use crate::models::{HandleScheme, Prediction};
    use crate::resolver::{FileAccess, LocalFileAccess};
    use crate::tensor::ImageTensor;
    use image::{Rgb, RgbImage};
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct CannedClassifier {
        calls: Arc<AtomicUsize>,
        shapes: Arc<Mutex<Vec<[usize; 4]>>>,
    }

    impl Classifier for CannedClassifier {
        fn classify(&mut self, tensor: ImageTensor) -> Result<Vec<Prediction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.shapes.lock().unwrap().push(tensor.shape());
            Ok(vec![
                Prediction {
                    label: "beagle".into(),
                    probability: 0.2,
                },
                Prediction {
                    label: "tabby".into(),
                    probability: 0.7,
                },
            ])
        }
    }

    /// Blocks inside `classify` until the test releases it.
    struct GateClassifier {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl Classifier for GateClassifier {
        fn classify(&mut self, _tensor: ImageTensor) -> Result<Vec<Prediction>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(10));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![Prediction {
                label: "gate".into(),
                probability: 1.0,
            }])
        }
    }

    struct RejectingClassifier;

    impl Classifier for RejectingClassifier {
        fn classify(&mut self, tensor: ImageTensor) -> Result<Vec<Prediction>> {
            Err(Error::Inference(format!("bad shape {:?}", tensor.shape())))
        }
    }

    struct OnceLoader {
        classifier: Mutex<Option<Box<dyn Classifier>>>,
        loads: AtomicUsize,
    }

    impl OnceLoader {
        fn new(classifier: Box<dyn Classifier>) -> Self {
            Self {
                classifier: Mutex::new(Some(classifier)),
                loads: AtomicUsize::new(0),
            }
        }
    }

    impl ModelLoader for OnceLoader {
        fn load(&self, _profile: &CapabilityProfile) -> Result<Box<dyn Classifier>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.classifier
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::Init("model already taken".into()))
        }
    }

    struct BrokenLoader;

    impl ModelLoader for BrokenLoader {
        fn load(&self, _profile: &CapabilityProfile) -> Result<Box<dyn Classifier>> {
            Err(Error::Init("Model not found: mobilenet.onnx".into()))
        }
    }

    /// Local file access that counts every touch of the file system.
    struct CountingFiles {
        inner: LocalFileAccess,
        reads: AtomicUsize,
        copies: AtomicUsize,
    }

    #[async_trait]
    impl FileAccess for CountingFiles {
        async fn read_all_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_all_bytes(path).await
        }

        async fn copy(&self, src: &str, dst: &Path) -> io::Result<u64> {
            self.copies.fetch_add(1, Ordering::SeqCst);
            self.inner.copy(src, dst).await
        }
    }

    struct NoRemote;

    #[async_trait]
    impl ImageLoader for NoRemote {
        async fn load(&self, url: &str) -> Result<Vec<u8>> {
            Err(Error::Decode(format!("offline: {url}")))
        }
    }

    struct QueuePicker(Mutex<Vec<Option<ImageHandle>>>);

    #[async_trait]
    impl ImagePicker for QueuePicker {
        async fn pick_image(&self) -> Result<Option<ImageHandle>> {
            Ok(self.0.lock().unwrap().pop().flatten())
        }
    }

    struct Fixture {
        dir: TempDir,
        files: Arc<CountingFiles>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("content/media")).unwrap();
            let files = Arc::new(CountingFiles {
                inner: LocalFileAccess::new(dir.path().join("content")),
                reads: AtomicUsize::new(0),
                copies: AtomicUsize::new(0),
            });
            Self { dir, files }
        }

        fn session(&self, platform: Platform, loader: Arc<dyn ModelLoader>) -> Session {
            let files: Arc<dyn FileAccess> = self.files.clone();
            Session::new(
                platform,
                loader,
                Resolver::new(self.dir.path().join("cache"), Arc::clone(&files)),
                TensorBuilder::new(files, Arc::new(NoRemote)),
            )
        }

        fn photo(&self, name: &str, width: u32, height: u32) -> PathBuf {
            let path = self.dir.path().join(name);
            RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 50]))
                .save_with_format(&path, image::ImageFormat::Jpeg)
                .unwrap();
            path
        }

        fn provider_photo(&self, name: &str) -> ImageHandle {
            self.photo(&format!("content/media/{name}"), 80, 60);
            ImageHandle::parse(format!("content://media/{name}"))
        }

        fn corrupt(&self, name: &str) -> ImageHandle {
            let path = self.dir.path().join(name);
            std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xE0, 0x00]).unwrap();
            ImageHandle::new(HandleScheme::FilePath, path.to_string_lossy())
        }
    }

    fn canned() -> (Box<dyn Classifier>, Arc<AtomicUsize>, Arc<Mutex<Vec<[usize; 4]>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let shapes = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(CannedClassifier {
                calls: calls.clone(),
                shapes: shapes.clone(),
            }),
            calls,
            shapes,
        )
    }

    #[tokio::test]
    async fn start_resolves_profile_and_becomes_ready() {
        let fixture = Fixture::new();
        let (classifier, _, _) = canned();
        let loader = Arc::new(OnceLoader::new(classifier));
        let session = fixture.session(Platform::Android, loader.clone());
        assert_eq!(session.state(), SessionState::Uninitialized);

        let profile = session.start().await.unwrap();
        assert_eq!(profile, resolve_profile(Platform::Android));
        assert_eq!(session.state(), SessionState::Ready);
        let status = session.status();
        assert!(status.backend_ready && status.model_ready);

        assert_eq!(session.start().await.unwrap(), profile);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn content_photo_is_classified_and_published() {
        let fixture = Fixture::new();
        let (classifier, calls, shapes) = canned();
        let session = fixture.session(Platform::Android, Arc::new(OnceLoader::new(classifier)));
        session.start().await.unwrap();

        let report = session
            .select_and_classify(fixture.provider_photo("photo123"))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shapes.lock().unwrap()[0], [1, 96, 96, 3]);
        assert_eq!(fixture.files.copies.load(Ordering::SeqCst), 1);
        assert_eq!(report.predictions[0].label, "tabby");
        assert_eq!(report.predictions[1].label, "beagle");
        assert_eq!(report.source, "content://media/photo123");
        assert_eq!(session.state(), SessionState::Ready);
        assert!(matches!(session.view(), ViewState::Predictions(r) if r.request_id == report.request_id));
    }

    #[tokio::test]
    async fn corrupt_image_fails_request_but_session_stays_ready() {
        let fixture = Fixture::new();
        let (classifier, calls, _) = canned();
        let session = fixture.session(Platform::Ios, Arc::new(OnceLoader::new(classifier)));
        session.start().await.unwrap();

        let err = session
            .select_and_classify(fixture.corrupt("broken.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Decode(_)), "{err}");
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            session.view(),
            ViewState::Failed {
                kind: FailureKind::Decode,
                ..
            }
        ));

        let path = fixture.photo("fine.jpg", 300, 200);
        let report = session
            .select_and_classify(ImageHandle::parse(path.to_string_lossy()))
            .await
            .unwrap();
        assert_eq!(report.profile.target_edge, 224);
    }

    #[tokio::test]
    async fn missing_provider_entry_is_a_reference_failure() {
        let fixture = Fixture::new();
        let (classifier, _, _) = canned();
        let session = fixture.session(Platform::Android, Arc::new(OnceLoader::new(classifier)));
        session.start().await.unwrap();

        let err = session
            .select_and_classify(ImageHandle::parse("content://media/vanished"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), FailureKind::Reference);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn inference_failure_is_recoverable() {
        let fixture = Fixture::new();
        let session = fixture.session(
            Platform::Web,
            Arc::new(OnceLoader::new(Box::new(RejectingClassifier))),
        );
        session.start().await.unwrap();
        let path = fixture.photo("cat.jpg", 40, 40);
        let err = session
            .select_and_classify(ImageHandle::parse(path.to_string_lossy()))
            .await
            .unwrap_err();
        assert_eq!(err.category(), FailureKind::Inference);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn model_load_failure_is_terminal() {
        let fixture = Fixture::new();
        let session = fixture.session(Platform::Android, Arc::new(BrokenLoader));

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::Init(ref m) if m.contains("Model not found")));
        assert_eq!(session.state(), SessionState::InitFailed);
        assert!(!session.status().model_ready);
        assert!(matches!(session.view(), ViewState::ModelUnavailable { .. }));

        let err = session
            .select_and_classify(fixture.provider_photo("photo1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(fixture.files.copies.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.files.reads.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::InitFailed);

        assert!(matches!(session.start().await, Err(Error::Init(_))));
        assert_eq!(session.state(), SessionState::InitFailed);
    }

    #[tokio::test]
    async fn classification_before_start_is_rejected() {
        let fixture = Fixture::new();
        let (classifier, calls, _) = canned();
        let session = fixture.session(Platform::Web, Arc::new(OnceLoader::new(classifier)));
        let err = session
            .select_and_classify(fixture.provider_photo("early"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_request_while_busy_is_rejected() {
        let fixture = Fixture::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let classifier = GateClassifier {
            entered: entered_tx,
            release: release_rx,
            active: active.clone(),
            max_active: max_active.clone(),
        };
        let session = Arc::new(fixture.session(
            Platform::Android,
            Arc::new(OnceLoader::new(Box::new(classifier))),
        ));
        session.start().await.unwrap();

        let first_handle = ImageHandle::parse(fixture.photo("first.jpg", 64, 64).to_string_lossy());
        let second_handle = ImageHandle::parse(fixture.photo("second.jpg", 64, 64).to_string_lossy());

        let running = Arc::clone(&session);
        let first = tokio::spawn(async move { running.select_and_classify(first_handle).await });
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .expect("first request never reached the classifier");

        assert_eq!(session.state(), SessionState::Busy);
        let err = session.select_and_classify(second_handle).await.unwrap_err();
        assert!(matches!(err, Error::Busy));
        assert!(matches!(session.view(), ViewState::Classifying { .. }));

        release_tx.send(()).unwrap();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.predictions[0].label, "gate");
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn cancelled_pick_reports_no_image() {
        let fixture = Fixture::new();
        let (classifier, calls, _) = canned();
        let session = fixture.session(Platform::Android, Arc::new(OnceLoader::new(classifier)));
        session.start().await.unwrap();

        let picked = fixture.provider_photo("photo77");
        let picker = QueuePicker(Mutex::new(vec![Some(picked), None]));

        assert!(session.pick_and_classify(&picker).await.unwrap().is_none());
        assert!(matches!(session.view(), ViewState::NoImageSelected));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let report = session.pick_and_classify(&picker).await.unwrap().unwrap();
        assert_eq!(report.source, "content://media/photo77");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    async fn wait_for_state(session: &Session, wanted: SessionState) {
        for _ in 0..500 {
            if session.state() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {wanted:?}, stuck in {:?}", session.state());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_request_stays_busy_until_inference_returns() {
        let fixture = Fixture::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let classifier = GateClassifier {
            entered: entered_tx,
            release: release_rx,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        };
        let session = Arc::new(fixture.session(
            Platform::Web,
            Arc::new(OnceLoader::new(Box::new(classifier))),
        ));
        session.start().await.unwrap();

        let handle = ImageHandle::parse(fixture.photo("slow.jpg", 32, 32).to_string_lossy());
        let running = Arc::clone(&session);
        let request = tokio::spawn(async move { running.select_and_classify(handle).await });
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .expect("request never reached the classifier");

        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());
        assert_eq!(session.state(), SessionState::Busy);
        let next = ImageHandle::parse(fixture.photo("next.jpg", 32, 32).to_string_lossy());
        assert!(matches!(
            session.select_and_classify(next).await,
            Err(Error::Busy)
        ));

        release_tx.send(()).unwrap();
        wait_for_state(&session, SessionState::Ready).await;
        assert!(matches!(session.view(), ViewState::Idle));
    }

    /// Blocks inside `load` until the test releases it.
    struct GateLoader {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        classifier: Mutex<Option<Box<dyn Classifier>>>,
    }

    impl ModelLoader for GateLoader {
        fn load(&self, _profile: &CapabilityProfile) -> Result<Box<dyn Classifier>> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10));
            self.classifier
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::Init("model already taken".into()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backend_is_not_ready_while_initializing() {
        let fixture = Fixture::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let (classifier, _, _) = canned();
        let loader = GateLoader {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            classifier: Mutex::new(Some(classifier)),
        };
        let session = Arc::new(fixture.session(Platform::Ios, Arc::new(loader)));

        let starting = Arc::clone(&session);
        let start = tokio::spawn(async move { starting.start().await });
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .expect("start never reached the loader");

        let status = session.status();
        assert_eq!(status.state, SessionState::Initializing);
        assert!(!status.backend_ready && !status.model_ready);
        assert!(matches!(session.view(), ViewState::Initializing));

        release_tx.send(()).unwrap();
        start.await.unwrap().unwrap();
        let status = session.status();
        assert!(status.backend_ready && status.model_ready);
    }
}
