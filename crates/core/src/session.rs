//! Inference session adapter over `ort`.
//!
//! Wraps an `ort::Session` behind the [`TileInference`] seam the
//! orchestrator drives, caches the model's single input and output names
//! at creation, and guards session creation behind a memoized future so
//! at most one initialization is ever in flight.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use ndarray::{Array4, ArrayD};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, warn};

use crate::error::{Result, UpscaleError};
use crate::tile::TileRect;

/// Factor the model applies to both tile dimensions (Real-ESRGAN ×4).
pub const DEFAULT_SCALE_FACTOR: u32 = 4;

/// Intra-op thread count used on CPU unless configured otherwise.
pub const DEFAULT_INTRA_THREADS: usize = 1;

/// Execution target selection.
///
/// Default is `Cpu`. `Cuda` registers the CUDA EP; if the CUDA runtime is
/// unavailable, ort falls back to CPU at session creation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ExecutionTarget {
    #[default]
    Cpu,
    Cuda,
}

impl ExecutionTarget {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model_path: PathBuf,
    pub target: ExecutionTarget,
    pub intra_threads: usize,
    pub scale: u32,
}

impl SessionOptions {
    pub fn new(model_path: PathBuf) -> Self {
        Self {
            model_path,
            target: ExecutionTarget::default(),
            intra_threads: DEFAULT_INTRA_THREADS,
            scale: DEFAULT_SCALE_FACTOR,
        }
    }
}

/// The engine contract the orchestrator drives: one tile in, one enlarged
/// tile out. `run` blocks; the orchestrator invokes it from a blocking
/// thread, making it the pipeline's sole suspension point.
pub trait TileInference: Send + Sync + 'static {
    fn scale(&self) -> u32;
    fn run(&self, tile: TileRect, input: Array4<f32>) -> Result<ArrayD<f32>>;
}

/// An initialized model handle capable of repeated inferences.
///
/// Input and output names are discovered once at creation and cached for
/// the session's lifetime.
pub struct UpscaleSession {
    session: StdMutex<Session>,
    input_name: String,
    output_name: String,
    scale: u32,
}

impl UpscaleSession {
    pub fn create(options: &SessionOptions) -> Result<Self> {
        let session =
            build_session(options).map_err(|error| UpscaleError::SessionCreationFailed {
                cause: format!("{error:#}"),
            })?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| UpscaleError::SessionCreationFailed {
                cause: "model declares no inputs".to_string(),
            })?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or_else(|| UpscaleError::SessionCreationFailed {
                cause: "model declares no outputs".to_string(),
            })?;

        debug!(%input_name, %output_name, scale = options.scale, "Detected model IO");

        Ok(Self {
            session: StdMutex::new(session),
            input_name,
            output_name,
            scale: options.scale,
        })
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }
}

impl TileInference for UpscaleSession {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn run(&self, tile: TileRect, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let run_once = || -> anyhow::Result<ArrayD<f32>> {
            let input_tensor = Tensor::from_array(input)?;
            let mut session = self.session.lock().expect("session lock");
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            Ok(output_view.to_owned())
        };

        run_once().map_err(|error| UpscaleError::InferenceFailed {
            x: tile.x,
            y: tile.y,
            cause: format!("{error:#}"),
        })
    }
}

/// Build an `ort::Session` for the requested execution target.
///
/// CPU sessions get the configured intra-op thread count; CUDA sessions
/// register the CUDA EP and rely on ort's CPU fallback when unavailable.
fn build_session(options: &SessionOptions) -> anyhow::Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match options.target {
        ExecutionTarget::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available — inference will fall back to CPU");
            }

            debug!(execution_target = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(&options.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", options.model_path.display())
                })?
        }
        ExecutionTarget::Cpu => {
            debug!(
                execution_target = "cpu",
                intra_threads = options.intra_threads,
                "Building CPU session"
            );

            builder
                .with_intra_threads(options.intra_threads)?
                .commit_from_file(&options.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", options.model_path.display())
                })?
        }
    };

    Ok(session)
}

type SharedInit<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Memoized one-shot initialization.
///
/// The first caller installs a shared future; callers arriving while it
/// is pending await the same future and observe the same outcome. A
/// completed failure is evicted so the next caller starts fresh.
struct MemoizedInit<T: Clone> {
    pending: StdMutex<Option<SharedInit<T>>>,
}

impl<T: Clone + Send + Sync + 'static> MemoizedInit<T> {
    fn new() -> Self {
        Self {
            pending: StdMutex::new(None),
        }
    }

    async fn get_or_init<F, Fut>(&self, init: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = {
            let mut pending = self.pending.lock().expect("memo lock");
            match pending.as_ref() {
                Some(shared) => shared.clone(),
                None => {
                    let shared = init().boxed().shared();
                    *pending = Some(shared.clone());
                    shared
                }
            }
        };

        let result = shared.clone().await;
        if result.is_err() {
            let mut pending = self.pending.lock().expect("memo lock");
            let is_same = pending
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&shared));
            if is_same {
                *pending = None;
            }
        }
        result
    }

    fn reset(&self) {
        self.pending.lock().expect("memo lock").take();
    }
}

/// Owns session creation across runs: the session is created on first
/// use, retained for reuse, and invalidated only by [`SessionManager::reset`].
pub struct SessionManager {
    options: SessionOptions,
    memo: MemoizedInit<Arc<UpscaleSession>>,
}

impl SessionManager {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            memo: MemoizedInit::new(),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The shared session, creating it on first call. Creation runs on a
    /// blocking thread; concurrent callers await the same creation.
    pub async fn session(&self) -> Result<Arc<UpscaleSession>> {
        let options = self.options.clone();
        self.memo
            .get_or_init(move || async move {
                tokio::task::spawn_blocking(move || UpscaleSession::create(&options).map(Arc::new))
                    .await
                    .map_err(|join_error| UpscaleError::SessionCreationFailed {
                        cause: format!("session creation task failed: {join_error}"),
                    })?
            })
            .await
    }

    /// Drop any cached session so the next call creates a fresh one.
    pub fn reset(&self) {
        self.memo.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn target_from_str_lossy_defaults_to_cpu() {
        assert_eq!(ExecutionTarget::from_str_lossy("cuda"), ExecutionTarget::Cuda);
        assert_eq!(ExecutionTarget::from_str_lossy("GPU"), ExecutionTarget::Cuda);
        assert_eq!(ExecutionTarget::from_str_lossy("cpu"), ExecutionTarget::Cpu);
        assert_eq!(ExecutionTarget::from_str_lossy("wasm"), ExecutionTarget::Cpu);
        assert_eq!(ExecutionTarget::from_str_lossy(""), ExecutionTarget::Cpu);
    }

    #[test]
    fn target_display_round_trips() {
        assert_eq!(ExecutionTarget::Cpu.to_string(), "cpu");
        assert_eq!(ExecutionTarget::Cuda.to_string(), "cuda");
    }

    #[test]
    fn session_options_carry_the_fixed_defaults() {
        let options = SessionOptions::new(PathBuf::from("model.onnx"));
        assert_eq!(options.scale, 4);
        assert_eq!(options.intra_threads, 1);
        assert_eq!(options.target, ExecutionTarget::Cpu);
    }

    fn counting_init(
        calls: &Arc<AtomicUsize>,
        outcome: Result<u32>,
    ) -> impl Future<Output = Result<u32>> + Send + 'static {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            outcome
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_creation() {
        let memo = MemoizedInit::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (first, second) = futures::join!(
            memo.get_or_init(|| counting_init(&calls, Ok(7))),
            memo.get_or_init(|| counting_init(&calls, Ok(8))),
        );

        assert_eq!(first, Ok(7));
        assert_eq!(second, Ok(7), "second caller must observe the first creation");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_is_memoized_across_calls() {
        let memo = MemoizedInit::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(memo.get_or_init(|| counting_init(&calls, Ok(1))).await, Ok(1));
        assert_eq!(memo.get_or_init(|| counting_init(&calls, Ok(2))).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_observe_the_same_failure() {
        let memo = MemoizedInit::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = UpscaleError::SessionCreationFailed {
            cause: "no model".to_string(),
        };

        let (first, second) = futures::join!(
            memo.get_or_init(|| counting_init(&calls, Err(failure.clone()))),
            memo.get_or_init(|| counting_init(&calls, Err(failure.clone()))),
        );

        assert_eq!(first, Err(failure.clone()));
        assert_eq!(second, Err(failure));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_not_cached_for_later_callers() {
        let memo = MemoizedInit::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = UpscaleError::SessionCreationFailed {
            cause: "transient".to_string(),
        };

        let first = memo
            .get_or_init(|| counting_init(&calls, Err(failure.clone())))
            .await;
        assert_eq!(first, Err(failure));

        let second = memo.get_or_init(|| counting_init(&calls, Ok(42))).await;
        assert_eq!(second, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reset_discards_the_cached_value() {
        let memo = MemoizedInit::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(memo.get_or_init(|| counting_init(&calls, Ok(1))).await, Ok(1));
        memo.reset();
        assert_eq!(memo.get_or_init(|| counting_init(&calls, Ok(2))).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
