//! Interfaces to the embedding host.
//!
//! The client never touches the filesystem, the lifecycle, or the metrics
//! pipeline directly; it goes through these traits instead.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

/// Observability tags, ordered by name.
pub type Tags = BTreeMap<String, String>;

/// Lifecycle phase of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Set-up phase: schema loading allowed, network access is not.
    Init,
    /// Network access allowed, schema loading is not.
    Execution,
}

/// What the client needs to know about the caller's execution context.
pub trait ExecutionContext: Send + Sync + 'static {
    /// Current lifecycle phase.
    fn phase(&self) -> Phase;

    /// Directory used to resolve relative import paths.
    fn working_dir(&self) -> PathBuf;

    /// Ambient tags merged into every call's tag set.
    fn tags(&self) -> Tags {
        Tags::new()
    }

    /// Cancelled when the caller's context ends. Open streams stop and
    /// telemetry is no longer recorded.
    fn cancellation(&self) -> CancellationToken;
}

/// A ready [`ExecutionContext`] whose phase is advanced explicitly.
///
/// # Example
///
/// ```
/// use grpcweb_client::{ExecutionContext, HostContext, Phase};
///
/// let ctx = HostContext::new("/srv/protos");
/// assert_eq!(ctx.phase(), Phase::Init);
/// ctx.enter_execution();
/// assert_eq!(ctx.phase(), Phase::Execution);
/// ```
#[derive(Debug, Clone)]
pub struct HostContext {
    inner: Arc<HostContextInner>,
}

#[derive(Debug)]
struct HostContextInner {
    phase: AtomicU8,
    working_dir: PathBuf,
    tags: Tags,
    cancel: CancellationToken,
}

impl HostContext {
    /// Create a context in the init phase.
    pub fn new<P: Into<PathBuf>>(working_dir: P) -> Self {
        Self::with_tags(working_dir, Tags::new())
    }

    /// Create a context in the init phase with ambient tags.
    pub fn with_tags<P: Into<PathBuf>>(working_dir: P, tags: Tags) -> Self {
        Self {
            inner: Arc::new(HostContextInner {
                phase: AtomicU8::new(0),
                working_dir: working_dir.into(),
                tags,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Create a context rooted at the process working directory.
    pub fn from_current_dir() -> io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    /// Move to the execution phase.
    pub fn enter_execution(&self) {
        self.inner.phase.store(1, Ordering::SeqCst);
    }

    /// End the context, cancelling everything bound to it.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }
}

impl ExecutionContext for HostContext {
    fn phase(&self) -> Phase {
        match self.inner.phase.load(Ordering::SeqCst) {
            0 => Phase::Init,
            _ => Phase::Execution,
        }
    }

    fn working_dir(&self) -> PathBuf {
        self.inner.working_dir.clone()
    }

    fn tags(&self) -> Tags {
        self.inner.tags.clone()
    }

    fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

/// Reads schema files on behalf of the loader.
pub trait FileAccessor: Send + Sync + 'static {
    /// Read the whole file. Missing files fail with
    /// [`io::ErrorKind::NotFound`].
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// [`FileAccessor`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileAccessor;

impl FileAccessor for OsFileAccessor {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

impl<F> FileAccessor for F
where
    F: Fn(&Path) -> io::Result<Vec<u8>> + Send + Sync + 'static,
{
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self(path)
    }
}

/// Metrics emitted by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Unary call latency in milliseconds.
    ReqDuration,
    /// Opened streams.
    Streams,
    /// Messages received on streams.
    StreamMessagesReceived,
}

impl Metric {
    /// Metric name as registered with the host.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::ReqDuration => "grpc_req_duration",
            Metric::Streams => "grpc_streams",
            Metric::StreamMessagesReceived => "grpc_streams_msgs_received",
        }
    }
}

/// One observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: Metric,
    pub value: f64,
    pub tags: Tags,
    pub time: SystemTime,
}

impl Sample {
    pub fn new(metric: Metric, value: f64, tags: Tags) -> Self {
        Self {
            metric,
            value,
            tags,
            time: SystemTime::now(),
        }
    }
}

/// Receives observations. Called from background threads.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, sample: Sample);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&self, _sample: Sample) {}
}

/// Records a sample unless the caller's context has already ended.
#[derive(Clone)]
pub(crate) struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    done: CancellationToken,
}

impl Telemetry {
    pub(crate) fn new(sink: Arc<dyn TelemetrySink>, done: CancellationToken) -> Self {
        Self { sink, done }
    }

    pub(crate) fn push(&self, metric: Metric, value: f64, tags: &Tags) {
        if self.done.is_cancelled() {
            return;
        }
        self.sink.record(Sample::new(metric, value, tags.clone()));
    }
}
