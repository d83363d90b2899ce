//! Session state machine that repeatedly dispatches on a compute backend.
//!
//! A session runs on its own named worker thread and owns the backend for
//! its whole duration. Its outcome is handed back once, through a
//! single-slot channel, when the loop finishes; callers never see backend
//! state while a dispatch is outstanding.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::JoinHandle;

use crate::backend::{ComputeBackend, KernelRole};
use crate::codec::{DecodeNotFound, decode};
use crate::histogram::{Histogram, HistogramReport};
use crate::{
    ListenerOptions, ResidueError, ResidueResult, SearchMode, WRITER_PROGRESS_INTERVAL, Word,
    WriterOptions, lock,
};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_ABORTED: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    /// The last session ended on an error. A new session may be started.
    Aborted,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_RUNNING => Self::Running,
            STATE_ABORTED => Self::Aborted,
            _ => Self::Idle,
        }
    }
}

/// Shared flag a writer loop polls after every completed dispatch.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriterSummary {
    /// Dispatches that ran to completion.
    pub iterations: u64,
    /// `true` when the loop stopped because it was cancelled rather than
    /// because it reached `max_iterations`.
    pub cancelled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerReport {
    Decoded(String),
    NotFound(DecodeNotFound),
    Histogram(HistogramReport),
}

impl fmt::Display for ListenerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoded(message) => write!(f, "{message}"),
            Self::NotFound(reason) => write!(f, "no message found: {reason}"),
            Self::Histogram(report) => write!(f, "{report}"),
        }
    }
}

struct Shared<B> {
    backend: Mutex<B>,
    state: AtomicU8,
}

/// Owns one backend and runs at most one session on it at a time.
pub struct ChannelDriver<B> {
    shared: Arc<Shared<B>>,
}

impl<B: ComputeBackend + 'static> ChannelDriver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend: Mutex::new(backend),
                state: AtomicU8::new(STATE_IDLE),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Starts an unbounded (or `max_iterations`-bounded) writer loop.
    ///
    /// Fails with `SessionActive`, leaving the running session untouched,
    /// if one is already in progress.
    pub fn start_writer(&self, options: WriterOptions) -> ResidueResult<SessionHandle<WriterSummary>> {
        self.start("residue-writer", move |backend, cancel| {
            run_writer(backend, &options, cancel)
        })
    }

    /// Starts a bounded listener loop. Listener sessions ignore cancellation.
    pub fn start_listener(
        &self,
        options: ListenerOptions,
    ) -> ResidueResult<SessionHandle<ListenerReport>> {
        options.validate()?;
        self.start("residue-listener", move |backend, _cancel| {
            run_listener(backend, &options)
        })
    }

    /// Gives the backend back once no session is running.
    pub fn into_backend(self) -> Result<B, Self> {
        if self.state() == SessionState::Running {
            return Err(self);
        }
        match Arc::try_unwrap(self.shared) {
            // A worker that panicked mid-session leaves the mutex poisoned;
            // the backend itself is still usable for teardown.
            Ok(shared) => Ok(shared
                .backend
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)),
            Err(shared) => Err(Self { shared }),
        }
    }

    fn start<T, F>(&self, thread_name: &str, body: F) -> ResidueResult<SessionHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut B, &CancelToken) -> ResidueResult<T> + Send + 'static,
    {
        let previous = self.shared.state.load(Ordering::Acquire);
        if previous == STATE_RUNNING
            || self
                .shared
                .state
                .compare_exchange(previous, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(ResidueError::SessionActive);
        }

        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = mpsc::sync_channel::<ResidueResult<T>>(1);
        let name = thread_name.to_string();

        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut guard = RunningGuard {
                    state: &shared.state,
                    finished: false,
                };
                let result = match lock(&shared.backend) {
                    Ok(mut backend) => body(&mut *backend, &worker_cancel),
                    Err(err) => Err(err),
                };
                match &result {
                    Ok(_) => log::info!("{name}: session finished"),
                    Err(err) => log::error!("{name}: session aborted: {err}"),
                }
                guard.finish(result.is_ok());
                let _ = tx.send(result);
            });

        match spawned {
            Ok(join_handle) => Ok(SessionHandle {
                receiver: rx,
                cancel,
                join_handle: Some(join_handle),
            }),
            Err(err) => {
                self.shared.state.store(previous, Ordering::Release);
                log::error!("failed to spawn {thread_name} thread: {err}");
                Err(ResidueError::WorkerDead)
            }
        }
    }
}

/// Marks the session aborted if the worker unwinds before finishing.
struct RunningGuard<'a> {
    state: &'a AtomicU8,
    finished: bool,
}

impl RunningGuard<'_> {
    fn finish(&mut self, success: bool) {
        let next = if success { STATE_IDLE } else { STATE_ABORTED };
        self.state.store(next, Ordering::Release);
        self.finished = true;
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.store(STATE_ABORTED, Ordering::Release);
        }
    }
}

/// Handle to a running session. The outcome is delivered exactly once.
///
/// Dropping the handle cancels a writer (after its current dispatch) and
/// detaches the worker; the backend returns to the driver either way.
pub struct SessionHandle<T> {
    receiver: mpsc::Receiver<ResidueResult<T>>,
    cancel: CancelToken,
    join_handle: Option<JoinHandle<()>>,
}

impl<T> SessionHandle<T> {
    /// Requests the writer loop to stop after the dispatch in progress.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Blocks until the session ends.
    pub fn join(mut self) -> ResidueResult<T> {
        let result = self.receiver.recv().map_err(|_| ResidueError::WorkerDead);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
        result?
    }

    /// The outcome if the session has ended, without blocking.
    pub fn try_join(&mut self) -> Option<ResidueResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => {
                if let Some(handle) = self.join_handle.take() {
                    let _ = handle.join();
                }
                Some(result)
            }
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(ResidueError::WorkerDead)),
        }
    }
}

impl<T: Send + 'static> SessionHandle<T> {
    /// `join` on tokio's blocking pool.
    pub async fn join_async(self) -> ResidueResult<T> {
        tokio::task::spawn_blocking(move || self.join())
            .await
            .map_err(|_| ResidueError::WorkerDead)?
    }
}

impl<T> Drop for SessionHandle<T> {
    fn drop(&mut self) {
        if self.join_handle.is_some() {
            self.cancel.cancel();
        }
    }
}

/// Writer loop on the calling thread.
///
/// The frame is encoded before the first dispatch, so an `EncodingError`
/// (including a frame longer than `local_memory_words`) aborts without
/// touching the device. Each iteration re-uploads the buffer,
/// dispatches, then polls `cancel`; a dispatch once started always
/// completes.
pub fn run_writer<B>(
    backend: &mut B,
    options: &WriterOptions,
    cancel: &CancelToken,
) -> ResidueResult<WriterSummary>
where
    B: ComputeBackend + ?Sized,
{
    if backend.role() != KernelRole::Writer {
        return Err(ResidueError::InvalidOptions(
            "writer session needs a backend compiled with the writer kernel",
        ));
    }

    // Each workgroup repeats the frame across its own local memory, so the
    // whole frame has to fit in one workgroup's slice.
    let geometry = backend.geometry();
    let message = options.encode(geometry.local_memory_words as usize)?;
    let message_len = message.framed_len();
    let mut buffer = message.into_buffer();
    buffer.resize(geometry.buffer_words(), 0);
    log::info!(
        "writer: priming {} workgroups x {} words with a {}-word frame",
        geometry.workgroup_count,
        geometry.local_memory_words,
        message_len
    );

    let mut iterations = 0_u64;
    loop {
        if options.max_iterations.is_some_and(|max| iterations >= max) {
            return Ok(WriterSummary {
                iterations,
                cancelled: false,
            });
        }

        backend.reinitialize(&buffer, message_len)?;
        backend.dispatch()?;
        iterations += 1;
        if iterations % WRITER_PROGRESS_INTERVAL == 0 {
            log::info!("writer: {iterations} dispatches completed");
        }

        if cancel.is_cancelled() {
            log::info!("writer: cancelled after {iterations} dispatches");
            return Ok(WriterSummary {
                iterations,
                cancelled: true,
            });
        }
    }
}

/// Listener loop on the calling thread.
///
/// Runs exactly `iteration_count` dispatches without writing the buffer.
/// Any failure discards everything observed so far.
pub fn run_listener<B>(backend: &mut B, options: &ListenerOptions) -> ResidueResult<ListenerReport>
where
    B: ComputeBackend + ?Sized,
{
    options.validate()?;
    if backend.role() != KernelRole::Listener {
        return Err(ResidueError::InvalidOptions(
            "listener session needs a backend compiled with the listener kernel",
        ));
    }

    let expected_words = backend.geometry().buffer_words();
    let mut histogram = Histogram::with_canary(options.canary_value);
    let mut last: Option<Vec<Word>> = None;
    log::info!(
        "listener: {} iterations in {} mode",
        options.iteration_count,
        options.search_mode.as_str()
    );

    for _ in 0..options.iteration_count {
        backend.dispatch()?;
        let buffer = backend.read_buffer()?;
        if buffer.len() != expected_words {
            return Err(ResidueError::Dispatch(format!(
                "read {} words, session buffer holds {expected_words}",
                buffer.len()
            )));
        }
        match options.search_mode {
            SearchMode::Histogram => histogram.observe(&buffer),
            SearchMode::DelimiterScan => last = Some(buffer),
        }
    }

    let report = match options.search_mode {
        SearchMode::Histogram => ListenerReport::Histogram(histogram.report(options.canary_value)),
        SearchMode::DelimiterScan => {
            let buffer = last.ok_or(ResidueError::Internal("listener produced no buffer"))?;
            match decode(&buffer, &options.secret_phrase) {
                Ok(message) => ListenerReport::Decoded(message),
                Err(reason) => ListenerReport::NotFound(reason),
            }
        }
    };
    Ok(report)
}
