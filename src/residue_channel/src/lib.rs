//! Host side of a covert channel through uncleared GPU workgroup memory.
//!
//! A writer session keeps priming workgroup memory with a delimiter-framed
//! message (or a repeated canary word). A listener session dispatches a
//! kernel that dumps whatever workgroup memory currently holds and either
//! recovers the framed message or builds a histogram of the residue.

mod backend;
mod codec;
mod driver;
mod env_config;
mod gpu;
mod histogram;

use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;

pub use backend::{ComputeBackend, DispatchGeometry, KernelRole};
pub use codec::{
    DecodeNotFound, EncodedMessage, EncodingError, decode, encode, encode_canary, words_to_text,
};
pub use driver::{
    CancelToken, ChannelDriver, ListenerReport, SessionHandle, SessionState, WriterSummary,
    run_listener, run_writer,
};
pub use gpu::{AdapterSummary, DeviceBuffer, GpuDevice, Kernel, WgpuBackend, list_adapters};
pub use histogram::{Histogram, HistogramReport, TOP_K_REPORTED};

/// The unit of GPU memory observed or written.
pub type Word = u32;

pub const DEFAULT_WORKGROUP_COUNT: u32 = 32;
pub const DEFAULT_THREADS_PER_WORKGROUP: u32 = 1024;
pub const DEFAULT_LOCAL_MEMORY_WORDS: u32 = 8192;
pub const DEFAULT_CANARY_VALUE: Word = 123;
const WRITER_PROGRESS_INTERVAL: u64 = 1000;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub workgroup_count: u32,
    pub threads_per_workgroup: u32,
    pub local_memory_words: u32,
    /// Index into `list_adapters()`. `None` asks wgpu for the preferred adapter.
    pub adapter_index: Option<usize>,
    pub power_preference: wgpu::PowerPreference,
    pub profile_timing: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            workgroup_count: DEFAULT_WORKGROUP_COUNT,
            threads_per_workgroup: DEFAULT_THREADS_PER_WORKGROUP,
            local_memory_words: DEFAULT_LOCAL_MEMORY_WORDS,
            adapter_index: None,
            power_preference: wgpu::PowerPreference::HighPerformance,
            profile_timing: false,
        }
    }
}

impl ChannelOptions {
    /// Defaults overlaid with `RESIDUE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_env_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_env_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        if let Some(value) = env_config::positive_u32(&lookup, "RESIDUE_WORKGROUP_COUNT") {
            options.workgroup_count = value;
        }
        if let Some(value) = env_config::positive_u32(&lookup, "RESIDUE_THREADS_PER_WORKGROUP") {
            options.threads_per_workgroup = value;
        }
        if let Some(value) = env_config::positive_u32(&lookup, "RESIDUE_LOCAL_MEMORY_WORDS") {
            options.local_memory_words = value;
        }
        if let Some(value) = env_config::index(&lookup, "RESIDUE_ADAPTER") {
            options.adapter_index = Some(value);
        }
        options.profile_timing = env_config::truthy(&lookup, "RESIDUE_PROFILE_TIMING");
        options
    }

    pub fn geometry(&self) -> DispatchGeometry {
        DispatchGeometry {
            workgroup_count: self.workgroup_count,
            threads_per_workgroup: self.threads_per_workgroup,
            local_memory_words: self.local_memory_words,
        }
    }

    pub fn validate(&self) -> ResidueResult<()> {
        validate_options(self)
    }
}

/// What the writer primes workgroup memory with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterPayload {
    /// `secret ∥ message ∥ secret`, decodable by a delimiter-scan listener.
    Message(String),
    /// A single word repeated across workgroup memory, for histogram listeners.
    Canary(Word),
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub secret_phrase: String,
    pub payload: WriterPayload,
    /// Stop after this many dispatches. `None` runs until cancelled.
    pub max_iterations: Option<u64>,
}

impl WriterOptions {
    pub fn message(secret_phrase: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            secret_phrase: secret_phrase.into(),
            payload: WriterPayload::Message(payload.into()),
            max_iterations: None,
        }
    }

    pub fn canary(value: Word) -> Self {
        Self {
            secret_phrase: String::new(),
            payload: WriterPayload::Canary(value),
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, iterations: u64) -> Self {
        self.max_iterations = Some(iterations);
        self
    }

    pub fn encode(&self, capacity: usize) -> Result<EncodedMessage, EncodingError> {
        match &self.payload {
            WriterPayload::Message(payload) => encode(&self.secret_phrase, payload, capacity),
            WriterPayload::Canary(value) => encode_canary(*value, capacity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Decode the most recent dump by scanning for the secret delimiters.
    DelimiterScan,
    /// Count every observed word across all dumps.
    Histogram,
}

impl SearchMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DelimiterScan => "delimiter-scan",
            Self::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub secret_phrase: String,
    pub iteration_count: u32,
    pub canary_value: Word,
    pub search_mode: SearchMode,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            secret_phrase: String::new(),
            iteration_count: 1,
            canary_value: DEFAULT_CANARY_VALUE,
            search_mode: SearchMode::DelimiterScan,
        }
    }
}

impl ListenerOptions {
    pub fn delimiter_scan(secret_phrase: impl Into<String>) -> Self {
        Self {
            secret_phrase: secret_phrase.into(),
            ..Self::default()
        }
    }

    pub fn histogram(iteration_count: u32, canary_value: Word) -> Self {
        Self {
            iteration_count,
            canary_value,
            search_mode: SearchMode::Histogram,
            ..Self::default()
        }
    }

    pub fn with_iterations(mut self, iteration_count: u32) -> Self {
        self.iteration_count = iteration_count;
        self
    }

    pub fn validate(&self) -> ResidueResult<()> {
        if self.iteration_count == 0 {
            return Err(ResidueError::InvalidOptions(
                "iteration_count must be greater than 0",
            ));
        }
        if self.search_mode == SearchMode::DelimiterScan && self.secret_phrase.is_empty() {
            return Err(ResidueError::InvalidOptions(
                "delimiter-scan listener requires a secret phrase",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ResidueError {
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("backend initialization failed: {0}")]
    BackendInit(String),
    #[error("gpu dispatch failed: {0}")]
    Dispatch(String),
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),
    #[error("a session is already running on this backend")]
    SessionActive,
    #[error("session worker is not running")]
    WorkerDead,
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl ResidueError {
    /// Backend faults end the session; nothing it produced is surfaced.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::BackendInit(_) | Self::Dispatch(_))
    }
}

pub type ResidueResult<T> = Result<T, ResidueError>;

fn validate_options(options: &ChannelOptions) -> ResidueResult<()> {
    if options.workgroup_count == 0 {
        return Err(ResidueError::InvalidOptions(
            "workgroup_count must be greater than 0",
        ));
    }
    if options.threads_per_workgroup == 0 {
        return Err(ResidueError::InvalidOptions(
            "threads_per_workgroup must be greater than 0",
        ));
    }
    if options.local_memory_words == 0 {
        return Err(ResidueError::InvalidOptions(
            "local_memory_words must be greater than 0",
        ));
    }
    let words = u64::from(options.workgroup_count) * u64::from(options.local_memory_words);
    if words > u64::from(u32::MAX) {
        return Err(ResidueError::InvalidOptions(
            "workgroup_count * local_memory_words must fit in u32",
        ));
    }
    let words = usize::try_from(words)
        .map_err(|_| ResidueError::InvalidOptions("buffer does not fit in host memory"))?;
    bytes_len::<Word>(words)
        .map_err(|_| ResidueError::InvalidOptions("buffer does not fit in host memory"))?;
    Ok(())
}

fn bytes_len<T>(items: usize) -> ResidueResult<u64> {
    let bytes = items
        .checked_mul(std::mem::size_of::<T>())
        .ok_or(ResidueError::Internal("byte length overflow"))?;
    u64::try_from(bytes).map_err(|_| ResidueError::Internal("byte length overflow"))
}

fn lock<T>(mutex: &Mutex<T>) -> ResidueResult<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ResidueError::Internal("mutex poisoned"))
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
