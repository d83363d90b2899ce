use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use residue_channel::{
    CancelToken, ChannelDriver, ComputeBackend, DecodeNotFound, DispatchGeometry, EncodingError,
    KernelRole, ListenerOptions, ListenerReport, ResidueError, ResidueResult, SessionState, Word,
    WriterOptions, run_listener, run_writer,
};

const GEOMETRY: DispatchGeometry = DispatchGeometry {
    workgroup_count: 2,
    threads_per_workgroup: 4,
    local_memory_words: 16,
};

#[derive(Default)]
struct Counters {
    dispatches: AtomicU64,
    reinitializations: AtomicU64,
    last_upload: Mutex<Option<(Vec<Word>, usize)>>,
}

/// Blocks dispatch `at` until released, after announcing it has started.
struct Gate {
    at: u64,
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// In-memory backend that replays canned buffers and can fail on cue.
struct ScriptedBackend {
    role: KernelRole,
    geometry: DispatchGeometry,
    reads: Vec<Vec<Word>>,
    fail_at: Option<u64>,
    gate: Option<Gate>,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    fn new(role: KernelRole) -> Self {
        Self {
            role,
            geometry: GEOMETRY,
            reads: Vec::new(),
            fail_at: None,
            gate: None,
            counters: Arc::new(Counters::default()),
        }
    }

    fn with_reads(mut self, reads: Vec<Vec<Word>>) -> Self {
        self.reads = reads;
        self
    }

    fn failing_at(mut self, dispatch: u64) -> Self {
        self.fail_at = Some(dispatch);
        self
    }

    fn gated_at(mut self, dispatch: u64) -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.gate = Some(Gate {
            at: dispatch,
            entered: entered_tx,
            release: release_rx,
        });
        (self, entered_rx, release_tx)
    }

    fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    fn dispatches(&self) -> u64 {
        self.counters.dispatches.load(Ordering::SeqCst)
    }
}

impl ComputeBackend for ScriptedBackend {
    fn role(&self) -> KernelRole {
        self.role
    }

    fn geometry(&self) -> DispatchGeometry {
        self.geometry
    }

    fn reinitialize(&mut self, buffer: &[Word], message_len: usize) -> ResidueResult<()> {
        self.counters
            .reinitializations
            .fetch_add(1, Ordering::SeqCst);
        *self.counters.last_upload.lock().unwrap() = Some((buffer.to_vec(), message_len));
        Ok(())
    }

    fn dispatch(&mut self) -> ResidueResult<()> {
        let n = self.counters.dispatches.load(Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            if gate.at == n {
                let _ = gate.entered.send(());
                let _ = gate.release.recv();
            }
        }
        if self.fail_at == Some(n) {
            return Err(ResidueError::Dispatch(format!("device lost at dispatch {n}")));
        }
        self.counters.dispatches.store(n, Ordering::SeqCst);
        Ok(())
    }

    fn read_buffer(&mut self) -> ResidueResult<Vec<Word>> {
        let words = self.geometry.buffer_words();
        if self.reads.is_empty() {
            return Ok(vec![0; words]);
        }
        let n = self.dispatches() as usize;
        let mut read = self.reads[(n - 1) % self.reads.len()].clone();
        read.resize(words, 0);
        Ok(read)
    }
}

fn text(s: &str) -> Vec<Word> {
    s.chars().map(Word::from).collect()
}

#[test]
fn writer_stops_after_the_dispatch_that_saw_cancellation() {
    let (backend, entered, release) = ScriptedBackend::new(KernelRole::Writer).gated_at(5);
    let counters = backend.counters();
    let driver = ChannelDriver::new(backend);

    let handle = driver
        .start_writer(WriterOptions::message("KEY42", "HELLO"))
        .expect("writer should start");
    entered
        .recv_timeout(Duration::from_secs(10))
        .expect("writer should reach the gated dispatch");
    assert_eq!(driver.state(), SessionState::Running);
    handle.cancel();
    release.send(()).expect("worker is waiting on the gate");

    let summary = handle.join().expect("cancelled writer is not an error");
    assert_eq!(summary.iterations, 5);
    assert!(summary.cancelled);
    assert_eq!(counters.dispatches.load(Ordering::SeqCst), 5);
    assert_eq!(counters.reinitializations.load(Ordering::SeqCst), 5);
    assert_eq!(driver.state(), SessionState::Idle);
}

#[test]
fn writer_cancelled_before_start_still_completes_one_dispatch() {
    let mut backend = ScriptedBackend::new(KernelRole::Writer);
    let cancel = CancelToken::new();
    cancel.cancel();

    let summary = run_writer(&mut backend, &WriterOptions::canary(123), &cancel)
        .expect("writer should run");
    assert_eq!(summary.iterations, 1);
    assert!(summary.cancelled);
    assert_eq!(backend.dispatches(), 1);
}

#[test]
fn writer_uploads_frame_followed_by_zeros() {
    let mut backend = ScriptedBackend::new(KernelRole::Writer);
    let options = WriterOptions::message("K", "hi").with_max_iterations(3);

    let summary = run_writer(&mut backend, &options, &CancelToken::new()).expect("writer runs");
    assert_eq!(summary.iterations, 3);
    assert!(!summary.cancelled);

    let (buffer, message_len) = backend
        .counters
        .last_upload
        .lock()
        .unwrap()
        .clone()
        .expect("buffer was uploaded");
    assert_eq!(message_len, 4);
    assert_eq!(buffer.len(), GEOMETRY.buffer_words());
    assert_eq!(&buffer[..4], text("KhiK").as_slice());
    assert!(buffer[4..].iter().all(|&word| word == 0));
}

#[test]
fn oversized_frame_aborts_before_any_dispatch() {
    let backend = ScriptedBackend::new(KernelRole::Writer);
    let counters = backend.counters();
    let driver = ChannelDriver::new(backend);
    let payload = "x".repeat(GEOMETRY.buffer_words());

    let err = driver
        .start_writer(WriterOptions::message("KEY", payload))
        .expect("session starts")
        .join()
        .expect_err("frame cannot fit");
    assert!(matches!(
        err,
        ResidueError::Encoding(EncodingError::FrameOverflow { .. })
    ));
    assert_eq!(counters.dispatches.load(Ordering::SeqCst), 0);
    assert_eq!(counters.reinitializations.load(Ordering::SeqCst), 0);
    assert_eq!(driver.state(), SessionState::Aborted);
}

#[test]
fn dispatch_failure_discards_listener_results_and_allows_restart() {
    let backend = ScriptedBackend::new(KernelRole::Listener)
        .with_reads(vec![vec![123; 32]])
        .failing_at(3);
    let driver = ChannelDriver::new(backend);

    let err = driver
        .start_listener(ListenerOptions::histogram(5, 123))
        .expect("session starts")
        .join()
        .expect_err("third dispatch fails");
    assert!(matches!(err, ResidueError::Dispatch(_)));
    assert!(err.is_terminal());
    assert_eq!(driver.state(), SessionState::Aborted);

    let mut backend = match driver.into_backend() {
        Ok(backend) => backend,
        Err(_) => panic!("no session is running"),
    };
    backend.fail_at = None;
    let driver = ChannelDriver::new(backend);
    let report = driver
        .start_listener(ListenerOptions::histogram(2, 123))
        .expect("restart after abort")
        .join()
        .expect("listener succeeds");
    match report {
        ListenerReport::Histogram(report) => {
            assert_eq!(report.canary_count, 64);
            assert_eq!(report.buffers_observed, 2);
        }
        other => panic!("unexpected report: {other:?}"),
    }
}

#[test]
fn driver_restarts_from_aborted_state() {
    let backend = ScriptedBackend::new(KernelRole::Listener).failing_at(1);
    let driver = ChannelDriver::new(backend);
    driver
        .start_listener(ListenerOptions::histogram(1, 0))
        .expect("session starts")
        .join()
        .expect_err("first dispatch fails");
    assert_eq!(driver.state(), SessionState::Aborted);

    // Still failing, but the driver accepts the new session.
    let handle = driver
        .start_listener(ListenerOptions::histogram(1, 0))
        .expect("aborted driver accepts a new session");
    assert!(handle.join().is_err());
}

#[test]
fn second_session_is_rejected_while_running() {
    let (backend, entered, release) = ScriptedBackend::new(KernelRole::Writer).gated_at(1);
    let counters = backend.counters();
    let driver = ChannelDriver::new(backend);

    let handle = driver
        .start_writer(WriterOptions::canary(7))
        .expect("first session starts");
    entered
        .recv_timeout(Duration::from_secs(10))
        .expect("writer reaches first dispatch");

    let second = driver.start_writer(WriterOptions::canary(8));
    assert!(matches!(second, Err(ResidueError::SessionActive)));
    let listener = driver.start_listener(ListenerOptions::histogram(1, 7));
    assert!(matches!(listener, Err(ResidueError::SessionActive)));
    assert_eq!(driver.state(), SessionState::Running);
    assert!(!handle.is_finished());

    handle.cancel();
    release.send(()).expect("worker is waiting on the gate");
    let summary = handle.join().expect("first session completes");
    assert_eq!(summary.iterations, 1);
    assert_eq!(counters.dispatches.load(Ordering::SeqCst), 1);
    assert_eq!(driver.state(), SessionState::Idle);
}

#[test]
fn invalid_listener_options_do_not_start_a_session() {
    let backend = ScriptedBackend::new(KernelRole::Listener);
    let counters = backend.counters();
    let driver = ChannelDriver::new(backend);

    let result = driver.start_listener(ListenerOptions::histogram(0, 123));
    assert!(matches!(result, Err(ResidueError::InvalidOptions(_))));
    assert_eq!(driver.state(), SessionState::Idle);
    assert_eq!(counters.dispatches.load(Ordering::SeqCst), 0);
}

#[test]
fn histogram_listener_accumulates_every_dump() {
    let mut backend = ScriptedBackend::new(KernelRole::Listener).with_reads(vec![
        vec![123, 123, 5],
        vec![123, 9, 9],
    ]);

    let report = run_listener(&mut backend, &ListenerOptions::histogram(4, 123))
        .expect("listener runs");
    let ListenerReport::Histogram(report) = report else {
        panic!("histogram mode yields a histogram report");
    };
    assert_eq!(backend.dispatches(), 4);
    assert_eq!(report.canary, 123);
    assert_eq!(report.canary_count, 6);
    assert_eq!(report.buffers_observed, 4);
    assert_eq!(report.total_observations, 4 * GEOMETRY.buffer_words() as u64);
    assert_eq!(report.residue_words, 12);
    assert_eq!(report.top[0].0, 0);
    assert!(report.to_string().starts_with(
        "How many times observed canary value (123): 6\n---\nHistogram of top 10 observed values:\n---\n"
    ));
}

#[test]
fn delimiter_listener_decodes_only_the_last_dump() {
    let mut backend = ScriptedBackend::new(KernelRole::Listener).with_reads(vec![
        text("KEY42EARLYKEY42"),
        text("noise only"),
        text("zzKEY42HELLOKEY42zz"),
    ]);

    let options = ListenerOptions::delimiter_scan("KEY42").with_iterations(3);
    let report = run_listener(&mut backend, &options).expect("listener runs");
    assert_eq!(report, ListenerReport::Decoded("HELLO".to_string()));

    let mut backend = ScriptedBackend::new(KernelRole::Listener).with_reads(vec![
        text("KEY42EARLYKEY42"),
        text("noise only"),
    ]);
    let options = ListenerOptions::delimiter_scan("KEY42").with_iterations(2);
    let report = run_listener(&mut backend, &options).expect("listener runs");
    assert_eq!(
        report,
        ListenerReport::NotFound(DecodeNotFound::FirstDelimiterMissing)
    );
    assert_eq!(report.to_string(), "no message found: first delimiter missing");
}

#[test]
fn sessions_reject_backend_with_wrong_kernel() {
    let mut listener = ScriptedBackend::new(KernelRole::Listener);
    let err = run_writer(&mut listener, &WriterOptions::canary(1), &CancelToken::new())
        .expect_err("listener kernel cannot write");
    assert!(matches!(err, ResidueError::InvalidOptions(_)));
    assert_eq!(listener.dispatches(), 0);

    let mut writer = ScriptedBackend::new(KernelRole::Writer);
    let err = run_listener(&mut writer, &ListenerOptions::histogram(1, 1))
        .expect_err("writer kernel cannot listen");
    assert!(matches!(err, ResidueError::InvalidOptions(_)));
}

#[test]
fn boxed_backends_drive_sessions() {
    let backend: Box<dyn ComputeBackend> =
        Box::new(ScriptedBackend::new(KernelRole::Writer));
    let driver = ChannelDriver::new(backend);
    let summary = driver
        .start_writer(WriterOptions::canary(9).with_max_iterations(2))
        .expect("session starts")
        .join()
        .expect("writer runs");
    assert_eq!(summary.iterations, 2);
    assert!(driver.into_backend().is_ok());
}

#[test]
fn try_join_delivers_the_outcome_once() {
    let (backend, entered, release) = ScriptedBackend::new(KernelRole::Listener).gated_at(1);
    let driver = ChannelDriver::new(backend);
    let mut handle = driver
        .start_listener(ListenerOptions::histogram(1, 0))
        .expect("session starts");
    entered
        .recv_timeout(Duration::from_secs(10))
        .expect("listener reaches its dispatch");
    assert!(handle.try_join().is_none());

    release.send(()).expect("worker is waiting on the gate");
    let outcome = loop {
        if let Some(outcome) = handle.try_join() {
            break outcome;
        }
        std::thread::sleep(Duration::from_millis(1));
    };
    assert!(outcome.is_ok());
    assert!(handle.is_finished());
    assert!(matches!(handle.try_join(), Some(Err(ResidueError::WorkerDead))));
}

#[tokio::test]
async fn join_async_resolves_listener_report() {
    let backend = ScriptedBackend::new(KernelRole::Listener).with_reads(vec![text("KKOKK")]);
    let driver = ChannelDriver::new(backend);
    let report = driver
        .start_listener(ListenerOptions::delimiter_scan("K"))
        .expect("session starts")
        .join_async()
        .await
        .expect("listener runs");
    assert_eq!(report, ListenerReport::Decoded("O".to_string()));
}

#[test]
fn writer_frame_must_fit_one_workgroup() {
    // 2 * 5 + 6 = 16 words, exactly one workgroup's local memory.
    let mut backend = ScriptedBackend::new(KernelRole::Writer);
    let options = WriterOptions::message("KEY42", "HELLO!").with_max_iterations(1);
    run_writer(&mut backend, &options, &CancelToken::new()).expect("frame fills one workgroup");
    let (buffer, message_len) = backend
        .counters
        .last_upload
        .lock()
        .unwrap()
        .clone()
        .expect("buffer was uploaded");
    assert_eq!(message_len, 16);
    assert_eq!(buffer.len(), GEOMETRY.buffer_words());
    assert!(buffer[16..].iter().all(|&word| word == 0));

    // One more word would still fit the whole buffer, but no single
    // workgroup could hold it, so the listener would decode a truncated
    // payload.
    let backend = ScriptedBackend::new(KernelRole::Writer);
    let counters = backend.counters();
    let driver = ChannelDriver::new(backend);
    let err = driver
        .start_writer(WriterOptions::message("KEY42", "HELLO!!"))
        .expect("session starts")
        .join()
        .expect_err("frame spans two workgroups");
    assert!(matches!(
        err,
        ResidueError::Encoding(EncodingError::FrameOverflow {
            framed: 17,
            capacity: 16
        })
    ));
    assert_eq!(counters.reinitializations.load(Ordering::SeqCst), 0);
    assert_eq!(counters.dispatches.load(Ordering::SeqCst), 0);
    assert_eq!(driver.state(), SessionState::Aborted);
}

#[test]
fn writer_dispatch_failure_aborts_session() {
    let backend = ScriptedBackend::new(KernelRole::Writer).failing_at(3);
    let counters = backend.counters();
    let driver = ChannelDriver::new(backend);

    let err = driver
        .start_writer(WriterOptions::message("KEY42", "HELLO"))
        .expect("session starts")
        .join()
        .expect_err("third dispatch fails");
    assert!(matches!(err, ResidueError::Dispatch(_)));
    assert!(err.is_terminal());
    assert_eq!(counters.reinitializations.load(Ordering::SeqCst), 3);
    assert_eq!(counters.dispatches.load(Ordering::SeqCst), 2);
    assert_eq!(driver.state(), SessionState::Aborted);
}
