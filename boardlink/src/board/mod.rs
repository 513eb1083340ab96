//! Asynchronous board front-end.
//!
//! A [`Board`] owns a worker thread that holds the serial port. Commands are
//! submitted one at a time with a completion callback; the owner drives
//! progress by calling [`Board::poll`] (or [`Board::wait`]) from its own
//! loop, which dispatches mailbox messages to a [`BoardEvents`] consumer.
//!
//! ```text
//!  owner thread                      worker thread
//!  ------------                      -------------
//!  submit(cmd, cb) --- Job ------->  execute on port
//!  input(bytes)    --- bytes ----->  forwarded while running
//!  poll(events)    <-- Envelope ---  Status / Progress / Console / ...
//!      cb(success, payload)  <-----  Result (exactly once)
//! ```

pub mod command;
pub mod message;
mod worker;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, warn};

pub use command::{Command, CommandCode, Payload};
pub use message::{BoardEvents, Message, ProgressMeter, coalesce, percent};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::port::PortOpener;
use crate::transport::CancelToken;
use worker::{Envelope, Job, Worker};

/// How long [`Board::wait`] blocks on the mailbox between polls.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Connection state as seen by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No port is held.
    Disconnected,
    /// A scan or connect is running.
    Probing,
    /// A board answered on [`Board::port`].
    Connected,
}

/// Completion callback; receives the success flag and the payload.
pub type Callback = Box<dyn FnOnce(bool, Payload)>;

struct Pending {
    id: u64,
    code: CommandCode,
    callback: Callback,
}

/// Handle to a board driven by a background worker.
pub struct Board {
    jobs: Sender<Job>,
    events: Receiver<Envelope>,
    input: Sender<Vec<u8>>,
    cancel: Arc<CancelToken>,
    state: ConnectionState,
    port: Option<String>,
    last_port: Option<String>,
    pending: Option<Pending>,
    backlog: VecDeque<Envelope>,
    next_id: u64,
    stop_deadline: Option<Instant>,
    stop_grace: Duration,
    last_failure: Option<Error>,
    worker: Option<JoinHandle<()>>,
}

impl Board {
    /// Start the worker thread. No port is opened until a scan or connect.
    pub fn new(opener: Arc<dyn PortOpener>, config: LinkConfig) -> Result<Self> {
        let (job_tx, job_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (input_tx, input_rx) = unbounded();
        let cancel = CancelToken::new();
        let stop_grace = config.stop_grace;

        let worker = Worker::new(opener, config, Arc::clone(&cancel), event_tx, input_rx);
        let handle = std::thread::Builder::new()
            .name("boardlink-worker".to_string())
            .spawn(move || worker.run(&job_rx))?;

        Ok(Self {
            jobs: job_tx,
            events: event_rx,
            input: input_tx,
            cancel,
            state: ConnectionState::Disconnected,
            port: None,
            last_port: None,
            pending: None,
            backlog: VecDeque::new(),
            next_id: 1,
            stop_deadline: None,
            stop_grace,
            last_failure: None,
            worker: Some(handle),
        })
    }

    /// Port to try first on the next scan.
    #[must_use]
    pub fn with_last_port(mut self, port: Option<String>) -> Self {
        self.last_port = port;
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Port of the current connection.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Last port a board was found on.
    pub fn last_port(&self) -> Option<&str> {
        self.last_port.as_deref()
    }

    /// Whether a command is in flight.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Shared cancel token, for signal handlers.
    pub fn cancel_token(&self) -> Arc<CancelToken> {
        Arc::clone(&self.cancel)
    }

    /// Error behind the most recent failed result, if any.
    pub fn take_failure(&mut self) -> Option<Error> {
        self.last_failure.take()
    }

    /// Queue `command`. `callback` runs exactly once, from [`poll`](Self::poll).
    ///
    /// Fails with [`Error::Busy`] while another command is in flight and
    /// with [`Error::NotConnected`] for device commands without a board.
    pub fn submit(
        &mut self,
        command: Command,
        callback: impl FnOnce(bool, Payload) + 'static,
    ) -> Result<u64> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        let code = command.code();
        if !code.is_probe() && self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        self.cancel.reset();
        self.stop_deadline = None;
        self.last_failure = None;
        if code.is_probe() {
            self.state = ConnectionState::Probing;
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!("Submitting {} as job {id}", code.name());
        self.jobs
            .send(Job::Execute {
                id,
                command,
                preferred: self.last_port.clone(),
            })
            .map_err(|_| Error::Protocol("board worker has stopped".to_string()))?;

        self.pending = Some(Pending {
            id,
            code,
            callback: Box::new(callback),
        });
        Ok(id)
    }

    /// Deliver every waiting message to `handler`.
    ///
    /// Returns `true` when the pending command completed during this call.
    pub fn poll(&mut self, handler: &mut dyn BoardEvents) -> bool {
        self.check_stop_deadline();

        self.backlog.extend(self.events.try_iter());
        let Some(id) = self.pending.as_ref().map(|p| p.id) else {
            self.backlog.clear();
            return false;
        };

        let mut messages = Vec::new();
        while let Some(envelope) = self.backlog.pop_front() {
            if envelope.id != id {
                debug!("Dropping stale message from job {}", envelope.id);
                continue;
            }
            let last = matches!(envelope.message, Message::Result { .. });
            messages.push(envelope.message);
            if last {
                break;
            }
        }

        for message in coalesce(messages) {
            if self.dispatch(message, handler) {
                return true;
            }
        }
        false
    }

    fn dispatch(&mut self, message: Message, handler: &mut dyn BoardEvents) -> bool {
        match message {
            Message::Status(text) => handler.status(&text),
            Message::Progress(p) => handler.progress(p),
            Message::Console(data) => handler.console(&data),
            Message::CodeDownloaded => handler.code_downloaded(),
            Message::Interactive(active) => handler.interactive(active),
            Message::Lost => {
                warn!("Board on {} was lost", self.port.as_deref().unwrap_or("?"));
                self.state = ConnectionState::Disconnected;
                self.port = None;
                self.last_failure = Some(Error::Lost);
                handler.lost();
            },
            Message::Exception { source, text } => {
                handler.exception(&source, &text);
                if !matches!(self.last_failure, Some(Error::Lost)) {
                    self.last_failure = Some(Error::Failed { origin: source, text });
                }
            },
            Message::Result { success, payload } => {
                self.complete(success, payload);
                return true;
            },
        }
        false
    }

    fn complete(&mut self, success: bool, payload: Payload) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.stop_deadline = None;

        if pending.code.is_probe() {
            match (&payload, success) {
                (Payload::Port(name), true) => {
                    self.state = ConnectionState::Connected;
                    self.port = Some(name.clone());
                    self.last_port = Some(name.clone());
                },
                _ => {
                    self.state = ConnectionState::Disconnected;
                    self.port = None;
                },
            }
        }
        if success {
            self.last_failure = None;
        } else if self.cancel.is_aborted() && !matches!(self.last_failure, Some(Error::Lost)) {
            self.last_failure = Some(Error::Aborted);
        }
        (pending.callback)(success, payload);
    }

    fn check_stop_deadline(&mut self) {
        if self.pending.is_none() || !self.cancel.is_stop_requested() {
            return;
        }
        let grace = self.stop_grace;
        let deadline = *self.stop_deadline.get_or_insert_with(|| Instant::now() + grace);
        if Instant::now() >= deadline && !self.cancel.is_aborted() {
            warn!("Command did not stop within {grace:?}, aborting");
            self.cancel.request_abort();
        }
    }

    /// Poll until the pending command completes or `timeout` passes.
    ///
    /// Returns `true` on completion, `false` on timeout or when nothing is
    /// pending.
    pub fn wait(&mut self, handler: &mut dyn BoardEvents, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll(handler) {
                return true;
            }
            if self.pending.is_none() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.events.recv_timeout(WAIT_SLICE.min(deadline - now)) {
                Ok(envelope) => self.backlog.push_back(envelope),
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Board worker exited unexpectedly");
                    self.state = ConnectionState::Disconnected;
                    self.port = None;
                    self.last_failure = Some(Error::Lost);
                    self.complete(false, Payload::None);
                    return true;
                },
            }
        }
    }

    /// Submit `command` and block until it completes.
    ///
    /// A failed command returns the error reported by the worker: an
    /// exception becomes [`Error::Failed`], a vanished device [`Error::Lost`]
    /// and a command cut short by an abort [`Error::Aborted`].
    pub fn call(&mut self, command: Command, handler: &mut dyn BoardEvents) -> Result<Payload> {
        let outcome: Rc<RefCell<Option<(bool, Payload)>>> = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&outcome);
        self.submit(command, move |success, payload| {
            *slot.borrow_mut() = Some((success, payload));
        })?;

        while !self.wait(handler, Duration::from_secs(3600)) {}

        let result = outcome.borrow_mut().take();
        match result {
            Some((true, payload)) => Ok(payload),
            _ => Err(self
                .last_failure
                .take()
                .unwrap_or_else(|| Error::Protocol("command failed".to_string()))),
        }
    }

    /// Send keyboard input to a running program or interactive session.
    pub fn input(&self, data: &[u8]) {
        if self.pending.is_some() && !data.is_empty() {
            let _ = self.input.send(data.to_vec());
        }
    }

    /// Ask the running command to stop; it is aborted if it does not finish
    /// within the configured grace period.
    pub fn stop(&mut self) {
        if self.pending.is_some() {
            self.cancel.request_stop();
            let grace = self.stop_grace;
            self.stop_deadline.get_or_insert_with(|| Instant::now() + grace);
        }
    }

    /// Abort the running command immediately.
    pub fn force_stop(&mut self) {
        if self.pending.is_some() {
            self.cancel.request_abort();
        }
    }

    /// Release the port so other programs can open it.
    pub fn close(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        let _ = self.jobs.send(Job::Release);
        self.state = ConnectionState::Disconnected;
        self.port = None;
        Ok(())
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        self.cancel.request_abort();
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Board worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimOpener};
    use std::cell::Cell;

    #[derive(Default)]
    struct Recorder {
        statuses: Vec<String>,
        progress: Vec<Option<u8>>,
        console: Vec<u8>,
        downloaded: bool,
        interactive: Vec<bool>,
        lost: bool,
        exceptions: Vec<(String, String)>,
        /// Order of code, console and result events.
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl BoardEvents for Recorder {
        fn status(&mut self, text: &str) {
            self.statuses.push(text.to_string());
        }

        fn progress(&mut self, percent: Option<u8>) {
            self.progress.push(percent);
        }

        fn console(&mut self, data: &[u8]) {
            self.console.extend_from_slice(data);
            let mut log = self.log.borrow_mut();
            if log.last() != Some(&"console") {
                log.push("console");
            }
        }

        fn code_downloaded(&mut self) {
            self.downloaded = true;
            self.log.borrow_mut().push("downloaded");
        }

        fn interactive(&mut self, active: bool) {
            self.interactive.push(active);
        }

        fn lost(&mut self) {
            self.lost = true;
        }

        fn exception(&mut self, source: &str, text: &str) {
            self.exceptions.push((source.to_string(), text.to_string()));
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            probe_timeout: Duration::from_millis(100),
            stop_grace: Duration::from_millis(200),
            ..LinkConfig::default()
        }
    }

    fn board(devices: &[SimDevice]) -> Board {
        Board::new(Arc::new(SimOpener::new(devices)), fast_config()).unwrap()
    }

    fn connected(sim: &SimDevice) -> Board {
        let mut board = board(std::slice::from_ref(sim));
        board.call(Command::Scan, &mut ()).unwrap();
        board
    }

    fn poll_until(board: &mut Board, rec: &mut Recorder, done: impl Fn(&Recorder) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(rec) {
            assert!(Instant::now() < deadline, "condition not reached");
            board.poll(rec);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_scan_prefers_last_port() {
        let a = SimDevice::named("a");
        let b = SimDevice::named("b");
        let mut board = board(&[a.clone(), b.clone()]).with_last_port(Some("b".into()));

        let payload = board.call(Command::Scan, &mut ()).unwrap();
        assert_eq!(payload, Payload::Port("b".into()));
        assert_eq!(board.state(), ConnectionState::Connected);
        assert_eq!(board.port(), Some("b"));
        assert_eq!(a.enter_requests(), 0);
        assert!(!b.in_raw_mode());
    }

    #[test]
    fn test_scan_skips_port_that_cannot_open() {
        let sim = SimDevice::new();
        let opener = SimOpener::new(std::slice::from_ref(&sim)).with_dead_port("ghost");
        let mut board = Board::new(Arc::new(opener), fast_config()).unwrap();

        let payload = board.call(Command::Scan, &mut ()).unwrap();
        assert_eq!(payload, Payload::Port("sim0".into()));
        assert_eq!(board.last_port(), Some("sim0"));
    }

    #[test]
    fn test_scan_without_board_fails() {
        let sim = SimDevice::new();
        sim.set_responsive(false);
        let mut board = board(&[sim]);
        let mut rec = Recorder::default();

        let err = board.call(Command::Scan, &mut rec).unwrap_err();
        assert!(matches!(err, Error::Failed { .. }));
        assert!(err.to_string().contains("No MicroPython board"));
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(rec.statuses.iter().any(|s| s == "Probing sim0"));
    }

    #[test]
    fn test_device_command_needs_connection() {
        let mut board = board(&[SimDevice::new()]);
        let err = board.submit(Command::ListDir, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(!board.is_busy());
    }

    #[test]
    fn test_version_and_listing() {
        let sim = SimDevice::new();
        sim.put("/main.py", b"print(1)\n");
        let mut board = connected(&sim);

        match board.call(Command::GetVersion, &mut ()).unwrap() {
            Payload::Version(v) => assert_eq!(v.sysname, "rp2"),
            other => panic!("unexpected payload {other:?}"),
        }
        match board.call(Command::ListDir, &mut ()).unwrap() {
            Payload::Listing(entries) => assert_eq!(entries[0].name, "main.py"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_second_submit_is_busy_and_callback_fires_once() {
        let sim = SimDevice::new();
        let mut board = connected(&sim);
        let mut rec = Recorder::default();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let log = Rc::clone(&rec.log);

        board
            .submit(
                Command::Run {
                    name: "echo.py".into(),
                    code: "print(input())".into(),
                },
                move |success, _| {
                    assert!(success);
                    counter.set(counter.get() + 1);
                    log.borrow_mut().push("result");
                },
            )
            .unwrap();
        assert!(matches!(
            board.submit(Command::ListDir, |_, _| panic!("rejected command completed")),
            Err(Error::Busy)
        ));

        poll_until(&mut board, &mut rec, |r| r.downloaded);
        assert!(matches!(
            board.submit(Command::GetVersion, |_, _| panic!("rejected command completed")),
            Err(Error::Busy)
        ));
        board.input(b"hi\r");
        assert!(board.wait(&mut rec, Duration::from_secs(5)));

        assert_eq!(*rec.log.borrow(), ["downloaded", "console", "result"]);
        assert_eq!(rec.console, b"hi\r\n");
        assert_eq!(calls.get(), 1);
        assert!(!board.poll(&mut rec));
        assert_eq!(calls.get(), 1);
        assert!(rec.exceptions.is_empty());
        assert_eq!(board.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_stopped_program_completes_successfully() {
        let sim = SimDevice::new();
        let mut board = connected(&sim);
        let mut rec = Recorder::default();

        board
            .submit(
                Command::Run {
                    name: "loop.py".into(),
                    code: "while True:\n    pass\n".into(),
                },
                |success, _| assert!(success),
            )
            .unwrap();
        poll_until(&mut board, &mut rec, |r| r.downloaded);
        board.stop();
        assert!(board.wait(&mut rec, Duration::from_secs(5)));
        assert!(rec.exceptions.is_empty());
        assert!(board.take_failure().is_none());
    }

    #[test]
    fn test_unstoppable_program_is_aborted() {
        let sim = SimDevice::new();
        sim.ignore_interrupts(true);
        let mut board = connected(&sim);
        let mut rec = Recorder::default();

        board
            .submit(
                Command::Run {
                    name: "loop.py".into(),
                    code: "while True:\n    pass\n".into(),
                },
                |success, _| assert!(!success),
            )
            .unwrap();
        poll_until(&mut board, &mut rec, |r| r.downloaded);
        board.stop();
        assert!(board.wait(&mut rec, Duration::from_secs(5)));
        assert!(matches!(board.take_failure(), Some(Error::Aborted)));
        assert_eq!(rec.exceptions[0].1, "Operation aborted");
        assert_eq!(board.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_program_exception_names_program() {
        let sim = SimDevice::new();
        let mut board = connected(&sim);
        let mut rec = Recorder::default();

        let err = board
            .call(
                Command::Run {
                    name: "main.py".into(),
                    code: "x = 1\nraise ValueError('bad')\n".into(),
                },
                &mut rec,
            )
            .unwrap_err();
        match err {
            Error::Failed { origin, text } => {
                assert_eq!(origin, "main.py");
                assert!(text.contains("ValueError: bad"));
                assert!(text.contains("line 2"));
            },
            other => panic!("unexpected error {other:?}"),
        }
        assert!(rec.downloaded);
    }

    #[test]
    fn test_program_output_and_input() {
        let sim = SimDevice::new();
        let mut board = connected(&sim);
        let mut rec = Recorder::default();

        board
            .submit(
                Command::Run {
                    name: "echo.py".into(),
                    code: "print(input())".into(),
                },
                |success, _| assert!(success),
            )
            .unwrap();
        poll_until(&mut board, &mut rec, |r| r.downloaded);
        board.input(b"hi\r");
        assert!(board.wait(&mut rec, Duration::from_secs(5)));
        assert_eq!(rec.console, b"hi\r\n");
        assert_eq!(sim.received_input(), b"hi\r");
    }

    #[test]
    fn test_transfer_progress_is_cleared() {
        let sim = SimDevice::new();
        sim.put("/data.bin", &[7u8; 1000]);
        let mut board = connected(&sim);
        let mut rec = Recorder::default();

        let payload = board
            .call(
                Command::GetFile {
                    path: "/data.bin".into(),
                    size: Some(1000),
                },
                &mut rec,
            )
            .unwrap();
        assert_eq!(payload, Payload::File(vec![7u8; 1000]));
        assert_eq!(rec.progress.last(), Some(&None));
        assert!(rec.progress.contains(&Some(100)));
    }

    #[test]
    fn test_download_without_size_reports_progress() {
        let sim = SimDevice::new();
        sim.put("/lib/data.bin", &[3u8; 700]);
        let mut board = connected(&sim);
        let mut rec = Recorder::default();

        let payload = board
            .call(
                Command::GetFile {
                    path: "/lib/data.bin".into(),
                    size: None,
                },
                &mut rec,
            )
            .unwrap();
        assert_eq!(payload, Payload::File(vec![3u8; 700]));
        assert!(rec.progress.iter().any(|p| matches!(p, Some(n) if *n < 100)));
        assert!(rec.progress.contains(&Some(100)));
        assert_eq!(rec.progress.last(), Some(&None));
    }

    #[test]
    fn test_unplugged_board_is_lost() {
        let sim = SimDevice::new();
        let mut board = connected(&sim);
        let mut rec = Recorder::default();

        sim.unplug();
        let err = board.call(Command::ListDir, &mut rec).unwrap_err();
        assert!(matches!(err, Error::Lost));
        assert!(rec.lost);
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(matches!(
            board.submit(Command::ListDir, |_, _| {}),
            Err(Error::NotConnected)
        ));
        assert_eq!(board.last_port(), Some("sim0"));
    }

    #[test]
    fn test_interactive_session() {
        let sim = SimDevice::new();
        let mut board = connected(&sim);
        let mut rec = Recorder::default();

        board.submit(Command::Repl, |success, _| assert!(success)).unwrap();
        poll_until(&mut board, &mut rec, |r| r.interactive == [true]);
        assert!(String::from_utf8_lossy(&rec.console).ends_with(">>> "));

        board.input(b"x");
        poll_until(&mut board, &mut rec, |r| r.console.ends_with(b">>> x"));
        board.stop();
        assert!(board.wait(&mut rec, Duration::from_secs(5)));
        assert_eq!(rec.interactive, vec![true, false]);
    }

    #[test]
    fn test_close_releases_port() {
        let sim = SimDevice::new();
        let mut board = connected(&sim);
        board.close().unwrap();
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(board.port().is_none());
        assert_eq!(board.last_port(), Some("sim0"));
    }
}
