//! The board worker thread.
//!
//! The worker exclusively owns the serial port. It takes one job at a time
//! from the job channel and reports everything through the mailbox; every
//! executed command ends with exactly one [`Message::Result`].

use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};

use super::command::{Command, Payload};
use super::message::{Message, ProgressMeter};
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::files;
use crate::port::{Port, PortOpener, order_candidates};
use crate::protocol::{RawRepl, check_error};
use crate::sync::{self, Reporter};
use crate::transport::{CancelToken, Transport};

type Repl = RawRepl<Box<dyn Port>>;

/// A mailbox message tagged with the job that produced it.
pub(crate) struct Envelope {
    pub(crate) id: u64,
    pub(crate) message: Message,
}

/// Work for the worker thread.
pub(crate) enum Job {
    Execute {
        id: u64,
        command: Command,
        preferred: Option<String>,
    },
    /// Drop the port so external tools can use it.
    Release,
    Shutdown,
}

/// Sends one job's messages.
pub(crate) struct Emitter {
    id: u64,
    tx: Sender<Envelope>,
    meter: RefCell<ProgressMeter>,
    showing_progress: RefCell<bool>,
}

impl Emitter {
    fn new(id: u64, tx: Sender<Envelope>) -> Self {
        Self {
            id,
            tx,
            meter: RefCell::new(ProgressMeter::default()),
            showing_progress: RefCell::new(false),
        }
    }

    fn send(&self, message: Message) {
        // The owner may be gone; nothing left to tell.
        let _ = self.tx.send(Envelope {
            id: self.id,
            message,
        });
    }

    fn send_status(&self, text: impl Into<String>) {
        self.send(Message::Status(text.into()));
    }

    fn send_console(&self, data: &[u8]) {
        if !data.is_empty() {
            self.send(Message::Console(data.to_vec()));
        }
    }

    fn send_progress(&self, done: usize, total: usize) {
        if let Some(p) = self.meter.borrow_mut().update(done, total) {
            *self.showing_progress.borrow_mut() = true;
            self.send(Message::Progress(Some(p)));
        }
    }

    fn clear_progress(&self) {
        self.meter.borrow_mut().reset();
        if self.showing_progress.replace(false) {
            self.send(Message::Progress(None));
        }
    }
}

impl Reporter for Emitter {
    fn begin(&mut self, text: &str) {
        self.clear_progress();
        self.send_status(text);
    }

    fn status(&mut self, text: &str) {
        self.send_status(text);
    }

    fn progress(&mut self, done: usize, total: usize) {
        self.send_progress(done, total);
    }
}

pub(crate) struct Worker {
    opener: Arc<dyn PortOpener>,
    config: LinkConfig,
    cancel: Arc<CancelToken>,
    repl: Option<Repl>,
    events: Sender<Envelope>,
    input: Receiver<Vec<u8>>,
}

impl Worker {
    pub(crate) fn new(
        opener: Arc<dyn PortOpener>,
        config: LinkConfig,
        cancel: Arc<CancelToken>,
        events: Sender<Envelope>,
        input: Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            opener,
            config,
            cancel,
            repl: None,
            events,
            input,
        }
    }

    /// Process jobs until shutdown or until the owner goes away.
    pub(crate) fn run(mut self, jobs: &Receiver<Job>) {
        for job in jobs {
            match job {
                Job::Execute {
                    id,
                    command,
                    preferred,
                } => self.handle(id, command, preferred.as_deref()),
                Job::Release => self.release(),
                Job::Shutdown => break,
            }
        }
        self.release();
        debug!("Board worker stopped");
    }

    fn release(&mut self) {
        if let Some(mut repl) = self.repl.take() {
            let transport = repl.transport_mut();
            info!("Releasing {}", transport.port_name());
            if let Err(e) = transport.close() {
                debug!("Closing port failed: {e}");
            }
        }
    }

    fn handle(&mut self, id: u64, command: Command, preferred: Option<&str>) {
        let mut emit = Emitter::new(id, self.events.clone());
        let code = command.code();
        let origin = match &command {
            Command::Run { name, .. } => name.clone(),
            _ => code.name().to_string(),
        };
        // Keystrokes typed before this command belong to nobody.
        while self.input.try_recv().is_ok() {}

        debug!("Executing {}", code.name());
        let result = self.execute(&mut emit, command, preferred);
        emit.clear_progress();

        match result {
            Ok(payload) => emit.send(Message::Result {
                success: true,
                payload,
            }),
            Err(e) => {
                let lost = self
                    .repl
                    .as_mut()
                    .is_some_and(|r| !r.transport_mut().is_alive());
                if lost {
                    warn!("Board lost during {}: {e}", code.name());
                    self.release();
                    emit.send(Message::Lost);
                } else if let Some(tb) = e.traceback() {
                    debug!("{} raised: {}", origin, tb.message);
                    emit.send(Message::Exception {
                        source: origin,
                        text: tb.text.clone(),
                    });
                } else {
                    debug!("{} failed: {e}", code.name());
                    emit.send(Message::Exception {
                        source: String::new(),
                        text: e.to_string(),
                    });
                }
                emit.send(Message::Result {
                    success: false,
                    payload: Payload::None,
                });
            },
        }
    }

    fn execute(
        &mut self,
        emit: &mut Emitter,
        command: Command,
        preferred: Option<&str>,
    ) -> Result<Payload> {
        match command {
            Command::Scan => {
                let candidates = order_candidates(self.opener.candidates(), preferred);
                self.probe(emit, candidates)
            },
            Command::Connect { port } => self.probe(emit, vec![port]),
            other => {
                let repl = self.repl.as_mut().ok_or(Error::NotConnected)?;
                device_command(repl, emit, &self.input, &self.cancel, other)
            },
        }
    }

    /// Open candidates in order until one enters the raw REPL.
    fn probe(&mut self, emit: &Emitter, candidates: Vec<String>) -> Result<Payload> {
        self.release();
        let total = candidates.len();

        for (idx, name) in candidates.into_iter().enumerate() {
            if self.cancel.is_aborted() || self.cancel.is_stop_requested() {
                return Err(Error::Aborted);
            }
            emit.send_status(format!("Probing {name}"));
            emit.send_progress(idx, total);
            info!("Probing {name}");

            let port = match self.opener.open(&name) {
                Ok(port) => port,
                Err(e) => {
                    debug!("Cannot open {name}: {e}");
                    continue;
                },
            };
            let mut repl = RawRepl::new(
                Transport::new(port, Arc::clone(&self.cancel)),
                self.config.clone(),
            );

            match repl.enter_with_retry().and_then(|()| repl.exit_raw_repl()) {
                Ok(()) => {
                    info!("Board found on {name}");
                    emit.send_status(format!("Connected to {name}"));
                    self.repl = Some(repl);
                    return Ok(Payload::Port(name));
                },
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => {
                    warn!("No board on {name}: {e}");
                    let _ = repl.transport_mut().close();
                },
            }
        }
        Err(Error::DeviceNotFound)
    }
}

/// Size of the file at `path` according to a fresh listing.
fn listed_size<P: Port>(repl: &mut RawRepl<P>, path: &str) -> Result<Option<usize>> {
    let entries = files::listdir(repl)?;
    Ok(files::walk_files(&entries)
        .into_iter()
        .find(|(file, _)| file == path)
        .map(|(_, size)| size as usize))
}

fn device_command(
    repl: &mut Repl,
    emit: &mut Emitter,
    input: &Receiver<Vec<u8>>,
    cancel: &CancelToken,
    command: Command,
) -> Result<Payload> {
    match command {
        Command::GetVersion => repl.session(files::version).map(Payload::Version),
        Command::ListDir => repl.session(files::listdir).map(Payload::Listing),
        Command::Hash => {
            emit.send_status("Hashing files");
            repl.session(|r| files::hash_tree(r, &mut |done, total| emit.send_progress(done, total)))
                .map(Payload::Hashes)
        },
        Command::GetFile { path, size } => {
            emit.send_status(format!("Downloading {path}"));
            repl.session(|r| {
                let size = match size {
                    Some(size) => Some(size),
                    None => listed_size(r, &path)?,
                };
                files::get_file(r, &path, size, &mut |done, total| {
                    if let Some(total) = total {
                        emit.send_progress(done, total);
                    }
                })
            })
            .map(Payload::File)
        },
        Command::PutFile { path, data } => {
            emit.send_status(format!("Uploading {path}"));
            repl.session(|r| {
                files::put_file(r, &path, &data, &mut |done, total| {
                    emit.send_progress(done, total);
                })
            })?;
            Ok(Payload::None)
        },
        Command::Remove { path } => {
            repl.session(|r| files::remove(r, &path))?;
            Ok(Payload::None)
        },
        Command::MakeDir { path } => {
            repl.session(|r| files::mkdir(r, &path))?;
            Ok(Payload::None)
        },
        Command::Rename { from, to } => {
            repl.session(|r| files::rename(r, &from, &to))?;
            Ok(Payload::None)
        },
        Command::Run { name, code } => run_program(repl, emit, input, cancel, &name, &code),
        Command::Repl => interactive(repl, emit, input, cancel),
        Command::Backup { archive } => {
            sync::backup(repl, Path::new(&archive), emit).map(Payload::Backup)
        },
        Command::Restore { archive } => {
            sync::restore(repl, Path::new(&archive), emit).map(Payload::Restore)
        },
        Command::Scan | Command::Connect { .. } => Err(Error::Protocol(
            "probe command sent to a connected board".to_string(),
        )),
    }
}

/// Run a program, forwarding console output and keyboard input.
///
/// A program ended by a stop request counts as success.
fn run_program(
    repl: &mut Repl,
    emit: &Emitter,
    input: &Receiver<Vec<u8>>,
    cancel: &CancelToken,
    name: &str,
    code: &str,
) -> Result<Payload> {
    emit.send_status(format!("Running {name}"));

    repl.session(|r| {
        r.exec_raw_no_follow(code.as_bytes())?;
        emit.send(Message::CodeDownloaded);

        let mut sink = |data: &[u8]| emit.send_console(data);
        let mut keys = || input.try_recv().ok();
        let error = r.follow(None, &mut sink, &mut keys)?;

        match check_error(&error) {
            Err(Error::DeviceException(tb))
                if tb.is_keyboard_interrupt() && cancel.is_stop_requested() =>
            {
                info!("{name} stopped");
                Ok(())
            },
            other => other,
        }
    })?;
    Ok(Payload::None)
}

/// Friendly REPL with console I/O forwarded until a stop request.
fn interactive(
    repl: &mut Repl,
    emit: &Emitter,
    input: &Receiver<Vec<u8>>,
    cancel: &CancelToken,
) -> Result<Payload> {
    let greeting = repl.enter_interactive()?;
    emit.send_console(&greeting);
    emit.send(Message::Interactive(true));

    let result = forward(repl, emit, input, cancel);

    repl.leave_interactive();
    emit.send(Message::Interactive(false));
    result.map(|()| Payload::None)
}

fn forward(
    repl: &mut Repl,
    emit: &Emitter,
    input: &Receiver<Vec<u8>>,
    cancel: &CancelToken,
) -> Result<()> {
    let transport = repl.transport_mut();
    while !cancel.is_stop_requested() {
        while let Ok(bytes) = input.try_recv() {
            transport.write(&bytes)?;
        }
        transport.fill()?;
        emit.send_console(&transport.take_all());
    }
    Ok(())
}
