//! Simulated MicroPython board for tests.
//!
//! Speaks the raw REPL framing and understands the scripts this crate
//! sends, executed against an in-memory filesystem. Anything else is run by
//! a tiny line interpreter that knows `print(<literal>)` and
//! `raise Name('msg')`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::port::{Port, PortOpener};
use crate::protocol::RawRepl;
use crate::protocol::literal::{self, Value, encode_bytes, encode_str};
use crate::transport::{CancelToken, Transport};

const FRIENDLY_BANNER: &str =
    "\r\nMicroPython v1.22.0 on 2024-01-05; Raspberry Pi Pico with RP2040\r\nType \"help()\" for more information.\r\n>>> ";
const RAW_BANNER: &str = "raw REPL; CTRL-B to exit\r\n>";

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Friendly,
    Raw,
    /// Runs until interrupted.
    Forever,
    /// `print(input())` waiting for a line.
    InputLine(Vec<u8>),
}

struct OpenFile {
    path: String,
}

struct SimState {
    mode: Mode,
    source: Vec<u8>,
    output: VecDeque<u8>,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    broken: BTreeSet<String>,
    fail_reads: BTreeSet<String>,
    open: Option<OpenFile>,
    read_pos: usize,
    responsive: bool,
    alive: bool,
    ignore_enter: u32,
    ignore_interrupts: bool,
    rename_supported: bool,
    enter_requests: u32,
    soft_resets: u32,
    received_input: Vec<u8>,
}

/// Outcome of running a script.
enum Outcome {
    Done(String),
    Raised(String, usize, String),
    Running(Mode),
}

fn os_error(errno: u32, name: &str) -> Outcome {
    Outcome::Raised("OSError".into(), 1, format!("[Errno {errno}] {name}"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn repr(value: &Value) -> String {
    fn seq(items: &[Value]) -> String {
        items.iter().map(repr).collect::<Vec<_>>().join(", ")
    }

    match value {
        Value::None => "None".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => format!("{v:?}"),
        Value::Str(s) => encode_str(s),
        Value::Bytes(b) => encode_bytes(b),
        Value::List(items) => format!("[{}]", seq(items)),
        Value::Tuple(items) if items.len() == 1 => format!("({},)", repr(&items[0])),
        Value::Tuple(items) => format!("({})", seq(items)),
        Value::Dict(pairs) => format!(
            "{{{}}}",
            pairs
                .iter()
                .map(|(k, v)| format!("{}: {}", repr(k), repr(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn str_value(s: &str) -> Value {
    Value::Str(s.to_string())
}

impl SimState {
    fn emit(&mut self, text: &str) {
        self.output.extend(text.as_bytes());
    }

    fn is_dir(&self, path: &str) -> bool {
        path.is_empty() || self.dirs.contains(path)
    }

    fn has_children(&self, dir: &str) -> bool {
        self.files.keys().any(|p| parent_of(p) == dir) || self.dirs.iter().any(|d| parent_of(d) == dir)
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        for path in self.files.keys().chain(self.dirs.iter()) {
            if parent_of(path) == dir {
                names.insert(path.clone());
            }
        }
        names.into_iter().collect()
    }

    fn listing(&self, dir: &str) -> Value {
        let entries = self
            .children(dir)
            .into_iter()
            .map(|path| {
                let detail = if self.broken.contains(&path) {
                    Value::Int(-1)
                } else if self.dirs.contains(&path) {
                    self.listing(&path)
                } else {
                    Value::Int(self.files[&path].len() as i64)
                };
                Value::Tuple(vec![str_value(name_of(&path)), detail])
            })
            .collect();
        Value::List(entries)
    }

    fn readable_files(&self) -> Vec<String> {
        self.files
            .keys()
            .filter(|p| !self.broken.iter().any(|b| p.starts_with(&format!("{b}/"))))
            .cloned()
            .collect()
    }

    fn write_byte(&mut self, b: u8) {
        if !self.responsive {
            if b == 0x01 {
                self.enter_requests += 1;
            }
            return;
        }

        match self.mode.clone() {
            Mode::Friendly => match b {
                0x01 => {
                    self.enter_requests += 1;
                    if self.ignore_enter > 0 {
                        self.ignore_enter -= 1;
                    } else {
                        self.mode = Mode::Raw;
                        self.source.clear();
                        self.emit(RAW_BANNER);
                    }
                },
                0x02 => self.emit(FRIENDLY_BANNER),
                0x03 | b'\r' => self.emit("\r\n>>> "),
                0x04 => {
                    self.soft_resets += 1;
                    self.emit("MPY: soft reboot");
                    self.emit(FRIENDLY_BANNER);
                },
                _ => self.output.push_back(b),
            },
            Mode::Raw => match b {
                0x01 => {
                    self.enter_requests += 1;
                    self.source.clear();
                    self.emit(RAW_BANNER);
                },
                0x02 => {
                    self.mode = Mode::Friendly;
                    self.emit(FRIENDLY_BANNER);
                },
                0x03 => self.source.clear(),
                0x04 => {
                    let source = std::mem::take(&mut self.source);
                    if source.iter().all(u8::is_ascii_whitespace) {
                        self.soft_resets += 1;
                        self.open = None;
                        self.emit("OK\r\nMPY: soft reboot\r\n");
                        self.emit(RAW_BANNER);
                    } else {
                        self.emit("OK");
                        let text = String::from_utf8_lossy(&source).into_owned();
                        let outcome = self.run(&text);
                        self.finish(outcome);
                    }
                },
                _ => self.source.push(b),
            },
            Mode::Forever => {
                if b == 0x03 {
                    if !self.ignore_interrupts {
                        self.finish(Outcome::Raised("KeyboardInterrupt".into(), 2, String::new()));
                    }
                } else {
                    self.received_input.push(b);
                }
            },
            Mode::InputLine(mut line) => {
                if b == 0x03 {
                    self.finish(Outcome::Raised("KeyboardInterrupt".into(), 1, String::new()));
                    return;
                }
                self.received_input.push(b);
                if b == b'\r' || b == b'\n' {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    self.finish(Outcome::Done(format!("{text}\r\n")));
                } else {
                    line.push(b);
                    self.mode = Mode::InputLine(line);
                }
            },
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done(stdout) => {
                self.emit(&stdout);
                self.emit("\x04\x04>");
                self.mode = Mode::Raw;
            },
            Outcome::Raised(name, line, msg) => {
                self.emit("\x04");
                self.emit(&format!(
                    "Traceback (most recent call last):\r\n  File \"<stdin>\", line {line}, in <module>\r\n{name}: {msg}\r\n"
                ));
                self.emit("\x04>");
                self.mode = Mode::Raw;
            },
            Outcome::Running(mode) => self.mode = mode,
        }
    }

    /// Split `_x=<literal>` argument lines from the script body.
    fn split_args(text: &str) -> (BTreeMap<String, Value>, String) {
        let mut args = BTreeMap::new();
        let mut rest = text;
        while let Some((line, tail)) = rest.split_once('\n') {
            let Some((name, lit)) = line.split_once('=') else {
                break;
            };
            if !name.starts_with('_') || name.contains(' ') {
                break;
            }
            let Ok(value) = literal::parse(lit) else {
                break;
            };
            args.insert(name[1..].to_string(), value);
            rest = tail;
        }
        (args, rest.to_string())
    }

    fn run(&mut self, text: &str) -> Outcome {
        let (args, body) = Self::split_args(text);
        let arg = |key: &str| {
            args.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };

        if body.contains("def _l(d):") {
            return Outcome::Done(format!("{}\r\n", repr(&self.listing(""))));
        }
        if body.contains("def _h(d):") {
            return self.hash();
        }
        if body.contains("os.uname()") {
            let uname = Value::Dict(vec![
                (str_value("sysname"), str_value("rp2")),
                (str_value("nodename"), str_value("rp2")),
                (str_value("release"), str_value("1.22.0")),
                (str_value("version"), str_value("v1.22.0 on 2024-01-05")),
                (str_value("machine"), str_value("Raspberry Pi Pico with RP2040")),
            ]);
            return Outcome::Done(format!("{}\r\n", repr(&uname)));
        }
        if body == "f=open(_p,'rb')\nr=f.read" {
            return self.open_read(&arg("p"));
        }
        if body == "f=open(_p,'wb')\nw=f.write" {
            return self.open_write(&arg("p"));
        }
        if let Some(n) = body.strip_prefix("print(r(").and_then(|r| r.strip_suffix("))")) {
            return self.read_chunk(n.parse().unwrap_or(256));
        }
        if let Some(lit) = body.strip_prefix("w(").and_then(|r| r.strip_suffix(')')) {
            return self.write_chunk(lit);
        }
        if body == "f.close()" {
            return match self.open.take() {
                Some(_) => Outcome::Done(String::new()),
                None => Outcome::Raised("NameError".into(), 1, "name 'f' isn't defined".into()),
            };
        }
        if body.contains("os.remove(_p)") {
            return self.remove(&arg("p"));
        }
        if body == "import os\nos.mkdir(_p)" {
            return self.mkdir(&arg("p"));
        }
        if body.contains("os.rename(_a,_b)") {
            return self.rename(&arg("a"), &arg("b"));
        }
        if body.contains("for _x in _d:") {
            for dir in args.get("d").and_then(Value::as_seq).unwrap_or(&[]) {
                if let Some(dir) = dir.as_str() {
                    if self.is_dir(parent_of(dir)) && !self.files.contains_key(dir) {
                        self.dirs.insert(dir.to_string());
                    }
                }
            }
            return Outcome::Done(String::new());
        }
        if body.starts_with("while True:") {
            return Outcome::Running(Mode::Forever);
        }
        if body == "print(input())" {
            return Outcome::Running(Mode::InputLine(Vec::new()));
        }
        Self::interpret(text)
    }

    fn interpret(text: &str) -> Outcome {
        let mut stdout = String::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if let Some(inner) = line.strip_prefix("print(").and_then(|l| l.strip_suffix(')')) {
                match literal::parse(inner) {
                    Ok(Value::Str(s)) => stdout.push_str(&s),
                    Ok(value) => stdout.push_str(&repr(&value)),
                    Err(_) => {
                        return Outcome::Raised("NameError".into(), idx + 1, "name isn't defined".into());
                    },
                }
                stdout.push_str("\r\n");
            } else if let Some(rest) = line.strip_prefix("raise ") {
                let (name, msg) = match rest.split_once('(') {
                    Some((name, arg)) => {
                        let msg = literal::parse(arg.trim_end_matches(')'))
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default();
                        (name.to_string(), msg)
                    },
                    None => (rest.to_string(), String::new()),
                };
                return Outcome::Raised(name, idx + 1, msg);
            }
        }
        Outcome::Done(stdout)
    }

    fn hash(&self) -> Outcome {
        let files = self.readable_files();
        let mut out = format!("{}\r\n", files.len());
        for path in files {
            let digest = Sha1::digest(&self.files[&path]);
            let line = Value::Tuple(vec![
                str_value(&path),
                Value::Bytes(hex::encode(digest).into_bytes()),
            ]);
            out.push_str(&repr(&line));
            out.push_str("\r\n");
        }
        Outcome::Done(out)
    }

    fn open_read(&mut self, path: &str) -> Outcome {
        if !self.files.contains_key(path) {
            return os_error(2, "ENOENT");
        }
        self.open = Some(OpenFile {
            path: path.to_string(),
        });
        self.read_pos = 0;
        Outcome::Done(String::new())
    }

    fn open_write(&mut self, path: &str) -> Outcome {
        if !self.is_dir(parent_of(path)) || self.dirs.contains(path) {
            return os_error(2, "ENOENT");
        }
        self.files.insert(path.to_string(), Vec::new());
        self.open = Some(OpenFile {
            path: path.to_string(),
        });
        Outcome::Done(String::new())
    }

    fn read_chunk(&mut self, n: usize) -> Outcome {
        let Some(open) = &self.open else {
            return Outcome::Raised("NameError".into(), 1, "name 'r' isn't defined".into());
        };
        if self.fail_reads.contains(&open.path) {
            return os_error(5, "EIO");
        }
        let data = &self.files[&open.path];
        let end = (self.read_pos + n).min(data.len());
        let chunk = data[self.read_pos..end].to_vec();
        self.read_pos = end;
        Outcome::Done(format!("{}\r\n", encode_bytes(&chunk)))
    }

    fn write_chunk(&mut self, lit: &str) -> Outcome {
        let Some(open) = &self.open else {
            return Outcome::Raised("NameError".into(), 1, "name 'w' isn't defined".into());
        };
        let path = open.path.clone();
        match literal::parse(lit) {
            Ok(Value::Bytes(bytes)) => {
                self.files.entry(path).or_default().extend_from_slice(&bytes);
                Outcome::Done(String::new())
            },
            _ => Outcome::Raised("SyntaxError".into(), 1, "invalid syntax".into()),
        }
    }

    fn remove(&mut self, path: &str) -> Outcome {
        if self.files.remove(path).is_some() {
            return Outcome::Done(String::new());
        }
        if self.dirs.contains(path) {
            if self.has_children(path) {
                return os_error(39, "ENOTEMPTY");
            }
            self.dirs.remove(path);
            self.broken.remove(path);
            return Outcome::Done(String::new());
        }
        os_error(2, "ENOENT")
    }

    fn mkdir(&mut self, path: &str) -> Outcome {
        if self.files.contains_key(path) || self.dirs.contains(path) {
            return os_error(17, "EEXIST");
        }
        if !self.is_dir(parent_of(path)) {
            return os_error(2, "ENOENT");
        }
        self.dirs.insert(path.to_string());
        Outcome::Done(String::new())
    }

    fn rename(&mut self, old: &str, new: &str) -> Outcome {
        if !self.is_dir(parent_of(new)) {
            return os_error(2, "ENOENT");
        }
        if let Some(data) = self.files.remove(old) {
            self.files.insert(new.to_string(), data);
            return Outcome::Done(String::new());
        }
        if self.rename_supported && self.dirs.contains(old) {
            let prefix = format!("{old}/");
            let moved: Vec<String> = self.files.keys().filter(|p| p.starts_with(&prefix)).cloned().collect();
            for path in moved {
                if let Some(data) = self.files.remove(&path) {
                    self.files.insert(format!("{new}/{}", &path[prefix.len()..]), data);
                }
            }
            let dirs: Vec<String> = self.dirs.iter().filter(|d| *d == old || d.starts_with(&prefix)).cloned().collect();
            for dir in dirs {
                self.dirs.remove(&dir);
                self.dirs.insert(format!("{new}{}", &dir[old.len()..]));
            }
            return Outcome::Done(String::new());
        }
        os_error(2, "ENOENT")
    }
}

/// Handle to a simulated board. Clones share the same board.
#[derive(Clone)]
pub(crate) struct SimDevice {
    state: Arc<Mutex<SimState>>,
    name: String,
}

impl SimDevice {
    pub(crate) fn new() -> Self {
        Self::named("sim0")
    }

    pub(crate) fn named(name: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                mode: Mode::Friendly,
                source: Vec::new(),
                output: VecDeque::new(),
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                broken: BTreeSet::new(),
                fail_reads: BTreeSet::new(),
                open: None,
                read_pos: 0,
                responsive: true,
                alive: true,
                ignore_enter: 0,
                ignore_interrupts: false,
                rename_supported: true,
                enter_requests: 0,
                soft_resets: 0,
                received_input: Vec::new(),
            })),
            name: name.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Raw REPL controller over this board with default settings.
    pub(crate) fn repl(&self) -> RawRepl<SimDevice> {
        RawRepl::new(
            Transport::new(self.clone(), CancelToken::new()),
            LinkConfig::default(),
        )
    }

    pub(crate) fn put(&self, path: &str, data: &[u8]) {
        self.mkdir(parent_of(path));
        self.lock().files.insert(path.to_string(), data.to_vec());
    }

    pub(crate) fn mkdir(&self, path: &str) {
        let mut state = self.lock();
        for dir in crate::files::ancestors(path) {
            state.dirs.insert(dir);
        }
    }

    pub(crate) fn mark_broken(&self, path: &str) {
        self.mkdir(path);
        self.lock().broken.insert(path.to_string());
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub(crate) fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub(crate) fn is_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    pub(crate) fn in_raw_mode(&self) -> bool {
        self.lock().mode != Mode::Friendly
    }

    pub(crate) fn has_open_file(&self) -> bool {
        self.lock().open.is_some()
    }

    pub(crate) fn set_responsive(&self, responsive: bool) {
        self.lock().responsive = responsive;
    }

    pub(crate) fn ignore_enter_attempts(&self, n: u32) {
        self.lock().ignore_enter = n;
    }

    pub(crate) fn ignore_interrupts(&self, ignore: bool) {
        self.lock().ignore_interrupts = ignore;
    }

    pub(crate) fn set_rename_supported(&self, supported: bool) {
        self.lock().rename_supported = supported;
    }

    pub(crate) fn fail_reads_of(&self, path: &str) {
        self.lock().fail_reads.insert(path.to_string());
    }

    /// The device disappears: every further port call fails.
    pub(crate) fn unplug(&self) {
        self.lock().alive = false;
    }

    pub(crate) fn enter_requests(&self) -> u32 {
        self.lock().enter_requests
    }

    pub(crate) fn soft_resets(&self) -> u32 {
        self.lock().soft_resets
    }

    pub(crate) fn received_input(&self) -> Vec<u8> {
        self.lock().received_input.clone()
    }
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

impl Read for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.lock();
            if !state.alive {
                return Err(gone());
            }
            if !state.output.is_empty() {
                let n = buf.len().min(state.output.len());
                for (slot, b) in buf.iter_mut().zip(state.output.drain(..n)) {
                    *slot = b;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(Duration::from_millis(1));
        Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
    }
}

impl Write for SimDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if !state.alive {
            return Err(gone());
        }
        for &b in buf {
            state.write_byte(b);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimDevice {
    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        let state = self.lock();
        if !state.alive {
            return Err(Error::Io(gone()));
        }
        Ok(u32::try_from(state.output.len()).unwrap_or(u32::MAX))
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.lock().output.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opener over a fixed set of simulated boards.
#[derive(Clone, Default)]
pub(crate) struct SimOpener {
    devices: Vec<SimDevice>,
    dead: Vec<String>,
}

impl SimOpener {
    pub(crate) fn new(devices: &[SimDevice]) -> Self {
        Self {
            devices: devices.to_vec(),
            dead: Vec::new(),
        }
    }

    /// A port name that is listed but fails to open.
    pub(crate) fn with_dead_port(mut self, name: &str) -> Self {
        self.dead.push(name.to_string());
        self
    }
}

impl PortOpener for SimOpener {
    fn candidates(&self) -> Vec<String> {
        self.dead
            .iter()
            .cloned()
            .chain(self.devices.iter().map(|d| d.name.clone()))
            .collect()
    }

    fn open(&self, name: &str) -> Result<Box<dyn Port>> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .map(|d| Box::new(d.clone()) as Box<dyn Port>)
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::NotFound, "no such port")))
    }
}

/// A port that never goes quiet and never answers: a logger or GPS module
/// sitting on a scanned port.
pub(crate) struct ChattyPort;

impl Read for ChattyPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        std::thread::sleep(Duration::from_micros(200));
        let line = b"$GPGGA,123519,4807.038,N\r\n";
        let n = line.len().min(buf.len());
        buf[..n].copy_from_slice(&line[..n]);
        Ok(n)
    }
}

impl Write for ChattyPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for ChattyPort {
    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(16)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "chatty"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_args() {
        let (args, body) = SimState::split_args("_p='/a b'\n_q=('x',)\nimport os\nos.mkdir(_p)");
        assert_eq!(args["p"], Value::Str("/a b".into()));
        assert_eq!(body, "import os\nos.mkdir(_p)");
    }

    #[test]
    fn test_listing_repr_parses_back() {
        let sim = SimDevice::new();
        sim.put("/lib/a.py", b"abc");
        let listing = sim.lock().listing("");
        assert_eq!(literal::parse(&repr(&listing)).unwrap(), listing);
    }
}
