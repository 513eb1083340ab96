//! Chunked file transfer.
//!
//! GET opens the file on the board and prints `r(n)` repeatedly until an
//! empty bytes literal comes back. PUT opens the file for writing and sends
//! each chunk as a bytes literal. The handle is closed in the same session
//! whether or not the transfer succeeded.

use log::{debug, trace};

use super::{args, shape_error};
use crate::error::Result;
use crate::port::Port;
use crate::protocol::RawRepl;
use crate::protocol::literal::encode_bytes;

fn close_after<P: Port, T>(repl: &mut RawRepl<P>, result: Result<T>) -> Result<T> {
    if repl.transport_mut().is_failed() {
        return result;
    }
    let closed = repl.exec_capture("f.close()");
    match result {
        Ok(value) => closed.map(|_| value),
        Err(e) => Err(e),
    }
}

/// Read a file from the board.
///
/// `size` is the expected size from a listing, used only for progress;
/// `progress` receives `(received, size)`.
pub fn get_file<P: Port>(
    repl: &mut RawRepl<P>,
    path: &str,
    size: Option<usize>,
    progress: &mut dyn FnMut(usize, Option<usize>),
) -> Result<Vec<u8>> {
    debug!("GET {path}");
    repl.exec_capture(&format!("{}f=open(_p,'rb')\nr=f.read", args(&[("p", path)])))?;

    let result = read_chunks(repl, size, progress);
    close_after(repl, result)
}

fn read_chunks<P: Port>(
    repl: &mut RawRepl<P>,
    size: Option<usize>,
    progress: &mut dyn FnMut(usize, Option<usize>),
) -> Result<Vec<u8>> {
    let chunk = repl.config().chunk_size;
    let script = format!("print(r({chunk}))");
    let mut data = Vec::with_capacity(size.unwrap_or(0));

    loop {
        let value = repl.eval_literal(&script)?;
        let bytes = value
            .as_bytes()
            .ok_or_else(|| shape_error("file chunk", &value))?;
        if bytes.is_empty() {
            break;
        }
        data.extend_from_slice(bytes);
        trace!("Received {} bytes", data.len());
        progress(data.len(), size);
    }
    Ok(data)
}

/// Write a file to the board, replacing any existing file.
///
/// `progress` receives `(sent, total)`.
pub fn put_file<P: Port>(
    repl: &mut RawRepl<P>,
    path: &str,
    data: &[u8],
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    debug!("PUT {path} ({} bytes)", data.len());
    repl.exec_capture(&format!("{}f=open(_p,'wb')\nw=f.write", args(&[("p", path)])))?;

    let result = write_chunks(repl, data, progress);
    close_after(repl, result)
}

fn write_chunks<P: Port>(
    repl: &mut RawRepl<P>,
    data: &[u8],
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    let chunk = repl.config().chunk_size.max(1);
    let mut sent = 0;
    progress(0, data.len());

    for part in data.chunks(chunk) {
        repl.exec_capture(&format!("w({})", encode_bytes(part)))?;
        sent += part.len();
        trace!("Sent {sent} bytes");
        progress(sent, data.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sim::SimDevice;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_put_then_get_is_byte_exact() {
        let sim = SimDevice::new();
        let mut r = sim.repl();

        for len in [0, 1, 255, 256, 257, 2560] {
            let data = pattern(len);
            let path = format!("/f{len}.bin");
            r.session(|r| put_file(r, &path, &data, &mut |_, _| {}))
                .unwrap();
            assert_eq!(sim.file(&path).unwrap(), data, "stored {len}");

            let back = r
                .session(|r| get_file(r, &path, Some(len), &mut |_, _| {}))
                .unwrap();
            assert_eq!(back, data, "read back {len}");
        }
        assert!(!sim.has_open_file());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let sim = SimDevice::new();
        let mut r = sim.repl();
        let data = pattern(1000);

        let mut sent = Vec::new();
        r.session(|r| put_file(r, "/p.bin", &data, &mut |done, _| sent.push(done)))
            .unwrap();
        assert_eq!(sent, vec![0, 256, 512, 768, 1000]);

        let mut received = Vec::new();
        r.session(|r| get_file(r, "/p.bin", Some(1000), &mut |done, _| received.push(done)))
            .unwrap();
        assert!(received.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(received.last(), Some(&1000));
    }

    #[test]
    fn test_get_missing_file_is_device_exception() {
        let sim = SimDevice::new();
        let mut r = sim.repl();

        let err = r
            .session(|r| get_file(r, "/nope.py", None, &mut |_, _| {}))
            .unwrap_err();
        assert!(matches!(err, Error::DeviceException(_)));
        assert!(err.to_string().contains("ENOENT"));
    }

    #[test]
    fn test_paths_are_escaped() {
        let sim = SimDevice::new();
        let mut r = sim.repl();
        let path = "/it's \"odd\".txt";

        r.session(|r| put_file(r, path, b"x", &mut |_, _| {})).unwrap();
        assert_eq!(sim.file(path).unwrap(), b"x");
    }

    #[test]
    fn test_handle_closed_after_failed_read() {
        let sim = SimDevice::new();
        sim.put("/a.txt", b"abc");
        sim.fail_reads_of("/a.txt");
        let mut r = sim.repl();

        assert!(r.session(|r| get_file(r, "/a.txt", None, &mut |_, _| {})).is_err());
        assert!(!sim.has_open_file());
    }
}
