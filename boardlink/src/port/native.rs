//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        device::detect_ports,
        error::{Error, Result},
        port::{Port, PortOpener, SerialConfig},
    },
    log::trace,
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open a serial port with the given configuration (8N1, no flow control).
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        trace!("Opened {} at {} baud", config.port_name, config.baud_rate);

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    fn closed_error() -> Error {
        Error::Serial(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "Port is closed",
        ))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        match self.port {
            Some(ref p) => p.bytes_to_read().map_err(Error::Serial),
            None => Err(Self::closed_error()),
        }
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.port.take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

/// Opens native serial ports for the board worker.
#[derive(Debug, Clone)]
pub struct NativeOpener {
    baud_rate: u32,
    include_unknown: bool,
}

impl NativeOpener {
    /// Create an opener for the given baud rate.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            include_unknown: true,
        }
    }

    /// Only probe ports whose USB IDs look like a MicroPython board or a
    /// USB-UART bridge.
    #[must_use]
    pub fn known_only(mut self, known_only: bool) -> Self {
        self.include_unknown = !known_only;
        self
    }
}

impl PortOpener for NativeOpener {
    fn candidates(&self) -> Vec<String> {
        let mut ports = detect_ports();
        if !self.include_unknown {
            ports.retain(|p| p.device.is_known());
        }
        // Native MicroPython USB first, bridges next, everything else last.
        ports.sort_by_key(|p| p.device.probe_rank());
        ports.into_iter().map(|p| p.name).collect()
    }

    fn open(&self, name: &str) -> Result<Box<dyn Port>> {
        let config = SerialConfig::new(name, self.baud_rate);
        Ok(Box::new(NativePort::open(&config)?))
    }
}
