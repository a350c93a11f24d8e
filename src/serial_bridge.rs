use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

use crate::register_bus::{ByteTransport, RegisterBusError};

/// Default baud rate of the UART-to-bus bridge.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Per-access timeout. A register access that does not complete within it fails.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Register bus bridge reached over a serial port.
pub struct SerialBridge {
    serial: Box<dyn SerialPort>,
}

impl std::fmt::Debug for SerialBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBridge")
            .field("port", &self.serial.name())
            .finish()
    }
}

impl SerialBridge {
    /// Open the bridge on `port` with the default baud rate and timeout.
    pub fn new(port: &str) -> Result<Self, RegisterBusError> {
        Self::with_settings(port, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT)
    }

    pub fn with_settings(
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self, RegisterBusError> {
        log::debug!("Opening register bridge on {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate).timeout(timeout).open()?;

        let mut bridge = Self { serial };
        bridge.flush()?;
        Ok(bridge)
    }

    /// Wrap an already opened port.
    pub fn from_port(serial: Box<dyn SerialPort>) -> Self {
        Self { serial }
    }

    /// Drop anything left over from a previous session.
    pub fn flush(&mut self) -> Result<(), RegisterBusError> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    /// List serial ports that look like a USB bridge.
    pub fn available_ports() -> Result<Vec<String>, RegisterBusError> {
        Ok(serialport::available_ports()?
            .into_iter()
            .filter(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
            .map(|p| p.port_name)
            .collect())
    }
}

impl ByteTransport for SerialBridge {
    fn transport_write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.serial.write_all(bytes)?;
        self.serial.flush()
    }

    fn transport_read(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.serial.read_exact(buf)
    }
}
