//! Register access over a byte stream.
//!
//! Every access is a single fixed-address burst of one 32-bit word:
//!
//! | Offset      | Field                                  |
//! |-------------|----------------------------------------|
//! | 0           | opcode                                 |
//! | 1           | burst length (always 1)                |
//! | 2..2+W      | word address (byte address >> 2), BE   |
//! | write only  | 4-byte big-endian value                |
//!
//! A read is answered with a 4-byte big-endian value. The codec never retries;
//! callers decide how often an access may be repeated.

use std::io;

/// Largest command: opcode + burst length + 8 address bytes + 4 value bytes.
const MAX_CMD_LENGTH: usize = 14;

/// Burst length used for single-register access.
const SINGLE_WORD_BURST: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    WriteBurstIncr = 1,
    ReadBurstIncr = 2,
    WriteBurstFixed = 3,
    ReadBurstFixed = 4,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::WriteBurstIncr),
            2 => Some(Self::ReadBurstIncr),
            3 => Some(Self::WriteBurstFixed),
            4 => Some(Self::ReadBurstFixed),
            _ => None,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::WriteBurstIncr | Self::WriteBurstFixed)
    }
}

/// Width of the address field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressWidth {
    One,
    Two,
    #[default]
    Four,
    Eight,
}

impl AddressWidth {
    pub fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    pub fn from_bytes(width: usize) -> Option<Self> {
        match width {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            8 => Some(Self::Eight),
            _ => None,
        }
    }

    /// Big-endian encoding of `word` truncated to this width.
    pub fn encode(self, word: u64, out: &mut [u8]) {
        match self {
            Self::One => out[0] = word as u8,
            Self::Two => out[..2].copy_from_slice(&(word as u16).to_be_bytes()),
            Self::Four => out[..4].copy_from_slice(&(word as u32).to_be_bytes()),
            Self::Eight => out[..8].copy_from_slice(&word.to_be_bytes()),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> u64 {
        bytes[..self.bytes()]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterBusError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout accessing register 0x{address:x}")]
    Timeout { address: u64 },

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),
}

impl RegisterBusError {
    fn from_io(address: u64, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout { address },
            _ => Self::Io(err),
        }
    }
}

/// Byte stream the register commands travel over.
pub trait ByteTransport {
    fn transport_write(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn transport_read(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

impl<T: ByteTransport + ?Sized> ByteTransport for Box<T> {
    fn transport_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).transport_write(bytes)
    }

    fn transport_read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        (**self).transport_read(buf)
    }
}

/// Encodes register commands for a [`ByteTransport`].
#[derive(Debug)]
pub struct RegisterBus<T> {
    transport: T,
    width: AddressWidth,
}

impl<T: ByteTransport> RegisterBus<T> {
    pub fn new(transport: T, width: AddressWidth) -> Self {
        Self { transport, width }
    }

    pub fn address_width(&self) -> AddressWidth {
        self.width
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn encode_header(&self, opcode: Opcode, address: u64, buffer: &mut [u8; MAX_CMD_LENGTH]) -> usize {
        buffer[0] = opcode as u8;
        buffer[1] = SINGLE_WORD_BURST;
        // registers are 32-bit aligned, the bus addresses words
        self.width.encode(address >> 2, &mut buffer[2..]);
        2 + self.width.bytes()
    }

    pub fn write(&mut self, address: u64, value: u32) -> Result<(), RegisterBusError> {
        let mut buffer = [0u8; MAX_CMD_LENGTH];
        let header = self.encode_header(Opcode::WriteBurstFixed, address, &mut buffer);
        buffer[header..header + 4].copy_from_slice(&value.to_be_bytes());

        log::trace!("csr write 0x{:x} <- 0x{:08x}", address, value);
        self.transport
            .transport_write(&buffer[..header + 4])
            .map_err(|e| RegisterBusError::from_io(address, e))
    }

    pub fn read(&mut self, address: u64) -> Result<u32, RegisterBusError> {
        let mut buffer = [0u8; MAX_CMD_LENGTH];
        let header = self.encode_header(Opcode::ReadBurstFixed, address, &mut buffer);
        self.transport
            .transport_write(&buffer[..header])
            .map_err(|e| RegisterBusError::from_io(address, e))?;

        let mut reply = [0u8; 4];
        self.transport
            .transport_read(&mut reply)
            .map_err(|e| RegisterBusError::from_io(address, e))?;

        let value = u32::from_be_bytes(reply);
        log::trace!("csr read 0x{:x} -> 0x{:08x}", address, value);
        Ok(value)
    }
}
