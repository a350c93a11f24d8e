//! Software stand-in for the analyzer.
//!
//! [`SimulatedDevice`] keeps a register file that understands the register bus
//! wire format, and a [`SimulatedStream`] that fills submitted transfers with
//! packets while the HSPI transmitter is enabled. Faults can be queued to
//! exercise the error paths of the acquisition engine.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::MAX_PACKET_SIZE;
use crate::csr::{CounterWidth, RegisterMap};
use crate::register_bus::{AddressWidth, ByteTransport, Opcode};
use crate::transfer_pool::{Completion, SlotId, StreamTransport, TransferError, TransferStatus};

#[derive(Debug, Default)]
struct RegisterFile {
    values: HashMap<u64, u32>,
    writes: Vec<(u64, u32)>,
    hspi_tx_enable: u64,
    stuck_streaming: bool,
    failing_disable_writes: u32,
    failing_writes: HashMap<u64, u32>,
}

fn bus_timeout() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "simulated bus timeout")
}

impl RegisterFile {
    fn read(&self, address: u64) -> u32 {
        self.values.get(&address).copied().unwrap_or(0)
    }

    fn write(&mut self, address: u64, value: u32) -> io::Result<()> {
        if let Some(remaining) = self.failing_writes.get_mut(&address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(bus_timeout());
            }
        }
        if address == self.hspi_tx_enable && value == 0 {
            if self.failing_disable_writes > 0 {
                self.failing_disable_writes -= 1;
                return Err(bus_timeout());
            }
            if self.stuck_streaming {
                self.writes.push((address, value));
                return Ok(());
            }
        }
        self.writes.push((address, value));
        self.values.insert(address, value);
        Ok(())
    }

    fn streaming(&self) -> bool {
        self.read(self.hspi_tx_enable) != 0
    }
}

/// Builder for [`SimulatedDevice`].
#[derive(Debug, Clone)]
pub struct SimulatedDeviceBuilder {
    identifier: String,
    native_samplerate: u32,
    probe_count: u32,
    oversampler_phy_ratio: u32,
    frame_counter: Option<CounterWidth>,
    map: RegisterMap,
    address_width: AddressWidth,
    stuck_streaming: bool,
    failing_disable_writes: u32,
    failing_writes: HashMap<u64, u32>,
}

impl SimulatedDeviceBuilder {
    pub fn identifier(mut self, identifier: &str) -> Self {
        self.identifier = identifier.to_string();
        self
    }

    pub fn native_samplerate(mut self, rate: u32) -> Self {
        self.native_samplerate = rate;
        self
    }

    pub fn probe_count(mut self, probes: u32) -> Self {
        self.probe_count = probes;
        self
    }

    pub fn oversampler_phy_ratio(mut self, ratio: u32) -> Self {
        self.oversampler_phy_ratio = ratio;
        self
    }

    pub fn frame_counter(mut self, width: Option<CounterWidth>) -> Self {
        self.frame_counter = width;
        self
    }

    pub fn register_map(mut self, map: RegisterMap) -> Self {
        self.map = map;
        self
    }

    pub fn address_width(mut self, width: AddressWidth) -> Self {
        self.address_width = width;
        self
    }

    /// Acknowledge writes that disable streaming without applying them.
    pub fn stuck_streaming(mut self, stuck: bool) -> Self {
        self.stuck_streaming = stuck;
        self
    }

    /// Time out the first `count` writes that disable streaming.
    pub fn failing_disable_writes(mut self, count: u32) -> Self {
        self.failing_disable_writes = count;
        self
    }

    /// Time out the first `count` writes to `address`, whatever the value.
    pub fn failing_writes(mut self, address: u64, count: u32) -> Self {
        self.failing_writes.insert(address, count);
        self
    }

    pub fn build(self) -> SimulatedDevice {
        let mut registers = RegisterFile {
            hspi_tx_enable: self.map.hspi_tx_enable,
            stuck_streaming: self.stuck_streaming,
            failing_disable_writes: self.failing_disable_writes,
            failing_writes: self.failing_writes,
            ..Default::default()
        };

        let chars = self.identifier.bytes().chain(std::iter::once(0));
        for (i, c) in chars.enumerate() {
            registers
                .values
                .insert(self.map.identifier_mem_base + i as u64 * 4, u32::from(c));
        }
        if let Some(caps) = self.map.capabilities {
            let width = self.frame_counter.map_or(0, |w| w.bytes() as u32);
            registers.values.insert(caps.native_samplerate, self.native_samplerate);
            registers.values.insert(caps.probe_number, self.probe_count);
            registers.values.insert(caps.oversampler_phy_ratio, self.oversampler_phy_ratio);
            registers.values.insert(caps.frame_counter_width, width);
        }

        let registers = Arc::new(Mutex::new(registers));
        let stream = Arc::new(SimulatedStream {
            registers: Arc::clone(&registers),
            counter: self.frame_counter,
            state: Mutex::new(StreamState::default()),
            ready: Condvar::new(),
        });
        SimulatedDevice {
            registers,
            map: self.map,
            address_width: self.address_width,
            stream,
        }
    }
}

impl Default for SimulatedDeviceBuilder {
    fn default() -> Self {
        Self {
            identifier: "SucreLA simulator".to_string(),
            native_samplerate: 64_000_000,
            probe_count: 16,
            oversampler_phy_ratio: 1,
            frame_counter: None,
            map: RegisterMap::default(),
            address_width: AddressWidth::default(),
            stuck_streaming: false,
            failing_disable_writes: 0,
            failing_writes: HashMap::new(),
        }
    }
}

/// A simulated analyzer: register file plus streaming endpoint.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    registers: Arc<Mutex<RegisterFile>>,
    map: RegisterMap,
    address_width: AddressWidth,
    stream: Arc<SimulatedStream>,
}

impl SimulatedDevice {
    pub fn builder() -> SimulatedDeviceBuilder {
        SimulatedDeviceBuilder::default()
    }

    pub fn register_map(&self) -> RegisterMap {
        self.map
    }

    /// A byte transport speaking the register bus protocol to this device.
    pub fn register_port(&self) -> SimulatedRegisterPort {
        SimulatedRegisterPort {
            registers: Arc::clone(&self.registers),
            width: self.address_width,
            replies: VecDeque::new(),
        }
    }

    pub fn stream(&self) -> Arc<SimulatedStream> {
        Arc::clone(&self.stream)
    }

    pub fn register(&self, address: u64) -> u32 {
        self.registers.lock().read(address)
    }

    /// Every register write accepted so far, in order.
    pub fn register_writes(&self) -> Vec<(u64, u32)> {
        self.registers.lock().writes.clone()
    }

    pub fn streaming_enabled(&self) -> bool {
        self.registers.lock().streaming()
    }
}

/// Register side of [`SimulatedDevice`].
#[derive(Debug)]
pub struct SimulatedRegisterPort {
    registers: Arc<Mutex<RegisterFile>>,
    width: AddressWidth,
    replies: VecDeque<u8>,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

impl ByteTransport for SimulatedRegisterPort {
    fn transport_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let header = 2 + self.width.bytes();
        if bytes.len() < header {
            return Err(invalid("short register command"));
        }
        let opcode = Opcode::from_byte(bytes[0]).ok_or_else(|| invalid("unknown opcode"))?;
        if bytes[1] != 1 {
            return Err(invalid("only single word bursts are supported"));
        }
        let address = self.width.decode(&bytes[2..]) << 2;

        let mut registers = self.registers.lock();
        if opcode.is_write() {
            let value: [u8; 4] = bytes
                .get(header..header + 4)
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| invalid("write command without value"))?;
            registers.write(address, u32::from_be_bytes(value))
        } else {
            self.replies.extend(registers.read(address).to_be_bytes());
            Ok(())
        }
    }

    fn transport_read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.replies.len() < buf.len() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply pending"));
        }
        for b in buf.iter_mut() {
            *b = self.replies.pop_front().unwrap_or_default();
        }
        Ok(())
    }
}

/// Fault applied to the next transfer the simulated endpoint completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// Complete with `NoDevice` and refuse any further submission.
    DeviceGone,
    Stall,
    /// Complete with an empty timed-out read.
    Timeout,
    /// Lose the packet that follows the next one generated.
    DropPacket,
}

#[derive(Debug, Default)]
struct StreamState {
    pending: VecDeque<(SlotId, Vec<u8>)>,
    cancelled: Vec<(SlotId, Vec<u8>)>,
    faults: VecDeque<StreamFault>,
    next_counter: u64,
    next_byte: u8,
    gone: bool,
    held: bool,
    refuse_after: Option<usize>,
    completions: usize,
}

/// Streaming side of [`SimulatedDevice`].
#[derive(Debug)]
pub struct SimulatedStream {
    registers: Arc<Mutex<RegisterFile>>,
    counter: Option<CounterWidth>,
    state: Mutex<StreamState>,
    ready: Condvar,
}

impl SimulatedStream {
    pub fn inject(&self, fault: StreamFault) {
        self.state.lock().faults.push_back(fault);
        self.ready.notify_all();
    }

    /// While held, submitted transfers only come back when cancelled.
    pub fn hold(&self, held: bool) {
        self.state.lock().held = held;
        self.ready.notify_all();
    }

    /// Refuse the submission that follows `accepted` successful ones.
    pub fn refuse_submission(&self, accepted: usize) {
        self.state.lock().refuse_after = Some(accepted);
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Completions delivered so far, of any status.
    pub fn completions(&self) -> usize {
        self.state.lock().completions
    }

    fn fill(&self, state: &mut StreamState, buffer: &mut [u8]) {
        for packet in buffer.chunks_mut(MAX_PACKET_SIZE) {
            let payload = match self.counter {
                Some(width) => {
                    let value = state.next_counter;
                    state.next_counter = (value + 1) & width.max_value();
                    let (prefix, payload) = packet.split_at_mut(width.bytes().min(packet.len()));
                    prefix.copy_from_slice(&value.to_le_bytes()[..prefix.len()]);
                    payload
                }
                None => packet,
            };
            for b in payload.iter_mut() {
                *b = state.next_byte;
                state.next_byte = state.next_byte.wrapping_add(1);
            }

            if state.faults.front() == Some(&StreamFault::DropPacket) {
                state.faults.pop_front();
                // the following packet never reaches the host
                if let Some(width) = self.counter {
                    state.next_counter = (state.next_counter + 1) & width.max_value();
                }
                state.next_byte = state.next_byte.wrapping_add(payload.len() as u8);
            }
        }
    }

    fn has_work(&self, state: &StreamState) -> bool {
        if !state.cancelled.is_empty() {
            return true;
        }
        if state.pending.is_empty() || state.gone || state.held {
            return false;
        }
        matches!(
            state.faults.front(),
            Some(StreamFault::DeviceGone | StreamFault::Stall | StreamFault::Timeout)
        ) || self.registers.lock().streaming()
    }
}

impl StreamTransport for SimulatedStream {
    fn submit(&self, slot: SlotId, buffer: Vec<u8>) -> Result<(), (Vec<u8>, TransferError)> {
        let mut state = self.state.lock();
        if state.gone {
            return Err((buffer, TransferError::NoDevice));
        }
        if state.pending.iter().any(|(s, _)| *s == slot) {
            return Err((buffer, TransferError::Busy(slot)));
        }
        match state.refuse_after {
            Some(0) => {
                state.refuse_after = None;
                return Err((buffer, TransferError::Backend("simulated submission failure".to_string())));
            }
            Some(n) => state.refuse_after = Some(n - 1),
            None => {}
        }
        state.pending.push_back((slot, buffer));
        self.ready.notify_all();
        Ok(())
    }

    fn cancel(&self, slot: SlotId) {
        let mut state = self.state.lock();
        if let Some(pos) = state.pending.iter().position(|(s, _)| *s == slot) {
            if let Some(transfer) = state.pending.remove(pos) {
                state.cancelled.push(transfer);
                self.ready.notify_all();
            }
        }
    }

    fn handle_events(&self, timeout: Duration) -> Vec<Completion> {
        let mut state = self.state.lock();
        if !self.has_work(&state) {
            self.ready.wait_for(&mut state, timeout);
        }

        let mut completions: Vec<Completion> = state
            .cancelled
            .drain(..)
            .map(|(slot, buffer)| Completion {
                slot,
                status: TransferStatus::Cancelled,
                buffer,
                actual_length: 0,
            })
            .collect();

        while self.has_work(&state) {
            let Some((slot, mut buffer)) = state.pending.pop_front() else {
                break;
            };
            let fault = match state.faults.front() {
                Some(StreamFault::DropPacket) | None => None,
                Some(_) => state.faults.pop_front(),
            };
            let (status, actual_length) = match fault {
                Some(StreamFault::DeviceGone) => {
                    state.gone = true;
                    (TransferStatus::NoDevice, 0)
                }
                Some(StreamFault::Stall) => (TransferStatus::Stall, 0),
                Some(StreamFault::Timeout) => (TransferStatus::TimedOut, 0),
                _ => {
                    self.fill(&mut state, &mut buffer);
                    (TransferStatus::Completed, buffer.len())
                }
            };
            completions.push(Completion {
                slot,
                status,
                buffer,
                actual_length,
            });
        }

        state.completions += completions.len();
        completions
    }
}
