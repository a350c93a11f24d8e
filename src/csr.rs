//! Control/status register layout of the logic analyzer SoC.
//!
//! The address map moves between gateware revisions, so it is carried around
//! as a value chosen at open time instead of being baked into constants.

use crate::register_bus::{ByteTransport, RegisterBus, RegisterBusError};

/// Registers describing what the gateware was synthesized with.
///
/// Only present on revisions that expose them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRegisters {
    pub native_samplerate: u64,
    pub probe_number: u64,
    pub oversampler_phy_ratio: u64,
    pub frame_counter_width: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub identifier_mem_base: u64,
    pub trigger_enable: u64,
    pub trigger_mem_write: u64,
    pub trigger_mem_mask: u64,
    pub trigger_mem_value: u64,
    pub subsampler_value: u64,
    pub storage_enable: u64,
    pub storage_length: u64,
    pub storage_offset: u64,
    pub hspi_tx_enable: u64,
    pub hspi_tx_max_packet_size: u64,
    pub hspi_tx_max_packet_num: u64,
    pub capabilities: Option<CapabilityRegisters>,
}

impl RegisterMap {
    /// First HSPI-capable revision: analyzer core at 0x2000, no capability block.
    pub const fn v1() -> Self {
        let la = 0x2000;
        Self {
            identifier_mem_base: 0x1800,
            trigger_enable: la + 0x04,
            trigger_mem_write: la + 0x0c,
            trigger_mem_mask: la + 0x10,
            trigger_mem_value: la + 0x14,
            subsampler_value: la + 0x1c,
            storage_enable: la + 0x20,
            storage_length: la + 0x2c,
            storage_offset: la + 0x30,
            hspi_tx_enable: la + 0x48,
            hspi_tx_max_packet_size: la + 0x4c,
            hspi_tx_max_packet_num: la + 0x54,
            capabilities: None,
        }
    }

    /// Revision that appends the capability block after the HSPI counters.
    pub const fn v2() -> Self {
        let la = 0x2000;
        let mut map = Self::v1();
        map.capabilities = Some(CapabilityRegisters {
            native_samplerate: la + 0x6c,
            probe_number: la + 0x70,
            oversampler_phy_ratio: la + 0x74,
            frame_counter_width: la + 0x78,
        });
        map
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::v2()
    }
}

/// Width of the frame counter prefixed to every streamed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterWidth {
    One,
    Two,
    Four,
}

impl CounterWidth {
    pub fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    pub fn from_bytes(width: u64) -> Option<Self> {
        match width {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            _ => None,
        }
    }

    /// Largest counter value before wrapping.
    pub fn max_value(self) -> u64 {
        match self {
            Self::One => u64::from(u8::MAX),
            Self::Two => u64::from(u16::MAX),
            Self::Four => u64::from(u32::MAX),
        }
    }
}

/// Facts about the attached analyzer, read once at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub identifier: String,
    pub native_samplerate: u64,
    pub probe_count: u8,
    pub oversampler_phy_ratio: u8,
    pub frame_counter: Option<CounterWidth>,
}

impl DeviceProfile {
    /// What the first revision is synthesized with.
    pub fn fallback(identifier: String) -> Self {
        Self {
            identifier,
            native_samplerate: 64_000_000,
            probe_count: 16,
            oversampler_phy_ratio: 1,
            frame_counter: None,
        }
    }

    pub fn read<T: ByteTransport>(
        bus: &mut RegisterBus<T>,
        map: &RegisterMap,
    ) -> Result<Self, ProfileError> {
        let identifier = read_identifier(bus, map.identifier_mem_base)?;
        log::debug!("Identifier: {}", identifier);

        let Some(caps) = map.capabilities else {
            log::debug!("No capability registers, assuming first revision defaults");
            return Ok(Self::fallback(identifier));
        };

        let native_samplerate = u64::from(bus.read(caps.native_samplerate)?);
        let probe_count = bus.read(caps.probe_number)?;
        let phy_ratio = bus.read(caps.oversampler_phy_ratio)?;
        let counter_width = bus.read(caps.frame_counter_width)?;

        if native_samplerate == 0 {
            return Err(ProfileError::Invalid("native sample rate is zero".into()));
        }
        if !(1..=64).contains(&probe_count) {
            return Err(ProfileError::Invalid(format!("probe count {}", probe_count)));
        }
        if !matches!(phy_ratio, 1 | 2 | 4) {
            return Err(ProfileError::Invalid(format!("oversampler ratio {}", phy_ratio)));
        }
        let frame_counter = match counter_width {
            0 => None,
            w => Some(CounterWidth::from_bytes(u64::from(w)).ok_or_else(|| {
                ProfileError::Invalid(format!("frame counter width {}", w))
            })?),
        };

        let profile = Self {
            identifier,
            native_samplerate,
            probe_count: probe_count as u8,
            oversampler_phy_ratio: phy_ratio as u8,
            frame_counter,
        };
        log::debug!("Device profile: {:?}", profile);
        Ok(profile)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Register bus error: {0}")]
    Bus(#[from] RegisterBusError),

    #[error("Identifier is not NUL terminated within {0} characters")]
    IdentifierTooLong(usize),

    #[error("Invalid capability value: {0}")]
    Invalid(String),
}

const MAX_IDENTIFIER_LENGTH: usize = 256;

/// Read the NUL-terminated identifier, one character per 32-bit register.
pub fn read_identifier<T: ByteTransport>(
    bus: &mut RegisterBus<T>,
    base: u64,
) -> Result<String, ProfileError> {
    let mut ident = Vec::new();
    for i in 0..MAX_IDENTIFIER_LENGTH as u64 {
        let c = bus.read(base + i * 4)? as u8;
        if c == 0 {
            return Ok(String::from_utf8_lossy(&ident).into_owned());
        }
        ident.push(c);
    }
    Err(ProfileError::IdentifierTooLong(MAX_IDENTIFIER_LENGTH))
}
