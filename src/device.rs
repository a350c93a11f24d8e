use std::sync::Arc;

use crate::acquisition::{Acquisition, AcquisitionError};
use crate::config::{self, AcquisitionConfig, AcquisitionPlan, MAX_PACKET_SIZE};
use crate::csr::{DeviceProfile, ProfileError, RegisterMap};
use crate::register_bus::{AddressWidth, ByteTransport, RegisterBus, RegisterBusError};
use crate::serial_bridge::SerialBridge;
use crate::sink::SampleSink;
use crate::transfer_pool::StreamTransport;

/// Depth of the on-chip sample storage.
const STORAGE_DEPTH: u32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Register bus error: {0}")]
    Register(#[from] RegisterBusError),

    #[error("Failed to read device profile: {0}")]
    Profile(#[from] ProfileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No analyzer found")]
    NotFound,

    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// An opened analyzer whose registers are reachable through `T`.
///
/// The device is idle while held directly; starting an acquisition moves it
/// into the [`Acquisition`], which hands it back once the session is over.
#[derive(Debug)]
pub struct Sucrela<T> {
    bus: RegisterBus<T>,
    map: RegisterMap,
    profile: DeviceProfile,
}

impl Sucrela<SerialBridge> {
    /// Open the UART bridge on `port` and read the device profile.
    pub fn connect_serial(port: &str, map: RegisterMap) -> Result<Self, DeviceError> {
        let bridge = SerialBridge::new(port)?;
        Self::open(bridge, map, AddressWidth::default())
    }
}

impl<T: ByteTransport> Sucrela<T> {
    pub fn open(transport: T, map: RegisterMap, width: AddressWidth) -> Result<Self, DeviceError> {
        let mut bus = RegisterBus::new(transport, width);
        let profile = DeviceProfile::read(&mut bus, &map)?;
        log::info!(
            "Opened {} ({} Hz native, {} probes)",
            profile.identifier,
            profile.native_samplerate,
            profile.probe_count
        );
        Ok(Self { bus, map, profile })
    }

    pub fn identifier(&self) -> &str {
        &self.profile.identifier
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn supported_samplerates(&self) -> Vec<u64> {
        config::supported_samplerates(&self.profile)
    }

    pub fn read_register(&mut self, address: u64) -> Result<u32, RegisterBusError> {
        self.bus.read(address)
    }

    pub fn write_register(&mut self, address: u64, value: u32) -> Result<(), RegisterBusError> {
        self.bus.write(address, value)
    }

    pub fn into_transport(self) -> T {
        self.bus.into_inner()
    }

    /// Program the capture logic and enable the HSPI transmitter.
    ///
    /// The hardware trigger is left matching everything; triggering happens on
    /// the host.
    pub(crate) fn program_acquisition(&mut self, plan: &AcquisitionPlan) -> Result<(), RegisterBusError> {
        let map = self.map;
        let writes = [
            (map.trigger_mem_mask, 0),
            (map.trigger_mem_value, 0),
            (map.trigger_mem_write, 1),
            (map.storage_offset, 0),
            (map.storage_length, STORAGE_DEPTH - 1),
            (map.subsampler_value, plan.rate.subsampler),
            (map.hspi_tx_max_packet_size, MAX_PACKET_SIZE as u32),
            (map.hspi_tx_max_packet_num, 0),
            (map.hspi_tx_enable, 1),
            (map.storage_enable, 1),
            (map.trigger_enable, 1),
        ];
        log::debug!(
            "Programming capture: subsampler {}, oversampling x{}",
            plan.rate.subsampler,
            plan.rate.oversampling_ratio
        );
        for (address, value) in writes {
            self.bus.write(address, value)?;
        }
        Ok(())
    }

    /// Clear the HSPI enable, trying up to `attempts` times, then read it back.
    pub(crate) fn disable_streaming(&mut self, attempts: u32) -> Result<(), AcquisitionError> {
        let address = self.map.hspi_tx_enable;
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.bus.write(address, 0) {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    log::warn!("Disabling streaming failed (attempt {}/{}): {}", attempt, attempts, e);
                }
                Err(e) => {
                    log::error!("Giving up on disabling streaming after {} attempts: {}", attempts, e);
                }
            }
        }

        match self.bus.read(address)? {
            0 => Ok(()),
            value => Err(AcquisitionError::StreamingStillEnabled { value }),
        }
    }

    /// Validate `config`, program the device and start streaming into `sink`.
    ///
    /// Nothing is written to the device when the configuration is rejected.
    /// On failure the device is handed back with the error.
    pub fn start_acquisition<S>(
        self,
        config: &AcquisitionConfig,
        stream: Arc<dyn StreamTransport>,
        sink: S,
    ) -> Result<Acquisition<T, S>, (Self, AcquisitionError)>
    where
        T: Send + 'static,
        S: SampleSink + Send + 'static,
    {
        Acquisition::start(self, config, stream, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::CounterWidth;
    use crate::simulator::SimulatedDevice;

    fn open(device: &SimulatedDevice) -> Sucrela<crate::simulator::SimulatedRegisterPort> {
        Sucrela::open(device.register_port(), device.register_map(), AddressWidth::Four).unwrap()
    }

    #[test]
    fn test_open_reads_profile() {
        let device = SimulatedDevice::builder()
            .identifier("LiteX SoC on SucreLA")
            .frame_counter(Some(CounterWidth::Four))
            .build();
        let sucrela = open(&device);
        assert_eq!(sucrela.identifier(), "LiteX SoC on SucreLA");
        assert_eq!(sucrela.profile().frame_counter, Some(CounterWidth::Four));
        assert!(device.register_writes().is_empty());
    }

    #[test]
    fn test_supported_samplerates_depend_on_phy() {
        let device = SimulatedDevice::builder().oversampler_phy_ratio(2).build();
        let rates = open(&device).supported_samplerates();
        assert_eq!(rates.first(), Some(&128_000_000));
    }

    #[test]
    fn test_program_acquisition_order() {
        let device = SimulatedDevice::builder().build();
        let mut sucrela = open(&device);
        let plan = AcquisitionConfig::new(16_000_000)
            .plan(sucrela.profile())
            .unwrap();
        sucrela.program_acquisition(&plan).unwrap();

        let map = device.register_map();
        let writes = device.register_writes();
        assert_eq!(writes.len(), 11);
        assert_eq!(writes[5], (map.subsampler_value, 3));
        assert_eq!(writes[6], (map.hspi_tx_max_packet_size, 4096));
        assert_eq!(writes[8], (map.hspi_tx_enable, 1));
        assert_eq!(writes[10], (map.trigger_enable, 1));
        assert!(device.streaming_enabled());
    }

    #[test]
    fn test_disable_streaming_retries() {
        let device = SimulatedDevice::builder().failing_disable_writes(2).build();
        let mut sucrela = open(&device);
        sucrela.write_register(device.register_map().hspi_tx_enable, 1).unwrap();

        sucrela.disable_streaming(3).unwrap();
        assert!(!device.streaming_enabled());
    }

    #[test]
    fn test_disable_streaming_reports_stuck_enable() {
        let device = SimulatedDevice::builder().stuck_streaming(true).build();
        let mut sucrela = open(&device);
        sucrela.write_register(device.register_map().hspi_tx_enable, 1).unwrap();

        let err = sucrela.disable_streaming(3).unwrap_err();
        assert!(matches!(err, AcquisitionError::StreamingStillEnabled { value: 1 }));
    }
}
