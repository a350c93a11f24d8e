//! # SucreLA RS
//!
//! A Rust driver for streaming acquisition from the SucreLA logic analyzer.
//!
//! The analyzer is controlled through a small register bus bridged over a UART
//! or USB, and pushes captured samples to the host over a USB bulk endpoint.
//! This library programs the capture logic, keeps a pool of bulk transfers in
//! flight, reconstructs oversampled data, applies a software trigger and hands
//! bounded frames to a [`SampleSink`].
//!
//! ## Features
//!
//! - **Register bus codec**: fixed-address single word reads and writes with a
//!   configurable address width
//! - **Versioned register maps**: the device profile is read from capability
//!   registers when the gateware has them
//! - **Software trigger**: multi-stage level/edge conditions with pre-trigger
//!   history
//! - **Oversampling**: x2/x4 captures are expanded back to one sample per byte
//! - **Frame counter checks**: gaps in the packet sequence are counted and logged
//! - **DataFrame output**: captured frames convert to `polars` data frames
//! - **Simulator**: an in-process device for tests and demos
//!
//! ## Examples
//!
//! ### Capture from the simulator
//!
//! ```rust
//! use sucrela_rs::{AcquisitionConfig, AddressWidth, CaptureSink, SimulatedDevice, Sucrela};
//!
//! let device = SimulatedDevice::builder().probe_count(8).build();
//! let sucrela = Sucrela::open(device.register_port(), device.register_map(), AddressWidth::Four)?;
//!
//! let config = AcquisitionConfig::new(1_000_000).limit_samples(1000);
//! let acquisition = sucrela
//!     .start_acquisition(&config, device.stream(), CaptureSink::new())
//!     .map_err(|(_, e)| e)?;
//!
//! let finished = acquisition.wait()?;
//! assert_eq!(finished.sink.total_samples(), 1000);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Software trigger
//!
//! ```rust
//! use sucrela_rs::TriggerSpec;
//!
//! let trigger = TriggerSpec::start_capturing_when()
//!     .one(0)
//!     .zero(1)
//!     .then()
//!     .rising(2)
//!     .pre_trigger_percent(25)
//!     .build();
//!
//! println!("Trigger: {}", trigger);
//! ```
//!
//! ### Serial register bridge
//!
//! ```rust,no_run
//! use sucrela_rs::{RegisterMap, Sucrela};
//!
//! let sucrela = Sucrela::connect_serial("/dev/ttyUSB0", RegisterMap::v2())?;
//! println!("Connected to {}", sucrela.identifier());
//! println!("Sample rates: {:?}", sucrela.supported_samplerates());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod capture;
pub mod config;
pub mod csr;
pub mod device;
pub mod framing;
pub mod reconstructor;
pub mod register_bus;
pub mod serial_bridge;
pub mod simulator;
pub mod sink;
pub mod transfer_pool;
pub mod trigger;
#[cfg(feature = "usb")]
pub mod usb;

// Re-export the main types for convenience
pub use acquisition::{Acquisition, AcquisitionError, FinishedAcquisition, Phase, StopReport};

pub use capture::{CaptureSink, CapturedFrame};

pub use config::{AcquisitionConfig, AcquisitionPlan, ConfigError, SAMPLERATES};

pub use csr::{CounterWidth, DeviceProfile, RegisterMap};

pub use device::{DeviceError, Sucrela};

pub use register_bus::{AddressWidth, ByteTransport, RegisterBus, RegisterBusError};

pub use serial_bridge::SerialBridge;

pub use simulator::{SimulatedDevice, StreamFault};

pub use sink::SampleSink;

pub use transfer_pool::{Completion, SlotId, StreamTransport, TransferError, TransferStatus};

pub use trigger::{ChannelCondition, TriggerBuilder, TriggerSpec};
