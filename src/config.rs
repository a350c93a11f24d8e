//! Acquisition settings and their validation against a [`DeviceProfile`].

use std::time::Duration;

use crate::csr::{CounterWidth, DeviceProfile};
use crate::trigger::TriggerSpec;

/// Largest packet the HSPI transmitter emits; frame metadata repeats per packet.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Host scheduling latency a single transfer buffer has to absorb.
const BUFFER_LATENCY: Duration = Duration::from_millis(10);

/// Total latency the whole transfer pool has to absorb.
const POOL_LATENCY: Duration = Duration::from_millis(500);

const MAX_TRANSFERS: usize = 32;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_STOP_RETRIES: u32 = 3;

const fn mhz(v: u64) -> u64 {
    v * 1_000_000
}

const fn khz(v: u64) -> u64 {
    v * 1_000
}

/// Sample rates the driver offers, fastest first.
pub const SAMPLERATES: [u64; 12] = [
    mhz(256),
    mhz(128),
    mhz(64),
    mhz(32),
    mhz(16),
    mhz(8),
    mhz(4),
    mhz(2),
    mhz(1),
    khz(500),
    khz(250),
    khz(125),
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Sample rate {requested} Hz is not reachable from the native {native} Hz")]
    UnsupportedSamplerate { requested: u64, native: u64 },

    #[error("Oversampling x{ratio} requested but the oversampler PHY is synthesized with ratio {phy_ratio}")]
    OversamplingUnavailable { ratio: u8, phy_ratio: u8 },

    #[error("Trigger channel {channel} out of range (device has {channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: usize },

    #[error("Pre-trigger ratio {0}% out of range (max 100%)")]
    InvalidPreTriggerRatio(u8),

    #[error("Trigger stage without any channel condition")]
    EmptyTriggerStage,
}

/// Rates from [`SAMPLERATES`] the given device can run at.
pub fn supported_samplerates(profile: &DeviceProfile) -> Vec<u64> {
    SAMPLERATES
        .iter()
        .copied()
        .filter(|rate| derive_rate(*rate, profile).is_ok())
        .collect()
}

/// How the requested rate maps onto the capture logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePlan {
    /// Logical samples per capture-logic tick: 1, 2 or 4.
    pub oversampling_ratio: u8,
    /// Subsampler register value: keep one sample out of `divisor + 1`.
    pub subsampler: u32,
}

pub fn derive_rate(requested: u64, profile: &DeviceProfile) -> Result<RatePlan, ConfigError> {
    let native = profile.native_samplerate;
    let unsupported = ConfigError::UnsupportedSamplerate { requested, native };

    if requested == 0 || native == 0 {
        return Err(unsupported);
    }

    for ratio in [2u8, 4] {
        if requested == native * u64::from(ratio) {
            if profile.oversampler_phy_ratio < ratio {
                return Err(ConfigError::OversamplingUnavailable {
                    ratio,
                    phy_ratio: profile.oversampler_phy_ratio,
                });
            }
            return Ok(RatePlan {
                oversampling_ratio: ratio,
                subsampler: 0,
            });
        }
    }

    if requested > native || native % requested != 0 {
        return Err(unsupported);
    }
    let subsampler = u32::try_from(native / requested - 1).map_err(|_| unsupported)?;
    Ok(RatePlan {
        oversampling_ratio: 1,
        subsampler,
    })
}

/// Transfer pool dimensions for a given payload rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    pub num_transfers: usize,
    pub buffer_size: usize,
}

impl BufferPlan {
    /// Size buffers to hold [`BUFFER_LATENCY`] worth of payload, rounded up to
    /// whole packets, and enough of them to cover [`POOL_LATENCY`].
    pub fn for_payload_rate(bytes_per_second: u64) -> Self {
        let per_buffer = bytes_per_second * BUFFER_LATENCY.as_millis() as u64 / 1000;
        let buffer_size = (per_buffer as usize)
            .div_ceil(MAX_PACKET_SIZE)
            .max(1)
            * MAX_PACKET_SIZE;

        let pool_bytes = bytes_per_second * POOL_LATENCY.as_millis() as u64 / 1000;
        let num_transfers = (pool_bytes as usize)
            .div_ceil(buffer_size)
            .clamp(1, MAX_TRANSFERS);

        Self {
            num_transfers,
            buffer_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.num_transfers * self.buffer_size
    }
}

/// User-facing acquisition settings.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub samplerate: u64,
    pub limit_samples: u64,
    pub trigger: Option<TriggerSpec>,
    pub continuous: bool,
    pub poll_interval: Duration,
    pub stop_retries: u32,
}

impl AcquisitionConfig {
    pub fn new(samplerate: u64) -> Self {
        Self {
            samplerate,
            limit_samples: 0,
            trigger: None,
            continuous: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_retries: DEFAULT_STOP_RETRIES,
        }
    }

    /// Stop after this many samples; 0 keeps capturing until stopped.
    pub fn limit_samples(mut self, limit: u64) -> Self {
        self.limit_samples = limit;
        self
    }

    pub fn trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Ignore the sample budget and stream until stopped.
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn stop_retries(mut self, retries: u32) -> Self {
        self.stop_retries = retries;
        self
    }

    /// Check the settings against the device; nothing touches hardware here.
    pub fn plan(&self, profile: &DeviceProfile) -> Result<AcquisitionPlan, ConfigError> {
        let rate = derive_rate(self.samplerate, profile)?;
        let ratio = rate.oversampling_ratio;

        let (unit_size, channels) = if ratio == 1 {
            let probes = usize::from(profile.probe_count);
            (probes.div_ceil(8).max(1), probes)
        } else {
            (1, 8 / usize::from(ratio))
        };

        if let Some(trigger) = &self.trigger {
            trigger.validate(channels)?;
        }

        let limit_samples = if self.continuous { 0 } else { self.limit_samples };
        let pre_trigger_samples = self
            .trigger
            .as_ref()
            .map_or(0, |t| t.pre_trigger_samples(limit_samples));

        // wire bytes per second: oversampled ticks pack `ratio` samples per byte
        let bytes_per_second = if ratio == 1 {
            self.samplerate * unit_size as u64
        } else {
            self.samplerate / u64::from(ratio)
        };

        Ok(AcquisitionPlan {
            samplerate: self.samplerate,
            rate,
            unit_size,
            channels,
            limit_samples,
            pre_trigger_samples,
            trigger: self.trigger.clone(),
            frame_counter: profile.frame_counter,
            buffers: BufferPlan::for_payload_rate(bytes_per_second),
            poll_interval: self.poll_interval,
            stop_retries: self.stop_retries,
        })
    }
}

/// Validated, immutable description of one acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionPlan {
    pub samplerate: u64,
    pub rate: RatePlan,
    /// Bytes per logical sample handed to the sink.
    pub unit_size: usize,
    /// Logical channels per sample.
    pub channels: usize,
    pub limit_samples: u64,
    pub pre_trigger_samples: u64,
    pub trigger: Option<TriggerSpec>,
    pub frame_counter: Option<CounterWidth>,
    pub buffers: BufferPlan,
    pub poll_interval: Duration,
    pub stop_retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(phy_ratio: u8) -> DeviceProfile {
        DeviceProfile {
            identifier: "test".into(),
            native_samplerate: mhz(64),
            probe_count: 16,
            oversampler_phy_ratio: phy_ratio,
            frame_counter: None,
        }
    }

    #[test]
    fn test_native_rate_uses_no_oversampling() {
        let plan = derive_rate(mhz(64), &profile(4)).unwrap();
        assert_eq!(plan.oversampling_ratio, 1);
        assert_eq!(plan.subsampler, 0);
    }

    #[test]
    fn test_lower_rate_programs_subsampler() {
        let plan = derive_rate(mhz(16), &profile(1)).unwrap();
        assert_eq!(plan.oversampling_ratio, 1);
        assert_eq!(plan.subsampler, 3);
    }

    #[test]
    fn test_oversampling_ratios() {
        assert_eq!(derive_rate(mhz(128), &profile(2)).unwrap().oversampling_ratio, 2);
        assert_eq!(derive_rate(mhz(256), &profile(4)).unwrap().oversampling_ratio, 4);
    }

    #[test]
    fn test_oversampling_beyond_phy_is_rejected() {
        let err = derive_rate(mhz(256), &profile(2)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OversamplingUnavailable { ratio: 4, phy_ratio: 2 }
        ));
        assert!(derive_rate(mhz(128), &profile(1)).is_err());
    }

    #[test]
    fn test_unreachable_rates_are_rejected() {
        assert!(derive_rate(mhz(3), &profile(4)).is_err());
        assert!(derive_rate(mhz(96), &profile(4)).is_err());
        assert!(derive_rate(0, &profile(4)).is_err());
    }

    #[test]
    fn test_supported_samplerates_follow_phy() {
        let rates = supported_samplerates(&profile(1));
        assert_eq!(rates.first(), Some(&mhz(64)));
        assert!(rates.contains(&khz(125)));
        assert_eq!(supported_samplerates(&profile(4)).first(), Some(&mhz(256)));
    }

    #[test]
    fn test_buffer_plan_rounds_to_packets() {
        // 64 MB/s: 640 kB per 10 ms
        let plan = BufferPlan::for_payload_rate(64_000_000);
        assert_eq!(plan.buffer_size % MAX_PACKET_SIZE, 0);
        assert!(plan.buffer_size >= 640_000);
        assert_eq!(plan.num_transfers, 32usize.min(32_000_000usize.div_ceil(plan.buffer_size)));

        let slow = BufferPlan::for_payload_rate(1_000);
        assert_eq!(slow.buffer_size, MAX_PACKET_SIZE);
        assert_eq!(slow.num_transfers, 1);
    }

    #[test]
    fn test_plan_unit_size_follows_oversampling() {
        let plain = AcquisitionConfig::new(mhz(64)).plan(&profile(4)).unwrap();
        assert_eq!(plain.unit_size, 2);
        assert_eq!(plain.channels, 16);

        let x4 = AcquisitionConfig::new(mhz(256)).plan(&profile(4)).unwrap();
        assert_eq!(x4.unit_size, 1);
        assert_eq!(x4.channels, 2);
    }

    #[test]
    fn test_plan_pre_trigger_and_continuous() {
        let trigger = TriggerSpec::start_capturing_when()
            .one(0)
            .pre_trigger_percent(10)
            .build();
        let plan = AcquisitionConfig::new(mhz(8))
            .limit_samples(1000)
            .trigger(trigger.clone())
            .plan(&profile(1))
            .unwrap();
        assert_eq!(plan.pre_trigger_samples, 100);

        let continuous = AcquisitionConfig::new(mhz(8))
            .limit_samples(1000)
            .trigger(trigger)
            .continuous(true)
            .plan(&profile(1))
            .unwrap();
        assert_eq!(continuous.limit_samples, 0);
        assert_eq!(continuous.pre_trigger_samples, 0);
    }

    #[test]
    fn test_plan_rejects_trigger_on_missing_channel() {
        let trigger = TriggerSpec::start_capturing_when().one(5).build();
        let err = AcquisitionConfig::new(mhz(256))
            .trigger(trigger)
            .plan(&profile(4))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ChannelOutOfRange { channel: 5, channels: 2 }));
    }
}
