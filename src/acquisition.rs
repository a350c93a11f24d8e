//! Acquisition session: start, streaming, coordinated stop.
//!
//! All mutable session state lives in one [`SessionState`] behind a single
//! mutex. Completions are delivered by whoever calls
//! [`Acquisition::poll_events`]; a watchdog thread owns the device while the
//! session runs and performs the hardware side of the stop:
//!
//! ```text
//! Idle -> Starting -> Streaming -> Stopping -> Finished
//! ```
//!
//! `Finished` is entered exactly once, from `Stopping`, after the watchdog
//! has disabled the transmitter and no transfer is outstanding any more.
//! Only then is `session_end` delivered to the sink.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};

use crate::config::{AcquisitionConfig, AcquisitionPlan, ConfigError};
use crate::device::Sucrela;
use crate::framing::{Flow, FramingEngine};
use crate::reconstructor::SampleReconstructor;
use crate::register_bus::{ByteTransport, RegisterBusError};
use crate::sink::SampleSink;
use crate::transfer_pool::{Completion, SlotOutcome, StreamTransport, TransferError, TransferPool};
use crate::trigger::TriggerMatcher;

/// How long a failed start waits for its transfers to come back.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Register bus error: {0}")]
    Register(#[from] RegisterBusError),

    #[error("Failed to submit transfers: {0}")]
    Submit(#[from] TransferError),

    #[error("Streaming still enabled after stop (register reads {value})")]
    StreamingStillEnabled { value: u32 },

    #[error("Failed to spawn watchdog: {0}")]
    WatchdogSpawn(#[source] std::io::Error),

    #[error("Watchdog thread lost")]
    WatchdogLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Finished,
}

/// Summary handed back when a session is over.
#[derive(Debug)]
pub struct StopReport {
    pub frames: u64,
    pub samples_sent: u64,
    pub counter_gaps: u64,
    /// Failure to confirm the HSPI transmitter was switched off.
    pub disable_error: Option<AcquisitionError>,
}

#[derive(Debug)]
pub struct FinishedAcquisition<T, S> {
    pub device: Sucrela<T>,
    pub sink: S,
    pub report: StopReport,
}

struct SessionState<S> {
    phase: Phase,
    stop_requested: bool,
    /// Set by the watchdog once the disable write and readback are done.
    hardware_stopped: bool,
    pool: TransferPool,
    reconstructor: SampleReconstructor,
    framing: FramingEngine,
    sink: S,
    scratch: Vec<u8>,
}

impl<S: SampleSink> SessionState<S> {
    fn handle_completion(&mut self, completion: Completion, stream: &dyn StreamTransport) {
        let Self {
            pool,
            reconstructor,
            framing,
            sink,
            scratch,
            ..
        } = self;

        let outcome = pool.on_complete(completion, stream, |data| {
            #[cfg(feature = "cpu-profiling")]
            let _zone = tracy_client::span!("handle_completion");

            if framing.is_ended() {
                return Flow::FinalFrame;
            }
            scratch.clear();
            let stats = reconstructor.process(data, scratch);
            tracing::trace!(
                packets = stats.packets,
                counter_gaps = stats.counter_gaps,
                samples = scratch.len(),
                "reconstructed transfer"
            );
            framing.feed(scratch.as_slice(), sink)
        });

        if outcome == SlotOutcome::DeviceGone {
            self.stop_requested = true;
        }
        if self.framing.is_ended() && !self.stop_requested {
            log::debug!("Sample budget reached, requesting stop");
            self.stop_requested = true;
        }
    }

    /// Enter `Finished` once the hardware is stopped and nothing is in flight.
    /// Returns whether this call did it.
    fn try_finish(&mut self) -> bool {
        if self.phase != Phase::Stopping || !self.hardware_stopped || self.pool.outstanding() > 0 {
            return false;
        }
        self.phase = Phase::Finished;
        self.stop_requested = true;
        self.framing.close();
        self.pool.release_buffers();
        self.sink.session_end();
        log::debug!(
            "Acquisition finished: {} samples in {} frames",
            self.framing.sent_samples(),
            self.framing.num_frames()
        );
        true
    }
}

struct Session<S> {
    state: Mutex<SessionState<S>>,
    changed: Condvar,
    stream: Arc<dyn StreamTransport>,
}

impl<S: SampleSink> Session<S> {
    fn new(plan: &AcquisitionPlan, stream: Arc<dyn StreamTransport>, sink: S) -> Self {
        let matcher = plan.trigger.as_ref().map(|trigger| {
            TriggerMatcher::new(trigger, plan.unit_size, plan.pre_trigger_samples as usize)
        });
        let state = SessionState {
            phase: Phase::Idle,
            stop_requested: false,
            hardware_stopped: false,
            pool: TransferPool::new(plan.buffers),
            reconstructor: SampleReconstructor::new(
                plan.rate.oversampling_ratio,
                plan.unit_size,
                plan.frame_counter,
            ),
            framing: FramingEngine::new(plan.unit_size, plan.limit_samples, matcher),
            sink,
            scratch: Vec::with_capacity(plan.buffers.buffer_size * usize::from(plan.rate.oversampling_ratio)),
        };
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
            stream,
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.state.lock().phase = phase;
    }

    fn submit_all(&self) -> Result<(), TransferError> {
        self.state.lock().pool.submit_all(self.stream.as_ref())
    }

    /// Collect the transfers of a failed start without touching the sink.
    fn drain(&self, poll_interval: Duration) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let outstanding = self.state.lock().pool.outstanding();
            if outstanding == 0 {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("{} transfers still outstanding after failed start", outstanding);
                return;
            }
            let completions = self.stream.handle_events(poll_interval);
            let mut state = self.state.lock();
            for completion in completions {
                state
                    .pool
                    .on_complete(completion, self.stream.as_ref(), |_| Flow::FinalFrame);
            }
        }
        self.state.lock().pool.release_buffers();
    }

    fn begin_streaming(&self) {
        let mut state = self.state.lock();
        let SessionState { framing, sink, .. } = &mut *state;
        framing.begin(sink);
        state.phase = Phase::Streaming;
    }

    fn poll_events(&self, timeout: Duration) -> usize {
        let completions = self.stream.handle_events(timeout);
        let count = completions.len();

        let mut state = self.state.lock();
        for completion in completions {
            state.handle_completion(completion, self.stream.as_ref());
        }
        let stop_requested = state.stop_requested;
        if state.try_finish() || stop_requested {
            self.changed.notify_all();
        }
        count
    }

    fn request_stop(&self) {
        let mut state = self.state.lock();
        if !state.stop_requested {
            log::debug!("Stop requested");
            state.stop_requested = true;
        }
        self.changed.notify_all();
    }

    /// Poll every `interval` until a stop is requested.
    fn wait_for_stop(&self, interval: Duration) {
        let mut state = self.state.lock();
        while !state.stop_requested {
            self.changed.wait_for(&mut state, interval);
        }
    }

    /// Drop everything still streaming: from here on no sample reaches the sink.
    fn enter_stopping(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Stopping;
        state.pool.set_aborting();
    }

    /// Called after the transmitter was disabled: cancel what is still in flight.
    fn cancel_outstanding(&self) {
        let mut state = self.state.lock();
        state.hardware_stopped = true;
        state.pool.cancel_all(self.stream.as_ref());
        if state.try_finish() {
            self.changed.notify_all();
        }
    }

    fn phase(&self) -> Phase {
        self.state.lock().phase
    }
}

type WatchdogResult<T> = Option<(Sucrela<T>, Option<AcquisitionError>)>;

fn watchdog<T: ByteTransport, S: SampleSink>(
    session: Arc<Session<S>>,
    device: Receiver<Sucrela<T>>,
    poll_interval: Duration,
    stop_attempts: u32,
) -> WatchdogResult<T> {
    // the sender is dropped without sending when the start fails
    let Ok(mut device) = device.recv() else {
        return None;
    };
    session.wait_for_stop(poll_interval);
    let disable_error = stop(&mut device, &session, stop_attempts);
    Some((device, disable_error))
}

#[tracing::instrument(skip_all)]
fn stop<T: ByteTransport, S: SampleSink>(
    device: &mut Sucrela<T>,
    session: &Session<S>,
    attempts: u32,
) -> Option<AcquisitionError> {
    session.enter_stopping();

    let disable_error = device.disable_streaming(attempts).err();
    if let Some(e) = &disable_error {
        log::error!("Failed to stop streaming: {}", e);
    }

    session.cancel_outstanding();
    disable_error
}

/// A running acquisition.
///
/// Completions only make progress while someone calls [`Self::poll_events`]
/// or [`Self::wait`].
pub struct Acquisition<T, S> {
    session: Arc<Session<S>>,
    watchdog: Option<JoinHandle<WatchdogResult<T>>>,
    poll_interval: Duration,
}

impl<T, S> Acquisition<T, S>
where
    T: ByteTransport + Send + 'static,
    S: SampleSink + Send + 'static,
{
    #[tracing::instrument(skip_all, fields(samplerate = config.samplerate, limit = config.limit_samples))]
    pub(crate) fn start(
        mut device: Sucrela<T>,
        config: &AcquisitionConfig,
        stream: Arc<dyn StreamTransport>,
        sink: S,
    ) -> Result<Self, (Sucrela<T>, AcquisitionError)> {
        let plan = match config.plan(device.profile()) {
            Ok(plan) => plan,
            Err(e) => return Err((device, e.into())),
        };
        log::debug!(
            "Starting acquisition at {} Hz: unit size {}, {} transfers of {} bytes",
            plan.samplerate,
            plan.unit_size,
            plan.buffers.num_transfers,
            plan.buffers.buffer_size
        );

        let session = Arc::new(Session::new(&plan, stream, sink));
        let (device_tx, device_rx) = crossbeam_channel::bounded(1);
        let spawned = {
            let session = Arc::clone(&session);
            let poll_interval = plan.poll_interval;
            let stop_attempts = plan.stop_retries;
            thread::Builder::new()
                .name("sucrela-watchdog".to_string())
                .spawn(move || watchdog(session, device_rx, poll_interval, stop_attempts))
        };
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return Err((device, AcquisitionError::WatchdogSpawn(e))),
        };

        session.set_phase(Phase::Starting);
        if let Err(e) = device.program_acquisition(&plan) {
            log::error!("Failed to program the capture logic: {}", e);
            if let Err(disable) = device.disable_streaming(plan.stop_retries) {
                log::warn!("Could not disable streaming after failed start: {}", disable);
            }
            return Err((device, e.into()));
        }

        if let Err(e) = session.submit_all() {
            if let Err(disable) = device.disable_streaming(plan.stop_retries) {
                log::warn!("Could not disable streaming after failed start: {}", disable);
            }
            session.drain(plan.poll_interval);
            return Err((device, e.into()));
        }

        session.begin_streaming();
        if let Err(returned) = device_tx.send(device) {
            // the watchdog is gone; undo the start with the device we got back
            let mut device = returned.into_inner();
            session.enter_stopping();
            if let Err(disable) = device.disable_streaming(plan.stop_retries) {
                log::warn!("Could not disable streaming after failed start: {}", disable);
            }
            session.state.lock().pool.cancel_all(session.stream.as_ref());
            session.drain(plan.poll_interval);
            return Err((device, AcquisitionError::WatchdogLost));
        }

        Ok(Self {
            session,
            watchdog: Some(handle),
            poll_interval: plan.poll_interval,
        })
    }

    /// Deliver completions that arrive within `timeout`. Returns how many did.
    pub fn poll_events(&self, timeout: Duration) -> usize {
        self.session.poll_events(timeout)
    }

    /// Ask the watchdog to stop the capture. Returns immediately.
    pub fn request_stop(&self) {
        self.session.request_stop();
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == Phase::Finished
    }

    /// Samples forwarded to the sink so far.
    pub fn samples_sent(&self) -> u64 {
        self.session.state.lock().framing.sent_samples()
    }

    pub fn outstanding_transfers(&self) -> usize {
        self.session.state.lock().pool.outstanding()
    }

    /// Drive completions until the session is finished and take everything back.
    pub fn wait(mut self) -> Result<FinishedAcquisition<T, S>, AcquisitionError> {
        while !self.is_finished() {
            self.poll_events(self.poll_interval);
        }

        let session = Arc::clone(&self.session);
        let handle = self.watchdog.take();
        drop(self);

        let (device, disable_error) = handle
            .ok_or(AcquisitionError::WatchdogLost)?
            .join()
            .map_err(|_| AcquisitionError::WatchdogLost)?
            .ok_or(AcquisitionError::WatchdogLost)?;

        let state = Arc::try_unwrap(session)
            .map_err(|_| AcquisitionError::WatchdogLost)?
            .state
            .into_inner();
        let report = StopReport {
            frames: state.framing.num_frames(),
            samples_sent: state.framing.sent_samples(),
            counter_gaps: state.reconstructor.counter_gaps(),
            disable_error,
        };
        Ok(FinishedAcquisition {
            device,
            sink: state.sink,
            report,
        })
    }
}

impl<T, S> Drop for Acquisition<T, S> {
    fn drop(&mut self) {
        // let the watchdog switch the transmitter off
        let mut state = self.session.state.lock();
        state.stop_requested = true;
        drop(state);
        self.session.changed.notify_all();
    }
}

impl<T, S> std::fmt::Debug for Acquisition<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.session.state.lock();
        f.debug_struct("Acquisition")
            .field("phase", &state.phase)
            .field("stop_requested", &state.stop_requested)
            .field("outstanding", &state.pool.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSink;
    use crate::csr::CounterWidth;
    use crate::simulator::{SimulatedDevice, SimulatedRegisterPort, SimulatedStream, StreamFault};
    use crate::register_bus::AddressWidth;
    use crate::sink::SinkEvent;
    use crate::trigger::TriggerSpec;

    const POLL: Duration = Duration::from_millis(1);

    fn open(device: &SimulatedDevice) -> Sucrela<SimulatedRegisterPort> {
        Sucrela::open(device.register_port(), device.register_map(), AddressWidth::Four).unwrap()
    }

    fn start(
        device: &SimulatedDevice,
        config: AcquisitionConfig,
    ) -> Acquisition<SimulatedRegisterPort, CaptureSink> {
        let stream: Arc<SimulatedStream> = device.stream();
        open(device)
            .start_acquisition(&config.poll_interval(POLL), stream, CaptureSink::new())
            .unwrap()
    }

    fn session_ends(sink: &CaptureSink) -> usize {
        sink.events().iter().filter(|e| **e == SinkEvent::SessionEnd).count()
    }

    #[test]
    fn test_budget_stops_session() {
        let device = SimulatedDevice::builder().probe_count(8).build();
        let acquisition = start(&device, AcquisitionConfig::new(1_000_000).limit_samples(10_000));

        let finished = acquisition.wait().unwrap();
        assert_eq!(finished.report.samples_sent, 10_000);
        assert_eq!(finished.report.frames, 1);
        assert!(finished.report.disable_error.is_none());
        assert_eq!(finished.sink.total_samples(), 10_000);
        assert_eq!(session_ends(&finished.sink), 1);
        assert!(!device.streaming_enabled());
        assert_eq!(device.stream().in_flight(), 0);
    }

    #[test]
    fn test_finish_waits_for_hardware_stop() {
        let device = SimulatedDevice::builder().probe_count(8).build();
        let plan = AcquisitionConfig::new(1_000_000)
            .limit_samples(100)
            .plan(open(&device).profile())
            .unwrap();
        let session = Session::new(&plan, device.stream(), CaptureSink::new());
        session.begin_streaming();

        let mut state = session.state.lock();
        // nothing in flight, but the transmitter has not been disabled yet
        assert!(!state.try_finish());
        state.phase = Phase::Stopping;
        assert!(!state.try_finish());

        state.hardware_stopped = true;
        assert!(state.try_finish());
        assert!(!state.try_finish());
        assert_eq!(state.phase, Phase::Finished);
        assert_eq!(state.sink.events().last(), Some(&SinkEvent::SessionEnd));
    }

    #[test]
    fn test_request_stop_ends_unbounded_capture() {
        let device = SimulatedDevice::builder().probe_count(8).build();
        let acquisition = start(&device, AcquisitionConfig::new(1_000_000));
        while acquisition.samples_sent() == 0 {
            acquisition.poll_events(POLL);
        }
        acquisition.request_stop();

        let finished = acquisition.wait().unwrap();
        let events = finished.sink.events();
        assert_eq!(events[0], SinkEvent::FrameHeader);
        assert_eq!(events[1], SinkEvent::FrameBegin);
        assert_eq!(events.last(), Some(&SinkEvent::SessionEnd));
        assert!(!events.contains(&SinkEvent::FrameEnd));
        assert_eq!(finished.report.frames, 0);
    }

    #[test]
    fn test_config_error_leaves_device_untouched() {
        let device = SimulatedDevice::builder().oversampler_phy_ratio(1).build();
        let config = AcquisitionConfig::new(128_000_000);
        let result = open(&device).start_acquisition(&config, device.stream(), CaptureSink::new());

        let Err((sucrela, err)) = result else {
            panic!("start should fail");
        };
        assert!(matches!(
            err,
            AcquisitionError::Config(ConfigError::OversamplingUnavailable { ratio: 2, .. })
        ));
        assert_eq!(sucrela.identifier(), "SucreLA simulator");
        assert!(device.register_writes().is_empty());
    }

    #[test]
    fn test_device_gone_drains_remaining_transfers() {
        let device = SimulatedDevice::builder().probe_count(8).build();
        let stream = device.stream();
        stream.hold(true);
        let acquisition = start(&device, AcquisitionConfig::new(8_000_000));
        let outstanding = acquisition.outstanding_transfers();
        assert!(outstanding > 1);

        stream.inject(StreamFault::DeviceGone);
        stream.hold(false);
        let finished = acquisition.wait().unwrap();

        assert_eq!(session_ends(&finished.sink), 1);
        assert_eq!(stream.completions(), outstanding);
        assert_eq!(stream.in_flight(), 0);
    }

    #[test]
    fn test_stop_cancels_every_slot_once() {
        let device = SimulatedDevice::builder().probe_count(8).build();
        let stream = device.stream();
        stream.hold(true);
        let acquisition = start(&device, AcquisitionConfig::new(8_000_000));
        let outstanding = acquisition.outstanding_transfers();

        acquisition.request_stop();
        let finished = acquisition.wait().unwrap();
        assert_eq!(stream.completions(), outstanding);
        assert_eq!(session_ends(&finished.sink), 1);
        assert_eq!(finished.sink.total_samples(), 0);
    }

    #[test]
    fn test_stuck_transmitter_is_reported() {
        let device = SimulatedDevice::builder()
            .probe_count(8)
            .stuck_streaming(true)
            .build();
        let acquisition = start(&device, AcquisitionConfig::new(1_000_000).limit_samples(100));
        let finished = acquisition.wait().unwrap();
        assert!(matches!(
            finished.report.disable_error,
            Some(AcquisitionError::StreamingStillEnabled { value: 1 })
        ));
        assert_eq!(session_ends(&finished.sink), 1);
    }

    #[test]
    fn test_trigger_and_counter_gaps() {
        let device = SimulatedDevice::builder()
            .probe_count(8)
            .frame_counter(Some(CounterWidth::One))
            .build();
        let trigger = TriggerSpec::start_capturing_when()
            .rising(7)
            .pre_trigger_percent(50)
            .build();
        device.stream().inject(StreamFault::DropPacket);
        let acquisition = start(
            &device,
            AcquisitionConfig::new(1_000_000).limit_samples(64).trigger(trigger),
        );
        let finished = acquisition.wait().unwrap();

        let frames = finished.sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].num_samples(), 64);
        // the payload counts up, so bit 7 first rises on 0x80
        assert_eq!(frames[0].sample(31), Some(0x7f));
        assert_eq!(frames[0].sample(32), Some(0x80));
        assert_eq!(finished.report.counter_gaps, 1);
    }
}
