//! Frame boundaries and the sample budget.
//!
//! Reconstructed samples are held back until the trigger fires, then
//! forwarded to the sink until `limit_samples` have been sent. There is one
//! frame per acquisition.

use crate::sink::SampleSink;
use crate::trigger::TriggerMatcher;

/// What the transfer that carried the data should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep streaming.
    Continue,
    /// The frame budget is used up; nothing more will be forwarded.
    FinalFrame,
}

#[derive(Debug)]
enum FrameState {
    Armed(TriggerMatcher),
    Fired,
    Ended,
}

/// Applies the trigger and the sample budget to reconstructed samples.
#[derive(Debug)]
pub struct FramingEngine {
    state: FrameState,
    unit_size: usize,
    limit_samples: u64,
    sent_samples: u64,
    num_frames: u64,
}

impl FramingEngine {
    /// `trigger` of `None` starts the frame right away with the whole budget.
    pub fn new(unit_size: usize, limit_samples: u64, trigger: Option<TriggerMatcher>) -> Self {
        Self {
            state: trigger.map_or(FrameState::Fired, FrameState::Armed),
            unit_size: unit_size.max(1),
            limit_samples,
            sent_samples: 0,
            num_frames: 0,
        }
    }

    /// Emit the opening markers: the header, and `frame_begin` when no trigger is armed.
    pub fn begin(&mut self, sink: &mut dyn SampleSink) {
        sink.frame_header();
        if matches!(self.state, FrameState::Fired) {
            sink.frame_begin();
        }
    }

    pub fn trigger_fired(&self) -> bool {
        !matches!(self.state, FrameState::Armed(_))
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.state, FrameState::Ended)
    }

    pub fn sent_samples(&self) -> u64 {
        self.sent_samples
    }

    pub fn num_frames(&self) -> u64 {
        self.num_frames
    }

    /// Drop the trigger matcher and forward nothing more.
    pub fn close(&mut self) {
        self.state = FrameState::Ended;
    }

    fn remaining(&self) -> u64 {
        if self.limit_samples == 0 {
            u64::MAX
        } else {
            self.limit_samples.saturating_sub(self.sent_samples)
        }
    }

    /// Forward `data` (whole sample units) to the sink.
    pub fn feed(&mut self, data: &[u8], sink: &mut dyn SampleSink) -> Flow {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("FramingEngine::feed");

        let mut offset = 0;
        match &mut self.state {
            FrameState::Ended => return Flow::FinalFrame,
            FrameState::Fired => {}
            FrameState::Armed(matcher) => {
                let Some(hit) = matcher.check(data) else {
                    return Flow::Continue;
                };
                let pre_samples = hit.pre_trigger_samples(self.unit_size) as u64;
                log::debug!(
                    "Trigger fired at sample {} with {} pre-trigger samples",
                    hit.offset,
                    pre_samples
                );
                sink.frame_begin();
                self.state = FrameState::Fired;

                let pre_samples = pre_samples.min(self.remaining());
                if pre_samples > 0 {
                    let bytes = pre_samples as usize * self.unit_size;
                    let skip = hit.pre_trigger.len() - bytes;
                    sink.logic_data(&hit.pre_trigger[skip..], self.unit_size);
                }
                self.sent_samples += pre_samples;
                offset = hit.offset * self.unit_size;
            }
        }

        let available = (data.len() - offset) / self.unit_size;
        let num_samples = (available as u64).min(self.remaining()) as usize;
        if num_samples > 0 {
            sink.logic_data(
                &data[offset..offset + num_samples * self.unit_size],
                self.unit_size,
            );
            self.sent_samples += num_samples as u64;
        }

        if self.limit_samples > 0 && self.sent_samples >= self.limit_samples {
            log::debug!("Frame complete after {} samples", self.sent_samples);
            sink.frame_end();
            self.num_frames += 1;
            self.state = FrameState::Ended;
            return Flow::FinalFrame;
        }
        Flow::Continue
    }
}
