//! Software trigger.
//!
//! A [`TriggerSpec`] is a list of stages, each a set of per-channel level or
//! edge conditions. [`TriggerMatcher`] walks the stages over consecutive
//! samples and keeps a bounded pre-trigger history.

use std::collections::VecDeque;

use crate::config::ConfigError;

/// Condition a single channel has to satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCondition {
    Zero,
    One,
    Rising,
    Falling,
}

impl ChannelCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelCondition::Zero => "0",
            ChannelCondition::One => "1",
            ChannelCondition::Rising => "r",
            ChannelCondition::Falling => "f",
        }
    }
}

/// Conditions that have to hold on the same sample.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggerStage {
    conditions: Vec<(usize, ChannelCondition)>,
}

impl TriggerStage {
    pub fn conditions(&self) -> &[(usize, ChannelCondition)] {
        &self.conditions
    }

    fn set(&mut self, channel: usize, condition: ChannelCondition) {
        if let Some(existing) = self.conditions.iter_mut().find(|(c, _)| *c == channel) {
            existing.1 = condition;
        } else {
            self.conditions.push((channel, condition));
        }
    }
}

/// Software trigger: stages matched on consecutive samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSpec {
    stages: Vec<TriggerStage>,
    pre_trigger_percent: u8,
}

impl TriggerSpec {
    pub fn start_capturing_when() -> TriggerBuilder {
        TriggerBuilder::new()
    }

    pub fn stages(&self) -> &[TriggerStage] {
        &self.stages
    }

    /// Share of the sample budget captured before the trigger point.
    pub fn pre_trigger_percent(&self) -> u8 {
        self.pre_trigger_percent
    }

    pub fn validate(&self, channels: usize) -> Result<(), ConfigError> {
        if self.stages.is_empty() || self.stages.iter().any(|s| s.conditions.is_empty()) {
            return Err(ConfigError::EmptyTriggerStage);
        }
        if self.pre_trigger_percent > 100 {
            return Err(ConfigError::InvalidPreTriggerRatio(self.pre_trigger_percent));
        }
        for stage in &self.stages {
            if let Some((channel, _)) = stage.conditions.iter().find(|(c, _)| *c >= channels) {
                return Err(ConfigError::ChannelOutOfRange {
                    channel: *channel,
                    channels,
                });
            }
        }
        Ok(())
    }

    /// Number of pre-trigger samples for a sample budget.
    pub fn pre_trigger_samples(&self, limit_samples: u64) -> u64 {
        limit_samples * u64::from(self.pre_trigger_percent) / 100
    }
}

impl std::fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            for (j, (channel, condition)) in stage.conditions.iter().enumerate() {
                if j > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}={}", channel, condition.as_str())?;
            }
        }
        write!(f, " (pre {}%)", self.pre_trigger_percent)
    }
}

#[derive(Debug)]
pub struct TriggerBuilder {
    stages: Vec<TriggerStage>,
    current: TriggerStage,
    pre_trigger_percent: u8,
}

impl TriggerBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            current: TriggerStage::default(),
            pre_trigger_percent: 0,
        }
    }

    /// Set the condition of `channel` in the current stage.
    pub fn channel(mut self, channel: usize, condition: ChannelCondition) -> Self {
        self.current.set(channel, condition);
        self
    }

    pub fn zero(self, channel: usize) -> Self {
        self.channel(channel, ChannelCondition::Zero)
    }

    pub fn one(self, channel: usize) -> Self {
        self.channel(channel, ChannelCondition::One)
    }

    pub fn rising(self, channel: usize) -> Self {
        self.channel(channel, ChannelCondition::Rising)
    }

    pub fn falling(self, channel: usize) -> Self {
        self.channel(channel, ChannelCondition::Falling)
    }

    /// Close the current stage; following conditions must match on the next sample.
    pub fn then(mut self) -> Self {
        self.stages.push(std::mem::take(&mut self.current));
        self
    }

    pub fn pre_trigger_percent(mut self, percent: u8) -> Self {
        self.pre_trigger_percent = percent;
        self
    }

    pub fn build(mut self) -> TriggerSpec {
        if !self.current.conditions.is_empty() {
            self.stages.push(self.current);
        }
        TriggerSpec {
            stages: self.stages,
            pre_trigger_percent: self.pre_trigger_percent,
        }
    }
}

impl Default for TriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StageMask {
    level_mask: u64,
    level_value: u64,
    rising: u64,
    falling: u64,
}

impl StageMask {
    fn from_stage(stage: &TriggerStage) -> Self {
        let mut mask = Self::default();
        for (channel, condition) in &stage.conditions {
            let bit = 1u64 << channel;
            match condition {
                ChannelCondition::Zero => mask.level_mask |= bit,
                ChannelCondition::One => {
                    mask.level_mask |= bit;
                    mask.level_value |= bit;
                }
                ChannelCondition::Rising => mask.rising |= bit,
                ChannelCondition::Falling => mask.falling |= bit,
            }
        }
        mask
    }

    fn matches(&self, sample: u64, prev: Option<u64>) -> bool {
        if sample & self.level_mask != self.level_value {
            return false;
        }
        if self.rising | self.falling == 0 {
            return true;
        }
        // an edge needs a previous sample
        let Some(prev) = prev else {
            return false;
        };
        (!prev & sample & self.rising) == self.rising
            && (prev & !sample & self.falling) == self.falling
    }
}

/// Where a trigger fired inside the checked chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerHit {
    /// Sample index of the trigger point within the chunk.
    pub offset: usize,
    /// Samples preceding the trigger point, oldest first.
    pub pre_trigger: Vec<u8>,
}

impl TriggerHit {
    pub fn pre_trigger_samples(&self, unit_size: usize) -> usize {
        self.pre_trigger.len() / unit_size
    }
}

/// Stateful matcher for a [`TriggerSpec`] over a stream of sample units.
#[derive(Debug)]
pub struct TriggerMatcher {
    stages: Vec<StageMask>,
    cur_stage: usize,
    unit_size: usize,
    prev_sample: Option<u64>,
    history: VecDeque<u8>,
    history_capacity: usize,
}

impl TriggerMatcher {
    pub fn new(spec: &TriggerSpec, unit_size: usize, pre_trigger_samples: usize) -> Self {
        let history_capacity = pre_trigger_samples * unit_size;
        Self {
            stages: spec.stages.iter().map(StageMask::from_stage).collect(),
            cur_stage: 0,
            unit_size,
            prev_sample: None,
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
        }
    }

    pub fn current_stage(&self) -> usize {
        self.cur_stage
    }

    pub fn reset(&mut self) {
        self.cur_stage = 0;
        self.prev_sample = None;
        self.history.clear();
    }

    /// Advance over `data`; returns the trigger point if every stage matched.
    pub fn check(&mut self, data: &[u8]) -> Option<TriggerHit> {
        if self.stages.is_empty() {
            return None;
        }

        for (i, unit) in data.chunks_exact(self.unit_size).enumerate() {
            let sample = unit
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

            let mut matched = self.stages[self.cur_stage].matches(sample, self.prev_sample);
            if !matched && self.cur_stage > 0 {
                self.cur_stage = 0;
                matched = self.stages[0].matches(sample, self.prev_sample);
            }

            if matched {
                if self.cur_stage + 1 == self.stages.len() {
                    self.cur_stage = 0;
                    self.prev_sample = Some(sample);
                    let pre_trigger = self.history.drain(..).collect();
                    return Some(TriggerHit {
                        offset: i,
                        pre_trigger,
                    });
                }
                self.cur_stage += 1;
            }

            self.remember(unit);
            self.prev_sample = Some(sample);
        }
        None
    }

    fn remember(&mut self, unit: &[u8]) {
        if self.history_capacity == 0 {
            return;
        }
        self.history.extend(unit);
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_stages() {
        let spec = TriggerSpec::start_capturing_when()
            .one(0)
            .zero(1)
            .then()
            .rising(2)
            .pre_trigger_percent(25)
            .build();

        assert_eq!(spec.stages().len(), 2);
        assert_eq!(
            spec.stages()[0].conditions(),
            &[(0, ChannelCondition::One), (1, ChannelCondition::Zero)]
        );
        assert_eq!(spec.pre_trigger_percent(), 25);
        assert_eq!(spec.to_string(), "0=1,1=0 -> 2=r (pre 25%)");
    }

    #[test]
    fn test_builder_overrides_same_channel() {
        let spec = TriggerSpec::start_capturing_when().one(3).falling(3).build();
        assert_eq!(spec.stages()[0].conditions(), &[(3, ChannelCondition::Falling)]);
    }

    #[test]
    fn test_validate_rejects_bad_specs() {
        let empty = TriggerSpec::start_capturing_when().build();
        assert!(matches!(empty.validate(8), Err(ConfigError::EmptyTriggerStage)));

        let out_of_range = TriggerSpec::start_capturing_when().one(9).build();
        assert!(matches!(
            out_of_range.validate(8),
            Err(ConfigError::ChannelOutOfRange { channel: 9, channels: 8 })
        ));

        let bad_ratio = TriggerSpec::start_capturing_when()
            .one(0)
            .pre_trigger_percent(101)
            .build();
        assert!(matches!(
            bad_ratio.validate(8),
            Err(ConfigError::InvalidPreTriggerRatio(101))
        ));
    }

    #[test]
    fn test_level_trigger_offset() {
        let spec = TriggerSpec::start_capturing_when().one(1).build();
        let mut matcher = TriggerMatcher::new(&spec, 1, 0);

        assert_eq!(matcher.check(&[0x00, 0x01]), None);
        let hit = matcher.check(&[0x00, 0x03, 0x00]).unwrap();
        assert_eq!(hit.offset, 1);
        assert!(hit.pre_trigger.is_empty());
    }

    #[test]
    fn test_rising_edge_across_chunks() {
        let spec = TriggerSpec::start_capturing_when().rising(0).build();
        let mut matcher = TriggerMatcher::new(&spec, 1, 0);

        // the first sample has no predecessor and can never be an edge
        assert_eq!(matcher.check(&[0x01, 0x01, 0x00]), None);
        let hit = matcher.check(&[0x01]).unwrap();
        assert_eq!(hit.offset, 0);
    }

    #[test]
    fn test_falling_edge() {
        let spec = TriggerSpec::start_capturing_when().falling(7).build();
        let mut matcher = TriggerMatcher::new(&spec, 1, 0);
        let hit = matcher.check(&[0x80, 0x80, 0x00]).unwrap();
        assert_eq!(hit.offset, 2);
    }

    #[test]
    fn test_pre_trigger_history_is_bounded() {
        let spec = TriggerSpec::start_capturing_when().one(4).build();
        let mut matcher = TriggerMatcher::new(&spec, 1, 3);

        let hit = matcher.check(&[1, 2, 3, 4, 5, 0x10]).unwrap();
        assert_eq!(hit.offset, 5);
        assert_eq!(hit.pre_trigger, vec![3, 4, 5]);
        assert_eq!(hit.pre_trigger_samples(1), 3);
    }

    #[test]
    fn test_multi_stage_sequence_restarts_on_mismatch() {
        let spec = TriggerSpec::start_capturing_when()
            .one(0)
            .then()
            .one(1)
            .build();
        let mut matcher = TriggerMatcher::new(&spec, 1, 0);

        // stage 0 matches at 0, stage 1 fails at 1, restart; stage 0 again at 2, stage 1 at 3
        let hit = matcher.check(&[0x01, 0x00, 0x01, 0x02]).unwrap();
        assert_eq!(hit.offset, 3);
        assert_eq!(matcher.current_stage(), 0);
    }

    #[test]
    fn test_wide_units_are_little_endian() {
        let spec = TriggerSpec::start_capturing_when().one(9).build();
        let mut matcher = TriggerMatcher::new(&spec, 2, 1);

        let hit = matcher.check(&[0xff, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(hit.offset, 1);
        assert_eq!(hit.pre_trigger, vec![0xff, 0x00]);
    }
}
