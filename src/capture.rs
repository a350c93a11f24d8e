use polars::prelude::*;

use crate::sink::{SampleSink, SinkEvent};

const TIME_COLUMN_NAME: &str = "time";
const ROW_INDEX_COLUMN_NAME: &str = "row_index";

/// One triggered capture episode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedFrame {
    pub unit_size: usize,
    pub data: Vec<u8>,
}

impl CapturedFrame {
    pub fn num_samples(&self) -> usize {
        if self.unit_size == 0 {
            0
        } else {
            self.data.len() / self.unit_size
        }
    }

    /// Logical value of sample `index` (little-endian unit).
    pub fn sample(&self, index: usize) -> Option<u64> {
        let start = index * self.unit_size;
        let unit = self.data.get(start..start + self.unit_size)?;
        Some(
            unit.iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        )
    }

    /// Frame as a table with a `time` column and one `bit_N` column per channel.
    pub fn to_dataframe(&self, samplerate: u64, channels: usize) -> Result<DataFrame, PolarsError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("CapturedFrame::to_dataframe");

        let samples = self.num_samples();
        let mut bit_columns: Vec<Vec<bool>> = vec![Vec::with_capacity(samples); channels];
        for index in 0..samples {
            let value = self.sample(index).unwrap_or_default();
            for (bit, column) in bit_columns.iter_mut().enumerate() {
                column.push((value >> bit) & 1 == 1);
            }
        }

        let columns: Vec<Column> = bit_columns
            .into_iter()
            .enumerate()
            .map(|(bit, values)| Series::new(format!("bit_{}", bit).into(), values).into())
            .collect();

        let period = 1.0 / samplerate as f64;
        let mut order = vec![col(TIME_COLUMN_NAME)];
        order.extend((0..channels).map(|bit| col(format!("bit_{}", bit))));

        DataFrame::new(columns)?
            .lazy()
            .with_row_index(ROW_INDEX_COLUMN_NAME, Some(0))
            .with_columns([(col(ROW_INDEX_COLUMN_NAME).cast(DataType::Float64) * lit(period))
                .alias(TIME_COLUMN_NAME)])
            .select(order)
            .collect()
    }
}

/// Sink that keeps every frame in memory and logs the call sequence.
#[derive(Debug, Default)]
pub struct CaptureSink {
    frames: Vec<CapturedFrame>,
    current: Option<CapturedFrame>,
    events: Vec<SinkEvent>,
    ended: bool,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[CapturedFrame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<CapturedFrame> {
        self.frames
    }

    pub fn events(&self) -> &[SinkEvent] {
        &self.events
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Samples delivered so far, including an unfinished frame.
    pub fn total_samples(&self) -> usize {
        self.frames
            .iter()
            .chain(self.current.iter())
            .map(CapturedFrame::num_samples)
            .sum()
    }
}

impl SampleSink for CaptureSink {
    fn frame_header(&mut self) {
        self.events.push(SinkEvent::FrameHeader);
    }

    fn frame_begin(&mut self) {
        self.events.push(SinkEvent::FrameBegin);
        self.current = Some(CapturedFrame::default());
    }

    fn logic_data(&mut self, data: &[u8], unit_size: usize) {
        self.events.push(SinkEvent::LogicData(data.len() / unit_size.max(1)));
        let frame = self.current.get_or_insert_with(CapturedFrame::default);
        frame.unit_size = unit_size;
        frame.data.extend_from_slice(data);
    }

    fn frame_end(&mut self) {
        self.events.push(SinkEvent::FrameEnd);
        if let Some(frame) = self.current.take() {
            self.frames.push(frame);
        }
    }

    fn session_end(&mut self) {
        self.events.push(SinkEvent::SessionEnd);
        // an unbounded capture ends without frame_end
        if let Some(frame) = self.current.take() {
            self.frames.push(frame);
        }
        self.ended = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_records_call_order() {
        let mut sink = CaptureSink::new();
        sink.frame_header();
        sink.frame_begin();
        sink.logic_data(&[1, 2, 3, 4], 2);
        sink.frame_end();
        sink.session_end();

        assert_eq!(
            sink.events(),
            &[
                SinkEvent::FrameHeader,
                SinkEvent::FrameBegin,
                SinkEvent::LogicData(2),
                SinkEvent::FrameEnd,
                SinkEvent::SessionEnd,
            ]
        );
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(sink.frames()[0].num_samples(), 2);
        assert!(sink.is_ended());
    }

    #[test]
    fn test_session_end_keeps_open_frame() {
        let mut sink = CaptureSink::new();
        sink.frame_header();
        sink.frame_begin();
        sink.logic_data(&[7], 1);
        sink.session_end();
        assert_eq!(sink.into_frames(), vec![CapturedFrame { unit_size: 1, data: vec![7] }]);
    }

    #[test]
    fn test_frame_sample_is_little_endian() {
        let frame = CapturedFrame {
            unit_size: 2,
            data: vec![0x34, 0x12, 0xff, 0x00],
        };
        assert_eq!(frame.sample(0), Some(0x1234));
        assert_eq!(frame.sample(1), Some(0x00ff));
        assert_eq!(frame.sample(2), None);
    }

    #[test]
    fn test_to_dataframe_extracts_bits() {
        let frame = CapturedFrame {
            unit_size: 1,
            data: vec![0b01, 0b10, 0b11],
        };
        let df = frame.to_dataframe(1_000_000, 2).unwrap();

        assert_eq!(df.height(), 3);
        assert_eq!(df.width(), 3);
        let bit0: Vec<bool> = df.column("bit_0").unwrap().bool().unwrap().into_no_null_iter().collect();
        let bit1: Vec<bool> = df.column("bit_1").unwrap().bool().unwrap().into_no_null_iter().collect();
        assert_eq!(bit0, vec![true, false, true]);
        assert_eq!(bit1, vec![false, true, true]);

        let time: Vec<f64> = df.column("time").unwrap().f64().unwrap().into_no_null_iter().collect();
        assert!((time[2] - 2e-6).abs() < 1e-12);
    }
}
