/// Consumer of decoded sample frames.
///
/// Calls arrive in order: one `frame_header`, then per frame a `frame_begin`,
/// zero or more `logic_data` and a `frame_end`, and finally one `session_end`.
pub trait SampleSink {
    fn frame_header(&mut self);
    fn frame_begin(&mut self);
    fn logic_data(&mut self, data: &[u8], unit_size: usize);
    fn frame_end(&mut self);
    fn session_end(&mut self);
}

impl<S: SampleSink + ?Sized> SampleSink for Box<S> {
    fn frame_header(&mut self) {
        (**self).frame_header();
    }

    fn frame_begin(&mut self) {
        (**self).frame_begin();
    }

    fn logic_data(&mut self, data: &[u8], unit_size: usize) {
        (**self).logic_data(data, unit_size);
    }

    fn frame_end(&mut self) {
        (**self).frame_end();
    }

    fn session_end(&mut self) {
        (**self).session_end();
    }
}

/// Sink call as recorded by [`crate::capture::CaptureSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    FrameHeader,
    FrameBegin,
    /// Number of samples delivered in one `logic_data` call.
    LogicData(usize),
    FrameEnd,
    SessionEnd,
}
