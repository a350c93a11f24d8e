//! Turns raw HSPI payload into logical sample units.
//!
//! A transfer carries one or more packets of at most [`MAX_PACKET_SIZE`] bytes.
//! Each packet may start with a little-endian frame counter; the rest is
//! sample data, packed `ratio` samples per byte when oversampling.

use crate::config::MAX_PACKET_SIZE;
use crate::csr::CounterWidth;

/// Expand oversampled bytes into one byte per logical sample.
///
/// Ratio 2 yields the low nibble then the high nibble, ratio 4 yields the
/// 2-bit slices least significant first. Any other ratio copies the input.
pub fn expand(ratio: u8, input: &[u8], out: &mut Vec<u8>) {
    match ratio {
        2 => {
            out.reserve(input.len() * 2);
            for b in input {
                out.push(b & 0x0f);
                out.push(b >> 4);
            }
        }
        4 => {
            out.reserve(input.len() * 4);
            for b in input {
                out.push(b & 0x03);
                out.push((b >> 2) & 0x03);
                out.push((b >> 4) & 0x03);
                out.push(b >> 6);
            }
        }
        _ => out.extend_from_slice(input),
    }
}

/// Result of reconstructing one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub packets: usize,
    pub counter_gaps: usize,
}

#[derive(Debug)]
pub struct SampleReconstructor {
    ratio: u8,
    unit_size: usize,
    counter: Option<CounterWidth>,
    prev_counter: Option<u64>,
    carry: Vec<u8>,
    counter_gaps: u64,
}

impl SampleReconstructor {
    pub fn new(ratio: u8, unit_size: usize, counter: Option<CounterWidth>) -> Self {
        Self {
            ratio,
            unit_size: unit_size.max(1),
            counter,
            prev_counter: None,
            carry: Vec::new(),
            counter_gaps: 0,
        }
    }

    /// Frame counter gaps seen since creation.
    pub fn counter_gaps(&self) -> u64 {
        self.counter_gaps
    }

    /// Reconstruct `chunk` into whole sample units appended to `out`.
    ///
    /// Bytes of an incomplete trailing unit are kept for the next call.
    pub fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> ChunkStats {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("SampleReconstructor::process");

        let mut stats = ChunkStats::default();
        let start = out.len();
        out.extend_from_slice(&self.carry);
        self.carry.clear();

        for packet in chunk.chunks(MAX_PACKET_SIZE) {
            stats.packets += 1;
            let payload = match self.counter {
                Some(width) => {
                    if packet.len() < width.bytes() {
                        log::warn!("Packet of {} bytes is shorter than its frame counter", packet.len());
                        continue;
                    }
                    let (prefix, payload) = packet.split_at(width.bytes());
                    if !self.check_counter(width, prefix) {
                        stats.counter_gaps += 1;
                    }
                    payload
                }
                None => packet,
            };
            expand(self.ratio, payload, out);
        }

        let whole = out.len() - (out.len() - start) % self.unit_size;
        self.carry.extend_from_slice(&out[whole..]);
        out.truncate(whole);
        stats
    }

    fn check_counter(&mut self, width: CounterWidth, prefix: &[u8]) -> bool {
        let counter = prefix
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

        let in_sequence = match self.prev_counter {
            None => true,
            Some(prev) => {
                let expected = if prev == width.max_value() { 0 } else { prev + 1 };
                if counter != expected {
                    self.counter_gaps += 1;
                    log::warn!(
                        "Frame counter discontinuity: expected {}, got {} (samples may be missing)",
                        expected,
                        counter
                    );
                }
                counter == expected
            }
        };
        self.prev_counter = Some(counter);
        in_sequence
    }
}
