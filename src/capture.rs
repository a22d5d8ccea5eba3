//! Status-polled streaming capture.
//!
//! The source buffers samples internally and raises a status bit whenever a
//! chunk of interleaved voltage/current values is ready. [`capture`] drains
//! those chunks into a pre-allocated buffer until the buffer is full, the
//! source output has been off for the configured number of trailing chunks,
//! an optional timeout expires or the source reports lost samples.
//!
//! Invariants:
//! - the write offset never exceeds the buffer capacity;
//! - after the source first reports its output inactive, exactly
//!   `trailing_chunks` more chunks are accepted;
//! - a data-lost status ends the capture before any further chunk is read.

use std::time::Duration;

use log::*;

use crate::error::Result;
use crate::instrument::StatusByte;
use crate::util::Clock;

pub trait ChunkSource {
    fn status(&mut self) -> Result<StatusByte>;

    /// Fetches one chunk of `values` interleaved voltage/current samples.
    fn read_chunk(&mut self, values: usize) -> Result<Vec<f32>>;

    fn output_active(&mut self) -> Result<bool>;
}

/// Result of a single status poll.
#[derive(Debug, PartialEq)]
pub enum Poll {
    Idle,
    Lost,
    Chunk(Vec<f32>),
}

/// One status poll. Lost samples take precedence over a waiting chunk.
pub fn poll_chunk<S: ChunkSource>(source: &mut S, values: usize) -> Result<Poll> {
    let status = source.status()?;
    if status.data_lost() {
        return Ok(Poll::Lost);
    }
    if status.data_ready() {
        return source.read_chunk(values).map(Poll::Chunk);
    }
    Ok(Poll::Idle)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    /// Floats per chunk request (two per sample pair).
    pub chunk_values: usize,
    /// Buffer capacity in sample pairs.
    pub capacity: usize,
    /// Chunks accepted after the output is first seen inactive.
    pub trailing_chunks: u32,
    /// Stop once this much time has passed since the first chunk.
    pub timeout: Option<Duration>,
    /// Only used for progress reporting.
    pub expected_duration: Duration,
}

impl CaptureSettings {
    /// Sizes the buffer for `expected` plus `margin` at `sample_rate_hz`
    /// scaled by `headroom`.
    pub fn sized_for(
        expected: Duration,
        margin: Duration,
        sample_rate_hz: u32,
        headroom: f64,
        chunk_values: usize,
    ) -> Self {
        let span = (expected + margin).as_secs_f64();
        let capacity = (sample_rate_hz as f64 * headroom * span).ceil() as usize;
        CaptureSettings {
            chunk_values,
            capacity,
            trailing_chunks: 1,
            timeout: None,
            expected_duration: expected,
        }
    }

    pub fn trailing_chunks(mut self, chunks: u32) -> Self {
        self.trailing_chunks = chunks;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn chunk_pairs(&self) -> usize {
        (self.chunk_values / 2).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Output went inactive and the trailing chunks were collected.
    Complete,
    /// The next chunk would not have fitted.
    BufferFull,
    TimedOut,
    /// The source skipped samples; the record is incomplete.
    DataLost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
    /// Effective sample rate, excluding the last chunk from the count.
    pub rate: Option<f64>,
    pub outcome: CaptureOutcome,
    pub chunks: usize,
}

impl Capture {
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome != CaptureOutcome::DataLost
    }
}

/// Samples per second over the span from the first to the last chunk. The
/// last chunk arrived at the end of the span, so its samples are excluded.
pub fn effective_rate(samples: usize, last_chunk: usize, first: Duration, last: Duration) -> Option<f64> {
    let elapsed = last.checked_sub(first)?.as_secs_f64();
    if elapsed > 0.0 {
        Some(samples.saturating_sub(last_chunk) as f64 / elapsed)
    } else {
        None
    }
}

pub fn capture<S: ChunkSource, C: Clock>(
    source: &mut S,
    clock: &mut C,
    settings: &CaptureSettings,
) -> Result<Capture> {
    let capacity = settings.capacity;
    let mut voltage = vec![0.0_f64; capacity];
    let mut current = vec![0.0_f64; capacity];
    let mut offset = 0;
    let mut chunks = 0;
    let mut last_len = 0;
    let mut first: Option<Duration> = None;
    let mut last = Duration::ZERO;
    let mut progress = Duration::ZERO;
    // Chunks still to accept once the output went inactive.
    let mut trailing: Option<u32> = None;

    info!(
        "Capturing up to {} samples ({:.1} s expected)",
        capacity,
        settings.expected_duration.as_secs_f64()
    );

    let outcome = loop {
        let status = source.status()?;
        let now = clock.now();

        if let (Some(timeout), Some(start)) = (settings.timeout, first) {
            if now.saturating_sub(start) > timeout {
                break CaptureOutcome::TimedOut;
            }
        }

        if status.data_lost() {
            warn!("Lost data after {} samples", offset);
            break CaptureOutcome::DataLost;
        }
        if !status.data_ready() {
            continue;
        }
        let data = source.read_chunk(settings.chunk_values)?;

        let start = *first.get_or_insert(now);
        last = now;
        chunks += 1;

        let pairs = data.len() / 2;
        let take = pairs.min(capacity - offset);
        for (k, pair) in data.chunks_exact(2).take(take).enumerate() {
            voltage[offset + k] = pair[0] as f64;
            current[offset + k] = pair[1] as f64;
        }
        offset += take;
        last_len = take;

        if take < pairs || offset + settings.chunk_pairs() > capacity {
            break CaptureOutcome::BufferFull;
        }

        match trailing.as_mut() {
            Some(left) => {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    break CaptureOutcome::Complete;
                }
            }
            None => {
                if !source.output_active()? {
                    debug!("Output inactive after {} samples", offset);
                    if settings.trailing_chunks == 0 {
                        break CaptureOutcome::Complete;
                    }
                    trailing = Some(settings.trailing_chunks);
                }
            }
        }

        let elapsed = now.saturating_sub(start);
        if elapsed >= progress {
            info!(
                "Remaining: {:.1} s",
                settings.expected_duration.as_secs_f64() - elapsed.as_secs_f64()
            );
            progress = elapsed + Duration::from_secs(1);
        }
    };

    let rate = first.and_then(|start| effective_rate(offset, last_len, start, last));
    voltage.truncate(offset);
    current.truncate(offset);

    info!(
        "Captured {} samples in {} chunks ({:?}), rate {}",
        offset,
        chunks,
        outcome,
        rate.map_or("n/a".to_string(), |r| format!("{:.0} S/s", r))
    );

    Ok(Capture {
        voltage,
        current,
        rate,
        outcome,
        chunks,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::util::ManualClock;
    use std::collections::VecDeque;

    /// Scripted source: each step is a status byte, with a chunk and an
    /// output state consumed when the ready bit is set.
    pub struct FakeSource {
        pub steps: VecDeque<(u8, Vec<f32>, bool)>,
        pending: Option<(Vec<f32>, bool)>,
        pub reads: usize,
    }

    impl FakeSource {
        pub fn new(steps: Vec<(u8, Vec<f32>, bool)>) -> Self {
            FakeSource {
                steps: steps.into(),
                pending: None,
                reads: 0,
            }
        }

        /// `n` ready chunks of `pairs` pairs, numbered so every sample is
        /// distinct, with the output going inactive from chunk `off_at`.
        pub fn chunks(n: usize, pairs: usize, off_at: usize) -> Self {
            let steps = (0..n)
                .map(|c| {
                    let data = (0..pairs)
                        .flat_map(|p| {
                            let k = (c * pairs + p) as f32;
                            [k, -k]
                        })
                        .collect();
                    (0x80, data, c < off_at)
                })
                .collect();
            Self::new(steps)
        }
    }

    impl ChunkSource for FakeSource {
        fn status(&mut self) -> Result<StatusByte> {
            match self.steps.pop_front() {
                Some((stb, data, active)) => {
                    self.pending = Some((data, active));
                    Ok(StatusByte(stb))
                }
                None => Err(crate::error::Error::Instrument("script exhausted".into())),
            }
        }

        fn read_chunk(&mut self, _values: usize) -> Result<Vec<f32>> {
            self.reads += 1;
            Ok(self.pending.as_ref().map(|p| p.0.clone()).unwrap_or_default())
        }

        fn output_active(&mut self) -> Result<bool> {
            Ok(self.pending.as_ref().map_or(true, |p| p.1))
        }
    }

    fn clock(step_ms: u64) -> ManualClock {
        ManualClock::starting_at(Duration::from_secs(10), Duration::from_millis(step_ms))
    }

    fn settings(capacity: usize, chunk_values: usize) -> CaptureSettings {
        CaptureSettings {
            chunk_values,
            capacity,
            trailing_chunks: 1,
            timeout: None,
            expected_duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn one_trailing_chunk_after_output_off() {
        // Output reported off on chunk 4 (index 3); chunk 5 is the last one.
        let mut source = FakeSource::chunks(8, 5, 3);
        let cap = capture(&mut source, &mut clock(100), &settings(1000, 10)).unwrap();
        assert_eq!(cap.outcome, CaptureOutcome::Complete);
        assert_eq!(cap.chunks, 5);
        assert_eq!(cap.len(), 25);
        assert_eq!(source.reads, 5);
    }

    #[test]
    fn three_trailing_chunks() {
        let mut source = FakeSource::chunks(10, 5, 2);
        let s = settings(1000, 10).trailing_chunks(3);
        let cap = capture(&mut source, &mut clock(100), &s).unwrap();
        assert_eq!(cap.chunks, 6);
        assert_eq!(cap.outcome, CaptureOutcome::Complete);
    }

    #[test]
    fn zero_trailing_chunks_stops_on_signal() {
        let mut source = FakeSource::chunks(10, 5, 2);
        let s = settings(1000, 10).trailing_chunks(0);
        let cap = capture(&mut source, &mut clock(100), &s).unwrap();
        assert_eq!(cap.chunks, 3);
    }

    #[test]
    fn data_lost_aborts_without_reading() {
        let mut steps: Vec<(u8, Vec<f32>, bool)> =
            (0..3).map(|_| (0x80, vec![1.0, 2.0, 3.0, 4.0], true)).collect();
        steps.push((0x88, vec![9.0, 9.0], true));
        steps.push((0x80, vec![5.0, 6.0], true));
        let mut source = FakeSource::new(steps);
        let cap = capture(&mut source, &mut clock(100), &settings(100, 4)).unwrap();
        assert_eq!(cap.outcome, CaptureOutcome::DataLost);
        assert!(!cap.is_complete());
        assert_eq!(source.reads, 3);
        assert_eq!(cap.voltage, vec![1.0, 3.0, 1.0, 3.0, 1.0, 3.0]);
        assert_eq!(cap.current, vec![2.0, 4.0, 2.0, 4.0, 2.0, 4.0]);
    }

    #[test]
    fn poll_prefers_lost_over_ready() {
        let mut source = FakeSource::new(vec![
            (0x88, vec![1.0, 2.0], true),
            (0x00, vec![], true),
            (0x80, vec![1.0, 2.0], true),
        ]);
        assert_eq!(poll_chunk(&mut source, 2).unwrap(), Poll::Lost);
        assert_eq!(poll_chunk(&mut source, 2).unwrap(), Poll::Idle);
        assert_eq!(poll_chunk(&mut source, 2).unwrap(), Poll::Chunk(vec![1.0, 2.0]));
        assert_eq!(source.reads, 1);
    }

    #[test]
    fn idle_polls_read_nothing() {
        let mut source = FakeSource::new(vec![
            (0x00, vec![], true),
            (0x80, vec![1.0, 2.0], true),
            (0x00, vec![], true),
            (0x80, vec![3.0, 4.0], false),
            (0x80, vec![5.0, 6.0], false),
        ]);
        let cap = capture(&mut source, &mut clock(100), &settings(100, 2)).unwrap();
        assert_eq!(cap.voltage, vec![1.0, 3.0, 5.0]);
        assert_eq!(source.reads, 3);
    }

    #[test]
    fn stops_before_overflow() {
        let mut source = FakeSource::chunks(100, 5, 100);
        let cap = capture(&mut source, &mut clock(100), &settings(23, 10)).unwrap();
        assert_eq!(cap.outcome, CaptureOutcome::BufferFull);
        assert_eq!(cap.len(), 20);
    }

    #[test]
    fn oversized_chunk_is_clipped_to_capacity() {
        let mut source = FakeSource::new(vec![(0x80, vec![1.0; 40], true)]);
        let cap = capture(&mut source, &mut clock(100), &settings(7, 4)).unwrap();
        assert_eq!(cap.outcome, CaptureOutcome::BufferFull);
        assert_eq!(cap.len(), 7);
    }

    #[test]
    fn output_is_truncated_to_written_samples() {
        let mut source = FakeSource::chunks(3, 5, 1);
        let cap = capture(&mut source, &mut clock(100), &settings(10_000, 10)).unwrap();
        assert_eq!(cap.len(), 15);
        assert_eq!(cap.current.len(), 15);
        assert_eq!(cap.voltage.last(), Some(&14.0));
    }

    #[test]
    fn rate_excludes_last_chunk() {
        // 10 chunks of 50 pairs; one poll per chunk, so chunk stamps are
        // 10.0 s, 10.222 s, ... and the span first-to-last is 2.0 s.
        let mut source = FakeSource::chunks(10, 50, 8);
        let mut clk = ManualClock::starting_at(Duration::from_secs(10), Duration::from_secs_f64(2.0 / 9.0));
        let cap = capture(&mut source, &mut clk, &settings(100_000, 100)).unwrap();
        assert_eq!(cap.chunks, 10);
        assert_eq!(cap.len(), 500);
        let rate = cap.rate.unwrap();
        assert!((rate - 225.0).abs() < 1e-6, "rate {}", rate);
    }

    #[test]
    fn effective_rate_needs_a_span() {
        let t = Duration::from_secs(1);
        assert_eq!(effective_rate(50, 50, t, t), None);
        assert_eq!(effective_rate(500, 50, t, t + Duration::from_secs(2)), Some(225.0));
    }

    #[test]
    fn timeout_counts_from_first_chunk() {
        let mut source = FakeSource::chunks(50, 5, 50);
        let s = settings(10_000, 10).timeout(Duration::from_millis(450));
        let cap = capture(&mut source, &mut clock(100), &s).unwrap();
        assert_eq!(cap.outcome, CaptureOutcome::TimedOut);
        assert_eq!(cap.chunks, 5);
        assert_eq!(source.reads, 5);
    }

    #[test]
    fn reruns_are_identical() {
        let s = settings(1000, 10);
        let a = capture(&mut FakeSource::chunks(8, 5, 4), &mut clock(50), &s).unwrap();
        let b = capture(&mut FakeSource::chunks(8, 5, 4), &mut clock(50), &s).unwrap();
        assert_eq!(a, b);
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.voltage), bits(&b.voltage));
    }

    #[test]
    fn sizing_matches_sample_rate() {
        let s = CaptureSettings::sized_for(
            Duration::from_secs(58),
            Duration::from_secs(1),
            500_000,
            1.02,
            50,
        );
        assert_eq!(s.capacity, 30_090_000);
        assert_eq!(s.chunk_pairs(), 25);
    }

    #[test]
    fn transport_errors_propagate() {
        let mut source = FakeSource::chunks(2, 5, 5);
        assert!(capture(&mut source, &mut clock(10), &settings(1000, 10)).is_err());
    }
}
