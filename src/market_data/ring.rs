// =============================================================================
// HistoryRing — bounded bar history with in-place minute aggregation
// =============================================================================
//
// One ring per (symbol, interval). Bars are strictly ordered by start time;
// the ring drops its oldest element once `capacity` is reached. Ticks feed an
// in-progress bar which is finalised when the first tick of the next interval
// boundary arrives.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, TimeZone, Utc};

use super::{Bar, BarInterval, Tick};

/// Bounded, ordered sequence of closed bars plus one in-progress bar.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    interval: BarInterval,
    capacity: usize,
    bars: VecDeque<Bar>,
    building: Option<Bar>,
}

impl HistoryRing {
    pub fn new(interval: BarInterval, capacity: usize) -> Self {
        Self {
            interval,
            capacity,
            bars: VecDeque::with_capacity(capacity + 1),
            building: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Align a timestamp down to the interval boundary.
    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.interval.seconds();
        let aligned = (ts.timestamp() / secs) * secs;
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
    }

    /// Seed the ring with preloaded bars. Bars with non-increasing start
    /// times relative to the ring tail are skipped so ordering always holds.
    pub fn seed(&mut self, bars: Vec<Bar>) {
        for bar in bars {
            if let Some(last) = self.bars.back() {
                if bar.start <= last.start {
                    continue;
                }
            }
            self.bars.push_back(bar);
            while self.bars.len() > self.capacity {
                self.bars.pop_front();
            }
        }
    }

    /// Append an externally closed bar (from a feed bar message). Ignored if
    /// it would break the strictly-increasing start-time invariant.
    pub fn push_closed(&mut self, bar: Bar) {
        if let Some(last) = self.bars.back() {
            if bar.start <= last.start {
                return;
            }
        }
        // A feed-closed bar supersedes whatever we were building for the
        // same bucket.
        if let Some(b) = &self.building {
            if b.start == bar.start {
                self.building = None;
            }
        }
        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
    }

    /// Fold a tick into the in-progress bar, closing the previous bar when
    /// the tick crosses an interval boundary. Returns the newly closed bar,
    /// if any.
    pub fn apply_tick(&mut self, tick: &Tick) -> Option<Bar> {
        let bucket = self.bucket_start(tick.timestamp);

        match &mut self.building {
            Some(current) if current.start == bucket => {
                current.high = current.high.max(tick.ltp);
                current.low = current.low.min(tick.ltp);
                current.close = tick.ltp;
                current.volume += tick.volume;
                None
            }
            Some(current) if bucket > current.start => {
                let closed = current.clone();
                self.building = Some(Bar {
                    start: bucket,
                    open: tick.ltp,
                    high: tick.ltp,
                    low: tick.ltp,
                    close: tick.ltp,
                    volume: tick.volume,
                });
                self.push_closed(closed.clone());
                Some(closed)
            }
            // Out-of-order tick from before the bar being built: drop it
            // rather than corrupt the ring ordering.
            Some(_) => None,
            None => {
                self.building = Some(Bar {
                    start: bucket,
                    open: tick.ltp,
                    high: tick.ltp,
                    low: tick.ltp,
                    close: tick.ltp,
                    volume: tick.volume,
                });
                None
            }
        }
    }

    /// The most recent `n` closed bars, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Bar> {
        let start = self.bars.len().saturating_sub(n);
        self.bars.iter().skip(start).cloned().collect()
    }

    /// Closing prices of the most recent `n` bars, oldest first.
    pub fn recent_closes(&self, n: usize) -> Vec<f64> {
        self.recent(n).iter().map(|b| b.close).collect()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.back().map(|b| b.close)
    }
}
