// Copyright 2024 tison <wander4096@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Mutex;
use std::time::Instant;

const WINDOW_SECS: usize = 60;

struct MeterInner {
    buckets: [u64; WINDOW_SECS],
    last_tick: u64,
}

/// A sliding one-minute counter: per-second buckets over a 60 second window.
///
/// Backs the apply-rate and sequence-gap rates that decide when a follower
/// abandons log shipping, and the per-store kps/bytes properties.
pub struct MinuteMeter {
    epoch: Instant,
    inner: Mutex<MeterInner>,
}

impl Default for MinuteMeter {
    fn default() -> Self {
        MinuteMeter::new()
    }
}

impl MinuteMeter {
    pub fn new() -> MinuteMeter {
        MinuteMeter {
            epoch: Instant::now(),
            inner: Mutex::new(MeterInner {
                buckets: [0; WINDOW_SECS],
                last_tick: 0,
            }),
        }
    }

    pub fn mark(&self, n: u64) {
        let tick = self.epoch.elapsed().as_secs();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        advance(&mut inner, tick);
        inner.buckets[(tick as usize) % WINDOW_SECS] += n;
    }

    /// Total marked within the trailing minute.
    pub fn minute_rate(&self) -> u64 {
        let tick = self.epoch.elapsed().as_secs();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        advance(&mut inner, tick);
        inner.buckets.iter().sum()
    }
}

fn advance(inner: &mut MeterInner, tick: u64) {
    let elapsed = tick.saturating_sub(inner.last_tick);
    if elapsed >= WINDOW_SECS as u64 {
        inner.buckets = [0; WINDOW_SECS];
    } else {
        for t in (inner.last_tick + 1)..=tick {
            inner.buckets[(t as usize) % WINDOW_SECS] = 0;
        }
    }
    inner.last_tick = tick;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_accumulate_within_window() {
        let meter = MinuteMeter::new();
        assert_eq!(meter.minute_rate(), 0);
        meter.mark(3);
        meter.mark(4);
        assert_eq!(meter.minute_rate(), 7);
    }

    #[test]
    fn test_window_expiry() {
        let meter = MinuteMeter::new();
        meter.mark(10);
        {
            let mut inner = meter.inner.lock().unwrap();
            // simulate the whole window passing
            advance(&mut inner, WINDOW_SECS as u64 + 1);
        }
        assert_eq!(meter.minute_rate(), 0);
    }

    #[test]
    fn test_partial_expiry_clears_stale_buckets() {
        let meter = MinuteMeter::new();
        {
            let mut inner = meter.inner.lock().unwrap();
            inner.buckets[1] = 5;
            inner.buckets[10] = 7;
            inner.last_tick = 10;
            // ticks 11..=30 pass without marks; bucket 1 stays in window
            advance(&mut inner, 30);
            assert_eq!(inner.buckets.iter().sum::<u64>(), 12);
            // wrapping past second 61 clears bucket 1
            advance(&mut inner, 61);
            assert_eq!(inner.buckets.iter().sum::<u64>(), 7);
        }
    }
}
