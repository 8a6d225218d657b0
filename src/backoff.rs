// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2026 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Exponential backoff policy for reconnect scheduling.

use std::time::Duration;

use rand::Rng;

use crate::consts::MAX_BACKOFF_EXPONENT;

/// Computes reconnect delays as `min(max, jitter + min * 2^attempts)`.
///
/// The jitter offset is sampled once at construction, uniformly from
/// `[0, min)`, so that a fleet of clients dropped by the same outage does not
/// reconnect in lockstep. The exponent is capped so repeated failures saturate
/// at `max` instead of overflowing.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    interval_min: Duration,
    interval_max: Duration,
    jitter: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    /// Creates a new backoff with a randomly sampled jitter offset.
    #[must_use]
    pub fn new(interval_min: Duration, interval_max: Duration) -> Self {
        let min_ms = interval_min.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter_ms = if min_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..min_ms)
        };
        Self::with_jitter(interval_min, interval_max, Duration::from_millis(jitter_ms))
    }

    /// Creates a new backoff with an explicit jitter offset.
    #[must_use]
    pub const fn with_jitter(
        interval_min: Duration,
        interval_max: Duration,
        jitter: Duration,
    ) -> Self {
        Self {
            interval_min,
            interval_max,
            jitter,
            attempts: 0,
        }
    }

    /// Returns the delay before the next reconnect attempt and advances the
    /// attempt counter.
    pub fn next_interval(&mut self) -> Duration {
        let exponent = self.attempts.min(MAX_BACKOFF_EXPONENT);
        self.attempts = self.attempts.saturating_add(1);
        let base = self.interval_min.saturating_mul(1u32 << exponent);
        self.interval_max.min(self.jitter.saturating_add(base))
    }

    /// Resets the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Returns the number of intervals handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_doubles_until_cap_without_jitter() {
        let mut backoff = ReconnectBackoff::with_jitter(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::ZERO,
        );
        let intervals: Vec<u64> = (0..6).map(|_| backoff.next_interval().as_millis() as u64).collect();
        assert_eq!(intervals, vec![10, 20, 40, 80, 100, 100]);
    }

    #[rstest]
    fn test_jitter_offsets_every_interval() {
        let mut backoff = ReconnectBackoff::with_jitter(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(5),
        );
        assert_eq!(backoff.next_interval(), Duration::from_millis(15));
        assert_eq!(backoff.next_interval(), Duration::from_millis(25));
        assert_eq!(backoff.next_interval(), Duration::from_millis(45));
        assert_eq!(backoff.next_interval(), Duration::from_millis(85));
        assert_eq!(backoff.next_interval(), Duration::from_millis(100));
    }

    #[rstest]
    fn test_reset_restarts_the_schedule() {
        let mut backoff = ReconnectBackoff::with_jitter(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::ZERO,
        );
        backoff.next_interval();
        backoff.next_interval();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_interval(), Duration::from_millis(10));
    }

    #[rstest]
    fn test_sampled_jitter_is_below_min() {
        for _ in 0..50 {
            let backoff =
                ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
            assert!(backoff.jitter < Duration::from_millis(100));
        }
    }

    #[rstest]
    fn test_zero_min_interval_yields_zero_then_jitterless_doubling() {
        let mut backoff = ReconnectBackoff::new(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(backoff.next_interval(), Duration::ZERO);
        assert_eq!(backoff.next_interval(), Duration::ZERO);
    }
}
