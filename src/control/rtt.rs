// Copyright 2025 jonefeewang@gmail.com
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

use std::time::Duration;

use crate::service::RttConfig;

/// Jacobson/Karels round trip estimator.
///
/// ```text
/// first sample m:  srtt = m, rttvar = m/2
/// afterwards:      err = m - srtt
///                  srtt   += err/8
///                  rttvar += (|err| - rttvar)/4
/// rto = clamp(srtt + 4*rttvar, min_rto, max_rto)
/// ```
///
/// Callers feed only samples of frames that were never retransmitted (Karn).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed_rtt: Option<Duration>,
    rtt_variance: Duration,
    retransmission_timeout: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(config: &RttConfig) -> Self {
        let min_rto = Duration::from_millis(config.min_rto_ms);
        let max_rto = Duration::from_millis(config.max_rto_ms);
        RttEstimator {
            smoothed_rtt: None,
            rtt_variance: Duration::ZERO,
            retransmission_timeout: Duration::from_millis(config.initial_rto_ms)
                .clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    pub fn on_sample(&mut self, sample: Duration) {
        match self.smoothed_rtt {
            None => {
                self.smoothed_rtt = Some(sample);
                self.rtt_variance = sample / 2;
            }
            Some(srtt) => {
                let abs_error = sample.abs_diff(srtt);
                let srtt = if sample >= srtt {
                    srtt + abs_error / 8
                } else {
                    srtt - abs_error / 8
                };
                self.smoothed_rtt = Some(srtt);
                // rttvar + (|err| - rttvar)/4, kept non-negative
                self.rtt_variance = self.rtt_variance * 3 / 4 + abs_error / 4;
            }
        }
        self.recompute();
    }

    /// Exponential back-off after a retransmission timeout. The next valid
    /// sample recomputes the timeout from the estimates.
    pub fn back_off(&mut self) {
        self.retransmission_timeout = (self.retransmission_timeout * 2).min(self.max_rto);
    }

    fn recompute(&mut self) {
        let srtt = self.smoothed_rtt.unwrap_or_default();
        self.retransmission_timeout =
            (srtt + self.rtt_variance * 4).clamp(self.min_rto, self.max_rto);
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    pub fn rtt_variance(&self) -> Duration {
        self.rtt_variance
    }

    pub fn retransmission_timeout(&self) -> Duration {
        self.retransmission_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unclamped() -> RttEstimator {
        RttEstimator::new(&RttConfig {
            initial_rto_ms: 1_000,
            min_rto_ms: 0,
            max_rto_ms: 60_000,
        })
    }

    #[test]
    fn first_sample_seeds_estimates() {
        let mut rtt = unclamped();
        rtt.on_sample(Duration::from_millis(100));
        assert_eq!(rtt.smoothed_rtt(), Some(Duration::from_millis(100)));
        assert_eq!(rtt.rtt_variance(), Duration::from_millis(50));
        assert_eq!(rtt.retransmission_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn second_sample_follows_gains() {
        let mut rtt = unclamped();
        rtt.on_sample(Duration::from_millis(100));
        rtt.on_sample(Duration::from_millis(180));
        // err = 80: srtt = 100 + 10, rttvar = 50 + (80 - 50)/4
        assert_eq!(rtt.smoothed_rtt(), Some(Duration::from_millis(110)));
        assert_eq!(rtt.rtt_variance(), Duration::from_micros(57_500));

        rtt.on_sample(Duration::from_millis(30));
        // err = -80: srtt = 110 - 10
        assert_eq!(rtt.smoothed_rtt(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn constant_samples_converge() {
        let mut rtt = unclamped();
        let m = Duration::from_millis(250);
        for _ in 0..200 {
            rtt.on_sample(m);
        }
        assert_eq!(rtt.smoothed_rtt(), Some(m));
        assert_eq!(rtt.rtt_variance(), Duration::ZERO);
        assert_eq!(rtt.retransmission_timeout(), m);
    }

    #[test]
    fn constant_samples_converge_after_noise() {
        let mut rtt = unclamped();
        rtt.on_sample(Duration::from_millis(400));
        rtt.on_sample(Duration::from_millis(40));
        let m = Duration::from_millis(250);
        for _ in 0..400 {
            rtt.on_sample(m);
        }
        let srtt = rtt.smoothed_rtt().unwrap();
        assert!(srtt.abs_diff(m) < Duration::from_micros(1), "srtt {srtt:?}");
        assert!(rtt.rtt_variance() < Duration::from_micros(1));
    }

    #[test]
    fn timeout_is_clamped() {
        let mut rtt = RttEstimator::new(&RttConfig::default());
        assert_eq!(rtt.retransmission_timeout(), Duration::from_secs(1));
        rtt.on_sample(Duration::from_millis(1));
        assert_eq!(rtt.retransmission_timeout(), Duration::from_secs(1));
        rtt.on_sample(Duration::from_secs(120));
        assert_eq!(rtt.retransmission_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn back_off_doubles_up_to_max() {
        let mut rtt = RttEstimator::new(&RttConfig::default());
        rtt.back_off();
        assert_eq!(rtt.retransmission_timeout(), Duration::from_secs(2));
        for _ in 0..10 {
            rtt.back_off();
        }
        assert_eq!(rtt.retransmission_timeout(), Duration::from_secs(60));
        rtt.on_sample(Duration::from_millis(10));
        assert_eq!(rtt.retransmission_timeout(), Duration::from_secs(1));
    }
}
