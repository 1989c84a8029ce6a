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

use crate::service::CongestionConfig;

/// Classic slow start / AIMD window, counted in packets.
///
/// - below `ssthresh` every acknowledged packet grows the window by one
/// - at or above it the window grows by one per window's worth of acks
/// - a loss halves `ssthresh` (floor 2) and restarts from a window of one
///
/// The window is never allowed past the peer's advertised receive window.
#[derive(Debug, Clone)]
pub struct CongestionController {
    congestion_window: u32,
    slow_start_threshold: u32,
    advertised_window: u32,
    acked_in_window: u32,
}

impl CongestionController {
    pub fn new(config: &CongestionConfig) -> Self {
        let advertised_window = config.initial_peer_window.max(1);
        CongestionController {
            congestion_window: config.initial_window.clamp(1, advertised_window),
            slow_start_threshold: config.initial_ssthresh.max(2),
            advertised_window,
            acked_in_window: 0,
        }
    }

    pub fn on_ack(&mut self) {
        if self.congestion_window < self.slow_start_threshold {
            self.congestion_window += 1;
        } else {
            self.acked_in_window += 1;
            if self.acked_in_window >= self.congestion_window {
                self.acked_in_window = 0;
                self.congestion_window += 1;
            }
        }
        // cwnd stays >= 1 while the peer advertises a zero window
        self.congestion_window = self.congestion_window.min(self.advertised_window.max(1));
    }

    pub fn on_loss(&mut self) {
        self.slow_start_threshold = (self.congestion_window / 2).max(2);
        self.congestion_window = 1;
        self.acked_in_window = 0;
    }

    /// Records the peer's advertisement. Zero is kept as is so the sender
    /// stalls until a window update arrives.
    pub fn set_advertised_window(&mut self, window: u32) {
        self.advertised_window = window;
        self.congestion_window = self.congestion_window.min(window.max(1));
    }

    /// Number of packets allowed in flight.
    pub fn send_window(&self) -> u32 {
        self.congestion_window.min(self.advertised_window)
    }

    pub fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    pub fn slow_start_threshold(&self) -> u32 {
        self.slow_start_threshold
    }

    pub fn advertised_window(&self) -> u32 {
        self.advertised_window
    }

    pub fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn controller(initial_window: u32, ssthresh: u32, peer_window: u32) -> CongestionController {
        CongestionController::new(&CongestionConfig {
            initial_window,
            initial_ssthresh: ssthresh,
            initial_peer_window: peer_window,
        })
    }

    #[test]
    fn slow_start_then_linear_growth() {
        let mut cc = controller(1, 4, 100);
        for expected in 2..=4 {
            cc.on_ack();
            assert_eq!(cc.congestion_window(), expected);
        }
        assert!(!cc.in_slow_start());

        // one increment per full window of acks
        for _ in 0..3 {
            cc.on_ack();
        }
        assert_eq!(cc.congestion_window(), 4);
        cc.on_ack();
        assert_eq!(cc.congestion_window(), 5);
    }

    #[rstest]
    #[case(1, 2)]
    #[case(3, 2)]
    #[case(4, 2)]
    #[case(10, 5)]
    #[case(33, 16)]
    fn loss_resets_window(#[case] window: u32, #[case] expected_ssthresh: u32) {
        let mut cc = controller(window, 1000, 1000);
        assert_eq!(cc.congestion_window(), window);
        cc.on_loss();
        assert_eq!(cc.congestion_window(), 1);
        assert_eq!(cc.slow_start_threshold(), expected_ssthresh);
    }

    #[test]
    fn window_never_exceeds_advertisement() {
        let mut cc = controller(1, 64, 6);
        for _ in 0..100 {
            cc.on_ack();
            assert!(cc.congestion_window() <= 6);
        }
        assert_eq!(cc.send_window(), 6);

        cc.set_advertised_window(3);
        assert_eq!(cc.congestion_window(), 3);
        cc.on_ack();
        assert_eq!(cc.send_window(), 3);
    }

    #[test]
    fn zero_window_stalls_sender() {
        let mut cc = controller(4, 64, 8);
        cc.set_advertised_window(0);
        assert_eq!(cc.send_window(), 0);
        cc.set_advertised_window(8);
        assert_eq!(cc.send_window(), 1);
    }

    #[test]
    fn ack_during_zero_window_keeps_one_packet() {
        let mut cc = controller(4, 64, 8);
        cc.set_advertised_window(0);
        cc.on_ack();
        assert_eq!(cc.congestion_window(), 1);
        assert_eq!(cc.send_window(), 0);

        cc.set_advertised_window(4);
        assert_eq!(cc.send_window(), 1);
        cc.on_ack();
        assert_eq!(cc.send_window(), 2);
    }
}
