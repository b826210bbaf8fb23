// Copyright 2021-2024 Kenta Ida
//
// SPDX-License-Identifier: Apache-2.0
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

//! SWJ clock timing.
//!
//! Every half period of SWCLK/TCK is one pin write followed by a busy wait of
//! `n` delay loops. `ClockTiming` describes the cost of those two building
//! blocks in CPU cycles, and `ClockDelay` is the `n` derived from a requested
//! frequency.

/// Default SWJ clock used until the host sends `DAP_SWJ_Clock`.
pub const DEFAULT_SWJ_CLOCK_HZ: u32 = 1_200_000;

/// Delay loop count used in fast mode.
pub const DELAY_FAST_CYCLES: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockTiming {
    /// Clock of the CPU executing the bit-bang loops.
    pub cpu_clock: u32,
    /// CPU cycles consumed by one pin write, loop overhead included.
    pub io_port_write_cycles: u32,
    /// CPU cycles consumed by one iteration of the delay loop.
    pub delay_slow_cycles: u32,
}

impl Default for ClockTiming {
    fn default() -> Self {
        Self {
            cpu_clock: 160_000_000,
            io_port_write_cycles: 72,
            delay_slow_cycles: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockDelay {
    pub fast: bool,
    pub slow_cycles: u32,
}

impl ClockDelay {
    /// Delay loop count to spend after each SWCLK/TCK edge.
    pub fn half_cycle(&self) -> u32 {
        if self.fast {
            DELAY_FAST_CYCLES
        } else {
            self.slow_cycles
        }
    }
}

impl ClockTiming {
    /// Highest SWJ clock reachable with `delay_cycles` loops per half period.
    pub fn max_swj_clock(&self, delay_cycles: u32) -> u32 {
        (self.cpu_clock / 2) / (self.io_port_write_cycles + delay_cycles)
    }

    /// Picks the smallest delay which keeps the generated clock at or below
    /// `frequency_hz`. Returns `None` for 0 Hz.
    pub fn clock_delay(&self, frequency_hz: u32) -> Option<ClockDelay> {
        if frequency_hz == 0 {
            return None;
        }
        if frequency_hz >= self.max_swj_clock(DELAY_FAST_CYCLES) {
            return Some(ClockDelay {
                fast: true,
                slow_cycles: 1,
            });
        }
        let half_period = self.cpu_clock / 2;
        let mut delay = (half_period + frequency_hz - 1) / frequency_hz;
        if delay > self.io_port_write_cycles {
            delay -= self.io_port_write_cycles;
            delay = (delay + self.delay_slow_cycles - 1) / self.delay_slow_cycles;
        } else {
            delay = 1;
        }
        Some(ClockDelay {
            fast: false,
            slow_cycles: delay,
        })
    }

    /// Frequency actually generated with `delay`.
    pub fn frequency(&self, delay: ClockDelay) -> u32 {
        let cycles = self.io_port_write_cycles + delay.half_cycle() * self.delay_slow_cycles;
        (self.cpu_clock / 2) / cycles
    }

    /// Delay loop count for a busy wait of `us` microseconds.
    pub fn delay_us_cycles(&self, us: u32) -> u32 {
        let cpu_mhz = (self.cpu_clock / 1_000_000) as u64;
        let loops = (cpu_mhz * us as u64 + self.delay_slow_cycles as u64 - 1)
            / self.delay_slow_cycles as u64;
        loops.min(u32::MAX as u64) as u32
    }

    pub fn default_delay(&self) -> ClockDelay {
        self.clock_delay(DEFAULT_SWJ_CLOCK_HZ).unwrap_or(ClockDelay {
            fast: true,
            slow_cycles: 1,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn one_megahertz_uses_slow_mode() {
        let timing = ClockTiming::default();
        let delay = timing.clock_delay(1_000_000).unwrap();
        assert!(!delay.fast);
        assert_eq!(delay.slow_cycles, 2);
        assert!(timing.frequency(delay) <= 1_000_000);
    }

    #[test]
    fn fast_mode_above_loop_boundary() {
        let timing = ClockTiming::default();
        let boundary = timing.max_swj_clock(DELAY_FAST_CYCLES);
        let delay = timing.clock_delay(boundary).unwrap();
        assert!(delay.fast);
        assert_eq!(delay.half_cycle(), DELAY_FAST_CYCLES);
        assert!(timing.frequency(delay) <= boundary);
        assert!(timing.clock_delay(boundary - 1).map(|d| !d.fast).unwrap());
    }

    #[test]
    fn zero_hertz_is_rejected() {
        assert_eq!(ClockTiming::default().clock_delay(0), None);
    }

    #[test]
    fn generated_clock_never_exceeds_request() {
        let timing = ClockTiming::default();
        let mut last_delay = 0;
        for frequency in (1_000..2_000_000).step_by(7_919) {
            let delay = timing.clock_delay(frequency).unwrap();
            assert!(timing.frequency(delay) <= frequency, "{} Hz", frequency);
            if !delay.fast {
                // Lower requests never get a shorter delay.
                if last_delay != 0 {
                    assert!(delay.slow_cycles <= last_delay);
                }
                last_delay = delay.slow_cycles;
            }
        }
    }

    #[test]
    fn microsecond_delay_rounds_up() {
        let timing = ClockTiming::default();
        assert_eq!(timing.delay_us_cycles(0), 0);
        assert_eq!(timing.delay_us_cycles(1), 32);
        let timing = ClockTiming {
            cpu_clock: 48_000_000,
            io_port_write_cycles: 2,
            delay_slow_cycles: 5,
        };
        assert_eq!(timing.delay_us_cycles(1), 10);
    }
}
