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

use std::time::{Duration, Instant};

use rust_dap::{BitBangIo, ClockTiming, DapPin, DelayFunc, Led, Pin, PinDirection};

/// Busy waits for the time the configured CPU would spend in the delay loop.
pub struct HostDelay {
    timing: ClockTiming,
    epoch: Instant,
}

impl HostDelay {
    pub fn new(timing: ClockTiming) -> Self {
        Self {
            timing,
            epoch: Instant::now(),
        }
    }

    fn duration(&self, cycles: u32) -> Duration {
        let cpu_cycles = cycles as u64 * self.timing.delay_slow_cycles as u64;
        Duration::from_nanos(cpu_cycles * 1_000_000_000 / self.timing.cpu_clock.max(1) as u64)
    }
}

impl DelayFunc for HostDelay {
    fn cycle_delay(&self, cycles: u32) {
        if cycles == 0 {
            return;
        }
        let deadline = Instant::now() + self.duration(cycles);
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
    fn timestamp(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }
}

/// Debug pins plus the two status LEDs.
pub struct Board<Io, L> {
    io: Io,
    connect_led: L,
    running_led: L,
}

impl<Io, L: DapPin> Board<Io, L> {
    pub fn new(io: Io, mut connect_led: L, mut running_led: L) -> Self {
        for led in [&mut connect_led, &mut running_led] {
            led.set(false);
            led.set_direction(PinDirection::PushPull);
        }
        Self {
            io,
            connect_led,
            running_led,
        }
    }
}

impl<Io: BitBangIo, L: DapPin> BitBangIo for Board<Io, L> {
    fn read(&mut self, pin: Pin) -> bool {
        self.io.read(pin)
    }
    fn set(&mut self, pin: Pin, level: bool) {
        self.io.set(pin, level)
    }
    fn set_direction(&mut self, pin: Pin, direction: PinDirection) {
        self.io.set_direction(pin, direction)
    }
    fn output_enable(&mut self, pin: Pin) {
        self.io.output_enable(pin)
    }
    fn output_disable(&mut self, pin: Pin) {
        self.io.output_disable(pin)
    }
    fn delay_half_cycle(&mut self, cycles: u32) {
        self.io.delay_half_cycle(cycles)
    }
    fn set_led(&mut self, led: Led, on: bool) {
        match led {
            Led::Connect => self.connect_led.set(on),
            Led::Running => self.running_led.set(on),
        }
    }
    fn reset_target(&mut self) -> bool {
        self.io.reset_target()
    }
    fn timestamp(&mut self) -> u32 {
        self.io.timestamp()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_dap::sim::SimTarget;
    use rust_dap::NoPin;

    #[test]
    fn delay_follows_timing() {
        let delay = HostDelay::new(ClockTiming {
            cpu_clock: 100_000_000,
            io_port_write_cycles: 72,
            delay_slow_cycles: 5,
        });
        assert_eq!(delay.duration(20_000), Duration::from_millis(1));
        let start = Instant::now();
        delay.cycle_delay(20_000);
        assert!(start.elapsed() >= Duration::from_millis(1));
        assert!(delay.timestamp() >= 1000);
    }

    #[test]
    fn board_passes_pins_through() {
        let mut board = Board::new(SimTarget::detached(), NoPin, NoPin);
        board.set(Pin::NReset, false);
        board.set_direction(Pin::NReset, PinDirection::PushPull);
        assert!(!board.read(Pin::NReset));
        board.output_disable(Pin::NReset);
        assert!(board.read(Pin::NReset));
        board.set_led(Led::Connect, true);
    }
}
