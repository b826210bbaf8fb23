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

//! Pin driver for bit-banged SWD and JTAG.
//!
//! The engines never touch hardware directly. They go through [`BitBangIo`],
//! which exposes six logical pins with level and direction control plus a
//! calibrated busy wait. Boards either implement [`BitBangIo`] themselves or
//! wrap embedded-hal pins in [`HalPin`] and collect them into a [`PinSet`].

use core::convert::Infallible;

use bitflags::bitflags;
use embedded_hal::digital::v2::{InputPin, IoPin, OutputPin, PinState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pin {
    SwclkTck,
    SwdioTms,
    Tdi,
    Tdo,
    NTrst,
    NReset,
}

impl Pin {
    pub const ALL: [Pin; 6] = [
        Pin::SwclkTck,
        Pin::SwdioTms,
        Pin::Tdi,
        Pin::Tdo,
        Pin::NTrst,
        Pin::NReset,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinDirection {
    /// High impedance input.
    Input,
    /// Push-pull output driving the last level passed to `set`.
    PushPull,
    /// Released open-drain line: input with pull-up until driven low.
    OpenDrainPullUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Led {
    Connect,
    Running,
}

// Bit 0: SWCLK/TCK
// Bit 1: SWDIO/TMS
// Bit 2: TDI
// Bit 3: TDO
// Bit 5: nTRST
// Bit 7: nRESET
// https://arm-software.github.io/CMSIS_5/DAP/html/group__DAP__SWJ__Pins.html
bitflags! {
    pub struct SwjPins: u8 {
        const TCK_SWDCLK = 1;
        const TMS_SWDIO = 1 << 1;
        const TDI = 1 << 2;
        const TDO = 1 << 3;
        const N_TRST = 1 << 5;
        const N_RESET = 1 << 7;
    }
}

impl SwjPins {
    pub fn from_pin(pin: Pin) -> Self {
        match pin {
            Pin::SwclkTck => Self::TCK_SWDCLK,
            Pin::SwdioTms => Self::TMS_SWDIO,
            Pin::Tdi => Self::TDI,
            Pin::Tdo => Self::TDO,
            Pin::NTrst => Self::N_TRST,
            Pin::NReset => Self::N_RESET,
        }
    }
}

/// Level and direction control of the six debug pins.
///
/// Every call takes effect on the wire before it returns. Implementations
/// must not log, allocate or fail; an implementation which cannot complete
/// an operation leaves the pin as it was.
pub trait BitBangIo {
    /// Samples the external line.
    fn read(&mut self, pin: Pin) -> bool;
    /// Sets the output level. Takes effect on the wire only while driving.
    fn set(&mut self, pin: Pin, level: bool);
    fn set_direction(&mut self, pin: Pin, direction: PinDirection);
    /// Starts driving the last level set on `pin`.
    fn output_enable(&mut self, pin: Pin);
    /// Stops driving `pin`, keeping its pull configuration.
    fn output_disable(&mut self, pin: Pin);
    /// Busy waits `cycles` delay loops. Monotonic in `cycles`.
    fn delay_half_cycle(&mut self, cycles: u32);

    fn set_led(&mut self, _led: Led, _on: bool) {}
    /// Device specific reset sequence. Returns `true` when one is implemented.
    fn reset_target(&mut self) -> bool {
        false
    }
    /// Test domain timer.
    fn timestamp(&mut self) -> u32 {
        0
    }
}

/// Drives an open-drain line: low asserts, high releases to the pull-up.
pub fn write_open_drain<Io: BitBangIo + ?Sized>(io: &mut Io, pin: Pin, level: bool) {
    if level {
        io.output_disable(pin);
    } else {
        io.set(pin, false);
        io.output_enable(pin);
    }
}

/// Puts every pin into high impedance. The reset lines keep their pull-ups.
pub fn port_off<Io: BitBangIo + ?Sized>(io: &mut Io) {
    for pin in Pin::ALL {
        let direction = match pin {
            Pin::NTrst | Pin::NReset => PinDirection::OpenDrainPullUp,
            _ => PinDirection::Input,
        };
        io.set_direction(pin, direction);
    }
}

/// Reads all six pins in `DAP_SWJ_Pins` layout.
pub fn read_swj_pins<Io: BitBangIo + ?Sized>(io: &mut Io) -> SwjPins {
    let mut pins = SwjPins::empty();
    for pin in Pin::ALL {
        if io.read(pin) {
            pins |= SwjPins::from_pin(pin);
        }
    }
    pins
}

pub trait DelayFunc {
    fn cycle_delay(&self, cycles: u32);
    fn timestamp(&self) -> u32 {
        0
    }
}

/// Delay loop made of spin hints. Calibrate `delay_slow_cycles` against it.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpinDelay;

impl DelayFunc for SpinDelay {
    fn cycle_delay(&self, cycles: u32) {
        for _ in 0..cycles {
            core::hint::spin_loop();
        }
    }
}

/// One debug pin of a [`PinSet`].
pub trait DapPin {
    fn read(&mut self) -> bool;
    fn set(&mut self, level: bool);
    fn set_direction(&mut self, direction: PinDirection);
    fn output_enable(&mut self);
    fn output_disable(&mut self);
}

/// Placeholder for pins a board does not wire. Reads as pulled up.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPin;

impl DapPin for NoPin {
    fn read(&mut self) -> bool {
        true
    }
    fn set(&mut self, _level: bool) {}
    fn set_direction(&mut self, _direction: PinDirection) {}
    fn output_enable(&mut self) {}
    fn output_disable(&mut self) {}
}

fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

/// embedded-hal pin which moves between its input and output types.
///
/// This is how MCU boards built on an embedded-hal crate feed their GPIOs
/// into a [`PinSet`]; hosted boards implement [`DapPin`] directly. The
/// pull-up of open-drain lines is expected on the board; this adapter only
/// switches between input and output.
pub struct HalPin<I, O> {
    input: Option<I>,
    output: Option<O>,
    level: bool,
}

impl<I, O> HalPin<I, O>
where
    I: InputPin + IoPin<I, O, Error = Infallible>,
    O: OutputPin + IoPin<I, O, Error = Infallible>,
{
    pub fn new(pin: I) -> Self {
        Self {
            input: Some(pin),
            output: None,
            level: true,
        }
    }

    fn to_input(&mut self) {
        if let Some(output) = self.output.take() {
            self.input = Some(infallible(output.into_input_pin()));
        }
    }

    fn to_output(&mut self) {
        if let Some(input) = self.input.take() {
            let state = if self.level {
                PinState::High
            } else {
                PinState::Low
            };
            self.output = Some(infallible(input.into_output_pin(state)));
        }
    }

    pub fn is_output(&self) -> bool {
        self.output.is_some()
    }
}

impl<I, O> DapPin for HalPin<I, O>
where
    I: InputPin + IoPin<I, O, Error = Infallible>,
    O: OutputPin + IoPin<I, O, Error = Infallible>,
{
    fn read(&mut self) -> bool {
        match (&self.input, &self.output) {
            (Some(input), _) => input.is_high().unwrap_or(false),
            (None, Some(_)) => self.level,
            (None, None) => false,
        }
    }
    fn set(&mut self, level: bool) {
        self.level = level;
        if let Some(output) = self.output.as_mut() {
            if level {
                output.set_high().ok();
            } else {
                output.set_low().ok();
            }
        }
    }
    fn set_direction(&mut self, direction: PinDirection) {
        match direction {
            PinDirection::Input | PinDirection::OpenDrainPullUp => self.to_input(),
            PinDirection::PushPull => self.to_output(),
        }
    }
    fn output_enable(&mut self) {
        self.to_output();
    }
    fn output_disable(&mut self) {
        self.to_input();
    }
}

/// The six debug pins of a board and its delay loop.
pub struct PinSet<Swclk, Swdio, Tdi, Tdo, Trst, Reset, Delay> {
    pub swclk: Swclk,
    pub swdio: Swdio,
    pub tdi: Tdi,
    pub tdo: Tdo,
    pub ntrst: Trst,
    pub nreset: Reset,
    pub delay: Delay,
}

macro_rules! with_pin {
    ($set:expr, $pin:expr, $p:ident => $body:expr) => {
        match $pin {
            Pin::SwclkTck => {
                let $p = &mut $set.swclk;
                $body
            }
            Pin::SwdioTms => {
                let $p = &mut $set.swdio;
                $body
            }
            Pin::Tdi => {
                let $p = &mut $set.tdi;
                $body
            }
            Pin::Tdo => {
                let $p = &mut $set.tdo;
                $body
            }
            Pin::NTrst => {
                let $p = &mut $set.ntrst;
                $body
            }
            Pin::NReset => {
                let $p = &mut $set.nreset;
                $body
            }
        }
    };
}

impl<Swclk, Swdio, Tdi, Tdo, Trst, Reset, Delay> BitBangIo
    for PinSet<Swclk, Swdio, Tdi, Tdo, Trst, Reset, Delay>
where
    Swclk: DapPin,
    Swdio: DapPin,
    Tdi: DapPin,
    Tdo: DapPin,
    Trst: DapPin,
    Reset: DapPin,
    Delay: DelayFunc,
{
    fn read(&mut self, pin: Pin) -> bool {
        with_pin!(self, pin, p => p.read())
    }
    fn set(&mut self, pin: Pin, level: bool) {
        with_pin!(self, pin, p => p.set(level))
    }
    fn set_direction(&mut self, pin: Pin, direction: PinDirection) {
        with_pin!(self, pin, p => p.set_direction(direction))
    }
    fn output_enable(&mut self, pin: Pin) {
        with_pin!(self, pin, p => p.output_enable())
    }
    fn output_disable(&mut self, pin: Pin) {
        with_pin!(self, pin, p => p.output_disable())
    }
    fn delay_half_cycle(&mut self, cycles: u32) {
        self.delay.cycle_delay(cycles);
    }
    fn timestamp(&mut self) -> u32 {
        self.delay.timestamp()
    }
}
