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

//! Bit-banged SWD engine.

use crate::bitbang::{BitBangIo, Pin, PinDirection};
use crate::clock::{ClockDelay, ClockTiming};
use crate::cmsis_dap::{
    SwdRequest, TransferError, DAP_TRANSFER_FAULT, DAP_TRANSFER_OK, DAP_TRANSFER_WAIT,
};

/// JTAG-to-SWD select sequence, sent LSB first.
pub const JTAG_TO_SWD_SELECT: u16 = 0xe79e;
/// Clocks with SWDIO high in one line reset. At least 50 are required.
pub const LINE_RESET_CLOCKS: usize = 56;
const LINE_RESET_IDLE_CLOCKS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SwdIoConfig {
    pub clock: ClockDelay,
    pub idle_cycles: u32,
    pub turn_around_cycles: u32,
    pub always_generate_data_phase: bool,
}

impl Default for SwdIoConfig {
    fn default() -> Self {
        Self {
            clock: ClockTiming::default().default_delay(),
            idle_cycles: 0,
            turn_around_cycles: 1,
            always_generate_data_phase: false,
        }
    }
}

pub trait PrimitiveSwdIo {
    fn swd_setup(&mut self);
    fn enable_output(&mut self);
    fn disable_output(&mut self);

    fn cycle_clock(&mut self, config: &SwdIoConfig);
    fn turn_around(&mut self, config: &SwdIoConfig);
    fn idle_cycle(&mut self, config: &SwdIoConfig);
    fn write_bit(&mut self, config: &SwdIoConfig, value: bool);
    fn read_bit(&mut self, config: &SwdIoConfig) -> bool;
    fn set_swdio(&mut self, value: bool);
}

impl<Io: BitBangIo> PrimitiveSwdIo for Io {
    fn swd_setup(&mut self) {
        self.set_direction(Pin::NReset, PinDirection::OpenDrainPullUp);
        self.set(Pin::SwclkTck, false);
        self.set_direction(Pin::SwclkTck, PinDirection::PushPull);
        self.set(Pin::SwdioTms, true);
        self.set_direction(Pin::SwdioTms, PinDirection::OpenDrainPullUp);
        self.set_direction(Pin::Tdi, PinDirection::Input);
        self.set_direction(Pin::NTrst, PinDirection::OpenDrainPullUp);
    }
    // SWDIO alternates between a push-pull driver and a pulled-up input.
    fn enable_output(&mut self) {
        self.set_direction(Pin::SwdioTms, PinDirection::PushPull);
    }
    fn disable_output(&mut self) {
        self.set_direction(Pin::SwdioTms, PinDirection::OpenDrainPullUp);
    }

    fn cycle_clock(&mut self, config: &SwdIoConfig) {
        self.set(Pin::SwclkTck, false);
        self.delay_half_cycle(config.clock.half_cycle());
        self.set(Pin::SwclkTck, true);
        self.delay_half_cycle(config.clock.half_cycle());
    }
    fn turn_around(&mut self, config: &SwdIoConfig) {
        for _ in 0..config.turn_around_cycles {
            self.cycle_clock(config);
        }
    }
    fn idle_cycle(&mut self, config: &SwdIoConfig) {
        for _ in 0..config.idle_cycles {
            self.write_bit(config, false);
        }
    }
    fn write_bit(&mut self, config: &SwdIoConfig, value: bool) {
        self.set(Pin::SwdioTms, value);
        self.set(Pin::SwclkTck, false);
        self.delay_half_cycle(config.clock.half_cycle());
        self.set(Pin::SwclkTck, true);
        self.delay_half_cycle(config.clock.half_cycle());
    }
    fn read_bit(&mut self, config: &SwdIoConfig) -> bool {
        self.set(Pin::SwclkTck, false);
        self.delay_half_cycle(config.clock.half_cycle());
        let value = self.read(Pin::SwdioTms);
        self.set(Pin::SwclkTck, true);
        self.delay_half_cycle(config.clock.half_cycle());
        value
    }
    fn set_swdio(&mut self, value: bool) {
        self.set(Pin::SwdioTms, value);
    }
}

pub trait SwdIo {
    /// Configures the pins for SWD and switches the target to SWD.
    fn swd_connect(&mut self, config: &SwdIoConfig);
    fn line_reset(&mut self, config: &SwdIoConfig);
    /// Drives `count` bits of `data` on SWDIO/TMS, LSB first.
    fn swj_sequence(&mut self, config: &SwdIoConfig, count: usize, data: &[u8]);
    fn swd_read_sequence(&mut self, config: &SwdIoConfig, count: usize, data: &mut [u8]);
    fn swd_write_sequence(&mut self, config: &SwdIoConfig, count: usize, data: &[u8]);
    fn swdio_output_enable(&mut self);
    /// One SWD packet: request, ACK and data phase.
    fn swd_transfer(
        &mut self,
        config: &SwdIoConfig,
        request: SwdRequest,
        data: u32,
    ) -> Result<u32, TransferError>;
}

impl<Io: PrimitiveSwdIo> SwdIo for Io {
    fn swd_connect(&mut self, config: &SwdIoConfig) {
        self.swd_setup();
        self.line_reset(config);
    }

    fn line_reset(&mut self, config: &SwdIoConfig) {
        self.set_swdio(true);
        self.enable_output();
        for _ in 0..LINE_RESET_CLOCKS {
            self.write_bit(config, true);
        }
        let mut select = JTAG_TO_SWD_SELECT;
        for _ in 0..16 {
            self.write_bit(config, select & 1 != 0);
            select >>= 1;
        }
        for _ in 0..LINE_RESET_CLOCKS {
            self.write_bit(config, true);
        }
        for _ in 0..LINE_RESET_IDLE_CLOCKS {
            self.write_bit(config, false);
        }
        self.set_swdio(true);
    }

    fn swj_sequence(&mut self, config: &SwdIoConfig, count: usize, data: &[u8]) {
        self.enable_output();
        let mut index = 0;
        let mut value = 0;
        let mut bits = 0;
        let mut count = count;

        while count > 0 {
            count -= 1;
            if bits == 0 {
                value = data.get(index).copied().unwrap_or(0);
                index += 1;
                bits = 8;
            }
            self.write_bit(config, value & 1 != 0);
            value >>= 1;
            bits -= 1;
        }
    }

    fn swd_read_sequence(&mut self, config: &SwdIoConfig, count: usize, data: &mut [u8]) {
        self.disable_output();
        let mut count = count;
        let mut index = 0;
        while count > 0 && index < data.len() {
            let mut value = 0;
            let mut bits = 8;
            while bits > 0 && count > 0 {
                bits -= 1;
                count -= 1;

                let bit_value = self.read_bit(config);
                value = if bit_value {
                    (value >> 1) | 0x80
                } else {
                    value >> 1
                };
            }
            value >>= bits;
            data[index] = value;
            index += 1;
        }
    }

    fn swd_write_sequence(&mut self, config: &SwdIoConfig, count: usize, data: &[u8]) {
        self.enable_output();
        let mut count = count;
        for &byte in data {
            if count == 0 {
                break;
            }
            let mut value = byte;
            let mut bits = 8;
            while bits > 0 && count > 0 {
                bits -= 1;
                count -= 1;

                self.write_bit(config, value & 1 != 0);
                value >>= 1;
            }
        }
    }

    fn swdio_output_enable(&mut self) {
        self.enable_output();
    }

    fn swd_transfer(
        &mut self,
        config: &SwdIoConfig,
        request: SwdRequest,
        data: u32,
    ) -> Result<u32, TransferError> {
        let read = request.contains(SwdRequest::RnW);

        // Request phase
        self.enable_output();
        {
            let mut parity = false;
            self.write_bit(config, true); // Start
            for flag in [SwdRequest::APnDP, SwdRequest::RnW, SwdRequest::A2, SwdRequest::A3] {
                let bit = request.contains(flag);
                self.write_bit(config, bit);
                parity ^= bit;
            }
            self.write_bit(config, parity);
            self.write_bit(config, false); // Stop
            self.write_bit(config, true); // Park
        }

        self.disable_output();
        self.turn_around(config);
        let mut ack = 0u8;
        for shift in 0..3 {
            if self.read_bit(config) {
                ack |= 1 << shift;
            }
        }

        if ack == DAP_TRANSFER_OK {
            let result = if read {
                let mut value = 0u32;
                let mut parity = false;
                for _ in 0..32 {
                    let bit = self.read_bit(config);
                    parity ^= bit;
                    value = (value >> 1) | if bit { 0x8000_0000 } else { 0 };
                }
                let parity_expected = self.read_bit(config);
                self.turn_around(config);
                self.enable_output();
                if parity == parity_expected {
                    Ok(value)
                } else {
                    Err(TransferError::Parity)
                }
            } else {
                self.turn_around(config);
                self.enable_output();
                let mut value = data;
                let mut parity = false;
                for _ in 0..32 {
                    let bit = value & 1 != 0;
                    self.write_bit(config, bit);
                    parity ^= bit;
                    value >>= 1;
                }
                self.write_bit(config, parity);
                Ok(0)
            };
            self.idle_cycle(config);
            self.set_swdio(true);
            return result;
        }

        if ack == DAP_TRANSFER_WAIT || ack == DAP_TRANSFER_FAULT {
            if config.always_generate_data_phase && read {
                for _ in 0..33 {
                    self.cycle_clock(config);
                }
            }
            self.turn_around(config);
            self.enable_output();
            if config.always_generate_data_phase && !read {
                for _ in 0..33 {
                    self.write_bit(config, false);
                }
            }
            if ack == DAP_TRANSFER_WAIT {
                self.idle_cycle(config);
            }
            self.set_swdio(true);
            return Err(TransferError::Ack(ack));
        }

        // Protocol error: let the target finish whatever it believes it is doing.
        for _ in 0..config.turn_around_cycles + 33 {
            self.cycle_clock(config);
        }
        self.enable_output();
        self.set_swdio(true);
        Err(TransferError::Ack(ack))
    }
}
