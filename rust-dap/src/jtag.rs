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

//! Bit-banged JTAG engine and JTAG-DP access.
//!
//! Device 0 of the scan chain is the device nearest TDI. Bits shifted first
//! end up in the devices nearest TDO, so an access to device `j` of `K`
//! shifts the padding for devices `j+1..K` first, then the target register,
//! then the padding for devices `0..j`.

use crate::bitbang::{write_open_drain, BitBangIo, Pin, PinDirection};
use crate::clock::{ClockDelay, ClockTiming};
use crate::cmsis_dap::{SwdRequest, TransferError, DAP_TRANSFER_OK};

pub const MAX_JTAG_DEVICES: usize = 8;

/// JTAG-DP instructions (4 bit IR).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum JtagInstruction {
    Abort = 0b1000,
    Dpacc = 0b1010,
    Apacc = 0b1011,
    Idcode = 0b1110,
    Bypass = 0b1111,
}

/// ACC data register: RnW, A[3:2] and 32 data bits.
pub const ACC_DR_BITS: usize = 35;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanChain {
    count: u8,
    ir_length: [u8; MAX_JTAG_DEVICES],
}

impl ScanChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the chain. Returns `false` and keeps the previous chain
    /// when more than [`MAX_JTAG_DEVICES`] are given.
    pub fn configure(&mut self, ir_length: &[u8]) -> bool {
        if ir_length.len() > MAX_JTAG_DEVICES {
            return false;
        }
        self.ir_length = [0; MAX_JTAG_DEVICES];
        self.ir_length[..ir_length.len()].copy_from_slice(ir_length);
        self.count = ir_length.len() as u8;
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn ir_lengths(&self) -> &[u8] {
        &self.ir_length[..self.count as usize]
    }

    pub fn contains(&self, index: u8) -> bool {
        index < self.count
    }

    /// IR bits shifted before the IR of `index`.
    fn ir_leading(&self, index: u8) -> usize {
        self.ir_lengths()
            .iter()
            .skip(index as usize + 1)
            .map(|length| *length as usize)
            .sum()
    }

    /// IR bits shifted after the IR of `index`.
    fn ir_trailing(&self, index: u8) -> usize {
        self.ir_lengths()
            .iter()
            .take(index as usize)
            .map(|length| *length as usize)
            .sum()
    }

    fn ir_length_of(&self, index: u8) -> usize {
        self.ir_length[index as usize] as usize
    }

    /// Bypass bits shifted before the DR of `index`.
    fn dr_leading(&self, index: u8) -> usize {
        (self.count as usize).saturating_sub(index as usize + 1)
    }

    /// Bypass bits shifted after the DR of `index`.
    fn dr_trailing(&self, index: u8) -> usize {
        index as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JtagIoConfig {
    pub clock: ClockDelay,
    pub idle_cycles: u32,
    pub chain: ScanChain,
    /// Delay loops nTRST is held low on connect.
    pub reset_hold_cycles: u32,
}

impl Default for JtagIoConfig {
    fn default() -> Self {
        let timing = ClockTiming::default();
        Self {
            clock: timing.default_delay(),
            idle_cycles: 0,
            chain: ScanChain::new(),
            reset_hold_cycles: timing.delay_us_cycles(100),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JtagSequenceInfo {
    pub number_of_tck_cycles: usize,
    pub tms_value: bool,
    pub tdo_capture: bool,
}

impl From<u8> for JtagSequenceInfo {
    fn from(sequence_info: u8) -> Self {
        JtagSequenceInfo {
            tdo_capture: (sequence_info & (1 << 7)) != 0,
            tms_value: (sequence_info & (1 << 6)) != 0,
            number_of_tck_cycles: if sequence_info & 0b0011_1111 == 0 {
                64
            } else {
                (sequence_info & 0x3f) as usize
            },
        }
    }
}

pub trait PrimitiveJtagIo {
    fn jtag_setup(&mut self);
    fn write_bit(&mut self, config: &JtagIoConfig, tms: bool, tdi: bool);
    fn read_bit(&mut self, config: &JtagIoConfig, tms: bool, tdi: bool) -> bool;
}

impl<Io: BitBangIo> PrimitiveJtagIo for Io {
    fn jtag_setup(&mut self) {
        for pin in [Pin::SwclkTck, Pin::SwdioTms, Pin::Tdi] {
            self.set(pin, true);
            self.set_direction(pin, PinDirection::PushPull);
        }
        self.set_direction(Pin::Tdo, PinDirection::Input);
        self.set_direction(Pin::NTrst, PinDirection::OpenDrainPullUp);
        self.set_direction(Pin::NReset, PinDirection::OpenDrainPullUp);
    }

    fn write_bit(&mut self, config: &JtagIoConfig, tms: bool, tdi: bool) {
        self.set(Pin::SwdioTms, tms);
        self.set(Pin::Tdi, tdi);
        self.set(Pin::SwclkTck, false);
        self.delay_half_cycle(config.clock.half_cycle());
        self.set(Pin::SwclkTck, true);
        self.delay_half_cycle(config.clock.half_cycle());
    }

    fn read_bit(&mut self, config: &JtagIoConfig, tms: bool, tdi: bool) -> bool {
        self.set(Pin::SwdioTms, tms);
        self.set(Pin::Tdi, tdi);
        self.set(Pin::SwclkTck, false);
        self.delay_half_cycle(config.clock.half_cycle());
        let value = self.read(Pin::Tdo);
        self.set(Pin::SwclkTck, true);
        self.delay_half_cycle(config.clock.half_cycle());
        value
    }
}

pub trait JtagIo {
    /// Configures the pins, pulses nTRST and parks the TAP in Run-Test/Idle.
    fn jtag_connect(&mut self, config: &JtagIoConfig);
    /// Test-Logic-Reset, then Run-Test/Idle.
    fn jtag_reset(&mut self, config: &JtagIoConfig);
    fn jtag_ntrst_pulse(&mut self, config: &JtagIoConfig);
    /// Drives `count` bits of `data` on TMS, LSB first, with TDI high.
    fn jtag_tms_sequence(&mut self, config: &JtagIoConfig, count: usize, data: &[u8]);
    /// Raw TCK cycles with a constant TMS. Returns the TDO bits when captured.
    fn jtag_sequence(&mut self, config: &JtagIoConfig, info: &JtagSequenceInfo, tdi: u64) -> u64;
    /// Shifts `ir` into device `index` and BYPASS into the others.
    fn jtag_write_ir(
        &mut self,
        config: &JtagIoConfig,
        index: u8,
        ir: JtagInstruction,
    ) -> Result<(), TransferError>;
    /// Shifts `bits` bits of `dr` through device `index` and returns what
    /// the device shifted out.
    fn jtag_scan_dr(&mut self, config: &JtagIoConfig, index: u8, dr: u64, bits: usize) -> u64;
    /// One DPACC/APACC access. The IR must already hold the matching
    /// instruction. Reads return the result of the previous access.
    fn jtag_transfer(
        &mut self,
        config: &JtagIoConfig,
        index: u8,
        request: SwdRequest,
        data: u32,
    ) -> Result<u32, TransferError>;
    fn jtag_idcode(&mut self, config: &JtagIoConfig, index: u8) -> Result<u32, TransferError>;
    fn jtag_write_abort(
        &mut self,
        config: &JtagIoConfig,
        index: u8,
        data: u32,
    ) -> Result<(), TransferError>;
}

impl<Io: BitBangIo> JtagIo for Io {
    fn jtag_connect(&mut self, config: &JtagIoConfig) {
        self.jtag_setup();
        self.jtag_ntrst_pulse(config);
        self.jtag_reset(config);
    }

    fn jtag_reset(&mut self, config: &JtagIoConfig) {
        for _ in 0..6 {
            self.write_bit(config, true, true);
        }
        self.write_bit(config, false, true);
    }

    fn jtag_ntrst_pulse(&mut self, config: &JtagIoConfig) {
        write_open_drain(self, Pin::NTrst, false);
        self.delay_half_cycle(config.reset_hold_cycles);
        write_open_drain(self, Pin::NTrst, true);
        self.delay_half_cycle(config.reset_hold_cycles);
    }

    fn jtag_tms_sequence(&mut self, config: &JtagIoConfig, count: usize, data: &[u8]) {
        for bit in 0..count {
            let value = data.get(bit / 8).map_or(false, |byte| byte & (1 << (bit % 8)) != 0);
            self.write_bit(config, value, true);
        }
    }

    fn jtag_sequence(&mut self, config: &JtagIoConfig, info: &JtagSequenceInfo, tdi: u64) -> u64 {
        let mut tdo = 0u64;
        for bit in 0..info.number_of_tck_cycles.min(64) {
            let tdi_bit = tdi & (1 << bit) != 0;
            if info.tdo_capture {
                if self.read_bit(config, info.tms_value, tdi_bit) {
                    tdo |= 1 << bit;
                }
            } else {
                self.write_bit(config, info.tms_value, tdi_bit);
            }
        }
        tdo
    }

    fn jtag_write_ir(
        &mut self,
        config: &JtagIoConfig,
        index: u8,
        ir: JtagInstruction,
    ) -> Result<(), TransferError> {
        let chain = &config.chain;
        if !chain.contains(index) {
            return Err(TransferError::Protocol);
        }
        // Run-Test/Idle -> Shift-IR
        self.write_bit(config, true, true); // Select-DR-Scan
        self.write_bit(config, true, true); // Select-IR-Scan
        self.write_bit(config, false, true); // Capture-IR
        self.write_bit(config, false, true); // Shift-IR

        let leading = chain.ir_leading(index);
        let length = chain.ir_length_of(index);
        let total = leading + length + chain.ir_trailing(index);
        let mut captured = 0u32;
        let mut ir = ir as u32;
        for position in 0..total {
            let last = position + 1 == total;
            if position < leading || position >= leading + length {
                self.write_bit(config, last, true);
            } else {
                let offset = position - leading;
                if self.read_bit(config, last, ir & 1 != 0) && offset < 32 {
                    captured |= 1 << offset;
                }
                ir >>= 1;
            }
        }

        // Exit1-IR -> Update-IR -> Run-Test/Idle
        self.write_bit(config, true, true);
        self.write_bit(config, false, true);

        if length >= 2 && captured & 0b11 != 0b01 {
            return Err(TransferError::Protocol);
        }
        Ok(())
    }

    fn jtag_scan_dr(&mut self, config: &JtagIoConfig, index: u8, dr: u64, bits: usize) -> u64 {
        let chain = &config.chain;
        // Run-Test/Idle -> Shift-DR
        self.write_bit(config, true, false); // Select-DR-Scan
        self.write_bit(config, false, false); // Capture-DR
        self.write_bit(config, false, false); // Shift-DR

        let leading = chain.dr_leading(index);
        let total = leading + bits + chain.dr_trailing(index);
        let mut captured = 0u64;
        let mut dr = dr;
        for position in 0..total {
            let last = position + 1 == total;
            if position < leading || position >= leading + bits {
                self.write_bit(config, last, false);
            } else {
                if self.read_bit(config, last, dr & 1 != 0) {
                    captured |= 1 << (position - leading);
                }
                dr >>= 1;
            }
        }

        // Exit1-DR -> Update-DR -> Run-Test/Idle
        self.write_bit(config, true, false);
        self.write_bit(config, false, false);
        captured
    }

    fn jtag_transfer(
        &mut self,
        config: &JtagIoConfig,
        index: u8,
        request: SwdRequest,
        data: u32,
    ) -> Result<u32, TransferError> {
        let dr = build_acc(request, data);
        let captured = self.jtag_scan_dr(config, index, dr, ACC_DR_BITS);
        for _ in 0..config.idle_cycles {
            self.write_bit(config, false, false);
        }

        let ack = convert_ack(captured as u8 & 0b111);
        if ack != DAP_TRANSFER_OK {
            return Err(TransferError::Ack(ack));
        }
        Ok((captured >> 3) as u32)
    }

    fn jtag_idcode(&mut self, config: &JtagIoConfig, index: u8) -> Result<u32, TransferError> {
        self.jtag_write_ir(config, index, JtagInstruction::Idcode)?;
        Ok(self.jtag_scan_dr(config, index, 0, 32) as u32)
    }

    fn jtag_write_abort(
        &mut self,
        config: &JtagIoConfig,
        index: u8,
        data: u32,
    ) -> Result<(), TransferError> {
        self.jtag_write_ir(config, index, JtagInstruction::Abort)?;
        self.jtag_scan_dr(config, index, build_acc(SwdRequest::empty(), data), ACC_DR_BITS);
        Ok(())
    }
}

/// Packs an ACC register value: RnW, A2, A3, then data LSB first.
pub fn build_acc(request: SwdRequest, data: u32) -> u64 {
    let mut dr = (data as u64) << 3;
    if request.contains(SwdRequest::RnW) {
        dr |= 0b001;
    }
    if request.contains(SwdRequest::A2) {
        dr |= 0b010;
    }
    if request.contains(SwdRequest::A3) {
        dr |= 0b100;
    }
    dr
}

/// Converts the 3 bit JTAG-DP ACK (OK/FAULT = 0b010, WAIT = 0b001) to the
/// SWD encoding used in transfer responses.
pub fn convert_ack(ack: u8) -> u8 {
    let b0 = ack & 1;
    let b1 = (ack >> 1) & 1;
    let b2 = (ack >> 2) & 1;
    (b0 << 1) | b1 | (b2 << 2)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chain_padding_around_target() {
        let mut chain = ScanChain::new();
        assert!(chain.configure(&[4, 5, 7]));
        assert_eq!(chain.ir_leading(0), 12);
        assert_eq!(chain.ir_trailing(0), 0);
        assert_eq!(chain.ir_leading(1), 7);
        assert_eq!(chain.ir_trailing(1), 4);
        assert_eq!(chain.ir_leading(2), 0);
        assert_eq!(chain.ir_trailing(2), 9);
        assert_eq!(chain.dr_leading(0), 2);
        assert_eq!(chain.dr_trailing(0), 0);
        assert_eq!(chain.dr_leading(2), 0);
        assert_eq!(chain.dr_trailing(2), 2);
        assert!(chain.contains(2));
        assert!(!chain.contains(3));
    }

    #[test]
    fn oversized_chain_is_rejected() {
        let mut chain = ScanChain::new();
        assert!(chain.configure(&[4, 4]));
        assert!(!chain.configure(&[4; MAX_JTAG_DEVICES + 1]));
        assert_eq!(chain.ir_lengths(), &[4, 4]);
        chain.reset();
        assert_eq!(chain.count(), 0);
    }

    #[test]
    fn acc_register_layout() {
        let request = SwdRequest::RnW | SwdRequest::A3;
        assert_eq!(build_acc(request, 0x8000_0001), 0b101 | (0x8000_0001u64 << 3));
        assert_eq!(build_acc(SwdRequest::A2, 0), 0b010);
    }

    #[test]
    fn ack_conversion() {
        assert_eq!(convert_ack(0b010), DAP_TRANSFER_OK);
        assert_eq!(convert_ack(0b001), crate::cmsis_dap::DAP_TRANSFER_WAIT);
        assert_eq!(convert_ack(0b111), 0b111);
    }

    #[test]
    fn sequence_info_decoding() {
        let info = JtagSequenceInfo::from(0xc0);
        assert!(info.tdo_capture);
        assert!(info.tms_value);
        assert_eq!(info.number_of_tck_cycles, 64);
        let info = JtagSequenceInfo::from(0x05);
        assert!(!info.tdo_capture);
        assert_eq!(info.number_of_tck_cycles, 5);
    }
}
