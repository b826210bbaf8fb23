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

//! Bit-level debug target simulator.
//!
//! [`SimTarget`] implements [`BitBangIo`] and reacts to the pins the way a
//! Cortex-M debug port would: an SWD state machine clocked on SWCLK rising
//! edges, or a JTAG scan chain whose DAP device exposes the same DP and
//! MEM-AP registers. Delays advance a virtual CPU cycle counter instead of
//! spinning, so clock rates can be measured exactly.

use crate::bitbang::{BitBangIo, Led, Pin, PinDirection};
use crate::clock::ClockTiming;
use crate::cmsis_dap::{DAP_TRANSFER_FAULT, DAP_TRANSFER_OK, DAP_TRANSFER_WAIT};
use crate::jtag::JtagInstruction;

pub const SIM_DPIDR: u32 = 0x0bc1_1477;
pub const SIM_JTAG_IDCODE: u32 = 0x4ba0_0477;
pub const SIM_AHB_AP_IDR: u32 = 0x2477_0011;
pub const SIM_MEMORY_BASE: u32 = 0x2000_0000;
pub const SIM_MEMORY_WORDS: usize = 1024;

const CTRL_STAT_STICKYERR: u32 = 1 << 5;
const CTRL_STAT_CDBGPWRUPREQ: u32 = 1 << 28;
const CTRL_STAT_CSYSPWRUPREQ: u32 = 1 << 30;
const ABORT_STKERRCLR: u32 = 1 << 2;
const CSW_ADDR_INC_SINGLE: u32 = 0b01 << 4;

/// Consecutive host-driven ones which reset the SWD line.
const SWD_LINE_RESET_ONES: u32 = 50;

/// DP registers and one MEM-AP in front of a word addressed RAM.
#[derive(Clone, Debug)]
pub struct DebugPort {
    ctrl_stat: u32,
    select: u32,
    csw: u32,
    tar: u32,
    memory: Vec<u32>,
}

impl Default for DebugPort {
    fn default() -> Self {
        Self {
            ctrl_stat: 0,
            select: 0,
            csw: 0x0300_0002,
            tar: 0,
            memory: vec![0; SIM_MEMORY_WORDS],
        }
    }
}

impl DebugPort {
    pub fn sticky_error(&self) -> bool {
        self.ctrl_stat & CTRL_STAT_STICKYERR != 0
    }

    pub fn ctrl_stat(&self) -> u32 {
        self.ctrl_stat
    }

    pub fn select(&self) -> u32 {
        self.select
    }

    pub fn memory(&self, address: u32) -> Option<u32> {
        self.word_index(address).map(|index| self.memory[index])
    }

    pub fn set_memory(&mut self, address: u32, value: u32) {
        if let Some(index) = self.word_index(address) {
            self.memory[index] = value;
        }
    }

    fn word_index(&self, address: u32) -> Option<usize> {
        let offset = address.checked_sub(SIM_MEMORY_BASE)? as usize / 4;
        (offset < self.memory.len()).then(|| offset)
    }

    fn read_dp(&mut self, address: u8) -> u32 {
        match address {
            0x0 => SIM_DPIDR,
            0x4 => self.ctrl_stat,
            _ => 0,
        }
    }

    fn write_dp(&mut self, address: u8, value: u32) {
        match address {
            0x0 => {
                if value & ABORT_STKERRCLR != 0 {
                    self.ctrl_stat &= !CTRL_STAT_STICKYERR;
                }
            }
            0x4 => {
                let requests = value & (CTRL_STAT_CDBGPWRUPREQ | CTRL_STAT_CSYSPWRUPREQ);
                // Power domains acknowledge immediately.
                self.ctrl_stat = requests | (requests << 1) | (self.ctrl_stat & CTRL_STAT_STICKYERR);
            }
            0x8 => self.select = value,
            _ => {}
        }
    }

    fn ap_register(&self, address: u8) -> Option<u8> {
        if self.select >> 24 != 0 {
            return None;
        }
        Some((self.select & 0xf0) as u8 | address)
    }

    fn advance_tar(&mut self) {
        if self.csw & (0b11 << 4) == CSW_ADDR_INC_SINGLE {
            self.tar = self.tar.wrapping_add(4);
        }
    }

    fn read_ap(&mut self, address: u8) -> u32 {
        match self.ap_register(address) {
            Some(0x00) => self.csw,
            Some(0x04) => self.tar,
            Some(0x0c) => {
                let value = match self.word_index(self.tar) {
                    Some(index) => self.memory[index],
                    None => {
                        self.ctrl_stat |= CTRL_STAT_STICKYERR;
                        0
                    }
                };
                self.advance_tar();
                value
            }
            Some(0xfc) => SIM_AHB_AP_IDR,
            _ => 0,
        }
    }

    fn write_ap(&mut self, address: u8, value: u32) {
        match self.ap_register(address) {
            Some(0x00) => self.csw = value,
            Some(0x04) => self.tar = value,
            Some(0x0c) => {
                match self.word_index(self.tar) {
                    Some(index) => self.memory[index] = value,
                    None => self.ctrl_stat |= CTRL_STAT_STICKYERR,
                }
                self.advance_tar();
            }
            _ => {}
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AfterAck {
    Read(u64),
    Write { ap: bool, address: u8 },
    Idle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SwdNext {
    Ack(u8, AfterAck),
    WriteData { ap: bool, address: u8 },
    Idle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SwdState {
    Reset,
    Idle,
    Request { bits: u8, count: u8 },
    Turnaround { remaining: u32, next: SwdNext },
    Ack { ack: u8, bit: u8, after: AfterAck },
    ReadData { value: u64, bit: u8 },
    WriteData { ap: bool, address: u8, value: u64, bit: u8 },
}

/// SW-DP wire protocol.
#[derive(Clone, Debug)]
pub struct SwdTarget {
    state: SwdState,
    ones: u32,
    drive: Option<bool>,
    rdbuff: u32,
    requests: u32,
    line_resets: u32,
    /// Turnaround period the target expects.
    pub turnaround: u32,
    /// Number of requests answered with WAIT before the next OK.
    pub wait_count: u32,
    pub always_wait: bool,
    /// Answers every AP request with FAULT.
    pub fault: bool,
    /// Flips the parity bit of the next read.
    pub corrupt_parity: bool,
}

impl Default for SwdTarget {
    fn default() -> Self {
        Self {
            state: SwdState::Reset,
            ones: 0,
            drive: None,
            rdbuff: 0,
            requests: 0,
            line_resets: 0,
            turnaround: 1,
            wait_count: 0,
            always_wait: false,
            fault: false,
            corrupt_parity: false,
        }
    }
}

impl SwdTarget {
    /// Valid requests decoded so far.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn line_resets(&self) -> u32 {
        self.line_resets
    }

    fn enter(&mut self, next: SwdNext) -> SwdState {
        match next {
            SwdNext::Ack(ack, after) => {
                self.drive = Some(ack & 1 != 0);
                SwdState::Ack { ack, bit: 0, after }
            }
            SwdNext::WriteData { ap, address } => {
                self.drive = None;
                SwdState::WriteData {
                    ap,
                    address,
                    value: 0,
                    bit: 0,
                }
            }
            SwdNext::Idle => {
                self.drive = None;
                SwdState::Idle
            }
        }
    }

    fn turnaround_to(&mut self, next: SwdNext) -> SwdState {
        self.drive = None;
        SwdState::Turnaround {
            remaining: self.turnaround.max(1),
            next,
        }
    }

    fn decode(&mut self, bits: u8, dp: &mut DebugPort) -> SwdState {
        let header = bits & 0x0f;
        let parity = (bits >> 4) & 1;
        let stop = (bits >> 5) & 1;
        let park = (bits >> 6) & 1;
        if parity as u32 != header.count_ones() & 1 || stop != 0 || park != 1 {
            self.drive = None;
            return SwdState::Idle;
        }
        self.requests += 1;

        let ap = header & 0b0001 != 0;
        let read = header & 0b0010 != 0;
        let address = header & 0b1100;
        let ack = if self.always_wait || self.wait_count > 0 {
            self.wait_count = self.wait_count.saturating_sub(1);
            DAP_TRANSFER_WAIT
        } else if ap && (self.fault || dp.sticky_error()) {
            DAP_TRANSFER_FAULT
        } else {
            DAP_TRANSFER_OK
        };

        let after = if ack != DAP_TRANSFER_OK {
            AfterAck::Idle
        } else if read {
            let value = match (ap, address) {
                (false, 0xc) => self.rdbuff,
                (false, address) => dp.read_dp(address),
                (true, address) => {
                    let posted = self.rdbuff;
                    self.rdbuff = dp.read_ap(address);
                    posted
                }
            };
            let mut parity = value.count_ones() & 1;
            if self.corrupt_parity {
                self.corrupt_parity = false;
                parity ^= 1;
            }
            AfterAck::Read(value as u64 | (parity as u64) << 32)
        } else {
            AfterAck::Write { ap, address }
        };
        self.turnaround_to(SwdNext::Ack(ack, after))
    }

    fn clock(&mut self, host: Option<bool>, dp: &mut DebugPort) {
        if host == Some(true) {
            self.ones += 1;
        } else {
            self.ones = 0;
        }
        if self.ones >= SWD_LINE_RESET_ONES {
            if self.state != SwdState::Reset {
                self.line_resets += 1;
            }
            self.state = SwdState::Reset;
            self.drive = None;
            return;
        }

        let state = self.state;
        self.state = match state {
            SwdState::Reset => match host {
                Some(false) => SwdState::Idle,
                _ => SwdState::Reset,
            },
            SwdState::Idle => match host {
                Some(true) => SwdState::Request { bits: 0, count: 0 },
                _ => SwdState::Idle,
            },
            SwdState::Request { bits, count } => match host {
                Some(bit) => {
                    let bits = bits | (bit as u8) << count;
                    if count + 1 < 7 {
                        SwdState::Request {
                            bits,
                            count: count + 1,
                        }
                    } else {
                        self.decode(bits, dp)
                    }
                }
                None => SwdState::Idle,
            },
            SwdState::Turnaround { remaining, next } => {
                if remaining > 1 {
                    SwdState::Turnaround {
                        remaining: remaining - 1,
                        next,
                    }
                } else {
                    self.enter(next)
                }
            }
            SwdState::Ack { ack, bit, after } => {
                if bit + 1 < 3 {
                    self.drive = Some(ack >> (bit + 1) & 1 != 0);
                    SwdState::Ack {
                        ack,
                        bit: bit + 1,
                        after,
                    }
                } else {
                    match after {
                        AfterAck::Read(value) => {
                            self.drive = Some(value & 1 != 0);
                            SwdState::ReadData { value, bit: 0 }
                        }
                        AfterAck::Write { ap, address } => {
                            self.turnaround_to(SwdNext::WriteData { ap, address })
                        }
                        AfterAck::Idle => self.turnaround_to(SwdNext::Idle),
                    }
                }
            }
            SwdState::ReadData { value, bit } => {
                if bit + 1 < 33 {
                    self.drive = Some(value >> (bit + 1) & 1 != 0);
                    SwdState::ReadData {
                        value,
                        bit: bit + 1,
                    }
                } else {
                    self.turnaround_to(SwdNext::Idle)
                }
            }
            SwdState::WriteData {
                ap,
                address,
                value,
                bit,
            } => match host {
                Some(level) => {
                    let value = value | (level as u64) << bit;
                    if bit + 1 < 33 {
                        SwdState::WriteData {
                            ap,
                            address,
                            value,
                            bit: bit + 1,
                        }
                    } else {
                        let data = value as u32;
                        if (value >> 32) as u32 == data.count_ones() & 1 {
                            if ap {
                                dp.write_ap(address, data);
                            } else {
                                dp.write_dp(address, data);
                            }
                        }
                        SwdState::Idle
                    }
                }
                None => SwdState::Idle,
            },
        };
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    pub fn next(self, tms: bool) -> Self {
        use TapState::*;
        match (self, tms) {
            (TestLogicReset, true) => TestLogicReset,
            (TestLogicReset, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDrScan,
            (RunTestIdle, false) => RunTestIdle,
            (SelectDrScan, true) => SelectIrScan,
            (SelectDrScan, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => UpdateDr,
            (Exit2Dr, false) => ShiftDr,
            (UpdateDr, true) => SelectDrScan,
            (UpdateDr, false) => RunTestIdle,
            (SelectIrScan, true) => TestLogicReset,
            (SelectIrScan, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => UpdateIr,
            (Exit2Ir, false) => ShiftIr,
            (UpdateIr, true) => SelectDrScan,
            (UpdateIr, false) => RunTestIdle,
        }
    }
}

/// One TAP of the simulated scan chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JtagDevice {
    pub ir_length: u8,
    pub idcode: u32,
    /// Routes DPACC, APACC and ABORT to the debug port.
    pub is_dap: bool,
}

impl JtagDevice {
    pub fn dap() -> Self {
        Self {
            ir_length: 4,
            idcode: SIM_JTAG_IDCODE,
            is_dap: true,
        }
    }

    pub fn other(ir_length: u8, idcode: u32) -> Self {
        Self {
            ir_length,
            idcode,
            is_dap: false,
        }
    }
}

#[derive(Clone, Debug)]
struct Tap {
    device: JtagDevice,
    ir: u32,
    shift: u64,
    length: usize,
    /// The access captured in this scan answered WAIT.
    busy: bool,
}

impl Tap {
    fn new(device: JtagDevice) -> Self {
        Self {
            device,
            ir: JtagInstruction::Idcode as u32,
            shift: 0,
            length: 1,
            busy: false,
        }
    }

    fn ir_mask(&self) -> u32 {
        ((1u64 << self.device.ir_length) - 1) as u32
    }

    fn instruction(&self) -> Option<JtagInstruction> {
        if self.ir == self.ir_mask() {
            return Some(JtagInstruction::Bypass);
        }
        match self.ir {
            0b1110 => Some(JtagInstruction::Idcode),
            0b1000 if self.device.is_dap => Some(JtagInstruction::Abort),
            0b1010 if self.device.is_dap => Some(JtagInstruction::Dpacc),
            0b1011 if self.device.is_dap => Some(JtagInstruction::Apacc),
            _ => None,
        }
    }

    fn shift_bit(&mut self, tdi: bool) -> bool {
        let out = self.shift & 1 != 0;
        self.shift = (self.shift >> 1) | (tdi as u64) << (self.length - 1);
        out
    }
}

/// JTAG scan chain. Device 0 is connected to TDI.
#[derive(Clone, Debug)]
pub struct JtagChain {
    state: TapState,
    taps: Vec<Tap>,
    /// Result of the last DPACC/APACC access, returned by the next capture.
    result: u32,
    ir_updates: u32,
    /// Number of accesses answered with WAIT before the next OK.
    pub wait_count: u32,
}

impl JtagChain {
    pub fn new(devices: &[JtagDevice]) -> Self {
        Self {
            state: TapState::TestLogicReset,
            taps: devices.iter().copied().map(Tap::new).collect(),
            result: 0,
            ir_updates: 0,
            wait_count: 0,
        }
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    /// Update-IR passes seen so far.
    pub fn ir_updates(&self) -> u32 {
        self.ir_updates
    }

    pub fn instruction(&self, index: usize) -> Option<u32> {
        self.taps.get(index).map(|tap| tap.ir)
    }

    fn reset(&mut self) {
        self.state = TapState::TestLogicReset;
        for tap in self.taps.iter_mut() {
            tap.ir = JtagInstruction::Idcode as u32;
        }
    }

    fn tdo(&self) -> Option<bool> {
        match self.state {
            TapState::ShiftDr | TapState::ShiftIr => self.taps.last().map(|tap| tap.shift & 1 != 0),
            _ => None,
        }
    }

    fn capture_dr(&mut self) {
        let result = self.result;
        let mut wait_count = self.wait_count;
        for tap in self.taps.iter_mut() {
            tap.busy = false;
            match tap.instruction() {
                Some(JtagInstruction::Idcode) => {
                    tap.shift = tap.device.idcode as u64;
                    tap.length = 32;
                }
                Some(JtagInstruction::Dpacc) | Some(JtagInstruction::Apacc) => {
                    let ack = if wait_count > 0 {
                        wait_count -= 1;
                        tap.busy = true;
                        0b001
                    } else {
                        0b010
                    };
                    tap.shift = (result as u64) << 3 | ack;
                    tap.length = 35;
                }
                Some(JtagInstruction::Abort) => {
                    tap.shift = 0;
                    tap.length = 35;
                }
                _ => {
                    tap.shift = 0;
                    tap.length = 1;
                }
            }
        }
        self.wait_count = wait_count;
    }

    fn capture_ir(&mut self) {
        for tap in self.taps.iter_mut() {
            tap.shift = 0b01;
            tap.length = tap.device.ir_length as usize;
        }
    }

    fn shift(&mut self, tdi: bool) {
        let mut carry = tdi;
        for tap in self.taps.iter_mut() {
            carry = tap.shift_bit(carry);
        }
    }

    fn update_dr(&mut self, dp: &mut DebugPort) {
        for index in 0..self.taps.len() {
            let tap = &self.taps[index];
            if tap.busy {
                continue;
            }
            let read = tap.shift & 1 != 0;
            let address = ((tap.shift >> 1) & 0b11) as u8 * 4;
            let data = (tap.shift >> 3) as u32;
            match tap.instruction() {
                Some(JtagInstruction::Dpacc) => {
                    if read {
                        // RDBUFF only hands out the previous result.
                        self.result = if address == 0xc { 0 } else { dp.read_dp(address) };
                    } else {
                        dp.write_dp(address, data);
                    }
                }
                Some(JtagInstruction::Apacc) => {
                    if read {
                        self.result = dp.read_ap(address);
                    } else {
                        dp.write_ap(address, data);
                    }
                }
                Some(JtagInstruction::Abort) => dp.write_dp(0, data),
                _ => {}
            }
        }
    }

    fn update_ir(&mut self) {
        self.ir_updates += 1;
        for tap in self.taps.iter_mut() {
            tap.ir = tap.shift as u32 & tap.ir_mask();
        }
    }

    fn clock(&mut self, tms: bool, tdi: bool, dp: &mut DebugPort) {
        match self.state {
            TapState::CaptureDr => self.capture_dr(),
            TapState::CaptureIr => self.capture_ir(),
            TapState::ShiftDr | TapState::ShiftIr => self.shift(tdi),
            TapState::UpdateDr => self.update_dr(dp),
            TapState::UpdateIr => self.update_ir(),
            _ => {}
        }
        self.state = self.state.next(tms);
        if self.state == TapState::TestLogicReset {
            self.reset();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimProtocol {
    /// Nothing is connected; every line floats high.
    Detached,
    Swd,
    Jtag,
}

#[derive(Clone, Copy, Debug)]
struct SimPin {
    direction: PinDirection,
    output: bool,
    driving: bool,
}

impl Default for SimPin {
    fn default() -> Self {
        Self {
            direction: PinDirection::Input,
            output: false,
            driving: false,
        }
    }
}

/// Simulated target board wired to the six debug pins.
pub struct SimTarget {
    pins: [SimPin; 6],
    timing: ClockTiming,
    cycles: u64,
    last_rise: Option<u64>,
    min_period: Option<u64>,
    rising_edges: u64,
    protocol: SimProtocol,
    swd: SwdTarget,
    jtag: JtagChain,
    dp: DebugPort,
    leds: [bool; 2],
    reset_hook: bool,
    resets: u32,
}

impl SimTarget {
    pub fn new(protocol: SimProtocol) -> Self {
        Self {
            pins: [SimPin::default(); 6],
            timing: ClockTiming::default(),
            cycles: 0,
            last_rise: None,
            min_period: None,
            rising_edges: 0,
            protocol,
            swd: SwdTarget::default(),
            jtag: JtagChain::new(&[JtagDevice::dap()]),
            dp: DebugPort::default(),
            leds: [false; 2],
            reset_hook: false,
            resets: 0,
        }
    }

    pub fn swd() -> Self {
        Self::new(SimProtocol::Swd)
    }

    pub fn jtag(devices: &[JtagDevice]) -> Self {
        let mut target = Self::new(SimProtocol::Jtag);
        target.jtag = JtagChain::new(devices);
        target
    }

    pub fn detached() -> Self {
        Self::new(SimProtocol::Detached)
    }

    pub fn with_timing(mut self, timing: ClockTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Lets `reset_target` report an executed reset sequence.
    pub fn with_reset_hook(mut self) -> Self {
        self.reset_hook = true;
        self
    }

    pub fn swd_target(&mut self) -> &mut SwdTarget {
        &mut self.swd
    }

    pub fn jtag_chain(&mut self) -> &mut JtagChain {
        &mut self.jtag
    }

    pub fn debug_port(&mut self) -> &mut DebugPort {
        &mut self.dp
    }

    pub fn direction(&self, pin: Pin) -> PinDirection {
        self.pins[pin as usize].direction
    }

    /// Whether the probe currently drives `pin`.
    pub fn is_driving(&self, pin: Pin) -> bool {
        self.pins[pin as usize].driving
    }

    pub fn led(&self, led: Led) -> bool {
        self.leds[led as usize]
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Virtual CPU cycles spent so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn rising_edges(&self) -> u64 {
        self.rising_edges
    }

    /// Highest SWCLK/TCK frequency observed between two consecutive rising
    /// edges.
    pub fn max_clock_hz(&self) -> Option<u32> {
        self.min_period
            .map(|period| (self.timing.cpu_clock as u64 / period.max(1)) as u32)
    }

    pub fn reset_clock_statistics(&mut self) {
        self.last_rise = None;
        self.min_period = None;
        self.rising_edges = 0;
    }

    fn level(&self, pin: Pin) -> bool {
        let state = &self.pins[pin as usize];
        if state.driving {
            return state.output;
        }
        let target = match (pin, self.protocol) {
            (Pin::SwdioTms, SimProtocol::Swd) => self.swd.drive,
            (Pin::Tdo, SimProtocol::Jtag) => self.jtag.tdo(),
            _ => None,
        };
        // Undriven lines are pulled up on the board.
        target.unwrap_or(true)
    }

    fn rising_edge(&mut self) {
        self.rising_edges += 1;
        if let Some(last) = self.last_rise {
            let period = self.cycles - last;
            self.min_period = Some(self.min_period.map_or(period, |min| min.min(period)));
        }
        self.last_rise = Some(self.cycles);

        match self.protocol {
            SimProtocol::Swd => {
                let swdio = &self.pins[Pin::SwdioTms as usize];
                let host = swdio.driving.then(|| swdio.output);
                self.swd.clock(host, &mut self.dp);
            }
            SimProtocol::Jtag => {
                let tms = self.level(Pin::SwdioTms);
                let tdi = self.level(Pin::Tdi);
                self.jtag.clock(tms, tdi, &mut self.dp);
            }
            SimProtocol::Detached => {}
        }
    }

    fn update<F: FnOnce(&mut SimPin)>(&mut self, pin: Pin, change: F) {
        let clock = self.level(Pin::SwclkTck);
        change(&mut self.pins[pin as usize]);
        if pin == Pin::SwclkTck {
            self.cycles += self.timing.io_port_write_cycles as u64;
            if !clock && self.level(Pin::SwclkTck) {
                self.rising_edge();
            }
        }
        if pin == Pin::NTrst && !self.level(Pin::NTrst) {
            self.jtag.reset();
        }
    }
}

impl BitBangIo for SimTarget {
    fn read(&mut self, pin: Pin) -> bool {
        self.level(pin)
    }
    fn set(&mut self, pin: Pin, level: bool) {
        self.update(pin, |state| state.output = level);
    }
    fn set_direction(&mut self, pin: Pin, direction: PinDirection) {
        self.update(pin, |state| {
            state.direction = direction;
            state.driving = direction == PinDirection::PushPull;
        });
    }
    fn output_enable(&mut self, pin: Pin) {
        self.update(pin, |state| state.driving = true);
    }
    fn output_disable(&mut self, pin: Pin) {
        self.update(pin, |state| state.driving = false);
    }
    fn delay_half_cycle(&mut self, cycles: u32) {
        self.cycles += cycles as u64 * self.timing.delay_slow_cycles as u64;
    }
    fn set_led(&mut self, led: Led, on: bool) {
        self.leds[led as usize] = on;
    }
    fn reset_target(&mut self) -> bool {
        if self.reset_hook {
            self.resets += 1;
        }
        self.reset_hook
    }
    fn timestamp(&mut self) -> u32 {
        let cpu_mhz = (self.timing.cpu_clock / 1_000_000).max(1) as u64;
        (self.cycles / cpu_mhz) as u32
    }
}
