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

#![allow(non_upper_case_globals)]

use bitflags::bitflags;
use log::trace;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::bitbang::{port_off, read_swj_pins, write_open_drain, BitBangIo, Led, Pin, SwjPins};
use crate::clock::ClockTiming;
use crate::cursor::{BufferCursor, CursorError, CursorRead, CursorWrite};
use crate::info::ProbeInfo;
use crate::jtag::{JtagInstruction, JtagIo, JtagIoConfig, JtagSequenceInfo, MAX_JTAG_DEVICES};
use crate::swd::{SwdIo, SwdIoConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DapCommandId {
    Info = 0x00,
    HostStatus = 0x01,
    Connect = 0x02,
    Disconnect = 0x03,
    TransferConfigure = 0x04,
    Transfer = 0x05,
    TransferBlock = 0x06,
    TransferAbort = 0x07,
    WriteAbort = 0x08,
    Delay = 0x09,
    ResetTarget = 0x0a,
    SWJPins = 0x10,
    SWJClock = 0x11,
    SWJSequence = 0x12,
    SWDConfigure = 0x13,
    JTAGSequence = 0x14,
    JTAGConfigure = 0x15,
    JTAGIdcode = 0x16,
    SWDSequence = 0x1d,
    ExecuteCommands = 0x7f,
}

bitflags! {
    pub struct SwdRequest: u8 {
        const APnDP = 0b00000001;
        const RnW = 0b00000010;
        const A2 = 0b00000100;
        const A3 = 0b00001000;
        const RDBUFF = Self::A2.bits | Self::A3.bits;
        const TRANSFER_MATCH_VALUE = 0b00010000;
        const TRANSFER_MATCH_MASK = 0b00100000;
        const TRANSFER_TIMESTAMP = 0b10000000;
        /// Bits which go on the wire.
        const WIRE = Self::APnDP.bits | Self::RnW.bits | Self::A2.bits | Self::A3.bits;
    }
}

pub const DAP_TRANSFER_OK: u8 = 0x01;
pub const DAP_TRANSFER_WAIT: u8 = 0x02;
pub const DAP_TRANSFER_FAULT: u8 = 0x04;
pub const DAP_TRANSFER_ERROR: u8 = 0x08;
pub const DAP_TRANSFER_MISMATCH: u8 = 0x10;
/// ACK value read when nothing drives SWDIO.
pub const DAP_TRANSFER_NO_ACK: u8 = 0x07;

pub const DAP_OK: u8 = 0x00;
pub const DAP_ERROR: u8 = 0xff;
pub const DAP_INVALID_COMMAND: u8 = 0xff;
pub const SWD_SEQUENCE_CLOCK: u8 = 0x3f;
pub const SWD_SEQUENCE_DIN: u8 = 0x80;

/// Longest `DAP_SWJ_Pins` wait, in microseconds.
pub const SWJ_PINS_MAX_WAIT_US: u32 = 3_000_000;

/// Failure of a single DP/AP access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferError {
    /// The target answered something other than OK.
    Ack(u8),
    /// Read data parity did not match.
    Parity,
    /// JTAG IR capture did not return the mandatory `01` pattern.
    Protocol,
    /// `DAP_Transfer` value match ran out of retries.
    Mismatch,
}

impl TransferError {
    /// `transfer_status` byte reported to the host.
    pub fn status(&self) -> u8 {
        match *self {
            TransferError::Ack(ack) => ack,
            TransferError::Parity => DAP_TRANSFER_ERROR | DAP_TRANSFER_NO_ACK,
            TransferError::Protocol => DAP_TRANSFER_ERROR,
            TransferError::Mismatch => DAP_TRANSFER_MISMATCH | DAP_TRANSFER_OK,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DapError {
    /// The request ended inside a command's arguments.
    TruncatedRequest,
    /// The response does not fit the response buffer.
    ResponseOverflow,
    Transfer(TransferError),
}

impl From<CursorError> for DapError {
    fn from(err: CursorError) -> Self {
        match err {
            CursorError::NotEnoughData => Self::TruncatedRequest,
            CursorError::InsufficientBuffer => Self::ResponseOverflow,
        }
    }
}
impl From<TransferError> for DapError {
    fn from(err: TransferError) -> Self {
        Self::Transfer(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DapPort {
    Disabled = 0,
    Swd = 1,
    Jtag = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmsisDapConfig {
    pub port: DapPort,
    pub timing: ClockTiming,
    pub swd: SwdIoConfig,
    pub jtag: JtagIoConfig,
    pub retry_count: u32,
    pub match_mask: u32,
    pub match_retry_count: u32,
}

impl CmsisDapConfig {
    pub fn new(timing: ClockTiming) -> Self {
        let clock = timing.default_delay();
        Self {
            port: DapPort::Disabled,
            timing,
            swd: SwdIoConfig {
                clock,
                ..SwdIoConfig::default()
            },
            jtag: JtagIoConfig {
                clock,
                reset_hold_cycles: timing.delay_us_cycles(100),
                ..JtagIoConfig::default()
            },
            retry_count: 100,
            match_mask: 0xffff_ffff,
            match_retry_count: 0,
        }
    }
}

impl Default for CmsisDapConfig {
    fn default() -> Self {
        Self::new(ClockTiming::default())
    }
}

type Request<'r> = BufferCursor<&'r [u8]>;
type Response<'r> = BufferCursor<&'r mut [u8]>;

/// Per command transfer bookkeeping.
#[derive(Default)]
struct TransferState {
    /// Instruction currently in the target's IR.
    ir: Option<JtagInstruction>,
    post_read: bool,
    posted_ap: bool,
    check_write: bool,
}

/// CMSIS-DAP command processor driving one set of debug pins.
pub struct CmsisDap<'a, Io> {
    io: Io,
    config: CmsisDapConfig,
    info: ProbeInfo<'a>,
}

impl<'a, Io: BitBangIo> CmsisDap<'a, Io> {
    pub fn new(io: Io, info: ProbeInfo<'a>, timing: ClockTiming) -> Self {
        Self {
            io,
            config: CmsisDapConfig::new(timing),
            info,
        }
    }

    pub fn io(&self) -> &Io {
        &self.io
    }
    pub fn io_mut(&mut self) -> &mut Io {
        &mut self.io
    }
    pub fn config(&self) -> &CmsisDapConfig {
        &self.config
    }
    pub fn info(&self) -> &ProbeInfo<'a> {
        &self.info
    }

    /// Executes the command at the start of `request` and writes its
    /// response to the start of `response`.
    ///
    /// Returns `(request bytes consumed << 16) | response bytes written`;
    /// both counts include the opcode byte.
    pub fn process_command(&mut self, request: &[u8], response: &mut [u8]) -> Result<u32, DapError> {
        let mut request = BufferCursor::new(request);
        let mut response = BufferCursor::new(response);
        self.execute_command(&mut request, &mut response, false)?;
        Ok(((request.get_position() as u32) << 16) | response.get_position() as u32)
    }

    fn execute_command(
        &mut self,
        request: &mut Request,
        response: &mut Response,
        nested: bool,
    ) -> Result<(), DapError> {
        let opcode = request.read_u8()?;
        let command = match DapCommandId::try_from_primitive(opcode) {
            Ok(DapCommandId::ExecuteCommands) if nested => None,
            Ok(command) => Some(command),
            Err(_) => None,
        };
        let command = match command {
            Some(command) => command,
            None => {
                trace!("unsupported command {:#04x}", opcode);
                response.write_u8(DAP_INVALID_COMMAND)?;
                return Ok(());
            }
        };
        trace!("{:?}", command);
        response.write_u8(opcode)?;

        match command {
            DapCommandId::Info => self.dap_info(request, response),
            DapCommandId::HostStatus => self.host_status(request, response),
            DapCommandId::Connect => self.connect(request, response),
            DapCommandId::Disconnect => self.disconnect(response),
            DapCommandId::TransferConfigure => self.transfer_configure(request, response),
            DapCommandId::Transfer => self.transfer(request, response),
            DapCommandId::TransferBlock => self.transfer_block(request, response),
            // Transfers never outlive the frame that started them.
            DapCommandId::TransferAbort => Ok(()),
            DapCommandId::WriteAbort => self.write_abort(request, response),
            DapCommandId::Delay => self.delay(request, response),
            DapCommandId::ResetTarget => {
                let executed = self.io.reset_target();
                response.write(&[DAP_OK, executed as u8])?;
                Ok(())
            }
            DapCommandId::SWJPins => self.swj_pins(request, response),
            DapCommandId::SWJClock => self.swj_clock(request, response),
            DapCommandId::SWJSequence => self.swj_sequence(request, response),
            DapCommandId::SWDConfigure => self.swd_configure(request, response),
            DapCommandId::SWDSequence => self.swd_sequence(request, response),
            DapCommandId::JTAGSequence => self.jtag_sequence(request, response),
            DapCommandId::JTAGConfigure => self.jtag_configure(request, response),
            DapCommandId::JTAGIdcode => self.jtag_idcode(request, response),
            DapCommandId::ExecuteCommands => {
                let count = request.read_u8()?;
                response.write_u8(count)?;
                for _ in 0..count {
                    self.execute_command(request, response, true)?;
                }
                Ok(())
            }
        }
    }

    fn dap_info(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let id = request.read_u8()?;
        self.info.lookup(id).write_to(response)?;
        Ok(())
    }

    fn host_status(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let kind = request.read_u8()?;
        let on = request.read_u8()? != 0;
        let status = match kind {
            0 => {
                self.io.set_led(Led::Connect, on);
                DAP_OK
            }
            1 => {
                self.io.set_led(Led::Running, on);
                DAP_OK
            }
            _ => DAP_ERROR,
        };
        response.write_u8(status)?;
        Ok(())
    }

    fn connect(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let port = match request.read_u8()? {
            0 | 1 => DapPort::Swd,
            2 => DapPort::Jtag,
            _ => DapPort::Disabled,
        };
        match port {
            DapPort::Swd => self.io.swd_connect(&self.config.swd),
            DapPort::Jtag => self.io.jtag_connect(&self.config.jtag),
            DapPort::Disabled => {}
        }
        if port != DapPort::Disabled {
            self.config.port = port;
        }
        response.write_u8(port as u8)?;
        Ok(())
    }

    fn disconnect(&mut self, response: &mut Response) -> Result<(), DapError> {
        port_off(&mut self.io);
        self.config.port = DapPort::Disabled;
        self.config.jtag.chain.reset();
        response.write_u8(DAP_OK)?;
        Ok(())
    }

    fn transfer_configure(
        &mut self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), DapError> {
        let idle_cycles = request.read_u8()? as u32;
        let retry_count = request.read_u16()? as u32;
        let match_retry_count = request.read_u16()? as u32;
        self.config.swd.idle_cycles = idle_cycles;
        self.config.jtag.idle_cycles = idle_cycles;
        self.config.retry_count = retry_count;
        self.config.match_retry_count = match_retry_count;
        response.write_u8(DAP_OK)?;
        Ok(())
    }

    fn transfer_port_ready(&self, index: u8) -> bool {
        match self.config.port {
            DapPort::Swd => true,
            DapPort::Jtag => self.config.jtag.chain.contains(index),
            DapPort::Disabled => false,
        }
    }

    /// Reads are posted when their data only arrives with the next access:
    /// AP reads in SWD, every read in JTAG.
    fn is_posted(&self, request: SwdRequest) -> bool {
        request.contains(SwdRequest::RnW)
            && (self.config.port == DapPort::Jtag || request.contains(SwdRequest::APnDP))
    }

    fn transfer_with_retry(
        &mut self,
        index: u8,
        request: SwdRequest,
        data: u32,
        state: &mut TransferState,
    ) -> Result<u32, TransferError> {
        let request = request & SwdRequest::WIRE;
        if self.config.port == DapPort::Jtag {
            let instruction = if request.contains(SwdRequest::APnDP) {
                JtagInstruction::Apacc
            } else {
                JtagInstruction::Dpacc
            };
            if state.ir != Some(instruction) {
                state.ir = None;
                self.io.jtag_write_ir(&self.config.jtag, index, instruction)?;
                state.ir = Some(instruction);
            }
        }

        let mut retry = 0;
        loop {
            let result = match self.config.port {
                DapPort::Jtag => self.io.jtag_transfer(&self.config.jtag, index, request, data),
                _ => self.io.swd_transfer(&self.config.swd, request, data),
            };
            match result {
                Err(TransferError::Ack(DAP_TRANSFER_WAIT)) if retry < self.config.retry_count => {
                    retry += 1;
                }
                result => break result,
            }
        }
    }

    fn read_rdbuff(&mut self, index: u8, state: &mut TransferState) -> Result<u32, TransferError> {
        self.transfer_with_retry(index, SwdRequest::RDBUFF | SwdRequest::RnW, 0, state)
    }

    fn write_timestamp(&mut self, response: &mut Response) -> Result<(), DapError> {
        let timestamp = self.io.timestamp();
        response.write_u32(timestamp)?;
        Ok(())
    }

    fn transfer(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let index = request.read_u8()?;
        let count = request.read_u8()?;
        let header = response.get_position();
        response.write(&[0, 0])?;

        let mut state = TransferState::default();
        let mut remaining = count;
        let mut completed = 0u8;
        let mut outcome = Ok(());
        if self.transfer_port_ready(index) {
            while remaining > 0 {
                remaining -= 1;
                let transfer_request = read_swd_request(request)?;
                outcome = self.transfer_one(index, transfer_request, request, response, &mut state);
                if outcome.is_err() {
                    break;
                }
                completed += 1;
            }
        }
        skip_transfer_requests(request, remaining)?;

        let status = match outcome {
            Ok(()) if completed > 0 => match self.transfer_finish(index, response, &mut state) {
                Ok(()) => DAP_TRANSFER_OK,
                Err(DapError::Transfer(err)) => err.status(),
                Err(err) => return Err(err),
            },
            Ok(()) => 0,
            Err(DapError::Transfer(err)) => err.status(),
            Err(err) => return Err(err),
        };
        trace!("transfer: {}/{} status {:#04x}", completed, count, status);
        response.write_at(header, &[completed, status])?;
        Ok(())
    }

    fn transfer_one(
        &mut self,
        index: u8,
        transfer_request: SwdRequest,
        request: &mut Request,
        response: &mut Response,
        state: &mut TransferState,
    ) -> Result<(), DapError> {
        let read = transfer_request.contains(SwdRequest::RnW);
        let match_value = transfer_request.contains(SwdRequest::TRANSFER_MATCH_VALUE);
        let timestamp = transfer_request.contains(SwdRequest::TRANSFER_TIMESTAMP);
        let value = if !read || match_value {
            request.read_u32()?
        } else {
            0
        };

        if !read {
            if state.post_read {
                let data = self.read_rdbuff(index, state)?;
                state.post_read = false;
                response.write_u32(data)?;
            }
            if transfer_request.contains(SwdRequest::TRANSFER_MATCH_MASK) {
                self.config.match_mask = value;
            } else {
                self.transfer_with_retry(index, transfer_request, value, state)?;
                if timestamp {
                    self.write_timestamp(response)?;
                }
                state.check_write = true;
            }
            return Ok(());
        }

        let posted = self.is_posted(transfer_request);
        if state.post_read {
            let ap = transfer_request.contains(SwdRequest::APnDP);
            if posted && !match_value && state.posted_ap == ap {
                // Previous data, and the next read goes out with the same access.
                let data = self.transfer_with_retry(index, transfer_request, 0, state)?;
                response.write_u32(data)?;
                if timestamp {
                    self.write_timestamp(response)?;
                }
            } else {
                let data = self.read_rdbuff(index, state)?;
                state.post_read = false;
                response.write_u32(data)?;
            }
        }

        if match_value {
            if posted {
                self.transfer_with_retry(index, transfer_request, 0, state)?;
            }
            let mut match_retry = self.config.match_retry_count;
            loop {
                let data = self.transfer_with_retry(index, transfer_request, 0, state)?;
                if data & self.config.match_mask == value {
                    break;
                }
                if match_retry == 0 {
                    return Err(TransferError::Mismatch.into());
                }
                match_retry -= 1;
            }
        } else if posted {
            if !state.post_read {
                self.transfer_with_retry(index, transfer_request, 0, state)?;
                if timestamp {
                    self.write_timestamp(response)?;
                }
                state.post_read = true;
                state.posted_ap = transfer_request.contains(SwdRequest::APnDP);
            }
        } else {
            let data = self.transfer_with_retry(index, transfer_request, 0, state)?;
            if timestamp {
                self.write_timestamp(response)?;
            }
            response.write_u32(data)?;
        }
        state.check_write = false;
        Ok(())
    }

    /// Collects a read still in flight, or confirms the last write.
    fn transfer_finish(
        &mut self,
        index: u8,
        response: &mut Response,
        state: &mut TransferState,
    ) -> Result<(), DapError> {
        if state.post_read {
            let data = self.read_rdbuff(index, state)?;
            state.post_read = false;
            response.write_u32(data)?;
        } else if state.check_write || self.config.port == DapPort::Jtag {
            self.read_rdbuff(index, state)?;
            state.check_write = false;
        }
        Ok(())
    }

    fn transfer_block(
        &mut self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), DapError> {
        let index = request.read_u8()?;
        let count = request.read_u16()?;
        let transfer_request = read_swd_request(request)?;
        let data_start = request.get_position();
        let header = response.get_position();
        response.write(&[0, 0, 0])?;

        let mut completed = 0u16;
        let status = if count == 0 || !self.transfer_port_ready(index) {
            0
        } else {
            match self.transfer_block_inner(
                index,
                transfer_request,
                count,
                request,
                response,
                &mut completed,
            ) {
                Ok(()) => DAP_TRANSFER_OK,
                Err(DapError::Transfer(err)) => err.status(),
                Err(err) => return Err(err),
            }
        };
        if !transfer_request.contains(SwdRequest::RnW) {
            let data_end = data_start + count as usize * 4;
            request.skip(data_end.saturating_sub(request.get_position()))?;
        }

        trace!("transfer block: {}/{} status {:#04x}", completed, count, status);
        let completed = completed.to_le_bytes();
        response.write_at(header, &[completed[0], completed[1], status])?;
        Ok(())
    }

    fn transfer_block_inner(
        &mut self,
        index: u8,
        transfer_request: SwdRequest,
        count: u16,
        request: &mut Request,
        response: &mut Response,
        completed: &mut u16,
    ) -> Result<(), DapError> {
        let mut state = TransferState::default();
        if transfer_request.contains(SwdRequest::RnW) {
            let posted = self.is_posted(transfer_request);
            if posted {
                self.transfer_with_retry(index, transfer_request, 0, &mut state)?;
            }
            for n in 0..count {
                let data = if posted && n + 1 == count {
                    // The last result is waiting in RDBUFF.
                    self.read_rdbuff(index, &mut state)?
                } else {
                    self.transfer_with_retry(index, transfer_request, 0, &mut state)?
                };
                response.write_u32(data)?;
                *completed += 1;
            }
        } else {
            for _ in 0..count {
                let data = request.read_u32()?;
                self.transfer_with_retry(index, transfer_request, data, &mut state)?;
                *completed += 1;
            }
            self.read_rdbuff(index, &mut state)?;
        }
        Ok(())
    }

    fn write_abort(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let index = request.read_u8()?;
        let data = request.read_u32()?;
        let status = match self.config.port {
            DapPort::Swd => {
                // DP ABORT, write only. The target may not even answer.
                let _ = self.io.swd_transfer(&self.config.swd, SwdRequest::empty(), data);
                DAP_OK
            }
            DapPort::Jtag if self.config.jtag.chain.contains(index) => {
                match self.io.jtag_write_abort(&self.config.jtag, index, data) {
                    Ok(()) => DAP_OK,
                    Err(_) => DAP_ERROR,
                }
            }
            _ => DAP_ERROR,
        };
        response.write_u8(status)?;
        Ok(())
    }

    fn delay(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let delay_us = request.read_u16()?;
        let cycles = self.config.timing.delay_us_cycles(delay_us as u32);
        self.io.delay_half_cycle(cycles);
        response.write_u8(DAP_OK)?;
        Ok(())
    }

    fn swj_pins(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let output = SwjPins::from_bits_truncate(request.read_u8()?);
        let select = SwjPins::from_bits_truncate(request.read_u8()?);
        let wait_us = request.read_u32()?.min(SWJ_PINS_MAX_WAIT_US);

        for pin in [Pin::SwclkTck, Pin::SwdioTms, Pin::Tdi] {
            let mask = SwjPins::from_pin(pin);
            if select.contains(mask) {
                self.io.set(pin, output.contains(mask));
            }
        }
        for pin in [Pin::NTrst, Pin::NReset] {
            let mask = SwjPins::from_pin(pin);
            if select.contains(mask) {
                write_open_drain(&mut self.io, pin, output.contains(mask));
            }
        }

        let watched = select & (SwjPins::N_TRST | SwjPins::N_RESET);
        if wait_us > 0 && !watched.is_empty() {
            let step = self.config.timing.delay_us_cycles(1);
            for _ in 0..wait_us {
                if read_swj_pins(&mut self.io) & watched == output & watched {
                    break;
                }
                self.io.delay_half_cycle(step);
            }
        }

        response.write_u8(read_swj_pins(&mut self.io).bits())?;
        Ok(())
    }

    fn swj_clock(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let frequency_hz = request.read_u32()?;
        let status = match self.config.timing.clock_delay(frequency_hz) {
            Some(delay) => {
                self.config.swd.clock = delay;
                self.config.jtag.clock = delay;
                DAP_OK
            }
            None => DAP_ERROR,
        };
        response.write_u8(status)?;
        Ok(())
    }

    fn swj_sequence(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let count = match request.read_u8()? {
            0 => 256,
            count => count as usize,
        };
        let mut data = [0u8; 32];
        let data = request.read(&mut data[..(count + 7) / 8])?;
        self.io.swj_sequence(&self.config.swd, count, data);
        response.write_u8(DAP_OK)?;
        Ok(())
    }

    fn swd_configure(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let configuration = request.read_u8()?;
        self.config.swd.turn_around_cycles = (configuration & 0b11) as u32 + 1;
        self.config.swd.always_generate_data_phase = configuration & 0b100 != 0;
        response.write_u8(DAP_OK)?;
        Ok(())
    }

    fn swd_sequence(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let sequence_count = request.read_u8()?;
        response.write_u8(DAP_OK)?;
        for _ in 0..sequence_count {
            let sequence_info = request.read_u8()?;
            let clock_count = match sequence_info & SWD_SEQUENCE_CLOCK {
                0 => 64,
                count => count as usize,
            };
            let mut data = [0u8; 8];
            let data = &mut data[..(clock_count + 7) / 8];
            if sequence_info & SWD_SEQUENCE_DIN != 0 {
                self.io.swd_read_sequence(&self.config.swd, clock_count, data);
                response.write(data)?;
            } else {
                let data = request.read(data)?;
                self.io.swd_write_sequence(&self.config.swd, clock_count, data);
            }
        }
        self.io.swdio_output_enable();
        Ok(())
    }

    fn jtag_sequence(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let sequence_count = request.read_u8()?;
        response.write_u8(DAP_OK)?;
        for _ in 0..sequence_count {
            let info = JtagSequenceInfo::from(request.read_u8()?);
            let length = (info.number_of_tck_cycles + 7) / 8;
            let mut tdi = [0u8; 8];
            request.read(&mut tdi[..length])?;
            let tdo = self
                .io
                .jtag_sequence(&self.config.jtag, &info, u64::from_le_bytes(tdi));
            if info.tdo_capture {
                response.write(&tdo.to_le_bytes()[..length])?;
            }
        }
        Ok(())
    }

    fn jtag_configure(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let count = request.read_u8()? as usize;
        let status = if count > MAX_JTAG_DEVICES {
            request.skip(count)?;
            DAP_ERROR
        } else {
            let mut ir_length = [0u8; MAX_JTAG_DEVICES];
            let ir_length = request.read(&mut ir_length[..count])?;
            self.config.jtag.chain.configure(ir_length);
            DAP_OK
        };
        response.write_u8(status)?;
        Ok(())
    }

    fn jtag_idcode(&mut self, request: &mut Request, response: &mut Response) -> Result<(), DapError> {
        let index = request.read_u8()?;
        let idcode = if self.config.port == DapPort::Jtag {
            self.io.jtag_idcode(&self.config.jtag, index).ok()
        } else {
            None
        };
        match idcode {
            Some(idcode) => {
                response.write_u8(DAP_OK)?;
                response.write_u32(idcode)?;
            }
            None => {
                response.write_u8(DAP_ERROR)?;
                response.write_u32(0)?;
            }
        }
        Ok(())
    }
}

fn read_swd_request<C: CursorRead>(cursor: &mut C) -> Result<SwdRequest, DapError> {
    Ok(SwdRequest::from_bits_truncate(cursor.read_u8()?))
}

/// Consumes requests of a batch that stopped early.
fn skip_transfer_requests(request: &mut Request, count: u8) -> Result<(), DapError> {
    for _ in 0..count {
        let transfer_request = read_swd_request(request)?;
        if !transfer_request.contains(SwdRequest::RnW)
            || transfer_request.contains(SwdRequest::TRANSFER_MATCH_VALUE)
        {
            request.skip(4)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bitbang::PinDirection;
    use crate::sim::{
        JtagDevice, SimTarget, SIM_AHB_AP_IDR, SIM_DPIDR, SIM_JTAG_IDCODE, SIM_MEMORY_BASE,
    };
    use std::vec::Vec;

    fn dap(target: SimTarget) -> CmsisDap<'static, SimTarget> {
        CmsisDap::new(target, ProbeInfo::default(), ClockTiming::default())
    }

    /// Runs one command, checks that all of it was consumed and returns the response.
    fn command(dap: &mut CmsisDap<SimTarget>, request: &[u8]) -> Vec<u8> {
        let mut response = [0u8; 1024];
        let result = dap.process_command(request, &mut response).unwrap();
        assert_eq!((result >> 16) as usize, request.len(), "request {:02x?}", request);
        response[..(result & 0xffff) as usize].to_vec()
    }

    fn with_u32(prefix: &[u8], value: u32) -> Vec<u8> {
        let mut bytes = prefix.to_vec();
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes
    }

    fn swd_dap() -> CmsisDap<'static, SimTarget> {
        let mut dap = dap(SimTarget::swd());
        assert_eq!(command(&mut dap, &[0x02, 0x01]), [0x02, 0x01]);
        dap
    }

    fn jtag_dap() -> CmsisDap<'static, SimTarget> {
        let devices = [JtagDevice::other(5, 0x1234_5677), JtagDevice::dap()];
        let mut dap = dap(SimTarget::jtag(&devices));
        assert_eq!(command(&mut dap, &[0x02, 0x02]), [0x02, 0x02]);
        assert_eq!(command(&mut dap, &[0x15, 0x02, 0x05, 0x04]), [0x15, 0x00]);
        dap
    }

    #[test]
    fn info_vendor() {
        let mut dap = dap(SimTarget::detached());
        assert_eq!(command(&mut dap, &[0x00, 0x01]), b"\x00\x08OpenOCD\x00");
        assert_eq!(command(&mut dap, &[0x00, 0xff]), [0x00, 0x02, 0x00, 0x04]);
        assert_eq!(command(&mut dap, &[0x00, 0x05]), [0x00, 0x00]);
    }

    #[test]
    fn connect_selects_port() {
        let mut dap = dap(SimTarget::swd());
        assert_eq!(command(&mut dap, &[0x02, 0x00]), [0x02, 0x01]);
        assert_eq!(dap.config().port, DapPort::Swd);
        assert_eq!(command(&mut dap, &[0x02, 0x07]), [0x02, 0x00]);
        assert_eq!(dap.config().port, DapPort::Swd);
        assert_eq!(command(&mut dap, &[0x03]), [0x03, 0x00]);
        assert_eq!(dap.config().port, DapPort::Disabled);
        for pin in Pin::ALL {
            let expected = match pin {
                Pin::NTrst | Pin::NReset => PinDirection::OpenDrainPullUp,
                _ => PinDirection::Input,
            };
            assert_eq!(dap.io().direction(pin), expected, "{:?}", pin);
            assert!(!dap.io().is_driving(pin));
        }
    }

    fn pin_states(dap: &CmsisDap<SimTarget>) -> Vec<(PinDirection, bool)> {
        Pin::ALL
            .iter()
            .map(|&pin| (dap.io().direction(pin), dap.io().is_driving(pin)))
            .collect()
    }

    #[test]
    fn connect_twice_leaves_the_same_state() {
        let mut dap = swd_dap();
        let first = pin_states(&dap);
        assert_eq!(command(&mut dap, &[0x02, 0x01]), [0x02, 0x01]);
        assert_eq!(pin_states(&dap), first);
        assert_eq!(dap.config().port, DapPort::Swd);
        let response = command(&mut dap, &[0x05, 0x00, 0x01, 0x02]);
        assert_eq!(response, with_u32(&[0x05, 0x01, 0x01], SIM_DPIDR));
    }

    #[test]
    fn swdio_is_push_pull_while_driving() {
        let mut dap = swd_dap();
        assert_eq!(dap.io().direction(Pin::SwdioTms), PinDirection::PushPull);
        assert!(dap.io().is_driving(Pin::SwdioTms));
        assert_eq!(dap.io().direction(Pin::SwclkTck), PinDirection::PushPull);

        // A read ends with the host driving SWDIO again.
        let response = command(&mut dap, &[0x05, 0x00, 0x01, 0x02]);
        assert_eq!(response, with_u32(&[0x05, 0x01, 0x01], SIM_DPIDR));
        assert!(dap.io().is_driving(Pin::SwdioTms));
    }

    #[test]
    fn reset_lines_keep_pull_up_after_swd_connect() {
        let mut dap = swd_dap();
        for pin in [Pin::NTrst, Pin::NReset] {
            assert_eq!(dap.io().direction(pin), PinDirection::OpenDrainPullUp);
            assert!(!dap.io().is_driving(pin));
        }
        assert_eq!(command(&mut dap, &[0x10, 0x00, 0x20, 0, 0, 0, 0])[1] & 0x20, 0);
        assert!(dap.io().is_driving(Pin::NTrst));
        assert_eq!(command(&mut dap, &[0x10, 0x20, 0x20, 0, 0, 0, 0])[1] & 0x20, 0x20);
        assert_eq!(dap.io().direction(Pin::NTrst), PinDirection::OpenDrainPullUp);
        assert!(!dap.io().is_driving(Pin::NTrst));
    }

    #[test]
    fn swj_clock_programs_delay() {
        let mut dap = dap(SimTarget::detached());
        assert_eq!(command(&mut dap, &[0x11, 0x40, 0x42, 0x0f, 0x00]), [0x11, 0x00]);
        assert!(!dap.config().swd.clock.fast);
        assert_eq!(dap.config().swd.clock.slow_cycles, 2);
        assert_eq!(dap.config().jtag.clock, dap.config().swd.clock);
        assert_eq!(command(&mut dap, &[0x11, 0x00, 0x00, 0x00, 0x00]), [0x11, 0xff]);
        assert_eq!(dap.config().swd.clock.slow_cycles, 2);
    }

    #[test]
    fn transfer_reads_idcode() {
        let mut dap = swd_dap();
        let response = command(&mut dap, &[0x05, 0x00, 0x01, 0x02]);
        assert_eq!(response, with_u32(&[0x05, 0x01, 0x01], SIM_DPIDR));
    }

    #[test]
    fn transfer_gives_up_after_retries() {
        let mut dap = dap(SimTarget::swd());
        dap.io_mut().swd_target().always_wait = true;
        assert_eq!(command(&mut dap, &[0x02, 0x01]), [0x02, 0x01]);
        assert_eq!(
            command(&mut dap, &[0x04, 0x00, 0x02, 0x00, 0x00, 0x00]),
            [0x04, 0x00]
        );
        assert_eq!(command(&mut dap, &[0x05, 0x00, 0x01, 0x02]), [0x05, 0x00, 0x02]);
        assert_eq!(dap.io_mut().swd_target().requests(), 3);
    }

    #[test]
    fn transfer_retries_through_wait() {
        let mut dap = swd_dap();
        dap.io_mut().swd_target().wait_count = 3;
        let response = command(&mut dap, &[0x05, 0x00, 0x01, 0x02]);
        assert_eq!(response, with_u32(&[0x05, 0x01, 0x01], SIM_DPIDR));
    }

    #[test]
    fn transfer_without_requests_or_port() {
        let mut dap = dap(SimTarget::swd());
        // Not connected: the request is consumed but nothing happens.
        assert_eq!(command(&mut dap, &[0x05, 0x00, 0x01, 0x02]), [0x05, 0x00, 0x00]);
        let write = with_u32(&[0x05, 0x00, 0x01, 0x08], 0);
        assert_eq!(command(&mut dap, &write), [0x05, 0x00, 0x00]);
        assert_eq!(dap.io_mut().swd_target().requests(), 0);

        let mut dap = swd_dap();
        assert_eq!(command(&mut dap, &[0x05, 0x00, 0x00]), [0x05, 0x00, 0x00]);
    }

    #[test]
    fn posted_ap_reads_are_collected() {
        let mut dap = swd_dap();
        let mut request = with_u32(&[0x05, 0x00, 0x03, 0x08], 0xf0);
        request.extend_from_slice(&[0x0f, 0x0f]);
        let mut expected = with_u32(&[0x05, 0x03, 0x01], SIM_AHB_AP_IDR);
        expected.extend_from_slice(&SIM_AHB_AP_IDR.to_le_bytes());
        assert_eq!(command(&mut dap, &request), expected);
    }

    /// Powers up the debug domain and points TAR at the start of RAM.
    fn setup_mem_ap(dap: &mut CmsisDap<SimTarget>) {
        let mut request = with_u32(&[0x05, 0x00, 0x04, 0x04], 0x5000_0000);
        request.extend_from_slice(&with_u32(&[0x08], 0));
        request.extend_from_slice(&with_u32(&[0x01], 0x2300_0012));
        request.extend_from_slice(&with_u32(&[0x05], SIM_MEMORY_BASE));
        assert_eq!(command(dap, &request), [0x05, 0x04, 0x01]);
    }

    #[test]
    fn block_write_then_block_read() {
        let mut dap = swd_dap();
        setup_mem_ap(&mut dap);
        let words = [0xdead_beef_u32, 0x0123_4567, 0x89ab_cdef];
        let mut request = vec![0x06, 0x00, 0x03, 0x00, 0x0d];
        let mut data = Vec::new();
        for word in words {
            data.extend_from_slice(&word.to_le_bytes());
        }
        request.extend_from_slice(&data);
        assert_eq!(command(&mut dap, &request), [0x06, 0x03, 0x00, 0x01]);
        assert_eq!(dap.io_mut().debug_port().memory(SIM_MEMORY_BASE + 8), Some(words[2]));

        let rewind = with_u32(&[0x05, 0x00, 0x01, 0x05], SIM_MEMORY_BASE);
        assert_eq!(command(&mut dap, &rewind), [0x05, 0x01, 0x01]);
        let mut expected = vec![0x06, 0x03, 0x00, 0x01];
        expected.extend_from_slice(&data);
        assert_eq!(command(&mut dap, &[0x06, 0x00, 0x03, 0x00, 0x0f]), expected);
        // The posted read must not run past the block.
        let tar = command(&mut dap, &[0x05, 0x00, 0x01, 0x07]);
        assert_eq!(tar, with_u32(&[0x05, 0x01, 0x01], SIM_MEMORY_BASE + 12));
    }

    #[test]
    fn block_without_work_consumes_data() {
        let mut dap = dap(SimTarget::swd());
        let request = with_u32(&[0x06, 0x00, 0x01, 0x00, 0x0d], 0x1234);
        assert_eq!(command(&mut dap, &request), [0x06, 0x00, 0x00, 0x00]);
        let mut dap = swd_dap();
        assert_eq!(command(&mut dap, &[0x06, 0x00, 0x00, 0x00, 0x0f]), [0x06, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn value_match() {
        let mut dap = swd_dap();
        assert_eq!(
            command(&mut dap, &[0x04, 0x00, 0x64, 0x00, 0x02, 0x00]),
            [0x04, 0x00]
        );
        let read_match = with_u32(&[0x05, 0x00, 0x01, 0x16], 0xf000_0000);
        assert_eq!(command(&mut dap, &read_match), [0x05, 0x00, 0x11]);

        let mut request = with_u32(&[0x05, 0x00, 0x02, 0x04], 0x5000_0000);
        request.extend_from_slice(&with_u32(&[0x16], 0xf000_0000));
        assert_eq!(command(&mut dap, &request), [0x05, 0x02, 0x01]);
    }

    #[test]
    fn sticky_fault_and_write_abort() {
        let mut dap = swd_dap();
        let mut request = with_u32(&[0x05, 0x00, 0x02, 0x05], 0x1000_0000);
        request.push(0x0f);
        assert_eq!(command(&mut dap, &request), with_u32(&[0x05, 0x02, 0x01], 0));
        assert!(dap.io_mut().debug_port().sticky_error());

        assert_eq!(command(&mut dap, &[0x05, 0x00, 0x01, 0x03]), [0x05, 0x00, 0x04]);
        let abort = with_u32(&[0x08, 0x00], 0x04);
        assert_eq!(command(&mut dap, &abort), [0x08, 0x00]);
        assert!(!dap.io_mut().debug_port().sticky_error());
        let response = command(&mut dap, &[0x05, 0x00, 0x01, 0x03]);
        assert_eq!(&response[..3], [0x05, 0x01, 0x01]);
    }

    #[test]
    fn write_abort_needs_a_port() {
        let mut dap = dap(SimTarget::swd());
        let abort = with_u32(&[0x08, 0x00], 0x1e);
        assert_eq!(command(&mut dap, &abort), [0x08, 0xff]);
    }

    #[test]
    fn execute_commands_batches() {
        let mut dap = dap(SimTarget::swd());
        let mut expected = vec![0x7f, 0x02];
        expected.extend_from_slice(b"\x00\x08OpenOCD\x00");
        expected.extend_from_slice(&[0x02, 0x01]);
        assert_eq!(
            command(&mut dap, &[0x7f, 0x02, 0x00, 0x01, 0x02, 0x01]),
            expected
        );
        assert_eq!(command(&mut dap, &[0x7f, 0x01, 0x7f]), [0x7f, 0x01, 0xff]);
    }

    #[test]
    fn unknown_command() {
        let mut dap = dap(SimTarget::detached());
        assert_eq!(command(&mut dap, &[0x42]), [0xff]);
        // QueueCommands is not supported either.
        assert_eq!(command(&mut dap, &[0x7e]), [0xff]);
    }

    #[test]
    fn malformed_requests() {
        let mut dap = swd_dap();
        let mut response = [0u8; 64];
        assert_eq!(
            dap.process_command(&[0x05, 0x00, 0x01], &mut response),
            Err(DapError::TruncatedRequest)
        );
        assert_eq!(
            dap.process_command(&[0x11, 0x40], &mut response),
            Err(DapError::TruncatedRequest)
        );
        assert_eq!(
            dap.process_command(&[], &mut response),
            Err(DapError::TruncatedRequest)
        );
        assert_eq!(
            dap.process_command(&[0x00, 0x01], &mut response[..4]),
            Err(DapError::ResponseOverflow)
        );
    }

    #[test]
    fn jtag_idcode_per_device() {
        let mut dap = jtag_dap();
        assert_eq!(command(&mut dap, &[0x16, 0x01]), with_u32(&[0x16, 0x00], SIM_JTAG_IDCODE));
        assert_eq!(command(&mut dap, &[0x16, 0x00]), with_u32(&[0x16, 0x00], 0x1234_5677));
        assert_eq!(command(&mut dap, &[0x16, 0x02]), with_u32(&[0x16, 0xff], 0));
    }

    #[test]
    fn jtag_transfer_caches_instruction_per_command() {
        let mut dap = jtag_dap();
        let before = dap.io_mut().jtag_chain().ir_updates();
        let response = command(&mut dap, &[0x05, 0x01, 0x02, 0x02, 0x02]);
        let mut expected = with_u32(&[0x05, 0x02, 0x01], SIM_DPIDR);
        expected.extend_from_slice(&SIM_DPIDR.to_le_bytes());
        assert_eq!(response, expected);
        assert_eq!(dap.io_mut().jtag_chain().ir_updates() - before, 1);

        // The cache does not survive the command.
        command(&mut dap, &[0x05, 0x01, 0x01, 0x02]);
        assert_eq!(dap.io_mut().jtag_chain().ir_updates() - before, 2);
    }

    #[test]
    fn jtag_mem_ap_access() {
        let mut dap = jtag_dap();
        dap.io_mut().jtag_chain().wait_count = 2;
        let mut request = with_u32(&[0x05, 0x01, 0x03, 0x08], 0xf0);
        request.extend_from_slice(&[0x0f, 0x02]);
        let mut expected = with_u32(&[0x05, 0x03, 0x01], SIM_AHB_AP_IDR);
        expected.extend_from_slice(&SIM_DPIDR.to_le_bytes());
        assert_eq!(command(&mut dap, &request), expected);
    }

    #[test]
    fn jtag_write_abort_clears_sticky() {
        let mut dap = jtag_dap();
        let mut request = with_u32(&[0x05, 0x01, 0x02, 0x05], 0x1000_0000);
        request.push(0x0f);
        assert_eq!(command(&mut dap, &request), with_u32(&[0x05, 0x02, 0x01], 0));
        assert!(dap.io_mut().debug_port().sticky_error());
        assert_eq!(command(&mut dap, &with_u32(&[0x08, 0x01], 0x04)), [0x08, 0x00]);
        assert!(!dap.io_mut().debug_port().sticky_error());
        assert_eq!(command(&mut dap, &with_u32(&[0x08, 0x05], 0x04)), [0x08, 0xff]);
    }

    #[test]
    fn jtag_configure_rejects_long_chain() {
        let mut dap = jtag_dap();
        let mut request = vec![0x15, 0x09];
        request.extend_from_slice(&[4; 9]);
        assert_eq!(command(&mut dap, &request), [0x15, 0xff]);
        assert_eq!(dap.config().jtag.chain.ir_lengths(), &[5, 4]);
    }

    #[test]
    fn jtag_sequence_captures_idcode() {
        let devices = [JtagDevice::dap()];
        let mut dap = dap(SimTarget::jtag(&devices));
        assert_eq!(command(&mut dap, &[0x02, 0x02]), [0x02, 0x02]);
        // Run-Test/Idle -> Select-DR -> Capture-DR -> Shift-DR, then 32 bits.
        let request = [
            0x14, 0x03, 0x41, 0x00, 0x02, 0x00, 0xa0, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(
            command(&mut dap, &request),
            with_u32(&[0x14, 0x00], SIM_JTAG_IDCODE)
        );
    }

    #[test]
    fn swj_and_swd_sequences() {
        let mut dap = swd_dap();
        assert_eq!(
            command(&mut dap, &[0x12, 0x38, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            [0x12, 0x00]
        );
        assert_eq!(command(&mut dap, &[0x12, 0x08, 0x00]), [0x12, 0x00]);
        let response = command(&mut dap, &[0x05, 0x00, 0x01, 0x02]);
        assert_eq!(response, with_u32(&[0x05, 0x01, 0x01], SIM_DPIDR));

        let mut request = vec![0x12, 0x00];
        request.extend_from_slice(&[0xff; 32]);
        assert_eq!(command(&mut dap, &request), [0x12, 0x00]);

        assert_eq!(
            command(&mut dap, &[0x1d, 0x02, 0x08, 0xff, 0x84]),
            [0x1d, 0x00, 0x0f]
        );
        assert!(dap.io().is_driving(Pin::SwdioTms));
    }

    #[test]
    fn swd_configure_sets_turnaround() {
        let mut dap = swd_dap();
        assert_eq!(command(&mut dap, &[0x13, 0x05]), [0x13, 0x00]);
        assert_eq!(dap.config().swd.turn_around_cycles, 2);
        assert!(dap.config().swd.always_generate_data_phase);
    }

    #[test]
    fn transfers_with_two_cycle_turnaround() {
        let mut dap = dap(SimTarget::swd());
        dap.io_mut().swd_target().turnaround = 2;
        assert_eq!(command(&mut dap, &[0x13, 0x01]), [0x13, 0x00]);
        assert_eq!(command(&mut dap, &[0x02, 0x01]), [0x02, 0x01]);

        let response = command(&mut dap, &[0x05, 0x00, 0x01, 0x02]);
        assert_eq!(response, with_u32(&[0x05, 0x01, 0x01], SIM_DPIDR));

        let mut request = with_u32(&[0x05, 0x00, 0x02, 0x04], 0x5000_0000);
        request.push(0x06);
        let response = command(&mut dap, &request);
        assert_eq!(response, with_u32(&[0x05, 0x02, 0x01], 0xf000_0000));
        assert_eq!(dap.io_mut().debug_port().ctrl_stat(), 0xf000_0000);
    }

    #[test]
    fn swj_pins_drives_and_reads_back() {
        let mut dap = dap(SimTarget::detached());
        assert_eq!(command(&mut dap, &[0x10, 0x00, 0x80, 0, 0, 0, 0]), [0x10, 0x2f]);
        assert_eq!(
            command(&mut dap, &[0x10, 0x80, 0x80, 0xe8, 0x03, 0, 0]),
            [0x10, 0xaf]
        );
        assert!(!dap.io().is_driving(Pin::NReset));
    }

    #[test]
    fn host_status_leds() {
        let mut dap = dap(SimTarget::detached());
        assert_eq!(command(&mut dap, &[0x01, 0x00, 0x01]), [0x01, 0x00]);
        assert!(dap.io().led(Led::Connect));
        assert_eq!(command(&mut dap, &[0x01, 0x01, 0x01]), [0x01, 0x00]);
        assert!(dap.io().led(Led::Running));
        assert_eq!(command(&mut dap, &[0x01, 0x05, 0x01]), [0x01, 0xff]);
    }

    #[test]
    fn reset_target_and_delay() {
        let mut dap = dap(SimTarget::detached());
        assert_eq!(command(&mut dap, &[0x0a]), [0x0a, 0x00, 0x00]);
        let mut dap = self::dap(SimTarget::detached().with_reset_hook());
        assert_eq!(command(&mut dap, &[0x0a]), [0x0a, 0x00, 0x01]);
        assert_eq!(dap.io().resets(), 1);

        let before = dap.io().cycles();
        assert_eq!(command(&mut dap, &[0x09, 0x0a, 0x00]), [0x09, 0x00]);
        assert!(dap.io().cycles() - before >= 10 * 160);
    }
}
