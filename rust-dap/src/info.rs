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

//! Identity strings and limits reported through `DAP_Info`.

use core::fmt::Write;

use bitflags::bitflags;
use heapless::String;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::cursor::{CursorError, CursorWrite};

pub const DEFAULT_VENDOR: &str = "OpenOCD";
pub const DEFAULT_PRODUCT: &str = "CMSIS-DAP-TCP device";
pub const CMSIS_DAP_PROTOCOL_VERSION: &str = "2.1.1";
/// Largest request or response payload, in bytes.
pub const DAP_PACKET_SIZE: u16 = 1024;
pub const DAP_PACKET_COUNT: u8 = 8;
/// Timestamps are microseconds on hosted builds.
pub const DEFAULT_TIMESTAMP_CLOCK: u32 = 1_000_000;

const SERIAL_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DapInfoId {
    Vendor = 0x01,
    Product = 0x02,
    SerialNumber = 0x03,
    CmsisDapVer = 0x04,
    DeviceVendor = 0x05,
    DeviceName = 0x06,
    BoardVendor = 0x07,
    BoardName = 0x08,
    ProductFirmwareVer = 0x09,
    Capabilities = 0xf0,
    TimeStampClock = 0xf1,
    UartRxBufferSize = 0xfb,
    UartTxBufferSize = 0xfc,
    SwoBufferSize = 0xfd,
    PacketCount = 0xfe,
    PacketSize = 0xff,
}

bitflags! {
    pub struct DapCapabilities: u16 {
        const SWD = 0b0000_0001;
        const JTAG = 0b0000_0010;
        const SWO_UART = 0b0000_0100;
        const SWO_MANCHESTER = 0b0000_1000;
        const ATOMIC_COMMANDS = 0b0001_0000;
        const TEST_DOMAIN_TIMER = 0b0010_0000;
        const SWO_STREAMING_TRACE = 0b0100_0000;
        const UART_COMMUNICATION_PORT = 0b1000_0000;
        const USB_COM_PORT = 0b1_0000_0000;
    }
}

/// Probe serial number, at most 32 characters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialNumber(String<SERIAL_CAPACITY>);

impl SerialNumber {
    /// Takes `serial` as is, dropping characters past the capacity.
    pub fn new(serial: &str) -> Self {
        let mut value = String::new();
        for c in serial.chars() {
            if value.push(c).is_err() {
                break;
            }
        }
        Self(value)
    }

    /// Station MAC address as 12 uppercase hex digits.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut value = String::new();
        for byte in mac {
            // 12 digits always fit.
            let _ = write!(value, "{:02X}", byte);
        }
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Target reported to the host when the probe is locked to one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetInfo<'a> {
    pub device_vendor: &'a str,
    pub device_name: &'a str,
    pub board_vendor: &'a str,
    pub board_name: &'a str,
}

impl Default for TargetInfo<'_> {
    fn default() -> Self {
        Self {
            device_vendor: "Arm",
            device_name: "Cortex-M",
            board_vendor: "Arm",
            board_name: "Arm board",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeInfo<'a> {
    pub vendor: &'a str,
    pub product: &'a str,
    pub serial: SerialNumber,
    pub firmware_version: Option<&'a str>,
    pub target: Option<TargetInfo<'a>>,
    pub capabilities: DapCapabilities,
    pub timestamp_clock: u32,
    pub packet_count: u8,
    pub packet_size: u16,
}

impl Default for ProbeInfo<'_> {
    fn default() -> Self {
        Self {
            vendor: DEFAULT_VENDOR,
            product: DEFAULT_PRODUCT,
            serial: SerialNumber::default(),
            firmware_version: None,
            target: None,
            capabilities: DapCapabilities::SWD
                | DapCapabilities::JTAG
                | DapCapabilities::ATOMIC_COMMANDS
                | DapCapabilities::TEST_DOMAIN_TIMER,
            timestamp_clock: DEFAULT_TIMESTAMP_CLOCK,
            packet_count: DAP_PACKET_COUNT,
            packet_size: DAP_PACKET_SIZE,
        }
    }
}

/// Answer to one `DAP_Info` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoValue<'s> {
    Empty,
    Str(&'s str),
    U8(u8),
    U16(u16),
    U32(u32),
}

impl InfoValue<'_> {
    /// Writes the length byte and the value. Strings get a NUL terminator
    /// which the length byte includes.
    pub fn write_to<C: CursorWrite>(&self, cursor: &mut C) -> Result<(), CursorError> {
        match *self {
            InfoValue::Empty | InfoValue::Str("") => cursor.write_u8(0),
            InfoValue::Str(value) => {
                let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize - 1)];
                cursor.write_u8(bytes.len() as u8 + 1)?;
                cursor.write(bytes)?;
                cursor.write_u8(0)
            }
            InfoValue::U8(value) => {
                cursor.write_u8(1)?;
                cursor.write_u8(value)
            }
            InfoValue::U16(value) => {
                cursor.write_u8(2)?;
                cursor.write_u16(value)
            }
            InfoValue::U32(value) => {
                cursor.write_u8(4)?;
                cursor.write_u32(value)
            }
        }
    }
}

impl<'a> ProbeInfo<'a> {
    pub fn lookup(&self, id: u8) -> InfoValue<'_> {
        let id = match DapInfoId::try_from_primitive(id) {
            Ok(id) => id,
            Err(_) => return InfoValue::Empty,
        };
        match (id, self.target.as_ref()) {
            (DapInfoId::Vendor, _) => InfoValue::Str(self.vendor),
            (DapInfoId::Product, _) => InfoValue::Str(self.product),
            (DapInfoId::SerialNumber, _) => InfoValue::Str(self.serial.as_str()),
            (DapInfoId::CmsisDapVer, _) => InfoValue::Str(CMSIS_DAP_PROTOCOL_VERSION),
            (DapInfoId::DeviceVendor, Some(target)) => InfoValue::Str(target.device_vendor),
            (DapInfoId::DeviceName, Some(target)) => InfoValue::Str(target.device_name),
            (DapInfoId::BoardVendor, Some(target)) => InfoValue::Str(target.board_vendor),
            (DapInfoId::BoardName, Some(target)) => InfoValue::Str(target.board_name),
            (DapInfoId::ProductFirmwareVer, _) => {
                self.firmware_version.map_or(InfoValue::Empty, InfoValue::Str)
            }
            (DapInfoId::Capabilities, _) => InfoValue::U16(self.capabilities.bits()),
            (DapInfoId::TimeStampClock, _) => InfoValue::U32(self.timestamp_clock),
            (DapInfoId::PacketCount, _) => InfoValue::U8(self.packet_count),
            (DapInfoId::PacketSize, _) => InfoValue::U16(self.packet_size),
            _ => InfoValue::Empty,
        }
    }
}
