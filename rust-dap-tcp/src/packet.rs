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

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rust_dap::{BufferCursor, CursorError, CursorRead, CursorWrite, DAP_PACKET_SIZE};

use crate::error::FramingError;

/// `'D' 'A' 'P' 0` read as a little endian word.
pub const DAP_SIGNATURE: u32 = 0x0050_4144;
pub const HEADER_SIZE: usize = 8;
pub const MAX_PAYLOAD: usize = DAP_PACKET_SIZE as usize;
pub const MAX_FRAME: usize = HEADER_SIZE + MAX_PAYLOAD;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Request = 1,
    Response = 2,
}

/// Frame header: signature, payload length, packet type and a reserved byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u16,
    pub packet_type: PacketType,
}

impl PacketHeader {
    /// Header for a `length` byte payload. Fails past [`MAX_PAYLOAD`].
    pub fn new(packet_type: PacketType, length: usize) -> Result<Self, FramingError> {
        if length > MAX_PAYLOAD {
            return Err(FramingError::Oversize(length));
        }
        Ok(Self {
            length: length as u16,
            packet_type,
        })
    }

    pub fn request(length: usize) -> Result<Self, FramingError> {
        Self::new(PacketType::Request, length)
    }

    pub fn response(length: usize) -> Result<Self, FramingError> {
        Self::new(PacketType::Response, length)
    }

    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, FramingError> {
        let mut cursor = BufferCursor::new(&bytes[..]);
        let (signature, length, packet_type) = read_fields(&mut cursor)
            .map_err(|_| FramingError::BadSignature(0))?;
        if signature != DAP_SIGNATURE {
            return Err(FramingError::BadSignature(signature));
        }
        if length as usize > MAX_PAYLOAD {
            return Err(FramingError::Oversize(length as usize));
        }
        let packet_type = PacketType::try_from_primitive(packet_type)
            .map_err(|_| FramingError::UnexpectedPacketType(packet_type))?;
        Ok(Self {
            length,
            packet_type,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let mut cursor = BufferCursor::new(&mut bytes[..]);
        // Exactly HEADER_SIZE bytes are written.
        let _ = write_fields(&mut cursor, self);
        bytes
    }

    /// Total frame size including the header.
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}

fn read_fields<C: CursorRead>(cursor: &mut C) -> Result<(u32, u16, u8), CursorError> {
    let signature = cursor.read_u32()?;
    let length = cursor.read_u16()?;
    let packet_type = cursor.read_u8()?;
    Ok((signature, length, packet_type))
}

fn write_fields<C: CursorWrite>(cursor: &mut C, header: &PacketHeader) -> Result<(), CursorError> {
    cursor.write_u32(DAP_SIGNATURE)?;
    cursor.write_u16(header.length)?;
    cursor.write_u8(header.packet_type.into())?;
    cursor.write_u8(0)
}

/// Builds a complete frame of `packet_type` around `payload`.
pub fn encode_frame(packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let header = PacketHeader::new(packet_type, payload.len())?;
    let mut frame = Vec::with_capacity(header.frame_size());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}
