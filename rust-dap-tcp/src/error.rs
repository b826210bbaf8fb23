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

use std::io;

use rust_dap::DapError;
use thiserror::Error;

use crate::packet::MAX_PAYLOAD;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("bad signature {0:#010x}")]
    BadSignature(u32),
    #[error("unexpected packet type {0}")]
    UnexpectedPacketType(u8),
    #[error("payload length {0} exceeds {}", MAX_PAYLOAD)]
    Oversize(usize),
}

#[derive(Debug, Error)]
pub enum Error {
    /// The listening socket failed. The server cannot continue.
    #[error("listener error: {0}")]
    Listener(#[source] io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("DAP command failed: {0:?}")]
    Dispatch(DapError),
}

impl From<DapError> for Error {
    fn from(err: DapError) -> Self {
        Self::Dispatch(err)
    }
}

impl Error {
    /// Session errors only end the session; anything else ends the server.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Listener(_))
    }
}
