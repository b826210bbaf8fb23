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

//! CMSIS-DAP commands carried over TCP.
//!
//! Every message is an 8 byte [`PacketHeader`] followed by at most
//! [`MAX_PAYLOAD`] bytes of CMSIS-DAP command data. [`DapServer`] accepts
//! one client at a time and answers each request frame with exactly one
//! response frame.

mod error;
mod packet;
mod server;

pub use crate::error::*;
pub use crate::packet::*;
pub use crate::server::*;
