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

//! Debug pins on a Linux GPIO character device.
//!
//! Every direction change reconfigures the line request, so SWDIO
//! turnarounds cost a few system calls. Lines without a pin number behave
//! like an unconnected, pulled up input.

use std::path::Path;

use anyhow::Context;
use gpiocdev::line::{Bias, Drive, Offset, Value};
use gpiocdev::Request;
use rust_dap::{ClockTiming, DapPin, PinDirection, PinSet};

use crate::board::{Board, HostDelay};
use crate::Args;

const CONSUMER: &str = "dap-tcp-server";

pub type GpioPinSet = PinSet<CdevPin, CdevPin, CdevPin, CdevPin, CdevPin, CdevPin, HostDelay>;
pub type GpioBoard = Board<GpioPinSet, CdevPin>;

fn to_value(level: bool) -> Value {
    if level {
        Value::Active
    } else {
        Value::Inactive
    }
}

pub struct CdevPin {
    line: Option<(Request, Offset)>,
    direction: PinDirection,
    driving: bool,
    level: bool,
}

impl CdevPin {
    /// Requests `offset` on `chip` as an input.
    pub fn open(chip: &Path, offset: Offset) -> Result<Self, gpiocdev::Error> {
        let request = Request::builder()
            .on_chip(chip)
            .with_consumer(CONSUMER)
            .with_line(offset)
            .as_input()
            .request()?;
        Ok(Self {
            line: Some((request, offset)),
            direction: PinDirection::Input,
            driving: false,
            level: false,
        })
    }

    pub fn unconnected() -> Self {
        Self {
            line: None,
            direction: PinDirection::Input,
            driving: false,
            level: true,
        }
    }

    fn open_optional(chip: &Path, offset: Option<Offset>, name: &str) -> anyhow::Result<Self> {
        match offset {
            Some(offset) => Self::open(chip, offset)
                .with_context(|| format!("cannot request {} (line {}) on {}", name, offset, chip.display())),
            None => Ok(Self::unconnected()),
        }
    }

    fn reconfigure(&self) {
        let (request, offset) = match &self.line {
            Some(line) => line,
            None => return,
        };
        let open_drain = self.direction == PinDirection::OpenDrainPullUp;
        let mut config = request.config();
        config.with_line(*offset);
        if self.driving {
            config.as_output(to_value(self.level));
            config.with_drive(if open_drain {
                Drive::OpenDrain
            } else {
                Drive::PushPull
            });
        } else {
            config.as_input();
        }
        config.with_bias(if open_drain {
            Bias::PullUp
        } else {
            Bias::Disabled
        });
        // A line which cannot be reconfigured keeps its previous state.
        let _ = request.reconfigure(&config);
    }
}

impl DapPin for CdevPin {
    fn read(&mut self) -> bool {
        match &self.line {
            Some((request, offset)) => matches!(request.value(*offset), Ok(Value::Active)),
            None => true,
        }
    }
    fn set(&mut self, level: bool) {
        self.level = level;
        if let (true, Some((request, offset))) = (self.driving, &self.line) {
            let _ = request.set_value(*offset, to_value(level));
        }
    }
    fn set_direction(&mut self, direction: PinDirection) {
        self.direction = direction;
        self.driving = direction == PinDirection::PushPull;
        self.reconfigure();
    }
    fn output_enable(&mut self) {
        self.driving = true;
        self.reconfigure();
    }
    fn output_disable(&mut self) {
        self.driving = false;
        self.reconfigure();
    }
}

/// Opens every configured line of `args.chip`.
pub fn open_board(args: &Args, timing: ClockTiming) -> anyhow::Result<GpioBoard> {
    let chip = args.chip.as_path();
    let pins = PinSet {
        swclk: CdevPin::open_optional(chip, Some(args.swclk), "SWCLK/TCK")?,
        swdio: CdevPin::open_optional(chip, Some(args.swdio), "SWDIO/TMS")?,
        tdi: CdevPin::open_optional(chip, args.tdi, "TDI")?,
        tdo: CdevPin::open_optional(chip, args.tdo, "TDO")?,
        ntrst: CdevPin::open_optional(chip, args.ntrst, "nTRST")?,
        nreset: CdevPin::open_optional(chip, args.nreset, "nRESET")?,
        delay: HostDelay::new(timing),
    };
    let connect_led = CdevPin::open_optional(chip, args.led_connect, "connect LED")?;
    let running_led = CdevPin::open_optional(chip, args.led_running, "running LED")?;
    Ok(Board::new(pins, connect_led, running_led))
}
