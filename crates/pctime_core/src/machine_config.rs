/*
    PCTime

    Copyright 2024 The PCTime Authors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    machine_config.rs

    Configuration of the timing core. Compatibility quirks that some guest
    software depends on are modeled as explicit policy switches here rather
    than consulted from globals during arbitration.

*/

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{clock::DEFAULT_CYCLES_PER_MS, scheduler::DEFAULT_QUEUE_CAPACITY};

/// The line on the master PIC wired to the slave's INT output.
pub const PIC_CASCADE_LINE: u8 = 2;
/// Number of IRQ lines addressable at the machine level.
pub const IRQ_LINES: u8 = 16;
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("cycles_per_ms must be between 1 and {max}, got {0}", max = i32::MAX)]
    BadCycles(u32),
    #[error("queue_capacity must be between 1 and {max}, got {0}", max = MAX_QUEUE_CAPACITY)]
    BadQueueCapacity(usize),
    #[error("IRQ {0} is out of range for the cs_equ_ds hack (0-15)")]
    IrqOutOfRange(u8),
    #[error("IRQ {0} addresses the slave PIC, but the slave PIC is disabled")]
    IrqNeedsSlave(u8),
    #[error("cascade policy '{0}' requires the slave PIC to be enabled")]
    CascadePolicyWithoutSlave(&'static str),
}

fn default_true() -> bool {
    true
}

fn default_cycles() -> u32 {
    DEFAULT_CYCLES_PER_MS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PicConfig {
    /// PC/AT cascaded pair. When false, only the master exists (PC/XT).
    #[serde(default = "default_true")]
    pub slave_enabled: bool,
    /// The cascade line's in-service bit on the master never blocks arbitration.
    #[serde(default)]
    pub ignore_cascade_in_service: bool,
    /// Starting a slave interrupt never sets the cascade line's in-service bit on the master.
    #[serde(default)]
    pub never_mark_cascade_in_service: bool,
    /// IRQ lines that are only delivered while the CPU's code and data segments are equal.
    #[serde(default)]
    pub cs_equ_ds_irqs: Vec<u8>,
}

impl Default for PicConfig {
    fn default() -> Self {
        Self {
            slave_enabled: true,
            ignore_cascade_in_service: false,
            never_mark_cascade_in_service: false,
            cs_equ_ds_irqs: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_cycles")]
    pub cycles_per_ms: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub pic: PicConfig,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cycles_per_ms: DEFAULT_CYCLES_PER_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pic: Default::default(),
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycles_per_ms == 0 || self.cycles_per_ms > i32::MAX as u32 {
            return Err(ConfigError::BadCycles(self.cycles_per_ms));
        }
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::BadQueueCapacity(self.queue_capacity));
        }
        for &irq in &self.pic.cs_equ_ds_irqs {
            if irq >= IRQ_LINES {
                return Err(ConfigError::IrqOutOfRange(irq));
            }
            if irq >= 8 && !self.pic.slave_enabled {
                return Err(ConfigError::IrqNeedsSlave(irq));
            }
        }
        if !self.pic.slave_enabled {
            if self.pic.ignore_cascade_in_service {
                return Err(ConfigError::CascadePolicyWithoutSlave("ignore_cascade_in_service"));
            }
            if self.pic.never_mark_cascade_in_service {
                return Err(ConfigError::CascadePolicyWithoutSlave("never_mark_cascade_in_service"));
            }
        }
        Ok(())
    }

    /// Fold the PIC settings into the policy value used during arbitration.
    pub fn pic_policy(&self) -> PicPolicy {
        let mut cs_equ_ds = 0u16;
        for &irq in &self.pic.cs_equ_ds_irqs {
            if irq < IRQ_LINES {
                cs_equ_ds |= 1 << irq;
            }
        }
        PicPolicy {
            slave_enabled: self.pic.slave_enabled,
            ignore_cascade_in_service: self.pic.ignore_cascade_in_service,
            never_mark_cascade_in_service: self.pic.never_mark_cascade_in_service,
            cs_equ_ds_mask: cs_equ_ds,
        }
    }
}

/// Arbitration policy for the PIC pair, constructed once at reset.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PicPolicy {
    pub slave_enabled: bool,
    pub ignore_cascade_in_service: bool,
    pub never_mark_cascade_in_service: bool,
    /// Bit n set: IRQ n requires CS == DS to be delivered.
    pub cs_equ_ds_mask: u16,
}

impl PicPolicy {
    #[inline]
    pub fn requires_cs_equ_ds(&self, irq: u8) -> bool {
        irq < IRQ_LINES && self.cs_equ_ds_mask & (1 << irq) != 0
    }
}
