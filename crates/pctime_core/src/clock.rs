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

    clock.rs

    The cycle budget that ties emulated time to instruction execution.

    Emulated time advances in whole milliseconds ("ticks"). Each tick grants
    the CPU `cycle_max` cycles, handed out in smaller allowances so the CPU
    returns to the scheduler in time for the next queued event. The position
    within the current tick is derived from how many of those cycles have
    been consumed.

*/

use serde::{Deserialize, Serialize};

pub const DEFAULT_CYCLES_PER_MS: u32 = 3000;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleBudget {
    /// Whole milliseconds elapsed.
    ticks: u64,
    /// Cycles granted per millisecond.
    cycle_max: i32,
    /// Allowance currently handed to the CPU. The CPU counts this down as it executes.
    cycles: i32,
    /// Cycles of the current millisecond not yet handed out.
    cycle_left: i32,
}

impl CycleBudget {
    pub fn new(cycles_per_ms: u32) -> Self {
        Self {
            ticks: 0,
            cycle_max: cycles_per_ms.clamp(1, i32::MAX as u32) as i32,
            cycles: 0,
            cycle_left: 0,
        }
    }

    pub fn reset(&mut self) {
        self.ticks = 0;
        self.cycles = 0;
        self.cycle_left = 0;
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    #[inline]
    pub fn cycle_max(&self) -> i32 {
        self.cycle_max
    }

    #[inline]
    pub fn cycles(&self) -> i32 {
        self.cycles
    }

    #[inline]
    pub fn cycle_left(&self) -> i32 {
        self.cycle_left
    }

    /// Cycles consumed so far in the current millisecond.
    #[inline]
    pub fn tick_index_nd(&self) -> i64 {
        self.cycle_max as i64 - self.cycle_left as i64 - self.cycles as i64
    }

    /// Fraction of the current millisecond already consumed.
    #[inline]
    pub fn tick_index(&self) -> f64 {
        self.tick_index_nd() as f64 / self.cycle_max as f64
    }

    /// Current emulated time in fractional milliseconds.
    #[inline]
    pub fn full_index(&self) -> f64 {
        self.ticks as f64 + self.tick_index()
    }

    /// Convert a span of emulated time to cycles.
    #[inline]
    pub fn make_cycles(&self, ms: f64) -> i64 {
        (ms * self.cycle_max as f64) as i64
    }

    /// Start a new millisecond with a full cycle budget.
    pub(crate) fn advance_tick(&mut self) {
        self.cycle_left = self.cycle_max;
        self.cycles = 0;
        self.ticks += 1;
    }

    /// Take back whatever is left of the current allowance so the CPU returns to the
    /// scheduler after its current instruction.
    #[inline]
    pub(crate) fn end_allowance(&mut self) {
        self.cycle_left += self.cycles;
        self.cycles = 0;
    }

    /// Hand `cycles` of the remaining budget to the CPU.
    #[inline]
    pub(crate) fn grant(&mut self, cycles: i32) {
        self.cycles = cycles;
        self.cycle_left -= cycles;
    }

    /// Count down the CPU allowance.
    #[inline]
    pub(crate) fn consume(&mut self, cycles: i32) {
        self.cycles -= cycles;
    }

    /// Change the per-millisecond budget, keeping the position within the current
    /// millisecond proportional.
    pub fn set_cycle_max(&mut self, cycles_per_ms: u32) {
        let new_max = cycles_per_ms.clamp(1, i32::MAX as u32) as i32;
        let scale = new_max as f64 / self.cycle_max as f64;
        self.cycles = (self.cycles as f64 * scale) as i32;
        self.cycle_left = (self.cycle_left as f64 * scale) as i32;
        self.cycle_max = new_max;
    }
}
