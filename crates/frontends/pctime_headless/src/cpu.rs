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

    cpu.rs

    A stand-in for an instruction-level CPU. It burns its allowance in
    fixed-size instructions and services each interrupt by issuing a
    non-specific EOI at the start of its next run.

*/

use std::collections::BTreeMap;

use pctime_core::{
    devices::pic::{PIC_COMMAND_PORT, PIC_SLAVE_COMMAND_PORT, PIC_SLAVE_VECTOR_BASE},
    CpuInterface,
    IoDevice,
    TimingCore,
};

pub const INSTRUCTION_CYCLES: i32 = 4;
const NONSPECIFIC_EOI: u8 = 0x20;

#[derive(Default)]
pub struct DemoCpu {
    pub interrupt_flag: bool,
    pub instructions: u64,
    pub cycles: u64,
    pub vectors: BTreeMap<u8, u64>,
    // Vectors entered but not yet acknowledged, innermost last.
    in_service: Vec<u8>,
}

impl DemoCpu {
    pub fn new() -> Self {
        Self {
            interrupt_flag: true,
            ..Default::default()
        }
    }

    pub fn interrupts_taken(&self) -> u64 {
        self.vectors.values().sum()
    }

    fn send_eoi(core: &mut TimingCore, vector: u8) {
        if vector >= PIC_SLAVE_VECTOR_BASE {
            core.write_u8(PIC_SLAVE_COMMAND_PORT, NONSPECIFIC_EOI);
        }
        core.write_u8(PIC_COMMAND_PORT, NONSPECIFIC_EOI);
    }
}

impl CpuInterface for DemoCpu {
    fn interrupts_enabled(&self) -> bool {
        self.interrupt_flag
    }

    fn execute(&mut self, core: &mut TimingCore) {
        while let Some(vector) = self.in_service.pop() {
            Self::send_eoi(core, vector);
        }
        while core.cycles_remaining() > 0 {
            let step = INSTRUCTION_CYCLES.min(core.cycles_remaining());
            core.consume_cycles(step);
            self.cycles += step as u64;
            self.instructions += 1;
        }
    }

    fn hw_interrupt(&mut self, vector: u8) {
        *self.vectors.entry(vector).or_insert(0) += 1;
        self.in_service.push(vector);
    }
}
