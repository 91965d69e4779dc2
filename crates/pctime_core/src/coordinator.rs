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

    coordinator.rs

    Hands the CPU its cycle allowances. Each emulated millisecond is split
    into allowances that end at the next queued event; between allowances
    due events are fired and pending interrupts are delivered.

*/

use crate::machine::TimingCore;

/// The instruction execution side of the machine.
pub trait CpuInterface {
    /// State of the CPU's interrupt flag.
    fn interrupts_enabled(&self) -> bool;
    /// Run until `core.cycles_remaining()` drops to zero or below, consuming cycles as
    /// instructions execute.
    fn execute(&mut self, core: &mut TimingCore);
    /// Enter the interrupt handler for `vector`.
    fn hw_interrupt(&mut self, vector: u8);
    /// Whether the code and data segment registers are equal. Only consulted for IRQs
    /// configured to require it.
    fn code_data_segments_equal(&self) -> bool {
        true
    }
}

impl TimingCore {
    /// Fire due events and hand the CPU its next allowance. Returns false when the
    /// current millisecond is used up.
    pub fn run_queue(&mut self, cpu: &mut dyn CpuInterface) -> bool {
        self.clock.end_allowance();
        if self.clock.cycle_left() <= 0 {
            return false;
        }

        let now = self.clock.full_index();
        self.drain_due(now);

        // Run until the next event, or to the end of the millisecond.
        let cycle_left = self.clock.cycle_left() as i64;
        let cycles = match self.queue.next_time() {
            Some(time) => self.clock.make_cycles(time - self.clock.full_index()).max(1).min(cycle_left),
            None => cycle_left,
        };
        self.clock.grant(cycles as i32);

        if self.pics.irq_check() {
            self.check_interrupts(cpu);
        }
        true
    }

    /// Start a new millisecond and run the tick handlers.
    pub fn add_tick(&mut self) {
        self.clock.advance_tick();
        self.run_tick_handlers();
    }

    /// Deliver the highest priority pending interrupt if the CPU can take it. The CPU
    /// calls this whenever an interrupt may have become deliverable, such as after
    /// re-enabling interrupts.
    pub fn check_interrupts(&mut self, cpu: &mut dyn CpuInterface) -> Option<u8> {
        if !self.pics.irq_check() || !cpu.interrupts_enabled() {
            return None;
        }
        let vector = self.pics.acknowledge(cpu.code_data_segments_equal())?;
        log::trace!("PIC: Delivering vector {:02X}", vector);
        self.counters.delivered += 1;
        cpu.hw_interrupt(vector);
        Some(vector)
    }

    /// Run `ms` emulated milliseconds.
    pub fn run_for(&mut self, cpu: &mut dyn CpuInterface, ms: u64) {
        for _ in 0..ms {
            self.add_tick();
            while self.run_queue(cpu) {
                cpu.execute(self);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        devices::{
            pic::{PIC_COMMAND_PORT, PIC_DATA_PORT},
            pit::{PIT_CHANNEL_0_DATA_PORT, PIT_COMMAND_REGISTER, PIT_TICK_MS},
        },
        io::IoDevice,
        machine_config::TimingConfig,
        scheduler::EventKind,
    };
    use std::{cell::RefCell, rc::Rc};

    /// Burns its whole allowance in fixed steps, acknowledging each interrupt with a
    /// non-specific EOI at the start of its next run.
    #[derive(Default)]
    struct TestCpu {
        interrupts_enabled: bool,
        step: i32,
        vectors: Vec<u8>,
        eoi_pending: bool,
        cs_equ_ds: bool,
    }

    impl TestCpu {
        fn new() -> Self {
            Self {
                interrupts_enabled: true,
                step: 1,
                cs_equ_ds: true,
                ..Default::default()
            }
        }
    }

    impl CpuInterface for TestCpu {
        fn interrupts_enabled(&self) -> bool {
            self.interrupts_enabled
        }

        fn execute(&mut self, core: &mut TimingCore) {
            if self.eoi_pending {
                self.eoi_pending = false;
                if *self.vectors.last().unwrap_or(&0) >= 0x70 {
                    core.write_u8(0xA0, 0x20);
                }
                core.write_u8(PIC_COMMAND_PORT, 0x20);
            }
            while core.cycles_remaining() > 0 {
                core.consume_cycles(self.step.min(core.cycles_remaining()));
            }
        }

        fn hw_interrupt(&mut self, vector: u8) {
            self.vectors.push(vector);
            self.eoi_pending = true;
        }

        fn code_data_segments_equal(&self) -> bool {
            self.cs_equ_ds
        }
    }

    fn core() -> TimingCore {
        TimingCore::new(TimingConfig::default()).unwrap()
    }

    fn program_channel0(core: &mut TimingCore, control: u8, reload: u16) {
        core.write_u8(PIT_COMMAND_REGISTER, control);
        core.write_u8(PIT_CHANNEL_0_DATA_PORT, (reload & 0xFF) as u8);
        core.write_u8(PIT_CHANNEL_0_DATA_PORT, (reload >> 8) as u8);
    }

    #[test]
    fn run_queue_idles_without_cycles() {
        let mut core = core();
        let mut cpu = TestCpu::new();
        // Power-on: the first millisecond has not started yet.
        assert!(!core.run_queue(&mut cpu));
        core.add_tick();
        assert!(core.run_queue(&mut cpu));
        assert_eq!(core.cycles_remaining(), 3000);
        cpu.execute(&mut core);
        assert!(!core.run_queue(&mut cpu));
    }

    #[test]
    fn time_is_continuous() {
        let mut core = core();
        let mut cpu = TestCpu::new();
        cpu.step = 7;
        core.run_for(&mut cpu, 3);
        assert_eq!(core.ticks(), 3);
        assert!((core.full_index() - 4.0).abs() < 1e-9);
        core.add_tick();
        assert!((core.full_index() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn pit_mode2_scenario() {
        let mut core = core();
        let mut cpu = TestCpu::new();
        let start = core.full_index();

        // Channel 0, LSB then MSB, mode 2, binary: ~1kHz
        program_channel0(&mut core, 0x34, 1193);
        assert_eq!(core.counters().raised[0], 0);
        let timer_events: Vec<f64> = core
            .pending_events()
            .filter(|e| e.kind == EventKind::PitTimer0)
            .map(|e| e.time)
            .collect();
        assert_eq!(timer_events.len(), 1);
        assert!((timer_events[0] - (start + 1193.0 * PIT_TICK_MS)).abs() < 1e-9);

        // One millisecond is a little more than one period.
        core.run_for(&mut cpu, 1);
        core.add_tick();
        assert!(core.run_queue(&mut cpu));

        assert_eq!(core.counters().raised[0], 1);
        assert_eq!(cpu.vectors, vec![0x08]);

        // Latch and read back: wrapped to within one tick of the reload.
        core.write_u8(PIT_COMMAND_REGISTER, 0x00);
        let lsb = core.read_u8(PIT_CHANNEL_0_DATA_PORT) as u32;
        let msb = core.read_u8(PIT_CHANNEL_0_DATA_PORT) as u32;
        let count = msb << 8 | lsb;
        assert!((1192..=1193).contains(&count), "count {}", count);
    }

    #[test]
    fn system_timer_rate() {
        let mut core = core();
        let mut cpu = TestCpu::new();
        program_channel0(&mut core, 0x34, 1193);
        core.run_for(&mut cpu, 100);
        // 100ms at 1000.15Hz, the last interrupt of the final millisecond runs on the next tick.
        assert!((99..=100).contains(&cpu.vectors.len()), "{}", cpu.vectors.len());
        assert!(cpu.vectors.iter().all(|&v| v == 0x08));
    }

    #[test]
    fn events_fire_on_time_within_allowance() {
        let mut core = core();
        let mut cpu = TestCpu::new();
        let fired_at = Rc::new(RefCell::new(Vec::new()));
        let sink = fired_at.clone();
        let id = core.register_handler("probe", move |core: &mut TimingCore, _: u32| {
            sink.borrow_mut().push(core.full_index());
        });

        core.add_tick();
        assert!(core.run_queue(&mut cpu));
        core.consume_cycles(600);
        // Scheduled mid-allowance: the allowance is cut so the CPU comes back in time.
        core.schedule(id, 0.1, 0);
        assert_eq!(core.cycles_remaining(), 0);
        while core.run_queue(&mut cpu) {
            cpu.execute(&mut core);
        }

        let fired = fired_at.borrow();
        assert_eq!(fired.len(), 1);
        assert!((fired[0] - 1.3).abs() < 1.0 / 3000.0 + 1e-9, "fired at {}", fired[0]);
    }

    #[test]
    fn interrupts_wait_for_cpu() {
        let mut core = core();
        let mut cpu = TestCpu::new();
        cpu.interrupts_enabled = false;
        core.add_tick();
        core.raise_irq(1);
        assert!(core.run_queue(&mut cpu));
        assert!(cpu.vectors.is_empty());
        assert!(core.irq_pending());

        cpu.interrupts_enabled = true;
        assert_eq!(core.check_interrupts(&mut cpu), Some(0x09));
        assert_eq!(cpu.vectors, vec![0x09]);
        assert!(!core.irq_pending());
        assert_eq!(core.counters().delivered, 1);
    }

    #[test]
    fn delivers_in_priority_order_with_eoi() {
        let mut core = core();
        let mut cpu = TestCpu::new();
        core.write_u8(PIC_DATA_PORT, 0x00);
        core.write_u8(0xA1, 0x00);
        core.add_tick();
        core.raise_irq(5);
        core.raise_irq(3);
        core.raise_irq(14);
        core.run_for(&mut cpu, 1);
        // Slave lines sit on the master's cascade line (2), ahead of 3 and 5.
        assert_eq!(cpu.vectors, vec![0x76, 0x0B, 0x0D]);
    }

    #[test]
    fn ticks_run_handlers_each_millisecond() {
        let mut core = core();
        let mut cpu = TestCpu::new();
        let count = Rc::new(RefCell::new(0u32));
        let sink = count.clone();
        core.add_tick_handler(move |core: &mut TimingCore| {
            *sink.borrow_mut() += 1;
            assert_eq!(core.tick_index(), 0.0);
        });
        core.run_for(&mut cpu, 5);
        assert_eq!(*count.borrow(), 5);
    }

    #[test]
    fn cs_equ_ds_hack_holds_irq() {
        let config = TimingConfig {
            pic: crate::machine_config::PicConfig {
                cs_equ_ds_irqs: vec![1],
                ..Default::default()
            },
            ..Default::default()
        };
        let mut core = TimingCore::new(config).unwrap();
        let mut cpu = TestCpu::new();
        cpu.cs_equ_ds = false;
        core.add_tick();
        core.raise_irq(1);
        assert!(core.run_queue(&mut cpu));
        assert!(cpu.vectors.is_empty());
        assert!(core.irq_pending());

        cpu.cs_equ_ds = true;
        assert_eq!(core.check_interrupts(&mut cpu), Some(0x09));
    }
}
