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

    emulator/mod.rs

    Definition of the headless [Emulator]: a timing core, the demo CPU and
    a couple of synthetic devices that exercise the scheduler.

*/

use std::{cell::Cell, rc::Rc};

use anyhow::{Context, Error};
use colored::Colorize;

use pctime_config::ConfigFileParams;
use pctime_core::{
    devices::pit::{ChannelMode, PIT_TICK_RATE},
    SpeakerSink,
    TimingCore,
};

use crate::{bios::bios_init, cpu::DemoCpu};

/// A synthetic keystroke arrives every this many milliseconds.
pub const KEYSTROKE_INTERVAL_MS: u64 = 50;
/// Offset of the keystroke into its millisecond.
pub const KEYSTROKE_PHASE_MS: f64 = 0.37;
pub const KEYBOARD_IRQ: u8 = 1;

struct LogSpeaker;

impl SpeakerSink for LogSpeaker {
    fn channel2_reprogrammed(&mut self, counter: u32, mode: ChannelMode) {
        log::debug!(
            "Speaker: Channel 2 set to {:.1}Hz in mode {}",
            PIT_TICK_RATE as f64 / counter as f64,
            mode
        );
    }

    fn speaker_control(&mut self, gate: bool, data: bool) {
        log::debug!("Speaker: gate {} data {}", gate, data);
    }
}

#[derive(Debug, Default)]
pub struct RunStats {
    pub ms_run: u64,
    pub keystrokes: u64,
    pub ticks_seen: u64,
}

pub struct Emulator {
    pub config: ConfigFileParams,
    pub core: TimingCore,
    pub cpu: DemoCpu,
    keystrokes: Rc<Cell<u64>>,
    ticks_seen: Rc<Cell<u64>>,
}

impl Emulator {
    pub fn new(config: ConfigFileParams) -> Result<Self, Error> {
        let mut core = TimingCore::new(config.timing.clone()).context("Failed to create timing core")?;
        core.set_speaker_sink(Box::new(LogSpeaker));

        let keystrokes = Rc::new(Cell::new(0u64));
        let ticks_seen = Rc::new(Cell::new(0u64));

        // Keyboard: each scheduled keystroke pulses IRQ 1.
        let kb_count = keystrokes.clone();
        let kb_id = core.register_handler("keyboard", move |core: &mut TimingCore, scancode: u32| {
            log::trace!("Keyboard: scancode {:02X} at {:.4}ms", scancode, core.full_index());
            kb_count.set(kb_count.get() + 1);
            core.lower_irq(KEYBOARD_IRQ);
            core.raise_irq(KEYBOARD_IRQ);
        });

        let tick_count = ticks_seen.clone();
        core.add_tick_handler(move |core: &mut TimingCore| {
            tick_count.set(tick_count.get() + 1);
            if core.ticks() % KEYSTROKE_INTERVAL_MS == 0 {
                let scancode = (core.ticks() / KEYSTROKE_INTERVAL_MS) as u32 & 0x7F;
                core.schedule(kb_id, KEYSTROKE_PHASE_MS, scancode);
            }
        });

        bios_init(&mut core);

        Ok(Self {
            config,
            core,
            cpu: DemoCpu::new(),
            keystrokes,
            ticks_seen,
        })
    }

    pub fn run(&mut self) -> Result<RunStats, Error> {
        let run_ms = self.config.emulator.run_ms;
        log::info!(
            "Running {} ms at {} cycles/ms",
            run_ms,
            self.core.clock().cycle_max()
        );
        self.core.run_for(&mut self.cpu, run_ms);

        if let Some(path) = self.config.emulator.snapshot_file.as_ref() {
            let json = serde_json::to_string_pretty(&self.core.save_state()).context("Failed to serialize snapshot")?;
            std::fs::write(path, json).with_context(|| format!("Couldn't write snapshot: {}", path.display()))?;
            log::info!("Wrote timing snapshot to {}", path.display());
        }

        Ok(RunStats {
            ms_run: run_ms,
            keystrokes: self.keystrokes.get(),
            ticks_seen: self.ticks_seen.get(),
        })
    }

    pub fn report(&self, stats: &RunStats) {
        println!("{}", "Run complete".bold());
        println!(
            "  emulated: {} ms ({:.4} ms clock), {} instructions, {} cycles",
            stats.ms_run,
            self.core.full_index(),
            self.cpu.instructions,
            self.cpu.cycles
        );
        println!("  ticks: {}  keystrokes: {}", stats.ticks_seen, stats.keystrokes);

        let counters = self.core.counters();
        println!("{}", "Interrupts".bold());
        for (irq, raised) in counters.raised.iter().enumerate().filter(|(_, r)| **r > 0) {
            println!("  IRQ{:<2} raised {}", irq, raised);
        }
        for (vector, count) in &self.cpu.vectors {
            println!("  vector {:02X}h taken {}", vector, count);
        }
        let taken = self.cpu.interrupts_taken();
        let taken = if taken == counters.delivered {
            taken.to_string().green()
        }
        else {
            taken.to_string().red()
        };
        println!("  delivered: {} taken: {}", counters.delivered, taken);

        let queue = self.core.queue_stats();
        let dropped = if queue.dropped > 0 {
            queue.dropped.to_string().red()
        }
        else {
            queue.dropped.to_string().green()
        };
        println!("{}", "Event queue".bold());
        println!(
            "  pending: {} peak: {} fired: {} dropped: {}",
            queue.pending, queue.peak_pending, queue.fired, dropped
        );

        let now = self.core.full_index();
        println!("{}", "Timer".bold());
        for channel in self.core.pit().get_string_state(now).channels {
            println!(
                "  count {} reload {} mode {} output {} gate {}",
                channel.value, channel.reload_value, channel.channel_mode, channel.output, channel.gate
            );
        }
    }
}
