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

    devices::pit.rs

    Implements the 8254 PIT (Programmable Interval Timer).

    Channels are not clocked; the count and output of a channel are computed
    from the emulated time elapsed since the start of its counting cycle.
    Channel 0 drives IRQ 0 through the event queue, channel 2 feeds the
    speaker. The timer never touches the queue or the PIC itself; side
    effects are queued as PitEffects for the timing core to apply.

*/

use std::collections::VecDeque;

use modular_bitfield::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

pub const PIT_CHANNEL_0_DATA_PORT: u16 = 0x40;
pub const PIT_CHANNEL_1_DATA_PORT: u16 = 0x41;
pub const PIT_CHANNEL_2_DATA_PORT: u16 = 0x42;
pub const PIT_COMMAND_REGISTER: u16 = 0x43;

pub const PIT_TICK_RATE: u32 = 1_193_182;
/// PIT ticks per millisecond.
pub const PIT_TICK_RATE_KHZ: f64 = PIT_TICK_RATE as f64 / 1000.0;
/// Duration of one PIT tick in milliseconds.
pub const PIT_TICK_MS: f64 = 1000.0 / PIT_TICK_RATE as f64;

// Absorbs float error when converting elapsed milliseconds back to whole ticks.
const TICK_EPSILON: f64 = 1e-4;

const READBACK_LATCH_COUNT_DISABLE: u8 = 0b0010_0000;
const READBACK_LATCH_STATUS_DISABLE: u8 = 0b0001_0000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumIter, Serialize, Deserialize)]
pub enum ChannelMode {
    InterruptOnTerminalCount,
    HardwareRetriggerableOneShot,
    RateGenerator,
    SquareWaveGenerator,
    SoftwareTriggeredStrobe,
    HardwareTriggeredStrobe,
}

// Implemented by hand rather than as a BitfieldSpecifier, as 6 and 7 alias modes 2 and 3.
impl From<u8> for ChannelMode {
    fn from(orig: u8) -> Self {
        match orig & 0x07 {
            0x0 => ChannelMode::InterruptOnTerminalCount,
            0x1 => ChannelMode::HardwareRetriggerableOneShot,
            0x2 | 0x6 => ChannelMode::RateGenerator,
            0x3 | 0x7 => ChannelMode::SquareWaveGenerator,
            0x4 => ChannelMode::SoftwareTriggeredStrobe,
            _ => ChannelMode::HardwareTriggeredStrobe,
        }
    }
}

impl ChannelMode {
    pub fn as_u8(&self) -> u8 {
        match self {
            ChannelMode::InterruptOnTerminalCount => 0,
            ChannelMode::HardwareRetriggerableOneShot => 1,
            ChannelMode::RateGenerator => 2,
            ChannelMode::SquareWaveGenerator => 3,
            ChannelMode::SoftwareTriggeredStrobe => 4,
            ChannelMode::HardwareTriggeredStrobe => 5,
        }
    }

    /// Modes 2 and 3 reload themselves at terminal count.
    #[inline]
    pub fn is_periodic(&self) -> bool {
        matches!(self, ChannelMode::RateGenerator | ChannelMode::SquareWaveGenerator)
    }

    /// Modes 1 and 5 wait for a gate rising edge before counting.
    #[inline]
    pub fn is_gate_triggered(&self) -> bool {
        matches!(
            self,
            ChannelMode::HardwareRetriggerableOneShot | ChannelMode::HardwareTriggeredStrobe
        )
    }

    /// Modes in which a low gate suspends counting.
    #[inline]
    fn gate_suspends(&self) -> bool {
        !self.is_gate_triggered()
    }
}

#[derive(Debug, PartialEq, BitfieldSpecifier)]
enum RwModeField {
    LatchCommand,
    Lsb,
    Msb,
    LsbMsb,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum RwMode {
    Lsb,
    Msb,
    LsbMsb,
}

impl RwMode {
    fn as_bits(&self) -> u8 {
        match self {
            RwMode::Lsb => 1,
            RwMode::Msb => 2,
            RwMode::LsbMsb => 3,
        }
    }
}

#[bitfield]
#[allow(dead_code)]
pub struct ControlByte {
    bcd: bool,
    channel_mode: B3,
    rw_mode: RwModeField,
    channel: B2,
}

#[bitfield]
#[allow(dead_code)]
pub struct StatusByte {
    bcd: bool,
    channel_mode: B3,
    rw_mode: B2,
    null_count: bool,
    output: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadState {
    NoRead,
    ReadLsb,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    WaitingForLsb,
    WaitingForMsb,
}

/// Work the timer asks of its owner.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PitEffect {
    /// Queue channel 0's terminal count at absolute time `at`.
    ScheduleTimer0 { at: f64 },
    /// Withdraw channel 0's pending terminal count.
    CancelTimer0,
    RaiseIrq0,
    LowerIrq0,
    /// Channel 2 received a new reload value.
    Channel2Reprogrammed { counter: u32, mode: ChannelMode },
    /// Port 0x61 speaker bits changed.
    SpeakerControl { gate: bool, data: bool },
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum LoadOutcome {
    Armed,
    Deferred,
}

/// Complete state of one channel, as consumed by save-state code.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PitChannelState {
    pub counter: u32,
    pub counter_current: u32,
    pub mode: ChannelMode,
    pub rw_mode: RwMode,
    pub bcd: bool,
    pub time_base_start: f64,
    pub time_now: f64,
    pub read_state: ReadState,
    pub write_state: LoadState,
    pub gate: bool,
    pub output: bool,
    pub read_latch: u16,
    pub write_latch: u16,
    pub go_read_latch: bool,
    pub status_latch: Option<u8>,
    pub new_mode: bool,
    pub update_count: bool,
    pub counting: bool,
    pub frozen_elapsed: Option<f64>,
    pub half_cycle: bool,
}

pub struct Channel {
    c: usize,
    mode: ChannelMode,
    rw_mode: RwMode,
    bcd: bool,
    counter: u32,         // Programmed reload value (1..=0x10001)
    counter_current: u32, // Reload value in effect for the running cycle
    start: f64,           // Start of the current counting cycle, in ms
    now: f64,             // Time of the last evaluation
    gate: bool,
    output: bool, // Output level at `now`
    read_state: ReadState,
    load_state: LoadState,
    read_latch: u16,
    write_latch: u16,
    go_read_latch: bool, // Next read takes a fresh snapshot of the count
    status_latch: Option<u8>,
    new_mode: bool,      // Control word written, count not yet written
    update_count: bool,  // Programmed reload takes effect at the next natural restart
    counting: bool,      // Armed and counting (modes 1 and 5 wait for the gate)
    frozen_elapsed: Option<f64>, // Elapsed time held while the gate is low
    half_cycle: bool,    // Mode 3: in the second (low) half of the period
}

#[derive(Clone, Default)]
pub struct PitChannelStringState {
    pub value: String,
    pub reload_value: String,
    pub access_mode: String,
    pub channel_mode: String,
    pub output: String,
    pub gate: String,
}

#[derive(Clone, Default)]
pub struct PitStringState {
    pub channels: Vec<PitChannelStringState>,
}

fn bcd_to_bin(value: u16) -> u32 {
    let v = value as u32;
    ((v >> 12) & 0xF) * 1000 + ((v >> 8) & 0xF) * 100 + ((v >> 4) & 0xF) * 10 + (v & 0xF)
}

fn bin_to_bcd(value: u32) -> u16 {
    let v = value % 10000;
    (((v / 1000) % 10) << 12 | ((v / 100) % 10) << 8 | ((v / 10) % 10) << 4 | (v % 10)) as u16
}

impl Channel {
    pub fn new(c: usize) -> Self {
        // Idle until programmed, output high.
        Channel {
            c,
            mode: ChannelMode::SquareWaveGenerator,
            rw_mode: RwMode::LsbMsb,
            bcd: false,
            counter: 0x10000,
            counter_current: 0x10000,
            start: 0.0,
            now: 0.0,
            // Channels 0 and 1 have their gates tied high.
            gate: c != 2,
            output: true,
            read_state: ReadState::NoRead,
            load_state: LoadState::WaitingForLsb,
            read_latch: 0,
            write_latch: 0,
            go_read_latch: true,
            status_latch: None,
            new_mode: true,
            update_count: false,
            counting: false,
            frozen_elapsed: None,
            half_cycle: false,
        }
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }
    pub fn rw_mode(&self) -> RwMode {
        self.rw_mode
    }
    pub fn bcd(&self) -> bool {
        self.bcd
    }
    pub fn counter(&self) -> u32 {
        self.counter
    }
    pub fn counter_current(&self) -> u32 {
        self.counter_current
    }
    pub fn time_base_start(&self) -> f64 {
        self.start
    }
    pub fn time_now(&self) -> f64 {
        self.now
    }
    pub fn gate(&self) -> bool {
        self.gate
    }
    pub fn new_mode(&self) -> bool {
        self.new_mode
    }
    pub fn update_count(&self) -> bool {
        self.update_count
    }
    pub fn is_counting(&self) -> bool {
        self.counting
    }
    pub fn half_cycle(&self) -> bool {
        self.half_cycle
    }

    /// Length of the running cycle in milliseconds.
    #[inline]
    pub fn period_ms(&self) -> f64 {
        self.counter_current as f64 * PIT_TICK_MS
    }

    #[inline]
    fn modulus(&self) -> u64 {
        if self.bcd {
            10000
        }
        else {
            0x10000
        }
    }

    fn elapsed(&self, now: f64) -> f64 {
        match self.frozen_elapsed {
            Some(elapsed) => elapsed,
            None => (now - self.start).max(0.0),
        }
    }

    fn ticks_elapsed(&self, now: f64) -> u64 {
        (self.elapsed(now) * PIT_TICK_RATE_KHZ + TICK_EPSILON) as u64
    }

    /// Live value of the counting element at `now`.
    pub fn current_count(&self, now: f64) -> u32 {
        let modulus = self.modulus();
        let reload = self.counter_current as u64;
        if !self.counting {
            return (reload % modulus) as u32;
        }

        let ticks = self.ticks_elapsed(now);
        let value = match self.mode {
            ChannelMode::RateGenerator => reload - (ticks % reload),
            ChannelMode::SquareWaveGenerator => {
                // Counts down by two, twice per period.
                let mut phase = (ticks % reload) * 2;
                if phase >= reload {
                    phase -= reload;
                }
                (reload - phase) & 0xFFFF_FFFE
            }
            _ => (reload as i64 - ticks as i64).rem_euclid(modulus as i64) as u64,
        };
        (value % modulus) as u32
    }

    /// Output level at `now`.
    pub fn output_at(&self, now: f64) -> bool {
        let reload = self.counter_current as u64;
        match self.mode {
            ChannelMode::InterruptOnTerminalCount => {
                if self.new_mode || !self.counting {
                    return false;
                }
                self.ticks_elapsed(now) >= reload
            }
            ChannelMode::HardwareRetriggerableOneShot => {
                if !self.counting {
                    return true;
                }
                self.ticks_elapsed(now) >= reload
            }
            ChannelMode::RateGenerator => {
                if self.new_mode || !self.counting || self.frozen_elapsed.is_some() {
                    return true;
                }
                // Low for the last tick of each period.
                (self.ticks_elapsed(now) % reload) + 1 < reload
            }
            ChannelMode::SquareWaveGenerator => {
                if self.new_mode || !self.counting || self.frozen_elapsed.is_some() {
                    return true;
                }
                // Odd reloads stay high one tick longer than they stay low.
                (self.ticks_elapsed(now) % reload) < (reload + 1) / 2
            }
            ChannelMode::SoftwareTriggeredStrobe | ChannelMode::HardwareTriggeredStrobe => {
                if self.new_mode || !self.counting {
                    return true;
                }
                self.ticks_elapsed(now) != reload
            }
        }
    }

    /// Bring `time_now`, `output` and the half-cycle bit up to `now`.
    pub fn update(&mut self, now: f64) -> bool {
        self.now = now;
        self.output = self.output_at(now);
        if self.mode == ChannelMode::SquareWaveGenerator && self.counting {
            let reload = self.counter_current as u64;
            self.half_cycle = (self.ticks_elapsed(now) % reload) >= (reload + 1) / 2;
        }
        self.output
    }

    pub fn status_byte(&self, now: f64) -> u8 {
        StatusByte::new()
            .with_bcd(self.bcd)
            .with_channel_mode(self.mode.as_u8())
            .with_rw_mode(self.rw_mode.as_bits())
            .with_null_count(self.new_mode)
            .with_output(self.output_at(now))
            .into_bytes()[0]
    }

    /// Latch the count. A latched count is held until it has been read.
    pub fn latch_count(&mut self, now: f64) {
        if !self.go_read_latch {
            return;
        }
        let count = self.current_count(now);
        self.read_latch = if self.bcd {
            bin_to_bcd(count)
        }
        else {
            count as u16
        };
        self.go_read_latch = false;
    }

    /// Latch the status byte. A latched status is held until it has been read.
    pub fn latch_status(&mut self, now: f64) {
        if self.status_latch.is_none() {
            self.status_latch = Some(self.status_byte(now));
        }
    }

    fn set_mode(&mut self, mode: ChannelMode, rw_mode: RwMode, bcd: bool, now: f64, keep_time_base: bool) {
        log::trace!(
            "PIT: Channel {} selected, channel_mode {:?}, rw mode {:?}, bcd: {:?}",
            self.c,
            mode,
            rw_mode,
            bcd
        );

        self.update(now);
        self.mode = mode;
        self.rw_mode = rw_mode;
        self.bcd = bcd;
        self.read_state = ReadState::NoRead;
        self.load_state = LoadState::WaitingForLsb;
        self.go_read_latch = true;
        self.status_latch = None;
        self.new_mode = true;
        self.update_count = false;

        if !keep_time_base {
            self.start = now;
            self.counting = false;
            self.frozen_elapsed = None;
            self.half_cycle = false;
        }
        self.output = self.output_at(now);
    }

    /// Read a byte from the channel's data port.
    pub fn read_byte(&mut self, now: f64) -> u8 {
        if let Some(status) = self.status_latch.take() {
            return status;
        }
        if self.go_read_latch {
            self.latch_count(now);
        }

        match self.rw_mode {
            RwMode::Lsb => {
                self.go_read_latch = true;
                (self.read_latch & 0xFF) as u8
            }
            RwMode::Msb => {
                self.go_read_latch = true;
                (self.read_latch >> 8) as u8
            }
            RwMode::LsbMsb => match self.read_state {
                ReadState::NoRead => {
                    self.read_state = ReadState::ReadLsb;
                    (self.read_latch & 0xFF) as u8
                }
                ReadState::ReadLsb => {
                    self.read_state = ReadState::NoRead;
                    self.go_read_latch = true;
                    (self.read_latch >> 8) as u8
                }
            },
        }
    }

    /// Write a byte to the channel's data port. Returns the outcome once a complete
    /// reload value has been written.
    fn write_byte(&mut self, byte: u8, now: f64) -> Option<LoadOutcome> {
        match self.rw_mode {
            RwMode::Lsb => self.write_latch = byte as u16,
            RwMode::Msb => self.write_latch = (byte as u16) << 8,
            RwMode::LsbMsb => match self.load_state {
                LoadState::WaitingForLsb => {
                    self.write_latch = byte as u16;
                    self.load_state = LoadState::WaitingForMsb;
                    return None;
                }
                LoadState::WaitingForMsb => {
                    self.write_latch |= (byte as u16) << 8;
                    self.load_state = LoadState::WaitingForLsb;
                }
            },
        }
        Some(self.load_counter(now))
    }

    fn load_counter(&mut self, now: f64) -> LoadOutcome {
        let value = if self.bcd {
            bcd_to_bin(self.write_latch)
        }
        else {
            self.write_latch as u32
        };

        self.counter = match value {
            0 if self.bcd => 9999,
            0 => 0x10000,
            1 if self.mode == ChannelMode::SquareWaveGenerator => 0x10001,
            v => v,
        };

        self.update(now);
        if self.c == 0 && self.counting && self.mode.is_periodic() {
            // The system timer finishes its current cycle before using the new reload.
            log::trace!("PIT: Channel 0 reload {} deferred to end of cycle", self.counter);
            self.update_count = true;
            self.new_mode = false;
            return LoadOutcome::Deferred;
        }

        if !self.new_mode
            && !matches!(
                self.mode,
                ChannelMode::InterruptOnTerminalCount | ChannelMode::SoftwareTriggeredStrobe
            )
        {
            log::warn!(
                "PIT: Channel {} counter set without new control word in mode {}",
                self.c,
                self.mode
            );
        }

        self.start = now;
        self.counter_current = self.counter;
        self.update_count = false;
        self.new_mode = false;
        self.half_cycle = false;
        self.counting = !self.mode.is_gate_triggered();
        self.frozen_elapsed = if !self.gate && self.mode.gate_suspends() {
            Some(0.0)
        }
        else {
            None
        };
        self.output = self.output_at(now);

        log::debug!(
            "PIT: Channel {} armed, mode {}, reload {} ({:.4} Hz)",
            self.c,
            self.mode,
            self.counter_current,
            PIT_TICK_RATE as f64 / self.counter_current as f64
        );
        LoadOutcome::Armed
    }

    pub fn set_gate(&mut self, new_state: bool, now: f64) {
        if new_state == self.gate {
            return;
        }
        self.gate = new_state;

        if !new_state {
            // Falling edge suspends counting in modes 0, 2, 3 and 4.
            if self.counting && self.mode.gate_suspends() && self.frozen_elapsed.is_none() {
                self.frozen_elapsed = Some(self.elapsed(now));
            }
        }
        else if !self.new_mode {
            match self.mode {
                ChannelMode::InterruptOnTerminalCount | ChannelMode::SoftwareTriggeredStrobe => {
                    // Resume from the value held when the gate dropped.
                    if let Some(elapsed) = self.frozen_elapsed.take() {
                        self.start = now - elapsed;
                    }
                }
                ChannelMode::HardwareRetriggerableOneShot
                | ChannelMode::RateGenerator
                | ChannelMode::SquareWaveGenerator
                | ChannelMode::HardwareTriggeredStrobe => {
                    self.frozen_elapsed = None;
                    self.start = now;
                    self.counter_current = self.counter;
                    self.update_count = false;
                    self.half_cycle = false;
                    self.counting = true;
                }
            }
        }
        self.update(now);
    }

    pub fn state(&self) -> PitChannelState {
        PitChannelState {
            counter: self.counter,
            counter_current: self.counter_current,
            mode: self.mode,
            rw_mode: self.rw_mode,
            bcd: self.bcd,
            time_base_start: self.start,
            time_now: self.now,
            read_state: self.read_state,
            write_state: self.load_state,
            gate: self.gate,
            output: self.output,
            read_latch: self.read_latch,
            write_latch: self.write_latch,
            go_read_latch: self.go_read_latch,
            status_latch: self.status_latch,
            new_mode: self.new_mode,
            update_count: self.update_count,
            counting: self.counting,
            frozen_elapsed: self.frozen_elapsed,
            half_cycle: self.half_cycle,
        }
    }

    pub fn set_state(&mut self, state: &PitChannelState) {
        self.counter = state.counter.clamp(1, 0x10001);
        self.counter_current = state.counter_current.clamp(1, 0x10001);
        self.mode = state.mode;
        self.rw_mode = state.rw_mode;
        self.bcd = state.bcd;
        self.start = state.time_base_start;
        self.now = state.time_now;
        self.read_state = state.read_state;
        self.load_state = state.write_state;
        self.gate = state.gate;
        self.output = state.output;
        self.read_latch = state.read_latch;
        self.write_latch = state.write_latch;
        self.go_read_latch = state.go_read_latch;
        self.status_latch = state.status_latch;
        self.new_mode = state.new_mode;
        self.update_count = state.update_count;
        self.counting = state.counting;
        self.frozen_elapsed = state.frozen_elapsed;
        self.half_cycle = state.half_cycle;
    }

    pub fn get_string_state(&self, now: f64) -> PitChannelStringState {
        PitChannelStringState {
            value: format!("{:04X}", self.current_count(now)),
            reload_value: format!("{:04X}", self.counter_current & 0xFFFF),
            access_mode: format!("{}", self.rw_mode),
            channel_mode: format!("{}", self.mode),
            output: format!("{}", self.output_at(now)),
            gate: format!("{}", self.gate),
        }
    }
}

pub struct ProgrammableIntervalTimer {
    channels: [Channel; 3],
    speaker_data: bool,
    effects: VecDeque<PitEffect>,
}
pub type Pit = ProgrammableIntervalTimer;

impl ProgrammableIntervalTimer {
    pub fn new() -> Self {
        Self {
            channels: [Channel::new(0), Channel::new(1), Channel::new(2)],
            speaker_data: false,
            effects: VecDeque::new(),
        }
    }

    /// Return to power-on state. No channel counts until it has been programmed.
    pub fn reset(&mut self) {
        *self = Pit::new();
        self.effects.push_back(PitEffect::SpeakerControl {
            gate: false,
            data: false,
        });
    }

    pub fn channel(&self, c: usize) -> &Channel {
        &self.channels[c]
    }

    #[inline]
    pub fn pop_effect(&mut self) -> Option<PitEffect> {
        self.effects.pop_front()
    }

    /// Take all effects queued since the last call.
    pub fn drain_effects(&mut self) -> std::collections::vec_deque::Drain<'_, PitEffect> {
        self.effects.drain(..)
    }

    pub fn control_register_write(&mut self, byte: u8, now: f64) {
        let control = ControlByte::from_bytes([byte]);
        let c = control.channel() as usize;

        if c == 3 {
            self.read_back(byte, now);
            return;
        }

        let rw_mode = match control.rw_mode() {
            RwModeField::LatchCommand => {
                self.channels[c].latch_count(now);
                return;
            }
            RwModeField::Lsb => RwMode::Lsb,
            RwModeField::Msb => RwMode::Msb,
            RwModeField::LsbMsb => RwMode::LsbMsb,
        };
        let mode = ChannelMode::from(control.channel_mode());

        let channel = &mut self.channels[c];
        let old_output = channel.output_at(now);
        let keep_time_base = c == 0 && channel.counting && channel.mode.is_periodic() && mode.is_periodic();
        channel.set_mode(mode, rw_mode, control.bcd(), now, keep_time_base);

        if c == 0 && !keep_time_base {
            self.effects.push_back(PitEffect::CancelTimer0);
            if mode != ChannelMode::InterruptOnTerminalCount && !old_output {
                // Output goes high on a mode write in every mode but 0.
                self.effects.push_back(PitEffect::RaiseIrq0);
            }
            else {
                self.effects.push_back(PitEffect::LowerIrq0);
            }
        }
    }

    fn read_back(&mut self, byte: u8, now: f64) {
        for (c, channel) in self.channels.iter_mut().enumerate() {
            if byte & (0x02 << c) == 0 {
                continue;
            }
            if byte & READBACK_LATCH_STATUS_DISABLE == 0 {
                channel.latch_status(now);
            }
            if byte & READBACK_LATCH_COUNT_DISABLE == 0 {
                channel.latch_count(now);
            }
        }
    }

    pub fn data_write(&mut self, c: usize, byte: u8, now: f64) {
        let Some(outcome) = self.channels[c].write_byte(byte, now)
        else {
            return;
        };
        let channel = &self.channels[c];

        match (c, outcome) {
            (0, LoadOutcome::Armed) => {
                self.effects.push_back(PitEffect::CancelTimer0);
                match channel.mode {
                    ChannelMode::InterruptOnTerminalCount => {
                        self.effects.push_back(PitEffect::LowerIrq0);
                        self.effects.push_back(PitEffect::ScheduleTimer0 {
                            at: channel.start + channel.period_ms(),
                        });
                    }
                    ChannelMode::RateGenerator
                    | ChannelMode::SquareWaveGenerator
                    | ChannelMode::SoftwareTriggeredStrobe => {
                        self.effects.push_back(PitEffect::ScheduleTimer0 {
                            at: channel.start + channel.period_ms(),
                        });
                    }
                    _ => {}
                }
            }
            (2, _) => {
                self.effects.push_back(PitEffect::Channel2Reprogrammed {
                    counter: channel.counter,
                    mode: channel.mode,
                });
            }
            _ => {}
        }
    }

    pub fn data_read(&mut self, c: usize, now: f64) -> u8 {
        self.channels[c].read_byte(now)
    }

    /// Drive a channel's gate input. Only channel 2's gate is wired to anything.
    pub fn set_gate(&mut self, c: usize, state: bool, now: f64) {
        if c != 2 {
            log::warn!("PIT: Gate of channel {} is tied high", c);
            return;
        }
        self.channels[c].set_gate(state, now);
    }

    pub fn channel_output(&mut self, c: usize, now: f64) -> bool {
        self.channels[c].update(now)
    }

    /// Channel 0 reached terminal count.
    pub fn timer0_event(&mut self, now: f64) {
        self.effects.push_back(PitEffect::RaiseIrq0);

        let channel = &mut self.channels[0];
        if channel.counting && channel.mode.is_periodic() {
            channel.start += channel.period_ms();
            if channel.update_count {
                channel.counter_current = channel.counter;
                channel.update_count = false;
                log::trace!("PIT: Channel 0 reload now {}", channel.counter_current);
            }
            self.effects.push_back(PitEffect::ScheduleTimer0 {
                at: channel.start + channel.period_ms(),
            });
        }
        channel.update(now);
    }

    /// Speaker control bits of port 0x61: bit 0 gates channel 2, bit 1 enables speaker data.
    pub fn write_port61(&mut self, byte: u8, now: f64) {
        let gate = byte & 0x01 != 0;
        let data = byte & 0x02 != 0;
        if gate != self.channels[2].gate || data != self.speaker_data {
            self.speaker_data = data;
            self.channels[2].set_gate(gate, now);
            self.effects.push_back(PitEffect::SpeakerControl { gate, data });
        }
    }

    pub fn read_port61(&mut self, now: f64) -> u8 {
        let mut byte = self.channels[2].gate as u8 | (self.speaker_data as u8) << 1;

        // Bit 4 toggles with each DRAM refresh request from channel 1.
        let refresh = &self.channels[1];
        if refresh.counting {
            let periods = refresh.ticks_elapsed(now) / refresh.counter_current as u64;
            byte |= ((periods & 1) as u8) << 4;
        }
        if self.channels[2].update(now) {
            byte |= 0x20;
        }
        byte
    }

    pub fn speaker_data(&self) -> bool {
        self.speaker_data
    }

    pub fn state(&self) -> [PitChannelState; 3] {
        [
            self.channels[0].state(),
            self.channels[1].state(),
            self.channels[2].state(),
        ]
    }

    pub fn set_state(&mut self, states: &[PitChannelState; 3], speaker_data: bool) {
        for (channel, state) in self.channels.iter_mut().zip(states.iter()) {
            channel.set_state(state);
        }
        self.speaker_data = speaker_data;
        self.effects.clear();
    }

    pub fn get_string_state(&self, now: f64) -> PitStringState {
        PitStringState {
            channels: self.channels.iter().map(|c| c.get_string_state(now)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    /// Middle of PIT tick `t`, counted from `base`.
    fn tick(base: f64, t: u64) -> f64 {
        base + (t as f64 + 0.5) * PIT_TICK_MS
    }

    fn program(pit: &mut Pit, c: usize, mode: u8, reload: u16, now: f64) {
        pit.control_register_write((c as u8) << 6 | 0x30 | (mode << 1), now);
        pit.data_write(c, (reload & 0xFF) as u8, now);
        pit.data_write(c, (reload >> 8) as u8, now);
    }

    fn read_word(pit: &mut Pit, c: usize, now: f64) -> u16 {
        let lsb = pit.data_read(c, now) as u16;
        let msb = pit.data_read(c, now) as u16;
        msb << 8 | lsb
    }

    #[test]
    fn mode_values_alias() {
        assert_eq!(ChannelMode::from(6), ChannelMode::RateGenerator);
        assert_eq!(ChannelMode::from(7), ChannelMode::SquareWaveGenerator);
        for mode in ChannelMode::iter() {
            assert_eq!(ChannelMode::from(mode.as_u8()), mode);
        }
    }

    #[test]
    fn bcd_conversion() {
        assert_eq!(bcd_to_bin(0x1234), 1234);
        assert_eq!(bin_to_bcd(1234), 0x1234);
        assert_eq!(bin_to_bcd(10000), 0x0000);
    }

    #[test]
    fn mode0_counts_down_and_fires_once() {
        let mut pit = Pit::new();
        let base = 10.0;
        let reload = 200u16;
        program(&mut pit, 2, 0, reload, base);
        pit.set_gate(2, true, base);

        let mut last = u32::MAX;
        let mut transitions = 0;
        let mut previous_output = pit.channel(2).output_at(base);
        assert!(!previous_output);

        for t in 0..(reload as u64 * 2) {
            let now = tick(base, t);
            let count = pit.channel(2).current_count(now);
            if t < reload as u64 {
                assert!(count < last);
                assert_eq!(count, reload as u32 - t as u32);
                last = count;
            }
            let output = pit.channel(2).output_at(now);
            assert_eq!(output, t >= reload as u64);
            if output != previous_output {
                transitions += 1;
            }
            previous_output = output;
        }
        assert_eq!(transitions, 1);

        // The count wraps and keeps going after terminal count.
        assert_eq!(pit.channel(2).current_count(tick(base, reload as u64 + 1)), 0xFFFF);
    }

    #[test]
    fn mode3_odd_reload_is_asymmetric() {
        let mut pit = Pit::new();
        let reload = 7u16;
        program(&mut pit, 2, 3, reload, 0.0);
        pit.set_gate(2, true, 0.0);

        let mut high = 0;
        let mut low = 0;
        for t in 0..reload as u64 {
            if pit.channel(2).output_at(tick(0.0, t)) {
                high += 1;
            }
            else {
                low += 1;
            }
        }
        assert_eq!(high, 4);
        assert_eq!(low, 3);
        assert_ne!(high, low);

        // Even reloads are symmetric.
        program(&mut pit, 2, 3, 8, 5.0);
        pit.set_gate(2, false, 5.0);
        pit.set_gate(2, true, 5.0);
        let highs = (0..8).filter(|&t| pit.channel(2).output_at(tick(5.0, t))).count();
        assert_eq!(highs, 4);
    }

    #[test]
    fn mode3_tracks_half_cycle() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 3, 10, 0.0);
        pit.set_gate(2, true, 0.0);
        assert!(pit.channel_output(2, tick(0.0, 2)));
        assert!(!pit.channel(2).half_cycle());
        assert!(!pit.channel_output(2, tick(0.0, 7)));
        assert!(pit.channel(2).half_cycle());
        // Even count, decremented by two.
        assert_eq!(pit.channel(2).current_count(tick(0.0, 1)) % 2, 0);
    }

    #[test]
    fn mode2_pulses_low_for_one_tick() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 2, 5, 0.0);
        pit.set_gate(2, true, 0.0);
        let outputs: Vec<bool> = (0..10).map(|t| pit.channel(2).output_at(tick(0.0, t))).collect();
        assert_eq!(
            outputs,
            vec![true, true, true, true, false, true, true, true, true, false]
        );
        assert_eq!(pit.channel(2).current_count(tick(0.0, 0)), 5);
        assert_eq!(pit.channel(2).current_count(tick(0.0, 5)), 5);
        assert_eq!(pit.channel(2).current_count(tick(0.0, 6)), 4);
    }

    #[test]
    fn mode4_strobes_at_terminal_count() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 4, 6, 0.0);
        pit.set_gate(2, true, 0.0);
        for t in 0..12 {
            assert_eq!(pit.channel(2).output_at(tick(0.0, t)), t != 6);
        }
    }

    #[test]
    fn mode5_strobes_after_gate_edge() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 5, 6, 0.0);
        assert!(!pit.channel(2).is_counting());
        assert!(pit.channel(2).output_at(tick(0.0, 6)));

        pit.set_gate(2, true, 1.0);
        assert!(pit.channel(2).is_counting());
        assert_eq!(pit.channel(2).current_count(tick(1.0, 0)), 6);
        let outputs: Vec<bool> = (0..10).map(|t| pit.channel(2).output_at(tick(1.0, t))).collect();
        assert_eq!(
            outputs,
            vec![true, true, true, true, true, true, false, true, true, true]
        );

        // A second rising edge starts the strobe over from the reload value.
        pit.set_gate(2, false, 2.0);
        pit.set_gate(2, true, 2.0);
        assert_eq!(pit.channel(2).time_base_start(), 2.0);
        assert_eq!(pit.channel(2).current_count(tick(2.0, 0)), 6);
        assert!(pit.channel(2).output_at(tick(2.0, 5)));
        assert!(!pit.channel(2).output_at(tick(2.0, 6)));
        assert!(pit.channel(2).output_at(tick(2.0, 7)));
    }

    #[test]
    fn gate_low_freezes_mode4() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 4, 1000, 0.0);
        pit.set_gate(2, true, 0.0);

        let paused_at = 100.0 * PIT_TICK_MS;
        assert_eq!(pit.channel(2).current_count(paused_at), 900);
        pit.set_gate(2, false, paused_at);
        assert_eq!(pit.channel(2).current_count(paused_at + 5.0), 900);
        assert!(pit.channel(2).output_at(paused_at + 5.0));

        let resumed_at = paused_at + 5.0;
        pit.set_gate(2, true, resumed_at);
        assert_eq!(pit.channel(2).current_count(resumed_at), 900);
        assert_eq!(pit.channel(2).current_count(tick(resumed_at, 400)), 500);
        // The strobe lands 900 ticks after resuming, not 1000 after loading.
        assert!(pit.channel(2).output_at(tick(resumed_at, 899)));
        assert!(!pit.channel(2).output_at(tick(resumed_at, 900)));
        assert!(pit.channel(2).output_at(tick(resumed_at, 901)));
    }

    #[test]
    fn mode0_count_reads_back_through_data_port() {
        let mut pit = Pit::new();
        let base = 2.0;
        program(&mut pit, 0, 0, 500, base);
        program(&mut pit, 2, 0, 500, base);
        pit.set_gate(2, true, base);

        let mut last = u16::MAX;
        for t in [0u64, 1, 2, 100, 250, 499] {
            let now = tick(base, t);
            for c in [0, 2] {
                let count = read_word(&mut pit, c, now);
                assert_eq!(count, 500 - t as u16);
            }
            assert!(read_word(&mut pit, 0, now) < last);
            last = read_word(&mut pit, 2, now);
        }
        assert_eq!(read_word(&mut pit, 0, tick(base, 500)), 0);
        assert_eq!(read_word(&mut pit, 2, tick(base, 501)), 0xFFFF);
    }

    #[test]
    fn mode1_waits_for_gate() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 1, 4, 0.0);
        assert!(!pit.channel(2).is_counting());
        assert!(pit.channel(2).output_at(1.0));

        pit.set_gate(2, true, 1.0);
        assert!(pit.channel(2).is_counting());
        assert!(!pit.channel(2).output_at(tick(1.0, 2)));
        assert!(pit.channel(2).output_at(tick(1.0, 4)));

        // Retrigger restarts the one-shot.
        pit.set_gate(2, false, 2.0);
        pit.set_gate(2, true, 2.0);
        assert!(!pit.channel(2).output_at(tick(2.0, 1)));
    }

    #[test]
    fn gate_low_freezes_mode0() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 0, 1000, 0.0);
        pit.set_gate(2, true, 0.0);
        let paused_at = tick(0.0, 100);
        let held = pit.channel(2).current_count(paused_at);
        pit.set_gate(2, false, paused_at);
        assert_eq!(pit.channel(2).current_count(paused_at + 5.0), held);

        let resumed_at = paused_at + 5.0;
        pit.set_gate(2, true, resumed_at);
        assert_eq!(pit.channel(2).current_count(resumed_at), held);
        assert!(pit.channel(2).current_count(resumed_at + 10.0 * PIT_TICK_MS) < held);
    }

    #[test]
    fn gate_rising_edge_restarts_mode2() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 2, 100, 0.0);
        pit.set_gate(2, true, 0.0);
        pit.set_gate(2, false, tick(0.0, 40));
        assert!(pit.channel(2).output_at(tick(0.0, 99)));
        pit.set_gate(2, true, 1.0);
        assert_eq!(pit.channel(2).time_base_start(), 1.0);
        assert_eq!(pit.channel(2).current_count(1.0), 100);
    }

    #[test]
    fn latched_count_is_held_until_read() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 0, 0x1000, 0.0);
        pit.set_gate(2, true, 0.0);

        let latched_at = tick(0.0, 0x100);
        pit.control_register_write(0x80, latched_at);
        // A second latch before reading does not replace the first.
        pit.control_register_write(0x80, tick(0.0, 0x200));
        assert_eq!(read_word(&mut pit, 2, tick(0.0, 0x300)), 0x1000 - 0x100);
        // Unlatched reads follow the live count.
        assert_eq!(read_word(&mut pit, 2, tick(0.0, 0x300)), 0x1000 - 0x300);
    }

    #[test]
    fn lsb_and_msb_only_access() {
        let mut pit = Pit::new();
        // Channel 2, LSB only, mode 0
        pit.control_register_write(0x90, 0.0);
        pit.data_write(2, 0x40, 0.0);
        assert_eq!(pit.channel(2).counter(), 0x40);
        assert_eq!(pit.data_read(2, 0.0), 0x40);

        // Channel 2, MSB only, mode 0
        pit.control_register_write(0xA0, 0.0);
        pit.data_write(2, 0x12, 0.0);
        assert_eq!(pit.channel(2).counter(), 0x1200);
        assert_eq!(pit.data_read(2, 0.0), 0x12);
    }

    #[test]
    fn bcd_counter_transfers() {
        let mut pit = Pit::new();
        // Channel 2, LSB then MSB, mode 0, BCD
        pit.control_register_write(0xB1, 0.0);
        pit.data_write(2, 0x34, 0.0);
        pit.data_write(2, 0x12, 0.0);
        assert_eq!(pit.channel(2).counter(), 1234);
        assert_eq!(read_word(&mut pit, 2, 0.0), 0x1234);

        pit.control_register_write(0xB1, 1.0);
        pit.data_write(2, 0x00, 1.0);
        pit.data_write(2, 0x00, 1.0);
        assert_eq!(pit.channel(2).counter(), 9999);
    }

    #[test]
    fn special_reload_values() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 0, 0, 0.0);
        assert_eq!(pit.channel(2).counter(), 0x10000);
        program(&mut pit, 2, 3, 1, 0.0);
        assert_eq!(pit.channel(2).counter(), 0x10001);
        program(&mut pit, 2, 2, 1, 0.0);
        assert_eq!(pit.channel(2).counter(), 1);
    }

    #[test]
    fn read_back_status_then_count() {
        let mut pit = Pit::new();
        pit.control_register_write(0xB6, 0.0);
        // Null count is set until a reload is written.
        pit.control_register_write(0xE8, 0.0);
        let status = pit.data_read(2, 0.0);
        // Output is high in mode 3 before counting starts.
        assert_eq!(status, 0x80 | 0x40 | 0x30 | (3 << 1));

        pit.data_write(2, 0x00, 0.0);
        pit.data_write(2, 0x10, 0.0);
        pit.set_gate(2, true, 0.0);

        // Latch status and count together.
        let at = tick(0.0, 10);
        pit.control_register_write(0xC8, at);
        // A second status latch does not replace the first.
        pit.control_register_write(0xE8, tick(0.0, 3000));
        let status = pit.data_read(2, tick(0.0, 20));
        assert_eq!(status & 0x40, 0);
        assert_eq!(status & 0x80, 0x80);
        assert_eq!(status & 0x0E, 3 << 1);
        let count = read_word(&mut pit, 2, tick(0.0, 20));
        assert_eq!(count, pit.channel(2).current_count(at) as u16);
    }

    #[test]
    fn channel0_programming_effects() {
        let mut pit = Pit::new();
        program(&mut pit, 0, 2, 1193, 5.0);
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(
            effects,
            vec![
                PitEffect::CancelTimer0,
                PitEffect::LowerIrq0,
                PitEffect::CancelTimer0,
                PitEffect::ScheduleTimer0 {
                    at: 5.0 + 1193.0 * PIT_TICK_MS
                },
            ]
        );
        assert_eq!(pit.drain_effects().count(), 0);

        let period = 1193.0 * PIT_TICK_MS;
        pit.timer0_event(5.0 + period);
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(effects[0], PitEffect::RaiseIrq0);
        assert_eq!(effects[1], PitEffect::ScheduleTimer0 { at: 5.0 + period + period });
    }

    #[test]
    fn mode_write_raises_irq0_on_rising_output() {
        let mut pit = Pit::new();
        program(&mut pit, 0, 0, 100, 0.0);
        pit.drain_effects();
        // Mode 0 output is low until terminal count; any other mode starts high.
        pit.control_register_write(0x34, tick(0.0, 10));
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(effects, vec![PitEffect::CancelTimer0, PitEffect::RaiseIrq0]);
    }

    #[test]
    fn channel0_periodic_reload_is_deferred() {
        let mut pit = Pit::new();
        program(&mut pit, 0, 2, 1000, 0.0);
        pit.drain_effects();

        // Rewriting the count, with or without a new mode 2/3 control word, waits for the cycle.
        program(&mut pit, 0, 3, 500, 0.3);
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert!(effects.is_empty());
        assert_eq!(pit.channel(0).counter_current(), 1000);
        assert!(pit.channel(0).update_count());
        assert_eq!(pit.channel(0).time_base_start(), 0.0);

        let end = 1000.0 * PIT_TICK_MS;
        pit.timer0_event(end);
        assert_eq!(pit.channel(0).counter_current(), 500);
        assert!(!pit.channel(0).update_count());
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(
            effects,
            vec![
                PitEffect::RaiseIrq0,
                PitEffect::ScheduleTimer0 {
                    at: end + 500.0 * PIT_TICK_MS
                }
            ]
        );
    }

    #[test]
    fn channel0_mode0_rearms_immediately() {
        let mut pit = Pit::new();
        program(&mut pit, 0, 0, 100, 0.0);
        pit.drain_effects();
        pit.data_write(0, 50, 1.0);
        pit.data_write(0, 0, 1.0);
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(
            effects,
            vec![
                PitEffect::CancelTimer0,
                PitEffect::LowerIrq0,
                PitEffect::ScheduleTimer0 {
                    at: 1.0 + 50.0 * PIT_TICK_MS
                }
            ]
        );
        pit.timer0_event(1.0 + 50.0 * PIT_TICK_MS);
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(effects, vec![PitEffect::RaiseIrq0]);
    }

    #[test]
    fn count_without_control_word_rearms() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 3, 100, 0.0);
        pit.data_write(2, 50, 2.0);
        pit.data_write(2, 0, 2.0);
        assert_eq!(pit.channel(2).counter_current(), 50);
        assert_eq!(pit.channel(2).time_base_start(), 2.0);
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(
            effects.last(),
            Some(&PitEffect::Channel2Reprogrammed {
                counter: 50,
                mode: ChannelMode::SquareWaveGenerator
            })
        );
    }

    #[test]
    fn port61_drives_gate_and_reports_output() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 3, 1320, 0.0);
        pit.drain_effects();
        assert_eq!(pit.read_port61(0.0) & 0x03, 0);

        pit.write_port61(0x03, 0.0);
        assert!(pit.channel(2).gate());
        assert!(pit.speaker_data());
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(effects, vec![PitEffect::SpeakerControl { gate: true, data: true }]);

        // First half of the square wave is high.
        assert_eq!(pit.read_port61(tick(0.0, 10)) & 0x23, 0x23);
        assert_eq!(pit.read_port61(tick(0.0, 1000)) & 0x20, 0);
    }

    #[test]
    fn reset_leaves_channels_idle() {
        let mut pit = Pit::new();
        program(&mut pit, 0, 2, 1193, 0.0);
        pit.write_port61(0x01, 0.0);
        pit.reset();
        for c in 0..3 {
            assert!(!pit.channel(c).is_counting());
            assert!(pit.channel(c).new_mode());
            assert!(pit.channel(c).output_at(1.0));
        }
        assert!(pit.channel(0).gate());
        assert!(!pit.channel(2).gate());
        let effects: Vec<PitEffect> = pit.drain_effects().collect();
        assert_eq!(effects, vec![PitEffect::SpeakerControl { gate: false, data: false }]);
    }

    #[test]
    fn channel_state_round_trip() {
        let mut pit = Pit::new();
        program(&mut pit, 2, 3, 1234, 1.0);
        pit.set_gate(2, true, 1.0);
        let saved = pit.state();

        let mut restored = Pit::new();
        restored.set_state(&saved, false);
        assert_eq!(restored.state(), saved);
        assert_eq!(
            restored.channel(2).current_count(2.5),
            pit.channel(2).current_count(2.5)
        );
    }
}
