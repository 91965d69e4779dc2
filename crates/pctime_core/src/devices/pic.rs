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

    devices::pic.rs

    Implements the 8259A PIC (Programmable Interrupt Controller) pair: a
    master and an optional slave cascaded on the master's IR2 line.

*/

use serde::{Deserialize, Serialize};

use crate::machine_config::{PicPolicy, PIC_CASCADE_LINE};

pub const PIC_COMMAND_PORT: u16 = 0x20;
pub const PIC_DATA_PORT: u16 = 0x21;
pub const PIC_SLAVE_COMMAND_PORT: u16 = 0xA0;
pub const PIC_SLAVE_DATA_PORT: u16 = 0xA1;

pub const PIC_MASTER_VECTOR_BASE: u8 = 0x08;
pub const PIC_SLAVE_VECTOR_BASE: u8 = 0x70;

/// `active_irq` value meaning no line is in service.
pub const NO_ACTIVE_IRQ: u8 = 8;

const ICW1_ICW4_NEEDED: u8 = 0b0000_0001; // Bit set if an ICW4 will follow
const ICW1_SINGLE_MODE: u8 = 0b0000_0010; // Bit set if PIC is operating in single mode
const ICW1_ADI: u8 = 0b0000_0100; // Bit set if PIC is using a call address interval of 4 (not supported)
const ICW1_LTIM: u8 = 0b0000_1000; // Bit set if PIC is in Level Triggered Mode (not supported)
const ICW1_IS_ICW1: u8 = 0b0001_0000; // Bit determines if input is ICW1
const ICW1_MCS80_ADDR: u8 = 0b1110_0000; // MCS-80/85 vector address bits (not supported)

const ICW2_MASK: u8 = 0b1111_1000; // Bit mask for ICW2 vector base

const ICW4_8086_MODE: u8 = 0b0000_0001; // Bit on if 8086/8088 mode (required)
const ICW4_AEOI_MODE: u8 = 0b0000_0010; // Bit on if Auto EOI is enabled
const ICW4_NESTED: u8 = 0b0001_0000; // Bit on if Special Fully Nested mode (not supported)

const OCW_IS_OCW3: u8 = 0b0000_1000; // Bit on if OCW is OCW3

const OCW2_EOI: u8 = 0b0010_0000;
const OCW2_SPECIFIC: u8 = 0b0100_0000;
const OCW2_ROTATE: u8 = 0b1000_0000;
const OCW2_LEVEL_MASK: u8 = 0b0000_0111;

const OCW3_POLL_COMMAND: u8 = 0b0000_0100;
const OCW3_READ_REGISTER: u8 = 0b0000_0010;
const OCW3_READ_ISR: u8 = 0b0000_0001;
const OCW3_SPECIAL_MASK: u8 = 0b0100_0000;
const OCW3_SPECIAL_MASK_VALUE: u8 = 0b0010_0000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PicSelect {
    Master,
    Slave,
}

/// Change to a chip's INT output requested by a state transition. The master's INT
/// goes to the CPU; the slave's INT drives the master's cascade line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntrSignal {
    Activate,
    Deactivate,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct InterruptStats {
    imr_masked_count: u64,
    isr_masked_count: u64,
    serviced_count:   u64,
}

/// Register-level state of one 8259, as consumed by save-state code.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PicChipState {
    pub irr: u8,
    pub imr: u8,
    pub isr: u8,
    pub isr_ignore: u8,
    pub active_irq: u8,
    pub special: bool,
    pub auto_eoi: bool,
    pub rotate_on_auto_eoi: bool,
    pub single: bool,
    pub request_issr: bool,
    pub icw_index: u8,
    pub icw_words: u8,
    pub vector_base: u8,
}

pub struct Pic {
    irr: u8,          // Interrupt Request Register
    imr: u8,          // Interrupt Mask Register
    imrr: u8,         // Inverted IMR
    isr: u8,          // In-Service Register
    isrr: u8,         // Inverted ISR, with isr_ignore bits forced on
    isr_ignore: u8,   // Lines whose in-service bit never blocks arbitration
    active_irq: u8,   // Highest priority line in service, or NO_ACTIVE_IRQ
    special: bool,    // Special mask mode
    auto_eoi: bool,   // Auto-EOI mode
    rotate_on_auto_eoi: bool,
    single: bool,       // Single (true) or cascade (false) mode from ICW1
    request_issr: bool, // Command port reads ISR (true) or IRR (false)
    icw_index: u8,      // 0 = operational, 1..=3 = expecting ICW2..ICW4
    icw_words: u8,      // Length of the current initialization sequence, including ICW1
    vector_base: u8,

    cascade_partner: bool,    // A cascaded peer exists, so cascade mode expects ICW3
    threshold_bypass: Option<u8>,
    never_mark_line: Option<u8>,
    interrupt_stats: [InterruptStats; 8],
}

#[derive(Clone, Default)]
pub struct PicStringState {
    pub imr: String,
    pub isr: String,
    pub irr: String,
    pub active_irq: String,
    pub vector_base: String,
    pub autoeoi: String,
    pub special: String,
    pub interrupt_stats: Vec<(String, String, String)>,
}

impl Pic {
    pub fn new(vector_base: u8, cascade_partner: bool) -> Self {
        Self {
            irr: 0,
            imr: 0xFF, // All IRQs initially masked
            imrr: 0x00,
            isr: 0,
            isrr: 0xFF,
            isr_ignore: 0,
            active_irq: NO_ACTIVE_IRQ,
            special: false,
            auto_eoi: false,
            rotate_on_auto_eoi: false,
            single: false,
            request_issr: false,
            icw_index: 0,
            icw_words: 0,
            vector_base,
            cascade_partner,
            threshold_bypass: None,
            never_mark_line: None,
            interrupt_stats: [InterruptStats::default(); 8],
        }
    }

    #[inline]
    fn bit(line: u8) -> u8 {
        1 << (line & 0x07)
    }

    pub fn irr(&self) -> u8 {
        self.irr
    }
    pub fn imr(&self) -> u8 {
        self.imr
    }
    pub fn imrr(&self) -> u8 {
        self.imrr
    }
    pub fn isr(&self) -> u8 {
        self.isr
    }
    pub fn isrr(&self) -> u8 {
        self.isrr
    }
    pub fn isr_ignore(&self) -> u8 {
        self.isr_ignore
    }
    pub fn active_irq(&self) -> u8 {
        self.active_irq
    }
    pub fn vector_base(&self) -> u8 {
        self.vector_base
    }
    pub fn auto_eoi(&self) -> bool {
        self.auto_eoi
    }
    pub fn special_mask(&self) -> bool {
        self.special
    }
    pub fn single(&self) -> bool {
        self.single
    }
    pub fn rotate_on_auto_eoi(&self) -> bool {
        self.rotate_on_auto_eoi
    }
    pub fn request_issr(&self) -> bool {
        self.request_issr
    }
    pub fn icw_index(&self) -> u8 {
        self.icw_index
    }
    pub fn icw_words(&self) -> u8 {
        self.icw_words
    }

    /// True while an ICW sequence is in progress; data port writes are ICWs, not masks.
    #[inline]
    pub fn is_initializing(&self) -> bool {
        self.icw_index != 0
    }

    pub fn set_isr_ignore(&mut self, mask: u8) {
        self.isr_ignore = mask;
        self.isrr = !self.isr | self.isr_ignore;
    }

    pub(crate) fn set_threshold_bypass(&mut self, line: Option<u8>) {
        self.threshold_bypass = line;
    }

    pub(crate) fn set_never_mark_line(&mut self, line: Option<u8>) {
        self.never_mark_line = line;
    }

    pub(crate) fn set_cascade_partner(&mut self, present: bool) {
        self.cascade_partner = present;
    }

    /// Lines requested, unmasked and not blocked by in-service state.
    #[inline]
    pub fn deliverable_mask(&self) -> u8 {
        self.irr & self.imrr & self.isrr
    }

    /// Lines numerically below the threshold are eligible for arbitration.
    #[inline]
    pub fn threshold(&self) -> u8 {
        if self.special {
            8
        }
        else if self.threshold_bypass == Some(self.active_irq) {
            self.active_irq + 1
        }
        else {
            self.active_irq
        }
    }

    /// The highest priority (lowest numbered) eligible line, if any.
    pub fn highest_eligible(&self) -> Option<u8> {
        let possible = self.deliverable_mask();
        (0..self.threshold()).find(|&line| possible & Pic::bit(line) != 0)
    }

    pub fn check_for_irq(&self) -> IntrSignal {
        if self.highest_eligible().is_some() {
            IntrSignal::Activate
        }
        else {
            IntrSignal::Deactivate
        }
    }

    fn update_active_irq(&mut self) {
        self.active_irq = if self.isr == 0 {
            NO_ACTIVE_IRQ
        }
        else {
            self.isr.trailing_zeros() as u8
        };
    }

    /// Simulates a low-to-high transition of the corresponding IR line.
    pub fn raise_irq(&mut self, line: u8) -> Option<IntrSignal> {
        let bit = Pic::bit(line);
        if self.irr & bit != 0 {
            // Line already requested; edge-triggered, so nothing changes.
            return None;
        }
        self.irr |= bit;

        if bit & self.imrr == 0 {
            self.interrupt_stats[line as usize & 7].imr_masked_count += 1;
            return None;
        }
        if bit & self.isrr == 0 {
            self.interrupt_stats[line as usize & 7].isr_masked_count += 1;
            return None;
        }
        if self.special || line < self.threshold() {
            return Some(IntrSignal::Activate);
        }
        None
    }

    /// Simulates a high-to-low transition of the corresponding IR line.
    pub fn lower_irq(&mut self, line: u8) -> Option<IntrSignal> {
        let bit = Pic::bit(line);
        if self.irr & bit == 0 {
            return None;
        }
        self.irr &= !bit;

        if (bit & self.imrr) & self.isrr != 0 && (self.special || line < self.threshold()) {
            // This line may have been what raised INT. Other lines may still be pending,
            // so recheck rather than deactivate outright.
            return Some(self.check_for_irq());
        }
        None
    }

    /// Set the value of the Interrupt Mask Register (IMR).
    pub fn set_imr(&mut self, byte: u8) -> Option<IntrSignal> {
        let change = self.imr ^ byte;
        self.imr = byte;
        self.imrr = !byte;

        // Only changed bits with a pending, not in-service request matter.
        if (self.irr & change) & self.isrr != 0 {
            return Some(self.check_for_irq());
        }
        None
    }

    /// Perform the PIC side of starting an interrupt on `line`. Does not signal the CPU.
    pub fn start_irq(&mut self, line: u8) {
        let bit = Pic::bit(line);
        self.irr &= !bit;
        self.interrupt_stats[line as usize & 7].serviced_count += 1;

        if !self.auto_eoi {
            if self.never_mark_line == Some(line) {
                return;
            }
            self.isr |= bit;
            self.isrr = !self.isr | self.isr_ignore;
            self.update_active_irq();
        }
        else if self.rotate_on_auto_eoi {
            log::debug!("PIC: Rotate on auto-EOI not handled");
        }
    }

    /// Perform an EOI (End of Interrupt).
    /// A specific EOI clears the in-service bit of the given line, a non-specific EOI
    /// clears the bit of the active line.
    pub fn eoi(&mut self, line: Option<u8>) -> Option<IntrSignal> {
        let line = match line {
            Some(line) => line & 0x07,
            None => {
                if self.active_irq == NO_ACTIVE_IRQ {
                    // Some software sends EOIs to both PICs regardless of the source.
                    log::trace!("PIC: Non-specific EOI with no IRQ in service");
                    return None;
                }
                self.active_irq
            }
        };

        self.isr &= !Pic::bit(line);
        self.isrr = !self.isr | self.isr_ignore;
        self.update_active_irq();
        Some(self.check_for_irq())
    }

    pub fn write_command(&mut self, byte: u8) -> Option<IntrSignal> {
        if byte & ICW1_IS_ICW1 != 0 {
            log::debug!("PIC: Read ICW1: {:02X}", byte);
            if byte & ICW1_ADI != 0 {
                log::warn!("PIC: 4 byte interval not handled");
            }
            if byte & ICW1_LTIM != 0 {
                log::warn!("PIC: Level triggered mode not handled");
            }
            if byte & ICW1_MCS80_ADDR != 0 {
                log::warn!("PIC: 8080/8085 vector address not handled");
            }

            self.single = byte & ICW1_SINGLE_MODE != 0;
            self.icw_index = 1;
            self.icw_words = 2 + self.expects_icw3() as u8 + (byte & ICW1_ICW4_NEEDED);

            // Initialization resets the edge sense circuit, IMR, ISR, special mask mode
            // and the status read select.
            self.irr = 0;
            self.imr = 0;
            self.imrr = 0xFF;
            self.isr = 0;
            self.isrr = 0xFF;
            self.active_irq = NO_ACTIVE_IRQ;
            self.special = false;
            self.request_issr = false;
            if byte & ICW1_ICW4_NEEDED == 0 {
                self.auto_eoi = false;
            }
            return Some(IntrSignal::Deactivate);
        }

        if byte & OCW_IS_OCW3 != 0 {
            if byte & OCW3_POLL_COMMAND != 0 {
                log::warn!("PIC: Poll command not handled");
            }
            if byte & OCW3_READ_REGISTER != 0 {
                self.request_issr = byte & OCW3_READ_ISR != 0;
            }
            if byte & OCW3_SPECIAL_MASK != 0 {
                self.special = byte & OCW3_SPECIAL_MASK_VALUE != 0;
                log::debug!("PIC: Special mask {}", if self.special { "ON" } else { "OFF" });
                // Priority rules changed; lines may have become deliverable.
                return Some(self.check_for_irq());
            }
            return None;
        }

        // OCW2
        if byte & OCW2_EOI != 0 {
            if byte & OCW2_ROTATE != 0 {
                log::warn!("PIC: Rotate on EOI not supported");
            }
            if byte & OCW2_SPECIFIC != 0 {
                self.eoi(Some(byte & OCW2_LEVEL_MASK))
            }
            else {
                self.eoi(None)
            }
        }
        else if byte & OCW2_SPECIFIC == 0 {
            self.rotate_on_auto_eoi = byte & OCW2_ROTATE != 0;
            None
        }
        else {
            if byte & OCW2_ROTATE != 0 {
                log::warn!("PIC: Set priority command not handled");
            }
            None
        }
    }

    #[inline]
    fn expects_icw3(&self) -> bool {
        !self.single && self.cascade_partner
    }

    #[inline]
    fn expects_icw4(&self) -> bool {
        self.icw_words > 2 + self.expects_icw3() as u8
    }

    /// Move to the next expected ICW, or back to normal operation after the last one.
    fn next_icw(&mut self) {
        self.icw_index = match self.icw_index {
            1 if self.expects_icw3() => 2,
            1 | 2 if self.expects_icw4() => 3,
            _ => 0,
        };
    }

    pub fn write_data(&mut self, byte: u8) -> Option<IntrSignal> {
        match self.icw_index {
            0 => {
                log::trace!("PIC: Set IMR to: {:02X}", byte);
                self.set_imr(byte)
            }
            1 => {
                log::debug!("PIC: Read ICW2: {:02X}", byte);
                self.vector_base = byte & ICW2_MASK;
                self.next_icw();
                None
            }
            2 => {
                log::debug!("PIC: Read ICW3: {:02X}", byte);
                self.next_icw();
                None
            }
            _ => {
                log::debug!("PIC: Read ICW4: {:02X}", byte);
                if byte & ICW4_8086_MODE == 0 {
                    log::warn!("PIC: ICW4 {:02X}: MCS-80/85 mode not handled", byte);
                }
                if byte & ICW4_NESTED != 0 {
                    log::warn!("PIC: ICW4 {:02X}: Special fully nested mode not handled", byte);
                }
                self.auto_eoi = byte & ICW4_AEOI_MODE != 0;
                self.next_icw();
                None
            }
        }
    }

    pub fn read_command(&self) -> u8 {
        if self.request_issr {
            self.isr
        }
        else {
            self.irr
        }
    }

    pub fn read_data(&self) -> u8 {
        self.imr
    }

    pub fn state(&self) -> PicChipState {
        PicChipState {
            irr: self.irr,
            imr: self.imr,
            isr: self.isr,
            isr_ignore: self.isr_ignore,
            active_irq: self.active_irq,
            special: self.special,
            auto_eoi: self.auto_eoi,
            rotate_on_auto_eoi: self.rotate_on_auto_eoi,
            single: self.single,
            request_issr: self.request_issr,
            icw_index: self.icw_index,
            icw_words: self.icw_words,
            vector_base: self.vector_base,
        }
    }

    /// Load register state. The inverted registers are recomputed and `active_irq` is
    /// rederived from the ISR so the two can never disagree.
    pub fn set_state(&mut self, state: &PicChipState) {
        self.irr = state.irr;
        self.imr = state.imr;
        self.imrr = !state.imr;
        self.isr = state.isr;
        self.isr_ignore = state.isr_ignore;
        self.isrr = !state.isr | state.isr_ignore;
        self.special = state.special;
        self.auto_eoi = state.auto_eoi;
        self.rotate_on_auto_eoi = state.rotate_on_auto_eoi;
        self.single = state.single;
        self.request_issr = state.request_issr;
        self.icw_index = state.icw_index.min(3);
        self.icw_words = state.icw_words;
        self.vector_base = state.vector_base;
        self.update_active_irq();
        if self.active_irq != state.active_irq {
            log::warn!(
                "PIC: Restored active IRQ {} does not match ISR {:08b}, using {}",
                state.active_irq,
                state.isr,
                self.active_irq
            );
        }
    }

    pub fn get_string_state(&self) -> PicStringState {
        let mut state = PicStringState {
            imr: format!("{:08b}", self.imr),
            isr: format!("{:08b}", self.isr),
            irr: format!("{:08b}", self.irr),
            active_irq: if self.active_irq == NO_ACTIVE_IRQ {
                String::from("none")
            }
            else {
                format!("{}", self.active_irq)
            },
            vector_base: format!("{:02X}", self.vector_base),
            autoeoi: format!("{:?}", self.auto_eoi),
            special: format!("{:?}", self.special),
            interrupt_stats: Vec::new(),
        };

        for stats in &self.interrupt_stats {
            state.interrupt_stats.push((
                format!("{}", stats.imr_masked_count),
                format!("{}", stats.isr_masked_count),
                format!("{}", stats.serviced_count),
            ));
        }
        state
    }
}

/// The master/slave controller pair as wired in a PC/AT (or a lone master, PC/XT).
pub struct PicPair {
    master: Pic,
    slave: Pic,
    policy: PicPolicy,
    /// Master INT is asserted: an interrupt may be deliverable to the CPU.
    irq_check: bool,
    /// Master INT was asserted since the last `take_activation`.
    activated: bool,
}

impl PicPair {
    pub fn new(policy: PicPolicy) -> Self {
        let mut pair = Self {
            master: Pic::new(PIC_MASTER_VECTOR_BASE, policy.slave_enabled),
            slave: Pic::new(PIC_SLAVE_VECTOR_BASE, true),
            policy,
            irq_check: false,
            activated: false,
        };
        pair.apply_policy();
        pair.power_on_masks();
        pair
    }

    fn apply_policy(&mut self) {
        self.master.set_cascade_partner(self.policy.slave_enabled);
        if self.policy.slave_enabled && self.policy.ignore_cascade_in_service {
            self.master.set_isr_ignore(1 << PIC_CASCADE_LINE);
            self.master.set_threshold_bypass(Some(PIC_CASCADE_LINE));
        }
        else {
            self.master.set_isr_ignore(0);
            self.master.set_threshold_bypass(None);
        }
        self.master.set_never_mark_line(
            if self.policy.slave_enabled && self.policy.never_mark_cascade_in_service {
                Some(PIC_CASCADE_LINE)
            }
            else {
                None
            },
        );
    }

    /// The mask state a PC BIOS leaves behind: timer, keyboard, cascade and RTC enabled.
    fn power_on_masks(&mut self) {
        self.set_irq_mask(0, false);
        self.set_irq_mask(1, false);
        if self.policy.slave_enabled {
            self.set_irq_mask(PIC_CASCADE_LINE, false);
            self.set_irq_mask(8, false);
        }
    }

    pub fn reset(&mut self) {
        *self = PicPair::new(self.policy);
    }

    #[inline]
    pub fn policy(&self) -> &PicPolicy {
        &self.policy
    }

    #[inline]
    pub fn slave_enabled(&self) -> bool {
        self.policy.slave_enabled
    }

    pub fn master(&self) -> &Pic {
        &self.master
    }

    pub fn slave(&self) -> &Pic {
        &self.slave
    }

    pub fn chip(&self, select: PicSelect) -> &Pic {
        match select {
            PicSelect::Master => &self.master,
            PicSelect::Slave => &self.slave,
        }
    }

    #[inline]
    pub fn irq_check(&self) -> bool {
        self.irq_check
    }

    /// Master INT was asserted since the last `take_activation`. Repeated activations
    /// collapse into one until the flag is taken.
    #[inline]
    pub fn activation_pending(&self) -> bool {
        self.activated
    }

    /// Return and clear the flag recording that master INT was asserted. The timing core
    /// uses this to end the CPU's current allowance early.
    #[inline]
    pub fn take_activation(&mut self) -> bool {
        std::mem::take(&mut self.activated)
    }

    fn apply_master(&mut self, signal: Option<IntrSignal>) {
        match signal {
            Some(IntrSignal::Activate) => {
                self.irq_check = true;
                self.activated = true;
            }
            Some(IntrSignal::Deactivate) => {
                self.irq_check = false;
            }
            None => {}
        }
    }

    fn apply_slave(&mut self, signal: Option<IntrSignal>) {
        let master_signal = match signal {
            Some(IntrSignal::Activate) => self.master.raise_irq(PIC_CASCADE_LINE),
            Some(IntrSignal::Deactivate) => self.master.lower_irq(PIC_CASCADE_LINE),
            None => None,
        };
        self.apply_master(master_signal);
    }

    fn apply(&mut self, select: PicSelect, signal: Option<IntrSignal>) {
        match select {
            PicSelect::Master => self.apply_master(signal),
            PicSelect::Slave => self.apply_slave(signal),
        }
    }

    /// Map a machine IRQ number to a chip and line. What was IRQ 2 on the PC/XT is
    /// IRQ 9 on the PC/AT.
    fn route(&self, irq: u8) -> Option<(PicSelect, u8)> {
        if self.policy.slave_enabled {
            match irq {
                PIC_CASCADE_LINE => Some((PicSelect::Slave, 1)),
                0..=7 => Some((PicSelect::Master, irq)),
                8..=15 => Some((PicSelect::Slave, irq - 8)),
                _ => {
                    log::warn!("PIC: IRQ {} out of range", irq);
                    None
                }
            }
        }
        else if irq < 8 {
            Some((PicSelect::Master, irq))
        }
        else {
            log::warn!("PIC: IRQ {} raised with no slave PIC present", irq);
            None
        }
    }

    fn chip_mut(&mut self, select: PicSelect) -> &mut Pic {
        match select {
            PicSelect::Master => &mut self.master,
            PicSelect::Slave => &mut self.slave,
        }
    }

    pub fn raise_irq(&mut self, irq: u8) {
        if let Some((select, line)) = self.route(irq) {
            let signal = self.chip_mut(select).raise_irq(line);
            self.apply(select, signal);
        }
    }

    pub fn lower_irq(&mut self, irq: u8) {
        if let Some((select, line)) = self.route(irq) {
            let signal = self.chip_mut(select).lower_irq(line);
            self.apply(select, signal);
        }
    }

    /// Mask or unmask a single machine IRQ. Unlike raise/lower, IRQ 2 addresses the
    /// master's cascade line itself.
    pub fn set_irq_mask(&mut self, irq: u8, masked: bool) {
        let (select, line) = match irq {
            0..=7 => (PicSelect::Master, irq),
            8..=15 if self.policy.slave_enabled => (PicSelect::Slave, irq - 8),
            _ => {
                log::warn!("PIC: Cannot set mask for IRQ {}", irq);
                return;
            }
        };
        let chip = self.chip_mut(select);
        let bit = 1u8 << line;
        let mut mask = chip.imr() & !bit;
        if masked {
            mask |= bit;
        }
        let signal = chip.set_imr(mask);
        self.apply(select, signal);
    }

    pub fn write_command(&mut self, select: PicSelect, byte: u8) {
        let signal = self.chip_mut(select).write_command(byte);
        self.apply(select, signal);
    }

    pub fn write_data(&mut self, select: PicSelect, byte: u8) {
        let signal = self.chip_mut(select).write_data(byte);
        self.apply(select, signal);
    }

    pub fn read_command(&self, select: PicSelect) -> u8 {
        self.chip(select).read_command()
    }

    pub fn read_data(&self, select: PicSelect) -> u8 {
        self.chip(select).read_data()
    }

    /// Arbitrate and start the highest priority deliverable interrupt, returning its
    /// vector. `cs_equ_ds` reports whether the CPU's code and data segments are equal,
    /// for lines configured to require it.
    pub fn acknowledge(&mut self, cs_equ_ds: bool) -> Option<u8> {
        let possible = self.master.deliverable_mask();
        let threshold = self.master.threshold();
        let mut vector = None;

        for line in 0..threshold {
            if possible & (1 << line) == 0 {
                continue;
            }
            if line == PIC_CASCADE_LINE && self.policy.slave_enabled {
                if let Some(v) = self.start_slave(cs_equ_ds) {
                    vector = Some(v);
                    break;
                }
            }
            else {
                if self.policy.requires_cs_equ_ds(line) && !cs_equ_ds {
                    continue;
                }
                self.master.start_irq(line);
                vector = Some(self.master.vector_base() | line);
                break;
            }
        }

        // Keep checking while anything remains deliverable.
        self.irq_check = self.master.check_for_irq() == IntrSignal::Activate;
        vector
    }

    fn start_slave(&mut self, cs_equ_ds: bool) -> Option<u8> {
        let possible = self.slave.deliverable_mask();
        let threshold = self.slave.threshold();
        let mut skipped = false;

        for line in 0..threshold {
            if possible & (1 << line) == 0 {
                continue;
            }
            if self.policy.requires_cs_equ_ds(line + 8) && !cs_equ_ds {
                skipped = true;
                continue;
            }
            self.slave.start_irq(line);
            self.master.start_irq(PIC_CASCADE_LINE);
            return Some(self.slave.vector_base() | line);
        }

        if !skipped {
            log::error!(
                "PIC: IRQ {} (cascade) is active on master PIC without an active IRQ 8-15 on slave PIC",
                PIC_CASCADE_LINE
            );
            let signal = self.master.lower_irq(PIC_CASCADE_LINE);
            self.apply_master(signal);
        }
        None
    }

    pub fn state(&self) -> [PicChipState; 2] {
        [self.master.state(), self.slave.state()]
    }

    pub fn set_state(&mut self, states: &[PicChipState; 2]) {
        self.master.set_state(&states[0]);
        self.slave.set_state(&states[1]);
        self.apply_policy();
        self.irq_check = self.master.check_for_irq() == IntrSignal::Activate;
        self.activated = false;
    }
}
