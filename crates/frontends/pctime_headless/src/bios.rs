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

    bios.rs

    Programs the interrupt controllers and the timer the way a PC BIOS
    leaves them before booting.

*/

use pctime_core::{
    devices::{
        pic::{PIC_COMMAND_PORT, PIC_DATA_PORT, PIC_SLAVE_COMMAND_PORT, PIC_SLAVE_DATA_PORT},
        pit::{PIT_CHANNEL_0_DATA_PORT, PIT_CHANNEL_1_DATA_PORT, PIT_CHANNEL_2_DATA_PORT, PIT_COMMAND_REGISTER},
    },
    IoDevice,
    TimingCore,
};

/// Channel 2 reload for the 904Hz beep tone.
pub const BEEP_RELOAD: u16 = 1320;
/// Channel 1 reload for DRAM refresh every 15us.
pub const REFRESH_RELOAD: u8 = 18;

pub fn bios_init(core: &mut TimingCore) {
    let cascaded = core.pics().slave_enabled();

    // ICW1: edge triggered, ICW4 follows. ICW3 is only sent in cascade mode.
    if cascaded {
        core.write_u8(PIC_COMMAND_PORT, 0x11);
        core.write_u8(PIC_DATA_PORT, 0x08);
        core.write_u8(PIC_DATA_PORT, 0x04); // Slave on IR2
        core.write_u8(PIC_DATA_PORT, 0x01);

        core.write_u8(PIC_SLAVE_COMMAND_PORT, 0x11);
        core.write_u8(PIC_SLAVE_DATA_PORT, 0x70);
        core.write_u8(PIC_SLAVE_DATA_PORT, 0x02); // Slave id 2
        core.write_u8(PIC_SLAVE_DATA_PORT, 0x01);

        core.write_u8(PIC_DATA_PORT, 0xF8);
        core.write_u8(PIC_SLAVE_DATA_PORT, 0xFE);
    }
    else {
        core.write_u8(PIC_COMMAND_PORT, 0x13);
        core.write_u8(PIC_DATA_PORT, 0x08);
        core.write_u8(PIC_DATA_PORT, 0x01);

        core.write_u8(PIC_DATA_PORT, 0xFC);
    }

    // Channel 0: mode 3, reload 0 (65536) for 18.2Hz.
    core.write_u8(PIT_COMMAND_REGISTER, 0x36);
    core.write_u8(PIT_CHANNEL_0_DATA_PORT, 0x00);
    core.write_u8(PIT_CHANNEL_0_DATA_PORT, 0x00);

    // Channel 1: mode 2, LSB only.
    core.write_u8(PIT_COMMAND_REGISTER, 0x54);
    core.write_u8(PIT_CHANNEL_1_DATA_PORT, REFRESH_RELOAD);

    // Channel 2: mode 3, gated off until a beep.
    core.write_u8(PIT_COMMAND_REGISTER, 0xB6);
    core.write_u8(PIT_CHANNEL_2_DATA_PORT, (BEEP_RELOAD & 0xFF) as u8);
    core.write_u8(PIT_CHANNEL_2_DATA_PORT, (BEEP_RELOAD >> 8) as u8);

    log::debug!(
        "BIOS: Timing initialized, {} PIC(s), system timer at 18.2Hz",
        if cascaded { 2 } else { 1 }
    );
}
