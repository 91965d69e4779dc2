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

    io.rs

    Port I/O for the PIC pair, the PIT and the speaker bits of port 0x61.

*/

use crate::{
    devices::{
        pic::{PicSelect, PIC_COMMAND_PORT, PIC_DATA_PORT, PIC_SLAVE_COMMAND_PORT, PIC_SLAVE_DATA_PORT},
        pit::{PIT_CHANNEL_0_DATA_PORT, PIT_CHANNEL_1_DATA_PORT, PIT_CHANNEL_2_DATA_PORT, PIT_COMMAND_REGISTER},
    },
    machine::TimingCore,
};

pub const NO_IO_BYTE: u8 = 0xFF;
pub const SPEAKER_CONTROL_PORT: u16 = 0x61;

pub trait IoDevice {
    /// Read a byte from the specified port. The default implementation returns NO_IO_BYTE (0xFF).
    fn read_u8(&mut self, _port: u16) -> u8 {
        NO_IO_BYTE
    }

    /// Write a byte to the specified port. The default implementation does nothing.
    fn write_u8(&mut self, _port: u16, _data: u8) {}

    /// Return a list of ports the device should service, comprised of a vector of tuples of
    /// (port description, port number).
    fn port_list(&self) -> Vec<(String, u16)>;
}

impl TimingCore {
    fn pic_select(&self, port: u16) -> Option<PicSelect> {
        match port {
            PIC_COMMAND_PORT | PIC_DATA_PORT => Some(PicSelect::Master),
            PIC_SLAVE_COMMAND_PORT | PIC_SLAVE_DATA_PORT if self.pics.slave_enabled() => Some(PicSelect::Slave),
            PIC_SLAVE_COMMAND_PORT | PIC_SLAVE_DATA_PORT => {
                log::warn!("PIC: Access to port {:02X} with no slave PIC present", port);
                None
            }
            _ => None,
        }
    }
}

impl IoDevice for TimingCore {
    fn read_u8(&mut self, port: u16) -> u8 {
        let now = self.clock.full_index();
        match port {
            PIC_COMMAND_PORT | PIC_SLAVE_COMMAND_PORT => match self.pic_select(port) {
                Some(select) => self.pics.read_command(select),
                None => NO_IO_BYTE,
            },
            PIC_DATA_PORT | PIC_SLAVE_DATA_PORT => match self.pic_select(port) {
                Some(select) => self.pics.read_data(select),
                None => NO_IO_BYTE,
            },
            PIT_CHANNEL_0_DATA_PORT => self.pit.data_read(0, now),
            PIT_CHANNEL_1_DATA_PORT => self.pit.data_read(1, now),
            PIT_CHANNEL_2_DATA_PORT => self.pit.data_read(2, now),
            // The control register is write-only.
            PIT_COMMAND_REGISTER => NO_IO_BYTE,
            SPEAKER_CONTROL_PORT => self.pit.read_port61(now),
            _ => {
                log::warn!("Timing: Read from unhandled port {:04X}", port);
                NO_IO_BYTE
            }
        }
    }

    fn write_u8(&mut self, port: u16, data: u8) {
        let now = self.clock.full_index();
        match port {
            PIC_COMMAND_PORT | PIC_SLAVE_COMMAND_PORT => {
                if let Some(select) = self.pic_select(port) {
                    self.pics.write_command(select, data);
                    self.sync_pic();
                }
            }
            PIC_DATA_PORT | PIC_SLAVE_DATA_PORT => {
                if let Some(select) = self.pic_select(port) {
                    self.pics.write_data(select, data);
                    self.sync_pic();
                }
            }
            PIT_CHANNEL_0_DATA_PORT => self.pit.data_write(0, data, now),
            PIT_CHANNEL_1_DATA_PORT => self.pit.data_write(1, data, now),
            PIT_CHANNEL_2_DATA_PORT => self.pit.data_write(2, data, now),
            PIT_COMMAND_REGISTER => self.pit.control_register_write(data, now),
            SPEAKER_CONTROL_PORT => self.pit.write_port61(data, now),
            _ => {
                log::warn!("Timing: Write to unhandled port {:04X}: {:02X}", port, data);
            }
        }
        self.apply_pit_effects();
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        let mut ports = vec![
            ("PIC Command".to_string(), PIC_COMMAND_PORT),
            ("PIC Data".to_string(), PIC_DATA_PORT),
        ];
        if self.pics.slave_enabled() {
            ports.push(("PIC Slave Command".to_string(), PIC_SLAVE_COMMAND_PORT));
            ports.push(("PIC Slave Data".to_string(), PIC_SLAVE_DATA_PORT));
        }
        ports.extend([
            ("PIT Channel 0 Data".to_string(), PIT_CHANNEL_0_DATA_PORT),
            ("PIT Channel 1 Data".to_string(), PIT_CHANNEL_1_DATA_PORT),
            ("PIT Channel 2 Data".to_string(), PIT_CHANNEL_2_DATA_PORT),
            ("PIT Command Register".to_string(), PIT_COMMAND_REGISTER),
            ("Speaker Control".to_string(), SPEAKER_CONTROL_PORT),
        ]);
        ports
    }
}
