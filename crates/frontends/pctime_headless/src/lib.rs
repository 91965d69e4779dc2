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
*/

//! PCTime headless front-end main library component.

#![forbid(unsafe_code)]

mod bios;
mod cpu;
mod emulator;

use crate::emulator::Emulator;

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Resolve the configuration by parsing the configuration toml and merging it with
    // command line arguments.
    let config = match pctime_config::read_config_file("./pctime.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to read configuration:\n{:#}", e);
            std::process::exit(1);
        }
    };

    if config.emulator.quiet {
        log::set_max_level(log::LevelFilter::Error);
    }

    let mut emu = match Emulator::new(config) {
        Ok(emu) => emu,
        Err(e) => {
            eprintln!("Failed to create emulator: {:#}", e);
            std::process::exit(1);
        }
    };

    match emu.run() {
        Ok(stats) => {
            if !emu.config.emulator.quiet {
                emu.report(&stats);
            }
        }
        Err(e) => {
            log::error!("Run failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
