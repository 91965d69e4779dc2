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

//! The `pctime_config` crate parses PCTime's configuration file and overlays command line
//! arguments on top of it. Command line arguments always take priority over the
//! configuration file.
//!
//! Features:
//! - `use_bpaf`: Enable BPAF support for command line argument parsing.

#[cfg(feature = "use_bpaf")]
mod bpaf_config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use cfg_if::cfg_if;
use serde_derive::Deserialize;

use pctime_core::TimingConfig;

#[cfg(feature = "use_bpaf")]
pub use bpaf_config::{cli_args, CmdLineArgs};

#[cfg(not(feature = "use_bpaf"))]
#[derive(Clone, Debug, Default)]
pub struct CmdLineArgs {
    pub config_file: Option<PathBuf>,
    pub run_ms: Option<u64>,
    pub cycles: Option<u32>,
    pub no_slave: bool,
    pub quiet: bool,
}

pub const DEFAULT_RUN_MS: u64 = 1000;

const fn _default_run_ms() -> u64 {
    DEFAULT_RUN_MS
}

#[derive(Debug, Deserialize)]
pub struct Emulator {
    /// Emulated milliseconds the headless frontend runs for.
    #[serde(default = "_default_run_ms")]
    pub run_ms: u64,
    #[serde(default)]
    pub quiet: bool,
    /// Write a JSON snapshot of the timing state here when the run ends.
    #[serde(default)]
    pub snapshot_file: Option<PathBuf>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self {
            run_ms: DEFAULT_RUN_MS,
            quiet: false,
            snapshot_file: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFileParams {
    #[serde(default)]
    pub emulator: Emulator,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl ConfigFileParams {
    pub fn overlay(&mut self, shell_args: CmdLineArgs) {
        if let Some(run_ms) = shell_args.run_ms {
            self.emulator.run_ms = run_ms;
        }
        if let Some(cycles) = shell_args.cycles {
            self.timing.cycles_per_ms = cycles;
        }
        if shell_args.no_slave {
            self.timing.pic.slave_enabled = false;
            // Quirks that only make sense with a cascade go with it.
            self.timing.pic.ignore_cascade_in_service = false;
            self.timing.pic.never_mark_cascade_in_service = false;
            self.timing.pic.cs_equ_ds_irqs.retain(|&irq| irq < 8);
        }
        self.emulator.quiet |= shell_args.quiet;
    }
}

/// Parse a TOML configuration string, overlay command line arguments and validate the
/// resulting timing configuration.
pub fn read_config(toml_string: impl AsRef<str>, shell_args: CmdLineArgs) -> Result<ConfigFileParams, anyhow::Error> {
    let mut toml_args: ConfigFileParams =
        toml::from_str(toml_string.as_ref()).context("Failed to parse configuration file")?;

    log::debug!("toml_config: {:?}", toml_args);

    // Command line arguments override config file arguments
    toml_args.overlay(shell_args);

    toml_args
        .timing
        .validate()
        .context("Invalid timing configuration")?;

    Ok(toml_args)
}

fn read_shell_args() -> CmdLineArgs {
    cfg_if! {
        if #[cfg(feature = "use_bpaf")] {
            log::debug!("Reading command line arguments...");
            cli_args().run()
        } else {
            log::debug!("Argument reading disabled...");
            CmdLineArgs::default()
        }
    }
}

/// Read the TOML configuration from a file path, parse and overlay command line arguments.
/// A missing default file is not an error; the built-in defaults are used instead. A file
/// named with `--config_file` must exist.
pub fn read_config_file<P>(default_path: P) -> Result<ConfigFileParams, anyhow::Error>
where
    P: AsRef<Path>,
{
    let shell_args = read_shell_args();

    // Allow configuration file path to be overridden by command line argument 'config_file'
    let toml_string = if let Some(configfile_path) = shell_args.config_file.as_ref() {
        std::fs::read_to_string(configfile_path)
            .with_context(|| format!("Couldn't read config file: {}", configfile_path.display()))?
    }
    else if default_path.as_ref().exists() {
        std::fs::read_to_string(default_path.as_ref())
            .with_context(|| format!("Couldn't read config file: {}", default_path.as_ref().display()))?
    }
    else {
        log::warn!(
            "Config file {} not found, using defaults",
            default_path.as_ref().display()
        );
        String::new()
    };

    read_config(toml_string, shell_args)
}

/// Read the TOML configuration from a string, parse and overlay command line arguments.
pub fn read_config_string(toml_string: impl AsRef<str>) -> Result<ConfigFileParams, anyhow::Error> {
    read_config(toml_string, read_shell_args())
}
