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

    lib.rs

    Timing and interrupt core: event scheduler, 8259 PIC pair, 8254 PIT
    and the quantum coordinator that drives a CPU between events.

*/

pub mod clock;
pub mod coordinator;
pub mod devices;
pub mod io;
pub mod machine;
pub mod machine_config;
pub mod scheduler;
pub mod snapshot;

pub use coordinator::CpuInterface;
pub use io::IoDevice;
pub use machine::{EventHandler, SpeakerSink, TickHandler, TickHandlerId, TimingCore};
pub use machine_config::{ConfigError, PicConfig, TimingConfig};
pub use scheduler::{EventKind, HandlerId};
pub use snapshot::{SnapshotError, TimingSnapshot};
