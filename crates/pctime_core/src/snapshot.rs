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

    snapshot.rs

    Save and restore of the timing core: clock, pending events, both PICs
    and the PIT. Handlers are not serializable, so a snapshot refers to them
    by id and name and can only be restored into a core that registered the
    same handlers in the same order.

*/

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    clock::CycleBudget,
    devices::{pic::PicChipState, pit::PitChannelState},
    machine::TimingCore,
    scheduler::{EventKind, HandlerId},
};

#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot holds {pending} events but the queue only has room for {capacity}")]
    QueueTooLarge { pending: usize, capacity: usize },
    #[error("snapshot refers to handler {id:?} '{name}', which is not registered")]
    UnknownHandler { id: HandlerId, name: String },
    #[error("snapshot clock has an invalid cycle rate ({0})")]
    BadClock(i32),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub time: f64,
    pub kind: EventKind,
    pub value: u32,
    /// Name of the handler at save time, used to check the restore target.
    #[serde(default)]
    pub handler_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimingSnapshot {
    pub clock: CycleBudget,
    pub pics: [PicChipState; 2],
    pub pit: [PitChannelState; 3],
    pub speaker_data: bool,
    /// Pending events in firing order.
    pub events: Vec<PendingEvent>,
}

impl TimingCore {
    pub fn save_state(&self) -> TimingSnapshot {
        let events = self
            .pending_events()
            .map(|entry| PendingEvent {
                time: entry.time,
                kind: entry.kind,
                value: entry.value,
                handler_name: match entry.kind {
                    EventKind::Handler(id) => self.handler_name(id).map(str::to_string),
                    EventKind::PitTimer0 => None,
                },
            })
            .collect();

        TimingSnapshot {
            clock: self.clock,
            pics: self.pics.state(),
            pit: self.pit.state(),
            speaker_data: self.pit.speaker_data(),
            events,
        }
    }

    /// Replace the timing state with a snapshot. Nothing is changed if the snapshot
    /// does not fit this core.
    pub fn restore_state(&mut self, snapshot: &TimingSnapshot) -> Result<(), SnapshotError> {
        if snapshot.clock.cycle_max() < 1 {
            return Err(SnapshotError::BadClock(snapshot.clock.cycle_max()));
        }
        if snapshot.events.len() > self.queue.capacity() {
            return Err(SnapshotError::QueueTooLarge {
                pending: snapshot.events.len(),
                capacity: self.queue.capacity(),
            });
        }
        for event in &snapshot.events {
            if let EventKind::Handler(id) = event.kind {
                let name_matches = match &event.handler_name {
                    Some(name) => self.handler_name(id) == Some(name.as_str()),
                    None => true,
                };
                if !self.is_registered(id) || !name_matches {
                    return Err(SnapshotError::UnknownHandler {
                        id,
                        name: event.handler_name.clone().unwrap_or_default(),
                    });
                }
            }
        }

        self.set_cycles_per_ms(snapshot.clock.cycle_max() as u32);
        self.clock = snapshot.clock;

        self.queue.clear();
        for event in &snapshot.events {
            self.queue.schedule(event.time, event.kind, event.value);
        }

        self.pics.set_state(&snapshot.pics);
        self.pit.set_state(&snapshot.pit, snapshot.speaker_data);
        log::debug!(
            "Timing: Restored state at {:.6}ms with {} pending event(s)",
            self.full_index(),
            snapshot.events.len()
        );
        Ok(())
    }
}
