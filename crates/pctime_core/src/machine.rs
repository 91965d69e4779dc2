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

    machine.rs

    TimingCore owns every piece of timing and interrupt state for one
    emulated machine: the cycle clock, the event queue, the PIC pair and
    the PIT. Other devices interact with it through handler ids, IRQ lines
    and the scheduling calls below.

*/

use crate::{
    clock::CycleBudget,
    devices::{
        pic::PicPair,
        pit::{ChannelMode, Pit, PitEffect},
    },
    machine_config::{ConfigError, TimingConfig, IRQ_LINES},
    scheduler::{EventEntry, EventKind, EventQueue, HandlerId, PendingIter, QueueStats},
};

/// A device callback fired from the event queue with the value it was scheduled with.
pub trait EventHandler {
    fn fire(&mut self, core: &mut TimingCore, value: u32);
}

impl<F> EventHandler for F
where
    F: FnMut(&mut TimingCore, u32),
{
    fn fire(&mut self, core: &mut TimingCore, value: u32) {
        self(core, value)
    }
}

/// A callback run once per emulated millisecond.
pub trait TickHandler {
    fn tick(&mut self, core: &mut TimingCore);
}

impl<F> TickHandler for F
where
    F: FnMut(&mut TimingCore),
{
    fn tick(&mut self, core: &mut TimingCore) {
        self(core)
    }
}

/// Receives PIT channel 2 and port 0x61 changes on behalf of the PC speaker.
pub trait SpeakerSink {
    fn channel2_reprogrammed(&mut self, counter: u32, mode: ChannelMode);
    fn speaker_control(&mut self, _gate: bool, _data: bool) {}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TickHandlerId(u32);

struct HandlerSlot {
    name: String,
    // None while the handler is running or after it was unregistered.
    handler: Option<Box<dyn EventHandler>>,
    retired: bool,
}

struct TickSlot {
    id: TickHandlerId,
    handler: Option<Box<dyn TickHandler>>,
    removed: bool,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct InterruptCounters {
    pub raised: [u64; IRQ_LINES as usize],
    pub delivered: u64,
}

pub struct TimingCore {
    config: TimingConfig,
    pub(crate) clock: CycleBudget,
    pub(crate) queue: EventQueue,
    pub(crate) pics: PicPair,
    pub(crate) pit: Pit,
    handlers: Vec<HandlerSlot>,
    tick_handlers: Vec<TickSlot>,
    next_tick_id: u32,
    /// Scheduled time of the event being fired. Events scheduled from a handler are
    /// relative to this rather than to the CPU clock.
    in_service: Option<f64>,
    speaker: Option<Box<dyn SpeakerSink>>,
    pub(crate) counters: InterruptCounters,
}

impl TimingCore {
    pub fn new(config: TimingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut core = Self {
            clock: CycleBudget::new(config.cycles_per_ms),
            queue: EventQueue::new(config.queue_capacity),
            pics: PicPair::new(config.pic_policy()),
            pit: Pit::new(),
            handlers: Vec::new(),
            tick_handlers: Vec::new(),
            next_tick_id: 0,
            in_service: None,
            speaker: None,
            counters: Default::default(),
            config,
        };
        core.reset();
        Ok(core)
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Emulated hardware reset. Registered handlers, tick handlers and the speaker sink
    /// survive; everything else returns to power-on state.
    pub fn reset(&mut self) {
        log::debug!("SCHED: Reset");
        self.clock.reset();
        self.queue.clear();
        self.in_service = None;
        self.pit.reset();
        self.apply_pit_effects();
        self.pics.reset();
        self.counters = Default::default();
    }

    pub fn set_speaker_sink(&mut self, sink: Box<dyn SpeakerSink>) {
        self.speaker = Some(sink);
    }

    #[inline]
    pub fn clock(&self) -> &CycleBudget {
        &self.clock
    }

    #[inline]
    pub fn pics(&self) -> &PicPair {
        &self.pics
    }

    #[inline]
    pub fn pit(&self) -> &Pit {
        &self.pit
    }

    #[inline]
    pub fn counters(&self) -> &InterruptCounters {
        &self.counters
    }

    /// Whole milliseconds elapsed.
    #[inline]
    pub fn ticks(&self) -> u64 {
        self.clock.ticks()
    }

    /// Fraction of the current millisecond consumed.
    #[inline]
    pub fn tick_index(&self) -> f64 {
        self.clock.tick_index()
    }

    /// Current emulated time in fractional milliseconds.
    #[inline]
    pub fn full_index(&self) -> f64 {
        self.clock.full_index()
    }

    #[inline]
    pub fn make_cycles(&self, ms: f64) -> i64 {
        self.clock.make_cycles(ms)
    }

    /// Scheduled time of the event currently being fired, if any.
    #[inline]
    pub fn in_service_time(&self) -> Option<f64> {
        self.in_service
    }

    /// Cycles left in the CPU's current allowance.
    #[inline]
    pub fn cycles_remaining(&self) -> i32 {
        self.clock.cycles()
    }

    /// Account for cycles executed by the CPU.
    #[inline]
    pub fn consume_cycles(&mut self, cycles: i32) {
        self.clock.consume(cycles);
    }

    /// Return the rest of the CPU's allowance, so the CPU stops at the next
    /// instruction boundary.
    #[inline]
    pub fn end_quantum(&mut self) {
        self.clock.end_allowance();
    }

    pub fn set_cycles_per_ms(&mut self, cycles_per_ms: u32) {
        self.clock.set_cycle_max(cycles_per_ms);
        self.config.cycles_per_ms = self.clock.cycle_max() as u32;
    }

    /*
        Event handlers
    */

    pub fn register_handler(&mut self, name: &str, handler: impl EventHandler + 'static) -> HandlerId {
        let id = HandlerId(self.handlers.len() as u32);
        self.handlers.push(HandlerSlot {
            name: name.to_string(),
            handler: Some(Box::new(handler)),
            retired: false,
        });
        log::debug!("SCHED: Registered handler {:?} '{}'", id, name);
        id
    }

    /// Remove a handler and every event pending for it. Safe to call from inside
    /// the handler itself.
    pub fn unregister_handler(&mut self, id: HandlerId) {
        let Some(slot) = self.handlers.get_mut(id.index())
        else {
            log::warn!("SCHED: Unregister of unknown handler {:?}", id);
            return;
        };
        slot.retired = true;
        slot.handler = None;
        let removed = self.queue.cancel_all(EventKind::Handler(id));
        log::debug!("SCHED: Unregistered handler {:?}, {} event(s) cancelled", id, removed);
    }

    pub fn handler_name(&self, id: HandlerId) -> Option<&str> {
        self.handlers.get(id.index()).map(|slot| slot.name.as_str())
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.handlers.get(id.index()).is_some_and(|slot| !slot.retired)
    }

    /*
        Scheduling
    */

    /// Schedule `handler` to fire `delay` milliseconds from now. From inside a firing
    /// event, "now" is the scheduled time of that event.
    pub fn schedule(&mut self, handler: HandlerId, delay: f64, value: u32) {
        if !self.is_registered(handler) {
            log::warn!("SCHED: Event for unregistered handler {:?} dropped", handler);
            return;
        }
        let base = self.in_service.unwrap_or_else(|| self.clock.full_index());
        self.schedule_at(base + delay.max(0.0), EventKind::Handler(handler), value);
    }

    pub fn cancel_all(&mut self, handler: HandlerId) -> usize {
        self.queue.cancel_all(EventKind::Handler(handler))
    }

    pub fn cancel_matching(&mut self, handler: HandlerId, value: u32) -> usize {
        self.queue.cancel_matching(EventKind::Handler(handler), value)
    }

    pub(crate) fn schedule_at(&mut self, time: f64, kind: EventKind, value: u32) {
        if self.queue.schedule(time, kind, value) {
            self.cut_allowance();
        }
    }

    /// If the earliest event falls inside the CPU's current allowance, end the
    /// allowance so the event is not run late.
    fn cut_allowance(&mut self) {
        if let Some(head) = self.queue.next_time() {
            let cycles = self.clock.make_cycles(head - self.clock.full_index());
            if cycles < self.clock.cycles() as i64 {
                self.clock.end_allowance();
            }
        }
    }

    /// Pending events in firing order.
    pub fn pending_events(&self) -> PendingIter<'_> {
        self.queue.iter()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Fire every event due at or before `current_time`, in order.
    pub fn drain_due(&mut self, current_time: f64) -> usize {
        let mut fired = 0;
        while let Some(entry) = self.queue.pop_due(current_time) {
            self.in_service = Some(entry.time);
            self.fire(&entry);
            fired += 1;
        }
        self.in_service = None;
        fired
    }

    fn fire(&mut self, entry: &EventEntry) {
        match entry.kind {
            EventKind::PitTimer0 => {
                self.pit.timer0_event(entry.time);
                self.apply_pit_effects();
            }
            EventKind::Handler(id) => {
                let Some(mut handler) = self.handlers.get_mut(id.index()).and_then(|slot| slot.handler.take())
                else {
                    log::warn!("SCHED: No handler for event {:?}", id);
                    return;
                };
                handler.fire(self, entry.value);
                if let Some(slot) = self.handlers.get_mut(id.index()) {
                    if !slot.retired {
                        slot.handler = Some(handler);
                    }
                }
            }
        }
    }

    /*
        Tick handlers
    */

    pub fn add_tick_handler(&mut self, handler: impl TickHandler + 'static) -> TickHandlerId {
        let id = TickHandlerId(self.next_tick_id);
        self.next_tick_id = self.next_tick_id.wrapping_add(1);
        self.tick_handlers.push(TickSlot {
            id,
            handler: Some(Box::new(handler)),
            removed: false,
        });
        id
    }

    /// Remove a tick handler. Returns false if it was not registered.
    pub fn remove_tick_handler(&mut self, id: TickHandlerId) -> bool {
        match self.tick_handlers.iter_mut().find(|slot| slot.id == id && !slot.removed) {
            Some(slot) => {
                slot.removed = true;
                slot.handler = None;
                true
            }
            None => false,
        }
    }

    pub fn tick_handler_count(&self) -> usize {
        self.tick_handlers.iter().filter(|slot| !slot.removed).count()
    }

    /// Run every tick handler once, in registration order. Handlers added while this
    /// runs wait for the next tick; handlers removed while this runs do not run.
    pub(crate) fn run_tick_handlers(&mut self) {
        let count = self.tick_handlers.len();
        for i in 0..count {
            let Some(mut handler) = self.tick_handlers[i].handler.take()
            else {
                continue;
            };
            handler.tick(self);
            let slot = &mut self.tick_handlers[i];
            if !slot.removed {
                slot.handler = Some(handler);
            }
        }
        self.tick_handlers.retain(|slot| !slot.removed);
    }

    /*
        Interrupt lines
    */

    pub(crate) fn sync_pic(&mut self) {
        if self.pics.take_activation() {
            self.clock.end_allowance();
        }
    }

    pub fn raise_irq(&mut self, irq: u8) {
        if irq >= IRQ_LINES {
            log::warn!("PIC: Raise of invalid IRQ {}", irq);
            return;
        }
        self.counters.raised[irq as usize] += 1;

        let old_cycles = self.clock.cycles();
        self.pics.raise_irq(irq);
        self.sync_pic();
        if old_cycles != self.clock.cycles() {
            // Raised from inside CPU execution, e.g. by a port write. Real hardware
            // runs a few more instructions before the interrupt is taken.
            self.clock.grant(2);
        }
    }

    pub fn lower_irq(&mut self, irq: u8) {
        if irq >= IRQ_LINES {
            log::warn!("PIC: Lower of invalid IRQ {}", irq);
            return;
        }
        self.pics.lower_irq(irq);
        self.sync_pic();
    }

    pub fn set_irq_mask(&mut self, irq: u8, masked: bool) {
        self.pics.set_irq_mask(irq, masked);
        self.sync_pic();
    }

    /// True if the PIC has something the CPU may be able to take.
    #[inline]
    pub fn irq_pending(&self) -> bool {
        self.pics.irq_check()
    }

    /*
        Timer
    */

    pub fn set_gate(&mut self, channel: usize, level: bool) {
        let now = self.clock.full_index();
        self.pit.set_gate(channel, level, now);
        self.apply_pit_effects();
    }

    pub(crate) fn apply_pit_effects(&mut self) {
        while let Some(effect) = self.pit.pop_effect() {
            match effect {
                PitEffect::ScheduleTimer0 { at } => self.schedule_at(at, EventKind::PitTimer0, 0),
                PitEffect::CancelTimer0 => {
                    self.queue.cancel_all(EventKind::PitTimer0);
                }
                PitEffect::RaiseIrq0 => self.raise_irq(0),
                PitEffect::LowerIrq0 => self.lower_irq(0),
                PitEffect::Channel2Reprogrammed { counter, mode } => {
                    if let Some(speaker) = self.speaker.as_mut() {
                        speaker.channel2_reprogrammed(counter, mode);
                    }
                }
                PitEffect::SpeakerControl { gate, data } => {
                    if let Some(speaker) = self.speaker.as_mut() {
                        speaker.speaker_control(gate, data);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoDevice;
    use std::{cell::RefCell, rc::Rc};

    fn core() -> TimingCore {
        TimingCore::new(TimingConfig::default()).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let config = TimingConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            TimingCore::new(config),
            Err(ConfigError::BadQueueCapacity(0))
        ));
    }

    #[test]
    fn power_on_is_idle() {
        let core = core();
        assert_eq!(core.ticks(), 0);
        assert_eq!(core.full_index(), 1.0);
        assert_eq!(core.cycles_remaining(), 0);
        assert_eq!(core.pending_events().count(), 0);
        assert!(!core.irq_pending());
    }

    #[test]
    fn drain_fires_in_order_with_ties_fifo() {
        let mut core = core();
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let id = core.register_handler("order", move |_: &mut TimingCore, value: u32| {
            sink.borrow_mut().push(value);
        });

        core.schedule(id, 0.5, 2);
        core.schedule(id, 0.25, 1);
        core.schedule(id, 0.5, 3);
        core.schedule(id, 0.75, 4);

        assert_eq!(core.drain_due(1.5), 3);
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert_eq!(core.drain_due(2.0), 1);
        assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn nested_schedule_uses_event_time() {
        let mut core = core();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let follow_up = core.register_handler("follow_up", move |core: &mut TimingCore, _: u32| {
            sink.borrow_mut().push(core.in_service_time());
        });
        let first = core.register_handler("first", move |core: &mut TimingCore, _: u32| {
            core.schedule(follow_up, 0.25, 0);
        });

        core.schedule(first, 0.5, 0);
        // Drain well after the first event was due.
        core.drain_due(3.0);
        assert_eq!(*seen.borrow(), vec![Some(1.75)]);
        assert_eq!(core.in_service_time(), None);
    }

    #[test]
    fn cancel_by_handler_and_value() {
        let mut core = core();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = fired.clone();
        let a = core.register_handler("a", move |_: &mut TimingCore, v: u32| sink.borrow_mut().push(v));
        let b = core.register_handler("b", |_: &mut TimingCore, _: u32| {});

        core.schedule(a, 0.1, 1);
        core.schedule(a, 0.2, 2);
        core.schedule(a, 0.3, 1);
        core.schedule(b, 0.1, 1);

        assert_eq!(core.cancel_matching(a, 1), 2);
        assert_eq!(core.cancel_all(b), 1);
        core.drain_due(2.0);
        assert_eq!(*fired.borrow(), vec![2]);
    }

    #[test]
    fn unregister_cancels_and_rejects() {
        let mut core = core();
        let fired = Rc::new(RefCell::new(0));
        let sink = fired.clone();
        let id = core.register_handler("gone", move |_: &mut TimingCore, _: u32| *sink.borrow_mut() += 1);
        core.schedule(id, 0.1, 0);
        core.unregister_handler(id);
        assert!(!core.is_registered(id));
        core.schedule(id, 0.1, 0);
        core.drain_due(5.0);
        assert_eq!(*fired.borrow(), 0);
        assert_eq!(core.handler_name(id), Some("gone"));
    }

    #[test]
    fn handler_can_unregister_itself() {
        let mut core = core();
        let fired = Rc::new(RefCell::new(0));
        let sink = fired.clone();
        let id = core.register_handler("once", move |core: &mut TimingCore, value: u32| {
            *sink.borrow_mut() += 1;
            core.unregister_handler(HandlerId(value));
        });
        core.schedule(id, 0.1, id.0);
        core.schedule(id, 0.2, id.0);
        core.drain_due(5.0);
        assert_eq!(*fired.borrow(), 1);
        assert!(!core.is_registered(id));
    }

    #[test]
    fn self_rescheduling_handler() {
        let mut core = core();
        let fired = Rc::new(RefCell::new(0u32));
        let sink = fired.clone();
        let id = core.register_handler("periodic", move |core: &mut TimingCore, value: u32| {
            *sink.borrow_mut() += 1;
            if value > 0 {
                core.schedule(HandlerId(0), 0.1, value - 1);
            }
        });
        assert_eq!(id, HandlerId(0));
        core.schedule(id, 0.1, 4);
        core.drain_due(1.45);
        assert_eq!(*fired.borrow(), 4);
        core.drain_due(2.0);
        assert_eq!(*fired.borrow(), 5);
    }

    #[test]
    fn tick_handlers_run_in_order_and_can_be_removed() {
        let mut core = core();
        let log = Rc::new(RefCell::new(Vec::new()));

        let sink = log.clone();
        let first = core.add_tick_handler(move |_: &mut TimingCore| sink.borrow_mut().push("first"));
        let sink = log.clone();
        let second_id = Rc::new(RefCell::new(None));
        let second_cell = second_id.clone();
        let _ = core.add_tick_handler(move |core: &mut TimingCore| {
            sink.borrow_mut().push("second");
            // Remove the third handler before it runs, and add a new one.
            if let Some(id) = second_cell.borrow_mut().take() {
                core.remove_tick_handler(id);
                let late = sink.clone();
                core.add_tick_handler(move |_: &mut TimingCore| late.borrow_mut().push("late"));
            }
        });
        let sink = log.clone();
        let third = core.add_tick_handler(move |_: &mut TimingCore| sink.borrow_mut().push("third"));
        *second_id.borrow_mut() = Some(third);

        core.run_tick_handlers();
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert_eq!(core.tick_handler_count(), 3);

        log.borrow_mut().clear();
        assert!(core.remove_tick_handler(first));
        assert!(!core.remove_tick_handler(first));
        core.run_tick_handlers();
        assert_eq!(*log.borrow(), vec!["second", "late"]);
    }

    #[test]
    fn raising_irq_mid_allowance_grants_grace_cycles() {
        let mut core = core();
        core.clock.advance_tick();
        core.clock.grant(3000);
        core.consume_cycles(100);

        // IRQ 1 is unmasked at power-on.
        core.raise_irq(1);
        assert!(core.irq_pending());
        assert_eq!(core.cycles_remaining(), 2);
        assert_eq!(core.clock().cycle_left(), 2898);

        // A masked line does not disturb the allowance.
        core.clock.end_allowance();
        core.clock.grant(500);
        core.raise_irq(5);
        assert_eq!(core.cycles_remaining(), 500);
    }

    #[test]
    fn scheduling_inside_allowance_cuts_it() {
        let mut core = core();
        let id = core.register_handler("soon", |_: &mut TimingCore, _: u32| {});
        core.clock.advance_tick();
        core.clock.grant(3000);
        core.consume_cycles(300);

        core.schedule(id, 0.5, 0);
        assert_eq!(core.cycles_remaining(), 0);
        assert_eq!(core.clock().cycle_left(), 2700);

        // An event beyond the allowance leaves it alone.
        core.clock.grant(100);
        core.schedule(id, 0.5, 0);
        assert_eq!(core.cycles_remaining(), 100);
    }

    #[test]
    fn queue_overflow_drops_events() {
        let config = TimingConfig {
            queue_capacity: 4,
            ..Default::default()
        };
        let mut core = TimingCore::new(config).unwrap();
        let id = core.register_handler("flood", |_: &mut TimingCore, _: u32| {});
        for i in 0..10 {
            core.schedule(id, 1.0 + i as f64, i);
        }
        let stats = core.queue_stats();
        assert_eq!(stats.pending, 4);
        assert_eq!(stats.peak_pending, 4);
        assert_eq!(stats.dropped, 6);
    }

    #[test]
    fn reset_keeps_handlers() {
        let mut core = core();
        let id = core.register_handler("kept", |_: &mut TimingCore, _: u32| {});
        core.add_tick_handler(|_: &mut TimingCore| {});
        core.schedule(id, 0.5, 0);
        core.raise_irq(0);
        core.write_u8(0x43, 0x34);
        core.write_u8(0x40, 0x00);
        core.write_u8(0x40, 0x10);
        assert_eq!(core.pending_events().count(), 2);

        core.reset();
        assert!(core.is_registered(id));
        assert_eq!(core.tick_handler_count(), 1);
        assert_eq!(core.pending_events().count(), 0);
        assert!(!core.pit().channel(0).is_counting());
        assert!(!core.irq_pending());
        assert_eq!(core.counters().raised[0], 0);
    }

    #[test]
    fn speaker_sink_sees_channel2() {
        struct Recorder(Rc<RefCell<Vec<(u32, ChannelMode)>>>);
        impl SpeakerSink for Recorder {
            fn channel2_reprogrammed(&mut self, counter: u32, mode: ChannelMode) {
                self.0.borrow_mut().push((counter, mode));
            }
        }

        let mut core = core();
        let seen = Rc::new(RefCell::new(Vec::new()));
        core.set_speaker_sink(Box::new(Recorder(seen.clone())));
        core.write_u8(0x43, 0xB6);
        core.write_u8(0x42, 0x28);
        core.write_u8(0x42, 0x05);
        // Channel 0 is not the speaker's concern.
        core.write_u8(0x43, 0x36);
        core.write_u8(0x40, 0x00);
        core.write_u8(0x40, 0x00);
        assert_eq!(*seen.borrow(), vec![(1320, ChannelMode::SquareWaveGenerator)]);
    }
}
