//! Telemetry sink for coherence events.
//!
//! Every protocol decision the coherence manager makes is reported here:
//! successful loads/stores/begins/commits, NACKs with both parties'
//! timestamps, and aborts with their reason. The sink is fire-and-forget —
//! nothing it does feeds back into protocol decisions.
//!
//! [`LogSink`] forwards events to the `log` crate at trace level, which is
//! what the demo driver installs. [`RecordingSink`] collects events for
//! assertions in tests.

use std::cell::RefCell;

use crate::host::Addr;

/// Cycle timestamp type used in event payloads.
pub type Cycle = u64;

/// A coherence event.
///
/// Field layouts follow the manager's call sites; `caddr` is the cache-line
/// address of `raddr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Load { utid: u64, begin_pc: u32, pid: usize, tid: u32, raddr: Addr, caddr: Addr, ts: Cycle },
    Store { utid: u64, begin_pc: u32, pid: usize, tid: u32, raddr: Addr, caddr: Addr, ts: Cycle },
    Begin { utid: u64, pid: usize, tid: u32, begin_pc: u32, ts: Cycle },
    Commit { utid: u64, pid: usize, tid: u32, ts: Cycle },
    NackLoad { utid: u64, pid: usize, tid: u32, by: usize, raddr: Addr, caddr: Addr, my_ts: Cycle, other_ts: Cycle },
    NackStore { utid: u64, pid: usize, tid: u32, by: usize, raddr: Addr, caddr: Addr, my_ts: Cycle, other_ts: Cycle },
    NackCommit { utid: u64, pid: usize, tid: u32, by: usize, my_ts: Cycle, other_ts: Cycle },
    /// A lazy committer took the commit token and entered its commit window.
    CommitToken { utid: u64, pid: usize, tid: u32, ts: Cycle },
    Abort { utid: u64, pid: usize, tid: u32, by: usize, raddr: Addr, caddr: Addr, my_ts: Cycle, other_ts: Cycle },
}

/// Receiver for coherence events.
pub trait ReportSink {
    /// Deliver one event.
    fn report(&self, event: Event);
}

impl<S: ReportSink + ?Sized> ReportSink for std::rc::Rc<S> {
    fn report(&self, event: Event) {
        (**self).report(event);
    }
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn report(&self, _event: Event) {}
}

/// Sink that forwards events to the `log` crate at trace level.
#[derive(Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn report(&self, event: Event) {
        match &event {
            Event::Load { utid, pid, raddr, caddr, ts, .. } => {
                log::trace!("tm: load utid={} pid={} raddr=0x{:08X} line=0x{:08X} ts={}", utid, pid, raddr, caddr, ts);
            }
            Event::Store { utid, pid, raddr, caddr, ts, .. } => {
                log::trace!("tm: store utid={} pid={} raddr=0x{:08X} line=0x{:08X} ts={}", utid, pid, raddr, caddr, ts);
            }
            Event::Begin { utid, pid, tid, begin_pc, ts } => {
                log::trace!("tm: begin utid={} pid={} tid={} pc=0x{:08X} ts={}", utid, pid, tid, begin_pc, ts);
            }
            Event::Commit { utid, pid, tid, ts } => {
                log::trace!("tm: commit utid={} pid={} tid={} ts={}", utid, pid, tid, ts);
            }
            Event::NackLoad { utid, pid, by, raddr, my_ts, other_ts, .. } => {
                log::trace!("tm: nack-load utid={} pid={} by={} raddr=0x{:08X} my_ts={} other_ts={}", utid, pid, by, raddr, my_ts, other_ts);
            }
            Event::NackStore { utid, pid, by, raddr, my_ts, other_ts, .. } => {
                log::trace!("tm: nack-store utid={} pid={} by={} raddr=0x{:08X} my_ts={} other_ts={}", utid, pid, by, raddr, my_ts, other_ts);
            }
            Event::NackCommit { utid, pid, by, my_ts, other_ts, .. } => {
                log::trace!("tm: nack-commit utid={} pid={} committer={} my_ts={} other_ts={}", utid, pid, by, my_ts, other_ts);
            }
            Event::CommitToken { utid, pid, ts, .. } => {
                log::trace!("tm: commit-token utid={} pid={} ts={}", utid, pid, ts);
            }
            Event::Abort { utid, pid, by, caddr, my_ts, .. } => {
                log::trace!("tm: abort utid={} pid={} by={} line=0x{:08X} my_ts={}", utid, pid, by, caddr, my_ts);
            }
        }
    }
}

/// Sink that records events in order, for test assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: RefCell<Vec<Event>>,
}

impl RecordingSink {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the recorded events, clearing the recorder.
    pub fn take(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// Number of events recorded so far.
    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}

impl ReportSink for RecordingSink {
    fn report(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_orders_events() {
        let sink = RecordingSink::new();
        sink.report(Event::Commit { utid: 1, pid: 0, tid: 0, ts: 5 });
        sink.report(Event::Commit { utid: 2, pid: 1, tid: 0, ts: 9 });

        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::Commit { utid: 1, .. }));
        assert!(matches!(events[1], Event::Commit { utid: 2, .. }));
        assert!(sink.is_empty());
    }
}
