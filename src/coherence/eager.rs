//! Eager conflict detection.
//!
//! Accesses are checked against the line table at issue time. A conflicting
//! access either stalls the requester (NACK) or aborts it, decided by the
//! timestamp / cycle-flag heuristic:
//!
//! - A requester older than the current owner (smaller timestamp) raises the
//!   owner's cycle flag: "someone older is stalled behind you".
//! - A requester that is itself flagged and meets an owner at least as old
//!   as itself aborts instead of stalling — it may be part of a wait cycle,
//!   and it is the younger party.
//!
//! Timestamps are assigned at the outermost begin and survive replays, so a
//! transaction that lost a conflict once keeps losing age comparisons to the
//! same opponents until it commits.
//!
//! Abort is a two-phase affair: the abort call only marks the process
//! `Aborting` and reports the write-set size; its line-table entries stay
//! visible until the process actually restarts, and the next begin sweeps
//! them out before requesting backoff.

use super::status::TxStatus;
use super::{
    Access, AbortKind, AbortOutcome, BcFlag, BeginKind, BeginOutcome, CoherenceManager,
    CommitKind, CommitOutcome,
};
use crate::host::{Addr, Instr};
use crate::report::Event;

impl CoherenceManager {
    /// Apply the timestamp rule against a conflicting `owner`.
    ///
    /// Reports the NACK (and the abort, if taken), updates this process's
    /// status, and returns the verdict for the requester.
    fn nack_or_abort(
        &mut self,
        pid: usize,
        tid: u32,
        owner: usize,
        raddr: Addr,
        caddr: Addr,
        store: bool,
    ) -> Access {
        let owner_ts = self.tx[owner].timestamp;
        let my_ts = self.tx[pid].timestamp;
        let utid = self.tx[pid].utid;

        let nack_event = if store {
            Event::NackStore { utid, pid, tid, by: owner, raddr, caddr, my_ts, other_ts: owner_ts }
        } else {
            Event::NackLoad { utid, pid, tid, by: owner, raddr, caddr, my_ts, other_ts: owner_ts }
        };

        // Flagged and facing someone at least as old: assume a cycle and
        // yield by aborting.
        if owner_ts <= my_ts && self.tx[pid].cycle_flag {
            self.sink.report(nack_event);
            self.sink.report(Event::Abort {
                utid,
                pid,
                tid,
                by: owner,
                raddr,
                caddr,
                my_ts,
                other_ts: owner_ts,
            });
            self.tx[pid].status = TxStatus::Aborting;
            return Access::Abort;
        }

        // We are at least as old as the owner: mark the owner suspect.
        if owner_ts >= my_ts {
            self.tx[owner].cycle_flag = true;
        }

        self.sink.report(nack_event);
        self.tx[pid].status = TxStatus::Nacked;
        Access::Nack
    }

    pub(super) fn read_eager(&mut self, pid: usize, tid: u32, raddr: Addr) -> Access {
        let caddr = self.lines.line_of(raddr);

        // A line with any foreign writer refuses the read; the lowest such
        // pid is the offender the timestamp rule runs against.
        let foreign_writer = self.lines.get(caddr).and_then(|line| {
            if line.writers.contains(pid) {
                None
            } else {
                line.writers.iter().next()
            }
        });
        if let Some(owner) = foreign_writer {
            return self.nack_or_abort(pid, tid, owner, raddr, caddr, false);
        }

        let rec = &self.tx[pid];
        self.sink.report(Event::Load {
            utid: rec.utid,
            begin_pc: rec.begin_pc,
            pid,
            tid,
            raddr,
            caddr,
            ts: rec.timestamp,
        });

        self.lines.mark_reader(caddr, pid);
        self.tx[pid].status = TxStatus::Running;
        Access::Success
    }

    pub(super) fn write_eager(&mut self, pid: usize, tid: u32, raddr: Addr) -> Access {
        let caddr = self.lines.line_of(raddr);

        // First any foreign reader, then any foreign writer; the timestamp
        // rule runs against the lowest such pid.
        let offender = self.lines.get(caddr).and_then(|line| {
            line.readers
                .first_other(pid)
                .or_else(|| line.writers.first_other(pid))
        });
        if let Some(owner) = offender {
            return self.nack_or_abort(pid, tid, owner, raddr, caddr, true);
        }

        let rec = &self.tx[pid];
        self.sink.report(Event::Store {
            utid: rec.utid,
            begin_pc: rec.begin_pc,
            pid,
            tid,
            raddr,
            caddr,
            ts: rec.timestamp,
        });

        self.lines.mark_writer(caddr, pid);
        self.tx[pid].status = TxStatus::Running;
        Access::Success
    }

    pub(super) fn begin_eager(&mut self, pid: usize, instr: &Instr) -> BeginOutcome {
        // Nested begins are subsumed into the outer transaction.
        if self.depth[pid] > 0 {
            self.depth[pid] += 1;
            return BeginOutcome {
                kind: BeginKind::Ignore,
                bc_flag: BcFlag::Subsumed,
                utid: self.tx[pid].utid,
                abort_count: self.abort_count[pid],
            };
        }

        // A freshly aborted process sweeps its line marks out here, not in
        // the abort op: peers keep observing the aborter until it restarts.
        if self.tx[pid].status == TxStatus::Aborting {
            self.lines.evict_pid(pid);
            self.tx[pid].status = TxStatus::Aborted;
            self.abort_count[pid] += 1;
            self.stats[pid].aborts += 1;
        }

        if self.tx[pid].status == TxStatus::Aborted {
            self.tx[pid].status = TxStatus::Running;
            self.cycles_on_begin[pid] = self.clock;
            return BeginOutcome {
                kind: BeginKind::Backoff,
                bc_flag: BcFlag::Fresh,
                utid: self.tx[pid].utid,
                abort_count: self.abort_count[pid],
            };
        }

        let bc_flag = if self.abort_count[pid] > 0 {
            BcFlag::Replay
        } else {
            BcFlag::Fresh
        };

        let utid = self.issue_utid();
        let rec = &mut self.tx[pid];
        rec.timestamp = self.clock;
        rec.begin_pc = instr.addr;
        rec.cycle_flag = false;
        rec.status = TxStatus::Running;
        rec.utid = utid;
        self.depth[pid] += 1;

        self.sink.report(Event::Begin {
            utid,
            pid,
            tid: instr.immed,
            begin_pc: instr.addr,
            ts: self.clock,
        });
        self.cycles_on_begin[pid] = self.clock;

        BeginOutcome {
            kind: BeginKind::Success,
            bc_flag,
            utid,
            abort_count: self.abort_count[pid],
        }
    }

    pub(super) fn commit_eager(&mut self, pid: usize, tid: u32) -> CommitOutcome {
        if self.depth[pid] > 1 {
            self.depth[pid] -= 1;
            return CommitOutcome {
                kind: CommitKind::Ignore,
                bc_flag: BcFlag::Subsumed,
                utid: self.tx[pid].utid,
                write_set: 0,
            };
        }

        if self.tx[pid].status == TxStatus::Committing {
            // The commit stall already ran; finalize.
            let utid = self.tx[pid].utid;
            self.sink.report(Event::Commit {
                utid,
                pid,
                tid,
                ts: self.tx[pid].timestamp,
            });

            let mut write_set = 0;
            for (_, line) in self.lines.iter_mut() {
                if line.writers.remove(pid) {
                    write_set += 1;
                }
                line.readers.remove(pid);
            }

            self.tx[pid].reset_window();
            self.stall_cycle[pid] = 0;
            self.abort_count[pid] = 0;
            self.depth[pid] = 0;
            self.tx[pid].status = TxStatus::Committed;

            self.stats[pid].commit_cycles +=
                self.clock.saturating_sub(self.cycles_on_begin[pid]);
            self.stats[pid].commits += 1;

            return CommitOutcome {
                kind: CommitKind::Success,
                bc_flag: BcFlag::Fresh,
                utid,
                write_set,
            };
        }

        // First commit call: announce the stall, sized by the write set.
        let write_set = self.lines.write_set_size(pid);
        self.tx[pid].status = TxStatus::Committing;
        CommitOutcome {
            kind: CommitKind::Delay,
            bc_flag: BcFlag::Fresh,
            utid: self.tx[pid].utid,
            write_set,
        }
    }

    pub(super) fn abort_eager(&mut self, pid: usize, _tid: u32) -> AbortOutcome {
        let write_set = self.lines.write_set_size(pid);

        if let Some(max) = self.abort_max {
            if self.abort_count[pid] >= max {
                return AbortOutcome { kind: AbortKind::Ignore, write_set };
            }
        }

        self.tx[pid].reset_window();
        self.stall_cycle[pid] = 0;
        // Aborts unwind all nesting in one step.
        self.depth[pid] = 0;
        self.tx[pid].status = TxStatus::Aborting;

        self.stats[pid].abort_cycles += self.clock.saturating_sub(self.cycles_on_begin[pid]);

        AbortOutcome { kind: AbortKind::Success, write_set }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::NullSink;

    fn gcm() -> CoherenceManager {
        CoherenceManager::new(true, true, 64, 4, Box::new(NullSink)).unwrap()
    }

    fn begin_at(gcm: &mut CoherenceManager, pid: usize, clock: u64) -> BeginOutcome {
        gcm.set_clock(clock);
        let instr = Instr::new(0x4000 + (pid as u32) * 0x100, pid as u32, crate::host::InstrRef::new(1));
        gcm.begin(pid, &instr)
    }

    #[test]
    fn test_read_success_registers_reader() {
        let mut gcm = gcm();
        begin_at(&mut gcm, 0, 10);

        assert_eq!(gcm.read(0, 0, 0x104), Access::Success);

        let line = gcm.lines().get(0x100).unwrap();
        assert!(line.readers.contains(0));
        assert!(line.writers.is_empty());
        assert_eq!(gcm.tx_record(0).status, TxStatus::Running);
    }

    #[test]
    fn test_write_after_own_read_is_allowed() {
        let mut gcm = gcm();
        begin_at(&mut gcm, 0, 10);

        assert_eq!(gcm.read(0, 0, 0x100), Access::Success);
        assert_eq!(gcm.write(0, 0, 0x100), Access::Success);

        let line = gcm.lines().get(0x100).unwrap();
        assert!(line.readers.contains(0));
        assert!(line.writers.contains(0));
    }

    #[test]
    fn test_exclusion_after_successful_read() {
        // After read() returns Success, no foreign writer may be on the line.
        let mut gcm = gcm();
        begin_at(&mut gcm, 0, 10);
        begin_at(&mut gcm, 1, 20);

        assert_eq!(gcm.write(0, 0, 0x200), Access::Success);
        // Foreign reader is nacked, so the writer stays exclusive.
        assert_eq!(gcm.read(1, 1, 0x204), Access::Nack);

        let line = gcm.lines().get(0x200).unwrap();
        assert!(!line.readers.contains(1));
        assert_eq!(gcm.tx_record(1).status, TxStatus::Nacked);
    }

    #[test]
    fn test_older_requester_flags_younger_owner() {
        let mut gcm = gcm();
        begin_at(&mut gcm, 0, 10); // older
        begin_at(&mut gcm, 1, 20); // younger

        // Younger owns the line.
        assert_eq!(gcm.write(1, 1, 0x300), Access::Success);

        // Older requester stalls behind it and flags it.
        assert_eq!(gcm.write(0, 0, 0x300), Access::Nack);
        assert!(gcm.tx_record(1).cycle_flag);
        assert!(!gcm.tx_record(0).cycle_flag);
    }

    #[test]
    fn test_flagged_younger_aborts_against_older() {
        // Cycle-flag liveness: once flagged, a conflict with an
        // older-or-equal transaction aborts instead of stalling.
        let mut gcm = gcm();
        begin_at(&mut gcm, 0, 10); // older
        begin_at(&mut gcm, 1, 20); // younger

        assert_eq!(gcm.read(0, 0, 0x100), Access::Success);
        assert_eq!(gcm.write(1, 1, 0x300), Access::Success);

        // Older write stalls behind younger writer, raising its flag.
        assert_eq!(gcm.write(0, 0, 0x300), Access::Nack);
        assert!(gcm.tx_record(1).cycle_flag);

        // Flagged younger now conflicts with the older reader: abort.
        assert_eq!(gcm.write(1, 1, 0x100), Access::Abort);
        assert_eq!(gcm.tx_record(1).status, TxStatus::Aborting);
    }

    #[test]
    fn test_abort_defers_line_cleanup_to_begin() {
        let mut gcm = gcm();
        begin_at(&mut gcm, 0, 10);
        assert_eq!(gcm.write(0, 0, 0x100), Access::Success);

        let out = gcm.abort(0, 0);
        assert_eq!(out.kind, AbortKind::Success);
        assert_eq!(out.write_set, 1);

        // Marks are still visible to peers.
        assert!(gcm.lines().get(0x100).unwrap().writers.contains(0));
        assert_eq!(gcm.tx_record(0).status, TxStatus::Aborting);
        assert_eq!(gcm.depth(0), 0);

        // The next begin sweeps them and asks for backoff.
        let out = begin_at(&mut gcm, 0, 30);
        assert_eq!(out.kind, BeginKind::Backoff);
        assert_eq!(out.abort_count, 1);
        assert!(!gcm.lines().get(0x100).unwrap().writers.contains(0));

        // And the begin after that is a replay.
        let out = begin_at(&mut gcm, 0, 40);
        assert_eq!(out.kind, BeginKind::Success);
        assert_eq!(out.bc_flag, BcFlag::Replay);
    }

    #[test]
    fn test_timestamp_survives_replay() {
        let mut gcm = gcm();
        begin_at(&mut gcm, 0, 10);
        gcm.abort(0, 0);
        begin_at(&mut gcm, 0, 50); // backoff
        begin_at(&mut gcm, 0, 90); // replay

        // The replay gets the current clock, not the first attempt's; it
        // stays younger than transactions begun before cycle 90.
        assert_eq!(gcm.tx_record(0).timestamp, 90);
    }

    #[test]
    fn test_subsumed_nesting_round_trip() {
        let mut gcm = gcm();
        let first = begin_at(&mut gcm, 0, 10);
        assert_eq!(first.kind, BeginKind::Success);

        let inner = begin_at(&mut gcm, 0, 12);
        assert_eq!(inner.kind, BeginKind::Ignore);
        assert_eq!(inner.bc_flag, BcFlag::Subsumed);
        assert_eq!(inner.utid, first.utid);
        assert_eq!(gcm.depth(0), 2);

        let inner_commit = gcm.commit(0, 0);
        assert_eq!(inner_commit.kind, CommitKind::Ignore);
        assert_eq!(inner_commit.bc_flag, BcFlag::Subsumed);
        assert_eq!(gcm.depth(0), 1);

        let outer = gcm.commit(0, 0);
        assert_eq!(outer.kind, CommitKind::Delay);
        let done = gcm.commit(0, 0);
        assert_eq!(done.kind, CommitKind::Success);
        assert_eq!(done.utid, first.utid);
        assert_eq!(gcm.depth(0), 0);
    }

    #[test]
    fn test_commit_counts_and_clears_write_set() {
        let mut gcm = gcm();
        begin_at(&mut gcm, 0, 10);
        assert_eq!(gcm.write(0, 0, 0x100), Access::Success);
        assert_eq!(gcm.write(0, 0, 0x108), Access::Success); // same line
        assert_eq!(gcm.write(0, 0, 0x140), Access::Success);
        assert_eq!(gcm.read(0, 0, 0x200), Access::Success);

        let delay = gcm.commit(0, 0);
        assert_eq!(delay.kind, CommitKind::Delay);
        assert_eq!(delay.write_set, 2);

        let done = gcm.commit(0, 0);
        assert_eq!(done.kind, CommitKind::Success);
        assert_eq!(done.write_set, 2);
        assert_eq!(gcm.tx_record(0).status, TxStatus::Committed);
        assert_eq!(gcm.tx_record(0).timestamp, super::super::NO_TIMESTAMP);
        assert_eq!(gcm.abort_count(0), 0);

        for (_, line) in gcm.lines().iter() {
            assert!(!line.writers.contains(0));
            assert!(!line.readers.contains(0));
        }
    }

    #[test]
    fn test_abort_cap_returns_ignore() {
        let mut gcm = gcm();
        gcm.set_abort_max(Some(1));

        begin_at(&mut gcm, 0, 10);
        gcm.abort(0, 0);
        begin_at(&mut gcm, 0, 20); // backoff; abort_count -> 1
        begin_at(&mut gcm, 0, 30); // replay

        let out = gcm.abort(0, 0);
        assert_eq!(out.kind, AbortKind::Ignore);
    }
}
