//! Lazy conflict detection.
//!
//! Speculative accesses never conflict: reads and writes just record the
//! process in the line table and succeed. All resolution happens at commit
//! time, serialized by a single global commit token:
//!
//! 1. A committer without the token takes it, gets a `Delay`, and stalls.
//! 2. Any other process that tries to commit meanwhile is nacked.
//! 3. When the token holder returns, it publishes: every line it wrote
//!    invalidates every other reader and writer of that line (`DoAbort`),
//!    and the line's sets are cleared — the writes are now architectural.
//!
//! A process learns it was invalidated the next time it touches the manager
//! (read, write, commit, or an explicit `check_abort` poll); the entry-point
//! checks here are what makes a forced abort prompt under lazy detection.

use super::status::TxStatus;
use super::{
    Access, AbortKind, AbortOutcome, BcFlag, BeginKind, BeginOutcome, CoherenceManager,
    CommitKind, CommitOutcome,
};
use crate::host::{Addr, Instr};
use crate::report::Event;

impl CoherenceManager {
    /// Report the pending forced abort for `pid` and move it to `Aborting`.
    fn take_forced_abort(&mut self, pid: usize, tid: u32) {
        let reason = self.abort_reason[pid];
        self.sink.report(Event::Abort {
            utid: self.tx[pid].utid,
            pid,
            tid,
            by: reason.by,
            raddr: reason.line,
            caddr: reason.line,
            my_ts: self.tx[pid].timestamp,
            other_ts: 0,
        });
        self.tx[pid].status = TxStatus::Aborting;
    }

    pub(super) fn read_lazy(&mut self, pid: usize, tid: u32, raddr: Addr) -> Access {
        if self.tx[pid].status == TxStatus::DoAbort {
            self.take_forced_abort(pid, tid);
            return Access::Abort;
        }

        let caddr = self.lines.line_of(raddr);
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

    pub(super) fn write_lazy(&mut self, pid: usize, tid: u32, raddr: Addr) -> Access {
        if self.tx[pid].status == TxStatus::DoAbort {
            self.take_forced_abort(pid, tid);
            return Access::Abort;
        }

        let caddr = self.lines.line_of(raddr);
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

    pub(super) fn begin_lazy(&mut self, pid: usize, instr: &Instr) -> BeginOutcome {
        if self.depth[pid] > 0 {
            self.depth[pid] += 1;
            return BeginOutcome {
                kind: BeginKind::Ignore,
                bc_flag: BcFlag::Subsumed,
                utid: self.tx[pid].utid,
                abort_count: self.abort_count[pid],
            };
        }

        // Writes never escaped the speculative buffer, so there is nothing
        // to sweep and no backoff round: a replay starts immediately.
        if self.tx[pid].status == TxStatus::Aborting {
            self.tx[pid].status = TxStatus::Aborted;
            self.abort_count[pid] += 1;
            self.stats[pid].aborts += 1;
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

    pub(super) fn commit_lazy(&mut self, pid: usize, tid: u32) -> CommitOutcome {
        if self.tx[pid].status == TxStatus::DoAbort {
            self.take_forced_abort(pid, tid);
            return CommitOutcome {
                kind: CommitKind::Abort,
                bc_flag: BcFlag::Fresh,
                utid: self.tx[pid].utid,
                write_set: 0,
            };
        }

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
            return self.finalize_lazy_commit(pid, tid);
        }

        if let Some(holder) = self.current_committer {
            // Someone else is inside its commit window.
            self.tx[pid].status = TxStatus::Nacked;
            self.sink.report(Event::NackCommit {
                utid: self.tx[pid].utid,
                pid,
                tid,
                by: holder,
                my_ts: self.tx[pid].timestamp,
                other_ts: self.tx[holder].timestamp,
            });
            return CommitOutcome {
                kind: CommitKind::Nack,
                bc_flag: BcFlag::Fresh,
                utid: self.tx[pid].utid,
                write_set: 0,
            };
        }

        // Take the token and stall for the commit window.
        self.sink.report(Event::CommitToken {
            utid: self.tx[pid].utid,
            pid,
            tid,
            ts: self.tx[pid].timestamp,
        });
        self.current_committer = Some(pid);
        let write_set = self.lines.write_set_size(pid);
        self.tx[pid].status = TxStatus::Committing;
        CommitOutcome {
            kind: CommitKind::Delay,
            bc_flag: BcFlag::Fresh,
            utid: self.tx[pid].utid,
            write_set,
        }
    }

    /// Publish the write set and invalidate every conflicting transaction.
    fn finalize_lazy_commit(&mut self, pid: usize, tid: u32) -> CommitOutcome {
        let utid = self.tx[pid].utid;
        self.sink.report(Event::Commit {
            utid,
            pid,
            tid,
            ts: self.tx[pid].timestamp,
        });

        self.tx[pid].reset_window();
        self.stall_cycle[pid] = 0;
        self.abort_count[pid] = 0;
        self.depth[pid] = 0;

        let mut write_set = 0;
        {
            let Self { lines, tx, abort_reason, .. } = self;
            for (caddr, line) in lines.iter_mut() {
                if line.writers.remove(pid) {
                    write_set += 1;
                    // Our write to this line is now public: every other
                    // transaction that touched it is doomed.
                    for other in line.writers.iter().chain(line.readers.iter()) {
                        if other != pid {
                            tx[other].status = TxStatus::DoAbort;
                            abort_reason[other] = super::AbortReason { by: pid, line: caddr };
                        }
                    }
                    line.writers.clear();
                    line.readers.clear();
                } else {
                    line.readers.remove(pid);
                }
            }
        }

        self.current_committer = None;
        self.tx[pid].status = TxStatus::Committed;
        self.stats[pid].commit_cycles += self.clock.saturating_sub(self.cycles_on_begin[pid]);
        self.stats[pid].commits += 1;

        CommitOutcome {
            kind: CommitKind::Success,
            bc_flag: BcFlag::Fresh,
            utid,
            write_set,
        }
    }

    pub(super) fn abort_lazy(&mut self, pid: usize, _tid: u32) -> AbortOutcome {
        if let Some(max) = self.abort_max {
            if self.abort_count[pid] >= max {
                // Write-set size is irrelevant under lazy versioning.
                return AbortOutcome { kind: AbortKind::Ignore, write_set: 0 };
            }
        }

        self.tx[pid].reset_window();
        self.stall_cycle[pid] = 0;
        self.depth[pid] = 0;
        self.tx[pid].status = TxStatus::Aborting;

        self.stats[pid].abort_cycles += self.clock.saturating_sub(self.cycles_on_begin[pid]);

        AbortOutcome { kind: AbortKind::Success, write_set: 0 }
    }
}
