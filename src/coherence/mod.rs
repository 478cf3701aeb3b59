//! Global coherence manager.
//!
//! The manager owns everything the simulated processes share:
//!
//! - the cache-line state table ([`line::LineTable`])
//! - the per-process transaction records ([`status::TxRecord`])
//! - the unique-transaction-id counter
//! - the lazy-commit token (`current_committer`)
//! - the global cycle clock, advanced by the host scheduler
//!
//! Two protocol families hang off one state machine. Under *eager* conflict
//! detection ([`eager`]) every speculative access checks the line table and
//! may be refused (NACK) or escalated to an abort via the timestamp /
//! cycle-flag deadlock heuristic. Under *lazy* detection ([`lazy`]) accesses
//! always succeed and conflicts are resolved when a committer, holding the
//! single commit token, invalidates every overlapping transaction.
//!
//! All outcomes are return values; once constructed, the manager never
//! panics on protocol activity. The host reacts to `Nack`/`Delay`/`Backoff`
//! by stalling the process ([`CoherenceManager::stall_for`]) and rewinding
//! its PC so the instruction replays.

pub mod eager;
pub mod lazy;
pub mod line;
pub mod status;

use thiserror::Error;

use crate::host::{Addr, Instr};
use crate::report::{Event, ReportSink};

pub use line::{LineMode, LineState, LineTable, PidSet};
pub use status::{AbortReason, TxRecord, TxStatus, NO_TIMESTAMP};

/// Conflict-detection / versioning policy.
///
/// The flag pair `(versioning, conflict_detection)` maps as follows; eager
/// versioning with lazy detection is not a meaningful combination and is
/// rejected at construction.
///
/// | versioning | conflict detection | policy |
/// |---|---|---|
/// | eager | eager | `EagerEager` |
/// | lazy | eager | `EagerLazy` (eager ops, swapped stall roles) |
/// | lazy | lazy | `LazyLazy` |
/// | eager | lazy | rejected |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    EagerEager,
    EagerLazy,
    LazyLazy,
}

impl Policy {
    /// Resolve the configuration flag pair into a policy.
    pub fn from_flags(versioning: bool, conflict_detection: bool) -> Result<Self, PolicyError> {
        match (versioning, conflict_detection) {
            (true, true) => Ok(Policy::EagerEager),
            (false, true) => Ok(Policy::EagerLazy),
            (false, false) => Ok(Policy::LazyLazy),
            (true, false) => Err(PolicyError::UnsupportedCombination),
        }
    }

    /// True for policies that detect conflicts at access time.
    #[inline]
    pub fn eager_detection(&self) -> bool {
        !matches!(self, Policy::LazyLazy)
    }

    /// True for the policy that models eager versioning timing.
    #[inline]
    pub fn eager_versioning(&self) -> bool {
        matches!(self, Policy::EagerEager)
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Policy::EagerEager => write!(f, "eager/eager"),
            Policy::EagerLazy => write!(f, "eager/lazy"),
            Policy::LazyLazy => write!(f, "lazy/lazy"),
        }
    }
}

/// Fatal construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// Eager versioning requires eager conflict detection.
    #[error("unsupported versioning/conflict-detection combination: eager versioning requires eager conflict detection")]
    UnsupportedCombination,
    /// Cache line size must be a power of two.
    #[error("cache line size {0} is not a power of two")]
    BadLineSize(u32),
}

/// Begin/commit classifier handed back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BcFlag {
    /// First execution of this transaction.
    #[default]
    Fresh,
    /// Replay after one or more aborts.
    Replay,
    /// Subsumed inner begin/commit of a nested transaction.
    Subsumed,
}

/// Verdict for a speculative read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Access granted; the line table was updated.
    Success,
    /// Refused; stall and retry the same instruction.
    Nack,
    /// The transaction must abort.
    Abort,
}

/// How a begin call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginKind {
    /// Transaction window opened.
    Success,
    /// The previous abort finished; stall for backoff, then retry the begin.
    Backoff,
    /// Subsumed nested begin; nothing to do.
    Ignore,
}

/// Result of a begin call.
#[derive(Debug, Clone, Copy)]
pub struct BeginOutcome {
    pub kind: BeginKind,
    pub bc_flag: BcFlag,
    pub utid: u64,
    /// Consecutive aborts so far; drives the backoff window.
    pub abort_count: u32,
}

/// How a commit call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// Commit finalized; speculative writes may be published.
    Success,
    /// Commit stall issued; retry the commit after stalling.
    Delay,
    /// Another process holds the commit token; stall and retry.
    Nack,
    /// A committer invalidated this transaction.
    Abort,
    /// Subsumed nested commit; nothing to do.
    Ignore,
}

/// Result of a commit call.
#[derive(Debug, Clone, Copy)]
pub struct CommitOutcome {
    pub kind: CommitKind,
    pub bc_flag: BcFlag,
    pub utid: u64,
    /// Lines this process wrote; scales the commit stall.
    pub write_set: usize,
}

/// How an abort call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// Abort acknowledged; restore registers and replay from the begin.
    Success,
    /// The configured abort cap was reached; leave the thread alone.
    Ignore,
}

/// Result of an abort call.
#[derive(Debug, Clone, Copy)]
pub struct AbortOutcome {
    pub kind: AbortKind,
    /// Lines this process wrote; scales the abort stall.
    pub write_set: usize,
}

/// Per-process cycle accounting, reported by [`CoherenceManager::stats`].
#[derive(Debug, Clone, Default)]
pub struct PidStats {
    /// Cycles spent in transactions that committed.
    pub commit_cycles: u64,
    /// Cycles spent in transactions that aborted.
    pub abort_cycles: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions aborted.
    pub aborts: u64,
}

/// The global coherence manager.
pub struct CoherenceManager {
    policy: Policy,
    lines: LineTable,
    tx: Vec<TxRecord>,
    depth: Vec<u32>,
    abort_count: Vec<u32>,
    abort_reason: Vec<AbortReason>,
    /// Cycle at which each process may resume after a stall.
    stall_cycle: Vec<u64>,
    /// Clock value captured at each process's outermost begin.
    cycles_on_begin: Vec<u64>,
    stats: Vec<PidStats>,
    /// Lazy-commit token: the process currently in its commit window.
    current_committer: Option<usize>,
    next_utid: u64,
    clock: u64,
    /// Optional cap on consecutive aborts per process.
    abort_max: Option<u32>,
    sink: Box<dyn ReportSink>,
}

impl CoherenceManager {
    /// Create a manager for `num_cpus` processes.
    ///
    /// Fails for the unsupported policy combination or a non-power-of-two
    /// line size.
    pub fn new(
        versioning: bool,
        conflict_detection: bool,
        line_size: u32,
        num_cpus: usize,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self, PolicyError> {
        let policy = Policy::from_flags(versioning, conflict_detection)?;
        if !line_size.is_power_of_two() {
            return Err(PolicyError::BadLineSize(line_size));
        }

        log::debug!(
            "coherence manager: policy={} line_size={} cpus={}",
            policy,
            line_size,
            num_cpus
        );

        Ok(Self {
            policy,
            lines: LineTable::new(line_size),
            tx: vec![TxRecord::new(); num_cpus],
            depth: vec![0; num_cpus],
            abort_count: vec![0; num_cpus],
            abort_reason: vec![AbortReason::default(); num_cpus],
            stall_cycle: vec![0; num_cpus],
            cycles_on_begin: vec![0; num_cpus],
            stats: vec![PidStats::default(); num_cpus],
            current_committer: None,
            next_utid: 0,
            clock: 0,
            abort_max: None,
            sink,
        })
    }

    /// Set an upper bound on consecutive aborts per process.
    ///
    /// When the bound is hit, `abort` returns [`AbortKind::Ignore`] and the
    /// context leaves the thread untouched. Unbounded by default.
    pub fn set_abort_max(&mut self, max: Option<u32>) {
        self.abort_max = max;
    }

    /// Active policy.
    #[inline]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Number of simulated processes.
    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.tx.len()
    }

    // --- clock -----------------------------------------------------------

    /// Current cycle.
    #[inline]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Set the cycle counter; the host scheduler owns time.
    #[inline]
    pub fn set_clock(&mut self, cycle: u64) {
        self.clock = cycle;
    }

    /// Advance the clock one cycle.
    #[inline]
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    // --- stall bookkeeping ------------------------------------------------

    /// Stall `pid` for `cycles` cycles from now.
    pub fn stall_for(&mut self, pid: usize, cycles: u64) {
        self.stall_cycle[pid] = self.clock + cycles;
        log::trace!("tm: pid={} stalled until cycle {}", pid, self.stall_cycle[pid]);
    }

    /// True while `pid` is inside a stall window.
    #[inline]
    pub fn is_stalled(&self, pid: usize) -> bool {
        self.clock < self.stall_cycle[pid]
    }

    /// Cycle at which `pid`'s current stall ends.
    #[inline]
    pub fn resume_cycle(&self, pid: usize) -> u64 {
        self.stall_cycle[pid]
    }

    // --- protocol dispatch ------------------------------------------------

    /// Speculative read of `raddr` by `pid`.
    pub fn read(&mut self, pid: usize, tid: u32, raddr: Addr) -> Access {
        match self.policy {
            Policy::EagerEager | Policy::EagerLazy => self.read_eager(pid, tid, raddr),
            Policy::LazyLazy => self.read_lazy(pid, tid, raddr),
        }
    }

    /// Speculative write of `raddr` by `pid`.
    pub fn write(&mut self, pid: usize, tid: u32, raddr: Addr) -> Access {
        match self.policy {
            Policy::EagerEager | Policy::EagerLazy => self.write_eager(pid, tid, raddr),
            Policy::LazyLazy => self.write_lazy(pid, tid, raddr),
        }
    }

    /// Open (or subsume into) a transaction at the given begin instruction.
    pub fn begin(&mut self, pid: usize, instr: &Instr) -> BeginOutcome {
        match self.policy {
            Policy::EagerEager | Policy::EagerLazy => self.begin_eager(pid, instr),
            Policy::LazyLazy => self.begin_lazy(pid, instr),
        }
    }

    /// Commit (or subsume) the transaction on `pid`.
    pub fn commit(&mut self, pid: usize, tid: u32) -> CommitOutcome {
        match self.policy {
            Policy::EagerEager | Policy::EagerLazy => self.commit_eager(pid, tid),
            Policy::LazyLazy => self.commit_lazy(pid, tid),
        }
    }

    /// Abort the transaction on `pid`.
    pub fn abort(&mut self, pid: usize, tid: u32) -> AbortOutcome {
        match self.policy {
            Policy::EagerEager | Policy::EagerLazy => self.abort_eager(pid, tid),
            Policy::LazyLazy => self.abort_lazy(pid, tid),
        }
    }

    /// Poll for a peer-ordered abort.
    ///
    /// Returns true (once) if a committer marked `pid` for abort; the state
    /// moves to `Aborting` and the host must drive the abort path.
    pub fn check_abort(&mut self, pid: usize, tid: u32) -> bool {
        if self.tx[pid].status == TxStatus::DoAbort {
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
            true
        } else {
            false
        }
    }

    // --- introspection ----------------------------------------------------

    /// Transaction record for `pid`.
    #[inline]
    pub fn tx_record(&self, pid: usize) -> &TxRecord {
        &self.tx[pid]
    }

    /// Nesting depth for `pid`.
    #[inline]
    pub fn depth(&self, pid: usize) -> u32 {
        self.depth[pid]
    }

    /// Consecutive aborts recorded for `pid`.
    #[inline]
    pub fn abort_count(&self, pid: usize) -> u32 {
        self.abort_count[pid]
    }

    /// Reason recorded when `pid` was last forced to abort.
    #[inline]
    pub fn abort_reason(&self, pid: usize) -> AbortReason {
        self.abort_reason[pid]
    }

    /// Process currently holding the lazy commit token.
    #[inline]
    pub fn current_committer(&self) -> Option<usize> {
        self.current_committer
    }

    /// The shared line table.
    #[inline]
    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    /// Align an address down to its cache line.
    #[inline]
    pub fn line_of(&self, addr: Addr) -> Addr {
        self.lines.line_of(addr)
    }

    /// Per-process cycle accounting.
    #[inline]
    pub fn stats(&self, pid: usize) -> &PidStats {
        &self.stats[pid]
    }

    /// Render a per-process summary, one line per process that ran a
    /// transaction.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "policy {} | {} lines touched | clock {}\n",
            self.policy,
            self.lines.len(),
            self.clock
        ));
        for (pid, stats) in self.stats.iter().enumerate() {
            if stats.commits == 0 && stats.aborts == 0 {
                continue;
            }
            out.push_str(&format!(
                "  pid {:2}: {} commits ({} cycles), {} aborts ({} cycles), state {}\n",
                pid,
                stats.commits,
                stats.commit_cycles,
                stats.aborts,
                stats.abort_cycles,
                self.tx[pid].status
            ));
        }
        out
    }

    // --- shared helpers for the protocol impls ---------------------------

    pub(crate) fn issue_utid(&mut self) -> u64 {
        let utid = self.next_utid;
        self.next_utid += 1;
        utid
    }
}

impl std::fmt::Debug for CoherenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherenceManager")
            .field("policy", &self.policy)
            .field("cpus", &self.tx.len())
            .field("lines", &self.lines.len())
            .field("clock", &self.clock)
            .field("next_utid", &self.next_utid)
            .field("current_committer", &self.current_committer)
            .finish()
    }
}
