//! Transaction lifecycle state.
//!
//! Each simulated process carries one [`TxRecord`] describing where its
//! current (or most recent) transaction sits in the lifecycle:
//!
//! ```text
//! Invalid ──begin──▶ Running ──conflict──▶ Nacked ──retry──▶ Running
//!                    │                          │
//!                    │                          └──forced──▶ Aborting
//!                    ├──commit────────▶ Committing ──final──▶ Committed
//!                    └──abort──▶ Aborting ──begin──▶ Aborted ──backoff──▶ Running
//! ```
//!
//! `DoAbort` is a sideband: it is set on a process *by a peer* (a lazy
//! committer invalidating conflicting transactions), and converts to
//! `Aborting` the next time the owning process touches the coherence
//! manager.

use crate::host::Addr;

/// Sentinel timestamp for a process that is not inside a transaction.
///
/// Large enough that any real transaction is older, with slack below
/// `u64::MAX` so timestamp arithmetic cannot wrap.
pub const NO_TIMESTAMP: u64 = u64::MAX - 1024;

/// Lifecycle state of a process's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// No transaction has ever run on this process.
    Invalid,
    /// Transaction executing normally.
    Running,
    /// Last access was refused; the process is stalled and will retry.
    Nacked,
    /// Commit stall issued; the next commit call finalizes.
    Committing,
    /// Commit finalized.
    Committed,
    /// A peer ordered this transaction to abort; not yet observed.
    DoAbort,
    /// Abort acknowledged; line cleanup pending at the next begin.
    Aborting,
    /// Abort complete; the next begin returns a backoff request.
    Aborted,
}

impl TxStatus {
    /// Short display name for summaries.
    pub fn name(&self) -> &'static str {
        match self {
            TxStatus::Invalid => "Invalid",
            TxStatus::Running => "Running",
            TxStatus::Nacked => "Nacked",
            TxStatus::Committing => "Committing",
            TxStatus::Committed => "Committed",
            TxStatus::DoAbort => "DoAbort",
            TxStatus::Aborting => "Aborting",
            TxStatus::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a transaction was forced to abort: the committing process and the
/// cache line it published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbortReason {
    pub by: usize,
    pub line: Addr,
}

/// Per-process transaction record.
#[derive(Debug, Clone)]
pub struct TxRecord {
    /// Lifecycle state.
    pub status: TxStatus,
    /// Cycle of the outermost begin. Assigned afresh on every begin, so a
    /// replay stays younger than the transactions it already lost to.
    pub timestamp: u64,
    /// Raised by a peer that suspects a stall cycle through this process.
    pub cycle_flag: bool,
    /// Program address of the begin instruction.
    pub begin_pc: u32,
    /// Unique transaction id, monotonic across all processes.
    pub utid: u64,
}

impl TxRecord {
    /// Record for a process that has never begun a transaction.
    pub fn new() -> Self {
        Self {
            status: TxStatus::Invalid,
            timestamp: NO_TIMESTAMP,
            cycle_flag: false,
            begin_pc: 0,
            utid: 0,
        }
    }

    /// Clear the fields a finished transaction leaves behind.
    ///
    /// Used by commit and abort; `status`, `utid`, and abort counters are
    /// managed by the caller.
    pub fn reset_window(&mut self) {
        self.timestamp = NO_TIMESTAMP;
        self.begin_pc = 0;
        self.cycle_flag = false;
    }
}

impl Default for TxRecord {
    fn default() -> Self {
        Self::new()
    }
}
