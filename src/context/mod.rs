//! Per-transaction execution context.
//!
//! A [`TransactionContext`] is created when a thread's outermost TM begin
//! succeeds. It owns everything needed to unwind: the register snapshot,
//! the begin instruction (as an index, for replay), and the speculative
//! data buffer. It dies on commit, on abort, and is never created for a
//! subsumed nested begin.
//!
//! [`TxnEngine`] drives contexts against the coherence manager: the host
//! simulator calls it for every TM instruction and speculative memory
//! access, and it translates protocol verdicts into thread effects — write
//! the register, stall and hold the PC, or unwind the transaction. The
//! engine advances the PC itself on completed instructions and rewinds it
//! on replays, so the host scheduler only ever resumes the thread at
//! `thread.pc` once its stall expires.

pub mod backoff;
pub mod spec_cache;

pub use backoff::{BackoffPolicy, StallParams};
pub use spec_cache::SpecCache;

use crate::coherence::{
    Access, AbortKind, BeginKind, CoherenceManager, CommitKind, PolicyError,
};
use crate::config::TmConfig;
use crate::host::{Addr, InstrRef, Program, RegSnapshot, SimMemory, SimThread};
use crate::report::ReportSink;

/// State of one active transaction.
#[derive(Debug)]
pub struct TransactionContext {
    /// Owning process.
    pub pid: usize,
    /// Software thread id from the begin instruction's immediate.
    pub tid: u32,
    /// The begin instruction, for replay after an abort.
    pub begin_instr: InstrRef,
    /// Registers as they were at begin.
    pub saved: RegSnapshot,
    /// Speculative data buffered by this transaction.
    pub cache: SpecCache,
}

impl TransactionContext {
    fn new(thread: &SimThread, tid: u32, begin_instr: InstrRef) -> Self {
        Self {
            pid: thread.pid,
            tid,
            begin_instr,
            saved: thread.snapshot_regs(),
            cache: SpecCache::new(),
        }
    }
}

/// Drives transactions for all threads against one coherence manager.
pub struct TxnEngine {
    /// The shared coherence manager. Public so the host scheduler can
    /// advance the clock and poll stall windows.
    pub gcm: CoherenceManager,
    stalls: StallParams,
    backoff: BackoffPolicy,
}

impl TxnEngine {
    /// Assemble an engine from parts.
    pub fn new(gcm: CoherenceManager, stalls: StallParams, backoff: BackoffPolicy) -> Self {
        Self { gcm, stalls, backoff }
    }

    /// Build the engine from a configuration section.
    pub fn from_config(cfg: &TmConfig, sink: Box<dyn ReportSink>) -> Result<Self, PolicyError> {
        let mut gcm = CoherenceManager::new(
            cfg.versioning,
            cfg.conflict_detection,
            cfg.cache_line_size,
            cfg.num_cpus,
            sink,
        )?;
        gcm.set_abort_max(cfg.abort_max);

        let stalls = StallParams::for_versioning(
            gcm.policy().eager_versioning(),
            cfg.nack_stall_cycles,
            cfg.primary_base_stall_cycles,
            cfg.primary_var_stall_cycles,
            cfg.secondary_base_stall_cycles,
            cfg.secondary_var_stall_cycles,
        );
        let backoff = BackoffPolicy::new(
            cfg.abort_exp_backoff,
            cfg.abort_lin_backoff,
            cfg.apply_randomization,
            cfg.rng_seed,
        );

        Ok(Self::new(gcm, stalls, backoff))
    }

    /// Stall parameters in effect.
    pub fn stalls(&self) -> &StallParams {
        &self.stalls
    }

    fn active_tid(thread: &SimThread) -> u32 {
        thread.contexts.last().map(|c| c.tid).unwrap_or(thread.tm_tid)
    }

    // --- transaction boundaries ------------------------------------------

    /// Execute a TM begin instruction.
    pub fn begin(&mut self, thread: &mut SimThread, program: &Program, at: InstrRef) {
        let instr = *program.get(at);
        let out = self.gcm.begin(thread.pid, &instr);

        match out.kind {
            BeginKind::Success => {
                let ctx = TransactionContext::new(thread, instr.immed, at);
                thread.contexts.push(ctx);
                thread.inc_tm_depth();
                thread.bc_flag = out.bc_flag;
                thread.tm_tid = instr.immed;
                // Clear a stale aborting flag from the previous attempt.
                thread.tm_aborting = false;
                thread.set_pc(instr.next);
            }
            BeginKind::Backoff => {
                let stall = self.backoff.abort_backoff(out.abort_count);
                self.gcm.stall_for(thread.pid, stall);
                thread.set_pc(at);
            }
            BeginKind::Ignore => {
                thread.bc_flag = out.bc_flag;
                thread.set_pc(instr.next);
            }
        }
    }

    /// Execute a TM commit instruction.
    pub fn commit(
        &mut self,
        thread: &mut SimThread,
        mem: &mut SimMemory,
        program: &Program,
        at: InstrRef,
    ) {
        if thread.contexts.is_empty() {
            log::error!("pid {}: commit with no active transaction", thread.pid);
            return;
        }
        let instr = *program.get(at);
        let tid = Self::active_tid(thread);
        let out = self.gcm.commit(thread.pid, tid);

        match out.kind {
            CommitKind::Delay => {
                let stall = self.backoff.rnd_delay(self.stalls.commit_stall(out.write_set));
                self.gcm.stall_for(thread.pid, stall);
                thread.set_pc(at);
            }
            CommitKind::Nack => {
                self.gcm.stall_for(thread.pid, self.stalls.nack_stall_cycles);
                thread.set_pc(at);
            }
            CommitKind::Ignore => {
                thread.bc_flag = out.bc_flag;
                thread.set_pc(instr.next);
            }
            CommitKind::Abort => {
                thread.tm_nacking = false;
                self.abort(thread);
            }
            CommitKind::Success => {
                thread.dec_tm_depth();
                let ctx = thread.contexts.pop().expect("checked non-empty");
                // Release the buffered words to target memory.
                for (addr, word) in ctx.cache.iter() {
                    log::trace!(
                        "tm: pid={} release 0x{:08X} -> 0x{:08X}",
                        thread.pid,
                        addr,
                        word
                    );
                    mem.write_word(addr, word);
                }
                thread.bc_flag = out.bc_flag;
                thread.set_pc(instr.next);
            }
        }
    }

    /// Abort the active transaction: restore registers, stall, and rewind
    /// to the begin instruction.
    pub fn abort(&mut self, thread: &mut SimThread) {
        let Some(top) = thread.contexts.last() else {
            log::error!("pid {}: abort with no active transaction", thread.pid);
            return;
        };
        let out = self.gcm.abort(thread.pid, top.tid);

        match out.kind {
            AbortKind::Success => {
                let ctx = thread.contexts.pop().expect("checked non-empty");
                thread.abort_count += 1;
                thread.dec_tm_depth();
                thread.restore_regs(&ctx.saved);

                let stall = self.backoff.rnd_delay(self.stalls.abort_stall(out.write_set));
                self.gcm.stall_for(thread.pid, stall);
                thread.set_pc(ctx.begin_instr);
                thread.tm_aborting = true;
            }
            AbortKind::Ignore => {
                // Abort cap reached; the host decides what to do with the
                // thread.
            }
        }
    }

    /// Poll for a peer-ordered abort between instructions.
    pub fn check_abort(&mut self, thread: &SimThread) -> bool {
        self.gcm.check_abort(thread.pid, Self::active_tid(thread))
    }

    // --- speculative access plumbing -------------------------------------

    /// Run the read protocol for `raddr`; returns true when the access is
    /// granted. NACK and abort verdicts are fully handled here.
    fn read_granted(&mut self, thread: &mut SimThread, at: InstrRef, raddr: Addr) -> bool {
        let tid = Self::active_tid(thread);
        match self.gcm.read(thread.pid, tid, raddr) {
            Access::Nack => {
                thread.tm_nacking = true;
                self.gcm.stall_for(thread.pid, self.stalls.nack_stall_cycles);
                thread.set_pc(at);
                false
            }
            Access::Abort => {
                thread.tm_nacking = false;
                self.abort(thread);
                false
            }
            Access::Success => {
                thread.tm_nacking = false;
                true
            }
        }
    }

    /// Write-side twin of [`Self::read_granted`].
    fn write_granted(&mut self, thread: &mut SimThread, at: InstrRef, raddr: Addr) -> bool {
        let tid = Self::active_tid(thread);
        match self.gcm.write(thread.pid, tid, raddr) {
            Access::Nack => {
                thread.tm_nacking = true;
                self.gcm.stall_for(thread.pid, self.stalls.nack_stall_cycles);
                thread.set_pc(at);
                false
            }
            Access::Abort => {
                thread.tm_nacking = false;
                self.abort(thread);
                false
            }
            Access::Success => {
                thread.tm_nacking = false;
                true
            }
        }
    }

    fn advance(thread: &mut SimThread, program: &Program, at: InstrRef) {
        thread.set_pc(program.get(at).next);
    }

    /// Speculative cache of the innermost context. A granted access implies
    /// an open transaction, so a missing context is a host-side misuse and
    /// terminates the simulation.
    fn top_cache(thread: &mut SimThread) -> &mut SpecCache {
        &mut thread
            .contexts
            .last_mut()
            .expect("speculative access outside a transaction")
            .cache
    }

    // --- typed speculative loads -----------------------------------------

    /// Speculative word load into GPR `rt`.
    pub fn load_word(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        rt: u8,
    ) {
        if self.read_granted(thread, at, raddr) {
            let value = Self::top_cache(thread).load_word(mem, raddr);
            thread.set_reg(rt, value);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative sign-extended halfword load into GPR `rt`.
    pub fn load_half(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        rt: u8,
    ) {
        if self.read_granted(thread, at, raddr) {
            let value = Self::top_cache(thread).load_half(mem, raddr);
            thread.set_reg(rt, value);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative zero-extended halfword load into GPR `rt`.
    pub fn load_half_unsigned(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        rt: u8,
    ) {
        if self.read_granted(thread, at, raddr) {
            let value = Self::top_cache(thread).load_half_unsigned(mem, raddr);
            thread.set_reg(rt, value);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative sign-extended byte load into GPR `rt`.
    pub fn load_byte(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        rt: u8,
    ) {
        if self.read_granted(thread, at, raddr) {
            let value = Self::top_cache(thread).load_byte(mem, raddr);
            thread.set_reg(rt, value);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative zero-extended byte load into GPR `rt`.
    pub fn load_byte_unsigned(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        rt: u8,
    ) {
        if self.read_granted(thread, at, raddr) {
            let value = Self::top_cache(thread).load_byte_unsigned(mem, raddr);
            thread.set_reg(rt, value);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative single-precision FP load into FP register `ft`.
    pub fn load_fp_single(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        ft: u8,
    ) {
        if self.read_granted(thread, at, raddr) {
            let bits = Self::top_cache(thread).load_fp_single(mem, raddr).to_bits();
            thread.set_fp(ft, bits);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative double-precision FP load into FP pair `ft`.
    pub fn load_fp_double(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        ft: u8,
    ) {
        if self.read_granted(thread, at, raddr) {
            let value = Self::top_cache(thread).load_fp_double(mem, raddr);
            thread.set_fp_double(ft, value);
            Self::advance(thread, program, at);
        }
    }

    // --- typed speculative stores ----------------------------------------

    /// Speculative byte store from GPR `rs`.
    pub fn store_byte(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        rs: u8,
    ) {
        if self.write_granted(thread, at, raddr) {
            let value = thread.reg(rs);
            Self::top_cache(thread).store_byte(mem, raddr, value);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative halfword store from GPR `rs`.
    pub fn store_half(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        rs: u8,
    ) {
        if self.write_granted(thread, at, raddr) {
            let value = thread.reg(rs);
            Self::top_cache(thread).store_half(mem, raddr, value);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative word store from GPR `rs`.
    pub fn store_word(
        &mut self,
        thread: &mut SimThread,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        rs: u8,
    ) {
        if self.write_granted(thread, at, raddr) {
            let value = thread.reg(rs);
            Self::top_cache(thread).store_word(raddr, value);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative single-precision FP store from FP register `ft`.
    pub fn store_fp_single(
        &mut self,
        thread: &mut SimThread,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        ft: u8,
    ) {
        if self.write_granted(thread, at, raddr) {
            let bits = thread.fpr[ft as usize];
            Self::top_cache(thread).store_fp_single(raddr, bits);
            Self::advance(thread, program, at);
        }
    }

    /// Speculative double-precision FP store from FP pair `ft`.
    pub fn store_fp_double(
        &mut self,
        thread: &mut SimThread,
        program: &Program,
        at: InstrRef,
        raddr: Addr,
        ft: u8,
    ) {
        if self.write_granted(thread, at, raddr) {
            let bits = ((thread.fpr[ft as usize] as u64) << 32)
                | thread.fpr[ft as usize + 1] as u64;
            Self::top_cache(thread).store_fp_double(raddr, f64::from_bits(bits));
            Self::advance(thread, program, at);
        }
    }

    // --- bulk transfers ---------------------------------------------------

    /// Copy speculative data out to a host buffer, whole words then the
    /// byte tail.
    pub fn copy_to_buffer(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        base: Addr,
        buf: &mut [u8],
    ) {
        if let Some(ctx) = thread.contexts.last_mut() {
            ctx.cache.copy_out(mem, base, buf);
        }
    }

    /// Copy a host buffer into the speculative cache, per-byte so partially
    /// covered words stay coherent.
    pub fn copy_from_buffer(
        &mut self,
        thread: &mut SimThread,
        mem: &SimMemory,
        base: Addr,
        buf: &[u8],
    ) {
        if let Some(ctx) = thread.contexts.last_mut() {
            ctx.cache.copy_in(mem, base, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coherence::BcFlag;
    use crate::report::NullSink;

    fn engine(versioning: bool, conflict: bool) -> TxnEngine {
        let cfg = TmConfig {
            versioning,
            conflict_detection: conflict,
            rng_seed: Some(7),
            apply_randomization: false,
            ..TmConfig::default()
        };
        TxnEngine::from_config(&cfg, Box::new(NullSink)).unwrap()
    }

    /// A program of `n` placeholder instructions at word-spaced addresses.
    fn program(n: usize) -> Program {
        let mut prog = Program::new();
        for i in 0..n {
            prog.push(0x1000 + 4 * i as u32, 5);
        }
        prog
    }

    #[test]
    fn test_begin_snapshots_and_advances() {
        let mut eng = engine(true, true);
        let prog = program(4);
        let mut thread = SimThread::new(0, InstrRef::new(0));
        thread.set_reg(3, 0xAAAA);

        eng.gcm.set_clock(10);
        eng.begin(&mut thread, &prog, InstrRef::new(0));

        assert_eq!(thread.contexts.len(), 1);
        assert_eq!(thread.tm_depth, 1);
        assert_eq!(thread.bc_flag, BcFlag::Fresh);
        assert_eq!(thread.tm_tid, 5);
        assert_eq!(thread.pc, InstrRef::new(1));
        assert_eq!(thread.contexts[0].saved.gpr[3], 0xAAAA);
    }

    #[test]
    fn test_speculation_is_private_until_commit() {
        let mut eng = engine(true, true);
        let prog = program(4);
        let mut mem = SimMemory::new();
        let mut thread = SimThread::new(0, InstrRef::new(0));

        eng.gcm.set_clock(10);
        eng.begin(&mut thread, &prog, InstrRef::new(0));

        thread.set_reg(2, 0xDEAD_BEEF);
        eng.store_word(&mut thread, &prog, InstrRef::new(1), 0x400, 2);

        // Real memory is untouched while the transaction runs.
        assert_eq!(mem.read_word(0x400), 0);

        // Commit: delay then success publishes the word.
        eng.commit(&mut thread, &mut mem, &prog, InstrRef::new(2));
        assert_eq!(thread.pc, InstrRef::new(2)); // replaying the commit
        assert_eq!(mem.read_word(0x400), 0);

        eng.gcm.set_clock(1000);
        eng.commit(&mut thread, &mut mem, &prog, InstrRef::new(2));
        assert_eq!(mem.read_word(0x400), 0xDEAD_BEEF);
        assert_eq!(thread.pc, InstrRef::new(3));
        assert!(thread.contexts.is_empty());
        assert_eq!(thread.tm_depth, 0);
    }

    #[test]
    fn test_load_word_reads_through_to_memory() {
        let mut eng = engine(true, true);
        let prog = program(4);
        let mut mem = SimMemory::new();
        mem.write_word(0x800, 0x0BAD_F00D);

        let mut thread = SimThread::new(0, InstrRef::new(0));
        eng.gcm.set_clock(10);
        eng.begin(&mut thread, &prog, InstrRef::new(0));

        eng.load_word(&mut thread, &mem, &prog, InstrRef::new(1), 0x800, 9);
        assert_eq!(thread.reg(9), 0x0BAD_F00D);
        assert_eq!(thread.pc, InstrRef::new(2));
    }

    #[test]
    fn test_abort_restores_registers_and_rewinds() {
        let mut eng = engine(true, true);
        let prog = program(4);
        let mut thread = SimThread::new(0, InstrRef::new(0));
        thread.set_reg(4, 111);
        thread.set_fp(6, 222);

        eng.gcm.set_clock(10);
        eng.begin(&mut thread, &prog, InstrRef::new(0));

        // Transaction scribbles over state.
        thread.set_reg(4, 999);
        thread.set_fp(6, 888);

        eng.abort(&mut thread);

        assert_eq!(thread.reg(4), 111);
        // FP registers come back from the FP snapshot.
        assert_eq!(thread.fpr[6], 222);
        assert_eq!(thread.pc, InstrRef::new(0));
        assert!(thread.tm_aborting);
        assert_eq!(thread.abort_count, 1);
        assert!(thread.contexts.is_empty());
        assert!(eng.gcm.is_stalled(0) || eng.stalls().abort_stall(0) == 0);
    }

    #[test]
    fn test_abort_leaves_memory_untouched() {
        let mut eng = engine(true, true);
        let prog = program(4);
        let mut mem = SimMemory::new();
        mem.write_word(0x400, 0x1111_1111);

        let mut thread = SimThread::new(0, InstrRef::new(0));
        eng.gcm.set_clock(10);
        eng.begin(&mut thread, &prog, InstrRef::new(0));

        thread.set_reg(2, 0x2222_2222);
        eng.store_word(&mut thread, &prog, InstrRef::new(1), 0x400, 2);
        eng.abort(&mut thread);

        assert_eq!(mem.read_word(0x400), 0x1111_1111);
    }

    #[test]
    fn test_backoff_replay_sequence() {
        let mut eng = engine(true, true);
        let prog = program(4);
        let mut thread = SimThread::new(0, InstrRef::new(0));

        eng.gcm.set_clock(10);
        eng.begin(&mut thread, &prog, InstrRef::new(0));
        eng.abort(&mut thread);
        assert_eq!(thread.pc, InstrRef::new(0));

        // First retry: the manager asks for backoff, PC stays on the begin.
        eng.gcm.set_clock(500);
        eng.begin(&mut thread, &prog, InstrRef::new(0));
        assert!(thread.contexts.is_empty());
        assert_eq!(thread.pc, InstrRef::new(0));
        assert!(eng.gcm.is_stalled(0));

        // Second retry starts the replay.
        eng.gcm.set_clock(1000);
        eng.begin(&mut thread, &prog, InstrRef::new(0));
        assert_eq!(thread.contexts.len(), 1);
        assert_eq!(thread.bc_flag, BcFlag::Replay);
        assert_eq!(thread.pc, InstrRef::new(1));
    }

    #[test]
    fn test_nacked_load_holds_pc_and_sets_flag() {
        let mut eng = engine(true, true);
        let prog = program(8);
        let mem = SimMemory::new();
        let mut t0 = SimThread::new(0, InstrRef::new(0));
        let mut t1 = SimThread::new(1, InstrRef::new(4));

        eng.gcm.set_clock(10);
        eng.begin(&mut t0, &prog, InstrRef::new(0));
        eng.gcm.set_clock(20);
        eng.begin(&mut t1, &prog, InstrRef::new(4));

        // t0 owns the line as writer.
        t0.set_reg(2, 1);
        eng.store_word(&mut t0, &prog, InstrRef::new(1), 0x100, 2);

        // t1's load is refused and must replay.
        eng.load_word(&mut t1, &mem, &prog, InstrRef::new(5), 0x100, 3);
        assert!(t1.tm_nacking);
        assert_eq!(t1.pc, InstrRef::new(5));
        assert!(eng.gcm.is_stalled(1));
        assert_eq!(t1.reg(3), 0);
    }

    #[test]
    fn test_lazy_forced_abort_through_commit() {
        let mut eng = engine(false, false);
        let prog = program(8);
        let mut mem = SimMemory::new();
        let mut t0 = SimThread::new(0, InstrRef::new(0));
        let mut t1 = SimThread::new(1, InstrRef::new(4));

        eng.gcm.set_clock(10);
        eng.begin(&mut t0, &prog, InstrRef::new(0));
        eng.gcm.set_clock(20);
        eng.begin(&mut t1, &prog, InstrRef::new(4));

        t0.set_reg(2, 0xAA);
        t1.set_reg(2, 0xBB);
        eng.store_word(&mut t0, &prog, InstrRef::new(1), 0x200, 2);
        eng.store_word(&mut t1, &prog, InstrRef::new(5), 0x200, 2);

        // t0 commits; t1 is doomed.
        eng.commit(&mut t0, &mut mem, &prog, InstrRef::new(2));
        eng.gcm.set_clock(100);
        eng.commit(&mut t0, &mut mem, &prog, InstrRef::new(2));
        assert_eq!(mem.read_word(0x200), 0xAA);

        // t1's commit turns into an abort and a rewind to its begin.
        eng.commit(&mut t1, &mut mem, &prog, InstrRef::new(6));
        assert!(t1.tm_aborting);
        assert_eq!(t1.pc, InstrRef::new(4));
        assert_eq!(mem.read_word(0x200), 0xAA);
    }

    #[test]
    fn test_subsumed_begin_creates_no_context() {
        let mut eng = engine(true, true);
        let prog = program(4);
        let mut thread = SimThread::new(0, InstrRef::new(0));

        eng.gcm.set_clock(10);
        eng.begin(&mut thread, &prog, InstrRef::new(0));
        eng.begin(&mut thread, &prog, InstrRef::new(1));

        assert_eq!(thread.contexts.len(), 1);
        assert_eq!(thread.bc_flag, BcFlag::Subsumed);
        assert_eq!(eng.gcm.depth(0), 2);
        assert_eq!(thread.pc, InstrRef::new(2));
    }

    #[test]
    fn test_buffer_ops_round_trip_through_context() {
        let mut eng = engine(true, true);
        let prog = program(4);
        let mem = SimMemory::new();
        let mut thread = SimThread::new(0, InstrRef::new(0));

        eng.gcm.set_clock(10);
        eng.begin(&mut thread, &prog, InstrRef::new(0));

        let data = [1u8, 2, 3, 4, 5, 6, 7];
        eng.copy_from_buffer(&mut thread, &mem, 0x900, &data);

        let mut out = [0u8; 7];
        eng.copy_to_buffer(&mut thread, &mem, 0x900, &mut out);
        assert_eq!(out, data);
    }
}
