//! tm-emu: demo driver for the transactional memory coherence simulator.
//!
//! Runs a canned contended-counter workload: every simulated CPU repeatedly
//! opens a transaction, loads a shared counter, increments it, stores it
//! back, and commits. Conflicts, NACK stalls, backoff, and replays all flow
//! through the coherence manager; this driver only plays the host
//! scheduler's role (advance the clock, resume unstalled threads, poll for
//! forced aborts).
//!
//! Usage:
//!
//! ```text
//! tm-emu [--lazy] [--cpus N] [--iters N]
//! ```

use anyhow::{bail, Result};
use tm_emu::config::TmConfig;
use tm_emu::context::TxnEngine;
use tm_emu::host::{InstrRef, Program, SimMemory, SimThread};
use tm_emu::report::LogSink;

/// Shared counter location in target memory.
const COUNTER_ADDR: u32 = 0x1000;

/// Instruction roles within one thread's loop body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Begin,
    Load,
    Add,
    Store,
    Commit,
}

const LOOP_BODY: [Action; 5] = [
    Action::Begin,
    Action::Load,
    Action::Add,
    Action::Store,
    Action::Commit,
];

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut lazy = false;
    let mut cpus = 4usize;
    let mut iters = 32u32;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--lazy" => lazy = true,
            "--cpus" => {
                i += 1;
                cpus = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(cpus);
            }
            "--iters" => {
                i += 1;
                iters = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(iters);
            }
            other => bail!("unknown argument: {}", other),
        }
        i += 1;
    }

    let mut cfg = TmConfig::get().clone();
    cfg.num_cpus = cpus;
    if lazy {
        cfg.versioning = false;
        cfg.conflict_detection = false;
    }

    println!(
        "tm-emu: {} CPUs x {} increments, policy {}",
        cpus,
        iters,
        if lazy { "lazy/lazy" } else { "eager/eager" }
    );

    let mut engine = TxnEngine::from_config(&cfg, Box::new(LogSink))?;
    let mut mem = SimMemory::new();

    // One loop body per thread, laid out back to back.
    let mut program = Program::new();
    let mut region_start = Vec::with_capacity(cpus);
    for pid in 0..cpus {
        region_start.push(program.len());
        for (slot, _) in LOOP_BODY.iter().enumerate() {
            program.push((0x4000 + pid * 0x100 + slot * 4) as u32, pid as u32);
        }
    }

    let mut threads: Vec<SimThread> = (0..cpus)
        .map(|pid| SimThread::new(pid, InstrRef::new(region_start[pid])))
        .collect();
    let mut remaining: Vec<u32> = vec![iters; cpus];

    let cycle_limit = 50_000_000u64;
    while remaining.iter().any(|&r| r > 0) {
        let clock = engine.gcm.tick();
        if clock > cycle_limit {
            bail!("cycle limit exceeded; workload did not converge");
        }

        for pid in 0..cpus {
            if remaining[pid] == 0 || engine.gcm.is_stalled(pid) {
                continue;
            }

            let thread = &mut threads[pid];
            if thread.in_transaction() && engine.check_abort(thread) {
                engine.abort(thread);
                continue;
            }

            let offset = thread.pc.index() - region_start[pid];
            let at = thread.pc;
            match LOOP_BODY[offset] {
                Action::Begin => engine.begin(thread, &program, at),
                Action::Load => {
                    engine.load_word(thread, &mem, &program, at, COUNTER_ADDR, 2)
                }
                Action::Add => {
                    // Plain register arithmetic; not a TM instruction.
                    let value = thread.reg(2).wrapping_add(1);
                    thread.set_reg(2, value);
                    thread.set_pc(program.get(at).next);
                }
                Action::Store => {
                    engine.store_word(thread, &program, at, COUNTER_ADDR, 2)
                }
                Action::Commit => {
                    engine.commit(thread, &mut mem, &program, at);
                    // A completed commit moves the PC past the loop body.
                    if thread.pc.index() == region_start[pid] + LOOP_BODY.len() {
                        remaining[pid] -= 1;
                        thread.set_pc(InstrRef::new(region_start[pid]));
                    }
                }
            }
        }
    }

    let final_count = mem.read_word(COUNTER_ADDR);
    println!();
    println!("final counter: {} (expected {})", final_count, cpus as u32 * iters);
    println!("cycles: {}", engine.gcm.clock());
    println!();
    print!("{}", engine.gcm.summary());

    for thread in &threads {
        println!(
            "  thread {:2}: {} aborts observed by host",
            thread.pid, thread.abort_count
        );
    }

    if final_count != cpus as u32 * iters {
        bail!("counter mismatch: transactional isolation was violated");
    }
    Ok(())
}
