//! Cache-line state table.
//!
//! Conflict detection operates at cache-line granularity. Each line tracks
//! the set of processes speculatively reading it and the set speculatively
//! writing it. Entries are created on first speculative touch and never
//! removed; a process leaves a line's sets when it commits or aborts.
//!
//! Reader/writer sets are tiny (one to a handful of processes), so they are
//! sorted `SmallVec`s: membership is a linear scan and "the lowest-pid
//! member other than me" — the deterministic offender choice the protocols
//! need — is a front-to-back scan.

use smallvec::SmallVec;
use std::collections::HashMap;

use crate::host::Addr;

/// Coarse access mode recorded when a line is first touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// Never touched speculatively.
    Invalid,
    /// First touch was a read.
    Read,
    /// First touch was a write.
    Write,
}

/// Small sorted set of process ids.
#[derive(Debug, Clone, Default)]
pub struct PidSet {
    pids: SmallVec<[usize; 4]>,
}

impl PidSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pid; no-op if already present.
    pub fn insert(&mut self, pid: usize) {
        if let Err(pos) = self.pids.binary_search(&pid) {
            self.pids.insert(pos, pid);
        }
    }

    /// Remove a pid. Returns true if it was present.
    pub fn remove(&mut self, pid: usize) -> bool {
        match self.pids.binary_search(&pid) {
            Ok(pos) => {
                self.pids.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Membership test.
    #[inline]
    pub fn contains(&self, pid: usize) -> bool {
        self.pids.binary_search(&pid).is_ok()
    }

    /// Number of members.
    #[inline]
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    /// True if the set has no members.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Lowest-pid member other than `pid`, if any.
    pub fn first_other(&self, pid: usize) -> Option<usize> {
        self.pids.iter().copied().find(|&p| p != pid)
    }

    /// True if any member other than `pid` exists.
    #[inline]
    pub fn has_other(&self, pid: usize) -> bool {
        self.first_other(pid).is_some()
    }

    /// Iterate members in ascending pid order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.pids.iter().copied()
    }

    /// Drop all members.
    pub fn clear(&mut self) {
        self.pids.clear();
    }
}

/// Speculative access state of one cache line.
#[derive(Debug, Clone)]
pub struct LineState {
    /// Mode stamped at creation.
    pub mode: LineMode,
    /// Processes speculatively reading this line.
    pub readers: PidSet,
    /// Processes speculatively writing this line.
    pub writers: PidSet,
}

impl LineState {
    /// Fresh line entered through a read by `pid`.
    pub fn new_read(pid: usize) -> Self {
        let mut readers = PidSet::new();
        readers.insert(pid);
        Self {
            mode: LineMode::Read,
            readers,
            writers: PidSet::new(),
        }
    }

    /// Fresh line entered through a write by `pid`.
    pub fn new_write(pid: usize) -> Self {
        let mut writers = PidSet::new();
        writers.insert(pid);
        Self {
            mode: LineMode::Write,
            readers: PidSet::new(),
            writers,
        }
    }
}

/// The process-global table of speculatively touched lines.
#[derive(Debug, Default)]
pub struct LineTable {
    lines: HashMap<Addr, LineState>,
    line_mask: Addr,
}

impl LineTable {
    /// Create a table for lines of `line_size` bytes (a power of two).
    pub fn new(line_size: u32) -> Self {
        debug_assert!(line_size.is_power_of_two());
        Self {
            lines: HashMap::new(),
            line_mask: !(line_size - 1),
        }
    }

    /// Align an address down to its containing cache line.
    #[inline]
    pub fn line_of(&self, addr: Addr) -> Addr {
        addr & self.line_mask
    }

    /// Look up a line, if it has ever been touched.
    #[inline]
    pub fn get(&self, caddr: Addr) -> Option<&LineState> {
        self.lines.get(&caddr)
    }

    /// Mutable lookup.
    #[inline]
    pub fn get_mut(&mut self, caddr: Addr) -> Option<&mut LineState> {
        self.lines.get_mut(&caddr)
    }

    /// Insert or replace a line entry.
    pub fn insert(&mut self, caddr: Addr, state: LineState) {
        self.lines.insert(caddr, state);
    }

    /// Record `pid` as a speculative reader of the line, creating the entry
    /// on first touch.
    pub fn mark_reader(&mut self, caddr: Addr, pid: usize) {
        self.lines
            .entry(caddr)
            .or_insert_with(|| LineState::new_read(pid))
            .readers
            .insert(pid);
    }

    /// Record `pid` as a speculative writer of the line, creating the entry
    /// on first touch.
    pub fn mark_writer(&mut self, caddr: Addr, pid: usize) {
        self.lines
            .entry(caddr)
            .or_insert_with(|| LineState::new_write(pid))
            .writers
            .insert(pid);
    }

    /// Iterate all touched lines.
    pub fn iter(&self) -> impl Iterator<Item = (Addr, &LineState)> {
        self.lines.iter().map(|(a, s)| (*a, s))
    }

    /// Iterate all touched lines mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Addr, &mut LineState)> {
        self.lines.iter_mut().map(|(a, s)| (*a, s))
    }

    /// Number of lines `pid` is currently writing.
    pub fn write_set_size(&self, pid: usize) -> usize {
        self.lines.values().filter(|l| l.writers.contains(pid)).count()
    }

    /// Remove `pid` from every line's reader and writer sets.
    pub fn evict_pid(&mut self, pid: usize) {
        for line in self.lines.values_mut() {
            line.writers.remove(pid);
            line.readers.remove(pid);
        }
    }

    /// Number of touched lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True if no line was ever touched.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_set_sorted_insert() {
        let mut set = PidSet::new();
        set.insert(5);
        set.insert(1);
        set.insert(3);
        set.insert(3);

        let pids: Vec<_> = set.iter().collect();
        assert_eq!(pids, vec![1, 3, 5]);
    }

    #[test]
    fn test_first_other_skips_self() {
        let mut set = PidSet::new();
        set.insert(2);
        set.insert(4);

        assert_eq!(set.first_other(2), Some(4));
        assert_eq!(set.first_other(4), Some(2));
        assert_eq!(set.first_other(9), Some(2));

        let mut solo = PidSet::new();
        solo.insert(7);
        assert_eq!(solo.first_other(7), None);
    }

    #[test]
    fn test_line_alignment() {
        let table = LineTable::new(64);
        assert_eq!(table.line_of(0x100), 0x100);
        assert_eq!(table.line_of(0x13F), 0x100);
        assert_eq!(table.line_of(0x140), 0x140);
    }

    #[test]
    fn test_write_set_size_counts_lines_not_words() {
        let mut table = LineTable::new(64);
        table.insert(0x000, LineState::new_write(1));
        table.insert(0x040, LineState::new_write(1));
        table.insert(0x080, LineState::new_read(1));

        assert_eq!(table.write_set_size(1), 2);
        assert_eq!(table.write_set_size(2), 0);
    }

    #[test]
    fn test_evict_pid_clears_both_sets() {
        let mut table = LineTable::new(64);
        let mut line = LineState::new_write(1);
        line.readers.insert(2);
        table.insert(0x000, line);

        table.evict_pid(1);
        let line = table.get(0x000).unwrap();
        assert!(!line.writers.contains(1));
        assert!(line.readers.contains(2));
    }
}
