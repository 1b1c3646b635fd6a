/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! Peg counters. Each worker owns a [TcpStats] and hands it down the call chain,
//! totals are merged into a [StatsAccumulator] at checkpoints.

use parking_lot::Mutex;

use crate::config::NormMode;

/// Normalization counters, one per category and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormPeg {
    TrimSyn,
    TrimRst,
    TrimWin,
    TrimMss,
    EcnSession,
    TsNop,
    IpsData,
    Block,
}

impl NormPeg {
    pub const COUNT: usize = 8;

    pub fn name(self) -> &'static str {
        match self {
            NormPeg::TrimSyn => "trim_syn",
            NormPeg::TrimRst => "trim_rst",
            NormPeg::TrimWin => "trim_win",
            NormPeg::TrimMss => "trim_mss",
            NormPeg::EcnSession => "ecn_session",
            NormPeg::TsNop => "ts_nop",
            NormPeg::IpsData => "ips_data",
            NormPeg::Block => "block",
        }
    }
}

/// `[peg][mode]`, mode Off counts what would have been normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NormStats {
    counts: [[u64; 2]; NormPeg::COUNT],
}

impl NormStats {
    pub fn add(&mut self, peg: NormPeg, mode: NormMode) {
        self.counts[peg as usize][mode.index()] += 1;
    }

    pub fn get(&self, peg: NormPeg, mode: NormMode) -> u64 {
        self.counts[peg as usize][mode.index()]
    }

    fn merge(&mut self, other: &NormStats) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            mine[0] += theirs[0];
            mine[1] += theirs[1];
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpStats {
    pub sessions: u64,
    pub sessions_on_syn: u64,
    pub sessions_on_syn_ack: u64,
    pub sessions_on_3way: u64,
    pub sessions_on_data: u64,
    pub trackers_created: u64,
    pub trackers_released: u64,
    pub syns_received: u64,
    pub resyns: u64,
    pub discards: u64,
    pub events: u64,
    pub overlaps: u64,
    pub retransmits: u64,
    pub gaps: u64,
    pub max_bytes: u64,
    pub max_segs: u64,
    pub timeouts: u64,
    pub no_pickups: u64,
    pub segs_queued: u64,
    pub rebuilt_packets: u64,
    pub rebuilt_bytes: u64,
    pub norm: NormStats,
}

impl TcpStats {
    pub fn merge(&mut self, other: &TcpStats) {
        self.sessions += other.sessions;
        self.sessions_on_syn += other.sessions_on_syn;
        self.sessions_on_syn_ack += other.sessions_on_syn_ack;
        self.sessions_on_3way += other.sessions_on_3way;
        self.sessions_on_data += other.sessions_on_data;
        self.trackers_created += other.trackers_created;
        self.trackers_released += other.trackers_released;
        self.syns_received += other.syns_received;
        self.resyns += other.resyns;
        self.discards += other.discards;
        self.events += other.events;
        self.overlaps += other.overlaps;
        self.retransmits += other.retransmits;
        self.gaps += other.gaps;
        self.max_bytes += other.max_bytes;
        self.max_segs += other.max_segs;
        self.timeouts += other.timeouts;
        self.no_pickups += other.no_pickups;
        self.segs_queued += other.segs_queued;
        self.rebuilt_packets += other.rebuilt_packets;
        self.rebuilt_bytes += other.rebuilt_bytes;
        self.norm.merge(&other.norm);
    }
}

/// Process wide totals, shared between workers.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    totals: Mutex<TcpStats>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker's counters to the totals and reset them.
    pub fn accumulate(&self, local: &mut TcpStats) {
        self.totals.lock().merge(local);
        *local = TcpStats::default();
    }

    pub fn snapshot(&self) -> TcpStats {
        self.totals.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_accumulate_from_workers() {
        let accumulator = Arc::new(StatsAccumulator::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let accumulator = Arc::clone(&accumulator);
                thread::spawn(move || {
                    let mut local = TcpStats::default();
                    for _ in 0..10 {
                        local.sessions += 1;
                        local.norm.add(NormPeg::TrimWin, NormMode::On);
                    }
                    accumulator.accumulate(&mut local);
                    assert_eq!(local, TcpStats::default());
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let totals = accumulator.snapshot();
        assert_eq!(totals.sessions, 40);
        assert_eq!(totals.norm.get(NormPeg::TrimWin, NormMode::On), 40);
        assert_eq!(totals.norm.get(NormPeg::TrimWin, NormMode::Off), 0);
    }
}
