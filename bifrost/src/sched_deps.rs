// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Per-block dependency graph
//!
//! Clauses are filled back-to-front, so the scheduler retires instructions in
//! reverse program order.  The graph is oriented for that walk: an edge from
//! parent to child means the parent is later in program order and must retire
//! before the child becomes ready.  RAW, WAR and WAW hazards over the
//! register file all reduce to this one direction, as do the ordering edges
//! for message-passing instructions, schedule barriers, and a trailing
//! branch.
//!
//! The graph is built in a single reverse walk with per-register reader and
//! writer tables scoped to the walk, then dropped with the block's clauses.

use crate::ir::{Instr, NUM_REGS, Op, RegMask};
use compiler::bitset::BitSet;

pub struct DepGraph {
    dependents: Vec<BitSet>,
    dep_counts: Vec<u32>,
}

/// Hazard footprint of one instruction.  BLEND in a non-blend shader may
/// invoke a blend shader which clobbers r0-r15, so it is treated as touching
/// those registers as well.
fn hazard_masks(instr: &Instr, is_blend_shader: bool) -> (RegMask, RegMask) {
    let mut reads = instr.reads();
    let mut writes = instr.writes();
    if instr.op == Op::Blend && !is_blend_shader {
        let clobber = RegMask(0xffff);
        reads = reads | clobber;
        writes = writes | clobber;
    }
    (reads, writes)
}

impl DepGraph {
    pub fn for_block(
        instrs: &[Box<Instr>],
        is_blend_shader: bool,
        in_order: bool,
    ) -> DepGraph {
        let num_instrs = instrs.len();
        let mut g = DepGraph {
            dependents: vec![BitSet::new(); num_instrs],
            dep_counts: vec![0; num_instrs],
        };

        let mut readers: Vec<Vec<usize>> =
            vec![Vec::new(); NUM_REGS as usize];
        let mut last_write: Vec<Option<usize>> =
            vec![None; NUM_REGS as usize];
        let mut prev_msg: Option<usize> = None;

        for ip in (0..num_instrs).rev() {
            let instr = &instrs[ip];
            let (reads, writes) = hazard_masks(instr, is_blend_shader);

            for reg in 0..NUM_REGS {
                if reads.contains(reg) {
                    // WAR against the next write of this register
                    if let Some(w) = last_write[reg as usize] {
                        g.add_dep(w, ip);
                    }
                }
                if writes.contains(reg) {
                    // RAW against later readers, WAW against the next write
                    for &r in &readers[reg as usize] {
                        g.add_dep(r, ip);
                    }
                    if let Some(w) = last_write[reg as usize] {
                        g.add_dep(w, ip);
                    }
                    readers[reg as usize].clear();
                    last_write[reg as usize] = Some(ip);
                }
                if reads.contains(reg) {
                    readers[reg as usize].push(ip);
                }
            }

            if instr.message().is_some() {
                if let Some(m) = prev_msg {
                    g.add_dep(m, ip);
                }
                prev_msg = Some(ip);
            }
        }

        // Schedule barriers impose a total order against everything else in
        // the block, as does the in-order debug mode.
        if in_order {
            for ip in 1..num_instrs {
                g.add_dep(ip, ip - 1);
            }
        } else {
            for (ip, instr) in instrs.iter().enumerate() {
                if instr.op.is_sched_barrier() {
                    for other in 0..num_instrs {
                        if other != ip {
                            g.add_dep(ip.max(other), ip.min(other));
                        }
                    }
                }
            }
        }

        // A trailing branch is architecturally last: it must retire first in
        // the backwards walk.
        if let Some(last) = instrs.last() {
            if last.is_branch() {
                let b = num_instrs - 1;
                for other in 0..b {
                    g.add_dep(b, other);
                }
            }
        }

        g
    }

    pub fn num_instrs(&self) -> usize {
        self.dep_counts.len()
    }

    fn add_dep(&mut self, parent: usize, child: usize) {
        if parent == child {
            return;
        }
        if self.dependents[parent].insert(child) {
            self.dep_counts[child] += 1;
        }
    }
}

/// The set of instructions whose remaining dependency count is zero
pub struct Worklist {
    ready: BitSet,
}

impl Worklist {
    pub fn new(graph: &DepGraph) -> Worklist {
        let mut ready = BitSet::new();
        for (ip, &count) in graph.dep_counts.iter().enumerate() {
            if count == 0 {
                ready.insert(ip);
            }
        }
        Worklist { ready }
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn iter(&self) -> impl '_ + Iterator<Item = usize> {
        self.ready.iter()
    }

    /// Retire an instruction, releasing dependents whose count drops to zero
    pub fn take(&mut self, graph: &mut DepGraph, ip: usize) {
        let was_ready = self.ready.remove(ip);
        debug_assert!(was_ready);

        let DepGraph {
            dependents,
            dep_counts,
        } = graph;
        for child in dependents[ip].iter() {
            dep_counts[child] -= 1;
            if dep_counts[child] == 0 {
                self.ready.insert(child);
            }
        }
    }
}
