// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Clause scheduling
//!
//! Packs each block's instruction list into clauses of FMA+ADD tuples.  The
//! walk is backwards: the first tuple built becomes the architectural last
//! tuple of the clause, and the first clause built becomes the last clause
//! of the block.  Within a tuple the ADD unit is filled first since far
//! fewer opcodes can issue there.
//!
//! Selection is greedy over the worklist, filtered by the legality predicate
//! and scored by a small cost function.  Pseudo instructions are lowered
//! into their two-instruction hardware forms as their tuple is filled, and a
//! fourth register read is relieved by spilling to a move in the preceding
//! tuple.  Once a clause stops growing, its constants are merged into the
//! shared table and register reads of adjacent results are rewritten to
//! passthroughs.

use crate::api::{GetDebugFlags, DEBUG};
use crate::ir::{
    src_reads_passthrough, Block, Clause, Dst, FlowControl, FtzState, Instr,
    MessageType, Op, RegMask, RegRef, Shader, Src, Tuple, Unit,
};
use crate::liveness::{instr_liveness_update, Liveness};
use crate::lower_fau;
use crate::opt_dce;
use crate::sched_consts::{
    const_words_budget, merge_constants, worst_case_words, TupleConsts,
};
use crate::sched_deps::{DepGraph, Worklist};

/// Scoreboard wait bits for fixed-function results produced by earlier
/// clauses.  Slots 0-5 are general purpose; 6 and 7 wait on the eldest
/// outstanding depth/colour access.
const WAIT_DEPTH: u8 = 1 << 6;
const WAIT_COLOUR: u8 = 1 << 7;

fn message_wait_bits(msg: MessageType) -> u8 {
    match msg {
        MessageType::Atest | MessageType::ZStencil => WAIT_DEPTH,
        MessageType::Tile => WAIT_COLOUR,
        MessageType::Blend => WAIT_DEPTH | WAIT_COLOUR,
        _ => 0,
    }
}

/// Register sources read through the general read ports.  Staging operands
/// are transferred by the message unit and do not occupy a port.
fn port_reads(instr: &Instr) -> impl '_ + Iterator<Item = RegRef> {
    let skip = usize::from(instr.op.props().sr_read);
    instr.srcs[skip..]
        .iter()
        .filter_map(|s| s.as_reg().copied())
}

/// Destinations written through the general write ports
fn port_writes(instr: &Instr) -> impl '_ + Iterator<Item = RegRef> {
    let skip = usize::from(instr.op.props().sr_write);
    instr.dsts[skip..]
        .iter()
        .filter_map(|d| d.as_reg().copied())
}

/// Register writes which actually hit the register file.  A result which is
/// dead after the following tuple only ever travels by passthrough and is
/// free.
fn write_count(instr: &Instr, live_after_temp: RegMask) -> u32 {
    port_writes(instr)
        .map(|dst| (dst.mask() & live_after_temp).count())
        .sum()
}

fn read_slots(reads: &[RegRef]) -> usize {
    reads.iter().map(|r| usize::from(r.comps())).sum()
}

fn instr_cost(instr: &Instr) -> i32 {
    let mut cost = 0;

    // Flexible instructions fit anywhere, keep them for harder slots
    if instr.can_fma() && instr.can_add() {
        cost += 1;
    }

    // Messages carry the most constraints, place them greedily
    if instr.message().is_some() {
        cost -= 1;
    }

    if instr.must_last() {
        cost -= 2;
    }

    cost
}

#[derive(Default)]
struct RegState {
    reads: Vec<RegRef>,
    writes: u32,
}

struct TupleState {
    /// Architecturally the last tuple of the clause
    last: bool,
    fma: Option<Box<Instr>>,
    add: Option<Box<Instr>>,
    reg: RegState,
    consts: TupleConsts,
    fau: Option<u8>,
    /// Read slots claimed by the previously built (program-order next)
    /// tuple, bounding our write ports and triggering move spills
    prev_reads: Vec<RegRef>,
    /// Register source positions of that tuple, for passthrough legality
    prev_srcs: Vec<(Op, usize, RegRef)>,
}

#[derive(Default)]
struct ClauseState {
    message: Option<MessageType>,
    dependencies: u8,
    /// Staging ranges claimed by message instructions in this clause.
    /// Results are not guaranteed committed within the clause, so nothing
    /// else may touch them.
    accesses: Vec<RegRef>,
    /// Every register read and written by placed instructions, bounding
    /// where a later message candidate's staging ranges may land
    read_mask: RegMask,
    write_mask: RegMask,
    /// Per-tuple constants in build order
    tuple_consts: Vec<TupleConsts>,
    ftz: FtzState,
    tuple_count: usize,
}

/// Resource accounting for a newly placed instruction
fn pop_state(
    clause: &mut ClauseState,
    tuple: &mut TupleState,
    instr: &Instr,
    live_after_temp: RegMask,
    unit: Unit,
) {
    for src in instr.srcs() {
        match src {
            Src::Imm(v) => {
                // Zero has a free encoding on FMA
                if !(unit == Unit::Fma && *v == 0) {
                    tuple.consts.add(*v, false);
                }
            }
            Src::PcRel(v) => tuple.consts.add(*v, true),
            Src::Fau { slot, .. } => tuple.fau = Some(*slot),
            _ => (),
        }
    }

    for r in port_reads(instr) {
        if !tuple.reg.reads.contains(&r) {
            tuple.reg.reads.push(r);
        }
        clause.read_mask.insert(r);
    }
    tuple.reg.writes += write_count(instr, live_after_temp);
    for w in port_writes(instr) {
        clause.write_mask.insert(w);
    }

    if instr.op.props().fp {
        clause.ftz = if instr.ftz {
            FtzState::Enable
        } else {
            FtzState::Disable
        };
    }

    if let Some(r) = instr.sr_read_ref() {
        clause.accesses.push(*r);
    }
    if let Some(r) = instr.sr_write_ref() {
        clause.accesses.push(*r);
    }
}

fn lower_cubeface(add: &mut Instr) -> Box<Instr> {
    debug_assert_eq!(add.op, Op::Cubeface);

    let mut fma = Instr::new_boxed(Op::Cubeface1);
    fma.dsts[0] = add.dsts[0];
    fma.srcs[..3].copy_from_slice(&add.srcs[..3]);

    add.op = Op::Cubeface2;
    add.dsts[0] = add.dsts[1];
    add.dsts[1] = Dst::None;
    add.srcs = [fma.srcs[0], Src::None, Src::None, Src::None];
    add.srcs[0] = Src::Reg(*fma.dsts[0].as_reg().unwrap());

    fma
}

fn lower_atom_ret(add: &mut Instr) -> Box<Instr> {
    debug_assert_eq!(add.op, Op::AtomRetI32);

    // The FMA half computes the memory address and hands it over in the
    // same tuple
    let mut fma = Instr::new_boxed(Op::AtomC);
    fma.srcs[0] = add.srcs[1];
    fma.srcs[1] = add.srcs[2];
    fma.atom_op = add.atom_op;
    fma.forwarded = true;

    add.op = Op::AtomCx;
    add.srcs[1] = Src::PassFma;
    add.srcs[2] = Src::None;

    fma
}

fn lower_seg_add(add: &mut Instr) -> Box<Instr> {
    debug_assert_eq!(add.op, Op::SegAddI64);

    let dst = add.dsts[0].as_reg().copied().unwrap();
    let src = add.srcs[0].as_reg().copied().unwrap();
    debug_assert_eq!(dst.comps(), 2);
    debug_assert_eq!(src.comps(), 2);

    // Split the 64-bit pseudo into per-half hardware ops
    let mut fma = Instr::new_boxed(Op::SegAdd);
    fma.dsts[0] = Dst::Reg(RegRef::new(dst.base(), 1));
    fma.srcs[0] = Src::Reg(RegRef::new(src.base(), 1));
    fma.srcs[1] = add.srcs[1];

    add.op = Op::SegAdd;
    add.dsts[0] = Dst::Reg(RegRef::new(dst.base() + 1, 1));
    add.srcs[0] = Src::Reg(RegRef::new(src.base() + 1, 1));

    fma
}

fn lower_dtsel(add: &mut Instr) -> Box<Instr> {
    debug_assert!(add.table);

    let mut fma = Instr::new_boxed(Op::DtselImm);
    fma.srcs[0] = add.srcs[1];
    add.table = false;

    fma
}

struct BlockScheduler {
    instrs: Vec<Option<Box<Instr>>>,
    graph: DepGraph,
    worklist: Worklist,
    is_blend: bool,
}

impl BlockScheduler {
    fn remaining(&self) -> usize {
        self.instrs.iter().filter(|i| i.is_some()).count()
    }

    /// Whether some ready instruction is held back only by the single
    /// write port of a clause's final tuple
    fn blocked_on_not_last(&self) -> bool {
        self.worklist
            .iter()
            .any(|ip| self.instrs[ip].as_ref().unwrap().must_not_last())
    }

    fn instr_schedulable(
        &self,
        ip: usize,
        unit: Unit,
        clause: &ClauseState,
        tuple: &TupleState,
        live_after_temp: RegMask,
    ) -> bool {
        let instr = self.instrs[ip].as_ref().unwrap();
        let props = instr.op.props();

        match unit {
            Unit::Fma => {
                // Pseudo instructions occupy the ADD slot and synthesize
                // their own FMA companion
                if !instr.can_fma() || props.pseudo {
                    return false;
                }
            }
            Unit::Add => {
                if !instr.can_add() {
                    return false;
                }
            }
            Unit::Either => unreachable!("selection is per-unit"),
        }

        if props.message.is_some() && clause.message.is_some() {
            return false;
        }

        if instr.must_last() && !tuple.last {
            return false;
        }
        if instr.must_not_last() && tuple.last {
            return false;
        }

        if props.fp {
            let want = if instr.ftz {
                FtzState::Enable
            } else {
                FtzState::Disable
            };
            if clause.ftz != FtzState::None && clause.ftz != want {
                return false;
            }
        }

        // Nothing may touch a register range claimed by a message already
        // in the clause
        for acc in &clause.accesses {
            if port_writes(instr).any(|w| w.overlaps(acc)) {
                return false;
            }
            if instr.sr_write_ref().is_some_and(|r| r.overlaps(acc)) {
                return false;
            }
            if instr.sr_read_ref().is_some_and(|r| r.overlaps(acc)) {
                return false;
            }
        }

        // The converse holds for a message candidate: its staging traffic
        // is asynchronous, so nothing already placed in the clause may read
        // its result or clobber its inputs
        if let Some(r) = instr.sr_write_ref() {
            if (clause.read_mask | clause.write_mask).intersects(r.mask()) {
                return false;
            }
        }
        if let Some(r) = instr.sr_read_ref() {
            if clause.write_mask.intersects(r.mask()) {
                return false;
            }
        }

        // One FAU bank or up to two packed constants per tuple, and the
        // clause-wide word budget must hold even in the worst case
        let mut consts = tuple.consts.clone();
        let mut fau = tuple.fau;
        for src in instr.srcs() {
            match src {
                Src::Imm(v) => {
                    if unit == Unit::Fma && *v == 0 {
                        continue;
                    }
                    if fau.is_some() || !consts.can_add(*v, false) {
                        return false;
                    }
                    consts.add(*v, false);
                }
                Src::PcRel(v) => {
                    if fau.is_some() || !consts.can_add(*v, true) {
                        return false;
                    }
                    consts.add(*v, true);
                }
                Src::Fau { slot, .. } => {
                    if consts.count() > 0 {
                        return false;
                    }
                    match fau {
                        Some(f) if f != *slot => return false,
                        _ => fau = Some(*slot),
                    }
                }
                _ => (),
            }
        }
        let committed = worst_case_words(&clause.tuple_consts);
        let budget = const_words_budget(clause.tuple_count);
        if committed + consts.worst_case_words() > budget {
            return false;
        }

        // A register write is invisible to the rest of its own cycle, so a
        // co-issued ADD reading the FMA result must take it by passthrough,
        // which only an exact single-component read can do
        if unit == Unit::Fma {
            if let Some(add) = &tuple.add {
                for dst in port_writes(instr) {
                    for (i, src) in add.srcs().iter().enumerate() {
                        let Some(r) = src.as_reg() else {
                            continue;
                        };
                        if !r.overlaps(&dst) {
                            continue;
                        }
                        if *r != dst
                            || dst.comps() != 1
                            || !src_reads_passthrough(add.op, i)
                        {
                            return false;
                        }
                    }
                }
            }
        }

        // A destination dead after the next tuple is never register-backed,
        // so readers in that tuple must accept a passthrough too
        for dst in port_writes(instr) {
            if live_after_temp.intersects(dst.mask()) {
                continue;
            }
            for (op, i, r) in &tuple.prev_srcs {
                if !r.overlaps(&dst) {
                    continue;
                }
                if *r != dst
                    || dst.comps() != 1
                    || !src_reads_passthrough(*op, *i)
                {
                    return false;
                }
            }
        }

        // Write ports: one in the clause's final tuple, otherwise bounded
        // by the next tuple's read slots
        let nw = tuple.reg.writes + write_count(instr, live_after_temp);
        if tuple.last {
            if nw > 1 {
                return false;
            }
        } else {
            let succ_reads = read_slots(&tuple.prev_reads);
            if usize::try_from(nw).unwrap() > 4usize.saturating_sub(succ_reads)
            {
                return false;
            }
        }

        // Read ports: a fourth slot is only allowed when it can still be
        // spilled to a move in the preceding tuple.  A read of the
        // candidate's own result is forwarded within the tuple and frees
        // its slot; the passthrough check above already guaranteed every
        // such position accepts the forward.
        let mut unique = tuple.reg.reads.clone();
        if unit == Unit::Fma {
            for dst in port_writes(instr) {
                if dst.comps() == 1 {
                    unique.retain(|r| *r != dst);
                }
            }
        }
        for r in port_reads(instr) {
            if !unique.contains(&r) {
                unique.push(r);
            }
        }
        let total = read_slots(&unique);
        let spill_ok = clause.tuple_count < 7
            && committed + consts.worst_case_words()
                <= const_words_budget(clause.tuple_count + 1)
            && unique.iter().any(|r| r.comps() == 1);
        let max_reads = if spill_ok { 4 } else { 3 };
        total <= max_reads
    }

    fn take_instr(
        &mut self,
        unit: Unit,
        clause: &mut ClauseState,
        tuple: &mut TupleState,
        live_after_temp: RegMask,
    ) -> Option<Box<Instr>> {
        // An ADD-slot pseudo instruction dictates its FMA companion
        if unit == Unit::Fma {
            if let Some(add) = tuple.add.as_mut() {
                let companion = match add.op {
                    Op::Cubeface => Some(lower_cubeface(add)),
                    Op::AtomRetI32 => Some(lower_atom_ret(add)),
                    Op::SegAddI64 => Some(lower_seg_add(add)),
                    _ if add.table => Some(lower_dtsel(add)),
                    _ => None,
                };
                if let Some(companion) = companion {
                    pop_state(clause, tuple, &companion, live_after_temp, unit);
                    return Some(companion);
                }
            }
        }

        // Spill a fourth read of the next tuple to a move
        if unit == Unit::Add && read_slots(&tuple.prev_reads) > 3 {
            let i = tuple
                .prev_reads
                .iter()
                .position(|r| r.comps() == 1)
                .unwrap();
            let src = tuple.prev_reads.remove(i);

            let mut mov = Instr::new_boxed(Op::MovI32);
            mov.srcs[0] = Src::Reg(src);
            mov.dsts[0] = Dst::Reg(src);
            pop_state(clause, tuple, &mov, live_after_temp, unit);
            return Some(mov);
        }

        let mut best: Option<(usize, i32)> = None;
        for ip in self.worklist.iter() {
            if !self.instr_schedulable(ip, unit, clause, tuple, live_after_temp)
            {
                continue;
            }
            let cost = instr_cost(self.instrs[ip].as_ref().unwrap());
            // On ties the later scan position wins, biasing towards
            // instructions that free temporaries sooner in the backwards
            // walk
            match best {
                Some((_, best_cost)) if cost > best_cost => (),
                _ => best = Some((ip, cost)),
            }
        }

        let (ip, _) = best?;
        self.worklist.take(&mut self.graph, ip);
        let mut instr = self.instrs[ip].take().unwrap();

        if unit == Unit::Fma {
            if instr.op == Op::IaddU32 {
                // Legal on FMA as a carry add with zero carry-in
                debug_assert!(instr.can_iaddc());
                instr.op = Op::IaddcI32;
                instr.srcs[2] = Src::Zero;
            } else if instr.op == Op::MuxI32 {
                debug_assert!(instr.can_csel());
                instr.op = Op::CselI32;
            }
        }

        pop_state(clause, tuple, &instr, live_after_temp, unit);
        Some(instr)
    }

    fn schedule_clause(&mut self, live: &mut RegMask) -> Option<Clause> {
        if self.worklist.is_empty() {
            return None;
        }

        let mut clause = ClauseState::default();
        let mut tuples_rev: Vec<Tuple> = Vec::new();
        let mut live_after_temp = *live;
        let mut prev_reads: Vec<RegRef> = Vec::new();
        let mut prev_srcs: Vec<(Op, usize, RegRef)> = Vec::new();

        loop {
            if tuples_rev.len() == 8 {
                break;
            }
            if worst_case_words(&clause.tuple_consts)
                > const_words_budget(clause.tuple_count)
            {
                break;
            }

            let mut tuple = TupleState {
                last: tuples_rev.is_empty(),
                fma: None,
                add: None,
                reg: RegState::default(),
                consts: TupleConsts::default(),
                fau: None,
                prev_reads: std::mem::take(&mut prev_reads),
                prev_srcs: std::mem::take(&mut prev_srcs),
            };

            let add =
                self.take_instr(Unit::Add, &mut clause, &mut tuple, live_after_temp);
            tuple.add = add;
            let fma =
                self.take_instr(Unit::Fma, &mut clause, &mut tuple, live_after_temp);
            tuple.fma = fma;

            if tuple.fma.is_none() && tuple.add.is_none() {
                if tuples_rev.is_empty() && self.blocked_on_not_last() {
                    // Placeholder final tuple so the blocked instruction can
                    // land in a non-final slot
                    tuples_rev.push(Tuple::default());
                    clause.tuple_consts.push(TupleConsts::default());
                    clause.tuple_count += 1;
                    live_after_temp = *live;
                    continue;
                }
                break;
            }

            if let Some(add) = &tuple.add {
                if let Some(msg) = add.message() {
                    debug_assert!(clause.message.is_none());
                    clause.message = Some(msg);
                    if !self.is_blend {
                        clause.dependencies |= message_wait_bits(msg);
                    }
                }
            }

            // Roll liveness: this tuple's selections were judged against
            // the liveness one tuple in the future
            let snapshot = *live;
            if let Some(add) = &tuple.add {
                instr_liveness_update(add, live);
            }
            if let Some(fma) = &tuple.fma {
                instr_liveness_update(fma, live);
            }
            live_after_temp = snapshot;

            // FMA reads zero for free, don't waste constant budget on it
            if let Some(fma) = tuple.fma.as_mut() {
                for src in fma.srcs.iter_mut() {
                    if matches!(src, Src::Imm(0)) {
                        *src = Src::Zero;
                    }
                }
            }

            // A constant-free tuple commits its FAU bank choice now
            if tuple.consts.count() == 0 && tuple.fau.is_some() {
                for instr in
                    tuple.fma.iter_mut().chain(tuple.add.iter_mut())
                {
                    for src in instr.srcs.iter_mut() {
                        if let Src::Fau { hi, .. } = src {
                            *src = Src::FauPass { hi: *hi };
                        }
                    }
                }
            }

            // Same-cycle forwarding from the FMA result into the ADD slot
            if let (Some(fma), Some(add)) =
                (tuple.fma.as_mut(), tuple.add.as_mut())
            {
                if let Some(dst) = fma.dsts[0].as_reg().copied() {
                    let op = add.op;
                    let mut rewrote = false;
                    for (i, src) in add.srcs.iter_mut().enumerate() {
                        if let Src::Reg(r) = src {
                            if dst.comps() == 1
                                && *r == dst
                                && src_reads_passthrough(op, i)
                            {
                                *src = Src::PassFma;
                                rewrote = true;
                            }
                        }
                    }
                    if rewrote {
                        fma.forwarded = true;
                        // The read slot is free once no position still
                        // takes the value from the register file
                        let still_read = add
                            .srcs()
                            .iter()
                            .any(|s| s.as_reg() == Some(&dst));
                        if !still_read {
                            tuple.reg.reads.retain(|r| *r != dst);
                        }
                    }
                }
            }

            prev_reads = tuple.reg.reads.clone();
            for instr in tuple.fma.iter().chain(tuple.add.iter()) {
                let skip = usize::from(instr.op.props().sr_read);
                for (i, src) in instr.srcs().iter().enumerate().skip(skip) {
                    if let Src::Reg(r) = src {
                        prev_srcs.push((instr.op, i, *r));
                    }
                }
            }

            clause.tuple_consts.push(tuple.consts.clone());
            clause.tuple_count += 1;
            tuples_rev.push(Tuple {
                fma: tuple.fma,
                add: tuple.add,
            });
        }

        if tuples_rev.is_empty() {
            return None;
        }

        // Into final program order
        tuples_rev.reverse();
        let mut tuples = tuples_rev;
        let mut tuple_consts = clause.tuple_consts;
        tuple_consts.reverse();

        let table = merge_constants(&tuple_consts, tuples.len());
        for tuple in tuples.iter_mut() {
            for instr in tuple.iter_mut() {
                for src in instr.srcs.iter_mut() {
                    if let Some((v, pcrel)) = src.as_const() {
                        let (word, hi) = table.lookup(v, pcrel);
                        *src = Src::ConstPass { word, hi };
                    }
                }
            }
        }

        // Adjacent-tuple passthrough rewriting
        for i in 1..tuples.len() {
            let (prev, cur) = tuples.split_at_mut(i);
            let prev = &mut prev[i - 1];
            let cur = &mut cur[0];

            // Staging destinations are not ALU results and land long after
            // the tuple retires, so they never feed a passthrough
            let fma_dst = prev
                .fma
                .as_ref()
                .filter(|f| !f.op.props().sr_write)
                .and_then(|f| f.dsts[0].as_reg().copied())
                .filter(|r| r.comps() == 1);
            let add_dst = prev
                .add
                .as_ref()
                .filter(|a| !a.op.props().sr_write)
                .and_then(|a| a.dsts[0].as_reg().copied())
                .filter(|r| r.comps() == 1);

            let mut used_fma = false;
            let mut used_add = false;
            for instr in cur.iter_mut() {
                let op = instr.op;
                let skip = usize::from(op.props().sr_read);
                for (s, src) in instr.srcs.iter_mut().enumerate().skip(skip) {
                    if let Src::Reg(r) = src {
                        if !src_reads_passthrough(op, s) {
                            continue;
                        }
                        if Some(*r) == fma_dst {
                            *src = Src::PassFma;
                            used_fma = true;
                        } else if Some(*r) == add_dst {
                            *src = Src::PassAdd;
                            used_add = true;
                        }
                    }
                }
            }
            if used_fma {
                prev.fma.as_mut().unwrap().forwarded = true;
            }
            if used_add {
                prev.add.as_mut().unwrap().forwarded = true;
            }
        }

        let uncond_jump = tuples
            .last()
            .and_then(|t| t.add.as_ref())
            .is_some_and(|a| a.op == Op::Jump);

        Some(Clause {
            tuples,
            constants: table.words().to_vec(),
            message: clause.message,
            dependencies: clause.dependencies,
            flow: FlowControl::NotBackToBack,
            next_clause_prefetch: !uncond_jump,
            ftz: clause.ftz,
        })
    }

    fn fail(&self, why: &str) -> ! {
        eprintln!("unscheduled instructions:");
        for instr in self.instrs.iter().flatten() {
            eprintln!("  {instr:?}");
        }
        panic!("scheduling failed: {why}");
    }
}

pub fn schedule_block(block: &mut Block, live_out: RegMask, is_blend: bool) {
    let instrs = std::mem::take(&mut block.instrs);
    let graph = DepGraph::for_block(&instrs, is_blend, DEBUG.inorder());
    let worklist = Worklist::new(&graph);
    let mut sched = BlockScheduler {
        instrs: instrs.into_iter().map(Some).collect(),
        graph,
        worklist,
        is_blend,
    };

    let mut live = live_out;
    let mut clauses = Vec::new();
    loop {
        let before = sched.remaining();
        match sched.schedule_clause(&mut live) {
            Some(clause) => {
                if sched.remaining() == before {
                    sched.fail("clause made no progress");
                }
                clauses.push(clause);
            }
            None => break,
        }
    }
    if sched.remaining() > 0 {
        sched.fail("worklist not drained");
    }

    // Clauses were produced back-to-front
    clauses.reverse();

    if block.reconverge_after {
        if let Some(last) = clauses.last_mut() {
            last.flow = FlowControl::Reconverge;
        }
    }

    block.clauses = clauses;
    block.scheduled = true;
}

/// Clause invariants, rechecked from the block's live-out mask backwards.
/// Run under BIFROST_DEBUG=verify and from tests.
pub fn validate_block(block: &Block, live_out: RegMask) {
    assert!(block.scheduled);
    let mut live = live_out;
    for clause in block.clauses.iter().rev() {
        assert!(!clause.tuples.is_empty() && clause.tuples.len() <= 8);

        // The clause's final tuple has a single register-file write port;
        // results dead after the clause travel by passthrough and are free
        let last_writes: u32 = clause
            .tuples
            .last()
            .unwrap()
            .iter()
            .map(|i| write_count(i, live))
            .sum();
        assert!(last_writes <= 1);

        let messages =
            clause.instrs().filter(|i| i.message().is_some()).count();
        assert!(messages <= 1);
        assert_eq!(messages > 0, clause.message.is_some());

        for instr in clause.instrs() {
            if instr.op.props().fp {
                let want = if instr.ftz {
                    FtzState::Enable
                } else {
                    FtzState::Disable
                };
                assert_eq!(clause.ftz, want);
            }
        }

        for tuple in &clause.tuples {
            if let Some(fma) = &tuple.fma {
                assert!(fma.can_fma() || fma.op.props().unit == Unit::Fma);
            }
            if let Some(add) = &tuple.add {
                assert!(add.can_add());
            }

            let mut reads: Vec<RegRef> = Vec::new();
            for instr in tuple.iter() {
                for r in port_reads(instr) {
                    if !reads.contains(&r) {
                        reads.push(r);
                    }
                }
            }
            assert!(read_slots(&reads) <= 4);
        }

        for tuple in clause.tuples.iter().rev() {
            if let Some(add) = &tuple.add {
                instr_liveness_update(add, &mut live);
            }
            if let Some(fma) = &tuple.fma {
                instr_liveness_update(fma, &mut live);
            }
        }
    }
}

fn dump_block(idx: usize, block: &Block) {
    eprintln!("block {idx}:");
    for (c, clause) in block.clauses.iter().enumerate() {
        eprintln!(
            "  clause {c}: deps={:#04x} msg={:?} flow={:?} consts={:x?}",
            clause.dependencies, clause.message, clause.flow, clause.constants
        );
        for tuple in &clause.tuples {
            eprintln!("    * fma: {:?}", tuple.fma.as_deref());
            eprintln!("      add: {:?}", tuple.add.as_deref());
        }
    }
}

/// Schedule every block of the shader, in place.  Instruction lists are
/// drained into clause lists and dead code left over from passthrough
/// rewriting is swept afterwards.
pub fn schedule_shader(s: &mut Shader) {
    lower_fau::run(s);

    let liveness = Liveness::for_shader(s);
    let is_blend = s.is_blend;
    for (idx, block) in s.blocks.iter_mut().enumerate() {
        schedule_block(block, liveness.block_live_out[idx], is_blend);
        if DEBUG.verify() {
            validate_block(block, liveness.block_live_out[idx]);
        }
        if DEBUG.dump() {
            dump_block(idx, block);
        }
    }

    opt_dce::run(s);
}
