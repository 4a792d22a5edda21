// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Whole-pipeline scheduling tests

use crate::ir::{Block, Dst, Instr, Op, RegRef, Shader, Src};
use crate::liveness::Liveness;
use crate::sched::{schedule_shader, validate_block};
use compiler::cfg::CFGBuilder;
use rustc_hash::FxBuildHasher;

fn alu(op: Op, dst: u32, srcs: &[u32]) -> Box<Instr> {
    let mut instr = Instr::new_boxed(op);
    instr.dsts[0] = Dst::Reg(RegRef::new(dst, 1));
    for (i, &s) in srcs.iter().enumerate() {
        instr.srcs[i] = Src::Reg(RegRef::new(s, 1));
    }
    instr
}

fn store(data: u32, addr: u32) -> Box<Instr> {
    let mut instr = Instr::new_boxed(Op::Store);
    instr.srcs[0] = Src::Reg(RegRef::new(data, 1));
    instr.srcs[1] = Src::Reg(RegRef::new(addr, 1));
    instr
}

fn build_shader(blocks: Vec<Block>, edges: &[(usize, usize)]) -> Shader {
    let mut builder = CFGBuilder::<usize, Block, FxBuildHasher>::new();
    for (i, b) in blocks.into_iter().enumerate() {
        builder.add_node(i, b);
    }
    for &(a, b) in edges {
        builder.add_edge(a, b);
    }
    Shader {
        blocks: builder.as_cfg(),
        is_blend: false,
    }
}

/// Program order of every scheduled write, for dependency checks
fn write_order(block: &Block) -> Vec<u32> {
    block
        .sched_instrs()
        .filter_map(|i| i.dsts[0].as_reg())
        .map(|r| r.base())
        .collect()
}

#[test]
fn test_multi_block_pipeline() {
    let mut b0 = Block::new();
    b0.instrs.push(alu(Op::FaddF32, 2, &[0, 1]));
    b0.instrs.push(alu(Op::FaddF32, 3, &[2, 2]));
    let mut b1 = Block::new();
    b1.instrs.push(store(3, 5));

    let mut s = build_shader(vec![b0, b1], &[(0, 1)]);
    schedule_shader(&mut s);

    let l = Liveness::for_shader(&s);
    for (idx, node) in s.blocks.iter().enumerate() {
        assert!(node.scheduled);
        assert!(node.instrs.is_empty());
        validate_block(node, l.block_live_out[idx]);
    }

    // Data dependencies survive the reorder
    let order = write_order(&s.blocks[0]);
    let def2 = order.iter().position(|&r| r == 2).unwrap();
    let def3 = order.iter().position(|&r| r == 3).unwrap();
    assert!(def2 < def3);
    assert_eq!(s.blocks[1].sched_instrs().count(), 1);
}

#[test]
fn test_totality_long_chain() {
    // A serial chain long enough to spill across several clauses still
    // schedules every instruction exactly once
    let mut block = Block::new();
    for i in 0..40 {
        block.instrs.push(alu(Op::FaddF32, i + 1, &[i, i]));
    }
    block.instrs.push(store(40, 50));

    let mut s = build_shader(vec![block], &[]);
    schedule_shader(&mut s);

    let l = Liveness::for_shader(&s);
    let block = &s.blocks[0];
    validate_block(block, l.block_live_out[0]);
    assert_eq!(block.sched_instrs().count(), 41);

    let order = write_order(block);
    for defs in order.windows(2) {
        assert!(defs[0] < defs[1]);
    }
}

#[test]
fn test_fau_spanning_instruction_schedules() {
    let mut add = Instr::new_boxed(Op::FaddF32);
    add.dsts[0] = Dst::Reg(RegRef::new(10, 1));
    add.srcs[0] = Src::Fau { slot: 0, hi: false };
    add.srcs[1] = Src::Fau { slot: 1, hi: true };

    let mut block = Block::new();
    block.instrs.push(add);
    block.instrs.push(store(10, 3));

    let mut s = build_shader(vec![block], &[]);
    schedule_shader(&mut s);

    let l = Liveness::for_shader(&s);
    let block = &s.blocks[0];
    validate_block(block, l.block_live_out[0]);

    // No surviving instruction spans two FAU slots
    for instr in block.sched_instrs() {
        let slots: Vec<u8> =
            instr.srcs().iter().filter_map(|s| s.fau_slot()).collect();
        assert!(slots.windows(2).all(|w| w[0] == w[1]));
    }

    // A committed single-slot tuple reads the FAU bank by passthrough
    let add = block
        .sched_instrs()
        .find(|i| i.op == Op::FaddF32)
        .unwrap();
    assert!(add
        .srcs()
        .iter()
        .all(|s| !matches!(s, Src::Fau { .. })));
}

#[test]
fn test_immediates_share_constant_words() {
    let mut a = Instr::new_boxed(Op::IaddU32);
    a.dsts[0] = Dst::Reg(RegRef::new(1, 1));
    a.srcs[0] = Src::Reg(RegRef::new(0, 1));
    a.srcs[1] = Src::Imm(0x1000);
    let mut b = Instr::new_boxed(Op::IaddU32);
    b.dsts[0] = Dst::Reg(RegRef::new(2, 1));
    b.srcs[0] = Src::Reg(RegRef::new(0, 1));
    b.srcs[1] = Src::Imm(0x2000);

    let mut block = Block::new();
    block.instrs.push(a);
    block.instrs.push(b);
    block.instrs.push(alu(Op::FaddF32, 3, &[1, 2]));
    block.instrs.push(store(3, 5));

    let mut s = build_shader(vec![block], &[]);
    schedule_shader(&mut s);

    let l = Liveness::for_shader(&s);
    let block = &s.blocks[0];
    validate_block(block, l.block_live_out[0]);

    // Every immediate was resolved against its clause's table
    for clause in &block.clauses {
        for instr in clause.instrs() {
            for src in instr.srcs() {
                assert!(!matches!(src, Src::Imm(_)));
                if let Src::ConstPass { word, .. } = src {
                    assert!(usize::from(*word) < clause.constants.len());
                }
            }
        }
    }
}

#[test]
fn test_branch_terminates_block() {
    let mut branch = Instr::new_boxed(Op::Branchz);
    branch.srcs[0] = Src::Reg(RegRef::new(6, 1));
    branch.srcs[1] = Src::PcRel(0x80);

    let mut b0 = Block::new();
    b0.instrs.push(alu(Op::FaddF32, 6, &[0, 1]));
    b0.instrs.push(alu(Op::MovI32, 7, &[2]));
    b0.instrs.push(branch);
    let mut b1 = Block::new();
    b1.instrs.push(store(7, 5));
    let mut b2 = Block::new();
    b2.instrs.push(store(6, 5));

    let mut s = build_shader(vec![b0, b1, b2], &[(0, 1), (0, 2), (1, 2)]);
    schedule_shader(&mut s);

    let l = Liveness::for_shader(&s);
    let b0 = &s.blocks[0];
    validate_block(b0, l.block_live_out[0]);
    let ops: Vec<Op> = b0.sched_instrs().map(|i| i.op).collect();
    assert_eq!(*ops.last().unwrap(), Op::Branchz);

    // Conditional branches keep next-clause prefetch enabled
    assert!(b0.clauses.last().unwrap().next_clause_prefetch);
}
