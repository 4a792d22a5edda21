// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Post-scheduling dead code elimination
//!
//! Passthrough rewriting can leave results with no register-file readers,
//! most often spill moves whose every consumer now takes the forwarded
//! value.  This sweeps the scheduled clauses backwards and drops
//! side-effect-free instructions whose destinations are dead, keeping any
//! whose result still travels by passthrough.

use crate::ir::Shader;
use crate::liveness::{instr_liveness_update, Liveness};

pub fn run(s: &mut Shader) {
    let liveness = Liveness::for_shader(s);

    for (idx, block) in s.blocks.iter_mut().enumerate() {
        if !block.scheduled {
            continue;
        }

        let mut live = liveness.block_live_out[idx];
        for clause in block.clauses.iter_mut().rev() {
            for tuple in clause.tuples.iter_mut().rev() {
                // The ADD result retires after the FMA result
                for slot in [&mut tuple.add, &mut tuple.fma] {
                    let Some(instr) = slot else {
                        continue;
                    };
                    if instr.can_eliminate()
                        && !instr.forwarded
                        && !live.intersects(instr.writes())
                    {
                        *slot = None;
                    } else {
                        instr_liveness_update(instr, &mut live);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Dst, Instr, Op, RegRef, Src};
    use crate::sched::schedule_shader;
    use compiler::cfg::CFG;

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

    fn one_block_shader(instrs: Vec<Box<Instr>>) -> Shader {
        let mut block = Block::new();
        block.instrs = instrs;
        Shader {
            blocks: CFG::from_blocks_edges([block], []),
            is_blend: false,
        }
    }

    #[test]
    fn test_drops_dead_result() {
        let mut s = one_block_shader(vec![
            alu(Op::MovI32, 1, &[0]),
            alu(Op::FaddF32, 2, &[3, 4]),
            store(2, 5),
        ]);
        schedule_shader(&mut s);

        let ops: Vec<Op> = s.blocks[0].sched_instrs().map(|i| i.op).collect();
        assert!(!ops.contains(&Op::MovI32));
        assert!(ops.contains(&Op::FaddF32));
        assert!(ops.contains(&Op::Store));
    }

    #[test]
    fn test_keeps_forwarded_producer() {
        // r10 dies inside the clause but its value reaches the add through
        // a passthrough, so the producer must survive
        let mut s = one_block_shader(vec![
            alu(Op::FmaF32, 10, &[0, 1]),
            alu(Op::FaddF32, 20, &[10, 3]),
            store(20, 5),
        ]);
        schedule_shader(&mut s);

        let ops: Vec<Op> = s.blocks[0].sched_instrs().map(|i| i.op).collect();
        assert!(ops.contains(&Op::FmaF32));
        let fma = s.blocks[0]
            .sched_instrs()
            .find(|i| i.op == Op::FmaF32)
            .unwrap();
        assert!(fma.forwarded);
    }

    #[test]
    fn test_message_never_dropped() {
        // A load with a dead destination still has its side effect
        let mut ld = Instr::new_boxed(Op::Load);
        ld.dsts[0] = Dst::Reg(RegRef::new(8, 1));
        ld.srcs[1] = Src::Reg(RegRef::new(0, 1));

        let mut s = one_block_shader(vec![ld]);
        schedule_shader(&mut s);

        let ops: Vec<Op> = s.blocks[0].sched_instrs().map(|i| i.op).collect();
        assert_eq!(ops, &[Op::Load]);
    }
}
