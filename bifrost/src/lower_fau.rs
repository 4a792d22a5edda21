// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! FAU operand lowering
//!
//! A tuple addresses a single 64-bit fast-access-uniform slot, and that slot
//! is mutually exclusive with embedded constants, so an instruction whose
//! sources span two slots or mix a slot with an inline constant could never
//! become schedulable.  This pre-pass keeps the first slot in place (or none,
//! when constants are present) and copies the other halves through scratch
//! registers scavenged from the dead part of the register file.

use crate::ir::{Dst, Instr, Op, RegMask, RegRef, Shader, Src, NUM_REGS};
use crate::liveness::{instr_liveness_update, Liveness};
use rustc_hash::FxHashMap;

fn scavenge(busy: &RegMask) -> RegRef {
    for r in 0..NUM_REGS {
        if !busy.contains(r) {
            return RegRef::new(r, 1);
        }
    }
    // Post-RA blocks never have the whole file live across an ALU op
    panic!("no scratch register for FAU lowering");
}

pub fn run(s: &mut Shader) {
    let liveness = Liveness::for_shader(s);

    for (idx, block) in s.blocks.iter_mut().enumerate() {
        // Per-instruction live-in, from one backward sweep
        let mut live = liveness.block_live_out[idx];
        let mut live_in = vec![RegMask::empty(); block.instrs.len()];
        for (ip, instr) in block.instrs.iter().enumerate().rev() {
            instr_liveness_update(instr, &mut live);
            live_in[ip] = live;
        }

        let old = std::mem::take(&mut block.instrs);
        let mut out = Vec::with_capacity(old.len());
        for (ip, mut instr) in old.into_iter().enumerate() {
            let first = instr.srcs.iter().find_map(|s| s.fau_slot());
            let has_const =
                instr.srcs.iter().any(|s| s.as_const().is_some());
            let fine = first.map_or(true, |keep| {
                !has_const
                    && instr
                        .srcs
                        .iter()
                        .all(|s| s.fau_slot().map_or(true, |f| f == keep))
            });
            if fine {
                out.push(instr);
                continue;
            }
            // When constants are present the FAU bank cannot be used at
            // all, so every uniform read goes through a copy
            let keep = if has_const { None } else { first };

            let mut busy = live_in[ip] | instr.writes();
            let mut scratch: FxHashMap<(u8, bool), RegRef> =
                FxHashMap::default();
            for src in instr.srcs.iter_mut() {
                let Src::Fau { slot, hi } = *src else {
                    continue;
                };
                if Some(slot) == keep {
                    continue;
                }
                let reg = *scratch.entry((slot, hi)).or_insert_with(|| {
                    let reg = scavenge(&busy);
                    busy.insert(reg);
                    let mut mov = Instr::new_boxed(Op::MovI32);
                    mov.srcs[0] = Src::Fau { slot, hi };
                    mov.dsts[0] = Dst::Reg(reg);
                    out.push(mov);
                    reg
                });
                *src = Src::Reg(reg);
            }
            out.push(instr);
        }
        block.instrs = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Block;
    use compiler::cfg::CFG;

    fn fau(slot: u8, hi: bool) -> Src {
        Src::Fau { slot, hi }
    }

    fn shader(instrs: Vec<Box<Instr>>) -> Shader {
        let mut block = Block::new();
        block.instrs = instrs;
        Shader {
            blocks: CFG::from_blocks_edges([block], []),
            is_blend: false,
        }
    }

    #[test]
    fn test_single_slot_untouched() {
        let mut add = Instr::new_boxed(Op::FaddF32);
        add.dsts[0] = Dst::Reg(RegRef::new(4, 1));
        add.srcs[0] = fau(3, false);
        add.srcs[1] = fau(3, true);

        let mut s = shader(vec![add]);
        run(&mut s);

        assert_eq!(s.blocks[0].instrs.len(), 1);
        assert_eq!(s.blocks[0].instrs[0].srcs[0], fau(3, false));
    }

    #[test]
    fn test_second_slot_copied() {
        let mut add = Instr::new_boxed(Op::FaddF32);
        add.dsts[0] = Dst::Reg(RegRef::new(4, 1));
        add.srcs[0] = fau(0, false);
        add.srcs[1] = fau(1, true);

        let mut s = shader(vec![add]);
        run(&mut s);

        let instrs = &s.blocks[0].instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].op, Op::MovI32);
        assert_eq!(instrs[0].srcs[0], fau(1, true));
        let scratch = *instrs[0].dsts[0].as_reg().unwrap();
        assert_eq!(instrs[1].srcs[0], fau(0, false));
        assert_eq!(instrs[1].srcs[1], Src::Reg(scratch));
    }

    #[test]
    fn test_scratch_avoids_live_registers() {
        // r0 is read later, so the copy must not clobber it
        let mut add = Instr::new_boxed(Op::FaddF32);
        add.dsts[0] = Dst::Reg(RegRef::new(4, 1));
        add.srcs[0] = fau(0, false);
        add.srcs[1] = fau(1, false);

        let mut user = Instr::new_boxed(Op::MovI32);
        user.dsts[0] = Dst::Reg(RegRef::new(5, 1));
        user.srcs[0] = Src::Reg(RegRef::new(0, 1));

        let mut s = shader(vec![add, user]);
        run(&mut s);

        let instrs = &s.blocks[0].instrs;
        assert_eq!(instrs.len(), 3);
        let scratch = instrs[0].dsts[0].as_reg().unwrap();
        assert_ne!(scratch.base(), 0);
        assert_ne!(scratch.base(), 4);
    }

    #[test]
    fn test_fau_mixed_with_constant_split() {
        // An embedded constant excludes the FAU bank from the tuple, so
        // the uniform read must go through a copy
        let mut add = Instr::new_boxed(Op::FaddF32);
        add.dsts[0] = Dst::Reg(RegRef::new(4, 1));
        add.srcs[0] = fau(0, false);
        add.srcs[1] = Src::Imm(0x3f80_0000);

        let mut s = shader(vec![add]);
        run(&mut s);

        let instrs = &s.blocks[0].instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].op, Op::MovI32);
        assert_eq!(instrs[0].srcs[0], fau(0, false));
        let scratch = *instrs[0].dsts[0].as_reg().unwrap();
        assert_eq!(instrs[1].srcs[0], Src::Reg(scratch));
        assert_eq!(instrs[1].srcs[1], Src::Imm(0x3f80_0000));
    }

    #[test]
    fn test_shared_scratch_for_same_half() {
        let mut mux = Instr::new_boxed(Op::MuxI32);
        mux.dsts[0] = Dst::Reg(RegRef::new(8, 1));
        mux.srcs[0] = fau(0, false);
        mux.srcs[1] = fau(2, true);
        mux.srcs[2] = fau(2, true);

        let mut s = shader(vec![mux]);
        run(&mut s);

        let instrs = &s.blocks[0].instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[1].srcs[1], instrs[1].srcs[2]);
    }
}
