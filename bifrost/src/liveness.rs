// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Post-RA register liveness
//!
//! With real register numbers assigned, liveness is a plain backward
//! fixed-point over 64-bit masks.  The scheduler consumes per-block live-out
//! masks and refines them instruction by instruction as it walks backwards.

use crate::ir::{Block, Instr, RegMask, Shader};
use compiler::dataflow::BackwardDataflow;

/// Standard kill-then-gen update, one instruction, walking backwards
pub fn instr_liveness_update(instr: &Instr, live: &mut RegMask) {
    *live = (*live & !instr.writes()) | instr.reads();
}

fn block_transfer(block: &Block, live_in: &mut RegMask, live_out: &RegMask) -> bool {
    let mut live = *live_out;
    if block.scheduled {
        let instrs: Vec<_> = block.sched_instrs().collect();
        for instr in instrs.iter().rev() {
            instr_liveness_update(instr, &mut live);
        }
    } else {
        for instr in block.instrs.iter().rev() {
            instr_liveness_update(instr, &mut live);
        }
    }
    let changed = live != *live_in;
    *live_in = live;
    changed
}

pub struct Liveness {
    pub block_live_in: Vec<RegMask>,
    pub block_live_out: Vec<RegMask>,
}

impl Liveness {
    pub fn for_shader(s: &Shader) -> Liveness {
        let num_blocks = s.blocks.len();
        let mut block_live_in = vec![RegMask::empty(); num_blocks];
        let mut block_live_out = vec![RegMask::empty(); num_blocks];

        BackwardDataflow {
            cfg: &s.blocks,
            block_in: &mut block_live_in[..],
            block_out: &mut block_live_out[..],
            transfer: |_idx, block, live_in, live_out| {
                block_transfer(block, live_in, live_out)
            },
            join: |live_out: &mut RegMask, succ_live_in: &RegMask| {
                *live_out |= *succ_live_in;
            },
        }
        .solve();

        Liveness {
            block_live_in,
            block_live_out,
        }
    }
}
