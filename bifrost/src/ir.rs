// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Post-RA Bifrost IR
//!
//! This is the scheduler's view of the program: flat lists of instructions
//! per block, with real register numbers already assigned, getting packed
//! into clauses of tuples.  The front-end and the binary clause encoder live
//! elsewhere; everything here is in-memory only.

use compiler::cfg::CFG;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// The register file has 64 32-bit registers
pub const NUM_REGS: u32 = 64;

/// A reference to one or more consecutive registers
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegRef {
    base: u8,
    comps: u8,
}

impl RegRef {
    pub fn new(base: u32, comps: u8) -> RegRef {
        assert!(base + u32::from(comps) <= NUM_REGS);
        assert!(comps >= 1);
        RegRef {
            base: base.try_into().unwrap(),
            comps,
        }
    }

    pub fn base(&self) -> u32 {
        self.base.into()
    }

    pub fn comps(&self) -> u8 {
        self.comps
    }

    pub fn mask(&self) -> RegMask {
        let bits = if self.comps >= 64 {
            u64::MAX
        } else {
            ((1_u64 << self.comps) - 1) << self.base
        };
        RegMask(bits)
    }

    pub fn overlaps(&self, other: &RegRef) -> bool {
        !(self.mask() & other.mask()).is_empty()
    }
}

impl fmt::Debug for RegRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.comps == 1 {
            write!(f, "r{}", self.base)
        } else {
            write!(f, "r{}..r{}", self.base, self.base + self.comps - 1)
        }
    }
}

/// A set of registers, as a 64-bit mask
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RegMask(pub u64);

impl RegMask {
    pub fn empty() -> RegMask {
        RegMask(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, reg: u32) -> bool {
        debug_assert!(reg < NUM_REGS);
        self.0 & (1_u64 << reg) != 0
    }

    pub fn intersects(&self, other: RegMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn insert(&mut self, reg: RegRef) {
        self.0 |= reg.mask().0;
    }

    pub fn remove(&mut self, reg: RegRef) {
        self.0 &= !reg.mask().0;
    }
}

impl BitOr for RegMask {
    type Output = RegMask;

    fn bitor(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for RegMask {
    fn bitor_assign(&mut self, rhs: RegMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RegMask {
    type Output = RegMask;

    fn bitand(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 & rhs.0)
    }
}

impl Not for RegMask {
    type Output = RegMask;

    fn not(self) -> RegMask {
        RegMask(!self.0)
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegMask({:#018x})", self.0)
    }
}

/// An instruction source operand
///
/// The first five forms exist before scheduling.  The remaining forms are
/// assigned by the scheduler when it commits a tuple: FAU and constant reads
/// become indexed passthrough references, and values produced in the same or
/// the preceding tuple are forwarded without touching the register file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Src {
    None,
    Reg(RegRef),
    /// 32-bit inline constant
    Imm(u32),
    /// PC-relative 32-bit constant (branch offsets)
    PcRel(u32),
    /// Fast-access-uniform reference: a 64-bit slot and which half
    Fau { slot: u8, hi: bool },
    /// Committed read of the tuple's FAU slot
    FauPass { hi: bool },
    /// Read of a merged clause constant: 64-bit word index and half
    ConstPass { word: u8, hi: bool },
    /// Hardware zero, free on the FMA unit
    Zero,
    /// Result of the FMA slot, same or previous tuple
    PassFma,
    /// Result of the ADD slot of the previous tuple
    PassAdd,
}

impl Src {
    pub fn as_reg(&self) -> Option<&RegRef> {
        match self {
            Src::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    /// The (value, pcrel) pair this source asks the constant table for
    pub fn as_const(&self) -> Option<(u32, bool)> {
        match self {
            Src::Imm(v) => Some((*v, false)),
            Src::PcRel(v) => Some((*v, true)),
            _ => None,
        }
    }

    pub fn fau_slot(&self) -> Option<u8> {
        match self {
            Src::Fau { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}

/// An instruction destination
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dst {
    None,
    Reg(RegRef),
}

impl Dst {
    pub fn as_reg(&self) -> Option<&RegRef> {
        match self {
            Dst::Reg(reg) => Some(reg),
            Dst::None => None,
        }
    }
}

/// Execution unit eligibility
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Unit {
    Fma,
    Add,
    Either,
}

/// Fixed-function unit a message-passing instruction talks to
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessageType {
    Vary,
    Attribute,
    Tex,
    Load,
    Store,
    Atomic,
    Barrier,
    Blend,
    Tile,
    ZStencil,
    Atest,
}

/// Static per-opcode properties consumed by the scheduler
#[derive(Clone, Copy)]
pub struct OpProps {
    pub unit: Unit,
    pub message: Option<MessageType>,
    /// Must be the last instruction in its clause
    pub last: bool,
    /// Reads a staging register range through srcs\[0\]
    pub sr_read: bool,
    /// Writes a staging register range through dsts\[0\]
    pub sr_write: bool,
    /// Has a PC-relative branch offset operand
    pub branch_offset: bool,
    /// Floating-point op subject to the clause flush-to-zero mode
    pub fp: bool,
    /// Pseudo instruction which must be lowered during scheduling
    pub pseudo: bool,
}

impl OpProps {
    const fn alu(unit: Unit) -> OpProps {
        OpProps {
            unit,
            message: None,
            last: false,
            sr_read: false,
            sr_write: false,
            branch_offset: false,
            fp: false,
            pseudo: false,
        }
    }

    const fn fp(unit: Unit) -> OpProps {
        OpProps {
            fp: true,
            ..OpProps::alu(unit)
        }
    }

    const fn msg(message: MessageType, sr_read: bool, sr_write: bool) -> OpProps {
        OpProps {
            unit: Unit::Add,
            message: Some(message),
            sr_read,
            sr_write,
            ..OpProps::alu(Unit::Add)
        }
    }
}

/// Condition evaluated by MUX.i32
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MuxCond {
    #[default]
    Neg,
    IntZero,
    FpZero,
    Bit,
}

/// Atomic operation selector
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AtomOp {
    #[default]
    Add,
    Min,
    Max,
    And,
    Or,
    Xor,
    Xchg,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Op {
    // FMA-only ALU
    FmaF32,
    MulF32,
    IaddcI32,
    CselI32,

    // Dual-unit ALU
    FaddF32,
    FminF32,
    MovI32,
    ClzU32,
    LshiftI32,

    // ADD-only ALU
    IaddU32,
    MuxI32,
    Discard,

    // Message-passing
    LdVar,
    TexSingle,
    Load,
    Store,
    Atest,
    ZsEmit,
    Blend,
    LdTile,
    StTile,
    AtomCx,
    Barrier,

    // Control flow
    Jump,
    Branchz,

    // Pseudo instructions, lowered by the scheduler
    Cubeface,
    AtomRetI32,
    SegAddI64,

    // Hardware forms produced by pseudo lowering
    Cubeface1,
    Cubeface2,
    AtomC,
    SegAdd,
    DtselImm,
}

impl Op {
    pub fn props(&self) -> OpProps {
        match self {
            Op::FmaF32 | Op::MulF32 => OpProps::fp(Unit::Fma),
            Op::IaddcI32 | Op::CselI32 => OpProps::alu(Unit::Fma),

            Op::FaddF32 | Op::FminF32 => OpProps::fp(Unit::Either),
            Op::MovI32 | Op::ClzU32 | Op::LshiftI32 => {
                OpProps::alu(Unit::Either)
            }

            Op::IaddU32 | Op::MuxI32 | Op::Discard => OpProps::alu(Unit::Add),

            Op::LdVar => OpProps::msg(MessageType::Vary, false, true),
            Op::TexSingle => OpProps::msg(MessageType::Tex, true, true),
            Op::Load => OpProps::msg(MessageType::Load, false, true),
            Op::Store => OpProps::msg(MessageType::Store, true, false),
            Op::Atest => OpProps::msg(MessageType::Atest, true, false),
            Op::ZsEmit => OpProps::msg(MessageType::ZStencil, true, false),
            Op::Blend => OpProps::msg(MessageType::Blend, true, false),
            Op::LdTile => OpProps::msg(MessageType::Tile, false, true),
            Op::StTile => OpProps::msg(MessageType::Tile, true, false),
            Op::AtomCx => OpProps::msg(MessageType::Atomic, true, true),
            Op::Barrier => OpProps::msg(MessageType::Barrier, false, false),

            Op::Jump | Op::Branchz => OpProps {
                last: true,
                branch_offset: true,
                ..OpProps::alu(Unit::Add)
            },

            Op::Cubeface => OpProps {
                pseudo: true,
                ..OpProps::alu(Unit::Add)
            },
            Op::AtomRetI32 => OpProps {
                pseudo: true,
                ..OpProps::msg(MessageType::Atomic, true, true)
            },
            Op::SegAddI64 => OpProps {
                pseudo: true,
                ..OpProps::alu(Unit::Add)
            },

            Op::Cubeface1 => OpProps::alu(Unit::Fma),
            Op::Cubeface2 => OpProps::alu(Unit::Add),
            Op::AtomC => OpProps::alu(Unit::Fma),
            Op::SegAdd => OpProps::alu(Unit::Either),
            Op::DtselImm => OpProps::alu(Unit::Fma),
        }
    }

    /// Full scheduling fence: nothing may move across this opcode
    pub fn is_sched_barrier(&self) -> bool {
        matches!(self, Op::Barrier | Op::Discard)
    }
}

/// Whether `op`'s source at `src_idx` supports passthrough reads
///
/// Some operand positions must be read from the register file: PC-relative
/// branch offsets, texture descriptor selects, blend descriptors, and memory
/// address halves have fixed encodings with no passthrough muxsel.
pub fn src_reads_passthrough(op: Op, src_idx: usize) -> bool {
    match op {
        Op::Jump => false,
        Op::Branchz => src_idx == 0,
        Op::TexSingle => src_idx != 1,
        Op::Blend => src_idx != 2,
        Op::Store | Op::StTile => src_idx == 0,
        Op::DtselImm => false,
        _ => true,
    }
}

pub const MAX_SRCS: usize = 4;
pub const MAX_DSTS: usize = 2;

/// One machine instruction
#[derive(Clone, Debug)]
pub struct Instr {
    pub op: Op,
    pub srcs: [Src; MAX_SRCS],
    pub dsts: [Dst; MAX_DSTS],

    /// Flush-to-zero numerics required (fp ops only)
    pub ftz: bool,
    pub saturate: bool,
    /// Condition for MUX.i32
    pub mux: MuxCond,
    /// Atomic operation for ATOM_RETURN/ATOM_C
    pub atom_op: AtomOp,
    /// Texture descriptor must be selected through DTSEL_IMM first
    pub table: bool,

    /// Set by the scheduler when this result is consumed through a
    /// passthrough; such an instruction must keep its slot even if the
    /// destination register itself goes dead.
    pub forwarded: bool,
}

impl Instr {
    pub fn new(op: Op) -> Instr {
        Instr {
            op,
            srcs: [Src::None; MAX_SRCS],
            dsts: [Dst::None; MAX_DSTS],
            ftz: false,
            saturate: false,
            mux: MuxCond::default(),
            atom_op: AtomOp::default(),
            table: false,
            forwarded: false,
        }
    }

    pub fn new_boxed(op: Op) -> Box<Instr> {
        Box::new(Instr::new(op))
    }

    pub fn srcs(&self) -> &[Src] {
        &self.srcs
    }

    pub fn dsts(&self) -> &[Dst] {
        &self.dsts
    }

    /// Registers read through the register file
    pub fn reads(&self) -> RegMask {
        let mut mask = RegMask::empty();
        for src in self.srcs() {
            if let Some(reg) = src.as_reg() {
                mask.insert(*reg);
            }
        }
        mask
    }

    /// Registers written
    pub fn writes(&self) -> RegMask {
        let mut mask = RegMask::empty();
        for dst in self.dsts() {
            if let Some(reg) = dst.as_reg() {
                mask.insert(*reg);
            }
        }
        mask
    }

    pub fn message(&self) -> Option<MessageType> {
        self.op.props().message
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.op, Op::Jump | Op::Branchz)
    }

    /// IADD.u32 can be rewritten to IADDC.i32 with a zero carry-in
    pub fn can_iaddc(&self) -> bool {
        self.op == Op::IaddU32 && !self.saturate
    }

    /// MUX.i32 with an integer-zero condition is CSEL.i32
    pub fn can_csel(&self) -> bool {
        self.op == Op::MuxI32 && self.mux == MuxCond::IntZero
    }

    pub fn can_fma(&self) -> bool {
        match self.op.props().unit {
            Unit::Fma | Unit::Either => true,
            Unit::Add => self.can_iaddc() || self.can_csel(),
        }
    }

    pub fn can_add(&self) -> bool {
        matches!(self.op.props().unit, Unit::Add | Unit::Either)
    }

    pub fn must_last(&self) -> bool {
        self.op.props().last
    }

    /// Instructions writing a staging range, or with two destinations,
    /// cannot occupy the last tuple of a clause (it has a single register
    /// write port).
    pub fn must_not_last(&self) -> bool {
        self.op.props().sr_write
            || self.dsts.iter().filter(|d| d.as_reg().is_some()).count() > 1
    }

    /// Safe to delete when no destination is live
    pub fn can_eliminate(&self) -> bool {
        self.message().is_none()
            && !self.is_branch()
            && !self.op.is_sched_barrier()
            && self.dsts.iter().any(|d| d.as_reg().is_some())
    }

    /// The staging register range this instruction reads, if any
    pub fn sr_read_ref(&self) -> Option<&RegRef> {
        if self.op.props().sr_read {
            self.srcs[0].as_reg()
        } else {
            None
        }
    }

    /// The staging register range this instruction writes, if any
    pub fn sr_write_ref(&self) -> Option<&RegRef> {
        if self.op.props().sr_write {
            self.dsts[0].as_reg()
        } else {
            None
        }
    }
}

/// A pair of co-issued instructions, the smallest schedulable unit
#[derive(Default)]
pub struct Tuple {
    pub fma: Option<Box<Instr>>,
    pub add: Option<Box<Instr>>,
}

impl Tuple {
    pub fn is_empty(&self) -> bool {
        self.fma.is_none() && self.add.is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instr> {
        self.fma
            .iter()
            .chain(self.add.iter())
            .map(|instr| instr.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Instr> {
        self.fma
            .iter_mut()
            .chain(self.add.iter_mut())
            .map(|instr| instr.as_mut())
    }
}

/// Clause-wide flush-to-zero mode
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FtzState {
    #[default]
    None,
    Enable,
    Disable,
}

/// Flow control for the transition to the next clause
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FlowControl {
    #[default]
    NotBackToBack,
    /// The CFG provably reconverges after this clause
    Reconverge,
}

/// A group of up to 8 tuples sharing a constant table and at most one
/// message-passing instruction
pub struct Clause {
    pub tuples: Vec<Tuple>,
    /// Merged 64-bit constant words
    pub constants: Vec<u64>,
    pub message: Option<MessageType>,
    /// Hardware scoreboard slots this clause waits on
    pub dependencies: u8,
    pub flow: FlowControl,
    pub next_clause_prefetch: bool,
    pub ftz: FtzState,
}

impl Clause {
    pub fn instrs(&self) -> impl Iterator<Item = &Instr> {
        self.tuples.iter().flat_map(|t| t.iter())
    }
}

pub struct Block {
    /// Pre-scheduling instruction list, drained into clauses when the
    /// block is scheduled
    pub instrs: Vec<Box<Instr>>,
    pub clauses: Vec<Clause>,
    /// CFG-level reconvergence predicate, supplied by the caller
    pub reconverge_after: bool,
    pub scheduled: bool,
}

impl Block {
    pub fn new() -> Block {
        Block {
            instrs: Vec::new(),
            clauses: Vec::new(),
            reconverge_after: false,
            scheduled: false,
        }
    }

    /// Final program order of the scheduled block
    pub fn sched_instrs(&self) -> impl Iterator<Item = &Instr> {
        self.clauses.iter().flat_map(|c| c.instrs())
    }
}

impl Default for Block {
    fn default() -> Block {
        Block::new()
    }
}

pub struct Shader {
    pub blocks: CFG<Block>,
    pub is_blend: bool,
}
