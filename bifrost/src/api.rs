// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

use std::env;
use std::sync::OnceLock;

#[derive(Clone, Copy, Default)]
pub struct DebugFlags {
    flags: u32,
}

const DEBUG_INORDER: u32 = 1 << 0;
const DEBUG_VERIFY: u32 = 1 << 1;
const DEBUG_DUMP: u32 = 1 << 2;

impl DebugFlags {
    fn parse() -> DebugFlags {
        let mut flags = 0;
        if let Ok(s) = env::var("BIFROST_DEBUG") {
            for flag in s.split(',') {
                match flag.trim() {
                    "inorder" => flags |= DEBUG_INORDER,
                    "verify" => flags |= DEBUG_VERIFY,
                    "dump" => flags |= DEBUG_DUMP,
                    "" => (),
                    unk => eprintln!("Unknown BIFROST_DEBUG flag: {unk}"),
                }
            }
        }
        DebugFlags { flags }
    }
}

pub struct Debug {
    flags: OnceLock<DebugFlags>,
}

impl Debug {
    fn flags(&self) -> u32 {
        self.flags.get_or_init(DebugFlags::parse).flags
    }
}

pub trait GetDebugFlags {
    fn debug_flags(&self) -> u32;

    /// Schedule with a total dependency order, preserving the input
    /// instruction order exactly.
    fn inorder(&self) -> bool {
        self.debug_flags() & DEBUG_INORDER != 0
    }

    /// Validate clause invariants after scheduling each block, even in
    /// release builds.
    fn verify(&self) -> bool {
        self.debug_flags() & DEBUG_VERIFY != 0
    }

    /// Dump scheduled clauses to stderr.
    fn dump(&self) -> bool {
        self.debug_flags() & DEBUG_DUMP != 0
    }
}

impl GetDebugFlags for Debug {
    fn debug_flags(&self) -> u32 {
        self.flags()
    }
}

pub static DEBUG: Debug = Debug {
    flags: OnceLock::new(),
};
