// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Clause scheduler for a Bifrost-style dual-issue GPU ISA
//!
//! Takes register-allocated per-block instruction lists and packs them into
//! clauses of FMA+ADD tuples, honoring the hardware's register port,
//! constant table, passthrough and message constraints.  The output feeds a
//! downstream binary encoder.

mod api;
pub mod ir;
pub mod liveness;
pub mod lower_fau;
pub mod opt_dce;
pub mod sched;
pub mod sched_consts;
pub mod sched_deps;

#[cfg(test)]
mod ir_tests;

pub use api::{GetDebugFlags, DEBUG};
pub use sched::schedule_shader;
