// SPDX-License-Identifier: GPL-3.0-only

pub mod env;
pub mod geometry;

/// Stable identifier of a render node (screen or logical display).
pub type NodeId = u64;

/// Float comparison tolerance used by the scale math.
pub const EPSILON: f32 = 1e-6;
