// SPDX-License-Identifier: BSD-3-Clause
mod alloc;
pub use alloc::*;
pub mod analysis;
pub use analysis::{pointer, query, Diagnostic};
mod bitset;
pub use bitset::*;
pub mod cli;
pub mod ir;
mod klimited;
pub use klimited::*;
pub mod layers;
pub mod signatures;
pub use signatures::{AllocType, Signature, Signatures};
mod union;
pub use union::*;
