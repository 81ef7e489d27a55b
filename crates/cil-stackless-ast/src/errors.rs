// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Error types for the reconstruction passes.
//!
//! Only two kinds exist. `AnalysisAborted` means the input is malformed or
//! unsupported and the current method cannot be analyzed at all; callers fall
//! back to a stack-based rendering of that one method. `PatternMismatch` is a
//! negative structural match inside the state-machine passes; it never leaves
//! the crate and is converted to "no match" at the reconstructor boundary.

use std::fmt;

/// Unrecoverable analysis failure for the current method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisAborted {
    /// Two control paths reached the same instruction with different stack depths.
    StackDepthMismatch { offset: u32 },
    /// The handler table references an offset that is not an instruction boundary.
    UnknownHandlerBoundary { offset: u32 },
    /// Two exception regions overlap without nesting.
    OverlappingRegions { first_start: u32, second_start: u32 },
    /// The caller cancelled the analysis; no partial result is produced.
    Cancelled,
}

impl fmt::Display for AnalysisAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisAborted::StackDepthMismatch { offset } => {
                write!(f, "inconsistent stack depth at offset {:#06x}", offset)
            }
            AnalysisAborted::UnknownHandlerBoundary { offset } => {
                write!(
                    f,
                    "handler table references unknown instruction boundary {:#06x}",
                    offset
                )
            }
            AnalysisAborted::OverlappingRegions {
                first_start,
                second_start,
            } => {
                write!(
                    f,
                    "exception regions starting at {:#06x} and {:#06x} overlap without nesting",
                    first_start, second_start
                )
            }
            AnalysisAborted::Cancelled => write!(f, "analysis cancelled"),
        }
    }
}

impl std::error::Error for AnalysisAborted {}

/// A structural expectation of the state-machine matchers was not met.
///
/// This is an expected outcome, not a defect: most methods are not state
/// machines. The reason string exists for `debug!` tracing only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMismatch(pub &'static str);

impl fmt::Display for PatternMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state machine pattern mismatch: {}", self.0)
    }
}

impl std::error::Error for PatternMismatch {}

/// Shorthand used by the matchers.
pub(crate) fn mismatch<T>(reason: &'static str) -> Result<T, PatternMismatch> {
    Err(PatternMismatch(reason))
}
