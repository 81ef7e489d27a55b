// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Caller-supplied configuration for a reconstruction run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructOptions {
    /// Rewrite recognized async continuation state machines into linear
    /// bodies with explicit suspend points.
    pub async_reconstruction: bool,
    /// Rewrite recognized sequence-generator state machines into linear
    /// bodies with explicit produce/stop points.
    pub iterator_reconstruction: bool,
    /// Synthesize a named exception variable for catch clauses even when the
    /// caught value is unused, unless the caught type is the universal base
    /// exception type.
    pub always_name_exception_variable: bool,
    /// Split declared local slots into independent variables where provably
    /// safe. Off forces one variable per slot.
    pub expand_local_slots: bool,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        Self {
            async_reconstruction: true,
            iterator_reconstruction: true,
            always_name_exception_variable: false,
            expand_local_slots: true,
        }
    }
}
