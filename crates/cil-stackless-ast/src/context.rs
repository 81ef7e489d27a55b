// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Reusable per-caller analysis state.
//!
//! A context owns the scratch collections the builder refills on every run
//! and the cooperative cancellation flag. Contexts are not shareable across
//! concurrent callers; each caller owns one for the duration of a
//! reconstruction and may reuse it for any number of sequential runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ast::{BuiltBody, LabelTable, VariableTable};
use crate::errors::AnalysisAborted;
use crate::instruction::MethodBody;
use crate::options::ReconstructOptions;
use crate::stack_to_var::AstBuilder;

/// Cooperative cancellation signal, polled once per worklist item inside the
/// dataflow fixpoint. Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Exclusively owned analysis state for one caller.
#[derive(Debug, Default)]
pub struct AnalysisContext {
    cancel: CancellationFlag,
    builder: AstBuilder,
}

impl AnalysisContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationFlag) -> Self {
        Self {
            cancel,
            builder: AstBuilder::default(),
        }
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    /// Run the stack-to-variable builder and region tree builder on one
    /// method body, allocating variables and labels from the given tables.
    pub fn build_body(
        &mut self,
        body: &MethodBody,
        options: &ReconstructOptions,
        vars: &mut VariableTable,
        labels: &mut LabelTable,
    ) -> Result<BuiltBody, AnalysisAborted> {
        let cancel = self.cancel.clone();
        self.builder.build(body, options, vars, labels, &cancel)
    }
}
