// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Reconstruction of variable-based ASTs from stack-based CIL method bodies.
//!
//! The pipeline runs strictly downward: a worklist dataflow fixpoint
//! replaces evaluation-stack slots and declared local slots with explicit
//! variables ([`stack_to_var`]), the raw handler table is carved into nested
//! try regions ([`region_tree`]), and two optional structural passes detect
//! compiler-generated async continuations and sequence generators and
//! rewrite their state-transition bodies back into linear control flow with
//! explicit suspend, produce and stop points ([`state_machine`]).
//!
//! Analysis is synchronous and works on one fully materialized method body
//! at a time. Callers own one [`AnalysisContext`] per thread of work and may
//! reuse it across sequential calls; cancellation is cooperative through the
//! context's [`CancellationFlag`].

mod ast;
mod context;
mod errors;
mod instruction;
mod metadata;
mod options;
mod region_tree;
mod stack_to_var;
mod state_machine;
mod temp_inlining;

pub use ast::{
    AstNode, BuiltBody, CatchClause, Expr, LabelId, LabelTable, MethodAst, TryRegion, VarId,
    Variable, VariableOrigin, VariableTable,
};
pub use context::{AnalysisContext, CancellationFlag};
pub use errors::AnalysisAborted;
pub use instruction::{
    HandlerKind, HandlerSpec, InstrId, Instruction, MethodBody, OpCode, Operand, ParamSpec,
    PopBehavior,
};
pub use metadata::{FieldRef, MetadataProvider, MethodRef, ModuleIndex, TypeRef, TypeShape};
pub use options::ReconstructOptions;
pub use state_machine::{state_range::StateRange, AsyncMethodKind, StateMachineDescriptor};

use log::debug;

/// Reconstruct one method body into a variable-based AST.
///
/// The builder and region tree always run; the state-machine passes run when
/// enabled and silently keep the unreconstructed body on a negative match.
/// [`AnalysisAborted`] is unrecoverable for this one method; callers are
/// expected to fall back to a stack-based rendering of it without failing
/// the whole run.
pub fn reconstruct_method(
    ctx: &mut AnalysisContext,
    provider: &dyn MetadataProvider,
    body: &MethodBody,
    options: &ReconstructOptions,
) -> Result<MethodAst, AnalysisAborted> {
    let mut vars = VariableTable::new();
    let mut labels = LabelTable::new();

    let mut built = ctx.build_body(body, options, &mut vars, &mut labels)?;
    built.nodes = temp_inlining::inline_single_use_temps(built.nodes, &vars);

    if options.async_reconstruction {
        if let Some(rewritten) = state_machine::async_rewrite::try_reconstruct(
            ctx, provider, &built, options, &mut vars, &mut labels,
        )? {
            debug!("[reconstruct] async continuation reconstructed");
            return Ok(assemble(rewritten, vars, labels));
        }
    }
    if options.iterator_reconstruction {
        if let Some(rewritten) = state_machine::iterator_rewrite::try_reconstruct(
            ctx, provider, &built, options, &mut vars, &mut labels,
        )? {
            debug!("[reconstruct] sequence generator reconstructed");
            return Ok(assemble(rewritten, vars, labels));
        }
    }

    Ok(assemble(built, vars, labels))
}

fn assemble(built: BuiltBody, variables: VariableTable, labels: LabelTable) -> MethodAst {
    MethodAst {
        nodes: built.nodes,
        parameters: built.parameters,
        this_var: built.this_var,
        variables,
        labels,
    }
}
