// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Shared structural matching for compiler-generated state machines.
//!
//! The async and iterator reconstructors both start from the same two
//! creation shapes: a stub method that constructs a state-holder object and
//! immediately starts it (async), or constructs one, copies its parameters
//! into fields and returns it (iterator). The matchers here extract a
//! [`StateMachineDescriptor`]; "no match" is a normal value, not an error.

pub mod async_rewrite;
pub mod iterator_rewrite;
pub mod state_range;

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::ast::{visit_exprs_mut, AstNode, BuiltBody, Expr, LabelTable, VarId, VariableOrigin, VariableTable};
use crate::context::AnalysisContext;
use crate::errors::{AnalysisAborted, PatternMismatch};
use crate::instruction::{MethodBody, OpCode, Operand};
use crate::metadata::{FieldRef, MethodRef, TypeRef};
use crate::options::ReconstructOptions;
use crate::temp_inlining;

/// Classification of an async method by its builder type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AsyncMethodKind {
    /// Fire-and-forget; the stub returns nothing.
    NoResult,
    /// The stub returns a task with no result value.
    Task,
    /// The stub returns a task carrying a result.
    TaskOfResult,
}

/// Everything the reconstructors know about one recognized state-holder
/// type.
#[derive(Debug, Clone, Serialize)]
pub struct StateMachineDescriptor {
    pub state_type: TypeRef,
    pub state_field: FieldRef,
    /// Async only: the builder field and method classification.
    pub builder_field: Option<FieldRef>,
    pub kind: Option<AsyncMethodKind>,
    /// Iterator only: the field holding the produced value.
    pub current_field: Option<FieldRef>,
    /// State-holder fields that merely forward original parameters.
    pub field_to_parameter: BTreeMap<FieldRef, VarId>,
}

/// Internal error plumbing of the reconstructors: either a negative match or
/// a genuine abort that must escape.
#[derive(Debug)]
pub(crate) enum RewriteError {
    Mismatch(PatternMismatch),
    Aborted(AnalysisAborted),
}

impl From<PatternMismatch> for RewriteError {
    fn from(e: PatternMismatch) -> Self {
        RewriteError::Mismatch(e)
    }
}

impl From<AnalysisAborted> for RewriteError {
    fn from(e: AnalysisAborted) -> Self {
        RewriteError::Aborted(e)
    }
}

/// Convert a rewrite outcome into the non-fatal contract of the
/// reconstructor entry points: structural mismatches (and nested bodies that
/// fail to analyze) mean "not a state machine after all"; only cancellation
/// propagates.
pub(crate) fn negative_on_mismatch<T>(
    result: Result<T, RewriteError>,
    pass: &str,
) -> Result<Option<T>, AnalysisAborted> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(RewriteError::Aborted(AnalysisAborted::Cancelled)) => Err(AnalysisAborted::Cancelled),
        Err(RewriteError::Mismatch(m)) => {
            debug!("[{}] no match: {}", pass, m.0);
            Ok(None)
        }
        Err(RewriteError::Aborted(e)) => {
            debug!("[{}] no match: nested body analysis failed: {}", pass, e);
            Ok(None)
        }
    }
}

/// Build and clean a nested method body (resume, dispose, accessor) with the
/// shared tables.
pub(crate) fn build_nested(
    ctx: &mut AnalysisContext,
    body: &MethodBody,
    options: &ReconstructOptions,
    vars: &mut VariableTable,
    labels: &mut LabelTable,
) -> Result<BuiltBody, RewriteError> {
    let mut built = ctx.build_body(body, options, vars, labels)?;
    built.nodes = temp_inlining::inline_single_use_temps(built.nodes, vars);
    Ok(built)
}

/// The statements of a stub body, which must be region-free and linear.
pub(crate) fn linear_statements(nodes: &[AstNode]) -> Option<Vec<&Expr>> {
    let mut out = Vec::with_capacity(nodes.len());
    for n in nodes {
        match n {
            AstNode::Expr(e) => out.push(e),
            AstNode::Label(_) => return None,
            AstNode::Try(_) => return None,
        }
    }
    Some(out)
}

/// `store obj.field := value` when the target is the given variable.
pub(crate) fn store_field_on<'a>(e: &'a Expr, obj: VarId) -> Option<(&'a FieldRef, &'a Expr)> {
    if e.opcode != OpCode::StoreField || e.args.len() != 2 || !e.args[0].loads_var(obj) {
        return None;
    }
    Some((e.operand.as_field()?, &e.args[1]))
}

/// `load obj.field` when the target is the given variable.
pub(crate) fn load_field_on<'a>(e: &'a Expr, obj: VarId) -> Option<&'a FieldRef> {
    if !matches!(e.opcode, OpCode::LoadField | OpCode::LoadFieldAddress)
        || e.args.len() != 1
        || !e.args[0].loads_var(obj)
    {
        return None;
    }
    e.operand.as_field()
}

/// `store obj.state := k` for the known state field.
pub(crate) fn match_state_assignment(e: &Expr, obj: VarId, state_field: &FieldRef) -> Option<i64> {
    let (f, value) = store_field_on(e, obj)?;
    (f == state_field).then(|| value.as_i32().map(i64::from)).flatten()
}

/// A call expression with its callee and arguments.
pub(crate) fn match_call<'a>(e: &'a Expr) -> Option<(&'a MethodRef, &'a [Expr])> {
    if !matches!(e.opcode, OpCode::Call | OpCode::CallVirtual) {
        return None;
    }
    Some((e.operand.as_method()?, e.args.as_slice()))
}

/// A load of a parameter of the enclosing method, possibly wrapped in a
/// runtime boxing helper; returns the parameter variable.
pub(crate) fn parameter_value(e: &Expr, vars: &VariableTable) -> Option<VarId> {
    let var = match e.as_load_local() {
        Some(v) => v,
        None => {
            // Some compilers wrap forwarded parameters in a value helper.
            let (m, args) = match_call(e)?;
            if m.name != "GetObjectValue" || args.len() != 1 {
                return None;
            }
            args[0].as_load_local()?
        }
    };
    matches!(
        vars.origin(var),
        VariableOrigin::Parameter(_) | VariableOrigin::This
    )
    .then_some(var)
}

/// Field accesses on a forwarding accessor's result that merely copy an
/// already-mapped field inherit that field's parameter mapping. Covers the
/// one-hop forwarding compilers emit between the enumerable and enumerator
/// views of one generator object.
pub(crate) fn propagate_forwarded_fields(
    accessor: &BuiltBody,
    field_to_parameter: &mut BTreeMap<FieldRef, VarId>,
) {
    let this = match accessor.this_var {
        Some(v) => v,
        None => return,
    };
    let stmts = match linear_statements(&accessor.nodes) {
        Some(s) => s,
        None => {
            // Accessors with control flow still forward fields in their
            // straight-line prefix; walk expressions conservatively.
            let mut copies: Vec<(FieldRef, FieldRef)> = Vec::new();
            crate::ast::visit_exprs(&accessor.nodes, &mut |e| {
                if let Some((dst, value)) = store_field_on_any(e) {
                    if let Some(src) = load_field_on(value, this) {
                        copies.push((dst.clone(), src.clone()));
                    }
                }
            });
            for (dst, src) in copies {
                if let Some(&param) = field_to_parameter.get(&src) {
                    field_to_parameter.insert(dst, param);
                }
            }
            return;
        }
    };
    for e in stmts {
        if let Some((dst, value)) = store_field_on_any(e) {
            if let Some(src) = load_field_on(value, this) {
                if let Some(&param) = field_to_parameter.get(&src) {
                    field_to_parameter.insert(dst.clone(), param);
                }
            }
        }
    }
}

/// `store obj.field := value` for any object variable.
pub(crate) fn store_field_on_any<'a>(e: &'a Expr) -> Option<(&'a FieldRef, &'a Expr)> {
    if e.opcode != OpCode::StoreField || e.args.len() != 2 {
        return None;
    }
    e.args[0].as_load_local()?;
    Some((e.operand.as_field()?, &e.args[1]))
}

/// Redirect every state-holder field access through `this` to a parameter
/// (when the field forwards one) or to a synthesized local, so the rewritten
/// body no longer references the state-holder type.
/// The `field_locals` memo is shared by callers that translate several
/// bodies of one state machine, so every body sees the same local for the
/// same field.
pub(crate) fn translate_fields_to_locals(
    nodes: &mut [AstNode],
    this: VarId,
    field_to_parameter: &BTreeMap<FieldRef, VarId>,
    field_locals: &mut BTreeMap<FieldRef, VarId>,
    vars: &mut VariableTable,
) {
    visit_exprs_mut(nodes, &mut |e| {
        let field = match e.operand.as_field() {
            Some(f) => f.clone(),
            None => return,
        };
        let on_this = e.args.first().map(|a| a.loads_var(this)).unwrap_or(false);
        if !on_this {
            return;
        }
        let var = match field_to_parameter.get(&field) {
            Some(&p) => p,
            None => *field_locals
                .entry(field.clone())
                .or_insert_with(|| vars.alloc(&local_name_for(&field.name), VariableOrigin::Temporary)),
        };
        match e.opcode {
            OpCode::LoadField => {
                e.opcode = OpCode::LoadLocal;
                e.operand = Operand::Var(var);
                e.args.clear();
            }
            OpCode::LoadFieldAddress => {
                e.opcode = OpCode::LoadLocalAddress;
                e.operand = Operand::Var(var);
                e.args.clear();
            }
            OpCode::StoreField => {
                e.opcode = OpCode::StoreLocal;
                e.operand = Operand::Var(var);
                e.args.remove(0);
            }
            _ => {}
        }
    });
}

/// Derive a readable local name from a compiler-generated field name.
fn local_name_for(field_name: &str) -> String {
    let cleaned: String = field_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    let cleaned = cleaned.trim_start_matches('_').to_string();
    if cleaned.is_empty() {
        "field".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstNode;

    #[test]
    fn test_translate_redirects_parameter_fields() {
        let mut vars = VariableTable::new();
        let this = vars.alloc("this", VariableOrigin::This);
        let param = vars.alloc("x", VariableOrigin::Parameter(0));
        let ty = TypeRef::new("N", "SM");
        let fx = FieldRef::new(ty.clone(), "x");
        let fy = FieldRef::new(ty, "<y>5__1");

        let mut map = BTreeMap::new();
        map.insert(fx.clone(), param);

        let mut nodes = vec![
            AstNode::Expr(Expr::new(
                OpCode::LoadField,
                Operand::Field(fx),
                vec![Expr::load_var(this)],
            )),
            AstNode::Expr(Expr::new(
                OpCode::StoreField,
                Operand::Field(fy),
                vec![
                    Expr::load_var(this),
                    Expr::new(OpCode::LoadConstI32, Operand::I32(3), vec![]),
                ],
            )),
        ];

        let mut memo = BTreeMap::new();
        translate_fields_to_locals(&mut nodes, this, &map, &mut memo, &mut vars);

        let first = nodes[0].as_expr().unwrap();
        assert_eq!(first.opcode, OpCode::LoadLocal);
        assert_eq!(first.operand.as_var(), Some(param));
        assert!(first.args.is_empty());

        let second = nodes[1].as_expr().unwrap();
        assert_eq!(second.opcode, OpCode::StoreLocal);
        assert_eq!(second.args.len(), 1);
        let local = second.operand.as_var().unwrap();
        assert_eq!(vars.name(local), "y5__1");
    }

    #[test]
    fn test_field_access_on_other_object_untouched() {
        let mut vars = VariableTable::new();
        let this = vars.alloc("this", VariableOrigin::This);
        let other = vars.alloc("other", VariableOrigin::LocalSlot(0));
        let f = FieldRef::new(TypeRef::new("N", "SM"), "x");

        let mut nodes = vec![AstNode::Expr(Expr::new(
            OpCode::LoadField,
            Operand::Field(f),
            vec![Expr::load_var(other)],
        ))];
        translate_fields_to_locals(
            &mut nodes,
            this,
            &BTreeMap::new(),
            &mut BTreeMap::new(),
            &mut vars,
        );
        assert_eq!(nodes[0].as_expr().unwrap().opcode, OpCode::LoadField);
    }
}
