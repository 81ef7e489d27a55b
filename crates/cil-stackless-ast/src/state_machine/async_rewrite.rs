// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Async continuation reconstruction.
//!
//! A method compiled from async source is reduced to a stub that constructs
//! a compiler-generated continuation object and starts it through a builder.
//! This pass recognizes that stub, analyzes the continuation's resume method
//! and rewrites it into a linear body with explicit suspend points, so the
//! state-holder type disappears from the output entirely.
//!
//! The transform is only attempted when the resume method carries the
//! compiler's standard exception-forwarding scaffold: one guarded region
//! whose sole catch-all handler stores the final state, forwards the error
//! to the builder's fail entry point and leaves to a single exit label. Any
//! deviation abandons the reconstruction and the original body is kept.

use std::collections::BTreeMap;

use log::debug;

use crate::ast::{AstNode, BuiltBody, CatchClause, Expr, LabelId, LabelTable, VarId, VariableTable};
use crate::context::AnalysisContext;
use crate::errors::{AnalysisAborted, PatternMismatch};
use crate::instruction::{OpCode, Operand};
use crate::metadata::{FieldRef, MetadataProvider, TypeRef};
use crate::options::ReconstructOptions;
use crate::temp_inlining;

use super::state_range::{StateRange, StateRangeAnalysis, StateRangeMode};
use super::{
    build_nested, linear_statements, load_field_on, match_call, match_state_assignment,
    negative_on_mismatch, parameter_value, store_field_on, translate_fields_to_locals,
    AsyncMethodKind, RewriteError, StateMachineDescriptor,
};

/// Result of matching the construct-and-start stub.
struct CreationShape {
    kind: AsyncMethodKind,
    state_type: TypeRef,
    state_field: Option<FieldRef>,
    builder_field: Option<FieldRef>,
    field_to_parameter: BTreeMap<FieldRef, VarId>,
}

/// Attempt the reconstruction; `None` means the method is not an async
/// continuation stub, and the caller keeps the original body.
pub(crate) fn try_reconstruct(
    ctx: &mut AnalysisContext,
    provider: &dyn MetadataProvider,
    outer: &BuiltBody,
    options: &ReconstructOptions,
    vars: &mut VariableTable,
    labels: &mut LabelTable,
) -> Result<Option<BuiltBody>, AnalysisAborted> {
    let shape = match match_task_creation(outer, vars) {
        Some(s) => s,
        None => return Ok(None),
    };
    debug!(
        "[async] creation stub matched, state type {}",
        shape.state_type.full_name()
    );
    negative_on_mismatch(
        run(ctx, provider, outer, shape, options, vars, labels),
        "async",
    )
}

/// Shape A: the body stores parameters into a freshly initialized
/// state-holder, optionally seeds the state and builder fields, starts the
/// builder against the holder and returns the builder's task (or nothing).
fn match_task_creation(outer: &BuiltBody, vars: &VariableTable) -> Option<CreationShape> {
    let stmts = linear_statements(&outer.nodes)?;
    if stmts.is_empty() {
        return None;
    }

    let mut state_var: Option<VarId> = None;
    let mut state_type: Option<TypeRef> = None;
    let mut state_field: Option<FieldRef> = None;
    let mut builder_field: Option<FieldRef> = None;
    let mut field_to_parameter: BTreeMap<FieldRef, VarId> = BTreeMap::new();
    let mut start: Option<(AsyncMethodKind, VarId, Option<FieldRef>)> = None;
    let mut tail = Vec::new();

    for e in stmts {
        if start.is_some() {
            tail.push(e);
            continue;
        }
        if e.opcode == OpCode::Nop {
            continue;
        }
        if e.opcode == OpCode::InitObject {
            let (ty, target) = match (&e.operand, e.args.first()) {
                (Operand::Type(ty), Some(target)) => (ty, target),
                _ => return None,
            };
            let v = match target.opcode {
                OpCode::LoadLocal | OpCode::LoadLocalAddress => target.operand.as_var()?,
                _ => return None,
            };
            if state_var.map(|sv| sv != v).unwrap_or(false) {
                return None;
            }
            state_var = Some(v);
            state_type = Some(ty.clone());
            continue;
        }
        if let Some((v, value)) = e.as_store_local() {
            if value.opcode == OpCode::NewObject {
                let ctor = value.operand.as_method()?;
                state_var = Some(v);
                state_type = Some(ctor.declaring_type.clone());
                continue;
            }
            return None;
        }
        if let Some(sm) = state_var {
            if let Some((f, value)) = store_field_on(e, sm) {
                if let Some(p) = parameter_value(value, vars) {
                    field_to_parameter.insert(f.clone(), p);
                    continue;
                }
                if value.as_i32().is_some() {
                    state_field = Some(f.clone());
                    continue;
                }
                if let Some((m, _)) = match_call(value) {
                    if m.name == "Create" {
                        builder_field = Some(f.clone());
                        continue;
                    }
                }
                return None;
            }
        }
        if let Some(matched) = match_start_call(e) {
            start = Some(matched);
            continue;
        }
        return None;
    }

    let (kind, start_var, start_builder) = start?;
    if state_var.map(|sv| sv != start_var).unwrap_or(false) {
        return None;
    }
    if let Some(f) = start_builder {
        match &builder_field {
            Some(existing) if *existing != f => return None,
            _ => builder_field = Some(f),
        }
    }
    let state_type = state_type?;

    if !match_return_task(&tail, kind, start_var, builder_field.as_ref()) {
        return None;
    }

    Some(CreationShape {
        kind,
        state_type,
        state_field,
        builder_field,
        field_to_parameter,
    })
}

/// `call Builder::Start(builder-access, ref holder)`; classifies the method
/// by the builder type.
fn match_start_call(e: &Expr) -> Option<(AsyncMethodKind, VarId, Option<FieldRef>)> {
    let (m, args) = match_call(e)?;
    if m.name != "Start" || m.declaring_type.namespace != "System.Runtime.CompilerServices" {
        return None;
    }
    let kind = match m.declaring_type.name.as_str() {
        "AsyncTaskMethodBuilder`1" => AsyncMethodKind::TaskOfResult,
        "AsyncTaskMethodBuilder" => AsyncMethodKind::Task,
        "AsyncVoidMethodBuilder" => AsyncMethodKind::NoResult,
        _ => return None,
    };
    if args.len() != 2 {
        return None;
    }
    let holder = match args[1].opcode {
        OpCode::LoadLocalAddress | OpCode::LoadLocal => args[1].operand.as_var()?,
        _ => return None,
    };
    let builder = match args[0].opcode {
        OpCode::LoadFieldAddress | OpCode::LoadField => {
            let f = args[0].operand.as_field()?.clone();
            if !args[0]
                .args
                .first()
                .map(|t| t.loads_var(holder))
                .unwrap_or(false)
            {
                return None;
            }
            Some(f)
        }
        // A separate builder local; the field is discovered from the resume
        // method instead.
        OpCode::LoadLocalAddress => None,
        _ => return None,
    };
    Some((kind, holder, builder))
}

/// The stub's tail: a bare return for no-result methods, otherwise a return
/// of the builder's task.
fn match_return_task(
    tail: &[&Expr],
    kind: AsyncMethodKind,
    holder: VarId,
    builder_field: Option<&FieldRef>,
) -> bool {
    let [ret] = tail else { return false };
    if ret.opcode != OpCode::Return {
        return false;
    }
    match kind {
        AsyncMethodKind::NoResult => ret.args.is_empty(),
        AsyncMethodKind::Task | AsyncMethodKind::TaskOfResult => {
            let [value] = ret.args.as_slice() else {
                return false;
            };
            let Some((m, args)) = match_call(value) else {
                return false;
            };
            if !m.name.ends_with("get_Task") || args.len() != 1 {
                return false;
            }
            match (args[0].opcode, builder_field) {
                (OpCode::LoadFieldAddress | OpCode::LoadField, Some(f)) => {
                    args[0].operand.as_field() == Some(f)
                        && args[0]
                            .args
                            .first()
                            .map(|t| t.loads_var(holder))
                            .unwrap_or(false)
                }
                (OpCode::LoadLocalAddress | OpCode::LoadLocal, None) => true,
                _ => false,
            }
        }
    }
}

struct ResumeShape {
    try_body: Vec<AstNode>,
    /// Nodes between the guarded region and the exit label.
    middle: Vec<AstNode>,
    exit_label: LabelId,
    final_state: i64,
    state_field: FieldRef,
    builder_field: FieldRef,
}

fn run(
    ctx: &mut AnalysisContext,
    provider: &dyn MetadataProvider,
    outer: &BuiltBody,
    shape: CreationShape,
    options: &ReconstructOptions,
    vars: &mut VariableTable,
    labels: &mut LabelTable,
) -> Result<BuiltBody, RewriteError> {
    let type_shape = provider
        .type_shape(&shape.state_type)
        .ok_or(PatternMismatch("state-holder type not in module"))?;
    if !type_shape.is_compiler_generated
        || !type_shape.is_nested
        || !type_shape.implements("System.Runtime.CompilerServices", "IAsyncStateMachine")
    {
        return Err(PatternMismatch("holder is not a continuation type").into());
    }
    let resume_ref = type_shape
        .method_named("MoveNext")
        .or_else(|| type_shape.method_with_suffix(".MoveNext"))
        .ok_or(PatternMismatch("continuation has no resume method"))?
        .clone();
    let resume_body = provider
        .method_body(&resume_ref)
        .ok_or(PatternMismatch("resume method body unavailable"))?;

    let resume = build_nested(ctx, resume_body, options, vars, labels)?;
    let this = resume
        .this_var
        .ok_or(PatternMismatch("resume method without this"))?;

    let mut analyzed = analyze_resume(resume.nodes, this, &shape)?;
    debug!(
        "[async] scaffold verified, final state {}, kind {:?}",
        analyzed.final_state, shape.kind
    );

    let mut analysis = StateRangeAnalysis::new(
        StateRangeMode::Resume,
        analyzed.state_field.clone(),
        this,
    );
    let pos = analysis
        .assign_ranges(&analyzed.try_body, StateRange::full())
        .map_err(RewriteError::Mismatch)?;
    let (pos, mapping) = analysis.ensure_label_at(&mut analyzed.try_body, pos, labels);

    let desc = StateMachineDescriptor {
        state_type: shape.state_type.clone(),
        state_field: analyzed.state_field.clone(),
        builder_field: Some(analyzed.builder_field.clone()),
        kind: Some(shape.kind),
        current_field: None,
        field_to_parameter: shape.field_to_parameter.clone(),
    };

    let mut conv = Converter {
        desc: &desc,
        this,
        mapping: &mapping,
        exit_label: analyzed.exit_label,
        pending: None,
    };
    let mut new_body: Vec<AstNode> = Vec::new();
    if let Some(entry) = resolve_label(&mapping, -1) {
        new_body.push(branch_to(entry));
    }
    conv.convert_into(&analyzed.try_body[pos..], 0, &mut new_body)?;
    convert_tail(&analyzed.middle, &mut conv, &mut new_body)?;
    new_body.push(AstNode::Label(analyzed.exit_label));
    new_body.push(AstNode::Expr(Expr::new(OpCode::Return, Operand::None, vec![])));

    let mut field_locals = BTreeMap::new();
    translate_fields_to_locals(
        &mut new_body,
        this,
        &desc.field_to_parameter,
        &mut field_locals,
        vars,
    );
    let new_body = temp_inlining::inline_single_use_temps(new_body, vars);

    Ok(BuiltBody {
        nodes: new_body,
        parameters: outer.parameters.clone(),
        this_var: outer.this_var,
    })
}

/// Check the resume method's scaffold: a single guarded region, a catch-all
/// forwarding handler, and a designated exit label followed by the final
/// return.
fn analyze_resume(
    nodes: Vec<AstNode>,
    this: VarId,
    shape: &CreationShape,
) -> Result<ResumeShape, PatternMismatch> {
    let mut iter = nodes.into_iter();
    let region = match iter.next() {
        Some(AstNode::Try(t)) => t,
        _ => return Err(PatternMismatch("resume body does not start with a guarded region")),
    };
    if region.catch_clauses.len() != 1
        || region.finally_body.is_some()
        || region.fault_body.is_some()
    {
        return Err(PatternMismatch("guarded region is not a single catch scaffold"));
    }

    let rest: Vec<AstNode> = iter.collect();
    if rest.len() < 2 {
        return Err(PatternMismatch("no exit label after the guarded region"));
    }
    rest.last()
        .and_then(|n| n.as_expr())
        .filter(|e| e.opcode == OpCode::Return && e.args.is_empty())
        .ok_or(PatternMismatch("resume method does not end in a bare return"))?;
    let exit_label = rest[rest.len() - 2]
        .as_label()
        .ok_or(PatternMismatch("no exit label before the final return"))?;
    let middle: Vec<AstNode> = rest[..rest.len() - 2].to_vec();

    let (final_state, state_field, builder_field) = validate_catch(
        &region.catch_clauses[0],
        this,
        shape.state_field.as_ref(),
        shape.builder_field.as_ref(),
        exit_label,
    )?;

    Ok(ResumeShape {
        try_body: region.try_body,
        middle,
        exit_label,
        final_state,
        state_field,
        builder_field,
    })
}

/// The standard exception-forwarding handler: optionally re-stores the bound
/// exception, stores the final state, calls the builder's fail entry point
/// with the exception, and leaves to the exit label.
fn validate_catch(
    clause: &CatchClause,
    this: VarId,
    state_field: Option<&FieldRef>,
    builder_field: Option<&FieldRef>,
    exit_label: LabelId,
) -> Result<(i64, FieldRef, FieldRef), PatternMismatch> {
    let caught = clause
        .exception_type
        .as_ref()
        .ok_or(PatternMismatch("handler is not a typed catch"))?;
    if !caught.is_base_exception() {
        return Err(PatternMismatch("handler does not catch the base exception type"));
    }

    let stmts: Vec<&Expr> = clause.body.iter().filter_map(|n| n.as_expr()).collect();
    if stmts.len() != clause.body.len() {
        return Err(PatternMismatch("handler contains non-expression nodes"));
    }

    let (ex, rest) = match stmts.as_slice() {
        [first, rest @ ..] if rest.len() == 3 => {
            let (v, value) = first
                .as_store_local()
                .ok_or(PatternMismatch("handler does not re-store the exception"))?;
            if value.as_load_local() != clause.exception_var {
                return Err(PatternMismatch("handler stores something else than the exception"));
            }
            (v, rest)
        }
        rest if rest.len() == 3 => {
            let ex = clause
                .exception_var
                .ok_or(PatternMismatch("handler has no bound exception"))?;
            (ex, rest)
        }
        _ => return Err(PatternMismatch("handler has an unexpected statement count")),
    };

    let (f, value) = store_field_on(rest[0], this)
        .ok_or(PatternMismatch("handler does not store the final state"))?;
    if let Some(expected) = state_field {
        if f != expected {
            return Err(PatternMismatch("handler stores an unrelated field"));
        }
    }
    let final_state = value
        .as_i32()
        .map(i64::from)
        .ok_or(PatternMismatch("final state is not a constant"))?;
    let state_field = f.clone();

    let (m, args) =
        match_call(rest[1]).ok_or(PatternMismatch("handler does not forward the error"))?;
    if m.name != "SetException" || args.len() != 2 {
        return Err(PatternMismatch("handler does not call the fail entry point"));
    }
    let builder = load_field_on(&args[0], this)
        .ok_or(PatternMismatch("fail entry point is not on the builder field"))?;
    if let Some(expected) = builder_field {
        if builder != expected {
            return Err(PatternMismatch("fail entry point is on an unrelated field"));
        }
    }
    if args[1].as_load_local() != Some(ex) {
        return Err(PatternMismatch("fail entry point does not receive the exception"));
    }

    match rest[2].opcode {
        OpCode::Leave | OpCode::Branch
            if rest[2].operand.as_label() == Some(exit_label) => {}
        _ => return Err(PatternMismatch("handler does not exit to the designated label")),
    }

    Ok((final_state, state_field, builder.clone()))
}

struct Converter<'a> {
    desc: &'a StateMachineDescriptor,
    this: VarId,
    mapping: &'a [(LabelId, StateRange)],
    exit_label: LabelId,
    pending: Option<i64>,
}

impl Converter<'_> {
    fn convert_into(
        &mut self,
        nodes: &[AstNode],
        depth: usize,
        out: &mut Vec<AstNode>,
    ) -> Result<(), PatternMismatch> {
        let mut i = 0;
        while i < nodes.len() {
            match &nodes[i] {
                AstNode::Label(l) => out.push(AstNode::Label(*l)),
                AstNode::Try(t) => {
                    let mut region = t.clone();
                    let mut converted = Vec::new();
                    self.convert_into(&t.try_body, depth + 1, &mut converted)?;
                    region.try_body = converted;
                    for c in &mut region.catch_clauses {
                        let mut body = Vec::new();
                        self.convert_into(&c.body, depth + 1, &mut body)?;
                        c.body = body;
                    }
                    if let Some(b) = region.finally_body.take() {
                        let mut body = Vec::new();
                        self.convert_into(&b, depth + 1, &mut body)?;
                        region.finally_body = Some(body);
                    }
                    out.push(AstNode::Try(region));
                }
                AstNode::Expr(e) => {
                    if let Some(k) = match_state_assignment(e, self.this, &self.desc.state_field) {
                        // Non-negative states mark suspend points; running and
                        // final markers vanish from the linear body.
                        if k >= 0 {
                            self.pending = Some(k);
                        }
                    } else if let Some(awaited) = self.match_await_call(e) {
                        let state = self
                            .pending
                            .take()
                            .ok_or(PatternMismatch("await without a pending suspend state"))?;
                        let resume = resolve_label(self.mapping, state)
                            .ok_or(PatternMismatch("no resume label for a suspend state"))?;
                        out.push(AstNode::Expr(Expr::new(
                            OpCode::Await,
                            Operand::Label(resume),
                            vec![awaited],
                        )));
                        // The scheduling exit right after the registration is
                        // implied by the suspend point.
                        if let Some(next) = nodes.get(i + 1).and_then(|n| n.as_expr()) {
                            let is_exit = (next.opcode == OpCode::Return && next.args.is_empty())
                                || (matches!(next.opcode, OpCode::Leave | OpCode::Branch)
                                    && next.operand.as_label() == Some(self.exit_label));
                            if is_exit {
                                i += 1;
                            }
                        }
                    } else if let Some(value) = self.match_complete_call(e) {
                        out.push(AstNode::Expr(Expr::new(
                            OpCode::Return,
                            Operand::None,
                            value.into_iter().collect(),
                        )));
                    } else if depth == 0 && e.opcode == OpCode::Leave {
                        // The guarded scaffold disappears; a region exit is a
                        // plain jump now.
                        let target = e
                            .operand
                            .as_label()
                            .ok_or(PatternMismatch("leave without label"))?;
                        out.push(branch_to(target));
                    } else {
                        out.push(AstNode::Expr(e.clone()));
                    }
                }
            }
            i += 1;
        }
        Ok(())
    }

    /// Call to an await-completion entry point; yields the awaited operand.
    fn match_await_call(&self, e: &Expr) -> Option<Expr> {
        let (m, args) = match_call(e)?;
        if args.len() != 3 {
            return None;
        }
        matches!(m.name.as_str(), "AwaitUnsafeOnCompleted" | "AwaitOnCompleted")
            .then(|| args[1].clone())
    }

    /// The builder's complete call; yields the result value if any.
    fn match_complete_call(&self, e: &Expr) -> Option<Option<Expr>> {
        let (m, args) = match_call(e)?;
        if m.name != "SetResult" || args.is_empty() {
            return None;
        }
        let on_builder = load_field_on(&args[0], self.this)
            .map(|f| Some(f) == self.desc.builder_field.as_ref())
            .unwrap_or(false);
        on_builder.then(|| args.get(1).cloned())
    }
}

/// Nodes between the guarded region and the exit label: kept labels, dropped
/// final-state stores, and the builder's complete call mapped to the final
/// return.
fn convert_tail(
    middle: &[AstNode],
    conv: &mut Converter<'_>,
    out: &mut Vec<AstNode>,
) -> Result<(), PatternMismatch> {
    for node in middle {
        match node {
            AstNode::Label(l) => out.push(AstNode::Label(*l)),
            AstNode::Try(_) => {
                return Err(PatternMismatch("unexpected region after the guarded body"))
            }
            AstNode::Expr(e) => {
                if match_state_assignment(e, conv.this, &conv.desc.state_field).is_some() {
                    continue;
                }
                if let Some(value) = conv.match_complete_call(e) {
                    out.push(AstNode::Expr(Expr::new(
                        OpCode::Return,
                        Operand::None,
                        value.into_iter().collect(),
                    )));
                    continue;
                }
                return Err(PatternMismatch("unexpected statement after the guarded body"));
            }
        }
    }
    Ok(())
}

fn resolve_label(mapping: &[(LabelId, StateRange)], state: i64) -> Option<LabelId> {
    mapping
        .iter()
        .find(|(_, r)| r.contains(state))
        .map(|(l, _)| *l)
}

fn branch_to(label: LabelId) -> AstNode {
    AstNode::Expr(Expr::new(OpCode::Branch, Operand::Label(label), vec![]))
}
