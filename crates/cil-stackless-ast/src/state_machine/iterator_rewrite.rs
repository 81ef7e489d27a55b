// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Iterator (lazy sequence generator) reconstruction.
//!
//! A method compiled from generator source is reduced to a stub that
//! constructs a compiler-generated enumerator, copies its parameters into
//! fields and returns it. This pass recognizes the stub, recovers the state
//! and current-value fields from the enumerator's constructor and accessor,
//! runs the symbolic state-interval analysis over the disposal method to
//! learn which states each finally helper protects, and rewrites the resume
//! method into a linear body with explicit produce and stop points. Spans
//! between a suspend-state write and a call that leaves a protected region
//! are lifted back into guarded regions whose cleanup is the matching
//! finally-helper body.

use std::collections::BTreeMap;

use log::debug;

use crate::ast::{AstNode, BuiltBody, Expr, LabelId, LabelTable, TryRegion, VarId, VariableTable};
use crate::context::AnalysisContext;
use crate::errors::{AnalysisAborted, PatternMismatch};
use crate::instruction::{OpCode, Operand};
use crate::metadata::{FieldRef, MetadataProvider, MethodRef, TypeRef};
use crate::options::ReconstructOptions;
use crate::temp_inlining;

use super::state_range::{StateRange, StateRangeAnalysis, StateRangeMode};
use super::{
    build_nested, linear_statements, match_call, match_state_assignment, negative_on_mismatch,
    parameter_value, propagate_forwarded_fields, store_field_on, translate_fields_to_locals,
    RewriteError, StateMachineDescriptor,
};

/// Result of matching the construct-and-return stub.
struct CreationShape {
    state_type: TypeRef,
    ctor: MethodRef,
    field_to_parameter: BTreeMap<FieldRef, VarId>,
}

/// Attempt the reconstruction; `None` means the method is not a generator
/// stub, and the caller keeps the original body.
pub(crate) fn try_reconstruct(
    ctx: &mut AnalysisContext,
    provider: &dyn MetadataProvider,
    outer: &BuiltBody,
    options: &ReconstructOptions,
    vars: &mut VariableTable,
    labels: &mut LabelTable,
) -> Result<Option<BuiltBody>, AnalysisAborted> {
    let shape = match match_enumerator_creation(outer, vars, provider) {
        Some(s) => s,
        None => return Ok(None),
    };
    debug!(
        "[iterator] creation stub matched, enumerator type {}",
        shape.state_type.full_name()
    );
    negative_on_mismatch(
        run(ctx, provider, outer, shape, options, vars, labels),
        "iterator",
    )
}

/// Shape B: construct the enumerator with its initial state constant, copy
/// each parameter into a field, and return it directly or through an
/// intermediate copy (elided in optimized builds).
fn match_enumerator_creation(
    outer: &BuiltBody,
    vars: &VariableTable,
    provider: &dyn MetadataProvider,
) -> Option<CreationShape> {
    let stmts = linear_statements(&outer.nodes)?;
    if stmts.is_empty() {
        return None;
    }

    if let [only] = stmts.as_slice() {
        // ret(newobj(...)) in optimized builds with no parameter copies.
        if only.opcode != OpCode::Return || only.args.len() != 1 {
            return None;
        }
        let ctor = match_creation_new_object(&only.args[0], provider)?;
        return Some(CreationShape {
            state_type: ctor.declaring_type.clone(),
            ctor,
            field_to_parameter: BTreeMap::new(),
        });
    }

    let (var1, value) = stmts[0].as_store_local()?;
    let ctor = match_creation_new_object(value, provider)?;
    let mut field_to_parameter = BTreeMap::new();

    let mut i = 1;
    while i < stmts.len() {
        match store_field_on(stmts[i], var1) {
            Some((f, value)) => {
                let param = parameter_value(value, vars)?;
                field_to_parameter.insert(f.clone(), param);
                i += 1;
            }
            None => break,
        }
    }

    // The compiler may copy to a second local before returning.
    let mut result_var = var1;
    if let Some((var2, value)) = stmts.get(i).and_then(|e| e.as_store_local()) {
        if value.as_load_local() != Some(var1) {
            return None;
        }
        result_var = var2;
        i += 1;
    }

    let ret = stmts.get(i)?;
    if ret.opcode != OpCode::Return
        || ret.args.len() != 1
        || ret.args[0].as_load_local() != Some(result_var)
        || i + 1 != stmts.len()
    {
        return None;
    }

    Some(CreationShape {
        state_type: ctor.declaring_type.clone(),
        ctor,
        field_to_parameter,
    })
}

/// `newobj Enumerator::.ctor(initial-state)` for a compiler-generated
/// enumerator type; the seed must be the fresh or fresh-enumerable constant.
fn match_creation_new_object(e: &Expr, provider: &dyn MetadataProvider) -> Option<MethodRef> {
    if e.opcode != OpCode::NewObject || e.args.len() != 1 {
        return None;
    }
    let initial = e.args[0].as_i32()?;
    if initial != -2 && initial != 0 {
        return None;
    }
    let ctor = e.operand.as_method()?.clone();
    let shape = provider.type_shape(&ctor.declaring_type)?;
    let is_enumerator = shape.is_compiler_generated
        && shape.is_nested
        && shape.implements("System.Collections", "IEnumerator");
    is_enumerator.then_some(ctor)
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
        .ok_or(PatternMismatch("enumerator type not in module"))?
        .clone();
    let mut field_to_parameter = shape.field_to_parameter;

    // The constructor stores its first argument into the state field.
    let state_field = {
        let ctor_body = provider
            .method_body(&shape.ctor)
            .ok_or(PatternMismatch("enumerator constructor body unavailable"))?;
        let built = build_nested(ctx, ctor_body, options, vars, labels)?;
        analyze_ctor(&built)?
    };

    // The current-value accessor returns one field of the enumerator.
    let current_field = {
        let accessor = type_shape
            .method_with_suffix("get_Current")
            .ok_or(PatternMismatch("enumerator has no current-value accessor"))?;
        let body = provider
            .method_body(accessor)
            .ok_or(PatternMismatch("current-value accessor body unavailable"))?;
        let built = build_nested(ctx, body, options, vars, labels)?;
        analyze_current_accessor(&built)?
    };

    // Fields of the enumerable view that forward already-mapped fields
    // inherit their parameter mapping.
    if let Some(get_enum) = type_shape.method_with_suffix("GetEnumerator") {
        if let Some(body) = provider.method_body(get_enum) {
            let built = build_nested(ctx, body, options, vars, labels)?;
            propagate_forwarded_fields(&built, &mut field_to_parameter);
        }
    }

    // Disposal analysis: which state values each finally helper protects.
    let dispose_ref = type_shape
        .method_with_suffix("Dispose")
        .ok_or(PatternMismatch("enumerator has no disposal method"))?
        .clone();
    let finally_to_range = {
        let body = provider
            .method_body(&dispose_ref)
            .ok_or(PatternMismatch("disposal method body unavailable"))?;
        let built = build_nested(ctx, body, options, vars, labels)?;
        match built.this_var {
            Some(dispose_this) => {
                let mut analysis = StateRangeAnalysis::new(
                    StateRangeMode::Dispose,
                    state_field.clone(),
                    dispose_this,
                );
                analysis
                    .assign_ranges(&built.nodes, StateRange::full())
                    .map_err(RewriteError::Mismatch)?;
                analysis.finally_to_range
            }
            None => BTreeMap::new(),
        }
    };
    debug!(
        "[iterator] disposal analysis found {} finally helper(s)",
        finally_to_range.len()
    );

    // Resume method.
    let resume_ref = type_shape
        .method_named("MoveNext")
        .or_else(|| type_shape.method_with_suffix(".MoveNext"))
        .ok_or(PatternMismatch("enumerator has no resume method"))?;
    let resume_body = provider
        .method_body(resume_ref)
        .ok_or(PatternMismatch("resume method body unavailable"))?;
    let resume = build_nested(ctx, resume_body, options, vars, labels)?;
    let this = resume
        .this_var
        .ok_or(PatternMismatch("resume method without this"))?;

    let mut analyzed = analyze_resume(resume.nodes, this, &dispose_ref)?;

    let mut analysis =
        StateRangeAnalysis::new(StateRangeMode::Resume, state_field.clone(), this);
    let pos = analysis
        .assign_ranges(&analyzed.body[..analyzed.body_len], StateRange::full())
        .map_err(RewriteError::Mismatch)?;
    let len_before = analyzed.body.len();
    let (pos, mapping) = analysis.ensure_label_at(&mut analyzed.body, pos, labels);
    if analyzed.body.len() > len_before {
        analyzed.body_len += 1;
    }

    let desc = StateMachineDescriptor {
        state_type: shape.state_type.clone(),
        state_field,
        builder_field: None,
        kind: None,
        current_field: Some(current_field),
        field_to_parameter,
    };

    let mut field_locals: BTreeMap<FieldRef, VarId> = BTreeMap::new();
    let mut conv = Converter {
        ctx,
        provider,
        options,
        desc: &desc,
        this,
        mapping: &mapping,
        dispose: &dispose_ref,
        finally_to_range: &finally_to_range,
        return_var: analyzed.return_var,
        return_label: analyzed.return_label,
        return_false_label: analyzed.return_false_label,
        field_locals: &mut field_locals,
    };
    let mut new_body = conv.convert_body(&analyzed.body, pos, analyzed.body_len, vars, labels)?;

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

/// The constructor stores its first argument into the state field.
fn analyze_ctor(built: &BuiltBody) -> Result<FieldRef, PatternMismatch> {
    let this = built
        .this_var
        .ok_or(PatternMismatch("constructor without this"))?;
    let state_param = built
        .parameters
        .first()
        .copied()
        .ok_or(PatternMismatch("constructor takes no state argument"))?;
    for node in &built.nodes {
        if let Some(e) = node.as_expr() {
            if let Some((f, value)) = store_field_on(e, this) {
                if value.as_load_local() == Some(state_param) {
                    return Ok(f.clone());
                }
            }
        }
    }
    Err(PatternMismatch("constructor does not store the state argument"))
}

/// The accessor returns the current-value field, directly in optimized
/// builds or through a local (and a jump) in debug builds.
fn analyze_current_accessor(built: &BuiltBody) -> Result<FieldRef, PatternMismatch> {
    let this = built
        .this_var
        .ok_or(PatternMismatch("accessor without this"))?;
    let stmts: Vec<&Expr> = built.nodes.iter().filter_map(|n| n.as_expr()).collect();

    let field_of = |e: &Expr| -> Option<FieldRef> {
        (e.opcode == OpCode::LoadField
            && e.args.len() == 1
            && e.args[0].loads_var(this))
        .then(|| e.operand.as_field().cloned())
        .flatten()
    };

    match stmts.as_slice() {
        [ret] if ret.opcode == OpCode::Return && ret.args.len() == 1 => {
            field_of(&ret.args[0]).ok_or(PatternMismatch("accessor does not return a field"))
        }
        [store, rest @ ..] if !rest.is_empty() => {
            let (v, value) = store
                .as_store_local()
                .ok_or(PatternMismatch("accessor does not store the field"))?;
            let field =
                field_of(value).ok_or(PatternMismatch("accessor does not load a field"))?;
            let ret = rest.last().unwrap();
            let direct_jump = rest.len() == 1
                || (rest.len() == 2 && matches!(rest[0].opcode, OpCode::Branch));
            if !direct_jump
                || ret.opcode != OpCode::Return
                || ret.args.len() != 1
                || ret.args[0].as_load_local() != Some(v)
            {
                return Err(PatternMismatch("accessor tail is not a plain return"));
            }
            Ok(field)
        }
        _ => Err(PatternMismatch("accessor body has an unexpected shape")),
    }
}

struct ResumeShape {
    body: Vec<AstNode>,
    /// Exclusive end of the convertible span; the trailing return plumbing
    /// is re-expressed as stop points.
    body_len: usize,
    return_var: Option<VarId>,
    return_label: Option<LabelId>,
    return_false_label: Option<LabelId>,
}

/// Classify the resume method's return plumbing and peel the wrapping
/// dispose-on-failure region when present.
fn analyze_resume(
    nodes: Vec<AstNode>,
    this: VarId,
    dispose: &MethodRef,
) -> Result<ResumeShape, PatternMismatch> {
    if nodes.is_empty() {
        return Err(PatternMismatch("resume method is empty"));
    }

    let last = nodes
        .last()
        .and_then(|n| n.as_expr())
        .ok_or(PatternMismatch("resume method does not end in a return"))?;
    if last.opcode != OpCode::Return || last.args.len() != 1 {
        return Err(PatternMismatch("resume method does not return a value"));
    }

    let (return_var, return_label);
    if let Some(v) = last.args[0].as_load_local() {
        // Debug builds and bodies with cleanup regions return through a
        // variable behind a shared label.
        return_var = Some(v);
        return_label = Some(
            nodes
                .get(nodes.len().wrapping_sub(2))
                .and_then(|n| n.as_label())
                .ok_or(PatternMismatch("return variable without a return label"))?,
        );
    } else if last.args[0].as_i32() == Some(0) {
        return_var = None;
        return_label = None;
    } else {
        return Err(PatternMismatch("final return is neither a variable nor false"));
    }

    let cleanup_body: Option<Vec<AstNode>> = match nodes.first().and_then(|n| n.as_try()) {
        Some(region)
            if region.catch_clauses.is_empty()
                && region.finally_body.is_none()
                && region.fault_body.is_some() =>
        {
            if return_var.is_none() {
                return Err(PatternMismatch("cleanup region without a return variable"));
            }
            let fault = region.fault_body.as_ref().unwrap();
            let exprs: Vec<&Expr> = fault.iter().filter_map(|n| n.as_expr()).collect();
            let is_dispose_call = matches!(exprs.as_slice(), [call, end]
                if end.opcode == OpCode::EndFinally
                    && match_call(call)
                        .map(|(m, args)| {
                            m.name == dispose.name
                                && args.len() == 1
                                && args[0].loads_var(this)
                        })
                        .unwrap_or(false));
            if !is_dispose_call {
                return Err(PatternMismatch("cleanup region does not call the disposal method"));
            }
            Some(region.try_body.clone())
        }
        _ => None,
    };
    let (mut body, mut body_len) = match cleanup_body {
        Some(b) => {
            let len = b.len();
            (b, len)
        }
        None => {
            let len = if return_var.is_none() {
                nodes.len() - 1
            } else {
                nodes.len() - 2
            };
            (nodes, len)
        }
    };

    if let Some(rv) = return_var {
        // Optionally a jump to the return label, then the store of false.
        if body_len > 0 {
            if let Some(e) = body[body_len - 1].as_expr() {
                if matches!(e.opcode, OpCode::Branch | OpCode::Leave)
                    && e.operand.as_label() == return_label
                {
                    body_len -= 1;
                }
            }
        }
        let store_false = body_len
            .checked_sub(1)
            .and_then(|i| body[i].as_expr())
            .and_then(|e| e.as_store_local())
            .filter(|(v, value)| *v == rv && value.as_i32() == Some(0));
        if store_false.is_none() {
            return Err(PatternMismatch("resume method does not store a false result"));
        }
        body_len -= 1;
    }

    let return_false_label = body_len
        .checked_sub(1)
        .and_then(|i| body[i].as_label());

    Ok(ResumeShape {
        body,
        body_len,
        return_var,
        return_label,
        return_false_label,
    })
}

/// Marker for a state write copied into the new body.
#[derive(Debug, Clone, Copy)]
struct SetState {
    new_body_pos: usize,
    new_state: i64,
}

struct Converter<'a> {
    ctx: &'a mut AnalysisContext,
    provider: &'a dyn MetadataProvider,
    options: &'a ReconstructOptions,
    desc: &'a StateMachineDescriptor,
    this: VarId,
    mapping: &'a [(LabelId, StateRange)],
    dispose: &'a MethodRef,
    finally_to_range: &'a BTreeMap<MethodRef, StateRange>,
    return_var: Option<VarId>,
    return_label: Option<LabelId>,
    return_false_label: Option<LabelId>,
    field_locals: &'a mut BTreeMap<FieldRef, VarId>,
}

impl Converter<'_> {
    fn convert_body(
        &mut self,
        body: &[AstNode],
        start: usize,
        body_len: usize,
        vars: &mut VariableTable,
        labels: &mut LabelTable,
    ) -> Result<Vec<AstNode>, RewriteError> {
        let mut new_body: Vec<AstNode> = Vec::new();
        new_body.push(self.make_goto(0)?);
        let mut state_changes: Vec<SetState> = Vec::new();
        let mut current_state: i64 = -1;

        let mut pos = start;
        while pos < body_len {
            let node = &body[pos];
            let expr = match node {
                AstNode::Expr(e) => e,
                _ => {
                    new_body.push(node.clone());
                    pos += 1;
                    continue;
                }
            };

            if let Some((f, value)) = store_field_on(expr, self.this) {
                if *f == self.desc.state_field {
                    let state = value
                        .as_i32()
                        .map(i64::from)
                        .ok_or(PatternMismatch("state write is not a constant"))?;
                    current_state = state;
                    state_changes.push(SetState {
                        new_body_pos: new_body.len(),
                        new_state: state,
                    });
                } else if Some(f) == self.desc.current_field.as_ref() {
                    new_body.push(AstNode::Expr(Expr::new(
                        OpCode::YieldReturn,
                        Operand::None,
                        vec![value.clone()],
                    )));
                } else {
                    new_body.push(node.clone());
                }
                pos += 1;
                continue;
            }

            if let (Some(rv), Some((v, value))) = (self.return_var, expr.as_store_local()) {
                if v == rv {
                    // Store of the result followed by the jump to the shared
                    // return label.
                    let jump_ok = body
                        .get(pos + 1)
                        .and_then(|n| n.as_expr())
                        .map(|e| {
                            matches!(e.opcode, OpCode::Branch | OpCode::Leave)
                                && e.operand.as_label() == self.return_label
                        })
                        .unwrap_or(false);
                    if !jump_ok {
                        return Err(PatternMismatch("result store without return jump").into());
                    }
                    match value.as_i32() {
                        Some(0) => new_body.push(yield_break()),
                        Some(1) => new_body.push(self.make_goto(current_state)?),
                        _ => {
                            return Err(
                                PatternMismatch("result store is not a boolean constant").into()
                            )
                        }
                    }
                    pos += 2;
                    continue;
                }
            }

            if expr.opcode == OpCode::Return {
                let value = expr
                    .args
                    .first()
                    .and_then(|a| a.as_i32())
                    .ok_or(PatternMismatch("direct return is not a constant"))?;
                match value {
                    0 => new_body.push(yield_break()),
                    1 => new_body.push(self.make_goto(current_state)?),
                    _ => return Err(PatternMismatch("direct return is not boolean").into()),
                }
                pos += 1;
                continue;
            }

            if let Some((m, args)) = match_call(expr) {
                if args.len() == 1 && args[0].loads_var(self.this) {
                    let m = m.clone();
                    if m.name == self.dispose.name {
                        // An explicit disposal call expresses an early stop.
                        let jump_ok = body
                            .get(pos + 1)
                            .and_then(|n| n.as_expr())
                            .map(|e| {
                                matches!(e.opcode, OpCode::Branch | OpCode::Leave)
                                    && e.operand.as_label() == self.return_false_label
                            })
                            .unwrap_or(false);
                        if !jump_ok {
                            return Err(
                                PatternMismatch("disposal call without stop jump").into()
                            );
                        }
                        new_body.push(yield_break());
                        pos += 2;
                        continue;
                    }
                    if let Some(range) = self.finally_to_range.get(&m) {
                        self.lift_guarded_region(
                            &m,
                            range,
                            &mut new_body,
                            &mut state_changes,
                            vars,
                            labels,
                        )?;
                        pos += 1;
                        continue;
                    }
                }
            }

            new_body.push(node.clone());
            pos += 1;
        }

        new_body.push(yield_break());
        Ok(new_body)
    }

    /// A call leaving a protected span: everything since the state write the
    /// span belongs to moves into a guarded region whose cleanup is the
    /// finally helper's body.
    fn lift_guarded_region(
        &mut self,
        helper: &MethodRef,
        range: &StateRange,
        new_body: &mut Vec<AstNode>,
        state_changes: &mut Vec<SetState>,
        vars: &mut VariableTable,
        labels: &mut LabelTable,
    ) -> Result<(), RewriteError> {
        let index = state_changes
            .iter()
            .position(|sc| range.contains(sc.new_state))
            .ok_or(PatternMismatch("protected span has no matching state write"))?;
        let change = state_changes[index];

        let label = labels.named(&format!("leave_protected_{}", change.new_state));
        new_body.push(AstNode::Expr(Expr::new(
            OpCode::Leave,
            Operand::Label(label),
            vec![],
        )));

        let try_body: Vec<AstNode> = new_body.split_off(change.new_body_pos);
        state_changes.truncate(index);

        let finally_body = self.convert_finally_body(helper, vars, labels)?;
        new_body.push(AstNode::Try(TryRegion {
            try_body,
            catch_clauses: Vec::new(),
            finally_body: Some(finally_body),
            fault_body: None,
        }));
        new_body.push(AstNode::Label(label));
        Ok(())
    }

    /// A finally helper becomes the cleanup block: its own state write is
    /// removed and its returns become region exits. Field accesses are
    /// redirected with the shared memo so every body agrees on the locals.
    fn convert_finally_body(
        &mut self,
        helper: &MethodRef,
        vars: &mut VariableTable,
        labels: &mut LabelTable,
    ) -> Result<Vec<AstNode>, RewriteError> {
        let body = self
            .provider
            .method_body(helper)
            .ok_or(PatternMismatch("finally helper body unavailable"))?;
        let built = build_nested(self.ctx, body, self.options, vars, labels)?;
        let helper_this = built
            .this_var
            .ok_or(PatternMismatch("finally helper without this"))?;
        let mut nodes = built.nodes;

        if let Some(first) = nodes.first().and_then(|n| n.as_expr()) {
            if match_state_assignment(first, helper_this, &self.desc.state_field).is_some() {
                nodes.remove(0);
            }
        }
        crate::ast::visit_exprs_mut(&mut nodes, &mut |e| {
            if e.opcode == OpCode::Return {
                e.opcode = OpCode::EndFinally;
                e.args.clear();
            }
        });
        translate_fields_to_locals(
            &mut nodes,
            helper_this,
            &self.desc.field_to_parameter,
            self.field_locals,
            vars,
        );
        Ok(nodes)
    }

    /// Jump to the resume label a state value dispatches to; jumping to the
    /// stop label is a stop.
    fn make_goto(&self, state: i64) -> Result<AstNode, PatternMismatch> {
        for (label, range) in self.mapping {
            if range.contains(state) {
                if Some(*label) == self.return_false_label {
                    return Ok(yield_break());
                }
                return Ok(AstNode::Expr(Expr::new(
                    OpCode::Branch,
                    Operand::Label(*label),
                    vec![],
                )));
            }
        }
        Err(PatternMismatch("no dispatch label for a state value"))
    }
}

fn yield_break() -> AstNode {
    AstNode::Expr(Expr::new(OpCode::YieldBreak, Operand::None, vec![]))
}
