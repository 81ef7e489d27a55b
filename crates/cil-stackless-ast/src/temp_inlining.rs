// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Single-use temporary inlining.
//!
//! The stack-to-variable builder materializes one temporary per consumed
//! stack slot, which leaves chains like
//!
//!   store t0 := ldc.i4 1
//!   store t1 := add(ldloc t0, ldloc x)
//!   ret(ldloc t1)
//!
//! This pass folds a store into its single consumer when the consumer is the
//! immediately following statement, producing `ret(add(1, x))`. The
//! state-machine reconstructors run it again after redirecting field
//! accesses to locals, which exposes new chains.
//!
//! Rules:
//! - only compiler-introduced temporaries, stored exactly once and loaded
//!   exactly once, with their address never taken
//! - an effectful definition may only move into the first evaluated
//!   non-trivial operand position of the consumer (constants and plain
//!   variable loads may be skipped); a pure definition may move into any
//!   operand position

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{visit_exprs, AstNode, Expr, VarId, VariableOrigin, VariableTable};
use crate::instruction::OpCode;

/// Usage facts for every variable mentioned in a body.
#[derive(Debug, Default)]
struct UsageInfo {
    loads: BTreeMap<VarId, usize>,
    stores: BTreeMap<VarId, usize>,
    address_taken: BTreeSet<VarId>,
}

impl UsageInfo {
    fn collect(nodes: &[AstNode]) -> Self {
        let mut info = UsageInfo::default();
        visit_exprs(nodes, &mut |e| match e.opcode {
            OpCode::LoadLocal => {
                if let Some(v) = e.operand.as_var() {
                    *info.loads.entry(v).or_insert(0) += 1;
                }
            }
            OpCode::LoadLocalAddress => {
                if let Some(v) = e.operand.as_var() {
                    info.address_taken.insert(v);
                }
            }
            OpCode::StoreLocal => {
                if let Some(v) = e.operand.as_var() {
                    *info.stores.entry(v).or_insert(0) += 1;
                }
            }
            _ => {}
        });
        info
    }

    fn single_use(&self, v: VarId) -> bool {
        self.loads.get(&v).copied().unwrap_or(0) == 1
            && self.stores.get(&v).copied().unwrap_or(0) == 1
            && !self.address_taken.contains(&v)
    }
}

/// Run the inlining to a fixpoint over the whole body, including nested
/// regions.
pub(crate) fn inline_single_use_temps(mut nodes: Vec<AstNode>, vars: &VariableTable) -> Vec<AstNode> {
    loop {
        let info = UsageInfo::collect(&nodes);
        if !fold_sequences(&mut nodes, &info, vars) {
            return nodes;
        }
    }
}

fn fold_sequences(nodes: &mut Vec<AstNode>, info: &UsageInfo, vars: &VariableTable) -> bool {
    let mut changed = false;

    for node in nodes.iter_mut() {
        if let AstNode::Try(t) = node {
            changed |= fold_sequences(&mut t.try_body, info, vars);
            for c in &mut t.catch_clauses {
                if let Some(fb) = &mut c.filter_body {
                    changed |= fold_sequences(fb, info, vars);
                }
                changed |= fold_sequences(&mut c.body, info, vars);
            }
            if let Some(b) = &mut t.finally_body {
                changed |= fold_sequences(b, info, vars);
            }
            if let Some(b) = &mut t.fault_body {
                changed |= fold_sequences(b, info, vars);
            }
        }
    }

    let mut i = 0;
    while i + 1 < nodes.len() {
        let candidate = nodes[i].as_expr().and_then(|e| e.as_store_local()).and_then(
            |(v, inner)| {
                let eligible = matches!(vars.origin(v), VariableOrigin::Temporary)
                    && info.single_use(v);
                eligible.then(|| (v, inner.clone()))
            },
        );

        let folded = match candidate {
            Some((v, inner)) => {
                let pure = is_pure(&inner);
                match &mut nodes[i + 1] {
                    AstNode::Expr(consumer) => {
                        let mut replacement = Some(inner);
                        if pure {
                            substitute_anywhere(consumer, v, &mut replacement)
                        } else {
                            substitute_first_position(consumer, v, &mut replacement)
                        }
                    }
                    _ => false,
                }
            }
            None => false,
        };

        if folded {
            nodes.remove(i);
            changed = true;
        } else {
            i += 1;
        }
    }

    changed
}

/// A definition with no side effects and no dependence on mutable state
/// other than variables, safe to move past other operands.
fn is_pure(e: &Expr) -> bool {
    let pure_op = matches!(
        e.opcode,
        OpCode::LoadConstI32
            | OpCode::LoadConstI64
            | OpCode::LoadConstF64
            | OpCode::LoadConstString
            | OpCode::LoadNull
            | OpCode::LoadLocal
            | OpCode::LoadLocalAddress
    );
    pure_op && e.args.iter().all(is_pure)
}

/// Operands an effectful definition may be reordered past: constants and
/// plain variable loads, whose values calls cannot disturb.
fn is_pure_leaf(e: &Expr) -> bool {
    matches!(
        e.opcode,
        OpCode::LoadConstI32
            | OpCode::LoadConstI64
            | OpCode::LoadConstF64
            | OpCode::LoadConstString
            | OpCode::LoadNull
            | OpCode::LoadLocal
            | OpCode::LoadLocalAddress
    ) && e.args.is_empty()
}

/// Replace the load of `v` wherever it occurs in the consumer tree.
fn substitute_anywhere(e: &mut Expr, v: VarId, replacement: &mut Option<Expr>) -> bool {
    for a in &mut e.args {
        if a.as_load_local() == Some(v) {
            *a = replacement.take().expect("single substitution");
            return true;
        }
        if substitute_anywhere(a, v, replacement) {
            return true;
        }
    }
    false
}

/// Replace the load of `v` only if it is the first evaluated non-trivial
/// operand of the consumer, preserving evaluation order of effects.
fn substitute_first_position(e: &mut Expr, v: VarId, replacement: &mut Option<Expr>) -> bool {
    for a in &mut e.args {
        if a.as_load_local() == Some(v) {
            *a = replacement.take().expect("single substitution");
            return true;
        }
        if is_pure_leaf(a) {
            continue;
        }
        return substitute_first_position(a, v, replacement);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VariableTable;
    use crate::instruction::Operand;

    fn temp(vars: &mut VariableTable) -> VarId {
        vars.fresh_temp()
    }

    fn const_i32(v: i32) -> Expr {
        Expr::new(OpCode::LoadConstI32, Operand::I32(v), vec![])
    }

    #[test]
    fn test_chain_folds_into_single_expression() {
        let mut vars = VariableTable::new();
        let x = vars.alloc("x", VariableOrigin::Parameter(0));
        let t0 = temp(&mut vars);
        let t1 = temp(&mut vars);

        // store t0 := 1; store t1 := add(t0, x); ret(t1)
        let nodes = vec![
            AstNode::Expr(Expr::store_var(t0, const_i32(1))),
            AstNode::Expr(Expr::store_var(
                t1,
                Expr::new(
                    OpCode::Add,
                    Operand::None,
                    vec![Expr::load_var(t0), Expr::load_var(x)],
                ),
            )),
            AstNode::Expr(Expr::new(
                OpCode::Return,
                Operand::None,
                vec![Expr::load_var(t1)],
            )),
        ];

        let out = inline_single_use_temps(nodes, &vars);
        assert_eq!(out.len(), 1);
        let ret = out[0].as_expr().unwrap();
        assert_eq!(ret.opcode, OpCode::Return);
        let add = &ret.args[0];
        assert_eq!(add.opcode, OpCode::Add);
        assert_eq!(add.args[0].as_i32(), Some(1));
        assert_eq!(add.args[1].as_load_local(), Some(x));
    }

    #[test]
    fn test_pure_definition_reaches_second_operand() {
        let mut vars = VariableTable::new();
        let t0 = temp(&mut vars);
        let t1 = temp(&mut vars);

        // store t0 := 2; store t1 := 3; use(t0, t1) -- t1 folds first, then t0
        let nodes = vec![
            AstNode::Expr(Expr::store_var(t0, const_i32(2))),
            AstNode::Expr(Expr::store_var(t1, const_i32(3))),
            AstNode::Expr(Expr::new(
                OpCode::Add,
                Operand::None,
                vec![Expr::load_var(t0), Expr::load_var(t1)],
            )),
        ];

        let out = inline_single_use_temps(nodes, &vars);
        assert_eq!(out.len(), 1);
        let add = out[0].as_expr().unwrap();
        assert_eq!(add.args[0].as_i32(), Some(2));
        assert_eq!(add.args[1].as_i32(), Some(3));
    }

    #[test]
    fn test_double_use_is_kept() {
        let mut vars = VariableTable::new();
        let t0 = temp(&mut vars);
        let nodes = vec![
            AstNode::Expr(Expr::store_var(t0, const_i32(7))),
            AstNode::Expr(Expr::new(
                OpCode::Add,
                Operand::None,
                vec![Expr::load_var(t0), Expr::load_var(t0)],
            )),
        ];
        let out = inline_single_use_temps(nodes, &vars);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_named_variable_is_kept() {
        let mut vars = VariableTable::new();
        let loc = vars.alloc("loc0", VariableOrigin::LocalSlot(0));
        let nodes = vec![
            AstNode::Expr(Expr::store_var(loc, const_i32(7))),
            AstNode::Expr(Expr::new(
                OpCode::Return,
                Operand::None,
                vec![Expr::load_var(loc)],
            )),
        ];
        let out = inline_single_use_temps(nodes, &vars);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_effectful_definition_stops_at_effectful_operand() {
        let mut vars = VariableTable::new();
        let t0 = temp(&mut vars);
        let callee = crate::metadata::MethodRef::new(
            crate::metadata::TypeRef::new("T", "C"),
            "f",
            0,
        )
        .with_return();

        // store t0 := call f(); use(call f(), t0) -- t0's definition must not
        // jump over the other call.
        let nodes = vec![
            AstNode::Expr(Expr::store_var(
                t0,
                Expr::new(OpCode::Call, Operand::Method(callee.clone()), vec![]),
            )),
            AstNode::Expr(Expr::new(
                OpCode::Add,
                Operand::None,
                vec![
                    Expr::new(OpCode::Call, Operand::Method(callee), vec![]),
                    Expr::load_var(t0),
                ],
            )),
        ];
        let out = inline_single_use_temps(nodes, &vars);
        assert_eq!(out.len(), 2);
    }
}
