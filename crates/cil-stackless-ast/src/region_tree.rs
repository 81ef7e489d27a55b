// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Exception region tree builder.
//!
//! Carves the flat node list into nested try/catch/finally/fault/filter
//! regions driven by the raw handler table. Regions must nest strictly or be
//! disjoint; partial overlap aborts the analysis. Handlers sharing one exact
//! try range attach to the same region.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::ast::{AstNode, CatchClause, Expr, TryRegion, VarId, VariableOrigin, VariableTable};
use crate::errors::AnalysisAborted;
use crate::instruction::{HandlerKind, MethodBody, OpCode};
use crate::options::ReconstructOptions;
use crate::stack_to_var::{flatten_nodes, NodeId, NodeState};

pub(crate) fn build_region_tree(
    arena: &[NodeState],
    order: &[NodeId],
    body: &MethodBody,
    ldexceptions: &BTreeMap<usize, NodeId>,
    ldfilters: &BTreeMap<usize, NodeId>,
    options: &ReconstructOptions,
    vars: &mut VariableTable,
) -> Result<Vec<AstNode>, AnalysisAborted> {
    let mut work: Vec<NodeId> = order.to_vec();
    let all: BTreeSet<usize> = (0..body.handlers.len()).collect();
    let mut ctx = RegionContext {
        arena,
        body,
        ldexceptions,
        ldfilters,
        options,
        vars,
    };
    ctx.convert(&mut work, all)
}

struct RegionContext<'a> {
    arena: &'a [NodeState],
    body: &'a MethodBody,
    ldexceptions: &'a BTreeMap<usize, NodeId>,
    ldfilters: &'a BTreeMap<usize, NodeId>,
    options: &'a ReconstructOptions,
    vars: &'a mut VariableTable,
}

impl RegionContext<'_> {
    fn convert(
        &mut self,
        nodes: &mut Vec<NodeId>,
        mut ehs: BTreeSet<usize>,
    ) -> Result<Vec<AstNode>, AnalysisAborted> {
        let mut ast: Vec<AstNode> = Vec::new();

        while !ehs.is_empty() {
            // The first and widest remaining scope.
            let try_start = ehs
                .iter()
                .map(|&i| self.body.handlers[i].try_start)
                .min()
                .unwrap();
            let try_end = ehs
                .iter()
                .filter(|&&i| self.body.handlers[i].try_start == try_start)
                .map(|&i| self.body.handlers[i].try_end)
                .max()
                .unwrap();
            let group: Vec<usize> = ehs
                .iter()
                .copied()
                .filter(|&i| {
                    self.body.handlers[i].try_start == try_start
                        && self.body.handlers[i].try_end == try_end
                })
                .collect();
            debug!(
                "[regions] carving try [{:#06x}, {:#06x}) with {} handler(s)",
                try_start,
                try_end,
                group.len()
            );

            // Part of the body may already have been removed as unreachable;
            // cut by offset, not by count.
            let prefix = cut_range_before(nodes, try_start, self.arena);
            let flattened = flatten_nodes(self.arena, &prefix, self.vars);
            ast.extend(flattened);

            let nested = take_nested(&mut ehs, self.body, try_start, try_end)?;
            let mut try_ids = cut_range_before(nodes, try_end, self.arena);
            let try_body = self.convert(&mut try_ids, nested)?;

            let mut region = TryRegion {
                try_body,
                ..TryRegion::default()
            };

            for ih in &group {
                let h = self.body.handlers[*ih].clone();
                let nested = take_nested(&mut ehs, self.body, h.handler_start, h.handler_end)?;
                let mut handler_ids = cut_span(nodes, h.handler_start, h.handler_end, self.arena);
                let handler_ast = self.convert(&mut handler_ids, nested)?;

                match h.kind {
                    HandlerKind::Finally => region.finally_body = Some(handler_ast),
                    HandlerKind::Fault => region.fault_body = Some(handler_ast),
                    HandlerKind::Catch => {
                        let mut clause = CatchClause {
                            exception_type: h.caught_type.clone(),
                            exception_var: None,
                            filter_body: None,
                            body: handler_ast,
                        };
                        if let Some(&ldex) = self.ldexceptions.get(ih) {
                            self.resolve_exception_variable(&mut clause, ldex, &h);
                        }
                        region.catch_clauses.push(clause);
                    }
                    HandlerKind::Filter => {
                        let mut clause = CatchClause {
                            exception_type: h.caught_type.clone(),
                            exception_var: None,
                            filter_body: None,
                            body: handler_ast,
                        };
                        if let Some(&ldex) = self.ldexceptions.get(ih) {
                            self.resolve_exception_variable(&mut clause, ldex, &h);
                        }

                        let filter_start = h.filter_start.unwrap_or(h.handler_start);
                        let nested =
                            take_nested(&mut ehs, self.body, filter_start, h.handler_start)?;
                        let mut filter_ids =
                            cut_span(nodes, filter_start, h.handler_start, self.arena);
                        let filter_ast = self.convert(&mut filter_ids, nested)?;
                        clause.filter_body = Some(filter_ast);
                        if let Some(&ldf) = self.ldfilters.get(ih) {
                            self.resolve_filter_value(&mut clause, ldf, &h);
                        }
                        region.catch_clauses.push(clause);
                    }
                }
            }

            for ih in group {
                ehs.remove(&ih);
            }
            ast.push(AstNode::Try(region));
        }

        let flattened = flatten_nodes(self.arena, nodes, self.vars);
        nodes.clear();
        ast.extend(flattened);
        Ok(ast)
    }

    /// Decide how a catch clause binds the automatically pushed exception
    /// value, from the store targets of its synthetic exception load.
    fn resolve_exception_variable(
        &mut self,
        clause: &mut CatchClause,
        ldexception: NodeId,
        h: &crate::instruction::HandlerSpec,
    ) {
        let store_to = self.arena[ldexception].store_to.clone();
        match store_to.as_slice() {
            [] => clause.exception_var = None,
            [single] => {
                if first_is_pop_of(&clause.body, *single) {
                    // The exception is only popped; drop the statement and
                    // leave the value unbound unless configuration insists on
                    // a placeholder for a concrete caught type.
                    clause.body.remove(0);
                    clause.exception_var = self.placeholder_for(h);
                } else {
                    clause.exception_var = Some(*single);
                }
            }
            multiple => {
                let ex = self
                    .vars
                    .alloc(&format!("ex_{:x}", h.handler_start), VariableOrigin::Temporary);
                clause.exception_var = Some(ex);
                for &target in multiple {
                    clause.body.insert(
                        0,
                        AstNode::Expr(Expr::store_var(target, Expr::load_var(ex))),
                    );
                }
            }
        }
    }

    /// Same discipline for the value a filter block starts with; the filter
    /// sees the same exception object the clause binds.
    fn resolve_filter_value(
        &mut self,
        clause: &mut CatchClause,
        ldfilter: NodeId,
        h: &crate::instruction::HandlerSpec,
    ) {
        let store_to = self.arena[ldfilter].store_to.clone();
        let filter_ast = clause.filter_body.as_mut().expect("filter body set");
        match store_to.as_slice() {
            [] => {}
            [single] => {
                if first_is_pop_of(filter_ast, *single) {
                    filter_ast.remove(0);
                } else if clause.exception_var.is_none() {
                    clause.exception_var = Some(*single);
                }
            }
            multiple => {
                let ex = match clause.exception_var {
                    Some(v) => v,
                    None => {
                        let v = self.vars.alloc(
                            &format!("ex_{:x}", h.filter_start.unwrap_or(h.handler_start)),
                            VariableOrigin::Temporary,
                        );
                        clause.exception_var = Some(v);
                        v
                    }
                };
                for &target in multiple {
                    filter_ast.insert(
                        0,
                        AstNode::Expr(Expr::store_var(target, Expr::load_var(ex))),
                    );
                }
            }
        }
    }

    fn placeholder_for(&mut self, h: &crate::instruction::HandlerSpec) -> Option<VarId> {
        let synthesize = self.options.always_name_exception_variable
            && h.caught_type
                .as_ref()
                .map(|t| !t.is_object())
                .unwrap_or(false);
        synthesize.then(|| {
            self.vars
                .alloc(&format!("ex_{:x}", h.handler_start), VariableOrigin::Temporary)
        })
    }
}

/// Whether the first statement merely receives and discards the given
/// variable.
fn first_is_pop_of(body: &[AstNode], var: VarId) -> bool {
    match body.first().and_then(|n| n.as_expr()) {
        Some(e) => {
            e.opcode == OpCode::Pop && e.args.len() == 1 && e.args[0].as_load_local() == Some(var)
        }
        None => false,
    }
}

/// Select the handlers whose try range lies strictly inside `[lo, hi)`,
/// removing them from the remaining set. A try range that intersects the
/// span without nesting is a structural error.
fn take_nested(
    ehs: &mut BTreeSet<usize>,
    body: &MethodBody,
    lo: u32,
    hi: u32,
) -> Result<BTreeSet<usize>, AnalysisAborted> {
    let mut nested = BTreeSet::new();
    for &i in ehs.iter() {
        let h = &body.handlers[i];
        let (s, e) = (h.try_start, h.try_end);
        let contained = (lo <= s && e < hi) || (lo < s && e <= hi);
        if contained {
            nested.insert(i);
            continue;
        }
        let intersects = s < hi && e > lo;
        let contains_span = s <= lo && hi <= e;
        if intersects && !contains_span && !(s == lo && e == hi) {
            return Err(AnalysisAborted::OverlappingRegions {
                first_start: lo,
                second_start: s,
            });
        }
    }
    for i in &nested {
        ehs.remove(i);
    }
    Ok(nested)
}

/// Remove and return all leading nodes with offset below `bound`.
fn cut_range_before(nodes: &mut Vec<NodeId>, bound: u32, arena: &[NodeState]) -> Vec<NodeId> {
    let count = nodes
        .iter()
        .take_while(|&&id| arena[id].offset < bound)
        .count();
    nodes.drain(..count).collect()
}

/// Remove and return the nodes whose offsets fall in `[start, end)`.
fn cut_span(nodes: &mut Vec<NodeId>, start: u32, end: u32, arena: &[NodeState]) -> Vec<NodeId> {
    let begin = nodes
        .iter()
        .take_while(|&&id| arena[id].offset < start)
        .count();
    let count = nodes[begin..]
        .iter()
        .take_while(|&&id| arena[id].offset < end)
        .count();
    nodes.drain(begin..begin + count).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{LabelTable, VariableTable};
    use crate::context::CancellationFlag;
    use crate::instruction::{HandlerSpec, Instruction, MethodBody, Operand};
    use crate::metadata::TypeRef;
    use crate::stack_to_var::AstBuilder;

    fn instr(offset: u32, opcode: OpCode, operand: Operand) -> Instruction {
        Instruction::new(offset, offset + 1, opcode, operand)
    }

    fn catch_handler(try_range: (u32, u32), handler_range: (u32, u32)) -> HandlerSpec {
        HandlerSpec {
            kind: HandlerKind::Catch,
            try_start: try_range.0,
            try_end: try_range.1,
            handler_start: handler_range.0,
            handler_end: handler_range.1,
            filter_start: None,
            caught_type: Some(TypeRef::new("System", "Exception")),
        }
    }

    fn build_with(
        body: &MethodBody,
        options: &ReconstructOptions,
    ) -> Result<(Vec<AstNode>, VariableTable), AnalysisAborted> {
        let mut vars = VariableTable::new();
        let mut labels = LabelTable::new();
        let mut builder = AstBuilder::new();
        let built = builder.build(body, options, &mut vars, &mut labels, &CancellationFlag::new())?;
        Ok((built.nodes, vars))
    }

    fn try_catch_body() -> MethodBody {
        let mut body = MethodBody::new(vec![
            instr(0, OpCode::Nop, Operand::None),
            instr(1, OpCode::Leave, Operand::Target(4)),
            instr(2, OpCode::Pop, Operand::None),
            instr(3, OpCode::Leave, Operand::Target(4)),
            instr(4, OpCode::Return, Operand::None),
        ]);
        body.handlers.push(catch_handler((0, 2), (2, 4)));
        body
    }

    #[test]
    fn test_catch_with_discarded_exception_binds_nothing() {
        let (nodes, _) = build_with(&try_catch_body(), &ReconstructOptions::default()).unwrap();
        let region = nodes
            .iter()
            .find_map(|n| n.as_try())
            .expect("one try region");
        assert_eq!(region.catch_clauses.len(), 1);
        let clause = &region.catch_clauses[0];
        assert_eq!(clause.exception_var, None);
        // The pop-discard statement is optimized away.
        assert!(clause
            .body
            .iter()
            .all(|n| n.as_expr().map(|e| e.opcode != OpCode::Pop).unwrap_or(true)));
    }

    #[test]
    fn test_placeholder_variable_when_configured() {
        let options = ReconstructOptions {
            always_name_exception_variable: true,
            ..ReconstructOptions::default()
        };
        let (nodes, vars) = build_with(&try_catch_body(), &options).unwrap();
        let region = nodes.iter().find_map(|n| n.as_try()).unwrap();
        let var = region.catch_clauses[0].exception_var.expect("placeholder");
        assert!(vars.name(var).starts_with("ex_"));
    }

    #[test]
    fn test_no_placeholder_for_object_catch() {
        let options = ReconstructOptions {
            always_name_exception_variable: true,
            ..ReconstructOptions::default()
        };
        let mut body = try_catch_body();
        body.handlers[0].caught_type = Some(TypeRef::new("System", "Object"));
        let (nodes, _) = build_with(&body, &options).unwrap();
        let region = nodes.iter().find_map(|n| n.as_try()).unwrap();
        assert_eq!(region.catch_clauses[0].exception_var, None);
    }

    #[test]
    fn test_bound_exception_variable_survives() {
        // Handler stores the exception into a local before using it.
        let mut body = MethodBody::new(vec![
            instr(0, OpCode::Nop, Operand::None),
            instr(1, OpCode::Leave, Operand::Target(5)),
            instr(2, OpCode::StoreLocal, Operand::LocalSlot(0)),
            instr(3, OpCode::LoadLocal, Operand::LocalSlot(0)),
            instr(4, OpCode::Throw, Operand::None),
            instr(5, OpCode::Return, Operand::None),
        ]);
        body.local_count = 1;
        body.pinned_locals = vec![false];
        body.handlers.push(catch_handler((0, 2), (2, 5)));

        let (nodes, _) = build_with(&body, &ReconstructOptions::default()).unwrap();
        let region = nodes.iter().find_map(|n| n.as_try()).unwrap();
        assert!(region.catch_clauses[0].exception_var.is_some());
    }

    #[test]
    fn test_nested_regions_form_a_tree() {
        // Outer try [0,6) with catch [6,8); inner try [1,3) with catch [3,5).
        let mut body = MethodBody::new(vec![
            instr(0, OpCode::Nop, Operand::None),
            instr(1, OpCode::Nop, Operand::None),
            instr(2, OpCode::Leave, Operand::Target(8)),
            instr(3, OpCode::Pop, Operand::None),
            instr(4, OpCode::Leave, Operand::Target(8)),
            instr(5, OpCode::Leave, Operand::Target(8)),
            instr(6, OpCode::Pop, Operand::None),
            instr(7, OpCode::Leave, Operand::Target(8)),
            instr(8, OpCode::Return, Operand::None),
        ]);
        body.handlers.push(catch_handler((0, 6), (6, 8)));
        body.handlers.push(catch_handler((1, 3), (3, 5)));

        let (nodes, _) = build_with(&body, &ReconstructOptions::default()).unwrap();
        let outer = nodes.iter().find_map(|n| n.as_try()).expect("outer region");
        let inner = outer
            .try_body
            .iter()
            .find_map(|n| n.as_try())
            .expect("inner region nested in outer try");
        assert_eq!(inner.catch_clauses.len(), 1);
        // No further nesting below the inner region.
        assert!(inner.try_body.iter().all(|n| n.as_try().is_none()));
    }

    #[test]
    fn test_partial_overlap_is_structural_error() {
        let mut body = MethodBody::new(vec![
            instr(0, OpCode::Nop, Operand::None),
            instr(1, OpCode::Nop, Operand::None),
            instr(2, OpCode::Leave, Operand::Target(6)),
            instr(3, OpCode::Pop, Operand::None),
            instr(4, OpCode::Leave, Operand::Target(6)),
            instr(5, OpCode::Nop, Operand::None),
            instr(6, OpCode::Return, Operand::None),
        ]);
        body.handlers.push(catch_handler((0, 2), (3, 5)));
        body.handlers.push(catch_handler((1, 3), (3, 5)));

        let err = build_with(&body, &ReconstructOptions::default()).unwrap_err();
        assert!(matches!(err, AnalysisAborted::OverlappingRegions { .. }));
    }
}
