// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Symbolic state-interval analysis.
//!
//! The state field of a compiler-generated state machine is treated as a
//! symbolic integer. Walking a body instruction by instruction, the analysis
//! maintains the set of integer intervals of the state value for which each
//! program point is reachable, splitting the set at every conditional branch
//! on the state. Calls into nested finally-helper methods are recorded with
//! the interval set in force rather than being inlined.
//!
//! Two modes share the walk: disposal analysis covers the whole method and
//! must understand every instruction it meets; resume analysis covers only
//! the leading state dispatch and stops at the first instruction that is not
//! part of it.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::ast::{AstNode, Expr, LabelId, VarId};
use crate::errors::{mismatch, PatternMismatch};
use crate::instruction::{OpCode, Operand};
use crate::metadata::{FieldRef, MethodRef};

/// An immutable set of closed integer intervals; the set of state values for
/// which a program point is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateRange {
    intervals: Vec<(i64, i64)>,
}

impl StateRange {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            intervals: vec![(i64::MIN, i64::MAX)],
        }
    }

    pub fn single(value: i64) -> Self {
        Self {
            intervals: vec![(value, value)],
        }
    }

    pub fn interval(lo: i64, hi: i64) -> Self {
        if lo > hi {
            Self::empty()
        } else {
            Self {
                intervals: vec![(lo, hi)],
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn contains(&self, value: i64) -> bool {
        self.intervals.iter().any(|&(lo, hi)| lo <= value && value <= hi)
    }

    pub fn union_with(&mut self, other: &StateRange) {
        if other.is_empty() {
            return;
        }
        self.intervals.extend_from_slice(&other.intervals);
        self.intervals.sort_unstable();
        let mut merged: Vec<(i64, i64)> = Vec::with_capacity(self.intervals.len());
        for &(lo, hi) in &self.intervals {
            match merged.last_mut() {
                Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
                _ => merged.push((lo, hi)),
            }
        }
        self.intervals = merged;
    }

    /// Intersection.
    pub fn meet(&self, other: &StateRange) -> StateRange {
        let mut out = Vec::new();
        for &(a_lo, a_hi) in &self.intervals {
            for &(b_lo, b_hi) in &other.intervals {
                let lo = a_lo.max(b_lo);
                let hi = a_hi.min(b_hi);
                if lo <= hi {
                    out.push((lo, hi));
                }
            }
        }
        StateRange { intervals: out }
    }

    /// All values not in this set.
    pub fn complement(&self) -> StateRange {
        let mut out = Vec::new();
        let mut cursor = i64::MIN;
        let mut open = true;
        for &(lo, hi) in &self.intervals {
            if lo > cursor {
                out.push((cursor, lo - 1));
            }
            if hi == i64::MAX {
                open = false;
                break;
            }
            cursor = hi + 1;
        }
        if open {
            out.push((cursor, i64::MAX));
        }
        StateRange { intervals: out }
    }
}

impl fmt::Display for StateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .intervals
            .iter()
            .map(|&(lo, hi)| {
                if lo == hi {
                    format!("{}", lo)
                } else {
                    format!("{}..{}", lo, hi)
                }
            })
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Symbolic value of an expression relative to the state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sym {
    /// `state + offset`
    State(i64),
    Const(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRangeMode {
    /// Whole-method walk of a disposal body; every instruction must be
    /// understood.
    Dispose,
    /// Prefix walk of a resume body; stops at the first instruction that is
    /// not state dispatch.
    Resume,
}

pub struct StateRangeAnalysis {
    mode: StateRangeMode,
    state_field: FieldRef,
    this_var: VarId,
    /// Locals caching the state value, with the offset they carry.
    cached_state: BTreeMap<VarId, i64>,
    /// Per-node reachability ranges of the most recently analyzed body.
    ranges: Vec<StateRange>,
    /// Finally-helper methods and the state ranges their callers were
    /// reachable under.
    pub finally_to_range: BTreeMap<MethodRef, StateRange>,
}

impl StateRangeAnalysis {
    pub fn new(mode: StateRangeMode, state_field: FieldRef, this_var: VarId) -> Self {
        Self {
            mode,
            state_field,
            this_var,
            cached_state: BTreeMap::new(),
            ranges: Vec::new(),
            finally_to_range: BTreeMap::new(),
        }
    }

    /// Walk a body slice, seeding the entry with `entry`. In resume mode the
    /// returned position is the first node past the state dispatch; in
    /// dispose mode the walk covers everything and the position is the body
    /// length.
    pub fn assign_ranges(
        &mut self,
        body: &[AstNode],
        entry: StateRange,
    ) -> Result<usize, PatternMismatch> {
        self.ranges = vec![StateRange::empty(); body.len()];
        if body.is_empty() {
            return Ok(0);
        }
        self.ranges[0] = entry;

        let label_index: BTreeMap<LabelId, usize> = body
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_label().map(|l| (l, i)))
            .collect();

        for i in 0..body.len() {
            let range = self.ranges[i].clone();
            match &body[i] {
                AstNode::Label(_) => {
                    self.flow_to(i + 1, &range);
                }
                AstNode::Try(region) => match self.mode {
                    StateRangeMode::Dispose => {
                        self.assign_region(region, &range)?;
                        self.flow_to(i + 1, &range);
                    }
                    StateRangeMode::Resume => return Ok(i),
                },
                AstNode::Expr(e) => {
                    if range.is_empty() && self.mode == StateRangeMode::Resume {
                        // Dispatch never reaches this point; it is past the
                        // prologue.
                        return Ok(i);
                    }
                    match self.step(e, &range, &label_index)? {
                        Step::FallThrough => self.flow_to(i + 1, &range),
                        Step::FallThroughWith(r) => self.flow_to(i + 1, &r),
                        Step::End => {}
                        Step::Stop => {
                            debug!("[state-range] dispatch ends at node {}", i);
                            return Ok(i);
                        }
                    }
                }
            }
        }
        Ok(body.len())
    }

    /// One instruction of the walk.
    fn step(
        &mut self,
        e: &Expr,
        range: &StateRange,
        label_index: &BTreeMap<LabelId, usize>,
    ) -> Result<Step, PatternMismatch> {
        match e.opcode {
            OpCode::Nop => Ok(Step::FallThrough),
            OpCode::StoreLocal => {
                let value = e.args.first().and_then(|a| self.eval(a));
                match (e.operand.as_var(), value) {
                    (Some(var), Some(Sym::State(offset))) => {
                        self.cached_state.insert(var, offset);
                        Ok(Step::FallThrough)
                    }
                    _ => self.not_dispatch("store of non-state value"),
                }
            }
            OpCode::StoreField => {
                // Disposal bodies may reset the state field; the symbolic
                // value is not tracked through it. In a resume body a state
                // store is already past the dispatch.
                if self.mode == StateRangeMode::Dispose
                    && e.operand.as_field() == Some(&self.state_field)
                {
                    Ok(Step::FallThrough)
                } else {
                    self.not_dispatch("store to a field")
                }
            }
            OpCode::Branch => {
                let target = e.operand.as_label().expect("branch label");
                self.flow_to_label(target, range, label_index)?;
                Ok(Step::End)
            }
            OpCode::Leave => {
                let target = e.operand.as_label().expect("leave label");
                self.flow_to_label(target, range, label_index)?;
                Ok(Step::End)
            }
            OpCode::BranchIfTrue
            | OpCode::BranchIfFalse
            | OpCode::BranchEq
            | OpCode::BranchNe
            | OpCode::BranchLt
            | OpCode::BranchLe
            | OpCode::BranchGt
            | OpCode::BranchGe => {
                let (taken, fallthrough) = match self.split_condition(e, range) {
                    Some(split) => split,
                    None => return self.not_dispatch("branch condition not on state"),
                };
                let target = e.operand.as_label().expect("branch label");
                self.flow_to_label(target, &taken, label_index)?;
                Ok(Step::FallThroughWith(fallthrough))
            }
            OpCode::Switch => {
                let value = match self.eval(&e.args[0]) {
                    Some(Sym::State(offset)) => offset,
                    _ => return self.not_dispatch("switch on non-state value"),
                };
                let targets = match &e.operand {
                    Operand::LabelList(ls) => ls.clone(),
                    _ => return mismatch("switch without label list"),
                };
                for (case, target) in targets.iter().enumerate() {
                    let case_range = range.meet(&StateRange::single(case as i64 - value));
                    self.flow_to_label(*target, &case_range, label_index)?;
                }
                let covered = StateRange::interval(-value, targets.len() as i64 - 1 - value);
                Ok(Step::FallThroughWith(range.meet(&covered.complement())))
            }
            OpCode::Call | OpCode::CallVirtual => {
                let method = match e.operand.as_method() {
                    Some(m) => m.clone(),
                    None => return self.not_dispatch("call without method operand"),
                };
                let on_this = e.args.len() == 1 && e.args[0].loads_var(self.this_var);
                if self.mode == StateRangeMode::Dispose && on_this && !method.returns_value {
                    self.finally_to_range
                        .entry(method)
                        .or_insert_with(StateRange::empty)
                        .union_with(range);
                    Ok(Step::FallThrough)
                } else {
                    self.not_dispatch("call is not a finally helper")
                }
            }
            OpCode::Return | OpCode::EndFinally | OpCode::YieldBreak => match self.mode {
                StateRangeMode::Dispose => Ok(Step::End),
                StateRangeMode::Resume => Ok(Step::Stop),
            },
            _ => self.not_dispatch("instruction outside the dispatch vocabulary"),
        }
    }

    fn not_dispatch(&self, reason: &'static str) -> Result<Step, PatternMismatch> {
        match self.mode {
            StateRangeMode::Dispose => mismatch(reason),
            StateRangeMode::Resume => Ok(Step::Stop),
        }
    }

    /// Walk a nested region of a disposal body. The finally part must be
    /// exactly a call to a finally helper followed by the region exit; the
    /// helper inherits the entry range of the region.
    fn assign_region(
        &mut self,
        region: &crate::ast::TryRegion,
        entry: &StateRange,
    ) -> Result<(), PatternMismatch> {
        if !region.catch_clauses.is_empty() || region.fault_body.is_some() {
            return Err(PatternMismatch("disposal region with catch or fault handler"));
        }
        let finally = match &region.finally_body {
            Some(b) => b,
            None => return Err(PatternMismatch("disposal region without finally")),
        };

        let exprs: Vec<&Expr> = finally.iter().filter_map(|n| n.as_expr()).collect();
        match exprs.as_slice() {
            [call, end]
                if call.opcode == OpCode::Call
                    && call.args.len() == 1
                    && call.args[0].loads_var(self.this_var)
                    && end.opcode == OpCode::EndFinally =>
            {
                let method = call
                    .operand
                    .as_method()
                    .ok_or(PatternMismatch("finally call without method"))?
                    .clone();
                if self.finally_to_range.contains_key(&method) {
                    return Err(PatternMismatch("finally helper recorded twice"));
                }
                self.finally_to_range.insert(method, entry.clone());
            }
            _ => return Err(PatternMismatch("finally is not a single helper call")),
        }

        // The nested analysis gets its own per-node ranges but shares the
        // helper table and state caches.
        let mut nested = StateRangeAnalysis {
            mode: self.mode,
            state_field: self.state_field.clone(),
            this_var: self.this_var,
            cached_state: self.cached_state.clone(),
            ranges: Vec::new(),
            finally_to_range: std::mem::take(&mut self.finally_to_range),
        };
        let result = nested.assign_ranges(&region.try_body, entry.clone());
        self.finally_to_range = nested.finally_to_range;
        result.map(|_| ())
    }

    fn flow_to(&mut self, index: usize, range: &StateRange) {
        if index < self.ranges.len() {
            self.ranges[index].union_with(range);
        }
    }

    fn flow_to_label(
        &mut self,
        label: LabelId,
        range: &StateRange,
        label_index: &BTreeMap<LabelId, usize>,
    ) -> Result<(), PatternMismatch> {
        match label_index.get(&label) {
            Some(&i) => {
                self.ranges[i].union_with(range);
                Ok(())
            }
            None => match self.mode {
                // A jump out of the analyzed slice carries no dispatch
                // information.
                StateRangeMode::Resume => Ok(()),
                StateRangeMode::Dispose => mismatch("branch target outside disposal body"),
            },
        }
    }

    /// Split a conditional branch into (taken, fallthrough) state sets.
    fn split_condition(&self, e: &Expr, range: &StateRange) -> Option<(StateRange, StateRange)> {
        let (true_set, false_set) = match e.opcode {
            OpCode::BranchIfTrue => self.truth_sets(&e.args[0])?,
            OpCode::BranchIfFalse => {
                let (t, f) = self.truth_sets(&e.args[0])?;
                (f, t)
            }
            OpCode::BranchEq => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Eq)?,
            OpCode::BranchNe => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Ne)?,
            OpCode::BranchLt => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Lt)?,
            OpCode::BranchLe => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Le)?,
            OpCode::BranchGt => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Gt)?,
            OpCode::BranchGe => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Ge)?,
            _ => return None,
        };
        Some((range.meet(&true_set), range.meet(&false_set)))
    }

    /// (truthy, falsy) state sets of a boolean expression.
    fn truth_sets(&self, e: &Expr) -> Option<(StateRange, StateRange)> {
        match e.opcode {
            OpCode::CompareEq => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Eq),
            OpCode::CompareGt => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Gt),
            OpCode::CompareLt => self.comparison_sets(&e.args[0], &e.args[1], Cmp::Lt),
            _ => match self.eval(e) {
                // brtrue on the state value itself: nonzero is truthy.
                Some(Sym::State(offset)) => {
                    let zero = StateRange::single(-offset);
                    Some((zero.complement(), zero))
                }
                _ => None,
            },
        }
    }

    fn comparison_sets(&self, a: &Expr, b: &Expr, cmp: Cmp) -> Option<(StateRange, StateRange)> {
        let (offset, constant, cmp) = match (self.eval(a)?, self.eval(b)?) {
            (Sym::State(o), Sym::Const(c)) => (o, c, cmp),
            (Sym::Const(c), Sym::State(o)) => (o, c, cmp.flip()),
            _ => return None,
        };
        // state + offset <cmp> constant
        let pivot = constant - offset;
        let true_set = match cmp {
            Cmp::Eq => StateRange::single(pivot),
            Cmp::Ne => StateRange::single(pivot).complement(),
            Cmp::Lt => StateRange::interval(i64::MIN, pivot - 1),
            Cmp::Le => StateRange::interval(i64::MIN, pivot),
            Cmp::Gt => StateRange::interval(pivot + 1, i64::MAX),
            Cmp::Ge => StateRange::interval(pivot, i64::MAX),
        };
        let false_set = true_set.complement();
        Some((true_set, false_set))
    }

    fn eval(&self, e: &Expr) -> Option<Sym> {
        match e.opcode {
            OpCode::LoadConstI32 => match e.operand {
                Operand::I32(v) => Some(Sym::Const(v as i64)),
                _ => None,
            },
            OpCode::LoadConstI64 => match e.operand {
                Operand::I64(v) => Some(Sym::Const(v)),
                _ => None,
            },
            OpCode::LoadField => {
                let on_this = e.args.len() == 1 && e.args[0].loads_var(self.this_var);
                (on_this && e.operand.as_field() == Some(&self.state_field))
                    .then_some(Sym::State(0))
            }
            OpCode::LoadLocal => {
                let var = e.operand.as_var()?;
                self.cached_state.get(&var).map(|&o| Sym::State(o))
            }
            OpCode::Sub => match (self.eval(&e.args[0])?, self.eval(&e.args[1])?) {
                (Sym::State(o), Sym::Const(c)) => Some(Sym::State(o - c)),
                (Sym::Const(a), Sym::Const(b)) => Some(Sym::Const(a - b)),
                _ => None,
            },
            OpCode::Add => match (self.eval(&e.args[0])?, self.eval(&e.args[1])?) {
                (Sym::State(o), Sym::Const(c)) | (Sym::Const(c), Sym::State(o)) => {
                    Some(Sym::State(o + c))
                }
                (Sym::Const(a), Sym::Const(b)) => Some(Sym::Const(a + b)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Labels of the analyzed body with the state ranges that reach them.
    /// Labels past the analyzed span have no range and are skipped.
    pub fn label_ranges(&self, body: &[AstNode]) -> Vec<(LabelId, StateRange)> {
        body.iter()
            .enumerate()
            .filter_map(|(i, n)| {
                let range = self.ranges.get(i)?.clone();
                n.as_label().map(|l| (l, range))
            })
            .collect()
    }

    /// Range reaching a node position.
    pub fn range_at(&self, index: usize) -> &StateRange {
        &self.ranges[index]
    }

    /// Make sure body conversion can start at a label: back up onto an
    /// existing one, or insert a fresh label carrying the fall-through
    /// range. Returns the adjusted position and the label-range mapping.
    pub fn ensure_label_at(
        &self,
        body: &mut Vec<AstNode>,
        pos: usize,
        labels: &mut crate::ast::LabelTable,
    ) -> (usize, Vec<(LabelId, StateRange)>) {
        let mut mapping = self.label_ranges(body);
        if pos > 0 && body[pos - 1].as_label().is_some() {
            return (pos - 1, mapping);
        }
        let fresh = labels.named("resume_entry");
        let range = self
            .ranges
            .get(pos)
            .cloned()
            .unwrap_or_else(StateRange::full);
        mapping.push((fresh, range));
        body.insert(pos, AstNode::Label(fresh));
        (pos, mapping)
    }
}

enum Step {
    FallThrough,
    FallThroughWith(StateRange),
    End,
    Stop,
}

#[derive(Debug, Clone, Copy)]
enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    /// Mirror the comparison when operands are swapped.
    fn flip(self) -> Cmp {
        match self {
            Cmp::Eq => Cmp::Eq,
            Cmp::Ne => Cmp::Ne,
            Cmp::Lt => Cmp::Gt,
            Cmp::Le => Cmp::Ge,
            Cmp::Gt => Cmp::Lt,
            Cmp::Ge => Cmp::Le,
        }
    }
}
