// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Stack-to-variable builder.
//!
//! Converts a stack-based instruction stream into a variable-based AST by
//! computing use-define chains. A worklist fixpoint assigns every reachable
//! instruction a stack-before and locals-before state; evaluation-stack slots
//! are then materialized as temporary variables, declared local slots are
//! split into independent variables where provably safe, and the flat node
//! list is handed to the region tree builder for exception structuring.
//!
//! States only grow during the fixpoint (reaching-definition sets widen,
//! known locals may degrade to unknown), which guarantees termination.

use std::collections::{BTreeMap, BTreeSet};

use im::Vector;
use itertools::Itertools;
use log::debug;

use crate::ast::{AstNode, BuiltBody, Expr, LabelId, LabelTable, VarId, VariableOrigin, VariableTable};
use crate::context::CancellationFlag;
use crate::errors::AnalysisAborted;
use crate::instruction::{MethodBody, OpCode, Operand, PopBehavior};
use crate::options::ReconstructOptions;
use crate::region_tree;

/// Handle of a node in the builder arena.
pub(crate) type NodeId = usize;

/// One evaluation-stack slot: the set of pushes that may have produced the
/// value, and the variable materialized for it once allocation has run.
/// Slots are replaced, never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StackSlot {
    pub definitions: BTreeSet<NodeId>,
    pub load_from: Option<VarId>,
}

impl StackSlot {
    fn pushed_by(node: NodeId) -> Self {
        let mut definitions = BTreeSet::new();
        definitions.insert(node);
        Self {
            definitions,
            load_from: None,
        }
    }
}

/// Reaching-definition state of one declared local slot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LocalSlotState {
    /// Merge point with no determined writer, entry state, or state after a
    /// transfer that may run finally blocks.
    Unknown,
    Known(BTreeSet<NodeId>),
}

pub(crate) type StackState = Vector<StackSlot>;
pub(crate) type LocalsState = Vector<LocalSlotState>;

/// Arena node: one per decoded instruction, plus synthetic exception loads
/// at handler entries. Owned by the builder during analysis; flattened into
/// AST leaves afterwards.
#[derive(Debug, Clone)]
pub(crate) struct NodeState {
    pub offset: u32,
    pub end_offset: u32,
    pub opcode: OpCode,
    pub operand: Operand,
    pub pops: PopBehavior,
    pub pushes: usize,
    pub next: Option<NodeId>,
    pub label: Option<LabelId>,
    pub stack_before: Option<StackState>,
    pub locals_before: Option<LocalsState>,
    pub store_to: Vec<VarId>,
}

impl NodeState {
    fn effective_pops(&self) -> usize {
        match self.pops {
            PopBehavior::Fixed(n) => n,
            PopBehavior::All => self
                .stack_before
                .as_ref()
                .map(|s| s.len())
                .unwrap_or(0),
        }
    }
}

/// Split-candidate record for one declared local slot. The variable itself
/// is allocated only after use-merging settles, so merged-away candidates
/// never reach the table.
#[derive(Debug)]
struct VariableInfo {
    defs: Vec<NodeId>,
    uses: Vec<NodeId>,
}

/// The stack-to-variable builder. Scratch collections are reused across
/// sequential `build` calls; a builder must not be shared across concurrent
/// callers.
#[derive(Debug, Default)]
pub struct AstBuilder {
    nodes: Vec<NodeState>,
    offset_to_node: BTreeMap<u32, NodeId>,
    agenda: Vec<NodeId>,
    handler_starts: BTreeSet<NodeId>,
    /// Synthetic exception loads per handler index.
    ldexceptions: BTreeMap<usize, NodeId>,
    /// Synthetic exception loads per filter-handler index.
    ldfilters: BTreeMap<usize, NodeId>,
}

impl AstBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.offset_to_node.clear();
        self.agenda.clear();
        self.handler_starts.clear();
        self.ldexceptions.clear();
        self.ldfilters.clear();
    }

    /// Build the variable-based AST for one method body.
    pub fn build(
        &mut self,
        body: &MethodBody,
        options: &ReconstructOptions,
        vars: &mut VariableTable,
        labels: &mut LabelTable,
        cancel: &CancellationFlag,
    ) -> Result<BuiltBody, AnalysisAborted> {
        self.reset();

        let this_var = body
            .has_this
            .then(|| vars.alloc("this", VariableOrigin::This));
        let parameters = body
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let name = p.name.clone().unwrap_or_else(|| format!("arg{}", i));
                vars.alloc(&name, VariableOrigin::Parameter(i))
            })
            .collect_vec();

        if body.instructions.is_empty() {
            return Ok(BuiltBody {
                nodes: Vec::new(),
                parameters,
                this_var,
            });
        }

        self.decode(body);
        self.validate_handlers(body)?;
        self.seed_and_run_fixpoint(body, labels, cancel)?;

        // Instructions never assigned a state are unreachable on every
        // discovered control path; drop them.
        let order: Vec<NodeId> = (0..body.instructions.len())
            .filter(|&id| self.nodes[id].stack_before.is_some())
            .collect();

        self.allocate_stack_temps(&order, vars);
        self.collapse_single_load_temps(&order, vars);
        self.convert_local_slots(body, &order, options, vars);
        self.convert_arguments(body, &order, this_var, &parameters);
        self.convert_branch_operands(&order);

        let nodes = region_tree::build_region_tree(
            &self.nodes,
            &order,
            body,
            &self.ldexceptions,
            &self.ldfilters,
            options,
            vars,
        )?;

        Ok(BuiltBody {
            nodes,
            parameters,
            this_var,
        })
    }

    fn decode(&mut self, body: &MethodBody) {
        for (i, instr) in body.instructions.iter().enumerate() {
            let mut pops = instr.pop_behavior(body.returns_value);
            // Degenerate one-instruction bodies of value-returning methods:
            // nothing can be on the stack, force the pop count to zero.
            if body.instructions.len() == 1 && instr.opcode == OpCode::Return {
                pops = PopBehavior::Fixed(0);
            }
            let next = (i + 1 < body.instructions.len()).then_some(i + 1);
            self.offset_to_node.insert(instr.offset, i);
            self.nodes.push(NodeState {
                offset: instr.offset,
                end_offset: instr.end_offset,
                opcode: instr.opcode,
                operand: instr.operand.clone(),
                pops,
                pushes: instr.push_count(),
                next,
                label: None,
                stack_before: None,
                locals_before: None,
                store_to: Vec::new(),
            });
        }
    }

    fn validate_handlers(&self, body: &MethodBody) -> Result<(), AnalysisAborted> {
        let code_size = body.code_size();
        let boundary_ok = |offset: u32| offset == code_size || self.offset_to_node.contains_key(&offset);
        for h in &body.handlers {
            for offset in [h.try_start, h.handler_start] {
                if !self.offset_to_node.contains_key(&offset) {
                    return Err(AnalysisAborted::UnknownHandlerBoundary { offset });
                }
            }
            if let Some(fs) = h.filter_start {
                if !self.offset_to_node.contains_key(&fs) {
                    return Err(AnalysisAborted::UnknownHandlerBoundary { offset: fs });
                }
            }
            for offset in [h.try_end, h.handler_end] {
                if !boundary_ok(offset) {
                    return Err(AnalysisAborted::UnknownHandlerBoundary { offset });
                }
            }
        }
        Ok(())
    }

    fn unknown_locals(count: usize) -> LocalsState {
        std::iter::repeat(LocalSlotState::Unknown).take(count).collect()
    }

    /// Allocate a synthetic exception-load node; its push is the reaching
    /// definition of the value a catch or filter handler starts with.
    fn alloc_exception_load(&mut self, handler_start: u32, caught: Option<&crate::metadata::TypeRef>) -> NodeId {
        let operand = match caught {
            Some(ty) => Operand::Type(ty.clone()),
            None => Operand::None,
        };
        self.nodes.push(NodeState {
            offset: handler_start,
            end_offset: handler_start,
            opcode: OpCode::LoadException,
            operand,
            pops: PopBehavior::Fixed(0),
            pushes: 1,
            next: None,
            label: None,
            stack_before: None,
            locals_before: None,
            store_to: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn seed_and_run_fixpoint(
        &mut self,
        body: &MethodBody,
        labels: &mut LabelTable,
        cancel: &CancellationFlag,
    ) -> Result<(), AnalysisAborted> {
        let local_count = body.local_count;

        for (ih, h) in body.handlers.iter().enumerate() {
            let hs = self.offset_to_node[&h.handler_start];
            self.handler_starts.insert(hs);
            let mut stack = StackState::new();
            if matches!(
                h.kind,
                crate::instruction::HandlerKind::Catch | crate::instruction::HandlerKind::Filter
            ) {
                let ldex = self.alloc_exception_load(h.handler_start, h.caught_type.as_ref());
                self.ldexceptions.insert(ih, ldex);
                stack.push_back(StackSlot::pushed_by(ldex));
            }
            self.nodes[hs].stack_before = Some(stack);
            self.nodes[hs].locals_before = Some(Self::unknown_locals(local_count));
            self.agenda.push(hs);

            if let Some(fs) = h.filter_start {
                let fsn = self.offset_to_node[&fs];
                let ldex = self.alloc_exception_load(fs, h.caught_type.as_ref());
                self.ldfilters.insert(ih, ldex);
                let mut fstack = StackState::new();
                fstack.push_back(StackSlot::pushed_by(ldex));
                self.nodes[fsn].stack_before = Some(fstack);
                self.nodes[fsn].locals_before = Some(Self::unknown_locals(local_count));
                self.agenda.push(fsn);
            }
        }

        self.nodes[0].stack_before = Some(StackState::new());
        self.nodes[0].locals_before = Some(Self::unknown_locals(local_count));
        self.agenda.push(0);

        while let Some(id) = self.agenda.pop() {
            if cancel.is_cancelled() {
                return Err(AnalysisAborted::Cancelled);
            }

            let stack = self.nodes[id]
                .stack_before
                .clone()
                .expect("enqueued without state");
            let locals = self.nodes[id]
                .locals_before
                .clone()
                .expect("enqueued without state");
            let (pop, pushes, opcode, next, current_offset) = {
                let node = &self.nodes[id];
                (
                    node.effective_pops(),
                    node.pushes,
                    node.opcode,
                    node.next,
                    node.offset,
                )
            };
            if pop > stack.len() {
                return Err(AnalysisAborted::StackDepthMismatch {
                    offset: current_offset,
                });
            }

            let mut new_stack = stack.clone();
            new_stack.truncate(stack.len() - pop);
            for _ in 0..pushes {
                new_stack.push_back(StackSlot::pushed_by(id));
            }

            let mut new_locals = locals.clone();
            if let Some(slot) = self.written_local_slot(id) {
                let mut defs = BTreeSet::new();
                defs.insert(id);
                new_locals.set(slot, LocalSlotState::Known(defs));
            } else if opcode.exits_protected_regions() {
                // Finally blocks running during the transfer may have
                // touched any local.
                new_locals = Self::unknown_locals(local_count);
            }

            let mut successors: Vec<NodeId> = Vec::new();
            if !opcode.is_unconditional_transfer() {
                if let Some(next) = next {
                    // Falling through into a handler start is invalid input
                    // some obfuscators produce; do not propagate into it.
                    if !self.handler_starts.contains(&next) {
                        successors.push(next);
                    }
                }
            }
            let targets = match &self.nodes[id].operand {
                Operand::Target(t) => vec![*t],
                Operand::TargetList(ts) => ts.clone(),
                _ => Vec::new(),
            };
            for t in targets {
                successors.push(t);
                if self.nodes[t].label.is_none() {
                    let label = labels.for_offset(self.nodes[t].offset);
                    self.nodes[t].label = Some(label);
                }
            }
            for succ in successors {
                match self.nodes[succ].stack_before.is_some() {
                    false => {
                        self.nodes[succ].stack_before = Some(new_stack.clone());
                        self.nodes[succ].locals_before = Some(new_locals.clone());
                        self.agenda.push(succ);
                    }
                    true => {
                        let modified = self.merge_into(succ, &new_stack, &new_locals, current_offset)?;
                        if modified {
                            self.agenda.push(succ);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Merge an incoming state into a successor's existing state. Returns
    /// whether the successor state grew.
    fn merge_into(
        &mut self,
        succ: NodeId,
        new_stack: &StackState,
        new_locals: &LocalsState,
        from_offset: u32,
    ) -> Result<bool, AnalysisAborted> {
        let mut modified = false;

        let old_stack = self.nodes[succ].stack_before.as_ref().unwrap();
        if old_stack.len() != new_stack.len() {
            return Err(AnalysisAborted::StackDepthMismatch {
                offset: from_offset,
            });
        }

        let mut merged_stack = old_stack.clone();
        for i in 0..new_stack.len() {
            let old_slot = merged_stack.get(i).unwrap().clone();
            let incoming = new_stack.get(i).unwrap();
            let union: BTreeSet<NodeId> = old_slot
                .definitions
                .union(&incoming.definitions)
                .copied()
                .collect();
            if union.len() > old_slot.definitions.len() {
                merged_stack.set(
                    i,
                    StackSlot {
                        definitions: union,
                        load_from: old_slot.load_from,
                    },
                );
                modified = true;
            }
        }

        let old_locals = self.nodes[succ].locals_before.as_ref().unwrap();
        let mut merged_locals = old_locals.clone();
        for i in 0..new_locals.len() {
            let old_slot = merged_locals.get(i).unwrap().clone();
            if let LocalSlotState::Known(old_defs) = old_slot {
                match new_locals.get(i).unwrap() {
                    LocalSlotState::Unknown => {
                        merged_locals.set(i, LocalSlotState::Unknown);
                        modified = true;
                    }
                    LocalSlotState::Known(new_defs) => {
                        let union: BTreeSet<NodeId> =
                            old_defs.union(new_defs).copied().collect();
                        if union.len() > old_defs.len() {
                            merged_locals.set(i, LocalSlotState::Known(union));
                            modified = true;
                        }
                    }
                }
            }
        }

        if modified {
            self.nodes[succ].stack_before = Some(merged_stack);
            self.nodes[succ].locals_before = Some(merged_locals);
        }
        Ok(modified)
    }

    /// The declared local slot this node writes, if it is a definition.
    /// A local-address load immediately consumed by object initialization
    /// counts as a definition of the slot.
    fn written_local_slot(&self, id: NodeId) -> Option<usize> {
        let node = &self.nodes[id];
        match (node.opcode, &node.operand) {
            (OpCode::StoreLocal, Operand::LocalSlot(slot)) => Some(*slot),
            (OpCode::LoadLocalAddress, Operand::LocalSlot(slot)) => {
                let next = node.next?;
                (self.nodes[next].opcode == OpCode::InitObject).then_some(*slot)
            }
            _ => None,
        }
    }

    /// Materialize one temporary per stack position consumed by each
    /// reachable node and record it in the store-target lists of every
    /// reaching definition.
    fn allocate_stack_temps(&mut self, order: &[NodeId], vars: &mut VariableTable) {
        for &id in order {
            let pop = self.nodes[id].effective_pops();
            let len = self.nodes[id].stack_before.as_ref().unwrap().len();
            for i in (len - pop)..len {
                let tmp = vars.fresh_temp();
                let slot = {
                    let sb = self.nodes[id].stack_before.as_mut().unwrap();
                    let mut slot = sb.get(i).unwrap().clone();
                    slot.load_from = Some(tmp);
                    sb.set(i, slot.clone());
                    slot
                };
                for def in slot.definitions {
                    self.nodes[def].store_to.push(tmp);
                }
            }
        }
    }

    /// Collapse several store targets of one push into a single temporary
    /// when every target has exactly one load and that load's sole reaching
    /// definition is this push. Undoes duplicate-then-use-twice patterns.
    fn collapse_single_load_temps(&mut self, order: &[NodeId], vars: &mut VariableTable) {
        for idx in 0..order.len() {
            let id = order[idx];
            if self.nodes[id].store_to.len() <= 1 {
                continue;
            }
            let targets: BTreeSet<VarId> = self.nodes[id].store_to.iter().copied().collect();
            let mut single_store = true;
            'targets: for &v in &targets {
                let mut loads = 0usize;
                for &n in order {
                    let sb = self.nodes[n].stack_before.as_ref().unwrap();
                    for slot in sb.iter() {
                        if slot.load_from == Some(v) {
                            loads += 1;
                            if loads > 1
                                || slot.definitions.len() != 1
                                || !slot.definitions.contains(&id)
                            {
                                single_store = false;
                                break 'targets;
                            }
                        }
                    }
                }
                if loads != 1 {
                    single_store = false;
                    break;
                }
            }
            if !single_store {
                continue;
            }

            let merged = vars.fresh_temp();
            self.nodes[id].store_to = vec![merged];
            for &n in order {
                let sb = self.nodes[n].stack_before.as_mut().unwrap();
                for i in 0..sb.len() {
                    let slot = sb.get(i).unwrap();
                    if slot
                        .load_from
                        .map(|v| targets.contains(&v))
                        .unwrap_or(false)
                    {
                        let mut slot = slot.clone();
                        slot.load_from = Some(merged);
                        sb.set(i, slot);
                    }
                }
            }
        }
    }

    /// Separate declared local slots into independent variables where no use
    /// can observe more than one writer; fall back to a single variable per
    /// slot otherwise.
    fn convert_local_slots(
        &mut self,
        body: &MethodBody,
        order: &[NodeId],
        options: &ReconstructOptions,
        vars: &mut VariableTable,
    ) {
        for slot in 0..body.local_count {
            let mut defs: Vec<NodeId> = Vec::new();
            let mut uses: Vec<NodeId> = Vec::new();
            for &id in order {
                if self.nodes[id].operand != Operand::LocalSlot(slot) {
                    continue;
                }
                if self.written_local_slot(id) == Some(slot) {
                    defs.push(id);
                } else {
                    uses.push(id);
                }
            }
            if defs.is_empty() && uses.is_empty() {
                continue;
            }

            let pinned = body.pinned_locals.get(slot).copied().unwrap_or(false);
            let unsound_use = uses.iter().any(|&u| {
                let state = self.nodes[u].locals_before.as_ref().unwrap().get(slot).unwrap().clone();
                matches!(state, LocalSlotState::Unknown)
                    || (self.nodes[u].opcode == OpCode::LoadLocalAddress
                        && !self.is_deterministic_address_use(u))
            });

            let infos: Vec<VariableInfo> = if !options.expand_local_slots || pinned || unsound_use {
                vec![VariableInfo { defs, uses }]
            } else {
                let mut infos: Vec<VariableInfo> = defs
                    .iter()
                    .map(|&def| VariableInfo {
                        defs: vec![def],
                        uses: Vec::new(),
                    })
                    .collect();

                for &u in &uses {
                    let state = self.nodes[u].locals_before.as_ref().unwrap().get(slot).unwrap().clone();
                    let use_defs = match state {
                        LocalSlotState::Known(d) => d,
                        LocalSlotState::Unknown => unreachable!("unsound uses handled above"),
                    };
                    if use_defs.len() == 1 {
                        let def = *use_defs.iter().next().unwrap();
                        let info = infos
                            .iter_mut()
                            .find(|i| i.defs.contains(&def))
                            .expect("reaching definition has a variable");
                        info.uses.push(u);
                    } else {
                        // Ambiguous reaching definitions: merge every
                        // candidate variable into one.
                        let (merge, keep): (Vec<VariableInfo>, Vec<VariableInfo>) = infos
                            .into_iter()
                            .partition(|i| i.defs.iter().any(|d| use_defs.contains(d)));
                        let mut merged = VariableInfo {
                            defs: merge.iter().flat_map(|i| i.defs.clone()).collect(),
                            uses: merge.iter().flat_map(|i| i.uses.clone()).collect(),
                        };
                        merged.uses.push(u);
                        infos = keep;
                        infos.push(merged);
                    }
                }
                infos
            };

            let split = infos.len() > 1;
            for info in infos {
                let name = if split {
                    let first_def = info.defs.first().copied();
                    match first_def {
                        Some(def) => format!("loc{}_{:x}", slot, self.nodes[def].offset),
                        None => format!("loc{}", slot),
                    }
                } else {
                    format!("loc{}", slot)
                };
                let var = vars.alloc(&name, VariableOrigin::LocalSlot(slot));
                for id in info.defs.into_iter().chain(info.uses) {
                    self.nodes[id].operand = Operand::Var(var);
                }
            }
        }
    }

    /// Whether a local-address load is consumed by a deterministic pattern
    /// (object initialization, field access or an instance call on the
    /// address) without the address surviving a transfer or a re-access of
    /// the same slot. Anything else may alias the slot unpredictably.
    fn is_deterministic_address_use(&self, id: NodeId) -> bool {
        let slot_operand = self.nodes[id].operand.clone();
        let mut cursor = match self.nodes[id].next {
            Some(n) => n,
            None => return false,
        };
        if self.nodes[cursor].opcode == OpCode::InitObject {
            return true;
        }

        let mut depth: i64 = 1;
        loop {
            let node = &self.nodes[cursor];
            let pops = match node.pops {
                PopBehavior::All => return false,
                PopBehavior::Fixed(n) => n as i64,
            };
            depth -= pops;
            if depth == 0 {
                break;
            }
            if depth < 0 {
                return false;
            }
            if node.opcode.is_unconditional_transfer()
                || node.opcode.is_conditional_branch()
                || node.opcode == OpCode::Switch
            {
                return false;
            }
            if matches!(
                node.opcode,
                OpCode::LoadLocal | OpCode::LoadLocalAddress | OpCode::StoreLocal
            ) && node.operand == slot_operand
            {
                return false;
            }
            depth += node.pushes as i64;
            cursor = match node.next {
                Some(n) => n,
                None => return false,
            };
        }

        let consumer = &self.nodes[cursor];
        match consumer.opcode {
            OpCode::LoadField | OpCode::StoreField => true,
            OpCode::Call | OpCode::CallVirtual => consumer
                .operand
                .as_method()
                .map(|m| m.has_this)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Replace argument accesses with parameter variables.
    fn convert_arguments(
        &mut self,
        body: &MethodBody,
        order: &[NodeId],
        this_var: Option<VarId>,
        parameters: &[VarId],
    ) {
        for &id in order {
            let node = &self.nodes[id];
            let (new_opcode, index) = match (node.opcode, &node.operand) {
                (OpCode::LoadArg, Operand::Argument(i)) => (OpCode::LoadLocal, *i),
                (OpCode::StoreArg, Operand::Argument(i)) => (OpCode::StoreLocal, *i),
                (OpCode::LoadArgAddress, Operand::Argument(i)) => (OpCode::LoadLocalAddress, *i),
                _ => continue,
            };
            let var = if body.has_this {
                if index == 0 {
                    this_var.expect("this parameter present")
                } else {
                    parameters[index - 1]
                }
            } else {
                parameters[index]
            };
            self.nodes[id].opcode = new_opcode;
            self.nodes[id].operand = Operand::Var(var);
        }
    }

    /// Rewrite branch-target operands to labels assigned during the
    /// fixpoint.
    fn convert_branch_operands(&mut self, order: &[NodeId]) {
        for &id in order {
            let new_operand = match &self.nodes[id].operand {
                Operand::Target(t) => {
                    Operand::Label(self.nodes[*t].label.expect("branch target has label"))
                }
                Operand::TargetList(ts) => Operand::LabelList(
                    ts.iter()
                        .map(|&t| self.nodes[t].label.expect("branch target has label"))
                        .collect(),
                ),
                _ => continue,
            };
            self.nodes[id].operand = new_operand;
        }
    }
}

/// Convert a run of prepared nodes into flat AST leaves: a label where one
/// was assigned, the expression with its consumed slots referenced through
/// their temporaries, and stores for every target the pushed value must
/// reach.
pub(crate) fn flatten_nodes(
    arena: &[NodeState],
    ids: &[NodeId],
    vars: &mut VariableTable,
) -> Vec<AstNode> {
    let mut ast = Vec::with_capacity(ids.len());
    for &id in ids {
        let node = &arena[id];
        if let Some(label) = node.label {
            ast.push(AstNode::Label(label));
        }

        let pop = node.effective_pops();
        let sb = node.stack_before.as_ref().expect("reachable node");
        let args = (sb.len() - pop..sb.len())
            .map(|i| {
                let slot = sb.get(i).unwrap();
                Expr::load_var(slot.load_from.expect("temporary allocated"))
            })
            .collect_vec();
        let expr = Expr::new(node.opcode, node.operand.clone(), args)
            .with_range((node.offset, node.end_offset));

        match node.store_to.as_slice() {
            [] => ast.push(AstNode::Expr(expr)),
            [single] => ast.push(AstNode::Expr(Expr::store_var(*single, expr))),
            multiple => {
                let tmp = vars.fresh_temp();
                ast.push(AstNode::Expr(Expr::store_var(tmp, expr)));
                for &target in multiple.iter().rev() {
                    ast.push(AstNode::Expr(Expr::store_var(target, Expr::load_var(tmp))));
                }
            }
        }
    }
    debug!("[flatten] emitted {} ast nodes from {} bytecodes", ast.len(), ids.len());
    ast
}
