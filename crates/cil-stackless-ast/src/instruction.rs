// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Decoded instruction model.
//!
//! The loader has already folded prefixes and macro forms into canonical
//! opcodes and resolved every operand to a stable identity, so this crate
//! never re-parses raw bytes. Branch operands arrive as instruction indices
//! ([`InstrId`]) and are rewritten to labels during AST construction.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::ast::{LabelId, VarId};
use crate::metadata::{FieldRef, MethodRef, TypeRef};

/// Index of an instruction in its method body.
pub type InstrId = usize;

/// Canonical opcode set after prefix/macro folding, plus the pseudo opcodes
/// the analyses introduce (`LoadException` for handler entry, `Await`,
/// `YieldReturn` and `YieldBreak` for reconstructed state machines).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum OpCode {
    Nop,
    Pop,
    Duplicate,
    LoadConstI32,
    LoadConstI64,
    LoadConstF64,
    LoadConstString,
    LoadNull,
    LoadLocal,
    StoreLocal,
    LoadLocalAddress,
    LoadArg,
    StoreArg,
    LoadArgAddress,
    LoadField,
    StoreField,
    LoadFieldAddress,
    LoadStaticField,
    StoreStaticField,
    NewObject,
    InitObject,
    Call,
    CallVirtual,
    Return,
    Branch,
    BranchIfTrue,
    BranchIfFalse,
    BranchEq,
    BranchNe,
    BranchLt,
    BranchLe,
    BranchGt,
    BranchGe,
    Switch,
    Leave,
    EndFinally,
    EndFilter,
    Throw,
    Rethrow,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Not,
    Neg,
    Shl,
    Shr,
    CompareEq,
    CompareGt,
    CompareLt,
    Convert,
    Cast,
    Box,
    Unbox,
    LoadElement,
    StoreElement,
    LoadLength,
    // Pseudo opcodes; never present in loader input.
    LoadException,
    Await,
    YieldReturn,
    YieldBreak,
}

static MNEMONICS: Lazy<BTreeMap<OpCode, &'static str>> = Lazy::new(|| {
    use OpCode::*;
    [
        (Nop, "nop"),
        (Pop, "pop"),
        (Duplicate, "dup"),
        (LoadConstI32, "ldc.i4"),
        (LoadConstI64, "ldc.i8"),
        (LoadConstF64, "ldc.r8"),
        (LoadConstString, "ldstr"),
        (LoadNull, "ldnull"),
        (LoadLocal, "ldloc"),
        (StoreLocal, "stloc"),
        (LoadLocalAddress, "ldloca"),
        (LoadArg, "ldarg"),
        (StoreArg, "starg"),
        (LoadArgAddress, "ldarga"),
        (LoadField, "ldfld"),
        (StoreField, "stfld"),
        (LoadFieldAddress, "ldflda"),
        (LoadStaticField, "ldsfld"),
        (StoreStaticField, "stsfld"),
        (NewObject, "newobj"),
        (InitObject, "initobj"),
        (Call, "call"),
        (CallVirtual, "callvirt"),
        (Return, "ret"),
        (Branch, "br"),
        (BranchIfTrue, "brtrue"),
        (BranchIfFalse, "brfalse"),
        (BranchEq, "beq"),
        (BranchNe, "bne"),
        (BranchLt, "blt"),
        (BranchLe, "ble"),
        (BranchGt, "bgt"),
        (BranchGe, "bge"),
        (Switch, "switch"),
        (Leave, "leave"),
        (EndFinally, "endfinally"),
        (EndFilter, "endfilter"),
        (Throw, "throw"),
        (Rethrow, "rethrow"),
        (Add, "add"),
        (Sub, "sub"),
        (Mul, "mul"),
        (Div, "div"),
        (Rem, "rem"),
        (And, "and"),
        (Or, "or"),
        (Xor, "xor"),
        (Not, "not"),
        (Neg, "neg"),
        (Shl, "shl"),
        (Shr, "shr"),
        (CompareEq, "ceq"),
        (CompareGt, "cgt"),
        (CompareLt, "clt"),
        (Convert, "conv"),
        (Cast, "castclass"),
        (Box, "box"),
        (Unbox, "unbox"),
        (LoadElement, "ldelem"),
        (StoreElement, "stelem"),
        (LoadLength, "ldlen"),
        (LoadException, "ldexception"),
        (Await, "await"),
        (YieldReturn, "yield.return"),
        (YieldBreak, "yield.break"),
    ]
    .into_iter()
    .collect()
});

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        MNEMONICS.get(&self).copied().unwrap_or("???")
    }

    /// Control never falls through to the next instruction.
    pub fn is_unconditional_transfer(self) -> bool {
        matches!(
            self,
            OpCode::Branch
                | OpCode::Leave
                | OpCode::Return
                | OpCode::Throw
                | OpCode::Rethrow
                | OpCode::EndFinally
                | OpCode::EndFilter
                | OpCode::YieldBreak
        )
    }

    /// Transfer that exits all protected regions in flight; any finally
    /// blocks run before the target, so locals must be treated as unknown
    /// past it.
    pub fn exits_protected_regions(self) -> bool {
        matches!(self, OpCode::Leave)
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            OpCode::BranchIfTrue
                | OpCode::BranchIfFalse
                | OpCode::BranchEq
                | OpCode::BranchNe
                | OpCode::BranchLt
                | OpCode::BranchLe
                | OpCode::BranchGt
                | OpCode::BranchGe
        )
    }
}

/// How many stack slots an instruction consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopBehavior {
    Fixed(usize),
    /// Pop everything currently on the stack; used only by the
    /// stack-clearing transfers.
    All,
}

/// Closed union over the operand kinds the analyses consume.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    /// Branch target as an instruction index (loader form).
    Target(InstrId),
    /// Multi-way branch targets (loader form).
    TargetList(Vec<InstrId>),
    /// Branch target as a label (post-analysis form).
    Label(LabelId),
    /// Multi-way branch targets as labels (post-analysis form).
    LabelList(Vec<LabelId>),
    LocalSlot(usize),
    Argument(usize),
    Field(FieldRef),
    Method(MethodRef),
    Type(TypeRef),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    /// Resolved variable (post-analysis form).
    Var(VarId),
}

impl Operand {
    pub fn as_field(&self) -> Option<&FieldRef> {
        match self {
            Operand::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_method(&self) -> Option<&MethodRef> {
        match self {
            Operand::Method(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Operand::Var(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_label(&self) -> Option<LabelId> {
        match self {
            Operand::Label(l) => Some(*l),
            _ => None,
        }
    }
}

/// One decoded instruction. Immutable input to the analyses.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub offset: u32,
    pub end_offset: u32,
    pub opcode: OpCode,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(offset: u32, end_offset: u32, opcode: OpCode, operand: Operand) -> Self {
        Self {
            offset,
            end_offset,
            opcode,
            operand,
        }
    }

    /// Pop arity; depends on the operand for calls and on the enclosing
    /// method signature for `Return`.
    pub fn pop_behavior(&self, method_returns_value: bool) -> PopBehavior {
        use OpCode::*;
        let fixed = match self.opcode {
            Leave | EndFinally => return PopBehavior::All,
            Nop | LoadConstI32 | LoadConstI64 | LoadConstF64 | LoadConstString | LoadNull
            | LoadLocal | LoadLocalAddress | LoadArg | LoadArgAddress | LoadStaticField
            | Branch | Rethrow | LoadException | YieldBreak => 0,
            Pop | Duplicate | StoreLocal | StoreArg | LoadField | LoadFieldAddress
            | StoreStaticField | InitObject | BranchIfTrue | BranchIfFalse | Switch
            | EndFilter | Throw | Not | Neg | Convert | Cast | Box | Unbox | LoadLength
            | Await | YieldReturn => 1,
            StoreField | BranchEq | BranchNe | BranchLt | BranchLe | BranchGt | BranchGe
            | Add | Sub | Mul | Div | Rem | And | Or | Xor | Shl | Shr | CompareEq
            | CompareGt | CompareLt | LoadElement => 2,
            StoreElement => 3,
            Return => usize::from(method_returns_value),
            Call | CallVirtual => match &self.operand {
                Operand::Method(m) => m.call_arg_count(),
                _ => 0,
            },
            NewObject => match &self.operand {
                Operand::Method(m) => m.param_count,
                _ => 0,
            },
        };
        PopBehavior::Fixed(fixed)
    }

    /// Push arity; depends on the operand for calls.
    pub fn push_count(&self) -> usize {
        use OpCode::*;
        match self.opcode {
            Duplicate => 2,
            LoadConstI32 | LoadConstI64 | LoadConstF64 | LoadConstString | LoadNull
            | LoadLocal | LoadLocalAddress | LoadArg | LoadArgAddress | LoadField
            | LoadFieldAddress | LoadStaticField | NewObject | Add | Sub | Mul | Div | Rem
            | And | Or | Xor | Not | Neg | Shl | Shr | CompareEq | CompareGt | CompareLt
            | Convert | Cast | Box | Unbox | LoadElement | LoadLength | LoadException => 1,
            Call | CallVirtual => match &self.operand {
                Operand::Method(m) => usize::from(m.returns_value),
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Branch targets in loader form.
    pub fn branch_targets(&self) -> Vec<InstrId> {
        match &self.operand {
            Operand::Target(t) => vec![*t],
            Operand::TargetList(ts) => ts.clone(),
            _ => Vec::new(),
        }
    }
}

/// Kind of an exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HandlerKind {
    Catch,
    Finally,
    Fault,
    Filter,
}

/// One raw handler descriptor. All bounds are byte offsets; ends are
/// exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    pub kind: HandlerKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    pub filter_start: Option<u32>,
    pub caught_type: Option<TypeRef>,
}

/// Declared parameter of a method body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: Option<String>,
}

impl ParamSpec {
    pub fn unnamed() -> Self {
        Self { name: None }
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
        }
    }
}

/// Fully materialized input for one method body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    pub instructions: Vec<Instruction>,
    pub local_count: usize,
    /// Per declared local slot; pinned slots are never split.
    pub pinned_locals: Vec<bool>,
    pub parameters: Vec<ParamSpec>,
    pub has_this: bool,
    pub returns_value: bool,
    pub handlers: Vec<HandlerSpec>,
}

impl MethodBody {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            local_count: 0,
            pinned_locals: Vec::new(),
            parameters: Vec::new(),
            has_this: false,
            returns_value: false,
            handlers: Vec::new(),
        }
    }

    /// Total code size in bytes, used as the open end of trailing handler
    /// ranges.
    pub fn code_size(&self) -> u32 {
        self.instructions.last().map(|i| i.end_offset).unwrap_or(0)
    }
}
