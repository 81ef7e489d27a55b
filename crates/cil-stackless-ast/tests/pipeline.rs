// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios over the whole reconstruction pipeline.

use cil_stackless_ast::{
    reconstruct_method, AnalysisContext, AstNode, Expr, FieldRef, HandlerKind, HandlerSpec,
    Instruction, MethodAst, MethodBody, MethodRef, ModuleIndex, OpCode, Operand, ParamSpec,
    ReconstructOptions, TypeRef, TypeShape,
};

fn instr(offset: u32, opcode: OpCode, operand: Operand) -> Instruction {
    Instruction::new(offset, offset + 1, opcode, operand)
}

fn visit_exprs<'a>(nodes: &'a [AstNode], f: &mut dyn FnMut(&'a Expr)) {
    for node in nodes {
        match node {
            AstNode::Expr(e) => e.visit(f),
            AstNode::Label(_) => {}
            AstNode::Try(t) => {
                visit_exprs(&t.try_body, f);
                for c in &t.catch_clauses {
                    if let Some(fb) = &c.filter_body {
                        visit_exprs(fb, f);
                    }
                    visit_exprs(&c.body, f);
                }
                if let Some(b) = &t.finally_body {
                    visit_exprs(b, f);
                }
                if let Some(b) = &t.fault_body {
                    visit_exprs(b, f);
                }
            }
        }
    }
}

fn count_ops(ast: &MethodAst, opcode: OpCode) -> usize {
    let mut n = 0;
    visit_exprs(&ast.nodes, &mut |e| {
        if e.opcode == opcode {
            n += 1;
        }
    });
    n
}

fn count_regions(nodes: &[AstNode]) -> usize {
    let mut n = 0;
    for node in nodes {
        if let AstNode::Try(t) = node {
            n += 1;
            n += count_regions(&t.try_body);
            for c in &t.catch_clauses {
                n += count_regions(&c.body);
            }
            if let Some(b) = &t.finally_body {
                n += count_regions(b);
            }
            if let Some(b) = &t.fault_body {
                n += count_regions(b);
            }
        }
    }
    n
}

fn empty_module() -> ModuleIndex {
    ModuleIndex::new()
}

#[test]
fn test_simple_loop_scenario() {
    // i = 0; while (i < n) i = i + 1; return
    let mut body = MethodBody::new(vec![
        instr(0, OpCode::LoadConstI32, Operand::I32(0)),
        instr(1, OpCode::StoreLocal, Operand::LocalSlot(0)),
        instr(2, OpCode::LoadLocal, Operand::LocalSlot(0)),
        instr(3, OpCode::LoadArg, Operand::Argument(0)),
        instr(4, OpCode::BranchGe, Operand::Target(10)),
        instr(5, OpCode::LoadLocal, Operand::LocalSlot(0)),
        instr(6, OpCode::LoadConstI32, Operand::I32(1)),
        instr(7, OpCode::Add, Operand::None),
        instr(8, OpCode::StoreLocal, Operand::LocalSlot(0)),
        instr(9, OpCode::Branch, Operand::Target(2)),
        instr(10, OpCode::Return, Operand::None),
    ]);
    body.local_count = 1;
    body.pinned_locals = vec![false];
    body.parameters = vec![ParamSpec::named("n")];

    let mut ctx = AnalysisContext::new();
    let ast = reconstruct_method(
        &mut ctx,
        &empty_module(),
        &body,
        &ReconstructOptions::default(),
    )
    .unwrap();

    // One parameter variable and one merged counter variable.
    assert_eq!(ast.parameters.len(), 1);
    assert_eq!(ast.variables.name(ast.parameters[0]), "n");
    let counters = ast
        .variables
        .iter()
        .filter(|(_, v)| matches!(v.origin, cil_stackless_ast::VariableOrigin::LocalSlot(0)))
        .count();
    assert_eq!(counters, 1);

    // Exactly one backward branch, and its loop-head label appears once.
    let mut backward_targets = Vec::new();
    visit_exprs(&ast.nodes, &mut |e| {
        if e.opcode == OpCode::Branch {
            if let Operand::Label(l) = e.operand {
                backward_targets.push(l);
            }
        }
    });
    assert_eq!(backward_targets.len(), 1);
    let head = backward_targets[0];
    let occurrences = ast
        .nodes
        .iter()
        .filter(|n| n.as_label() == Some(head))
        .count();
    assert_eq!(occurrences, 1);
}

#[test]
fn test_reconstruction_is_idempotent() {
    let mut body = MethodBody::new(vec![
        instr(0, OpCode::LoadArg, Operand::Argument(0)),
        instr(1, OpCode::BranchIfTrue, Operand::Target(5)),
        instr(2, OpCode::LoadConstI32, Operand::I32(1)),
        instr(3, OpCode::StoreLocal, Operand::LocalSlot(0)),
        instr(4, OpCode::Branch, Operand::Target(7)),
        instr(5, OpCode::LoadConstI32, Operand::I32(2)),
        instr(6, OpCode::StoreLocal, Operand::LocalSlot(0)),
        instr(7, OpCode::LoadLocal, Operand::LocalSlot(0)),
        instr(8, OpCode::Pop, Operand::None),
        instr(9, OpCode::Return, Operand::None),
    ]);
    body.local_count = 1;
    body.pinned_locals = vec![false];
    body.parameters = vec![ParamSpec::named("flag")];

    let mut ctx = AnalysisContext::new();
    let options = ReconstructOptions::default();
    let first = reconstruct_method(&mut ctx, &empty_module(), &body, &options).unwrap();
    let second = reconstruct_method(&mut ctx, &empty_module(), &body, &options).unwrap();
    assert_eq!(first.dump(), second.dump());
}

#[test]
fn test_region_nesting_invariant() {
    // Outer try with finally; inner try/catch strictly inside.
    let mut body = MethodBody::new(vec![
        instr(0, OpCode::Nop, Operand::None),
        instr(1, OpCode::Nop, Operand::None),
        instr(2, OpCode::Leave, Operand::Target(10)),
        instr(3, OpCode::Pop, Operand::None),
        instr(4, OpCode::Leave, Operand::Target(10)),
        instr(5, OpCode::Leave, Operand::Target(10)),
        instr(6, OpCode::Nop, Operand::None),
        instr(7, OpCode::EndFinally, Operand::None),
        instr(8, OpCode::Nop, Operand::None),
        instr(9, OpCode::Nop, Operand::None),
        instr(10, OpCode::Return, Operand::None),
    ]);
    body.handlers.push(HandlerSpec {
        kind: HandlerKind::Finally,
        try_start: 0,
        try_end: 6,
        handler_start: 6,
        handler_end: 8,
        filter_start: None,
        caught_type: None,
    });
    body.handlers.push(HandlerSpec {
        kind: HandlerKind::Catch,
        try_start: 1,
        try_end: 3,
        handler_start: 3,
        handler_end: 5,
        filter_start: None,
        caught_type: Some(TypeRef::new("System", "Exception")),
    });

    let mut ctx = AnalysisContext::new();
    let ast = reconstruct_method(
        &mut ctx,
        &empty_module(),
        &body,
        &ReconstructOptions::default(),
    )
    .unwrap();

    let outer = ast
        .nodes
        .iter()
        .find_map(|n| n.as_try())
        .expect("outer region present");
    assert!(outer.finally_body.is_some());
    let inner = outer
        .try_body
        .iter()
        .find_map(|n| n.as_try())
        .expect("inner region nested inside the outer try");
    assert_eq!(inner.catch_clauses.len(), 1);
    assert_eq!(count_regions(&ast.nodes), 2);
}

// --- iterator scenario -----------------------------------------------------

fn generator_type() -> TypeRef {
    TypeRef::new("NS", "Gen")
}

fn gen_field(name: &str) -> FieldRef {
    FieldRef::new(generator_type(), name)
}

fn gen_method(name: &str, param_count: usize) -> MethodRef {
    MethodRef::new(generator_type(), name, param_count).with_this()
}

/// One `yield return 42` generator: the resume method writes states
/// {0 -> initial, 1 -> after the produce, -1 -> final} and the disposal
/// method is empty.
fn iterator_module() -> (ModuleIndex, MethodBody) {
    let ty = generator_type();
    let state = gen_field("state");
    let current = gen_field("current");

    let ctor = gen_method(".ctor", 1);
    let move_next = gen_method("MoveNext", 0).with_return();
    let get_current = gen_method("get_Current", 0).with_return();
    let dispose = gen_method("Dispose", 0);

    let mut index = ModuleIndex::new();
    index.add_type(
        ty.clone(),
        TypeShape {
            is_compiler_generated: true,
            is_value_type: false,
            is_nested: true,
            interfaces: vec![TypeRef::new("System.Collections", "IEnumerator")],
            methods: vec![
                ctor.clone(),
                move_next.clone(),
                get_current.clone(),
                dispose.clone(),
            ],
            fields: vec![state.clone(), current.clone()],
        },
    );

    // .ctor(int state) { this.state = state; }
    let mut ctor_body = MethodBody::new(vec![
        instr(0, OpCode::LoadArg, Operand::Argument(0)),
        instr(1, OpCode::LoadArg, Operand::Argument(1)),
        instr(2, OpCode::StoreField, Operand::Field(state.clone())),
        instr(3, OpCode::Return, Operand::None),
    ]);
    ctor_body.has_this = true;
    ctor_body.parameters = vec![ParamSpec::named("state")];
    index.add_body(&ctor, ctor_body);

    // get_Current() => this.current
    let mut current_body = MethodBody::new(vec![
        instr(0, OpCode::LoadArg, Operand::Argument(0)),
        instr(1, OpCode::LoadField, Operand::Field(current.clone())),
        instr(2, OpCode::Return, Operand::None),
    ]);
    current_body.has_this = true;
    current_body.returns_value = true;
    index.add_body(&get_current, current_body);

    // Dispose() {}
    let mut dispose_body = MethodBody::new(vec![instr(0, OpCode::Return, Operand::None)]);
    dispose_body.has_this = true;
    index.add_body(&dispose, dispose_body);

    // MoveNext(): the usual two-state dispatch around one produce point.
    let mut mn = MethodBody::new(vec![
        instr(0, OpCode::LoadArg, Operand::Argument(0)),
        instr(1, OpCode::LoadField, Operand::Field(state.clone())),
        instr(2, OpCode::StoreLocal, Operand::LocalSlot(0)),
        instr(3, OpCode::LoadLocal, Operand::LocalSlot(0)),
        instr(4, OpCode::BranchIfFalse, Operand::Target(9)),
        instr(5, OpCode::LoadLocal, Operand::LocalSlot(0)),
        instr(6, OpCode::LoadConstI32, Operand::I32(1)),
        instr(7, OpCode::BranchEq, Operand::Target(20)),
        instr(8, OpCode::Branch, Operand::Target(23)),
        // state 0: produce 42 and park in state 1
        instr(9, OpCode::LoadArg, Operand::Argument(0)),
        instr(10, OpCode::LoadConstI32, Operand::I32(-1)),
        instr(11, OpCode::StoreField, Operand::Field(state.clone())),
        instr(12, OpCode::LoadArg, Operand::Argument(0)),
        instr(13, OpCode::LoadConstI32, Operand::I32(42)),
        instr(14, OpCode::StoreField, Operand::Field(current.clone())),
        instr(15, OpCode::LoadArg, Operand::Argument(0)),
        instr(16, OpCode::LoadConstI32, Operand::I32(1)),
        instr(17, OpCode::StoreField, Operand::Field(state.clone())),
        instr(18, OpCode::LoadConstI32, Operand::I32(1)),
        instr(19, OpCode::Return, Operand::None),
        // state 1: finished
        instr(20, OpCode::LoadArg, Operand::Argument(0)),
        instr(21, OpCode::LoadConstI32, Operand::I32(-1)),
        instr(22, OpCode::StoreField, Operand::Field(state.clone())),
        instr(23, OpCode::LoadConstI32, Operand::I32(0)),
        instr(24, OpCode::Return, Operand::None),
    ]);
    mn.has_this = true;
    mn.returns_value = true;
    mn.local_count = 1;
    mn.pinned_locals = vec![false];
    index.add_body(&move_next, mn);

    // The stub: return new Gen(0);
    let mut stub = MethodBody::new(vec![
        instr(0, OpCode::LoadConstI32, Operand::I32(0)),
        instr(
            1,
            OpCode::NewObject,
            Operand::Method(MethodRef::new(ty, ".ctor", 1)),
        ),
        instr(2, OpCode::StoreLocal, Operand::LocalSlot(0)),
        instr(3, OpCode::LoadLocal, Operand::LocalSlot(0)),
        instr(4, OpCode::Return, Operand::None),
    ]);
    stub.local_count = 1;
    stub.pinned_locals = vec![false];
    stub.returns_value = true;

    (index, stub)
}

#[test]
fn test_iterator_stop_scenario() {
    let (index, stub) = iterator_module();
    let mut ctx = AnalysisContext::new();
    let ast = reconstruct_method(&mut ctx, &index, &stub, &ReconstructOptions::default()).unwrap();

    // Exactly one produce point, at least one stop point, and no guarded
    // region since the disposal analysis found no finally helpers.
    assert_eq!(count_ops(&ast, OpCode::YieldReturn), 1);
    assert!(count_ops(&ast, OpCode::YieldBreak) >= 1);
    assert_eq!(count_regions(&ast.nodes), 0);

    // The produced value survives the rewrite.
    let mut produced = None;
    visit_exprs(&ast.nodes, &mut |e| {
        if e.opcode == OpCode::YieldReturn {
            produced = e.args[0].as_i32();
        }
    });
    assert_eq!(produced, Some(42));

    // The state-holder type is gone from the output.
    visit_exprs(&ast.nodes, &mut |e| {
        assert!(
            !matches!(e.opcode, OpCode::LoadField | OpCode::StoreField),
            "state-holder field access survived the rewrite"
        );
    });
}

#[test]
fn test_iterator_disabled_keeps_stub() {
    let (index, stub) = iterator_module();
    let mut ctx = AnalysisContext::new();
    let options = ReconstructOptions {
        iterator_reconstruction: false,
        ..ReconstructOptions::default()
    };
    let ast = reconstruct_method(&mut ctx, &index, &stub, &options).unwrap();
    assert_eq!(count_ops(&ast, OpCode::YieldReturn), 0);
    assert_eq!(count_ops(&ast, OpCode::NewObject), 1);
}

// --- async scenarios -------------------------------------------------------

fn async_holder_type() -> TypeRef {
    TypeRef::new("NS", "AsyncSm")
}

fn holder_field(name: &str) -> FieldRef {
    FieldRef::new(async_holder_type(), name)
}

fn builder_type() -> TypeRef {
    TypeRef::new("System.Runtime.CompilerServices", "AsyncTaskMethodBuilder")
}

fn builder_method(name: &str, param_count: usize, returns: bool) -> MethodRef {
    let m = MethodRef::new(builder_type(), name, param_count).with_this();
    if returns {
        m.with_return()
    } else {
        m
    }
}

/// The stub body: initialize the holder, copy the parameter, seed state and
/// builder, start, and return the builder's task.
fn async_stub() -> MethodBody {
    let ty = async_holder_type();
    let state = holder_field("state");
    let builder = holder_field("builder");
    let x = holder_field("x");

    let create = MethodRef::new(builder_type(), "Create", 0).with_return();
    let start = builder_method("Start", 1, false);
    let get_task = builder_method("get_Task", 0, true);

    let mut stub = MethodBody::new(vec![
        instr(0, OpCode::LoadLocalAddress, Operand::LocalSlot(0)),
        instr(1, OpCode::InitObject, Operand::Type(ty)),
        instr(2, OpCode::LoadLocalAddress, Operand::LocalSlot(0)),
        instr(3, OpCode::LoadArg, Operand::Argument(0)),
        instr(4, OpCode::StoreField, Operand::Field(x)),
        instr(5, OpCode::LoadLocalAddress, Operand::LocalSlot(0)),
        instr(6, OpCode::LoadConstI32, Operand::I32(-1)),
        instr(7, OpCode::StoreField, Operand::Field(state)),
        instr(8, OpCode::LoadLocalAddress, Operand::LocalSlot(0)),
        instr(9, OpCode::Call, Operand::Method(create)),
        instr(10, OpCode::StoreField, Operand::Field(builder.clone())),
        instr(11, OpCode::LoadLocalAddress, Operand::LocalSlot(0)),
        instr(12, OpCode::LoadFieldAddress, Operand::Field(builder.clone())),
        instr(13, OpCode::LoadLocalAddress, Operand::LocalSlot(0)),
        instr(14, OpCode::Call, Operand::Method(start)),
        instr(15, OpCode::LoadLocalAddress, Operand::LocalSlot(0)),
        instr(16, OpCode::LoadFieldAddress, Operand::Field(builder)),
        instr(17, OpCode::Call, Operand::Method(get_task)),
        instr(18, OpCode::Return, Operand::None),
    ]);
    stub.local_count = 1;
    stub.pinned_locals = vec![false];
    stub.parameters = vec![ParamSpec::named("x")];
    stub.returns_value = true;
    stub
}

fn async_module(move_next: MethodBody) -> ModuleIndex {
    let ty = async_holder_type();
    let move_next_ref = MethodRef::new(ty.clone(), "MoveNext", 0).with_this();

    let mut index = ModuleIndex::new();
    index.add_type(
        ty,
        TypeShape {
            is_compiler_generated: true,
            is_value_type: true,
            is_nested: true,
            interfaces: vec![TypeRef::new(
                "System.Runtime.CompilerServices",
                "IAsyncStateMachine",
            )],
            methods: vec![move_next_ref.clone()],
            fields: vec![
                holder_field("state"),
                holder_field("builder"),
                holder_field("x"),
            ],
        },
    );
    index.add_body(&move_next_ref, move_next);
    index
}

/// A resume method with one suspend point and the standard
/// exception-forwarding scaffold.
fn well_formed_move_next() -> MethodBody {
    let state = holder_field("state");
    let builder = holder_field("builder");
    let await_on = builder_method("AwaitUnsafeOnCompleted", 2, false);
    let set_result = builder_method("SetResult", 0, false);
    let set_exception = builder_method("SetException", 1, false);

    let mut mn = MethodBody::new(vec![
        // dispatch
        instr(0, OpCode::LoadArg, Operand::Argument(0)),
        instr(1, OpCode::LoadField, Operand::Field(state.clone())),
        instr(2, OpCode::StoreLocal, Operand::LocalSlot(0)),
        instr(3, OpCode::LoadLocal, Operand::LocalSlot(0)),
        instr(4, OpCode::BranchIfFalse, Operand::Target(14)),
        // fresh path: park in state 0 and register the continuation
        instr(5, OpCode::LoadArg, Operand::Argument(0)),
        instr(6, OpCode::LoadConstI32, Operand::I32(0)),
        instr(7, OpCode::StoreField, Operand::Field(state.clone())),
        instr(8, OpCode::LoadArg, Operand::Argument(0)),
        instr(9, OpCode::LoadFieldAddress, Operand::Field(builder.clone())),
        instr(10, OpCode::LoadLocalAddress, Operand::LocalSlot(1)),
        instr(11, OpCode::LoadArg, Operand::Argument(0)),
        instr(12, OpCode::Call, Operand::Method(await_on)),
        instr(13, OpCode::Leave, Operand::Target(34)),
        // resumed path
        instr(14, OpCode::LoadArg, Operand::Argument(0)),
        instr(15, OpCode::LoadConstI32, Operand::I32(-1)),
        instr(16, OpCode::StoreField, Operand::Field(state.clone())),
        instr(17, OpCode::LoadArg, Operand::Argument(0)),
        instr(18, OpCode::LoadConstI32, Operand::I32(-2)),
        instr(19, OpCode::StoreField, Operand::Field(state.clone())),
        instr(20, OpCode::LoadArg, Operand::Argument(0)),
        instr(21, OpCode::LoadFieldAddress, Operand::Field(builder.clone())),
        instr(22, OpCode::Call, Operand::Method(set_result)),
        instr(23, OpCode::Leave, Operand::Target(34)),
        // catch-all scaffold
        instr(24, OpCode::StoreLocal, Operand::LocalSlot(2)),
        instr(25, OpCode::LoadArg, Operand::Argument(0)),
        instr(26, OpCode::LoadConstI32, Operand::I32(-2)),
        instr(27, OpCode::StoreField, Operand::Field(state)),
        instr(28, OpCode::LoadArg, Operand::Argument(0)),
        instr(29, OpCode::LoadFieldAddress, Operand::Field(builder)),
        instr(30, OpCode::LoadLocal, Operand::LocalSlot(2)),
        instr(31, OpCode::Call, Operand::Method(set_exception)),
        instr(32, OpCode::Leave, Operand::Target(34)),
        instr(33, OpCode::Nop, Operand::None),
        instr(34, OpCode::Return, Operand::None),
    ]);
    mn.has_this = true;
    mn.local_count = 3;
    mn.pinned_locals = vec![false, false, false];
    mn.handlers = vec![HandlerSpec {
        kind: HandlerKind::Catch,
        try_start: 0,
        try_end: 24,
        handler_start: 24,
        handler_end: 33,
        filter_start: None,
        caught_type: Some(TypeRef::new("System", "Exception")),
    }];
    mn
}

#[test]
fn test_async_reconstruction_produces_suspend_point() {
    let index = async_module(well_formed_move_next());
    let stub = async_stub();
    let mut ctx = AnalysisContext::new();
    let ast = reconstruct_method(&mut ctx, &index, &stub, &ReconstructOptions::default()).unwrap();

    // One explicit suspend point carrying a resume label that exists.
    assert_eq!(count_ops(&ast, OpCode::Await), 1);
    let mut resume = None;
    visit_exprs(&ast.nodes, &mut |e| {
        if e.opcode == OpCode::Await {
            if let Operand::Label(l) = e.operand {
                resume = Some(l);
            }
        }
    });
    let resume = resume.expect("suspend point has a resume label");
    assert_eq!(
        ast.nodes
            .iter()
            .filter(|n| n.as_label() == Some(resume))
            .count(),
        1
    );

    // The guarded scaffold and the state-holder accesses are gone.
    assert_eq!(count_regions(&ast.nodes), 0);
    visit_exprs(&ast.nodes, &mut |e| {
        assert!(
            !matches!(e.opcode, OpCode::LoadField | OpCode::StoreField),
            "state-holder field access survived the rewrite"
        );
    });

    // The original signature is preserved.
    assert_eq!(ast.parameters.len(), 1);
    assert_eq!(ast.variables.name(ast.parameters[0]), "x");
}

#[test]
fn test_async_without_exception_forwarding_is_kept_unreconstructed() {
    // The catch-all stores the final state but never forwards the error to
    // the builder's fail entry point.
    let state = holder_field("state");
    let mut mn = MethodBody::new(vec![
        instr(0, OpCode::Nop, Operand::None),
        instr(1, OpCode::Leave, Operand::Target(7)),
        instr(2, OpCode::Pop, Operand::None),
        instr(3, OpCode::LoadArg, Operand::Argument(0)),
        instr(4, OpCode::LoadConstI32, Operand::I32(-2)),
        instr(5, OpCode::StoreField, Operand::Field(state)),
        instr(6, OpCode::Leave, Operand::Target(7)),
        instr(7, OpCode::Return, Operand::None),
    ]);
    mn.has_this = true;
    mn.handlers = vec![HandlerSpec {
        kind: HandlerKind::Catch,
        try_start: 0,
        try_end: 2,
        handler_start: 2,
        handler_end: 7,
        filter_start: None,
        caught_type: Some(TypeRef::new("System", "Exception")),
    }];

    let index = async_module(mn);
    let stub = async_stub();
    let mut ctx = AnalysisContext::new();
    let ast = reconstruct_method(&mut ctx, &index, &stub, &ReconstructOptions::default()).unwrap();

    // Negative match: the original construct-and-start body is kept.
    assert_eq!(count_ops(&ast, OpCode::Await), 0);
    let mut start_calls = 0;
    visit_exprs(&ast.nodes, &mut |e| {
        if let Operand::Method(m) = &e.operand {
            if m.name == "Start" {
                start_calls += 1;
            }
        }
    });
    assert_eq!(start_calls, 1);
}

#[test]
fn test_negative_match_does_not_touch_input() {
    let stub = async_stub();
    let copy = stub.clone();
    // No module metadata at all: both reconstructors must decline.
    let mut ctx = AnalysisContext::new();
    let ast = reconstruct_method(&mut ctx, &empty_module(), &stub, &ReconstructOptions::default())
        .unwrap();
    assert_eq!(stub, copy);
    assert_eq!(count_ops(&ast, OpCode::Await), 0);
}
