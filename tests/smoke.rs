// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use vessel::ir::{BinaryOp, Expr, SwitchArm, TargetId, Type, UnaryOp};
use vessel::{Compartment, Context, ExceptionKind, ValKind, Value};

#[test]
fn add_two_numbers() {
    let engine = engine();
    let module = compile(
        &engine,
        single_func_module(
            "add",
            func_type(&[ValKind::I32, ValKind::I32], &[ValKind::I32]),
            vec![],
            add32(local(0), local(1)),
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let add = exported_func(&compartment, instance, "add");

    let results = invoke(
        &compartment,
        context,
        add,
        &[Value::I32(2), Value::I32(3)],
    )
    .unwrap();
    assert_eq!(results, vec![Value::I32(5)]);
}

#[test]
fn invoke_checked_validates_arguments() {
    let engine = engine();
    let module = compile(
        &engine,
        single_func_module(
            "add",
            func_type(&[ValKind::I32, ValKind::I32], &[ValKind::I32]),
            vec![],
            add32(local(0), local(1)),
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let add = exported_func(&compartment, instance, "add");

    // Wrong arity.
    let error = invoke(&compartment, context, add, &[Value::I32(2)]).unwrap_err();
    assert!(matches!(
        error.kind(),
        ExceptionKind::InvokeSignatureMismatch
    ));

    // Wrong argument kind.
    let error = invoke(
        &compartment,
        context,
        add,
        &[Value::I32(2), Value::I64(3)],
    )
    .unwrap_err();
    assert!(matches!(error.kind(), ExceptionKind::InvalidArgument));

    // The function type is observable.
    let ty = add.ty(&compartment).unwrap();
    assert_eq!(ty.params(), &[ValKind::I32, ValKind::I32]);
    assert_eq!(ty.results(), &[ValKind::I32]);
}

#[test]
fn locals_are_zero_initialized() {
    let engine = engine();
    // Returns an uninitialized local; must observe zero.
    let module = compile(
        &engine,
        single_func_module(
            "zero",
            func_type(&[], &[ValKind::I64]),
            vec![ValKind::I64],
            local(0),
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let zero = exported_func(&compartment, instance, "zero");

    assert_eq!(
        invoke(&compartment, context, zero, &[]).unwrap(),
        vec![Value::I64(0)]
    );
}

#[test]
fn label_joins_branch_and_fallthrough() {
    let engine = engine();
    let target = TargetId(0);
    // label t (i32):
    //   if (local 0) { branch t, 7 }
    //   3
    let body = Expr::Label {
        target,
        ty: Type::Val(ValKind::I32),
        body: Box::new(seq(
            if_else(
                local(0),
                Type::Void,
                Expr::Branch {
                    target,
                    value: Some(Box::new(i32c(7))),
                },
                Expr::Nop,
            ),
            i32c(3),
        )),
    };
    let module = compile(
        &engine,
        single_func_module(
            "pick",
            func_type(&[ValKind::I32], &[ValKind::I32]),
            vec![],
            body,
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let pick = exported_func(&compartment, instance, "pick");

    assert_eq!(
        invoke(&compartment, context, pick, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(7)]
    );
    assert_eq!(
        invoke(&compartment, context, pick, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(3)]
    );
}

#[test]
fn loop_with_continue_and_break() {
    let engine = engine();
    let continue_target = TargetId(0);
    let break_target = TargetId(1);

    // sum 1..=n: local1 = i, local2 = acc
    let body = seq(
        Expr::Loop {
            continue_target,
            break_target,
            ty: Type::Void,
            body: Box::new(seq(
                if_else(
                    Expr::Compare {
                        op: vessel::ir::CompareOp::GtS,
                        operand_ty: ValKind::I32,
                        lhs: Box::new(local(1)),
                        rhs: Box::new(local(0)),
                    },
                    Type::Void,
                    Expr::Branch {
                        target: break_target,
                        value: None,
                    },
                    Expr::Nop,
                ),
                seq(
                    Expr::DiscardResult(Box::new(set_local(2, add32(local(2), local(1))))),
                    Expr::DiscardResult(Box::new(set_local(1, add32(local(1), i32c(1))))),
                ),
            )),
        },
        local(2),
    );

    let module = compile(
        &engine,
        single_func_module(
            "sum",
            func_type(&[ValKind::I32], &[ValKind::I32]),
            vec![ValKind::I32, ValKind::I32],
            seq(Expr::DiscardResult(Box::new(set_local(1, i32c(1)))), body),
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let sum = exported_func(&compartment, instance, "sum");

    assert_eq!(
        invoke(&compartment, context, sum, &[Value::I32(5)]).unwrap(),
        vec![Value::I32(15)]
    );
    assert_eq!(
        invoke(&compartment, context, sum, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(0)]
    );
}

#[test]
fn switch_matches_falls_through_and_defaults() {
    let engine = engine();
    let target = TargetId(0);

    let arms = vec![
        // Arm 0 falls through into arm 1.
        SwitchArm {
            key: 0,
            body: Expr::Nop,
        },
        SwitchArm {
            key: 1,
            body: Expr::Branch {
                target,
                value: Some(Box::new(i32c(20))),
            },
        },
        // Default and final arm; its value is the switch result.
        SwitchArm {
            key: 99,
            body: i32c(30),
        },
    ];

    let body = Expr::Switch {
        key: Box::new(local(0)),
        key_ty: ValKind::I32,
        arms,
        default_index: 2,
        target,
        ty: Type::Val(ValKind::I32),
    };

    let module = compile(
        &engine,
        single_func_module(
            "select",
            func_type(&[ValKind::I32], &[ValKind::I32]),
            vec![],
            body,
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let select = exported_func(&compartment, instance, "select");

    // Key 0 matches arm 0, which falls through to arm 1.
    assert_eq!(
        invoke(&compartment, context, select, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(20)]
    );
    assert_eq!(
        invoke(&compartment, context, select, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(20)]
    );
    assert_eq!(
        invoke(&compartment, context, select, &[Value::I32(7)]).unwrap(),
        vec![Value::I32(30)]
    );
}

#[test]
fn early_return_and_unreachable_tail() {
    let engine = engine();
    // return 42; add(1, <unreachable>)
    let body = seq(
        Expr::DiscardResult(Box::new(seq(ret(Some(i32c(42))), i32c(0)))),
        add32(i32c(1), i32c(2)),
    );
    let module = compile(
        &engine,
        single_func_module("f", func_type(&[], &[ValKind::I32]), vec![], body),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let f = exported_func(&compartment, instance, "f");

    assert_eq!(
        invoke(&compartment, context, f, &[]).unwrap(),
        vec![Value::I32(42)]
    );
}

#[test]
fn intrinsic_integer_ops() {
    let engine = engine();
    let module = compile(
        &engine,
        single_func_module(
            "clz",
            func_type(&[ValKind::I32], &[ValKind::I32]),
            vec![],
            Expr::Unary {
                op: UnaryOp::Clz,
                operand: Box::new(local(0)),
            },
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let clz = exported_func(&compartment, instance, "clz");

    assert_eq!(
        invoke(&compartment, context, clz, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(31)]
    );
    assert_eq!(
        invoke(&compartment, context, clz, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(32)]
    );

    let module = compile(
        &engine,
        single_func_module(
            "rot",
            func_type(&[ValKind::I32, ValKind::I32], &[ValKind::I32]),
            vec![],
            binary(BinaryOp::Rotl, ValKind::I32, local(0), local(1)),
        ),
    );
    let instance = instantiate(&compartment, &module);
    let rot = exported_func(&compartment, instance, "rot");
    assert_eq!(
        invoke(
            &compartment,
            context,
            rot,
            &[Value::I32(0x8000_0001u32 as i32), Value::I32(1)]
        )
        .unwrap(),
        vec![Value::I32(3)]
    );
}
