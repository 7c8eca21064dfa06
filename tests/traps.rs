// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use vessel::ir::{BinaryOp, CastOp, Expr};
use vessel::{catch_runtime_exceptions, Compartment, Context, ExceptionKind, ValKind, Value};

#[test]
fn integer_division_traps() {
    let engine = engine();
    // 1 / local0
    let module = compile(
        &engine,
        single_func_module(
            "div",
            func_type(&[ValKind::I32], &[ValKind::I32]),
            vec![],
            binary(BinaryOp::DivS, ValKind::I32, i32c(1), local(0)),
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let div = exported_func(&compartment, instance, "div");

    let error = invoke(&compartment, context, div, &[Value::I32(0)]).unwrap_err();
    assert!(matches!(
        error.kind(),
        ExceptionKind::IntegerDivideByZeroOrOverflow
    ));

    // Division still works afterwards.
    assert_eq!(
        invoke(&compartment, context, div, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(1)]
    );

    // INT32_MIN / -1 overflows.
    let module = compile(
        &engine,
        single_func_module(
            "div_min",
            func_type(&[ValKind::I32], &[ValKind::I32]),
            vec![],
            binary(BinaryOp::DivS, ValKind::I32, i32c(i32::MIN), local(0)),
        ),
    );
    let instance = instantiate(&compartment, &module);
    let div_min = exported_func(&compartment, instance, "div_min");
    let error = invoke(&compartment, context, div_min, &[Value::I32(-1)]).unwrap_err();
    assert!(matches!(
        error.kind(),
        ExceptionKind::IntegerDivideByZeroOrOverflow
    ));
}

#[test]
fn float_truncation_traps_and_saturates() {
    let engine = engine();
    let module = compile(
        &engine,
        single_func_module(
            "trunc",
            func_type(&[ValKind::F64], &[ValKind::I32]),
            vec![],
            Expr::Cast {
                op: CastOp::TruncF64ToI32S,
                operand: Box::new(local(0)),
            },
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let trunc = exported_func(&compartment, instance, "trunc");

    assert_eq!(
        invoke(
            &compartment,
            context,
            trunc,
            &[Value::F64((-3.7f64).to_bits())]
        )
        .unwrap(),
        vec![Value::I32(-3)]
    );

    for bad in [f64::NAN, 1.0e30, f64::INFINITY] {
        let error = invoke(&compartment, context, trunc, &[Value::F64(bad.to_bits())])
            .unwrap_err();
        assert!(matches!(error.kind(), ExceptionKind::InvalidFloatOperation));
    }

    // The saturating variant never traps.
    let module = compile(
        &engine,
        single_func_module(
            "trunc_sat",
            func_type(&[ValKind::F64], &[ValKind::I32]),
            vec![],
            Expr::Cast {
                op: CastOp::TruncSatF64ToI32S,
                operand: Box::new(local(0)),
            },
        ),
    );
    let instance = instantiate(&compartment, &module);
    let trunc_sat = exported_func(&compartment, instance, "trunc_sat");
    assert_eq!(
        invoke(
            &compartment,
            context,
            trunc_sat,
            &[Value::F64(1.0e30f64.to_bits())]
        )
        .unwrap(),
        vec![Value::I32(i32::MAX)]
    );
    assert_eq!(
        invoke(
            &compartment,
            context,
            trunc_sat,
            &[Value::F64(f64::NAN.to_bits())]
        )
        .unwrap(),
        vec![Value::I32(0)]
    );
}

#[test]
fn unreachable_traps() {
    let engine = engine();
    let module = compile(
        &engine,
        single_func_module("boom", func_type(&[], &[]), vec![], Expr::Unreachable),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let boom = exported_func(&compartment, instance, "boom");

    let error = invoke(&compartment, context, boom, &[]).unwrap_err();
    assert!(matches!(error.kind(), ExceptionKind::ReachedUnreachable));
}

#[test]
fn runaway_recursion_overflows_the_stack() {
    let engine = engine();
    let module = compile(
        &engine,
        single_func_module(
            "recurse",
            func_type(&[], &[]),
            vec![],
            Expr::CallDirect {
                func: 0,
                args: vec![],
            },
        ),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let recurse = exported_func(&compartment, instance, "recurse");

    let error = invoke(&compartment, context, recurse, &[]).unwrap_err();
    assert!(matches!(error.kind(), ExceptionKind::StackOverflow));
}

#[test]
fn thrown_user_exceptions_carry_arguments() {
    let engine = engine();
    let mut module = single_func_module(
        "thrower",
        func_type(&[ValKind::I32], &[]),
        vec![],
        Expr::Throw {
            tag: 0,
            args: vec![local(0)],
        },
    );
    module.exception_types.push(vessel::ir::ExceptionTypeDef {
        params: vec![ValKind::I32],
        debug_name: "boom".to_string(),
    });
    let module = compile(&engine, module);

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let thrower = exported_func(&compartment, instance, "thrower");

    let error = invoke(&compartment, context, thrower, &[Value::I32(99)]).unwrap_err();
    let ExceptionKind::User(ty) = error.kind() else {
        panic!("expected a user exception, got {:?}", error.kind());
    };
    assert_eq!(
        ty.parameters(&compartment).unwrap(),
        vec![ValKind::I32]
    );
    assert_eq!(error.argument(0).unwrap().as_i32(), 99);
    assert!(error.describe(Some(&compartment)).contains("boom"));
}

#[test]
fn catch_runtime_exceptions_owns_the_exception() {
    let engine = engine();
    let module = compile(
        &engine,
        single_func_module("boom", func_type(&[], &[]), vec![], Expr::Unreachable),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let boom = exported_func(&compartment, instance, "boom");

    let mut seen = false;
    let result = catch_runtime_exceptions(
        || invoke(&compartment, context, boom, &[]),
        |exception| {
            assert!(matches!(
                exception.kind(),
                ExceptionKind::ReachedUnreachable
            ));
            seen = true;
        },
    );
    assert!(result.is_none());
    assert!(seen);
}
