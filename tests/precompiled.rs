// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use vessel::{Compartment, Context, Error, Module, ValKind, Value};

fn add_module() -> vessel::ir::Module {
    single_func_module(
        "add",
        func_type(&[ValKind::I32, ValKind::I32], &[ValKind::I32]),
        vec![],
        add32(local(0), local(1)),
    )
}

#[test]
fn precompiled_round_trip_is_observationally_equivalent() {
    let engine = engine();
    let compiled = compile(&engine, add_module());
    let object_code = compiled.object_code().to_vec();

    let reloaded = Module::load_precompiled(&engine, add_module(), &object_code).unwrap();

    let compartment = Compartment::new(&engine);
    let context = Context::new(&compartment);

    for module in [&compiled, &reloaded] {
        let instance = instantiate(&compartment, module);
        let add = exported_func(&compartment, instance, "add");
        assert_eq!(
            invoke(
                &compartment,
                context,
                add,
                &[Value::I32(2), Value::I32(3)]
            )
            .unwrap(),
            vec![Value::I32(5)]
        );
    }
}

#[test]
fn mismatched_ir_is_rejected() {
    let engine = engine();
    let compiled = compile(&engine, add_module());
    let object_code = compiled.object_code().to_vec();

    // A structurally different module must not accept the image.
    let other = single_func_module(
        "sub",
        func_type(&[ValKind::I64], &[ValKind::I64]),
        vec![],
        local(0),
    );
    let result = Module::load_precompiled(&engine, other, &object_code);
    assert!(matches!(result, Err(Error::PrecompiledMismatch(_))));
}

#[test]
fn corrupted_images_are_rejected() {
    let engine = engine();
    let compiled = compile(&engine, add_module());

    let result = Module::load_precompiled(&engine, add_module(), b"not an object");
    assert!(matches!(result, Err(Error::PrecompiledMismatch(_))));

    drop(compiled);
}
