// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use vessel::ir::{Expr, Export, ExportKind, FunctionDef, GlobalDef, ConstExpr};
use vessel::{
    Compartment, Context, Error, Global, GlobalType, Mutability, ValKind, Value,
};

fn counter_module() -> vessel::ir::Module {
    vessel::ir::Module {
        types: vec![
            func_type(&[], &[ValKind::I32]),
            func_type(&[ValKind::I32], &[]),
        ],
        globals: vec![GlobalDef {
            ty: GlobalType {
                content: ValKind::I32,
                mutability: Mutability::Var,
            },
            init: ConstExpr::I32(5),
        }],
        functions: vec![
            FunctionDef {
                type_index: 0,
                locals: vec![],
                body: Expr::GlobalGet(0),
                debug_name: "get".to_string(),
            },
            FunctionDef {
                type_index: 1,
                locals: vec![],
                body: Expr::GlobalSet(0, Box::new(local(0))),
                debug_name: "set".to_string(),
            },
        ],
        exports: vec![
            Export {
                name: "get".to_string(),
                kind: ExportKind::Func,
                index: 0,
            },
            Export {
                name: "set".to_string(),
                kind: ExportKind::Func,
                index: 1,
            },
            Export {
                name: "g".to_string(),
                kind: ExportKind::Global,
                index: 0,
            },
        ],
        debug_name: "counter".to_string(),
        ..vessel::ir::Module::default()
    }
}

#[test]
fn each_context_has_its_own_mutable_global_view() {
    let engine = engine();
    let module = compile(&engine, counter_module());

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let get = exported_func(&compartment, instance, "get");
    let set = exported_func(&compartment, instance, "set");

    let context_a = Context::new(&compartment);
    let context_b = Context::new(&compartment);

    // Both contexts see the initial value.
    assert_eq!(
        invoke(&compartment, context_a, get, &[]).unwrap(),
        vec![Value::I32(5)]
    );
    assert_eq!(
        invoke(&compartment, context_b, get, &[]).unwrap(),
        vec![Value::I32(5)]
    );

    // A write through one context is invisible to the other.
    invoke(&compartment, context_a, set, &[Value::I32(42)]).unwrap();
    assert_eq!(
        invoke(&compartment, context_a, get, &[]).unwrap(),
        vec![Value::I32(42)]
    );
    assert_eq!(
        invoke(&compartment, context_b, get, &[]).unwrap(),
        vec![Value::I32(5)]
    );

    // Cloning a context copies its mutable-global state.
    let context_c = context_a.clone_context(&compartment).unwrap();
    assert_eq!(
        invoke(&compartment, context_c, get, &[]).unwrap(),
        vec![Value::I32(42)]
    );

    // The host API goes through a context too.
    let global =
        Global::from_object(&compartment, instance.export(&compartment, "g").unwrap()).unwrap();
    assert_eq!(
        global.get(&compartment, context_b).unwrap(),
        Value::I32(5)
    );
    let previous = global
        .set(&compartment, context_b, Value::I32(7))
        .unwrap();
    assert_eq!(previous, Value::I32(5));
    assert_eq!(
        invoke(&compartment, context_b, get, &[]).unwrap(),
        vec![Value::I32(7)]
    );
    assert_eq!(
        invoke(&compartment, context_a, get, &[]).unwrap(),
        vec![Value::I32(42)]
    );
}

#[test]
fn immutable_globals_initialize_exactly_once() {
    let engine = engine();
    let compartment = Compartment::new(&engine);
    let context = Context::new(&compartment);

    let global = Global::new(
        &compartment,
        GlobalType {
            content: ValKind::I64,
            mutability: Mutability::Const,
        },
    );

    global.initialize(&compartment, Value::I64(99)).unwrap();
    assert_eq!(
        global.get(&compartment, context).unwrap(),
        Value::I64(99)
    );

    assert!(matches!(
        global.initialize(&compartment, Value::I64(1)),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        global.set(&compartment, context, Value::I64(1)),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn imported_immutable_globals_feed_initializers() {
    let engine = engine();

    // Imports an immutable i32 and uses it to initialize a defined global
    // read by `get`.
    let ir = vessel::ir::Module {
        types: vec![func_type(&[], &[ValKind::I32])],
        imports: vec![vessel::ir::Import {
            module: "env".to_string(),
            name: "base".to_string(),
            ty: vessel::ir::ImportKind::Global(GlobalType {
                content: ValKind::I32,
                mutability: Mutability::Const,
            }),
        }],
        globals: vec![GlobalDef {
            ty: GlobalType {
                content: ValKind::I32,
                mutability: Mutability::Var,
            },
            init: ConstExpr::GlobalGet(0),
        }],
        functions: vec![FunctionDef {
            type_index: 0,
            locals: vec![],
            body: Expr::GlobalGet(1),
            debug_name: "get".to_string(),
        }],
        exports: vec![Export {
            name: "get".to_string(),
            kind: ExportKind::Func,
            index: 0,
        }],
        debug_name: "derived".to_string(),
        ..vessel::ir::Module::default()
    };
    let module = compile(&engine, ir);

    let compartment = Compartment::new(&engine);
    let base = Global::new(
        &compartment,
        GlobalType {
            content: ValKind::I32,
            mutability: Mutability::Const,
        },
    );
    base.initialize(&compartment, Value::I32(1234)).unwrap();

    let instance = vessel::instantiate_module(
        &compartment,
        &module,
        vec![base.as_object()],
        "test",
        None,
    )
    .unwrap();

    let context = Context::new(&compartment);
    let get = exported_func(&compartment, instance, "get");
    assert_eq!(
        invoke(&compartment, context, get, &[]).unwrap(),
        vec![Value::I32(1234)]
    );
}
