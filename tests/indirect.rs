// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use vessel::ir::{
    ConstExpr, ElemSegment, Export, ExportKind, Expr, FunctionDef, Module as IrModule,
};
use vessel::{Compartment, Context, Error, ExceptionKind, TableType, ValKind, Value};

/// A table of size 4 holding [fa, fb, fa, fb], fa() = 10, fb() = 20, and an
/// exported `call(i)` doing a call_indirect through it.
fn dispatch_module(elements: Vec<Option<u32>>, table_size: u64) -> IrModule {
    IrModule {
        types: vec![
            func_type(&[], &[ValKind::I32]),
            func_type(&[ValKind::I32], &[ValKind::I32]),
        ],
        functions: vec![
            FunctionDef {
                type_index: 0,
                locals: vec![],
                body: i32c(10),
                debug_name: "fa".to_string(),
            },
            FunctionDef {
                type_index: 0,
                locals: vec![],
                body: i32c(20),
                debug_name: "fb".to_string(),
            },
            FunctionDef {
                type_index: 1,
                locals: vec![],
                body: Expr::CallIndirect {
                    table: 0,
                    type_index: 0,
                    index: Box::new(local(0)),
                    args: vec![],
                },
                debug_name: "call".to_string(),
            },
        ],
        tables: vec![TableType {
            element: ValKind::FuncRef,
            minimum: table_size,
            maximum: Some(table_size),
        }],
        elem_segments: vec![ElemSegment {
            table: 0,
            offset: ConstExpr::I32(0),
            functions: elements,
        }],
        exports: vec![Export {
            name: "call".to_string(),
            kind: ExportKind::Func,
            index: 2,
        }],
        debug_name: "dispatch".to_string(),
        ..IrModule::default()
    }
}

#[test]
fn dispatch_masks_the_index() {
    let engine = engine();
    let module = compile(
        &engine,
        dispatch_module(vec![Some(0), Some(1), Some(0), Some(1)], 4),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let call = exported_func(&compartment, instance, "call");

    assert_eq!(
        invoke(&compartment, context, call, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(10)]
    );
    assert_eq!(
        invoke(&compartment, context, call, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(20)]
    );
    // 5 & 3 == 1
    assert_eq!(
        invoke(&compartment, context, call, &[Value::I32(5)]).unwrap(),
        vec![Value::I32(20)]
    );
}

#[test]
fn null_elements_trap_with_index() {
    let engine = engine();
    let module = compile(&engine, dispatch_module(vec![Some(0), None], 4));

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let call = exported_func(&compartment, instance, "call");
    let table = instance.default_table(&compartment).unwrap().unwrap();

    let error = invoke(&compartment, context, call, &[Value::I32(1)]).unwrap_err();
    assert!(matches!(
        error.kind(),
        ExceptionKind::UninitializedTableElement
    ));
    assert_eq!(
        error.argument(0).unwrap().as_object().unwrap(),
        table.as_object()
    );
    assert_eq!(error.argument(1).unwrap().as_i64(), 1);
}

#[test]
fn signature_mismatch_traps() {
    let engine = engine();
    // fc takes an i32, but the table is dispatched with the ()->i32
    // signature.
    let mut ir = dispatch_module(vec![Some(0), None, None, None], 4);
    ir.functions.push(FunctionDef {
        type_index: 1,
        locals: vec![],
        body: local(0),
        debug_name: "fc".to_string(),
    });
    ir.elem_segments[0].functions = vec![Some(0), Some(3), None, None];
    let module = compile(&engine, ir);

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let call = exported_func(&compartment, instance, "call");

    assert_eq!(
        invoke(&compartment, context, call, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(10)]
    );
    let error = invoke(&compartment, context, call, &[Value::I32(1)]).unwrap_err();
    assert!(matches!(
        error.kind(),
        ExceptionKind::IndirectCallSignatureMismatch
    ));
}

#[test]
fn non_power_of_two_function_tables_are_rejected() {
    let engine = engine();
    let module = compile(&engine, dispatch_module(vec![Some(0), Some(1), Some(0)], 3));

    let compartment = Compartment::new(&engine);
    let result = vessel::instantiate_module(&compartment, &module, Vec::new(), "test", None);
    assert!(matches!(result, Err(Error::InvalidTableSize(3))));
}

#[test]
fn table_get_set_through_host_api() {
    let engine = engine();
    let module = compile(
        &engine,
        dispatch_module(vec![Some(0), Some(1), Some(0), Some(1)], 4),
    );

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let call = exported_func(&compartment, instance, "call");
    let table = instance.default_table(&compartment).unwrap().unwrap();

    assert_eq!(table.len(&compartment).unwrap(), 4);
    assert!(table.get(&compartment, 0).unwrap().is_some());
    assert!(matches!(
        table.get(&compartment, 4),
        Err(Error::OutOfBounds(4))
    ));

    // Swapping an element changes dispatch.
    let fb = table.get(&compartment, 1).unwrap();
    let previous = table.set(&compartment, 0, fb).unwrap();
    assert!(previous.is_some());
    assert_eq!(
        invoke(&compartment, context, call, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(20)]
    );

    // Nulling an element makes dispatch trap.
    table.set(&compartment, 0, None).unwrap();
    let error = invoke(&compartment, context, call, &[Value::I32(0)]).unwrap_err();
    assert!(matches!(
        error.kind(),
        ExceptionKind::UninitializedTableElement
    ));
}
