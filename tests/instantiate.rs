// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use vessel::ir::{
    ConstExpr, DataSegment, Export, ExportKind, Import, ImportKind, Module as IrModule,
};
use vessel::{
    instantiate_module, Compartment, Context, Error, Linker, Memory, MemoryType, ResourceQuota,
    ValKind, Value,
};

#[test]
fn out_of_bounds_data_segments_fail_atomically() {
    let engine = engine();

    // Imports its memory and writes two segments: one in bounds, one far
    // out of bounds of a one-page memory.
    let ir = IrModule {
        imports: vec![Import {
            module: "env".to_string(),
            name: "mem".to_string(),
            ty: ImportKind::Memory(MemoryType {
                minimum: 1,
                maximum: None,
            }),
        }],
        data_segments: vec![
            DataSegment {
                memory: 0,
                offset: ConstExpr::I32(0),
                bytes: b"hello".to_vec(),
            },
            DataSegment {
                memory: 0,
                offset: ConstExpr::I32(70000),
                bytes: b"out of bounds".to_vec(),
            },
        ],
        debug_name: "segments".to_string(),
        ..IrModule::default()
    };
    let module = compile(&engine, ir);

    let compartment = Compartment::new(&engine);
    let memory = Memory::new(
        &compartment,
        MemoryType {
            minimum: 1,
            maximum: Some(2),
        },
        None,
        "m",
    )
    .unwrap();

    let result = instantiate_module(
        &compartment,
        &module,
        vec![memory.as_object()],
        "test",
        None,
    );
    assert!(matches!(
        result,
        Err(Error::OutOfBoundsDataSegment(70000, 13))
    ));

    // Atomic failure: not even the in-bounds segment was written.
    let mut bytes = [0u8; 5];
    memory.read(&compartment, 0, &mut bytes).unwrap();
    assert_eq!(bytes, [0; 5]);

    // After growing the memory the same module instantiates cleanly and
    // both segments land.
    memory.grow(&compartment, 1).unwrap();
    instantiate_module(
        &compartment,
        &module,
        vec![memory.as_object()],
        "test",
        None,
    )
    .unwrap();
    memory.read(&compartment, 0, &mut bytes).unwrap();
    assert_eq!(&bytes, b"hello");
}

#[test]
fn import_mismatches_are_reported() {
    let engine = engine();
    let ir = IrModule {
        types: vec![func_type(&[ValKind::I32], &[ValKind::I32])],
        imports: vec![Import {
            module: "env".to_string(),
            name: "f".to_string(),
            ty: ImportKind::Func { type_index: 0 },
        }],
        debug_name: "importer".to_string(),
        ..IrModule::default()
    };
    let module = compile(&engine, ir);

    let compartment = Compartment::new(&engine);

    // Not enough imports.
    let result = instantiate_module(&compartment, &module, vec![], "test", None);
    assert!(matches!(result, Err(Error::ImportTypeMismatch(_))));

    // Wrong object kind.
    let memory = Memory::new(
        &compartment,
        MemoryType {
            minimum: 1,
            maximum: Some(1),
        },
        None,
        "m",
    )
    .unwrap();
    let result = instantiate_module(
        &compartment,
        &module,
        vec![memory.as_object()],
        "test",
        None,
    );
    assert!(matches!(result, Err(Error::ImportTypeMismatch(_))));
}

#[test]
fn linker_resolves_exports_across_instances() {
    let engine = engine();

    let exporter = compile(
        &engine,
        single_func_module(
            "add",
            func_type(&[ValKind::I32, ValKind::I32], &[ValKind::I32]),
            vec![],
            add32(local(0), local(1)),
        ),
    );

    // add3(x) = add(add(x, 1), 2) through an imported function.
    let importer_ir = IrModule {
        types: vec![
            func_type(&[ValKind::I32, ValKind::I32], &[ValKind::I32]),
            func_type(&[ValKind::I32], &[ValKind::I32]),
        ],
        imports: vec![Import {
            module: "calc".to_string(),
            name: "add".to_string(),
            ty: ImportKind::Func { type_index: 0 },
        }],
        functions: vec![vessel::ir::FunctionDef {
            type_index: 1,
            locals: vec![],
            body: vessel::ir::Expr::CallDirect {
                func: 0,
                args: vec![
                    vessel::ir::Expr::CallDirect {
                        func: 0,
                        args: vec![local(0), i32c(1)],
                    },
                    i32c(2),
                ],
            },
            debug_name: "add3".to_string(),
        }],
        exports: vec![Export {
            name: "add3".to_string(),
            kind: ExportKind::Func,
            index: 1,
        }],
        debug_name: "importer".to_string(),
        ..IrModule::default()
    };
    let importer = compile(&engine, importer_ir);

    let compartment = Compartment::new(&engine);
    let exporter_instance = instantiate(&compartment, &exporter);

    let mut linker = Linker::new();
    linker
        .define_instance(&compartment, "calc", exporter_instance)
        .unwrap();
    let instance = linker
        .instantiate(&compartment, &importer, "importer", None)
        .unwrap();

    let context = Context::new(&compartment);
    let add3 = exported_func(&compartment, instance, "add3");
    assert_eq!(
        invoke(&compartment, context, add3, &[Value::I32(39)]).unwrap(),
        vec![Value::I32(42)]
    );

    // Unresolvable imports fail with a named mismatch.
    let mut empty = Linker::new();
    let result = empty.instantiate(&compartment, &importer, "importer", None);
    assert!(matches!(result, Err(Error::ImportTypeMismatch(_))));
}

#[test]
fn quotas_bound_instantiation() {
    let engine = engine();
    let ir = IrModule {
        memories: vec![MemoryType {
            minimum: 4,
            maximum: Some(8),
        }],
        debug_name: "hungry".to_string(),
        ..IrModule::default()
    };
    let module = compile(&engine, ir);

    let compartment = Compartment::new(&engine);
    let quota = ResourceQuota::new();
    quota.set_max_memory_pages(2);

    let result = instantiate_module(&compartment, &module, vec![], "test", Some(&quota));
    assert!(matches!(result, Err(Error::QuotaExceeded)));
    // The failed attempt must not leak quota budget.
    assert_eq!(quota.current_memory_pages(), 0);

    quota.set_max_memory_pages(8);
    let instance =
        instantiate_module(&compartment, &module, vec![], "test", Some(&quota)).unwrap();
    assert_eq!(quota.current_memory_pages(), 4);

    // Growth reserves against the quota too.
    let memory = instance.default_memory(&compartment).unwrap().unwrap();
    memory.grow(&compartment, 4).unwrap();
    assert_eq!(quota.current_memory_pages(), 8);
    assert!(matches!(
        memory.grow(&compartment, 1),
        Err(Error::QuotaExceeded)
    ));
}

#[test]
fn start_function_is_returned_not_invoked() {
    let engine = engine();
    let mut ir = single_func_module(
        "init",
        func_type(&[], &[]),
        vec![],
        store32(0, i32c(0), i32c(7)),
    );
    ir.memories.push(MemoryType {
        minimum: 1,
        maximum: Some(1),
    });
    ir.start = Some(0);
    let module = compile(&engine, ir);

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let memory = instance.default_memory(&compartment).unwrap().unwrap();

    // Instantiation must not have run the start function.
    let mut bytes = [0u8; 4];
    memory.read(&compartment, 0, &mut bytes).unwrap();
    assert_eq!(u32::from_le_bytes(bytes), 0);

    // Invoking it is the caller's move.
    let start = instance.start_function(&compartment).unwrap().unwrap();
    let context = Context::new(&compartment);
    invoke(&compartment, context, start, &[]).unwrap();
    memory.read(&compartment, 0, &mut bytes).unwrap();
    assert_eq!(u32::from_le_bytes(bytes), 7);
}
