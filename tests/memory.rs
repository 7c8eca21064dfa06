// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use vessel::ir::{Expr, ExportKind};
use vessel::{
    Compartment, Context, ExceptionKind, Memory, MemoryType, ValKind, Value, WASM_PAGE_SIZE,
};

fn memory_module() -> vessel::ir::Module {
    let mut module = single_func_module(
        "peek",
        func_type(&[ValKind::I32], &[ValKind::I32]),
        vec![],
        load32(0, local(0)),
    );
    module.memories.push(MemoryType {
        minimum: 1,
        maximum: Some(2),
    });
    module.functions.push(vessel::ir::FunctionDef {
        type_index: 1,
        locals: vec![],
        body: store32(0, local(0), local(1)),
        debug_name: "poke".to_string(),
    });
    module
        .types
        .push(func_type(&[ValKind::I32, ValKind::I32], &[]));
    module.exports.push(vessel::ir::Export {
        name: "poke".to_string(),
        kind: ExportKind::Func,
        index: 1,
    });
    module.exports.push(vessel::ir::Export {
        name: "mem".to_string(),
        kind: ExportKind::Memory,
        index: 0,
    });
    module
}

#[test]
fn loads_see_zero_initialized_pages() {
    let engine = engine();
    let module = compile(&engine, memory_module());

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let peek = exported_func(&compartment, instance, "peek");

    assert_eq!(
        invoke(&compartment, context, peek, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(0)]
    );
}

#[test]
fn out_of_bounds_access_traps_with_memory_and_offset() {
    let engine = engine();
    let module = compile(&engine, memory_module());

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let peek = exported_func(&compartment, instance, "peek");
    let memory = instance.default_memory(&compartment).unwrap().unwrap();

    let error = invoke(&compartment, context, peek, &[Value::I32(65536)]).unwrap_err();
    assert!(matches!(
        error.kind(),
        ExceptionKind::OutOfBoundsMemoryAccess
    ));
    // The exception names the memory and the faulting offset.
    let hit_memory = error.argument(0).unwrap().as_object().unwrap();
    assert_eq!(hit_memory, memory.as_object());
    assert_eq!(error.argument(1).unwrap().as_i64(), 65536);

    // The trap must not poison later invocations.
    assert_eq!(
        invoke(&compartment, context, peek, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(0)]
    );
}

#[test]
fn stores_are_confined_and_observable() {
    let engine = engine();
    let module = compile(&engine, memory_module());

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let peek = exported_func(&compartment, instance, "peek");
    let poke = exported_func(&compartment, instance, "poke");
    let memory = instance.default_memory(&compartment).unwrap().unwrap();

    invoke(
        &compartment,
        context,
        poke,
        &[Value::I32(16), Value::I32(0x1234_5678)],
    )
    .unwrap();
    assert_eq!(
        invoke(&compartment, context, peek, &[Value::I32(16)]).unwrap(),
        vec![Value::I32(0x1234_5678)]
    );

    // The host API sees the same bytes.
    let mut bytes = [0u8; 4];
    memory.read(&compartment, 16, &mut bytes).unwrap();
    assert_eq!(u32::from_le_bytes(bytes), 0x1234_5678);

    // A store past the committed page traps without side effects.
    let error = invoke(
        &compartment,
        context,
        poke,
        &[Value::I32(65536), Value::I32(1)],
    )
    .unwrap_err();
    assert!(matches!(
        error.kind(),
        ExceptionKind::OutOfBoundsMemoryAccess
    ));
}

#[test]
fn grow_and_unmap_through_host_api() {
    let engine = engine();
    let compartment = Compartment::new(&engine);
    let memory = Memory::new(
        &compartment,
        MemoryType {
            minimum: 1,
            maximum: Some(3),
        },
        None,
        "m",
    )
    .unwrap();

    assert_eq!(memory.num_pages(&compartment).unwrap(), 1);
    assert_eq!(memory.grow(&compartment, 2).unwrap(), 1);
    assert_eq!(memory.num_pages(&compartment).unwrap(), 3);
    assert!(memory.grow(&compartment, 1).is_err());

    memory.write(&compartment, WASM_PAGE_SIZE, &[7, 7, 7]).unwrap();
    memory.unmap_pages(&compartment, 1, 1).unwrap();
    let mut bytes = [0xffu8; 3];
    memory.read(&compartment, WASM_PAGE_SIZE, &mut bytes).unwrap();
    assert_eq!(bytes, [0, 0, 0]);

    // validated_range respects the committed length, reserved_range the
    // reservation.
    assert!(memory
        .validated_range(&compartment, 3 * WASM_PAGE_SIZE, 1)
        .is_err());
    assert!(memory
        .reserved_range(&compartment, 3 * WASM_PAGE_SIZE, 1)
        .is_ok());
    assert!(memory
        .reserved_range(&compartment, vessel::SANDBOX_BYTES, 1)
        .is_err());
}

#[test]
fn memory_grow_in_compiled_code() {
    let engine = engine();
    let mut module = single_func_module(
        "grow",
        func_type(&[ValKind::I32], &[ValKind::I32]),
        vec![],
        Expr::MemoryGrow {
            memory: 0,
            delta: Box::new(local(0)),
        },
    );
    module.memories.push(MemoryType {
        minimum: 1,
        maximum: Some(2),
    });
    module.types.push(func_type(&[], &[ValKind::I32]));
    module.functions.push(vessel::ir::FunctionDef {
        type_index: 1,
        locals: vec![],
        body: Expr::MemorySize { memory: 0 },
        debug_name: "size".to_string(),
    });
    module.exports.push(vessel::ir::Export {
        name: "size".to_string(),
        kind: ExportKind::Func,
        index: 1,
    });
    let module = compile(&engine, module);

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let context = Context::new(&compartment);
    let grow = exported_func(&compartment, instance, "grow");
    let size = exported_func(&compartment, instance, "size");

    assert_eq!(
        invoke(&compartment, context, size, &[]).unwrap(),
        vec![Value::I32(1)]
    );
    assert_eq!(
        invoke(&compartment, context, grow, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(1)]
    );
    assert_eq!(
        invoke(&compartment, context, size, &[]).unwrap(),
        vec![Value::I32(2)]
    );

    // Growth past the declared maximum is resource exhaustion inside
    // compiled code: an out-of-memory trap.
    let error = invoke(&compartment, context, grow, &[Value::I32(1)]).unwrap_err();
    assert!(matches!(error.kind(), ExceptionKind::OutOfMemory));
}
