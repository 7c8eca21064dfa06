// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use vessel::{
    Compartment, Context, Error, ExternType, Memory, MemoryType, ObjectKind, Value, ValKind,
};

#[test]
fn cloned_compartments_are_isolated() {
    let engine = engine();
    let compartment = Compartment::new(&engine);

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
    compartment.add_root(memory.as_object()).unwrap();
    memory.write(&compartment, 0, b"before").unwrap();

    let clone = compartment.clone_compartment().unwrap();
    let remapped = clone
        .remap_to_cloned_compartment(memory.as_object())
        .unwrap();
    let cloned_memory = Memory::from_object(&clone, remapped).unwrap();

    // The clone starts with the same bytes.
    let mut bytes = [0u8; 6];
    cloned_memory.read(&clone, 0, &mut bytes).unwrap();
    assert_eq!(&bytes, b"before");

    // Mutating the original does not affect the clone.
    memory.write(&compartment, 0, b"after!").unwrap();
    cloned_memory.read(&clone, 0, &mut bytes).unwrap();
    assert_eq!(&bytes, b"before");

    // Dropping the original's last root lets it collapse; the clone remains
    // live.
    memory.write(&compartment, 0, b"gone..").unwrap();
    compartment.remove_root(memory.as_object()).unwrap();
    assert!(compartment.try_collect());

    cloned_memory.read(&clone, 0, &mut bytes).unwrap();
    assert_eq!(&bytes, b"before");
}

#[test]
fn remap_requires_clone_ancestry() {
    let engine = engine();
    let a = Compartment::new(&engine);
    let b = Compartment::new(&engine);

    let memory = Memory::new(
        &a,
        MemoryType {
            minimum: 1,
            maximum: Some(1),
        },
        None,
        "m",
    )
    .unwrap();

    // b is not a clone of a.
    assert!(matches!(
        b.remap_to_cloned_compartment(memory.as_object()),
        Err(Error::NotFound)
    ));

    // A clone of a clone still remaps the original's objects.
    let c1 = a.clone_compartment().unwrap();
    let c2 = c1.clone_compartment().unwrap();
    let remapped = c2.remap_to_cloned_compartment(memory.as_object()).unwrap();
    assert_eq!(c2.object_kind(remapped).unwrap(), ObjectKind::Memory);
}

#[test]
fn objects_are_scoped_to_their_compartment() {
    let engine = engine();
    let a = Compartment::new(&engine);
    let b = Compartment::new(&engine);

    let memory = Memory::new(
        &a,
        MemoryType {
            minimum: 1,
            maximum: Some(1),
        },
        None,
        "m",
    )
    .unwrap();

    assert!(a.contains(memory.as_object()));
    assert!(!b.contains(memory.as_object()));
    assert!(matches!(b.add_root(memory.as_object()), Err(Error::NotFound)));

    assert!(a.is_a(
        memory.as_object(),
        &ExternType::Memory(MemoryType {
            minimum: 1,
            maximum: Some(1),
        })
    ));
    // A larger minimum satisfies a smaller expectation.
    assert!(a.is_a(
        memory.as_object(),
        &ExternType::Memory(MemoryType {
            minimum: 0,
            maximum: Some(2),
        })
    ));
}

#[test]
fn instances_survive_collection_through_exports() {
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
    let add = exported_func(&compartment, instance, "add");

    // Root the function; the instance is reachable through it and survives.
    compartment.add_root(add.as_object()).unwrap();
    compartment.collect_garbage();

    let context = Context::new(&compartment);
    assert_eq!(
        invoke(
            &compartment,
            context,
            add,
            &[Value::I32(20), Value::I32(22)]
        )
        .unwrap(),
        vec![Value::I32(42)]
    );

    // Dropping the root makes the whole instance graph collectable.
    compartment.remove_root(add.as_object()).unwrap();
    compartment.collect_garbage();
    assert!(!compartment.contains(add.as_object()));
    assert!(!compartment.contains(instance.as_object()));
}

#[test]
fn cloned_compartment_executes_independently() {
    let engine = engine();

    // A counter module: bump() increments a memory cell and returns it.
    let mut ir = single_func_module(
        "bump",
        func_type(&[], &[ValKind::I32]),
        vec![ValKind::I32],
        seq(
            set_local(0, add32(load32(0, i32c(0)), i32c(1))),
            seq(store32(0, i32c(0), local(0)), local(0)),
        ),
    );
    ir.memories.push(MemoryType {
        minimum: 1,
        maximum: Some(1),
    });
    let module = compile(&engine, ir);

    let compartment = Compartment::new(&engine);
    let instance = instantiate(&compartment, &module);
    let bump = exported_func(&compartment, instance, "bump");
    compartment.add_root(bump.as_object()).unwrap();

    let context = Context::new(&compartment);
    assert_eq!(
        invoke(&compartment, context, bump, &[]).unwrap(),
        vec![Value::I32(1)]
    );
    assert_eq!(
        invoke(&compartment, context, bump, &[]).unwrap(),
        vec![Value::I32(2)]
    );

    // The clone picks up the counter state but advances independently.
    let clone = compartment.clone_compartment().unwrap();
    let cloned_bump = vessel::Function::from_object(
        &clone,
        clone.remap_to_cloned_compartment(bump.as_object()).unwrap(),
    )
    .unwrap();
    let cloned_context = Context::new(&clone);

    assert_eq!(
        invoke(&clone, cloned_context, cloned_bump, &[]).unwrap(),
        vec![Value::I32(3)]
    );
    assert_eq!(
        invoke(&compartment, context, bump, &[]).unwrap(),
        vec![Value::I32(3)]
    );
    assert_eq!(
        invoke(&clone, cloned_context, cloned_bump, &[]).unwrap(),
        vec![Value::I32(4)]
    );
}
