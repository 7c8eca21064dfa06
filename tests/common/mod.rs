// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared helpers for building IR modules by hand in tests.

#![allow(dead_code)]

use vessel::ir::{
    AddrWidth, BinaryOp, Export, ExportKind, Expr, Extension, FunctionDef, Literal, MemOp, Type,
};
use vessel::{
    Compartment, Context, Engine, EngineConfig, Exception, Function, FuncType, Instance, Module,
    ValKind, Value,
};

pub fn engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

pub fn compile(engine: &Engine, module: vessel::ir::Module) -> Module {
    Module::compile(engine, module).unwrap()
}

pub fn instantiate(compartment: &Compartment, module: &Module) -> Instance {
    vessel::instantiate_module(compartment, module, Vec::new(), "test", None).unwrap()
}

pub fn exported_func(compartment: &Compartment, instance: Instance, name: &str) -> Function {
    let object = instance.export(compartment, name).unwrap();
    Function::from_object(compartment, object).unwrap()
}

pub fn invoke(
    compartment: &Compartment,
    context: Context,
    function: Function,
    args: &[Value],
) -> Result<Vec<Value>, Box<Exception>> {
    function.invoke_checked(compartment, context, args)
}

pub fn func_type(params: &[ValKind], results: &[ValKind]) -> FuncType {
    FuncType::new(params.iter().copied(), results.iter().copied())
}

/// One exported function, no other declarations.
pub fn single_func_module(
    name: &str,
    ty: FuncType,
    locals: Vec<ValKind>,
    body: Expr,
) -> vessel::ir::Module {
    vessel::ir::Module {
        types: vec![ty],
        functions: vec![FunctionDef {
            type_index: 0,
            locals,
            body,
            debug_name: name.to_string(),
        }],
        exports: vec![Export {
            name: name.to_string(),
            kind: ExportKind::Func,
            index: 0,
        }],
        debug_name: format!("{name}_module"),
        ..vessel::ir::Module::default()
    }
}

// Expression shorthands.

pub fn i32c(v: i32) -> Expr {
    Expr::Literal(Literal::I32(v))
}

pub fn i64c(v: i64) -> Expr {
    Expr::Literal(Literal::I64(v))
}

pub fn f64c(v: f64) -> Expr {
    Expr::Literal(Literal::F64(v.to_bits()))
}

pub fn local(index: u32) -> Expr {
    Expr::LocalGet(index)
}

pub fn set_local(index: u32, value: Expr) -> Expr {
    Expr::LocalSet(index, Box::new(value))
}

pub fn binary(op: BinaryOp, ty: ValKind, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        ty,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

pub fn add32(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinaryOp::Add, ValKind::I32, lhs, rhs)
}

pub fn seq(first: Expr, second: Expr) -> Expr {
    Expr::Sequence {
        first: Box::new(first),
        second: Box::new(second),
    }
}

pub fn load32(memory: u32, addr: Expr) -> Expr {
    Expr::Load {
        memory,
        addr: Box::new(addr),
        width: AddrWidth::A32,
        mem_op: MemOp::I32,
        result: ValKind::I32,
        extend: Extension::Zero,
        align_log2: 0,
        atomic: false,
    }
}

pub fn store32(memory: u32, addr: Expr, value: Expr) -> Expr {
    Expr::Store {
        memory,
        addr: Box::new(addr),
        width: AddrWidth::A32,
        mem_op: MemOp::I32,
        value: Box::new(value),
        value_kind: ValKind::I32,
        align_log2: 2,
        atomic: false,
    }
}

pub fn if_else(cond: Expr, ty: Type, then: Expr, else_: Expr) -> Expr {
    Expr::IfElse {
        cond: Box::new(cond),
        ty,
        then: Box::new(then),
        else_: Box::new(else_),
    }
}

pub fn ret(value: Option<Expr>) -> Expr {
    Expr::Return {
        value: value.map(Box::new),
    }
}
