// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

/// The kind of a runtime value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValKind {
    I32,
    I64,
    F32,
    F64,
    V128,
    /// A reference to a function.
    FuncRef,
    /// An opaque reference to any runtime object.
    AnyRef,
    /// The bottom reference kind; only the null reference inhabits it.
    NullRef,
}

impl ValKind {
    pub fn is_reference(self) -> bool {
        matches!(self, Self::FuncRef | Self::AnyRef | Self::NullRef)
    }
}

impl fmt::Display for ValKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::V128 => "v128",
            Self::FuncRef => "funcref",
            Self::AnyRef => "anyref",
            Self::NullRef => "nullref",
        };
        f.write_str(s)
    }
}

/// The type of a function: parameter kinds and result kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: Arc<[ValKind]>,
    results: Arc<[ValKind]>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValKind>,
        results: impl IntoIterator<Item = ValKind>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    pub fn params(&self) -> &[ValKind] {
        &self.params
    }

    pub fn results(&self) -> &[ValKind] {
        &self.results
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}")?;
        }
        f.write_str(") -> (")?;
        for (i, r) in self.results.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}")?;
        }
        f.write_str(")")
    }
}

/// Whether a global may be re-assigned after initialization.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mutability {
    Const,
    Var,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub content: ValKind,
    pub mutability: Mutability,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TableType {
    pub element: ValKind,
    pub minimum: u64,
    pub maximum: Option<u64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemoryType {
    /// Initial size, in WebAssembly pages.
    pub minimum: u64,
    /// Optional declared maximum size, in WebAssembly pages.
    pub maximum: Option<u64>,
}

/// The type of an importable/exportable entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternType {
    Func(FuncType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
    ExceptionType(Arc<[ValKind]>),
}

impl ExternType {
    pub fn desc(&self) -> &'static str {
        match self {
            Self::Func(_) => "function",
            Self::Table(_) => "table",
            Self::Memory(_) => "memory",
            Self::Global(_) => "global",
            Self::ExceptionType(_) => "exception type",
        }
    }
}

/// An engine-wide intern table for function types.
///
/// The interned index is the signature tag compiled into indirect-call
/// checks and stored in every function reference, so two functions have the
/// same tag iff their types are structurally equal.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    map: HashMap<FuncType, u32>,
    list: Vec<FuncType>,
}

impl TypeRegistry {
    pub fn intern(&mut self, ty: &FuncType) -> u32 {
        if let Some(index) = self.map.get(ty) {
            return *index;
        }
        let index = u32::try_from(self.list.len()).unwrap();
        self.list.push(ty.clone());
        self.map.insert(ty.clone(), index);
        index
    }

    pub fn lookup(&self, index: u32) -> Option<&FuncType> {
        self.list.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_registry_interns_structurally() {
        let mut registry = TypeRegistry::default();
        let a = FuncType::new([ValKind::I32, ValKind::I32], [ValKind::I32]);
        let b = FuncType::new([ValKind::I32, ValKind::I32], [ValKind::I32]);
        let c = FuncType::new([ValKind::I64], []);

        let ia = registry.intern(&a);
        let ib = registry.intern(&b);
        let ic = registry.intern(&c);

        assert_eq!(ia, ib);
        assert_ne!(ia, ic);
        assert_eq!(registry.lookup(ia), Some(&a));
    }
}
