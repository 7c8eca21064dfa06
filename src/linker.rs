// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use crate::compartment::{Compartment, Object};
use crate::instance::{instantiate_module, ImportBindings, Instance};
use crate::ir::ImportKind;
use crate::module::Module;
use crate::quota::ResourceQuota;
use crate::types::ExternType;
use crate::{Error, Result};

/// Resolves one import to an object, or declines.
pub trait Resolver {
    fn resolve(&mut self, module: &str, name: &str, expected: &ExternType) -> Option<Object>;
}

impl<F> Resolver for F
where
    F: FnMut(&str, &str, &ExternType) -> Option<Object>,
{
    fn resolve(&mut self, module: &str, name: &str, expected: &ExternType) -> Option<Object> {
        self(module, name, expected)
    }
}

/// A name-keyed [`Resolver`]: definitions registered up front, looked up at
/// instantiation.
#[derive(Debug, Default)]
pub struct Linker {
    string2idx: HashMap<Arc<str>, usize>,
    strings: Vec<Arc<str>>,
    map: HashMap<ImportKey, Object>,
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
struct ImportKey {
    module: usize,
    name: usize,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines `module::name`. Redefinition is an error.
    pub fn define(&mut self, module: &str, name: &str, object: Object) -> Result<&mut Self> {
        let key = self.import_key(module, name);
        match self.map.entry(key) {
            Entry::Occupied(_) => Err(Error::InvalidArgument("name is already defined")),
            Entry::Vacant(vacant) => {
                vacant.insert(object);
                Ok(self)
            }
        }
    }

    /// Defines every export of `instance` under `module_name`.
    pub fn define_instance(
        &mut self,
        compartment: &Compartment,
        module_name: &str,
        instance: Instance,
    ) -> Result<&mut Self> {
        for (name, object) in instance.exports(compartment)? {
            let key = self.import_key(module_name, &name);
            match self.map.entry(key) {
                Entry::Occupied(_) => {
                    return Err(Error::InvalidArgument("name is already defined"))
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(object);
                }
            }
        }
        Ok(self)
    }

    pub fn get(&self, module: &str, name: &str) -> Option<Object> {
        let key = ImportKey {
            module: *self.string2idx.get(module)?,
            name: *self.string2idx.get(name)?,
        };
        self.map.get(&key).copied()
    }

    /// Resolves `module`'s imports against this linker and instantiates it.
    pub fn instantiate(
        &mut self,
        compartment: &Compartment,
        module: &Module,
        debug_name: impl Into<String>,
        quota: Option<&ResourceQuota>,
    ) -> Result<Instance> {
        let bindings = link_module(compartment, module, self)?;
        instantiate_module(compartment, module, bindings, debug_name, quota)
    }

    fn import_key(&mut self, module: &str, name: &str) -> ImportKey {
        ImportKey {
            module: self.intern_str(module),
            name: self.intern_str(name),
        }
    }

    fn intern_str(&mut self, string: &str) -> usize {
        if let Some(idx) = self.string2idx.get(string) {
            return *idx;
        }
        let string: Arc<str> = string.into();
        let idx = self.strings.len();
        self.strings.push(string.clone());
        self.string2idx.insert(string, idx);
        idx
    }
}

impl Resolver for Linker {
    fn resolve(&mut self, module: &str, name: &str, _expected: &ExternType) -> Option<Object> {
        self.get(module, name)
    }
}

/// Calls the resolver exactly once per import, in declaration order,
/// failing on the first unresolved or wrong-typed import.
pub fn link_module(
    compartment: &Compartment,
    module: &Module,
    resolver: &mut dyn Resolver,
) -> Result<ImportBindings> {
    let ir = module.ir();
    let mut bindings = ImportBindings::with_capacity(ir.imports.len());

    for import in &ir.imports {
        let expected = expected_extern_type(ir, &import.ty);
        let object = resolver
            .resolve(&import.module, &import.name, &expected)
            .ok_or_else(|| {
                Error::ImportTypeMismatch(format!(
                    "missing {} import {}::{}",
                    expected.desc(),
                    import.module,
                    import.name
                ))
            })?;

        if !compartment.is_a(object, &expected) {
            return Err(Error::ImportTypeMismatch(format!(
                "import {}::{} resolved to the wrong type",
                import.module, import.name
            )));
        }
        bindings.push(object);
    }

    Ok(bindings)
}

fn expected_extern_type(ir: &crate::ir::Module, kind: &ImportKind) -> ExternType {
    match kind {
        ImportKind::Func { type_index } => {
            ExternType::Func(ir.types[*type_index as usize].clone())
        }
        ImportKind::Table(ty) => ExternType::Table(*ty),
        ImportKind::Memory(ty) => ExternType::Memory(*ty),
        ImportKind::Global(ty) => ExternType::Global(*ty),
        ImportKind::ExceptionType(params) => {
            ExternType::ExceptionType(params.iter().copied().collect())
        }
    }
}
