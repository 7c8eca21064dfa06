// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cranelift_codegen::settings::{self, Configurable};

use crate::emit::Compiler;
use crate::types::{FuncType, TypeRegistry};
use crate::{traphandler, Error, Result};

/// Optimization level for generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub opt_level: OptLevel,
    /// Stack budget for compiled code, enforced by prologue checks.
    pub max_wasm_stack: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::default(),
            max_wasm_stack: 512 * 1024,
        }
    }
}

/// Globally shared state: the compiler for the host target, the function
/// type intern table whose indices are signature tags, and id allocators
/// for compartments and modules.
#[derive(Clone)]
pub struct Engine(Arc<EngineShared>);

struct EngineShared {
    compiler: Compiler,
    config: EngineConfig,
    types: Mutex<TypeRegistry>,
    compartment_id_allocator: UniqueIdAllocator,
}

/// Simple struct to hand out globally unique numbers that can be used as identifiers
struct UniqueIdAllocator {
    next: AtomicU64,
}

impl UniqueIdAllocator {
    /// Ids start at 1; 0 is the null compartment in packed object handles.
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        // Compiled code relies on signal conversion from the moment the
        // first trap site exists.
        traphandler::ensure_signal_handlers();

        let mut flags = settings::builder();
        let opt = match config.opt_level {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        };
        flags
            .set("opt_level", opt)
            .expect("invalid opt_level setting");
        // Backtrace capture walks frame pointer chains through compiled
        // frames.
        flags
            .enable("preserve_frame_pointers")
            .expect("invalid flag");
        flags.set("unwind_info", "false").expect("invalid flag");

        let isa_builder = cranelift_native::builder().map_err(|msg| {
            tracing::error!("unsupported host: {msg}");
            Error::InvalidArgument("unsupported host architecture")
        })?;
        let isa = isa_builder
            .finish(settings::Flags::new(flags))
            .map_err(|error| {
                tracing::error!("failed to construct target ISA: {error}");
                Error::InvalidArgument("failed to construct target ISA")
            })?;

        Ok(Self(Arc::new(EngineShared {
            compiler: Compiler::new(isa),
            config,
            types: Mutex::new(TypeRegistry::default()),
            compartment_id_allocator: UniqueIdAllocator::new(),
        })))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.0.config
    }

    pub(crate) fn compiler(&self) -> &Compiler {
        &self.0.compiler
    }

    /// Interns a function type, returning its signature tag.
    pub(crate) fn intern_type(&self, ty: &FuncType) -> u32 {
        self.0.types.lock().unwrap().intern(ty)
    }

    pub(crate) fn lookup_type(&self, tag: u32) -> Option<FuncType> {
        self.0.types.lock().unwrap().lookup(tag).cloned()
    }

    pub(crate) fn next_compartment_id(&self) -> u64 {
        self.0.compartment_id_allocator.next()
    }

    /// Whether two engine handles refer to the same engine (signature tags
    /// are only comparable within one engine).
    pub fn same(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.0.config)
            .finish_non_exhaustive()
    }
}
