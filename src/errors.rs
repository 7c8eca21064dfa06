// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Setup errors surfaced synchronously by the runtime API.
///
/// These are never promoted to runtime exceptions; compiled code reports its
/// failures through the exception taxonomy instead.
#[derive(onlyerror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An import could not be resolved or resolved to an object of the wrong
    /// extern type.
    #[error("import type mismatch: {0}")]
    ImportTypeMismatch(String),
    /// A function table was declared with an element count that is not a
    /// power of two.
    #[error("invalid table size: {0}")]
    InvalidTableSize(u64),
    /// A precompiled object's version or fingerprint does not match the IR
    /// module it was loaded with.
    #[error("precompiled object does not match the module IR: {0}")]
    PrecompiledMismatch(String),
    /// Address-space reservation or page commit failed.
    #[error("out of memory")]
    OutOfMemory,
    /// The operation would exceed the attached resource quota.
    #[error("resource quota exceeded")]
    QuotaExceeded,
    /// The operation would exceed the entity's declared maximum size.
    #[error("page limit exceeded")]
    PageLimit,
    /// A data segment targets a range outside the memory's committed pages.
    /// Carries the segment's offset and length.
    #[error("data segment is out of bounds")]
    OutOfBoundsDataSegment(u64, u64),
    /// An element segment targets a range outside the table's current size.
    /// Carries the segment's offset and length.
    #[error("element segment is out of bounds")]
    OutOfBoundsElemSegment(u64, u64),
    /// Out-of-bounds access through the host table/memory API.
    #[error("out of bounds access at {0}")]
    OutOfBounds(u64),
    /// A handle did not refer to a live object of the expected kind, or a
    /// remap target is not a clone-descendant of the object's compartment.
    #[error("not found")]
    NotFound,
    /// The caller violated an API contract (e.g. root counter underflow,
    /// re-initializing an immutable global).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// An argument did not satisfy the operation's requirements.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Compilation of the IR module failed.
    #[error("compilation failed: {0}")]
    Compile(CompileError),
}

/// Errors produced while lowering IR to machine code.
#[derive(onlyerror::Error, Debug)]
pub enum CompileError {
    /// The input IR is malformed (e.g. a branch to a target that is not in
    /// scope). Well-typed IR never produces this.
    #[error("malformed IR: {0}")]
    MalformedIr(String),
    /// Cranelift IR to machine code compilation failed.
    #[error("code generation failed: {0}")]
    Codegen(cranelift_codegen::CodegenError),
    /// The generated code requires a relocation kind the runtime cannot
    /// resolve on this target.
    #[error("unsupported relocation: {0}")]
    UnsupportedReloc(String),
}

impl From<CompileError> for Error {
    fn from(error: CompileError) -> Self {
        Self::Compile(error)
    }
}

impl<'a> From<cranelift_codegen::CompileError<'a>> for CompileError {
    fn from(error: cranelift_codegen::CompileError<'a>) -> Self {
        Self::Codegen(error.inner)
    }
}
