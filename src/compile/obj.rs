// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The precompiled-object carrier: a self-describing ELF image with the
//! module's text section and three custom sections.
//!
//! - `.vessel.info`: magic, format version, and the IR module's structural
//!   fingerprint. Loading checks all three.
//! - `.vessel.traps`: `(code offset, trap kind)` records sorted by offset.
//! - `.vessel.funcs`: per defined function, the text locations of its body
//!   and of its array-call trampoline.
//!
//! Calls between functions are resolved to pc-relative form when the text
//! section is laid out, and builtins/imports are reached through the
//! VMContext, so reloading an image is a copy plus an mprotect: there are no
//! load-time relocations.

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::isa::TargetIsa;
use object::write::{Object, StandardSegment, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, LittleEndian, Object as _, ObjectSection as _,
    SectionKind, SymbolFlags, SymbolKind, SymbolScope, U32Bytes,
};

use crate::compile::{CompiledFunction, RelocationTarget};
use crate::errors::{CompileError, Error};
use crate::trap::TrapKind;
use crate::vm::code::FunctionLoc;
use crate::Result;

pub const ELF_TEXT: &str = ".text";
pub const ELF_VESSEL_INFO: &str = ".vessel.info";
pub const ELF_VESSEL_TRAPS: &str = ".vessel.traps";
pub const ELF_VESSEL_FUNCS: &str = ".vessel.funcs";

const INFO_MAGIC: u32 = u32::from_le_bytes(*b"VSL\0");
const INFO_VERSION: u32 = 1;

/// One function to append: its compiled form and a symbol name.
pub struct CompileOutput {
    pub function: CompiledFunction,
    pub symbol: String,
}

/// Serializes compiled functions into the carrier format.
///
/// `outputs` holds the wasm function bodies first, then the array-call
/// trampolines, both in defined-function order; `num_defined` is the count
/// of each. Intra-module call relocations are resolved against that layout.
pub fn build_object(
    isa: &dyn TargetIsa,
    outputs: Vec<CompileOutput>,
    num_defined: u32,
    num_imported_funcs: u32,
    fingerprint: u64,
) -> Result<Vec<u8>, CompileError> {
    let mut obj = Object::new(
        BinaryFormat::Elf,
        object_architecture(isa),
        Endianness::Little,
    );

    let text_section = obj.add_section(
        obj.segment_name(StandardSegment::Text).to_vec(),
        ELF_TEXT.as_bytes().to_vec(),
        SectionKind::Text,
    );

    let mut text_builder = isa.text_section_builder(outputs.len());
    let mut ctrl_plane = ControlPlane::default();
    let mut locs = Vec::with_capacity(outputs.len());
    let mut traps = TrapSectionBuilder::default();

    for output in &outputs {
        let body = output.function.buffer.data();
        let alignment = output.function.alignment;
        let body_len = body.len() as u64;
        let off = text_builder.append(true, body, alignment, &mut ctrl_plane);

        for reloc in output.function.relocations()? {
            let RelocationTarget::Wasm(func_index) = reloc.target;
            // Imported functions are never relocation targets; calls to them
            // go through the VMContext.
            let defined = func_index
                .checked_sub(num_imported_funcs)
                .expect("relocation against an imported function");
            let resolved = text_builder.resolve_reloc(
                off + u64::from(reloc.offset),
                reloc.kind,
                reloc.addend,
                defined as usize,
            );
            debug_assert!(resolved, "unresolvable relocation {:?}", reloc.kind);
        }

        let loc = FunctionLoc {
            start: u32::try_from(off).unwrap(),
            length: u32::try_from(body_len).unwrap(),
        };
        traps.push_traps(&loc, output.function.traps());
        locs.push(loc);

        obj.add_symbol(Symbol {
            name: output.symbol.as_bytes().to_vec(),
            value: off,
            size: body_len,
            kind: SymbolKind::Text,
            scope: SymbolScope::Compilation,
            weak: false,
            section: SymbolSection::Section(text_section),
            flags: SymbolFlags::None,
        });
    }

    let text = text_builder.finish(&mut ctrl_plane);
    obj.section_mut(text_section).set_data(text, 16);

    traps.append(&mut obj);

    // Function locations: count, then (wasm loc, trampoline loc) pairs.
    let funcs_section = obj.add_section(
        obj.segment_name(StandardSegment::Data).to_vec(),
        ELF_VESSEL_FUNCS.as_bytes().to_vec(),
        SectionKind::ReadOnlyData,
    );
    let mut funcs = Vec::new();
    funcs.extend_from_slice(&num_defined.to_le_bytes());
    for def_index in 0..num_defined as usize {
        let wasm = locs[def_index];
        let array = locs[num_defined as usize + def_index];
        for word in [wasm.start, wasm.length, array.start, array.length] {
            funcs.extend_from_slice(&word.to_le_bytes());
        }
    }
    obj.append_section_data(funcs_section, &funcs, 1);

    let info_section = obj.add_section(
        obj.segment_name(StandardSegment::Data).to_vec(),
        ELF_VESSEL_INFO.as_bytes().to_vec(),
        SectionKind::ReadOnlyData,
    );
    let mut info = Vec::new();
    info.extend_from_slice(&INFO_MAGIC.to_le_bytes());
    info.extend_from_slice(&INFO_VERSION.to_le_bytes());
    info.extend_from_slice(&fingerprint.to_le_bytes());
    obj.append_section_data(info_section, &info, 1);

    obj.write()
        .map_err(|error| CompileError::UnsupportedReloc(format!("object emission failed: {error}")))
}

fn object_architecture(isa: &dyn TargetIsa) -> Architecture {
    use target_lexicon::Architecture as A;
    match isa.triple().architecture {
        A::X86_64 => Architecture::X86_64,
        A::Aarch64(_) => Architecture::Aarch64,
        _ => unimplemented!("unsupported target architecture"),
    }
}

/// The deserialized side of [`build_object`].
#[derive(Debug)]
pub struct ParsedObject<'a> {
    pub text: &'a [u8],
    pub trap_offsets: Vec<u32>,
    pub traps: Vec<TrapKind>,
    /// Per defined function: (body, array trampoline).
    pub funcs: Vec<(FunctionLoc, FunctionLoc)>,
}

/// Parses a carrier image, verifying version and fingerprint.
pub fn parse_object<'a>(bytes: &'a [u8], expected_fingerprint: u64) -> Result<ParsedObject<'a>> {
    let file = object::File::parse(bytes)
        .map_err(|error| Error::PrecompiledMismatch(format!("unparseable object: {error}")))?;

    let section_data = |name: &str| -> Result<&'a [u8]> {
        let section = file
            .section_by_name(name)
            .ok_or_else(|| Error::PrecompiledMismatch(format!("missing section {name}")))?;
        section
            .data()
            .map_err(|error| Error::PrecompiledMismatch(format!("bad section {name}: {error}")))
    };

    let info = section_data(ELF_VESSEL_INFO)?;
    if info.len() != 16 {
        return Err(Error::PrecompiledMismatch("truncated info section".into()));
    }
    let magic = u32::from_le_bytes(info[0..4].try_into().unwrap());
    let version = u32::from_le_bytes(info[4..8].try_into().unwrap());
    let fingerprint = u64::from_le_bytes(info[8..16].try_into().unwrap());
    if magic != INFO_MAGIC {
        return Err(Error::PrecompiledMismatch("bad magic".into()));
    }
    if version != INFO_VERSION {
        return Err(Error::PrecompiledMismatch(format!(
            "format version {version}, expected {INFO_VERSION}"
        )));
    }
    if fingerprint != expected_fingerprint {
        return Err(Error::PrecompiledMismatch(format!(
            "module fingerprint {fingerprint:#x}, expected {expected_fingerprint:#x}"
        )));
    }

    let text = section_data(ELF_TEXT)?;

    let traps_data = section_data(ELF_VESSEL_TRAPS)?;
    let (trap_offsets, traps) = parse_traps(traps_data)?;

    let funcs_data = section_data(ELF_VESSEL_FUNCS)?;
    let funcs = parse_funcs(funcs_data)?;

    Ok(ParsedObject {
        text,
        trap_offsets,
        traps,
        funcs,
    })
}

fn parse_traps(data: &[u8]) -> Result<(Vec<u32>, Vec<TrapKind>)> {
    let malformed = || Error::PrecompiledMismatch("malformed trap section".into());

    let count = u32::from_le_bytes(data.get(0..4).ok_or_else(malformed)?.try_into().unwrap());
    let count = count as usize;
    let offsets_end = 4 + count * 4;

    let offset_bytes = data.get(4..offsets_end).ok_or_else(malformed)?;
    let kind_bytes = data
        .get(offsets_end..offsets_end + count)
        .ok_or_else(malformed)?;

    let offsets = offset_bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    let kinds = kind_bytes
        .iter()
        .map(|byte| TrapKind::try_from(*byte).map_err(|()| malformed()))
        .collect::<Result<Vec<_>>>()?;

    Ok((offsets, kinds))
}

fn parse_funcs(data: &[u8]) -> Result<Vec<(FunctionLoc, FunctionLoc)>> {
    let malformed = || Error::PrecompiledMismatch("malformed function section".into());

    let count = u32::from_le_bytes(data.get(0..4).ok_or_else(malformed)?.try_into().unwrap());
    let mut funcs = Vec::with_capacity(count as usize);
    let mut cursor = 4usize;
    for _ in 0..count {
        let mut words = [0u32; 4];
        for word in &mut words {
            *word = u32::from_le_bytes(
                data.get(cursor..cursor + 4)
                    .ok_or_else(malformed)?
                    .try_into()
                    .unwrap(),
            );
            cursor += 4;
        }
        funcs.push((
            FunctionLoc {
                start: words[0],
                length: words[1],
            },
            FunctionLoc {
                start: words[2],
                length: words[3],
            },
        ));
    }
    Ok(funcs)
}

/// Accumulates trap records across functions into the carrier's trap
/// section layout: count, offsets, kinds.
#[derive(Default)]
struct TrapSectionBuilder {
    offsets: Vec<U32Bytes<LittleEndian>>,
    traps: Vec<u8>,
}

impl TrapSectionBuilder {
    fn push_traps(&mut self, func: &FunctionLoc, traps: impl Iterator<Item = (u32, TrapKind)>) {
        for (offset, kind) in traps {
            let pos = func.start + offset;
            self.offsets.push(U32Bytes::new(LittleEndian, pos));
            self.traps.push(kind.into());
        }
    }

    fn append(self, obj: &mut Object<'_>) {
        let traps_section = obj.add_section(
            obj.segment_name(StandardSegment::Data).to_vec(),
            ELF_VESSEL_TRAPS.as_bytes().to_vec(),
            SectionKind::ReadOnlyData,
        );

        let amt = u32::try_from(self.traps.len()).unwrap();
        obj.append_section_data(traps_section, &amt.to_le_bytes(), 1);
        obj.append_section_data(traps_section, object::bytes_of_slice(&self.offsets), 1);
        obj.append_section_data(traps_section, &self.traps, 1);
    }
}
