//! The extended dynamic object format (XDF).
//!
//! A small, fixed-record format: a 16-byte file header, 40-byte section
//! headers, 16-byte symbol records and 16-byte relocations, everything
//! little-endian. Every symbol goes to the symbol table (the format has no
//! local/global distinction on the wire beyond a flag), and section names
//! are themselves symbols referenced by index from the section headers.

use std::any::Any;
use std::io::SeekFrom;

use bstr::BString;

use yasm_core::{
    Arch, AssocData, Binding, BytecodeOutput, Directives, Errwarns, Error, ExprCtx, Line,
    Location, NullOutput, Object, ObjectFormat, Reloc, SectionId, SubValue, SymbolId, Value,
    Visibility, WriteSeek,
};

use crate::{render_section, resolve_u64, w16, w32, w64};

const SECTION_KEY: &str = "objfmt::xdf::XdfSectionData";

const XDF_MAGIC: u32 = 0x8765_4322;
const FILEHEAD_SIZE: u64 = 16;
const SECTHEAD_SIZE: u64 = 40;
const SYMBOL_SIZE: u64 = 16;
const RELOC_SIZE: u64 = 16;

// Symbol flags.
const SYM_EXTERN: u32 = 1;
const SYM_GLOBAL: u32 = 2;
const SYM_EQU: u32 = 4;

// Section flags.
const SECT_ABSOLUTE: u16 = 0x01;
const SECT_FLAT: u16 = 0x02;
const SECT_BSS: u16 = 0x04;
const SECT_USE_16: u16 = 0x10;
const SECT_USE_32: u16 = 0x20;
const SECT_USE_64: u16 = 0x40;

// Relocation types.
const RELOC_REL: u8 = 1;
const RELOC_WRT: u8 = 2;
const RELOC_RIP: u8 = 4;
const RELOC_SEG: u8 = 8;

/// Per-section XDF state.
#[derive(Debug)]
struct XdfSectionData {
    /// The section-name symbol.
    sym: SymbolId,
    /// `use16`/`use32`/`use64` of the section.
    bits: u32,
    /// Marked `flat` by the user.
    flat: bool,
}

impl AssocData for XdfSectionData {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The XDF object format.
#[derive(Debug, Default)]
pub struct XdfObject;

impl XdfObject {
    /// Creates the format.
    pub fn new() -> Self {
        Self
    }

    fn init_section(object: &mut Object, id: SectionId) {
        // The section name doubles as a label at the section start.
        let name = object.section(id).name().to_owned();
        let sym = object.get_symbol(&name);
        let _ = object.symbols_mut().get_mut(sym).define_label(
            Location { section: id, bc: 0, off: 0 },
            0,
        );

        object
            .section_mut(id)
            .assoc_mut()
            .insert(SECTION_KEY, Box::new(XdfSectionData { sym, bits: 32, flat: false }));
    }
}

fn section_directive(
    object: &mut Object,
    namevals: &[yasm_core::NameValue],
    _line: Line,
) -> Result<(), Error> {
    let name = namevals
        .first()
        .and_then(yasm_core::NameValue::as_string)
        .ok_or_else(|| Error::Syntax("section directive requires a name".to_owned()))?
        .to_owned();

    let known = object.find_section(&name).is_some();
    let id = object.append_section(&name);
    if !known {
        XdfObject::init_section(object, id);
    }

    let mut absolute = None;
    let mut virtual_addr = None;
    let mut align = None;
    let mut use16 = false;
    let mut use32 = false;
    let mut use64 = false;
    let mut bss = false;
    let mut code = false;
    let mut text = false;
    let mut data = false;
    let mut flat = false;

    {
        let mut helpers = yasm_core::DirHelpers::new();
        helpers.add_expr("absolute", &mut absolute);
        helpers.add_expr("virtual", &mut virtual_addr);
        helpers.add_expr("align", &mut align);
        helpers.add_flag("use16", &mut use16);
        helpers.add_flag("use32", &mut use32);
        helpers.add_flag("use64", &mut use64);
        helpers.add_flag("bss", &mut bss);
        helpers.add_flag("code", &mut code);
        helpers.add_flag("text", &mut text);
        helpers.add_flag("data", &mut data);
        helpers.add_flag("flat", &mut flat);
        helpers.operate(&namevals[1..])?;
    }
    let code = code || text;

    if let Some(align) = align {
        let align = resolve_u64(&align, object, "section alignment")?;
        if !align.is_power_of_two() || align > 4096 {
            return Err(Error::Value(format!(
                "invalid section alignment {align}"
            )));
        }
        object.section_mut(id).set_align(align);
    }
    if let Some(absolute) = absolute {
        let address = resolve_u64(&absolute, object, "section address")?;
        object.section_mut(id).set_lma(address);
    }
    if let Some(virtual_addr) = virtual_addr {
        let address = resolve_u64(&virtual_addr, object, "section virtual address")?;
        object.section_mut(id).set_vma(address);
    }

    {
        let section = object.section_mut(id);
        if code {
            section.set_code(true);
        }
        if bss {
            section.set_bss(true);
        }
        if data {
            section.set_bss(false);
        }

        let xdf = section
            .assoc_mut()
            .get_mut::<XdfSectionData>(SECTION_KEY)
            .expect("xdf section data missing");
        if use16 {
            xdf.bits = 16;
        }
        if use32 {
            xdf.bits = 32;
        }
        if use64 {
            xdf.bits = 64;
        }
        if flat {
            xdf.flat = true;
        }
    }

    object.set_cur_section(id);
    Ok(())
}

struct XdfOutput<'a> {
    object: &'a Object,
    arch: &'a dyn Arch,
    errwarns: &'a mut Errwarns,
    section: SectionId,
    buffer: Vec<u8>,
    relocs: Vec<Reloc>,
}

impl BytecodeOutput for XdfOutput<'_> {
    fn output_value(
        &mut self,
        value: &mut Value,
        buffer: &mut Vec<u8>,
        _loc: Location,
    ) -> Result<(), Error> {
        let ctx = ExprCtx::full(self.object.symbols(), self.object.sections());

        // Constant and same-section PC-relative values resolve here.
        if value.output_basic(buffer, &ctx, self.arch, self.errwarns)? {
            return Ok(());
        }

        if value.is_section_rel() {
            return Err(Error::TooComplex("xdf: relocation too complex".to_owned()));
        }

        let size = value.size();
        let field_addr = self.buffer.len() as u64 + buffer.len() as u64;

        let Some(rel) = value.take_rel() else {
            return Err(Error::TooComplex("xdf: relocation too complex".to_owned()));
        };

        let mut stored: i128 = 0;

        // RIP-relative: the subtracted location must sit in this section;
        // the stored value is taken relative to the section start.
        let mut pc_rel = false;
        if let Some(sub) = value.take_sub() {
            let SubValue::Loc(sub_loc) = sub else {
                return Err(Error::TooComplex("xdf: relocation too complex".to_owned()));
            };
            if sub_loc.section != self.section {
                return Err(Error::TooComplex("xdf: relocation too complex".to_owned()));
            }
            pc_rel = true;
            stored -= self.object.loc_offset(sub_loc).unwrap_or(0) as i128;
        }

        let kind = if pc_rel {
            RELOC_RIP
        } else if value.is_seg_of() {
            RELOC_SEG
        } else if value.wrt().is_some() {
            RELOC_WRT
        } else {
            RELOC_REL
        };

        self.relocs.push(Reloc {
            addr: field_addr,
            sym: rel,
            kind: u32::from(kind),
            size,
            shift: value.rshift(),
            rel: pc_rel,
            base: value.take_wrt(),
        });

        if let Some(abs) = value.abs() {
            let mut abs = abs.clone();
            abs.simplify(&ctx, true)?;
            stored += abs
                .get_intnum()
                .ok_or_else(|| Error::TooComplex("xdf: relocation too complex".to_owned()))?
                .as_i128();
        }

        let fits = self.arch.intnum_tobytes(
            &yasm_core::IntNum::new(stored),
            buffer,
            size,
            0,
            yasm_core::Signedness::Any,
        );
        if !fits {
            self.errwarns.warn_set(
                yasm_core::WarnClass::General,
                format!("value does not fit in {size} bit field"),
            );
        }

        Ok(())
    }

    fn output_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn output_gap(&mut self, len: u64) -> Result<(), Error> {
        self.errwarns.warn_set(
            yasm_core::WarnClass::UninitContents,
            "uninitialized space declared in code/data section: zeroing",
        );
        self.buffer.extend(std::iter::repeat(0).take(len as usize));
        Ok(())
    }
}

impl ObjectFormat for XdfObject {
    fn keyword(&self) -> &'static str {
        "xdf"
    }

    fn description(&self) -> &'static str {
        "Extended Dynamic Object format"
    }

    fn extension(&self) -> &'static str {
        "xdf"
    }

    fn default_x86_mode_bits(&self) -> u32 {
        32
    }

    fn add_default_section(&self, object: &mut Object) -> SectionId {
        let id = object.append_section(".text");
        object.section_mut(id).set_code(true);
        Self::init_section(object, id);
        object.set_cur_section(id);
        id
    }

    fn append_section(
        &self,
        object: &mut Object,
        name: &str,
        _line: Line,
    ) -> Result<SectionId, Error> {
        let known = object.find_section(name).is_some();
        let id = object.append_section(name);
        if !known {
            Self::init_section(object, id);
        }
        object.set_cur_section(id);
        Ok(id)
    }

    fn add_directives(&self, directives: &mut Directives) {
        directives.add(
            "section",
            Box::new(|object, namevals, _objext, line| section_directive(object, namevals, line)),
        );
    }

    fn output(
        &self,
        object: &mut Object,
        arch: &dyn Arch,
        writer: &mut dyn WriteSeek,
        _all_syms: bool,
        errwarns: &mut Errwarns,
    ) -> Result<(), Error> {
        // XDF always carries the full symbol table.
        let mut symbol_indices = std::collections::HashMap::new();
        let mut symbols = Vec::new();
        for (id, symbol) in object.symbols().iter() {
            if symbol.visibility().contains(Visibility::Common) {
                errwarns.propagate_error(
                    symbol.use_line(),
                    Error::Value(
                        "XDF object format does not support common variables".to_owned(),
                    ),
                );
                continue;
            }
            symbol_indices.insert(id, symbols.len() as u32);
            symbols.push(id);
        }

        // Render section data, collecting relocations.
        let nsections = object.sections().len();
        let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(nsections);
        for index in 0..nsections {
            let id = SectionId(index as u32);

            if object.section(id).is_bss() {
                let mut out = NullOutput::new(&mut *errwarns);
                render_section(object, arch, id, &mut out, |out| &mut *out.errwarns);
                buffers.push(Vec::new());
                continue;
            }

            let mut out = XdfOutput {
                object,
                arch,
                errwarns: &mut *errwarns,
                section: id,
                buffer: Vec::new(),
                relocs: Vec::new(),
            };
            render_section(object, arch, id, &mut out, |out| &mut *out.errwarns);

            let XdfOutput { buffer, relocs, .. } = out;
            buffers.push(buffer);
            object.section_mut(id).set_relocs(relocs);
        }

        if errwarns.num_errors(false) > 0 {
            return Ok(());
        }

        // Layout: headers, symbol table, string table, then data.
        let strtab_offset =
            FILEHEAD_SIZE + SECTHEAD_SIZE * nsections as u64 + SYMBOL_SIZE * symbols.len() as u64;

        let mut strtab = BString::from("");
        let mut strtab_offsets = Vec::with_capacity(symbols.len());
        for id in &symbols {
            strtab_offsets.push(strtab_offset + strtab.len() as u64);
            strtab.extend_from_slice(object.symbols().get(*id).name().as_bytes());
            strtab.push(0);
        }

        // Place section data (and relocations) after the string table.
        let mut filepos = strtab_offset + strtab.len() as u64;
        let mut data_pos = Vec::with_capacity(nsections);
        let mut reloc_pos = Vec::with_capacity(nsections);
        for (index, buffer) in buffers.iter().enumerate() {
            let section = &mut object.sections_mut()[index];
            if buffer.is_empty() {
                data_pos.push(0u64);
            } else {
                data_pos.push(filepos);
                section.set_filepos(filepos);
                filepos += buffer.len() as u64;
            }
            let nrelocs = section.relocs().len() as u64;
            if nrelocs == 0 {
                reloc_pos.push(0u64);
            } else {
                reloc_pos.push(filepos);
                filepos += nrelocs * RELOC_SIZE;
            }
        }

        let ctx = ExprCtx::full(object.symbols(), object.sections());
        let mut scratch = Vec::new();

        // File header.
        w32(&mut scratch, XDF_MAGIC);
        w32(&mut scratch, nsections as u32);
        w32(&mut scratch, symbols.len() as u32);
        w32(&mut scratch, (strtab_offset + strtab.len() as u64 - FILEHEAD_SIZE) as u32);
        debug_assert_eq!(scratch.len() as u64, FILEHEAD_SIZE);

        // Section headers.
        for (index, section) in object.sections().iter().enumerate() {
            let xdf = section
                .assoc()
                .get::<XdfSectionData>(SECTION_KEY)
                .expect("xdf section data missing");

            w32(&mut scratch, symbol_indices[&xdf.sym]);
            w64(&mut scratch, section.lma());
            w64(&mut scratch, if section.has_vma() { section.vma() } else { section.lma() });
            w16(&mut scratch, section.align() as u16);

            let mut flags: u16 = 0;
            if section.has_lma() {
                flags |= SECT_ABSOLUTE;
            }
            if xdf.flat {
                flags |= SECT_FLAT;
            }
            if section.is_bss() {
                flags |= SECT_BSS;
            }
            flags |= match xdf.bits {
                16 => SECT_USE_16,
                32 => SECT_USE_32,
                64 => SECT_USE_64,
                _ => 0,
            };
            w16(&mut scratch, flags);

            w32(&mut scratch, data_pos[index] as u32);
            w32(&mut scratch, section.size() as u32);
            w32(&mut scratch, reloc_pos[index] as u32);
            w32(&mut scratch, section.relocs().len() as u32);
        }

        // Symbol table.
        for (index, id) in symbols.iter().enumerate() {
            let symbol = object.symbols().get(*id);
            let visibility = symbol.visibility();

            let mut flags = 0u32;
            if visibility.contains(Visibility::Global) {
                flags |= SYM_GLOBAL;
            }

            // -1 = extern, -2 = absolute, -3 = debugging.
            let mut scnum: i32 = -3;
            let mut value: u32 = 0;

            match symbol.binding() {
                Binding::Label(loc) => {
                    scnum = loc.section.0 as i32;
                    value = object.loc_offset(*loc).unwrap_or(0) as u32;
                }
                Binding::Equ(expr) => {
                    let mut expr = expr.clone();
                    let constant = expr
                        .simplify(&ctx, true)
                        .ok()
                        .and_then(|()| expr.get_intnum().copied());
                    match constant {
                        Some(constant) => value = constant.to_u64().unwrap_or(0) as u32,
                        None if visibility.contains(Visibility::Global) => {
                            errwarns.propagate_error(
                                symbol.def_line(),
                                Error::NotConstant(
                                    "global EQU value not an integer expression".to_owned(),
                                ),
                            );
                        }
                        None => {}
                    }
                    flags |= SYM_EQU;
                    scnum = -2;
                }
                _ => {
                    if visibility.contains(Visibility::Extern) {
                        flags = SYM_EXTERN;
                        scnum = -1;
                    }
                }
            }

            w32(&mut scratch, scnum as u32);
            w32(&mut scratch, value);
            w32(&mut scratch, strtab_offsets[index] as u32);
            w32(&mut scratch, flags);
        }

        // String table.
        scratch.extend_from_slice(&strtab);

        // Section data and relocations.
        for (index, buffer) in buffers.iter().enumerate() {
            scratch.extend_from_slice(buffer);
            for reloc in object.sections()[index].relocs() {
                w32(&mut scratch, reloc.addr as u32);
                w32(&mut scratch, symbol_indices[&reloc.sym]);
                w32(&mut scratch, reloc.base.map_or(0, |base| symbol_indices[&base]));
                scratch.push(reloc.kind as u8);
                scratch.push((reloc.size / 8) as u8);
                scratch.push(reloc.shift as u8);
                scratch.push(0); // flags
            }
        }

        writer
            .seek(SeekFrom::Start(0))
            .map_err(|error| Error::Io(format!("could not seek on output file: {error}")))?;
        writer
            .write_all(&scratch)
            .map_err(|error| Error::Io(format!("write error: {error}")))?;

        Ok(())
    }
}
