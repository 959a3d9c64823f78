//! The COFF object format, in its plain `coff`, `win32` and `win64`
//! flavors.
//!
//! Relocation targets are symbol-table indices; references to defined
//! labels are redirected to their section's symbol with the label offset
//! folded into the addend, so only externals and sections ever appear as
//! targets.

use std::any::Any;
use std::io::SeekFrom;

use bstr::BString;

use yasm_core::{
    Arch, AssocData, Binding, BytecodeOutput, Directives, Errwarns, Error, ExprCtx, Line,
    Location, NullOutput, Object, ObjectFormat, Reloc, SectionId, SubValue, SymbolId, Value,
    Visibility, WriteSeek,
};

use crate::{render_section, resolve_u64, w16, w32};

const SECTION_KEY: &str = "objfmt::coff::CoffSectionData";

const MACHINE_I386: u16 = 0x014c;
const MACHINE_AMD64: u16 = 0x8664;

// Section characteristics.
const STYP_TEXT: u32 = 0x0000_0020;
const STYP_DATA: u32 = 0x0000_0040;
const STYP_BSS: u32 = 0x0000_0080;
const STYP_EXECUTE: u32 = 0x2000_0000;
const STYP_READ: u32 = 0x4000_0000;
const STYP_WRITE: u32 = 0x8000_0000;

// Storage classes.
const SCL_EXT: u8 = 2;
const SCL_STAT: u8 = 3;

// i386 relocation types.
const I386_ADDR16: u16 = 0x1;
const I386_REL16: u16 = 0x2;
const I386_ADDR32: u16 = 0x6;
const I386_REL32: u16 = 0x14;

// AMD64 relocation types.
const AMD64_ADDR64: u16 = 0x1;
const AMD64_ADDR32: u16 = 0x2;
const AMD64_REL32: u16 = 0x4;

const FILE_HEADER_SIZE: u64 = 20;
const SECTION_HEADER_SIZE: u64 = 40;
const SYMBOL_SIZE: u64 = 18;
const RELOC_SIZE: u64 = 10;

/// Which COFF dialect is being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoffFlavor {
    /// Plain (DJGPP) COFF.
    Coff,
    /// Win32 COFF.
    Win32,
    /// Win64 COFF.
    Win64,
}

/// Per-section characteristics chosen by the `section` directive.
#[derive(Debug)]
struct CoffSectionData {
    characteristics: u32,
}

impl AssocData for CoffSectionData {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The COFF object format.
#[derive(Debug)]
pub struct CoffObject {
    flavor: CoffFlavor,
}

impl CoffObject {
    /// Creates the format for one flavor.
    pub fn new(flavor: CoffFlavor) -> Self {
        Self { flavor }
    }

    fn machine(&self) -> u16 {
        match self.flavor {
            CoffFlavor::Coff | CoffFlavor::Win32 => MACHINE_I386,
            CoffFlavor::Win64 => MACHINE_AMD64,
        }
    }

    fn is_win(&self) -> bool {
        matches!(self.flavor, CoffFlavor::Win32 | CoffFlavor::Win64)
    }

    fn default_characteristics(name: &str) -> (u32, bool, bool) {
        // (characteristics, code, bss)
        match name {
            ".text" => (STYP_TEXT | STYP_EXECUTE | STYP_READ, true, false),
            ".bss" => (STYP_BSS | STYP_READ | STYP_WRITE, false, true),
            ".rdata" | ".rodata" => (STYP_DATA | STYP_READ, false, false),
            _ => (STYP_DATA | STYP_READ | STYP_WRITE, false, false),
        }
    }

    fn init_section(object: &mut Object, id: SectionId) {
        let name = object.section(id).name().to_owned();
        let (characteristics, code, bss) = Self::default_characteristics(&name);

        let section = object.section_mut(id);
        section.set_code(code);
        section.set_bss(bss);
        section.set_align(if code { 16 } else { 4 });
        section
            .assoc_mut()
            .insert(SECTION_KEY, Box::new(CoffSectionData { characteristics }));
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
        CoffObject::init_section(object, id);
    }

    let mut align = None;
    let mut code = false;
    let mut text = false;
    let mut data = false;
    let mut bss = false;
    let mut info = false;

    {
        let mut helpers = yasm_core::DirHelpers::new();
        helpers.add_expr("align", &mut align);
        helpers.add_flag("code", &mut code);
        helpers.add_flag("text", &mut text);
        helpers.add_flag("data", &mut data);
        helpers.add_flag("bss", &mut bss);
        helpers.add_flag("info", &mut info);
        helpers.operate(&namevals[1..])?;
    }
    let code = code || text;

    if let Some(align) = align {
        let align = resolve_u64(&align, object, "section alignment")?;
        if !align.is_power_of_two() {
            return Err(Error::Value(format!(
                "argument to `align` is not a power of two (value={align})"
            )));
        }
        if align > 8192 {
            return Err(Error::Value(
                "win32/win64 alignment cannot exceed 8192".to_owned(),
            ));
        }
        object.section_mut(id).set_align(align);
    }

    let characteristics = if code {
        Some((STYP_TEXT | STYP_EXECUTE | STYP_READ, true, false))
    } else if bss {
        Some((STYP_BSS | STYP_READ | STYP_WRITE, false, true))
    } else if data {
        Some((STYP_DATA | STYP_READ | STYP_WRITE, false, false))
    } else {
        None
    };

    if let Some((characteristics, code, bss)) = characteristics {
        let section = object.section_mut(id);
        section.set_code(code);
        section.set_bss(bss);
        section
            .assoc_mut()
            .get_mut::<CoffSectionData>(SECTION_KEY)
            .expect("coff section data missing")
            .characteristics = characteristics;
    }

    object.set_cur_section(id);
    Ok(())
}

/// One symbol-table entry, pre-rendered.
struct SymEntry {
    name: BString,
    value: u32,
    scnum: u16,
    sclass: u8,
    /// Section length, for the aux record of section symbols. The
    /// relocation count joins it at write time, once known.
    aux_section: Option<u32>,
}

/// The symbol table under construction: entries plus the index map used by
/// relocations. Indices count aux records, as COFF requires.
struct SymbolTable {
    entries: Vec<SymEntry>,
    next_index: u32,
    section_indices: Vec<u32>,
    symbol_indices: std::collections::HashMap<SymbolId, u32>,
}

impl SymbolTable {
    fn push(&mut self, entry: SymEntry) -> u32 {
        let index = self.next_index;
        self.next_index += 1 + u32::from(entry.aux_section.is_some());
        self.entries.push(entry);
        index
    }
}

fn build_symbol_table(
    object: &Object,
    all_syms: bool,
    errwarns: &mut Errwarns,
) -> SymbolTable {
    let mut table = SymbolTable {
        entries: Vec::new(),
        next_index: 0,
        section_indices: Vec::new(),
        symbol_indices: std::collections::HashMap::new(),
    };

    // Section symbols first; their aux records carry size and relocation
    // counts and are patched after the section data is rendered.
    for (number, section) in object.sections().iter().enumerate() {
        let index = table.push(SymEntry {
            name: BString::from(section.name()),
            value: 0,
            scnum: number as u16 + 1,
            sclass: SCL_STAT,
            aux_section: Some(section.size() as u32),
        });
        table.section_indices.push(index);
    }

    let ctx = ExprCtx::full(object.symbols(), object.sections());

    for (id, symbol) in object.symbols().iter() {
        if symbol.is_special() {
            continue;
        }

        let visibility = symbol.visibility();
        let external = visibility.intersects(Visibility::Global | Visibility::Extern | Visibility::Common);

        match symbol.binding() {
            Binding::Label(loc) => {
                if !external && !all_syms {
                    continue;
                }
                let offset = object.loc_offset(*loc).unwrap_or(0);
                let index = table.push(SymEntry {
                    name: BString::from(symbol.name()),
                    value: offset as u32,
                    scnum: loc.section.0 as u16 + 1,
                    sclass: if visibility.contains(Visibility::Global) {
                        SCL_EXT
                    } else {
                        SCL_STAT
                    },
                    aux_section: None,
                });
                table.symbol_indices.insert(id, index);
            }
            Binding::Equ(expr) => {
                if !external && !all_syms {
                    continue;
                }
                let mut expr = expr.clone();
                let value = expr
                    .simplify(&ctx, true)
                    .ok()
                    .and_then(|()| expr.get_intnum().copied());
                let Some(value) = value else {
                    if visibility.contains(Visibility::Global) {
                        errwarns.propagate_error(
                            symbol.def_line(),
                            Error::NotConstant(
                                "global EQU value not an integer expression".to_owned(),
                            ),
                        );
                    }
                    continue;
                };
                let index = table.push(SymEntry {
                    name: BString::from(symbol.name()),
                    value: value.to_u64().unwrap_or(0) as u32,
                    scnum: 0xffff, // Absolute.
                    sclass: if visibility.contains(Visibility::Global) {
                        SCL_EXT
                    } else {
                        SCL_STAT
                    },
                    aux_section: None,
                });
                table.symbol_indices.insert(id, index);
            }
            Binding::Undefined if external => {
                // Extern and common: section 0; commons carry their size as
                // the value.
                let value = match symbol.common_size() {
                    Some(size) => {
                        let mut size = size.clone();
                        size.simplify(&ctx, true)
                            .ok()
                            .and_then(|()| size.get_intnum().and_then(yasm_core::IntNum::to_u64))
                            .unwrap_or(0) as u32
                    }
                    None => 0,
                };
                let index = table.push(SymEntry {
                    name: BString::from(symbol.name()),
                    value,
                    scnum: 0,
                    sclass: SCL_EXT,
                    aux_section: None,
                });
                table.symbol_indices.insert(id, index);
            }
            _ => {}
        }
    }

    table
}

struct CoffOutput<'a> {
    object: &'a Object,
    arch: &'a dyn Arch,
    errwarns: &'a mut Errwarns,
    symtab: &'a SymbolTable,
    amd64: bool,
    section: SectionId,
    buffer: Vec<u8>,
    relocs: Vec<Reloc>,
}

impl CoffOutput<'_> {
    /// Target symbol index and extra addend for a relocation against
    /// `target`.
    fn reloc_target(&self, target: RelocTarget) -> Result<(u32, i128), Error> {
        match target {
            RelocTarget::Section(section, offset) => {
                Ok((self.symtab.section_indices[section.0 as usize], offset as i128))
            }
            RelocTarget::Symbol(symbol) => {
                match self.symtab.symbol_indices.get(&symbol) {
                    Some(index) => Ok((*index, 0)),
                    None => Err(Error::TooComplex(format!(
                        "coff: no symbol table entry for `{}`",
                        self.object.symbols().get(symbol).name()
                    ))),
                }
            }
        }
    }
}

enum RelocTarget {
    Section(SectionId, u64),
    Symbol(SymbolId),
}

impl BytecodeOutput for CoffOutput<'_> {
    fn output_value(
        &mut self,
        value: &mut Value,
        buffer: &mut Vec<u8>,
        _loc: Location,
    ) -> Result<(), Error> {
        let ctx = ExprCtx::full(self.object.symbols(), self.object.sections());

        if value.output_basic(buffer, &ctx, self.arch, self.errwarns)? {
            return Ok(());
        }

        if value.is_seg_of() || value.wrt().is_some() || value.is_section_rel() {
            return Err(Error::TooComplex("coff: relocation too complex".to_owned()));
        }

        let size = value.size();
        let field_addr = self.buffer.len() as u64 + buffer.len() as u64;

        // Find the relocation target: a symbol, or a location redirected to
        // its section symbol.
        let target = if let Some(rel) = value.take_rel() {
            match self.object.symbols().get(rel).label() {
                Some(loc) => RelocTarget::Section(
                    loc.section,
                    self.object.loc_offset(loc).unwrap_or(0),
                ),
                None => RelocTarget::Symbol(rel),
            }
        } else if let Some(loc) = value.take_abs_location() {
            RelocTarget::Section(loc.section, self.object.loc_offset(loc).unwrap_or(0))
        } else {
            return Err(Error::TooComplex("coff: relocation too complex".to_owned()));
        };

        // PC-relative values carry the subtracted end-of-instruction
        // location.
        let mut pc_rel = false;
        let mut addend_adjust: i128 = 0;
        if let Some(sub) = value.take_sub() {
            let SubValue::Loc(sub_loc) = sub else {
                return Err(Error::TooComplex("coff: relocation too complex".to_owned()));
            };
            if sub_loc.section != self.section {
                return Err(Error::TooComplex(
                    "coff: cannot subtract a location in another section".to_owned(),
                ));
            }
            pc_rel = true;

            // The stored displacement is taken relative to the end of the
            // relocated field; adjust when the field is not the last thing
            // in its instruction.
            let sub_addr = self.object.loc_offset(sub_loc).unwrap_or(0);
            let field_end = field_addr + u64::from(size / 8);
            addend_adjust = field_end as i128 - sub_addr as i128;
        }

        let (sym_index, target_offset) = self.reloc_target(target)?;

        let kind = match (self.amd64, pc_rel, size) {
            (false, false, 16) => I386_ADDR16,
            (false, false, 32) => I386_ADDR32,
            (false, true, 16) => I386_REL16,
            (false, true, 32) => I386_REL32,
            (true, false, 32) => AMD64_ADDR32,
            (true, false, 64) => AMD64_ADDR64,
            (true, true, 32) => {
                // REL32 .. REL32_5 encode how far the field end sits from
                // the instruction end.
                let distance = -addend_adjust;
                if !(0..=5).contains(&distance) {
                    return Err(Error::TooComplex(
                        "coff: PC-relative field too far from instruction end".to_owned(),
                    ));
                }
                addend_adjust = 0;
                AMD64_REL32 + distance as u16
            }
            _ => {
                return Err(Error::Value(format!(
                    "coff: {size}-bit relocations are not supported here"
                )));
            }
        };

        self.relocs.push(Reloc {
            addr: field_addr,
            sym: SymbolId(sym_index), // Carries the symtab index directly.
            kind: u32::from(kind),
            size,
            shift: 0,
            rel: pc_rel,
            base: None,
        });

        // Stored bytes: absolute portion plus target offset, PC-adjusted.
        let mut stored = target_offset + addend_adjust;
        if let Some(abs) = value.abs() {
            let mut abs = abs.clone();
            abs.simplify(&ctx, true)?;
            stored += abs
                .get_intnum()
                .ok_or_else(|| {
                    Error::TooComplex("coff: relocation addend not constant".to_owned())
                })?
                .as_i128();
        }

        let fits = self.arch.intnum_tobytes(
            &yasm_core::IntNum::new(stored),
            buffer,
            size,
            value.rshift(),
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

/// The string table: length-prefixed, offsets include the prefix.
#[derive(Default)]
struct StringTable {
    data: BString,
}

impl StringTable {
    fn add(&mut self, name: &[u8]) -> u32 {
        let offset = self.data.len() as u32 + 4;
        self.data.extend_from_slice(name);
        self.data.push(0);
        offset
    }
}

impl ObjectFormat for CoffObject {
    fn keyword(&self) -> &'static str {
        match self.flavor {
            CoffFlavor::Coff => "coff",
            CoffFlavor::Win32 => "win32",
            CoffFlavor::Win64 => "win64",
        }
    }

    fn description(&self) -> &'static str {
        match self.flavor {
            CoffFlavor::Coff => "COFF (DJGPP) object format",
            CoffFlavor::Win32 => "Win32 object format",
            CoffFlavor::Win64 => "Win64 object format",
        }
    }

    fn extension(&self) -> &'static str {
        match self.flavor {
            CoffFlavor::Coff => "o",
            CoffFlavor::Win32 | CoffFlavor::Win64 => "obj",
        }
    }

    fn default_x86_mode_bits(&self) -> u32 {
        match self.flavor {
            CoffFlavor::Coff | CoffFlavor::Win32 => 32,
            CoffFlavor::Win64 => 64,
        }
    }

    fn forced_machine(&self) -> Option<&'static str> {
        match self.flavor {
            CoffFlavor::Win64 => Some("amd64"),
            _ => None,
        }
    }

    fn add_default_section(&self, object: &mut Object) -> SectionId {
        let id = object.append_section(".text");
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
        all_syms: bool,
        errwarns: &mut Errwarns,
    ) -> Result<(), Error> {
        let nsections = object.sections().len();
        let symtab = build_symbol_table(object, all_syms, errwarns);

        // Render every section's data, collecting relocations.
        let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(nsections);
        for index in 0..nsections {
            let id = SectionId(index as u32);

            if object.section(id).is_bss() {
                let mut out = NullOutput::new(&mut *errwarns);
                render_section(object, arch, id, &mut out, |out| &mut *out.errwarns);
                buffers.push(Vec::new());
                continue;
            }

            let mut out = CoffOutput {
                object,
                arch,
                errwarns: &mut *errwarns,
                symtab: &symtab,
                amd64: self.machine() == MACHINE_AMD64,
                section: id,
                buffer: Vec::new(),
                relocs: Vec::new(),
            };
            render_section(object, arch, id, &mut out, |out| &mut *out.errwarns);

            let CoffOutput { buffer, relocs, .. } = out;
            buffers.push(buffer);
            object.section_mut(id).set_relocs(relocs);
        }

        if errwarns.num_errors(false) > 0 {
            return Ok(());
        }

        // File layout: header, section headers, data + relocs per section,
        // symbol table, string table.
        let mut filepos = FILE_HEADER_SIZE + SECTION_HEADER_SIZE * nsections as u64;
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
        let symtab_pos = filepos;

        let mut strtab = StringTable::default();

        // File header.
        let mut scratch = Vec::new();
        w16(&mut scratch, self.machine());
        w16(&mut scratch, nsections as u16);
        w32(&mut scratch, 0); // timestamp
        w32(&mut scratch, symtab_pos as u32);
        w32(&mut scratch, symtab.next_index);
        w16(&mut scratch, 0); // no optional header
        w16(&mut scratch, 0); // flags
        debug_assert_eq!(scratch.len() as u64, FILE_HEADER_SIZE);

        // Section headers.
        for (index, section) in object.sections().iter().enumerate() {
            let mut name8 = [0u8; 8];
            let name = section.name().as_bytes();
            if name.len() <= 8 {
                name8[..name.len()].copy_from_slice(name);
            } else {
                // Long names go to the string table as `/offset`.
                let offset = strtab.add(name);
                let reference = format!("/{offset}");
                name8[..reference.len()].copy_from_slice(reference.as_bytes());
            }
            scratch.extend_from_slice(&name8);

            let mut characteristics = section
                .assoc()
                .get::<CoffSectionData>(SECTION_KEY)
                .map(|data| data.characteristics)
                .unwrap_or(STYP_DATA | STYP_READ | STYP_WRITE);
            if self.is_win() {
                // IMAGE_SCN_ALIGN_*: (log2(align) + 1) << 20.
                let align_bits = section.align().max(1).trailing_zeros().min(13) + 1;
                characteristics |= align_bits << 20;
            }

            w32(&mut scratch, 0); // physical address
            w32(&mut scratch, 0); // virtual address
            w32(&mut scratch, section.size() as u32);
            w32(&mut scratch, data_pos[index] as u32);
            w32(&mut scratch, reloc_pos[index] as u32);
            w32(&mut scratch, 0); // line numbers
            w16(&mut scratch, section.relocs().len() as u16);
            w16(&mut scratch, 0); // no line number entries
            w32(&mut scratch, characteristics);
        }

        // Section data and relocations.
        for (index, buffer) in buffers.iter().enumerate() {
            scratch.extend_from_slice(buffer);
            for reloc in object.sections()[index].relocs() {
                w32(&mut scratch, reloc.addr as u32);
                w32(&mut scratch, reloc.sym.0); // symtab index
                w16(&mut scratch, reloc.kind as u16);
            }
        }

        // Symbol table.
        for (index, entry) in symtab.entries.iter().enumerate() {
            let mut name8 = [0u8; 8];
            if entry.name.len() <= 8 {
                name8[..entry.name.len()].copy_from_slice(&entry.name);
            } else {
                let offset = strtab.add(&entry.name);
                name8[4..].copy_from_slice(&offset.to_le_bytes());
            }
            scratch.extend_from_slice(&name8);

            w32(&mut scratch, entry.value);
            w16(&mut scratch, entry.scnum);
            w16(&mut scratch, 0); // type
            scratch.push(entry.sclass);

            match entry.aux_section {
                None => scratch.push(0),
                Some(length) => {
                    scratch.push(1);
                    // Aux record: length, reloc count, then zeros.
                    let nrelocs = object
                        .sections()
                        .get(index)
                        .map(|section| section.relocs().len() as u16)
                        .unwrap_or(0);
                    w32(&mut scratch, length);
                    w16(&mut scratch, nrelocs);
                    scratch.extend_from_slice(&[0u8; 12]);
                }
            }
        }

        // String table, length first (the length includes itself).
        w32(&mut scratch, strtab.data.len() as u32 + 4);
        scratch.extend_from_slice(&strtab.data);

        writer
            .seek(SeekFrom::Start(0))
            .map_err(|error| Error::Io(format!("could not seek on output file: {error}")))?;
        writer
            .write_all(&scratch)
            .map_err(|error| Error::Io(format!("write error: {error}")))?;

        Ok(())
    }
}
