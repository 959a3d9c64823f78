//! The flat binary format.
//!
//! There are no headers, no symbol table and no relocations: every value
//! must resolve to a number at output time, using the placed addresses of
//! the sections. Placement honors per-section `start=`/`vstart=` addresses
//! and `follows=`/`vfollows=` chains on top of an optional global origin
//! (`org`).

use std::any::Any;
use std::io::SeekFrom;

use yasm_core::{
    Arch, AssocData, BytecodeOutput, Directives, Errwarns, Error, Expr, Line, Location,
    NullOutput, Object, ObjectFormat, SectionId, SubValue, Value, WriteSeek,
};

use crate::resolve_u64;

const OBJECT_KEY: &str = "objfmt::bin::BinObjectData";
const SECTION_KEY: &str = "objfmt::bin::BinSectionData";

/// Per-object state: the `org` directive.
#[derive(Debug, Default)]
struct BinObjectData {
    org: Option<Expr>,
}

impl AssocData for BinObjectData {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-section placement requests from the `section` directive.
#[derive(Debug, Default)]
struct BinSectionData {
    start: Option<Expr>,
    vstart: Option<Expr>,
    follows: Option<String>,
    vfollows: Option<String>,
}

impl AssocData for BinSectionData {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The flat binary object format.
#[derive(Debug, Default)]
pub struct BinObject;

impl BinObject {
    /// Creates the format.
    pub fn new() -> Self {
        Self
    }

    fn init_section(object: &mut Object, id: SectionId) {
        let name = object.section(id).name().to_owned();

        // The classic per-section special symbols.
        for suffix in ["start", "vstart", "length"] {
            object.add_special_symbol(&format!("section.{name}.{suffix}"));
        }

        object
            .section_mut(id)
            .assoc_mut()
            .insert(SECTION_KEY, Box::new(BinSectionData::default()));
    }
}

fn section_directive(
    object: &mut Object,
    namevals: &[yasm_core::NameValue],
    line: Line,
) -> Result<(), Error> {
    let name = namevals
        .first()
        .and_then(yasm_core::NameValue::as_string)
        .ok_or_else(|| Error::Syntax("section directive requires a name".to_owned()))?
        .to_owned();

    let known = object.find_section(&name).is_some();
    let id = object.append_section(&name);
    if !known {
        BinObject::init_section(object, id);
        // Name-based defaults, as users expect from the bin format.
        let section = object.section_mut(id);
        match name.as_str() {
            ".text" => section.set_code(true),
            ".bss" => section.set_bss(true),
            _ => {}
        }
    }

    let mut start = None;
    let mut vstart = None;
    let mut align = None;
    let mut follows = None;
    let mut vfollows = None;
    let mut nobits = false;
    let mut progbits = false;
    let mut code = false;
    let mut text = false;
    let mut data = false;

    {
        let mut helpers = yasm_core::DirHelpers::new();
        helpers.add_expr("start", &mut start);
        helpers.add_expr("vstart", &mut vstart);
        helpers.add_expr("align", &mut align);
        helpers.add_id("follows", &mut follows);
        helpers.add_id("vfollows", &mut vfollows);
        helpers.add_flag("nobits", &mut nobits);
        helpers.add_flag("progbits", &mut progbits);
        helpers.add_flag("code", &mut code);
        helpers.add_flag("text", &mut text);
        helpers.add_flag("data", &mut data);
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
        object.section_mut(id).set_align(align);
    }

    {
        let section = object.section_mut(id);
        if code {
            section.set_code(true);
        }
        if data || progbits {
            section.set_bss(false);
        }
        if nobits {
            section.set_bss(true);
        }
    }

    if start.is_some() && follows.is_some() {
        return Err(Error::Value(
            "cannot combine `start` and `follows` section attributes".to_owned(),
        ));
    }
    if vstart.is_some() && vfollows.is_some() {
        return Err(Error::Value(
            "cannot combine `vstart` and `vfollows` section attributes".to_owned(),
        ));
    }

    let bin_data = object
        .section_mut(id)
        .assoc_mut()
        .get_mut::<BinSectionData>(SECTION_KEY)
        .expect("bin section data missing");
    if start.is_some() {
        bin_data.start = start;
    }
    if vstart.is_some() {
        bin_data.vstart = vstart;
    }
    if follows.is_some() {
        bin_data.follows = follows;
    }
    if vfollows.is_some() {
        bin_data.vfollows = vfollows;
    }

    object.set_cur_section(id);
    let _ = line;
    Ok(())
}

/// Placement request of one section, extracted from its associated data.
struct PlaceReq {
    explicit: Option<u64>,
    follows: Option<SectionId>,
    align: u64,
    size: u64,
}

/// Place every section: explicit addresses win, `follows` chains attach to
/// their target, everything else lines up in declaration order. A cycle in
/// the chains leaves sections unplaceable and is reported as an error.
fn place(requests: &[PlaceReq], origin: u64) -> Result<Vec<u64>, Error> {
    let count = requests.len();
    let mut placed: Vec<Option<u64>> = vec![None; count];

    for _pass in 0..=count {
        let mut progress = false;
        let mut prev_end = Some(origin);

        for (index, request) in requests.iter().enumerate() {
            if placed[index].is_none() {
                let candidate = match (request.explicit, request.follows) {
                    (Some(address), _) => Some(address),
                    (None, Some(target)) => placed[target.0 as usize]
                        .map(|address| {
                            (address + requests[target.0 as usize].size)
                                .next_multiple_of(request.align)
                        }),
                    (None, None) => prev_end.map(|end| end.next_multiple_of(request.align)),
                };
                if let Some(address) = candidate {
                    placed[index] = Some(address);
                    progress = true;
                }
            }

            prev_end = placed[index].map(|address| address + request.size);
        }

        if placed.iter().all(Option::is_some) {
            return Ok(placed.into_iter().map(Option::unwrap).collect());
        }
        if !progress {
            break;
        }
    }

    Err(Error::Value(
        "section `follows` chains form a loop".to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(explicit: Option<u64>, follows: Option<u32>, align: u64, size: u64) -> PlaceReq {
        PlaceReq { explicit, follows: follows.map(SectionId), align, size }
    }

    #[test]
    fn test_sequential_placement() {
        let placed = place(
            &[req(None, None, 1, 3), req(None, None, 4, 2), req(None, None, 1, 1)],
            0x100,
        )
        .unwrap();
        assert_eq!(placed, [0x100, 0x104, 0x106]);
    }

    #[test]
    fn test_explicit_start_wins() {
        let placed =
            place(&[req(None, None, 1, 8), req(Some(0x40), None, 1, 4)], 0).unwrap();
        assert_eq!(placed, [0, 0x40]);
    }

    #[test]
    fn test_follows_a_later_section() {
        // Section 0 follows section 1, which is explicitly placed.
        let placed =
            place(&[req(None, Some(1), 1, 2), req(Some(0x10), None, 1, 4)], 0).unwrap();
        assert_eq!(placed, [0x14, 0x10]);
    }

    #[test]
    fn test_follows_cycle_is_an_error() {
        let result = place(
            &[req(None, Some(1), 1, 1), req(None, Some(0), 1, 1)],
            0,
        );
        assert!(result.is_err());
    }
}

struct BinOutput<'a> {
    object: &'a Object,
    arch: &'a dyn Arch,
    errwarns: &'a mut Errwarns,
    writer: &'a mut dyn WriteSeek,
}

impl BinOutput<'_> {
    fn address_of(&self, loc: Location) -> Result<i128, Error> {
        let offset = self
            .object
            .loc_offset(loc)
            .ok_or_else(|| Error::Internal("dangling location".to_owned()))?;
        Ok(self.object.section(loc.section).vma() as i128 + offset as i128)
    }
}

impl BytecodeOutput for BinOutput<'_> {
    fn output_value(
        &mut self,
        value: &mut Value,
        buffer: &mut Vec<u8>,
        _loc: Location,
    ) -> Result<(), Error> {
        let ctx = yasm_core::ExprCtx::full(self.object.symbols(), self.object.sections());
        value.finalize(&ctx, true)?;

        if value.wrt().is_some() {
            return Err(Error::TooComplex(
                "binary object format does not support WRT".to_owned(),
            ));
        }
        if value.is_seg_of() {
            return Err(Error::TooComplex(
                "binary object format does not support SEG".to_owned(),
            ));
        }

        // Everything must become a plain address: labels resolve through
        // their section's placed virtual address.
        if let Some(rel) = value.take_rel() {
            let symbol = self.object.symbols().get(rel);
            let loc = symbol.label().ok_or_else(|| {
                Error::Value(format!(
                    "binary object format does not support external references (`{}`)",
                    symbol.name()
                ))
            })?;
            value.add_abs(yasm_core::IntNum::new(self.address_of(loc)?));
        }

        if let Some(sub) = value.take_sub() {
            let loc = match sub {
                SubValue::Loc(loc) => loc,
                SubValue::Sym(symbol) => {
                    self.object.symbols().get(symbol).label().ok_or_else(|| {
                        Error::TooComplex("cannot subtract an undefined symbol".to_owned())
                    })?
                }
            };
            value.add_abs(yasm_core::IntNum::new(-self.address_of(loc)?));
        }

        while let Some(loc) = value.take_abs_location() {
            value.add_abs(yasm_core::IntNum::new(self.address_of(loc)?));
        }

        let done = value.output_basic(buffer, &ctx, self.arch, self.errwarns)?;
        if !done {
            return Err(Error::TooComplex(
                "value does not reduce to an address".to_owned(),
            ));
        }

        Ok(())
    }

    fn output_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer
            .write_all(bytes)
            .map_err(|error| Error::Io(format!("write error: {error}")))
    }

    fn output_gap(&mut self, len: u64) -> Result<(), Error> {
        self.errwarns.warn_set(
            yasm_core::WarnClass::UninitContents,
            "uninitialized space declared in code/data section: zeroing",
        );
        self.output_bytes(&vec![0u8; len as usize])
    }
}

impl ObjectFormat for BinObject {
    fn keyword(&self) -> &'static str {
        "bin"
    }

    fn description(&self) -> &'static str {
        "Flat format binary"
    }

    fn extension(&self) -> &'static str {
        ""
    }

    fn default_x86_mode_bits(&self) -> u32 {
        16
    }

    fn init_object(&self, object: &mut Object) {
        object.assoc_mut().insert(OBJECT_KEY, Box::new(BinObjectData::default()));
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

        directives.add(
            "org",
            Box::new(|object, namevals, _objext, _line| {
                let expr = namevals
                    .first()
                    .and_then(yasm_core::NameValue::as_expr)
                    .cloned()
                    .ok_or_else(|| {
                        Error::Syntax("`org` requires an address argument".to_owned())
                    })?;

                let data = object
                    .assoc_mut()
                    .get_mut::<BinObjectData>(OBJECT_KEY)
                    .expect("bin object data missing");
                if data.org.is_some() {
                    return Err(Error::Value("`org` can only be set once".to_owned()));
                }
                data.org = Some(expr);
                Ok(())
            }),
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
        // Resolve the origin.
        let origin = match object
            .assoc()
            .get::<BinObjectData>(OBJECT_KEY)
            .and_then(|data| data.org.as_ref())
        {
            Some(expr) => resolve_u64(&expr.clone(), object, "argument to `org`")?,
            None => 0,
        };

        // Gather placement requests and place LMAs, then VMAs.
        let mut lma_requests = Vec::new();
        let mut vma_requests = Vec::new();
        for section in object.sections() {
            let data = section.assoc().get::<BinSectionData>(SECTION_KEY);
            let resolve = |expr: Option<&Expr>, what| -> Result<Option<u64>, Error> {
                expr.map(|expr| resolve_u64(expr, object, what)).transpose()
            };
            let lookup = |name: Option<&String>| -> Result<Option<SectionId>, Error> {
                name.map(|name| {
                    object.find_section(name).ok_or_else(|| {
                        Error::Value(format!("section `{name}` does not exist"))
                    })
                })
                .transpose()
            };

            let (start, vstart, follows, vfollows) = match data {
                Some(data) => (
                    resolve(data.start.as_ref(), "section start")?,
                    resolve(data.vstart.as_ref(), "section vstart")?,
                    lookup(data.follows.as_ref())?,
                    lookup(data.vfollows.as_ref())?,
                ),
                None => (None, None, None, None),
            };

            let align = section.align().max(1);
            let size = section.size();
            lma_requests.push(PlaceReq { explicit: start, follows, align, size });
            vma_requests.push(PlaceReq {
                explicit: vstart,
                follows: vfollows,
                align,
                size,
            });
        }

        let lmas = place(&lma_requests, origin)?;
        // An unspecified VMA follows the LMA.
        for (request, lma) in vma_requests.iter_mut().zip(&lmas) {
            if request.explicit.is_none() && request.follows.is_none() {
                request.explicit = Some(*lma);
            }
        }
        let vmas = place(&vma_requests, origin)?;

        for (index, (lma, vma)) in lmas.iter().zip(&vmas).enumerate() {
            let section = &mut object.sections_mut()[index];
            section.place_lma(*lma);
            section.place_vma(*vma);
            if *lma < origin {
                return Err(Error::Value(format!(
                    "section `{}` starts before the origin",
                    section.name()
                )));
            }
            section.set_filepos(lma - origin);
        }

        // Define the per-section special symbols now that addresses exist.
        for index in 0..object.sections().len() {
            let section = &object.sections()[index];
            let values = [
                ("start", section.lma()),
                ("vstart", section.vma()),
                ("length", section.size()),
            ];
            let name = section.name().to_owned();
            for (suffix, value) in values {
                let symbol = object
                    .find_special_symbol(&format!("section.{name}.{suffix}"))
                    .expect("special symbols registered at section creation");
                let symbol = object.symbols_mut().get_mut(symbol);
                if !symbol.is_defined() {
                    symbol
                        .define_equ(Expr::from_int(yasm_core::IntNum::from(value)), 0)?;
                }
            }
        }

        // Emit the sections, in file order.
        let mut order: Vec<usize> = (0..object.sections().len()).collect();
        order.sort_by_key(|index| object.sections()[*index].filepos());

        for index in order {
            let id = SectionId(index as u32);
            let section = object.section(id);
            let filepos = section.filepos();

            if section.is_bss() {
                // Tracked but never emitted; still run the bytecodes so
                // initialized data in a nobits section warns.
                let mut out = NullOutput::new(&mut *errwarns);
                crate::render_section(object, arch, id, &mut out, |out| &mut *out.errwarns);
                continue;
            }

            if section.size() == 0 {
                continue;
            }

            writer
                .seek(SeekFrom::Start(filepos))
                .map_err(|error| Error::Io(format!("could not seek on output file: {error}")))?;

            let mut out = BinOutput {
                object,
                arch,
                errwarns: &mut *errwarns,
                writer: &mut *writer,
            };
            crate::render_section(object, arch, id, &mut out, |out| &mut *out.errwarns);
        }

        Ok(())
    }
}
