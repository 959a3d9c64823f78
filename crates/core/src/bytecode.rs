//! Bytecodes: the atoms of code emission.
//!
//! A [`Bytecode`] has a *fixed* part (bytes known at parse/finalize time,
//! plus pending [`Fixup`]s to patch values into them) and a variable *tail*
//! described by [`Contents`]. Tails whose length depends on layout register
//! spans with the optimizer through [`Bytecode::calc_len`] and grow through
//! [`Bytecode::expand`] until every span value fits its thresholds.

use crate::{
    BytecodeOutput, Error, Expr, ExprCtx, IntNum, Line, Location, OutputContext, Value,
};

/// A pending patch of the fixed part: `value` is resolved at output time and
/// overwrites `value.size() / 8` bytes starting at `off`.
#[derive(Debug, Clone)]
pub struct Fixup {
    /// Byte offset within the fixed part.
    pub off: u32,
    /// The value to patch in.
    pub value: Value,
}

/// A span registration: the owning bytecode asks the optimizer to keep the
/// resolved integer of `value` within `[neg_thres, pos_thres]`, calling
/// [`Bytecode::expand`] with `id` whenever it falls outside.
#[derive(Debug)]
pub struct SpanReq {
    /// Contents-chosen span identifier, passed back to `expand`.
    pub id: i32,
    /// The expression to watch.
    pub value: Value,
    /// Lowest acceptable value.
    pub neg_thres: i64,
    /// Highest acceptable value.
    pub pos_thres: i64,
}

/// The outcome of an [`Bytecode::expand`] call.
#[derive(Debug, Clone, Copy)]
pub struct Expansion {
    /// The new tail length.
    pub len: u64,
    /// True when the contents reached its final form and the span can be
    /// retired.
    pub done: bool,
    /// Updated lowest acceptable value, when not done.
    pub neg_thres: i64,
    /// Updated highest acceptable value, when not done.
    pub pos_thres: i64,
}

/// Capability set of arch- or format-provided bytecode tails (instructions,
/// unwind tables…). The closed set of generic tails lives in [`Contents`];
/// this trait is the open extension point.
pub trait SpecialContents: std::fmt::Debug {
    /// A type identifier, for downcast-free dispatch in debug output.
    fn type_name(&self) -> &'static str;

    /// Clone into a new box (bytecodes must be cloneable for `times`).
    fn clone_box(&self) -> Box<dyn SpecialContents>;

    /// Called once after parsing, before optimization. May encode itself
    /// into the fixed part and return a replacement tail.
    fn finalize(
        &mut self,
        fixed: &mut Vec<u8>,
        fixups: &mut Vec<Fixup>,
        ctx: &ExprCtx<'_>,
        line: Line,
    ) -> Result<Option<Contents>, Error>;

    /// The current best-guess tail length; variable-length tails register
    /// spans through `add_span`.
    fn calc_len(
        &mut self,
        ctx: &ExprCtx<'_>,
        add_span: &mut dyn FnMut(SpanReq),
    ) -> Result<u64, Error>;

    /// Grow to accommodate a span value outside its thresholds.
    fn expand(&mut self, span_id: i32, old_val: i128, new_val: i128) -> Result<Expansion, Error>;

    /// Emit the tail.
    fn output(
        &self,
        loc: Location,
        octx: &OutputContext<'_>,
        out: &mut dyn BytecodeOutput,
    ) -> Result<(), Error>;
}

impl Clone for Box<dyn SpecialContents> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The tail of a bytecode.
#[derive(Debug, Clone, Default)]
pub enum Contents {
    /// No tail; everything lives in the fixed part (or the bytecode is a
    /// zero-length anchor).
    #[default]
    Empty,
    /// A list of data values (`db`, `dw`, …).
    Data(DataContents),
    /// Uninitialized space (`resb`, …).
    Gap(GapContents),
    /// Padding up to an alignment boundary.
    Align(AlignContents),
    /// Padding up to a fixed offset within the section.
    Org(OrgContents),
    /// A sub-container repeated N times (`times`).
    Multiple(MultipleContents),
    /// Literal bytes copied from an external file.
    Incbin(IncbinContents),
    /// A LEB128-encoded integer.
    Leb128(LebContents),
    /// Architecture- or format-provided tail.
    Special(Box<dyn SpecialContents>),
}

/// One item of a data bytecode.
#[derive(Debug, Clone)]
pub enum DataItem {
    /// A value of fixed size.
    Value(Value),
    /// Literal bytes, e.g. a string.
    Raw(Vec<u8>),
}

/// Tail of a data bytecode.
#[derive(Debug, Clone, Default)]
pub struct DataContents {
    /// The items, emitted in order.
    pub items: Vec<DataItem>,
}

impl DataContents {
    fn len(&self) -> u64 {
        self.items
            .iter()
            .map(|item| match item {
                DataItem::Value(value) => u64::from(value.size() / 8),
                DataItem::Raw(bytes) => bytes.len() as u64,
            })
            .sum()
    }
}

/// Tail of a reserve bytecode: `count` elements of `elem_size` bytes.
#[derive(Debug, Clone)]
pub struct GapContents {
    /// Number of elements, constant by optimize time.
    pub count: Expr,
    /// Size of one element in bytes.
    pub elem_size: u64,
}

impl GapContents {
    fn calc_len(&mut self, ctx: &ExprCtx<'_>) -> Result<u64, Error> {
        let mut count = self.count.clone();
        count.simplify(ctx, true)?;

        let count = count
            .get_intnum()
            .ok_or_else(|| {
                Error::NotConstant("attempt to reserve non-constant quantity of space".to_owned())
            })?
            .as_i128();

        if count < 0 {
            return Err(Error::Value("reserved space is negative".to_owned()));
        }

        Ok(count as u64 * self.elem_size)
    }
}

/// Tail of an align bytecode. The expressions are resolved at finalize.
#[derive(Debug, Clone)]
pub struct AlignContents {
    /// Alignment boundary; must resolve to a power of two.
    pub boundary: Expr,
    /// Explicit fill byte, if any.
    pub fill: Option<Expr>,
    /// Maximum number of padding bytes to insert, if capped.
    pub maxskip: Option<Expr>,
    resolved_boundary: u64,
    resolved_fill: Option<u8>,
    resolved_maxskip: Option<u64>,
}

impl AlignContents {
    /// Build an align tail from its (still symbolic) arguments.
    pub fn new(boundary: Expr, fill: Option<Expr>, maxskip: Option<Expr>) -> Self {
        Self {
            boundary,
            fill,
            maxskip,
            resolved_boundary: 0,
            resolved_fill: None,
            resolved_maxskip: None,
        }
    }

    fn finalize(&mut self, ctx: &ExprCtx<'_>) -> Result<(), Error> {
        let resolve = |expr: &Expr, what: &str| -> Result<u64, Error> {
            let mut expr = expr.clone();
            expr.simplify(ctx, false)?;
            expr.get_intnum()
                .and_then(IntNum::to_u64)
                .ok_or_else(|| Error::NotConstant(format!("align {what} is not a constant")))
        };

        self.resolved_boundary = resolve(&self.boundary, "boundary")?;
        if !self.resolved_boundary.is_power_of_two() {
            return Err(Error::Value(format!(
                "alignment boundary {} is not a power of two",
                self.resolved_boundary
            )));
        }

        if let Some(fill) = &self.fill {
            self.resolved_fill = Some(resolve(fill, "fill")? as u8);
        }
        if let Some(maxskip) = &self.maxskip {
            self.resolved_maxskip = Some(resolve(maxskip, "maximum skip")?);
        }

        Ok(())
    }

    fn calc_len(&self, offset: u64) -> u64 {
        let boundary = self.resolved_boundary;
        let pad = (boundary - (offset % boundary)) % boundary;

        match self.resolved_maxskip {
            Some(maxskip) if pad > maxskip => 0,
            _ => pad,
        }
    }

    /// The explicit fill byte, when one was given.
    pub fn fill_byte(&self) -> Option<u8> {
        self.resolved_fill
    }
}

/// Tail of an org bytecode: pad with `fill` from the current offset up to
/// `start`.
#[derive(Debug, Clone)]
pub struct OrgContents {
    /// Target offset within the section.
    pub start: u64,
    /// Fill byte for the padding.
    pub fill: u8,
}

impl OrgContents {
    fn calc_len(&self, offset: u64) -> Result<u64, Error> {
        if offset > self.start {
            return Err(Error::Value(format!(
                "org target 0x{:x} is before the current position 0x{offset:x}",
                self.start
            )));
        }
        Ok(self.start - offset)
    }
}

/// Tail of a multiple bytecode: an inner container repeated `count` times.
#[derive(Debug, Clone)]
pub struct MultipleContents {
    /// The repeated bytecodes.
    pub contents: Vec<Bytecode>,
    /// Repetition count; must resolve to a non-negative constant by
    /// optimize time.
    pub count: Expr,
    resolved_count: u64,
    inner_len: u64,
}

impl MultipleContents {
    /// Build a multiple tail.
    pub fn new(contents: Vec<Bytecode>, count: Expr) -> Self {
        Self { contents, count, resolved_count: 0, inner_len: 0 }
    }

    /// The resolved repetition count (valid after optimize).
    pub fn count(&self) -> u64 {
        self.resolved_count
    }

    fn resolve_count(&mut self, ctx: &ExprCtx<'_>) -> Result<(), Error> {
        let mut count = self.count.clone();
        count.simplify(ctx, true)?;

        let count = count
            .get_intnum()
            .ok_or_else(|| {
                Error::NotConstant("multiple repetition count is not a constant".to_owned())
            })?
            .as_i128();

        if count < 0 {
            return Err(Error::Value("multiple repetition count is negative".to_owned()));
        }

        self.resolved_count = count as u64;
        Ok(())
    }

    fn calc_len(&mut self, ctx: &ExprCtx<'_>) -> Result<u64, Error> {
        self.resolve_count(ctx)?;

        // Span-dependent tails inside a repeated container are forced to
        // their largest form up front; their size cannot depend on a
        // position that differs per repetition.
        self.inner_len = 0;
        for bytecode in &mut self.contents {
            bytecode.calc_len_max(ctx)?;
            self.inner_len += bytecode.total_len();
        }

        Ok(self.resolved_count * self.inner_len)
    }
}

/// Tail of an incbin bytecode.
#[derive(Debug, Clone)]
pub struct IncbinContents {
    /// Path of the file to include.
    pub path: String,
    /// Skip this many bytes of the file first.
    pub start: Option<Expr>,
    /// Include at most this many bytes.
    pub maxlen: Option<Expr>,
    data: Option<Vec<u8>>,
}

impl IncbinContents {
    /// Build an incbin tail; the file is read at optimize time.
    pub fn new(path: String, start: Option<Expr>, maxlen: Option<Expr>) -> Self {
        Self { path, start, maxlen, data: None }
    }

    fn calc_len(&mut self, ctx: &ExprCtx<'_>) -> Result<u64, Error> {
        if let Some(data) = &self.data {
            return Ok(data.len() as u64);
        }

        let resolve = |expr: &Option<Expr>, what: &str| -> Result<Option<u64>, Error> {
            match expr {
                None => Ok(None),
                Some(expr) => {
                    let mut expr = expr.clone();
                    expr.simplify(ctx, false)?;
                    expr.get_intnum()
                        .and_then(IntNum::to_u64)
                        .map(Some)
                        .ok_or_else(|| {
                            Error::NotConstant(format!("incbin {what} is not a constant"))
                        })
                }
            }
        };

        let start = resolve(&self.start, "start")?.unwrap_or(0);
        let maxlen = resolve(&self.maxlen, "maximum length")?;

        let mut data = std::fs::read(&self.path)
            .map_err(|error| Error::Io(format!("unable to read `{}`: {error}", self.path)))?;

        if (start as usize) > data.len() {
            return Err(Error::Value(format!(
                "incbin start {start} is past the end of `{}`",
                self.path
            )));
        }
        data.drain(..start as usize);

        if let Some(maxlen) = maxlen {
            data.truncate(maxlen as usize);
        }

        let len = data.len() as u64;
        self.data = Some(data);

        Ok(len)
    }
}

/// Tail of a LEB128 bytecode.
#[derive(Debug, Clone)]
pub struct LebContents {
    /// The encoded value; must be constant by output time.
    pub value: Expr,
    /// Signed (SLEB128) or unsigned (ULEB128) encoding.
    pub signed: bool,
    reserved: u64,
}

impl LebContents {
    /// Build a LEB128 tail.
    pub fn new(value: Expr, signed: bool) -> Self {
        Self { value, signed, reserved: 0 }
    }

    fn calc_len(&mut self, ctx: &ExprCtx<'_>) -> Result<u64, Error> {
        let mut value = self.value.clone();
        value.simplify(ctx, true)?;

        self.reserved = match value.get_intnum() {
            Some(value) => leb128_size(value.as_i128(), self.signed),
            // Unknown yet: reserve the 128-bit worst case; the encoding is
            // padded up to the reservation at output.
            None => 128u64.div_ceil(7),
        };

        Ok(self.reserved)
    }
}

/// Number of bytes a LEB128 encoding of `value` needs.
pub fn leb128_size(value: i128, signed: bool) -> u64 {
    let mut size = 0u64;

    if signed {
        let mut value = value;
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            size += 1;
            if (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0) {
                break;
            }
        }
    } else {
        let mut value = value as u128;
        loop {
            value >>= 7;
            size += 1;
            if value == 0 {
                break;
            }
        }
    }

    size
}

/// Encode `value` as LEB128 into `buffer`, padding the encoding up to
/// `min_size` bytes (LEB128 allows redundant continuation bytes).
pub fn leb128_encode(buffer: &mut Vec<u8>, value: i128, signed: bool, min_size: u64) {
    let start = buffer.len();

    if signed {
        let mut value = value;
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            let last = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            let padding = (buffer.len() - start + 1) < min_size as usize;
            if !last || padding {
                byte |= 0x80;
            }
            buffer.push(byte);
            if last && !padding {
                break;
            }
            if last {
                // Pad with pure sign-extension bytes.
                let fill = if value == -1 { 0x7f } else { 0x00 };
                while (buffer.len() - start) < min_size as usize - 1 {
                    buffer.push(fill | 0x80);
                }
                buffer.push(fill);
                break;
            }
        }
    } else {
        let mut value = value as u128;
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            let last = value == 0;
            let padding = (buffer.len() - start + 1) < min_size as usize;
            if !last || padding {
                byte |= 0x80;
            }
            buffer.push(byte);
            if last && !padding {
                break;
            }
            if last {
                while (buffer.len() - start) < min_size as usize - 1 {
                    buffer.push(0x80);
                }
                buffer.push(0x00);
                break;
            }
        }
    }
}

/// The atom of code emission inside a section.
#[derive(Debug, Clone)]
pub struct Bytecode {
    fixed: Vec<u8>,
    fixups: Vec<Fixup>,
    contents: Contents,
    offset: u64,
    len: u64,
    line: Line,
    finalized: bool,
}

impl Bytecode {
    /// Build a bytecode from its tail.
    pub fn new(contents: Contents, line: Line) -> Self {
        Self {
            fixed: Vec::new(),
            fixups: Vec::new(),
            contents,
            offset: 0,
            len: 0,
            line,
            finalized: false,
        }
    }

    /// A zero-length anchor bytecode (the section sentinel, label anchors).
    pub fn empty(line: Line) -> Self {
        Self::new(Contents::Empty, line)
    }

    /// The source line the bytecode came from.
    pub fn line(&self) -> Line {
        self.line
    }

    /// The tail.
    pub fn contents(&self) -> &Contents {
        &self.contents
    }

    /// The tail, mutably.
    pub fn contents_mut(&mut self) -> &mut Contents {
        &mut self.contents
    }

    /// Offset of the bytecode within its section. Only valid during and
    /// after optimization.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Length of the tail in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when both the fixed part and the tail are empty.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub(crate) fn set_len(&mut self, len: u64) {
        self.len = len;
    }

    /// Total length: fixed part plus tail.
    pub fn total_len(&self) -> u64 {
        self.fixed.len() as u64 + self.len
    }

    /// The fixed part.
    pub fn fixed(&self) -> &[u8] {
        &self.fixed
    }

    /// Append literal bytes to the fixed part.
    pub fn append_fixed(&mut self, bytes: &[u8]) {
        self.fixed.extend_from_slice(bytes);
    }

    /// Append a value to the fixed part: placeholder bytes now, a fixup to
    /// patch them at output time.
    pub fn append_fixed_value(&mut self, value: Value) {
        let off = self.fixed.len() as u32;
        let size = (value.size() / 8) as usize;
        self.fixed.resize(self.fixed.len() + size, 0);
        self.fixups.push(Fixup { off, value });
    }

    /// Finalize the tail; called exactly once, after parsing.
    pub fn finalize(&mut self, ctx: &ExprCtx<'_>) -> Result<(), Error> {
        if self.finalized {
            return Err(Error::Internal("bytecode finalized twice".to_owned()));
        }
        self.finalized = true;

        match &mut self.contents {
            Contents::Data(data) => {
                for item in &mut data.items {
                    if let DataItem::Value(value) = item {
                        value.finalize(ctx, false)?;
                    }
                }
            }
            Contents::Align(align) => align.finalize(ctx)?,
            Contents::Multiple(multiple) => {
                for bytecode in &mut multiple.contents {
                    bytecode.finalize(ctx)?;
                }
            }
            Contents::Special(special) => {
                if let Some(replacement) =
                    special.finalize(&mut self.fixed, &mut self.fixups, ctx, self.line)?
                {
                    self.contents = replacement;
                }
            }
            Contents::Empty
            | Contents::Gap(_)
            | Contents::Org(_)
            | Contents::Incbin(_)
            | Contents::Leb128(_) => {}
        }

        for fixup in &mut self.fixups {
            fixup.value.finalize(ctx, false)?;
        }

        Ok(())
    }

    /// Compute the tail length. `self.offset` must already be set; spans
    /// are reported through `add_span`.
    pub fn calc_len(
        &mut self,
        ctx: &ExprCtx<'_>,
        add_span: &mut dyn FnMut(SpanReq),
    ) -> Result<(), Error> {
        let tail_start = self.offset + self.fixed.len() as u64;

        let len = match &mut self.contents {
            Contents::Empty => 0,
            Contents::Data(data) => data.len(),
            Contents::Gap(gap) => gap.calc_len(ctx)?,
            Contents::Align(align) => align.calc_len(tail_start),
            Contents::Org(org) => org.calc_len(tail_start)?,
            Contents::Multiple(multiple) => multiple.calc_len(ctx)?,
            Contents::Incbin(incbin) => incbin.calc_len(ctx)?,
            Contents::Leb128(leb) => leb.calc_len(ctx)?,
            Contents::Special(special) => special.calc_len(ctx, add_span)?,
        };

        self.len = len;
        Ok(())
    }

    /// Compute the tail length with every span-dependent tail forced to its
    /// largest form (used inside repeated containers).
    pub fn calc_len_max(&mut self, ctx: &ExprCtx<'_>) -> Result<(), Error> {
        let mut requests = Vec::new();
        self.calc_len(ctx, &mut |request| requests.push(request))?;

        for request in requests {
            let mut probe = request.pos_thres;
            // An expansion chain is short (one or two steps for real
            // architectures); the cap only guards against a broken tail.
            for _ in 0..16 {
                let expansion = self.expand(request.id, 0, i128::from(probe) + 1)?;
                self.len = expansion.len;
                if expansion.done {
                    break;
                }
                probe = expansion.pos_thres;
            }
        }

        Ok(())
    }

    /// Recompute the length of offset-dependent tails after `self.offset`
    /// moved. Returns true when the length changed.
    pub fn recalc_len(&mut self, ctx: &ExprCtx<'_>) -> Result<bool, Error> {
        let tail_start = self.offset + self.fixed.len() as u64;

        let len = match &mut self.contents {
            Contents::Align(align) => align.calc_len(tail_start),
            Contents::Org(org) => org.calc_len(tail_start)?,
            Contents::Multiple(multiple) => multiple.calc_len(ctx)?,
            _ => return Ok(false),
        };

        let changed = len != self.len;
        self.len = len;
        Ok(changed)
    }

    /// Expand a span-dependent tail after one of its spans left its
    /// thresholds.
    pub fn expand(
        &mut self,
        span_id: i32,
        old_val: i128,
        new_val: i128,
    ) -> Result<Expansion, Error> {
        match &mut self.contents {
            Contents::Special(special) => special.expand(span_id, old_val, new_val),
            _ => Err(Error::Internal("expand called on a fixed-length bytecode".to_owned())),
        }
    }

    /// Emit the bytecode: fixed part (with fixups patched) first, then the
    /// tail.
    pub fn output(
        &self,
        loc: Location,
        octx: &OutputContext<'_>,
        out: &mut dyn BytecodeOutput,
    ) -> Result<(), Error> {
        if !self.fixed.is_empty() {
            let mut buffer = Vec::with_capacity(self.fixed.len());
            let mut pos = 0usize;

            for fixup in &self.fixups {
                let off = fixup.off as usize;
                buffer.extend_from_slice(&self.fixed[pos..off]);

                let mut value = fixup.value.clone();
                out.output_value(&mut value, &mut buffer, loc.with_offset(off as u64))?;
                pos = off + (fixup.value.size() / 8) as usize;
            }

            buffer.extend_from_slice(&self.fixed[pos..]);
            out.output_bytes(&buffer)?;
        }

        let base = self.fixed.len() as u64;

        match &self.contents {
            Contents::Empty => {}
            Contents::Data(data) => {
                let mut off = base;
                for item in &data.items {
                    match item {
                        DataItem::Raw(bytes) => {
                            out.output_bytes(bytes)?;
                            off += bytes.len() as u64;
                        }
                        DataItem::Value(value) => {
                            let mut value = value.clone();
                            let mut buffer = Vec::with_capacity((value.size() / 8) as usize);
                            out.output_value(&mut value, &mut buffer, loc.with_offset(off))?;
                            out.output_bytes(&buffer)?;
                            off += u64::from(value.size() / 8);
                        }
                    }
                }
            }
            Contents::Gap(_) => out.output_gap(self.len)?,
            Contents::Align(align) => {
                let pad = self.len as usize;
                if pad > 0 {
                    match align.fill_byte() {
                        Some(fill) => out.output_bytes(&vec![fill; pad])?,
                        None if octx.section().is_code() => {
                            out.output_bytes(&octx.arch.fill_pattern(pad as u64))?;
                        }
                        None => out.output_bytes(&vec![0u8; pad])?,
                    }
                }
            }
            Contents::Org(org) => {
                if self.len > 0 {
                    out.output_bytes(&vec![org.fill; self.len as usize])?;
                }
            }
            Contents::Multiple(multiple) => {
                for _ in 0..multiple.resolved_count {
                    for bytecode in &multiple.contents {
                        bytecode.output(loc, octx, out)?;
                    }
                }
            }
            Contents::Incbin(incbin) => {
                let data = incbin.data.as_ref().ok_or_else(|| {
                    Error::Internal("incbin output before optimize".to_owned())
                })?;
                out.output_bytes(data)?;
            }
            Contents::Leb128(leb) => {
                let mut value = leb.value.clone();
                let ctx = octx.expr_ctx();
                value.simplify(&ctx, true)?;
                let value = value.get_intnum().ok_or_else(|| {
                    Error::NotConstant("LEB128 value is not a constant".to_owned())
                })?;

                let mut buffer = Vec::with_capacity(leb.reserved as usize);
                leb128_encode(&mut buffer, value.as_i128(), leb.signed, leb.reserved);
                out.output_bytes(&buffer)?;
            }
            Contents::Special(special) => special.output(loc, octx, out)?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leb128_size() {
        assert_eq!(leb128_size(0, false), 1);
        assert_eq!(leb128_size(127, false), 1);
        assert_eq!(leb128_size(128, false), 2);
        assert_eq!(leb128_size(0, true), 1);
        assert_eq!(leb128_size(63, true), 1);
        assert_eq!(leb128_size(64, true), 2);
        assert_eq!(leb128_size(-64, true), 1);
        assert_eq!(leb128_size(-65, true), 2);
    }

    #[test]
    fn test_leb128_encode() {
        let mut buffer = Vec::new();
        leb128_encode(&mut buffer, 624485, false, 0);
        assert_eq!(buffer, [0xe5, 0x8e, 0x26]);

        buffer.clear();
        leb128_encode(&mut buffer, -123456, true, 0);
        assert_eq!(buffer, [0xc0, 0xbb, 0x78]);
    }

    #[test]
    fn test_leb128_padding() {
        // A padded encoding must still decode to the same value.
        let mut buffer = Vec::new();
        leb128_encode(&mut buffer, 2, false, 4);
        assert_eq!(buffer, [0x82, 0x80, 0x80, 0x00]);

        let mut buffer = Vec::new();
        leb128_encode(&mut buffer, -2, true, 3);
        assert_eq!(buffer, [0xfe, 0xff, 0x7f]);
    }

    #[test]
    fn test_append_fixed_value() {
        let mut bytecode = Bytecode::empty(1);
        bytecode.append_fixed(&[0xb8]);
        bytecode.append_fixed_value(Value::new(16, 1));
        assert_eq!(bytecode.fixed(), &[0xb8, 0, 0]);
        assert_eq!(bytecode.total_len(), 3);
    }
}
