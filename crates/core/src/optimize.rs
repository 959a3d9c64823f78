//! The layout optimizer.
//!
//! Every bytecode has a tentative length that may depend on the distance
//! between it and other bytecodes, and growing one bytecode shifts every
//! later offset in its section. The optimizer runs the classic span-
//! dependent fixpoint: assign initial offsets and lengths, then re-evaluate
//! registered spans against current offsets, expanding bytecodes whose span
//! values left their thresholds, until everything is stable.
//!
//! Termination holds because expansion is monotone: every `expand` strictly
//! grows the bytecode and brackets the new value with wider thresholds, so
//! a bytecode expands at most a small architecture-bound number of times.

use std::collections::VecDeque;

use crate::{
    CurBytecode, Errwarns, Error, ExprCtx, ExprTerm, Location, Object, SectionId, SubValue,
    Value,
};

struct Span {
    section: SectionId,
    bc: u32,
    id: i32,
    value: Value,
    neg_thres: i64,
    pos_thres: i64,
    cur_val: i128,
    deps: Vec<SectionId>,
    active: bool,
}

/// Resolve bytecode sizes and offsets, then default section addresses.
///
/// Diagnostics go to `errwarns`; the driver treats any recorded error as
/// optimization failure.
pub fn optimize(object: &mut Object, errwarns: &mut Errwarns) {
    let mut spans = Vec::new();

    // Pass 1: initial lengths, offsets, span registration.
    for index in 0..object.sections().len() {
        let section = SectionId(index as u32);
        let mut bytecodes = std::mem::take(object.section_mut(section).bytecodes_vec_mut());

        let mut offset = 0u64;
        for bc_index in 0..bytecodes.len() {
            let (done, rest) = bytecodes.split_at_mut(bc_index);
            let bytecode = &mut rest[0];
            bytecode.set_offset(offset);

            let ctx = ExprCtx {
                symbols: object.symbols(),
                sections: None,
                cur: Some(CurBytecode {
                    section,
                    done,
                    index: bc_index as u32,
                    offset,
                }),
            };

            let line = bytecode.line();
            let result = bytecode.calc_len(&ctx, &mut |request| {
                spans.push(Span {
                    section,
                    bc: bc_index as u32,
                    id: request.id,
                    value: request.value,
                    neg_thres: request.neg_thres,
                    pos_thres: request.pos_thres,
                    cur_val: 0,
                    deps: Vec::new(),
                    active: true,
                });
            });
            match result {
                Ok(()) => errwarns.propagate(line),
                Err(error) => errwarns.propagate_error(line, error),
            }

            offset += bytecode.total_len();
        }

        *object.section_mut(section).bytecodes_vec_mut() = bytecodes;
    }

    if errwarns.num_errors(false) > 0 {
        return;
    }

    // Which sections each span watches: a span must be re-evaluated when
    // offsets in any of them move.
    for span in &mut spans {
        span.deps = value_sections(&span.value, object);
    }

    // Pass 2: iterate to fixpoint over a FIFO worklist.
    let mut queue: VecDeque<usize> = (0..spans.len()).collect();
    let mut queued = vec![true; spans.len()];

    // Far above any real expansion count; a trip means a broken expand.
    let budget = 64 * spans.len() + 1024;
    let mut steps = 0usize;

    while let Some(span_index) = queue.pop_front() {
        queued[span_index] = false;

        if !spans[span_index].active {
            continue;
        }

        steps += 1;
        if steps > budget {
            errwarns.propagate_error(
                0,
                Error::Internal("layout did not converge".to_owned()),
            );
            return;
        }

        let span = &mut spans[span_index];

        // Re-evaluate against current offsets. An unresolvable value (e.g.
        // an external target) can never be range-checked: force the owning
        // bytecode to its widest form.
        let ctx = ExprCtx::full(object.symbols(), object.sections());
        let mut value = span.value.clone();
        let new_val = match value.get_intnum(&ctx, true) {
            Ok(Some(value)) => value.as_i128(),
            Ok(None) => i128::from(span.pos_thres) + 1,
            Err(error) => {
                let line = object.section(span.section).bytecodes()[span.bc as usize].line();
                errwarns.propagate_error(line, error);
                span.active = false;
                continue;
            }
        };

        let old_val = span.cur_val;
        span.cur_val = new_val;

        if new_val >= i128::from(span.neg_thres) && new_val <= i128::from(span.pos_thres) {
            continue;
        }

        // Out of range: the owning bytecode must grow.
        let bytecode =
            &mut object.section_mut(span.section).bytecodes_mut()[span.bc as usize];
        let line = bytecode.line();
        let old_total = bytecode.total_len();

        match bytecode.expand(span.id, old_val, new_val) {
            Ok(expansion) => {
                bytecode.set_len(expansion.len);
                debug_assert!(
                    bytecode.total_len() >= old_total,
                    "expand shrank a bytecode"
                );

                if expansion.done {
                    span.active = false;
                } else {
                    span.neg_thres = expansion.neg_thres;
                    span.pos_thres = expansion.pos_thres;
                    if !queued[span_index] {
                        queue.push_back(span_index);
                        queued[span_index] = true;
                    }
                }
            }
            Err(error) => {
                errwarns.propagate_error(line, error);
                span.active = false;
                continue;
            }
        }

        let section = span.section;
        update_offsets(object, section, errwarns);

        // Anything watching this section may have moved.
        for (index, span) in spans.iter().enumerate() {
            if span.active && !queued[index] && span.deps.contains(&section) {
                queue.push_back(index);
                queued[index] = true;
            }
        }
    }

    if errwarns.num_errors(false) > 0 {
        return;
    }

    // Pass 3: default addresses for sections without explicit ones, in
    // declaration order. (The bin format re-places its sections with its
    // own start/follows rules on top of this.)
    let mut addr = 0u64;
    for section in object.sections_mut() {
        let align = section.align().max(1);
        if section.has_lma() {
            addr = section.lma();
        } else {
            addr = addr.next_multiple_of(align);
            section.place_lma(addr);
        }
        if !section.has_vma() {
            section.place_vma(section.lma());
        }
        addr = section.lma() + section.size();
    }
}

/// Recompute offsets of a whole section after a bytecode changed length,
/// refreshing offset-dependent tails (align, org, multiple) on the way.
fn update_offsets(object: &mut Object, section: SectionId, errwarns: &mut Errwarns) {
    let mut bytecodes = std::mem::take(object.section_mut(section).bytecodes_vec_mut());

    let mut offset = 0u64;
    for bc_index in 0..bytecodes.len() {
        let (done, rest) = bytecodes.split_at_mut(bc_index);
        let bytecode = &mut rest[0];
        bytecode.set_offset(offset);

        let ctx = ExprCtx {
            symbols: object.symbols(),
            sections: None,
            cur: Some(CurBytecode { section, done, index: bc_index as u32, offset }),
        };

        if let Err(error) = bytecode.recalc_len(&ctx) {
            errwarns.propagate_error(bytecode.line(), error);
        }

        offset += bytecode.total_len();
    }

    *object.section_mut(section).bytecodes_vec_mut() = bytecodes;
}

/// The sections a span value's resolution depends on.
fn value_sections(value: &Value, object: &Object) -> Vec<SectionId> {
    let mut sections = Vec::new();
    let mut push = |section: SectionId| {
        if !sections.contains(&section) {
            sections.push(section);
        }
    };

    let mut locations: Vec<Location> = Vec::new();
    if let Some(abs) = value.abs() {
        collect_locations(abs, object, &mut locations);
    }
    if let Some(rel) = value.rel() {
        if let Some(loc) = object.symbols().get(rel).label() {
            locations.push(loc);
        }
    }
    match value.sub() {
        Some(SubValue::Loc(loc)) => locations.push(loc),
        Some(SubValue::Sym(symbol)) => {
            if let Some(loc) = object.symbols().get(symbol).label() {
                locations.push(loc);
            }
        }
        None => {}
    }

    for loc in locations {
        push(loc.section);
    }

    sections
}

fn collect_locations(expr: &crate::Expr, object: &Object, out: &mut Vec<Location>) {
    for term in expr.terms() {
        match term {
            ExprTerm::Loc(loc) => out.push(*loc),
            ExprTerm::Sym(symbol) => {
                if let Some(loc) = object.symbols().get(*symbol).label() {
                    out.push(loc);
                }
            }
            ExprTerm::Expr(inner) => collect_locations(inner, object, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Bytecode, Contents, DataContents, DataItem, Expansion, Expr, ExprCtx, Fixup, Line,
        Location, Op, SpanReq, SpecialContents,
    };

    /// A miniature span-dependent tail: 2 bytes while its target is within
    /// a byte displacement of its own start, 5 bytes otherwise.
    #[derive(Debug, Clone)]
    struct ToyJump {
        target: crate::SymbolId,
        own: Location,
        near: bool,
    }

    impl SpecialContents for ToyJump {
        fn type_name(&self) -> &'static str {
            "test::ToyJump"
        }

        fn clone_box(&self) -> Box<dyn SpecialContents> {
            Box::new(self.clone())
        }

        fn finalize(
            &mut self,
            _fixed: &mut Vec<u8>,
            _fixups: &mut Vec<Fixup>,
            _ctx: &ExprCtx<'_>,
            _line: Line,
        ) -> Result<Option<Contents>, Error> {
            Ok(None)
        }

        fn calc_len(
            &mut self,
            _ctx: &ExprCtx<'_>,
            add_span: &mut dyn FnMut(SpanReq),
        ) -> Result<u64, Error> {
            if self.near {
                return Ok(5);
            }

            let expr = Expr::binary(
                Expr::from_sym(self.target),
                Op::Sub,
                Expr::from_loc(self.own),
            );
            add_span(SpanReq {
                id: 1,
                value: Value::from_expr(expr, 8, 0),
                neg_thres: -126,
                pos_thres: 129,
            });

            Ok(2)
        }

        fn expand(
            &mut self,
            span_id: i32,
            _old_val: i128,
            _new_val: i128,
        ) -> Result<Expansion, Error> {
            assert_eq!(span_id, 1);
            self.near = true;
            Ok(Expansion { len: 5, done: true, neg_thres: 0, pos_thres: 0 })
        }

        fn output(
            &self,
            _loc: Location,
            _octx: &crate::OutputContext<'_>,
            _out: &mut dyn crate::BytecodeOutput,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    fn data_bytes(n: usize) -> Bytecode {
        Bytecode::new(
            Contents::Data(DataContents {
                items: vec![DataItem::Raw(vec![0x90; n])],
            }),
            1,
        )
    }

    fn build(filler: usize) -> (Object, crate::SymbolId) {
        let mut object = Object::new("in.asm", "out.bin");
        object.append_section(".text");

        let jump_loc = Location { section: SectionId(0), bc: 1, off: 0 };
        let target = object.get_symbol("near_end");

        object.append_bytecode(Bytecode::new(
            Contents::Special(Box::new(ToyJump { target, own: jump_loc, near: false })),
            1,
        ));
        object.append_bytecode(data_bytes(filler));
        let label = object.here(3);
        object.symbols_mut().get_mut(target).define_label(label, 3).unwrap();

        (object, target)
    }

    #[test]
    fn test_short_form_is_kept_when_in_range() {
        let (mut object, _) = build(100);
        let mut errwarns = Errwarns::new();
        optimize(&mut object, &mut errwarns);

        assert_eq!(errwarns.num_errors(false), 0);
        // Jump keeps its 2-byte form: total = 2 + 100.
        assert_eq!(object.sections()[0].size(), 102);
    }

    #[test]
    fn test_out_of_range_span_expands() {
        let (mut object, _) = build(200);
        let mut errwarns = Errwarns::new();
        optimize(&mut object, &mut errwarns);

        assert_eq!(errwarns.num_errors(false), 0);
        // Target is 205 > 129 away from the jump start: 5 + 200.
        assert_eq!(object.sections()[0].size(), 205);

        // The label moved along with the expansion.
        let label = object.symbols().get(object.symbols().find("near_end").unwrap()).label();
        assert_eq!(object.loc_offset(label.unwrap()), Some(205));
    }

    #[test]
    fn test_expansion_cascade() {
        // A forward jump over a backward jump: the backward jump leaves its
        // range first, and its growth pushes the forward jump's target out
        // of range too.
        let mut object = Object::new("in.asm", "out.bin");
        object.append_section(".text");

        let section = SectionId(0);
        let label_start = object.get_symbol("start");
        let label_past = object.get_symbol("past");

        // `start` is the beginning of the section: the sentinel anchor.
        object
            .symbols_mut()
            .get_mut(label_start)
            .define_label(Location { section, bc: 0, off: 0 }, 1)
            .unwrap();

        // Forward jump to `past`.
        object.append_bytecode(Bytecode::new(
            Contents::Special(Box::new(ToyJump {
                target: label_past,
                own: Location { section, bc: 1, off: 0 },
                near: false,
            })),
            1,
        ));

        object.append_bytecode(data_bytes(125));

        // Backward jump to `start`, at offset 127: distance -127 is just
        // out of the short range.
        object.append_bytecode(Bytecode::new(
            Contents::Special(Box::new(ToyJump {
                target: label_start,
                own: Location { section, bc: 3, off: 0 },
                near: false,
            })),
            4,
        ));

        let past = object.here(5);
        object.symbols_mut().get_mut(label_past).define_label(past, 5).unwrap();

        let mut errwarns = Errwarns::new();
        optimize(&mut object, &mut errwarns);
        assert_eq!(errwarns.num_errors(false), 0);

        let sizes: Vec<u64> = object.sections()[0]
            .bytecodes()
            .iter()
            .map(Bytecode::total_len)
            .collect();

        // Backward jump grows first (distance -127); `past` then sits at
        // 2 + 125 + 5 = 132 > 129, so the forward jump grows too.
        assert_eq!(sizes[1], 5);
        assert_eq!(sizes[3], 5);
        assert_eq!(object.sections()[0].size(), 135);
    }

    #[test]
    fn test_org_and_align_track_moving_offsets() {
        use crate::{AlignContents, IntNum, OrgContents};

        // jump, org to 0x20, data, align 16: the org and align pads shrink
        // and grow as the jump expands.
        let mut object = Object::new("in.asm", "out.bin");
        object.append_section(".text");

        let target = object.get_symbol("beyond");
        object.append_bytecode(Bytecode::new(
            Contents::Special(Box::new(ToyJump {
                target,
                own: Location { section: SectionId(0), bc: 1, off: 0 },
                near: false,
            })),
            1,
        ));
        object.append_bytecode(Bytecode::new(
            Contents::Org(OrgContents { start: 0x20, fill: 0 }),
            2,
        ));
        object.append_bytecode(data_bytes(200));
        object.append_bytecode(Bytecode::new(
            Contents::Align(AlignContents::new(
                Expr::from_int(IntNum::new(16)),
                None,
                None,
            )),
            4,
        ));
        let label = object.here(5);
        object.symbols_mut().get_mut(target).define_label(label, 5).unwrap();

        // Align bytecodes resolve their boundary at finalize.
        let mut errwarns = Errwarns::new();
        object.finalize(&mut errwarns);
        assert_eq!(errwarns.num_errors(false), 0);

        optimize(&mut object, &mut errwarns);
        assert_eq!(errwarns.num_errors(false), 0);

        let bytecodes = object.sections()[0].bytecodes();
        // The jump grew to 5 bytes, so the org pad is 0x20 - 5 = 27.
        assert_eq!(bytecodes[1].total_len(), 5);
        assert_eq!(bytecodes[2].total_len(), 27);
        // 0x20 + 200 = 232, aligned up to 240.
        assert_eq!(bytecodes[4].total_len(), 8);
        assert_eq!(object.sections()[0].size(), 240);
    }

    #[test]
    fn test_section_placement_defaults() {
        let mut object = Object::new("in.asm", "out.bin");
        object.append_section(".text");
        object.append_bytecode(data_bytes(10));

        let data = object.append_section(".data");
        object.section_mut(data).set_align(16);
        object.set_cur_section(data);
        object.append_bytecode(data_bytes(3));

        let mut errwarns = Errwarns::new();
        optimize(&mut object, &mut errwarns);

        assert_eq!(object.sections()[0].lma(), 0);
        // 10 rounded up to the 16-byte alignment of .data.
        assert_eq!(object.sections()[1].lma(), 16);
        assert_eq!(object.sections()[1].vma(), 16);
    }
}
