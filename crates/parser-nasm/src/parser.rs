//! The NASM-syntax parser.

use yasm_core::{
    AlignContents, Arch, Bytecode, Contents, DataContents, DataItem, Directives, EffectiveAddr,
    Errwarns, Error, Expr, GapContents, IncbinContents, IntNum, Line, Linemap, MultipleContents,
    NameValue, NameValueParam, NameValues, Object, Op, Operand, Parser, Preprocessor, TargetMod,
    Value, Visibility, WarnClass,
};

use crate::lex::{tokenize, Token};

/// The NASM-syntax parser module.
#[derive(Debug, Default)]
pub struct NasmParser {
    prev_nonlocal: Option<String>,
}

impl NasmParser {
    /// Creates the parser.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Parser for NasmParser {
    fn keyword(&self) -> &'static str {
        "nasm"
    }

    fn description(&self) -> &'static str {
        "NASM-compatible parser"
    }

    fn preproc_keywords(&self) -> &[&'static str] {
        &["raw"]
    }

    fn parse(
        &mut self,
        object: &mut Object,
        arch: &mut dyn Arch,
        preproc: &mut dyn Preprocessor,
        directives: &Directives,
        linemap: &mut Linemap,
        errwarns: &mut Errwarns,
    ) -> Result<(), Error> {
        while let Some(line) = preproc.get_line()? {
            let vline = linemap.goto_next();

            // `%line` markers are the only preprocessor residue the parser
            // understands, and they are parsed strictly.
            let trimmed = line.trim();
            if trimmed.starts_with("%line") {
                match parse_line_marker(trimmed) {
                    Ok((file, file_line, increment)) => {
                        linemap.set(file, file_line, increment);
                        errwarns.propagate(vline);
                    }
                    Err(error) => errwarns.propagate_error(vline, error),
                }
                continue;
            }
            if trimmed.starts_with('%') {
                errwarns.propagate_error(
                    vline,
                    Error::Syntax(format!(
                        "preprocessor directive `{}` reached the parser",
                        trimmed.split_whitespace().next().unwrap_or("%")
                    )),
                );
                continue;
            }

            let mut unrecognized = Vec::new();
            let tokens = tokenize(&line, &mut |ch| unrecognized.push(ch))?;
            for ch in unrecognized {
                errwarns.warn_set(
                    WarnClass::UnrecChar,
                    format!("ignoring unrecognized character `{}`", ch.escape_default()),
                );
                errwarns.propagate(vline);
            }

            let mut parser = LineParser {
                tokens,
                pos: 0,
                object,
                arch,
                directives,
                errwarns,
                line: vline,
                prev_nonlocal: &mut self.prev_nonlocal,
            };

            match parser.statement() {
                Ok(()) => errwarns.propagate(vline),
                Err(error) => errwarns.propagate_error(vline, error),
            }
        }

        Ok(())
    }
}

/// Parse a strict `%line N[+M] "file"` marker.
fn parse_line_marker(line: &str) -> Result<(String, u64, u64), Error> {
    let malformed = || Error::Syntax("malformed `%line` directive".to_owned());

    let rest = line.strip_prefix("%line").ok_or_else(malformed)?.trim_start();
    let (numbers, rest) = rest.split_once(char::is_whitespace).ok_or_else(malformed)?;

    let (line_str, increment_str) = match numbers.split_once('+') {
        Some((line, increment)) => (line, Some(increment)),
        None => (numbers, None),
    };
    let file_line: u64 = line_str.parse().map_err(|_| malformed())?;
    let increment: u64 = match increment_str {
        Some(increment) => increment.parse().map_err(|_| malformed())?,
        None => 1,
    };

    let file = rest.trim();
    let file = file
        .strip_prefix('"')
        .and_then(|file| file.strip_suffix('"'))
        .ok_or_else(malformed)?;

    Ok((file.to_owned(), file_line, increment))
}

struct LineParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    object: &'a mut Object,
    arch: &'a mut dyn Arch,
    directives: &'a Directives,
    errwarns: &'a mut Errwarns,
    line: Line,
    prev_nonlocal: &'a mut Option<String>,
}

impl LineParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat_punct(&mut self, which: char) -> bool {
        if matches!(self.peek(), Some(token) if token.is_punct(which)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, which: char) -> Result<(), Error> {
        if self.eat_punct(which) {
            Ok(())
        } else {
            Err(Error::Syntax(format!("expected `{which}`")))
        }
    }

    fn syntax(&self, message: impl Into<String>) -> Error {
        Error::Syntax(message.into())
    }

    /// Resolve a (possibly local) label name against the previous non-local
    /// label.
    fn resolve_label_name(&self, name: &str) -> Result<String, Error> {
        if let Some(rest) = name.strip_prefix('.') {
            match &self.prev_nonlocal {
                Some(prev) => Ok(format!("{prev}.{rest}")),
                None => Err(self.syntax(format!(
                    "local label `{name}` used without a previous non-local label"
                ))),
            }
        } else {
            Ok(name.to_owned())
        }
    }

    // ----- statements -------------------------------------------------

    fn statement(&mut self) -> Result<(), Error> {
        if self.at_end() {
            return Ok(());
        }

        // `[directive args]` form.
        if self.eat_punct('[') {
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                _ => return Err(self.syntax("expected directive name after `[`")),
            };
            let namevals = self.namevals(true)?;
            self.expect_punct(']')?;
            return self.dispatch_directive(&name, namevals);
        }

        let Some(Token::Ident(first)) = self.peek().cloned() else {
            return Err(self.syntax("expected label, instruction or directive"));
        };
        let keyword = first.to_ascii_lowercase();

        if is_directive_keyword(&keyword) {
            self.pos += 1;
            let namevals = self.namevals(false)?;
            return self.dispatch_directive(&keyword, namevals);
        }

        if self.starts_bytecode(&keyword) {
            let bytecode = self.bc_statement(&keyword)?;
            self.object.append_bytecode(bytecode);
            return self.expect_end();
        }

        // A label.
        self.pos += 1;
        let name = self.resolve_label_name(&first)?;
        let has_colon = self.eat_punct(':');

        // `name equ expr` binds the symbol to an expression, not a place.
        if matches!(self.peek(), Some(Token::Ident(id)) if id.eq_ignore_ascii_case("equ")) {
            self.pos += 1;
            let expr = self.expr()?;
            let symbol = self.object.get_symbol(&name);
            self.object.symbols_mut().get_mut(symbol).define_equ(expr, self.line)?;
            if !first.starts_with('.') {
                *self.prev_nonlocal = Some(first);
            }
            return self.expect_end();
        }

        let loc = self.object.here(self.line);
        let symbol = self.object.get_symbol(&name);
        self.object.symbols_mut().get_mut(symbol).define_label(loc, self.line)?;
        if !first.starts_with('.') {
            *self.prev_nonlocal = Some(first);
        }

        if self.at_end() {
            if !has_colon {
                self.errwarns.warn_set(
                    WarnClass::OrphanLabel,
                    "label alone on a line without a colon might be in error",
                );
            }
            return Ok(());
        }

        // The rest of the line is an ordinary statement.
        let Some(Token::Ident(next)) = self.peek().cloned() else {
            return Err(self.syntax("expected instruction after label"));
        };
        let keyword = next.to_ascii_lowercase();
        if !self.starts_bytecode(&keyword) {
            return Err(self.syntax(format!("unrecognized instruction `{next}`")));
        }
        let bytecode = self.bc_statement(&keyword)?;
        self.object.append_bytecode(bytecode);
        self.expect_end()
    }

    fn expect_end(&mut self) -> Result<(), Error> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.syntax("junk at end of line"))
        }
    }

    fn starts_bytecode(&self, keyword: &str) -> bool {
        keyword == "times"
            || data_size(keyword).is_some()
            || reserve_size(keyword).is_some()
            || matches!(keyword, "incbin" | "align" | "alignb")
            || self.arch.parse_check_prefix(keyword).is_some()
            || self.arch.parse_check_insn(keyword)
    }

    /// Parse one bytecode-producing statement (the part after any label and
    /// `times` prefix included).
    fn bc_statement(&mut self, keyword: &str) -> Result<Bytecode, Error> {
        self.pos += 1;

        match keyword {
            "times" => {
                let count = self.expr()?;
                let Some(Token::Ident(inner)) = self.peek().cloned() else {
                    return Err(self.syntax("expected instruction after `times`"));
                };
                let inner_keyword = inner.to_ascii_lowercase();
                if !self.starts_bytecode(&inner_keyword) {
                    return Err(self.syntax(format!("unrecognized instruction `{inner}`")));
                }
                let inner = self.bc_statement(&inner_keyword)?;
                Ok(Bytecode::new(
                    Contents::Multiple(MultipleContents::new(vec![inner], count)),
                    self.line,
                ))
            }

            "incbin" => {
                let Some(Token::Str(path)) = self.next() else {
                    return Err(self.syntax("expected file name string after `incbin`"));
                };
                let path = String::from_utf8(path)
                    .map_err(|_| self.syntax("incbin file name is not valid UTF-8"))?;

                let mut start = None;
                let mut maxlen = None;
                if self.eat_punct(',') {
                    start = Some(self.expr()?);
                    if self.eat_punct(',') {
                        maxlen = Some(self.expr()?);
                    }
                }

                Ok(Bytecode::new(
                    Contents::Incbin(IncbinContents::new(path, start, maxlen)),
                    self.line,
                ))
            }

            "align" | "alignb" => {
                let boundary = self.expr()?;
                let fill = if self.eat_punct(',') { Some(self.expr()?) } else { None };
                Ok(Bytecode::new(
                    Contents::Align(AlignContents::new(boundary, fill, None)),
                    self.line,
                ))
            }

            _ => {
                if let Some(elem_size) = reserve_size(keyword) {
                    let count = self.expr()?;
                    return Ok(Bytecode::new(
                        Contents::Gap(GapContents { count, elem_size }),
                        self.line,
                    ));
                }

                if let Some(size) = data_size(keyword) {
                    return self.data_statement(size);
                }

                self.insn_statement()
            }
        }
    }

    fn data_statement(&mut self, size: u64) -> Result<Bytecode, Error> {
        let mut items = Vec::new();

        loop {
            // A string followed by more expression is a character constant;
            // a bare string is literal data.
            let bare_string = matches!(self.peek(), Some(Token::Str(_)))
                && !continues_expr(self.peek_at(1));

            match self.peek() {
                Some(Token::Str(_)) if bare_string => {
                    let Some(Token::Str(bytes)) = self.next() else { unreachable!() };
                    if size == 1 {
                        items.push(DataItem::Raw(bytes));
                    } else if bytes.len() as u64 <= size {
                        // Short strings zero-pad up to the element size.
                        let mut padded = bytes;
                        padded.resize(size as usize, 0);
                        items.push(DataItem::Raw(padded));
                    } else {
                        return Err(self.syntax("string constant is larger than the data size"));
                    }
                }
                _ => {
                    let expr = self.expr()?;
                    items.push(DataItem::Value(Value::from_expr(
                        expr,
                        size as u32 * 8,
                        self.line,
                    )));
                }
            }

            if !self.eat_punct(',') {
                break;
            }
        }

        if items.is_empty() {
            return Err(self.syntax("expected data after data declaration"));
        }

        Ok(Bytecode::new(Contents::Data(DataContents { items }), self.line))
    }

    fn insn_statement(&mut self) -> Result<Bytecode, Error> {
        self.pos -= 1; // Re-read the mnemonic with prefixes in mind.

        let mut prefixes = Vec::new();
        let mnemonic = loop {
            let Some(Token::Ident(name)) = self.peek().cloned() else {
                return Err(self.syntax("expected instruction mnemonic"));
            };
            let lowered = name.to_ascii_lowercase();
            if let Some(byte) = self.arch.parse_check_prefix(&lowered) {
                prefixes.push(byte);
                self.pos += 1;
                continue;
            }
            if !self.arch.parse_check_insn(&lowered) {
                return Err(self.syntax(format!("unrecognized instruction `{name}`")));
            }
            self.pos += 1;
            break lowered;
        };

        let mut operands = Vec::new();
        if !self.at_end() {
            loop {
                operands.push(self.operand()?);
                if !self.eat_punct(',') {
                    break;
                }
            }
        }

        let contents = self.arch.create_insn(&mnemonic, &prefixes, operands, self.line)?;
        Ok(Bytecode::new(contents, self.line))
    }

    fn operand(&mut self) -> Result<Operand, Error> {
        let mut size = 0u32;
        let mut strict = false;
        let mut target_mod = None;

        loop {
            let Some(Token::Ident(name)) = self.peek() else { break };
            match name.to_ascii_lowercase().as_str() {
                "byte" => size = 8,
                "word" => size = 16,
                "dword" => size = 32,
                "qword" => size = 64,
                "tword" => size = 80,
                "short" => target_mod = Some(TargetMod::Short),
                "near" => target_mod = Some(TargetMod::Near),
                "far" => target_mod = Some(TargetMod::Far),
                "strict" => strict = true,
                _ => break,
            }
            self.pos += 1;
        }

        if self.eat_punct('[') {
            // Optional segment override: `[es: ...]`.
            let mut segment = None;
            if let (Some(Token::Ident(name)), Some(colon)) = (self.peek(), self.peek_at(1)) {
                if colon.is_punct(':') {
                    if let Some(register) =
                        self.arch.parse_check_reg(&name.to_ascii_lowercase())
                    {
                        segment = Some(register);
                        self.pos += 2;
                    }
                }
            }

            let disp = self.expr()?;
            self.expect_punct(']')?;

            return Ok(Operand::Mem(Box::new(EffectiveAddr { disp, size, segment })));
        }

        let expr = self.expr()?;
        if let Some(register) = expr.get_register() {
            if size != 0 {
                if size == self.arch.reg_size(register) {
                    self.errwarns.warn_set(
                        WarnClass::SizeOverride,
                        "register size specification ignored",
                    );
                } else {
                    return Err(Error::Type(
                        "cannot override the size of a register".to_owned(),
                    ));
                }
            }
            return Ok(Operand::Reg(register));
        }

        Ok(Operand::Imm { expr, size, strict, target_mod })
    }

    // ----- directives -------------------------------------------------

    fn dispatch_directive(&mut self, name: &str, namevals: NameValues) -> Result<(), Error> {
        let lowered = name.to_ascii_lowercase();
        match lowered.as_str() {
            "section" | "segment" => {
                self.directives.operate("section", self.object, &namevals, &[], self.line)
            }
            "bits" => {
                let bits = namevals
                    .first()
                    .and_then(|nameval| nameval.as_int(self.object))
                    .and_then(|value| value.to_u64())
                    .ok_or_else(|| self.syntax("`bits` requires a numeric argument"))?;
                self.arch.set_var("mode_bits", bits)
            }
            "use16" => self.arch.set_var("mode_bits", 16),
            "use32" => self.arch.set_var("mode_bits", 32),
            "use64" => self.arch.set_var("mode_bits", 64),
            "global" | "extern" => {
                let visibility = if lowered == "global" {
                    Visibility::Global
                } else {
                    Visibility::Extern
                };
                if namevals.is_empty() {
                    return Err(self.syntax(format!("`{lowered}` requires a symbol name")));
                }
                for nameval in &namevals {
                    let id = nameval
                        .as_id()
                        .ok_or_else(|| self.syntax(format!("bad argument to `{lowered}`")))?;
                    let name = self.resolve_label_name(id)?;
                    let symbol = self.object.get_symbol(&name);
                    self.object
                        .symbols_mut()
                        .get_mut(symbol)
                        .declare(visibility.into(), self.line)?;
                }
                Ok(())
            }
            "common" => {
                let mut iter = namevals.iter();
                let id = iter
                    .next()
                    .and_then(NameValue::as_id)
                    .ok_or_else(|| self.syntax("`common` requires a symbol name"))?;
                let size = iter
                    .next()
                    .and_then(NameValue::as_expr)
                    .cloned()
                    .ok_or_else(|| self.syntax("`common` requires a size"))?;

                let name = self.resolve_label_name(id)?;
                let symbol = self.object.get_symbol(&name);
                self.object.symbols_mut().get_mut(symbol).define_common(size, self.line)?;
                Ok(())
            }
            "cpu" => Ok(()), // Accepted for compatibility; everything is on.
            _ => self.directives.operate(&lowered, self.object, &namevals, &[], self.line),
        }
    }

    /// Parse directive arguments: bare identifiers, `name=value` pairs,
    /// strings and expressions, separated by commas or blanks.
    fn namevals(&mut self, stop_at_bracket: bool) -> Result<NameValues, Error> {
        let mut namevals = Vec::new();

        loop {
            if self.at_end() || (stop_at_bracket && matches!(self.peek(), Some(token) if token.is_punct(']'))) {
                break;
            }

            self.eat_punct(',');
            if self.at_end() {
                break;
            }

            match (self.peek().cloned(), self.peek_at(1).cloned()) {
                (Some(Token::Ident(name)), Some(eq)) if eq.is_punct('=') => {
                    self.pos += 2;
                    // A lone identifier value stays an identifier
                    // (`follows=.text`); anything else is an expression.
                    let value = match self.peek().cloned() {
                        Some(Token::Ident(id)) if !continues_expr(self.peek_at(1)) => {
                            self.pos += 1;
                            NameValueParam::Id(id)
                        }
                        Some(Token::Str(bytes)) => {
                            self.pos += 1;
                            NameValueParam::Str(
                                String::from_utf8_lossy(&bytes).into_owned(),
                            )
                        }
                        _ => NameValueParam::Expr(self.expr()?),
                    };
                    namevals.push(NameValue { name: Some(name), value });
                }
                (Some(Token::Ident(id)), next) if !continues_expr(next.as_ref()) => {
                    self.pos += 1;
                    namevals.push(NameValue::id(id));
                }
                (Some(Token::Str(bytes)), _) => {
                    self.pos += 1;
                    namevals.push(NameValue {
                        name: None,
                        value: NameValueParam::Str(String::from_utf8_lossy(&bytes).into_owned()),
                    });
                }
                _ => {
                    let expr = self.expr()?;
                    namevals.push(NameValue { name: None, value: NameValueParam::Expr(expr) });
                }
            }
        }

        Ok(namevals)
    }

    // ----- expressions ------------------------------------------------

    fn expr(&mut self) -> Result<Expr, Error> {
        let mut expr = self.lor_expr()?;

        while matches!(self.peek(), Some(Token::Ident(id)) if id.eq_ignore_ascii_case("wrt")) {
            self.pos += 1;
            let rhs = self.lor_expr()?;
            expr = Expr::binary(expr, Op::Wrt, rhs);
        }

        Ok(expr)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr, Error>,
        table: &[(&str, Op)],
    ) -> Result<Expr, Error> {
        let mut expr = next(self)?;

        loop {
            let op = match self.peek() {
                Some(Token::Op(symbol)) => {
                    table.iter().find(|(name, _)| name == symbol).map(|(_, op)| *op)
                }
                Some(Token::Punct(ch)) => {
                    let mut buffer = [0u8; 4];
                    let symbol: &str = ch.encode_utf8(&mut buffer);
                    table.iter().find(|(name, _)| *name == symbol).map(|(_, op)| *op)
                }
                _ => None,
            };

            let Some(op) = op else { break };
            self.pos += 1;
            let rhs = next(self)?;
            expr = Expr::binary(expr, op, rhs);
        }

        Ok(expr)
    }

    fn lor_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(Self::lxor_expr, &[("||", Op::LogicalOr)])
    }

    fn lxor_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(Self::land_expr, &[("^^", Op::LogicalXor)])
    }

    fn land_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(Self::or_expr, &[("&&", Op::LogicalAnd)])
    }

    fn or_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(Self::xor_expr, &[("|", Op::Or)])
    }

    fn xor_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(Self::and_expr, &[("^", Op::Xor)])
    }

    fn and_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(Self::equality_expr, &[("&", Op::And)])
    }

    fn equality_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(
            Self::relational_expr,
            &[("==", Op::Eq), ("=", Op::Eq), ("!=", Op::Ne), ("<>", Op::Ne)],
        )
    }

    fn relational_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(
            Self::shift_expr,
            &[("<=", Op::Le), (">=", Op::Ge), ("<", Op::Lt), (">", Op::Gt)],
        )
    }

    fn shift_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(Self::additive_expr, &[("<<", Op::Shl), (">>", Op::Shr)])
    }

    fn additive_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(Self::multiplicative_expr, &[("+", Op::Add), ("-", Op::Sub)])
    }

    fn multiplicative_expr(&mut self) -> Result<Expr, Error> {
        self.binary_level(
            Self::unary_expr,
            &[
                ("*", Op::Mul),
                ("/", Op::Div),
                ("//", Op::SignDiv),
                ("%", Op::Mod),
                ("%%", Op::SignMod),
            ],
        )
    }

    fn unary_expr(&mut self) -> Result<Expr, Error> {
        match self.peek() {
            Some(Token::Punct('-')) => {
                self.pos += 1;
                Ok(Expr::unary(Op::Neg, self.unary_expr()?))
            }
            Some(Token::Punct('+')) => {
                self.pos += 1;
                self.unary_expr()
            }
            Some(Token::Punct('~')) => {
                self.pos += 1;
                Ok(Expr::unary(Op::Not, self.unary_expr()?))
            }
            Some(Token::Punct('!')) => {
                self.pos += 1;
                Ok(Expr::unary(Op::LogicalNot, self.unary_expr()?))
            }
            Some(Token::Ident(id)) if id.eq_ignore_ascii_case("seg") => {
                self.pos += 1;
                Ok(Expr::unary(Op::Seg, self.unary_expr()?))
            }
            _ => self.primary_expr(),
        }
    }

    fn primary_expr(&mut self) -> Result<Expr, Error> {
        match self.next() {
            Some(Token::Num(value)) => Ok(Expr::from_int(value)),
            Some(Token::Float(value)) => Ok(Expr::from_float(value)),
            Some(Token::Str(bytes)) => {
                if bytes.len() > 16 {
                    return Err(self.syntax("character constant is too large"));
                }
                let value = IntNum::from_bytes(&bytes, false, false)?;
                Ok(Expr::from_int(value))
            }
            Some(Token::Dollar) => Ok(Expr::from_loc(self.object.here(self.line))),
            Some(Token::DollarDollar) => {
                let section = self
                    .object
                    .cur_section()
                    .ok_or_else(|| self.syntax("`$$` outside of a section"))?;
                Ok(Expr::from_loc(yasm_core::Location { section, bc: 0, off: 0 }))
            }
            Some(Token::Punct('(')) => {
                let expr = self.expr()?;
                self.expect_punct(')')?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                if let Some(register) = self.arch.parse_check_reg(&name.to_ascii_lowercase()) {
                    return Ok(Expr::from_reg(register));
                }

                let name = self.resolve_label_name(&name)?;
                let symbol = self.object.get_symbol(&name);
                self.object.symbols_mut().get_mut(symbol).use_at(self.line);
                Ok(Expr::from_sym(symbol))
            }
            _ => Err(self.syntax("expected expression")),
        }
    }
}

/// Can an expression continue with this token? Directive arguments use this
/// to tell a bare identifier from the start of an expression.
fn continues_expr(token: Option<&Token>) -> bool {
    match token {
        Some(Token::Op(_)) => true,
        Some(Token::Punct(ch)) => "+-*/%&|^<>=!".contains(*ch),
        Some(Token::Ident(id)) => id.eq_ignore_ascii_case("wrt"),
        _ => false,
    }
}

fn is_directive_keyword(keyword: &str) -> bool {
    matches!(
        keyword,
        "section" | "segment" | "bits" | "use16" | "use32" | "use64" | "global" | "extern"
            | "common" | "cpu" | "org"
    )
}

fn data_size(keyword: &str) -> Option<u64> {
    Some(match keyword {
        "db" => 1,
        "dw" => 2,
        "dd" => 4,
        "dq" => 8,
        "dt" => 10,
        _ => return None,
    })
}

fn reserve_size(keyword: &str) -> Option<u64> {
    Some(match keyword {
        "resb" => 1,
        "resw" => 2,
        "resd" => 4,
        "resq" => 8,
        "rest" => 10,
        _ => return None,
    })
}
