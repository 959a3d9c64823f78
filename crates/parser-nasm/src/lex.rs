//! The NASM-syntax tokenizer.
//!
//! One source line at a time is broken into a token vector; the parser then
//! walks the tokens with ordinary lookahead. Unrecognized characters are
//! not fatal: they are reported through a callback so the parser can issue
//! the classic "ignoring unrecognized character" warning and carry on.

use nom::{
    bytes::complete::{is_a, tag, take_while, take_while1},
    character::complete::char,
    sequence::delimited,
    IResult,
};
use yasm_core::{Error, FloatNum, IntNum};

/// One token of a source line.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// An identifier: label, mnemonic, register or keyword.
    Ident(String),
    /// An integer constant.
    Num(IntNum),
    /// A floating-point constant.
    Float(FloatNum),
    /// A quoted string; doubles as a character constant in expressions.
    Str(Vec<u8>),
    /// A single-character operator or separator.
    Punct(char),
    /// A multi-character operator (`<<`, `||`, `==`…).
    Op(&'static str),
    /// `$`: the current assembly position.
    Dollar,
    /// `$$`: the start of the current section.
    DollarDollar,
}

impl Token {
    /// The identifier, lowercased, when the token is one (keywords are
    /// case-insensitive in NASM).
    pub fn keyword(&self) -> Option<String> {
        match self {
            Token::Ident(name) => Some(name.to_ascii_lowercase()),
            _ => None,
        }
    }

    /// True when the token is the given punctuation character.
    pub fn is_punct(&self, which: char) -> bool {
        matches!(self, Token::Punct(ch) if *ch == which)
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || matches!(ch, '_' | '.' | '?' | '@')
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '?' | '@' | '#' | '~' | '$')
}

fn ident(input: &str) -> IResult<&str, Token> {
    let (rest, first) = take_while1(is_ident_start)(input)?;
    let (rest, tail) = take_while(is_ident_char)(rest)?;

    Ok((rest, Token::Ident(format!("{first}{tail}"))))
}

fn string(input: &str) -> IResult<&str, Token> {
    // NASM single- and double-quoted strings have no escapes.
    for quote in ['\'', '"'] {
        let result: IResult<&str, &str> = delimited(
            char(quote),
            take_while(|ch| ch != quote),
            char(quote),
        )(input);
        if let Ok((rest, contents)) = result {
            return Ok((rest, Token::Str(contents.as_bytes().to_vec())));
        }
    }

    Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Char)))
}

fn number(input: &str) -> IResult<&str, Token> {
    let error = || nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit));

    // Radix prefixes.
    for (prefix, radix) in [("0x", 16), ("0X", 16), ("0b", 2), ("0B", 2), ("0o", 8), ("0q", 8)] {
        if let Ok((rest, _)) = tag::<_, _, nom::error::Error<&str>>(prefix)(input) {
            let (rest, digits) =
                take_while1(|ch: char| ch.is_ascii_hexdigit() || ch == '_')(rest)?;
            let value = IntNum::from_radix_str(digits, radix).map_err(|_| error())?;
            return Ok((rest, Token::Num(value)));
        }
    }

    // The run includes any radix suffix (`1fh`, `17q`, `1010b`).
    let (rest, digits) = take_while1(|ch: char| ch.is_ascii_alphanumeric() || ch == '_')(input)?;
    if !digits.starts_with(|ch: char| ch.is_ascii_digit()) {
        return Err(error());
    }

    // A dot (or a dangling exponent) makes it a float.
    if rest.starts_with('.') {
        let (rest, fraction) = take_while1(|ch: char| {
            ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E' | '+' | '-')
        })(rest)?;
        let value = FloatNum::from_str(&format!("{digits}{fraction}")).map_err(|_| error())?;
        return Ok((rest, Token::Float(value)));
    }

    // Radix suffixes.
    let (digits, radix) = match digits.as_bytes().last() {
        Some(b'h') | Some(b'H') => (&digits[..digits.len() - 1], 16),
        Some(b'q') | Some(b'Q') | Some(b'o') | Some(b'O') => (&digits[..digits.len() - 1], 8),
        Some(b'b') | Some(b'B') if !digits.contains(|ch: char| ch.is_ascii_hexdigit() && !matches!(ch, '0' | '1' | 'b' | 'B')) => {
            (&digits[..digits.len() - 1], 2)
        }
        Some(b'd') | Some(b'D') if !digits.contains(|ch: char| ch.is_ascii_hexdigit() && !ch.is_ascii_digit()) => {
            (&digits[..digits.len() - 1], 10)
        }
        _ => (digits, 10),
    };

    let value = IntNum::from_radix_str(digits, radix).map_err(|_| error())?;
    Ok((rest, Token::Num(value)))
}

fn operator(input: &str) -> IResult<&str, Token> {
    const OPS: &[&str] = &[
        "<<", ">>", "//", "%%", "||", "&&", "^^", "==", "!=", "<=", ">=", "<>",
    ];

    for op in OPS {
        if let Ok((rest, _)) = tag::<_, _, nom::error::Error<&str>>(*op)(input) {
            return Ok((rest, Token::Op(op)));
        }
    }

    if let Ok((rest, _)) = tag::<_, _, nom::error::Error<&str>>("$$")(input) {
        return Ok((rest, Token::DollarDollar));
    }
    if let Ok((rest, _)) = char::<_, nom::error::Error<&str>>('$')(input) {
        // `$` immediately followed by an identifier de-keywords it.
        if let Ok((rest, token)) = ident(rest) {
            return Ok((rest, token));
        }
        return Ok((rest, Token::Dollar));
    }

    let (rest, punct) = is_a("[](),:+-*/%&|^~!<>=")(input)?;
    let ch = punct.chars().next().unwrap();
    Ok((&input[ch.len_utf8()..], Token::Punct(ch)))
}

/// Tokenize one line. `on_unrecognized` is called for every character that
/// fits no token; the character is skipped.
pub fn tokenize(
    line: &str,
    on_unrecognized: &mut dyn FnMut(char),
) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut input = line;

    loop {
        input = input.trim_start();
        if input.is_empty() || input.starts_with(';') {
            break;
        }

        let result = number(input)
            .or_else(|_| ident(input))
            .or_else(|_| string(input))
            .or_else(|_| operator(input));

        match result {
            Ok((rest, token)) => {
                tokens.push(token);
                input = rest;
            }
            Err(_) => {
                let ch = input.chars().next().unwrap();
                on_unrecognized(ch);
                input = &input[ch.len_utf8()..];
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(line: &str) -> Vec<Token> {
        tokenize(line, &mut |ch| panic!("unrecognized `{ch}`")).unwrap()
    }

    #[test]
    fn test_idents_and_numbers() {
        assert_eq!(
            lex("mov ax, 0x1234"),
            vec![
                Token::Ident("mov".into()),
                Token::Ident("ax".into()),
                Token::Punct(','),
                Token::Num(IntNum::new(0x1234)),
            ]
        );
    }

    #[test]
    fn test_number_radixes() {
        assert_eq!(lex("10"), vec![Token::Num(IntNum::new(10))]);
        assert_eq!(lex("0x1f"), vec![Token::Num(IntNum::new(0x1f))]);
        assert_eq!(lex("1fh"), vec![Token::Num(IntNum::new(0x1f))]);
        assert_eq!(lex("0b1010"), vec![Token::Num(IntNum::new(10))]);
        assert_eq!(lex("1010b"), vec![Token::Num(IntNum::new(10))]);
        assert_eq!(lex("17q"), vec![Token::Num(IntNum::new(15))]);
        assert_eq!(lex("1_000"), vec![Token::Num(IntNum::new(1000))]);
    }

    #[test]
    fn test_floats() {
        assert_eq!(lex("3.14"), vec![Token::Float(FloatNum::new(3.14))]);
        assert_eq!(lex("1.5e3"), vec![Token::Float(FloatNum::new(1500.0))]);
    }

    #[test]
    fn test_strings() {
        assert_eq!(lex("'ab'"), vec![Token::Str(b"ab".to_vec())]);
        assert_eq!(lex("\"hi;\" ; comment"), vec![Token::Str(b"hi;".to_vec())]);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            lex("1<<2 || a>>b"),
            vec![
                Token::Num(IntNum::new(1)),
                Token::Op("<<"),
                Token::Num(IntNum::new(2)),
                Token::Op("||"),
                Token::Ident("a".into()),
                Token::Op(">>"),
                Token::Ident("b".into()),
            ]
        );
    }

    #[test]
    fn test_dollars() {
        assert_eq!(lex("$$ - $"), vec![
            Token::DollarDollar,
            Token::Punct('-'),
            Token::Dollar,
        ]);
    }

    #[test]
    fn test_comment_only() {
        assert!(lex("; nothing here").is_empty());
    }

    #[test]
    fn test_unrecognized_character() {
        let mut seen = Vec::new();
        let tokens = tokenize("db 1 \u{1}", &mut |ch| seen.push(ch)).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(seen, vec!['\u{1}']);
    }

    #[test]
    fn test_local_label_ident() {
        assert_eq!(lex(".loop"), vec![Token::Ident(".loop".into())]);
    }
}
