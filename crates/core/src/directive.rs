//! Directives: the name → handler registry parsers dispatch into.

use std::collections::HashMap;

use crate::{Error, Expr, IntNum, Line, Object};

/// The value side of a `name=value` directive argument.
#[derive(Debug, Clone)]
pub enum NameValueParam {
    /// A bare identifier (`nobits`, `code`…).
    Id(String),
    /// A quoted string.
    Str(String),
    /// An expression (`start=0x7c00`).
    Expr(Expr),
}

/// One directive argument: a bare value, or a `name=value` pair.
#[derive(Debug, Clone)]
pub struct NameValue {
    /// The name, for `name=value` arguments.
    pub name: Option<String>,
    /// The value.
    pub value: NameValueParam,
}

impl NameValue {
    /// A bare identifier argument.
    pub fn id(id: impl Into<String>) -> Self {
        Self { name: None, value: NameValueParam::Id(id.into()) }
    }

    /// A `name=value` argument with an expression value.
    pub fn expr(name: impl Into<String>, expr: Expr) -> Self {
        Self { name: Some(name.into()), value: NameValueParam::Expr(expr) }
    }

    /// The value as an identifier, if it is one.
    pub fn as_id(&self) -> Option<&str> {
        match &self.value {
            NameValueParam::Id(id) => Some(id),
            _ => None,
        }
    }

    /// The value as a string: identifiers and quoted strings both qualify.
    pub fn as_string(&self) -> Option<&str> {
        match &self.value {
            NameValueParam::Id(id) => Some(id),
            NameValueParam::Str(string) => Some(string),
            NameValueParam::Expr(_) => None,
        }
    }

    /// The value as an expression; identifiers do not qualify.
    pub fn as_expr(&self) -> Option<&Expr> {
        match &self.value {
            NameValueParam::Expr(expr) => Some(expr),
            _ => None,
        }
    }

    /// The value as a constant integer.
    pub fn as_int(&self, object: &Object) -> Option<IntNum> {
        let mut expr = self.as_expr()?.clone();
        let ctx = crate::ExprCtx::symbols_only(object.symbols());
        expr.simplify(&ctx, false).ok()?;
        expr.get_intnum().copied()
    }
}

/// A list of directive arguments.
pub type NameValues = Vec<NameValue>;

/// A directive handler. Receives the object, the value arguments, the
/// object-format extension arguments, and the source line.
pub type DirHandler =
    Box<dyn Fn(&mut Object, &[NameValue], &[NameValue], Line) -> Result<(), Error>>;

/// The directive registry. Names are case-insensitive.
#[derive(Default)]
pub struct Directives {
    handlers: HashMap<String, DirHandler>,
}

impl Directives {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    pub fn add(&mut self, name: &str, handler: DirHandler) {
        self.handlers.insert(name.to_ascii_lowercase(), handler);
    }

    /// True when a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_lowercase())
    }

    /// Dispatch a directive. Unknown names are an error; the parser warns
    /// instead when it wants to be lenient.
    pub fn operate(
        &self,
        name: &str,
        object: &mut Object,
        namevals: &[NameValue],
        objext_namevals: &[NameValue],
        line: Line,
    ) -> Result<(), Error> {
        let handler = self
            .handlers
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::Syntax(format!("unrecognized directive `{name}`")))?;

        handler(object, namevals, objext_namevals, line)
    }
}

impl std::fmt::Debug for Directives {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Directives")
            .field("names", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Helper that maps `name=value` arguments onto setter closures, the common
/// shape of section-attribute directives.
///
/// ```
/// use yasm_core::{DirHelpers, NameValue, Expr, IntNum};
///
/// let mut start = None;
/// let mut nobits = false;
///
/// let namevals = vec![
///     NameValue::expr("start", Expr::from_int(IntNum::new(0x7c00))),
///     NameValue::id("nobits"),
/// ];
///
/// let mut helpers = DirHelpers::new();
/// helpers.add_expr("start", &mut start);
/// helpers.add_flag("nobits", &mut nobits);
/// helpers.operate(&namevals).unwrap();
///
/// assert!(nobits);
/// assert!(start.is_some());
/// ```
#[derive(Default)]
pub struct DirHelpers<'a> {
    expr_slots: Vec<(&'static str, &'a mut Option<Expr>)>,
    flag_slots: Vec<(&'static str, &'a mut bool)>,
    id_slots: Vec<(&'static str, &'a mut Option<String>)>,
}

impl<'a> DirHelpers<'a> {
    /// Creates an empty helper set.
    pub fn new() -> Self {
        Self::default()
    }

    /// `name=expr` fills `slot`.
    pub fn add_expr(&mut self, name: &'static str, slot: &'a mut Option<Expr>) {
        self.expr_slots.push((name, slot));
    }

    /// A bare `name` sets `slot` to true.
    pub fn add_flag(&mut self, name: &'static str, slot: &'a mut bool) {
        self.flag_slots.push((name, slot));
    }

    /// `name=id` fills `slot` with the identifier.
    pub fn add_id(&mut self, name: &'static str, slot: &'a mut Option<String>) {
        self.id_slots.push((name, slot));
    }

    /// Apply every argument to its slot; unmatched arguments are an error.
    pub fn operate(&mut self, namevals: &[NameValue]) -> Result<(), Error> {
        'namevals: for nameval in namevals {
            match (&nameval.name, &nameval.value) {
                (Some(name), _) => {
                    for (slot_name, slot) in &mut self.expr_slots {
                        if slot_name.eq_ignore_ascii_case(name) {
                            let expr = nameval.as_expr().cloned().or_else(|| {
                                // `align=16` parses the value as an id in
                                // some grammars; accept digits there too.
                                nameval
                                    .as_id()
                                    .and_then(|id| IntNum::from_radix_str(id, 10).ok())
                                    .map(Expr::from_int)
                            });
                            match expr {
                                Some(expr) => {
                                    **slot = Some(expr);
                                    continue 'namevals;
                                }
                                None => {
                                    return Err(Error::Value(format!(
                                        "directive parameter `{name}` requires an expression"
                                    )));
                                }
                            }
                        }
                    }
                    for (slot_name, slot) in &mut self.id_slots {
                        if slot_name.eq_ignore_ascii_case(name) {
                            match nameval.as_string() {
                                Some(id) => {
                                    **slot = Some(id.to_owned());
                                    continue 'namevals;
                                }
                                None => {
                                    return Err(Error::Value(format!(
                                        "directive parameter `{name}` requires an identifier"
                                    )));
                                }
                            }
                        }
                    }
                    return Err(Error::Value(format!("unrecognized parameter `{name}`")));
                }
                (None, NameValueParam::Id(id)) => {
                    for (slot_name, slot) in &mut self.flag_slots {
                        if slot_name.eq_ignore_ascii_case(id) {
                            **slot = true;
                            continue 'namevals;
                        }
                    }
                    return Err(Error::Value(format!("unrecognized qualifier `{id}`")));
                }
                (None, _) => {
                    return Err(Error::Value(
                        "unexpected bare value in directive".to_owned(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_helpers() {
        let mut vstart = None;
        let mut follows = None;
        let mut nobits = false;

        let namevals = vec![
            NameValue::expr("vstart", Expr::from_int(IntNum::new(0x100))),
            NameValue {
                name: Some("follows".to_owned()),
                value: NameValueParam::Id(".text".to_owned()),
            },
            NameValue::id("nobits"),
        ];

        let mut helpers = DirHelpers::new();
        helpers.add_expr("vstart", &mut vstart);
        helpers.add_id("follows", &mut follows);
        helpers.add_flag("nobits", &mut nobits);
        helpers.operate(&namevals).unwrap();

        assert!(nobits);
        assert_eq!(follows.as_deref(), Some(".text"));
        assert_eq!(
            vstart.as_ref().and_then(Expr::get_intnum),
            Some(&IntNum::new(0x100))
        );
    }

    #[test]
    fn test_unknown_parameter_is_an_error() {
        let namevals = vec![NameValue::id("wibble")];
        let mut helpers = DirHelpers::new();
        assert!(helpers.operate(&namevals).is_err());
    }

    #[test]
    fn test_directives_dispatch() {
        let mut directives = Directives::new();
        directives.add(
            "org",
            Box::new(|_object, namevals, _objext, _line| {
                assert_eq!(namevals.len(), 1);
                Ok(())
            }),
        );

        let mut object = Object::new("in.asm", "out.bin");
        let namevals = vec![NameValue::expr("", Expr::from_int(IntNum::new(0x100)))];

        assert!(directives.contains("ORG"));
        directives.operate("ORG", &mut object, &namevals, &[], 1).unwrap();
        assert!(directives.operate("nope", &mut object, &namevals, &[], 1).is_err());
    }
}
