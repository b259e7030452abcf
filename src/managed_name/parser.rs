use super::{InvalidManagedNameError, ManagedNameErrorKind};

type ParseResult<T> = std::result::Result<T, InvalidManagedNameError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMethodName {
    /// Unescaped method name.
    pub method_name: String,
    pub arity: usize,
    /// Encoded parameter type strings; `None` when there is no parameter list
    /// or it is empty.
    pub parameter_types: Option<Vec<String>>,
}

/// Split a managed type name on its last `.` into `(namespace, type name)`.
/// The namespace is empty when there is no dot.
pub fn parse_managed_type_name(managed_type_name: &str) -> (String, String) {
    match managed_type_name.rfind('.') {
        Some(pos) => (
            managed_type_name[..pos].to_string(),
            managed_type_name[pos + 1..].to_string(),
        ),
        None => (String::new(), managed_type_name.to_string()),
    }
}

pub fn parse_managed_method_name(managed_method_name: &str) -> ParseResult<ParsedMethodName> {
    let mut scanner = Scanner::new(managed_method_name);
    let (method_name, arity) = scanner.method_name()?;
    let parameter_types = scanner.parameter_list()?;
    if !scanner.at_end() {
        return Err(InvalidManagedNameError::at(
            ManagedNameErrorKind::UnexpectedCharacter,
            scanner.pos,
            format!(
                "Unexpected character '{}' at index {} after the parameter list of '{}'.",
                scanner.chars[scanner.pos], scanner.pos, managed_method_name
            ),
        ));
    }
    Ok(ParsedMethodName { method_name, arity, parameter_types })
}

/// Explicit-position cursor over a managed method name.
struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

impl Scanner {
    fn new(input: &str) -> Self {
        Self { chars: input.chars().collect(), pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn capture(&self, start: usize, end: usize) -> String {
        self.chars[start..end].iter().collect()
    }

    fn input(&self) -> String {
        self.chars.iter().collect()
    }

    fn whitespace_error(&self, index: usize) -> InvalidManagedNameError {
        InvalidManagedNameError::at(
            ManagedNameErrorKind::WhitespaceNotValid,
            index,
            format!(
                "Whitespace is not valid in a managed name ('{}', index {}).",
                self.input(),
                index
            ),
        )
    }

    fn incomplete_error(&self) -> InvalidManagedNameError {
        InvalidManagedNameError::at(
            ManagedNameErrorKind::IncompleteManagedName,
            self.chars.len(),
            format!("Managed name '{}' is incomplete.", self.input()),
        )
    }

    /// Reads the method name up to a backtick, an open paren or the end,
    /// removing quotes and backslash escapes.
    fn method_name(&mut self) -> ParseResult<(String, usize)> {
        let mut name = String::new();
        let mut quoted = false;
        while let Some(c) = self.peek() {
            if quoted {
                match c {
                    '\\' => {
                        self.pos += 1;
                        let escaped = self.peek().ok_or_else(|| self.incomplete_error())?;
                        name.push(escaped);
                    }
                    '\'' => quoted = false,
                    _ => name.push(c),
                }
                self.pos += 1;
                continue;
            }

            match c {
                '\'' => quoted = true,
                '`' => {
                    let arity = self.arity()?;
                    return Ok((name, arity));
                }
                '(' => return Ok((name, 0)),
                w if w.is_whitespace() => return Err(self.whitespace_error(self.pos)),
                _ => name.push(c),
            }
            self.pos += 1;
        }

        if quoted {
            return Err(self.incomplete_error());
        }
        Ok((name, 0))
    }

    /// Positioned on the backtick. Reads digits up to `(` or the end.
    fn arity(&mut self) -> ParseResult<usize> {
        let start = self.pos + 1;
        self.pos = start;
        while let Some(c) = self.peek() {
            if c == '(' {
                break;
            }
            self.pos += 1;
        }
        let text = self.capture(start, self.pos);
        text.parse::<usize>().map_err(|_| {
            InvalidManagedNameError::at(
                ManagedNameErrorKind::ArityNotNumeric,
                start,
                format!(
                    "Method arity must be numeric, got '{}' at index {} in '{}'.",
                    text,
                    start,
                    self.input()
                ),
            )
        })
    }

    fn parameter_list(&mut self) -> ParseResult<Option<Vec<String>>> {
        if self.at_end() {
            return Ok(None);
        }
        // method_name() only stops early on '('
        self.pos += 1;

        let mut types = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                ')' => {
                    self.pos += 1;
                    return Ok(if types.is_empty() { None } else { Some(types) });
                }
                ',' => self.pos += 1,
                _ => types.push(self.parameter_type()?),
            }
        }
        Err(self.incomplete_error())
    }

    /// Reads one parameter type, leaving the cursor on the `,` or `)`
    /// that ends it.
    fn parameter_type(&mut self) -> ParseResult<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                '\'' => self.skip_quoted()?,
                '<' => {
                    self.pos += 1;
                    self.generic_brackets()?;
                }
                '[' => {
                    self.pos += 1;
                    self.array_brackets()?;
                }
                ',' | ')' => return Ok(self.capture(start, self.pos)),
                w if w.is_whitespace() => return Err(self.whitespace_error(self.pos)),
                _ => self.pos += 1,
            }
        }
        Err(self.incomplete_error())
    }

    /// Entered just past `<`; consumes through the matching `>`.
    fn generic_brackets(&mut self) -> ParseResult<()> {
        while let Some(c) = self.peek() {
            match c {
                '\'' => self.skip_quoted()?,
                '<' => {
                    self.pos += 1;
                    self.generic_brackets()?;
                }
                '[' => {
                    self.pos += 1;
                    self.array_brackets()?;
                }
                '>' => {
                    self.pos += 1;
                    return Ok(());
                }
                w if w.is_whitespace() => return Err(self.whitespace_error(self.pos)),
                _ => self.pos += 1,
            }
        }
        Err(self.incomplete_error())
    }

    /// Entered just past `[`; consumes through the matching `]`.
    fn array_brackets(&mut self) -> ParseResult<()> {
        while let Some(c) = self.peek() {
            match c {
                '\'' => self.skip_quoted()?,
                ']' => {
                    self.pos += 1;
                    return Ok(());
                }
                w if w.is_whitespace() => return Err(self.whitespace_error(self.pos)),
                _ => self.pos += 1,
            }
        }
        Err(self.incomplete_error())
    }

    /// Positioned on an opening quote; consumes through the closing quote.
    fn skip_quoted(&mut self) -> ParseResult<()> {
        self.pos += 1;
        while let Some(c) = self.peek() {
            match c {
                '\\' => self.pos += 2,
                '\'' => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => self.pos += 1,
            }
        }
        Err(self.incomplete_error())
    }
}
