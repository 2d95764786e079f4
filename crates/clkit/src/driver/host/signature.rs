//! Kernel signature extraction from OpenCL C source.
//!
//! The host driver cannot compile OpenCL C, but it still has to answer
//! argument-info queries the way a real compiler would. This module finds
//! every `__kernel` function in a program source and records, per parameter,
//! the address space, the type name as a driver reports it (`int*`, `uint`,
//! `float4*`) and whether it is a pointer.

use crate::driver::AddressQualifier;

/// One kernel parameter as declared in source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDecl {
    pub name: String,
    /// Type name with a trailing `*` for pointers, e.g. `int*`.
    pub type_name: String,
    pub qualifier: AddressQualifier,
    pub is_pointer: bool,
}

impl ParamDecl {
    /// Type name without the pointer marker.
    pub fn base_type(&self) -> &str {
        self.type_name.trim_end_matches('*')
    }
}

/// A `__kernel` function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    /// 1-based source line of the `__kernel` keyword.
    pub line: usize,
}

/// A signature that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

/// Blank out `//` and `/* */` comments, keeping newlines so line numbers
/// stay meaningful.
fn strip_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

fn tokenize(src: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (idx, raw_line) in src.lines().enumerate() {
        let line = idx + 1;
        // Preprocessor directives never contain kernel signatures.
        if raw_line.trim_start().starts_with('#') {
            continue;
        }
        let mut chars = raw_line.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
            } else if c.is_ascii_alphanumeric() || c == '_' {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token { tok: Tok::Ident(word), line });
            } else {
                tokens.push(Token { tok: Tok::Punct(c), line });
                chars.next();
            }
        }
    }
    tokens
}

fn is_ident(token: Option<&Token>, word: &str) -> bool {
    matches!(token, Some(Token { tok: Tok::Ident(w), .. }) if w == word)
}

fn is_punct(token: Option<&Token>, p: char) -> bool {
    matches!(token, Some(Token { tok: Tok::Punct(c), .. }) if *c == p)
}

/// Index just past the parenthesised group starting at `open`.
fn skip_group(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        match t.tok {
            Tok::Punct('(') => depth += 1,
            Tok::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse every kernel signature in `source`.
///
/// All problems are collected rather than stopping at the first, so a build
/// log can list them together.
pub fn parse_kernels(source: &str) -> Result<Vec<KernelDecl>, Vec<SignatureError>> {
    let tokens = tokenize(&strip_comments(source));
    let mut kernels = Vec::new();
    let mut errors = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let is_kernel_kw = matches!(&tokens[i].tok, Tok::Ident(w) if w == "__kernel" || w == "kernel");
        if !is_kernel_kw {
            i += 1;
            continue;
        }
        let line = tokens[i].line;
        match parse_kernel_at(&tokens, i + 1, line) {
            Ok((decl, next)) => {
                kernels.push(decl);
                i = next;
            }
            Err(err) => {
                errors.push(err);
                i += 1;
            }
        }
    }

    if errors.is_empty() {
        Ok(kernels)
    } else {
        Err(errors)
    }
}

fn parse_kernel_at(
    tokens: &[Token],
    mut i: usize,
    line: usize,
) -> Result<(KernelDecl, usize), SignatureError> {
    let fail = |message: String| SignatureError { line, message };

    while is_ident(tokens.get(i), "__attribute__") {
        if !is_punct(tokens.get(i + 1), '(') {
            return Err(fail("malformed __attribute__".into()));
        }
        i = skip_group(tokens, i + 1).ok_or_else(|| fail("unterminated __attribute__".into()))?;
    }

    if !is_ident(tokens.get(i), "void") {
        return Err(fail("kernel function must return void".into()));
    }
    i += 1;

    let name = match tokens.get(i) {
        Some(Token { tok: Tok::Ident(name), .. }) => name.clone(),
        _ => return Err(fail("expected kernel name after `void`".into())),
    };
    i += 1;

    if !is_punct(tokens.get(i), '(') {
        return Err(fail(format!("expected `(` after kernel name `{name}`")));
    }
    let close = skip_group(tokens, i)
        .ok_or_else(|| fail(format!("unterminated parameter list for kernel `{name}`")))?;
    let inner = &tokens[i + 1..close - 1];

    let mut params = Vec::new();
    let pieces: Vec<&[Token]> = inner
        .split(|t| t.tok == Tok::Punct(','))
        .collect();
    let is_void_list = pieces.len() == 1
        && (pieces[0].is_empty() || (pieces[0].len() == 1 && is_ident(pieces[0].first(), "void")));
    if !is_void_list {
        for piece in pieces {
            let param = parse_param(piece).map_err(|message| SignatureError {
                line: piece.first().map_or(line, |t| t.line),
                message: format!("kernel `{name}`: {message}"),
            })?;
            params.push(param);
        }
    }

    Ok((KernelDecl { name, params, line }, close))
}

fn parse_param(tokens: &[Token]) -> Result<ParamDecl, String> {
    let mut qualifier = None;
    let mut pointers = 0usize;
    let mut words: Vec<&str> = Vec::new();

    for t in tokens {
        match &t.tok {
            Tok::Ident(w) => match w.as_str() {
                "__global" | "global" => qualifier = Some(AddressQualifier::Global),
                "__local" | "local" => qualifier = Some(AddressQualifier::Local),
                "__constant" | "constant" => qualifier = Some(AddressQualifier::Constant),
                "__private" | "private" => qualifier = Some(AddressQualifier::Private),
                "const" | "volatile" | "restrict" | "__restrict" | "__read_only" | "read_only"
                | "__write_only" | "write_only" | "__read_write" | "read_write" => {}
                other => words.push(other),
            },
            Tok::Punct('*') => pointers += 1,
            Tok::Punct('[') => return Err("array parameters are not supported".into()),
            Tok::Punct(c) => return Err(format!("unexpected `{c}` in parameter")),
        }
    }

    if words.len() < 2 {
        return Err(format!(
            "parameter `{}` is missing a type or a name",
            words.join(" ")
        ));
    }
    let name = words.pop().unwrap_or_default().to_string();
    if pointers > 1 {
        return Err(format!("parameter `{name}`: pointer-to-pointer is not allowed"));
    }
    let base = normalize_type(&words);
    let is_pointer = pointers == 1;

    let qualifier = match (is_pointer, qualifier) {
        (true, None) => {
            return Err(format!("pointer parameter `{name}` needs an address space qualifier"))
        }
        (true, Some(q)) => q,
        (false, None) | (false, Some(AddressQualifier::Private)) => AddressQualifier::Private,
        (false, Some(q)) => {
            return Err(format!("parameter `{name}`: {q} requires a pointer type"))
        }
    };

    let type_name = if is_pointer { format!("{base}*") } else { base };
    Ok(ParamDecl { name, type_name, qualifier, is_pointer })
}

fn normalize_type(words: &[&str]) -> String {
    match words {
        ["unsigned"] | ["unsigned", "int"] => "uint".into(),
        ["unsigned", "char"] => "uchar".into(),
        ["unsigned", "short"] => "ushort".into(),
        ["unsigned", "long"] => "ulong".into(),
        ["signed", rest @ ..] if !rest.is_empty() => rest.join(" "),
        _ => words.join(" "),
    }
}
