//! Parser for symil assembly: tokenized lines → declarations.
//!
//! This step only checks the shape of the text. Names stay unresolved
//! strings; [`crate::builder`] turns the declarations into metadata.

use crate::error::AsmError;
use crate::lexer::Token;
use symil_common::Primitive;

/// One non-blank source line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Line {
    pub num: usize,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeclKind {
    Class,
    Struct,
    Interface,
    Enum(Primitive),
    Delegate,
}

#[derive(Debug)]
pub(crate) struct TypeDecl {
    pub line: usize,
    pub kind: DeclKind,
    pub name: String,
    /// Base class, or base interfaces for an interface.
    pub extends: Vec<String>,
    pub implements: Vec<String>,
    pub sealed: bool,
    pub is_abstract: bool,
    /// `Invoke` signature of a delegate.
    pub signature: Option<Signature>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
}

#[derive(Debug)]
pub(crate) struct Signature {
    pub ret: String,
    pub name: String,
    /// `(type, name)` pairs.
    pub params: Vec<(String, String)>,
}

#[derive(Debug)]
pub(crate) struct FieldDecl {
    pub line: usize,
    pub is_static: bool,
    pub ty: String,
    pub name: String,
    pub literal: Option<Token>,
}

#[derive(Debug, Default)]
pub(crate) struct Modifiers {
    pub is_static: bool,
    pub is_virtual: bool,
    pub is_override: bool,
    /// Explicit `override Base::Name` target.
    pub overrides: Option<String>,
    pub is_final: bool,
    pub is_abstract: bool,
    pub is_native: bool,
    pub is_pure: bool,
}

#[derive(Debug)]
pub(crate) struct MethodDecl {
    pub line: usize,
    pub modifiers: Modifiers,
    pub signature: Signature,
    pub locals: Vec<(String, Option<String>)>,
    pub body: Vec<Line>,
}

/// Cursor over the tokens of one line.
pub(crate) struct Tokens<'a> {
    pub line: usize,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Tokens<'a> {
    pub fn new(line: &'a Line) -> Self {
        Self {
            line: line.num,
            tokens: &line.tokens,
            pos: 0,
        }
    }

    pub fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    pub fn peek_at(&self, offset: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + offset)
    }

    pub fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    pub fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    pub fn unexpected(&self, token: &Token) -> AsmError {
        AsmError::UnexpectedToken {
            line: self.line,
            token: token.text(),
        }
    }

    fn end_of_line(&self) -> AsmError {
        AsmError::UnexpectedToken {
            line: self.line,
            token: "end of line".to_string(),
        }
    }

    /// The next token, which must be an identifier.
    pub fn ident(&mut self) -> Result<&'a str, AsmError> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            Some(other) => Err(self.unexpected(other)),
            None => Err(self.end_of_line()),
        }
    }

    pub fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn punct(&mut self, c: char) -> Result<(), AsmError> {
        match self.next() {
            Some(Token::Punct(p)) if *p == c => Ok(()),
            Some(other) => Err(self.unexpected(other)),
            None => Err(self.end_of_line()),
        }
    }

    /// Fails if anything is left on the line.
    pub fn end(&self) -> Result<(), AsmError> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(self.unexpected(t)),
        }
    }

    /// A parenthesized, comma-separated list of identifiers.
    pub fn ident_list(&mut self) -> Result<Vec<String>, AsmError> {
        self.punct('(')?;
        let mut items = Vec::new();
        if self.eat_punct(')') {
            return Ok(items);
        }
        loop {
            items.push(self.ident()?.to_string());
            if self.eat_punct(')') {
                return Ok(items);
            }
            self.punct(',')?;
        }
    }
}

/// Groups lines into type declarations.
pub(crate) fn parse_module(lines: &[Line]) -> Result<Vec<TypeDecl>, AsmError> {
    let mut decls = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        i += 1;
        let mut t = Tokens::new(line);
        let head = t.ident()?;
        match head {
            ".class" | ".struct" | ".interface" | ".enum" => {
                let mut decl = type_header(head, &mut t)?;
                i = type_members(lines, i, &mut decl)?;
                decls.push(decl);
            }
            ".delegate" => {
                let signature = signature(&mut t)?;
                t.end()?;
                decls.push(TypeDecl {
                    name: signature.name.clone(),
                    signature: Some(signature),
                    ..TypeDecl::new(line.num, DeclKind::Delegate, String::new())
                });
            }
            d if d.starts_with('.') => {
                return Err(AsmError::UnknownDirective {
                    line: line.num,
                    token: d.to_string(),
                })
            }
            other => {
                return Err(AsmError::UnexpectedToken {
                    line: line.num,
                    token: other.to_string(),
                })
            }
        }
    }
    Ok(decls)
}

impl TypeDecl {
    fn new(line: usize, kind: DeclKind, name: String) -> Self {
        Self {
            line,
            kind,
            name,
            extends: Vec::new(),
            implements: Vec::new(),
            sealed: false,
            is_abstract: false,
            signature: None,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }
}

fn type_header(directive: &str, t: &mut Tokens<'_>) -> Result<TypeDecl, AsmError> {
    let name = t.ident()?.to_string();
    let kind = match directive {
        ".class" => DeclKind::Class,
        ".struct" => DeclKind::Struct,
        ".interface" => DeclKind::Interface,
        _ => {
            let underlying = match t.peek() {
                Some(Token::Ident(p)) => {
                    let prim = Primitive::ALL
                        .iter()
                        .copied()
                        .find(|prim| prim.name() == p && prim.is_integer())
                        .ok_or_else(|| AsmError::UnknownType {
                            line: t.line,
                            name: p.clone(),
                        })?;
                    t.advance(1);
                    prim
                }
                _ => Primitive::I32,
            };
            DeclKind::Enum(underlying)
        }
    };
    let mut decl = TypeDecl::new(t.line, kind, name);
    while let Some(token) = t.next() {
        match token {
            Token::Ident(w) if w == "extends" => {
                decl.extends.push(t.ident()?.to_string());
                while t.eat_punct(',') {
                    decl.extends.push(t.ident()?.to_string());
                }
            }
            Token::Ident(w) if w == "implements" => {
                decl.implements.push(t.ident()?.to_string());
                while t.eat_punct(',') {
                    decl.implements.push(t.ident()?.to_string());
                }
            }
            Token::Ident(w) if w == "sealed" => decl.sealed = true,
            Token::Ident(w) if w == "abstract" => decl.is_abstract = true,
            other => return Err(t.unexpected(other)),
        }
    }
    if decl.kind != DeclKind::Interface && decl.extends.len() > 1 {
        return Err(AsmError::UnexpectedToken {
            line: decl.line,
            token: decl.extends[1].clone(),
        });
    }
    Ok(decl)
}

/// Reads members until the closing `.end`; returns the index of the line
/// after it.
fn type_members(lines: &[Line], mut i: usize, decl: &mut TypeDecl) -> Result<usize, AsmError> {
    while i < lines.len() {
        let line = &lines[i];
        i += 1;
        let mut t = Tokens::new(line);
        match t.ident()? {
            ".end" => {
                t.end()?;
                return Ok(i);
            }
            ".field" => decl.fields.push(field(&mut t)?),
            ".method" => {
                let (method, next) = method(lines, i, &mut t)?;
                decl.methods.push(method);
                i = next;
            }
            d if d.starts_with('.') => {
                return Err(AsmError::UnknownDirective {
                    line: line.num,
                    token: d.to_string(),
                })
            }
            other => {
                return Err(AsmError::UnexpectedToken {
                    line: line.num,
                    token: other.to_string(),
                })
            }
        }
    }
    Err(AsmError::Unclosed {
        line: decl.line,
        what: "type declaration",
    })
}

fn field(t: &mut Tokens<'_>) -> Result<FieldDecl, AsmError> {
    let line = t.line;
    let is_static = t.eat_ident("static");
    let literal = t.eat_ident("literal");
    let ty = t.ident()?.to_string();
    let name = t.ident()?.to_string();
    let value = if t.eat_punct('=') {
        match t.next() {
            Some(token) => Some(token.clone()),
            None => return Err(t.end_of_line()),
        }
    } else {
        None
    };
    t.end()?;
    if literal != value.is_some() {
        return Err(AsmError::UnexpectedToken {
            line,
            token: name,
        });
    }
    Ok(FieldDecl {
        line,
        is_static,
        ty,
        name,
        literal: value,
    })
}

/// `Ret Name(Type name, ...)`
fn signature(t: &mut Tokens<'_>) -> Result<Signature, AsmError> {
    let ret = t.ident()?.to_string();
    let name = t.ident()?.to_string();
    t.punct('(')?;
    let mut params = Vec::new();
    if !t.eat_punct(')') {
        loop {
            let ty = t.ident()?.to_string();
            let pname = match t.peek() {
                Some(Token::Ident(n)) => {
                    t.advance(1);
                    n.clone()
                }
                _ => format!("p{}", params.len()),
            };
            params.push((ty, pname));
            if t.eat_punct(')') {
                break;
            }
            t.punct(',')?;
        }
    }
    Ok(Signature { ret, name, params })
}

fn method(lines: &[Line], mut i: usize, t: &mut Tokens<'_>) -> Result<(MethodDecl, usize), AsmError> {
    let line = t.line;
    let mut modifiers = Modifiers::default();
    loop {
        let Some(Token::Ident(word)) = t.peek() else {
            break;
        };
        match word.as_str() {
            "static" => modifiers.is_static = true,
            "virtual" => modifiers.is_virtual = true,
            "final" => modifiers.is_final = true,
            "abstract" => modifiers.is_abstract = true,
            "native" => modifiers.is_native = true,
            "pure" => modifiers.is_pure = true,
            "override" => {
                modifiers.is_override = true;
                if let Some(Token::Ident(target)) = t.peek_at(1) {
                    if target.contains("::") {
                        modifiers.overrides = Some(target.clone());
                        t.advance(1);
                    }
                }
            }
            _ => break,
        }
        t.advance(1);
    }
    let signature = signature(t)?;
    t.end()?;

    let mut locals = Vec::new();
    let mut body = Vec::new();
    while i < lines.len() {
        let current = &lines[i];
        i += 1;
        let mut lt = Tokens::new(current);
        match lt.peek() {
            Some(Token::Ident(d)) if d == ".end" => {
                lt.advance(1);
                lt.end()?;
                let decl = MethodDecl {
                    line,
                    modifiers,
                    signature,
                    locals,
                    body,
                };
                return Ok((decl, i));
            }
            Some(Token::Ident(d)) if d == ".locals" => {
                lt.advance(1);
                locals.extend(local_list(&mut lt)?);
            }
            _ => body.push(current.clone()),
        }
    }
    Err(AsmError::Unclosed {
        line,
        what: "method body",
    })
}

/// `(Type [name], ...)`, parentheses optional.
fn local_list(t: &mut Tokens<'_>) -> Result<Vec<(String, Option<String>)>, AsmError> {
    let parens = t.eat_punct('(');
    let mut locals = Vec::new();
    while !t.is_done() && t.peek() != Some(&Token::Punct(')')) {
        let ty = t.ident()?.to_string();
        let name = match t.peek() {
            Some(Token::Ident(n)) => {
                t.advance(1);
                Some(n.clone())
            }
            _ => None,
        };
        locals.push((ty, name));
        if !t.eat_punct(',') {
            break;
        }
    }
    if parens {
        t.punct(')')?;
    }
    t.end()?;
    Ok(locals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize_line;

    fn lines(text: &str) -> Vec<Line> {
        text.lines()
            .enumerate()
            .filter_map(|(i, l)| {
                let tokens = tokenize_line(l, i + 1).unwrap();
                (!tokens.is_empty()).then_some(Line { num: i + 1, tokens })
            })
            .collect()
    }

    #[test]
    fn class_with_members() {
        let decls = parse_module(&lines(
            "
.class Shape abstract implements IShape
  .field i32 sides
  .field static literal i32 Max = 8
  .method abstract virtual i32 Area()
  .end
  .method static i32 Twice(i32 x)
    .locals (i32 tmp, bool)
    ldarg x
  done: ret
  .end
.end
",
        ))
        .unwrap();
        assert_eq!(decls.len(), 1);
        let shape = &decls[0];
        assert_eq!(shape.kind, DeclKind::Class);
        assert!(shape.is_abstract);
        assert_eq!(shape.implements, vec!["IShape".to_string()]);
        assert_eq!(shape.fields.len(), 2);
        assert_eq!(shape.fields[1].literal, Some(Token::Int(8)));
        assert!(shape.fields[1].is_static);

        let twice = &shape.methods[1];
        assert!(twice.modifiers.is_static);
        assert_eq!(twice.signature.params, vec![("i32".to_string(), "x".to_string())]);
        assert_eq!(
            twice.locals,
            vec![("i32".to_string(), Some("tmp".to_string())), ("bool".to_string(), None)]
        );
        assert_eq!(twice.body.len(), 2);
    }

    #[test]
    fn explicit_override_target() {
        let decls = parse_module(&lines(
            ".class Square extends Shape\n.method override Shape::Area i32 Area()\nret\n.end\n.end\n",
        ))
        .unwrap();
        let m = &decls[0].methods[0].modifiers;
        assert!(m.is_override);
        assert_eq!(m.overrides.as_deref(), Some("Shape::Area"));
    }

    #[test]
    fn enum_and_delegate() {
        let decls = parse_module(&lines(".enum Color u8\n.end\n.delegate i32 Transform(i32 x)\n")).unwrap();
        assert_eq!(decls[0].kind, DeclKind::Enum(Primitive::U8));
        assert_eq!(decls[1].kind, DeclKind::Delegate);
        assert_eq!(decls[1].name, "Transform");
    }

    #[test]
    fn unclosed_method() {
        let err = parse_module(&lines(".class A\n.method void M()\nret\n")).unwrap_err();
        assert_eq!(
            err,
            AsmError::Unclosed {
                line: 2,
                what: "method body"
            }
        );
    }

    #[test]
    fn unknown_directive() {
        let err = parse_module(&lines(".module Foo\n")).unwrap_err();
        assert!(matches!(err, AsmError::UnknownDirective { line: 1, .. }));
    }

    #[test]
    fn literal_needs_value() {
        let err = parse_module(&lines(".class A\n.field static literal i32 X\n.end\n")).unwrap_err();
        assert!(matches!(err, AsmError::UnexpectedToken { line: 2, .. }));
    }
}
