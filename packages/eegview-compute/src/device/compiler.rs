//! Device-side compiler for montage kernel source.
//!
//! Kernel source consists of a precision pragma on the first line followed by
//! helper functions and exactly one `kernel montage { ... }` block:
//!
//! ```text
//! #pragma precision float
//! float avg(float a, float b) { return (a + b) / 2; }
//! kernel montage {
//!     out = avg(in(0), in(1));
//! }
//! ```

use super::vm::{Accessor, Builtin, Function, Module, Op};
use super::Precision;
use crate::montage::lexer::{tokenize, Token, TokenKind};
use std::collections::HashMap;
use std::fmt;

/// Deepest expression nesting the parser accepts.
const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: error: {}", self.line, self.column, self.message)
    }
}

const TYPE_KEYWORDS: &[&str] = &["float", "double", "int", "const"];
const RESERVED: &[&str] = &[
    "out", "in", "x", "y", "z", "INDEX", "M_PI", "M_E", "return", "kernel", "float", "double",
    "int", "const",
];

pub(crate) fn compile_module(source: &str) -> Result<Module, Diagnostic> {
    let (precision, body_source) = split_pragma(source)?;
    let tokens = tokenize(&body_source).map_err(|e| Diagnostic {
        line: e.line,
        column: e.column,
        message: e.message,
    })?;

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        functions: Vec::new(),
        function_index: HashMap::new(),
        body: None,
        depth: 0,
    };
    parser.parse_items()?;

    let body = parser.body.ok_or_else(|| Diagnostic {
        line: tokens.last().map(|t| t.line).unwrap_or(1),
        column: 1,
        message: "missing 'kernel montage' block".to_string(),
    })?;

    Ok(Module {
        precision,
        functions: parser.functions,
        body,
    })
}

/// Precision named by the `#pragma precision` line of `source`.
pub(crate) fn declared_precision(source: &str) -> Option<Precision> {
    split_pragma(source).ok().map(|(precision, _)| precision)
}

/// Strip the precision pragma, keeping line numbers of the remaining text.
fn split_pragma(source: &str) -> Result<(Precision, String), Diagnostic> {
    let mut precision = None;
    let mut rest = Vec::new();

    for (number, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if precision.is_none() && trimmed.starts_with('#') {
            let mut words = trimmed.trim_start_matches('#').split_whitespace();
            let parsed = match (words.next(), words.next(), words.next()) {
                (Some("pragma"), Some("precision"), Some(name)) => Precision::from_type_name(name),
                _ => None,
            };
            precision = Some(parsed.ok_or_else(|| Diagnostic {
                line: number + 1,
                column: 1,
                message: format!("invalid precision pragma '{}'", trimmed),
            })?);
            rest.push(String::new());
        } else if precision.is_none() && !trimmed.is_empty() {
            return Err(Diagnostic {
                line: number + 1,
                column: 1,
                message: "kernel source must start with '#pragma precision'".to_string(),
            });
        } else {
            rest.push(line.to_string());
        }
    }

    let precision = precision.ok_or_else(|| Diagnostic {
        line: 1,
        column: 1,
        message: "kernel source must start with '#pragma precision'".to_string(),
    })?;
    Ok((precision, rest.join("\n")))
}

struct Scope {
    name: String,
    params: u16,
    locals: Vec<String>,
    in_body: bool,
    code: Vec<Op>,
}

impl Scope {
    fn slot(&self, name: &str) -> Option<u16> {
        self.locals.iter().position(|l| l == name).map(|i| i as u16)
    }

    fn declare(&mut self, name: &str) -> u16 {
        self.locals.push(name.to_string());
        (self.locals.len() - 1) as u16
    }

    fn finish(self) -> Function {
        Function {
            name: self.name,
            params: self.params,
            locals: self.locals.len() as u16,
            code: self.code,
        }
    }
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    functions: Vec<Function>,
    function_index: HashMap<String, u16>,
    body: Option<Function>,
    depth: usize,
}

impl<'t> Parser<'t> {
    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&'t Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, token: Option<&Token>, message: impl Into<String>) -> Diagnostic {
        let (line, column) = match token.or_else(|| self.tokens.last()) {
            Some(t) => (t.line, t.column),
            None => (1, 1),
        };
        Diagnostic {
            line,
            column,
            message: message.into(),
        }
    }

    fn error_here(&self, message: impl Into<String>) -> Diagnostic {
        self.error_at(self.peek(), message)
    }

    /// Run `parse` one nesting level deeper.
    fn nested(
        &mut self,
        scope: &mut Scope,
        parse: fn(&mut Self, &mut Scope) -> Result<(), Diagnostic>,
    ) -> Result<(), Diagnostic> {
        if self.depth >= MAX_NESTING {
            return Err(self.error_here("expression nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self, scope);
        self.depth -= 1;
        result
    }

    fn check_punct(&self, punct: &str) -> bool {
        self.peek().is_some_and(|t| t.is_punct(punct))
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.check_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), Diagnostic> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            let found = self.peek().map(|t| t.text()).unwrap_or_else(|| "end of input".to_string());
            Err(self.error_here(format!("expected '{}', found '{}'", punct, found)))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<&'t str, Diagnostic> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => {
                self.pos += 1;
                Ok(name.as_str())
            }
            other => Err(self.error_at(other, format!("expected {}", what))),
        }
    }

    fn skip_type(&mut self) -> bool {
        let mut skipped = false;
        while let Some(name) = self.peek().and_then(|t| t.ident()) {
            if TYPE_KEYWORDS.contains(&name) {
                self.pos += 1;
                skipped = true;
            } else {
                break;
            }
        }
        skipped
    }

    fn parse_items(&mut self) -> Result<(), Diagnostic> {
        while let Some(token) = self.peek() {
            if token.is_ident("kernel") {
                self.parse_kernel()?;
            } else {
                self.parse_function()?;
            }
        }
        Ok(())
    }

    fn parse_kernel(&mut self) -> Result<(), Diagnostic> {
        let start = self.advance();
        if self.body.is_some() {
            return Err(self.error_at(start, "duplicate kernel block"));
        }
        let name = self.expect_ident("kernel name")?;
        if name != "montage" {
            return Err(self.error_at(start, format!("unknown kernel '{}'", name)));
        }
        self.expect_punct("{")?;

        let mut scope = Scope {
            name: "montage".to_string(),
            params: 0,
            locals: Vec::new(),
            in_body: true,
            code: Vec::new(),
        };
        self.parse_block(&mut scope)?;
        self.body = Some(scope.finish());
        Ok(())
    }

    fn parse_function(&mut self) -> Result<(), Diagnostic> {
        if self.body.is_some() {
            return Err(self.error_here("helper functions must precede the kernel block"));
        }
        let start = self.peek();
        if !self.skip_type() {
            return Err(self.error_here("expected function definition"));
        }
        let name = self.expect_ident("function name")?;
        if RESERVED.contains(&name) || Builtin::lookup(name).is_some() {
            return Err(self.error_at(start, format!("'{}' is a reserved name", name)));
        }
        if self.function_index.contains_key(name) {
            return Err(self.error_at(start, format!("redefinition of function '{}'", name)));
        }

        let mut scope = Scope {
            name: name.to_string(),
            params: 0,
            locals: Vec::new(),
            in_body: false,
            code: Vec::new(),
        };

        self.expect_punct("(")?;
        if !self.eat_punct(")") {
            loop {
                self.skip_type();
                let param = self.expect_ident("parameter name")?;
                if RESERVED.contains(&param) || scope.slot(param).is_some() {
                    return Err(self.error_here(format!("invalid parameter name '{}'", param)));
                }
                scope.declare(param);
                scope.params += 1;
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }

        self.expect_punct("{")?;
        self.parse_block(&mut scope)?;

        let index = self.functions.len() as u16;
        self.function_index.insert(name.to_string(), index);
        self.functions.push(scope.finish());
        Ok(())
    }

    fn parse_block(&mut self, scope: &mut Scope) -> Result<(), Diagnostic> {
        loop {
            match self.peek() {
                None => return Err(self.error_here("expected '}' before end of input")),
                Some(t) if t.is_punct("}") => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(_) => self.parse_statement(scope)?,
            }
        }
    }

    fn parse_statement(&mut self, scope: &mut Scope) -> Result<(), Diagnostic> {
        if self.eat_punct(";") {
            return Ok(());
        }

        let start = self.peek();
        if start.is_some_and(|t| t.is_ident("return")) {
            if scope.in_body {
                return Err(self.error_here("'return' is not allowed in the kernel body"));
            }
            self.pos += 1;
            self.parse_expression(scope)?;
            scope.code.push(Op::Return);
            return self.expect_punct(";");
        }

        if self.skip_type() {
            let name = self.expect_ident("variable name")?;
            if RESERVED.contains(&name) || Builtin::lookup(name).is_some() {
                return Err(self.error_at(start, format!("'{}' is a reserved name", name)));
            }
            if scope.slot(name).is_some() {
                return Err(self.error_at(start, format!("redefinition of '{}'", name)));
            }
            self.expect_punct("=")?;
            self.parse_expression(scope)?;
            let slot = scope.declare(name);
            scope.code.push(Op::StoreLocal(slot));
            return self.expect_punct(";");
        }

        let name = self.expect_ident("statement")?;
        let operator = match self.peek() {
            Some(Token {
                kind: TokenKind::Punct(p),
                ..
            }) if matches!(*p, "=" | "+=" | "-=" | "*=" | "/=") => *p,
            other => return Err(self.error_at(other, "expected assignment")),
        };
        self.pos += 1;

        enum Target {
            Out,
            Local(u16),
        }

        let target = if name == "out" {
            if !scope.in_body {
                return Err(self.error_at(start, "'out' is only available in the kernel body"));
            }
            Target::Out
        } else if let Some(slot) = scope.slot(name) {
            Target::Local(slot)
        } else if operator == "=" && !RESERVED.contains(&name) && Builtin::lookup(name).is_none() {
            Target::Local(scope.declare(name))
        } else {
            return Err(self.error_at(start, format!("use of undeclared identifier '{}'", name)));
        };

        if operator != "=" {
            scope.code.push(match target {
                Target::Out => Op::LoadOut,
                Target::Local(slot) => Op::LoadLocal(slot),
            });
        }
        self.parse_expression(scope)?;
        match operator {
            "+=" => scope.code.push(Op::Add),
            "-=" => scope.code.push(Op::Sub),
            "*=" => scope.code.push(Op::Mul),
            "/=" => scope.code.push(Op::Div),
            _ => {}
        }
        scope.code.push(match target {
            Target::Out => Op::StoreOut,
            Target::Local(slot) => Op::StoreLocal(slot),
        });
        self.expect_punct(";")
    }

    fn parse_expression(&mut self, scope: &mut Scope) -> Result<(), Diagnostic> {
        self.nested(scope, Self::parse_conditional)
    }

    fn parse_conditional(&mut self, scope: &mut Scope) -> Result<(), Diagnostic> {
        self.parse_binary(scope, 0)?;
        if self.eat_punct("?") {
            self.parse_expression(scope)?;
            self.expect_punct(":")?;
            self.parse_expression(scope)?;
            scope.code.push(Op::Select);
        }
        Ok(())
    }

    fn binary_operator(&self) -> Option<(usize, Op)> {
        let token = self.peek()?;
        let op = match &token.kind {
            TokenKind::Punct(p) => match *p {
                "||" => (0, Op::Or),
                "&&" => (1, Op::And),
                "==" => (2, Op::Eq),
                "!=" => (2, Op::Ne),
                "<" => (3, Op::Lt),
                "<=" => (3, Op::Le),
                ">" => (3, Op::Gt),
                ">=" => (3, Op::Ge),
                "+" => (4, Op::Add),
                "-" => (4, Op::Sub),
                "*" => (5, Op::Mul),
                "/" => (5, Op::Div),
                "%" => (5, Op::Rem),
                _ => return None,
            },
            _ => return None,
        };
        Some(op)
    }

    /// Precedence climbing over the left-associative binary operators.
    fn parse_binary(&mut self, scope: &mut Scope, min_level: usize) -> Result<(), Diagnostic> {
        self.parse_unary(scope)?;
        while let Some((level, op)) = self.binary_operator() {
            if level < min_level {
                break;
            }
            self.pos += 1;
            self.parse_binary(scope, level + 1)?;
            scope.code.push(op);
        }
        Ok(())
    }

    fn parse_unary(&mut self, scope: &mut Scope) -> Result<(), Diagnostic> {
        self.nested(scope, Self::parse_prefixed)
    }

    fn parse_prefixed(&mut self, scope: &mut Scope) -> Result<(), Diagnostic> {
        if self.eat_punct("-") {
            self.parse_unary(scope)?;
            scope.code.push(Op::Neg);
            Ok(())
        } else if self.eat_punct("+") {
            self.parse_unary(scope)
        } else if self.eat_punct("!") {
            self.parse_unary(scope)?;
            scope.code.push(Op::Not);
            Ok(())
        } else {
            self.parse_primary(scope)
        }
    }

    fn parse_primary(&mut self, scope: &mut Scope) -> Result<(), Diagnostic> {
        let token = match self.advance() {
            Some(token) => token,
            None => return Err(self.error_here("expected expression before end of input")),
        };

        match &token.kind {
            TokenKind::Number(text) => {
                let value = text
                    .trim_end_matches('f')
                    .parse::<f64>()
                    .map_err(|_| self.error_at(Some(token), format!("invalid number '{}'", text)))?;
                scope.code.push(Op::Const(value));
                Ok(())
            }
            TokenKind::Str(label) => Err(self.error_at(
                Some(token),
                format!("unexpected string literal \"{}\"", label),
            )),
            TokenKind::Punct("(") => {
                self.parse_expression(scope)?;
                self.expect_punct(")")
            }
            TokenKind::Punct(p) => Err(self.error_at(Some(token), format!("unexpected '{}'", p))),
            TokenKind::Ident(name) => {
                if self.check_punct("(") {
                    self.pos += 1;
                    self.parse_call(scope, token, name)
                } else {
                    self.parse_identifier(scope, token, name)
                }
            }
        }
    }

    fn parse_identifier(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        name: &str,
    ) -> Result<(), Diagnostic> {
        let op = match name {
            "INDEX" => Op::Index,
            "M_PI" => Op::Const(std::f64::consts::PI),
            "M_E" => Op::Const(std::f64::consts::E),
            "out" if scope.in_body => Op::LoadOut,
            _ => match scope.slot(name) {
                Some(slot) => Op::LoadLocal(slot),
                None => {
                    return Err(self.error_at(
                        Some(token),
                        format!("use of undeclared identifier '{}'", name),
                    ))
                }
            },
        };
        scope.code.push(op);
        Ok(())
    }

    fn parse_call(&mut self, scope: &mut Scope, token: &Token, name: &str) -> Result<(), Diagnostic> {
        let mut argc = 0;
        if !self.eat_punct(")") {
            loop {
                self.parse_expression(scope)?;
                argc += 1;
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }

        let accessor = match name {
            "in" => Some(Accessor::In),
            "x" => Some(Accessor::X),
            "y" => Some(Accessor::Y),
            "z" => Some(Accessor::Z),
            _ => None,
        };

        let (op, arity) = if let Some(accessor) = accessor {
            (Op::Access(accessor), 1)
        } else if let Some(builtin) = Builtin::lookup(name) {
            (Op::Builtin(builtin), builtin.arity())
        } else if let Some(&index) = self.function_index.get(name) {
            (Op::Call(index), self.functions[index as usize].params as usize)
        } else {
            return Err(self.error_at(Some(token), format!("unknown function '{}'", name)));
        };

        if argc != arity {
            return Err(self.error_at(
                Some(token),
                format!("'{}' expects {} argument(s), {} given", name, arity, argc),
            ));
        }
        scope.code.push(op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(body: &str) -> String {
        format!("#pragma precision float\nkernel montage {{\n{}\n}}\n", body)
    }

    #[test]
    fn test_compiles_simple_body() {
        let module = compile_module(&kernel("out = in(0) - in(1);")).unwrap();
        assert_eq!(module.precision, Precision::Float);
        assert_eq!(
            module.body.code,
            vec![
                Op::Const(0.0),
                Op::Access(Accessor::In),
                Op::Const(1.0),
                Op::Access(Accessor::In),
                Op::Sub,
                Op::StoreOut,
            ]
        );
    }

    #[test]
    fn test_precedence_and_ternary() {
        let module = compile_module(&kernel("out = 1 + 2 * 3 > 6 ? 1 : 0;")).unwrap();
        let code = &module.body.code;
        assert_eq!(code[2], Op::Const(3.0));
        assert_eq!(code[3], Op::Mul);
        assert_eq!(code[4], Op::Add);
        assert_eq!(code[6], Op::Gt);
        assert_eq!(code.last(), Some(&Op::StoreOut));
        assert!(code.contains(&Op::Select));
    }

    #[test]
    fn test_helpers_and_locals() {
        let source = "#pragma precision double\n\
                      float mean2(float a, float b) { float s = a + b; return s / 2; }\n\
                      kernel montage { float m = mean2(in(0), in(1)); out = m; out *= 2.0f; }";
        let module = compile_module(source).unwrap();
        assert_eq!(module.precision, Precision::Double);
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.functions[0].params, 2);
        assert_eq!(module.functions[0].locals, 3);
        assert_eq!(module.body.locals, 1);
    }

    #[test]
    fn test_diagnostics_point_at_the_error() {
        let err = compile_module(&kernel("out = foo(1);")).unwrap_err();
        assert_eq!(err.line, 3);
        assert_eq!(err.column, 7);
        assert!(err.message.contains("unknown function 'foo'"));

        let err = compile_module(&kernel("out = in(\"Cz\");")).unwrap_err();
        assert!(err.message.contains("string literal"));

        let err = compile_module(&kernel("out = sin(1, 2);")).unwrap_err();
        assert!(err.message.contains("expects 1 argument"));

        let err = compile_module(&kernel("out = q;")).unwrap_err();
        assert!(err.message.contains("undeclared identifier 'q'"));
    }

    #[test]
    fn test_deep_nesting_is_a_diagnostic() {
        let depth = 2000;
        let parens = format!("out = {}1{};", "(".repeat(depth), ")".repeat(depth));
        let err = compile_module(&kernel(&parens)).unwrap_err();
        assert!(err.message.contains("nested too deeply"));

        let negations = format!("out = {}1;", "-".repeat(depth));
        assert!(compile_module(&kernel(&negations)).is_err());

        let ternaries = format!("out = {}0;", "1 ? 1 : ".repeat(depth));
        assert!(compile_module(&kernel(&ternaries)).is_err());

        let shallow = format!("out = {}in(0){};", "(".repeat(100), ")".repeat(100));
        assert!(compile_module(&kernel(&shallow)).is_ok());
    }

    #[test]
    fn test_pragma_and_kernel_block_are_required() {
        assert!(compile_module("kernel montage { out = 1; }").is_err());
        assert!(compile_module("#pragma precision half\nkernel montage {}").is_err());
        assert!(compile_module("#pragma precision float\n").is_err());
        assert!(compile_module(&kernel("")).is_ok());
    }

    #[test]
    fn test_return_only_in_helpers() {
        let err = compile_module(&kernel("return 1;")).unwrap_err();
        assert!(err.message.contains("'return'"));
    }
}
