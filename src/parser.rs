//! The MCL front end: a hand-written lexer and recursive-descent parser
//! producing the AST the code generator consumes. Deliberately thin: no
//! recovery, no symbol resolution (the generator does that), just syntax
//! with line/column error positions.
//!
//! Functions are declared `function [type] name(params) { … }`; the return
//! type and parameter types default to `int` when omitted, which is what the
//! classic toy programs use.

use crate::ast::{BinOp, Expr, Function, LValue, Program, Stmt, Type, UnOp};
use crate::error::CompileError;
use crate::fields::encode_char;

pub fn parse(source: &str) -> Result<Program, CompileError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, at: 0 };
    let mut functions = Vec::new();
    while !parser.done() {
        functions.push(parser.function()?);
    }
    Ok(Program { functions })
}

// ── Lexer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Number(u16),
    CharLit(u8),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: u32,
    column: u32,
}

const PUNCTS: [&str; 30] = [
    "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "(", ")", "{", "}", "[", "]", ",", ";", ":",
    "=", "+", "-", "*", "/", "%", "&", "|", "^", "~", "!", "<", ">",
];

fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    let mut line = 1u32;
    let mut column = 1u32;
    while let Some((at, c)) = chars.next() {
        let (tline, tcolumn) = (line, column);
        let mut advance = |c: char, line: &mut u32, column: &mut u32| {
            if c == '\n' {
                *line += 1;
                *column = 1;
            } else {
                *column += 1;
            }
        };
        advance(c, &mut line, &mut column);
        if c.is_whitespace() {
            continue;
        }
        // Comments.
        if c == '/' && matches!(chars.peek(), Some((_, '/'))) {
            for (_, c) in chars.by_ref() {
                advance(c, &mut line, &mut column);
                if c == '\n' {
                    break;
                }
            }
            continue;
        }
        if c == '/' && matches!(chars.peek(), Some((_, '*'))) {
            chars.next();
            column += 1;
            let mut last = ' ';
            loop {
                match chars.next() {
                    Some((_, c)) => {
                        advance(c, &mut line, &mut column);
                        if last == '*' && c == '/' {
                            break;
                        }
                        last = c;
                    }
                    None => {
                        return Err(parse_error(tline, tcolumn, "unterminated comment"));
                    }
                }
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = at + c.len_utf8();
            while let Some(&(i, c)) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    chars.next();
                    column += 1;
                    end = i + c.len_utf8();
                } else {
                    break;
                }
            }
            tokens.push(Token {
                tok: Tok::Ident(source[at..end].to_string()),
                line: tline,
                column: tcolumn,
            });
            continue;
        }
        if c.is_ascii_digit() {
            let mut end = at + 1;
            while let Some(&(i, c)) = chars.peek() {
                if c.is_ascii_alphanumeric() {
                    chars.next();
                    column += 1;
                    end = i + c.len_utf8();
                } else {
                    break;
                }
            }
            let text = &source[at..end];
            let parsed = if let Some(hex) = text.strip_prefix("0x") {
                u32::from_str_radix(hex, 16).ok()
            } else {
                text.parse::<u32>().ok()
            };
            let value = parsed
                .filter(|&v| v <= 0xffff)
                .ok_or_else(|| parse_error(tline, tcolumn, &format!("bad number `{}`", text)))?;
            tokens.push(Token {
                tok: Tok::Number(value as u16),
                line: tline,
                column: tcolumn,
            });
            continue;
        }
        if c == '\'' {
            let (_, lit) = chars
                .next()
                .ok_or_else(|| parse_error(tline, tcolumn, "unterminated character literal"))?;
            column += 1;
            match chars.next() {
                Some((_, '\'')) => column += 1,
                _ => return Err(parse_error(tline, tcolumn, "unterminated character literal")),
            }
            let code = encode_char(lit).ok_or_else(|| {
                parse_error(
                    tline,
                    tcolumn,
                    &format!("`{}` is not in the machine character set", lit),
                )
            })?;
            tokens.push(Token {
                tok: Tok::CharLit(code),
                line: tline,
                column: tcolumn,
            });
            continue;
        }
        if c == '@' {
            tokens.push(Token {
                tok: Tok::Punct("@"),
                line: tline,
                column: tcolumn,
            });
            continue;
        }
        // Two-character punctuation first, then single.
        let rest = &source[at..];
        let mut matched = None;
        for p in PUNCTS {
            if rest.starts_with(p) {
                matched = Some(p);
                break;
            }
        }
        match matched {
            Some(p) => {
                for _ in 1..p.len() {
                    chars.next();
                    column += 1;
                }
                tokens.push(Token {
                    tok: Tok::Punct(p),
                    line: tline,
                    column: tcolumn,
                });
            }
            None => {
                return Err(parse_error(
                    tline,
                    tcolumn,
                    &format!("unexpected character `{}`", c),
                ))
            }
        }
    }
    tokens.push(Token {
        tok: Tok::Eof,
        line,
        column,
    });
    Ok(tokens)
}

fn parse_error(line: u32, column: u32, message: &str) -> CompileError {
    CompileError::Parse {
        line,
        column,
        message: message.to_string(),
    }
}

// ── Parser ────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.at].tok
    }

    fn peek2(&self) -> &Tok {
        &self.tokens[(self.at + 1).min(self.tokens.len() - 1)].tok
    }

    fn here(&self) -> (u32, u32) {
        let t = &self.tokens[self.at];
        (t.line, t.column)
    }

    fn done(&self) -> bool {
        *self.peek() == Tok::Eof
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.at].tok.clone();
        if self.at + 1 < self.tokens.len() {
            self.at += 1;
        }
        tok
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Tok::Punct(q) if *q == p) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), CompileError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            let (line, column) = self.here();
            Err(parse_error(line, column, &format!("expected `{}`", p)))
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Tok::Ident(name) if name == kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, CompileError> {
        let (line, column) = self.here();
        match self.bump() {
            Tok::Ident(name) => Ok(name),
            _ => Err(parse_error(line, column, "expected a name")),
        }
    }

    /// `int`, `char`, `void`, with any number of `*` suffixes.
    fn try_type(&mut self) -> Option<Type> {
        let base = match self.peek() {
            Tok::Ident(name) if name == "int" => Type::Int,
            Tok::Ident(name) if name == "char" => Type::Char,
            Tok::Ident(name) if name == "void" => Type::Void,
            _ => return None,
        };
        self.bump();
        let mut ty = base;
        while self.eat_punct("*") {
            ty = Type::Ptr(Box::new(ty));
        }
        Some(ty)
    }

    fn function(&mut self) -> Result<Function, CompileError> {
        let (line, column) = self.here();
        if !self.eat_keyword("function") {
            return Err(parse_error(line, column, "expected `function`"));
        }
        let ret = self.try_type().unwrap_or(Type::Int);
        let name = self.expect_ident()?;
        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.eat_punct(")") {
            loop {
                let ty = self.try_type().unwrap_or(Type::Int);
                let pname = self.expect_ident()?;
                params.push((pname, ty));
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        let body = self.block()?;
        Ok(Function {
            name,
            params,
            ret,
            body,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect_punct("{")?;
        let mut stmts = Vec::new();
        while !self.eat_punct("}") {
            if self.done() {
                let (line, column) = self.here();
                return Err(parse_error(line, column, "expected `}`"));
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, CompileError> {
        if self.eat_keyword("if") {
            return self.if_statement();
        }
        if self.eat_keyword("while") {
            self.expect_punct("(")?;
            let cond = self.expression()?;
            self.expect_punct(")")?;
            let body = self.body_or_single()?;
            return Ok(Stmt::While { cond, body });
        }
        if self.eat_keyword("for") {
            return self.for_statement();
        }
        if self.eat_keyword("switch") {
            return self.switch_statement();
        }
        if self.eat_keyword("break") {
            self.expect_punct(";")?;
            return Ok(Stmt::Break);
        }
        if self.eat_keyword("continue") {
            self.expect_punct(";")?;
            return Ok(Stmt::Continue);
        }
        if self.eat_keyword("return") {
            if self.eat_punct(";") {
                return Ok(Stmt::Return(None));
            }
            let value = self.expression()?;
            self.expect_punct(";")?;
            return Ok(Stmt::Return(Some(value)));
        }
        let stmt = self.simple_statement()?;
        self.expect_punct(";")?;
        Ok(stmt)
    }

    /// A declaration, assignment or expression, the statement forms legal
    /// in a `for` header, without the trailing `;`.
    fn simple_statement(&mut self) -> Result<Stmt, CompileError> {
        if let Some(ty) = self.try_type() {
            let name = self.expect_ident()?;
            // `int a[10];`
            if self.eat_punct("[") {
                let (line, column) = self.here();
                let len = match self.bump() {
                    Tok::Number(n) => n,
                    _ => return Err(parse_error(line, column, "expected an array length")),
                };
                self.expect_punct("]")?;
                return Ok(Stmt::Declare {
                    name,
                    ty: Type::Array(Box::new(ty), len),
                    init: None,
                });
            }
            let init = if self.eat_punct("=") {
                Some(self.expression()?)
            } else {
                None
            };
            return Ok(Stmt::Declare { name, ty, init });
        }
        let expr = self.expression()?;
        if self.eat_punct("=") {
            let target = match expr_to_lvalue(expr) {
                Some(target) => target,
                None => {
                    let (line, column) = self.here();
                    return Err(parse_error(line, column, "left side cannot be assigned to"));
                }
            };
            let value = self.expression()?;
            return Ok(Stmt::Assign { target, value });
        }
        Ok(Stmt::Expr(expr))
    }

    fn if_statement(&mut self) -> Result<Stmt, CompileError> {
        self.expect_punct("(")?;
        let cond = self.expression()?;
        self.expect_punct(")")?;
        let then_body = self.body_or_single()?;
        let else_body = if self.eat_keyword("else") {
            if matches!(self.peek(), Tok::Ident(name) if name == "if") {
                self.bump();
                vec![self.if_statement()?]
            } else {
                self.body_or_single()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, CompileError> {
        self.expect_punct("(")?;
        let init = if self.eat_punct(";") {
            None
        } else {
            let stmt = self.simple_statement()?;
            self.expect_punct(";")?;
            Some(Box::new(stmt))
        };
        let cond = if self.eat_punct(";") {
            None
        } else {
            let cond = self.expression()?;
            self.expect_punct(";")?;
            Some(cond)
        };
        let step = if self.eat_punct(")") {
            None
        } else {
            let stmt = self.simple_statement()?;
            self.expect_punct(")")?;
            Some(Box::new(stmt))
        };
        let body = self.body_or_single()?;
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn switch_statement(&mut self) -> Result<Stmt, CompileError> {
        self.expect_punct("(")?;
        let selector = self.expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        let mut cases = Vec::new();
        let mut default = None;
        while !self.eat_punct("}") {
            if self.eat_keyword("case") {
                let label = self.expression()?;
                self.expect_punct(":")?;
                cases.push((label, self.case_body()?));
            } else if self.eat_keyword("default") {
                self.expect_punct(":")?;
                default = Some(self.case_body()?);
            } else {
                let (line, column) = self.here();
                return Err(parse_error(line, column, "expected `case` or `default`"));
            }
        }
        Ok(Stmt::Switch {
            selector,
            cases,
            default,
        })
    }

    fn case_body(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Tok::Punct("}") => break,
                Tok::Ident(name) if name == "case" || name == "default" => break,
                _ => stmts.push(self.statement()?),
            }
        }
        Ok(stmts)
    }

    fn body_or_single(&mut self) -> Result<Vec<Stmt>, CompileError> {
        if matches!(self.peek(), Tok::Punct("{")) {
            self.block()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    // ── Expressions, by descending precedence ─────────────────────────────

    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.logic_or()
    }

    fn binary_chain<F>(
        &mut self,
        ops: &[(&str, BinOp)],
        mut next: F,
    ) -> Result<Expr, CompileError>
    where
        F: FnMut(&mut Self) -> Result<Expr, CompileError>,
    {
        let mut lhs = next(self)?;
        'outer: loop {
            for (text, op) in ops {
                if matches!(self.peek(), Tok::Punct(p) if p == text) {
                    self.bump();
                    let rhs = next(self)?;
                    lhs = Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn logic_or(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[("||", BinOp::LogicOr)], Self::logic_and)
    }

    fn logic_and(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[("&&", BinOp::LogicAnd)], Self::bit_or)
    }

    fn bit_or(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[("|", BinOp::BitOr)], Self::bit_xor)
    }

    fn bit_xor(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[("^", BinOp::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[("&", BinOp::BitAnd)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[("==", BinOp::Eq), ("!=", BinOp::Ne)], Self::relational)
    }

    fn relational(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(
            &[
                ("<=", BinOp::Le),
                (">=", BinOp::Ge),
                ("<", BinOp::Lt),
                (">", BinOp::Gt),
            ],
            Self::shift,
        )
    }

    fn shift(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[("<<", BinOp::Shl), (">>", BinOp::Shr)], Self::additive)
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Mod)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        if self.eat_punct("-") {
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                operand: Box::new(self.unary()?),
            });
        }
        if self.eat_punct("~") {
            return Ok(Expr::Unary {
                op: UnOp::BitNot,
                operand: Box::new(self.unary()?),
            });
        }
        if self.eat_punct("!") {
            return Ok(Expr::Unary {
                op: UnOp::LogicNot,
                operand: Box::new(self.unary()?),
            });
        }
        if self.eat_punct("*") {
            return Ok(Expr::Deref(Box::new(self.unary()?)));
        }
        if self.eat_punct("@") {
            let name = self.expect_ident()?;
            return Ok(Expr::AddrOf(name));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let (line, column) = self.here();
        // Calls only apply to plain names.
        if let (Tok::Ident(_), Tok::Punct("(")) = (self.peek(), self.peek2()) {
            let name = self.expect_ident()?;
            self.expect_punct("(")?;
            let mut args = Vec::new();
            if !self.eat_punct(")") {
                loop {
                    args.push(self.expression()?);
                    if self.eat_punct(")") {
                        break;
                    }
                    self.expect_punct(",")?;
                }
            }
            return Ok(Expr::Call { name, args });
        }
        match self.bump() {
            Tok::Number(v) => Ok(Expr::IntLit(v)),
            Tok::CharLit(c) => Ok(Expr::CharLit(c)),
            Tok::Ident(name) => Ok(Expr::Var(name)),
            Tok::Punct("(") => {
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            _ => Err(parse_error(line, column, "expected an expression")),
        }
    }
}

fn expr_to_lvalue(expr: Expr) -> Option<LValue> {
    match expr {
        Expr::Var(name) => Some(LValue::Var(name)),
        Expr::Deref(inner) => Some(LValue::Deref(*inner)),
        Expr::Index { base, index } => Some(LValue::Index {
            base: *base,
            index: *index,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_factorial_program() {
        let program = parse(
            "function f(n){ if(n<=1) return 1; return n*f(n-1);} \
             function main(){ return f(5); }",
        )
        .unwrap();
        assert_eq!(program.functions.len(), 2);
        assert_eq!(program.functions[0].name, "f");
        assert_eq!(program.functions[0].params, vec![("n".into(), Type::Int)]);
        assert_eq!(program.functions[0].ret, Type::Int);
    }

    #[test]
    fn parses_types_pointers_and_arrays() {
        let program = parse(
            "function void demo(int* p, char c) {\n\
                 int a[4];\n\
                 a[0] = c;\n\
                 *p = a[0] + 1;\n\
                 int* q = @c;\n\
             }\n\
             function main() { return 0; }",
        )
        .unwrap();
        let demo = &program.functions[0];
        assert_eq!(demo.ret, Type::Void);
        assert_eq!(demo.params[0].1, Type::Ptr(Box::new(Type::Int)));
        assert!(matches!(
            demo.body[0],
            Stmt::Declare {
                ty: Type::Array(_, 4),
                ..
            }
        ));
        assert!(matches!(demo.body[2], Stmt::Assign { target: LValue::Deref(_), .. }));
    }

    #[test]
    fn precedence_follows_c() {
        let program = parse("function main(){ return 10 + 5*2 - 8/2; }").unwrap();
        match &program.functions[0].body[0] {
            Stmt::Return(Some(Expr::Binary { op: BinOp::Sub, .. })) => {}
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn char_literals_use_the_machine_table() {
        let program = parse("function main(){ return 'H'; }").unwrap();
        match &program.functions[0].body[0] {
            Stmt::Return(Some(Expr::CharLit(7))) => {}
            other => panic!("unexpected shape {:?}", other),
        }
        let err = parse("function main(){ return ' '; }").unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }));
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse("function main(){ return 1 + ; }").unwrap_err();
        match err {
            CompileError::Parse { line: 1, column, .. } => assert!(column > 1),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn switch_cases_and_loops_parse() {
        parse(
            "function main(){\n\
                 int total = 0;\n\
                 for (int i = 0; i < 10; i = i + 1) {\n\
                     switch (i % 3) {\n\
                         case 0: total = total + 1; break;\n\
                         case 1: continue;\n\
                         default: total = total + 2;\n\
                     }\n\
                 }\n\
                 while (total > 100) { total = total - 100; }\n\
                 return total;\n\
             }",
        )
        .unwrap();
    }
}
