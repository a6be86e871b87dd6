// File: src/parser.rs
//
// Top-down operator-precedence parser for the Alto language.
// A static rule table maps token spellings to prefix/infix handlers with
// binding powers, plus statement and declaration handlers for keywords.

use crate::ast::{
    Block, CatchClause, Expr, FunctionLit, NameRef, Param, Program, Span, Stmt, TableKey, UnaryOp,
    VarDecl,
};
use crate::errors::AltoError;
use crate::lexer::{Token, TokenKind};
use ahash::RandomState;
use once_cell::sync::Lazy;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// Binding powers, tighter binds higher
const P_POSTFIX: u8 = 90;
const P_UNARY: u8 = 80;
const P_FACTOR: u8 = 70;
const P_TERM: u8 = 65;
const P_COMPARE: u8 = 60;
const P_BIT_AND: u8 = 55;
const P_BIT_XOR: u8 = 50;
const P_BIT_OR: u8 = 45;
const P_EQUALITY: u8 = 40;
const P_AND: u8 = 35;
const P_OR: u8 = 30;
const P_TERNARY: u8 = 20;
const P_ASSIGN: u8 = 10;

type PrefixFn = fn(&mut Parser, Token, u8) -> Result<Expr, AltoError>;
type InfixFn = fn(&mut Parser, Expr, Token, u8) -> Result<Expr, AltoError>;
type StmtFn = fn(&mut Parser, Token) -> Result<Stmt, AltoError>;

/// Per-token parse rules: a prefix/primitive handler with its binding
/// power, an infix handler with left and right powers (right = left - 1
/// gives right associativity), and statement/declaration handlers
#[derive(Clone, Copy)]
struct Rule {
    prefix: Option<(u8, PrefixFn)>,
    infix: Option<(u8, u8, InfixFn)>,
    declaration: Option<StmtFn>,
    statement: Option<StmtFn>,
}

const EMPTY: Rule = Rule { prefix: None, infix: None, declaration: None, statement: None };

const WORD_RULE: Rule =
    Rule { prefix: Some((0, name_prefix)), infix: None, declaration: None, statement: None };
const NUMBER_RULE: Rule =
    Rule { prefix: Some((0, number_prefix)), infix: None, declaration: None, statement: None };
const STR_RULE: Rule =
    Rule { prefix: Some((0, string_prefix)), infix: None, declaration: None, statement: None };

fn infix_left(power: u8, handler: InfixFn) -> Rule {
    Rule { infix: Some((power, power, handler)), ..EMPTY }
}

fn infix_right(power: u8, handler: InfixFn) -> Rule {
    Rule { infix: Some((power, power - 1, handler)), ..EMPTY }
}

static RULES: Lazy<HashMap<&'static str, Rule, RandomState>> = Lazy::new(|| {
    let mut rules: HashMap<&'static str, Rule, RandomState> =
        HashMap::with_hasher(RandomState::new());

    // Literals and primitives
    rules.insert("null", Rule { prefix: Some((0, literal_prefix)), ..EMPTY });
    rules.insert("true", Rule { prefix: Some((0, literal_prefix)), ..EMPTY });
    rules.insert("false", Rule { prefix: Some((0, literal_prefix)), ..EMPTY });
    rules.insert("this", Rule { prefix: Some((0, literal_prefix)), ..EMPTY });
    rules.insert("function", Rule { prefix: Some((0, function_prefix)), ..EMPTY });
    rules.insert("throw", Rule { prefix: Some((0, throw_prefix)), ..EMPTY });

    // Grouping, calls, member access
    rules.insert(
        "(",
        Rule {
            prefix: Some((0, group_prefix)),
            infix: Some((P_POSTFIX, P_POSTFIX, call_infix)),
            ..EMPTY
        },
    );
    rules.insert(
        "[",
        Rule {
            prefix: Some((0, list_prefix)),
            infix: Some((P_POSTFIX, P_POSTFIX, index_infix)),
            ..EMPTY
        },
    );
    rules.insert(".", infix_left(P_POSTFIX, member_infix));
    rules.insert(
        "{",
        Rule { prefix: Some((0, table_prefix)), statement: Some(block_stmt), ..EMPTY },
    );

    // Arithmetic
    rules.insert(
        "+",
        Rule {
            prefix: Some((P_UNARY, unary_prefix)),
            infix: Some((P_TERM, P_TERM, binary_infix)),
            ..EMPTY
        },
    );
    rules.insert(
        "-",
        Rule {
            prefix: Some((P_UNARY, unary_prefix)),
            infix: Some((P_TERM, P_TERM, binary_infix)),
            ..EMPTY
        },
    );
    rules.insert("!", Rule { prefix: Some((P_UNARY, unary_prefix)), ..EMPTY });
    rules.insert("*", infix_left(P_FACTOR, binary_infix));
    rules.insert("/", infix_left(P_FACTOR, binary_infix));
    rules.insert("%", infix_left(P_FACTOR, binary_infix));

    // Comparison and logic
    rules.insert("<", infix_left(P_COMPARE, binary_infix));
    rules.insert("<=", infix_left(P_COMPARE, binary_infix));
    rules.insert(">", infix_left(P_COMPARE, binary_infix));
    rules.insert(">=", infix_left(P_COMPARE, binary_infix));
    rules.insert("&", infix_left(P_BIT_AND, binary_infix));
    rules.insert("^", infix_left(P_BIT_XOR, binary_infix));
    rules.insert("|", infix_left(P_BIT_OR, binary_infix));
    rules.insert("==", infix_left(P_EQUALITY, binary_infix));
    rules.insert("!=", infix_left(P_EQUALITY, binary_infix));
    rules.insert("&&", infix_left(P_AND, logical_infix));
    rules.insert("||", infix_left(P_OR, logical_infix));
    rules.insert("?", infix_right(P_TERNARY, ternary_infix));

    // Assignment, right associative
    for op in ["=", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^="] {
        rules.insert(op, infix_right(P_ASSIGN, assign_infix));
    }

    // Statements
    rules.insert("if", Rule { statement: Some(if_stmt), ..EMPTY });
    rules.insert("while", Rule { statement: Some(while_stmt), ..EMPTY });
    rules.insert("for", Rule { statement: Some(for_stmt), ..EMPTY });
    rules.insert("try", Rule { statement: Some(try_stmt), ..EMPTY });
    rules.insert("break", Rule { statement: Some(break_stmt), ..EMPTY });
    rules.insert("continue", Rule { statement: Some(continue_stmt), ..EMPTY });
    rules.insert("return", Rule { statement: Some(return_stmt), ..EMPTY });

    // Declarations
    rules.insert("var", Rule { declaration: Some(var_decl), ..EMPTY });
    rules.insert("const", Rule { declaration: Some(var_decl), ..EMPTY });
    rules.insert("import", Rule { declaration: Some(import_decl), ..EMPTY });
    rules.insert("export", Rule { declaration: Some(export_decl), ..EMPTY });

    // Reserved words recognized only inside their parent constructs
    rules.insert("else", EMPTY);
    rules.insert("catch", EMPTY);
    rules.insert("finally", EMPTY);
    rules.insert("from", EMPTY);

    rules
});

fn rule_of(token: &Token) -> Option<Rule> {
    match &token.kind {
        TokenKind::Word => RULES.get(token.text.as_str()).copied().or(Some(WORD_RULE)),
        TokenKind::Punct => RULES.get(token.text.as_str()).copied(),
        TokenKind::Number(_) => Some(NUMBER_RULE),
        TokenKind::Str(_) => Some(STR_RULE),
        TokenKind::End => None,
    }
}

fn span_of(token: &Token) -> Span {
    Span { row: token.row, column: token.column, line: Rc::clone(&token.line) }
}

fn describe(token: &Token) -> String {
    if token.is_end() {
        "end of input".to_string()
    } else {
        format!("'{}'", token.text)
    }
}

fn error_at(token: &Token, message: impl Into<String>) -> AltoError {
    AltoError::parse_error(message.into(), token.location()).with_source(token.line.to_string())
}

/// Parse a token stream into a module body
pub fn parse_program(tokens: Vec<Token>) -> Result<Program, AltoError> {
    let span = span_of(&tokens[0]);
    let mut parser = Parser { tokens, pos: 0, loop_depth: vec![0], module_scope: true };
    let mut body = Vec::new();
    while !parser.peek().is_end() {
        body.push(parser.declaration()?);
    }
    Ok(Program { body, span, scope: Cell::new(None) })
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Loop nesting per function; finally bodies push a fresh frame so
    /// break/continue cannot jump out of them
    loop_depth: Vec<usize>,
    module_scope: bool,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if !token.is_end() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, text: &str) -> bool {
        let token = self.peek();
        token.is_word(text) || token.is_punct(text)
    }

    /// Consume the token when it matches
    fn optional(&mut self, text: &str) -> bool {
        if self.check(text) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consume the token or fail with a descriptive error
    fn required(&mut self, text: &str) -> Result<Token, AltoError> {
        if self.check(text) {
            Ok(self.advance())
        } else {
            Err(error_at(
                self.peek(),
                format!("expected '{}' but found {}", text, describe(self.peek())),
            ))
        }
    }

    fn word(&mut self) -> Result<Token, AltoError> {
        if matches!(self.peek().kind, TokenKind::Word) {
            Ok(self.advance())
        } else {
            Err(error_at(self.peek(), format!("expected a name but found {}", describe(self.peek()))))
        }
    }

    /// Parse one expression with the given minimum binding power
    fn expression(&mut self, min_power: u8) -> Result<Expr, AltoError> {
        let token = self.advance();
        let Some((power, prefix)) = rule_of(&token).and_then(|r| r.prefix) else {
            return Err(error_at(&token, format!("unexpected {}", describe(&token))));
        };
        let mut left = prefix(self, token, power)?;

        loop {
            let Some((lbp, rbp, infix)) = rule_of(self.peek()).and_then(|r| r.infix) else {
                break;
            };
            if lbp <= min_power {
                break;
            }
            let token = self.advance();
            left = infix(self, left, token, rbp)?;
        }
        Ok(left)
    }

    fn declaration(&mut self) -> Result<Stmt, AltoError> {
        if let Some(handler) = rule_of(self.peek()).and_then(|r| r.declaration) {
            let token = self.advance();
            return handler(self, token);
        }
        self.statement()
    }

    fn statement(&mut self) -> Result<Stmt, AltoError> {
        if let Some(handler) = rule_of(self.peek()).and_then(|r| r.statement) {
            let token = self.advance();
            return handler(self, token);
        }
        let expr = self.expression(0)?;
        if !expr.is_statement_expr() {
            return Err(AltoError::parse_error(
                "only assignment, call, and throw expressions can stand alone".to_string(),
                expr.span().location(),
            )
            .with_source(expr.span().line.to_string()));
        }
        self.optional(";");
        Ok(Stmt::Expr(expr))
    }

    fn block(&mut self) -> Result<Block, AltoError> {
        let open = self.required("{")?;
        let saved = self.module_scope;
        self.module_scope = false;
        let mut body = Vec::new();
        while !self.check("}") && !self.peek().is_end() {
            body.push(self.declaration()?);
        }
        self.module_scope = saved;
        self.required("}")?;
        Ok(Block { body, span: span_of(&open), scope: Cell::new(None) })
    }

    /// Lookahead from just past a consumed `(`: do the tokens form an
    /// arrow-function parameter list followed by `=>`?
    fn arrow_ahead(&self) -> bool {
        let at = |offset: usize| self.peek_at(offset);
        if at(0).is_some_and(|t| t.is_punct(")")) {
            return at(1).is_some_and(|t| t.is_punct("=>"));
        }
        let mut i = 0;
        loop {
            match at(i) {
                Some(t) if t.is_punct("...") => {
                    return at(i + 1).is_some_and(|t| matches!(t.kind, TokenKind::Word))
                        && at(i + 2).is_some_and(|t| t.is_punct(")"))
                        && at(i + 3).is_some_and(|t| t.is_punct("=>"));
                }
                Some(t) if matches!(t.kind, TokenKind::Word) => i += 1,
                _ => return false,
            }
            match at(i) {
                Some(t) if t.is_punct(",") => i += 1,
                Some(t) if t.is_punct(")") => {
                    return at(i + 1).is_some_and(|t| t.is_punct("=>"));
                }
                _ => return false,
            }
        }
    }

    /// Parse a parameter list; assumes the opening `(` is consumed
    fn parse_params(&mut self) -> Result<Vec<Param>, AltoError> {
        let mut params = Vec::new();
        if self.optional(")") {
            return Ok(params);
        }
        loop {
            let rest = self.optional("...");
            let name = self.word()?;
            params.push(Param {
                name: name.text.clone(),
                rest,
                span: span_of(&name),
                slot: Cell::new(None),
            });
            if rest {
                if self.check(",") {
                    return Err(error_at(self.peek(), "a rest parameter must be last"));
                }
                self.required(")")?;
                return Ok(params);
            }
            if self.optional(",") {
                continue;
            }
            self.required(")")?;
            return Ok(params);
        }
    }

    /// Parse a braced function body with a fresh loop-nesting context
    fn function_body(&mut self) -> Result<Vec<Stmt>, AltoError> {
        self.loop_depth.push(0);
        let saved = self.module_scope;
        self.module_scope = false;
        self.required("{")?;
        let mut body = Vec::new();
        while !self.check("}") && !self.peek().is_end() {
            body.push(self.declaration()?);
        }
        self.required("}")?;
        self.module_scope = saved;
        self.loop_depth.pop();
        Ok(body)
    }

    /// Arrow body: either a braced body or a single expression that
    /// becomes the return value
    fn arrow_body(&mut self, params: Vec<Param>, span: Span) -> Result<Expr, AltoError> {
        let body = if self.check("{") {
            self.function_body()?
        } else {
            self.loop_depth.push(0);
            let value = self.expression(0)?;
            self.loop_depth.pop();
            vec![Stmt::Return { value: Some(value), span: span.clone() }]
        };
        Ok(Expr::Function(Rc::new(FunctionLit {
            name_hint: RefCell::new(None),
            params,
            body,
            span,
            scope: Cell::new(None),
        })))
    }
}

// ----- prefix handlers -----

fn literal_prefix(_parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    let span = span_of(&token);
    Ok(match token.text.as_str() {
        "null" => Expr::Null(span),
        "true" => Expr::Boolean(true, span),
        "false" => Expr::Boolean(false, span),
        _ => Expr::This(span),
    })
}

fn number_prefix(_parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    let TokenKind::Number(value) = token.kind else { unreachable!() };
    Ok(Expr::Number(value, span_of(&token)))
}

fn string_prefix(_parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    let TokenKind::Str(ref value) = token.kind else { unreachable!() };
    Ok(Expr::Str(value.clone(), span_of(&token)))
}

fn name_prefix(parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    let span = span_of(&token);
    // A lone `name =>` starts an arrow function
    if parser.check("=>") {
        parser.advance();
        let param =
            Param { name: token.text.clone(), rest: false, span: span.clone(), slot: Cell::new(None) };
        return parser.arrow_body(vec![param], span);
    }
    Ok(Expr::Name(NameRef::new(token.text.clone(), span)))
}

fn group_prefix(parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    if parser.arrow_ahead() {
        let params = parser.parse_params()?;
        parser.required("=>")?;
        return parser.arrow_body(params, span_of(&token));
    }
    let expr = parser.expression(0)?;
    parser.required(")")?;
    Ok(expr)
}

fn list_prefix(parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    let span = span_of(&token);
    let mut items = Vec::new();
    loop {
        if parser.optional("]") {
            break;
        }
        items.push(parser.expression(0)?);
        if !parser.optional(",") {
            parser.required("]")?;
            break;
        }
    }
    Ok(Expr::List { items, span })
}

fn table_prefix(parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    let span = span_of(&token);
    let mut entries = Vec::new();
    loop {
        if parser.optional("}") {
            break;
        }
        let key = if parser.optional("[") {
            let key = parser.expression(0)?;
            parser.required("]")?;
            TableKey::Computed(key)
        } else if matches!(parser.peek().kind, TokenKind::Word) {
            TableKey::Word(parser.advance().text)
        } else {
            return Err(error_at(parser.peek(), "expected a table key"));
        };
        parser.required(":")?;
        entries.push((key, parser.expression(0)?));
        if !parser.optional(",") {
            parser.required("}")?;
            break;
        }
    }
    Ok(Expr::Table { entries, span })
}

fn function_prefix(parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    parser.required("(")?;
    let params = parser.parse_params()?;
    let body = parser.function_body()?;
    Ok(Expr::Function(Rc::new(FunctionLit {
        name_hint: RefCell::new(None),
        params,
        body,
        span: span_of(&token),
        scope: Cell::new(None),
    })))
}

fn unary_prefix(parser: &mut Parser, token: Token, power: u8) -> Result<Expr, AltoError> {
    let op = match token.text.as_str() {
        "+" => UnaryOp::Plus,
        "-" => UnaryOp::Negate,
        _ => UnaryOp::Not,
    };
    let operand = parser.expression(power)?;
    Ok(Expr::Unary { op, operand: Box::new(operand), span: span_of(&token) })
}

fn throw_prefix(parser: &mut Parser, token: Token, _power: u8) -> Result<Expr, AltoError> {
    let value = parser.expression(0)?;
    Ok(Expr::Throw { value: Box::new(value), span: span_of(&token) })
}

// ----- infix handlers -----

fn binary_op_of(text: &str) -> crate::ast::BinaryOp {
    use crate::ast::BinaryOp::*;
    match text {
        "+" | "+=" => Add,
        "-" | "-=" => Subtract,
        "*" | "*=" => Multiply,
        "/" | "/=" => Divide,
        "%" | "%=" => Remainder,
        "&" | "&=" => And,
        "|" | "|=" => Or,
        "^" | "^=" => Xor,
        "==" => Equal,
        "!=" => NotEqual,
        "<" => Less,
        "<=" => LessOrEqual,
        ">" => Greater,
        _ => GreaterOrEqual,
    }
}

fn binary_infix(parser: &mut Parser, left: Expr, token: Token, rbp: u8) -> Result<Expr, AltoError> {
    let right = parser.expression(rbp)?;
    Ok(Expr::Binary {
        op: binary_op_of(&token.text),
        left: Box::new(left),
        right: Box::new(right),
        span: span_of(&token),
    })
}

fn logical_infix(parser: &mut Parser, left: Expr, token: Token, rbp: u8) -> Result<Expr, AltoError> {
    let right = parser.expression(rbp)?;
    Ok(Expr::Logical {
        and: token.text == "&&",
        left: Box::new(left),
        right: Box::new(right),
        span: span_of(&token),
    })
}

fn ternary_infix(parser: &mut Parser, left: Expr, token: Token, rbp: u8) -> Result<Expr, AltoError> {
    let then = parser.expression(0)?;
    parser.required(":")?;
    let otherwise = parser.expression(rbp)?;
    Ok(Expr::Conditional {
        condition: Box::new(left),
        then: Box::new(then),
        otherwise: Box::new(otherwise),
        span: span_of(&token),
    })
}

fn assign_infix(parser: &mut Parser, left: Expr, token: Token, rbp: u8) -> Result<Expr, AltoError> {
    if !matches!(left, Expr::Name(_) | Expr::Member { .. }) {
        return Err(error_at(&token, "invalid assignment target"));
    }
    let op = match token.text.as_str() {
        "=" => None,
        other => Some(binary_op_of(other)),
    };
    let mut value = parser.expression(rbp)?;
    if let (Expr::Name(name), Expr::Function(lit)) = (&left, &mut value) {
        let mut hint = lit.name_hint.borrow_mut();
        if hint.is_none() {
            *hint = Some(name.name.clone());
        }
    }
    Ok(Expr::Assign {
        target: Box::new(left),
        op,
        value: Box::new(value),
        span: span_of(&token),
    })
}

fn call_infix(parser: &mut Parser, left: Expr, token: Token, _rbp: u8) -> Result<Expr, AltoError> {
    let mut args = Vec::new();
    loop {
        if parser.optional(")") {
            break;
        }
        args.push(parser.expression(0)?);
        if !parser.optional(",") {
            parser.required(")")?;
            break;
        }
    }
    Ok(Expr::Call { callee: Box::new(left), args, span: span_of(&token) })
}

fn index_infix(parser: &mut Parser, left: Expr, token: Token, _rbp: u8) -> Result<Expr, AltoError> {
    let key = parser.expression(0)?;
    parser.required("]")?;
    Ok(Expr::Member { object: Box::new(left), key: Box::new(key), span: span_of(&token) })
}

fn member_infix(parser: &mut Parser, left: Expr, token: Token, _rbp: u8) -> Result<Expr, AltoError> {
    let name = parser.word()?;
    let key = Expr::Str(name.text.clone(), span_of(&name));
    Ok(Expr::Member { object: Box::new(left), key: Box::new(key), span: span_of(&token) })
}

// ----- statement handlers -----

fn block_stmt(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    let saved = parser.module_scope;
    parser.module_scope = false;
    let mut body = Vec::new();
    while !parser.check("}") && !parser.peek().is_end() {
        body.push(parser.declaration()?);
    }
    parser.required("}")?;
    parser.module_scope = saved;
    Ok(Stmt::Block(Block { body, span: span_of(&token), scope: Cell::new(None) }))
}

fn if_stmt(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    parser.required("(")?;
    let condition = parser.expression(0)?;
    parser.required(")")?;
    let then = parser.block()?;
    let otherwise = if parser.optional("else") {
        if parser.check("if") {
            let token = parser.advance();
            Some(Box::new(if_stmt(parser, token)?))
        } else {
            Some(Box::new(Stmt::Block(parser.block()?)))
        }
    } else {
        None
    };
    Ok(Stmt::If { condition, then, otherwise, span: span_of(&token) })
}

fn while_stmt(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    parser.required("(")?;
    let condition = parser.expression(0)?;
    parser.required(")")?;
    *parser.loop_depth.last_mut().expect("loop depth tracks the current function") += 1;
    let body = parser.block()?;
    *parser.loop_depth.last_mut().expect("loop depth tracks the current function") -= 1;
    Ok(Stmt::While { condition, body, span: span_of(&token) })
}

fn for_stmt(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    parser.required("(")?;

    let init = if parser.check(";") {
        None
    } else if parser.check("var") || parser.check("const") {
        let token = parser.advance();
        Some(Box::new(var_decl_inner(parser, token, false)?))
    } else {
        let expr = parser.expression(0)?;
        if !expr.is_statement_expr() {
            return Err(AltoError::parse_error(
                "a loop initializer must be a declaration, assignment, or call".to_string(),
                expr.span().location(),
            )
            .with_source(expr.span().line.to_string()));
        }
        Some(Box::new(Stmt::Expr(expr)))
    };
    parser.required(";")?;

    let condition = if parser.check(";") { None } else { Some(parser.expression(0)?) };
    parser.required(";")?;

    let next = if parser.check(")") {
        None
    } else {
        let expr = parser.expression(0)?;
        if !expr.is_statement_expr() {
            return Err(AltoError::parse_error(
                "a loop update must be an assignment or call".to_string(),
                expr.span().location(),
            )
            .with_source(expr.span().line.to_string()));
        }
        Some(expr)
    };
    parser.required(")")?;

    *parser.loop_depth.last_mut().expect("loop depth tracks the current function") += 1;
    let body = parser.block()?;
    *parser.loop_depth.last_mut().expect("loop depth tracks the current function") -= 1;

    Ok(Stmt::For { init, condition, next, body, span: span_of(&token), scope: Cell::new(None) })
}

fn try_stmt(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    let body = parser.block()?;

    let catch = if parser.optional("catch") {
        let binding = if parser.optional("(") {
            let name = parser.word()?;
            parser.required(")")?;
            Some(NameRef::new(name.text.clone(), span_of(&name)))
        } else {
            None
        };
        Some(CatchClause { binding, body: parser.block()? })
    } else {
        None
    };

    let finally = if parser.optional("finally") {
        // A finally body cannot continue or break loops outside itself
        parser.loop_depth.push(0);
        let block = parser.block()?;
        parser.loop_depth.pop();
        Some(block)
    } else {
        None
    };

    if catch.is_none() && finally.is_none() {
        return Err(error_at(&token, "try requires a catch or finally clause"));
    }
    Ok(Stmt::Try { body, catch, finally, span: span_of(&token) })
}

fn break_stmt(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    if *parser.loop_depth.last().expect("loop depth tracks the current function") == 0 {
        return Err(error_at(&token, "break outside of a loop"));
    }
    parser.optional(";");
    Ok(Stmt::Break(span_of(&token)))
}

fn continue_stmt(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    if *parser.loop_depth.last().expect("loop depth tracks the current function") == 0 {
        return Err(error_at(&token, "continue outside of a loop"));
    }
    parser.optional(";");
    Ok(Stmt::Continue(span_of(&token)))
}

fn return_stmt(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    let next = parser.peek();
    let value = if next.is_end() || parser.check("}") || parser.check(";") || next.row > token.row
    {
        None
    } else {
        Some(parser.expression(0)?)
    };
    parser.optional(";");
    Ok(Stmt::Return { value, span: span_of(&token) })
}

// ----- declaration handlers -----

fn var_decl(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    var_decl_inner(parser, token, true)
}

fn var_decl_inner(
    parser: &mut Parser,
    token: Token,
    eat_semicolon: bool,
) -> Result<Stmt, AltoError> {
    let read_only = token.text == "const";
    let name = parser.word()?;

    let init = if read_only {
        parser.required("=")?;
        Some(parser.expression(0)?)
    } else if parser.optional("=") {
        Some(parser.expression(0)?)
    } else {
        None
    };

    let mut init = init;
    if let Some(Expr::Function(lit)) = &mut init {
        let mut hint = lit.name_hint.borrow_mut();
        if hint.is_none() {
            *hint = Some(name.text.clone());
        }
    }

    if eat_semicolon {
        parser.optional(";");
    }
    Ok(Stmt::Var(VarDecl {
        name: name.text.clone(),
        init,
        read_only,
        span: span_of(&name),
        slot: Cell::new(None),
    }))
}

fn import_decl(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    if !parser.module_scope {
        return Err(error_at(&token, "import is only allowed at module scope"));
    }
    let name = parser.word()?;
    parser.required("from")?;
    let path = parser.advance();
    let TokenKind::Str(ref path_text) = path.kind else {
        return Err(error_at(&path, "expected a module path string"));
    };
    let path_text = path_text.clone();
    parser.optional(";");
    Ok(Stmt::Import {
        name: name.text.clone(),
        path: path_text,
        span: span_of(&name),
        slot: Cell::new(None),
    })
}

fn export_decl(parser: &mut Parser, token: Token) -> Result<Stmt, AltoError> {
    if !parser.module_scope {
        return Err(error_at(&token, "export is only allowed at module scope"));
    }
    parser.required("const")?;
    let name = parser.word()?;
    parser.required("=")?;
    let mut value = parser.expression(0)?;
    if let Expr::Function(lit) = &mut value {
        let mut hint = lit.name_hint.borrow_mut();
        if hint.is_none() {
            *hint = Some(name.text.clone());
        }
    }
    parser.optional(";");
    Ok(Stmt::Export { name: name.text.clone(), value, span: span_of(&name), slot: Cell::new(None) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse(source: &str) -> Program {
        parse_program(tokenize(source).unwrap()).unwrap_or_else(|e| panic!("parse error:\n{}", e))
    }

    fn parse_err(source: &str) -> AltoError {
        match parse_program(tokenize(source).unwrap()) {
            Err(e) => e,
            Ok(_) => panic!("expected a parse error for {:?}", source),
        }
    }

    fn init_of(stmt: &Stmt) -> &Expr {
        match stmt {
            Stmt::Var(decl) => decl.init.as_ref().expect("declaration has an initializer"),
            other => panic!("expected a declaration, got {:?}", other),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let program = parse("var x = 1 + 2 * 3");
        match init_of(&program.body[0]) {
            Expr::Binary { op: crate::ast::BinaryOp::Add, right, .. } => {
                assert!(matches!(
                    right.as_ref(),
                    Expr::Binary { op: crate::ast::BinaryOp::Multiply, .. }
                ));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn assignment_is_right_associative() {
        let program = parse("var a = 1\nvar b = 2\na = b = 3");
        match &program.body[2] {
            Stmt::Expr(Expr::Assign { value, .. }) => {
                assert!(matches!(value.as_ref(), Expr::Assign { .. }));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn ternary_nests_to_the_right() {
        let program = parse("var x = 1 ? 2 : 3 ? 4 : 5");
        match init_of(&program.body[0]) {
            Expr::Conditional { otherwise, .. } => {
                assert!(matches!(otherwise.as_ref(), Expr::Conditional { .. }));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn parenthesized_parameter_lists_parse_as_arrows() {
        let program = parse("var f = (a, b) => a");
        match init_of(&program.body[0]) {
            Expr::Function(lit) => assert_eq!(lit.params.len(), 2),
            other => panic!("expected an arrow, got {:?}", other),
        }

        let program = parse("var a = 1\nvar g = (a)");
        assert!(matches!(init_of(&program.body[1]), Expr::Name(_)));
    }

    #[test]
    fn a_lone_name_before_arrow_is_a_parameter() {
        let program = parse("var f = x => x");
        match init_of(&program.body[0]) {
            Expr::Function(lit) => {
                assert_eq!(lit.params.len(), 1);
                assert_eq!(lit.params[0].name, "x");
                assert!(matches!(lit.body[0], Stmt::Return { .. }));
            }
            other => panic!("expected an arrow, got {:?}", other),
        }
    }

    #[test]
    fn rest_parameters_must_come_last() {
        let program = parse("var f = (...xs) => xs");
        match init_of(&program.body[0]) {
            Expr::Function(lit) => assert!(lit.params[0].rest),
            other => panic!("expected an arrow, got {:?}", other),
        }
        parse_err("var f = function(...xs, y) { }");
    }

    #[test]
    fn throw_parses_as_an_expression() {
        let program = parse("var m = 1 || throw 2");
        match init_of(&program.body[0]) {
            Expr::Logical { and: false, right, .. } => {
                assert!(matches!(right.as_ref(), Expr::Throw { .. }));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn else_if_chains_nest() {
        let program = parse("var a = 1\nif (a) { } else if (a) { } else { }");
        match &program.body[1] {
            Stmt::If { otherwise: Some(nested), .. } => {
                assert!(matches!(nested.as_ref(), Stmt::If { .. }));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn member_access_chains_left() {
        let program = parse("var t = {}\nvar x = t.a[0]");
        match init_of(&program.body[1]) {
            Expr::Member { object, .. } => {
                assert!(matches!(object.as_ref(), Expr::Member { .. }));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn bare_value_expressions_cannot_stand_alone() {
        let err = parse_err("1 + 2");
        assert!(err.message.contains("assignment, call, and throw"));
    }

    #[test]
    fn try_requires_catch_or_finally() {
        parse_err("try { }");
    }

    #[test]
    fn table_keys_are_words_or_computed() {
        let program = parse("var t = {a: 1, ['b']: 2}");
        match init_of(&program.body[0]) {
            Expr::Table { entries, .. } => {
                assert!(matches!(entries[0].0, TableKey::Word(_)));
                assert!(matches!(entries[1].0, TableKey::Computed(_)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn return_values_do_not_span_lines() {
        let program = parse("var f = function() {\n return\n }\nvar g = function() { return 1 }");
        let check = |stmt: &Stmt, expects_value: bool| match stmt {
            Stmt::Var(decl) => match decl.init.as_ref().unwrap() {
                Expr::Function(lit) => match &lit.body[0] {
                    Stmt::Return { value, .. } => assert_eq!(value.is_some(), expects_value),
                    other => panic!("expected a return, got {:?}", other),
                },
                other => panic!("expected a function, got {:?}", other),
            },
            other => panic!("expected a declaration, got {:?}", other),
        };
        check(&program.body[0], false);
        check(&program.body[1], true);
    }
}
