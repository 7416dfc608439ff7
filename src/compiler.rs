//! Single-pass Pratt compiler from source text to heap closures. There
//! is no AST; parse functions emit bytecode directly into the chunk of
//! the function being compiled. Function compilations nest on an
//! explicit stack so inner functions can resolve upvalues through their
//! enclosing compilations.

use std::mem;

use crate::chunk::{Chunk, OpCode};
use crate::constants::MAX_PUSH_CONSTANT;
use crate::heap::ObjRef;
use crate::object::{Closure, ObjKind};
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::Value;
use crate::vm::Vm;

/// Sink for compile-time diagnostics. The compiler reports every error
/// it recovers from; the caller decides how to surface them.
pub trait ErrorReporter {
    fn report(&mut self, path: &str, line: usize, message: &str);
}

#[derive(Default)]
pub struct CollectingReporter {
    pub errors: Vec<String>,
}

impl ErrorReporter for CollectingReporter {
    fn report(&mut self, path: &str, line: usize, message: &str) {
        self.errors.push(format!("{}:{}: {}", path, line, message));
    }
}

/// Compiles a script. Returns the script closure, or None if any
/// compile error was reported.
pub fn compile(
    vm: &mut Vm,
    reporter: &mut dyn ErrorReporter,
    path: &str,
    source: &str,
) -> Option<ObjRef> {
    Compiler::new(vm, reporter, path, source).compile_script()
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
enum Precedence {
    None,
    Or,
    And,
    Assignment,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn one_higher(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Assignment,
            Precedence::Assignment => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler<'_, '_, '_>, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> Self {
        ParseRule { prefix, infix, precedence }
    }
}

const RULES: [ParseRule; TokenType::TokenEof as usize + 1] = {
    let mut rules =
        [ParseRule::new(None, None, Precedence::None); TokenType::TokenEof as usize + 1];
    rules[TokenType::TokenLeftParen as usize] =
        ParseRule::new(Some(|c, a| c.grouping(a)), Some(|c, a| c.call(a)), Precedence::Call);
    rules[TokenType::TokenDot as usize] =
        ParseRule::new(None, Some(|c, a| c.dot(a)), Precedence::Call);
    rules[TokenType::TokenMinus as usize] =
        ParseRule::new(Some(|c, a| c.unary(a)), Some(|c, a| c.binary(a)), Precedence::Term);
    rules[TokenType::TokenPlus as usize] =
        ParseRule::new(Some(|c, a| c.unary(a)), Some(|c, a| c.binary(a)), Precedence::Term);
    rules[TokenType::TokenSlash as usize] =
        ParseRule::new(None, Some(|c, a| c.binary(a)), Precedence::Factor);
    rules[TokenType::TokenStar as usize] =
        ParseRule::new(None, Some(|c, a| c.binary(a)), Precedence::Factor);
    rules[TokenType::TokenBang as usize] =
        ParseRule::new(Some(|c, a| c.unary(a)), None, Precedence::Unary);
    rules[TokenType::TokenBangEqual as usize] =
        ParseRule::new(None, Some(|c, a| c.binary(a)), Precedence::Equality);
    rules[TokenType::TokenEqual as usize] = ParseRule::new(None, None, Precedence::Assignment);
    rules[TokenType::TokenEqualEqual as usize] =
        ParseRule::new(None, Some(|c, a| c.binary(a)), Precedence::Equality);
    rules[TokenType::TokenGreater as usize] =
        ParseRule::new(None, Some(|c, a| c.binary(a)), Precedence::Comparison);
    rules[TokenType::TokenGreaterEqual as usize] =
        ParseRule::new(None, Some(|c, a| c.binary(a)), Precedence::Comparison);
    rules[TokenType::TokenLess as usize] =
        ParseRule::new(None, Some(|c, a| c.binary(a)), Precedence::Comparison);
    rules[TokenType::TokenLessEqual as usize] =
        ParseRule::new(None, Some(|c, a| c.binary(a)), Precedence::Comparison);
    rules[TokenType::TokenIdentifier as usize] =
        ParseRule::new(Some(|c, a| c.variable(a)), None, Precedence::Primary);
    rules[TokenType::TokenString as usize] =
        ParseRule::new(Some(|c, a| c.string(a)), None, Precedence::Primary);
    rules[TokenType::TokenNumber as usize] =
        ParseRule::new(Some(|c, a| c.number(a)), None, Precedence::Primary);
    rules[TokenType::TokenAnd as usize] =
        ParseRule::new(None, Some(|c, a| c.and(a)), Precedence::And);
    rules[TokenType::TokenOr as usize] =
        ParseRule::new(None, Some(|c, a| c.or(a)), Precedence::Or);
    rules[TokenType::TokenNil as usize] =
        ParseRule::new(Some(|c, a| c.literal(a)), None, Precedence::Primary);
    rules[TokenType::TokenTrue as usize] =
        ParseRule::new(Some(|c, a| c.literal(a)), None, Precedence::Primary);
    rules[TokenType::TokenFalse as usize] =
        ParseRule::new(Some(|c, a| c.literal(a)), None, Precedence::Primary);
    rules[TokenType::TokenThis as usize] =
        ParseRule::new(Some(|c, a| c.this(a)), None, Precedence::Primary);
    rules[TokenType::TokenSuper as usize] =
        ParseRule::new(Some(|c, a| c.super_(a)), None, Precedence::Primary);
    rules
};

fn rule_for(token_type: TokenType) -> &'static ParseRule {
    &RULES[token_type as usize]
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: usize,
    captured: bool,
}

/// One function compilation in flight. Slot zero of the locals mirrors
/// the runtime callee slot: the receiver for methods, unnameable
/// otherwise.
struct FunctionState<'src> {
    fn_type: FunctionType,
    name: ObjRef,
    arity: usize,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<(bool, u8)>,
    scope_depth: usize,
    loop_scope: Option<usize>,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

impl<'src> FunctionState<'src> {
    fn new(fn_type: FunctionType, name: ObjRef) -> Self {
        let slot_zero = match fn_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        FunctionState {
            fn_type,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot_zero, depth: 0, captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_scope: None,
            breaks: Vec::new(),
            continues: Vec::new(),
        }
    }
}

struct ClassState {
    has_super: bool,
}

pub struct Compiler<'src, 'vm, 'r> {
    vm: &'vm mut Vm,
    reporter: &'r mut dyn ErrorReporter,
    path: String,
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'vm, 'r> Compiler<'src, 'vm, 'r> {
    fn new(
        vm: &'vm mut Vm,
        reporter: &'r mut dyn ErrorReporter,
        path: &str,
        source: &'src str,
    ) -> Self {
        let placeholder = Token { token_type: TokenType::TokenEof, value: "", line: 0 };
        Compiler {
            vm,
            reporter,
            path: path.to_string(),
            scanner: Scanner::new(source),
            previous: placeholder,
            current: placeholder,
            had_error: false,
            panic_mode: false,
            functions: Vec::new(),
            classes: Vec::new(),
        }
    }

    fn compile_script(mut self) -> Option<ObjRef> {
        let name = self.vm.intern_string("<script>");
        self.functions.push(FunctionState::new(FunctionType::Script, name));
        self.advance();
        while !self.check(TokenType::TokenEof) {
            self.declaration();
        }
        let (script, _) = self.end_function();
        if self.had_error {
            None
        } else {
            Some(script)
        }
    }

    // Declarations.

    fn declaration(&mut self) {
        if self.match_token(TokenType::TokenVar) {
            self.var_declaration();
        } else if self.match_token(TokenType::TokenFun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::TokenClass) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let name = self.consume(TokenType::TokenIdentifier, "expected variable name");
        if self.match_token(TokenType::TokenEqual) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenType::TokenSemicolon, "expected ';' after variable declaration");
        self.define_variable(name);
    }

    fn fun_declaration(&mut self) {
        let name = self.consume(TokenType::TokenIdentifier, "expected function name");
        self.function(name, FunctionType::Function);
        self.define_variable(name);
    }

    /// Compiles a function body and emits the code that instantiates it:
    /// a constant push of the closure, then FillUpvalues when the
    /// function captures anything.
    fn function(&mut self, name: Token<'src>, fn_type: FunctionType) {
        let name_ref = self.vm.intern_string(name.value);
        self.functions.push(FunctionState::new(fn_type, name_ref));
        self.begin_scope();

        self.consume(TokenType::TokenLeftParen, "expected '(' after function name");
        if !self.check(TokenType::TokenRightParen) {
            loop {
                let param = self.consume(TokenType::TokenIdentifier, "expected parameter name");
                self.declare_local(param);
                self.func_mut().arity += 1;
                if !self.match_token(TokenType::TokenComma) {
                    break;
                }
            }
        }
        self.consume(TokenType::TokenRightParen, "expected ')' after function parameters");
        self.consume(TokenType::TokenLeftBrace, "expected '{' after function prototype");
        self.block();

        let (closure, upvalues) = self.end_function();
        self.emit_constant(Value::Obj(closure));
        if !upvalues.is_empty() {
            self.emit_op(OpCode::FillUpvalues);
            self.emit_byte(upvalues.len() as u8);
            for (is_local, index) in upvalues {
                self.emit_byte(is_local as u8);
                self.emit_byte(index);
            }
        }
    }

    fn class_declaration(&mut self) {
        self.classes.push(ClassState { has_super: false });

        let name = self.consume(TokenType::TokenIdentifier, "expected class name");
        let name_constant = self.identifier_constant(name.value);
        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name);

        if self.match_token(TokenType::TokenLess) {
            if let Some(class) = self.classes.last_mut() {
                class.has_super = true;
            }
            let super_name = self.consume(TokenType::TokenIdentifier, "expected superclass name");
            self.begin_scope();
            let depth = self.func().scope_depth;
            self.func_mut().locals.push(Local { name: "super", depth, captured: false });
            self.named_variable(super_name, false);
            self.named_variable(name, false);
            self.emit_op(OpCode::Inherit);
        }

        self.named_variable(name, false);
        self.consume(TokenType::TokenLeftBrace, "expected '{' after class name");
        while !self.check(TokenType::TokenRightBrace) && !self.check(TokenType::TokenEof) {
            self.method();
        }
        self.consume(TokenType::TokenRightBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop);

        let has_super = self.classes.last().map(|c| c.has_super).unwrap_or(false);
        if has_super {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        let name = self.consume(TokenType::TokenIdentifier, "expected method name");
        let fn_type = if name.value == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(name, fn_type);
        let name_constant = self.identifier_constant(name.value);
        self.emit_op(OpCode::Method);
        self.emit_byte(name_constant);
    }

    // Statements.

    fn statement(&mut self) {
        if self.match_token(TokenType::TokenPrint) {
            self.print_statement();
        } else if self.match_token(TokenType::TokenLeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenType::TokenIf) {
            self.if_statement();
        } else if self.match_token(TokenType::TokenWhile) {
            self.while_statement();
        } else if self.match_token(TokenType::TokenBreak) {
            self.loop_jump_statement(OpCode::Jump, true);
        } else if self.match_token(TokenType::TokenContinue) {
            self.loop_jump_statement(OpCode::Loop, false);
        } else if self.match_token(TokenType::TokenReturn) {
            self.return_statement();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Print);
        self.consume(TokenType::TokenSemicolon, "expected ';' after print statement");
    }

    fn block(&mut self) {
        while !self.check(TokenType::TokenRightBrace) && !self.check(TokenType::TokenEof) {
            self.declaration();
        }
        self.consume(TokenType::TokenRightBrace, "expected '}' after block statement");
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::TokenLeftParen, "expected '(' after if keyword");
        self.expression();
        self.consume(TokenType::TokenRightParen, "expected ')' after if condition");
        let else_enter = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.statement();
        let then_exit = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_enter);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenType::TokenElse) {
            self.statement();
        }
        self.patch_jump(then_exit);
    }

    fn while_statement(&mut self) {
        // Loop bookkeeping nests; the patch lists are per loop.
        let saved_scope = self.func().loop_scope;
        let saved_breaks = mem::take(&mut self.func_mut().breaks);
        let saved_continues = mem::take(&mut self.func_mut().continues);
        let depth = self.func().scope_depth;
        self.func_mut().loop_scope = Some(depth);

        self.consume(TokenType::TokenLeftParen, "expected '(' after while keyword");
        let condition_start = self.current_chunk().code_len();
        self.expression();
        self.consume(TokenType::TokenRightParen, "expected ')' after while condition");
        let exit = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(condition_start);

        self.patch_jump(exit);
        self.emit_op(OpCode::Pop);

        for index in mem::take(&mut self.func_mut().breaks) {
            self.patch_jump(index);
        }
        for index in mem::take(&mut self.func_mut().continues) {
            self.patch_loop_with(index, condition_start);
        }

        self.func_mut().loop_scope = saved_scope;
        self.func_mut().breaks = saved_breaks;
        self.func_mut().continues = saved_continues;
    }

    fn loop_jump_statement(&mut self, op: OpCode, is_break: bool) {
        let loop_scope = match self.func().loop_scope {
            Some(scope) => scope,
            None => {
                self.error("loop jump statement occurred outside of loop");
                return;
            }
        };

        // Pop the locals of scopes inside the loop without forgetting
        // them; the statement may sit on a path that never runs.
        let pops = self
            .func()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_scope)
            .count();
        for _ in 0..pops {
            self.emit_op(OpCode::Pop);
        }

        let jump = self.emit_jump(op);
        if is_break {
            self.func_mut().breaks.push(jump);
        } else {
            self.func_mut().continues.push(jump);
        }
        self.consume(TokenType::TokenSemicolon, "expected ';' after loop jump statement");
    }

    fn return_statement(&mut self) {
        if self.func().fn_type == FunctionType::Script {
            self.error("return is not allowed there");
        }

        if self.match_token(TokenType::TokenSemicolon) {
            self.emit_return();
        } else {
            if self.func().fn_type == FunctionType::Initializer {
                self.error("returning expressions is not allowed in initializers");
            }
            self.expression();
            self.consume(TokenType::TokenSemicolon, "expected ';' after return statement");
            self.emit_op(OpCode::Return);
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Pop);
        self.consume(TokenType::TokenSemicolon, "expected ';' after expression statement");
    }

    // Expressions.

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Or);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        let can_assign = precedence <= Precedence::Assignment;
        self.advance();

        match rule_for(self.previous.token_type).prefix {
            Some(prefix) => prefix(self, can_assign),
            None => {
                self.error("expected expression");
                return;
            }
        }

        while rule_for(self.current.token_type).precedence >= precedence {
            self.advance();
            match rule_for(self.previous.token_type).infix {
                Some(infix) => infix(self, can_assign),
                None => {
                    self.error("expected expression");
                    return;
                }
            }
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let false_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(false_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous;
        self.parse_precedence(rule_for(op.token_type).precedence.one_higher());

        match op.token_type {
            TokenType::TokenPlus => self.emit_op_at(OpCode::Add, op.line),
            TokenType::TokenMinus => self.emit_op_at(OpCode::Subtract, op.line),
            TokenType::TokenStar => self.emit_op_at(OpCode::Multiply, op.line),
            TokenType::TokenSlash => self.emit_op_at(OpCode::Divide, op.line),
            TokenType::TokenEqualEqual => self.emit_op_at(OpCode::Equal, op.line),
            TokenType::TokenGreater => self.emit_op_at(OpCode::Greater, op.line),
            TokenType::TokenLess => self.emit_op_at(OpCode::Less, op.line),
            TokenType::TokenBangEqual => {
                self.emit_op_at(OpCode::Equal, op.line);
                self.emit_op_at(OpCode::Not, op.line);
            }
            TokenType::TokenGreaterEqual => {
                self.emit_op_at(OpCode::Less, op.line);
                self.emit_op_at(OpCode::Not, op.line);
            }
            TokenType::TokenLessEqual => {
                self.emit_op_at(OpCode::Greater, op.line);
                self.emit_op_at(OpCode::Not, op.line);
            }
            _ => self.error("expected binary operator"),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous;
        self.parse_precedence(Precedence::Unary);
        match op.token_type {
            TokenType::TokenPlus => {}
            TokenType::TokenMinus => self.emit_op_at(OpCode::Negate, op.line),
            TokenType::TokenBang => self.emit_op_at(OpCode::Not, op.line),
            _ => self.error("expected unary operator"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::TokenRightParen, "expected ')'");
    }

    fn call(&mut self, _can_assign: bool) {
        let count = self.arguments_list();
        self.consume(TokenType::TokenRightParen, "expected ')' after arguments list");
        self.emit_op(OpCode::Call);
        self.emit_byte(count);
    }

    fn arguments_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenType::TokenRightParen) {
            loop {
                self.expression();
                count += 1;
                if !self.match_token(TokenType::TokenComma) {
                    break;
                }
            }
        }
        if count > u8::MAX as usize {
            self.error("too many arguments");
        }
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        let name = self.consume(TokenType::TokenIdentifier, "expected property name");
        let name_constant = self.identifier_constant(name.value);

        if can_assign && self.match_token(TokenType::TokenEqual) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
        } else if self.match_token(TokenType::TokenLeftParen) {
            let count = self.arguments_list();
            self.consume(TokenType::TokenRightParen, "expected ')' after arguments list");
            self.emit_op(OpCode::Invoke);
            self.emit_byte(count);
        } else {
            self.emit_op(OpCode::GetProperty);
        }
        self.emit_byte(name_constant);
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        let token = self.synthetic_token("this");
        self.named_variable(token, false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("super is not allowed outside of class");
        } else if !self.classes.last().map(|c| c.has_super).unwrap_or(false) {
            self.error("current class does not have a superclass");
        }

        self.consume(TokenType::TokenDot, "expected '.' after super");
        let name = self.consume(TokenType::TokenIdentifier, "expected method name after super");
        let name_constant = self.identifier_constant(name.value);

        let this_token = self.synthetic_token("this");
        self.named_variable(this_token, false);

        let super_token = self.synthetic_token("super");
        if self.match_token(TokenType::TokenLeftParen) {
            let count = self.arguments_list();
            self.consume(TokenType::TokenRightParen, "expected ')' after arguments list");
            self.named_variable(super_token, false);
            self.emit_op(OpCode::InvokeSuper);
            self.emit_byte(count);
            self.emit_byte(name_constant);
        } else {
            self.named_variable(super_token, false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name_constant);
        }
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous.value.parse::<f64>() {
            Ok(number) => self.emit_constant(Value::Double(number)),
            Err(_) => self.error("number is out of allowed range"),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.value;
        let text = &lexeme[1..lexeme.len() - 1];
        let interned = self.vm.intern_string(text);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.token_type {
            TokenType::TokenNil => self.emit_op(OpCode::Nil),
            TokenType::TokenTrue => self.emit_op(OpCode::True),
            TokenType::TokenFalse => self.emit_op(OpCode::False),
            _ => self.error("expected expression"),
        }
    }

    // Variables and scopes.

    fn define_variable(&mut self, name: Token<'src>) {
        if self.func().scope_depth == 0 {
            let name_constant = self.identifier_constant(name.value);
            self.emit_op_at(OpCode::DefineGlobal, name.line);
            self.emit_byte_at(name_constant, name.line);
        } else {
            self.declare_local(name);
        }
    }

    /// Registers a local for the value currently on top of the stack.
    fn declare_local(&mut self, name: Token<'src>) {
        let depth = self.func().scope_depth;
        let shadowed = self
            .func()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == depth)
            .any(|local| local.name == name.value);
        if shadowed {
            self.error("redefinition of local variable");
        }
        if self.func().locals.len() > u8::MAX as usize {
            self.error("too many local variables in function");
        }
        self.func_mut().locals.push(Local { name: name.value, depth, captured: false });
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.functions.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name.value) {
            (OpCode::GetLocal, OpCode::SetLocal, slot as u8)
        } else if let Some(index) = self.resolve_upvalue(top, name.value) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name.value);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if self.match_token(TokenType::TokenEqual) {
            if !can_assign {
                self.error("invalid assignment target");
            }
            self.expression();
            self.emit_op_at(set_op, name.line);
            self.emit_byte_at(arg, name.line);
        } else {
            self.emit_op_at(get_op, name.line);
            self.emit_byte_at(arg, name.line);
        }
    }

    fn resolve_local(&self, func: usize, name: &str) -> Option<usize> {
        self.functions[func]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name && !local.name.is_empty())
            .map(|(slot, _)| slot)
    }

    fn resolve_upvalue(&mut self, func: usize, name: &str) -> Option<u8> {
        if func == 0 {
            return None;
        }
        let parent = func - 1;
        if let Some(slot) = self.resolve_local(parent, name) {
            self.functions[parent].locals[slot].captured = true;
            return Some(self.add_upvalue(func, slot as u8, true));
        }
        if let Some(index) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(func, index, false));
        }
        None
    }

    fn add_upvalue(&mut self, func: usize, index: u8, is_local: bool) -> u8 {
        let existing =
            self.functions[func].upvalues.iter().position(|&u| u == (is_local, index));
        if let Some(existing) = existing {
            return existing as u8;
        }
        if self.functions[func].upvalues.len() > u8::MAX as usize {
            self.error("too many captured variables in function");
            return 0;
        }
        self.functions[func].upvalues.push((is_local, index));
        (self.functions[func].upvalues.len() - 1) as u8
    }

    fn begin_scope(&mut self) {
        self.func_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func_mut().scope_depth -= 1;
        loop {
            let depth = self.func().scope_depth;
            match self.func().locals.last() {
                Some(local) if local.depth > depth => {
                    let op = if local.captured {
                        OpCode::CloseUpvalue
                    } else {
                        OpCode::Pop
                    };
                    self.emit_op(op);
                    self.func_mut().locals.pop();
                }
                _ => break,
            }
        }
    }

    // Parsing machinery.

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token_type != TokenType::TokenError {
                break;
            }
            let message = self.current.value;
            self.error_at(self.current.line, message);
        }
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, token_type: TokenType, message: &str) -> Token<'src> {
        if self.check(token_type) {
            self.advance();
            return self.previous;
        }
        self.error_at(self.current.line, message);
        self.current
    }

    fn synthetic_token(&self, name: &'static str) -> Token<'src> {
        Token {
            token_type: TokenType::TokenIdentifier,
            value: name,
            line: self.previous.line,
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::TokenEof {
            if self.previous.token_type == TokenType::TokenSemicolon {
                return;
            }
            match self.current.token_type {
                TokenType::TokenClass
                | TokenType::TokenFun
                | TokenType::TokenVar
                | TokenType::TokenIf
                | TokenType::TokenWhile
                | TokenType::TokenPrint
                | TokenType::TokenReturn => return,
                _ => self.advance(),
            }
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous.line, message);
    }

    fn error_at(&mut self, line: usize, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.reporter.report(&self.path, line, message);
    }

    // Emitter.

    fn func(&self) -> &FunctionState<'src> {
        match self.functions.last() {
            Some(state) => state,
            None => panic!("no function compilation in flight"),
        }
    }

    fn func_mut(&mut self) -> &mut FunctionState<'src> {
        match self.functions.last_mut() {
            Some(state) => state,
            None => panic!("no function compilation in flight"),
        }
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.func_mut().chunk
    }

    fn emit_byte_at(&mut self, byte: u8, line: usize) {
        self.current_chunk().write_byte(byte, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        self.emit_byte_at(byte, self.previous.line);
    }

    fn emit_op_at(&mut self, op: OpCode, line: usize) {
        self.emit_byte_at(op.to_byte(), line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_op_at(op, self.previous.line);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.vm.intern_string(name);
        self.add_constant(Value::Obj(interned))
    }

    fn add_constant(&mut self, value: Value) -> u8 {
        let line = self.previous.line;
        let index = self.current_chunk().add_constant(value, line);
        if index >= MAX_PUSH_CONSTANT {
            self.error("too many constants");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.add_constant(value);
        self.emit_op(OpCode::PushConstant);
        self.emit_byte(index);
    }

    fn emit_return(&mut self) {
        if self.func().fn_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn end_function(&mut self) -> (ObjRef, Vec<(bool, u8)>) {
        self.emit_return();
        let state = match self.functions.pop() {
            Some(state) => state,
            None => panic!("no function compilation in flight"),
        };

        #[cfg(feature = "debug_print_code")]
        if !self.had_error {
            let name = self.vm.heap().str_text(state.name).to_string();
            crate::debug::disassemble_chunk(self.vm.heap(), &state.chunk, &name);
        }

        let closure = self.vm.allocate(ObjKind::Closure(Closure {
            name: state.name,
            arity: state.arity,
            chunk: state.chunk,
            upvalues: Vec::new(),
        }));
        (closure, state.upvalues)
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.current_chunk().code_len() - 2
    }

    fn patch_jump(&mut self, index: usize) {
        let offset = self.current_chunk().code_len() - index - 2;
        self.patch_jump_with(index, offset);
    }

    fn patch_loop_with(&mut self, index: usize, to: usize) {
        let offset = index - to + 2;
        self.patch_jump_with(index, offset);
    }

    fn emit_loop(&mut self, to: usize) {
        let jump = self.emit_jump(OpCode::Loop);
        self.patch_loop_with(jump, to);
    }

    fn patch_jump_with(&mut self, index: usize, offset: usize) {
        if offset > u16::MAX as usize {
            self.error("jump block is too big");
            return;
        }
        self.current_chunk().set_code_byte(index, ((offset >> 8) & 0xFF) as u8);
        self.current_chunk().set_code_byte(index + 1, (offset & 0xFF) as u8);
    }
}
