// Single-pass compiler: the recursive-descent parser drives the code
// generator directly, producing prototypes ready for the interpreter.

pub mod code;
pub mod expression;
pub mod func_state;
pub mod lexer;
pub mod statement;

use crate::gc::{ProtoId, StringId, UpvalDesc};
use crate::lua_vm::lua_limits::LUAI_MAXCCALLS;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};
use func_state::{Dyndata, FuncState};
use lexer::{LexState, Token, Zio};

pub struct Parser<'s, 'v> {
    pub vm: &'v mut LuaVM,
    pub lex: LexState<'s>,
    /// Stack of function states; the innermost is last.
    pub fs: Vec<FuncState>,
    pub dyd: Dyndata,
    /// Recursion depth, bounded by the VM call-depth budget.
    pub nesting: u32,
    /// Interned "_ENV".
    pub env: StringId,
}

/// Compile source text to a main prototype. The chunk name follows the
/// usual conventions (`=name`, `@file`, or literal source).
pub fn compile(vm: &mut LuaVM, source: &str, chunkname: &str) -> LuaResult<ProtoId> {
    compile_reader(vm, Zio::from_slice(source.as_bytes()), chunkname)
}

/// Compile from a loader stream (successive byte buffers).
pub fn compile_reader(vm: &mut LuaVM, z: Zio, chunkname: &str) -> LuaResult<ProtoId> {
    // Prototypes under construction are not reachable from any GC
    // root, so collection pauses for the duration of the parse.
    vm.gc_hold += 1;
    let r = compile_inner(vm, z, chunkname);
    vm.gc_hold -= 1;
    r
}

fn compile_inner(vm: &mut LuaVM, z: Zio, chunkname: &str) -> LuaResult<ProtoId> {
    let source = vm.new_string(chunkname)?.as_string_id().unwrap();
    let env = vm.new_string("_ENV")?.as_string_id().unwrap();
    let lex = LexState::new(vm, z, source);
    let mut p = Parser {
        vm,
        lex,
        fs: Vec::new(),
        dyd: Dyndata::default(),
        nesting: 0,
        env,
    };
    p.main_func(source, env)
}

impl<'s, 'v> Parser<'s, 'v> {
    #[inline(always)]
    pub fn fs(&mut self) -> &mut FuncState {
        self.fs.last_mut().expect("no active function state")
    }

    #[inline(always)]
    pub fn fs_ref(&self) -> &FuncState {
        self.fs.last().expect("no active function state")
    }

    pub fn syntax_error(&mut self, msg: &str) -> LuaError {
        self.lex.error_near(self.vm, msg)
    }

    pub fn enter_level(&mut self) -> LuaResult<()> {
        self.nesting += 1;
        if self.nesting >= LUAI_MAXCCALLS {
            return Err(self.lex.error(self.vm, "chunk has too many syntax levels", None));
        }
        Ok(())
    }

    #[inline(always)]
    pub fn leave_level(&mut self) {
        self.nesting -= 1;
    }

    // ============ Token plumbing ============

    pub fn next_token(&mut self) -> LuaResult<()> {
        self.lex.next(self.vm)
    }

    pub fn peek_token(&mut self) -> LuaResult<Token> {
        self.lex.peek(self.vm)
    }

    /// Consume the token if it matches.
    pub fn test_next(&mut self, t: Token) -> LuaResult<bool> {
        if self.lex.t == t {
            self.next_token()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn check(&mut self, t: Token) -> LuaResult<()> {
        if self.lex.t != t {
            let name = self.lex.token_text(self.vm, &t);
            return Err(self.syntax_error(&format!("'{}' expected", name)));
        }
        Ok(())
    }

    pub fn check_next(&mut self, t: Token) -> LuaResult<()> {
        self.check(t)?;
        self.next_token()
    }

    /// Close of a delimited construct, reporting the opening line when
    /// they differ.
    pub fn check_match(&mut self, what: Token, who: Token, where_line: u32) -> LuaResult<()> {
        if !self.test_next(what)? {
            if where_line == self.lex.line {
                let name = self.lex.token_text(self.vm, &what);
                return Err(self.syntax_error(&format!("'{}' expected", name)));
            }
            let name = self.lex.token_text(self.vm, &what);
            let who = self.lex.token_text(self.vm, &who);
            return Err(self.syntax_error(&format!(
                "'{}' expected (to close '{}' at line {})",
                name, who, where_line
            )));
        }
        Ok(())
    }

    pub fn check_name(&mut self) -> LuaResult<StringId> {
        match self.lex.t {
            Token::Name(id) => {
                self.next_token()?;
                Ok(id)
            }
            _ => Err(self.syntax_error("<name> expected")),
        }
    }

    pub fn check_limit(&mut self, v: usize, limit: usize, what: &str) -> LuaResult<()> {
        if v > limit {
            let line = self.fs_ref().proto.linedefined;
            let msg = if line == 0 {
                format!("main function has more than {} {}", limit, what)
            } else {
                format!(
                    "function at line {} has more than {} {}",
                    line, limit, what
                )
            };
            return Err(self.syntax_error(&msg));
        }
        Ok(())
    }

    // ============ Top level ============

    /// The main chunk: a vararg function whose first upvalue is _ENV.
    fn main_func(&mut self, source: StringId, env: StringId) -> LuaResult<ProtoId> {
        self.open_func(source, 0);
        self.fs().proto.is_vararg = true;
        self.fs().proto.upvalues.push(UpvalDesc {
            name: env,
            instack: true,
            idx: 0,
        });
        self.next_token()?;
        self.stat_list()?;
        self.check(Token::Eos)?;
        self.close_func()
    }

    pub fn open_func(&mut self, source: StringId, linedefined: u32) {
        let mut fs = FuncState::new(source, linedefined);
        fs.firstlocal = self.dyd.actvar.len();
        self.fs.push(fs);
        self.enter_block(false);
    }

    /// Finish the current function: final return, close scope, pool
    /// the prototype, and hand its id to the enclosing function.
    pub fn close_func(&mut self) -> LuaResult<ProtoId> {
        self.k_ret(0, 0)?; // final "return"
        self.leave_block()?;
        let mut fs = self.fs.pop().expect("no function to close");
        fs.proto.lastlinedefined = self.lex.line;
        debug_assert!(fs.blocks.is_empty());
        let id = self.vm.new_proto(fs.proto)?;
        if let Some(parent) = self.fs.last_mut() {
            parent.proto.protos.push(id);
        }
        Ok(id)
    }
}
