// Expression parsing: variables and upvalue capture, suffixed
// expressions, constructors, call arguments, and the precedence
// climber.

use crate::compiler::code::{binop_priority, BinOpr, UnOpr, UNARY_PRIORITY};
use crate::compiler::func_state::{ExpDesc, ExpKind};
use crate::compiler::lexer::Token;
use crate::compiler::Parser;
use crate::gc::{StringId, UpvalDesc};
use crate::lua_vm::lua_limits::{LUA_MULTRET, MAXUPVAL};
use crate::lua_vm::opcode::*;
use crate::lua_vm::LuaResult;

fn get_unopr(t: &Token) -> Option<UnOpr> {
    match t {
        Token::Not => Some(UnOpr::Not),
        Token::Char(b'-') => Some(UnOpr::Minus),
        Token::Char(b'#') => Some(UnOpr::Len),
        _ => None,
    }
}

fn get_binopr(t: &Token) -> Option<BinOpr> {
    match t {
        Token::Char(b'+') => Some(BinOpr::Add),
        Token::Char(b'-') => Some(BinOpr::Sub),
        Token::Char(b'*') => Some(BinOpr::Mul),
        Token::Char(b'/') => Some(BinOpr::Div),
        Token::Char(b'%') => Some(BinOpr::Mod),
        Token::Char(b'^') => Some(BinOpr::Pow),
        Token::Concat => Some(BinOpr::Concat),
        Token::Ne => Some(BinOpr::Ne),
        Token::Eq => Some(BinOpr::Eq),
        Token::Char(b'<') => Some(BinOpr::Lt),
        Token::Le => Some(BinOpr::Le),
        Token::Char(b'>') => Some(BinOpr::Gt),
        Token::Ge => Some(BinOpr::Ge),
        Token::And => Some(BinOpr::And),
        Token::Or => Some(BinOpr::Or),
        _ => None,
    }
}

impl<'s, 'v> Parser<'s, 'v> {
    // ============ Variable resolution ============

    /// Search active locals of function `fsi` for `name`, innermost
    /// first.
    fn search_var(&self, fsi: usize, name: StringId) -> Option<u32> {
        let fs = &self.fs[fsi];
        let nact = (self.dyd.actvar.len() - fs.firstlocal).min(fs.nactvar as usize);
        for i in (0..nact).rev() {
            let locvar_idx = self.dyd.actvar[fs.firstlocal + i] as usize;
            if self.fs[fsi].proto.locvars[locvar_idx].name == name {
                return Some(i as u32);
            }
        }
        None
    }

    fn search_upvalue(&self, fsi: usize, name: StringId) -> Option<u32> {
        self.fs[fsi]
            .proto
            .upvalues
            .iter()
            .position(|d| d.name == name)
            .map(|i| i as u32)
    }

    fn new_upvalue(&mut self, fsi: usize, name: StringId, v: &ExpDesc) -> LuaResult<u32> {
        let n = self.fs[fsi].proto.upvalues.len();
        self.check_limit(n + 1, MAXUPVAL, "upvalues")?;
        self.fs[fsi].proto.upvalues.push(UpvalDesc {
            name,
            instack: v.kind == ExpKind::VLocal,
            idx: v.info as u8,
        });
        Ok(n as u32)
    }

    /// A local of function `fsi` at register `level` is captured by an
    /// inner function: flag the enclosing block so its exit closes
    /// upvalues.
    fn mark_upval(&mut self, fsi: usize, level: u32) {
        let fs = &mut self.fs[fsi];
        for bl in fs.blocks.iter_mut().rev() {
            if (bl.nactvar as u32) <= level {
                bl.upval = true;
                return;
            }
        }
    }

    /// Resolve `name` at nesting level `fsi`; returns the descriptor
    /// kind found (VVoid = global).
    fn single_var_aux(
        &mut self,
        fsi: usize,
        name: StringId,
        v: &mut ExpDesc,
        base: bool,
    ) -> LuaResult<ExpKind> {
        if let Some(reg) = self.search_var(fsi, name) {
            *v = ExpDesc::new(ExpKind::VLocal, reg as i32);
            if !base {
                self.mark_upval(fsi, reg);
            }
            return Ok(ExpKind::VLocal);
        }
        if let Some(idx) = self.search_upvalue(fsi, name) {
            *v = ExpDesc::new(ExpKind::VUpval, idx as i32);
            return Ok(ExpKind::VUpval);
        }
        if fsi == 0 {
            return Ok(ExpKind::VVoid);
        }
        if self.single_var_aux(fsi - 1, name, v, false)? == ExpKind::VVoid {
            return Ok(ExpKind::VVoid);
        }
        let idx = self.new_upvalue(fsi, name, v)?;
        *v = ExpDesc::new(ExpKind::VUpval, idx as i32);
        Ok(ExpKind::VUpval)
    }

    /// A bare name: local, upvalue, or a field of _ENV.
    pub fn single_var(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        let name = self.check_name()?;
        let top = self.fs.len() - 1;
        if self.single_var_aux(top, name, v, true)? == ExpKind::VVoid {
            let env = self.env;
            let kind = self.single_var_aux(top, env, v, true)?;
            debug_assert!(matches!(kind, ExpKind::VLocal | ExpKind::VUpval));
            let k = self.string_k(name)?;
            let mut key = ExpDesc::new(ExpKind::VK, k as i32);
            self.exp2anyregup(v)?;
            self.indexed(v, &mut key)?;
        }
        Ok(())
    }

    // ============ Expression lists and calls ============

    /// Parse `e1, e2, ...`; returns the count, leaving the last
    /// expression undischarged in `v`.
    pub fn exp_list(&mut self, v: &mut ExpDesc) -> LuaResult<usize> {
        let mut n = 1;
        self.expr(v)?;
        while self.test_next(Token::Char(b','))? {
            self.exp2nextreg(v)?;
            self.expr(v)?;
            n += 1;
        }
        Ok(n)
    }

    fn func_args(&mut self, f: &mut ExpDesc, line: u32) -> LuaResult<()> {
        let mut args = ExpDesc::new(ExpKind::VVoid, 0);
        match self.lex.t {
            Token::Char(b'(') => {
                self.next_token()?;
                if self.lex.t == Token::Char(b')') {
                    args.kind = ExpKind::VVoid;
                } else {
                    self.exp_list(&mut args)?;
                    self.set_returns(&args, LUA_MULTRET)?;
                }
                self.check_match(Token::Char(b')'), Token::Char(b'('), line)?;
            }
            Token::Char(b'{') => {
                self.constructor(&mut args)?;
            }
            Token::Str(s) => {
                let k = self.string_k(s)?;
                args = ExpDesc::new(ExpKind::VK, k as i32);
                self.next_token()?;
            }
            _ => return Err(self.syntax_error("function arguments expected")),
        }
        debug_assert!(f.kind == ExpKind::VNonReloc);
        let base = f.info as u32;
        let nparams = if args.has_multret() {
            LUA_MULTRET
        } else {
            if args.kind != ExpKind::VVoid {
                self.exp2nextreg(&mut args)?;
            }
            (self.fs_ref().freereg as i32) - (base as i32 + 1)
        };
        let pc = self.k_code_abc(OpCode::Call, base, (nparams + 1) as u32, 2);
        *f = ExpDesc::new(ExpKind::VCall, pc as i32);
        self.fix_line(line);
        // The call removes the function and arguments, leaving one
        // result.
        self.fs().freereg = base as u8 + 1;
        Ok(())
    }

    // ============ Primary / suffixed ============

    fn primary_exp(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        match self.lex.t {
            Token::Char(b'(') => {
                let line = self.lex.line;
                self.next_token()?;
                self.expr(v)?;
                self.check_match(Token::Char(b')'), Token::Char(b'('), line)?;
                self.discharge_vars(v);
                Ok(())
            }
            Token::Name(_) => self.single_var(v),
            _ => Err(self.syntax_error("unexpected symbol")),
        }
    }

    /// `a.b`, `a[k]`, `a:m(...)`, `a(...)` chains.
    pub fn suffixed_exp(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        let line = self.lex.line;
        self.primary_exp(v)?;
        loop {
            match self.lex.t {
                Token::Char(b'.') => {
                    self.field_sel(v)?;
                }
                Token::Char(b'[') => {
                    self.exp2anyregup(v)?;
                    let mut key = ExpDesc::new(ExpKind::VVoid, 0);
                    self.index_expr(&mut key)?;
                    self.indexed(v, &mut key)?;
                }
                Token::Char(b':') => {
                    self.next_token()?;
                    let name = self.check_name()?;
                    let k = self.string_k(name)?;
                    let mut key = ExpDesc::new(ExpKind::VK, k as i32);
                    self.op_self(v, &mut key)?;
                    self.func_args(v, line)?;
                }
                Token::Char(b'(') | Token::Str(_) | Token::Char(b'{') => {
                    self.exp2nextreg(v)?;
                    self.func_args(v, line)?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// `.name` selector.
    pub fn field_sel(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        self.exp2anyregup(v)?;
        self.next_token()?; // skip '.' or ':'
        let name = self.check_name()?;
        let k = self.string_k(name)?;
        let mut key = ExpDesc::new(ExpKind::VK, k as i32);
        self.indexed(v, &mut key)
    }

    /// `[ expr ]` index.
    fn index_expr(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        self.next_token()?; // skip '['
        self.expr(v)?;
        self.exp2val(v)?;
        self.check_next(Token::Char(b']'))
    }

    // ============ Simple expressions ============

    fn simple_exp(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        match self.lex.t {
            Token::Number(n) => {
                *v = ExpDesc::number(n);
                self.next_token()
            }
            Token::Str(s) => {
                let k = self.string_k(s)?;
                *v = ExpDesc::new(ExpKind::VK, k as i32);
                self.next_token()
            }
            Token::Nil => {
                *v = ExpDesc::new(ExpKind::VNil, 0);
                self.next_token()
            }
            Token::True => {
                *v = ExpDesc::new(ExpKind::VTrue, 0);
                self.next_token()
            }
            Token::False => {
                *v = ExpDesc::new(ExpKind::VFalse, 0);
                self.next_token()
            }
            Token::Dots => {
                if !self.fs_ref().proto.is_vararg {
                    return Err(self.syntax_error("cannot use '...' outside a vararg function"));
                }
                let pc = self.k_code_abc(OpCode::Vararg, 0, 1, 0);
                *v = ExpDesc::new(ExpKind::VVararg, pc as i32);
                self.next_token()
            }
            Token::Char(b'{') => self.constructor(v),
            Token::Function => {
                self.next_token()?;
                let line = self.lex.line;
                self.body(v, false, line)
            }
            _ => self.suffixed_exp(v),
        }
    }

    // ============ Operators ============

    /// Parse a subexpression binding tighter than `limit`; returns the
    /// operator that stopped the climb.
    fn sub_expr(&mut self, v: &mut ExpDesc, limit: u8) -> LuaResult<Option<BinOpr>> {
        self.enter_level()?;
        if let Some(uop) = get_unopr(&self.lex.t) {
            let line = self.lex.line;
            self.next_token()?;
            self.sub_expr(v, UNARY_PRIORITY)?;
            self.prefix(uop, v, line)?;
        } else {
            self.simple_exp(v)?;
        }
        let mut op = get_binopr(&self.lex.t);
        while let Some(current) = op {
            let (left, right) = binop_priority(current);
            if left <= limit {
                break;
            }
            let line = self.lex.line;
            self.next_token()?;
            self.infix(current, v)?;
            let mut v2 = ExpDesc::new(ExpKind::VVoid, 0);
            let nextop = self.sub_expr(&mut v2, right)?;
            self.posfix(current, v, &mut v2, line)?;
            op = nextop;
        }
        self.leave_level();
        Ok(op)
    }

    pub fn expr(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        self.sub_expr(v, 0)?;
        Ok(())
    }

    // ============ Table constructors ============

    pub fn constructor(&mut self, t: &mut ExpDesc) -> LuaResult<()> {
        let line = self.lex.line;
        let pc = self.k_code_abc(OpCode::NewTable, 0, 0, 0);
        let mut na = 0usize; // array items
        let mut nh = 0usize; // hash items
        let mut tostore = 0usize; // array items pending flush
        let mut v = ExpDesc::new(ExpKind::VVoid, 0);
        *t = ExpDesc::new(ExpKind::VRelocable, pc as i32);
        self.exp2nextreg(t)?; // fix table at stack top
        self.check_next(Token::Char(b'{'))?;
        loop {
            debug_assert!(v.kind == ExpKind::VVoid || tostore > 0);
            if self.lex.t == Token::Char(b'}') {
                break;
            }
            // Discharge the pending array item, flushing a full batch.
            if v.kind != ExpKind::VVoid {
                self.exp2nextreg(&mut v)?;
                v.kind = ExpKind::VVoid;
                if tostore == crate::lua_vm::lua_limits::LFIELDS_PER_FLUSH {
                    self.set_list(t.info as u32, na, tostore as i32)?;
                    tostore = 0;
                }
            }
            let cur_tok = self.lex.t.clone();
            match cur_tok {
                Token::Name(_) if self.peek_token()? == Token::Char(b'=') => {
                    self.rec_field(t, &mut nh)?;
                }
                Token::Char(b'[') => {
                    self.rec_field(t, &mut nh)?;
                }
                _ => {
                    // Array-style item.
                    self.expr(&mut v)?;
                    na += 1;
                    tostore += 1;
                }
            }
            if !self.test_next(Token::Char(b','))? && !self.test_next(Token::Char(b';'))? {
                break;
            }
        }
        self.check_match(Token::Char(b'}'), Token::Char(b'{'), line)?;
        // Close the pending array batch.
        if tostore > 0 {
            if v.has_multret() {
                self.set_returns(&v, LUA_MULTRET)?;
                self.set_list(t.info as u32, na, LUA_MULTRET)?;
                na -= 1; // do not count the multi-valued tail
            } else {
                if v.kind != ExpKind::VVoid {
                    self.exp2nextreg(&mut v)?;
                }
                self.set_list(t.info as u32, na, tostore as i32)?;
            }
        }
        // Patch the size hints.
        let code = &mut self.fs().proto.code[pc];
        setarg_b(code, int2fb(na as u32));
        setarg_c(code, int2fb(nh as u32));
        Ok(())
    }

    /// `[k] = v` or `name = v` inside a constructor.
    fn rec_field(&mut self, t: &ExpDesc, nh: &mut usize) -> LuaResult<()> {
        let reg = self.fs_ref().freereg;
        let mut key = ExpDesc::new(ExpKind::VVoid, 0);
        match self.lex.t {
            Token::Name(name) => {
                self.next_token()?;
                let k = self.string_k(name)?;
                key = ExpDesc::new(ExpKind::VK, k as i32);
            }
            _ => {
                self.index_expr(&mut key)?;
            }
        }
        *nh += 1;
        self.check_next(Token::Char(b'='))?;
        let rk_key = self.exp2rk(&mut key)?;
        let mut val = ExpDesc::new(ExpKind::VVoid, 0);
        self.expr(&mut val)?;
        let rk_val = self.exp2rk(&mut val)?;
        self.k_code_abc(OpCode::SetTable, t.info as u32, rk_key, rk_val);
        self.fs().freereg = reg; // free registers used by the field
        Ok(())
    }
}
