// Statement parsing: blocks and scopes, local variables, goto/label
// resolution, control structures, assignments, and function bodies.

use crate::compiler::func_state::{BlockCnt, ExpDesc, ExpKind, IndexedBase, LabelDesc};
use crate::compiler::lexer::Token;
use crate::compiler::Parser;
use crate::gc::{LocVar, StringId};
use crate::lua_vm::lua_limits::{LUA_MULTRET, MAXVARS, NO_JUMP};
use crate::lua_vm::opcode::*;
use crate::lua_vm::LuaResult;

/// Assignment targets form a chain so later targets can detect
/// conflicts with earlier table/index registers.
struct LhsAssign {
    v: ExpDesc,
}

impl<'s, 'v> Parser<'s, 'v> {
    // ============ Local variables ============

    pub fn new_localvar(&mut self, name: StringId) -> LuaResult<()> {
        let fs = self.fs_ref();
        let n_active = self.dyd.actvar.len() - fs.firstlocal;
        self.check_limit(n_active + 1, MAXVARS, "local variables")?;
        let fs = self.fs();
        let reg = fs.proto.locvars.len() as u16;
        fs.proto.locvars.push(LocVar {
            name,
            startpc: 0,
            endpc: 0,
        });
        self.dyd.actvar.push(reg);
        Ok(())
    }

    pub fn new_localvar_literal(&mut self, name: &str) -> LuaResult<()> {
        let id = self.vm.new_string(name)?.as_string_id().unwrap();
        self.new_localvar(id)
    }

    /// Bring the last `nvars` declared locals into scope.
    pub fn adjust_local_vars(&mut self, nvars: usize) {
        let pc = self.fs_ref().pc as u32;
        let fs = self.fs.last_mut().unwrap();
        fs.nactvar += nvars as u8;
        for i in 0..nvars {
            let nact = fs.nactvar as usize;
            let locvar_idx =
                self.dyd.actvar[fs.firstlocal + nact - 1 - i] as usize;
            fs.proto.locvars[locvar_idx].startpc = pc;
        }
    }

    /// Close the scope of locals above `tolevel`.
    fn remove_vars(&mut self, tolevel: u8) {
        let pc = self.fs_ref().pc as u32;
        let fs = self.fs.last_mut().unwrap();
        while fs.nactvar > tolevel {
            fs.nactvar -= 1;
            let locvar_idx = self.dyd.actvar.pop().unwrap() as usize;
            fs.proto.locvars[locvar_idx].endpc = pc;
        }
    }

    fn local_var_name(&self, reg: u8) -> StringId {
        let fs = self.fs_ref();
        let locvar_idx = self.dyd.actvar[fs.firstlocal + reg as usize] as usize;
        fs.proto.locvars[locvar_idx].name
    }

    /// Balance a multiple assignment/declaration: pad missing values
    /// with nil, spread a multi-valued tail, drop extras.
    fn adjust_assign(&mut self, nvars: usize, nexps: usize, e: &mut ExpDesc) -> LuaResult<()> {
        let mut extra = nvars as i32 - nexps as i32;
        if e.has_multret() {
            extra += 1; // includes the call itself
            if extra < 0 {
                extra = 0;
            }
            // The last expression provides the difference.
            self.set_returns(e, extra)?;
            if extra > 1 {
                self.reserve_regs((extra - 1) as usize)?;
            }
        } else {
            if e.kind != ExpKind::VVoid {
                self.exp2nextreg(e)?;
            }
            if extra > 0 {
                let reg = self.fs_ref().freereg as u32;
                self.reserve_regs(extra as usize)?;
                self.k_nil(reg, extra as u32);
            }
        }
        if nexps > nvars {
            self.fs().freereg -= (nexps - nvars) as u8;
        }
        Ok(())
    }

    // ============ Blocks ============

    pub fn enter_block(&mut self, isloop: bool) {
        let bl = BlockCnt {
            firstlabel: self.dyd.label.len(),
            firstgoto: self.dyd.gt.len(),
            nactvar: self.fs_ref().nactvar,
            upval: false,
            isloop,
        };
        debug_assert!(self.fs_ref().freereg == self.fs_ref().nactvar);
        self.fs().blocks.push(bl);
    }

    pub fn leave_block(&mut self) -> LuaResult<()> {
        let bl = *self.fs_ref().blocks.last().unwrap();
        let is_inner = self.fs_ref().blocks.len() > 1;
        if is_inner && bl.upval {
            // Close upvalues leaving the block.
            let j = self.k_jump() as i32;
            self.patch_close(j, bl.nactvar);
            self.patch_to_here(j);
        }
        if bl.isloop {
            self.break_label()?;
        }
        self.fs().blocks.pop();
        self.remove_vars(bl.nactvar);
        debug_assert!(bl.nactvar == self.fs_ref().nactvar);
        self.fs().freereg = self.fs_ref().nactvar;
        self.dyd.label.truncate(bl.firstlabel);
        if is_inner {
            self.move_gotos_out(&bl)?;
        } else if bl.firstgoto < self.dyd.gt.len() {
            return Err(self.undef_goto_error(self.dyd.gt[bl.firstgoto]));
        }
        Ok(())
    }

    fn block(&mut self) -> LuaResult<()> {
        self.enter_block(false);
        self.stat_list()?;
        self.leave_block()
    }

    // ============ Gotos and labels ============

    fn undef_goto_error(&mut self, gt: LabelDesc) -> crate::lua_vm::LuaError {
        let name = self.vm.str_display(gt.name);
        let msg = if name == "break" {
            format!("break outside a loop at line {}", gt.line)
        } else {
            format!("no visible label '{}' for goto at line {}", name, gt.line)
        };
        self.syntax_error(&msg)
    }

    /// Bind pending goto `g` to `label` and drop it from the list.
    fn close_goto(&mut self, g: usize, label: LabelDesc) -> LuaResult<()> {
        let gt = self.dyd.gt[g];
        debug_assert!(gt.name == label.name);
        if gt.nactvar < label.nactvar {
            let vname = self.local_var_name(gt.nactvar);
            let vname = self.vm.str_display(vname);
            let name = self.vm.str_display(gt.name);
            let msg = format!(
                "<goto {}> at line {} jumps into the scope of local '{}'",
                name, gt.line, vname
            );
            return Err(self.syntax_error(&msg));
        }
        self.patch_list(gt.pc, label.pc);
        self.dyd.gt.remove(g);
        Ok(())
    }

    /// Try to match pending goto `g` against the labels visible in the
    /// current block. Returns true when resolved.
    fn find_label(&mut self, g: usize) -> LuaResult<bool> {
        let bl = *self.fs_ref().blocks.last().unwrap();
        let gt = self.dyd.gt[g];
        for i in bl.firstlabel..self.dyd.label.len() {
            let lb = self.dyd.label[i];
            if lb.name == gt.name {
                if gt.nactvar > lb.nactvar
                    && (bl.upval || self.dyd.label.len() > bl.firstlabel)
                {
                    self.patch_close(gt.pc, lb.nactvar);
                }
                self.close_goto(g, lb)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Export unresolved gotos of a finished block to its enclosing
    /// block, closing upvalues where the levels differ.
    fn move_gotos_out(&mut self, bl: &BlockCnt) -> LuaResult<()> {
        let mut i = bl.firstgoto;
        while i < self.dyd.gt.len() {
            if self.dyd.gt[i].nactvar > bl.nactvar {
                if bl.upval {
                    let pc = self.dyd.gt[i].pc;
                    self.patch_close(pc, bl.nactvar);
                }
                self.dyd.gt[i].nactvar = bl.nactvar;
            }
            if !self.find_label(i)? {
                i += 1;
            }
        }
        Ok(())
    }

    /// Resolve every pending goto matching a fresh label.
    fn find_gotos(&mut self, label: LabelDesc) -> LuaResult<()> {
        let first = self.fs_ref().blocks.last().unwrap().firstgoto;
        let mut i = first;
        while i < self.dyd.gt.len() {
            if self.dyd.gt[i].name == label.name {
                self.close_goto(i, label)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// A loop exit defines a hidden "break" label at its end.
    fn break_label(&mut self) -> LuaResult<()> {
        let name = self.vm.new_string("break")?.as_string_id().unwrap();
        let label = LabelDesc {
            name,
            pc: self.fs_ref().pc as i32,
            line: 0,
            nactvar: self.fs_ref().nactvar,
        };
        self.dyd.label.push(label);
        self.find_gotos(label)
    }

    /// `goto name` / `break` (already-emitted jump at `pc`).
    fn goto_stat(&mut self, pc: i32) -> LuaResult<()> {
        let line = self.lex.line;
        let name = if self.test_next(Token::Goto)? {
            self.check_name()?
        } else {
            self.next_token()?; // skip 'break'
            self.vm.new_string("break")?.as_string_id().unwrap()
        };
        let g = LabelDesc {
            name,
            pc,
            line,
            nactvar: self.fs_ref().nactvar,
        };
        self.dyd.gt.push(g);
        let idx = self.dyd.gt.len() - 1;
        self.find_label(idx)?;
        Ok(())
    }

    fn label_stat(&mut self, name: StringId, line: u32) -> LuaResult<()> {
        // No duplicate labels in the same scope.
        let first = self.fs_ref().blocks.last().unwrap().firstlabel;
        for i in first..self.dyd.label.len() {
            if self.dyd.label[i].name == name {
                let n = self.vm.str_display(name);
                let msg = format!(
                    "label '{}' already defined on line {}",
                    n, self.dyd.label[i].line
                );
                return Err(self.syntax_error(&msg));
            }
        }
        self.check_next(Token::DbColon)?;
        let l = LabelDesc {
            name,
            pc: self.fs_ref().pc as i32,
            line,
            nactvar: self.fs_ref().nactvar,
        };
        self.dyd.label.push(l);
        let idx = self.dyd.label.len() - 1;
        self.skip_noop_stats()?;
        if self.block_follow(false) {
            // Label at block end: locals are already out of scope for
            // jumps landing here.
            self.dyd.label[idx].nactvar = self.fs_ref().blocks.last().unwrap().nactvar;
        }
        let label = self.dyd.label[idx];
        self.find_gotos(label)
    }

    fn skip_noop_stats(&mut self) -> LuaResult<()> {
        while self.lex.t == Token::Char(b';') || self.lex.t == Token::DbColon {
            self.statement()?;
        }
        Ok(())
    }

    // ============ Control structures ============

    /// Condition expression: value list collapsed to a false-exit jump
    /// list.
    fn cond(&mut self) -> LuaResult<i32> {
        let mut v = ExpDesc::new(ExpKind::VVoid, 0);
        self.expr(&mut v)?;
        if v.kind == ExpKind::VNil {
            v.kind = ExpKind::VFalse; // 'falses' are all equal here
        }
        self.go_if_true(&mut v)?;
        Ok(v.f)
    }

    fn jump_to(&mut self, target: i32) {
        let j = self.k_jump() as i32;
        self.patch_list(j, target);
    }

    fn while_stat(&mut self, line: u32) -> LuaResult<()> {
        self.next_token()?; // skip 'while'
        let whileinit = self.get_label() as i32;
        let condexit = self.cond()?;
        self.enter_block(true);
        self.check_next(Token::Do)?;
        self.block()?;
        self.jump_to(whileinit);
        self.check_match(Token::End, Token::While, line)?;
        self.leave_block()?;
        self.patch_to_here(condexit);
        Ok(())
    }

    fn repeat_stat(&mut self, line: u32) -> LuaResult<()> {
        let repeat_init = self.get_label() as i32;
        self.enter_block(true); // loop block
        self.enter_block(false); // scope block
        self.next_token()?; // skip 'repeat'
        self.stat_list()?;
        self.check_match(Token::Until, Token::Repeat, line)?;
        // The until condition can see the loop body's locals.
        let condexit = self.cond()?;
        let scope = *self.fs_ref().blocks.last().unwrap();
        if scope.upval {
            self.patch_close(condexit, scope.nactvar);
        }
        self.leave_block()?; // finish scope
        self.patch_list(condexit, repeat_init); // close the loop
        self.leave_block()?; // finish loop
        Ok(())
    }

    fn exp1(&mut self) -> LuaResult<()> {
        let mut e = ExpDesc::new(ExpKind::VVoid, 0);
        self.expr(&mut e)?;
        self.exp2nextreg(&mut e)?;
        Ok(())
    }

    fn for_body(
        &mut self,
        base: u32,
        line: u32,
        nvars: usize,
        isnum: bool,
    ) -> LuaResult<()> {
        self.adjust_local_vars(3); // control variables
        self.check_next(Token::Do)?;
        let prep = if isnum {
            self.k_code_asbx(OpCode::ForPrep, base, NO_JUMP) as i32
        } else {
            self.k_jump() as i32
        };
        self.enter_block(false); // scope for declared variables
        self.adjust_local_vars(nvars);
        self.reserve_regs(nvars)?;
        self.block()?;
        self.leave_block()?;
        self.patch_to_here(prep);
        let endfor = if isnum {
            self.k_code_asbx(OpCode::ForLoop, base, NO_JUMP) as i32
        } else {
            self.k_code_abc(OpCode::TForCall, base, 0, nvars as u32);
            self.fix_line(line);
            self.k_code_asbx(OpCode::TForLoop, base + 2, NO_JUMP) as i32
        };
        self.patch_list(endfor, prep + 1);
        self.fix_line(line);
        Ok(())
    }

    fn for_num(&mut self, varname: StringId, line: u32) -> LuaResult<()> {
        let base = self.fs_ref().freereg as u32;
        self.new_localvar_literal("(for index)")?;
        self.new_localvar_literal("(for limit)")?;
        self.new_localvar_literal("(for step)")?;
        self.new_localvar(varname)?;
        self.check_next(Token::Char(b'='))?;
        self.exp1()?; // initial value
        self.check_next(Token::Char(b','))?;
        self.exp1()?; // limit
        if self.test_next(Token::Char(b','))? {
            self.exp1()?; // optional step
        } else {
            let k = self.number_k(1.0)?;
            let reg = self.fs_ref().freereg as u32;
            self.k_code_abx(OpCode::LoadK, reg, k);
            self.reserve_regs(1)?;
        }
        self.for_body(base, line, 1, true)
    }

    fn for_list(&mut self, indexname: StringId) -> LuaResult<()> {
        let base = self.fs_ref().freereg as u32;
        self.new_localvar_literal("(for generator)")?;
        self.new_localvar_literal("(for state)")?;
        self.new_localvar_literal("(for control)")?;
        self.new_localvar(indexname)?;
        let mut nvars = 4usize;
        while self.test_next(Token::Char(b','))? {
            let name = self.check_name()?;
            self.new_localvar(name)?;
            nvars += 1;
        }
        self.check_next(Token::In)?;
        let line = self.lex.line;
        let mut e = ExpDesc::new(ExpKind::VVoid, 0);
        let nexps = self.exp_list(&mut e)?;
        self.adjust_assign(3, nexps, &mut e)?;
        self.check_reg_stack(3)?; // room to call the generator
        self.for_body(base, line, nvars - 3, false)
    }

    fn for_stat(&mut self, line: u32) -> LuaResult<()> {
        self.enter_block(true); // scope for loop and control variables
        self.next_token()?; // skip 'for'
        let varname = self.check_name()?;
        match self.lex.t {
            Token::Char(b'=') => self.for_num(varname, line)?,
            Token::Char(b',') | Token::In => self.for_list(varname)?,
            _ => return Err(self.syntax_error("'=' or 'in' expected")),
        }
        self.check_match(Token::End, Token::For, line)?;
        self.leave_block()
    }

    fn test_then_block(&mut self, escapelist: &mut i32) -> LuaResult<()> {
        self.next_token()?; // skip 'if' or 'elseif'
        let mut v = ExpDesc::new(ExpKind::VVoid, 0);
        self.expr(&mut v)?;
        self.check_next(Token::Then)?;
        let jf;
        if self.lex.t == Token::Goto || self.lex.t == Token::Break {
            self.go_if_false(&mut v)?; // jump to the label when true
            self.enter_block(false);
            self.goto_stat(v.t)?;
            self.skip_noop_stats()?;
            if self.block_follow(false) {
                // The goto is the whole block.
                self.leave_block()?;
                return Ok(());
            }
            jf = self.k_jump() as i32;
        } else {
            self.go_if_true(&mut v)?; // skip the block when false
            self.enter_block(false);
            jf = v.f;
        }
        self.stat_list()?;
        self.leave_block()?;
        if self.lex.t == Token::Else || self.lex.t == Token::ElseIf {
            let j = self.k_jump() as i32;
            self.k_concat(escapelist, j);
        }
        self.patch_to_here(jf);
        Ok(())
    }

    fn if_stat(&mut self, line: u32) -> LuaResult<()> {
        let mut escapelist = NO_JUMP;
        self.test_then_block(&mut escapelist)?;
        while self.lex.t == Token::ElseIf {
            self.test_then_block(&mut escapelist)?;
        }
        if self.test_next(Token::Else)? {
            self.block()?;
        }
        self.check_match(Token::End, Token::If, line)?;
        self.patch_to_here(escapelist);
        Ok(())
    }

    // ============ Functions ============

    /// Function literal body; `e` receives the CLOSURE result in the
    /// enclosing function.
    pub fn body(&mut self, e: &mut ExpDesc, ismethod: bool, line: u32) -> LuaResult<()> {
        let source = self.fs_ref().proto.source;
        self.open_func(source, line);
        self.check_next(Token::Char(b'('))?;
        if ismethod {
            self.new_localvar_literal("self")?;
            self.adjust_local_vars(1);
        }
        self.par_list()?;
        self.check_next(Token::Char(b')'))?;
        self.stat_list()?;
        self.check_match(Token::End, Token::Function, line)?;
        self.close_func()?;
        let np = self.fs_ref().proto.protos.len();
        let pc = self.k_code_abx(OpCode::Closure, 0, (np - 1) as u32);
        *e = ExpDesc::new(ExpKind::VRelocable, pc as i32);
        self.exp2nextreg(e)?;
        self.fix_line(line);
        Ok(())
    }

    fn par_list(&mut self) -> LuaResult<()> {
        let mut nparams = 0usize;
        self.fs().proto.is_vararg = false;
        if self.lex.t != Token::Char(b')') {
            loop {
                match self.lex.t {
                    Token::Name(_) => {
                        let name = self.check_name()?;
                        self.new_localvar(name)?;
                        nparams += 1;
                    }
                    Token::Dots => {
                        self.next_token()?;
                        self.fs().proto.is_vararg = true;
                    }
                    _ => return Err(self.syntax_error("<name> expected")),
                }
                if self.fs_ref().proto.is_vararg || !self.test_next(Token::Char(b','))? {
                    break;
                }
            }
        }
        self.adjust_local_vars(nparams);
        let nact = self.fs_ref().nactvar;
        self.fs().proto.numparams = nact;
        self.reserve_regs(nact as usize)
    }

    fn func_name(&mut self, v: &mut ExpDesc) -> LuaResult<bool> {
        self.single_var(v)?;
        while self.lex.t == Token::Char(b'.') {
            self.field_sel(v)?;
        }
        let mut ismethod = false;
        if self.lex.t == Token::Char(b':') {
            ismethod = true;
            self.field_sel(v)?;
        }
        Ok(ismethod)
    }

    fn func_stat(&mut self, line: u32) -> LuaResult<()> {
        self.next_token()?; // skip 'function'
        let mut v = ExpDesc::new(ExpKind::VVoid, 0);
        let ismethod = self.func_name(&mut v)?;
        let mut b = ExpDesc::new(ExpKind::VVoid, 0);
        self.body(&mut b, ismethod, line)?;
        self.store_var(&v, &mut b)?;
        self.fix_line(line);
        Ok(())
    }

    fn local_func(&mut self) -> LuaResult<()> {
        let name = self.check_name()?;
        self.new_localvar(name)?;
        self.adjust_local_vars(1); // enter its scope before the body
        let line = self.lex.line;
        let mut b = ExpDesc::new(ExpKind::VVoid, 0);
        self.body(&mut b, false, line)?;
        // Debug info sees the variable only after the definition.
        let reg = b.info as u8;
        let pc = self.fs_ref().pc as u32;
        let locvar_idx = {
            let fs = self.fs_ref();
            self.dyd.actvar[fs.firstlocal + reg as usize] as usize
        };
        self.fs().proto.locvars[locvar_idx].startpc = pc;
        Ok(())
    }

    fn local_stat(&mut self) -> LuaResult<()> {
        let mut nvars = 0usize;
        loop {
            let name = self.check_name()?;
            self.new_localvar(name)?;
            nvars += 1;
            if !self.test_next(Token::Char(b','))? {
                break;
            }
        }
        let mut e = ExpDesc::new(ExpKind::VVoid, 0);
        let nexps = if self.test_next(Token::Char(b'='))? {
            self.exp_list(&mut e)?
        } else {
            0
        };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_local_vars(nvars);
        Ok(())
    }

    // ============ Assignment and call statements ============

    /// Earlier assignment targets that index a register being
    /// reassigned now must read from a safe copy.
    fn check_conflict(&mut self, lhs: &mut [LhsAssign], v: &ExpDesc) -> LuaResult<()> {
        let extra = self.fs_ref().freereg as u32;
        let mut conflict = false;
        for lh in lhs.iter_mut() {
            if lh.v.kind != ExpKind::VIndexed {
                continue;
            }
            let v_base = match v.kind {
                ExpKind::VLocal => Some(IndexedBase::Register),
                ExpKind::VUpval => Some(IndexedBase::Upvalue),
                _ => None,
            };
            if let Some(base_kind) = v_base {
                if lh.v.ind_vt == base_kind && lh.v.ind_t == v.info as u32 {
                    conflict = true;
                    lh.v.ind_vt = IndexedBase::Register;
                    lh.v.ind_t = extra;
                }
                if v.kind == ExpKind::VLocal && lh.v.ind_idx == v.info as u32 {
                    conflict = true;
                    lh.v.ind_idx = extra;
                }
            }
        }
        if conflict {
            let op = if v.kind == ExpKind::VLocal {
                OpCode::Move
            } else {
                OpCode::GetUpval
            };
            self.k_code_abc(op, extra, v.info as u32, 0);
            self.reserve_regs(1)?;
        }
        Ok(())
    }

    fn assignment(&mut self, mut lhs: Vec<LhsAssign>) -> LuaResult<()> {
        if !lhs.last().unwrap().v.is_var() {
            return Err(self.syntax_error("syntax error"));
        }
        if self.test_next(Token::Char(b','))? {
            let mut nv = ExpDesc::new(ExpKind::VVoid, 0);
            self.suffixed_exp(&mut nv)?;
            if nv.kind != ExpKind::VIndexed {
                self.check_conflict(&mut lhs, &nv)?;
            }
            self.enter_level()?;
            lhs.push(LhsAssign { v: nv });
            let r = self.assignment(lhs);
            self.leave_level();
            return r;
        }
        self.check_next(Token::Char(b'='))?;
        let nvars = lhs.len();
        let mut e = ExpDesc::new(ExpKind::VVoid, 0);
        let nexps = self.exp_list(&mut e)?;
        if nexps != nvars {
            self.adjust_assign(nvars, nexps, &mut e)?;
        } else {
            self.set_one_ret(&mut e);
            let target = lhs.pop().unwrap();
            self.store_var(&target.v, &mut e)?;
            // Remaining targets take the values below the top.
            return self.finish_assignment(lhs);
        }
        self.finish_assignment(lhs)
    }

    /// Store the value at the top of the register frontier into each
    /// remaining target, right to left.
    fn finish_assignment(&mut self, mut lhs: Vec<LhsAssign>) -> LuaResult<()> {
        while let Some(target) = lhs.pop() {
            let mut e = ExpDesc::new(ExpKind::VNonReloc, self.fs_ref().freereg as i32 - 1);
            self.store_var(&target.v, &mut e)?;
        }
        Ok(())
    }

    fn expr_stat(&mut self) -> LuaResult<()> {
        let mut v = ExpDesc::new(ExpKind::VVoid, 0);
        self.suffixed_exp(&mut v)?;
        if self.lex.t == Token::Char(b'=') || self.lex.t == Token::Char(b',') {
            self.assignment(vec![LhsAssign { v }])
        } else {
            if v.kind != ExpKind::VCall {
                return Err(self.syntax_error("syntax error"));
            }
            // A call statement discards all results.
            setarg_c(&mut self.fs().proto.code[v.info as usize], 1);
            Ok(())
        }
    }

    fn ret_stat(&mut self) -> LuaResult<()> {
        let (first, nret);
        if self.block_follow(true) || self.lex.t == Token::Char(b';') {
            first = 0;
            nret = 0;
        } else {
            let mut e = ExpDesc::new(ExpKind::VVoid, 0);
            let n = self.exp_list(&mut e)?;
            if e.has_multret() {
                self.set_returns(&e, LUA_MULTRET)?;
                if e.kind == ExpKind::VCall && n == 1 {
                    // Tail call.
                    let pc = e.info as usize;
                    let code = &mut self.fs().proto.code[pc];
                    *code = (*code & !((1 << SIZE_OP) - 1)) | (OpCode::TailCall as u32);
                    debug_assert_eq!(getarg_a(*code), self.fs_ref().nactvar as u32);
                }
                first = self.fs_ref().nactvar as u32;
                self.k_code_abc(OpCode::Return, first, 0, 0);
                self.test_next(Token::Char(b';'))?;
                return Ok(());
            } else if n == 1 {
                first = self.exp2anyreg(&mut e)?;
                nret = 1;
            } else {
                self.exp2nextreg(&mut e)?;
                first = self.fs_ref().nactvar as u32;
                nret = self.fs_ref().freereg as u32 - first;
                debug_assert_eq!(nret as usize, n);
            }
        }
        self.k_ret(first, nret)?;
        self.test_next(Token::Char(b';'))?;
        Ok(())
    }

    // ============ Statement dispatch ============

    fn block_follow(&self, withuntil: bool) -> bool {
        match self.lex.t {
            Token::Else | Token::ElseIf | Token::End | Token::Eos => true,
            Token::Until => withuntil,
            _ => false,
        }
    }

    pub fn stat_list(&mut self) -> LuaResult<()> {
        while !self.block_follow(true) {
            if self.lex.t == Token::Return {
                self.statement()?;
                return Ok(()); // 'return' must be the last statement
            }
            self.statement()?;
        }
        Ok(())
    }

    pub fn statement(&mut self) -> LuaResult<()> {
        let line = self.lex.line;
        self.enter_level()?;
        match self.lex.t {
            Token::Char(b';') => {
                self.next_token()?;
            }
            Token::If => self.if_stat(line)?,
            Token::While => self.while_stat(line)?,
            Token::Do => {
                self.next_token()?;
                self.block()?;
                self.check_match(Token::End, Token::Do, line)?;
            }
            Token::For => self.for_stat(line)?,
            Token::Repeat => self.repeat_stat(line)?,
            Token::Function => self.func_stat(line)?,
            Token::Local => {
                self.next_token()?;
                if self.test_next(Token::Function)? {
                    self.local_func()?;
                } else {
                    self.local_stat()?;
                }
            }
            Token::DbColon => {
                self.next_token()?;
                let name = self.check_name()?;
                self.label_stat(name, line)?;
            }
            Token::Return => {
                self.next_token()?;
                self.ret_stat()?;
            }
            Token::Break | Token::Goto => {
                let pc = self.k_jump() as i32;
                self.goto_stat(pc)?;
            }
            _ => self.expr_stat()?,
        }
        debug_assert!(
            self.fs_ref().proto.maxstacksize >= self.fs_ref().freereg
                && self.fs_ref().freereg >= self.fs_ref().nactvar
        );
        self.fs().freereg = self.fs_ref().nactvar;
        self.leave_level();
        Ok(())
    }
}
