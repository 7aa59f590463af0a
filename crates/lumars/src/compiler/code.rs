// Code generator. Expressions are carried as descriptors and lowered
// into registers just in time, which enables constant folding,
// LOADNIL merging, and TESTSET/TEST rewriting of short-circuit jumps.

use crate::compiler::func_state::{ConstKey, ExpDesc, ExpKind, IndexedBase};
use crate::compiler::Parser;
use crate::lua_value::LuaValue;
use crate::lua_vm::lua_limits::{LFIELDS_PER_FLUSH, LUA_MULTRET, MAXREGS, NO_JUMP};
use crate::lua_vm::opcode::*;

/// "No register" marker in TESTSET patching.
pub const NO_REG: u32 = MAXARG_A;

/// Binary operators in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpr {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOpr {
    Minus,
    Not,
    Len,
}

/// (left, right) binding priorities; right < left makes an operator
/// right-associative.
pub fn binop_priority(op: BinOpr) -> (u8, u8) {
    match op {
        BinOpr::Or => (1, 1),
        BinOpr::And => (2, 2),
        BinOpr::Eq | BinOpr::Lt | BinOpr::Le | BinOpr::Ne | BinOpr::Gt | BinOpr::Ge => (3, 3),
        BinOpr::Concat => (5, 4),
        BinOpr::Add | BinOpr::Sub => (6, 6),
        BinOpr::Mul | BinOpr::Div | BinOpr::Mod => (7, 7),
        BinOpr::Pow => (10, 9),
    }
}

pub const UNARY_PRIORITY: u8 = 8;

impl<'s, 'v> Parser<'s, 'v> {
    // ============ Raw emission ============

    /// Emit one instruction, discharging pending jumps to it first.
    fn k_code(&mut self, i: Instr) -> usize {
        let jpc = self.fs_ref().jpc;
        self.fs().jpc = NO_JUMP;
        self.patch_list_aux(jpc, self.fs_ref().pc as i32, NO_REG, self.fs_ref().pc as i32);
        let line = self.lex.lastline;
        let fs = self.fs();
        fs.proto.code.push(i);
        fs.proto.lineinfo.push(line);
        fs.pc += 1;
        fs.pc - 1
    }

    pub fn k_code_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> usize {
        self.k_code(create_abc(op, a, b, c))
    }

    pub fn k_code_abx(&mut self, op: OpCode, a: u32, bx: u32) -> usize {
        self.k_code(create_abx(op, a, bx))
    }

    pub fn k_code_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> usize {
        self.k_code_abx(op, a, (sbx + MAXARG_SBX) as u32)
    }

    fn code_extraarg(&mut self, ax: u32) -> usize {
        self.k_code(create_ax(OpCode::ExtraArg, ax))
    }

    /// Load constant `k` into `reg` (LOADK, or LOADKX + EXTRAARG for
    /// wide indices).
    fn k_code_k(&mut self, reg: u32, k: u32) -> usize {
        if k <= MAXARG_BX {
            self.k_code_abx(OpCode::LoadK, reg, k)
        } else {
            let p = self.k_code_abx(OpCode::LoadKx, reg, 0);
            self.code_extraarg(k);
            p
        }
    }

    pub fn fix_line(&mut self, line: u32) {
        let fs = self.fs();
        *fs.proto.lineinfo.last_mut().unwrap() = line;
    }

    // ============ Registers ============

    pub fn check_reg_stack(&mut self, n: usize) -> crate::lua_vm::LuaResult<()> {
        let newstack = self.fs_ref().freereg as usize + n;
        if newstack > self.fs_ref().proto.maxstacksize as usize {
            if newstack >= MAXREGS {
                return Err(self.syntax_error("function or expression too complex"));
            }
            self.fs().proto.maxstacksize = newstack as u8;
        }
        Ok(())
    }

    pub fn reserve_regs(&mut self, n: usize) -> crate::lua_vm::LuaResult<()> {
        self.check_reg_stack(n)?;
        self.fs().freereg += n as u8;
        Ok(())
    }

    /// Free one register (if it is neither a constant nor a local).
    fn free_reg(&mut self, reg: u32) {
        if !isk(reg) && reg >= self.fs_ref().nactvar as u32 {
            self.fs().freereg -= 1;
            debug_assert_eq!(reg, self.fs_ref().freereg as u32);
        }
    }

    fn free_exp(&mut self, e: &ExpDesc) {
        if e.kind == ExpKind::VNonReloc {
            self.free_reg(e.info as u32);
        }
    }

    // ============ Constants ============

    fn add_k(&mut self, key: ConstKey, v: LuaValue) -> crate::lua_vm::LuaResult<u32> {
        if let Some(&idx) = self.fs_ref().k_map.get(&key) {
            return Ok(idx);
        }
        let fs = self.fs();
        let idx = fs.proto.k.len() as u32;
        if idx > MAXARG_AX {
            return Err(self.syntax_error("constant table overflow"));
        }
        let fs = self.fs();
        fs.proto.k.push(v);
        fs.k_map.insert(key, idx);
        Ok(idx)
    }

    pub fn string_k(&mut self, s: crate::gc::StringId) -> crate::lua_vm::LuaResult<u32> {
        self.add_k(ConstKey::Str(s), LuaValue::string(s))
    }

    pub fn number_k(&mut self, n: f64) -> crate::lua_vm::LuaResult<u32> {
        // Keyed by raw bits: -0 and NaN payloads get their own slots.
        self.add_k(ConstKey::Num(n.to_bits()), LuaValue::number(n))
    }

    fn bool_k(&mut self, b: bool) -> crate::lua_vm::LuaResult<u32> {
        let key = if b { ConstKey::True } else { ConstKey::False };
        self.add_k(key, LuaValue::boolean(b))
    }

    fn nil_k(&mut self) -> crate::lua_vm::LuaResult<u32> {
        self.add_k(ConstKey::Nil, LuaValue::nil())
    }

    // ============ Jumps ============

    pub fn k_jump(&mut self) -> usize {
        let jpc = self.fs_ref().jpc;
        self.fs().jpc = NO_JUMP;
        let mut j = self.k_code_asbx(OpCode::Jmp, 0, NO_JUMP) as i32;
        self.k_concat(&mut j, jpc);
        j as usize
    }

    pub fn get_label(&mut self) -> usize {
        let fs = self.fs();
        fs.lasttarget = fs.pc as i32;
        fs.pc
    }

    fn get_jump(&self, pc: usize) -> i32 {
        let offset = getarg_sbx(self.fs_ref().proto.code[pc]);
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc as i32 + 1 + offset
        }
    }

    fn fix_jump(&mut self, pc: usize, dest: i32) -> crate::lua_vm::LuaResult<()> {
        let offset = dest - (pc as i32 + 1);
        debug_assert!(dest != NO_JUMP);
        if offset.abs() > MAXARG_SBX {
            return Err(self.syntax_error("control structure too long"));
        }
        setarg_sbx(&mut self.fs().proto.code[pc], offset);
        Ok(())
    }

    /// Instruction controlling the jump at `pc` (the preceding test,
    /// when there is one).
    fn jump_control_pc(&self, pc: usize) -> usize {
        if pc >= 1 {
            let prev = self.fs_ref().proto.code[pc - 1];
            if matches!(
                get_opcode(prev),
                OpCode::Eq | OpCode::Lt | OpCode::Le | OpCode::Test | OpCode::TestSet
            ) {
                return pc - 1;
            }
        }
        pc
    }

    /// Rewrite the TESTSET controlling a jump: give it a destination
    /// register, or degrade it to TEST when the value is unused.
    fn patch_test_reg(&mut self, node: usize, reg: u32) -> bool {
        let cpc = self.jump_control_pc(node);
        let i = self.fs_ref().proto.code[cpc];
        if get_opcode(i) != OpCode::TestSet {
            return false;
        }
        if reg != NO_REG && reg != getarg_b(i) {
            setarg_a(&mut self.fs().proto.code[cpc], reg);
        } else {
            self.fs().proto.code[cpc] =
                create_abc(OpCode::Test, getarg_b(i), 0, getarg_c(i));
        }
        true
    }

    /// Does any jump in the list produce a value (is not a plain
    /// test)?
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let cpc = self.jump_control_pc(list as usize);
            if get_opcode(self.fs_ref().proto.code[cpc]) != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list as usize);
        }
        false
    }

    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list as usize, NO_REG);
            list = self.get_jump(list as usize);
        }
    }

    fn patch_list_aux(&mut self, mut list: i32, vtarget: i32, reg: u32, dtarget: i32) {
        while list != NO_JUMP {
            let next = self.get_jump(list as usize);
            if self.patch_test_reg(list as usize, reg) {
                let _ = self.fix_jump(list as usize, vtarget);
            } else {
                let _ = self.fix_jump(list as usize, dtarget);
            }
            list = next;
        }
    }

    pub fn patch_list(&mut self, list: i32, target: i32) {
        if target == self.fs_ref().pc as i32 {
            self.patch_to_here(list);
        } else {
            debug_assert!(target < self.fs_ref().pc as i32);
            self.patch_list_aux(list, target, NO_REG, target);
        }
    }

    pub fn patch_to_here(&mut self, list: i32) {
        self.get_label();
        let mut jpc = self.fs_ref().jpc;
        self.k_concat(&mut jpc, list);
        self.fs().jpc = jpc;
    }

    /// Set the upvalue-close level on every JMP in the list (the A
    /// field names level+1; 0 means "close nothing").
    pub fn patch_close(&mut self, mut list: i32, level: u8) {
        let level = level as u32 + 1;
        while list != NO_JUMP {
            let next = self.get_jump(list as usize);
            let code = &mut self.fs().proto.code[list as usize];
            debug_assert!(get_opcode(*code) == OpCode::Jmp);
            setarg_a(code, level);
            list = next;
        }
    }

    pub fn k_concat(&mut self, l1: &mut i32, l2: i32) {
        if l2 == NO_JUMP {
            return;
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return;
        }
        let mut list = *l1 as usize;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next as usize;
        }
        let _ = self.fix_jump(list, l2);
    }

    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> i32 {
        self.k_code_abc(op, a, b, c);
        self.k_jump() as i32
    }

    fn invert_jump(&mut self, e: &ExpDesc) {
        let cpc = self.jump_control_pc(e.info as usize);
        let i = self.fs_ref().proto.code[cpc];
        debug_assert!(!matches!(
            get_opcode(i),
            OpCode::TestSet | OpCode::Test | OpCode::Jmp
        ));
        let a = getarg_a(i);
        setarg_a(&mut self.fs().proto.code[cpc], if a == 0 { 1 } else { 0 });
    }

    // ============ Discharging expressions ============

    /// Emit a LOADNIL run, merging with an adjacent previous one.
    pub fn k_nil(&mut self, from: u32, n: u32) {
        let fs = self.fs_ref();
        if fs.pc as i32 > fs.lasttarget {
            if fs.pc > 0 {
                let prev = fs.proto.code[fs.pc - 1];
                if get_opcode(prev) == OpCode::LoadNil {
                    let pfrom = getarg_a(prev);
                    let pl = pfrom + getarg_b(prev);
                    let l = from + n - 1;
                    if (pfrom <= from && from <= pl + 1) || (from <= pfrom && pfrom <= l + 1) {
                        let nfrom = pfrom.min(from);
                        let nl = pl.max(l);
                        let code = &mut self.fs().proto.code;
                        let last = code.len() - 1;
                        setarg_a(&mut code[last], nfrom);
                        setarg_b(&mut code[last], nl - nfrom);
                        return;
                    }
                }
            }
        }
        self.k_code_abc(OpCode::LoadNil, from, n - 1, 0);
    }

    /// Fix an open call/vararg to produce `nresults` values.
    pub fn set_returns(&mut self, e: &ExpDesc, nresults: i32) -> crate::lua_vm::LuaResult<()> {
        if e.kind == ExpKind::VCall {
            let pc = e.info as usize;
            setarg_c(&mut self.fs().proto.code[pc], (nresults + 1) as u32);
        } else if e.kind == ExpKind::VVararg {
            let pc = e.info as usize;
            let freereg = self.fs_ref().freereg as u32;
            let code = &mut self.fs().proto.code;
            setarg_b(&mut code[pc], (nresults + 1) as u32);
            setarg_a(&mut code[pc], freereg);
            self.reserve_regs(1)?;
        }
        Ok(())
    }

    pub fn set_one_ret(&mut self, e: &mut ExpDesc) {
        if e.kind == ExpKind::VCall {
            let pc = e.info as usize;
            e.kind = ExpKind::VNonReloc;
            e.info = getarg_a(self.fs_ref().proto.code[pc]) as i32;
        } else if e.kind == ExpKind::VVararg {
            let pc = e.info as usize;
            setarg_b(&mut self.fs().proto.code[pc], 2);
            e.kind = ExpKind::VRelocable;
        }
    }

    /// Turn a variable reference into a readable value (emitting the
    /// load for upvalues and indexed accesses).
    pub fn discharge_vars(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::VLocal => {
                e.kind = ExpKind::VNonReloc;
            }
            ExpKind::VUpval => {
                e.info = self.k_code_abc(OpCode::GetUpval, 0, e.info as u32, 0) as i32;
                e.kind = ExpKind::VRelocable;
            }
            ExpKind::VIndexed => {
                self.free_reg(e.ind_idx);
                let op = if e.ind_vt == IndexedBase::Register {
                    self.free_reg(e.ind_t);
                    OpCode::GetTable
                } else {
                    OpCode::GetTabUp
                };
                e.info = self.k_code_abc(op, 0, e.ind_t, e.ind_idx) as i32;
                e.kind = ExpKind::VRelocable;
            }
            ExpKind::VVararg | ExpKind::VCall => {
                self.set_one_ret(e);
            }
            _ => {}
        }
    }

    fn discharge2reg(&mut self, e: &mut ExpDesc, reg: u32) -> crate::lua_vm::LuaResult<()> {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::VNil => self.k_nil(reg, 1),
            ExpKind::VFalse => {
                self.k_code_abc(OpCode::LoadBool, reg, 0, 0);
            }
            ExpKind::VTrue => {
                self.k_code_abc(OpCode::LoadBool, reg, 1, 0);
            }
            ExpKind::VK => {
                self.k_code_k(reg, e.info as u32);
            }
            ExpKind::VKNum => {
                let k = self.number_k(e.nval)?;
                self.k_code_k(reg, k);
            }
            ExpKind::VRelocable => {
                let pc = e.info as usize;
                setarg_a(&mut self.fs().proto.code[pc], reg);
            }
            ExpKind::VNonReloc => {
                if reg != e.info as u32 {
                    self.k_code_abc(OpCode::Move, reg, e.info as u32, 0);
                }
            }
            ExpKind::VVoid | ExpKind::VJmp => return Ok(()),
            _ => unreachable!("cannot discharge {:?}", e.kind),
        }
        e.info = reg as i32;
        e.kind = ExpKind::VNonReloc;
        Ok(())
    }

    fn discharge2anyreg(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        if e.kind != ExpKind::VNonReloc {
            self.reserve_regs(1)?;
            let reg = self.fs_ref().freereg as u32 - 1;
            self.discharge2reg(e, reg)?;
        }
        Ok(())
    }

    fn code_label(&mut self, reg: u32, b: u32, jump: u32) -> i32 {
        self.get_label();
        self.k_code_abc(OpCode::LoadBool, reg, b, jump) as i32
    }

    fn exp2reg(&mut self, e: &mut ExpDesc, reg: u32) -> crate::lua_vm::LuaResult<()> {
        self.discharge2reg(e, reg)?;
        if e.kind == ExpKind::VJmp {
            let mut t = e.t;
            self.k_concat(&mut t, e.info);
            e.t = t;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if e.kind == ExpKind::VJmp {
                    NO_JUMP
                } else {
                    self.k_jump() as i32
                };
                p_f = self.code_label(reg, 0, 1);
                p_t = self.code_label(reg, 1, 0);
                self.patch_to_here(fj);
            }
            let fin = self.get_label() as i32;
            self.patch_list_aux(e.f, fin, reg, p_f);
            self.patch_list_aux(e.t, fin, reg, p_t);
        }
        e.f = NO_JUMP;
        e.t = NO_JUMP;
        e.info = reg as i32;
        e.kind = ExpKind::VNonReloc;
        Ok(())
    }

    pub fn exp2nextreg(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        self.discharge_vars(e);
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.fs_ref().freereg as u32 - 1;
        self.exp2reg(e, reg)
    }

    pub fn exp2anyreg(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<u32> {
        self.discharge_vars(e);
        if e.kind == ExpKind::VNonReloc {
            if !e.has_jumps() {
                return Ok(e.info as u32);
            }
            if e.info as u8 >= self.fs_ref().nactvar {
                let reg = e.info as u32;
                self.exp2reg(e, reg)?;
                return Ok(reg);
            }
        }
        self.exp2nextreg(e)?;
        Ok(e.info as u32)
    }

    /// Value usable as a table base: any register, or an upvalue.
    pub fn exp2anyregup(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        if e.kind != ExpKind::VUpval || e.has_jumps() {
            self.exp2anyreg(e)?;
        }
        Ok(())
    }

    pub fn exp2val(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        if e.has_jumps() {
            self.exp2anyreg(e)?;
        } else {
            self.discharge_vars(e);
        }
        Ok(())
    }

    /// Lower to an RK operand: a constant index when it fits, else a
    /// register.
    pub fn exp2rk(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<u32> {
        self.exp2val(e)?;
        match e.kind {
            ExpKind::VTrue | ExpKind::VFalse | ExpKind::VNil => {
                if self.fs_ref().proto.k.len() as u32 <= MAXINDEXRK {
                    let idx = match e.kind {
                        ExpKind::VNil => self.nil_k()?,
                        ExpKind::VTrue => self.bool_k(true)?,
                        _ => self.bool_k(false)?,
                    };
                    e.info = idx as i32;
                    e.kind = ExpKind::VK;
                    return Ok(rkask(idx));
                }
            }
            ExpKind::VKNum => {
                let idx = self.number_k(e.nval)?;
                e.info = idx as i32;
                e.kind = ExpKind::VK;
                if idx <= MAXINDEXRK {
                    return Ok(rkask(idx));
                }
            }
            ExpKind::VK => {
                if (e.info as u32) <= MAXINDEXRK {
                    return Ok(rkask(e.info as u32));
                }
            }
            _ => {}
        }
        self.exp2anyreg(e)
    }

    // ============ Assignment / indexing ============

    pub fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        match var.kind {
            ExpKind::VLocal => {
                self.free_exp(ex);
                self.exp2reg(ex, var.info as u32)?;
                return Ok(());
            }
            ExpKind::VUpval => {
                let e = self.exp2anyreg(ex)?;
                self.k_code_abc(OpCode::SetUpval, e, var.info as u32, 0);
            }
            ExpKind::VIndexed => {
                let op = if var.ind_vt == IndexedBase::Register {
                    OpCode::SetTable
                } else {
                    OpCode::SetTabUp
                };
                let e = self.exp2rk(ex)?;
                self.k_code_abc(op, var.ind_t, var.ind_idx, e);
            }
            _ => unreachable!("invalid assignment target"),
        }
        self.free_exp(ex);
        Ok(())
    }

    /// `e := e[key]` (descriptor level).
    pub fn indexed(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        debug_assert!(!e.has_jumps());
        e.ind_t = e.info as u32;
        e.ind_idx = self.exp2rk(key)?;
        e.ind_vt = if e.kind == ExpKind::VUpval {
            IndexedBase::Upvalue
        } else {
            IndexedBase::Register
        };
        e.kind = ExpKind::VIndexed;
        Ok(())
    }

    /// `self` call sugar: R(A) := R(B)[key]; R(A+1) := R(B).
    pub fn op_self(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        self.exp2anyreg(e)?;
        let ereg = e.info as u32;
        self.free_exp(e);
        let base = self.fs_ref().freereg as u32;
        e.info = base as i32;
        e.kind = ExpKind::VNonReloc;
        self.reserve_regs(2)?;
        let k = self.exp2rk(key)?;
        self.k_code_abc(OpCode::OpSelf, base, ereg, k);
        self.free_exp(key);
        Ok(())
    }

    // ============ Boolean control ============

    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> crate::lua_vm::LuaResult<i32> {
        if e.kind == ExpKind::VRelocable {
            let ie = self.fs_ref().proto.code[e.info as usize];
            if get_opcode(ie) == OpCode::Not {
                // Remove the NOT and invert the test.
                let fs = self.fs();
                fs.pc -= 1;
                fs.proto.code.pop();
                fs.proto.lineinfo.pop();
                let b = getarg_b(ie);
                return Ok(self.cond_jump(OpCode::Test, b, 0, if cond { 0 } else { 1 }));
            }
        }
        self.discharge2anyreg(e)?;
        self.free_exp(e);
        let info = e.info as u32;
        Ok(self.cond_jump(OpCode::TestSet, NO_REG, info, if cond { 1 } else { 0 }))
    }

    /// Emit code so execution falls through when `e` is true.
    pub fn go_if_true(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        self.discharge_vars(e);
        let pc = match e.kind {
            ExpKind::VJmp => {
                self.invert_jump(e);
                e.info
            }
            ExpKind::VK | ExpKind::VKNum | ExpKind::VTrue => NO_JUMP,
            _ => self.jump_on_cond(e, false)?,
        };
        let mut f = e.f;
        self.k_concat(&mut f, pc);
        e.f = f;
        self.patch_to_here(e.t);
        e.t = NO_JUMP;
        Ok(())
    }

    /// Emit code so execution falls through when `e` is false.
    pub fn go_if_false(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        self.discharge_vars(e);
        let pc = match e.kind {
            ExpKind::VJmp => e.info,
            ExpKind::VNil | ExpKind::VFalse => NO_JUMP,
            _ => self.jump_on_cond(e, true)?,
        };
        let mut t = e.t;
        self.k_concat(&mut t, pc);
        e.t = t;
        self.patch_to_here(e.f);
        e.f = NO_JUMP;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::VNil | ExpKind::VFalse => e.kind = ExpKind::VTrue,
            ExpKind::VK | ExpKind::VKNum | ExpKind::VTrue => e.kind = ExpKind::VFalse,
            ExpKind::VJmp => self.invert_jump(e),
            ExpKind::VRelocable | ExpKind::VNonReloc => {
                self.discharge2anyreg(e)?;
                self.free_exp(e);
                e.info = self.k_code_abc(OpCode::Not, 0, e.info as u32, 0) as i32;
                e.kind = ExpKind::VRelocable;
            }
            _ => unreachable!(),
        }
        // Values produced by the interchanged lists are dead now.
        let (t, f) = (e.t, e.f);
        e.t = f;
        e.f = t;
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    // ============ Operators ============

    fn const_folding(op: BinOpr, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
        if !e1.is_numeral() || !e2.is_numeral() {
            return false;
        }
        // Division and modulo by zero keep their runtime semantics.
        if matches!(op, BinOpr::Div | BinOpr::Mod) && e2.nval == 0.0 {
            return false;
        }
        let (a, b) = (e1.nval, e2.nval);
        let r = match op {
            BinOpr::Add => a + b,
            BinOpr::Sub => a - b,
            BinOpr::Mul => a * b,
            BinOpr::Div => a / b,
            BinOpr::Mod => {
                let m = a % b;
                if m != 0.0 && (m < 0.0) != (b < 0.0) {
                    m + b
                } else {
                    m
                }
            }
            BinOpr::Pow => a.powf(b),
            _ => return false,
        };
        if r.is_nan() {
            return false; // keep NaN creation at runtime
        }
        e1.nval = r;
        true
    }

    fn code_arith(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> crate::lua_vm::LuaResult<()> {
        let o2 = if !matches!(op, OpCode::Unm | OpCode::Len) {
            self.exp2rk(e2)?
        } else {
            0
        };
        let o1 = self.exp2rk(e1)?;
        if o1 > o2 {
            self.free_exp(e1);
            self.free_exp(e2);
        } else {
            self.free_exp(e2);
            self.free_exp(e1);
        }
        e1.info = self.k_code_abc(op, 0, o1, o2) as i32;
        e1.kind = ExpKind::VRelocable;
        self.fix_line(line);
        Ok(())
    }

    fn code_comp(
        &mut self,
        op: OpCode,
        cond: bool,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> crate::lua_vm::LuaResult<()> {
        let mut o1 = self.exp2rk(e1)?;
        let mut o2 = self.exp2rk(e2)?;
        self.free_exp(e2);
        self.free_exp(e1);
        let mut cond = cond;
        if !cond && op != OpCode::Eq {
            // Exchange operands to express > and >= via < and <=.
            std::mem::swap(&mut o1, &mut o2);
            cond = true;
        }
        e1.info = self.cond_jump(op, if cond { 1 } else { 0 }, o1, o2);
        e1.kind = ExpKind::VJmp;
        Ok(())
    }

    pub fn prefix(&mut self, op: UnOpr, e: &mut ExpDesc, line: u32) -> crate::lua_vm::LuaResult<()> {
        let mut fake = ExpDesc::number(0.0);
        match op {
            UnOpr::Minus => {
                if e.is_numeral() {
                    e.nval = -e.nval;
                } else {
                    self.exp2anyreg(e)?;
                    self.code_arith(OpCode::Unm, e, &mut fake, line)?;
                }
            }
            UnOpr::Not => self.code_not(e)?,
            UnOpr::Len => {
                self.exp2anyreg(e)?;
                self.code_arith(OpCode::Len, e, &mut fake, line)?;
            }
        }
        Ok(())
    }

    pub fn infix(&mut self, op: BinOpr, v: &mut ExpDesc) -> crate::lua_vm::LuaResult<()> {
        match op {
            BinOpr::And => self.go_if_true(v)?,
            BinOpr::Or => self.go_if_false(v)?,
            BinOpr::Concat => self.exp2nextreg(v)?,
            BinOpr::Add | BinOpr::Sub | BinOpr::Mul | BinOpr::Div | BinOpr::Mod | BinOpr::Pow => {
                if !v.is_numeral() {
                    self.exp2rk(v)?;
                }
            }
            _ => {
                self.exp2rk(v)?;
            }
        }
        Ok(())
    }

    pub fn posfix(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> crate::lua_vm::LuaResult<()> {
        match op {
            BinOpr::And => {
                debug_assert!(e1.t == NO_JUMP);
                self.discharge_vars(e2);
                let mut f = e2.f;
                self.k_concat(&mut f, e1.f);
                e2.f = f;
                *e1 = *e2;
            }
            BinOpr::Or => {
                debug_assert!(e1.f == NO_JUMP);
                self.discharge_vars(e2);
                let mut t = e2.t;
                self.k_concat(&mut t, e1.t);
                e2.t = t;
                *e1 = *e2;
            }
            BinOpr::Concat => {
                self.exp2val(e2)?;
                let merged = if e2.kind == ExpKind::VRelocable {
                    let ie = self.fs_ref().proto.code[e2.info as usize];
                    get_opcode(ie) == OpCode::Concat
                } else {
                    false
                };
                if merged {
                    let pc = e2.info as usize;
                    debug_assert_eq!(
                        e1.info as u32,
                        getarg_b(self.fs_ref().proto.code[pc]) - 1
                    );
                    self.free_exp(e1);
                    let info1 = e1.info as u32;
                    setarg_b(&mut self.fs().proto.code[pc], info1);
                    e1.kind = ExpKind::VRelocable;
                    e1.info = e2.info;
                } else {
                    self.exp2nextreg(e2)?;
                    self.code_arith(OpCode::Concat, e1, e2, line)?;
                }
            }
            BinOpr::Add | BinOpr::Sub | BinOpr::Mul | BinOpr::Div | BinOpr::Mod | BinOpr::Pow => {
                if !Self::const_folding(op, e1, e2) {
                    let opc = match op {
                        BinOpr::Add => OpCode::Add,
                        BinOpr::Sub => OpCode::Sub,
                        BinOpr::Mul => OpCode::Mul,
                        BinOpr::Div => OpCode::Div,
                        BinOpr::Mod => OpCode::Mod,
                        _ => OpCode::Pow,
                    };
                    self.code_arith(opc, e1, e2, line)?;
                }
            }
            BinOpr::Eq | BinOpr::Ne => {
                self.code_comp(OpCode::Eq, op == BinOpr::Eq, e1, e2)?;
            }
            BinOpr::Lt => self.code_comp(OpCode::Lt, true, e1, e2)?,
            BinOpr::Le => self.code_comp(OpCode::Le, true, e1, e2)?,
            BinOpr::Gt => self.code_comp(OpCode::Lt, false, e1, e2)?,
            BinOpr::Ge => self.code_comp(OpCode::Le, false, e1, e2)?,
        }
        Ok(())
    }

    // ============ Statements support ============

    pub fn k_ret(&mut self, first: u32, nret: u32) -> crate::lua_vm::LuaResult<()> {
        self.k_code_abc(OpCode::Return, first, nret + 1, 0);
        Ok(())
    }

    /// Emit SETLIST for a constructor batch.
    pub fn set_list(
        &mut self,
        base: u32,
        nelems: usize,
        tostore: i32,
    ) -> crate::lua_vm::LuaResult<()> {
        let c = ((nelems - 1) / LFIELDS_PER_FLUSH + 1) as u32;
        let b = if tostore == LUA_MULTRET {
            0
        } else {
            tostore as u32
        };
        if c <= MAXARG_C {
            self.k_code_abc(OpCode::SetList, base, b, c);
        } else if c <= MAXARG_AX {
            self.k_code_abc(OpCode::SetList, base, b, 0);
            self.code_extraarg(c);
        } else {
            return Err(self.syntax_error("constructor too long"));
        }
        self.fs().freereg = base as u8 + 1;
        Ok(())
    }
}
