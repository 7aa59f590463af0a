// The bytecode dispatch loop.
//
// Each iteration: honor GC debt, honor hooks (which may yield with the
// program counter pre-incremented), decode, execute. Calls into Lua
// functions stay inside the loop (the new frame is flagged as an
// in-loop reentry); returning from a frame entered from the host exits
// the loop.

pub mod arith;
pub mod concat;
pub mod table_ops;

use crate::gc::{self, Closure, ClosureId, ProtoId, UpvalState};
use crate::lua_value::LuaValue;
use crate::lua_vm::call_status::*;
use crate::lua_vm::lua_limits::{LFIELDS_PER_FLUSH, LUA_MULTRET};
use crate::lua_vm::lua_state::HookEvent;
use crate::lua_vm::opcode::*;
use crate::lua_vm::{hook_mask, LuaError, LuaResult, LuaVM, ThreadStatus, TmKind};

use arith::{arith, equal_obj, less_equal, less_than, object_length, to_number_coerce};
use table_ops::{get_table_value, set_table_value};

/// Call a metamethod `f(a, b)` expecting one result. Metamethod frames
/// are not yieldable.
pub fn call_tm_res(vm: &mut LuaVM, f: LuaValue, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    let th = vm.current;
    let top = vm.pool.thread(th).top;
    vm.th_mut().check_stack(3)?;
    vm.th_mut().push(f);
    vm.th_mut().push(a);
    vm.th_mut().push(b);
    vm.do_call(top, 1, false)?;
    let t = vm.pool.thread_mut(th);
    t.top -= 1;
    Ok(t.stack[t.top])
}

/// Call a metamethod `f(a, b, c)` discarding results (`__newindex`).
pub fn call_tm_3(
    vm: &mut LuaVM,
    f: LuaValue,
    a: LuaValue,
    b: LuaValue,
    c: LuaValue,
) -> LuaResult<()> {
    let th = vm.current;
    let top = vm.pool.thread(th).top;
    vm.th_mut().check_stack(4)?;
    vm.th_mut().push(f);
    vm.th_mut().push(a);
    vm.th_mut().push(b);
    vm.th_mut().push(c);
    vm.do_call(top, 0, false)
}

/// Count/line hook dispatch, run while the pc still addresses the
/// instruction about to execute; a yielding hook therefore resumes by
/// re-executing that instruction.
fn traceexec(vm: &mut LuaVM, proto: ProtoId) -> LuaResult<()> {
    let th = vm.current;
    let (mask, allow) = {
        let t = vm.pool.thread(th);
        (t.hook_mask, t.allow_hook)
    };
    if mask == 0 || !allow {
        return Ok(());
    }
    if vm.pool.thread(th).hook_skip_once {
        vm.pool.thread_mut(th).hook_skip_once = false;
        return Ok(());
    }
    let mut events: [Option<HookEvent>; 2] = [None, None];
    if mask & hook_mask::COUNT != 0 {
        let t = vm.pool.thread_mut(th);
        t.hook_count -= 1;
        if t.hook_count == 0 {
            t.hook_count = t.base_hook_count;
            events[0] = Some(HookEvent::Count);
        }
    }
    if mask & hook_mask::LINE != 0 {
        let pc = vm.pool.thread(th).current_ci().pc;
        let line = vm.pool.proto(proto).line_at(pc);
        let last = vm.pool.thread(th).last_line;
        if line != last {
            vm.pool.thread_mut(th).last_line = line;
            events[1] = Some(HookEvent::Line(line));
        }
    }
    for ev in events.into_iter().flatten() {
        if let Err(e) = vm.hook_event(ev) {
            if e == LuaError::Yield {
                // The pc still addresses the hooked instruction, so
                // resume re-executes it; just keep the hook from
                // immediately re-firing.
                let t = vm.pool.thread_mut(th);
                t.hook_skip_once = true;
                t.status = ThreadStatus::Yielded;
                let ci = t.current_ci_mut();
                ci.extra = ci.func;
            }
            return Err(e);
        }
    }
    Ok(())
}

#[inline(always)]
fn rk(vm: &LuaVM, base: usize, proto: ProtoId, x: u32) -> LuaValue {
    if isk(x) {
        vm.pool.proto(proto).k[indexk(x) as usize]
    } else {
        vm.pool.thread(vm.current).stack[base + x as usize]
    }
}

/// Instantiate (or reuse from the prototype cache) the closure for
/// CLOSURE's operand.
fn push_closure(
    vm: &mut LuaVM,
    parent: ClosureId,
    proto: ProtoId,
    base: usize,
) -> LuaResult<LuaValue> {
    let th = vm.current;
    // Cache hit requires every upvalue binding to match.
    if let Some(cached) = vm.pool.proto(proto).cache {
        let descs = {
            let p = vm.pool.proto(proto);
            p.upvalues.clone()
        };
        let cached_upvals = match vm.pool.closure(cached) {
            Closure::Lua(lc) => lc.upvals.clone(),
            Closure::Host(_) => Vec::new(),
        };
        if cached_upvals.len() == descs.len() {
            let mut matches = true;
            for (i, d) in descs.iter().enumerate() {
                let cell = cached_upvals[i];
                if d.instack {
                    let want_slot = base + d.idx as usize;
                    let open_match = match vm.pool.upval(cell).data {
                        UpvalState::Open { thread, slot } => thread == th && slot == want_slot,
                        UpvalState::Closed(_) => false,
                    };
                    if !open_match {
                        matches = false;
                        break;
                    }
                } else {
                    let parent_cell = match vm.pool.closure(parent) {
                        Closure::Lua(lc) => lc.upvals[d.idx as usize],
                        Closure::Host(_) => unreachable!(),
                    };
                    if parent_cell != cell {
                        matches = false;
                        break;
                    }
                }
            }
            if matches {
                return Ok(LuaValue::lua_closure(cached));
            }
        }
    }
    let descs = vm.pool.proto(proto).upvalues.clone();
    let mut upvals = Vec::with_capacity(descs.len());
    for d in &descs {
        if d.instack {
            upvals.push(vm.find_upval(th, base + d.idx as usize));
        } else {
            let cell = match vm.pool.closure(parent) {
                Closure::Lua(lc) => lc.upvals[d.idx as usize],
                Closure::Host(_) => unreachable!(),
            };
            upvals.push(cell);
        }
    }
    let v = vm.new_lua_closure(proto, upvals)?;
    let new_id = v.as_closure_id().unwrap();
    vm.pool.proto_mut(proto).cache = Some(new_id);
    gc::barrier_proto(&mut vm.gc, &mut vm.pool, proto);
    Ok(v)
}

/// Execute the current Lua frame (and everything it calls) until the
/// frame that entered the loop returns.
pub fn lua_execute(vm: &mut LuaVM) -> LuaResult<()> {
    'newframe: loop {
        let th = vm.current;
        let (cl, base) = {
            let t = vm.pool.thread(th);
            let ci = t.current_ci();
            debug_assert!(ci.is_lua());
            let fv = t.stack[ci.func];
            let cl = fv.as_closure_id().expect("Lua frame without closure");
            (cl, ci.base)
        };
        let proto = match vm.pool.closure(cl) {
            Closure::Lua(lc) => lc.proto,
            Closure::Host(_) => unreachable!(),
        };

        loop {
            // 1. Honor pending GC debt.
            vm.check_gc()?;
            // 2. Hooks (may yield with the pc pre-incremented).
            traceexec(vm, proto)?;
            // 3. Decode.
            let (pc, i) = {
                let ci = vm.pool.thread(th).current_ci();
                (ci.pc, vm.pool.proto(proto).code[ci.pc])
            };
            vm.pool.thread_mut(th).current_ci_mut().pc = pc + 1;
            let op = get_opcode(i);
            let a = getarg_a(i) as usize;
            let ra = base + a;
            // 4. Execute.
            match op {
                OpCode::Move => {
                    let v = vm.pool.thread(th).stack[base + getarg_b(i) as usize];
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::LoadK => {
                    let v = vm.pool.proto(proto).k[getarg_bx(i) as usize];
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::LoadKx => {
                    let next = vm.pool.proto(proto).code[pc + 1];
                    debug_assert!(get_opcode(next) == OpCode::ExtraArg);
                    let v = vm.pool.proto(proto).k[getarg_ax(next) as usize];
                    vm.pool.thread_mut(th).stack[ra] = v;
                    vm.pool.thread_mut(th).current_ci_mut().pc = pc + 2;
                }
                OpCode::LoadBool => {
                    vm.pool.thread_mut(th).stack[ra] = LuaValue::boolean(getarg_b(i) != 0);
                    if getarg_c(i) != 0 {
                        vm.pool.thread_mut(th).current_ci_mut().pc = pc + 2;
                    }
                }
                OpCode::LoadNil => {
                    let b = getarg_b(i) as usize;
                    let t = vm.pool.thread_mut(th);
                    for j in 0..=b {
                        t.stack[ra + j] = LuaValue::nil();
                    }
                }
                OpCode::GetUpval => {
                    let cell = match vm.pool.closure(cl) {
                        Closure::Lua(lc) => lc.upvals[getarg_b(i) as usize],
                        Closure::Host(_) => unreachable!(),
                    };
                    let v = vm.upval_get(cell);
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::SetUpval => {
                    let cell = match vm.pool.closure(cl) {
                        Closure::Lua(lc) => lc.upvals[getarg_b(i) as usize],
                        Closure::Host(_) => unreachable!(),
                    };
                    let v = vm.pool.thread(th).stack[ra];
                    vm.upval_set(cell, v);
                }
                OpCode::GetTabUp => {
                    let cell = match vm.pool.closure(cl) {
                        Closure::Lua(lc) => lc.upvals[getarg_b(i) as usize],
                        Closure::Host(_) => unreachable!(),
                    };
                    let t = vm.upval_get(cell);
                    let key = rk(vm, base, proto, getarg_c(i));
                    let v = get_table_value(vm, &t, &key)?;
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::GetTable => {
                    let t = vm.pool.thread(th).stack[base + getarg_b(i) as usize];
                    let key = rk(vm, base, proto, getarg_c(i));
                    let v = get_table_value(vm, &t, &key)?;
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::SetTabUp => {
                    let cell = match vm.pool.closure(cl) {
                        Closure::Lua(lc) => lc.upvals[getarg_a(i) as usize],
                        Closure::Host(_) => unreachable!(),
                    };
                    let t = vm.upval_get(cell);
                    let key = rk(vm, base, proto, getarg_b(i));
                    let val = rk(vm, base, proto, getarg_c(i));
                    set_table_value(vm, &t, &key, &val)?;
                }
                OpCode::SetTable => {
                    let t = vm.pool.thread(th).stack[ra];
                    let key = rk(vm, base, proto, getarg_b(i));
                    let val = rk(vm, base, proto, getarg_c(i));
                    set_table_value(vm, &t, &key, &val)?;
                }
                OpCode::NewTable => {
                    let narray = fb2int(getarg_b(i)) as usize;
                    let nhash = fb2int(getarg_c(i)) as usize;
                    let t = vm.new_table(narray, nhash)?;
                    vm.pool.thread_mut(th).stack[ra] = t;
                }
                OpCode::OpSelf => {
                    let t = vm.pool.thread(th).stack[base + getarg_b(i) as usize];
                    vm.pool.thread_mut(th).stack[ra + 1] = t;
                    let key = rk(vm, base, proto, getarg_c(i));
                    let v = get_table_value(vm, &t, &key)?;
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod
                | OpCode::Pow => {
                    let tm = match op {
                        OpCode::Add => TmKind::Add,
                        OpCode::Sub => TmKind::Sub,
                        OpCode::Mul => TmKind::Mul,
                        OpCode::Div => TmKind::Div,
                        OpCode::Mod => TmKind::Mod,
                        _ => TmKind::Pow,
                    };
                    let b = rk(vm, base, proto, getarg_b(i));
                    let c = rk(vm, base, proto, getarg_c(i));
                    let v = if let (Some(x), Some(y)) = (b.as_number(), c.as_number()) {
                        LuaValue::number(arith::raw_arith(tm, x, y))
                    } else {
                        arith(vm, &b, &c, tm)?
                    };
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::Unm => {
                    let b = vm.pool.thread(th).stack[base + getarg_b(i) as usize];
                    let v = if let Some(n) = b.as_number() {
                        LuaValue::number(-n)
                    } else {
                        arith(vm, &b, &b, TmKind::Unm)?
                    };
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::Not => {
                    let b = vm.pool.thread(th).stack[base + getarg_b(i) as usize];
                    vm.pool.thread_mut(th).stack[ra] = LuaValue::boolean(b.is_falsy());
                }
                OpCode::Len => {
                    let b = vm.pool.thread(th).stack[base + getarg_b(i) as usize];
                    let v = object_length(vm, &b)?;
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::Concat => {
                    let b = getarg_b(i) as usize;
                    let c = getarg_c(i) as usize;
                    vm.pool.thread_mut(th).top = base + c + 1;
                    concat::concat(vm, c - b + 1)?;
                    let v = vm.pool.thread(th).stack[base + b];
                    let t = vm.pool.thread_mut(th);
                    t.stack[ra] = v;
                    let top = t.current_ci().top;
                    t.top = top;
                }
                OpCode::Jmp => {
                    do_jump(vm, base, i);
                }
                OpCode::Eq | OpCode::Lt | OpCode::Le => {
                    let b = rk(vm, base, proto, getarg_b(i));
                    let c = rk(vm, base, proto, getarg_c(i));
                    let cond = match op {
                        OpCode::Eq => equal_obj(vm, &b, &c)?,
                        OpCode::Lt => less_than(vm, &b, &c)?,
                        _ => less_equal(vm, &b, &c)?,
                    };
                    next_jump(vm, base, proto, cond == (a != 0));
                }
                OpCode::Test => {
                    let v = vm.pool.thread(th).stack[ra];
                    let c = getarg_c(i) != 0;
                    next_jump(vm, base, proto, v.is_truthy() == c);
                }
                OpCode::TestSet => {
                    let v = vm.pool.thread(th).stack[base + getarg_b(i) as usize];
                    let c = getarg_c(i) != 0;
                    if v.is_truthy() == c {
                        vm.pool.thread_mut(th).stack[ra] = v;
                        next_jump(vm, base, proto, true);
                    } else {
                        next_jump(vm, base, proto, false);
                    }
                }
                OpCode::Call => {
                    let b = getarg_b(i) as usize;
                    let nresults = getarg_c(i) as i32 - 1;
                    if b != 0 {
                        vm.pool.thread_mut(th).top = ra + b;
                    }
                    if vm.precall(ra, nresults)? {
                        // Host function ran to completion.
                        if nresults >= 0 {
                            let top = vm.pool.thread(th).current_ci().top;
                            vm.pool.thread_mut(th).top = top;
                        }
                    } else {
                        vm.pool
                            .thread_mut(th)
                            .current_ci_mut()
                            .set_flag(CIST_REENTRY);
                        continue 'newframe;
                    }
                }
                OpCode::TailCall => {
                    let b = getarg_b(i) as usize;
                    if b != 0 {
                        vm.pool.thread_mut(th).top = ra + b;
                    }
                    let callee = vm.pool.thread(th).stack[ra];
                    if vm.precall(ra, LUA_MULTRET)? {
                        // Host function: results are in place; the
                        // following RETURN forwards them.
                        let _ = callee;
                    } else {
                        // Reuse the caller's frame: close the caller's
                        // upvalues, then shift the callee's function
                        // and fixed frame down over the caller's.
                        let (nfunc, nbase, npc) = {
                            let ci = vm.pool.thread(th).current_ci();
                            (ci.func, ci.base, ci.pc)
                        };
                        let callee_proto = {
                            let fv = vm.pool.thread(th).stack[nfunc];
                            let cid = fv.as_closure_id().unwrap();
                            match vm.pool.closure(cid) {
                                Closure::Lua(lc) => lc.proto,
                                Closure::Host(_) => unreachable!(),
                            }
                        };
                        let numparams = vm.pool.proto(callee_proto).numparams as usize;
                        let (ofunc, obase_old) = {
                            let t = vm.pool.thread(th);
                            let oci = &t.ci[t.ci_depth - 2];
                            (oci.func, oci.base)
                        };
                        let _ = obase_old;
                        vm.close_upvalues(th, base);
                        let lim = nbase + numparams;
                        {
                            let t = vm.pool.thread_mut(th);
                            let mut aux = 0;
                            while nfunc + aux < lim {
                                t.stack[ofunc + aux] = t.stack[nfunc + aux];
                                aux += 1;
                            }
                            let top = t.top;
                            let depth = t.ci_depth;
                            let new_base = ofunc + (nbase - nfunc);
                            let new_top = ofunc + (top - nfunc);
                            let oci = &mut t.ci[depth - 2];
                            oci.base = new_base;
                            oci.top = new_top;
                            oci.pc = npc;
                            oci.set_flag(CIST_TAIL);
                            oci.call_status =
                                (oci.call_status & !CIST_HOOKED) | CIST_LUA;
                            // The callee's frame collapses into the
                            // caller's slot.
                            t.ci_depth = depth - 1;
                            t.top = new_top;
                            // Frame's function value moved with it.
                        }
                        vm.hook_event(HookEvent::TailCall)?;
                        continue 'newframe;
                    }
                }
                OpCode::Return => {
                    let b = getarg_b(i) as usize;
                    let has_subprotos = !vm.pool.proto(proto).protos.is_empty();
                    if has_subprotos {
                        vm.close_upvalues(th, base);
                    }
                    let nres = if b != 0 {
                        b - 1
                    } else {
                        vm.pool.thread(th).top - ra
                    };
                    let reentry = vm.pool.thread(th).current_ci().has_flag(CIST_REENTRY);
                    vm.hook_event(HookEvent::Return)?;
                    let fixed = vm.poscall(ra, nres);
                    if !reentry {
                        return Ok(());
                    }
                    if fixed {
                        let top = vm.pool.thread(th).current_ci().top;
                        vm.pool.thread_mut(th).top = top;
                    }
                    continue 'newframe;
                }
                OpCode::ForLoop => {
                    let t = vm.pool.thread(th);
                    let idx = t.stack[ra].as_number_raw() + t.stack[ra + 2].as_number_raw();
                    let limit = t.stack[ra + 1].as_number_raw();
                    let step = t.stack[ra + 2].as_number_raw();
                    let continues = if step > 0.0 { idx <= limit } else { limit <= idx };
                    if continues {
                        let t = vm.pool.thread_mut(th);
                        t.stack[ra] = LuaValue::number(idx);
                        t.stack[ra + 3] = LuaValue::number(idx);
                        t.current_ci_mut().pc = (pc as i64 + 1 + getarg_sbx(i) as i64) as usize;
                    }
                }
                OpCode::ForPrep => {
                    let init = vm.pool.thread(th).stack[ra];
                    let limit = vm.pool.thread(th).stack[ra + 1];
                    let step = vm.pool.thread(th).stack[ra + 2];
                    let Some(init) = to_number_coerce(vm, &init) else {
                        return Err(vm.run_error("'for' initial value must be a number".into()));
                    };
                    let Some(limit) = to_number_coerce(vm, &limit) else {
                        return Err(vm.run_error("'for' limit must be a number".into()));
                    };
                    let Some(step) = to_number_coerce(vm, &step) else {
                        return Err(vm.run_error("'for' step must be a number".into()));
                    };
                    let t = vm.pool.thread_mut(th);
                    t.stack[ra] = LuaValue::number(init - step);
                    t.stack[ra + 1] = LuaValue::number(limit);
                    t.stack[ra + 2] = LuaValue::number(step);
                    t.current_ci_mut().pc = (pc as i64 + 1 + getarg_sbx(i) as i64) as usize;
                }
                OpCode::TForCall => {
                    let cb = ra + 3;
                    {
                        let t = vm.pool.thread_mut(th);
                        t.stack[cb + 2] = t.stack[ra + 2];
                        t.stack[cb + 1] = t.stack[ra + 1];
                        t.stack[cb] = t.stack[ra];
                        t.top = cb + 3;
                    }
                    vm.do_call(cb, getarg_c(i) as i32, true)?;
                    let top = vm.pool.thread(th).current_ci().top;
                    vm.pool.thread_mut(th).top = top;
                }
                OpCode::TForLoop => {
                    let v = vm.pool.thread(th).stack[ra + 1];
                    if !v.is_nil() {
                        let t = vm.pool.thread_mut(th);
                        t.stack[ra] = v;
                        t.current_ci_mut().pc = (pc as i64 + 1 + getarg_sbx(i) as i64) as usize;
                    }
                }
                OpCode::SetList => {
                    let mut n = getarg_b(i) as usize;
                    let mut c = getarg_c(i) as usize;
                    if n == 0 {
                        n = vm.pool.thread(th).top - ra - 1;
                    }
                    if c == 0 {
                        let next = vm.pool.proto(proto).code[pc + 1];
                        debug_assert!(get_opcode(next) == OpCode::ExtraArg);
                        c = getarg_ax(next) as usize;
                        vm.pool.thread_mut(th).current_ci_mut().pc = pc + 2;
                    }
                    let tid = vm.pool.thread(th).stack[ra].as_table_id().expect("SETLIST target");
                    let mut last = (c - 1) * LFIELDS_PER_FLUSH + n;
                    let mut j = n;
                    while j > 0 {
                        let v = vm.pool.thread(th).stack[ra + j];
                        vm.raw_seti(tid, last as i64, v);
                        last -= 1;
                        j -= 1;
                    }
                    let top = vm.pool.thread(th).current_ci().top;
                    vm.pool.thread_mut(th).top = top;
                }
                OpCode::Closure => {
                    let sub = vm.pool.proto(proto).protos[getarg_bx(i) as usize];
                    let v = push_closure(vm, cl, sub, base)?;
                    vm.pool.thread_mut(th).stack[ra] = v;
                }
                OpCode::Vararg => {
                    let b = getarg_b(i) as i32 - 1;
                    let numparams = vm.pool.proto(proto).numparams as usize;
                    let func = vm.pool.thread(th).current_ci().func;
                    let n = (base as i64 - func as i64 - numparams as i64 - 1).max(0) as usize;
                    let count = if b < 0 {
                        vm.th_mut().check_stack(n)?;
                        vm.pool.thread_mut(th).top = ra + n;
                        n
                    } else {
                        b as usize
                    };
                    let t = vm.pool.thread_mut(th);
                    for j in 0..count {
                        t.stack[ra + j] = if j < n {
                            t.stack[func + numparams + 1 + j]
                        } else {
                            LuaValue::nil()
                        };
                    }
                }
                OpCode::ExtraArg => {
                    unreachable!("EXTRAARG is consumed by its predecessor")
                }
            }
        }
    }
}

/// Execute a JMP instruction: optionally close upvalues, then adjust
/// the pc (which already points past the JMP).
fn do_jump(vm: &mut LuaVM, base: usize, i: Instr) {
    let th = vm.current;
    let a = getarg_a(i) as usize;
    if a > 0 {
        vm.close_upvalues(th, base + a - 1);
    }
    let ci = vm.pool.thread_mut(th).current_ci_mut();
    ci.pc = (ci.pc as i64 + getarg_sbx(i) as i64) as usize;
}

/// Comparison/test opcodes are paired with a following JMP: on a true
/// condition execute it, otherwise skip it.
fn next_jump(vm: &mut LuaVM, base: usize, proto: ProtoId, cond: bool) {
    let th = vm.current;
    let pc = vm.pool.thread(th).current_ci().pc;
    if cond {
        let jmp = vm.pool.proto(proto).code[pc];
        debug_assert!(get_opcode(jmp) == OpCode::Jmp);
        vm.pool.thread_mut(th).current_ci_mut().pc = pc + 1;
        do_jump(vm, base, jmp);
    } else {
        vm.pool.thread_mut(th).current_ci_mut().pc = pc + 1;
    }
}

