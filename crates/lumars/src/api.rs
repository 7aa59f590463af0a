// Host-facing embedding surface over the current coroutine's value
// stack: signed indices (positive from the frame base, negative from
// the top), pseudo-indices for the registry and the running host
// closure's upvalues, protected calls, GC control, and coroutine
// plumbing.

use crate::gc::{self, Closure, GcId, TableId, ThreadId};
use crate::lua_value::conversions::number_to_str;
use crate::lua_value::LuaValue;
use crate::lua_vm::call_status::CIST_YPCALL;
use crate::lua_vm::execute::arith::to_number_coerce;
use crate::lua_vm::execute::table_ops::{get_table_value, set_table_value};
use crate::lua_vm::lua_limits::{lua_upvalueindex, LUA_REGISTRYINDEX};
use crate::lua_vm::{
    CFunction, Continuation, LuaError, LuaResult, LuaVM, ThreadStatus, TmKind,
};

impl LuaVM {
    // ============ Index resolution ============

    /// Absolute stack position of a relative index.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= LUA_REGISTRYINDEX {
            idx
        } else {
            (self.th().top - self.th().current_ci().func) as i32 + idx
        }
    }

    fn index_to_slot(&self, idx: i32) -> Option<usize> {
        let t = self.th();
        let ci = t.current_ci();
        if idx > 0 {
            let slot = ci.func + idx as usize;
            if slot < t.top {
                Some(slot)
            } else {
                None
            }
        } else if idx > LUA_REGISTRYINDEX {
            let slot = t.top as i64 + idx as i64;
            if slot > ci.func as i64 {
                Some(slot as usize)
            } else {
                None
            }
        } else {
            None // pseudo-index
        }
    }

    /// Value at an index (nil for empty or unresolvable slots).
    pub fn index_value(&self, idx: i32) -> LuaValue {
        if idx == LUA_REGISTRYINDEX {
            return self.registry;
        }
        if idx < LUA_REGISTRYINDEX {
            // Upvalue of the running host closure.
            let n = (LUA_REGISTRYINDEX - idx) as usize;
            let t = self.th();
            let fv = t.stack[t.current_ci().func];
            if let Some(cid) = fv.as_closure_id() {
                if let Closure::Host(hc) = self.pool.closure(cid) {
                    if n <= hc.upvals.len() {
                        return hc.upvals[n - 1];
                    }
                }
            }
            return LuaValue::nil();
        }
        match self.index_to_slot(idx) {
            Some(slot) => self.th().stack[slot],
            None => LuaValue::nil(),
        }
    }

    fn set_index_value(&mut self, idx: i32, v: LuaValue) {
        if idx < LUA_REGISTRYINDEX {
            let n = (LUA_REGISTRYINDEX - idx) as usize;
            let fv = {
                let t = self.th();
                t.stack[t.current_ci().func]
            };
            if let Some(cid) = fv.as_closure_id() {
                if let Closure::Host(hc) = self.pool.closure_mut(cid) {
                    if n <= hc.upvals.len() {
                        hc.upvals[n - 1] = v;
                    }
                }
                gc::barrier_forward(&mut self.gc, &mut self.pool, GcId::Closure(cid), &v);
            }
            return;
        }
        if let Some(slot) = self.index_to_slot(idx) {
            self.th_mut().stack[slot] = v;
        }
    }

    // ============ Stack manipulation ============

    pub fn get_top(&self) -> usize {
        self.th().top - self.th().current_ci().func - 1
    }

    pub fn set_top(&mut self, idx: i32) {
        let func = self.th().current_ci().func;
        let new_top = if idx >= 0 {
            func + 1 + idx as usize
        } else {
            (self.th().top as i64 + 1 + idx as i64) as usize
        };
        let t = self.th_mut();
        let mut i = t.top;
        while i < new_top {
            t.stack[i] = LuaValue::nil();
            i += 1;
        }
        t.top = new_top;
    }

    /// Reserve room for `n` pushes; the growth check and the pushes
    /// stay atomic with respect to collection.
    pub fn check_slots(&mut self, n: usize) -> LuaResult<()> {
        self.th_mut().check_stack(n)?;
        // Keep the frame's ceiling up to date for the GC's stack-in-use
        // accounting.
        let t = self.th_mut();
        let needed = t.top + n;
        let ci = t.current_ci_mut();
        if ci.top < needed {
            ci.top = needed;
        }
        Ok(())
    }

    pub fn push(&mut self, v: LuaValue) -> LuaResult<()> {
        self.check_slots(1)?;
        self.th_mut().push(v);
        Ok(())
    }

    pub fn push_nil(&mut self) -> LuaResult<()> {
        self.push(LuaValue::nil())
    }

    pub fn push_number(&mut self, n: f64) -> LuaResult<()> {
        self.push(LuaValue::number(n))
    }

    pub fn push_boolean(&mut self, b: bool) -> LuaResult<()> {
        self.push(LuaValue::boolean(b))
    }

    pub fn push_str(&mut self, s: &str) -> LuaResult<()> {
        self.check_gc()?;
        let v = self.new_string(s)?;
        self.push(v)
    }

    pub fn push_cfunction(&mut self, f: CFunction) -> LuaResult<()> {
        self.push(LuaValue::cfunction(f))
    }

    /// Build a host closure from `n` captured values popped off the
    /// top.
    pub fn push_host_closure(&mut self, f: CFunction, n: usize) -> LuaResult<()> {
        self.check_gc()?;
        let t = self.th();
        debug_assert!(t.top - t.current_ci().func > n);
        let mut upvals = Vec::with_capacity(n);
        let base = self.th().top - n;
        for i in 0..n {
            upvals.push(self.th().stack[base + i]);
        }
        self.th_mut().top = base;
        let v = self.new_host_closure(f, upvals)?;
        self.push(v)
    }

    pub fn push_light_userdata(&mut self, p: *mut std::ffi::c_void) -> LuaResult<()> {
        self.push(LuaValue::light_userdata(p))
    }

    pub fn push_index(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.index_value(idx);
        self.push(v)
    }

    pub fn pop(&mut self, n: usize) {
        let t = self.th_mut();
        t.top -= n;
    }

    pub fn pop_value(&mut self) -> LuaValue {
        self.th_mut().pop()
    }

    /// Move the top value into position `idx`, shifting up.
    pub fn insert(&mut self, idx: i32) {
        let Some(slot) = self.index_to_slot(idx) else { return };
        let t = self.th_mut();
        let top = t.top - 1;
        let v = t.stack[top];
        let mut i = top;
        while i > slot {
            t.stack[i] = t.stack[i - 1];
            i -= 1;
        }
        t.stack[slot] = v;
    }

    /// Remove the value at `idx`, shifting down.
    pub fn remove(&mut self, idx: i32) {
        let Some(slot) = self.index_to_slot(idx) else { return };
        let t = self.th_mut();
        for i in slot..t.top - 1 {
            t.stack[i] = t.stack[i + 1];
        }
        t.top -= 1;
    }

    /// Pop the top value into position `idx`.
    pub fn replace(&mut self, idx: i32) {
        let v = self.th_mut().pop();
        self.set_index_value(idx, v);
    }

    /// Copy the value at `from` over the slot at `to`.
    pub fn copy(&mut self, from: i32, to: i32) {
        let v = self.index_value(from);
        self.set_index_value(to, v);
    }

    // ============ Conversions ============

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        to_number_coerce(self, &self.index_value(idx))
    }

    /// String conversion that stores the canonical text back into the
    /// slot (keeping the interned string alive through the slot).
    pub fn to_lstring(&mut self, idx: i32) -> LuaResult<Option<Vec<u8>>> {
        let v = self.index_value(idx);
        if let Some(id) = v.as_string_id() {
            return Ok(Some(self.pool.string(id).as_bytes().to_vec()));
        }
        if let Some(n) = v.as_number() {
            let s = self.new_string(&number_to_str(n))?;
            self.set_index_value(idx, s);
            let id = s.as_string_id().unwrap();
            return Ok(Some(self.pool.string(id).as_bytes().to_vec()));
        }
        Ok(None)
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        self.index_value(idx).is_truthy()
    }

    pub fn to_thread(&self, idx: i32) -> Option<ThreadId> {
        self.index_value(idx).as_thread_id()
    }

    // ============ Tables ============

    pub fn api_new_table(&mut self, narray: usize, nhash: usize) -> LuaResult<()> {
        self.check_gc()?;
        let t = self.new_table(narray, nhash)?;
        self.push(t)
    }

    /// `t[k]` with metamethods; pops the key, pushes the result.
    pub fn api_get_table(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.index_value(idx);
        let key = self.th_mut().pop();
        let v = get_table_value(self, &t, &key)?;
        self.push(v)
    }

    /// `t[k] = v` with metamethods; pops key and value.
    pub fn api_set_table(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.index_value(idx);
        let v = self.th_mut().pop();
        let key = self.th_mut().pop();
        set_table_value(self, &t, &key, &v)
    }

    pub fn get_field(&mut self, idx: i32, name: &str) -> LuaResult<()> {
        let t = self.index_value(idx);
        let key = self.new_string(name)?;
        let v = get_table_value(self, &t, &key)?;
        self.push(v)
    }

    pub fn set_field(&mut self, idx: i32, name: &str) -> LuaResult<()> {
        let t = self.index_value(idx);
        let key = self.new_string(name)?;
        let v = self.th_mut().pop();
        set_table_value(self, &t, &key, &v)
    }

    pub fn api_raw_get(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.index_value(idx);
        let key = self.th_mut().pop();
        let v = self.raw_get(t, &key);
        self.push(v)
    }

    pub fn api_raw_set(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.index_value(idx);
        let v = self.th_mut().pop();
        let key = self.th_mut().pop();
        self.raw_set(t, key, v)
    }

    pub fn api_raw_geti(&mut self, idx: i32, n: i64) -> LuaResult<()> {
        let t = self.index_value(idx);
        let Some(tid) = t.as_table_id() else {
            return Err(LuaError::BadTable);
        };
        let v = self.raw_geti(tid, n);
        self.push(v)
    }

    pub fn api_raw_seti(&mut self, idx: i32, n: i64) -> LuaResult<()> {
        let t = self.index_value(idx);
        let Some(tid) = t.as_table_id() else {
            return Err(LuaError::BadTable);
        };
        let v = self.th_mut().pop();
        self.raw_seti(tid, n, v);
        Ok(())
    }

    /// Table iteration step: pops a key, pushes the next key/value
    /// pair (or nothing at the end).
    pub fn api_next(&mut self, idx: i32) -> LuaResult<bool> {
        let t = self.index_value(idx);
        let Some(tid) = t.as_table_id() else {
            return Err(LuaError::BadTable);
        };
        let key = self.th_mut().pop();
        match self.pool.table(tid).next(&key) {
            Ok(Some((k, v))) => {
                self.check_slots(2)?;
                self.th_mut().push(k);
                self.th_mut().push(v);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(_) => Err(self.run_error("invalid key to 'next'".into())),
        }
    }

    // ============ Userdata & metatables ============

    /// Fresh userdata of `size` zeroed bytes, pushed on the stack.
    pub fn api_new_userdata(&mut self, size: usize, env: Option<TableId>) -> LuaResult<()> {
        self.check_gc()?;
        let v = self.new_userdata(vec![0u8; size], env)?;
        self.push(v)
    }

    /// Pop a table (or nil) and install it as the metatable of the
    /// value at `idx`.
    pub fn api_set_metatable(&mut self, idx: i32) -> LuaResult<()> {
        let obj = self.index_value(idx);
        let mt = self.th_mut().pop();
        let mt_id = if mt.is_nil() {
            None
        } else {
            match mt.as_table_id() {
                Some(t) => Some(t),
                None => return Err(LuaError::BadTable),
            }
        };
        if LuaVM::has_own_metatable(&obj) {
            self.set_metatable(&obj, mt_id)
        } else {
            // Base-type metatable.
            self.base_metatables[obj.ttype() as usize] = mt;
            Ok(())
        }
    }

    /// Push the metatable of the value at `idx`; false when absent.
    pub fn api_get_metatable(&mut self, idx: i32) -> LuaResult<bool> {
        let obj = self.index_value(idx);
        match self.get_metatable_of(&obj) {
            Some(mt) => {
                self.push(LuaValue::table(mt))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn api_get_uservalue(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.index_value(idx);
        let Some(u) = v.as_userdata_id() else {
            return Err(LuaError::BadTable);
        };
        let env = self.pool.userdata(u).env;
        match env {
            Some(t) => self.push(LuaValue::table(t)),
            None => self.push_nil(),
        }
    }

    pub fn api_set_uservalue(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.index_value(idx);
        let Some(u) = v.as_userdata_id() else {
            return Err(LuaError::BadTable);
        };
        let env = self.th_mut().pop();
        let env_id = if env.is_nil() {
            None
        } else {
            env.as_table_id()
        };
        self.pool.userdata_mut(u).env = env_id;
        if let Some(t) = env_id {
            gc::barrier_forward(
                &mut self.gc,
                &mut self.pool,
                GcId::Userdata(u),
                &LuaValue::table(t),
            );
        }
        Ok(())
    }

    // ============ Calls ============

    /// Unprotected call: function and `nargs` arguments on top. An
    /// error here escapes every protected boundary, so the installed
    /// panic handler (if any) sees it before the host does.
    pub fn api_call(&mut self, nargs: usize, nresults: i32) -> LuaResult<()> {
        let func_idx = self.th().top - nargs - 1;
        let r = self.do_call(func_idx, nresults, false);
        if let Err(e) = r {
            if e != LuaError::Yield {
                if let Some(panic) = self.panic {
                    let _ = panic(self);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Protected call; on error the error value replaces the function
    /// and its arguments.
    pub fn api_pcall(&mut self, nargs: usize, nresults: i32, errfunc: i32) -> LuaResult<()> {
        let func_idx = self.th().top - nargs - 1;
        let ef = if errfunc == 0 {
            0
        } else {
            self.index_to_slot(errfunc)
                .ok_or(LuaError::Runtime)?
        };
        self.pcall_boundary(func_idx, ef, |vm| vm.do_call(func_idx, nresults, false))
    }

    /// Protected call with a continuation: if the callee yields, the
    /// continuation resumes this frame later. Errors unwind to the
    /// recovery state saved here.
    pub fn api_pcallk(
        &mut self,
        nargs: usize,
        nresults: i32,
        errfunc: i32,
        k: Continuation,
        ctx: i64,
    ) -> LuaResult<()> {
        let func_idx = self.th().top - nargs - 1;
        let ef = if errfunc == 0 {
            0
        } else {
            self.index_to_slot(errfunc)
                .ok_or(LuaError::Runtime)?
        };
        if self.th().nny > 0 {
            // Not yieldable: plain protected call.
            return self.pcall_boundary(func_idx, ef, |vm| vm.do_call(func_idx, nresults, false));
        }
        // Record recovery state on the frame: a yield leaves it in
        // place so resume can find the pcall and run the continuation;
        // any other outcome clears it again.
        let old_errfunc = self.th().err_func;
        let old_allowhook = self.th().allow_hook;
        {
            let t = self.th_mut();
            let ci = t.current_ci_mut();
            ci.continuation = Some(k);
            ci.ctx = ctx;
            ci.extra = func_idx;
            ci.old_errfunc = old_errfunc;
            ci.old_allowhook = old_allowhook;
            ci.set_flag(CIST_YPCALL);
        }
        let r = self.pcall_boundary(func_idx, ef, |vm| vm.do_call(func_idx, nresults, true));
        if !matches!(r, Err(LuaError::Yield)) {
            let t = self.th_mut();
            let ci = t.current_ci_mut();
            ci.clear_flag(CIST_YPCALL);
            ci.continuation = None;
            t.err_func = old_errfunc;
        }
        r
    }

    // ============ Coroutines ============

    pub fn api_new_thread(&mut self) -> LuaResult<ThreadId> {
        self.check_gc()?;
        let v = self.new_thread()?;
        self.push(v)?;
        Ok(v.as_thread_id().unwrap())
    }

    pub fn thread_status(&self, co: ThreadId) -> ThreadStatus {
        self.pool.thread(co).status
    }

    // ============ GC control ============

    pub fn gc_stop(&mut self) {
        self.gc.running = false;
    }

    pub fn gc_restart(&mut self) {
        self.gc.running = true;
        self.gc.debt = 0;
    }

    pub fn gc_collect(&mut self) {
        self.collect_garbage_full(false);
    }

    pub fn gc_single_step(&mut self) -> LuaResult<()> {
        let running = self.gc.running;
        self.gc.running = true;
        self.gc.debt = self.gc.debt.max(1);
        let r = self.gc_step();
        self.gc.running = running;
        r
    }

    /// Heap size in bytes.
    pub fn gc_count(&self) -> usize {
        self.gc.total_bytes
    }

    pub fn gc_set_pause(&mut self, pct: i32) -> i32 {
        std::mem::replace(&mut self.gc.pause_pct, pct)
    }

    pub fn gc_set_stepmul(&mut self, pct: i32) -> i32 {
        std::mem::replace(&mut self.gc.stepmul_pct, pct)
    }

    pub fn gc_set_generational(&mut self) {
        let roots = self.gc_roots_snapshot();
        gc::change_mode(
            &mut self.gc,
            &mut self.pool,
            &mut self.strt,
            &roots,
            gc::GcKind::Generational,
        );
    }

    pub fn gc_set_incremental(&mut self) {
        let roots = self.gc_roots_snapshot();
        gc::change_mode(
            &mut self.gc,
            &mut self.pool,
            &mut self.strt,
            &roots,
            gc::GcKind::Incremental,
        );
    }

    fn gc_roots_snapshot(&self) -> gc::GcRoots {
        gc::GcRoots {
            main: self.main,
            current: self.current,
            registry: self.registry,
            base_metatables: self.base_metatables,
            mode_key: self.tm_names[TmKind::Mode as usize],
            anchors: self.anchors.clone(),
        }
    }

    // ============ Anchors ============

    /// Pin a value against collection while the host holds it outside
    /// any Lua stack. Returns a ticket for `unanchor`.
    pub fn anchor(&mut self, v: LuaValue) -> usize {
        self.anchors.push(v);
        self.anchors.len() - 1
    }

    pub fn unanchor(&mut self, ticket: usize) {
        if ticket < self.anchors.len() {
            self.anchors[ticket] = LuaValue::nil();
        }
        while matches!(self.anchors.last(), Some(v) if v.is_nil()) {
            self.anchors.pop();
        }
    }

    // ============ Upvalue inspection ============

    /// Name and value of the n-th upvalue of the closure at `idx`
    /// (1-based); host upvalues have empty names.
    pub fn get_upvalue(&mut self, idx: i32, n: usize) -> LuaResult<Option<String>> {
        let v = self.index_value(idx);
        let Some(cid) = v.as_closure_id() else {
            return Ok(None);
        };
        // Collect everything first; pushing may grow the stack.
        let found = match self.pool.closure(cid) {
            Closure::Host(hc) => {
                if n == 0 || n > hc.upvals.len() {
                    return Ok(None);
                }
                (hc.upvals[n - 1], None)
            }
            Closure::Lua(lc) => {
                if n == 0 || n > lc.upvals.len() {
                    return Ok(None);
                }
                let cell = lc.upvals[n - 1];
                let name = self
                    .pool
                    .proto(lc.proto)
                    .upvalues
                    .get(n - 1)
                    .map(|d| d.name);
                (self.upval_get(cell), name)
            }
        };
        self.push(found.0)?;
        Ok(Some(match found.1 {
            Some(s) => self.str_display(s),
            None => String::new(),
        }))
    }

    /// Pop a value into the n-th upvalue of the closure at `idx`.
    pub fn set_upvalue(&mut self, idx: i32, n: usize) -> LuaResult<bool> {
        let v = self.index_value(idx);
        let Some(cid) = v.as_closure_id() else {
            return Ok(false);
        };
        let val = self.th_mut().pop();
        let cell = match self.pool.closure_mut(cid) {
            Closure::Host(hc) => {
                if n == 0 || n > hc.upvals.len() {
                    return Ok(false);
                }
                hc.upvals[n - 1] = val;
                None
            }
            Closure::Lua(lc) => {
                if n == 0 || n > lc.upvals.len() {
                    return Ok(false);
                }
                Some(lc.upvals[n - 1])
            }
        };
        match cell {
            None => {
                gc::barrier_forward(&mut self.gc, &mut self.pool, GcId::Closure(cid), &val);
            }
            Some(cell) => self.upval_set(cell, val),
        }
        Ok(true)
    }

    /// Make upvalue `n1` of the closure at `idx1` share the cell of
    /// upvalue `n2` of the closure at `idx2`.
    pub fn upvalue_join(&mut self, idx1: i32, n1: usize, idx2: i32, n2: usize) -> LuaResult<()> {
        let c1 = self
            .index_value(idx1)
            .as_closure_id()
            .ok_or(LuaError::Runtime)?;
        let c2 = self
            .index_value(idx2)
            .as_closure_id()
            .ok_or(LuaError::Runtime)?;
        let cell = match self.pool.closure(c2) {
            Closure::Lua(lc) => *lc.upvals.get(n2 - 1).ok_or(LuaError::Runtime)?,
            Closure::Host(_) => return Err(LuaError::Runtime),
        };
        match self.pool.closure_mut(c1) {
            Closure::Lua(lc) => {
                let slot = lc.upvals.get_mut(n1 - 1).ok_or(LuaError::Runtime)?;
                *slot = cell;
            }
            Closure::Host(_) => return Err(LuaError::Runtime),
        }
        gc::barrier_forward(
            &mut self.gc,
            &mut self.pool,
            GcId::Closure(c1),
            &LuaValue::upval(cell),
        );
        Ok(())
    }
}

/// Re-export of the upvalue pseudo-index helper.
pub const fn upvalue_index(i: i32) -> i32 {
    lua_upvalueindex(i)
}
