// Indexed access with `__index` / `__newindex` chains.

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::{call_tm_3, call_tm_res};
use crate::lua_vm::lua_limits::MAXTAGLOOP;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, TmKind};

/// `t[key]` with metamethods. A table miss consults `__index`: a
/// function is called as `(t, key)`, a table restarts the lookup.
/// Chains are bounded to keep `__index` cycles from hanging the VM.
pub fn get_table_value(vm: &mut LuaVM, t: &LuaValue, key: &LuaValue) -> LuaResult<LuaValue> {
    let mut t = *t;
    for _ in 0..MAXTAGLOOP {
        if let Some(tid) = t.as_table_id() {
            let v = vm.pool.table(tid).get(key);
            if !v.is_nil() {
                return Ok(v);
            }
            let tm = vm.get_metamethod(&t, TmKind::Index);
            if tm.is_nil() {
                return Ok(LuaValue::nil());
            }
            if tm.is_function() {
                return call_tm_res(vm, tm, t, *key);
            }
            t = tm;
        } else {
            let tm = vm.get_metamethod(&t, TmKind::Index);
            if tm.is_nil() {
                let e = vm.type_error(&t, "index");
                return Err(if e == LuaError::Runtime {
                    LuaError::BadTable
                } else {
                    e
                });
            }
            if tm.is_function() {
                return call_tm_res(vm, tm, t, *key);
            }
            t = tm;
        }
    }
    let _ = vm.run_error("'__index' chain too long; possible loop".into());
    Err(LuaError::MetaLoop)
}

/// `t[key] = val` with metamethods. An existing (non-nil) entry
/// suppresses `__newindex`.
pub fn set_table_value(
    vm: &mut LuaVM,
    t: &LuaValue,
    key: &LuaValue,
    val: &LuaValue,
) -> LuaResult<()> {
    let mut t = *t;
    for _ in 0..MAXTAGLOOP {
        if let Some(tid) = t.as_table_id() {
            let existing = vm.pool.table(tid).get(key);
            if !existing.is_nil() {
                return vm.raw_set(t, *key, *val);
            }
            let tm = vm.get_metamethod(&t, TmKind::NewIndex);
            if tm.is_nil() {
                return vm.raw_set(t, *key, *val);
            }
            if tm.is_function() {
                return call_tm_3(vm, tm, t, *key, *val);
            }
            if !tm.is_table() {
                let _ = vm.run_error("'__newindex' is not a function or table".into());
                return Err(LuaError::BadIndexMeta);
            }
            t = tm;
        } else {
            let tm = vm.get_metamethod(&t, TmKind::NewIndex);
            if tm.is_nil() {
                let e = vm.type_error(&t, "index");
                return Err(if e == LuaError::Runtime {
                    LuaError::BadTable
                } else {
                    e
                });
            }
            if tm.is_function() {
                return call_tm_3(vm, tm, t, *key, *val);
            }
            if !tm.is_table() {
                let _ = vm.run_error("'__newindex' is not a function or table".into());
                return Err(LuaError::BadIndexMeta);
            }
            t = tm;
        }
    }
    let _ = vm.run_error("'__newindex' chain too long; possible loop".into());
    Err(LuaError::MetaLoop)
}
