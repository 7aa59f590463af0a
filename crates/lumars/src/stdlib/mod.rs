// Core library functions: just enough surface to drive the runtime
// from scripts (assertions, protected calls, metatables, iteration,
// GC control, coroutines). Everything here is an ordinary consumer of
// the embedding API.

pub mod basic;
pub mod coroutine;

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub fn open_libs(vm: &mut LuaVM) -> LuaResult<()> {
    basic::open(vm)?;
    coroutine::open(vm)?;
    Ok(())
}

// ============ Argument helpers ============

#[inline(always)]
pub fn arg_base(vm: &LuaVM) -> usize {
    vm.th().current_ci().base
}

#[inline(always)]
pub fn arg_count(vm: &LuaVM) -> usize {
    vm.th().top - arg_base(vm)
}

/// 1-based argument access; absent arguments read as nil.
pub fn arg(vm: &LuaVM, i: usize) -> LuaValue {
    let b = arg_base(vm);
    let slot = b + i - 1;
    if slot < vm.th().top {
        vm.th().stack[slot]
    } else {
        LuaValue::nil()
    }
}

pub fn arg_error(vm: &mut LuaVM, i: usize, msg: &str) -> LuaError {
    vm.run_error(format!("bad argument #{} ({})", i, msg))
}

pub fn check_table(vm: &mut LuaVM, i: usize) -> LuaResult<crate::gc::TableId> {
    match arg(vm, i).as_table_id() {
        Some(t) => Ok(t),
        None => {
            let got = arg(vm, i).type_name();
            Err(arg_error(vm, i, &format!("table expected, got {}", got)))
        }
    }
}

pub fn check_function(vm: &mut LuaVM, i: usize) -> LuaResult<LuaValue> {
    let v = arg(vm, i);
    if v.is_function() {
        Ok(v)
    } else {
        let got = v.type_name();
        Err(arg_error(vm, i, &format!("function expected, got {}", got)))
    }
}

pub fn check_number(vm: &mut LuaVM, i: usize) -> LuaResult<f64> {
    match crate::lua_vm::execute::arith::to_number_coerce(vm, &arg(vm, i)) {
        Some(n) => Ok(n),
        None => {
            let got = arg(vm, i).type_name();
            Err(arg_error(vm, i, &format!("number expected, got {}", got)))
        }
    }
}

pub fn check_str(vm: &mut LuaVM, i: usize) -> LuaResult<String> {
    let v = arg(vm, i);
    if let Some(id) = v.as_string_id() {
        return Ok(vm.str_display(id));
    }
    if let Some(n) = v.as_number() {
        return Ok(crate::lua_value::conversions::number_to_str(n));
    }
    let got = v.type_name();
    Err(arg_error(vm, i, &format!("string expected, got {}", got)))
}

/// Push return values: helper to keep the CFunction bodies terse.
pub fn ret1(vm: &mut LuaVM, v: LuaValue) -> LuaResult<usize> {
    vm.push(v)?;
    Ok(1)
}
