// Coroutine library: creation, resume/yield plumbing between the two
// stacks, status reporting, and wrapped coroutines.

use crate::gc::ThreadId;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, ThreadStatus};
use crate::stdlib::{arg, arg_count, arg_error, check_function, ret1};

pub fn open(vm: &mut LuaVM) -> LuaResult<()> {
    let t = vm.new_table(0, 8)?;
    let fns: &[(&str, crate::lua_vm::CFunction)] = &[
        ("create", co_create),
        ("isyieldable", co_isyieldable),
        ("resume", co_resume),
        ("running", co_running),
        ("status", co_status),
        ("wrap", co_wrap),
        ("yield", co_yield),
    ];
    for &(name, f) in fns {
        let key = vm.new_string(name)?;
        vm.raw_set(t, key, LuaValue::cfunction(f))?;
    }
    vm.set_global("coroutine", t)?;
    Ok(())
}

fn check_thread(vm: &mut LuaVM, i: usize) -> LuaResult<ThreadId> {
    match arg(vm, i).as_thread_id() {
        Some(t) => Ok(t),
        None => {
            let got = arg(vm, i).type_name();
            Err(arg_error(vm, i, &format!("coroutine expected, got {}", got)))
        }
    }
}

fn co_create(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_function(vm, 1)?;
    let co_value = vm.new_thread()?;
    let co = co_value.as_thread_id().unwrap();
    // The function waits on the new stack for the first resume.
    vm.pool.thread_mut(co).check_stack(1)?;
    vm.pool.thread_mut(co).push(f);
    ret1(vm, co_value)
}

/// Move arguments to the coroutine, run it, and move results (or the
/// error) back. Returns the result count on the caller's stack, with
/// the leading status boolean only when `with_status` is set.
fn aux_resume(vm: &mut LuaVM, co: ThreadId, first_arg: usize, with_status: bool) -> LuaResult<usize> {
    let caller = vm.current;
    let nargs = vm.th().top - first_arg;
    // Transfer the arguments.
    {
        let mut args = Vec::with_capacity(nargs);
        for i in 0..nargs {
            args.push(vm.pool.thread(caller).stack[first_arg + i]);
        }
        vm.pool.thread_mut(caller).top = first_arg;
        let target = vm.pool.thread_mut(co);
        if target.check_stack(nargs).is_err() {
            return aux_failure(vm, co, with_status, "too many arguments to resume");
        }
        for a in args {
            vm.pool.thread_mut(co).push(a);
        }
    }
    match vm.resume_coroutine(co, nargs) {
        Ok(_suspended) => {
            // Results sit above the active frame's function slot.
            let from = vm.pool.thread(co).current_ci().func + 1;
            let to = vm.pool.thread(co).top;
            let nres = to - from;
            vm.check_slots(nres + 1)?;
            if with_status {
                vm.th_mut().push(LuaValue::boolean(true));
            }
            for i in 0..nres {
                let v = vm.pool.thread(co).stack[from + i];
                vm.th_mut().push(v);
            }
            vm.pool.thread_mut(co).top = from;
            Ok(nres + with_status as usize)
        }
        Err(_) => {
            // Error value on the coroutine's top.
            let t = vm.pool.thread_mut(co);
            t.top -= 1;
            let err = t.stack[t.top];
            if with_status {
                vm.check_slots(2)?;
                vm.th_mut().push(LuaValue::boolean(false));
                vm.th_mut().push(err);
                Ok(2)
            } else {
                // wrap: re-raise in the caller.
                Err(vm.raise_value(err))
            }
        }
    }
}

fn aux_failure(
    vm: &mut LuaVM,
    _co: ThreadId,
    with_status: bool,
    msg: &str,
) -> LuaResult<usize> {
    let err = vm.new_string(msg)?;
    if with_status {
        vm.check_slots(2)?;
        vm.th_mut().push(LuaValue::boolean(false));
        vm.th_mut().push(err);
        Ok(2)
    } else {
        Err(vm.raise_value(err))
    }
}

fn co_resume(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = check_thread(vm, 1)?;
    let base = crate::stdlib::arg_base(vm);
    aux_resume(vm, co, base + 1, true)
}

fn co_yield(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = arg_count(vm);
    vm.yield_values(n, None, 0)
}

fn co_status(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = check_thread(vm, 1)?;
    let status = if co == vm.current {
        "running"
    } else {
        match vm.pool.thread(co).status {
            ThreadStatus::Yielded => "suspended",
            ThreadStatus::Ok => {
                if vm.pool.thread(co).ci_depth > 1 {
                    "normal" // resumed another coroutine
                } else {
                    "suspended" // not started yet
                }
            }
            ThreadStatus::Dead | ThreadStatus::Error(_) => "dead",
        }
    };
    let s = vm.new_string(status)?;
    ret1(vm, s)
}

fn co_running(vm: &mut LuaVM) -> LuaResult<usize> {
    let current = vm.current;
    let v = LuaValue::thread(current);
    vm.push(v)?;
    vm.push(LuaValue::boolean(current == vm.main))?;
    Ok(2)
}

fn co_isyieldable(vm: &mut LuaVM) -> LuaResult<usize> {
    // Yieldable when not in the main coroutine and no non-yieldable
    // boundary is active. The running host frame (this function) does
    // not count.
    let yieldable = vm.current != vm.main && vm.th().nny == 0;
    ret1(vm, LuaValue::boolean(yieldable))
}

fn wrap_aux(vm: &mut LuaVM) -> LuaResult<usize> {
    // The wrapped coroutine travels as the closure's upvalue.
    let co_value = vm.index_value(crate::lua_vm::lua_limits::lua_upvalueindex(1));
    let Some(co) = co_value.as_thread_id() else {
        return Err(LuaError::Runtime);
    };
    let base = crate::stdlib::arg_base(vm);
    aux_resume(vm, co, base, false)
}

fn co_wrap(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_function(vm, 1)?;
    let co_value = vm.new_thread()?;
    let co = co_value.as_thread_id().unwrap();
    vm.pool.thread_mut(co).check_stack(1)?;
    vm.pool.thread_mut(co).push(f);
    let wrapper = vm.new_host_closure(wrap_aux, vec![co_value])?;
    ret1(vm, wrapper)
}
