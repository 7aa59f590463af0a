// Base library subset: type inspection, conversions, raw table
// access, iteration, metatables, protected calls, error raising, GC
// control, and load.

use crate::compiler;
use crate::lua_value::LuaValue;
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};
use crate::stdlib::{arg, arg_count, arg_error, check_function, check_number, check_table, ret1};

pub fn open(vm: &mut LuaVM) -> LuaResult<()> {
    let fns: &[(&str, crate::lua_vm::CFunction)] = &[
        ("assert", lua_assert),
        ("collectgarbage", lua_collectgarbage),
        ("error", lua_error),
        ("getmetatable", lua_getmetatable),
        ("ipairs", lua_ipairs),
        ("load", lua_load),
        ("next", lua_next),
        ("pairs", lua_pairs),
        ("pcall", lua_pcall),
        ("print", lua_print),
        ("rawequal", lua_rawequal),
        ("rawget", lua_rawget),
        ("rawlen", lua_rawlen),
        ("rawset", lua_rawset),
        ("select", lua_select),
        ("setmetatable", lua_setmetatable),
        ("tonumber", lua_tonumber),
        ("tostring", lua_tostring),
        ("type", lua_type),
        ("xpcall", lua_xpcall),
    ];
    for &(name, f) in fns {
        vm.set_global(name, LuaValue::cfunction(f))?;
    }
    let g = vm.globals;
    vm.set_global("_G", g)?;
    let version = vm.new_string("Lua 5.2")?;
    vm.set_global("_VERSION", version)?;
    Ok(())
}

/// Shared `tostring` coercion honoring `__tostring`.
pub fn tostring_value(vm: &mut LuaVM, v: LuaValue) -> LuaResult<LuaValue> {
    if let Some(mt) = vm.get_metatable_of(&v) {
        let key = vm.new_string("__tostring")?;
        let mm = vm.pool.table(mt).get(&key);
        if mm.is_function() {
            let r = crate::lua_vm::execute::call_tm_res(vm, mm, v, LuaValue::nil())?;
            if !r.is_string() {
                return Err(vm.run_error("'__tostring' must return a string".into()));
            }
            return Ok(r);
        }
    }
    let text = vm.value_display(&v);
    vm.new_string(&text)
}

fn lua_print(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = arg_count(vm);
    let mut line = String::new();
    for i in 1..=n {
        let s = tostring_value(vm, arg(vm, i))?;
        if i > 1 {
            line.push('\t');
        }
        line.push_str(&vm.str_display(s.as_string_id().unwrap()));
    }
    println!("{}", line);
    Ok(0)
}

fn lua_type(vm: &mut LuaVM) -> LuaResult<usize> {
    if arg_count(vm) == 0 {
        return Err(arg_error(vm, 1, "value expected"));
    }
    let name = arg(vm, 1).type_name();
    let v = vm.new_string(name)?;
    ret1(vm, v)
}

fn lua_tostring(vm: &mut LuaVM) -> LuaResult<usize> {
    if arg_count(vm) == 0 {
        return Err(arg_error(vm, 1, "value expected"));
    }
    let s = tostring_value(vm, arg(vm, 1))?;
    ret1(vm, s)
}

fn lua_tonumber(vm: &mut LuaVM) -> LuaResult<usize> {
    if arg_count(vm) < 2 || arg(vm, 2).is_nil() {
        let v = arg(vm, 1);
        match crate::lua_vm::execute::arith::to_number_coerce(vm, &v) {
            Some(n) => return ret1(vm, LuaValue::number(n)),
            None => return ret1(vm, LuaValue::nil()),
        }
    }
    // Explicit base conversion: digits only.
    let base = check_number(vm, 2)? as u32;
    if !(2..=36).contains(&base) {
        return Err(arg_error(vm, 2, "base out of range"));
    }
    let text = crate::stdlib::check_str(vm, 1)?;
    let t = text.trim();
    let mut value: f64 = 0.0;
    let mut any = false;
    let (neg, digits) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    for c in digits.chars() {
        let d = c.to_digit(36);
        match d {
            Some(d) if d < base => {
                value = value * base as f64 + d as f64;
                any = true;
            }
            _ => return ret1(vm, LuaValue::nil()),
        }
    }
    if !any {
        return ret1(vm, LuaValue::nil());
    }
    ret1(vm, LuaValue::number(if neg { -value } else { value }))
}

fn lua_rawequal(vm: &mut LuaVM) -> LuaResult<usize> {
    let eq = arg(vm, 1).raw_eq(&arg(vm, 2));
    ret1(vm, LuaValue::boolean(eq))
}

fn lua_rawlen(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = arg(vm, 1);
    if let Some(t) = v.as_table_id() {
        let n = vm.pool.table(t).length();
        return ret1(vm, LuaValue::number(n as f64));
    }
    if let Some(s) = v.as_string_id() {
        let n = vm.pool.string(s).as_bytes().len();
        return ret1(vm, LuaValue::number(n as f64));
    }
    Err(arg_error(vm, 1, "table or string expected"))
}

fn lua_rawget(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1)?;
    let v = vm.pool.table(t).get(&arg(vm, 2));
    ret1(vm, v)
}

fn lua_rawset(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1)?;
    let key = arg(vm, 2);
    let val = arg(vm, 3);
    vm.raw_set(LuaValue::table(t), key, val)?;
    ret1(vm, arg(vm, 1))
}

fn lua_next(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1)?;
    let key = arg(vm, 2);
    match vm.pool.table(t).next(&key) {
        Ok(Some((k, v))) => {
            vm.push(k)?;
            vm.push(v)?;
            Ok(2)
        }
        Ok(None) => ret1(vm, LuaValue::nil()),
        Err(_) => Err(vm.run_error("invalid key to 'next'".into())),
    }
}

fn lua_pairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = arg(vm, 1);
    // __pairs overrides the default iteration triple.
    if let Some(mt) = vm.get_metatable_of(&v) {
        let key = vm.new_string("__pairs")?;
        let mm = vm.pool.table(mt).get(&key);
        if mm.is_function() {
            let top = vm.th().top;
            vm.check_slots(2)?;
            vm.th_mut().push(mm);
            vm.th_mut().push(v);
            vm.do_call(top, 3, false)?;
            return Ok(3);
        }
    }
    check_table(vm, 1)?;
    vm.push(LuaValue::cfunction(lua_next))?;
    vm.push(v)?;
    vm.push_nil()?;
    Ok(3)
}

fn ipairs_aux(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1)?;
    let i = check_number(vm, 2)? + 1.0;
    let v = vm.pool.table(t).get_int(i as i64);
    if v.is_nil() {
        ret1(vm, LuaValue::nil())
    } else {
        vm.push(LuaValue::number(i))?;
        vm.push(v)?;
        Ok(2)
    }
}

fn lua_ipairs(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 1)?;
    vm.push(LuaValue::cfunction(ipairs_aux))?;
    vm.push(arg(vm, 1))?;
    vm.push(LuaValue::number(0.0))?;
    Ok(3)
}

fn lua_select(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = arg_count(vm);
    let first = arg(vm, 1);
    if let Some(s) = first.as_string_id() {
        if vm.pool.string(s).as_bytes() == b"#" {
            return ret1(vm, LuaValue::number((n - 1) as f64));
        }
    }
    let i = check_number(vm, 1)?;
    let i = if i < 0.0 {
        let i = n as f64 + i;
        if i < 1.0 {
            return Err(arg_error(vm, 1, "index out of range"));
        }
        i as usize
    } else if i == 0.0 {
        return Err(arg_error(vm, 1, "index out of range"));
    } else {
        i as usize
    };
    if i >= n {
        return Ok(0);
    }
    // Arguments i+1 .. n are already in place at the top.
    let base = crate::stdlib::arg_base(vm);
    let from = base + i;
    let top = vm.th().top;
    let count = top - from;
    vm.check_slots(count)?;
    for j in 0..count {
        let v = vm.th().stack[from + j];
        vm.th_mut().push(v);
    }
    Ok(count)
}

fn lua_error(vm: &mut LuaVM) -> LuaResult<usize> {
    let mut msg = arg(vm, 1);
    let level = if arg_count(vm) >= 2 {
        check_number(vm, 2)? as i64
    } else {
        1
    };
    if msg.is_string() && level > 0 {
        // Prefix position information at the given level.
        let prefix = vm.position_prefix_at_level(level as usize);
        if !prefix.is_empty() {
            let text = vm.str_display(msg.as_string_id().unwrap());
            msg = vm.new_string(&format!("{}{}", prefix, text))?;
        }
    }
    Err(vm.raise_value(msg))
}

fn lua_assert(vm: &mut LuaVM) -> LuaResult<usize> {
    if arg_count(vm) == 0 {
        return Err(arg_error(vm, 1, "value expected"));
    }
    if arg(vm, 1).is_falsy() {
        let msg = arg(vm, 2);
        if msg.is_nil() {
            return Err(vm.run_error("assertion failed!".into()));
        }
        return Err(vm.raise_value(msg));
    }
    // Return all arguments.
    Ok(arg_count(vm))
}

/// Shared tail for pcall/xpcall: insert the status boolean before the
/// results (or the error value).
fn finish_pcall(vm: &mut LuaVM, func_idx: usize, ok: bool) -> LuaResult<usize> {
    let top = vm.th().top;
    vm.check_slots(1)?;
    let t = vm.th_mut();
    let mut i = top;
    while i > func_idx {
        t.stack[i] = t.stack[i - 1];
        i -= 1;
    }
    t.stack[func_idx] = LuaValue::boolean(ok);
    t.top = top + 1;
    Ok(t.top - func_idx)
}

fn pcall_cont(vm: &mut LuaVM, _ctx: i64) -> LuaResult<usize> {
    // Reached after a yield inside the protected call: the saved
    // status tells whether an error was recovered.
    let (status, func_idx) = {
        let ci = vm.th().current_ci();
        (ci.status, ci.extra)
    };
    vm.th_mut().current_ci_mut().status = 0;
    finish_pcall(vm, func_idx, status == 0)
}

fn lua_pcall(vm: &mut LuaVM) -> LuaResult<usize> {
    if arg_count(vm) == 0 {
        return Err(arg_error(vm, 1, "value expected"));
    }
    let base = crate::stdlib::arg_base(vm);
    let nargs = arg_count(vm) - 1;
    let func_idx = base; // protected function sits in slot 1
    match vm.api_pcallk(nargs, LUA_MULTRET, 0, pcall_cont, 0) {
        Ok(()) => finish_pcall(vm, func_idx, true),
        Err(LuaError::Yield) => Err(LuaError::Yield),
        Err(_) => finish_pcall(vm, func_idx, false),
    }
}

fn lua_xpcall(vm: &mut LuaVM) -> LuaResult<usize> {
    if arg_count(vm) < 2 {
        return Err(arg_error(vm, 2, "value expected"));
    }
    check_function(vm, 2)?;
    let base = crate::stdlib::arg_base(vm);
    // Exchange function and handler so the handler sits below the
    // protected call.
    {
        let t = vm.th_mut();
        t.stack.swap(base, base + 1);
    }
    let nargs = arg_count(vm) - 2;
    let func_idx = base + 1;
    match vm.api_pcallk(nargs, LUA_MULTRET, 1, pcall_cont, 0) {
        Ok(()) => finish_pcall(vm, func_idx, true),
        Err(LuaError::Yield) => Err(LuaError::Yield),
        Err(_) => finish_pcall(vm, func_idx, false),
    }
}

fn lua_getmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = arg(vm, 1);
    let Some(mt) = vm.get_metatable_of(&v) else {
        return ret1(vm, LuaValue::nil());
    };
    // A __metatable field shields the real metatable.
    let key = vm.new_string("__metatable")?;
    let guard = vm.pool.table(mt).get(&key);
    if !guard.is_nil() {
        return ret1(vm, guard);
    }
    ret1(vm, LuaValue::table(mt))
}

fn lua_setmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1)?;
    let mt = arg(vm, 2);
    if !mt.is_nil() && !mt.is_table() {
        return Err(arg_error(vm, 2, "nil or table expected"));
    }
    if let Some(old) = vm.pool.table(t).metatable {
        let key = vm.new_string("__metatable")?;
        if !vm.pool.table(old).get(&key).is_nil() {
            return Err(vm.run_error("cannot change a protected metatable".into()));
        }
    }
    let obj = arg(vm, 1);
    vm.set_metatable(&obj, mt.as_table_id())?;
    ret1(vm, obj)
}

fn lua_collectgarbage(vm: &mut LuaVM) -> LuaResult<usize> {
    let opt = if arg_count(vm) == 0 || arg(vm, 1).is_nil() {
        "collect".to_string()
    } else {
        crate::stdlib::check_str(vm, 1)?
    };
    match opt.as_str() {
        "collect" => {
            vm.gc_collect();
            ret1(vm, LuaValue::number(0.0))
        }
        "stop" => {
            vm.gc_stop();
            ret1(vm, LuaValue::number(0.0))
        }
        "restart" => {
            vm.gc_restart();
            ret1(vm, LuaValue::number(0.0))
        }
        "count" => {
            let kb = vm.gc_count() as f64 / 1024.0;
            ret1(vm, LuaValue::number(kb))
        }
        "step" => {
            vm.gc_single_step()?;
            ret1(vm, LuaValue::boolean(vm.gc.state == crate::gc::GcState::Pause))
        }
        "setpause" => {
            let v = check_number(vm, 2)? as i32;
            let old = vm.gc_set_pause(v);
            ret1(vm, LuaValue::number(old as f64))
        }
        "setstepmul" => {
            let v = check_number(vm, 2)? as i32;
            let old = vm.gc_set_stepmul(v);
            ret1(vm, LuaValue::number(old as f64))
        }
        "isrunning" => ret1(vm, LuaValue::boolean(vm.gc.running)),
        "generational" => {
            vm.gc_set_generational();
            ret1(vm, LuaValue::number(0.0))
        }
        "incremental" => {
            vm.gc_set_incremental();
            ret1(vm, LuaValue::number(0.0))
        }
        _ => Err(arg_error(vm, 1, "invalid option")),
    }
}

fn lua_load(vm: &mut LuaVM) -> LuaResult<usize> {
    let chunk = arg(vm, 1);
    let chunkname = if arg_count(vm) >= 2 && !arg(vm, 2).is_nil() {
        crate::stdlib::check_str(vm, 2)?
    } else if chunk.is_string() {
        let s = vm.str_display(chunk.as_string_id().unwrap());
        format!("={}", if s.len() > 40 { "chunk".to_string() } else { s })
    } else {
        "=(load)".to_string()
    };
    let result = if let Some(sid) = chunk.as_string_id() {
        let source = vm.pool.string(sid).as_bytes().to_vec();
        let z = compiler::lexer::Zio::from_slice(&source);
        compiler::compile_reader(vm, z, &chunkname)
    } else if chunk.is_function() {
        // Reader function: called repeatedly for the next piece until
        // it returns nil or an empty string.
        let mut pieces: Vec<Vec<u8>> = Vec::new();
        loop {
            let top = vm.th().top;
            vm.check_slots(1)?;
            vm.th_mut().push(chunk);
            vm.do_call(top, 1, false)?;
            let piece = vm.th_mut().pop();
            if piece.is_nil() {
                break;
            }
            let Some(id) = piece.as_string_id() else {
                return Err(vm.run_error("reader function must return a string".into()));
            };
            let bytes = vm.pool.string(id).as_bytes().to_vec();
            if bytes.is_empty() {
                break;
            }
            pieces.push(bytes);
        }
        let mut iter = pieces.into_iter();
        let z = compiler::lexer::Zio::new(Box::new(move || iter.next()));
        compiler::compile_reader(vm, z, &chunkname)
    } else {
        return Err(arg_error(vm, 1, "string or function expected"));
    };
    match result {
        Ok(proto) => {
            // Main chunks get the globals table as their _ENV upvalue.
            let globals = vm.globals;
            let env = vm.new_upval_closed(globals)?;
            let f = vm.new_lua_closure(proto, vec![env])?;
            ret1(vm, f)
        }
        Err(_) => {
            let err = vm.th().err_obj;
            vm.th_mut().err_obj = LuaValue::nil();
            vm.push_nil()?;
            vm.push(err)?;
            Ok(2)
        }
    }
}
