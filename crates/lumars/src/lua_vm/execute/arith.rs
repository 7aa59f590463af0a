// Arithmetic, comparison, and length operations with metamethod
// fallbacks.

use crate::lua_value::conversions::{number_to_str, str_to_number};
use crate::lua_value::LuaValue;
use crate::lua_vm::execute::call_tm_res;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, TmKind};

/// Numeric coercion: numbers pass through, strings parse lexically.
pub fn to_number_coerce(vm: &LuaVM, v: &LuaValue) -> Option<f64> {
    if let Some(n) = v.as_number() {
        return Some(n);
    }
    let sid = v.as_string_id()?;
    let bytes = vm.pool.string(sid).as_bytes();
    let text = std::str::from_utf8(bytes).ok()?;
    str_to_number(text)
}

/// String coercion for concatenation: converts a number in place to
/// its canonical text.
pub fn to_string_coerce(vm: &mut LuaVM, v: &LuaValue) -> LuaResult<Option<LuaValue>> {
    if v.is_string() {
        return Ok(Some(*v));
    }
    if let Some(n) = v.as_number() {
        let s = number_to_str(n);
        return Ok(Some(vm.new_string(&s)?));
    }
    Ok(None)
}

#[inline(always)]
pub fn raw_arith(tm: TmKind, a: f64, b: f64) -> f64 {
    match tm {
        TmKind::Add => a + b,
        TmKind::Sub => a - b,
        TmKind::Mul => a * b,
        TmKind::Div => a / b,
        TmKind::Mod => {
            // Result keeps the divisor's sign.
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
        TmKind::Pow => a.powf(b),
        TmKind::Unm => -a,
        _ => unreachable!("not an arithmetic tag method"),
    }
}

/// Slow arithmetic path: lexical number coercion, then the metamethod
/// of the first operand or the second.
pub fn arith(
    vm: &mut LuaVM,
    a: &LuaValue,
    b: &LuaValue,
    tm: TmKind,
) -> LuaResult<LuaValue> {
    if let (Some(x), Some(y)) = (to_number_coerce(vm, a), to_number_coerce(vm, b)) {
        return Ok(LuaValue::number(raw_arith(tm, x, y)));
    }
    let meta = vm.get_binop_tm(a, b, tm);
    if meta.is_nil() {
        return Err(arith_error(vm, a, b));
    }
    call_tm_res(vm, meta, *a, *b)
}

/// Report the operand that refuses numeric coercion.
pub fn arith_error(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaError {
    let bad = if to_number_coerce(vm, a).is_none() { a } else { b };
    let bad = *bad;
    let e = vm.type_error(&bad, "perform arithmetic on");
    match e {
        LuaError::Runtime => LuaError::BadMath,
        other => other,
    }
}

/// Primitive-or-`__eq` equality. The metamethod fires only when both
/// operands are tables or both are userdata, share a tag, and differ
/// by identity; both operands must agree on the handler.
pub fn equal_obj(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if a.rawtt() != b.rawtt() {
        return Ok(false);
    }
    if a.raw_eq(b) {
        return Ok(true);
    }
    if !(a.is_table() || a.is_userdata()) {
        return Ok(false);
    }
    let tm1 = vm.get_metamethod(a, TmKind::Eq);
    if tm1.is_nil() {
        return Ok(false);
    }
    let tm2 = vm.get_metamethod(b, TmKind::Eq);
    if !tm1.raw_eq(&tm2) {
        return Ok(false);
    }
    let r = call_tm_res(vm, tm1, *a, *b)?;
    Ok(r.is_truthy())
}

fn string_less(vm: &LuaVM, a: &LuaValue, b: &LuaValue) -> (bool, bool) {
    let sa = vm.pool.string(a.as_string_id().unwrap()).as_bytes();
    let sb = vm.pool.string(b.as_string_id().unwrap()).as_bytes();
    (sa < sb, sa <= sb)
}

pub fn less_than(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(x < y);
    }
    if a.is_string() && b.is_string() {
        return Ok(string_less(vm, a, b).0);
    }
    let tm = vm.get_binop_tm(a, b, TmKind::Lt);
    if tm.is_nil() {
        return Err(order_error(vm, a, b));
    }
    let r = call_tm_res(vm, tm, *a, *b)?;
    Ok(r.is_truthy())
}

pub fn less_equal(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(x <= y);
    }
    if a.is_string() && b.is_string() {
        return Ok(string_less(vm, a, b).1);
    }
    let tm = vm.get_binop_tm(a, b, TmKind::Le);
    if !tm.is_nil() {
        let r = call_tm_res(vm, tm, *a, *b)?;
        return Ok(r.is_truthy());
    }
    // No __le: fall back to not (b < a).
    let tm = vm.get_binop_tm(a, b, TmKind::Lt);
    if tm.is_nil() {
        return Err(order_error(vm, a, b));
    }
    let r = call_tm_res(vm, tm, *b, *a)?;
    Ok(!r.is_truthy())
}

pub fn order_error(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaError {
    let (t1, t2) = (a.type_name(), b.type_name());
    if t1 == t2 {
        vm.run_error(format!("attempt to compare two {} values", t1))
    } else {
        vm.run_error(format!("attempt to compare {} with {}", t1, t2))
    }
}

/// The `#` operator: strings report byte length, tables consult
/// `__len` then return a border.
pub fn object_length(vm: &mut LuaVM, v: &LuaValue) -> LuaResult<LuaValue> {
    if let Some(sid) = v.as_string_id() {
        let n = vm.pool.string(sid).as_bytes().len();
        return Ok(LuaValue::number(n as f64));
    }
    if let Some(tid) = v.as_table_id() {
        let tm = vm.get_metamethod(v, TmKind::Len);
        if !tm.is_nil() {
            return call_tm_res(vm, tm, *v, *v);
        }
        return Ok(LuaValue::number(vm.pool.table(tid).length() as f64));
    }
    let tm = vm.get_metamethod(v, TmKind::Len);
    if !tm.is_nil() {
        return call_tm_res(vm, tm, *v, *v);
    }
    Err(vm.type_error(v, "get length of"))
}
