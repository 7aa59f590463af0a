// Concatenation: batches contiguous string/number operands on the
// stack right-to-left into one interned result; a non-convertible
// operand hands the pair to `__concat`.

use crate::lua_value::conversions::number_to_str;
use crate::lua_value::LuaValue;
use crate::lua_vm::execute::arith::to_string_coerce;
use crate::lua_vm::execute::call_tm_res;
use crate::lua_vm::{LuaResult, LuaVM, TmKind};

fn concatenable(v: &LuaValue) -> bool {
    v.is_string() || v.is_number()
}

/// Concatenate the `total` values ending at the stack top, leaving the
/// single result in their first slot.
pub fn concat(vm: &mut LuaVM, mut total: usize) -> LuaResult<()> {
    debug_assert!(total >= 2);
    while total > 1 {
        let th = vm.current;
        let top = vm.pool.thread(th).top;
        let b = vm.pool.thread(th).stack[top - 2];
        let c = vm.pool.thread(th).stack[top - 1];
        if concatenable(&b) && concatenable(&c) {
            // Gather every convertible operand below the pair.
            let mut n = 2;
            while n < total {
                let v = vm.pool.thread(th).stack[top - n - 1];
                if !concatenable(&v) {
                    break;
                }
                n += 1;
            }
            let mut buf: Vec<u8> = Vec::new();
            for i in 0..n {
                let v = vm.pool.thread(th).stack[top - n + i];
                if let Some(sid) = v.as_string_id() {
                    buf.extend_from_slice(vm.pool.string(sid).as_bytes());
                } else {
                    buf.extend_from_slice(number_to_str(v.as_number_raw()).as_bytes());
                }
            }
            let s = vm.new_string_bytes(&buf)?;
            let t = vm.pool.thread_mut(th);
            t.stack[top - n] = s;
            t.top = top - n + 1;
            total -= n - 1;
        } else {
            let tm = vm.get_binop_tm(&b, &c, TmKind::Concat);
            if tm.is_nil() {
                // Report the operand that cannot take part.
                let bad = if to_string_coerce(vm, &b)?.is_none() { b } else { c };
                return Err(vm.type_error(&bad, "concatenate"));
            }
            let r = call_tm_res(vm, tm, b, c)?;
            let t = vm.pool.thread_mut(th);
            t.stack[top - 2] = r;
            t.top = top - 1;
            total -= 1;
        }
    }
    Ok(())
}
