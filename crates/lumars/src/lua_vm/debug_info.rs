// Error-message construction: chunk ids, source positions, and
// recovery of source-level names for values in registers and upvalues
// by reverse symbolic execution of the active prototype.

use crate::gc::{Closure, ProtoId, StringId};
use crate::lua_value::LuaValue;
use crate::lua_vm::opcode::*;
use crate::lua_vm::{LuaError, LuaVM};

/// Maximum size of a chunk description in messages.
const IDSIZE: usize = crate::lua_vm::lua_limits::LUA_IDSIZE;

/// Render a chunk name for messages: `=name` verbatim, `@file` as a
/// file name trimmed with a `...` prefix, anything else as
/// `[string "first line..."]`.
pub fn chunk_id(source: &[u8]) -> String {
    let budget = IDSIZE - 1;
    match source.first() {
        Some(b'=') => {
            let body = &source[1..];
            let take = body.len().min(budget);
            String::from_utf8_lossy(&body[..take]).into_owned()
        }
        Some(b'@') => {
            let body = &source[1..];
            if body.len() <= budget {
                String::from_utf8_lossy(body).into_owned()
            } else {
                let tail = &body[body.len() - (budget - 3)..];
                format!("...{}", String::from_utf8_lossy(tail))
            }
        }
        _ => {
            let pre = "[string \"";
            let pos = "\"]";
            let rets = "...";
            let inner_budget = budget - pre.len() - pos.len() - rets.len();
            let nl = source.iter().position(|&b| b == b'\n');
            let (mut body, mut truncated) = match nl {
                Some(p) => (&source[..p], true),
                None => (source, false),
            };
            if body.len() > inner_budget {
                body = &body[..inner_budget];
                truncated = true;
            }
            let body = String::from_utf8_lossy(body);
            if truncated {
                format!("{}{}{}{}", pre, body, rets, pos)
            } else {
                format!("{}{}{}", pre, body, pos)
            }
        }
    }
}

/// Name of the `local_number`-th active local at `pc`, from the debug
/// records.
fn get_local_name(vm: &LuaVM, proto: ProtoId, local_number: u32, pc: usize) -> Option<StringId> {
    let p = vm.pool.proto(proto);
    let mut n = local_number as i64;
    for lv in &p.locvars {
        if (lv.startpc as usize) <= pc && pc < lv.endpc as usize {
            n -= 1;
            if n == 0 {
                return Some(lv.name);
            }
        } else if lv.startpc as usize > pc {
            break;
        }
    }
    None
}

fn upval_name(vm: &LuaVM, proto: ProtoId, idx: u32) -> Option<StringId> {
    vm.pool
        .proto(proto)
        .upvalues
        .get(idx as usize)
        .map(|d| d.name)
}

/// Does this instruction write register A?
fn sets_register_a(op: OpCode) -> bool {
    !matches!(
        op,
        OpCode::SetTabUp
            | OpCode::SetUpval
            | OpCode::SetTable
            | OpCode::Jmp
            | OpCode::Eq
            | OpCode::Lt
            | OpCode::Le
            | OpCode::Test
            | OpCode::Return
            | OpCode::TForCall
            | OpCode::SetList
            | OpCode::ExtraArg
    )
}

/// Last instruction before `lastpc` that wrote `reg`, following
/// forward jumps the way execution would.
fn find_set_reg(vm: &LuaVM, proto: ProtoId, lastpc: usize, reg: u32) -> Option<usize> {
    let code = &vm.pool.proto(proto).code;
    let mut setreg: Option<usize> = None;
    let mut pc = 0usize;
    while pc < lastpc {
        let i = code[pc];
        let op = get_opcode(i);
        let a = getarg_a(i);
        match op {
            OpCode::LoadNil => {
                let b = getarg_b(i);
                if a <= reg && reg <= a + b {
                    setreg = Some(pc);
                }
            }
            OpCode::TForCall => {
                if reg >= a + 2 {
                    setreg = Some(pc);
                }
            }
            OpCode::Call | OpCode::TailCall => {
                if reg >= a {
                    setreg = Some(pc);
                }
            }
            OpCode::Jmp => {
                let b = getarg_sbx(i);
                let dest = pc as i64 + 1 + b as i64;
                if (pc as i64) < dest && dest <= lastpc as i64 {
                    pc = (pc as i64 + b as i64) as usize;
                }
            }
            OpCode::Test => {
                if reg == a {
                    setreg = Some(pc);
                }
            }
            _ => {
                if sets_register_a(op) && reg == a {
                    setreg = Some(pc);
                }
            }
        }
        pc += 1;
    }
    setreg
}

fn constant_name(vm: &LuaVM, proto: ProtoId, pc: usize, c: u32) -> String {
    if isk(c) {
        let k = vm.pool.proto(proto).k[indexk(c) as usize];
        if let Some(sid) = k.as_string_id() {
            return vm.str_display(sid);
        }
    } else if let Some(("field", name)) = get_obj_name(vm, proto, pc, c) {
        return name;
    }
    "?".to_string()
}

/// Kind and name for the value in register `reg` of a prototype, as of
/// instruction `lastpc`.
pub fn get_obj_name(
    vm: &LuaVM,
    proto: ProtoId,
    lastpc: usize,
    reg: u32,
) -> Option<(&'static str, String)> {
    if let Some(name) = get_local_name(vm, proto, reg + 1, lastpc) {
        return Some(("local", vm.str_display(name)));
    }
    let pc = find_set_reg(vm, proto, lastpc, reg)?;
    let i = vm.pool.proto(proto).code[pc];
    match get_opcode(i) {
        OpCode::Move => {
            let b = getarg_b(i);
            if b < getarg_a(i) {
                return get_obj_name(vm, proto, pc, b);
            }
            None
        }
        OpCode::GetTabUp | OpCode::GetTable => {
            let op = get_opcode(i);
            let t = getarg_b(i);
            let indexed_name = if op == OpCode::GetTable {
                get_local_name(vm, proto, t + 1, pc).map(|s| vm.str_display(s))
            } else {
                upval_name(vm, proto, t).map(|s| vm.str_display(s))
            };
            let key = constant_name(vm, proto, pc, getarg_c(i));
            if indexed_name.as_deref() == Some("_ENV") {
                Some(("global", key))
            } else {
                Some(("field", key))
            }
        }
        OpCode::GetUpval => {
            let name = upval_name(vm, proto, getarg_b(i))?;
            Some(("upvalue", vm.str_display(name)))
        }
        OpCode::LoadK | OpCode::LoadKx => {
            let b = if get_opcode(i) == OpCode::LoadK {
                getarg_bx(i)
            } else {
                getarg_ax(vm.pool.proto(proto).code[pc + 1])
            };
            let k = vm.pool.proto(proto).k[b as usize];
            let sid = k.as_string_id()?;
            Some(("constant", vm.str_display(sid)))
        }
        OpCode::OpSelf => {
            let key = constant_name(vm, proto, pc, getarg_c(i));
            Some(("method", key))
        }
        _ => None,
    }
}

impl LuaVM {
    /// Prototype and last-executed pc of the current frame, when it is
    /// a Lua frame.
    fn current_lua_frame(&self) -> Option<(ProtoId, usize)> {
        let t = self.th();
        let ci = t.current_ci();
        if !ci.is_lua() {
            return None;
        }
        let fv = t.stack[ci.func];
        let cl = fv.as_closure_id()?;
        let proto = match self.pool.closure(cl) {
            Closure::Lua(lc) => lc.proto,
            Closure::Host(_) => return None,
        };
        Some((proto, ci.pc.saturating_sub(1)))
    }

    /// `chunk:line: ` prefix for the current position, or empty when
    /// no Lua frame is active.
    pub fn position_prefix(&self) -> String {
        match self.current_lua_frame() {
            Some((proto, pc)) => {
                let p = self.pool.proto(proto);
                let src = chunk_id(self.pool.string(p.source).as_bytes());
                let line = p.line_at(pc);
                format!("{}:{}: ", src, line)
            }
            None => String::new(),
        }
    }

    /// Position prefix for the frame `level` activations below the
    /// innermost one (1 = caller of the running host function).
    pub fn position_prefix_at_level(&self, level: usize) -> String {
        let t = self.th();
        let Some(idx) = t.ci_depth.checked_sub(1 + level) else {
            return String::new();
        };
        let ci = &t.ci[idx];
        if !ci.is_lua() {
            return String::new();
        }
        let fv = t.stack[ci.func];
        let Some(cl) = fv.as_closure_id() else {
            return String::new();
        };
        let proto = match self.pool.closure(cl) {
            Closure::Lua(lc) => lc.proto,
            Closure::Host(_) => return String::new(),
        };
        let p = self.pool.proto(proto);
        let src = chunk_id(self.pool.string(p.source).as_bytes());
        let line = p.line_at(ci.pc.saturating_sub(1));
        format!("{}:{}: ", src, line)
    }

    pub fn add_position_info(&self, msg: String) -> String {
        let prefix = self.position_prefix();
        if prefix.is_empty() {
            msg
        } else {
            format!("{}{}", prefix, msg)
        }
    }

    /// "attempt to <op> a <type> value", naming the offending variable
    /// when it can be traced to a register, upvalue, or constant of
    /// the active function.
    pub fn type_error(&mut self, v: &LuaValue, op: &str) -> LuaError {
        let tname = v.type_name();
        let described = self.describe_value(v);
        let msg = match described {
            Some((kind, name)) => format!(
                "attempt to {} a {} value ({} '{}')",
                op, tname, kind, name
            ),
            None => format!("attempt to {} a {} value", op, tname),
        };
        self.run_error(msg)
    }

    fn describe_value(&self, v: &LuaValue) -> Option<(&'static str, String)> {
        let (proto, pc) = self.current_lua_frame()?;
        let t = self.th();
        let ci = t.current_ci();
        // Upvalues first.
        let fv = t.stack[ci.func];
        if let Some(cl) = fv.as_closure_id() {
            if let Closure::Lua(lc) = self.pool.closure(cl) {
                for (idx, &cell) in lc.upvals.iter().enumerate() {
                    if self.upval_get(cell).raw_eq(v) {
                        if let Some(name) = upval_name(self, proto, idx as u32) {
                            return Some(("upvalue", self.str_display(name)));
                        }
                    }
                }
            }
        }
        // Then frame registers.
        let top = ci.top.min(t.stack.len());
        for slot in ci.base..top {
            if t.stack[slot].raw_eq(v) {
                let reg = (slot - ci.base) as u32;
                if let Some(found) = get_obj_name(self, proto, pc, reg) {
                    return Some(found);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_literal() {
        assert_eq!(chunk_id(b"=stdin"), "stdin");
    }

    #[test]
    fn chunk_id_file_truncates_with_prefix() {
        let long = format!("@{}", "x".repeat(100));
        let id = chunk_id(long.as_bytes());
        assert!(id.starts_with("..."));
        assert!(id.len() < 61);
    }

    #[test]
    fn chunk_id_string_form() {
        assert_eq!(chunk_id(b"return 1"), "[string \"return 1\"]");
        let with_nl = chunk_id(b"local x\nreturn x");
        assert_eq!(with_nl, "[string \"local x...\"]");
    }
}
