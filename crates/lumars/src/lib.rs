// Lua 5.2 runtime core: compiler, register-based bytecode VM,
// incremental/generational GC, coroutines, and a host embedding API.

#[cfg(test)]
mod test;

pub mod api;
pub mod compiler;
pub mod gc;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use gc::{ObjectPool, ProtoId, StringId, TableId, ThreadId};
pub use lua_value::{LuaTable, LuaValue};
pub use lua_vm::{CFunction, LuaError, LuaResult, LuaVM, OpCode, ThreadStatus, VmOptions};

use lua_vm::lua_limits::LUA_MULTRET;

/// One-shot convenience: fresh VM, core libraries, run the source.
pub fn execute(source: &str) -> LuaResult<Vec<LuaValue>> {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs()?;
    vm.execute_string(source)
}

impl LuaVM {
    pub fn open_libs(&mut self) -> LuaResult<()> {
        stdlib::open_libs(self)
    }

    /// Compile source text; the chunk is named after the source, so
    /// messages read `[string "..."]:line:`.
    pub fn compile(&mut self, source: &str) -> LuaResult<ProtoId> {
        compiler::compile(self, source, source)
    }

    pub fn compile_named(&mut self, source: &str, chunkname: &str) -> LuaResult<ProtoId> {
        compiler::compile(self, source, chunkname)
    }

    /// Compile and run on the current coroutine under a protected
    /// boundary; returns the chunk's results.
    pub fn execute_string(&mut self, source: &str) -> LuaResult<Vec<LuaValue>> {
        let proto = self.compile(source)?;
        self.execute_proto(proto)
    }

    /// Instantiate a main closure (its _ENV upvalue bound to the
    /// globals table) and call it protected.
    pub fn execute_proto(&mut self, proto: ProtoId) -> LuaResult<Vec<LuaValue>> {
        let globals = self.globals;
        let env = self.new_upval_closed(globals)?;
        let f = self.new_lua_closure(proto, vec![env])?;
        self.call_protected(f, &[])
    }

    /// Protected call of any function value, collecting its results.
    pub fn call_protected(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        let th = self.current;
        let old_top = self.pool.thread(th).top;
        self.check_slots(args.len() + 1)?;
        self.th_mut().push(f);
        for &a in args {
            self.th_mut().push(a);
        }
        let r = self.pcall_boundary(old_top, 0, |vm| vm.do_call(old_top, LUA_MULTRET, false));
        match r {
            Ok(()) => {
                let top = self.pool.thread(th).top;
                let mut out = Vec::with_capacity(top - old_top);
                for i in old_top..top {
                    out.push(self.pool.thread(th).stack[i]);
                }
                self.pool.thread_mut(th).top = old_top;
                Ok(out)
            }
            Err(e) => {
                // The error value sits at the saved top.
                let err = self.pool.thread(th).stack[old_top];
                self.pool.thread_mut(th).top = old_top;
                self.pool.thread_mut(th).err_obj = err;
                Err(e)
            }
        }
    }

    /// Text of the most recent error value.
    pub fn error_message(&self) -> String {
        self.value_display(&self.th().err_obj)
    }
}
