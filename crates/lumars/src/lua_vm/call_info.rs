// CallInfo - one pending function invocation.

use crate::lua_vm::LuaResult;

/// Call status flags.
pub mod call_status {
    /// Frame runs a Lua function (has bytecode).
    pub const CIST_LUA: u32 = 1 << 0;
    /// Frame is running a hook.
    pub const CIST_HOOKED: u32 = 1 << 1;
    /// Frame (re)entered the dispatch loop; returning from it leaves
    /// the loop.
    pub const CIST_REENTRY: u32 = 1 << 2;
    /// Frame yielded (host function suspended inside this frame).
    pub const CIST_YIELDED: u32 = 1 << 3;
    /// Frame is a yieldable protected call.
    pub const CIST_YPCALL: u32 = 1 << 4;
    /// Frame has an error status recorded in `status`.
    pub const CIST_STAT: u32 = 1 << 5;
    /// Frame was entered by a tail call.
    pub const CIST_TAIL: u32 = 1 << 6;
}

/// Continuation recorded on a host frame so that execution can resume
/// there after a yield. Receives the VM and the saved context integer;
/// returns the number of results left on the stack.
pub type Continuation = fn(vm: &mut crate::lua_vm::LuaVM, ctx: i64) -> LuaResult<usize>;

#[derive(Clone, Copy)]
pub struct CallInfo {
    /// Stack index of the function slot.
    pub func: usize,
    /// Stack index of the first argument/local.
    pub base: usize,
    /// One past the last valid slot for this frame.
    pub top: usize,
    /// Saved program counter (Lua frames).
    pub pc: usize,
    /// Expected result count; -1 = all.
    pub nresults: i32,
    /// CIST_* flags.
    pub call_status: u32,
    /// Continuation to run on resume (host frames).
    pub continuation: Option<Continuation>,
    /// Context integer handed to the continuation.
    pub ctx: i64,
    /// Error-handler stack index to restore when this frame finishes
    /// (protected host frames).
    pub old_errfunc: usize,
    /// allow-hook flag to restore (protected host frames).
    pub old_allowhook: bool,
    /// Saved func index across yield/resume (the frame's func slot can
    /// only be recorded as an index; the stack may have been grown).
    pub extra: usize,
    /// Error status saved across a yield inside a protected call.
    pub status: u8,
}

impl CallInfo {
    pub fn new_lua(func: usize, base: usize, top: usize, nresults: i32) -> Self {
        CallInfo {
            func,
            base,
            top,
            pc: 0,
            nresults,
            call_status: call_status::CIST_LUA,
            continuation: None,
            ctx: 0,
            old_errfunc: 0,
            old_allowhook: true,
            extra: 0,
            status: 0,
        }
    }

    pub fn new_host(func: usize, top: usize, nresults: i32) -> Self {
        CallInfo {
            func,
            base: func + 1,
            top,
            pc: 0,
            nresults,
            call_status: 0,
            continuation: None,
            ctx: 0,
            old_errfunc: 0,
            old_allowhook: true,
            extra: 0,
            status: 0,
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.call_status & call_status::CIST_LUA != 0
    }

    #[inline(always)]
    pub fn is_tail(&self) -> bool {
        self.call_status & call_status::CIST_TAIL != 0
    }

    #[inline(always)]
    pub fn set_flag(&mut self, flag: u32) {
        self.call_status |= flag;
    }

    #[inline(always)]
    pub fn clear_flag(&mut self, flag: u32) {
        self.call_status &= !flag;
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.call_status & flag != 0
    }
}

impl Default for CallInfo {
    fn default() -> Self {
        CallInfo::new_host(0, 0, -1)
    }
}
