// Global VM state and the call/error/coroutine machinery shared by
// every coroutine: registry, string pool, base metatables, tag-method
// names, GC state, and the host-call boundary bookkeeping.

pub mod call_info;
pub mod debug_info;
pub mod execute;
pub mod lua_error;
pub mod lua_limits;
pub mod lua_state;
pub mod opcode;
pub mod tag_methods;

pub use call_info::{call_status, CallInfo, Continuation};
pub use lua_error::{LuaError, ThreadStatus};
pub use lua_state::{hook_mask, Hook, HookEvent, LuaThread};
pub use opcode::{Instr, OpCode};
pub use tag_methods::{TmKind, TM_COUNT, TM_NAMES};

use crate::compiler::lexer::RESERVED_WORDS;
use crate::gc::{
    self, Closure, Gc, GcId, GcRoots, HostClosure, LuaClosure, ObjectPool, Proto, ProtoId,
    StringInterner, StringId, TableId, ThreadId, UpvalId, UpvalState,
};
use crate::lua_value::{LuaValue, TableError, LUA_NUMTAGS};
use call_status::*;
use lua_limits::*;

pub type LuaResult<T> = Result<T, LuaError>;

/// Host function callable from scripts. Arguments sit between the
/// frame base and the stack top; the function leaves its results on
/// top and returns how many.
pub type CFunction = fn(&mut LuaVM) -> LuaResult<usize>;

/// Host-tunable knobs fixed at VM creation.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Allocator budget in bytes; 0 = unlimited. The `MEMLIMIT`
    /// environment variable seeds this for diagnostic harnesses.
    pub mem_limit: usize,
    pub gc_pause: i32,
    pub gc_stepmul: i32,
}

impl Default for VmOptions {
    fn default() -> Self {
        let mem_limit = std::env::var("MEMLIMIT")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(0);
        VmOptions {
            mem_limit,
            gc_pause: DEFAULT_GC_PAUSE,
            gc_stepmul: DEFAULT_GC_STEPMUL,
        }
    }
}

pub struct LuaVM {
    pub pool: ObjectPool,
    pub gc: Gc,
    pub strt: StringInterner,
    /// The registry table value.
    pub registry: LuaValue,
    /// Globals table (also stored at the registry's globals slot).
    pub globals: LuaValue,
    pub main: ThreadId,
    /// Currently running coroutine; swapped by resume with a scoped
    /// set/restore.
    pub current: ThreadId,
    /// Per-base-type metatables (nil or table values).
    pub base_metatables: [LuaValue; LUA_NUMTAGS],
    /// Pre-interned tag-method name strings.
    pub tm_names: [LuaValue; TM_COUNT],
    /// Pre-interned out-of-memory message (usable without allocating).
    pub memerrmsg: LuaValue,
    /// Pre-interned cascaded-failure message.
    pub errerrmsg: LuaValue,
    /// Pre-interned stack-overflow message.
    pub stkerrmsg: LuaValue,
    /// Host-side anchor chain: values pinned against collection while
    /// the host holds them outside any stack.
    pub anchors: Vec<LuaValue>,
    pub options: VmOptions,
    /// Called when an error escapes every protected boundary.
    pub panic: Option<CFunction>,
    /// Nonzero while the compiler runs (its intermediate objects are
    /// not all reachable from GC roots).
    pub gc_hold: u32,
}

impl LuaVM {
    pub fn new(options: VmOptions) -> Box<LuaVM> {
        let mut pool = ObjectPool::new();
        let mut gc = Gc::new();
        gc.pause_pct = options.gc_pause;
        gc.stepmul_pct = options.gc_stepmul;
        let mut strt = StringInterner::new();

        let main = pool.create_thread(&mut gc);
        pool.threads[main.0 as usize]
            .as_mut()
            .unwrap()
            .header
            .set_fixed();

        // Reserved words are created fixed and tagged with their token
        // index so the lexer can classify identifiers by id.
        for (i, word) in RESERVED_WORDS.iter().enumerate() {
            let id = strt.intern(&mut pool, &mut gc, word.as_bytes());
            let s = pool.string_mut(id);
            s.header.set_fixed();
            s.reserved = (i + 1) as u8;
        }

        let mut tm_names = [LuaValue::nil(); TM_COUNT];
        for (i, name) in TM_NAMES.iter().enumerate() {
            let id = strt.intern(&mut pool, &mut gc, name.as_bytes());
            pool.string_mut(id).header.set_fixed();
            tm_names[i] = LuaValue::string(id);
        }
        let memerr = strt.intern(&mut pool, &mut gc, b"not enough memory");
        pool.string_mut(memerr).header.set_fixed();
        let errerr = strt.intern(&mut pool, &mut gc, b"error in error handling");
        pool.string_mut(errerr).header.set_fixed();
        let stkerr = strt.intern(&mut pool, &mut gc, b"stack overflow");
        pool.string_mut(stkerr).header.set_fixed();

        let mut vm = Box::new(LuaVM {
            pool,
            gc,
            strt,
            registry: LuaValue::nil(),
            globals: LuaValue::nil(),
            main,
            current: main,
            base_metatables: [LuaValue::nil(); LUA_NUMTAGS],
            tm_names,
            memerrmsg: LuaValue::string(memerr),
            errerrmsg: LuaValue::string(errerr),
            stkerrmsg: LuaValue::string(stkerr),
            anchors: Vec::new(),
            options,
            panic: None,
            gc_hold: 0,
        });

        // Registry layout: [1] = main thread, [2] = globals, plus the
        // loaded/preload tables under string keys.
        let registry = vm.pool.create_table(&mut vm.gc, 2, 4);
        vm.registry = LuaValue::table(registry);
        let globals = vm.pool.create_table(&mut vm.gc, 0, 16);
        vm.globals = LuaValue::table(globals);
        let main_value = LuaValue::thread(vm.main);
        let gtab = vm.globals;
        vm.raw_seti(registry, LUA_RIDX_MAINTHREAD as i64, main_value);
        vm.raw_seti(registry, LUA_RIDX_GLOBALS as i64, gtab);
        let loaded = vm.pool.create_table(&mut vm.gc, 0, 8);
        let preload = vm.pool.create_table(&mut vm.gc, 0, 0);
        let lk = vm.intern_fixed("_LOADED");
        let pk = vm.intern_fixed("_PRELOAD");
        let _ = vm.pool.table_mut(registry).set(lk, LuaValue::table(loaded));
        let _ = vm.pool.table_mut(registry).set(pk, LuaValue::table(preload));
        vm
    }

    fn intern_fixed(&mut self, s: &str) -> LuaValue {
        let id = self.strt.intern(&mut self.pool, &mut self.gc, s.as_bytes());
        self.pool.string_mut(id).header.set_fixed();
        LuaValue::string(id)
    }

    // ============ Thread shorthands ============

    #[inline(always)]
    pub fn th(&self) -> &LuaThread {
        self.pool.thread(self.current)
    }

    #[inline(always)]
    pub fn th_mut(&mut self) -> &mut LuaThread {
        self.pool.thread_mut(self.current)
    }

    // ============ Allocation (budget-checked) ============

    fn check_mem(&mut self, upcoming: usize) -> LuaResult<()> {
        let limit = self.options.mem_limit;
        if limit > 0 && self.gc.total_bytes + upcoming > limit {
            self.collect_garbage_full(true);
            if self.gc.total_bytes + upcoming > limit {
                return Err(self.raise_mem());
            }
        }
        Ok(())
    }

    pub fn new_string(&mut self, s: &str) -> LuaResult<LuaValue> {
        self.new_string_bytes(s.as_bytes())
    }

    pub fn new_string_bytes(&mut self, b: &[u8]) -> LuaResult<LuaValue> {
        self.check_mem(b.len() + 64)?;
        let id = self.strt.intern(&mut self.pool, &mut self.gc, b);
        Ok(LuaValue::string(id))
    }

    pub fn new_table(&mut self, narray: usize, nhash: usize) -> LuaResult<LuaValue> {
        self.check_mem(64 + narray * 16 + nhash * 40)?;
        let id = self.pool.create_table(&mut self.gc, narray, nhash);
        Ok(LuaValue::table(id))
    }

    pub fn new_proto(&mut self, proto: Proto) -> LuaResult<ProtoId> {
        self.check_mem(proto.mem_size())?;
        Ok(self.pool.create_proto(&mut self.gc, proto))
    }

    pub fn new_lua_closure(&mut self, proto: ProtoId, upvals: Vec<UpvalId>) -> LuaResult<LuaValue> {
        self.check_mem(64)?;
        let id = self
            .pool
            .create_closure(&mut self.gc, Closure::Lua(LuaClosure { proto, upvals }));
        Ok(LuaValue::lua_closure(id))
    }

    pub fn new_host_closure(&mut self, f: CFunction, upvals: Vec<LuaValue>) -> LuaResult<LuaValue> {
        self.check_mem(64)?;
        let id = self
            .pool
            .create_closure(&mut self.gc, Closure::Host(HostClosure { f, upvals }));
        Ok(LuaValue::host_closure(id))
    }

    pub fn new_userdata(&mut self, data: Vec<u8>, env: Option<TableId>) -> LuaResult<LuaValue> {
        self.check_mem(64 + data.len())?;
        let id = self.pool.create_userdata(&mut self.gc, data, env);
        Ok(LuaValue::userdata(id))
    }

    pub fn new_thread(&mut self) -> LuaResult<LuaValue> {
        self.check_mem(1024)?;
        let id = self.pool.create_thread(&mut self.gc);
        Ok(LuaValue::thread(id))
    }

    pub fn new_upval_closed(&mut self, v: LuaValue) -> LuaResult<UpvalId> {
        self.check_mem(64)?;
        Ok(self.pool.create_upval_closed(&mut self.gc, v))
    }

    // ============ String helpers ============

    pub fn str_bytes(&self, id: StringId) -> &[u8] {
        self.pool.string(id).as_bytes()
    }

    pub fn str_display(&self, id: StringId) -> String {
        self.pool.string(id).to_display().into_owned()
    }

    pub fn value_display(&self, v: &LuaValue) -> String {
        if let Some(id) = v.as_string_id() {
            self.str_display(id)
        } else if let Some(n) = v.as_number() {
            crate::lua_value::conversions::number_to_str(n)
        } else if v.is_nil() {
            "nil".to_string()
        } else if let Some(b) = v.as_boolean() {
            b.to_string()
        } else if v.is_collectable() {
            format!("{}: {:#010x}", v.type_name(), v.gc_index())
        } else {
            format!("{}: {:#x}", v.type_name(), v.payload())
        }
    }

    // ============ Raw table access with barriers ============

    pub fn raw_set(&mut self, t: LuaValue, key: LuaValue, val: LuaValue) -> LuaResult<()> {
        let Some(tid) = t.as_table_id() else {
            return Err(LuaError::BadTable);
        };
        match self.pool.table_mut(tid).set(key, val) {
            Ok(_) => {}
            Err(TableError::NilIndex) => return Err(self.run_error("table index is nil".into())),
            Err(TableError::NanIndex) => return Err(self.run_error("table index is NaN".into())),
            Err(TableError::InvalidNext) => unreachable!(),
        }
        if key.is_collectable() || val.is_collectable() {
            gc::barrier_back(&mut self.gc, &mut self.pool, tid);
        }
        Ok(())
    }

    pub fn raw_get(&self, t: LuaValue, key: &LuaValue) -> LuaValue {
        match t.as_table_id() {
            Some(tid) => self.pool.table(tid).get(key),
            None => LuaValue::nil(),
        }
    }

    pub fn raw_seti(&mut self, t: TableId, key: i64, val: LuaValue) {
        let _ = self.pool.table_mut(t).set_int(key, val);
        if val.is_collectable() {
            gc::barrier_back(&mut self.gc, &mut self.pool, t);
        }
    }

    pub fn raw_geti(&self, t: TableId, key: i64) -> LuaValue {
        self.pool.table(t).get_int(key)
    }

    pub fn get_global(&mut self, name: &str) -> LuaResult<LuaValue> {
        let key = self.new_string(name)?;
        Ok(self.raw_get(self.globals, &key))
    }

    pub fn set_global(&mut self, name: &str, v: LuaValue) -> LuaResult<()> {
        let key = self.new_string(name)?;
        self.raw_set(self.globals, key, v)
    }

    // ============ Metatables & finalizers ============

    /// Assign a metatable to a table or userdata, moving the object to
    /// the finalizers list when the metatable defines `__gc`.
    pub fn set_metatable(&mut self, obj: &LuaValue, mt: Option<TableId>) -> LuaResult<()> {
        let id = if let Some(t) = obj.as_table_id() {
            self.pool.table_mut(t).metatable = mt;
            self.pool.table_mut(t).flags = 0;
            GcId::Table(t)
        } else if let Some(u) = obj.as_userdata_id() {
            self.pool.userdata_mut(u).metatable = mt;
            GcId::Userdata(u)
        } else {
            return Err(LuaError::BadTable);
        };
        if let Some(mt) = mt {
            // Backward barrier for tables, forward for userdata.
            match id {
                GcId::Table(t) => gc::barrier_back(&mut self.gc, &mut self.pool, t),
                _ => gc::barrier_forward(&mut self.gc, &mut self.pool, id, &LuaValue::table(mt)),
            }
            self.check_finalizer(id, mt);
        }
        Ok(())
    }

    /// If the freshly-assigned metatable has `__gc` and the object has
    /// not been separated or finalized before, move it to the
    /// finalizers list.
    fn check_finalizer(&mut self, id: GcId, mt: TableId) {
        let h = match self.pool.header(id) {
            Some(h) => *h,
            None => return,
        };
        if h.is_separated() || h.is_finalized() {
            return;
        }
        let gc_tm = self.get_tm(mt, TmKind::Gc);
        if gc_tm.is_nil() {
            return;
        }
        self.pool.separate_for_finalization(id);
    }

    // ============ GC driving ============

    fn make_roots(&self) -> GcRoots {
        GcRoots {
            main: self.main,
            current: self.current,
            registry: self.registry,
            base_metatables: self.base_metatables,
            mode_key: self.tm_names[TmKind::Mode as usize],
            anchors: self.anchors.clone(),
        }
    }

    /// Honor pending GC debt; called from allocation-heavy points and
    /// the dispatch loop.
    pub fn check_gc(&mut self) -> LuaResult<()> {
        if self.gc_hold == 0 && self.gc.should_step() {
            self.gc_step()?;
        }
        Ok(())
    }

    pub fn gc_step(&mut self) -> LuaResult<()> {
        let roots = self.make_roots();
        let pending =
            gc::step(&mut self.gc, &mut self.pool, &mut self.strt, &roots);
        if pending {
            self.call_pending_finalizers(GC_FINALIZER_BATCH)?;
        }
        Ok(())
    }

    /// Complete collection; emergency collections skip finalizers.
    pub fn collect_garbage_full(&mut self, emergency: bool) {
        let roots = self.make_roots();
        gc::full_gc(&mut self.gc, &mut self.pool, &mut self.strt, &roots, emergency);
        if !emergency {
            // Errors inside __gc surface as gc-metamethod errors to the
            // next protected boundary; a full collect runs them all.
            let _ = self.call_pending_finalizers(usize::MAX);
        }
    }

    /// Invoke `__gc` for up to `limit` pending objects, newest
    /// separation first, each in a fresh protected call.
    pub fn call_pending_finalizers(&mut self, limit: usize) -> LuaResult<()> {
        let mut n = 0;
        while n < limit {
            let Some(id) = self.pool.tobefnz.pop() else { break };
            n += 1;
            // Return the object to the main list; it dies for real in a
            // later cycle.
            if let Some(h) = self.pool.header_mut(id) {
                h.set_separated(false);
                h.set_finalized();
            }
            self.pool.allgc.push(id);
            let obj = match id {
                GcId::Table(t) => LuaValue::table(t),
                GcId::Userdata(u) => LuaValue::userdata(u),
                _ => continue,
            };
            let tm = self.get_metamethod(&obj, TmKind::Gc);
            if !tm.is_function() {
                continue;
            }
            let was_running = self.gc.running;
            self.gc.running = false;
            let th = self.current;
            let old_allow = self.pool.thread(th).allow_hook;
            self.pool.thread_mut(th).allow_hook = false;
            let top = self.pool.thread(th).top;
            let r = (|| -> LuaResult<()> {
                self.th_mut().check_stack(2)?;
                self.th_mut().push(tm);
                self.th_mut().push(obj);
                self.pcall_boundary(top, 0, |vm| vm.do_call(top, 0, false))
            })();
            self.pool.thread_mut(th).allow_hook = old_allow;
            self.gc.running = was_running;
            if let Err(e) = r {
                // Surface as a gc-metamethod error.
                let _ = e;
                return Err(LuaError::GcMetamethod);
            }
        }
        Ok(())
    }

    // ============ Error raising ============

    pub fn raise_mem(&mut self) -> LuaError {
        let msg = self.memerrmsg;
        self.th_mut().err_obj = msg;
        LuaError::Mem
    }

    /// Raise a runtime error whose message is prefixed with the
    /// current chunk and line.
    pub fn run_error(&mut self, msg: String) -> LuaError {
        let full = self.add_position_info(msg);
        self.raise_with_message(full)
    }

    fn raise_with_message(&mut self, msg: String) -> LuaError {
        match self.new_string(&msg) {
            Ok(v) => {
                self.th_mut().err_obj = v;
                self.errormsg()
            }
            Err(_) => LuaError::Mem,
        }
    }

    /// Raise with an arbitrary error value (the `error` builtin).
    pub fn raise_value(&mut self, v: LuaValue) -> LuaError {
        self.th_mut().err_obj = v;
        self.errormsg()
    }

    /// Run the installed error handler (once) over the pending error
    /// value. A handler failure reports "error in error handling".
    fn errormsg(&mut self) -> LuaError {
        let th = self.current;
        let ef = self.pool.thread(th).err_func;
        if ef == 0 {
            return LuaError::Runtime;
        }
        let handler = self.pool.thread(th).stack[ef];
        if !handler.is_function() {
            return LuaError::ErrErr;
        }
        let err_obj = self.pool.thread(th).err_obj;
        // The handler must not recurse into itself.
        self.pool.thread_mut(th).err_func = 0;
        let top = self.pool.thread(th).top;
        let call = (|| -> LuaResult<()> {
            self.th_mut().check_stack(2)?;
            self.th_mut().push(handler);
            self.th_mut().push(err_obj);
            self.do_call(top, 1, false)
        })();
        self.pool.thread_mut(th).err_func = ef;
        match call {
            Ok(()) => {
                let t = self.pool.thread_mut(th);
                t.top -= 1;
                let res = t.stack[t.top];
                t.err_obj = res;
                LuaError::Runtime
            }
            Err(_) => {
                let msg = self.errerrmsg;
                self.pool.thread_mut(th).err_obj = msg;
                LuaError::ErrErr
            }
        }
    }

    /// Place the pending error value at `old_top` after an unwind.
    pub fn set_error_obj(&mut self, e: LuaError, old_top: usize) {
        let v = match e {
            LuaError::Mem => self.memerrmsg,
            LuaError::ErrErr => self.errerrmsg,
            LuaError::StackOverflow => self.stkerrmsg,
            _ => {
                let v = self.th().err_obj;
                if v.is_nil() {
                    self.errerrmsg
                } else {
                    v
                }
            }
        };
        let t = self.th_mut();
        t.stack[old_top] = v;
        t.top = old_top + 1;
        t.err_obj = LuaValue::nil();
    }

    // ============ Upvalues ============

    /// Find or create the open upvalue cell for a stack slot; the
    /// per-thread list stays sorted by descending slot.
    pub fn find_upval(&mut self, th: ThreadId, slot: usize) -> UpvalId {
        let mut insert_at = self.pool.thread(th).open_upvals.len();
        {
            let list = &self.pool.thread(th).open_upvals;
            for (i, &u) in list.iter().enumerate() {
                let s = match self.pool.upval(u).data {
                    UpvalState::Open { slot, .. } => slot,
                    UpvalState::Closed(_) => continue,
                };
                if s == slot {
                    return u;
                }
                if s < slot {
                    insert_at = i;
                    break;
                }
            }
        }
        let u = self.pool.create_upval_open(&mut self.gc, th, slot);
        self.pool.thread_mut(th).open_upvals.insert(insert_at, u);
        self.gc.open_upvals.push(u);
        u
    }

    /// Close every open upvalue at or above `level` on the given
    /// thread.
    pub fn close_upvalues(&mut self, th: ThreadId, level: usize) {
        loop {
            let Some(&u) = self.pool.thread(th).open_upvals.first() else {
                return;
            };
            let slot = match self.pool.upval(u).data {
                UpvalState::Open { slot, .. } => slot,
                UpvalState::Closed(_) => {
                    self.pool.thread_mut(th).open_upvals.remove(0);
                    continue;
                }
            };
            if slot < level {
                return;
            }
            self.pool.thread_mut(th).open_upvals.remove(0);
            let v = self.pool.thread(th).stack[slot];
            gc::close_upvalue(&mut self.gc, &mut self.pool, u, v);
        }
    }

    /// Read through an upvalue cell.
    pub fn upval_get(&self, u: UpvalId) -> LuaValue {
        match self.pool.upval(u).data {
            UpvalState::Closed(v) => v,
            UpvalState::Open { thread, slot } => self.pool.thread(thread).stack[slot],
        }
    }

    /// Write through an upvalue cell, with the forward barrier for
    /// closed cells.
    pub fn upval_set(&mut self, u: UpvalId, v: LuaValue) {
        match self.pool.upval(u).data {
            UpvalState::Closed(_) => {
                self.pool.upval_mut(u).data = UpvalState::Closed(v);
                gc::barrier_forward(&mut self.gc, &mut self.pool, GcId::Upval(u), &v);
            }
            UpvalState::Open { thread, slot } => {
                self.pool.thread_mut(thread).stack[slot] = v;
            }
        }
    }

    // ============ Calls ============

    /// Prepare (and for host functions, run) a call of the value at
    /// `func_idx`. Returns true when the call completed here (host
    /// function), false when a Lua frame was pushed for the
    /// interpreter.
    pub fn precall(&mut self, func_idx: usize, nresults: i32) -> LuaResult<bool> {
        let th = self.current;
        let func = self.pool.thread(th).stack[func_idx];

        if func.is_cfunction() || func.is_host_closure() {
            self.th_mut().check_stack(LUA_MINSTACK)?;
            let top = self.pool.thread(th).top;
            let ci = CallInfo::new_host(func_idx, top + LUA_MINSTACK, nresults);
            self.pool.thread_mut(th).push_ci(ci);
            self.hook_event(HookEvent::Call)?;
            let f = if let Some(f) = func.as_cfunction() {
                f
            } else {
                let cid = func.as_closure_id().unwrap();
                match self.pool.closure(cid) {
                    Closure::Host(hc) => hc.f,
                    Closure::Lua(_) => unreachable!(),
                }
            };
            let n = f(self)?;
            self.hook_event(HookEvent::Return)?;
            let top = self.pool.thread(th).top;
            debug_assert!(n <= top);
            self.poscall(top - n, n);
            return Ok(true);
        }

        if func.is_lua_closure() {
            let cid = func.as_closure_id().unwrap();
            let proto_id = match self.pool.closure(cid) {
                Closure::Lua(lc) => lc.proto,
                Closure::Host(_) => unreachable!(),
            };
            let (numparams, is_vararg, maxstack) = {
                let p = self.pool.proto(proto_id);
                (p.numparams as usize, p.is_vararg, p.maxstacksize as usize)
            };
            self.th_mut().check_stack(maxstack + numparams + EXTRA_STACK)?;
            let n_args = self.pool.thread(th).top - func_idx - 1;
            // Missing fixed parameters default to nil.
            for _ in n_args..numparams {
                self.pool.thread_mut(th).push(LuaValue::nil());
            }
            let base = if !is_vararg {
                func_idx + 1
            } else {
                self.adjust_varargs(func_idx, numparams)
            };
            let mut ci = CallInfo::new_lua(func_idx, base, base + maxstack, nresults);
            ci.pc = 0;
            self.pool.thread_mut(th).top = base + maxstack;
            self.pool.thread_mut(th).push_ci(ci);
            self.hook_event(HookEvent::Call)?;
            return Ok(false);
        }

        // Not a function: try __call, inserting the metamethod before
        // the original value.
        let tm = self.get_metamethod(&func, TmKind::Call);
        if !tm.is_function() {
            return Err(self.type_error(&func, "call"));
        }
        self.th_mut().check_stack(1)?;
        {
            let t = self.pool.thread_mut(th);
            let top = t.top;
            let mut i = top;
            while i > func_idx {
                t.stack[i] = t.stack[i - 1];
                i -= 1;
            }
            t.stack[func_idx] = tm;
            t.top = top + 1;
        }
        self.precall(func_idx, nresults)
    }

    /// Move the fixed parameters of a vararg function up to a fresh
    /// base, leaving the varargs addressable below it.
    fn adjust_varargs(&mut self, func_idx: usize, numparams: usize) -> usize {
        let th = self.current;
        let t = self.pool.thread_mut(th);
        let fixed = func_idx + 1;
        let base = t.top;
        for i in 0..numparams {
            let v = t.stack[fixed + i];
            t.stack[t.top] = v;
            t.top += 1;
            t.stack[fixed + i] = LuaValue::nil();
        }
        base
    }

    /// Finish a call: move `nres` results starting at `first_result`
    /// into place at the function slot, padding/truncating to the
    /// frame's expected count. Returns false when the caller wants all
    /// results.
    pub fn poscall(&mut self, first_result: usize, nres: usize) -> bool {
        let th = self.current;
        let (res, wanted) = {
            let ci = self.pool.thread(th).current_ci();
            (ci.func, ci.nresults)
        };
        self.pool.thread_mut(th).pop_ci();
        let t = self.pool.thread_mut(th);
        let mut i = 0;
        let want = if wanted < 0 { nres } else { wanted as usize };
        while i < want.min(nres) {
            t.stack[res + i] = t.stack[first_result + i];
            i += 1;
        }
        while i < want {
            t.stack[res + i] = LuaValue::nil();
            i += 1;
        }
        t.top = res + want;
        wanted != LUA_MULTRET
    }

    /// Call the value at `func_idx` with the arguments above it.
    /// Metamethod and protected-call sites pass `allow_yield = false`.
    pub fn do_call(&mut self, func_idx: usize, nresults: i32, allow_yield: bool) -> LuaResult<()> {
        let th = self.current;
        {
            let t = self.pool.thread_mut(th);
            t.n_ccalls += 1;
            if !allow_yield {
                t.nny += 1;
            }
        }
        let overflow = self.pool.thread(th).n_ccalls >= LUAI_MAXCCALLS;
        let result = if overflow {
            if self.pool.thread(th).n_ccalls >= LUAI_MAXCCALLS + 10 {
                Err(LuaError::ErrErr) // overflow while handling overflow
            } else {
                Err(self.run_error("stack overflow".into()))
            }
        } else {
            (|| -> LuaResult<()> {
                if !self.precall(func_idx, nresults)? {
                    execute::lua_execute(self)?;
                }
                Ok(())
            })()
        };
        {
            let t = self.pool.thread_mut(th);
            t.n_ccalls -= 1;
            if !allow_yield {
                t.nny -= 1;
            }
        }
        result
    }

    // ============ Protected calls ============

    /// Run `body` under a recovery boundary: on error, restore the
    /// frame depth and stack top, close upvalues, and place the error
    /// value at `old_top`. `err_func` installs an error handler for
    /// the dynamic extent.
    pub fn pcall_boundary(
        &mut self,
        old_top: usize,
        err_func: usize,
        body: impl FnOnce(&mut LuaVM) -> LuaResult<()>,
    ) -> LuaResult<()> {
        let th = self.current;
        let (saved_depth, saved_allowhook, saved_nny, saved_ef) = {
            let t = self.pool.thread(th);
            (t.ci_depth, t.allow_hook, t.nny, t.err_func)
        };
        self.pool.thread_mut(th).err_func = err_func;
        let result = body(self);
        match result {
            Ok(()) => {
                self.pool.thread_mut(th).err_func = saved_ef;
                Ok(())
            }
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(e) => {
                let status = e.status();
                {
                    let t = self.pool.thread_mut(th);
                    t.ci_depth = saved_depth;
                    t.allow_hook = saved_allowhook;
                    t.nny = saved_nny;
                    t.err_func = saved_ef;
                }
                self.close_upvalues(th, old_top);
                self.set_error_obj(e, old_top);
                self.pool.thread_mut(th).shrink_ci();
                Err(status)
            }
        }
    }

    /// Protected call of a function value with arguments, host-style:
    /// returns Ok(n results on the stack) or the error status with the
    /// error value on top.
    pub fn pcall_value(
        &mut self,
        func: LuaValue,
        args: &[LuaValue],
        nresults: i32,
    ) -> Result<usize, LuaError> {
        let th = self.current;
        let old_top = self.pool.thread(th).top;
        let prep = (|| -> LuaResult<()> {
            self.th_mut().check_stack(args.len() + 1)?;
            self.th_mut().push(func);
            for &a in args {
                self.th_mut().push(a);
            }
            Ok(())
        })();
        prep.map_err(|e| e.status())?;
        match self.pcall_boundary(old_top, 0, |vm| vm.do_call(old_top, nresults, false)) {
            Ok(()) => Ok(self.pool.thread(th).top - old_top),
            Err(e) => Err(e),
        }
    }

    // ============ Coroutines ============

    /// Resume `co` with `nargs` arguments already pushed on its stack.
    /// Returns Ok(true) when it yielded, Ok(false) when it finished;
    /// errors leave the error value on `co`'s stack top.
    pub fn resume_coroutine(&mut self, co: ThreadId, nargs: usize) -> Result<bool, LuaError> {
        if co == self.current {
            let e = self.resume_error(co, "cannot resume non-suspended coroutine");
            return Err(e);
        }
        let from = self.current;
        let from_ccalls = self.pool.thread(from).n_ccalls;
        // Scoped current-coroutine switch.
        self.current = co;
        let (old_nny, ok_to_run) = {
            let t = self.pool.thread_mut(co);
            let old = t.nny;
            t.nny = 0;
            t.n_ccalls = from_ccalls + 1;
            let ok = match t.status {
                ThreadStatus::Ok => t.ci_depth == 1,
                ThreadStatus::Yielded => true,
                _ => false,
            };
            (old, ok)
        };
        if !ok_to_run {
            let status = self.pool.thread(co).status;
            let msg = match status {
                ThreadStatus::Ok => "cannot resume non-suspended coroutine",
                _ => "cannot resume dead coroutine",
            };
            self.pool.thread_mut(co).nny = old_nny;
            self.current = from;
            let e = self.resume_error(co, msg);
            return Err(e);
        }
        if self.pool.thread(co).n_ccalls >= LUAI_MAXCCALLS {
            self.pool.thread_mut(co).nny = old_nny;
            self.current = from;
            let e = self.resume_error(co, "C stack overflow");
            return Err(e);
        }

        let first_arg = self.pool.thread(co).top - nargs;
        let mut status = self.resume_body(first_arg);
        // Errors unwind to the innermost yielded protected call, if
        // any; otherwise the coroutine dies.
        loop {
            match status {
                Ok(()) | Err(LuaError::Yield) => break,
                Err(e) => {
                    if self.recover(e) {
                        status = self.unroll();
                    } else {
                        let t_top = self.pool.thread(co).top;
                        self.pool.thread_mut(co).status = ThreadStatus::Error(e.status());
                        self.set_error_obj(e, t_top);
                        let top = self.pool.thread(co).top;
                        self.pool.thread_mut(co).current_ci_mut().top = top;
                        break;
                    }
                }
            }
        }
        let out = match status {
            Ok(()) => {
                self.pool.thread_mut(co).status = ThreadStatus::Dead;
                Ok(false)
            }
            Err(LuaError::Yield) => {
                self.pool.thread_mut(co).status = ThreadStatus::Yielded;
                Ok(true)
            }
            Err(e) => Err(e.status()),
        };
        self.pool.thread_mut(co).nny = old_nny;
        self.current = from;
        out
    }

    fn resume_error(&mut self, co: ThreadId, msg: &str) -> LuaError {
        if let Ok(v) = self.new_string(msg) {
            let t = self.pool.thread_mut(co);
            if t.top < t.stack_last {
                t.push(v);
            }
        }
        LuaError::Runtime
    }

    fn resume_body(&mut self, first_arg: usize) -> LuaResult<()> {
        let co = self.current;
        match self.pool.thread(co).status {
            ThreadStatus::Ok => {
                // First resume: precall the function below the
                // arguments.
                if !self.precall(first_arg - 1, LUA_MULTRET)? {
                    execute::lua_execute(self)?;
                }
                Ok(())
            }
            ThreadStatus::Yielded => {
                self.pool.thread_mut(co).status = ThreadStatus::Ok;
                let (is_lua, k, ctx, func_saved) = {
                    let ci = self.pool.thread(co).current_ci();
                    (ci.is_lua(), ci.continuation, ci.ctx, ci.extra)
                };
                {
                    let ci = self.pool.thread_mut(co).current_ci_mut();
                    ci.func = func_saved;
                }
                if is_lua {
                    // Yield happened in a hook: re-enter the opcode.
                    execute::lua_execute(self)?;
                } else {
                    let n = if let Some(k) = k {
                        {
                            let ci = self.pool.thread_mut(co).current_ci_mut();
                            ci.set_flag(CIST_YIELDED);
                        }
                        k(self, ctx)?
                    } else {
                        // No continuation: the resume arguments become
                        // the suspended call's results.
                        self.pool.thread(co).top - first_arg
                    };
                    let top = self.pool.thread(co).top;
                    self.poscall(top - n, n);
                }
                self.unroll()
            }
            _ => unreachable!("status checked by resume_coroutine"),
        }
    }

    /// Continue every suspended frame of the current coroutine until
    /// the stack is empty: Lua frames re-enter the interpreter, host
    /// frames run their continuations.
    fn unroll(&mut self) -> LuaResult<()> {
        loop {
            let co = self.current;
            if self.pool.thread(co).ci_depth == 1 {
                return Ok(());
            }
            if self.pool.thread(co).current_ci().is_lua() {
                execute::lua_execute(self)?;
            } else {
                self.finish_host_call()?;
            }
        }
    }

    /// Finish a host frame interrupted by a yield: run its
    /// continuation and complete the call.
    fn finish_host_call(&mut self) -> LuaResult<()> {
        let co = self.current;
        let (k, ctx, ypcall, old_ef) = {
            let ci = self.pool.thread(co).current_ci();
            (
                ci.continuation,
                ci.ctx,
                ci.has_flag(CIST_YPCALL),
                ci.old_errfunc,
            )
        };
        if ypcall {
            let ci = self.pool.thread_mut(co).current_ci_mut();
            ci.clear_flag(CIST_YPCALL);
            self.pool.thread_mut(co).err_func = old_ef;
        }
        let Some(k) = k else {
            return Err(self.run_error("attempt to yield across a host-call boundary".into()));
        };
        {
            let ci = self.pool.thread_mut(co).current_ci_mut();
            ci.clear_flag(CIST_STAT);
            ci.set_flag(CIST_YIELDED);
        }
        let n = k(self, ctx)?;
        let top = self.pool.thread(co).top;
        self.poscall(top - n, n);
        Ok(())
    }

    /// Unwind an error inside a resumed coroutine to the innermost
    /// yielded protected call, restoring its saved state. Returns
    /// false when there is no recovery point.
    fn recover(&mut self, e: LuaError) -> bool {
        let co = self.current;
        let depth = self.pool.thread(co).ci_depth;
        let Some(idx) = (0..depth)
            .rev()
            .find(|&i| self.pool.thread(co).ci[i].has_flag(CIST_YPCALL))
        else {
            return false;
        };
        let (old_top, old_allowhook, old_ef) = {
            let ci = &self.pool.thread(co).ci[idx];
            (ci.extra, ci.old_allowhook, ci.old_errfunc)
        };
        self.close_upvalues(co, old_top);
        {
            let t = self.pool.thread_mut(co);
            t.ci_depth = idx + 1;
        }
        self.set_error_obj(e, old_top);
        {
            let t = self.pool.thread_mut(co);
            t.allow_hook = old_allowhook;
            t.nny = 0;
            t.err_func = old_ef;
            let status = e.status();
            let ci = t.current_ci_mut();
            ci.set_flag(CIST_STAT);
            ci.status = match status {
                LuaError::Runtime => 1,
                LuaError::Syntax => 2,
                LuaError::Mem => 3,
                LuaError::GcMetamethod => 4,
                _ => 5,
            };
            t.shrink_ci();
        }
        true
    }

    /// Suspend the current coroutine, leaving `nresults` values on top
    /// for the resumer. Host callers may pass a continuation to regain
    /// control after the next resume.
    pub fn yield_values(
        &mut self,
        nresults: usize,
        k: Option<Continuation>,
        ctx: i64,
    ) -> LuaResult<usize> {
        let th = self.current;
        if self.pool.thread(th).nny > 0 {
            let msg = if th == self.main {
                "attempt to yield from outside a coroutine"
            } else {
                "attempt to yield across a C-call boundary"
            };
            return Err(self.run_error(msg.into()));
        }
        {
            let top = self.pool.thread(th).top;
            let t = self.pool.thread_mut(th);
            t.status = ThreadStatus::Yielded;
            let ci = t.current_ci_mut();
            ci.extra = ci.func;
            if ci.is_lua() {
                // Yield from a hook: no continuation allowed; the
                // dispatch loop re-executes the instruction on resume.
                debug_assert!(k.is_none());
            } else {
                ci.continuation = k;
                ci.ctx = ctx;
                // Protect the stack below the results.
                ci.func = top - nresults - 1;
            }
        }
        Err(LuaError::Yield)
    }

    // ============ Shutdown ============

    /// Run every pending finalizer, dead or not. Called on drop;
    /// finalizer errors are swallowed at this point.
    pub fn close(&mut self) {
        gc::separate_all_finalizers(&self.gc, &mut self.pool);
        let _ = self.call_pending_finalizers(usize::MAX);
    }

    // ============ Hooks ============

    pub fn hook_event(&mut self, event: HookEvent) -> LuaResult<()> {
        let th = self.current;
        let (mask, allow, hook) = {
            let t = self.pool.thread(th);
            (t.hook_mask, t.allow_hook, t.hook)
        };
        let Some(hook) = hook else { return Ok(()) };
        if !allow {
            return Ok(());
        }
        let wanted = match event {
            HookEvent::Call | HookEvent::TailCall => mask & hook_mask::CALL != 0,
            HookEvent::Return => mask & hook_mask::RET != 0,
            HookEvent::Line(_) => mask & hook_mask::LINE != 0,
            HookEvent::Count => mask & hook_mask::COUNT != 0,
        };
        if !wanted {
            return Ok(());
        }
        self.pool.thread_mut(th).allow_hook = false;
        let r = hook(self, event);
        self.pool.thread_mut(th).allow_hook = true;
        r
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        self.close();
    }
}
