// The object pool owns every collectable object in per-type arenas.
// The original's intrusive "next in all objects" links become the
// allgc/finobj/tobefnz id vectors; free arena slots are recycled
// through per-type free lists.

use crate::gc::gc_header::GcHeader;
use crate::gc::gc_object::{
    Closure, GcClosure, GcProto, GcString, GcTable, GcThread, GcUpval, GcUserdata, Proto,
    UpvalState,
};
use crate::gc::{
    ClosureId, Gc, GcId, ProtoId, StringId, TableId, ThreadId, UpvalId, UserdataId,
};
use crate::lua_value::{LuaTable, LuaValue};
use crate::lua_vm::LuaThread;

pub struct ObjectPool {
    pub strings: Vec<Option<GcString>>,
    pub tables: Vec<Option<GcTable>>,
    pub protos: Vec<Option<GcProto>>,
    pub closures: Vec<Option<GcClosure>>,
    pub upvals: Vec<Option<GcUpval>>,
    pub userdata: Vec<Option<GcUserdata>>,
    pub threads: Vec<Option<GcThread>>,

    free_strings: Vec<u32>,
    free_tables: Vec<u32>,
    free_protos: Vec<u32>,
    free_closures: Vec<u32>,
    free_upvals: Vec<u32>,
    free_userdata: Vec<u32>,
    free_threads: Vec<u32>,

    /// All ordinary collectable objects (everything except strings and
    /// open upvalue cells).
    pub allgc: Vec<GcId>,
    /// Objects separated out because their metatable defines `__gc`.
    pub finobj: Vec<GcId>,
    /// Dead finalizable objects awaiting their `__gc` call.
    pub tobefnz: Vec<GcId>,
}

fn alloc_slot<T>(arena: &mut Vec<Option<T>>, free: &mut Vec<u32>, obj: T) -> u32 {
    if let Some(i) = free.pop() {
        arena[i as usize] = Some(obj);
        i
    } else {
        arena.push(Some(obj));
        (arena.len() - 1) as u32
    }
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            strings: Vec::with_capacity(256),
            tables: Vec::with_capacity(64),
            protos: Vec::with_capacity(16),
            closures: Vec::with_capacity(32),
            upvals: Vec::with_capacity(32),
            userdata: Vec::new(),
            threads: Vec::with_capacity(4),
            free_strings: Vec::new(),
            free_tables: Vec::new(),
            free_protos: Vec::new(),
            free_closures: Vec::new(),
            free_upvals: Vec::new(),
            free_userdata: Vec::new(),
            free_threads: Vec::new(),
            allgc: Vec::with_capacity(64),
            finobj: Vec::new(),
            tobefnz: Vec::new(),
        }
    }

    // ============ Typed access ============
    // Accessors panic on a stale id; ids are internal and only the GC
    // ever frees a slot.

    #[inline(always)]
    pub fn string(&self, id: StringId) -> &GcString {
        self.strings[id.0 as usize].as_ref().expect("stale string id")
    }

    #[inline(always)]
    pub fn string_mut(&mut self, id: StringId) -> &mut GcString {
        self.strings[id.0 as usize].as_mut().expect("stale string id")
    }

    #[inline(always)]
    pub fn table(&self, id: TableId) -> &LuaTable {
        &self.tables[id.0 as usize].as_ref().expect("stale table id").data
    }

    #[inline(always)]
    pub fn table_mut(&mut self, id: TableId) -> &mut LuaTable {
        &mut self.tables[id.0 as usize].as_mut().expect("stale table id").data
    }

    #[inline(always)]
    pub fn proto(&self, id: ProtoId) -> &Proto {
        &self.protos[id.0 as usize].as_ref().expect("stale proto id").data
    }

    #[inline(always)]
    pub fn proto_mut(&mut self, id: ProtoId) -> &mut Proto {
        &mut self.protos[id.0 as usize].as_mut().expect("stale proto id").data
    }

    #[inline(always)]
    pub fn closure(&self, id: ClosureId) -> &Closure {
        &self.closures[id.0 as usize].as_ref().expect("stale closure id").data
    }

    #[inline(always)]
    pub fn closure_mut(&mut self, id: ClosureId) -> &mut Closure {
        &mut self.closures[id.0 as usize].as_mut().expect("stale closure id").data
    }

    #[inline(always)]
    pub fn upval(&self, id: UpvalId) -> &GcUpval {
        self.upvals[id.0 as usize].as_ref().expect("stale upvalue id")
    }

    #[inline(always)]
    pub fn upval_mut(&mut self, id: UpvalId) -> &mut GcUpval {
        self.upvals[id.0 as usize].as_mut().expect("stale upvalue id")
    }

    #[inline(always)]
    pub fn userdata(&self, id: UserdataId) -> &GcUserdata {
        self.userdata[id.0 as usize].as_ref().expect("stale userdata id")
    }

    #[inline(always)]
    pub fn userdata_mut(&mut self, id: UserdataId) -> &mut GcUserdata {
        self.userdata[id.0 as usize].as_mut().expect("stale userdata id")
    }

    #[inline(always)]
    pub fn thread(&self, id: ThreadId) -> &LuaThread {
        &self.threads[id.0 as usize].as_ref().expect("stale thread id").data
    }

    #[inline(always)]
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut LuaThread {
        &mut self.threads[id.0 as usize].as_mut().expect("stale thread id").data
    }

    /// Header of any live object; None while the slot is being
    /// traversed (taken) or already freed.
    pub fn header(&self, id: GcId) -> Option<&GcHeader> {
        match id {
            GcId::String(i) => self.strings.get(i.0 as usize)?.as_ref().map(|o| &o.header),
            GcId::Table(i) => self.tables.get(i.0 as usize)?.as_ref().map(|o| &o.header),
            GcId::Proto(i) => self.protos.get(i.0 as usize)?.as_ref().map(|o| &o.header),
            GcId::Closure(i) => self.closures.get(i.0 as usize)?.as_ref().map(|o| &o.header),
            GcId::Upval(i) => self.upvals.get(i.0 as usize)?.as_ref().map(|o| &o.header),
            GcId::Userdata(i) => self.userdata.get(i.0 as usize)?.as_ref().map(|o| &o.header),
            GcId::Thread(i) => self.threads.get(i.0 as usize)?.as_ref().map(|o| &o.header),
        }
    }

    pub fn header_mut(&mut self, id: GcId) -> Option<&mut GcHeader> {
        match id {
            GcId::String(i) => self.strings.get_mut(i.0 as usize)?.as_mut().map(|o| &mut o.header),
            GcId::Table(i) => self.tables.get_mut(i.0 as usize)?.as_mut().map(|o| &mut o.header),
            GcId::Proto(i) => self.protos.get_mut(i.0 as usize)?.as_mut().map(|o| &mut o.header),
            GcId::Closure(i) => self.closures.get_mut(i.0 as usize)?.as_mut().map(|o| &mut o.header),
            GcId::Upval(i) => self.upvals.get_mut(i.0 as usize)?.as_mut().map(|o| &mut o.header),
            GcId::Userdata(i) => self.userdata.get_mut(i.0 as usize)?.as_mut().map(|o| &mut o.header),
            GcId::Thread(i) => self.threads.get_mut(i.0 as usize)?.as_mut().map(|o| &mut o.header),
        }
    }

    /// GcId of a collectable value.
    pub fn value_id(v: &LuaValue) -> Option<GcId> {
        use crate::lua_value::value::*;
        let idx = if v.is_collectable() { v.gc_index() } else { return None };
        Some(match v.rawtt() {
            LUA_VSTRING => GcId::String(StringId(idx)),
            LUA_VTABLE => GcId::Table(TableId(idx)),
            LUA_VLCL | LUA_VCCL => GcId::Closure(ClosureId(idx)),
            LUA_VUSERDATA => GcId::Userdata(UserdataId(idx)),
            LUA_VTHREAD => GcId::Thread(ThreadId(idx)),
            LUA_VPROTO => GcId::Proto(ProtoId(idx)),
            LUA_VUPVAL => GcId::Upval(UpvalId(idx)),
            _ => return None,
        })
    }

    // ============ Creation ============
    // Every creation charges the collector's byte counter and colors
    // the new object with the current live white.

    /// Raw string insertion; interning and bucket bookkeeping live in
    /// the interner.
    pub(crate) fn insert_string(&mut self, gc: &mut Gc, data: Box<[u8]>, hash: u32) -> StringId {
        let size = (std::mem::size_of::<GcString>() + data.len()) as u32;
        let obj = GcString {
            header: GcHeader::with_white(gc.current_white, size),
            data,
            hash,
            reserved: 0,
        };
        gc.charge(size as usize);
        StringId(alloc_slot(&mut self.strings, &mut self.free_strings, obj))
    }

    pub fn create_table(&mut self, gc: &mut Gc, narray: usize, nhash: usize) -> TableId {
        let data = LuaTable::new(narray, nhash);
        let size = data.mem_size() as u32;
        let obj = GcTable {
            header: GcHeader::with_white(gc.current_white, size),
            data,
        };
        gc.charge(size as usize);
        let id = TableId(alloc_slot(&mut self.tables, &mut self.free_tables, obj));
        self.allgc.push(GcId::Table(id));
        id
    }

    pub fn create_proto(&mut self, gc: &mut Gc, data: Proto) -> ProtoId {
        let size = data.mem_size() as u32;
        let obj = GcProto {
            header: GcHeader::with_white(gc.current_white, size),
            data,
        };
        gc.charge(size as usize);
        let id = ProtoId(alloc_slot(&mut self.protos, &mut self.free_protos, obj));
        self.allgc.push(GcId::Proto(id));
        id
    }

    pub fn create_closure(&mut self, gc: &mut Gc, data: Closure) -> ClosureId {
        let size = data.mem_size() as u32;
        let obj = GcClosure {
            header: GcHeader::with_white(gc.current_white, size),
            data,
        };
        gc.charge(size as usize);
        let id = ClosureId(alloc_slot(&mut self.closures, &mut self.free_closures, obj));
        self.allgc.push(GcId::Closure(id));
        id
    }

    /// Open cells live only on the open-upvalue lists; they join allgc
    /// when closed.
    pub fn create_upval_open(&mut self, gc: &mut Gc, thread: ThreadId, slot: usize) -> UpvalId {
        let size = std::mem::size_of::<GcUpval>() as u32;
        let obj = GcUpval {
            header: GcHeader::with_white(gc.current_white, size),
            data: UpvalState::Open { thread, slot },
        };
        gc.charge(size as usize);
        UpvalId(alloc_slot(&mut self.upvals, &mut self.free_upvals, obj))
    }

    pub fn create_upval_closed(&mut self, gc: &mut Gc, v: LuaValue) -> UpvalId {
        let size = std::mem::size_of::<GcUpval>() as u32;
        let obj = GcUpval {
            header: GcHeader::with_white(gc.current_white, size),
            data: UpvalState::Closed(v),
        };
        gc.charge(size as usize);
        let id = UpvalId(alloc_slot(&mut self.upvals, &mut self.free_upvals, obj));
        self.allgc.push(GcId::Upval(id));
        id
    }

    pub fn create_userdata(
        &mut self,
        gc: &mut Gc,
        data: Vec<u8>,
        env: Option<TableId>,
    ) -> UserdataId {
        let size = (std::mem::size_of::<GcUserdata>() + data.len()) as u32;
        let obj = GcUserdata {
            header: GcHeader::with_white(gc.current_white, size),
            data,
            metatable: None,
            env,
        };
        gc.charge(size as usize);
        let id = UserdataId(alloc_slot(&mut self.userdata, &mut self.free_userdata, obj));
        self.allgc.push(GcId::Userdata(id));
        id
    }

    pub fn create_thread(&mut self, gc: &mut Gc) -> ThreadId {
        // Reserve the slot index first so the thread knows its own id.
        let idx = if let Some(i) = self.free_threads.pop() {
            i
        } else {
            self.threads.push(None);
            (self.threads.len() - 1) as u32
        };
        let id = ThreadId(idx);
        let data = LuaThread::new(id);
        let size = data.mem_size() as u32;
        gc.charge(size as usize);
        self.threads[idx as usize] = Some(GcThread {
            header: GcHeader::with_white(gc.current_white, size),
            data,
        });
        self.allgc.push(GcId::Thread(id));
        id
    }

    // ============ Finalizer bookkeeping ============

    /// Move an object from allgc to the finalizers list (called when a
    /// metatable with `__gc` is attached and the object is not already
    /// separated or finalized).
    pub fn separate_for_finalization(&mut self, id: GcId) {
        if let Some(pos) = self.allgc.iter().position(|&o| o == id) {
            self.allgc.swap_remove(pos);
            self.finobj.push(id);
            if let Some(h) = self.header_mut(id) {
                h.set_separated(true);
            }
        }
    }

    // ============ Destruction ============

    /// Destroy one object, returning the bytes it was charged for.
    /// Strings must already be unlinked from the interner.
    pub fn free_object(&mut self, id: GcId) -> usize {
        let size = self.header(id).map(|h| h.size as usize).unwrap_or(0);
        match id {
            GcId::String(i) => {
                self.strings[i.0 as usize] = None;
                self.free_strings.push(i.0);
            }
            GcId::Table(i) => {
                self.tables[i.0 as usize] = None;
                self.free_tables.push(i.0);
            }
            GcId::Proto(i) => {
                self.protos[i.0 as usize] = None;
                self.free_protos.push(i.0);
            }
            GcId::Closure(i) => {
                self.closures[i.0 as usize] = None;
                self.free_closures.push(i.0);
            }
            GcId::Upval(i) => {
                self.upvals[i.0 as usize] = None;
                self.free_upvals.push(i.0);
            }
            GcId::Userdata(i) => {
                self.userdata[i.0 as usize] = None;
                self.free_userdata.push(i.0);
            }
            GcId::Thread(i) => {
                self.threads[i.0 as usize] = None;
                self.free_threads.push(i.0);
            }
        }
        size
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}
