// Garbage collector: tri-color incremental mark-sweep with weak
// tables, ephemerons, finalizers, and a generational minor mode.
//
// State order: pause -> propagate -> atomic -> sweep-strings ->
// sweep-userdata -> sweep-all -> pause. Each step performs bounded
// work driven by the allocation debt. The invariant "a black object
// never references a live-white object" is maintained by forward
// barriers (closures, prototypes, userdata, upvalue cells) and
// backward barriers (tables); it is relaxed during sweep.
//
// In generational mode the invariant is kept at all times, survivors
// stay black between minor collections, and weak tables and threads
// persist on the gray lists so each atomic pass re-scans them.

mod gc_header;
mod gc_id;
mod gc_object;
mod object_pool;
mod string_interner;

pub use gc_header::*;
pub use gc_id::*;
pub use gc_object::*;
pub use object_pool::*;
pub use string_interner::*;

use crate::lua_value::{LuaValue, LUA_NUMTAGS};
use crate::lua_vm::lua_limits::{
    DEFAULT_GC_MAJORINC, DEFAULT_GC_PAUSE, DEFAULT_GC_STEPMUL, GC_STEP_SIZE,
};

/// Objects swept per work chunk.
const SWEEP_MAX: usize = 40;
/// Work units charged per swept object.
const SWEEP_COST: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    Atomic,
    SweepString,
    SweepUserdata,
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Incremental,
    Generational,
}

/// Root set snapshot handed in by the VM for each collector call.
/// Values are copied in; a LuaValue is a 16-byte id-carrying cell, so
/// the snapshot is cheap.
pub struct GcRoots {
    pub main: ThreadId,
    pub current: ThreadId,
    pub registry: LuaValue,
    /// Base-type metatables, indexed by base tag.
    pub base_metatables: [LuaValue; LUA_NUMTAGS],
    /// Interned "__mode" key for weak-table classification.
    pub mode_key: LuaValue,
    /// Values pinned by the embedding API's anchor chain.
    pub anchors: Vec<LuaValue>,
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub minor_cycles: usize,
    pub objects_collected: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
}

pub struct Gc {
    pub state: GcState,
    pub kind: GcKind,
    /// Which of the two white bits is "live" (0 or 1); flips at the
    /// end of every atomic step.
    pub current_white: u8,
    /// Total bytes charged by the allocator.
    pub total_bytes: usize,
    /// Allocation debt; a step runs when it turns positive.
    pub debt: isize,
    /// Heap size after the last (major) collection; 0 signals that the
    /// next generational collection must be a major one.
    pub estimate: usize,
    pub pause_pct: i32,
    pub stepmul_pct: i32,
    pub majorinc_pct: i32,
    /// Collector toggled off by the host.
    pub running: bool,
    /// Emergency collection in progress: no finalizers, no stack
    /// shrinking.
    pub emergency: bool,
    in_atomic: bool,

    pub gray: Vec<GcId>,
    pub grayagain: Vec<GcId>,
    pub weak: Vec<TableId>,
    pub ephemeron: Vec<TableId>,
    pub allweak: Vec<TableId>,
    /// VM-global open-upvalue list (cells aliasing some thread stack).
    pub open_upvals: Vec<UpvalId>,

    sweep_string_cursor: usize,
    sweep_cursor: usize,

    pub stats: GcStats,
}

impl Gc {
    pub fn new() -> Self {
        Gc {
            state: GcState::Pause,
            kind: GcKind::Incremental,
            current_white: 0,
            total_bytes: 0,
            debt: 0,
            estimate: 0,
            pause_pct: DEFAULT_GC_PAUSE,
            stepmul_pct: DEFAULT_GC_STEPMUL,
            majorinc_pct: DEFAULT_GC_MAJORINC,
            running: true,
            emergency: false,
            in_atomic: false,
            gray: Vec::with_capacity(64),
            grayagain: Vec::with_capacity(32),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            open_upvals: Vec::new(),
            sweep_string_cursor: 0,
            sweep_cursor: 0,
            stats: GcStats::default(),
        }
    }

    #[inline(always)]
    pub fn charge(&mut self, size: usize) {
        self.total_bytes += size;
        self.debt += size as isize;
        self.stats.bytes_allocated += size;
    }

    #[inline(always)]
    pub fn uncharge(&mut self, size: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(size);
        self.stats.bytes_freed += size;
    }

    #[inline(always)]
    pub fn should_step(&self) -> bool {
        self.running && self.debt > 0
    }

    /// Must the black-to-white invariant hold right now?
    #[inline(always)]
    pub fn keep_invariant(&self) -> bool {
        self.kind == GcKind::Generational
            || matches!(self.state, GcState::Propagate | GcState::Atomic)
    }

    #[inline(always)]
    pub fn is_sweep_phase(&self) -> bool {
        matches!(
            self.state,
            GcState::SweepString | GcState::SweepUserdata | GcState::Sweep
        )
    }

    fn set_pause(&mut self) {
        self.estimate = self.total_bytes.max(1);
        let threshold = (self.estimate / 100).saturating_mul(self.pause_pct as usize);
        self.debt = self.total_bytes as isize - threshold as isize;
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Marking ============

fn value_is_white(pool: &ObjectPool, v: &LuaValue) -> bool {
    match ObjectPool::value_id(v) {
        Some(id) => pool.header(id).map(|h| h.is_white()).unwrap_or(false),
        None => false,
    }
}

pub fn mark_value(gc: &mut Gc, pool: &mut ObjectPool, v: &LuaValue) {
    if let Some(id) = ObjectPool::value_id(v) {
        mark_object(gc, pool, id);
    }
}

/// Make a white object reachable: leaves go straight to black, branch
/// objects turn gray and join the gray list. Open upvalue cells stay
/// gray off-list; the atomic step re-marks their targets.
pub fn mark_object(gc: &mut Gc, pool: &mut ObjectPool, id: GcId) {
    let Some(h) = pool.header(id) else { return };
    if !h.is_white() {
        return;
    }
    match id {
        GcId::String(_) => {
            pool.header_mut(id).unwrap().make_black();
        }
        GcId::Upval(u) => {
            let state = pool.upval(u).data;
            match state {
                UpvalState::Closed(v) => {
                    pool.header_mut(id).unwrap().make_black();
                    mark_value(gc, pool, &v);
                }
                UpvalState::Open { .. } => {
                    pool.header_mut(id).unwrap().make_gray();
                }
            }
        }
        GcId::Userdata(u) => {
            pool.header_mut(id).unwrap().make_black();
            let (mt, env) = {
                let ud = pool.userdata(u);
                (ud.metatable, ud.env)
            };
            if let Some(mt) = mt {
                mark_object(gc, pool, GcId::Table(mt));
            }
            if let Some(env) = env {
                mark_object(gc, pool, GcId::Table(env));
            }
        }
        _ => {
            pool.header_mut(id).unwrap().make_gray();
            gc.gray.push(id);
        }
    }
}

fn mark_root_set(gc: &mut Gc, pool: &mut ObjectPool, roots: &GcRoots) {
    gc.gray.clear();
    gc.grayagain.clear();
    gc.weak.clear();
    gc.ephemeron.clear();
    gc.allweak.clear();
    mark_object(gc, pool, GcId::Thread(roots.main));
    mark_value(gc, pool, &roots.registry);
    for mt in roots.base_metatables.iter() {
        mark_value(gc, pool, mt);
    }
    // Objects already pending finalization stay alive until their
    // __gc runs.
    let pending: Vec<GcId> = pool.tobefnz.clone();
    for id in pending {
        mark_object(gc, pool, id);
    }
    for v in roots.anchors.iter() {
        mark_value(gc, pool, v);
    }
    // Open upvalue cells live outside allgc until closed; keep them
    // (not necessarily their targets) reachable while open.
    let open: Vec<UpvalId> = gc.open_upvals.clone();
    for u in open {
        mark_object(gc, pool, GcId::Upval(u));
    }
}

/// Pop one gray object and traverse it; returns the work done.
fn propagate_mark(gc: &mut Gc, pool: &mut ObjectPool, roots: &GcRoots) -> usize {
    let Some(id) = gc.gray.pop() else { return 0 };
    if pool.header(id).is_none() {
        return 1;
    }
    match id {
        GcId::Table(t) => traverse_table(gc, pool, roots, t),
        GcId::Closure(c) => traverse_closure(gc, pool, c),
        GcId::Proto(p) => traverse_proto(gc, pool, p),
        GcId::Thread(t) => traverse_thread(gc, pool, t),
        // Leaves never reach the gray list.
        _ => 1,
    }
}

fn propagate_all(gc: &mut Gc, pool: &mut ObjectPool, roots: &GcRoots) -> usize {
    let mut work = 0;
    while !gc.gray.is_empty() {
        work += propagate_mark(gc, pool, roots);
    }
    work
}

/// Weak-mode flags of a table, read from its metatable's `__mode`.
fn table_weakness(pool: &ObjectPool, t: TableId, mode_key: &LuaValue) -> (bool, bool) {
    let Some(mt) = pool.table(t).metatable else {
        return (false, false);
    };
    let mode = pool.table(mt).get(mode_key);
    let Some(sid) = mode.as_string_id() else {
        return (false, false);
    };
    let bytes = pool.string(sid).as_bytes();
    (bytes.contains(&b'k'), bytes.contains(&b'v'))
}

/// A weak entry is cleared when its key/value is a white collectable.
/// Strings behave as values: marked on sight, never cleared.
fn is_cleared(gc: &mut Gc, pool: &mut ObjectPool, v: &LuaValue) -> bool {
    if !v.is_collectable() {
        return false;
    }
    if v.is_string() {
        mark_value(gc, pool, v);
        return false;
    }
    value_is_white(pool, v)
}

fn traverse_table(gc: &mut Gc, pool: &mut ObjectPool, roots: &GcRoots, t: TableId) -> usize {
    if let Some(mt) = pool.table(t).metatable {
        mark_object(gc, pool, GcId::Table(mt));
    }
    let (weak_key, weak_value) = table_weakness(pool, t, &roots.mode_key);
    let id = GcId::Table(t);
    if !weak_key && !weak_value {
        pool.header_mut(id).unwrap().make_black();
        traverse_strong_table(gc, pool, t)
    } else if !weak_key {
        pool.header_mut(id).unwrap().make_gray();
        traverse_weak_value_table(gc, pool, t)
    } else if !weak_value {
        pool.header_mut(id).unwrap().make_gray();
        let (work, _marked) = traverse_ephemeron_table(gc, pool, t);
        work
    } else {
        pool.header_mut(id).unwrap().make_gray();
        gc.allweak.push(t);
        1
    }
}

fn traverse_strong_table(gc: &mut Gc, pool: &mut ObjectPool, t: TableId) -> usize {
    let alen = pool.table(t).array.len();
    for i in 0..alen {
        let v = pool.table(t).array[i];
        mark_value(gc, pool, &v);
    }
    let nlen = pool.table(t).node.len();
    for i in 0..nlen {
        let (k, v) = {
            let n = &pool.table(t).node[i];
            (n.key, n.val)
        };
        if v.is_nil() {
            // Entry is empty: clear a dead key so it can be collected.
            if k.is_collectable() && value_is_white(pool, &k) {
                pool.table_mut(t).node[i].key = k.to_dead_key();
            }
        } else {
            mark_value(gc, pool, &k);
            mark_value(gc, pool, &v);
        }
    }
    1 + alen + 2 * nlen
}

/// Strong keys, weak values: mark keys; if any value may still die,
/// the table goes on the weak list for clearing after the atomic mark.
fn traverse_weak_value_table(gc: &mut Gc, pool: &mut ObjectPool, t: TableId) -> usize {
    // An array part is assumed to hold clearable values.
    let mut has_clears = pool.table(t).array.len() > 0;
    let nlen = pool.table(t).node.len();
    for i in 0..nlen {
        let (k, v) = {
            let n = &pool.table(t).node[i];
            (n.key, n.val)
        };
        if v.is_nil() {
            if k.is_collectable() && value_is_white(pool, &k) {
                pool.table_mut(t).node[i].key = k.to_dead_key();
            }
        } else {
            mark_value(gc, pool, &k);
            if !has_clears && is_cleared(gc, pool, &v) {
                has_clears = true;
            }
        }
    }
    if has_clears {
        gc.weak.push(t);
    } else {
        gc.grayagain.push(GcId::Table(t));
    }
    1 + 2 * nlen
}

/// Weak keys, strong values. Returns (work, marked-something).
fn traverse_ephemeron_table(gc: &mut Gc, pool: &mut ObjectPool, t: TableId) -> (usize, bool) {
    let mut marked = false;
    let mut has_clears = false;
    let mut must_propagate = false;
    // Array keys are integers, hence strong.
    let alen = pool.table(t).array.len();
    for i in 0..alen {
        let v = pool.table(t).array[i];
        if value_is_white(pool, &v) {
            marked = true;
            mark_value(gc, pool, &v);
        }
    }
    let nlen = pool.table(t).node.len();
    for i in 0..nlen {
        let (k, v) = {
            let n = &pool.table(t).node[i];
            (n.key, n.val)
        };
        if v.is_nil() {
            if k.is_collectable() && value_is_white(pool, &k) {
                pool.table_mut(t).node[i].key = k.to_dead_key();
            }
        } else if is_cleared(gc, pool, &k) {
            has_clears = true;
            if value_is_white(pool, &v) {
                must_propagate = true;
            }
        } else if value_is_white(pool, &v) {
            marked = true;
            mark_value(gc, pool, &v);
        }
    }
    if must_propagate {
        gc.ephemeron.push(t);
    } else if has_clears {
        gc.allweak.push(t);
    } else {
        gc.grayagain.push(GcId::Table(t));
    }
    (1 + alen + 2 * nlen, marked)
}

fn traverse_closure(gc: &mut Gc, pool: &mut ObjectPool, c: ClosureId) -> usize {
    pool.header_mut(GcId::Closure(c)).unwrap().make_black();
    enum Parts {
        Lua(ProtoId, Vec<UpvalId>),
        Host(Vec<LuaValue>),
    }
    let parts = match pool.closure(c) {
        Closure::Lua(cl) => Parts::Lua(cl.proto, cl.upvals.clone()),
        Closure::Host(cl) => Parts::Host(cl.upvals.clone()),
    };
    match parts {
        Parts::Lua(p, ups) => {
            mark_object(gc, pool, GcId::Proto(p));
            let n = ups.len();
            for u in ups {
                mark_object(gc, pool, GcId::Upval(u));
            }
            1 + n
        }
        Parts::Host(ups) => {
            let n = ups.len();
            for v in &ups {
                mark_value(gc, pool, v);
            }
            1 + n
        }
    }
}

fn traverse_proto(gc: &mut Gc, pool: &mut ObjectPool, p: ProtoId) -> usize {
    pool.header_mut(GcId::Proto(p)).unwrap().make_black();
    // Let an unreachable cached closure be collected.
    if let Some(cached) = pool.proto(p).cache {
        if pool
            .header(GcId::Closure(cached))
            .map(|h| h.is_white())
            .unwrap_or(true)
        {
            pool.proto_mut(p).cache = None;
        }
    }
    let source = pool.proto(p).source;
    mark_object(gc, pool, GcId::String(source));
    let nk = pool.proto(p).k.len();
    for i in 0..nk {
        let v = pool.proto(p).k[i];
        mark_value(gc, pool, &v);
    }
    let nup = pool.proto(p).upvalues.len();
    for i in 0..nup {
        let name = pool.proto(p).upvalues[i].name;
        mark_object(gc, pool, GcId::String(name));
    }
    let nloc = pool.proto(p).locvars.len();
    for i in 0..nloc {
        let name = pool.proto(p).locvars[i].name;
        mark_object(gc, pool, GcId::String(name));
    }
    let nsub = pool.proto(p).protos.len();
    for i in 0..nsub {
        let sub = pool.proto(p).protos[i];
        mark_object(gc, pool, GcId::Proto(sub));
    }
    1 + nk + nup + nloc + nsub
}

/// Threads stay gray and are revisited in the atomic step (their
/// stacks mutate without barriers). Only slots below the top are
/// live: registers above it are dead by compiler invariant, and the
/// atomic pass nils them so they cannot pin garbage.
fn traverse_thread(gc: &mut Gc, pool: &mut ObjectPool, t: ThreadId) -> usize {
    let top = pool.thread(t).top;
    for i in 0..top {
        let v = pool.thread(t).stack[i];
        mark_value(gc, pool, &v);
    }
    if gc.in_atomic {
        let th = pool.thread_mut(t);
        let len = th.stack.len();
        for i in top..len {
            th.stack[i] = LuaValue::nil();
        }
    }
    let id = GcId::Thread(t);
    if gc.in_atomic {
        pool.header_mut(id).unwrap().make_black();
    } else {
        pool.header_mut(id).unwrap().make_gray();
        gc.grayagain.push(id);
    }
    1 + top
}

/// Open upvalue cells of possibly-unreferenced threads: re-mark the
/// stack slots of any cell that is still gray.
fn remark_upvals(gc: &mut Gc, pool: &mut ObjectPool) {
    let cells: Vec<UpvalId> = gc.open_upvals.clone();
    for u in cells {
        let Some(h) = pool.header(GcId::Upval(u)) else { continue };
        if !h.is_gray() {
            continue;
        }
        if let UpvalState::Open { thread, slot } = pool.upval(u).data {
            if pool.threads.get(thread.0 as usize).map(|s| s.is_some()).unwrap_or(false) {
                let v = pool.thread(thread).stack[slot];
                mark_value(gc, pool, &v);
            }
        }
    }
}

fn converge_ephemerons(gc: &mut Gc, pool: &mut ObjectPool, roots: &GcRoots) {
    loop {
        let mut changed = false;
        let list = std::mem::take(&mut gc.ephemeron);
        for t in list {
            if pool.header(GcId::Table(t)).is_none() {
                continue;
            }
            let (_w, marked) = traverse_ephemeron_table(gc, pool, t);
            if marked {
                propagate_all(gc, pool, roots);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn clear_values(gc: &mut Gc, pool: &mut ObjectPool, list: Vec<TableId>, from: usize) -> Vec<TableId> {
    for &t in &list[from..] {
        if pool.header(GcId::Table(t)).is_none() {
            continue;
        }
        let alen = pool.table(t).array.len();
        for i in 0..alen {
            let v = pool.table(t).array[i];
            if is_cleared(gc, pool, &v) {
                pool.table_mut(t).array[i] = LuaValue::nil();
            }
        }
        let nlen = pool.table(t).node.len();
        for i in 0..nlen {
            let (k, v) = {
                let n = &pool.table(t).node[i];
                (n.key, n.val)
            };
            if !v.is_nil() && is_cleared(gc, pool, &v) {
                let n = &mut pool.table_mut(t).node[i];
                n.val = LuaValue::nil();
                if k.is_collectable() {
                    n.key = k.to_dead_key();
                }
            }
        }
    }
    list
}

fn clear_keys(gc: &mut Gc, pool: &mut ObjectPool, list: &[TableId]) {
    for &t in list {
        if pool.header(GcId::Table(t)).is_none() {
            continue;
        }
        let nlen = pool.table(t).node.len();
        for i in 0..nlen {
            let (k, v) = {
                let n = &pool.table(t).node[i];
                (n.key, n.val)
            };
            if !v.is_nil() && is_cleared(gc, pool, &k) {
                let n = &mut pool.table_mut(t).node[i];
                n.val = LuaValue::nil();
                n.key = k.to_dead_key();
            }
        }
    }
}

/// Queue every object with a pending finalizer regardless of
/// liveness; used at VM shutdown.
pub fn separate_all_finalizers(gc: &Gc, pool: &mut ObjectPool) {
    separate_tobefnz(gc, pool, true);
}

/// Move every dead object with a pending finalizer from the finalizers
/// list to the to-be-finalized list (`all` forces every one, used at
/// VM shutdown).
fn separate_tobefnz(gc: &Gc, pool: &mut ObjectPool, all: bool) {
    let mut i = 0;
    while i < pool.finobj.len() {
        let id = pool.finobj[i];
        let dead = pool
            .header(id)
            .map(|h| h.is_white() || all)
            .unwrap_or(false);
        if dead {
            pool.finobj.swap_remove(i);
            pool.tobefnz.push(id);
        } else {
            i += 1;
        }
    }
    let _ = gc;
}

// ============ Atomic step ============

fn atomic(gc: &mut Gc, pool: &mut ObjectPool, roots: &GcRoots) {
    gc.state = GcState::Atomic;
    gc.in_atomic = true;
    mark_object(gc, pool, GcId::Thread(roots.current));
    // The registry and base metatables may have been mutated during
    // propagation.
    mark_value(gc, pool, &roots.registry);
    for mt in roots.base_metatables.iter() {
        mark_value(gc, pool, mt);
    }
    // Open cells stay reachable while open (they leave allgc only
    // when closed); their targets are re-marked below.
    let open: Vec<UpvalId> = gc.open_upvals.clone();
    for u in open {
        mark_object(gc, pool, GcId::Upval(u));
    }
    remark_upvals(gc, pool);
    propagate_all(gc, pool, roots);
    // Retraverse objects caught by write barriers and weak tables
    // classified during propagation.
    let grayagain = std::mem::take(&mut gc.grayagain);
    for id in grayagain {
        if let Some(h) = pool.header_mut(id) {
            if !h.is_black() {
                h.make_gray();
                gc.gray.push(id);
            }
        }
    }
    propagate_all(gc, pool, roots);
    let weak_list = std::mem::take(&mut gc.weak);
    for t in weak_list {
        if pool.header(GcId::Table(t)).is_some() {
            traverse_weak_value_table(gc, pool, t);
        }
    }
    propagate_all(gc, pool, roots);
    let eph_list = std::mem::take(&mut gc.ephemeron);
    for t in eph_list {
        if pool.header(GcId::Table(t)).is_some() {
            let (_w, marked) = traverse_ephemeron_table(gc, pool, t);
            if marked {
                propagate_all(gc, pool, roots);
            }
        }
    }
    converge_ephemerons(gc, pool, roots);
    // All strongly-reachable objects are marked: clear weak values
    // before looking at finalizers.
    let weak_list = std::mem::take(&mut gc.weak);
    let weak_list = clear_values(gc, pool, weak_list, 0);
    let allweak_list = std::mem::take(&mut gc.allweak);
    let allweak_list = clear_values(gc, pool, allweak_list, 0);
    let orig_weak = weak_list.len();
    let orig_allweak = allweak_list.len();
    gc.weak = weak_list;
    gc.allweak = allweak_list;
    separate_tobefnz(gc, pool, false);
    // Resurrect objects awaiting finalization and whatever they keep
    // alive.
    let pending: Vec<GcId> = pool.tobefnz.clone();
    for id in pending {
        mark_object(gc, pool, id);
    }
    propagate_all(gc, pool, roots);
    converge_ephemerons(gc, pool, roots);
    // Remove dead keys, then clear values from resurrected weak
    // tables.
    let eph = std::mem::take(&mut gc.ephemeron);
    clear_keys(gc, pool, &eph);
    gc.ephemeron = eph;
    let aw = std::mem::take(&mut gc.allweak);
    clear_keys(gc, pool, &aw);
    gc.allweak = aw;
    let weak_list = std::mem::take(&mut gc.weak);
    let weak_list = clear_values(gc, pool, weak_list, orig_weak);
    gc.weak = weak_list;
    let allweak_list = std::mem::take(&mut gc.allweak);
    let allweak_list = clear_values(gc, pool, allweak_list, orig_allweak);
    gc.allweak = allweak_list;
    // Flip the live white: everything still wearing the old color is
    // now condemned.
    gc.current_white ^= 1;
    gc.sweep_string_cursor = 0;
    gc.sweep_cursor = 0;
    gc.in_atomic = false;
    gc.state = GcState::SweepString;
    gc.stats.cycles += 1;
}

// ============ Sweeping ============

/// Close one open upvalue cell with the given value. Handles list
/// unlinking and the color rules for cells touched mid-collection.
pub fn close_upvalue(gc: &mut Gc, pool: &mut ObjectPool, u: UpvalId, value: LuaValue) {
    if let Some(pos) = gc.open_upvals.iter().position(|&x| x == u) {
        gc.open_upvals.swap_remove(pos);
    }
    if pool
        .header(GcId::Upval(u))
        .map(|h| h.is_dead(gc.current_white))
        .unwrap_or(true)
    {
        let size = pool.free_object(GcId::Upval(u));
        gc.uncharge(size);
        gc.stats.objects_collected += 1;
        return;
    }
    pool.upval_mut(u).data = UpvalState::Closed(value);
    pool.allgc.push(GcId::Upval(u));
    // Color rules: an open cell is never black; if it was gray, either
    // mark its value now (invariant holds) or whiten the cell (sweep).
    let is_gray = pool.header(GcId::Upval(u)).map(|h| h.is_gray()).unwrap_or(false);
    if is_gray {
        if gc.keep_invariant() {
            pool.header_mut(GcId::Upval(u)).unwrap().make_black();
            mark_value(gc, pool, &value);
        } else {
            let white = gc.current_white;
            pool.header_mut(GcId::Upval(u)).unwrap().make_white(white);
        }
    }
}

fn free_with_cleanup(gc: &mut Gc, pool: &mut ObjectPool, strt: &mut StringInterner, id: GcId) {
    if let GcId::Thread(t) = id {
        // Close the dying thread's open upvalues first; live cells
        // keep the stacked values.
        let open: Vec<UpvalId> = std::mem::take(&mut pool.thread_mut(t).open_upvals);
        for u in open {
            if pool.upvals.get(u.0 as usize).map(|s| s.is_some()).unwrap_or(false) {
                if let UpvalState::Open { slot, .. } = pool.upval(u).data {
                    let v = pool.thread(t).stack[slot];
                    close_upvalue(gc, pool, u, v);
                }
            }
        }
    }
    if let GcId::String(s) = id {
        strt.remove(pool, s);
    }
    let size = pool.free_object(id);
    gc.uncharge(size);
    gc.stats.objects_collected += 1;
}

/// Retint a surviving object for the next cycle. Incremental mode
/// whitens; generational minor collections leave colors alone so old
/// objects stay black.
fn sweep_survivor(gc: &Gc, pool: &mut ObjectPool, id: GcId) {
    if gc.kind == GcKind::Generational {
        if let Some(h) = pool.header_mut(id) {
            h.set_old(true);
        }
        return;
    }
    let white = gc.current_white;
    if let Some(h) = pool.header_mut(id) {
        if !h.is_fixed() {
            h.make_white(white);
        }
    }
}

fn sweep_strings_step(gc: &mut Gc, pool: &mut ObjectPool, strt: &mut StringInterner) -> usize {
    let mut count = 0;
    while gc.sweep_string_cursor < pool.strings.len() && count < SWEEP_MAX {
        let i = gc.sweep_string_cursor;
        gc.sweep_string_cursor += 1;
        let Some(s) = &pool.strings[i] else { continue };
        let id = GcId::String(StringId(i as u32));
        if s.header.is_dead(gc.current_white) && !s.header.is_fixed() {
            free_with_cleanup(gc, pool, strt, id);
        } else {
            sweep_survivor(gc, pool, id);
        }
        count += 1;
    }
    if gc.sweep_string_cursor >= pool.strings.len() {
        gc.state = GcState::SweepUserdata;
    }
    count * SWEEP_COST
}

/// Retint the finalizers list and the to-be-finalized queue; every
/// object there was kept alive by the atomic step.
fn sweep_userdata_step(gc: &mut Gc, pool: &mut ObjectPool) -> usize {
    let finobj: Vec<GcId> = pool.finobj.clone();
    for id in &finobj {
        sweep_survivor(gc, pool, *id);
    }
    let tobefnz: Vec<GcId> = pool.tobefnz.clone();
    for id in &tobefnz {
        sweep_survivor(gc, pool, *id);
    }
    gc.sweep_cursor = 0;
    gc.state = GcState::Sweep;
    (finobj.len() + tobefnz.len()) * SWEEP_COST + 1
}

fn sweep_all_step(gc: &mut Gc, pool: &mut ObjectPool, strt: &mut StringInterner) -> usize {
    let mut count = 0;
    while gc.sweep_cursor < pool.allgc.len() && count < SWEEP_MAX {
        let i = gc.sweep_cursor;
        let id = pool.allgc[i];
        let dead = pool
            .header(id)
            .map(|h| h.is_dead(gc.current_white) && !h.is_fixed())
            .unwrap_or(true);
        if dead {
            pool.allgc.swap_remove(i);
            free_with_cleanup(gc, pool, strt, id);
        } else {
            if let GcId::Thread(t) = id {
                sweep_thread_upvals(gc, pool, t);
                if !gc.emergency {
                    pool.thread_mut(t).shrink_stack();
                }
            }
            sweep_survivor(gc, pool, id);
            gc.sweep_cursor += 1;
        }
        count += 1;
    }
    if gc.sweep_cursor >= pool.allgc.len() {
        gc.state = GcState::Pause;
        gc.estimate = gc.total_bytes;
    }
    count * SWEEP_COST
}

/// Sweep a live thread's open-upvalue list: free dead cells, whiten
/// the rest.
fn sweep_thread_upvals(gc: &mut Gc, pool: &mut ObjectPool, t: ThreadId) {
    let open: Vec<UpvalId> = pool.thread(t).open_upvals.clone();
    let mut kept = Vec::with_capacity(open.len());
    for u in open {
        let Some(h) = pool.header(GcId::Upval(u)) else { continue };
        if h.is_dead(gc.current_white) && !h.is_fixed() {
            if let Some(pos) = gc.open_upvals.iter().position(|&x| x == u) {
                gc.open_upvals.swap_remove(pos);
            }
            let size = pool.free_object(GcId::Upval(u));
            gc.uncharge(size);
            gc.stats.objects_collected += 1;
        } else {
            if gc.kind == GcKind::Incremental {
                let white = gc.current_white;
                let h = pool.header_mut(GcId::Upval(u)).unwrap();
                if !h.is_fixed() {
                    h.make_white(white);
                }
            }
            kept.push(u);
        }
    }
    pool.thread_mut(t).open_upvals = kept;
}

// ============ Step driver ============

/// One bounded unit of collector work; returns work done.
fn single_step(
    gc: &mut Gc,
    pool: &mut ObjectPool,
    strt: &mut StringInterner,
    roots: &GcRoots,
) -> usize {
    match gc.state {
        GcState::Pause => {
            mark_root_set(gc, pool, roots);
            gc.state = GcState::Propagate;
            gc.gray.len() + 1
        }
        GcState::Propagate => {
            if !gc.gray.is_empty() {
                propagate_mark(gc, pool, roots)
            } else {
                atomic(gc, pool, roots);
                SWEEP_MAX
            }
        }
        GcState::Atomic => unreachable!("atomic is indivisible"),
        GcState::SweepString => sweep_strings_step(gc, pool, strt),
        GcState::SweepUserdata => sweep_userdata_step(gc, pool),
        GcState::Sweep => sweep_all_step(gc, pool, strt),
    }
}

fn run_until_pause(gc: &mut Gc, pool: &mut ObjectPool, strt: &mut StringInterner, roots: &GcRoots) {
    loop {
        single_step(gc, pool, strt, roots);
        if gc.state == GcState::Pause {
            return;
        }
    }
}

/// Incremental step driven by the allocation debt. Returns true when
/// finalizers are pending and the VM should run a batch.
pub fn step(
    gc: &mut Gc,
    pool: &mut ObjectPool,
    strt: &mut StringInterner,
    roots: &GcRoots,
) -> bool {
    match gc.kind {
        GcKind::Incremental => {
            let stepmul = gc.stepmul_pct.max(40) as isize;
            let mut budget = (gc.debt / GC_STEP_SIZE + 1) * stepmul;
            loop {
                let work = single_step(gc, pool, strt, roots);
                budget -= work as isize;
                if gc.state == GcState::Pause {
                    gc.set_pause();
                    break;
                }
                if budget <= 0 {
                    gc.debt = -GC_STEP_SIZE;
                    break;
                }
            }
        }
        GcKind::Generational => generational_step(gc, pool, strt, roots),
    }
    !pool.tobefnz.is_empty()
}

/// Minor collection: resume from Propagate (lists persist across
/// cycles), mark, sweep without retinting, and check whether the heap
/// grew enough to demand a major collection.
fn generational_step(
    gc: &mut Gc,
    pool: &mut ObjectPool,
    strt: &mut StringInterner,
    roots: &GcRoots,
) {
    if gc.estimate == 0 {
        // Signal for a major collection.
        full_gc(gc, pool, strt, roots, false);
        gc.estimate = gc.total_bytes.max(1);
    } else {
        let estimate = gc.estimate;
        run_until_pause(gc, pool, strt, roots);
        gc.state = GcState::Propagate; // skip restart: lists persist
        gc.stats.minor_cycles += 1;
        let threshold = (estimate / 100).saturating_mul((100 + gc.majorinc_pct) as usize);
        if gc.total_bytes > threshold {
            gc.estimate = 0; // next collection is a major one
        }
    }
    gc.debt = -GC_STEP_SIZE * 4;
}

/// Complete collection cycle. Emergency collections must not run
/// finalizers; the caller checks `pool.tobefnz` afterwards.
pub fn full_gc(
    gc: &mut Gc,
    pool: &mut ObjectPool,
    strt: &mut StringInterner,
    roots: &GcRoots,
    emergency: bool,
) {
    gc.emergency = emergency;
    let was_generational = gc.kind == GcKind::Generational;
    gc.kind = GcKind::Incremental;
    if matches!(gc.state, GcState::Propagate | GcState::Atomic) {
        // Abandon the current mark: sweep everything back to white.
        gc.sweep_string_cursor = 0;
        gc.sweep_cursor = 0;
        gc.state = GcState::SweepString;
    }
    run_until_pause(gc, pool, strt, roots);
    // Run a fresh, complete cycle.
    single_step(gc, pool, strt, roots); // restart: Pause -> Propagate
    run_until_pause(gc, pool, strt, roots);
    if was_generational {
        gc.kind = GcKind::Generational;
        // Seed the next minor cycle with a full root mark.
        single_step(gc, pool, strt, roots);
        debug_assert!(gc.state == GcState::Propagate);
        gc.estimate = gc.total_bytes.max(1);
        gc.debt = -GC_STEP_SIZE * 4;
    } else {
        gc.set_pause();
    }
    gc.emergency = false;
}

/// Switch collection modes (`collectgarbage "generational"` /
/// `"incremental"`).
pub fn change_mode(
    gc: &mut Gc,
    pool: &mut ObjectPool,
    strt: &mut StringInterner,
    roots: &GcRoots,
    kind: GcKind,
) {
    if gc.kind == kind {
        return;
    }
    if kind == GcKind::Generational {
        // Finish the current cycle, then prime the persistent lists.
        gc.kind = GcKind::Incremental;
        run_until_pause(gc, pool, strt, roots);
        gc.kind = GcKind::Generational;
        single_step(gc, pool, strt, roots); // restart
        gc.estimate = gc.total_bytes.max(1);
    } else {
        // Drop generational state: run one full incremental cycle so
        // every OLD bit is rewritten by the sweep.
        gc.kind = GcKind::Incremental;
        for id in pool.allgc.clone() {
            if let Some(h) = pool.header_mut(id) {
                h.set_old(false);
            }
        }
        gc.state = GcState::Pause;
        gc.set_pause();
    }
}

// ============ Barriers ============

/// Forward barrier: a black object gained a reference to a white one;
/// mark the target now (or, during sweep, re-whiten the container).
pub fn barrier_forward(gc: &mut Gc, pool: &mut ObjectPool, o: GcId, v: &LuaValue) {
    let o_black = pool.header(o).map(|h| h.is_black()).unwrap_or(false);
    if !o_black || !value_is_white(pool, v) {
        return;
    }
    if gc.keep_invariant() {
        mark_value(gc, pool, v);
    } else if gc.is_sweep_phase() {
        let white = gc.current_white;
        if let Some(h) = pool.header_mut(o) {
            if !h.is_fixed() {
                h.make_white(white);
            }
        }
    }
}

/// Backward barrier: a black table was mutated; push it back on the
/// gray-again list to be rescanned in the atomic step.
pub fn barrier_back(gc: &mut Gc, pool: &mut ObjectPool, t: TableId) {
    let id = GcId::Table(t);
    let black = pool.header(id).map(|h| h.is_black()).unwrap_or(false);
    if black {
        pool.header_mut(id).unwrap().make_gray();
        gc.grayagain.push(id);
    }
}

/// Prototype barrier for the one-slot closure cache.
pub fn barrier_proto(gc: &mut Gc, pool: &mut ObjectPool, p: ProtoId) {
    let id = GcId::Proto(p);
    let black = pool.header(id).map(|h| h.is_black()).unwrap_or(false);
    if black {
        pool.header_mut(id).unwrap().make_gray();
        gc.grayagain.push(id);
    }
}
