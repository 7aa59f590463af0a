// Tag methods (metamethods): names, per-table absence cache, lookup.

use crate::gc::TableId;
use crate::lua_value::value::{LUA_TTABLE, LUA_TUSERDATA};
use crate::lua_value::LuaValue;
use crate::lua_vm::LuaVM;

/// Tag-method kinds. The first six may be cached as "absent" in a
/// metatable's flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq, // last tag method with a fast-absent cache
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Lt,
    Le,
    Concat,
    Call,
}

pub const TM_COUNT: usize = TmKind::Call as usize + 1;
/// Number of tag methods covered by the absence cache.
const TM_FLAG_COUNT: u8 = TmKind::Eq as u8 + 1;

pub const TM_NAMES: [&str; TM_COUNT] = [
    "__index",
    "__newindex",
    "__gc",
    "__mode",
    "__len",
    "__eq",
    "__add",
    "__sub",
    "__mul",
    "__div",
    "__mod",
    "__pow",
    "__unm",
    "__lt",
    "__le",
    "__concat",
    "__call",
];

impl LuaVM {
    /// Metatable of a value: per-object for tables and userdata,
    /// per-base-type otherwise.
    pub fn get_metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        if let Some(t) = v.as_table_id() {
            self.pool.table(t).metatable
        } else if let Some(u) = v.as_userdata_id() {
            self.pool.userdata(u).metatable
        } else {
            self.base_metatables[v.ttype() as usize].as_table_id()
        }
    }

    /// Raw metamethod lookup in a metatable, with the fast-absent
    /// cache for the first tag methods.
    pub fn get_tm(&mut self, mt: TableId, tm: TmKind) -> LuaValue {
        let idx = tm as u8;
        if idx < TM_FLAG_COUNT && (self.pool.table(mt).flags & (1 << idx)) != 0 {
            return LuaValue::nil();
        }
        let name = self.tm_names[tm as usize];
        let v = self.pool.table(mt).get(&name);
        if v.is_nil() && idx < TM_FLAG_COUNT {
            self.pool.table_mut(mt).flags |= 1 << idx;
        }
        v
    }

    /// Metamethod of a value, or nil.
    pub fn get_metamethod(&mut self, v: &LuaValue, tm: TmKind) -> LuaValue {
        match self.get_metatable_of(v) {
            Some(mt) => self.get_tm(mt, tm),
            None => LuaValue::nil(),
        }
    }

    /// Metamethod for a binary operation: first operand's, else the
    /// second's.
    pub fn get_binop_tm(&mut self, a: &LuaValue, b: &LuaValue, tm: TmKind) -> LuaValue {
        let m = self.get_metamethod(a, tm);
        if !m.is_nil() {
            return m;
        }
        self.get_metamethod(b, tm)
    }

    /// The script-visible metatable value of `v` (honoring
    /// `__metatable` is the stdlib's business, not the core's).
    pub fn metatable_value(&self, v: &LuaValue) -> LuaValue {
        match self.get_metatable_of(v) {
            Some(mt) => LuaValue::table(mt),
            None => LuaValue::nil(),
        }
    }

    /// True when the base type can carry a per-object metatable.
    pub fn has_own_metatable(v: &LuaValue) -> bool {
        matches!(v.ttype(), LUA_TTABLE | LUA_TUSERDATA)
    }
}
