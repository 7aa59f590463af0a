// Per-function compilation state and expression descriptors.

use ahash::RandomState;
use std::collections::HashMap;

use crate::gc::{Proto, StringId};
use crate::lua_vm::lua_limits::NO_JUMP;

/// How a parsed expression's value is currently represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpKind {
    /// No value.
    VVoid,
    VNil,
    VTrue,
    VFalse,
    /// Constant-table index in `info`.
    VK,
    /// Number literal in `nval`.
    VKNum,
    /// Value lives in a fixed register (`info`).
    VNonReloc,
    /// Local variable: register in `info`.
    VLocal,
    /// Upvalue index in `info`.
    VUpval,
    /// Indexed access: table in `ind_t`, key RK in `ind_idx`.
    VIndexed,
    /// Condition expression: pc of a jump in `info`.
    VJmp,
    /// Instruction (pc in `info`) whose A operand is still open.
    VRelocable,
    /// Call instruction pc in `info`.
    VCall,
    /// VARARG instruction pc in `info`.
    VVararg,
}

/// Whether the base of an indexed expression is a register or an
/// upvalue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexedBase {
    Register,
    Upvalue,
}

#[derive(Debug, Clone, Copy)]
pub struct ExpDesc {
    pub kind: ExpKind,
    pub info: i32,
    pub nval: f64,
    /// Table register or upvalue index (VIndexed).
    pub ind_t: u32,
    /// Key R/K index (VIndexed).
    pub ind_idx: u32,
    pub ind_vt: IndexedBase,
    /// Patch list: exit when true.
    pub t: i32,
    /// Patch list: exit when false.
    pub f: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind, info: i32) -> Self {
        ExpDesc {
            kind,
            info,
            nval: 0.0,
            ind_t: 0,
            ind_idx: 0,
            ind_vt: IndexedBase::Register,
            t: NO_JUMP,
            f: NO_JUMP,
        }
    }

    pub fn number(n: f64) -> Self {
        let mut e = ExpDesc::new(ExpKind::VKNum, 0);
        e.nval = n;
        e
    }

    #[inline(always)]
    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    #[inline(always)]
    pub fn is_numeral(&self) -> bool {
        self.kind == ExpKind::VKNum && !self.has_jumps()
    }

    #[inline(always)]
    pub fn is_var(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::VLocal | ExpKind::VUpval | ExpKind::VIndexed
        )
    }

    #[inline(always)]
    pub fn has_multret(&self) -> bool {
        matches!(self.kind, ExpKind::VCall | ExpKind::VVararg)
    }
}

/// Key of the constant-deduplication map. Numbers are keyed by raw bit
/// pattern so -0 and NaN payloads keep distinct slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Nil,
    True,
    False,
    Num(u64),
    Str(StringId),
}

/// Active-block bookkeeping (loops, scopes, labels).
#[derive(Debug, Clone, Copy)]
pub struct BlockCnt {
    /// Index of the first label of this block in the label list.
    pub firstlabel: usize,
    /// Index of the first pending goto of this block.
    pub firstgoto: usize,
    /// Active locals outside this block.
    pub nactvar: u8,
    /// Some local in the block is captured as an upvalue.
    pub upval: bool,
    pub isloop: bool,
}

/// A label or a pending goto.
#[derive(Debug, Clone, Copy)]
pub struct LabelDesc {
    pub name: StringId,
    /// Code position (label), or head of a jump list (goto; may be
    /// NO_JUMP for a goto whose condition folded away).
    pub pc: i32,
    pub line: u32,
    /// Active locals at that point.
    pub nactvar: u8,
}

/// Data shared across nested function states during one parse.
#[derive(Default)]
pub struct Dyndata {
    /// Active local variables: indices into the enclosing proto's
    /// locvars vector.
    pub actvar: Vec<u16>,
    /// Pending gotos.
    pub gt: Vec<LabelDesc>,
    /// Active labels.
    pub label: Vec<LabelDesc>,
}

/// State of the function under compilation.
pub struct FuncState {
    pub proto: Proto,
    /// Next instruction slot (== proto.code.len()).
    pub pc: usize,
    /// pc of the last jump target, to invalidate cross-target
    /// peepholes.
    pub lasttarget: i32,
    /// Pending jumps to the next instruction.
    pub jpc: i32,
    pub freereg: u8,
    pub nactvar: u8,
    /// First entry of this function in dyd.actvar.
    pub firstlocal: usize,
    pub blocks: Vec<BlockCnt>,
    /// Constant value -> constant index.
    pub k_map: HashMap<ConstKey, u32, RandomState>,
}

impl FuncState {
    pub fn new(source: StringId, linedefined: u32) -> Self {
        FuncState {
            proto: Proto {
                code: Vec::new(),
                k: Vec::new(),
                protos: Vec::new(),
                lineinfo: Vec::new(),
                locvars: Vec::new(),
                upvalues: Vec::new(),
                source,
                linedefined,
                lastlinedefined: 0,
                numparams: 0,
                is_vararg: false,
                maxstacksize: 2, // registers 0/1 are always valid
                cache: None,
            },
            pc: 0,
            lasttarget: NO_JUMP,
            jpc: NO_JUMP,
            freereg: 0,
            nactvar: 0,
            firstlocal: 0,
            blocks: Vec::new(),
            k_map: HashMap::with_hasher(RandomState::new()),
        }
    }
}
