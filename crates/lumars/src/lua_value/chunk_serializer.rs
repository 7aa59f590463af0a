// Precompiled chunk dump/load.
//
// The dump begins with a fixed header: the signature "\x1BLua", a
// version byte, a format byte, an endianness byte, the sizes of the
// integer/size/instruction/number encodings, an "integral numbers"
// flag, and a six-byte tail that detects text-mode corruption. The
// body encodes the main prototype recursively. Loading a dump of a
// dump reproduces the bytes exactly.

use crate::gc::{LocVar, Proto, ProtoId, StringId, UpvalDesc};
use crate::lua_value::value::{LUA_TBOOLEAN, LUA_TNIL, LUA_TNUMBER, LUA_TSTRING};
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub const SIGNATURE: [u8; 4] = [0x1B, b'L', b'u', b'a'];
/// major * 16 + minor.
pub const VERSION: u8 = 0x52;
pub const FORMAT: u8 = 0;
/// Little-endian.
pub const ENDIANNESS: u8 = 1;
pub const SIZE_INT: u8 = 4;
pub const SIZE_SIZET: u8 = 8;
pub const SIZE_INSTRUCTION: u8 = 4;
pub const SIZE_NUMBER: u8 = 8;
/// Numbers are floating point.
pub const INTEGRAL: u8 = 0;
pub const TAIL: [u8; 6] = [0x1B, 0x93, 0x0D, 0x0A, 0x1A, 0x0A];

// ============ Dump ============

struct Dumper<'a> {
    vm: &'a LuaVM,
    out: Vec<u8>,
}

impl<'a> Dumper<'a> {
    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn int(&mut self, i: i32) {
        self.out.extend_from_slice(&i.to_le_bytes());
    }

    fn size(&mut self, s: u64) {
        self.out.extend_from_slice(&s.to_le_bytes());
    }

    fn number(&mut self, n: f64) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn instruction(&mut self, i: u32) {
        self.out.extend_from_slice(&i.to_le_bytes());
    }

    /// Length-prefixed bytes with a trailing NUL; a missing string is
    /// size 0.
    fn string(&mut self, s: Option<StringId>) {
        match s {
            None => self.size(0),
            Some(id) => {
                let bytes = self.vm.pool.string(id).as_bytes();
                self.size(bytes.len() as u64 + 1);
                self.out.extend_from_slice(bytes);
                self.byte(0);
            }
        }
    }

    fn constant(&mut self, v: &LuaValue) {
        if v.is_nil() {
            self.byte(LUA_TNIL);
        } else if let Some(b) = v.as_boolean() {
            self.byte(LUA_TBOOLEAN);
            self.byte(b as u8);
        } else if let Some(n) = v.as_number() {
            self.byte(LUA_TNUMBER);
            self.number(n);
        } else {
            self.byte(LUA_TSTRING);
            self.string(v.as_string_id());
        }
    }

    fn function(&mut self, p: ProtoId) {
        let (linedefined, lastlinedefined, numparams, is_vararg, maxstacksize) = {
            let proto = self.vm.pool.proto(p);
            (
                proto.linedefined,
                proto.lastlinedefined,
                proto.numparams,
                proto.is_vararg,
                proto.maxstacksize,
            )
        };
        self.int(linedefined as i32);
        self.int(lastlinedefined as i32);
        self.byte(numparams);
        self.byte(is_vararg as u8);
        self.byte(maxstacksize);
        // Code.
        self.int(self.vm.pool.proto(p).code.len() as i32);
        for i in 0..self.vm.pool.proto(p).code.len() {
            self.instruction(self.vm.pool.proto(p).code[i]);
        }
        // Constants.
        self.int(self.vm.pool.proto(p).k.len() as i32);
        for i in 0..self.vm.pool.proto(p).k.len() {
            let v = self.vm.pool.proto(p).k[i];
            self.constant(&v);
        }
        // Sub-prototypes.
        self.int(self.vm.pool.proto(p).protos.len() as i32);
        for i in 0..self.vm.pool.proto(p).protos.len() {
            let sub = self.vm.pool.proto(p).protos[i];
            self.function(sub);
        }
        // Upvalue descriptors.
        self.int(self.vm.pool.proto(p).upvalues.len() as i32);
        for i in 0..self.vm.pool.proto(p).upvalues.len() {
            let d = self.vm.pool.proto(p).upvalues[i];
            self.byte(d.instack as u8);
            self.byte(d.idx);
        }
        // Debug section.
        let source = self.vm.pool.proto(p).source;
        self.string(Some(source));
        self.int(self.vm.pool.proto(p).lineinfo.len() as i32);
        for i in 0..self.vm.pool.proto(p).lineinfo.len() {
            let line = self.vm.pool.proto(p).lineinfo[i];
            self.int(line as i32);
        }
        self.int(self.vm.pool.proto(p).locvars.len() as i32);
        for i in 0..self.vm.pool.proto(p).locvars.len() {
            let lv = self.vm.pool.proto(p).locvars[i];
            self.string(Some(lv.name));
            self.int(lv.startpc as i32);
            self.int(lv.endpc as i32);
        }
        self.int(self.vm.pool.proto(p).upvalues.len() as i32);
        for i in 0..self.vm.pool.proto(p).upvalues.len() {
            let name = self.vm.pool.proto(p).upvalues[i].name;
            self.string(Some(name));
        }
    }
}

/// Serialize a prototype to the portable dump format.
pub fn dump(vm: &LuaVM, main: ProtoId) -> Vec<u8> {
    let mut d = Dumper {
        vm,
        out: Vec::with_capacity(256),
    };
    d.out.extend_from_slice(&SIGNATURE);
    d.byte(VERSION);
    d.byte(FORMAT);
    d.byte(ENDIANNESS);
    d.byte(SIZE_INT);
    d.byte(SIZE_SIZET);
    d.byte(SIZE_INSTRUCTION);
    d.byte(SIZE_NUMBER);
    d.byte(INTEGRAL);
    d.out.extend_from_slice(&TAIL);
    d.function(main);
    d.out
}

// ============ Load ============

struct Loader<'a, 'v> {
    vm: &'v mut LuaVM,
    data: &'a [u8],
    pos: usize,
    name: String,
}

impl<'a, 'v> Loader<'a, 'v> {
    fn error(&mut self, why: &str) -> LuaError {
        let msg = format!("{}: {} precompiled chunk", self.name, why);
        match self.vm.new_string(&msg) {
            Ok(v) => {
                self.vm.th_mut().err_obj = v;
                LuaError::Syntax
            }
            Err(_) => LuaError::Mem,
        }
    }

    fn block(&mut self, n: usize) -> LuaResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(self.error("truncated"));
        }
        let data: &'a [u8] = self.data;
        let b = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(b)
    }

    fn byte(&mut self) -> LuaResult<u8> {
        Ok(self.block(1)?[0])
    }

    fn int(&mut self) -> LuaResult<i32> {
        let b = self.block(4)?;
        let x = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if x < 0 {
            return Err(self.error("corrupted"));
        }
        Ok(x)
    }

    fn size(&mut self) -> LuaResult<u64> {
        let b = self.block(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn number(&mut self) -> LuaResult<f64> {
        let b = self.block(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn instruction(&mut self) -> LuaResult<u32> {
        let b = self.block(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> LuaResult<Option<StringId>> {
        let n = self.size()?;
        if n == 0 {
            return Ok(None);
        }
        let bytes = self.block(n as usize)?.to_vec();
        // Drop the trailing NUL.
        let v = self.vm.new_string_bytes(&bytes[..bytes.len() - 1])?;
        Ok(v.as_string_id())
    }

    fn constant(&mut self) -> LuaResult<LuaValue> {
        let t = self.byte()?;
        match t {
            LUA_TNIL => Ok(LuaValue::nil()),
            LUA_TBOOLEAN => Ok(LuaValue::boolean(self.byte()? != 0)),
            LUA_TNUMBER => Ok(LuaValue::number(self.number()?)),
            LUA_TSTRING => match self.string()? {
                Some(id) => Ok(LuaValue::string(id)),
                None => Err(self.error("corrupted")),
            },
            _ => Err(self.error("corrupted")),
        }
    }

    fn function(&mut self) -> LuaResult<ProtoId> {
        let linedefined = self.int()? as u32;
        let lastlinedefined = self.int()? as u32;
        let numparams = self.byte()?;
        let is_vararg = self.byte()? != 0;
        let maxstacksize = self.byte()?;
        let ncode = self.int()? as usize;
        let mut code = Vec::with_capacity(ncode);
        for _ in 0..ncode {
            code.push(self.instruction()?);
        }
        let nk = self.int()? as usize;
        let mut k = Vec::with_capacity(nk);
        for _ in 0..nk {
            k.push(self.constant()?);
        }
        let np = self.int()? as usize;
        let mut protos = Vec::with_capacity(np);
        for _ in 0..np {
            protos.push(self.function()?);
        }
        let nup = self.int()? as usize;
        let mut upvalues = Vec::with_capacity(nup);
        for _ in 0..nup {
            let instack = self.byte()? != 0;
            let idx = self.byte()?;
            upvalues.push(UpvalDesc {
                name: StringId(0),
                instack,
                idx,
            });
        }
        // Debug section.
        let source = self.string()?;
        let source = match source {
            Some(s) => s,
            None => self.vm.new_string("=?")?.as_string_id().unwrap(),
        };
        let nlines = self.int()? as usize;
        let mut lineinfo = Vec::with_capacity(nlines);
        for _ in 0..nlines {
            lineinfo.push(self.int()? as u32);
        }
        let nloc = self.int()? as usize;
        let mut locvars = Vec::with_capacity(nloc);
        for _ in 0..nloc {
            let name = match self.string()? {
                Some(s) => s,
                None => return Err(self.error("corrupted")),
            };
            let startpc = self.int()? as u32;
            let endpc = self.int()? as u32;
            locvars.push(LocVar {
                name,
                startpc,
                endpc,
            });
        }
        let nupnames = self.int()? as usize;
        if nupnames > upvalues.len() {
            return Err(self.error("corrupted"));
        }
        for item in upvalues.iter_mut().take(nupnames) {
            item.name = match self.string()? {
                Some(s) => s,
                None => return Err(self.error("corrupted")),
            };
        }
        let proto = Proto {
            code,
            k,
            protos,
            lineinfo,
            locvars,
            upvalues,
            source,
            linedefined,
            lastlinedefined,
            numparams,
            is_vararg,
            maxstacksize,
            cache: None,
        };
        self.vm.new_proto(proto)
    }
}

/// Deserialize a precompiled chunk, validating the header.
pub fn load(vm: &mut LuaVM, data: &[u8], name: &str) -> LuaResult<ProtoId> {
    // Dumped strings are GC objects with no root until the prototype
    // is complete.
    vm.gc_hold += 1;
    let r = load_inner(vm, data, name);
    vm.gc_hold -= 1;
    r
}

fn load_inner(vm: &mut LuaVM, data: &[u8], name: &str) -> LuaResult<ProtoId> {
    let mut l = Loader {
        vm,
        data,
        pos: 0,
        name: name.to_string(),
    };
    let sig = l.block(4)?;
    if sig != SIGNATURE {
        return Err(l.error("not a"));
    }
    let version = l.byte()?;
    if version != VERSION {
        return Err(l.error("version mismatch in"));
    }
    let format = l.byte()?;
    if format != FORMAT {
        return Err(l.error("incompatible"));
    }
    let endian = l.byte()?;
    let sizes = l.block(4)?;
    let sizes_ok = sizes == [SIZE_INT, SIZE_SIZET, SIZE_INSTRUCTION, SIZE_NUMBER];
    let integral = l.byte()?;
    if endian != ENDIANNESS || !sizes_ok || integral != INTEGRAL {
        return Err(l.error("incompatible"));
    }
    let tail = l.block(6)?;
    if tail != TAIL {
        return Err(l.error("corrupted"));
    }
    l.function()
}
