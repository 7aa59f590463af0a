// Register-based instruction set and its 32-bit encoding.
//
// Formats:
//   iABC:  [ B(9) | C(9) | A(8) | Op(6) ]
//   iABx:  [    Bx(18)   | A(8) | Op(6) ]
//   iAsBx: [   sBx(18)   | A(8) | Op(6) ]
//   iAx:   [        Ax(26)      | Op(6) ]
//
// B and C may be RK operands: the high bit selects a constant index
// instead of a register.

pub type Instr = u32;

pub const SIZE_OP: u32 = 6;
pub const SIZE_A: u32 = 8;
pub const SIZE_B: u32 = 9;
pub const SIZE_C: u32 = 9;
pub const SIZE_BX: u32 = SIZE_B + SIZE_C;
pub const SIZE_AX: u32 = SIZE_A + SIZE_B + SIZE_C;

pub const POS_OP: u32 = 0;
pub const POS_A: u32 = POS_OP + SIZE_OP;
pub const POS_C: u32 = POS_A + SIZE_A;
pub const POS_B: u32 = POS_C + SIZE_C;
pub const POS_BX: u32 = POS_C;
pub const POS_AX: u32 = POS_A;

pub const MAXARG_A: u32 = (1 << SIZE_A) - 1;
pub const MAXARG_B: u32 = (1 << SIZE_B) - 1;
pub const MAXARG_C: u32 = (1 << SIZE_C) - 1;
pub const MAXARG_BX: u32 = (1 << SIZE_BX) - 1;
pub const MAXARG_SBX: i32 = (MAXARG_BX >> 1) as i32;
pub const MAXARG_AX: u32 = (1 << SIZE_AX) - 1;

/// High bit of a B/C operand: the rest is a constant-table index.
pub const BITRK: u32 = 1 << (SIZE_B - 1);
pub const MAXINDEXRK: u32 = BITRK - 1;

#[inline(always)]
pub const fn isk(x: u32) -> bool {
    x & BITRK != 0
}

#[inline(always)]
pub const fn indexk(x: u32) -> u32 {
    x & !BITRK
}

#[inline(always)]
pub const fn rkask(x: u32) -> u32 {
    x | BITRK
}

/// Complete opcode set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,  // A B     R(A) := R(B)
    LoadK,     // A Bx    R(A) := Kst(Bx)
    LoadKx,    // A       R(A) := Kst(extra arg)
    LoadBool,  // A B C   R(A) := (Bool)B; if (C) pc++
    LoadNil,   // A B     R(A..A+B) := nil
    GetUpval,  // A B     R(A) := UpValue[B]
    GetTabUp,  // A B C   R(A) := UpValue[B][RK(C)]
    GetTable,  // A B C   R(A) := R(B)[RK(C)]
    SetTabUp,  // A B C   UpValue[A][RK(B)] := RK(C)
    SetUpval,  // A B     UpValue[B] := R(A)
    SetTable,  // A B C   R(A)[RK(B)] := RK(C)
    NewTable,  // A B C   R(A) := {} (array size hint B, hash size hint C)
    OpSelf,    // A B C   R(A+1) := R(B); R(A) := R(B)[RK(C)]
    Add,       // A B C   R(A) := RK(B) + RK(C)
    Sub,       // A B C   R(A) := RK(B) - RK(C)
    Mul,       // A B C   R(A) := RK(B) * RK(C)
    Div,       // A B C   R(A) := RK(B) / RK(C)
    Mod,       // A B C   R(A) := RK(B) % RK(C)
    Pow,       // A B C   R(A) := RK(B) ^ RK(C)
    Unm,       // A B     R(A) := -R(B)
    Not,       // A B     R(A) := not R(B)
    Len,       // A B     R(A) := length of R(B)
    Concat,    // A B C   R(A) := R(B).. ... ..R(C)
    Jmp,       // A sBx   pc+=sBx; if (A) close upvalues >= R(A-1)
    Eq,        // A B C   if ((RK(B) == RK(C)) ~= A) then pc++
    Lt,        // A B C   if ((RK(B) <  RK(C)) ~= A) then pc++
    Le,        // A B C   if ((RK(B) <= RK(C)) ~= A) then pc++
    Test,      // A C     if not (R(A) <=> C) then pc++
    TestSet,   // A B C   if (R(B) <=> C) then R(A) := R(B) else pc++
    Call,      // A B C   R(A..A+C-2) := R(A)(R(A+1..A+B-1))
    TailCall,  // A B C   return R(A)(R(A+1..A+B-1))
    Return,    // A B     return R(A..A+B-2)
    ForLoop,   // A sBx   R(A)+=R(A+2); if R(A) <?= R(A+1) { pc+=sBx; R(A+3)=R(A) }
    ForPrep,   // A sBx   R(A)-=R(A+2); pc+=sBx
    TForCall,  // A C     R(A+3..A+2+C) := R(A)(R(A+1), R(A+2))
    TForLoop,  // A sBx   if R(A+1) ~= nil { R(A)=R(A+1); pc += sBx }
    SetList,   // A B C   R(A)[(C-1)*FPF+i] := R(A+i), 1 <= i <= B
    Closure,   // A Bx    R(A) := closure(KPROTO[Bx])
    Vararg,    // A B     R(A..A+B-2) := vararg
    ExtraArg,  // Ax      extra (larger) argument for previous opcode
}

pub const NUM_OPCODES: usize = OpCode::ExtraArg as usize + 1;

impl OpCode {
    #[inline(always)]
    pub fn from_u8(x: u8) -> OpCode {
        debug_assert!((x as usize) < NUM_OPCODES);
        unsafe { std::mem::transmute(x) }
    }
}

// ============ Encoding ============

#[inline(always)]
pub fn create_abc(op: OpCode, a: u32, b: u32, c: u32) -> Instr {
    ((op as u32) << POS_OP) | (a << POS_A) | (b << POS_B) | (c << POS_C)
}

#[inline(always)]
pub fn create_abx(op: OpCode, a: u32, bx: u32) -> Instr {
    ((op as u32) << POS_OP) | (a << POS_A) | (bx << POS_BX)
}

#[inline(always)]
pub fn create_ax(op: OpCode, ax: u32) -> Instr {
    ((op as u32) << POS_OP) | (ax << POS_AX)
}

// ============ Decoding ============

#[inline(always)]
pub fn get_opcode(i: Instr) -> OpCode {
    OpCode::from_u8(((i >> POS_OP) & ((1 << SIZE_OP) - 1)) as u8)
}

#[inline(always)]
pub fn getarg_a(i: Instr) -> u32 {
    (i >> POS_A) & MAXARG_A
}

#[inline(always)]
pub fn getarg_b(i: Instr) -> u32 {
    (i >> POS_B) & MAXARG_B
}

#[inline(always)]
pub fn getarg_c(i: Instr) -> u32 {
    (i >> POS_C) & MAXARG_C
}

#[inline(always)]
pub fn getarg_bx(i: Instr) -> u32 {
    (i >> POS_BX) & MAXARG_BX
}

#[inline(always)]
pub fn getarg_sbx(i: Instr) -> i32 {
    getarg_bx(i) as i32 - MAXARG_SBX
}

#[inline(always)]
pub fn getarg_ax(i: Instr) -> u32 {
    (i >> POS_AX) & MAXARG_AX
}

#[inline(always)]
pub fn setarg_a(i: &mut Instr, a: u32) {
    *i = (*i & !(MAXARG_A << POS_A)) | ((a & MAXARG_A) << POS_A);
}

#[inline(always)]
pub fn setarg_b(i: &mut Instr, b: u32) {
    *i = (*i & !(MAXARG_B << POS_B)) | ((b & MAXARG_B) << POS_B);
}

#[inline(always)]
pub fn setarg_c(i: &mut Instr, c: u32) {
    *i = (*i & !(MAXARG_C << POS_C)) | ((c & MAXARG_C) << POS_C);
}

#[inline(always)]
pub fn setarg_bx(i: &mut Instr, bx: u32) {
    *i = (*i & !(MAXARG_BX << POS_BX)) | ((bx & MAXARG_BX) << POS_BX);
}

#[inline(always)]
pub fn setarg_sbx(i: &mut Instr, sbx: i32) {
    setarg_bx(i, (sbx + MAXARG_SBX) as u32);
}

// ============ "Floating byte" size hints (NEWTABLE) ============
// Encodes (eeeeexxx): value is (1xxx) << (eeeee - 1), or xxx when the
// exponent is zero.

pub fn int2fb(mut x: u32) -> u32 {
    let mut e = 0u32;
    if x < 8 {
        return x;
    }
    while x >= 0x10 {
        x = (x + 1) >> 1;
        e += 1;
    }
    ((e + 1) << 3) | (x - 8)
}

pub fn fb2int(x: u32) -> u32 {
    let e = (x >> 3) & 0x1f;
    if e == 0 {
        x
    } else {
        ((x & 7) + 8) << (e - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floating_byte_covers_small_exactly() {
        for i in 0..8 {
            assert_eq!(fb2int(int2fb(i)), i);
        }
        assert!(fb2int(int2fb(1000)) >= 1000);
    }

    #[test]
    fn abc_round_trip() {
        let i = create_abc(OpCode::Add, 3, rkask(7), 200);
        assert_eq!(get_opcode(i), OpCode::Add);
        assert_eq!(getarg_a(i), 3);
        assert!(isk(getarg_b(i)));
        assert_eq!(indexk(getarg_b(i)), 7);
        assert_eq!(getarg_c(i), 200);
    }

    #[test]
    fn sbx_round_trip() {
        let mut i = create_abx(OpCode::Jmp, 0, 0);
        setarg_sbx(&mut i, -5);
        assert_eq!(getarg_sbx(i), -5);
        setarg_sbx(&mut i, MAXARG_SBX);
        assert_eq!(getarg_sbx(i), MAXARG_SBX);
    }

    #[test]
    fn field_updates_are_isolated() {
        let mut i = create_abc(OpCode::GetTable, 1, 2, 3);
        setarg_a(&mut i, 9);
        assert_eq!(get_opcode(i), OpCode::GetTable);
        assert_eq!(getarg_a(i), 9);
        assert_eq!(getarg_b(i), 2);
        assert_eq!(getarg_c(i), 3);
    }
}
