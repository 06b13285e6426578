/// Bytecode opcodes.
///
/// Operands follow the opcode byte, little-endian. Widths are listed in
/// brackets and returned by [`OpCode::operand_widths`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // STACK OPERATIONS (0x00-0x0F)
    /// Push a constant [index: u16]
    Constant = 0x00,
    /// Push undefined
    Null = 0x01,
    /// Push true
    True = 0x02,
    /// Push false
    False = 0x03,
    /// Pop top of stack
    Pop = 0x04,

    // OPERATORS (0x10-0x1F)
    /// Apply a binary operator [operator: u8]
    BinaryOp = 0x10,
    /// Deep equality
    Equal = 0x11,
    /// Deep inequality
    NotEqual = 0x12,
    /// Unary minus
    Minus = 0x13,
    /// Logical not
    LNot = 0x14,
    /// Bitwise complement
    BComplement = 0x15,

    // CONTROL FLOW (0x20-0x2F)
    /// Unconditional jump [target: u32]
    Jump = 0x20,
    /// Pop; jump if falsy [target: u32]
    JumpFalsy = 0x21,
    /// Jump keeping the value if falsy, else pop [target: u32]
    AndJump = 0x22,
    /// Jump keeping the value if truthy, else pop [target: u32]
    OrJump = 0x23,

    // GLOBALS (0x30-0x3F)
    /// [index: u16]
    GetGlobal = 0x30,
    /// [index: u16]
    SetGlobal = 0x31,
    /// Assign through selectors [index: u16, selectors: u8]
    SetSelGlobal = 0x32,

    // LOCALS (0x40-0x4F)
    /// [slot: u8]
    GetLocal = 0x40,
    /// Store into a local, writing through a captured cell [slot: u8]
    SetLocal = 0x41,
    /// Initialise a local, replacing any cell [slot: u8]
    DefineLocal = 0x42,
    /// [slot: u8, selectors: u8]
    SetSelLocal = 0x43,
    /// Push a cell for a local, boxing it first if needed [slot: u8]
    GetLocalPtr = 0x44,

    // FREE VARIABLES (0x48-0x4F)
    /// [index: u8]
    GetFree = 0x48,
    /// [index: u8]
    SetFree = 0x49,
    /// [index: u8, selectors: u8]
    SetSelFree = 0x4A,
    /// Push the cell itself [index: u8]
    GetFreePtr = 0x4B,

    // BUILTINS (0x50)
    /// [index: u8]
    GetBuiltin = 0x50,

    // DATA STRUCTURES (0x60-0x6F)
    /// Build an array [count: u16]
    Array = 0x60,
    /// Build a map from key/value pairs [count: u16] (twice the pair count)
    Map = 0x61,
    /// Wrap top of stack in an error
    Error = 0x62,
    /// Make top of stack immutable
    Immutable = 0x63,
    /// Index into a value
    Index = 0x64,
    /// Slice a value; missing bounds are undefined
    SliceIndex = 0x65,

    // FUNCTIONS (0x70-0x7F)
    /// Call [argc: u8, flags: u8]
    Call = 0x70,
    /// Return [has_value: u8]
    Return = 0x71,
    /// Build a closure from a function constant and cells on the stack
    /// [index: u16, free: u8]
    Closure = 0x72,

    // ITERATION (0x80-0x8F)
    IteratorInit = 0x80,
    IteratorNext = 0x81,
    IteratorKey = 0x82,
    IteratorValue = 0x83,

    /// Stop the main function
    Suspend = 0xFF,
}

/// `Call` flag: the last positional argument is spread.
pub const CALL_SPREAD_ARGS: u8 = 0x01;
/// `Call` flag: a map of keyword arguments follows the positionals.
pub const CALL_KWARGS: u8 = 0x02;
/// `Call` flag: the keyword map itself was spread from an expression.
pub const CALL_SPREAD_KWARGS: u8 = 0x04;

impl OpCode {
    pub fn operand_widths(self) -> &'static [usize] {
        match self {
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::Array
            | OpCode::Map => &[2],

            OpCode::Jump | OpCode::JumpFalsy | OpCode::AndJump | OpCode::OrJump => &[4],

            OpCode::BinaryOp
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::DefineLocal
            | OpCode::GetLocalPtr
            | OpCode::GetFree
            | OpCode::SetFree
            | OpCode::GetFreePtr
            | OpCode::GetBuiltin
            | OpCode::Return => &[1],

            OpCode::SetSelGlobal | OpCode::Closure => &[2, 1],
            OpCode::SetSelLocal | OpCode::SetSelFree | OpCode::Call => &[1, 1],

            OpCode::Null
            | OpCode::True
            | OpCode::False
            | OpCode::Pop
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::Minus
            | OpCode::LNot
            | OpCode::BComplement
            | OpCode::Error
            | OpCode::Immutable
            | OpCode::Index
            | OpCode::SliceIndex
            | OpCode::IteratorInit
            | OpCode::IteratorNext
            | OpCode::IteratorKey
            | OpCode::IteratorValue
            | OpCode::Suspend => &[],
        }
    }

    /// Size of the instruction including its operands.
    pub fn instruction_size(self) -> usize {
        1 + self.operand_widths().iter().sum::<usize>()
    }

    pub fn is_jump(self) -> bool {
        matches!(
            self,
            OpCode::Jump | OpCode::JumpFalsy | OpCode::AndJump | OpCode::OrJump
        )
    }

    /// Get a human-readable name for the opcode.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "CONST",
            OpCode::Null => "NULL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Pop => "POP",
            OpCode::BinaryOp => "BINARYOP",
            OpCode::Equal => "EQL",
            OpCode::NotEqual => "NEQ",
            OpCode::Minus => "NEG",
            OpCode::LNot => "NOT",
            OpCode::BComplement => "CMPL",
            OpCode::Jump => "JMP",
            OpCode::JumpFalsy => "JMPF",
            OpCode::AndJump => "ANDJMP",
            OpCode::OrJump => "ORJMP",
            OpCode::GetGlobal => "GETG",
            OpCode::SetGlobal => "SETG",
            OpCode::SetSelGlobal => "SETSG",
            OpCode::GetLocal => "GETL",
            OpCode::SetLocal => "SETL",
            OpCode::DefineLocal => "DEFL",
            OpCode::SetSelLocal => "SETSL",
            OpCode::GetLocalPtr => "GETLP",
            OpCode::GetFree => "GETF",
            OpCode::SetFree => "SETF",
            OpCode::SetSelFree => "SETSF",
            OpCode::GetFreePtr => "GETFP",
            OpCode::GetBuiltin => "BUILTIN",
            OpCode::Array => "ARR",
            OpCode::Map => "MAP",
            OpCode::Error => "ERROR",
            OpCode::Immutable => "IMMUT",
            OpCode::Index => "INDEX",
            OpCode::SliceIndex => "SLICE",
            OpCode::Call => "CALL",
            OpCode::Return => "RET",
            OpCode::Closure => "CLOSURE",
            OpCode::IteratorInit => "ITER",
            OpCode::IteratorNext => "ITNXT",
            OpCode::IteratorKey => "ITKEY",
            OpCode::IteratorValue => "ITVAL",
            OpCode::Suspend => "SUSPEND",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x00 => OpCode::Constant,
            0x01 => OpCode::Null,
            0x02 => OpCode::True,
            0x03 => OpCode::False,
            0x04 => OpCode::Pop,
            0x10 => OpCode::BinaryOp,
            0x11 => OpCode::Equal,
            0x12 => OpCode::NotEqual,
            0x13 => OpCode::Minus,
            0x14 => OpCode::LNot,
            0x15 => OpCode::BComplement,
            0x20 => OpCode::Jump,
            0x21 => OpCode::JumpFalsy,
            0x22 => OpCode::AndJump,
            0x23 => OpCode::OrJump,
            0x30 => OpCode::GetGlobal,
            0x31 => OpCode::SetGlobal,
            0x32 => OpCode::SetSelGlobal,
            0x40 => OpCode::GetLocal,
            0x41 => OpCode::SetLocal,
            0x42 => OpCode::DefineLocal,
            0x43 => OpCode::SetSelLocal,
            0x44 => OpCode::GetLocalPtr,
            0x48 => OpCode::GetFree,
            0x49 => OpCode::SetFree,
            0x4A => OpCode::SetSelFree,
            0x4B => OpCode::GetFreePtr,
            0x50 => OpCode::GetBuiltin,
            0x60 => OpCode::Array,
            0x61 => OpCode::Map,
            0x62 => OpCode::Error,
            0x63 => OpCode::Immutable,
            0x64 => OpCode::Index,
            0x65 => OpCode::SliceIndex,
            0x70 => OpCode::Call,
            0x71 => OpCode::Return,
            0x72 => OpCode::Closure,
            0x80 => OpCode::IteratorInit,
            0x81 => OpCode::IteratorNext,
            0x82 => OpCode::IteratorKey,
            0x83 => OpCode::IteratorValue,
            0xFF => OpCode::Suspend,
            other => return Err(other),
        })
    }
}

/// Encode one instruction.
pub fn make_instruction(op: OpCode, operands: &[usize]) -> Vec<u8> {
    let mut out = Vec::with_capacity(op.instruction_size());
    out.push(op as u8);
    for (width, &operand) in op.operand_widths().iter().zip(operands) {
        out.extend_from_slice(&(operand as u32).to_le_bytes()[..*width]);
    }
    out
}

/// Decode the operands of the instruction whose opcode sits at `offset`.
/// Returns the operands and the total instruction length.
pub fn read_operands(op: OpCode, code: &[u8], offset: usize) -> (Vec<usize>, usize) {
    let mut pos = offset + 1;
    let mut operands = Vec::with_capacity(2);
    for &width in op.operand_widths() {
        operands.push(read_uint(code, pos, width));
        pos += width;
    }
    (operands, pos - offset)
}

/// Read a little-endian unsigned operand. Missing trailing bytes read as
/// zero.
#[inline]
pub fn read_uint(code: &[u8], pos: usize, width: usize) -> usize {
    let mut value = 0usize;
    for i in 0..width {
        let byte = code.get(pos + i).copied().unwrap_or(0) as usize;
        value |= byte << (8 * i);
    }
    value
}

/// Overwrite a `u32` jump operand in place.
pub fn patch_u32(code: &mut [u8], pos: usize, value: usize) {
    code[pos..pos + 4].copy_from_slice(&(value as u32).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_and_read() {
        let ins = make_instruction(OpCode::Closure, &[300, 2]);
        assert_eq!(ins, vec![OpCode::Closure as u8, 0x2C, 0x01, 2]);
        let (operands, len) = read_operands(OpCode::Closure, &ins, 0);
        assert_eq!(operands, vec![300, 2]);
        assert_eq!(len, 4);
    }

    #[test]
    fn test_jump_width() {
        let ins = make_instruction(OpCode::Jump, &[70_000]);
        assert_eq!(ins.len(), OpCode::Jump.instruction_size());
        assert_eq!(read_operands(OpCode::Jump, &ins, 0).0, vec![70_000]);
    }

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=255u8 {
            if let Ok(op) = OpCode::try_from(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn test_unknown_byte_is_returned() {
        assert_eq!(OpCode::try_from(0xFE), Err(0xFE));
        assert_eq!(OpCode::try_from(0x12), Ok(OpCode::NotEqual));
    }
}
