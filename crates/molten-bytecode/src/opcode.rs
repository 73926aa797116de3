//! The host opcode set
//!
//! Each instruction is a fixed-width pair of one opcode byte and one
//! operand byte; operands wider than eight bits are carried by
//! `ExtendedArg` prefixes. Jump operands count in instructions, not bytes.
//! The numbering matches the host interpreter's dispatch table and is part
//! of its ABI, so the discriminants are explicit.

/// First opcode that carries a meaningful operand byte.
pub const HAVE_ARGUMENT: u8 = 90;

/// `FormatValue` operand: conversion selector mask.
pub const FVC_MASK: u32 = 0x3;
/// `FormatValue` conversion: none.
pub const FVC_NONE: u32 = 0x0;
/// `FormatValue` conversion: `str()`.
pub const FVC_STR: u32 = 0x1;
/// `FormatValue` conversion: `repr()`.
pub const FVC_REPR: u32 = 0x2;
/// `FormatValue` conversion: `ascii()`.
pub const FVC_ASCII: u32 = 0x3;
/// `FormatValue` operand: format-spec presence mask.
pub const FVS_MASK: u32 = 0x4;
/// `FormatValue` operand: a format spec is on the stack.
pub const FVS_HAVE_SPEC: u32 = 0x4;

/// Host bytecode opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Stack shuffles =====
    /// Pop and discard the top of stack.
    PopTop = 1,
    /// Swap the two top entries.
    RotTwo = 2,
    /// Lift the third entry to the top.
    RotThree = 3,
    /// Duplicate the top entry.
    DupTop = 4,
    /// Duplicate the two top entries.
    DupTopTwo = 5,
    /// Lift the fourth entry to the top.
    RotFour = 6,
    /// No operation.
    Nop = 9,

    // ===== Unary operators =====
    /// `+x`
    UnaryPositive = 10,
    /// `-x`
    UnaryNegative = 11,
    /// `not x`
    UnaryNot = 12,
    /// `~x`
    UnaryInvert = 15,

    // ===== Binary operators =====
    /// `x @ y`
    BinaryMatrixMultiply = 16,
    /// `x @= y`
    InplaceMatrixMultiply = 17,
    /// `x ** y`
    BinaryPower = 19,
    /// `x * y`
    BinaryMultiply = 20,
    /// `x % y`
    BinaryModulo = 22,
    /// `x + y`
    BinaryAdd = 23,
    /// `x - y`
    BinarySubtract = 24,
    /// `x[y]`
    BinarySubscr = 25,
    /// `x // y`
    BinaryFloorDivide = 26,
    /// `x / y`
    BinaryTrueDivide = 27,
    /// `x //= y`
    InplaceFloorDivide = 28,
    /// `x /= y`
    InplaceTrueDivide = 29,

    // ===== Pattern matching =====
    /// Push `len(tos)` below a retained subject.
    GetLen = 30,
    /// Push whether the subject is a mapping.
    MatchMapping = 31,
    /// Push whether the subject is a sequence.
    MatchSequence = 32,
    /// Match mapping keys against a pattern tuple.
    MatchKeys = 33,
    /// Copy a dict dropping the matched keys.
    CopyDictWithoutKeys = 34,

    // ===== With / async prologue =====
    /// Call `__exit__` with the active exception triple.
    WithExceptStart = 49,
    /// `__aiter__` on the top of stack.
    GetAiter = 50,
    /// `__anext__` on the top of stack.
    GetAnext = 51,
    /// `async with` entry.
    BeforeAsyncWith = 52,
    /// Terminate an `async for` on `StopAsyncIteration`.
    EndAsyncFor = 54,

    /// `x += y`
    InplaceAdd = 55,
    /// `x -= y`
    InplaceSubtract = 56,
    /// `x *= y`
    InplaceMultiply = 57,
    /// `x %= y`
    InplaceModulo = 59,
    /// `x[y] = z`
    StoreSubscr = 60,
    /// `del x[y]`
    DeleteSubscr = 61,
    /// `x << y`
    BinaryLshift = 62,
    /// `x >> y`
    BinaryRshift = 63,
    /// `x & y`
    BinaryAnd = 64,
    /// `x ^ y`
    BinaryXor = 65,
    /// `x | y`
    BinaryOr = 66,
    /// `x **= y`
    InplacePower = 67,

    // ===== Iteration =====
    /// `iter(x)`
    GetIter = 68,
    /// Iterator for `yield from`.
    GetYieldFromIter = 69,

    /// Display an expression result (REPL).
    PrintExpr = 70,
    /// Push the `__build_class__` builtin.
    LoadBuildClass = 71,
    /// Delegate to a sub-iterator.
    YieldFrom = 72,
    /// `__await__` on the top of stack.
    GetAwaitable = 73,
    /// Push the `AssertionError` class.
    LoadAssertionError = 74,

    /// `x <<= y`
    InplaceLshift = 75,
    /// `x >>= y`
    InplaceRshift = 76,
    /// `x &= y`
    InplaceAnd = 77,
    /// `x ^= y`
    InplaceXor = 78,
    /// `x |= y`
    InplaceOr = 79,

    /// Convert a freshly built list into a tuple.
    ListToTuple = 82,
    /// Return the top of stack to the caller.
    ReturnValue = 83,
    /// `from m import *`
    ImportStar = 84,
    /// Ensure `__annotations__` exists in locals.
    SetupAnnotations = 85,
    /// Suspend a generator with the top of stack.
    YieldValue = 86,
    /// Pop one try-block.
    PopBlock = 87,
    /// Pop an exception-handler block and restore the previous exception.
    PopExcept = 89,

    // ===== Operand-carrying opcodes (>= HAVE_ARGUMENT) =====
    /// Bind a name in the local namespace.
    StoreName = 90,
    /// Unbind a name from the local namespace.
    DeleteName = 91,
    /// Unpack an exact-length sequence.
    UnpackSequence = 92,
    /// Advance an iterator or jump past the loop on exhaustion.
    ForIter = 93,
    /// Unpack a sequence with a starred target.
    UnpackEx = 94,
    /// `x.attr = y`
    StoreAttr = 95,
    /// `del x.attr`
    DeleteAttr = 96,
    /// Bind a name in the global namespace.
    StoreGlobal = 97,
    /// Unbind a global name.
    DeleteGlobal = 98,
    /// Lift the N-th entry to the top.
    RotN = 99,
    /// Push a constant by pool index.
    LoadConst = 100,
    /// Look up a name through locals, globals, builtins.
    LoadName = 101,
    /// Build a tuple from N stack entries.
    BuildTuple = 102,
    /// Build a list from N stack entries.
    BuildList = 103,
    /// Build a set from N stack entries.
    BuildSet = 104,
    /// Build a dict from N key/value pairs.
    BuildMap = 105,
    /// `x.attr`
    LoadAttr = 106,
    /// Rich comparison selected by operand.
    CompareOp = 107,
    /// `__import__` a module.
    ImportName = 108,
    /// Fetch an attribute from an imported module.
    ImportFrom = 109,
    /// Relative unconditional jump.
    JumpForward = 110,
    /// Jump if false, else pop.
    JumpIfFalseOrPop = 111,
    /// Jump if true, else pop.
    JumpIfTrueOrPop = 112,
    /// Absolute unconditional jump.
    JumpAbsolute = 113,
    /// Pop and jump when false.
    PopJumpIfFalse = 114,
    /// Pop and jump when true.
    PopJumpIfTrue = 115,
    /// Look up a name through globals then builtins.
    LoadGlobal = 116,
    /// Identity test; operand 1 inverts.
    IsOp = 117,
    /// Membership test; operand 1 inverts.
    ContainsOp = 118,
    /// Re-raise the active exception.
    Reraise = 119,
    /// Jump when the exception does not match the pattern.
    JumpIfNotExcMatch = 121,
    /// Push a try-block whose handler is at a relative target.
    SetupFinally = 122,
    /// Push a local variable.
    LoadFast = 124,
    /// Pop into a local variable.
    StoreFast = 125,
    /// Unbind a local variable.
    DeleteFast = 126,
    /// First instruction of a generator body.
    GenStart = 129,
    /// `raise` with 0-2 operands.
    RaiseVarargs = 130,
    /// Call with N positional arguments.
    CallFunction = 131,
    /// Build a function object; flag bits pull extras off the stack.
    MakeFunction = 132,
    /// Build a slice from 2 or 3 entries.
    BuildSlice = 133,
    /// Push a cell object for a closure.
    LoadClosure = 135,
    /// Push the contents of a cell.
    LoadDeref = 136,
    /// Pop into a cell.
    StoreDeref = 137,
    /// Clear a cell.
    DeleteDeref = 138,
    /// Call with positional and keyword arguments.
    CallFunctionKw = 141,
    /// Call with unpacked argument containers.
    CallFunctionEx = 142,
    /// Enter a with-statement; push exit method and enter result.
    SetupWith = 143,
    /// Widen the next instruction's operand by eight bits.
    ExtendedArg = 144,
    /// Append to the list N entries down.
    ListAppend = 145,
    /// Add to the set N entries down.
    SetAdd = 146,
    /// Insert into the dict N entries down.
    MapAdd = 147,
    /// Class-body cell load falling back to enclosing locals.
    LoadClassderef = 148,
    /// Match a class pattern.
    MatchClass = 152,
    /// `async with` entry with a finally target.
    SetupAsyncWith = 154,
    /// Format a value for an f-string.
    FormatValue = 155,
    /// Build a dict from values plus a key tuple.
    BuildConstKeyMap = 156,
    /// Concatenate N string fragments.
    BuildString = 157,
    /// Push a bound-method pair for an upcoming call.
    LoadMethod = 160,
    /// Call a method pushed by `LoadMethod`.
    CallMethod = 161,
    /// Extend the list N entries down with an iterable.
    ListExtend = 162,
    /// Update the set N entries down with an iterable.
    SetUpdate = 163,
    /// Merge a mapping into a call's keyword dict, checking duplicates.
    DictMerge = 164,
    /// Update the dict N entries down with a mapping.
    DictUpdate = 165,
}

impl Opcode {
    /// Convert a raw byte into an opcode.
    ///
    /// Returns `None` for holes in the numbering.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::PopTop),
            2 => Some(Self::RotTwo),
            3 => Some(Self::RotThree),
            4 => Some(Self::DupTop),
            5 => Some(Self::DupTopTwo),
            6 => Some(Self::RotFour),
            9 => Some(Self::Nop),
            10 => Some(Self::UnaryPositive),
            11 => Some(Self::UnaryNegative),
            12 => Some(Self::UnaryNot),
            15 => Some(Self::UnaryInvert),
            16 => Some(Self::BinaryMatrixMultiply),
            17 => Some(Self::InplaceMatrixMultiply),
            19 => Some(Self::BinaryPower),
            20 => Some(Self::BinaryMultiply),
            22 => Some(Self::BinaryModulo),
            23 => Some(Self::BinaryAdd),
            24 => Some(Self::BinarySubtract),
            25 => Some(Self::BinarySubscr),
            26 => Some(Self::BinaryFloorDivide),
            27 => Some(Self::BinaryTrueDivide),
            28 => Some(Self::InplaceFloorDivide),
            29 => Some(Self::InplaceTrueDivide),
            30 => Some(Self::GetLen),
            31 => Some(Self::MatchMapping),
            32 => Some(Self::MatchSequence),
            33 => Some(Self::MatchKeys),
            34 => Some(Self::CopyDictWithoutKeys),
            49 => Some(Self::WithExceptStart),
            50 => Some(Self::GetAiter),
            51 => Some(Self::GetAnext),
            52 => Some(Self::BeforeAsyncWith),
            54 => Some(Self::EndAsyncFor),
            55 => Some(Self::InplaceAdd),
            56 => Some(Self::InplaceSubtract),
            57 => Some(Self::InplaceMultiply),
            59 => Some(Self::InplaceModulo),
            60 => Some(Self::StoreSubscr),
            61 => Some(Self::DeleteSubscr),
            62 => Some(Self::BinaryLshift),
            63 => Some(Self::BinaryRshift),
            64 => Some(Self::BinaryAnd),
            65 => Some(Self::BinaryXor),
            66 => Some(Self::BinaryOr),
            67 => Some(Self::InplacePower),
            68 => Some(Self::GetIter),
            69 => Some(Self::GetYieldFromIter),
            70 => Some(Self::PrintExpr),
            71 => Some(Self::LoadBuildClass),
            72 => Some(Self::YieldFrom),
            73 => Some(Self::GetAwaitable),
            74 => Some(Self::LoadAssertionError),
            75 => Some(Self::InplaceLshift),
            76 => Some(Self::InplaceRshift),
            77 => Some(Self::InplaceAnd),
            78 => Some(Self::InplaceXor),
            79 => Some(Self::InplaceOr),
            82 => Some(Self::ListToTuple),
            83 => Some(Self::ReturnValue),
            84 => Some(Self::ImportStar),
            85 => Some(Self::SetupAnnotations),
            86 => Some(Self::YieldValue),
            87 => Some(Self::PopBlock),
            89 => Some(Self::PopExcept),
            90 => Some(Self::StoreName),
            91 => Some(Self::DeleteName),
            92 => Some(Self::UnpackSequence),
            93 => Some(Self::ForIter),
            94 => Some(Self::UnpackEx),
            95 => Some(Self::StoreAttr),
            96 => Some(Self::DeleteAttr),
            97 => Some(Self::StoreGlobal),
            98 => Some(Self::DeleteGlobal),
            99 => Some(Self::RotN),
            100 => Some(Self::LoadConst),
            101 => Some(Self::LoadName),
            102 => Some(Self::BuildTuple),
            103 => Some(Self::BuildList),
            104 => Some(Self::BuildSet),
            105 => Some(Self::BuildMap),
            106 => Some(Self::LoadAttr),
            107 => Some(Self::CompareOp),
            108 => Some(Self::ImportName),
            109 => Some(Self::ImportFrom),
            110 => Some(Self::JumpForward),
            111 => Some(Self::JumpIfFalseOrPop),
            112 => Some(Self::JumpIfTrueOrPop),
            113 => Some(Self::JumpAbsolute),
            114 => Some(Self::PopJumpIfFalse),
            115 => Some(Self::PopJumpIfTrue),
            116 => Some(Self::LoadGlobal),
            117 => Some(Self::IsOp),
            118 => Some(Self::ContainsOp),
            119 => Some(Self::Reraise),
            121 => Some(Self::JumpIfNotExcMatch),
            122 => Some(Self::SetupFinally),
            124 => Some(Self::LoadFast),
            125 => Some(Self::StoreFast),
            126 => Some(Self::DeleteFast),
            129 => Some(Self::GenStart),
            130 => Some(Self::RaiseVarargs),
            131 => Some(Self::CallFunction),
            132 => Some(Self::MakeFunction),
            133 => Some(Self::BuildSlice),
            135 => Some(Self::LoadClosure),
            136 => Some(Self::LoadDeref),
            137 => Some(Self::StoreDeref),
            138 => Some(Self::DeleteDeref),
            141 => Some(Self::CallFunctionKw),
            142 => Some(Self::CallFunctionEx),
            143 => Some(Self::SetupWith),
            144 => Some(Self::ExtendedArg),
            145 => Some(Self::ListAppend),
            146 => Some(Self::SetAdd),
            147 => Some(Self::MapAdd),
            148 => Some(Self::LoadClassderef),
            152 => Some(Self::MatchClass),
            154 => Some(Self::SetupAsyncWith),
            155 => Some(Self::FormatValue),
            156 => Some(Self::BuildConstKeyMap),
            157 => Some(Self::BuildString),
            160 => Some(Self::LoadMethod),
            161 => Some(Self::CallMethod),
            162 => Some(Self::ListExtend),
            163 => Some(Self::SetUpdate),
            164 => Some(Self::DictMerge),
            165 => Some(Self::DictUpdate),
            _ => None,
        }
    }

    /// Whether the operand byte of this opcode is meaningful.
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    /// Whether this opcode ends its basic block without successors inside
    /// the function (return or unconditional re-raise).
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::ReturnValue | Self::Reraise | Self::RaiseVarargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u8() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn argument_threshold() {
        assert!(!Opcode::ReturnValue.has_arg());
        assert!(!Opcode::PopTop.has_arg());
        assert!(Opcode::StoreName.has_arg());
        assert!(Opcode::LoadConst.has_arg());
        assert!(Opcode::ExtendedArg.has_arg());
    }

    #[test]
    fn holes_are_rejected() {
        assert_eq!(Opcode::from_u8(0), None);
        assert_eq!(Opcode::from_u8(7), None);
        assert_eq!(Opcode::from_u8(120), None);
        assert_eq!(Opcode::from_u8(200), None);
    }
}
