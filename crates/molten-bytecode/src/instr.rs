//! Instruction decoding
//!
//! [`InstrIter`] walks a code unit's fixed-width instruction pairs and
//! folds `ExtendedArg` prefixes into the following opcode's operand, so a
//! yielded [`Instr`] always carries the effective operand. The vpc reported
//! for a folded instruction is that of the real opcode, not its prefixes.

use crate::code::CodeUnit;
use crate::opcode::Opcode;

/// Error produced while decoding an instruction stream.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The code byte at the given vpc is not a known opcode.
    #[error("unknown opcode {byte:#x} at vpc {vpc}")]
    UnknownOpcode {
        /// The offending byte.
        byte: u8,
        /// Instruction index of the byte.
        vpc: usize,
    },
    /// The code buffer has an odd number of bytes.
    #[error("truncated instruction stream ({len} bytes)")]
    Truncated {
        /// Length of the malformed buffer.
        len: usize,
    },
}

/// One decoded instruction with its effective operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    /// Instruction index of the real opcode.
    pub vpc: usize,
    /// The opcode.
    pub opcode: Opcode,
    /// Operand with `ExtendedArg` prefixes folded in.
    pub oparg: u32,
}

impl Instr {
    /// Target vpc of a relative-forward branch operand.
    pub fn forward_target(&self) -> usize {
        self.vpc + 1 + self.oparg as usize
    }
}

/// Iterator over decoded instructions.
pub struct InstrIter<'a> {
    unit: &'a CodeUnit,
    vpc: usize,
}

impl<'a> InstrIter<'a> {
    /// Create an iterator over a code unit, validating its length.
    pub fn new(unit: &'a CodeUnit) -> Result<Self, DecodeError> {
        if unit.code.len() % 2 != 0 {
            return Err(DecodeError::Truncated {
                len: unit.code.len(),
            });
        }
        Ok(InstrIter { unit, vpc: 0 })
    }
}

impl Iterator for InstrIter<'_> {
    type Item = Result<Instr, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let count = self.unit.instr_count();
        let mut oparg: u32 = 0;
        loop {
            if self.vpc == count {
                return None;
            }
            let (byte, arg) = self.unit.raw(self.vpc);
            let vpc = self.vpc;
            self.vpc += 1;
            match Opcode::from_u8(byte) {
                Some(Opcode::ExtendedArg) => {
                    oparg = (oparg | arg as u32) << 8;
                }
                Some(opcode) => {
                    return Some(Ok(Instr {
                        vpc,
                        opcode,
                        oparg: oparg | arg as u32,
                    }));
                }
                None => return Some(Err(DecodeError::UnknownOpcode { byte, vpc })),
            }
        }
    }
}

/// Decode a whole code unit into a vector of instructions.
pub fn decode(unit: &CodeUnit) -> Result<Vec<Instr>, DecodeError> {
    InstrIter::new(unit)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeFlags, CodeUnit};

    fn unit(code: Vec<u8>) -> CodeUnit {
        CodeUnit {
            name: "test".to_string(),
            code,
            consts: vec![],
            names: vec![],
            varnames: vec![],
            cellvars: vec![],
            freevars: vec![],
            arg_count: 0,
            kwonly_arg_count: 0,
            nlocals: 0,
            stacksize: 0,
            flags: CodeFlags::default(),
        }
    }

    #[test]
    fn decodes_simple_sequence() {
        let u = unit(vec![
            Opcode::LoadConst as u8,
            0,
            Opcode::ReturnValue as u8,
            0,
        ]);
        let instrs = decode(&u).unwrap();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode, Opcode::LoadConst);
        assert_eq!(instrs[1].vpc, 1);
    }

    #[test]
    fn folds_extended_arg() {
        let u = unit(vec![
            Opcode::ExtendedArg as u8,
            0x12,
            Opcode::JumpAbsolute as u8,
            0x34,
        ]);
        let instrs = decode(&u).unwrap();
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].opcode, Opcode::JumpAbsolute);
        assert_eq!(instrs[0].oparg, 0x1234);
        // vpc points at the real instruction, past the prefix
        assert_eq!(instrs[0].vpc, 1);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let u = unit(vec![0, 0]);
        assert!(matches!(
            decode(&u),
            Err(DecodeError::UnknownOpcode { byte: 0, vpc: 0 })
        ));
    }

    #[test]
    fn rejects_odd_length() {
        let u = unit(vec![Opcode::Nop as u8]);
        assert!(matches!(decode(&u), Err(DecodeError::Truncated { len: 1 })));
    }

    #[test]
    fn forward_target_is_relative_to_successor() {
        let i = Instr {
            vpc: 3,
            opcode: Opcode::JumpForward,
            oparg: 4,
        };
        assert_eq!(i.forward_target(), 8);
    }
}
