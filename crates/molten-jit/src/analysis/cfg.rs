//! Basic-block table construction
//!
//! One scan over the instruction stream marks block boundaries in a bitset
//! of length `instr_count + 1`: the successor of every branch, every
//! branch target, the successor of every terminator, and the forced
//! boundaries at vpc 0 and the end. The table is the boundary positions in
//! order; block `i` spans `[blocks[i-1].end, blocks[i].end)`, with
//! `blocks[0]` a zero-width sentinel carrying the function entry. Branch
//! targets are resolved against the table by binary search on end-vpc.

use molten_bytecode::{CodeUnit, DecodeError, Instr, InstrIter, Opcode};

use crate::bits::BitSet;

/// Error while building the block table.
#[derive(Debug, thiserror::Error)]
pub enum CfgError {
    /// The instruction stream did not decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A branch operand does not land inside the function.
    #[error("branch target {target} out of range at vpc {vpc}")]
    TargetOutOfRange {
        /// vpc of the branching instruction.
        vpc: usize,
        /// Resolved target vpc.
        target: usize,
    },
}

/// One basic block plus the per-block state the later stages fill in.
#[derive(Debug, Default)]
pub struct Block {
    /// Exclusive upper bound vpc; the next block starts here.
    pub end: usize,
    /// Whether control can fall off the end into the next block.
    pub fall_through: bool,
    /// Block index reached by this block's branch, if it has one.
    pub branch: Option<u32>,
    /// Set once some setup opcode targets this block as a handler.
    pub is_handler: bool,
    /// Operand-stack height on entry; assigned when the first predecessor
    /// is emitted, or by a setup/branch site that knows it.
    pub initial_stack_height: Option<i32>,
    /// Locals read or written inside the block (redundancy pass; flipped
    /// into a pass-through mask at the block boundary).
    pub locals_touched: BitSet,
    /// Locals whose deletion survives to the block exit (redundancy pass;
    /// flipped into a defined-by-block mask at the block boundary).
    pub locals_deleted: BitSet,
    /// Locals deleted anywhere in the block, surviving or not.
    pub locals_ever_deleted: BitSet,
    /// Locals certainly bound on entry (definition pass).
    pub locals_input: BitSet,
    /// Worklist membership flag for the definition pass.
    pub in_worklist: bool,
}

/// The ordered block table.
#[derive(Debug)]
pub struct BlockTable {
    /// `blocks[0]` is the zero-width entry sentinel.
    pub blocks: Vec<Block>,
}

impl BlockTable {
    /// Partition a code unit into basic blocks.
    pub fn build(unit: &CodeUnit) -> Result<Self, CfgError> {
        let size = unit.instr_count();
        let mut is_boundary = BitSet::new(size + 1);

        for instr in InstrIter::new(unit)? {
            let instr = instr?;
            match instr.opcode {
                // Relative-forward targets: the branch ends its block and
                // the target starts one.
                Opcode::JumpForward
                | Opcode::ForIter
                | Opcode::SetupFinally
                | Opcode::SetupWith
                | Opcode::SetupAsyncWith => {
                    let target = instr.forward_target();
                    if target > size {
                        return Err(CfgError::TargetOutOfRange {
                            vpc: instr.vpc,
                            target,
                        });
                    }
                    is_boundary.set(instr.vpc + 1);
                    is_boundary.set(target);
                }
                // Absolute targets.
                Opcode::JumpAbsolute
                | Opcode::JumpIfTrueOrPop
                | Opcode::JumpIfFalseOrPop
                | Opcode::PopJumpIfTrue
                | Opcode::PopJumpIfFalse
                | Opcode::JumpIfNotExcMatch => {
                    let target = instr.oparg as usize;
                    if target > size {
                        return Err(CfgError::TargetOutOfRange {
                            vpc: instr.vpc,
                            target,
                        });
                    }
                    is_boundary.set(instr.vpc + 1);
                    is_boundary.set(target);
                }
                // Terminators end their block with no target.
                Opcode::ReturnValue | Opcode::Reraise | Opcode::RaiseVarargs => {
                    is_boundary.set(instr.vpc + 1);
                }
                _ => {}
            }
        }

        is_boundary.set(0);
        is_boundary.set(size);

        let blocks: Vec<Block> = is_boundary
            .ones()
            .map(|end| Block {
                end,
                ..Block::default()
            })
            .collect();

        let mut table = BlockTable { blocks };
        table.connect(unit)?;
        Ok(table)
    }

    /// Number of table entries, the sentinel included.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// First vpc of a block.
    pub fn start_of(&self, index: usize) -> usize {
        debug_assert!(index >= 1);
        self.blocks[index - 1].end
    }

    /// Index of the block starting at `vpc`. Branch operands always
    /// resolve to a block start, so a miss is a table-construction bug.
    pub fn find(&self, vpc: usize) -> usize {
        let mut left = 0usize;
        let mut right = self.blocks.len() - 1;
        while left <= right {
            let mid = left + (right - left) / 2;
            let end = self.blocks[mid].end;
            if end < vpc {
                left = mid + 1;
            } else if end > vpc {
                right = mid - 1;
            } else {
                return mid + 1;
            }
        }
        unreachable!("branch target {vpc} does not start a block");
    }

    /// Record fall-through and branch successors used by the definition
    /// pass. The entry sentinel falls through into the first real block.
    fn connect(&mut self, unit: &CodeUnit) -> Result<(), CfgError> {
        let last = self.blocks.len() - 1;
        let mut edges: Vec<(usize, bool, Option<u32>)> = Vec::new();

        for index in 1..self.blocks.len() {
            let end = self.blocks[index].end;
            let last_vpc = end - 1;
            let opcode = Opcode::from_u8(unit.raw(last_vpc).0).ok_or(DecodeError::UnknownOpcode {
                byte: unit.raw(last_vpc).0,
                vpc: last_vpc,
            })?;
            let oparg = unit.full_oparg(last_vpc);

            let (fall_through, target) = match opcode {
                Opcode::JumpForward => (false, Some(last_vpc + 1 + oparg as usize)),
                Opcode::JumpAbsolute => (false, Some(oparg as usize)),
                Opcode::PopJumpIfTrue
                | Opcode::PopJumpIfFalse
                | Opcode::JumpIfTrueOrPop
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfNotExcMatch => (true, Some(oparg as usize)),
                Opcode::ForIter
                | Opcode::SetupFinally
                | Opcode::SetupWith
                | Opcode::SetupAsyncWith => (true, Some(last_vpc + 1 + oparg as usize)),
                Opcode::ReturnValue | Opcode::Reraise | Opcode::RaiseVarargs => (false, None),
                _ => (index != last, None),
            };
            let branch = target.map(|t| self.find(t) as u32);
            edges.push((index, fall_through && index != last, branch));
        }

        for (index, fall_through, branch) in edges {
            self.blocks[index].fall_through = fall_through;
            self.blocks[index].branch = branch;
        }
        self.blocks[0].fall_through = last >= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molten_bytecode::Assembler;

    #[test]
    fn linear_code_is_one_block() {
        let mut asm = Assembler::new("f");
        let one = asm.const_int(1);
        let two = asm.const_int(2);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::LoadConst, two);
        asm.op(Opcode::BinaryAdd);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let table = BlockTable::build(&unit).unwrap();
        // Sentinel plus the single body block.
        assert_eq!(table.block_count(), 2);
        assert_eq!(table.start_of(1), 0);
        assert_eq!(table.blocks[1].end, 4);
        assert!(!table.blocks[1].fall_through);
    }

    #[test]
    fn branch_targets_start_blocks() {
        // if x: return 1 else: return 2
        let mut asm = Assembler::new("f");
        asm.param("x");
        let orelse = asm.label();
        asm.op_arg(Opcode::LoadFast, 0);
        asm.jump(Opcode::PopJumpIfFalse, orelse);
        let one = asm.const_int(1);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op(Opcode::ReturnValue);
        asm.bind(orelse);
        let two = asm.const_int(2);
        asm.op_arg(Opcode::LoadConst, two);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let table = BlockTable::build(&unit).unwrap();
        // Blocks: sentinel | [0,2) cond | [2,4) then | [4,6) else
        assert_eq!(table.block_count(), 4);
        assert_eq!(table.start_of(3), 4);
        assert_eq!(table.find(4), 3);
        let cond = &table.blocks[1];
        assert!(cond.fall_through);
        assert_eq!(cond.branch, Some(3));
    }

    #[test]
    fn blocks_partition_the_vpc_range() {
        let mut asm = Assembler::new("f");
        let x = asm.local("x");
        let top = asm.label();
        let out = asm.label();
        asm.bind(top);
        asm.op_arg(Opcode::LoadFast, x);
        asm.jump(Opcode::PopJumpIfFalse, out);
        asm.jump(Opcode::JumpAbsolute, top);
        asm.bind(out);
        let k = asm.const_(molten_bytecode::Const::None);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();
        let size = unit.instr_count();

        let table = BlockTable::build(&unit).unwrap();
        let mut covered = 0usize;
        for i in 1..table.block_count() {
            assert_eq!(table.start_of(i), covered);
            assert!(table.blocks[i].end > covered, "empty block {i}");
            covered = table.blocks[i].end;
        }
        assert_eq!(covered, size);
    }

    #[test]
    fn loop_back_edge_resolves() {
        let mut asm = Assembler::new("f");
        let top = asm.label();
        let done = asm.label();
        asm.bind(top);
        asm.op_arg(Opcode::LoadFast, 0);
        asm.jump(Opcode::PopJumpIfFalse, done);
        asm.jump(Opcode::JumpAbsolute, top);
        asm.bind(done);
        asm.op_arg(Opcode::LoadConst, 0);
        asm.op(Opcode::ReturnValue);
        asm.local("x");
        let unit = asm.finish();

        let table = BlockTable::build(&unit).unwrap();
        // The JumpAbsolute block branches back to the block at vpc 0.
        let back = &table.blocks[2];
        assert_eq!(back.branch, Some(1));
        assert!(!back.fall_through);
    }

    #[test]
    fn setup_finally_marks_handler_target() {
        let mut asm = Assembler::new("f");
        let handler = asm.label();
        asm.jump(Opcode::SetupFinally, handler);
        asm.op(Opcode::PopBlock);
        asm.op_arg(Opcode::LoadConst, 0);
        asm.op(Opcode::ReturnValue);
        asm.bind(handler);
        asm.op_arg(Opcode::Reraise, 0);
        let unit = asm.finish();

        let table = BlockTable::build(&unit).unwrap();
        let setup = &table.blocks[1];
        assert!(setup.fall_through);
        let handler_block = setup.branch.unwrap() as usize;
        assert_eq!(table.start_of(handler_block), 4);
    }

    #[test]
    fn out_of_range_target_is_rejected() {
        let mut asm = Assembler::new("f");
        asm.op_arg(Opcode::JumpAbsolute, 99);
        let unit = asm.finish();
        assert!(matches!(
            BlockTable::build(&unit),
            Err(CfgError::TargetOutOfRange { target: 99, .. })
        ));
    }
}
