//! Locals-definition analysis
//!
//! A forward fixed-point over the block graph computing, for every block
//! entry, the set of locals certainly bound on all paths. The lattice is
//! optimistic: every non-entry block starts fully defined and meets by
//! intersection; the entry block starts with just the argument-bound
//! slots. `LoadFast` null checks are dropped exactly where the result
//! proves the local bound.
//!
//! Each block's transfer function is `(input & locals_touched) |
//! locals_deleted`, combining the masks the redundancy pass left after
//! its boundary flips: `locals_touched` holds the pass-through mask and
//! `locals_deleted` the locals the block defines on exit. The field names
//! record what the backward pass accumulated before flipping, not what
//! the combinator consumes.

use molten_bytecode::CodeUnit;

use crate::analysis::cfg::BlockTable;
use crate::bits::{chunk_count, BitSet};

/// Run the analysis; fills each block's `locals_input`.
///
/// Requires the redundancy pass to have populated the per-block masks.
pub fn analyze_locals_definition(unit: &CodeUnit, table: &mut BlockTable) {
    let nlocals = unit.nlocals as usize;
    let chunks = chunk_count(nlocals);
    let block_count = table.block_count();

    let mut worklist: Vec<usize> = Vec::with_capacity(block_count);
    for index in (1..block_count).rev() {
        let block = &mut table.blocks[index];
        block.locals_input = BitSet::new(nlocals);
        block.locals_input.fill(true);
        block.in_worklist = true;
        worklist.push(index);
    }

    // The entry sentinel passes its input through unchanged.
    let entry = &mut table.blocks[0];
    entry.locals_input = BitSet::new(nlocals);
    entry.locals_touched = BitSet::new(nlocals);
    entry.locals_touched.fill(true);
    entry.locals_deleted = BitSet::new(nlocals);
    for slot in 0..unit.bound_arg_slots() as usize {
        entry.locals_input.set(slot);
    }
    entry.in_worklist = true;
    worklist.push(0);

    let mut block_output = vec![0u64; chunks];

    while let Some(index) = worklist.pop() {
        {
            let block = &mut table.blocks[index];
            block.in_worklist = false;
            for i in 0..chunks {
                block_output[i] = (block.locals_input.chunks()[i]
                    & block.locals_touched.chunks()[i])
                    | block.locals_deleted.chunks()[i];
            }
        }

        let fall_through = table.blocks[index].fall_through;
        let branch = table.blocks[index].branch;

        let mut update_successor = |table: &mut BlockTable, succ: usize| {
            let successor = &mut table.blocks[succ];
            let mut any_update = false;
            for i in 0..chunks {
                let chunk = &mut successor.locals_input.chunks_mut()[i];
                let old = *chunk;
                *chunk = old & block_output[i];
                any_update |= *chunk != old;
            }
            if any_update && !successor.in_worklist {
                successor.in_worklist = true;
                worklist.push(succ);
            }
        };

        if fall_through {
            update_successor(table, index + 1);
        }
        if let Some(branch) = branch {
            update_successor(table, branch as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::BlockTable;
    use crate::analysis::redundancy::analyze_redundant_loads;
    use molten_bytecode::{Assembler, Opcode};

    fn analyze(unit: &CodeUnit) -> BlockTable {
        let mut table = BlockTable::build(unit).unwrap();
        analyze_redundant_loads(unit, &mut table);
        analyze_locals_definition(unit, &mut table);
        table
    }

    #[test]
    fn arguments_are_defined_on_entry() {
        let mut asm = Assembler::new("f");
        let a = asm.param("a");
        let _b = asm.param("b");
        asm.op_arg(Opcode::LoadFast, a);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let table = analyze(&unit);
        let body = &table.blocks[1];
        assert!(body.locals_input.get(0));
        assert!(body.locals_input.get(1));
    }

    #[test]
    fn plain_locals_start_unbound() {
        let mut asm = Assembler::new("f");
        let x = asm.local("x");
        asm.op_arg(Opcode::LoadFast, x);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let table = analyze(&unit);
        assert!(!table.blocks[1].locals_input.get(0));
    }

    #[test]
    fn store_in_every_path_defines_at_join() {
        // if a: x = 1 else: x = 2; return x
        let mut asm = Assembler::new("f");
        let a = asm.param("a");
        let x = asm.local("x");
        let one = asm.const_int(1);
        let two = asm.const_int(2);
        let orelse = asm.label();
        let join = asm.label();
        asm.op_arg(Opcode::LoadFast, a);
        asm.jump(Opcode::PopJumpIfFalse, orelse);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::StoreFast, x);
        asm.jump(Opcode::JumpForward, join);
        asm.bind(orelse);
        asm.op_arg(Opcode::LoadConst, two);
        asm.op_arg(Opcode::StoreFast, x);
        asm.bind(join);
        asm.op_arg(Opcode::LoadFast, x);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let table = analyze(&unit);
        let join_block = table.find(7);
        assert!(table.blocks[join_block].locals_input.get(x as usize));
    }

    #[test]
    fn store_in_one_path_is_not_definite() {
        // if a: x = 1
        // return a   (x may be unbound here)
        let mut asm = Assembler::new("f");
        let a = asm.param("a");
        let x = asm.local("x");
        let one = asm.const_int(1);
        let join = asm.label();
        asm.op_arg(Opcode::LoadFast, a);
        asm.jump(Opcode::PopJumpIfFalse, join);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::StoreFast, x);
        asm.bind(join);
        asm.op_arg(Opcode::LoadFast, a);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let table = analyze(&unit);
        let join_block = table.find(4);
        assert!(!table.blocks[join_block].locals_input.get(x as usize));
        assert!(table.blocks[join_block].locals_input.get(a as usize));
    }

    #[test]
    fn surviving_deletion_kills_the_definition() {
        // x = 1 | del x | (join) — x is not defined after the delete block.
        let mut asm = Assembler::new("f");
        let x = asm.local("x");
        let one = asm.const_int(1);
        let second = asm.label();
        let third = asm.label();
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::StoreFast, x);
        asm.jump(Opcode::JumpForward, second);
        asm.bind(second);
        asm.op_arg(Opcode::DeleteFast, x);
        asm.jump(Opcode::JumpForward, third);
        asm.bind(third);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let table = analyze(&unit);
        let second_block = table.find(3);
        let third_block = table.find(5);
        assert!(table.blocks[second_block].locals_input.get(0));
        assert!(!table.blocks[third_block].locals_input.get(0));
    }

    #[test]
    fn loop_keeps_prior_definitions() {
        // x = 1; while a: pass; return x
        let mut asm = Assembler::new("f");
        let a = asm.param("a");
        let x = asm.local("x");
        let one = asm.const_int(1);
        let top = asm.label();
        let out = asm.label();
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::StoreFast, x);
        asm.bind(top);
        asm.op_arg(Opcode::LoadFast, a);
        asm.jump(Opcode::PopJumpIfFalse, out);
        asm.jump(Opcode::JumpAbsolute, top);
        asm.bind(out);
        asm.op_arg(Opcode::LoadFast, x);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let table = analyze(&unit);
        let header = table.find(2);
        let exit = table.find(5);
        assert!(table.blocks[header].locals_input.get(x as usize));
        assert!(table.blocks[exit].locals_input.get(x as usize));
    }
}
