//! Textual IR rendering, for tests and the debug dump sink.

use std::fmt;

use super::instr::{IrBlock, IrFunction, IrInst, IrTerminator};

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function @{}({}, {}) {{",
            self.name, self.symbols_param, self.frame_param
        )?;
        if !self.dispatch.is_empty() {
            let targets: Vec<String> = self.dispatch.iter().map(|b| b.to_string()).collect();
            writeln!(f, "  ; dispatch [{}]", targets.join(", "))?;
        }
        for block in &self.blocks {
            write_block(f, block)?;
        }
        writeln!(f, "}}")
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, block: &IrBlock) -> fmt::Result {
    writeln!(f, "{}:", block.id)?;
    for inst in &block.instrs {
        write!(f, "  ")?;
        write_inst(f, inst)?;
        writeln!(f)?;
    }
    write!(f, "  ")?;
    write_terminator(f, &block.terminator)?;
    writeln!(f)
}

fn write_inst(f: &mut fmt::Formatter<'_>, inst: &IrInst) -> fmt::Result {
    match inst {
        IrInst::ConstInt { dest, ty, value } => write!(f, "{dest} = iconst.{ty} {value}"),
        IrInst::ConstNull { dest } => write!(f, "{dest} = null"),
        IrInst::Load {
            dest,
            ty,
            base,
            offset,
        } => write!(f, "{dest} = load.{ty} {base}+{offset}"),
        IrInst::Store {
            ty,
            base,
            offset,
            value,
        } => write!(f, "store.{ty} {value}, {base}+{offset}"),
        IrInst::Lea { dest, base, offset } => write!(f, "{dest} = lea {base}+{offset}"),
        IrInst::IAdd { dest, ty, a, b } => write!(f, "{dest} = iadd.{ty} {a}, {b}"),
        IrInst::ISub { dest, ty, a, b } => write!(f, "{dest} = isub.{ty} {a}, {b}"),
        IrInst::ICmp { dest, cond, a, b } => write!(f, "{dest} = icmp.{cond} {a}, {b}"),
        IrInst::Select {
            dest,
            cond,
            if_true,
            if_false,
        } => write!(f, "{dest} = select {cond}, {if_true}, {if_false}"),
        IrInst::LoadSym { dest, sym } => write!(f, "{dest} = sym {}", sym.name()),
        IrInst::CallSym { dest, sym, args } => {
            if let Some(dest) = dest {
                write!(f, "{dest} = call {}(", sym.name())?;
            } else {
                write!(f, "call {}(", sym.name())?;
            }
            write_args(f, args)
        }
        IrInst::CallIndirect { dest, callee, args } => {
            if let Some(dest) = dest {
                write!(f, "{dest} = call_indirect {callee}(")?;
            } else {
                write!(f, "call_indirect {callee}(")?;
            }
            write_args(f, args)
        }
        IrInst::Phi { dest, ty, sources } => {
            write!(f, "{dest} = phi.{ty} ")?;
            for (i, (block, value)) in sources.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "[{block}: {value}]")?;
            }
            Ok(())
        }
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[super::instr::Value]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{arg}")?;
    }
    write!(f, ")")
}

fn write_terminator(f: &mut fmt::Formatter<'_>, terminator: &IrTerminator) -> fmt::Result {
    match terminator {
        IrTerminator::Jump(target) => write!(f, "jump {target}"),
        IrTerminator::Branch {
            cond,
            then_block,
            else_block,
            hint,
        } => {
            write!(f, "brif {cond}, {then_block}, {else_block}")?;
            match hint {
                Some(true) => write!(f, " likely"),
                Some(false) => write!(f, " unlikely"),
                None => Ok(()),
            }
        }
        IrTerminator::Dispatch {
            selector,
            targets,
            default,
        } => {
            write!(f, "dispatch {selector} [")?;
            for (i, target) in targets.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{target}")?;
            }
            write!(f, "], default {default}")
        }
        IrTerminator::Return(value) => write!(f, "return {value}"),
        IrTerminator::Unreachable => write!(f, "unreachable"),
        IrTerminator::None => write!(f, "<unterminated>"),
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::builder::IrBuilder;
    use crate::ir::instr::{IrFunction, IrType};
    use crate::runtime::table::Sym;

    #[test]
    fn renders_instructions_and_terminators() {
        let mut func = IrFunction::new("demo".to_string());
        let entry = func.add_block();
        func.entry = entry;

        let mut b = IrBuilder::new(&mut func);
        let frame = b.func().frame_param;
        let value = b.load(IrType::Ptr, frame, 16);
        let result = b.call_sym(Sym::BinaryAdd, &[value, value]);
        b.ret(result);

        let text = func.to_string();
        assert!(text.contains("function @demo"));
        assert!(text.contains("load.ptr"));
        assert!(text.contains("call binary_add("));
        assert!(text.contains("return"));
    }
}
