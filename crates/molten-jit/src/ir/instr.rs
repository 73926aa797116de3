//! The abstract IR
//!
//! A small, backend-agnostic instruction set the emitter targets: raw
//! loads and stores at byte offsets, integer arithmetic for the inlined
//! refcount sequences, calls into the runtime helpers table, and block
//! terminators including the entry-dispatch used for handler re-entry.
//! Values are single-assignment; `Phi` appears only in the loop the
//! emitter builds for wide stack rotations.

use rustc_hash::FxHashMap;

use crate::runtime::table::Sym;

/// An IR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(pub u32);

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A basic-block id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrBlockId(pub u32);

impl std::fmt::Display for IrBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Machine-level value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    /// One byte; comparison results.
    I8,
    /// 32-bit integer; frame indices and opargs.
    I32,
    /// 64-bit integer; refcounts.
    I64,
    /// Pointer-sized integer.
    Ptr,
}

impl std::fmt::Display for IrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrType::I8 => write!(f, "i8"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::Ptr => write!(f, "ptr"),
        }
    }
}

/// Comparison condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
}

impl std::fmt::Display for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cond::Eq => write!(f, "eq"),
            Cond::Ne => write!(f, "ne"),
        }
    }
}

/// One IR instruction.
#[derive(Debug, Clone)]
pub enum IrInst {
    /// Integer or pointer-width constant.
    ConstInt {
        dest: Value,
        ty: IrType,
        value: i64,
    },
    /// The null pointer.
    ConstNull { dest: Value },
    /// Load a typed value from `base + offset`.
    Load {
        dest: Value,
        ty: IrType,
        base: Value,
        offset: i32,
    },
    /// Store a typed value to `base + offset`.
    Store {
        ty: IrType,
        base: Value,
        offset: i32,
        value: Value,
    },
    /// Pointer plus byte offset.
    Lea {
        dest: Value,
        base: Value,
        offset: i32,
    },
    /// Integer addition.
    IAdd {
        dest: Value,
        ty: IrType,
        a: Value,
        b: Value,
    },
    /// Integer subtraction.
    ISub {
        dest: Value,
        ty: IrType,
        a: Value,
        b: Value,
    },
    /// Comparison producing an `I8` flag.
    ICmp {
        dest: Value,
        cond: Cond,
        a: Value,
        b: Value,
    },
    /// Flag-driven choice between two values of the same type.
    Select {
        dest: Value,
        cond: Value,
        if_true: Value,
        if_false: Value,
    },
    /// Load an entry (function or data pointer) from the helpers table.
    LoadSym { dest: Value, sym: Sym },
    /// Load-plus-indirect-call of a helper through the table.
    CallSym {
        dest: Option<Value>,
        sym: Sym,
        args: Vec<Value>,
    },
    /// Indirect call through an already-loaded function pointer, used for
    /// the iterator `next` slot.
    CallIndirect {
        dest: Option<Value>,
        callee: Value,
        args: Vec<Value>,
    },
    /// Merge of per-predecessor values; only the wide-rotation loop emits
    /// these.
    Phi {
        dest: Value,
        ty: IrType,
        sources: Vec<(IrBlockId, Value)>,
    },
}

/// How a block ends.
#[derive(Debug, Clone)]
pub enum IrTerminator {
    /// Unconditional jump.
    Jump(IrBlockId),
    /// Two-way branch on an `I8` flag; `hint` biases prediction toward
    /// the then edge when `Some(true)`.
    Branch {
        cond: Value,
        then_block: IrBlockId,
        else_block: IrBlockId,
        hint: Option<bool>,
    },
    /// Multi-way dispatch on a small integer selector; out-of-range
    /// selectors take `default`. The function entry dispatches handler
    /// tokens through this.
    Dispatch {
        selector: Value,
        targets: Vec<IrBlockId>,
        default: IrBlockId,
    },
    /// Return a pointer-sized value to the caller.
    Return(Value),
    /// Control cannot reach here (after a no-return helper).
    Unreachable,
    /// Not yet assigned.
    None,
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub id: IrBlockId,
    pub instrs: Vec<IrInst>,
    pub terminator: IrTerminator,
}

/// A whole translated function.
///
/// Two parameters, fixed by the compiled-function ABI: the helpers-table
/// pointer and the frame pointer.
#[derive(Debug)]
pub struct IrFunction {
    /// Code-unit name, for diagnostics.
    pub name: String,
    pub blocks: Vec<IrBlock>,
    pub entry: IrBlockId,
    /// The helpers-table argument.
    pub symbols_param: Value,
    /// The frame argument.
    pub frame_param: Value,
    /// Handler dispatch table; index 0 is the function body, later
    /// entries are handler blocks in token order.
    pub dispatch: Vec<IrBlockId>,
    next_value: u32,
    value_types: FxHashMap<Value, IrType>,
}

impl IrFunction {
    /// New function with the two ABI parameters pre-allocated.
    pub fn new(name: String) -> Self {
        let mut func = IrFunction {
            name,
            blocks: Vec::new(),
            entry: IrBlockId(0),
            symbols_param: Value(0),
            frame_param: Value(1),
            dispatch: Vec::new(),
            next_value: 0,
            value_types: FxHashMap::default(),
        };
        func.symbols_param = func.alloc_value(IrType::Ptr);
        func.frame_param = func.alloc_value(IrType::Ptr);
        func
    }

    /// Allocate a fresh value of a given type.
    pub fn alloc_value(&mut self, ty: IrType) -> Value {
        let value = Value(self.next_value);
        self.next_value += 1;
        self.value_types.insert(value, ty);
        value
    }

    /// The type of a value.
    pub fn value_type(&self, value: Value) -> IrType {
        self.value_types.get(&value).copied().unwrap_or(IrType::Ptr)
    }

    /// Number of values allocated so far.
    pub fn value_count(&self) -> u32 {
        self.next_value
    }

    /// Append an empty block.
    pub fn add_block(&mut self) -> IrBlockId {
        let id = IrBlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock {
            id,
            instrs: Vec::new(),
            terminator: IrTerminator::None,
        });
        id
    }

    /// Borrow a block.
    pub fn block(&self, id: IrBlockId) -> &IrBlock {
        &self.blocks[id.0 as usize]
    }

    /// Borrow a block mutably.
    pub fn block_mut(&mut self, id: IrBlockId) -> &mut IrBlock {
        &mut self.blocks[id.0 as usize]
    }

    /// Total instructions across all blocks.
    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Count the `CallSym` instructions naming a particular helper, for
    /// tests asserting helper-call budgets.
    pub fn count_calls(&self, sym: Sym) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .filter(|inst| matches!(inst, IrInst::CallSym { sym: s, .. } if *s == sym))
            .count()
    }
}
