// File: src/bytecode.rs
//
// Bytecode instruction definitions for the Alto VM.
// An instruction is a single 32-bit word: value[21:0] | param[25:22] |
// opcode[31:26]. The value field is signed and sign-extended on read.

use std::fmt;

/// Smallest value representable in the 22-bit signed value field
pub const VALUE_MIN: i32 = -(1 << 21);
/// Largest value representable in the 22-bit signed value field
pub const VALUE_MAX: i32 = (1 << 21) - 1;
/// Largest value representable in the 4-bit param field
pub const PARAM_MAX: u8 = 15;

/// Bytecode operations for the Alto stack VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Push null
    Null = 0,
    /// Push a boolean; value is 0 or 1
    Boolean,
    /// Push an inline integer number
    Number,
    /// Swap the two topmost values
    Swap,
    /// Duplicate the topmost `value` values in place
    Copy,
    /// Pop `value` values
    Drop,
    /// Build a list from the topmost `value` values
    List,
    /// Build a table from the topmost `2 * value` values (key/value pairs)
    Table,
    /// Pop `value` initial values into a new closure frame chained to the
    /// current one
    EnterClosure,
    /// Pop the innermost closure frame
    LeaveClosure,
    /// Push a function whose body starts at address `value`; param 1 means
    /// the function captures the current closure chain
    Function,
    /// Push argument `value`, or null past the end of the argument vector
    LoadArgument,
    /// Push a list of the arguments from index `value` onward
    LoadArgumentList,
    /// Push the receiver bound to `this`
    LoadReceiver,
    /// Push data pool slot `value`
    LoadGlobal,
    /// Push a variable; param is the closure depth (0 = stack local),
    /// value is the slot index
    LoadVariable,
    /// Store the top of stack into a variable without popping it
    StoreVariable,
    /// Pop key and container, push `container[key]`
    LoadElement,
    /// Pop value, key, and container, perform `container[key] = value`,
    /// and push the value back (assignment yields its value)
    StoreElement,
    /// Arithmetic negation over to-number
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    /// Logical negation over to-boolean
    Not,
    And,
    Or,
    Xor,
    /// Equality in the `==` sense; NaN is not equal to itself
    Equal,
    /// Ordering comparisons; false unless both operands are numbers
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    /// Unconditional jump to address `value`
    Jump,
    /// Pop the condition; jump when its truthiness equals param
    ConditionalJump,
    /// Peek the condition; if falsy, jump and keep it, else pop it
    ConditionalAnd,
    /// Peek the condition; if truthy, jump and keep it, else pop it
    ConditionalOr,
    /// Pop a value, coerce to an exception, and unwind to the innermost
    /// handler
    Throw,
    /// Push an exception handler targeting address `value`
    EnterTry,
    /// Pop the innermost handler and jump to address `value`
    LeaveTry,
    /// Push the resume address and jump to the finally block at `value`
    EnterFinally,
    /// Pop the resume address pushed by EnterFinally and jump to it
    LeaveFinally,
    /// Call: pops `value` arguments, a receiver, and a callee; pushes the
    /// result
    Call,
    /// Apply: pops an argument list, a receiver, and a callee; pushes the
    /// result
    Apply,
    /// Pop the result and exit the current interpreter
    Return,
}

/// Count of defined opcodes; used to validate decoding
const OPCODE_COUNT: u8 = OpCode::Return as u8 + 1;

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, u8> {
        // The mnemonic table is in discriminant order, so it doubles as the
        // decode table
        if raw < OPCODE_COUNT {
            Ok(MNEMONICS[raw as usize].opcode)
        } else {
            Err(raw)
        }
    }
}

/// Whether a mnemonic's param or value operand is required, optional with a
/// default, or disallowed. Drives both the assembler and disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Forbidden,
    Optional(i32),
    Required,
}

/// Assembly-level description of one opcode
pub struct Mnemonic {
    pub opcode: OpCode,
    pub name: &'static str,
    pub param: Operand,
    pub value: Operand,
}

/// Mnemonic table in opcode order
pub const MNEMONICS: &[Mnemonic] = &[
    Mnemonic { opcode: OpCode::Null, name: "null", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Boolean, name: "boolean", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::Number, name: "number", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::Swap, name: "swap", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Copy, name: "copy", param: Operand::Forbidden, value: Operand::Optional(1) },
    Mnemonic { opcode: OpCode::Drop, name: "drop", param: Operand::Forbidden, value: Operand::Optional(1) },
    Mnemonic { opcode: OpCode::List, name: "list", param: Operand::Forbidden, value: Operand::Optional(0) },
    Mnemonic { opcode: OpCode::Table, name: "table", param: Operand::Forbidden, value: Operand::Optional(0) },
    Mnemonic { opcode: OpCode::EnterClosure, name: "enterclosure", param: Operand::Forbidden, value: Operand::Optional(0) },
    Mnemonic { opcode: OpCode::LeaveClosure, name: "leaveclosure", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Function, name: "function", param: Operand::Optional(0), value: Operand::Required },
    Mnemonic { opcode: OpCode::LoadArgument, name: "loadargument", param: Operand::Forbidden, value: Operand::Optional(0) },
    Mnemonic { opcode: OpCode::LoadArgumentList, name: "loadargumentlist", param: Operand::Forbidden, value: Operand::Optional(0) },
    Mnemonic { opcode: OpCode::LoadReceiver, name: "loadreceiver", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::LoadGlobal, name: "loadglobal", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::LoadVariable, name: "loadvariable", param: Operand::Optional(0), value: Operand::Required },
    Mnemonic { opcode: OpCode::StoreVariable, name: "storevariable", param: Operand::Optional(0), value: Operand::Required },
    Mnemonic { opcode: OpCode::LoadElement, name: "loadelement", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::StoreElement, name: "storeelement", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Negate, name: "negate", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Add, name: "add", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Subtract, name: "subtract", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Multiply, name: "multiply", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Divide, name: "divide", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Remainder, name: "remainder", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Not, name: "not", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::And, name: "and", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Or, name: "or", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Xor, name: "xor", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Equal, name: "equal", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Less, name: "less", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::LessOrEqual, name: "lessorequal", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Greater, name: "greater", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::GreaterOrEqual, name: "greaterorequal", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Jump, name: "jump", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::ConditionalJump, name: "conditionaljump", param: Operand::Optional(0), value: Operand::Required },
    Mnemonic { opcode: OpCode::ConditionalAnd, name: "conditionaland", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::ConditionalOr, name: "conditionalor", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::Throw, name: "throw", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::EnterTry, name: "entertry", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::LeaveTry, name: "leavetry", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::EnterFinally, name: "enterfinally", param: Operand::Forbidden, value: Operand::Required },
    Mnemonic { opcode: OpCode::LeaveFinally, name: "leavefinally", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Call, name: "call", param: Operand::Forbidden, value: Operand::Optional(0) },
    Mnemonic { opcode: OpCode::Apply, name: "apply", param: Operand::Forbidden, value: Operand::Forbidden },
    Mnemonic { opcode: OpCode::Return, name: "return", param: Operand::Forbidden, value: Operand::Forbidden },
];

/// Look up the mnemonic record for an opcode
pub fn mnemonic(opcode: OpCode) -> &'static Mnemonic {
    &MNEMONICS[opcode as usize]
}

/// Look up a mnemonic record by its assembly name (case-insensitive)
pub fn mnemonic_named(name: &str) -> Option<&'static Mnemonic> {
    MNEMONICS.iter().find(|m| m.name.eq_ignore_ascii_case(name))
}

/// A packed 32-bit instruction word
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(u32);

impl Instruction {
    /// Pack an instruction, clamping param and value into their fields
    pub fn new(opcode: OpCode, param: u8, value: i32) -> Self {
        let param = param.min(PARAM_MAX) as u32;
        let value = value.clamp(VALUE_MIN, VALUE_MAX);
        let word = ((opcode as u32) << 26) | (param << 22) | ((value as u32) & 0x003f_ffff);
        Instruction(word)
    }

    /// Reinterpret a raw word; the opcode field is validated on dispatch,
    /// not here
    pub fn from_word(word: u32) -> Self {
        Instruction(word)
    }

    pub fn word(self) -> u32 {
        self.0
    }

    pub fn opcode(self) -> Result<OpCode, u8> {
        OpCode::try_from((self.0 >> 26) as u8)
    }

    pub fn param(self) -> u8 {
        ((self.0 >> 22) & 0xf) as u8
    }

    /// The signed value field, sign-extended to 32 bits
    pub fn value(self) -> i32 {
        ((self.0 as i32) << 10) >> 10
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.opcode() {
            Ok(op) => {
                let m = mnemonic(op);
                write!(f, "{}", m.name)?;
                if m.param != Operand::Forbidden {
                    write!(f, " {}", self.param())?;
                }
                if m.value != Operand::Forbidden {
                    write!(f, " {}", self.value())?;
                }
                Ok(())
            }
            Err(raw) => write!(f, "?{}", raw),
        }
    }
}

/// Render a code listing, one instruction per line with its address
pub fn disassemble(code: &[Instruction]) -> String {
    code.iter()
        .enumerate()
        .map(|(address, instr)| format!("{:5}  {}", address, instr))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields() {
        let i = Instruction::new(OpCode::LoadVariable, 3, -7);
        assert_eq!(i.opcode(), Ok(OpCode::LoadVariable));
        assert_eq!(i.param(), 3);
        assert_eq!(i.value(), -7);
    }

    #[test]
    fn clamps_out_of_range_construction() {
        let i = Instruction::new(OpCode::Number, 99, VALUE_MAX + 10);
        assert_eq!(i.param(), PARAM_MAX);
        assert_eq!(i.value(), VALUE_MAX);

        let j = Instruction::new(OpCode::Number, 0, VALUE_MIN - 10);
        assert_eq!(j.value(), VALUE_MIN);
    }

    #[test]
    fn sign_extension_covers_the_full_field() {
        for value in [0, 1, -1, 1234, -1234, VALUE_MIN, VALUE_MAX] {
            let i = Instruction::new(OpCode::Jump, 0, value);
            assert_eq!(i.value(), value, "value {} did not survive packing", value);
        }
    }

    #[test]
    fn undefined_opcodes_fail_decoding() {
        let word = 0xffu32 << 26 | 5;
        assert!(Instruction::from_word(word).opcode().is_err());
    }

    #[test]
    fn mnemonic_table_is_in_opcode_order() {
        for (index, m) in MNEMONICS.iter().enumerate() {
            assert_eq!(m.opcode as usize, index, "mnemonic {} out of order", m.name);
        }
        assert_eq!(MNEMONICS.len(), OPCODE_COUNT as usize);
    }

    #[test]
    fn mnemonics_resolve_by_name() {
        assert_eq!(mnemonic_named("LoadGlobal").unwrap().opcode, OpCode::LoadGlobal);
        assert_eq!(mnemonic_named("jump").unwrap().opcode, OpCode::Jump);
        assert!(mnemonic_named("nosuch").is_none());
    }

    #[test]
    fn disassembly_prints_operands_per_mnemonic() {
        let code = [
            Instruction::new(OpCode::Number, 0, 7),
            Instruction::new(OpCode::LoadVariable, 2, 1),
            Instruction::new(OpCode::Swap, 0, 0),
        ];
        let listing = disassemble(&code);
        let lines: Vec<&str> = listing.lines().collect();
        assert!(lines[0].ends_with("number 7"));
        assert!(lines[1].ends_with("loadvariable 2 1"));
        assert!(lines[2].ends_with("swap"));
    }
}
