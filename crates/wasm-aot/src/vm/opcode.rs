macro_rules! opcodes {
    ($($name:ident = $value:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            #[must_use]
            pub const fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(Self::$name),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Trap = 0,
    CheckInterrupt = 1,
    // Constants
    Const32 = 10,
    Const64 = 11,
    // Locals (slot addressed)
    Load = 20,
    Load2 = 21,
    Store = 22,
    Store2 = 23,
    // Operand stack
    Pop = 30,
    Pop2 = 31,
    Dup = 32,
    Dup2 = 33,
    DropKeep = 34,
    Select = 35,
    Select2 = 36,
    // Control transfer (relative byte offsets)
    Goto = 40,
    IfEq = 41,
    IfNe = 42,
    Switch = 43,
    Return = 44,
    // Numeric helper, operator code follows
    Num = 50,
    // Linear memory
    MemLoad = 60,
    MemStore = 61,
    MemorySize = 62,
    MemoryGrow = 63,
    MemoryFill = 64,
    MemoryCopy = 65,
    MemoryInit = 66,
    DataDrop = 67,
    // Globals
    GlobalGet = 70,
    GlobalGet2 = 71,
    GlobalSet = 72,
    GlobalSet2 = 73,
    // Tables and references
    TableGet = 80,
    TableSet = 81,
    TableSize = 82,
    TableGrow = 83,
    TableFill = 84,
    TableCopy = 85,
    TableInit = 86,
    ElemDrop = 87,
    RefFunc = 88,
    RefIsNull = 89,
    // Calls
    Call = 100,
    CallIndirect = 101,
    CallImport = 102,
    CallInterpreter = 103,
    // Value vectors
    BoxParams = 110,
    UnboxParams = 111,
    BoxResults = 112,
    UnboxResults = 113,
}

impl Opcode {
    /// Control never falls through to the next instruction.
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Trap | Self::Goto | Self::Switch | Self::Return)
    }

    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(self, Self::Goto | Self::IfEq | Self::IfNe | Self::Switch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_bytes_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_byte(2), None);
        assert_eq!(Opcode::from_byte(Opcode::Switch as u8), Some(Opcode::Switch));
    }
}
