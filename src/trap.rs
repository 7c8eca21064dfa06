// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cranelift_codegen::ir::TrapCode;

/// The traps compiled code can raise, as recorded in a module's trap table.
///
/// Hardware-trapping instructions (division, float conversion, the explicit
/// unreachable and stack checks, masked memory accesses) carry one of these
/// at their code offset; the signal handler maps a faulting program counter
/// back through the table.
#[derive(onlyerror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// The call stack budget was exhausted.
    #[error("call stack exhausted")]
    StackOverflow,
    /// An out-of-bounds linear memory access.
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    /// An integer arithmetic operation caused an overflow.
    #[error("integer overflow")]
    IntegerOverflow,
    /// An integer division by zero.
    #[error("integer division by zero")]
    IntegerDivisionByZero,
    /// Failed float-to-int conversion.
    #[error("invalid conversion to integer")]
    BadConversionToInteger,
    /// Code that was supposed to be unreachable was reached.
    #[error("unreachable code executed")]
    UnreachableCodeReached,
}

impl TrapKind {
    /// Converts to the Cranelift trap code emitted into compiled code.
    pub fn into_trap_code(self) -> TrapCode {
        match self {
            TrapKind::StackOverflow => TrapCode::STACK_OVERFLOW,
            TrapKind::MemoryOutOfBounds => TrapCode::HEAP_OUT_OF_BOUNDS,
            TrapKind::IntegerOverflow => TrapCode::INTEGER_OVERFLOW,
            TrapKind::IntegerDivisionByZero => TrapCode::INTEGER_DIVISION_BY_ZERO,
            TrapKind::BadConversionToInteger => TrapCode::BAD_CONVERSION_TO_INTEGER,
            TrapKind::UnreachableCodeReached => {
                TrapCode::user(1).expect("user trap code space exhausted")
            }
        }
    }

    pub fn from_trap_code(code: TrapCode) -> Option<Self> {
        if code == TrapCode::STACK_OVERFLOW {
            Some(TrapKind::StackOverflow)
        } else if code == TrapCode::HEAP_OUT_OF_BOUNDS {
            Some(TrapKind::MemoryOutOfBounds)
        } else if code == TrapCode::INTEGER_OVERFLOW {
            Some(TrapKind::IntegerOverflow)
        } else if code == TrapCode::INTEGER_DIVISION_BY_ZERO {
            Some(TrapKind::IntegerDivisionByZero)
        } else if code == TrapCode::BAD_CONVERSION_TO_INTEGER {
            Some(TrapKind::BadConversionToInteger)
        } else if code == TrapCode::user(1).unwrap() {
            Some(TrapKind::UnreachableCodeReached)
        } else {
            None
        }
    }
}

impl From<TrapKind> for u8 {
    fn from(value: TrapKind) -> Self {
        match value {
            TrapKind::StackOverflow => 0,
            TrapKind::MemoryOutOfBounds => 1,
            TrapKind::IntegerOverflow => 2,
            TrapKind::IntegerDivisionByZero => 3,
            TrapKind::BadConversionToInteger => 4,
            TrapKind::UnreachableCodeReached => 5,
        }
    }
}

impl TryFrom<u8> for TrapKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(Self::StackOverflow),
            1 => Ok(Self::MemoryOutOfBounds),
            2 => Ok(Self::IntegerOverflow),
            3 => Ok(Self::IntegerDivisionByZero),
            4 => Ok(Self::BadConversionToInteger),
            5 => Ok(Self::UnreachableCodeReached),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_codes_round_trip() {
        for kind in [
            TrapKind::StackOverflow,
            TrapKind::MemoryOutOfBounds,
            TrapKind::IntegerOverflow,
            TrapKind::IntegerDivisionByZero,
            TrapKind::BadConversionToInteger,
            TrapKind::UnreachableCodeReached,
        ] {
            assert_eq!(TrapKind::from_trap_code(kind.into_trap_code()), Some(kind));
            assert_eq!(TrapKind::try_from(u8::from(kind)), Ok(kind));
        }
    }
}
