//! Architecture-specific operation prologues.
//!
//! Generated code and native code disagree about where arguments live, and
//! several operations need the return address of their call to find the
//! site's metadata. Each supported architecture gets one prologue that
//! captures the return address into the next argument slot and puts the
//! operands in native order. The architecture is fixed when the crate is
//! built.

use thiserror::Error;

use crate::compiled_unit::ReturnAddress;

/// Errors decoding an operation call from machine state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrampolineError {
    /// The return address was not where the architecture keeps it
    #[error("return address missing from {0:?} call")]
    MissingReturnAddress(Architecture),

    /// Fewer operands were passed than the operation takes
    #[error("operation takes {expected} operands, found {found}")]
    MissingOperands {
        /// Operands the operation takes
        expected: usize,
        /// Operands available
        found: usize,
    },
}

/// A supported code generation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// 64-bit x86, System V
    X86_64,
    /// 64-bit ARM, AAPCS64
    Aarch64,
    /// 32-bit x86, cdecl
    X86,
    /// 32-bit ARM, AAPCS
    Arm32,
}

impl Architecture {
    /// The architecture this crate was built for.
    ///
    /// Targets without a code generator fall back to the 64-bit x86 layout,
    /// which only the modelled trampolines ever see.
    pub fn host() -> Architecture {
        use target_lexicon::Architecture as Target;
        match target_lexicon::HOST.architecture {
            Target::Aarch64(_) => Architecture::Aarch64,
            Target::X86_32(_) => Architecture::X86,
            Target::Arm(_) => Architecture::Arm32,
            _ => Architecture::X86_64,
        }
    }

    /// Integer argument registers in the native convention.
    pub fn argument_registers(self) -> usize {
        match self {
            Architecture::X86_64 => 6,
            Architecture::Aarch64 => 8,
            Architecture::X86 => 0,
            Architecture::Arm32 => 4,
        }
    }

    /// Returns true if `call` pushes the return address; otherwise it lands
    /// in the link register.
    pub fn return_address_on_stack(self) -> bool {
        matches!(self, Architecture::X86_64 | Architecture::X86)
    }

    /// Returns true if generated code pushes stack operands in source order,
    /// leaving them reversed relative to the native convention.
    fn pushes_operands_in_order(self) -> bool {
        self == Architecture::X86
    }
}

/// Registers and stack at the first instruction of a callee.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineState {
    /// Argument registers in order
    pub registers: Vec<u64>,
    /// Stack words, top first
    pub stack: Vec<u64>,
    /// Link register, on architectures that have one
    pub link_register: Option<u64>,
}

/// An operation call as the native implementation sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCall {
    /// Argument words in native parameter order, return address last if it
    /// was captured
    pub arguments: Vec<u64>,
    /// The captured return address
    pub return_address: Option<ReturnAddress>,
}

impl NativeCall {
    /// Where each argument sits under the native convention.
    pub fn layout(&self, arch: Architecture) -> MachineState {
        let split = arch.argument_registers().min(self.arguments.len());
        MachineState {
            registers: self.arguments[..split].to_vec(),
            stack: self.arguments[split..].to_vec(),
            link_register: None,
        }
    }
}

/// Sets up machine state the way generated code calls an operation.
pub fn emit_operation_call(
    arch: Architecture,
    operands: &[u64],
    return_address: ReturnAddress,
) -> MachineState {
    let split = arch.argument_registers().min(operands.len());
    let mut stack: Vec<u64> = operands[split..].to_vec();
    if arch.pushes_operands_in_order() {
        stack.reverse();
    }
    let mut state = MachineState {
        registers: operands[..split].to_vec(),
        stack,
        link_register: None,
    };
    if arch.return_address_on_stack() {
        state.stack.insert(0, return_address.0 as u64);
    } else {
        state.link_register = Some(return_address.0 as u64);
    }
    state
}

/// Runs an operation prologue: reads `operand_count` operands in native
/// order and, if `capture_return_address`, appends the return address as
/// one more argument.
pub fn enter_operation(
    arch: Architecture,
    state: &MachineState,
    operand_count: usize,
    capture_return_address: bool,
) -> Result<NativeCall, TrampolineError> {
    let (return_address, stack) = if arch.return_address_on_stack() {
        match state.stack.split_first() {
            Some((word, rest)) => (Some(*word), rest),
            None => (None, &state.stack[..]),
        }
    } else {
        (state.link_register, &state.stack[..])
    };
    let return_address = return_address.ok_or(TrampolineError::MissingReturnAddress(arch))?;

    let in_registers = arch.argument_registers().min(operand_count);
    let on_stack = operand_count - in_registers;
    let found = state.registers.len().min(in_registers) + stack.len().min(on_stack);
    if state.registers.len() < in_registers || stack.len() < on_stack {
        return Err(TrampolineError::MissingOperands {
            expected: operand_count,
            found,
        });
    }

    let mut arguments = Vec::with_capacity(operand_count + 1);
    arguments.extend_from_slice(&state.registers[..in_registers]);
    if arch.pushes_operands_in_order() {
        arguments.extend(stack[..on_stack].iter().rev());
    } else {
        arguments.extend_from_slice(&stack[..on_stack]);
    }

    let return_address = capture_return_address.then_some(ReturnAddress(return_address as usize));
    if let Some(address) = return_address {
        arguments.push(address.0 as u64);
    }
    Ok(NativeCall {
        arguments,
        return_address,
    })
}
