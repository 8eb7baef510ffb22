// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Recovers the host handler address from a vector-table instruction.
//!
//! Host vector tables use two forms: a PC-relative branch (`b label`) and a
//! PC-relative literal load (`ldr pc, [pc, #imm]`). Anything else is
//! rejected so the patcher never installs a trampoline that chains to an
//! address it guessed.

const BRANCH_MASK: u32 = 0x0E00_0000;
const BRANCH_OPCODE: u32 = 0x0A00_0000;
const SDT_MASK: u32 = 0x0C00_0000;
const SDT_OPCODE: u32 = 0x0400_0000;

const SDT_REGISTER_OFFSET: u32 = 1 << 25;
const SDT_PRE_INDEX: u32 = 1 << 24;
const SDT_UP: u32 = 1 << 23;
const SDT_LOAD: u32 = 1 << 20;
const RN_PC: u32 = 0xF;

/// The CPU reads PC two instructions ahead of the one executing.
pub const PREFETCH_ADJUSTMENT: u32 = 8;

/// `ldr pc, [pc, #0x18]`: loads the word eight slots past the instruction.
pub const LDR_PC_LITERAL_18: u32 = 0xE59F_F018;

/// Where a decoded vector instruction sends the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// Branch target, already absolute.
    Direct(u32),
    /// Address of the literal holding the handler address.
    Literal(u32),
}

/// Instruction forms the decoder refuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Neither a branch nor a single data transfer.
    Unsupported(u32),
    /// Single data transfer with a register offset.
    RegisterOffset(u32),
    /// Post-indexed transfer; the address is the base register itself.
    PostIndexed(u32),
    /// Store, or a load that does not base off the PC.
    NotPcLiteral(u32),
}

/// Decodes `instruction` located at `address`.
///
/// Branch offsets are sign-extended from 24 bits and scaled by four.
pub fn decode(instruction: u32, address: u32) -> Result<Target, DecodeError> {
    // Condition 0b1111 is the unconditional space: BLX and PLD, not B or LDR.
    if instruction >> 28 == 0xF {
        return Err(DecodeError::Unsupported(instruction));
    }
    if instruction & BRANCH_MASK == BRANCH_OPCODE {
        let offset = (((instruction & 0x00FF_FFFF) << 8) as i32 >> 6) as u32;
        return Ok(Target::Direct(address.wrapping_add(PREFETCH_ADJUSTMENT).wrapping_add(offset)));
    }
    if instruction & SDT_MASK == SDT_OPCODE {
        if instruction & SDT_REGISTER_OFFSET != 0 {
            return Err(DecodeError::RegisterOffset(instruction));
        }
        if instruction & SDT_PRE_INDEX == 0 {
            return Err(DecodeError::PostIndexed(instruction));
        }
        if instruction & SDT_LOAD == 0 || (instruction >> 16) & 0xF != RN_PC {
            return Err(DecodeError::NotPcLiteral(instruction));
        }
        let offset = instruction & 0xFFF;
        let pc = address.wrapping_add(PREFETCH_ADJUSTMENT);
        let literal = if instruction & SDT_UP != 0 { pc.wrapping_add(offset) } else { pc.wrapping_sub(offset) };
        return Ok(Target::Literal(literal));
    }
    Err(DecodeError::Unsupported(instruction))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_branch() {
        // b +0xFF4 from the undefined-instruction slot.
        assert_eq!(decode(0xEA00_03FD, 0xFFFF_0004), Ok(Target::Direct(0xFFFF_1000)));
    }

    #[test]
    fn backward_branch_sign_extends() {
        // b . (offset -2 words) branches to itself.
        assert_eq!(decode(0xEAFF_FFFE, 0xC000_0010), Ok(Target::Direct(0xC000_0010)));
        assert_eq!(decode(0xEAFF_FFFF, 0x0000_0000), Ok(Target::Direct(0x0000_0004)));
    }

    #[test]
    fn branch_with_link_is_a_branch() {
        assert_eq!(decode(0xEB00_0000, 0x100), Ok(Target::Direct(0x108)));
    }

    #[test]
    fn pc_literal_up_and_down() {
        assert_eq!(decode(0xE59F_F410, 0xFFFF_0008), Ok(Target::Literal(0xFFFF_0420)));
        assert_eq!(decode(0xE51F_F004, 0xFFFF_0010), Ok(Target::Literal(0xFFFF_0014)));
        // The trampoline's own load lands eight slots past the instruction.
        assert_eq!(decode(LDR_PC_LITERAL_18, 0xFFFF_0004), Ok(Target::Literal(0xFFFF_0024)));
    }

    #[test]
    fn rejects_other_forms() {
        assert_eq!(decode(0xE1A0_F009, 0), Err(DecodeError::Unsupported(0xE1A0_F009)));
        assert_eq!(decode(0xEF00_0000, 0), Err(DecodeError::Unsupported(0xEF00_0000)));
        assert_eq!(decode(0xE79F_F001, 0), Err(DecodeError::RegisterOffset(0xE79F_F001)));
        assert_eq!(decode(0xE49F_F004, 0), Err(DecodeError::PostIndexed(0xE49F_F004)));
        assert_eq!(decode(0xE591_F000, 0), Err(DecodeError::NotPcLiteral(0xE591_F000)));
        assert_eq!(decode(0xE58F_F000, 0), Err(DecodeError::NotPcLiteral(0xE58F_F000)));
    }

    #[test]
    fn rejects_the_unconditional_space() {
        // blx to a Thumb target, and pld [pc, #4]
        assert_eq!(decode(0xFA00_0000, 0), Err(DecodeError::Unsupported(0xFA00_0000)));
        assert_eq!(decode(0xF5DF_F004, 0), Err(DecodeError::Unsupported(0xF5DF_F004)));
    }
}
