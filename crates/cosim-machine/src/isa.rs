//! Word-encoded reference guest ISA.
//!
//! Each instruction is one little-endian `u32`: opcode in bits 31..24, operand in bits 23..0.

use thiserror::Error;

/// Load address of the guest image (the `virt` machine's BIOS base).
pub const RESET_PC: u64 = 0x8000_0000;

pub const INSN_BYTES: u64 = 4;

const OPERAND_MASK: u32 = 0x00ff_ffff;

pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const ADDI: u8 = 0x01;
    pub const JMP: u8 = 0x02;
    pub const WFI: u8 = 0x03;
    pub const EBREAK: u8 = 0x04;
    pub const AMOADD: u8 = 0x05;
    pub const HALT: u8 = 0xff;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Nop,
    /// `acc += imm`.
    Addi(u32),
    /// Jump to instruction `word_index` of the image.
    Jmp(u32),
    /// Halt until woken.
    Wfi,
    Ebreak,
    /// Add `imm` to the shared memory word; `acc` receives the new value. Needs exclusive
    /// execution.
    AmoAdd(u32),
    /// Stop this CPU for good.
    Halt,
}

impl Insn {
    pub fn decode(word: u32) -> Option<Self> {
        let operand = word & OPERAND_MASK;
        let insn = match (word >> 24) as u8 {
            opcode::NOP => Insn::Nop,
            opcode::ADDI => Insn::Addi(operand),
            opcode::JMP => Insn::Jmp(operand),
            opcode::WFI => Insn::Wfi,
            opcode::EBREAK => Insn::Ebreak,
            opcode::AMOADD => Insn::AmoAdd(operand),
            opcode::HALT => Insn::Halt,
            _ => return None,
        };
        Some(insn)
    }

    pub fn encode(self) -> u32 {
        let (op, operand) = match self {
            Insn::Nop => (opcode::NOP, 0),
            Insn::Addi(imm) => (opcode::ADDI, imm),
            Insn::Jmp(target) => (opcode::JMP, target),
            Insn::Wfi => (opcode::WFI, 0),
            Insn::Ebreak => (opcode::EBREAK, 0),
            Insn::AmoAdd(imm) => (opcode::AMOADD, imm),
            Insn::Halt => (opcode::HALT, 0),
        };
        (u32::from(op) << 24) | (operand & OPERAND_MASK)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("guest image is empty")]
    Empty,
    #[error("guest image length {0} is not a multiple of 4 bytes")]
    Truncated(usize),
    #[error("unknown opcode {opcode:#04x} at offset {offset:#x}")]
    UnknownOpcode { offset: usize, opcode: u8 },
}

/// A decoded guest program, mapped at [`RESET_PC`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestImage {
    insns: Vec<Insn>,
}

impl GuestImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        if bytes.len() % 4 != 0 {
            return Err(ImageError::Truncated(bytes.len()));
        }
        let insns = bytes
            .chunks_exact(4)
            .enumerate()
            .map(|(i, chunk)| {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                Insn::decode(word).ok_or(ImageError::UnknownOpcode {
                    offset: i * 4,
                    opcode: (word >> 24) as u8,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { insns })
    }

    pub fn from_insns(insns: impl IntoIterator<Item = Insn>) -> Self {
        Self {
            insns: insns.into_iter().collect(),
        }
    }

    /// Little-endian encoding, as [`parse`](Self::parse) expects it.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.insns
            .iter()
            .flat_map(|insn| insn.encode().to_le_bytes())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// The instruction at `pc`, or `None` outside the image or off a word boundary.
    pub fn fetch(&self, pc: u64) -> Option<Insn> {
        let offset = pc.checked_sub(RESET_PC)?;
        if offset % INSN_BYTES != 0 {
            return None;
        }
        let index = usize::try_from(offset / INSN_BYTES).ok()?;
        self.insns.get(index).copied()
    }
}

pub fn word_address(word_index: u32) -> u64 {
    RESET_PC + u64::from(word_index) * INSN_BYTES
}
