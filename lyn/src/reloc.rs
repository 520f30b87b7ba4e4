use crate::{
    buffer::ByteBuffer,
    error::Error,
    event::{
        EventCode,
        EventKind,
    },
    section::{
        MappingKind,
        Output,
        Relocation,
        Section,
        Symbol,
    },
};

pub const R_ARM_ABS32: u32 = 0x02;
pub const R_ARM_REL32: u32 = 0x03;
pub const R_ARM_ABS16: u32 = 0x05;
pub const R_ARM_ABS8: u32 = 0x06;
pub const R_ARM_THM_CALL: u32 = 0x0A;
pub const R_ARM_CALL: u32 = 0x1C;
pub const R_ARM_JUMP24: u32 = 0x1D;

/// Per-relocation-type encode/decode strategy.
///
/// The handled ARM relocation types form a closed set, dispatched by
/// `match` rather than an open registry. All relocation arithmetic wraps
/// modulo 2^32; no range validation happens beyond field masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relocatelet {
    Abs32,
    Rel32,
    Abs16,
    Abs8,
    ThumbCall,
    ArmCall,
    ArmJump24,
}

impl Relocatelet {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            R_ARM_ABS32 => Some(Relocatelet::Abs32),
            R_ARM_REL32 => Some(Relocatelet::Rel32),
            R_ARM_ABS16 => Some(Relocatelet::Abs16),
            R_ARM_ABS8 => Some(Relocatelet::Abs8),
            R_ARM_THM_CALL => Some(Relocatelet::ThumbCall),
            R_ARM_CALL => Some(Relocatelet::ArmCall),
            R_ARM_JUMP24 => Some(Relocatelet::ArmJump24),
            _ => None,
        }
    }

    /// Like [`Relocatelet::from_code`], but an unknown type code is a hard
    /// error: without a handler neither correct bytes nor a correct
    /// symbolic expression can be produced.
    pub fn lookup(code: u32) -> Result<Self, Error> {
        Self::from_code(code).ok_or(Error::UnsupportedRelocation(code))
    }

    /// Absolute relocations encode the target address itself and may be
    /// resolved against any known address. PC-relative ones are only
    /// meaningful once both the reference site and the target sit in the
    /// same final blob.
    pub fn is_absolute(self) -> bool {
        matches!(self, Relocatelet::Abs32 | Relocatelet::Abs16 | Relocatelet::Abs8)
    }

    /// Only call instructions tolerate redirection through a veneer:
    /// control returns via the link register no matter where the immediate
    /// jump landed. A plain branch never comes back.
    pub fn can_make_trampoline(self) -> bool {
        matches!(self, Relocatelet::ThumbCall | Relocatelet::ArmCall)
    }

    /// Width in bytes of the relocated storage unit.
    pub fn width(self) -> usize {
        match self {
            Relocatelet::Abs8 => 1,
            Relocatelet::Abs16 => 2,
            _ => 4,
        }
    }

    /// Bake the resolved value into the buffer at `offset`.
    pub fn apply(self, data: &mut ByteBuffer, offset: u32, value: u32, addend: i32) -> Result<(), Error> {
        let target = value.wrapping_add(addend as u32);

        match self {
            Relocatelet::Abs32 => data.write(offset, 4, target),
            Relocatelet::Abs16 => data.write(offset, 2, target),
            Relocatelet::Abs8 => data.write(offset, 1, target),
            Relocatelet::Rel32 => data.write(offset, 4, target.wrapping_sub(offset)),
            Relocatelet::ThumbCall => {
                // PC reads as offset+4 at execution time
                let v = target.wrapping_sub(offset).wrapping_sub(4);

                data.write(offset, 2, ((v >> 12) & 0x7FF) | 0xF000)?;
                data.write(offset + 2, 2, ((v >> 1) & 0x7FF) | 0xF800)
            },
            Relocatelet::ArmCall | Relocatelet::ArmJump24 => {
                // PC reads as offset+8; the condition/opcode byte is kept
                let v = target.wrapping_sub(offset).wrapping_sub(8);
                let instruction = data.read(offset, 4)?;

                data.write(offset, 4, ((v >> 2) & 0xFF_FFFF) | (instruction & 0xFF00_0000))
            },
        }
    }

    /// Describe the still-unresolved relocation as a textual expression the
    /// downstream assembler can complete.
    pub fn event_code(self, section: &Section, offset: u32, symbol: &str, addend: i32) -> Result<EventCode, Error> {
        match self {
            Relocatelet::Abs32 => Ok(EventCode::new(EventKind::Poin, abs_expr(symbol, addend))),
            Relocatelet::Abs16 => Ok(EventCode::new(EventKind::Short, abs_expr(symbol, addend))),
            Relocatelet::Abs8 => Ok(EventCode::new(EventKind::Byte, abs_expr(symbol, addend))),
            Relocatelet::Rel32 => Ok(EventCode::new(EventKind::Word, rel_expr(symbol, addend))),
            Relocatelet::ThumbCall => {
                let value = rel_expr(symbol, addend - 4);

                Ok(EventCode::isolated(EventKind::Short, vec![bl_op1(&value), bl_op2(&value)]))
            },
            Relocatelet::ArmCall | Relocatelet::ArmJump24 => {
                let instruction = section.data().read(offset, 4)?;
                let value = rel_expr(symbol, addend - 8);

                Ok(EventCode::isolated(EventKind::Word, vec![b24_expr(instruction, &value)]))
            },
        }
    }

    /// Decode the addend stored in place at `offset`, the inverse of
    /// [`Relocatelet::apply`] with `value = 0`. Call-class fields are
    /// normalized by the pipeline constant so that a plain `bl sym` site
    /// decodes to addend 0.
    pub fn read_addend(self, data: &ByteBuffer, offset: u32) -> Result<i32, Error> {
        match self {
            Relocatelet::Abs32 | Relocatelet::Rel32 => Ok(data.read(offset, 4)? as i32),
            Relocatelet::Abs16 => Ok(data.read(offset, 2)? as u16 as i16 as i32),
            Relocatelet::Abs8 => Ok(data.read(offset, 1)? as u8 as i8 as i32),
            Relocatelet::ThumbCall => {
                let op1 = data.read(offset, 2)?;
                let op2 = data.read(offset + 2, 2)?;
                let mut v = ((op1 & 0x7FF) << 12) | ((op2 & 0x7FF) << 1);

                if v & 0x40_0000 != 0 {
                    v |= 0xFF80_0000;
                }

                Ok((v as i32).wrapping_add(4))
            },
            Relocatelet::ArmCall | Relocatelet::ArmJump24 => {
                let mut v = (data.read(offset, 4)? & 0xFF_FFFF) << 2;

                if v & 0x200_0000 != 0 {
                    v |= 0xFC00_0000;
                }

                Ok((v as i32).wrapping_add(8))
            },
        }
    }

    /// Build a range-extending veneer for this relocation's call kind.
    pub fn make_trampoline(self, symbol: &str, addend: i32) -> Option<Section> {
        match self {
            Relocatelet::ThumbCall => Some(make_thumb_veneer(symbol, addend)),
            Relocatelet::ArmCall => Some(make_arm_veneer(symbol, addend)),
            _ => None,
        }
    }
}

/// `symbol`, or `(symbol+N)` / `(symbol-N)` for a nonzero addend.
pub fn abs_expr(symbol: &str, addend: i32) -> String {
    if addend == 0 {
        return symbol.to_string();
    }

    if addend < 0 {
        format!("({}-{})", symbol, -i64::from(addend))
    } else {
        format!("({}+{})", symbol, addend)
    }
}

/// Relative form: `(symbol±N-CURRENTOFFSET)`. The downstream assembler
/// substitutes CURRENTOFFSET with its own emission-site address.
pub fn rel_expr(symbol: &str, addend: i32) -> String {
    if addend == 0 {
        return symbol.to_string();
    }

    if addend < 0 {
        format!("({}-{}-CURRENTOFFSET)", symbol, -i64::from(addend))
    } else {
        format!("({}+{}-CURRENTOFFSET)", symbol, addend)
    }
}

/// First halfword of a Thumb BL, wrapping the shared relative value.
pub fn bl_op1(value: &str) -> String {
    format!("((({}>>12)&$7FF)|$F000)", value)
}

/// Second halfword of a Thumb BL.
pub fn bl_op2(value: &str) -> String {
    format!("((({}>>1)&$7FF)|$F800)", value)
}

/// ARM B/BL word: displacement expression merged with the literal
/// condition/opcode byte of the original instruction.
pub fn b24_expr(instruction: u32, value: &str) -> String {
    format!("((({}>>2)&$FFFFFF)|${:08X})", value, instruction & 0xFF00_0000)
}

/// 16-byte Thumb-entry veneer: switch to ARM, load the target address from
/// the trailing literal slot and jump through `ip`. Bit 0 of the literal
/// decides the target mode at `bx`.
pub fn make_thumb_veneer(symbol: &str, addend: i32) -> Section {
    let mut data = Vec::with_capacity(0x10);
    data.extend_from_slice(&0x4778_u16.to_le_bytes()); // bx pc
    data.extend_from_slice(&0x46C0_u16.to_le_bytes()); // nop
    data.extend_from_slice(&0xE59F_C000_u32.to_le_bytes()); // ldr ip, =target
    data.extend_from_slice(&0xE12F_FF1C_u32.to_le_bytes()); // bx ip
    data.extend_from_slice(&0_u32.to_le_bytes()); // .word target

    let mut result = Section::with_data("", Output::NoOut, ByteBuffer::from(data));

    result.set_mapping(0x00, MappingKind::Thumb);
    result.set_mapping(0x04, MappingKind::Arm);
    result.set_mapping(0x0C, MappingKind::Data);

    result.add_relocation(Relocation {
        symbol: symbol.to_string(),
        addend,
        code: R_ARM_ABS32,
        offset: 0x0C,
    });

    result
}

/// 12-byte ARM-entry veneer.
pub fn make_arm_veneer(symbol: &str, addend: i32) -> Section {
    let mut data = Vec::with_capacity(0x0C);
    data.extend_from_slice(&0xE59F_C000_u32.to_le_bytes()); // ldr ip, =target
    data.extend_from_slice(&0xE12F_FF1C_u32.to_le_bytes()); // bx ip
    data.extend_from_slice(&0_u32.to_le_bytes()); // .word target

    let mut result = Section::with_data("", Output::NoOut, ByteBuffer::from(data));

    result.set_mapping(0x00, MappingKind::Arm);
    result.set_mapping(0x08, MappingKind::Data);

    result.add_relocation(Relocation {
        symbol: symbol.to_string(),
        addend,
        code: R_ARM_ABS32,
        offset: 0x08,
    });

    result
}

/// Anonymous symbol placed at the entry of each ingested section so that
/// section-relative references stay representable by name.
pub(crate) fn section_anchor(object_index: usize, section_name: &str) -> Symbol {
    Symbol {
        name: format!(".Lsec{}{}", object_index, section_name),
        offset: 0,
    }
}
