use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Relocation type {0:#04x} has no registered handler")]
    UnsupportedRelocation(u32),

    #[error("Access of {size} byte(s) at {offset:#x} is outside the {len}-byte buffer")]
    OutOfBounds { offset: u32, size: usize, len: usize },

    #[error("Invalid ELF object: {0}")]
    InvalidElf(String),

    #[error("Bad symbol table: {0}")]
    BadSymbolTable(String),

    #[error("IO error: {0}")]
    Io(String),
}
