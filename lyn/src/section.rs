use crate::buffer::ByteBuffer;

/// How a span of section bytes is decoded when emitted: plain data bytes,
/// 16-bit Thumb units or 32-bit ARM units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Data,
    Thumb,
    Arm,
}

/// A code-mode region. It applies from `offset` up to the next
/// higher-offset region (or the end of the section).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub offset: u32,
    pub kind: MappingKind,
}

/// A named location inside a section's byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub offset: u32,
}

/// A pending reference: the storage unit at `offset` must encode
/// `symbol + addend` under the rules of relocation type `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub symbol: String,
    pub addend: i32,
    pub code: u32,
    pub offset: u32,
}

/// Output routing tag. Reserved for multi-section output; the single-blob
/// pipeline only ever constructs sections and never consults it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Output {
    #[default]
    NoOut,
    Rom,
}

/// A byte buffer plus its three parallel metadata streams: code-mode
/// mappings, symbols and relocations.
///
/// Sections are only ever grown: [`Section::combine`] appends another
/// section's bytes and shifts its metadata offsets past the prior size.
/// Combination order therefore decides final blob offsets.
#[derive(Debug, Default)]
pub struct Section {
    name: String,
    output: Output,
    data: ByteBuffer,
    mappings: Vec<Mapping>,
    symbols: Vec<Symbol>,
    relocations: Vec<Relocation>,
}

impl Section {
    pub fn new<S: Into<String>>(name: S, output: Output) -> Self {
        Self {
            name: name.into(),
            output,
            ..Self::default()
        }
    }

    pub fn with_data<S: Into<String>>(name: S, output: Output, data: ByteBuffer) -> Self {
        Self {
            name: name.into(),
            output,
            data,
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> Output {
        self.output
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn data(&self) -> &ByteBuffer {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ByteBuffer {
        &mut self.data
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Set the code mode from `offset` on. Re-setting an existing offset
    /// overwrites its mode; the region list stays sorted by offset.
    pub fn set_mapping(&mut self, offset: u32, kind: MappingKind) {
        match self.mappings.binary_search_by_key(&offset, |mapping| mapping.offset) {
            Ok(pos) => self.mappings[pos].kind = kind,
            Err(pos) => self.mappings.insert(pos, Mapping {
                offset,
                kind,
            }),
        }
    }

    /// The code mode in effect at `offset`. Defaults to [`MappingKind::Data`]
    /// when no region covers it.
    pub fn mapping_at(&self, offset: u32) -> MappingKind {
        self.mappings
            .iter()
            .rev()
            .find(|mapping| mapping.offset <= offset)
            .map_or(MappingKind::Data, |mapping| mapping.kind)
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut Vec<Symbol> {
        &mut self.symbols
    }

    pub fn add_symbol(&mut self, symbol: Symbol) {
        self.symbols.push(symbol);
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn relocations_mut(&mut self) -> &mut Vec<Relocation> {
        &mut self.relocations
    }

    pub fn add_relocation(&mut self, relocation: Relocation) {
        self.relocations.push(relocation);
    }

    /// Append `other` to this section, shifting every offset in its
    /// mappings, symbols and relocations by this section's prior size.
    pub fn combine(&mut self, other: Section) {
        let base = self.size();

        self.mappings.extend(other.mappings.into_iter().map(|mut mapping| {
            mapping.offset += base;
            mapping
        }));

        self.symbols.extend(other.symbols.into_iter().map(|mut symbol| {
            symbol.offset += base;
            symbol
        }));

        self.relocations.extend(other.relocations.into_iter().map(|mut relocation| {
            relocation.offset += base;
            relocation
        }));

        self.data.append(&other.data);
    }
}
