use std::{
    io::Write,
    mem,
};

use rustc_hash::{
    FxHashMap,
    FxHashSet,
};

use crate::{
    elf::ObjectFile,
    error::Error,
    event::{
        EventCode,
        EventKind,
        EventSection,
    },
    reloc::Relocatelet,
    section::{
        MappingKind,
        Relocation,
        Section,
        Symbol,
    },
};

const HOOK_PREFIX: &str = "hook_";
const TEMPORARY_PREFIX: &str = ".L";

/// A patch point extracted from the symbol table: the address it replaces
/// in the original ROM, and the symbol the patch should branch into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub address: u32,
    pub name: String,
}

/// Compiler-internal labels follow the local-label naming convention.
fn is_temporary(name: &str) -> bool {
    name.starts_with(TEMPORARY_PREFIX)
}

fn parse_hook(symbol: &Symbol) -> Option<Hook> {
    let suffix = symbol.name.strip_prefix(HOOK_PREFIX)?;
    let address = u32::from_str_radix(suffix, 16).ok()?;

    Some(Hook {
        address,
        name: symbol.name.clone(),
    })
}

/// The linking pipeline: one combined section accumulated from the input
/// objects, plus the absolute symbols known by name rather than by being
/// placed in the blob.
///
/// Resolution passes convert pending relocations into literal bytes where a
/// binding exists; whatever is left over is emitted symbolically. Only a
/// relocation type code without a handler is an error.
#[derive(Debug, Default)]
pub struct EventObject {
    section: Section,
    absolutes: Vec<Symbol>,
}

impl EventObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(&self) -> &Section {
        &self.section
    }

    pub fn absolutes(&self) -> &[Symbol] {
        &self.absolutes
    }

    /// Merge a section at the current end of the combined blob.
    pub fn append_section(&mut self, section: Section) {
        self.section.combine(section);
    }

    /// Merge an ingested object: its sections in order, its absolute
    /// symbols into the absolute table.
    pub fn append_object(&mut self, object: ObjectFile) {
        for section in object.sections {
            self.section.combine(section);
        }

        self.absolutes.extend(object.absolutes);
    }

    pub fn add_absolute(&mut self, symbol: Symbol) {
        self.absolutes.push(symbol);
    }

    pub fn add_absolutes<I: IntoIterator<Item = Symbol>>(&mut self, symbols: I) {
        self.absolutes.extend(symbols);
    }

    fn resolve_pending<F>(&mut self, lookup: F, relative_ok: bool) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<u32>,
    {
        let pending = mem::take(self.section.relocations_mut());
        let mut kept = Vec::with_capacity(pending.len());

        for relocation in pending {
            let handler = Relocatelet::lookup(relocation.code)?;

            match lookup(&relocation.symbol) {
                Some(value) if handler.is_absolute() || relative_ok => {
                    handler.apply(self.section.data_mut(), relocation.offset, value, relocation.addend)?;
                },
                _ => kept.push(relocation),
            }
        }

        *self.section.relocations_mut() = kept;
        Ok(())
    }

    fn symbol_table<F>(&self, filter: F) -> FxHashMap<String, u32>
    where
        F: Fn(&Symbol) -> bool,
    {
        let mut table = FxHashMap::default();

        for symbol in self.section.symbols() {
            if filter(symbol) {
                table.entry(symbol.name.clone()).or_insert(symbol.offset);
            }
        }

        table
    }

    /// Resolve every pending relocation whose symbol is defined inside the
    /// combined blob. Both absolute and relative kinds are eligible here:
    /// reference site and target move together from now on.
    pub fn link_locals(&mut self) -> Result<(), Error> {
        let table = self.symbol_table(|_| true);
        self.resolve_pending(|name| table.get(name).copied(), true)
    }

    /// Resolve pending relocations against compiler-internal labels only.
    pub fn link_temporaries(&mut self) -> Result<(), Error> {
        let table = self.symbol_table(|symbol| is_temporary(&symbol.name));
        self.resolve_pending(|name| table.get(name).copied(), true)
    }

    /// Drop temporary symbols that no pending relocation still references.
    pub fn remove_temporaries(&mut self) {
        let referenced: FxHashSet<String> =
            self.section.relocations().iter().map(|relocation| relocation.symbol.clone()).collect();

        self.section
            .symbols_mut()
            .retain(|symbol| !is_temporary(&symbol.name) || referenced.contains(&symbol.name));
    }

    /// Resolve pending relocations against the absolute symbol table.
    /// Only absolute kinds are eligible: the blob's own final placement is
    /// unknown, so a PC-relative reference to a fixed address cannot be
    /// encoded yet.
    pub fn link_absolutes(&mut self) -> Result<(), Error> {
        let mut table = FxHashMap::default();

        for symbol in &self.absolutes {
            table.entry(symbol.name.clone()).or_insert(symbol.offset);
        }

        self.resolve_pending(|name| table.get(name).copied(), false)
    }

    /// Redirect every pending call-class relocation through a synthesized
    /// veneer appended to the blob, making the call encodable regardless of
    /// where the true target ends up.
    ///
    /// One veneer is shared per distinct `(symbol, addend)` target. The
    /// call site is resolved against the veneer's entry immediately; the
    /// veneer's own literal-slot relocation joins the pending list and is
    /// resolved like any other.
    pub fn make_trampolines(&mut self) -> Result<(), Error> {
        let pending = mem::take(self.section.relocations_mut());
        let mut kept = Vec::with_capacity(pending.len());
        let mut veneers: FxHashMap<(String, i32), u32> = FxHashMap::default();

        for relocation in pending {
            let handler = Relocatelet::lookup(relocation.code)?;

            let Some(veneer) = handler.make_trampoline(&relocation.symbol, relocation.addend) else {
                kept.push(relocation);
                continue;
            };

            let key = (relocation.symbol.clone(), relocation.addend);

            let entry = match veneers.get(&key) {
                Some(entry) => *entry,
                None => {
                    let entry = self.section.size();
                    self.section.combine(veneer);
                    veneers.insert(key, entry);
                    entry
                },
            };

            handler.apply(self.section.data_mut(), relocation.offset, entry, 0)?;
        }

        // the veneers' literal-slot relocations were merged into the
        // section while the pending list was detached
        kept.append(self.section.relocations_mut());
        *self.section.relocations_mut() = kept;

        Ok(())
    }

    /// Drop every symbol that no pending relocation references, except
    /// hooks, which must stay visible to the caller.
    pub fn prune_symbols(&mut self) {
        let referenced: FxHashSet<String> =
            self.section.relocations().iter().map(|relocation| relocation.symbol.clone()).collect();

        self.section
            .symbols_mut()
            .retain(|symbol| referenced.contains(&symbol.name) || parse_hook(symbol).is_some());
    }

    /// Symbols following the hook naming convention, as `(address, name)`
    /// patch points. They are never interpreted further here.
    pub fn hooks(&self) -> Vec<Hook> {
        self.section.symbols().iter().filter_map(parse_hook).collect()
    }

    /// Walk the combined blob and produce the emission records: a symbolic
    /// expression wherever a pending relocation starts, a literal sized by
    /// the active mapping region everywhere else.
    pub fn make_events(&self) -> Result<EventSection, Error> {
        let mut relocations: Vec<&Relocation> = self.section.relocations().iter().collect();
        relocations.sort_by_key(|relocation| relocation.offset);

        let mappings = self.section.mappings();
        let size = self.section.size();

        let mut events = EventSection::new();
        let mut next_relocation = relocations.into_iter().peekable();
        let mut next_mapping = 0;
        let mut kind = MappingKind::Data;
        let mut pos = 0;

        while pos < size {
            while next_mapping < mappings.len() && mappings[next_mapping].offset <= pos {
                kind = mappings[next_mapping].kind;
                next_mapping += 1;
            }

            if let Some(relocation) = next_relocation.next_if(|relocation| relocation.offset <= pos) {
                if relocation.offset < pos {
                    return Err(Error::InvalidElf(format!(
                        "relocation at {:#x} overlaps preceding data",
                        relocation.offset
                    )));
                }

                let handler = Relocatelet::lookup(relocation.code)?;
                let code = handler.event_code(&self.section, pos, &relocation.symbol, relocation.addend)?;

                pos += code.size() as u32;
                events.push(relocation.offset, code);
                continue;
            }

            let code = match kind {
                MappingKind::Data => EventCode::literal(EventKind::Byte, self.section.data().read(pos, 1)?),
                MappingKind::Thumb => EventCode::literal(EventKind::Short, self.section.data().read(pos, 2)?),
                MappingKind::Arm => EventCode::literal(EventKind::Word, self.section.data().read(pos, 4)?),
            };

            pos += code.size() as u32;
            events.push(pos - code.size() as u32, code);
        }

        Ok(events)
    }

    /// Render the emission records as event-script text.
    pub fn write_events<W: Write>(&self, output: &mut W) -> Result<(), Error> {
        self.make_events()?.write_to(output).map_err(|err| Error::Io(err.to_string()))
    }
}

/// Parse an external symbol table: one `ADDRESS NAME` pair per line,
/// address in hex with an optional `0x` prefix. Blank lines are skipped.
pub fn parse_symbol_table(text: &str) -> Result<Vec<Symbol>, Error> {
    let mut seen = FxHashSet::default();
    let mut symbols = Vec::new();

    for (line_number, line) in text.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();

        let (Some(address), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::BadSymbolTable(format!("line {}: expected `ADDRESS NAME`", line_number + 1)));
        };

        let address = u32::from_str_radix(address.trim_start_matches("0x"), 16)
            .map_err(|err| Error::BadSymbolTable(format!("line {}: {}", line_number + 1, err)))?;

        if !seen.insert(name.to_string()) {
            return Err(Error::BadSymbolTable(format!("line {}: duplicate entry for {}", line_number + 1, name)));
        }

        symbols.push(Symbol {
            name: name.to_string(),
            offset: address,
        });
    }

    Ok(symbols)
}

/// Hook patch blocks: reposition to the hooked address and plant a Thumb
/// veneer that jumps into the named symbol.
pub fn write_hook_events<W: Write>(output: &mut W, hooks: &[Hook]) -> Result<(), Error> {
    for hook in hooks {
        let mut veneer = EventObject::new();
        veneer.append_section(crate::reloc::make_thumb_veneer(&hook.name, 0));

        writeln!(output, "PUSH").map_err(|err| Error::Io(err.to_string()))?;
        writeln!(output, "ORG ${:X}", hook.address & !1).map_err(|err| Error::Io(err.to_string()))?;
        veneer.write_events(output)?;
        writeln!(output, "POP").map_err(|err| Error::Io(err.to_string()))?;
    }

    Ok(())
}
