use std::path::Path;

use goblin::elf::{
    header,
    section_header,
    sym,
    Elf,
};
use memmap2::{
    Mmap,
    MmapOptions,
};
use rustc_hash::FxHashMap;

use crate::{
    buffer::ByteBuffer,
    error::Error,
    reloc::{
        section_anchor,
        Relocatelet,
    },
    section::{
        MappingKind,
        Output,
        Relocation,
        Section,
        Symbol,
    },
};

const SHN_ABS: usize = 65521;

/// One decoded input object: its allocatable sections in file order, plus
/// the absolute symbols it defines.
#[derive(Debug, Default)]
pub struct ObjectFile {
    pub sections: Vec<Section>,
    pub absolutes: Vec<Symbol>,
}

fn verify_object(elf: &Elf) -> Result<(), Error> {
    if elf.is_64 || !elf.little_endian {
        return Err(Error::InvalidElf("only 32-bit little-endian objects are supported".to_string()));
    }

    if elf.header.e_type != header::ET_REL {
        return Err(Error::InvalidElf("not a relocatable object file".to_string()));
    }

    if elf.header.e_machine != header::EM_ARM {
        return Err(Error::InvalidElf(format!("unexpected machine type {}", elf.header.e_machine)));
    }

    Ok(())
}

/// ARM mapping symbols mark where code mode changes: `$t` starts Thumb
/// code, `$a` ARM code, `$d` inline data. A `.n` suffix may follow.
fn mapping_symbol_kind(name: &str) -> Option<MappingKind> {
    let base = name.split_once('.').map_or(name, |(base, _)| base);

    match base {
        "$t" => Some(MappingKind::Thumb),
        "$a" => Some(MappingKind::Arm),
        "$d" => Some(MappingKind::Data),
        _ => None,
    }
}

/// Addends arrive in the pipeline-bias-free convention: a plain call site
/// carries addend 0. Explicit ELF addends include the bias, so fold it out.
fn normalize_addend(handler: Relocatelet, addend: i32) -> i32 {
    match handler {
        Relocatelet::ThumbCall => addend.wrapping_add(4),
        Relocatelet::ArmCall | Relocatelet::ArmJump24 => addend.wrapping_add(8),
        _ => addend,
    }
}

/// Decode one relocatable object. `object_index` disambiguates the
/// synthesized section-anchor labels across multiple input objects.
pub fn parse_object(bytes: &[u8], object_index: usize) -> Result<ObjectFile, Error> {
    let elf = Elf::parse(bytes).map_err(|err| Error::InvalidElf(err.to_string()))?;

    verify_object(&elf)?;

    let mut object = ObjectFile::default();
    let mut ingested = FxHashMap::default();

    for (shndx, sh) in elf.section_headers.iter().enumerate() {
        let loadable = sh.sh_type == section_header::SHT_PROGBITS || sh.sh_type == section_header::SHT_NOBITS;
        let alloc = sh.sh_flags & u64::from(section_header::SHF_ALLOC) != 0;

        if !loadable || !alloc {
            continue;
        }

        let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");

        let data = if sh.sh_type == section_header::SHT_NOBITS {
            vec![0; sh.sh_size as usize]
        } else {
            let start = sh.sh_offset as usize;

            start
                .checked_add(sh.sh_size as usize)
                .and_then(|end| bytes.get(start..end))
                .ok_or_else(|| Error::InvalidElf(format!("section {} is truncated", name)))?
                .to_vec()
        };

        let mut section = Section::with_data(name, Output::Rom, ByteBuffer::from(data));

        if sh.sh_flags & u64::from(section_header::SHF_EXECINSTR) == 0 {
            section.set_mapping(0, MappingKind::Data);
        }

        section.add_symbol(section_anchor(object_index, name));
        ingested.insert(shndx, object.sections.len());
        object.sections.push(section);
    }

    for symbol in elf.syms.iter() {
        let name = elf.strtab.get_at(symbol.st_name).unwrap_or("");

        if name.is_empty() {
            continue;
        }

        if symbol.st_shndx == SHN_ABS {
            object.absolutes.push(Symbol {
                name: name.to_string(),
                offset: symbol.st_value as u32,
            });
            continue;
        }

        let Some(&index) = ingested.get(&symbol.st_shndx) else {
            continue;
        };

        if symbol.st_type() == sym::STT_SECTION || symbol.st_type() == sym::STT_FILE {
            continue;
        }

        let section = &mut object.sections[index];

        if let Some(kind) = mapping_symbol_kind(name) {
            section.set_mapping(symbol.st_value as u32, kind);
        } else {
            section.add_symbol(Symbol {
                name: name.to_string(),
                offset: symbol.st_value as u32,
            });
        }
    }

    for (relndx, relocations) in &elf.shdr_relocs {
        let target = elf.section_headers[*relndx].sh_info as usize;

        let Some(&index) = ingested.get(&target) else {
            continue;
        };

        for relocation in relocations.iter() {
            let handler = Relocatelet::lookup(relocation.r_type)?;
            let offset = relocation.r_offset as u32;

            let symbol = elf
                .syms
                .get(relocation.r_sym)
                .ok_or_else(|| Error::InvalidElf(format!("relocation at {:#x} references a bad symbol", offset)))?;

            let name = if symbol.st_type() == sym::STT_SECTION {
                let Some(&anchor) = ingested.get(&symbol.st_shndx) else {
                    return Err(Error::InvalidElf(format!(
                        "relocation at {:#x} targets a non-allocated section",
                        offset
                    )));
                };

                section_anchor(object_index, object.sections[anchor].name()).name
            } else {
                elf.strtab.get_at(symbol.st_name).unwrap_or("").to_string()
            };

            if name.is_empty() {
                return Err(Error::InvalidElf(format!("relocation at {:#x} references a nameless symbol", offset)));
            }

            let addend = match relocation.r_addend {
                Some(addend) => normalize_addend(handler, addend as i32),
                None => handler.read_addend(object.sections[index].data(), offset)?,
            };

            object.sections[index].add_relocation(Relocation {
                symbol: name,
                addend,
                code: relocation.r_type,
                offset,
            });
        }
    }

    Ok(object)
}

/// Map an object file from disk and decode it.
pub fn load_object<P: AsRef<Path>>(path: P, object_index: usize) -> Result<ObjectFile, Error> {
    let path = path.as_ref();
    let map = mmap_file(path).map_err(|err| Error::Io(format!("{}: {}", path.display(), err)))?;

    parse_object(&map, object_index)
}

fn mmap_file(path: &Path) -> std::io::Result<Mmap> {
    let file = std::fs::File::open(path)?;
    let map = unsafe { MmapOptions::new().map(&file) }?;
    Ok(map)
}
