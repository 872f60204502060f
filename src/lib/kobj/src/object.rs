//! ELF relocatable objects.
//!
//! The loader hands us the raw image of a relocatable object. We read `.symtab` and its linked
//! string table with the `elf` crate, run [renamespace] over them, and write the results back:
//! each `st_name` is patched in place, the new string table is appended to the image, and the
//! string table's section header is pointed at it.
use elf::{abi::SHT_SYMTAB, endian::AnyEndian, file::Class, ElfBytes};
use tracing::debug;

use crate::{renamespace, ExemptionSet, KobjError, StringTable, SymbolEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Layout {
    class: Class,
    little: bool,
    /// File offset of the first symbol table entry.
    symtab_off: usize,
    sym_entsize: usize,
    /// File offset of the string table's section header.
    strtab_shdr_off: usize,
}

/// A relocatable object whose symbol and string tables have been read out of its image.
pub struct RelocatableObject {
    image: Vec<u8>,
    layout: Layout,
    symbols: Vec<SymbolEntry>,
    strtab: StringTable,
}

impl core::fmt::Debug for RelocatableObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelocatableObject")
            .field("len", &self.image.len())
            .field("symbols", &self.symbols.len())
            .field("strtab", &self.strtab.len())
            .finish_non_exhaustive()
    }
}

fn usize_of(v: u64) -> Result<usize, KobjError> {
    v.try_into().map_err(|_| KobjError::Unsupported {
        reason: format!("offset {:#x} does not fit in memory", v),
    })
}

/// File offset of entry `idx` in a table at `base`. Header fields are untrusted.
fn entry_offset(base: usize, idx: usize, entsize: usize) -> Result<usize, KobjError> {
    idx.checked_mul(entsize)
        .and_then(|off| off.checked_add(base))
        .ok_or_else(|| KobjError::Unsupported {
            reason: format!("entry {} of table at {:#x} overflows", idx, base),
        })
}

impl RelocatableObject {
    /// Parse an object image, taking ownership of it.
    pub fn parse(image: Vec<u8>) -> Result<Self, KobjError> {
        let (layout, symbols, strtab) = {
            let file = ElfBytes::<AnyEndian>::minimal_parse(&image)?;
            if file.ehdr.e_type != elf::abi::ET_REL {
                return Err(KobjError::Unsupported {
                    reason: format!("not a relocatable object (e_type {})", file.ehdr.e_type),
                });
            }
            let shdrs = file.section_headers().ok_or(KobjError::MissingSection {
                name: "section headers".to_string(),
            })?;
            let symtab_shdr = shdrs
                .iter()
                .find(|s| s.sh_type == SHT_SYMTAB)
                .ok_or(KobjError::MissingSection {
                    name: ".symtab".to_string(),
                })?;
            if symtab_shdr.sh_link == file.ehdr.e_shstrndx as u32 {
                return Err(KobjError::Unsupported {
                    reason: "symbol names share the section name table".to_string(),
                });
            }
            let strtab_shdr = shdrs.get(symtab_shdr.sh_link as usize)?;
            let (strtab_data, _) = file.section_data(&strtab_shdr)?;

            let (symtab, _) = file.symbol_table()?.ok_or(KobjError::MissingSection {
                name: ".symtab".to_string(),
            })?;
            let symbols: Vec<SymbolEntry> = symtab.iter().map(SymbolEntry::from).collect();

            let layout = Layout {
                class: file.ehdr.class,
                little: matches!(file.ehdr.endianness, AnyEndian::Little),
                symtab_off: usize_of(symtab_shdr.sh_offset)?,
                sym_entsize: usize_of(symtab_shdr.sh_entsize)?,
                strtab_shdr_off: entry_offset(
                    usize_of(file.ehdr.e_shoff)?,
                    symtab_shdr.sh_link as usize,
                    file.ehdr.e_shentsize as usize,
                )?,
            };
            (layout, symbols, StringTable::new(strtab_data.to_vec()))
        };

        debug!(
            "parsed relocatable object: {} symbols, {} byte string table",
            symbols.len(),
            strtab.len()
        );
        Ok(Self {
            image,
            layout,
            symbols,
            strtab,
        })
    }

    pub fn symbols(&self) -> &[SymbolEntry] {
        &self.symbols
    }

    pub fn strtab(&self) -> &StringTable {
        &self.strtab
    }

    /// Look up a symbol's current name.
    pub fn symbol_name(&self, sym: &SymbolEntry) -> Result<String, KobjError> {
        self.strtab.get_str(sym.name as usize)
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    /// Move the object's globals into the `prefix` namespace and patch the image to match.
    ///
    /// On error the image, symbols and string table are unchanged.
    pub fn renamespace(
        &mut self,
        prefix: &str,
        exemptions: &ExemptionSet,
    ) -> Result<(), KobjError> {
        let mut symbols = self.symbols.clone();
        let mut strtab = self.strtab.clone();
        renamespace(&mut symbols, &mut strtab, prefix, exemptions)?;

        let new_off = self.image.len();
        let size = new_off
            .checked_add(strtab.len())
            .ok_or(KobjError::Allocation { size: usize::MAX })?;
        let mut image = Vec::new();
        image
            .try_reserve_exact(size)
            .map_err(|_| KobjError::Allocation { size })?;
        image.extend_from_slice(&self.image);

        for (idx, sym) in symbols.iter().enumerate() {
            let at = entry_offset(self.layout.symtab_off, idx, self.layout.sym_entsize)?;
            self.put_u32(&mut image, at, sym.name)?;
        }
        image.extend_from_slice(strtab.as_bytes());

        let shdr = self.layout.strtab_shdr_off;
        match self.layout.class {
            Class::ELF64 => {
                self.put_u64(&mut image, entry_offset(shdr, 3, 8)?, new_off as u64)?;
                self.put_u64(&mut image, entry_offset(shdr, 4, 8)?, strtab.len() as u64)?;
            }
            Class::ELF32 => {
                let narrow = |v: usize| {
                    u32::try_from(v).map_err(|_| KobjError::TableTooLarge { len: v })
                };
                self.put_u32(&mut image, entry_offset(shdr, 4, 4)?, narrow(new_off)?)?;
                self.put_u32(&mut image, entry_offset(shdr, 5, 4)?, narrow(strtab.len())?)?;
            }
        }

        self.image = image;
        self.symbols = symbols;
        self.strtab = strtab;
        Ok(())
    }

    fn put_u32(&self, image: &mut [u8], at: usize, v: u32) -> Result<(), KobjError> {
        let bytes = if self.layout.little {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        };
        Self::put(image, at, &bytes)
    }

    fn put_u64(&self, image: &mut [u8], at: usize, v: u64) -> Result<(), KobjError> {
        let bytes = if self.layout.little {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        };
        Self::put(image, at, &bytes)
    }

    fn put(image: &mut [u8], at: usize, bytes: &[u8]) -> Result<(), KobjError> {
        let len = image.len();
        at.checked_add(bytes.len())
            .and_then(|end| image.get_mut(at..end))
            .ok_or(KobjError::BadStringOffset { offset: at, len })?
            .copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ::object::{
        write::{Object, SectionId, StandardSection, Symbol, SymbolSection},
        Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope,
    };
    use elf::{endian::AnyEndian, ElfBytes};

    use super::*;

    fn build(arch: Architecture, endian: Endianness) -> Vec<u8> {
        let mut obj = Object::new(BinaryFormat::Elf, arch, endian);
        let text = obj.section_id(StandardSection::Text);
        let data = obj.section_id(StandardSection::Data);
        let f = obj.append_section_data(text, &[0xc3; 4], 4);
        let d = obj.append_section_data(data, &[0; 8], 8);
        let mut add = |name: &str, scope: SymbolScope, section: SectionId, value: u64| {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value,
                size: 4,
                kind: SymbolKind::Text,
                scope,
                weak: false,
                section: SymbolSection::Section(section),
                flags: SymbolFlags::None,
            });
        };
        add("vfs_init", SymbolScope::Dynamic, text, f);
        add("helper", SymbolScope::Compilation, text, f);
        add("rumpuser_malloc", SymbolScope::Dynamic, text, f);
        add("rootvnode", SymbolScope::Dynamic, data, d);
        obj.write().unwrap()
    }

    fn reread(image: &[u8]) -> Vec<String> {
        let file = ElfBytes::<AnyEndian>::minimal_parse(image).unwrap();
        let (symtab, strtab) = file.symbol_table().unwrap().unwrap();
        symtab
            .iter()
            .filter(|s| s.st_name != 0)
            .map(|s| strtab.get(s.st_name as usize).unwrap().to_string())
            .collect()
    }

    fn check(arch: Architecture, endian: Endianness) {
        let image = build(arch, endian);
        let mut obj = RelocatableObject::parse(image).unwrap();
        let exempt = ExemptionSet::from_list("rumpuser_");
        obj.renamespace("rumpns_", &exempt).unwrap();

        let names = reread(obj.image());
        assert!(names.contains(&"rumpns_vfs_init".to_string()));
        assert!(names.contains(&"rumpns_rootvnode".to_string()));
        assert!(names.contains(&"helper".to_string()));
        assert!(names.contains(&"rumpuser_malloc".to_string()));
        assert!(!names.contains(&"vfs_init".to_string()));

        for sym in obj.symbols().iter().filter(|s| s.name != 0) {
            let name = obj.symbol_name(sym).unwrap();
            if sym.is_global() && name != "rumpuser_malloc" {
                assert!(name.starts_with("rumpns_"), "{} was not renamed", name);
            } else {
                assert!(!name.starts_with("rumpns_"), "{} should keep its name", name);
            }
        }
    }

    #[test]
    fn elf64_little() {
        check(Architecture::X86_64, Endianness::Little);
    }

    #[test]
    fn elf32_little() {
        check(Architecture::I386, Endianness::Little);
    }

    #[test]
    fn elf64_big() {
        check(Architecture::PowerPc64, Endianness::Big);
    }

    #[test]
    fn offsets_from_hostile_headers() {
        assert_eq!(entry_offset(0x40, 3, 24).unwrap(), 0x40 + 72);
        assert!(matches!(
            entry_offset(usize::MAX - 8, 1, 16),
            Err(KobjError::Unsupported { .. })
        ));
        assert!(matches!(
            entry_offset(0, usize::MAX, 2),
            Err(KobjError::Unsupported { .. })
        ));

        let mut image = vec![0u8; 16];
        assert!(matches!(
            RelocatableObject::put(&mut image, usize::MAX - 1, &[1; 4]),
            Err(KobjError::BadStringOffset { .. })
        ));
        RelocatableObject::put(&mut image, 12, &[1; 4]).unwrap();
        assert_eq!(&image[12..], &[1; 4]);
    }

    #[test]
    fn rejects_non_relocatable() {
        let mut image = build(Architecture::X86_64, Endianness::Little);
        // e_type lives at offset 16; ET_EXEC is 2.
        image[16] = 2;
        image[17] = 0;
        assert!(matches!(
            RelocatableObject::parse(image),
            Err(KobjError::Unsupported { .. })
        ));
    }
}
