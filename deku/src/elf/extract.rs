// SPDX-License-Identifier: Mulan PSL v2
/*
 * Copyright (c) 2024 Huawei Technologies Co., Ltd.
 * deku is licensed under Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *         http://license.coscl.org.cn/MulanPSL2
 *
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
 * EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
 * MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexSet;
use object::write::{self, SymbolSection};
use object::{
    Architecture, BinaryFormat, RelocationEncoding, RelocationKind, SectionKind, SymbolFlags,
    SymbolKind, SymbolScope,
};

use deku_common::fs;

use super::read::{Elf, Symbol};
use super::*;

const BUG_TABLE_SECTION: &str = "__bug_table";

/// Rewrites `src` into a minimal relocatable object at `out` holding only
/// the named symbols. Sections of the extracted symbols are carried whole;
/// every other function or variable the extracted code references is turned
/// into an unresolved external, to be bound again at module link time.
pub fn extract_symbols<P, Q>(src: P, out: Q, names: &IndexSet<String>) -> Result<()>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let elf = Elf::parse(&src)?;
    let mut writer = Extractor::new(&elf);

    let mut extracted = Vec::new();
    for name in names {
        let (index, symbol) = elf
            .symbol_by_name(name)
            .with_context(|| format!("Can't find symbol \"{}\"", name))?;
        writer.copy_symbol_with_section(index, symbol)?;
        extracted.push(symbol);
    }
    for symbol in extracted {
        writer.copy_relocations(symbol.shndx as usize, Some(symbol))?;
    }

    // BUG() entries refer back to the extracted code
    if let Some((index, _)) = elf.section_by_name(BUG_TABLE_SECTION) {
        writer.copy_section(index)?;
        writer.copy_relocations(index, None)?;
    }

    let contents = writer.finish().context("Failed to serialize patch object")?;
    fs::write(out, contents)?;
    Ok(())
}

struct Extractor<'a> {
    elf: &'a Elf,
    object: write::Object<'static>,
    copied_sections: HashMap<usize, write::SectionId>,
    copied_symbols: HashMap<usize, write::SymbolId>,
}

impl<'a> Extractor<'a> {
    fn new(elf: &'a Elf) -> Self {
        Self {
            elf,
            object: write::Object::new(
                BinaryFormat::Elf,
                Architecture::X86_64,
                object::Endianness::Little,
            ),
            copied_sections: HashMap::new(),
            copied_symbols: HashMap::new(),
        }
    }

    fn copy_section(&mut self, index: usize) -> Result<write::SectionId> {
        if let Some(section_id) = self.copied_sections.get(&index) {
            return Ok(*section_id);
        }

        let section = self.elf.section(index)?;
        let kind = if section.sh_type == SHT_NOBITS {
            SectionKind::UninitializedData
        } else if section.sh_flags & SHF_EXECINSTR != 0 {
            SectionKind::Text
        } else if section.name.starts_with(".rodata") {
            SectionKind::ReadOnlyData
        } else {
            SectionKind::Data
        };

        let section_id = self
            .object
            .add_section(Vec::new(), section.name.clone().into_bytes(), kind);
        let align = section.sh_addralign.max(1);
        if section.sh_type == SHT_NOBITS {
            self.object
                .section_mut(section_id)
                .append_bss(section.sh_size, align);
        } else {
            let data = self.elf.section_data(index)?.to_vec();
            self.object.section_mut(section_id).set_data(data, align);
        }

        self.copied_sections.insert(index, section_id);
        Ok(section_id)
    }

    fn copy_symbol_with_section(&mut self, index: usize, symbol: &Symbol) -> Result<()> {
        let section_id = self.copy_section(symbol.shndx as usize)?;

        // Partitioned symbols ("foo.cold") cannot survive as C identifiers
        // in the generated glue, so the copy drops the dots.
        let name = match symbol.st_type() {
            STT_FUNC => symbol.name.replace('.', "_"),
            _ => symbol.name.clone(),
        };

        let symbol_id = self.object.add_symbol(write::Symbol {
            name: name.into_bytes(),
            value: symbol.value,
            size: symbol.size,
            kind: symbol_kind(symbol.st_type()),
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(section_id),
            flags: SymbolFlags::None,
        });
        self.copied_symbols.insert(index, symbol_id);
        Ok(())
    }

    fn external_symbol(&mut self, index: usize, symbol: &Symbol) -> write::SymbolId {
        let symbol_id = self.object.add_symbol(write::Symbol {
            name: symbol.name.clone().into_bytes(),
            value: 0,
            size: 0,
            kind: symbol_kind(symbol.st_type()),
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.copied_symbols.insert(index, symbol_id);
        symbol_id
    }

    fn target_symbol(&mut self, index: usize) -> Result<write::SymbolId> {
        if let Some(symbol_id) = self.copied_symbols.get(&index) {
            return Ok(*symbol_id);
        }

        let symbol = &self.elf.symbols()[index];
        if symbol.st_type() == STT_SECTION || symbol.name.is_empty() {
            // Anonymous data (string literals, jump tables) travels with the
            // patch; the whole backing section is carried over.
            let section_id = self.copy_section(symbol.shndx as usize)?;
            return Ok(self.object.section_symbol(section_id));
        }

        Ok(self.external_symbol(index, symbol))
    }

    fn copy_relocations(&mut self, section_index: usize, range: Option<&Symbol>) -> Result<()> {
        let section_id = match self.copied_sections.get(&section_index) {
            Some(section_id) => *section_id,
            None => return Ok(()),
        };

        for rela in self.elf.relocations_for(section_index)? {
            if let Some(symbol) = range {
                if !symbol.contains(rela.offset) {
                    continue;
                }
            }
            let target = self.target_symbol(rela.sym_index())?;
            self.object
                .add_relocation(
                    section_id,
                    write::Relocation {
                        offset: rela.offset,
                        size: 0,
                        kind: RelocationKind::Elf(rela.r_type()),
                        encoding: RelocationEncoding::Generic,
                        symbol: target,
                        addend: rela.addend,
                    },
                )
                .context("Failed to copy relocation")?;
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>> {
        Ok(self.object.write()?)
    }
}

fn symbol_kind(st_type: u8) -> SymbolKind {
    match st_type {
        STT_FUNC => SymbolKind::Text,
        STT_OBJECT => SymbolKind::Data,
        _ => SymbolKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::tests::ObjectBuilder;

    #[test]
    fn test_extract_keeps_only_requested_symbols() {
        let dir = std::env::temp_dir();
        let src = dir.join("deku-extract-src.o");
        let out = dir.join("deku-extract-patch.o");

        let mut builder = ObjectBuilder::new();
        builder.add_function("changed", false, &[0x90; 24], true);
        builder.add_function("untouched", false, &[0x90; 8], true);
        builder.add_call("changed", "external_fn", 8);
        deku_common::fs::write(&src, builder.build()).unwrap();

        let names = IndexSet::from(["changed".to_string()]);
        extract_symbols(&src, &out, &names).unwrap();

        let patch = Elf::parse(&out).unwrap();
        let (_, changed) = patch.symbol_by_name("changed").expect("Missing symbol");
        assert_eq!(changed.st_bind(), STB_GLOBAL);
        assert_eq!(changed.size, 24);

        // The callee is only a reference now
        let (_, external) = patch
            .symbol_by_name("external_fn")
            .expect("Missing external");
        assert_eq!(external.shndx, SHN_UNDEF);
    }

    #[test]
    fn test_extract_sanitizes_partitioned_functions() {
        let dir = std::env::temp_dir();
        let src = dir.join("deku-extract-cold.o");
        let out = dir.join("deku-extract-cold-patch.o");

        let mut builder = ObjectBuilder::new();
        builder.add_function("frobnicate.cold", false, &[0x90; 8], false);
        deku_common::fs::write(&src, builder.build()).unwrap();

        let names = IndexSet::from(["frobnicate.cold".to_string()]);
        extract_symbols(&src, &out, &names).unwrap();

        let patch = Elf::parse(&out).unwrap();
        assert!(patch.symbol_by_name("frobnicate_cold").is_some());
        assert!(patch.symbol_by_name("frobnicate.cold").is_none());
    }
}
