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

use std::path::Path;

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use memoffset::offset_of;

use super::*;

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    pub fn st_type(&self) -> u8 {
        elf_st_type(self.info)
    }

    pub fn st_bind(&self) -> u8 {
        elf_st_bind(self.info)
    }

    pub fn is_defined(&self) -> bool {
        self.shndx != SHN_UNDEF && self.shndx < SHN_LORESERVE
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.value && offset < self.value + self.size
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rela {
    pub offset: u64,
    pub info: u64,
    pub addend: i64,
}

impl Rela {
    pub fn sym_index(&self) -> usize {
        elf_r_sym(self.info)
    }

    pub fn r_type(&self) -> u32 {
        elf_r_type(self.info)
    }
}

/// Read-only view of a relocatable object or kernel module.
#[derive(Debug)]
pub struct Elf {
    mmap: Mmap,
    endian: Endian,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl Elf {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = deku_common::fs::open_file(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if !check_magic(&mmap) {
            bail!("\"{}\" is not an elf file", path.as_ref().display());
        }
        let endian = check_header(&mmap)?;

        let e_shoff = read_at::<u64>(&mmap, endian, offset_of!(Header64, e_shoff)) as usize;
        let e_shnum = read_at::<u16>(&mmap, endian, offset_of!(Header64, e_shnum)) as usize;
        let e_shentsize = read_at::<u16>(&mmap, endian, offset_of!(Header64, e_shentsize)) as usize;
        let e_shstrndx = read_at::<u16>(&mmap, endian, offset_of!(Header64, e_shstrndx)) as usize;

        let mut sections = Vec::with_capacity(e_shnum);
        for i in 0..e_shnum {
            let at = e_shoff + i * e_shentsize;
            sections.push(Section {
                name: String::new(),
                sh_type: read_at(&mmap, endian, at + offset_of!(SectionHeader64, sh_type)),
                sh_flags: read_at(&mmap, endian, at + offset_of!(SectionHeader64, sh_flags)),
                sh_offset: read_at(&mmap, endian, at + offset_of!(SectionHeader64, sh_offset)),
                sh_size: read_at(&mmap, endian, at + offset_of!(SectionHeader64, sh_size)),
                sh_link: read_at(&mmap, endian, at + offset_of!(SectionHeader64, sh_link)),
                sh_info: read_at(&mmap, endian, at + offset_of!(SectionHeader64, sh_info)),
                sh_addralign: read_at(
                    &mmap,
                    endian,
                    at + offset_of!(SectionHeader64, sh_addralign),
                ),
                sh_entsize: read_at(&mmap, endian, at + offset_of!(SectionHeader64, sh_entsize)),
            });
        }

        // Resolve section names from .shstrtab
        let name_offsets = (0..e_shnum)
            .map(|i| {
                read_at::<u32>(
                    &mmap,
                    endian,
                    e_shoff + i * e_shentsize + offset_of!(SectionHeader64, sh_name),
                ) as usize
            })
            .collect::<Vec<_>>();
        let shstrtab = sections
            .get(e_shstrndx)
            .map(|s| (s.sh_offset as usize, s.sh_size as usize))
            .context("Missing section name table")?;
        for (section, name_offset) in sections.iter_mut().zip(name_offsets) {
            section.name = read_str(&mmap[shstrtab.0..shstrtab.0 + shstrtab.1], name_offset);
        }

        let symtab_index = sections
            .iter()
            .position(|s| s.sh_type == SHT_SYMTAB)
            .context("Cannot find symtab")?;
        let symtab = sections[symtab_index].clone();
        let strtab = sections
            .get(symtab.sh_link as usize)
            .map(|s| (s.sh_offset as usize, s.sh_size as usize))
            .context("Cannot find strtab")?;

        let entsize = std::mem::size_of::<SymbolHeader64>();
        let num = symtab.sh_size as usize / entsize;
        let mut symbols = Vec::with_capacity(num);
        for i in 0..num {
            let at = symtab.sh_offset as usize + i * entsize;
            let name_offset =
                read_at::<u32>(&mmap, endian, at + offset_of!(SymbolHeader64, st_name)) as usize;
            symbols.push(Symbol {
                name: read_str(&mmap[strtab.0..strtab.0 + strtab.1], name_offset),
                info: read_at(&mmap, endian, at + offset_of!(SymbolHeader64, st_info)),
                other: read_at(&mmap, endian, at + offset_of!(SymbolHeader64, st_other)),
                shndx: read_at(&mmap, endian, at + offset_of!(SymbolHeader64, st_shndx)),
                value: read_at(&mmap, endian, at + offset_of!(SymbolHeader64, st_value)),
                size: read_at(&mmap, endian, at + offset_of!(SymbolHeader64, st_size)),
            });
        }

        Ok(Self {
            mmap,
            endian,
            sections,
            symbols,
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn section(&self, index: usize) -> Result<&Section> {
        self.sections
            .get(index)
            .with_context(|| format!("Section index {} is out of range", index))
    }

    pub fn section_name(&self, index: usize) -> &str {
        self.sections
            .get(index)
            .map(|s| s.name.as_str())
            .unwrap_or_default()
    }

    pub fn section_by_name(&self, name: &str) -> Option<(usize, &Section)> {
        self.sections
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
    }

    pub fn section_data(&self, index: usize) -> Result<&[u8]> {
        let section = self.section(index)?;
        if section.sh_type == SHT_NOBITS {
            return Ok(&[]);
        }
        let start = section.sh_offset as usize;
        let end = start + section.sh_size as usize;
        self.mmap
            .get(start..end)
            .with_context(|| format!("Section \"{}\" data is out of range", section.name))
    }

    pub fn symbol_by_name(&self, name: &str) -> Option<(usize, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .find(|(_, sym)| sym.name == name)
    }

    /// Entries of the relocation section at `index`.
    pub fn relocations(&self, index: usize) -> Result<Vec<Rela>> {
        let section = self.section(index)?;
        let entsize = std::mem::size_of::<Rela64>();
        let num = section.sh_size as usize / entsize;
        let mut relas = Vec::with_capacity(num);
        for i in 0..num {
            let at = section.sh_offset as usize + i * entsize;
            relas.push(Rela {
                offset: read_at(&self.mmap, self.endian, at + offset_of!(Rela64, r_offset)),
                info: read_at(&self.mmap, self.endian, at + offset_of!(Rela64, r_info)),
                addend: read_at(&self.mmap, self.endian, at + offset_of!(Rela64, r_addend)),
            });
        }
        Ok(relas)
    }

    /// The relocation section applying to section `index`, if any.
    pub fn rela_section_for(&self, index: usize) -> Option<usize> {
        self.sections
            .iter()
            .position(|s| s.sh_type == SHT_RELA && s.sh_info as usize == index)
    }

    pub fn relocations_for(&self, index: usize) -> Result<Vec<Rela>> {
        match self.rela_section_for(index) {
            Some(rela_index) => self.relocations(rela_index),
            None => Ok(Vec::new()),
        }
    }

    /// Relocations applying to the body of `sym`.
    pub fn relocations_in_range(&self, sym: &Symbol) -> Result<Vec<Rela>> {
        let relas = self.relocations_for(sym.shndx as usize)?;
        Ok(relas
            .into_iter()
            .filter(|rela| sym.contains(rela.offset))
            .collect())
    }

    /// Named unresolved FUNC/OBJECT/NOTYPE symbols (section index 0).
    pub fn undefined_symbols(&self) -> Vec<&Symbol> {
        self.symbols
            .iter()
            .filter(|sym| {
                sym.shndx == SHN_UNDEF
                    && !sym.name.is_empty()
                    && matches!(sym.st_type(), STT_OBJECT | STT_FUNC | STT_NOTYPE)
            })
            .collect()
    }

    /// Names of all defined FUNC and OBJECT symbols, the content of one
    /// symbol-index cache entry.
    pub fn defined_symbol_names(&self) -> Vec<String> {
        self.symbols
            .iter()
            .filter(|sym| {
                sym.is_defined()
                    && !sym.name.is_empty()
                    && matches!(sym.st_type(), STT_FUNC | STT_OBJECT)
            })
            .map(|sym| sym.name.clone())
            .collect()
    }
}

fn read_at<T: ReadInteger<T>>(data: &[u8], endian: Endian, at: usize) -> T {
    endian.read_integer::<T>(&data[at..at + std::mem::size_of::<T>()])
}

fn read_str(strtab: &[u8], offset: usize) -> String {
    let mut end = offset;
    while end < strtab.len() && strtab[end] != 0 {
        end += 1;
    }
    String::from_utf8_lossy(&strtab[offset..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::tests::build_test_object;

    #[test]
    fn test_parse_synthetic_object() {
        let path = std::env::temp_dir().join("deku-elf-read.o");
        deku_common::fs::write(&path, build_test_object()).unwrap();

        let elf = Elf::parse(&path).unwrap();

        let (_, foo) = elf.symbol_by_name("foo").expect("Missing symbol foo");
        assert_eq!(foo.st_type(), STT_FUNC);
        assert_eq!(foo.size, 16);

        let (_, helper) = elf.symbol_by_name("helper").expect("Missing symbol helper");
        assert_eq!(helper.st_bind(), STB_LOCAL);

        let text = elf
            .section_by_name(".text")
            .map(|(index, _)| index)
            .expect("Missing .text");
        let relas = elf.relocations_for(text).unwrap();
        assert!(!relas.is_empty());

        let fentry = elf
            .symbol_by_name("__fentry__")
            .map(|(index, _)| index)
            .expect("Missing __fentry__");
        assert!(relas.iter().any(|rela| rela.sym_index() == fentry));

        let undefined = elf.undefined_symbols();
        assert!(undefined.iter().any(|sym| sym.name == "__fentry__"));
    }
}
