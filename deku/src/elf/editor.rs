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

use anyhow::{bail, ensure, Context, Result};
use memoffset::offset_of;

use deku_common::fs;

use super::*;

/// One relocation entry owned by the editor.
#[derive(Debug, Clone, Copy)]
pub struct EditRela {
    pub offset: u64,
    pub sym: usize,
    pub r_type: u32,
    pub addend: i64,
}

#[derive(Debug)]
pub struct EditSection {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
    data: Vec<u8>,
    /// Occupied size of a section without file contents.
    nobits_size: u64,
    /// Parsed entries of a SHT_RELA section; `data` stays empty for those.
    relas: Vec<EditRela>,
}

#[derive(Debug)]
pub struct EditSymbol {
    pub name: String,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
    name_offset: u32,
    removed: bool,
}

/// A kernel module loaded whole into memory for restructuring. Unlike the
/// read-only view this owns every section, so symbols can be renamed,
/// relocation records moved between sections and new sections appended;
/// `save` lays the file out from scratch.
#[derive(Debug)]
pub struct ModuleEditor {
    endian: Endian,
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_flags: u32,
    sections: Vec<EditSection>,
    symbols: Vec<EditSymbol>,
    symtab_index: usize,
    strtab_index: usize,
    shstrndx: usize,
}

impl ModuleEditor {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(&path)?;
        ensure!(
            check_magic(&data),
            "\"{}\" is not an elf file",
            path.as_ref().display()
        );
        let endian = check_header(&data)?;

        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&data[..16]);
        let e_type = read_at::<u16>(&data, endian, offset_of!(Header64, e_type));
        let e_machine = read_at::<u16>(&data, endian, offset_of!(Header64, e_machine));
        let e_flags = read_at::<u32>(&data, endian, offset_of!(Header64, e_flags));
        let e_shoff = read_at::<u64>(&data, endian, offset_of!(Header64, e_shoff)) as usize;
        let e_shnum = read_at::<u16>(&data, endian, offset_of!(Header64, e_shnum)) as usize;
        let e_shentsize = read_at::<u16>(&data, endian, offset_of!(Header64, e_shentsize)) as usize;
        let shstrndx = read_at::<u16>(&data, endian, offset_of!(Header64, e_shstrndx)) as usize;

        let mut raw = Vec::with_capacity(e_shnum);
        for i in 0..e_shnum {
            let at = e_shoff + i * e_shentsize;
            let sh_name = read_at::<u32>(&data, endian, at + offset_of!(SectionHeader64, sh_name));
            let sh_offset =
                read_at::<u64>(&data, endian, at + offset_of!(SectionHeader64, sh_offset)) as usize;
            let sh_size =
                read_at::<u64>(&data, endian, at + offset_of!(SectionHeader64, sh_size)) as usize;
            let section = EditSection {
                name: String::new(),
                sh_type: read_at(&data, endian, at + offset_of!(SectionHeader64, sh_type)),
                sh_flags: read_at(&data, endian, at + offset_of!(SectionHeader64, sh_flags)),
                sh_addr: read_at(&data, endian, at + offset_of!(SectionHeader64, sh_addr)),
                sh_link: read_at(&data, endian, at + offset_of!(SectionHeader64, sh_link)),
                sh_info: read_at(&data, endian, at + offset_of!(SectionHeader64, sh_info)),
                sh_addralign: read_at(&data, endian, at + offset_of!(SectionHeader64, sh_addralign)),
                sh_entsize: read_at(&data, endian, at + offset_of!(SectionHeader64, sh_entsize)),
                data: Vec::new(),
                nobits_size: 0,
                relas: Vec::new(),
            };
            raw.push((sh_name, sh_offset, sh_size, section));
        }

        let shstrtab = raw
            .get(shstrndx)
            .map(|(_, sh_offset, sh_size, _)| data[*sh_offset..sh_offset + sh_size].to_vec())
            .context("Missing section name table")?;

        let mut sections = Vec::with_capacity(e_shnum);
        for (sh_name, sh_offset, sh_size, mut section) in raw {
            section.name = read_str(&shstrtab, sh_name as usize);
            match section.sh_type {
                SHT_NOBITS => section.nobits_size = sh_size as u64,
                SHT_RELA => {
                    let entsize = std::mem::size_of::<Rela64>();
                    for i in 0..sh_size / entsize {
                        let at = sh_offset + i * entsize;
                        let info = read_at::<u64>(&data, endian, at + offset_of!(Rela64, r_info));
                        section.relas.push(EditRela {
                            offset: read_at(&data, endian, at + offset_of!(Rela64, r_offset)),
                            sym: elf_r_sym(info),
                            r_type: elf_r_type(info),
                            addend: read_at(&data, endian, at + offset_of!(Rela64, r_addend)),
                        });
                    }
                }
                _ => section.data = data[sh_offset..sh_offset + sh_size].to_vec(),
            }
            sections.push(section);
        }

        let symtab_index = sections
            .iter()
            .position(|s| s.sh_type == SHT_SYMTAB)
            .context("Cannot find symtab")?;
        let strtab_index = sections[symtab_index].sh_link as usize;
        ensure!(strtab_index < sections.len(), "Invalid strtab link");
        ensure!(
            strtab_index != shstrndx,
            "Module shares .strtab with .shstrtab"
        );

        let entsize = std::mem::size_of::<SymbolHeader64>();
        let symtab_data = std::mem::take(&mut sections[symtab_index].data);
        let strtab = &sections[strtab_index].data;
        let mut symbols = Vec::with_capacity(symtab_data.len() / entsize);
        for i in 0..symtab_data.len() / entsize {
            let at = i * entsize;
            let name_offset =
                read_at::<u32>(&symtab_data, endian, at + offset_of!(SymbolHeader64, st_name));
            symbols.push(EditSymbol {
                name: read_str(strtab, name_offset as usize),
                name_offset,
                info: read_at(&symtab_data, endian, at + offset_of!(SymbolHeader64, st_info)),
                other: read_at(&symtab_data, endian, at + offset_of!(SymbolHeader64, st_other)),
                shndx: read_at(&symtab_data, endian, at + offset_of!(SymbolHeader64, st_shndx)),
                value: read_at(&symtab_data, endian, at + offset_of!(SymbolHeader64, st_value)),
                size: read_at(&symtab_data, endian, at + offset_of!(SymbolHeader64, st_size)),
                removed: false,
            });
        }

        Ok(Self {
            endian,
            e_ident,
            e_type,
            e_machine,
            e_flags,
            sections,
            symbols,
            symtab_index,
            strtab_index,
            shstrndx,
        })
    }

    pub fn symbol_index(&self, name: &str) -> Option<usize> {
        self.symbols
            .iter()
            .position(|sym| !sym.removed && sym.name == name)
    }

    pub fn section_name(&self, index: usize) -> &str {
        self.sections
            .get(index)
            .map(|s| s.name.as_str())
            .unwrap_or_default()
    }

    fn append_strtab(&mut self, text: &str) -> u32 {
        let strtab = &mut self.sections[self.strtab_index].data;
        let offset = strtab.len() as u32;
        strtab.extend_from_slice(text.as_bytes());
        strtab.push(0);
        offset
    }

    pub fn rename_symbol(&mut self, index: usize, new_name: &str) -> Result<()> {
        ensure!(index < self.symbols.len(), "Invalid symbol index");
        let name_offset = self.append_strtab(new_name);
        let symbol = &mut self.symbols[index];
        symbol.name = new_name.to_string();
        symbol.name_offset = name_offset;
        Ok(())
    }

    pub fn set_symbol_shndx(&mut self, index: usize, shndx: u16) -> Result<()> {
        ensure!(index < self.symbols.len(), "Invalid symbol index");
        self.symbols[index].shndx = shndx;
        Ok(())
    }

    /// Points every relocation record referencing `from` at `to` instead.
    pub fn retarget_relocations(&mut self, from: usize, to: usize) -> usize {
        let mut replaced = 0;
        for section in &mut self.sections {
            for rela in &mut section.relas {
                if rela.sym == from {
                    rela.sym = to;
                    replaced += 1;
                }
            }
        }
        replaced
    }

    /// Drops the symbol from the table; its relocations must have been
    /// retargeted beforehand. Indices are renumbered on save.
    pub fn strip_symbol(&mut self, index: usize) -> Result<()> {
        ensure!(index < self.symbols.len(), "Invalid symbol index");
        self.symbols[index].removed = true;
        Ok(())
    }

    /// Removes every relocation record referencing `sym` from the eligible
    /// relocation sections, returning them grouped by origin section.
    pub fn take_relocations_of(&mut self, sym: usize) -> Vec<(usize, Vec<EditRela>)> {
        const KEEP_SECTIONS: [&str; 2] = [".rela.debug_info", ".rela__jump_table"];

        let mut taken = Vec::new();
        for (index, section) in self.sections.iter_mut().enumerate() {
            if section.sh_type != SHT_RELA || KEEP_SECTIONS.contains(&section.name.as_str()) {
                continue;
            }
            let moved = section
                .relas
                .iter()
                .copied()
                .filter(|rela| rela.sym == sym)
                .collect::<Vec<_>>();
            if moved.is_empty() {
                continue;
            }
            section.relas.retain(|rela| rela.sym != sym);
            taken.push((index, moved));
        }
        taken
    }

    pub fn add_section(
        &mut self,
        name: &str,
        data: Vec<u8>,
        sh_type: u32,
        sh_flags: u64,
        sh_addralign: u64,
    ) -> usize {
        self.sections.push(EditSection {
            name: name.to_string(),
            sh_type,
            sh_flags,
            sh_addr: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign,
            sh_entsize: 0,
            data,
            nobits_size: 0,
            relas: Vec::new(),
        });
        self.sections.len() - 1
    }

    /// New relocation section shaped after `template` (a SHT_RELA section),
    /// carrying `entries` and the livepatch flags.
    pub fn add_klp_rela_section(
        &mut self,
        name: &str,
        template: usize,
        entries: Vec<EditRela>,
    ) -> Result<usize> {
        let (sh_link, sh_info, sh_addralign, sh_entsize) = {
            let section = self
                .sections
                .get(template)
                .context("Invalid relocation section index")?;
            ensure!(
                section.sh_type == SHT_RELA,
                "Section \"{}\" is not a relocation section",
                section.name
            );
            (
                section.sh_link,
                section.sh_info,
                section.sh_addralign,
                section.sh_entsize,
            )
        };

        let index = self.add_section(name, Vec::new(), SHT_RELA, SHF_ALLOC | SHF_RELA_LIVEPATCH, sh_addralign);
        let section = &mut self.sections[index];
        section.sh_link = sh_link;
        section.sh_info = sh_info;
        section.sh_entsize = sh_entsize;
        section.relas = entries;
        Ok(index)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let ehsize = std::mem::size_of::<Header64>();
        let shentsize = std::mem::size_of::<SectionHeader64>();
        let sym_entsize = std::mem::size_of::<SymbolHeader64>();
        let rela_entsize = std::mem::size_of::<Rela64>();

        // Renumber symbols around stripped entries
        let mut remap = vec![0usize; self.symbols.len()];
        let mut kept = 0;
        for (index, symbol) in self.symbols.iter().enumerate() {
            remap[index] = kept;
            if !symbol.removed {
                kept += 1;
            }
        }

        let mut symtab_data = Vec::with_capacity(kept * sym_entsize);
        let mut local_count = 0;
        for symbol in self.symbols.iter().filter(|sym| !sym.removed) {
            if elf_st_bind(symbol.info) == STB_LOCAL && symtab_data.len() / sym_entsize == local_count
            {
                local_count += 1;
            }
            symtab_data.extend(self.endian.write_integer::<u32>(symbol.name_offset));
            symtab_data.extend(self.endian.write_integer::<u8>(symbol.info));
            symtab_data.extend(self.endian.write_integer::<u8>(symbol.other));
            symtab_data.extend(self.endian.write_integer::<u16>(symbol.shndx));
            symtab_data.extend(self.endian.write_integer::<u64>(symbol.value));
            symtab_data.extend(self.endian.write_integer::<u64>(symbol.size));
        }

        let section_bytes = |index: usize, section: &EditSection| -> Result<Vec<u8>> {
            match section.sh_type {
                SHT_SYMTAB if index == self.symtab_index => Ok(symtab_data.clone()),
                SHT_RELA => {
                    let mut bytes = Vec::with_capacity(section.relas.len() * rela_entsize);
                    for rela in &section.relas {
                        let sym = remap
                            .get(rela.sym)
                            .copied()
                            .context("Relocation references an unknown symbol")?;
                        if self.symbols.get(rela.sym).map(|s| s.removed) == Some(true) {
                            bail!(
                                "Relocation in \"{}\" still references a stripped symbol",
                                section.name
                            );
                        }
                        bytes.extend(self.endian.write_integer::<u64>(rela.offset));
                        bytes.extend(self.endian.write_integer::<u64>(elf_r_info(sym, rela.r_type)));
                        bytes.extend(self.endian.write_integer::<i64>(rela.addend));
                    }
                    Ok(bytes)
                }
                _ => Ok(section.data.clone()),
            }
        };

        // Section names resolve against a rebuilt .shstrtab holding every
        // name in section order.
        let mut shstrtab_data = vec![0u8];
        let mut name_offsets = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            if section.name.is_empty() {
                name_offsets.push(0);
                continue;
            }
            name_offsets.push(shstrtab_data.len() as u32);
            shstrtab_data.extend_from_slice(section.name.as_bytes());
            shstrtab_data.push(0);
        }

        let mut offset = ehsize;
        let mut headers = Vec::with_capacity(self.sections.len());
        let mut contents = Vec::with_capacity(self.sections.len());
        for (index, section) in self.sections.iter().enumerate() {
            let bytes = if index == self.shstrndx {
                shstrtab_data.clone()
            } else {
                section_bytes(index, section)?
            };

            let align = section.sh_addralign.max(1) as usize;
            if index > 0 && section.sh_type != SHT_NOBITS {
                offset = (offset + align - 1) / align * align;
            }

            let (sh_offset, sh_size) = match section.sh_type {
                SHT_NOBITS => (offset, section.nobits_size as usize),
                _ if index == 0 => (0, 0),
                _ => (offset, bytes.len()),
            };
            headers.push((sh_offset, sh_size));
            if index != 0 && section.sh_type != SHT_NOBITS {
                offset = sh_offset + sh_size;
            }
            contents.push(bytes);
        }

        let shoff = (offset + 7) / 8 * 8;
        let mut out = Vec::with_capacity(shoff + self.sections.len() * shentsize);

        out.extend_from_slice(&self.e_ident);
        out.extend(self.endian.write_integer::<u16>(self.e_type));
        out.extend(self.endian.write_integer::<u16>(self.e_machine));
        out.extend(self.endian.write_integer::<u32>(1)); // e_version
        out.extend(self.endian.write_integer::<u64>(0)); // e_entry
        out.extend(self.endian.write_integer::<u64>(0)); // e_phoff
        out.extend(self.endian.write_integer::<u64>(shoff as u64));
        out.extend(self.endian.write_integer::<u32>(self.e_flags));
        out.extend(self.endian.write_integer::<u16>(ehsize as u16));
        out.extend(self.endian.write_integer::<u16>(0)); // e_phentsize
        out.extend(self.endian.write_integer::<u16>(0)); // e_phnum
        out.extend(self.endian.write_integer::<u16>(shentsize as u16));
        out.extend(self.endian.write_integer::<u16>(self.sections.len() as u16));
        out.extend(self.endian.write_integer::<u16>(self.shstrndx as u16));

        for (index, bytes) in contents.iter().enumerate() {
            let (sh_offset, _) = headers[index];
            if index == 0 || self.sections[index].sh_type == SHT_NOBITS {
                continue;
            }
            if out.len() < sh_offset {
                out.resize(sh_offset, 0);
            }
            out.extend_from_slice(bytes);
        }

        if out.len() < shoff {
            out.resize(shoff, 0);
        }
        for (index, section) in self.sections.iter().enumerate() {
            let (sh_offset, sh_size) = headers[index];
            let sh_info = if index == self.symtab_index {
                local_count as u32
            } else {
                section.sh_info
            };
            out.extend(self.endian.write_integer::<u32>(name_offsets[index]));
            out.extend(self.endian.write_integer::<u32>(section.sh_type));
            out.extend(self.endian.write_integer::<u64>(section.sh_flags));
            out.extend(self.endian.write_integer::<u64>(section.sh_addr));
            out.extend(self.endian.write_integer::<u64>(sh_offset as u64));
            out.extend(self.endian.write_integer::<u64>(sh_size as u64));
            out.extend(self.endian.write_integer::<u32>(section.sh_link));
            out.extend(self.endian.write_integer::<u32>(sh_info));
            out.extend(self.endian.write_integer::<u64>(section.sh_addralign));
            out.extend(self.endian.write_integer::<u64>(section.sh_entsize));
        }

        fs::write(path, out)?;
        Ok(())
    }
}

/// Retargets every relocation pointing at `from` so it resolves through
/// `to`; both symbols must exist in the module.
pub fn change_call_symbol<P: AsRef<Path>>(path: P, from: &str, to: &str) -> Result<usize> {
    let mut editor = ModuleEditor::open(&path)?;
    let old_index = editor
        .symbol_index(from)
        .with_context(|| format!("Can't find symbol \"{}\"", from))?;
    let new_index = editor
        .symbol_index(to)
        .with_context(|| format!("Can't find symbol \"{}\"", to))?;

    let replaced = editor.retarget_relocations(old_index, new_index);
    ensure!(replaced > 0, "No relocation has been replaced");

    editor.save(&path)?;
    Ok(replaced)
}

pub fn strip_symbol<P: AsRef<Path>>(path: P, name: &str) -> Result<()> {
    let mut editor = ModuleEditor::open(&path)?;
    let index = editor
        .symbol_index(name)
        .with_context(|| format!("Can't find symbol \"{}\"", name))?;
    editor.strip_symbol(index)?;
    editor.save(&path)
}

/// Appends a read-only allocated note section carrying `data`.
pub fn add_note_section<P: AsRef<Path>>(path: P, name: &str, data: &[u8]) -> Result<()> {
    let mut editor = ModuleEditor::open(&path)?;
    editor.add_section(name, data.to_vec(), SHT_NOTE, SHF_ALLOC, 1);
    editor.save(&path)
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
    use crate::elf::read;
    use crate::elf::tests::build_test_object;

    fn test_module(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        fs::write(&path, build_test_object()).unwrap();
        path
    }

    #[test]
    fn test_rename_and_mark_symbol() {
        let path = test_module("deku-editor-rename.o");

        let mut editor = ModuleEditor::open(&path).unwrap();
        let index = editor.symbol_index("__fentry__").unwrap();
        editor
            .rename_symbol(index, ".klp.sym.vmlinux.__fentry__,0")
            .unwrap();
        editor.set_symbol_shndx(index, SHN_LIVEPATCH).unwrap();
        editor.save(&path).unwrap();

        let elf = read::Elf::parse(&path).unwrap();
        let (_, symbol) = elf
            .symbol_by_name(".klp.sym.vmlinux.__fentry__,0")
            .expect("Renamed symbol is missing");
        assert_eq!(symbol.shndx, SHN_LIVEPATCH);
        assert!(elf.symbol_by_name("__fentry__").is_none());
    }

    #[test]
    fn test_take_relocations_into_klp_section() {
        let path = test_module("deku-editor-klp.o");

        let mut editor = ModuleEditor::open(&path).unwrap();
        let index = editor.symbol_index("__fentry__").unwrap();
        let taken = editor.take_relocations_of(index);
        assert!(!taken.is_empty());

        for (origin, entries) in taken {
            let name = format!(
                ".klp.rela.vmlinux{}",
                editor.section_name(origin).trim_start_matches(".rela")
            );
            editor.add_klp_rela_section(&name, origin, entries).unwrap();
        }
        editor.save(&path).unwrap();

        let elf = read::Elf::parse(&path).unwrap();
        let (index, section) = elf
            .section_by_name(".klp.rela.vmlinux.text")
            .expect("Missing klp relocation section");
        assert_eq!(section.sh_flags & SHF_RELA_LIVEPATCH, SHF_RELA_LIVEPATCH);
        assert!(!elf.relocations(index).unwrap().is_empty());
    }

    #[test]
    fn test_retarget_and_strip() {
        let path = test_module("deku-editor-strip.o");

        let mut editor = ModuleEditor::open(&path).unwrap();
        let from = editor.symbol_index("helper").unwrap();
        let to = editor.symbol_index("foo").unwrap();
        assert!(editor.retarget_relocations(from, to) > 0);
        editor.strip_symbol(from).unwrap();
        editor.save(&path).unwrap();

        let elf = read::Elf::parse(&path).unwrap();
        assert!(elf.symbol_by_name("helper").is_none());
        let (foo_index, _) = elf.symbol_by_name("foo").unwrap();
        let text = elf.section_by_name(".text").map(|(i, _)| i).unwrap();
        assert!(elf
            .relocations_for(text)
            .unwrap()
            .iter()
            .any(|rela| rela.sym_index() == foo_index));
    }

    #[test]
    fn test_add_note_section() {
        let path = test_module("deku-editor-note.o");

        add_note_section(&path, ".note.deku", b"deku_1 fs/open.c 0011 ").unwrap();

        let elf = read::Elf::parse(&path).unwrap();
        let (index, section) = elf.section_by_name(".note.deku").expect("Missing note");
        assert_eq!(section.sh_type, SHT_NOTE);
        assert_eq!(section.sh_flags & SHF_ALLOC, SHF_ALLOC);
        assert_eq!(elf.section_data(index).unwrap(), b"deku_1 fs/open.c 0011 ");
    }
}
