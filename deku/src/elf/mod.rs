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

use std::convert::TryInto;

pub mod editor;
pub mod extract;
pub mod read;

pub const ELFCLASS64: u8 = 2;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOTE: u32 = 7;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_EXECINSTR: u64 = 0x4;
/// Marks a relocation section to be applied by the livepatch core at patch
/// enable time instead of at module load time.
pub const SHF_RELA_LIVEPATCH: u64 = 0x0010_0000;

pub const SHN_UNDEF: u16 = 0;
pub const SHN_LORESERVE: u16 = 0xff00;
pub const SHN_LIVEPATCH: u16 = 0xff20;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;

pub fn elf_st_type(st_info: u8) -> u8 {
    st_info & 0xf
}

pub fn elf_st_bind(st_info: u8) -> u8 {
    st_info >> 4
}

pub fn elf_st_info(bind: u8, st_type: u8) -> u8 {
    (bind << 4) | (st_type & 0xf)
}

pub fn elf_r_sym(r_info: u64) -> usize {
    (r_info >> 32) as usize
}

pub fn elf_r_type(r_info: u64) -> u32 {
    (r_info & 0xffff_ffff) as u32
}

pub fn elf_r_info(sym: usize, r_type: u32) -> u64 {
    ((sym as u64) << 32) | r_type as u64
}

/// Symbol class selector used by sympos resolution and owner lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymKind {
    Func,
    Var,
    Any,
}

impl SymKind {
    pub fn from_st_type(st_type: u8) -> Self {
        match st_type {
            STT_FUNC => SymKind::Func,
            STT_OBJECT => SymKind::Var,
            _ => SymKind::Any,
        }
    }

    pub fn matches(self, st_type: u8) -> bool {
        match self {
            SymKind::Func => st_type == STT_FUNC,
            SymKind::Var => st_type == STT_OBJECT,
            SymKind::Any => true,
        }
    }
}

impl std::fmt::Display for SymKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymKind::Func => f.write_str("f"),
            SymKind::Var => f.write_str("v"),
            SymKind::Any => Ok(()),
        }
    }
}

pub trait ReadInteger<T> {
    fn from_le_bytes(data: &[u8]) -> T;
    fn from_be_bytes(data: &[u8]) -> T;

    fn to_le_bytes(data: T) -> Vec<u8>;
    fn to_be_bytes(data: T) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy)]
pub enum Endianness {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy)]
pub struct Endian {
    endian: Endianness,
}

impl Endian {
    pub fn new(endian: Endianness) -> Self {
        Self { endian }
    }

    pub fn read_integer<T: ReadInteger<T>>(&self, data: &[u8]) -> T {
        match self.endian {
            Endianness::Little => T::from_le_bytes(&data[..std::mem::size_of::<T>()]),
            Endianness::Big => T::from_be_bytes(&data[..std::mem::size_of::<T>()]),
        }
    }

    pub fn write_integer<T: ReadInteger<T>>(&self, data: T) -> Vec<u8> {
        match self.endian {
            Endianness::Little => T::to_le_bytes(data),
            Endianness::Big => T::to_be_bytes(data),
        }
    }
}

macro_rules! impl_read_integer {
    ($($t:ty),+) => {
        $(impl ReadInteger<$t> for $t {
            fn from_le_bytes(data: &[u8]) -> $t {
                <$t>::from_le_bytes(data.try_into().unwrap())
            }
            fn from_be_bytes(data: &[u8]) -> $t {
                <$t>::from_be_bytes(data.try_into().unwrap())
            }

            fn to_le_bytes(data: $t) -> Vec<u8> {
                <$t>::to_le_bytes(data).into()
            }
            fn to_be_bytes(data: $t) -> Vec<u8> {
                <$t>::to_be_bytes(data).into()
            }
        })+
    }
}

impl_read_integer!(u8, u16, u32, u64, i64);

#[repr(C)]
pub struct Header64 {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
pub struct SectionHeader64 {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

#[repr(C)]
pub struct SymbolHeader64 {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

#[repr(C)]
pub struct Rela64 {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

pub fn check_magic(data: &[u8]) -> bool {
    data.len() > 64 && data[0..4].eq(&[0x7f, 0x45, 0x4c, 0x46])
}

pub fn check_header(data: &[u8]) -> std::io::Result<Endian> {
    if data.get(4) != Some(&ELFCLASS64) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "elf format is not class64".to_string(),
        ));
    }

    match data.get(5) {
        Some(1) => Ok(Endian::new(Endianness::Little)),
        Some(2) => Ok(Endian::new(Endianness::Big)),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "elf endian is error".to_string(),
        )),
    }
}

#[cfg(test)]
pub mod tests {
    use std::collections::HashMap;

    use object::write::{self, SectionId, SymbolId, SymbolSection};
    use object::{
        Architecture, BinaryFormat, RelocationEncoding, RelocationKind, SectionKind, SymbolFlags,
        SymbolKind, SymbolScope,
    };

    use super::*;

    const R_X86_64_64: u32 = 1;
    const R_X86_64_PLT32: u32 = 4;

    /// Builds small relocatable objects the same shape as compiler output,
    /// so analyses can run without a kernel build tree.
    pub struct ObjectBuilder {
        object: write::Object<'static>,
        text: SectionId,
        data: SectionId,
        symbols: HashMap<String, SymbolId>,
        functions: HashMap<String, u64>,
        variables: HashMap<String, u64>,
    }

    impl ObjectBuilder {
        pub fn new() -> Self {
            let mut object = write::Object::new(
                BinaryFormat::Elf,
                Architecture::X86_64,
                object::Endianness::Little,
            );
            let text = object.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
            let data = object.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
            Self {
                object,
                text,
                data,
                symbols: HashMap::new(),
                functions: HashMap::new(),
                variables: HashMap::new(),
            }
        }

        pub fn add_file(&mut self, name: &str) -> &mut Self {
            self.object.add_symbol(write::Symbol {
                name: name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::File,
                scope: SymbolScope::Compilation,
                weak: false,
                section: SymbolSection::None,
                flags: SymbolFlags::None,
            });
            self
        }

        pub fn add_function(
            &mut self,
            name: &str,
            local: bool,
            body: &[u8],
            fentry: bool,
        ) -> &mut Self {
            let value = {
                let section = self.object.section_mut(self.text);
                section.append_data(body, 16)
            };
            let symbol_id = self.object.add_symbol(write::Symbol {
                name: name.as_bytes().to_vec(),
                value,
                size: body.len() as u64,
                kind: SymbolKind::Text,
                scope: if local {
                    SymbolScope::Compilation
                } else {
                    SymbolScope::Dynamic
                },
                weak: false,
                section: SymbolSection::Section(self.text),
                flags: SymbolFlags::None,
            });
            self.symbols.insert(name.to_string(), symbol_id);
            self.functions.insert(name.to_string(), value);

            if fentry {
                let fentry_id = self.ensure_external("__fentry__");
                self.object
                    .add_relocation(
                        self.text,
                        write::Relocation {
                            offset: value + 1,
                            size: 32,
                            kind: RelocationKind::Elf(R_X86_64_PLT32),
                            encoding: RelocationEncoding::Generic,
                            symbol: fentry_id,
                            addend: -4,
                        },
                    )
                    .unwrap();
            }
            self
        }

        pub fn add_call(&mut self, from: &str, to: &str, insn_offset: u64) -> &mut Self {
            let value = self.functions[from];
            let target = self.ensure_external(to);
            self.object
                .add_relocation(
                    self.text,
                    write::Relocation {
                        offset: value + insn_offset,
                        size: 32,
                        kind: RelocationKind::Elf(R_X86_64_PLT32),
                        encoding: RelocationEncoding::Generic,
                        symbol: target,
                        addend: -4,
                    },
                )
                .unwrap();
            self
        }

        pub fn add_data(&mut self, name: &str, local: bool, bytes: &[u8]) -> &mut Self {
            let value = {
                let section = self.object.section_mut(self.data);
                section.append_data(bytes, 8)
            };
            let symbol_id = self.object.add_symbol(write::Symbol {
                name: name.as_bytes().to_vec(),
                value,
                size: bytes.len() as u64,
                kind: SymbolKind::Data,
                scope: if local {
                    SymbolScope::Compilation
                } else {
                    SymbolScope::Dynamic
                },
                weak: false,
                section: SymbolSection::Section(self.data),
                flags: SymbolFlags::None,
            });
            self.symbols.insert(name.to_string(), symbol_id);
            self.variables.insert(name.to_string(), value);
            self
        }

        /// A pointer in `.data` referencing `to`, the shape of a function
        /// stored in an ops table.
        pub fn add_data_ref(&mut self, from: &str, to: &str) -> &mut Self {
            let value = self.variables[from];
            let target = self.ensure_external(to);
            self.object
                .add_relocation(
                    self.data,
                    write::Relocation {
                        offset: value,
                        size: 64,
                        kind: RelocationKind::Elf(R_X86_64_64),
                        encoding: RelocationEncoding::Generic,
                        symbol: target,
                        addend: 0,
                    },
                )
                .unwrap();
            self
        }

        fn ensure_external(&mut self, name: &str) -> SymbolId {
            if let Some(symbol_id) = self.symbols.get(name) {
                return *symbol_id;
            }
            let symbol_id = self.object.add_symbol(write::Symbol {
                name: name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Unknown,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
            self.symbols.insert(name.to_string(), symbol_id);
            symbol_id
        }

        pub fn build(self) -> Vec<u8> {
            self.object.write().expect("Failed to build test object")
        }
    }

    /// Canonical fixture: a traceable global, a non-traceable local helper,
    /// a traceable local caller of the helper and one data object.
    pub fn build_test_object() -> Vec<u8> {
        let mut builder = ObjectBuilder::new();
        builder.add_function("foo", false, &[0x90; 16], true);
        builder.add_function("helper", true, &[0x90; 8], false);
        builder.add_function("caller", true, &[0x90; 16], true);
        builder.add_call("caller", "helper", 8);
        builder.add_data("bar_data", false, &[0u8; 8]);
        builder.build()
    }

    #[test]
    fn test_st_info_round_trip() {
        let info = elf_st_info(STB_GLOBAL, STT_FUNC);
        assert_eq!(elf_st_bind(info), STB_GLOBAL);
        assert_eq!(elf_st_type(info), STT_FUNC);
    }

    #[test]
    fn test_r_info_round_trip() {
        let info = elf_r_info(42, 11);
        assert_eq!(elf_r_sym(info), 42);
        assert_eq!(elf_r_type(info), 11);
    }

    #[test]
    fn test_sym_kind() {
        assert!(SymKind::Func.matches(STT_FUNC));
        assert!(!SymKind::Func.matches(STT_OBJECT));
        assert!(SymKind::Any.matches(STT_NOTYPE));
        assert_eq!(SymKind::Func.to_string(), "f");
        assert_eq!(SymKind::Var.to_string(), "v");
        assert_eq!(SymKind::Any.to_string(), "");
    }
}
