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

use anyhow::{Context, Result};
use log::info;

use crate::elf::read::{Elf, Rela, Symbol};
use crate::elf::*;

/// Symbol-level difference between the original object from the kernel
/// build and the freshly rebuilt one.
#[derive(Debug, Default)]
pub struct ObjectDiff {
    pub modified: Vec<String>,
    pub new_functions: Vec<String>,
    pub new_variables: Vec<String>,
}

impl ObjectDiff {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.new_functions.is_empty() && self.new_variables.is_empty()
    }
}

pub fn compare_objects<P, Q>(original: P, rebuilt: Q) -> Result<ObjectDiff>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let original = Elf::parse(original)?;
    let rebuilt = Elf::parse(rebuilt)?;

    let mut diff = ObjectDiff::default();
    let section_count = rebuilt.sections().len();
    for symbol in rebuilt.symbols() {
        if symbol.size == 0
            || symbol.shndx == SHN_UNDEF
            || symbol.shndx as usize >= section_count
            || symbol.name.is_empty()
        {
            continue;
        }

        match symbol.st_type() {
            STT_FUNC => match symbol_by_name_and_type(&original, &symbol.name, STT_FUNC) {
                None => diff.new_functions.push(symbol.name.clone()),
                Some(old) => {
                    if !equal_functions(&original, old, &rebuilt, symbol)? {
                        diff.modified.push(symbol.name.clone());
                    }
                }
            },
            STT_OBJECT => {
                if symbol_by_name_and_type(&original, &symbol.name, STT_OBJECT).is_none()
                    && is_variable_section(rebuilt.section_name(symbol.shndx as usize), &symbol.name)
                {
                    diff.new_variables.push(symbol.name.clone());
                }
            }
            _ => {}
        }
    }

    Ok(diff)
}

/// The rebuilt object tells where a symbol landed; changes to functions in
/// the init and exit sections cannot reach a running kernel.
pub fn is_init_or_exit<P: AsRef<Path>>(obj: P, fun_name: &str) -> Result<bool> {
    let elf = Elf::parse(obj)?;
    let symbol = match elf.symbol_by_name(fun_name) {
        Some((_, symbol)) => symbol,
        None => return Ok(false),
    };

    match elf.section_name(symbol.shndx as usize) {
        ".init.text" => {
            info!(
                "The init function '{}' has been modified. Any changes made to this function will not be applied.",
                fun_name
            );
            Ok(true)
        }
        ".exit.text" => {
            info!(
                "The exit function '{}' has been modified. Any changes made to this function will not be applied.",
                fun_name
            );
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn symbol_by_name_and_type<'a>(elf: &'a Elf, name: &str, st_type: u8) -> Option<&'a Symbol> {
    elf.symbols()
        .iter()
        .find(|sym| sym.st_type() == st_type && sym.name == name)
}

fn equal_functions(
    original: &Elf,
    original_sym: &Symbol,
    rebuilt: &Elf,
    rebuilt_sym: &Symbol,
) -> Result<bool> {
    if original_sym.size != rebuilt_sym.size {
        return Ok(false);
    }
    Ok(function_hash(original, original_sym)? == function_hash(rebuilt, rebuilt_sym)?)
}

/// Content identity of a function: its instruction bytes combined with the
/// names of everything its relocations reach. Names are normalized so that
/// pure section-layout churn between two compiler runs does not register
/// as a modification.
fn function_hash(elf: &Elf, symbol: &Symbol) -> Result<u32> {
    let section = elf.section_data(symbol.shndx as usize)?;
    let start = symbol.value as usize;
    let end = start + symbol.size as usize;
    let body = section
        .get(start..end)
        .with_context(|| format!("Symbol \"{}\" is out of section range", symbol.name))?;

    let mut hash = crc32fast::hash(body);
    for rela in elf.relocations_in_range(symbol)? {
        if let Some(name) = relocation_target_name(elf, &rela)? {
            hash = hash.wrapping_add(crc32fast::hash(name.as_bytes()));
        }
    }
    Ok(hash)
}

fn relocation_target_name(elf: &Elf, rela: &Rela) -> Result<Option<String>> {
    let symbols = elf.symbols();
    let target = symbols
        .get(rela.sym_index())
        .with_context(|| format!("Can't find symbol at index {}", rela.sym_index()))?;

    let mut name = if !target.name.is_empty() {
        target.name.clone()
    } else if target.st_type() == STT_SECTION {
        elf.section_name(target.shndx as usize).to_string()
    } else {
        // An anonymous non-section symbol: identify it through a named
        // neighbour living in the same section.
        match symbols
            .iter()
            .find(|sym| sym.shndx == target.shndx && !sym.name.is_empty())
        {
            Some(linked) => linked.name.clone(),
            None => return Ok(None),
        }
    };

    // Merged string literals move freely between builds; hash the literal
    // itself instead of its host section.
    if name.contains(".str.") || name.contains(".str1.") || name.starts_with(".rodata.str") {
        let data = elf.section_data(target.shndx as usize)?;
        let addend = rela.addend.max(0) as usize;
        if addend < data.len() {
            let literal = data[addend..]
                .split(|byte| *byte == 0)
                .next()
                .unwrap_or_default();
            name = String::from_utf8_lossy(literal).into_owned();
        }
    }

    if let Some(stripped) = name.strip_prefix(".text.unlikely.") {
        name = stripped.to_string();
    } else if let Some(stripped) = name.strip_prefix(".text.") {
        name = stripped.to_string();
    }

    Ok(Some(name))
}

fn is_variable_section(section_name: &str, sym_name: &str) -> bool {
    section_name == ".data"
        || section_name == ".bss"
        || section_name == ".rodata"
        || section_name == format!(".data.{}", sym_name)
        || section_name == format!(".bss.{}", sym_name)
        || section_name == format!(".rodata.{}", sym_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::tests::ObjectBuilder;
    use std::path::PathBuf;

    fn write_object(name: &str, builder: ObjectBuilder) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        deku_common::fs::write(&path, builder.build()).unwrap();
        path
    }

    fn base_object() -> ObjectBuilder {
        let mut builder = ObjectBuilder::new();
        builder.add_function("unchanged", false, &[0x90; 16], true);
        builder.add_function("victim", false, &[0x90; 16], true);
        builder
    }

    #[test]
    fn test_identical_objects_have_no_diff() {
        let original = write_object("deku-diff-orig-same.o", base_object());
        let rebuilt = write_object("deku-diff-new-same.o", base_object());

        let diff = compare_objects(&original, &rebuilt).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_changed_body_is_modified() {
        let original = write_object("deku-diff-orig-body.o", base_object());

        let mut builder = ObjectBuilder::new();
        builder.add_function("unchanged", false, &[0x90; 16], true);
        builder.add_function("victim", false, &[0xcc; 16], true);
        let rebuilt = write_object("deku-diff-new-body.o", builder);

        let diff = compare_objects(&original, &rebuilt).unwrap();
        assert_eq!(diff.modified, vec!["victim"]);
        assert!(diff.new_functions.is_empty());
    }

    #[test]
    fn test_changed_callee_is_modified() {
        let mut builder = base_object();
        builder.add_call("victim", "old_callee", 8);
        let original = write_object("deku-diff-orig-callee.o", builder);

        let mut builder = base_object();
        builder.add_call("victim", "new_callee", 8);
        let rebuilt = write_object("deku-diff-new-callee.o", builder);

        let diff = compare_objects(&original, &rebuilt).unwrap();
        assert_eq!(diff.modified, vec!["victim"]);
    }

    #[test]
    fn test_added_symbols_are_new() {
        let original = write_object("deku-diff-orig-add.o", base_object());

        let mut builder = base_object();
        builder.add_function("fresh_fn", true, &[0x90; 8], true);
        builder.add_data("fresh_var", true, &[0u8; 8]);
        let rebuilt = write_object("deku-diff-new-add.o", builder);

        let diff = compare_objects(&original, &rebuilt).unwrap();
        assert!(diff.modified.is_empty());
        assert_eq!(diff.new_functions, vec!["fresh_fn"]);
        assert_eq!(diff.new_variables, vec!["fresh_var"]);
    }
}
