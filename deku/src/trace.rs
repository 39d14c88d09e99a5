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

use anyhow::Result;
use indexmap::IndexSet;
use log::debug;

use crate::elf::read::{Elf, Symbol};
use crate::elf::*;

const FENTRY_SYMBOL: &str = "__fentry__";

/// Whether a modified function can be replaced by the livepatch core, and
/// if not, the traceable local callers that can stand in for it.
///
/// `(true, _)` — the function carries the ftrace hook and patches directly.
/// `(false, callers)` — rescue through `callers` (replace each of them).
/// `(false, [])` — the function is forbidden to modify.
pub fn check_traceable<P: AsRef<Path>>(obj: P, fun_name: &str) -> Result<(bool, Vec<String>)> {
    let elf = match Elf::parse(obj) {
        Ok(elf) => elf,
        Err(_) => return Ok((false, Vec::new())),
    };

    let fentry_index = match elf.symbol_by_name(FENTRY_SYMBOL) {
        Some((index, _)) => index,
        None => return Ok((false, Vec::new())),
    };

    if is_traceable(&elf, fentry_index, fun_name)? {
        return Ok((true, Vec::new()));
    }

    let (fun_index, fun) = match elf.symbol_by_name(fun_name) {
        Some(found) => found,
        None => return Ok((false, Vec::new())),
    };
    if fun.st_bind() != STB_LOCAL {
        debug!(
            "The '{}' function is forbidden to modify. The function is non-local",
            fun_name
        );
        return Ok((false, Vec::new()));
    }

    let references = reference_from(&elf, fun_index, fun)?;
    if references.is_empty() {
        return Ok((false, Vec::new()));
    }

    debug!(
        "The '{}' function is forbidden to modify. This function is called from: {:?}",
        fun_name, references
    );
    let mut callers = Vec::new();
    for (kind, name) in references {
        if kind == SymKind::Var || !is_traceable(&elf, fentry_index, &name)? {
            return Ok((false, Vec::new()));
        }
        callers.push(name);
    }

    Ok((false, callers))
}

/// A function is traceable iff the first relocation of its body is the
/// ftrace entry hook planted by the compiler at offset 0.
fn is_traceable(elf: &Elf, fentry_index: usize, fun_name: &str) -> Result<bool> {
    let symbol = match elf.symbol_by_name(fun_name) {
        Some((_, symbol)) => symbol,
        None => return Ok(false),
    };

    let mut relas = elf.relocations_in_range(symbol)?;
    relas.sort_by_key(|rela| rela.offset);
    Ok(relas
        .first()
        .map(|rela| rela.sym_index() == fentry_index)
        .unwrap_or(false))
}

/// Every place the object refers to `target` from: `f` entries are
/// functions whose bodies call or take its address, `v` entries are data
/// objects (ops tables, callbacks) holding a pointer to it.
fn reference_from(
    elf: &Elf,
    target_index: usize,
    target: &Symbol,
) -> Result<Vec<(SymKind, String)>> {
    let mut references = IndexSet::new();

    for symbol in elf.symbols() {
        if symbol.st_type() != STT_FUNC
            || symbol.name.is_empty()
            || !symbol.is_defined()
            || symbol.name == target.name
        {
            continue;
        }
        let resolves = elf
            .relocations_in_range(symbol)?
            .iter()
            .any(|rela| resolves_to(elf, rela.sym_index(), rela.addend, target_index, target));
        if resolves {
            references.insert((SymKind::Func, symbol.name.clone()));
        }
    }

    for (rela_index, rela_section) in elf.sections().iter().enumerate() {
        if rela_section.sh_type != SHT_RELA {
            continue;
        }
        let parent_index = rela_section.sh_info as usize;
        let parent = match elf.sections().get(parent_index) {
            Some(parent) => parent,
            None => continue,
        };
        if parent.sh_type != SHT_PROGBITS
            || parent.sh_flags & SHF_ALLOC == 0
            || parent.sh_flags & SHF_EXECINSTR != 0
            || parent.name.starts_with(".discard.")
            || parent.name.starts_with("___ksymtab")
        {
            continue;
        }

        for rela in elf.relocations(rela_index)? {
            if !resolves_to(elf, rela.sym_index(), rela.addend, target_index, target) {
                continue;
            }
            let holder = elf.symbols().iter().find(|sym| {
                sym.st_type() == STT_OBJECT
                    && sym.shndx as usize == parent_index
                    && sym.contains(rela.offset)
            });
            if let Some(holder) = holder {
                references.insert((SymKind::Var, holder.name.clone()));
            }
        }
    }

    Ok(references.into_iter().collect())
}

/// A relocation reaches `target` either by naming its symbol directly or
/// through the section symbol plus the target's offset (with or without
/// the call-operand bias).
fn resolves_to(
    elf: &Elf,
    sym_index: usize,
    addend: i64,
    target_index: usize,
    target: &Symbol,
) -> bool {
    if sym_index == target_index {
        return true;
    }
    match elf.symbols().get(sym_index) {
        Some(sym) if sym.st_type() == STT_SECTION && sym.shndx == target.shndx => {
            let direct = addend >= 0 && target.contains(addend as u64);
            let biased = target.contains((addend + 4) as u64);
            direct || biased
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::tests::{build_test_object, ObjectBuilder};
    use std::path::PathBuf;

    fn fixture(name: &str, contents: Vec<u8>) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        deku_common::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_function_with_fentry_is_traceable() {
        let path = fixture("deku-trace-fentry.o", build_test_object());

        let (traceable, callers) = check_traceable(&path, "foo").unwrap();
        assert!(traceable);
        assert!(callers.is_empty());
    }

    #[test]
    fn test_local_leaf_rescued_through_caller() {
        let path = fixture("deku-trace-caller.o", build_test_object());

        let (traceable, callers) = check_traceable(&path, "helper").unwrap();
        assert!(!traceable);
        assert_eq!(callers, vec!["caller"]);
    }

    #[test]
    fn test_global_without_fentry_is_forbidden() {
        let mut builder = ObjectBuilder::new();
        builder.add_function("exported", false, &[0x90; 8], false);
        builder.add_function("anchor", false, &[0x90; 8], true);
        let path = fixture("deku-trace-global.o", builder.build());

        let (traceable, callers) = check_traceable(&path, "exported").unwrap();
        assert!(!traceable);
        assert!(callers.is_empty());
    }

    #[test]
    fn test_data_reference_forbids_rescue() {
        let mut builder = ObjectBuilder::new();
        builder.add_function("stored", true, &[0x90; 8], false);
        builder.add_function("caller", true, &[0x90; 16], true);
        builder.add_call("caller", "stored", 8);
        builder.add_data("ops_table", false, &[0u8; 8]);
        builder.add_data_ref("ops_table", "stored");
        let path = fixture("deku-trace-ops.o", builder.build());

        let (traceable, callers) = check_traceable(&path, "stored").unwrap();
        assert!(!traceable);
        assert!(callers.is_empty());
    }
}
