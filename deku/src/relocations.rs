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

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;

use deku_common::fs;

use crate::config::Config;
use crate::elf::editor::{EditRela, ModuleEditor};
use crate::elf::read::Elf;
use crate::elf::{SymKind, SHN_LIVEPATCH};
use crate::livepatch::DEKU_FUN_PREFIX;
use crate::module::{patch_modules, PatchModule, DEPS, MISS_SYM};
use crate::owner;
use crate::sympos;
use crate::error::DekuError;

/// Symbols never rewritten into KLP relocations.
const IGNORED_SYMBOLS: [&str; 2] = ["_printk", "_GLOBAL_OFFSET_TABLE_"];

/// An external reference resolved to its owner and occurrence index.
#[derive(Debug)]
pub struct SymbolRelocation {
    pub name: String,
    pub owner: String,
    pub sympos: usize,
}

/// Tokens of the symvers tables; anything the kernel module loader can
/// resolve by itself stays a plain undefined symbol.
fn exported_symbols(config: &Config) -> HashSet<String> {
    let mut exported = HashSet::new();
    for symvers in ["vmlinux.symvers", "Module.symvers"] {
        let content =
            fs::read_to_string(config.linux_headers_dir.join(symvers)).unwrap_or_default();
        exported.extend(content.split_whitespace().map(String::from));
    }
    exported
}

fn symbols_to_relocate(config: &Config, ko_file: &Path) -> Result<Vec<(String, SymKind)>> {
    let exported = exported_symbols(config);
    let elf = Elf::parse(ko_file)?;

    let symbols = elf
        .undefined_symbols()
        .into_iter()
        .filter(|sym| !sym.name.starts_with(DEKU_FUN_PREFIX))
        .filter(|sym| !IGNORED_SYMBOLS.contains(&sym.name.as_str()))
        .filter(|sym| !exported.contains(&sym.name))
        .map(|sym| (sym.name.clone(), SymKind::from_st_type(sym.st_type())))
        .collect::<Vec<_>>();
    debug!("Symbols to relocate: {:?}", symbols);
    Ok(symbols)
}

fn contains_symbol(obj_file: &Path, name: &str, kind: SymKind) -> bool {
    debug!(
        "Check if {} contains symbol: [{}] {}",
        obj_file.display(),
        kind,
        name
    );
    let elf = match Elf::parse(obj_file) {
        Ok(elf) => elf,
        Err(_) => return false,
    };
    elf.symbols()
        .iter()
        .any(|sym| sym.size > 0 && sym.name == name && kind.matches(sym.st_type()))
}

/// A sibling patch module defining the symbol, if any. This is what turns
/// a missing symbol into a cross-module dependency on the second pass.
fn find_patch_module_with_symbol(config: &Config, name: &str, kind: SymKind) -> Option<String> {
    for module in patch_modules(config, false) {
        let obj_file = config
            .workdir
            .join(&module.name)
            .join(format!("{}.o", module.name));
        if contains_symbol(&obj_file, name, kind) {
            return Some(module.name);
        }
    }
    None
}

/// Resolves every unresolved reference of the finished `.ko` to an owner
/// object and sympos, then rewrites the module into KLP form. Unresolvable
/// symbols are parked in `miss_sym` for the second build pass.
pub fn adjust_relocations(
    config: &Config,
    module: &PatchModule,
    obj_path: &str,
    mod_symbols: &[String],
) -> Result<()> {
    let module_dir = module.ko_file.parent().unwrap_or_else(|| Path::new(""));
    let deps_file = module_dir.join(DEPS);
    let miss_sym_file = module_dir.join(MISS_SYM);
    let _ = fs::remove_file(&deps_file);
    let _ = fs::remove_file(&miss_sym_file);

    let mut relocations = Vec::new();
    let mut missing = false;
    for (name, kind) in symbols_to_relocate(config, &module.ko_file)? {
        if mod_symbols.contains(&name) {
            continue;
        }

        let mut sym_obj_path =
            owner::find_object_with_symbol(config, &name, &module.src_file, obj_path)?;
        let index = match sympos::find_symbol_index(
            &config.build_dir,
            &name,
            kind,
            &module.src_file,
            config.build_dir.join(&sym_obj_path),
        ) {
            Ok(index) => index,
            Err(error) => {
                if error.downcast_ref::<DekuError>() != Some(&DekuError::CantFindSymIndex) {
                    return Err(error);
                }
                match find_patch_module_with_symbol(config, &name, kind) {
                    Some(patch_module) => {
                        debug!(
                            "{} depends on {} due to symbol required: {}",
                            module.name, patch_module, name
                        );
                        fs::append(&deps_file, format!("{}\n", patch_module))?;
                        sym_obj_path = patch_module;
                        0
                    }
                    None => {
                        fs::append(&miss_sym_file, format!("{}\n", name))?;
                        missing = true;
                        continue;
                    }
                }
            }
        };

        relocations.push(SymbolRelocation {
            name,
            owner: fs::file_stem(&sym_obj_path),
            sympos: index,
        });
    }

    if missing {
        return Err(DekuError::CantFindSymIndex).with_context(|| {
            format!(
                "Module {} has unresolved symbols, deferring to the second pass",
                module.name
            )
        });
    }

    make_livepatch(
        &module.ko_file,
        &fs::file_stem(obj_path),
        &relocations,
        mod_symbols,
    )
    .with_context(|| format!("Failed to make livepatch for {}", module.src_file))
}

/// Converts the module into livepatch form:
/// - every resolved external becomes `.klp.sym.<owner>.<name>,<pos>` parked
///   in `SHN_LIVEPATCH`;
/// - its relocation records move into `.klp.rela.<obj>.<section>` sections
///   applied by the livepatch core;
/// - each replaced function is tagged with its owner so the patch names the
///   original unambiguously.
pub fn make_livepatch(
    ko_file: &Path,
    obj_name: &str,
    relocations: &[SymbolRelocation],
    mod_symbols: &[String],
) -> Result<()> {
    let mut editor = ModuleEditor::open(ko_file)?;

    let mut moved: HashMap<usize, Vec<EditRela>> = HashMap::new();
    for relocation in relocations {
        let index = editor
            .symbol_index(&relocation.name)
            .with_context(|| format!("Can't find symbol \"{}\"", relocation.name))?;

        let klp_name = format!(
            ".klp.sym.{}.{},{}",
            relocation.owner, relocation.name, relocation.sympos
        );
        debug!("Convert to livepatch symbol '{}'", relocation.name);
        editor.rename_symbol(index, &klp_name)?;
        editor.set_symbol_shndx(index, SHN_LIVEPATCH)?;

        for (origin, entries) in editor.take_relocations_of(index) {
            moved.entry(origin).or_default().extend(entries);
        }
    }

    for (origin, entries) in moved {
        let name = format!(
            ".klp.rela.{}{}",
            obj_name,
            editor.section_name(origin).trim_start_matches(".rela")
        );
        debug!("Add section '{}'", name);
        editor.add_klp_rela_section(&name, origin, entries)?;
    }

    for symbol in mod_symbols {
        let plain_symbol = symbol.replace('.', "_");
        if let Some(index) = editor.symbol_index(&plain_symbol) {
            editor.rename_symbol(index, &format!("{}.{}", obj_name, symbol))?;
        }
    }

    editor.save(ko_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::read::Elf;
    use crate::elf::tests::ObjectBuilder;
    use crate::elf::SHF_RELA_LIVEPATCH;

    #[test]
    fn test_make_livepatch_rewrites_externals() {
        let path = std::env::temp_dir().join("deku-relocations.ko");

        let mut builder = ObjectBuilder::new();
        builder.add_function("deku_fn", false, &[0x90; 32], true);
        builder.add_call("deku_fn", "some_static_fn", 8);
        builder.add_call("deku_fn", "another_fn", 16);
        deku_common::fs::write(&path, builder.build()).unwrap();

        let relocations = vec![
            SymbolRelocation {
                name: "some_static_fn".to_string(),
                owner: "vmlinux".to_string(),
                sympos: 2,
            },
            SymbolRelocation {
                name: "another_fn".to_string(),
                owner: "dummy".to_string(),
                sympos: 0,
            },
        ];
        make_livepatch(&path, "vmlinux", &relocations, &["deku_fn".to_string()]).unwrap();

        let elf = Elf::parse(&path).unwrap();

        let (_, sym) = elf
            .symbol_by_name(".klp.sym.vmlinux.some_static_fn,2")
            .expect("Missing klp symbol");
        assert_eq!(sym.shndx, SHN_LIVEPATCH);
        assert!(elf.symbol_by_name(".klp.sym.dummy.another_fn,0").is_some());

        // The replaced function carries its owner prefix
        assert!(elf.symbol_by_name("vmlinux.deku_fn").is_some());

        // Moved relocations live in the livepatch section, not the original
        let (klp_index, klp_section) = elf
            .section_by_name(".klp.rela.vmlinux.text")
            .expect("Missing klp rela section");
        assert_eq!(
            klp_section.sh_flags & SHF_RELA_LIVEPATCH,
            SHF_RELA_LIVEPATCH
        );
        assert_eq!(elf.relocations(klp_index).unwrap().len(), 2);

        let (text_index, _) = elf.section_by_name(".text").unwrap();
        let (fentry_index, _) = elf.symbol_by_name("__fentry__").unwrap();
        let leftover = elf.relocations_for(text_index).unwrap();
        assert!(leftover.iter().all(|rela| rela.sym_index() == fentry_index));
    }
}
