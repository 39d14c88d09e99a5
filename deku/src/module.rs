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

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexSet;
use log::{debug, error, info, warn};

use deku_common::{digest, fs, process::Command};

use crate::config::Config;
use crate::diff;
use crate::elf::editor;
use crate::elf::extract;
use crate::error::DekuError;
use crate::kbuild;
use crate::livepatch::{self, DEKU_FUN_PREFIX};
use crate::owner;
use crate::relocations;
use crate::trace;

pub const MODULE_PREFIX: &str = "deku_";

/// Sidecar files of a module workspace directory.
pub const FILE_SRC_PATH: &str = "path";
pub const FILE_OBJECT_PATH: &str = "obj";
pub const FILE_ID: &str = "id";
pub const NOTE_FILE: &str = "note";
pub const DEPS: &str = "deps";
pub const MISS_SYM: &str = "miss_sym";
pub const NOTE_SECTION: &str = ".note.deku";

#[derive(Debug, Clone)]
pub struct PatchModule {
    pub name: String,
    pub src_file: String,
    pub ko_file: PathBuf,
    pub dependencies: Vec<String>,
}

impl PatchModule {
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn invalidate(mut self) -> Self {
        self.name.clear();
        self
    }
}

/// `deku_<crc32(path)>_<sanitized stem>` — the same path always yields the
/// same module name, on any host.
pub fn generate_module_name(file: &str) -> String {
    let sum = digest::crc32(file.as_bytes());
    let name = fs::file_stem(file).replace('-', "_");

    format!("{}{}_{}", MODULE_PREFIX, sum, name)
}

/// Content id of the source file at synthesis time.
pub fn generate_module_id(config: &Config, file: &str) -> Result<String> {
    Ok(digest::crc32_file(config.source_dir.join(file))?)
}

/// Modules present in the workspace. A module is valid iff its `.ko` and
/// `id` both exist; invalid entries are returned only on request.
pub fn patch_modules(config: &Config, only_valid: bool) -> Vec<PatchModule> {
    let mut modules = Vec::new();
    let entries = match fs::read_dir(&config.workdir) {
        Ok(entries) => entries,
        Err(_) => return modules,
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.path().is_dir() || !name.starts_with(MODULE_PREFIX) {
            continue;
        }
        let src_file = match fs::read_to_string(entry.path().join(FILE_SRC_PATH)) {
            Ok(src_file) => src_file,
            Err(_) => continue,
        };

        let mut ko_file = entry.path().join(format!("{}.ko", name));
        let id_file = entry.path().join(FILE_ID);
        if only_valid && (!fs::exists(&ko_file) || !fs::exists(&id_file)) {
            continue;
        }
        if !fs::exists(&ko_file) {
            ko_file = PathBuf::new();
        }

        modules.push(PatchModule {
            src_file,
            dependencies: fs::read_lines(entry.path().join(DEPS)),
            ko_file,
            name,
        });
    }
    modules
}

/// Human-readable record of what changed in the source, kept next to the
/// generated module for debugging.
fn file_diff(config: &Config, file: &str) -> Vec<u8> {
    let output = match &config.kern_src_install_dir {
        Some(origin_dir) => {
            let origin = origin_dir.join(file);
            let edited = config.source_dir.join(file);
            Command::new("diff")
                .arg("--unified")
                .arg(&origin)
                .arg("--label")
                .arg(&origin)
                .arg(&edited)
                .arg("--label")
                .arg(&edited)
                .run_with_output()
        }
        None => Command::new("git")
            .arg(format!("--work-tree={}", config.source_dir.display()))
            .arg(format!("--git-dir={}", config.workdir.join(".git").display()))
            .arg("diff")
            .arg("--function-context")
            .arg("--")
            .arg(file)
            .run_with_output(),
    };

    output
        .map(|output| output.stdout.to_string_lossy().into_owned().into_bytes())
        .unwrap_or_default()
}

/// The symbols entering the patch for one rebuilt translation unit.
/// Returns the functions the generated `klp_func` table must replace;
/// extraction of `patch.o` happens on the way.
fn generate_diff_object(config: &Config, module_dir: &Path, file: &str) -> Result<Vec<String>> {
    let o_file = module_dir.join(format!("{}.o", fs::file_stem(file)));
    let origin_obj = kbuild::original_object_path(config, file);

    let object_diff = diff::compare_objects(&origin_obj, &o_file)
        .with_context(|| format!("Can't find modified functions for {}", file))?;
    debug!("Modified symbols: {:?}", object_diff);

    let mut extract_syms = IndexSet::new();
    let mut mod_syms = IndexSet::new();
    for fun in &object_diff.modified {
        if diff::is_init_or_exit(&o_file, fun)? {
            continue;
        }

        let (traceable, callers) = trace::check_traceable(&origin_obj, fun)?;
        if !traceable && callers.is_empty() {
            error!(
                "Can't apply changes to the '{}' because the '{}' function is forbidden to modify.",
                file, fun
            );
            return Err(DekuError::ForbiddenModify.into());
        }

        if traceable {
            mod_syms.insert(fun.clone());
        } else {
            for caller in callers {
                mod_syms.insert(caller.clone());
                extract_syms.insert(caller);
            }
        }
        extract_syms.insert(fun.clone());
    }

    if extract_syms.is_empty()
        && object_diff.new_functions.is_empty()
        && object_diff.new_variables.is_empty()
    {
        return Ok(Vec::new());
    }

    extract_syms.extend(object_diff.new_functions.iter().cloned());
    extract_syms.extend(object_diff.new_variables.iter().cloned());

    extract::extract_symbols(&o_file, module_dir.join("patch.o"), &extract_syms)
        .map_err(|error| {
            error!("Failed to extract modified symbols for {}: {:?}", file, error);
            anyhow::Error::from(DekuError::ExtractSymbols)
        })?;

    Ok(mod_syms.into_iter().collect())
}

/// Synthesizes the livepatch module for one modified source file. An
/// invalidated module is returned when there is deliberately nothing to do;
/// errors are reserved for failures.
pub fn generate_module(config: &Config, file: &str) -> Result<PatchModule> {
    let base_name = fs::file_name(file).to_string_lossy().into_owned();
    let file_name = fs::file_stem(file);
    let name = generate_module_name(file);
    let module_dir = config.workdir.join(&name);
    let module_id = generate_module_id(config, file)?;

    let module = PatchModule {
        name: name.clone(),
        src_file: file.to_string(),
        ko_file: module_dir.join(format!("{}.ko", name)),
        dependencies: Vec::new(),
    };

    // Unchanged since the last run
    if fs::read_to_string(module_dir.join(FILE_ID)).ok().as_deref() == Some(module_id.as_str()) {
        return Ok(module.invalidate());
    }

    if owner::find_object_file(config, file).is_err() {
        warn!("File '{}' is not used in the kernel or module. Skip", file);
        fs::create_dir_all(&module_dir)?;
        fs::write(module_dir.join(FILE_ID), &module_id)?;
        let _ = fs::remove_file(&module.ko_file);
        return Ok(module.invalidate());
    }

    info!("Processing {}...", file);

    fs::create_dir_all(&module_dir)?;
    let _ = fs::remove_file(module_dir.join(FILE_ID));

    fs::write(module_dir.join("diff"), file_diff(config, file))?;

    // A file name with the '_' prefix is the origin revision
    if let Some(origin_dir) = &config.kern_src_install_dir {
        fs::copy(
            origin_dir.join(file),
            module_dir.join(format!("_{}", base_name)),
        )?;
    }
    fs::copy(config.source_dir.join(file), module_dir.join(&base_name))?;
    fs::write(module_dir.join(FILE_SRC_PATH), file)?;

    kbuild::build_file(
        config,
        file,
        &module_dir.join(&base_name),
        &module_dir.join(format!("{}.o", file_name)),
    )
    .with_context(|| format!("Error while build {}", file))?;

    let mod_funcs = generate_diff_object(config, &module_dir, file)
        .with_context(|| format!("Error while finding modified functions in {}", file))?;
    if mod_funcs.is_empty() {
        info!("No valid changes found in '{}'", file);
        let _ = fs::remove_file(&module.ko_file);
        fs::write(module_dir.join(FILE_ID), &module_id)?;
        return Ok(module.invalidate());
    }

    let obj_path = owner::find_object_file(config, file)
        .with_context(|| format!("Can't find object file for {}", file))?;

    livepatch::generate_livepatch_source(config, &module_dir, file, &obj_path, &mod_funcs)?;
    livepatch::generate_makefile(config, &module_dir, &name)?;
    kbuild::build_livepatch_module(config, &module_dir)?;

    // Calls go back to the origin function XYZ instead of __deku_fun_XYZ
    for symbol in &mod_funcs {
        let plain_symbol = symbol.replace('.', "_");
        let shim = format!("{}{}", DEKU_FUN_PREFIX, plain_symbol);
        editor::change_call_symbol(&module.ko_file, &shim, &plain_symbol)
            .with_context(|| format!("Fail to change calls to {} in {}", plain_symbol, module.ko_file.display()))?;
        editor::strip_symbol(&module.ko_file, &shim)
            .context("Fail to restore origin function names")?;
    }

    relocations::adjust_relocations(config, &module, &obj_path, &mod_funcs)
        .map_err(|error| {
            debug!("Fail to adjust relocations: {:?}", error);
            error
        })?;

    fs::write(module_dir.join(FILE_ID), &module_id)?;

    Ok(module)
}

/// Identity blob `<name> <srcFile> <id> <comma-joined deps>`, written as a
/// sidecar and embedded into the module so the device can report what is
/// loaded.
pub fn write_note(config: &Config, module: &PatchModule) -> Result<()> {
    let module_dir = config.workdir.join(&module.name);
    let module_id = generate_module_id(config, &module.src_file)?;
    let deps = fs::read_lines(module_dir.join(DEPS)).join(",");

    let note = format!("{} {} {} {}", module.name, module.src_file, module_id, deps);
    let note_file = module_dir.join(NOTE_FILE);
    fs::write(&note_file, &note)?;

    editor::add_note_section(&module.ko_file, NOTE_SECTION, note.as_bytes())
        .context("Failed to add note information to module")
}

/// Drops workspace entries for files that left the change set. Without an
/// origin tree only the `id` survives so unchanged files stay skipped.
pub fn remove_old_modules(config: &Config, files: &[String]) {
    let only_valid = config.kern_src_install_dir.is_none();
    for module in patch_modules(config, only_valid) {
        if files.contains(&module.src_file) {
            continue;
        }
        let module_dir = config.workdir.join(&module.name);
        if config.kern_src_install_dir.is_none() {
            let entries = fs::read_dir(&module_dir).map(|dir| dir.flatten()).ok();
            for entry in entries.into_iter().flatten() {
                if entry.file_name() != FILE_ID {
                    let _ = fs::remove_file(entry.path());
                }
            }
        } else {
            let _ = fs::remove_dir_all(&module_dir);
        }
    }
}

/// Makes `isTraceable <obj> <fun>` scriptable: prints nothing, the exit
/// code is the answer.
pub fn is_traceable_command(obj_file: &Path, fun_name: &str) -> bool {
    matches!(trace::check_traceable(obj_file, fun_name), Ok((true, _)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_module_name_is_deterministic() {
        let name = generate_module_name("drivers/net/dummy-net.c");
        assert_eq!(name, generate_module_name("drivers/net/dummy-net.c"));
        assert!(name.starts_with(MODULE_PREFIX));
        assert!(name.ends_with("_dummy_net"));

        let sum = digest::crc32(b"drivers/net/dummy-net.c");
        assert_eq!(name, format!("deku_{}_dummy_net", sum));
    }

    #[test]
    fn test_generate_module_name_differs_per_path() {
        assert_ne!(
            generate_module_name("fs/open.c"),
            generate_module_name("fs/read_write.c")
        );
        // Same base name in different directories must not collide
        assert_ne!(
            generate_module_name("fs/ext4/super.c"),
            generate_module_name("fs/btrfs/super.c")
        );
    }

    #[test]
    fn test_patch_modules_validity() {
        let root = std::env::temp_dir().join("deku-module-store");
        let _ = std::fs::remove_dir_all(&root);
        for dir in ["build", "src", "workdir"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let config =
            Config::for_tests(&root.join("build"), &root.join("src"), &root.join("workdir"));

        // Valid module: path + id + ko
        let valid = config.workdir.join("deku_00000001_alpha");
        fs::create_dir_all(&valid).unwrap();
        fs::write(valid.join(FILE_SRC_PATH), "fs/alpha.c").unwrap();
        fs::write(valid.join(FILE_ID), "11112222").unwrap();
        fs::write(valid.join("deku_00000001_alpha.ko"), "elf").unwrap();
        fs::write(valid.join(DEPS), "deku_00000002_beta\n").unwrap();

        // Skipped module: id without ko
        let skipped = config.workdir.join("deku_00000002_beta");
        fs::create_dir_all(&skipped).unwrap();
        fs::write(skipped.join(FILE_SRC_PATH), "fs/beta.c").unwrap();
        fs::write(skipped.join(FILE_ID), "33334444").unwrap();

        let valid_modules = patch_modules(&config, true);
        assert_eq!(valid_modules.len(), 1);
        assert_eq!(valid_modules[0].src_file, "fs/alpha.c");
        assert_eq!(valid_modules[0].dependencies, vec!["deku_00000002_beta"]);

        let all_modules = patch_modules(&config, false);
        assert_eq!(all_modules.len(), 2);
    }

    #[test]
    fn test_remove_old_modules_keeps_id() {
        let root = std::env::temp_dir().join("deku-module-remove");
        let _ = std::fs::remove_dir_all(&root);
        for dir in ["build", "src", "workdir"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let config =
            Config::for_tests(&root.join("build"), &root.join("src"), &root.join("workdir"));

        let stale = config.workdir.join("deku_00000003_gamma");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join(FILE_SRC_PATH), "fs/gamma.c").unwrap();
        fs::write(stale.join(FILE_ID), "55556666").unwrap();
        fs::write(stale.join("deku_00000003_gamma.ko"), "elf").unwrap();

        remove_old_modules(&config, &["fs/other.c".to_string()]);

        assert!(fs::exists(stale.join(FILE_ID)));
        assert!(!fs::exists(stale.join("deku_00000003_gamma.ko")));
        assert!(!fs::exists(stale.join(FILE_SRC_PATH)));
    }
}
