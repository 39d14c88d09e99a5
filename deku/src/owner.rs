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
use log::debug;

use deku_common::fs;

use crate::config::Config;
use crate::elf::read::Elf;
use crate::error::DekuError;

pub const VMLINUX: &str = "vmlinux";
pub const SYMBOLS_DIR: &str = "symbols";

/// The object a source file is linked into: `"vmlinux"` for built-in code,
/// else the module path relative to the modules directory.
///
/// `.built-in.a.cmd` files witness built-in objects; module ownership is
/// cross-checked against `modules.order` and the module's `.mod` file list.
/// The search climbs towards the tree root so files compiled from a
/// subdirectory still find the archive or module assembled above them.
pub fn find_object_file(config: &Config, src_file: &str) -> Result<String> {
    let obj_file = Path::new(src_file)
        .with_extension("o")
        .to_string_lossy()
        .into_owned();
    let base_name = fs::file_name(&obj_file).to_string_lossy().into_owned();

    let mut dir = Path::new(src_file)
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .to_path_buf();
    loop {
        let built_in_cmd = config.build_dir.join(&dir).join(".built-in.a.cmd");
        if let Ok(content) = fs::read_to_string(&built_in_cmd) {
            if content.contains(&obj_file) || content.contains(&format!(" {} ", base_name)) {
                return Ok(VMLINUX.to_string());
            }
        }

        let ko_files = fs::list_files_by_ext(
            config.modules_dir.join(&dir),
            "ko",
            fs::TraverseOptions { recursive: false },
        )
        .unwrap_or_default();
        for ko_file in ko_files {
            let ko_rel = match ko_file.strip_prefix(&config.modules_dir) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let ko_dir = Path::new(&ko_rel)
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .to_path_buf();

            let order = config.modules_dir.join(&ko_dir).join("modules.order");
            match fs::read_to_string(order) {
                Ok(content) if content.contains(&ko_rel) => {}
                _ => continue,
            }

            let mod_file = config
                .modules_dir
                .join(&ko_dir)
                .join(format!("{}.mod", fs::file_stem(&ko_rel)));
            if let Ok(content) = fs::read_to_string(mod_file) {
                if content.contains(&obj_file) {
                    return Ok(ko_rel);
                }
            }
        }

        dir = match dir.parent() {
            Some(parent) => parent.to_path_buf(),
            None => break,
        };
    }

    Err(DekuError::CantFindObj)
        .with_context(|| format!("Can't find owner object for {}", src_file))
}

fn symbols_cache_path(config: &Config, ko_file: &str) -> PathBuf {
    let dir = Path::new(ko_file).parent().unwrap_or_else(|| Path::new(""));
    config
        .workdir
        .join(SYMBOLS_DIR)
        .join(dir)
        .join(fs::file_stem(ko_file))
}

/// Fills the symbol-index cache entry for a module. Returns false when the
/// module is not part of the current kernel configuration or its symbols
/// cannot be read; the caller skips such modules.
pub fn generate_symbols(config: &Config, ko_file: &str) -> bool {
    let out_file = symbols_cache_path(config, ko_file);
    if fs::exists(&out_file) {
        return true;
    }

    debug!("Generate symbols for: {}", ko_file);

    let ko_dir = Path::new(ko_file).parent().unwrap_or_else(|| Path::new(""));
    let order = config.modules_dir.join(ko_dir).join("modules.order");
    let modules = match fs::read_to_string(order) {
        Ok(content) => content,
        Err(_) => {
            debug!("Can't find modules.order file");
            return false;
        }
    };
    if !modules.contains(ko_file) {
        debug!(
            "The module {} file is not enabled in the current kernel configuration",
            ko_file
        );
        return false;
    }

    let out_dir = out_file.parent().unwrap_or_else(|| Path::new(""));
    if let Err(e) = fs::create_dir_all(out_dir) {
        debug!("Can't create symbol dir: {}\n{}", out_dir.display(), e);
        return false;
    }

    let ko_path = config.modules_dir.join(ko_file);
    let symbols = match Elf::parse(&ko_path) {
        Ok(elf) => elf.defined_symbol_names(),
        Err(e) => {
            debug!("Fail to read symbols for: {}\n{}", ko_path.display(), e);
            return false;
        }
    };

    // Concurrent workers may race for the same entry; finish the write
    // under a temporary name and publish it atomically.
    let tmp_file = out_file.with_extension("tmp");
    if let Err(e) = fs::write(&tmp_file, symbols.join("\n")).and_then(|_| fs::rename(&tmp_file, &out_file)) {
        debug!("Fail to write symbols to file: {}\n{}", out_file.display(), e);
        return false;
    }

    true
}

fn cache_contains(path: &Path, sym_name: &str) -> bool {
    fs::read_lines(path).iter().any(|line| line == sym_name)
}

/// The object defining `sym_name`: the module owning the patched file, a
/// neighbouring module up to the nearest Kconfig boundary, or vmlinux via
/// System.map.
pub fn find_object_with_symbol(
    config: &Config,
    sym_name: &str,
    src_file: &str,
    obj_path: &str,
) -> Result<String> {
    debug!("Find object file for symbol: {} {}", sym_name, src_file);
    if obj_path == VMLINUX {
        return Ok(VMLINUX.to_string());
    }

    let same_module = symbols_cache_path(config, obj_path);
    if cache_contains(&same_module, sym_name) {
        debug!("Found in the same module: {}", obj_path);
        return Ok(obj_path.to_string());
    }

    let src_dir = Path::new(src_file).parent().unwrap_or_else(|| Path::new(""));
    let mut src_path = config.source_dir.join(src_dir);
    let mut modules_path = config.modules_dir.join(src_dir);
    loop {
        let modules = fs::read_lines(modules_path.join("modules.order"));
        if modules.is_empty() {
            break;
        }

        for module in &modules {
            if !generate_symbols(config, module) {
                continue;
            }
            let module_dir = Path::new(module).parent().unwrap_or_else(|| Path::new(""));
            let cache_dir = config.workdir.join(SYMBOLS_DIR).join(module_dir);
            let entries = fs::list_files(&cache_dir, fs::TraverseOptions { recursive: false })
                .with_context(|| format!("Fail to list files in: {}", cache_dir.display()))?;
            for entry in entries {
                if cache_contains(&entry, sym_name) {
                    let result = module_dir
                        .join(format!("{}.ko", fs::file_name(&entry).to_string_lossy()))
                        .to_string_lossy()
                        .into_owned();
                    debug!("Found in: {}", result);
                    return Ok(result);
                }
            }
        }

        if fs::exists(src_path.join("Kconfig")) {
            break;
        }
        src_path = match src_path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => break,
        };
        modules_path = match modules_path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => break,
        };
        if modules_path == config.modules_dir {
            break;
        }
    }

    let system_map = fs::read_to_string(&config.system_map).with_context(|| {
        format!("Fail to read System.map: {}", config.system_map.display())
    })?;
    let in_vmlinux = system_map.lines().any(|line| {
        line.split_whitespace()
            .nth(2)
            .map(|name| name == sym_name)
            .unwrap_or(false)
    });
    if in_vmlinux {
        debug!("Found in: vmlinux");
        return Ok(VMLINUX.to_string());
    }

    Err(DekuError::CantFindSymbol)
        .with_context(|| format!("Fail to find object file for symbol: {} {}", sym_name, src_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str) -> Config {
        let root = std::env::temp_dir().join("deku-owner").join(name);
        let _ = std::fs::remove_dir_all(&root);
        for dir in ["build", "src", "workdir"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        Config::for_tests(&root.join("build"), &root.join("src"), &root.join("workdir"))
    }

    #[test]
    fn test_built_in_object_owned_by_vmlinux() {
        let config = test_config("builtin");
        fs::create_dir_all(config.build_dir.join("fs")).unwrap();
        fs::write(
            config.build_dir.join("fs/.built-in.a.cmd"),
            "cmd_fs/built-in.a := ar cDPrST fs/built-in.a fs/open.o fs/read_write.o",
        )
        .unwrap();

        assert_eq!(find_object_file(&config, "fs/open.c").unwrap(), VMLINUX);
    }

    #[test]
    fn test_module_object_owned_by_ko() {
        let config = test_config("module");
        let dir = config.modules_dir.join("drivers/net");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("dummy.ko"), "not parsed here").unwrap();
        fs::write(dir.join("modules.order"), "drivers/net/dummy.ko\n").unwrap();
        fs::write(dir.join("dummy.mod"), "drivers/net/dummy.o\n").unwrap();

        assert_eq!(
            find_object_file(&config, "drivers/net/dummy.c").unwrap(),
            "drivers/net/dummy.ko"
        );
    }

    #[test]
    fn test_unknown_object_reports_cant_find_obj() {
        let config = test_config("unknown");
        let error = find_object_file(&config, "fs/nowhere.c").unwrap_err();
        assert_eq!(
            error.chain().find_map(|e| e.downcast_ref::<DekuError>()),
            Some(&DekuError::CantFindObj)
        );
    }

    #[test]
    fn test_symbol_found_in_same_module_cache() {
        let config = test_config("same-module");
        let cache_dir = config.workdir.join(SYMBOLS_DIR).join("drivers/net");
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(cache_dir.join("dummy"), "dummy_open\ndummy_xmit\n").unwrap();

        let owner = find_object_with_symbol(
            &config,
            "dummy_xmit",
            "drivers/net/dummy.c",
            "drivers/net/dummy.ko",
        )
        .unwrap();
        assert_eq!(owner, "drivers/net/dummy.ko");
    }

    #[test]
    fn test_symbol_resolved_through_system_map() {
        let config = test_config("system-map");
        fs::write(
            &config.system_map,
            "ffffffff81000000 T startup_64\nffffffff81001000 T printk_deferred\n",
        )
        .unwrap();

        let owner = find_object_with_symbol(
            &config,
            "printk_deferred",
            "drivers/net/dummy.c",
            "drivers/net/dummy.ko",
        )
        .unwrap();
        assert_eq!(owner, VMLINUX);
    }
}
