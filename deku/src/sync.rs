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

use std::env;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use deku_common::{digest, fs};

use crate::config::Config;
use crate::kbuild;
use crate::module::MODULE_PREFIX;
use crate::owner::{self, SYMBOLS_DIR};

pub const WORKDIR_CONFIG: &str = "config";

/// Identity of the workspace: which kernel build and which deku binary
/// produced its contents.
#[derive(Debug, Serialize, Deserialize)]
struct WorkdirConfig {
    version: String,
    hash: String,
}

/// MD5 of the running executable; workspaces survive rebuilds of the tool
/// only when the binary is bit-identical.
fn self_hash() -> Result<String> {
    let exe = env::current_exe()?;
    Ok(digest::md5_file(exe)?)
}

fn is_workdir_fresh(config: &Config) -> bool {
    let config_file = config.workdir.join(WORKDIR_CONFIG);
    let workdir_config: WorkdirConfig = match fs::read(&config_file)
        .ok()
        .and_then(|content| serde_json::from_slice(&content).ok())
    {
        Some(workdir_config) => workdir_config,
        None => {
            debug!("Workdir config is missing or unreadable");
            return false;
        }
    };

    if Some(workdir_config.version) != kbuild::kernel_version(&config.build_dir) {
        return false;
    }

    if let Some(origin_dir) = &config.kern_src_install_dir {
        let origin_time = fs::modified_time(origin_dir).ok();
        let config_time = fs::modified_time(&config_file).ok();
        if origin_time.is_none() || origin_time != config_time {
            return false;
        }
    }

    match self_hash() {
        Ok(hash) => workdir_config.hash == hash,
        Err(_) => false,
    }
}

/// Revalidates the workspace against the current kernel build and the
/// running binary; any mismatch rebuilds it from scratch.
pub fn check_workdir(config: &Config) -> Result<()> {
    if is_workdir_fresh(config) {
        return Ok(());
    }
    synchronize(config)
}

fn regenerate_symbols(config: &Config) -> Result<()> {
    let symbols_dir = config.workdir.join(SYMBOLS_DIR);
    let cached = fs::list_files(&symbols_dir, fs::TraverseOptions { recursive: true })
        .unwrap_or_default();

    let _ = fs::remove_dir_all(&symbols_dir);
    fs::create_dir_all(&symbols_dir)?;

    for file in cached {
        let ko_file = match file.strip_prefix(&symbols_dir) {
            Ok(rel) => format!("{}.ko", rel.to_string_lossy()),
            Err(_) => continue,
        };
        owner::generate_symbols(config, &ko_file);
    }
    Ok(())
}

/// The git baseline in the workdir is what `diff --function-context`
/// reports against when no installed source tree exists.
fn snapshot_sources(config: &Config) {
    use deku_common::process::Command;

    let git_dir = config.workdir.join(".git");
    if !fs::exists(&git_dir) {
        let _ = Command::new("git")
            .arg(format!("--git-dir={}", git_dir.display()))
            .arg("init")
            .arg("--quiet")
            .run();
    }
    let _ = Command::new("git")
        .arg(format!("--work-tree={}", config.source_dir.display()))
        .arg(format!("--git-dir={}", git_dir.display()))
        .arg("add")
        .arg(config.source_dir.join("*"))
        .run();
}

/// Drops every generated module and re-stamps the workspace for the
/// current kernel build.
pub fn synchronize(config: &Config) -> Result<()> {
    info!("Synchronize...");

    let modules = fs::list_dirs(&config.workdir, fs::TraverseOptions { recursive: false })
        .unwrap_or_default();
    for module_dir in modules {
        let name = fs::file_name(&module_dir).to_string_lossy().into_owned();
        if !name.starts_with(MODULE_PREFIX) {
            continue;
        }
        debug!("Remove {}", module_dir.display());
        fs::remove_dir_all(&module_dir)
            .with_context(|| format!("Can't remove {}", module_dir.display()))?;
    }

    let workdir_config = WorkdirConfig {
        version: kbuild::kernel_version(&config.build_dir).unwrap_or_default(),
        hash: self_hash()?,
    };
    let config_file = config.workdir.join(WORKDIR_CONFIG);
    fs::write(&config_file, serde_json::to_vec(&workdir_config)?)?;

    regenerate_symbols(config)?;

    match &config.kern_src_install_dir {
        None => snapshot_sources(config),
        Some(origin_dir) => {
            // Stamp the config with the origin tree so a reinstalled kernel
            // invalidates the workspace.
            let origin_time = fs::modified_time(origin_dir)?;
            fs::set_modified_time(&config_file, origin_time)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(name: &str) -> Config {
        let root = std::env::temp_dir().join("deku-sync").join(name);
        let _ = std::fs::remove_dir_all(&root);
        for dir in ["build/include/generated", "src", "workdir"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(
            root.join("build/include/generated/compile.h"),
            "#define UTS_VERSION \"#7 SMP Tue Feb 6 21:20:00 UTC 2024\"\n",
        )
        .unwrap();
        Config::for_tests(&root.join("build"), &root.join("src"), &root.join("workdir"))
    }

    #[test]
    fn test_synchronize_removes_modules_and_stamps_config() {
        let config = setup("stamp");

        let module_dir = config.workdir.join("deku_00000009_old");
        fs::create_dir_all(&module_dir).unwrap();
        fs::write(module_dir.join("id"), "stale").unwrap();

        synchronize(&config).unwrap();

        assert!(!fs::exists(&module_dir));
        let content = fs::read(config.workdir.join(WORKDIR_CONFIG)).unwrap();
        let workdir_config: WorkdirConfig = serde_json::from_slice(&content).unwrap();
        assert_eq!(
            workdir_config.version,
            "#7 SMP Tue Feb 6 21:20:00 UTC 2024"
        );
        assert_eq!(workdir_config.hash, self_hash().unwrap());
    }

    #[test]
    fn test_fresh_workdir_is_accepted() {
        let config = setup("fresh");
        synchronize(&config).unwrap();
        assert!(is_workdir_fresh(&config));
    }

    #[test]
    fn test_stale_version_invalidates_workdir() {
        let config = setup("stale-version");
        synchronize(&config).unwrap();

        fs::write(
            config.build_dir.join("include/generated/compile.h"),
            "#define UTS_VERSION \"#8 SMP Wed Feb 7 09:00:00 UTC 2024\"\n",
        )
        .unwrap();
        assert!(!is_workdir_fresh(&config));
    }

    #[test]
    fn test_missing_config_invalidates_workdir() {
        let config = setup("missing-config");
        assert!(!is_workdir_fresh(&config));
    }
}
