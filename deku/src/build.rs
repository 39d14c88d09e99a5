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
use std::thread;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use deku_common::fs;

use crate::changes;
use crate::config::Config;
use crate::error::DekuError;
use crate::module::{self, PatchModule, FILE_ID, MISS_SYM};

/// Builds a livepatch module for every modified source file.
///
/// Pass 1 fans out one worker per file; workers own disjoint module
/// directories so the only synchronization is the join barrier. Modules
/// that recorded missing cross-module symbols are retried sequentially in
/// pass 2, when every sibling module exists.
pub fn build(config: &Config) -> Result<Vec<PatchModule>> {
    let files = changes::modified_files(config)?;

    module::remove_old_modules(config, &files);

    if files.is_empty() {
        info!("No change detected in the source code");
        return Ok(Vec::new());
    }

    for file in &files {
        if Path::new(file).extension().map(|ext| ext == "c") == Some(true) {
            continue;
        }
        warn!(
            "Detected changes in {}. Only changes to '.c' files are supported.",
            file
        );
        if config.kern_src_install_dir.is_some() {
            warn!("Undo changes in {} and try again.", file);
            return Err(DekuError::UnsupportedChanges.into());
        }
        warn!("Rebuild the kernel to suppress this warning.");
    }

    let results: Vec<(String, Result<PatchModule>)> = thread::scope(|scope| {
        let workers = files
            .iter()
            .map(|file| {
                let worker = scope.spawn(move || module::generate_module(config, file));
                (file.clone(), worker)
            })
            .collect::<Vec<_>>();

        workers
            .into_iter()
            .map(|(file, worker)| {
                let result = worker
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("Worker thread panicked")));
                (file, result)
            })
            .collect()
    });

    let mut modules = Vec::new();
    for (file, result) in results {
        match result {
            Ok(module) => modules.push(module),
            Err(error) => {
                let name = module::generate_module_name(&file);
                let module_dir = config.workdir.join(&name);
                if fs::exists(module_dir.join(MISS_SYM)) {
                    // Recoverable: retried below once every module exists
                    modules.push(PatchModule {
                        name: String::new(),
                        src_file: file,
                        ko_file: module_dir.join(format!("{}.ko", name)),
                        dependencies: Vec::new(),
                    });
                    continue;
                }
                return Err(error.context(format!("Failed to process {}", file)));
            }
        }
    }

    // Second pass for modules missing symbols from sibling patch modules
    for module in &mut modules {
        if module.is_valid() {
            continue;
        }
        let module_dir = module.ko_file.parent().unwrap_or_else(|| Path::new(""));
        if !fs::exists(module_dir.join(MISS_SYM)) {
            continue;
        }
        let _ = fs::remove_file(module_dir.join(FILE_ID));
        *module = module::generate_module(config, &module.src_file)
            .with_context(|| format!("Failed to process {}", module.src_file))?;
    }

    let mut result = Vec::new();
    for module in modules.into_iter().filter(PatchModule::is_valid) {
        match module::write_note(config, &module) {
            Ok(()) => result.push(module),
            Err(error) => error!("{:?}", error),
        }
    }

    if result.is_empty() {
        info!("No valid changes detected since last run");
    }

    Ok(result)
}
