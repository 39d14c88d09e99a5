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

use anyhow::{Context, Result};
use log::{debug, info, warn};

use deku_common::fs;

use crate::build;
use crate::config::Config;
use crate::error::DekuError;
use crate::kbuild;
use crate::module::{self, PatchModule, FILE_ID};
use crate::ssh;

/// The device must run the exact kernel the workspace was built against.
fn check_kernels(config: &Config) -> Result<bool> {
    let remote_release = ssh::remote_kernel_release(config)
        .context("Fail to fetch the kernel release information from the device")?;
    let remote_version = ssh::remote_kernel_version(config)
        .context("Fail to fetch the kernel version from the device")?;

    let local_release = kbuild::kernel_release(&config.build_dir).unwrap_or_default();
    let local_version = kbuild::kernel_version(&config.build_dir).unwrap_or_default();

    if remote_release.contains(&local_release) && remote_version.contains(&local_version) {
        return Ok(true);
    }

    warn!("The kernel on the device is outdated!");
    info!("Kernel on the device: {} {}", remote_release, remote_version);
    info!("Local built kernel:   {} {}", local_release, local_version);
    Ok(false)
}

/// Dependency-first for loading, reverse for unloading. The two-pass build
/// keeps dependency chains flat: a module's dependencies never have
/// dependencies of their own, so grouping by "has dependencies" is a
/// topological order.
fn sort_modules(modules: &mut [PatchModule], dep_first: bool) {
    modules.sort_by_key(|module| {
        let has_deps = !module.dependencies.is_empty();
        has_deps == dep_first
    });
}

/// A loaded note line: `<name> <srcFile> <id> <comma-joined deps>`.
fn parse_note(line: &str) -> Option<(String, String, String, Vec<String>)> {
    let mut fields = line.split(' ');
    let name = fields.next()?.to_string();
    let src_file = fields.next()?.to_string();
    let id = fields.next()?.to_string();
    let dependencies = fields
        .next()
        .unwrap_or_default()
        .split(',')
        .filter(|dep| !dep.is_empty())
        .map(String::from)
        .collect();

    Some((name, src_file, id, dependencies))
}

pub fn deploy(config: &Config) -> Result<()> {
    if config.deploy_type.is_empty() || config.deploy_params.is_empty() {
        return Err(DekuError::InvalidParameters).context(
            "Please specify SSH connection parameters to the target device using: --target=<user@host[:port]> parameter",
        );
    }
    if config.deploy_type != "ssh" {
        return Err(DekuError::InvalidParameters)
            .with_context(|| format!("Unknown deploy type '{}'", config.deploy_type));
    }

    if !check_kernels(config)? {
        warn!("Please install the current built kernel on the device");
        return Ok(());
    }

    build::build(config)?;

    let modules_on_device = ssh::loaded_modules(config)?;
    debug!("Modules on the device {:?}", modules_on_device);

    let mut modules_to_unload = Vec::new();
    for remote in &modules_on_device {
        let (name, src_file, _, dependencies) = match parse_note(remote) {
            Some(parsed) => parsed,
            None => continue,
        };
        let ko_file = config.workdir.join(&name).join(format!("{}.ko", name));
        if !fs::exists(&ko_file) {
            info!("Revert changes on the device for {}", src_file);
            modules_to_unload.push(PatchModule {
                name,
                src_file,
                ko_file,
                dependencies,
            });
        }
    }

    let mut local_modules = module::patch_modules(config, true);
    sort_modules(&mut local_modules, true);
    sort_modules(&mut modules_to_unload, false);
    debug!("Local modules: {:?}", local_modules);

    let mut modules_to_load = Vec::new();
    for local in local_modules {
        let loaded = modules_on_device.iter().any(|remote| {
            match parse_note(remote) {
                Some((name, _, remote_id, _)) if name == local.name => {
                    let id_file = config.workdir.join(&name).join(FILE_ID);
                    fs::read_lines(id_file).first().map(String::as_str)
                        == Some(&remote_id[..remote_id.len().min(8)])
                }
                _ => false,
            }
        });
        if !loaded {
            modules_to_load.push(local);
        }
    }

    if modules_to_load.is_empty() && modules_to_unload.is_empty() {
        info!("No changes need to be made to the device");
        return Ok(());
    }

    ssh::upload_and_load_modules(config, &modules_to_load, &modules_to_unload)
}
