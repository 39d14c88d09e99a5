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
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use deku_common::{digest, fs};

use crate::args::Arguments;
use crate::error::DekuError;
use crate::kbuild;

const MIN_KERNEL_VERSION: (u64, u64) = (5, 4);

/// Resolved and validated run parameters; immutable once built.
#[derive(Debug, Clone)]
pub struct Config {
    pub build_dir: PathBuf,
    pub source_dir: PathBuf,
    pub workdir: PathBuf,
    pub modules_dir: PathBuf,
    pub linux_headers_dir: PathBuf,
    pub system_map: PathBuf,
    pub kern_src_install_dir: Option<PathBuf>,
    pub deploy_type: String,
    pub deploy_params: String,
    pub ssh_options: String,
    pub use_llvm: bool,
    pub kernel_version: u64,
}

impl Config {
    pub fn new(args: &Arguments) -> Result<Self> {
        if args.board.is_some() || args.cros_sdk.is_some() {
            return Err(DekuError::InvalidParameters).context(
                "Building for a Chromebook requires the CrOS SDK flow, which this tool does not provide",
            );
        }

        let build_dir = args
            .build_dir
            .clone()
            .ok_or(DekuError::NoBuildDir)
            .context("Please specify the kernel build directory using -b or --builddir parameter")?;

        let workdir = resolve_workdir(args)?;

        let source_dir = match &args.sources_dir {
            Some(source_dir) => {
                if !Self::is_kernel_sources_dir(source_dir) {
                    return Err(DekuError::InvalidKernSrcDir).with_context(|| {
                        format!(
                            "Given source directory is not a valid kernel source directory: \"{}\"",
                            source_dir.display()
                        )
                    });
                }
                source_dir.clone()
            }
            None => {
                let link = build_dir.join("source");
                match fs::read_link(&link) {
                    Ok(_) => link,
                    Err(_) => build_dir.clone(),
                }
            }
        };

        debug!("Source dir: {}", source_dir.display());
        debug!("Build dir: {}", build_dir.display());
        debug!("Workdir: {}", workdir.display());

        fs::create_dir_all(&workdir)
            .with_context(|| format!("Failed to create directory {}", workdir.display()))?;

        if !Self::is_kernel_build_dir(&build_dir) {
            return Err(DekuError::InvalidBuildDir).with_context(|| {
                format!(
                    "Given directory is not a valid kernel build directory: \"{}\"",
                    build_dir.display()
                )
            });
        }

        if !kbuild::is_klp_enabled(&build_dir) {
            return Err(DekuError::KlpIsNotEnabled).context(
                "Kernel livepatching is not enabled. Please enable CONFIG_LIVEPATCH flag and rebuild the kernel",
            );
        }

        let release = kbuild::kernel_release(&build_dir)
            .context("Can't read the kernel release version from the build directory")?;
        let kernel_version = kbuild::release_version_num(&release)?;
        let min_version = kbuild::version_num(MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1, 0);
        if kernel_version < min_version {
            anyhow::bail!(
                "Kernel version: {} is not supported. Minimum supported kernel version: {}.{}",
                release,
                MIN_KERNEL_VERSION.0,
                MIN_KERNEL_VERSION.1
            );
        }

        Ok(Self {
            system_map: build_dir.join("System.map"),
            linux_headers_dir: build_dir.clone(),
            modules_dir: build_dir.clone(),
            source_dir,
            workdir,
            kern_src_install_dir: args.src_inst_dir.clone(),
            deploy_type: args.deploy_type.clone(),
            deploy_params: args.target.clone().unwrap_or_default(),
            ssh_options: args.ssh_options.clone(),
            use_llvm: kbuild::is_llvm_used(&build_dir),
            kernel_version,
            build_dir,
        })
    }

    fn is_kernel_sources_dir<P: AsRef<Path>>(path: P) -> bool {
        ["Kbuild", "Kconfig", "Makefile"]
            .iter()
            .all(|file| fs::exists(path.as_ref().join(file)))
    }

    fn is_kernel_build_dir<P: AsRef<Path>>(path: P) -> bool {
        [
            "vmlinux",
            "System.map",
            "Makefile",
            ".config",
            "include/generated/uapi/linux/version.h",
        ]
        .iter()
        .all(|file| fs::exists(path.as_ref().join(file)))
    }

    #[cfg(test)]
    pub fn for_tests(build_dir: &Path, source_dir: &Path, workdir: &Path) -> Self {
        Self {
            build_dir: build_dir.to_path_buf(),
            source_dir: source_dir.to_path_buf(),
            workdir: workdir.to_path_buf(),
            modules_dir: build_dir.to_path_buf(),
            linux_headers_dir: build_dir.to_path_buf(),
            system_map: build_dir.join("System.map"),
            kern_src_install_dir: None,
            deploy_type: "ssh".to_string(),
            deploy_params: String::new(),
            ssh_options: String::new(),
            use_llvm: false,
            kernel_version: kbuild::version_num(5, 15, 0),
        }
    }
}

/// The working directory, defaulting to a stable per-binary-location name
/// so independent checkouts get independent workspaces.
pub fn resolve_workdir(args: &Arguments) -> Result<PathBuf> {
    if let Some(workdir) = &args.workdir {
        return Ok(workdir.clone());
    }
    let exe = env::current_exe()?;
    let sum = digest::crc32(exe.to_string_lossy().as_bytes());
    Ok(env::current_dir()?.join(format!("workdir_{}", sum)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_dir_checks() {
        let root = std::env::temp_dir().join("deku-config-dirs");
        let _ = std::fs::remove_dir_all(&root);

        let sources = root.join("sources");
        fs::create_dir_all(&sources).unwrap();
        assert!(!Config::is_kernel_sources_dir(&sources));
        for file in ["Kbuild", "Kconfig", "Makefile"] {
            fs::write(sources.join(file), "").unwrap();
        }
        assert!(Config::is_kernel_sources_dir(&sources));

        let build = root.join("build");
        fs::create_dir_all(build.join("include/generated/uapi/linux")).unwrap();
        assert!(!Config::is_kernel_build_dir(&build));
        for file in ["vmlinux", "System.map", "Makefile", ".config"] {
            fs::write(build.join(file), "").unwrap();
        }
        fs::write(build.join("include/generated/uapi/linux/version.h"), "").unwrap();
        assert!(Config::is_kernel_build_dir(&build));
    }
}
