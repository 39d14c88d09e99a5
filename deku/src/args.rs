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

use std::path::PathBuf;

use anyhow::Result;
use clap::{AppSettings, ColorChoice, Parser, Subcommand};

use deku_common::fs;

use super::{CLI_ABOUT, CLI_NAME, CLI_VERSION};

#[derive(Parser, Debug)]
#[clap(
    bin_name = CLI_NAME,
    version = CLI_VERSION,
    about = CLI_ABOUT,
    arg_required_else_help(true),
    color(ColorChoice::Never),
    disable_help_subcommand(true),
    global_setting(AppSettings::DeriveDisplayOrder),
    term_width(120),
)]
pub struct Arguments {
    /// Command name
    #[clap(subcommand)]
    pub command: SubCommand,

    /// Kernel build directory
    #[clap(short = 'b', long = "builddir")]
    pub build_dir: Option<PathBuf>,

    /// Kernel sources directory
    #[clap(short = 's', long = "sourcesdir")]
    pub sources_dir: Option<PathBuf>,

    /// Installed kernel sources directory used as the diff baseline
    #[clap(long = "src_inst_dir")]
    pub src_inst_dir: Option<PathBuf>,

    /// Working directory keeping generated modules between runs
    #[clap(short = 'w', long = "workdir")]
    pub workdir: Option<PathBuf>,

    /// How changes are delivered to the device
    #[clap(short = 'd', long = "deploytype", default_value = "ssh")]
    pub deploy_type: String,

    /// Target device: user@host[:port]
    #[clap(long)]
    pub target: Option<String>,

    /// Extra options passed to ssh/scp
    #[clap(long = "ssh_options", default_value = "", hide_default_value = true)]
    pub ssh_options: String,

    /// Chromebook board name (requires the CrOS SDK flow)
    #[clap(long)]
    pub board: Option<String>,

    /// CrOS SDK path
    #[clap(short = 'c', long = "cros_sdk")]
    pub cros_sdk: Option<PathBuf>,

    /// Do not auto-detect the CrOS SDK environment
    #[clap(long = "ignore_cros")]
    pub ignore_cros: bool,

    /// Provide more detailed info
    #[clap(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCommand {
    /// Generate livepatch modules for local changes
    Build,
    /// Build and apply changes on the target device
    Deploy,
    /// Synchronize the workspace with the current kernel build
    Sync,
    /// Print the file name without its extension
    #[clap(name = "filenameNoExt", hide = true)]
    FilenameNoExt { path: String },
    /// Print the generated module name for a source file
    #[clap(name = "generateModuleName", hide = true)]
    GenerateModuleName { path: String },
    /// Exit with 0 iff the function can be livepatched in place
    #[clap(name = "isTraceable", hide = true)]
    IsTraceable { obj_file: PathBuf, fun_name: String },
}

impl Arguments {
    pub fn new() -> Result<Self> {
        Self::parse().normalize_path()
    }

    fn normalize_path(mut self) -> Result<Self> {
        if let Some(dir) = &self.build_dir {
            self.build_dir = Some(fs::normalize(dir)?);
        }
        if let Some(dir) = &self.sources_dir {
            self.sources_dir = Some(fs::normalize(dir)?);
        }
        if let Some(dir) = &self.src_inst_dir {
            self.src_inst_dir = Some(fs::normalize(dir)?);
        }
        if let Some(dir) = &self.workdir {
            self.workdir = Some(fs::normalize(dir)?);
        }
        if let Some(dir) = &self.cros_sdk {
            self.cros_sdk = Some(fs::normalize(dir)?);
        }

        Ok(self)
    }
}
