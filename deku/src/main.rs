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

use std::process;

use anyhow::{Context, Result};
use flexi_logger::{
    DeferredNow, Duplicate, FileSpec, LogSpecification, Logger, LoggerHandle, WriteMode,
};
use log::{error, LevelFilter, Record};

use deku_common::{fs, os};

mod args;
mod build;
mod changes;
mod config;
mod deploy;
mod diff;
mod elf;
mod error;
mod kbuild;
mod livepatch;
mod module;
mod owner;
mod relocations;
mod ssh;
mod sync;
mod sympos;
mod trace;

use args::{Arguments, SubCommand};
use config::Config;
use error::DekuError;

const CLI_NAME: &str = "deku";
const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");
const CLI_ABOUT: &str = env!("CARGO_PKG_DESCRIPTION");
const CLI_UMASK: u32 = 0o022;

const LOG_FILE_NAME: &str = "deku";

struct Deku {
    args: Arguments,
    logger: LoggerHandle,
}

impl Deku {
    fn format_log(
        w: &mut dyn std::io::Write,
        _now: &mut DeferredNow,
        record: &Record,
    ) -> std::io::Result<()> {
        write!(w, "{}", &record.args())
    }

    fn new(args: Arguments) -> Result<Self> {
        os::umask::set_umask(CLI_UMASK);

        let workdir = config::resolve_workdir(&args)?;
        fs::create_dir_all(&workdir)?;

        let log_level_stdout = match args.verbose {
            false => LevelFilter::Info,
            true => LevelFilter::Debug,
        };
        let log_spec = LogSpecification::builder()
            .default(LevelFilter::Trace)
            .build();
        let file_spec = FileSpec::default()
            .directory(&workdir)
            .basename(LOG_FILE_NAME)
            .use_timestamp(false);

        let logger = Logger::with(log_spec)
            .log_to_file(file_spec)
            .duplicate_to_stdout(Duplicate::from(log_level_stdout))
            .format(Self::format_log)
            .write_mode(WriteMode::Direct)
            .start()
            .context("Failed to initialize logger")?;

        ctrlc::set_handler(|| {
            eprintln!("Interrupt");
        })
        .context("Failed to initialize signal handler")?;

        Ok(Self { args, logger })
    }

    fn run(&self) -> Result<()> {
        let config = Config::new(&self.args)?;

        sync::check_workdir(&config)?;

        match &self.args.command {
            SubCommand::Build => build::build(&config).map(|_| ()),
            SubCommand::Deploy => deploy::deploy(&config),
            SubCommand::Sync => sync::synchronize(&config),
            _ => unreachable!("Utility subcommands are handled before startup"),
        }
    }
}

impl Drop for Deku {
    fn drop(&mut self) {
        self.logger.flush();
        self.logger.shutdown();
    }
}

fn main() {
    let args = match Arguments::new() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(DekuError::InvalidParameters.exit_code());
        }
    };

    // Helpers for scripts: no config, no logger
    match &args.command {
        SubCommand::FilenameNoExt { path } => {
            print!("{}", fs::file_stem(path));
            return;
        }
        SubCommand::GenerateModuleName { path } => {
            print!("{}", module::generate_module_name(path));
            return;
        }
        SubCommand::IsTraceable { obj_file, fun_name } => {
            match module::is_traceable_command(obj_file, fun_name) {
                true => process::exit(0),
                false => process::exit(1),
            }
        }
        _ => {}
    }

    let deku = match Deku::new(args) {
        Ok(deku) => deku,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = deku.run() {
        error!("Error: {:?}", e);

        let exit_code = DekuError::code_of(&e);
        drop(deku);
        process::exit(exit_code);
    }
}
