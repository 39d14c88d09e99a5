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

use std::fmt::Write;
use std::path::PathBuf;

use anyhow::Result;
use log::debug;

use deku_common::{fs, process::Command};

use crate::config::Config;
use crate::error::DekuError;
use crate::kbuild;
use crate::module::{PatchModule, FILE_OBJECT_PATH, FILE_SRC_PATH};

pub const DEKU_RELOAD_SCRIPT: &str = "deku_reload.sh";

/// Upload destination on the device, relative to the login directory.
pub const REMOTE_DIR: &str = "deku";

pub struct RemoteOutput {
    pub output: String,
    pub exit_code: i32,
}

impl RemoteOutput {
    pub fn exit_ok(&self) -> Result<()> {
        if self.exit_code == 0 {
            return Ok(());
        }
        match DekuError::from_exit_code(self.exit_code) {
            Some(error) => Err(error.into()),
            None => anyhow::bail!("Remote command exited with code {}", self.exit_code),
        }
    }
}

/// Common ssh/scp argument list: connection multiplexing over a per-target
/// control socket, user options, port and destination.
fn remote_parameters(config: &Config, for_ssh: bool) -> Vec<String> {
    let mut host = config.deploy_params.as_str();
    if let Some((_, rest)) = host.split_once('@') {
        host = rest;
    }
    let host = host.split(':').next().unwrap_or_default();

    let mut args = vec![
        "-o".to_string(),
        "ControlMaster=auto".to_string(),
        "-o".to_string(),
        "ControlPersist=300".to_string(),
    ];
    args.extend(
        config
            .ssh_options
            .split_whitespace()
            .map(String::from),
    );

    let mut target = config
        .deploy_params
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    let mut port = String::new();
    if let Some((dest, found_port)) = target.clone().split_once(':') {
        port = found_port.to_string();
        target = dest.to_string();
        args.push(if for_ssh { "-p" } else { "-P" }.to_string());
        args.push(port.clone());
    }

    args.push("-o".to_string());
    args.push(format!("ControlPath=/tmp/ssh-deku-{}{}", host, port));
    args.push(target);
    args
}

pub fn run_ssh_command(config: &Config, command: &str) -> Result<RemoteOutput> {
    let output = Command::new("ssh")
        .args(remote_parameters(config, true))
        .arg(command)
        .run_with_output()?;

    let combined = output.combined().to_string_lossy().into_owned();
    debug!("ssh {}\n{}", command, combined);

    Ok(RemoteOutput {
        output: combined.trim_end_matches('\n').to_string(),
        exit_code: output.status.exit_code(),
    })
}

pub fn upload_files(config: &Config, files: &[PathBuf]) -> Result<()> {
    let mut params = remote_parameters(config, false);
    let host = params.pop().unwrap_or_default();

    Command::new("scp")
        .args(params)
        .args(files)
        .arg(format!("{}:{}/", host, REMOTE_DIR))
        .run_with_output()?
        .status
        .exit_ok()
}

pub fn remote_kernel_release(config: &Config) -> Result<String> {
    Ok(run_ssh_command(config, "uname --kernel-release")?.output)
}

pub fn remote_kernel_version(config: &Config) -> Result<String> {
    Ok(run_ssh_command(config, "uname --kernel-version")?.output)
}

/// Identity notes of every loaded deku module, one line per module.
pub fn loaded_modules(config: &Config) -> Result<Vec<String>> {
    let result = run_ssh_command(
        config,
        r"find /sys/module -name .note.deku -type f -exec cat {} \; | grep -a deku_ 2>/dev/null",
    )?;
    if result.output.is_empty() {
        return Ok(Vec::new());
    }
    Ok(result.output.lines().map(String::from).collect())
}

/// The shell script applied on the device: disable and remove the previous
/// patch generation, then insert the new modules and wait out the livepatch
/// transitions, all with bounded retries.
pub fn generate_load_script(
    config: &Config,
    modules_to_load: &[PatchModule],
    modules_to_unload: &[PatchModule],
) -> Result<PathBuf> {
    // Patch transition cannot be observed reliably before 5.10
    let check_transition = config.kernel_version >= kbuild::version_num(5, 10, 0);

    let mut script = String::new();
    script.push_str("INSMOD=insmod\n");
    script.push_str("RMMOD=rmmod\n");
    script.push_str("if [ ! -z \"$EUID\" ] && [ \"$EUID\" -ne 0 ]; then\n");
    script.push_str("\tINSMOD=\"sudo insmod\"\n");
    script.push_str("\tRMMOD=\"sudo rmmod\"\n");
    script.push_str("fi\n");

    for module in modules_to_load {
        let module_dir = config.workdir.join(&module.name);
        let obj_file = fs::read_to_string(module_dir.join(FILE_OBJECT_PATH)).unwrap_or_default();
        if !obj_file.ends_with(".ko") {
            continue;
        }
        let src_file = fs::read_to_string(module_dir.join(FILE_SRC_PATH)).unwrap_or_default();
        let mod_dep = fs::file_stem(&obj_file);
        writeln!(script, "\ngrep -q '\\b{}\\b' /proc/modules", mod_dep)?;
        script.push_str("if [ $? != 0 ]; then\n");
        writeln!(
            script,
            "\techo \"Can't apply changes for {} because the '{}' module is not loaded\"",
            src_file, mod_dep
        )?;
        writeln!(
            script,
            "\texit {}",
            DekuError::DependModuleNotLoaded.exit_code()
        )?;
        script.push_str("fi\n");
    }

    let mut unload = String::new();
    let mut checkmod = String::new();
    for module in modules_to_load.iter().chain(modules_to_unload) {
        let module_name = module.name.replace('-', "_");
        let module_sys = format!("/sys/kernel/livepatch/{}", module_name);

        checkmod.push_str(&format!("[ ! -d {} ] || \\", module_sys));

        writeln!(script, "[ -d {} ] && echo 0 > {}/enabled", module_sys, module_sys)?;

        unload.push_str("for i in $(seq 1 150); do\n");
        writeln!(unload, "\t[ ! -d {} ] && break", module_sys)?;
        writeln!(unload, "\t[ $(cat {}/transition) = \"0\" ] && break", module_sys)?;
        writeln!(
            unload,
            "\t[ $(($i%25)) = 0 ] && echo \"Undoing previous changes made to {} is still in progress ...\"",
            module.src_file
        )?;
        unload.push_str("\tsleep 0.2\ndone\n");

        writeln!(
            unload,
            "[ -d /sys/module/{} ] && $RMMOD {}",
            module_name, module_name
        )?;

        unload.push_str("for i in $(seq 1 250); do\n");
        writeln!(unload, "\t[ ! -d {} ] && break", module_sys)?;
        writeln!(
            unload,
            "\t[ $(($i%25)) = 0 ] && echo \"Cleaning up after previous changes to {} is still in progress...\"",
            module.src_file
        )?;
        unload.push_str("\tsleep 0.2\ndone\n");
    }

    let mut insmod = String::new();
    for module in modules_to_load {
        let module_name = module.name.replace('-', "_");
        let module_sys = format!("/sys/kernel/livepatch/{}", module_name);
        let load_error = DekuError::LoadModule.exit_code();

        writeln!(insmod, "module={}", module.name)?;
        writeln!(insmod, "res=$($INSMOD {}/$module.ko 2>&1)", REMOTE_DIR)?;
        insmod.push_str("if [ $? != 0 ]; then\n");
        writeln!(
            insmod,
            "\techo \"Failed to load changes for {}. Reason: $res\"",
            module.src_file
        )?;
        writeln!(insmod, "\texit {}", load_error)?;
        insmod.push_str("fi\n");
        insmod.push_str("for i in $(seq 1 50); do\n");
        writeln!(insmod, "\tgrep -q {} /proc/modules && break", module_name)?;
        writeln!(
            insmod,
            "\t[ $? -ne 0 ] && {{ echo \"Failed to load module {}\"; exit {}; }}",
            module_name, load_error
        )?;
        writeln!(insmod, "\techo \"{} module is still loading...\"", module_name)?;
        insmod.push_str("\tsleep 0.2\ndone\n");
        if check_transition {
            insmod.push_str("for i in $(seq 1 150); do\n");
            writeln!(insmod, "\t[ $(cat {}/transition) = \"0\" ] && break", module_sys)?;
            writeln!(
                insmod,
                "\t[ $(($i%25)) = 0 ] && echo \"Applying changes for {} is still in progress...\"",
                module.src_file
            )?;
            insmod.push_str("\tsleep 0.2\ndone\n");
            writeln!(
                insmod,
                "[ $(cat {}/transition) != \"0\" ] && {{ echo \"Failed to apply {} $i\"; exit {}; }}",
                module_sys,
                module_name,
                DekuError::ApplyKlp.exit_code()
            )?;
        } else {
            insmod.push_str("sleep 2\n");
        }
        writeln!(insmod, "echo \"{} done\"", module.src_file)?;
    }

    write!(
        script,
        "\n{}\n{}\n\t{{ echo \"Previous changes cannot be undone\"; exit {}; }}\n\n{}",
        unload,
        checkmod,
        DekuError::LoadModule.exit_code(),
        insmod
    )?;

    let script_path = config.workdir.join(DEKU_RELOAD_SCRIPT);
    fs::write(&script_path, script)?;
    Ok(script_path)
}

pub fn upload_and_load_modules(
    config: &Config,
    modules_to_load: &[PatchModule],
    modules_to_unload: &[PatchModule],
) -> Result<()> {
    use log::info;

    const GREEN: &str = "\x1b[32m";
    const NO_COLOR: &str = "\x1b[0m";

    debug!("Modules to load: {:?}", modules_to_load);
    debug!("Modules to unload: {:?}", modules_to_unload);

    let script_path = generate_load_script(config, modules_to_load, modules_to_unload)?;

    run_ssh_command(config, &format!("mkdir -p {}", REMOTE_DIR))?.exit_ok()?;

    let mut files_to_upload = modules_to_load
        .iter()
        .map(|module| module.ko_file.clone())
        .collect::<Vec<_>>();
    files_to_upload.push(script_path);
    upload_files(config, &files_to_upload)?;

    if !modules_to_load.is_empty() {
        info!("Loading...");
    } else {
        info!("Reverting...");
    }

    let result = run_ssh_command(
        config,
        &format!("sh {}/{} 2>&1", REMOTE_DIR, DEKU_RELOAD_SCRIPT),
    )?;
    if result.exit_code == 0 {
        info!("{}Changes successfully applied!{}", GREEN, NO_COLOR);
        return Ok(());
    }

    info!("----------------------------------------");
    info!("{}", result.output);
    info!("----------------------------------------");
    info!("Failed to apply changes!");
    info!("Check the system logs on the device for more information.");
    result.exit_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(deploy_params: &str) -> Config {
        let root = std::env::temp_dir().join("deku-ssh");
        let _ = std::fs::remove_dir_all(&root);
        for dir in ["build", "src", "workdir"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let mut config =
            Config::for_tests(&root.join("build"), &root.join("src"), &root.join("workdir"));
        config.deploy_params = deploy_params.to_string();
        config
    }

    #[test]
    fn test_remote_parameters_with_port() {
        let config = test_config("root@192.168.0.7:2222");

        let params = remote_parameters(&config, true);
        assert_eq!(params.last().unwrap(), "root@192.168.0.7");
        assert!(params.contains(&"-p".to_string()));
        assert!(params.contains(&"2222".to_string()));
        assert!(params.contains(&"ControlPath=/tmp/ssh-deku-192.168.0.72222".to_string()));

        let params = remote_parameters(&config, false);
        assert!(params.contains(&"-P".to_string()));
    }

    #[test]
    fn test_load_script_contains_bounded_waits() {
        let config = test_config("root@host");

        let module = PatchModule {
            name: "deku_00c0ffee_open".to_string(),
            src_file: "fs/open.c".to_string(),
            ko_file: config.workdir.join("deku_00c0ffee_open/deku_00c0ffee_open.ko"),
            dependencies: Vec::new(),
        };
        fs::create_dir_all(config.workdir.join(&module.name)).unwrap();
        fs::write(
            config.workdir.join(&module.name).join(FILE_OBJECT_PATH),
            "vmlinux",
        )
        .unwrap();

        let script_path = generate_load_script(&config, &[module], &[]).unwrap();
        let script = fs::read_to_string(script_path).unwrap();

        assert!(script.contains("INSMOD=\"sudo insmod\""));
        assert!(script.contains("seq 1 150"));
        assert!(script.contains("seq 1 250"));
        assert!(script.contains("/sys/kernel/livepatch/deku_00c0ffee_open"));
        assert!(script.contains(&format!("exit {}", DekuError::LoadModule.exit_code())));
        assert!(script.contains(&format!("exit {}", DekuError::ApplyKlp.exit_code())));
        // Built into vmlinux: no dependency-module preflight
        assert!(!script.contains("/proc/modules\nif"));
    }

    #[test]
    fn test_load_script_checks_module_dependency() {
        let config = test_config("root@host");

        let module = PatchModule {
            name: "deku_00c0ffee_dummy".to_string(),
            src_file: "drivers/net/dummy.c".to_string(),
            ko_file: config.workdir.join("deku_00c0ffee_dummy/deku_00c0ffee_dummy.ko"),
            dependencies: Vec::new(),
        };
        let module_dir = config.workdir.join(&module.name);
        fs::create_dir_all(&module_dir).unwrap();
        fs::write(module_dir.join(FILE_OBJECT_PATH), "drivers/net/dummy.ko").unwrap();
        fs::write(module_dir.join(FILE_SRC_PATH), "drivers/net/dummy.c").unwrap();

        let script_path = generate_load_script(&config, &[module], &[]).unwrap();
        let script = fs::read_to_string(script_path).unwrap();

        assert!(script.contains("grep -q '\\bdummy\\b' /proc/modules"));
        assert!(script
            .contains(&format!("exit {}", DekuError::DependModuleNotLoaded.exit_code())));
    }
}
