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

use anyhow::{bail, Context, Result};
use log::{debug, error, Level};

use deku_common::{fs, process::Command};

use crate::config::Config;

pub const BUILD_LOG: &str = "build.log";

/// Compile parameters skipped when replaying a kernel compile command;
/// `-o` also drops the value that follows it.
const SKIP_FLAGS: [&str; 1] = ["-Wdeclaration-after-statement"];
const SKIP_WITH_VALUE: [&str; 1] = ["-o"];

/// Reads `#define <key> "<value>"` generated by the kernel build.
pub fn kernel_information<P: AsRef<Path>>(build_dir: P, key: &str) -> Option<String> {
    let generated = build_dir.as_ref().join("include/generated");
    let files = fs::list_files(generated, fs::TraverseOptions { recursive: true }).ok()?;

    for file in files {
        let content = match fs::read_to_string(&file) {
            Ok(content) => content,
            Err(_) => continue,
        };
        for line in content.lines() {
            let rest = match line.find(key) {
                Some(at) => &line[at + key.len()..],
                None => continue,
            };
            let open = match rest.find('"') {
                Some(at) => at + 1,
                None => continue,
            };
            if let Some(close) = rest[open..].find('"') {
                return Some(rest[open..open + close].to_string());
            }
        }
    }
    None
}

pub fn kernel_version<P: AsRef<Path>>(build_dir: P) -> Option<String> {
    kernel_information(build_dir, "UTS_VERSION")
}

pub fn kernel_release<P: AsRef<Path>>(build_dir: P) -> Option<String> {
    kernel_information(build_dir, "UTS_RELEASE")
}

pub fn version_num(major: u64, minor: u64, patch: u64) -> u64 {
    const MAX_PATCH: u64 = 99_999;
    const MAX_MINOR: u64 = 9_999;
    major * (MAX_MINOR + 1) * (MAX_PATCH + 1) + minor * (MAX_PATCH + 1) + patch
}

/// Comparable number of a `major.minor[...]` release string.
pub fn release_version_num(release: &str) -> Result<u64> {
    let mut parts = release.split('.');
    let major = parts
        .next()
        .and_then(|part| part.parse::<u64>().ok())
        .with_context(|| format!("Invalid kernel release: {}", release))?;
    let minor = parts
        .next()
        .map(|part| {
            part.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|digits| digits.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(version_num(major, minor, 0))
}

pub fn is_klp_enabled<P: AsRef<Path>>(build_dir: P) -> bool {
    let config = fs::read_to_string(build_dir.as_ref().join(".config")).unwrap_or_default();
    if !config.contains("CONFIG_LIVEPATCH=y") {
        return false;
    }
    let system_map = fs::read_to_string(build_dir.as_ref().join("System.map")).unwrap_or_default();
    system_map.contains("klp_enable_patch")
}

pub fn is_llvm_used<P: AsRef<Path>>(build_dir: P) -> bool {
    fs::read_to_string(build_dir.as_ref().join(".config"))
        .map(|config| config.contains("CONFIG_CC_IS_CLANG=y"))
        .unwrap_or(false)
}

/// Splits the first line of a kbuild `.cmd` file into the compile command
/// tokens, dropping skipped parameters (with their values) and any chained
/// command after `;`.
fn command_from_cmd_file<P: AsRef<Path>>(cmd_file: P) -> Result<Vec<String>> {
    let content = fs::read_to_string(&cmd_file)?;
    let line = content.lines().next().unwrap_or_default();
    let line = line
        .splitn(2, '=')
        .nth(1)
        .with_context(|| format!("Can't find command in {}", cmd_file.as_ref().display()))?;
    let line = line.splitn(2, ';').next().unwrap_or_default();

    let mut command = Vec::new();
    let mut params = line.split_whitespace();
    while let Some(param) = params.next() {
        if SKIP_WITH_VALUE.contains(&param) {
            params.next();
        } else if !SKIP_FLAGS.contains(&param) {
            command.push(param.to_string());
        }
    }
    Ok(command)
}

/// The compiler invocation for one source file, recovered from the kernel
/// build and pointed at the staged copy of the file.
pub fn compile_command(config: &Config, src_file: &str) -> Result<Vec<String>> {
    let dir = Path::new(src_file).parent().unwrap_or_else(|| Path::new(""));
    let cmd_file = config
        .build_dir
        .join(dir)
        .join(format!(".{}.o.cmd", fs::file_stem(src_file)));

    let mut command = command_from_cmd_file(&cmd_file)?;
    command.pop(); // the recorded input file
    command.push(format!(
        "-I{}",
        config.source_dir.join(dir).to_string_lossy()
    ));
    Ok(command)
}

pub fn build_file(config: &Config, src_file: &str, compile_file: &Path, out_file: &Path) -> Result<()> {
    let mut command = compile_command(config, src_file)
        .with_context(|| format!("Can't find compile command for {}", src_file))?;

    let current_dir = env::current_dir()?;
    let out_file = match out_file.is_absolute() {
        true => out_file.to_path_buf(),
        false => current_dir.join(out_file),
    };
    let compile_file = match compile_file.is_absolute() {
        true => compile_file.to_path_buf(),
        false => current_dir.join(compile_file),
    };

    command.push("-o".to_string());
    command.push(out_file.to_string_lossy().into_owned());
    command.push(compile_file.to_string_lossy().into_owned());

    Command::new("bash")
        .arg("-c")
        .arg(command.join(" "))
        .current_dir(&config.linux_headers_dir)
        .stdout(Level::Debug)
        .stderr(Level::Error)
        .run()?
        .exit_ok()
        .with_context(|| format!("Failed to build {}", src_file))
}

fn build_modules(config: &Config, module_dir: &Path) -> Result<()> {
    let mut command = Command::new("make");
    if config.use_llvm {
        command.arg("LLVM=1");
    }

    let output = command
        .current_dir(module_dir)
        .stdout(Level::Trace)
        .stderr(Level::Trace)
        .run_with_output()?;
    let combined = output.combined();
    fs::write(module_dir.join(BUILD_LOG), combined.to_string_lossy().as_bytes())?;

    if !output.status.success() {
        let log = combined.to_string_lossy().into_owned();
        match log.lines().find(|line| line.contains("error:")) {
            Some(line) => error!("{}. See more: {}", line, module_dir.join(BUILD_LOG).display()),
            None => error!("Error:\n{}", log),
        }
        bail!("build failed");
    }
    Ok(())
}

/// Out-of-tree kernel build of the generated livepatch module.
pub fn build_livepatch_module(config: &Config, module_dir: &Path) -> Result<()> {
    let file_log = module_dir.join(BUILD_LOG);
    let old_file_log = module_dir.join("build_modules.log");
    let _ = fs::rename(file_log, old_file_log);

    debug!("Build livepatch module in {}", module_dir.display());
    build_modules(config, module_dir)
}

/// Absolute path of the object built by the kernel for a source file.
pub fn original_object_path(config: &Config, src_file: &str) -> PathBuf {
    config
        .build_dir
        .join(Path::new(src_file).with_extension("o"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("deku-kbuild").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_version_num_ordering() {
        assert!(version_num(5, 4, 0) < version_num(5, 10, 0));
        assert!(version_num(5, 19, 0) < version_num(6, 0, 0));
        assert!(version_num(5, 10, 0) < version_num(5, 10, 1));
    }

    #[test]
    fn test_release_version_num() {
        assert_eq!(release_version_num("5.15.0").unwrap(), version_num(5, 15, 0));
        assert_eq!(
            release_version_num("6.1.0-rc2").unwrap(),
            version_num(6, 1, 0)
        );
        assert!(release_version_num("garbage").is_err());
    }

    #[test]
    fn test_command_from_cmd_file() {
        let dir = test_dir("cmd-file");
        let cmd_file = dir.join(".open.o.cmd");
        fs::write(
            &cmd_file,
            "savedcmd_fs/open.o := gcc -Wp,-MMD,fs/.open.o.d -nostdinc -Wdeclaration-after-statement -O2 -DKBUILD_MODFILE='\"fs/open\"' -o fs/open.o fs/open.c ; ./tools/objtool/objtool --hacksaw fs/open.o\n",
        )
        .unwrap();

        let command = command_from_cmd_file(&cmd_file).unwrap();
        assert_eq!(
            command,
            vec![
                "gcc",
                "-Wp,-MMD,fs/.open.o.d",
                "-nostdinc",
                "-O2",
                "-DKBUILD_MODFILE='\"fs/open\"'",
                "fs/open.c"
            ]
        );
    }

    #[test]
    fn test_kernel_information() {
        let dir = test_dir("kernel-info");
        fs::create_dir_all(dir.join("include/generated")).unwrap();
        fs::write(
            dir.join("include/generated/compile.h"),
            "#define UTS_VERSION \"#1 SMP PREEMPT_DYNAMIC Mon Jan 1 10:00:00 UTC 2024\"\n",
        )
        .unwrap();
        fs::write(
            dir.join("include/generated/utsrelease.h"),
            "#define UTS_RELEASE \"6.1.52\"\n",
        )
        .unwrap();

        assert_eq!(kernel_release(&dir).unwrap(), "6.1.52");
        assert_eq!(
            kernel_version(&dir).unwrap(),
            "#1 SMP PREEMPT_DYNAMIC Mon Jan 1 10:00:00 UTC 2024"
        );
        assert_eq!(kernel_information(&dir, "UTS_MACHINE"), None);
    }

    #[test]
    fn test_klp_detection() {
        let dir = test_dir("klp");
        fs::write(dir.join(".config"), "CONFIG_LIVEPATCH=y\n").unwrap();
        fs::write(dir.join("System.map"), "ffffffff810 T klp_enable_patch\n").unwrap();
        assert!(is_klp_enabled(&dir));

        fs::write(dir.join(".config"), "# CONFIG_LIVEPATCH is not set\n").unwrap();
        assert!(!is_klp_enabled(&dir));
    }
}
