// SPDX-License-Identifier: Mulan PSL v2
/*
 * Copyright (c) 2024 Huawei Technologies Co., Ltd.
 * deku-common is licensed under Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *         http://license.coscl.org.cn/MulanPSL2
 *
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
 * EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
 * MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

use std::{
    ffi::OsStr,
    path::Path,
    process::{self, Stdio},
};

use anyhow::{Context, Result};
use log::{trace, Level};

mod child;

pub use child::{Child, ExitStatus, Output, StdioLevel};

pub struct Command {
    inner: process::Command,
    stdio_level: StdioLevel,
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            inner: process::Command::new(program),
            stdio_level: StdioLevel::default(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.inner.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.inner.env(key, val);
        self
    }

    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.inner.current_dir(dir);
        self
    }

    pub fn stdout<T: Into<Option<Level>>>(&mut self, level: T) -> &mut Self {
        self.stdio_level.stdout = level.into();
        self
    }

    pub fn stderr<T: Into<Option<Level>>>(&mut self, level: T) -> &mut Self {
        self.stdio_level.stderr = level.into();
        self
    }

    pub fn spawn(&mut self) -> Result<Child> {
        let name = Path::new(self.inner.get_program())
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        trace!("Executing {:?}", self.inner);
        let child = self
            .inner
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", name))?;

        Ok(Child {
            name,
            child,
            stdio_level: self.stdio_level,
        })
    }

    pub fn run(&mut self) -> Result<ExitStatus> {
        Ok(self.run_with_output()?.status)
    }

    pub fn run_with_output(&mut self) -> Result<Output> {
        self.spawn()?.wait_with_output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_command_args() {
        let mut cmd = Command::new("test");
        cmd.arg("a").args(["b", "c"]);

        let mut args = cmd.inner.get_args();
        assert_eq!(args.next(), Some(OsStr::new("a")));
        assert_eq!(args.next(), Some(OsStr::new("b")));
        assert_eq!(args.next(), Some(OsStr::new("c")));
        assert!(args.next().is_none());
    }

    #[test]
    fn test_command_env() {
        let mut cmd = Command::new("test");
        cmd.env("K", "V");

        let envs = cmd.inner.get_envs().collect::<HashMap<_, _>>();
        assert_eq!(envs.get(&OsStr::new("K")), Some(&Some(OsStr::new("V"))));
    }

    #[test]
    fn test_command_current_dir() {
        let mut cmd = Command::new("test");
        cmd.current_dir("/tmp");
        assert_eq!(cmd.inner.get_current_dir(), Some(Path::new("/tmp")));
    }

    #[test]
    fn test_command_run() {
        let status = Command::new("true").run().unwrap();
        assert!(status.success());
        assert!(status.exit_ok().is_ok());

        let status = Command::new("false").run().unwrap();
        assert!(!status.success());
        assert!(status.exit_ok().is_err());
    }

    #[test]
    fn test_command_run_with_output() {
        let output = Command::new("echo").arg("deku").run_with_output().unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout.to_string_lossy(), "deku");
    }
}
