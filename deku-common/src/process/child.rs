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
    ffi::{OsStr, OsString},
    io::{BufRead, BufReader, Read},
    ops::Deref,
    os::unix::ffi::OsStrExt,
    process,
    thread::JoinHandle,
};

use anyhow::{anyhow, ensure, Context, Result};
use log::{log, trace, Level};

#[derive(Debug, Clone, Copy)]
pub struct StdioLevel {
    pub(super) stdout: Option<Level>,
    pub(super) stderr: Option<Level>,
}

impl Default for StdioLevel {
    fn default() -> Self {
        Self {
            stdout: None,
            stderr: Some(Level::Error),
        }
    }
}

pub struct Child {
    pub(super) name: String,
    pub(super) child: process::Child,
    pub(super) stdio_level: StdioLevel,
}

impl Child {
    fn capture_stdio<R>(stdio: R, level: Option<Level>) -> JoinHandle<OsString>
    where
        R: Read + Send + 'static,
    {
        std::thread::spawn(move || {
            let mut reader = BufReader::new(stdio);
            let mut buffer = Vec::new();
            let mut line = Vec::new();

            while let Ok(len) = reader.read_until(b'\n', &mut line) {
                if len == 0 {
                    break;
                }
                if line.ends_with(b"\n") {
                    line.pop();
                }
                if let Some(level) = level {
                    log!(level, "{}", String::from_utf8_lossy(&line));
                }
                buffer.extend_from_slice(&line);
                buffer.push(b'\n');
                line.clear();
            }
            if buffer.ends_with(b"\n") {
                buffer.pop();
            }

            OsStr::from_bytes(&buffer).to_os_string()
        })
    }

    pub fn kill(&mut self) -> Result<()> {
        let id = self.child.id();
        self.child
            .kill()
            .with_context(|| format!("Failed to kill process {} ({})", self.name, id))
    }

    pub fn wait_with_output(&mut self) -> Result<Output> {
        let stdout_thread = self
            .child
            .stdout
            .take()
            .map(|stdio| Self::capture_stdio(stdio, self.stdio_level.stdout))
            .context("Failed to capture stdout")?;
        let stderr_thread = self
            .child
            .stderr
            .take()
            .map(|stdio| Self::capture_stdio(stdio, self.stdio_level.stderr))
            .context("Failed to capture stderr")?;

        let id = self.child.id();
        let status = self
            .child
            .wait()
            .with_context(|| format!("Failed to wait process {} ({})", self.name, id))?;
        let stdout = stdout_thread
            .join()
            .map_err(|_| anyhow!("Failed to join stdout thread"))?;
        let stderr = stderr_thread
            .join()
            .map_err(|_| anyhow!("Failed to join stderr thread"))?;

        let exit_status = ExitStatus {
            id,
            name: self.name.clone(),
            status,
        };
        trace!(
            "Process {} ({}) exited, exit_code={}",
            exit_status.name,
            exit_status.id,
            exit_status.exit_code()
        );

        Ok(Output {
            status: exit_status,
            stdout,
            stderr,
        })
    }
}

pub struct ExitStatus {
    id: u32,
    name: String,
    status: process::ExitStatus,
}

impl ExitStatus {
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn exit_ok(&self) -> Result<()> {
        let exit_code = self
            .status
            .code()
            .with_context(|| format!("Process {} ({}) was terminated", self.name, self.id))?;

        ensure!(
            exit_code == 0,
            "Process {} ({}) exited unsuccessfully, exit_code={}",
            self.name,
            self.id,
            exit_code
        );

        Ok(())
    }

    pub fn success(&self) -> bool {
        self.status.success()
    }
}

pub struct Output {
    pub status: ExitStatus,
    pub stdout: OsString,
    pub stderr: OsString,
}

impl Output {
    /// Stdout followed by stderr, the way an attached terminal would show it.
    pub fn combined(&self) -> OsString {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push("\n");
            }
            combined.push(&self.stderr);
        }
        combined
    }
}

impl Deref for Output {
    type Target = ExitStatus;

    fn deref(&self) -> &Self::Target {
        &self.status
    }
}
