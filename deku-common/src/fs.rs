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

use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{File, FileType, Metadata, OpenOptions, ReadDir};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

trait RewriteError {
    fn rewrite_err(self, err_msg: String) -> Self;
}

impl<T> RewriteError for std::io::Result<T> {
    #[inline]
    fn rewrite_err(self, err_msg: String) -> Self {
        self.map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("{}, {}", err_msg, e.to_string().to_lowercase()),
            )
        })
    }
}

/* std::fs functions */
#[inline]
pub fn read<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<u8>> {
    std::fs::read(path.as_ref()).rewrite_err(format!("Cannot read \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn read_to_string<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    std::fs::read_to_string(path.as_ref())
        .rewrite_err(format!("Cannot read \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> std::io::Result<()> {
    std::fs::write(path.as_ref(), contents)
        .rewrite_err(format!("Cannot write \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn remove_file<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    std::fs::remove_file(path.as_ref())
        .rewrite_err(format!("Cannot remove \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn metadata<P: AsRef<Path>>(path: P) -> std::io::Result<Metadata> {
    std::fs::metadata(path.as_ref())
        .rewrite_err(format!("Cannot access \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn rename<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> std::io::Result<()> {
    std::fs::rename(&from, &to).rewrite_err(format!(
        "Cannot rename \"{}\" to \"{}\"",
        from.as_ref().display(),
        to.as_ref().display()
    ))
}

#[inline]
pub fn copy<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> std::io::Result<u64> {
    std::fs::copy(&from, &to).rewrite_err(format!(
        "Cannot copy \"{}\" to \"{}\"",
        from.as_ref().display(),
        to.as_ref().display()
    ))
}

#[inline]
pub fn read_link<P: AsRef<Path>>(path: P) -> std::io::Result<PathBuf> {
    std::fs::read_link(path.as_ref()).rewrite_err(format!(
        "Cannot read symbol link \"{}\"",
        path.as_ref().display(),
    ))
}

#[inline]
pub fn create_dir<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    std::fs::create_dir(path.as_ref()).rewrite_err(format!(
        "Cannot create directory \"{}\"",
        path.as_ref().display(),
    ))
}

#[inline]
pub fn create_dir_all<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    std::fs::create_dir_all(path.as_ref()).rewrite_err(format!(
        "Cannot create directory \"{}\"",
        path.as_ref().display(),
    ))
}

#[inline]
pub fn remove_dir_all<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    std::fs::remove_dir_all(path.as_ref()).rewrite_err(format!(
        "Cannot remove directory \"{}\"",
        path.as_ref().display(),
    ))
}

#[inline]
pub fn read_dir<P: AsRef<Path>>(path: P) -> std::io::Result<ReadDir> {
    std::fs::read_dir(path.as_ref()).rewrite_err(format!(
        "Cannot read directory \"{}\"",
        path.as_ref().display(),
    ))
}

/* Extended functions */
pub fn open_file<P: AsRef<Path>>(path: P) -> std::io::Result<File> {
    std::fs::File::open(&path)
        .rewrite_err(format!("Cannot open file \"{}\"", path.as_ref().display()))
}

pub fn append<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> std::io::Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())
        .and_then(|mut file| file.write_all(contents.as_ref()))
        .rewrite_err(format!(
            "Cannot append to \"{}\"",
            path.as_ref().display()
        ))
}

pub fn file_name<P: AsRef<Path>>(path: P) -> OsString {
    path.as_ref()
        .file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_default()
}

/// Base name without the last extension ("fs/open.c" -> "open").
pub fn file_stem<P: AsRef<Path>>(path: P) -> String {
    path.as_ref()
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Lines of a text file; a missing file reads as no lines.
pub fn read_lines<P: AsRef<Path>>(path: P) -> Vec<String> {
    std::fs::read_to_string(path.as_ref())
        .map(|content| {
            content
                .lines()
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

pub fn exists<P: AsRef<Path>>(path: P) -> bool {
    std::fs::symlink_metadata(path.as_ref()).is_ok()
}

pub fn modified_time<P: AsRef<Path>>(path: P) -> std::io::Result<SystemTime> {
    metadata(path.as_ref())?.modified()
}

pub fn set_modified_time<P: AsRef<Path>>(path: P, time: SystemTime) -> std::io::Result<()> {
    let duration = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timeval {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_usec: duration.subsec_micros() as libc::suseconds_t,
        };
        2
    ];

    let c_path = CString::new(path.as_ref().as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    match unsafe { libc::utimes(c_path.as_ptr(), times.as_ptr()) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error()).rewrite_err(format!(
            "Cannot set modification time of \"{}\"",
            path.as_ref().display()
        )),
    }
}

pub fn normalize<P: AsRef<Path>>(path: P) -> std::io::Result<PathBuf> {
    let mut new_path = PathBuf::new();

    let orig_path = path.as_ref();
    if orig_path.is_relative() {
        new_path.push(env::current_dir()?);
    }

    for component in orig_path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                new_path.pop();
                if !new_path.has_root() {
                    new_path.push(Component::RootDir);
                }
            }
            _ => {
                new_path.push(component);
            }
        }
    }

    Ok(new_path)
}

#[derive(Clone, Copy)]
pub struct TraverseOptions {
    pub recursive: bool,
}

pub fn traverse<P, F>(
    directory: P,
    options: TraverseOptions,
    predicate: F,
) -> std::io::Result<Vec<PathBuf>>
where
    P: AsRef<Path>,
    F: Fn(&FileType, &Path) -> bool + Copy,
{
    let mut results = Vec::new();
    let mut subdirs = Vec::new();

    for dir_entry in read_dir(directory)?.flatten() {
        let file_type = dir_entry.file_type()?;
        let file_path = dir_entry.path();

        if predicate(&file_type, &file_path) {
            results.push(file_path.clone());
        }
        if options.recursive && file_type.is_dir() {
            subdirs.push(file_path);
        }
    }

    for subdir in subdirs {
        results.extend(traverse(subdir, options, predicate)?);
    }

    Ok(results)
}

pub fn list_dirs<P>(directory: P, options: TraverseOptions) -> std::io::Result<Vec<PathBuf>>
where
    P: AsRef<Path>,
{
    traverse(directory, options, |file_type, _| file_type.is_dir())
}

pub fn list_files<P>(directory: P, options: TraverseOptions) -> std::io::Result<Vec<PathBuf>>
where
    P: AsRef<Path>,
{
    traverse(directory, options, |file_type, _| file_type.is_file())
}

pub fn list_files_by_ext<P, S>(
    directory: P,
    ext: S,
    options: TraverseOptions,
) -> std::io::Result<Vec<PathBuf>>
where
    P: AsRef<Path>,
    S: AsRef<OsStr>,
{
    traverse(directory, options, |file_type, file_path| {
        if !file_type.is_file() {
            return false;
        }
        file_path
            .extension()
            .map(|s| s == ext.as_ref())
            .unwrap_or(false)
    })
}
