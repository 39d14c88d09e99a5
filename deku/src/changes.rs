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

use anyhow::{Context, Result};
use log::debug;

use deku_common::fs;

use crate::config::Config;

/// Auto-generated sources that look edited after every kernel build.
const IGNORED_FILES_H: [&str; 5] = [
    "arch/x86/realmode/rm/pasyms.h",
    "arch/x86/boot/voffset.h",
    "arch/x86/boot/cpustr.h",
    "arch/x86/boot/zoffset.h",
    "init/utsversion-tmp.h",
];
const IGNORED_FILES_C: [&str; 2] = [
    "arch/x86/entry/vdso/vdso-image-32.c",
    "arch/x86/entry/vdso/vdso-image-64.c",
];

const SKIPPED_DIRS: [&str; 4] = ["include/generated/", "scripts/", ".git/", "Documentation/"];

fn has_extension(path: &str, ext: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|found| found == ext)
        .unwrap_or(false)
}

/// Source files authored after the last kernel build: everything under the
/// sources directory newer than `.config`, minus generated and ignored
/// files. With an origin tree configured, only files whose bytes actually
/// differ from the installed sources count.
pub fn modified_files(config: &Config) -> Result<Vec<String>> {
    let config_time = fs::modified_time(config.build_dir.join(".config"))
        .context("Can't find .config file")?;

    let entries = fs::list_files(&config.source_dir, fs::TraverseOptions { recursive: true })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = match entry.strip_prefix(&config.source_dir) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => continue,
        };

        match fs::modified_time(&entry) {
            Ok(mtime) if mtime >= config_time => {}
            _ => continue,
        }

        if SKIPPED_DIRS.iter().any(|dir| path.starts_with(dir)) {
            continue;
        }

        match &config.kern_src_install_dir {
            Some(origin_dir) => {
                if !has_extension(&path, "c") && !has_extension(&path, "h") {
                    continue;
                }
                let origin = origin_dir.join(&path);
                let origin_time = match fs::modified_time(&origin) {
                    Ok(time) => time,
                    Err(_) => continue,
                };
                if fs::modified_time(&entry)? > origin_time
                    && fs::read(&entry)? != fs::read(&origin)?
                {
                    files.push(path);
                }
            }
            None => {
                if has_extension(&path, "c")
                    && !path.ends_with(".mod.c")
                    && !IGNORED_FILES_C.contains(&path.as_str())
                {
                    files.push(path);
                } else if has_extension(&path, "h") && !IGNORED_FILES_H.contains(&path.as_str()) {
                    files.push(path);
                }
            }
        }
    }

    files.sort();
    debug!("Modified files: {:?}", files);
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn setup(name: &str) -> Config {
        let root = std::env::temp_dir().join("deku-changes").join(name);
        let _ = std::fs::remove_dir_all(&root);
        for dir in ["build", "src", "workdir"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        Config::for_tests(&root.join("build"), &root.join("src"), &root.join("workdir"))
    }

    fn age(path: &Path, seconds: u64) {
        let time = SystemTime::now() - Duration::from_secs(seconds);
        fs::set_modified_time(path, time).unwrap();
    }

    #[test]
    fn test_reports_fresh_c_and_h_files() {
        let config = setup("fresh");
        fs::write(config.build_dir.join(".config"), "").unwrap();
        age(&config.build_dir.join(".config"), 3600);

        fs::create_dir_all(config.source_dir.join("fs")).unwrap();
        fs::create_dir_all(config.source_dir.join("scripts")).unwrap();
        fs::write(config.source_dir.join("fs/open.c"), "int x;").unwrap();
        fs::write(config.source_dir.join("fs/open.h"), "int x;").unwrap();
        fs::write(config.source_dir.join("fs/open.mod.c"), "").unwrap();
        fs::write(config.source_dir.join("fs/README"), "").unwrap();
        fs::write(config.source_dir.join("scripts/gen.c"), "").unwrap();

        let files = modified_files(&config).unwrap();
        assert_eq!(files, vec!["fs/open.c", "fs/open.h"]);
    }

    #[test]
    fn test_skips_files_older_than_config() {
        let config = setup("older");
        fs::write(config.build_dir.join(".config"), "").unwrap();

        fs::create_dir_all(config.source_dir.join("fs")).unwrap();
        let old_file = config.source_dir.join("fs/stale.c");
        fs::write(&old_file, "int x;").unwrap();
        age(&old_file, 3600);

        let files = modified_files(&config).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_origin_tree_filters_identical_files() {
        let mut config = setup("origin");
        let origin_dir = config.workdir.join("origin");
        config.kern_src_install_dir = Some(origin_dir.clone());

        fs::write(config.build_dir.join(".config"), "").unwrap();
        age(&config.build_dir.join(".config"), 3600);

        fs::create_dir_all(config.source_dir.join("fs")).unwrap();
        fs::create_dir_all(origin_dir.join("fs")).unwrap();

        // Identical content: no change even though the mtime is newer
        fs::write(config.source_dir.join("fs/same.c"), "int x;").unwrap();
        fs::write(origin_dir.join("fs/same.c"), "int x;").unwrap();
        age(&origin_dir.join("fs/same.c"), 1800);

        // Diverging content counts
        fs::write(config.source_dir.join("fs/edited.c"), "int y;").unwrap();
        fs::write(origin_dir.join("fs/edited.c"), "int x;").unwrap();
        age(&origin_dir.join("fs/edited.c"), 1800);

        let files = modified_files(&config).unwrap();
        assert_eq!(files, vec!["fs/edited.c"]);
    }
}
