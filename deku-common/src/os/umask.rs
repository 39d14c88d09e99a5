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

pub fn set_umask(mode: u32) -> u32 {
    unsafe { libc::umask(mode as libc::mode_t) as u32 }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_set_umask() {
        const UMASK: u32 = 0o022;

        super::set_umask(UMASK);

        let file_path = std::env::temp_dir().join("deku-common-umask");
        let file = File::create(&file_path).expect("Failed to create file");
        let perm = file
            .metadata()
            .map(|m| m.permissions())
            .expect("Failed to read file permission");

        assert_eq!(perm.mode() & 0o777, 0o644);

        drop(file);
        std::fs::remove_file(&file_path).expect("Failed to remove file");
    }
}
