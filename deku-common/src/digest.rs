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

use std::path::Path;

use crc32fast::Hasher;
use md5::{Digest, Md5};

use crate::fs;

/// CRC32 (IEEE) of a byte string, as 8 lowercase hex digits.
pub fn crc32<S: AsRef<[u8]>>(bytes: S) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes.as_ref());

    format!("{:08x}", hasher.finalize())
}

pub fn crc32_file<P: AsRef<Path>>(file: P) -> std::io::Result<String> {
    Ok(crc32(fs::read(file)?))
}

pub fn md5_file<P: AsRef<Path>>(file: P) -> std::io::Result<String> {
    let mut hasher = Md5::new();
    hasher.update(fs::read(file)?);

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32() {
        // Reference values of the IEEE polynomial
        assert_eq!(crc32(b""), "00000000");
        assert_eq!(crc32(b"123456789"), "cbf43926");
        assert_eq!(crc32(b"kernel/sched/core.c"), crc32(b"kernel/sched/core.c"));
        assert_ne!(crc32(b"fs/open.c"), crc32(b"fs/read_write.c"));
    }

    #[test]
    fn test_crc32_file() {
        let path = std::env::temp_dir().join("deku-common-digest");
        fs::write(&path, b"123456789").unwrap();
        assert_eq!(crc32_file(&path).unwrap(), "cbf43926");
    }
}
