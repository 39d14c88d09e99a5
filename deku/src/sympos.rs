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

use anyhow::{bail, Context, Result};
use log::debug;

use deku_common::fs;

use crate::elf::read::Elf;
use crate::elf::*;
use crate::error::DekuError;

/// Symbols of one source file as witnessed in the owner object, up to the
/// point where a name match was found.
#[derive(Debug, Default, Clone)]
struct FileBucket {
    offset: u64,
    symbols: Vec<(String, u64, u8)>,
}

/// KLP `sympos` of `(name, kind)` inside the owner object.
///
/// A unique symbol resolves to 0. Duplicates are disambiguated through the
/// STT_FILE marker matching the originating source file; when several
/// translation units carry the same file name, the rebuilt object of the
/// patched file votes by symbol-table similarity. The returned index is
/// 1-based among all same-named occurrences, ordered by symbol offset.
pub fn find_symbol_index<P, Q>(
    build_dir: P,
    name: &str,
    kind: SymKind,
    src_file: &str,
    obj_path: Q,
) -> Result<usize>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    debug!(
        "Finding index for symbol: {} [{}] from source file: {} in: {}",
        name,
        kind,
        src_file,
        obj_path.as_ref().display()
    );
    let elf = Elf::parse(&obj_path)?;

    let src_name = fs::file_name(src_file).to_string_lossy().into_owned();
    let mut current_file = String::new();
    let mut file_symbols: Vec<(String, u64, u8)> = Vec::new();
    let mut buckets: Vec<FileBucket> = Vec::new();
    let mut offsets = Vec::new();
    let mut match_count = 0;

    for symbol in elf.symbols() {
        if symbol.st_type() == STT_FILE {
            current_file = symbol.name.clone();
            if current_file == src_name {
                file_symbols.clear();
            }
            continue;
        }

        let named_match = symbol.name == name
            && (matches!(symbol.st_type(), STT_FUNC | STT_OBJECT) || kind == SymKind::Any);
        if named_match {
            match_count += 1;
            if !kind.matches(symbol.st_type()) {
                continue;
            }
            offsets.push(symbol.value);
            if current_file == src_name {
                buckets.push(FileBucket {
                    offset: symbol.value,
                    symbols: file_symbols.clone(),
                });
            }
        }
        if current_file == src_name {
            file_symbols.push((symbol.name.clone(), symbol.size, symbol.info));
        }
    }

    if match_count == 0 {
        return Err(DekuError::CantFindSymIndex)
            .with_context(|| format!("Can't find any symbol index for {}", name));
    }
    if match_count == 1 {
        debug!("Found at index 0");
        return Ok(0);
    }

    let chosen_offset = match buckets.len() {
        1 => buckets[0].offset,
        _ => {
            // Several units claim this file name; let the freshly rebuilt
            // object vote for the bucket it resembles most.
            let rebuilt_path = build_dir
                .as_ref()
                .join(Path::new(src_file).with_extension("o"));
            let rebuilt = Elf::parse(&rebuilt_path).with_context(|| {
                format!("Can't open rebuilt object {}", rebuilt_path.display())
            })?;
            debug!(
                "Found {} objects file with symbol [{}] {}",
                buckets.len(),
                kind,
                name
            );

            let mut best_offset = 0;
            let mut best_hits = 0;
            for (index, bucket) in buckets.iter().enumerate() {
                let hits = rebuilt
                    .symbols()
                    .iter()
                    .filter(|sym| {
                        bucket.symbols.iter().any(|(name, size, info)| {
                            sym.name == *name && sym.size == *size && sym.info == *info
                        })
                    })
                    .count();
                debug!("Hit count for {}: {}", index, hits);
                if hits > best_hits {
                    best_hits = hits;
                    best_offset = bucket.offset;
                }
            }
            if best_offset == 0 {
                bail!("Can't find properly symbol index because there are multiple symbols with the same name");
            }
            best_offset
        }
    };

    let index = 1 + offsets
        .iter()
        .filter(|offset| **offset < chosen_offset)
        .count();
    debug!("Found at index {}", index);
    Ok(index)
}
