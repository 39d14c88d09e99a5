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

use thiserror::Error;

/// Failure taxonomy shared between the local process and the device-side
/// reload script. The numeric codes double as process exit codes, so a
/// remote shell failure maps back onto the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DekuError {
    #[error("unsupported changes")]
    UnsupportedChanges,
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("missing board parameter")]
    NoBoardParam,
    #[error("board does not exist")]
    BoardNotExists,
    #[error("missing build directory")]
    NoBuildDir,
    #[error("invalid build directory")]
    InvalidBuildDir,
    #[error("invalid kernel sources directory")]
    InvalidKernSrcDir,
    #[error("kernel livepatching is not enabled")]
    KlpIsNotEnabled,
    #[error("insufficient build parameters")]
    InsufficientBuildParams,
    #[error("can't find object file")]
    CantFindObj,
    #[error("can't find symbol")]
    CantFindSymbol,
    #[error("can't find symbol index")]
    CantFindSymIndex,
    #[error("function is forbidden to modify")]
    ForbiddenModify,
    #[error("failed to extract symbols")]
    ExtractSymbols,
    #[error("failed to load module on the device")]
    LoadModule,
    #[error("failed to apply livepatch on the device")]
    ApplyKlp,
    #[error("dependent module is not loaded on the device")]
    DependModuleNotLoaded,
}

impl DekuError {
    pub fn exit_code(self) -> i32 {
        match self {
            DekuError::UnsupportedChanges => 1,
            DekuError::InvalidParameters => 2,
            DekuError::NoBoardParam => 3,
            DekuError::BoardNotExists => 4,
            DekuError::NoBuildDir => 5,
            DekuError::InvalidBuildDir => 6,
            DekuError::InvalidKernSrcDir => 7,
            DekuError::KlpIsNotEnabled => 8,
            DekuError::InsufficientBuildParams => 9,
            DekuError::CantFindObj => 10,
            DekuError::CantFindSymbol => 11,
            DekuError::CantFindSymIndex => 12,
            DekuError::ForbiddenModify => 13,
            DekuError::ExtractSymbols => 14,
            DekuError::LoadModule => 15,
            DekuError::ApplyKlp => 16,
            DekuError::DependModuleNotLoaded => 17,
        }
    }

    /// Maps an exit code reported by the device-side script back onto the
    /// taxonomy.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        const ALL: [DekuError; 17] = [
            DekuError::UnsupportedChanges,
            DekuError::InvalidParameters,
            DekuError::NoBoardParam,
            DekuError::BoardNotExists,
            DekuError::NoBuildDir,
            DekuError::InvalidBuildDir,
            DekuError::InvalidKernSrcDir,
            DekuError::KlpIsNotEnabled,
            DekuError::InsufficientBuildParams,
            DekuError::CantFindObj,
            DekuError::CantFindSymbol,
            DekuError::CantFindSymIndex,
            DekuError::ForbiddenModify,
            DekuError::ExtractSymbols,
            DekuError::LoadModule,
            DekuError::ApplyKlp,
            DekuError::DependModuleNotLoaded,
        ];

        ALL.into_iter().find(|e| e.exit_code() == code)
    }

    /// The exit code for an error chain: the innermost `DekuError` wins,
    /// anything untyped exits with a generic failure.
    pub fn code_of(error: &anyhow::Error) -> i32 {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<DekuError>())
            .map(|e| e.exit_code())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_code_round_trip() {
        for code in 1..=17 {
            let error = DekuError::from_exit_code(code).expect("Unmapped exit code");
            assert_eq!(error.exit_code(), code);
        }
        assert_eq!(DekuError::from_exit_code(0), None);
        assert_eq!(DekuError::from_exit_code(42), None);
    }

    #[test]
    fn test_code_of_chain() {
        let error = anyhow::Error::new(DekuError::CantFindObj).context("while locating owner");
        assert_eq!(DekuError::code_of(&error), 10);

        let untyped = anyhow::anyhow!("something else");
        assert_eq!(DekuError::code_of(&untyped), 1);
    }
}
