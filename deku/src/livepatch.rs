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
use std::path::Path;

use anyhow::{Context, Result};

use deku_common::fs;

use crate::config::Config;
use crate::elf::SymKind;
use crate::module::FILE_OBJECT_PATH;
use crate::owner::VMLINUX;
use crate::sympos;

/// Rename prefix applied while the kernel build system links the module;
/// the relocation rewriter folds the shims away again.
pub const DEKU_FUN_PREFIX: &str = "__deku_fun_";

const MODULE_SUFFIX: &str = include_str!("resources/module_suffix_tmpl.c");

/// Emits `livepatch.c`: shim prototypes, the `klp_func` table with resolved
/// sympos values, the `klp_object` bound to the owner and the `klp_patch`,
/// followed by the enable/init boilerplate.
pub fn generate_livepatch_source(
    config: &Config,
    module_dir: &Path,
    src_file: &str,
    obj_path: &str,
    mod_funcs: &[String],
) -> Result<()> {
    let obj_name = fs::file_stem(obj_path);

    fs::write(module_dir.join(FILE_OBJECT_PATH), obj_path)?;

    let mut prototypes = String::new();
    let mut klp_funcs = String::new();
    for symbol in mod_funcs {
        let plain_symbol = symbol.replace('.', "_");
        let sympos = sympos::find_symbol_index(
            &config.build_dir,
            symbol,
            SymKind::Func,
            src_file,
            config.build_dir.join(obj_path),
        )
        .with_context(|| format!("Can't resolve sympos of {}", symbol))?;

        writeln!(prototypes, "void {}{}(void);", DEKU_FUN_PREFIX, plain_symbol)?;
        write!(
            klp_funcs,
            "\t{{\n\t\t.old_name = \"{}\",\n\t\t.new_func = {}{},\n\t\t.old_sympos = {}\n\t}},",
            symbol, DEKU_FUN_PREFIX, plain_symbol, sympos
        )?;
    }

    let klp_obj_name = match obj_name.as_str() {
        VMLINUX => "NULL".to_string(),
        name => format!("\"{}\"", name),
    };

    let mut source = String::new();
    source.push_str(
        "#include <linux/kernel.h>\n\
         #include <linux/module.h>\n\
         #include <linux/livepatch.h>\n\
         #include <linux/version.h>\n\n",
    );
    source.push_str(&prototypes);
    write!(
        source,
        "\nstatic struct klp_func deku_funcs[] = {{\n{} {{ }}\n}};\n\n\
         static struct klp_object deku_objs[] = {{\n\
         \t{{\n\
         \t\t.name = {},\n\
         \t\t.funcs = deku_funcs,\n\
         \t}}, {{ }}\n\
         }};\n\n\
         static struct klp_patch deku_patch = {{\n\
         \t.mod = THIS_MODULE,\n\
         \t.objs = deku_objs,\n\
         }};\n",
        klp_funcs, klp_obj_name
    )?;
    source.push_str(MODULE_SUFFIX);

    fs::write(module_dir.join("livepatch.c"), source)?;
    Ok(())
}

/// Two-object out-of-tree module recipe: the generated glue plus the
/// extracted `patch.o`.
pub fn generate_makefile(config: &Config, module_dir: &Path, module_name: &str) -> Result<()> {
    let headers = config.linux_headers_dir.to_string_lossy();
    let module_path = module_dir.to_string_lossy();

    let mut makefile = String::new();
    makefile.push_str("KBUILD_MODPOST_WARN = 1\n");
    makefile.push_str("KBUILD_CFLAGS += -ffunction-sections -fdata-sections\n");
    writeln!(makefile, "obj-m += {}.o", module_name)?;
    writeln!(makefile, "{}-objs := livepatch.o patch.o", module_name)?;
    makefile.push_str("all:\n");
    writeln!(makefile, "\tmake -C {} M=\"{}\" modules", headers, module_path)?;
    makefile.push_str("clean:\n");
    writeln!(makefile, "\tmake -C {} M=\"{}\" clean", headers, module_path)?;

    fs::write(module_dir.join("Makefile"), makefile)?;

    // Kbuild expects a cmd file for the prebuilt object
    fs::write(module_dir.join(".patch.o.cmd"), "")?;
    Ok(())
}
