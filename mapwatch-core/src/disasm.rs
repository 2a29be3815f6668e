//! 逆アセンブル機能
//!
//! libc のラッパー関数を逆アセンブルして syscall 命令のアドレスを検出します。

use crate::Result;
use capstone::prelude::*;

/// 関数内の syscall 命令のアドレスを検出する
///
/// # Arguments
/// * `code` - 関数のバイト列
/// * `base_addr` - 関数の開始アドレス
///
/// # Returns
/// syscall 命令の絶対アドレスのリスト
pub fn find_syscall_instructions(code: &[u8], base_addr: u64) -> Result<Vec<u64>> {
    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))?;

    let insns = cs
        .disasm_all(code, base_addr)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble: {}", e))?;

    Ok(insns
        .as_ref()
        .iter()
        .filter(|insn| insn.mnemonic() == Some("syscall"))
        .map(|insn| insn.address())
        .collect())
}
