//! INT3によるトラップ

use crate::{Memory, Result};

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// ソフトウェアブレークポイント
///
/// 設定中は命令の先頭バイトを退避し、`saved` に保持する。
#[derive(Debug)]
pub struct SoftwareBreakpoint {
    address: u64,
    saved: Option<u8>,
}

impl SoftwareBreakpoint {
    /// 未設定のブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self { address, saved: None }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// INT3が書き込まれているか
    pub fn is_armed(&self) -> bool {
        self.saved.is_some()
    }

    /// トラップ直後のPC（INT3の次のアドレス）がこのブレークポイントによるものか
    pub fn is_hit_at(&self, pc: u64) -> bool {
        self.is_armed() && pc == self.address.wrapping_add(1)
    }

    /// INT3を書き込む
    ///
    /// 既にINT3があるアドレスには設定できない（退避するバイトが壊れるため）。
    pub fn arm(&mut self, memory: &Memory) -> Result<()> {
        if self.is_armed() {
            return Ok(());
        }

        let byte = memory.read_u8(self.address as usize)?;
        if byte == INT3_OPCODE {
            return Err(anyhow::anyhow!("0x{:x} already contains INT3", self.address));
        }
        memory.write_u8(self.address as usize, INT3_OPCODE)?;
        self.saved = Some(byte);
        Ok(())
    }

    /// 退避したバイトを書き戻す
    pub fn disarm(&mut self, memory: &Memory) -> Result<()> {
        if let Some(byte) = self.saved {
            memory.write_u8(self.address as usize, byte)?;
            self.saved = None;
        }
        Ok(())
    }
}
