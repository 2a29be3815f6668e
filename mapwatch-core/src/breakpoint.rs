//! ブレークポイント管理

use crate::{Result, Syscall};
use mapwatch_target::{Memory, SoftwareBreakpoint};
use std::collections::BTreeMap;

/// システムコール命令に置いたブレークポイント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallSite {
    /// syscall 命令のアドレス
    pub address: u64,
    /// どのラッパー関数の中にあるか
    pub syscall: Syscall,
}

/// ブレークポイントマネージャ
///
/// アドレスをキーに、サイト情報とソフトウェアブレークポイント（INT3）を
/// 一緒に管理します。
pub struct BreakpointManager {
    breakpoints: BTreeMap<u64, (SyscallSite, SoftwareBreakpoint)>,
}

impl BreakpointManager {
    /// 新しいブレークポイントマネージャを作成する
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeMap::new(),
        }
    }

    /// サイトにINT3を設定する
    ///
    /// 同じアドレスに既に置かれている場合は何もせず false を返す。
    pub fn add_and_arm(&mut self, site: SyscallSite, memory: &Memory) -> Result<bool> {
        if self.breakpoints.contains_key(&site.address) {
            return Ok(false);
        }

        let mut sw_bp = SoftwareBreakpoint::new(site.address);
        sw_bp.arm(memory)?;

        self.breakpoints.insert(site.address, (site, sw_bp));
        Ok(true)
    }

    /// サイトを取り除き、元の命令を戻す
    pub fn remove(&mut self, address: u64, memory: &Memory) -> Result<()> {
        if let Some((_site, mut sw_bp)) = self.breakpoints.remove(&address) {
            sw_bp.disarm(memory)?;
        }
        Ok(())
    }

    /// 全てのサイトを取り除く
    ///
    /// 書き戻しに失敗したサイトがあっても残りは処理し、失敗した数を返す。
    pub fn clear(&mut self, memory: &Memory) -> usize {
        let mut failed = 0;
        for (_, (_site, mut sw_bp)) in std::mem::take(&mut self.breakpoints) {
            if sw_bp.disarm(memory).is_err() {
                failed += 1;
            }
        }
        failed
    }

    /// 一時的に元の命令を戻す
    pub fn disarm(&mut self, address: u64, memory: &Memory) -> Result<()> {
        self.entry(address)?.disarm(memory)
    }

    /// INT3を書き直す
    pub fn rearm(&mut self, address: u64, memory: &Memory) -> Result<()> {
        self.entry(address)?.arm(memory)
    }

    fn entry(&mut self, address: u64) -> Result<&mut SoftwareBreakpoint> {
        self.breakpoints
            .get_mut(&address)
            .map(|(_, sw_bp)| sw_bp)
            .ok_or_else(|| anyhow::anyhow!("No syscall site at 0x{:x}", address))
    }

    /// トラップ直後のPCから、どのサイトに当たったかを求める
    pub fn hit(&self, pc: u64) -> Option<&SyscallSite> {
        let (site, sw_bp) = self.breakpoints.get(&pc.wrapping_sub(1))?;
        sw_bp.is_hit_at(pc).then_some(site)
    }

    /// アドレスのサイト情報を取得する
    pub fn get(&self, address: u64) -> Option<&SyscallSite> {
        self.breakpoints.get(&address).map(|(site, _)| site)
    }

    /// 全てのサイトをアドレス順に取得する
    pub fn all(&self) -> impl Iterator<Item = &SyscallSite> {
        self.breakpoints.values().map(|(site, _)| site)
    }

    /// ブレークポイントの数を取得する
    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}
