//! トラップコーディネータ
//!
//! システムコール入口で停止したプロセスを出口まで進め、戻り値を得る。
//! トラッカーは `TrapCoordinator` トレイトだけに依存するので、
//! テストでは戻り値を返すだけの実装に差し替えられる。

use crate::breakpoint::{BreakpointManager, SyscallSite};
use crate::{Result, SyscallEvent};
use mapwatch_target::{Memory, Process, Registers, SoftwareBreakpoint, StopReason};
use nix::sys::signal::Signal;
use tracing::{debug, warn};

/// システムコールを入口から出口まで進める協調者
pub trait TrapCoordinator {
    /// 停止中のプロセスを再開してシステムコールを完了させ、生の戻り値（RAX）を返す
    ///
    /// `keep_armed` が真なら、次回の呼び出しのためにトラップを再設定する。
    fn run_to_exit(&mut self, event: &SyscallEvent, keep_armed: bool) -> Result<i64>;
}

/// 待機の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapEvent {
    /// 追跡対象の syscall 命令で停止した
    Syscall(SyscallEvent),
    /// プロセスが終了した
    Exited(StopReason),
}

/// ptrace と INT3 によるトラップコーディネータ
pub struct PtraceCoordinator {
    process: Process,
    memory: Memory,
    registers: Registers,
    breakpoints: BreakpointManager,
    /// ステップ中に受け取り、次の継続時に配送するシグナル
    pending_signal: Option<Signal>,
}

impl PtraceCoordinator {
    /// 停止中のプロセスからコーディネータを作成する
    pub fn new(process: Process) -> Self {
        let pid = process.pid();
        Self {
            process,
            memory: Memory::new(pid),
            registers: Registers::new(pid),
            breakpoints: BreakpointManager::new(),
            pending_signal: None,
        }
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    /// メモリアクセスを取得する
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// 設定済みのサイトを取得する
    pub fn sites(&self) -> impl Iterator<Item = &SyscallSite> {
        self.breakpoints.all()
    }

    /// syscall 命令にブレークポイントを設定する
    pub fn arm(&mut self, sites: &[SyscallSite]) -> Result<usize> {
        let mut armed = 0;
        for site in sites {
            if self.breakpoints.add_and_arm(*site, &self.memory)? {
                debug!(site = format_args!("0x{:x}", site.address), syscall = %site.syscall, "armed");
                armed += 1;
            }
        }
        Ok(armed)
    }

    /// 指定アドレスまで実行する（一時ブレークポイント）
    ///
    /// 起動直後に使い、動的リンカが共有ライブラリを読み込み終えるのを待つ。
    pub fn run_to_address(&mut self, address: u64) -> Result<StopReason> {
        let mut bp = SoftwareBreakpoint::new(address);
        bp.arm(&self.memory)?;

        let reason = loop {
            let reason = self.process.continue_and_wait(self.pending_signal.take())?;
            if reason.is_terminal() {
                return Ok(reason);
            }
            match reason {
                StopReason::Breakpoint if bp.is_hit_at(self.registers.get_pc()?) => break reason,
                StopReason::Signal(signal) => self.pending_signal = Some(signal),
                _ => {}
            }
        };

        bp.disarm(&self.memory)?;
        self.registers.set_pc(address)?;
        debug!(address = format_args!("0x{:x}", address), "reached address");
        Ok(reason)
    }

    /// 次に追跡対象の syscall 命令に到達するか、プロセスが終了するまで実行する
    ///
    /// 到達した場合、PCは syscall 命令の先頭に戻してある。
    pub fn wait_for_syscall(&mut self) -> Result<TrapEvent> {
        loop {
            let reason = self.process.continue_and_wait(self.pending_signal.take())?;
            match reason {
                StopReason::Breakpoint => {
                    let pc = self.registers.get_pc()?;
                    let Some(site) = self.breakpoints.hit(pc).map(|s| s.address) else {
                        warn!(pid = self.pid(), pc = format_args!("0x{:x}", pc), "SIGTRAP outside armed sites");
                        continue;
                    };
                    self.registers.set_pc(site)?;
                    let regs = self.registers.syscall_args()?;
                    return Ok(TrapEvent::Syscall(SyscallEvent::from_registers(&regs, site)));
                }
                StopReason::Signal(signal) => {
                    debug!(pid = self.pid(), ?signal, "forwarding signal");
                    self.pending_signal = Some(signal);
                }
                reason if reason.is_terminal() => return Ok(TrapEvent::Exited(reason)),
                _ => {}
            }
        }
    }
}

impl Drop for PtraceCoordinator {
    fn drop(&mut self) {
        // デタッチ後に INT3 が残っているとプロセスが SIGTRAP で落ちる
        let failed = self.breakpoints.clear(&self.memory);
        if failed > 0 {
            warn!(pid = self.pid(), failed, "could not restore some syscall sites");
        }
    }
}

impl TrapCoordinator for PtraceCoordinator {
    fn run_to_exit(&mut self, event: &SyscallEvent, keep_armed: bool) -> Result<i64> {
        self.breakpoints.disarm(event.site, &self.memory)?;

        // syscall 命令1つだけを実行する
        loop {
            match self.process.step()? {
                StopReason::Step => break,
                StopReason::Signal(signal) => {
                    debug!(pid = self.pid(), ?signal, "signal during syscall step");
                    self.pending_signal = Some(signal);
                }
                reason if reason.is_terminal() => {
                    return Err(anyhow::anyhow!(
                        "Process {} terminated during {}: {:?}",
                        self.pid(),
                        event.syscall,
                        reason
                    ));
                }
                _ => {}
            }
        }

        let retval = self.registers.get_return_value()?;

        if keep_armed {
            self.breakpoints.rearm(event.site, &self.memory)?;
        } else {
            self.breakpoints.remove(event.site, &self.memory)?;
        }

        Ok(retval)
    }
}
