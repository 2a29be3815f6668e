//! プロセス制御機能

use crate::Result;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::ffi::CString;
use std::path::Path;
use tracing::debug;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// ブレークポイントヒット（SIGTRAP）
    Breakpoint,
    /// ステップ実行完了（SIGTRAP）
    Step,
    /// シグナル受信
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// シグナルによる終了
    Killed(Signal),
    /// その他の停止
    Other,
}

impl StopReason {
    /// プロセスがもう存在しないかどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopReason::Exited(_) | StopReason::Killed(_))
    }

    /// waitpidの結果を停止理由に変換する
    ///
    /// SIGTRAPは `trap` として返します（継続ならBreakpoint、ステップならStep）。
    fn from_wait_status(status: WaitStatus, trap: StopReason) -> Self {
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => trap,
            WaitStatus::Stopped(_, signal) => StopReason::Signal(signal),
            WaitStatus::Exited(_, code) => StopReason::Exited(code),
            WaitStatus::Signaled(_, signal, _) => StopReason::Killed(signal),
            _ => StopReason::Other,
        }
    }
}

/// トレース対象のプロセス
pub struct Process {
    pid: nix::unistd::Pid,
}

impl Process {
    /// 実行可能ファイルを起動してトレース対象プロセスを開始する
    ///
    /// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
    /// 指定された実行可能ファイルをexecveで実行します。
    /// プロセスはexecve直後、最初の1命令を実行した状態で停止して返されます。
    /// この時点では動的リンカがまだ共有ライブラリを読み込んでいません。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::sys::ptrace;
        use nix::sys::wait::waitpid;
        use nix::unistd::{execve, fork, ForkResult};

        let program_path = program.as_ref().to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
        let program_cstring = CString::new(program_path)?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスから継承
        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => {
                        ptrace::step(child, None)?;

                        match waitpid(child, None)? {
                            WaitStatus::Stopped(_, _) => {
                                debug!(pid = child.as_raw(), program = program_path, "spawned traced process");
                                Ok(Self { pid: child })
                            }
                            status => Err(anyhow::anyhow!(
                                "Unexpected wait status after step: {:?}",
                                status
                            )),
                        }
                    }
                    status => {
                        Err(anyhow::anyhow!("Unexpected wait status after execve: {:?}", status))
                    }
                }
            }
            ForkResult::Child => {
                ptrace::traceme()?;

                // 成功すると戻ってこない
                execve(&program_cstring, &cstring_args, &env)?;

                unreachable!("execve failed");
            }
        }
    }

    /// 既存のプロセスにアタッチし、停止するまで待つ
    pub fn attach(pid: i32) -> Result<Self> {
        use nix::sys::wait::waitpid;

        let pid = nix::unistd::Pid::from_raw(pid);
        nix::sys::ptrace::attach(pid)?;

        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, _) => {
                debug!(pid = pid.as_raw(), "attached to process");
                Ok(Self { pid })
            }
            status => Err(anyhow::anyhow!("Unexpected wait status after attach: {:?}", status)),
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// プロセスを実行継続して停止イベントを待機する
    ///
    /// SIGTRAP以外のシグナルで停止した場合、そのシグナルは次回の継続時に配送されます。
    pub fn continue_and_wait(&self, pending: Option<Signal>) -> Result<StopReason> {
        use nix::sys::ptrace;
        use nix::sys::wait::waitpid;

        ptrace::cont(self.pid, pending)?;
        let status = waitpid(self.pid, None)?;

        Ok(StopReason::from_wait_status(status, StopReason::Breakpoint))
    }

    /// 1命令だけ実行して停止する（ステップ実行）
    pub fn step(&self) -> Result<StopReason> {
        use nix::sys::ptrace;
        use nix::sys::wait::waitpid;

        ptrace::step(self.pid, None)?;
        let status = waitpid(self.pid, None)?;

        Ok(StopReason::from_wait_status(status, StopReason::Step))
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = nix::sys::ptrace::detach(self.pid, None);
    }
}
