//! トレースセッション
//!
//! プロセス、トラップコーディネータ、トラッカーをまとめて所有し、
//! 捕捉したシステムコールを1つずつトラッカーに渡す。

use crate::audit::{audit, Drift};
use crate::breakpoint::SyscallSite;
use crate::locator::{LoadedModule, Locator, DEFAULT_LIBRARY_PATTERN};
use crate::trap::{PtraceCoordinator, TrapEvent};
use crate::{Result, SyscallEvent, Tracker, TrackerConfig, TrackerError};
use mapwatch_target::{Process, StopReason};
use std::path::Path;
use tracing::{info, warn};

/// セッションの設定
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// C ライブラリのパスにマッチする正規表現
    pub library_pattern: String,
    pub config: TrackerConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            library_pattern: DEFAULT_LIBRARY_PATTERN.to_string(),
            config: TrackerConfig::from_host(),
        }
    }
}

/// 1回の実行で起きたこと
#[derive(Debug)]
pub enum Progress {
    /// システムコールを処理し、モデルを更新した
    Reconciled { event: SyscallEvent, retval: i64 },
    /// モデルと実際がずれていた（セッションは継続する）
    Fault { event: SyscallEvent, error: TrackerError },
    /// プロセスが終了した
    Exited(StopReason),
}

/// トレースセッション
pub struct Session {
    coordinator: PtraceCoordinator,
    tracker: Tracker,
    module: LoadedModule,
    exited: Option<StopReason>,
}

impl Session {
    /// 実行可能ファイルを起動してトレースを開始する
    ///
    /// エントリポイントまで実行し、動的リンカが C ライブラリを読み込んでから
    /// ブレークポイントを設定する。
    pub fn launch<P: AsRef<Path>>(program: P, args: &[String], options: &SessionOptions) -> Result<Self> {
        let process = Process::spawn(program, args)?;
        let mut coordinator = PtraceCoordinator::new(process);

        let entry = coordinator.memory().entry_point()?;
        let reason = coordinator.run_to_address(entry)?;
        if reason.is_terminal() {
            return Err(anyhow::anyhow!("Process terminated before reaching entry point: {:?}", reason));
        }

        Self::install(coordinator, options)
    }

    /// 既存のプロセスにアタッチしてトレースを開始する
    pub fn attach(pid: i32, options: &SessionOptions) -> Result<Self> {
        let process = Process::attach(pid)?;
        Self::install(PtraceCoordinator::new(process), options)
    }

    fn install(mut coordinator: PtraceCoordinator, options: &SessionOptions) -> Result<Self> {
        let locator = Locator::new(&options.library_pattern)?;
        let module = locator.load_module(coordinator.memory())?;
        let sites = locator.syscall_sites(coordinator.memory(), &module)?;
        if sites.is_empty() {
            return Err(anyhow::anyhow!("No syscall instructions found in {}", module.path));
        }

        let armed = coordinator.arm(&sites)?;
        info!(pid = coordinator.pid(), module = %module.path, armed, "syscall sites armed");

        let tracker = Tracker::new(coordinator.pid(), options.config);
        Ok(Self {
            coordinator,
            tracker,
            module,
            exited: None,
        })
    }

    pub fn pid(&self) -> i32 {
        self.tracker.pid()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn module(&self) -> &LoadedModule {
        &self.module
    }

    /// 設定したシステムコールサイト
    pub fn sites(&self) -> impl Iterator<Item = &SyscallSite> {
        self.coordinator.sites()
    }

    /// 終了していれば、その理由
    pub fn exited(&self) -> Option<&StopReason> {
        self.exited.as_ref()
    }

    /// 次の追跡対象システムコールを処理するか、終了するまで実行する
    pub fn run_until_event(&mut self) -> Result<Progress> {
        if let Some(reason) = &self.exited {
            return Ok(Progress::Exited(reason.clone()));
        }

        match self.coordinator.wait_for_syscall()? {
            TrapEvent::Syscall(event) => {
                match self.tracker.handle_syscall(&event, &mut self.coordinator) {
                    Ok(retval) => Ok(Progress::Reconciled { event, retval }),
                    Err(error) if error.is_consistency_fault() => {
                        warn!(pid = self.pid(), %error, "memory map model drifted");
                        Ok(Progress::Fault { event, error })
                    }
                    Err(error) => Err(error.into()),
                }
            }
            TrapEvent::Exited(reason) => {
                info!(pid = self.pid(), ?reason, "process exited");
                self.exited = Some(reason.clone());
                Ok(Progress::Exited(reason))
            }
        }
    }

    /// プロセスが終了するまで実行する
    ///
    /// 各イベントの後に `on_progress` が呼ばれる。
    pub fn run_to_end<F>(&mut self, mut on_progress: F) -> Result<StopReason>
    where
        F: FnMut(&Progress, &Tracker),
    {
        loop {
            let progress = self.run_until_event()?;
            on_progress(&progress, &self.tracker);
            if let Progress::Exited(reason) = progress {
                return Ok(reason);
            }
        }
    }

    /// モデルを /proc/pid/maps と照合する
    pub fn verify(&self) -> Result<Vec<Drift>> {
        if self.exited.is_some() {
            return Err(anyhow::anyhow!("Process {} has exited", self.pid()));
        }
        let mappings = self.coordinator.memory().get_mappings()?;
        Ok(audit(self.tracker.regions(), &mappings))
    }
}
