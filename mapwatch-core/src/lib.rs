//! mapwatch のコア機能
//!
//! このクレートは、トレース対象プロセスのメモリマップモデルを提供します。
//! libc のシステムコールラッパーにトラップを仕掛け、mmap / munmap / mprotect /
//! mremap / brk の結果から領域コレクションとプログラムブレークを更新します。

pub mod region;
pub mod syscall;
pub mod config;
pub mod errors;
pub mod tracker;
pub mod trap;
pub mod breakpoint;
pub mod disasm;
pub mod locator;
pub mod audit;
pub mod session;
pub mod command;
pub mod parse;

pub use region::{Protection, Region, RegionId, RegionSet};
pub use syscall::{is_error, Syscall, SyscallEvent};
pub use config::TrackerConfig;
pub use errors::TrackerError;
pub use tracker::Tracker;
pub use trap::{PtraceCoordinator, TrapCoordinator, TrapEvent};
pub use breakpoint::SyscallSite;
pub use audit::Drift;
pub use session::{Progress, Session, SessionOptions};
pub use command::Command;

// 他のクレートから使用するために再エクスポート
pub use mapwatch_target::StopReason;

/// コア機能の結果型
pub type Result<T> = anyhow::Result<T>;
