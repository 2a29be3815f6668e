//! mapwatch ターゲットプロセス制御
//!
//! このクレートは、トレース対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、INT3ブレークポイントの設定などを行います。

pub mod process;
pub mod memory;
pub mod registers;
pub mod breakpoint;

pub use process::{Process, StopReason};
pub use memory::{Memory, MemoryMapping};
pub use registers::{Registers, SyscallRegisters};
pub use breakpoint::SoftwareBreakpoint;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
