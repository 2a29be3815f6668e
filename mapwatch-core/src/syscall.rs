//! システムコールイベント
//!
//! 呼び出し規約（どのレジスタがどの引数か）は `mapwatch_target::SyscallRegisters`
//! が吸収し、ハンドラは型付きの `SyscallEvent` だけを扱う。

use mapwatch_target::SyscallRegisters;
use std::fmt;

/// カーネルが -errno として返し得る最大のエラー番号
const MAX_ERRNO: i64 = 4095;

/// 戻り値がシステムコール失敗（-errno）を表すかどうか
pub fn is_error(retval: i64) -> bool {
    (-MAX_ERRNO..=-1).contains(&retval)
}

/// 追跡対象のシステムコール
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syscall {
    Mmap,
    Munmap,
    Mprotect,
    Mremap,
    Brk,
    /// 追跡対象外
    Other(u64),
}

impl Syscall {
    const SYS_MMAP: u64 = nix::libc::SYS_mmap as u64;
    const SYS_MUNMAP: u64 = nix::libc::SYS_munmap as u64;
    const SYS_MPROTECT: u64 = nix::libc::SYS_mprotect as u64;
    const SYS_MREMAP: u64 = nix::libc::SYS_mremap as u64;
    const SYS_BRK: u64 = nix::libc::SYS_brk as u64;

    /// 追跡対象の5種類
    pub const TRACKED: [Syscall; 5] = [
        Syscall::Mmap,
        Syscall::Munmap,
        Syscall::Mprotect,
        Syscall::Mremap,
        Syscall::Brk,
    ];

    /// システムコール番号から変換する
    pub fn from_number(number: u64) -> Self {
        match number {
            Self::SYS_MMAP => Syscall::Mmap,
            Self::SYS_MUNMAP => Syscall::Munmap,
            Self::SYS_MPROTECT => Syscall::Mprotect,
            Self::SYS_MREMAP => Syscall::Mremap,
            Self::SYS_BRK => Syscall::Brk,
            other => Syscall::Other(other),
        }
    }

    /// システムコール番号
    pub fn number(&self) -> u64 {
        match self {
            Syscall::Mmap => Self::SYS_MMAP,
            Syscall::Munmap => Self::SYS_MUNMAP,
            Syscall::Mprotect => Self::SYS_MPROTECT,
            Syscall::Mremap => Self::SYS_MREMAP,
            Syscall::Brk => Self::SYS_BRK,
            Syscall::Other(n) => *n,
        }
    }

    pub fn is_tracked(&self) -> bool {
        !matches!(self, Syscall::Other(_))
    }

    /// libc 内のラッパー関数名（別名を含む）
    pub fn wrapper_symbols(&self) -> &'static [&'static str] {
        match self {
            Syscall::Mmap => &["mmap", "mmap64", "__mmap"],
            Syscall::Munmap => &["munmap", "__munmap"],
            Syscall::Mprotect => &["mprotect", "__mprotect"],
            Syscall::Mremap => &["mremap", "__mremap"],
            Syscall::Brk => &["brk", "__brk"],
            Syscall::Other(_) => &[],
        }
    }

    /// 表示に使う引数の数
    fn arity(&self) -> usize {
        match self {
            Syscall::Mmap => 6,
            Syscall::Munmap => 2,
            Syscall::Mprotect => 3,
            Syscall::Mremap => 5,
            Syscall::Brk => 1,
            Syscall::Other(_) => 6,
        }
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Syscall::Mmap => write!(f, "mmap"),
            Syscall::Munmap => write!(f, "munmap"),
            Syscall::Mprotect => write!(f, "mprotect"),
            Syscall::Mremap => write!(f, "mremap"),
            Syscall::Brk => write!(f, "brk"),
            Syscall::Other(n) => write!(f, "syscall_{}", n),
        }
    }
}

/// システムコール入口で捕捉したイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallEvent {
    pub syscall: Syscall,
    pub args: [u64; 6],
    /// トラップを置いた syscall 命令のアドレス
    pub site: u64,
}

impl SyscallEvent {
    pub fn new(syscall: Syscall, args: [u64; 6], site: u64) -> Self {
        Self { syscall, args, site }
    }

    /// 入口のレジスタスナップショットから作成する
    pub fn from_registers(regs: &SyscallRegisters, site: u64) -> Self {
        Self::new(Syscall::from_number(regs.number), regs.args, site)
    }

    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }
}

impl fmt::Display for SyscallEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}(", self.syscall)?;
        for (i, arg) in self.args.iter().take(self.syscall.arity()).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "0x{:x}", arg)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbers_round_trip_for_tracked() {
        for sc in Syscall::TRACKED {
            assert_eq!(Syscall::from_number(sc.number()), sc);
            assert!(sc.is_tracked());
            assert!(!sc.wrapper_symbols().is_empty());
        }
        assert_eq!(Syscall::from_number(0), Syscall::Other(0));
        assert!(!Syscall::Other(0).is_tracked());
    }

    #[test]
    fn test_is_error() {
        assert!(is_error(-1));
        assert!(is_error(-12));
        assert!(is_error(-4095));
        assert!(!is_error(0));
        assert!(!is_error(0x7f12_3456_7000));
        // 上位アドレスのように見える値はエラーではない
        assert!(!is_error(-4096));
    }

    #[test]
    fn test_event_display() {
        let ev = SyscallEvent::new(Syscall::Munmap, [0x7f0000001000, 0x2000, 0, 0, 0, 0], 0);
        assert_eq!(ev.to_string(), "munmap(0x7f0000001000, 0x2000)");
    }
}
