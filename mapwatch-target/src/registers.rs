//! レジスタアクセス機能

use crate::Result;
use nix::unistd::Pid;

/// システムコール入口でのレジスタスナップショット
///
/// x86_64 Linux の呼び出し規約: 番号は RAX、引数は
/// RDI, RSI, RDX, R10, R8, R9 の順。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRegisters {
    pub number: u64,
    pub args: [u64; 6],
    pub pc: u64,
}

impl SyscallRegisters {
    /// user_regs_struct から引数レジスタを取り出す
    pub fn from_regs(regs: &nix::libc::user_regs_struct) -> Self {
        Self {
            number: regs.rax,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            pc: regs.rip,
        }
    }
}

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<nix::libc::user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: nix::libc::user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        let regs = self.read()?;
        Ok(regs.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }

    /// 戻り値レジスタ（RAX）を符号付きで取得する
    pub fn get_return_value(&self) -> Result<i64> {
        let regs = self.read()?;
        Ok(regs.rax as i64)
    }

    /// システムコール番号と引数を読み取る
    pub fn syscall_args(&self) -> Result<SyscallRegisters> {
        let regs = self.read()?;
        Ok(SyscallRegisters::from_regs(&regs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_registers_order() {
        // SAFETY: user_regs_struct は整数フィールドのみで構成される
        let mut regs: nix::libc::user_regs_struct = unsafe { std::mem::zeroed() };
        regs.rax = 9;
        regs.rdi = 1;
        regs.rsi = 2;
        regs.rdx = 3;
        regs.r10 = 4;
        regs.r8 = 5;
        regs.r9 = 6;
        regs.rip = 0x7f00_0000_1000;

        let sc = SyscallRegisters::from_regs(&regs);
        assert_eq!(sc.number, 9);
        assert_eq!(sc.args, [1, 2, 3, 4, 5, 6]);
        assert_eq!(sc.pc, 0x7f00_0000_1000);
    }
}
