//! メモリマップトラッカー
//!
//! 捕捉した mmap / munmap / mprotect / mremap / brk の結果から、
//! トレース対象プロセスのアドレス空間モデルを更新する。
//!
//! 各ハンドラは同じ流れで動く:
//! 1. 入口のイベント（引数）を受け取る
//! 2. トラップコーディネータにシステムコールを最後まで実行させ、戻り値を得る
//! 3. 失敗（-errno）ならモデルは変更せず戻り値をそのまま返す
//! 4. 成功なら領域コレクションを分割・削除・伸縮・属性変更し、アドレス順に並べ直す

use crate::{
    is_error, Protection, Region, RegionId, RegionSet, Syscall, SyscallEvent, TrackerConfig,
    TrackerError, TrapCoordinator,
};
use std::fmt;
use tracing::{debug, info};

/// トラップを次回の呼び出しのために残す
const KEEP_ARMED: bool = true;

/// mremap のフラグ: 古いマッピングを残したまま移動する
const MREMAP_DONTUNMAP: u64 = 4;

/// トラッカーの結果型
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// 1つのトレース対象プロセスのメモリマップモデル
pub struct Tracker {
    pid: i32,
    regions: RegionSet,
    origin_break: Option<u64>,
    current_break: Option<u64>,
    next_id: RegionId,
    config: TrackerConfig,
}

impl Tracker {
    /// 新しいトラッカーを作成する
    pub fn new(pid: i32, config: TrackerConfig) -> Self {
        Self {
            pid,
            regions: RegionSet::new(),
            origin_break: None,
            current_break: None,
            next_id: 0,
            config,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// 最初に観測したプログラムブレーク
    pub fn origin_break(&self) -> Option<u64> {
        self.origin_break
    }

    /// 最後に観測したプログラムブレーク
    pub fn current_break(&self) -> Option<u64> {
        self.current_break
    }

    /// 追跡中の領域（アドレス順）
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// アドレスを含む領域を検索する
    pub fn find(&self, addr: u64) -> Option<&Region> {
        self.regions.find(addr).and_then(|idx| self.regions.get(idx))
    }

    /// 捕捉したシステムコールを処理する
    ///
    /// 外部から呼べる唯一の入口。追跡対象外のシステムコールは
    /// そのまま実行して生の戻り値を返す。
    pub fn handle_syscall<T: TrapCoordinator + ?Sized>(
        &mut self,
        event: &SyscallEvent,
        trap: &mut T,
    ) -> TrackerResult<i64> {
        match event.syscall {
            Syscall::Mmap => self.handle_mmap(event, trap),
            Syscall::Munmap => self.handle_munmap(event, trap),
            Syscall::Mprotect => self.handle_mprotect(event, trap),
            Syscall::Mremap => self.handle_mremap(event, trap),
            Syscall::Brk => self.handle_brk(event, trap),
            Syscall::Other(_) => self.complete(event, trap),
        }
    }

    /// システムコールを出口まで実行し、入口と出口を通知する
    fn complete<T: TrapCoordinator + ?Sized>(
        &self,
        event: &SyscallEvent,
        trap: &mut T,
    ) -> TrackerResult<i64> {
        info!(pid = self.pid, site = format_args!("0x{:x}", event.site), "enter {}", event);
        let retval = trap.run_to_exit(event, KEEP_ARMED)?;
        if is_error(retval) {
            info!(pid = self.pid, errno = -retval, "exit {} = {}", event.syscall, retval);
        } else {
            info!(pid = self.pid, "exit {} = 0x{:x}", event.syscall, retval);
        }
        Ok(retval)
    }

    fn not_found(event: &SyscallEvent, addr: u64, retval: i64) -> TrackerError {
        TrackerError::RegionNotFound {
            syscall: event.syscall,
            addr,
            retval,
        }
    }

    fn alloc_id(&mut self) -> RegionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// [base, base + length) をページ単位の領域に分割して追加する
    ///
    /// ページサイズで割り切れない残りは、最後の短い領域になる。
    fn insert_pages(&mut self, base: u64, length: u64, protection: Protection) -> usize {
        let page = self.config.page_size();
        let mut offset = 0;
        let mut count = 0;
        while offset < length {
            let len = page.min(length - offset);
            let id = self.alloc_id();
            self.regions.insert(Region::new(id, base + offset, len, protection));
            offset += len;
            count += 1;
        }
        count
    }

    /// mmap: 匿名プライベートマッピングだけを追跡する
    ///
    /// 引数: addr, length, prot, flags, fd, offset
    fn handle_mmap<T: TrapCoordinator + ?Sized>(
        &mut self,
        event: &SyscallEvent,
        trap: &mut T,
    ) -> TrackerResult<i64> {
        let length = event.arg(1);
        let prot = Protection::from_raw(event.arg(2));
        let flags = event.arg(3);

        let retval = self.complete(event, trap)?;
        if is_error(retval) || length == 0 {
            return Ok(retval);
        }

        let base = retval as u64;

        // 成功したMAP_FIXEDは既存のマッピングを置き換えている
        let evicted = self.regions.evict(base, base.saturating_add(self.config.page_align(length)));
        if evicted > 0 {
            debug!(pid = self.pid, evicted, "mmap replaced tracked regions");
        }

        let shared = flags & nix::libc::MAP_SHARED as u64 != 0;
        let anonymous = flags & nix::libc::MAP_ANONYMOUS as u64 != 0;
        if shared || !anonymous {
            debug!(pid = self.pid, shared, anonymous, "mmap not tracked");
            return Ok(retval);
        }

        let created = self.insert_pages(base, length, prot);
        self.regions.sort();
        debug_assert!(self.regions.is_consistent());
        info!(pid = self.pid, created, base = format_args!("0x{:x}", base), %prot, "mapped regions");

        Ok(retval)
    }

    /// munmap: 解放された範囲に重なる領域をすべて取り除く
    ///
    /// 引数: addr, length
    ///
    /// カーネルは [addr, page_align(addr + length)) を丸ごと解放するので、
    /// 途中に追跡外のマッピングがあっても、その先の領域まで取り除く。
    fn handle_munmap<T: TrapCoordinator + ?Sized>(
        &mut self,
        event: &SyscallEvent,
        trap: &mut T,
    ) -> TrackerResult<i64> {
        let addr = event.arg(0);
        let length = event.arg(1);

        let retval = self.complete(event, trap)?;
        if is_error(retval) {
            return Ok(retval);
        }

        self.regions
            .find(addr)
            .ok_or_else(|| Self::not_found(event, addr, retval))?;

        // 見つかった領域は必ず含める
        let end = self.config.page_align(addr.saturating_add(length)).max(addr.saturating_add(1));
        let removed = self.regions.evict(addr, end);
        self.regions.sort();
        info!(pid = self.pid, removed, "unmapped regions");

        Ok(retval)
    }

    /// mprotect: 対象領域と、要求範囲内の後続領域の保護属性を更新する
    ///
    /// 引数: addr, length, prot
    fn handle_mprotect<T: TrapCoordinator + ?Sized>(
        &mut self,
        event: &SyscallEvent,
        trap: &mut T,
    ) -> TrackerResult<i64> {
        let addr = event.arg(0);
        let length = event.arg(1);
        let prot = Protection::from_raw(event.arg(2));

        let retval = self.complete(event, trap)?;
        // 長さ0の mprotect はカーネル側でも何も変えない
        if is_error(retval) || length == 0 {
            return Ok(retval);
        }

        let idx = self
            .regions
            .find(addr)
            .ok_or_else(|| Self::not_found(event, addr, retval))?;

        let end = self.config.page_align(addr.saturating_add(length));
        let mut updated = 0;
        for region in self.regions.iter_mut_from(idx) {
            if updated > 0 && region.begin >= end {
                break;
            }
            region.protection = prot;
            updated += 1;
        }
        info!(pid = self.pid, updated, %prot, "changed protection");

        Ok(retval)
    }

    /// mremap: 移動・サイズ不変・縮小・拡大の4通り
    ///
    /// 引数: old_addr, old_size, new_size, flags, new_addr
    ///
    /// 移動した場合は「古い末尾を削除し、先頭領域を移動し、その場でリサイズ」
    /// という順で処理するので、サイズの組み合わせによらず同じ規則になる。
    fn handle_mremap<T: TrapCoordinator + ?Sized>(
        &mut self,
        event: &SyscallEvent,
        trap: &mut T,
    ) -> TrackerResult<i64> {
        let old_addr = event.arg(0);
        let old_size = event.arg(1);
        let new_size = event.arg(2);
        let flags = event.arg(3);

        let retval = self.complete(event, trap)?;
        if is_error(retval) {
            return Ok(retval);
        }

        let idx = self
            .regions
            .find(old_addr)
            .ok_or_else(|| Self::not_found(event, old_addr, retval))?;
        let (begin, protection) = match self.regions.get(idx) {
            Some(r) => (r.begin, r.protection),
            None => return Err(Self::not_found(event, old_addr, retval)),
        };

        let base = retval as u64;
        let old_pages = self.config.pages(old_size).max(1) as usize;
        let run = self.regions.run_len(idx, old_pages);

        if base != begin {
            self.relocate(idx, run, base, new_size, protection, flags & MREMAP_DONTUNMAP != 0);
            info!(
                pid = self.pid,
                from = format_args!("0x{:x}", begin),
                to = format_args!("0x{:x}", base),
                new_size,
                "relocated regions"
            );
        } else if old_size == new_size {
            return Ok(retval);
        } else {
            self.resize_run(idx, run, new_size);
            info!(pid = self.pid, old_size, new_size, "resized regions in place");
        }

        self.regions.sort();
        debug_assert!(self.regions.is_consistent());
        Ok(retval)
    }

    /// 移動: 古い連続領域を片付け、先頭領域を新しいベースへ移してからリサイズする
    fn relocate(
        &mut self,
        idx: usize,
        run: usize,
        base: u64,
        new_size: u64,
        protection: Protection,
        keep_old: bool,
    ) {
        let dest_end = base.saturating_add(self.config.page_align(new_size));

        if keep_old {
            // MREMAP_DONTUNMAP: 古い領域はそのまま残り、移動先は新しい領域になる
            self.regions.evict(base, dest_end);
            self.insert_pages(base, new_size, protection);
            return;
        }

        self.regions.remove_run(idx + 1, run.saturating_sub(1));
        let Some(mut head) = self.regions.remove(idx) else {
            return;
        };
        self.regions.evict(base, dest_end);

        head.begin = base;
        head.length = head.length.min(self.config.page_size());
        self.regions.insert(head);
        self.regions.sort();

        if let Some(new_idx) = self.regions.find(base) {
            self.resize_run(new_idx, 1, new_size);
        }
    }

    /// idx から始まる run 個の連続領域を new_size バイトに合わせる
    ///
    /// 縮小なら余った末尾を削除し、拡大なら末尾の短い断片を1ページに広げてから
    /// 新しいページ領域を追加する。追加分は先頭領域の保護属性を引き継ぐ。
    fn resize_run(&mut self, idx: usize, run: usize, new_size: u64) {
        let page = self.config.page_size();
        let Some((base, protection)) = self.regions.get(idx).map(|r| (r.begin, r.protection)) else {
            return;
        };

        let new_pages = self.config.pages(new_size).max(1) as usize;
        if new_pages < run {
            self.regions.remove_run(idx + new_pages, run - new_pages);
        }

        let kept = run.min(new_pages);
        for k in 0..kept {
            let offset = k as u64 * page;
            if let Some(region) = self.regions.get_mut(idx + k) {
                region.length = page.min(new_size.saturating_sub(offset)).max(1);
            }
        }

        let grown_from = kept as u64 * page;
        if new_size > grown_from {
            self.regions
                .evict(base + grown_from, base.saturating_add(self.config.page_align(new_size)));
            self.insert_pages(base + grown_from, new_size - grown_from, protection);
        }
    }

    /// brk: 最初の成功で起点、それ以降は現在値を更新する
    ///
    /// 引数: addr
    fn handle_brk<T: TrapCoordinator + ?Sized>(
        &mut self,
        event: &SyscallEvent,
        trap: &mut T,
    ) -> TrackerResult<i64> {
        let retval = self.complete(event, trap)?;
        if retval < 0 {
            return Ok(retval);
        }

        let brk = retval as u64;
        match self.origin_break {
            None => {
                self.origin_break = Some(brk);
                info!(pid = self.pid, origin = format_args!("0x{:x}", brk), "program break origin");
            }
            Some(_) => {
                self.current_break = Some(brk);
                info!(pid = self.pid, current = format_args!("0x{:x}", brk), "program break moved");
            }
        }

        Ok(retval)
    }
}

fn fmt_break(value: Option<u64>) -> String {
    value
        .map(|v| format!("0x{:x}", v))
        .unwrap_or_else(|| "<unset>".to_string())
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Process {} memory map", self.pid)?;
        writeln!(f, "  Origin program break:  {}", fmt_break(self.origin_break))?;
        writeln!(f, "  Current program break: {}", fmt_break(self.current_break))?;
        writeln!(f, "  Tracked regions: {}", self.regions.len())?;
        for region in self.regions.iter() {
            writeln!(f, "    {}", region)?;
        }
        Ok(())
    }
}
