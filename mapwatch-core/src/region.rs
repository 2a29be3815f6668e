//! 追跡対象のメモリ領域
//!
//! `Region` は1つの連続したマッピング（通常は1ページ）を表し、
//! `RegionSet` はそれをアドレス昇順に保持するコレクションです。
//! ハンドラは `RegionSet` の操作（検索・挿入・末尾削除・退去）だけを使うので、
//! 内部の `Vec` は区間木などに差し替えられます。

use std::fmt;

/// 領域ID（トラッカーの寿命の間は再利用されない）
pub type RegionId = u64;

/// 保護属性（PROT_READ | PROT_WRITE | PROT_EXEC のビットマスク）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protection(pub i32);

impl Protection {
    pub const NONE: Protection = Protection(nix::libc::PROT_NONE);
    pub const READ: Protection = Protection(nix::libc::PROT_READ);
    pub const WRITE: Protection = Protection(nix::libc::PROT_WRITE);
    pub const EXEC: Protection = Protection(nix::libc::PROT_EXEC);
    pub const READ_WRITE: Protection = Protection(nix::libc::PROT_READ | nix::libc::PROT_WRITE);

    /// システムコール引数から作成する
    pub fn from_raw(raw: u64) -> Self {
        Protection(raw as i32)
    }

    pub fn readable(&self) -> bool {
        self.0 & nix::libc::PROT_READ != 0
    }

    pub fn writable(&self) -> bool {
        self.0 & nix::libc::PROT_WRITE != 0
    }

    pub fn executable(&self) -> bool {
        self.0 & nix::libc::PROT_EXEC != 0
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.readable() { 'r' } else { '-' },
            if self.writable() { 'w' } else { '-' },
            if self.executable() { 'x' } else { '-' },
        )
    }
}

/// 追跡中のマッピング1つ分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: RegionId,
    pub begin: u64,
    pub length: u64,
    pub protection: Protection,
}

impl Region {
    /// 領域を作成する
    pub fn new(id: RegionId, begin: u64, length: u64, protection: Protection) -> Self {
        debug_assert!(length > 0, "region length must be positive");
        Self {
            id,
            begin,
            length,
            protection,
        }
    }

    /// 終端アドレス（含まない）
    pub fn end(&self) -> u64 {
        self.begin + self.length
    }

    /// 半開区間 [begin, end) にアドレスが含まれるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.begin && addr < self.end()
    }

    /// [begin, end) と重なるか
    pub fn overlaps(&self, begin: u64, end: u64) -> bool {
        self.begin < end && begin < self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "#{:<4} 0x{:012x}-0x{:012x} {} ({} bytes)",
            self.id,
            self.begin,
            self.end(),
            self.protection,
            self.length
        )
    }
}

/// アドレス順の領域コレクション
#[derive(Debug, Default, Clone)]
pub struct RegionSet {
    regions: Vec<Region>,
}

impl RegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Region> {
        self.regions.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// index 以降の領域を可変で走査する
    pub fn iter_mut_from(&mut self, index: usize) -> impl Iterator<Item = &mut Region> {
        self.regions.iter_mut().skip(index)
    }

    /// アドレスを含む領域のインデックスを返す
    ///
    /// ソート済みかつ重なりがないので、`begin <= addr` を満たす最後の領域だけを調べればよい。
    pub fn find(&self, addr: u64) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.begin <= addr);
        let candidate = idx.checked_sub(1)?;
        self.regions[candidate].contains(addr).then_some(candidate)
    }

    /// 領域を追加する（順序は `sort` で回復する）
    pub fn insert(&mut self, region: Region) {
        self.regions.push(region);
    }

    /// 先頭アドレス順に並べ直す
    pub fn sort(&mut self) {
        self.regions.sort_by_key(|r| r.begin);
    }

    /// start から始まる連続領域の数を数える（最大 max 個）
    ///
    /// 次の領域の先頭が直前の領域の終端と一致しなければ、そこで連続は途切れる。
    pub fn run_len(&self, start: usize, max: usize) -> usize {
        if start >= self.regions.len() || max == 0 {
            return 0;
        }
        let mut count = 1;
        while count < max {
            let next = start + count;
            match (self.regions.get(next - 1), self.regions.get(next)) {
                (Some(prev), Some(cur)) if cur.begin == prev.end() => count += 1,
                _ => break,
            }
        }
        count
    }

    /// start から始まる連続領域を最大 n 個削除し、削除した数を返す
    ///
    /// コレクション末尾の領域も削除できる。
    pub fn remove_run(&mut self, start: usize, n: usize) -> usize {
        let count = self.run_len(start, n);
        self.regions.drain(start..start + count);
        count
    }

    /// 1つの領域を取り除く
    pub fn remove(&mut self, index: usize) -> Option<Region> {
        (index < self.regions.len()).then(|| self.regions.remove(index))
    }

    /// [begin, end) と重なる領域をすべて取り除き、その数を返す
    pub fn evict(&mut self, begin: u64, end: u64) -> usize {
        let before = self.regions.len();
        self.regions.retain(|r| !r.overlaps(begin, end));
        before - self.regions.len()
    }

    /// 昇順かつ重なりなしであるか
    pub fn is_consistent(&self) -> bool {
        self.regions.windows(2).all(|w| w[0].end() <= w[1].begin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 0x1000;

    fn run(base: u64, pages: u64) -> RegionSet {
        let mut set = RegionSet::new();
        for i in 0..pages {
            set.insert(Region::new(i + 1, base + i * PAGE, PAGE, Protection::READ_WRITE));
        }
        set
    }

    #[test]
    fn test_find_half_open() {
        let set = run(0x10000, 2);
        assert_eq!(set.find(0x10000), Some(0));
        assert_eq!(set.find(0x10fff), Some(0));
        assert_eq!(set.find(0x11000), Some(1));
        // 最後の領域の終端の1バイト先は含まれない
        assert_eq!(set.find(0x12000), None);
        assert_eq!(set.find(0xffff), None);
    }

    #[test]
    fn test_find_skips_holes() {
        let mut set = run(0x10000, 1);
        set.insert(Region::new(9, 0x20000, 0x10, Protection::READ));
        set.sort();
        assert_eq!(set.find(0x15000), None);
        assert_eq!(set.find(0x2000f), Some(1));
        assert_eq!(set.find(0x20010), None);
    }

    #[test]
    fn test_remove_run_stops_at_hole() {
        let mut set = run(0x10000, 2);
        set.insert(Region::new(9, 0x40000, PAGE, Protection::READ));
        set.sort();

        assert_eq!(set.remove_run(0, 5), 2);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(0).unwrap().begin, 0x40000);
    }

    #[test]
    fn test_remove_run_last_element_is_removable() {
        let mut set = run(0x10000, 3);
        assert_eq!(set.remove_run(2, 1), 1);
        assert_eq!(set.len(), 2);

        let mut single = run(0x10000, 1);
        assert_eq!(single.remove_run(0, 1), 1);
        assert!(single.is_empty());
    }

    #[test]
    fn test_remove_run_bounds() {
        let mut set = run(0x10000, 3);
        assert_eq!(set.remove_run(1, 0), 0);
        assert_eq!(set.remove_run(7, 2), 0);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_evict() {
        let mut set = run(0x10000, 4);
        assert_eq!(set.evict(0x11000, 0x13000), 2);
        let begins: Vec<u64> = set.iter().map(|r| r.begin).collect();
        assert_eq!(begins, vec![0x10000, 0x13000]);
    }

    #[test]
    fn test_protection_display() {
        assert_eq!(Protection::READ_WRITE.to_string(), "rw-");
        assert_eq!(Protection::EXEC.to_string(), "--x");
        assert_eq!(Protection::NONE.to_string(), "---");
    }
}
