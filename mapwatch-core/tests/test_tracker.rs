//! 公開APIを通したトラッカーのシナリオテスト

use mapwatch_core::{Protection, Syscall, SyscallEvent, Tracker, TrackerConfig, TrapCoordinator};
use std::collections::VecDeque;

const PAGE: u64 = 4096;
const BASE: u64 = 0x7ffff7fb0000;
const ANON_PRIVATE: u64 = (nix::libc::MAP_PRIVATE | nix::libc::MAP_ANONYMOUS) as u64;

/// 事前に決めた戻り値を返し、実行したシステムコールを記録するコーディネータ
#[derive(Default)]
struct FakeTrap {
    results: VecDeque<i64>,
    executed: Vec<Syscall>,
}

impl FakeTrap {
    fn returning(&mut self, retval: i64) -> &mut Self {
        self.results.push_back(retval);
        self
    }
}

impl TrapCoordinator for FakeTrap {
    fn run_to_exit(&mut self, event: &SyscallEvent, _keep_armed: bool) -> anyhow::Result<i64> {
        self.executed.push(event.syscall);
        self.results
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("unexpected {}", event.syscall))
    }
}

fn call(tracker: &mut Tracker, trap: &mut FakeTrap, syscall: Syscall, args: &[u64], retval: i64) -> i64 {
    let mut full = [0u64; 6];
    full[..args.len()].copy_from_slice(args);
    let event = SyscallEvent::new(syscall, full, 0x7ffff7e00000);
    trap.returning(retval);
    tracker.handle_syscall(&event, trap).unwrap()
}

fn assert_well_formed(tracker: &Tracker) {
    let regions: Vec<_> = tracker.regions().collect();
    for pair in regions.windows(2) {
        assert!(pair[0].begin < pair[1].begin, "unsorted: {} / {}", pair[0], pair[1]);
        assert!(pair[0].end() <= pair[1].begin, "overlap: {} / {}", pair[0], pair[1]);
    }
    assert!(regions.iter().all(|r| r.length > 0));
}

#[test]
fn test_map_protect_unmap_lifecycle() {
    let mut tracker = Tracker::new(100, TrackerConfig::default());
    let mut trap = FakeTrap::default();

    let rw = Protection::READ_WRITE.0 as u64;
    let ret = call(&mut tracker, &mut trap, Syscall::Mmap, &[0, 2 * PAGE, rw, ANON_PRIVATE, u64::MAX, 0], BASE as i64);
    assert_eq!(ret, BASE as i64);

    let ids: Vec<u64> = tracker.regions().map(|r| r.id).collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[1], ids[0] + 1);
    assert_eq!(tracker.find(BASE).unwrap().length, PAGE);
    assert_eq!(tracker.find(BASE + PAGE).unwrap().length, PAGE);

    call(&mut tracker, &mut trap, Syscall::Mprotect, &[BASE, PAGE, Protection::EXEC.0 as u64], 0);
    assert_eq!(tracker.find(BASE).unwrap().protection, Protection::EXEC);
    assert_eq!(tracker.find(BASE + PAGE).unwrap().protection, Protection::READ_WRITE);

    call(&mut tracker, &mut trap, Syscall::Munmap, &[BASE, 2 * PAGE], 0);
    assert_eq!(tracker.region_count(), 0);
    assert_eq!(
        trap.executed,
        vec![Syscall::Mmap, Syscall::Mprotect, Syscall::Munmap]
    );
}

#[test]
fn test_small_mapping_is_one_short_region() {
    let mut tracker = Tracker::new(100, TrackerConfig::default());
    let mut trap = FakeTrap::default();

    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, 27, 3, ANON_PRIVATE, u64::MAX, 0], BASE as i64);

    let region = tracker.find(BASE).unwrap();
    assert_eq!(region.length, 27);
    assert!(tracker.find(BASE + 27).is_none());
}

#[test]
fn test_program_break_origin_then_current() {
    let mut tracker = Tracker::new(100, TrackerConfig::default());
    let mut trap = FakeTrap::default();
    let a = 0x555555559000u64;
    let b = a + 0x21000;

    assert_eq!(tracker.origin_break(), None);
    call(&mut tracker, &mut trap, Syscall::Brk, &[0], a as i64);
    assert_eq!(tracker.origin_break(), Some(a));
    assert_eq!(tracker.current_break(), None);

    call(&mut tracker, &mut trap, Syscall::Brk, &[b], b as i64);
    assert_eq!(tracker.origin_break(), Some(a));
    assert_eq!(tracker.current_break(), Some(b));

    let dump = tracker.to_string();
    assert!(dump.contains(&format!("0x{:x}", a)));
    assert!(dump.contains(&format!("0x{:x}", b)));
}

#[test]
fn test_remap_shrink_then_grow_in_place() {
    let mut tracker = Tracker::new(100, TrackerConfig::default());
    let mut trap = FakeTrap::default();

    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, 3 * PAGE, 3, ANON_PRIVATE, u64::MAX, 0], BASE as i64);
    assert_eq!(tracker.region_count(), 3);
    let earlier_max = tracker.regions().map(|r| r.id).max().unwrap();

    call(&mut tracker, &mut trap, Syscall::Mremap, &[BASE, 3 * PAGE, PAGE, 0, 0], BASE as i64);
    assert_eq!(tracker.region_count(), 1);
    assert!(tracker.find(BASE + PAGE).is_none());
    let head_id = tracker.find(BASE).unwrap().id;

    call(&mut tracker, &mut trap, Syscall::Mremap, &[BASE, PAGE, 3 * PAGE, 1, 0], BASE as i64);
    let begins: Vec<u64> = tracker.regions().map(|r| r.begin).collect();
    assert_eq!(begins, vec![BASE, BASE + PAGE, BASE + 2 * PAGE]);
    assert!(tracker.regions().all(|r| r.protection == Protection::READ_WRITE));
    assert_well_formed(&tracker);

    let ids: Vec<u64> = tracker.regions().map(|r| r.id).collect();
    assert_eq!(ids[0], head_id);
    assert!(ids[1] > earlier_max && ids[2] > earlier_max);
    assert_ne!(ids[1], ids[2]);
}

#[test]
fn test_find_misses_end_of_last_region() {
    let mut tracker = Tracker::new(100, TrackerConfig::default());
    let mut trap = FakeTrap::default();

    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, 2 * PAGE, 3, ANON_PRIVATE, u64::MAX, 0], BASE as i64);

    let last = tracker.regions().last().unwrap().clone();
    assert!(tracker.find(last.end() - 1).is_some());
    assert!(tracker.find(last.end()).is_none());
}

#[test]
fn test_mixed_sequence_stays_sorted() {
    let mut tracker = Tracker::new(100, TrackerConfig::default());
    let mut trap = FakeTrap::default();
    let high = BASE + 0x100000;
    let low = BASE - 0x100000;

    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, 2 * PAGE, 3, ANON_PRIVATE, u64::MAX, 0], high as i64);
    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, 20396, 3, ANON_PRIVATE, u64::MAX, 0], BASE as i64);
    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, PAGE, 1, ANON_PRIVATE, u64::MAX, 0], low as i64);
    assert_well_formed(&tracker);
    assert_eq!(tracker.region_count(), 2 + 5 + 1);

    call(&mut tracker, &mut trap, Syscall::Munmap, &[BASE + PAGE, PAGE], 0);
    assert_well_formed(&tracker);

    call(&mut tracker, &mut trap, Syscall::Mremap, &[BASE + 2 * PAGE, 3 * PAGE, PAGE, 0, 0], (BASE + 2 * PAGE) as i64);
    assert_well_formed(&tracker);

    call(&mut tracker, &mut trap, Syscall::Mprotect, &[low, PAGE, 0], 0);
    assert_eq!(tracker.find(low).unwrap().protection, Protection::NONE);

    let begins: Vec<u64> = tracker.regions().map(|r| r.begin).collect();
    assert_eq!(begins, vec![low, BASE, BASE + 2 * PAGE, high, high + PAGE]);
}

#[test]
fn test_unmap_spans_neighbouring_mappings_and_gaps() {
    let mut tracker = Tracker::new(100, TrackerConfig::default());
    let mut trap = FakeTrap::default();
    let shared = (nix::libc::MAP_SHARED | nix::libc::MAP_ANONYMOUS) as u64;

    // [0, 2) と [2, 3) は隣接する別マッピング、[3, 4) は追跡外、[4, 6) は穴の先
    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, 2 * PAGE, 3, ANON_PRIVATE, u64::MAX, 0], BASE as i64);
    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, PAGE, 1, ANON_PRIVATE, u64::MAX, 0], (BASE + 2 * PAGE) as i64);
    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, PAGE, 3, shared, u64::MAX, 0], (BASE + 3 * PAGE) as i64);
    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, 2 * PAGE, 3, ANON_PRIVATE, u64::MAX, 0], (BASE + 4 * PAGE) as i64);
    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, PAGE, 3, ANON_PRIVATE, u64::MAX, 0], (BASE + 8 * PAGE) as i64);
    assert_eq!(tracker.region_count(), 6);

    // 2ページ目から6ページ目の途中まで（長さはページ単位に切り上げられる）
    let start = BASE + PAGE;
    let len = 4 * PAGE + 0x80;
    call(&mut tracker, &mut trap, Syscall::Munmap, &[start, len], 0);

    let end = BASE + 6 * PAGE;
    assert!(tracker.regions().all(|r| r.end() <= start || r.begin >= end));
    let begins: Vec<u64> = tracker.regions().map(|r| r.begin).collect();
    assert_eq!(begins, vec![BASE, BASE + 8 * PAGE]);
    assert_well_formed(&tracker);
}

#[test]
fn test_drift_does_not_poison_tracker() {
    let mut tracker = Tracker::new(100, TrackerConfig::default());
    let mut trap = FakeTrap::default();

    let event = SyscallEvent::new(Syscall::Munmap, [BASE, PAGE, 0, 0, 0, 0], 0);
    trap.returning(0);
    let err = tracker.handle_syscall(&event, &mut trap).unwrap_err();
    assert!(err.is_consistency_fault());

    call(&mut tracker, &mut trap, Syscall::Mmap, &[0, PAGE, 3, ANON_PRIVATE, u64::MAX, 0], BASE as i64);
    assert_eq!(tracker.region_count(), 1);
}
