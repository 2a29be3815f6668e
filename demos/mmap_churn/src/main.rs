//! メモリマップを操作するサンプルプログラム
//! このプログラムをmapwatchでトレースすることで、mmap / mprotect / munmap /
//! mremap / brk の追跡をテストします。

use nix::sys::mman::{mmap_anonymous, mprotect, mremap, munmap, MRemapFlags, MapFlags, ProtFlags};
use std::num::NonZeroUsize;

const PAGE: usize = 4096;

fn length(bytes: usize) -> NonZeroUsize {
    NonZeroUsize::new(bytes).unwrap_or(NonZeroUsize::MIN)
}

/// 2ページを確保し、先頭ページだけ読み取り専用にしてから解放する
fn protect_and_unmap() -> nix::Result<()> {
    let rw = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let ptr = unsafe { mmap_anonymous(None, length(2 * PAGE), rw, MapFlags::MAP_PRIVATE)? };
    println!("mmap(2 pages) = {:p}", ptr);

    unsafe {
        ptr.cast::<u8>().as_ptr().write_bytes(0xab, 2 * PAGE);
        mprotect(ptr, PAGE, ProtFlags::PROT_READ)?;
        println!("mprotect({:p}, {}, r--)", ptr, PAGE);
        munmap(ptr, 2 * PAGE)?;
    }
    println!("munmap({:p}, {})", ptr, 2 * PAGE);
    Ok(())
}

/// 1ページ未満のマッピングを作り、途中で解放せずに残す
fn small_mapping() -> nix::Result<()> {
    let ptr = unsafe {
        mmap_anonymous(None, length(27), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_PRIVATE)?
    };
    println!("mmap(27 bytes) = {:p}", ptr);
    Ok(())
}

/// 縮小してから拡大する
fn shrink_and_grow() -> nix::Result<()> {
    let size = 20396;
    let ptr = unsafe { mmap_anonymous(None, length(size), ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE)? };
    println!("mmap({} bytes) = {:p}", size, ptr);

    let shrunk = unsafe { mremap(ptr, size, PAGE, MRemapFlags::empty(), None)? };
    println!("mremap({:p}, {}, {}) = {:p}", ptr, size, PAGE, shrunk);

    let grown = unsafe { mremap(shrunk, PAGE, 2 * PAGE, MRemapFlags::MREMAP_MAYMOVE, None)? };
    println!("mremap({:p}, {}, {}) = {:p}", shrunk, PAGE, 2 * PAGE, grown);

    unsafe { munmap(grown, 2 * PAGE) }
}

/// プログラムブレークを伸ばしてから戻す
fn move_break() {
    unsafe {
        let origin = nix::libc::sbrk(0);
        let grown = nix::libc::sbrk(0x21000);
        println!("sbrk: {:p} -> {:p}", origin, grown);
        nix::libc::brk(origin);
    }
}

fn main() -> nix::Result<()> {
    println!("mmap_churn pid {}", std::process::id());

    protect_and_unmap()?;
    small_mapping()?;
    shrink_and_grow()?;
    move_break();

    println!("done");
    Ok(())
}
