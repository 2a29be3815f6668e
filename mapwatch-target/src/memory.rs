//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};

/// メモリマッピング情報（/proc/pid/maps の1行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub shared: bool,
    pub offset: usize,
    pub path: Option<String>,
}

impl MemoryMapping {
    /// 指定アドレスを含むかどうか
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// /proc/pid/maps の1行をパースする
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so.6"
///
/// 形式が崩れている行は `None` を返します。
pub fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    // パス名は空白を含み得るので残りを結合する
    let path: Vec<&str> = parts.collect();
    let path = if path.is_empty() { None } else { Some(path.join(" ")) };

    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let offset = usize::from_str_radix(offset, 16).ok()?;

    let perms = perms.as_bytes();
    if perms.len() < 4 {
        return None;
    }

    Some(MemoryMapping {
        start,
        end,
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
        executable: perms[2] == b'x',
        shared: perms[3] == b's',
        offset,
        path,
    })
}

/// /proc/pid/auxv の生データから指定タイプの値を取り出す
///
/// auxv は (type, value) の u64 ペアが AT_NULL まで続く配列です。
pub fn parse_auxv(data: &[u8], wanted: u64) -> Option<u64> {
    for pair in data.chunks_exact(16) {
        let key = u64::from_ne_bytes(pair[..8].try_into().ok()?);
        let value = u64::from_ne_bytes(pair[8..].try_into().ok()?);
        if key == nix::libc::AT_NULL as u64 {
            break;
        }
        if key == wanted {
            return Some(value);
        }
    }
    None
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr as u64))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// メモリにデータを書き込む
    ///
    /// /proc/pid/memはテキストセグメントのような書き込み不可ページにも書き込めます。
    pub fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr as u64))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;

        file.write_all(data)
            .map_err(|e| anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e))?;

        Ok(())
    }

    /// 1バイト読み取る
    pub fn read_u8(&self, addr: usize) -> Result<u8> {
        self.read(addr, 1)?
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Empty read at 0x{:x}", addr))
    }

    /// 1バイト書き込む
    pub fn write_u8(&self, addr: usize, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(mapping) = parse_maps_line(&line) {
                mappings.push(mapping);
            }
        }

        Ok(mappings)
    }

    /// 補助ベクタ（AT_ENTRY）からプログラムのエントリポイントを取得する
    ///
    /// PIEの場合もロード後の絶対アドレスが得られます。
    pub fn entry_point(&self) -> Result<u64> {
        let auxv_path = format!("/proc/{}/auxv", self.pid);
        let data = fs::read(&auxv_path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", auxv_path, e))?;

        parse_auxv(&data, nix::libc::AT_ENTRY as u64)
            .ok_or_else(|| anyhow::anyhow!("AT_ENTRY not found in {}", auxv_path))
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    pub fn read_via_ptrace(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr)
                .map_err(|e| anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr + offset, e))?;

            let bytes = word.to_ne_bytes();
            let remaining = size - offset;
            let copy_size = remaining.min(word_size);

            data.extend_from_slice(&bytes[..copy_size]);
        }

        data.truncate(size);
        Ok(data)
    }
}
