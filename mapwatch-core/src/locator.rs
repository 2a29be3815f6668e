//! シンボル/モジュールロケータ
//!
//! トレース対象に読み込まれた C ライブラリを /proc/pid/maps から探し、
//! 5つのラッパー関数の中にある syscall 命令の実行時アドレスを求める。

use crate::breakpoint::SyscallSite;
use crate::disasm::find_syscall_instructions;
use crate::{Result, Syscall};
use mapwatch_elf::{ElfLoader, Symbol, SymbolResolver};
use mapwatch_target::{Memory, MemoryMapping};
use regex::Regex;
use tracing::{debug, warn};

/// glibc の共有ライブラリのパス（libc.so.6 や libc-2.31.so）
pub const DEFAULT_LIBRARY_PATTERN: &str = r"/libc(\.so|-[0-9.]+\.so)";

/// サイズ情報のないシンボルを逆アセンブルするときの長さ
const FALLBACK_SCAN_LEN: u64 = 128;

/// 読み込まれたモジュール
pub struct LoadedModule {
    pub path: String,
    /// ファイルオフセット0がマップされたアドレス
    pub base: u64,
    pub resolver: SymbolResolver,
    relocatable: bool,
}

impl LoadedModule {
    /// シンボルの実行時アドレスを求める
    pub fn runtime_address(&self, symbol: &Symbol) -> u64 {
        if self.relocatable {
            self.base + symbol.address
        } else {
            symbol.address
        }
    }

    /// 名前からシンボルと実行時アドレスを解決する
    pub fn resolve(&self, name: &str) -> Option<(u64, &Symbol)> {
        let symbol = self.resolver.lookup(name)?;
        Some((self.runtime_address(symbol), symbol))
    }

    /// 実行時アドレスを `シンボル+オフセット` の形にする
    pub fn symbolize(&self, address: u64) -> Option<String> {
        let file_address = if self.relocatable {
            address.checked_sub(self.base)?
        } else {
            address
        };
        let symbol = self.resolver.reverse_resolve(file_address)?;
        Some(format!("{}+0x{:x}", symbol.display_name(), file_address - symbol.address))
    }
}

/// ロケータ
pub struct Locator {
    pattern: Regex,
}

impl Locator {
    /// ライブラリパスのパターンを指定して作成する
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("Invalid library pattern '{}': {}", pattern, e))?;
        Ok(Self { pattern })
    }

    /// マッピング一覧からパターンに合うモジュールのパスとベースアドレスを探す
    pub fn find_module(&self, mappings: &[MemoryMapping]) -> Option<(String, u64)> {
        mappings.iter().find_map(|m| {
            let path = m.path.as_deref()?;
            (m.offset == 0 && self.pattern.is_match(path)).then(|| (path.to_string(), m.start as u64))
        })
    }

    /// トレース対象のモジュールを探して読み込む
    pub fn load_module(&self, memory: &Memory) -> Result<LoadedModule> {
        let mappings = memory.get_mappings()?;
        let (path, base) = self.find_module(&mappings).ok_or_else(|| {
            anyhow::anyhow!("No loaded module matches '{}'", self.pattern.as_str())
        })?;

        let loader = ElfLoader::load(&path)?;
        let resolver = SymbolResolver::new(&loader)?;
        debug!(path = %path, base = format_args!("0x{:x}", base), "located module");

        Ok(LoadedModule {
            path,
            base,
            resolver,
            relocatable: loader.is_dynamic(),
        })
    }

    /// 5つのラッパー関数の syscall 命令を列挙する
    ///
    /// 別名（mmap と mmap64 など）は同じアドレスになるので重複を除く。
    /// 見つからないシンボルは警告して飛ばす。
    pub fn syscall_sites(&self, memory: &Memory, module: &LoadedModule) -> Result<Vec<SyscallSite>> {
        let mut sites: Vec<SyscallSite> = Vec::new();

        for syscall in Syscall::TRACKED {
            let mut found = false;
            for name in syscall.wrapper_symbols() {
                let Some((address, symbol)) = module.resolve(name) else {
                    continue;
                };
                found = true;

                let len = if symbol.size > 0 { symbol.size } else { FALLBACK_SCAN_LEN };
                let code = memory.read(address as usize, len as usize)?;
                for site in find_syscall_instructions(&code, address)? {
                    if !sites.iter().any(|s| s.address == site) {
                        sites.push(SyscallSite { address: site, syscall });
                    }
                }
            }
            if !found {
                warn!(%syscall, module = %module.path, "no wrapper symbol found");
            }
        }

        sites.sort_by_key(|s| s.address);
        Ok(sites)
    }
}

impl Default for Locator {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_LIBRARY_PATTERN).expect("default library pattern is valid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapwatch_target::memory::parse_maps_line;

    fn mappings(lines: &[&str]) -> Vec<MemoryMapping> {
        lines.iter().filter_map(|l| parse_maps_line(l)).collect()
    }

    #[test]
    fn test_find_module_uses_offset_zero_mapping() {
        let maps = mappings(&[
            "555555554000-555555556000 r--p 00000000 08:01 11 /usr/bin/demo",
            "7ffff7dc0000-7ffff7de8000 r--p 00000000 08:01 22 /usr/lib/x86_64-linux-gnu/libc.so.6",
            "7ffff7de8000-7ffff7f7d000 r-xp 00028000 08:01 22 /usr/lib/x86_64-linux-gnu/libc.so.6",
        ]);
        let locator = Locator::default();
        let (path, base) = locator.find_module(&maps).unwrap();
        assert_eq!(path, "/usr/lib/x86_64-linux-gnu/libc.so.6");
        assert_eq!(base, 0x7ffff7dc0000);
    }

    #[test]
    fn test_find_module_versioned_name() {
        let maps = mappings(&["7f0000000000-7f0000020000 r-xp 00000000 08:01 22 /lib/x86_64-linux-gnu/libc-2.31.so"]);
        assert!(Locator::default().find_module(&maps).is_some());
    }

    #[test]
    fn test_find_module_ignores_similar_names() {
        let maps = mappings(&[
            "7f0000000000-7f0000020000 r-xp 00000000 08:01 22 /usr/lib/libcrypto.so.3",
            "7f0000100000-7f0000120000 r-xp 00000000 08:01 23 /usr/lib/libcap.so.2",
        ]);
        assert!(Locator::default().find_module(&maps).is_none());
    }

    fn self_module(base: u64) -> LoadedModule {
        let exe = std::env::current_exe().unwrap();
        let loader = ElfLoader::load(&exe).unwrap();
        LoadedModule {
            path: exe.display().to_string(),
            base,
            resolver: SymbolResolver::new(&loader).unwrap(),
            relocatable: true,
        }
    }

    #[test]
    fn test_symbolize_site_inside_wrapper() {
        let base = 0x5555_0000_0000;
        let module = self_module(base);
        let (main, symbol) = module.resolve("main").unwrap();
        assert_eq!(main, base + symbol.address);

        let name = module.symbolize(main).unwrap();
        assert!(name.ends_with("+0x0"), "{}", name);
        assert!(module.symbolize(base - 1).is_none());
    }

    #[test]
    fn test_custom_pattern() {
        let maps = mappings(&["7f0000000000-7f0000020000 r-xp 00000000 08:01 22 /opt/musl/lib/libc.musl-x86_64.so.1"]);
        let locator = Locator::new(r"libc\.musl").unwrap();
        assert!(locator.find_module(&maps).is_some());
        assert!(Locator::new("(").is_err());
    }
}
