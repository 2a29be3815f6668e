//! シンボル解決機能

use crate::{ElfLoader, Result};
use object::{Object, ObjectSymbol};
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前を取得
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }
}

/// シンボル名をデマングルする
///
/// Cのシンボル（libcのラッパー関数など）はそのまま返ります。
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順にソートしたシンボル
    symbols_by_address: Vec<Symbol>,
}

impl SymbolResolver {
    /// ELFローダーからシンボル解決を作成する
    ///
    /// 通常のシンボルテーブルと動的シンボルテーブルの両方を読みます。
    /// stripされた共有ライブラリでは .dynsym だけが残っています。
    pub fn new(loader: &ElfLoader) -> Result<Self> {
        let mut symbols_by_name = HashMap::new();
        let mut symbols_by_address = Vec::new();

        let object_file = loader.object_file();
        let tables = object_file.symbols().chain(object_file.dynamic_symbols());

        for symbol in tables {
            if !symbol.is_definition() {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() || symbols_by_name.contains_key(name) {
                continue;
            }

            let sym = Symbol::new(name.to_string(), symbol.address(), symbol.size());
            symbols_by_name.insert(name.to_string(), sym.clone());
            symbols_by_address.push(sym);
        }

        symbols_by_address.sort_by_key(|s| s.address);

        Ok(Self {
            symbols_by_name,
            symbols_by_address,
        })
    }

    /// シンボル名からシンボル情報を取得する
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols_by_name.get(name)
    }

    /// シンボル名からアドレスを解決する
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.lookup(name).map(|s| s.address)
    }

    /// アドレスからシンボルを解決する（最も近い手前のシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<Symbol> {
        match self.symbols_by_address.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => Some(self.symbols_by_address[idx].clone()),
            Err(0) => None,
            Err(idx) => {
                let sym = &self.symbols_by_address[idx - 1];
                if sym.size == 0 || addr < sym.address + sym.size {
                    Some(sym.clone())
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_c_symbol_is_unchanged() {
        let sym = Symbol::new("mmap".to_string(), 0x1000, 0x30);
        assert_eq!(sym.display_name(), "mmap");
    }

    #[test]
    fn test_demangle_rust_symbol() {
        let sym = Symbol::new("_ZN4core3ptr13drop_in_place17h0123456789abcdefE".to_string(), 0, 0);
        assert_eq!(sym.display_name(), "core::ptr::drop_in_place");
    }
}
