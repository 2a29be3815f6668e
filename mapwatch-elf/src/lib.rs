//! mapwatch ELF 解析
//!
//! このクレートは、ELFファイルの読み込みとシンボル解決の機能を提供します。
//! 共有ライブラリ内のシステムコールラッパー関数の位置を求めるために使います。

pub mod loader;
pub mod symbols;

pub use loader::ElfLoader;
pub use symbols::{Symbol, SymbolResolver};

/// ELF解析の結果型
pub type Result<T> = anyhow::Result<T>;
