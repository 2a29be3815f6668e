//! ELFの読み込み機能

use crate::Result;
use object::{Object, ObjectKind};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// ELFローダー
pub struct ElfLoader {
    /// 読み込んだファイルのパス
    path: PathBuf,
    /// オブジェクトファイル
    object_file: object::File<'static>,
}

impl ElfLoader {
    /// ELFファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // object::File に'staticライフタイムを与えるため、Box::leakでデータを保持する
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        debug!(path = %path.display(), kind = ?object_file.kind(), "loaded ELF");

        Ok(Self {
            path: path.to_path_buf(),
            object_file,
        })
    }

    /// ファイルパスを取得
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// 位置独立（ET_DYN）かどうかを判定する
    ///
    /// 共有ライブラリやPIE実行ファイルの場合、シンボルアドレスはロードベースからの
    /// オフセットであり、実行時ベースアドレスを加算する必要があります。
    pub fn is_dynamic(&self) -> bool {
        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }
}
