//! トラッカーのエラー型

use crate::Syscall;
use thiserror::Error;

/// トラッカーのエラー
///
/// システムコール自体の失敗はエラーではなく、生の戻り値として `Ok` で返る。
#[derive(Debug, Error)]
pub enum TrackerError {
    /// 既知の領域を操作するはずのシステムコールが、追跡外のアドレスを指していた
    ///
    /// モデルが実際のアドレス空間からずれている。このイベントの更新は中止されるが、
    /// トラッカー自体は動作を続ける。
    #[error("{syscall}: no tracked region contains 0x{addr:x} (returned {retval})")]
    RegionNotFound {
        syscall: Syscall,
        addr: u64,
        retval: i64,
    },

    /// トラップコーディネータがプロセスをシステムコール出口まで進められなかった
    #[error(transparent)]
    Trap(#[from] anyhow::Error),

    /// ページサイズが2の冪ではない
    #[error("page size {0} is not a power of two")]
    InvalidPageSize(u64),
}

impl TrackerError {
    /// モデルの不整合（セッションは継続可能）かどうか
    pub fn is_consistency_fault(&self) -> bool {
        matches!(self, TrackerError::RegionNotFound { .. })
    }
}
