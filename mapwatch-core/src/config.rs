//! トラッカー設定

use crate::TrackerError;
use nix::unistd::{sysconf, SysconfVar};

/// x86_64 Linux の標準ページサイズ
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// トラッカー設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    page_size: u64,
}

impl TrackerConfig {
    /// ページサイズを指定して作成する
    pub fn new(page_size: u64) -> Result<Self, TrackerError> {
        if !page_size.is_power_of_two() {
            return Err(TrackerError::InvalidPageSize(page_size));
        }
        Ok(Self { page_size })
    }

    /// ホストのページサイズを使う
    ///
    /// sysconf が失敗した場合は `DEFAULT_PAGE_SIZE` にフォールバックする。
    pub fn from_host() -> Self {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| v.is_power_of_two())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self { page_size }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// ページ境界へ切り上げる
    pub fn page_align(&self, value: u64) -> u64 {
        value.saturating_add(self.page_size - 1) & !(self.page_size - 1)
    }

    /// バイト数を覆うのに必要なページ数（切り上げ）
    pub fn pages(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.page_size)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_math() {
        let config = TrackerConfig::default();
        assert_eq!(config.page_align(0), 0);
        assert_eq!(config.page_align(1), 4096);
        assert_eq!(config.page_align(4096), 4096);
        assert_eq!(config.pages(27), 1);
        assert_eq!(config.pages(20396), 5);
        assert_eq!(config.pages(8192), 2);
    }

    #[test]
    fn test_invalid_page_size() {
        assert!(TrackerConfig::new(3000).is_err());
        assert_eq!(TrackerConfig::new(16384).unwrap().page_size(), 16384);
    }

    #[test]
    fn test_from_host_is_power_of_two() {
        assert!(TrackerConfig::from_host().page_size().is_power_of_two());
    }
}
