//! モデルと実際のアドレス空間の照合
//!
//! 追跡中の領域を /proc/pid/maps と比べ、ずれている領域を報告する。

use crate::{Protection, Region};
use mapwatch_target::MemoryMapping;
use std::fmt;

/// モデルと実際のずれ
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    /// 追跡中だが実際にはマップされていない
    Unmapped(Region),
    /// 保護属性が一致しない
    Protection { region: Region, actual: Protection },
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Drift::Unmapped(region) => write!(f, "{} is not mapped", region),
            Drift::Protection { region, actual } => {
                write!(f, "{} is actually {}", region, actual)
            }
        }
    }
}

fn mapping_protection(mapping: &MemoryMapping) -> Protection {
    let mut prot = Protection::NONE.0;
    if mapping.readable {
        prot |= Protection::READ.0;
    }
    if mapping.writable {
        prot |= Protection::WRITE.0;
    }
    if mapping.executable {
        prot |= Protection::EXEC.0;
    }
    Protection(prot)
}

/// 追跡中の領域を実際のマッピングと照合する
///
/// 比較は読み/書き/実行の3ビットだけで行う。
pub fn audit<'a>(regions: impl IntoIterator<Item = &'a Region>, mappings: &[MemoryMapping]) -> Vec<Drift> {
    let rwx = Protection::READ.0 | Protection::WRITE.0 | Protection::EXEC.0;

    regions
        .into_iter()
        .filter_map(|region| {
            let Some(mapping) = mappings.iter().find(|m| m.contains(region.begin as usize)) else {
                return Some(Drift::Unmapped(region.clone()));
            };
            let actual = mapping_protection(mapping);
            (actual.0 != (region.protection.0 & rwx)).then(|| Drift::Protection {
                region: region.clone(),
                actual,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapwatch_target::memory::parse_maps_line;

    #[test]
    fn test_audit_reports_drift() {
        let maps: Vec<MemoryMapping> = [
            "7f0000000000-7f0000002000 rw-p 00000000 00:00 0",
            "7f0000010000-7f0000011000 r--p 00000000 00:00 0",
        ]
        .iter()
        .filter_map(|l| parse_maps_line(l))
        .collect();

        let regions = vec![
            Region::new(0, 0x7f0000000000, 0x1000, Protection::READ_WRITE),
            Region::new(1, 0x7f0000001000, 0x1000, Protection::READ_WRITE),
            Region::new(2, 0x7f0000010000, 0x1000, Protection::READ_WRITE),
            Region::new(3, 0x7f0000020000, 0x1000, Protection::READ),
        ];

        let drift = audit(&regions, &maps);
        assert_eq!(
            drift,
            vec![
                Drift::Protection {
                    region: regions[2].clone(),
                    actual: Protection::READ
                },
                Drift::Unmapped(regions[3].clone()),
            ]
        );
    }
}
