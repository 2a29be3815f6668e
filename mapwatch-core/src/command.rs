//! REPLコマンド

/// REPLコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 次の追跡対象システムコールまで実行
    Continue,
    /// 終了まで実行
    Run,
    /// メモリマップを表示
    Maps,
    /// アドレスを含む領域を表示
    Region(String),
    /// 設定済みのシステムコールサイトを表示
    Sites,
    /// /proc/pid/maps と照合
    Verify,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (&head, rest) = parts.split_first()?;

        match head {
            "continue" | "c" => Some(Command::Continue),
            "run" | "r" => Some(Command::Run),
            "maps" | "m" => Some(Command::Maps),
            "region" | "x" => rest.first().map(|addr| Command::Region(addr.to_string())),
            "sites" => Some(Command::Sites),
            "verify" | "v" => Some(Command::Verify),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("continue"), Some(Command::Continue));
        assert_eq!(Command::parse("  c "), Some(Command::Continue));
        assert_eq!(Command::parse("maps"), Some(Command::Maps));
        assert_eq!(Command::parse("region 0x7f0000"), Some(Command::Region("0x7f0000".to_string())));
        assert_eq!(Command::parse("verify"), Some(Command::Verify));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("region"), None);
        assert_eq!(Command::parse("break main"), None);
    }
}
