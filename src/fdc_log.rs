//! FDC ログシステム
//!
//! 原則:
//! 1. コマンド単位の「判断」を記録（受理・終了・エラー）
//! 2. 状態遷移のみ記録
//! 3. レベル分離: FLOW / STATE / SEEK / DATA
//!
//! 出力は `log` クレート経由（target = "fdc"）。

use crate::fdc::command::Opcode;
use crate::fdc::status::{Status0, Status1, Status2};
use crate::sector::SectorId;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// ログカテゴリ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FdcLogLevel: u32 {
        /// L1: コマンド受理と終了
        const FLOW  = 0b0001;
        /// L2: フェーズ遷移
        const STATE = 0b0010;
        /// L2: ステップパルスとシーク完了
        const SEEK  = 0b0100;
        /// L3: 転送バイト（短時間のみ）
        const DATA  = 0b1000;
    }
}

/// グローバルログレベル
static LOG_LEVEL: AtomicU32 = AtomicU32::new(0);

/// ログレベルを設定
pub fn set_log_level(level: FdcLogLevel) {
    LOG_LEVEL.store(level.bits(), Ordering::Relaxed);
}

/// 現在のログレベルを取得
pub fn get_log_level() -> FdcLogLevel {
    FdcLogLevel::from_bits_truncate(LOG_LEVEL.load(Ordering::Relaxed))
}

/// ログレベルが有効かチェック
#[inline]
pub fn is_enabled(flag: FdcLogLevel) -> bool {
    (LOG_LEVEL.load(Ordering::Relaxed) & flag.bits()) != 0
}

/// "flow+state" 形式の指定をパース
pub fn parse_log_level(s: &str) -> FdcLogLevel {
    let mut level = FdcLogLevel::empty();
    for part in s.to_lowercase().split('+') {
        match part.trim() {
            "flow" => level |= FdcLogLevel::FLOW,
            "state" => level |= FdcLogLevel::STATE,
            "seek" => level |= FdcLogLevel::SEEK,
            "data" => level |= FdcLogLevel::DATA,
            "all" => level = FdcLogLevel::all(),
            _ => {}
        }
    }
    level
}

/// 転送バイトのリングバッファ（最後のN個を保持）
pub struct ByteRing {
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { buf: vec![0; capacity], pos: 0, capacity }
    }

    pub fn push(&mut self, value: u8) {
        self.buf[self.pos % self.capacity] = value;
        self.pos += 1;
    }

    pub fn clear(&mut self) {
        self.pos = 0;
    }

    /// 最新からN個を取得（古い順）
    pub fn last_n(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.capacity).min(self.pos);
        (0..n).map(|i| self.buf[(self.pos - n + i) % self.capacity]).collect()
    }

    /// ダンプ出力
    pub fn dump(&self, n: usize) {
        if !is_enabled(FdcLogLevel::DATA) {
            return;
        }
        let data = self.last_n(n);
        log::debug!(target: "fdc", "[DUMP] Last {} bytes:", data.len());
        for line in data.chunks(16) {
            let hex: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
            log::debug!(target: "fdc", "  {}", hex.join(" "));
        }
    }
}

impl Default for ByteRing {
    fn default() -> Self {
        Self::new(256)
    }
}

// ============================================================
// ログ出力関数
// ============================================================

/// [FLOW] コマンド受理
pub fn log_command(opcode: Opcode, bytes: &[u8]) {
    if is_enabled(FdcLogLevel::FLOW) {
        log::debug!(target: "fdc", "[FDC] {} {:02X?}", opcode, bytes);
    }
}

/// [FLOW] 結果フェーズ
pub fn log_result(opcode: Opcode, bytes: &[u8]) {
    if is_enabled(FdcLogLevel::FLOW) {
        log::debug!(target: "fdc", "[FDC] {} result {:02X?}", opcode, bytes);
    }
}

/// [FLOW] 異常終了の詳細
pub fn log_abnormal(opcode: Opcode, id: SectorId, st0: Status0, st1: Status1, st2: Status2) {
    if is_enabled(FdcLogLevel::FLOW) {
        log::debug!(
            target: "fdc",
            "[FDC] {} terminated at {}: ST0={:?} ST1={:?} ST2={:?}",
            opcode, id, st0, st1, st2
        );
    }
}

/// [STATE] フェーズ遷移
pub fn log_phase(from: &str, to: &str) {
    if is_enabled(FdcLogLevel::STATE) {
        log::trace!(target: "fdc", "[STATE] {} -> {}", from, to);
    }
}

/// [STATE] セクタ検索結果
pub fn log_sector_found(id: SectorId, index: usize, synthesized: bool) {
    if is_enabled(FdcLogLevel::STATE) {
        let note = if synthesized { " (synthesized ID)" } else { "" };
        log::trace!(target: "fdc", "[STATE] Sector {} at index {}{}", id, index, note);
    }
}

/// [STATE] Terminal Count
pub fn log_terminal_count(deferred: bool) {
    if is_enabled(FdcLogLevel::STATE) {
        if deferred {
            log::trace!(target: "fdc", "[STATE] TC latched, finishing sector");
        } else {
            log::trace!(target: "fdc", "[STATE] TC");
        }
    }
}

/// [SEEK] ステップパルス
pub fn log_step(drive: u8, cylinder: u8, remaining: u8) {
    if is_enabled(FdcLogLevel::SEEK) {
        log::trace!(target: "fdc", "[SEEK] Drive {} step -> C={} ({} pulses left)", drive, cylinder, remaining);
    }
}

/// [SEEK] シーク完了
pub fn log_seek_end(drive: u8, cylinder: u8, st0: Status0) {
    if is_enabled(FdcLogLevel::SEEK) {
        log::debug!(target: "fdc", "[SEEK] Drive {} at C={} ST0={:?}", drive, cylinder, st0);
    }
}

/// [DATA] 転送バイト
pub fn log_byte(to_host: bool, value: u8) {
    if is_enabled(FdcLogLevel::DATA) {
        let dir = if to_host { "->" } else { "<-" };
        log::trace!(target: "fdc", "[DATA] {} {:02X}", dir, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_ring() {
        let mut ring = ByteRing::new(8);
        for i in 0..10 {
            ring.push(i as u8);
        }
        assert_eq!(ring.last_n(4), vec![6, 7, 8, 9]);
        assert_eq!(ring.last_n(20).len(), 8);
        ring.clear();
        assert!(ring.last_n(4).is_empty());
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("flow+seek"), FdcLogLevel::FLOW | FdcLogLevel::SEEK);
        assert_eq!(parse_log_level("ALL"), FdcLogLevel::all());
        assert_eq!(parse_log_level("none"), FdcLogLevel::empty());
    }

    #[test]
    fn test_log_level() {
        let saved = get_log_level();
        set_log_level(FdcLogLevel::FLOW | FdcLogLevel::STATE);
        assert!(is_enabled(FdcLogLevel::FLOW));
        assert!(is_enabled(FdcLogLevel::STATE));
        assert!(!is_enabled(FdcLogLevel::SEEK));
        assert!(!is_enabled(FdcLogLevel::DATA));
        set_log_level(saved);
    }
}
