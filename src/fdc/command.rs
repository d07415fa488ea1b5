//! 8272 コマンドテーブル
//!
//! Opcode decode (low five bits of the first command byte), fixed
//! argument counts and accessors for the collected argument bytes.

use crate::sector::SectorId;
use std::fmt;

/// コマンドバイトのフラグ: マルチトラック
pub const FLAG_MT: u8 = 0x80;
/// コマンドバイトのフラグ: MFM
pub const FLAG_MF: u8 = 0x40;
/// コマンドバイトのフラグ: スキップ
pub const FLAG_SK: u8 = 0x20;

/// 引数バッファの最大長（コマンドバイト込み）
pub const MAX_ARGS: usize = 9;
/// 結果バッファの最大長
pub const MAX_RESULTS: usize = 7;

/// 8272コマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ReadTrack,
    Specify,
    SenseDriveStatus,
    WriteData,
    ReadData,
    Recalibrate,
    SenseInterruptStatus,
    WriteDeletedData,
    ReadId,
    ReadDeletedData,
    FormatTrack,
    Seek,
    ScanEqual,
    ScanLowOrEqual,
    ScanHighOrEqual,
    Invalid,
}

use Opcode::*;

/// 下位5ビット → コマンド
const OPCODE_TABLE: [Opcode; 32] = [
    Invalid,              // 0x00
    Invalid,              // 0x01
    ReadTrack,            // 0x02
    Specify,              // 0x03
    SenseDriveStatus,     // 0x04
    WriteData,            // 0x05
    ReadData,             // 0x06
    Recalibrate,          // 0x07
    SenseInterruptStatus, // 0x08
    WriteDeletedData,     // 0x09
    ReadId,               // 0x0A
    Invalid,              // 0x0B
    ReadDeletedData,      // 0x0C
    FormatTrack,          // 0x0D
    Invalid,              // 0x0E
    Seek,                 // 0x0F
    Invalid,              // 0x10
    ScanEqual,            // 0x11
    Invalid,              // 0x12
    Invalid,              // 0x13
    Invalid,              // 0x14
    Invalid,              // 0x15
    Invalid,              // 0x16
    Invalid,              // 0x17
    Invalid,              // 0x18
    ScanLowOrEqual,       // 0x19
    Invalid,              // 0x1A
    Invalid,              // 0x1B
    Invalid,              // 0x1C
    ScanHighOrEqual,      // 0x1D
    Invalid,              // 0x1E
    Invalid,              // 0x1F
];

impl Opcode {
    /// コマンドバイトをデコード
    pub fn decode(command: u8) -> Opcode {
        OPCODE_TABLE[(command & 0x1F) as usize]
    }

    /// コマンドバイトを含むバイト数
    pub fn command_length(&self) -> usize {
        match self {
            SenseInterruptStatus | Invalid => 1,
            SenseDriveStatus | Recalibrate | ReadId => 2,
            Seek | Specify => 3,
            FormatTrack => 6,
            ReadTrack | ReadData | ReadDeletedData | WriteData | WriteDeletedData | ScanEqual
            | ScanLowOrEqual | ScanHighOrEqual => 9,
        }
    }

    pub fn is_scan(&self) -> bool {
        matches!(self, ScanEqual | ScanLowOrEqual | ScanHighOrEqual)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, WriteData | WriteDeletedData | FormatTrack)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReadTrack => "READ TRACK",
            Specify => "SPECIFY",
            SenseDriveStatus => "SENSE DRIVE STATUS",
            WriteData => "WRITE DATA",
            ReadData => "READ DATA",
            Recalibrate => "RECALIBRATE",
            SenseInterruptStatus => "SENSE INTERRUPT STATUS",
            WriteDeletedData => "WRITE DELETED DATA",
            ReadId => "READ ID",
            ReadDeletedData => "READ DELETED DATA",
            FormatTrack => "FORMAT TRACK",
            Seek => "SEEK",
            ScanEqual => "SCAN EQUAL",
            ScanLowOrEqual => "SCAN LOW OR EQUAL",
            ScanHighOrEqual => "SCAN HIGH OR EQUAL",
            Invalid => "INVALID",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 受信済みコマンドバイト列
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBytes {
    bytes: [u8; MAX_ARGS],
    len: usize,
}

impl CommandBytes {
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// 1バイト追加。満杯なら無視
    pub fn push(&mut self, value: u8) -> bool {
        if self.len < MAX_ARGS {
            self.bytes[self.len] = value;
            self.len += 1;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    #[inline]
    fn byte(&self, index: usize) -> u8 {
        if index < self.len {
            self.bytes[index]
        } else {
            0
        }
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::decode(self.byte(0))
    }

    pub fn multi_track(&self) -> bool {
        self.byte(0) & FLAG_MT != 0
    }

    pub fn skip(&self) -> bool {
        self.byte(0) & FLAG_SK != 0
    }

    /// 引数1のドライブ選択（US1/US0）
    pub fn drive(&self) -> u8 {
        self.byte(1) & 0x03
    }

    /// 引数1のヘッド選択（HD）
    pub fn head(&self) -> u8 {
        (self.byte(1) >> 2) & 0x01
    }

    /// 読み書き系の C/H/R/N
    pub fn sector_id(&self) -> SectorId {
        SectorId::new(self.byte(2), self.byte(3), self.byte(4), self.byte(5))
    }

    /// 読み書き系のEOT
    pub fn end_of_track(&self) -> u8 {
        self.byte(6)
    }

    /// 読み書き系のGPL
    pub fn gap_length(&self) -> u8 {
        self.byte(7)
    }

    /// 読み書き系のDTL（スキャンではSTP）
    pub fn data_length(&self) -> u8 {
        self.byte(8)
    }

    /// SEEKのNCN
    pub fn new_cylinder(&self) -> u8 {
        self.byte(2)
    }

    /// FORMAT TRACKのN
    pub fn format_size_code(&self) -> u8 {
        self.byte(2)
    }

    /// FORMAT TRACKのSC
    pub fn format_sector_count(&self) -> u8 {
        self.byte(3)
    }

    /// FORMAT TRACKのD（フィルバイト）
    pub fn format_fill(&self) -> u8 {
        self.byte(5)
    }

    /// SPECIFYのSRT（上位4ビット）
    pub fn step_rate(&self) -> u8 {
        self.byte(1) >> 4
    }

    /// SPECIFYのHUT（下位4ビット）
    pub fn head_unload_time(&self) -> u8 {
        self.byte(1) & 0x0F
    }

    /// SPECIFYのHLT（上位7ビット）
    pub fn head_load_time(&self) -> u8 {
        self.byte(2) >> 1
    }

    /// SPECIFYのND（非DMAモード）
    pub fn non_dma(&self) -> bool {
        self.byte(2) & 0x01 != 0
    }
}
