//! セクタ表現
//!
//! Physical sector model shared by the disk layer and the controller.
//! セクタIDとデータ領域、エラーフラグ、逐次リーダーを提供

use std::fmt;

/// サイズコード6以上のセクタ長（フォーマット依存、一般的な値）
pub const OVERSIZE_SECTOR_BYTES: usize = 0x1800;

/// セクタID（C/H/R/N）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectorId {
    /// シリンダ番号 (C)
    pub cylinder: u8,
    /// ヘッド番号 (H)
    pub head: u8,
    /// セクタ番号 (R)
    pub sector: u8,
    /// サイズコード (N): 128 << N バイト
    pub size_code: u8,
}

impl SectorId {
    pub const fn new(cylinder: u8, head: u8, sector: u8, size_code: u8) -> Self {
        SectorId { cylinder, head, sector, size_code }
    }

    /// サイズコードからバイト数を求める
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        size_code_to_bytes(self.size_code)
    }

    /// コントローラの結果バイト列の並び（C, H, R, N）
    pub fn to_bytes(&self) -> [u8; 4] {
        [self.cylinder, self.head, self.sector, self.size_code]
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.cylinder, self.head, self.sector, self.size_code)
    }
}

/// サイズコード → バイト数
pub fn size_code_to_bytes(size_code: u8) -> usize {
    match size_code {
        0..=5 => 128usize << size_code,
        _ => OVERSIZE_SECTOR_BYTES,
    }
}

bitflags::bitflags! {
    /// セクタ状態フラグ
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SectorFlags: u8 {
        /// データ部のCRCエラー
        const CRC_ERROR = 0b0001;
        /// 削除データマーク付きで書かれたセクタ
        const DELETED   = 0b0010;
        /// IDが読めずトラック形状から合成されたもの
        const BOGUS_ID  = 0b0100;
    }
}

/// 1つの物理セクタ
///
/// IDは生成後に変わらない。データはwrite_sector/format_trackで上書きされる。
/// データ長0は「データアドレスマークなし」を表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorRecord {
    id: SectorId,
    data: Vec<u8>,
    flags: SectorFlags,
}

impl SectorRecord {
    pub fn new(id: SectorId, data: Vec<u8>) -> Self {
        SectorRecord { id, data, flags: SectorFlags::empty() }
    }

    /// データ部を持たないセクタ（ヘッダのみ）
    pub fn without_data(id: SectorId) -> Self {
        SectorRecord { id, data: Vec::new(), flags: SectorFlags::empty() }
    }

    /// IDのサイズコード通りの長さで `fill` 埋めされたセクタ
    pub fn filled(id: SectorId, fill: u8) -> Self {
        SectorRecord::new(id, vec![fill; id.size_in_bytes()])
    }

    pub fn with_flags(mut self, flags: SectorFlags) -> Self {
        self.flags = flags;
        self
    }

    #[inline]
    pub fn id(&self) -> SectorId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn flags(&self) -> SectorFlags {
        self.flags
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(SectorFlags::DELETED)
    }

    #[inline]
    pub fn has_crc_error(&self) -> bool {
        self.flags.contains(SectorFlags::CRC_ERROR)
    }

    #[inline]
    pub fn has_bogus_id(&self) -> bool {
        self.flags.contains(SectorFlags::BOGUS_ID)
    }

    /// データを上書き
    ///
    /// セクタ長は変えない。短いデータは0で埋め、長いデータは切り詰める。
    /// データ部のないセクタは書き込み後にIDの長さを持つ。
    pub fn overwrite(&mut self, data: &[u8], deleted: bool) {
        let len = if self.data.is_empty() { self.id.size_in_bytes() } else { self.data.len() };
        self.data.clear();
        self.data.extend_from_slice(&data[..data.len().min(len)]);
        self.data.resize(len, 0);
        self.flags.remove(SectorFlags::CRC_ERROR);
        self.flags.set(SectorFlags::DELETED, deleted);
    }

    /// 先頭からの逐次リーダー
    pub fn reader(&self) -> SectorReader<'_> {
        self.reader_at(0)
    }

    /// 途中位置から再開するリーダー
    pub fn reader_at(&self, position: usize) -> SectorReader<'_> {
        SectorReader { record: self, position: position.min(self.data.len()) }
    }
}

/// セクタデータの逐次リーダー
///
/// コントローラはこれ以外の方法でセクタ内容を読まない。
pub struct SectorReader<'a> {
    record: &'a SectorRecord,
    position: usize,
}

impl<'a> SectorReader<'a> {
    #[inline]
    pub fn is_byte_available(&self) -> bool {
        self.position < self.record.data.len()
    }

    /// 1バイト読んでカーソルを進める。終端ではNone
    pub fn read(&mut self) -> Option<u8> {
        let value = self.record.data.get(self.position).copied()?;
        self.position += 1;
        Some(value)
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }
}

impl<'a> Iterator for SectorReader<'a> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        self.read()
    }
}
