//! ディスクメディア
//!
//! Mounted-media contract used by the drive layer, plus an in-memory
//! sector image (flat raw dumps only; other image codecs live elsewhere).

use crate::sector::{SectorFlags, SectorId, SectorRecord};
use thiserror::Error;

/// フォーマット直後のフィルバイト
pub const DEFAULT_FILL_BYTE: u8 = 0xE5;

/// メディアの読み込みエラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiskError {
    #[error("image size {actual} does not match geometry ({expected} bytes)")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("invalid geometry: {0}")]
    BadGeometry(&'static str),
}

/// マウントされたディスクの契約
///
/// トラックは (cylinder, head) で指定し、トラック内のセクタは物理順の
/// インデックスで指す。コントローラはここを介してのみ内容を触る。
pub trait Disk {
    fn cylinders(&self) -> u8;

    fn sides(&self) -> u8;

    fn is_read_only(&self) -> bool {
        false
    }

    /// トラック上の物理セクタ数
    fn sector_count(&self, cylinder: u8, head: u8) -> usize;

    /// 物理順のセクタ
    fn sector(&self, cylinder: u8, head: u8, index: usize) -> Option<&SectorRecord>;

    /// ID照合の規則（デフォルトは4フィールド全一致）
    fn id_matches(&self, requested: &SectorId, found: &SectorId) -> bool {
        requested == found
    }

    /// `start_index` から物理順にIDを探す
    fn find_sector(&self, cylinder: u8, head: u8, start_index: usize, id: &SectorId) -> Option<usize> {
        (start_index..self.sector_count(cylinder, head)).find(|&index| {
            self.sector(cylinder, head, index)
                .map_or(false, |rec| self.id_matches(id, &rec.id()))
        })
    }

    /// トラックをフォーマット（全セクタを `fill` で埋める）
    fn format_track(&mut self, cylinder: u8, head: u8, ids: &[SectorId], fill: &[u8]) -> bool;

    /// セクタを書き込む
    fn write_sector(&mut self, cylinder: u8, head: u8, index: usize, data: &[u8], deleted: bool) -> bool;
}

/// 一様なディスク形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u8,
    pub sides: u8,
    pub sectors_per_track: u8,
    pub size_code: u8,
    /// 最初のセクタ番号（PC系は1、一部機種は0や0x41）
    pub first_sector: u8,
}

impl Geometry {
    /// 5.25" DD 360KB
    pub const PC_360K: Geometry = Geometry::new(40, 2, 9, 2, 1);
    /// 3.5" DD 720KB
    pub const PC_720K: Geometry = Geometry::new(80, 2, 9, 2, 1);
    /// 3.5" HD 1.44MB
    pub const PC_1440K: Geometry = Geometry::new(80, 2, 18, 2, 1);
    /// Amstrad CPC データフォーマット
    pub const CPC_DATA: Geometry = Geometry::new(40, 1, 9, 2, 0xC1);

    pub const fn new(cylinders: u8, sides: u8, sectors_per_track: u8, size_code: u8, first_sector: u8) -> Self {
        Geometry { cylinders, sides, sectors_per_track, size_code, first_sector }
    }

    pub fn sector_bytes(&self) -> usize {
        crate::sector::size_code_to_bytes(self.size_code)
    }

    pub fn track_bytes(&self) -> usize {
        self.sectors_per_track as usize * self.sector_bytes()
    }

    pub fn image_size(&self) -> usize {
        self.cylinders as usize * self.sides as usize * self.track_bytes()
    }

    /// 論理順のセクタID一覧
    pub fn track_ids(&self, cylinder: u8, head: u8) -> Vec<SectorId> {
        (0..self.sectors_per_track)
            .map(|i| SectorId::new(cylinder, head, self.first_sector.wrapping_add(i), self.size_code))
            .collect()
    }

    pub fn validate(&self) -> Result<(), DiskError> {
        if self.cylinders == 0 {
            return Err(DiskError::BadGeometry("no cylinders"));
        }
        if self.sides == 0 || self.sides > 2 {
            return Err(DiskError::BadGeometry("sides must be 1 or 2"));
        }
        if self.sectors_per_track == 0 {
            return Err(DiskError::BadGeometry("no sectors per track"));
        }
        Ok(())
    }
}

/// トラック（物理順のセクタ列）
#[derive(Debug, Clone, Default)]
struct Track {
    sectors: Vec<SectorRecord>,
}

/// メモリ上のディスク
#[derive(Debug, Clone)]
pub struct MemoryDisk {
    cylinders: u8,
    sides: u8,
    /// cylinder * sides + head でインデックス
    tracks: Vec<Track>,
    read_only: bool,
    modified: bool,
}

impl MemoryDisk {
    /// 未フォーマットのディスク（全トラックにセクタなし）
    pub fn unformatted(cylinders: u8, sides: u8) -> Self {
        let count = cylinders as usize * sides as usize;
        MemoryDisk {
            cylinders,
            sides,
            tracks: vec![Track::default(); count],
            read_only: false,
            modified: false,
        }
    }

    /// フォーマット済みの空ディスク
    pub fn blank(geometry: Geometry, fill: u8) -> Self {
        let mut disk = Self::unformatted(geometry.cylinders, geometry.sides);
        for cyl in 0..geometry.cylinders {
            for head in 0..geometry.sides {
                let sectors = geometry
                    .track_ids(cyl, head)
                    .into_iter()
                    .map(|id| SectorRecord::filled(id, fill))
                    .collect();
                disk.set_track(cyl, head, sectors);
            }
        }
        disk.modified = false;
        disk
    }

    /// フラットなセクタダンプから作成
    pub fn from_raw(geometry: Geometry, data: &[u8]) -> Result<Self, DiskError> {
        geometry.validate()?;
        if data.len() != geometry.image_size() {
            return Err(DiskError::SizeMismatch { expected: geometry.image_size(), actual: data.len() });
        }
        let mut disk = Self::unformatted(geometry.cylinders, geometry.sides);
        let mut chunks = data.chunks_exact(geometry.sector_bytes());
        for cyl in 0..geometry.cylinders {
            for head in 0..geometry.sides {
                let sectors = geometry
                    .track_ids(cyl, head)
                    .into_iter()
                    .zip(chunks.by_ref())
                    // ダンプにヘッダはないので形状から合成したIDになる
                    .map(|(id, chunk)| SectorRecord::new(id, chunk.to_vec()).with_flags(SectorFlags::BOGUS_ID))
                    .collect();
                disk.set_track(cyl, head, sectors);
            }
        }
        disk.modified = false;
        log::info!(
            "Raw image loaded: {} bytes, {}x{}x{}",
            data.len(),
            geometry.cylinders,
            geometry.sides,
            geometry.sectors_per_track
        );
        Ok(disk)
    }

    /// フラットなセクタダンプに書き出す
    ///
    /// 見つからないセクタは0で埋める。
    pub fn to_raw(&self, geometry: Geometry) -> Vec<u8> {
        let sector_bytes = geometry.sector_bytes();
        let mut out = Vec::with_capacity(geometry.image_size());
        for cyl in 0..geometry.cylinders {
            for head in 0..geometry.sides {
                for id in geometry.track_ids(cyl, head) {
                    let start = out.len();
                    if let Some(rec) = self
                        .find_sector(cyl, head, 0, &id)
                        .and_then(|index| self.sector(cyl, head, index))
                    {
                        out.extend_from_slice(&rec.data()[..rec.len().min(sector_bytes)]);
                    }
                    out.resize(start + sector_bytes, 0);
                }
            }
        }
        out
    }

    /// トラックの中身を直接差し替える（プロテクト再現用）
    pub fn set_track(&mut self, cylinder: u8, head: u8, sectors: Vec<SectorRecord>) {
        if let Some(track) = self.track_mut(cylinder, head) {
            track.sectors = sectors;
            self.modified = true;
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    fn track_index(&self, cylinder: u8, head: u8) -> Option<usize> {
        if cylinder < self.cylinders && head < self.sides {
            Some(cylinder as usize * self.sides as usize + head as usize)
        } else {
            None
        }
    }

    fn track(&self, cylinder: u8, head: u8) -> Option<&Track> {
        self.track_index(cylinder, head).and_then(|i| self.tracks.get(i))
    }

    fn track_mut(&mut self, cylinder: u8, head: u8) -> Option<&mut Track> {
        let index = self.track_index(cylinder, head)?;
        self.tracks.get_mut(index)
    }
}

impl Disk for MemoryDisk {
    fn cylinders(&self) -> u8 {
        self.cylinders
    }

    fn sides(&self) -> u8 {
        self.sides
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn sector_count(&self, cylinder: u8, head: u8) -> usize {
        self.track(cylinder, head).map_or(0, |t| t.sectors.len())
    }

    fn sector(&self, cylinder: u8, head: u8, index: usize) -> Option<&SectorRecord> {
        self.track(cylinder, head)?.sectors.get(index)
    }

    fn format_track(&mut self, cylinder: u8, head: u8, ids: &[SectorId], fill: &[u8]) -> bool {
        if self.read_only {
            return false;
        }
        let Some(track) = self.track_mut(cylinder, head) else {
            return false;
        };
        track.sectors = ids
            .iter()
            .map(|&id| {
                let mut data = vec![0u8; id.size_in_bytes()];
                if !fill.is_empty() {
                    for (dst, src) in data.iter_mut().zip(fill.iter().cycle()) {
                        *dst = *src;
                    }
                }
                SectorRecord::new(id, data)
            })
            .collect();
        self.modified = true;
        true
    }

    fn write_sector(&mut self, cylinder: u8, head: u8, index: usize, data: &[u8], deleted: bool) -> bool {
        if self.read_only {
            return false;
        }
        let Some(rec) = self.track_mut(cylinder, head).and_then(|t| t.sectors.get_mut(index)) else {
            return false;
        };
        rec.overwrite(data, deleted);
        self.modified = true;
        true
    }
}
