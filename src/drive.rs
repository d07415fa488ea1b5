//! フロッピードライブ
//!
//! Drive mechanics (cylinder position, step pulses, write protect) and the
//! sector contract the controller sees, bound to the current cylinder.

use crate::disk::Disk;
use crate::sector::{SectorId, SectorRecord};

/// 接続可能なドライブ数（ドライブ選択は2ビット）
pub const MAX_DRIVES: usize = 4;

/// フロッピードライブの状態
pub struct DriveUnit {
    /// 現在のシリンダ（0..=max_cylinder）
    cylinder: u8,
    /// ヘッドが移動できる最大シリンダ
    max_cylinder: u8,
    /// ドライブ側のライトプロテクト
    write_protect: bool,
    /// シーク中の残りステップパルス
    pending_steps: u8,
    /// 挿入されているディスク
    disk: Option<Box<dyn Disk>>,
}

impl Default for DriveUnit {
    fn default() -> Self {
        Self::new(79)
    }
}

impl DriveUnit {
    pub fn new(max_cylinder: u8) -> Self {
        DriveUnit {
            cylinder: 0,
            max_cylinder,
            write_protect: false,
            pending_steps: 0,
            disk: None,
        }
    }

    /// ディスクを挿入（コマンド実行中は呼ばないこと）
    pub fn insert(&mut self, disk: Box<dyn Disk>) {
        log::info!("Disk inserted: {} cylinders, {} side(s)", disk.cylinders(), disk.sides());
        self.disk = Some(disk);
    }

    /// ディスクを取り出す
    pub fn eject(&mut self) -> Option<Box<dyn Disk>> {
        let disk = self.disk.take();
        if disk.is_some() {
            log::info!("Disk ejected");
        }
        disk
    }

    pub fn disk(&self) -> Option<&dyn Disk> {
        self.disk.as_deref()
    }

    pub fn disk_mut(&mut self) -> Option<&mut (dyn Disk + 'static)> {
        self.disk.as_deref_mut()
    }

    #[inline]
    pub fn cylinder(&self) -> u8 {
        self.cylinder
    }

    #[inline]
    pub fn max_cylinder(&self) -> u8 {
        self.max_cylinder
    }

    /// ディスクが入っていればレディ
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.disk.is_some()
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protect || self.disk.as_ref().map_or(false, |d| d.is_read_only())
    }

    pub fn set_write_protect(&mut self, on: bool) {
        self.write_protect = on;
    }

    pub fn sides(&self) -> u8 {
        self.disk.as_ref().map_or(0, |d| d.sides())
    }

    pub fn is_two_sided(&self) -> bool {
        self.sides() > 1
    }

    #[inline]
    pub fn is_track0(&self) -> bool {
        self.cylinder == 0
    }

    // ============================================================
    // シーク機構
    // ============================================================

    /// シーク開始（ステップパルスの上限を設定）
    pub fn start_seek(&mut self, pulses: u8) {
        self.pending_steps = pulses;
    }

    #[inline]
    pub fn pending_steps(&self) -> u8 {
        self.pending_steps
    }

    /// シークを中止
    pub fn cancel_seek(&mut self) {
        self.pending_steps = 0;
    }

    /// 目標方向に1ステップ
    ///
    /// パルスを消費したらtrue。ヘッドは0とmax_cylinderで止まる。
    pub fn step_toward(&mut self, target: u8) -> bool {
        if self.pending_steps == 0 {
            return false;
        }
        self.pending_steps -= 1;
        if target > self.cylinder {
            self.cylinder = (self.cylinder + 1).min(self.max_cylinder);
        } else if target < self.cylinder {
            self.cylinder -= 1;
        }
        true
    }

    // ============================================================
    // セクタ契約（現在シリンダのトラックが対象）
    // ============================================================

    pub fn sector_count(&self, head: u8) -> usize {
        self.disk.as_ref().map_or(0, |d| d.sector_count(self.cylinder, head))
    }

    /// 物理順でセクタを取得
    pub fn sector_by_index(&self, head: u8, index: usize) -> Option<&SectorRecord> {
        self.disk.as_ref()?.sector(self.cylinder, head, index)
    }

    /// IDでセクタを探す（物理インデックスも返す）
    pub fn sector_by_id(&self, head: u8, start_index: usize, id: &SectorId) -> Option<(usize, &SectorRecord)> {
        let disk = self.disk.as_ref()?;
        let index = disk.find_sector(self.cylinder, head, start_index, id)?;
        disk.sector(self.cylinder, head, index).map(|rec| (index, rec))
    }

    pub fn format_track(&mut self, head: u8, ids: &[SectorId], fill: &[u8]) -> bool {
        if self.write_protect {
            return false;
        }
        let cylinder = self.cylinder;
        self.disk.as_mut().map_or(false, |d| d.format_track(cylinder, head, ids, fill))
    }

    pub fn write_sector(&mut self, head: u8, index: usize, data: &[u8], deleted: bool) -> bool {
        if self.write_protect {
            return false;
        }
        let cylinder = self.cylinder;
        self.disk.as_mut().map_or(false, |d| d.write_sector(cylinder, head, index, data, deleted))
    }
}

/// ドライブ選択コード（0-3）からドライブを引く
pub trait DriveSelector {
    fn drive_for_select_code(&mut self, code: u8) -> Option<&mut DriveUnit>;
}

/// 4スロットのドライブベイ
#[derive(Default)]
pub struct DriveBay {
    slots: [Option<DriveUnit>; MAX_DRIVES],
}

impl DriveBay {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定スロットにドライブを接続
    pub fn connect(&mut self, slot: usize, drive: DriveUnit) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = Some(drive);
        }
    }

    pub fn disconnect(&mut self, slot: usize) -> Option<DriveUnit> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn drive(&self, slot: usize) -> Option<&DriveUnit> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn drive_mut(&mut self, slot: usize) -> Option<&mut DriveUnit> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }
}

impl DriveSelector for DriveBay {
    fn drive_for_select_code(&mut self, code: u8) -> Option<&mut DriveUnit> {
        self.drive_mut((code & 0x03) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Geometry, MemoryDisk, DEFAULT_FILL_BYTE};

    fn drive_with_disk() -> DriveUnit {
        let mut drive = DriveUnit::new(41);
        drive.insert(Box::new(MemoryDisk::blank(Geometry::PC_360K, DEFAULT_FILL_BYTE)));
        drive
    }

    #[test]
    fn test_step_toward_consumes_pulses() {
        let mut drive = DriveUnit::new(41);
        drive.start_seek(3);
        assert!(drive.step_toward(10));
        assert!(drive.step_toward(10));
        assert!(drive.step_toward(10));
        assert!(!drive.step_toward(10));
        assert_eq!(drive.cylinder(), 3);
        assert_eq!(drive.pending_steps(), 0);
    }

    #[test]
    fn test_step_clamps_at_max_cylinder() {
        let mut drive = DriveUnit::new(2);
        drive.start_seek(10);
        for _ in 0..10 {
            drive.step_toward(50);
        }
        assert_eq!(drive.cylinder(), 2);
    }

    #[test]
    fn test_sector_contract_follows_cylinder() {
        let mut drive = drive_with_disk();
        drive.start_seek(5);
        for _ in 0..5 {
            drive.step_toward(5);
        }
        let id = SectorId::new(5, 1, 3, 2);
        let (index, rec) = drive.sector_by_id(1, 0, &id).unwrap();
        assert_eq!(index, 2);
        assert_eq!(rec.id(), id);
        assert!(drive.sector_by_id(1, 0, &SectorId::new(0, 1, 3, 2)).is_none());
        assert_eq!(drive.sector_by_index(0, 0).unwrap().id(), SectorId::new(5, 0, 1, 2));
        assert_eq!(drive.sector_count(0), 9);
    }

    #[test]
    fn test_write_protect_switch() {
        let mut drive = drive_with_disk();
        assert!(!drive.is_write_protected());
        drive.set_write_protect(true);
        assert!(drive.is_write_protected());
        assert!(!drive.write_sector(0, 0, &[0; 512], false));
        drive.set_write_protect(false);
        assert!(drive.write_sector(0, 0, &[0; 512], false));
    }

    #[test]
    fn test_empty_drive_is_not_ready() {
        let mut drive = DriveUnit::default();
        assert!(!drive.is_ready());
        assert!(drive.sector_by_index(0, 0).is_none());
        assert!(!drive.format_track(0, &[], &[0]));
        drive.insert(Box::new(MemoryDisk::unformatted(40, 1)));
        assert!(drive.is_ready());
        assert!(!drive.is_two_sided());
        assert!(drive.eject().is_some());
        assert!(!drive.is_ready());
    }

    #[test]
    fn test_drive_bay_selection() {
        let mut bay = DriveBay::new();
        bay.connect(1, DriveUnit::new(79));
        assert!(bay.drive_for_select_code(0).is_none());
        assert!(bay.drive_for_select_code(1).is_some());
        // 上位ビットは無視
        assert!(bay.drive_for_select_code(0x05).is_some());
        assert!(bay.disconnect(1).is_some());
        assert!(bay.drive_for_select_code(1).is_none());
    }
}
