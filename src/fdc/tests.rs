use super::*;
use crate::disk::{Disk, Geometry, MemoryDisk, DEFAULT_FILL_BYTE};
use crate::drive::{DriveBay, DriveUnit};
use crate::sector::{SectorFlags, SectorRecord};

/// 1回転 = 20000 tick, 1バイト = 3 tick, 検索 = 1250 tick
const TPM: u32 = 100;
const MAX_TICKS: usize = 5_000_000;

const SMALL: Geometry = Geometry::new(2, 2, 4, 0, 1);

fn controller_with(disk: MemoryDisk) -> Fdc8272<DriveBay> {
    let mut drive = DriveUnit::new(79);
    drive.insert(Box::new(disk));
    let mut bay = DriveBay::new();
    bay.connect(0, drive);
    let mut fdc = Fdc8272::new(bay);
    fdc.set_tstates_per_millisecond(TPM);
    fdc.set_non_dma(true);
    fdc
}

fn small_raw() -> Vec<u8> {
    (0..SMALL.image_size()).map(|i| (i / 128) as u8 ^ (i as u8)).collect()
}

fn small_controller() -> (Fdc8272<DriveBay>, Vec<u8>) {
    let raw = small_raw();
    let disk = MemoryDisk::from_raw(SMALL, &raw).unwrap();
    (controller_with(disk), raw)
}

fn custom_track(sectors: Vec<SectorRecord>) -> Fdc8272<DriveBay> {
    let mut disk = MemoryDisk::unformatted(2, 1);
    disk.set_track(0, 0, sectors);
    controller_with(disk)
}

fn send(fdc: &mut Fdc8272<DriveBay>, bytes: &[u8]) {
    for &b in bytes {
        let msr = fdc.main_status();
        assert!(msr.contains(MainStatus::RQM) && !msr.contains(MainStatus::DIO), "not ready for {:02X}: {:?}", b, msr);
        fdc.write_data(b);
    }
}

fn drain_result(fdc: &mut Fdc8272<DriveBay>) -> Vec<u8> {
    let mut result = Vec::new();
    while fdc.main_status().contains(MainStatus::RQM | MainStatus::DIO) {
        result.push(fdc.read_data());
    }
    result
}

/// 非DMAモードで実行フェーズを回し、(転送データ, 結果) を返す
///
/// 読み出しは `limit` バイトでTC、書き込みは `outgoing` が尽きたらTC。
fn run(fdc: &mut Fdc8272<DriveBay>, outgoing: &[u8], limit: Option<usize>) -> (Vec<u8>, Vec<u8>) {
    let mut data = Vec::new();
    let mut out = outgoing.iter();
    for _ in 0..MAX_TICKS {
        let msr = fdc.main_status();
        if !msr.contains(MainStatus::CB) {
            return (data, Vec::new());
        }
        if msr.contains(MainStatus::RQM | MainStatus::DIO) && !msr.contains(MainStatus::EXM) {
            return (data, drain_result(fdc));
        }
        if msr.contains(MainStatus::EXM | MainStatus::RQM) {
            if msr.contains(MainStatus::DIO) {
                data.push(fdc.read_data());
                if limit == Some(data.len()) {
                    fdc.terminal_count();
                }
            } else {
                match out.next() {
                    Some(&b) => fdc.write_data(b),
                    None => fdc.terminal_count(),
                }
            }
            continue;
        }
        fdc.update(1);
    }
    panic!("command did not finish");
}

fn wait_interrupt(fdc: &mut Fdc8272<DriveBay>) {
    for _ in 0..MAX_TICKS {
        if fdc.interrupt_request() {
            return;
        }
        fdc.update(1);
    }
    panic!("no interrupt");
}

fn sense_interrupt(fdc: &mut Fdc8272<DriveBay>) -> Vec<u8> {
    send(fdc, &[0x08]);
    drain_result(fdc)
}

fn rotate_to(fdc: &mut Fdc8272<DriveBay>, position: u64) {
    let rt = fdc.rotation_ticks();
    let delta = (position + rt - fdc.rotation_position()) % rt;
    if delta > 0 {
        fdc.update(delta);
    }
    assert_eq!(fdc.rotation_position(), position);
}

fn filled(c: u8, r: u8, fill: u8) -> SectorRecord {
    SectorRecord::filled(SectorId::new(c, 0, r, 0), fill)
}

// ============================================================
// コマンドフェーズ
// ============================================================

#[test]
fn test_invalid_command() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x1F]);
    assert_eq!(fdc.main_status(), MainStatus::RQM | MainStatus::DIO | MainStatus::CB);
    assert!(!fdc.interrupt_request());
    assert_eq!(drain_result(&mut fdc), vec![0x80]);
    assert_eq!(fdc.main_status(), MainStatus::RQM);
}

#[test]
fn test_argument_counts() {
    // 下位5ビット → コマンドバイトを含む長さ
    let lengths: [(u8, usize); 15] = [
        (0x02, 9),
        (0x03, 3),
        (0x04, 2),
        (0x05, 9),
        (0x06, 9),
        (0x07, 2),
        (0x08, 1),
        (0x09, 9),
        (0x0A, 2),
        (0x0C, 9),
        (0x0D, 6),
        (0x0F, 3),
        (0x11, 9),
        (0x19, 9),
        (0x1D, 9),
    ];
    for code in 0u8..0x20 {
        let known = lengths.iter().any(|&(c, _)| c == code);
        assert_eq!(Opcode::decode(code) != Opcode::Invalid, known, "{:02X}", code);
    }

    let (mut fdc, _) = small_controller();
    for (code, len) in lengths {
        fdc.reset();
        fdc.write_data(code);
        // 最後の1バイト手前まではコマンドフェーズのまま
        for _ in 1..len {
            assert_eq!(fdc.main_status(), MainStatus::RQM | MainStatus::CB, "{:02X}", code);
            fdc.write_data(0x00);
        }
        assert_ne!(fdc.main_status(), MainStatus::RQM | MainStatus::CB, "{:02X}", code);
    }
    fdc.reset();

    // SPECIFYは結果なしでアイドルに戻る
    send(&mut fdc, &[0x03, 0xF0]);
    assert!(fdc.main_status().contains(MainStatus::CB));
    send(&mut fdc, &[0x02]);
    assert_eq!(fdc.main_status(), MainStatus::RQM);
}

#[test]
fn test_extra_bytes_are_ignored() {
    let (mut fdc, raw) = small_controller();
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 4, 0x1B, 0xFF]);
    // 実行フェーズ開始直後の余分な書き込み
    fdc.write_data(0x0F);
    fdc.write_data(0x00);
    let (data, result) = run(&mut fdc, &[], None);
    assert_eq!(data, raw[..512].to_vec());
    assert_eq!(result, vec![0x40, 0x80, 0x00, 1, 0, 1, 0]);

    // 結果フェーズ中の書き込みも無視される
    send(&mut fdc, &[0x04, 0x00]);
    fdc.write_data(0x06);
    assert_eq!(drain_result(&mut fdc).len(), 1);
    assert_eq!(fdc.main_status(), MainStatus::RQM);
}

#[test]
fn test_sense_interrupt_without_pending_seek() {
    let (mut fdc, _) = small_controller();
    assert_eq!(sense_interrupt(&mut fdc), vec![0x80]);
}

#[test]
fn test_specify_sets_step_rate_and_mode() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x03, 0xF0, 0x02]);
    assert_eq!(fdc.step_ticks(), TPM as u64);
    assert!(!fdc.is_non_dma());
    send(&mut fdc, &[0x03, 0x00, 0x03]);
    assert_eq!(fdc.step_ticks(), 16 * TPM as u64);
    assert!(fdc.is_non_dma());
}

#[test]
fn test_sense_drive_status() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x04, 0x04]);
    let st3 = Status3::from_bits_truncate(drain_result(&mut fdc)[0]);
    assert_eq!(st3, Status3::RY | Status3::T0 | Status3::TS | Status3::HD);

    fdc.drives_mut().drive_mut(0).unwrap().set_write_protect(true);
    send(&mut fdc, &[0x04, 0x00]);
    let st3 = Status3::from_bits_truncate(drain_result(&mut fdc)[0]);
    assert!(st3.contains(Status3::WP));

    // 未接続ドライブはレディにならない
    send(&mut fdc, &[0x04, 0x01]);
    assert_eq!(drain_result(&mut fdc), vec![0x01]);
}

#[test]
fn test_timing_follows_clock_settings() {
    let (mut fdc, _) = small_controller();
    assert_eq!(fdc.rotation_ticks(), 20_000);
    assert_eq!(fdc.byte_ticks(), 3);
    fdc.set_speed_multiplier(2);
    assert_eq!(fdc.rotation_ticks(), 40_000);
    assert_eq!(fdc.byte_ticks(), 6);
}

#[test]
fn test_timing_saturates_at_extreme_clock() {
    let (mut fdc, _) = small_controller();
    fdc.set_tstates_per_millisecond(u32::MAX);
    fdc.set_speed_multiplier(u32::MAX);
    assert_eq!(fdc.rotation_ticks(), u64::MAX);
    assert_eq!(fdc.step_ticks(), u64::MAX);
    assert!(fdc.byte_ticks() > 1);
    fdc.update(u64::MAX);
    fdc.update(u64::MAX);
    assert!(fdc.rotation_position() < fdc.rotation_ticks());
}

#[test]
fn test_index_hole_each_rotation() {
    let (mut fdc, _) = small_controller();
    assert!(fdc.index_hole());
    fdc.update(fdc.rotation_ticks() / 2);
    assert!(!fdc.index_hole());
    fdc.update(fdc.rotation_ticks() / 2);
    assert!(fdc.index_hole());
}

// ============================================================
// SEEK / RECALIBRATE
// ============================================================

#[test]
fn test_seek_to_current_cylinder() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x0F, 0x00, 0]);
    assert!(fdc.interrupt_request());
    assert!(fdc.main_status().contains(MainStatus::D0B));
    assert_eq!(sense_interrupt(&mut fdc), vec![0x20, 0]);
    assert!(!fdc.main_status().contains(MainStatus::D0B));
    assert!(!fdc.interrupt_request());
}

#[test]
fn test_seek_and_recalibrate() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x0F, 0x00, 10]);
    assert_eq!(fdc.main_status(), MainStatus::RQM | MainStatus::D0B);
    assert!(fdc.is_busy());
    wait_interrupt(&mut fdc);
    assert_eq!(fdc.drives().drive(0).unwrap().cylinder(), 10);
    assert_eq!(sense_interrupt(&mut fdc), vec![0x20, 10]);
    assert!(!fdc.is_busy());

    send(&mut fdc, &[0x07, 0x00]);
    wait_interrupt(&mut fdc);
    // MSR読み出しで割り込みラッチは落ちるが、結果は残る
    fdc.read_main_status();
    assert!(!fdc.interrupt_request());
    assert_eq!(sense_interrupt(&mut fdc), vec![0x20, 0]);
    assert!(fdc.drives().drive(0).unwrap().is_track0());
}

#[test]
fn test_seek_takes_step_time() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x03, 0xF0, 0x02]);
    send(&mut fdc, &[0x0F, 0x00, 3]);
    fdc.update(2 * fdc.step_ticks());
    assert!(!fdc.interrupt_request());
    assert_eq!(fdc.drives().drive(0).unwrap().cylinder(), 2);
    fdc.update(fdc.step_ticks());
    assert!(fdc.interrupt_request());
}

#[test]
fn test_seek_beyond_pulse_limit() {
    let mut drive = DriveUnit::new(100);
    drive.insert(Box::new(MemoryDisk::blank(Geometry::PC_720K, DEFAULT_FILL_BYTE)));
    let mut bay = DriveBay::new();
    bay.connect(0, drive);
    let mut fdc = Fdc8272::new(bay);
    fdc.set_tstates_per_millisecond(TPM);

    send(&mut fdc, &[0x0F, 0x00, 90]);
    wait_interrupt(&mut fdc);
    assert_eq!(sense_interrupt(&mut fdc), vec![0x70, MAX_STEP_PULSES]);
}

#[test]
fn test_seek_without_disk() {
    let mut bay = DriveBay::new();
    bay.connect(0, DriveUnit::new(79));
    let mut fdc = Fdc8272::new(bay);
    send(&mut fdc, &[0x0F, 0x00, 5]);
    assert_eq!(sense_interrupt(&mut fdc), vec![0x68, 0]);
}

// ============================================================
// READ DATA
// ============================================================

#[test]
fn test_read_to_end_of_cylinder() {
    let (mut fdc, raw) = small_controller();
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 4, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    assert_eq!(data, raw[..512].to_vec());
    assert_eq!(result, vec![0x40, 0x80, 0x00, 1, 0, 1, 0]);
}

#[test]
fn test_terminal_count_ends_normally() {
    let (mut fdc, raw) = small_controller();
    send(&mut fdc, &[0x46, 0x00, 0, 0, 2, 0, 4, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], Some(128));
    assert_eq!(data, raw[128..256].to_vec());
    assert_eq!(result, vec![0x00, 0x00, 0x00, 0, 0, 3, 0]);
    assert_eq!(fdc.main_status(), MainStatus::RQM);
    assert!(!fdc.is_busy());
}

#[test]
fn test_terminal_count_mid_sector() {
    let (mut fdc, raw) = small_controller();
    send(&mut fdc, &[0x46, 0x00, 0, 0, 4, 0, 4, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], Some(10));
    assert_eq!(data, raw[384..394].to_vec());
    // 最終セクタでTC: C+1, R=1
    assert_eq!(result, vec![0x00, 0x00, 0x00, 1, 0, 1, 0]);
}

#[test]
fn test_multi_track_read() {
    let (mut fdc, raw) = small_controller();
    send(&mut fdc, &[0xC6, 0x00, 0, 0, 1, 0, 4, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    assert_eq!(data, raw[..1024].to_vec());
    assert_eq!(result, vec![0x44, 0x80, 0x00, 1, 0, 1, 0]);
}

#[test]
fn test_multi_track_terminal_count_on_side_zero() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0xC6, 0x00, 0, 0, 4, 0, 4, 0x1B, 0xFF]);
    let (_, result) = run(&mut fdc, &[], Some(128));
    assert_eq!(result, vec![0x00, 0x00, 0x00, 0, 1, 1, 0]);
}

#[test]
fn test_result_phase_raises_interrupt() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 1, 0x1B, 0xFF]);
    for _ in 0..MAX_TICKS {
        if fdc.main_status().contains(MainStatus::RQM | MainStatus::EXM) {
            fdc.read_data();
        } else if fdc.main_status().contains(MainStatus::DIO) {
            break;
        }
        fdc.update(1);
    }
    assert!(fdc.interrupt_request());
    fdc.read_data();
    assert!(!fdc.interrupt_request());
    assert_eq!(drain_result(&mut fdc).len(), 6);
}

#[test]
fn test_missing_sector() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x46, 0x00, 0, 0, 9, 0, 9, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    assert!(data.is_empty());
    assert_eq!(result, vec![0x40, 0x04, 0x00, 0, 0, 9, 0]);
}

#[test]
fn test_read_sector_ff_at_end_of_track() {
    let mut fdc = custom_track(vec![filled(0, 0xFF, 0x5A)]);
    send(&mut fdc, &[0x06, 0x00, 0, 0, 0xFF, 0, 0xFF, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    assert_eq!(data, vec![0x5A; 128]);
    assert_eq!(result, vec![0x40, 0x80, 0x00, 1, 0, 1, 0]);
}

#[test]
fn test_wrong_cylinder() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x46, 0x00, 1, 0, 1, 0, 4, 0x1B, 0xFF]);
    let (_, result) = run(&mut fdc, &[], None);
    assert_eq!(result, vec![0x40, 0x04, 0x10, 1, 0, 1, 0]);

    let mut fdc = custom_track(vec![filled(0xFF, 1, 0)]);
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 1, 0x1B, 0xFF]);
    let (_, result) = run(&mut fdc, &[], None);
    assert_eq!(result[2], 0x12);
}

#[test]
fn test_missing_address_marks() {
    let mut fdc = custom_track(vec![SectorRecord::without_data(SectorId::new(0, 0, 1, 0))]);
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 1, 0x1B, 0xFF]);
    let (_, result) = run(&mut fdc, &[], None);
    assert_eq!(&result[..3], &[0x40, 0x01, 0x01]);

    // 未フォーマットトラック
    let mut fdc = controller_with(MemoryDisk::unformatted(2, 1));
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 1, 0x1B, 0xFF]);
    let (_, result) = run(&mut fdc, &[], None);
    assert_eq!(&result[..3], &[0x40, 0x01, 0x00]);
}

#[test]
fn test_crc_error_transfers_then_stops() {
    let mut fdc = custom_track(vec![
        filled(0, 1, 0x33).with_flags(SectorFlags::CRC_ERROR),
        filled(0, 2, 0x44),
    ]);
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 2, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    assert_eq!(data, vec![0x33; 128]);
    assert_eq!(result, vec![0x40, 0x20, 0x20, 0, 0, 1, 0]);
}

#[test]
fn test_not_ready_drive() {
    let mut bay = DriveBay::new();
    bay.connect(0, DriveUnit::new(79));
    let mut fdc = Fdc8272::new(bay);
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 1, 0x1B, 0xFF]);
    assert_eq!(drain_result(&mut fdc)[0], 0x48);
    send(&mut fdc, &[0x46, 0x01, 0, 0, 1, 0, 1, 0x1B, 0xFF]);
    assert_eq!(drain_result(&mut fdc)[0], 0x49);
}

#[test]
fn test_overrun() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 1, 0x1B, 0xFF]);
    while !fdc.main_status().contains(MainStatus::EXM | MainStatus::RQM) {
        fdc.update(1);
    }
    fdc.update(fdc.rotation_ticks());
    let result = drain_result(&mut fdc);
    assert_eq!(&result[..2], &[0x40, 0x10]);
}

#[test]
fn test_dma_transfer() {
    let (mut fdc, raw) = small_controller();
    fdc.set_non_dma(false);
    send(&mut fdc, &[0x46, 0x00, 0, 0, 3, 0, 3, 0x1B, 0xFF]);
    let mut data = Vec::new();
    for _ in 0..MAX_TICKS {
        if fdc.dma_request() {
            data.push(fdc.read_dma());
            continue;
        }
        let msr = fdc.main_status();
        if msr.contains(MainStatus::DIO) {
            break;
        }
        assert_eq!(msr, MainStatus::CB);
        fdc.update(1);
    }
    assert_eq!(data, raw[256..384].to_vec());
    let signals = fdc.take_signals();
    assert!(signals.contains(&FdcSignal::DmaRequest(true)));
    assert!(signals.contains(&FdcSignal::DmaRequest(false)));
    assert_eq!(signals.last(), Some(&FdcSignal::Interrupt(true)));
    assert_eq!(drain_result(&mut fdc), vec![0x40, 0x80, 0x00, 1, 0, 1, 0]);
}

// ============================================================
// 削除データとスキップ
// ============================================================

fn deleted_track() -> Fdc8272<DriveBay> {
    custom_track(vec![
        filled(0, 1, 1),
        filled(0, 2, 2).with_flags(SectorFlags::DELETED),
        filled(0, 3, 3),
    ])
}

#[test]
fn test_skip_deleted_sectors() {
    let mut fdc = deleted_track();
    send(&mut fdc, &[0x26, 0x00, 0, 0, 1, 0, 3, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    let mut expected = vec![1u8; 128];
    expected.extend_from_slice(&[3u8; 128]);
    assert_eq!(data, expected);
    assert_eq!(result, vec![0x40, 0x80, 0x00, 1, 0, 1, 0]);
}

#[test]
fn test_control_mark_without_skip() {
    let mut fdc = deleted_track();
    send(&mut fdc, &[0x06, 0x00, 0, 0, 2, 0, 3, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    assert_eq!(data, vec![2u8; 128]);
    assert_eq!(result, vec![0x00, 0x00, 0x40, 0, 0, 3, 0]);
}

#[test]
fn test_read_deleted_data() {
    let mut fdc = deleted_track();
    send(&mut fdc, &[0x0C, 0x00, 0, 0, 2, 0, 2, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    assert_eq!(data, vec![2u8; 128]);
    assert_eq!(result, vec![0x40, 0x80, 0x00, 1, 0, 1, 0]);
}

// ============================================================
// WRITE
// ============================================================

#[test]
fn test_write_round_trip_pads_with_zero() {
    let mut fdc = controller_with(MemoryDisk::blank(Geometry::new(2, 1, 4, 1, 1), DEFAULT_FILL_BYTE));
    send(&mut fdc, &[0x45, 0x00, 0, 0, 2, 1, 4, 0x1B, 0xFF]);
    let (_, result) = run(&mut fdc, &[0x5A; 100], None);
    assert_eq!(result, vec![0x00, 0x00, 0x00, 0, 0, 3, 1]);

    send(&mut fdc, &[0x46, 0x00, 0, 0, 2, 1, 2, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], Some(256));
    assert_eq!(&data[..100], &[0x5A; 100]);
    assert!(data[100..].iter().all(|&b| b == 0));
    assert_eq!(result, vec![0x00, 0x00, 0x00, 1, 0, 1, 1]);
}

#[test]
fn test_write_full_sector_to_end_of_track() {
    let mut fdc = controller_with(MemoryDisk::blank(Geometry::new(2, 1, 4, 0, 1), DEFAULT_FILL_BYTE));
    send(&mut fdc, &[0x49, 0x00, 0, 0, 4, 0, 4, 0x1B, 0xFF]);
    let (_, result) = run(&mut fdc, &[0x77; 128], None);
    assert_eq!(result, vec![0x40, 0x80, 0x00, 1, 0, 1, 0]);
    let drive = fdc.drives().drive(0).unwrap();
    let rec = drive.sector_by_index(0, 3).unwrap();
    assert!(rec.is_deleted());
    assert_eq!(rec.data(), &[0x77; 128][..]);
}

#[test]
fn test_write_protected() {
    let mut fdc = controller_with(MemoryDisk::blank(Geometry::new(2, 1, 4, 1, 1), DEFAULT_FILL_BYTE));
    fdc.drives_mut().drive_mut(0).unwrap().set_write_protect(true);
    send(&mut fdc, &[0x45, 0x00, 0, 0, 2, 1, 2, 0x1B, 0xFF]);
    assert_eq!(drain_result(&mut fdc), vec![0x40, 0x02, 0x00, 0, 0, 2, 1]);

    send(&mut fdc, &[0x4D, 0x00, 1, 4, 0x1B, 0xE5]);
    assert_eq!(&drain_result(&mut fdc)[..2], &[0x40, 0x02]);
}

/// 書き込みを拒否するがライトプロテクトではないメディア
struct RejectingDisk(MemoryDisk);

impl Disk for RejectingDisk {
    fn cylinders(&self) -> u8 {
        self.0.cylinders()
    }

    fn sides(&self) -> u8 {
        self.0.sides()
    }

    fn sector_count(&self, cylinder: u8, head: u8) -> usize {
        self.0.sector_count(cylinder, head)
    }

    fn sector(&self, cylinder: u8, head: u8, index: usize) -> Option<&SectorRecord> {
        self.0.sector(cylinder, head, index)
    }

    fn format_track(&mut self, _: u8, _: u8, _: &[SectorId], _: &[u8]) -> bool {
        false
    }

    fn write_sector(&mut self, _: u8, _: u8, _: usize, _: &[u8], _: bool) -> bool {
        false
    }
}

#[test]
fn test_rejected_write_reports_data_error() {
    let mut drive = DriveUnit::new(79);
    drive.insert(Box::new(RejectingDisk(MemoryDisk::blank(Geometry::new(2, 1, 4, 1, 1), DEFAULT_FILL_BYTE))));
    let mut bay = DriveBay::new();
    bay.connect(0, drive);
    let mut fdc = Fdc8272::new(bay);
    fdc.set_tstates_per_millisecond(TPM);
    fdc.set_non_dma(true);

    send(&mut fdc, &[0x45, 0x00, 0, 0, 1, 1, 1, 0x1B, 0xFF]);
    let (_, result) = run(&mut fdc, &[0x5A; 256], None);
    assert_eq!(result, vec![0x40, 0x20, 0x00, 0, 0, 1, 1]);
    let rec = fdc.drives().drive(0).unwrap().sector_by_index(0, 0).unwrap();
    assert_eq!(rec.data(), &[DEFAULT_FILL_BYTE; 256][..]);
}

// ============================================================
// FORMAT / READ ID / READ TRACK
// ============================================================

#[test]
fn test_format_then_read_id() {
    let mut fdc = controller_with(MemoryDisk::unformatted(2, 1));
    send(&mut fdc, &[0x4D, 0x00, 0x01, 0x04, 0x1B, 0xAA]);
    let ids = [0, 0, 1, 1, 0, 0, 3, 1, 0, 0, 2, 1, 0, 0, 4, 1];
    let (_, result) = run(&mut fdc, &ids, None);
    assert_eq!(result, vec![0x00, 0x00, 0x00, 0, 0, 4, 1]);

    let drive = fdc.drives().drive(0).unwrap();
    assert_eq!(drive.sector_count(0), 4);
    let rec = drive.sector_by_index(0, 1).unwrap();
    assert_eq!(rec.id(), SectorId::new(0, 0, 3, 1));
    assert_eq!(rec.data(), &[0xAA; 256][..]);

    // 回転角に応じて物理順にIDが見える
    let rt = fdc.rotation_ticks();
    for (position, expected) in [(0, 1), (rt / 4, 3), (rt / 2, 2), (rt * 3 / 4, 4), (rt - 1, 1)] {
        rotate_to(&mut fdc, position);
        send(&mut fdc, &[0x0A, 0x00]);
        let (_, result) = run(&mut fdc, &[], None);
        assert_eq!(result, vec![0x00, 0x00, 0x00, 0, 0, expected, 1], "position {}", position);
    }
}

#[test]
fn test_read_id_on_blank_track() {
    let mut fdc = controller_with(MemoryDisk::unformatted(2, 1));
    send(&mut fdc, &[0x0A, 0x00]);
    let (_, result) = run(&mut fdc, &[], None);
    assert_eq!(&result[..2], &[0x40, 0x01]);
}

#[test]
fn test_format_waits_for_index_hole() {
    let mut fdc = controller_with(MemoryDisk::unformatted(2, 1));
    fdc.update(10);
    send(&mut fdc, &[0x4D, 0x00, 0x00, 0x01, 0x1B, 0x00]);
    fdc.update(fdc.rotation_ticks() / 2);
    assert!(!fdc.main_status().contains(MainStatus::RQM));
    let (_, result) = run(&mut fdc, &[0, 0, 1, 0], None);
    assert!(Status0::from_bits_truncate(result[0]).is_normal_termination());
}

#[test]
fn test_read_track_in_physical_order() {
    let mut fdc = custom_track(vec![filled(0, 3, 3), filled(0, 1, 1), filled(0, 2, 2)]);
    send(&mut fdc, &[0x02, 0x00, 0, 0, 1, 0, 3, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    let expected: Vec<u8> = [3u8, 1, 2].iter().flat_map(|&b| vec![b; 128]).collect();
    assert_eq!(data, expected);
    assert_eq!(result, vec![0x40, 0x80, 0x00, 0, 0, 4, 0]);
}

#[test]
fn test_read_track_skips_missing_data_mark() {
    let mut fdc = custom_track(vec![
        filled(0, 1, 1),
        SectorRecord::without_data(SectorId::new(0, 0, 2, 0)),
        filled(0, 3, 3),
    ]);
    send(&mut fdc, &[0x02, 0x00, 0, 0, 1, 0, 3, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    let expected: Vec<u8> = [1u8, 3].iter().flat_map(|&b| vec![b; 128]).collect();
    assert_eq!(data, expected);
    // データなしのセクタは数えず、トラック終端でEN
    assert_eq!(result, vec![0x40, 0x80, 0x01, 0, 0, 3, 0]);
}

#[test]
fn test_read_track_continues_past_crc_error() {
    let mut fdc = custom_track(vec![
        filled(0, 1, 1).with_flags(SectorFlags::CRC_ERROR),
        filled(0, 2, 2),
    ]);
    send(&mut fdc, &[0x02, 0x00, 0, 0, 1, 0, 2, 0x1B, 0xFF]);
    let (data, result) = run(&mut fdc, &[], None);
    let expected: Vec<u8> = [1u8, 2].iter().flat_map(|&b| vec![b; 128]).collect();
    assert_eq!(data, expected);
    assert_eq!(result, vec![0x40, 0xA0, 0x20, 0, 0, 3, 0]);
}

// ============================================================
// SCAN
// ============================================================

#[test]
fn test_scan_equal_hit() {
    let mut fdc = custom_track(vec![filled(0, 1, 0x11)]);
    send(&mut fdc, &[0x11, 0x00, 0, 0, 1, 0, 1, 0x1B, 0x01]);
    let mut pattern = vec![0x11u8; 128];
    pattern[5] = SCAN_DONT_CARE;
    let (_, result) = run(&mut fdc, &pattern, None);
    assert_eq!(result, vec![0x00, 0x00, 0x08, 0, 0, 1, 0]);
}

#[test]
fn test_scan_low_or_equal() {
    let mut fdc = custom_track(vec![filled(0, 1, 0x11)]);
    send(&mut fdc, &[0x19, 0x00, 0, 0, 1, 0, 1, 0x1B, 0x01]);
    let (_, result) = run(&mut fdc, &[0x20; 128], None);
    assert_eq!(result, vec![0x00, 0x00, 0x00, 0, 0, 1, 0]);
}

#[test]
fn test_scan_not_satisfied() {
    let mut fdc = custom_track(vec![filled(0, 1, 0x11)]);
    send(&mut fdc, &[0x11, 0x00, 0, 0, 1, 0, 1, 0x1B, 0x01]);
    let (_, result) = run(&mut fdc, &[0x22; 128], None);
    assert_eq!(result, vec![0x40, 0x80, 0x04, 1, 0, 1, 0]);
}

#[test]
fn test_scan_high_or_equal() {
    let mut fdc = custom_track(vec![filled(0, 1, 0x11)]);
    send(&mut fdc, &[0x1D, 0x00, 0, 0, 1, 0, 1, 0x1B, 0x01]);
    let (_, result) = run(&mut fdc, &[0x10; 128], None);
    assert_eq!(result, vec![0x00, 0x00, 0x00, 0, 0, 1, 0]);

    send(&mut fdc, &[0x1D, 0x00, 0, 0, 1, 0, 1, 0x1B, 0x01]);
    let (_, result) = run(&mut fdc, &[0x11; 128], None);
    assert_eq!(result, vec![0x00, 0x00, 0x08, 0, 0, 1, 0]);

    send(&mut fdc, &[0x1D, 0x00, 0, 0, 1, 0, 1, 0x1B, 0x01]);
    let (_, result) = run(&mut fdc, &[0x20; 128], None);
    assert_eq!(result, vec![0x40, 0x80, 0x04, 1, 0, 1, 0]);
}

#[test]
fn test_scan_sector_step_two() {
    // STP=2 なら R=2 は比較されず R=3 で一致する
    let mut fdc = custom_track(vec![filled(0, 1, 0x11), filled(0, 2, 0x33), filled(0, 3, 0x33)]);
    send(&mut fdc, &[0x11, 0x00, 0, 0, 1, 0, 3, 0x1B, 0x02]);
    let (_, result) = run(&mut fdc, &[0x33; 256], None);
    assert_eq!(result, vec![0x00, 0x00, 0x08, 0, 0, 3, 0]);
}

#[test]
fn test_scan_step_past_sector_ff() {
    let mut fdc = custom_track(vec![filled(0, 0xFE, 0x11)]);
    send(&mut fdc, &[0x11, 0x00, 0, 0, 0xFE, 0, 0xFF, 0x1B, 0x02]);
    let (_, result) = run(&mut fdc, &[0x22; 128], None);
    assert_eq!(result, vec![0x40, 0x80, 0x04, 1, 0, 1, 0]);
}

// ============================================================
// リセット
// ============================================================

#[test]
fn test_reset_returns_to_idle() {
    let (mut fdc, _) = small_controller();
    send(&mut fdc, &[0x0F, 0x00, 30]);
    send(&mut fdc, &[0x46, 0x00, 0, 0, 1, 0, 4, 0x1B, 0xFF]);
    fdc.update(5000);
    assert!(fdc.is_busy());
    fdc.reset();
    assert!(!fdc.is_busy());
    assert!(!fdc.interrupt_request());
    assert_eq!(fdc.main_status(), MainStatus::RQM);
    assert_eq!(sense_interrupt(&mut fdc), vec![0x80]);
}
