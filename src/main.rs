//! FDC8272 - Intel 8272A Floppy Disk Controller in Rust
//!
//! ディスクイメージをエミュレートしたFDC経由で操作するツール。
//!
//! # 使用方法
//! ```text
//! fdc8272 --image disk.img --ids
//! fdc8272 --image disk.img --dump copy.img
//! fdc8272 --geometry 80x2x18 --format blank.img
//! ```

use clap::Parser;
use fdc8272::config::{self, FdcConfig};
use fdc8272::disk::{Disk, Geometry, MemoryDisk};
use fdc8272::drive::{DriveBay, DriveUnit};
use fdc8272::fdc::Fdc8272;
use fdc8272::fdc_log;
use fdc8272::host::PolledHost;
use std::fs;

/// FDC8272 - Intel 8272A Floppy Disk Controller in Rust
#[derive(Parser, Debug)]
#[command(name = "fdc8272")]
#[command(version = "0.1.0")]
#[command(about = "Drive disk images through an emulated 8272A controller", long_about = None)]
struct Args {
    /// 設定ファイル（未指定なら実行ファイルと同じディレクトリ）
    #[arg(short, long)]
    config: Option<String>,

    /// ドライブ0のディスクイメージ（設定より優先）
    #[arg(short, long)]
    image: Option<String>,

    /// ディスク形状 CxHxS[xN]（未指定ならサイズから推定）
    #[arg(short, long)]
    geometry: Option<String>,

    /// 対象ドライブ（0-3）
    #[arg(short, long, default_value = "0")]
    drive: u8,

    /// 全トラックのセクタIDを READ ID で表示
    #[arg(long)]
    ids: bool,

    /// 全セクタを READ DATA で読み出してファイルに保存
    #[arg(long)]
    dump: Option<String>,

    /// 空ディスクを FORMAT TRACK で作成してファイルに保存
    #[arg(long)]
    format: Option<String>,

    /// 1回のupdateで進めるtick数
    #[arg(long, default_value = "16")]
    tick_step: u64,

    /// FDCログレベル: none, flow, state, seek, data, all
    /// 複数指定可: flow+seek
    #[arg(long)]
    fdc_log: Option<String>,

    /// 有効な設定をファイルに保存
    #[arg(long)]
    save_config: Option<String>,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), String> {
    let mut cfg = match &args.config {
        Some(path) => FdcConfig::load_from(path),
        None => FdcConfig::load(),
    };

    let geometry = args.geometry.as_deref().map(config::parse_geometry).transpose()?;
    if let Some(image) = &args.image {
        if cfg.drives.is_empty() {
            cfg.drives.push(Default::default());
        }
        cfg.drives[0].image = Some(image.clone());
        cfg.drives[0].geometry = geometry.map(Into::into);
    }
    if let Some(level) = &args.fdc_log {
        cfg.fdc_log = Some(level.clone());
    }
    if let Some(level) = &cfg.fdc_log {
        fdc_log::set_log_level(fdc_log::parse_log_level(level));
    }
    if let Some(path) = &args.save_config {
        cfg.save_to(path)?;
        println!("Config saved to {}", path);
    }

    let host = PolledHost::new(args.tick_step);
    let drive = args.drive & 0x03;

    if let Some(path) = &args.format {
        let geometry = geometry.unwrap_or(Geometry::PC_1440K);
        return format_image(&cfg, &host, geometry, path);
    }

    let bay = cfg.build_drive_bay()?;
    let mut fdc = Fdc8272::new(bay);
    cfg.apply(&mut fdc);

    let geometry = match geometry.or_else(|| cfg.drives.get(drive as usize)?.geometry.map(Into::into)) {
        Some(g) => g,
        None => guess_mounted_geometry(&fdc, drive)?,
    };

    host.recalibrate(&mut fdc, drive).map_err(|e| e.to_string())?;

    if args.ids {
        list_ids(&mut fdc, &host, drive, &geometry)?;
    }
    if let Some(path) = &args.dump {
        let image = dump_image(&mut fdc, &host, drive, &geometry)?;
        fs::write(path, &image).map_err(|e| format!("Failed to write {}: {}", path, e))?;
        println!("Dumped {} bytes to {}", image.len(), path);
    }
    if !args.ids && args.dump.is_none() {
        print_drive_status(&mut fdc, &host, drive)?;
    }
    Ok(())
}

/// マウント済みディスクの形状を推定
fn guess_mounted_geometry(fdc: &Fdc8272<DriveBay>, drive: u8) -> Result<Geometry, String> {
    let disk = fdc
        .drives()
        .drive(drive as usize)
        .and_then(|d| d.disk())
        .ok_or_else(|| format!("No disk in drive {}", drive))?;
    let sides = disk.sides();
    let sectors = disk.sector_count(0, 0) as u8;
    let first = disk
        .sector(0, 0, 0)
        .map(|rec| rec.id())
        .ok_or_else(|| "Track 0 is unformatted".to_string())?;
    Ok(Geometry::new(disk.cylinders(), sides, sectors, first.size_code, first.sector))
}

fn print_drive_status(fdc: &mut Fdc8272<DriveBay>, host: &PolledHost, drive: u8) -> Result<(), String> {
    let outcome = host.execute(fdc, &[0x04, drive], &[], None).map_err(|e| e.to_string())?;
    let st3 = fdc8272::fdc::status::Status3::from_bits_truncate(outcome.result.first().copied().unwrap_or(0));
    println!("Drive {}: ST3={:02X} {:?}", drive, st3.bits(), st3);
    if let Some(disk) = fdc.drives().drive(drive as usize).and_then(|d| d.disk()) {
        println!("  {} cylinders, {} side(s)", disk.cylinders(), disk.sides());
    }
    Ok(())
}

fn list_ids(fdc: &mut Fdc8272<DriveBay>, host: &PolledHost, drive: u8, geometry: &Geometry) -> Result<(), String> {
    for cyl in 0..geometry.cylinders {
        host.seek(fdc, drive, 0, cyl).map_err(|e| e.to_string())?;
        for head in 0..geometry.sides {
            let mut seen = Vec::new();
            // 1回転分サンプリング
            for _ in 0..geometry.sectors_per_track as usize * 2 {
                let outcome = host.read_id(fdc, drive, head).map_err(|e| e.to_string())?;
                match outcome.id() {
                    Some(id) if outcome.is_normal() => {
                        if !seen.contains(&id) {
                            seen.push(id);
                        }
                    }
                    _ => break,
                }
            }
            let ids: Vec<String> = seen.iter().map(|id| id.sector.to_string()).collect();
            println!("C{:02} H{}: {}", cyl, head, ids.join(" "));
        }
    }
    Ok(())
}

fn dump_image(fdc: &mut Fdc8272<DriveBay>, host: &PolledHost, drive: u8, geometry: &Geometry) -> Result<Vec<u8>, String> {
    let mut image = Vec::with_capacity(geometry.image_size());
    for cyl in 0..geometry.cylinders {
        host.seek(fdc, drive, 0, cyl).map_err(|e| e.to_string())?;
        for head in 0..geometry.sides {
            let mut outcome = host
                .read_logical_track(fdc, drive, geometry, cyl, head)
                .map_err(|e| e.to_string())?;
            if !outcome.completed_track() {
                log::warn!("C{} H{}: read failed {:02X?}", cyl, head, outcome.result);
            }
            outcome.data.resize(geometry.track_bytes(), 0);
            image.extend_from_slice(&outcome.data);
        }
    }
    Ok(image)
}

fn format_image(cfg: &FdcConfig, host: &PolledHost, geometry: Geometry, path: &str) -> Result<(), String> {
    geometry.validate().map_err(|e| e.to_string())?;
    let mut drive = DriveUnit::new(geometry.cylinders.saturating_sub(1).max(1));
    drive.insert(Box::new(MemoryDisk::unformatted(geometry.cylinders, geometry.sides)));
    let mut bay = DriveBay::new();
    bay.connect(0, drive);
    let mut fdc = Fdc8272::new(bay);
    cfg.apply(&mut fdc);

    host.recalibrate(&mut fdc, 0).map_err(|e| e.to_string())?;
    for cyl in 0..geometry.cylinders {
        host.seek(&mut fdc, 0, 0, cyl).map_err(|e| e.to_string())?;
        for head in 0..geometry.sides {
            let ids = geometry.track_ids(cyl, head);
            let outcome = host
                .format_track(&mut fdc, 0, head, &ids, fdc8272::disk::DEFAULT_FILL_BYTE)
                .map_err(|e| e.to_string())?;
            if !outcome.is_normal() {
                return Err(format!("Format failed at C{} H{}: {:02X?}", cyl, head, outcome.result));
            }
        }
    }

    let image = dump_image(&mut fdc, host, 0, &geometry)?;
    fs::write(path, &image).map_err(|e| format!("Failed to write {}: {}", path, e))?;
    println!("Formatted {}x{}x{} image written to {}", geometry.cylinders, geometry.sides, geometry.sectors_per_track, path);
    Ok(())
}
