//! FDC8272 セルフテストランナー
//!
//! 未フォーマットのディスクに FORMAT → WRITE → READ を行い、内容を比較する。
//!
//! 使用方法: cargo run --bin fdc_selftest -- --cylinders 3

use clap::Parser;
use fdc8272::disk::{Geometry, MemoryDisk, DEFAULT_FILL_BYTE};
use fdc8272::drive::{DriveBay, DriveUnit};
use fdc8272::fdc::Fdc8272;
use fdc8272::fdc_log;
use fdc8272::host::PolledHost;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "fdc_selftest")]
#[command(about = "Format, write and read back disks through the emulated 8272A", long_about = None)]
struct Args {
    /// テストするシリンダ数
    #[arg(long, default_value = "3")]
    cylinders: u8,

    /// 書き込みデータの乱数シード
    #[arg(long, default_value = "8272")]
    seed: u64,

    /// 非DMAモードでテスト
    #[arg(long)]
    non_dma: bool,

    /// FDCログレベル
    #[arg(long, default_value = "none")]
    fdc_log: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    fdc_log::set_log_level(fdc_log::parse_log_level(&args.fdc_log));

    println!("===========================================");
    println!("  FDC8272 Format/Write/Read Self Test");
    println!("===========================================\n");

    let presets = [
        ("PC 360K", Geometry::PC_360K),
        ("PC 720K", Geometry::PC_720K),
        ("PC 1.44M", Geometry::PC_1440K),
        ("CPC Data", Geometry::CPC_DATA),
    ];

    let mut failures = 0;
    for (name, preset) in presets.iter() {
        let geometry = Geometry {
            cylinders: args.cylinders.clamp(1, preset.cylinders),
            ..*preset
        };
        println!("----------------------------------------");
        println!("Test: {} ({}x{}x{})", name, geometry.cylinders, geometry.sides, geometry.sectors_per_track);

        let start_time = Instant::now();
        match run_test(geometry, args.seed, args.non_dma) {
            Ok(bytes) => {
                println!("  PASS: {} bytes verified in {:?}\n", bytes, start_time.elapsed());
            }
            Err(e) => {
                println!("  FAIL: {}\n", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        println!("*** {} TEST(S) FAILED ***", failures);
        std::process::exit(1);
    }
    println!("*** ALL TESTS PASSED ***");
}

fn run_test(geometry: Geometry, seed: u64, non_dma: bool) -> Result<usize, String> {
    let mut drive = DriveUnit::new(geometry.cylinders.saturating_sub(1).max(1));
    drive.insert(Box::new(MemoryDisk::unformatted(geometry.cylinders, geometry.sides)));
    let mut bay = DriveBay::new();
    bay.connect(0, drive);
    let mut fdc = Fdc8272::new(bay);
    fdc.set_non_dma(non_dma);

    let host = PolledHost::default();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut expected = Vec::with_capacity(geometry.image_size());

    host.recalibrate(&mut fdc, 0).map_err(|e| e.to_string())?;
    for cyl in 0..geometry.cylinders {
        let (st0, pcn) = host.seek(&mut fdc, 0, 0, cyl).map_err(|e| e.to_string())?;
        if pcn != cyl {
            return Err(format!("Seek to {} stopped at {} (ST0={:02X})", cyl, pcn, st0.bits()));
        }
        for head in 0..geometry.sides {
            let outcome = host
                .format_track(&mut fdc, 0, head, &geometry.track_ids(cyl, head), DEFAULT_FILL_BYTE)
                .map_err(|e| e.to_string())?;
            if !outcome.is_normal() {
                return Err(format!("Format C{} H{}: {:02X?}", cyl, head, outcome.result));
            }

            let mut data = vec![0u8; geometry.track_bytes()];
            rng.fill_bytes(&mut data);
            let outcome = host
                .write_logical_track(&mut fdc, 0, &geometry, cyl, head, &data)
                .map_err(|e| e.to_string())?;
            if !outcome.completed_track() {
                return Err(format!("Write C{} H{}: {:02X?}", cyl, head, outcome.result));
            }
            expected.extend_from_slice(&data);
        }
    }

    let mut offset = 0;
    for cyl in 0..geometry.cylinders {
        host.seek(&mut fdc, 0, 0, cyl).map_err(|e| e.to_string())?;
        for head in 0..geometry.sides {
            let outcome = host
                .read_logical_track(&mut fdc, 0, &geometry, cyl, head)
                .map_err(|e| e.to_string())?;
            if !outcome.completed_track() {
                return Err(format!("Read C{} H{}: {:02X?}", cyl, head, outcome.result));
            }
            let want = &expected[offset..offset + geometry.track_bytes()];
            if let Some(pos) = outcome.data.iter().zip(want).position(|(a, b)| a != b) {
                return Err(format!("Mismatch at C{} H{} byte {}", cyl, head, pos));
            }
            if outcome.data.len() != want.len() {
                return Err(format!("C{} H{}: read {} of {} bytes", cyl, head, outcome.data.len(), want.len()));
            }
            offset += want.len();
        }
    }
    Ok(offset)
}
