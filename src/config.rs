//! 設定ファイル管理モジュール
//!
//! コントローラのクロック設定とドライブ構成をJSON形式で永続化

use crate::disk::{Geometry, MemoryDisk, DEFAULT_FILL_BYTE};
use crate::drive::{DriveBay, DriveSelector, DriveUnit, MAX_DRIVES};
use crate::fdc::{Fdc8272, DEFAULT_TSTATES_PER_MILLISECOND};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 設定ファイルのデフォルトファイル名
const CONFIG_FILENAME: &str = "fdc8272_config.json";

/// 実行ファイルのディレクトリを取得
pub fn get_exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 相対パスを実行ファイルディレクトリからの絶対パスに解決
pub fn resolve_path(relative: &str) -> PathBuf {
    let path = Path::new(relative);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        get_exe_dir().join(relative)
    }
}

/// 設定ファイルのパスを取得
pub fn get_config_path() -> PathBuf {
    get_exe_dir().join(CONFIG_FILENAME)
}

/// ディスク形状（JSON上の表現）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub cylinders: u8,
    pub sides: u8,
    pub sectors: u8,
    #[serde(default = "default_size_code")]
    pub size_code: u8,
    #[serde(default = "default_first_sector")]
    pub first_sector: u8,
}

fn default_size_code() -> u8 { 2 }
fn default_first_sector() -> u8 { 1 }

impl From<GeometryConfig> for Geometry {
    fn from(g: GeometryConfig) -> Self {
        Geometry::new(g.cylinders, g.sides, g.sectors, g.size_code, g.first_sector)
    }
}

impl From<Geometry> for GeometryConfig {
    fn from(g: Geometry) -> Self {
        GeometryConfig {
            cylinders: g.cylinders,
            sides: g.sides,
            sectors: g.sectors_per_track,
            size_code: g.size_code,
            first_sector: g.first_sector,
        }
    }
}

/// 1台分のドライブ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    /// ディスクイメージのパス（未指定なら空ドライブ）
    pub image: Option<String>,
    /// イメージの形状（未指定ならサイズから推定）
    pub geometry: Option<GeometryConfig>,
    /// ヘッドの最大シリンダ
    #[serde(default = "default_max_cylinder")]
    pub max_cylinder: u8,
    /// ライトプロテクトスイッチ
    #[serde(default)]
    pub write_protected: bool,
}

fn default_max_cylinder() -> u8 { 79 }

impl Default for DriveConfig {
    fn default() -> Self {
        DriveConfig {
            image: None,
            geometry: None,
            max_cylinder: default_max_cylinder(),
            write_protected: false,
        }
    }
}

/// コントローラ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdcConfig {
    /// ミリ秒あたりのCPUクロック数
    #[serde(default = "default_tstates")]
    pub tstates_per_millisecond: u32,
    /// CPU速度倍率
    #[serde(default = "default_multiplier")]
    pub speed_multiplier: u32,
    /// 非DMAモードで起動する
    #[serde(default)]
    pub non_dma: bool,
    /// FDCログ（"flow+seek" 形式）
    #[serde(default)]
    pub fdc_log: Option<String>,
    /// ドライブ0から順に最大4台
    #[serde(default)]
    pub drives: Vec<DriveConfig>,
}

fn default_tstates() -> u32 { DEFAULT_TSTATES_PER_MILLISECOND }
fn default_multiplier() -> u32 { 1 }

impl Default for FdcConfig {
    fn default() -> Self {
        FdcConfig {
            tstates_per_millisecond: default_tstates(),
            speed_multiplier: default_multiplier(),
            non_dma: false,
            fdc_log: None,
            drives: vec![DriveConfig::default()],
        }
    }
}

impl FdcConfig {
    /// 設定ファイルを読み込む（実行ファイルと同じディレクトリから）
    pub fn load() -> Self {
        Self::load_from(get_config_path())
    }

    /// 指定したパスから設定を読み込む
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Failed to parse config {:?}: {}, using defaults", path.as_ref(), e);
                    FdcConfig::default()
                }
            },
            Err(_) => FdcConfig::default(),
        }
    }

    /// 指定したパスに設定を保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, json).map_err(|e| format!("Failed to write config: {}", e))?;
        Ok(())
    }

    /// クロック設定をコントローラに反映
    pub fn apply<S: DriveSelector>(&self, fdc: &mut Fdc8272<S>) {
        fdc.set_tstates_per_millisecond(self.tstates_per_millisecond);
        fdc.set_speed_multiplier(self.speed_multiplier);
        fdc.set_non_dma(self.non_dma);
    }

    /// ドライブベイを組み立てる（イメージも読み込む）
    pub fn build_drive_bay(&self) -> Result<DriveBay, String> {
        if self.drives.len() > MAX_DRIVES {
            return Err(format!("At most {} drives can be configured", MAX_DRIVES));
        }
        let mut bay = DriveBay::new();
        for (slot, cfg) in self.drives.iter().enumerate() {
            let mut drive = DriveUnit::new(cfg.max_cylinder);
            drive.set_write_protect(cfg.write_protected);
            if let Some(image) = &cfg.image {
                let disk = load_image(&resolve_path(image), cfg.geometry.map(Geometry::from))?;
                drive.insert(Box::new(disk));
            }
            bay.connect(slot, drive);
        }
        Ok(bay)
    }
}

/// イメージサイズから形状を推定
pub fn guess_geometry(size: usize) -> Option<Geometry> {
    [Geometry::PC_360K, Geometry::PC_720K, Geometry::PC_1440K, Geometry::CPC_DATA]
        .into_iter()
        .find(|g| g.image_size() == size)
}

/// "CxHxS" または "CxHxSxN" 形式の形状指定をパース
pub fn parse_geometry(s: &str) -> Result<Geometry, String> {
    let parts: Vec<u8> = s
        .split('x')
        .map(|p| p.trim().parse::<u8>().map_err(|e| format!("Invalid geometry '{}': {}", s, e)))
        .collect::<Result<_, _>>()?;
    let geometry = match parts.as_slice() {
        [c, h, spt] => Geometry::new(*c, *h, *spt, 2, 1),
        [c, h, spt, n] => Geometry::new(*c, *h, *spt, *n, 1),
        _ => return Err(format!("Invalid geometry '{}': expected CxHxS[xN]", s)),
    };
    geometry.validate().map_err(|e| e.to_string())?;
    Ok(geometry)
}

/// フラットイメージを読み込む（ファイルがなければフォーマット済みの空ディスク）
pub fn load_image(path: &Path, geometry: Option<Geometry>) -> Result<MemoryDisk, String> {
    if !path.exists() {
        let geometry = geometry.unwrap_or(Geometry::PC_360K);
        log::info!("{:?} not found, creating blank disk", path);
        return Ok(MemoryDisk::blank(geometry, DEFAULT_FILL_BYTE));
    }
    let data = fs::read(path).map_err(|e| format!("Failed to read {:?}: {}", path, e))?;
    let geometry = geometry
        .or_else(|| guess_geometry(data.len()))
        .ok_or_else(|| format!("Cannot infer geometry of {:?} ({} bytes)", path, data.len()))?;
    MemoryDisk::from_raw(geometry, &data).map_err(|e| format!("{:?}: {}", path, e))
}
