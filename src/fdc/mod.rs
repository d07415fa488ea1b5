//! Intel 8272A フロッピーディスクコントローラ
//!
//! Tick-driven FDC emulation: command decode, per-command execution state
//! machines spread over simulated rotations, status registers, DMA and
//! interrupt signalling.
//!
//! CPU側は命令ごとに経過クロック数を `update()` に渡す。待ち時間はすべて
//! カウントダウンで表現し、スレッドやブロッキングは使わない。

pub mod command;
pub mod status;

#[cfg(test)]
mod tests;

use crate::drive::{DriveSelector, DriveUnit, MAX_DRIVES};
use crate::fdc_log::{self, ByteRing};
use crate::sector::{size_code_to_bytes, SectorId};
use command::{CommandBytes, Opcode, MAX_RESULTS};
use status::{MainStatus, Status0, Status1, Status2, Status3, StatusRegisters};
use std::mem;

/// デフォルトのクロック（4MHz相当）
pub const DEFAULT_TSTATES_PER_MILLISECOND: u32 = 4000;

/// シークで出すステップパルスの上限（8272の固定値）
pub const MAX_STEP_PULSES: u8 = 77;

/// 1回転の時間（300RPM）
const ROTATION_MILLIS: u64 = 200;

/// 1トラックあたりの生バイト数（MFM 250kbps）
const RAW_BYTES_PER_TRACK: u64 = 6250;

/// SPECIFY前のステップレート（SRT）
const DEFAULT_STEP_RATE: u8 = 0x0C;

/// 未処理シグナルの保持上限
const MAX_PENDING_SIGNALS: usize = 64;

/// 不正コマンド時のST0
const INVALID_COMMAND_STATUS: u8 = 0x80;

/// スキャンで比較しないホスト側バイト
const SCAN_DONT_CARE: u8 = 0xFF;

/// 割り込み/DMA要求線の変化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdcSignal {
    Interrupt(bool),
    DmaRequest(bool),
}

/// 実行中のシーク
#[derive(Debug, Clone, Copy)]
struct SeekJob {
    target: u8,
    head: u8,
}

/// Sense Interrupt Status待ちのシーク結果
#[derive(Debug, Clone, Copy)]
struct SeekReport {
    st0: Status0,
    cylinder: u8,
}

/// セクタ系コマンドの進行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectorStep {
    /// インデックスホール待ち（READ TRACK）
    WaitIndex,
    /// 次のセクタを探す
    Locate,
    /// データ転送中
    Transfer { index: usize, cursor: usize, length: usize },
}

/// READ/WRITE/SCAN/READ TRACK 共通のジョブ
#[derive(Debug)]
struct SectorJob {
    opcode: Opcode,
    drive: u8,
    /// 物理ヘッド
    head: u8,
    /// 現在要求しているID
    id: SectorId,
    eot: u8,
    dtl: u8,
    multi_track: bool,
    skip: bool,
    step: SectorStep,
    /// ID検索の開始位置（SKによる読み飛ばし用）
    start_index: usize,
    /// READ TRACKの物理位置
    physical_index: usize,
    /// READ TRACKで読んだセクタ数
    sectors_done: u8,
    /// このセクタで終了（SK=0でコントロールマーク不一致）
    stop_after_sector: bool,
    crc_error: bool,
    scan_satisfied: bool,
    scan_equal: bool,
    /// Terminal Count受信済み
    cancel: bool,
    write_buf: Vec<u8>,
}

impl SectorJob {
    fn from_command(cmd: &CommandBytes) -> Self {
        SectorJob {
            opcode: cmd.opcode(),
            drive: cmd.drive(),
            head: cmd.head(),
            id: cmd.sector_id(),
            eot: cmd.end_of_track(),
            dtl: cmd.data_length(),
            multi_track: cmd.multi_track(),
            skip: cmd.skip(),
            step: SectorStep::Locate,
            start_index: 0,
            physical_index: 0,
            sectors_done: 0,
            stop_after_sector: false,
            crc_error: false,
            scan_satisfied: true,
            scan_equal: true,
            cancel: false,
            write_buf: Vec::new(),
        }
    }

    /// 1セクタで転送するバイト数（N=0のときはDTL）
    fn declared_length(&self) -> usize {
        if self.id.size_code == 0 && !self.opcode.is_scan() {
            match self.dtl {
                0 => 128,
                n => (n as usize).min(128),
            }
        } else {
            self.id.size_in_bytes()
        }
    }

    /// スキャンのセクタ間隔（STP）
    fn sector_step(&self) -> u8 {
        if self.opcode.is_scan() && self.dtl == 2 {
            2
        } else {
            1
        }
    }

    /// コントロールマークを判定するコマンドか
    fn checks_control_mark(&self) -> bool {
        matches!(self.opcode, Opcode::ReadData | Opcode::ReadDeletedData) || self.opcode.is_scan()
    }

    /// TC後の結果IDを進める
    fn advance_after_terminal_count(&mut self) {
        if self.id.sector >= self.eot {
            if self.multi_track {
                if self.head == 1 {
                    self.id.cylinder = self.id.cylinder.wrapping_add(1);
                }
                self.id.head ^= 1;
            } else {
                self.id.cylinder = self.id.cylinder.wrapping_add(1);
            }
            self.id.sector = 1;
        } else {
            self.id.sector = self.id.sector.wrapping_add(1);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatStep {
    WaitIndex,
    Collect,
}

/// FORMAT TRACK
#[derive(Debug)]
struct FormatJob {
    drive: u8,
    head: u8,
    size_code: u8,
    count: u8,
    fill: u8,
    step: FormatStep,
    ids: Vec<SectorId>,
    pending: [u8; 4],
    pending_len: usize,
}

/// READ ID（開始時点の回転角でサンプリング済み）
#[derive(Debug)]
struct ReadIdJob {
    drive: u8,
    head: u8,
    found: Option<SectorId>,
}

#[derive(Debug)]
enum Job {
    Sector(SectorJob),
    Format(FormatJob),
    ReadId(ReadIdJob),
}

impl Job {
    fn target(&self) -> (u8, u8, SectorId) {
        match self {
            Job::Sector(j) => (j.drive, j.head, j.id),
            Job::Format(f) => (f.drive, f.head, SectorId::new(0, f.head, 0, f.size_code)),
            Job::ReadId(r) => (r.drive, r.head, r.found.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Idle,
    Command,
    Execution(Job),
    Result,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Command => "COMMAND",
            Phase::Execution(_) => "EXECUTION",
            Phase::Result => "RESULT",
        }
    }
}

/// セクタ検索の結果
enum Lookup {
    NotReady,
    NoHeaders,
    NotFound(Status2),
    Found { index: usize, len: usize, id: SectorId, deleted: bool, crc: bool, bogus: bool },
}

/// 8272A コントローラ本体
pub struct Fdc8272<S: DriveSelector> {
    drives: S,
    phase: Phase,
    command: CommandBytes,
    opcode: Opcode,
    results: [u8; MAX_RESULTS],
    result_len: usize,
    result_pos: usize,
    st0: Status0,
    st1: Status1,
    st2: Status2,
    st3: Status3,
    /// ドライブごとのシークビジー（SISでクリア）
    seek_busy: MainStatus,
    seeks: [Option<SeekJob>; MAX_DRIVES],
    seek_reports: [Option<SeekReport>; MAX_DRIVES],
    data_reg: u8,
    /// ホストとのバイト受け渡し待ち
    byte_pending: bool,
    byte_to_host: bool,
    non_dma: bool,
    irq: bool,
    drq: bool,
    signals: Vec<FdcSignal>,
    tstates_per_ms: u32,
    speed_multiplier: u32,
    step_rate: u8,
    rotation_ticks: u64,
    index_ticks: u64,
    byte_ticks: u64,
    search_ticks: u64,
    step_ticks: u64,
    /// 回転カウンタ（0..rotation_ticks）
    rotation: u64,
    step_counter: u64,
    /// 次のI/O処理までの残りtick（0 = 未設定）
    io_due: u64,
    /// オーバーランまでの残りtick（0 = 未設定）
    overrun_due: u64,
    ring: ByteRing,
}

impl<S: DriveSelector> Fdc8272<S> {
    pub fn new(drives: S) -> Self {
        let mut fdc = Fdc8272 {
            drives,
            phase: Phase::Idle,
            command: CommandBytes::default(),
            opcode: Opcode::Invalid,
            results: [0; MAX_RESULTS],
            result_len: 0,
            result_pos: 0,
            st0: Status0::empty(),
            st1: Status1::empty(),
            st2: Status2::empty(),
            st3: Status3::empty(),
            seek_busy: MainStatus::empty(),
            seeks: [None; MAX_DRIVES],
            seek_reports: [None; MAX_DRIVES],
            data_reg: 0,
            byte_pending: false,
            byte_to_host: false,
            non_dma: false,
            irq: false,
            drq: false,
            signals: Vec::new(),
            tstates_per_ms: DEFAULT_TSTATES_PER_MILLISECOND,
            speed_multiplier: 1,
            step_rate: DEFAULT_STEP_RATE,
            rotation_ticks: 0,
            index_ticks: 0,
            byte_ticks: 0,
            search_ticks: 0,
            step_ticks: 0,
            rotation: 0,
            step_counter: 0,
            io_due: 0,
            overrun_due: 0,
            ring: ByteRing::default(),
        };
        fdc.recompute_timing();
        fdc
    }

    pub fn drives(&self) -> &S {
        &self.drives
    }

    /// ドライブへのアクセス（ディスク交換はコマンド実行中以外に行うこと）
    pub fn drives_mut(&mut self) -> &mut S {
        &mut self.drives
    }

    /// リセット（タイミング設定とDMAモードは維持）
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.command.clear();
        self.opcode = Opcode::Invalid;
        self.result_len = 0;
        self.result_pos = 0;
        self.st0 = Status0::empty();
        self.st1 = Status1::empty();
        self.st2 = Status2::empty();
        self.st3 = Status3::empty();
        self.seek_busy = MainStatus::empty();
        self.seeks = [None; MAX_DRIVES];
        self.seek_reports = [None; MAX_DRIVES];
        self.byte_pending = false;
        self.io_due = 0;
        self.overrun_due = 0;
        self.step_counter = 0;
        self.ring.clear();
        self.set_interrupt(false);
        self.set_dma(false);
        for unit in 0..MAX_DRIVES as u8 {
            if let Some(drive) = self.drives.drive_for_select_code(unit) {
                drive.cancel_seek();
            }
        }
        log::debug!("FDC reset");
    }

    // ============================================================
    // タイミング設定
    // ============================================================

    /// ミリ秒あたりのクロック数を設定
    pub fn set_tstates_per_millisecond(&mut self, tstates: u32) {
        self.tstates_per_ms = tstates.max(1);
        self.recompute_timing();
    }

    /// CPU速度倍率を設定
    pub fn set_speed_multiplier(&mut self, multiplier: u32) {
        self.speed_multiplier = multiplier.max(1);
        self.recompute_timing();
    }

    /// 非DMAモードを直接設定（SPECIFYのNDビットと同じ）
    pub fn set_non_dma(&mut self, non_dma: bool) {
        self.non_dma = non_dma;
    }

    pub fn is_non_dma(&self) -> bool {
        self.non_dma
    }

    fn recompute_timing(&mut self) {
        let per_ms = (self.tstates_per_ms as u64).saturating_mul(self.speed_multiplier as u64).max(1);
        self.rotation_ticks = per_ms.saturating_mul(ROTATION_MILLIS).max(100);
        self.index_ticks = (self.rotation_ticks / 100).max(1);
        self.byte_ticks = (self.rotation_ticks / RAW_BYTES_PER_TRACK).max(1);
        self.search_ticks = (self.rotation_ticks / 16).max(1);
        self.step_ticks = per_ms.saturating_mul((16 - self.step_rate.min(15)) as u64).max(1);
        self.rotation %= self.rotation_ticks;
    }

    pub fn rotation_ticks(&self) -> u64 {
        self.rotation_ticks
    }

    pub fn byte_ticks(&self) -> u64 {
        self.byte_ticks
    }

    pub fn step_ticks(&self) -> u64 {
        self.step_ticks
    }

    pub fn rotation_position(&self) -> u64 {
        self.rotation
    }

    /// インデックスホールのパルス中か（回転の先頭1%）
    pub fn index_hole(&self) -> bool {
        self.rotation < self.index_ticks
    }

    // ============================================================
    // ホスト側インターフェース
    // ============================================================

    /// メインステータスレジスタ（副作用なし）
    pub fn main_status(&self) -> MainStatus {
        let mut msr = self.seek_busy;
        match self.phase {
            Phase::Idle => msr |= MainStatus::RQM,
            Phase::Command => msr |= MainStatus::RQM | MainStatus::CB,
            Phase::Execution(_) => {
                msr |= MainStatus::CB;
                if self.non_dma {
                    msr |= MainStatus::EXM;
                    if self.byte_pending {
                        msr |= MainStatus::RQM;
                        if self.byte_to_host {
                            msr |= MainStatus::DIO;
                        }
                    }
                }
            }
            Phase::Result => msr |= MainStatus::RQM | MainStatus::DIO | MainStatus::CB,
        }
        msr
    }

    /// MSR読み出し（割り込み要求ラッチをクリア）
    pub fn read_main_status(&mut self) -> u8 {
        let msr = self.main_status();
        self.set_interrupt(false);
        msr.bits()
    }

    /// データレジスタ読み出し
    pub fn read_data(&mut self) -> u8 {
        match self.phase {
            Phase::Result => {
                let value = self.results[self.result_pos];
                self.result_pos += 1;
                self.set_interrupt(false);
                if self.result_pos >= self.result_len {
                    self.transition(Phase::Idle);
                }
                value
            }
            Phase::Execution(_) if self.byte_pending && self.byte_to_host => {
                let value = self.data_reg;
                self.byte_accepted();
                self.ring.push(value);
                fdc_log::log_byte(true, value);
                value
            }
            _ => self.data_reg,
        }
    }

    /// データレジスタ書き込み
    pub fn write_data(&mut self, value: u8) {
        match self.phase {
            Phase::Idle | Phase::Command => self.write_command_byte(value),
            Phase::Execution(_) if self.byte_pending && !self.byte_to_host => {
                self.data_reg = value;
                self.byte_accepted();
                self.ring.push(value);
                fdc_log::log_byte(false, value);
                self.with_job(|fdc, job| fdc.accept_host_byte(job, value));
            }
            _ => log::trace!("FDC: data write {:02X} ignored in {}", value, self.phase.name()),
        }
    }

    /// DACK: DMA要求を下げる
    pub fn dma_acknowledge(&mut self) {
        self.set_dma(false);
    }

    /// DMAサイクルでの読み出し
    pub fn read_dma(&mut self) -> u8 {
        self.dma_acknowledge();
        self.read_data()
    }

    /// DMAサイクルでの書き込み
    pub fn write_dma(&mut self, value: u8) {
        self.dma_acknowledge();
        self.write_data(value);
    }

    /// Terminal Count 入力
    pub fn terminal_count(&mut self) {
        if matches!(self.phase, Phase::Execution(_)) {
            self.with_job(|fdc, job| fdc.cancel_job(job));
        }
    }

    pub fn interrupt_request(&self) -> bool {
        self.irq
    }

    pub fn dma_request(&self) -> bool {
        self.drq
    }

    /// 割り込み/DMA線の変化を取り出す
    pub fn take_signals(&mut self) -> Vec<FdcSignal> {
        mem::take(&mut self.signals)
    }

    /// コマンド実行中またはシーク中か
    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Idle) || !self.seek_busy.is_empty()
    }

    pub fn status_registers(&self) -> StatusRegisters {
        StatusRegisters {
            main: self.main_status(),
            st0: self.st0,
            st1: self.st1,
            st2: self.st2,
            st3: self.st3,
        }
    }

    // ============================================================
    // クロック処理
    // ============================================================

    /// 経過tickを進める
    pub fn update(&mut self, ticks: u64) {
        if ticks == 0 {
            return;
        }

        // 回転カウンタ（一周したらインデックスホール）
        let total = self.rotation.saturating_add(ticks);
        self.rotation = total % self.rotation_ticks;
        if total >= self.rotation_ticks {
            self.on_index_hole();
        }

        // ステップパルス
        if self.seeks.iter().any(Option::is_some) {
            self.step_counter = self.step_counter.saturating_add(ticks);
            while self.step_counter >= self.step_ticks && self.seeks.iter().any(Option::is_some) {
                self.step_counter -= self.step_ticks;
                self.step_pulse();
            }
        } else {
            self.step_counter = 0;
        }

        // I/O
        if self.io_due > 0 {
            if ticks >= self.io_due {
                self.io_due = 0;
                self.with_job(|fdc, job| fdc.advance_job(job));
            } else {
                self.io_due -= ticks;
            }
        }

        // オーバーラン
        if self.overrun_due > 0 {
            if ticks >= self.overrun_due {
                self.overrun_due = 0;
                self.on_overrun();
            } else {
                self.overrun_due -= ticks;
            }
        }
    }

    // ============================================================
    // 内部: シグナルとフェーズ
    // ============================================================

    fn set_interrupt(&mut self, on: bool) {
        if self.irq != on {
            self.irq = on;
            self.push_signal(FdcSignal::Interrupt(on));
        }
    }

    fn set_dma(&mut self, on: bool) {
        if self.drq != on {
            self.drq = on;
            self.push_signal(FdcSignal::DmaRequest(on));
        }
    }

    fn push_signal(&mut self, signal: FdcSignal) {
        if self.signals.len() >= MAX_PENDING_SIGNALS {
            self.signals.remove(0);
        }
        self.signals.push(signal);
    }

    fn transition(&mut self, next: Phase) {
        if self.phase.name() != next.name() {
            fdc_log::log_phase(self.phase.name(), next.name());
        }
        self.phase = next;
    }

    /// 実行中ジョブを取り出して処理し、次のフェーズを設定
    fn with_job(&mut self, f: impl FnOnce(&mut Self, Job) -> Phase) {
        if !matches!(self.phase, Phase::Execution(_)) {
            return;
        }
        if let Phase::Execution(job) = mem::take(&mut self.phase) {
            let next = f(self, job);
            if next.name() != "EXECUTION" {
                fdc_log::log_phase("EXECUTION", next.name());
            }
            self.phase = next;
        }
    }

    /// ホストにバイト転送を要求
    fn request_byte(&mut self, to_host: bool) {
        self.byte_pending = true;
        self.byte_to_host = to_host;
        self.overrun_due = self.rotation_ticks;
        if self.non_dma {
            self.set_interrupt(true);
        } else {
            self.set_dma(true);
        }
    }

    /// ホストがバイトを処理した
    fn byte_accepted(&mut self) {
        self.byte_pending = false;
        self.overrun_due = 0;
        if self.non_dma {
            self.set_interrupt(false);
        } else {
            self.set_dma(false);
        }
        self.io_due = self.byte_ticks;
    }

    fn load_results(&mut self, bytes: &[u8]) -> Phase {
        let len = bytes.len().min(MAX_RESULTS);
        self.results[..len].copy_from_slice(&bytes[..len]);
        self.result_len = len;
        self.result_pos = 0;
        fdc_log::log_result(self.opcode, &bytes[..len]);
        if len == 0 {
            Phase::Idle
        } else {
            Phase::Result
        }
    }

    /// 実行系コマンドを終了して結果フェーズへ
    fn finish(&mut self, drive: u8, head: u8, id: SectorId) -> Phase {
        self.st0 |= Status0::unit(drive, head);
        if !self.st0.is_normal_termination() {
            fdc_log::log_abnormal(self.opcode, id, self.st0, self.st1, self.st2);
            self.ring.dump(16);
        }
        self.io_due = 0;
        self.overrun_due = 0;
        self.byte_pending = false;
        self.set_dma(false);
        let [c, h, r, n] = id.to_bytes();
        let bytes = [self.st0.bits(), self.st1.bits(), self.st2.bits(), c, h, r, n];
        let next = self.load_results(&bytes);
        self.set_interrupt(true);
        next
    }

    fn abort(&mut self, drive: u8, head: u8, id: SectorId) -> Phase {
        self.st0 |= Status0::IC_ABNORMAL;
        self.finish(drive, head, id)
    }

    /// (レディ, ライトプロテクト)
    fn drive_state(&mut self, unit: u8) -> (bool, bool) {
        self.drives
            .drive_for_select_code(unit)
            .map_or((false, false), |d| (d.is_ready(), d.is_write_protected()))
    }

    // ============================================================
    // コマンドフェーズ
    // ============================================================

    fn write_command_byte(&mut self, value: u8) {
        if matches!(self.phase, Phase::Idle) {
            self.command.clear();
            self.opcode = Opcode::decode(value);
            self.st0 = Status0::empty();
            self.st1 = Status1::empty();
            self.st2 = Status2::empty();
            self.ring.clear();
            self.transition(Phase::Command);
        }
        self.command.push(value);
        if self.command.len() >= self.opcode.command_length() {
            self.start_command();
        }
    }

    fn start_command(&mut self) {
        let opcode = self.opcode;
        fdc_log::log_command(opcode, self.command.as_slice());
        let next = match opcode {
            Opcode::Invalid => self.load_results(&[INVALID_COMMAND_STATUS]),
            Opcode::SenseInterruptStatus => self.sense_interrupt_status(),
            Opcode::Specify => {
                self.step_rate = self.command.step_rate();
                self.non_dma = self.command.non_dma();
                self.recompute_timing();
                log::debug!(
                    "FDC: SRT={:X} HUT={:X} HLT={:02X} ND={}",
                    self.step_rate,
                    self.command.head_unload_time(),
                    self.command.head_load_time(),
                    self.non_dma
                );
                Phase::Idle
            }
            Opcode::SenseDriveStatus => self.sense_drive_status(),
            Opcode::Seek => {
                self.start_seek(self.command.drive(), self.command.head(), self.command.new_cylinder());
                Phase::Idle
            }
            Opcode::Recalibrate => {
                self.start_seek(self.command.drive(), 0, 0);
                Phase::Idle
            }
            Opcode::ReadId => self.start_read_id(),
            Opcode::FormatTrack => self.start_format(),
            _ => self.start_sector_job(),
        };
        self.transition(next);
    }

    // ============================================================
    // 即時コマンド
    // ============================================================

    fn sense_interrupt_status(&mut self) -> Phase {
        self.set_interrupt(false);
        let report = (0..MAX_DRIVES).find_map(|unit| self.seek_reports[unit].take().map(|r| (unit, r)));
        match report {
            Some((unit, report)) => {
                self.seek_busy.remove(MainStatus::drive_busy(unit as u8));
                self.st0 = report.st0;
                if self.seek_reports.iter().any(Option::is_some) {
                    self.set_interrupt(true);
                }
                self.load_results(&[report.st0.bits(), report.cylinder])
            }
            None => self.load_results(&[INVALID_COMMAND_STATUS]),
        }
    }

    fn sense_drive_status(&mut self) -> Phase {
        let (unit, head) = (self.command.drive(), self.command.head());
        let mut st3 = Status3::unit(unit, head);
        if let Some(drive) = self.drives.drive_for_select_code(unit) {
            st3.set(Status3::RY, drive.is_ready());
            st3.set(Status3::WP, drive.is_write_protected());
            st3.set(Status3::T0, drive.is_track0());
            st3.set(Status3::TS, drive.is_two_sided());
        }
        self.st3 = st3;
        self.load_results(&[st3.bits()])
    }

    // ============================================================
    // SEEK / RECALIBRATE
    // ============================================================

    fn start_seek(&mut self, unit: u8, head: u8, target: u8) {
        self.seek_busy |= MainStatus::drive_busy(unit);
        self.seek_reports[unit as usize] = None;
        let immediate = match self.drives.drive_for_select_code(unit) {
            Some(drive) if drive.is_ready() => {
                if drive.cylinder() == target {
                    Some((Status0::SE, target))
                } else {
                    drive.start_seek(MAX_STEP_PULSES);
                    None
                }
            }
            Some(drive) => Some((Status0::SE | Status0::IC_ABNORMAL | Status0::NR, drive.cylinder())),
            None => Some((Status0::SE | Status0::IC_ABNORMAL | Status0::NR, 0)),
        };
        match immediate {
            Some((flags, cylinder)) => {
                self.seeks[unit as usize] = None;
                self.complete_seek(unit, head, flags, cylinder);
            }
            None => {
                if self.seeks.iter().all(Option::is_none) {
                    self.step_counter = 0;
                }
                self.seeks[unit as usize] = Some(SeekJob { target, head });
            }
        }
    }

    /// 全ドライブに1ステップ
    fn step_pulse(&mut self) {
        for unit in 0..MAX_DRIVES as u8 {
            let Some(job) = self.seeks[unit as usize] else {
                continue;
            };
            let outcome = match self.drives.drive_for_select_code(unit) {
                Some(drive) if drive.is_ready() => {
                    drive.step_toward(job.target);
                    fdc_log::log_step(unit, drive.cylinder(), drive.pending_steps());
                    if drive.cylinder() == job.target {
                        Some((Status0::SE, drive.cylinder()))
                    } else if drive.pending_steps() == 0 {
                        Some((Status0::SE | Status0::IC_ABNORMAL | Status0::EC, drive.cylinder()))
                    } else {
                        None
                    }
                }
                Some(drive) => {
                    drive.cancel_seek();
                    Some((Status0::SE | Status0::IC_ABNORMAL | Status0::NR, drive.cylinder()))
                }
                None => Some((Status0::SE | Status0::IC_ABNORMAL | Status0::NR, 0)),
            };
            if let Some((flags, cylinder)) = outcome {
                self.seeks[unit as usize] = None;
                self.complete_seek(unit, job.head, flags, cylinder);
            }
        }
    }

    fn complete_seek(&mut self, unit: u8, head: u8, flags: Status0, cylinder: u8) {
        let st0 = Status0::unit(unit, head) | flags;
        fdc_log::log_seek_end(unit, cylinder, st0);
        self.seek_reports[unit as usize] = Some(SeekReport { st0, cylinder });
        self.set_interrupt(true);
    }

    // ============================================================
    // 実行フェーズ: 共通
    // ============================================================

    fn on_index_hole(&mut self) {
        self.with_job(|fdc, job| match job {
            Job::Sector(mut j) if j.step == SectorStep::WaitIndex => {
                j.step = SectorStep::Locate;
                j.physical_index = 0;
                fdc.io_due = fdc.byte_ticks;
                Phase::Execution(Job::Sector(j))
            }
            Job::Format(mut f) if f.step == FormatStep::WaitIndex => {
                f.step = FormatStep::Collect;
                if f.count == 0 {
                    fdc.commit_format(f)
                } else {
                    fdc.io_due = fdc.byte_ticks;
                    Phase::Execution(Job::Format(f))
                }
            }
            other => Phase::Execution(other),
        });
    }

    fn advance_job(&mut self, job: Job) -> Phase {
        match job {
            Job::Sector(j) => match j.step {
                SectorStep::WaitIndex => Phase::Execution(Job::Sector(j)),
                SectorStep::Locate => self.locate_sector(j),
                SectorStep::Transfer { .. } => self.transfer_step(j),
            },
            Job::Format(f) => {
                if f.step == FormatStep::Collect {
                    self.request_byte(false);
                }
                Phase::Execution(Job::Format(f))
            }
            Job::ReadId(r) => self.finish_read_id(r),
        }
    }

    fn accept_host_byte(&mut self, job: Job, value: u8) -> Phase {
        match job {
            Job::Sector(mut j) => {
                if let SectorStep::Transfer { index, cursor, length } = j.step {
                    if j.opcode.is_scan() {
                        let disk_byte = self
                            .drives
                            .drive_for_select_code(j.drive)
                            .and_then(|d| d.sector_by_index(j.head, index))
                            .and_then(|rec| rec.reader_at(cursor).read());
                        if let Some(disk_byte) = disk_byte {
                            scan_compare(&mut j, disk_byte, value);
                        }
                    } else {
                        j.write_buf.push(value);
                    }
                    j.step = SectorStep::Transfer { index, cursor: cursor + 1, length };
                }
                Phase::Execution(Job::Sector(j))
            }
            Job::Format(f) => self.collect_format_byte(f, value),
            other => Phase::Execution(other),
        }
    }

    fn cancel_job(&mut self, job: Job) -> Phase {
        match job {
            Job::Sector(mut j) => match j.step {
                SectorStep::Transfer { .. } => {
                    // セクタ途中では終端まで処理してから止める
                    fdc_log::log_terminal_count(true);
                    j.cancel = true;
                    if self.byte_pending {
                        self.byte_accepted();
                    } else if self.io_due == 0 {
                        self.io_due = self.byte_ticks;
                    }
                    Phase::Execution(Job::Sector(j))
                }
                _ => {
                    fdc_log::log_terminal_count(false);
                    self.finish(j.drive, j.head, j.id)
                }
            },
            Job::Format(f) => {
                fdc_log::log_terminal_count(false);
                if f.step == FormatStep::Collect {
                    self.commit_format(f)
                } else {
                    self.finish(f.drive, f.head, SectorId::new(0, f.head, 0, f.size_code))
                }
            }
            Job::ReadId(r) => Phase::Execution(Job::ReadId(r)),
        }
    }

    fn on_overrun(&mut self) {
        self.with_job(|fdc, job| {
            if !fdc.byte_pending {
                return Phase::Execution(job);
            }
            fdc.st1 |= Status1::OR;
            let (drive, head, id) = job.target();
            fdc.abort(drive, head, id)
        });
    }

    // ============================================================
    // READ / WRITE / SCAN
    // ============================================================

    fn start_sector_job(&mut self) -> Phase {
        let mut job = SectorJob::from_command(&self.command);
        let (ready, protected) = self.drive_state(job.drive);
        if !ready {
            self.st0 |= Status0::NR;
            return self.abort(job.drive, job.head, job.id);
        }
        if job.opcode.is_write() && protected {
            self.st1 |= Status1::NW;
            return self.abort(job.drive, job.head, job.id);
        }
        if job.opcode == Opcode::ReadTrack {
            job.step = SectorStep::WaitIndex;
        } else {
            job.step = SectorStep::Locate;
            self.io_due = self.search_ticks;
        }
        Phase::Execution(Job::Sector(job))
    }

    fn locate_sector(&mut self, mut job: SectorJob) -> Phase {
        if job.opcode == Opcode::ReadTrack {
            return self.locate_track_sector(job);
        }

        let lookup = match self.drives.drive_for_select_code(job.drive) {
            Some(drive) if drive.is_ready() => match drive.sector_by_id(job.head, job.start_index, &job.id) {
                Some((index, rec)) => Lookup::Found {
                    index,
                    len: rec.len(),
                    id: rec.id(),
                    deleted: rec.is_deleted(),
                    crc: rec.has_crc_error(),
                    bogus: rec.has_bogus_id(),
                },
                None if drive.sector_count(job.head) == 0 => Lookup::NoHeaders,
                None => Lookup::NotFound(cylinder_mismatch(drive, job.head, &job.id)),
            },
            _ => Lookup::NotReady,
        };

        match lookup {
            Lookup::NotReady => {
                self.st0 |= Status0::NR;
                self.abort(job.drive, job.head, job.id)
            }
            Lookup::NoHeaders => {
                self.st1 |= Status1::MA;
                self.abort(job.drive, job.head, job.id)
            }
            Lookup::NotFound(st2) => {
                if job.start_index > 0 {
                    // 読み飛ばした後に同じIDが見つからなければ次のセクタへ
                    return self.next_sector(job);
                }
                self.st1 |= Status1::ND;
                self.st2 |= st2;
                self.abort(job.drive, job.head, job.id)
            }
            Lookup::Found { index, len, id, deleted, crc, bogus } => {
                fdc_log::log_sector_found(id, index, bogus);
                if len == 0 {
                    self.st1 |= Status1::MA;
                    self.st2 |= Status2::MD;
                    return self.abort(job.drive, job.head, job.id);
                }
                if job.checks_control_mark() {
                    let wants_deleted = job.opcode == Opcode::ReadDeletedData;
                    if deleted != wants_deleted {
                        if job.skip {
                            job.start_index = index + 1;
                            self.io_due = self.search_ticks;
                            return Phase::Execution(Job::Sector(job));
                        }
                        self.st2 |= Status2::CM;
                        job.stop_after_sector = true;
                    }
                    job.crc_error = crc;
                }

                let length = if job.opcode.is_write() {
                    job.declared_length()
                } else {
                    job.declared_length().min(len)
                };
                job.start_index = 0;
                job.scan_satisfied = true;
                job.scan_equal = true;
                job.write_buf.clear();
                job.step = SectorStep::Transfer { index, cursor: 0, length };
                if matches!(job.opcode, Opcode::ReadData | Opcode::ReadDeletedData) {
                    self.io_due = self.byte_ticks;
                } else {
                    self.request_byte(false);
                }
                Phase::Execution(Job::Sector(job))
            }
        }
    }

    /// I/O期限: 次のバイトを出す、またはセクタを締める
    fn transfer_step(&mut self, mut job: SectorJob) -> Phase {
        let SectorStep::Transfer { index, cursor, length } = job.step else {
            return Phase::Execution(Job::Sector(job));
        };
        if job.cancel || cursor >= length {
            return self.sector_complete(job);
        }
        match job.opcode {
            Opcode::ReadData | Opcode::ReadDeletedData | Opcode::ReadTrack => {
                let byte = self
                    .drives
                    .drive_for_select_code(job.drive)
                    .and_then(|d| d.sector_by_index(job.head, index))
                    .and_then(|rec| rec.reader_at(cursor).read());
                match byte {
                    Some(value) => {
                        self.data_reg = value;
                        job.step = SectorStep::Transfer { index, cursor: cursor + 1, length };
                        self.request_byte(true);
                    }
                    None => return self.sector_complete(job),
                }
            }
            _ => self.request_byte(false),
        }
        Phase::Execution(Job::Sector(job))
    }

    fn sector_complete(&mut self, mut job: SectorJob) -> Phase {
        let SectorStep::Transfer { index, length, .. } = job.step else {
            return Phase::Execution(Job::Sector(job));
        };

        match job.opcode {
            Opcode::ReadTrack => return self.track_sector_complete(job),
            Opcode::WriteData | Opcode::WriteDeletedData => {
                let mut data = mem::take(&mut job.write_buf);
                data.resize(length, 0);
                let deleted = job.opcode == Opcode::WriteDeletedData;
                let (ok, protected) = match self.drives.drive_for_select_code(job.drive) {
                    Some(drive) => (drive.write_sector(job.head, index, &data, deleted), drive.is_write_protected()),
                    None => (false, false),
                };
                if !ok {
                    if protected {
                        self.st1 |= Status1::NW;
                    } else {
                        self.st1 |= Status1::DE;
                    }
                    return self.abort(job.drive, job.head, job.id);
                }
            }
            op if op.is_scan() => {
                if job.scan_satisfied {
                    if job.scan_equal {
                        self.st2 |= Status2::SH;
                    }
                    return self.finish(job.drive, job.head, job.id);
                }
                if job.cancel {
                    self.st2 |= Status2::SN;
                }
            }
            _ => {
                if job.crc_error {
                    self.st1 |= Status1::DE;
                    self.st2 |= Status2::DD;
                    return self.abort(job.drive, job.head, job.id);
                }
            }
        }

        if job.cancel || job.stop_after_sector {
            job.advance_after_terminal_count();
            return self.finish(job.drive, job.head, job.id);
        }
        self.next_sector(job)
    }

    /// 次の論理セクタへ（EOTでヘッド切り替えまたはシリンダ終端）
    fn next_sector(&mut self, mut job: SectorJob) -> Phase {
        // R=0xFF は有効なセクタ番号なので桁あふれを起こさない幅で比較する
        let next = job.id.sector as u16 + job.sector_step() as u16;
        if next > job.eot as u16 {
            if job.multi_track && job.head == 0 {
                job.head = 1;
                job.id.head ^= 1;
                job.id.sector = 1;
            } else {
                job.id.cylinder = job.id.cylinder.wrapping_add(1);
                job.id.sector = 1;
                if job.multi_track {
                    job.id.head ^= 1;
                }
                self.st1 |= Status1::EN;
                if job.opcode.is_scan() {
                    self.st2 |= Status2::SN;
                }
                return self.abort(job.drive, job.head, job.id);
            }
        } else {
            job.id.sector = next as u8;
        }
        job.step = SectorStep::Locate;
        job.start_index = 0;
        self.io_due = self.search_ticks;
        Phase::Execution(Job::Sector(job))
    }

    // ============================================================
    // READ TRACK
    // ============================================================

    fn locate_track_sector(&mut self, mut job: SectorJob) -> Phase {
        let lookup = match self.drives.drive_for_select_code(job.drive) {
            Some(drive) if drive.is_ready() => match drive.sector_by_index(job.head, job.physical_index) {
                Some(rec) => Lookup::Found {
                    index: job.physical_index,
                    len: rec.len(),
                    id: rec.id(),
                    deleted: rec.is_deleted(),
                    crc: rec.has_crc_error(),
                    bogus: rec.has_bogus_id(),
                },
                None => Lookup::NoHeaders,
            },
            _ => Lookup::NotReady,
        };

        match lookup {
            Lookup::Found { index, len, id, crc, bogus, .. } => {
                fdc_log::log_sector_found(id, index, bogus);
                // セクタ番号は照合しない（物理順と論理順は一致しない）
                if id.cylinder != job.id.cylinder || id.head != job.id.head || id.size_code != job.id.size_code {
                    self.st1 |= Status1::ND;
                }
                if len == 0 {
                    self.st2 |= Status2::MD;
                    job.physical_index += 1;
                    self.io_due = self.search_ticks;
                    return Phase::Execution(Job::Sector(job));
                }
                if crc {
                    self.st1 |= Status1::DE;
                    self.st2 |= Status2::DD;
                    self.st0 |= Status0::IC_ABNORMAL;
                }
                let length = job.declared_length().min(len);
                job.step = SectorStep::Transfer { index, cursor: 0, length };
                self.io_due = self.byte_ticks;
                Phase::Execution(Job::Sector(job))
            }
            Lookup::NoHeaders if job.physical_index == 0 => {
                self.st1 |= Status1::MA;
                self.abort(job.drive, job.head, job.id)
            }
            Lookup::NoHeaders | Lookup::NotFound(_) => {
                // EOTに届く前にトラックが尽きた
                self.st1 |= Status1::EN;
                self.abort(job.drive, job.head, job.id)
            }
            Lookup::NotReady => {
                self.st0 |= Status0::NR;
                self.abort(job.drive, job.head, job.id)
            }
        }
    }

    fn track_sector_complete(&mut self, mut job: SectorJob) -> Phase {
        job.sectors_done = job.sectors_done.saturating_add(1);
        job.physical_index += 1;
        job.id.sector = job.id.sector.wrapping_add(1);
        if job.cancel {
            return self.finish(job.drive, job.head, job.id);
        }
        if job.sectors_done >= job.eot {
            self.st1 |= Status1::EN;
            return self.abort(job.drive, job.head, job.id);
        }
        job.step = SectorStep::Locate;
        self.io_due = self.search_ticks;
        Phase::Execution(Job::Sector(job))
    }

    // ============================================================
    // FORMAT TRACK
    // ============================================================

    fn start_format(&mut self) -> Phase {
        let cmd = self.command;
        let job = FormatJob {
            drive: cmd.drive(),
            head: cmd.head(),
            size_code: cmd.format_size_code(),
            count: cmd.format_sector_count(),
            fill: cmd.format_fill(),
            step: FormatStep::WaitIndex,
            ids: Vec::with_capacity(cmd.format_sector_count() as usize),
            pending: [0; 4],
            pending_len: 0,
        };
        let (ready, protected) = self.drive_state(job.drive);
        let id = SectorId::new(0, job.head, 0, job.size_code);
        if !ready {
            self.st0 |= Status0::NR;
            return self.abort(job.drive, job.head, id);
        }
        if protected {
            self.st1 |= Status1::NW;
            return self.abort(job.drive, job.head, id);
        }
        Phase::Execution(Job::Format(job))
    }

    fn collect_format_byte(&mut self, mut job: FormatJob, value: u8) -> Phase {
        if job.step != FormatStep::Collect {
            return Phase::Execution(Job::Format(job));
        }
        job.pending[job.pending_len] = value;
        job.pending_len += 1;
        if job.pending_len == job.pending.len() {
            let [c, h, r, n] = job.pending;
            job.ids.push(SectorId::new(c, h, r, n));
            job.pending_len = 0;
        }
        if job.ids.len() >= job.count as usize {
            return self.commit_format(job);
        }
        Phase::Execution(Job::Format(job))
    }

    fn commit_format(&mut self, job: FormatJob) -> Phase {
        let fill = vec![job.fill; size_code_to_bytes(job.size_code)];
        let outcome = match self.drives.drive_for_select_code(job.drive) {
            Some(drive) if drive.is_ready() => {
                Some((drive.format_track(job.head, &job.ids, &fill), drive.is_write_protected(), drive.cylinder()))
            }
            _ => None,
        };
        let last = job.ids.last().copied();
        let id = SectorId { size_code: job.size_code, ..last.unwrap_or(SectorId::new(0, job.head, 0, 0)) };
        match outcome {
            None => {
                self.st0 |= Status0::NR;
                self.abort(job.drive, job.head, id)
            }
            Some((false, protected, _)) => {
                if protected {
                    self.st1 |= Status1::NW;
                } else {
                    self.st1 |= Status1::DE;
                }
                self.abort(job.drive, job.head, id)
            }
            Some((true, _, cylinder)) => {
                log::debug!("FDC: formatted C={} H={} with {} sector(s)", cylinder, job.head, job.ids.len());
                self.finish(job.drive, job.head, id)
            }
        }
    }

    // ============================================================
    // READ ID
    // ============================================================

    fn start_read_id(&mut self) -> Phase {
        let (unit, head) = (self.command.drive(), self.command.head());
        let (rotation, rotation_ticks) = (self.rotation, self.rotation_ticks);
        let sampled = match self.drives.drive_for_select_code(unit) {
            Some(drive) if drive.is_ready() => Some(sample_sector_id(drive, head, rotation, rotation_ticks)),
            _ => None,
        };
        match sampled {
            None => {
                self.st0 |= Status0::NR;
                self.abort(unit, head, SectorId::default())
            }
            Some(found) => {
                self.io_due = self.search_ticks;
                Phase::Execution(Job::ReadId(ReadIdJob { drive: unit, head, found }))
            }
        }
    }

    fn finish_read_id(&mut self, job: ReadIdJob) -> Phase {
        match job.found {
            Some(id) => self.finish(job.drive, job.head, id),
            None => {
                self.st1 |= Status1::MA;
                self.abort(job.drive, job.head, SectorId::default())
            }
        }
    }
}

/// 回転角に対応するセクタのIDを読む
///
/// 比率を四捨五入するためインデックスホール直前ではセクタ数と同じ値になり、
/// その場合は先頭セクタを読み直す。
fn sample_sector_id(drive: &DriveUnit, head: u8, rotation: u64, rotation_ticks: u64) -> Option<SectorId> {
    let count = drive.sector_count(head) as u64;
    let index = ((rotation * count + rotation_ticks / 2) / rotation_ticks.max(1)) as usize;
    drive
        .sector_by_index(head, index)
        .or_else(|| drive.sector_by_index(head, 0))
        .map(|rec| rec.id())
}

/// セクタ番号は合うがシリンダが違うヘッダがあるか
fn cylinder_mismatch(drive: &DriveUnit, head: u8, id: &SectorId) -> Status2 {
    let mut st2 = Status2::empty();
    for index in 0..drive.sector_count(head) {
        let Some(found) = drive.sector_by_index(head, index).map(|rec| rec.id()) else {
            continue;
        };
        if found.sector == id.sector && found.cylinder != id.cylinder {
            st2 |= Status2::WC;
            if found.cylinder == 0xFF {
                st2 |= Status2::BC;
            }
        }
    }
    st2
}

/// スキャン比較（ディスク側とホスト側）
fn scan_compare(job: &mut SectorJob, disk: u8, host: u8) {
    if host == SCAN_DONT_CARE {
        return;
    }
    if disk != host {
        job.scan_equal = false;
    }
    let satisfied = match job.opcode {
        Opcode::ScanEqual => disk == host,
        Opcode::ScanLowOrEqual => disk <= host,
        Opcode::ScanHighOrEqual => disk >= host,
        _ => true,
    };
    if !satisfied {
        job.scan_satisfied = false;
    }
}
