//! ポーリング方式のホストドライバ
//!
//! Drives a controller through whole commands the way a BIOS would: write
//! the command bytes, service the execution phase (programmed I/O or DMA),
//! pulse Terminal Count, and collect the result bytes. The CLI, the
//! self-test and integration tests all go through this.

use crate::disk::Geometry;
use crate::drive::DriveSelector;
use crate::fdc::command::{Opcode, FLAG_MF, FLAG_MT, FLAG_SK};
use crate::fdc::status::{MainStatus, Status0, Status1, Status2};
use crate::fdc::Fdc8272;
use crate::sector::SectorId;
use thiserror::Error;

/// 1回のupdateで進めるtick数
pub const DEFAULT_TICK_STEP: u64 = 16;

/// 1コマンドの上限（回転数）
const TIMEOUT_ROTATIONS: u64 = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("{opcode} did not complete within {ticks} ticks")]
    Timeout { opcode: Opcode, ticks: u64 },
    #[error("controller not accepting command bytes (MSR={msr:02X})")]
    NotAccepting { msr: u8 },
    #[error("{0} returned no result")]
    MissingResult(Opcode),
}

/// コマンド実行の結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// 実行フェーズでFDCから受け取ったデータ
    pub data: Vec<u8>,
    /// 結果フェーズのバイト列
    pub result: Vec<u8>,
}

impl CommandOutcome {
    pub fn st0(&self) -> Status0 {
        Status0::from_bits_truncate(self.result.first().copied().unwrap_or(0))
    }

    pub fn st1(&self) -> Status1 {
        Status1::from_bits_truncate(self.result.get(1).copied().unwrap_or(0))
    }

    pub fn st2(&self) -> Status2 {
        Status2::from_bits_truncate(self.result.get(2).copied().unwrap_or(0))
    }

    /// 7バイト結果の C/H/R/N
    pub fn id(&self) -> Option<SectorId> {
        match self.result.as_slice() {
            [_, _, _, c, h, r, n] => Some(SectorId::new(*c, *h, *r, *n)),
            _ => None,
        }
    }

    pub fn is_normal(&self) -> bool {
        self.st0().is_normal_termination()
    }

    /// EOTまで読み切った（TCなしのEN終了も含む）
    pub fn completed_track(&self) -> bool {
        self.is_normal() || (self.st1() == Status1::EN && self.st2().is_empty())
    }
}

/// READ/WRITE系コマンドのパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub drive: u8,
    pub id: SectorId,
    pub end_of_track: u8,
    pub gap_length: u8,
    pub data_length: u8,
    pub multi_track: bool,
    pub skip: bool,
}

impl TransferRequest {
    pub fn new(drive: u8, id: SectorId, end_of_track: u8) -> Self {
        TransferRequest {
            drive,
            id,
            end_of_track,
            gap_length: 0x1B,
            data_length: 0xFF,
            multi_track: false,
            skip: false,
        }
    }

    /// 9バイトのコマンド列
    pub fn command_bytes(&self, opcode: u8) -> [u8; 9] {
        let mut first = opcode | FLAG_MF;
        if self.multi_track {
            first |= FLAG_MT;
        }
        if self.skip {
            first |= FLAG_SK;
        }
        [
            first,
            (self.drive & 0x03) | ((self.id.head & 0x01) << 2),
            self.id.cylinder,
            self.id.head,
            self.id.sector,
            self.id.size_code,
            self.end_of_track,
            self.gap_length,
            self.data_length,
        ]
    }
}

/// ポーリングホスト
#[derive(Debug, Clone, Copy)]
pub struct PolledHost {
    pub tick_step: u64,
}

impl Default for PolledHost {
    fn default() -> Self {
        PolledHost { tick_step: DEFAULT_TICK_STEP }
    }
}

impl PolledHost {
    pub fn new(tick_step: u64) -> Self {
        PolledHost { tick_step: tick_step.max(1) }
    }

    /// 1コマンドを実行
    ///
    /// `outgoing` はホストからFDCへ送るデータ（書き込み・スキャン・フォーマット）。
    /// 送り切ったらTCを出す。`incoming_limit` は読み出しをTCで打ち切るバイト数。
    pub fn execute<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        command: &[u8],
        outgoing: &[u8],
        incoming_limit: Option<usize>,
    ) -> Result<CommandOutcome, HostError> {
        let opcode = command.first().map_or(Opcode::Invalid, |&b| Opcode::decode(b));
        let writes = opcode.is_write() || opcode.is_scan();
        let budget = fdc.rotation_ticks() * TIMEOUT_ROTATIONS;
        let mut elapsed = 0u64;

        for &byte in command {
            loop {
                let msr = fdc.main_status();
                if msr.contains(MainStatus::RQM) && !msr.contains(MainStatus::DIO) {
                    break;
                }
                if msr.contains(MainStatus::DIO) {
                    return Err(HostError::NotAccepting { msr: msr.bits() });
                }
                self.tick(fdc, &mut elapsed, budget, opcode)?;
            }
            fdc.write_data(byte);
        }

        let mut outcome = CommandOutcome::default();
        let mut sent = 0usize;
        let mut terminated = false;
        loop {
            let msr = fdc.main_status();
            if !msr.contains(MainStatus::CB) {
                return Ok(outcome);
            }
            if msr.contains(MainStatus::RQM | MainStatus::DIO) && !msr.contains(MainStatus::EXM) {
                while fdc.main_status().contains(MainStatus::RQM | MainStatus::DIO) {
                    outcome.result.push(fdc.read_data());
                }
                log::trace!("{} finished: {:02X?}", opcode, outcome.result);
                return Ok(outcome);
            }

            let pio = msr.contains(MainStatus::EXM | MainStatus::RQM);
            if fdc.dma_request() || pio {
                if writes {
                    match outgoing.get(sent) {
                        Some(&byte) => {
                            if pio {
                                fdc.write_data(byte);
                            } else {
                                fdc.write_dma(byte);
                            }
                            sent += 1;
                            if sent == outgoing.len() && !terminated {
                                fdc.terminal_count();
                                terminated = true;
                            }
                        }
                        None => {
                            fdc.terminal_count();
                            terminated = true;
                        }
                    }
                } else {
                    let byte = if pio { fdc.read_data() } else { fdc.read_dma() };
                    outcome.data.push(byte);
                    if incoming_limit == Some(outcome.data.len()) {
                        fdc.terminal_count();
                        terminated = true;
                    }
                }
                continue;
            }
            self.tick(fdc, &mut elapsed, budget, opcode)?;
        }
    }

    fn tick<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        elapsed: &mut u64,
        budget: u64,
        opcode: Opcode,
    ) -> Result<(), HostError> {
        fdc.update(self.tick_step);
        *elapsed += self.tick_step;
        if *elapsed > budget {
            return Err(HostError::Timeout { opcode, ticks: *elapsed });
        }
        Ok(())
    }

    /// 割り込みが上がるまで時間を進める
    pub fn wait_interrupt<S: DriveSelector>(&self, fdc: &mut Fdc8272<S>, opcode: Opcode) -> Result<(), HostError> {
        let budget = fdc.rotation_ticks() * TIMEOUT_ROTATIONS;
        let mut elapsed = 0u64;
        while !fdc.interrupt_request() {
            self.tick(fdc, &mut elapsed, budget, opcode)?;
        }
        Ok(())
    }

    /// SENSE INTERRUPT STATUS → (ST0, PCN)
    pub fn sense_interrupt<S: DriveSelector>(&self, fdc: &mut Fdc8272<S>) -> Result<(Status0, u8), HostError> {
        let outcome = self.execute(fdc, &[0x08], &[], None)?;
        match outcome.result.as_slice() {
            [st0, pcn] => Ok((Status0::from_bits_truncate(*st0), *pcn)),
            [st0] => Ok((Status0::from_bits_truncate(*st0), 0)),
            _ => Err(HostError::MissingResult(Opcode::SenseInterruptStatus)),
        }
    }

    /// SPECIFY
    pub fn specify<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        step_rate: u8,
        head_unload: u8,
        head_load: u8,
        non_dma: bool,
    ) -> Result<(), HostError> {
        let command = [0x03, (step_rate << 4) | (head_unload & 0x0F), (head_load << 1) | non_dma as u8];
        self.execute(fdc, &command, &[], None).map(|_| ())
    }

    /// SEEK して完了を待つ
    pub fn seek<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        drive: u8,
        head: u8,
        cylinder: u8,
    ) -> Result<(Status0, u8), HostError> {
        self.execute(fdc, &[0x0F, (drive & 0x03) | ((head & 0x01) << 2), cylinder], &[], None)?;
        self.wait_interrupt(fdc, Opcode::Seek)?;
        self.sense_interrupt(fdc)
    }

    /// RECALIBRATE して完了を待つ
    pub fn recalibrate<S: DriveSelector>(&self, fdc: &mut Fdc8272<S>, drive: u8) -> Result<(Status0, u8), HostError> {
        self.execute(fdc, &[0x07, drive & 0x03], &[], None)?;
        self.wait_interrupt(fdc, Opcode::Recalibrate)?;
        self.sense_interrupt(fdc)
    }

    /// READ DATA
    pub fn read_sectors<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        request: &TransferRequest,
        limit: Option<usize>,
    ) -> Result<CommandOutcome, HostError> {
        self.execute(fdc, &request.command_bytes(0x06), &[], limit)
    }

    /// WRITE DATA
    pub fn write_sectors<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        request: &TransferRequest,
        data: &[u8],
    ) -> Result<CommandOutcome, HostError> {
        self.execute(fdc, &request.command_bytes(0x05), data, None)
    }

    /// READ ID
    pub fn read_id<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        drive: u8,
        head: u8,
    ) -> Result<CommandOutcome, HostError> {
        self.execute(fdc, &[0x0A | FLAG_MF, (drive & 0x03) | ((head & 0x01) << 2)], &[], None)
    }

    /// FORMAT TRACK
    pub fn format_track<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        drive: u8,
        head: u8,
        ids: &[SectorId],
        fill: u8,
    ) -> Result<CommandOutcome, HostError> {
        let size_code = ids.first().map_or(2, |id| id.size_code);
        let command = [
            0x0D | FLAG_MF,
            (drive & 0x03) | ((head & 0x01) << 2),
            size_code,
            ids.len() as u8,
            0x54,
            fill,
        ];
        let table: Vec<u8> = ids.iter().flat_map(|id| id.to_bytes()).collect();
        self.execute(fdc, &command, &table, None)
    }

    /// 論理トラック1本を読む（ヘッドは移動済みであること）
    pub fn read_logical_track<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        drive: u8,
        geometry: &Geometry,
        cylinder: u8,
        head: u8,
    ) -> Result<CommandOutcome, HostError> {
        let request = logical_track_request(drive, geometry, cylinder, head);
        self.read_sectors(fdc, &request, Some(geometry.track_bytes()))
    }

    /// 論理トラック1本を書く
    pub fn write_logical_track<S: DriveSelector>(
        &self,
        fdc: &mut Fdc8272<S>,
        drive: u8,
        geometry: &Geometry,
        cylinder: u8,
        head: u8,
        data: &[u8],
    ) -> Result<CommandOutcome, HostError> {
        let request = logical_track_request(drive, geometry, cylinder, head);
        self.write_sectors(fdc, &request, data)
    }
}

fn logical_track_request(drive: u8, geometry: &Geometry, cylinder: u8, head: u8) -> TransferRequest {
    let first = SectorId::new(cylinder, head, geometry.first_sector, geometry.size_code);
    let last = geometry.first_sector.wrapping_add(geometry.sectors_per_track.saturating_sub(1));
    TransferRequest::new(drive, first, last)
}
