//! 8272 ステータスレジスタ
//!
//! Main Status Register and result status bytes ST0-ST3.

bitflags::bitflags! {
    /// メインステータスレジスタ (MSR)
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MainStatus: u8 {
        /// ドライブ0シーク中
        const D0B = 0x01;
        /// ドライブ1シーク中
        const D1B = 0x02;
        /// ドライブ2シーク中
        const D2B = 0x04;
        /// ドライブ3シーク中
        const D3B = 0x08;
        /// コマンド実行中
        const CB  = 0x10;
        /// 非DMAモードの実行フェーズ
        const EXM = 0x20;
        /// データ方向（1 = FDC→CPU）
        const DIO = 0x40;
        /// データレジスタ準備完了
        const RQM = 0x80;
    }
}

impl MainStatus {
    /// ドライブ番号に対応するシークビジービット
    pub fn drive_busy(drive: u8) -> MainStatus {
        MainStatus::from_bits_truncate(1 << (drive & 0x03))
    }
}

bitflags::bitflags! {
    /// ステータスレジスタ0
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Status0: u8 {
        /// ドライブ番号（下位2ビット）
        const US0 = 0x01;
        const US1 = 0x02;
        /// ヘッド番号
        const HD  = 0x04;
        /// ノットレディ
        const NR  = 0x08;
        /// イクイップメントチェック
        const EC  = 0x10;
        /// シーク終了
        const SE  = 0x20;
        /// 終了コード IC（bit7-6）
        const IC_ABNORMAL = 0x40;
        const IC_INVALID  = 0x80;
        const IC_READY_CHANGED = 0xC0;
    }
}

impl Status0 {
    /// ドライブ番号とヘッドを埋め込む
    pub fn unit(drive: u8, head: u8) -> Status0 {
        Status0::from_bits_truncate((drive & 0x03) | ((head & 0x01) << 2))
    }

    /// 終了コードが正常か
    pub fn is_normal_termination(&self) -> bool {
        self.bits() & 0xC0 == 0
    }
}

bitflags::bitflags! {
    /// ステータスレジスタ1
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Status1: u8 {
        /// アドレスマーク欠落
        const MA = 0x01;
        /// 書き込み不可
        const NW = 0x02;
        /// データなし
        const ND = 0x04;
        /// オーバーラン
        const OR = 0x10;
        /// データエラー（CRC）
        const DE = 0x20;
        /// シリンダ終端
        const EN = 0x80;
    }
}

bitflags::bitflags! {
    /// ステータスレジスタ2
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Status2: u8 {
        /// データアドレスマーク欠落
        const MD = 0x01;
        /// バッドシリンダ（C=FF）
        const BC = 0x02;
        /// スキャン条件不成立
        const SN = 0x04;
        /// スキャン一致
        const SH = 0x08;
        /// シリンダ不一致
        const WC = 0x10;
        /// データ部CRCエラー
        const DD = 0x20;
        /// コントロールマーク（削除データ）
        const CM = 0x40;
    }
}

bitflags::bitflags! {
    /// ステータスレジスタ3（Sense Drive Status）
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Status3: u8 {
        const US0 = 0x01;
        const US1 = 0x02;
        const HD  = 0x04;
        /// 両面ドライブ
        const TS  = 0x08;
        /// トラック0
        const T0  = 0x10;
        /// レディ
        const RY  = 0x20;
        /// ライトプロテクト
        const WP  = 0x40;
        /// フォールト
        const FT  = 0x80;
    }
}

impl Status3 {
    pub fn unit(drive: u8, head: u8) -> Status3 {
        Status3::from_bits_truncate((drive & 0x03) | ((head & 0x01) << 2))
    }
}

/// デバッグ表示用のレジスタ一式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StatusRegisters {
    pub main: MainStatus,
    pub st0: Status0,
    pub st1: Status1,
    pub st2: Status2,
    pub st3: Status3,
}
