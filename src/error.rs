//! 統一エラーハンドリングモジュール
//!
//! xHCI ドライバ全体で使用されるエラー型を定義します。
//! 致命的なエラー（初期化失敗、ホストシステムエラー）は常に呼び出し元へ返し、
//! ドライバ内部で黙って回復することはありません。

use alloc::boxed::Box;
use core::fmt;

use crate::io::usb::xhci::slot_manager::SlotState;
use crate::io::usb::xhci::trb::CompletionCode;
use crate::io::usb::{PortNumber, SlotId};

/// 初期化シーケンスのステップ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    /// 設定値の検証
    ValidateConfig,
    /// コントローラ停止（HCHalted 待ち）
    Halt,
    /// ホストコントローラリセット（HCRST / CNR 待ち）
    Reset,
    /// CONFIG.MaxSlotsEn の設定
    ConfigureSlots,
    /// DCBAA の確保と DCBAAP 設定
    DeviceContextArray,
    /// コマンドリングの確保と CRCR 設定
    CommandRing,
    /// イベントリングと ERST の設定
    EventRing,
    /// 割り込み有効化と Run/Stop
    Start,
}

/// ホストコントローラの致命的エラー種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    /// USBSTS.HSE
    HostSystemError,
    /// USBSTS.HCE
    HostControllerError,
}

/// xHCI ドライバのエラー型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XhciError {
    /// ポーリングしたレジスタ条件が規定回数内に成立しなかった
    RegisterTimeout {
        register: &'static str,
        condition: &'static str,
    },
    /// 初期化ステップの失敗（コントローラは未初期化のまま）
    ControllerInitFailed {
        step: InitStep,
        source: Box<XhciError>,
    },
    /// 未消費エントリを上書きせずにエンキューできない
    RingFull,
    /// コマンドが成功以外の完了コードで終了
    CommandFailed(CompletionCode),
    /// スロットに別のコマンドが保留中
    SlotBusy(SlotId),
    /// 範囲外のスロットID
    InvalidSlot(SlotId),
    /// 現在のスロット状態では要求できないコマンド
    InvalidSlotState { slot: SlotId, state: SlotState },
    /// 範囲外のポート番号
    InvalidPort(PortNumber),
    /// CRR=1 の間に CRCR のポインタを書こうとした
    CommandRingRunning,
    /// ホストシステム/ホストコントローラエラー検出済み（再初期化が必要）
    ControllerError(HostErrorKind),
    /// コントローラ未初期化
    NotInitialized,
    /// DMA メモリの確保に失敗
    DmaAllocationFailed,
    /// サポートしないエンドポイント種別（アイソクロナス等）
    UnsupportedEndpoint(u8),
    /// コントローラ停止により保留中コマンドが破棄された
    CommandCancelled,
    /// 無効なパラメータ
    InvalidParameter(&'static str),
}

/// ドライバの結果型エイリアス
pub type XhciResult<T> = Result<T, XhciError>;

impl XhciError {
    /// 初期化ステップの失敗として包む
    pub fn during(self, step: InitStep) -> Self {
        XhciError::ControllerInitFailed {
            step,
            source: Box::new(self),
        }
    }

    /// 致命的（再初期化が必要）なエラーか
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XhciError::ControllerInitFailed { .. } | XhciError::ControllerError(_)
        )
    }
}

// ===== Display implementations =====

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStep::ValidateConfig => write!(f, "config validation"),
            InitStep::Halt => write!(f, "halt"),
            InitStep::Reset => write!(f, "host controller reset"),
            InitStep::ConfigureSlots => write!(f, "max slots configuration"),
            InitStep::DeviceContextArray => write!(f, "device context base address array"),
            InitStep::CommandRing => write!(f, "command ring"),
            InitStep::EventRing => write!(f, "event ring"),
            InitStep::Start => write!(f, "start"),
        }
    }
}

impl fmt::Display for HostErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostErrorKind::HostSystemError => write!(f, "host system error"),
            HostErrorKind::HostControllerError => write!(f, "host controller error"),
        }
    }
}

impl fmt::Display for XhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XhciError::RegisterTimeout {
                register,
                condition,
            } => write!(f, "timeout waiting for {} {}", register, condition),
            XhciError::ControllerInitFailed { step, source } => {
                write!(f, "controller init failed at {}: {}", step, source)
            }
            XhciError::RingFull => write!(f, "ring full"),
            XhciError::CommandFailed(code) => write!(f, "command failed: {:?}", code),
            XhciError::SlotBusy(slot) => write!(f, "slot {} busy", slot.as_u8()),
            XhciError::InvalidSlot(slot) => write!(f, "invalid slot {}", slot.as_u8()),
            XhciError::InvalidSlotState { slot, state } => {
                write!(f, "slot {} in state {:?}", slot.as_u8(), state)
            }
            XhciError::InvalidPort(port) => write!(f, "invalid port {}", port.as_u8()),
            XhciError::CommandRingRunning => write!(f, "command ring running"),
            XhciError::ControllerError(kind) => write!(f, "controller error: {}", kind),
            XhciError::NotInitialized => write!(f, "controller not initialized"),
            XhciError::DmaAllocationFailed => write!(f, "DMA allocation failed"),
            XhciError::UnsupportedEndpoint(ep) => write!(f, "unsupported endpoint {:#04x}", ep),
            XhciError::CommandCancelled => write!(f, "command cancelled"),
            XhciError::InvalidParameter(what) => write!(f, "invalid parameter: {}", what),
        }
    }
}
