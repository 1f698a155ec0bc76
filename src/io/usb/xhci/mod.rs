// ============================================================================
// src/io/usb/xhci/mod.rs - xHCI Host Controller Driver Module
// ============================================================================
//!
//! # xHCI (eXtensible Host Controller Interface) ドライバ
//!
//! USB 3.x ホストコントローラドライバ。
//!
//! ## アーキテクチャ
//! - レジスタ操作は [`RegisterIo`](crate::io::mmio::RegisterIo) 越しの volatile アクセス
//! - TRB (Transfer Request Block) ベースのコマンド/転送
//! - イベントリングによる非同期完了通知（コマンドは `async fn`）
//!
//! ## メモリ構造
//! - DCBAA (Device Context Base Address Array) とスクラッチパッド
//! - Command Ring
//! - Event Ring + ERST
//! - Transfer Ring per endpoint
//!
//! ## モジュール構造
//! - `registers`: ケーパビリティ/オペレーショナル/ポート/インタラプタレジスタ
//! - `trb`: TRB 定義と操作
//! - `ring_manager`: プロデューサリング、コンシューマカーソル、イベントリング
//! - `context`, `dcbaa`: デバイス/入力コンテキストと DCBAA
//! - `slot_manager`: スロットのライフサイクル
//! - `command`: コマンド完了の追跡と Future
//! - `event_handler`: イベントTRBのデコード
//! - `port_manager`, `doorbell_manager`: ポートとドアベル
//! - `initialization`: 初期化シーケンス
//! - `controller`: 以上をまとめるコントローラ本体

pub mod command;
pub mod context;
pub mod controller;
pub mod dcbaa;
pub mod doorbell_manager;
pub mod event_handler;
pub mod initialization;
pub mod port_manager;
pub mod registers;
pub mod ring_manager;
pub mod slot_manager;
pub mod trb;

#[cfg(test)]
pub mod sim;

// Re-exports
pub use command::{CommandCompletion, CommandFuture, CommandKind, CommandToken, CommandTracker};
pub use controller::XhciController;
pub use doorbell_manager::{DoorbellTarget, StreamId, XhciDoorbellManager};
pub use event_handler::{DrainSummary, ProcessedEvent, TransferEvent};
pub use port_manager::{PortChange, PortChangeEvent, PortLinkState, XhciPortManager};
pub use registers::{CapabilityRegisters, PortStatus};
pub use slot_manager::{SlotManager, SlotState};
pub use trb::{CompletionCode, Trb, TrbType};

// ============================================================================
// Controller Status
// ============================================================================

/// コントローラの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerStatus {
    /// 未初期化（初期化失敗・停止後を含む）
    ControllerNotInitialized = 0,
    /// 動作中
    ControllerInitialized = 1,
    /// ホストシステム/ホストコントローラエラー検出済み（再初期化が必要）
    ControllerError = 2,
}

impl ControllerStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ControllerInitialized,
            2 => Self::ControllerError,
            _ => Self::ControllerNotInitialized,
        }
    }
}

// ============================================================================
// Observers
// ============================================================================

/// ポート状態変更の通知先
///
/// イベント処理経路から呼ばれるため、ブロックしないこと。
pub trait PortObserver: Send + Sync {
    fn port_changed(&self, change: PortChange);
}

/// 転送完了の通知先
pub trait TransferObserver: Send + Sync {
    fn transfer_completed(&self, event: TransferEvent);
}
