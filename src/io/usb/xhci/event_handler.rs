// ============================================================================
// src/io/usb/xhci/event_handler.rs - xHCI Event Decoding
// ============================================================================
//!
//! イベントリングから取り出したTRBの解釈。
//!
//! ## イベントタイプ
//! - コマンド完了 (Command Completion)
//! - 転送完了 (Transfer Event)
//! - ポート状態変更 (Port Status Change)
//! - その他 (Host Controller, Device Notification, etc.)
//!
//! ディスパッチ自体は `controller` 側で行う。

use super::trb::{CompletionCode, Trb, TrbType};
use crate::io::usb::{PortNumber, SlotId};

// ============================================================================
// Event Types
// ============================================================================

/// コマンド完了イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCompletionEvent {
    /// 完了したコマンドTRBの物理アドレス
    pub command_trb: u64,
    pub completion_code: CompletionCode,
    pub slot_id: SlotId,
}

/// 転送完了イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    /// 完了した転送TRBの物理アドレス
    pub trb_pointer: u64,
    pub completion_code: CompletionCode,
    /// 残りバイト数
    pub residual_length: u32,
    pub slot_id: SlotId,
    /// DCI
    pub endpoint_id: u8,
    /// Event Data flag
    pub event_data: bool,
}

/// ポート状態変更イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatusChangeEvent {
    pub port: PortNumber,
    pub completion_code: CompletionCode,
}

/// デバイス通知イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNotificationEvent {
    pub notification_type: u8,
    pub slot_id: SlotId,
    pub notification_data: u64,
}

/// デコード済みイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedEvent {
    CommandCompletion(CommandCompletionEvent),
    Transfer(TransferEvent),
    PortStatusChange(PortStatusChangeEvent),
    DeviceNotification(DeviceNotificationEvent),
    HostController { completion_code: CompletionCode },
    MfindexWrap,
    Unknown { trb_type: u8 },
}

impl ProcessedEvent {
    /// イベントTRBをデコード
    pub fn parse(trb: &Trb) -> Self {
        let completion_code = trb.completion_code();

        match trb.kind() {
            Some(TrbType::CommandCompletion) => {
                ProcessedEvent::CommandCompletion(CommandCompletionEvent {
                    command_trb: trb.trb_pointer(),
                    completion_code,
                    slot_id: trb.slot_id(),
                })
            }
            Some(TrbType::Transfer) => ProcessedEvent::Transfer(TransferEvent {
                trb_pointer: trb.parameter,
                completion_code,
                residual_length: trb.transfer_length(),
                slot_id: trb.slot_id(),
                endpoint_id: trb.endpoint_id(),
                event_data: (trb.control & (1 << 2)) != 0,
            }),
            Some(TrbType::PortStatusChange) => {
                ProcessedEvent::PortStatusChange(PortStatusChangeEvent {
                    port: PortNumber(trb.port_id()),
                    completion_code,
                })
            }
            Some(TrbType::DeviceNotification) => {
                ProcessedEvent::DeviceNotification(DeviceNotificationEvent {
                    notification_type: ((trb.parameter >> 4) & 0xF) as u8,
                    slot_id: trb.slot_id(),
                    notification_data: trb.parameter >> 8,
                })
            }
            Some(TrbType::HostController) => ProcessedEvent::HostController { completion_code },
            Some(TrbType::MfindexWrap) => ProcessedEvent::MfindexWrap,
            _ => ProcessedEvent::Unknown {
                trb_type: trb.trb_type(),
            },
        }
    }
}

// ============================================================================
// Drain Summary
// ============================================================================

/// 1 回のイベントリング排出で処理した件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub command_completions: usize,
    pub transfers: usize,
    pub port_changes: usize,
    pub other: usize,
}

impl DrainSummary {
    /// 処理したイベントの総数
    pub fn total(&self) -> usize {
        self.command_completions + self.transfers + self.port_changes + self.other
    }

    pub(crate) fn record(&mut self, event: &ProcessedEvent) {
        match event {
            ProcessedEvent::CommandCompletion(_) => self.command_completions += 1,
            ProcessedEvent::Transfer(_) => self.transfers += 1,
            ProcessedEvent::PortStatusChange(_) => self.port_changes += 1,
            _ => self.other += 1,
        }
    }
}
