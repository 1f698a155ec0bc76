// ============================================================================
// src/io/usb/xhci/slot_manager.rs - Device Slot Lifecycle
// ============================================================================
//!
//! # スロット管理
//!
//! デバイススロットごとのライフサイクル状態と、保留中コマンドの対応付け。
//!
//! ```text
//! Free → EnablePending → Enabled → AddressPending → Addressed
//!      → ConfigurePending → Configured
//! (Free 以外の任意の状態) → DisablePending → Free
//! Free（ハードウェア側で有効のまま） → DisablePending → Free
//! ```
//!
//! `*Pending → 次状態` の遷移はコマンド完了イベントでのみ行う。
//! 成功以外の完了コードはスロットを Free に戻し、`CommandFailed` を返す。
//! 1 スロットに同時に保留できるコマンドは 1 つだけ（2 つ目は `SlotBusy`）。

use alloc::vec::Vec;

use log::{debug, warn};

use super::command::CommandToken;
use super::trb::CompletionCode;
use crate::error::{XhciError, XhciResult};
use crate::io::usb::SlotId;

/// スロットのソフトウェア側状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    EnablePending,
    Enabled,
    AddressPending,
    Addressed,
    ConfigurePending,
    Configured,
    DisablePending,
}

impl SlotState {
    /// コマンド完了待ちか
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SlotState::EnablePending
                | SlotState::AddressPending
                | SlotState::ConfigurePending
                | SlotState::DisablePending
        )
    }

    /// 成功完了後の状態
    fn completed(&self) -> Option<SlotState> {
        match self {
            SlotState::EnablePending => Some(SlotState::Enabled),
            SlotState::AddressPending => Some(SlotState::Addressed),
            SlotState::ConfigurePending => Some(SlotState::Configured),
            SlotState::DisablePending => Some(SlotState::Free),
            _ => None,
        }
    }
}

/// スロットテーブルのエントリ
#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    state: SlotState,
    /// 保留中コマンドの対応トークン
    pending: Option<CommandToken>,
}

impl SlotEntry {
    const FREE: Self = Self {
        state: SlotState::Free,
        pending: None,
    };
}

/// 完了イベントを適用した結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOutcome {
    /// 対象スロット（Enable Slot 失敗時はイベントのスロットID）
    pub slot: SlotId,
    /// 遷移後の状態、または `CommandFailed`
    pub result: XhciResult<SlotState>,
}

/// スロットマネージャ
#[derive(Debug)]
pub struct SlotManager {
    /// インデックス = スロットID（0 は未使用）
    slots: Vec<SlotEntry>,
    /// スロットIDがまだ決まっていない Enable Slot コマンド
    pending_enables: Vec<CommandToken>,
}

impl SlotManager {
    pub fn new(max_slots: u8) -> Self {
        Self {
            slots: alloc::vec![SlotEntry::FREE; max_slots as usize + 1],
            pending_enables: Vec::new(),
        }
    }

    pub fn max_slots(&self) -> u8 {
        (self.slots.len() - 1) as u8
    }

    fn entry(&self, slot: SlotId) -> XhciResult<&SlotEntry> {
        if !slot.is_valid() {
            return Err(XhciError::InvalidSlot(slot));
        }
        self.slots
            .get(slot.as_usize())
            .ok_or(XhciError::InvalidSlot(slot))
    }

    /// スロットの現在状態
    pub fn state(&self, slot: SlotId) -> XhciResult<SlotState> {
        self.entry(slot).map(|e| e.state)
    }

    /// 指定状態のスロット一覧
    pub fn slots_in_state(&self, state: SlotState) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, e)| e.state == state)
            .map(|(id, _)| SlotId(id as u8))
            .collect()
    }

    /// スロットIDが未確定の Enable Slot 数
    pub fn pending_enables(&self) -> usize {
        self.pending_enables.len()
    }

    /// Enable Slot の発行を記録
    pub fn begin_enable(&mut self, token: CommandToken) {
        self.pending_enables.push(token);
    }

    /// Enable Slot の発行を取り消す（エンキュー失敗時）
    pub fn abort_enable(&mut self, token: CommandToken) {
        self.pending_enables.retain(|t| *t != token);
    }

    /// 状態を確認して `*Pending` に遷移
    fn begin(
        &mut self,
        slot: SlotId,
        token: CommandToken,
        allowed: impl Fn(SlotState) -> bool,
        pending: SlotState,
    ) -> XhciResult<()> {
        let state = self.entry(slot)?.state;
        if state.is_pending() {
            return Err(XhciError::SlotBusy(slot));
        }
        if !allowed(state) {
            return Err(XhciError::InvalidSlotState { slot, state });
        }
        self.slots[slot.as_usize()] = SlotEntry {
            state: pending,
            pending: Some(token),
        };
        Ok(())
    }

    /// Address Device の発行を記録（Enabled からのみ）
    pub fn begin_address(&mut self, slot: SlotId, token: CommandToken) -> XhciResult<()> {
        self.begin(slot, token, |s| s == SlotState::Enabled, SlotState::AddressPending)
    }

    /// Configure Endpoint の発行を記録（Addressed / Configured から）
    pub fn begin_configure(&mut self, slot: SlotId, token: CommandToken) -> XhciResult<()> {
        self.begin(
            slot,
            token,
            |s| matches!(s, SlotState::Addressed | SlotState::Configured),
            SlotState::ConfigurePending,
        )
    }

    /// Disable Slot の発行を記録（Free 以外から）
    pub fn begin_disable(&mut self, slot: SlotId, token: CommandToken) -> XhciResult<()> {
        self.begin(slot, token, |s| s != SlotState::Free, SlotState::DisablePending)
    }

    /// コマンド失敗で Free に戻ったがハードウェア側では有効なスロットの Disable Slot
    pub fn begin_release(&mut self, slot: SlotId, token: CommandToken) -> XhciResult<()> {
        self.begin(slot, token, |s| s == SlotState::Free, SlotState::DisablePending)
    }

    /// アドレス割り当て済みで保留コマンドのないスロットか確認する
    ///
    /// エンドポイント単位のコマンド（Evaluate Context / Stop / Reset Endpoint）用。
    /// 状態は遷移させない。
    pub fn require_device(&self, slot: SlotId) -> XhciResult<()> {
        let state = self.entry(slot)?.state;
        match state {
            SlotState::Addressed | SlotState::Configured => Ok(()),
            s if s.is_pending() => Err(XhciError::SlotBusy(slot)),
            _ => Err(XhciError::InvalidSlotState { slot, state }),
        }
    }

    /// `begin_*` を取り消して元の状態に戻す（エンキュー失敗時）
    pub fn abort(&mut self, slot: SlotId, token: CommandToken, previous: SlotState) {
        if let Some(entry) = self.slots.get_mut(slot.as_usize())
            && entry.pending == Some(token)
        {
            *entry = SlotEntry {
                state: previous,
                pending: None,
            };
        }
    }

    /// コマンド完了イベントを適用
    ///
    /// スロット操作に対応しないトークン（No Op 等）は `None`。
    pub fn complete(
        &mut self,
        token: CommandToken,
        slot_id: SlotId,
        code: CompletionCode,
    ) -> Option<SlotOutcome> {
        if let Some(pos) = self.pending_enables.iter().position(|t| *t == token) {
            self.pending_enables.swap_remove(pos);
            return Some(self.complete_enable(slot_id, code));
        }

        let index = self
            .slots
            .iter()
            .position(|e| e.pending == Some(token))?;
        let slot = SlotId(index as u8);
        let entry = &mut self.slots[index];

        if slot_id != slot {
            warn!(
                "xhci: completion for slot {} reported slot {}",
                slot.as_u8(),
                slot_id.as_u8()
            );
        }

        let result = match entry.state.completed() {
            Some(next) if code.is_success() => {
                *entry = SlotEntry {
                    state: next,
                    pending: None,
                };
                Ok(next)
            }
            _ => {
                *entry = SlotEntry::FREE;
                Err(XhciError::CommandFailed(code))
            }
        };

        debug!("xhci: slot {} -> {:?}", slot.as_u8(), result);
        Some(SlotOutcome { slot, result })
    }

    fn complete_enable(&mut self, slot: SlotId, code: CompletionCode) -> SlotOutcome {
        if !code.is_success() {
            return SlotOutcome {
                slot,
                result: Err(XhciError::CommandFailed(code)),
            };
        }

        let result = match self.entry(slot).map(|e| e.state) {
            Ok(SlotState::Free) => {
                self.slots[slot.as_usize()].state = SlotState::Enabled;
                Ok(SlotState::Enabled)
            }
            Ok(state) => Err(XhciError::InvalidSlotState { slot, state }),
            Err(e) => Err(e),
        };
        debug!("xhci: slot {} enabled: {:?}", slot.as_u8(), result);
        SlotOutcome { slot, result }
    }

    /// 全スロットを Free に戻す（コントローラ解体時）
    pub fn reset(&mut self) {
        self.slots.fill(SlotEntry::FREE);
        self.pending_enables.clear();
    }
}
