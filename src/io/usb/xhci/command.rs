// ============================================================================
// src/io/usb/xhci/command.rs - xHCI Command Completion Tracking
// ============================================================================
//!
//! # コマンド完了追跡
//!
//! コマンドTRBの物理アドレスをトークンとして保留中コマンドを管理する。
//! 完了は必ずイベント処理経路（`process_events`）から解決され、
//! エンキュー時に同期的に解決されることはない。
//!
//! 入力コンテキストはコマンド完了までハードウェアが読むため、
//! 保留エントリが所有して完了まで解放しない。

use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use hashbrown::HashMap;
use log::{debug, warn};
use spin::Mutex;

use super::context::InputContextBuffer;
use super::ring_manager::ProducerRing;
use super::trb::CompletionCode;
use crate::error::{XhciError, XhciResult};
use crate::io::usb::{PortNumber, SlotId, UsbSpeed};

// ============================================================================
// Command Token
// ============================================================================

/// コマンド相関トークン（コマンドTRBの物理アドレス）
///
/// Command Completion Event の Command TRB Pointer と一致する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandToken(pub u64);

impl CommandToken {
    pub fn trb_address(&self) -> u64 {
        self.0
    }
}

/// 発行したコマンドの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    NoOp,
    EnableSlot,
    AddressDevice(SlotId),
    ConfigureEndpoint(SlotId),
    EvaluateContext(SlotId),
    /// (スロット, DCI)
    StopEndpoint(SlotId, u8),
    ResetEndpoint(SlotId, u8),
    DisableSlot(SlotId),
    /// 失敗したコマンドの後に残ったハードウェアスロットの Disable Slot
    ReleaseSlot(SlotId),
}

impl CommandKind {
    /// 対象スロット（Enable Slot / No Op は発行時点で未定）
    pub fn slot(&self) -> Option<SlotId> {
        match self {
            CommandKind::AddressDevice(slot)
            | CommandKind::ConfigureEndpoint(slot)
            | CommandKind::EvaluateContext(slot)
            | CommandKind::StopEndpoint(slot, _)
            | CommandKind::ResetEndpoint(slot, _)
            | CommandKind::DisableSlot(slot)
            | CommandKind::ReleaseSlot(slot) => Some(*slot),
            CommandKind::NoOp | CommandKind::EnableSlot => None,
        }
    }
}

/// コマンドの完了結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCompletion {
    pub token: CommandToken,
    pub code: CompletionCode,
    /// イベントが報告したスロットID（Enable Slot では割り当てられたスロット）
    pub slot_id: SlotId,
}

/// コマンド完了までハードウェアが参照し得るDMA資源
#[derive(Debug, Default)]
pub struct CommandResources {
    /// Address Device / Configure Endpoint の入力コンテキスト
    pub input: Option<InputContextBuffer>,
    /// 成功時にエンドポイントへ割り当てる転送リング (DCI, リング)
    pub transfer_rings: Vec<(u8, ProducerRing)>,
    /// Address Device 成功時にスロットへ結び付けるポートと速度
    pub port_binding: Option<(PortNumber, UsbSpeed)>,
}

// ============================================================================
// Command Tracker
// ============================================================================

struct PendingCommand {
    kind: CommandKind,
    result: Option<XhciResult<CommandCompletion>>,
    waker: Option<Waker>,
    /// 待ち手の Future が既に破棄された
    abandoned: bool,
    resources: CommandResources,
}

/// 保留中コマンドテーブル
pub struct CommandTracker {
    pending: Mutex<HashMap<CommandToken, PendingCommand>>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// 保留中（未完了または未回収）のコマンド数
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// コマンドを登録（TRBをエンキューする前に呼ぶ）
    pub fn register(&self, token: CommandToken, kind: CommandKind, resources: CommandResources) {
        let previous = self.pending.lock().insert(
            token,
            PendingCommand {
                kind,
                result: None,
                waker: None,
                abandoned: false,
                resources,
            },
        );
        if previous.is_some() {
            warn!("xhci: command token {:#x} reused while pending", token.0);
        }
    }

    /// 待ち手を持たないコマンドを登録（完了時にそのまま破棄される）
    pub fn register_detached(&self, token: CommandToken, kind: CommandKind) {
        self.register(token, kind, CommandResources::default());
        if let Some(entry) = self.pending.lock().get_mut(&token) {
            entry.abandoned = true;
        }
    }

    /// 登録を取り消す（エンキュー失敗時）
    pub fn forget(&self, token: CommandToken) {
        self.pending.lock().remove(&token);
    }

    /// 保留中コマンドの種類
    pub fn kind(&self, token: CommandToken) -> Option<CommandKind> {
        self.pending.lock().get(&token).map(|p| p.kind)
    }

    /// 成功したコマンドの転送リングを引き取る（完了記録より前に呼ぶ）
    pub fn take_transfer_rings(&self, token: CommandToken) -> Vec<(u8, ProducerRing)> {
        self.pending
            .lock()
            .get_mut(&token)
            .map(|entry| core::mem::take(&mut entry.resources.transfer_rings))
            .unwrap_or_default()
    }

    /// 成功した Address Device のポート割り当てを引き取る
    pub fn take_port_binding(&self, token: CommandToken) -> Option<(PortNumber, UsbSpeed)> {
        self.pending
            .lock()
            .get_mut(&token)
            .and_then(|entry| entry.resources.port_binding.take())
    }

    /// 完了を記録して待ち手を起こす
    ///
    /// 対応する登録がなければ `false`。
    pub fn complete(&self, token: CommandToken, result: XhciResult<CommandCompletion>) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&token) else {
            return false;
        };

        debug!("xhci: command {:?} at {:#x} -> {:?}", entry.kind, token.0, result);
        if entry.abandoned {
            pending.remove(&token);
            return true;
        }

        entry.result = Some(result);
        let waker = entry.waker.take();
        drop(pending);
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// 全保留コマンドを `CommandCancelled` で解決する
    pub fn cancel_all(&self) -> usize {
        let mut wakers = Vec::new();
        let mut cancelled = 0;
        {
            let mut pending = self.pending.lock();
            pending.retain(|_, entry| !entry.abandoned);
            for entry in pending.values_mut().filter(|e| e.result.is_none()) {
                entry.result = Some(Err(XhciError::CommandCancelled));
                cancelled += 1;
                if let Some(waker) = entry.waker.take() {
                    wakers.push(waker);
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
        cancelled
    }

    fn poll_token(&self, token: CommandToken, cx: &mut Context<'_>) -> Poll<XhciResult<CommandCompletion>> {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&token) else {
            return Poll::Ready(Err(XhciError::CommandCancelled));
        };

        if entry.result.is_some() {
            let result = pending
                .remove(&token)
                .and_then(|entry| entry.result)
                .unwrap_or(Err(XhciError::CommandCancelled));
            return Poll::Ready(result);
        }

        match &entry.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => entry.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    /// Future の破棄: 完了済みなら削除、未完了なら完了イベントまで入力コンテキストを保持
    fn release(&self, token: CommandToken) {
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(&token) {
            if entry.result.is_some() {
                pending.remove(&token);
            } else {
                entry.abandoned = true;
                entry.waker = None;
            }
        }
    }
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Command Future
// ============================================================================

/// コマンド完了を待つ Future
pub struct CommandFuture<'a> {
    tracker: &'a CommandTracker,
    token: CommandToken,
    done: bool,
}

impl<'a> CommandFuture<'a> {
    pub fn new(tracker: &'a CommandTracker, token: CommandToken) -> Self {
        Self {
            tracker,
            token,
            done: false,
        }
    }

    pub fn token(&self) -> CommandToken {
        self.token
    }
}

impl Future for CommandFuture<'_> {
    type Output = XhciResult<CommandCompletion>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let poll = self.tracker.poll_token(self.token, cx);
        if poll.is_ready() {
            self.done = true;
        }
        poll
    }
}

impl Drop for CommandFuture<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.tracker.release(self.token);
        }
    }
}
