// ============================================================================
// src/io/usb/xhci/doorbell_manager.rs - xHCI Doorbell Management
// ============================================================================
//!
//! # xHCI ドアベル管理
//!
//! ドアベルアレイへの書き込み。エンキューとは独立した明示的な通知ステップで、
//! ドアベルを鳴らさない限りコントローラは新しいTRBに気付かない。
//!
//! - ドアベル 0: ホストコントローラ（ターゲット 0 = コマンドリング）
//! - ドアベル n (1..=MaxSlots): スロット n（ターゲット = DCI）

use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "verbose_logging")]
use log::trace;

use crate::error::{XhciError, XhciResult};
use crate::io::mmio::RegisterIo;
use crate::io::usb::{EndpointAddress, SlotId};

/// ドアベルレジスタサイズ（バイト）
pub const DOORBELL_SIZE: usize = 4;

// ============================================================================
// Doorbell Target
// ============================================================================

/// ドアベルターゲット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellTarget {
    /// コマンドリング（ドアベル 0 専用）
    CommandRing,
    /// 制御エンドポイント0
    ControlEndpoint0,
    /// OUT エンドポイント n
    OutEndpoint(u8),
    /// IN エンドポイント n
    InEndpoint(u8),
}

impl DoorbellTarget {
    /// ターゲット値（DB Target フィールド）
    pub fn target_value(&self) -> u8 {
        match self {
            Self::CommandRing => 0,
            Self::ControlEndpoint0 => 1,
            // OUT EP n -> DCI = 2n, IN EP n -> DCI = 2n + 1
            Self::OutEndpoint(ep) => (*ep & 0x0F) * 2,
            Self::InEndpoint(ep) => (*ep & 0x0F) * 2 + 1,
        }
    }

    pub fn from_endpoint(address: EndpointAddress) -> Self {
        match (address.number(), address.is_in()) {
            (0, _) => Self::ControlEndpoint0,
            (n, true) => Self::InEndpoint(n),
            (n, false) => Self::OutEndpoint(n),
        }
    }

    /// DCI からターゲットを作成（1..=31）
    pub fn from_dci(dci: u8) -> Option<Self> {
        match dci {
            1 => Some(Self::ControlEndpoint0),
            2..=31 if dci % 2 == 0 => Some(Self::OutEndpoint(dci / 2)),
            3..=31 => Some(Self::InEndpoint(dci / 2)),
            _ => None,
        }
    }
}

/// ストリームID（Bulk Streams用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamId(pub u16);

impl StreamId {
    /// プライマリストリーム（ストリーム非使用）
    pub const PRIMARY: Self = Self(0);

    pub fn value(&self) -> u16 {
        self.0
    }
}

// ============================================================================
// Doorbell Manager
// ============================================================================

/// xHCI ドアベルマネージャ
#[derive(Debug)]
pub struct XhciDoorbellManager {
    /// ドアベルアレイのオフセット（DBOFF）
    doorbell_offset: usize,
    /// 有効化したスロット数
    max_slots: u8,
    /// ドアベル発行カウンタ
    ring_count: AtomicU32,
}

impl XhciDoorbellManager {
    pub fn new(doorbell_offset: usize, max_slots: u8) -> Self {
        Self {
            doorbell_offset,
            max_slots,
            ring_count: AtomicU32::new(0),
        }
    }

    fn ring(&self, io: &impl RegisterIo, doorbell: u8, target: u8, stream: StreamId) {
        let offset = self.doorbell_offset + doorbell as usize * DOORBELL_SIZE;
        let value = (target as u32) | ((stream.value() as u32) << 16);

        #[cfg(feature = "verbose_logging")]
        trace!("xhci: doorbell {} <- {:#x}", doorbell, value);

        io.write32(offset, value);
        self.ring_count.fetch_add(1, Ordering::Relaxed);
    }

    /// コマンドリングのドアベルを鳴らす
    pub fn ring_command(&self, io: &impl RegisterIo) {
        self.ring(io, 0, DoorbellTarget::CommandRing.target_value(), StreamId::PRIMARY);
    }

    /// エンドポイントの転送リングのドアベルを鳴らす
    pub fn ring_endpoint(
        &self,
        io: &impl RegisterIo,
        slot: SlotId,
        target: DoorbellTarget,
        stream: StreamId,
    ) -> XhciResult<()> {
        if !slot.is_valid() || slot.as_u8() > self.max_slots {
            return Err(XhciError::InvalidSlot(slot));
        }
        if target == DoorbellTarget::CommandRing {
            return Err(XhciError::InvalidParameter("command ring target on device doorbell"));
        }
        self.ring(io, slot.as_u8(), target.target_value(), stream);
        Ok(())
    }

    /// 総ドアベル発行回数
    pub fn total_rings(&self) -> u32 {
        self.ring_count.load(Ordering::Relaxed)
    }
}
