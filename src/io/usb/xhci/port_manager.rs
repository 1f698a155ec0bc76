// ============================================================================
// src/io/usb/xhci/port_manager.rs - xHCI Port Management
// ============================================================================
//!
//! # xHCI ポート管理
//!
//! ルートハブポートの監視、リセット、状態管理を担当。
//!
//! - 変更ビット (W1C) のクリアはポートごとのロックで直列化する
//!   （同じビットを 2 つの経路が同時にクリアしない）
//! - PORTSC の読み取りはコマンド処理と並行してよい
//! - ポートリセットの完了待ちは有限回のポーリングで、タイムアウトは回復可能なエラー

use alloc::vec::Vec;

use log::{debug, warn};
use spin::Mutex;

use super::initialization::poll_until;
use super::registers::{OperationalRegisters, PORTSC_PRC, PORTSC_W1C_BITS, PortStatus};
use crate::error::{XhciError, XhciResult};
use crate::io::mmio::RegisterIo;
use crate::io::usb::{PortNumber, SlotId, UsbSpeed};

// ============================================================================
// Port Link State
// ============================================================================

/// ポートリンク状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortLinkState {
    /// U0 - Active
    U0 = 0,
    /// U1 - Low power state (USB3)
    U1 = 1,
    /// U2 - Deeper low power (USB3)
    U2 = 2,
    /// U3 - Suspended
    U3 = 3,
    Disabled = 4,
    RxDetect = 5,
    Inactive = 6,
    Polling = 7,
    Recovery = 8,
    HotReset = 9,
    ComplianceMode = 10,
    TestMode = 11,
    Resume = 15,
}

impl PortLinkState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::U0),
            1 => Some(Self::U1),
            2 => Some(Self::U2),
            3 => Some(Self::U3),
            4 => Some(Self::Disabled),
            5 => Some(Self::RxDetect),
            6 => Some(Self::Inactive),
            7 => Some(Self::Polling),
            8 => Some(Self::Recovery),
            9 => Some(Self::HotReset),
            10 => Some(Self::ComplianceMode),
            11 => Some(Self::TestMode),
            15 => Some(Self::Resume),
            _ => None,
        }
    }
}

// ============================================================================
// Port Events
// ============================================================================

/// ポート変更の種類（複数立っている場合は優先度の高いもの）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChangeEvent {
    /// デバイス接続
    Connected,
    /// デバイス切断
    Disconnected,
    /// リセット完了
    ResetComplete,
    /// 過電流検出
    OverCurrent,
    /// その他の変更（PEC / PLC / WRC / CEC）
    Other,
}

/// ポート状態変更の通知内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChange {
    pub port: PortNumber,
    pub event: PortChangeEvent,
    /// クリア前の PORTSC スナップショット
    pub status: PortStatus,
}

impl PortChange {
    pub fn from_status(port: PortNumber, status: PortStatus) -> Self {
        let event = if status.over_current_changed() && status.over_current() {
            PortChangeEvent::OverCurrent
        } else if status.connect_changed() {
            if status.connected() {
                PortChangeEvent::Connected
            } else {
                PortChangeEvent::Disconnected
            }
        } else if status.reset_changed() && status.enabled() {
            PortChangeEvent::ResetComplete
        } else {
            PortChangeEvent::Other
        };
        Self { port, event, status }
    }

    /// ネゴシエート済みの速度
    pub fn speed(&self) -> Option<UsbSpeed> {
        self.status.speed()
    }
}

// ============================================================================
// Port Manager
// ============================================================================

/// ポートごとのソフトウェア状態（ロックで保護）
#[derive(Debug, Clone, Copy)]
struct PortRecord {
    /// 最後に観測した PORTSC
    last_status: PortStatus,
    /// 割り当てられたスロット
    slot: Option<SlotId>,
}

/// xHCI ポートマネージャ
pub struct XhciPortManager {
    /// オペレーショナルレジスタのオフセット
    operational_base: usize,
    /// レジスタ条件待ちの最大ポーリング回数
    poll_limit: u32,
    ports: Vec<Mutex<PortRecord>>,
}

impl XhciPortManager {
    pub fn new(operational_base: usize, num_ports: u8, poll_limit: u32) -> Self {
        let ports = (0..num_ports)
            .map(|_| {
                Mutex::new(PortRecord {
                    last_status: PortStatus(0),
                    slot: None,
                })
            })
            .collect();
        Self {
            operational_base,
            poll_limit,
            ports,
        }
    }

    pub fn port_count(&self) -> u8 {
        self.ports.len() as u8
    }

    fn record(&self, port: PortNumber) -> XhciResult<&Mutex<PortRecord>> {
        if port.as_u8() == 0 {
            return Err(XhciError::InvalidPort(port));
        }
        self.ports.get(port.index()).ok_or(XhciError::InvalidPort(port))
    }

    fn registers<'a, R: RegisterIo>(&self, io: &'a R) -> OperationalRegisters<'a, R> {
        OperationalRegisters::new(io, self.operational_base)
    }

    /// PORTSC を読み取る（ロック不要）
    pub fn status<R: RegisterIo>(&self, io: &R, port: PortNumber) -> XhciResult<PortStatus> {
        self.record(port)?;
        Ok(self.registers(io).port(port.as_u8()).portsc())
    }

    /// 現在のリンク状態
    pub fn link_state<R: RegisterIo>(&self, io: &R, port: PortNumber) -> XhciResult<Option<PortLinkState>> {
        self.status(io, port)
            .map(|status| PortLinkState::from_u8(status.link_state()))
    }

    /// 最後に観測した PORTSC
    pub fn last_status(&self, port: PortNumber) -> XhciResult<PortStatus> {
        Ok(self.record(port)?.lock().last_status)
    }

    /// ポート状態変更を処理
    ///
    /// 変更ビットが立っていれば、立っていたビットだけを W1C でクリアして
    /// 変更内容を返す。立っていなければ `None`（重複通知しない）。
    pub fn handle_change<R: RegisterIo>(&self, io: &R, port: PortNumber) -> XhciResult<Option<PortChange>> {
        let mut record = self.record(port)?.lock();
        let regs = self.registers(io).port(port.as_u8());
        let status = regs.portsc();
        record.last_status = status;

        if !status.has_changes() {
            return Ok(None);
        }
        regs.clear_change_bits(status);

        let change = PortChange::from_status(port, status);
        if change.event == PortChangeEvent::Disconnected {
            record.slot = None;
        }
        debug!(
            "xhci: port {} {:?} (portsc={:#010x})",
            port.as_u8(),
            change.event,
            status.raw()
        );
        Ok(Some(change))
    }

    /// 電源の入っていないポートに電源を入れる
    pub fn power_on_all<R: RegisterIo>(&self, io: &R) -> usize {
        let regs = self.registers(io);
        let mut powered = 0;
        for number in 1..=self.port_count() {
            let port = regs.port(number);
            if !port.portsc().powered() {
                port.power_on();
                powered += 1;
            }
        }
        if powered > 0 {
            debug!("xhci: powered on {} ports", powered);
        }
        powered
    }

    /// 全ポートを走査し、接続済みポートを返す
    ///
    /// 立っている変更ビットはクリアする。
    pub fn scan<R: RegisterIo>(&self, io: &R) -> Vec<PortChange> {
        let mut connected = Vec::new();
        for number in 1..=self.port_count() {
            let port = PortNumber(number);
            let change = match self.handle_change(io, port) {
                Ok(Some(change)) => change,
                Ok(None) => PortChange {
                    port,
                    event: PortChangeEvent::Connected,
                    status: self.last_status(port).unwrap_or(PortStatus(0)),
                },
                Err(_) => continue,
            };
            if change.status.connected() {
                connected.push(PortChange {
                    event: PortChangeEvent::Connected,
                    ..change
                });
            }
        }
        connected
    }

    /// ポートをリセットし、完了を待つ
    ///
    /// 完了時は PRC だけをクリアする（他の変更ビットはイベント経路に残す）。
    pub fn reset_port<R: RegisterIo>(&self, io: &R, port: PortNumber) -> XhciResult<UsbSpeed> {
        let mut record = self.record(port)?.lock();
        let regs = self.registers(io).port(port.as_u8());

        let status = regs.portsc();
        if !status.connected() {
            return Err(XhciError::InvalidParameter("no device on port"));
        }
        regs.start_reset();

        let wait = poll_until(self.poll_limit, "PORTSC", "PR=0", || !regs.portsc().in_reset());
        if let Err(err) = wait {
            warn!("xhci: port {} reset timed out", port.as_u8());
            return Err(err);
        }

        let status = regs.portsc();
        record.last_status = status;
        if status.reset_changed() {
            let others = PORTSC_W1C_BITS & !PORTSC_PRC;
            regs.clear_change_bits(PortStatus(status.raw() & !others));
        }
        if !status.enabled() {
            return Err(XhciError::InvalidParameter("port not enabled after reset"));
        }
        status
            .speed()
            .ok_or(XhciError::InvalidParameter("unknown port speed"))
    }

    // ========================================================================
    // スロット割り当て
    // ========================================================================

    pub fn assign_slot(&self, port: PortNumber, slot: SlotId) -> XhciResult<()> {
        self.record(port)?.lock().slot = Some(slot);
        Ok(())
    }

    pub fn release_slot(&self, slot: SlotId) {
        for record in &self.ports {
            let mut record = record.lock();
            if record.slot == Some(slot) {
                record.slot = None;
            }
        }
    }

    pub fn slot_of(&self, port: PortNumber) -> Option<SlotId> {
        self.record(port).ok()?.lock().slot
    }

    pub fn find_port_by_slot(&self, slot: SlotId) -> Option<PortNumber> {
        self.ports
            .iter()
            .position(|record| record.lock().slot == Some(slot))
            .map(|index| PortNumber(index as u8 + 1))
    }
}
