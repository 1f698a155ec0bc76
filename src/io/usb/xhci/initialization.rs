// ============================================================================
// src/io/usb/xhci/initialization.rs - xHCI Controller Initialization
// ============================================================================
//!
//! xHCI コントローラの初期化シーケンス。
//!
//! ## 初期化フロー
//! 1. ケーパビリティレジスタ読み取り（`XhciController::new`）
//! 2. コントローラ停止（HCHalted 待ち）
//! 3. HCRST によるリセット（HCRST=0 かつ CNR=0 待ち）
//! 4. CONFIG.MaxSlotsEn 設定
//! 5. DCBAA（とスクラッチパッド）の確保、DCBAAP 設定
//! 6. コマンドリングの確保、CRCR 設定（RCS=1）
//! 7. イベントリングと ERST の確保、インタラプタ 0 に登録
//! 8. 割り込み有効化と Run/Stop、HCHalted のクリア待ち
//!
//! レジスタ条件待ちはすべて有限回。どのステップの失敗も
//! `ControllerInitFailed { step, .. }` として返し、先へ進まない。

use log::{debug, error, info};

use super::dcbaa::DeviceContextArray;
use super::registers::{
    CapabilityRegisters, InterrupterRegisters, OperationalRegisters, UsbCommand, UsbStatus,
};
use super::ring_manager::{EventRing, ProducerRing, RingType};
use crate::config::XhciConfig;
use crate::error::{InitStep, XhciError, XhciResult};
use crate::io::dma::PhysicalMemoryMapper;
use crate::io::mmio::RegisterIo;

/// DNCTRL: Function Wake 通知のみ有効化
const DEVICE_NOTIFICATION_FUNCTION_WAKE: u16 = 1 << 1;

/// 条件が成立するまで最大 `limit` 回ポーリングする
///
/// 成立までに要したポーリング回数を返す。
pub fn poll_until(
    limit: u32,
    register: &'static str,
    condition: &'static str,
    mut check: impl FnMut() -> bool,
) -> XhciResult<u32> {
    for attempt in 1..=limit {
        if check() {
            return Ok(attempt);
        }
        core::hint::spin_loop();
    }
    Err(XhciError::RegisterTimeout {
        register,
        condition,
    })
}

/// 初期化で確保したハードウェア共有構造体
pub struct InitializedHardware {
    pub dcbaa: DeviceContextArray,
    pub command_ring: ProducerRing,
    pub event_ring: EventRing,
    pub max_slots_enabled: u8,
    pub page_size: usize,
}

/// 初期化シーケンス（ステップ 2〜8）
pub struct Initializer<'a, R: RegisterIo> {
    io: &'a R,
    caps: &'a CapabilityRegisters,
    config: &'a XhciConfig,
    mapper: PhysicalMemoryMapper,
}

impl<'a, R: RegisterIo> Initializer<'a, R> {
    pub fn new(io: &'a R, caps: &'a CapabilityRegisters, config: &'a XhciConfig) -> Self {
        Self {
            io,
            caps,
            config,
            mapper: PhysicalMemoryMapper::new(config.physical_memory_offset),
        }
    }

    fn operational(&self) -> OperationalRegisters<'a, R> {
        OperationalRegisters::new(self.io, self.caps.operational_offset())
    }

    /// ステップ 2〜8 を順に実行
    pub fn run(&self) -> XhciResult<InitializedHardware> {
        let result = self.run_steps();
        if let Err(err) = &result {
            error!("xhci: {}", err);
        }
        result
    }

    fn run_steps(&self) -> XhciResult<InitializedHardware> {
        if !self.config.validate() {
            return Err(XhciError::InvalidParameter("config").during(InitStep::ValidateConfig));
        }

        self.halt().map_err(|e| e.during(InitStep::Halt))?;
        self.reset().map_err(|e| e.during(InitStep::Reset))?;
        let max_slots_enabled = self
            .configure_slots()
            .map_err(|e| e.during(InitStep::ConfigureSlots))?;

        let page_size = self.operational().page_size();
        let dcbaa = self
            .setup_dcbaa(max_slots_enabled, page_size)
            .map_err(|e| e.during(InitStep::DeviceContextArray))?;
        let command_ring = self
            .setup_command_ring()
            .map_err(|e| e.during(InitStep::CommandRing))?;
        let event_ring = self
            .setup_event_ring()
            .map_err(|e| e.during(InitStep::EventRing))?;
        self.start().map_err(|e| e.during(InitStep::Start))?;

        info!(
            "xhci: running, {} slots enabled, page size {}",
            max_slots_enabled, page_size
        );
        Ok(InitializedHardware {
            dcbaa,
            command_ring,
            event_ring,
            max_slots_enabled,
            page_size,
        })
    }

    /// ステップ 2: 動作中なら停止し、HCHalted を待つ
    pub fn halt(&self) -> XhciResult<u32> {
        let op = self.operational();
        if !op.usbsts().contains(UsbStatus::HCH) {
            op.update_usbcmd(UsbCommand::empty(), UsbCommand::RUN);
        }
        poll_until(self.config.poll_limit, "USBSTS", "HCH=1", || {
            op.usbsts().contains(UsbStatus::HCH)
        })
    }

    /// ステップ 3: HCRST を立て、HCRST=0 かつ CNR=0 を待つ
    fn reset(&self) -> XhciResult<()> {
        let op = self.operational();
        op.update_usbcmd(UsbCommand::HCRST, UsbCommand::empty());
        let polls = poll_until(self.config.poll_limit, "USBCMD", "HCRST=0", || {
            !op.usbcmd().contains(UsbCommand::HCRST)
        })?;
        poll_until(self.config.poll_limit, "USBSTS", "CNR=0", || {
            !op.usbsts().contains(UsbStatus::CNR)
        })?;
        debug!("xhci: reset complete after {} polls", polls);
        Ok(())
    }

    /// ステップ 4: MaxSlotsEn = min(要求値, MaxSlots)
    fn configure_slots(&self) -> XhciResult<u8> {
        let slots = self.config.max_slots.min(self.caps.max_slots());
        if slots == 0 {
            return Err(XhciError::InvalidParameter("max slots"));
        }
        let op = self.operational();
        op.set_max_slots_enabled(slots);
        Ok(slots)
    }

    /// ステップ 5: DCBAA とスクラッチパッド
    fn setup_dcbaa(&self, max_slots: u8, page_size: usize) -> XhciResult<DeviceContextArray> {
        let dcbaa = DeviceContextArray::allocate(
            max_slots,
            self.caps.max_scratchpad_buffers(),
            page_size,
            &self.mapper,
        )?;
        self.operational().set_dcbaap(dcbaa.phys_addr());
        Ok(dcbaa)
    }

    /// ステップ 6: コマンドリング（CRR=0 の間だけポインタを書く）
    fn setup_command_ring(&self) -> XhciResult<ProducerRing> {
        let ring = ProducerRing::new(self.config.command_ring_size, RingType::Command, &self.mapper)?;
        self.operational()
            .set_command_ring(ring.phys_addr(), ring.cycle_bit())?;
        Ok(ring)
    }

    /// ステップ 7: イベントリングをインタラプタ 0 に登録
    fn setup_event_ring(&self) -> XhciResult<EventRing> {
        let ring = EventRing::new(self.config.event_ring_size, &self.mapper)?;
        let erst_max = 1u32 << self.caps.erst_max();
        if ring.erst_len() > erst_max {
            return Err(XhciError::InvalidParameter("ERST size"));
        }

        let interrupter = InterrupterRegisters::new(self.io, self.caps.runtime_offset(), 0);
        interrupter.set_event_ring(
            ring.erst_len() as u16,
            ring.erst_phys_addr(),
            ring.dequeue_pointer(),
        );
        interrupter.set_moderation(self.config.interrupt_moderation);
        interrupter.set_interrupt_enable(true);
        Ok(ring)
    }

    /// ステップ 8: INTE / HSEE / RS を立て、HCHalted のクリアを待つ
    fn start(&self) -> XhciResult<()> {
        let op = self.operational();
        op.set_dnctrl(DEVICE_NOTIFICATION_FUNCTION_WAKE);
        op.update_usbcmd(
            UsbCommand::RUN | UsbCommand::INTE | UsbCommand::HSEE,
            UsbCommand::empty(),
        );
        poll_until(self.config.poll_limit, "USBSTS", "HCH=0", || {
            !op.usbsts().contains(UsbStatus::HCH)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::usb::xhci::sim::SimulatedController;

    #[test]
    fn test_poll_until_counts_attempts() {
        let mut remaining = 3;
        let polls = poll_until(10, "USBCMD", "HCRST=0", || {
            remaining -= 1;
            remaining == 0
        });
        assert_eq!(polls, Ok(3));

        assert_eq!(
            poll_until(5, "USBSTS", "HCH=1", || false),
            Err(XhciError::RegisterTimeout {
                register: "USBSTS",
                condition: "HCH=1",
            })
        );
    }

    #[test]
    fn test_halt_times_out_when_hch_never_sets() {
        let sim = SimulatedController::new();
        sim.set_running(true);
        sim.set_halt_never_sets(true);
        let caps = CapabilityRegisters::read(&sim);
        let config = XhciConfig {
            poll_limit: 20,
            ..XhciConfig::default()
        };

        let init = Initializer::new(&sim, &caps, &config);
        assert!(matches!(
            init.halt(),
            Err(XhciError::RegisterTimeout { register: "USBSTS", .. })
        ));
        match init.run() {
            Err(XhciError::ControllerInitFailed { step, .. }) => assert_eq!(step, InitStep::Halt),
            other => panic!("unexpected {:?}", other.map(|hw| hw.max_slots_enabled)),
        }
    }

    #[test]
    fn test_reset_timeout_reports_reset_step() {
        let sim = SimulatedController::new();
        sim.set_reset_polls(1000);
        let caps = CapabilityRegisters::read(&sim);
        let config = XhciConfig {
            poll_limit: 10,
            ..XhciConfig::default()
        };

        match Initializer::new(&sim, &caps, &config).run() {
            Err(XhciError::ControllerInitFailed { step, source }) => {
                assert_eq!(step, InitStep::Reset);
                assert_eq!(
                    *source,
                    XhciError::RegisterTimeout {
                        register: "USBCMD",
                        condition: "HCRST=0",
                    }
                );
            }
            other => panic!("unexpected {:?}", other.map(|hw| hw.max_slots_enabled)),
        }
    }

    #[test]
    fn test_invalid_config_fails_before_touching_hardware() {
        let sim = SimulatedController::new();
        let caps = CapabilityRegisters::read(&sim);
        let config = XhciConfig {
            max_slots: 0,
            ..XhciConfig::default()
        };
        match Initializer::new(&sim, &caps, &config).run() {
            Err(XhciError::ControllerInitFailed { step, .. }) => {
                assert_eq!(step, InitStep::ValidateConfig)
            }
            other => panic!("unexpected {:?}", other.map(|hw| hw.max_slots_enabled)),
        }
        assert_eq!(sim.reset_count(), 0);
    }

    #[test]
    fn test_event_ring_registered_with_interrupter() {
        let sim = SimulatedController::new();
        let caps = CapabilityRegisters::read(&sim);
        let config = XhciConfig::default();
        let hw = Initializer::new(&sim, &caps, &config).run().unwrap();

        let interrupter = InterrupterRegisters::new(&sim, caps.runtime_offset(), 0);
        assert_eq!(interrupter.erstsz(), 1);
        assert_eq!(interrupter.erstba(), hw.event_ring.erst_phys_addr());
        assert_eq!(interrupter.erdp() & !0xF, hw.event_ring.segment_phys_addr());
        assert_eq!(interrupter.imod(), config.interrupt_moderation as u32);
        assert_eq!(interrupter.iman() & crate::io::usb::xhci::registers::IMAN_IE, 0x2);
    }
}
