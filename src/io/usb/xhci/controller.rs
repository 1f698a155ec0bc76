// ============================================================================
// src/io/usb/xhci/controller.rs - xHCI Host Controller
// ============================================================================
//!
//! xHCI ホストコントローラの実装。
//!
//! ## 機能
//! - コントローラ初期化と停止
//! - コマンド発行（`async fn`）とイベントリング経由の完了通知
//! - ポート状態管理と通知
//! - 転送TRBのエンキューとドアベル
//!
//! ## ロック順序
//! コマンド発行: `slots` → `command_ring` → トラッカー内部。
//! イベント処理: 各ロックを一つずつ取り、入れ子にしない
//! （失敗したスロットの解放だけはコマンド発行と同じ順序で取る）。
//! オブザーバはイベントリングの処理後、ロックを一切保持せずに呼び出す。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use hashbrown::HashMap;
use log::{debug, error, info, warn};
use spin::{Mutex, RwLock};

use super::command::{
    CommandCompletion, CommandFuture, CommandKind, CommandResources, CommandToken, CommandTracker,
};
use super::context::{
    control_endpoint_context, DeviceContextBuffer, EndpointContext, EndpointType,
    InputContextBuffer, InputControlContext, SlotContext,
};
use super::dcbaa::DeviceContextArray;
use super::doorbell_manager::{DoorbellTarget, StreamId, XhciDoorbellManager};
use super::event_handler::{CommandCompletionEvent, DrainSummary, ProcessedEvent, TransferEvent};
use super::initialization::{InitializedHardware, Initializer};
use super::port_manager::{PortChange, XhciPortManager};
use super::registers::{
    CapabilityRegisters, InterrupterRegisters, OperationalRegisters, PortStatus, UsbCommand,
    UsbStatus, IMAN_IP,
};
use super::ring_manager::{EventRing, ProducerRing, RingType};
use super::slot_manager::{SlotManager, SlotOutcome, SlotState};
use super::trb::Trb;
use super::{ControllerStatus, PortObserver, TransferObserver};
use crate::config::XhciConfig;
use crate::error::{HostErrorKind, XhciError, XhciResult};
use crate::io::dma::PhysicalMemoryMapper;
use crate::io::mmio::RegisterIo;
use crate::io::usb::{
    EndpointAddress, EndpointDescriptor, PortNumber, SlotId, TransferType, UsbSpeed,
};

/// バルクエンドポイントの平均TRB長
const BULK_AVERAGE_TRB_LENGTH: u16 = 3072;
/// エンドポイントのエラーカウンタ初期値
const ENDPOINT_ERROR_COUNT: u8 = 3;

// ============================================================================
// Runtime State
// ============================================================================

/// アドレス割り当て済みデバイスの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceInfo {
    port: PortNumber,
    speed: UsbSpeed,
}

/// 初期化後にのみ存在するハードウェア共有構造体
struct Runtime {
    dcbaa: Mutex<DeviceContextArray>,
    command_ring: Mutex<ProducerRing>,
    event_ring: Mutex<EventRing>,
    slots: Mutex<SlotManager>,
    /// (スロット, DCI) ごとの転送リング
    transfer_rings: Mutex<HashMap<(SlotId, u8), ProducerRing>>,
    devices: Mutex<HashMap<SlotId, DeviceInfo>>,
    max_slots_enabled: u8,
}

impl Runtime {
    fn new(hw: InitializedHardware) -> Self {
        Self {
            dcbaa: Mutex::new(hw.dcbaa),
            command_ring: Mutex::new(hw.command_ring),
            event_ring: Mutex::new(hw.event_ring),
            slots: Mutex::new(SlotManager::new(hw.max_slots_enabled)),
            transfer_rings: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            max_slots_enabled: hw.max_slots_enabled,
        }
    }
}

// ============================================================================
// xHCI Controller
// ============================================================================

/// xHCIコントローラ
pub struct XhciController<R: RegisterIo> {
    io: R,
    config: XhciConfig,
    caps: CapabilityRegisters,
    mapper: PhysicalMemoryMapper,
    status: AtomicU8,
    /// 検出済みの致命的エラー
    fault: Mutex<Option<HostErrorKind>>,
    doorbells: XhciDoorbellManager,
    ports: XhciPortManager,
    commands: CommandTracker,
    runtime: RwLock<Option<Runtime>>,
    port_observer: Mutex<Option<Arc<dyn PortObserver>>>,
    transfer_observer: Mutex<Option<Arc<dyn TransferObserver>>>,
}

impl<R: RegisterIo> XhciController<R> {
    /// ケーパビリティレジスタを読み取り、未初期化のコントローラを作成
    pub fn new(io: R, config: XhciConfig) -> Self {
        let caps = CapabilityRegisters::read(&io);
        info!(
            "xhci: version {:#06x}, {} slots, {} ports, {} interrupters, {} scratchpads, {}-byte contexts",
            caps.hci_version(),
            caps.max_slots(),
            caps.max_ports(),
            caps.max_interrupters(),
            caps.max_scratchpad_buffers(),
            caps.context_size()
        );

        Self {
            doorbells: XhciDoorbellManager::new(caps.doorbell_offset(), caps.max_slots()),
            ports: XhciPortManager::new(caps.operational_offset(), caps.max_ports(), config.poll_limit),
            mapper: PhysicalMemoryMapper::new(config.physical_memory_offset),
            io,
            config,
            caps,
            status: AtomicU8::new(ControllerStatus::ControllerNotInitialized as u8),
            fault: Mutex::new(None),
            commands: CommandTracker::new(),
            runtime: RwLock::new(None),
            port_observer: Mutex::new(None),
            transfer_observer: Mutex::new(None),
        }
    }

    // ========================================================================
    // 状態と設定
    // ========================================================================

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ControllerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn capabilities(&self) -> &CapabilityRegisters {
        &self.caps
    }

    pub fn config(&self) -> &XhciConfig {
        &self.config
    }

    pub fn set_port_observer(&self, observer: Arc<dyn PortObserver>) {
        *self.port_observer.lock() = Some(observer);
    }

    pub fn set_transfer_observer(&self, observer: Arc<dyn TransferObserver>) {
        *self.transfer_observer.lock() = Some(observer);
    }

    /// CONFIG.MaxSlotsEn に設定した値（初期化前は `None`）
    pub fn max_slots_enabled(&self) -> Option<u8> {
        self.runtime.read().as_ref().map(|rt| rt.max_slots_enabled)
    }

    /// 完了待ちのコマンド数
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn slot_state(&self, slot: SlotId) -> XhciResult<SlotState> {
        let runtime = self.runtime.read();
        let rt = runtime.as_ref().ok_or(XhciError::NotInitialized)?;
        let state = rt.slots.lock().state(slot)?;
        Ok(state)
    }

    /// スロットにバインドされたデバイスコンテキストの物理アドレス
    pub fn device_context_address(&self, slot: SlotId) -> Option<u64> {
        let runtime = self.runtime.read();
        let entry = runtime.as_ref()?.dcbaa.lock().entry(slot);
        (entry != 0).then_some(entry)
    }

    /// コマンドリングの物理アドレス
    pub fn command_ring_address(&self) -> Option<u64> {
        let runtime = self.runtime.read();
        Some(runtime.as_ref()?.command_ring.lock().phys_addr())
    }

    fn operational(&self) -> OperationalRegisters<'_, R> {
        OperationalRegisters::new(&self.io, self.caps.operational_offset())
    }

    fn interrupter(&self) -> InterrupterRegisters<'_, R> {
        InterrupterRegisters::new(&self.io, self.caps.runtime_offset(), 0)
    }

    fn ensure_running(&self) -> XhciResult<()> {
        match self.status() {
            ControllerStatus::ControllerInitialized => Ok(()),
            ControllerStatus::ControllerNotInitialized => Err(XhciError::NotInitialized),
            ControllerStatus::ControllerError => Err(XhciError::ControllerError(
                self.fault.lock().unwrap_or(HostErrorKind::HostControllerError),
            )),
        }
    }

    // ========================================================================
    // 初期化と停止
    // ========================================================================

    /// コントローラを初期化して動作させる
    ///
    /// 失敗時はどのステップで失敗したかを `ControllerInitFailed` で返し、
    /// 状態は `ControllerNotInitialized` のままとなる。
    pub fn initialize(&self) -> XhciResult<()> {
        if self.status() == ControllerStatus::ControllerInitialized {
            return Err(XhciError::InvalidParameter("controller already initialized"));
        }

        {
            let mut runtime = self.runtime.write();
            let hw = match Initializer::new(&self.io, &self.caps, &self.config).run() {
                Ok(hw) => hw,
                Err(err) => {
                    self.set_status(ControllerStatus::ControllerNotInitialized);
                    return Err(err);
                }
            };

            // 旧構造体はリセット済みのハードウェアからもう参照されない
            self.commands.cancel_all();
            *runtime = Some(Runtime::new(hw));
            *self.fault.lock() = None;
            self.set_status(ControllerStatus::ControllerInitialized);
        }

        let powered = self.ports.power_on_all(&self.io);
        if powered > 0 {
            debug!("xhci: powered {} ports", powered);
        }
        self.scan_ports()?;
        Ok(())
    }

    /// コントローラを停止して共有構造体を解放する
    ///
    /// HCHalted が立たなければエラーを返し、構造体は解放しない。
    pub fn shutdown(&self) -> XhciResult<()> {
        let mut runtime = self.runtime.write();
        if runtime.is_none() {
            self.set_status(ControllerStatus::ControllerNotInitialized);
            return Ok(());
        }

        self.interrupter().set_interrupt_enable(false);
        self.operational()
            .update_usbcmd(UsbCommand::empty(), UsbCommand::INTE);
        Initializer::new(&self.io, &self.caps, &self.config)
            .halt()
            .inspect_err(|err| error!("xhci: shutdown failed: {}", err))?;

        self.set_status(ControllerStatus::ControllerNotInitialized);
        let cancelled = self.commands.cancel_all();
        if let Some(rt) = runtime.take() {
            for slot in rt.devices.lock().keys() {
                self.ports.release_slot(*slot);
            }
        }
        self.operational().set_dcbaap(0);
        info!("xhci: halted, {} pending commands cancelled", cancelled);
        Ok(())
    }

    // ========================================================================
    // ポート
    // ========================================================================

    pub fn port_status(&self, port: PortNumber) -> XhciResult<PortStatus> {
        self.ports.status(&self.io, port)
    }

    /// ポートをリセットし、ネゴシエートされた速度を返す
    pub fn reset_port(&self, port: PortNumber) -> XhciResult<UsbSpeed> {
        self.ensure_running()?;
        self.ports.reset_port(&self.io, port)
    }

    /// 接続済みポートを走査し、各ポートをオブザーバに通知する
    pub fn scan_ports(&self) -> XhciResult<Vec<PortChange>> {
        self.ensure_running()?;
        let connected = self.ports.scan(&self.io);
        for change in &connected {
            self.notify_port(*change);
        }
        Ok(connected)
    }

    pub fn port_of_slot(&self, slot: SlotId) -> Option<PortNumber> {
        self.ports.find_port_by_slot(slot)
    }

    fn notify_port(&self, change: PortChange) {
        let observer = self.port_observer.lock().clone();
        match observer {
            Some(observer) => observer.port_changed(change),
            None => debug!("xhci: port {} {:?} (no observer)", change.port.as_u8(), change.event),
        }
    }

    // ========================================================================
    // コマンド
    // ========================================================================

    /// コマンドTRBをエンキューしてドアベル 0 を鳴らす
    ///
    /// 完了は `process_events` からのみ解決される。
    fn submit(
        &self,
        kind: CommandKind,
        trb: Trb,
        resources: CommandResources,
    ) -> XhciResult<CommandFuture<'_>> {
        self.ensure_running()?;
        let token = {
            let runtime = self.runtime.read();
            let rt = runtime.as_ref().ok_or(XhciError::NotInitialized)?;
            self.enqueue_command(rt, kind, trb, Some(resources))?
        };

        self.doorbells.ring_command(&self.io);
        debug!("xhci: {:?} queued at {:#x}", kind, token.trb_address());
        Ok(CommandFuture::new(&self.commands, token))
    }

    /// スロット状態の遷移、トラッカー登録、エンキューを一括で行う
    ///
    /// `resources` が `None` なら待ち手なしで登録する。
    /// 失敗時はスロット状態と登録を元に戻す。
    fn enqueue_command(
        &self,
        rt: &Runtime,
        kind: CommandKind,
        trb: Trb,
        resources: Option<CommandResources>,
    ) -> XhciResult<CommandToken> {
        let mut slots = rt.slots.lock();
        let mut ring = rt.command_ring.lock();
        if ring.is_full() {
            return Err(XhciError::RingFull);
        }

        let token = CommandToken(ring.enqueue_pointer());
        let previous = match kind.slot() {
            Some(slot) => Some(slots.state(slot)?),
            None => None,
        };
        begin_slot_command(&mut slots, kind, token)?;
        match resources {
            Some(resources) => self.commands.register(token, kind, resources),
            None => self.commands.register_detached(token, kind),
        }

        if let Err(err) = ring.enqueue(trb) {
            self.commands.forget(token);
            match (kind.slot(), previous) {
                (Some(slot), Some(previous)) => slots.abort(slot, token, previous),
                _ => slots.abort_enable(token),
            }
            return Err(err);
        }
        Ok(token)
    }

    /// 状態がコマンドを受け付けるか事前確認する
    fn check_slot(&self, slot: SlotId, accept: impl Fn(SlotState) -> bool) -> XhciResult<()> {
        let state = self.slot_state(slot)?;
        if accept(state) {
            Ok(())
        } else if state.is_pending() {
            Err(XhciError::SlotBusy(slot))
        } else {
            Err(XhciError::InvalidSlotState { slot, state })
        }
    }

    /// 出力デバイスコンテキストを確保して DCBAA にバインドする（バインド済みなら再利用）
    fn ensure_device_context(&self, slot: SlotId) -> XhciResult<()> {
        let runtime = self.runtime.read();
        let rt = runtime.as_ref().ok_or(XhciError::NotInitialized)?;
        let mut dcbaa = rt.dcbaa.lock();
        if dcbaa.context(slot).is_none() {
            let context = DeviceContextBuffer::new(self.caps.context_size(), &self.mapper)?;
            dcbaa.bind_slot_context(slot, context)?;
        }
        Ok(())
    }

    /// No Op コマンド
    pub async fn noop(&self) -> XhciResult<()> {
        let future = self.submit(CommandKind::NoOp, Trb::noop_command(), CommandResources::default())?;
        future.await?;
        Ok(())
    }

    /// Enable Slot: 割り当てられたスロットIDを返す
    pub async fn request_slot(&self) -> XhciResult<SlotId> {
        let future = self.submit(
            CommandKind::EnableSlot,
            Trb::enable_slot(),
            CommandResources::default(),
        )?;
        let completion: CommandCompletion = future.await?;
        self.ensure_device_context(completion.slot_id)?;
        info!("xhci: slot {} enabled", completion.slot_id.as_u8());
        Ok(completion.slot_id)
    }

    /// Address Device: ポートのデバイスにアドレスを割り当て、EP0 を有効化する
    pub async fn address_device(&self, slot: SlotId, port: PortNumber) -> XhciResult<()> {
        let status = self.ports.status(&self.io, port)?;
        if !status.enabled() {
            return Err(XhciError::InvalidParameter("port not enabled"));
        }
        let speed = status
            .speed()
            .ok_or(XhciError::InvalidParameter("unknown port speed"))?;
        self.check_slot(slot, |state| state == SlotState::Enabled)?;
        if let Some(owner) = self.ports.slot_of(port)
            && owner != slot
        {
            return Err(XhciError::InvalidParameter("port already has an addressed device"));
        }
        self.ensure_device_context(slot)?;

        let ring = ProducerRing::new(self.config.transfer_ring_size, RingType::Transfer, &self.mapper)?;
        let mut input = InputContextBuffer::new(self.caps.context_size(), &self.mapper)?;

        let mut control = InputControlContext::default();
        control.add_context(0);
        control.add_context(1);
        input.set_control(control);

        let mut slot_context = SlotContext::default();
        slot_context.set_route_string(0);
        slot_context.set_speed(speed.to_slot_speed());
        slot_context.set_context_entries(1);
        slot_context.set_root_hub_port(port.as_u8());
        slot_context.set_interrupter_target(0);
        input.set_slot(slot_context);
        input.set_endpoint(1, control_endpoint_context(speed, ring.phys_addr()))?;

        // ポートとの結び付けは成功完了時にイベント処理側で行う
        let trb = Trb::address_device(input.phys_addr(), slot, false);
        let future = self.submit(
            CommandKind::AddressDevice(slot),
            trb,
            CommandResources {
                input: Some(input),
                transfer_rings: vec![(1, ring)],
                port_binding: Some((port, speed)),
            },
        )?;

        future.await?;
        info!(
            "xhci: slot {} addressed on port {} ({:?})",
            slot.as_u8(),
            port.as_u8(),
            speed
        );
        Ok(())
    }

    /// Configure Endpoint: 非制御エンドポイントに転送リングを割り当てる
    pub async fn configure_endpoints(
        &self,
        slot: SlotId,
        endpoints: &[EndpointDescriptor],
    ) -> XhciResult<()> {
        for endpoint in endpoints {
            if endpoint.transfer_type() == TransferType::Isochronous {
                return Err(XhciError::UnsupportedEndpoint(endpoint.address.0));
            }
            if endpoint.address.number() == 0 {
                return Err(XhciError::InvalidParameter("endpoint 0 is configured by address_device"));
            }
        }
        if endpoints.is_empty() {
            return Err(XhciError::InvalidParameter("no endpoints"));
        }
        self.check_slot(slot, |state| {
            matches!(state, SlotState::Addressed | SlotState::Configured)
        })?;

        let (device, mut context_entries) = {
            let runtime = self.runtime.read();
            let rt = runtime.as_ref().ok_or(XhciError::NotInitialized)?;
            let device = rt
                .devices
                .lock()
                .get(&slot)
                .copied()
                .ok_or(XhciError::InvalidParameter("slot has no addressed device"))?;
            let entries = rt
                .transfer_rings
                .lock()
                .keys()
                .filter(|(s, _)| *s == slot)
                .map(|(_, dci)| *dci)
                .max()
                .unwrap_or(1);
            (device, entries)
        };

        let mut input = InputContextBuffer::new(self.caps.context_size(), &self.mapper)?;
        let mut control = InputControlContext::default();
        control.add_context(0);
        let mut rings = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let dci = endpoint.address.to_dci();
            let ring = ProducerRing::new(self.config.transfer_ring_size, RingType::Transfer, &self.mapper)?;
            input.set_endpoint(dci, endpoint_context(endpoint, device.speed, ring.phys_addr()))?;
            control.add_context(dci);
            context_entries = context_entries.max(dci);
            rings.push((dci, ring));
        }
        input.set_control(control);

        let mut slot_context = SlotContext::default();
        slot_context.set_speed(device.speed.to_slot_speed());
        slot_context.set_root_hub_port(device.port.as_u8());
        slot_context.set_context_entries(context_entries);
        input.set_slot(slot_context);

        let trb = Trb::configure_endpoint(input.phys_addr(), slot, false);
        let future = self.submit(
            CommandKind::ConfigureEndpoint(slot),
            trb,
            CommandResources {
                input: Some(input),
                transfer_rings: rings,
                ..CommandResources::default()
            },
        )?;
        future.await?;
        info!("xhci: slot {} configured {} endpoints", slot.as_u8(), endpoints.len());
        Ok(())
    }

    /// Disable Slot: 成功時にスロットの全資源を解放する
    ///
    /// コマンド失敗で Free に戻ったスロットでも、デバイスコンテキストが
    /// バインドされたままなら発行できる。
    pub async fn disable_slot(&self, slot: SlotId) -> XhciResult<()> {
        let kind = if self.slot_state(slot)? == SlotState::Free
            && self.device_context_address(slot).is_some()
        {
            CommandKind::ReleaseSlot(slot)
        } else {
            CommandKind::DisableSlot(slot)
        };
        let future = self.submit(kind, Trb::disable_slot(slot), CommandResources::default())?;
        future.await?;
        info!("xhci: slot {} disabled", slot.as_u8());
        Ok(())
    }

    /// Evaluate Context: EP0 の最大パケットサイズを更新する
    ///
    /// フルスピードデバイスでデバイスディスクリプタの bMaxPacketSize0 を読んだ後に使う。
    pub async fn update_control_max_packet(&self, slot: SlotId, max_packet_size: u16) -> XhciResult<()> {
        if max_packet_size == 0 {
            return Err(XhciError::InvalidParameter("max packet size"));
        }
        let mut input = InputContextBuffer::new(self.caps.context_size(), &self.mapper)?;
        let mut control = InputControlContext::default();
        control.add_context(1);
        input.set_control(control);
        let mut ep0 = EndpointContext::default();
        ep0.set_max_packet_size(max_packet_size);
        input.set_endpoint(1, ep0)?;

        let trb = Trb::evaluate_context(input.phys_addr(), slot);
        let future = self.submit(
            CommandKind::EvaluateContext(slot),
            trb,
            CommandResources {
                input: Some(input),
                ..CommandResources::default()
            },
        )?;
        future.await?;
        debug!("xhci: slot {} EP0 max packet {}", slot.as_u8(), max_packet_size);
        Ok(())
    }

    /// Stop Endpoint: エンドポイントの転送を停止する
    pub async fn stop_endpoint(&self, slot: SlotId, endpoint: EndpointAddress) -> XhciResult<()> {
        let dci = self.endpoint_dci(slot, endpoint)?;
        let future = self.submit(
            CommandKind::StopEndpoint(slot, dci),
            Trb::stop_endpoint(slot, dci),
            CommandResources::default(),
        )?;
        future.await?;
        Ok(())
    }

    /// Reset Endpoint: Halted のエンドポイントを Stopped に戻す
    pub async fn reset_endpoint(&self, slot: SlotId, endpoint: EndpointAddress) -> XhciResult<()> {
        let dci = self.endpoint_dci(slot, endpoint)?;
        let future = self.submit(
            CommandKind::ResetEndpoint(slot, dci),
            Trb::reset_endpoint(slot, dci),
            CommandResources::default(),
        )?;
        future.await?;
        Ok(())
    }

    /// 転送リングを持つエンドポイントの DCI
    fn endpoint_dci(&self, slot: SlotId, endpoint: EndpointAddress) -> XhciResult<u8> {
        let dci = endpoint.to_dci();
        let runtime = self.runtime.read();
        let rt = runtime.as_ref().ok_or(XhciError::NotInitialized)?;
        if rt.transfer_rings.lock().contains_key(&(slot, dci)) {
            Ok(dci)
        } else {
            Err(XhciError::InvalidParameter("endpoint has no transfer ring"))
        }
    }

    // ========================================================================
    // 転送
    // ========================================================================

    /// 転送TRBをエンキューしてエンドポイントのドアベルを鳴らす
    ///
    /// エンキューしたTRBの物理アドレスを返す。完了は `TransferObserver` に通知される。
    pub fn queue_transfer(&self, slot: SlotId, endpoint: EndpointAddress, trb: Trb) -> XhciResult<u64> {
        self.ensure_running()?;
        let address = {
            let runtime = self.runtime.read();
            let rt = runtime.as_ref().ok_or(XhciError::NotInitialized)?;
            let mut rings = rt.transfer_rings.lock();
            let ring = rings
                .get_mut(&(slot, endpoint.to_dci()))
                .ok_or(XhciError::InvalidParameter("endpoint has no transfer ring"))?;
            ring.enqueue(trb)?
        };
        self.doorbells.ring_endpoint(
            &self.io,
            slot,
            DoorbellTarget::from_endpoint(endpoint),
            StreamId::PRIMARY,
        )?;
        Ok(address)
    }

    // ========================================================================
    // イベント処理
    // ========================================================================

    /// 割り込みハンドラから呼ぶ: 保留中の割り込みがあればイベントを処理する
    pub fn handle_interrupt(&self) -> XhciResult<DrainSummary> {
        let status = self.operational().usbsts();
        let pending = self.interrupter().iman() & IMAN_IP != 0
            || status.intersects(UsbStatus::EINT | UsbStatus::HSE | UsbStatus::HCE);
        if !pending {
            return Ok(DrainSummary::default());
        }
        self.process_events()
    }

    /// イベントリングを空になるまで処理する
    ///
    /// 処理後に ERDP（EHB 付き）を更新し、EINT と IMAN.IP を確認応答する。
    pub fn process_events(&self) -> XhciResult<DrainSummary> {
        self.ensure_running()?;
        self.check_host_errors()?;

        let runtime = self.runtime.read();
        let rt = runtime.as_ref().ok_or(XhciError::NotInitialized)?;

        let mut summary = DrainSummary::default();
        let mut notifications = Vec::new();
        let mut release_queued = false;
        loop {
            let Some(trb) = rt.event_ring.lock().dequeue() else {
                break;
            };
            let event = ProcessedEvent::parse(&trb);
            summary.record(&event);
            match event {
                ProcessedEvent::CommandCompletion(event) => {
                    release_queued |= self.complete_command(rt, event);
                }
                other => notifications.extend(self.dispatch(rt, other)),
            }
        }

        let dequeue = rt.event_ring.lock().dequeue_pointer();
        drop(runtime);

        if release_queued {
            self.doorbells.ring_command(&self.io);
        }
        self.interrupter().update_dequeue_pointer(dequeue);
        self.operational().ack_usbsts(UsbStatus::EINT);
        self.interrupter().ack_interrupt_pending();

        for notification in notifications {
            match notification {
                Notification::Port(change) => self.notify_port(change),
                Notification::Transfer(event) => self.notify_transfer(event),
            }
        }

        if summary.total() > 0 {
            debug!("xhci: drained {:?}", summary);
        }
        Ok(summary)
    }

    fn check_host_errors(&self) -> XhciResult<()> {
        let status = self.operational().usbsts();
        let kind = if status.contains(UsbStatus::HSE) {
            HostErrorKind::HostSystemError
        } else if status.contains(UsbStatus::HCE) {
            HostErrorKind::HostControllerError
        } else {
            return Ok(());
        };
        Err(self.enter_error_state(kind))
    }

    /// 致命的エラー: 保留コマンドを全て破棄し、以後のコマンドを拒否する
    fn enter_error_state(&self, kind: HostErrorKind) -> XhciError {
        error!("xhci: {} detected, controller requires reinitialization", kind);
        *self.fault.lock() = Some(kind);
        self.set_status(ControllerStatus::ControllerError);
        let cancelled = self.commands.cancel_all();
        if cancelled > 0 {
            warn!("xhci: cancelled {} pending commands", cancelled);
        }
        XhciError::ControllerError(kind)
    }

    /// コマンド完了以外のイベントを処理し、通知すべきものを返す
    fn dispatch(&self, rt: &Runtime, event: ProcessedEvent) -> Option<Notification> {
        match event {
            ProcessedEvent::Transfer(event) => {
                self.complete_transfer(rt, &event);
                return Some(Notification::Transfer(event));
            }
            ProcessedEvent::PortStatusChange(event) => {
                match self.ports.handle_change(&self.io, event.port) {
                    Ok(Some(change)) => return Some(Notification::Port(change)),
                    Ok(None) => debug!("xhci: port {} event without change bits", event.port.as_u8()),
                    Err(err) => warn!("xhci: port status change: {}", err),
                }
            }
            ProcessedEvent::HostController { completion_code } => {
                warn!("xhci: host controller event: {:?}", completion_code)
            }
            ProcessedEvent::DeviceNotification(event) => debug!(
                "xhci: device notification type {} from slot {}",
                event.notification_type,
                event.slot_id.as_u8()
            ),
            ProcessedEvent::CommandCompletion(event) => {
                warn!("xhci: command completion at {:#x} dispatched late", event.command_trb)
            }
            ProcessedEvent::MfindexWrap => {}
            ProcessedEvent::Unknown { trb_type } => warn!("xhci: unknown event TRB type {}", trb_type),
        }
        None
    }

    /// コマンド完了を適用して待ち手を起こす
    ///
    /// 失敗したスロットの Disable Slot をエンキューした場合は `true`
    /// （ドアベルは呼び出し側が鳴らす）。
    fn complete_command(&self, rt: &Runtime, event: CommandCompletionEvent) -> bool {
        let token = CommandToken(event.command_trb);
        if !rt.command_ring.lock().retire(event.command_trb) {
            warn!("xhci: completion for unknown command TRB {:#x}", event.command_trb);
        }

        let kind = self.commands.kind(token);
        let outcome = rt.slots.lock().complete(token, event.slot_id, event.completion_code);
        let mut failed_slot = None;
        let result = match outcome {
            Some(SlotOutcome { slot, result: Ok(state) }) => {
                self.apply_slot_transition(rt, token, slot, state);
                Ok(CommandCompletion {
                    token,
                    code: event.completion_code,
                    slot_id: slot,
                })
            }
            Some(SlotOutcome { slot, result: Err(err) }) => {
                if matches!(
                    kind,
                    Some(CommandKind::AddressDevice(_) | CommandKind::ConfigureEndpoint(_))
                ) {
                    failed_slot = Some(slot);
                }
                Err(err)
            }
            None if event.completion_code.is_success() => Ok(CommandCompletion {
                token,
                code: event.completion_code,
                slot_id: event.slot_id,
            }),
            None => Err(XhciError::CommandFailed(event.completion_code)),
        };

        if !self.commands.complete(token, result) {
            warn!("xhci: command completion at {:#x} has no waiter", token.trb_address());
        }
        failed_slot.is_some_and(|slot| self.release_failed_slot(rt, slot))
    }

    /// コマンド失敗で Free に戻ったスロットをハードウェア側でも無効化する
    ///
    /// 完了時に `apply_slot_transition` がコンテキストとリングを解放する。
    fn release_failed_slot(&self, rt: &Runtime, slot: SlotId) -> bool {
        let kind = CommandKind::ReleaseSlot(slot);
        match self.enqueue_command(rt, kind, Trb::disable_slot(slot), None) {
            Ok(token) => {
                debug!("xhci: releasing slot {} at {:#x}", slot.as_u8(), token.trb_address());
                true
            }
            Err(err) => {
                warn!(
                    "xhci: slot {} left enabled after failed command ({}), disable_slot releases it",
                    slot.as_u8(),
                    err
                );
                false
            }
        }
    }

    fn apply_slot_transition(&self, rt: &Runtime, token: CommandToken, slot: SlotId, state: SlotState) {
        match state {
            SlotState::Addressed | SlotState::Configured => {
                if let Some((port, speed)) = self.commands.take_port_binding(token) {
                    rt.devices.lock().insert(slot, DeviceInfo { port, speed });
                    if let Err(err) = self.ports.assign_slot(port, slot) {
                        warn!("xhci: slot {} port binding: {}", slot.as_u8(), err);
                    }
                }
                let installed = self.commands.take_transfer_rings(token);
                let mut rings = rt.transfer_rings.lock();
                for (dci, ring) in installed {
                    rings.insert((slot, dci), ring);
                }
            }
            SlotState::Free => {
                rt.transfer_rings.lock().retain(|(s, _), _| *s != slot);
                rt.dcbaa.lock().unbind_slot_context(slot);
                rt.devices.lock().remove(&slot);
                self.ports.release_slot(slot);
            }
            _ => {}
        }
    }

    fn complete_transfer(&self, rt: &Runtime, event: &TransferEvent) {
        match rt.transfer_rings.lock().get_mut(&(event.slot_id, event.endpoint_id)) {
            Some(ring) if !event.event_data => {
                ring.retire(event.trb_pointer);
            }
            Some(_) => {}
            None => warn!(
                "xhci: transfer event for slot {} DCI {} without ring",
                event.slot_id.as_u8(),
                event.endpoint_id
            ),
        }
    }

    fn notify_transfer(&self, event: TransferEvent) {
        let observer = self.transfer_observer.lock().clone();
        if let Some(observer) = observer {
            observer.transfer_completed(event);
        }
    }
}

/// イベント処理後にオブザーバへ届ける通知
enum Notification {
    Port(PortChange),
    Transfer(TransferEvent),
}

/// スロット状態をコマンド発行に合わせて遷移させる
fn begin_slot_command(slots: &mut SlotManager, kind: CommandKind, token: CommandToken) -> XhciResult<()> {
    match kind {
        CommandKind::NoOp => Ok(()),
        CommandKind::EnableSlot => {
            slots.begin_enable(token);
            Ok(())
        }
        CommandKind::AddressDevice(slot) => slots.begin_address(slot, token),
        CommandKind::ConfigureEndpoint(slot) => slots.begin_configure(slot, token),
        CommandKind::EvaluateContext(slot)
        | CommandKind::StopEndpoint(slot, _)
        | CommandKind::ResetEndpoint(slot, _) => slots.require_device(slot),
        CommandKind::DisableSlot(slot) => slots.begin_disable(slot, token),
        CommandKind::ReleaseSlot(slot) => slots.begin_release(slot, token),
    }
}

/// エンドポイントディスクリプタからエンドポイントコンテキストを構築
fn endpoint_context(endpoint: &EndpointDescriptor, speed: UsbSpeed, ring_phys: u64) -> EndpointContext {
    let is_in = endpoint.address.is_in();
    let ep_type = match (endpoint.transfer_type(), is_in) {
        (TransferType::Control, _) => EndpointType::Control,
        (TransferType::Bulk, true) => EndpointType::BulkIn,
        (TransferType::Bulk, false) => EndpointType::BulkOut,
        (TransferType::Interrupt, true) => EndpointType::InterruptIn,
        (TransferType::Interrupt, false) => EndpointType::InterruptOut,
        (TransferType::Isochronous, true) => EndpointType::IsochIn,
        (TransferType::Isochronous, false) => EndpointType::IsochOut,
    };

    let max_packet = endpoint.packet_size();
    let mut context = EndpointContext::default();
    context.set_ep_type(ep_type);
    context.set_cerr(ENDPOINT_ERROR_COUNT);
    context.set_max_packet_size(max_packet);
    context.set_max_burst(endpoint.max_burst);
    context.set_interval(endpoint.xhci_interval(speed));
    context.set_tr_dequeue(ring_phys, true);

    match endpoint.transfer_type() {
        TransferType::Interrupt => {
            let payload = max_packet as u32 * (endpoint.max_burst as u32 + 1);
            context.set_average_trb_length(max_packet);
            context.set_max_esit_payload(payload.min(u16::MAX as u32) as u16);
        }
        TransferType::Bulk => context.set_average_trb_length(BULK_AVERAGE_TRB_LENGTH),
        _ => context.set_average_trb_length(8),
    }
    context
}
