// ============================================================================
// src/io/usb/xhci/sim.rs - Simulated xHCI Controller (tests only)
// ============================================================================
//!
//! テスト用のレジスタレベル xHCI シミュレータ。
//!
//! DMA はアイデンティティマップ（`PhysicalMemoryMapper::new(0)`）を前提に、
//! 物理アドレスをそのままポインタとして読み書きする。
//!
//! ## レジスタ配置
//! - ケーパビリティ: 0x0000（CAPLENGTH = 0x20）
//! - オペレーショナル: 0x0020
//! - ランタイム: 0x2000（インタラプタ 0 は 0x2020）
//! - ドアベル: 0x3000

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use super::registers::{
    CommandRingControl, UsbCommand, UsbStatus, CONFIG, CRCR, CRCR_POINTER_MASK, DCBAAP, DNCTRL,
    ERDP, ERDP_EHB, ERSTBA, ERSTSZ, IMAN, IMAN_IE, IMAN_IP, IMOD, IR0, PAGESIZE, PORTSC_BASE,
    PORTSC_CCS, PORTSC_CEC, PORTSC_CSC, PORTSC_OCC, PORTSC_PEC, PORTSC_PED, PORTSC_PIC_MASK,
    PORTSC_PLC, PORTSC_PP, PORTSC_PR, PORTSC_PRC, PORTSC_WRC, PORT_REGISTER_SIZE, USBCMD, USBSTS,
};
use super::ring_manager::{TrbCursor, MAX_SEGMENT_TRBS};
use super::trb::{CompletionCode, ErstEntry, Trb, TrbType};
use crate::io::mmio::RegisterIo;
use crate::io::usb::SlotId;

pub const SIM_OPERATIONAL_OFFSET: usize = 0x20;
pub const SIM_RUNTIME_OFFSET: usize = 0x2000;
pub const SIM_DOORBELL_OFFSET: usize = 0x3000;

const SIM_MAX_SLOTS: u8 = 32;
const SIM_MAX_INTERRUPTERS: u32 = 8;
const SIM_PORTS: usize = 4;
const SIM_HCIVERSION: u32 = 0x0110;

/// 変更ビット（W1C）
const PORTSC_CHANGE_BITS: u32 =
    PORTSC_CSC | PORTSC_PEC | PORTSC_WRC | PORTSC_OCC | PORTSC_PRC | PORTSC_PLC | PORTSC_CEC;
/// USBSTS の W1C ビット
const USBSTS_W1C: u32 = UsbStatus::HSE.bits()
    | UsbStatus::EINT.bits()
    | UsbStatus::PCD.bits()
    | UsbStatus::SRE.bits();

/// スロットコンテキスト DWORD 3 のバイトオフセット
const SLOT_STATE_WORD: u64 = 12;
const SLOT_STATE_SHIFT: u32 = 27;
const SLOT_STATE_ADDRESSED: u32 = 2;
const SLOT_STATE_CONFIGURED: u32 = 3;
/// 32 バイトコンテキストでの入力 EP0 コンテキスト DWORD 1 のバイトオフセット
const INPUT_EP0_PACKET_WORD: u64 = 2 * 32 + 4;

/// イベントリングへの書き込み位置
#[derive(Debug, Clone, Copy)]
struct EventProducer {
    base: u64,
    len: usize,
    index: usize,
    cycle: bool,
}

struct SimState {
    hcsparams2: u32,
    usbcmd: u32,
    usbsts: u32,
    dnctrl: u32,
    config: u32,
    crcr: u64,
    crcr_written: Option<u64>,
    command_ring_running: bool,
    dcbaap: u64,
    portsc: [u32; SIM_PORTS],
    port_reset_hangs: bool,
    iman: u32,
    imod: u32,
    erstsz: u32,
    erstba: u64,
    erdp: u64,
    doorbells: Vec<(u8, u32)>,
    reset_polls: u32,
    reset_remaining: u32,
    reset_count: u32,
    halt_never_sets: bool,
    command_ring_base: u64,
    command_cursor: Option<TrbCursor>,
    events: Option<EventProducer>,
    scripted: VecDeque<CompletionCode>,
    slots_enabled: [bool; SIM_MAX_SLOTS as usize + 1],
    executed: Vec<Trb>,
    evaluated_max_packet: Option<u16>,
}

impl SimState {
    fn new() -> Self {
        Self {
            hcsparams2: 0,
            usbcmd: 0,
            usbsts: UsbStatus::HCH.bits(),
            dnctrl: 0,
            config: 0,
            crcr: 0,
            crcr_written: None,
            command_ring_running: false,
            dcbaap: 0,
            portsc: [0; SIM_PORTS],
            port_reset_hangs: false,
            iman: 0,
            imod: 0,
            erstsz: 0,
            erstba: 0,
            erdp: 0,
            doorbells: Vec::new(),
            reset_polls: 3,
            reset_remaining: 0,
            reset_count: 0,
            halt_never_sets: false,
            command_ring_base: 0,
            command_cursor: None,
            events: None,
            scripted: VecDeque::new(),
            slots_enabled: [false; SIM_MAX_SLOTS as usize + 1],
            executed: Vec::new(),
            evaluated_max_packet: None,
        }
    }

    /// HCRST: オペレーショナル/ランタイムレジスタを既定値へ
    fn host_controller_reset(&mut self) {
        self.reset_count += 1;
        self.usbcmd = UsbCommand::HCRST.bits();
        self.usbsts = UsbStatus::HCH.bits() | UsbStatus::CNR.bits();
        self.dnctrl = 0;
        self.config = 0;
        self.crcr = 0;
        self.crcr_written = None;
        self.dcbaap = 0;
        self.iman = 0;
        self.imod = 0;
        self.erstsz = 0;
        self.erstba = 0;
        self.erdp = 0;
        self.command_cursor = None;
        self.events = None;
        self.slots_enabled = [false; SIM_MAX_SLOTS as usize + 1];
        for portsc in &mut self.portsc {
            *portsc &= !(PORTSC_PED | PORTSC_PR);
        }
        self.reset_remaining = self.reset_polls;
        if self.reset_remaining == 0 {
            self.finish_reset();
        }
    }

    fn finish_reset(&mut self) {
        self.usbcmd &= !UsbCommand::HCRST.bits();
        self.usbsts &= !UsbStatus::CNR.bits();
    }

    fn read_usbcmd(&mut self) -> u32 {
        if self.reset_remaining > 0 {
            self.reset_remaining -= 1;
            if self.reset_remaining == 0 {
                self.finish_reset();
            }
        }
        self.usbcmd
    }

    fn write_usbcmd(&mut self, value: u32) {
        if value & UsbCommand::HCRST.bits() != 0 {
            self.host_controller_reset();
            return;
        }
        self.usbcmd = value;
        if value & UsbCommand::RUN.bits() != 0 {
            self.usbsts &= !UsbStatus::HCH.bits();
        } else if !self.halt_never_sets {
            self.usbsts |= UsbStatus::HCH.bits();
        }
    }

    fn write_crcr(&mut self, high: bool, value: u32) {
        if self.command_ring_running {
            return;
        }
        self.crcr = replace_half(self.crcr, high, value);
        if high {
            let crcr = self.crcr;
            self.crcr_written = Some(crcr);
            self.command_ring_base = crcr & CRCR_POINTER_MASK;
            self.command_cursor = Some(TrbCursor::new(
                self.command_ring_base,
                MAX_SEGMENT_TRBS,
                crcr & CommandRingControl::RCS.bits() != 0,
            ));
        }
    }

    fn write_erstba(&mut self, high: bool, value: u32) {
        self.erstba = replace_half(self.erstba, high, value);
        if high && self.erstba != 0 {
            // SAFETY: テストではDMAはアイデンティティマップ
            let entry = unsafe { core::ptr::read_volatile(self.erstba as *const ErstEntry) };
            self.events = Some(EventProducer {
                base: entry.ring_segment_base,
                len: entry.ring_segment_size as usize,
                index: 0,
                cycle: true,
            });
        }
    }

    fn write_erdp(&mut self, high: bool, value: u32) {
        if high {
            self.erdp = replace_half(self.erdp, true, value);
            return;
        }
        let value = value as u64;
        let ehb = if value & ERDP_EHB != 0 { 0 } else { self.erdp & ERDP_EHB };
        self.erdp = (self.erdp & !0xFFFF_FFFF) | (value & !ERDP_EHB) | ehb;
    }

    fn write_portsc(&mut self, index: usize, value: u32) {
        let current = self.portsc[index];
        let mut next = current & !(value & PORTSC_CHANGE_BITS);
        if value & PORTSC_PED != 0 {
            next &= !PORTSC_PED;
        }
        next = (next & !(PORTSC_PP | PORTSC_PIC_MASK)) | (value & (PORTSC_PP | PORTSC_PIC_MASK));

        if value & PORTSC_PR != 0 && next & PORTSC_CCS != 0 {
            if self.port_reset_hangs {
                next |= PORTSC_PR;
            } else {
                next = (next & !PORTSC_PR) | PORTSC_PED | PORTSC_PRC;
            }
        }
        self.portsc[index] = next;
    }

    fn post_event(&mut self, mut trb: Trb) {
        let Some(producer) = self.events.as_mut() else {
            panic!("event ring not registered");
        };
        trb.set_cycle_bit(producer.cycle);
        let addr = producer.base + producer.index as u64 * Trb::SIZE;
        // SAFETY: テストではDMAはアイデンティティマップ
        unsafe { core::ptr::write_volatile(addr as *mut Trb, trb) };
        producer.index += 1;
        if producer.index == producer.len {
            producer.index = 0;
            producer.cycle = !producer.cycle;
        }

        self.iman |= IMAN_IP;
        self.usbsts |= UsbStatus::EINT.bits();
        self.erdp |= ERDP_EHB;
    }

    /// 出力スロットコンテキストの DWORD 3 アドレス
    fn slot_state_word(&self, slot: SlotId) -> Option<u64> {
        if self.dcbaap == 0 {
            return None;
        }
        // SAFETY: テストではDMAはアイデンティティマップ
        let context = unsafe {
            core::ptr::read_volatile((self.dcbaap + slot.as_u8() as u64 * 8) as *const u64)
        };
        (context != 0).then_some(context + SLOT_STATE_WORD)
    }

    fn set_slot_state(&self, slot: SlotId, state: u32) -> bool {
        let Some(word) = self.slot_state_word(slot) else {
            return false;
        };
        let value = (state << SLOT_STATE_SHIFT) | slot.as_u8() as u32;
        // SAFETY: テストではDMAはアイデンティティマップ
        unsafe { core::ptr::write_volatile(word as *mut u32, value) };
        true
    }

    fn execute(&mut self, trb: &Trb) -> (CompletionCode, SlotId) {
        let slot = trb.slot_id();
        self.executed.push(*trb);
        if let Some(code) = self.scripted.pop_front() {
            return (code, slot);
        }

        match trb.kind() {
            Some(TrbType::NoOpCommand) => (CompletionCode::Success, SlotId(0)),
            Some(TrbType::EnableSlot) => {
                let free = (1..=SIM_MAX_SLOTS).find(|s| !self.slots_enabled[*s as usize]);
                match free {
                    Some(id) => {
                        self.slots_enabled[id as usize] = true;
                        (CompletionCode::Success, SlotId(id))
                    }
                    None => (CompletionCode::NoSlotsAvailable, SlotId(0)),
                }
            }
            Some(kind @ (TrbType::AddressDevice | TrbType::ConfigureEndpoint)) => {
                if !self.slot_enabled(slot) {
                    return (CompletionCode::SlotNotEnabled, slot);
                }
                let state = if kind == TrbType::AddressDevice {
                    SLOT_STATE_ADDRESSED
                } else {
                    SLOT_STATE_CONFIGURED
                };
                if self.set_slot_state(slot, state) {
                    (CompletionCode::Success, slot)
                } else {
                    (CompletionCode::ContextStateError, slot)
                }
            }
            Some(TrbType::EvaluateContext) => {
                if !self.slot_enabled(slot) {
                    return (CompletionCode::SlotNotEnabled, slot);
                }
                // SAFETY: テストではDMAはアイデンティティマップ
                let word = unsafe {
                    core::ptr::read_volatile((trb.trb_pointer() + INPUT_EP0_PACKET_WORD) as *const u32)
                };
                self.evaluated_max_packet = Some((word >> 16) as u16);
                (CompletionCode::Success, slot)
            }
            Some(TrbType::StopEndpoint | TrbType::ResetEndpoint) => {
                if !self.slot_enabled(slot) {
                    return (CompletionCode::SlotNotEnabled, slot);
                }
                (CompletionCode::Success, slot)
            }
            Some(TrbType::DisableSlot) => {
                if !self.slot_enabled(slot) {
                    return (CompletionCode::SlotNotEnabled, slot);
                }
                self.set_slot_state(slot, 0);
                self.slots_enabled[slot.as_usize()] = false;
                (CompletionCode::Success, slot)
            }
            _ => (CompletionCode::TrbError, slot),
        }
    }

    fn slot_enabled(&self, slot: SlotId) -> bool {
        self.slots_enabled
            .get(slot.as_usize())
            .copied()
            .unwrap_or(false)
            && slot.is_valid()
    }
}

fn replace_half(current: u64, high: bool, value: u32) -> u64 {
    if high {
        (current & 0xFFFF_FFFF) | ((value as u64) << 32)
    } else {
        (current & !0xFFFF_FFFF) | value as u64
    }
}

fn high_or_low(value: u64, high: bool) -> u32 {
    if high { (value >> 32) as u32 } else { value as u32 }
}

/// シミュレートされた xHCI コントローラ
pub struct SimulatedController {
    state: Mutex<SimState>,
}

impl SimulatedController {
    /// 停止状態（HCH=1）で作成
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::new()),
        }
    }

    pub fn set_hcsparams2(&self, value: u32) {
        self.state.lock().hcsparams2 = value;
    }

    /// HCRST が自動でクリアされるまでの USBCMD 読み出し回数
    pub fn set_reset_polls(&self, polls: u32) {
        self.state.lock().reset_polls = polls;
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().reset_count
    }

    pub fn set_running(&self, running: bool) {
        let mut state = self.state.lock();
        if running {
            state.usbcmd |= UsbCommand::RUN.bits();
            state.usbsts &= !UsbStatus::HCH.bits();
        } else {
            state.usbcmd &= !UsbCommand::RUN.bits();
            state.usbsts |= UsbStatus::HCH.bits();
        }
    }

    /// Run/Stop をクリアしても HCHalted が立たない
    pub fn set_halt_never_sets(&self, never: bool) {
        self.state.lock().halt_never_sets = never;
    }

    pub fn set_command_ring_running(&self, running: bool) {
        self.state.lock().command_ring_running = running;
    }

    /// 最後に書き込まれた CRCR の値
    pub fn crcr_written(&self) -> Option<u64> {
        self.state.lock().crcr_written
    }

    /// PORTSC を直接設定（1-based）
    pub fn set_portsc(&self, port: u8, value: u32) {
        self.state.lock().portsc[port as usize - 1] = value;
    }

    pub fn portsc(&self, port: u8) -> u32 {
        self.state.lock().portsc[port as usize - 1]
    }

    /// PR を書いてもリセットが完了しない
    pub fn set_port_reset_hangs(&self, hangs: bool) {
        self.state.lock().port_reset_hangs = hangs;
    }

    /// 書き込まれたドアベル (ドアベル番号, 値)
    pub fn doorbells(&self) -> Vec<(u8, u32)> {
        self.state.lock().doorbells.clone()
    }

    /// 次に実行するコマンドの完了コードを指定
    pub fn script_completion(&self, code: CompletionCode) {
        self.state.lock().scripted.push_back(code);
    }

    /// 実行したコマンドTRB（実行順）
    pub fn executed_commands(&self) -> Vec<Trb> {
        self.state.lock().executed.clone()
    }

    /// 最後の Evaluate Context で読んだ EP0 の最大パケットサイズ
    pub fn evaluated_max_packet(&self) -> Option<u16> {
        self.state.lock().evaluated_max_packet
    }

    /// ハードウェア側でスロットが有効か
    pub fn slot_enabled(&self, slot: SlotId) -> bool {
        self.state.lock().slot_enabled(slot)
    }

    /// コマンドリング上の未実行コマンドをすべて実行し、完了イベントを書く
    pub fn run_commands(&self) -> usize {
        let mut state = self.state.lock();
        let Some(mut cursor) = state.command_cursor else {
            return 0;
        };

        let base = state.command_ring_base;
        let mut executed = 0;
        loop {
            let next = cursor.next_with(|index| {
                // SAFETY: テストではDMAはアイデンティティマップ
                unsafe { core::ptr::read_volatile((base + index as u64 * Trb::SIZE) as *const Trb) }
            });
            let Some((addr, trb)) = next else {
                break;
            };
            let (code, slot) = state.execute(&trb);
            state.post_event(Trb::command_completion_event(addr, code, slot));
            executed += 1;
        }
        state.command_cursor = Some(cursor);
        executed
    }

    /// Port Status Change Event を書く
    pub fn post_port_change(&self, port: u8) {
        let mut state = self.state.lock();
        state.usbsts |= UsbStatus::PCD.bits();
        state.post_event(Trb::port_status_change_event(port));
    }

    /// Transfer Event を書く
    pub fn complete_transfer(
        &self,
        trb_pointer: u64,
        slot: SlotId,
        dci: u8,
        code: CompletionCode,
        residual: u32,
    ) {
        self.state
            .lock()
            .post_event(Trb::transfer_event(trb_pointer, code, residual, slot, dci));
    }

    /// USBSTS.HSE を立ててコントローラを停止させる
    pub fn raise_host_system_error(&self) {
        let mut state = self.state.lock();
        state.usbsts |= UsbStatus::HSE.bits() | UsbStatus::HCH.bits();
        state.usbcmd &= !UsbCommand::RUN.bits();
    }

    /// 出力スロットコンテキストのスロット状態（未バインドなら `None`）
    pub fn output_slot_state(&self, slot: SlotId) -> Option<u32> {
        let word = self.state.lock().slot_state_word(slot)?;
        // SAFETY: テストではDMAはアイデンティティマップ
        let value = unsafe { core::ptr::read_volatile(word as *const u32) };
        Some(value >> SLOT_STATE_SHIFT)
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for SimulatedController {
    fn read32(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        match offset {
            0x00 => (SIM_HCIVERSION << 16) | SIM_OPERATIONAL_OFFSET as u32,
            0x04 => SIM_MAX_SLOTS as u32 | (SIM_MAX_INTERRUPTERS << 8) | ((SIM_PORTS as u32) << 24),
            0x08 => state.hcsparams2,
            0x14 => SIM_DOORBELL_OFFSET as u32,
            0x18 => SIM_RUNTIME_OFFSET as u32,
            o if o >= SIM_DOORBELL_OFFSET => 0,
            o if o >= SIM_RUNTIME_OFFSET + IR0 => match o - SIM_RUNTIME_OFFSET - IR0 {
                IMAN => state.iman,
                IMOD => state.imod,
                ERSTSZ => state.erstsz,
                ERSTBA => high_or_low(state.erstba, false),
                r if r == ERSTBA + 4 => high_or_low(state.erstba, true),
                ERDP => high_or_low(state.erdp, false),
                r if r == ERDP + 4 => high_or_low(state.erdp, true),
                _ => 0,
            },
            o if o >= SIM_RUNTIME_OFFSET => 0,
            o if o >= SIM_OPERATIONAL_OFFSET => {
                let reg = o - SIM_OPERATIONAL_OFFSET;
                match reg {
                    USBCMD => state.read_usbcmd(),
                    USBSTS => state.usbsts,
                    PAGESIZE => 1,
                    DNCTRL => state.dnctrl,
                    CRCR => {
                        if state.command_ring_running {
                            CommandRingControl::CRR.bits() as u32
                        } else {
                            0
                        }
                    }
                    r if r == CRCR + 4 => 0,
                    DCBAAP => state.dcbaap as u32,
                    r if r == DCBAAP + 4 => (state.dcbaap >> 32) as u32,
                    CONFIG => state.config,
                    r if (PORTSC_BASE..PORTSC_BASE + SIM_PORTS * PORT_REGISTER_SIZE).contains(&r)
                        && (r - PORTSC_BASE) % PORT_REGISTER_SIZE == 0 =>
                    {
                        state.portsc[(r - PORTSC_BASE) / PORT_REGISTER_SIZE]
                    }
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        match offset {
            o if o >= SIM_DOORBELL_OFFSET => {
                let doorbell = ((o - SIM_DOORBELL_OFFSET) / 4) as u8;
                state.doorbells.push((doorbell, value));
            }
            o if o >= SIM_RUNTIME_OFFSET + IR0 => match o - SIM_RUNTIME_OFFSET - IR0 {
                IMAN => {
                    let ip = if value & IMAN_IP != 0 { 0 } else { state.iman & IMAN_IP };
                    state.iman = (value & IMAN_IE) | ip;
                }
                IMOD => state.imod = value,
                ERSTSZ => state.erstsz = value & 0xFFFF,
                ERSTBA => state.write_erstba(false, value),
                r if r == ERSTBA + 4 => state.write_erstba(true, value),
                ERDP => state.write_erdp(false, value),
                r if r == ERDP + 4 => state.write_erdp(true, value),
                _ => {}
            },
            o if o >= SIM_RUNTIME_OFFSET => {}
            o if o >= SIM_OPERATIONAL_OFFSET => {
                let reg = o - SIM_OPERATIONAL_OFFSET;
                match reg {
                    USBCMD => state.write_usbcmd(value),
                    USBSTS => state.usbsts &= !(value & USBSTS_W1C),
                    DNCTRL => state.dnctrl = value,
                    CRCR => state.write_crcr(false, value),
                    r if r == CRCR + 4 => state.write_crcr(true, value),
                    DCBAAP => state.dcbaap = replace_half(state.dcbaap, false, value),
                    r if r == DCBAAP + 4 => state.dcbaap = replace_half(state.dcbaap, true, value),
                    CONFIG => state.config = value,
                    r if (PORTSC_BASE..PORTSC_BASE + SIM_PORTS * PORT_REGISTER_SIZE).contains(&r)
                        && (r - PORTSC_BASE) % PORT_REGISTER_SIZE == 0 =>
                    {
                        state.write_portsc((r - PORTSC_BASE) / PORT_REGISTER_SIZE, value)
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}
