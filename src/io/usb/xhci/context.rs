// ============================================================================
// src/io/usb/xhci/context.rs - xHCI Device Context Structures
// ============================================================================
//!
//! xHCI デバイスコンテキスト関連の構造体定義。
//!
//! ## コンテキスト構造
//! - SlotContext: スロット状態（デバイス接続情報）
//! - EndpointContext: エンドポイント状態（転送設定）
//! - DeviceContextBuffer: コントローラが書き込む出力コンテキスト
//! - InputContextBuffer: コマンド用の入力コンテキスト
//!
//! 各フィールドはワード単位のマスクとシフトで読み書きする。
//! コンテキストサイズは HCCPARAMS1.CSZ により 32 または 64 バイト
//! （64 バイト時も先頭 32 バイトのみ使用）。

use crate::error::{XhciError, XhciResult};
use crate::io::dma::{DmaArray, PhysicalMemoryMapper};
use crate::io::usb::UsbSpeed;

/// コンテキストあたりの有効ワード数
const CONTEXT_WORDS: usize = 8;

/// デバイスコンテキスト内のコンテキスト数（スロット + 31 エンドポイント）
pub const DEVICE_CONTEXT_ENTRIES: usize = 32;

/// 最大 DCI
pub const MAX_DCI: u8 = 31;

#[inline]
fn get_bits(word: u32, shift: u32, mask: u32) -> u32 {
    (word >> shift) & mask
}

#[inline]
fn set_bits(word: &mut u32, shift: u32, mask: u32, value: u32) {
    *word = (*word & !(mask << shift)) | ((value & mask) << shift);
}

// ============================================================================
// Slot Context
// ============================================================================

/// ハードウェアが報告するスロット状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotContextState {
    /// Disabled / Enabled
    DisabledEnabled,
    Default,
    Addressed,
    Configured,
    Reserved(u8),
}

impl SlotContextState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::DisabledEnabled,
            1 => Self::Default,
            2 => Self::Addressed,
            3 => Self::Configured,
            other => Self::Reserved(other),
        }
    }
}

/// スロットコンテキスト (32バイト)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotContext {
    /// ルートストリング、速度、MTT、Hub、コンテキストエントリ数
    pub route_string_and_speed: u32,
    /// 最大終了レイテンシ、ルートハブポート番号、ポート数
    pub latency_and_ports: u32,
    /// 親ハブスロットID、親ポート番号、TTT、インタラプタターゲット
    pub tt_info: u32,
    /// デバイスアドレス、スロット状態
    pub state_and_address: u32,
    /// 予約
    pub reserved: [u32; 4],
}

impl SlotContext {
    pub fn route_string(&self) -> u32 {
        get_bits(self.route_string_and_speed, 0, 0xF_FFFF)
    }

    pub fn set_route_string(&mut self, route: u32) {
        set_bits(&mut self.route_string_and_speed, 0, 0xF_FFFF, route);
    }

    /// 速度（非推奨フィールド、正しい値はポートから得る）
    pub fn speed(&self) -> u8 {
        get_bits(self.route_string_and_speed, 20, 0xF) as u8
    }

    pub fn set_speed(&mut self, speed: u8) {
        set_bits(&mut self.route_string_and_speed, 20, 0xF, speed as u32);
    }

    pub fn multi_tt(&self) -> bool {
        get_bits(self.route_string_and_speed, 25, 1) != 0
    }

    pub fn set_multi_tt(&mut self, mtt: bool) {
        set_bits(&mut self.route_string_and_speed, 25, 1, mtt as u32);
    }

    pub fn hub(&self) -> bool {
        get_bits(self.route_string_and_speed, 26, 1) != 0
    }

    pub fn set_hub(&mut self, hub: bool) {
        set_bits(&mut self.route_string_and_speed, 26, 1, hub as u32);
    }

    pub fn context_entries(&self) -> u8 {
        get_bits(self.route_string_and_speed, 27, 0x1F) as u8
    }

    pub fn set_context_entries(&mut self, entries: u8) {
        set_bits(&mut self.route_string_and_speed, 27, 0x1F, entries as u32);
    }

    pub fn max_exit_latency(&self) -> u16 {
        get_bits(self.latency_and_ports, 0, 0xFFFF) as u16
    }

    pub fn set_max_exit_latency(&mut self, latency: u16) {
        set_bits(&mut self.latency_and_ports, 0, 0xFFFF, latency as u32);
    }

    pub fn root_hub_port(&self) -> u8 {
        get_bits(self.latency_and_ports, 16, 0xFF) as u8
    }

    pub fn set_root_hub_port(&mut self, port: u8) {
        set_bits(&mut self.latency_and_ports, 16, 0xFF, port as u32);
    }

    pub fn number_of_ports(&self) -> u8 {
        get_bits(self.latency_and_ports, 24, 0xFF) as u8
    }

    pub fn set_number_of_ports(&mut self, ports: u8) {
        set_bits(&mut self.latency_and_ports, 24, 0xFF, ports as u32);
    }

    pub fn parent_hub_slot(&self) -> u8 {
        get_bits(self.tt_info, 0, 0xFF) as u8
    }

    pub fn set_parent_hub_slot(&mut self, slot: u8) {
        set_bits(&mut self.tt_info, 0, 0xFF, slot as u32);
    }

    pub fn parent_port(&self) -> u8 {
        get_bits(self.tt_info, 8, 0xFF) as u8
    }

    pub fn set_parent_port(&mut self, port: u8) {
        set_bits(&mut self.tt_info, 8, 0xFF, port as u32);
    }

    /// TT Think Time
    pub fn tt_think_time(&self) -> u8 {
        get_bits(self.tt_info, 16, 0x3) as u8
    }

    pub fn set_tt_think_time(&mut self, ttt: u8) {
        set_bits(&mut self.tt_info, 16, 0x3, ttt as u32);
    }

    pub fn interrupter_target(&self) -> u16 {
        get_bits(self.tt_info, 22, 0x3FF) as u16
    }

    pub fn set_interrupter_target(&mut self, target: u16) {
        set_bits(&mut self.tt_info, 22, 0x3FF, target as u32);
    }

    /// USB デバイスアドレス（コントローラが割り当てる）
    pub fn device_address(&self) -> u8 {
        get_bits(self.state_and_address, 0, 0xFF) as u8
    }

    /// スロット状態（コントローラが書く）
    pub fn slot_state(&self) -> SlotContextState {
        SlotContextState::from_u8(get_bits(self.state_and_address, 27, 0x1F) as u8)
    }

    fn to_words(self) -> [u32; CONTEXT_WORDS] {
        let r = self.reserved;
        [
            self.route_string_and_speed,
            self.latency_and_ports,
            self.tt_info,
            self.state_and_address,
            r[0],
            r[1],
            r[2],
            r[3],
        ]
    }

    fn from_words(w: [u32; CONTEXT_WORDS]) -> Self {
        Self {
            route_string_and_speed: w[0],
            latency_and_ports: w[1],
            tt_info: w[2],
            state_and_address: w[3],
            reserved: [w[4], w[5], w[6], w[7]],
        }
    }
}

// ============================================================================
// Endpoint Context
// ============================================================================

/// エンドポイントタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    NotValid = 0,
    IsochOut = 1,
    BulkOut = 2,
    InterruptOut = 3,
    Control = 4,
    IsochIn = 5,
    BulkIn = 6,
    InterruptIn = 7,
}

impl EndpointType {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x7 {
            1 => Self::IsochOut,
            2 => Self::BulkOut,
            3 => Self::InterruptOut,
            4 => Self::Control,
            5 => Self::IsochIn,
            6 => Self::BulkIn,
            7 => Self::InterruptIn,
            _ => Self::NotValid,
        }
    }
}

/// エンドポイント状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disabled,
    Running,
    Halted,
    Stopped,
    Error,
    Reserved(u8),
}

/// エンドポイントコンテキスト (32バイト)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointContext {
    /// エンドポイント状態、Mult、MaxPStreams、Interval
    pub ep_state_and_interval: u32,
    /// CErr、エンドポイントタイプ、最大バースト、最大パケットサイズ
    pub type_and_packet: u32,
    /// TRデキューポインタ（bit 0 = DCS）
    pub tr_dequeue_ptr: u64,
    /// 平均TRB長、Max ESIT Payload
    pub average_trb_length: u32,
    /// 予約
    pub reserved: [u32; 3],
}

impl EndpointContext {
    pub fn ep_state(&self) -> EndpointState {
        match get_bits(self.ep_state_and_interval, 0, 0x7) {
            0 => EndpointState::Disabled,
            1 => EndpointState::Running,
            2 => EndpointState::Halted,
            3 => EndpointState::Stopped,
            4 => EndpointState::Error,
            other => EndpointState::Reserved(other as u8),
        }
    }

    pub fn interval(&self) -> u8 {
        get_bits(self.ep_state_and_interval, 16, 0xFF) as u8
    }

    pub fn set_interval(&mut self, interval: u8) {
        set_bits(&mut self.ep_state_and_interval, 16, 0xFF, interval as u32);
    }

    /// Error Count
    pub fn cerr(&self) -> u8 {
        get_bits(self.type_and_packet, 1, 0x3) as u8
    }

    pub fn set_cerr(&mut self, cerr: u8) {
        set_bits(&mut self.type_and_packet, 1, 0x3, cerr as u32);
    }

    pub fn ep_type(&self) -> EndpointType {
        EndpointType::from_u8(get_bits(self.type_and_packet, 3, 0x7) as u8)
    }

    pub fn set_ep_type(&mut self, ep_type: EndpointType) {
        set_bits(&mut self.type_and_packet, 3, 0x7, ep_type as u32);
    }

    pub fn max_burst(&self) -> u8 {
        get_bits(self.type_and_packet, 8, 0xFF) as u8
    }

    pub fn set_max_burst(&mut self, burst: u8) {
        set_bits(&mut self.type_and_packet, 8, 0xFF, burst as u32);
    }

    pub fn max_packet_size(&self) -> u16 {
        get_bits(self.type_and_packet, 16, 0xFFFF) as u16
    }

    pub fn set_max_packet_size(&mut self, size: u16) {
        set_bits(&mut self.type_and_packet, 16, 0xFFFF, size as u32);
    }

    /// TRデキューポインタとDCS
    pub fn set_tr_dequeue(&mut self, ring_phys: u64, dcs: bool) {
        self.tr_dequeue_ptr = (ring_phys & !0xF) | dcs as u64;
    }

    pub fn tr_dequeue_pointer(&self) -> u64 {
        self.tr_dequeue_ptr & !0xF
    }

    pub fn dequeue_cycle_state(&self) -> bool {
        (self.tr_dequeue_ptr & 1) != 0
    }

    pub fn set_average_trb_length(&mut self, length: u16) {
        set_bits(&mut self.average_trb_length, 0, 0xFFFF, length as u32);
    }

    pub fn set_max_esit_payload(&mut self, payload: u16) {
        set_bits(&mut self.average_trb_length, 16, 0xFFFF, payload as u32);
    }

    fn to_words(self) -> [u32; CONTEXT_WORDS] {
        let r = self.reserved;
        [
            self.ep_state_and_interval,
            self.type_and_packet,
            self.tr_dequeue_ptr as u32,
            (self.tr_dequeue_ptr >> 32) as u32,
            self.average_trb_length,
            r[0],
            r[1],
            r[2],
        ]
    }

    fn from_words(w: [u32; CONTEXT_WORDS]) -> Self {
        Self {
            ep_state_and_interval: w[0],
            type_and_packet: w[1],
            tr_dequeue_ptr: (w[2] as u64) | ((w[3] as u64) << 32),
            average_trb_length: w[4],
            reserved: [w[5], w[6], w[7]],
        }
    }
}

// ============================================================================
// Input Control Context
// ============================================================================

/// 入力コントロールコンテキスト
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputControlContext {
    /// ドロップコンテキストフラグ (D2..D31)
    pub drop_flags: u32,
    /// 追加コンテキストフラグ (A0..A31)
    pub add_flags: u32,
    /// 予約
    pub reserved: [u32; 6],
}

impl InputControlContext {
    /// DCI を追加対象にする（0 = スロットコンテキスト）
    pub fn add_context(&mut self, dci: u8) {
        self.add_flags |= 1 << (dci & 0x1F);
    }

    pub fn drop_context(&mut self, dci: u8) {
        if dci >= 2 {
            self.drop_flags |= 1 << (dci & 0x1F);
        }
    }

    fn to_words(self) -> [u32; CONTEXT_WORDS] {
        let r = self.reserved;
        [self.drop_flags, self.add_flags, r[0], r[1], r[2], r[3], r[4], r[5]]
    }

    fn from_words(w: [u32; CONTEXT_WORDS]) -> Self {
        Self {
            drop_flags: w[0],
            add_flags: w[1],
            reserved: [w[2], w[3], w[4], w[5], w[6], w[7]],
        }
    }
}

// ============================================================================
// DMA Context Buffers
// ============================================================================

/// コンテキスト配列（32/64 バイトのストライド）
struct ContextArray {
    words: DmaArray<u32>,
    stride_words: usize,
    count: usize,
}

impl ContextArray {
    fn new(count: usize, context_size: usize, mapper: &PhysicalMemoryMapper) -> XhciResult<Self> {
        if context_size != 32 && context_size != 64 {
            return Err(XhciError::InvalidParameter("context size"));
        }
        let stride_words = context_size / 4;
        Ok(Self {
            words: DmaArray::new(count * stride_words, mapper)?,
            stride_words,
            count,
        })
    }

    fn read(&self, index: usize) -> [u32; CONTEXT_WORDS] {
        assert!(index < self.count, "context index out of range");
        let base = index * self.stride_words;
        core::array::from_fn(|i| self.words.read(base + i))
    }

    fn write(&mut self, index: usize, ctx: [u32; CONTEXT_WORDS]) {
        assert!(index < self.count, "context index out of range");
        let base = index * self.stride_words;
        for (i, word) in ctx.into_iter().enumerate() {
            self.words.write(base + i, word);
        }
    }

    fn phys_addr(&self) -> u64 {
        self.words.phys_addr().as_u64()
    }
}

/// 出力デバイスコンテキスト（DCBAA から参照され、コントローラが更新する）
pub struct DeviceContextBuffer {
    contexts: ContextArray,
}

impl DeviceContextBuffer {
    pub fn new(context_size: usize, mapper: &PhysicalMemoryMapper) -> XhciResult<Self> {
        Ok(Self {
            contexts: ContextArray::new(DEVICE_CONTEXT_ENTRIES, context_size, mapper)?,
        })
    }

    pub fn phys_addr(&self) -> u64 {
        self.contexts.phys_addr()
    }

    pub fn slot(&self) -> SlotContext {
        SlotContext::from_words(self.contexts.read(0))
    }

    /// DCI (1..=31) のエンドポイントコンテキスト
    pub fn endpoint(&self, dci: u8) -> Option<EndpointContext> {
        (1..=MAX_DCI)
            .contains(&dci)
            .then(|| EndpointContext::from_words(self.contexts.read(dci as usize)))
    }
}

impl core::fmt::Debug for DeviceContextBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceContextBuffer")
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .finish()
    }
}

/// 入力コンテキスト（Address Device / Configure Endpoint 用）
pub struct InputContextBuffer {
    contexts: ContextArray,
}

impl InputContextBuffer {
    pub fn new(context_size: usize, mapper: &PhysicalMemoryMapper) -> XhciResult<Self> {
        Ok(Self {
            contexts: ContextArray::new(DEVICE_CONTEXT_ENTRIES + 1, context_size, mapper)?,
        })
    }

    pub fn phys_addr(&self) -> u64 {
        self.contexts.phys_addr()
    }

    pub fn control(&self) -> InputControlContext {
        InputControlContext::from_words(self.contexts.read(0))
    }

    pub fn set_control(&mut self, ctrl: InputControlContext) {
        self.contexts.write(0, ctrl.to_words());
    }

    pub fn slot(&self) -> SlotContext {
        SlotContext::from_words(self.contexts.read(1))
    }

    pub fn set_slot(&mut self, slot: SlotContext) {
        self.contexts.write(1, slot.to_words());
    }

    pub fn endpoint(&self, dci: u8) -> Option<EndpointContext> {
        (1..=MAX_DCI)
            .contains(&dci)
            .then(|| EndpointContext::from_words(self.contexts.read(dci as usize + 1)))
    }

    pub fn set_endpoint(&mut self, dci: u8, ep: EndpointContext) -> XhciResult<()> {
        if !(1..=MAX_DCI).contains(&dci) {
            return Err(XhciError::InvalidParameter("endpoint DCI"));
        }
        self.contexts.write(dci as usize + 1, ep.to_words());
        Ok(())
    }
}

impl core::fmt::Debug for InputContextBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InputContextBuffer")
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .finish()
    }
}

/// コントロールエンドポイント (EP0) のコンテキストを構築
pub fn control_endpoint_context(speed: UsbSpeed, ring_phys: u64) -> EndpointContext {
    let mut ep = EndpointContext::default();
    ep.set_ep_type(EndpointType::Control);
    ep.set_cerr(3);
    ep.set_max_packet_size(speed.default_max_packet_size());
    ep.set_tr_dequeue(ring_phys, true);
    ep.set_average_trb_length(8);
    ep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_context_fields_do_not_overlap() {
        let mut slot = SlotContext::default();
        slot.set_route_string(0xABCDE);
        slot.set_speed(4);
        slot.set_multi_tt(true);
        slot.set_context_entries(31);
        slot.set_root_hub_port(7);
        slot.set_number_of_ports(4);
        slot.set_max_exit_latency(0x1234);
        slot.set_parent_hub_slot(9);
        slot.set_parent_port(3);
        slot.set_tt_think_time(2);
        slot.set_interrupter_target(0x3FF);

        assert_eq!(slot.route_string(), 0xABCDE);
        assert_eq!(slot.speed(), 4);
        assert!(slot.multi_tt());
        assert!(!slot.hub());
        assert_eq!(slot.context_entries(), 31);
        assert_eq!(slot.root_hub_port(), 7);
        assert_eq!(slot.number_of_ports(), 4);
        assert_eq!(slot.max_exit_latency(), 0x1234);
        assert_eq!(slot.parent_hub_slot(), 9);
        assert_eq!(slot.parent_port(), 3);
        assert_eq!(slot.tt_think_time(), 2);
        assert_eq!(slot.interrupter_target(), 0x3FF);
        assert_eq!(slot.route_string_and_speed, 0xABCDE | (4 << 20) | (1 << 25) | (31 << 27));
    }

    #[test]
    fn test_slot_state_decode() {
        let slot = SlotContext {
            state_and_address: (2 << 27) | 5,
            ..Default::default()
        };
        assert_eq!(slot.slot_state(), SlotContextState::Addressed);
        assert_eq!(slot.device_address(), 5);
    }

    #[test]
    fn test_control_endpoint_context() {
        let ep = control_endpoint_context(UsbSpeed::High, 0x8000);
        assert_eq!(ep.ep_type(), EndpointType::Control);
        assert_eq!(ep.cerr(), 3);
        assert_eq!(ep.max_packet_size(), 64);
        assert_eq!(ep.tr_dequeue_pointer(), 0x8000);
        assert!(ep.dequeue_cycle_state());
    }

    #[test]
    fn test_input_context_layout_with_64_byte_contexts() {
        let mapper = PhysicalMemoryMapper::new(0);
        let mut input = InputContextBuffer::new(64, &mapper).unwrap();

        let mut ctrl = InputControlContext::default();
        ctrl.add_context(0);
        ctrl.add_context(1);
        input.set_control(ctrl);

        let mut slot = SlotContext::default();
        slot.set_root_hub_port(2);
        input.set_slot(slot);
        input.set_endpoint(1, control_endpoint_context(UsbSpeed::Super, 0x4000)).unwrap();

        // スロットコンテキストは 64 バイト目、EP0 は 128 バイト目
        let base = input.phys_addr() as *const u32;
        unsafe {
            assert_eq!(*base.add(1), 0b11);
            assert_eq!(*base.add(16 + 1), 2 << 16);
            assert_eq!(*base.add(32 + 2), 0x4001);
        }
        assert_eq!(input.endpoint(1).unwrap().max_packet_size(), 512);
        assert!(input.set_endpoint(32, EndpointContext::default()).is_err());
    }
}
