// ============================================================================
// src/io/usb/xhci/trb.rs - TRB (Transfer Request Block) Definitions
// ============================================================================
//!
//! TRB (Transfer Request Block) 関連の型定義と操作。
//!
//! ## 概要
//! xHCIはTRBベースのコマンド/転送メカニズムを使用。
//! - Command TRB: ホストからコントローラへのコマンド
//! - Transfer TRB: データ転送要求
//! - Event TRB: コントローラからホストへの通知
//!
//! フィールドはすべてマスクとシフトで取り出す（ビットフィールドのレイアウトに依存しない）。

use crate::io::usb::SlotId;

// ============================================================================
// Control field layout
// ============================================================================

const CONTROL_CYCLE: u32 = 1 << 0;
/// Link TRB: Toggle Cycle / Event TRB: Event Data
const CONTROL_TOGGLE_CYCLE: u32 = 1 << 1;
const CONTROL_CHAIN: u32 = 1 << 4;
const CONTROL_IOC: u32 = 1 << 5;
const CONTROL_IDT: u32 = 1 << 6;
/// Address Device: BSR / Configure Endpoint: DC
const CONTROL_BSR_DC: u32 = 1 << 9;
const CONTROL_TYPE_SHIFT: u32 = 10;
const CONTROL_TYPE_MASK: u32 = 0x3F;
const CONTROL_ENDPOINT_SHIFT: u32 = 16;
const CONTROL_ENDPOINT_MASK: u32 = 0x1F;
const CONTROL_SLOT_SHIFT: u32 = 24;
const CONTROL_SLOT_MASK: u32 = 0xFF;

const STATUS_COMPLETION_SHIFT: u32 = 24;
const STATUS_TRANSFER_LENGTH_MASK: u32 = 0x00FF_FFFF;

// ============================================================================
// TRB Types
// ============================================================================

/// TRBタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrbType {
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlot = 9,
    DisableSlot = 10,
    AddressDevice = 11,
    ConfigureEndpoint = 12,
    EvaluateContext = 13,
    ResetEndpoint = 14,
    StopEndpoint = 15,
    SetTrDequeuePointer = 16,
    ResetDevice = 17,
    ForceEvent = 18,
    NegotiateBandwidth = 19,
    SetLatencyToleranceValue = 20,
    GetPortBandwidth = 21,
    ForceHeader = 22,
    NoOpCommand = 23,
    GetExtendedProperty = 24,
    SetExtendedProperty = 25,
    // Event TRBs
    Transfer = 32,
    CommandCompletion = 33,
    PortStatusChange = 34,
    BandwidthRequest = 35,
    Doorbell = 36,
    HostController = 37,
    DeviceNotification = 38,
    MfindexWrap = 39,
}

impl TrbType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(TrbType::Normal),
            2 => Some(TrbType::SetupStage),
            3 => Some(TrbType::DataStage),
            4 => Some(TrbType::StatusStage),
            5 => Some(TrbType::Isoch),
            6 => Some(TrbType::Link),
            7 => Some(TrbType::EventData),
            8 => Some(TrbType::NoOp),
            9 => Some(TrbType::EnableSlot),
            10 => Some(TrbType::DisableSlot),
            11 => Some(TrbType::AddressDevice),
            12 => Some(TrbType::ConfigureEndpoint),
            13 => Some(TrbType::EvaluateContext),
            14 => Some(TrbType::ResetEndpoint),
            15 => Some(TrbType::StopEndpoint),
            16 => Some(TrbType::SetTrDequeuePointer),
            17 => Some(TrbType::ResetDevice),
            18 => Some(TrbType::ForceEvent),
            19 => Some(TrbType::NegotiateBandwidth),
            20 => Some(TrbType::SetLatencyToleranceValue),
            21 => Some(TrbType::GetPortBandwidth),
            22 => Some(TrbType::ForceHeader),
            23 => Some(TrbType::NoOpCommand),
            24 => Some(TrbType::GetExtendedProperty),
            25 => Some(TrbType::SetExtendedProperty),
            32 => Some(TrbType::Transfer),
            33 => Some(TrbType::CommandCompletion),
            34 => Some(TrbType::PortStatusChange),
            35 => Some(TrbType::BandwidthRequest),
            36 => Some(TrbType::Doorbell),
            37 => Some(TrbType::HostController),
            38 => Some(TrbType::DeviceNotification),
            39 => Some(TrbType::MfindexWrap),
            _ => None,
        }
    }
}

// ============================================================================
// Completion Code
// ============================================================================

/// TRB完了コード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Invalid,
    Success,
    DataBufferError,
    BabbleDetected,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailable,
    InvalidStreamType,
    SlotNotEnabled,
    EndpointNotEnabled,
    ShortPacket,
    RingUnderrun,
    RingOverrun,
    VfEventRingFull,
    ParameterError,
    BandwidthOverrun,
    ContextStateError,
    NoPingResponse,
    EventRingFull,
    IncompatibleDevice,
    MissedService,
    CommandRingStopped,
    CommandAborted,
    Stopped,
    StoppedLengthInvalid,
    StoppedShortPacket,
    MaxExitLatencyTooLarge,
    IsochBufferOverrun,
    EventLost,
    Undefined,
    InvalidStreamId,
    SecondaryBandwidth,
    SplitTransaction,
    /// 予約値・ベンダー定義値
    Other(u8),
}

impl CompletionCode {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => CompletionCode::Invalid,
            1 => CompletionCode::Success,
            2 => CompletionCode::DataBufferError,
            3 => CompletionCode::BabbleDetected,
            4 => CompletionCode::UsbTransactionError,
            5 => CompletionCode::TrbError,
            6 => CompletionCode::StallError,
            7 => CompletionCode::ResourceError,
            8 => CompletionCode::BandwidthError,
            9 => CompletionCode::NoSlotsAvailable,
            10 => CompletionCode::InvalidStreamType,
            11 => CompletionCode::SlotNotEnabled,
            12 => CompletionCode::EndpointNotEnabled,
            13 => CompletionCode::ShortPacket,
            14 => CompletionCode::RingUnderrun,
            15 => CompletionCode::RingOverrun,
            16 => CompletionCode::VfEventRingFull,
            17 => CompletionCode::ParameterError,
            18 => CompletionCode::BandwidthOverrun,
            19 => CompletionCode::ContextStateError,
            20 => CompletionCode::NoPingResponse,
            21 => CompletionCode::EventRingFull,
            22 => CompletionCode::IncompatibleDevice,
            23 => CompletionCode::MissedService,
            24 => CompletionCode::CommandRingStopped,
            25 => CompletionCode::CommandAborted,
            26 => CompletionCode::Stopped,
            27 => CompletionCode::StoppedLengthInvalid,
            28 => CompletionCode::StoppedShortPacket,
            29 => CompletionCode::MaxExitLatencyTooLarge,
            31 => CompletionCode::IsochBufferOverrun,
            32 => CompletionCode::EventLost,
            33 => CompletionCode::Undefined,
            34 => CompletionCode::InvalidStreamId,
            35 => CompletionCode::SecondaryBandwidth,
            36 => CompletionCode::SplitTransaction,
            other => CompletionCode::Other(other),
        }
    }

    /// レジスタ値に戻す
    pub fn as_u8(&self) -> u8 {
        match self {
            CompletionCode::Invalid => 0,
            CompletionCode::Success => 1,
            CompletionCode::DataBufferError => 2,
            CompletionCode::BabbleDetected => 3,
            CompletionCode::UsbTransactionError => 4,
            CompletionCode::TrbError => 5,
            CompletionCode::StallError => 6,
            CompletionCode::ResourceError => 7,
            CompletionCode::BandwidthError => 8,
            CompletionCode::NoSlotsAvailable => 9,
            CompletionCode::InvalidStreamType => 10,
            CompletionCode::SlotNotEnabled => 11,
            CompletionCode::EndpointNotEnabled => 12,
            CompletionCode::ShortPacket => 13,
            CompletionCode::RingUnderrun => 14,
            CompletionCode::RingOverrun => 15,
            CompletionCode::VfEventRingFull => 16,
            CompletionCode::ParameterError => 17,
            CompletionCode::BandwidthOverrun => 18,
            CompletionCode::ContextStateError => 19,
            CompletionCode::NoPingResponse => 20,
            CompletionCode::EventRingFull => 21,
            CompletionCode::IncompatibleDevice => 22,
            CompletionCode::MissedService => 23,
            CompletionCode::CommandRingStopped => 24,
            CompletionCode::CommandAborted => 25,
            CompletionCode::Stopped => 26,
            CompletionCode::StoppedLengthInvalid => 27,
            CompletionCode::StoppedShortPacket => 28,
            CompletionCode::MaxExitLatencyTooLarge => 29,
            CompletionCode::IsochBufferOverrun => 31,
            CompletionCode::EventLost => 32,
            CompletionCode::Undefined => 33,
            CompletionCode::InvalidStreamId => 34,
            CompletionCode::SecondaryBandwidth => 35,
            CompletionCode::SplitTransaction => 36,
            CompletionCode::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompletionCode::Success)
    }
}

// ============================================================================
// TRB Structure
// ============================================================================

/// Transfer Request Block (16バイト)
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trb {
    /// Parameter (depends on TRB type)
    pub parameter: u64,
    /// Status
    pub status: u32,
    /// Control
    pub control: u32,
}

impl Trb {
    /// TRBサイズ（バイト）
    pub const SIZE: u64 = 16;

    fn with_type(trb_type: TrbType) -> Self {
        Self {
            parameter: 0,
            status: 0,
            control: (trb_type as u32) << CONTROL_TYPE_SHIFT,
        }
    }

    fn with_slot(mut self, slot_id: SlotId) -> Self {
        self.control |= (slot_id.as_u8() as u32) << CONTROL_SLOT_SHIFT;
        self
    }

    fn with_flag(mut self, flag: u32, set: bool) -> Self {
        if set {
            self.control |= flag;
        }
        self
    }

    /// TRBタイプ値を取得
    pub fn trb_type(&self) -> u8 {
        ((self.control >> CONTROL_TYPE_SHIFT) & CONTROL_TYPE_MASK) as u8
    }

    /// 既知のTRBタイプか
    pub fn kind(&self) -> Option<TrbType> {
        TrbType::from_u8(self.trb_type())
    }

    /// サイクルビットを取得
    pub fn cycle_bit(&self) -> bool {
        (self.control & CONTROL_CYCLE) != 0
    }

    /// サイクルビットを設定
    pub fn set_cycle_bit(&mut self, cycle: bool) {
        if cycle {
            self.control |= CONTROL_CYCLE;
        } else {
            self.control &= !CONTROL_CYCLE;
        }
    }

    /// Link TRB の Toggle Cycle ビット
    pub fn toggle_cycle(&self) -> bool {
        (self.control & CONTROL_TOGGLE_CYCLE) != 0
    }

    /// Interrupt On Completion
    pub fn ioc(&self) -> bool {
        (self.control & CONTROL_IOC) != 0
    }

    /// スロットID（コマンド/イベントTRB）
    pub fn slot_id(&self) -> SlotId {
        SlotId(((self.control >> CONTROL_SLOT_SHIFT) & CONTROL_SLOT_MASK) as u8)
    }

    /// エンドポイントID (DCI)
    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> CONTROL_ENDPOINT_SHIFT) & CONTROL_ENDPOINT_MASK) as u8
    }

    /// イベントTRBの完了コード
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_u8((self.status >> STATUS_COMPLETION_SHIFT) as u8)
    }

    /// Transfer Event の残り転送長
    pub fn transfer_length(&self) -> u32 {
        self.status & STATUS_TRANSFER_LENGTH_MASK
    }

    /// Command Completion / Transfer Event が指すTRBのアドレス
    pub fn trb_pointer(&self) -> u64 {
        self.parameter & !0xF
    }

    /// Port Status Change Event のポートID
    pub fn port_id(&self) -> u8 {
        ((self.parameter >> 24) & 0xFF) as u8
    }

    // ========================================================================
    // Link / Command TRBs
    // ========================================================================

    /// Link TRB を作成
    pub fn link(next_ring: u64, toggle_cycle: bool, cycle: bool) -> Self {
        let mut trb = Self::with_type(TrbType::Link).with_flag(CONTROL_TOGGLE_CYCLE, toggle_cycle);
        trb.parameter = next_ring & !0xF;
        trb.set_cycle_bit(cycle);
        trb
    }

    /// NoOp コマンドTRB を作成
    pub fn noop_command() -> Self {
        Self::with_type(TrbType::NoOpCommand)
    }

    /// Enable Slot コマンドTRB を作成
    pub fn enable_slot() -> Self {
        Self::with_type(TrbType::EnableSlot)
    }

    /// Disable Slot コマンドTRB を作成
    pub fn disable_slot(slot_id: SlotId) -> Self {
        Self::with_type(TrbType::DisableSlot).with_slot(slot_id)
    }

    /// Address Device コマンドTRB を作成
    pub fn address_device(input_context_ptr: u64, slot_id: SlotId, bsr: bool) -> Self {
        let mut trb = Self::with_type(TrbType::AddressDevice)
            .with_slot(slot_id)
            .with_flag(CONTROL_BSR_DC, bsr);
        trb.parameter = input_context_ptr & !0xF;
        trb
    }

    /// Configure Endpoint コマンドTRB を作成
    pub fn configure_endpoint(input_context_ptr: u64, slot_id: SlotId, deconfigure: bool) -> Self {
        let mut trb = Self::with_type(TrbType::ConfigureEndpoint)
            .with_slot(slot_id)
            .with_flag(CONTROL_BSR_DC, deconfigure);
        trb.parameter = input_context_ptr & !0xF;
        trb
    }

    /// Evaluate Context コマンドTRB を作成
    pub fn evaluate_context(input_context_ptr: u64, slot_id: SlotId) -> Self {
        let mut trb = Self::with_type(TrbType::EvaluateContext).with_slot(slot_id);
        trb.parameter = input_context_ptr & !0xF;
        trb
    }

    /// Reset Endpoint コマンドTRB を作成
    pub fn reset_endpoint(slot_id: SlotId, dci: u8) -> Self {
        let mut trb = Self::with_type(TrbType::ResetEndpoint).with_slot(slot_id);
        trb.control |= ((dci as u32) & CONTROL_ENDPOINT_MASK) << CONTROL_ENDPOINT_SHIFT;
        trb
    }

    /// Stop Endpoint コマンドTRB を作成
    pub fn stop_endpoint(slot_id: SlotId, dci: u8) -> Self {
        let mut trb = Self::with_type(TrbType::StopEndpoint).with_slot(slot_id);
        trb.control |= ((dci as u32) & CONTROL_ENDPOINT_MASK) << CONTROL_ENDPOINT_SHIFT;
        trb
    }

    // ========================================================================
    // Transfer TRBs
    // ========================================================================

    /// Normal TRB を作成
    pub fn normal(data_ptr: u64, length: u32, ioc: bool, chain: bool) -> Self {
        let mut trb = Self::with_type(TrbType::Normal)
            .with_flag(CONTROL_IOC, ioc)
            .with_flag(CONTROL_CHAIN, chain);
        trb.parameter = data_ptr;
        trb.status = length & 0x1FFFF;
        trb
    }

    /// Setup Stage TRB を作成 (trt: 0=No Data, 2=OUT, 3=IN)
    pub fn setup_stage(
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        trt: u8,
    ) -> Self {
        let mut trb = Self::with_type(TrbType::SetupStage).with_flag(CONTROL_IDT, true);
        trb.parameter = (request_type as u64)
            | ((request as u64) << 8)
            | ((value as u64) << 16)
            | ((index as u64) << 32)
            | ((length as u64) << 48);
        trb.status = 8;
        trb.control |= ((trt as u32) & 0x3) << 16;
        trb
    }

    /// Data Stage TRB を作成
    pub fn data_stage(data_ptr: u64, length: u32, dir_in: bool) -> Self {
        let mut trb = Self::with_type(TrbType::DataStage);
        trb.parameter = data_ptr;
        trb.status = length & 0x1FFFF;
        trb.control |= (dir_in as u32) << 16;
        trb
    }

    /// Status Stage TRB を作成
    pub fn status_stage(dir_in: bool) -> Self {
        let mut trb = Self::with_type(TrbType::StatusStage).with_flag(CONTROL_IOC, true);
        trb.control |= (dir_in as u32) << 16;
        trb
    }

    // ========================================================================
    // Event TRBs (シミュレーション・テスト用の構築)
    // ========================================================================

    /// Command Completion Event を作成
    pub fn command_completion_event(command_trb: u64, code: CompletionCode, slot_id: SlotId) -> Self {
        let mut trb = Self::with_type(TrbType::CommandCompletion).with_slot(slot_id);
        trb.parameter = command_trb & !0xF;
        trb.status = (code.as_u8() as u32) << STATUS_COMPLETION_SHIFT;
        trb
    }

    /// Port Status Change Event を作成
    pub fn port_status_change_event(port_id: u8) -> Self {
        let mut trb = Self::with_type(TrbType::PortStatusChange);
        trb.parameter = (port_id as u64) << 24;
        trb.status = (CompletionCode::Success.as_u8() as u32) << STATUS_COMPLETION_SHIFT;
        trb
    }

    /// Transfer Event を作成
    pub fn transfer_event(
        trb_ptr: u64,
        code: CompletionCode,
        residual: u32,
        slot_id: SlotId,
        dci: u8,
    ) -> Self {
        let mut trb = Self::with_type(TrbType::Transfer).with_slot(slot_id);
        trb.parameter = trb_ptr;
        trb.status = ((code.as_u8() as u32) << STATUS_COMPLETION_SHIFT)
            | (residual & STATUS_TRANSFER_LENGTH_MASK);
        trb.control |= ((dci as u32) & CONTROL_ENDPOINT_MASK) << CONTROL_ENDPOINT_SHIFT;
        trb
    }

    /// Host Controller Event を作成
    pub fn host_controller_event(code: CompletionCode) -> Self {
        let mut trb = Self::with_type(TrbType::HostController);
        trb.status = (code.as_u8() as u32) << STATUS_COMPLETION_SHIFT;
        trb
    }
}

// ============================================================================
// Event Ring Segment Table Entry
// ============================================================================

/// イベントリングセグメントテーブルエントリ (16バイト)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErstEntry {
    /// リングセグメントベースアドレス（64バイトアライン）
    pub ring_segment_base: u64,
    /// リングセグメントサイズ（TRB数、下位16ビットのみ有効）
    pub ring_segment_size: u32,
    /// 予約
    pub reserved: u32,
}
