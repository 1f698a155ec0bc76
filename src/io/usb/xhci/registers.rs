// ============================================================================
// src/io/usb/xhci/registers.rs - xHCI Register Views
// ============================================================================
//!
//! # xHCI レジスタビュー
//!
//! ケーパビリティ / オペレーショナル / ポート / ランタイム(インタラプタ) の
//! 各レジスタブロックに対する型付きアクセス。
//! ビットフィールドはすべて明示的なマスクとシフトで取り出す。
//!
//! アクセスはすべて [`RegisterIo`] 経由（volatile）。

use bitflags::bitflags;

use crate::error::{XhciError, XhciResult};
use crate::io::mmio::RegisterIo;
use crate::io::usb::UsbSpeed;

// ============================================================================
// Capability Register Offsets
// ============================================================================

const CAPLENGTH: usize = 0x00;
const HCSPARAMS1: usize = 0x04;
const HCSPARAMS2: usize = 0x08;
const HCSPARAMS3: usize = 0x0C;
const HCCPARAMS1: usize = 0x10;
const DBOFF: usize = 0x14;
const RTSOFF: usize = 0x18;
const HCCPARAMS2: usize = 0x1C;

// ============================================================================
// Operational Register Offsets
// ============================================================================

/// USB Command
pub const USBCMD: usize = 0x00;
/// USB Status
pub const USBSTS: usize = 0x04;
/// Page Size
pub const PAGESIZE: usize = 0x08;
/// Device Notification Control
pub const DNCTRL: usize = 0x14;
/// Command Ring Control
pub const CRCR: usize = 0x18;
/// Device Context Base Address Array Pointer
pub const DCBAAP: usize = 0x30;
/// Configure
pub const CONFIG: usize = 0x38;
/// Port Register Set (port 1 at offset 0x400)
pub const PORTSC_BASE: usize = 0x400;
pub const PORT_REGISTER_SIZE: usize = 0x10;

/// PORTPMSC レジスタオフセット
pub const PORTPMSC_OFFSET: usize = 0x04;
/// PORTLI レジスタオフセット
pub const PORTLI_OFFSET: usize = 0x08;
/// PORTHLPMC レジスタオフセット
pub const PORTHLPMC_OFFSET: usize = 0x0C;

// ============================================================================
// Runtime Register Offsets
// ============================================================================

/// Microframe Index
pub const MFINDEX: usize = 0x00;
/// Interrupter Register Set Base
pub const IR0: usize = 0x20;
/// インタラプタレジスタセットのサイズ
pub const INTERRUPTER_STRIDE: usize = 0x20;
/// Interrupter Management
pub const IMAN: usize = 0x00;
/// Interrupter Moderation
pub const IMOD: usize = 0x04;
/// Event Ring Segment Table Size
pub const ERSTSZ: usize = 0x08;
/// Event Ring Segment Table Base Address
pub const ERSTBA: usize = 0x10;
/// Event Ring Dequeue Pointer
pub const ERDP: usize = 0x18;

/// IMAN: Interrupt Pending (W1C)
pub const IMAN_IP: u32 = 1 << 0;
/// IMAN: Interrupt Enable
pub const IMAN_IE: u32 = 1 << 1;
/// ERDP: Event Handler Busy (W1C)
pub const ERDP_EHB: u64 = 1 << 3;

// ============================================================================
// PORTSC Bits
// ============================================================================

/// Current Connect Status
pub const PORTSC_CCS: u32 = 1 << 0;
/// Port Enabled/Disabled (1 を書くとポートが無効化される)
pub const PORTSC_PED: u32 = 1 << 1;
/// Over-current Active
pub const PORTSC_OCA: u32 = 1 << 3;
/// Port Reset
pub const PORTSC_PR: u32 = 1 << 4;
/// Port Link State (bits 5-8)
pub const PORTSC_PLS_MASK: u32 = 0xF << 5;
pub const PORTSC_PLS_SHIFT: u32 = 5;
/// Port Power
pub const PORTSC_PP: u32 = 1 << 9;
/// Port Speed (bits 10-13)
pub const PORTSC_SPEED_MASK: u32 = 0xF << 10;
pub const PORTSC_SPEED_SHIFT: u32 = 10;
/// Port Indicator Control (bits 14-15)
pub const PORTSC_PIC_MASK: u32 = 0x3 << 14;
/// Link State Write Strobe
pub const PORTSC_LWS: u32 = 1 << 16;
/// Connect Status Change
pub const PORTSC_CSC: u32 = 1 << 17;
/// Port Enabled/Disabled Change
pub const PORTSC_PEC: u32 = 1 << 18;
/// Warm Port Reset Change (USB3 only)
pub const PORTSC_WRC: u32 = 1 << 19;
/// Over-current Change
pub const PORTSC_OCC: u32 = 1 << 20;
/// Port Reset Change
pub const PORTSC_PRC: u32 = 1 << 21;
/// Port Link State Change
pub const PORTSC_PLC: u32 = 1 << 22;
/// Port Config Error Change
pub const PORTSC_CEC: u32 = 1 << 23;

/// Write-1-to-clear ビット
pub const PORTSC_W1C_BITS: u32 =
    PORTSC_CSC | PORTSC_PEC | PORTSC_WRC | PORTSC_OCC | PORTSC_PRC | PORTSC_PLC | PORTSC_CEC;

/// 保持すべきビット（読み取り後の書き戻し時）
pub const PORTSC_PRESERVE_BITS: u32 = PORTSC_PP | PORTSC_PIC_MASK;

// ============================================================================
// Register Bit Sets
// ============================================================================

bitflags! {
    /// USBCMD
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCommand: u32 {
        /// Run/Stop
        const RUN = 1 << 0;
        /// Host Controller Reset
        const HCRST = 1 << 1;
        /// Interrupter Enable
        const INTE = 1 << 2;
        /// Host System Error Enable
        const HSEE = 1 << 3;
        /// Light Host Controller Reset
        const LHCRST = 1 << 7;
        /// Controller Save State
        const CSS = 1 << 8;
        /// Controller Restore State
        const CRS = 1 << 9;
        /// Enable Wrap Event
        const EWE = 1 << 10;
    }
}

bitflags! {
    /// USBSTS
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbStatus: u32 {
        /// HCHalted
        const HCH = 1 << 0;
        /// Host System Error (W1C)
        const HSE = 1 << 2;
        /// Event Interrupt (W1C)
        const EINT = 1 << 3;
        /// Port Change Detect (W1C)
        const PCD = 1 << 4;
        /// Save State Status
        const SSS = 1 << 8;
        /// Restore State Status
        const RSS = 1 << 9;
        /// Save/Restore Error (W1C)
        const SRE = 1 << 10;
        /// Controller Not Ready
        const CNR = 1 << 11;
        /// Host Controller Error
        const HCE = 1 << 12;
    }
}

bitflags! {
    /// CRCR の制御ビット（下位6ビット）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandRingControl: u64 {
        /// Ring Cycle State
        const RCS = 1 << 0;
        /// Command Stop
        const CS = 1 << 1;
        /// Command Abort
        const CA = 1 << 2;
        /// Command Ring Running
        const CRR = 1 << 3;
    }
}

/// CRCR のポインタフィールド（64バイトアライン、58ビット）
pub const CRCR_POINTER_MASK: u64 = !0x3F;

/// CONFIG.MaxSlotsEn
const CONFIG_MAX_SLOTS_MASK: u32 = 0xFF;

// ============================================================================
// Capability Registers
// ============================================================================

/// ケーパビリティレジスタ（起動時に一度だけ読み取るスナップショット）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRegisters {
    caplength: u8,
    hci_version: u16,
    hcsparams1: u32,
    hcsparams2: u32,
    hcsparams3: u32,
    hccparams1: u32,
    dboff: u32,
    rtsoff: u32,
    hccparams2: u32,
}

impl CapabilityRegisters {
    /// ケーパビリティレジスタを読み取り
    pub fn read(io: &impl RegisterIo) -> Self {
        let cap = io.read32(CAPLENGTH);
        Self {
            caplength: (cap & 0xFF) as u8,
            hci_version: (cap >> 16) as u16,
            hcsparams1: io.read32(HCSPARAMS1),
            hcsparams2: io.read32(HCSPARAMS2),
            hcsparams3: io.read32(HCSPARAMS3),
            hccparams1: io.read32(HCCPARAMS1),
            dboff: io.read32(DBOFF),
            rtsoff: io.read32(RTSOFF),
            hccparams2: io.read32(HCCPARAMS2),
        }
    }

    /// ケーパビリティレジスタ長 = オペレーショナルレジスタのオフセット
    pub fn caplength(&self) -> u8 {
        self.caplength
    }

    /// HCI バージョン (BCD)
    pub fn hci_version(&self) -> u16 {
        self.hci_version
    }

    /// 最大スロット数
    pub fn max_slots(&self) -> u8 {
        (self.hcsparams1 & 0xFF) as u8
    }

    /// 最大インタラプタ数
    pub fn max_interrupters(&self) -> u16 {
        ((self.hcsparams1 >> 8) & 0x7FF) as u16
    }

    /// 最大ポート数
    pub fn max_ports(&self) -> u8 {
        ((self.hcsparams1 >> 24) & 0xFF) as u8
    }

    /// Isochronous Scheduling Threshold
    pub fn ist(&self) -> u8 {
        (self.hcsparams2 & 0x0F) as u8
    }

    /// Event Ring Segment Table Max (2^n エントリ)
    pub fn erst_max(&self) -> u8 {
        ((self.hcsparams2 >> 4) & 0x0F) as u8
    }

    /// 必要なスクラッチパッドバッファ数
    ///
    /// 上位5ビット (21..25) と下位5ビット (27..31) に分割されている。
    pub fn max_scratchpad_buffers(&self) -> u16 {
        let hi = ((self.hcsparams2 >> 21) & 0x1F) as u16;
        let lo = ((self.hcsparams2 >> 27) & 0x1F) as u16;
        (hi << 5) | lo
    }

    /// U1 Device Exit Latency (us)
    pub fn u1_device_exit_latency(&self) -> u8 {
        (self.hcsparams3 & 0xFF) as u8
    }

    /// U2 Device Exit Latency (us)
    pub fn u2_device_exit_latency(&self) -> u16 {
        (self.hcsparams3 >> 16) as u16
    }

    /// 64ビットアドレッシングサポート
    pub fn ac64(&self) -> bool {
        (self.hccparams1 & 0x01) != 0
    }

    /// 64バイトコンテキストサイズ
    pub fn context_size_64(&self) -> bool {
        (self.hccparams1 & 0x04) != 0
    }

    /// コンテキスト1つのバイト数
    pub fn context_size(&self) -> usize {
        if self.context_size_64() { 64 } else { 32 }
    }

    /// HCCPARAMS2 (生値)
    pub fn hccparams2(&self) -> u32 {
        self.hccparams2
    }

    /// オペレーショナルレジスタのオフセット
    pub fn operational_offset(&self) -> usize {
        self.caplength as usize
    }

    /// ランタイムレジスタのオフセット
    pub fn runtime_offset(&self) -> usize {
        (self.rtsoff & !0x1F) as usize
    }

    /// ドアベルアレイのオフセット
    pub fn doorbell_offset(&self) -> usize {
        (self.dboff & !0x03) as usize
    }
}

// ============================================================================
// Operational Registers
// ============================================================================

/// オペレーショナルレジスタ
pub struct OperationalRegisters<'a, R: RegisterIo> {
    io: &'a R,
    base: usize,
}

impl<'a, R: RegisterIo> OperationalRegisters<'a, R> {
    pub fn new(io: &'a R, base: usize) -> Self {
        Self { io, base }
    }

    pub fn usbcmd(&self) -> UsbCommand {
        UsbCommand::from_bits_retain(self.io.read32(self.base + USBCMD))
    }

    pub fn set_usbcmd(&self, cmd: UsbCommand) {
        self.io.write32(self.base + USBCMD, cmd.bits());
    }

    /// USBCMD の指定ビットを読み取り・変更・書き戻し
    pub fn update_usbcmd(&self, set: UsbCommand, clear: UsbCommand) {
        let cmd = (self.usbcmd() - clear) | set;
        self.set_usbcmd(cmd);
    }

    pub fn usbsts(&self) -> UsbStatus {
        UsbStatus::from_bits_retain(self.io.read32(self.base + USBSTS))
    }

    /// USBSTS の W1C ビットを確認応答（指定ビットのみ書く）
    pub fn ack_usbsts(&self, bits: UsbStatus) {
        let w1c = UsbStatus::HSE | UsbStatus::EINT | UsbStatus::PCD | UsbStatus::SRE;
        self.io.write32(self.base + USBSTS, (bits & w1c).bits());
    }

    /// ページサイズ（バイト）: bit n が立っていれば 2^(n+12)
    pub fn page_size(&self) -> usize {
        let raw = self.io.read32(self.base + PAGESIZE) & 0xFFFF;
        if raw == 0 {
            return 4096;
        }
        1usize << (raw.trailing_zeros() + 12)
    }

    pub fn set_dnctrl(&self, mask: u16) {
        self.io.write32(self.base + DNCTRL, mask as u32);
    }

    pub fn dnctrl(&self) -> u16 {
        self.io.read32(self.base + DNCTRL) as u16
    }

    /// CRCR の制御ビット
    pub fn crcr(&self) -> CommandRingControl {
        CommandRingControl::from_bits_truncate(self.io.read64(self.base + CRCR))
    }

    /// コマンドリングのポインタと RCS を設定
    ///
    /// CRR=1 の間はポインタを書き換えてはならない。
    pub fn set_command_ring(&self, ring_phys: u64, cycle: bool) -> XhciResult<()> {
        if self.crcr().contains(CommandRingControl::CRR) {
            return Err(XhciError::CommandRingRunning);
        }
        let mut value = ring_phys & CRCR_POINTER_MASK;
        if cycle {
            value |= CommandRingControl::RCS.bits();
        }
        self.io.write64(self.base + CRCR, value);
        Ok(())
    }

    pub fn dcbaap(&self) -> u64 {
        self.io.read64(self.base + DCBAAP)
    }

    pub fn set_dcbaap(&self, phys: u64) {
        self.io.write64(self.base + DCBAAP, phys & !0x3F);
    }

    /// CONFIG.MaxSlotsEn
    pub fn max_slots_enabled(&self) -> u8 {
        (self.io.read32(self.base + CONFIG) & CONFIG_MAX_SLOTS_MASK) as u8
    }

    /// CONFIG.MaxSlotsEn を設定（ビット 0..7 のみ置き換え、他は保持）
    pub fn set_max_slots_enabled(&self, slots: u8) {
        let config = self.io.read32(self.base + CONFIG);
        let value = (config & !CONFIG_MAX_SLOTS_MASK) | slots as u32;
        self.io.write32(self.base + CONFIG, value);
    }

    /// ポートレジスタセット (1-based)
    pub fn port(&self, port: u8) -> PortRegisterSet<'a, R> {
        let offset = self.base + PORTSC_BASE + (port as usize).saturating_sub(1) * PORT_REGISTER_SIZE;
        PortRegisterSet {
            io: self.io,
            base: offset,
        }
    }
}

// ============================================================================
// Port Registers
// ============================================================================

/// PORTSC の読み取りスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus(pub u32);

impl PortStatus {
    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn connected(&self) -> bool {
        (self.0 & PORTSC_CCS) != 0
    }

    pub fn enabled(&self) -> bool {
        (self.0 & PORTSC_PED) != 0
    }

    pub fn over_current(&self) -> bool {
        (self.0 & PORTSC_OCA) != 0
    }

    pub fn in_reset(&self) -> bool {
        (self.0 & PORTSC_PR) != 0
    }

    pub fn powered(&self) -> bool {
        (self.0 & PORTSC_PP) != 0
    }

    /// Port Link State (生値)
    pub fn link_state(&self) -> u8 {
        ((self.0 & PORTSC_PLS_MASK) >> PORTSC_PLS_SHIFT) as u8
    }

    /// Port Speed (プロトコル速度ID)
    pub fn speed_code(&self) -> u8 {
        ((self.0 & PORTSC_SPEED_MASK) >> PORTSC_SPEED_SHIFT) as u8
    }

    pub fn speed(&self) -> Option<UsbSpeed> {
        UsbSpeed::from_code(self.speed_code())
    }

    /// 立っている変更ビット
    pub fn change_bits(&self) -> u32 {
        self.0 & PORTSC_W1C_BITS
    }

    pub fn has_changes(&self) -> bool {
        self.change_bits() != 0
    }

    pub fn connect_changed(&self) -> bool {
        (self.0 & PORTSC_CSC) != 0
    }

    pub fn reset_changed(&self) -> bool {
        (self.0 & PORTSC_PRC) != 0
    }

    pub fn over_current_changed(&self) -> bool {
        (self.0 & PORTSC_OCC) != 0
    }
}

/// ポートごとのレジスタセット
pub struct PortRegisterSet<'a, R: RegisterIo> {
    io: &'a R,
    base: usize,
}

impl<R: RegisterIo> PortRegisterSet<'_, R> {
    pub fn portsc(&self) -> PortStatus {
        PortStatus(self.io.read32(self.base))
    }

    /// 保持ビットに `extra` を加えて書く（PED と W1C ビットは書かない）
    fn write_preserving(&self, status: PortStatus, extra: u32) {
        let value = (status.raw() & PORTSC_PRESERVE_BITS) | extra;
        self.io.write32(self.base, value & !PORTSC_PED);
    }

    /// `status` で立っていた変更ビットだけを W1C でクリア
    pub fn clear_change_bits(&self, status: PortStatus) {
        self.write_preserving(status, status.change_bits());
    }

    /// ポート電源をオン
    pub fn power_on(&self) {
        let status = self.portsc();
        if !status.powered() {
            self.write_preserving(status, PORTSC_PP);
        }
    }

    /// ポートリセットを開始
    pub fn start_reset(&self) {
        let status = self.portsc();
        self.write_preserving(status, PORTSC_PR);
    }

    pub fn portpmsc(&self) -> u32 {
        self.io.read32(self.base + PORTPMSC_OFFSET)
    }

    pub fn portli(&self) -> u32 {
        self.io.read32(self.base + PORTLI_OFFSET)
    }

    pub fn porthlpmc(&self) -> u32 {
        self.io.read32(self.base + PORTHLPMC_OFFSET)
    }
}

// ============================================================================
// Interrupter Registers
// ============================================================================

/// ランタイムのインタラプタレジスタセット
pub struct InterrupterRegisters<'a, R: RegisterIo> {
    io: &'a R,
    base: usize,
}

impl<'a, R: RegisterIo> InterrupterRegisters<'a, R> {
    /// `runtime_base` はランタイムレジスタの先頭オフセット
    pub fn new(io: &'a R, runtime_base: usize, index: usize) -> Self {
        Self {
            io,
            base: runtime_base + IR0 + index * INTERRUPTER_STRIDE,
        }
    }

    pub fn iman(&self) -> u32 {
        self.io.read32(self.base + IMAN)
    }

    /// 割り込み有効/無効（IP は書かない）
    pub fn set_interrupt_enable(&self, enable: bool) {
        let value = if enable { IMAN_IE } else { 0 };
        self.io.write32(self.base + IMAN, value);
    }

    /// IMAN.IP を W1C でクリア（IE は保持）
    pub fn ack_interrupt_pending(&self) {
        let iman = self.iman();
        self.io.write32(self.base + IMAN, (iman & IMAN_IE) | IMAN_IP);
    }

    pub fn set_moderation(&self, interval: u16) {
        self.io.write32(self.base + IMOD, interval as u32);
    }

    pub fn imod(&self) -> u32 {
        self.io.read32(self.base + IMOD)
    }

    /// イベントリングを登録
    ///
    /// ERSTSZ → ERDP → ERSTBA の順に書く（ERSTBA の書き込みで有効化される）。
    pub fn set_event_ring(&self, erst_size: u16, erst_phys: u64, dequeue_phys: u64) {
        self.io.write32(self.base + ERSTSZ, erst_size as u32);
        self.io.write64(self.base + ERDP, dequeue_phys & !0xF);
        self.io.write64(self.base + ERSTBA, erst_phys & !0x3F);
    }

    /// デキューポインタを更新し、EHB をクリア
    pub fn update_dequeue_pointer(&self, dequeue_phys: u64) {
        self.io.write64(self.base + ERDP, (dequeue_phys & !0xF) | ERDP_EHB);
    }

    pub fn erdp(&self) -> u64 {
        self.io.read64(self.base + ERDP)
    }

    pub fn erstba(&self) -> u64 {
        self.io.read64(self.base + ERSTBA)
    }

    pub fn erstsz(&self) -> u32 {
        self.io.read32(self.base + ERSTSZ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::usb::xhci::sim::SimulatedController;

    #[test]
    fn test_capability_decode() {
        let sim = SimulatedController::new();
        // MaxScratchpadBuffers = 0x2A5 → hi = 0x15 (bits 21..25), lo = 0x05 (bits 27..31)
        sim.set_hcsparams2((0x15 << 21) | (0x05 << 27) | (0x3 << 4));
        let caps = CapabilityRegisters::read(&sim);

        assert_eq!(caps.max_slots(), 32);
        assert_eq!(caps.max_ports(), 4);
        assert_eq!(caps.max_interrupters(), 8);
        assert_eq!(caps.erst_max(), 3);
        assert_eq!(caps.max_scratchpad_buffers(), (0x15 << 5) | 0x05);
        assert_eq!(caps.operational_offset(), 0x20);
        assert_eq!(caps.hci_version(), 0x0110);
        assert_eq!(caps.context_size(), 32);
    }

    #[test]
    fn test_set_max_slots_preserves_upper_bits() {
        let sim = SimulatedController::new();
        let caps = CapabilityRegisters::read(&sim);
        let op = OperationalRegisters::new(&sim, caps.operational_offset());

        sim.write32(caps.operational_offset() + CONFIG, 0x0000_0300 | 0x11);
        op.set_max_slots_enabled(8);
        assert_eq!(op.max_slots_enabled(), 8);
        assert_eq!(sim.read32(caps.operational_offset() + CONFIG), 0x0000_0308);
    }

    #[test]
    fn test_command_ring_pointer_refused_while_running() {
        let sim = SimulatedController::new();
        let caps = CapabilityRegisters::read(&sim);
        let op = OperationalRegisters::new(&sim, caps.operational_offset());

        sim.set_command_ring_running(true);
        assert_eq!(op.set_command_ring(0x10_0000, true), Err(XhciError::CommandRingRunning));

        sim.set_command_ring_running(false);
        op.set_command_ring(0x10_0000, true).unwrap();
        assert_eq!(sim.crcr_written(), Some(0x10_0001));
    }

    #[test]
    fn test_port_change_clear_never_writes_ped() {
        let sim = SimulatedController::new();
        let caps = CapabilityRegisters::read(&sim);
        let op = OperationalRegisters::new(&sim, caps.operational_offset());

        sim.set_portsc(2, PORTSC_CCS | PORTSC_PED | PORTSC_PP | PORTSC_CSC | PORTSC_PRC | (4 << 10));
        let port = op.port(2);
        let status = port.portsc();
        assert_eq!(status.speed(), Some(UsbSpeed::Super));
        assert!(status.connect_changed());

        port.clear_change_bits(status);
        let after = port.portsc();
        assert!(!after.has_changes());
        assert!(after.enabled());
        assert!(after.powered());
    }

    #[test]
    fn test_page_size_decode() {
        let sim = SimulatedController::new();
        let caps = CapabilityRegisters::read(&sim);
        let op = OperationalRegisters::new(&sim, caps.operational_offset());
        assert_eq!(op.page_size(), 4096);
    }
}
