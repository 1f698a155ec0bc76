// ============================================================================
// src/io/usb/mod.rs - USB Subsystem Types
// ============================================================================
//!
//! # USBサブシステム
//!
//! xHCI ドライバの公開APIで使う USB レベルの型。
//!
//! ## 型安全性
//! - Newtype パターンによるスロット/ポート/エンドポイント管理
//! - エンドポイントディスクリプタはバイト列から明示的にデコード

#![allow(dead_code)]

pub mod xhci;

// ============================================================================
// USB Speed
// ============================================================================

/// USB 速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Low Speed (1.5 Mbps)
    Low,
    /// Full Speed (12 Mbps)
    Full,
    /// High Speed (480 Mbps)
    High,
    /// Super Speed (5 Gbps)
    Super,
    /// Super Speed+ (10 Gbps)
    SuperPlus,
}

impl UsbSpeed {
    /// PORTSC の Port Speed (プロトコル速度ID、デフォルトマッピング) から変換
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(UsbSpeed::Full),
            2 => Some(UsbSpeed::Low),
            3 => Some(UsbSpeed::High),
            4 => Some(UsbSpeed::Super),
            5 => Some(UsbSpeed::SuperPlus),
            _ => None,
        }
    }

    /// xHCI スロットコンテキスト用の速度値
    pub fn to_slot_speed(&self) -> u8 {
        match self {
            UsbSpeed::Low => 2,
            UsbSpeed::Full => 1,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 4,
            UsbSpeed::SuperPlus => 5,
        }
    }

    /// 最大パケットサイズ（コントロールエンドポイント）
    pub fn default_max_packet_size(&self) -> u16 {
        match self {
            UsbSpeed::Low => 8,
            UsbSpeed::Full => 64,
            UsbSpeed::High => 64,
            UsbSpeed::Super | UsbSpeed::SuperPlus => 512,
        }
    }

    /// USB 3.x か
    pub fn is_super_speed(&self) -> bool {
        matches!(self, UsbSpeed::Super | UsbSpeed::SuperPlus)
    }
}

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// xHCIスロットID (型安全、1-based、0 は無効)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u8);

impl SlotId {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// ルートハブポート番号 (型安全、xHCI と同じく 1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortNumber(pub u8);

impl PortNumber {
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// ポートレジスタ配列のインデックス (0-based)
    pub fn index(&self) -> usize {
        (self.0 as usize).saturating_sub(1)
    }
}

/// エンドポイントアドレス (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// コントロールエンドポイント
    pub const CONTROL: Self = Self(0);

    /// エンドポイント番号を取得 (0-15)
    pub fn number(&self) -> u8 {
        self.0 & 0x0F
    }

    /// 方向を取得 (true = IN, false = OUT)
    pub fn is_in(&self) -> bool {
        (self.0 & 0x80) != 0
    }

    /// INエンドポイントを作成
    pub fn in_endpoint(num: u8) -> Self {
        Self(0x80 | (num & 0x0F))
    }

    /// OUTエンドポイントを作成
    pub fn out_endpoint(num: u8) -> Self {
        Self(num & 0x0F)
    }

    /// xHCI DCI (Device Context Index) に変換
    pub fn to_dci(&self) -> u8 {
        let num = self.number();
        if num == 0 {
            1 // Control endpoint
        } else if self.is_in() {
            num * 2 + 1
        } else {
            num * 2
        }
    }
}

// ============================================================================
// USB Transfer Types
// ============================================================================

/// USB転送タイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// コントロール転送
    Control,
    /// アイソクロナス転送
    Isochronous,
    /// バルク転送
    Bulk,
    /// インタラプト転送
    Interrupt,
}

// ============================================================================
// Endpoint Descriptor
// ============================================================================

/// エンドポイントディスクリプタ（Configure Endpoint の入力）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// エンドポイントアドレス
    pub address: EndpointAddress,
    /// 属性 (bmAttributes)
    pub attributes: u8,
    /// 最大パケットサイズ (wMaxPacketSize)
    pub max_packet_size: u16,
    /// ポーリング間隔 (bInterval)
    pub interval: u8,
    /// SuperSpeed コンパニオンの bMaxBurst
    pub max_burst: u8,
}

impl EndpointDescriptor {
    /// ディスクリプタタイプ値
    pub const DESCRIPTOR_TYPE: u8 = 5;

    /// 7バイトの標準ディスクリプタからデコード
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || data[0] < 7 || data[1] != Self::DESCRIPTOR_TYPE {
            return None;
        }
        Some(Self {
            address: EndpointAddress(data[2]),
            attributes: data[3],
            max_packet_size: u16::from_le_bytes([data[4], data[5]]),
            interval: data[6],
            max_burst: 0,
        })
    }

    /// 転送タイプ
    pub fn transfer_type(&self) -> TransferType {
        match self.attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    /// 最大パケットサイズ（追加トランザクション数を除く）
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x07FF
    }

    /// エンドポイントコンテキストの Interval 値 (2^n × 125us)
    pub fn xhci_interval(&self, speed: UsbSpeed) -> u8 {
        match (self.transfer_type(), speed) {
            (TransferType::Interrupt, UsbSpeed::Low | UsbSpeed::Full) => {
                // bInterval はフレーム (1ms) 単位 → 125us 単位の log2
                let microframes = (self.interval.max(1) as u32) * 8;
                (31 - microframes.leading_zeros()) as u8
            }
            (TransferType::Interrupt | TransferType::Isochronous, _) => {
                self.interval.clamp(1, 16) - 1
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_dci() {
        assert_eq!(EndpointAddress::CONTROL.to_dci(), 1);
        assert_eq!(EndpointAddress::out_endpoint(1).to_dci(), 2);
        assert_eq!(EndpointAddress::in_endpoint(1).to_dci(), 3);
        assert_eq!(EndpointAddress::in_endpoint(15).to_dci(), 31);
    }

    #[test]
    fn test_endpoint_descriptor_decode() {
        let raw = [7, 5, 0x81, 0x03, 0x08, 0x00, 10];
        let desc = EndpointDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(desc.address, EndpointAddress::in_endpoint(1));
        assert_eq!(desc.transfer_type(), TransferType::Interrupt);
        assert_eq!(desc.packet_size(), 8);
        // 10ms = 80 マイクロフレーム → 2^6 = 64
        assert_eq!(desc.xhci_interval(UsbSpeed::Full), 6);
        assert_eq!(desc.xhci_interval(UsbSpeed::High), 9);

        assert!(EndpointDescriptor::from_bytes(&raw[..6]).is_none());
        assert!(EndpointDescriptor::from_bytes(&[7, 4, 0x81, 3, 8, 0, 10]).is_none());
    }

    #[test]
    fn test_port_number_index() {
        assert_eq!(PortNumber(1).index(), 0);
        assert_eq!(PortNumber(4).index(), 3);
    }
}
