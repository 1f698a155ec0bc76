// ============================================================================
// src/config.rs - Driver Configuration
// ============================================================================
//!
//! コントローラ構築時に渡す設定。
//! ハードウェア定数は `io::usb::xhci` 側のモジュール定数に置く。

use crate::io::usb::xhci::ring_manager::MAX_SEGMENT_TRBS;

/// xHCI ドライバ設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XhciConfig {
    /// 有効化するスロット数の要求値（ケーパビリティの MaxSlots で頭打ち）
    pub max_slots: u8,
    /// レジスタ条件待ちの最大ポーリング回数
    pub poll_limit: u32,
    /// コマンドリングのTRB数（リンクTRBを含む、最大 4096）
    pub command_ring_size: usize,
    /// イベントリングのTRB数
    pub event_ring_size: usize,
    /// 転送リングのTRB数（リンクTRBを含む）
    pub transfer_ring_size: usize,
    /// 割り込みモデレーション間隔（250ns単位）
    pub interrupt_moderation: u16,
    /// 物理メモリのリニアマッピングオフセット（仮想 = 物理 + オフセット）
    pub physical_memory_offset: u64,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            max_slots: 64,
            poll_limit: 100_000,
            command_ring_size: 256,
            event_ring_size: 256,
            transfer_ring_size: 256,
            interrupt_moderation: 4000,
            physical_memory_offset: 0,
        }
    }
}

impl XhciConfig {
    /// 設定値の妥当性を確認
    pub fn validate(&self) -> bool {
        let ring = 2..=MAX_SEGMENT_TRBS;
        self.max_slots > 0
            && self.poll_limit > 0
            && ring.contains(&self.command_ring_size)
            && ring.contains(&self.transfer_ring_size)
            && (16..=MAX_SEGMENT_TRBS).contains(&self.event_ring_size)
    }
}
