// ============================================================================
// src/io/usb/xhci/ring_manager.rs - xHCI Ring Management
// ============================================================================
//!
//! # xHCI リング管理
//!
//! コマンドリング、イベントリング、転送リングの管理を担当。
//! TRBのエンキュー/デキュー、サイクルビット管理を行う。
//!
//! ## サイクルビットプロトコル
//! - プロデューサは現在のサイクル値を書き込んだTRBだけをコンシューマに渡す
//! - 最終スロットには先頭を指すリンクTRB (TC=1) を置き、周回ごとにサイクルを反転
//! - コンシューマはサイクル不一致のエントリで停止する（件数やインデックスでは止めない）
//!
//! ドアベルはエンキューとは別の明示的なステップ（`doorbell_manager`）。

use log::warn;
#[cfg(feature = "verbose_logging")]
use log::trace;

use super::trb::{ErstEntry, Trb, TrbType};
use crate::error::{XhciError, XhciResult};
use crate::io::dma::{DmaArray, PhysicalMemoryMapper};

/// リングセグメントの最大TRB数（セグメントは 64KiB 境界をまたげない）
pub const MAX_SEGMENT_TRBS: usize = crate::io::dma::DMA_BOUNDARY / Trb::SIZE as usize;

// ============================================================================
// Ring Types
// ============================================================================

/// リングタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingType {
    /// コマンドリング（ホスト→コントローラ）
    Command,
    /// イベントリング（コントローラ→ホスト）
    Event,
    /// 転送リング（エンドポイントごと）
    Transfer,
}

// ============================================================================
// Producer Ring (Command / Transfer)
// ============================================================================

/// ソフトウェアが生産しハードウェアが消費するリング
///
/// 最終エントリはリンクTRB用に予約されるため、使用可能なエントリ数は `size - 1`。
/// 未消費エントリ数 (`in_flight`) は完了イベントで [`ProducerRing::retire`] される。
pub struct ProducerRing {
    /// TRB配列（DMA可視）
    trbs: DmaArray<Trb>,
    /// リングタイプ
    ring_type: RingType,
    /// 次に書き込むインデックス
    enqueue_index: usize,
    /// ハードウェアがまだ消費していない最古のエントリ
    dequeue_index: usize,
    /// 未消費エントリ数
    in_flight: usize,
    /// プロデューササイクル状態
    cycle_bit: bool,
}

impl ProducerRing {
    /// 新しいリングを確保（サイクル状態は 1 から開始）
    pub fn new(size: usize, ring_type: RingType, mapper: &PhysicalMemoryMapper) -> XhciResult<Self> {
        if !(2..=MAX_SEGMENT_TRBS).contains(&size) {
            return Err(XhciError::InvalidParameter("ring size"));
        }
        Ok(Self {
            trbs: DmaArray::new(size, mapper)?,
            ring_type,
            enqueue_index: 0,
            dequeue_index: 0,
            in_flight: 0,
            cycle_bit: true,
        })
    }

    /// リングタイプ
    pub fn ring_type(&self) -> RingType {
        self.ring_type
    }

    /// リング先頭の物理アドレス
    pub fn phys_addr(&self) -> u64 {
        self.trbs.phys_addr().as_u64()
    }

    /// 使用可能なエントリ数（リンクTRBを除く）
    pub fn capacity(&self) -> usize {
        self.trbs.len() - 1
    }

    /// 未消費エントリ数
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_full(&self) -> bool {
        self.in_flight == self.capacity()
    }

    /// 現在のプロデューササイクル状態
    pub fn cycle_bit(&self) -> bool {
        self.cycle_bit
    }

    /// 次にTRBを書き込む物理アドレス
    pub fn enqueue_pointer(&self) -> u64 {
        self.trbs.phys_addr_of(self.enqueue_index)
    }

    /// TRBをエンキューし、その物理アドレスを返す
    ///
    /// 最終スロットに達したらリンクTRBを書いてサイクルを反転する。
    /// 未消費エントリを上書きする場合は `RingFull`。
    pub fn enqueue(&mut self, trb: Trb) -> XhciResult<u64> {
        if self.is_full() {
            return Err(XhciError::RingFull);
        }

        let mut entry = trb;
        entry.set_cycle_bit(self.cycle_bit);
        let index = self.enqueue_index;
        self.trbs.write(index, entry);
        let trb_addr = self.trbs.phys_addr_of(index);

        #[cfg(feature = "verbose_logging")]
        trace!(
            "xhci: {:?} ring enqueue [{}] type={} cycle={}",
            self.ring_type,
            index,
            entry.trb_type(),
            self.cycle_bit
        );

        self.in_flight += 1;
        self.enqueue_index += 1;
        if self.enqueue_index == self.capacity() {
            self.wrap();
        }

        Ok(trb_addr)
    }

    /// リンクTRBを書き込み、先頭へ戻ってサイクルを反転
    fn wrap(&mut self) {
        let link = Trb::link(self.phys_addr(), true, self.cycle_bit);
        let last = self.capacity();
        self.trbs.write(last, link);
        self.enqueue_index = 0;
        self.cycle_bit = !self.cycle_bit;
    }

    /// `trb_addr` までのエントリがハードウェアに消費されたことを記録
    ///
    /// 完了イベントが指すTRBとそれ以前の未消費エントリをすべて解放する。
    /// 未消費範囲外のアドレスは無視して `false` を返す。
    pub fn retire(&mut self, trb_addr: u64) -> bool {
        let Some(index) = self.trbs.index_of(trb_addr) else {
            return false;
        };
        let capacity = self.capacity();
        if index >= capacity || self.in_flight == 0 {
            return false;
        }

        let consumed = (index + capacity - self.dequeue_index) % capacity + 1;
        if consumed > self.in_flight {
            warn!(
                "xhci: {:?} ring completion for unqueued TRB {:#x}",
                self.ring_type, trb_addr
            );
            return false;
        }

        self.in_flight -= consumed;
        self.dequeue_index = (index + 1) % capacity;
        true
    }
}

impl core::fmt::Debug for ProducerRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProducerRing")
            .field("ring_type", &self.ring_type)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .field("enqueue_index", &self.enqueue_index)
            .field("in_flight", &self.in_flight)
            .field("cycle_bit", &self.cycle_bit)
            .finish()
    }
}

// ============================================================================
// Consumer Cursor
// ============================================================================

/// サイクルビットで所有権を判定するコンシューマカーソル
///
/// イベントリング（ソフトウェア側）とシミュレートされたハードウェア
/// （コマンドリングの消費側）の両方で使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrbCursor {
    /// セグメント先頭の物理アドレス
    base: u64,
    /// セグメントのTRB数
    len: usize,
    /// 現在のインデックス
    index: usize,
    /// コンシューマサイクル状態
    cycle: bool,
}

impl TrbCursor {
    pub fn new(base: u64, len: usize, cycle: bool) -> Self {
        Self {
            base,
            len,
            index: 0,
            cycle,
        }
    }

    /// 現在位置の物理アドレス
    pub fn position(&self) -> u64 {
        self.base + self.index as u64 * Trb::SIZE
    }

    /// コンシューマサイクル状態
    pub fn cycle_bit(&self) -> bool {
        self.cycle
    }

    /// 次の有効エントリを取り出す
    ///
    /// `read` はインデックスからTRBを読む。サイクル不一致なら `None`。
    /// リンクTRBは追跡してTC=1ならサイクルを反転し、呼び出し元には返さない。
    /// セグメント終端に達した場合も先頭へ戻ってサイクルを反転する。
    pub fn next_with(&mut self, mut read: impl FnMut(usize) -> Trb) -> Option<(u64, Trb)> {
        // リンクTRBが連続しても有限回で止める
        for _ in 0..=self.len {
            let trb = read(self.index);
            if trb.cycle_bit() != self.cycle {
                return None;
            }

            if trb.kind() == Some(TrbType::Link) {
                if trb.toggle_cycle() {
                    self.cycle = !self.cycle;
                }
                self.index = self.index_of(trb.trb_pointer()).unwrap_or(0);
                continue;
            }

            let addr = self.position();
            self.index += 1;
            if self.index == self.len {
                self.index = 0;
                self.cycle = !self.cycle;
            }
            return Some((addr, trb));
        }

        warn!("xhci: ring at {:#x} contains only link TRBs", self.base);
        None
    }

    fn index_of(&self, addr: u64) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let index = (offset / Trb::SIZE) as usize;
        (offset % Trb::SIZE == 0 && index < self.len).then_some(index)
    }
}

// ============================================================================
// Event Ring
// ============================================================================

/// 単一セグメントのイベントリングとそのERST
pub struct EventRing {
    /// イベントTRB配列（DMA可視）
    trbs: DmaArray<Trb>,
    /// イベントリングセグメントテーブル
    erst: DmaArray<ErstEntry>,
    /// コンシューマ状態（サイクル 1 から開始）
    cursor: TrbCursor,
}

impl EventRing {
    /// イベントリングとERSTを確保
    pub fn new(size: usize, mapper: &PhysicalMemoryMapper) -> XhciResult<Self> {
        if !(16..=MAX_SEGMENT_TRBS).contains(&size) {
            return Err(XhciError::InvalidParameter("event ring size"));
        }
        let trbs = DmaArray::<Trb>::new(size, mapper)?;
        let mut erst = DmaArray::<ErstEntry>::new(1, mapper)?;
        erst.write(
            0,
            ErstEntry {
                ring_segment_base: trbs.phys_addr().as_u64(),
                ring_segment_size: size as u32,
                reserved: 0,
            },
        );
        let cursor = TrbCursor::new(trbs.phys_addr().as_u64(), size, true);

        Ok(Self { trbs, erst, cursor })
    }

    /// 次のイベントを取り出す（未到着なら `None`）
    pub fn dequeue(&mut self) -> Option<Trb> {
        let trbs = &self.trbs;
        let (_addr, trb) = self.cursor.next_with(|index| trbs.read(index))?;

        #[cfg(feature = "verbose_logging")]
        trace!(
            "xhci: event [{:#x}] type={} code={:?}",
            _addr,
            trb.trb_type(),
            trb.completion_code()
        );

        Some(trb)
    }

    /// ERDP に書き込む値（次に読むエントリの物理アドレス）
    pub fn dequeue_pointer(&self) -> u64 {
        self.cursor.position()
    }

    /// コンシューマサイクル状態
    pub fn cycle_bit(&self) -> bool {
        self.cursor.cycle_bit()
    }

    /// セグメント先頭の物理アドレス
    pub fn segment_phys_addr(&self) -> u64 {
        self.trbs.phys_addr().as_u64()
    }

    /// ERSTの物理アドレス
    pub fn erst_phys_addr(&self) -> u64 {
        self.erst.phys_addr().as_u64()
    }

    /// ERSTのエントリ数
    pub fn erst_len(&self) -> u32 {
        self.erst.len() as u32
    }

    /// セグメントのTRB数
    pub fn len(&self) -> usize {
        self.trbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trbs.is_empty()
    }
}
