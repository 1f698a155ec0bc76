// ============================================================================
// src/io/usb/xhci/dcbaa.rs - Device Context Base Address Array
// ============================================================================
//!
//! # DCBAA (Device Context Base Address Array)
//!
//! スロットIDで索引される 64 ビットポインタの配列。
//! - インデックス 0: スクラッチパッドバッファ配列のポインタ（必要な場合）
//! - インデックス 1..=MaxSlotsEn: 各スロットの出力デバイスコンテキスト
//!
//! 初期化時に一度だけ確保され、コントローラ解体時に解放される。

use alloc::vec::Vec;

use log::{debug, warn};

use super::context::DeviceContextBuffer;
use crate::error::{XhciError, XhciResult};
use crate::io::dma::{DmaArray, PhysicalMemoryMapper};
use crate::io::usb::SlotId;

/// スクラッチパッドバッファ（ページ単位）
struct Scratchpad {
    /// ページポインタの配列（DCBAA[0] が指す）
    array: DmaArray<u64>,
    /// 各ページ本体（所有のみ、ソフトウェアは触らない）
    _pages: Vec<DmaArray<u8>>,
}

impl Scratchpad {
    fn allocate(count: u16, page_size: usize, mapper: &PhysicalMemoryMapper) -> XhciResult<Self> {
        let mut array = DmaArray::<u64>::new(count as usize, mapper)?;
        let mut pages = Vec::with_capacity(count as usize);
        for index in 0..count as usize {
            let page = DmaArray::<u8>::with_alignment(page_size, page_size, mapper)?;
            array.write(index, page.phys_addr().as_u64());
            pages.push(page);
        }
        Ok(Self {
            array,
            _pages: pages,
        })
    }
}

/// デバイスコンテキストベースアドレス配列
pub struct DeviceContextArray {
    /// ポインタ配列（DMA可視、max_slots + 1 エントリ）
    entries: DmaArray<u64>,
    /// スクラッチパッド
    scratchpad: Option<Scratchpad>,
    /// スロットにバインドされたデバイスコンテキスト（インデックス = スロットID）
    contexts: Vec<Option<DeviceContextBuffer>>,
}

impl DeviceContextArray {
    /// DCBAA とスクラッチパッドを確保
    pub fn allocate(
        max_slots: u8,
        scratchpad_count: u16,
        page_size: usize,
        mapper: &PhysicalMemoryMapper,
    ) -> XhciResult<Self> {
        if max_slots == 0 {
            return Err(XhciError::InvalidParameter("max slots"));
        }
        if !page_size.is_power_of_two() || page_size < 4096 {
            return Err(XhciError::InvalidParameter("page size"));
        }

        let mut entries = DmaArray::<u64>::new(max_slots as usize + 1, mapper)?;
        let scratchpad = if scratchpad_count > 0 {
            let scratchpad = Scratchpad::allocate(scratchpad_count, page_size, mapper)?;
            entries.write(0, scratchpad.array.phys_addr().as_u64());
            debug!(
                "xhci: {} scratchpad pages of {} bytes",
                scratchpad_count, page_size
            );
            Some(scratchpad)
        } else {
            None
        };

        let contexts = (0..=max_slots as usize).map(|_| None).collect();
        Ok(Self {
            entries,
            scratchpad,
            contexts,
        })
    }

    /// DCBAAP に書く物理アドレス
    pub fn phys_addr(&self) -> u64 {
        self.entries.phys_addr().as_u64()
    }

    /// 管理するスロット数
    pub fn max_slots(&self) -> u8 {
        (self.entries.len() - 1) as u8
    }

    /// スクラッチパッド配列の物理アドレス
    pub fn scratchpad_array_addr(&self) -> Option<u64> {
        self.scratchpad.as_ref().map(|s| s.array.phys_addr().as_u64())
    }

    /// 生のエントリ値（0 = 未バインド）
    pub fn entry(&self, slot: SlotId) -> u64 {
        if slot.as_usize() < self.entries.len() {
            self.entries.read(slot.as_usize())
        } else {
            0
        }
    }

    fn check_slot(&self, slot: SlotId) -> XhciResult<()> {
        if slot.is_valid() && slot.as_u8() <= self.max_slots() {
            Ok(())
        } else {
            Err(XhciError::InvalidSlot(slot))
        }
    }

    /// スロットにデバイスコンテキストをバインド
    ///
    /// そのスロットに対するハードウェアコマンドが実行中でないこと。
    pub fn bind_slot_context(&mut self, slot: SlotId, context: DeviceContextBuffer) -> XhciResult<()> {
        self.check_slot(slot)?;
        if self.contexts[slot.as_usize()].is_some() {
            warn!("xhci: slot {} rebound without unbind", slot.as_u8());
        }
        self.entries.write(slot.as_usize(), context.phys_addr());
        self.contexts[slot.as_usize()] = Some(context);
        Ok(())
    }

    /// スロットのバインドを解除し、コンテキストを返す
    pub fn unbind_slot_context(&mut self, slot: SlotId) -> Option<DeviceContextBuffer> {
        self.check_slot(slot).ok()?;
        self.entries.write(slot.as_usize(), 0);
        self.contexts[slot.as_usize()].take()
    }

    /// バインド済みのデバイスコンテキスト
    pub fn context(&self, slot: SlotId) -> Option<&DeviceContextBuffer> {
        self.contexts.get(slot.as_usize())?.as_ref()
    }
}

impl core::fmt::Debug for DeviceContextArray {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceContextArray")
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .field("max_slots", &self.max_slots())
            .field("scratchpad", &self.scratchpad_array_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratchpad_published_in_entry_zero() {
        let mapper = PhysicalMemoryMapper::new(0);
        let dcbaa = DeviceContextArray::allocate(8, 3, 4096, &mapper).unwrap();

        let array_addr = dcbaa.scratchpad_array_addr().unwrap();
        assert_eq!(dcbaa.entry(SlotId(0)), array_addr);
        let pages = array_addr as *const u64;
        for i in 0..3 {
            let page = unsafe { *pages.add(i) };
            assert_ne!(page, 0);
            assert_eq!(page % 4096, 0);
        }
        assert_eq!(dcbaa.phys_addr() % 64, 0);
    }

    #[test]
    fn test_bind_and_unbind() {
        let mapper = PhysicalMemoryMapper::new(0);
        let mut dcbaa = DeviceContextArray::allocate(4, 0, 4096, &mapper).unwrap();
        assert_eq!(dcbaa.entry(SlotId(0)), 0);

        let ctx = DeviceContextBuffer::new(32, &mapper).unwrap();
        let addr = ctx.phys_addr();
        dcbaa.bind_slot_context(SlotId(2), ctx).unwrap();
        assert_eq!(dcbaa.entry(SlotId(2)), addr);
        assert!(dcbaa.context(SlotId(2)).is_some());

        let ctx = dcbaa.unbind_slot_context(SlotId(2)).unwrap();
        assert_eq!(ctx.phys_addr(), addr);
        assert_eq!(dcbaa.entry(SlotId(2)), 0);
        assert!(dcbaa.unbind_slot_context(SlotId(2)).is_none());
    }

    #[test]
    fn test_out_of_range_slot_rejected() {
        let mapper = PhysicalMemoryMapper::new(0);
        let mut dcbaa = DeviceContextArray::allocate(4, 0, 4096, &mapper).unwrap();
        let ctx = DeviceContextBuffer::new(32, &mapper).unwrap();
        assert_eq!(
            dcbaa.bind_slot_context(SlotId(5), ctx),
            Err(XhciError::InvalidSlot(SlotId(5)))
        );
        assert_eq!(dcbaa.entry(SlotId(200)), 0);
    }
}
