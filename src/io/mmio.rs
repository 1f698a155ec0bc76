// ============================================================================
// src/io/mmio.rs - Memory-Mapped I/O Register Access
// ============================================================================
//!
//! MMIO レジスタへの volatile アクセス。
//!
//! xHCI のレジスタビューはすべて [`RegisterIo`] 越しにアクセスする。
//! 実機では [`MmioRegion`]、ホスト上のテストではシミュレータが実装する。

use alloc::sync::Arc;
use core::ptr;

use log::warn;
use x86_64::{PhysAddr, VirtAddr};

use super::dma::PhysicalMemoryMapper;

/// 32ビット単位のレジスタアクセス
///
/// オフセットはマップ済み領域の先頭からのバイトオフセット。
/// 64ビットレジスタは下位→上位の順に 32ビットずつアクセスする
/// （AC64=0 のコントローラでも安全な順序）。
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);

    fn read64(&self, offset: usize) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        lo | (hi << 32)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }

    fn read64(&self, offset: usize) -> u64 {
        (**self).read64(offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        (**self).write64(offset, value)
    }
}

// ============================================================================
// MMIO Region
// ============================================================================

/// マップ済みMMIO領域
#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    /// 仮想ベースアドレス
    base: VirtAddr,
    /// 物理ベースアドレス
    phys_base: PhysAddr,
    /// 領域長（バイト）
    len: usize,
}

impl MmioRegion {
    /// 物理アドレスのBARを直接マップ領域経由でマップ
    ///
    /// # Safety
    /// `phys_base..phys_base+len` がカーネルの直接マップ領域に
    /// キャッシュ無効でマップ済みであり、他のドライバと共有されていないこと。
    pub unsafe fn map(phys_base: PhysAddr, len: usize, mapper: &PhysicalMemoryMapper) -> Self {
        Self {
            base: mapper.phys_to_virt(phys_base),
            phys_base,
            len,
        }
    }

    /// 物理ベースアドレスを取得
    pub fn phys_base(&self) -> PhysAddr {
        self.phys_base
    }

    /// 領域長を取得
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn in_bounds(&self, offset: usize, width: usize) -> bool {
        offset % width == 0 && offset.checked_add(width).is_some_and(|end| end <= self.len)
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        if !self.in_bounds(offset, 4) {
            warn!("xhci: MMIO read out of bounds at {:#x}", offset);
            return u32::MAX;
        }
        // SAFETY: 範囲とアライメントは確認済み、領域は map() の契約でマップ済み
        unsafe { ptr::read_volatile((self.base.as_u64() + offset as u64) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        if !self.in_bounds(offset, 4) {
            warn!("xhci: MMIO write out of bounds at {:#x}", offset);
            return;
        }
        // SAFETY: 同上
        unsafe { ptr::write_volatile((self.base.as_u64() + offset as u64) as *mut u32, value) }
    }
}
