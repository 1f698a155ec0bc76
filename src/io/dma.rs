// ============================================================================
// src/io/dma.rs - DMA-Visible Memory
// ============================================================================
//!
//! # DMA 可視メモリ
//!
//! xHCI が直接読み書きする構造体（DCBAA、各リング、ERST、
//! デバイス/入力コンテキスト、スクラッチパッド）の確保を担当する。
//!
//! - ページアライメント・ゼロ初期化で確保
//! - 64KiB 以下の確保は 64KiB 境界をまたがない
//! - 仮想アドレスと物理アドレスの両方を保持
//! - 要素アクセスは volatile（ハードウェアと共有されるため）
#![allow(dead_code)]

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};

use x86_64::{PhysAddr, VirtAddr};

use crate::error::{XhciError, XhciResult};

/// DMAバッファの最小アライメント
pub const DMA_ALIGNMENT: usize = 4096; // ページアライメント

/// リング/ERST/コンテキストがまたいではならない境界
pub const DMA_BOUNDARY: usize = 0x10000;

// ============================================================================
// Physical Memory Mapper
// ============================================================================

/// 物理メモリマッパー
/// 直接マップ領域における物理アドレスと仮想アドレス間の変換を提供
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMemoryMapper {
    /// 物理メモリオフセット
    offset: u64,
}

impl PhysicalMemoryMapper {
    /// 新しいマッパーを作成
    pub const fn new(physical_memory_offset: u64) -> Self {
        Self {
            offset: physical_memory_offset,
        }
    }

    /// 物理アドレスから仮想アドレスに変換
    #[inline]
    pub fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new_truncate(phys.as_u64() + self.offset)
    }

    /// 仮想アドレスから物理アドレスに変換（直接マップ領域のみ）
    #[inline]
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        if virt.as_u64() >= self.offset {
            PhysAddr::try_new(virt.as_u64() - self.offset).ok()
        } else {
            None
        }
    }
}

// ============================================================================
// DMA Array
// ============================================================================

/// DMA可視の固定長配列
///
/// コントローラと共有されるため、要素の読み書きはすべて volatile で行う。
/// `&mut self` を要求する書き込みは CPU 側の単一プロデューサを型で保証する。
pub struct DmaArray<T: Copy> {
    /// 先頭要素へのポインタ
    ptr: NonNull<T>,
    /// 要素数
    len: usize,
    /// 物理アドレス（コントローラに渡す値）
    phys_addr: PhysAddr,
    /// レイアウト（解放時に使用）
    layout: Layout,
    _marker: PhantomData<T>,
}

// SAFETY: 所有権は一意、共有アクセスは volatile 読み取りのみ
unsafe impl<T: Copy + Send> Send for DmaArray<T> {}
unsafe impl<T: Copy + Sync> Sync for DmaArray<T> {}

impl<T: Copy> DmaArray<T> {
    /// ゼロ初期化されたページアライン配列を確保
    pub fn new(len: usize, mapper: &PhysicalMemoryMapper) -> XhciResult<Self> {
        Self::with_alignment(len, DMA_ALIGNMENT, mapper)
    }

    /// アライメントを指定して確保（ページ未満のアライメントは使わない）
    ///
    /// `DMA_BOUNDARY` 以下のサイズはサイズ以上の 2 の冪にアラインし、境界をまたがない。
    pub fn with_alignment(
        len: usize,
        align: usize,
        mapper: &PhysicalMemoryMapper,
    ) -> XhciResult<Self> {
        let size = len
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(XhciError::DmaAllocationFailed)?;
        let mut align = align.max(DMA_ALIGNMENT).max(core::mem::align_of::<T>());
        if size <= DMA_BOUNDARY {
            align = align.max(size.next_power_of_two());
        }
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| XhciError::DmaAllocationFailed)?;

        // SAFETY: サイズは 1 以上
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut T).ok_or(XhciError::DmaAllocationFailed)?;

        let phys_addr = VirtAddr::try_new(raw as u64)
            .ok()
            .and_then(|virt| mapper.virt_to_phys(virt));
        let Some(phys_addr) = phys_addr else {
            // SAFETY: 直前に同じレイアウトで確保したもの
            unsafe { dealloc(raw, layout) };
            return Err(XhciError::DmaAllocationFailed);
        };

        Ok(Self {
            ptr,
            len,
            phys_addr,
            layout,
            _marker: PhantomData,
        })
    }

    /// 要素数
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 先頭の物理アドレス
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    /// 要素 `index` の物理アドレス
    pub fn phys_addr_of(&self, index: usize) -> u64 {
        self.phys_addr.as_u64() + (index * core::mem::size_of::<T>()) as u64
    }

    /// 物理アドレスから要素インデックスを逆算
    pub fn index_of(&self, phys: u64) -> Option<usize> {
        let base = self.phys_addr.as_u64();
        let stride = core::mem::size_of::<T>() as u64;
        if phys < base || stride == 0 {
            return None;
        }
        let offset = phys - base;
        if offset % stride != 0 {
            return None;
        }
        let index = (offset / stride) as usize;
        (index < self.len).then_some(index)
    }

    /// 要素を volatile に読み取る
    pub fn read(&self, index: usize) -> T {
        assert!(index < self.len, "DMA read out of bounds");
        // SAFETY: 範囲確認済み、確保済みメモリ
        let value = unsafe { core::ptr::read_volatile(self.ptr.as_ptr().add(index)) };
        fence(Ordering::Acquire);
        value
    }

    /// 要素を volatile に書き込む
    pub fn write(&mut self, index: usize, value: T) {
        assert!(index < self.len, "DMA write out of bounds");
        fence(Ordering::Release);
        // SAFETY: 範囲確認済み、確保済みメモリ
        unsafe { core::ptr::write_volatile(self.ptr.as_ptr().add(index), value) };
    }

    /// 先頭ポインタ（カーネル側のデバッグ用途）
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T: Copy> Drop for DmaArray<T> {
    fn drop(&mut self) {
        // SAFETY: new() で同じレイアウトで確保したもの
        unsafe {
            dealloc(self.ptr.as_ptr() as *mut u8, self.layout);
        }
    }
}

impl<T: Copy> core::fmt::Debug for DmaArray<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaArray")
            .field("len", &self.len)
            .field("phys_addr", &self.phys_addr)
            .finish()
    }
}
