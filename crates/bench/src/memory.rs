//! Memory readings for the memory probe.
//!
//! Candle exposes no allocator statistics, so host memory is observed
//! either through [`TrackingAllocator`] (when a binary installs it as the
//! global allocator) or through the process resident set size. CUDA builds
//! query the driver for used device memory.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use candle_core::Device;

static CURRENT: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);
static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// `System` wrapper counting live and peak heap bytes.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: attention_bench::memory::TrackingAllocator = TrackingAllocator;
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackingAllocator;

impl TrackingAllocator {
    /// True once the allocator has served at least one allocation, i.e. it
    /// is the process's global allocator.
    pub fn is_installed() -> bool {
        INSTALLED.load(Ordering::Relaxed)
    }

    pub fn current_bytes() -> usize {
        CURRENT.load(Ordering::Relaxed)
    }

    pub fn peak_bytes() -> usize {
        PEAK.load(Ordering::Relaxed)
    }

    pub fn allocation_count() -> usize {
        ALLOCATIONS.load(Ordering::Relaxed)
    }

    /// Restarts peak tracking from the current usage.
    pub fn reset_peak() {
        PEAK.store(CURRENT.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    fn record_allocation(size: usize) {
        INSTALLED.store(true, Ordering::Relaxed);
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        let current = CURRENT.fetch_add(size, Ordering::Relaxed) + size;
        PEAK.fetch_max(current, Ordering::Relaxed);
    }

    fn record_deallocation(size: usize) {
        // Saturate rather than wrap if a block allocated before install is freed.
        let _ = CURRENT.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(size))
        });
    }
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            Self::record_allocation(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            Self::record_allocation(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        Self::record_deallocation(layout.size());
        System.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            Self::record_deallocation(layout.size());
            Self::record_allocation(new_size);
        }
        new_ptr
    }
}

pub trait MemorySource {
    fn name(&self) -> &'static str;

    /// Bytes currently attributed to the workload, or `None` when the
    /// backend cannot answer.
    fn allocated_bytes(&self) -> Option<u64>;

    fn reset_peak(&self) {}

    fn peak_bytes(&self) -> Option<u64> {
        None
    }
}

/// Live heap bytes as counted by [`TrackingAllocator`].
#[derive(Debug, Default)]
pub struct HostAllocations;

impl MemorySource for HostAllocations {
    fn name(&self) -> &'static str {
        "host-allocations"
    }

    fn allocated_bytes(&self) -> Option<u64> {
        TrackingAllocator::is_installed().then(|| TrackingAllocator::current_bytes() as u64)
    }

    fn reset_peak(&self) {
        TrackingAllocator::reset_peak();
    }

    fn peak_bytes(&self) -> Option<u64> {
        TrackingAllocator::is_installed().then(|| TrackingAllocator::peak_bytes() as u64)
    }
}

/// Resident set size of this process, refreshed on every read.
#[derive(Debug, Default)]
pub struct ProcessResident;

impl MemorySource for ProcessResident {
    fn name(&self) -> &'static str {
        "process-rss"
    }

    fn allocated_bytes(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = sysinfo::System::new();
        system.refresh_process(pid);
        system.process(pid).map(|process| process.memory())
    }
}

/// Used device memory (`total - free`) reported by the CUDA driver for the
/// context bound to the current thread.
#[cfg(feature = "cuda")]
#[derive(Debug, Default)]
pub struct CudaMemInfo;

#[cfg(feature = "cuda")]
impl MemorySource for CudaMemInfo {
    fn name(&self) -> &'static str {
        "cuda-mem-info"
    }

    fn allocated_bytes(&self) -> Option<u64> {
        use candle_core::cuda_backend::cudarc::driver::result::mem_get_info;

        match mem_get_info() {
            Ok((free, total)) => Some(total.saturating_sub(free) as u64),
            Err(err) => {
                log::warn!("cuda memory query failed: {err}");
                None
            }
        }
    }
}

pub fn memory_source_for(device: &Device) -> Box<dyn MemorySource> {
    #[cfg(feature = "cuda")]
    {
        if device.is_cuda() {
            return Box::new(CudaMemInfo);
        }
    }
    if device.is_metal() {
        log::debug!("no metal memory query available, falling back to host readings");
    }

    if TrackingAllocator::is_installed() {
        Box::new(HostAllocations)
    } else {
        Box::new(ProcessResident)
    }
}
