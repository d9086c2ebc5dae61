/// `vm/pool.rs` — Interpreter heap pool and its regions
///
/// A VM's heap budget is the sum of its attached regions. Regions are
/// allocated and freed on the worker only; the audio thread attaches them
/// when the worker's acknowledgement arrives and sends back anything it
/// cannot use. Attached regions feed a TLSF allocator that serves every
/// interpreter allocation in constant time, so a running script never
/// reaches the global allocator.
///
/// Region sizes follow the initial size: region 0 and region 1 both have
/// the initial size, every later region doubles the previous one. Growth is
/// requested once more than half the current space is in use, with at most
/// one request in flight.
use std::alloc::Layout;
use std::os::raw::c_void;
use std::ptr::{self, NonNull};

use mlua::ffi;
use rlsf::Tlsf;

/// Alignment of every interpreter block.
const ALIGN: usize = 16;

type Heap = Tlsf<'static, u32, u32, 24, 16>;

/// One block of interpreter heap, owned by the VM it was allocated for.
pub struct Region {
    owner: u64,
    index: usize,
    block: NonNull<[u8]>,
}

// SAFETY: the block is uniquely owned by the region; it is only handed to
// the allocator of the pool the region is attached to.
unsafe impl Send for Region {}

impl Region {
    /// Allocates a zeroed region. Worker thread only.
    pub fn allocate(owner: u64, index: usize, size: usize) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).ok()?;
        bytes.resize(size, 0u8);
        let block = NonNull::from(Box::leak(bytes.into_boxed_slice()));
        Some(Self { owner, index, block })
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.len() == 0
    }

    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.block.as_ptr() as *mut u8 as usize;
        (start..start + self.len()).contains(&(ptr.as_ptr() as usize))
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        #[cfg(test)]
        super::audit::record_free();
        // SAFETY: `block` came from `Box::leak` in `allocate`.
        unsafe { drop(Box::from_raw(self.block.as_ptr())) };
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("owner", &self.owner)
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

/// "Allocate region `index` of `size` bytes for VM `owner`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    pub owner: u64,
    pub index: usize,
    pub size: usize,
}

/// Allocator the interpreter used before the pool took over. Blocks from
/// before the switch are still freed through it.
#[derive(Clone, Copy)]
struct Previous {
    alloc: ffi::lua_Alloc,
    ud: *mut c_void,
}

// ── HeapPool ──────────────────────────────────────────────────────────────────

pub struct HeapPool {
    owner: u64,
    initial: usize,
    regions: Vec<Option<Region>>,
    space: usize,
    pending: Option<usize>,
    /// Set after a failed allocation; no further growth is attempted.
    exhausted: bool,
    heap: Heap,
    /// Bytes the interpreter holds in this pool.
    used: usize,
    previous: Option<Previous>,
}

// SAFETY: the TLSF structure points only into regions this pool owns.
unsafe impl Send for HeapPool {}

impl HeapPool {
    /// An empty pool with room for `max_regions` regions.
    pub fn new(owner: u64, initial: usize, max_regions: usize) -> Self {
        let mut regions = Vec::with_capacity(max_regions);
        regions.resize_with(max_regions, || None);
        Self {
            owner,
            initial,
            regions,
            space: 0,
            pending: None,
            exhausted: false,
            heap: Heap::new(),
            used: 0,
            previous: None,
        }
    }

    pub fn region_size(&self, index: usize) -> usize {
        match index {
            0 => self.initial,
            i => self.initial.saturating_mul(1 << (i - 1)),
        }
    }

    /// Bytes across every attached region.
    pub fn space(&self) -> usize {
        self.space
    }

    pub fn attached(&self) -> usize {
        self.regions.iter().filter(|r| r.is_some()).count()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes the interpreter currently holds in the pool.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn needs_growth(&self, used: usize) -> bool {
        used > self.space / 2
    }

    /// The next region to ask the worker for, if `used` calls for growth and
    /// no request is already in flight.
    pub fn request(&mut self, used: usize) -> Option<RegionRequest> {
        if self.pending.is_some() || self.exhausted || !self.needs_growth(used) {
            return None;
        }
        let index = self.regions.iter().position(Option::is_none)?;
        self.pending = Some(index);
        Some(RegionRequest {
            owner: self.owner,
            index,
            size: self.region_size(index),
        })
    }

    /// Adds `region` to the pool. A region that does not belong here is
    /// handed back so the caller can send it to the worker for freeing.
    pub fn attach(&mut self, region: Region) -> Result<(), Region> {
        let fits = region.owner == self.owner
            && region.len() == self.region_size(region.index)
            && matches!(self.regions.get(region.index), Some(None));
        if !fits {
            return Err(region);
        }
        // SAFETY: the block stays alive in `regions` for as long as `heap`.
        if unsafe { self.heap.insert_free_block_ptr(region.block) }.is_none() {
            return Err(region);
        }
        if self.pending == Some(region.index) {
            self.pending = None;
        }
        self.space += region.len();
        let index = region.index;
        self.regions[index] = Some(region);
        Ok(())
    }

    /// The worker could not allocate the pending region.
    pub fn fail(&mut self, index: usize) {
        if self.pending == Some(index) {
            self.pending = None;
            self.exhausted = true;
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    // ── Allocation ────────────────────────────────────────────────────────────

    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let block = self.heap.allocate(Layout::from_size_align(size, ALIGN).ok()?)?;
        self.used += size;
        Some(block)
    }

    /// # Safety
    /// `block` must come from this pool and be `size` bytes long.
    pub unsafe fn deallocate(&mut self, block: NonNull<u8>, size: usize) {
        self.heap.deallocate(block, ALIGN);
        self.used = self.used.saturating_sub(size);
    }

    /// On failure `block` is left untouched.
    ///
    /// # Safety
    /// `block` must come from this pool and be `old` bytes long.
    pub unsafe fn reallocate(&mut self, block: NonNull<u8>, old: usize, new: usize) -> Option<NonNull<u8>> {
        let moved = self.heap.reallocate(block, Layout::from_size_align(new, ALIGN).ok()?)?;
        self.used = self.used.saturating_sub(old) + new;
        Some(moved)
    }

    fn owns(&self, block: NonNull<u8>) -> bool {
        self.regions.iter().flatten().any(|r| r.contains(block))
    }

    /// Installs the pool as the allocator of `state`. Earlier blocks keep
    /// going to the allocator being replaced.
    ///
    /// # Safety
    /// The pool must stay at its address and outlive `state`.
    pub(crate) unsafe fn take_over(&mut self, state: *mut ffi::lua_State) {
        let mut ud = ptr::null_mut();
        let alloc = ffi::lua_getallocf(state, &mut ud);
        self.previous = Some(Previous { alloc, ud });
        ffi::lua_setallocf(state, lua_alloc, (self as *mut Self).cast());
    }

    /// Moves or frees a block made by the replaced allocator.
    unsafe fn foreign(&mut self, block: NonNull<u8>, old: usize, new: usize) -> *mut c_void {
        let Some(previous) = self.previous else {
            return ptr::null_mut();
        };
        if new == 0 {
            return (previous.alloc)(previous.ud, block.as_ptr().cast(), old, 0);
        }
        let Some(moved) = self.allocate(new) else {
            return ptr::null_mut();
        };
        ptr::copy_nonoverlapping(block.as_ptr(), moved.as_ptr(), old.min(new));
        (previous.alloc)(previous.ud, block.as_ptr().cast(), old, 0);
        moved.as_ptr().cast()
    }
}

impl std::fmt::Debug for HeapPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapPool")
            .field("owner", &self.owner)
            .field("regions", &self.attached())
            .field("space", &self.space)
            .field("used", &self.used)
            .field("pending", &self.pending)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// `lua_Alloc` over a `HeapPool` passed as `ud`. A null `ptr` means a new
/// block, in which case `osize` only tags the object kind.
pub(crate) unsafe extern "C-unwind" fn lua_alloc(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let pool = &mut *ud.cast::<HeapPool>();
    match NonNull::new(ptr.cast::<u8>()) {
        None if nsize == 0 => ptr::null_mut(),
        None => pool.allocate(nsize).map_or(ptr::null_mut(), |b| b.as_ptr().cast()),
        Some(block) if !pool.owns(block) => pool.foreign(block, osize, nsize),
        Some(block) if nsize == 0 => {
            pool.deallocate(block, osize);
            ptr::null_mut()
        }
        Some(block) => pool
            .reallocate(block, osize, nsize)
            .map_or(ptr::null_mut(), |b| b.as_ptr().cast()),
    }
}
