use memmap2::MmapMut;

/// The type tag stored in the first byte of every page's persistent header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Free = 0,
    Header = 1,
    BtreeRoot = 2,
    BtreeIndex = 3,
    Blob = 4,
    Freelist = 5,
    Other = 6,
}

impl PageType {
    pub fn from_u8(v: u8) -> PageType {
        match v {
            1 => PageType::Header,
            2 => PageType::BtreeRoot,
            3 => PageType::BtreeIndex,
            4 => PageType::Blob,
            5 => PageType::Freelist,
            6 => PageType::Other,
            _ => PageType::Free,
        }
    }

    pub fn is_btree(&self) -> bool {
        matches!(self, PageType::BtreeRoot | PageType::BtreeIndex)
    }
}

/// A page buffer is either a private heap buffer or a live mapping of the
/// file region; never both, and release always matches the mode (dropping
/// the variant frees or unmaps).
pub(crate) enum PageBuf {
    Heap(Vec<u8>),
    Mapped(MmapMut),
}

impl PageBuf {
    pub fn bytes(&self) -> &[u8] {
        match self {
            PageBuf::Heap(v) => v,
            PageBuf::Mapped(m) => m,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            PageBuf::Heap(v) => v,
            PageBuf::Mapped(m) => m,
        }
    }
}

/// Seed for the eviction counter of freshly created pages, so a page that
/// was just brought in is not the immediate victim.
pub(crate) const INITIAL_CACHE_COUNTER: u64 = 20;

/// An in-memory page frame. `addr` is the page's byte offset in the file
/// (its "self"); for in-memory environments it is a surrogate address that
/// is unique for the lifetime of the environment.
pub(crate) struct Page {
    pub addr: u64,
    pub page_type: PageType,
    /// Owning database (0 for pages that belong to no database, e.g. fresh
    /// allocations); used to scrub the right extended-key cache on release.
    pub db: u16,
    pub dirty: bool,
    pub delete_pending: bool,
    /// Monotone hint for eviction; bumped on every cache hit.
    pub cache_counter: u64,
    pub buf: PageBuf,
}

impl Page {
    pub fn new(addr: u64, page_type: PageType, buf: PageBuf) -> Self {
        Self {
            addr,
            page_type,
            db: 0,
            dirty: false,
            delete_pending: false,
            cache_counter: INITIAL_CACHE_COUNTER,
            buf,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.bytes_mut()
    }
}
