use bitflags::bitflags;

bitflags! {
    /// Flags accepted by [`Env::create`](crate::Env::create) and
    /// [`Env::open`](crate::Env::open).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Keep everything in memory; no file is created or written.
        const IN_MEMORY_DB        = 0x0000_0001;
        /// Read pages through a memory mapping instead of positional reads.
        const USE_MMAP            = 0x0000_0002;
        /// Write dirty pages back to the file as soon as they are released.
        const WRITE_THROUGH       = 0x0000_0004;
        /// Allow `begin`/`commit`/`abort`.
        const ENABLE_TRANSACTIONS = 0x0000_0008;
        /// On close, close all attached databases and cursors first.
        const AUTO_CLEANUP        = 0x0000_0010;
        /// Reserved for a hash backend; currently rejected.
        const USE_HASH            = 0x0000_0020;
        /// Do not consult the freelist when allocating pages.
        const IGNORE_FREELIST     = 0x0000_0040;
    }
}

bitflags! {
    /// Flags for `insert` on databases and cursors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertFlags: u32 {
        /// Replace the record if the key already exists.
        const OVERWRITE              = 0x0000_0001;
        /// Add another duplicate for the key.
        const DUPLICATE              = 0x0000_0002;
        /// Insert the duplicate before the cursor's current duplicate.
        const DUPLICATE_INSERT_BEFORE = 0x0000_0004;
        /// Insert the duplicate after the cursor's current duplicate.
        const DUPLICATE_INSERT_AFTER  = 0x0000_0008;
        /// Insert the duplicate as the first duplicate of the key.
        const DUPLICATE_INSERT_FIRST  = 0x0000_0010;
        /// Insert the duplicate as the last duplicate of the key.
        const DUPLICATE_INSERT_LAST   = 0x0000_0020;
    }
}

bitflags! {
    /// Direction selector for [`Cursor::move_to`](crate::Cursor::move_to).
    /// Empty flags mean "stay on the current position".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MoveFlags: u32 {
        const FIRST    = 0x0000_0001;
        const LAST     = 0x0000_0002;
        const NEXT     = 0x0000_0004;
        const PREVIOUS = 0x0000_0008;
    }
}

bitflags! {
    /// Flags for cursor synchronization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncFlags: u32 {
        /// Only couple the lagging sub-cursor on an exact key match; do not
        /// fall back to approximate positioning.
        const ONLY_EQUAL_KEY = 0x0000_0001;
        /// Position only; do not materialize key bytes or duplicates.
        const DONT_LOAD_KEY  = 0x0000_0002;
    }
}

bitflags! {
    /// Flags for `Key`/`Record` out-parameters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// The caller owns the byte buffer; fill it in place.
        const KEY_USER_ALLOC    = 0x0000_0001;
        /// The caller owns the byte buffer; fill it in place.
        const RECORD_USER_ALLOC = 0x0000_0002;
    }
}

/// Selects which half of a fused cursor an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorHalf {
    Btree,
    Txn,
    Both,
}
