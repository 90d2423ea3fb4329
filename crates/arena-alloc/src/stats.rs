use core::fmt;

/// Usage statistics of an allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocStats {
    /// The name of the allocator these stats belong to.
    pub name: &'static str,
    /// Bytes under management.
    pub total: usize,
    /// Bytes not currently available for allocation, bookkeeping included.
    pub in_use: usize,
    /// Bytes available for allocation.
    pub free: usize,
    /// Number of entries in the free-space index.
    pub free_blocks: usize,
    /// Allocations handed out and not yet fully returned.
    pub live_allocations: usize,
}

impl AllocStats {
    /// Create a new, empty [`AllocStats`] instance for the given allocator name.
    #[must_use]
    pub fn with_name(name: &'static str) -> Self {
        Self {
            name,
            total: 0,
            in_use: 0,
            free: 0,
            free_blocks: 0,
            live_allocations: 0,
        }
    }
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f, "\nTotal bytes:      {:#x}", self.total)?;
        writeln!(f, "In-use bytes:     {:#x}", self.in_use)?;
        writeln!(f, "Free bytes:       {:#x}", self.free)?;
        writeln!(f, "Free blocks:      {}", self.free_blocks)?;
        writeln!(f, "Live allocations: {}", self.live_allocations)?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;
        Ok(())
    }
}
