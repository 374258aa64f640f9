use crate::block::HEADER_SIZE;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Smallest supported leaf capacity.
pub const MIN_LEAF_CAPACITY: usize = 2;

/// Smallest supported branch capacity. Half of it still leaves a branch two children.
pub const MIN_BRANCH_CAPACITY: usize = 4;

/// Options when opening a [`crate::BlockStore`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Size of every block, header included.
    pub(crate) block_size: usize,
    /// Maximum number of entries in a leaf. `None` means as many as fit.
    pub(crate) leaf_capacity: Option<usize>,
    /// Maximum number of children of a branch. `None` means as many as fit.
    pub(crate) branch_capacity: Option<usize>,
    /// Enable or disable metrics collection.
    pub(crate) metrics: bool,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            block_size: 4096,
            leaf_capacity: None,
            branch_capacity: None,
            metrics: false,
        }
    }

    /// Set the size of every block, header included.
    ///
    /// Must be a multiple of 8 and at least 512.
    ///
    /// Default: 4096.
    pub fn block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
    }

    /// Limit the number of entries a leaf holds before it is split.
    ///
    /// The limit is lowered to what physically fits in a block. Must be at least 2.
    ///
    /// Default: as many as fit.
    pub fn leaf_capacity(&mut self, capacity: usize) {
        self.leaf_capacity = Some(capacity);
    }

    /// Limit the number of children a branch holds before it is split.
    ///
    /// The limit is lowered to what physically fits in a block. Must be at least 4.
    ///
    /// Default: as many as fit.
    pub fn branch_capacity(&mut self, capacity: usize) {
        self.branch_capacity = Some(capacity);
    }

    /// Set metrics collection on or off.
    ///
    /// Default: off.
    pub fn metrics(&mut self, metrics: bool) {
        self.metrics = metrics;
    }

    /// Bytes available to a node or blob in each block.
    pub(crate) fn payload_size(&self) -> usize {
        self.block_size - HEADER_SIZE
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size % 8 != 0 {
            return Err(format!(
                "block size {} must be a multiple of 8 and at least {MIN_BLOCK_SIZE}",
                self.block_size
            ));
        }
        if self.block_size > u32::MAX as usize {
            return Err(format!("block size {} does not fit in 32 bits", self.block_size));
        }
        for (name, capacity, min) in [
            ("leaf", self.leaf_capacity, MIN_LEAF_CAPACITY),
            ("branch", self.branch_capacity, MIN_BRANCH_CAPACITY),
        ] {
            if let Some(capacity) = capacity {
                if capacity < min {
                    return Err(format!("{name} capacity {capacity} is below {min}"));
                }
            }
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
