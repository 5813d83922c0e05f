use std::ptr::NonNull;

use crate::{
    block::Block,
    list::{Link, List, Node},
    region::Region,
};

/// View over the free [`Block`]s of every [`Region`].
///
/// There is no separate storage for free blocks: they are identified by the
/// [`Block::is_free`] flag and found by walking the block chain, regions in
/// the order they were mapped and blocks in address order inside each region.
/// That order is what decides which block wins when several of them fit.
///
/// ```text
///                                     Free List
///
///                     Next free block                Next free block
///                +----------------------+  +--------------------------------------+
///                |                      |  |                                      |
/// +--------------|----------------------|--|----+      +--------------------------|-------------------+
/// |        | +---|--+    +-------+    +-|--|-+  |      |        | +-------+    +--|---+    +-------+  |
/// | Region | | Free | -> | Block | -> | Free |  | ---> | Region | | Block | -> | Free | -> | Block |  |
/// |        | +------+    +-------+    +------+  |      |        | +-------+    +------+    +-------+  |
/// +---------------------------------------------+      +----------------------------------------------+
///
/// ```
///
/// Standalone mappings never show up here: they are unmapped as soon as they
/// are released.
pub(crate) struct FreeList<'a> {
    regions: &'a List<Region>,
}

impl<'a> FreeList<'a> {
    pub fn new(regions: &'a List<Region>) -> Self {
        Self { regions }
    }

    /// Free blocks in chain order.
    pub fn iter(&self) -> impl Iterator<Item = NonNull<Node<Block>>> + 'a {
        self.regions
            .nodes()
            .flat_map(|region| unsafe { region.as_ref().data.blocks.nodes() })
            .filter(|block| unsafe { block.as_ref().data.is_free })
    }

    /// Returns a pointer to the [`Block`] where we can place `size` bytes
    /// (already aligned).
    ///
    /// This implementation of the method uses the first-fit algorithm, it returns
    /// the first block on the chain that is big enough.
    pub fn find_free_block(&self, size: usize) -> Link<Node<Block>> {
        self.iter()
            .find(|block| unsafe { block.as_ref().data.size >= size })
    }
}
