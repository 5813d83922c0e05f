use std::{mem, ptr::NonNull};
use log::trace;
use crate::{
    block::{self, BLOCK_HEADER_SIZE, Block, MIN_SPLIT_REMAINDER},
    list::{List, Node},
    utils::{ALIGNMENT, align},
};


/// This is the overhead size introduced by the [`Region`] header in bytes.
/// The header is represented as a [`Node`]. See [`List`] for more detail.
pub(crate) const REGION_HEADER_SIZE: usize = align(mem::size_of::<Node<Region>>(), ALIGNMENT);

/// This struct contains the memory regions specific metadata. However,
/// as every other header, this is usually represented as a [`Node<Region>`]
/// so that would be the complete region data.
///
/// The OS gives us memory regions aligned with the computer page size. But we
/// cannot use a full Region each time user allocates memory since we would be
/// wasting a lot of space. Also, we cannot assume this regions are adjacent.
///
/// Therefor, we are going to use the following data structure which consists in
/// a LinkedList of [`Region`] which inside of them have a LinkedList of [`Block`].
///
/// ```text
/// +-----------------------------------------------+      +-----------------------------------------------+
/// |        | +-------+    +-------+    +-------+  |      |        | +-------+    +-------+    +-------+  |
/// | Region | | Block | -> | Block | -> | Block |  | ---> | Region | | Block | -> | Block | -> | Block |  |
/// |        | +-------+    +-------+    +-------+  |      |        | +-------+    +-------+    +-------+  |
/// +-----------------------------------------------+      +-----------------------------------------------+
/// ```
///
/// The blocks of a region tile it completely: the first header sits right after
/// the region header and every block ends where the next one starts.
pub(crate) struct Region {
    /// Length of the whole mapping, region header included.
    pub size: usize,
    /// List of blocks in the region, in address order.
    pub blocks: List<Block>,
}


impl Region {
    /// Tells whether `node` and its successor touch each other in memory.
    #[inline]
    fn adjacent(node: NonNull<Node<Block>>, next: NonNull<Node<Block>>) -> bool {
        block::end(node) == next.as_ptr() as usize
    }

    /// Tries to merge the given block `node` with the previous one
    /// on the list. This can be performed if both blocks are free.
    pub(crate) fn merge_with_prev(&mut self, node: &mut NonNull<Node<Block>>) -> bool {
        unsafe {
            let Some(mut prev_node) = node.as_ref().prev else {
                return false;
            };

            if !prev_node.as_ref().data.is_free || !node.as_ref().data.is_free {
                return false;
            }

            if !Self::adjacent(prev_node, *node) {
                return false;
            }

            // We need to cover the header and the actual content of the block
            prev_node.as_mut().data.size += BLOCK_HEADER_SIZE + node.as_ref().data.size;

            // We remove the block from the list since it is going to be merged
            self.blocks.remove(*node);

            trace!("merged {:p} into previous block {:p}", node.as_ptr(), prev_node.as_ptr());

            // The current block is now its previous one
            *node = prev_node;
        }

        true
    }

    /// Tries to merge the given block `node` with the next one on the
    /// list. This can be performed if both blocks are free.
    pub(crate) fn merge_with_next(&mut self, node: &mut NonNull<Node<Block>>) -> bool {
        unsafe {
            let Some(next_node) = node.as_ref().next else {
                return false;
            };

            if !next_node.as_ref().data.is_free || !node.as_ref().data.is_free {
                return false;
            }

            if !Self::adjacent(*node, next_node) {
                return false;
            }

            node.as_mut().data.size += BLOCK_HEADER_SIZE + next_node.as_ref().data.size;
            // We remove the block from the list since it is going to be merged
            self.blocks.remove(next_node);

            trace!("merged next block {:p} into {:p}", next_node.as_ptr(), node.as_ptr());
        }

        true
    }

    /// Merges the free block `node` with every free neighbour around it, in
    /// both directions, until no more merges are possible. Returns the header
    /// of the resulting block, which may start before `node`.
    pub(crate) fn coalesce(&mut self, mut node: NonNull<Node<Block>>) -> NonNull<Node<Block>> {
        while self.merge_with_next(&mut node) {}
        while self.merge_with_prev(&mut node) {}

        node
    }

    /// Shrinks the block `node` to `needed` bytes of content and turns the
    /// leftover into a new free block placed right after it. When the leftover
    /// can't hold a header plus [`ALIGNMENT`] bytes the block stays oversized.
    ///
    /// The new free block is merged with its successor if that one is free too,
    /// so the region never holds two free neighbours.
    ///
    /// **SAFETY**: `node` must belong to this region and `needed` must be aligned.
    pub(crate) unsafe fn split(&mut self, mut node: NonNull<Node<Block>>, needed: usize) -> bool {
        unsafe {
            let block = &mut node.as_mut().data;

            let Some(leftover) = block.size.checked_sub(needed) else {
                return false;
            };

            if leftover < MIN_SPLIT_REMAINDER {
                return false;
            }

            let Some(region) = block.region else {
                return false;
            };

            block.size = needed;

            let remainder_addr = block::payload(node).add(needed);
            let mut remainder = self.blocks.insert_after(
                node,
                Block::free(leftover - BLOCK_HEADER_SIZE, region),
                remainder_addr,
            );

            trace!(
                "split {:p}: kept {} bytes, remainder {:p} with {} bytes",
                node.as_ptr(),
                needed,
                remainder.as_ptr(),
                leftover - BLOCK_HEADER_SIZE,
            );

            self.merge_with_next(&mut remainder);
        }

        true
    }

    /// Moves the start of the used block `node` forward by `gap` bytes. The
    /// bytes left behind become a free block that is merged with its free
    /// predecessor, if any. Returns the header of the moved block.
    ///
    /// **SAFETY**: `node` must belong to this region, `gap` must be aligned
    /// and either zero or at least [`MIN_SPLIT_REMAINDER`], and the block must
    /// hold more than `gap` bytes of content.
    pub(crate) unsafe fn shift(&mut self, node: NonNull<Node<Block>>, gap: usize) -> NonNull<Node<Block>> {
        if gap == 0 {
            return node;
        }

        unsafe {
            let mut front = node;
            let size = front.as_ref().data.size;

            let Some(region) = front.as_ref().data.region else {
                return node;
            };

            front.as_mut().data.size = gap - BLOCK_HEADER_SIZE;
            front.as_mut().data.mark_free();

            let moved = self.blocks.insert_after(front, Block::used(size - gap, region), node.cast::<u8>().add(gap));

            trace!("shifted {:p} by {} bytes to {:p}", node.as_ptr(), gap, moved.as_ptr());

            self.coalesce(front);

            moved
        }
    }

    /// Whether the region is made of a single free block spanning all of it.
    pub(crate) fn is_unused(&self) -> bool {
        match self.blocks.first() {
            Some(first) if self.blocks.len() == 1 => unsafe {
                let block = &first.as_ref().data;
                block.is_free && block.size + BLOCK_HEADER_SIZE + REGION_HEADER_SIZE == self.size
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;

    /// Builds a region with one free block over `arena`.
    fn region(arena: &mut Arena) -> NonNull<Node<Region>> {
        let size = arena.len();
        let mut list = List::new();

        unsafe {
            let mut region = list.append(
                Region { size, blocks: List::new() },
                arena.start(),
            );

            let block_addr = arena.start().add(REGION_HEADER_SIZE);
            let block_size = size - REGION_HEADER_SIZE - BLOCK_HEADER_SIZE;
            region
                .as_mut()
                .data
                .blocks
                .append(Block::free(block_size, region), block_addr);

            region
        }
    }

    fn sizes(region: &Region) -> Vec<(usize, bool)> {
        region
            .blocks
            .nodes()
            .map(|node| unsafe { (node.as_ref().data.size, node.as_ref().data.is_free) })
            .collect()
    }

    #[test]
    fn split_carves_free_remainder() {
        let mut arena = Arena::new(4096);
        let mut region_node = region(&mut arena);
        let region = unsafe { &mut region_node.as_mut().data };
        let total = 4096 - REGION_HEADER_SIZE - BLOCK_HEADER_SIZE;

        let first = region.blocks.first().unwrap();
        unsafe {
            (*first.as_ptr()).data.mark_used();
            assert!(region.split(first, 64));
        }

        assert_eq!(vec![(64, false), (total - 64 - BLOCK_HEADER_SIZE, true)], sizes(region));
        assert!(region.blocks.nodes().all(|node| unsafe {
            node.as_ref().next.is_none_or(|next| Region::adjacent(node, next))
        }));
    }

    #[test]
    fn split_keeps_small_leftover() {
        let mut arena = Arena::new(4096);
        let mut region_node = region(&mut arena);
        let region = unsafe { &mut region_node.as_mut().data };
        let total = 4096 - REGION_HEADER_SIZE - BLOCK_HEADER_SIZE;

        let first = region.blocks.first().unwrap();
        let needed = total - BLOCK_HEADER_SIZE;

        unsafe {
            (*first.as_ptr()).data.mark_used();
            assert!(!region.split(first, needed));
        }

        assert_eq!(vec![(total, false)], sizes(region));
    }

    #[test]
    fn shift_leaves_a_free_block_behind() {
        let mut arena = Arena::new(4096);
        let mut region_node = region(&mut arena);
        let region = unsafe { &mut region_node.as_mut().data };
        let total = 4096 - REGION_HEADER_SIZE - BLOCK_HEADER_SIZE;

        let first = region.blocks.first().unwrap();
        let gap = BLOCK_HEADER_SIZE + 2 * ALIGNMENT;

        let moved = unsafe {
            (*first.as_ptr()).data.mark_used();
            region.shift(first, gap)
        };

        assert_eq!(first.as_ptr() as usize + gap, moved.as_ptr() as usize);
        assert_eq!(vec![(2 * ALIGNMENT, true), (total - gap, false)], sizes(region));
        assert!(unsafe { moved.as_ref().data.is_live() });
        assert_eq!(moved, unsafe { region.shift(moved, 0) });
    }

    #[test]
    fn coalesce_merges_both_sides() {
        let mut arena = Arena::new(4096);
        let mut region_node = region(&mut arena);
        let region = unsafe { &mut region_node.as_mut().data };

        // Carve three used blocks of 64 bytes plus the free tail.
        let mut nodes = Vec::new();
        let mut current = region.blocks.first().unwrap();
        for _ in 0..3 {
            unsafe {
                (*current.as_ptr()).data.mark_used();
                region.split(current, 64);
                nodes.push(current);
                current = current.as_ref().next.unwrap();
            }
        }
        assert_eq!(4, region.blocks.len());

        unsafe {
            (*nodes[0].as_ptr()).data.mark_free();
            region.coalesce(nodes[0]);
            (*nodes[2].as_ptr()).data.mark_free();
            region.coalesce(nodes[2]);
        }
        // The third block joins the tail, the first one has no free neighbour.
        assert_eq!(3, region.blocks.len());
        assert!(!region.is_unused());

        let merged = unsafe {
            (*nodes[1].as_ptr()).data.mark_free();
            region.coalesce(nodes[1])
        };

        assert_eq!(nodes[0], merged);
        assert_eq!(1, region.blocks.len());
        assert!(region.is_unused());
    }
}
