use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use crate::codegen::layout::StructLayout;

const MIN_ALIGN: usize = 16;

/// Zeroed, aligned heap memory holding one instance of a root class.
#[derive(Debug)]
pub struct StorageBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: the block is plain bytes owned by this value.
unsafe impl Send for StorageBlock {}

impl StorageBlock {
    pub fn new(size: u32, align: u32) -> Self {
        let len = size as usize;
        let align = (align as usize).max(MIN_ALIGN).next_power_of_two();
        let layout = match Layout::from_size_align(len.max(1), align) {
            Ok(layout) => layout,
            Err(_) => handle_alloc_error(Layout::new::<u8>()),
        };
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        Self { ptr, layout, len }
    }

    /// A block for `layout` with every field at its default.
    pub fn with_defaults(layout: &StructLayout) -> Self {
        let mut block = Self::new(layout.size(), layout.align());
        layout.write_defaults(block.as_mut_slice());
        block
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `len` bytes were allocated and initialized by `alloc_zeroed`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn read_f32(&self, offset: u32) -> Option<f32> {
        let start = offset as usize;
        let bytes = self.as_slice().get(start..start + 4)?;
        Some(f32::from_ne_bytes(bytes.try_into().ok()?))
    }

    pub fn write_f32(&mut self, offset: u32, value: f32) -> bool {
        let start = offset as usize;
        match self.as_mut_slice().get_mut(start..start + 4) {
            Some(bytes) => {
                bytes.copy_from_slice(&value.to_ne_bytes());
                true
            }
            None => false,
        }
    }
}

impl Drop for StorageBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::layout::{DataLayout, Field, FieldKey};
    use crate::runtime::types::NodeKey;
    use float_cmp::assert_approx_eq;
    use slotmap::SlotMap;

    #[test]
    fn blocks_are_aligned_and_zeroed() {
        let block = StorageBlock::new(24, 4);
        assert_eq!(block.as_ptr() as usize % MIN_ALIGN, 0);
        assert!(block.as_slice().iter().all(|b| *b == 0));

        let empty = StorageBlock::new(0, 4);
        assert!(empty.is_empty());
        assert!(empty.as_slice().is_empty());
    }

    #[test]
    fn defaults_and_scalar_access() {
        let mut nodes: SlotMap<NodeKey, ()> = SlotMap::with_key();
        let node = nodes.insert(());
        let layout = StructLayout::build(
            &DataLayout::new(8, true),
            vec![
                Field::num(FieldKey::State(node, "a"), 0.0),
                Field::num(FieldKey::State(node, "b"), 69.0),
            ],
        );
        let mut block = StorageBlock::with_defaults(&layout);
        assert_approx_eq!(f32, block.read_f32(4).unwrap(), 69.0);
        assert!(block.write_f32(0, 0.25));
        assert_approx_eq!(f32, block.read_f32(0).unwrap(), 0.25);
        assert!(!block.write_f32(6, 1.0));
        assert_eq!(block.read_f32(8), None);
    }
}
