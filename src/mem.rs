use core::marker::PhantomData;

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use crate::{Hal, HostPhysAddr, Result, VmxError};

/// A 4 KiB physical frame, returned to the [`Hal`] when dropped.
#[derive(Debug)]
pub struct PhysFrame<H: Hal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: Hal> PhysFrame<H> {
    /// Allocates a frame and fills it with zeros.
    pub fn alloc_zero() -> Result<Self> {
        let start_paddr = H::alloc_frame().ok_or(VmxError::MemoryAllocationFailed)?;
        let frame = Self {
            start_paddr,
            _marker: PhantomData,
        };
        unsafe { core::ptr::write_bytes(frame.as_mut_ptr(), 0, PAGE_SIZE) };
        Ok(frame)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr) as *mut u8
    }

    /// Reads the 32-bit little-endian word at `offset`.
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= PAGE_SIZE);
        unsafe { (self.as_mut_ptr().add(offset) as *const u32).read_volatile() }
    }

    /// Writes a 32-bit little-endian word at `offset`.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        assert!(offset + 4 <= PAGE_SIZE);
        unsafe { (self.as_mut_ptr().add(offset) as *mut u32).write_volatile(value) }
    }
}

impl<H: Hal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        debug!("[HV] deallocated PhysFrame({:#x})", self.start_paddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::MockMmHal;

    #[test]
    fn test_alloc_zero_and_drop() {
        MockMmHal::reset();
        {
            let mut frame = PhysFrame::<MockMmHal>::alloc_zero().unwrap();
            assert_eq!(frame.read_u32(0), 0);
            assert_eq!(frame.read_u32(4092), 0);
            frame.write_u32(0, 0xdead_beef);
            assert_eq!(frame.read_u32(0), 0xdead_beef);
            assert_eq!(MockMmHal::allocated_frames(), 1);
        }
        assert_eq!(MockMmHal::allocated_frames(), 0);
    }

    #[test]
    fn test_alloc_failure() {
        MockMmHal::reset();
        MockMmHal::fail_next_alloc();
        assert_eq!(
            PhysFrame::<MockMmHal>::alloc_zero().unwrap_err(),
            VmxError::MemoryAllocationFailed
        );
    }
}
