/// Host physical address.
pub type HostPhysAddr = usize;
/// Host virtual address.
pub type HostVirtAddr = usize;

/// The interfaces which the host must implement to back VMX regions with memory.
pub trait Hal {
    /// Allocates a 4K-sized physical frame, returning its start address.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Deallocates the physical frame at the given address.
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Converts a physical address to a virtual address the host can access.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
}
