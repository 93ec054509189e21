// Storage buffers in host-visible memory
//
// One buffer object and one dedicated allocation per `Buffer`; no pooling.
// Memory is host-coherent, so mapped writes need no explicit flush.

use super::device::host_visible_memory_type;
use super::error::{Check, Error, Result};
use super::Device;
use ash::vk;
use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Anything that can sit in a storage-buffer binding of a [`Program`](super::Program)
pub trait BindableBuffer {
    fn raw_buffer(&self) -> vk::Buffer;

    /// Logical device the buffer was created on; null once released
    fn owner(&self) -> vk::Device;
}

/// Memory type and allocation size for a buffer of `size` bytes.
///
/// The driver may pad the buffer or restrict its memory types, so both the
/// heap check and the type filter use the queried requirements.
fn allocation_for(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    requirements: &vk::MemoryRequirements,
) -> Option<(u32, vk::DeviceSize)> {
    let allocation_size = size.max(requirements.size);
    host_visible_memory_type(memory_properties, allocation_size, requirements.memory_type_bits)
        .map(|memory_type_index| (memory_type_index, allocation_size))
}

/// GPU storage buffer with a fixed byte size
#[derive(Default)]
pub struct Buffer<'d> {
    device: Option<&'d Device<'d>>,
    size: vk::DeviceSize,
    memory: vk::DeviceMemory,
    buffer: vk::Buffer,
    mapped: Cell<bool>,
}

impl<'d> Buffer<'d> {
    pub fn new(device: &'d Device<'d>, size: vk::DeviceSize) -> Result<Self> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let raw = device.raw()?;

        let queue_family_indices = [device.compute_queue_family_index()];
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_family_indices);

        let buffer = unsafe { raw.create_buffer(&buffer_info, None) }.check("vkCreateBuffer")?;

        // Partially built buffers are released by Drop on early return
        let mut this = Self {
            device: Some(device),
            size,
            memory: vk::DeviceMemory::null(),
            buffer,
            mapped: Cell::new(false),
        };

        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
        let (memory_type_index, allocation_size) =
            allocation_for(device.memory_properties(), size, &requirements)
                .ok_or(Error::NoHostVisibleMemory { size })?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(allocation_size)
            .memory_type_index(memory_type_index);

        this.memory = unsafe { raw.allocate_memory(&alloc_info, None) }
            .check("vkAllocateMemory")?;

        unsafe { raw.bind_buffer_memory(this.buffer, this.memory, 0) }
            .check("vkBindBufferMemory")?;

        log::debug!(
            "Allocated {} byte buffer ({} bytes, memory type {})",
            size,
            allocation_size,
            memory_type_index
        );

        Ok(this)
    }

    /// Requested size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.buffer == vk::Buffer::null() && self.memory == vk::DeviceMemory::null()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.get()
    }

    /// Map the whole buffer into host memory.
    ///
    /// Only one mapping may be live at a time; it is released when the
    /// returned guard is dropped.
    pub fn map(&self) -> Result<Mapping<'_>> {
        let device = self.device.ok_or(Error::Released("Buffer"))?;
        if self.memory == vk::DeviceMemory::null() {
            return Err(Error::Released("Buffer"));
        }
        if self.mapped.replace(true) {
            return Err(Error::AlreadyMapped);
        }

        let ptr = unsafe {
            device
                .raw()
                .and_then(|raw| {
                    raw.map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                        .check("vkMapMemory")
                })
        };
        let ptr = match ptr {
            Ok(ptr) => ptr,
            Err(err) => {
                self.mapped.set(false);
                return Err(err);
            }
        };

        Ok(Mapping {
            buffer: self,
            // Vulkan never returns null from a successful map
            ptr: NonNull::new(ptr.cast::<u8>()).unwrap_or(NonNull::dangling()),
            len: self.size as usize,
        })
    }

    fn check_bounds(&self, requested: usize) -> Result<()> {
        let requested = requested as vk::DeviceSize;
        if requested > self.size {
            return Err(Error::OutOfBounds {
                requested,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Copy `data` into the start of the buffer
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.check_bounds(bytes.len())?;

        let mut mapping = self.map()?;
        mapping[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read the first `count` elements of the buffer
    pub fn read<T: bytemuck::Pod>(&self, count: usize) -> Result<Vec<T>> {
        let len = count
            .checked_mul(std::mem::size_of::<T>())
            .unwrap_or(usize::MAX);
        self.check_bounds(len)?;

        let mapping = self.map()?;
        let bytes = &mapping[..len];
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    fn unmap(&self) {
        if let Some(Ok(raw)) = self.device.map(|device| device.raw()) {
            unsafe { raw.unmap_memory(self.memory) };
        }
        self.mapped.set(false);
    }
}

impl BindableBuffer for Buffer<'_> {
    fn raw_buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn owner(&self) -> vk::Device {
        match self.device.map(|device| device.raw()) {
            Some(Ok(raw)) if !self.is_null() => raw.handle(),
            _ => vk::Device::null(),
        }
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        let Some(Ok(raw)) = self.device.take().map(|device| device.raw()) else {
            return;
        };

        unsafe {
            if self.buffer != vk::Buffer::null() {
                raw.destroy_buffer(self.buffer, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                raw.free_memory(self.memory, None);
            }
        }
    }
}

/// Host view over a mapped [`Buffer`]; unmaps on drop
pub struct Mapping<'b> {
    buffer: &'b Buffer<'b>,
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping<'_> {
    /// Typed view; panics if the length is not a multiple of `T`
    pub fn as_slice<T: bytemuck::Pod>(&self) -> &[T] {
        bytemuck::cast_slice(&self[..])
    }

    pub fn as_mut_slice<T: bytemuck::Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(&mut self[..])
    }

    pub fn unmap(self) {}
}

impl Deref for Mapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Mapping<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        self.buffer.unmap();
    }
}
