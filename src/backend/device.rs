// Vulkan Device - one physical GPU and its compute queue
//
// Responsibilities:
// - Compute queue family selection (prefer dedicated compute)
// - Logical device + queue creation
// - One resettable command pool and one reusable command buffer
// - Host-visible memory type lookup for buffers

use super::error::{Check, Error, Result};
use super::Instance;
use ash::vk;
use std::cell::Cell;
use std::ffi::CStr;
use std::marker::PhantomData;

/// Pick the queue family used for compute work.
///
/// A family with compute but no graphics wins; otherwise the first family
/// with compute at all.
pub fn select_compute_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let compute = |family: &vk::QueueFamilyProperties| {
        family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
    };

    families
        .iter()
        .position(|family| compute(family) && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| families.iter().position(compute))
        .map(|index| index as u32)
}

/// First memory type (ascending index) that is host-visible and host-coherent,
/// allowed by `type_bits`, and whose heap can hold `size` bytes.
pub fn host_visible_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    type_bits: u32,
) -> Option<u32> {
    let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

    (0..memory_properties.memory_type_count).find(|&i| {
        let memory_type = &memory_properties.memory_types[i as usize];
        let heap = &memory_properties.memory_heaps[memory_type.heap_index as usize];

        (type_bits & (1 << i)) != 0
            && memory_type.property_flags.contains(required)
            && size <= heap.size
    })
}

/// Logical device bound to one physical device.
///
/// Owns the compute queue, a command pool and the single command buffer that
/// every dispatch records into. A `Device` is driven from one thread only.
#[derive(Default)]
pub struct Device<'i> {
    _instance: Option<&'i Instance>,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    device: Option<ash::Device>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    compute_queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    name: String,
    _single_thread: PhantomData<Cell<()>>,
}

impl<'i> Device<'i> {
    pub fn new(instance: &'i Instance, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let raw_instance = instance.raw()?;

        let properties = unsafe { raw_instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let families =
            unsafe { raw_instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family_index = select_compute_queue_family(&families)
            .ok_or_else(|| Error::NoComputeQueue { name: name.clone() })?;

        let memory_properties =
            unsafe { raw_instance.get_physical_device_memory_properties(physical_device) };

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { raw_instance.create_device(physical_device, &create_info, None) }
            .check("vkCreateDevice")?;

        // From here on, an early return drops `this` and releases what exists so far
        let mut this = Self {
            _instance: Some(instance),
            physical_device,
            queue_family_index,
            device: Some(device),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            compute_queue: vk::Queue::null(),
            memory_properties,
            name,
            _single_thread: PhantomData,
        };
        let device = this.raw()?.clone();

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        this.command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .check("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(this.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        this.command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .check("vkAllocateCommandBuffers")?[0];

        this.compute_queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        log::info!(
            "Device ready: {} ({:?}, compute queue family {})",
            this.name,
            properties.device_type,
            queue_family_index
        );

        Ok(this)
    }

    /// Whether this device still owns a logical device
    pub fn is_null(&self) -> bool {
        self.device.is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn compute_queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Memory type index for a host-mappable allocation of `size` bytes
    pub fn find_host_visible_memory(&self, size: vk::DeviceSize) -> Option<u32> {
        host_visible_memory_type(&self.memory_properties, size, u32::MAX)
    }

    pub(crate) fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub(crate) fn raw(&self) -> Result<&ash::Device> {
        self.device.as_ref().ok_or(Error::Released("Device"))
    }

    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub(crate) fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Block until all submitted work has finished
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.raw()?.device_wait_idle() }.check("vkDeviceWaitIdle")
    }
}

impl Drop for Device<'_> {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };

        log::info!("Destroying device {}...", self.name);

        // Cleanup in reverse order
        unsafe {
            let _ = device.device_wait_idle();

            if self.command_buffer != vk::CommandBuffer::null() {
                device.free_command_buffers(self.command_pool, &[self.command_buffer]);
            }
            if self.command_pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.command_pool, None);
            }
            device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn memory(
        types: &[(vk::MemoryPropertyFlags, u32)],
        heaps: &[vk::DeviceSize],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &(flags, heap_index)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index,
            };
        }
        props.memory_heap_count = heaps.len() as u32;
        for (i, &size) in heaps.iter().enumerate() {
            props.memory_heaps[i] = vk::MemoryHeap {
                size,
                flags: vk::MemoryHeapFlags::empty(),
            };
        }
        props
    }

    fn host() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    }

    #[test]
    fn prefers_dedicated_compute_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_compute_queue_family(&families), Some(2));
    }

    #[test]
    fn falls_back_to_first_compute_family() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(select_compute_queue_family(&families), Some(1));
    }

    #[test]
    fn no_compute_family() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        assert_eq!(select_compute_queue_family(&families), None);
        assert_eq!(select_compute_queue_family(&[]), None);
    }

    #[test]
    fn host_visible_memory_respects_heap_capacity() {
        let heap = 256 * 1024 * 1024;
        let props = memory(&[(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0), (host(), 1)], &[1 << 33, heap]);

        assert_eq!(host_visible_memory_type(&props, 1, u32::MAX), Some(1));
        assert_eq!(host_visible_memory_type(&props, heap, u32::MAX), Some(1));
        assert_eq!(host_visible_memory_type(&props, heap + 1, u32::MAX), None);
    }

    #[test]
    fn host_visible_memory_is_first_fit() {
        let props = memory(
            &[
                (vk::MemoryPropertyFlags::HOST_VISIBLE, 0),
                (host(), 0),
                (host() | vk::MemoryPropertyFlags::HOST_CACHED, 1),
            ],
            &[1024, 1 << 20],
        );

        // Type 0 lacks coherence; type 1 is the first fit while its heap is big enough
        assert_eq!(host_visible_memory_type(&props, 1024, u32::MAX), Some(1));
        assert_eq!(host_visible_memory_type(&props, 1025, u32::MAX), Some(2));
        assert_eq!(host_visible_memory_type(&props, (1 << 20) + 1, u32::MAX), None);
    }

    #[test]
    fn host_visible_memory_honors_type_bits() {
        let props = memory(&[(host(), 0), (host(), 0)], &[4096]);
        assert_eq!(host_visible_memory_type(&props, 16, 0b10), Some(1));
        assert_eq!(host_visible_memory_type(&props, 16, 0b00), None);
    }

    #[test]
    fn default_device_is_empty() {
        let device = Device::default();
        assert!(device.is_null());
        assert_eq!(device.find_host_visible_memory(1), None);
        assert!(matches!(device.raw(), Err(Error::Released("Device"))));
        assert!(matches!(device.wait_idle(), Err(Error::Released(_))));
    }

    #[test]
    fn taking_leaves_an_empty_device_behind() {
        let mut source = Device::default();
        let moved = std::mem::take(&mut source);
        assert!(source.is_null());
        assert!(moved.is_null());
        assert_eq!(source.command_buffer(), vk::CommandBuffer::null());
    }
}
