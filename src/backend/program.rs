// Compute program - one kernel plus its buffer bindings
//
// The shader module is created once. Every `bind` tears down and rebuilds
// the descriptor set layout, pipeline layout, pipeline, descriptor pool and
// descriptor set for the new buffer list. `dispatch` records into the
// device's command buffer, submits, and waits for the queue to go idle.

use super::buffer::BindableBuffer;
use super::error::{Check, Error, Result};
use super::shader::{self, ENTRY_POINT};
use super::Device;
use ash::vk;
use std::marker::PhantomData;
use std::path::Path;

/// Every buffer must be live and created on `device`
fn check_bindings(device: vk::Device, buffers: &[&dyn BindableBuffer]) -> Result<()> {
    if buffers.is_empty() {
        return Err(Error::EmptyBinding);
    }
    for (binding, buffer) in buffers.iter().enumerate() {
        if buffer.raw_buffer() == vk::Buffer::null() {
            return Err(Error::Released("Buffer"));
        }
        if buffer.owner() != device {
            return Err(Error::ForeignBuffer { binding });
        }
    }
    Ok(())
}

/// Pipeline objects built for one buffer list
#[derive(Default)]
struct Pipeline {
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    buffers: Vec<vk::Buffer>,
}

impl Pipeline {
    fn build(
        &mut self,
        device: &ash::Device,
        shader_module: vk::ShaderModule,
        buffers: &[&dyn BindableBuffer],
    ) -> Result<()> {
        // Binding index = position in the list
        let bindings: Vec<_> = (0..buffers.len() as u32)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        self.descriptor_set_layout =
            unsafe { device.create_descriptor_set_layout(&layout_info, None) }
                .check("vkCreateDescriptorSetLayout")?;

        let set_layouts = [self.descriptor_set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        self.pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .check("vkCreatePipelineLayout")?;

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(ENTRY_POINT)
            .build();
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(self.pipeline_layout)
            .build();
        self.pipeline = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, code)| code)
        .check("vkCreateComputePipelines")?[0];

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: buffers.len() as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .check("vkCreateDescriptorPool")?;

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        self.descriptor_set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .check("vkAllocateDescriptorSets")?[0];

        self.buffers = buffers.iter().map(|buffer| buffer.raw_buffer()).collect();
        let buffer_infos: Vec<_> = self
            .buffers
            .iter()
            .map(|&buffer| vk::DescriptorBufferInfo {
                buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            })
            .collect();
        let writes: Vec<_> = buffer_infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(self.descriptor_set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        Ok(())
    }

    /// Destroy whatever has been created; the descriptor set goes with its pool
    fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            }
        }
        *self = Self::default();
    }
}

/// A compute kernel and the buffers it is currently bound to.
///
/// States: unbound after `new`, bound after a successful `bind`. Buffers
/// passed to `bind` stay borrowed for the program's lifetime `'a`.
#[derive(Default)]
pub struct Program<'a> {
    device: Option<&'a Device<'a>>,
    shader_module: vk::ShaderModule,
    pipeline: Option<Pipeline>,
    _buffers: PhantomData<&'a dyn BindableBuffer>,
}

impl<'a> Program<'a> {
    /// Load the SPIR-V kernel at `path`
    pub fn new(device: &'a Device<'a>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = device.raw()?;
        let code = shader::read_spirv(path)?;
        let shader_module = shader::create_shader_module(raw, &code)?;

        log::debug!("Loaded compute shader {:?} ({} words)", path, code.len());

        Ok(Self {
            device: Some(device),
            shader_module,
            pipeline: None,
            _buffers: PhantomData,
        })
    }

    pub fn is_null(&self) -> bool {
        self.shader_module == vk::ShaderModule::null()
    }

    pub fn is_bound(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Raw handles currently bound, in binding order
    pub fn bound_buffers(&self) -> &[vk::Buffer] {
        self.pipeline
            .as_ref()
            .map(|pipeline| pipeline.buffers.as_slice())
            .unwrap_or(&[])
    }

    /// Bind `buffers` to storage bindings 0..n, replacing any previous binding.
    ///
    /// Released buffers and buffers from another device are rejected before
    /// the previous binding is torn down.
    pub fn bind(&mut self, buffers: &[&'a dyn BindableBuffer]) -> Result<()> {
        let device = self.device.ok_or(Error::Released("Program"))?.raw()?;
        check_bindings(device.handle(), buffers)?;

        if let Some(mut old) = self.pipeline.take() {
            old.destroy(device);
        }

        let mut pipeline = Pipeline::default();
        if let Err(err) = pipeline.build(device, self.shader_module, buffers) {
            pipeline.destroy(device);
            return Err(err);
        }

        log::debug!("Rebuilt compute pipeline for {} buffer(s)", buffers.len());
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Run the kernel over `x * y * z` workgroups and wait for it to finish
    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<()> {
        let device = self.device.ok_or(Error::Released("Program"))?;
        let pipeline = self.pipeline.as_ref().ok_or(Error::NotBound)?;
        let raw = device.raw()?;
        let cmd = device.command_buffer();
        let queue = device.compute_queue();

        log::trace!("Dispatching {}x{}x{} workgroups", x, y, z);

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            raw.begin_command_buffer(cmd, &begin_info)
                .check("vkBeginCommandBuffer")?;

            raw.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            raw.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.pipeline_layout,
                0,
                &[pipeline.descriptor_set],
                &[],
            );
            raw.cmd_dispatch(cmd, x, y, z);

            raw.end_command_buffer(cmd).check("vkEndCommandBuffer")?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            raw.queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                .check("vkQueueSubmit")?;

            raw.queue_wait_idle(queue).check("vkQueueWaitIdle")?;
        }

        Ok(())
    }
}

impl Drop for Program<'_> {
    fn drop(&mut self) {
        let Some(Ok(raw)) = self.device.take().map(|device| device.raw()) else {
            return;
        };

        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.destroy(raw);
        }
        if self.shader_module != vk::ShaderModule::null() {
            unsafe { raw.destroy_shader_module(self.shader_module, None) };
        }
    }
}
