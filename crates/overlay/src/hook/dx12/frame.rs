use core::mem::{self, ManuallyDrop};

use anyhow::Context;
use scopeguard::defer;
use tracing::debug;
use windows::{
    Win32::{
        Foundation::CloseHandle,
        Graphics::{
            Direct3D12::{
                D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_CPU_DESCRIPTOR_HANDLE,
                D3D12_DESCRIPTOR_HEAP_DESC, D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE, D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                D3D12_DESCRIPTOR_HEAP_TYPE_RTV, D3D12_FENCE_FLAG_NONE, D3D12_RESOURCE_BARRIER,
                D3D12_RESOURCE_BARRIER_0, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                D3D12_RESOURCE_BARRIER_FLAG_NONE, D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
                D3D12_RESOURCE_STATES, D3D12_RESOURCE_TRANSITION_BARRIER, ID3D12CommandAllocator,
                ID3D12CommandQueue, ID3D12DescriptorHeap, ID3D12Device, ID3D12Fence,
                ID3D12GraphicsCommandList, ID3D12Resource,
            },
            Dxgi::IDXGISwapChain,
        },
        System::Threading::{CreateEventA, WaitForSingleObject},
    },
};

use crate::backend::frames::BufferContexts;

/// Upper bound of swapchain buffers.
pub const MAX_BUFFERS: usize = 16;

/// Fence tracking the overlay's own submissions.
pub struct GpuFence {
    fence: ID3D12Fence,
    value: u64,
}

impl GpuFence {
    pub fn new(device: &ID3D12Device) -> anyhow::Result<Self> {
        Ok(Self {
            fence: unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE)? },
            value: 0,
        })
    }

    /// Signal after the last submission on `queue`. Returns the value to wait for.
    pub fn signal(&mut self, queue: &ID3D12CommandQueue) -> anyhow::Result<u64> {
        self.value += 1;
        unsafe { queue.Signal(&self.fence, self.value)? };

        Ok(self.value)
    }

    pub fn wait(&self, value: u64) -> anyhow::Result<()> {
        if value == 0 || unsafe { self.fence.GetCompletedValue() } >= value {
            return Ok(());
        }

        unsafe {
            let event = CreateEventA(None, false, false, None)?;
            defer!({
                _ = CloseHandle(event);
            });
            self.fence.SetEventOnCompletion(value, event)?;
            WaitForSingleObject(event, u32::MAX);
        }

        Ok(())
    }

    /// Wait for every submission so far.
    pub fn wait_idle(&self) -> anyhow::Result<()> {
        self.wait(self.value)
    }
}

/// Per buffer context. The allocator survives resizes, the buffer does not.
pub struct FrameContext {
    pub allocator: ID3D12CommandAllocator,
    pub back_buffer: Option<ID3D12Resource>,
    pub rtv: D3D12_CPU_DESCRIPTOR_HANDLE,
    pub fence_value: u64,
}

/// Descriptor heaps of the overlay.
pub struct Descriptors {
    pub srv_heap: ID3D12DescriptorHeap,
    rtv_heap: ID3D12DescriptorHeap,
    rtv_size: usize,
}

impl Descriptors {
    pub fn new(device: &ID3D12Device) -> anyhow::Result<Self> {
        unsafe {
            let srv_heap =
                device.CreateDescriptorHeap::<ID3D12DescriptorHeap>(&D3D12_DESCRIPTOR_HEAP_DESC {
                    Type: D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                    NumDescriptors: 1,
                    Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                    ..Default::default()
                })?;
            let rtv_heap =
                device.CreateDescriptorHeap::<ID3D12DescriptorHeap>(&D3D12_DESCRIPTOR_HEAP_DESC {
                    Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                    NumDescriptors: MAX_BUFFERS as _,
                    Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                    ..Default::default()
                })?;
            let rtv_size =
                device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV) as usize;

            Ok(Self {
                srv_heap,
                rtv_heap,
                rtv_size,
            })
        }
    }

    pub fn rtv(&self, index: usize) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: unsafe { self.rtv_heap.GetCPUDescriptorHandleForHeapStart() }.ptr
                + self.rtv_size * index,
        }
    }
}

/// Size `frames` to `count` buffers and bind each to its back buffer.
pub fn bind_frames(
    frames: &mut BufferContexts<FrameContext>,
    device: &ID3D12Device,
    swapchain: &IDXGISwapChain,
    descriptors: &Descriptors,
    count: usize,
) -> anyhow::Result<()> {
    if count > MAX_BUFFERS {
        anyhow::bail!("{count} swapchain buffers, at most {MAX_BUFFERS} supported");
    }

    frames.resize_with(count, |index| {
        Ok(FrameContext {
            allocator: unsafe {
                device.CreateCommandAllocator::<ID3D12CommandAllocator>(
                    D3D12_COMMAND_LIST_TYPE_DIRECT,
                )?
            },
            back_buffer: None,
            rtv: descriptors.rtv(index),
            fence_value: 0,
        })
    })?;

    frames.bind_each(|index, frame| {
        let back_buffer = unsafe { swapchain.GetBuffer::<ID3D12Resource>(index as _) }
            .with_context(|| format!("cannot get back buffer {index}"))?;
        unsafe { device.CreateRenderTargetView(&back_buffer, None, frame.rtv) };
        frame.back_buffer = Some(back_buffer);

        Ok(())
    })?;
    debug!("bound {} frame contexts", count);

    Ok(())
}

pub fn create_command_list(
    device: &ID3D12Device,
    allocator: &ID3D12CommandAllocator,
) -> anyhow::Result<ID3D12GraphicsCommandList> {
    unsafe {
        let command_list = device.CreateCommandList::<_, _, ID3D12GraphicsCommandList>(
            0,
            D3D12_COMMAND_LIST_TYPE_DIRECT,
            allocator,
            None,
        )?;
        command_list.Close()?;

        Ok(command_list)
    }
}

pub fn transition(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // borrowed without touching the reference count
                pResource: unsafe { mem::transmute_copy(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}
