mod frame;
mod queue;

use anyhow::{Context, bail};
use once_cell::sync::Lazy;
use tracing::debug;
use windows::{
    Win32::Graphics::{
        Direct3D12::{
            D3D12_RESOURCE_STATE_PRESENT, D3D12_RESOURCE_STATE_RENDER_TARGET, ID3D12CommandList,
            ID3D12CommandQueue, ID3D12Device, ID3D12GraphicsCommandList,
        },
        Dxgi::{IDXGISwapChain, IDXGISwapChain3},
    },
    core::{HRESULT, Interface},
};

use crate::{
    backend::{
        BackendKind, CandidateOps,
        frames::BufferContexts,
        state::{FrameState, SwapchainTarget},
    },
    config::QueueAcquisition,
    session::SessionCore,
    types::WindowHandle,
    ui::{DrawTarget, OverlayUi, RendererInit},
};

use self::frame::{Descriptors, FrameContext, GpuFence};
use super::{dxgi, util};

pub(super) static OPS: CandidateOps = CandidateOps {
    is_supported: || util::is_supported(BackendKind::Dx12),
    initialize: |options| {
        dxgi::install(BackendKind::Dx12, options)?;
        queue::install(options.dx12_queue)
    },
    set_enabled: |enabled| {
        dxgi::set_enabled(BackendKind::Dx12, enabled)?;
        queue::set_enabled(enabled)
    },
    deactivate: || {
        dxgi::set_enabled(BackendKind::Dx12, false)?;
        queue::set_enabled(false)
    },
    shutdown: |session| {
        FRAMES.shutdown(session);
        queue::clear();
    },
};

static FRAMES: Lazy<FrameState<Dx12Resources>> =
    Lazy::new(|| FrameState::new(BackendKind::Dx12));

pub struct Dx12Resources {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    descriptors: Descriptors,
    frames: BufferContexts<FrameContext>,
    command_list: ID3D12GraphicsCommandList,
    fence: GpuFence,
}

// SAFETY: only used under the frame state lock
unsafe impl Send for Dx12Resources {}

impl Drop for Dx12Resources {
    fn drop(&mut self) {
        if let Err(err) = self.fence.wait_idle() {
            debug!("gpu wait before release failed. err: {:?}", err);
        }
    }
}

struct Dx12Swapchain<'a> {
    swapchain: &'a IDXGISwapChain,
    device: ID3D12Device,
    window: WindowHandle,
    strategy: QueueAcquisition,
}

impl SwapchainTarget for Dx12Swapchain<'_> {
    type Resources = Dx12Resources;

    fn window(&self) -> WindowHandle {
        self.window
    }

    fn create(&self, ui: &mut dyn OverlayUi) -> anyhow::Result<Dx12Resources> {
        let queue = queue::find(self.strategy, &self.device, self.swapchain)
            .context("direct command queue not acquired yet")?;
        let desc = unsafe { self.swapchain.GetDesc()? };

        let descriptors = Descriptors::new(&self.device)?;
        let mut frames = BufferContexts::new();
        frame::bind_frames(
            &mut frames,
            &self.device,
            self.swapchain,
            &descriptors,
            desc.BufferCount as usize,
        )?;
        let command_list = frame::create_command_list(
            &self.device,
            &frames.get_mut(0).context("swapchain without buffers")?.allocator,
        )?;
        let fence = GpuFence::new(&self.device)?;

        unsafe {
            ui.renderer_init(RendererInit::Dx12 {
                device: self.device.as_raw(),
                frames_in_flight: desc.BufferCount,
                format: desc.BufferDesc.Format.0,
                srv_heap: descriptors.srv_heap.as_raw(),
                srv_cpu_handle: descriptors.srv_heap.GetCPUDescriptorHandleForHeapStart().ptr,
                srv_gpu_handle: descriptors.srv_heap.GetGPUDescriptorHandleForHeapStart().ptr,
            })?;
        }

        Ok(Dx12Resources {
            device: self.device.clone(),
            queue,
            descriptors,
            frames,
            command_list,
            fence,
        })
    }

    fn invalidate(&self, resources: &mut Dx12Resources, ui: &mut dyn OverlayUi) {
        // back buffers may still be referenced by submitted overlay work
        if let Err(err) = resources.fence.wait_idle() {
            debug!("gpu wait before resize failed. err: {:?}", err);
        }

        ui.invalidate_device_objects(BackendKind::Dx12);
        for frame in resources.frames.iter_mut() {
            frame.back_buffer = None;
        }
    }

    fn rebuild(&self, resources: &mut Dx12Resources, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        let desc = unsafe { self.swapchain.GetDesc()? };
        frame::bind_frames(
            &mut resources.frames,
            &self.device,
            self.swapchain,
            &resources.descriptors,
            desc.BufferCount as usize,
        )?;

        if !ui.create_device_objects(BackendKind::Dx12) {
            bail!("device object creation failed");
        }

        Ok(())
    }

    fn draw(&self, resources: &mut Dx12Resources, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        if resources.device != self.device {
            bail!("swapchain belongs to another device");
        }

        let index = unsafe {
            self.swapchain
                .cast::<IDXGISwapChain3>()?
                .GetCurrentBackBufferIndex()
        } as usize;

        let Dx12Resources {
            queue,
            descriptors,
            frames,
            command_list,
            fence,
            ..
        } = resources;
        let frame = frames
            .get_mut(index)
            .with_context(|| format!("no frame context for buffer {index}"))?;
        let back_buffer = frame.back_buffer.clone().context("back buffer released")?;

        fence.wait(frame.fence_value)?;
        unsafe {
            frame.allocator.Reset()?;
            command_list.Reset(&frame.allocator, None)?;

            command_list.ResourceBarrier(&[frame::transition(
                &back_buffer,
                D3D12_RESOURCE_STATE_PRESENT,
                D3D12_RESOURCE_STATE_RENDER_TARGET,
            )]);
            command_list.OMSetRenderTargets(1, Some(&frame.rtv), false, None);
            command_list.SetDescriptorHeaps(&[Some(descriptors.srv_heap.clone())]);
        }

        ui.render_draw_data(
            BackendKind::Dx12,
            DrawTarget::CommandList(command_list.as_raw()),
        );

        unsafe {
            command_list.ResourceBarrier(&[frame::transition(
                &back_buffer,
                D3D12_RESOURCE_STATE_RENDER_TARGET,
                D3D12_RESOURCE_STATE_PRESENT,
            )]);
            command_list.Close()?;
        }

        queue::execute(queue, &[Some(command_list.cast::<ID3D12CommandList>()?)]);
        frame.fence_value = fence.signal(queue)?;

        Ok(())
    }
}

fn target<'a>(
    session: &SessionCore,
    swapchain: &'a IDXGISwapChain,
    device: ID3D12Device,
) -> Dx12Swapchain<'a> {
    Dx12Swapchain {
        swapchain,
        device,
        window: dxgi::swapchain_window(swapchain),
        strategy: session.options().dx12_queue,
    }
}

pub fn present(
    session: &SessionCore,
    swapchain: &IDXGISwapChain,
    device: ID3D12Device,
    original: impl FnOnce() -> HRESULT,
) -> HRESULT {
    FRAMES.present(session, &target(session, swapchain, device), original)
}

pub fn resize(
    session: &SessionCore,
    swapchain: &IDXGISwapChain,
    device: ID3D12Device,
    original: impl FnOnce() -> HRESULT,
) -> HRESULT {
    FRAMES.resize(session, &target(session, swapchain, device), original)
}
