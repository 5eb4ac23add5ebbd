use anyhow::{Context, bail};
use once_cell::sync::Lazy;
use windows::{
    Win32::Graphics::{
        Direct3D11::{ID3D11Device, ID3D11DeviceContext, ID3D11RenderTargetView, ID3D11Texture2D},
        Dxgi::IDXGISwapChain,
    },
    core::{HRESULT, Interface},
};

use crate::{
    backend::{
        BackendKind, CandidateOps,
        state::{FrameState, SwapchainTarget},
    },
    session::SessionCore,
    types::WindowHandle,
    ui::{DrawTarget, OverlayUi, RendererInit},
};

use super::{dxgi, util};

pub(super) static OPS: CandidateOps = CandidateOps {
    is_supported: || util::is_supported(BackendKind::Dx11),
    initialize: |options| dxgi::install(BackendKind::Dx11, options),
    set_enabled: |enabled| dxgi::set_enabled(BackendKind::Dx11, enabled),
    deactivate: || dxgi::set_enabled(BackendKind::Dx11, false),
    shutdown: |session| FRAMES.shutdown(session),
};

static FRAMES: Lazy<FrameState<Dx11Resources>> =
    Lazy::new(|| FrameState::new(BackendKind::Dx11));

pub struct Dx11Resources {
    context: ID3D11DeviceContext,
    rtv: Option<ID3D11RenderTargetView>,
}

// SAFETY: only used under the frame state lock
unsafe impl Send for Dx11Resources {}

struct Dx11Swapchain<'a> {
    swapchain: &'a IDXGISwapChain,
    device: ID3D11Device,
    window: WindowHandle,
}

impl Dx11Swapchain<'_> {
    fn create_rtv(&self) -> anyhow::Result<ID3D11RenderTargetView> {
        unsafe {
            let back_buffer = self.swapchain.GetBuffer::<ID3D11Texture2D>(0)?;
            let mut rtv = None;
            self.device
                .CreateRenderTargetView(&back_buffer, None, Some(&mut rtv))?;
            rtv.context("render target view creation failed")
        }
    }
}

impl SwapchainTarget for Dx11Swapchain<'_> {
    type Resources = Dx11Resources;

    fn window(&self) -> WindowHandle {
        self.window
    }

    fn create(&self, ui: &mut dyn OverlayUi) -> anyhow::Result<Dx11Resources> {
        let context = unsafe { self.device.GetImmediateContext()? };
        let rtv = self.create_rtv()?;
        ui.renderer_init(RendererInit::Dx11 {
            device: self.device.as_raw(),
            context: context.as_raw(),
        })?;

        Ok(Dx11Resources {
            context,
            rtv: Some(rtv),
        })
    }

    fn invalidate(&self, resources: &mut Dx11Resources, ui: &mut dyn OverlayUi) {
        ui.invalidate_device_objects(BackendKind::Dx11);
        resources.rtv = None;
    }

    fn rebuild(&self, resources: &mut Dx11Resources, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        resources.rtv = Some(self.create_rtv()?);
        if !ui.create_device_objects(BackendKind::Dx11) {
            bail!("device object creation failed");
        }

        Ok(())
    }

    fn draw(&self, resources: &mut Dx11Resources, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        let rtv = resources.rtv.clone().context("render target released")?;
        unsafe {
            resources.context.OMSetRenderTargets(Some(&[Some(rtv)]), None);
        }
        ui.render_draw_data(BackendKind::Dx11, DrawTarget::Immediate);

        Ok(())
    }
}

pub fn present(
    session: &SessionCore,
    swapchain: &IDXGISwapChain,
    device: ID3D11Device,
    original: impl FnOnce() -> HRESULT,
) -> HRESULT {
    let target = Dx11Swapchain {
        swapchain,
        device,
        window: dxgi::swapchain_window(swapchain),
    };

    FRAMES.present(session, &target, original)
}

pub fn resize(
    session: &SessionCore,
    swapchain: &IDXGISwapChain,
    device: ID3D11Device,
    original: impl FnOnce() -> HRESULT,
) -> HRESULT {
    let target = Dx11Swapchain {
        swapchain,
        device,
        window: dxgi::swapchain_window(swapchain),
    };

    FRAMES.resize(session, &target, original)
}
