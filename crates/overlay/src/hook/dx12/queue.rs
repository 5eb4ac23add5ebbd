//! Direct command queue acquisition.
//!
//! Presenting never names the queue the swapchain was created on. It is either
//! captured from the host's own submissions, or read from the swapchain object
//! at an offset measured on a throwaway swapchain.

use core::{
    ffi::c_void,
    mem,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use frame_overlay_hook::DetourHook;
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, trace};
use windows::{
    Win32::{
        Foundation::HWND,
        Graphics::{
            Direct3D::D3D_FEATURE_LEVEL_11_0,
            Direct3D12::{
                D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_COMMAND_QUEUE_DESC,
                D3D12_COMMAND_QUEUE_FLAG_NONE, D3D12CreateDevice, ID3D12CommandList,
                ID3D12CommandQueue, ID3D12Device,
            },
            Dxgi::{
                Common::{DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC},
                CreateDXGIFactory1, DXGI_SWAP_CHAIN_DESC1, DXGI_SWAP_EFFECT_FLIP_DISCARD,
                DXGI_USAGE_RENDER_TARGET_OUTPUT, IDXGIFactory2, IDXGISwapChain,
            },
        },
    },
    core::Interface,
};

use crate::{config::QueueAcquisition, types::Captures};

use super::super::util::with_dummy_hwnd;

pub type ExecuteCommandListsFn = unsafe extern "system" fn(*mut c_void, u32, *const *mut c_void);

// swapchain objects are far larger, this only bounds the scan
const SCAN_WORDS: usize = 512;

struct WeakQueue(*mut c_void);

// SAFETY: COM pointer, only dereferenced right after the submission it was captured from
unsafe impl Send for WeakQueue {}
unsafe impl Sync for WeakQueue {}

// ID3D12Device -> direct queue of its latest submission
static QUEUE_MAP: Lazy<Captures<WeakQueue>> = Lazy::new(Captures::new);

static EXECUTE_COMMAND_LISTS: OnceCell<DetourHook<ExecuteCommandListsFn>> = OnceCell::new();
static CAPTURING: AtomicBool = AtomicBool::new(false);

static QUEUE_OFFSET: OnceCell<usize> = OnceCell::new();

/// Prepare `strategy`. Bootstraps once per strategy.
#[tracing::instrument]
pub fn install(strategy: QueueAcquisition) -> anyhow::Result<()> {
    match strategy {
        QueueAcquisition::SubmissionCapture => {
            let hook = EXECUTE_COMMAND_LISTS.get_or_try_init(|| {
                let addr = with_dummy_hwnd(|_| get_execute_command_lists_addr())?;
                debug!("hooking ID3D12CommandQueue::ExecuteCommandLists");
                Ok::<_, anyhow::Error>(unsafe {
                    DetourHook::attach(addr, hooked_execute_command_lists as _)?
                })
            })?;

            CAPTURING.store(true, Ordering::Release);
            hook.enable()?;
        }

        QueueAcquisition::SwapchainOffset => {
            QUEUE_OFFSET.get_or_try_init(|| with_dummy_hwnd(measure_queue_offset))?;
        }
    }

    Ok(())
}

pub fn set_enabled(enabled: bool) -> anyhow::Result<()> {
    if let Some(hook) = EXECUTE_COMMAND_LISTS.get() {
        CAPTURING.store(enabled, Ordering::Release);
        hook.set_enabled(enabled)?;
    }

    Ok(())
}

/// Forget captured queues. Their devices may be gone.
pub fn clear() {
    QUEUE_MAP.clear();
}

/// Direct queue presenting to `swapchain` of `device`, if known.
pub fn find(
    strategy: QueueAcquisition,
    device: &ID3D12Device,
    swapchain: &IDXGISwapChain,
) -> Option<ID3D12CommandQueue> {
    match strategy {
        QueueAcquisition::SubmissionCapture => {
            // the host may release the queue any time after submitting
            let queue = QUEUE_MAP.take(device.as_raw() as usize)?;
            unsafe { ID3D12CommandQueue::from_raw_borrowed(&queue.0) }.cloned()
        }

        QueueAcquisition::SwapchainOffset => {
            let offset = *QUEUE_OFFSET.get()?;
            let queue = unsafe {
                swapchain
                    .as_raw()
                    .cast::<u8>()
                    .add(offset)
                    .cast::<*mut c_void>()
                    .read()
            };
            let queue = unsafe { ID3D12CommandQueue::from_raw_borrowed(&queue) }?.clone();

            (unsafe { queue.GetDesc() }.Type == D3D12_COMMAND_LIST_TYPE_DIRECT).then_some(queue)
        }
    }
}

/// Submit on `queue` without going through the capture hook.
pub fn execute(queue: &ID3D12CommandQueue, command_lists: &[Option<ID3D12CommandList>]) {
    match EXECUTE_COMMAND_LISTS.get() {
        Some(hook) => unsafe {
            hook.original_fn()(
                queue.as_raw(),
                command_lists.len() as _,
                command_lists.as_ptr().cast(),
            )
        },
        None => unsafe { queue.ExecuteCommandLists(command_lists) },
    }
}

#[tracing::instrument]
extern "system" fn hooked_execute_command_lists(
    this: *mut c_void,
    num_command_lists: u32,
    command_lists: *const *mut c_void,
) {
    trace!("ExecuteCommandLists called");

    if CAPTURING.load(Ordering::Acquire) {
        if let Some(queue) = unsafe { ID3D12CommandQueue::from_raw_borrowed(&this) } {
            capture(queue);
        }
    }

    unsafe {
        EXECUTE_COMMAND_LISTS.wait().original_fn()(this, num_command_lists, command_lists)
    }
}

fn capture(queue: &ID3D12CommandQueue) {
    if unsafe { queue.GetDesc() }.Type != D3D12_COMMAND_LIST_TYPE_DIRECT {
        return;
    }

    let mut device = None;
    if unsafe { queue.GetDevice::<ID3D12Device>(&mut device) }.is_err() {
        return;
    }
    let Some(device) = device else {
        return;
    };

    if QUEUE_MAP
        .record(device.as_raw() as usize, WeakQueue(queue.as_raw()))
        .is_none()
    {
        debug!("captured direct queue {:?} of device {:?}", queue, device);
    }
}

fn create_bootstrap_queue() -> anyhow::Result<ID3D12CommandQueue> {
    unsafe {
        let mut device = None;
        D3D12CreateDevice::<_, ID3D12Device>(None, D3D_FEATURE_LEVEL_11_0, &mut device)?;
        let device = device.context("cannot create ID3D12Device")?;

        Ok(device.CreateCommandQueue::<ID3D12CommandQueue>(&D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            ..Default::default()
        })?)
    }
}

#[tracing::instrument]
fn get_execute_command_lists_addr() -> anyhow::Result<ExecuteCommandListsFn> {
    let queue = create_bootstrap_queue()?;
    let addr = Interface::vtable(&queue).ExecuteCommandLists;
    debug!("ID3D12CommandQueue::ExecuteCommandLists found: {:p}", addr);

    Ok(addr)
}

/// Find where a swapchain keeps its queue pointer.
#[tracing::instrument]
fn measure_queue_offset(dummy_hwnd: HWND) -> anyhow::Result<usize> {
    let queue = create_bootstrap_queue()?;
    let swapchain = unsafe {
        let factory = CreateDXGIFactory1::<IDXGIFactory2>()?;
        factory.CreateSwapChainForHwnd(
            &queue,
            dummy_hwnd,
            &DXGI_SWAP_CHAIN_DESC1 {
                Width: 2,
                Height: 2,
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    ..Default::default()
                },
                BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                BufferCount: 2,
                SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                ..Default::default()
            },
            None,
            None,
        )?
    };

    let words = swapchain.as_raw().cast::<usize>().cast_const();
    let target = queue.as_raw() as usize;
    let index = (0..SCAN_WORDS)
        .find(|&index| unsafe { words.add(index).read() } == target)
        .context("queue pointer not found in swapchain")?;

    let offset = index * mem::size_of::<usize>();
    debug!("swapchain queue offset: {:#x}", offset);
    Ok(offset)
}
