//! Keeps keyboard and mouse input away from the host while the overlay wants it.
//!
//! Messages pulled from the queue with `PeekMessage` are translated first, so character
//! messages still reach the overlay, then turned into `WM_NULL`.

use core::sync::atomic::{AtomicU8, Ordering};

use tracing::trace;

#[cfg(windows)]
pub(crate) const WM_NULL: u32 = 0x0000;
const WM_INPUT: u32 = 0x00FF;
const WM_KEYFIRST: u32 = 0x0100;
const WM_KEYLAST: u32 = 0x0109;
const WM_MOUSEFIRST: u32 = 0x0200;
const WM_MOUSELAST: u32 = 0x020E;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockInputFlags: u8 {
        const KEYBOARD = 0b00000001;
        const MOUSE = 0b00000010;
    }
}

/// Input class of a message, if any.
fn classify(msg: u32) -> Option<BlockInputFlags> {
    match msg {
        WM_KEYFIRST..=WM_KEYLAST => Some(BlockInputFlags::KEYBOARD),
        WM_MOUSEFIRST..=WM_MOUSELAST => Some(BlockInputFlags::MOUSE),
        // raw input carries both
        WM_INPUT => Some(BlockInputFlags::all()),
        _ => None,
    }
}

/// Whether `msg` must be hidden from the host under `flags`.
pub(crate) fn should_block(msg: u32, flags: BlockInputFlags) -> bool {
    classify(msg).is_some_and(|class| class.intersects(flags))
}

static FLAGS: AtomicU8 = AtomicU8::new(0);

/// Process wide input blocker.
#[derive(Debug, Clone, Copy)]
pub struct InputBlocker {
    _private: (),
}

impl InputBlocker {
    /// Install the message queue hooks. Installing twice returns the same blocker.
    pub fn install() -> anyhow::Result<Self> {
        install_hooks()?;
        Ok(Self { _private: () })
    }

    pub fn flags(&self) -> BlockInputFlags {
        current_flags()
    }

    pub fn set_flags(&self, flags: BlockInputFlags) {
        trace!("input blocking changed to {:?}", flags);
        FLAGS.store(flags.bits(), Ordering::Release);
    }

    pub fn set_block_keyboard(&self, block: bool) {
        let mut flags = self.flags();
        flags.set(BlockInputFlags::KEYBOARD, block);
        self.set_flags(flags);
    }

    pub fn set_block_mouse(&self, block: bool) {
        let mut flags = self.flags();
        flags.set(BlockInputFlags::MOUSE, block);
        self.set_flags(flags);
    }
}

#[inline]
pub(crate) fn current_flags() -> BlockInputFlags {
    BlockInputFlags::from_bits_truncate(FLAGS.load(Ordering::Acquire))
}

#[cfg(windows)]
fn install_hooks() -> anyhow::Result<()> {
    crate::hook::input::hook()
}

#[cfg(not(windows))]
fn install_hooks() -> anyhow::Result<()> {
    anyhow::bail!("input blocking is only available on Windows")
}

#[cfg(test)]
mod tests {
    use super::*;

    const WM_KEYDOWN: u32 = 0x0100;
    const WM_CHAR: u32 = 0x0102;
    const WM_MOUSEMOVE: u32 = 0x0200;
    const WM_MOUSEWHEEL: u32 = 0x020A;
    const WM_PAINT: u32 = 0x000F;

    #[test]
    fn nothing_blocked_without_flags() {
        for msg in [WM_KEYDOWN, WM_MOUSEMOVE, WM_INPUT, WM_PAINT] {
            assert!(!should_block(msg, BlockInputFlags::empty()));
        }
    }

    #[test]
    fn keyboard_only() {
        let flags = BlockInputFlags::KEYBOARD;
        assert!(should_block(WM_KEYDOWN, flags));
        assert!(should_block(WM_CHAR, flags));
        assert!(should_block(WM_INPUT, flags));
        assert!(!should_block(WM_MOUSEWHEEL, flags));
        assert!(!should_block(WM_PAINT, flags));
    }

    #[test]
    fn mouse_only() {
        let flags = BlockInputFlags::MOUSE;
        assert!(should_block(WM_MOUSEMOVE, flags));
        assert!(should_block(WM_MOUSELAST, flags));
        assert!(should_block(WM_INPUT, flags));
        assert!(!should_block(WM_KEYLAST, flags));
        assert!(!should_block(WM_MOUSELAST + 1, flags));
    }
}
