/// Per swapchain buffer contexts of an explicit API backend.
///
/// Contexts are kept across resizes so allocators can be reused. Only their
/// buffer bound parts are dropped and rebuilt.
#[derive(Debug)]
pub(crate) struct BufferContexts<T> {
    contexts: Vec<T>,
}

impl<T> BufferContexts<T> {
    pub const fn new() -> Self {
        Self {
            contexts: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.contexts.get_mut(index)
    }

    #[inline]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.contexts.iter_mut()
    }

    /// Resize to exactly `count` contexts, creating missing ones with `create`.
    ///
    /// On failure the contexts created so far are kept.
    pub fn resize_with(
        &mut self,
        count: usize,
        mut create: impl FnMut(usize) -> anyhow::Result<T>,
    ) -> anyhow::Result<()> {
        self.contexts.truncate(count);
        self.contexts.reserve(count - self.contexts.len());
        while self.contexts.len() < count {
            let context = create(self.contexts.len())?;
            self.contexts.push(context);
        }

        Ok(())
    }

    /// Rebind every context to its buffer.
    pub fn bind_each(
        &mut self,
        mut bind: impl FnMut(usize, &mut T) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for (index, context) in self.contexts.iter_mut().enumerate() {
            bind(index, context)?;
        }

        Ok(())
    }
}
