//! Units of deferred execution

use std::fmt;

/// A unit of work executed by a pool worker.
pub trait Work: Send + 'static {
    /// Run the work, consuming it.
    fn do_work(self: Box<Self>);

    /// Name used in logs and diagnostics.
    fn name(&self) -> &str {
        "work"
    }
}

/// Work backed by a closure.
pub struct FnWork<F> {
    name: String,
    f: F,
}

impl<F> FnWork<F>
where
    F: FnOnce() + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Work for FnWork<F>
where
    F: FnOnce() + Send + 'static,
{
    fn do_work(self: Box<Self>) {
        (self.f)()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnWork<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWork").field("name", &self.name).finish()
    }
}
