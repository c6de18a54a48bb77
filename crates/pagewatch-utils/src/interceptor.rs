//! Batched function interception.
//!
//! A [`HookBatch`] redirects a set of kernel functions to one replacement
//! as a unit. Either every function in the batch is redirected, or none is:
//! when one installation is refused, the functions already redirected by
//! the batch are restored before the error is returned.

use std::marker::PhantomData;

use pagewatch_core::{Architecture, FunctionInterceptor, KernelError, SharedHooks, Va};

/// A set of kernel functions redirected together.
pub struct HookBatch<Arch>
where
    Arch: Architecture,
{
    installed: Vec<(&'static str, Va)>,
    _marker: PhantomData<fn() -> Arch>,
}

impl<Arch> HookBatch<Arch>
where
    Arch: Architecture,
{
    /// Redirects every named function to `replacement`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::HookInstall`] naming the first function that
    /// could not be redirected. Functions installed earlier in the batch
    /// have been removed again by then.
    pub fn install<Interceptor>(
        interceptor: &Interceptor,
        names: &[&'static str],
        replacement: SharedHooks<Arch>,
    ) -> Result<Self, KernelError>
    where
        Interceptor: FunctionInterceptor<Arch> + ?Sized,
    {
        let mut batch = Self {
            installed: Vec::with_capacity(names.len()),
            _marker: PhantomData,
        };

        for &name in names {
            match interceptor.install(name, replacement.clone()) {
                Ok(original) => {
                    tracing::debug!(name, %original, "hook installed");
                    batch.installed.push((name, original));
                }
                Err(err) => {
                    tracing::error!(name, %err, "failed to install hook");

                    if let Err(err) = batch.remove_all(interceptor) {
                        tracing::warn!(%err, "failed to roll back hooks");
                    }

                    return Err(KernelError::HookInstall(name));
                }
            }
        }

        Ok(batch)
    }

    /// Returns the address of the original implementation of a redirected
    /// function.
    pub fn original(&self, name: &str) -> Option<Va> {
        self.installed
            .iter()
            .find(|(installed, _)| *installed == name)
            .map(|(_, original)| *original)
    }

    /// Returns the names of the redirected functions in installation order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.installed.iter().map(|(name, _)| *name)
    }

    /// Removes every redirection, most recent first.
    ///
    /// All removals are attempted. The first error is returned.
    pub fn remove_all<Interceptor>(mut self, interceptor: &Interceptor) -> Result<(), KernelError>
    where
        Interceptor: FunctionInterceptor<Arch> + ?Sized,
    {
        let mut result = Ok(());

        while let Some((name, _)) = self.installed.pop() {
            match interceptor.remove(name) {
                Ok(()) => tracing::debug!(name, "hook removed"),
                Err(err) => {
                    tracing::warn!(name, %err, "failed to remove hook");
                    result = result.and(Err(err));
                }
            }
        }

        result
    }
}

impl<Arch> std::fmt::Debug for HookBatch<Arch>
where
    Arch: Architecture,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HookBatch")
            .field("installed", &self.installed)
            .finish()
    }
}
