//! Replacing an instance's module in place

use super::{apply_mounts, write_baseline, EngineInstance, InstanceState};
use crate::error::{FsError, RuntimeError};
use crate::events::EngineEvent;
use crate::module::{EngineModule, ModuleLoader};
use crate::vfs::copy_tree;
use sapi_api::ModuleId;

impl EngineInstance {
    /// Swap in `module`, optionally carrying over the subtree at
    /// `preserve_path` from the old filesystem
    ///
    /// Once the instance's locks are held nothing awaits until the new
    /// module is installed, so no other caller observes a half-swapped
    /// instance. The old module is destroyed best-effort; preserved files
    /// overwrite the new module's files and directories merge. Mounted
    /// subtrees are never copied; registered mounts are re-applied instead.
    pub async fn hot_swap(
        &self,
        mut module: Box<dyn EngineModule>,
        preserve_path: Option<&str>,
    ) -> Result<(), RuntimeError> {
        if let Some(path) = preserve_path {
            if path.contains('\0') {
                return Err(FsError::invalid_path(path, "contains a NUL byte").into());
            }
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| RuntimeError::Exited)?;
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        if let Some(error) = core.state.unavailable() {
            return Err(error);
        }
        let InstanceState::Ready { module: old, .. } =
            std::mem::replace(&mut core.state, InstanceState::Uninitialized)
        else {
            return Err(RuntimeError::NotInitialized);
        };
        let mut old = old;

        for record in core.mounts.iter_mut() {
            if let Some(unmount) = record.unmount.take() {
                unmount(old.fs_mut());
            }
        }
        if let Err(e) = old.destroy() {
            tracing::debug!(instance = %self.id, error = %e, "Ignoring teardown error of replaced module");
        }

        module.set_callbacks(self.callbacks.clone());
        let preserved = match preserve_path {
            Some(path) => copy_tree(old.fs(), module.fs_mut(), path).unwrap_or_else(|e| {
                tracing::warn!(instance = %self.id, path = %path, error = %e, "Preserve copy failed");
                0
            }),
            None => 0,
        };
        if let Err(e) = write_baseline(module.fs_mut(), &self.config) {
            tracing::warn!(instance = %self.id, error = %e, "Failed to write baseline config");
        }
        apply_mounts(self.id, module.as_mut(), &mut core.mounts);

        tracing::info!(
            instance = %self.id,
            from = %old.id(),
            to = %module.id(),
            preserved,
            "Hot-swapped engine module"
        );
        core.state = InstanceState::Ready {
            module,
            sapi_ready: false,
        };
        drop(old);
        drop(guard);

        self.events
            .dispatch(&EngineEvent::RuntimeInitialized { instance: self.id });
        Ok(())
    }

    /// Load `id` through `loader`, then [`hot_swap`](Self::hot_swap) to it
    ///
    /// Loading happens before any lock is taken; a load failure leaves the
    /// current module untouched.
    pub async fn hot_swap_from(
        &self,
        loader: &dyn ModuleLoader,
        id: &ModuleId,
        preserve_path: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let module = loader.load(id).await?;
        self.hot_swap(module, preserve_path).await
    }
}
