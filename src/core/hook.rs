//! Post-handler hooks - run after a task's process exits
//!
//! The engine only sees [`CompletionHook`] and [`HookLoader`]. The default
//! loader opens a shared library by path and resolves its single entry
//! point, `STQ_PostHandler`, which takes an `STQ_FactoryPack *`.

use super::task::{Priority, Task, TaskDescriptor};
use crate::error::{Error, Result};
use std::ffi::{c_char, c_int, CString};
use std::path::Path;
use std::sync::Arc;

/// Exported symbol every post-handler plugin must provide
pub const ENTRY_POINT: &[u8] = b"STQ_PostHandler\0";

/// Something to call once a task is done
pub trait CompletionHook: Send + Sync {
    fn on_complete(&self, descriptor: &TaskDescriptor) -> Result<()>;
}

/// Turns a post-handler path into a callable hook
pub trait HookLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn CompletionHook>>;
}

/// Loads plugins as shared libraries
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLoader;

impl HookLoader for DynamicLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn CompletionHook>> {
        // SAFETY: loading runs the library's initialisers; post-handler paths
        // come from already-authorised clients.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
            Error::PostHandlerLoadFailed(format!("{}: {}", path.display(), e))
        })?;

        // SAFETY: the entry point signature is fixed by the plugin contract.
        let entry = unsafe {
            let symbol: libloading::Symbol<EntryFn> = library.get(ENTRY_POINT).map_err(|e| {
                Error::PostHandlerLoadFailed(format!(
                    "{}: missing STQ_PostHandler: {}",
                    path.display(),
                    e
                ))
            })?;
            *symbol
        };

        Ok(Arc::new(DynamicHook {
            entry,
            _library: library,
        }))
    }
}

type EntryFn = unsafe extern "C" fn(*mut FactoryPack);

struct DynamicHook {
    entry: EntryFn,
    // Keeps `entry` valid
    _library: libloading::Library,
}

impl CompletionHook for DynamicHook {
    fn on_complete(&self, descriptor: &TaskDescriptor) -> Result<()> {
        let mut owned = OwnedPack::new(descriptor)?;
        let mut pack = owned.as_ffi();
        // SAFETY: every pointer in `pack` borrows from `owned`, which outlives the call.
        unsafe { (self.entry)(&mut pack) };
        Ok(())
    }
}

#[repr(C)]
struct FactoryPack {
    dst: *mut c_char,
    work_dir: *mut c_char,
    program_name: *mut c_char,
    priority: c_int,
    argc: c_int,
    argv: *mut *mut c_char,
    save_output: u8,
    exit_code: c_int,
    post_handler: *mut c_char,
    have_to_delete: u8,
}

/// C strings backing a `FactoryPack`
struct OwnedPack {
    dst: CString,
    work_dir: CString,
    program_name: CString,
    args: Vec<CString>,
    argv: Vec<*mut c_char>,
    post_handler: CString,
    priority: c_int,
    save_output: u8,
    exit_code: c_int,
    have_to_delete: u8,
}

impl OwnedPack {
    fn new(desc: &TaskDescriptor) -> Result<Self> {
        let args = desc
            .args
            .iter()
            .map(|a| cstring(a))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dst: cstring(&desc.dst)?,
            work_dir: cstring(&desc.work_dir)?,
            program_name: cstring(&desc.program_name)?,
            args,
            argv: Vec::new(),
            post_handler: cstring(&desc.post_handler)?,
            priority: priority_code(desc.priority),
            save_output: desc.save_output as u8,
            exit_code: desc.exit_code,
            have_to_delete: desc.have_to_delete as u8,
        })
    }

    fn as_ffi(&mut self) -> FactoryPack {
        self.argv = self
            .args
            .iter()
            .map(|a| a.as_ptr() as *mut c_char)
            .collect();

        FactoryPack {
            dst: self.dst.as_ptr() as *mut c_char,
            work_dir: self.work_dir.as_ptr() as *mut c_char,
            program_name: self.program_name.as_ptr() as *mut c_char,
            priority: self.priority,
            argc: self.args.len() as c_int,
            argv: self.argv.as_mut_ptr(),
            save_output: self.save_output,
            exit_code: self.exit_code,
            post_handler: self.post_handler.as_ptr() as *mut c_char,
            have_to_delete: self.have_to_delete,
        }
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|e| Error::Internal(format!("interior NUL in {:?}: {}", s, e)))
}

/// `STQ_Priority` enum values
fn priority_code(priority: Priority) -> c_int {
    match priority {
        Priority::High => 0,
        Priority::AboveNormal => 1,
        Priority::Normal => 2,
        Priority::BelowNormal => 3,
        Priority::Low => 4,
    }
}

/// Runs the post-handler step of a finished task
#[derive(Clone)]
pub struct PostHandlerInvoker {
    loader: Arc<dyn HookLoader>,
}

impl Default for PostHandlerInvoker {
    fn default() -> Self {
        Self::new(Arc::new(DynamicLoader))
    }
}

impl PostHandlerInvoker {
    pub fn new(loader: Arc<dyn HookLoader>) -> Self {
        Self { loader }
    }

    /// Load and call the task's post-handler, then delete its output if asked.
    ///
    /// No-op when the task has no post-handler. Errors are meant to be
    /// recorded on the task; they never change its exit code. The output is
    /// only deleted after a successful call.
    pub async fn invoke(&self, task: &Task) -> Result<()> {
        if task.spec.post_handler_path.is_empty() {
            return Ok(());
        }

        let loader = self.loader.clone();
        let path = task.spec.post_handler_path.clone();
        let descriptor = task.descriptor();

        // Both loading and the plugin call are synchronous
        tokio::task::spawn_blocking(move || -> Result<()> {
            let hook = loader.load(Path::new(&path))?;
            hook.on_complete(&descriptor)
        })
        .await
        .map_err(|e| Error::Internal(format!("post-handler panicked: {}", e)))??;

        if task.spec.have_to_delete {
            if let Some(file) = task.output_file() {
                if let Err(e) = tokio::fs::remove_file(&file).await {
                    log::warn!("Failed to delete output {}: {}", file.display(), e);
                }
            }
        }

        Ok(())
    }
}
