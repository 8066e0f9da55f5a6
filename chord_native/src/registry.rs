//! Loads native library plugins and owns their descriptors.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use chord_primitives::Guid;
use log::{error, warn};

use crate::api::{
    LIST_NATIVE_LIBRARIES_SYMBOL, ListNativeLibrariesFn, NativeLibrary, NativeModule,
    NativeModuleParameter, null_terminated_string_length,
};

struct NativeLibraryEntry {
    library: NativeLibrary,
    context: *mut c_void,
}

/// Owns loaded plugin binaries and registry-local copies of every descriptor
/// they announced.
///
/// Libraries are announced through the `ListNativeLibraries` entry point and
/// deep-copied during the callback; plugin-owned descriptor memory is never
/// referenced after the callback returns. After all libraries load, each
/// library's `initialize` hook runs once and its returned context is kept for
/// lookups. On drop, `deinitialize` hooks run in reverse load order before
/// the binaries unload.
pub struct NativeLibraryRegistry {
    entries: Vec<NativeLibraryEntry>,
    loaded_binaries: Vec<libloading::Library>,
    // Backing storage for the deep-copied descriptors. Boxed so addresses
    // stay stable while the vectors grow.
    string_allocations: Vec<Box<[u32]>>,
    module_allocations: Vec<Box<NativeModule>>,
    parameter_list_allocations: Vec<Box<[NativeModuleParameter]>>,
    module_list_allocations: Vec<Box<[*const NativeModule]>>,
}

// SAFETY: the registry's raw pointers reference its own stable allocations
// and plugin code. Library and voice contexts are handed to callers under
// the engine's serialization rules (one thread at a time per context).
unsafe impl Send for NativeLibraryRegistry {}
unsafe impl Sync for NativeLibraryRegistry {}

/// Renders a null-terminated UTF-32 name for log output.
unsafe fn display_name(name: *const u32) -> String {
    if name.is_null() {
        return "<unnamed>".to_string();
    }
    let length = unsafe { null_terminated_string_length(name) };
    let code_points = unsafe { std::slice::from_raw_parts(name, length) };
    code_points
        .iter()
        .map(|&c| char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

unsafe extern "C" fn list_native_libraries_callback(
    context: *mut c_void,
    native_library: *const NativeLibrary,
) {
    if native_library.is_null() {
        return;
    }
    // SAFETY: context is the registry that initiated the enumeration call.
    let registry = unsafe { &mut *context.cast::<NativeLibraryRegistry>() };
    registry.register_library(unsafe { &*native_library });
}

impl NativeLibraryRegistry {
    /// Scans `native_library_path` for plugin binaries, loads each and
    /// registers the libraries they announce. Load failures are reported and
    /// skipped; an unreadable directory yields an empty registry.
    pub fn from_directory(native_library_path: &Path) -> Self {
        let mut registry = Self::empty();

        let mut plugin_paths: Vec<PathBuf> = Vec::new();
        match std::fs::read_dir(native_library_path) {
            Ok(dir_entries) => {
                for dir_entry in dir_entries.flatten() {
                    let path = dir_entry.path();
                    if path
                        .extension()
                        .is_some_and(|extension| extension == std::env::consts::DLL_EXTENSION)
                    {
                        plugin_paths.push(path);
                    }
                }
            }
            Err(load_error) => {
                error!(
                    "failed to scan for native libraries in '{}': {load_error}",
                    native_library_path.display()
                );
                return registry;
            }
        }
        plugin_paths.sort();

        for plugin_path in plugin_paths {
            // SAFETY: loading a plugin runs its initialization code; plugins
            // are trusted native code by contract.
            let binary = match unsafe { libloading::Library::new(&plugin_path) } {
                Ok(binary) => binary,
                Err(load_error) => {
                    error!(
                        "failed to load native library '{}': {load_error}",
                        plugin_path.display()
                    );
                    continue;
                }
            };

            let list_native_libraries: ListNativeLibrariesFn = match unsafe {
                binary.get::<ListNativeLibrariesFn>(LIST_NATIVE_LIBRARIES_SYMBOL)
            } {
                Ok(symbol) => *symbol,
                Err(_) => {
                    error!(
                        "native library '{}' does not export symbol 'ListNativeLibraries' and was not loaded",
                        plugin_path.display()
                    );
                    continue;
                }
            };

            // Keep the binary mapped before running its code; entries point
            // into it for the rest of the registry's lifetime.
            registry.loaded_binaries.push(binary);

            // SAFETY: the entry point has the documented ABI and the callback
            // context is the registry itself.
            unsafe {
                list_native_libraries(
                    std::ptr::from_mut(&mut registry).cast(),
                    list_native_libraries_callback,
                );
            }
        }

        registry.initialize_libraries();
        registry
    }

    /// Builds a registry from in-process library descriptors, the same way
    /// the plugin callback would. Used by hosts that embed native libraries
    /// directly instead of loading them from disk.
    pub fn with_libraries<'a>(descriptors: impl IntoIterator<Item = &'a NativeLibrary>) -> Self {
        let mut registry = Self::empty();
        for descriptor in descriptors {
            registry.register_library(descriptor);
        }
        registry.initialize_libraries();
        registry
    }

    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            loaded_binaries: Vec::new(),
            string_allocations: Vec::new(),
            module_allocations: Vec::new(),
            parameter_list_allocations: Vec::new(),
            module_list_allocations: Vec::new(),
        }
    }

    /// Looks up a library and its context by id. N is small so this is a
    /// linear scan.
    pub fn try_get(&self, id: Guid) -> Option<(&NativeLibrary, *mut c_void)> {
        self.entries
            .iter()
            .find(|entry| Guid::from_bytes(entry.library.id) == id)
            .map(|entry| (&entry.library, entry.context))
    }

    pub fn library_count(&self) -> usize {
        self.entries.len()
    }

    fn copy_string(&mut self, string: *const u32) -> *const u32 {
        const UNNAMED: &[u32] = &[b'<' as u32, b'?' as u32, b'>' as u32, 0];
        let copy: Box<[u32]> = if string.is_null() {
            UNNAMED.into()
        } else {
            // SAFETY: descriptor names are null-terminated by contract.
            let length = unsafe { null_terminated_string_length(string) };
            let mut owned = Vec::with_capacity(length + 1);
            owned.extend_from_slice(unsafe { std::slice::from_raw_parts(string, length) });
            owned.push(0);
            owned.into_boxed_slice()
        };
        let pointer = copy.as_ptr();
        self.string_allocations.push(copy);
        pointer
    }

    fn register_library(&mut self, descriptor: &NativeLibrary) {
        let mut library = *descriptor;

        let library_id = Guid::from_bytes(library.id);
        if self
            .entries
            .iter()
            .any(|entry| Guid::from_bytes(entry.library.id) == library_id)
        {
            warn!(
                "native library '{}' was not loaded because its id conflicts with a previously-loaded native library",
                unsafe { display_name(descriptor.name) }
            );
            return;
        }

        library.name = self.copy_string(library.name);

        // Optimization rules are compile-time only
        library.optimization_rules = std::ptr::null();
        library.optimization_rule_count = 0;

        let descriptor_modules = if library.native_modules.is_null() {
            &[]
        } else {
            // SAFETY: the descriptor declares this many module pointers.
            unsafe {
                std::slice::from_raw_parts(library.native_modules, library.native_module_count)
            }
        };

        let mut modules: Vec<*const NativeModule> = Vec::with_capacity(descriptor_modules.len());
        for &module_pointer in descriptor_modules {
            if module_pointer.is_null() {
                continue;
            }
            // SAFETY: non-null module pointers are valid for the callback.
            let mut module = unsafe { *module_pointer };

            let module_id = Guid::from_bytes(module.id);
            if modules
                .iter()
                .any(|&existing| Guid::from_bytes(unsafe { (*existing).id }) == module_id)
            {
                warn!(
                    "native library '{}' module '{}' was not loaded because its id conflicts with a previously-loaded module",
                    unsafe { display_name(library.name) },
                    unsafe { display_name(module.signature.name) }
                );
                continue;
            }

            module.signature.name = self.copy_string(module.signature.name);

            let descriptor_parameters = if module.signature.parameters.is_null() {
                &[]
            } else {
                // SAFETY: the signature declares this many parameters.
                unsafe {
                    std::slice::from_raw_parts(
                        module.signature.parameters,
                        module.signature.parameter_count,
                    )
                }
            };
            let mut parameters: Vec<NativeModuleParameter> = descriptor_parameters.to_vec();
            for parameter in &mut parameters {
                parameter.name = self.copy_string(parameter.name);
            }
            let parameters = parameters.into_boxed_slice();
            module.signature.parameters = parameters.as_ptr();
            module.signature.parameter_count = parameters.len();
            self.parameter_list_allocations.push(parameters);

            let module = Box::new(module);
            modules.push(std::ptr::from_ref(module.as_ref()));
            self.module_allocations.push(module);
        }

        let modules = modules.into_boxed_slice();
        library.native_modules = modules.as_ptr();
        library.native_module_count = modules.len();
        self.module_list_allocations.push(modules);

        self.entries.push(NativeLibraryEntry {
            library,
            context: std::ptr::null_mut(),
        });
    }

    fn initialize_libraries(&mut self) {
        for entry in &mut self.entries {
            if let Some(initialize) = entry.library.initialize {
                // SAFETY: initialize hooks take no arguments and return an
                // opaque context.
                entry.context = unsafe { initialize() };
            }
        }
    }
}

impl Drop for NativeLibraryRegistry {
    fn drop(&mut self) {
        for entry in self.entries.iter().rev() {
            if let Some(deinitialize) = entry.library.deinitialize {
                // SAFETY: paired with the initialize call on load.
                unsafe { deinitialize(entry.context) };
            }
        }
        self.entries.clear();
        // Dropping the libloading handles unloads the plugin binaries.
        self.loaded_binaries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::NativeLibraryVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INITIALIZE_CALLS: AtomicUsize = AtomicUsize::new(0);
    static DEINITIALIZE_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn initialize() -> *mut c_void {
        INITIALIZE_CALLS.fetch_add(1, Ordering::Relaxed);
        0x1234 as *mut c_void
    }

    unsafe extern "C" fn deinitialize(context: *mut c_void) {
        assert_eq!(context as usize, 0x1234);
        DEINITIALIZE_CALLS.fetch_add(1, Ordering::Relaxed);
    }

    fn test_library(id: u8) -> NativeLibrary {
        NativeLibrary {
            id: [id; 16],
            version: NativeLibraryVersion {
                major: 1,
                minor: 0,
                patch: 0,
            },
            name: std::ptr::null(),
            initialize: Some(initialize),
            deinitialize: Some(deinitialize),
            initialize_voice: None,
            deinitialize_voice: None,
            native_modules: std::ptr::null(),
            native_module_count: 0,
            optimization_rules: std::ptr::null(),
            optimization_rule_count: 0,
        }
    }

    #[test]
    fn lookup_by_id() {
        let libraries = [test_library(1), test_library(2)];
        let registry = NativeLibraryRegistry::with_libraries(&libraries);
        assert_eq!(registry.library_count(), 2);

        let (library, context) = registry.try_get(Guid::from_bytes([2; 16])).unwrap();
        assert_eq!(library.id, [2; 16]);
        assert_eq!(context as usize, 0x1234);
        assert!(registry.try_get(Guid::from_bytes([3; 16])).is_none());
    }

    #[test]
    fn duplicate_library_is_skipped() {
        let libraries = [test_library(7), test_library(7)];
        let registry = NativeLibraryRegistry::with_libraries(&libraries);
        assert_eq!(registry.library_count(), 1);
    }

    // Dedicated hooks so parallel tests can't disturb the counts
    static PAIRED_INITIALIZE_CALLS: AtomicUsize = AtomicUsize::new(0);
    static PAIRED_DEINITIALIZE_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn paired_initialize() -> *mut c_void {
        PAIRED_INITIALIZE_CALLS.fetch_add(1, Ordering::Relaxed);
        std::ptr::null_mut()
    }

    unsafe extern "C" fn paired_deinitialize(_context: *mut c_void) {
        PAIRED_DEINITIALIZE_CALLS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn hooks_run_in_pairs() {
        let mut library = test_library(9);
        library.initialize = Some(paired_initialize);
        library.deinitialize = Some(paired_deinitialize);
        {
            let libraries = [library];
            let _registry = NativeLibraryRegistry::with_libraries(&libraries);
            assert_eq!(PAIRED_INITIALIZE_CALLS.load(Ordering::Relaxed), 1);
            assert_eq!(PAIRED_DEINITIALIZE_CALLS.load(Ordering::Relaxed), 0);
        }
        assert_eq!(PAIRED_DEINITIALIZE_CALLS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn missing_directory_yields_empty_registry() {
        let registry =
            NativeLibraryRegistry::from_directory(Path::new("/nonexistent/plugin/directory"));
        assert_eq!(registry.library_count(), 0);
    }
}
