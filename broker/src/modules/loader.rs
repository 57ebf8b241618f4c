// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use broker_data::error::Errno;
use libloading::{Library, Symbol};
use tracing::debug;

use super::worker::ModuleMain;

/// Symbol a loadable module must export:
/// `fn() -> Box<dyn broker::modules::ModuleMain>`.
pub const MODULE_CREATE_SYMBOL: &[u8] = b"canopy_module_create";

type ModuleCreateFn = fn() -> Box<dyn ModuleMain>;

pub struct LoadedModule {
    pub name: String,
    pub main: Box<dyn ModuleMain>,
    /// Keeps the dso mapped for the worker's lifetime.
    pub library: Option<Library>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("library", &self.library.as_ref().map(|_| "Library"))
            .finish()
    }
}

pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<LoadedModule, Errno>;
}

/// Module name implied by a dso path: basename minus `lib` prefix and
/// extension, e.g. `/a/b/libfoo.so` names module `foo`.
pub fn module_name_from_path(path: &str) -> Option<String> {
    let stem = Path::new(path).file_stem()?.to_str()?;
    let name = stem.strip_prefix("lib").unwrap_or(stem);
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

/// Resolves a module name against a colon-separated search path.
pub fn find_module(search_path: &str, name: &str) -> Option<PathBuf> {
    for dir in search_path.split(':').filter(|d| !d.is_empty()) {
        for candidate in [format!("lib{name}.so"), format!("{name}.so")] {
            let path = Path::new(dir).join(candidate);
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}

/// Loads modules from shared objects.
#[derive(Default)]
pub struct DsoLoader;

impl ModuleLoader for DsoLoader {
    fn load(&self, path: &str) -> Result<LoadedModule, Errno> {
        let name = module_name_from_path(path).ok_or(Errno::NoEnt)?;
        let library = unsafe { Library::new(path) }.map_err(|e| {
            debug!("dlopen {}: {}", path, e);
            Errno::NoEnt
        })?;
        let main = {
            let create: Symbol<ModuleCreateFn> = unsafe {
                library.get(MODULE_CREATE_SYMBOL).map_err(|e| {
                    debug!("dlsym {}: {}", path, e);
                    Errno::Inval
                })?
            };
            create()
        };
        Ok(LoadedModule {
            name,
            main,
            library: Some(library),
        })
    }
}

type ModuleFactory = Box<dyn Fn() -> Box<dyn ModuleMain> + Send + Sync>;

/// In-process module registry: module "paths" resolve by implied name to
/// registered constructors. Used by built-in modules and tests.
#[derive(Default)]
pub struct RegistryLoader {
    factories: HashMap<String, ModuleFactory>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ModuleMain> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }
}

impl ModuleLoader for RegistryLoader {
    fn load(&self, path: &str) -> Result<LoadedModule, Errno> {
        let name = module_name_from_path(path).ok_or(Errno::NoEnt)?;
        let factory = self.factories.get(&name).ok_or(Errno::NoEnt)?;
        Ok(LoadedModule {
            name,
            main: factory(),
            library: None,
        })
    }
}
