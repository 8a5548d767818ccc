//! Firmware composition.
//!
//! The builder turns a dependency graph of script libraries and data files
//! into a deterministic, content-addressed device image per device: load
//! every library named by the build configuration, then for each device
//! directory resolve its module graph, synthesize the bootstrap entries
//! and emit the image, its manifest and their hash siblings.
//!
//! Building is a pure function over the filesystem; when invoked from the
//! TUI it runs on the command-pump worker.

mod firmware;
mod library;


use std::path::Path;
use std::rc::Rc;

use log::{error, info};

use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::utils;

pub use firmware::{
    archive_hash, build_manifest, module_to_file, partition_archive, write_firmware_image,
    FirmwareDef, FirmwareManifest, LfsConfig,
};
pub use library::{
    extract_dependencies, is_script, load_library, FileEntry, Library, LibraryCache, ModuleDef,
};

/// Run a full build: clear the output directory, load the configured
/// libraries, then assemble every configured device.
///
/// A failing device aborts only that device's assembly; the remaining
/// devices still build. The first error is reported once the run is over.
pub fn build(config: &BuildConfig) -> Result<()> {
    let output = Path::new(&config.output);
    utils::remove_dir_contents(output)?;

    let mut cache = LibraryCache::new();
    let mut config_libs: Vec<Rc<Library>> = Vec::new();
    for pattern in &config.libs {
        for path in utils::expand_path_glob(pattern) {
            if !path.is_dir() {
                continue;
            }
            let key = path.to_string_lossy().into_owned();
            config_libs.push(load_library(&key, &mut cache, 0)?);
        }
    }

    let mut first_error: Option<Error> = None;
    for pattern in &config.devices {
        for device_path in utils::expand_path_glob(pattern) {
            if !device_path.is_dir() {
                continue;
            }
            match build_device(&device_path, &config_libs, &mut cache, output) {
                Ok(id) => info!("built firmware {} from {}", id, device_path.display()),
                Err(e) => {
                    error!("building {}: {}", device_path.display(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Assemble one device directory into `<id>.json`, `<id>.img` and
/// `<id>.img.hash` under `output`. Returns the device id.
pub fn build_device(
    device_path: &Path,
    config_libs: &[Rc<Library>],
    cache: &mut LibraryCache,
    output: &Path,
) -> Result<String> {
    let key = device_path.to_string_lossy().into_owned();
    let device_lib = load_library(&key, cache, 0)?;

    let fw_path = device_path.join("firmware.json");
    let fw_def: FirmwareDef = utils::read_json(&fw_path)?;
    if fw_def.id.is_empty() {
        return Err(Error::parse(
            fw_path.display().to_string(),
            "device descriptor has no id",
        ));
    }

    // The device root sees its own declared dependencies plus the
    // descriptor's extra libs plus every library from the build
    // configuration; the library list dedupes by path.
    let mut device_root = Library::clone(&device_lib);
    for lib_path in &fw_def.libs {
        device_root
            .dependencies
            .push(load_library(lib_path, cache, 0)?);
    }
    for lib in config_libs {
        device_root.dependencies.push(Rc::clone(lib));
    }
    let device_root = Rc::new(device_root);

    let mut manifest = build_manifest(&device_root, &fw_def)?;
    utils::write_json(&output.join(format!("{}.json", manifest.id)), &manifest)?;
    write_firmware_image(&mut manifest, output)?;
    Ok(manifest.id)
}
