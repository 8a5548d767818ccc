//! Firmware assembly: module resolution, archive packing and image
//! emission.
//!
//! The assembler consumes libraries read-only and produces a manifest that
//! owns its virtual entries. Everything it emits is deterministic: files
//! are sorted by path before hashing so the image checksum is independent
//! of enumeration order.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use glob_match::glob_match;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::initializer::INIT_LUA;
use crate::session::RUNTIME_LUA;
use crate::utils;

use super::library::{is_script, FileEntry, Library, ModuleDef};

/// Archive ("LFS") section of a device descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LfsConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Per-device descriptor read from `firmware.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FirmwareDef {
    pub name: String,
    pub id: String,
    #[serde(rename = "nodemcu-firmware")]
    pub nodemcu_firmware: String,
    /// Additional dependency library paths for the device.
    pub libs: Vec<String>,
    /// When present, script files are compiled into an `lfs.img` archive.
    pub lfs: Option<LfsConfig>,
}

/// The result of assembling one device: identity, the sorted file set and
/// the optional native firmware reference.
#[derive(Debug, Serialize)]
pub struct FirmwareManifest {
    pub name: String,
    pub id: String,
    #[serde(rename = "nodemcu-firmware")]
    pub nodemcu_firmware: String,
    pub files: Vec<FileEntry>,
}

/// Loader stub compiled into every archive so the device can map it at
/// boot.
const LFS_INIT_LUA: &str = r#"local index = node.flashindex or node.LFS and node.LFS.get
if node.flashreload and file.exists("lfs.img") then
    local err = node.flashreload("lfs.img")
    if err then
        print("LFS reload failed: " .. err)
    end
end
if index then
    local init = index("__lfsinit")
    if init then
        init()
    end
end
"#;

/// Translate a dotted module name to its relative script path.
pub fn module_to_file(module_name: &str) -> String {
    format!("{}.lua", module_name.replace('.', "/"))
}

/// Find a module's script in the first library that carries it.
///
/// A library whose name (or directory name) matches the leading segment of
/// the module path also matches with that segment stripped, so the module
/// `libA.x` resolves to `x.lua` inside the library `libA`.
fn find_in_libraries<'a>(file_name: &str, libs: &'a [Rc<Library>]) -> Option<&'a FileEntry> {
    for lib in libs {
        if let Some(entry) = lib.files.get(file_name) {
            return Some(entry);
        }
        for prefix in [
            lib.name.as_str(),
            lib.base_path
                .file_name()
                .map(|n| n.to_str().unwrap_or_default())
                .unwrap_or_default(),
        ] {
            if prefix.is_empty() {
                continue;
            }
            if let Some(stripped) = file_name.strip_prefix(&format!("{}/", prefix)) {
                if let Some(entry) = lib.files.get(stripped) {
                    return Some(entry);
                }
            }
        }
    }
    None
}

/// Add a module's script and, transitively, every script it requires.
fn add_files_from_module(
    module_name: &str,
    libs: &[Rc<Library>],
    file_map: &mut BTreeMap<String, FileEntry>,
) -> Result<()> {
    let file_name = module_to_file(module_name);
    let entry = match find_in_libraries(&file_name, libs) {
        Some(entry) => entry.clone(),
        None => return Err(Error::NotFound(format!("module {}", module_name))),
    };
    if file_map.contains_key(&entry.path) {
        return Ok(());
    }
    let dependencies = entry.dependencies.clone();
    file_map.insert(entry.path.clone(), entry);
    for dep in &dependencies {
        add_files_from_module(dep, libs, file_map).map_err(|e| match e {
            Error::NotFound(what) => Error::NotFound(format!(
                "{} (required by module {})",
                what, module_name
            )),
            other => other,
        })?;
    }
    Ok(())
}

/// Compute the post-order library list rooted at the device library: every
/// library appears after all of its dependencies and at most once.
fn library_list(lib: &Rc<Library>, seen: &mut Vec<PathBuf>, out: &mut Vec<Rc<Library>>) {
    if seen.contains(&lib.base_path) {
        return;
    }
    seen.push(lib.base_path.clone());
    for dep in &lib.dependencies {
        library_list(dep, seen, out);
    }
    out.push(Rc::clone(lib));
}

/// Union module lists, keeping the first occurrence of each name, then
/// sort ascending by name.
fn dedupe_modules(modules: Vec<ModuleDef>) -> Vec<ModuleDef> {
    let mut seen = Vec::new();
    let mut out: Vec<ModuleDef> = Vec::new();
    for module in modules {
        if !seen.contains(&module.name) {
            seen.push(module.name.clone());
            out.push(module);
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// Assemble the firmware manifest for one device.
pub fn build_manifest(device_root: &Rc<Library>, fw_def: &FirmwareDef) -> Result<FirmwareManifest> {
    let mut used_libs = Vec::new();
    library_list(device_root, &mut Vec::new(), &mut used_libs);

    let mut modules = device_root.modules.clone();
    for lib in &used_libs {
        modules.extend(lib.modules.iter().cloned());
    }
    let mut modules = dedupe_modules(modules);

    let mut file_map: BTreeMap<String, FileEntry> = BTreeMap::new();
    for module in &modules {
        add_files_from_module(&module.name, &used_libs, &mut file_map).map_err(|e| match e {
            Error::NotFound(what) => Error::NotFound(format!(
                "cannot add files from module {}: {}. Are you including the library where {} is defined?",
                module.name, what, module.name
            )),
            other => other,
        })?;
    }

    // The synthetic main module is part of the emitted list but resolves at
    // runtime from the bootstrap, not from a library script.
    modules.push(ModuleDef::main());

    // Non-script files from every library; later libraries win on path
    // collisions.
    for lib in &used_libs {
        for (path, entry) in &lib.files {
            if !is_script(path) {
                file_map.insert(path.clone(), entry.clone());
            }
        }
    }

    // Device-specific assets override whatever the libraries provided.
    for entry in device_root.files.values() {
        file_map.insert(entry.path.clone(), entry.clone());
    }

    let modbytes = serde_json::to_vec_pretty(&modules)
        .map_err(|e| Error::parse("encoding modules.json", e))?;
    file_map.insert(
        "modules.json".into(),
        FileEntry::virtual_entry(modbytes, "modules.json"),
    );
    file_map.insert(
        "init.lua".into(),
        FileEntry::virtual_entry(INIT_LUA.as_bytes().to_vec(), "init.lua"),
    );

    let mut manifest = FirmwareManifest {
        name: fw_def.name.clone(),
        id: fw_def.id.clone(),
        nodemcu_firmware: fw_def.nodemcu_firmware.clone(),
        files: file_map.into_values().collect(),
    };

    if let Some(lfs) = &fw_def.lfs {
        pack_archive(&mut manifest, lfs)?;
    }

    manifest.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(manifest)
}

/// Split the manifest files into the archived script set and the loose
/// remainder, per the archive include/exclude globs. `init.lua` is always
/// excluded from the archive.
pub fn partition_archive(
    files: Vec<FileEntry>,
    lfs: &LfsConfig,
) -> (Vec<FileEntry>, Vec<FileEntry>) {
    let include = if lfs.include.is_empty() {
        vec!["**/*".to_string(), "*".to_string()]
    } else {
        lfs.include.clone()
    };
    let mut exclude = lfs.exclude.clone();
    exclude.push("init.lua".into());

    let mut archived = Vec::new();
    let mut loose = Vec::new();
    for file in files {
        let selected = include.iter().any(|g| glob_match(g, &file.path))
            && !exclude.iter().any(|g| glob_match(g, &file.path))
            && is_script(&file.path);
        if selected {
            archived.push(file);
        } else {
            loose.push(file);
        }
    }
    (archived, loose)
}

/// Concatenated-entry-hash digest identifying an archive's input set.
pub fn archive_hash(archived: &[FileEntry]) -> String {
    let mut hasher = Sha1::new();
    for file in archived {
        hasher.update(file.hash.as_bytes());
    }
    utils::hex_digest(hasher)
}

/// Compile the archived scripts into a single `lfs.img` virtual entry via
/// the external cross-compiler. A manifest with no archived scripts is
/// left untouched and the compiler is never invoked.
fn pack_archive(manifest: &mut FirmwareManifest, lfs: &LfsConfig) -> Result<()> {
    // Sorted order keeps the archive hash independent of enumeration.
    manifest.files.sort_by(|a, b| a.path.cmp(&b.path));
    let files = std::mem::take(&mut manifest.files);
    let (archived, loose) = partition_archive(files, lfs);
    manifest.files = loose;
    if archived.is_empty() {
        return Ok(());
    }

    let hash = archive_hash(&archived);
    let staging = tempfile::tempdir()
        .map_err(|e| Error::io("creating archive staging directory", e))?;

    let mut sources = Vec::new();
    for file in &archived {
        let staged = staging.path().join(file.path.replace(['/', '\\'], ","));
        fs::write(&staged, file.read_content()?)
            .map_err(|e| Error::io(format!("staging {}", file.path), e))?;
        sources.push(staged);
    }
    for (name, content) in [("__lfsinit.lua", LFS_INIT_LUA), ("__espore.lua", RUNTIME_LUA)] {
        let staged = staging.path().join(name);
        fs::write(&staged, content)
            .map_err(|e| Error::io(format!("staging {}", name), e))?;
        sources.push(staged);
    }

    let archive_file = staging.path().join(format!("{}.lfs", hash));
    compile_archive(&sources, &archive_file)?;
    let data = fs::read(&archive_file)
        .map_err(|e| Error::io(format!("reading {}", archive_file.display()), e))?;
    manifest.files.push(FileEntry::virtual_entry(data, "lfs.img"));
    Ok(())
}

/// Invoke `luac.cross -o <archive> -f <files...>`.
fn compile_archive(sources: &[PathBuf], dst: &Path) -> Result<()> {
    let output = Command::new("luac.cross")
        .arg("-o")
        .arg(dst)
        .arg("-f")
        .args(sources)
        .output()
        .map_err(|e| Error::io("running luac.cross", e))?;
    if !output.status.success() {
        return Err(Error::io(
            "compiling script archive",
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "luac.cross exited with {}:\n{}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ),
        ));
    }
    Ok(())
}

/// Write the image, its manifest hash sibling and the optional native
/// firmware copy under `output_dir`.
pub fn write_firmware_image(manifest: &mut FirmwareManifest, output_dir: &Path) -> Result<()> {
    // Sort the files alphabetically to avoid variations in order that
    // would affect the checksum.
    manifest.files.sort_by(|a, b| a.path.cmp(&b.path));

    // Initialized non-empty semantics: datafiles.json always encodes an
    // array, never null.
    let datafiles: Vec<String> = manifest
        .files
        .iter()
        .flat_map(|f| f.datafiles.iter().cloned())
        .collect();

    let mut image: Vec<u8> = Vec::new();
    image.extend_from_slice(b"Version: 1 -- ESPore Device Image File\n");
    image.extend_from_slice(format!("Device Id: {}\n", manifest.id).as_bytes());
    image.extend_from_slice(format!("Device Name: {}\n", manifest.name).as_bytes());
    image.extend_from_slice(format!("Total files: {}\n", manifest.files.len() + 1).as_bytes());
    image.push(b'\n');

    for file in &manifest.files {
        let content = file.read_content()?;
        write_file_record(&mut image, &file.path, &content);
    }
    let datafiles_json = serde_json::to_vec(&datafiles)
        .map_err(|e| Error::parse("encoding datafiles.json", e))?;
    write_file_record(&mut image, "datafiles.json", &datafiles_json);

    let image_name = output_dir.join(format!("{}.img", manifest.id));
    fs::write(&image_name, &image)
        .map_err(|e| Error::io(format!("writing {}", image_name.display()), e))?;
    let hash = utils::hash_bytes(&image);
    let hash_name = output_dir.join(format!("{}.img.hash", manifest.id));
    fs::write(&hash_name, &hash)
        .map_err(|e| Error::io(format!("writing {}", hash_name.display()), e))?;

    if !manifest.nodemcu_firmware.is_empty() {
        let bin_name = output_dir.join(format!("{}.bin", manifest.id));
        let bin_hash = utils::copy_file(Path::new(&manifest.nodemcu_firmware), &bin_name, true)?
            .unwrap_or_default();
        fs::write(bin_name.with_extension("bin.hash"), bin_hash)
            .map_err(|e| Error::io("writing native firmware hash", e))?;
    }

    Ok(())
}

fn write_file_record(image: &mut Vec<u8>, path: &str, content: &[u8]) {
    image.extend_from_slice(path.as_bytes());
    image.push(b'\n');
    image.extend_from_slice(format!("{}\n", content.len()).as_bytes());
    image.extend_from_slice(content);
}
