//! Library loading and script dependency extraction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use glob_match::glob_match;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils;

/// Libraries deeper than this in the dependency chain indicate a cycle.
const MAX_DEPTH: u32 = 100;

/// A file participating in a firmware image.
///
/// Either `(base, path)` points at a real file or `content` holds the bytes
/// of a synthesized entry; `hash` always reflects the byte stream that will
/// be written to the image. Entries are read-only once created.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    /// Source directory the entry was enumerated under. Empty for
    /// synthesized entries.
    pub base: PathBuf,
    /// Relative name used on the device.
    pub path: String,
    /// SHA-1 hex of the content.
    pub hash: String,
    /// Module names parsed from script sources.
    #[serde(skip)]
    pub dependencies: Vec<String>,
    /// Extra asset names declared in script comments.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub datafiles: Vec<String>,
    /// Inline bytes for synthesized files.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

impl FileEntry {
    /// Synthesize an entry from in-memory bytes.
    pub fn virtual_entry(data: Vec<u8>, path: &str) -> FileEntry {
        FileEntry {
            base: PathBuf::new(),
            path: path.to_string(),
            hash: utils::hash_bytes(&data),
            dependencies: Vec::new(),
            datafiles: Vec::new(),
            content: Some(data),
        }
    }

    /// The bytes that will be written to the image for this entry.
    pub fn read_content(&self) -> Result<Vec<u8>> {
        match &self.content {
            Some(data) => Ok(data.clone()),
            None => {
                let path = self.base.join(&self.path);
                fs::read(&path).map_err(|e| Error::io(format!("reading {}", path.display()), e))
            }
        }
    }
}

/// A script module declared by a library descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl ModuleDef {
    /// The synthetic module appended last to every module list.
    pub fn main() -> ModuleDef {
        ModuleDef {
            name: "main".into(),
            autostart: false,
            config: None,
        }
    }
}

/// The optional `library.json` descriptor.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LibraryDef {
    name: String,
    dependencies: Vec<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    modules: Vec<ModuleDef>,
}

/// A named collection of files plus declared modules and dependency
/// libraries. Libraries own their file entries; the loader owns all
/// libraries for the build's lifetime.
#[derive(Debug, Clone)]
pub struct Library {
    pub name: String,
    pub base_path: PathBuf,
    pub files: BTreeMap<String, FileEntry>,
    pub modules: Vec<ModuleDef>,
    pub dependencies: Vec<Rc<Library>>,
}

/// Path-keyed cache preventing a library from being loaded twice in one
/// build run.
pub type LibraryCache = HashMap<String, Rc<Library>>;

/// Load the library at `path`, reusing the cached record when it was
/// already loaded. `level` tracks recursion depth: past [`MAX_DEPTH`] the
/// dependency graph is considered cyclic.
pub fn load_library(path: &str, cache: &mut LibraryCache, level: u32) -> Result<Rc<Library>> {
    if let Some(lib) = cache.get(path) {
        return Ok(Rc::clone(lib));
    }
    if level > MAX_DEPTH {
        return Err(Error::CircularDependency(path.to_string()));
    }

    let base = Path::new(path);
    if !base.is_dir() {
        return Err(Error::NotFound(format!("library directory {}", path)));
    }
    let list = utils::enumerate_dir(base)?;

    let def_path = base.join("library.json");
    let mut def: LibraryDef = if def_path.exists() {
        utils::read_json(&def_path)?
    } else {
        LibraryDef::default()
    };
    if def.include.is_empty() {
        def.include = vec!["*".into()];
    }
    if def.name.is_empty() {
        def.name = path.to_string();
    }

    let mut files = BTreeMap::new();
    for rel in list {
        // Descriptors configure the build; they never ship in an image.
        if rel == "library.json" || rel == "firmware.json" {
            continue;
        }
        let add = if is_script(&rel) {
            true
        } else {
            def.include.iter().any(|g| glob_match(g, &rel))
                && !def.exclude.iter().any(|g| glob_match(g, &rel))
        };
        if !add {
            continue;
        }
        let full = base.join(&rel);
        let mut entry = FileEntry {
            base: base.to_path_buf(),
            path: rel.clone(),
            hash: utils::hash_file(&full)?,
            dependencies: Vec::new(),
            datafiles: Vec::new(),
            content: None,
        };
        if is_script(&rel) {
            let source = fs::read_to_string(&full)
                .map_err(|e| Error::io(format!("reading {}", full.display()), e))?;
            let (deps, datafiles) = extract_dependencies(&source);
            entry.dependencies = deps;
            entry.datafiles = datafiles;
        }
        files.insert(rel, entry);
    }

    let mut dependencies = Vec::new();
    for dep in &def.dependencies {
        let lib = load_library(dep, cache, level + 1)?;
        dependencies.push(lib);
    }

    let lib = Rc::new(Library {
        name: def.name,
        base_path: base.to_path_buf(),
        files,
        modules: def.modules,
        dependencies,
    });
    cache.insert(path.to_string(), Rc::clone(&lib));
    Ok(lib)
}

/// Script files are always included in a library and scanned for
/// dependencies and datafile markers.
pub fn is_script(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|ext| ext == "lua")
        .unwrap_or(false)
}

static DEP_PCALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"pcall\s*\(\s*require\s*,\s*"([^"]*)"\s*\)"#).expect("static regex"));
static DEP_REQUIRE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)(?:^require|\s+require|pkg\.require)\s*\(\s*"([^"]*)"\s*(,.*)?\)"#)
        .expect("static regex")
});
static DATAFILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^--\s*datafile:\s*(.*)$").expect("static regex"));

/// Extract the module dependencies and datafile declarations of a script
/// source. Both lists are deduplicated and sorted so downstream output is
/// deterministic.
pub fn extract_dependencies(source: &str) -> (Vec<String>, Vec<String>) {
    let mut deps = BTreeSet::new();
    for regex in [&*DEP_PCALL, &*DEP_REQUIRE] {
        for caps in regex.captures_iter(source) {
            deps.insert(caps[1].to_string());
        }
    }
    let datafiles: BTreeSet<String> = DATAFILE
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .collect();
    (
        deps.into_iter().collect(),
        datafiles.into_iter().collect(),
    )
}
