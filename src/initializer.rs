//! Device initialization: pick the right image and push it.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::session::Session;

/// The bootstrap script shipped as `init.lua` in every image and pushed to
/// the device during initialization. On boot it unpacks a pending
/// `update.img`, then hands control to the module loader.
pub const INIT_LUA: &str = r#"local function apply_update()
    if not file.exists("update.img") then
        return
    end
    local f = file.open("update.img", "r")
    if not f then
        return
    end
    local function readline()
        local line = f:readline()
        if line then
            return line:gsub("\n$", "")
        end
    end
    local version = readline()
    local id = readline()
    local name = readline()
    local total = tonumber(string.match(readline() or "", "(%d+)$")) or 0
    readline()
    print("updating " .. (name or "?") .. " (" .. total .. " files)")
    for _ = 1, total do
        local path = readline()
        local size = tonumber(readline())
        if not path or not size then
            break
        end
        local out = file.open(path .. ".new", "w+")
        local remaining = size
        while remaining > 0 do
            local chunk = f:read(math.min(remaining, 256))
            if not chunk then
                break
            end
            out:write(chunk)
            remaining = remaining - #chunk
        end
        out:close()
        file.remove(path)
        file.rename(path .. ".new", path)
        print("  " .. path)
    end
    f:close()
    file.remove("update.img")
    print("update applied")
    node.restart()
end

local function start_modules()
    local f = file.open("modules.json", "r")
    if not f then
        return
    end
    local text = ""
    local chunk = f:read(256)
    while chunk do
        text = text .. chunk
        chunk = f:read(256)
    end
    f:close()
    local ok, modules = pcall(sjson.decode, text)
    if not ok or not modules then
        print("cannot decode modules.json")
        return
    end
    for _, def in ipairs(modules) do
        if def.autostart then
            local loaded, err = pcall(require, def.name)
            if not loaded then
                print("module " .. def.name .. " failed: " .. tostring(err))
            end
        end
    end
    pcall(require, "main")
end

local ok, err = pcall(apply_update)
if not ok then
    print("update failed: " .. tostring(err))
end

if file.exists("lfs.img") and node.flashreload then
    -- Mapping the archive restarts the device; only do it once.
    local mapped = node.flashindex and node.flashindex("__lfsinit")
    if not mapped then
        node.flashreload("lfs.img")
    end
end

start_modules()
"#;

/// Pick the image for a device: prefer `<chipID>.img`, fall back to
/// `DEFAULT.img`.
pub fn choose_image(output_dir: &Path, chip_id: &str) -> Result<PathBuf> {
    let preferred = output_dir.join(format!("{}.img", chip_id));
    if preferred.exists() {
        return Ok(preferred);
    }
    let fallback = output_dir.join("DEFAULT.img");
    if fallback.exists() {
        return Ok(fallback);
    }
    Err(Error::NotFound(format!(
        "no image for device {} under {} (looked for {}.img and DEFAULT.img)",
        chip_id,
        output_dir.display(),
        chip_id
    )))
}

/// Push the device's image as `update.img`, push the bootstrap as
/// `init.lua`, then restart so the bootstrap applies the update.
pub fn initialize(output_dir: &Path, session: &Session) -> Result<()> {
    let chip_id = session.get_chip_id()?;
    let image = choose_image(output_dir, &chip_id)?;
    session.push_file(&image, "update.img")?;
    let mut bootstrap = INIT_LUA.as_bytes();
    session.push_stream(&mut bootstrap, INIT_LUA.len() as u64, "init.lua")?;
    session.node_restart()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn chip_specific_image_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("abc.img"), "chip").unwrap();
        fs::write(dir.path().join("DEFAULT.img"), "default").unwrap();
        let chosen = choose_image(dir.path(), "abc").unwrap();
        assert_eq!(chosen, dir.path().join("abc.img"));
    }

    #[test]
    fn default_image_is_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("DEFAULT.img"), "default").unwrap();
        let chosen = choose_image(dir.path(), "abc").unwrap();
        assert_eq!(chosen, dir.path().join("DEFAULT.img"));
    }

    #[test]
    fn missing_images_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = choose_image(dir.path(), "abc").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
