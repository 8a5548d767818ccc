//! The on-device helper runtime, embedded as a literal blob.
//!
//! The helper installs itself under the global name `__espore` and provides
//! the wire-protocol primitives the session drives: flow-controlled upload,
//! rename with `RENAME_OK|RENAME_FAIL` confirmation, JSON-printing remote
//! calls, package unloading and file listing. It suppresses the local UART
//! echo while active and restores it on teardown. Shipping builds must keep
//! this blob byte-identical for on-device compatibility.

/// Lua source of the `__espore` helper module.
pub const RUNTIME_LUA: &str = r#"local L = {}

L.echo = function(value)
    local b, d, p, s = uart.getconfig(0)
    uart.setup(0, b, d, p, s, value)
end

L.start = function()
    L.echo(0)
    print("\nREADY")
end

L.finish = function()
    print("\nBYE")
    L.echo(1)
    __espore = nil
end

L.rename = function(oldname, newname)
    if file.exists(oldname) then
        file.remove(newname)
        file.rename(oldname, newname)
        print("RENAME_OK")
    else
        print("RENAME_FAIL")
    end
end

L.removeFile = function(name)
    file.remove(name)
end

L.renameFile = function(oldname, newname)
    file.remove(newname)
    return file.rename(oldname, newname)
end

L.call = function(fn)
    local ok, ret = pcall(fn)
    local reply
    if ok then
        reply = {ret = ret, err = ""}
    else
        reply = {err = tostring(ret)}
    end
    print(sjson.encode(reply))
end

L.unload = function(packageName)
    package.loaded[packageName] = nil
    _G[packageName] = nil
end

L.unloadAll = function()
    local packages = {}
    for packageName, _ in pairs(package.loaded) do
        packages[#packages + 1] = packageName
    end
    for _, packageName in ipairs(packages) do
        L.unload(packageName)
    end
end

L.ls = function()
    local list = file.list()
    local keys = {}
    for k in pairs(list) do
        keys[#keys + 1] = k
    end
    table.sort(keys)
    for _, key in ipairs(keys) do
        print(key .. "\t" .. list[key])
    end
end

L.cat = function(name)
    local f = file.open(name, "r")
    if not f then
        print("cannot open " .. name)
        return
    end
    local line = f:readline()
    while line do
        uart.write(0, line)
        line = f:readline()
    end
    f:close()
end

L.upload = function(fname, size)
    local remaining = size
    local f = file.open(fname, "w+")
    local h = crypto.new_hash("sha1")
    local nextChunk
    local rprint = print
    local printbuf = {}
    local timer = tmr.create()
    timer:register(
        500,
        tmr.ALARM_AUTO,
        function()
            rprint(remaining)
        end
    )
    print = function(txt)
        if #printbuf < 50 then
            table.insert(printbuf, txt)
        end
    end

    local function writer(data)
        f:write(data)
        h:update(data)
        remaining = remaining - #data
        nextChunk()
    end

    nextChunk = function()
        timer:stop()
        timer:start()
        rprint(remaining)
        if remaining <= 0 then
            f:close()
            local hash = encoder.toHex(h:finalize())
            rprint(hash)
            uart.on("data")
            print = rprint
            timer:stop()
            timer:unregister()
            for _, txt in ipairs(printbuf) do
                print(txt)
            end
            return
        end

        local chunkSize = remaining
        if chunkSize > 128 then
            chunkSize = 128
        end
        uart.on("data", chunkSize, writer, 0)
    end

    rprint("\nBEGIN")
    nextChunk()
end

__espore = L
L.start()
return L
"#;

/// Quote a line of text as a Lua double-quoted string literal.
pub(crate) fn lua_quote(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + 2);
    out.push('"');
    for ch in line.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_lua_specials() {
        assert_eq!(lua_quote(r#"print("hi\")"#), r#""print(\"hi\\\")""#);
        assert_eq!(lua_quote("plain"), "\"plain\"");
    }

    #[test]
    fn runtime_blob_activates_and_returns_the_module() {
        assert!(RUNTIME_LUA.contains("__espore = L"));
        assert!(RUNTIME_LUA.trim_end().ends_with("return L"));
        assert!(RUNTIME_LUA.contains("print(\"\\nREADY\")"));
    }
}
