//! HTTP firmware image server.
//!
//! Serves the build output directory to devices pulling updates. Every
//! image has a `.hash` sibling written by the builder; the hash doubles as
//! the ETag so a device (or proxy) can revalidate cheaply with
//! `If-None-Match`.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::error::{Error, Result};

pub struct Config {
    pub port: u16,
    pub base: PathBuf,
}

/// Run the server until the process ends, handling one request at a time.
pub fn serve(config: &Config) -> Result<()> {
    let server = Server::http(("0.0.0.0", config.port)).map_err(|e| {
        Error::io(
            format!("binding firmware server on port {}", config.port),
            std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()),
        )
    })?;
    info!(
        "firmware server listening on port {} serving {}",
        config.port,
        config.base.display()
    );
    for request in server.incoming_requests() {
        handle(&config.base, request);
    }
    Ok(())
}

/// Resolve a request path under the base directory, stripping any `..`
/// segments so the served tree cannot be escaped.
pub fn resolve(base: &Path, url: &str) -> PathBuf {
    let cleaned = url.replace("..", "");
    base.join(cleaned.trim_start_matches('/'))
}

/// The quoted ETag of a served file, read from its `.hash` sibling.
pub fn etag_for(path: &Path) -> Result<String> {
    let hash_path = PathBuf::from(format!("{}.hash", path.display()));
    let hash = fs::read_to_string(&hash_path)
        .map_err(|e| Error::io(format!("reading {}", hash_path.display()), e))?;
    Ok(format!("\"{}\"", hash.trim()))
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("static header")
}

fn request_header<'a>(request: &'a Request, name: &'static str) -> Option<&'a str> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str())
}

fn handle(base: &Path, request: Request) {
    let remote = request
        .remote_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "?".into());
    let chip_id = request_header(&request, "X-Chip-Id").unwrap_or("?").to_string();
    let agent = request_header(&request, "User-Agent").unwrap_or("?").to_string();
    let url = request.url().to_string();

    let log_line = |code: u16, detail: &str| {
        info!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            remote, chip_id, agent, code, url, detail
        );
    };

    if *request.method() != Method::Get {
        log_line(405, "method not allowed");
        let _ = request.respond(
            Response::from_string("method not allowed\n").with_status_code(405),
        );
        return;
    }

    enum Served {
        NotModified,
        Full(Response<std::io::Cursor<Vec<u8>>>, usize),
    }

    let path = resolve(base, request.url());
    let result = (|| -> Result<Served> {
        let etag = etag_for(&path)?;
        if request_header(&request, "If-None-Match") == Some(etag.as_str()) {
            return Ok(Served::NotModified);
        }
        let data = fs::read(&path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        let size = data.len();
        let response = Response::from_data(data)
            .with_header(header("ETag", &etag))
            .with_header(header("X-ETag-Verify", "true"))
            .with_header(header("Content-Type", "application/octet-stream"))
            .with_header(header("Access-Control-Allow-Origin", "*"));
        Ok(Served::Full(response, size))
    })();

    match result {
        Ok(Served::NotModified) => {
            log_line(304, "not modified");
            let _ = request.respond(Response::from_data(Vec::new()).with_status_code(304));
        }
        Ok(Served::Full(response, size)) => {
            log_line(200, &format!("{} bytes", size));
            let _ = request.respond(response);
        }
        Err(e) => {
            log_line(500, &e.to_string());
            let _ = request.respond(
                Response::from_string(format!("Error: {}\n", e)).with_status_code(500),
            );
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    #[test]
    fn parent_segments_are_stripped() {
        let base = Path::new("/srv/dist");
        assert_eq!(
            resolve(base, "/../../etc/passwd"),
            Path::new("/srv/dist/etc/passwd")
        );
        assert_eq!(resolve(base, "/abc.img"), Path::new("/srv/dist/abc.img"));
    }

    #[test]
    fn etag_comes_quoted_from_the_hash_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("abc.img");
        fs::write(&img, b"image").unwrap();
        fs::write(dir.path().join("abc.img.hash"), "cafebabe\n").unwrap();
        assert_eq!(etag_for(&img).unwrap(), "\"cafebabe\"");
    }

    #[test]
    fn missing_hash_sibling_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("abc.img");
        fs::write(&img, b"image").unwrap();
        assert!(etag_for(&img).is_err());
    }

    fn http_get(addr: &str, path: &str, extra: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "GET {} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n{}\r\n",
            path, extra
        )
        .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        reply
    }

    #[test]
    fn serves_images_with_etag_and_revalidation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("abc.img"), b"image-bytes").unwrap();
        fs::write(dir.path().join("abc.img.hash"), "f00d").unwrap();

        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = format!("127.0.0.1:{}", server.server_addr().to_ip().unwrap().port());
        let base = dir.path().to_path_buf();
        let worker = thread::spawn(move || {
            for _ in 0..3 {
                let request = server.recv().unwrap();
                handle(&base, request);
            }
        });

        let ok = http_get(&addr, "/abc.img", "");
        assert!(ok.starts_with("HTTP/1.1 200"));
        assert!(ok.contains("ETag: \"f00d\""));
        assert!(ok.contains("X-ETag-Verify: true"));
        assert!(ok.ends_with("image-bytes"));

        let cached = http_get(&addr, "/abc.img", "If-None-Match: \"f00d\"\r\n");
        assert!(cached.starts_with("HTTP/1.1 304"));
        assert!(!cached.contains("image-bytes"));

        let missing = http_get(&addr, "/nope.img", "");
        assert!(missing.starts_with("HTTP/1.1 500"));

        worker.join().unwrap();
    }
}
