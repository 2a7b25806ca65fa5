// src/response.rs
use crate::buffer::Buffer;
use crate::log_warn;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;

/// Read-only private mapping of a response file.
///
/// The region is exclusively owned by one response and only ever read, so
/// it is safe to move across threads with the connection that owns it.
pub struct MmapRegion {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for MmapRegion {}

impl MmapRegion {
    pub fn map(file: &File, len: usize) -> io::Result<MmapRegion> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MmapRegion {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Builds one HTTP response: status line and headers into the egress
/// buffer, the body as an mmap'd file region served through the second
/// iovec slot.
pub struct HttpResponse {
    code: u16,
    path: String,
    src_dir: PathBuf,
    keep_alive: bool,
    mmap: Option<MmapRegion>,
}

impl HttpResponse {
    pub fn new(src_dir: &Path, path: &str, keep_alive: bool, code: u16) -> HttpResponse {
        HttpResponse {
            code,
            path: path.to_string(),
            src_dir: src_dir.to_path_buf(),
            keep_alive,
            mmap: None,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// The mmap'd body region; empty when the body lives in the buffer.
    pub fn file(&self) -> &[u8] {
        self.mmap.as_ref().map_or(&[], MmapRegion::as_slice)
    }

    pub fn unmap(&mut self) {
        self.mmap = None;
    }

    /// Resolve the request target and format the response head into `buff`.
    pub fn make_response(&mut self, buff: &mut Buffer) {
        let mut meta = None;
        if self.code == 200 {
            if self.path.contains("..") {
                self.code = 403;
            } else {
                match fs::metadata(self.full_path()) {
                    Err(_) => self.code = 404,
                    Ok(m) if m.is_dir() => self.code = 404,
                    Ok(m) if m.permissions().mode() & 0o004 == 0 => self.code = 403,
                    Ok(m) => meta = Some(m),
                }
            }
        }
        if meta.is_none() {
            meta = self.error_page();
        }

        self.add_state_line(buff);
        self.add_headers(buff);
        self.add_content(buff, meta);
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    /// Swap the target for the matching error page when one exists on disk.
    fn error_page(&mut self) -> Option<fs::Metadata> {
        let page = match self.code {
            400 => "/400.html",
            403 => "/403.html",
            404 => "/404.html",
            _ => return None,
        };
        self.path = page.to_string();
        fs::metadata(self.full_path()).ok()
    }

    fn add_state_line(&self, buff: &mut Buffer) {
        buff.append_str(&format!(
            "HTTP/1.1 {} {}\r\n",
            self.code,
            status_text(self.code)
        ));
    }

    fn add_headers(&self, buff: &mut Buffer) {
        if self.keep_alive {
            buff.append_str("Connection: keep-alive\r\n");
            buff.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buff.append_str("Connection: close\r\n");
        }
        buff.append_str(&format!("Content-type: {}\r\n", suffix_type(&self.path)));
    }

    fn add_content(&mut self, buff: &mut Buffer, meta: Option<fs::Metadata>) {
        let Some(meta) = meta else {
            self.error_content(buff);
            return;
        };
        let len = meta.len() as usize;
        if len == 0 {
            buff.append_str("Content-length: 0\r\n\r\n");
            return;
        }
        let mapped = File::open(self.full_path()).and_then(|file| MmapRegion::map(&file, len));
        match mapped {
            Ok(region) => {
                buff.append_str(&format!("Content-length: {}\r\n\r\n", len));
                self.mmap = Some(region);
            }
            Err(e) => {
                log_warn!("mmap of {} failed: {}", self.path, e);
                self.error_content(buff);
            }
        }
    }

    /// In-memory fallback body for error codes with no page file on disk.
    fn error_content(&self, buff: &mut Buffer) {
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">\
             {} : {}\n<p>{}</p><hr><em>nocturne</em></body></html>",
            self.code,
            status_text(self.code),
            if self.code == 404 {
                "File NotFound!"
            } else {
                "Request denied."
            }
        );
        buff.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buff.append_str(&body);
    }
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Bad Request",
    }
}

fn suffix_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
        "html" | "htm" => "text/html",
        "xml" => "text/xml",
        "xhtml" => "application/xhtml+xml",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "mp4" => "video/mp4",
        "mpeg" | "mpg" => "video/mpeg",
        "avi" => "video/x-msvideo",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        "css" => "text/css",
        "js" => "text/javascript",
        _ => "text/plain",
    }
}
