//! C ABI surface, per spec.md §6's SQL-function table. Mirrors the host's
//! existing opaque-handle / thread-local-last-error conventions: every
//! call takes or returns a `*mut CloudsyncHandle`, and on failure the
//! caller reads `cloudsync_last_error_code`/`cloudsync_last_error_message`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};

use rusqlite::Connection;

use crate::conn::ConnectionState;
use crate::engine::CloudsyncEngine;
use crate::error::{CloudsyncError, Result};
use crate::network::Transport;

/// Opaque handle that owns a SQLite connection plus the cloudsync
/// connection-scoped scratch state.
pub struct CloudsyncHandle {
    conn: Connection,
    state: ConnectionState,
}

thread_local! {
    static LAST_ERROR: RefCell<(i32, String)> = RefCell::new((0, String::new()));
}

fn set_last_error(code: i32, msg: &str) {
    LAST_ERROR.with(|le| *le.borrow_mut() = (code, msg.to_string()));
}

fn clear_last_error() {
    LAST_ERROR.with(|le| *le.borrow_mut() = (0, String::new()));
}

fn code_for(err: &CloudsyncError) -> i32 {
    match err {
        CloudsyncError::Sqlite(_) => 1,
        CloudsyncError::Codec(_) => 3,
        CloudsyncError::Schema(_) => 4,
        CloudsyncError::Integrity(_) => 5,
        CloudsyncError::Network { code, .. } => *code,
        CloudsyncError::State(_) => 6,
    }
}

fn ptr_to_str<'a>(ptr: *const c_char) -> std::result::Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s).map(|cs| cs.into_raw()).unwrap_or(std::ptr::null_mut())
}

/// Runs `body` with a `CloudsyncEngine` rebuilt from `handle`'s persisted
/// `ConnectionState`, then writes any mutated state back. This is how a
/// single long-lived `ConnectionState` survives across many short-lived
/// FFI calls without the engine ever owning the connection itself.
fn with_engine<T>(handle: *mut CloudsyncHandle, body: impl FnOnce(&mut CloudsyncEngine) -> Result<T>) -> Option<T> {
    let handle = unsafe { handle.as_mut() }?;
    let state = std::mem::take(&mut handle.state);
    let mut engine = CloudsyncEngine::with_state(&handle.conn, state);
    let result = body(&mut engine);
    handle.state = engine.into_state();
    match result {
        Ok(v) => {
            clear_last_error();
            Some(v)
        }
        Err(e) => {
            set_last_error(code_for(&e), &e.to_string());
            None
        }
    }
}

/// Close and free a C string returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

/// Opens a connection and its cloudsync state. `path` may be a file path or
/// `:memory:`. Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_open(path: *const c_char) -> *mut CloudsyncHandle {
    let path = match ptr_to_str(path) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid path");
            return std::ptr::null_mut();
        }
    };
    match Connection::open(path) {
        Ok(conn) => match CloudsyncEngine::open(&conn) {
            Ok(engine) => {
                let state = engine.into_state();
                clear_last_error();
                Box::into_raw(Box::new(CloudsyncHandle { conn, state }))
            }
            Err(e) => {
                set_last_error(code_for(&e), &e.to_string());
                std::ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(1, &format!("sqlite: {e}"));
            std::ptr::null_mut()
        }
    }
}

/// Closes a handle opened with `cloudsync_open`.
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_close(handle: *mut CloudsyncHandle) {
    if handle.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(handle);
    }
}

/// `cloudsync_terminate(conn)`: release connection-scoped state, keep the
/// connection itself open (the host closes it separately via
/// `cloudsync_close`).
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_terminate(handle: *mut CloudsyncHandle) {
    with_engine(handle, |engine| {
        engine.terminate();
        Ok(())
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_init(handle: *mut CloudsyncHandle, name: *const c_char) -> c_int {
    let name = match ptr_to_str(name) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid table name");
            return 3;
        }
    };
    match with_engine(handle, |engine| engine.init(name)) {
        Some(()) => 0,
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_cleanup(handle: *mut CloudsyncHandle, name: *const c_char) -> c_int {
    let name = match ptr_to_str(name) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid table name");
            return 3;
        }
    };
    match with_engine(handle, |engine| engine.cleanup(name)) {
        Some(()) => 0,
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_enable(handle: *mut CloudsyncHandle, table: *const c_char) -> c_int {
    let table = match ptr_to_str(table) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid table name");
            return 3;
        }
    };
    match with_engine(handle, |engine| engine.enable(table)) {
        Some(()) => 0,
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_disable(handle: *mut CloudsyncHandle, table: *const c_char) -> c_int {
    let table = match ptr_to_str(table) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid table name");
            return 3;
        }
    };
    match with_engine(handle, |engine| engine.disable(table)) {
        Some(()) => 0,
        None => 1,
    }
}

/// Returns 1/0, or -1 on error.
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_is_enabled(handle: *mut CloudsyncHandle, table: *const c_char) -> c_int {
    let table = match ptr_to_str(table) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid table name");
            return -1;
        }
    };
    match with_engine(handle, |engine| engine.is_enabled(table)) {
        Some(true) => 1,
        Some(false) => 0,
        None => -1,
    }
}

/// Returns a newly allocated C string (free with `cloudsync_string_free`),
/// or null on a null handle.
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_version(handle: *mut CloudsyncHandle) -> *mut c_char {
    match with_engine(handle, |engine| Ok(engine.version().to_string())) {
        Some(v) => to_cstring_ptr(&v),
        None => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_db_version(handle: *mut CloudsyncHandle, out: *mut i64) -> c_int {
    if out.is_null() {
        set_last_error(4, "out is null");
        return 3;
    }
    match with_engine(handle, |engine| engine.db_version()) {
        Some(v) => {
            unsafe { *out = v as i64 };
            0
        }
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_db_version_next(handle: *mut CloudsyncHandle, out: *mut i64) -> c_int {
    if out.is_null() {
        set_last_error(4, "out is null");
        return 3;
    }
    match with_engine(handle, |engine| engine.db_version_next()) {
        Some(v) => {
            unsafe { *out = v as i64 };
            0
        }
        None => 1,
    }
}

/// Writes the 16-byte site id into `out` (caller-owned, must be >= 16
/// bytes). Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_siteid(handle: *mut CloudsyncHandle, out: *mut u8) -> c_int {
    if out.is_null() {
        set_last_error(4, "out is null");
        return 3;
    }
    match with_engine(handle, |engine| engine.siteid()) {
        Some(id) => {
            unsafe { std::ptr::copy_nonoverlapping(id.as_bytes().as_ptr(), out, 16) };
            0
        }
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_network_init(handle: *mut CloudsyncHandle, connection_string: *const c_char) -> c_int {
    let connection_string = match ptr_to_str(connection_string) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid connection string");
            return 3;
        }
    };
    match with_engine(handle, |engine| engine.network_init(connection_string)) {
        Some(()) => 0,
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_set_apikey(handle: *mut CloudsyncHandle, key: *const c_char) -> c_int {
    let key = match ptr_to_str(key) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid apikey");
            return 3;
        }
    };
    match with_engine(handle, |engine| {
        engine.set_apikey(key);
        Ok(())
    }) {
        Some(()) => 0,
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_set_token(handle: *mut CloudsyncHandle, token: *const c_char) -> c_int {
    let token = match ptr_to_str(token) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid token");
            return 3;
        }
    };
    match with_engine(handle, |engine| {
        engine.set_token(token);
        Ok(())
    }) {
        Some(()) => 0,
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_network_reset_check_version(handle: *mut CloudsyncHandle) -> c_int {
    match with_engine(handle, |engine| engine.network_reset_check_version()) {
        Some(()) => 0,
        None => 1,
    }
}

/// Callback vtable the host passes to drive the transport half of the sync
/// orchestrator. Each function returns 0 on success, nonzero on failure;
/// `user_data` round-trips to the host's own dispatch context. Out-params
/// that hand back a string or byte buffer are copied out immediately by
/// this side; ownership of the buffer the callback allocated is not taken
/// over, so the host is responsible for freeing it however it allocated it.
#[repr(C)]
pub struct CloudsyncTransportVtable {
    pub user_data: *mut c_void,
    pub request_upload_url:
        Option<extern "C" fn(*mut c_void, *const c_char, *const c_char, *mut *mut c_char) -> c_int>,
    pub put_blob: Option<extern "C" fn(*mut c_void, *const c_char, *const u8, usize) -> c_int>,
    pub notify_upload_complete:
        Option<extern "C" fn(*mut c_void, *const c_char, *const c_char, *const c_char) -> c_int>,
    #[allow(clippy::type_complexity)]
    pub request_check_url:
        Option<extern "C" fn(*mut c_void, *const c_char, *const c_char, u64, u32, *mut *mut c_char) -> c_int>,
    pub download: Option<extern "C" fn(*mut c_void, *const c_char, *mut *mut u8, *mut usize) -> c_int>,
}

/// # Safety
/// The caller guarantees `vtable.user_data` remains valid for the duration
/// of the sync call it is passed to, and that every non-null function
/// pointer is safe to call with that pointer.
unsafe impl Send for CloudsyncTransportVtable {}

impl Transport for CloudsyncTransportVtable {
    fn request_upload_url(&self, endpoint: &str, bearer: &str) -> Result<String> {
        let Some(f) = self.request_upload_url else {
            return Err(CloudsyncError::State("request_upload_url callback not set"));
        };
        let endpoint_c = CString::new(endpoint).map_err(|_| CloudsyncError::State("endpoint has embedded NUL"))?;
        let bearer_c = CString::new(bearer).map_err(|_| CloudsyncError::State("bearer has embedded NUL"))?;
        let mut out: *mut c_char = std::ptr::null_mut();
        let rc = f(self.user_data, endpoint_c.as_ptr(), bearer_c.as_ptr(), &mut out);
        if rc != 0 {
            return Err(CloudsyncError::Network {
                message: "request_upload_url callback failed".into(),
                code: rc,
            });
        }
        take_cstring(out)
    }

    fn put_blob(&self, url: &str, body: &[u8]) -> Result<()> {
        let Some(f) = self.put_blob else {
            return Err(CloudsyncError::State("put_blob callback not set"));
        };
        let url_c = CString::new(url).map_err(|_| CloudsyncError::State("url has embedded NUL"))?;
        let rc = f(self.user_data, url_c.as_ptr(), body.as_ptr(), body.len());
        if rc != 0 {
            return Err(CloudsyncError::Network {
                message: "put_blob callback failed".into(),
                code: rc,
            });
        }
        Ok(())
    }

    fn notify_upload_complete(&self, endpoint: &str, bearer: &str, url: &str) -> Result<()> {
        let Some(f) = self.notify_upload_complete else {
            return Err(CloudsyncError::State("notify_upload_complete callback not set"));
        };
        let endpoint_c = CString::new(endpoint).map_err(|_| CloudsyncError::State("endpoint has embedded NUL"))?;
        let bearer_c = CString::new(bearer).map_err(|_| CloudsyncError::State("bearer has embedded NUL"))?;
        let url_c = CString::new(url).map_err(|_| CloudsyncError::State("url has embedded NUL"))?;
        let rc = f(self.user_data, endpoint_c.as_ptr(), bearer_c.as_ptr(), url_c.as_ptr());
        if rc != 0 {
            return Err(CloudsyncError::Network {
                message: "notify_upload_complete callback failed".into(),
                code: rc,
            });
        }
        Ok(())
    }

    fn request_check_url(&self, endpoint: &str, bearer: &str, cursor: (u64, u32)) -> Result<Option<String>> {
        let Some(f) = self.request_check_url else {
            return Err(CloudsyncError::State("request_check_url callback not set"));
        };
        let endpoint_c = CString::new(endpoint).map_err(|_| CloudsyncError::State("endpoint has embedded NUL"))?;
        let bearer_c = CString::new(bearer).map_err(|_| CloudsyncError::State("bearer has embedded NUL"))?;
        let mut out: *mut c_char = std::ptr::null_mut();
        let rc = f(self.user_data, endpoint_c.as_ptr(), bearer_c.as_ptr(), cursor.0, cursor.1, &mut out);
        if rc != 0 {
            return Err(CloudsyncError::Network {
                message: "request_check_url callback failed".into(),
                code: rc,
            });
        }
        if out.is_null() {
            return Ok(None);
        }
        take_cstring(out).map(Some)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        let Some(f) = self.download else {
            return Err(CloudsyncError::State("download callback not set"));
        };
        let url_c = CString::new(url).map_err(|_| CloudsyncError::State("url has embedded NUL"))?;
        let mut buf: *mut u8 = std::ptr::null_mut();
        let mut len: usize = 0;
        let rc = f(self.user_data, url_c.as_ptr(), &mut buf, &mut len);
        if rc != 0 {
            return Err(CloudsyncError::Network {
                message: "download callback failed".into(),
                code: rc,
            });
        }
        if buf.is_null() || len == 0 {
            return Ok(Vec::new());
        }
        let bytes = unsafe { std::slice::from_raw_parts(buf, len) }.to_vec();
        Ok(bytes)
    }
}

fn take_cstring(ptr: *mut c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(CloudsyncError::State("callback returned a null string"));
    }
    let s = unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| CloudsyncError::Codec("callback returned non-UTF-8 string".into()))?
        .to_string();
    Ok(s)
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_network_send_changes(handle: *mut CloudsyncHandle, transport: *const CloudsyncTransportVtable, out: *mut i64) -> c_int {
    let Some(transport) = (unsafe { transport.as_ref() }) else {
        set_last_error(4, "null transport vtable");
        return 3;
    };
    let transport = CloudsyncTransportVtable {
        user_data: transport.user_data,
        request_upload_url: transport.request_upload_url,
        put_blob: transport.put_blob,
        notify_upload_complete: transport.notify_upload_complete,
        request_check_url: transport.request_check_url,
        download: transport.download,
    };
    match with_engine(handle, |engine| engine.send_changes(transport)) {
        Some(n) => {
            if !out.is_null() {
                unsafe { *out = n as i64 };
            }
            0
        }
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_network_check_changes(handle: *mut CloudsyncHandle, transport: *const CloudsyncTransportVtable, out: *mut i64) -> c_int {
    let Some(transport) = (unsafe { transport.as_ref() }) else {
        set_last_error(4, "null transport vtable");
        return 3;
    };
    let transport = CloudsyncTransportVtable {
        user_data: transport.user_data,
        request_upload_url: transport.request_upload_url,
        put_blob: transport.put_blob,
        notify_upload_complete: transport.notify_upload_complete,
        request_check_url: transport.request_check_url,
        download: transport.download,
    };
    match with_engine(handle, |engine| engine.check_changes(transport)) {
        Some(n) => {
            if !out.is_null() {
                unsafe { *out = n as i64 };
            }
            0
        }
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_network_check_changes_sync(
    handle: *mut CloudsyncHandle,
    transport: *const CloudsyncTransportVtable,
    sleep_ms: u64,
    max_retries: u32,
    out: *mut i64,
) -> c_int {
    let Some(transport) = (unsafe { transport.as_ref() }) else {
        set_last_error(4, "null transport vtable");
        return 3;
    };
    let transport = CloudsyncTransportVtable {
        user_data: transport.user_data,
        request_upload_url: transport.request_upload_url,
        put_blob: transport.put_blob,
        notify_upload_complete: transport.notify_upload_complete,
        request_check_url: transport.request_check_url,
        download: transport.download,
    };
    match with_engine(handle, |engine| engine.check_changes_sync(transport, sleep_ms, max_retries)) {
        Some(n) => {
            if !out.is_null() {
                unsafe { *out = n as i64 };
            }
            0
        }
        None => 1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_network_sync(
    handle: *mut CloudsyncHandle,
    transport: *const CloudsyncTransportVtable,
    out_sent: *mut i64,
    out_applied: *mut i64,
) -> c_int {
    let Some(transport) = (unsafe { transport.as_ref() }) else {
        set_last_error(4, "null transport vtable");
        return 3;
    };
    let transport = CloudsyncTransportVtable {
        user_data: transport.user_data,
        request_upload_url: transport.request_upload_url,
        put_blob: transport.put_blob,
        notify_upload_complete: transport.notify_upload_complete,
        request_check_url: transport.request_check_url,
        download: transport.download,
    };
    match with_engine(handle, |engine| engine.network_sync(transport)) {
        Some((sent, applied)) => {
            if !out_sent.is_null() {
                unsafe { *out_sent = sent as i64 };
            }
            if !out_applied.is_null() {
                unsafe { *out_applied = applied as i64 };
            }
            0
        }
        None => 1,
    }
}

/// Return the last error code for the current thread.
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_last_error_code() -> c_int {
    LAST_ERROR.with(|le| le.borrow().0)
}

/// Return the last error message for the current thread as a newly
/// allocated C string. Caller must free with `cloudsync_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn cloudsync_last_error_message() -> *mut c_char {
    to_cstring_ptr(&LAST_ERROR.with(|le| le.borrow().1.clone()))
}
