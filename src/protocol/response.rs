//! Memcached ASCII protocol response builder

use bytes::BytesMut;
use itoa::Buffer;

/// Response writer for memcached ASCII protocol
pub struct ResponseWriter {
    buf: BytesMut,
}

impl ResponseWriter {
    /// Create a new response writer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Take the buffer, leaving an empty buffer in its place
    pub fn take(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything written after `len` bytes (noreply commands)
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    fn line(&mut self, text: &[u8]) {
        self.buf.extend_from_slice(text);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write a VALUE line for get response
    /// Format: VALUE <key> <flags> <bytes>\r\n<data>\r\n
    pub fn value(&mut self, key: &[u8], flags: u32, data: &[u8]) {
        self.value_header(key, flags, data.len());
        self.buf.extend_from_slice(b"\r\n");
        self.line(data);
    }

    /// Write a VALUE line for gets response
    /// Format: VALUE <key> <flags> <bytes> <cas unique>\r\n<data>\r\n
    pub fn value_with_cas(&mut self, key: &[u8], flags: u32, data: &[u8], cas_unique: u64) {
        self.value_header(key, flags, data.len());
        self.buf.extend_from_slice(b" ");
        self.buf
            .extend_from_slice(Buffer::new().format(cas_unique).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.line(data);
    }

    fn value_header(&mut self, key: &[u8], flags: u32, len: usize) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(b"VALUE ");
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(flags).as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(len).as_bytes());
    }

    /// Write END to terminate get and stats responses
    pub fn end(&mut self) {
        self.line(b"END");
    }

    pub fn stored(&mut self) {
        self.line(b"STORED");
    }

    pub fn not_stored(&mut self) {
        self.line(b"NOT_STORED");
    }

    /// CAS conflict
    pub fn exists(&mut self) {
        self.line(b"EXISTS");
    }

    pub fn not_found(&mut self) {
        self.line(b"NOT_FOUND");
    }

    pub fn deleted(&mut self) {
        self.line(b"DELETED");
    }

    pub fn ok(&mut self) {
        self.line(b"OK");
    }

    /// Unknown command
    pub fn error(&mut self) {
        self.line(b"ERROR");
    }

    /// incr/decr result
    pub fn number(&mut self, value: u64) {
        let mut itoa_buf = Buffer::new();
        self.line(itoa_buf.format(value).as_bytes());
    }

    /// Format: STAT <name> <value>\r\n
    pub fn stat(&mut self, name: &str, value: &str) {
        self.buf.extend_from_slice(b"STAT ");
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(b" ");
        self.line(value.as_bytes());
    }

    /// Write VERSION response
    /// Format: VERSION <version_string>\r\n
    pub fn version(&mut self, version: &str) {
        self.buf.extend_from_slice(b"VERSION ");
        self.line(version.as_bytes());
    }

    pub fn client_error(&mut self, message: &str) {
        self.buf.extend_from_slice(b"CLIENT_ERROR ");
        self.line(message.as_bytes());
    }

    pub fn server_error(&mut self, message: &str) {
        self.buf.extend_from_slice(b"SERVER_ERROR ");
        self.line(message.as_bytes());
    }
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new(4096)
    }
}
