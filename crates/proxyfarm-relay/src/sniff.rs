//! Best-effort hostname extraction from the first client chunk
//!
//! Only annotates activity events. Every parser returns `None` on anything it
//! does not fully understand and never panics on short or hostile input.

use tracing::trace;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const TLS_CLIENT_HELLO: u8 = 0x01;
const TLS_EXT_SERVER_NAME: u16 = 0x0000;
const TLS_NAME_TYPE_HOST: u8 = 0x00;

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"TRACE ",
    b"CONNECT ",
];

/// Guess the destination hostname of a relayed stream
pub fn sniff_hostname(chunk: &[u8]) -> Option<String> {
    if HTTP_METHODS.iter().any(|m| chunk.starts_with(m)) {
        http_host(chunk)
    } else if chunk.first() == Some(&TLS_HANDSHAKE_RECORD) {
        tls_sni(chunk)
    } else {
        None
    }
}

/// Host of an HTTP request head: the `CONNECT` target, else the `Host:` header.
/// Ports and IPv6 brackets are stripped.
pub fn http_host(chunk: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(chunk);
    let mut lines = head.lines();
    let request_line = lines.next()?;

    if let Some(rest) = request_line.strip_prefix("CONNECT ") {
        return normalize_host(rest.split_whitespace().next()?);
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                return normalize_host(value.trim());
            }
        }
    }

    None
}

fn normalize_host(authority: &str) -> Option<String> {
    let host = if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next()?
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
                host
            }
            _ => authority,
        }
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// `server_name` (host_name) of a TLS ClientHello
pub fn tls_sni(data: &[u8]) -> Option<String> {
    let mut record = Reader::new(data);
    if record.u8()? != TLS_HANDSHAKE_RECORD {
        return None;
    }
    record.skip(2)?; // legacy record version
    let record_len = record.u16()? as usize;
    let mut handshake = Reader::new(record.take(record_len)?);

    if handshake.u8()? != TLS_CLIENT_HELLO {
        return None;
    }
    let hello_len = handshake.u24()? as usize;
    let mut hello = Reader::new(handshake.take(hello_len)?);

    hello.skip(2)?; // client version
    hello.skip(32)?; // random
    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;
    let cipher_suites_len = hello.u16()? as usize;
    hello.skip(cipher_suites_len)?;
    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    let extensions_len = hello.u16()? as usize;
    let mut extensions = Reader::new(hello.take(extensions_len)?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext = extensions.take(ext_len)?;
        if ext_type == TLS_EXT_SERVER_NAME {
            return parse_server_name(ext);
        }
    }

    None
}

fn parse_server_name(ext: &[u8]) -> Option<String> {
    let mut ext = Reader::new(ext);
    let list_len = ext.u16()? as usize;
    let mut list = Reader::new(ext.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type != TLS_NAME_TYPE_HOST {
            continue;
        }

        let hostname = std::str::from_utf8(name).ok()?;
        if hostname.is_empty() {
            return None;
        }
        trace!("Extracted SNI hostname: {}", hostname);
        return Some(hostname.to_string());
    }

    None
}

/// Bounds-checked big-endian cursor
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        self.take(3)
            .map(|b| u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal TLS 1.2 ClientHello carrying `hostname` as SNI
    fn client_hello(hostname: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(hostname) = hostname {
            let name = hostname.as_bytes();
            let mut list = vec![TLS_NAME_TYPE_HOST];
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name);

            let mut ext = (list.len() as u16).to_be_bytes().to_vec();
            ext.extend_from_slice(&list);

            extensions.extend_from_slice(&TLS_EXT_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }
        // supported_groups, to make sure unrelated extensions are skipped
        extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x17]);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0xAB; 32]);
        body.push(0x00); // session id
        body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x00, 0x2f]);
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![TLS_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE_RECORD, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_connect_target() {
        let chunk = b"CONNECT api.example.com:443 HTTP/1.1\r\nHost: api.example.com:443\r\n\r\n";
        assert_eq!(sniff_hostname(chunk).as_deref(), Some("api.example.com"));
    }

    #[test]
    fn test_host_header() {
        let chunk = b"GET /ip HTTP/1.1\r\nUser-Agent: curl/8.0\r\nhost: example.com:8080\r\n\r\n";
        assert_eq!(sniff_hostname(chunk).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_ipv6_host() {
        let chunk = b"GET / HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n";
        assert_eq!(sniff_hostname(chunk).as_deref(), Some("::1"));
    }

    #[test]
    fn test_host_header_after_blank_line_ignored() {
        let chunk = b"POST / HTTP/1.1\r\nContent-Length: 20\r\n\r\nHost: not.a.header\r\n";
        assert_eq!(sniff_hostname(chunk), None);
    }

    #[test]
    fn test_tls_sni() {
        let hello = client_hello(Some("test.local"));
        assert_eq!(sniff_hostname(&hello).as_deref(), Some("test.local"));
    }

    #[test]
    fn test_tls_without_sni() {
        assert_eq!(tls_sni(&client_hello(None)), None);
    }

    #[test]
    fn test_truncated_client_hello() {
        let hello = client_hello(Some("test.local"));
        for len in 0..hello.len() {
            assert_eq!(tls_sni(&hello[..len]), None, "prefix of {} bytes", len);
        }
    }

    #[test]
    fn test_overrunning_extension_length() {
        let mut hello = client_hello(Some("test.local"));
        // Corrupt the server_name list length
        let idx = hello.len() - 8 - "test.local".len() - 5;
        hello[idx] = 0xFF;
        assert_eq!(tls_sni(&hello), None);
    }

    #[test]
    fn test_random_bytes() {
        let chunk = [0x8a, 0x01, 0xff, 0x3c, 0x00, 0x7e, 0x16, 0x22, 0x90, 0x41];
        assert_eq!(sniff_hostname(&chunk), None);
        assert_eq!(sniff_hostname(&[]), None);
    }
}
