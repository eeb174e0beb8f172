// CGI response parsing (responder STDOUT)

use bytes::Bytes;

/// Status assumed when the script sends no `Status:` header
pub const DEFAULT_STATUS: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiResponse {
    /// 0 when the `Status:` header could not be parsed
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stderr: Bytes,
}

impl CgiResponse {
    /// Split STDOUT into header block and body
    ///
    /// # Errors
    /// A description of the problem when there is no header block or a header
    /// line has no `:`.
    pub fn parse(stdout: &[u8]) -> Result<Self, String> {
        let (head, body) = split_head(stdout)
            .ok_or_else(|| "response has no header block".to_string())?;
        let head = String::from_utf8_lossy(head);

        let mut headers = Vec::new();
        for line in head.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| format!("malformed header line '{}'", line))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let status = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("status"))
            .map_or(DEFAULT_STATUS, |(_, value)| parse_status(value));

        Ok(Self {
            status,
            headers,
            body: Bytes::copy_from_slice(body),
            stderr: Bytes::new(),
        })
    }

    /// First header named `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }
}

fn split_head(stdout: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(stdout, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find(stdout, b"\n\n").map(|pos| (pos, 2));
    let (pos, sep) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (a, b) => a.or(b)?,
    };
    Some((&stdout[..pos], &stdout[pos + sep..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// "404 Not Found" → 404
fn parse_status(value: &str) -> u16 {
    value
        .split_whitespace()
        .next()
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_header() {
        let resp =
            CgiResponse::parse(b"Status: 404 Not Found\r\nContent-Type: text/html\r\n\r\nmissing")
                .unwrap();

        assert_eq!(resp.status, 404);
        assert_eq!(resp.content_type(), Some("text/html"));
        assert_eq!(&resp.body[..], b"missing");
    }

    #[test]
    fn test_missing_status_means_ok() {
        let resp = CgiResponse::parse(b"Content-type: application/json\n\n{}").unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type(), Some("application/json"));
    }

    #[test]
    fn test_unparsable_status_is_zero() {
        let resp = CgiResponse::parse(b"Status: teapot\r\n\r\n").unwrap();
        assert_eq!(resp.status, 0);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_malformed_output_is_rejected() {
        assert!(CgiResponse::parse(b"").is_err());
        assert!(CgiResponse::parse(b"no header terminator").is_err());
        assert!(CgiResponse::parse(b"not a header\r\n\r\nbody").is_err());
    }
}
