//! HTTP parsing utilities

/// Find the end of HTTP headers (position after \r\n\r\n or \n\n)
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    // Look for \r\n\r\n
    for i in 0..data.len().saturating_sub(3) {
        if &data[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
    }
    // Look for \n\n (curl sometimes uses this)
    for i in 0..data.len().saturating_sub(1) {
        if &data[i..i + 2] == b"\n\n" {
            return Some(i + 2);
        }
    }
    None
}

/// Parse Content-Length header from HTTP headers string
pub fn parse_content_length(headers: &str) -> usize {
    header_value(headers, "Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0) // no Content-Length header means no body
}

/// Case-insensitive lookup of a header value
pub fn header_value(headers: &str, name: &str) -> Option<String> {
    let wanted = name.to_ascii_lowercase();
    for line in headers.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().to_ascii_lowercase() == wanted {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Boundary parameter of a multipart content type, if present
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    for part in content_type.split(';').skip(1) {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("boundary=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

/// Extract the text content of a named multipart/form-data field
pub fn extract_form_field(body: &str, boundary: &str, name: &str) -> Option<String> {
    let delimiter = format!("--{}", boundary);
    let wanted = format!("name=\"{}\"", name);

    for part in body.split(delimiter.as_str()).skip(1) {
        let part = part.trim_start_matches("\r\n").trim_start_matches('\n');
        if part == "--" || part.starts_with("--") {
            break; // closing delimiter
        }

        let (head, content) = match find_header_end(part.as_bytes()) {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => continue,
        };
        if !head.contains(&wanted) {
            continue;
        }

        // strip the trailing CRLF that precedes the next delimiter
        let content = content
            .strip_suffix("\r\n")
            .or_else(|| content.strip_suffix('\n'))
            .unwrap_or(content);
        return Some(content.to_string());
    }
    None
}

pub fn http_response(status: u16, body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Unknown",
    };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        body
    )
}
