//! Question-name extraction from raw DNS query payloads.
//!
//! Only the direct label grammar is accepted: length bytes 1-63 followed
//! by that many bytes, terminated by a zero byte. Compression pointers and
//! extended label types never appear in a query's question and end parsing.

/// Fixed DNS header size
pub const DNS_HEADER_SIZE: usize = 12;

/// Longest label allowed by RFC 1035
pub const MAX_LABEL_LEN: usize = 63;

/// Longest dotted name we will assemble
pub const MAX_NAME_LEN: usize = 253;

/// Extract the first question name from a DNS query payload.
///
/// Returns `None` for anything structurally wrong: a short header, a label
/// running past the buffer, a compression pointer, a non-UTF-8 or
/// dot-containing label, an over-long name or the root name.
pub fn extract_query_name(packet: &[u8]) -> Option<String> {
    if packet.len() <= DNS_HEADER_SIZE {
        return None;
    }

    let mut pos = DNS_HEADER_SIZE;
    let mut name = String::new();

    loop {
        let label_len = *packet.get(pos)? as usize;
        pos += 1;

        if label_len == 0 {
            break;
        }
        if label_len > MAX_LABEL_LEN {
            return None;
        }

        let label = packet.get(pos..pos + label_len)?;
        if label.contains(&b'.') {
            return None;
        }
        let label = std::str::from_utf8(label).ok()?;

        let extra = if name.is_empty() { label_len } else { label_len + 1 };
        if name.len() + extra > MAX_NAME_LEN {
            return None;
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(label);
        pos += label_len;
    }

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Standard recursive A query for `name`
    pub(crate) fn query_packet(name: &str) -> Vec<u8> {
        let mut packet = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        packet
    }

    #[test]
    fn test_well_formed_query() {
        assert_eq!(
            extract_query_name(&query_packet("a.example.com")).as_deref(),
            Some("a.example.com")
        );
    }

    #[test]
    fn test_case_is_preserved() {
        assert_eq!(
            extract_query_name(&query_packet("WWW.Example.com")).as_deref(),
            Some("WWW.Example.com")
        );
    }

    #[test]
    fn test_short_packets() {
        for len in 0..=DNS_HEADER_SIZE {
            assert_eq!(extract_query_name(&vec![0u8; len]), None);
        }
        let mut root_only = vec![0u8; DNS_HEADER_SIZE];
        root_only.push(0);
        assert_eq!(extract_query_name(&root_only), None);
    }

    #[test]
    fn test_label_past_buffer_end() {
        let mut packet = vec![0u8; DNS_HEADER_SIZE];
        packet.extend_from_slice(&[7, b'e', b'x', b'a']);
        assert_eq!(extract_query_name(&packet), None);
    }

    #[test]
    fn test_missing_terminator() {
        let mut packet = query_packet("example.com");
        packet.truncate(DNS_HEADER_SIZE + 1 + 7 + 1 + 3);
        assert_eq!(extract_query_name(&packet), None);
    }

    #[test]
    fn test_compression_pointer_rejected() {
        let mut packet = vec![0u8; DNS_HEADER_SIZE];
        packet.extend_from_slice(&[3, b'w', b'w', b'w', 0xC0, 0x0C]);
        assert_eq!(extract_query_name(&packet), None);

        let mut packet = vec![0u8; DNS_HEADER_SIZE];
        packet.extend_from_slice(&[64]);
        packet.extend_from_slice(&[b'a'; 64]);
        packet.push(0);
        assert_eq!(extract_query_name(&packet), None);
    }

    #[test]
    fn test_max_label_accepted() {
        let label = "a".repeat(MAX_LABEL_LEN);
        let name = format!("{}.com", label);
        assert_eq!(extract_query_name(&query_packet(&name)), Some(name));
    }

    #[test]
    fn test_overlong_name_rejected() {
        let label = "b".repeat(60);
        let name = vec![label.as_str(); 5].join(".");
        assert!(name.len() > MAX_NAME_LEN);
        assert_eq!(extract_query_name(&query_packet(&name)), None);
    }

    #[test]
    fn test_embedded_dot_and_invalid_utf8_rejected() {
        let mut packet = vec![0u8; DNS_HEADER_SIZE];
        packet.extend_from_slice(&[3, b'a', b'.', b'b', 0]);
        assert_eq!(extract_query_name(&packet), None);

        let mut packet = vec![0u8; DNS_HEADER_SIZE];
        packet.extend_from_slice(&[2, 0xFF, 0xFE, 0]);
        assert_eq!(extract_query_name(&packet), None);
    }
}
