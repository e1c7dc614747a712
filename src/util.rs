use std::ascii;

/// Escapes arbitrary bytes into a printable string for log lines.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_bytes() {
        assert_eq!(bytes_to_human_str(b"put 1\r\n"), "put 1\\r\\n");
        assert_eq!(bytes_to_human_str(b"plain"), "plain");
    }
}
