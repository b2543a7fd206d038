use crate::error::{HarnessError, Result};

/// Decodes hex tokens such as `48 8b 03`, `0x48`, `488b03` or `48,8b,03`
/// into block bytes.
pub fn parse_hex_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for token in tokens {
        for part in token
            .as_ref()
            .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
            .filter(|p| !p.is_empty())
        {
            parse_hex_run(part, &mut bytes)?;
        }
    }
    if bytes.is_empty() {
        return Err(HarnessError::InvalidInput("no block bytes given".to_string()));
    }
    Ok(bytes)
}

fn parse_hex_run(part: &str, out: &mut Vec<u8>) -> Result<()> {
    let digits = part
        .strip_prefix("0x")
        .or_else(|| part.strip_prefix("0X"))
        .unwrap_or(part)
        .as_bytes();

    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(HarnessError::InvalidInput(format!(
            "'{}' is not a whole number of hex bytes",
            part
        )));
    }
    // from_str_radix would also take a leading sign
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(HarnessError::InvalidInput(format!("'{}' is not valid hex", part)));
    }
    out.extend(digits.chunks_exact(2).map(|pair| (nibble(pair[0]) << 4) | nibble(pair[1])));
    Ok(())
}

fn nibble(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_separate_bytes() {
        assert_eq!(parse_hex_tokens(&["48", "8b", "03"]).unwrap(), vec![0x48, 0x8b, 0x03]);
    }

    #[test]
    fn test_parse_runs_and_prefixes() {
        assert_eq!(parse_hex_tokens(&["0x488B03"]).unwrap(), vec![0x48, 0x8b, 0x03]);
        assert_eq!(
            parse_hex_tokens(&["48,8b 03", "0X90"]).unwrap(),
            vec![0x48, 0x8b, 0x03, 0x90]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_hex_tokens::<&str>(&[]).is_err());
        assert!(parse_hex_tokens(&["   "]).is_err());
        assert!(parse_hex_tokens(&["488"]).is_err());
        assert!(parse_hex_tokens(&["zz"]).is_err());
        assert!(parse_hex_tokens(&["0x"]).is_err());
        // multi-byte char must not panic on slicing
        assert!(parse_hex_tokens(&["é9"]).is_err());
    }

    #[test]
    fn test_signed_pairs_rejected() {
        assert!(parse_hex_tokens(&["+f"]).is_err());
        assert!(parse_hex_tokens(&["48+f"]).is_err());
        assert!(parse_hex_tokens(&["0x-1"]).is_err());
    }
}
