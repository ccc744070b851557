use anyhow::{Context, Result};

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
pub fn from_hex_vec(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).with_context(|| format!("\"{}\" is not valid hex", s))
}
pub fn from_hex<const N: usize>(s: &str) -> Result<[u8; N]> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let mut bytes = [0u8; N];
    hex::decode_to_slice(s, &mut bytes)
        .with_context(|| format!("\"{}\" is not {} bytes of hex", s, N))?;
    Ok(bytes)
}
