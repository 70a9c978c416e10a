//! Decoding of process output produced in the legacy Chinese Windows code page.

/// Decode GB18030 bytes; malformed sequences become U+FFFD.
pub fn gb18030_to_string(bytes: &[u8]) -> String {
    let (text, _, _) = encoding_rs::GB18030.decode(bytes);
    text.into_owned()
}

/// Decode output bytes either as GB18030 (`convert`) or lossy UTF-8.
pub fn decode_output(bytes: &[u8], convert: bool) -> String {
    if convert {
        gb18030_to_string(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
