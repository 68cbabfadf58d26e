const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

pub fn compress_snapshot(input: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::encode_all(input, 0)
}

pub fn decompress_snapshot(input: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::decode_all(input)
}

pub fn is_compressed(input: &[u8]) -> bool {
    input.starts_with(&ZSTD_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_output_is_detected_and_restored() {
        let json = br#"{"revision":"abc","files":[],"definitions":[]}"#;
        let packed = compress_snapshot(json).expect("compress");
        assert!(is_compressed(&packed));
        assert!(!is_compressed(json));
        assert_eq!(decompress_snapshot(&packed).expect("decompress"), json);
    }
}
