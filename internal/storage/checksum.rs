use crc32c::crc32c_append;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_CHUNK_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgo {
    Crc32c,
    Sha256,
}

impl ChecksumAlgo {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "crc32c" => Some(Self::Crc32c),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crc32c => "crc32c",
            Self::Sha256 => "sha256",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algo: ChecksumAlgo,
    pub value: Vec<u8>,
}

enum Hasher {
    Crc32c(u32),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algo: ChecksumAlgo) -> Self {
        match algo {
            ChecksumAlgo::Crc32c => Self::Crc32c(0),
            ChecksumAlgo::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Crc32c(state) => *state = crc32c_append(*state, data),
            Self::Sha256(hasher) => hasher.update(data),
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            Self::Crc32c(state) => state.to_be_bytes().to_vec(),
            Self::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }
}

impl Checksum {
    pub fn compute(algo: ChecksumAlgo, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algo);
        hasher.update(data);
        Self {
            algo,
            value: hasher.finish(),
        }
    }

    pub fn compute_reader<R: Read>(algo: ChecksumAlgo, mut reader: R) -> io::Result<Self> {
        let mut hasher = Hasher::new(algo);
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self {
            algo,
            value: hasher.finish(),
        })
    }

    pub fn compute_file(algo: ChecksumAlgo, path: &Path) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|err| format!("checksum open {} failed: {err}", path.display()))?;
        Self::compute_reader(algo, file)
            .map_err(|err| format!("checksum read {} failed: {err}", path.display()))
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(self.algo, data).value == self.value
    }

    pub fn verify_file(&self, path: &Path) -> Result<bool, String> {
        Ok(Self::compute_file(self.algo, path)?.value == self.value)
    }

    pub fn to_tagged(&self) -> String {
        format!("{}:{}", self.algo.as_str(), hex::encode(&self.value))
    }
}

pub fn parse_checksum(tagged: &str) -> Result<Checksum, String> {
    let (algo, value_hex) = tagged
        .split_once(':')
        .ok_or_else(|| "checksum must be <algo>:<hex>".to_string())?;
    let algo = ChecksumAlgo::parse(algo).ok_or_else(|| "invalid checksum algo".to_string())?;
    let value = hex::decode(value_hex).map_err(|_| "invalid checksum value")?;
    Ok(Checksum { algo, value })
}

#[cfg(test)]
mod tests {
    use super::{parse_checksum, Checksum, ChecksumAlgo};
    use std::io::Write;

    #[test]
    fn checksum_verify_crc32c() {
        let data = b"hello world";
        let checksum = Checksum::compute(ChecksumAlgo::Crc32c, data);
        assert_eq!(checksum.value.len(), 4);
        assert!(checksum.verify(data));
        assert!(!checksum.verify(b"hello world!"));
    }

    #[test]
    fn checksum_verify_sha256() {
        let data = b"hello world";
        let checksum = Checksum::compute(ChecksumAlgo::Sha256, data);
        assert_eq!(checksum.value.len(), 32);
        assert!(checksum.verify(data));
        assert!(!checksum.verify(b"hello world!"));
    }

    #[test]
    fn streaming_file_checksum_matches_in_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob.bin");
        let payload: Vec<u8> = (0..600_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path)
            .expect("create")
            .write_all(&payload)
            .expect("write");
        for algo in [ChecksumAlgo::Crc32c, ChecksumAlgo::Sha256] {
            let streamed = Checksum::compute_file(algo, &path).expect("file checksum");
            assert_eq!(streamed, Checksum::compute(algo, &payload));
            assert!(streamed.verify_file(&path).expect("verify"));
        }
    }

    #[test]
    fn tagged_form_parses_back() {
        let checksum = Checksum::compute(ChecksumAlgo::Sha256, b"artifact");
        let tagged = checksum.to_tagged();
        assert!(tagged.starts_with("sha256:"));
        assert_eq!(parse_checksum(&tagged).expect("parse"), checksum);
    }

    #[test]
    fn parse_checksum_rejects_invalid_inputs() {
        assert_eq!(
            parse_checksum("no-colon").unwrap_err(),
            "checksum must be <algo>:<hex>"
        );
        assert_eq!(parse_checksum("md5:00").unwrap_err(), "invalid checksum algo");
        assert_eq!(
            parse_checksum("sha256:zz").unwrap_err(),
            "invalid checksum value"
        );
    }
}
